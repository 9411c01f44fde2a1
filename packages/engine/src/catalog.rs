// ABOUTME: Script catalog seam - the single authoritative lookup for case scripts
// ABOUTME: Ships a static in-memory catalog for tests and embedded deployments

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use caselab_storage::CaseRef;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Script not found: {case}/{script_ref}")]
    NotFound { case: String, script_ref: String },

    #[error("Catalog backend error: {0}")]
    Backend(String),
}

/// Resolves a script reference within a case to its source text.
///
/// There is exactly one lookup path; callers never guess at filesystem
/// locations themselves.
#[async_trait]
pub trait ScriptCatalog: Send + Sync {
    async fn resolve(
        &self,
        case_ref: &CaseRef,
        script_ref: &str,
    ) -> Result<String, CatalogError>;
}

/// In-memory catalog keyed by (case, script_ref)
#[derive(Default)]
pub struct StaticCatalog {
    scripts: HashMap<(String, String), String>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(
        mut self,
        case_ref: &CaseRef,
        script_ref: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        self.scripts
            .insert((case_ref.to_string(), script_ref.into()), source.into());
        self
    }
}

#[async_trait]
impl ScriptCatalog for StaticCatalog {
    async fn resolve(
        &self,
        case_ref: &CaseRef,
        script_ref: &str,
    ) -> Result<String, CatalogError> {
        self.scripts
            .get(&(case_ref.to_string(), script_ref.to_string()))
            .cloned()
            .ok_or_else(|| CatalogError::NotFound {
                case: case_ref.to_string(),
                script_ref: script_ref.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_catalog_resolves_known_script() {
        let case_ref = CaseRef::new("hydraulics", "tanks", "water-tank");
        let catalog = StaticCatalog::new().with_script(&case_ref, "main", "print('tank')");

        let source = catalog.resolve(&case_ref, "main").await.unwrap();
        assert_eq!(source, "print('tank')");
    }

    #[tokio::test]
    async fn test_static_catalog_not_found() {
        let case_ref = CaseRef::new("hydraulics", "tanks", "water-tank");
        let catalog = StaticCatalog::new();

        let err = catalog.resolve(&case_ref, "main").await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { .. }));
    }
}
