// ABOUTME: Pre-flight structural validation for scripts
// ABOUTME: Cheap gate run before any sandbox or record is consumed; not an AST-level check

use std::fmt;

/// A structural problem found before execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub message: String,
    /// 1-based line where the problem was detected, when known
    pub line: Option<usize>,
}

impl fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

fn issue(message: impl Into<String>, line: Option<usize>) -> SyntaxIssue {
    SyntaxIssue {
        message: message.into(),
        line,
    }
}

/// Structural gate for script sources.
///
/// Rejects empty sources, NUL bytes, and unbalanced brackets or quotes.
/// Comments and string contents (including triple-quoted strings) are
/// skipped so brackets inside them do not count. Anything subtler is left
/// to the interpreter inside the sandbox.
pub fn validate_script(source: &str) -> Result<(), SyntaxIssue> {
    if source.trim().is_empty() {
        return Err(issue("script is empty", None));
    }
    if let Some(pos) = source.find('\0') {
        let line = source[..pos].lines().count().max(1);
        return Err(issue("script contains a NUL byte", Some(line)));
    }

    let chars: Vec<char> = source.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1usize;
    // (quote char, true when triple-quoted)
    let mut in_string: Option<(char, bool)> = None;
    let mut string_line = 0usize;
    let mut in_comment = false;
    let mut i = 0usize;

    while i < chars.len() {
        let ch = chars[i];
        if ch == '\n' {
            line += 1;
            in_comment = false;
            i += 1;
            continue;
        }
        if in_comment {
            i += 1;
            continue;
        }

        if let Some((quote, triple)) = in_string {
            if ch == '\\' {
                // Skip the escaped character
                if chars.get(i + 1) == Some(&'\n') {
                    line += 1;
                }
                i += 2;
                continue;
            }
            if ch == quote {
                if !triple {
                    in_string = None;
                    i += 1;
                    continue;
                }
                if chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote) {
                    in_string = None;
                    i += 3;
                    continue;
                }
            }
            i += 1;
            continue;
        }

        match ch {
            '#' => in_comment = true,
            '\'' | '"' => {
                string_line = line;
                if chars.get(i + 1) == Some(&ch) && chars.get(i + 2) == Some(&ch) {
                    in_string = Some((ch, true));
                    i += 3;
                    continue;
                }
                in_string = Some((ch, false));
            }
            '(' | '[' | '{' => stack.push((ch, line)),
            ')' | ']' | '}' => {
                let expected = match ch {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(issue(
                            format!("mismatched '{}': expected to close '{}' (opened on line {})", ch, open, open_line),
                            Some(line),
                        ));
                    }
                    None => {
                        return Err(issue(format!("unmatched '{}'", ch), Some(line)));
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    if let Some((quote, _)) = in_string {
        return Err(issue(
            format!("unterminated {} string", quote),
            Some(string_line),
        ));
    }
    if let Some((open, open_line)) = stack.pop() {
        return Err(issue(format!("unclosed '{}'", open), Some(open_line)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_well_formed_script() {
        let source = r#"
import json

with open("params.json") as f:
    params = json.load(f)

level = params.get("initial_level", 1.0)
print(f"level: {level}")
"#;
        assert!(validate_script(source).is_ok());
    }

    #[test]
    fn test_rejects_empty_script() {
        assert!(validate_script("").is_err());
        assert!(validate_script("   \n\t  ").is_err());
    }

    #[test]
    fn test_rejects_nul_byte() {
        let err = validate_script("print('hi')\0").unwrap_err();
        assert!(err.message.contains("NUL"));
    }

    #[test]
    fn test_rejects_unclosed_bracket() {
        let err = validate_script("values = [1, 2, 3\nprint(values)").unwrap_err();
        assert!(err.message.contains("unclosed"));
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn test_rejects_mismatched_bracket() {
        assert!(validate_script("print(]").is_err());
        assert!(validate_script("x = }").is_err());
    }

    #[test]
    fn test_rejects_unterminated_string() {
        let err = validate_script("msg = 'never closed\nprint(msg)").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_ignores_brackets_in_strings_and_comments() {
        assert!(validate_script("print('this ( is fine')").is_ok());
        assert!(validate_script("x = 1  # unbalanced ( in comment\nprint(x)").is_ok());
    }

    #[test]
    fn test_handles_escaped_quotes() {
        assert!(validate_script(r#"print("she said \"hi\"")"#).is_ok());
    }

    #[test]
    fn test_accepts_triple_quoted_strings() {
        // The other quote kind inside a triple-quoted string is plain text
        assert!(validate_script("x = '''don't'''\nprint(x)\n").is_ok());
        let source = "def f():\n    \"\"\"docstring with ( unbalanced and 'quotes'\"\"\"\n    return 1\n";
        assert!(validate_script(source).is_ok());
        // Spanning lines is what triple quotes are for
        assert!(validate_script("s = \"\"\"first\nsecond\n\"\"\"\nprint(s)\n").is_ok());
    }

    #[test]
    fn test_rejects_unterminated_triple_quoted_string() {
        let err = validate_script("s = '''still open\nprint(s)\n").unwrap_err();
        assert!(err.message.contains("unterminated"));
        assert_eq!(err.line, Some(1));
    }
}
