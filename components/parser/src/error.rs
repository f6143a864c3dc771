//! Syntax-error reporting with caret-annotated source lines.

use core_types::SourcePosition;
use thiserror::Error;

/// A syntax error with its source position.
///
/// The bare `Display` form is `message`; [`ParseError::format`] produces
/// the full report with file, line, column and a caret under the
/// offending column.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ParseError {
    /// What went wrong.
    pub message: String,
    /// Where it went wrong.
    pub position: SourcePosition,
}

impl ParseError {
    /// Creates an error at a position.
    pub fn new(message: String, position: SourcePosition) -> ParseError {
        ParseError { message, position }
    }

    /// Formats the error with filename, position, the source line, and a
    /// caret marking the column.
    pub fn format(&self, filename: &str, src: &str) -> String {
        let mut out = format!(
            "{} at {}:{}:{}",
            self.message, filename, self.position.line, self.position.column
        );
        if let Some(line) = src.lines().nth(self.position.line.saturating_sub(1) as usize) {
            out.push('\n');
            out.push_str(line);
            out.push('\n');
            for _ in 1..self.position.column {
                out.push(' ');
            }
            out.push('^');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_with_caret() {
        let e = ParseError::new(
            "unexpected token".to_string(),
            SourcePosition {
                line: 2,
                column: 5,
                offset: 14,
            },
        );
        let report = e.format("test.js", "var a = 1;\nvar b = [;\n");
        assert_eq!(
            report,
            "unexpected token at test.js:2:5\nvar b = [;\n    ^"
        );
    }
}
