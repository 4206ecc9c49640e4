/*
 * position.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Source positions for diagnostics.
//!
//! Every token and every emitted instruction carries a [`Position`] so that
//! runtime diagnostics can point back into the template source. Filenames are
//! shared via `Arc` because positions are cloned onto each instruction.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A location in template source: filename plus 1-based line and 0-based
/// column. Templates compiled from strings have no filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub filename: Option<Arc<str>>,
    pub line: u32,
    pub column: u32,
}

impl Position {
    /// Create a position at the start of the given file.
    pub fn new(filename: Option<Arc<str>>) -> Self {
        Position {
            filename,
            line: 1,
            column: 0,
        }
    }

    /// Position at the start of an anonymous (string) source.
    pub fn anonymous() -> Self {
        Position::new(None)
    }

    /// A position with no location information at all (engine-level
    /// diagnostics that do not belong to any template line).
    pub fn none() -> Self {
        Position {
            filename: None,
            line: 0,
            column: 0,
        }
    }

    /// Advance over one character of input.
    pub fn advance(&mut self, ch: u8) {
        if ch == b'\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
    }

    /// Advance the column by `n` characters (no newlines among them).
    pub fn advance_column(&mut self, n: u32) {
        self.column += n;
    }

    /// True when this position carries any location information.
    pub fn is_known(&self) -> bool {
        self.line > 0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.filename.as_deref().unwrap_or("<string>");
        write!(f, "{}({},{})", name, self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_tracks_lines_and_columns() {
        let mut pos = Position::anonymous();
        for ch in b"ab\nc" {
            pos.advance(*ch);
        }
        assert_eq!(pos.line, 2);
        assert_eq!(pos.column, 1);
    }

    #[test]
    fn test_display() {
        let mut pos = Position::new(Some(Arc::from("page.html")));
        pos.advance_column(7);
        assert_eq!(pos.to_string(), "page.html(1,7)");
        assert_eq!(Position::anonymous().to_string(), "<string>(1,0)");
    }
}
