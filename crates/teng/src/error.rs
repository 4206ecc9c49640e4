/*
 * error.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Diagnostics and hard errors.
//!
//! Teng keeps two error channels. User-program problems -- lexical errors,
//! bad expressions, missing data -- are appended to an [`ErrorLog`] and never
//! abort a render; the processor substitutes `undefined` and continues. Hard
//! failures that must stop the render (writer I/O) are [`TengError`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::position::Position;

/// Severity of a log entry. The numeric value doubles as the render's
/// return code: 0 = ok, 4 = fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Debug = 0,
    Warning = 1,
    Diag = 2,
    Error = 3,
    Fatal = 4,
}

impl Severity {
    pub fn name(self) -> &'static str {
        match self {
            Severity::Debug => "Debug",
            Severity::Warning => "Warning",
            Severity::Diag => "Diag",
            Severity::Error => "Error",
            Severity::Fatal => "Fatal",
        }
    }

    pub fn as_code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One diagnostic entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub pos: Position,
    pub level: Severity,
    pub msg: String,
}

impl Entry {
    /// Render the entry as one log line, terminated by a newline.
    pub fn log_line(&self) -> String {
        if self.pos.is_known() {
            format!("{} {}: {}\n", self.pos, self.level, self.msg)
        } else {
            format!("{}: {}\n", self.level, self.msg)
        }
    }
}

/// Append-only diagnostic log with a running maximum severity.
///
/// Both compilation and execution emit into the same log; `generate_page`
/// returns the maximum severity observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorLog {
    entries: Vec<Entry>,
    max_level: Option<Severity>,
}

impl ErrorLog {
    pub fn new() -> Self {
        ErrorLog::default()
    }

    pub fn log(&mut self, level: Severity, pos: Position, msg: impl Into<String>) {
        self.max_level = Some(self.max_level.map_or(level, |m| m.max(level)));
        self.entries.push(Entry {
            pos,
            level,
            msg: msg.into(),
        });
    }

    pub fn debug(&mut self, pos: Position, msg: impl Into<String>) {
        self.log(Severity::Debug, pos, msg);
    }

    pub fn warning(&mut self, pos: Position, msg: impl Into<String>) {
        self.log(Severity::Warning, pos, msg);
    }

    pub fn diag(&mut self, pos: Position, msg: impl Into<String>) {
        self.log(Severity::Diag, pos, msg);
    }

    pub fn error(&mut self, pos: Position, msg: impl Into<String>) {
        self.log(Severity::Error, pos, msg);
    }

    pub fn fatal(&mut self, pos: Position, msg: impl Into<String>) {
        self.log(Severity::Fatal, pos, msg);
    }

    /// Replay all entries of another log into this one.
    pub fn append(&mut self, other: &ErrorLog) {
        for entry in &other.entries {
            self.log(entry.level, entry.pos.clone(), entry.msg.clone());
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum severity observed so far; `Debug` (= 0) for an empty log.
    pub fn max_level(&self) -> Severity {
        self.max_level.unwrap_or(Severity::Debug)
    }
}

/// Hard failures that abort the current render.
#[derive(Debug, Error)]
pub enum TengError {
    /// The caller-supplied writer failed; the render stops early.
    #[error("write error: {0}")]
    Write(#[from] std::io::Error),

    /// The template root directory could not be resolved.
    #[error("cannot resolve template root {root:?}: {source}")]
    BadRoot {
        root: std::path::PathBuf,
        source: std::io::Error,
    },
}
