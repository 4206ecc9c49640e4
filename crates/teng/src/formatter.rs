/*
 * formatter.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The formatter: a writer adapter that applies whitespace policies.
//!
//! The formatter owns a stack of whitespace modes; non-whitespace characters
//! pass through verbatim, each maximal run of whitespace is rewritten under
//! the mode on top of the stack. A run may span multiple `write` calls, so
//! pending whitespace is buffered and drained by the next non-whitespace
//! character, a mode change, or `flush`.

use crate::error::TengError;
use crate::writer::Writer;

/// Whitespace policy for one format scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatterMode {
    /// Unknown mode; behaves as `PassWhite` without further diagnostics.
    Invalid,
    /// Emit runs unchanged.
    PassWhite,
    /// Drop runs entirely.
    NoWhite,
    /// Replace each run with a single space.
    OneSpace,
    /// Runs containing a newline collapse to one newline.
    StripLines,
    /// Runs containing a newline keep only the part before the newline.
    JoinLines,
    /// Runs with two or more newlines keep only the leading part up to the
    /// first newline and the trailing part after the last one.
    NoWhiteLines,
}

/// Resolve a mode name from a `format` directive. Unknown names map to
/// `Invalid`.
pub fn resolve_mode(name: &str) -> FormatterMode {
    match name {
        "nowhite" | "nospace" => FormatterMode::NoWhite,
        "onespace" => FormatterMode::OneSpace,
        "striplines" => FormatterMode::StripLines,
        "joinlines" => FormatterMode::JoinLines,
        "nowhitelines" => FormatterMode::NoWhiteLines,
        "noformat" => FormatterMode::PassWhite,
        _ => FormatterMode::Invalid,
    }
}

/// Writer adapter applying the whitespace mode stack.
pub struct Formatter<'w> {
    writer: &'w mut dyn Writer,
    modes: Vec<FormatterMode>,
    buffer: String,
}

impl<'w> Formatter<'w> {
    pub fn new(writer: &'w mut dyn Writer, initial: FormatterMode) -> Self {
        Formatter {
            writer,
            modes: vec![initial],
            buffer: String::new(),
        }
    }

    fn top(&self) -> FormatterMode {
        *self.modes.last().unwrap_or(&FormatterMode::PassWhite)
    }

    /// Process one buffered whitespace run under the current mode.
    fn drain(&mut self) -> Result<(), TengError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let run = std::mem::take(&mut self.buffer);
        match self.top() {
            FormatterMode::PassWhite | FormatterMode::Invalid => self.writer.write_str(&run),
            FormatterMode::NoWhite => Ok(()),
            FormatterMode::OneSpace => self.writer.write_str(" "),
            FormatterMode::StripLines => match run.find('\n') {
                None => self.writer.write_str(&run),
                Some(_) => self.writer.write_str("\n"),
            },
            FormatterMode::JoinLines => match run.find('\n') {
                None => self.writer.write_str(&run),
                Some(nl) => self.writer.write_str(&run[..nl]),
            },
            FormatterMode::NoWhiteLines => {
                let first = run.find('\n');
                let last = run.rfind('\n');
                match (first, last) {
                    (Some(f), Some(l)) if f != l => {
                        self.writer.write_str(&run[..=f])?;
                        self.writer.write_str(&run[l + 1..])
                    }
                    _ => self.writer.write_str(&run),
                }
            }
        }
    }

    /// Write a chunk of output, buffering trailing whitespace.
    pub fn write(&mut self, s: &str) -> Result<(), TengError> {
        // whole chunks bypass the scanner while passing is active
        if self.top() == FormatterMode::PassWhite {
            return self.writer.write_str(s);
        }

        let mut rest = s;
        while !rest.is_empty() {
            if let Some(start) = rest.find(|c: char| c.is_ascii_whitespace()) {
                if start > 0 {
                    self.drain()?;
                    self.writer.write_str(&rest[..start])?;
                }
                let end = rest[start..]
                    .find(|c: char| !c.is_ascii_whitespace())
                    .map(|n| start + n)
                    .unwrap_or(rest.len());
                if self.top() == FormatterMode::NoWhite {
                    self.buffer.clear();
                } else {
                    self.buffer.push_str(&rest[start..end]);
                }
                rest = &rest[end..];
            } else {
                self.drain()?;
                self.writer.write_str(rest)?;
                break;
            }
        }
        Ok(())
    }

    /// Drain pending whitespace and flush the underlying writer.
    pub fn flush(&mut self) -> Result<(), TengError> {
        self.drain()?;
        self.writer.flush()
    }

    /// Push a new mode; pending whitespace is drained under the old one.
    pub fn push(&mut self, mode: FormatterMode) -> Result<(), TengError> {
        self.drain()?;
        self.modes.push(mode);
        Ok(())
    }

    /// Pop the top mode; the stack never becomes empty. Popping the last
    /// element is a no-op returning `Invalid`.
    pub fn pop(&mut self) -> Result<FormatterMode, TengError> {
        if self.modes.len() <= 1 {
            return Ok(FormatterMode::Invalid);
        }
        self.drain()?;
        Ok(self.modes.pop().unwrap_or(FormatterMode::Invalid))
    }
}
