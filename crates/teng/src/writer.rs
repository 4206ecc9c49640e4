/*
 * writer.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Output writers.
//!
//! The caller owns the writer for a render; the engine only requires it to
//! serve that single render. A failing write is the one condition that
//! terminates a render early.

use std::io;

use crate::error::TengError;

/// Destination of rendered output.
pub trait Writer {
    fn write_str(&mut self, s: &str) -> Result<(), TengError>;

    fn flush(&mut self) -> Result<(), TengError> {
        Ok(())
    }
}

/// Writer collecting output into an owned string.
#[derive(Debug, Default)]
pub struct StringWriter {
    buf: String,
}

impl StringWriter {
    pub fn new() -> Self {
        StringWriter::default()
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

impl Writer for StringWriter {
    fn write_str(&mut self, s: &str) -> Result<(), TengError> {
        self.buf.push_str(s);
        Ok(())
    }
}

/// Writer over any `io::Write` stream.
#[derive(Debug)]
pub struct StreamWriter<W: io::Write> {
    inner: W,
}

impl<W: io::Write> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        StreamWriter { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write> Writer for StreamWriter<W> {
    fn write_str(&mut self, s: &str) -> Result<(), TengError> {
        self.inner.write_all(s.as_bytes())?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TengError> {
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_writer_collects() {
        let mut writer = StringWriter::new();
        writer.write_str("a").unwrap();
        writer.write_str("b").unwrap();
        assert_eq!(writer.as_str(), "ab");
    }

    #[test]
    fn test_stream_writer_roundtrip() {
        let mut writer = StreamWriter::new(Vec::new());
        writer.write_str("hello").unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.into_inner(), b"hello");
    }
}
