/*
 * dictionary.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Dictionaries: key-to-string maps loaded from line-oriented files.
//!
//! Format: `key value...` per line; continuation lines are indented;
//! comments start with `#`; `#include path` splices another file; lines
//! starting with `%` are processing directives consumed by the
//! configuration layer. Values may reference previously defined keys via
//! `#{key}` -- undefined references log a warning and stay literal. Later
//! definitions override earlier ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ErrorLog;
use crate::position::Position;
use crate::program::Dependency;
use crate::resolver::SourceResolver;

/// A `%`-prefixed processing directive, e.g. `%enable short-tag`.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub name: String,
    pub value: String,
    pub pos: Position,
}

/// A loaded dictionary with its compile-time diagnostics and file
/// dependencies.
#[derive(Debug, Default)]
pub struct Dictionary {
    entries: HashMap<String, String>,
    directives: Vec<Directive>,
    pub diagnostics: ErrorLog,
    pub deps: Vec<Dependency>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary::default()
    }

    /// Load a dictionary file, following `#include` directives.
    pub fn load(
        resolver: &dyn SourceResolver,
        path: &Path,
        max_include_depth: usize,
    ) -> Dictionary {
        let mut dict = Dictionary::new();
        let mut stack = Vec::new();
        dict.load_file(resolver, path, 0, max_include_depth, &mut stack);
        dict
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry directly; used by callers assembling dictionaries
    /// programmatically.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    fn load_file(
        &mut self,
        resolver: &dyn SourceResolver,
        path: &Path,
        depth: usize,
        max_depth: usize,
        stack: &mut Vec<PathBuf>,
    ) {
        let Some(source) = resolver.load(path) else {
            self.deps.push(Dependency {
                path: path.to_path_buf(),
                mtime: None,
            });
            self.diagnostics.error(
                Position::none(),
                format!("Cannot open dictionary file '{}'", path.display()),
            );
            return;
        };
        if stack.contains(&source.absolute) {
            self.diagnostics.error(
                Position::none(),
                format!("Cyclic dictionary include of '{}'", path.display()),
            );
            return;
        }
        self.deps.push(Dependency {
            path: source.absolute.clone(),
            mtime: source.mtime,
        });

        stack.push(source.absolute.clone());
        let dir = source
            .absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let filename: Arc<str> = Arc::from(source.absolute.to_string_lossy().as_ref());
        self.parse(&source.content, filename, &dir, resolver, depth, max_depth, stack);
        stack.pop();
    }

    #[allow(clippy::too_many_arguments)]
    fn parse(
        &mut self,
        content: &str,
        filename: Arc<str>,
        dir: &Path,
        resolver: &dyn SourceResolver,
        depth: usize,
        max_depth: usize,
        stack: &mut Vec<PathBuf>,
    ) {
        let mut last_key: Option<String> = None;
        for (lineno, line) in content.lines().enumerate() {
            let pos = Position {
                filename: Some(Arc::clone(&filename)),
                line: (lineno + 1) as u32,
                column: 0,
            };
            if line.trim().is_empty() {
                continue;
            }

            // indented lines continue the previous value
            if line.starts_with(|c: char| c.is_ascii_whitespace()) {
                let continuation = self.expand_refs(line.trim(), &pos);
                match &last_key {
                    Some(key) => {
                        if let Some(value) = self.entries.get_mut(key) {
                            value.push(' ');
                            value.push_str(&continuation);
                        }
                    }
                    None => {
                        self.diagnostics
                            .warning(pos, "Continuation line without a preceding key");
                    }
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("#include") {
                if rest.starts_with(|c: char| c.is_ascii_whitespace()) {
                    let target = rest.trim();
                    if target.is_empty() {
                        self.diagnostics.error(pos, "Missing path in #include");
                    } else if depth + 1 > max_depth {
                        self.diagnostics.error(
                            pos,
                            format!("Include depth exceeded at '{}'", target),
                        );
                    } else {
                        let target_path = Path::new(target);
                        let resolved = if target_path.is_absolute() {
                            target_path.to_path_buf()
                        } else {
                            dir.join(target_path)
                        };
                        self.load_file(resolver, &resolved, depth + 1, max_depth, stack);
                    }
                    last_key = None;
                    continue;
                }
            }

            if line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('%') {
                let mut words = rest.splitn(2, char::is_whitespace);
                let name = words.next().unwrap_or("").to_string();
                let value = words.next().unwrap_or("").trim().to_string();
                self.directives.push(Directive { name, value, pos });
                last_key = None;
                continue;
            }

            let (key, raw_value) = match line.find(|c: char| c.is_ascii_whitespace()) {
                Some(split) => (&line[..split], line[split..].trim()),
                None => (line, ""),
            };
            let value = self.expand_refs(raw_value, &pos);
            self.entries.insert(key.to_string(), value);
            last_key = Some(key.to_string());
        }
    }

    /// Expand `#{key}` references against previously defined entries.
    fn expand_refs(&mut self, raw: &str, pos: &Position) -> String {
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find("#{") {
            out.push_str(&rest[..start]);
            match rest[start..].find('}') {
                Some(end) => {
                    let key = &rest[start + 2..start + end];
                    match self.entries.get(key) {
                        Some(value) => out.push_str(value),
                        None => {
                            self.diagnostics.warning(
                                pos.clone(),
                                format!("Undefined dictionary key '{}' in value", key),
                            );
                            out.push_str(&rest[start..start + end + 1]);
                        }
                    }
                    rest = &rest[start + end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}
