/*
 * resolver.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Source resolution.
//!
//! Templates, includes and dictionaries are loaded through a
//! [`SourceResolver`], so the compilation pipeline never touches the
//! filesystem directly. The engine uses the filesystem resolver rooted at
//! its template directory; tests use the in-memory one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A loaded source file.
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub content: String,
    /// The path the content was actually read from; used for dependency
    /// tracking and cycle detection.
    pub absolute: PathBuf,
    pub mtime: Option<SystemTime>,
}

/// Loader for template and dictionary sources.
pub trait SourceResolver: Send + Sync {
    fn load(&self, path: &Path) -> Option<LoadedSource>;
}

/// Resolver reading from the filesystem, relative paths resolved against a
/// root directory.
#[derive(Debug, Clone)]
pub struct FileSystemResolver {
    root: PathBuf,
}

impl FileSystemResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileSystemResolver { root: root.into() }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl SourceResolver for FileSystemResolver {
    fn load(&self, path: &Path) -> Option<LoadedSource> {
        let absolute = self.resolve(path);
        let content = std::fs::read_to_string(&absolute).ok()?;
        let mtime = std::fs::metadata(&absolute)
            .and_then(|meta| meta.modified())
            .ok();
        Some(LoadedSource {
            content,
            absolute,
            mtime,
        })
    }
}

/// Resolver serving sources from an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    files: HashMap<PathBuf, String>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        MemoryResolver::default()
    }

    pub fn add(&mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> &mut Self {
        self.files.insert(path.into(), content.into());
        self
    }
}

impl SourceResolver for MemoryResolver {
    fn load(&self, path: &Path) -> Option<LoadedSource> {
        self.files.get(path).map(|content| LoadedSource {
            content: content.clone(),
            absolute: path.to_path_buf(),
            mtime: None,
        })
    }
}

/// Resolver that never finds anything.
#[derive(Debug, Clone, Default)]
pub struct NullResolver;

impl SourceResolver for NullResolver {
    fn load(&self, _path: &Path) -> Option<LoadedSource> {
        None
    }
}
