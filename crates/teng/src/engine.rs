/*
 * engine.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The engine facade: composes lexer, parser, caches, processor and
//! formatter for one render.
//!
//! One engine instance may serve concurrent renders from multiple threads;
//! the caches are the only shared mutable state. Per-render state lives on
//! the stack of `generate_page`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::SharedCache;
use crate::config::Config;
use crate::content_type::ContentType;
use crate::data::Fragment;
use crate::dictionary::Dictionary;
use crate::error::{ErrorLog, Severity, TengError};
use crate::formatter::{Formatter, FormatterMode};
use crate::position::Position;
use crate::processor::Processor;
use crate::program::{Dependency, Program};
use crate::parser::{compile_file, compile_string, CompileParams};
use crate::resolver::FileSystemResolver;
use crate::writer::Writer;

/// Cache sizes for a new engine.
#[derive(Debug, Clone)]
pub struct TengSettings {
    pub program_cache_size: usize,
    pub dict_cache_size: usize,
}

impl Default for TengSettings {
    fn default() -> Self {
        TengSettings {
            program_cache_size: 50,
            dict_cache_size: 50,
        }
    }
}

/// Template source of one render.
#[derive(Debug, Clone, Copy)]
pub enum TemplateSource<'a> {
    /// Path relative to the engine root; the skin is woven into the name.
    File(&'a str),
    /// Literal template text.
    String(&'a str),
}

/// Arguments of `generate_page`.
#[derive(Debug, Clone)]
pub struct GenerateArgs<'a> {
    pub template: TemplateSource<'a>,
    /// Skin inserted before the template filename extension.
    pub skin: &'a str,
    /// Language dictionary path, relative to the engine root.
    pub dict: &'a str,
    /// Language inserted before the dictionary filename extension.
    pub lang: &'a str,
    /// Param (configuration) dictionary path.
    pub param: &'a str,
    /// Content type of the generated output.
    pub content_type: &'a str,
    /// Output encoding; `utf-8` switches on character-aware processing.
    pub encoding: &'a str,
}

impl<'a> GenerateArgs<'a> {
    pub fn from_file(template: &'a str) -> Self {
        GenerateArgs {
            template: TemplateSource::File(template),
            skin: "",
            dict: "",
            lang: "",
            param: "",
            content_type: "",
            encoding: "",
        }
    }

    pub fn from_string(template: &'a str) -> Self {
        GenerateArgs {
            template: TemplateSource::String(template),
            ..GenerateArgs::from_file("")
        }
    }
}

/// The templating engine.
pub struct Teng {
    resolver: FileSystemResolver,
    programs: SharedCache<Program>,
    dicts: SharedCache<Dictionary>,
}

impl Teng {
    /// Create an engine rooted at `root`; relative roots are anchored at
    /// the current working directory.
    pub fn new(root: impl Into<PathBuf>, settings: &TengSettings) -> Result<Teng, TengError> {
        let root = root.into();
        let root = if root.is_absolute() {
            root
        } else {
            let cwd = std::env::current_dir().map_err(|source| TengError::BadRoot {
                root: root.clone(),
                source,
            })?;
            cwd.join(root)
        };
        Ok(Teng {
            resolver: FileSystemResolver::new(root),
            programs: SharedCache::new(settings.program_cache_size),
            dicts: SharedCache::new(settings.dict_cache_size),
        })
    }

    /// Render one template against `data` into `writer`, appending all
    /// diagnostics to `log`. Returns the maximum severity observed; only a
    /// writer failure aborts the render with an error.
    pub fn generate_page(
        &self,
        args: &GenerateArgs<'_>,
        data: &Fragment,
        writer: &mut dyn Writer,
        log: &mut ErrorLog,
    ) -> Result<Severity, TengError> {
        let content_type = match ContentType::find(args.content_type) {
            Some(found) => found,
            None => {
                log.warning(
                    Position::none(),
                    format!("Unknown content type '{}'", args.content_type),
                );
                ContentType::default_type()
            }
        };

        // configuration comes from the param dictionary
        let param = self.load_dictionary(args.param, Config::default().max_include_depth);
        let mut config = Config::from_dictionary(&param, log);
        config.utf8 = args.encoding.eq_ignore_ascii_case("utf-8");

        let dict_path = prepend_before_ext(args.dict, args.lang);
        let lang = self.load_dictionary(&dict_path, config.max_include_depth);

        let program = self.load_program(args, &config);

        log.append(&lang.diagnostics);
        log.append(&param.diagnostics);
        log.append(&program.diagnostics);

        if !program.is_empty() {
            let mut formatter = Formatter::new(writer, FormatterMode::PassWhite);
            let processor = Processor::new(
                &program,
                &lang,
                &config,
                content_type,
                data,
                &mut formatter,
                log,
            );
            processor.run()?;
            formatter.flush()?;
        }

        if config.log_to_output {
            log_errors(content_type, writer, log)?;
        }
        writer.flush()?;

        Ok(log.max_level())
    }

    /// Look up one key in a language dictionary.
    pub fn dictionary_lookup(
        &self,
        config: &str,
        dict: &str,
        lang: &str,
        key: &str,
    ) -> Option<String> {
        let param = self.load_dictionary(config, Config::default().max_include_depth);
        let mut scratch = ErrorLog::new();
        let parsed = Config::from_dictionary(&param, &mut scratch);
        let path = prepend_before_ext(dict, lang);
        let dictionary = self.load_dictionary(&path, parsed.max_include_depth);
        dictionary.lookup(key).map(str::to_string)
    }

    /// Enumerate the supported content types as (name, description).
    pub fn list_supported_content_types() -> Vec<(String, String)> {
        ContentType::list_supported()
    }

    fn load_dictionary(&self, path: &str, max_include_depth: usize) -> Arc<Dictionary> {
        if path.is_empty() {
            return Arc::new(Dictionary::new());
        }
        let key = format!("dict:{}", path);
        let resolver = &self.resolver;
        self.dicts.get_or_build(
            &key,
            |dict| deps_fresh(&dict.deps),
            || Dictionary::load(resolver, Path::new(path), max_include_depth),
        )
    }

    fn load_program(&self, args: &GenerateArgs<'_>, config: &Config) -> Arc<Program> {
        // lexing depends on these flags, so they are part of the key
        let flags = format!(
            "{}{}{}",
            config.short_tag as u8, config.print_escape as u8, config.utf8 as u8
        );
        let params = CompileParams {
            config,
            resolver: &self.resolver,
        };
        match args.template {
            TemplateSource::File(name) => {
                let path = prepend_before_ext(name, args.skin);
                let key = format!("file:{}|param:{}|{}", path, args.param, flags);
                self.programs.get_or_build(
                    &key,
                    |program| deps_fresh(&program.deps),
                    || compile_file(Path::new(&path), &params),
                )
            }
            TemplateSource::String(source) => {
                let key = format!(
                    "string:{:016x}|param:{}|{}",
                    fnv1a(source.as_bytes()),
                    args.param,
                    flags
                );
                self.programs.get_or_build(
                    &key,
                    |program| deps_fresh(&program.deps),
                    || compile_string(source, None, &params),
                )
            }
        }
    }
}

/// True when every recorded dependency still has the modification time
/// observed at build time.
fn deps_fresh(deps: &[Dependency]) -> bool {
    deps.iter().all(|dep| {
        let current = std::fs::metadata(&dep.path)
            .and_then(|meta| meta.modified())
            .ok();
        current == dep.mtime
    })
}

/// Insert `prep` before the filename extension: `page.html` + `mobile`
/// becomes `page.mobile.html`; names without an extension get a suffix.
fn prepend_before_ext(name: &str, prep: &str) -> String {
    if prep.is_empty() || name.is_empty() {
        return name.to_string();
    }
    let dot = name.rfind('.');
    let slash = name.rfind('/');
    match dot {
        Some(dot) if slash.map_or(true, |slash| slash < dot) => {
            format!("{}.{}{}", &name[..dot], prep, &name[dot..])
        }
        _ => format!("{}.{}", name, prep),
    }
}

/// Append the error log to the output, framed with the content type's
/// comment markers.
fn log_errors(
    content_type: &ContentType,
    writer: &mut dyn Writer,
    log: &ErrorLog,
) -> Result<(), TengError> {
    if log.is_empty() {
        return Ok(());
    }
    let use_line_comment = content_type.block_comment.is_none();
    if let Some((open, _)) = content_type.block_comment {
        writer.write_str(open)?;
        writer.write_str(" ")?;
    } else if let Some(line) = content_type.line_comment {
        writer.write_str(line)?;
        writer.write_str(" ")?;
    }
    writer.write_str("Error log:\n")?;
    for entry in log.entries() {
        if use_line_comment {
            if let Some(line) = content_type.line_comment {
                writer.write_str(line)?;
                writer.write_str(" ")?;
            }
        }
        writer.write_str(&entry.log_line())?;
    }
    if let Some((_, close)) = content_type.block_comment {
        writer.write_str(close)?;
        writer.write_str("\n")?;
    }
    Ok(())
}

/// FNV-1a, used to key string templates in the program cache.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepend_before_ext() {
        assert_eq!(prepend_before_ext("page.html", "mobile"), "page.mobile.html");
        assert_eq!(prepend_before_ext("page", "mobile"), "page.mobile");
        assert_eq!(prepend_before_ext("page.html", ""), "page.html");
        assert_eq!(prepend_before_ext("a.dir/page", "cz"), "a.dir/page.cz");
        assert_eq!(prepend_before_ext("dir/page.html", "cz"), "dir/page.cz.html");
    }

    #[test]
    fn test_fnv1a_differs() {
        assert_ne!(fnv1a(b"a"), fnv1a(b"b"));
        assert_eq!(fnv1a(b"abc"), fnv1a(b"abc"));
    }

    #[test]
    fn test_list_supported_content_types() {
        let listed = Teng::list_supported_content_types();
        assert!(listed.iter().any(|(name, _)| name == "text/html"));
    }
}
