/*
 * config.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Engine configuration parsed from the param dictionary.
//!
//! `%enable feature` / `%disable feature` directives toggle boolean
//! features; numeric settings are plain dictionary entries.

use crate::dictionary::Dictionary;
use crate::error::ErrorLog;

/// Feature toggles and limits for one render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Recognize `<?...?>` short directives.
    pub short_tag: bool,
    /// Recognize `%{...}` raw-print expressions.
    pub print_escape: bool,
    /// Append the error log to the output as comments.
    pub log_to_output: bool,
    /// Expose the `_error` pseudo-fragment.
    pub error_fragment: bool,
    /// Count source columns in UTF-8 characters; set from the render's
    /// encoding, not from the param dictionary.
    pub utf8: bool,
    /// Honor `<?teng debug?>`.
    pub debug_enabled: bool,
    /// Honor `<?teng bytecode?>`.
    pub bytecode_enabled: bool,
    pub max_include_depth: usize,
    pub max_debug_val_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            short_tag: false,
            print_escape: false,
            log_to_output: false,
            error_fragment: false,
            utf8: false,
            debug_enabled: false,
            bytecode_enabled: false,
            max_include_depth: 10,
            max_debug_val_length: 40,
        }
    }
}

impl Config {
    /// Build a configuration from a param dictionary. Unknown directives
    /// and malformed settings are reported as warnings.
    pub fn from_dictionary(dict: &Dictionary, log: &mut ErrorLog) -> Config {
        let mut config = Config::default();
        for directive in dict.directives() {
            let enable = match directive.name.as_str() {
                "enable" => true,
                "disable" => false,
                other => {
                    log.warning(
                        directive.pos.clone(),
                        format!("Unknown processing directive '%{}'", other),
                    );
                    continue;
                }
            };
            match directive.value.as_str() {
                "short-tag" => config.short_tag = enable,
                "print-escape" => config.print_escape = enable,
                "log-to-output" => config.log_to_output = enable,
                "error-fragment" => config.error_fragment = enable,
                "utf-8" => config.utf8 = enable,
                "debug" => config.debug_enabled = enable,
                "bytecode" => config.bytecode_enabled = enable,
                other => {
                    log.warning(
                        directive.pos.clone(),
                        format!("Unknown feature '{}'", other),
                    );
                }
            }
        }
        config.max_include_depth =
            numeric_setting(dict, log, "max-include-depth", config.max_include_depth);
        config.max_debug_val_length =
            numeric_setting(dict, log, "max-debug-val-length", config.max_debug_val_length);
        config
    }
}

fn numeric_setting(
    dict: &Dictionary,
    log: &mut ErrorLog,
    key: &str,
    default: usize,
) -> usize {
    match dict.lookup(key) {
        None => default,
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                log.warning(
                    crate::position::Position::none(),
                    format!("Invalid value '{}' for setting '{}'", raw, key),
                );
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MemoryResolver;
    use std::path::Path;

    fn config_from(source: &str) -> (Config, ErrorLog) {
        let mut resolver = MemoryResolver::new();
        resolver.add("param.txt", source);
        let dict = Dictionary::load(&resolver, Path::new("param.txt"), 10);
        let mut log = ErrorLog::new();
        let config = Config::from_dictionary(&dict, &mut log);
        (config, log)
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.short_tag);
        assert!(!config.print_escape);
        assert_eq!(config.max_include_depth, 10);
    }

    #[test]
    fn test_enable_disable() {
        let (config, log) = config_from("%enable short-tag\n%enable utf-8\n%disable short-tag\n");
        assert!(!config.short_tag);
        assert!(config.utf8);
        assert!(log.is_empty());
    }

    #[test]
    fn test_unknown_feature_warns() {
        let (config, log) = config_from("%enable warp-drive\n%frobnicate x\n");
        assert_eq!(config, Config::default());
        assert_eq!(log.count(), 2);
    }

    #[test]
    fn test_numeric_settings() {
        let (config, log) = config_from("max-include-depth 3\nmax-debug-val-length oops\n");
        assert_eq!(config.max_include_depth, 3);
        assert_eq!(config.max_debug_val_length, 40);
        assert_eq!(log.count(), 1);
    }
}
