/*
 * lib.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Teng -- a general-purpose templating engine.
//!
//! Teng compiles a template source of interleaved literal text and embedded
//! directives against a hierarchical data tree supplied by the caller, then
//! renders a text artifact. Templates may include other templates and
//! localized dictionaries, declare content-type-aware escaping scopes,
//! iterate over nested data fragments, define local variables and call a
//! library of built-in functions.
//!
//! The pipeline: a two-level lexer splits text from directives and
//! tokenizes directive bodies, the parser emits a linear bytecode program
//! (memoized in an LRU cache together with loaded dictionaries), and the
//! processor executes the bytecode over a fragment stack, writing through a
//! whitespace-policy formatter into the caller's writer.
//!
//! # Example
//!
//! ```ignore
//! use teng::{ErrorLog, Fragment, GenerateArgs, StringWriter, Teng, TengSettings};
//!
//! let engine = Teng::new("templates", &TengSettings::default())?;
//!
//! let mut data = Fragment::new();
//! data.add_variable("title", "hello");
//! let row = data.add_fragment("row");
//! row.add_variable("cnum", 1i64);
//!
//! let mut writer = StringWriter::new();
//! let mut log = ErrorLog::new();
//! let severity = engine.generate_page(
//!     &GenerateArgs::from_string("${title}: <?teng frag row?>${cnum}<?teng endfrag?>"),
//!     &data,
//!     &mut writer,
//!     &mut log,
//! )?;
//! assert_eq!(writer.as_str(), "hello: 1");
//! ```

pub mod cache;
pub mod config;
pub mod content_type;
pub mod data;
pub mod dictionary;
pub mod engine;
pub mod error;
pub mod formatter;
pub mod fragment_stack;
pub mod functions;
pub mod lex1;
pub mod lex2;
pub mod parser;
pub mod position;
pub mod processor;
pub mod program;
pub mod resolver;
pub mod value;
pub mod writer;

pub use config::Config;
pub use content_type::ContentType;
pub use data::{Fragment, FragmentList, FragmentValue};
pub use dictionary::Dictionary;
pub use engine::{GenerateArgs, Teng, TengSettings, TemplateSource};
pub use error::{ErrorLog, Severity, TengError};
pub use position::Position;
pub use value::Value;
pub use writer::{StreamWriter, StringWriter, Writer};
