/*
 * content_type.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Content types: named escaping and commenting policies.
//!
//! A content type describes how printed expressions are escaped within a
//! `ctype` scope and which comment markers frame error logs appended to the
//! output. The set of supported types is a built-in registry; the mechanism
//! is the interesting part, the set is data.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Descriptor of one content type.
#[derive(Debug)]
pub struct ContentType {
    pub name: &'static str,
    pub description: &'static str,
    /// Character to replacement table applied by `escape`.
    escapes: &'static [(char, &'static str)],
    /// The quoted-string type additionally wraps escaped output in double
    /// quotes.
    quote_wrap: bool,
    pub line_comment: Option<&'static str>,
    pub block_comment: Option<(&'static str, &'static str)>,
}

static CONTENT_TYPES: &[ContentType] = &[
    ContentType {
        name: "text/plain",
        description: "plain text without escaping",
        escapes: &[],
        quote_wrap: false,
        line_comment: None,
        block_comment: None,
    },
    ContentType {
        name: "text/html",
        description: "HTML/XHTML/XML markup",
        escapes: &[('&', "&amp;"), ('<', "&lt;"), ('>', "&gt;")],
        quote_wrap: false,
        line_comment: None,
        block_comment: Some(("<!--", "-->")),
    },
    ContentType {
        name: "quoted-string",
        description: "generic quoted string",
        escapes: &[
            ('\\', "\\\\"),
            ('"', "\\\""),
            ('\'', "\\'"),
            ('\n', "\\n"),
            ('\r', "\\r"),
            ('\t', "\\t"),
            ('<', "\\u003C"),
            ('>', "\\u003E"),
        ],
        quote_wrap: true,
        line_comment: None,
        block_comment: None,
    },
    ContentType {
        name: "application/x-sh",
        description: "shell script",
        escapes: &[],
        quote_wrap: false,
        line_comment: Some("#"),
        block_comment: None,
    },
];

static BY_NAME: Lazy<HashMap<&'static str, &'static ContentType>> = Lazy::new(|| {
    CONTENT_TYPES.iter().map(|ct| (ct.name, ct)).collect()
});

impl ContentType {
    /// Look up a content type by name; `None` for unknown names. The empty
    /// name resolves to the default type.
    pub fn find(name: &str) -> Option<&'static ContentType> {
        if name.is_empty() {
            return Some(ContentType::default_type());
        }
        BY_NAME.get(name).copied()
    }

    /// The default content type used when none is requested.
    pub fn default_type() -> &'static ContentType {
        &CONTENT_TYPES[0]
    }

    /// Enumerate supported content types as (name, description) pairs.
    pub fn list_supported() -> Vec<(String, String)> {
        CONTENT_TYPES
            .iter()
            .map(|ct| (ct.name.to_string(), ct.description.to_string()))
            .collect()
    }

    /// Escape a string for this content type.
    pub fn escape(&self, s: &str) -> String {
        let mut out = String::with_capacity(s.len() + 8);
        if self.quote_wrap {
            out.push('"');
        }
        for ch in s.chars() {
            match self.escapes.iter().find(|(from, _)| *from == ch) {
                Some((_, to)) => out.push_str(to),
                None => out.push(ch),
            }
        }
        if self.quote_wrap {
            out.push('"');
        }
        out
    }

    /// Invert `escape`: longest-match replacement of escape sequences back
    /// to their source characters, stripping the quote wrap when present.
    pub fn unescape(&self, s: &str) -> String {
        let mut s = s;
        if self.quote_wrap && s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
            s = &s[1..s.len() - 1];
        }
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        'outer: while !rest.is_empty() {
            for (from, to) in self.escapes {
                if rest.starts_with(to) {
                    out.push(*from);
                    rest = &rest[to.len()..];
                    continue 'outer;
                }
            }
            match rest.chars().next() {
                Some(ch) => {
                    out.push(ch);
                    rest = &rest[ch.len_utf8()..];
                }
                None => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_known_and_unknown() {
        assert_eq!(ContentType::find("text/html").map(|ct| ct.name), Some("text/html"));
        assert!(ContentType::find("text/nonsense").is_none());
        assert_eq!(ContentType::find("").map(|ct| ct.name), Some("text/plain"));
    }

    #[test]
    fn test_html_escape() {
        let html = ContentType::find("text/html").unwrap();
        assert_eq!(html.escape("a < b & c > d"), "a &lt; b &amp; c &gt; d");
        assert_eq!(html.unescape("a &lt; b &amp; c"), "a < b & c");
    }

    #[test]
    fn test_quoted_string_wraps_and_escapes() {
        let qs = ContentType::find("quoted-string").unwrap();
        assert_eq!(qs.escape("<b>fuj\"</b>"), "\"\\u003Cb\\u003Efuj\\\"\\u003C/b\\u003E\"");
        assert_eq!(qs.unescape("\"a\\\"b\\n\""), "a\"b\n");
    }

    #[test]
    fn test_escape_unescape_inverse() {
        let qs = ContentType::find("quoted-string").unwrap();
        let input = "line1\n\"two\"\t<x>\\";
        assert_eq!(qs.unescape(&qs.escape(input)), input);
    }

    #[test]
    fn test_plain_is_identity() {
        let plain = ContentType::default_type();
        assert_eq!(plain.escape("<&>\""), "<&>\"");
    }

    #[test]
    fn test_listing() {
        let listed = ContentType::list_supported();
        assert!(listed.iter().any(|(name, _)| name == "quoted-string"));
        assert_eq!(listed.len(), 4);
    }
}
