/*
 * properties.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Property tests for the unescaper and the formatter.

use proptest::prelude::*;

use teng::formatter::{Formatter, FormatterMode};
use teng::lex1::unescape;
use teng::StringWriter;

const ESCAPE_SEQUENCES: [&str; 6] = ["$\\{", "#\\{", "%\\{", "<\\?", "?\\>", "\\}"];

const MODES: [FormatterMode; 6] = [
    FormatterMode::PassWhite,
    FormatterMode::NoWhite,
    FormatterMode::OneSpace,
    FormatterMode::StripLines,
    FormatterMode::JoinLines,
    FormatterMode::NoWhiteLines,
];

fn format_all(mode: FormatterMode, input: &str) -> String {
    let mut writer = StringWriter::new();
    {
        let mut formatter = Formatter::new(&mut writer, mode);
        formatter.write(input).expect("write should not fail");
        formatter.flush().expect("flush should not fail");
    }
    writer.into_string()
}

proptest! {
    // unescape is idempotent whenever its output is free of the six
    // escape sequences
    #[test]
    fn unescape_idempotent_on_clean_output(s in r"[$#%<>?{}\\ab]{0,32}") {
        let once = unescape(&s, true);
        if !ESCAPE_SEQUENCES.iter().any(|seq| once.contains(seq)) {
            prop_assert_eq!(unescape(&once, true), once);
        }
    }

    // unescaping never grows the text
    #[test]
    fn unescape_never_grows(s in r"[$#%<>?{}\\ab]{0,32}") {
        prop_assert!(unescape(&s, true).len() <= s.len());
    }

    // any mode is the identity on text without whitespace runs
    #[test]
    fn formatter_is_identity_without_whitespace(
        s in "[a-zA-Z0-9<>&${}]{0,32}",
        mode_index in 0usize..MODES.len(),
    ) {
        prop_assert_eq!(format_all(MODES[mode_index], &s), s);
    }

    // nowhite output never contains whitespace
    #[test]
    fn nowhite_strips_all_whitespace(s in "[ab \t\n\r]{0,48}") {
        let out = format_all(FormatterMode::NoWhite, &s);
        prop_assert!(!out.contains(|c: char| c.is_ascii_whitespace()));
    }

    // every mode only ever removes or collapses whitespace; the
    // non-whitespace characters pass through verbatim and in order
    #[test]
    fn formatter_preserves_black_characters(
        s in "[ab \t\n]{0,48}",
        mode_index in 0usize..MODES.len(),
    ) {
        let out = format_all(MODES[mode_index], &s);
        let black = |text: &str| {
            text.chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect::<String>()
        };
        prop_assert_eq!(black(&out), black(&s));
    }
}
