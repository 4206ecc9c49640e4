/*
 * render.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! End-to-end rendering through the engine facade.

use teng::{ErrorLog, Fragment, GenerateArgs, Severity, StringWriter, Teng, TengSettings};

fn engine_in(root: &std::path::Path) -> Teng {
    Teng::new(root, &TengSettings::default()).expect("engine should construct")
}

fn render_string(template: &str, data: &Fragment) -> (String, Severity, ErrorLog) {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let severity = engine
        .generate_page(&GenerateArgs::from_string(template), data, &mut writer, &mut log)
        .expect("render should not fail");
    (writer.into_string(), severity, log)
}

#[test]
fn empty_template_renders_unescaped_source() {
    let (out, severity, _) = render_string("plain $\\{text} here", &Fragment::new());
    assert_eq!(out, "plain ${text} here");
    assert_eq!(severity, Severity::Debug);
}

#[test]
fn nested_content_type_scopes_compose_escaping() {
    let template = "<?teng ctype \"text/html\"?><?teng ctype \"quoted-string\"?>\
                    ${escape(\"<b>fuj\\\"</b>\")}<?teng endctype?><?teng endctype?>";
    let (out, severity, _) = render_string(template, &Fragment::new());
    assert_eq!(out, "\"\\u003Cb\\u003Efuj\\\"\\u003C/b\\u003E\"");
    assert_eq!(severity, Severity::Debug);
}

#[test]
fn nested_fragments_iterate_in_order() {
    let mut data = Fragment::new();
    let row = data.add_fragment("row");
    row.add_fragment("col").add_variable("cnum", 1i64);
    row.add_fragment("col").add_variable("cnum", 2i64);
    data.add_fragment("row")
        .add_fragment("col")
        .add_variable("cnum", 3i64);

    let template = "<?teng frag row?><?teng frag col?>${cnum}<?teng endfrag?><?teng endfrag?>";
    let (out, severity, _) = render_string(template, &data);
    assert_eq!(out, "123");
    assert_eq!(severity, Severity::Debug);
}

#[test]
fn division_by_zero_renders_empty_with_diag() {
    let (out, severity, log) = render_string("${1/0}", &Fragment::new());
    assert_eq!(out, "");
    assert_eq!(severity, Severity::Diag);
    assert_eq!(severity.as_code(), 2);
    assert!(log.entries().iter().any(|e| e.msg.contains("Division")));
}

#[test]
fn string_concat_and_numeric_coercion() {
    let (out, _, _) = render_string("${\"a\" ++ \"b\"}", &Fragment::new());
    assert_eq!(out, "ab");
    let (out, severity, _) = render_string("${1 + \"2\"}", &Fragment::new());
    assert_eq!(out, "3");
    assert_eq!(severity, Severity::Debug);
}

#[test]
fn nowhite_format_scope_strips_whitespace() {
    let template = "<?teng format space=\"nowhite\"?>  a   b  <?teng endformat?>";
    let (out, severity, _) = render_string(template, &Fragment::new());
    assert_eq!(out, "ab");
    assert_eq!(severity, Severity::Debug);
}

#[test]
fn dictionary_lookup_and_missing_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("strings.dict"), "greeting Hello\n").expect("write dict");
    let engine = engine_in(dir.path());

    let mut args = GenerateArgs::from_string("#{greeting} #{farewell}");
    args.dict = "strings.dict";
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let severity = engine
        .generate_page(&args, &Fragment::new(), &mut writer, &mut log)
        .expect("render should not fail");
    assert_eq!(writer.as_str(), "Hello #{farewell}");
    assert_eq!(severity, Severity::Warning);
}

#[test]
fn language_overlay_picks_localized_dictionary() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("strings.dict"), "greeting Hello\n").expect("write dict");
    std::fs::write(dir.path().join("strings.cz.dict"), "greeting Ahoj\n").expect("write dict");
    let engine = engine_in(dir.path());

    let mut args = GenerateArgs::from_string("#{greeting}");
    args.dict = "strings.dict";
    args.lang = "cz";
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    engine
        .generate_page(&args, &Fragment::new(), &mut writer, &mut log)
        .expect("render should not fail");
    assert_eq!(writer.as_str(), "Ahoj");

    assert_eq!(
        engine.dictionary_lookup("", "strings.dict", "cz", "greeting"),
        Some("Ahoj".to_string())
    );
    assert_eq!(
        engine.dictionary_lookup("", "strings.dict", "", "greeting"),
        Some("Hello".to_string())
    );
    assert_eq!(engine.dictionary_lookup("", "strings.dict", "", "nope"), None);
}

#[test]
fn skin_is_woven_into_template_filename() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("page.html"), "desktop").expect("write template");
    std::fs::write(dir.path().join("page.mobile.html"), "mobile").expect("write template");
    let engine = engine_in(dir.path());

    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let mut args = GenerateArgs::from_file("page.html");
    args.skin = "mobile";
    engine
        .generate_page(&args, &Fragment::new(), &mut writer, &mut log)
        .expect("render should not fail");
    assert_eq!(writer.as_str(), "mobile");
}

#[test]
fn missing_template_is_fatal_in_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let severity = engine
        .generate_page(
            &GenerateArgs::from_file("absent.html"),
            &Fragment::new(),
            &mut writer,
            &mut log,
        )
        .expect("render should not fail");
    assert_eq!(severity, Severity::Fatal);
    assert_eq!(writer.as_str(), "");
}

#[test]
fn includes_are_spliced_at_compile_time() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("page.html"),
        "[<?teng include file=\"part.html\"?>]",
    )
    .expect("write template");
    std::fs::write(dir.path().join("part.html"), "${x}").expect("write include");
    let engine = engine_in(dir.path());

    let mut data = Fragment::new();
    data.add_variable("x", "inner");
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    engine
        .generate_page(
            &GenerateArgs::from_file("page.html"),
            &data,
            &mut writer,
            &mut log,
        )
        .expect("render should not fail");
    assert_eq!(writer.as_str(), "[inner]");
}

#[test]
fn param_dictionary_toggles_features() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("teng.conf"),
        "%enable short-tag\n%enable print-escape\n",
    )
    .expect("write param");
    let engine = engine_in(dir.path());

    let mut args = GenerateArgs::from_string("<? set x = 7?>%{x}");
    args.param = "teng.conf";
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    let severity = engine
        .generate_page(&args, &Fragment::new(), &mut writer, &mut log)
        .expect("render should not fail");
    assert_eq!(writer.as_str(), "7");
    assert_eq!(severity, Severity::Debug);

    // without the param dictionary both syntaxes stay literal text
    let (out, _, _) = render_string("<? set x = 7?>%{x}", &Fragment::new());
    assert_eq!(out, "<? set x = 7?>%{x}");
}

#[test]
fn log_to_output_appends_comments() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("teng.conf"), "%enable log-to-output\n").expect("write param");
    let engine = engine_in(dir.path());

    let mut args = GenerateArgs::from_string("${1/0}ok");
    args.param = "teng.conf";
    args.content_type = "application/x-sh";
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    engine
        .generate_page(&args, &Fragment::new(), &mut writer, &mut log)
        .expect("render should not fail");
    let out = writer.into_string();
    assert!(out.starts_with("ok"));
    assert!(out.contains("# Error log:\n"));
    assert!(out.contains("Division by zero"));
}

#[test]
fn error_fragment_exposes_log_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("teng.conf"), "%enable error-fragment\n").expect("write param");
    let engine = engine_in(dir.path());

    let mut args =
        GenerateArgs::from_string("${1/0}<?teng frag _error?>(${message})<?teng endfrag?>");
    args.param = "teng.conf";
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    engine
        .generate_page(&args, &Fragment::new(), &mut writer, &mut log)
        .expect("render should not fail");
    assert_eq!(writer.as_str(), "(Division by zero)");
}

#[test]
fn compile_errors_are_replayed_per_render() {
    let (_, severity, log) = render_string("${1 +}after", &Fragment::new());
    assert_eq!(severity, Severity::Error);
    assert!(!log.is_empty());

    // the degraded program still renders the rest
    let (out, _, _) = render_string("${1 +}after", &Fragment::new());
    assert!(out.contains("after"));
}

#[test]
fn utf8_encoding_switches_character_semantics() {
    let mut args = GenerateArgs::from_string("${len('žluť')}");
    args.encoding = "utf-8";
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    engine
        .generate_page(&args, &Fragment::new(), &mut writer, &mut log)
        .expect("render should not fail");
    assert_eq!(writer.as_str(), "4");

    let (out, _, _) = render_string("${len('žluť')}", &Fragment::new());
    assert_eq!(out, "6");
}
