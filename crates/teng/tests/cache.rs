/*
 * cache.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Template cache behavior observable through the engine facade.

use std::time::{Duration, SystemTime};

use teng::{ErrorLog, Fragment, GenerateArgs, StringWriter, Teng, TengSettings};

/// Write a file and age its modification time, so a later write is
/// guaranteed to look newer regardless of filesystem timestamp granularity.
fn write_aged(path: &std::path::Path, content: &str) {
    std::fs::write(path, content).expect("write file");
    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .expect("open file");
    file.set_modified(SystemTime::now() - Duration::from_secs(60))
        .expect("set mtime");
}

fn render_file(engine: &Teng, name: &str) -> String {
    let mut writer = StringWriter::new();
    let mut log = ErrorLog::new();
    engine
        .generate_page(
            &GenerateArgs::from_file(name),
            &Fragment::new(),
            &mut writer,
            &mut log,
        )
        .expect("render should not fail");
    writer.into_string()
}

#[test]
fn cached_program_is_reused_until_the_file_changes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("page.html");
    write_aged(&path, "v1");
    let engine = Teng::new(dir.path(), &TengSettings::default()).expect("engine");

    assert_eq!(render_file(&engine, "page.html"), "v1");
    assert_eq!(render_file(&engine, "page.html"), "v1");

    std::fs::write(&path, "v2").expect("rewrite file");
    assert_eq!(render_file(&engine, "page.html"), "v2");
}

#[test]
fn changed_include_invalidates_the_program() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_aged(
        &dir.path().join("page.html"),
        "<?teng include file=\"part.html\"?>",
    );
    write_aged(&dir.path().join("part.html"), "old");
    let engine = Teng::new(dir.path(), &TengSettings::default()).expect("engine");

    assert_eq!(render_file(&engine, "page.html"), "old");
    std::fs::write(dir.path().join("part.html"), "new").expect("rewrite include");
    assert_eq!(render_file(&engine, "page.html"), "new");
}

#[test]
fn appearing_template_replaces_the_cached_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Teng::new(dir.path(), &TengSettings::default()).expect("engine");

    assert_eq!(render_file(&engine, "late.html"), "");
    std::fs::write(dir.path().join("late.html"), "here").expect("write template");
    assert_eq!(render_file(&engine, "late.html"), "here");
}

#[test]
fn string_templates_are_cached_by_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Teng::new(dir.path(), &TengSettings::default()).expect("engine");

    let render = |source: &str| {
        let mut writer = StringWriter::new();
        let mut log = ErrorLog::new();
        engine
            .generate_page(
                &GenerateArgs::from_string(source),
                &Fragment::new(),
                &mut writer,
                &mut log,
            )
            .expect("render should not fail");
        writer.into_string()
    };
    assert_eq!(render("${1 + 1}"), "2");
    assert_eq!(render("${1 + 1}"), "2");
    assert_eq!(render("${2 + 2}"), "4");
}

#[test]
fn concurrent_renders_share_one_engine() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("page.html"), "${n + 1}").expect("write template");
    let engine = std::sync::Arc::new(
        Teng::new(dir.path(), &TengSettings::default()).expect("engine"),
    );

    let mut handles = Vec::new();
    for n in 0..8i64 {
        let engine = std::sync::Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            let mut data = Fragment::new();
            data.add_variable("n", n);
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
            assert_eq!(writer.as_str(), (n + 1).to_string());
        }));
    }
    for handle in handles {
        handle.join().expect("thread should not panic");
    }
}
