//! Multi-file layering through the public loader.

use perfconf::{ConfigError, PerfConfig};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_toml(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn later_files_override_earlier_ones_key_by_key() {
    let system = write_toml(
        r#"
[audio]
sample_rate = 44100
block_size = 128

[listener]
pause_ms = 750
"#,
    );
    let local = write_toml(
        r#"
[audio]
block_size = 256

[bus]
name = "Rehearsal"
capacity = 1024
"#,
    );

    let files = vec![system.path().to_path_buf(), local.path().to_path_buf()];
    let (config, sources) = PerfConfig::load_files(&files).unwrap();

    assert_eq!(config.audio.sample_rate, 44100);
    assert_eq!(config.audio.block_size, 256);
    assert_eq!(config.listener.pause_ms, 750);
    assert_eq!(config.bus.name, "Rehearsal");
    assert_eq!(config.bus.capacity, 1024);
    assert_eq!(sources.files, files);
}

#[test]
fn invalid_merged_values_are_rejected() {
    let file = write_toml(
        r#"
[listener]
initial_mode = "karaoke"
"#,
    );

    let err = PerfConfig::load_files(&[file.path().to_path_buf()]).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn missing_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");

    let err = PerfConfig::load_files(&[missing.clone()]).unwrap_err();
    match err {
        ConfigError::FileRead { path, .. } => assert_eq!(path, missing),
        other => panic!("expected FileRead, got {other:?}"),
    }
}
