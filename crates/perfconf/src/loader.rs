//! Config file discovery, table merging, and environment variable overlay.

use crate::{ConfigError, PerfConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/performia/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("performia/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("performia.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
///
/// The table is also checked against the config schema so type errors are
/// reported against the file that contains them.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    table_to_config(table.clone()).map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })?;

    Ok(table)
}

/// Deserialize a merged table, filling gaps with compiled defaults.
pub fn table_to_config(table: toml::Table) -> Result<PerfConfig, String> {
    toml::Value::Table(table)
        .try_into::<PerfConfig>()
        .map_err(|e| e.to_string())
}

/// Merge `overlay` into `base` key by key. Nested tables merge recursively,
/// every other value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply `PERFORMIA_*` environment variable overrides to config.
pub fn apply_env_overrides(config: &mut PerfConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, env::vars());
}

/// Apply overrides from an arbitrary set of variables.
pub fn apply_overrides_from<I>(config: &mut PerfConfig, sources: &mut ConfigSources, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut log_level_from_rust_log = None;

    for (key, value) in vars {
        let applied = match key.as_str() {
            "PERFORMIA_SAMPLE_RATE" => value.parse::<u32>().map(|v| config.audio.sample_rate = v).is_ok(),
            "PERFORMIA_BLOCK_SIZE" => value.parse::<usize>().map(|v| config.audio.block_size = v).is_ok(),
            "PERFORMIA_CHANNELS" => value.parse::<usize>().map(|v| config.audio.channels = v).is_ok(),
            "PERFORMIA_BUS_NAME" => {
                config.bus.name = value;
                true
            }
            "PERFORMIA_SHM_DIR" => {
                config.bus.shm_dir = expand_path(&value);
                true
            }
            "PERFORMIA_MIDI_PORT" => {
                config.pedals.midi_port = value;
                true
            }
            "PERFORMIA_LOG_LEVEL" => {
                config.telemetry.log_level = value;
                true
            }
            // RUST_LOG wins over PERFORMIA_LOG_LEVEL regardless of iteration order
            "RUST_LOG" => {
                log_level_from_rust_log = Some(value);
                false
            }
            _ => false,
        };

        if applied {
            sources.env_overrides.push(key);
        }
    }

    if let Some(level) = log_level_from_rust_log {
        config.telemetry.log_level = level;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        return PathBuf::from(path);
    }

    if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        let (var_name, rest) = match stripped.find('/') {
            Some(slash_pos) => (&stripped[..slash_pos], Some(&stripped[slash_pos + 1..])),
            None => (stripped, None),
        };
        return match (env::var(var_name), rest) {
            (Ok(value), Some(rest)) => PathBuf::from(value).join(rest),
            (Ok(value), None) => PathBuf::from(value),
            (Err(_), _) => PathBuf::from(path),
        };
    }

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        assert_eq!(expand_path("/dev/shm"), PathBuf::from("/dev/shm"));
    }

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[audio]
sample_rate = 44100
"#;
        let table = parse_table(toml, Path::new("test.toml")).unwrap();
        let config = table_to_config(table).unwrap();
        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.audio.block_size, 64);
        assert_eq!(config.bus.name, "PerformiaBuffer");
    }

    #[test]
    fn test_parse_type_error_names_file() {
        let toml = r#"
[audio]
sample_rate = "fast"
"#;
        let err = parse_table(toml, Path::new("broken.toml")).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_merge_tables_is_key_by_key() {
        let mut base: toml::Table = r#"
[audio]
sample_rate = 44100
block_size = 128
"#
        .parse()
        .unwrap();
        let overlay: toml::Table = r#"
[audio]
block_size = 256

[bus]
name = "Rehearsal"
"#
        .parse()
        .unwrap();

        merge_tables(&mut base, overlay);
        let config = table_to_config(base).unwrap();

        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.audio.block_size, 256);
        assert_eq!(config.bus.name, "Rehearsal");
    }

    #[test]
    fn test_env_overrides_recorded() {
        let mut config = PerfConfig::default();
        let mut sources = ConfigSources::default();

        apply_overrides_from(
            &mut config,
            &mut sources,
            vars(&[
                ("PERFORMIA_SAMPLE_RATE", "96000"),
                ("PERFORMIA_BUS_NAME", "Stage"),
                ("PERFORMIA_BLOCK_SIZE", "not-a-number"),
                ("HOME", "/root"),
            ]),
        );

        assert_eq!(config.audio.sample_rate, 96000);
        assert_eq!(config.bus.name, "Stage");
        assert_eq!(config.audio.block_size, 64);
        assert_eq!(
            sources.env_overrides,
            vec!["PERFORMIA_SAMPLE_RATE".to_string(), "PERFORMIA_BUS_NAME".to_string()]
        );
    }

    #[test]
    fn test_rust_log_beats_performia_log_level() {
        let mut config = PerfConfig::default();
        let mut sources = ConfigSources::default();

        apply_overrides_from(
            &mut config,
            &mut sources,
            vars(&[("RUST_LOG", "earshot=trace"), ("PERFORMIA_LOG_LEVEL", "warn")]),
        );

        assert_eq!(config.telemetry.log_level, "earshot=trace");
    }
}
