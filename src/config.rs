use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use globset::{Glob, GlobSet, GlobSetBuilder};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{NoteGraphError, Result};

const CONFIG_FILE: &str = "config.json";

/// Application configuration settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Directory the note graph mirrors
    pub notes_dir: PathBuf,

    /// Quiet period before an edited note is written back (milliseconds).
    /// Used by the persist queue that runs alongside `watch`.
    pub persist_debounce_ms: u64,

    /// File extensions treated as notes
    pub note_extensions: Vec<String>,

    /// Extension given to newly created notes
    pub default_extension: String,

    /// Glob patterns (relative to `notes_dir`) that are never loaded
    pub ignore_patterns: Vec<String>,

    /// Whether to watch `notes_dir` for external changes
    pub watch: bool,
}

impl Default for Config {
    fn default() -> Self {
        let notes_dir = ProjectDirs::from("", "", "notegraph")
            .map(|dirs| dirs.data_dir().join("notes"))
            .unwrap_or_else(|| PathBuf::from("notes"));
        Config {
            notes_dir,
            persist_debounce_ms: 1000,
            note_extensions: ["md", "markdown", "txt", "text"]
                .into_iter()
                .map(String::from)
                .collect(),
            default_extension: "md".to_string(),
            ignore_patterns: Vec::new(),
            watch: true,
        }
    }
}

impl Config {
    /// `<config dir>/notegraph/config.json` for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "notegraph").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Loads `path` (or the default location). A missing file yields the
    /// defaults; a malformed one is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => {
                    warn!("No configuration directory available, using defaults");
                    return Ok(Config::default());
                }
            },
        };
        if !path.exists() {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        Self::load(&path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.note_extensions.is_empty() {
            return Err(NoteGraphError::ConfigError {
                message: "note_extensions must not be empty".to_string(),
            });
        }
        let default_ext = self.default_extension.trim_start_matches('.');
        if !self
            .note_extensions
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case(default_ext))
        {
            return Err(NoteGraphError::ConfigError {
                message: format!(
                    "default_extension '{}' is not one of note_extensions",
                    self.default_extension
                ),
            });
        }
        self.ignore_set().map(|_| ())
    }

    /// Compiled `ignore_patterns`.
    pub fn ignore_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.ignore_patterns {
            let glob = Glob::new(pattern).map_err(|e| NoteGraphError::ConfigError {
                message: format!("invalid ignore pattern '{}': {}", pattern, e),
            })?;
            builder.add(glob);
        }
        builder.build().map_err(|e| NoteGraphError::ConfigError {
            message: format!("failed to build ignore set: {}", e),
        })
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{"notes_dir": "/tmp/n"}"#).unwrap();
        assert_eq!(config.notes_dir, PathBuf::from("/tmp/n"));
        assert_eq!(config.persist_debounce_ms, 1000);
        assert_eq!(config.default_extension, "md");
        assert!(config.note_extensions.contains(&"markdown".to_string()));
        assert!(config.watch);
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let config = Config {
            notes_dir: dir.path().join("notes"),
            persist_debounce_ms: 250,
            ignore_patterns: vec!["drafts/**".to_string()],
            ..Config::default()
        };
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
        assert_eq!(
            Config::load_or_default(Some(&path)).unwrap().persist_debounce(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn missing_file_uses_defaults_but_garbage_fails() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("none.json");
        assert_eq!(
            Config::load_or_default(Some(&missing)).unwrap().persist_debounce_ms,
            1000
        );

        let garbage = dir.path().join("bad.json");
        fs::write(&garbage, "{ not json").unwrap();
        assert!(matches!(
            Config::load_or_default(Some(&garbage)),
            Err(NoteGraphError::Serialization(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let config = Config {
            default_extension: "org".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NoteGraphError::ConfigError { .. })
        ));

        let config = Config {
            ignore_patterns: vec!["[".to_string()],
            ..Config::default()
        };
        assert!(config.ignore_set().is_err());
    }

    #[test]
    fn ignore_set_matches_relative_paths() {
        let config = Config {
            ignore_patterns: vec!["drafts/**".to_string(), "*.tmp.md".to_string()],
            ..Config::default()
        };
        let set = config.ignore_set().unwrap();
        assert!(set.is_match("drafts/a.md"));
        assert!(set.is_match("x.tmp.md"));
        assert!(!set.is_match("notes/a.md"));
    }
}
