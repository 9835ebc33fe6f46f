//! Runtime configuration
//!
//! Precedence: environment > config file > defaults. A `.env` file in the
//! working directory is loaded into the environment first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Config file picked up from the working directory when `--config` is absent
pub const DEFAULT_CONFIG_FILE: &str = "scr-ldx.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/app.db`
    pub database_path: Option<PathBuf>,
    pub forms_dir: PathBuf,
    /// Fallback when no watch directory has been set at runtime
    pub watch_dir: Option<PathBuf>,
    pub scan_interval_secs: u64,
    /// Target file extension, without the dot
    pub extension: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    /// Daily rolling log files go here when set
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_path: None,
            forms_dir: PathBuf::from("./forms"),
            watch_dir: None,
            scan_interval_secs: 5,
            extension: "ldx".to_string(),
            port: 8000,
            allowed_origins: vec![
                "http://localhost:8080".to_string(),
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
            log_dir: None,
        }
    }
}

impl Config {
    /// Load `.env`, then the config file (explicit or default), then the
    /// process environment
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let file = match config_file {
            Some(path) => Some(path.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
        };
        let env: HashMap<String, String> = std::env::vars().collect();

        Self::from_sources(file.as_deref(), &env)
    }

    pub fn from_sources(
        config_file: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match config_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&text, path)?
            }
            None => Self::default(),
        };

        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<(), ConfigError> {
        let var = |key: &str| env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(v) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("FORMS_DIR") {
            self.forms_dir = PathBuf::from(v);
        }
        if let Some(v) = var("LDX_WATCH_DIR") {
            self.watch_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("LDX_SCAN_INTERVAL_SECS") {
            self.scan_interval_secs = v.parse().map_err(|e| ConfigError::Invalid {
                key: "LDX_SCAN_INTERVAL_SECS",
                reason: format!("{v:?}: {e}"),
            })?;
        }
        if let Some(v) = var("LDX_EXTENSION") {
            self.extension = v.to_string();
        }
        if let Some(v) = var("PORT") {
            self.port = v.parse().map_err(|e| ConfigError::Invalid {
                key: "PORT",
                reason: format!("{v:?}: {e}"),
            })?;
        }
        if let Some(v) = var("ALLOWED_ORIGINS") {
            self.allowed_origins = v
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = var("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }

        Ok(())
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.scan_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "scan_interval_secs",
                reason: "must be greater than zero".into(),
            });
        }

        self.extension = self.extension.trim().trim_start_matches('.').to_ascii_lowercase();
        if self.extension.is_empty() {
            return Err(ConfigError::Invalid {
                key: "extension",
                reason: "must not be empty".into(),
            });
        }

        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("app.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = Config::from_sources(None, &HashMap::new()).unwrap();
        assert_eq!(config.scan_interval_secs, 5);
        assert_eq!(config.extension, "ldx");
        assert_eq!(config.port, 8000);
        assert_eq!(config.database_path(), PathBuf::from("./data/app.db"));
        assert!(config.watch_dir.is_none());
    }

    #[test]
    fn file_then_env() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scr-ldx.toml");
        std::fs::write(
            &path,
            "port = 9100\nforms_dir = \"/etc/scr/forms\"\nextension = \".LDX\"\n",
        )
        .unwrap();

        let config = Config::from_sources(
            Some(&path),
            &env(&[
                ("PORT", "9200"),
                ("LDX_WATCH_DIR", "/srv/logger"),
                ("ALLOWED_ORIGINS", "http://pit.local, ,http://garage.local"),
            ]),
        )
        .unwrap();

        assert_eq!(config.port, 9200);
        assert_eq!(config.forms_dir, PathBuf::from("/etc/scr/forms"));
        assert_eq!(config.extension, "ldx");
        assert_eq!(config.watch_dir, Some(PathBuf::from("/srv/logger")));
        assert_eq!(
            config.allowed_origins,
            vec!["http://pit.local", "http://garage.local"]
        );
    }

    #[test]
    fn rejects_bad_values() {
        let err = Config::from_sources(None, &env(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PORT", .. }));

        let err =
            Config::from_sources(None, &env(&[("LDX_SCAN_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "scan_interval_secs", .. }));
    }

    #[test]
    fn unknown_file_keys_are_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "prot = 1\n").unwrap();
        assert!(matches!(
            Config::from_sources(Some(&path), &HashMap::new()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
