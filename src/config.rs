//! Configuration for a backup run.
//!
//! Values are layered with `figment`: an optional TOML file, then the raw
//! environment variables the deployment already exports (`CICD_NEXUS_VOLUME`,
//! `BACKUP_DIRECTORY`, ...), then overrides given on the command line.
//! The result is resolved once into an immutable [`AppConfig`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ValueEnum;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::core::BackupJob;

/// Config file read when `--config` is not given. Ignored if absent.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cicd-backup/config.toml";

const DEFAULT_NEXUS_CONTAINER: &str = "cicd_nexus_1";
const DEFAULT_JENKINS_CONTAINER: &str = "cicd_jenkins_1";

const ENV_KEYS: &[&str] = &[
    "CICD_JENKINS_VOLUME",
    "CICD_NEXUS_VOLUME",
    "CICD_JENKINS_CONTAINER",
    "CICD_NEXUS_CONTAINER",
    "BACKUP_DIRECTORY",
    "BACKUP_HISTORY_DIRECTORY",
    "LOG_LEVEL",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration value {0}")]
    Missing(&'static str),

    #[error("Config file '{}' does not exist", .0.display())]
    FileNotFound(PathBuf),

    #[error(
        "Invalid LOG_LEVEL '{0}' (expected one of: all, trace, debug, info, warn, error, fatal, mark, off)"
    )]
    InvalidLogLevel(String),

    #[error(transparent)]
    Figment(#[from] figment::Error),
}

/// The services this tool knows how to back up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceName {
    Jenkins,
    Nexus,
}

impl ServiceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jenkins => "jenkins",
            Self::Nexus => "nexus",
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum log verbosity, using the level names operators already put in `LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    All,
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Mark,
    Off,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
            Self::Mark => "mark",
            Self::Off => "off",
        }
    }

    /// `tracing` has no levels above ERROR, so `fatal` and `mark` collapse onto it.
    pub fn as_filter(&self) -> LevelFilter {
        match self {
            Self::All | Self::Trace => LevelFilter::TRACE,
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warn => LevelFilter::WARN,
            Self::Error | Self::Fatal | Self::Mark => LevelFilter::ERROR,
            Self::Off => LevelFilter::OFF,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            "mark" => Ok(Self::Mark),
            "off" => Ok(Self::Off),
            _ => Err(ConfigError::InvalidLogLevel(s.to_string())),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, ConfigError> {
        value.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.as_str().to_string()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values that may be overridden from the command line. Only set fields are
/// serialized so unset flags never mask the environment.
#[derive(Debug, Default, Clone, Serialize, clap::Args)]
pub struct ConfigOverrides {
    /// Directory the primary backup zips are written to
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    pub backup_directory: Option<PathBuf>,

    /// Directory dated copies of each backup zip are kept in
    #[serde(skip_serializing_if = "Option::is_none", rename = "backup_history_directory")]
    #[arg(long = "history-directory")]
    pub history_directory: Option<PathBuf>,
}

/// Shape of the merged figment before validation; every key is optional here.
///
/// figment types environment values, so `2024` arrives as a number and `true`
/// as a bool. Every field takes any scalar verbatim as a string instead.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default, deserialize_with = "scalar::path")]
    cicd_jenkins_volume: Option<PathBuf>,
    #[serde(default, deserialize_with = "scalar::path")]
    cicd_nexus_volume: Option<PathBuf>,
    #[serde(default, deserialize_with = "scalar::string")]
    cicd_jenkins_container: Option<String>,
    #[serde(default, deserialize_with = "scalar::string")]
    cicd_nexus_container: Option<String>,
    #[serde(default, deserialize_with = "scalar::path")]
    backup_directory: Option<PathBuf>,
    #[serde(default, deserialize_with = "scalar::path")]
    backup_history_directory: Option<PathBuf>,
    #[serde(default, deserialize_with = "scalar::string")]
    log_level: Option<String>,
}

mod scalar {
    use std::fmt;
    use std::path::PathBuf;

    use serde::Deserializer;
    use serde::de::{self, Visitor};

    struct ScalarString;

    impl<'de> Visitor<'de> for ScalarString {
        type Value = Option<String>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string, number or boolean")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_char<E: de::Error>(self, v: char) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_i128<E: de::Error>(self, v: i128) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u128<E: de::Error>(self, v: u128) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
            d.deserialize_any(ScalarString)
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        d.deserialize_any(ScalarString)
    }

    pub fn path<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PathBuf>, D::Error> {
        Ok(string(d)?.map(PathBuf::from))
    }
}

/// Fully resolved configuration. Built once at startup and passed by reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppConfig {
    pub jenkins_volume: PathBuf,
    pub nexus_volume: PathBuf,
    pub jenkins_container: String,
    pub nexus_container: String,
    pub backup_directory: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_directory: Option<PathBuf>,
    pub log_level: LogLevel,
}

impl AppConfig {
    /// Resolve configuration from the config file, environment and CLI overrides.
    ///
    /// An explicitly requested config file must exist; the default one is optional.
    pub fn load(
        config_file: Option<&Path>,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let file = match config_file {
            Some(path) if !path.exists() => {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_PATH),
        };

        let raw: RawConfig = Figment::new()
            .merge(Toml::file(&file))
            .merge(Env::raw().only(ENV_KEYS))
            .merge(Serialized::defaults(overrides))
            .extract()?;

        Self::resolve(raw)
    }

    fn resolve(raw: RawConfig) -> Result<Self, ConfigError> {
        let jenkins_volume = non_empty(raw.cicd_jenkins_volume)
            .ok_or(ConfigError::Missing("CICD_JENKINS_VOLUME"))?;
        let nexus_volume =
            non_empty(raw.cicd_nexus_volume).ok_or(ConfigError::Missing("CICD_NEXUS_VOLUME"))?;
        let backup_directory =
            non_empty(raw.backup_directory).ok_or(ConfigError::Missing("BACKUP_DIRECTORY"))?;

        let log_level = match raw.log_level.as_deref().map(str::trim) {
            None | Some("") => LogLevel::default(),
            Some(level) => level.parse()?,
        };

        Ok(Self {
            jenkins_volume,
            nexus_volume,
            jenkins_container: raw
                .cicd_jenkins_container
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_JENKINS_CONTAINER.to_string()),
            nexus_container: raw
                .cicd_nexus_container
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_NEXUS_CONTAINER.to_string()),
            backup_directory,
            history_directory: non_empty(raw.backup_history_directory),
            log_level,
        })
    }

    /// Every configured backup job, in the order they run: Nexus, then Jenkins.
    pub fn jobs(&self) -> Vec<BackupJob> {
        vec![
            BackupJob::new(
                ServiceName::Nexus,
                self.nexus_container.clone(),
                self.nexus_volume.clone(),
            ),
            BackupJob::new(
                ServiceName::Jenkins,
                self.jenkins_container.clone(),
                self.jenkins_volume.clone(),
            ),
        ]
    }
}

/// Empty strings in the environment mean "unset".
fn non_empty(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn set_required(jail: &mut Jail) {
        jail.set_env("CICD_JENKINS_VOLUME", "/srv/jenkins_home");
        jail.set_env("CICD_NEXUS_VOLUME", "/srv/nexus-data");
        jail.set_env("BACKUP_DIRECTORY", "/backups");
    }

    fn load(overrides: &ConfigOverrides) -> figment::error::Result<AppConfig> {
        AppConfig::load(None, overrides).map_err(|e| e.to_string().into())
    }

    #[test]
    fn test_load_from_environment() {
        Jail::expect_with(|jail| {
            set_required(jail);

            let config = load(&ConfigOverrides::default())?;
            assert_eq!(config.jenkins_volume, PathBuf::from("/srv/jenkins_home"));
            assert_eq!(config.nexus_volume, PathBuf::from("/srv/nexus-data"));
            assert_eq!(config.backup_directory, PathBuf::from("/backups"));
            assert_eq!(config.history_directory, None);
            assert_eq!(config.log_level, LogLevel::Info);
            assert_eq!(config.nexus_container, "cicd_nexus_1");
            assert_eq!(config.jenkins_container, "cicd_jenkins_1");
            Ok(())
        });
    }

    #[test]
    fn test_missing_required_value() {
        Jail::expect_with(|jail| {
            jail.set_env("CICD_JENKINS_VOLUME", "/srv/jenkins_home");
            jail.set_env("BACKUP_DIRECTORY", "/backups");

            let err = AppConfig::load(None, &ConfigOverrides::default()).unwrap_err();
            assert!(matches!(err, ConfigError::Missing("CICD_NEXUS_VOLUME")));
            Ok(())
        });
    }

    #[test]
    fn test_empty_history_directory_is_unset() {
        Jail::expect_with(|jail| {
            set_required(jail);
            jail.set_env("BACKUP_HISTORY_DIRECTORY", "");

            let config = load(&ConfigOverrides::default())?;
            assert_eq!(config.history_directory, None);
            Ok(())
        });
    }

    #[test]
    fn test_numeric_and_boolean_values_are_kept_verbatim() {
        Jail::expect_with(|jail| {
            set_required(jail);
            jail.set_env("CICD_JENKINS_VOLUME", "2024");
            jail.set_env("CICD_NEXUS_VOLUME", "true");
            jail.set_env("BACKUP_DIRECTORY", "1999");
            jail.set_env("BACKUP_HISTORY_DIRECTORY", "42");
            jail.set_env("CICD_NEXUS_CONTAINER", "1");

            let config = load(&ConfigOverrides::default())?;
            assert_eq!(config.jenkins_volume, PathBuf::from("2024"));
            assert_eq!(config.nexus_volume, PathBuf::from("true"));
            assert_eq!(config.history_directory, Some(PathBuf::from("42")));
            assert_eq!(config.nexus_container, "1");
            assert_eq!(config.backup_directory, PathBuf::from("1999"));
            Ok(())
        });
    }

    #[test]
    fn test_log_level_case_insensitive() {
        Jail::expect_with(|jail| {
            set_required(jail);
            jail.set_env("LOG_LEVEL", "DEBUG");

            let config = load(&ConfigOverrides::default())?;
            assert_eq!(config.log_level, LogLevel::Debug);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        Jail::expect_with(|jail| {
            set_required(jail);
            jail.set_env("LOG_LEVEL", "verbose");

            let err = AppConfig::load(None, &ConfigOverrides::default()).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidLogLevel(_)));
            Ok(())
        });
    }

    #[test]
    fn test_cli_overrides_environment() {
        Jail::expect_with(|jail| {
            set_required(jail);
            jail.set_env("BACKUP_HISTORY_DIRECTORY", "/history");

            let overrides = ConfigOverrides {
                backup_directory: Some(PathBuf::from("/mnt/backups")),
                history_directory: Some(PathBuf::from("/mnt/history")),
            };
            let config = load(&overrides)?;
            assert_eq!(config.backup_directory, PathBuf::from("/mnt/backups"));
            assert_eq!(config.history_directory, Some(PathBuf::from("/mnt/history")));
            Ok(())
        });
    }

    #[test]
    fn test_config_file_layer() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "backup.toml",
                r#"
                    cicd_jenkins_volume = "/data/jenkins_home"
                    cicd_nexus_volume = "/data/nexus-data"
                    backup_directory = "/data/backups"
                    cicd_nexus_container = "nexus"
                "#,
            )?;
            jail.set_env("BACKUP_DIRECTORY", "/env/backups");

            let config = AppConfig::load(Some(Path::new("backup.toml")), &ConfigOverrides::default())
                .map_err(|e| e.to_string())?;
            assert_eq!(config.jenkins_volume, PathBuf::from("/data/jenkins_home"));
            assert_eq!(config.backup_directory, PathBuf::from("/env/backups"));
            assert_eq!(config.nexus_container, "nexus");
            Ok(())
        });
    }

    #[test]
    fn test_explicit_config_file_must_exist() {
        let err = AppConfig::load(
            Some(Path::new("/nonexistent/cicd-backup.toml")),
            &ConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_jobs_order() {
        let config = AppConfig {
            jenkins_volume: PathBuf::from("/srv/jenkins_home"),
            nexus_volume: PathBuf::from("/srv/nexus-data"),
            jenkins_container: "cicd_jenkins_1".to_string(),
            nexus_container: "cicd_nexus_1".to_string(),
            backup_directory: PathBuf::from("/backups"),
            history_directory: None,
            log_level: LogLevel::Info,
        };

        let services: Vec<_> = config.jobs().iter().map(|j| j.service).collect();
        assert_eq!(services, vec![ServiceName::Nexus, ServiceName::Jenkins]);
    }

    #[test]
    fn test_log_level_filters() {
        assert_eq!(LogLevel::All.as_filter(), LevelFilter::TRACE);
        assert_eq!(LogLevel::Fatal.as_filter(), LevelFilter::ERROR);
        assert_eq!(LogLevel::Off.as_filter(), LevelFilter::OFF);
    }
}
