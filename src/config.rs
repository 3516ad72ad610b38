//! # Connection Configuration
//!
//! Holds everything needed to reach a broker and to derive the shared topic:
//! broker addresses, the password namespace, channel and subchannels.
//!
//! ## Validation
//! [`ConnectionConfig::validate`] reports every problem at once as a list of
//! [`ConfigIssue`]s so a configuration front end can show them side by side.
//! The client refuses to connect with a configuration that has any issue.
//!
//! ## Persistence
//! Configurations are stored as TOML. Missing files are created with defaults
//! so a first start always has something to edit.

use crate::sync::error::SyncError;
use crate::sync::topic::{is_valid_identifier, subchannel_issues, validate_subchannels, Topic};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_PORT: u16 = 1883;
/// Public broker used when `use_default_broker` is set
pub const DEFAULT_BROKER: &str = "broker.hivemq.com";
/// Public broker used when `use_default_backup_broker` is set
pub const DEFAULT_BACKUP_BROKER: &str = "test.mosquitto.org";

const CONFIG_DIR: &str = ".config/topiclink";
const CONNECTION_CONFIG_FILE: &str = "connection.toml";
const PASSWORD_LEN: usize = 32;

/// A single reason a configuration was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigIssue {
    EmptyPassword,
    InvalidPassword(String),
    EmptyChannel,
    InvalidChannel(String),
    MissingBrokerUrl,
    InvalidBrokerUrl(String),
    InvalidBackupUrl(String),
    InvalidSubchannel { segment: String, reason: String },
    InvalidTimeout(&'static str),
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigIssue::EmptyPassword => write!(f, "password is required"),
            ConfigIssue::InvalidPassword(p) => write!(f, "invalid password format '{}'", p),
            ConfigIssue::EmptyChannel => write!(f, "channel is required"),
            ConfigIssue::InvalidChannel(c) => write!(f, "invalid channel name '{}'", c),
            ConfigIssue::MissingBrokerUrl => write!(f, "broker URL is required"),
            ConfigIssue::InvalidBrokerUrl(u) => write!(f, "'{}' is not a valid broker URL", u),
            ConfigIssue::InvalidBackupUrl(u) => {
                write!(f, "'{}' is not a valid backup broker URL", u)
            }
            ConfigIssue::InvalidSubchannel { segment, reason } => {
                write!(f, "invalid subchannel '{}': {}", segment, reason)
            }
            ConfigIssue::InvalidTimeout(which) => write!(f, "{} must be at least 1 second", which),
        }
    }
}

/// Network timeouts, in seconds on disk
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upper bound for the TCP reachability probe
    pub probe_secs: u64,
    /// Upper bound for CONNECT → CONNACK
    pub handshake_secs: u64,
    /// MQTT keep-alive interval
    pub keep_alive_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_secs: 5,
            handshake_secs: 10,
            keep_alive_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Broker and topic settings for one client
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub broker_url: String,
    pub backup_broker_url: Option<String>,
    /// Substitute [`DEFAULT_BROKER`] for `broker_url`
    pub use_default_broker: bool,
    /// Substitute [`DEFAULT_BACKUP_BROKER`] for `backup_broker_url`
    pub use_default_backup_broker: bool,
    pub port: u16,
    pub password: String,
    pub channel: String,
    subchannels: Vec<String>,
    /// Log sent and received traffic at info instead of debug
    pub log_events: bool,
    pub timeouts: TimeoutConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            backup_broker_url: None,
            use_default_broker: true,
            use_default_backup_broker: true,
            port: DEFAULT_PORT,
            password: generate_password(),
            channel: "defaultchannel".to_string(),
            subchannels: Vec::new(),
            log_events: false,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn new(broker_url: &str, password: &str, channel: &str) -> Self {
        Self {
            broker_url: broker_url.to_string(),
            use_default_broker: false,
            use_default_backup_broker: false,
            password: password.to_string(),
            channel: channel.to_string(),
            ..Self::default()
        }
    }

    pub fn with_backup(mut self, backup: &str) -> Self {
        self.backup_broker_url = Some(backup.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder variant of [`Self::set_subchannels`]
    pub fn with_subchannels<S: AsRef<str>>(mut self, subchannels: &[S]) -> Result<Self, SyncError> {
        self.set_subchannels(subchannels)?;
        Ok(self)
    }

    pub fn subchannels(&self) -> &[String] {
        &self.subchannels
    }

    /// Replaces the subchannel list only if the new list is valid as a whole
    pub fn set_subchannels<S: AsRef<str>>(&mut self, subchannels: &[S]) -> Result<(), SyncError> {
        validate_subchannels(subchannels)?;
        self.subchannels = subchannels.iter().map(|s| s.as_ref().to_string()).collect();
        Ok(())
    }

    /// Primary broker address after applying the default-broker flag
    pub fn primary_broker(&self) -> &str {
        if self.use_default_broker {
            DEFAULT_BROKER
        } else {
            &self.broker_url
        }
    }

    /// Backup broker address, if any, after applying the default-backup flag
    pub fn backup_broker(&self) -> Option<&str> {
        if self.use_default_backup_broker {
            Some(DEFAULT_BACKUP_BROKER)
        } else {
            self.backup_broker_url
                .as_deref()
                .filter(|url| !url.is_empty())
        }
    }

    pub fn topic(&self) -> Result<Topic, SyncError> {
        Topic::build(&self.password, &self.channel, &self.subchannels)
    }

    /// Every issue with this configuration; empty means ready to connect
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        let primary = self.primary_broker();
        if primary.is_empty() {
            issues.push(ConfigIssue::MissingBrokerUrl);
        } else if !is_url_valid(primary) {
            issues.push(ConfigIssue::InvalidBrokerUrl(primary.to_string()));
        }

        if let Some(backup) = self.backup_broker() {
            if !is_url_valid(backup) {
                issues.push(ConfigIssue::InvalidBackupUrl(backup.to_string()));
            }
        }

        if self.password.is_empty() {
            issues.push(ConfigIssue::EmptyPassword);
        } else if !is_valid_identifier(&self.password) {
            issues.push(ConfigIssue::InvalidPassword(self.password.clone()));
        }

        if self.channel.is_empty() {
            issues.push(ConfigIssue::EmptyChannel);
        } else if !is_valid_identifier(&self.channel) {
            issues.push(ConfigIssue::InvalidChannel(self.channel.clone()));
        }

        for issue in subchannel_issues(&self.subchannels) {
            if let SyncError::InvalidTopicSegment { segment, reason } = issue {
                issues.push(ConfigIssue::InvalidSubchannel { segment, reason });
            }
        }

        if self.timeouts.probe_secs == 0 {
            issues.push(ConfigIssue::InvalidTimeout("probe timeout"));
        }
        if self.timeouts.handshake_secs == 0 {
            issues.push(ConfigIssue::InvalidTimeout("handshake timeout"));
        }
        if self.timeouts.keep_alive_secs == 0 {
            issues.push(ConfigIssue::InvalidTimeout("keep-alive"));
        }

        issues
    }

    /// `validate` as a `Result`, for use right before connecting
    pub fn ensure_valid(&self) -> Result<(), SyncError> {
        let issues = self.validate();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(SyncError::InvalidConfig(issues))
        }
    }

    pub fn regenerate_password(&mut self) {
        self.password = generate_password();
    }

    /// Reads a TOML config, writing the defaults first if the file does not exist
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            info!("No config at {}, writing defaults", path.display());
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        debug!("Loaded connection config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize connection config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        debug!("Saved connection config to {}", path.display());
        Ok(())
    }
}

/// Non-empty, no `/` or `:`, at least one `.`
pub fn is_url_valid(url: &str) -> bool {
    !url.is_empty() && !url.contains('/') && !url.contains(':') && url.contains('.')
}

/// First 32 characters of a random v4 UUID
pub fn generate_password() -> String {
    uuid::Uuid::new_v4()
        .to_string()
        .chars()
        .take(PASSWORD_LEN)
        .collect()
}

pub fn default_config_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(CONFIG_DIR);
    path.push(CONNECTION_CONFIG_FILE);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_rule() {
        assert!(is_url_valid("broker.hivemq.com"));
        assert!(is_url_valid("127.0.0.1"));
        assert!(!is_url_valid(""));
        assert!(!is_url_valid("localhost"));
        assert!(!is_url_valid("mqtt://broker.hivemq.com"));
        assert!(!is_url_valid("broker.hivemq.com:1883"));
        assert!(!is_url_valid("broker.hivemq.com/"));
    }

    #[test]
    fn generated_password_is_a_valid_identifier() {
        let password = generate_password();
        assert_eq!(password.len(), 32);
        assert!(is_valid_identifier(&password));
        assert_ne!(password, generate_password());
    }

    #[test]
    fn valid_config_has_no_issues() {
        let config = ConnectionConfig::new("broker.example.com", "pw", "lobby")
            .with_backup("backup.example.com")
            .with_subchannels(&["players", "+", "movement"])
            .unwrap();
        assert!(config.validate().is_empty());
        assert!(config.ensure_valid().is_ok());
        assert_eq!(config.topic().unwrap().as_str(), "pw/lobby/players/+/movement");
    }

    #[test]
    fn itemizes_every_issue() {
        let mut config = ConnectionConfig::new("mqtt://bad", "", "-chan");
        config.backup_broker_url = Some("nodots".to_string());
        config.timeouts.probe_secs = 0;

        let issues = config.validate();
        assert_eq!(
            issues,
            vec![
                ConfigIssue::InvalidBrokerUrl("mqtt://bad".to_string()),
                ConfigIssue::InvalidBackupUrl("nodots".to_string()),
                ConfigIssue::EmptyPassword,
                ConfigIssue::InvalidChannel("-chan".to_string()),
                ConfigIssue::InvalidTimeout("probe timeout"),
            ]
        );
        assert!(matches!(
            config.ensure_valid(),
            Err(SyncError::InvalidConfig(list)) if list.len() == 5
        ));
    }

    #[test]
    fn missing_broker_is_reported() {
        let config = ConnectionConfig::new("", "pw", "chan");
        assert_eq!(config.validate(), vec![ConfigIssue::MissingBrokerUrl]);
    }

    #[test]
    fn empty_backup_counts_as_none() {
        let config = ConnectionConfig::new("a.b", "pw", "chan").with_backup("");
        assert_eq!(config.backup_broker(), None);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn default_broker_flags_substitute_public_brokers() {
        let mut config = ConnectionConfig::new("", "pw", "chan");
        config.use_default_broker = true;
        config.use_default_backup_broker = true;
        assert_eq!(config.primary_broker(), DEFAULT_BROKER);
        assert_eq!(config.backup_broker(), Some(DEFAULT_BACKUP_BROKER));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn set_subchannels_revalidates_whole_list() {
        let mut config = ConnectionConfig::new("a.b", "pw", "chan")
            .with_subchannels(&["players", "#"])
            .unwrap();

        // appending after '#' moves it out of last position
        let err = config
            .set_subchannels(&["players", "#", "movement"])
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidTopicSegment { .. }));
        assert_eq!(config.subchannels(), &["players".to_string(), "#".to_string()]);

        config.set_subchannels(&["players", "p1"]).unwrap();
        assert_eq!(config.topic().unwrap().as_str(), "pw/chan/players/p1");
    }

    #[test]
    fn deserialized_bad_subchannels_are_caught_by_validate() {
        let config: ConnectionConfig = toml::from_str(
            r##"
            broker_url = "a.b"
            use_default_broker = false
            use_default_backup_broker = false
            password = "pw"
            channel = "chan"
            subchannels = ["#", "x"]
            "##,
        )
        .unwrap();

        let issues = config.validate();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].to_string().contains("last subchannel"));
        assert!(matches!(
            &issues[0],
            ConfigIssue::InvalidSubchannel { segment, .. } if segment == "#"
        ));
        assert!(config.topic().is_err());
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[tokio::test]
    async fn load_or_create_writes_defaults_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONNECTION_CONFIG_FILE);

        let created = ConnectionConfig::load_or_create(&path).await.unwrap();
        assert!(path.exists());
        let loaded = ConnectionConfig::load_or_create(&path).await.unwrap();
        assert_eq!(created, loaded);

        let edited = ConnectionConfig::new("broker.example.com", "pw", "lobby")
            .with_subchannels(&["+"])
            .unwrap();
        edited.save(&path).await.unwrap();
        assert_eq!(ConnectionConfig::load_or_create(&path).await.unwrap(), edited);
    }

    #[tokio::test]
    async fn unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONNECTION_CONFIG_FILE);
        tokio::fs::write(&path, "port = \"not a number\"").await.unwrap();
        assert!(ConnectionConfig::load_or_create(&path).await.is_err());
    }
}
