//! Configuration for connecting to a workflow backend.
//!
//! ## Connection settings
//!
//! [`ConnectionConfig`] can be built three ways:
//! - In code, starting from [`ConnectionConfig::new`]
//! - From a connection string: `Host=srv;Port=5252;UserID=DOM\bob;Password=...;`
//! - From a TOML file, by default `~/.config/worklist/connection.toml`
//!
//! ```toml
//! host = "workflow.example.com"
//! port = 5252
//! user_id = "DENALLIX\\bob"
//! password = "secret"
//! security_label = "K2"
//! ```
//!
//! ## Engine seed
//!
//! [`seed::EngineSeed`] describes users, reporting lines, delegations and
//! process definitions for provisioning the bundled reference engine.

pub mod seed;

pub use seed::{ActionDefinition, ActivityDefinition, EngineSeed, FieldDefinition, ProcessDefinition};

use crate::models::{DEFAULT_SECURITY_LABEL, Identity};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Default workflow server port.
pub const DEFAULT_PORT: u16 = 5252;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Settings for opening a [`Session`](crate::Session).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server name, or the DNS entry of the server farm
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Account to connect as, without its security label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Validate the credentials against the security provider
    #[serde(default = "default_true")]
    pub authenticate: bool,

    /// False only when cached security credentials are in use
    #[serde(default = "default_true")]
    pub is_primary_login: bool,

    /// Label of the security provider the account belongs to
    #[serde(default = "default_security_label")]
    pub security_label: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_security_label() -> String {
    DEFAULT_SECURITY_LABEL.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl ConnectionConfig {
    /// Settings for `host` on the default port with no credentials.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            user_id: None,
            password: None,
            authenticate: true,
            is_primary_login: true,
            security_label: default_security_label(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Set the account and password to connect with.
    pub fn with_credentials(mut self, user_id: impl Into<String>, password: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_security_label(mut self, label: impl Into<String>) -> Self {
        self.security_label = label.into();
        self
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The identity the credentials name, if any.
    pub fn identity(&self) -> Result<Option<Identity>> {
        self.user_id
            .as_deref()
            .map(|user| Identity::parse(user, &self.security_label))
            .transpose()
    }

    /// Check that the settings can be used to connect.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be greater than zero".to_string()));
        }
        if self.security_label.trim().is_empty() {
            return Err(Error::Config("security label cannot be empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config("timeout must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Parse a `Key=Value;` connection string.
    ///
    /// Keys are case-insensitive: `Host`, `Port`, `UserID`, `Password`,
    /// `Authenticate`, `IsPrimaryLogin`, `SecurityLabelName`, `Timeout`.
    pub fn parse_connection_string(s: &str) -> Result<Self> {
        let mut config = Self::new("");
        let mut saw_host = false;

        for part in s.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| {
                Error::Config(format!("expected Key=Value in connection string, got: {}", part))
            })?;
            let value = value.trim();
            match key.trim().to_lowercase().as_str() {
                "host" | "server" => {
                    config.host = value.to_string();
                    saw_host = true;
                }
                "port" => {
                    config.port = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid port: {}", value)))?;
                }
                "userid" | "user id" | "user" => config.user_id = Some(value.to_string()),
                "password" => config.password = Some(value.to_string()),
                "authenticate" => config.authenticate = parse_bool(key, value)?,
                "isprimarylogin" => config.is_primary_login = parse_bool(key, value)?,
                "securitylabelname" | "securitylabel" => {
                    config.security_label = value.to_string()
                }
                "timeout" => {
                    config.timeout_secs = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid timeout: {}", value)))?;
                }
                other => {
                    return Err(Error::Config(format!(
                        "unknown connection string key: {}",
                        other
                    )));
                }
            }
        }

        if !saw_host {
            return Err(Error::Config("connection string has no Host".to_string()));
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse settings from TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load settings from the default location, if the file exists.
    pub fn load_default() -> Result<Option<Self>> {
        let Some(path) = default_config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::from_file(&path).map(Some)
    }

    /// Serialize settings to TOML. The password is included.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(Error::Config(format!("invalid boolean for {}: {}", key.trim(), value))),
    }
}

/// `~/.config/worklist/connection.toml`, when a config directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("worklist").join("connection.toml"))
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user_id", &self.user_id)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("authenticate", &self.authenticate)
            .field("is_primary_login", &self.is_primary_login)
            .field("security_label", &self.security_label)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Renders the connection string form accepted by
/// [`ConnectionConfig::parse_connection_string`].
impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Host={};Port={};", self.host, self.port)?;
        if let Some(user) = &self.user_id {
            write!(f, "UserID={};", user)?;
        }
        if let Some(password) = &self.password {
            write!(f, "Password={};", password)?;
        }
        write!(
            f,
            "Authenticate={};IsPrimaryLogin={};SecurityLabelName={};Timeout={};",
            self.authenticate, self.is_primary_login, self.security_label, self.timeout_secs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_connection_string() {
        let config = ConnectionConfig::parse_connection_string(
            "Host=wf01;Port=5555;UserID=DENALLIX\\bob;Password=pw;Authenticate=true;IsPrimaryLogin=false;SecurityLabelName=AD",
        )
        .unwrap();
        assert_eq!(config.host, "wf01");
        assert_eq!(config.port, 5555);
        assert_eq!(config.user_id.as_deref(), Some("DENALLIX\\bob"));
        assert_eq!(config.password.as_deref(), Some("pw"));
        assert!(config.authenticate);
        assert!(!config.is_primary_login);
        assert_eq!(config.security_label, "AD");
        assert_eq!(
            config.identity().unwrap(),
            Some(Identity::new("AD", "DENALLIX\\bob"))
        );
    }

    #[test]
    fn test_connection_string_defaults() {
        let config = ConnectionConfig::parse_connection_string("host=localhost").unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.security_label, "K2");
        assert!(config.authenticate);
        assert_eq!(config.identity().unwrap(), None);
    }

    #[test]
    fn test_connection_string_errors() {
        assert!(ConnectionConfig::parse_connection_string("Port=5252").is_err());
        assert!(ConnectionConfig::parse_connection_string("Host=a;Port=x").is_err());
        assert!(ConnectionConfig::parse_connection_string("Host=a;Colour=blue").is_err());
        assert!(ConnectionConfig::parse_connection_string("Host=a;Authenticate=maybe").is_err());
        assert!(ConnectionConfig::parse_connection_string("Host=a;garbage").is_err());
    }

    #[test]
    fn test_display_roundtrips() {
        let config = ConnectionConfig::new("wf01")
            .with_port(6000)
            .with_credentials("DENALLIX\\bob", "pw");
        let parsed = ConnectionConfig::parse_connection_string(&config.to_string()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ConnectionConfig::new("wf01").with_credentials("bob", "hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[redacted]"));
    }

    #[test]
    fn test_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("connection.toml");
        std::fs::write(
            &path,
            "host = \"wf01\"\nuser_id = 'DENALLIX\\bob'\npassword = \"pw\"\n",
        )
        .unwrap();

        let config = ConnectionConfig::from_file(&path).unwrap();
        assert_eq!(config.host, "wf01");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.user_id.as_deref(), Some("DENALLIX\\bob"));
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_toml_validation() {
        assert!(matches!(
            ConnectionConfig::from_toml_str("host = \"\""),
            Err(Error::Config(_))
        ));
        assert!(ConnectionConfig::from_toml_str("port = 1").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ConnectionConfig::new("wf01").with_credentials("bob", "pw");
        let toml = config.to_toml_string().unwrap();
        assert_eq!(ConnectionConfig::from_toml_str(&toml).unwrap(), config);
    }
}
