//! Runtime configuration
//!
//! Built once in `main` from an optional YAML file plus CLI overrides, then
//! handed to [`crate::db::Store::open`] and [`crate::serve::start`].
//!
//! ```yaml
//! database:
//!   database: netstat.db
//!   pool_size: 8
//! server:
//!   bind: 0.0.0.0
//!   port: 8080
//!   workers: 4
//! schema_check: startup
//! log_level: info
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Config file picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "netstat-dash.yaml";

const DEFAULT_DB_PATH: &str = "netstat.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

/// Connection options for the Record Store.
///
/// The store is SQLite, so `database` is a file path. The network options are
/// accepted so one config file can describe a remote deployment, but only
/// `database` and `pool_size` affect the connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub tls_mode: TlsMode,
    pub pool_size: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            database: DEFAULT_DB_PATH.to_string(),
            user: None,
            password: None,
            tls_mode: TlsMode::default(),
            pool_size: 5,
        }
    }
}

impl DbConfig {
    /// Options that were set but that the SQLite backend does not use.
    pub fn ignored_options(&self) -> Vec<&'static str> {
        let mut ignored = Vec::new();
        if self.host.is_some() {
            ignored.push("host");
        }
        if self.port.is_some() {
            ignored.push("port");
        }
        if self.user.is_some() {
            ignored.push("user");
        }
        if self.password.is_some() {
            ignored.push("password");
        }
        if self.tls_mode != TlsMode::default() {
            ignored.push("tls_mode");
        }
        ignored
    }

    /// One-line description with the password masked.
    pub fn describe(&self) -> String {
        format!(
            "database={} host={} port={} user={} password={} tls_mode={:?} pool_size={}",
            self.database,
            self.host.as_deref().unwrap_or("-"),
            self.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            self.user.as_deref().unwrap_or("-"),
            if self.password.is_some() { "****" } else { "-" },
            self.tls_mode,
            self.pool_size,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3001,
            workers: 4,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// When the table structure is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchemaCheck {
    /// Once, before the server accepts requests.
    #[default]
    Startup,
    /// Before every API request.
    Request,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DbConfig,
    pub server: ServerConfig,
    pub schema_check: SchemaCheck,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DbConfig::default(),
            server: ServerConfig::default(),
            schema_check: SchemaCheck::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Load config from `path`, or from [`DEFAULT_CONFIG_FILE`] if it exists,
/// or fall back to defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let display = path.display().to_string();
    let s = fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: display.clone(), source })?;
    parse_config(&s).map_err(|source| ConfigError::Parse { path: display, source })
}

pub fn parse_config(s: &str) -> Result<Config, serde_yaml::Error> {
    // An empty file deserializes as null rather than an empty map
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(s)
}
