//! Configuration file structures for the edubot.
//!
//! The configuration is a YAML file. Any value can be overridden with an
//! environment variable prefixed by `EDUBOT_`, using `__` to descend into a
//! section (`EDUBOT_MATRIX__USER_TOKEN` overrides `matrix.user_token`).
//!
//! # Configuration File Format
//!
//! ```yaml
//! # Prompt handed to the chat personality. Not used during bootstrap.
//! original_prompt: "You are a friendly assistant."
//!
//! # Users with admin rights in every room. Not used during bootstrap.
//! admins:
//!   - "@admin:example.com"
//!
//! matrix:
//!   user_id: "@edubot:example.com"
//!   # Either a password or an access token. The token wins if both are set.
//!   user_password: "secret"
//!   user_token: ""
//!   homeserver_url: "https://matrix.example.com"
//!   # Reusing a device ID that already has encryption keys on the server with a
//!   # fresh store makes encrypted messages undecryptable, so it is refused.
//!   device_id: "EDUBOT"
//!   device_name: "edubot"
//!
//! storage:
//!   # sqlite://<path> or postgres://<user>:<pass>@<host>/<db>?sslmode=<mode>
//!   database: "sqlite://bot.db"
//!   # Sync token, login session and encryption keys
//!   store_path: "./store"
//!
//! logging:
//!   level: INFO
//!   file_logging:
//!     enabled: false
//!     filepath: edubot.log
//!   console_logging:
//!     enabled: true
//! ```

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{Context, bail};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use log::LevelFilter;
use serde::Deserialize;

use crate::matrix::BotIdentity;

/// Prefix of the environment variables overriding configuration values.
const ENV_PREFIX: &str = "EDUBOT_";

/// Root configuration structure.
///
/// The whole structure is passed by reference to the components that need it;
/// nothing is kept in global state.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Prompt given to the chat personality
    pub original_prompt: String,
    /// Matrix IDs of the global bot administrators
    pub admins: Vec<String>,
    /// Matrix account configuration
    pub matrix: Matrix,
    /// Local storage configuration
    pub storage: Storage,
    /// Logging configuration, consumed by the binary only
    #[serde(default)]
    pub logging: Logging,
    /// Bootstrap tuning
    #[serde(default)]
    pub bootstrap: Bootstrap,
}

/// Matrix account configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Matrix {
    /// Fully qualified Matrix user ID, e.g. `@edubot:example.com`.
    pub user_id: String,

    /// Account password, used for an interactive login.
    #[serde(default)]
    pub user_password: Option<String>,

    /// Access token of an existing login. Takes precedence over the password.
    #[serde(default)]
    pub user_token: Option<String>,

    /// Base URL of the homeserver client API.
    pub homeserver_url: String,

    /// Device ID this client runs as.
    ///
    /// When empty, the homeserver picks one at first login and the store
    /// remembers it for the next runs.
    #[serde(default)]
    pub device_id: Option<String>,

    /// Display name given to a device created by a password login.
    #[serde(default)]
    pub device_name: Option<String>,
}

/// Local storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    /// Connection string of the relational database.
    pub database: String,
    /// Directory holding the session file, the sync token and the encryption store.
    pub store_path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Logging {
    /// Log level name (`ERROR`, `WARN`, `INFO`, `DEBUG`, `TRACE`).
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file_logging: FileLogging,
    #[serde(default)]
    pub console_logging: ConsoleLogging,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileLogging {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_filepath")]
    pub filepath: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleLogging {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Bootstrap tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct Bootstrap {
    /// Upper bound in seconds for opening the store and for each homeserver request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_filepath() -> String {
    "edubot.log".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: default_log_level(),
            file_logging: FileLogging::default(),
            console_logging: ConsoleLogging::default(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        FileLogging {
            enabled: false,
            filepath: default_log_filepath(),
        }
    }
}

impl Default for ConsoleLogging {
    fn default() -> Self {
        ConsoleLogging { enabled: true }
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Bootstrap {
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Bootstrap {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Logging {
    /// Parses the configured level name, case-insensitively.
    pub fn level_filter(&self) -> anyhow::Result<LevelFilter> {
        LevelFilter::from_str(&self.level)
            .with_context(|| format!("logging.level '{}' is not a log level", self.level))
    }
}

impl Config {
    /// Loads the configuration from a YAML file, applies `EDUBOT_` environment
    /// overrides and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist, cannot be deserialized, or
    /// holds invalid values (see [`Config::validate`]).
    pub fn load(path: &str) -> anyhow::Result<Config> {
        if !Path::new(path).is_file() {
            bail!("config file '{}' does not exist", path);
        }

        let config: Config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("failed to parse config file '{}'", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Checks the values serde cannot check on its own.
    pub fn validate(&self) -> anyhow::Result<()> {
        BotIdentity::from_config(&self.matrix)?;

        if self.storage.store_path.trim().is_empty() {
            bail!("storage.store_path must not be empty");
        }
        if self.bootstrap.timeout_secs == 0 {
            bail!("bootstrap.timeout_secs must be greater than zero");
        }
        self.logging.level_filter()?;

        Ok(())
    }
}
