//! Runtime configuration.
//!
//! Resolution order, lowest to highest precedence: built-in defaults, the
//! `app` category of `local_settings`, `COUNTER_POS_*` environment variables
//! and finally command-line flags. Stored settings use the same keys as the
//! environment without the prefix (`tax_rate` for `COUNTER_POS_TAX_RATE`).
//! The backend URL may additionally come from the credential store (see
//! [`crate::storage`]); that fallback is applied by the binary.

use std::path::PathBuf;
use std::time::Duration;

use ::config::{Config, ConfigError, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::api::normalize_api_url;
use crate::db::{self, DbState};

pub const SETTINGS_CATEGORY: &str = "app";

pub const ENV_PREFIX: &str = "COUNTER_POS";
pub const ENV_API_URL: &str = "COUNTER_POS_API_URL";
pub const ENV_DATA_DIR: &str = "COUNTER_POS_DATA_DIR";
pub const ENV_TIMEOUT_SECS: &str = "COUNTER_POS_TIMEOUT_SECS";
pub const ENV_TAX_RATE: &str = "COUNTER_POS_TAX_RATE";
pub const ENV_CURRENCY: &str = "COUNTER_POS_CURRENCY";
pub const ENV_REQUIRE_SHIFT: &str = "COUNTER_POS_REQUIRE_SHIFT";

const KEY_API_URL: &str = "api_url";
const KEY_DATA_DIR: &str = "data_dir";
const KEY_TIMEOUT_SECS: &str = "timeout_secs";
const KEY_TAX_RATE: &str = "tax_rate";
const KEY_CURRENCY: &str = "currency";
const KEY_REQUIRE_SHIFT: &str = "require_shift";

const APP_DIR_NAME: &str = "counter-pos";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub api_url: Option<String>,
    pub data_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub default_tax_rate: f64,
    pub currency: String,
    pub require_open_shift: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            data_dir: default_data_dir(),
            request_timeout_secs: 30,
            default_tax_rate: 0.0,
            currency: "USD".to_string(),
            require_open_shift: true,
        }
    }
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_url: Option<String>,
    pub data_dir: Option<PathBuf>,
}

/// Per-user data directory (`%APPDATA%`, `$XDG_DATA_HOME` or
/// `~/.local/share`), falling back to the working directory.
pub fn default_data_dir() -> PathBuf {
    let base = if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
    };
    base.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR_NAME)
}

/// `COUNTER_POS_*` variables of the process environment.
pub fn process_env() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
}

/// Read one layered key. Missing keys are `None`; unparsable values are
/// logged and skipped so one bad entry does not discard the rest.
fn read<T: DeserializeOwned>(layered: &Config, key: &str) -> Option<T> {
    match layered.get::<T>(key) {
        Ok(value) => Some(value),
        Err(ConfigError::NotFound(_)) => None,
        Err(e) => {
            warn!(key, error = %e, "ignoring invalid configuration value");
            None
        }
    }
}

impl AppConfig {
    /// The data directory must be known before the database can be opened,
    /// so it is resolved on its own from flags and the environment.
    pub fn resolve_data_dir(overrides: &ConfigOverrides) -> PathBuf {
        Self::data_dir_from(overrides, process_env())
    }

    fn data_dir_from(overrides: &ConfigOverrides, env: Environment) -> PathBuf {
        overrides
            .data_dir
            .clone()
            .or_else(|| {
                Config::builder()
                    .add_source(env)
                    .build()
                    .ok()
                    .and_then(|layered| read::<String>(&layered, KEY_DATA_DIR))
                    .filter(|dir| !dir.trim().is_empty())
                    .map(PathBuf::from)
            })
            .unwrap_or_else(default_data_dir)
    }

    /// Full resolution against an opened database.
    pub fn load(db: &DbState, overrides: &ConfigOverrides) -> AppConfig {
        let settings = match db.conn.lock() {
            Ok(conn) => db::get_category_settings(&conn, SETTINGS_CATEGORY),
            Err(e) => {
                warn!(error = %e, "database lock poisoned, skipping stored settings");
                Value::Null
            }
        };
        Self::from_sources(&settings, process_env(), overrides)
    }

    /// Layer stored settings, an environment source and command-line
    /// overrides on top of the defaults.
    pub fn from_sources(settings: &Value, env: Environment, overrides: &ConfigOverrides) -> AppConfig {
        let data_dir = Self::data_dir_from(overrides, env.clone());
        let layered = match Self::layered(settings, env, overrides) {
            Ok(layered) => layered,
            Err(e) => {
                warn!(error = %e, "configuration sources unreadable, using defaults");
                return AppConfig {
                    data_dir,
                    ..AppConfig::default()
                };
            }
        };

        let mut config = AppConfig {
            data_dir,
            ..AppConfig::default()
        };
        if let Some(url) = read::<String>(&layered, KEY_API_URL).filter(|u| !u.trim().is_empty()) {
            config.api_url = Some(normalize_api_url(&url));
        }
        match read::<u64>(&layered, KEY_TIMEOUT_SECS) {
            Some(0) => warn!("ignoring zero request timeout"),
            Some(secs) => config.request_timeout_secs = secs,
            None => {}
        }
        match read::<f64>(&layered, KEY_TAX_RATE) {
            Some(rate) if (0.0..1.0).contains(&rate) => config.default_tax_rate = rate,
            Some(rate) => warn!(rate, "ignoring tax rate outside 0..1"),
            None => {}
        }
        if let Some(currency) = read::<String>(&layered, KEY_CURRENCY) {
            if currency.trim().len() == 3 {
                config.currency = currency.trim().to_ascii_uppercase();
            } else {
                warn!(value = %currency, "ignoring invalid currency code");
            }
        }
        if let Some(flag) = read::<bool>(&layered, KEY_REQUIRE_SHIFT) {
            config.require_open_shift = flag;
        }
        config
    }

    fn layered(settings: &Value, env: Environment, overrides: &ConfigOverrides) -> Result<Config, ConfigError> {
        let stored = if settings.is_object() {
            settings.to_string()
        } else {
            "{}".to_string()
        };
        Config::builder()
            .add_source(File::from_str(&stored, FileFormat::Json))
            .add_source(env)
            .set_override_option(
                KEY_API_URL,
                overrides.api_url.clone().filter(|u| !u.trim().is_empty()),
            )?
            .build()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
