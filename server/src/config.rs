use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::time::Duration;

use crate::chat::{ChatSettings, DenialPolicy};

/// Courier real-time chat relay
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "courier-server", version, about = "Courier real-time chat relay")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "COURIER_PORT", default_value = "1984")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "COURIER_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./courier.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "COURIER_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "COURIER_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// How long a cached conversation snapshot stays valid, in milliseconds
    #[arg(long, env = "COURIER_CACHE_TTL_MS", default_value = "5000")]
    pub cache_ttl_ms: u64,

    /// Window for coalescing conversation-list notifications, in milliseconds
    #[arg(long, env = "COURIER_DEBOUNCE_MS", default_value = "100")]
    pub debounce_ms: u64,

    /// Reply to refused events with an `error` event instead of dropping them
    #[arg(long, env = "COURIER_EXPLICIT_DENIALS")]
    pub explicit_denials: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1984,
            bind_address: "0.0.0.0".to_string(),
            config: "./courier.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            cache_ttl_ms: 5000,
            debounce_ms: 100,
            explicit_denials: false,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (COURIER_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(std::env::args_os())
    }

    /// Same as `load`, with an explicit argument list (first item is the
    /// binary name).
    pub fn load_from<I, T>(args: I) -> Result<Self, figment::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Config::command().get_matches_from(args);
        let cli = Config::from_arg_matches(&matches).map_err(|e| e.to_string())?;
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("COURIER_"))
            .merge(Serialized::defaults(explicit_args(&cli, &matches)))
            .extract()
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            debounce: Duration::from_millis(self.debounce_ms),
            denials: if self.explicit_denials {
                DenialPolicy::Explicit
            } else {
                DenialPolicy::Silent
            },
        }
    }
}

/// Only the keys the user actually set, so clap's defaults do not shadow
/// the TOML layer.
fn explicit_args(cli: &Config, matches: &ArgMatches) -> serde_json::Map<String, serde_json::Value> {
    let Ok(serde_json::Value::Object(mut values)) = serde_json::to_value(cli) else {
        return serde_json::Map::new();
    };
    values.retain(|key, _| {
        matches!(
            matches.value_source(key),
            Some(ValueSource::CommandLine | ValueSource::EnvVariable)
        )
    });
    values
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Courier Chat Relay Configuration
# Place this file at ./courier.toml or specify with --config <path>
# All settings can be overridden via environment variables (COURIER_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 1984)
# port = 1984

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for SQLite database and JWT signing key
# data_dir = "./data"

# ---- Chat ----

# Lifetime of a cached conversation snapshot in milliseconds (default: 5000)
# cache_ttl_ms = 5000

# Window in milliseconds in which conversation-list updates for the same
# user are merged into one conversations_updated event (default: 100)
# debounce_ms = 100

# Refused events (not a participant, unknown conversation, bad request)
# are dropped silently by default. Set to true to answer them with an
# error event carrying 403, 404 or 400.
# explicit_denials = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn toml_file_applies_without_flags() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "courier.toml",
                r#"
                port = 4000
                debounce_ms = 250
                explicit_denials = true
                "#,
            )?;

            let config = Config::load_from(["courier-server"])?;

            assert_eq!(config.port, 4000);
            assert_eq!(config.debounce_ms, 250);
            assert_eq!(config.cache_ttl_ms, 5000);

            let settings = config.chat_settings();
            assert_eq!(settings.debounce, Duration::from_millis(250));
            assert_eq!(settings.denials, DenialPolicy::Explicit);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_file_and_flags_override_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "courier.toml",
                r#"
                port = 4000
                debounce_ms = 250
                "#,
            )?;
            jail.set_env("COURIER_PORT", "5000");

            let config = Config::load_from(["courier-server"])?;
            assert_eq!(config.port, 5000);
            assert_eq!(config.debounce_ms, 250);

            let config = Config::load_from(["courier-server", "--port", "6000"])?;
            assert_eq!(config.port, 6000);
            assert_eq!(config.debounce_ms, 250);
            Ok(())
        });
    }

    #[test]
    fn alternate_config_path_is_read() {
        Jail::expect_with(|jail| {
            jail.create_file("other.toml", "cache_ttl_ms = 1200")?;

            let config = Config::load_from(["courier-server", "--config", "other.toml"])?;
            assert_eq!(config.cache_ttl_ms, 1200);
            assert_eq!(config.config, "other.toml");
            Ok(())
        });
    }

    #[test]
    fn template_mentions_every_chat_key() {
        let template = generate_config_template();
        for key in ["cache_ttl_ms", "debounce_ms", "explicit_denials", "data_dir"] {
            assert!(template.contains(key), "template is missing {}", key);
        }
    }
}
