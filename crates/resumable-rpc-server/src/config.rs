use std::{path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use config::{Config, Environment, File};
use resumable_rpc_core::EventStoreConfig;
use resumable_rpc_session::CleanupConfig;
use resumable_rpc_transport::{CorsOrigins, SecurityConfig, TransportConfig};
use serde::Deserialize;

const ENV_PREFIX: &str = "RESUMABLE_RPC";

/// A single value or a list, so `cors_origins = "*"` and
/// `cors_origins = ["https://a", "https://b"]` both parse.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    /// Flatten into a list. A single value may itself be comma separated.
    pub fn into_vec(self) -> Vec<String> {
        let values = match self {
            Self::One(value) => value.split(',').map(str::to_owned).collect(),
            Self::Many(values) => values,
        };
        values
            .into_iter()
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub keep_alive_secs: u64,
    pub max_events: usize,
    pub max_event_age_minutes: u64,
    pub event_sweep_interval_minutes: u64,
    pub idle_session_expiry_hours: u64,
    pub session_sweep_interval_minutes: u64,
    #[serde(default)]
    pub api_key: Option<String>,
    pub cors_origins: OneOrMany,
    pub cors_credentials: bool,
    pub production: bool,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            path: "/mcp".to_string(),
            keep_alive_secs: 15,
            max_events: 1000,
            max_event_age_minutes: 60,
            event_sweep_interval_minutes: 5,
            idle_session_expiry_hours: 24,
            session_sweep_interval_minutes: 60,
            api_key: None,
            cors_origins: OneOrMany::One("*".to_string()),
            cors_credentials: false,
            production: false,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults, then the optional TOML file, then `RESUMABLE_RPC_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("host", "127.0.0.1")?
            .set_default("port", 3000)?
            .set_default("path", "/mcp")?
            .set_default("keep_alive_secs", 15)?
            .set_default("max_events", 1000)?
            .set_default("max_event_age_minutes", 60)?
            .set_default("event_sweep_interval_minutes", 5)?
            .set_default("idle_session_expiry_hours", 24)?
            .set_default("session_sweep_interval_minutes", 60)?
            .set_default("cors_origins", "*")?
            .set_default("cors_credentials", false)?
            .set_default("production", false)?
            .set_default("log_level", "info")?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(env);

        let config = builder
            .build()
            .context("Failed to read server configuration")?;
        let server_config: Self = config
            .try_deserialize()
            .context("Invalid server configuration")?;
        Ok(server_config)
    }

    /// Socket address string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Map onto the transport's settings.
    pub fn transport_config(&self) -> Result<TransportConfig> {
        ensure!(self.path.starts_with('/'), "path must start with '/': {}", self.path);
        ensure!(self.keep_alive_secs > 0, "keep_alive_secs must be positive");
        ensure!(self.max_events > 0, "max_events must be positive");
        ensure!(
            self.event_sweep_interval_minutes > 0 && self.session_sweep_interval_minutes > 0,
            "sweep intervals must be positive"
        );

        Ok(TransportConfig {
            path: self.path.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            events: EventStoreConfig {
                max_events: self.max_events,
                max_event_age: minutes(self.max_event_age_minutes),
                // The cleanup scheduler owns the event sweep.
                sweep_interval: None,
            },
            cleanup: CleanupConfig {
                session_sweep_interval: minutes(self.session_sweep_interval_minutes),
                idle_expiry: minutes(self.idle_session_expiry_hours.saturating_mul(60)),
                event_sweep_interval: minutes(self.event_sweep_interval_minutes),
            },
            security: SecurityConfig {
                api_key: self.api_key.clone().filter(|k| !k.is_empty()),
                cors_origins: CorsOrigins::from_values(self.cors_origins.clone().into_vec()),
                cors_credentials: self.cors_credentials,
                production: self.production,
            },
        })
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("cors_origins")
}

const fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs};

    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        environment().source(Some(source))
    }

    fn write_config(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "resumable-rpc-{name}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let cfg = ServerConfig::load_with(None, env(&[])).unwrap();
        let defaults = ServerConfig::default();

        assert_eq!(cfg.bind_addr(), defaults.bind_addr());
        assert_eq!(cfg.path, "/mcp");
        assert_eq!(cfg.max_events, 1000);
        assert_eq!(cfg.api_key, None);
        assert_eq!(cfg.cors_origins.into_vec(), vec!["*"]);

        let transport = assert_ok!(defaults.transport_config());
        assert_eq!(transport.events.max_event_age, Duration::from_secs(3600));
        assert_eq!(transport.cleanup.idle_expiry, Duration::from_secs(24 * 3600));
        assert_eq!(transport.security.cors_origins, CorsOrigins::Any);
    }

    #[test]
    fn test_file_then_environment() {
        let path = write_config(
            "layers",
            "port = 8080\n\
             max_events = 50\n\
             api_key = \"from-file\"\n\
             cors_origins = [\"https://a.example.org\", \"https://b.example.org\"]\n",
        );

        let cfg = ServerConfig::load_with(
            Some(&path),
            env(&[("RESUMABLE_RPC_PORT", "9090"), ("RESUMABLE_RPC_PRODUCTION", "true")]),
        )
        .unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.max_events, 50);
        assert!(cfg.production);
        assert_eq!(cfg.api_key.as_deref(), Some("from-file"));
        assert_eq!(
            cfg.cors_origins.into_vec(),
            vec!["https://a.example.org", "https://b.example.org"]
        );
    }

    #[test]
    fn test_cors_origins_from_environment_list() {
        let cfg = ServerConfig::load_with(
            None,
            env(&[("RESUMABLE_RPC_CORS_ORIGINS", "https://a.example.org,https://b.example.org")]),
        )
        .unwrap();

        let transport = cfg.transport_config().unwrap();
        assert_eq!(
            transport.security.cors_origins,
            CorsOrigins::List(vec![
                "https://a.example.org".to_string(),
                "https://b.example.org".to_string(),
            ])
        );
    }

    #[test]
    fn test_api_key_from_environment_enables_auth() {
        let key = "k".repeat(40);
        let cfg = ServerConfig::load_with(None, env(&[("RESUMABLE_RPC_API_KEY", key.as_str())])).unwrap();

        assert_eq!(cfg.api_key.as_deref(), Some(key.as_str()));
        assert_eq!(cfg.transport_config().unwrap().security.api_key, Some(key));
    }

    #[test]
    fn test_double_underscore_prefix_is_not_read() {
        let cfg = ServerConfig::load_with(None, env(&[("RESUMABLE_RPC__PORT", "9090")])).unwrap();
        assert_eq!(cfg.port, 3000);
    }

    #[test]
    fn test_empty_api_key_disables_auth() {
        let cfg = ServerConfig {
            api_key: Some(String::new()),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.transport_config().unwrap().security.api_key, None);
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let cfg = ServerConfig {
            event_sweep_interval_minutes: 0,
            ..ServerConfig::default()
        };
        assert_err!(cfg.transport_config());

        let cfg = ServerConfig {
            path: "mcp".to_string(),
            ..ServerConfig::default()
        };
        assert_err!(cfg.transport_config());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("resumable-rpc-does-not-exist.toml");
        assert_err!(ServerConfig::load_with(Some(&path), env(&[])));
    }
}
