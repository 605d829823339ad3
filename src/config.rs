use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::idempotency::{DEFAULT_TTL_MS, DEFAULT_WINDOW_SECS};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub toggles: TogglesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_nats_url")]
    pub nats_url: String,
}

fn default_port() -> u16 {
    3004
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            nats_url: default_nats_url(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdempotencyConfig {
    /// Width of the order dedup window in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,
    /// Lifetime of a cached submission result.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: i64,
    /// Interval of the background expiry sweep.
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,
}

fn default_window_secs() -> i64 {
    DEFAULT_WINDOW_SECS
}

fn default_ttl_ms() -> i64 {
    DEFAULT_TTL_MS
}

fn default_sweep_secs() -> u64 {
    30
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            ttl_ms: default_ttl_ms(),
            sweep_secs: default_sweep_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TogglesConfig {
    /// Bot ids seeded at startup; more can register at runtime.
    #[serde(default)]
    pub bots: Vec<String>,
    /// Risk rail ids; this set is fixed after startup.
    #[serde(default = "default_rails")]
    pub rails: Vec<String>,
}

fn default_rails() -> Vec<String> {
    vec![
        "drawdown".to_string(),
        "exposure".to_string(),
        "staleness".to_string(),
    ]
}

impl Default for TogglesConfig {
    fn default() -> Self {
        Self {
            bots: Vec::new(),
            rails: default_rails(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let s = Config::builder()
            // 1. Global config from ~/.stagalgo/config.{toml,json,ini}
            .add_source(File::with_name(&format!("{}/.stagalgo/config", home)).required(false))
            // 2. Project config from config/config.*
            .add_source(File::with_name("config/config").required(false))
            // 3. Local overrides (not checked in)
            .add_source(File::with_name("config/local").required(false))
            // 4. Environment overrides, e.g. STAG_CONTROL__PORT
            .add_source(Environment::with_prefix("STAG").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
