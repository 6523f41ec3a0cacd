//! Application configuration, loaded from the environment (with an optional
//! local `.env`), following the same `Config::from_env` convention this
//! service's configuration has always used: each key is read with
//! `std::env::var` and parsed with a documented default, never hard-failing
//! on a missing variable.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: String,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, initial call included (default 4: 1 initial + 3 retries).
    pub max_attempts: u32,
    pub base_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub log_level: String,
    pub store: StoreConfig,
    pub trade_service_base_url: String,
    pub output_dir: String,
    pub cli_command_template: String,
    pub retry: RetryConfig,
    pub file_cleanup_enabled: bool,
    pub metrics_enabled: bool,
    pub tracing_enabled: bool,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let store = StoreConfig {
            host: env_or("STORE_HOST", "localhost"),
            port: env_parsed("STORE_PORT", 5432),
            name: env_or("STORE_NAME", "./allocations.db"),
            user: env_or("STORE_USER", ""),
            password: env_or("STORE_PASSWORD", ""),
            ssl_mode: env_or("STORE_SSL_MODE", "disable"),
        };

        let retry = RetryConfig {
            // additional attempts beyond the initial call, plus the initial call itself
            max_attempts: env_parsed::<u32>("RETRY_MAX_ATTEMPTS", 3) + 1,
            base_delay: Duration::from_millis(env_parsed("RETRY_BASE_DELAY_MS", 1000)),
        };

        Ok(Self {
            server_port: env_parsed("SERVER_PORT", 8080),
            log_level: env_or("LOG_LEVEL", "info"),
            store,
            trade_service_base_url: env_or(
                "TRADE_SERVICE_BASE_URL",
                "http://localhost:8081",
            ),
            output_dir: env_or("OUTPUT_DIR", "./output"),
            cli_command_template: env_or(
                "CLI_COMMAND_TEMPLATE",
                "portfolio-accounting-cli --file {filename} --dir {output_dir}",
            ),
            retry,
            file_cleanup_enabled: env_parsed("FILE_CLEANUP_ENABLED", false),
            metrics_enabled: env_parsed("METRICS_ENABLED", false),
            tracing_enabled: env_parsed("TRACING_ENABLED", false),
        })
    }
}

/// Command-line overrides for a handful of `Config` keys, layered on top of
/// the environment the same way the existing `route_quality_monitor` binary
/// layers `clap` on top of its environment-driven defaults.
#[derive(Debug, clap::Parser)]
#[command(name = "alloc-pipeline")]
#[command(about = "Allocation pipeline service: ingests trade executions, sends batched transactions")]
pub struct CliArgs {
    /// Listen port (overrides SERVER_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level: trace, debug, info, warn, error (overrides LOG_LEVEL)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Path to a `.env`-style file to load before reading the environment
    #[arg(long)]
    pub config_path: Option<String>,
}

impl Config {
    pub fn apply_cli_overrides(mut self, args: &CliArgs) -> Self {
        if let Some(port) = args.port {
            self.server_port = port;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
        self
    }
}
