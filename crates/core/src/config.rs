use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `EXPERIMENT_ENGINE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Engine-wide knobs. Per-experiment settings live in `ExperimentConfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on every storage call.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_monte_carlo_draws")]
    pub monte_carlo_draws: usize,
    #[serde(default = "default_credible_interval")]
    pub credible_interval: f64,
    #[serde(default = "default_binary_metrics")]
    pub binary_metrics: Vec<String>,
    /// Report `conclude_no_winner` once total assignments reach
    /// `min_sample_size * variants * factor` without a winner.
    #[serde(default = "default_no_winner_sample_factor")]
    pub no_winner_sample_factor: f64,
    /// Compare-and-swap attempts on the experiment record before giving up.
    #[serde(default = "default_max_update_attempts")]
    pub max_update_attempts: usize,
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_db")]
    pub database: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_store_timeout_ms() -> u64 {
    250
}
fn default_monte_carlo_draws() -> usize {
    20_000
}
fn default_credible_interval() -> f64 {
    0.95
}
fn default_binary_metrics() -> Vec<String> {
    ["click", "conversion", "open", "signup"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_no_winner_sample_factor() -> f64 {
    1.0
}
fn default_max_update_attempts() -> usize {
    8
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_key_prefix() -> String {
    "xp".to_string()
}
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_clickhouse_db() -> String {
    "experiments".to_string()
}
fn default_batch_size() -> usize {
    5000
}
fn default_flush_interval_ms() -> u64 {
    1000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout_ms(),
            monte_carlo_draws: default_monte_carlo_draws(),
            credible_interval: default_credible_interval(),
            binary_metrics: default_binary_metrics(),
            no_winner_sample_factor: default_no_winner_sample_factor(),
            max_update_attempts: default_max_update_attempts(),
            rng_seed: None,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_clickhouse_url(),
            database: default_clickhouse_db(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("EXPERIMENT_ENGINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("engine.binary_metrics")
                .with_list_parse_key("store.redis.urls"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
