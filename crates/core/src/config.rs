use crate::features::{default_churn_features, FeatureSpec};
use crate::types::PartitionId;
use serde::Deserialize;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `CHURN_STREAM__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,
    /// Partitions owned by this node. Empty means all of them.
    #[serde(default)]
    pub partitions: Vec<PartitionId>,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub explain: ExplainConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_urls")]
    pub urls: Vec<String>,
    /// Per-partition stream names are `{stream_prefix}_{partition}`.
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
    /// Per-partition subjects are `{subject_prefix}.{partition}`.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_nats_max_reconnects")]
    pub max_reconnects: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// TTL of cached warehouse features.
    #[serde(default = "default_ttl_secs")]
    pub feature_ttl_secs: u64,
    #[serde(default = "default_local_cache_entries")]
    pub local_cache_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_db")]
    pub database: String,
    #[serde(default = "default_predictions_table")]
    pub predictions_table: String,
    #[serde(default = "default_features_table")]
    pub features_table: String,
    /// Read cold-start features from the warehouse for unseen entities.
    #[serde(default)]
    pub cold_start: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_path")]
    pub artifact_path: String,
    /// Decision threshold. Overrides the artifact's own threshold when set.
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// Exact Shapley enumerates 2^n coalitions; past this it cannot finish
/// inside a scoring timeout.
pub const MAX_EXACT_FEATURES: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct ExplainConfig {
    /// Above this many features the exact Shapley enumeration is replaced by
    /// the two-path approximation.
    #[serde(default = "default_max_exact_features")]
    pub max_exact_features: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Persist only the strongest factors. `None` keeps all of them.
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,
    #[serde(default = "default_lateness_secs")]
    pub lateness_secs: i64,
    /// Entities silent this long (partition event time) are sealed and
    /// compacted to their retained features.
    #[serde(default = "default_dormant_after_secs")]
    pub dormant_after_secs: i64,
    #[serde(default = "default_churn_features")]
    pub features: Vec<FeatureSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    #[serde(default = "default_write_timeout_ms")]
    pub timeout_ms: u64,
    /// Concurrent upserts one partition keeps open during its write stage.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Writes of one partition waiting out a retry backoff beyond which the
    /// partition dispatches nothing new until the queue drains.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Count trigger: a batch closes after this many records.
    #[serde(default = "default_batch_max_events")]
    pub batch_max_events: usize,
    /// Time trigger: a batch closes this long after it opened.
    #[serde(default = "default_batch_max_wait_ms")]
    pub batch_max_wait_ms: u64,
    /// Longest single wait on the source within a batch.
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,
    #[serde(default = "default_scoring_timeout_ms")]
    pub scoring_timeout_ms: u64,
    /// Consecutive scoring failures of one entity-window before escalation.
    #[serde(default = "default_max_scoring_failures")]
    pub max_scoring_failures: u32,
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    /// Also score open windows of entities touched in each batch.
    #[serde(default = "default_score_open_windows")]
    pub score_open_windows: bool,
    /// Pause between failed cycles before recovering.
    #[serde(default = "default_failure_backoff_ms")]
    pub failure_backoff_ms: u64,
    /// Treat an offset gap after the checkpoint as state corruption when the
    /// source guarantees contiguous offsets.
    #[serde(default = "default_strict_offsets")]
    pub strict_offsets: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_partition_count() -> u32 {
    4
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_nats_urls() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}
fn default_stream_prefix() -> String {
    "CHURN_EVENTS".to_string()
}
fn default_subject_prefix() -> String {
    "churn.events".to_string()
}
fn default_nats_max_reconnects() -> usize {
    60
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}
fn default_key_prefix() -> String {
    "churn".to_string()
}
fn default_ttl_secs() -> u64 {
    3600
}
fn default_local_cache_entries() -> usize {
    100_000
}
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_clickhouse_db() -> String {
    "churn".to_string()
}
fn default_predictions_table() -> String {
    "churn_predictions".to_string()
}
fn default_features_table() -> String {
    "churn_features".to_string()
}
fn default_model_path() -> String {
    "/models/churn_logit.json".to_string()
}
fn default_max_exact_features() -> usize {
    12
}
fn default_tolerance() -> f64 {
    1e-6
}
fn default_window_secs() -> i64 {
    86_400
}
fn default_lateness_secs() -> i64 {
    3_600
}
fn default_dormant_after_secs() -> i64 {
    7 * 86_400
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}
fn default_write_timeout_ms() -> u64 {
    2_000
}
fn default_max_in_flight() -> usize {
    8
}
fn default_max_pending() -> usize {
    2
}
fn default_batch_max_events() -> usize {
    500
}
fn default_batch_max_wait_ms() -> u64 {
    1_000
}
fn default_poll_wait_ms() -> u64 {
    200
}
fn default_scoring_timeout_ms() -> u64 {
    250
}
fn default_max_scoring_failures() -> u32 {
    3
}
fn default_max_recovery_attempts() -> u32 {
    3
}
fn default_score_open_windows() -> bool {
    true
}
fn default_failure_backoff_ms() -> u64 {
    1_000
}
fn default_strict_offsets() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: default_nats_urls(),
            stream_prefix: default_stream_prefix(),
            subject_prefix: default_subject_prefix(),
            max_reconnects: default_nats_max_reconnects(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
            key_prefix: default_key_prefix(),
            feature_ttl_secs: default_ttl_secs(),
            local_cache_entries: default_local_cache_entries(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_clickhouse_db(),
            predictions_table: default_predictions_table(),
            features_table: default_features_table(),
            cold_start: false,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            artifact_path: default_model_path(),
            threshold: None,
        }
    }
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            max_exact_features: default_max_exact_features(),
            tolerance: default_tolerance(),
            top_k: None,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            lateness_secs: default_lateness_secs(),
            dormant_after_secs: default_dormant_after_secs(),
            features: default_churn_features(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            timeout_ms: default_write_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            max_pending: default_max_pending(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_max_events: default_batch_max_events(),
            batch_max_wait_ms: default_batch_max_wait_ms(),
            poll_wait_ms: default_poll_wait_ms(),
            scoring_timeout_ms: default_scoring_timeout_ms(),
            max_scoring_failures: default_max_scoring_failures(),
            max_recovery_attempts: default_max_recovery_attempts(),
            score_open_windows: default_score_open_windows(),
            failure_backoff_ms: default_failure_backoff_ms(),
            strict_offsets: default_strict_offsets(),
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

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            partition_count: default_partition_count(),
            partitions: Vec::new(),
            api: ApiConfig::default(),
            nats: NatsConfig::default(),
            redis: RedisConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            model: ModelConfig::default(),
            explain: ExplainConfig::default(),
            aggregator: AggregatorConfig::default(),
            writer: WriterConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file, then environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CHURN_STREAM")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("nats.urls")
                .with_list_parse_key("redis.urls")
                .with_list_parse_key("partitions"),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let fail = |msg: &str| Err(config::ConfigError::Message(msg.to_string()));
        if self.partition_count == 0 {
            return fail("partition_count must be at least 1");
        }
        if let Some(p) = self.partitions.iter().find(|p| **p >= self.partition_count) {
            return Err(config::ConfigError::Message(format!(
                "partition {p} is outside 0..{}",
                self.partition_count
            )));
        }
        if self.aggregator.window_secs <= 0 {
            return fail("aggregator.window_secs must be positive");
        }
        if self.aggregator.lateness_secs < 0 {
            return fail("aggregator.lateness_secs must not be negative");
        }
        if self.aggregator.dormant_after_secs
            < self.aggregator.window_secs.saturating_add(self.aggregator.lateness_secs)
        {
            return fail("aggregator.dormant_after_secs must cover window_secs + lateness_secs");
        }
        if self.writer.max_attempts == 0 {
            return fail("writer.max_attempts must be at least 1");
        }
        if self.writer.max_in_flight == 0 {
            return fail("writer.max_in_flight must be at least 1");
        }
        if self.writer.max_pending == 0 || self.writer.max_pending > self.writer.max_in_flight {
            return fail("writer.max_pending must be within 1..=writer.max_in_flight");
        }
        if self.explain.max_exact_features > MAX_EXACT_FEATURES {
            return Err(config::ConfigError::Message(format!(
                "explain.max_exact_features must not exceed {MAX_EXACT_FEATURES}"
            )));
        }
        if self.orchestrator.batch_max_events == 0 {
            return fail("orchestrator.batch_max_events must be at least 1");
        }
        if let Some(t) = self.model.threshold {
            if !(0.0..=1.0).contains(&t) {
                return fail("model.threshold must be within [0, 1]");
            }
        }
        Ok(())
    }

    /// Partitions this node should run.
    pub fn assigned_partitions(&self) -> Vec<PartitionId> {
        if self.partitions.is_empty() {
            (0..self.partition_count).collect()
        } else {
            let mut assigned = self.partitions.clone();
            assigned.sort_unstable();
            assigned.dedup();
            assigned
        }
    }
}
