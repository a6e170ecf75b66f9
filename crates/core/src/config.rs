use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CRM_ENGINE__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub segmentation: SegmentationConfig,
    #[serde(default)]
    pub lookalike: LookalikeConfig,
    #[serde(default)]
    pub campaigns: CampaignConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentationConfig {
    /// Upper bound on rows materialized for in-memory rule evaluation.
    #[serde(default = "default_max_materialized_rows")]
    pub max_materialized_rows: usize,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_max_rule_depth")]
    pub max_rule_depth: usize,
    #[serde(default = "default_preview_sample_size")]
    pub preview_sample_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookalikeConfig {
    #[serde(default = "default_high_value_min_spend")]
    pub high_value_min_spend: f64,
    /// Maximum number of reference customers fed into synthesis.
    #[serde(default = "default_reference_limit")]
    pub reference_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignConfig {
    #[serde(default = "default_pacing_delay_ms")]
    pub pacing_delay_ms: u64,
    #[serde(default = "default_simulated_success_rate")]
    pub simulated_success_rate: f64,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_max_materialized_rows() -> usize {
    100_000
}
fn default_query_timeout_ms() -> u64 {
    5000
}
fn default_max_rule_depth() -> usize {
    16
}
fn default_preview_sample_size() -> usize {
    5
}
fn default_high_value_min_spend() -> f64 {
    1000.0
}
fn default_reference_limit() -> usize {
    500
}
fn default_pacing_delay_ms() -> u64 {
    100
}
fn default_simulated_success_rate() -> f64 {
    0.9
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            max_materialized_rows: default_max_materialized_rows(),
            query_timeout_ms: default_query_timeout_ms(),
            max_rule_depth: default_max_rule_depth(),
            preview_sample_size: default_preview_sample_size(),
        }
    }
}

impl Default for LookalikeConfig {
    fn default() -> Self {
        Self {
            high_value_min_spend: default_high_value_min_spend(),
            reference_limit: default_reference_limit(),
        }
    }
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            pacing_delay_ms: default_pacing_delay_ms(),
            simulated_success_rate: default_simulated_success_rate(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            segmentation: SegmentationConfig::default(),
            lookalike: LookalikeConfig::default(),
            campaigns: CampaignConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file overlaid by environment
    /// variables.
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CRM_ENGINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
