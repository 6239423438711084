use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Root for downloaded image blobs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub fetcher: FetcherConfig,

    #[serde(default)]
    pub quality: QualityConfig,

    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_max_results_per_query")]
    pub max_results_per_query: usize,

    /// How long in-flight downloads may drain after cancellation.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Consecutive permanently failed pages before a query is abandoned.
    #[serde(default = "default_max_consecutive_page_failures")]
    pub max_consecutive_page_failures: u32,

    /// How long a catalog write waits on a locked database before it counts
    /// as a busy (retriable) failure.
    #[serde(default = "default_catalog_busy_timeout_ms")]
    pub catalog_busy_timeout_ms: u64,
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_max_results_per_query() -> usize {
    100
}

fn default_cancel_grace_secs() -> u64 {
    10
}

fn default_max_consecutive_page_failures() -> u32 {
    3
}

fn default_catalog_busy_timeout_ms() -> u64 {
    5000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            max_results_per_query: default_max_results_per_query(),
            cancel_grace_secs: default_cancel_grace_secs(),
            max_consecutive_page_failures: default_max_consecutive_page_failures(),
            catalog_busy_timeout_ms: default_catalog_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    #[serde(default = "default_burst")]
    pub burst: u32,
}

/// Slowest rate accepted by validation (one request every ~17 minutes).
pub const MIN_REQUESTS_PER_SECOND: f64 = 0.001;

fn default_requests_per_second() -> f64 {
    1.0
}

fn default_burst() -> u32 {
    3
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,

    /// Random spread applied to each delay, as a fraction of it.
    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_jitter() -> f64 {
    0.2
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            multiplier: default_retry_multiplier(),
            jitter: default_retry_jitter(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,

    #[serde(default = "default_accepted_content_types")]
    pub accepted_content_types: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_image_bytes() -> u64 {
    20 * 1024 * 1024 // 20MB
}

fn default_accepted_content_types() -> Vec<String> {
    vec![
        "image/jpeg".to_string(),
        "image/png".to_string(),
        "image/webp".to_string(),
        "image/gif".to_string(),
    ]
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_image_bytes: default_max_image_bytes(),
            accepted_content_types: default_accepted_content_types(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_min_dimension")]
    pub min_width: u32,

    #[serde(default = "default_min_dimension")]
    pub min_height: u32,

    #[serde(default = "default_max_aspect_ratio")]
    pub max_aspect_ratio: f64,

    /// Perceptual hashes closer than this (Hamming distance) are near-duplicates.
    #[serde(default = "default_duplicate_hash_distance_threshold")]
    pub duplicate_hash_distance_threshold: u32,

    /// Side length of the gradient hash grid (8 gives a 64-bit hash).
    #[serde(default = "default_hash_size")]
    pub hash_size: u32,
}

fn default_min_dimension() -> u32 {
    200
}

fn default_max_aspect_ratio() -> f64 {
    4.0
}

fn default_duplicate_hash_distance_threshold() -> u32 {
    10 // ~15% of a 64-bit hash
}

fn default_hash_size() -> u32 {
    8
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_width: default_min_dimension(),
            min_height: default_min_dimension(),
            max_aspect_ratio: default_max_aspect_ratio(),
            duplicate_hash_distance_threshold: default_duplicate_hash_distance_threshold(),
            hash_size: default_hash_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Pixabay,
    Unsplash,
    Pexels,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Pixabay => "pixabay",
            ProviderKind::Unsplash => "unsplash",
            ProviderKind::Pexels => "pexels",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Pixabay => "https://pixabay.com",
            ProviderKind::Unsplash => "https://api.unsplash.com",
            ProviderKind::Pexels => "https://api.pexels.com",
        }
    }

    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::Pixabay => "PIXABAY_API_KEY",
            ProviderKind::Unsplash => "UNSPLASH_ACCESS_KEY",
            ProviderKind::Pexels => "PEXELS_API_KEY",
        }
    }

    pub fn max_page_size(&self) -> u32 {
        match self {
            ProviderKind::Pixabay => 200,
            ProviderKind::Unsplash => 30,
            ProviderKind::Pexels => 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Inline key; prefer `api_key_env` so keys stay out of the config file.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub page_size: Option<u32>,

    #[serde(default = "default_queries")]
    pub queries: Vec<String>,

    /// Overrides the global `[rate_limit]` for this provider.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

fn default_enabled() -> bool {
    true
}

fn default_queries() -> Vec<String> {
    vec!["electric guitar".to_string(), "acoustic guitar".to_string()]
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            enabled: default_enabled(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            page_size: None,
            queries: default_queries(),
            rate_limit: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.kind.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn page_size(&self) -> u32 {
        let max = self.kind.max_page_size();
        self.page_size.unwrap_or(max).clamp(1, max)
    }

    /// Inline key first, then the configured (or default) environment variable.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        let var = self
            .api_key_env
            .clone()
            .unwrap_or_else(|| self.kind.default_api_key_env().to_string());
        std::env::var(&var)
            .ok()
            .filter(|k| !k.is_empty())
            .with_context(|| format!("No API key for {}: set {} or api_key", self.name(), var))
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::new(ProviderKind::Pixabay),
        ProviderConfig::new(ProviderKind::Unsplash),
        ProviderConfig::new(ProviderKind::Pexels),
    ]
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fretlog")
        .join("catalog.db")
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fretlog")
        .join("images")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            data_dir: default_data_dir(),
            pipeline: PipelineConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            fetcher: FetcherConfig::default(),
            quality: QualityConfig::default(),
            providers: default_providers(),
        }
    }
}

impl Config {
    /// Load from `FRETLOG_CONFIG` or the default location, writing defaults on first use.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("FRETLOG_CONFIG") {
            return Self::load_from(Path::new(&path));
        }

        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.worker_pool_size == 0 {
            bail!("pipeline.worker_pool_size must be at least 1");
        }
        if self.pipeline.max_results_per_query == 0 {
            bail!("pipeline.max_results_per_query must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            bail!("retry.jitter must be between 0 and 1");
        }
        if self.fetcher.max_image_bytes == 0 {
            bail!("fetcher.max_image_bytes must be positive");
        }
        if self.quality.max_aspect_ratio < 1.0 {
            bail!("quality.max_aspect_ratio must be >= 1.0");
        }
        if !(2..=32).contains(&self.quality.hash_size) {
            bail!("quality.hash_size must be between 2 and 32");
        }

        let limits = std::iter::once(&self.rate_limit)
            .chain(self.providers.iter().filter_map(|p| p.rate_limit.as_ref()));
        for limit in limits {
            if !limit.requests_per_second.is_finite() || limit.requests_per_second < MIN_REQUESTS_PER_SECOND {
                bail!(
                    "rate limit requests_per_second must be a finite number >= {}",
                    MIN_REQUESTS_PER_SECOND
                );
            }
            if limit.burst == 0 {
                bail!("rate limit burst must be at least 1");
            }
        }

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fretlog")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.providers.len(), 3);
        assert_eq!(config.quality.min_width, 200);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            db_path = "/tmp/catalog.db"

            [quality]
            min_width = 320

            [[providers]]
            kind = "pexels"
            queries = ["les paul"]
            rate_limit = { requests_per_second = 0.5, burst = 1 }
            "#,
        )
        .unwrap();

        assert_eq!(config.quality.min_width, 320);
        assert_eq!(config.quality.min_height, 200);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].queries, vec!["les paul".to_string()]);
        assert_eq!(config.providers[0].base_url(), "https://api.pexels.com");
        assert_eq!(config.providers[0].page_size(), 80);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let mut config = Config::default();
        config.rate_limit.requests_per_second = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_degenerate_rates() {
        for rate in [1e-300, -2.0, f64::NAN, f64::INFINITY] {
            let mut config = Config::default();
            config.rate_limit.requests_per_second = rate;
            assert!(config.validate().is_err(), "rate {} accepted", rate);
        }

        let mut config = Config::default();
        config.providers[0].rate_limit = Some(RateLimitConfig {
            requests_per_second: 0.0001,
            burst: 1,
        });
        assert!(config.validate().is_err());

        config.providers[0].rate_limit = Some(RateLimitConfig {
            requests_per_second: MIN_REQUESTS_PER_SECOND,
            burst: 1,
        });
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.pipeline.worker_pool_size = 7;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.pipeline.worker_pool_size, 7);
    }

    #[test]
    fn test_inline_api_key_wins() {
        let mut provider = ProviderConfig::new(ProviderKind::Pixabay);
        provider.api_key = Some("inline".to_string());
        provider.api_key_env = Some("FRETLOG_TEST_UNSET_VAR".to_string());
        assert_eq!(provider.resolve_api_key().unwrap(), "inline");

        provider.api_key = None;
        assert!(provider.resolve_api_key().is_err());
    }
}
