use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub odds_api: OddsApiConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OddsApiConfig {
    /// The Odds API base URL (v4)
    #[serde(default = "default_odds_api_url")]
    pub base_url: String,
    /// API key - loaded from env ODDS_API_KEY
    #[serde(default)]
    pub api_key: String,
    /// Comma-separated regions (e.g. "us,us2")
    #[serde(default = "default_regions")]
    pub regions: String,
    /// Restrict the upstream query to these books; empty = every book in region
    #[serde(default)]
    pub bookmakers: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// EV plays below this percentage are not reported
    #[serde(default)]
    pub min_ev_threshold: f64,
    /// Book identifiers to consider; empty = all
    #[serde(default)]
    pub allowed_books: Vec<String>,
    /// Markets scanned for arbitrage when `scan_all_lines` is on
    #[serde(default)]
    pub market_keys: Vec<String>,
    /// Exact line matching. No relaxed mode exists.
    #[serde(default = "default_true")]
    pub strict_line_matching: bool,
    /// Books per side in the no-vig consensus
    #[serde(default = "default_consensus_size")]
    pub consensus_size: usize,
    /// Use the single-sided average baseline when no-vig consensus is too thin
    #[serde(default)]
    pub ev_average_fallback: bool,
    /// Arb percentage at or above which an opportunity is flagged suspect
    #[serde(default = "default_suspect_arb_pct")]
    pub suspect_arb_pct: f64,
    /// Stake on the anchored leg of an arb
    #[serde(default = "default_reference_stake")]
    pub reference_stake: f64,
    /// Size arb legs for equal payout from the quoted prices; off = 50/50
    #[serde(default = "default_true")]
    pub derive_stake_weights: bool,
    /// Scan every line in fetched events for arbs, not just the selections
    #[serde(default = "default_true")]
    pub scan_all_lines: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Event fetches in flight at once
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Deadline for a whole pass; fetches still running are abandoned
    #[serde(default = "default_pass_timeout_ms")]
    pub pass_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Valkey URL - overridden by env VALKEY_URL
    #[serde(default = "default_valkey_url")]
    pub url: String,
    /// Key namespace, so several instances can share one Valkey
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
    /// TTL for cached event odds
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// TTL for the in-process arb grouping memo
    #[serde(default = "default_memo_ttl_secs")]
    pub memo_ttl_secs: u64,
    #[serde(default = "default_memo_max_entries")]
    pub memo_max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of the human-readable format
    #[serde(default)]
    pub json: bool,
}

fn default_odds_api_url() -> String {
    "https://api.the-odds-api.com/v4".to_string()
}
fn default_regions() -> String {
    "us".to_string()
}
fn default_request_timeout_ms() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}
fn default_consensus_size() -> usize {
    crate::valuation::DEFAULT_CONSENSUS_SIZE
}
fn default_suspect_arb_pct() -> f64 {
    crate::arb::DEFAULT_SUSPECT_ARB_PCT
}
fn default_reference_stake() -> f64 {
    100.0
}
fn default_max_concurrent_fetches() -> usize {
    8
}
fn default_pass_timeout_ms() -> u64 {
    10_000
}
fn default_valkey_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_cache_prefix() -> String {
    "oddsmash".to_string()
}
fn default_cache_ttl_secs() -> u64 {
    600
}
fn default_memo_ttl_secs() -> u64 {
    30
}
fn default_memo_max_entries() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for OddsApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_odds_api_url(),
            api_key: String::new(),
            regions: default_regions(),
            bookmakers: Vec::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_ev_threshold: 0.0,
            allowed_books: Vec::new(),
            market_keys: Vec::new(),
            strict_line_matching: true,
            consensus_size: default_consensus_size(),
            ev_average_fallback: false,
            suspect_arb_pct: default_suspect_arb_pct(),
            reference_stake: default_reference_stake(),
            derive_stake_weights: true,
            scan_all_lines: true,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_max_concurrent_fetches(),
            pass_timeout_ms: default_pass_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_valkey_url(),
            prefix: default_cache_prefix(),
            ttl_secs: default_cache_ttl_secs(),
            memo_ttl_secs: default_memo_ttl_secs(),
            memo_max_entries: default_memo_max_entries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl FetchConfig {
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_millis(self.pass_timeout_ms)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn memo_ttl(&self) -> Duration {
        Duration::from_secs(self.memo_ttl_secs)
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.overlay_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without touching the environment.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load a default config with env-only secrets (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Ok(url) = std::env::var("ODDS_API_URL") {
            config.odds_api.base_url = url;
        }
        config.overlay_env();
        config.validate()?;
        Ok(config)
    }

    // Secrets and endpoints from the environment (never store keys in the config file)
    fn overlay_env(&mut self) {
        if let Ok(key) = std::env::var("ODDS_API_KEY") {
            self.odds_api.api_key = key;
        }
        if let Ok(url) = std::env::var("VALKEY_URL") {
            self.cache.url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.engine.strict_line_matching {
            return Err(ConfigError::Invalid(
                "engine.strict_line_matching = false is not supported".to_string(),
            ));
        }
        if self.engine.consensus_size == 0 {
            return Err(ConfigError::Invalid(
                "engine.consensus_size must be at least 1".to_string(),
            ));
        }
        if self.fetch.max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid(
                "fetch.max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        if !(self.engine.reference_stake > 0.0) {
            return Err(ConfigError::Invalid(
                "engine.reference_stake must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The API key, required before any upstream fetch.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        if self.odds_api.api_key.is_empty() {
            Err(ConfigError::MissingEnv("ODDS_API_KEY".to_string()))
        } else {
            Ok(&self.odds_api.api_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.engine.min_ev_threshold, 0.0);
        assert!(cfg.engine.allowed_books.is_empty());
        assert!(cfg.engine.strict_line_matching);
        assert_eq!(cfg.engine.consensus_size, 3);
        assert_eq!(cfg.fetch.max_concurrent_fetches, 8);
        assert_eq!(cfg.cache.ttl(), Duration::from_secs(600));
        assert_eq!(cfg.cache.prefix, "oddsmash");
        assert!(cfg.engine.derive_stake_weights);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_sections_parse() {
        let cfg = Config::parse(
            r#"
            [odds_api]
            regions = "us,us2"
            bookmakers = ["draftkings", "fanduel"]

            [engine]
            min_ev_threshold = 2.5
            allowed_books = ["draftkings"]
            market_keys = ["batter_hits", "batter_hits_alternate"]
            suspect_arb_pct = 7.5
            derive_stake_weights = false

            [fetch]
            pass_timeout_ms = 2500

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.odds_api.regions, "us,us2");
        assert_eq!(cfg.odds_api.bookmakers.len(), 2);
        assert_eq!(cfg.engine.min_ev_threshold, 2.5);
        assert_eq!(cfg.engine.suspect_arb_pct, 7.5);
        assert!(!cfg.engine.derive_stake_weights);
        assert_eq!(cfg.fetch.pass_timeout(), Duration::from_millis(2500));
        assert!(cfg.logging.json);
        // untouched sections keep their defaults
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.odds_api.base_url, "https://api.the-odds-api.com/v4");
    }

    #[test]
    fn test_relaxed_line_matching_rejected() {
        let cfg = Config::parse("[engine]\nstrict_line_matching = false\n").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_api_key() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.require_api_key(),
            Err(ConfigError::MissingEnv(_))
        ));
    }
}
