//! Configuration management with validation and defaults
//!
//! Every tunable is a named, typed field with its default declared exactly
//! once in a `Default` impl. Files are TOML; `CERTDRAW_*` environment
//! variables override individual fields after the file is read.

use crate::errors::{ConfigurationError, EngineResult};
use crate::game::types::GameVariant;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub protocol: ProtocolConfig,
    pub game: GameConfig,
    pub pricing: PricingConfig,
    pub scheduler: SchedulerConfig,
    pub statistics: StatisticsConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
}

/// Commit-reveal protocol settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Minimum time between commit and reveal for the same round
    pub minimum_reveal_delay_ms: u64,
    pub protocol_version: String,
    /// Operator seed length in bytes
    pub seed_bytes: usize,
    /// Hex characters of the seed fingerprint written on `generate` entries
    pub fingerprint_hex_len: usize,
    /// Capacity of the commitment read-through cache
    pub commitment_cache_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            minimum_reveal_delay_ms: 1_000,
            protocol_version: "certdraw-1.0".to_string(),
            seed_bytes: 32,
            fingerprint_hex_len: 16,
            commitment_cache_capacity: 256,
        }
    }
}

/// Game variant and card shape
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub variant: GameVariant,
    pub number_grid: NumberGridConfig,
    pub letter_match: LetterMatchConfig,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            variant: GameVariant::NumberGrid,
            number_grid: NumberGridConfig::default(),
            letter_match: LetterMatchConfig::default(),
        }
    }
}

impl GameConfig {
    pub fn domain_size(&self) -> u32 {
        match self.variant {
            GameVariant::NumberGrid => self.number_grid.domain_size,
            GameVariant::LetterMatch => self.letter_match.domain_size,
        }
    }

    pub fn card_size(&self) -> usize {
        match self.variant {
            GameVariant::NumberGrid => self.number_grid.card_size,
            GameVariant::LetterMatch => self.letter_match.card_size,
        }
    }

    pub fn traps_per_card(&self) -> usize {
        match self.variant {
            GameVariant::NumberGrid => self.number_grid.traps_per_card,
            GameVariant::LetterMatch => 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NumberGridConfig {
    pub domain_size: u32,
    /// Cells per card (5 rows x 3 columns by default)
    pub card_size: usize,
    /// House-assigned hidden traps per card, drawn from the card's own cells
    pub traps_per_card: usize,
}

impl Default for NumberGridConfig {
    fn default() -> Self {
        Self {
            domain_size: 75,
            card_size: 15,
            traps_per_card: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LetterMatchConfig {
    pub domain_size: u32,
    pub card_size: usize,
}

impl Default for LetterMatchConfig {
    fn default() -> Self {
        Self {
            domain_size: 26,
            card_size: 5,
        }
    }
}

/// Prices in minor currency units
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub card_price: u64,
    pub shield_price: u64,
    /// Payable fraction of the collected fees
    pub payout_fraction: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            card_price: 100,
            shield_price: 50,
            payout_fraction: 0.8,
        }
    }
}

/// Phase timing for the scheduler cycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub pre_buy_window_ms: u64,
    /// Purchases close this long before the start deadline
    pub purchase_block_window_ms: u64,
    pub winner_display_window_ms: u64,
    /// When set, `tick` also calls the next symbol at this cadence while live
    pub auto_call_interval_ms: Option<u64>,
    /// Interval of the background tick task
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pre_buy_window_ms: 120_000,
            purchase_block_window_ms: 10_000,
            winner_display_window_ms: 30_000,
            auto_call_interval_ms: Some(3_000),
            tick_interval_ms: 500,
        }
    }
}

/// Statistical battery sample sizes and export limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub uniformity_samples: usize,
    pub uniformity_min: u64,
    pub uniformity_max: u64,
    pub runs_samples: usize,
    pub block_size: usize,
    pub block_count: usize,
    pub bit_samples: usize,
    /// Exports above this many samples return a preview plus digest
    pub export_inline_threshold: usize,
    pub export_max_samples: usize,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            uniformity_samples: 10_000,
            uniformity_min: 1,
            uniformity_max: 100,
            runs_samples: 1_000,
            block_size: 100,
            block_count: 50,
            bit_samples: 1_000,
            export_inline_threshold: 10_000,
            export_max_samples: 1_000_000,
        }
    }
}

/// Persistence settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    /// Use the in-process repository instead of RocksDB
    pub in_memory: bool,
    pub write_buffer_size_mb: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/certdraw_data".to_string(),
            in_memory: false,
            write_buffer_size_mb: 64,
        }
    }
}

/// HTTP surface settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_filter: "certdraw=info,tower_http=info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Local development: in-memory storage, short windows
    pub fn development() -> Self {
        Self {
            scheduler: SchedulerConfig {
                pre_buy_window_ms: 20_000,
                purchase_block_window_ms: 3_000,
                winner_display_window_ms: 5_000,
                auto_call_interval_ms: Some(1_500),
                ..Default::default()
            },
            storage: StorageConfig {
                in_memory: true,
                ..Default::default()
            },
            monitoring: MonitoringConfig {
                log_filter: "certdraw=debug,tower_http=debug".to_string(),
            },
            ..Default::default()
        }
    }

    /// Production deployment with persistence
    pub fn production() -> Self {
        Self {
            storage: StorageConfig {
                data_directory: "./DB/certdraw_data".to_string(),
                in_memory: false,
                write_buffer_size_mb: 128,
            },
            ..Default::default()
        }
    }

    /// Scenario tests: manual scheduling and small statistical samples
    pub fn testing() -> Self {
        Self {
            scheduler: SchedulerConfig {
                auto_call_interval_ms: None,
                ..Default::default()
            },
            statistics: StatisticsConfig {
                uniformity_samples: 2_000,
                uniformity_max: 20,
                runs_samples: 500,
                block_size: 50,
                block_count: 10,
                bit_samples: 256,
                export_inline_threshold: 100,
                export_max_samples: 10_000,
                ..Default::default()
            },
            storage: StorageConfig {
                in_memory: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load from a TOML file, apply environment overrides, then validate
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> EngineResult<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path.as_ref())?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path.display(), e))
        })?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    /// Override fields from `CERTDRAW_*` variables using the given lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> EngineResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CERTDRAW_DATA_DIR") {
            self.storage.data_directory = v;
        }
        if let Some(v) = lookup("CERTDRAW_IN_MEMORY") {
            self.storage.in_memory = parse_field("CERTDRAW_IN_MEMORY", &v)?;
        }
        if let Some(v) = lookup("CERTDRAW_HOST") {
            self.api.host = v;
        }
        if let Some(v) = lookup("CERTDRAW_PORT") {
            self.api.port = parse_field("CERTDRAW_PORT", &v)?;
        }
        if let Some(v) = lookup("CERTDRAW_VARIANT") {
            self.game.variant = match v.as_str() {
                "number_grid" => GameVariant::NumberGrid,
                "letter_match" => GameVariant::LetterMatch,
                other => {
                    return Err(ConfigurationError::InvalidValue {
                        field: "CERTDRAW_VARIANT".to_string(),
                        value: other.to_string(),
                        reason: "expected number_grid or letter_match".to_string(),
                    }
                    .into())
                }
            };
        }
        if let Some(v) = lookup("CERTDRAW_MIN_REVEAL_DELAY_MS") {
            self.protocol.minimum_reveal_delay_ms = parse_field("CERTDRAW_MIN_REVEAL_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("CERTDRAW_PAYOUT_FRACTION") {
            self.pricing.payout_fraction = parse_field("CERTDRAW_PAYOUT_FRACTION", &v)?;
        }
        if let Some(v) = lookup("CERTDRAW_SCHEDULER_ENABLED") {
            self.scheduler.enabled = parse_field("CERTDRAW_SCHEDULER_ENABLED", &v)?;
        }
        Ok(())
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: &str| -> EngineResult<()> {
            Err(ConfigurationError::ValidationFailed(msg.to_string()).into())
        };

        if self.protocol.seed_bytes < 16 {
            return invalid("seed_bytes must be >= 16");
        }
        if self.protocol.fingerprint_hex_len == 0 || self.protocol.fingerprint_hex_len >= 64 {
            return invalid("fingerprint_hex_len must be in 1..64");
        }
        if self.protocol.commitment_cache_capacity == 0 {
            return invalid("commitment_cache_capacity must be > 0");
        }

        let domain = self.game.domain_size();
        let card_size = self.game.card_size();
        if domain == 0 {
            return invalid("domain_size must be > 0");
        }
        if card_size == 0 || card_size > domain as usize {
            return invalid("card_size must be in 1..=domain_size");
        }
        if self.game.traps_per_card() >= card_size {
            return invalid("traps_per_card must leave at least one scoring cell");
        }
        if self.game.variant == GameVariant::LetterMatch && domain > 26 {
            return invalid("letter_match domain_size cannot exceed 26");
        }

        if !(self.pricing.payout_fraction > 0.0 && self.pricing.payout_fraction <= 1.0) {
            return invalid("payout_fraction must be in (0, 1]");
        }

        if self.scheduler.purchase_block_window_ms >= self.scheduler.pre_buy_window_ms {
            return invalid("purchase_block_window_ms must be shorter than pre_buy_window_ms");
        }
        if self.scheduler.tick_interval_ms == 0 {
            return invalid("tick_interval_ms must be > 0");
        }
        if self.scheduler.auto_call_interval_ms == Some(0) {
            return invalid("auto_call_interval_ms must be > 0 when set");
        }

        let stats = &self.statistics;
        if stats.uniformity_max <= stats.uniformity_min {
            return invalid("uniformity_max must exceed uniformity_min");
        }
        if stats.runs_samples < 3 || stats.bit_samples < 2 {
            return invalid("runs_samples must be >= 3 and bit_samples >= 2");
        }
        if stats.block_size < 10 || stats.block_count == 0 {
            return invalid("block_size must be >= 10 and block_count > 0");
        }
        if stats.export_inline_threshold > stats.export_max_samples {
            return invalid("export_inline_threshold cannot exceed export_max_samples");
        }

        Ok(())
    }

    pub fn minimum_reveal_delay(&self) -> Duration {
        Duration::from_millis(self.protocol.minimum_reveal_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.tick_interval_ms)
    }
}

fn parse_field<T: std::str::FromStr>(field: &str, value: &str) -> EngineResult<T>
where
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| {
        ConfigurationError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_presets_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::development().validate().is_ok());
        assert!(EngineConfig::production().validate().is_ok());
        assert!(EngineConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_invalid_payout_fraction() {
        let mut config = EngineConfig::default();
        config.pricing.payout_fraction = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_card_larger_than_domain_rejected() {
        let mut config = EngineConfig::default();
        config.game.variant = GameVariant::LetterMatch;
        config.game.letter_match.card_size = 27;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_purchase_block_must_fit_pre_buy() {
        let mut config = EngineConfig::default();
        config.scheduler.purchase_block_window_ms = config.scheduler.pre_buy_window_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_env_overrides(|key| match key {
                "CERTDRAW_PORT" => Some("9090".to_string()),
                "CERTDRAW_VARIANT" => Some("letter_match".to_string()),
                "CERTDRAW_IN_MEMORY" => Some("true".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.api.port, 9090);
        assert_eq!(config.game.variant, GameVariant::LetterMatch);
        assert!(config.storage.in_memory);
        assert_eq!(config.game.domain_size(), 26);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = EngineConfig::default();
        let result = config.apply_env_overrides(|key| {
            (key == "CERTDRAW_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pricing]\ncard_price = 250\n\n[game]\nvariant = \"letter_match\"").unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.pricing.card_price, 250);
        assert_eq!(config.pricing.shield_price, 50);
        assert_eq!(config.game.variant, GameVariant::LetterMatch);
        assert_eq!(config.protocol.minimum_reveal_delay_ms, 1_000);
    }

    #[test]
    fn test_duration_conversions() {
        let config = EngineConfig::default();
        assert_eq!(config.minimum_reveal_delay(), Duration::from_millis(1_000));
        assert_eq!(config.tick_interval(), Duration::from_millis(500));
    }
}
