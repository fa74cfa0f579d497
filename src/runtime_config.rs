// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for QuoteMesh. Persistence uses an atomic
// tmp + rename pattern to prevent corruption on crash. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
//
// An invalid configuration is the only error that terminates the process
// (exit code 1); `validate()` is the gate.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::ExchangeId;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_quote_assets() -> Vec<String> {
    vec!["USDT".to_string()]
}

fn default_min_usd_volume() -> f64 {
    1_000_000.0
}

fn default_max_usd_volume() -> f64 {
    1_000_000_000.0
}

fn default_channel_capacity() -> usize {
    100_000
}

fn default_horizon_seconds() -> u64 {
    900
}

fn default_max_windows() -> usize {
    10_000
}

fn default_as_of_tolerance_ms() -> u64 {
    1000
}

fn default_cleanup_interval_seconds() -> u64 {
    60
}

fn default_latest_max_entries() -> usize {
    50_000
}

fn default_stale_seconds() -> u64 {
    120
}

fn default_min_deviation_threshold() -> f64 {
    0.10
}

fn default_max_tick_age_seconds() -> u64 {
    5
}

fn default_entry_threshold() -> f64 {
    0.35
}

fn default_exit_threshold() -> f64 {
    0.05
}

fn default_cooldown_seconds() -> u64 {
    10
}

fn default_signal_ttl_seconds() -> u64 {
    60
}

fn default_dashboard_symbols_limit() -> usize {
    20
}

fn default_write_timeout_ms() -> u64 {
    2000
}

fn default_dead_connection_sweep_seconds() -> u64 {
    300
}

fn default_data_root() -> String {
    "./data".to_string()
}

fn default_archive_batch_size() -> usize {
    1000
}

fn default_shutdown_flush_timeout_seconds() -> u64 {
    5
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_exchanges() -> Vec<ExchangeConfig> {
    ExchangeId::all()
        .iter()
        .map(|ex| ExchangeConfig {
            name: ex.as_str().to_string(),
            volume_filter: VolumeFilterConfig::default(),
            subscribe: SubscribeConfig::default(),
        })
        .collect()
}

// =============================================================================
// Sections
// =============================================================================

/// Symbol-selection bounds for one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeFilterConfig {
    /// Minimum 24h quote volume in USD terms.
    #[serde(default = "default_min_usd_volume")]
    pub min_usd_volume: f64,

    /// Maximum 24h quote volume in USD terms.
    #[serde(default = "default_max_usd_volume")]
    pub max_usd_volume: f64,

    /// Quote assets to subscribe to (canonical uppercase).
    #[serde(default = "default_quote_assets")]
    pub quote_assets: Vec<String>,
}

impl Default for VolumeFilterConfig {
    fn default() -> Self {
        Self {
            min_usd_volume: default_min_usd_volume(),
            max_usd_volume: default_max_usd_volume(),
            quote_assets: default_quote_assets(),
        }
    }
}

/// Which streams to open per exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeConfig {
    #[serde(default = "default_true")]
    pub spreads: bool,

    #[serde(default = "default_true")]
    pub trades: bool,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            spreads: true,
            trades: true,
        }
    }
}

/// One configured exchange feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Identifier used in all keys; must parse via [`ExchangeId::parse`].
    pub name: String,

    #[serde(default)]
    pub volume_filter: VolumeFilterConfig,

    #[serde(default)]
    pub subscribe: SubscribeConfig,
}

impl ExchangeConfig {
    pub fn exchange_id(&self) -> Option<ExchangeId> {
        ExchangeId::parse(&self.name)
    }
}

/// Bounded fan-out channel settings. Drop-oldest is the only full-mode
/// policy; there is deliberately no knob for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            capacity: default_channel_capacity(),
        }
    }
}

/// Rolling-window store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingWindowConfig {
    #[serde(default = "default_horizon_seconds")]
    pub horizon_seconds: u64,

    #[serde(default = "default_max_windows")]
    pub max_windows: usize,

    #[serde(default = "default_as_of_tolerance_ms")]
    pub as_of_tolerance_ms: u64,

    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

impl Default for RollingWindowConfig {
    fn default() -> Self {
        Self {
            horizon_seconds: default_horizon_seconds(),
            max_windows: default_max_windows(),
            as_of_tolerance_ms: default_as_of_tolerance_ms(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

/// Latest-tick index bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestTicksConfig {
    #[serde(default = "default_latest_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_stale_seconds")]
    pub stale_seconds: u64,
}

impl Default for LatestTicksConfig {
    fn default() -> Self {
        Self {
            max_entries: default_latest_max_entries(),
            stale_seconds: default_stale_seconds(),
        }
    }
}

/// Deviation calculator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviationConfig {
    /// Minimum |deviation| in percent for an event to be emitted.
    #[serde(default = "default_min_deviation_threshold")]
    pub min_threshold: f64,

    /// Cached counterparty ticks older than this are treated as missing.
    #[serde(default = "default_max_tick_age_seconds")]
    pub max_tick_age_seconds: u64,
}

impl Default for DeviationConfig {
    fn default() -> Self {
        Self {
            min_threshold: default_min_deviation_threshold(),
            max_tick_age_seconds: default_max_tick_age_seconds(),
        }
    }
}

/// Signal detector hysteresis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsConfig {
    #[serde(default = "default_entry_threshold")]
    pub entry_threshold: f64,

    #[serde(default = "default_exit_threshold")]
    pub exit_threshold: f64,

    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    #[serde(default = "default_signal_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            entry_threshold: default_entry_threshold(),
            exit_threshold: default_exit_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            ttl_seconds: default_signal_ttl_seconds(),
        }
    }
}

/// Push (WebSocket) server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Maximum windows subscribed per connection.
    #[serde(default = "default_dashboard_symbols_limit")]
    pub dashboard_symbols_limit: usize,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_dead_connection_sweep_seconds")]
    pub dead_connection_sweep_seconds: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            dashboard_symbols_limit: default_dashboard_symbols_limit(),
            write_timeout_ms: default_write_timeout_ms(),
            dead_connection_sweep_seconds: default_dead_connection_sweep_seconds(),
        }
    }
}

/// Archive writer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_data_root")]
    pub data_root: String,

    /// Records buffered per partition before an automatic flush.
    #[serde(default = "default_archive_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_shutdown_flush_timeout_seconds")]
    pub shutdown_flush_timeout_seconds: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            batch_size: default_archive_batch_size(),
            shutdown_flush_timeout_seconds: default_shutdown_flush_timeout_seconds(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for QuoteMesh.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_exchanges")]
    pub exchanges: Vec<ExchangeConfig>,

    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub rolling_window: RollingWindowConfig,

    #[serde(default)]
    pub latest_ticks: LatestTicksConfig,

    #[serde(default)]
    pub deviation: DeviationConfig,

    #[serde(default)]
    pub signals: SignalsConfig,

    #[serde(default)]
    pub push: PushConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    /// API bind address; `QUOTEMESH_BIND_ADDR` overrides.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exchanges: default_exchanges(),
            channels: ChannelsConfig::default(),
            rolling_window: RollingWindowConfig::default(),
            latest_ticks: LatestTicksConfig::default(),
            deviation: DeviationConfig::default(),
            signals: SignalsConfig::default(),
            push: PushConfig::default(),
            archive: ArchiveConfig::default(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Read the config file at `path`. A missing file is an error too — the
    /// caller decides whether that means "use defaults" or "abort".
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("config {} is unreadable", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("config {} is not valid JSON", path.display()))?;

        info!(
            path = %path.display(),
            exchanges = config.exchanges.len(),
            "runtime config loaded"
        );
        Ok(config)
    }

    /// Write the config to `path` without ever exposing a torn file: the
    /// JSON lands in a sibling scratch file first and only a fully written
    /// scratch is renamed over the target. On any failure the scratch is
    /// swept away and the previous file is left untouched.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json =
            serde_json::to_string_pretty(self).context("runtime config does not serialise")?;

        let scratch = path.with_extension("json.new");
        let outcome = std::fs::write(&scratch, json.as_bytes())
            .and_then(|()| std::fs::rename(&scratch, path));
        if let Err(e) = outcome {
            let _ = std::fs::remove_file(&scratch);
            return Err(e).with_context(|| format!("saving config to {}", path.display()));
        }

        info!(path = %path.display(), "runtime config saved");
        Ok(())
    }

    /// Apply environment overrides after load. Only the bind address is
    /// overridable; feed selection is config-file-only.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("QUOTEMESH_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr;
            }
        }
    }

    /// Validate the configuration. A failure here is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.exchanges.is_empty() {
            anyhow::bail!("no exchanges configured");
        }
        let mut seen = std::collections::HashSet::new();
        for ex in &self.exchanges {
            let id = ex
                .exchange_id()
                .with_context(|| format!("unknown exchange name '{}'", ex.name))?;
            if !seen.insert(id) {
                anyhow::bail!("exchange '{}' configured twice", ex.name);
            }
            if ex.volume_filter.min_usd_volume > ex.volume_filter.max_usd_volume {
                anyhow::bail!(
                    "exchange '{}': min_usd_volume exceeds max_usd_volume",
                    ex.name
                );
            }
            if ex.volume_filter.quote_assets.is_empty() {
                anyhow::bail!("exchange '{}': empty quote_assets", ex.name);
            }
        }
        if self.channels.capacity == 0 {
            anyhow::bail!("channels.capacity must be positive");
        }
        if self.rolling_window.horizon_seconds == 0 || self.rolling_window.max_windows == 0 {
            anyhow::bail!("rolling_window horizon and max_windows must be positive");
        }
        if self.latest_ticks.max_entries == 0 {
            anyhow::bail!("latest_ticks.max_entries must be positive");
        }
        if self.deviation.min_threshold < 0.0 {
            anyhow::bail!("deviation.min_threshold must be non-negative");
        }
        if self.signals.entry_threshold <= self.signals.exit_threshold {
            anyhow::bail!("signals.entry_threshold must exceed exit_threshold (hysteresis)");
        }
        if self.archive.batch_size == 0 {
            anyhow::bail!("archive.batch_size must be positive");
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.exchanges.len(), 3);
        assert_eq!(cfg.channels.capacity, 100_000);
        assert_eq!(cfg.rolling_window.horizon_seconds, 900);
        assert_eq!(cfg.rolling_window.max_windows, 10_000);
        assert_eq!(cfg.rolling_window.as_of_tolerance_ms, 1000);
        assert_eq!(cfg.latest_ticks.max_entries, 50_000);
        assert!((cfg.deviation.min_threshold - 0.10).abs() < f64::EPSILON);
        assert!((cfg.signals.entry_threshold - 0.35).abs() < f64::EPSILON);
        assert!((cfg.signals.exit_threshold - 0.05).abs() < f64::EPSILON);
        assert_eq!(cfg.signals.cooldown_seconds, 10);
        assert_eq!(cfg.push.write_timeout_ms, 2000);
        assert_eq!(cfg.archive.batch_size, 1000);
        cfg.validate().expect("default config must validate");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.exchanges.len(), 3);
        assert_eq!(cfg.bind_addr, "0.0.0.0:3001");
        cfg.validate().unwrap();
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "exchanges": [
                { "name": "bybit", "volume_filter": { "min_usd_volume": 5000000.0 } }
            ],
            "signals": { "entry_threshold": 0.5 }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.exchanges.len(), 1);
        assert!((cfg.exchanges[0].volume_filter.min_usd_volume - 5_000_000.0).abs() < 1e-9);
        assert_eq!(cfg.exchanges[0].volume_filter.quote_assets, vec!["USDT"]);
        assert!(cfg.exchanges[0].subscribe.spreads);
        assert!((cfg.signals.entry_threshold - 0.5).abs() < f64::EPSILON);
        assert!((cfg.signals.exit_threshold - 0.05).abs() < f64::EPSILON);
        cfg.validate().unwrap();
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.exchanges.len(), cfg2.exchanges.len());
        assert_eq!(cfg.channels.capacity, cfg2.channels.capacity);
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
    }

    #[test]
    fn save_then_load_roundtrip_on_disk() {
        let path = std::env::temp_dir().join(format!(
            "quotemesh-config-test-{}.json",
            std::process::id()
        ));

        let mut cfg = RuntimeConfig::default();
        cfg.bind_addr = "127.0.0.1:9999".into();
        cfg.save(&path).expect("save must succeed");
        // The scratch file must not outlive a successful save.
        assert!(!path.with_extension("json.new").exists());

        let loaded = RuntimeConfig::load(&path).expect("load must succeed");
        assert_eq!(loaded.bind_addr, "127.0.0.1:9999");
        assert_eq!(loaded.exchanges.len(), cfg.exchanges.len());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("quotemesh-config-test-missing.json");
        let _ = std::fs::remove_file(&path);
        assert!(RuntimeConfig::load(&path).is_err());
    }

    #[test]
    fn unknown_exchange_fails_validation() {
        let json = r#"{ "exchanges": [ { "name": "kraken" } ] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_exchange_fails_validation() {
        let json = r#"{ "exchanges": [ { "name": "bybit" }, { "name": "Bybit" } ] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_exchanges_fails_validation() {
        let json = r#"{ "exchanges": [] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_hysteresis_fails_validation() {
        let json = r#"{ "signals": { "entry_threshold": 0.05, "exit_threshold": 0.35 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_volume_bounds_fail_validation() {
        let json = r#"{
            "exchanges": [
                { "name": "bybit",
                  "volume_filter": { "min_usd_volume": 10.0, "max_usd_volume": 1.0 } }
            ]
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }
}
