use gpusync_cmd::EncoderKind;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Tunables for a device and every queue created on it.
///
/// The value is captured when the device is constructed; there is no process-wide mutable copy.
/// Use [`SyncConfig::from_env`] to overlay `GPUSYNC_*` environment variables on the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub copy_engine: CopyEnginePolicy,

    /// Assume the engines are not cache coherent: every cross-engine hop gets an explicit
    /// cache-flush write on the compute side.
    pub force_cache_flush_for_copy: bool,

    /// Submit to the compute engine on every copy enqueue, even when the latest work sent by the
    /// queue was already a copy.
    pub force_compute_submission_for_copy: bool,

    /// Work items a single sub-dispatch can cover before the launch is split.
    pub max_work_items_per_dispatch: u64,

    pub token_pool_capacity: usize,

    /// Bytes a single engine flush may occupy in the ring.
    pub command_buffer_bytes: usize,

    pub wait: WaitConfig,
    pub poller: PollerConfig,
    pub encoder: EncoderKind,
}

/// Which operation classes may run on a copy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CopyEnginePolicy {
    pub copies: bool,
    pub aux_translation: bool,
}

impl Default for CopyEnginePolicy {
    fn default() -> Self {
        Self {
            copies: true,
            aux_translation: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Never leave the spin loop.
    Spin,
    /// Spin, then yield the thread between polls.
    #[default]
    Yield,
    /// Spin, then sleep for `low_power_sleep_us` between polls.
    LowPower,
}

impl FromStr for BackoffKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spin" => Ok(Self::Spin),
            "yield" => Ok(Self::Yield),
            "low_power" | "low-power" | "lowpower" => Ok(Self::LowPower),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaitConfig {
    pub spin_iterations: u32,
    pub backoff: BackoffKind,
    pub low_power_sleep_us: u64,
    /// How often a wait consults the device-hang signal. Zero checks on every poll.
    pub hang_check_period_us: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            spin_iterations: 256,
            backoff: BackoffKind::Yield,
            low_power_sleep_us: 50,
            hang_check_period_us: 500_000,
        }
    }
}

impl WaitConfig {
    pub fn low_power_sleep(&self) -> Duration {
        Duration::from_micros(self.low_power_sleep_us)
    }

    pub fn hang_check_period(&self) -> Duration {
        Duration::from_micros(self.hang_check_period_us)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollerConfig {
    pub enabled: bool,
    /// Upper bound on a single blocking wait performed by the poller thread.
    pub max_sleep_us: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sleep_us: 1_000,
        }
    }
}

impl PollerConfig {
    pub fn max_sleep(&self) -> Duration {
        Duration::from_micros(self.max_sleep_us)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            copy_engine: CopyEnginePolicy::default(),
            force_cache_flush_for_copy: false,
            force_compute_submission_for_copy: false,
            max_work_items_per_dispatch: 1 << 16,
            token_pool_capacity: 4096,
            command_buffer_bytes: 64 * 1024,
            wait: WaitConfig::default(),
            poller: PollerConfig::default(),
            encoder: EncoderKind::default(),
        }
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `GPUSYNC_*` process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from `lookup` (keyed by `GPUSYNC_*` variable name) onto `self`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GPUSYNC_COPY_ENGINE_COPIES") {
            self.copy_engine.copies = parse_bool("GPUSYNC_COPY_ENGINE_COPIES", &v)?;
        }
        if let Some(v) = get("GPUSYNC_COPY_ENGINE_AUX_TRANSLATION") {
            self.copy_engine.aux_translation =
                parse_bool("GPUSYNC_COPY_ENGINE_AUX_TRANSLATION", &v)?;
        }
        if let Some(v) = get("GPUSYNC_FORCE_CACHE_FLUSH_FOR_COPY") {
            self.force_cache_flush_for_copy = parse_bool("GPUSYNC_FORCE_CACHE_FLUSH_FOR_COPY", &v)?;
        }
        if let Some(v) = get("GPUSYNC_FORCE_COMPUTE_SUBMISSION_FOR_COPY") {
            self.force_compute_submission_for_copy =
                parse_bool("GPUSYNC_FORCE_COMPUTE_SUBMISSION_FOR_COPY", &v)?;
        }
        if let Some(v) = get("GPUSYNC_MAX_WORK_ITEMS_PER_DISPATCH") {
            self.max_work_items_per_dispatch =
                parse_value("GPUSYNC_MAX_WORK_ITEMS_PER_DISPATCH", &v)?;
        }
        if let Some(v) = get("GPUSYNC_TOKEN_POOL_CAPACITY") {
            self.token_pool_capacity = parse_value("GPUSYNC_TOKEN_POOL_CAPACITY", &v)?;
        }
        if let Some(v) = get("GPUSYNC_COMMAND_BUFFER_BYTES") {
            self.command_buffer_bytes = parse_value("GPUSYNC_COMMAND_BUFFER_BYTES", &v)?;
        }
        if let Some(v) = get("GPUSYNC_WAIT_SPIN_ITERATIONS") {
            self.wait.spin_iterations = parse_value("GPUSYNC_WAIT_SPIN_ITERATIONS", &v)?;
        }
        if let Some(v) = get("GPUSYNC_WAIT_BACKOFF") {
            self.wait.backoff = parse_value("GPUSYNC_WAIT_BACKOFF", &v)?;
        }
        if let Some(v) = get("GPUSYNC_WAIT_LOW_POWER_SLEEP_US") {
            self.wait.low_power_sleep_us = parse_value("GPUSYNC_WAIT_LOW_POWER_SLEEP_US", &v)?;
        }
        if let Some(v) = get("GPUSYNC_HANG_CHECK_PERIOD_US") {
            self.wait.hang_check_period_us = parse_value("GPUSYNC_HANG_CHECK_PERIOD_US", &v)?;
        }
        if let Some(v) = get("GPUSYNC_POLLER_ENABLED") {
            self.poller.enabled = parse_bool("GPUSYNC_POLLER_ENABLED", &v)?;
        }
        if let Some(v) = get("GPUSYNC_POLLER_MAX_SLEEP_US") {
            self.poller.max_sleep_us = parse_value("GPUSYNC_POLLER_MAX_SLEEP_US", &v)?;
        }
        if let Some(v) = get("GPUSYNC_ENCODER") {
            let name = v.trim().to_ascii_lowercase();
            self.encoder = match name.as_str() {
                "wide" => EncoderKind::Wide,
                "compact" => EncoderKind::Compact,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "GPUSYNC_ENCODER".to_string(),
                        value: v,
                    })
                }
            };
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_work_items_per_dispatch == 0 {
            return Err(ConfigError::Invalid(
                "max_work_items_per_dispatch must be non-zero".to_string(),
            ));
        }
        if self.token_pool_capacity == 0 {
            return Err(ConfigError::Invalid(
                "token_pool_capacity must be non-zero".to_string(),
            ));
        }
        if self.command_buffer_bytes < 64 {
            return Err(ConfigError::Invalid(format!(
                "command_buffer_bytes must be at least 64 (got {})",
                self.command_buffer_bytes
            )));
        }
        Ok(())
    }
}
