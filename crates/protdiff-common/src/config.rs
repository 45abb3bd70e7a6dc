//! Loss and evaluation configuration.
//!
//! Loads [`ProtDiffConfig`] from a TOML file with `[loss]` and `[eval]`
//! tables, then applies `PROTDIFF_*` environment variable overrides and
//! validates the result.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Settings for the training/evaluation loss objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Number of diffusion timesteps (T_max).
    /// Override: `PROTDIFF_TMAX`
    pub tmax: usize,

    /// Apply the OA-ARDM `1/t` reweighting to the masked cross-entropy.
    /// Override: `PROTDIFF_REWEIGHT`
    pub reweight: bool,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self { tmax: 500, reweight: true }
    }
}

/// Settings for the perplexity evaluation loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Number of sequences sampled (with replacement) from the test set.
    /// Override: `PROTDIFF_NUM_SAMPLES`
    pub num_samples: usize,

    /// Seed for the evaluation RNG.
    /// Override: `PROTDIFF_SEED`
    pub seed: u64,

    /// Log the running corpus perplexity every N samples.
    /// Override: `PROTDIFF_REPORT_EVERY`
    pub report_every: usize,

    /// Number of leading logit columns scored by the mask schemes.
    /// Override: `PROTDIFF_MASK_VOCAB_LIMIT`
    pub mask_vocab_limit: usize,

    /// Sequences longer than this are truncated before collation.
    /// Override: `PROTDIFF_MAX_LEN`
    pub max_len: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self { num_samples: 60_000, seed: 0, report_every: 100, mask_vocab_limit: 26, max_len: 2048 }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtDiffConfig {
    pub loss: LossConfig,
    pub eval: EvalConfig,
}

/// Errors that can occur when loading or validating a [`ProtDiffConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl ProtDiffConfig {
    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default())
            .map_err(|e| ConfigError::Validation(format!("default config does not serialize: {e}")))
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: ProtDiffConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Start from defaults and apply only environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.loss.validate()?;
        self.eval.validate()
    }

    /// Apply `PROTDIFF_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse::<usize>("PROTDIFF_TMAX")? {
            self.loss.tmax = v;
        }
        if let Ok(val) = std::env::var("PROTDIFF_REWEIGHT") {
            self.loss.reweight = parse_bool("PROTDIFF_REWEIGHT", &val)?;
        }
        if let Some(v) = env_parse::<usize>("PROTDIFF_NUM_SAMPLES")? {
            self.eval.num_samples = v;
        }
        if let Some(v) = env_parse::<u64>("PROTDIFF_SEED")? {
            self.eval.seed = v;
        }
        if let Some(v) = env_parse::<usize>("PROTDIFF_REPORT_EVERY")? {
            self.eval.report_every = v;
        }
        if let Some(v) = env_parse::<usize>("PROTDIFF_MASK_VOCAB_LIMIT")? {
            self.eval.mask_vocab_limit = v;
        }
        if let Some(v) = env_parse::<usize>("PROTDIFF_MAX_LEN")? {
            self.eval.max_len = v;
        }
        Ok(())
    }
}

impl LossConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // t = 1 and t = tmax must be distinct regimes
        if self.tmax < 2 {
            return Err(ConfigError::Validation(format!("tmax must be >= 2, got {}", self.tmax)));
        }
        Ok(())
    }
}

impl EvalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_samples == 0 {
            return Err(ConfigError::Validation("num_samples must be > 0".into()));
        }
        if self.report_every == 0 {
            return Err(ConfigError::Validation("report_every must be > 0".into()));
        }
        if self.mask_vocab_limit == 0 {
            return Err(ConfigError::Validation("mask_vocab_limit must be > 0".into()));
        }
        if self.max_len == 0 {
            return Err(ConfigError::Validation("max_len must be > 0".into()));
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => {
            debug!(key, value = %val, "applying environment override");
            val.parse::<T>().map(Some).map_err(|e| ConfigError::EnvOverride {
                key: key.into(),
                value: val.clone(),
                reason: e.to_string(),
            })
        }
        Err(_) => Ok(None),
    }
}

fn parse_bool(key: &str, val: &str) -> Result<bool, ConfigError> {
    match val.to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::EnvOverride {
            key: key.into(),
            value: val.into(),
            reason: "expected a boolean".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_KEYS: [&str; 7] = [
        "PROTDIFF_TMAX",
        "PROTDIFF_REWEIGHT",
        "PROTDIFF_NUM_SAMPLES",
        "PROTDIFF_SEED",
        "PROTDIFF_REPORT_EVERY",
        "PROTDIFF_MASK_VOCAB_LIMIT",
        "PROTDIFF_MAX_LEN",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ProtDiffConfig::default().validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_default_toml_round_trips() {
        clear_env();
        let toml_str = ProtDiffConfig::default_toml().unwrap();
        let cfg = ProtDiffConfig::from_toml(&toml_str).unwrap();
        assert_eq!(cfg, ProtDiffConfig::default());
    }

    #[test]
    #[serial]
    fn test_partial_toml_keeps_defaults() {
        clear_env();
        let cfg = ProtDiffConfig::from_toml(
            r#"
[loss]
tmax = 64

[eval]
seed = 7
"#,
        )
        .unwrap();
        assert_eq!(cfg.loss.tmax, 64);
        assert!(cfg.loss.reweight);
        assert_eq!(cfg.eval.seed, 7);
        assert_eq!(cfg.eval.num_samples, 60_000);
    }

    #[test]
    fn test_validation_rejects_tmax_below_two() {
        let mut cfg = ProtDiffConfig::default();
        cfg.loss.tmax = 1;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tmax must be >= 2"));
    }

    #[test]
    fn test_validation_rejects_zero_report_interval() {
        let mut cfg = ProtDiffConfig::default();
        cfg.eval.report_every = 0;
        assert!(cfg.validate().unwrap_err().to_string().contains("report_every"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_apply() {
        clear_env();
        unsafe {
            std::env::set_var("PROTDIFF_TMAX", "250");
            std::env::set_var("PROTDIFF_REWEIGHT", "no");
            std::env::set_var("PROTDIFF_SEED", "11");
        }
        let cfg = ProtDiffConfig::from_env().unwrap();
        clear_env();
        assert_eq!(cfg.loss.tmax, 250);
        assert!(!cfg.loss.reweight);
        assert_eq!(cfg.eval.seed, 11);
    }

    #[test]
    #[serial]
    fn test_bad_env_override_is_reported() {
        clear_env();
        unsafe { std::env::set_var("PROTDIFF_NUM_SAMPLES", "lots") };
        let err = ProtDiffConfig::from_env().unwrap_err();
        clear_env();
        assert!(matches!(err, ConfigError::EnvOverride { ref key, .. } if key == "PROTDIFF_NUM_SAMPLES"));
    }
}
