// Named configuration defaults for the oversight orchestrator, loaded
// through `config`'s layered source chain (defaults < file < env).

use ::config::{Config, ConfigError as RawConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] RawConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Disposition applied when a request times out at its final escalation
/// tier with no quorum reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalAction {
    AutoDeny,
    AutoApprove,
    BlockIndefinitely,
}

/// Default quorum policy applied to a tier when it declares no override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuorumPolicy {
    Any,
    All,
    Threshold { required: usize },
}

/// Top-level settings, covering every named default in the configuration
/// section of the design: tier timeout bounds, token TTL, delivery retry
/// schedule, public key cache TTL, post-rotation grace, checkpoint save
/// timeout, accepted signature algorithms, final action, default quorum,
/// consensus clock requirement, audit backlog limit, and recovery batch
/// size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OversightSettings {
    pub tier_timeout_min_secs: i64,
    pub tier_timeout_max_secs: i64,
    pub token_ttl_secs: i64,
    pub delivery_retry_schedule_secs: Vec<u64>,
    pub public_key_cache_ttl_secs: i64,
    pub post_rotation_grace_days: i64,
    pub checkpoint_save_timeout_ms: u64,
    pub signature_algorithms: Vec<String>,
    pub final_action: FinalAction,
    pub default_quorum: QuorumPolicy,
    pub consensus_clock_required: bool,
    pub audit_backlog_limit: usize,
    pub recovery_batch_size: usize,
}

impl Default for OversightSettings {
    fn default() -> Self {
        Self {
            tier_timeout_min_secs: 60,
            tier_timeout_max_secs: 7 * 24 * 3600,
            token_ttl_secs: 60,
            delivery_retry_schedule_secs: vec![10, 30, 90],
            public_key_cache_ttl_secs: 300,
            post_rotation_grace_days: 30,
            checkpoint_save_timeout_ms: 50,
            signature_algorithms: vec![
                "ml-dsa-65".to_string(),
                "ml-dsa-87".to_string(),
                "ed25519".to_string(),
            ],
            final_action: FinalAction::AutoDeny,
            default_quorum: QuorumPolicy::Any,
            consensus_clock_required: true,
            audit_backlog_limit: 10_000,
            recovery_batch_size: 500,
        }
    }
}

impl OversightSettings {
    /// Load defaults, then layer an optional TOML file, then
    /// `OVERSIGHT_*` environment variables, then validate.
    pub fn load(file_path: Option<&str>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut builder = Config::builder().add_source(Config::try_from(&defaults)?);

        if let Some(path) = file_path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("OVERSIGHT")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Self = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tier_timeout_min_secs < 60 {
            return Err(ConfigError::Invalid(
                "tier_timeout_min_secs must be >= 60".into(),
            ));
        }
        if self.tier_timeout_max_secs > 7 * 24 * 3600 {
            return Err(ConfigError::Invalid(
                "tier_timeout_max_secs must be <= 7 days".into(),
            ));
        }
        if self.tier_timeout_min_secs > self.tier_timeout_max_secs {
            return Err(ConfigError::Invalid(
                "tier_timeout_min_secs must not exceed tier_timeout_max_secs".into(),
            ));
        }
        if self.token_ttl_secs <= 0 {
            return Err(ConfigError::Invalid("token_ttl_secs must be positive".into()));
        }
        if self.delivery_retry_schedule_secs.is_empty() {
            return Err(ConfigError::Invalid(
                "delivery_retry_schedule_secs must not be empty".into(),
            ));
        }
        if self.signature_algorithms.is_empty() {
            return Err(ConfigError::Invalid(
                "signature_algorithms must not be empty".into(),
            ));
        }
        if self.audit_backlog_limit == 0 {
            return Err(ConfigError::Invalid(
                "audit_backlog_limit must be positive".into(),
            ));
        }
        if self.recovery_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "recovery_batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(OversightSettings::default().validate().is_ok());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = NamedTempFile::with_suffix(".toml").expect("tempfile");
        writeln!(file, "tier_timeout_min_secs = 120").expect("write");
        writeln!(file, "final_action = \"AUTO_APPROVE\"").expect("write");
        writeln!(file, "[default_quorum]").expect("write");
        writeln!(file, "kind = \"ALL\"").expect("write");

        let settings =
            OversightSettings::load(Some(file.path().to_str().expect("utf8 path"))).expect("load");

        assert_eq!(settings.tier_timeout_min_secs, 120);
        assert_eq!(settings.final_action, FinalAction::AutoApprove);
        assert_eq!(settings.default_quorum, QuorumPolicy::All);
    }

    #[test]
    fn out_of_bounds_timeout_fails_validation() {
        let mut settings = OversightSettings::default();
        settings.tier_timeout_max_secs = 8 * 24 * 3600;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn env_override_takes_precedence_over_file() {
        let mut file = NamedTempFile::with_suffix(".toml").expect("tempfile");
        writeln!(file, "tier_timeout_min_secs = 120").expect("write");

        std::env::set_var("OVERSIGHT_TIER_TIMEOUT_MIN_SECS", "180");
        let settings =
            OversightSettings::load(Some(file.path().to_str().expect("utf8 path"))).expect("load");
        std::env::remove_var("OVERSIGHT_TIER_TIMEOUT_MIN_SECS");

        assert_eq!(settings.tier_timeout_min_secs, 180);
    }
}
