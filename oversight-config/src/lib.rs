//! Layered configuration for the oversight orchestrator: built-in
//! defaults, an optional TOML file, then `OVERSIGHT_*` environment
//! overrides, validated once at startup.

pub mod settings;

pub use settings::{ConfigError, FinalAction, OversightSettings, QuorumPolicy};
