//! Process configuration (§4.13, §6 "Configuration"): the settings read
//! once at startup, validated, and held immutably for the life of the
//! process — no singleton, no re-reading mid-run (§9 "no singletons").

use kdl::KdlDocument;

use forgeline_core::debug::{DEFAULT_MAX_TIMEOUT_SECONDS, DEFAULT_SESSION_TIMEOUT_SECONDS};
use forgeline_core::step::DEFAULT_SCRIPT_IMAGE;
use forgeline_core::worker::{ACK_TIMEOUT_SECONDS, DEATH_TIMEOUT_SECONDS};
use forgeline_executor::workspace::ORPHAN_SWEEP_INTERVAL_SECONDS;

use crate::{ConfigError, ConfigResult};

/// Process-wide configuration (§6 "Configuration"). Every field has a
/// sensible default mirroring the constants the relevant component
/// would otherwise hard-code, so a minimal config file is valid.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub database_url: String,
    pub git_repository_root: String,
    pub backend_base_url: String,
    pub bind_address: String,
    pub ack_timeout_seconds: u64,
    pub worker_death_timeout_seconds: u64,
    pub orphan_sweep_interval_seconds: i64,
    pub debug_session_default_timeout_seconds: u64,
    pub debug_session_max_timeout_seconds: u64,
    pub default_step_image: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/forgeline".to_string(),
            git_repository_root: "./repositories".to_string(),
            backend_base_url: "http://localhost:8080".to_string(),
            bind_address: "0.0.0.0:8080".to_string(),
            ack_timeout_seconds: ACK_TIMEOUT_SECONDS,
            worker_death_timeout_seconds: DEATH_TIMEOUT_SECONDS,
            orphan_sweep_interval_seconds: ORPHAN_SWEEP_INTERVAL_SECONDS,
            debug_session_default_timeout_seconds: DEFAULT_SESSION_TIMEOUT_SECONDS,
            debug_session_max_timeout_seconds: DEFAULT_MAX_TIMEOUT_SECONDS,
            default_step_image: DEFAULT_SCRIPT_IMAGE.to_string(),
        }
    }
}

impl ProcessConfig {
    /// Parses a `forgeline.kdl` document, falling back to
    /// [`ProcessConfig::default`] for any field its top-level `config`
    /// node omits.
    pub fn parse(kdl: &str) -> ConfigResult<Self> {
        let doc: KdlDocument = kdl.parse()?;
        let mut config = Self::default();

        let Some(node) = doc.get("config") else {
            return Ok(config);
        };
        let Some(children) = node.children() else {
            return Ok(config);
        };

        for entry in children.nodes() {
            let name = entry.name().value();
            let value = entry
                .entries()
                .first()
                .ok_or_else(|| ConfigError::MissingField(format!("{name} has no value")))?;

            match name {
                "database-url" => config.database_url = string_value(name, value)?,
                "git-repository-root" => config.git_repository_root = string_value(name, value)?,
                "backend-base-url" => config.backend_base_url = string_value(name, value)?,
                "bind-address" => config.bind_address = string_value(name, value)?,
                "ack-timeout-seconds" => config.ack_timeout_seconds = int_value(name, value)?,
                "worker-death-timeout-seconds" => {
                    config.worker_death_timeout_seconds = int_value(name, value)?
                }
                "orphan-sweep-interval-seconds" => {
                    config.orphan_sweep_interval_seconds = int_value(name, value)?
                }
                "debug-session-default-timeout-seconds" => {
                    config.debug_session_default_timeout_seconds = int_value(name, value)?
                }
                "debug-session-max-timeout-seconds" => {
                    config.debug_session_max_timeout_seconds = int_value(name, value)?
                }
                "default-step-image" => config.default_step_image = string_value(name, value)?,
                other => return Err(ConfigError::InvalidReference(other.to_string())),
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.default_step_image.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "default-step-image".to_string(),
                message: "must be a non-empty image reference".to_string(),
            });
        }
        if self.ack_timeout_seconds == 0
            || self.worker_death_timeout_seconds == 0
            || self.debug_session_default_timeout_seconds == 0
            || self.debug_session_max_timeout_seconds == 0
        {
            return Err(ConfigError::InvalidValue {
                field: "timeout".to_string(),
                message: "timeouts must be positive".to_string(),
            });
        }
        if self.debug_session_default_timeout_seconds > self.debug_session_max_timeout_seconds {
            return Err(ConfigError::InvalidValue {
                field: "debug-session-default-timeout-seconds".to_string(),
                message: "default timeout cannot exceed the max timeout".to_string(),
            });
        }
        Ok(())
    }
}

fn string_value(field: &str, entry: &kdl::KdlEntry) -> ConfigResult<String> {
    entry
        .value()
        .as_string()
        .map(str::to_string)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected a string".to_string(),
        })
}

fn int_value<T: TryFrom<i128>>(field: &str, entry: &kdl::KdlEntry) -> ConfigResult<T> {
    let raw = entry.value().as_integer().ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected an integer".to_string(),
    })?;
    T::try_from(raw).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "integer out of range".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ProcessConfig::default().validate().unwrap();
    }

    #[test]
    fn parses_overrides() {
        let kdl = r#"
            config {
                database-url "postgres://db/forgeline"
                ack-timeout-seconds 10
                default-step-image "custom:latest"
            }
        "#;
        let config = ProcessConfig::parse(kdl).unwrap();
        assert_eq!(config.database_url, "postgres://db/forgeline");
        assert_eq!(config.ack_timeout_seconds, 10);
        assert_eq!(config.default_step_image, "custom:latest");
        assert_eq!(config.bind_address, ProcessConfig::default().bind_address);
    }

    #[test]
    fn rejects_empty_default_image() {
        let kdl = r#"
            config {
                default-step-image ""
            }
        "#;
        assert!(ProcessConfig::parse(kdl).is_err());
    }
}
