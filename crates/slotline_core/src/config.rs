//! Analysis tuning knobs.
//!
//! # Responsibility
//! - Hold the step-timeout, step-span, retry and scan-cap settings.
//! - Load them from JSON text with every field defaulted.
//!
//! # Invariants
//! - A config returned by `from_json_str` has passed `validate`.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Settings shared by the applier, the extender and the lifecycle service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Wall-clock budget of one analysis step.
    pub step_timeout_ms: u64,
    /// Step spans never shrink below this.
    pub min_step_span_ms: u64,
    /// Span used after a timeout on a range without end.
    pub no_end_step_span_ms: u64,
    /// Grow the span when a window used less than this share of the timeout.
    pub step_span_increase_threshold: f64,
    pub step_span_increase_rate: f64,
    /// Retries of one application after a concurrent modification.
    pub max_concurrent_retries: u32,
    /// Failed attempts before the failure is escalated.
    pub max_failed_attempts: u32,
    pub extend_max_candidates: usize,
    pub extend_max_elapsed_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 60_000,
            min_step_span_ms: 30_000,
            no_end_step_span_ms: 24 * 60 * 60 * 1000,
            step_span_increase_threshold: 0.70,
            step_span_increase_rate: 1.2,
            max_concurrent_retries: 3,
            max_failed_attempts: 5,
            extend_max_candidates: 10_000,
            extend_max_elapsed_ms: 5_000,
        }
    }
}

impl AnalysisConfig {
    /// Parses and validates JSON text; missing fields take their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "step_timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.min_step_span_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "min_step_span_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.no_end_step_span_ms < self.min_step_span_ms {
            return Err(ConfigError::Invalid {
                field: "no_end_step_span_ms",
                message: format!("must be at least min_step_span_ms ({})", self.min_step_span_ms),
            });
        }
        if !(self.step_span_increase_threshold > 0.0 && self.step_span_increase_threshold <= 1.0)
        {
            return Err(ConfigError::Invalid {
                field: "step_span_increase_threshold",
                message: format!(
                    "must be in (0, 1], got {}",
                    self.step_span_increase_threshold
                ),
            });
        }
        if !(self.step_span_increase_rate.is_finite() && self.step_span_increase_rate >= 1.0) {
            return Err(ConfigError::Invalid {
                field: "step_span_increase_rate",
                message: format!("must be >= 1, got {}", self.step_span_increase_rate),
            });
        }
        if self.max_failed_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_failed_attempts",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.extend_max_candidates == 0 {
            return Err(ConfigError::Invalid {
                field: "extend_max_candidates",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn min_step_span(&self) -> Duration {
        Duration::from_millis(self.min_step_span_ms)
    }

    pub fn no_end_step_span(&self) -> Duration {
        Duration::from_millis(self.no_end_step_span_ms)
    }

    pub fn extend_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.extend_max_elapsed_ms)
    }
}

/// Configuration load error.
#[derive(Debug)]
pub enum ConfigError {
    Parse(serde_json::Error),
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "invalid analysis config: {err}"),
            Self::Invalid { field, message } => write!(f, "invalid `{field}`: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Invalid { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AnalysisConfig, ConfigError};
    use std::time::Duration;

    #[test]
    fn empty_object_yields_defaults() {
        let config = AnalysisConfig::from_json_str("{}").unwrap();
        assert_eq!(config, AnalysisConfig::default());
        assert_eq!(config.min_step_span(), Duration::from_secs(30));
        assert_eq!(config.no_end_step_span(), Duration::from_secs(86_400));
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let config =
            AnalysisConfig::from_json_str(r#"{"step_timeout_ms": 5000, "max_failed_attempts": 2}"#)
                .unwrap();
        assert_eq!(config.step_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_failed_attempts, 2);
        assert_eq!(config.max_concurrent_retries, 3);
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        assert!(matches!(
            AnalysisConfig::from_json_str(r#"{"step_timeout": 1}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            AnalysisConfig::from_json_str(r#"{"step_span_increase_rate": 0.5}"#),
            Err(ConfigError::Invalid {
                field: "step_span_increase_rate",
                ..
            })
        ));
        assert!(matches!(
            AnalysisConfig::from_json_str(r#"{"min_step_span_ms": 90000000}"#),
            Err(ConfigError::Invalid {
                field: "no_end_step_span_ms",
                ..
            })
        ));
    }
}
