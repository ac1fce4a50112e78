//! Step span adaptation between analysis runs.
//!
//! # Invariants
//! - A span is never below the configured minimum.
//! - Only spans of windows starting in the past are adapted.

use crate::config::AnalysisConfig;
use crate::model::range::UtcRange;
use std::time::Duration;

/// Span computations driven by `AnalysisConfig`.
#[derive(Debug, Clone, Copy)]
pub struct StepSpanPolicy {
    step_timeout: Duration,
    min_span: Duration,
    no_end_span: Duration,
    increase_threshold: f64,
    increase_rate: f64,
}

impl StepSpanPolicy {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            step_timeout: config.step_timeout(),
            min_span: config.min_step_span(),
            no_end_span: config.no_end_step_span(),
            increase_threshold: config.step_span_increase_threshold,
            increase_rate: config.step_span_increase_rate,
        }
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// Whether a step with `span` can still be shortened after a timeout.
    pub fn can_shrink(&self, span: Option<Duration>) -> bool {
        span.map_or(true, |span| span > self.min_span)
    }

    /// Span for the next run after a timeout on `remaining`.
    pub fn after_timeout(&self, current: Option<Duration>, remaining: &UtcRange) -> Duration {
        let shrunk = match current {
            Some(span) => span / 2,
            None => match remaining.duration() {
                Some(duration) => duration / 2,
                None => self.no_end_span,
            },
        };
        shrunk.max(self.min_span)
    }

    /// Span for the next window after one that took `elapsed`.
    pub fn after_success(&self, current: Option<Duration>, elapsed: Duration) -> Option<Duration> {
        let span = current?;
        let threshold = self.step_timeout.mul_f64(self.increase_threshold);
        if elapsed < threshold {
            let grown = (span.as_millis() as f64 * self.increase_rate).round();
            Some(Duration::from_millis(grown as u64))
        } else {
            Some(span)
        }
    }
}
