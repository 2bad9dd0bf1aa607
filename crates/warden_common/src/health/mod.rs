//! Health model
//!
//! Three independent boolean signals reduced by a pure scoring function.
//! Acquisition lives in `probe`, persistence in `audit`.

pub mod audit;
pub mod probe;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signals that must be true for "healthy" by default
pub const DEFAULT_THRESHOLD: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSignals {
    pub supervisor_active: bool,
    pub process_present: bool,
    pub probe_ok: bool,
}

impl HealthSignals {
    pub fn all(value: bool) -> Self {
        Self {
            supervisor_active: value,
            process_present: value,
            probe_ok: value,
        }
    }

    /// Named signals in fixed order
    pub fn named(&self) -> [(&'static str, bool); 3] {
        [
            ("supervisor_active", self.supervisor_active),
            ("process_present", self.process_present),
            ("probe_ok", self.probe_ok),
        ]
    }

    /// Number of true signals
    pub fn score(&self) -> u8 {
        self.named().iter().filter(|(_, ok)| *ok).count() as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthClass {
    Healthy,
    Unhealthy,
}

impl HealthClass {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthClass::Healthy)
    }
}

impl fmt::Display for HealthClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthClass::Healthy => write!(f, "healthy"),
            HealthClass::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

pub fn classify(score: u8, threshold: u8) -> HealthClass {
    if score >= threshold {
        HealthClass::Healthy
    } else {
        HealthClass::Unhealthy
    }
}

/// One observation of the managed service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub signals: HealthSignals,
    pub score: u8,
    pub threshold: u8,
    pub class: HealthClass,
}

impl HealthSample {
    pub fn new(signals: HealthSignals, threshold: u8) -> Self {
        let score = signals.score();
        Self {
            timestamp: Utc::now(),
            signals,
            score,
            threshold,
            class: classify(score, threshold),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.class.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_counts_true_signals() {
        for bits in 0u8..8 {
            let signals = HealthSignals {
                supervisor_active: bits & 1 != 0,
                process_present: bits & 2 != 0,
                probe_ok: bits & 4 != 0,
            };
            assert_eq!(signals.score(), bits.count_ones() as u8);
            let sample = HealthSample::new(signals, DEFAULT_THRESHOLD);
            assert_eq!(sample.is_healthy(), bits.count_ones() >= 2);
        }
    }

    #[test]
    fn test_active_without_process_or_probe_is_unhealthy() {
        let sample = HealthSample::new(
            HealthSignals {
                supervisor_active: true,
                process_present: false,
                probe_ok: false,
            },
            DEFAULT_THRESHOLD,
        );
        assert_eq!(sample.score, 1);
        assert_eq!(sample.class, HealthClass::Unhealthy);
    }

    #[test]
    fn test_threshold_is_configurable() {
        assert_eq!(classify(1, 1), HealthClass::Healthy);
        assert_eq!(classify(2, 3), HealthClass::Unhealthy);
        assert_eq!(classify(3, 3), HealthClass::Healthy);
    }
}
