//! Tuning DTOs
//!
//! The public tuning surface: the four named options applications set, with
//! optional extras. Missing fields take their defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::connection::HandleShareMode;
use crate::domain::tuning::{ConfigError, Tuning};

/// Named tuning parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TuningParameters {
    /// Per-object drain cap before rotating
    pub max_consecutive_gets: u32,

    /// Delay when nothing is ready
    pub idle_poll_interval_ms: u64,

    /// Delay after a productive pass
    pub inter_cycle_delay_ms: u64,

    /// Compatibility flag for default connection sharing
    pub handle_share_mode: HandleShareMode,

    /// Context count at or below which an empty attempt self-delays
    pub sole_context_threshold: usize,
}

impl Default for TuningParameters {
    fn default() -> Self {
        Tuning::default().into()
    }
}

impl From<Tuning> for TuningParameters {
    fn from(tuning: Tuning) -> Self {
        Self {
            max_consecutive_gets: tuning.max_consecutive_gets,
            idle_poll_interval_ms: tuning.idle_poll_interval.as_millis() as u64,
            inter_cycle_delay_ms: tuning.inter_cycle_delay.as_millis() as u64,
            handle_share_mode: tuning.handle_share_mode,
            sole_context_threshold: tuning.sole_context_threshold,
        }
    }
}

impl TryFrom<TuningParameters> for Tuning {
    type Error = ConfigError;

    fn try_from(params: TuningParameters) -> Result<Self, Self::Error> {
        let tuning = Tuning {
            max_consecutive_gets: params.max_consecutive_gets,
            idle_poll_interval: Duration::from_millis(params.idle_poll_interval_ms),
            inter_cycle_delay: Duration::from_millis(params.inter_cycle_delay_ms),
            handle_share_mode: params.handle_share_mode,
            sole_context_threshold: params.sole_context_threshold,
            ..Tuning::default()
        };
        tuning.validate()?;
        Ok(tuning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameters_use_public_names() {
        let json = serde_json::to_value(TuningParameters::default()).unwrap();
        assert_eq!(json["maxConsecutiveGets"], 100);
        assert_eq!(json["idlePollIntervalMs"], 10_000);
        assert_eq!(json["interCycleDelayMs"], 250);
        assert_eq!(json["handleShareMode"], "block");
    }

    #[test]
    fn test_partial_parameters_take_defaults() {
        let params: TuningParameters =
            serde_json::from_str(r#"{"maxConsecutiveGets": 3, "handleShareMode": "none"}"#)
                .unwrap();
        let tuning = Tuning::try_from(params).unwrap();
        assert_eq!(tuning.max_consecutive_gets, 3);
        assert_eq!(tuning.handle_share_mode, HandleShareMode::None);
        assert_eq!(tuning.idle_poll_interval, Duration::from_millis(10_000));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let params = TuningParameters {
            idle_poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(Tuning::try_from(params).is_err());
    }
}
