//! Tuning flags
//!
//! Every scheduler option can be given on the command line or through the
//! environment. Anything left unset keeps its default.

use anyhow::{Context, Result};
use clap::Args;
use mqpoll_core::domain::connection::HandleShareMode;
use mqpoll_core::domain::tuning::Tuning;
use mqpoll_core::dto::tuning::TuningParameters;

/// Scheduler tuning overrides
#[derive(Debug, Clone, Default, Args)]
pub struct TuningArgs {
    /// Messages drained from one queue before rotating to another
    #[arg(long, env = "MQPOLL_MAX_CONSECUTIVE_GETS")]
    pub max_consecutive_gets: Option<u32>,

    /// Delay before re-polling when nothing was ready
    #[arg(long, env = "MQPOLL_IDLE_POLL_INTERVAL_MS")]
    pub idle_poll_interval_ms: Option<u64>,

    /// Delay after a productive pass
    #[arg(long, env = "MQPOLL_INTER_CYCLE_DELAY_MS")]
    pub inter_cycle_delay_ms: Option<u64>,

    /// Connection sharing mode (block, noblock, none)
    #[arg(long, env = "MQPOLL_HANDLE_SHARE_MODE")]
    pub handle_share_mode: Option<HandleShareMode>,

    /// Context count at or below which an empty attempt waits in place
    #[arg(long, env = "MQPOLL_SOLE_CONTEXT_THRESHOLD")]
    pub sole_context_threshold: Option<usize>,
}

impl TuningArgs {
    /// Applies the overrides to the defaults and validates the result
    pub fn resolve(&self) -> Result<Tuning> {
        let defaults = TuningParameters::default();
        let params = TuningParameters {
            max_consecutive_gets: self
                .max_consecutive_gets
                .unwrap_or(defaults.max_consecutive_gets),
            idle_poll_interval_ms: self
                .idle_poll_interval_ms
                .unwrap_or(defaults.idle_poll_interval_ms),
            inter_cycle_delay_ms: self
                .inter_cycle_delay_ms
                .unwrap_or(defaults.inter_cycle_delay_ms),
            handle_share_mode: self.handle_share_mode.unwrap_or(defaults.handle_share_mode),
            sole_context_threshold: self
                .sole_context_threshold
                .unwrap_or(defaults.sole_context_threshold),
        };

        Tuning::try_from(params).context("Invalid tuning")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_no_overrides_gives_defaults() {
        let tuning = TuningArgs::default().resolve().unwrap();
        assert_eq!(tuning, Tuning::default());
    }

    #[test]
    fn test_overrides_apply() {
        let args = TuningArgs {
            inter_cycle_delay_ms: Some(10),
            handle_share_mode: Some(HandleShareMode::NoBlock),
            ..Default::default()
        };
        let tuning = args.resolve().unwrap();
        assert_eq!(tuning.inter_cycle_delay, Duration::from_millis(10));
        assert_eq!(tuning.handle_share_mode, HandleShareMode::NoBlock);
        assert_eq!(tuning.max_consecutive_gets, 100);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let args = TuningArgs {
            idle_poll_interval_ms: Some(0),
            ..Default::default()
        };
        assert!(args.resolve().is_err());
    }
}
