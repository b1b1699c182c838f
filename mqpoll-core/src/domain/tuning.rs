//! Scheduler tuning
//!
//! Defines every knob of the retrieval scheduler: drain cap, delay tiers,
//! buffer sizing policy and connection sharing defaults.

use std::time::Duration;
use thiserror::Error;

use super::connection::HandleShareMode;

/// Initial receive buffer size and the floor it never shrinks below
pub const DEFAULT_BUFFER_SIZE: usize = 10 * 1024;

/// Hard cap on a receive buffer
pub const MAX_BUFFER_SIZE: usize = 100 * 1024 * 1024;

/// A buffer used below this share of its capacity shrinks to this share
pub const SHRINK_PERCENT: u8 = 90;

/// Invalid tuning
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    #[error("min_buffer_size ({min}) cannot exceed max_buffer_size ({max})")]
    BufferBounds { min: usize, max: usize },

    #[error("shrink_percent must be between 1 and 100, got {0}")]
    ShrinkPercent(u8),
}

/// Scheduler tuning
///
/// All delays are configurable to trade CPU usage against delivery latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    /// Messages drained from one object before rotating to another
    pub max_consecutive_gets: u32,

    /// Delay before re-polling when nothing was ready
    pub idle_poll_interval: Duration,

    /// Delay before the next pass after a productive one
    pub inter_cycle_delay: Duration,

    /// Sharing mode used for default connect options
    pub handle_share_mode: HandleShareMode,

    /// With at most this many contexts in the process, an empty attempt
    /// sleeps for the idle interval instead of yielding
    pub sole_context_threshold: usize,

    /// Initial and minimum receive buffer size
    pub min_buffer_size: usize,

    /// Maximum receive buffer size
    pub max_buffer_size: usize,

    /// Shrink target, as a percentage of the current capacity
    pub shrink_percent: u8,

    /// A gate held longer than this is reported as a stuck call
    pub stuck_call_warning: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            max_consecutive_gets: 100,
            idle_poll_interval: Duration::from_millis(10_000),
            inter_cycle_delay: Duration::from_millis(250),
            handle_share_mode: HandleShareMode::Block,
            sole_context_threshold: 1,
            min_buffer_size: DEFAULT_BUFFER_SIZE,
            max_buffer_size: MAX_BUFFER_SIZE,
            shrink_percent: SHRINK_PERCENT,
            stuck_call_warning: Duration::from_secs(30),
        }
    }
}

impl Tuning {
    /// Creates tuning from environment variables
    ///
    /// Recognised variables (all optional, unparsable values fall back to defaults):
    /// - MQPOLL_MAX_CONSECUTIVE_GETS (default: 100)
    /// - MQPOLL_IDLE_POLL_INTERVAL_MS (default: 10000)
    /// - MQPOLL_INTER_CYCLE_DELAY_MS (default: 250)
    /// - MQPOLL_HANDLE_SHARE_MODE (block | noblock | none, default: block)
    /// - MQPOLL_SOLE_CONTEXT_THRESHOLD (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_consecutive_gets = std::env::var("MQPOLL_MAX_CONSECUTIVE_GETS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.max_consecutive_gets);

        let idle_poll_interval = std::env::var("MQPOLL_IDLE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.idle_poll_interval);

        let inter_cycle_delay = std::env::var("MQPOLL_INTER_CYCLE_DELAY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.inter_cycle_delay);

        let handle_share_mode = std::env::var("MQPOLL_HANDLE_SHARE_MODE")
            .ok()
            .and_then(|s| s.parse::<HandleShareMode>().ok())
            .unwrap_or(defaults.handle_share_mode);

        let sole_context_threshold = std::env::var("MQPOLL_SOLE_CONTEXT_THRESHOLD")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.sole_context_threshold);

        let tuning = Self {
            max_consecutive_gets,
            idle_poll_interval,
            inter_cycle_delay,
            handle_share_mode,
            sole_context_threshold,
            ..defaults
        };
        tuning.validate()?;
        Ok(tuning)
    }

    /// Validates the tuning
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_consecutive_gets == 0 {
            return Err(ConfigError::Zero("max_consecutive_gets"));
        }

        if self.idle_poll_interval.is_zero() {
            return Err(ConfigError::Zero("idle_poll_interval"));
        }

        if self.min_buffer_size == 0 {
            return Err(ConfigError::Zero("min_buffer_size"));
        }

        if self.min_buffer_size > self.max_buffer_size {
            return Err(ConfigError::BufferBounds {
                min: self.min_buffer_size,
                max: self.max_buffer_size,
            });
        }

        if self.shrink_percent == 0 || self.shrink_percent > 100 {
            return Err(ConfigError::ShrinkPercent(self.shrink_percent));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tuning() {
        let tuning = Tuning::default();
        assert_eq!(tuning.max_consecutive_gets, 100);
        assert_eq!(tuning.idle_poll_interval, Duration::from_millis(10_000));
        assert_eq!(tuning.inter_cycle_delay, Duration::from_millis(250));
        assert_eq!(tuning.min_buffer_size, 10_240);
        assert_eq!(tuning.max_buffer_size, 104_857_600);
        assert!(tuning.validate().is_ok());
    }

    #[test]
    fn test_tuning_validation() {
        let mut tuning = Tuning::default();

        tuning.max_consecutive_gets = 0;
        assert_eq!(
            tuning.validate(),
            Err(ConfigError::Zero("max_consecutive_gets"))
        );
        tuning.max_consecutive_gets = 3;

        tuning.min_buffer_size = MAX_BUFFER_SIZE + 1;
        assert!(matches!(
            tuning.validate(),
            Err(ConfigError::BufferBounds { .. })
        ));
        tuning.min_buffer_size = DEFAULT_BUFFER_SIZE;

        tuning.shrink_percent = 0;
        assert_eq!(tuning.validate(), Err(ConfigError::ShrinkPercent(0)));
        tuning.shrink_percent = 90;

        // A zero inter-cycle delay is allowed: it just disables amortization
        tuning.inter_cycle_delay = Duration::ZERO;
        assert!(tuning.validate().is_ok());
    }
}
