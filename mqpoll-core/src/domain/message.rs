//! Get-options and message descriptors
//!
//! These are the caller-owned templates of a registered retrieval. The
//! scheduler clones them for every attempt so the originals are never
//! mutated by the transport.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::Duration;

bitflags! {
    /// Options controlling a single retrieval call
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct GetFlags: u32 {
        /// Wait for a message up to the wait interval
        const WAIT = 0x0001;
        /// Accept a message truncated to the supplied buffer
        const ACCEPT_TRUNCATED_MSG = 0x0040;
        /// Retrieve under syncpoint control
        const SYNCPOINT = 0x0002;
        /// Fail instead of waiting when the server is quiescing
        const FAIL_IF_QUIESCING = 0x2000;
    }
}

bitflags! {
    /// Which descriptor fields must match for a message to be selected
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MatchOptions: u32 {
        const MSG_ID = 0x0001;
        const CORREL_ID = 0x0002;
    }
}

/// How long a retrieval may wait for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitInterval {
    Unlimited,
    Millis(u64),
}

/// Get-options of a registered retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOptions {
    pub flags: GetFlags,
    pub wait_interval: WaitInterval,
    pub match_options: MatchOptions,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            flags: GetFlags::empty(),
            wait_interval: WaitInterval::Millis(0),
            match_options: MatchOptions::MSG_ID | MatchOptions::CORREL_ID,
        }
    }
}

impl GetOptions {
    /// Options that wait up to `interval` for each message
    pub fn waiting(interval: WaitInterval) -> Self {
        Self {
            flags: GetFlags::WAIT,
            wait_interval: interval,
            ..Self::default()
        }
    }

    /// Copy of these options that never blocks and never accepts truncation
    pub fn non_blocking(&self) -> Self {
        let mut options = self.clone();
        options
            .flags
            .remove(GetFlags::WAIT | GetFlags::ACCEPT_TRUNCATED_MSG);
        options.wait_interval = WaitInterval::Millis(0);
        options
    }

    /// Time a retrieval may wait before a timeout is surfaced
    ///
    /// `None` means unlimited. Without the `WAIT` flag the budget is zero, so
    /// the first empty attempt is already a timeout.
    pub fn wait_budget(&self) -> Option<Duration> {
        if !self.flags.contains(GetFlags::WAIT) {
            return Some(Duration::ZERO);
        }

        match self.wait_interval {
            WaitInterval::Unlimited => None,
            WaitInterval::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

/// Message descriptor
///
/// Used both as the match template supplied at registration and as the
/// filled-in description of a delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDescriptor {
    /// Empty means "any" when used as a match template
    pub message_id: Vec<u8>,
    /// Empty means "any" when used as a match template
    pub correlation_id: Vec<u8>,
    pub format: String,
    pub priority: u8,
    pub persistent: bool,
    pub reply_to_queue: Option<String>,
    /// Milliseconds since the Unix epoch, set by the transport on put
    pub put_time_ms: u64,
}

impl MessageDescriptor {
    /// Checks whether `other` satisfies this template under `options`
    pub fn matches(&self, other: &MessageDescriptor, options: MatchOptions) -> bool {
        if options.contains(MatchOptions::MSG_ID)
            && !self.message_id.is_empty()
            && self.message_id != other.message_id
        {
            return false;
        }

        if options.contains(MatchOptions::CORREL_ID)
            && !self.correlation_id.is_empty()
            && self.correlation_id != other.correlation_id
        {
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_blocking_strips_wait_and_truncation() {
        let mut options = GetOptions::waiting(WaitInterval::Unlimited);
        options
            .flags
            .insert(GetFlags::ACCEPT_TRUNCATED_MSG | GetFlags::SYNCPOINT);

        let attempt = options.non_blocking();
        assert!(!attempt.flags.contains(GetFlags::WAIT));
        assert!(!attempt.flags.contains(GetFlags::ACCEPT_TRUNCATED_MSG));
        assert!(attempt.flags.contains(GetFlags::SYNCPOINT));
        assert_eq!(attempt.wait_interval, WaitInterval::Millis(0));

        // Template untouched
        assert!(options.flags.contains(GetFlags::WAIT));
    }

    #[test]
    fn test_wait_budget() {
        assert_eq!(GetOptions::default().wait_budget(), Some(Duration::ZERO));
        assert_eq!(
            GetOptions::waiting(WaitInterval::Unlimited).wait_budget(),
            None
        );
        assert_eq!(
            GetOptions::waiting(WaitInterval::Millis(2000)).wait_budget(),
            Some(Duration::from_millis(2000))
        );
    }

    #[test]
    fn test_descriptor_matching() {
        let any = MessageDescriptor::default();
        let msg = MessageDescriptor {
            message_id: b"id-1".to_vec(),
            correlation_id: b"corr-1".to_vec(),
            ..Default::default()
        };
        let all = MatchOptions::MSG_ID | MatchOptions::CORREL_ID;

        assert!(any.matches(&msg, all));

        let by_correl = MessageDescriptor {
            correlation_id: b"corr-2".to_vec(),
            ..Default::default()
        };
        assert!(!by_correl.matches(&msg, all));
        assert!(by_correl.matches(&msg, MatchOptions::MSG_ID));
    }
}
