//! Bounded retry and polling policies
//!
//! Every wait in the workflow is a fixed number of attempts separated by a
//! fixed interval. There is no event-driven wake-up, so the worst-case
//! latency of an operation is always `max_attempts * interval`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Default attempts when polling an authorization
pub const DEFAULT_AUTHORIZATION_ATTEMPTS: u32 = 3;

/// Default interval between authorization polls
pub const DEFAULT_AUTHORIZATION_INTERVAL: Duration = Duration::from_secs(2);

/// Default attempts when polling for certificate content
pub const DEFAULT_ISSUANCE_ATTEMPTS: u32 = 5;

/// Default interval between certificate polls
pub const DEFAULT_ISSUANCE_INTERVAL: Duration = Duration::from_secs(3);

/// Default attempts when the vault storage is transiently locked
pub const DEFAULT_OPEN_ATTEMPTS: u32 = 3;

/// Default delay between storage open attempts
pub const DEFAULT_OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);

/// A bounded "sleep then try again" policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Attempt budget
    ///
    /// Pollers spend it on re-checks after their initial observation, so
    /// a budget of 3 can mean 4 CA calls. Storage open spends it on open
    /// attempts in total, the first one included.
    pub max_attempts: u32,
    /// Sleep between attempts
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Policy used by authorization completion
    pub const fn authorization() -> Self {
        Self::new(DEFAULT_AUTHORIZATION_ATTEMPTS, DEFAULT_AUTHORIZATION_INTERVAL)
    }

    /// Policy used while waiting for an issued certificate
    pub const fn issuance() -> Self {
        Self::new(DEFAULT_ISSUANCE_ATTEMPTS, DEFAULT_ISSUANCE_INTERVAL)
    }

    /// Policy used when opening vault storage
    pub const fn storage_open() -> Self {
        Self::new(DEFAULT_OPEN_ATTEMPTS, DEFAULT_OPEN_RETRY_DELAY)
    }

    /// Upper bound on the time spent waiting under this policy
    pub fn worst_case(&self) -> Duration {
        self.interval * self.max_attempts
    }

    /// Whether another attempt is allowed after `attempts_made`
    pub fn allows(&self, attempts_made: u32) -> bool {
        let allowed = attempts_made < self.max_attempts;
        trace!(
            attempts_made = attempts_made,
            max_attempts = self.max_attempts,
            allowed = allowed,
            "Poll attempt check"
        );
        allowed
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::authorization()
    }
}
