//! Linear backoff anchored to message creation time.
//!
//! The `n`th retry becomes eligible `n * base_interval` after the message was
//! created, no matter when the earlier attempts actually ran. Ticks that were
//! skipped therefore never stretch the overall schedule.

use chrono::{DateTime, TimeDelta, Utc};

use crate::message::{Message, MessageStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_interval: TimeDelta,
    max_retries: u32,
}

impl BackoffPolicy {
    pub fn new(base_interval: TimeDelta, max_retries: u32) -> Self {
        Self {
            base_interval,
            max_retries,
        }
    }

    pub fn base_interval(&self) -> TimeDelta {
        self.base_interval
    }

    /// Ceiling given to messages enqueued without their own.
    pub fn default_max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Earliest time the attempt following the current one may run:
    /// `created_at + (retry_count + 1) * base_interval`.
    pub fn next_eligible_at(&self, message: &Message) -> DateTime<Utc> {
        i32::try_from(message.retry_count.saturating_add(1))
            .ok()
            .and_then(|n| self.base_interval.checked_mul(n))
            .and_then(|delay| message.created_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the retry ceiling has been reached.
    pub fn should_escalate(&self, message: &Message) -> bool {
        message.retry_count >= message.max_retries
    }

    /// Whether a `failed` message is due for consideration at `now`.
    ///
    /// A due message that [`should_escalate`](Self::should_escalate) is
    /// escalated by the scheduler instead of being attempted.
    pub fn is_eligible(&self, message: &Message, now: DateTime<Utc>) -> bool {
        message.status == MessageStatus::Failed
            && message.next_eligible_at.is_some_and(|at| at <= now)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(TimeDelta::minutes(15), 10)
    }
}
