//! Durable home of outbound messages and sole arbiter of concurrent access.
//!
//! Every mutation a store exposes is atomic per message: a reader never sees a
//! lease taken without the matching state, nor half of a state transition.
//! Leases expire on their own after the configured timeout, so a crashed
//! holder never needs an external unlock.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rand::distributions::{Alphanumeric, DistString};

use crate::{
    error::Error,
    message::{Message, MessageId, MessageStatus, NewMessage},
    policy::BackoffPolicy,
};

pub mod memory;
pub mod sqlite;

pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T, Error>>;

/// Exclusive, time-bounded claim on one message.
///
/// Obtained from [`MessageStore::try_acquire`] and handed back to
/// [`MessageStore::record_success`] or [`MessageStore::record_failure`],
/// which release it.
#[derive(Clone, Debug)]
pub struct Lease {
    message: Message,
    token: String,
}

impl Lease {
    pub(crate) fn new(message: Message, token: String) -> Self {
        Self { message, token }
    }

    pub fn id(&self) -> MessageId {
        self.message.id
    }

    /// Snapshot of the message as of acquisition.
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.message.leased_until
    }
}

pub trait MessageStore: Send + Sync + 'static {
    /// Inserts a new `pending` message.
    fn insert(&self, new: NewMessage) -> StoreFuture<'_, Message>;

    fn get(&self, id: MessageId) -> StoreFuture<'_, Option<Message>>;

    /// Most recent messages first, optionally filtered by status.
    fn list(&self, status: Option<MessageStatus>, limit: u32) -> StoreFuture<'_, Vec<Message>>;

    /// `failed` messages whose `next_eligible_at <= now`, oldest-due first,
    /// at most `limit` of them. Messages under a live lease are left out.
    fn select_eligible_failed(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreFuture<'_, Vec<Message>>;

    /// Takes the processing lease on a `pending` or `failed` message.
    ///
    /// Returns `None` if the message is gone, has left those states, or is
    /// already leased by someone else.
    fn try_acquire(&self, id: MessageId) -> StoreFuture<'_, Option<Lease>>;

    /// Marks the message `sent` and releases the lease.
    ///
    /// Calling it again on a message that is already `sent` is a no-op.
    fn record_success<'a>(&'a self, lease: &'a Lease) -> StoreFuture<'a, Message>;

    /// Counts a failed attempt, then either reschedules the message or
    /// escalates it, and releases the lease.
    fn record_failure<'a>(&'a self, lease: &'a Lease, error: &'a str)
        -> StoreFuture<'a, Message>;

    /// Operator override: put a `failed` or `escalated` message up for an
    /// attempt right now.
    fn force_retry(&self, id: MessageId) -> StoreFuture<'_, Message>;

    /// Operator override: abandon the message.
    fn reject(&self, id: MessageId) -> StoreFuture<'_, Message>;
}

pub(crate) fn generate_lease_token() -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), 32)
}

/// Applies a success reported under `lease`. Returns whether the message changed.
pub(crate) fn apply_success(
    current: &mut Message,
    lease: &Lease,
    now: DateTime<Utc>,
) -> Result<bool, Error> {
    if current.holds_lease(lease.token()) {
        current.mark_sent(now);
        Ok(true)
    } else if current.status == MessageStatus::Sent {
        Ok(false)
    } else {
        Err(Error::LeaseLost { id: current.id })
    }
}

pub(crate) fn apply_failure(
    current: &mut Message,
    lease: &Lease,
    policy: &BackoffPolicy,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    if !current.holds_lease(lease.token()) {
        return Err(Error::LeaseLost { id: current.id });
    }
    current.mark_failed(policy, error, now);
    Ok(())
}
