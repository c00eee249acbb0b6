//! Outbound message types and their delivery state machine.
//!
//! A message is created in `Pending` by the enqueue path and makes its first
//! delivery attempt right away. From there:
//!
//! 1. A successful attempt moves it to `Sent` (terminal).
//! 2. A failed attempt moves it to `Failed`, bumps `retry_count` and pushes
//!    `next_eligible_at` forward according to the [`BackoffPolicy`].
//! 3. The failure that brings `retry_count` to `max_retries` moves it to
//!    `Escalated` (terminal, needs a human).
//!
//! Operators may reject a message (`Rejected`, terminal) or force an immediate
//! retry, which puts it back into `Failed` with `next_eligible_at` set to now.
//!
//! The transition methods here are shared by every [`MessageStore`] backend so
//! that they agree on the semantics; the stores only decide how to apply them
//! atomically.
//!
//! [`MessageStore`]: crate::store::MessageStore

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::Error, policy::BackoffPolicy};

/// Unique, opaque identifier of a message.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who the message is addressed to. Informational only; scheduling ignores it.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageKind {
    Customer,
    Supplier,
    Internal,
}

/// Delivery state of a message.
///
/// `Sent`, `Escalated` and `Rejected` are terminal: nothing automatic ever
/// moves a message out of them.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Enqueued, first attempt not yet made
    Pending,
    /// Delivered by the gateway
    Sent,
    /// Last attempt failed, waiting for its next eligibility window
    Failed,
    /// Retry ceiling reached, waiting for an operator
    Escalated,
    /// Abandoned by an operator
    Rejected,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Escalated | Self::Rejected)
    }
}

/// Content handed to the delivery gateway. The scheduler never looks inside.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
}

/// Input of the enqueue path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewMessage {
    pub kind: MessageKind,
    pub payload: Payload,
    /// Overrides the configured ceiling for this message.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewMessage {
    pub fn new(kind: MessageKind, payload: Payload) -> Self {
        Self {
            kind,
            payload,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    pub status: MessageStatus,
    /// Delivery attempts made so far
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// No attempt may start before this instant
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub payload: Payload,
    /// Expiry of the processing lease, if one has been taken
    pub leased_until: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub(crate) lease_token: Option<String>,
    /// Bumped on every write; stores use it for compare-and-swap updates.
    #[serde(skip)]
    pub(crate) version: i64,
}

impl Message {
    pub(crate) fn new(
        id: MessageId,
        new: NewMessage,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, Error> {
        let max_retries = validate_max_retries(new.max_retries.unwrap_or(default_max_retries))?;

        Ok(Self {
            id,
            kind: new.kind,
            status: MessageStatus::Pending,
            retry_count: 0,
            max_retries,
            created_at: now,
            last_attempt_at: None,
            next_eligible_at: None,
            last_error: None,
            payload: new.payload,
            leased_until: None,
            lease_token: None,
            version: 0,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a live lease currently blocks other writers.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease_token.is_some() && self.leased_until.is_some_and(|until| until > now)
    }

    pub(crate) fn holds_lease(&self, token: &str) -> bool {
        self.lease_token.as_deref() == Some(token)
    }

    pub(crate) fn can_acquire(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, MessageStatus::Pending | MessageStatus::Failed) && !self.is_leased(now)
    }

    pub(crate) fn lease(&mut self, token: String, until: DateTime<Utc>) {
        self.lease_token = Some(token);
        self.leased_until = Some(until);
    }

    fn release(&mut self) {
        self.lease_token = None;
        self.leased_until = None;
    }

    pub(crate) fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.status = MessageStatus::Sent;
        self.last_attempt_at = Some(now);
        self.release();
    }

    /// Records a failed attempt, escalating once the ceiling is reached.
    ///
    /// `retry_count` never passes `max_retries`, and `next_eligible_at` never
    /// moves backwards here.
    pub(crate) fn mark_failed(&mut self, policy: &BackoffPolicy, error: &str, now: DateTime<Utc>) {
        let next = policy.next_eligible_at(self);

        if self.retry_count < self.max_retries {
            self.retry_count += 1;
        }
        self.last_attempt_at = Some(now);
        self.last_error = Some(error.to_owned());
        self.next_eligible_at = Some(self.next_eligible_at.map_or(next, |prev| prev.max(next)));
        self.status = if policy.should_escalate(self) {
            MessageStatus::Escalated
        } else {
            MessageStatus::Failed
        };
        self.release();
    }

    /// Operator override: make the message eligible right now.
    ///
    /// An escalated message gets exactly one more automatic attempt.
    pub(crate) fn force_retry(&mut self, now: DateTime<Utc>) -> Result<(), Error> {
        match self.status {
            MessageStatus::Failed | MessageStatus::Escalated => {}
            status => return Err(Error::invalid_transition(self.id, "retry", status)),
        }
        if self.is_leased(now) {
            return Err(Error::in_flight(self.id));
        }

        if self.retry_count >= self.max_retries {
            self.max_retries = self.retry_count + 1;
        }
        self.status = MessageStatus::Failed;
        self.next_eligible_at = Some(now);
        self.release();

        Ok(())
    }

    /// Operator override: abandon the message. Returns `false` if it was
    /// already rejected.
    pub(crate) fn reject(&mut self, now: DateTime<Utc>) -> Result<bool, Error> {
        match self.status {
            MessageStatus::Rejected => return Ok(false),
            MessageStatus::Sent => {
                return Err(Error::invalid_transition(self.id, "reject", self.status))
            }
            MessageStatus::Pending | MessageStatus::Failed | MessageStatus::Escalated => {}
        }
        if self.is_leased(now) {
            return Err(Error::in_flight(self.id));
        }

        self.status = MessageStatus::Rejected;
        self.release();

        Ok(true)
    }
}

pub(crate) fn validate_max_retries(max_retries: u32) -> Result<u32, Error> {
    if max_retries == 0 {
        return Err(Error::invalid_parameter("max_retries must be positive"));
    }
    Ok(max_retries)
}
