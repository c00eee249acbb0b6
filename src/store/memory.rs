//! In-process [`MessageStore`], for tests and embedding.
//!
//! Nothing survives a restart. All operations run under one mutex, which makes
//! each of them trivially atomic.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::{future, FutureExt as _};

use super::{apply_failure, apply_success, generate_lease_token, Lease, MessageStore, StoreFuture};
use crate::{
    clock::Clock,
    error::Error,
    message::{Message, MessageId, MessageStatus, NewMessage},
    policy::BackoffPolicy,
};

#[derive(Default)]
struct Messages {
    by_id: BTreeMap<MessageId, Message>,
    last_id: i64,
}

#[derive(Clone)]
pub struct MemoryStore {
    messages: Arc<Mutex<Messages>>,
    policy: BackoffPolicy,
    lease_timeout: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(policy: BackoffPolicy, lease_timeout: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self {
            messages: Arc::new(Mutex::new(Messages::default())),
            policy,
            lease_timeout,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Messages> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` against one message and bumps its version if `f` reports a change.
    fn update<T>(
        &self,
        id: MessageId,
        f: impl FnOnce(&mut Message) -> Result<(T, bool), Error>,
    ) -> Result<(Message, T), Error> {
        let mut messages = self.lock();
        let message = messages
            .by_id
            .get_mut(&id)
            .ok_or_else(|| Error::message_not_found(id))?;

        // Work on a copy so a failed transition leaves no trace.
        let mut next = message.clone();
        let (out, changed) = f(&mut next)?;
        if changed {
            next.version += 1;
            *message = next.clone();
        }

        Ok((next, out))
    }

    fn insert_sync(&self, new: NewMessage) -> Result<Message, Error> {
        let now = self.clock.now();
        let mut messages = self.lock();

        let id = MessageId(messages.last_id + 1);
        let message = Message::new(id, new, self.policy.default_max_retries(), now)?;

        messages.last_id = id.0;
        messages.by_id.insert(id, message.clone());

        Ok(message)
    }

    fn select_sync(&self, now: DateTime<Utc>, limit: u32) -> Vec<Message> {
        let messages = self.lock();

        let mut eligible: Vec<Message> = messages
            .by_id
            .values()
            .filter(|m| self.policy.is_eligible(m, now) && !m.is_leased(now))
            .cloned()
            .collect();
        eligible.sort_by_key(|m| (m.next_eligible_at, m.id));
        eligible.truncate(limit as usize);

        eligible
    }

    fn try_acquire_sync(&self, id: MessageId) -> Option<Lease> {
        let now = self.clock.now();
        let mut messages = self.lock();

        let message = messages.by_id.get_mut(&id)?;
        if !message.can_acquire(now) {
            return None;
        }

        let token = generate_lease_token();
        message.lease(token.clone(), now + self.lease_timeout);
        message.version += 1;

        Some(Lease::new(message.clone(), token))
    }
}

impl MessageStore for MemoryStore {
    fn insert(&self, new: NewMessage) -> StoreFuture<'_, Message> {
        future::ready(self.insert_sync(new)).boxed()
    }

    fn get(&self, id: MessageId) -> StoreFuture<'_, Option<Message>> {
        future::ready(Ok(self.lock().by_id.get(&id).cloned())).boxed()
    }

    fn list(&self, status: Option<MessageStatus>, limit: u32) -> StoreFuture<'_, Vec<Message>> {
        let messages = self
            .lock()
            .by_id
            .values()
            .rev()
            .filter(|m| status.map_or(true, |s| m.status == s))
            .take(limit as usize)
            .cloned()
            .collect();

        future::ready(Ok(messages)).boxed()
    }

    fn select_eligible_failed(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StoreFuture<'_, Vec<Message>> {
        future::ready(Ok(self.select_sync(now, limit))).boxed()
    }

    fn try_acquire(&self, id: MessageId) -> StoreFuture<'_, Option<Lease>> {
        future::ready(Ok(self.try_acquire_sync(id))).boxed()
    }

    fn record_success<'a>(&'a self, lease: &'a Lease) -> StoreFuture<'a, Message> {
        let now = self.clock.now();
        let result = self
            .update(lease.id(), |m| Ok(((), apply_success(m, lease, now)?)))
            .map(|(m, ())| m);

        future::ready(result).boxed()
    }

    fn record_failure<'a>(
        &'a self,
        lease: &'a Lease,
        error: &'a str,
    ) -> StoreFuture<'a, Message> {
        let now = self.clock.now();
        let result = self
            .update(lease.id(), |m| {
                apply_failure(m, lease, &self.policy, error, now)?;
                Ok(((), true))
            })
            .map(|(m, ())| m);

        future::ready(result).boxed()
    }

    fn force_retry(&self, id: MessageId) -> StoreFuture<'_, Message> {
        let now = self.clock.now();
        let result = self
            .update(id, |m| {
                m.force_retry(now)?;
                Ok(((), true))
            })
            .map(|(m, ())| m);

        future::ready(result).boxed()
    }

    fn reject(&self, id: MessageId) -> StoreFuture<'_, Message> {
        let now = self.clock.now();
        let result = self
            .update(id, |m| Ok(((), m.reject(now)?)))
            .map(|(m, ())| m);

        future::ready(result).boxed()
    }
}
