use std::sync::Arc;

use crate::{
    clock::{Clock, SystemClock},
    config::Config,
    error::Error,
    gateway::DeliveryGateway,
    message::{Message, MessageId, MessageStatus, NewMessage},
    scheduler::{Scheduler, SchedulerStatus, TickReport},
    store::{sqlite::SqliteStore, MessageStore},
};

pub const DEFAULT_LIST_LIMIT: u32 = 100;
pub const MAX_LIST_LIMIT: u32 = 1000;

pub struct Service {
    store: Arc<dyn MessageStore>,
    scheduler: Scheduler,
    config: Config,
}

impl Service {
    /// Opens the SQLite store named by `config` and wires a scheduler to it.
    ///
    /// The scheduler is not started.
    pub async fn connect_with(
        config: Config,
        gateway: Arc<dyn DeliveryGateway>,
    ) -> Result<Self, Error> {
        Self::connect_with_clock(config, gateway, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(
        config: Config,
        gateway: Arc<dyn DeliveryGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let store: Arc<dyn MessageStore> =
            Arc::new(SqliteStore::connect(&config, clock.clone()).await?);

        let scheduler = Scheduler::builder()
            .store(store.clone())
            .gateway(gateway)
            .config(config.clone())
            .clock(clock)
            .build()?;

        Ok(Self::new(store, scheduler, config))
    }

    pub fn new(store: Arc<dyn MessageStore>, scheduler: Scheduler, config: Config) -> Self {
        Self {
            store,
            scheduler,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stores a new `pending` message without attempting it.
    pub async fn enqueue(&self, new: NewMessage) -> Result<Message, Error> {
        let message = self.store.insert(new).await?;

        tracing::debug!(id = %message.id, kind = %message.kind, "message enqueued");

        Ok(message)
    }

    /// Enqueues a message and makes its first delivery attempt right away.
    pub async fn send(&self, new: NewMessage) -> Result<Message, Error> {
        let message = self.enqueue(new).await?;
        self.scheduler.deliver(message.id).await
    }

    pub async fn force_retry(&self, id: MessageId) -> Result<Message, Error> {
        let message = self.store.force_retry(id).await?;

        tracing::info!(%id, retry_count = message.retry_count, "retry forced by operator");

        Ok(message)
    }

    pub async fn reject(&self, id: MessageId) -> Result<Message, Error> {
        let message = self.store.reject(id).await?;

        tracing::info!(%id, "message rejected by operator");

        Ok(message)
    }

    pub async fn get(&self, id: MessageId) -> Result<Message, Error> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::message_not_found(id))
    }

    pub async fn list(
        &self,
        status: Option<MessageStatus>,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, Error> {
        let limit = match limit {
            None => DEFAULT_LIST_LIMIT,
            Some(0) => return Err(Error::invalid_parameter("limit must be positive")),
            Some(n) => n.min(MAX_LIST_LIMIT),
        };

        self.store.list(status, limit).await
    }

    /// Runs one scheduler tick now. Fails with `Conflict` if one is in progress.
    pub async fn tick(&self) -> Result<TickReport, Error> {
        self.scheduler
            .tick()
            .await?
            .ok_or_else(|| Error::conflict("a scheduler tick is already in progress"))
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.scheduler.status().await
    }
}
