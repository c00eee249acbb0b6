//! The external transport that actually delivers a message.
//!
//! The scheduler treats a gateway as a black box: a send either succeeds or
//! fails with some diagnostic text. Why it failed is the gateway's business.

use std::time::Duration;

use futures_util::future::BoxFuture;
use snafu::Snafu;

use crate::message::Message;

pub mod webhook;

#[derive(Debug, Snafu)]
pub enum DeliveryError {
    #[snafu(display("{reason}"))]
    Failed { reason: String },

    #[snafu(display("delivery timed out after {}s", timeout.as_secs()))]
    TimedOut { timeout: Duration },

    #[snafu(display("delivery gateway panicked"))]
    Panicked,
}

impl DeliveryError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

pub trait DeliveryGateway: Send + Sync + 'static {
    /// Attempts to transmit the message's payload once.
    ///
    /// Implementations report every fault as a [`DeliveryError`]; they don't
    /// retry on their own behalf.
    fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), DeliveryError>>;
}
