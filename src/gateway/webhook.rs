use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use url::Url;

use super::{DeliveryError, DeliveryGateway};
use crate::{
    config::Config,
    error::Error,
    message::{Message, MessageId, MessageKind, Payload},
};

/// Delivers messages by POSTing them as JSON to an HTTP endpoint.
///
/// Any 2xx response counts as delivered.
#[derive(Clone)]
pub struct WebhookGateway {
    client: reqwest::Client,
    endpoint: Url,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    id: MessageId,
    kind: MessageKind,
    payload: &'a Payload,
}

impl WebhookGateway {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::internal)?;

        Ok(Self { client, endpoint })
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let endpoint = config
            .gateway_url()
            .cloned()
            .ok_or_else(|| Error::invalid_parameter("REDELIVER_GATEWAY_URL must be set"))?;

        Self::new(endpoint, config.attempt_timeout())
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl DeliveryGateway for WebhookGateway {
    fn send<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            let body = WebhookBody {
                id: message.id,
                kind: message.kind,
                payload: &message.payload,
            };

            let response = self
                .client
                .post(self.endpoint.clone())
                .json(&body)
                .send()
                .await
                .map_err(|e| DeliveryError::failed(format!("request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(DeliveryError::failed(format!(
                    "endpoint responded with {status}"
                )));
            }

            Ok(())
        })
    }
}
