use std::{future::Future, sync::Arc};

use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use config::Config;
use error::Error;
use gateway::DeliveryGateway;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod message;
pub mod policy;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod ticker;

/// Returns a builder for the main application.
///
/// `gateway_factory` receives a copy of the loaded config and builds the transport the
/// scheduler delivers through.
#[bon::builder(finish_fn = start)]
pub async fn run<K, F, G>(gateway_factory: K) -> eyre::Result<()>
where
    K: FnOnce(Config) -> F,
    F: Future<Output = Result<G, Error>>,
    G: DeliveryGateway,
{
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("REDELIVER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("REDELIVER_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;

    let gateway = gateway_factory(config.clone()).await?;
    let service = service::Service::connect_with(config.clone(), Arc::new(gateway)).await?;

    service.scheduler().start().await?;

    let data = Data::new(service);

    let server = HttpServer::new({
        let data = data.clone();
        move || {
            let json_cfg = JsonConfig::default().content_type_required(false);

            App::new()
                .wrap(TracingLogger::default())
                .wrap(NormalizePath::new(TrailingSlash::Trim))
                .configure(api::configure)
                .app_data(data.clone())
                .app_data(json_cfg)
        }
    })
    .bind((config.host(), config.port()))?
    .run();

    let served = server.await;

    // Let an in-flight tick finish its batch before the process exits.
    data.scheduler().stop().await;

    served?;

    Ok(())
}
