use redeliver::gateway::webhook::WebhookGateway;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    redeliver::run()
        .gateway_factory(|config| std::future::ready(WebhookGateway::from_config(&config)))
        .start()
        .await
}
