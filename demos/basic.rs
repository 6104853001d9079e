use std::time::Duration;

use webhook_engine::{EngineConfig, NewSubscription, RetryPolicy, WebhookEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("webhook_engine=debug").init();

    let mut engine = WebhookEngine::new(
        EngineConfig::default().with_sweep_interval(Duration::from_secs(1)),
    )?;

    let created = engine
        .registry()
        .create(
            NewSubscription::new("https://example.com/webhook", ["order.created", "order.paid"])
                .with_header("X-Tenant", "tenant_a")
                .with_retry_policy(RetryPolicy::new(3, 500, 2.0))
                .with_timeout_ms(5_000),
        )
        .await?;
    println!("subscription {} secret {}", created.subscription.id, created.secret);

    engine.start_sweeper();

    let ids = engine
        .trigger("order.created", serde_json::json!({ "orderId": 123 }), None)
        .await;

    tokio::time::sleep(Duration::from_secs(5)).await;

    for delivery in engine.registry().deliveries(&created.subscription.id, 10).await? {
        println!(
            "{} {} attempts={} error={:?}",
            delivery.id,
            delivery.status,
            delivery.attempts.len(),
            delivery.error_message
        );
    }
    println!("triggered {} deliveries", ids.len());

    engine.shutdown().await;
    Ok(())
}
