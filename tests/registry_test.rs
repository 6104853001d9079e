mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::*;
use serde_json::json;
use webhook_engine::{
    DeliveryStatus, EventType, NewSubscription, RegistryError, RetryPolicy, StorageError,
    SubscriptionId, SubscriptionUpdate, ValidationError, WebhookEngine, SECRET_PREFIX,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

#[test_log::test(tokio::test)]
async fn test_secret_is_only_returned_at_creation() {
    let engine = WebhookEngine::new(test_config()).unwrap();
    let created = engine
        .registry()
        .create(
            NewSubscription::new("https://hooks.example.com/in", ["ticket.created"])
                .with_description("helpdesk sync"),
        )
        .await
        .unwrap();

    assert!(created.secret.starts_with(SECRET_PREFIX));
    assert_eq!(created.secret.len(), SECRET_PREFIX.len() + 64);

    let view = engine.registry().get(&created.subscription.id).await.unwrap().unwrap();
    let serialized = serde_json::to_string(&view).unwrap();
    assert!(!serialized.contains(&created.secret));
    assert_eq!(view.description.as_deref(), Some("helpdesk sync"));

    let listed = serde_json::to_string(&engine.registry().list().await.unwrap()).unwrap();
    assert!(!listed.contains(&created.secret));
}

#[test_log::test(tokio::test)]
async fn test_secrets_are_unique() {
    let engine = WebhookEngine::new(test_config()).unwrap();
    let request = NewSubscription::new("https://hooks.example.com/in", ["ticket.created"]);

    let a = engine.registry().create(request.clone()).await.unwrap();
    let b = engine.registry().create(request).await.unwrap();
    assert_ne!(a.secret, b.secret);
    assert_ne!(a.subscription.id, b.subscription.id);
}

#[test_log::test(tokio::test)]
async fn test_create_rejects_invalid_configuration() {
    let engine = WebhookEngine::new(test_config()).unwrap();
    let registry = engine.registry();

    let err = registry
        .create(NewSubscription::new("ftp://example.com/in", ["ticket.created"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Validation(ValidationError::UnsupportedScheme(_))
    ));

    let err = registry
        .create(NewSubscription::new("not a url", ["ticket.created"]))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(ValidationError::InvalidUrl(_))));

    let err = registry
        .create(NewSubscription::new(
            "https://example.com/in",
            Vec::<EventType>::new(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(ValidationError::NoEvents)));

    let err = registry
        .create(NewSubscription::new("https://example.com/in", ["ticket.created"]).with_timeout_ms(10))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Validation(ValidationError::InvalidTimeout { actual: 10, .. })
    ));

    let err = registry
        .create(
            NewSubscription::new("https://example.com/in", ["ticket.created"])
                .with_retry_policy(RetryPolicy::new(3, 1_000, 0.5)),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Validation(ValidationError::InvalidRetryPolicy(_))
    ));

    let err = registry
        .create(
            NewSubscription::new("https://example.com/in", ["ticket.created"])
                .with_header("Bad Header", "value"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Validation(ValidationError::InvalidHeader { .. })
    ));

    assert!(registry.list().await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_update_changes_config_and_keeps_counters() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(CaptureResponder::new())
        .mount(&server)
        .await;

    let engine = WebhookEngine::new(test_config()).unwrap();
    let created = engine
        .registry()
        .create(NewSubscription::new(
            format!("{}/webhook", server.uri()),
            ["ticket.created"],
        ))
        .await
        .unwrap();
    let id = created.subscription.id;

    engine.trigger("ticket.created", json!({}), None).await;

    let update = SubscriptionUpdate {
        events: Some(BTreeSet::from([
            EventType::from("ticket.created"),
            EventType::from("ticket.closed"),
        ])),
        timeout_ms: Some(5_000),
        is_active: Some(false),
        ..Default::default()
    };
    let view = engine.registry().update(&id, update).await.unwrap();

    assert_eq!(view.events.len(), 2);
    assert_eq!(view.timeout_ms, 5_000);
    assert!(!view.is_active);
    assert_eq!(view.total_deliveries, 1);
    assert_eq!(view.successful_deliveries, 1);

    // Deactivated subscriptions are no longer fanned out to.
    let ids = engine.trigger("ticket.closed", json!({}), None).await;
    assert!(ids.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_update_validates_and_reports_missing() {
    let engine = WebhookEngine::new(test_config()).unwrap();
    let created = engine
        .registry()
        .create(NewSubscription::new("https://example.com/in", ["ticket.created"]))
        .await
        .unwrap();

    let err = engine
        .registry()
        .update(
            &created.subscription.id,
            SubscriptionUpdate {
                url: Some("mailto:ops@example.com".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Validation(_)));

    let missing = SubscriptionId::new();
    let err = engine
        .registry()
        .update(
            &missing,
            SubscriptionUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Storage(StorageError::SubscriptionNotFound(id)) if id == missing
    ));

    let err = engine.registry().test_subscription(&missing).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Storage(StorageError::SubscriptionNotFound(_))
    ));
}

#[test_log::test(tokio::test)]
async fn test_delete_cascades_to_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(CaptureResponder::new())
        .mount(&server)
        .await;

    let engine = WebhookEngine::new(test_config()).unwrap();
    let url = format!("{}/webhook", server.uri());
    let doomed = engine
        .registry()
        .create(NewSubscription::new(&url, ["ticket.created"]))
        .await
        .unwrap();
    let survivor = engine
        .registry()
        .create(NewSubscription::new(&url, ["ticket.created"]))
        .await
        .unwrap();

    engine.trigger("ticket.created", json!({ "n": 1 }), None).await;
    engine.trigger("ticket.created", json!({ "n": 2 }), None).await;

    let registry = engine.registry();
    assert_eq!(registry.deliveries(&doomed.subscription.id, 10).await.unwrap().len(), 2);

    assert!(registry.delete(&doomed.subscription.id).await.unwrap());
    assert!(!registry.delete(&doomed.subscription.id).await.unwrap());

    assert!(registry.get(&doomed.subscription.id).await.unwrap().is_none());
    assert!(registry.deliveries(&doomed.subscription.id, 10).await.unwrap().is_empty());
    assert_eq!(registry.deliveries(&survivor.subscription.id, 10).await.unwrap().len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_history_is_newest_first_and_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(CaptureResponder::new())
        .mount(&server)
        .await;

    let engine = WebhookEngine::new(test_config()).unwrap();
    let created = engine
        .registry()
        .create(NewSubscription::new(
            format!("{}/webhook", server.uri()),
            ["ticket.created"],
        ))
        .await
        .unwrap();

    for n in 0..3 {
        engine.trigger("ticket.created", json!({ "n": n }), None).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let history = engine
        .registry()
        .deliveries(&created.subscription.id, 2)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].payload_json().unwrap()["data"]["n"], 2);
    assert_eq!(history[1].payload_json().unwrap()["data"]["n"], 1);
}

#[test_log::test(tokio::test)]
async fn test_delivery_stats_by_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(CaptureResponder::new())
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(CaptureResponder::with_status(500))
        .mount(&server)
        .await;

    let engine = WebhookEngine::new(test_config()).unwrap();
    let healthy = engine
        .registry()
        .create(NewSubscription::new(
            format!("{}/ok", server.uri()),
            ["ticket.created"],
        ))
        .await
        .unwrap();
    engine
        .registry()
        .create(
            NewSubscription::new(format!("{}/broken", server.uri()), ["ticket.created"])
                .with_retry_policy(fast_retries(0)),
        )
        .await
        .unwrap();

    engine.trigger("ticket.created", json!({}), None).await;
    engine.trigger("ticket.created", json!({}), None).await;

    let window = chrono::Duration::hours(1);
    let all = engine.registry().delivery_stats(None, window).await.unwrap();
    assert_eq!(all.len(), 2);

    let success = all.iter().find(|s| s.status == DeliveryStatus::Success).unwrap();
    assert_eq!(success.count, 2);
    assert!(success.avg_response_time_ms.is_some());

    let failed = all.iter().find(|s| s.status == DeliveryStatus::Failed).unwrap();
    assert_eq!(failed.count, 2);

    let scoped = engine
        .registry()
        .delivery_stats(Some(&healthy.subscription.id), window)
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].status, DeliveryStatus::Success);
    assert_eq!(scoped[0].count, 2);

    // Nothing was created in the future.
    let empty = engine
        .registry()
        .delivery_stats(None, chrono::Duration::milliseconds(-1_000))
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_update_sets_and_clears_description() {
    let engine = WebhookEngine::new(test_config()).unwrap();
    let created = engine
        .registry()
        .create(
            NewSubscription::new("https://example.com/in", ["ticket.created"])
                .with_description("helpdesk sync"),
        )
        .await
        .unwrap();
    let id = created.subscription.id;

    let untouched = engine
        .registry()
        .update(
            &id,
            SubscriptionUpdate {
                timeout_ms: Some(2_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(untouched.description.as_deref(), Some("helpdesk sync"));

    let renamed = engine
        .registry()
        .update(
            &id,
            SubscriptionUpdate {
                description: Some(Some("crm sync".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.description.as_deref(), Some("crm sync"));

    let cleared = engine
        .registry()
        .update(
            &id,
            SubscriptionUpdate {
                description: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cleared.description, None);
    assert_eq!(engine.registry().get(&id).await.unwrap().unwrap().description, None);
}

#[test_log::test(tokio::test)]
async fn test_create_rejects_wildcard_event_types() {
    let engine = WebhookEngine::new(test_config()).unwrap();
    let err = engine
        .registry()
        .create(NewSubscription::new("https://example.com/in", ["ticket.*"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Validation(ValidationError::InvalidEventType(name)) if name == "ticket.*"
    ));
}
