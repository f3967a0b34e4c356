//! Behavior of the multi-topic consumer façade: subscription management,
//! round-robin polling, pause/resume and lazy seeks.

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pubsub_log_consumer::{ConsumerError, ConsumerOptions, LogConsumer, SubscriberService};
use support::{received, Call, MockService};

const SUB_A: &str = "projects/p/subscriptions/alpha_group";
const SUB_B: &str = "projects/p/subscriptions/beta_group";

fn options() -> ConsumerOptions {
    ConsumerOptions::new("p", "group")
        .auto_commit(false)
        .max_pull_records(2)
        .retry_backoff(Duration::from_millis(100))
}

fn consumer(service: &Arc<MockService>, opts: ConsumerOptions) -> LogConsumer {
    let service: Arc<dyn SubscriberService> = Arc::clone(service) as _;
    LogConsumer::new(service, opts).expect("consumer construction")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test(start_paused = true)]
async fn subscribe_creates_missing_subscriptions_when_allowed() {
    let service = Arc::new(MockService::new());
    service.register_subscription(SUB_A, "projects/p/topics/alpha");

    let mut consumer = consumer(&service, options());
    consumer.subscribe(&["alpha", "beta"]).await.unwrap();

    assert_eq!(consumer.topics(), &["alpha", "beta"]);
    assert!(service.calls().contains(&Call::CreateSubscription {
        name: SUB_B.to_string(),
        topic: "projects/p/topics/beta".to_string(),
    }));
    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn subscribe_fails_on_missing_subscription_when_creation_disallowed() {
    let service = Arc::new(MockService::new());
    let mut consumer = consumer(
        &service,
        options().allow_subscription_creation(false),
    );
    let err = consumer.subscribe(&["alpha"]).await.unwrap_err();
    assert!(matches!(err, ConsumerError::SubscriptionMissing { .. }));
    assert!(consumer.topics().is_empty());
}

#[tokio::test(start_paused = true)]
async fn poll_visits_topics_round_robin() {
    let service = Arc::new(MockService::new());
    service.register_subscription(SUB_A, "projects/p/topics/alpha");
    service.register_subscription(SUB_B, "projects/p/topics/beta");
    service.script_pull(SUB_A, Ok(vec![received("a1", Some("1"), None, b"a", 0)]));
    service.script_pull(SUB_B, Ok(vec![received("b1", Some("2"), None, b"b", 0)]));

    let mut consumer = consumer(&service, options());
    consumer.subscribe(&["alpha", "beta"]).await.unwrap();
    settle().await;

    let first = consumer.poll(Duration::from_millis(100)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].topic, "alpha");

    // The cursor moved on, so the next poll starts at the other topic.
    let second = consumer.poll(Duration::from_millis(100)).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].topic, "beta");

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn poll_falls_through_empty_topics() {
    let service = Arc::new(MockService::new());
    service.register_subscription(SUB_A, "projects/p/topics/alpha");
    service.register_subscription(SUB_B, "projects/p/topics/beta");
    // Only beta has anything to deliver.
    service.script_pull(SUB_B, Ok(vec![received("b1", Some("9"), None, b"b", 0)]));

    let mut consumer = consumer(&service, options());
    consumer.subscribe(&["alpha", "beta"]).await.unwrap();
    settle().await;

    let records = consumer.poll(Duration::from_millis(50)).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].topic, "beta");

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn poll_without_subscription_is_an_error() {
    let service = Arc::new(MockService::new());
    let mut consumer = consumer(&service, options());
    let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
    assert!(matches!(err, ConsumerError::NotSubscribed));
}

#[tokio::test(start_paused = true)]
async fn paused_topics_are_skipped_until_resumed() {
    let service = Arc::new(MockService::new());
    service.register_subscription(SUB_A, "projects/p/topics/alpha");
    service.register_subscription(SUB_B, "projects/p/topics/beta");
    service.script_pull(SUB_A, Ok(vec![received("a1", Some("1"), None, b"a", 0)]));
    service.script_pull(SUB_B, Ok(vec![received("b1", Some("2"), None, b"b", 0)]));

    let mut consumer = consumer(&service, options());
    consumer.subscribe(&["alpha", "beta"]).await.unwrap();
    settle().await;

    consumer.pause(&["alpha"]);
    assert_eq!(consumer.paused(), vec!["alpha".to_string()]);

    let records = consumer.poll(Duration::from_millis(100)).await.unwrap();
    assert_eq!(records[0].topic, "beta");

    consumer.resume(&["alpha"]);
    assert!(consumer.paused().is_empty());
    let records = consumer.poll(Duration::from_millis(100)).await.unwrap();
    assert_eq!(records[0].topic, "alpha");

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lazy_seeks_are_applied_on_the_next_poll() {
    let service = Arc::new(MockService::new());
    service.register_subscription(SUB_A, "projects/p/topics/alpha");

    let mut consumer = consumer(&service, options());
    consumer.subscribe(&["alpha"]).await.unwrap();
    settle().await;

    consumer.seek_to_beginning(&[]);
    assert!(service
        .calls()
        .iter()
        .all(|call| !matches!(call, Call::Seek { .. })));

    service.script_pull(SUB_A, Ok(vec![received("a1", Some("1"), None, b"a", 0)]));
    let _ = consumer.poll(Duration::from_millis(100)).await.unwrap();

    let seeks: Vec<_> = service
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Seek {
                subscription,
                time_ms,
            } => Some((subscription, time_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(seeks, vec![(SUB_A.to_string(), 0)]);

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn immediate_seek_issues_the_rpc_directly() {
    let service = Arc::new(MockService::new());
    service.register_subscription(SUB_A, "projects/p/topics/alpha");

    let mut consumer = consumer(&service, options());
    consumer.subscribe(&["alpha"]).await.unwrap();

    consumer.seek("alpha", 123_456).await.unwrap();
    assert!(service.calls().contains(&Call::Seek {
        subscription: SUB_A.to_string(),
        time_ms: 123_456,
    }));

    let err = consumer.seek("ghost", 1).await.unwrap_err();
    assert!(matches!(err, ConsumerError::UnknownTopic { .. }));

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn commit_offsets_is_scoped_per_topic() {
    let service = Arc::new(MockService::new());
    service.register_subscription(SUB_A, "projects/p/topics/alpha");
    service.script_pull(
        SUB_A,
        Ok(vec![
            received("a1", Some("5"), None, b"a", 0),
            received("a2", Some("9"), None, b"b", 0),
        ]),
    );

    let mut consumer = consumer(&service, options());
    consumer.subscribe(&["alpha"]).await.unwrap();
    settle().await;

    let records = consumer.poll(Duration::from_millis(100)).await.unwrap();
    assert_eq!(records.len(), 2);

    let mut offsets = HashMap::new();
    offsets.insert("alpha".to_string(), 5_i64);
    consumer.commit_offsets(&offsets, true).await.unwrap();

    let acks = service.acknowledge_calls();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].1, vec!["a1"]);

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_deletes_subscriptions_when_allowed() {
    let service = Arc::new(MockService::new());
    service.register_subscription(SUB_A, "projects/p/topics/alpha");

    let mut consumer = consumer(
        &service,
        options().allow_subscription_deletion(true),
    );
    consumer.subscribe(&["alpha"]).await.unwrap();
    consumer.unsubscribe().await.unwrap();
    settle().await;

    assert!(service.calls().contains(&Call::DeleteSubscription {
        name: SUB_A.to_string(),
    }));
    assert!(consumer.topics().is_empty());
}

#[tokio::test(start_paused = true)]
async fn list_topics_returns_short_names() {
    let service = Arc::new(MockService::new());
    service.register_topic("alpha");
    service.register_topic("beta");

    let consumer = consumer(&service, options());
    let topics = consumer.list_topics().await.unwrap();
    assert_eq!(topics, vec!["alpha", "beta"]);
}
