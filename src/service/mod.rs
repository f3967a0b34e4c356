//! The narrow RPC surface the subscriber runtime is written against.
//!
//! Production code talks to the real service through [`grpc::GrpcSubscriberService`];
//! tests substitute a scripted implementation. Methods return the raw gRPC
//! status so retry loops can classify failures themselves.

pub mod grpc;

use async_trait::async_trait;
use google_cloud_googleapis::pubsub::v1::ReceivedMessage;
use tonic::Status;

pub use grpc::GrpcSubscriberService;

/// Result type for raw RPC calls.
pub type RpcResult<T> = std::result::Result<T, Status>;

/// The subset of a subscription resource the consumer cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Full resource name, `projects/<project>/subscriptions/<name>`.
    pub name: String,
    /// Full topic resource name the subscription is bound to.
    pub topic: String,
    /// Server-side initial ack deadline in seconds.
    pub ack_deadline_seconds: i32,
}

/// Pub/Sub operations consumed by the subscriber runtime.
#[async_trait]
pub trait SubscriberService: Send + Sync + 'static {
    /// Pull up to `max_messages` from `subscription`. May return fewer, or
    /// an empty batch once the server gives up waiting.
    async fn pull(&self, subscription: &str, max_messages: i32) -> RpcResult<Vec<ReceivedMessage>>;

    /// Acknowledge delivered messages.
    async fn acknowledge(&self, subscription: &str, ack_ids: Vec<String>) -> RpcResult<()>;

    /// Extend (or zero, to request immediate redelivery) the ack deadline of
    /// delivered messages.
    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline_seconds: i32,
    ) -> RpcResult<()>;

    /// Server-side seek to a publish-time instant, milliseconds since epoch.
    async fn seek_to_time(&self, subscription: &str, time_ms: i64) -> RpcResult<()>;

    async fn get_subscription(&self, name: &str) -> RpcResult<SubscriptionInfo>;

    async fn create_subscription(
        &self,
        name: &str,
        topic: &str,
        ack_deadline_seconds: i32,
    ) -> RpcResult<SubscriptionInfo>;

    async fn delete_subscription(&self, name: &str) -> RpcResult<()>;

    /// Short names of every topic in the project.
    async fn list_topics(&self, project: &str) -> RpcResult<Vec<String>>;
}
