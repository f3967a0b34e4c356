//! Production [`SubscriberService`] over the generated gRPC stubs.
//!
//! Channels are pooled per endpoint so every subscriber in the process
//! shares one connection. If `PUBSUB_EMULATOR_HOST` is set the client
//! connects there and skips authentication entirely; otherwise a Bearer
//! token from the default credential chain is attached to every request.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use google_cloud_googleapis::pubsub::v1::{
    publisher_client::PublisherClient, seek_request, subscriber_client::SubscriberClient,
    AcknowledgeRequest, DeleteSubscriptionRequest, GetSubscriptionRequest, ListTopicsRequest,
    ModifyAckDeadlineRequest, PullRequest, ReceivedMessage, SeekRequest, Subscription,
};
use google_cloud_token::{TokenSource, TokenSourceProvider};
use once_cell::sync::Lazy;
use prost_types::Timestamp;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::{Request, Status};

use crate::error::{ConsumerError, Result};
use crate::service::{RpcResult, SubscriberService, SubscriptionInfo};

const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";
const TOPIC_SEGMENT: &str = "/topics/";

/// Channels shared across all clients in the process, keyed by endpoint.
static CHANNEL_POOL: Lazy<DashMap<String, Channel>> = Lazy::new(DashMap::new);

/// gRPC-backed service implementation.
pub struct GrpcSubscriberService {
    channel: Channel,
    token_source: Option<std::sync::Arc<dyn TokenSource>>,
    rpc_timeout: Duration,
}

impl GrpcSubscriberService {
    /// Connect to the emulator or the production endpoint, acquiring
    /// credentials when needed. `rpc_timeout` is applied to every call.
    pub async fn connect(rpc_timeout: Duration) -> Result<Self> {
        let emulator_host = std::env::var("PUBSUB_EMULATOR_HOST").ok();
        let endpoint = emulator_host
            .as_ref()
            .map(|host| format!("http://{host}"))
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        let channel = match CHANNEL_POOL.get(&endpoint) {
            Some(pooled) => pooled.clone(),
            None => {
                log::debug!("creating gRPC channel for {endpoint}");
                let channel = Channel::from_shared(endpoint.clone())
                    .map_err(|e| ConsumerError::Transport(e.to_string()))?
                    .connect()
                    .await
                    .map_err(|e| ConsumerError::Transport(e.to_string()))?;
                CHANNEL_POOL.insert(endpoint, channel.clone());
                channel
            }
        };

        let token_source = if emulator_host.is_some() {
            None
        } else {
            let config = google_cloud_auth::project::Config::default();
            let provider = google_cloud_auth::token::DefaultTokenSourceProvider::new(config)
                .await
                .map_err(|e| ConsumerError::Auth(e.to_string()))?;
            Some(provider.token_source())
        };

        Ok(Self {
            channel,
            token_source,
            rpc_timeout,
        })
    }

    fn subscriber(&self) -> SubscriberClient<Channel> {
        SubscriberClient::new(self.channel.clone())
            .max_decoding_message_size(16 * 1024 * 1024)
            .max_encoding_message_size(16 * 1024 * 1024)
    }

    fn publisher(&self) -> PublisherClient<Channel> {
        PublisherClient::new(self.channel.clone())
    }

    async fn request<T>(&self, payload: T) -> RpcResult<Request<T>> {
        let mut request = Request::new(payload);
        request.set_timeout(self.rpc_timeout);
        if let Some(source) = &self.token_source {
            let token = source
                .token()
                .await
                .map_err(|e| Status::unauthenticated(format!("token acquisition failed: {e}")))?;
            let value: MetadataValue<Ascii> = MetadataValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Status::unauthenticated(format!("malformed token: {e}")))?;
            request.metadata_mut().insert("authorization", value);
        }
        Ok(request)
    }
}

fn subscription_info(sub: Subscription) -> SubscriptionInfo {
    SubscriptionInfo {
        name: sub.name,
        topic: sub.topic,
        ack_deadline_seconds: sub.ack_deadline_seconds,
    }
}

#[async_trait]
impl SubscriberService for GrpcSubscriberService {
    async fn pull(&self, subscription: &str, max_messages: i32) -> RpcResult<Vec<ReceivedMessage>> {
        let request = self
            .request(PullRequest {
                subscription: subscription.to_string(),
                max_messages,
                ..Default::default()
            })
            .await?;
        let response = self.subscriber().pull(request).await?;
        Ok(response.into_inner().received_messages)
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: Vec<String>) -> RpcResult<()> {
        let request = self
            .request(AcknowledgeRequest {
                subscription: subscription.to_string(),
                ack_ids,
            })
            .await?;
        self.subscriber().acknowledge(request).await?;
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline_seconds: i32,
    ) -> RpcResult<()> {
        let request = self
            .request(ModifyAckDeadlineRequest {
                subscription: subscription.to_string(),
                ack_ids,
                ack_deadline_seconds,
            })
            .await?;
        self.subscriber().modify_ack_deadline(request).await?;
        Ok(())
    }

    async fn seek_to_time(&self, subscription: &str, time_ms: i64) -> RpcResult<()> {
        let request = self
            .request(SeekRequest {
                subscription: subscription.to_string(),
                target: Some(seek_request::Target::Time(Timestamp {
                    seconds: time_ms / 1000,
                    nanos: ((time_ms % 1000) * 1_000_000) as i32,
                })),
            })
            .await?;
        self.subscriber().seek(request).await?;
        Ok(())
    }

    async fn get_subscription(&self, name: &str) -> RpcResult<SubscriptionInfo> {
        let request = self
            .request(GetSubscriptionRequest {
                subscription: name.to_string(),
            })
            .await?;
        let response = self.subscriber().get_subscription(request).await?;
        Ok(subscription_info(response.into_inner()))
    }

    async fn create_subscription(
        &self,
        name: &str,
        topic: &str,
        ack_deadline_seconds: i32,
    ) -> RpcResult<SubscriptionInfo> {
        let request = self
            .request(Subscription {
                name: name.to_string(),
                topic: topic.to_string(),
                ack_deadline_seconds,
                ..Default::default()
            })
            .await?;
        let response = self.subscriber().create_subscription(request).await?;
        Ok(subscription_info(response.into_inner()))
    }

    async fn delete_subscription(&self, name: &str) -> RpcResult<()> {
        let request = self
            .request(DeleteSubscriptionRequest {
                subscription: name.to_string(),
            })
            .await?;
        self.subscriber().delete_subscription(request).await?;
        Ok(())
    }

    async fn list_topics(&self, project: &str) -> RpcResult<Vec<String>> {
        let project_path = format!("projects/{project}");
        let mut names = Vec::new();
        let mut page_token = String::new();
        loop {
            let request = self
                .request(ListTopicsRequest {
                    project: project_path.clone(),
                    page_size: 1000,
                    page_token: page_token.clone(),
                })
                .await?;
            let response = self.publisher().list_topics(request).await?.into_inner();
            for topic in response.topics {
                // Strip `projects/<p>/topics/`; callers deal in short names.
                let short = topic
                    .name
                    .rfind(TOPIC_SEGMENT)
                    .map(|idx| topic.name[idx + TOPIC_SEGMENT.len()..].to_string())
                    .unwrap_or(topic.name);
                names.push(short);
            }
            if response.next_page_token.is_empty() {
                break;
            }
            page_token = response.next_page_token;
        }
        Ok(names)
    }
}
