//! Scripted in-memory Pub/Sub service for driving the subscriber runtime.
//!
//! Pull responses are queued per subscription; when the queue is empty a
//! pull blocks like the real long poll until something is scripted. Every
//! call is recorded in order for assertions.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use google_cloud_googleapis::pubsub::v1::{PubsubMessage, ReceivedMessage};
use prost_types::Timestamp;
use tokio::sync::Notify;
use tonic::Status;

use pubsub_log_consumer::{RpcResult, SubscriberService, SubscriptionInfo};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Pull {
        subscription: String,
        max: i32,
    },
    Acknowledge {
        subscription: String,
        ack_ids: Vec<String>,
    },
    ModifyAckDeadline {
        subscription: String,
        ack_ids: Vec<String>,
        seconds: i32,
    },
    Seek {
        subscription: String,
        time_ms: i64,
    },
    GetSubscription {
        name: String,
    },
    CreateSubscription {
        name: String,
        topic: String,
    },
    DeleteSubscription {
        name: String,
    },
    ListTopics,
}

#[derive(Default)]
struct MockState {
    pulls: HashMap<String, VecDeque<RpcResult<Vec<ReceivedMessage>>>>,
    ack_results: VecDeque<RpcResult<()>>,
    modify_results: VecDeque<RpcResult<()>>,
    subscriptions: HashMap<String, SubscriptionInfo>,
    topics: Vec<String>,
    calls: Vec<Call>,
}

#[derive(Default)]
pub struct MockService {
    state: Mutex<MockState>,
    pull_posted: Notify,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_subscription(&self, name: &str, topic: &str) {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.insert(
            name.to_string(),
            SubscriptionInfo {
                name: name.to_string(),
                topic: topic.to_string(),
                ack_deadline_seconds: 10,
            },
        );
    }

    pub fn register_topic(&self, topic: &str) {
        self.state.lock().unwrap().topics.push(topic.to_string());
    }

    pub fn script_pull(&self, subscription: &str, result: RpcResult<Vec<ReceivedMessage>>) {
        {
            let mut state = self.state.lock().unwrap();
            state
                .pulls
                .entry(subscription.to_string())
                .or_default()
                .push_back(result);
        }
        self.pull_posted.notify_waiters();
    }

    pub fn script_ack_result(&self, result: RpcResult<()>) {
        self.state.lock().unwrap().ack_results.push_back(result);
    }

    pub fn script_modify_result(&self, result: RpcResult<()>) {
        self.state.lock().unwrap().modify_results.push_back(result);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn acknowledge_calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Acknowledge {
                    subscription,
                    ack_ids,
                } => Some((subscription, ack_ids)),
                _ => None,
            })
            .collect()
    }

    pub fn modify_calls(&self) -> Vec<(Vec<String>, i32)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ModifyAckDeadline {
                    ack_ids, seconds, ..
                } => Some((ack_ids, seconds)),
                _ => None,
            })
            .collect()
    }

    pub fn pull_count(&self, subscription: &str) -> usize {
        self.calls()
            .into_iter()
            .filter(|call| {
                matches!(call, Call::Pull { subscription: s, .. } if s == subscription)
            })
            .count()
    }
}

/// Build a received message carrying the wire conventions under test.
pub fn received(
    ack_id: &str,
    offset: Option<&str>,
    key_b64: Option<&str>,
    data: &[u8],
    publish_ms: i64,
) -> ReceivedMessage {
    let mut attributes = HashMap::new();
    if let Some(offset) = offset {
        attributes.insert("offset".to_string(), offset.to_string());
    }
    if let Some(key) = key_b64 {
        attributes.insert("key".to_string(), key.to_string());
    }
    ReceivedMessage {
        ack_id: ack_id.to_string(),
        message: Some(PubsubMessage {
            data: data.to_vec(),
            attributes,
            message_id: format!("mid-{ack_id}"),
            publish_time: Some(Timestamp {
                seconds: publish_ms / 1000,
                nanos: ((publish_ms % 1000) * 1_000_000) as i32,
            }),
            ordering_key: String::new(),
        }),
        delivery_attempt: 1,
    }
}

#[async_trait]
impl SubscriberService for MockService {
    async fn pull(&self, subscription: &str, max_messages: i32) -> RpcResult<Vec<ReceivedMessage>> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Pull {
                subscription: subscription.to_string(),
                max: max_messages,
            });
        }
        loop {
            let notified = self.pull_posted.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(queue) = state.pulls.get_mut(subscription) {
                    if let Some(result) = queue.pop_front() {
                        return result;
                    }
                }
            }
            // Nothing scripted: behave like the server long poll.
            notified.await;
        }
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: Vec<String>) -> RpcResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Acknowledge {
            subscription: subscription.to_string(),
            ack_ids,
        });
        state.ack_results.pop_front().unwrap_or(Ok(()))
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_ids: Vec<String>,
        ack_deadline_seconds: i32,
    ) -> RpcResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ModifyAckDeadline {
            subscription: subscription.to_string(),
            ack_ids,
            seconds: ack_deadline_seconds,
        });
        state.modify_results.pop_front().unwrap_or(Ok(()))
    }

    async fn seek_to_time(&self, subscription: &str, time_ms: i64) -> RpcResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Seek {
            subscription: subscription.to_string(),
            time_ms,
        });
        Ok(())
    }

    async fn get_subscription(&self, name: &str) -> RpcResult<SubscriptionInfo> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::GetSubscription {
            name: name.to_string(),
        });
        state
            .subscriptions
            .get(name)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("no subscription {name}")))
    }

    async fn create_subscription(
        &self,
        name: &str,
        topic: &str,
        ack_deadline_seconds: i32,
    ) -> RpcResult<SubscriptionInfo> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::CreateSubscription {
            name: name.to_string(),
            topic: topic.to_string(),
        });
        let info = SubscriptionInfo {
            name: name.to_string(),
            topic: topic.to_string(),
            ack_deadline_seconds,
        };
        state.subscriptions.insert(name.to_string(), info.clone());
        Ok(info)
    }

    async fn delete_subscription(&self, name: &str) -> RpcResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::DeleteSubscription {
            name: name.to_string(),
        });
        state.subscriptions.remove(name);
        Ok(())
    }

    async fn list_topics(&self, _project: &str) -> RpcResult<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ListTopics);
        Ok(state.topics.clone())
    }
}
