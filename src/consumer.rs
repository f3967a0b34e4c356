//! # Log-style Consumer Façade
//!
//! Presents a partitioned-log consumer API over a set of per-topic
//! subscribers: subscribe/unsubscribe, round-robin polling, offset-bounded
//! commits, pause/resume, and lazy seeks. Like its log-consumer namesakes,
//! `LogConsumer` is not thread safe; drive it from one task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tonic::Code;

use crate::config::ConsumerOptions;
use crate::error::{ConsumerError, Result};
use crate::record::LogRecord;
use crate::service::{GrpcSubscriberService, SubscriberService};
use crate::subscriber::Subscriber;

/// Where a pending seek should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeekTarget {
    Beginning,
    End,
}

/// A consumer over one or more topics, each backed by its own subscription
/// named `<topic>_<group_id>`.
pub struct LogConsumer {
    service: Arc<dyn SubscriberService>,
    options: ConsumerOptions,
    /// Topics in subscription order; drives round-robin polling.
    topics: Vec<String>,
    subscribers: HashMap<String, Subscriber>,
    paused: HashSet<String>,
    lazy_seeks: HashMap<String, SeekTarget>,
    poll_cursor: usize,
}

impl LogConsumer {
    /// Consumer over an explicit service implementation.
    pub fn new(service: Arc<dyn SubscriberService>, options: ConsumerOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            service,
            options,
            topics: Vec::new(),
            subscribers: HashMap::new(),
            paused: HashSet::new(),
            lazy_seeks: HashMap::new(),
            poll_cursor: 0,
        })
    }

    /// Consumer over the production gRPC service (or the emulator when
    /// `PUBSUB_EMULATOR_HOST` is set).
    pub async fn connect(options: ConsumerOptions) -> Result<Self> {
        let service = GrpcSubscriberService::connect(options.ack_request_timeout).await?;
        Self::new(Arc::new(service), options)
    }

    fn subscription_name(&self, topic: &str) -> String {
        format!(
            "projects/{}/subscriptions/{}_{}",
            self.options.project, topic, self.options.group_id
        )
    }

    fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.options.project, topic)
    }

    /// Subscribe to `topics`, replacing any current subscription set. Each
    /// topic's subscription is looked up and, when creation is allowed,
    /// created on `NOT_FOUND`. All subscribers are started before this
    /// returns; on failure everything started so far is torn down again and
    /// subscriptions created by this call are deleted (best effort).
    pub async fn subscribe(&mut self, topics: &[&str]) -> Result<()> {
        for topic in topics {
            if topic.trim().is_empty() {
                return Err(ConsumerError::InvalidOption {
                    name: "topics",
                    reason: "topic names must not be empty",
                });
            }
        }
        self.unsubscribe().await?;

        let mut created: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        let result = async {
            for topic in topics {
                if !seen.insert(topic.to_string()) {
                    continue;
                }
                let name = self.subscription_name(topic);
                self.ensure_subscription(topic, &name, &mut created).await?;
                let subscriber = Subscriber::new(
                    Arc::clone(&self.service),
                    self.options.clone(),
                    topic.to_string(),
                    name,
                )?;
                subscriber.start_async().await?;
                self.subscribers.insert(topic.to_string(), subscriber);
                self.topics.push(topic.to_string());
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            log::warn!("subscribe failed, rolling back: {err}");
            let _ = self.unsubscribe_internal(&created).await;
            return Err(err);
        }
        self.poll_cursor = 0;
        log::debug!("subscribed to {:?}", self.topics);
        Ok(())
    }

    async fn ensure_subscription(
        &self,
        topic: &str,
        name: &str,
        created: &mut Vec<String>,
    ) -> Result<()> {
        match self.service.get_subscription(name).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::NotFound => {
                if !self.options.allow_subscription_creation {
                    return Err(ConsumerError::SubscriptionMissing {
                        name: name.to_string(),
                    });
                }
                self.service
                    .create_subscription(
                        name,
                        &self.topic_path(topic),
                        self.options.created_subscription_deadline_seconds,
                    )
                    .await
                    .map_err(|status| ConsumerError::rpc("create_subscription", status))?;
                created.push(name.to_string());
                log::info!("created subscription {name}");
                Ok(())
            }
            Err(status) => Err(ConsumerError::rpc("get_subscription", status)),
        }
    }

    /// Stop every subscriber (each drains its queued acknowledgements) and,
    /// when configured, delete the subscriptions without waiting on the
    /// outcome.
    pub async fn unsubscribe(&mut self) -> Result<()> {
        let names: Vec<String> = self
            .subscribers
            .values()
            .map(|s| s.subscription().to_string())
            .collect();
        self.unsubscribe_internal(&names).await
    }

    async fn unsubscribe_internal(&mut self, deletable: &[String]) -> Result<()> {
        for (topic, subscriber) in self.subscribers.drain() {
            if let Err(err) = subscriber.stop_async().await {
                log::warn!("stopping subscriber for {topic} failed: {err}");
            }
        }
        if self.options.allow_subscription_deletion {
            for name in deletable {
                let service = Arc::clone(&self.service);
                let name = name.clone();
                tokio::spawn(async move {
                    if let Err(status) = service.delete_subscription(&name).await {
                        log::warn!("failed to delete subscription {name}: {status}");
                    }
                });
            }
        }
        self.topics.clear();
        self.paused.clear();
        self.lazy_seeks.clear();
        self.poll_cursor = 0;
        Ok(())
    }

    /// Poll the subscribed topics round-robin, returning the first
    /// non-empty batch. Each topic is visited at most once per call; the
    /// cursor carries across calls so every topic gets its turn. Paused
    /// topics are skipped. Pending lazy seeks are applied first.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>> {
        if self.topics.is_empty() {
            return Err(ConsumerError::NotSubscribed);
        }
        self.apply_lazy_seeks().await?;

        let count = self.topics.len();
        let mut batch = Vec::new();
        for _ in 0..count {
            let topic = self.topics[self.poll_cursor % count].clone();
            self.poll_cursor = (self.poll_cursor + 1) % count;
            if self.paused.contains(&topic) {
                continue;
            }
            let subscriber = self
                .subscribers
                .get(&topic)
                .expect("subscriber map out of sync with topic list");
            // Whole timeout per attempt, as a poll is expected to find its
            // batch on the first live topic.
            batch = subscriber.pull(timeout).await?;
            if !batch.is_empty() {
                break;
            }
        }
        Ok(batch)
    }

    /// Acknowledge everything polled so far on every topic.
    pub async fn commit_sync(&self) -> Result<()> {
        self.commit(true).await
    }

    /// Queue acknowledgements for everything polled so far on every topic.
    pub async fn commit_async(&self) -> Result<()> {
        self.commit(false).await
    }

    async fn commit(&self, sync: bool) -> Result<()> {
        for subscriber in self.subscribers.values() {
            subscriber.commit(sync).await?;
        }
        Ok(())
    }

    /// Acknowledge, per topic, every polled message whose offset is at or
    /// below the given offset. Unknown topics are logged and skipped.
    pub async fn commit_offsets(&self, offsets: &HashMap<String, i64>, sync: bool) -> Result<()> {
        for (topic, offset) in offsets {
            match self.subscribers.get(topic) {
                Some(subscriber) => subscriber.commit_before(sync, *offset).await?,
                None => log::warn!("commit for unsubscribed topic {topic} ignored"),
            }
        }
        Ok(())
    }

    /// Server-side seek of one topic to a publish-time instant. Takes
    /// effect immediately; messages before it are considered acknowledged,
    /// messages after it are redelivered.
    pub async fn seek(&self, topic: &str, timestamp_ms: i64) -> Result<()> {
        let subscriber = self
            .subscribers
            .get(topic)
            .ok_or_else(|| ConsumerError::UnknownTopic {
                topic: topic.to_string(),
            })?;
        subscriber.seek_to_time(timestamp_ms).await
    }

    /// Remember a seek to the beginning of the given topics (all topics
    /// when empty), applied on the next `poll`.
    pub fn seek_to_beginning(&mut self, topics: &[&str]) {
        self.remember_seek(topics, SeekTarget::Beginning);
    }

    /// Remember a seek to the present instant of the given topics (all
    /// topics when empty), applied on the next `poll`.
    pub fn seek_to_end(&mut self, topics: &[&str]) {
        self.remember_seek(topics, SeekTarget::End);
    }

    fn remember_seek(&mut self, topics: &[&str], target: SeekTarget) {
        if topics.is_empty() {
            for topic in &self.topics {
                self.lazy_seeks.insert(topic.clone(), target);
            }
        } else {
            for topic in topics {
                self.lazy_seeks.insert(topic.to_string(), target);
            }
        }
    }

    async fn apply_lazy_seeks(&mut self) -> Result<()> {
        if self.lazy_seeks.is_empty() {
            return Ok(());
        }
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let pending: Vec<(String, SeekTarget)> = self.lazy_seeks.drain().collect();
        for (topic, target) in pending {
            let Some(subscriber) = self.subscribers.get(&topic) else {
                log::warn!("seek for unsubscribed topic {topic} ignored");
                continue;
            };
            let timestamp_ms = match target {
                SeekTarget::Beginning => 0,
                SeekTarget::End => now_ms,
            };
            subscriber.seek_to_time(timestamp_ms).await?;
        }
        Ok(())
    }

    /// Suppress polling (and therefore pulling) for the given topics.
    pub fn pause(&mut self, topics: &[&str]) {
        for topic in topics {
            if let Some(subscriber) = self.subscribers.get(*topic) {
                subscriber.pause();
                self.paused.insert(topic.to_string());
            }
        }
    }

    /// Resume polling for the given topics.
    pub fn resume(&mut self, topics: &[&str]) {
        for topic in topics {
            if let Some(subscriber) = self.subscribers.get(*topic) {
                subscriber.resume();
                self.paused.remove(*topic);
            }
        }
    }

    /// Topics currently paused.
    pub fn paused(&self) -> Vec<String> {
        let mut paused: Vec<String> = self.paused.iter().cloned().collect();
        paused.sort();
        paused
    }

    /// Topics currently subscribed, in polling order.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Full resource names of the active subscriptions.
    pub fn subscription_names(&self) -> Vec<String> {
        self.topics
            .iter()
            .filter_map(|topic| self.subscribers.get(topic))
            .map(|s| s.subscription().to_string())
            .collect()
    }

    /// Short names of every topic in the project.
    pub async fn list_topics(&self) -> Result<Vec<String>> {
        self.service
            .list_topics(&self.options.project)
            .await
            .map_err(|status| ConsumerError::rpc("list_topics", status))
    }

    /// Unsubscribe and drop every subscriber.
    pub async fn close(&mut self) -> Result<()> {
        log::debug!("closing consumer for group {}", self.options.group_id);
        self.unsubscribe().await
    }
}
