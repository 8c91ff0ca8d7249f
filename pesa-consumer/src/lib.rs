#![deny(clippy::print_stdout, clippy::print_stderr)]

//! At-least-once queue consumption with at-most-once handler effect.
//!
//! Brokers redeliver; the consumer deduplicates against a persistent
//! `QUEUE_MESSAGE_PROCESSED` marker in the events table plus an
//! in-process memo that short-circuits duplicates inside one batch. The
//! marker write is best-effort: losing it risks a redundant redelivery
//! check later, never a lost message.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pesa_ledger::Event;
use pesa_ledger::EventFilter;
use pesa_ledger::LedgerStore;
use pesa_ledger::StoreError;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const EVENT_QUEUE_MESSAGE_PROCESSED: &str = "QUEUE_MESSAGE_PROCESSED";
pub const EVENT_CONSUMER_ERROR: &str = "CONSUMER_ERROR";

const BODY_TRUNCATE_BYTES: usize = 512;

pub type ConsumerResult<T> = Result<T, ConsumerError>;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("dedupe lookup failed: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub topic: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOutcome {
    pub processed: bool,
    pub deduplicated: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &str) -> anyhow::Result<()>;
}

pub struct QueueConsumer {
    store: Arc<dyn LedgerStore>,
    memo: Mutex<HashSet<String>>,
}

impl QueueConsumer {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            memo: Mutex::new(HashSet::new()),
        }
    }

    /// Invokes `handler` at most once for the message id, across both
    /// this process and prior runs that persisted a marker.
    pub async fn consume(
        &self,
        message: &QueueMessage,
        handler: &dyn MessageHandler,
    ) -> ConsumerResult<ConsumeOutcome> {
        {
            let memo = self.memo.lock().await;
            if memo.contains(&message.id) {
                return Ok(deduplicated());
            }
        }

        let markers = self
            .store
            .list_events(EventFilter {
                name: Some(EVENT_QUEUE_MESSAGE_PROCESSED.into()),
                entity_id: Some(message.id.clone()),
                ..Default::default()
            })
            .await?;
        if !markers.is_empty() {
            self.memo.lock().await.insert(message.id.clone());
            return Ok(deduplicated());
        }

        match handler.handle(&message.body).await {
            Ok(()) => {
                self.persist_marker(message, EVENT_QUEUE_MESSAGE_PROCESSED, None)
                    .await;
                self.memo.lock().await.insert(message.id.clone());
                Ok(ConsumeOutcome {
                    processed: true,
                    deduplicated: false,
                    error: None,
                })
            }
            Err(error) => {
                let rendered = format!("{error:#}");
                self.persist_marker(message, EVENT_CONSUMER_ERROR, Some(&rendered))
                    .await;
                Ok(ConsumeOutcome {
                    processed: false,
                    deduplicated: false,
                    error: Some(rendered),
                })
            }
        }
    }

    async fn persist_marker(&self, message: &QueueMessage, name: &str, error: Option<&str>) {
        let payload = match error {
            Some(error) => serde_json::json!({
                "topic": message.topic,
                "body": truncate(&message.body),
                "error": error,
            }),
            None => serde_json::json!({ "topic": message.topic }),
        };
        let event = Event {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            entity_type: "QUEUE_MESSAGE".into(),
            entity_id: message.id.clone(),
            correlation_id: message.id.clone(),
            causation_id: None,
            actor_type: "SYSTEM".into(),
            actor_id: "queue-consumer".into(),
            schema_version: 1,
            payload_json: payload,
            created_at: Utc::now(),
        };
        if let Err(error) = self.store.append_event(event).await {
            warn!(message_id = %message.id, %error, "failed to persist consumer marker");
        }
    }
}

fn deduplicated() -> ConsumeOutcome {
    ConsumeOutcome {
        processed: false,
        deduplicated: true,
        error: None,
    }
}

fn truncate(body: &str) -> &str {
    let mut end = BODY_TRUNCATE_BYTES.min(body.len());
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
