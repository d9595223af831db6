//! Celery Task Queue
//!
//! Publishes each batch as one Celery task message (protocol v2) on the
//! Redis broker, exactly as `send_task` would: a JSON envelope with the
//! base64 body `[args, kwargs, embed]` is `LPUSH`ed onto the queue list and
//! picked up by the workers with `BRPOP`.
//!
//! The task receives one positional argument, the list of tick dictionaries.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use uuid::Uuid;

use crate::application::ports::{DispatchBatch, QueueError, TaskQueue};
use crate::domain::ticks::TickEvent;
use crate::infrastructure::config::CelerySettings;

// =============================================================================
// Message layout
// =============================================================================

/// Broker envelope.
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    body: String,
    #[serde(rename = "content-encoding")]
    content_encoding: &'static str,
    #[serde(rename = "content-type")]
    content_type: &'static str,
    headers: Headers<'a>,
    properties: Properties<'a>,
}

#[derive(Debug, Serialize)]
struct Headers<'a> {
    lang: &'static str,
    task: &'a str,
    id: String,
    shadow: Option<String>,
    eta: Option<String>,
    expires: Option<String>,
    group: Option<String>,
    group_index: Option<u32>,
    retries: u32,
    timelimit: (Option<u64>, Option<u64>),
    root_id: String,
    parent_id: Option<String>,
    argsrepr: String,
    kwargsrepr: &'static str,
    origin: &'a str,
    ignore_result: bool,
}

#[derive(Debug, Serialize)]
struct Properties<'a> {
    correlation_id: String,
    reply_to: String,
    delivery_mode: u8,
    delivery_info: DeliveryInfo<'a>,
    priority: u8,
    body_encoding: &'static str,
    delivery_tag: String,
}

#[derive(Debug, Serialize)]
struct DeliveryInfo<'a> {
    exchange: &'static str,
    routing_key: &'a str,
}

/// Third body element; no workflow primitives are used.
#[derive(Debug, Serialize)]
struct Embed {
    callbacks: Option<()>,
    errbacks: Option<()>,
    chain: Option<()>,
    chord: Option<()>,
}

// =============================================================================
// Queue
// =============================================================================

/// `TaskQueue` publishing Celery tasks through Redis.
#[derive(Clone)]
pub struct CeleryTaskQueue {
    conn: ConnectionManager,
    settings: CelerySettings,
    origin: String,
}

impl CeleryTaskQueue {
    /// Publish onto the queue and task named in `settings`.
    #[must_use]
    pub fn new(conn: ConnectionManager, settings: CelerySettings) -> Self {
        Self {
            conn,
            settings,
            origin: format!("kite-stream-bridge@{}", std::process::id()),
        }
    }
}

/// Serialize a batch into the broker message.
///
/// # Errors
///
/// Returns `QueueError::Encoding` if an event cannot be serialized.
pub fn encode_task_message(
    batch: &DispatchBatch,
    settings: &CelerySettings,
    origin: &str,
) -> Result<String, QueueError> {
    let ticks: Vec<&TickEvent> = batch.events.iter().map(AsRef::as_ref).collect();
    let kwargs: BTreeMap<String, ()> = BTreeMap::new();
    let embed = Embed {
        callbacks: None,
        errbacks: None,
        chain: None,
        chord: None,
    };
    let body = serde_json::to_vec(&((ticks,), kwargs, embed))
        .map_err(|e| QueueError::Encoding(e.to_string()))?;

    let task_id = batch.batch_id.to_string();
    let envelope = Envelope {
        body: STANDARD.encode(body),
        content_encoding: "utf-8",
        content_type: "application/json",
        headers: Headers {
            lang: "py",
            task: &settings.task_name,
            id: task_id.clone(),
            shadow: None,
            eta: None,
            expires: None,
            group: None,
            group_index: None,
            retries: 0,
            timelimit: (None, None),
            root_id: task_id.clone(),
            parent_id: None,
            argsrepr: format!("[<{} ticks>]", batch.len()),
            kwargsrepr: "{}",
            origin,
            ignore_result: true,
        },
        properties: Properties {
            correlation_id: task_id,
            reply_to: Uuid::new_v4().to_string(),
            delivery_mode: 2,
            delivery_info: DeliveryInfo {
                exchange: "",
                routing_key: &settings.queue,
            },
            priority: 0,
            body_encoding: "base64",
            delivery_tag: Uuid::new_v4().to_string(),
        },
    };

    serde_json::to_string(&envelope).map_err(|e| QueueError::Encoding(e.to_string()))
}

#[async_trait]
impl TaskQueue for CeleryTaskQueue {
    async fn enqueue(&self, batch: &DispatchBatch) -> Result<(), QueueError> {
        let message = encode_task_message(batch, &self.settings, &self.origin)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lpush(&self.settings.queue, message)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
