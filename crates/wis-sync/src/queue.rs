use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use wis_core::GroupingKey;

/// Messages for downstream consumers. Delivery is at-least-once; consumers key on
/// item identity or snapshot stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkMessage {
    ItemExtracted {
        org_id: String,
        source_id: String,
        context_id: String,
        item_id: String,
        changed_at: DateTime<Utc>,
        /// Path of the stored payload relative to the payload root.
        payload_ref: String,
        content_hash: String,
    },
    SnapshotCompleted {
        grouping: GroupingKey,
        observed_at: DateTime<Utc>,
        members: usize,
        upserted: u64,
        deleted: u64,
    },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work queue is closed")]
    Closed,
    #[error("outbox {path}: {source}")]
    Outbox {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn publish(&self, message: WorkMessage) -> Result<(), QueueError>;
}

/// Bounded in-process channel; the receiver half belongs to whatever forwards messages on.
#[derive(Debug, Clone)]
pub struct ChannelWorkQueue {
    sender: mpsc::Sender<WorkMessage>,
}

impl ChannelWorkQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl WorkQueue for ChannelWorkQueue {
    async fn publish(&self, message: WorkMessage) -> Result<(), QueueError> {
        self.sender.send(message).await.map_err(|_| QueueError::Closed)
    }
}

/// Appends each message as one JSON line to an outbox file for an external forwarder.
#[derive(Debug)]
pub struct OutboxWorkQueue {
    path: PathBuf,
    file: Mutex<File>,
}

impl OutboxWorkQueue {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        let outbox_err = |source| QueueError::Outbox {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(outbox_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(outbox_err)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WorkQueue for OutboxWorkQueue {
    async fn publish(&self, message: WorkMessage) -> Result<(), QueueError> {
        let mut line = serde_json::to_vec(&message).map_err(|e| QueueError::Outbox {
            path: self.path.clone(),
            source: e.into(),
        })?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        let written = async {
            file.write_all(&line).await?;
            file.flush().await
        };
        written.await.map_err(|source| QueueError::Outbox {
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryWorkQueue {
    messages: Mutex<Vec<WorkMessage>>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<WorkMessage> {
        self.messages.lock().await.clone()
    }

    pub async fn extracted_item_ids(&self) -> Vec<String> {
        self.messages
            .lock()
            .await
            .iter()
            .filter_map(|m| match m {
                WorkMessage::ItemExtracted { item_id, .. } => Some(item_id.clone()),
                WorkMessage::SnapshotCompleted { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn publish(&self, message: WorkMessage) -> Result<(), QueueError> {
        self.messages.lock().await.push(message);
        Ok(())
    }
}
