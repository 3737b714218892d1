use crate::{PoolError, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::Mutex;

/// A queued replication intent for one `(resource, data identifier)` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMediaPoolCommand {
    pub media_resource_identifier: String,
    pub data_identifier: String,
    /// Pending file the command originated from, if any.
    pub pending_file_name: Option<String>,
    /// Pool server known to hold the content (synchronizing commands).
    pub source_number: Option<u32>,
    pub request_date: DateTime<Utc>,
}

impl ServerMediaPoolCommand {
    pub fn new(media_resource_identifier: impl Into<String>, data_identifier: impl Into<String>) -> Self {
        Self {
            media_resource_identifier: media_resource_identifier.into(),
            data_identifier: data_identifier.into(),
            pending_file_name: None,
            source_number: None,
            request_date: Utc::now(),
        }
    }

    pub fn with_pending_file(mut self, pending_file_name: impl Into<String>) -> Self {
        self.pending_file_name = Some(pending_file_name.into());
        self
    }

    pub fn with_source(mut self, source_number: u32) -> Self {
        self.source_number = Some(source_number);
        self
    }

    pub fn command_hash_key(&self) -> String {
        format!("{}:{}", self.media_resource_identifier, self.data_identifier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Changes that must reach the main server.
    Main,
    /// Convergence toward the other followers.
    Secondary,
    /// Catch-up of the main server from a follower.
    Synchronizing,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Main => "main",
            QueueKind::Secondary => "secondary",
            QueueKind::Synchronizing => "synchronizing",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded FIFO of replication commands.
pub struct ReplicationQueue {
    kind: QueueKind,
    max_items: usize,
    items: Mutex<VecDeque<ServerMediaPoolCommand>>,
}

impl ReplicationQueue {
    pub fn new(kind: QueueKind, max_items: usize) -> Self {
        Self {
            kind,
            max_items,
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Appends the command. Returns false when a command with the same
    /// hash key is already queued; fails when the queue is full.
    pub async fn enqueue(&self, command: ServerMediaPoolCommand) -> Result<bool> {
        let mut items = self.items.lock().await;
        let key = command.command_hash_key();
        if items.iter().any(|queued| queued.command_hash_key() == key) {
            return Ok(false);
        }

        if items.len() >= self.max_items {
            return Err(PoolError::QueueOverflow {
                queue: self.kind.to_string(),
                max: self.max_items,
            });
        }

        items.push_back(command);
        Ok(true)
    }

    pub async fn pop(&self) -> Option<ServerMediaPoolCommand> {
        self.items.lock().await.pop_front()
    }

    /// Takes every queued command.
    pub async fn take_all(&self) -> Vec<ServerMediaPoolCommand> {
        self.items.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

/// Commands selected for one processing cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleBatch {
    pub main: Vec<ServerMediaPoolCommand>,
    pub secondary: Option<ServerMediaPoolCommand>,
    pub synchronizing: Option<ServerMediaPoolCommand>,
}

impl CycleBatch {
    pub fn is_empty(&self) -> bool {
        self.main.is_empty() && self.secondary.is_none() && self.synchronizing.is_none()
    }

    pub fn len(&self) -> usize {
        self.main.len() + self.secondary.iter().count() + self.synchronizing.iter().count()
    }
}

/// The three replication queues of one server.
pub struct CommandQueues {
    pub main: ReplicationQueue,
    pub secondary: ReplicationQueue,
    pub synchronizing: ReplicationQueue,
}

impl CommandQueues {
    pub fn new(max_items: usize) -> Self {
        Self {
            main: ReplicationQueue::new(QueueKind::Main, max_items),
            secondary: ReplicationQueue::new(QueueKind::Secondary, max_items),
            synchronizing: ReplicationQueue::new(QueueKind::Synchronizing, max_items),
        }
    }

    pub fn queue(&self, kind: QueueKind) -> &ReplicationQueue {
        match kind {
            QueueKind::Main => &self.main,
            QueueKind::Secondary => &self.secondary,
            QueueKind::Synchronizing => &self.synchronizing,
        }
    }

    /// Selects the work of one cycle: the whole main queue, then at most one
    /// secondary command. A synchronizing command is only taken when the
    /// other two queues are empty.
    pub async fn next_cycle_batch(&self) -> CycleBatch {
        let main = self.main.take_all().await;
        let secondary = self.secondary.pop().await;
        let synchronizing = if main.is_empty() && secondary.is_none() {
            self.synchronizing.pop().await
        } else {
            None
        };

        CycleBatch {
            main,
            secondary,
            synchronizing,
        }
    }

    pub async fn total_len(&self) -> usize {
        self.main.len().await + self.secondary.len().await + self.synchronizing.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.total_len().await == 0
    }
}
