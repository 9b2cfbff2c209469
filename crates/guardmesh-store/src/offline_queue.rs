//! Durable FIFO of gossip messages awaiting delivery.
//!
//! When every peer is unreachable, outgoing blocks and patterns land here
//! and are replayed once connectivity returns. The queue file is a single
//! JSON array; every mutation is persisted through the
//! write-temp-then-rename pattern so an enqueued item survives a crash.

use chrono::{DateTime, Utc};
use guardmesh_core::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

/// What kind of payload an item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Block,
    Pattern,
}

/// One queued message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub kind: QueueKind,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Summary of one `process` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub delivered: usize,
    pub retained: usize,
}

/// Persistent offline queue.
pub struct OfflineQueue {
    path: PathBuf,
    items: Vec<QueueItem>,
    in_flight: bool,
}

impl OfflineQueue {
    /// Load the queue from disk, starting empty when the file is missing
    /// or malformed.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<QueueItem>>(&raw) {
                Ok(items) => items,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed offline queue, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path,
            items,
            in_flight: false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append an item and persist. The item is durable once this returns.
    pub fn enqueue(&mut self, kind: QueueKind, payload: serde_json::Value) -> Result<Uuid> {
        let item = QueueItem {
            id: Uuid::new_v4(),
            kind,
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
        };
        let id = item.id;
        self.items.push(item);
        self.persist()?;
        debug!(%id, queued = self.items.len(), "offline item enqueued");
        Ok(id)
    }

    /// Run `handler` over every item in order. An item is removed only when
    /// the handler reports success; otherwise its retry count increments and
    /// it is retained. Only one `process` may be in flight at a time.
    pub async fn process<F, Fut>(&mut self, handler: F) -> Result<ProcessReport>
    where
        F: Fn(&QueueItem) -> Fut,
        Fut: Future<Output = bool>,
    {
        if self.in_flight {
            return Err(GuardError::QueueBusy);
        }
        self.in_flight = true;

        let mut report = ProcessReport::default();
        let mut retained = Vec::new();
        let pending = std::mem::take(&mut self.items);
        for mut item in pending {
            if handler(&item).await {
                report.delivered += 1;
            } else {
                item.retry_count += 1;
                report.retained += 1;
                retained.push(item);
            }
        }
        self.items = retained;

        let persisted = self.persist();
        self.in_flight = false;
        persisted?;
        Ok(report)
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_string_pretty(&self.items)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(body.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .map_err(|e| GuardError::Store(format!("queue rename failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn enqueue_is_durable_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offline-queue.json");

        {
            let mut queue = OfflineQueue::load(&path);
            queue.enqueue(QueueKind::Block, json!({"index": 3})).unwrap();
        }

        // A fresh process instance sees the item.
        let queue = OfflineQueue::load(&path);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn process_removes_only_successful_items() {
        let dir = tempdir().unwrap();
        let mut queue = OfflineQueue::load(dir.path().join("q.json"));
        queue.enqueue(QueueKind::Block, json!({"n": 1})).unwrap();
        queue.enqueue(QueueKind::Pattern, json!({"n": 2})).unwrap();
        queue.enqueue(QueueKind::Block, json!({"n": 3})).unwrap();

        // Fail the middle item.
        let report = queue
            .process(|item| {
                let keep = item.payload["n"] != json!(2);
                async move { keep }
            })
            .await
            .unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(report.retained, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.items[0].retry_count, 1);
    }

    #[tokio::test]
    async fn retry_count_accumulates() {
        let dir = tempdir().unwrap();
        let mut queue = OfflineQueue::load(dir.path().join("q.json"));
        queue.enqueue(QueueKind::Pattern, json!("x")).unwrap();

        for _ in 0..3 {
            queue.process(|_| async { false }).await.unwrap();
        }
        assert_eq!(queue.items[0].retry_count, 3);
    }

    #[tokio::test]
    async fn processed_queue_persists_removals() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.json");
        let mut queue = OfflineQueue::load(&path);
        queue.enqueue(QueueKind::Block, json!(1)).unwrap();
        queue.process(|_| async { true }).await.unwrap();

        let reloaded = OfflineQueue::load(&path);
        assert!(reloaded.is_empty());
    }

    #[test]
    fn malformed_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.json");
        fs::write(&path, "][").unwrap();
        assert!(OfflineQueue::load(&path).is_empty());
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let dir = tempdir().unwrap();
        let mut queue = OfflineQueue::load(dir.path().join("q.json"));
        for n in 0..4 {
            queue.enqueue(QueueKind::Pattern, json!(n)).unwrap();
        }
        let seen = std::sync::Mutex::new(Vec::new());
        queue
            .process(|item| {
                seen.lock().unwrap().push(item.payload.clone());
                async { true }
            })
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!(0), json!(1), json!(2), json!(3)]);
    }
}
