//! DurableQueue — redb-backed named queues with lease/ack/nack.
//!
//! Messages are JSON values keyed by `{queue}@{sequence}`; consuming moves
//! the oldest message into an in-flight table until the delivery is acked
//! (removed) or nacked (requeued at the tail with a fresh sequence).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{QueueError, QueueResult};

/// Queued messages keyed by `{queue}@{seq:020}`.
const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");

/// Leased (consumed but not yet acked) messages, same key shape.
const INFLIGHT: TableDefinition<&str, &[u8]> = TableDefinition::new("inflight");

/// Per-queue publish sequence counters keyed by queue name.
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

macro_rules! map_err {
    ($variant:ident) => {
        |e| QueueError::$variant(e.to_string())
    };
}

/// A durable multi-queue message store.
#[derive(Clone)]
pub struct DurableQueue {
    db: Arc<Database>,
}

/// One leased message. Dropping a delivery without acking leaves it in
/// flight; a crashed consumer's leases are requeued on reopen.
#[must_use = "a delivery must be acked or nacked"]
pub struct Delivery<T> {
    pub message: T,
    key: String,
    queue: DurableQueue,
}

impl DurableQueue {
    /// Open (or create) a persistent queue database at the given path.
    ///
    /// Any messages left in flight by a previous process are requeued.
    pub fn open(path: &Path) -> QueueResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let queue = Self { db: Arc::new(db) };
        queue.ensure_tables()?;
        queue.recover_inflight()?;
        debug!(?path, "queue database opened");
        Ok(queue)
    }

    /// Create an ephemeral in-memory queue (for testing).
    pub fn open_in_memory() -> QueueResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let queue = Self { db: Arc::new(db) };
        queue.ensure_tables()?;
        Ok(queue)
    }

    fn ensure_tables(&self) -> QueueResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(MESSAGES).map_err(map_err!(Table))?;
        txn.open_table(INFLIGHT).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Move every in-flight message back into its queue (crash recovery).
    fn recover_inflight(&self) -> QueueResult<()> {
        let leased: Vec<(String, Vec<u8>)> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(INFLIGHT).map_err(map_err!(Table))?;
            let mut out = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                out.push((key.value().to_string(), value.value().to_vec()));
            }
            out
        };
        if leased.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut inflight = txn.open_table(INFLIGHT).map_err(map_err!(Table))?;
            let mut messages = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            let mut sequences = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            for (key, value) in &leased {
                inflight.remove(key.as_str()).map_err(map_err!(Write))?;
                let queue_name = key.split('@').next().unwrap_or_default().to_string();
                let seq = next_seq(&mut sequences, &queue_name)?;
                messages
                    .insert(message_key(&queue_name, seq).as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(requeued = leased.len(), "recovered in-flight messages");
        Ok(())
    }

    /// Append a message to the named queue.
    pub fn publish<T: Serialize>(&self, queue: &str, message: &T) -> QueueResult<()> {
        let value = serde_json::to_vec(message).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut sequences = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let seq = next_seq(&mut sequences, queue)?;
            let mut messages = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            messages
                .insert(message_key(queue, seq).as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            trace!(%queue, seq, "message published");
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Lease the oldest message of the named queue, if any.
    ///
    /// The message stays invisible to other consumers until the returned
    /// delivery is nacked (or the process restarts without acking).
    pub fn consume<T: DeserializeOwned>(&self, queue: &str) -> QueueResult<Option<Delivery<T>>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let leased: Option<(String, Vec<u8>)>;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
            let prefix = format!("{queue}@");
            let head: Option<String> = {
                let mut found = None;
                for entry in messages.iter().map_err(map_err!(Read))? {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    if key.value().starts_with(&prefix) {
                        found = Some(key.value().to_string());
                        break;
                    }
                }
                found
            };
            leased = match head {
                Some(key) => {
                    let value = messages
                        .remove(key.as_str())
                        .map_err(map_err!(Write))?
                        .map(|guard| guard.value().to_vec());
                    value.map(|v| (key, v))
                }
                None => None,
            };
            if let Some((key, value)) = &leased {
                let mut inflight = txn.open_table(INFLIGHT).map_err(map_err!(Table))?;
                inflight
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        match leased {
            Some((key, value)) => {
                let message: T =
                    serde_json::from_slice(&value).map_err(map_err!(Deserialize))?;
                trace!(%queue, %key, "message leased");
                Ok(Some(Delivery {
                    message,
                    key,
                    queue: self.clone(),
                }))
            }
            None => Ok(None),
        }
    }

    /// Number of messages waiting in the named queue.
    pub fn pending(&self, queue: &str) -> QueueResult<usize> {
        self.count(MESSAGES, queue)
    }

    /// Number of leased, un-acked messages of the named queue.
    pub fn in_flight(&self, queue: &str) -> QueueResult<usize> {
        self.count(INFLIGHT, queue)
    }

    fn count(&self, table: TableDefinition<&str, &[u8]>, queue: &str) -> QueueResult<usize> {
        let prefix = format!("{queue}@");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut n = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                n += 1;
            }
        }
        Ok(n)
    }

    fn ack(&self, key: &str) -> QueueResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut inflight = txn.open_table(INFLIGHT).map_err(map_err!(Table))?;
            inflight.remove(key).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        trace!(%key, "message acked");
        Ok(())
    }

    fn nack(&self, key: &str) -> QueueResult<()> {
        let queue_name = key.split('@').next().unwrap_or_default().to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut inflight = txn.open_table(INFLIGHT).map_err(map_err!(Table))?;
            let value = inflight
                .remove(key)
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec());
            if let Some(value) = value {
                let mut sequences = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
                let seq = next_seq(&mut sequences, &queue_name)?;
                let mut messages = txn.open_table(MESSAGES).map_err(map_err!(Table))?;
                messages
                    .insert(message_key(&queue_name, seq).as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        trace!(%key, "message requeued");
        Ok(())
    }
}

impl<T> Delivery<T> {
    /// Remove the message from the channel for good.
    pub fn ack(self) -> QueueResult<()> {
        self.queue.ack(&self.key)
    }

    /// Requeue the message for redelivery (at the tail).
    pub fn nack(self) -> QueueResult<()> {
        self.queue.nack(&self.key)
    }
}

fn message_key(queue: &str, seq: u64) -> String {
    format!("{queue}@{seq:020}")
}

fn next_seq(
    sequences: &mut redb::Table<'_, &str, u64>,
    queue: &str,
) -> QueueResult<u64> {
    let current = sequences
        .get(queue)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0);
    let next = current + 1;
    sequences.insert(queue, next).map_err(map_err!(Write))?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn publish_then_consume_in_order() {
        let q = DurableQueue::open_in_memory().unwrap();
        q.publish("jobs", &Ping { n: 1 }).unwrap();
        q.publish("jobs", &Ping { n: 2 }).unwrap();
        assert_eq!(q.pending("jobs").unwrap(), 2);

        let first: Delivery<Ping> = q.consume("jobs").unwrap().unwrap();
        assert_eq!(first.message.n, 1);
        assert_eq!(q.pending("jobs").unwrap(), 1);
        assert_eq!(q.in_flight("jobs").unwrap(), 1);
        first.ack().unwrap();
        assert_eq!(q.in_flight("jobs").unwrap(), 0);

        let second: Delivery<Ping> = q.consume("jobs").unwrap().unwrap();
        assert_eq!(second.message.n, 2);
        second.ack().unwrap();
        assert!(q.consume::<Ping>("jobs").unwrap().is_none());
    }

    #[test]
    fn nack_redelivers() {
        let q = DurableQueue::open_in_memory().unwrap();
        q.publish("jobs", &Ping { n: 7 }).unwrap();

        let d: Delivery<Ping> = q.consume("jobs").unwrap().unwrap();
        d.nack().unwrap();
        assert_eq!(q.pending("jobs").unwrap(), 1);
        assert_eq!(q.in_flight("jobs").unwrap(), 0);

        let again: Delivery<Ping> = q.consume("jobs").unwrap().unwrap();
        assert_eq!(again.message.n, 7);
        again.ack().unwrap();
    }

    #[test]
    fn queues_are_isolated() {
        let q = DurableQueue::open_in_memory().unwrap();
        q.publish("jobs", &Ping { n: 1 }).unwrap();
        q.publish("events", &Ping { n: 2 }).unwrap();

        assert_eq!(q.pending("jobs").unwrap(), 1);
        assert_eq!(q.pending("events").unwrap(), 1);

        let d: Delivery<Ping> = q.consume("events").unwrap().unwrap();
        assert_eq!(d.message.n, 2);
        d.ack().unwrap();
        assert_eq!(q.pending("jobs").unwrap(), 1);
    }

    #[test]
    fn reopen_requeues_inflight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.redb");
        {
            let q = DurableQueue::open(&path).unwrap();
            q.publish("jobs", &Ping { n: 5 }).unwrap();
            let d: Delivery<Ping> = q.consume("jobs").unwrap().unwrap();
            assert_eq!(d.message.n, 5);
            // Simulate a crash: drop the delivery without acking.
            drop(d);
        }
        let q = DurableQueue::open(&path).unwrap();
        assert_eq!(q.pending("jobs").unwrap(), 1);
        assert_eq!(q.in_flight("jobs").unwrap(), 0);
        let d: Delivery<Ping> = q.consume("jobs").unwrap().unwrap();
        assert_eq!(d.message.n, 5);
        d.ack().unwrap();
    }
}
