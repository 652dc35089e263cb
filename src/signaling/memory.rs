//! In-process signaling hub
//!
//! Holds every channel's collections in memory and fans changes out to
//! subscribers. Used by the loopback diagnostics and by tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::{
    ChannelDirectory, PresenceChannel, PresenceEntry, SignalDocument, SignalingChannel,
};
use crate::error::{AppError, Result};

#[derive(Default)]
struct MemoryCollections {
    /// Sequence -> document, so snapshots come back in insertion order
    docs: Mutex<BTreeMap<u64, SignalDocument>>,
    doc_subscribers: Mutex<Vec<mpsc::UnboundedSender<SignalDocument>>>,
    presence: Mutex<BTreeMap<String, PresenceEntry>>,
    presence_subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<PresenceEntry>>>>,
    sequence: AtomicU64,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryCollections {
    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Signaling("signaling store unavailable".to_string()));
        }
        Ok(())
    }

    fn presence_snapshot(&self) -> Vec<PresenceEntry> {
        self.presence.lock().values().cloned().collect()
    }

    fn notify_presence(&self) {
        let snapshot = self.presence_snapshot();
        self.presence_subscribers
            .lock()
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
    }
}

/// In-memory implementation of every channel collection
#[derive(Clone, Default)]
pub struct MemoryHub {
    channels: Arc<Mutex<HashMap<(String, String), Arc<MemoryCollections>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn collections(&self, group_id: &str, channel_id: &str) -> Arc<MemoryCollections> {
        self.channels
            .lock()
            .entry((group_id.to_string(), channel_id.to_string()))
            .or_insert_with(|| {
                Arc::new(MemoryCollections {
                    fail_writes: self.fail_writes.clone(),
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Make every write on every channel fail (outage simulation)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Signaling documents currently stored in a channel
    pub fn signaling_documents(&self, group_id: &str, channel_id: &str) -> Vec<SignalDocument> {
        self.collections(group_id, channel_id)
            .docs
            .lock()
            .values()
            .cloned()
            .collect()
    }

    /// Current presence snapshot of a channel
    pub fn presence_entries(&self, group_id: &str, channel_id: &str) -> Vec<PresenceEntry> {
        self.collections(group_id, channel_id).presence_snapshot()
    }
}

impl ChannelDirectory for MemoryHub {
    fn signaling(&self, group_id: &str, channel_id: &str) -> Arc<dyn SignalingChannel> {
        Arc::new(MemorySignaling(self.collections(group_id, channel_id)))
    }

    fn presence(&self, group_id: &str, channel_id: &str) -> Arc<dyn PresenceChannel> {
        Arc::new(MemoryPresence(self.collections(group_id, channel_id)))
    }
}

struct MemorySignaling(Arc<MemoryCollections>);

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn add(&self, body: serde_json::Value) -> Result<String> {
        self.0.check_writable()?;
        let doc = SignalDocument {
            id: uuid::Uuid::new_v4().to_string(),
            body,
        };
        let seq = self.0.sequence.fetch_add(1, Ordering::SeqCst);
        let mut subscribers = self.0.doc_subscribers.lock();
        self.0.docs.lock().insert(seq, doc.clone());
        trace!("Signaling document {} added", doc.id);
        subscribers.retain(|tx| tx.send(doc.clone()).is_ok());
        Ok(doc.id)
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SignalDocument>> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Hold the subscriber list while replaying so no add slips between
        let mut subscribers = self.0.doc_subscribers.lock();
        for doc in self.0.docs.lock().values() {
            let _ = tx.send(doc.clone());
        }
        subscribers.push(tx);
        Ok(rx)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.0.check_writable()?;
        self.0.docs.lock().retain(|_, doc| doc.id != id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SignalDocument>> {
        Ok(self.0.docs.lock().values().cloned().collect())
    }
}

struct MemoryPresence(Arc<MemoryCollections>);

#[async_trait]
impl PresenceChannel for MemoryPresence {
    async fn set(&self, entry: PresenceEntry) -> Result<()> {
        self.0.check_writable()?;
        self.0.presence.lock().insert(entry.uid.clone(), entry);
        self.0.notify_presence();
        Ok(())
    }

    async fn update_screen_sharing(&self, uid: &str, sharing: bool) -> Result<()> {
        self.0.check_writable()?;
        let updated = match self.0.presence.lock().get_mut(uid) {
            Some(entry) => {
                entry.is_screen_sharing = sharing;
                true
            }
            None => false,
        };
        if !updated {
            return Err(AppError::Signaling(format!("No presence entry for {}", uid)));
        }
        self.0.notify_presence();
        Ok(())
    }

    async fn delete(&self, uid: &str) -> Result<()> {
        self.0.check_writable()?;
        let removed = self.0.presence.lock().remove(uid).is_some();
        if removed {
            self.0.notify_presence();
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Vec<PresenceEntry>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.0.presence_subscribers.lock();
        let _ = tx.send(self.0.presence_snapshot());
        subscribers.push(tx);
        Ok(rx)
    }
}
