//! Bounded, typed, FIFO, single-producer/single-consumer message channels
//! between wants (spec.md §3 "Channel", §4.3 "Channel Fabric").
//!
//! Channels carry opaque payloads (spec.md §9 "Packet data type erasure");
//! this engine is generic over the payload type `P` that domain want
//! implementations agree on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use mywant_core::path::{channel_name, SourceTag};
use mywant_core::{ChannelError, WantId};

/// A cloneable sending handle. `send` suspends the calling task once the
/// bounded buffer is full, as required by spec.md §4.3.
pub struct ChannelSenderHandle<P> {
    name: String,
    producer_id: WantId,
    tx: mpsc::Sender<P>,
}

impl<P: Send + 'static> ChannelSenderHandle<P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&self, item: P) -> Result<(), ChannelError> {
        self.tx.send(item).await.map_err(|_| ChannelError::SendOnClosed {
            channel_name: self.name.clone(),
            producer_id: self.producer_id.clone(),
        })
    }
}

/// The receiving half. `recv` suspends once empty; returns `None` on
/// end-of-stream (producer dropped / channel closed, spec.md §4.3).
pub struct ChannelReceiver<P> {
    name: String,
    rx: mpsc::Receiver<P>,
}

impl<P> ChannelReceiver<P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&mut self) -> Option<P> {
        self.rx.recv().await
    }
}

struct ChannelEntry<P> {
    sender: mpsc::Sender<P>,
    /// Taken exactly once by the consumer's executor task, via
    /// [`ChannelFabric::take_receiver`]; `None` once claimed.
    receiver: Mutex<Option<mpsc::Receiver<P>>>,
}

/// Owns every live channel, keyed by its unique name
/// (`"{producer}_to_{consumer}"` or `"{producer}_global_to_{consumer}"`).
/// The resolver creates/closes entries here as it diffs path sets (spec.md
/// §4.2 step 4): "Edges that persist across a re-resolve retain their
/// channel identity, so in-flight messages are not lost."
pub struct ChannelFabric<P> {
    capacity: usize,
    channels: RwLock<HashMap<String, Arc<ChannelEntry<P>>>>,
    metrics: Arc<crate::metrics::Metrics>,
}

impl<P: Send + 'static> ChannelFabric<P> {
    pub fn new(capacity: usize, metrics: Arc<crate::metrics::Metrics>) -> Self {
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Ensures a channel named `(producer, consumer, scope)` exists, creating
    /// it if this is a new edge (spec.md §4.2 step 4), and returns a sender
    /// handle. Safe to call repeatedly for the same edge: an existing
    /// channel's sender is cloned rather than recreated, so in-flight
    /// messages and channel identity are preserved.
    pub fn ensure(&self, producer_id: &str, consumer_id: &str, source: SourceTag) -> Arc<ChannelSenderHandle<P>> {
        let name = channel_name(producer_id, consumer_id, source);
        {
            let channels = self.channels.read();
            if let Some(existing) = channels.get(&name) {
                return Arc::new(ChannelSenderHandle {
                    name,
                    producer_id: producer_id.to_string(),
                    tx: existing.sender.clone(),
                });
            }
        }

        let mut channels = self.channels.write();
        // Re-check under the write lock in case of a racing `ensure`.
        if let Some(existing) = channels.get(&name) {
            return Arc::new(ChannelSenderHandle {
                name,
                producer_id: producer_id.to_string(),
                tx: existing.sender.clone(),
            });
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        channels.insert(
            name.clone(),
            Arc::new(ChannelEntry {
                sender: tx.clone(),
                receiver: Mutex::new(Some(rx)),
            }),
        );
        self.metrics.channel_opened();
        Arc::new(ChannelSenderHandle {
            name,
            producer_id: producer_id.to_string(),
            tx,
        })
    }

    /// Claims the receiving half of a channel, if it hasn't been claimed
    /// already. The executor calls this exactly once per edge, the first
    /// time it observes the edge in a want's `paths.in`.
    pub fn take_receiver(&self, producer_id: &str, consumer_id: &str, source: SourceTag) -> Option<ChannelReceiver<P>> {
        let name = channel_name(producer_id, consumer_id, source);
        let channels = self.channels.read();
        let entry = channels.get(&name)?;
        let rx = entry.receiver.lock().take()?;
        Some(ChannelReceiver { name, rx })
    }

    /// Closes and drops a channel (spec.md §4.2 step 4 "for each removed
    /// edge, close and drop the channel"). Dropping the stored sender clone
    /// causes the consumer's next `recv` to observe end-of-stream.
    pub fn close(&self, producer_id: &str, consumer_id: &str, source: SourceTag) {
        let name = channel_name(producer_id, consumer_id, source);
        if self.channels.write().remove(&name).is_some() {
            self.metrics.channel_closed();
        }
    }

    pub fn is_open(&self, producer_id: &str, consumer_id: &str, source: SourceTag) -> bool {
        let name = channel_name(producer_id, consumer_id, source);
        self.channels.read().contains_key(&name)
    }

    /// Drops every open channel whose name is not in `keep`. Used by the
    /// resolver after a re-resolve to close edges that no longer exist
    /// (spec.md §4.2 step 4), without disturbing edges that persist across
    /// the re-resolve.
    pub fn retain_only(&self, keep: &HashSet<String>) {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|name, _| keep.contains(name));
        let closed = before - channels.len();
        for _ in 0..closed {
            self.metrics.channel_closed();
        }
    }

    pub fn open_count(&self) -> usize {
        self.channels.read().len()
    }
}
