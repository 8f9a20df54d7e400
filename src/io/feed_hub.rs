//! Push-subscribable device telemetry feed
//!
//! Every device id has a latest record and a set of listeners. A new
//! subscription is handed the current record straight away (if one exists),
//! then every record published afterwards. Listeners are released through
//! `Subscription::close`, which is idempotent and also runs on drop.

use crate::domain::types::FeedRecord;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<FeedRecord>,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    listeners: FxHashMap<String, Vec<Listener>>,
    latest: FxHashMap<String, FeedRecord>,
}

impl HubInner {
    fn remove_listener(&mut self, device_id: &str, id: u64) -> bool {
        let Some(list) = self.listeners.get_mut(device_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| l.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.listeners.remove(device_id);
        }
        removed
    }
}

/// Shared handle to the device feed
#[derive(Clone, Default)]
pub struct FeedHub {
    inner: Arc<Mutex<HubInner>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one device
    pub fn subscribe(&self, device_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        let id = inner.next_id;
        inner.next_id += 1;

        let replayed = inner.latest.get(device_id).map(|current| {
            // Receiver is alive in this scope, send cannot fail
            let _ = tx.send(current.clone());
            current.timestamp
        });
        inner.listeners.entry(device_id.to_string()).or_default().push(Listener { id, tx });

        debug!(device_id = %device_id, subscription_id = id, "feed_subscribed");

        Subscription {
            id,
            device_id: device_id.to_string(),
            hub: Arc::downgrade(&self.inner),
            rx,
            replayed,
            closed: false,
        }
    }

    /// Publish a record, replacing the device's latest value
    ///
    /// Returns the number of listeners the record was delivered to.
    pub fn publish(&self, record: FeedRecord) -> usize {
        let mut inner = self.inner.lock();
        let device_id = record.device_id.clone();

        let mut delivered = 0;
        if let Some(list) = inner.listeners.get_mut(&device_id) {
            // Listeners whose receiver went away without closing are pruned here
            list.retain(|l| {
                let ok = l.tx.send(record.clone()).is_ok();
                delivered += usize::from(ok);
                ok
            });
            if list.is_empty() {
                inner.listeners.remove(&device_id);
            }
        }

        trace!(device_id = %device_id, delivered, "feed_published");
        inner.latest.insert(device_id, record);
        delivered
    }

    pub fn latest(&self, device_id: &str) -> Option<FeedRecord> {
        self.inner.lock().latest.get(device_id).cloned()
    }

    /// Number of live listeners for a device
    pub fn listener_count(&self, device_id: &str) -> usize {
        self.inner.lock().listeners.get(device_id).map_or(0, Vec::len)
    }

    /// Number of live listeners across all devices
    pub fn total_listeners(&self) -> usize {
        self.inner.lock().listeners.values().map(Vec::len).sum()
    }
}

/// A registered listener on one device's feed
pub struct Subscription {
    id: u64,
    device_id: String,
    hub: Weak<Mutex<HubInner>>,
    rx: mpsc::UnboundedReceiver<FeedRecord>,
    /// Timestamp of the record handed over at subscribe time
    replayed: Option<DateTime<Utc>>,
    closed: bool,
}

impl Subscription {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Timestamp of the current record at subscribe time; `None` if the
    /// feed was empty and nothing was replayed
    pub fn replayed(&self) -> Option<DateTime<Utc>> {
        self.replayed
    }

    /// Wait for the next record
    ///
    /// Returns `None` once the subscription is closed or the hub is gone.
    pub async fn recv(&mut self) -> Option<FeedRecord> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeedRecord> {
        if self.closed {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the listener
    ///
    /// Returns `true` only for the call that actually released it.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.rx.close();

        let removed = match self.hub.upgrade() {
            Some(inner) => inner.lock().remove_listener(&self.device_id, self.id),
            None => false,
        };
        debug!(device_id = %self.device_id, subscription_id = self.id, removed, "feed_unsubscribed");
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
