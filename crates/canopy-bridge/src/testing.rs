//! In-memory [`Bridge`] for tests of the relay and the edge agent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::SiteMessage;
use crate::topic::Topic;

/// Records every accepted publish. Behaves like the real handle when
/// disconnected: the publish fails and nothing is recorded.
#[derive(Debug)]
pub struct RecordingBridge {
    published: Mutex<Vec<(String, SiteMessage)>>,
    connected: AtomicBool,
}

impl Default for RecordingBridge {
    fn default() -> Self {
        Self::connected()
    }
}

impl RecordingBridge {
    pub fn connected() -> Self {
        RecordingBridge {
            published: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn disconnected() -> Self {
        let bridge = Self::connected();
        bridge.set_connected(false);
        bridge
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// All accepted publishes as `(site, message)`, oldest first.
    pub fn published(&self) -> Vec<(String, SiteMessage)> {
        self.lock().clone()
    }

    /// Messages published on `topic` for `site`, oldest first.
    pub fn published_to(&self, site: &str, topic: Topic) -> Vec<SiteMessage> {
        self.lock()
            .iter()
            .filter(|(s, m)| s == site && m.topic() == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn count(&self, site: &str, topic: Topic) -> usize {
        self.published_to(site, topic).len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, SiteMessage)>> {
        self.published.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Bridge for RecordingBridge {
    fn publish(&self, site: &str, message: &SiteMessage) -> BridgeResult<()> {
        if !self.is_connected() {
            return Err(BridgeError::Unavailable);
        }
        self.lock().push((site.to_string(), message.clone()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
