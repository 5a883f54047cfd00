//! In-process fan-out `Hub`: one `tokio::sync::broadcast` channel per
//! subscriber group, created lazily on first use.
//!
//! Grounded on `engine::state`'s single global
//! `broadcast::Sender<Arc<RaceEvent>>` with a `let _ = tx.send(...)`
//! send (no subscribers is not an error); generalized here to a
//! `HashMap` keyed by group since messages are scoped per session/car
//! group rather than broadcast to every client.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::ports::{Hub, PortResult};
use timing_contracts::hub::HubMessage;

const CHANNEL_CAPACITY: usize = 256;

pub struct BroadcastHub {
    groups: Mutex<HashMap<String, broadcast::Sender<Arc<HubMessage>>>>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self { groups: Mutex::new(HashMap::new()) }
    }

    /// Subscribe to a group's channel, creating it if this is the first
    /// subscriber to ever ask for it.
    pub fn subscribe(&self, group: &str) -> broadcast::Receiver<Arc<HubMessage>> {
        let mut groups = self.groups.lock().expect("broadcast hub mutex poisoned");
        groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn sender_for(&self, group: &str) -> broadcast::Sender<Arc<HubMessage>> {
        let mut groups = self.groups.lock().expect("broadcast hub mutex poisoned");
        groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Hub for BroadcastHub {
    async fn send_to_group(&self, group: &str, message: HubMessage) -> PortResult<()> {
        let sender = self.sender_for(group);
        let _ = sender.send(Arc::new(message));
        Ok(())
    }
}
