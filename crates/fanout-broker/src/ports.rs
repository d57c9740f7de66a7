use std::collections::HashMap;

use tokio::sync::mpsc;

use fanout_core::ids::PortId;
use fanout_core::wire::PortEvent;

struct PortEntry {
    sender: mpsc::Sender<PortEvent>,
    is_test_mode: bool,
}

/// Broker-side bookkeeping of attached ports. Owned exclusively by the
/// broker task; all mutation happens inside its message handlers.
#[derive(Default)]
pub struct PortRegistry {
    ports: HashMap<PortId, PortEntry>,
    // Registration order, for stable broadcast iteration.
    order: Vec<PortId>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: PortId, sender: mpsc::Sender<PortEvent>, is_test_mode: bool) {
        self.order.push(id.clone());
        self.ports.insert(id, PortEntry { sender, is_test_mode });
    }

    pub fn remove(&mut self, id: &PortId) -> bool {
        self.order.retain(|p| p != id);
        self.ports.remove(id).is_some()
    }

    pub fn contains(&self, id: &PortId) -> bool {
        self.ports.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn any_test_mode(&self) -> bool {
        self.ports.values().any(|p| p.is_test_mode)
    }

    /// Send to one port. A full queue drops the message (backpressure);
    /// only a torn-down channel counts as failure.
    pub fn send_to(&self, id: &PortId, event: PortEvent) -> bool {
        let Some(entry) = self.ports.get(id) else {
            return false;
        };
        match entry.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(evt)) => {
                tracing::warn!(
                    port_id = %id,
                    event_type = evt.event_type(),
                    "port queue full, dropping message"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Send to every port, preserving per-port FIFO order. Returns the
    /// ids whose channel is torn down so the broker can drop them as
    /// implicit disconnects.
    pub fn broadcast(&self, event: &PortEvent) -> Vec<PortId> {
        let mut failed = Vec::new();
        for id in &self.order {
            if !self.send_to(id, event.clone()) {
                failed.push(id.clone());
            }
        }
        failed
    }
}
