use parking_lot::Mutex;

use fanout_broker::BrokerHandle;
use fanout_core::errors::BusError;

static GLOBAL: SharedBrokerRegistry = SharedBrokerRegistry::new();

/// Process-wide slot holding the one shared broker handle. Buses that
/// select the shared transport all clone the same handle out of here.
pub struct SharedBrokerRegistry {
    slot: Mutex<Option<BrokerHandle>>,
}

impl SharedBrokerRegistry {
    pub const fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    pub fn global() -> &'static SharedBrokerRegistry {
        &GLOBAL
    }

    /// Return the shared handle, spawning the broker on first use. An
    /// init failure leaves the slot empty so a later caller can retry.
    pub fn get_or_try_init<F>(&self, init: F) -> Result<BrokerHandle, BusError>
    where
        F: FnOnce() -> Result<BrokerHandle, BusError>,
    {
        let mut slot = self.slot.lock();
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }
        let handle = init()?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}

impl Default for SharedBrokerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
