use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use fanout_broker::{BrokerConfig, BrokerHandle, HttpUpstream};
use fanout_core::backoff::BackoffPolicy;
use fanout_core::envelope;
use fanout_core::errors::BusError;
use fanout_core::ids::{PortId, RequestId};
use fanout_core::wire::PortEvent;

use crate::shared::SharedBrokerRegistry;
use crate::transport::{select_transport, TransportKind, TransportOptions};

/// Events that arrive before any handler for their name exists are held
/// here, so a replayed value is not lost to a registration race.
const PENDING_CAP: usize = 64;

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Startup parameters for a bus.
#[derive(Clone, Debug)]
pub struct BusConfig {
    pub url: String,
    pub transport: TransportOptions,
    pub is_test_mode: bool,
    /// Event names whose last payload the broker caches for late
    /// joiners. Only honored by the broker this bus spawns; a shared
    /// broker keeps the list it was first created with.
    pub replay_events: Vec<String>,
}

impl BusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            transport: TransportOptions::default(),
            is_test_mode: false,
            replay_events: vec!["version".to_string()],
        }
    }

    fn broker_config(&self, backoff: BackoffPolicy) -> BrokerConfig {
        BrokerConfig {
            backoff,
            replay_events: self.replay_events.clone(),
            ..Default::default()
        }
    }
}

struct HandlerEntry {
    id: u64,
    event: String,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    handlers: Vec<HandlerEntry>,
    pending: VecDeque<(String, Value)>,
    connected: bool,
    request_id: Option<RequestId>,
    next_id: u64,
}

struct Shared {
    inner: Mutex<Inner>,
}

/// One tab's view of the event stream. Holds a port into a broker
/// (shared or private) and dispatches inbound events to locally
/// registered handlers.
pub struct EventBus {
    shared: Arc<Shared>,
    broker: BrokerHandle,
    port_id: PortId,
    pump: JoinHandle<()>,
    is_test_mode: bool,
    transport: TransportKind,
}

impl EventBus {
    /// Select a transport and bring the bus up. A shared broker that
    /// cannot be reached downgrades to a private direct connection
    /// instead of failing.
    pub async fn start(config: BusConfig) -> Result<Self, BusError> {
        Self::start_with_registry(config, SharedBrokerRegistry::global()).await
    }

    /// As `start`, against a caller-supplied broker registry.
    pub async fn start_with_registry(
        config: BusConfig,
        registry: &SharedBrokerRegistry,
    ) -> Result<Self, BusError> {
        match select_transport(&config.transport) {
            TransportKind::SharedBroker => {
                let shared = registry.get_or_try_init(|| {
                    let upstream = HttpUpstream::new(config.url.clone())?;
                    Ok(BrokerHandle::spawn(
                        config.broker_config(BackoffPolicy::broker()),
                        Arc::new(upstream),
                    ))
                });
                let attempt = match shared {
                    Ok(handle) => {
                        Self::connect_on(handle, config.is_test_mode, TransportKind::SharedBroker)
                            .await
                    }
                    Err(err) => Err(err),
                };
                match attempt {
                    Ok(bus) => Ok(bus),
                    Err(err) => {
                        // Evict the dead handle so the next bus retries
                        // shared init instead of inheriting the failure.
                        registry.clear();
                        warn!(error = %err, "shared broker unavailable, downgrading to direct");
                        Self::spawn_direct(&config).await
                    }
                }
            }
            TransportKind::Direct => Self::spawn_direct(&config).await,
        }
    }

    /// Bring up a private broker serving only this bus. Uses the
    /// longer-fused backoff pair, matching a tab retrying on its own.
    pub async fn spawn_direct(config: &BusConfig) -> Result<Self, BusError> {
        let upstream = HttpUpstream::new(config.url.clone())?;
        let handle = BrokerHandle::spawn(
            config.broker_config(BackoffPolicy::direct()),
            Arc::new(upstream),
        );
        Self::connect_on(handle, config.is_test_mode, TransportKind::Direct).await
    }

    /// Attach to an already-running broker.
    pub async fn attach(broker: BrokerHandle, is_test_mode: bool) -> Result<Self, BusError> {
        Self::connect_on(broker, is_test_mode, TransportKind::SharedBroker).await
    }

    async fn connect_on(
        broker: BrokerHandle,
        is_test_mode: bool,
        transport: TransportKind,
    ) -> Result<Self, BusError> {
        let port = broker.connect(is_test_mode).await?;
        let shared = Arc::new(Shared { inner: Mutex::new(Inner::default()) });
        let pump = spawn_pump(Arc::clone(&shared), port.events);
        Ok(Self {
            shared,
            broker,
            port_id: port.id,
            pump,
            is_test_mode,
            transport,
        })
    }

    /// Register `handler` for `event` and make sure the upstream is
    /// listening for that name. Returns a guard that removes exactly
    /// this handler on drop.
    pub async fn add_event_listener(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Result<Subscription, BusError> {
        if envelope::is_reserved(event) {
            return Err(BusError::ReservedEvent(event.to_string()));
        }
        let handler: Handler = Arc::new(handler);
        let id;
        let buffered: Vec<Value>;
        {
            let mut inner = self.shared.inner.lock();
            id = inner.next_id;
            inner.next_id += 1;
            inner.handlers.push(HandlerEntry {
                id,
                event: event.to_string(),
                handler: Arc::clone(&handler),
            });
            let mut kept = VecDeque::with_capacity(inner.pending.len());
            let mut taken = Vec::new();
            while let Some((name, data)) = inner.pending.pop_front() {
                if name == event {
                    taken.push(data);
                } else {
                    kept.push_back((name, data));
                }
            }
            inner.pending = kept;
            buffered = taken;
        }
        // Flush anything that arrived before this handler existed, in
        // arrival order, to this handler only.
        for data in &buffered {
            invoke(&handler, event, data);
        }
        if let Err(err) = self.broker.subscribe(&self.port_id, event).await {
            // No guard exists yet, so unwind the registration here.
            self.shared.inner.lock().handlers.retain(|h| h.id != id);
            return Err(err);
        }
        Ok(Subscription { shared: Arc::downgrade(&self.shared), id })
    }

    /// Re-establish the transport on a fresh port, re-attaching every
    /// event name that still has local handlers. No-op when the bus is
    /// already connected.
    pub async fn reconnect(&mut self) -> Result<(), BusError> {
        if self.is_connected() {
            return Ok(());
        }
        let _ = self.broker.disconnect(&self.port_id).await;
        self.pump.abort();
        self.shared.inner.lock().connected = false;

        let port = self.broker.connect(self.is_test_mode).await?;
        info!(port_id = %port.id, "bus reconnected on fresh port");
        self.port_id = port.id;
        self.pump = spawn_pump(Arc::clone(&self.shared), port.events);

        let names: Vec<String> = {
            let inner = self.shared.inner.lock();
            let mut names = Vec::new();
            for entry in &inner.handlers {
                if !names.contains(&entry.event) {
                    names.push(entry.event.clone());
                }
            }
            names
        };
        for name in names {
            self.broker.subscribe(&self.port_id, &name).await?;
        }
        Ok(())
    }

    /// Detach from the broker. Idempotent; the bus stays usable only
    /// for inspection afterwards.
    pub async fn close(&mut self) {
        let _ = self.broker.disconnect(&self.port_id).await;
        self.pump.abort();
        self.shared.inner.lock().connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.inner.lock().connected
    }

    /// Correlation token of the current upstream connection, if open.
    pub fn request_id(&self) -> Option<RequestId> {
        self.shared.inner.lock().request_id.clone()
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.broker.disconnect_sync(&self.port_id);
        self.pump.abort();
    }
}

/// Removes its handler when dropped; the bus outliving the guard is
/// not required.
pub struct Subscription {
    shared: Weak<Shared>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.inner.lock().handlers.retain(|h| h.id != self.id);
        }
    }
}

fn spawn_pump(shared: Arc<Shared>, mut events: mpsc::Receiver<PortEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PortEvent::Connected { request_id } => {
                    let mut inner = shared.inner.lock();
                    inner.connected = true;
                    inner.request_id = Some(request_id);
                }
                PortEvent::Event { event, data } => dispatch(&shared, &event, data),
                PortEvent::Disconnected { reason } => {
                    info!(
                        reason = reason.as_deref().unwrap_or("unknown"),
                        "bus disconnected"
                    );
                    let mut inner = shared.inner.lock();
                    inner.connected = false;
                    inner.request_id = None;
                }
                PortEvent::Error { error } => {
                    warn!(error = %error, "bus transport error");
                    let mut inner = shared.inner.lock();
                    inner.connected = false;
                    inner.request_id = None;
                }
            }
        }
        shared.inner.lock().connected = false;
    })
}

fn dispatch(shared: &Shared, event: &str, data: Value) {
    let handlers: Vec<Handler> = {
        let mut inner = shared.inner.lock();
        let matched: Vec<Handler> = inner
            .handlers
            .iter()
            .filter(|h| h.event == event)
            .map(|h| Arc::clone(&h.handler))
            .collect();
        if matched.is_empty() {
            if inner.pending.len() == PENDING_CAP {
                inner.pending.pop_front();
            }
            inner.pending.push_back((event.to_string(), data));
            return;
        }
        matched
    };
    // Registration order, outside the lock so handlers may re-enter
    // the bus.
    for handler in &handlers {
        invoke(handler, event, &data);
    }
}

fn invoke(handler: &Handler, event: &str, data: &Value) {
    if catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
        error!(event = event, "event handler panicked, skipping");
    }
}
