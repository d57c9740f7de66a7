use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fanout_core::backoff::{BackoffPolicy, BackoffState};
use fanout_core::diag::{DiagEvent, DiagPhase, DiagSink, TracingDiagSink};
use fanout_core::envelope::{self, InboundEvent};
use fanout_core::errors::{BusError, TransportError};
use fanout_core::ids::{PortId, RequestId};
use fanout_core::wire::PortEvent;

use crate::ports::PortRegistry;
use crate::sse::SseFrame;
use crate::upstream::{Upstream, UpstreamEvent};

/// Broker tuning. `replay_events` names the event classes whose last
/// payload is cached and replayed to late-joining ports.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub backoff: BackoffPolicy,
    pub replay_events: Vec<String>,
    pub port_queue: usize,
    pub command_queue: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::broker(),
            replay_events: vec!["version".to_string()],
            port_queue: 256,
            command_queue: 256,
        }
    }
}

/// A tab's channel pair to the broker: its identity plus the stream of
/// events the broker pushes back.
pub struct Port {
    pub id: PortId,
    pub events: mpsc::Receiver<PortEvent>,
}

enum Msg {
    Connect {
        is_test_mode: bool,
        sender: mpsc::Sender<PortEvent>,
        reply: oneshot::Sender<PortId>,
    },
    Subscribe {
        port: PortId,
        event: String,
    },
    Disconnect {
        port: PortId,
    },
    Upstream {
        epoch: u64,
        event: UpstreamEvent,
    },
    ReconnectDue {
        epoch: u64,
    },
    Shutdown,
}

/// Clonable handle to a running broker task. All interaction is via
/// message passing; the broker's state is never shared directly.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Msg>,
    port_queue: usize,
}

impl BrokerHandle {
    /// Spawn a broker with the default tracing diagnostic sink.
    pub fn spawn(config: BrokerConfig, upstream: Arc<dyn Upstream>) -> Self {
        Self::spawn_with_diag(config, upstream, Arc::new(TracingDiagSink))
    }

    pub fn spawn_with_diag(
        config: BrokerConfig,
        upstream: Arc<dyn Upstream>,
        diag: Arc<dyn DiagSink>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.command_queue);
        let port_queue = config.port_queue;
        let broker = Broker {
            backoff: BackoffState::new(config.backoff),
            config,
            upstream,
            diag,
            tx: tx.clone(),
            registry: PortRegistry::new(),
            state: ConnState::Idle,
            request_id: None,
            attached: HashSet::new(),
            replay_cache: HashMap::new(),
            epoch: 0,
            reader: None,
        };
        tokio::spawn(broker.run(rx));
        Self { tx, port_queue }
    }

    /// Attach a new port. Opens the upstream connection if this is the
    /// first port; otherwise the port is acked with the live request id
    /// and any cached replay events.
    pub async fn connect(&self, is_test_mode: bool) -> Result<Port, BusError> {
        let (sender, events) = mpsc::channel(self.port_queue);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Msg::Connect { is_test_mode, sender, reply: reply_tx })
            .await
            .map_err(|_| BusError::BrokerGone)?;
        let id = reply_rx.await.map_err(|_| BusError::BrokerGone)?;
        Ok(Port { id, events })
    }

    /// Attach an upstream listener for `event`. Idempotent.
    pub async fn subscribe(&self, port: &PortId, event: &str) -> Result<(), BusError> {
        self.tx
            .send(Msg::Subscribe { port: port.clone(), event: event.to_string() })
            .await
            .map_err(|_| BusError::BrokerGone)
    }

    pub async fn disconnect(&self, port: &PortId) -> Result<(), BusError> {
        self.tx
            .send(Msg::Disconnect { port: port.clone() })
            .await
            .map_err(|_| BusError::BrokerGone)
    }

    /// Fire-and-forget disconnect for drop paths.
    pub fn disconnect_sync(&self, port: &PortId) {
        let _ = self.tx.try_send(Msg::Disconnect { port: port.clone() });
    }

    /// Stop the broker task, tearing down the connection and dropping
    /// every port. Later calls on this or any cloned handle fail with
    /// `BrokerGone`.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown).await;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    Idle,
    Connecting,
    Open,
    Backoff,
}

struct Broker {
    config: BrokerConfig,
    upstream: Arc<dyn Upstream>,
    diag: Arc<dyn DiagSink>,
    tx: mpsc::Sender<Msg>,
    registry: PortRegistry,
    state: ConnState,
    request_id: Option<RequestId>,
    // Sticky for the life of the connection: names stay attached even
    // after their last subscriber leaves, and are carried across
    // broker-initiated reconnects while any port remains.
    attached: HashSet<String>,
    backoff: BackoffState,
    replay_cache: HashMap<String, Value>,
    // Bumped whenever the connection context changes; stale upstream
    // events and reconnect timers are ignored by epoch mismatch.
    epoch: u64,
    reader: Option<JoinHandle<()>>,
}

impl Broker {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Connect { is_test_mode, sender, reply } => {
                    self.on_connect(is_test_mode, sender, reply);
                }
                Msg::Subscribe { port, event } => self.on_subscribe(port, event),
                Msg::Disconnect { port } => self.on_disconnect(port),
                Msg::Upstream { epoch, event } => self.on_upstream(epoch, event),
                Msg::ReconnectDue { epoch } => self.on_reconnect_due(epoch),
                Msg::Shutdown => {
                    self.teardown("broker shutdown");
                    break;
                }
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn on_connect(
        &mut self,
        is_test_mode: bool,
        sender: mpsc::Sender<PortEvent>,
        reply: oneshot::Sender<PortId>,
    ) {
        let id = PortId::new();
        self.registry.insert(id.clone(), sender, is_test_mode);
        info!(port_id = %id, ports = self.registry.len(), "port attached");

        match self.state {
            ConnState::Open => {
                // Ack with the live request id and replay cached
                // last-known values to the late joiner.
                if let Some(request_id) = self.request_id.clone() {
                    self.registry.send_to(&id, PortEvent::Connected { request_id });
                }
                for (event, data) in self.replay_cache.clone() {
                    self.registry.send_to(&id, PortEvent::Event { event, data });
                }
            }
            ConnState::Idle => self.open_connection(),
            // An attempt is already in flight; the port hears the
            // Connected broadcast when it lands.
            ConnState::Connecting | ConnState::Backoff => {}
        }
        let _ = reply.send(id);
    }

    fn on_subscribe(&mut self, port: PortId, event: String) {
        if !self.registry.contains(&port) {
            debug!(port_id = %port, "subscribe from unknown port ignored");
            return;
        }
        if self.attached.insert(event.clone()) {
            debug!(event = %event, "event name attached");
        }
    }

    fn on_disconnect(&mut self, port: PortId) {
        if self.registry.remove(&port) {
            info!(port_id = %port, ports = self.registry.len(), "port detached");
        }
        if self.registry.is_empty() {
            self.teardown("last port disconnected");
        }
    }

    fn on_upstream(&mut self, epoch: u64, event: UpstreamEvent) {
        if epoch != self.epoch {
            return; // from a superseded connection
        }
        match event {
            UpstreamEvent::Opened => self.on_opened(),
            UpstreamEvent::Frame(frame) => self.on_frame(frame),
            UpstreamEvent::Errored(err) => self.on_transport_error(err),
            UpstreamEvent::Closed => self.on_transport_error(TransportError::ClosedByServer),
        }
    }

    fn on_opened(&mut self) {
        self.state = ConnState::Open;
        self.backoff.reset();
        if let Some(request_id) = self.request_id.clone() {
            info!(request_id = %request_id, "upstream connection open");
            self.mirror(DiagPhase::Open, None, None);
            let failed = self.registry.broadcast(&PortEvent::Connected { request_id });
            self.drop_ports(failed);
        }
    }

    fn on_frame(&mut self, frame: SseFrame) {
        let inbound = match &frame.event {
            None => match envelope::unwrap_envelope(&frame.data) {
                Some(inbound) => inbound,
                None => return, // malformed envelope, dropped
            },
            Some(name) => {
                if envelope::is_reserved(name) {
                    self.on_shutdown_frame(&frame.data);
                    return;
                }
                // Replay-designated events are implicitly attached so
                // their last value is cached even before any subscriber.
                if !self.attached.contains(name) && !self.is_replay_event(name) {
                    return;
                }
                envelope::decode_named(name, &frame.data)
            }
        };
        if envelope::is_reserved(&inbound.event) {
            self.on_shutdown_frame(&frame.data);
            return;
        }
        self.deliver(inbound);
    }

    fn deliver(&mut self, inbound: InboundEvent) {
        if self.is_replay_event(&inbound.event) {
            self.replay_cache.insert(inbound.event.clone(), inbound.payload.clone());
        }
        self.mirror(
            DiagPhase::Message,
            Some(inbound.event.as_str()),
            Some(inbound.payload.clone()),
        );
        let failed = self.registry.broadcast(&PortEvent::Event {
            event: inbound.event,
            data: inbound.payload,
        });
        self.drop_ports(failed);
    }

    fn on_transport_error(&mut self, err: TransportError) {
        let reason = err.to_string();
        if err.is_retryable() {
            warn!(kind = err.error_kind(), error = %reason, "upstream transport error");
        } else {
            tracing::error!(kind = err.error_kind(), error = %reason, "upstream rejected connection");
        }
        self.mirror(DiagPhase::Error, None, Some(Value::String(reason.clone())));
        self.invalidate_stream();
        let failed = self.registry.broadcast(&PortEvent::Error { error: reason });
        self.drop_ports(failed);
        if self.registry.is_empty() {
            return; // drop_ports already tore everything down
        }
        self.schedule_reconnect();
    }

    fn on_shutdown_frame(&mut self, body: &str) {
        let reason = shutdown_reason(body);
        info!(reason = %reason, "backend requested graceful shutdown");
        self.mirror(DiagPhase::Close, None, None);
        self.invalidate_stream();
        let failed = self
            .registry
            .broadcast(&PortEvent::Disconnected { reason: Some(reason) });
        self.drop_ports(failed);
        if self.registry.is_empty() {
            return;
        }
        self.schedule_reconnect();
    }

    fn on_reconnect_due(&mut self, epoch: u64) {
        if epoch != self.epoch {
            return; // superseded by a newer attempt or a teardown
        }
        if self.registry.is_empty() || self.state != ConnState::Backoff {
            return;
        }
        self.open_connection();
    }

    fn open_connection(&mut self) {
        self.invalidate_stream();
        let request_id = RequestId::new();
        self.request_id = Some(request_id.clone());
        self.state = ConnState::Connecting;
        debug!(request_id = %request_id, "opening upstream connection");

        let upstream = Arc::clone(&self.upstream);
        let tx = self.tx.clone();
        let epoch = self.epoch;
        self.reader = Some(tokio::spawn(async move {
            match upstream.connect(&request_id).await {
                Ok(mut events) => {
                    while let Some(event) = events.recv().await {
                        if tx.send(Msg::Upstream { epoch, event }).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Msg::Upstream { epoch, event: UpstreamEvent::Closed }).await;
                }
                Err(err) => {
                    let _ = tx
                        .send(Msg::Upstream { epoch, event: UpstreamEvent::Errored(err) })
                        .await;
                }
            }
        }));
    }

    fn schedule_reconnect(&mut self) {
        self.state = ConnState::Backoff;
        let delay = self.backoff.next_delay();
        info!(
            attempt = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        let tx = self.tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Msg::ReconnectDue { epoch }).await;
        });
    }

    /// Drop ports whose channel failed, as if they had disconnected.
    fn drop_ports(&mut self, failed: Vec<PortId>) {
        for id in failed {
            if self.registry.remove(&id) {
                warn!(port_id = %id, "port channel torn down, dropping port");
            }
        }
        if self.registry.is_empty() && self.state != ConnState::Idle {
            self.teardown("all ports gone");
        }
    }

    /// Full teardown: the registry is empty, so the connection closes
    /// and every piece of per-connection state resets.
    fn teardown(&mut self, reason: &str) {
        if self.state == ConnState::Idle {
            return;
        }
        debug!(reason = reason, "closing upstream connection");
        if self.state == ConnState::Open {
            self.mirror(DiagPhase::Close, None, None);
        }
        self.invalidate_stream();
        self.state = ConnState::Idle;
        self.request_id = None;
        self.attached.clear();
        self.replay_cache.clear();
        self.backoff.reset();
    }

    /// Detach from the current stream: stale events and timers carrying
    /// the old epoch will be ignored.
    fn invalidate_stream(&mut self) {
        self.epoch += 1;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn is_replay_event(&self, event: &str) -> bool {
        self.config.replay_events.iter().any(|e| e == event)
    }

    /// Mirror a stream transition to the diagnostic sink while any
    /// attached port runs in test mode.
    fn mirror(&self, phase: DiagPhase, event: Option<&str>, data: Option<Value>) {
        if !self.registry.any_test_mode() {
            return;
        }
        let Some(request_id) = self.request_id.clone() else {
            return;
        };
        let mut diag = DiagEvent::new(request_id, phase);
        if let Some(event) = event {
            diag = diag.with_event(event);
        }
        if let Some(data) = data {
            diag = diag.with_data(data);
        }
        self.diag.record(diag);
    }
}

fn shutdown_reason(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::String(s)) => s,
        Ok(Value::Object(map)) => map
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("server shutdown")
            .to_string(),
        _ => "server shutdown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::MockUpstream;
    use fanout_core::diag::CollectingDiagSink;
    use serde_json::json;
    use std::time::Duration;

    fn fast_config() -> BrokerConfig {
        BrokerConfig {
            backoff: BackoffPolicy::new(
                Duration::from_millis(10),
                Duration::from_millis(40),
                2,
            ),
            replay_events: vec!["version".into()],
            ..Default::default()
        }
    }

    fn spawn_broker() -> (BrokerHandle, Arc<MockUpstream>) {
        let mock = Arc::new(MockUpstream::new());
        let handle = BrokerHandle::spawn(fast_config(), Arc::clone(&mock) as Arc<dyn Upstream>);
        (handle, mock)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    async fn expect_connected(port: &mut Port) -> RequestId {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), port.events.recv())
                .await
                .expect("timed out waiting for connected")
                .expect("port channel closed")
            {
                PortEvent::Connected { request_id } => return request_id,
                _ => continue,
            }
        }
    }

    async fn expect_event(port: &mut Port) -> (String, Value) {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), port.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("port channel closed")
            {
                PortEvent::Event { event, data } => return (event, data),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn many_ports_share_one_connection() {
        let (handle, mock) = spawn_broker();
        let mut a = handle.connect(false).await.unwrap();
        let mut b = handle.connect(false).await.unwrap();
        let mut c = handle.connect(false).await.unwrap();

        let rid_a = expect_connected(&mut a).await;
        let rid_b = expect_connected(&mut b).await;
        let rid_c = expect_connected(&mut c).await;

        assert_eq!(mock.connect_count(), 1);
        assert_eq!(rid_a, rid_b);
        assert_eq!(rid_b, rid_c);
    }

    #[tokio::test]
    async fn status_fanout_exactly_once_each() {
        let (handle, mock) = spawn_broker();
        let mut ports = Vec::new();
        for _ in 0..3 {
            let mut port = handle.connect(false).await.unwrap();
            expect_connected(&mut port).await;
            handle.subscribe(&port.id, "status").await.unwrap();
            ports.push(port);
        }
        settle().await;

        mock.emit_named("status", r#"{"state":"ok"}"#).await;

        for port in &mut ports {
            let (event, data) = expect_event(port).await;
            assert_eq!(event, "status");
            assert_eq!(data, json!({"state":"ok"}));
        }
        // Exactly once: nothing further is queued.
        settle().await;
        for port in &mut ports {
            assert!(port.events.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn departed_port_is_excluded_from_delivery() {
        let (handle, mock) = spawn_broker();
        let mut a = handle.connect(false).await.unwrap();
        let mut b = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;
        expect_connected(&mut b).await;
        handle.subscribe(&a.id, "status").await.unwrap();
        handle.subscribe(&b.id, "status").await.unwrap();
        settle().await;

        handle.disconnect(&a.id).await.unwrap();
        settle().await;
        mock.emit_named("status", r#"{"state":"ok"}"#).await;

        let (event, _) = expect_event(&mut b).await;
        assert_eq!(event, "status");
        assert!(mock.is_connected(), "connection stays up while b remains");
        settle().await;
        assert!(a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn last_disconnect_closes_connection() {
        let (handle, mock) = spawn_broker();
        let mut a = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;
        assert!(mock.is_connected());

        handle.disconnect(&a.id).await.unwrap();
        settle().await;
        assert!(!mock.is_connected(), "connection must close when registry empties");
    }

    #[tokio::test]
    async fn teardown_resets_backoff() {
        let mock = Arc::new(MockUpstream::new());
        let config = BrokerConfig {
            backoff: BackoffPolicy::new(
                Duration::from_millis(100),
                Duration::from_millis(1600),
                4,
            ),
            ..Default::default()
        };
        let handle = BrokerHandle::spawn(config, Arc::clone(&mock) as Arc<dyn Upstream>);

        let mut a = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;

        // Advance the backoff counter: the stream errors and the first
        // reconnect attempt fails too.
        mock.fail_next_connect(TransportError::ConnectFailed("refused".into()));
        mock.emit_error("boom").await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(mock.connect_count(), 2);

        // Last port leaves mid-backoff.
        handle.disconnect(&a.id).await.unwrap();
        settle().await;

        // A fresh port whose first attempt fails must retry after the
        // base delay again, not the inherited escalated one (1600ms).
        mock.fail_next_connect(TransportError::ConnectFailed("refused".into()));
        let started = tokio::time::Instant::now();
        let mut b = handle.connect(false).await.unwrap();
        expect_connected(&mut b).await;
        let elapsed = started.elapsed();

        assert_eq!(mock.connect_count(), 4);
        assert!(elapsed >= Duration::from_millis(90), "retry fired too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(800), "backoff did not reset: {elapsed:?}");
    }

    #[tokio::test]
    async fn shutdown_stops_the_broker() {
        let (handle, mock) = spawn_broker();
        let mut a = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;

        handle.shutdown().await;
        settle().await;

        assert!(!mock.is_connected());
        assert_eq!(a.events.recv().await, None);
        assert!(handle.connect(false).await.is_err());
    }

    #[tokio::test]
    async fn unattached_named_frames_are_not_delivered() {
        let (handle, mock) = spawn_broker();
        let mut a = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;
        handle.subscribe(&a.id, "status").await.unwrap();
        settle().await;

        mock.emit_named("other", r#"{"x":1}"#).await;
        mock.emit_named("status", r#"{"state":"ok"}"#).await;

        let (event, _) = expect_event(&mut a).await;
        assert_eq!(event, "status", "unattached frame must be skipped");
    }

    #[tokio::test]
    async fn attachment_is_sticky_for_the_connection() {
        // No unsubscribe path exists at the broker; once attached, a
        // name keeps delivering even when local subscribers churn.
        let (handle, mock) = spawn_broker();
        let mut a = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;
        handle.subscribe(&a.id, "status").await.unwrap();
        // Repeat subscriptions are idempotent.
        handle.subscribe(&a.id, "status").await.unwrap();
        settle().await;

        mock.emit_named("status", r#"{"n":1}"#).await;
        let (_, data) = expect_event(&mut a).await;
        assert_eq!(data, json!({"n":1}));

        mock.emit_named("status", r#"{"n":2}"#).await;
        let (_, data) = expect_event(&mut a).await;
        assert_eq!(data, json!({"n":2}));
    }

    #[tokio::test]
    async fn envelope_frames_dispatch_under_inner_type() {
        let (handle, mock) = spawn_broker();
        let mut a = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;

        mock.emit_unnamed(r#"{"type":"status","payload":{"state":"ok"}}"#).await;
        let (event, data) = expect_event(&mut a).await;
        assert_eq!(event, "status");
        assert_eq!(data, json!({"state":"ok"}));
    }

    #[tokio::test]
    async fn malformed_frames_never_surface() {
        let (handle, mock) = spawn_broker();
        let mut a = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;
        handle.subscribe(&a.id, "status").await.unwrap();
        settle().await;

        mock.emit_unnamed("{{{ not json").await;
        mock.emit_unnamed(r#"{"no_type_field":true}"#).await;
        mock.emit_named("status", "also not json").await;

        // The named frame falls back to a raw string payload; the two
        // malformed envelopes vanish.
        let (event, data) = expect_event(&mut a).await;
        assert_eq!(event, "status");
        assert_eq!(data, Value::String("also not json".into()));
        settle().await;
        assert!(a.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_joiner_receives_cached_replay_value() {
        let (handle, mock) = spawn_broker();
        let mut a = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;
        settle().await;

        mock.emit_named("version", r#"{"build":"1.2.3"}"#).await;
        settle().await;

        let mut late = handle.connect(false).await.unwrap();
        expect_connected(&mut late).await;
        let (event, data) = expect_event(&mut late).await;
        assert_eq!(event, "version");
        assert_eq!(data, json!({"build":"1.2.3"}));
    }

    #[tokio::test]
    async fn error_notifies_all_ports_then_reconnects() {
        let (handle, mock) = spawn_broker();
        let mut a = handle.connect(false).await.unwrap();
        let mut b = handle.connect(false).await.unwrap();
        let first_rid = expect_connected(&mut a).await;
        expect_connected(&mut b).await;

        mock.emit_error("connection reset").await;

        // Both ports hear the error...
        for port in [&mut a, &mut b] {
            loop {
                match port.events.recv().await.unwrap() {
                    PortEvent::Error { error } => {
                        assert!(error.contains("connection reset"));
                        break;
                    }
                    _ => continue,
                }
            }
        }

        // ...and a fresh connection arrives without anyone calling
        // connect again, under a new request id.
        let second_rid = expect_connected(&mut a).await;
        assert_ne!(first_rid, second_rid);
        expect_connected(&mut b).await;
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test]
    async fn reconnect_abandoned_when_ports_gone() {
        let mock = Arc::new(MockUpstream::new());
        let config = BrokerConfig {
            backoff: BackoffPolicy::new(
                Duration::from_millis(100),
                Duration::from_millis(400),
                2,
            ),
            ..Default::default()
        };
        let handle = BrokerHandle::spawn(config, Arc::clone(&mock) as Arc<dyn Upstream>);
        let mut a = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;

        mock.emit_error("boom").await;
        // Detach before the scheduled reconnect fires; the timer must
        // then be abandoned.
        handle.disconnect(&a.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test]
    async fn connect_failure_retries_with_backoff() {
        let mock = Arc::new(MockUpstream::new());
        mock.fail_next_connect(TransportError::ConnectFailed("refused".into()));
        mock.fail_next_connect(TransportError::ConnectFailed("refused".into()));
        let handle = BrokerHandle::spawn(fast_config(), Arc::clone(&mock) as Arc<dyn Upstream>);

        let mut a = handle.connect(false).await.unwrap();
        // Two scripted failures, then success.
        expect_connected(&mut a).await;
        assert_eq!(mock.connect_count(), 3);
        let ids = mock.request_ids();
        assert_eq!(ids.len(), 3);
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
    }

    #[tokio::test]
    async fn shutdown_frame_disconnects_then_reconnects() {
        let (handle, mock) = spawn_broker();
        let mut a = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;

        mock.emit_named("shutdown", r#"{"reason":"deploy"}"#).await;

        loop {
            match a.events.recv().await.unwrap() {
                PortEvent::Disconnected { reason } => {
                    assert_eq!(reason.as_deref(), Some("deploy"));
                    break;
                }
                PortEvent::Event { .. } => panic!("shutdown frame must not reach subscribers"),
                _ => continue,
            }
        }
        expect_connected(&mut a).await;
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_mode_mirrors_stream_transitions() {
        let mock = Arc::new(MockUpstream::new());
        let sink = CollectingDiagSink::new();
        let handle = BrokerHandle::spawn_with_diag(
            fast_config(),
            Arc::clone(&mock) as Arc<dyn Upstream>,
            sink.clone(),
        );

        let mut a = handle.connect(true).await.unwrap();
        expect_connected(&mut a).await;
        handle.subscribe(&a.id, "status").await.unwrap();
        settle().await;
        mock.emit_named("status", r#"{"state":"ok"}"#).await;
        expect_event(&mut a).await;
        mock.emit_error("boom").await;
        settle().await;

        let phases: Vec<DiagPhase> = sink.drain().into_iter().map(|d| d.phase).collect();
        assert!(phases.contains(&DiagPhase::Open));
        assert!(phases.contains(&DiagPhase::Message));
        assert!(phases.contains(&DiagPhase::Error));
    }

    #[tokio::test]
    async fn non_test_ports_do_not_mirror() {
        let mock = Arc::new(MockUpstream::new());
        let sink = CollectingDiagSink::new();
        let handle = BrokerHandle::spawn_with_diag(
            fast_config(),
            Arc::clone(&mock) as Arc<dyn Upstream>,
            sink.clone(),
        );

        let mut a = handle.connect(false).await.unwrap();
        expect_connected(&mut a).await;
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn dropped_port_receiver_is_implicit_disconnect() {
        let (handle, mock) = spawn_broker();
        let mut keeper = handle.connect(false).await.unwrap();
        let goner = handle.connect(false).await.unwrap();
        expect_connected(&mut keeper).await;
        drop(goner.events);
        settle().await;

        mock.emit_named("version", r#"{"build":"9"}"#).await;
        // Broadcast hits the dead channel, which evicts the port; the
        // connection stays up for the surviving one.
        let (event, _) = expect_event(&mut keeper).await;
        assert_eq!(event, "version");
        settle().await;
        assert!(mock.is_connected());
    }
}
