use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use fanout_core::errors::TransportError;
use fanout_core::ids::RequestId;

use crate::sse::{SseDecoder, SseFrame};

/// Events produced by one upstream connection attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum UpstreamEvent {
    Opened,
    Frame(SseFrame),
    Errored(TransportError),
    Closed,
}

/// Seam between the broker and the concrete push-stream transport.
/// A successful `connect` yields a channel of events for that one
/// session; the channel closing means the stream ended.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn connect(
        &self,
        request_id: &RequestId,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, TransportError>;
}

/// SSE subscription over HTTP: `GET {url}?request_id={id}` with an
/// `Accept: text/event-stream` header, decoded incrementally.
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
}

impl HttpUpstream {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn connect(
        &self,
        request_id: &RequestId,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, TransportError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("request_id", request_id.as_str())])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status { status: status.as_u16() });
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if tx.send(UpstreamEvent::Opened).await.is_err() {
                return;
            }
            let mut decoder = SseDecoder::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        for frame in decoder.feed(&bytes) {
                            if tx.send(UpstreamEvent::Frame(frame)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx
                            .send(UpstreamEvent::Errored(TransportError::StreamInterrupted(
                                err.to_string(),
                            )))
                            .await;
                        return;
                    }
                }
            }
            // Channel drop signals an orderly end of stream.
        });
        Ok(rx)
    }
}

/// Deterministic upstream for tests: connections succeed (or fail when
/// scripted), and the test drives the live stream by hand.
#[derive(Default)]
pub struct MockUpstream {
    state: Mutex<MockState>,
    connects: AtomicUsize,
}

#[derive(Default)]
struct MockState {
    fail_next: VecDeque<TransportError>,
    current: Option<mpsc::Sender<UpstreamEvent>>,
    request_ids: Vec<RequestId>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connect failure ahead of the next successful connect.
    pub fn fail_next_connect(&self, error: TransportError) {
        self.state.lock().fail_next.push_back(error);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    /// Request ids observed across all connection attempts, in order.
    pub fn request_ids(&self) -> Vec<RequestId> {
        self.state.lock().request_ids.clone()
    }

    /// Whether a live stream is currently being consumed.
    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .current
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub async fn emit_named(&self, event: &str, data: &str) {
        self.emit(UpstreamEvent::Frame(SseFrame {
            event: Some(event.to_string()),
            data: data.to_string(),
        }))
        .await;
    }

    pub async fn emit_unnamed(&self, data: &str) {
        self.emit(UpstreamEvent::Frame(SseFrame { event: None, data: data.to_string() }))
            .await;
    }

    pub async fn emit_error(&self, reason: &str) {
        self.emit(UpstreamEvent::Errored(TransportError::StreamInterrupted(
            reason.to_string(),
        )))
        .await;
    }

    /// Drop the live stream, as if the server closed it.
    pub fn close_stream(&self) {
        self.state.lock().current = None;
    }

    async fn emit(&self, event: UpstreamEvent) {
        let sender = self.state.lock().current.clone();
        if let Some(tx) = sender {
            let _ = tx.send(event).await;
        }
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn connect(
        &self,
        request_id: &RequestId,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, TransportError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.request_ids.push(request_id.clone());
        if let Some(err) = state.fail_next.pop_front() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(64);
        let _ = tx.try_send(UpstreamEvent::Opened);
        state.current = Some(tx);
        Ok(rx)
    }
}
