//! The Publisher: unicast `Request` (ack-or-fail-fast) and multicast
//! `Publish` (lazy response sequence) over a [`Bus`].

use crate::pending::{Multiplicity, PendingRequest, PendingRequestMap};
use fabric_kernel::bus::{Bus, BusMessage, QueueGroup};
use fabric_kernel::error::{ErrorEnvelope, FabricError};
use fabric_kernel::frame::{DEFAULT_MAX_CALL_DEPTH, OpCode};
use fabric_kernel::middleware::Response;
use fabric_kernel::subject::{Subject, SubjectKind};
use fabric_kernel::Frame;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{instrument, warn};
use uuid::Uuid;

/// The Publisher's tunables.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Cap on `call-depth`; exceeding it fails the call locally.
    pub max_call_depth: u32,
    /// Estimated in-process overhead subtracted from the caller's time
    /// budget when composing the outbound frame.
    pub overhead_ms: i64,
    /// Default ack window, capped by the remaining time budget.
    pub ack_window_ms: u64,
    /// Per-inbox response channel capacity.
    pub channel_buffer: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            overhead_ms: 1,
            ack_window_ms: 250,
            channel_buffer: 64,
        }
    }
}

/// A request body, serialized per the wire rules: binary passes through;
/// form fields are form-encoded; anything else is JSON.
#[derive(Debug, Clone)]
pub enum Body {
    Bytes(Vec<u8>),
    Form(Vec<(String, String)>),
    Json(Value),
    Empty,
}

/// The address and payload of an outbound call.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub host: String,
    pub port: u16,
    pub method: String,
    pub path: String,
    pub body: Body,
    /// Caps the outbound time budget further than the caller frame alone
    /// would, if set.
    pub time_budget_ms: Option<i64>,
}

impl RequestOptions {
    pub fn new(host: impl Into<String>, port: u16, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            method: method.into(),
            path: path.into(),
            body: Body::Empty,
            time_budget_ms: None,
        }
    }

    pub fn with_json_body(mut self, body: Value) -> Self {
        self.body = Body::Json(body);
        self
    }

    pub fn with_bytes_body(mut self, body: Vec<u8>) -> Self {
        self.body = Body::Bytes(body);
        self
    }
}

/// Errors the Publisher can surface.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum PublisherError {
    #[error("no peer acknowledged the request within the ack window")]
    NoResponder,
    #[error("time budget exceeded before a response arrived")]
    TimeBudgetExceeded,
    #[error("peer returned an error: {0} {1}")]
    PeerError(u16, String),
    #[error("call was canceled")]
    Canceled,
    #[error(transparent)]
    Frame(#[from] fabric_kernel::frame::FrameError),
    #[error(transparent)]
    Subject(#[from] fabric_kernel::subject::SubjectError),
    #[error(transparent)]
    Bus(#[from] fabric_kernel::bus::BusError),
    #[error("failed to serialize request body: {0}")]
    Serialize(String),
}

fn encode_body(body: &Body) -> Result<(Vec<u8>, &'static str), PublisherError> {
    match body {
        Body::Empty => Ok((Vec::new(), "application/json")),
        Body::Bytes(b) => Ok((b.clone(), "application/octet-stream")),
        Body::Form(pairs) => {
            let encoded = form_urlencoded_encode(pairs);
            Ok((encoded.into_bytes(), "application/x-www-form-urlencoded"))
        }
        Body::Json(value) => {
            let bytes = serde_json::to_vec(value).map_err(|e| PublisherError::Serialize(e.to_string()))?;
            Ok((bytes, "application/json"))
        }
    }
}

fn form_urlencoded_encode(pairs: &[(String, String)]) -> String {
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    pairs
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, NON_ALPHANUMERIC),
                utf8_percent_encode(v, NON_ALPHANUMERIC)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

enum FrameOutcome {
    Ack,
    Res(Response),
    Err(PublisherError),
}

fn classify(msg: &BusMessage) -> FrameOutcome {
    match msg.headers.op_code() {
        Some(OpCode::Ack) => FrameOutcome::Ack,
        Some(OpCode::Res) => {
            let status: u16 = msg
                .headers
                .get_one("x-fabric-status")
                .and_then(|s| s.parse().ok())
                .unwrap_or(200);
            let mut headers = msg.headers.clone();
            headers.strip_reserved();
            FrameOutcome::Res(Response {
                status,
                headers,
                body: msg.payload.clone(),
            })
        }
        Some(OpCode::Err) => {
            let status = parse_error_status(&msg.payload);
            let body = String::from_utf8_lossy(&msg.payload).to_string();
            FrameOutcome::Err(PublisherError::PeerError(status, body))
        }
        Some(OpCode::Req) | None => {
            FrameOutcome::Err(PublisherError::Bus(fabric_kernel::bus::BusError::Other(
                "unexpected op-code on reply inbox".to_string(),
            )))
        }
    }
}

fn parse_error_status(payload: &[u8]) -> u16 {
    serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|v| v.get("err")?.get("statusCode")?.as_u64())
        .map(|n| n as u16)
        .unwrap_or(500)
}

/// Serialize a [`FabricError`] as the `err` frame body this module expects
/// a peer to send back (re-exported for convenience of callers that build
/// their own Subscriber responses against this Publisher's decoding rules).
pub fn render_error_frame(error: &FabricError, redact: bool) -> Vec<u8> {
    let envelope: ErrorEnvelope = error.to_envelope();
    serde_json::to_vec(&envelope.render(redact)).unwrap_or_default()
}

/// The request engine: unicast `Request` and multicast `Publish`.
pub struct Publisher {
    bus: Arc<dyn Bus>,
    pending: Arc<PendingRequestMap>,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self::with_config(bus, PublisherConfig::default())
    }

    pub fn with_config(bus: Arc<dyn Bus>, config: PublisherConfig) -> Self {
        Self {
            bus,
            pending: Arc::new(PendingRequestMap::new()),
            config,
        }
    }

    async fn dispatch(
        &self,
        caller: &Frame,
        opts: &RequestOptions,
        multiplicity: Multiplicity,
    ) -> Result<(mpsc::Receiver<BusMessage>, Arc<PendingRequest>, String, Instant), PublisherError> {
        let message_id = Uuid::new_v4().to_string();
        let mut frame = caller.child(&message_id, self.config.overhead_ms, self.config.max_call_depth)?;
        if let Some(cap) = opts.time_budget_ms {
            frame.set_time_budget_ms(frame.time_budget_ms().min(cap));
        }
        if frame.time_budget_ms() <= 0 {
            return Err(PublisherError::TimeBudgetExceeded);
        }

        let (body_bytes, content_type) = encode_body(&opts.body)?;
        if !frame.has("content-type") {
            frame.set("content-type", content_type);
        }

        let subject = Subject::new(SubjectKind::Publication, &opts.host, opts.port, &opts.method, &opts.path)?
            .encode();
        let inbox = format!("_inbox.{message_id}");
        let deadline = Instant::now() + Duration::from_millis(frame.time_budget_ms() as u64);

        let mut rx = self.pending.register(message_id.clone(), multiplicity, deadline, self.config.channel_buffer);
        let pending_for_task = self.pending.clone();
        let mid_for_task = message_id.clone();
        let mut subscription = self.bus.subscribe(&inbox, QueueGroup::None).await?;
        tokio::spawn(async move {
            while let Some(msg) = subscription.next().await {
                let peer = msg
                    .headers
                    .from_id()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                pending_for_task.deliver(&mid_for_task, &peer, msg);
            }
            subscription.unsubscribe().await;
        });

        self.bus.request(&subject, &inbox, body_bytes, frame).await?;
        let pending = self
            .pending
            .get(&message_id)
            .expect("just registered above");

        Ok((rx, pending, message_id, deadline))
    }

    /// Unicast request: at most one peer replies.
    #[instrument(skip(self, caller, opts), fields(method = %opts.method, path = %opts.path))]
    pub async fn request(&self, caller: &Frame, opts: RequestOptions) -> Result<Response, PublisherError> {
        let (mut rx, pending, message_id, deadline) = self.dispatch(caller, &opts, Multiplicity::Single).await?;
        let ack_window = Duration::from_millis(self.config.ack_window_ms);
        let ack_deadline = (Instant::now() + ack_window).min(deadline);

        let result = loop {
            if Instant::now() >= deadline {
                break Err(PublisherError::TimeBudgetExceeded);
            }
            let acked = pending.acknowledged_peer_count() > 0;
            let wake_at = if acked { deadline } else { ack_deadline };

            tokio::select! {
                biased;
                msg = rx.recv() => {
                    match msg {
                        None => break Err(PublisherError::NoResponder),
                        Some(bus_msg) => {
                            let peer = bus_msg.headers.from_id().map(|s| s.to_string());
                            match classify(&bus_msg) {
                                FrameOutcome::Ack => {
                                    if let Some(peer) = &peer {
                                        pending.acknowledge(peer);
                                    }
                                    continue;
                                }
                                FrameOutcome::Res(resp) => break Ok(resp),
                                FrameOutcome::Err(e) => break Err(e),
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(wake_at) => {
                    if !acked {
                        warn!(message_id = %message_id, "ack window elapsed with no responder");
                        break Err(PublisherError::NoResponder);
                    }
                }
            }
        };
        self.pending.unregister(&message_id);
        result
    }

    /// Multicast publish: zero or more peers reply; returns a lazy,
    /// pull-based sequence of responses.
    #[instrument(skip(self, caller, opts), fields(method = %opts.method, path = %opts.path))]
    pub async fn publish(&self, caller: &Frame, opts: RequestOptions) -> Result<ResponseStream, PublisherError> {
        let (rx, pending, message_id, deadline) = self.dispatch(caller, &opts, Multiplicity::Stream).await?;
        Ok(ResponseStream {
            rx,
            pending,
            pending_map: self.pending.clone(),
            message_id,
            deadline,
            closed: false,
        })
    }
}

/// A pull-based iterator over a multicast `Publish`'s responses. Releases
/// the bus inbox when exhausted, the deadline elapses, or [`close`] is
/// called explicitly — whichever happens first.
///
/// [`close`]: ResponseStream::close
pub struct ResponseStream {
    rx: mpsc::Receiver<BusMessage>,
    pending: Arc<PendingRequest>,
    pending_map: Arc<PendingRequestMap>,
    message_id: String,
    deadline: Instant,
    closed: bool,
}

impl ResponseStream {
    /// Pull the next response, or `None` once the sequence has terminated.
    pub async fn next(&mut self) -> Option<Result<Response, PublisherError>> {
        if self.closed {
            return None;
        }
        loop {
            if Instant::now() >= self.deadline {
                self.close();
                return None;
            }
            if self.pending.all_acknowledged_peers_completed() {
                self.close();
                return None;
            }
            tokio::select! {
                biased;
                msg = self.rx.recv() => {
                    match msg {
                        None => {
                            self.close();
                            return None;
                        }
                        Some(bus_msg) => {
                            let peer = bus_msg.headers.from_id().map(|s| s.to_string());
                            match classify(&bus_msg) {
                                FrameOutcome::Ack => {
                                    if let Some(peer) = &peer {
                                        self.pending.acknowledge(peer);
                                    }
                                    continue;
                                }
                                FrameOutcome::Res(resp) => {
                                    if let Some(peer) = &peer {
                                        self.pending.mark_completed(peer);
                                    }
                                    return Some(Ok(resp));
                                }
                                FrameOutcome::Err(e) => {
                                    if let Some(peer) = &peer {
                                        self.pending.mark_completed(peer);
                                    }
                                    return Some(Err(e));
                                }
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    self.close();
                    return None;
                }
            }
        }
    }

    /// Stop pulling and release the bus inbox early.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pending_map.unregister(&self.message_id);
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use fabric_kernel::middleware::Response as MwResponse;

    async fn spawn_echo_responder(bus: Arc<InProcessBus>, subject: &str, from_id: &str, status: u16, body: Vec<u8>) {
        let mut sub = bus.subscribe(subject, QueueGroup::Default).await.unwrap();
        let bus = bus.clone();
        let from_id = from_id.to_string();
        tokio::spawn(async move {
            if let Some(msg) = sub.next().await {
                if let Some(inbox) = msg.reply_to.clone() {
                    let mut ack = Frame::new();
                    ack.set_op_code(OpCode::Ack);
                    ack.set_from_id(from_id.clone());
                    bus.reply(&inbox, vec![], ack).await.unwrap();

                    let mut res = Frame::new();
                    res.set_op_code(OpCode::Res);
                    res.set_from_id(from_id.clone());
                    res.set("x-fabric-status", status.to_string());
                    bus.reply(&inbox, body, res).await.unwrap();
                }
            }
        });
    }

    #[tokio::test]
    async fn request_returns_response_from_responder() {
        let bus: Arc<InProcessBus> = Arc::new(InProcessBus::new());
        spawn_echo_responder(bus.clone(), "svc/widgets.443.GET.ping", "peer-a", 200, b"ok".to_vec()).await;

        let publisher = Publisher::new(bus);
        let caller = Frame::root("root-1", 5_000);
        let opts = RequestOptions::new("widgets.svc", 443, "GET", "/ping");
        let resp: MwResponse = publisher.request(&caller, opts).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"ok");
    }

    #[tokio::test]
    async fn request_with_no_responder_times_out_as_no_responder() {
        let bus: Arc<InProcessBus> = Arc::new(InProcessBus::new());
        let publisher = Publisher::with_config(
            bus,
            PublisherConfig {
                ack_window_ms: 20,
                ..PublisherConfig::default()
            },
        );
        let caller = Frame::root("root-1", 5_000);
        let opts = RequestOptions::new("nobody.svc", 443, "GET", "/ping");
        let err = publisher.request(&caller, opts).await.unwrap_err();
        assert!(matches!(err, PublisherError::NoResponder));
    }

    #[tokio::test]
    async fn request_waits_past_the_ack_window_once_acknowledged() {
        let bus: Arc<InProcessBus> = Arc::new(InProcessBus::new());
        let mut sub = bus.subscribe("svc/slow.443.GET.ping", QueueGroup::Default).await.unwrap();
        let bus_for_responder = bus.clone();
        tokio::spawn(async move {
            let msg = sub.next().await.unwrap();
            let inbox = msg.reply_to.clone().unwrap();

            let mut ack = Frame::new();
            ack.set_op_code(OpCode::Ack);
            ack.set_from_id("peer-a");
            bus_for_responder.reply(&inbox, vec![], ack).await.unwrap();

            tokio::time::sleep(Duration::from_millis(60)).await;

            let mut res = Frame::new();
            res.set_op_code(OpCode::Res);
            res.set_from_id("peer-a");
            res.set("x-fabric-status", "200");
            bus_for_responder.reply(&inbox, b"late".to_vec(), res).await.unwrap();
        });

        let publisher = Publisher::with_config(
            bus,
            PublisherConfig { ack_window_ms: 20, ..PublisherConfig::default() },
        );
        let caller = Frame::root("root-1", 5_000);
        let opts = RequestOptions::new("slow.svc", 443, "GET", "/ping");
        let resp = publisher.request(&caller, opts).await.unwrap();
        assert_eq!(resp.body, b"late");
    }

    async fn spawn_broadcast_responder(bus: Arc<InProcessBus>, subject: &str, from_id: &str) {
        let mut sub = bus.subscribe(subject, QueueGroup::None).await.unwrap();
        let bus = bus.clone();
        let from_id = from_id.to_string();
        tokio::spawn(async move {
            if let Some(msg) = sub.next().await {
                if let Some(inbox) = msg.reply_to.clone() {
                    let mut ack = Frame::new();
                    ack.set_op_code(OpCode::Ack);
                    ack.set_from_id(from_id.clone());
                    bus.reply(&inbox, vec![], ack).await.unwrap();

                    let mut res = Frame::new();
                    res.set_op_code(OpCode::Res);
                    res.set_from_id(from_id.clone());
                    res.set("x-fabric-status", "200");
                    bus.reply(&inbox, vec![], res).await.unwrap();
                }
            }
        });
    }

    #[tokio::test]
    async fn publish_stream_ends_once_every_acknowledged_peer_completes() {
        let bus: Arc<InProcessBus> = Arc::new(InProcessBus::new());
        spawn_broadcast_responder(bus.clone(), "svc/fanout.443.GET.ping", "peer-a").await;
        spawn_broadcast_responder(bus.clone(), "svc/fanout.443.GET.ping", "peer-b").await;

        let publisher = Publisher::new(bus);
        let caller = Frame::root("root-1", 5_000);
        let opts = RequestOptions::new("fanout.svc", 443, "GET", "/ping");
        let mut stream = publisher.publish(&caller, opts).await.unwrap();

        let started = Instant::now();
        let mut count = 0;
        while stream.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "stream should close as soon as both acknowledged peers complete, not wait out the 5s time budget"
        );
    }

    #[tokio::test]
    async fn call_depth_overflow_fails_locally() {
        let bus: Arc<InProcessBus> = Arc::new(InProcessBus::new());
        let publisher = Publisher::new(bus);
        let mut caller = Frame::root("root-1", 5_000);
        caller.set_call_depth(DEFAULT_MAX_CALL_DEPTH);
        let opts = RequestOptions::new("svc", 443, "GET", "/ping");
        let err = publisher.request(&caller, opts).await.unwrap_err();
        assert!(matches!(err, PublisherError::Frame(_)));
    }
}
