//! The Subscriber: per-endpoint registration, queue-group selection,
//! middleware chain execution, panic recovery, and ack/res/err emission.

use fabric_kernel::actor::Actor;
use fabric_kernel::bus::{Bus, BusMessage, QueueGroup};
use fabric_kernel::endpoint::EndpointDefinition;
use fabric_kernel::error::FabricError;
use fabric_kernel::frame::OpCode;
use fabric_kernel::middleware::{Handler, MiddlewareChain, Request};
use fabric_kernel::subject::{Subject, SubjectKind};
use fabric_kernel::Frame;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, instrument, warn};

use crate::publisher::render_error_frame;

/// The Subscriber's tunables.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub max_call_depth: u32,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            max_call_depth: fabric_kernel::frame::DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

/// The dispatch engine for one service instance: owns its bus handle and
/// identity (host/replica id/version) and drives every endpoint it
/// registers.
pub struct Subscriber {
    bus: Arc<dyn Bus>,
    host: String,
    from_id: String,
    from_version: String,
    config: SubscriberConfig,
}

impl Subscriber {
    pub fn new(
        bus: Arc<dyn Bus>,
        host: impl Into<String>,
        from_id: impl Into<String>,
        from_version: impl Into<String>,
    ) -> Self {
        Self::with_config(bus, host, from_id, from_version, SubscriberConfig::default())
    }

    pub fn with_config(
        bus: Arc<dyn Bus>,
        host: impl Into<String>,
        from_id: impl Into<String>,
        from_version: impl Into<String>,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            bus,
            host: host.into(),
            from_id: from_id.into(),
            from_version: from_version.into(),
            config,
        }
    }

    /// Register `endpoint` on `port`, composing `chain` around `handler`
    /// once as a snapshot (the chain is mutated only before startup).
    /// Returns a handle that drains in-flight handlers on unsubscribe.
    pub async fn subscribe(
        self: &Arc<Self>,
        port: u16,
        endpoint: EndpointDefinition,
        chain: &RwLock<MiddlewareChain>,
        handler: Handler,
    ) -> Result<SubscriptionHandle, fabric_kernel::bus::BusError> {
        let pattern = Subject::new(SubjectKind::Subscription, &self.host, port, endpoint.method(), endpoint.route())
            .map_err(|e| fabric_kernel::bus::BusError::InvalidSubject(endpoint.route().to_string(), e.to_string()))?
            .encode();

        let composed: Handler = { chain.read().await.build(handler) };
        let mut subscription = self.bus.subscribe(&pattern, endpoint.queue_group()).await?;

        let cancel = Arc::new(Notify::new());
        let inflight: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let this = self.clone();
        let cancel_for_loop = cancel.clone();
        let inflight_for_loop = inflight.clone();
        let endpoint = Arc::new(endpoint);

        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_for_loop.notified() => {
                        subscription.unsubscribe().await;
                        break;
                    }
                    msg = subscription.next() => {
                        match msg {
                            None => break,
                            Some(bus_msg) => {
                                let this = this.clone();
                                let composed = composed.clone();
                                let endpoint = endpoint.clone();
                                let task = tokio::spawn(async move {
                                    this.handle_message(bus_msg, endpoint, composed).await;
                                });
                                inflight_for_loop.lock().await.push(task);
                            }
                        }
                    }
                }
            }
        });

        Ok(SubscriptionHandle { cancel, reader: Some(reader), inflight })
    }

    #[instrument(skip(self, msg, endpoint, handler), fields(subject = %msg.subject))]
    async fn handle_message(self: Arc<Self>, msg: BusMessage, endpoint: Arc<EndpointDefinition>, handler: Handler) {
        let Some(inbox) = msg.reply_to.clone() else {
            warn!("inbound message has no reply-to inbox; dropping");
            return;
        };
        let frame = msg.headers.clone();

        if frame.call_depth() > self.config.max_call_depth || frame.time_budget_ms() <= 0 {
            self.reply_error(&inbox, FabricError::deadline_exceeded("time budget exceeded")).await;
            return;
        }

        if let Some(expr) = endpoint.required_claims() {
            match frame.actor() {
                Ok(Some(claims)) => {
                    let actor = Actor::from_json(claims).expect("Frame::actor validated a JSON object");
                    if !expr.evaluate(&actor) {
                        self.reply_error(&inbox, FabricError::forbidden("actor lacks required claim")).await;
                        return;
                    }
                }
                Ok(None) => {
                    self.reply_error(&inbox, FabricError::unauthorized("no actor present")).await;
                    return;
                }
                Err(_) => {
                    self.reply_error(&inbox, FabricError::unauthorized("invalid actor claims")).await;
                    return;
                }
            }
        }

        let mut ack = Frame::new();
        ack.set_op_code(OpCode::Ack);
        ack.set_from_id(&self.from_id);
        ack.set_from_host(&self.host);
        if self.bus.reply(&inbox, Vec::new(), ack).await.is_err() {
            warn!("failed to send ack frame; peer's inbox may be gone");
            return;
        }

        let request = Request {
            method: endpoint.method().to_string(),
            path: endpoint.route().to_string(),
            query: String::new(),
            headers: frame,
            body: msg.payload,
        };

        let outcome = AssertUnwindSafe(handler(request)).catch_unwind().await;
        match outcome {
            Ok(response) => {
                let mut res = Frame::new();
                res.set_op_code(OpCode::Res);
                res.set_from_id(&self.from_id);
                res.set_from_host(&self.host);
                res.set_from_version(&self.from_version);
                res.set("x-fabric-status", response.status.to_string());
                for (name, values) in response.headers.iter() {
                    for value in values {
                        res.add(name, value.clone());
                    }
                }
                if self.bus.reply(&inbox, response.body, res).await.is_err() {
                    warn!("failed to send res frame; peer's inbox may be gone");
                }
            }
            Err(panic) => {
                let message = panic_message(&panic);
                error!(panic = %message, "handler panicked; recovered and replying err 500");
                self.reply_error(&inbox, FabricError::internal(message)).await;
            }
        }
    }

    async fn reply_error(&self, inbox: &str, err: FabricError) {
        let mut frame = Frame::new();
        frame.set_op_code(OpCode::Err);
        frame.set_from_id(&self.from_id);
        frame.set_from_host(&self.host);
        let body = render_error_frame(&err, true);
        if self.bus.reply(inbox, body, frame).await.is_err() {
            warn!("failed to send err frame; peer's inbox may be gone");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}

/// A live registration returned by [`Subscriber::subscribe`]. Dropping it
/// leaks the subscription; call [`unsubscribe`](Self::unsubscribe) to drain
/// in-flight handlers before returning.
pub struct SubscriptionHandle {
    cancel: Arc<Notify>,
    reader: Option<JoinHandle<()>>,
    inflight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SubscriptionHandle {
    /// Stop accepting new messages and wait for every in-flight handler to
    /// finish before returning.
    pub async fn unsubscribe(mut self) {
        self.cancel.notify_one();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        let handles = {
            let mut guard = self.inflight.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
