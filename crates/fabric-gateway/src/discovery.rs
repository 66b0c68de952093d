//! Host-wildcard ping discovery: the mechanism behind the control plane's
//! `ping` endpoint that lets [`crate::metrics_collector`] enumerate every
//! live service instance before fanning out `/metrics` scrapes.
//!
//! Ordinary control-plane `ping` registration (see [`crate::control_plane`])
//! answers a direct, host-addressed ping. Discovery needs the opposite: one
//! broadcast reaching every instance regardless of host. Every instance
//! additionally subscribes to the literal host-wildcard pattern
//! [`DISCOVERY_PATTERN`]; publishing anywhere that matches it (any host
//! token, any method, path `/ping`) reaches every subscribed instance.

use fabric_kernel::bus::{Bus, BusError, QueueGroup};
use fabric_kernel::frame::OpCode;
use fabric_kernel::Frame;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

/// The host-wildcard subject pattern every instance subscribes its
/// discovery responder to. `*` matches any host label, `ANY` any method.
pub const DISCOVERY_PATTERN: &str = "*.888.ANY.ping";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PingBody {
    pong: u8,
    host: String,
    #[serde(rename = "instanceId")]
    instance_id: String,
}

/// One instance's answer to a discovery ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingReply {
    pub host: String,
    pub instance_id: String,
}

/// A live discovery registration; drop or call [`unsubscribe`](Self::unsubscribe)
/// to stop answering pings.
pub struct DiscoveryHandle {
    cancel: Arc<Notify>,
    reader: Option<JoinHandle<()>>,
}

impl DiscoveryHandle {
    pub async fn unsubscribe(mut self) {
        self.cancel.notify_one();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }
}

/// Register this instance's discovery responder. Every ping matching
/// [`DISCOVERY_PATTERN`] gets `{"pong": 1, "host": ..., "instanceId": ...}`
/// back on its reply-to inbox.
pub async fn register(
    bus: Arc<dyn Bus>,
    host: impl Into<String>,
    instance_id: impl Into<String>,
) -> Result<DiscoveryHandle, BusError> {
    let host = host.into();
    let instance_id = instance_id.into();
    let mut subscription = bus.subscribe(DISCOVERY_PATTERN, QueueGroup::None).await?;
    let cancel = Arc::new(Notify::new());
    let cancel_for_loop = cancel.clone();

    let reader = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_for_loop.notified() => break,
                message = subscription.next() => {
                    let Some(message) = message else { break };
                    let Some(inbox) = message.reply_to.clone() else { continue };
                    let body = PingBody { pong: 1, host: host.clone(), instance_id: instance_id.clone() };
                    let mut headers = Frame::new();
                    headers.set_op_code(OpCode::Res);
                    let payload = serde_json::to_vec(&body).unwrap_or_default();
                    if let Err(err) = bus.reply(&inbox, payload, headers).await {
                        warn!(%err, "discovery ping reply failed");
                    }
                }
            }
        }
    });

    Ok(DiscoveryHandle { cancel, reader: Some(reader) })
}

/// Broadcast a discovery ping and collect replies until `timeout` elapses
/// or the ephemeral inbox goes quiet. Returns every reply received,
/// including duplicates from distinct replicas of the same host.
pub async fn ping_all(bus: &Arc<dyn Bus>, timeout: Duration) -> Vec<PingReply> {
    let inbox = format!("_inbox.{}", Uuid::new_v4());
    let mut subscription = match bus.subscribe(&inbox, QueueGroup::None).await {
        Ok(sub) => sub,
        Err(err) => {
            warn!(%err, "failed to open discovery inbox");
            return Vec::new();
        }
    };

    // The publish subject only needs to satisfy `DISCOVERY_PATTERN`'s
    // wildcards; the literal host/method tokens chosen here are arbitrary.
    if let Err(err) = bus.request("_discovery.888.GET.ping", &inbox, Vec::new(), Frame::new()).await {
        warn!(%err, "discovery ping broadcast failed");
        return Vec::new();
    }

    let mut replies = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            message = subscription.next() => {
                let Some(message) = message else { break };
                match serde_json::from_slice::<PingBody>(&message.payload) {
                    Ok(body) => replies.push(PingReply { host: body.host, instance_id: body.instance_id }),
                    Err(err) => warn!(%err, "malformed discovery ping reply"),
                }
            }
            _ = tokio::time::sleep(remaining) => break,
        }
    }
    subscription.unsubscribe().await;
    replies
}

/// `PingServices`: distinct responding hostnames.
pub fn distinct_hosts(replies: &[PingReply]) -> Vec<String> {
    let mut seen = HashSet::new();
    replies
        .iter()
        .filter(|r| seen.insert(r.host.clone()))
        .map(|r| r.host.clone())
        .collect()
}

/// `PingInstances`: one entry per responding replica, duplicates included.
pub fn instance_count(replies: &[PingReply]) -> usize {
    replies.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::CONTROL_PLANE_PORT;
    use fabric_runtime::InProcessBus;

    #[tokio::test]
    async fn discovery_ping_dedups_by_host_but_counts_every_instance() {
        let _ = CONTROL_PLANE_PORT; // keep the control-plane port import meaningful in this test module
        let bus: Arc<dyn Bus> = Arc::new(InProcessBus::new());

        let a1 = register(bus.clone(), "a.svc", "a-1").await.unwrap();
        let a2 = register(bus.clone(), "a.svc", "a-2").await.unwrap();
        let b1 = register(bus.clone(), "b.svc", "b-1").await.unwrap();

        let replies = ping_all(&bus, Duration::from_millis(100)).await;
        assert_eq!(instance_count(&replies), 3);
        let mut hosts = distinct_hosts(&replies);
        hosts.sort();
        assert_eq!(hosts, vec!["a.svc".to_string(), "b.svc".to_string()]);

        a1.unsubscribe().await;
        a2.unsubscribe().await;
        b1.unsubscribe().await;
    }
}
