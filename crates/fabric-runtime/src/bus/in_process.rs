//! `InProcessBus`: the one concrete [`Bus`] this workspace ships. Built on
//! per-subject-pattern `tokio::sync::mpsc` queues with a round-robin cursor
//! per `default` queue group, matching the teacher's choice of an
//! `Arc<RwLock<HashMap<..>>>`-backed, cheaply-`Clone`-able bus core.

use async_trait::async_trait;
use fabric_kernel::bus::{Bus, BusError, BusMessage, QueueGroup, Subscription};
use fabric_kernel::Frame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{trace, warn};

const SUBSCRIBER_BUFFER: usize = 256;

struct Member {
    id: u64,
    sender: mpsc::Sender<BusMessage>,
}

/// All subscribers registered against one subject pattern.
#[derive(Default)]
struct PatternGroup {
    /// `QueueGroup::Default` members: one picked per message, round-robin.
    default_members: Vec<Member>,
    cursor: AtomicUsize,
    /// `QueueGroup::None` members: every one gets every matching message.
    broadcast_members: Vec<Member>,
}

#[derive(Default)]
struct Registry {
    patterns: HashMap<String, PatternGroup>,
}

/// An in-memory, at-most-once, no-persistence `Bus`.
///
/// Cheap to clone: all state lives behind an `Arc`, matching the teacher's
/// `AgentBus` convention of a `#[derive(Clone)]` struct over `Arc<RwLock<_>>`
/// fields so callers can hand out bus handles freely.
#[derive(Clone)]
pub struct InProcessBus {
    registry: Arc<RwLock<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn deliver(&self, subject: &str, message: BusMessage) -> Result<(), BusError> {
        let registry = self.registry.read().await;
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let mut delivered = false;

        for (pattern, group) in registry.patterns.iter() {
            let pattern_tokens: Vec<&str> = pattern.split('.').collect();
            if !subject_matches(&pattern_tokens, &subject_tokens) {
                continue;
            }

            if !group.default_members.is_empty() {
                let idx = group.cursor.fetch_add(1, Ordering::Relaxed) % group.default_members.len();
                let member = &group.default_members[idx];
                if member.sender.try_send(message.clone()).is_err() {
                    warn!(subject, "dropping message: default-group subscriber is stalled");
                } else {
                    delivered = true;
                }
            }
            for member in &group.broadcast_members {
                if member.sender.try_send(message.clone()).is_err() {
                    warn!(subject, "dropping message: broadcast subscriber is stalled");
                } else {
                    delivered = true;
                }
            }
        }

        if !delivered {
            trace!(subject, "no subscriber matched publish");
        }
        Ok(())
    }
}

#[async_trait]
impl Bus for InProcessBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>, headers: Frame) -> Result<(), BusError> {
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
            headers,
            reply_to: None,
        };
        self.deliver(subject, message).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: QueueGroup,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let member = Member { id, sender: tx };

        {
            let mut registry = self.registry.write().await;
            let group = registry.patterns.entry(subject.to_string()).or_default();
            match queue_group {
                QueueGroup::Default => group.default_members.push(member),
                QueueGroup::None => group.broadcast_members.push(member),
            }
        }

        Ok(Box::new(InProcessSubscription {
            id,
            pattern: subject.to_string(),
            queue_group,
            receiver: rx,
            registry: self.registry.clone(),
        }))
    }

    async fn reply(&self, inbox: &str, payload: Vec<u8>, headers: Frame) -> Result<(), BusError> {
        let message = BusMessage {
            subject: inbox.to_string(),
            payload,
            headers,
            reply_to: None,
        };
        self.deliver(inbox, message).await
    }

    async fn request(
        &self,
        subject: &str,
        inbox: &str,
        payload: Vec<u8>,
        headers: Frame,
    ) -> Result<(), BusError> {
        let message = BusMessage {
            subject: subject.to_string(),
            payload,
            headers,
            reply_to: Some(inbox.to_string()),
        };
        self.deliver(subject, message).await
    }
}

struct InProcessSubscription {
    id: u64,
    pattern: String,
    queue_group: QueueGroup,
    receiver: mpsc::Receiver<BusMessage>,
    registry: Arc<RwLock<Registry>>,
}

#[async_trait]
impl Subscription for InProcessSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    async fn unsubscribe(self: Box<Self>) {
        let mut registry = self.registry.write().await;
        if let Some(group) = registry.patterns.get_mut(&self.pattern) {
            let members = match self.queue_group {
                QueueGroup::Default => &mut group.default_members,
                QueueGroup::None => &mut group.broadcast_members,
            };
            members.retain(|m| m.id != self.id);
            if group.default_members.is_empty() && group.broadcast_members.is_empty() {
                registry.patterns.remove(&self.pattern);
            }
        }
    }
}

/// NATS-style token match: `*` matches exactly one subject token, `>`
/// matches the remainder of the subject and must be the pattern's last
/// token, anything else must match exactly.
fn subject_matches(pattern: &[&str], subject: &[&str]) -> bool {
    let mut p = pattern.iter();
    let mut s = subject.iter();
    loop {
        match (p.next(), s.next()) {
            (Some(&">"), _) => return true,
            // `*` is the path-segment wildcard; `ANY` is the subject
            // codec's method wildcard — both match exactly one token.
            (Some(&"*"), Some(_)) => continue,
            (Some(&"ANY"), Some(_)) => continue,
            (Some(pt), Some(st)) if pt == st => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_tokens_match() {
        assert!(subject_matches(&["svc", "443", "GET", "x"], &["svc", "443", "GET", "x"]));
    }

    #[test]
    fn single_wildcard_matches_one_token() {
        assert!(subject_matches(&["svc", "443", "GET", "*"], &["svc", "443", "GET", "x"]));
        assert!(!subject_matches(&["svc", "443", "GET", "*"], &["svc", "443", "GET", "x", "y"]));
    }

    #[test]
    fn tail_wildcard_matches_remainder() {
        assert!(subject_matches(&["svc", "443", "GET", ">"], &["svc", "443", "GET", "x", "y"]));
    }

    #[test]
    fn any_method_wildcard_matches_every_method_token() {
        assert!(subject_matches(&["svc", "888", "ANY", "ping"], &["svc", "888", "GET", "ping"]));
        assert!(subject_matches(&["svc", "888", "ANY", "ping"], &["svc", "888", "POST", "ping"]));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let bus = InProcessBus::new();
        let mut sub = bus.subscribe("svc.443.GET.ping", QueueGroup::Default).await.unwrap();
        bus.publish("svc.443.GET.ping", b"hi".to_vec(), Frame::new())
            .await
            .unwrap();
        let msg = sub.next().await.unwrap();
        assert_eq!(msg.payload, b"hi");
    }

    #[tokio::test]
    async fn default_queue_group_round_robins() {
        let bus = InProcessBus::new();
        let mut a = bus.subscribe("svc.443.GET.ping", QueueGroup::Default).await.unwrap();
        let mut b = bus.subscribe("svc.443.GET.ping", QueueGroup::Default).await.unwrap();
        bus.publish("svc.443.GET.ping", b"1".to_vec(), Frame::new()).await.unwrap();
        bus.publish("svc.443.GET.ping", b"2".to_vec(), Frame::new()).await.unwrap();

        let first = a.next().await;
        let second = b.next().await;
        assert!(first.is_some());
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn none_queue_group_delivers_to_every_subscriber() {
        let bus = InProcessBus::new();
        let mut a = bus.subscribe("svc.443.ANY.ping", QueueGroup::None).await.unwrap();
        let mut b = bus.subscribe("svc.443.ANY.ping", QueueGroup::None).await.unwrap();
        bus.publish("svc.443.ANY.ping", b"hi".to_vec(), Frame::new())
            .await
            .unwrap();
        assert_eq!(a.next().await.unwrap().payload, b"hi");
        assert_eq!(b.next().await.unwrap().payload, b"hi");
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_member() {
        let bus = InProcessBus::new();
        let sub = bus.subscribe("svc.443.GET.ping", QueueGroup::Default).await.unwrap();
        sub.unsubscribe().await;
        let registry = bus.registry.read().await;
        assert!(!registry.patterns.contains_key("svc.443.GET.ping"));
    }
}
