//! Subscription handles and their inbound queues.
//!
//! A subscription binds one topic to one callback on behalf of one node.
//! Messages land in a FIFO queue bounded by an optional high-water mark;
//! when the queue is full the oldest pending message is dropped so the
//! newest data is kept (slow subscribers lose history, not liveness).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;
use uuid::Uuid;

use crate::message::Message;

/// Callback invoked for each delivered message.
///
/// Runs synchronously inside the dispatch loop; long-blocking callbacks
/// delay delivery to every other subscription on the same node.
pub type SubscriberCallback = Box<dyn Fn(&Message) + Send + Sync>;

/// Shared state behind a [`Subscription`] handle.
///
/// The topic registry holds only `Weak` references to this; the owning
/// node keeps it alive.
pub struct SubscriptionShared {
    id: Uuid,
    topic: String,
    node: String,
    /// Instance id of the owning node; callbacks only run from that
    /// node's dispatch cycle.
    owner: Uuid,
    callback: SubscriberCallback,
    queue: Mutex<VecDeque<Message>>,
    high_water: Option<usize>,
    dropped: AtomicU64,
    detached: AtomicBool,
    /// Set when the owning node begins shutdown; lookups skip the
    /// subscription from that point on.
    node_shutdown: Arc<AtomicBool>,
}

impl SubscriptionShared {
    pub(crate) fn new(
        topic: impl Into<String>,
        node: impl Into<String>,
        owner: Uuid,
        callback: SubscriberCallback,
        high_water: Option<usize>,
        node_shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            node: node.into(),
            owner,
            callback,
            queue: Mutex::new(VecDeque::new()),
            high_water,
            dropped: AtomicU64::new(0),
            detached: AtomicBool::new(false),
            node_shutdown,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Instance id of the owning node.
    pub fn owner(&self) -> Uuid {
        self.owner
    }

    /// True while the subscription may still receive messages.
    pub fn is_active(&self) -> bool {
        !self.detached.load(Ordering::Acquire) && !self.node_shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Queue a message for the next dispatch cycle.
    ///
    /// Applies the drop-oldest overflow policy when a high-water mark is
    /// configured. Enqueueing on an inactive subscription is a no-op.
    pub(crate) fn enqueue(&self, message: Message) {
        if !self.is_active() {
            return;
        }
        let mut queue = self.queue.lock().expect("subscription queue poisoned");
        if let Some(high_water) = self.high_water {
            while queue.len() >= high_water {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    topic = %self.topic,
                    node = %self.node,
                    dropped_total = dropped,
                    "Subscription queue full, dropping oldest message"
                );
            }
        }
        queue.push_back(message);
    }

    /// Take everything currently pending, preserving arrival order.
    pub(crate) fn drain(&self) -> Vec<Message> {
        let mut queue = self.queue.lock().expect("subscription queue poisoned");
        queue.drain(..).collect()
    }

    pub(crate) fn invoke(&self, message: &Message) {
        (self.callback)(message);
    }

    /// Number of messages waiting for dispatch.
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("subscription queue poisoned").len()
    }

    /// Messages discarded by the overflow policy since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SubscriptionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionShared")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("node", &self.node)
            .field("high_water", &self.high_water)
            .finish_non_exhaustive()
    }
}

/// Public handle to a registered subscription.
///
/// Returned by `Node::subscribe`; dropping the handle does not cancel the
/// subscription (the node owns it until unsubscribe or cleanup).
#[derive(Debug, Clone)]
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub(crate) fn new(shared: Arc<SubscriptionShared>) -> Self {
        Self { shared }
    }

    /// Name of the subscribed topic.
    pub fn topic_name(&self) -> &str {
        self.shared.topic()
    }

    pub fn id(&self) -> Uuid {
        self.shared.id()
    }

    /// Messages waiting for the next dispatch cycle.
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    /// Messages lost to the drop-oldest overflow policy.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped()
    }

    pub(crate) fn shared(&self) -> &Arc<SubscriptionShared> {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn shared(high_water: Option<usize>) -> SubscriptionShared {
        SubscriptionShared::new(
            "X",
            "test-node",
            Uuid::new_v4(),
            Box::new(|_| {}),
            high_water,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn msg(seq: u64) -> Message {
        Message::new("X", "pub", seq, Bytes::from_static(b"m"))
    }

    #[test]
    fn test_enqueue_and_drain_preserves_order() {
        let sub = shared(None);
        sub.enqueue(msg(1));
        sub.enqueue(msg(2));
        sub.enqueue(msg(3));

        let drained = sub.drain();
        let seqs: Vec<u64> = drained.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(sub.pending(), 0);
    }

    #[test]
    fn test_high_water_drops_oldest() {
        let sub = shared(Some(2));
        sub.enqueue(msg(1));
        sub.enqueue(msg(2));
        sub.enqueue(msg(3));

        let seqs: Vec<u64> = sub.drain().iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(sub.dropped(), 1);
    }

    #[test]
    fn test_unbounded_by_default() {
        let sub = shared(None);
        for seq in 0..1000 {
            sub.enqueue(msg(seq));
        }
        assert_eq!(sub.pending(), 1000);
        assert_eq!(sub.dropped(), 0);
    }

    #[test]
    fn test_detached_subscription_rejects_messages() {
        let sub = shared(None);
        sub.detach();
        sub.enqueue(msg(1));
        assert_eq!(sub.pending(), 0);
        assert!(!sub.is_active());
    }

    #[test]
    fn test_node_shutdown_deactivates() {
        let flag = Arc::new(AtomicBool::new(false));
        let sub = SubscriptionShared::new(
            "X",
            "test-node",
            Uuid::new_v4(),
            Box::new(|_| {}),
            None,
            flag.clone(),
        );
        assert!(sub.is_active());

        flag.store(true, Ordering::Release);
        assert!(!sub.is_active());
        sub.enqueue(msg(1));
        assert_eq!(sub.pending(), 0);
    }
}
