//! The dispatch cycle.
//!
//! All subscriber callbacks run here, on the task that calls `spin` or
//! `spin_once`, never on a transport or discovery task. One cycle:
//!
//! 1. apply pending peer events to the topic registry
//! 2. surface delivery failures recorded by the transport
//! 3. route inbound wire messages onto subscription queues
//! 4. drain every local subscription queue, invoking callbacks
//!
//! A panicking callback is caught, logged, and counted; it never takes
//! down the loop or skips delivery to other subscriptions.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::discovery::DiscoverySession;
use crate::message::Message;
use crate::registry::TopicRegistry;
use crate::subscription::SubscriptionShared;
use crate::transport::Transport;

/// Counters from one dispatch cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    /// Peer events applied to the registry.
    pub peer_events: usize,
    /// Wire messages routed to subscription queues.
    pub inbound: usize,
    /// Callback invocations that returned normally.
    pub delivered: usize,
    /// Callback invocations that panicked.
    pub callback_panics: usize,
    /// Remote delivery failures surfaced this cycle.
    pub delivery_failures: usize,
}

/// Drives dispatch cycles for one node.
///
/// Only subscriptions owned by this node (matched by instance id) are
/// drained here; a shared registry never causes one node's spin to run
/// another node's callbacks.
pub(crate) struct Dispatcher {
    owner: Uuid,
    registry: TopicRegistry,
    transport: Arc<Transport>,
    discovery: Arc<DiscoverySession>,
}

impl Dispatcher {
    pub(crate) fn new(
        owner: Uuid,
        registry: TopicRegistry,
        transport: Arc<Transport>,
        discovery: Arc<DiscoverySession>,
    ) -> Self {
        Self {
            owner,
            registry,
            transport,
            discovery,
        }
    }

    /// Run one cycle, waiting up to `idle_wait` for inbound traffic when
    /// nothing is immediately available.
    pub(crate) async fn cycle(&self, idle_wait: Duration) -> CycleStats {
        let mut stats = CycleStats::default();

        stats.peer_events = self.discovery.apply_events(&self.registry).await;

        for failure in self.transport.take_failures().await {
            stats.delivery_failures += 1;
            warn!(
                endpoint = %failure.endpoint,
                topic = %failure.topic,
                reason = %failure.reason,
                "Remote delivery failed"
            );
        }

        // Block for the first inbound message only; once traffic is
        // flowing, or with local messages already queued, drain whatever
        // arrived without waiting.
        let mut inbound = self.transport.poll().await;
        if inbound.is_empty() && !idle_wait.is_zero() && !self.has_pending_local().await {
            if let Some(first) = self.transport.wait_inbound(idle_wait).await {
                inbound.push(first);
                inbound.extend(self.transport.poll().await);
            }
        }
        for item in inbound {
            stats.inbound += 1;
            self.route(item.message).await;
        }

        for topic in self.registry.topics().await {
            for subscription in self.owned_subscribers(&topic).await {
                for message in subscription.drain() {
                    self.deliver(&subscription, &message, &mut stats);
                }
            }
        }

        stats
    }

    async fn owned_subscribers(&self, topic: &str) -> Vec<Arc<SubscriptionShared>> {
        self.registry
            .lookup_subscribers(topic)
            .await
            .into_iter()
            .filter(|subscription| subscription.owner() == self.owner)
            .collect()
    }

    async fn has_pending_local(&self) -> bool {
        for topic in self.registry.topics().await {
            for subscription in self.owned_subscribers(&topic).await {
                if subscription.pending() > 0 {
                    return true;
                }
            }
        }
        false
    }

    /// Route a wire message onto this node's subscription queues. Other
    /// nodes sharing the registry receive their own copy over their own
    /// endpoint; enqueueing for them here would deliver duplicates.
    async fn route(&self, message: Message) {
        let subscribers = self.owned_subscribers(&message.topic).await;
        if subscribers.is_empty() {
            debug!(topic = %message.topic, "Inbound message has no local subscribers");
            return;
        }
        for subscription in subscribers {
            subscription.enqueue(message.clone());
        }
    }

    fn deliver(
        &self,
        subscription: &Arc<SubscriptionShared>,
        message: &Message,
        stats: &mut CycleStats,
    ) {
        match catch_unwind(AssertUnwindSafe(|| subscription.invoke(message))) {
            Ok(()) => stats.delivered += 1,
            Err(panic) => {
                stats.callback_panics += 1;
                error!(
                    topic = %subscription.topic(),
                    subscription = %subscription.id(),
                    panic = %panic_text(&panic),
                    "Subscriber callback panicked"
                );
            }
        }
    }
}

fn panic_text(panic: &Box<dyn Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "<opaque panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use crate::message::DEFAULT_MAX_FRAME_BYTES;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::RwLock as StdRwLock;
    use tokio::sync::mpsc;

    async fn dispatcher(owner: Uuid, registry: TopicRegistry) -> Dispatcher {
        let transport = Arc::new(
            Transport::bind(
                "127.0.0.1:0".parse().unwrap(),
                Duration::from_millis(500),
                DEFAULT_MAX_FRAME_BYTES,
            )
            .await
            .unwrap(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let session = DiscoverySession::new(
            Box::new(StaticDiscovery::new(&[], &tx).unwrap()),
            rx,
            Arc::new(StdRwLock::new(Default::default())),
        );
        Dispatcher::new(owner, registry, transport, Arc::new(session))
    }

    fn subscription(
        topic: &str,
        owner: Uuid,
        shutdown: &Arc<AtomicBool>,
        callback: crate::subscription::SubscriberCallback,
    ) -> Arc<SubscriptionShared> {
        Arc::new(SubscriptionShared::new(
            topic,
            "test-node",
            owner,
            callback,
            None,
            shutdown.clone(),
        ))
    }

    fn msg(topic: &str, seq: u64) -> Message {
        Message::new(topic, "pub", seq, Bytes::from_static(b"payload"))
    }

    #[tokio::test]
    async fn test_cycle_drains_queued_messages_in_order() {
        let registry = TopicRegistry::new();
        let owner = Uuid::new_v4();
        let shutdown = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(StdRwLock::new(Vec::new()));
        let sink = seen.clone();
        let sub = subscription(
            "A",
            owner,
            &shutdown,
            Box::new(move |m| sink.write().unwrap().push(m.seq)),
        );
        registry.register_subscription(&sub).await;
        sub.enqueue(msg("A", 1));
        sub.enqueue(msg("A", 2));

        let dispatcher = dispatcher(owner, registry).await;
        let stats = dispatcher.cycle(Duration::ZERO).await;

        assert_eq!(stats.delivered, 2);
        assert_eq!(*seen.read().unwrap(), vec![1, 2]);
        assert_eq!(sub.pending(), 0);
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stop_the_cycle() {
        let registry = TopicRegistry::new();
        let owner = Uuid::new_v4();
        let shutdown = Arc::new(AtomicBool::new(false));

        let bad = subscription("A", owner, &shutdown, Box::new(|_| panic!("boom")));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let good = subscription(
            "A",
            owner,
            &shutdown,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.register_subscription(&bad).await;
        registry.register_subscription(&good).await;
        bad.enqueue(msg("A", 1));
        good.enqueue(msg("A", 1));

        let dispatcher = dispatcher(owner, registry).await;
        let stats = dispatcher.cycle(Duration::ZERO).await;

        assert_eq!(stats.callback_panics, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_route_fans_out_to_all_topic_subscribers() {
        let registry = TopicRegistry::new();
        let owner = Uuid::new_v4();
        let shutdown = Arc::new(AtomicBool::new(false));
        let count = Arc::new(AtomicUsize::new(0));
        let subs: Vec<_> = (0..3)
            .map(|_| {
                let counter = count.clone();
                subscription(
                    "A",
                    owner,
                    &shutdown,
                    Box::new(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )
            })
            .collect();
        for sub in &subs {
            registry.register_subscription(sub).await;
        }

        let dispatcher = dispatcher(owner, registry).await;
        dispatcher.route(msg("A", 7)).await;
        let stats = dispatcher.cycle(Duration::ZERO).await;

        assert_eq!(stats.delivered, 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_foreign_subscriptions_are_left_alone() {
        let registry = TopicRegistry::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let foreign = subscription("A", Uuid::new_v4(), &shutdown, Box::new(|_| {}));
        registry.register_subscription(&foreign).await;
        foreign.enqueue(msg("A", 1));

        let dispatcher = dispatcher(Uuid::new_v4(), registry).await;
        let stats = dispatcher.cycle(Duration::ZERO).await;

        // Another node's spin owns that queue.
        assert_eq!(stats.delivered, 0);
        assert_eq!(foreign.pending(), 1);
    }

    #[tokio::test]
    async fn test_idle_cycle_reports_nothing() {
        let dispatcher = dispatcher(Uuid::new_v4(), TopicRegistry::new()).await;

        let stats = dispatcher.cycle(Duration::from_millis(10)).await;

        assert_eq!(stats.inbound, 0);
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.callback_panics, 0);
    }
}
