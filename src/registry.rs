//! Topic registry - thread-safe mapping from topic names to interest.
//!
//! Tracks, per topic, the local subscriptions and the remote endpoints
//! known (via discovery) to be interested in the topic. The registry is
//! shared explicitly between nodes that want in-process delivery; it is
//! never process-global state. Mutations are serialized behind a single
//! write lock, reads run concurrently.
//!
//! The registry holds only `Weak` back-references to subscriptions: the
//! owning node keeps them alive, and lookups skip anything dead or
//! belonging to a node that has begun shutdown.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::subscription::SubscriptionShared;

/// Pseudo-topic for endpoints interested in every topic (static peers
/// configured without a topic list announce no per-topic interest).
pub const WILDCARD_TOPIC: &str = "*";

#[derive(Default)]
struct TopicEntry {
    subscriptions: Vec<Weak<SubscriptionShared>>,
    remote: HashSet<SocketAddr>,
    /// Count of local publications bound to this topic; keeps the entry
    /// alive while a publisher exists even with zero subscribers.
    publishers: usize,
}

impl TopicEntry {
    fn is_garbage(&self) -> bool {
        self.publishers == 0
            && self.remote.is_empty()
            && !self
                .subscriptions
                .iter()
                .any(|weak| weak.upgrade().map(|s| s.is_active()).unwrap_or(false))
    }
}

/// Shared topic registry.
///
/// Cloning is cheap and clones observe the same state.
#[derive(Clone, Default)]
pub struct TopicRegistry {
    topics: Arc<RwLock<HashMap<String, TopicEntry>>>,
    /// Transport endpoints of nodes sharing this registry. Discovery
    /// hears those nodes over the wire too; their endpoints are skipped
    /// when learning remote interest so in-process delivery stays the
    /// only path between them.
    local_endpoints: Arc<RwLock<HashSet<SocketAddr>>>,
}

impl TopicRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local subscription, creating the topic entry lazily.
    pub async fn register_subscription(&self, subscription: &Arc<SubscriptionShared>) {
        let mut topics = self.topics.write().await;
        let entry = topics
            .entry(subscription.topic().to_string())
            .or_default();
        entry.subscriptions.push(Arc::downgrade(subscription));
        debug!(
            topic = %subscription.topic(),
            subscription = %subscription.id(),
            "Registered subscription"
        );
    }

    /// Register a local publication, creating the topic entry lazily.
    pub async fn register_publication(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_default();
        entry.publishers += 1;
    }

    /// Release one publication binding for `topic`. Idempotent once the
    /// count reaches zero.
    pub async fn unregister_publication(&self, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(entry) = topics.get_mut(topic) {
            entry.publishers = entry.publishers.saturating_sub(1);
            if entry.is_garbage() {
                topics.remove(topic);
            }
        }
    }

    /// Current live local subscribers for `topic`.
    ///
    /// Never returns a subscription whose owning node has begun shutdown.
    pub async fn lookup_subscribers(&self, topic: &str) -> Vec<Arc<SubscriptionShared>> {
        let topics = self.topics.read().await;
        match topics.get(topic) {
            Some(entry) => entry
                .subscriptions
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|sub| sub.is_active())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Remote endpoints known to be interested in `topic`, including
    /// wildcard-interested endpoints, deduplicated.
    pub async fn lookup_remote_endpoints(&self, topic: &str) -> Vec<SocketAddr> {
        let topics = self.topics.read().await;
        let mut endpoints: HashSet<SocketAddr> = topics
            .get(topic)
            .map(|entry| entry.remote.iter().copied().collect())
            .unwrap_or_default();
        if topic != WILDCARD_TOPIC {
            if let Some(entry) = topics.get(WILDCARD_TOPIC) {
                endpoints.extend(entry.remote.iter().copied());
            }
        }
        endpoints.into_iter().collect()
    }

    /// Record that `endpoint` subscribes to `topic` (from a discovery
    /// announcement). Creates the topic entry lazily.
    pub async fn add_remote_endpoint(&self, topic: &str, endpoint: SocketAddr) {
        let mut topics = self.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_default();
        if entry.remote.insert(endpoint) {
            debug!(topic = %topic, endpoint = %endpoint, "Learned remote endpoint");
        }
    }

    /// Drop `endpoint` from every topic (peer expired or re-announced a
    /// different interest set), garbage-collecting entries left empty.
    pub async fn remove_endpoint(&self, endpoint: SocketAddr) {
        let mut topics = self.topics.write().await;
        for entry in topics.values_mut() {
            entry.remote.remove(&endpoint);
        }
        topics.retain(|_, entry| !entry.is_garbage());
    }

    /// Mark `endpoint` as belonging to a node sharing this registry.
    pub async fn register_local_endpoint(&self, endpoint: SocketAddr) {
        self.local_endpoints.write().await.insert(endpoint);
    }

    /// Forget a local node's endpoint (called on node cleanup).
    pub async fn unregister_local_endpoint(&self, endpoint: SocketAddr) {
        self.local_endpoints.write().await.remove(&endpoint);
    }

    pub async fn is_local_endpoint(&self, endpoint: SocketAddr) -> bool {
        self.local_endpoints.read().await.contains(&endpoint)
    }

    /// Remove a subscription by id. Idempotent: unknown ids are ignored.
    pub async fn unregister(&self, subscription_id: Uuid) {
        let mut topics = self.topics.write().await;
        for entry in topics.values_mut() {
            entry.subscriptions.retain(|weak| match weak.upgrade() {
                Some(sub) => sub.id() != subscription_id,
                None => false,
            });
        }
        topics.retain(|_, entry| !entry.is_garbage());
    }

    /// Drop topic entries with no live interest and prune dead weak refs.
    ///
    /// Called from the dispatch cycle; also safe to call at any time.
    pub async fn sweep(&self) {
        let mut topics = self.topics.write().await;
        for entry in topics.values_mut() {
            entry
                .subscriptions
                .retain(|weak| weak.upgrade().is_some());
        }
        topics.retain(|_, entry| !entry.is_garbage());
    }

    /// Names of all currently known topics.
    pub async fn topics(&self) -> Vec<String> {
        let topics = self.topics.read().await;
        topics.keys().cloned().collect()
    }

    /// Number of live topic entries.
    pub async fn len(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn make_subscription(topic: &str, shutdown: &Arc<AtomicBool>) -> Arc<SubscriptionShared> {
        Arc::new(SubscriptionShared::new(
            topic,
            "test-node",
            Uuid::new_v4(),
            Box::new(|_| {}),
            None,
            shutdown.clone(),
        ))
    }

    #[tokio::test]
    async fn test_register_and_lookup_subscription() {
        let registry = TopicRegistry::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let sub = make_subscription("A", &shutdown);

        registry.register_subscription(&sub).await;

        let found = registry.lookup_subscribers("A").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), sub.id());
        assert!(registry.lookup_subscribers("B").await.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_skips_shutting_down_node() {
        let registry = TopicRegistry::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let sub = make_subscription("A", &shutdown);
        registry.register_subscription(&sub).await;

        shutdown.store(true, Ordering::Release);

        assert!(registry.lookup_subscribers("A").await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = TopicRegistry::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let sub = make_subscription("A", &shutdown);
        registry.register_subscription(&sub).await;

        registry.unregister(sub.id()).await;
        registry.unregister(sub.id()).await;

        assert!(registry.lookup_subscribers("A").await.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_not_returned() {
        let registry = TopicRegistry::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        {
            let sub = make_subscription("A", &shutdown);
            registry.register_subscription(&sub).await;
        }
        // Arc dropped; the weak back-reference is dead.
        assert!(registry.lookup_subscribers("A").await.is_empty());

        registry.sweep().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remote_endpoints_tracked_per_topic() {
        let registry = TopicRegistry::new();
        let ep: SocketAddr = "127.0.0.1:7100".parse().unwrap();

        registry.add_remote_endpoint("A", ep).await;
        registry.add_remote_endpoint("B", ep).await;

        assert_eq!(registry.lookup_remote_endpoints("A").await, vec![ep]);
        assert_eq!(registry.lookup_remote_endpoints("B").await, vec![ep]);

        registry.remove_endpoint(ep).await;
        assert!(registry.lookup_remote_endpoints("A").await.is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_publication_keeps_topic_alive() {
        let registry = TopicRegistry::new();
        registry.register_publication("A").await;

        registry.sweep().await;
        assert_eq!(registry.len().await, 1);

        registry.unregister_publication("A").await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_wildcard_endpoint_matches_every_topic() {
        let registry = TopicRegistry::new();
        let ep: SocketAddr = "127.0.0.1:7101".parse().unwrap();

        registry.add_remote_endpoint(WILDCARD_TOPIC, ep).await;

        assert_eq!(registry.lookup_remote_endpoints("A").await, vec![ep]);
        assert_eq!(registry.lookup_remote_endpoints("B").await, vec![ep]);
    }

    #[tokio::test]
    async fn test_local_endpoint_tracking() {
        let registry = TopicRegistry::new();
        let ep: SocketAddr = "127.0.0.1:7102".parse().unwrap();

        assert!(!registry.is_local_endpoint(ep).await);
        registry.register_local_endpoint(ep).await;
        assert!(registry.is_local_endpoint(ep).await);
        registry.unregister_local_endpoint(ep).await;
        assert!(!registry.is_local_endpoint(ep).await);
    }

    #[tokio::test]
    async fn test_shared_clones_observe_same_state() {
        let registry = TopicRegistry::new();
        let clone = registry.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let sub = make_subscription("X", &shutdown);

        registry.register_subscription(&sub).await;

        assert_eq!(clone.lookup_subscribers("X").await.len(), 1);
    }
}
