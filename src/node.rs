//! Node lifecycle and the public pub/sub surface.
//!
//! A node moves through a one-way lifecycle:
//!
//! ```text
//! Created -> Initialized -> Running -> ShuttingDown -> Closed
//! ```
//!
//! `init` binds the transport and starts discovery; `subscribe` and
//! `publish` work from `Initialized` onward; the first `spin_once` moves
//! the node to `Running`; `cleanup` tears everything down and is safe to
//! call any number of times. Nodes sharing a [`TopicRegistry`] deliver
//! to each other in process, without touching the transport.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, ConfigError, DiscoveryMode};
use crate::discovery::{
    Discovery, DiscoverySession, LocalInterest, PeerRecord, PeerSeenHandler, StaticDiscovery,
};
use crate::dispatch::{CycleStats, Dispatcher};
use crate::message::Message;
use crate::registry::TopicRegistry;
use crate::subscription::{Subscription, SubscriptionShared};
use crate::transport::Transport;

/// Lifecycle state of a [`Node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Constructed, no resources bound yet.
    Created,
    /// Transport bound, discovery running.
    Initialized,
    /// At least one dispatch cycle has run.
    Running,
    /// Cleanup in progress.
    ShuttingDown,
    /// Cleanup finished; the node is permanently unusable.
    Closed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Created => "created",
            NodeState::Initialized => "initialized",
            NodeState::Running => "running",
            NodeState::ShuttingDown => "shutting-down",
            NodeState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors from node operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("cannot {operation} while node is {state}")]
    InvalidState {
        operation: &'static str,
        state: NodeState,
    },

    #[error("node is already initialized")]
    AlreadyInitialized,

    #[error("no known subscribers for topic '{0}'")]
    UnknownTopic(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("discovery backend unavailable: {0}")]
    DiscoveryUnavailable(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct NodeRuntime {
    transport: Arc<Transport>,
    discovery: Arc<DiscoverySession>,
    dispatcher: Dispatcher,
}

/// A participant in the mesh: publishes, subscribes, and spins.
///
/// All methods take `&self`; a node can be shared behind an `Arc` with
/// one task spinning and others publishing.
pub struct Node {
    name: String,
    instance: Uuid,
    config: Config,
    registry: TopicRegistry,
    state: RwLock<NodeState>,
    runtime: RwLock<Option<NodeRuntime>>,
    /// Keeps subscription state alive; the registry only holds `Weak`.
    subscriptions: StdMutex<Vec<Arc<SubscriptionShared>>>,
    /// Per-topic publish sequence counters.
    publications: Mutex<HashMap<String, u64>>,
    /// Ends `spin`; set by `request_shutdown` and `cleanup`.
    stop: AtomicBool,
    /// Set by `cleanup`; deactivates this node's subscriptions even for
    /// registries shared with still-running nodes.
    shutdown: Arc<AtomicBool>,
}

impl Node {
    /// Create a node in the `Created` state. No resources are bound
    /// until [`Node::init`].
    pub fn new(name: impl Into<String>, config: Config, registry: TopicRegistry) -> Self {
        Self {
            name: name.into(),
            instance: Uuid::new_v4(),
            config,
            registry,
            state: RwLock::new(NodeState::Created),
            runtime: RwLock::new(None),
            subscriptions: StdMutex::new(Vec::new()),
            publications: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Random per-process instance id carried in announcements.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// Transport endpoint, available once initialized.
    pub async fn endpoint(&self) -> Option<SocketAddr> {
        let runtime = self.runtime.read().await;
        runtime.as_ref().map(|r| r.transport.local_addr())
    }

    /// Transport counters `(sent, received, failed)`, available once
    /// initialized.
    pub async fn transport_stats(&self) -> Option<(u64, u64, u64)> {
        let runtime = self.runtime.read().await;
        runtime.as_ref().map(|r| r.transport.stats().snapshot())
    }

    /// Bind the transport and start the discovery session.
    ///
    /// Fails with [`NodeError::AlreadyInitialized`] on a second call and
    /// with [`NodeError::InvalidState`] after shutdown has begun.
    pub async fn init(&self) -> Result<(), NodeError> {
        // Held across the whole init so a concurrent second call waits
        // and then observes `Initialized` instead of binding twice.
        let mut state = self.state.write().await;
        match *state {
            NodeState::Created => {}
            NodeState::Initialized | NodeState::Running => {
                return Err(NodeError::AlreadyInitialized)
            }
            other => {
                return Err(NodeError::InvalidState {
                    operation: "init",
                    state: other,
                })
            }
        }

        let transport = Arc::new(
            Transport::bind(
                self.config.transport.listen_addr()?,
                self.config.transport.connect_timeout(),
                self.config.transport.max_frame_bytes,
            )
            .await?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let interest: Arc<StdRwLock<LocalInterest>> = Arc::default();
        let backend: Box<dyn Discovery> = match self.config.discovery.mode {
            DiscoveryMode::Multicast => {
                #[cfg(feature = "multicast")]
                {
                    Box::new(
                        crate::discovery::MulticastDiscovery::new(
                            &self.config.discovery,
                            self.name.clone(),
                            self.instance,
                            transport.local_addr(),
                            interest.clone(),
                            events_tx.clone(),
                        )
                        .await?,
                    )
                }
                #[cfg(not(feature = "multicast"))]
                {
                    return Err(NodeError::DiscoveryUnavailable(
                        "multicast mode requires the 'multicast' feature",
                    ));
                }
            }
            DiscoveryMode::Static => Box::new(StaticDiscovery::new(
                &self.config.discovery.static_peers,
                &events_tx,
            )?),
        };
        let discovery = Arc::new(DiscoverySession::new(backend, events_rx, interest));
        self.registry
            .register_local_endpoint(transport.local_addr())
            .await;
        discovery.announce().await;

        let endpoint = transport.local_addr();
        let dispatcher = Dispatcher::new(
            self.instance,
            self.registry.clone(),
            transport.clone(),
            discovery.clone(),
        );
        *self.runtime.write().await = Some(NodeRuntime {
            transport,
            discovery,
            dispatcher,
        });
        *state = NodeState::Initialized;
        info!(node = %self.name, endpoint = %endpoint, "Node initialized");
        Ok(())
    }

    /// Error for an operation that found the runtime already torn down,
    /// reporting the state the node is actually in.
    async fn runtime_gone(&self, operation: &'static str) -> NodeError {
        NodeError::InvalidState {
            operation,
            state: *self.state.read().await,
        }
    }

    async fn require_live(&self, operation: &'static str) -> Result<(), NodeError> {
        let state = *self.state.read().await;
        match state {
            NodeState::Initialized | NodeState::Running => Ok(()),
            other => Err(NodeError::InvalidState {
                operation,
                state: other,
            }),
        }
    }

    /// Bind `callback` to `topic`.
    ///
    /// The callback runs inside `spin`/`spin_once` on the spinning task,
    /// never on a background task. Duplicate subscriptions to the same
    /// topic each receive their own copy of every message.
    pub async fn subscribe<F>(&self, topic: &str, callback: F) -> Result<Subscription, NodeError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.require_live("subscribe").await?;
        let runtime = self.runtime.read().await;
        let runtime = match runtime.as_ref() {
            Some(runtime) => runtime,
            None => return Err(self.runtime_gone("subscribe").await),
        };

        let shared = Arc::new(SubscriptionShared::new(
            topic,
            &self.name,
            self.instance,
            Box::new(callback),
            self.config.node.queue_high_water,
            self.shutdown.clone(),
        ));
        self.registry.register_subscription(&shared).await;
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .push(shared.clone());

        // New interest propagates faster than the next heartbeat.
        if runtime.discovery.add_subscribed(topic) {
            runtime.discovery.announce().await;
        }
        info!(node = %self.name, topic = %topic, "Subscribed");
        Ok(Subscription::new(shared))
    }

    /// Cancel one subscription. Idempotent; already-queued messages for
    /// it are discarded.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        subscription.shared().detach();
        self.registry.unregister(subscription.id()).await;
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .retain(|s| s.id() != subscription.id());
        debug!(node = %self.name, topic = %subscription.topic_name(), "Unsubscribed");
    }

    /// Publish `payload` on `topic` with at-most-once delivery.
    ///
    /// Local subscribers (nodes sharing this registry) are enqueued
    /// directly; remote subscribers receive the message over the
    /// transport. Remote delivery failures are logged, never returned.
    /// With no subscribers anywhere this is a silent no-op, unless
    /// `node.strict_topics` is set, which turns it into
    /// [`NodeError::UnknownTopic`].
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), NodeError> {
        self.require_live("publish").await?;
        let runtime = self.runtime.read().await;
        let runtime = match runtime.as_ref() {
            Some(runtime) => runtime,
            None => return Err(self.runtime_gone("publish").await),
        };

        let seq = {
            let mut publications = self.publications.lock().await;
            match publications.entry(topic.to_string()) {
                Entry::Occupied(mut entry) => {
                    let seq = *entry.get() + 1;
                    *entry.get_mut() = seq;
                    seq
                }
                Entry::Vacant(entry) => {
                    entry.insert(0);
                    // First publish on this topic: advertise it.
                    self.registry.register_publication(topic).await;
                    if runtime.discovery.add_published(topic) {
                        runtime.discovery.announce().await;
                    }
                    0
                }
            }
        };

        let local = self.registry.lookup_subscribers(topic).await;
        let remote = self.registry.lookup_remote_endpoints(topic).await;
        if local.is_empty() && remote.is_empty() {
            if self.config.node.strict_topics {
                return Err(NodeError::UnknownTopic(topic.to_string()));
            }
            debug!(node = %self.name, topic = %topic, seq, "No subscribers, dropping message");
            return Ok(());
        }

        let message = Message::new(topic, &self.name, seq, payload);
        for subscription in local {
            subscription.enqueue(message.clone());
        }
        for endpoint in remote {
            match runtime.transport.channel_to(endpoint).await {
                Ok(channel) => {
                    if let Err(err) = runtime.transport.send(&channel, message.clone()) {
                        warn!(
                            node = %self.name,
                            endpoint = %endpoint,
                            topic = %topic,
                            error = %err,
                            "Remote delivery failed"
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        node = %self.name,
                        endpoint = %endpoint,
                        topic = %topic,
                        error = %err,
                        "Remote delivery failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Run one dispatch cycle, waiting up to `node.idle_poll_ms` for
    /// inbound traffic. Moves the node to `Running` on the first call.
    pub async fn spin_once(&self) -> Result<CycleStats, NodeError> {
        self.spin_once_for(self.config.node.idle_poll()).await
    }

    /// Like [`Node::spin_once`] with a caller-chosen idle wait instead
    /// of the configured one. `Duration::ZERO` polls without waiting.
    pub async fn spin_once_for(&self, idle_wait: Duration) -> Result<CycleStats, NodeError> {
        self.require_live("spin").await?;
        {
            let mut state = self.state.write().await;
            if *state == NodeState::Initialized {
                *state = NodeState::Running;
            }
        }
        let runtime = self.runtime.read().await;
        let runtime = match runtime.as_ref() {
            Some(runtime) => runtime,
            None => return Err(self.runtime_gone("spin").await),
        };
        Ok(runtime.dispatcher.cycle(idle_wait).await)
    }

    /// Dispatch until [`Node::request_shutdown`] or [`Node::cleanup`].
    pub async fn spin(&self) -> Result<(), NodeError> {
        info!(node = %self.name, "Spinning");
        while !self.shutdown_requested() {
            match self.spin_once().await {
                Ok(_) => {}
                // A concurrent cleanup may flip the state between the
                // stop-flag check and the cycle; that is an orderly
                // stop, not a caller error.
                Err(NodeError::InvalidState { .. }) if self.shutdown_requested() => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Ask a spinning task to stop at the next cycle boundary. The node
    /// stays usable; only `spin` returns.
    pub fn request_shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Release every resource the node holds. Idempotent; concurrent and
    /// repeated calls are safe. After cleanup the node is `Closed` and
    /// every operation fails with [`NodeError::InvalidState`].
    pub async fn cleanup(&self) {
        // Flags go first: a spinning task must see the stop request no
        // later than the state change it would otherwise trip over.
        self.stop.store(true, Ordering::Release);
        self.shutdown.store(true, Ordering::Release);
        {
            let mut state = self.state.write().await;
            if matches!(*state, NodeState::ShuttingDown | NodeState::Closed) {
                return;
            }
            *state = NodeState::ShuttingDown;
        }

        let runtime = self.runtime.write().await.take();
        if let Some(runtime) = runtime {
            runtime.discovery.shutdown().await;
            self.registry
                .unregister_local_endpoint(runtime.transport.local_addr())
                .await;
            runtime.transport.shutdown().await;
        }

        let subscriptions: Vec<Arc<SubscriptionShared>> = {
            let mut held = self
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            held.drain(..).collect()
        };
        for subscription in subscriptions {
            subscription.detach();
            self.registry.unregister(subscription.id()).await;
        }

        let published: Vec<String> = {
            let mut publications = self.publications.lock().await;
            publications.drain().map(|(topic, _)| topic).collect()
        };
        for topic in published {
            self.registry.unregister_publication(&topic).await;
        }

        *self.state.write().await = NodeState::Closed;
        info!(node = %self.name, "Node closed");
    }

    /// Register a handler for newly seen peers that publish a topic this
    /// node subscribes to. Runs inside the dispatch cycle.
    pub async fn on_peer_seen<F>(&self, handler: F) -> Result<(), NodeError>
    where
        F: Fn(&PeerRecord) + Send + Sync + 'static,
    {
        self.require_live("register peer handler").await?;
        let runtime = self.runtime.read().await;
        if let Some(runtime) = runtime.as_ref() {
            let handler: PeerSeenHandler = Box::new(handler);
            runtime.discovery.on_peer_seen(handler).await;
        }
        Ok(())
    }

    /// Snapshot of currently known peers.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        let runtime = self.runtime.read().await;
        match runtime.as_ref() {
            Some(runtime) => runtime.discovery.peers().await,
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}
