//! Broker-free peer discovery.
//!
//! Nodes announce their identity, transport endpoint, and topic interest
//! over a well-known UDP multicast group at a fixed heartbeat interval.
//! Received announcements feed a peer table with a per-record liveness
//! state machine:
//!
//! ```text
//! Unknown -> Active (first announcement)
//!         -> Stale  (no heartbeat within the liveness timeout)
//!         -> Expired (removed after the grace period)
//! ```
//!
//! Discovery is best-effort: missed heartbeats only move state, they
//! never raise errors, and nothing here blocks publish or subscribe. A
//! static implementation (peers listed in configuration) is available for
//! networks without multicast, behind the same trait.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
#[cfg(feature = "multicast")]
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
#[cfg(feature = "multicast")]
use tokio::task::JoinHandle;
#[cfg(feature = "multicast")]
use tracing::warn;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{DiscoveryConfig, StaticPeer};
use crate::registry::TopicRegistry;

/// A presence announcement datagram (JSON-encoded on the wire).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    /// Node identity, used verbatim from the node constructor.
    pub node: String,
    /// Random per-process instance id; distinguishes a restarted node
    /// from a duplicate of the same name.
    pub instance: Uuid,
    /// Transport endpoint peers should connect to.
    pub endpoint: SocketAddr,
    /// Topics this node publishes.
    pub published: Vec<String>,
    /// Topics this node subscribes to.
    pub subscribed: Vec<String>,
    /// Heartbeat sequence number, increasing per announcement.
    pub heartbeat: u64,
}

/// Liveness state of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Heartbeats arriving on time.
    Active,
    /// No heartbeat within the liveness timeout; still routable.
    Stale,
}

/// Cached knowledge about a remote node.
///
/// Purely advisory: losing a record never corrupts local state, only
/// delivery reach.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub identity: String,
    pub instance: Uuid,
    pub endpoint: SocketAddr,
    pub published: Vec<String>,
    pub subscribed: Vec<String>,
    pub state: PeerState,
    pub last_seen: Instant,
}

/// Change in the peer set, consumed by the dispatch cycle.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// New or refreshed peer.
    Seen(PeerRecord),
    /// Peer removed after the grace period (or replaced by a restart).
    Expired {
        identity: String,
        endpoint: SocketAddr,
    },
}

/// Handler invoked when a new or refreshed peer publishing a locally
/// subscribed topic appears. Runs inside the dispatch cycle.
pub type PeerSeenHandler = Box<dyn Fn(&PeerRecord) + Send + Sync>;

/// Topics this node currently publishes and subscribes to; shared with
/// the announcer task so heartbeats always carry the current interest.
#[derive(Debug, Default)]
pub struct LocalInterest {
    pub published: BTreeSet<String>,
    pub subscribed: BTreeSet<String>,
}

/// Peer table with the liveness state machine.
///
/// Kept free of socket concerns so the state transitions are directly
/// testable; the multicast listener and sweeper drive it.
pub struct PeerTable {
    records: HashMap<Uuid, PeerRecord>,
    liveness_timeout: std::time::Duration,
    grace_period: std::time::Duration,
}

impl PeerTable {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            records: HashMap::new(),
            liveness_timeout: config.liveness_timeout(),
            grace_period: config.grace_period(),
        }
    }

    /// Apply one received announcement.
    pub fn observe(&mut self, ann: Announcement, now: Instant) -> Vec<PeerEvent> {
        let mut events = Vec::new();

        // A new instance of an already-known identity replaces the old
        // record immediately instead of waiting for it to expire.
        let replaced: Vec<Uuid> = self
            .records
            .values()
            .filter(|r| r.identity == ann.node && r.instance != ann.instance)
            .map(|r| r.instance)
            .collect();
        for instance in replaced {
            if let Some(old) = self.records.remove(&instance) {
                info!(
                    peer = %old.identity,
                    endpoint = %old.endpoint,
                    "Peer restarted, replacing record"
                );
                events.push(PeerEvent::Expired {
                    identity: old.identity,
                    endpoint: old.endpoint,
                });
            }
        }

        let record = PeerRecord {
            identity: ann.node,
            instance: ann.instance,
            endpoint: ann.endpoint,
            published: ann.published,
            subscribed: ann.subscribed,
            state: PeerState::Active,
            last_seen: now,
        };
        let is_new = !self.records.contains_key(&ann.instance);
        if is_new {
            info!(peer = %record.identity, endpoint = %record.endpoint, "Peer discovered");
        }
        self.records.insert(ann.instance, record.clone());
        events.push(PeerEvent::Seen(record));
        events
    }

    /// Advance the liveness state machine to `now`.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerEvent> {
        let mut events = Vec::new();

        for record in self.records.values_mut() {
            if record.state == PeerState::Active
                && now.duration_since(record.last_seen) > self.liveness_timeout
            {
                record.state = PeerState::Stale;
                debug!(peer = %record.identity, "Peer went stale");
            }
        }

        let expiry = self.liveness_timeout + self.grace_period;
        let expired: Vec<Uuid> = self
            .records
            .values()
            .filter(|r| r.state == PeerState::Stale && now.duration_since(r.last_seen) > expiry)
            .map(|r| r.instance)
            .collect();
        for instance in expired {
            if let Some(record) = self.records.remove(&instance) {
                info!(peer = %record.identity, endpoint = %record.endpoint, "Peer expired");
                events.push(PeerEvent::Expired {
                    identity: record.identity,
                    endpoint: record.endpoint,
                });
            }
        }
        events
    }

    pub fn records(&self) -> Vec<PeerRecord> {
        self.records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Interface to a discovery backend.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Broadcast presence now (also happens on the heartbeat interval).
    /// Best-effort: failures are logged, never returned.
    async fn announce(&self);

    /// Snapshot of the current peer set.
    async fn peers(&self) -> Vec<PeerRecord>;

    /// Stop background tasks.
    async fn shutdown(&self);
}

/// UDP multicast discovery backend.
#[cfg(feature = "multicast")]
pub struct MulticastDiscovery {
    socket: Arc<tokio::net::UdpSocket>,
    group_addr: SocketAddr,
    identity: String,
    instance: Uuid,
    endpoint: SocketAddr,
    interest: Arc<StdRwLock<LocalInterest>>,
    /// Shared with the announcer task so explicit and periodic
    /// announcements draw from one increasing sequence.
    heartbeat_seq: Arc<AtomicU64>,
    table: Arc<Mutex<PeerTable>>,
    tasks: Vec<JoinHandle<()>>,
}

#[cfg(feature = "multicast")]
impl MulticastDiscovery {
    /// Bind the discovery socket, join the group, and start the
    /// listener, announcer, and sweeper tasks.
    pub async fn new(
        config: &DiscoveryConfig,
        identity: String,
        instance: Uuid,
        endpoint: SocketAddr,
        interest: Arc<StdRwLock<LocalInterest>>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> std::io::Result<Self> {
        let group_addr = config
            .group_addr()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        let group = match group_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "discovery group must be an IPv4 multicast address",
                ))
            }
        };
        let socket = Arc::new(multicast_socket(group, config.port)?);
        info!(group = %group_addr, "Discovery joined multicast group");

        let table = Arc::new(Mutex::new(PeerTable::new(config)));
        let mut tasks = Vec::new();

        // Listener: parse announcements and feed the peer table.
        {
            let socket = socket.clone();
            let table = table.clone();
            let events_tx = events_tx.clone();
            let own_instance = instance;
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let (len, from) = match socket.recv_from(&mut buf).await {
                        Ok(received) => received,
                        Err(err) => {
                            warn!(error = %err, "Discovery receive failed");
                            continue;
                        }
                    };
                    let mut ann: Announcement = match serde_json::from_slice(&buf[..len]) {
                        Ok(ann) => ann,
                        Err(err) => {
                            debug!(from = %from, error = %err, "Ignoring malformed announcement");
                            continue;
                        }
                    };
                    if ann.instance == own_instance {
                        continue;
                    }
                    // A node listening on 0.0.0.0 announces an
                    // unspecified IP; the datagram source is routable.
                    if ann.endpoint.ip().is_unspecified() {
                        ann.endpoint.set_ip(from.ip());
                    }
                    let events = table.lock().await.observe(ann, Instant::now());
                    for event in events {
                        let _ = events_tx.send(event);
                    }
                }
            }));
        }

        // Sweeper: advance the liveness state machine.
        {
            let table = table.clone();
            let events_tx = events_tx.clone();
            let period = config.liveness_timeout() / 4;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period.max(std::time::Duration::from_millis(10)));
                loop {
                    ticker.tick().await;
                    let events = table.lock().await.sweep(Instant::now());
                    for event in events {
                        let _ = events_tx.send(event);
                    }
                }
            }));
        }

        let heartbeat_seq = Arc::new(AtomicU64::new(0));

        // Announcer: heartbeat with a little jitter so co-hosted nodes
        // do not synchronize their bursts.
        {
            use rand::Rng;

            let socket = socket.clone();
            let identity = identity.clone();
            let interest = interest.clone();
            let heartbeat = config.heartbeat_interval();
            let seq = heartbeat_seq.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let jitter_max = (heartbeat.as_millis() as u64 / 10).max(1);
                    let jitter = rand::rng().random_range(0..jitter_max);
                    tokio::time::sleep(heartbeat + std::time::Duration::from_millis(jitter)).await;
                    let ann = build_announcement(
                        &identity,
                        instance,
                        endpoint,
                        &interest,
                        seq.fetch_add(1, Ordering::Relaxed),
                    );
                    send_announcement(&socket, group_addr, &ann).await;
                }
            }));
        }

        Ok(Self {
            socket,
            group_addr,
            identity,
            instance,
            endpoint,
            interest,
            heartbeat_seq,
            table,
            tasks,
        })
    }
}

#[cfg(feature = "multicast")]
fn build_announcement(
    identity: &str,
    instance: Uuid,
    endpoint: SocketAddr,
    interest: &Arc<StdRwLock<LocalInterest>>,
    heartbeat: u64,
) -> Announcement {
    let interest = interest.read().expect("interest lock poisoned");
    Announcement {
        node: identity.to_string(),
        instance,
        endpoint,
        published: interest.published.iter().cloned().collect(),
        subscribed: interest.subscribed.iter().cloned().collect(),
        heartbeat,
    }
}

#[cfg(feature = "multicast")]
async fn send_announcement(
    socket: &tokio::net::UdpSocket,
    group_addr: SocketAddr,
    ann: &Announcement,
) {
    let payload = match serde_json::to_vec(ann) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "Failed to encode announcement");
            return;
        }
    };
    if let Err(err) = socket.send_to(&payload, group_addr).await {
        // Best-effort by contract: log and move on.
        warn!(error = %err, "Failed to send announcement");
    }
}

#[cfg(feature = "multicast")]
#[async_trait]
impl Discovery for MulticastDiscovery {
    async fn announce(&self) {
        let ann = build_announcement(
            &self.identity,
            self.instance,
            self.endpoint,
            &self.interest,
            self.heartbeat_seq.fetch_add(1, Ordering::Relaxed),
        );
        send_announcement(&self.socket, self.group_addr, &ann).await;
    }

    async fn peers(&self) -> Vec<PeerRecord> {
        self.table.lock().await.records()
    }

    async fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Build a reusable multicast socket: several nodes on one host all bind
/// the discovery port and join the group.
#[cfg(feature = "multicast")]
fn multicast_socket(
    group: std::net::Ipv4Addr,
    port: u16,
) -> std::io::Result<tokio::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&group, &std::net::Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    tokio::net::UdpSocket::from_std(socket.into())
}

/// Static discovery: the peer set comes from configuration and never
/// changes. Used where multicast is unavailable (or in tests).
pub struct StaticDiscovery {
    records: Vec<PeerRecord>,
}

impl StaticDiscovery {
    pub fn new(
        peers: &[StaticPeer],
        events_tx: &mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, crate::config::ConfigError> {
        let mut records = Vec::with_capacity(peers.len());
        for peer in peers {
            let record = PeerRecord {
                identity: peer.name.clone(),
                instance: Uuid::new_v4(),
                endpoint: peer.endpoint_addr()?,
                published: Vec::new(),
                subscribed: peer.topics.clone(),
                state: PeerState::Active,
                last_seen: Instant::now(),
            };
            let _ = events_tx.send(PeerEvent::Seen(record.clone()));
            records.push(record);
        }
        Ok(Self { records })
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn announce(&self) {
        // Nothing to announce: static peers are configured, not learned.
    }

    async fn peers(&self) -> Vec<PeerRecord> {
        self.records.clone()
    }

    async fn shutdown(&self) {}
}

/// A node's discovery session: one backend plus the event stream and
/// peer-seen handlers, applied to the topic registry at dispatch time so
/// no handler ever runs on a background task.
pub struct DiscoverySession {
    inner: Box<dyn Discovery>,
    events_rx: Mutex<mpsc::UnboundedReceiver<PeerEvent>>,
    handlers: RwLock<Vec<PeerSeenHandler>>,
    interest: Arc<StdRwLock<LocalInterest>>,
}

impl DiscoverySession {
    pub fn new(
        inner: Box<dyn Discovery>,
        events_rx: mpsc::UnboundedReceiver<PeerEvent>,
        interest: Arc<StdRwLock<LocalInterest>>,
    ) -> Self {
        Self {
            inner,
            events_rx: Mutex::new(events_rx),
            handlers: RwLock::new(Vec::new()),
            interest,
        }
    }

    /// Broadcast presence immediately (subscribe/publish call this so
    /// interest changes propagate faster than the next heartbeat).
    pub async fn announce(&self) {
        self.inner.announce().await;
    }

    /// Register a handler for new/refreshed peers that publish a locally
    /// subscribed topic.
    pub async fn on_peer_seen(&self, handler: PeerSeenHandler) {
        self.handlers.write().await.push(handler);
    }

    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.inner.peers().await
    }

    /// Record a new local subscription and return whether it changed.
    pub fn add_subscribed(&self, topic: &str) -> bool {
        self.interest
            .write()
            .expect("interest lock poisoned")
            .subscribed
            .insert(topic.to_string())
    }

    /// Record a new local publication and return whether it changed.
    pub fn add_published(&self, topic: &str) -> bool {
        self.interest
            .write()
            .expect("interest lock poisoned")
            .published
            .insert(topic.to_string())
    }

    /// Drain pending peer events into the registry and fire matching
    /// peer-seen handlers. Called from the dispatch cycle.
    pub async fn apply_events(&self, registry: &TopicRegistry) -> usize {
        let events: Vec<PeerEvent> = {
            let mut rx = self.events_rx.lock().await;
            let mut drained = Vec::new();
            while let Ok(event) = rx.try_recv() {
                drained.push(event);
            }
            drained
        };
        let applied = events.len();

        for event in events {
            match event {
                PeerEvent::Seen(record) => {
                    // Re-derive the endpoint's interest set from scratch
                    // so dropped subscriptions disappear too.
                    registry.remove_endpoint(record.endpoint).await;
                    if !registry.is_local_endpoint(record.endpoint).await {
                        if record.subscribed.is_empty() {
                            registry
                                .add_remote_endpoint(crate::registry::WILDCARD_TOPIC, record.endpoint)
                                .await;
                        } else {
                            for topic in &record.subscribed {
                                registry.add_remote_endpoint(topic, record.endpoint).await;
                            }
                        }
                    }

                    if self.matches_local_subscription(&record) {
                        let handlers = self.handlers.read().await;
                        for handler in handlers.iter() {
                            handler(&record);
                        }
                    }
                }
                PeerEvent::Expired { identity, endpoint } => {
                    debug!(peer = %identity, endpoint = %endpoint, "Removing expired peer routes");
                    registry.remove_endpoint(endpoint).await;
                }
            }
        }
        applied
    }

    fn matches_local_subscription(&self, record: &PeerRecord) -> bool {
        let interest = self.interest.read().expect("interest lock poisoned");
        record
            .published
            .iter()
            .any(|topic| interest.subscribed.contains(topic))
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}
