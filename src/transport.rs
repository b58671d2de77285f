//! TCP transport layer.
//!
//! Point-to-point channels between nodes. Socket I/O runs on background
//! tasks so publish never blocks on the network, but completed inbound
//! events are handed to the caller only through [`Transport::poll`] /
//! [`Transport::wait_inbound`] - no callback ever runs on an I/O task.
//!
//! Delivery is at-most-once: there is no acknowledgement or internal
//! retry, and a message lost to a closing channel surfaces as a
//! [`DeliveryFailure`] event rather than an error at the publish call
//! site. Messages sent on one channel are delivered in send order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::{CodecError, Message};

/// Failure establishing a channel to a peer.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    Timeout {
        endpoint: SocketAddr,
        timeout: Duration,
    },

    #[error("connect to {endpoint} failed: {source}")]
    Io {
        endpoint: SocketAddr,
        source: std::io::Error,
    },
}

/// Failure on an established channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel to {0} is closed")]
    ChannelClosed(SocketAddr),

    #[error("encode failed: {0}")]
    Codec(#[from] CodecError),
}

/// A message received from a peer, ready for dispatch.
#[derive(Debug)]
pub struct Inbound {
    /// Address the message arrived from.
    pub peer: SocketAddr,
    pub message: Message,
}

/// A message that could not be delivered.
///
/// Surfaced as an event and drained via [`Transport::take_failures`];
/// never raised as an error at an unrelated call site.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub endpoint: SocketAddr,
    pub topic: String,
    pub reason: String,
}

/// Send/receive/failure counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    /// Messages handed to a channel for transmission.
    pub sent: AtomicU64,
    /// Messages decoded off the wire.
    pub received: AtomicU64,
    /// Messages lost to write failures or closed channels.
    pub failed: AtomicU64,
}

impl TransportStats {
    /// Get a snapshot of current counters as (sent, received, failed).
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

/// Handle to an outbound channel.
///
/// Cheap to clone; all clones feed the same writer task.
#[derive(Debug, Clone)]
pub struct Channel {
    endpoint: SocketAddr,
    tx: mpsc::UnboundedSender<Message>,
}

impl Channel {
    /// Remote endpoint this channel writes to.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// TCP transport bound to a local listen address.
pub struct Transport {
    local_addr: SocketAddr,
    connect_timeout: Duration,
    max_frame: usize,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    failures_rx: Mutex<mpsc::UnboundedReceiver<DeliveryFailure>>,
    failures_tx: mpsc::UnboundedSender<DeliveryFailure>,
    channels: RwLock<HashMap<SocketAddr, Channel>>,
    stats: Arc<TransportStats>,
    accept_task: JoinHandle<()>,
}

impl Transport {
    /// Bind the listener and start accepting inbound channels.
    pub async fn bind(
        addr: SocketAddr,
        connect_timeout: Duration,
        max_frame: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!(addr = %local_addr, "Transport listening");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(TransportStats::default());

        let accept_inbound = inbound_tx.clone();
        let accept_stats = stats.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted inbound channel");
                        let (read_half, _write_half) = stream.into_split();
                        tokio::spawn(run_reader(
                            read_half,
                            peer,
                            accept_inbound.clone(),
                            accept_stats.clone(),
                            max_frame,
                        ));
                    }
                    Err(err) => {
                        warn!(error = %err, "Listener accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            connect_timeout,
            max_frame,
            inbound_rx: Mutex::new(inbound_rx),
            inbound_tx,
            failures_rx: Mutex::new(failures_rx),
            failures_tx,
            channels: RwLock::new(HashMap::new()),
            stats,
            accept_task,
        })
    }

    /// Address peers should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Establish a new channel to `endpoint` within the connect timeout.
    pub async fn connect(&self, endpoint: SocketAddr) -> Result<Channel, ConnectError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| ConnectError::Timeout {
                endpoint,
                timeout: self.connect_timeout,
            })?
            .map_err(|source| ConnectError::Io { endpoint, source })?;

        let (read_half, write_half) = stream.into_split();
        // The peer may send back on the same connection; feed it into the
        // shared inbound queue like any accepted channel.
        tokio::spawn(run_reader(
            read_half,
            endpoint,
            self.inbound_tx.clone(),
            self.stats.clone(),
            self.max_frame,
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(
            write_half,
            endpoint,
            rx,
            self.failures_tx.clone(),
            self.stats.clone(),
        ));

        debug!(endpoint = %endpoint, "Outbound channel established");
        Ok(Channel { endpoint, tx })
    }

    /// Get the pooled channel to `endpoint`, connecting on first use and
    /// replacing a channel whose writer has stopped.
    pub async fn channel_to(&self, endpoint: SocketAddr) -> Result<Channel, ConnectError> {
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(&endpoint) {
                if !channel.is_closed() {
                    return Ok(channel.clone());
                }
            }
        }

        let channel = self.connect(endpoint).await?;
        let mut channels = self.channels.write().await;
        channels.insert(endpoint, channel.clone());
        Ok(channel)
    }

    /// Hand a message to a channel's send buffer.
    ///
    /// Non-blocking beyond the queue handoff; the caller may retry with
    /// backoff on failure, the transport never retries internally.
    pub fn send(&self, channel: &Channel, message: Message) -> Result<(), TransportError> {
        let endpoint = channel.endpoint;
        match channel.tx.send(message) {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::SendError(message)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let _ = self.failures_tx.send(DeliveryFailure {
                    endpoint,
                    topic: message.topic,
                    reason: "channel closed before transmission".to_string(),
                });
                Err(TransportError::ChannelClosed(endpoint))
            }
        }
    }

    /// Drain whatever inbound messages are currently buffered.
    ///
    /// Non-blocking and finite per call; restartable across calls.
    pub async fn poll(&self) -> Vec<Inbound> {
        let mut rx = self.inbound_rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(inbound) = rx.try_recv() {
            drained.push(inbound);
        }
        drained
    }

    /// Wait up to `timeout` for one inbound message.
    ///
    /// Returns `None` on timeout. Used by `spin_once` to block boundedly
    /// before draining the rest of the buffer with [`Transport::poll`].
    pub async fn wait_inbound(&self, timeout: Duration) -> Option<Inbound> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Drain pending delivery-failure events.
    pub async fn take_failures(&self) -> Vec<DeliveryFailure> {
        let mut rx = self.failures_rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(failure) = rx.try_recv() {
            drained.push(failure);
        }
        drained
    }

    /// Stop accepting connections and close all pooled channels.
    pub async fn shutdown(&self) {
        self.accept_task.abort();
        let mut channels = self.channels.write().await;
        channels.clear();
        debug!(addr = %self.local_addr, "Transport shut down");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Decode frames off a socket and feed them into the inbound queue.
async fn run_reader(
    mut read_half: OwnedReadHalf,
    peer: SocketAddr,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    stats: Arc<TransportStats>,
    max_frame: usize,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                debug!(peer = %peer, "Channel closed by peer");
                return;
            }
            Ok(_) => loop {
                match Message::decode(&mut buf, max_frame) {
                    Ok(Some(message)) => {
                        stats.received.fetch_add(1, Ordering::Relaxed);
                        if inbound_tx.send(Inbound { peer, message }).is_err() {
                            // Transport dropped; nothing left to deliver to.
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(peer = %peer, error = %err, "Dropping malformed channel");
                        return;
                    }
                }
            },
            Err(err) => {
                debug!(peer = %peer, error = %err, "Channel read failed");
                return;
            }
        }
    }
}

/// Encode and write queued messages; report write failures as
/// delivery-failure events and stop.
async fn run_writer(
    mut write_half: OwnedWriteHalf,
    endpoint: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Message>,
    failures_tx: mpsc::UnboundedSender<DeliveryFailure>,
    stats: Arc<TransportStats>,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    while let Some(message) = rx.recv().await {
        buf.clear();
        let topic = message.topic.clone();
        let encode_result = message.encode(&mut buf);
        let write_result = match encode_result {
            Ok(()) => write_half.write_all(&buf).await.map_err(|e| e.to_string()),
            Err(err) => Err(err.to_string()),
        };
        if let Err(reason) = write_result {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            let _ = failures_tx.send(DeliveryFailure {
                endpoint,
                topic,
                reason,
            });
            // Closing rx here makes subsequent sends fail fast with
            // ChannelClosed instead of queueing into the void.
            rx.close();
            return;
        }
    }
}
