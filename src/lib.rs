//! Meshbus - Broker-free pub/sub messaging
//!
//! A lightweight publish/subscribe core for small meshes of
//! cooperating processes: named nodes, topic-addressed messages, peer
//! discovery over UDP multicast, and direct TCP delivery with no
//! central broker.

pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod message;
pub mod node;
pub mod registry;
pub mod subscription;
pub mod transport;

pub use config::Config;
pub use dispatch::CycleStats;
pub use message::Message;
pub use node::{Node, NodeError, NodeState};
pub use registry::TopicRegistry;
pub use subscription::Subscription;
