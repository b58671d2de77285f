//! meshbus-pub: Demo publisher
//!
//! Publishes a counter payload on a topic once per second until
//! interrupted. Peers subscribed to the topic (found via discovery)
//! receive each message over the transport.
//!
//! ## Usage
//! ```text
//! meshbus-pub [TOPIC]     # defaults to "A"
//! ```
//!
//! ## Configuration
//! - MESHBUS_CONFIG: optional configuration file path
//! - MESHBUS_LOG: tracing filter (defaults to "info")

use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use meshbus::bootstrap::init_tracing;
use meshbus::{Config, Node, TopicRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let topic = std::env::args().nth(1).unwrap_or_else(|| "A".to_string());

    let config = Config::load(None)?;
    let node = Node::new("meshbus-pub", config, TopicRegistry::new());
    node.init().await?;
    info!(topic = %topic, "Publishing");

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut counter: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                node.publish(&topic, Bytes::from(format!("message {counter}"))).await?;
                counter += 1;
                // Keeps peer events flowing between publishes.
                node.spin_once().await?;
            }
        }
    }

    node.cleanup().await;
    Ok(())
}
