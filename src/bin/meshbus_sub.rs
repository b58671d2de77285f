//! meshbus-sub: Demo subscriber
//!
//! Subscribes to a topic and prints every message until interrupted.
//!
//! ## Usage
//! ```text
//! meshbus-sub [TOPIC]     # defaults to "A"
//! ```
//!
//! ## Configuration
//! - MESHBUS_CONFIG: optional configuration file path
//! - MESHBUS_LOG: tracing filter (defaults to "info")

use tracing::info;

use meshbus::bootstrap::init_tracing;
use meshbus::{Config, Node, TopicRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let topic = std::env::args().nth(1).unwrap_or_else(|| "A".to_string());

    let config = Config::load(None)?;
    let node = Node::new("meshbus-sub", config, TopicRegistry::new());
    node.init().await?;
    node.subscribe(&topic, |message| {
        println!(
            "[{}] #{} from {}: {}",
            message.topic,
            message.seq,
            message.publisher,
            String::from_utf8_lossy(&message.payload)
        );
    })
    .await?;
    info!(topic = %topic, "Listening");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        result = node.spin() => result?,
    }

    node.cleanup().await;
    Ok(())
}
