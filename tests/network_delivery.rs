//! Delivery between nodes with separate registries over TCP.
//!
//! Uses static discovery so tests do not depend on multicast being
//! available in the environment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use meshbus::config::StaticPeer;
use meshbus::{Config, Node, TopicRegistry};

fn test_config() -> Config {
    let mut config = Config::for_test();
    config.transport.listen = "127.0.0.1:0".to_string();
    config.node.idle_poll_ms = 20;
    config
}

/// Spin `node` until `done` returns true or the deadline passes.
async fn spin_until(node: &Node, done: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() && tokio::time::Instant::now() < deadline {
        node.spin_once().await.unwrap();
    }
}

/// A publisher node statically pointed at `subscriber`'s endpoint.
async fn publisher_for(subscriber: &Node, topics: &[&str]) -> Node {
    let mut config = test_config();
    config.discovery.static_peers = vec![StaticPeer {
        name: subscriber.name().to_string(),
        endpoint: subscriber.endpoint().await.unwrap().to_string(),
        topics: topics.iter().map(|t| t.to_string()).collect(),
    }];
    let publisher = Node::new("pub", config, TopicRegistry::new());
    publisher.init().await.unwrap();
    // Apply the static peer before the first publish.
    publisher.spin_once().await.unwrap();
    publisher
}

#[tokio::test]
async fn test_remote_delivery_over_tcp() {
    let subscriber = Node::new("sub", test_config(), TopicRegistry::new());
    subscriber.init().await.unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    subscriber
        .subscribe("T", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    let publisher = publisher_for(&subscriber, &["T"]).await;
    publisher.publish("T", Bytes::from_static(b"over the wire")).await.unwrap();

    let observed = count.clone();
    spin_until(&subscriber, move || observed.load(Ordering::SeqCst) >= 1).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let (sent, _, failed) = publisher.transport_stats().await.unwrap();
    assert_eq!(sent, 1);
    assert_eq!(failed, 0);
    let (_, received, _) = subscriber.transport_stats().await.unwrap();
    assert_eq!(received, 1);

    publisher.cleanup().await;
    subscriber.cleanup().await;
}

#[tokio::test]
async fn test_remote_delivery_preserves_publish_order() {
    let subscriber = Node::new("sub", test_config(), TopicRegistry::new());
    subscriber.init().await.unwrap();
    let seqs = Arc::new(Mutex::new(Vec::new()));
    let sink = seqs.clone();
    subscriber
        .subscribe("T", move |message| sink.lock().unwrap().push(message.seq))
        .await
        .unwrap();

    let publisher = publisher_for(&subscriber, &["T"]).await;
    for i in 0..20u64 {
        publisher.publish("T", Bytes::from(i.to_string())).await.unwrap();
    }

    let observed = seqs.clone();
    spin_until(&subscriber, move || observed.lock().unwrap().len() >= 20).await;
    assert_eq!(*seqs.lock().unwrap(), (0..20).collect::<Vec<u64>>());

    publisher.cleanup().await;
    subscriber.cleanup().await;
}

#[tokio::test]
async fn test_wildcard_static_peer_receives_every_topic() {
    let subscriber = Node::new("sub", test_config(), TopicRegistry::new());
    subscriber.init().await.unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    for topic in ["A", "B"] {
        let counter = count.clone();
        subscriber
            .subscribe(topic, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
    }

    // Empty topic list marks the peer as interested in everything.
    let publisher = publisher_for(&subscriber, &[]).await;
    publisher.publish("A", Bytes::from_static(b"a")).await.unwrap();
    publisher.publish("B", Bytes::from_static(b"b")).await.unwrap();

    let observed = count.clone();
    spin_until(&subscriber, move || observed.load(Ordering::SeqCst) >= 2).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);

    publisher.cleanup().await;
    subscriber.cleanup().await;
}

#[tokio::test]
async fn test_unreachable_peer_is_not_a_publish_error() {
    let mut config = test_config();
    config.discovery.static_peers = vec![StaticPeer {
        name: "ghost".to_string(),
        // Reserved port with nothing listening.
        endpoint: "127.0.0.1:9".to_string(),
        topics: vec!["T".to_string()],
    }];
    let publisher = Node::new("pub", config, TopicRegistry::new());
    publisher.init().await.unwrap();
    publisher.spin_once().await.unwrap();

    // At-most-once: the failure is logged, not returned.
    publisher.publish("T", Bytes::from_static(b"x")).await.unwrap();

    publisher.cleanup().await;
}

#[tokio::test]
async fn test_messages_after_subscriber_cleanup_are_dropped() {
    let subscriber = Node::new("sub", test_config(), TopicRegistry::new());
    subscriber.init().await.unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    subscriber
        .subscribe("T", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    let publisher = publisher_for(&subscriber, &["T"]).await;
    publisher.publish("T", Bytes::from_static(b"first")).await.unwrap();
    let observed = count.clone();
    spin_until(&subscriber, move || observed.load(Ordering::SeqCst) >= 1).await;

    subscriber.cleanup().await;

    // The endpoint is gone; publishing still succeeds on the caller's side.
    publisher.publish("T", Bytes::from_static(b"second")).await.unwrap();
    publisher.spin_once().await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    publisher.cleanup().await;
}
