mod common;

use common::*;
use roiorbison::mqtt::config::{OverflowPolicy, QueueConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn queue(capacity: usize, overflow: OverflowPolicy) -> QueueConfig {
    QueueConfig { capacity, overflow }
}

#[tokio::test]
async fn reconnect_publishes_a_fresh_retained_root() {
    let (listener, address) = listener().await;
    let server = tokio::spawn(async move {
        let mut first = accept_client(&listener).await;
        send(&mut first, "<Root attr=\"x\">").await;
        send(&mut first, "<Msg id=\"1\">A</Msg>").await;
        drop(first);

        let mut second = accept_client(&listener).await;
        send(&mut second, "<Root attr=\"y\">").await;
        send(&mut second, "<Msg id=\"2\">B</Msg>").await;
        hold(second).await;
    });

    let broker = RecordingBroker::new(BrokerMode::Online);
    let (bridge, cancel) = bridge(
        feed_config(&address),
        messenger(),
        &broker,
        queue(100, OverflowPolicy::DropOldest),
        retry(3),
    );
    let running = tokio::spawn(bridge.run());

    wait_until("four publishes", || broker.log().len() >= 4).await;
    cancel.cancel();
    let report = running.await.unwrap();
    server.abort();

    assert_eq!(
        broker.published(),
        vec![
            root("<Root attr=\"x\">"),
            child("<Msg id=\"1\">A</Msg>"),
            root("<Root attr=\"y\">"),
            child("<Msg id=\"2\">B</Msg>"),
        ]
    );
    assert_eq!(broker.retained(TOPIC).as_deref(), Some("<Root attr=\"y\">"));
    assert_eq!(report.session.connections, 2);
    assert_eq!(report.session.root_opens, 2);
    assert_eq!(report.publish.retained, 2);
}

#[tokio::test]
async fn each_reconnect_replaces_the_retained_root() {
    const RECONNECTS: usize = 4;
    let (listener, address) = listener().await;
    let server = tokio::spawn(async move {
        for n in 0..RECONNECTS {
            let mut socket = accept_client(&listener).await;
            send(&mut socket, &format!("<Root n=\"{n}\"><Msg n=\"{n}\"/>")).await;
        }
        // Later connections are left in the backlog without a root tag
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let broker = RecordingBroker::new(BrokerMode::Online);
    let (bridge, cancel) = bridge(
        feed_config(&address),
        messenger(),
        &broker,
        queue(100, OverflowPolicy::DropOldest),
        retry(3),
    );
    let running = tokio::spawn(bridge.run());

    wait_until("all connections published", || broker.log().len() >= 2 * RECONNECTS).await;
    cancel.cancel();
    running.await.unwrap();
    server.abort();

    let retained: Vec<_> = broker.log().into_iter().filter(|intent| intent.retained).collect();
    assert_eq!(retained.len(), RECONNECTS);
    assert_eq!(
        broker.retained(TOPIC),
        Some(format!("<Root n=\"{}\">", RECONNECTS - 1))
    );
}

#[tokio::test]
async fn broker_outage_does_not_touch_the_feed() {
    let (listener, address) = listener().await;
    let accepted = Arc::new(AtomicUsize::new(0));
    let resume = Arc::new(Notify::new());
    let server = {
        let accepted = accepted.clone();
        let resume = resume.clone();
        tokio::spawn(async move {
            let mut socket = accept_client(&listener).await;
            accepted.fetch_add(1, Ordering::SeqCst);
            send(&mut socket, "<Root><Msg n=\"1\"/><Msg n=\"2\"/><Msg n=\"3\"/>").await;
            resume.notified().await;
            send(&mut socket, "<Msg n=\"4\"/><Msg n=\"5\"/>").await;
            // A connection attempt here would show up in `accepted`
            let extra = tokio::time::timeout(Duration::from_secs(30), listener.accept()).await;
            if extra.is_ok() {
                accepted.fetch_add(1, Ordering::SeqCst);
            }
            drop(socket);
        })
    };

    let broker = RecordingBroker::new(BrokerMode::Failing);
    let (bridge, cancel) = bridge(
        feed_config(&address),
        messenger(),
        &broker,
        queue(100, OverflowPolicy::DropOldest),
        retry(10_000),
    );
    let running = tokio::spawn(bridge.run());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(broker.log().is_empty());
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    broker.set_mode(BrokerMode::Online);
    resume.notify_one();
    wait_until("all messages published", || broker.log().len() >= 6).await;
    cancel.cancel();
    let report = running.await.unwrap();
    server.abort();

    assert_eq!(
        broker.published(),
        vec![
            root("<Root>"),
            child("<Msg n=\"1\"/>"),
            child("<Msg n=\"2\"/>"),
            child("<Msg n=\"3\"/>"),
            child("<Msg n=\"4\"/>"),
            child("<Msg n=\"5\"/>"),
        ]
    );
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(report.session.connections, 1);
    assert_eq!(report.session.failures, 0);
    assert!(report.publish.failed_attempts > 0);
    assert_eq!(report.publish.dropped, 0);
}

#[tokio::test]
async fn stalled_broker_sheds_the_oldest_children() {
    const CAPACITY: usize = 4;
    const MESSAGES: usize = 20;
    let (listener, address) = listener().await;
    let server = tokio::spawn(async move {
        let mut socket = accept_client(&listener).await;
        send(&mut socket, "<Root>").await;
        for n in 1..=MESSAGES {
            send(&mut socket, &format!("<Msg n=\"{n}\"/>")).await;
        }
        hold(socket).await;
    });

    let broker = RecordingBroker::new(BrokerMode::Stalled);
    let (bridge, cancel) = bridge(
        feed_config(&address),
        messenger(),
        &broker,
        queue(CAPACITY, OverflowPolicy::DropOldest),
        retry(3),
    );
    let intents = bridge.queue();
    let running = tokio::spawn(bridge.run());

    wait_until("the queue overflowed", || {
        intents.dropped() as usize >= MESSAGES - CAPACITY
    })
    .await;
    assert!(intents.len() <= CAPACITY);

    broker.set_mode(BrokerMode::Online);
    let last = format!("<Msg n=\"{MESSAGES}\"/>");
    wait_until("the newest child was published", || {
        broker.log().last().is_some_and(|intent| intent.payload == last.as_bytes())
    })
    .await;
    cancel.cancel();
    let report = running.await.unwrap();
    server.abort();

    let published = broker.published();
    assert_eq!(published[0], root("<Root>"));
    let children: Vec<usize> = published[1..]
        .iter()
        .map(|(payload, retained)| {
            assert!(!retained);
            payload
                .trim_start_matches("<Msg n=\"")
                .trim_end_matches("\"/>")
                .parse()
                .unwrap()
        })
        .collect();
    assert!(children.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(children.last(), Some(&MESSAGES));
    assert_eq!(children.len() + report.queue_dropped as usize, MESSAGES);
    assert!(report.queue_high_water <= CAPACITY);
}

#[tokio::test]
async fn malformed_child_is_never_published() {
    let (listener, address) = listener().await;
    let server = tokio::spawn(async move {
        let mut first = accept_client(&listener).await;
        send(&mut first, "<Root><Msg>A</Root>").await;

        let mut second = accept_client(&listener).await;
        send(&mut second, "<Root b=\"2\"><Msg>B</Msg>").await;
        hold(second).await;
        drop(first);
    });

    let broker = RecordingBroker::new(BrokerMode::Online);
    let (bridge, cancel) = bridge(
        feed_config(&address),
        messenger(),
        &broker,
        queue(100, OverflowPolicy::Block),
        retry(3),
    );
    let running = tokio::spawn(bridge.run());

    wait_until("second connection published", || broker.log().len() >= 3).await;
    cancel.cancel();
    let report = running.await.unwrap();
    server.abort();

    assert_eq!(
        broker.published(),
        vec![root("<Root>"), root("<Root b=\"2\">"), child("<Msg>B</Msg>")]
    );
    assert_eq!(report.session.failures, 1);
}

#[tokio::test]
async fn second_root_forces_a_reconnect() {
    let (listener, address) = listener().await;
    let server = tokio::spawn(async move {
        let mut first = accept_client(&listener).await;
        send(&mut first, "<Root><A/><Root>").await;

        let mut second = accept_client(&listener).await;
        send(&mut second, "<Root n=\"2\"><B/>").await;
        hold(second).await;
        drop(first);
    });

    let broker = RecordingBroker::new(BrokerMode::Online);
    let (bridge, cancel) = bridge(
        feed_config(&address),
        messenger(),
        &broker,
        queue(100, OverflowPolicy::DropOldest),
        retry(3),
    );
    let running = tokio::spawn(bridge.run());

    wait_until("second connection published", || broker.log().len() >= 4).await;
    cancel.cancel();
    running.await.unwrap();
    server.abort();

    assert_eq!(
        broker.published(),
        vec![root("<Root>"), child("<A/>"), root("<Root n=\"2\">"), child("<B/>")]
    );
}
