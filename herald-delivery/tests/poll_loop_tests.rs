//! Poll loop scheduling under a paused clock

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{collections::BTreeMap, time::Duration};

use herald_common::Signal;
use herald_delivery::{DeliveryOutcome, NoticeOutcome, PollLoop};
use herald_store::{Notice, NoticeQueue, Priority, UserId};
use pretty_assertions::assert_eq;
use support::{Harness, RecordingDispatcher, ScriptedTransport};
use tokio::sync::broadcast;

const IDLE: Duration = Duration::from_secs(5);

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_an_idle_loop() {
    let harness = Harness::new();
    let worker = harness.mail_worker(ScriptedTransport::new());
    let (tx, rx) = broadcast::channel(4);

    let handle = tokio::spawn(PollLoop::new(worker, IDLE).serve(rx));
    tokio::time::sleep(Duration::from_secs(1)).await;

    tx.send(Signal::Shutdown).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("poll loop did not stop")
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_work_arriving_while_idle_is_drained_next_interval() {
    let harness = Harness::new();
    harness.add("A", "a@example.com", Priority::High, 0).await;

    let transport = ScriptedTransport::new();
    let worker = harness.mail_worker(transport.clone());
    let (tx, rx) = broadcast::channel(4);
    let handle = tokio::spawn(PollLoop::new(worker, IDLE).serve(rx));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.subjects(), vec!["A"]);

    harness.add("B", "b@example.com", Priority::Low, 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.subjects(), vec!["A"]);

    tokio::time::sleep(IDLE).await;
    assert_eq!(transport.subjects(), vec!["A", "B"]);

    tx.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_deferred_items_do_not_keep_the_loop_busy() {
    let harness = Harness::new();
    harness.add("D", "d@example.com", Priority::Medium, 0).await;

    let transport = ScriptedTransport::new();
    transport.script("d@example.com", DeliveryOutcome::Transient("later".to_string()));
    let worker = harness.mail_worker(transport.clone());
    let (tx, rx) = broadcast::channel(4);
    let handle = tokio::spawn(PollLoop::new(worker, IDLE).serve(rx));

    tokio::time::sleep(IDLE * 3).await;
    assert_eq!(transport.calls().len(), 1);

    tx.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_replaying_batch_waits_for_the_idle_interval() {
    let harness = Harness::new();
    NoticeQueue::new(harness.store.clone())
        .enqueue(&[Notice {
            recipient: UserId(1),
            label: "flaky".to_string(),
            context: BTreeMap::new(),
            on_site: true,
        }])
        .await
        .unwrap();

    let dispatcher = RecordingDispatcher::new();
    dispatcher.script("flaky", NoticeOutcome::Transient("down".to_string()));
    let worker = harness.notice_worker(dispatcher.clone());
    let (tx, rx) = broadcast::channel(4);
    let handle = tokio::spawn(PollLoop::new(worker, IDLE).serve(rx));

    // Cycles at t=0, 5 and 10
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(dispatcher.labels().len(), 3);

    tx.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}
