//! Notice batches: FIFO draining, atomic deletion and replay

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{collections::BTreeMap, sync::Arc};

use herald_delivery::{
    CycleOutcome, DeliveryError, MailNoticeDispatcher, NoticeOutcome, StaticDirectory,
};
use herald_store::{BackingStore as _, Notice, NoticeBatch, NoticeQueue, Priority, UserId};
use pretty_assertions::assert_eq;
use support::{Harness, RecordingDispatcher};

fn notice(user: u64, label: &str) -> Notice {
    Notice {
        recipient: UserId(user),
        label: label.to_string(),
        context: BTreeMap::new(),
        on_site: false,
    }
}

#[tokio::test]
async fn test_batches_drain_oldest_first() {
    let harness = Harness::new();
    let notices = NoticeQueue::new(harness.store.clone());
    notices.enqueue(&[notice(1, "first"), notice(2, "second")]).await.unwrap();
    notices.enqueue(&[notice(3, "third")]).await.unwrap();

    let dispatcher = RecordingDispatcher::new();
    dispatcher.script("second", NoticeOutcome::Skipped);
    let mut worker = harness.notice_worker(dispatcher.clone());

    let CycleOutcome::Completed(summary) = worker.run_cycle().await.unwrap() else {
        panic!("cycle was skipped");
    };

    assert_eq!(dispatcher.labels(), vec!["first", "second", "third"]);
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(notices.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_transient_failure_keeps_batch_and_replays_it() {
    let harness = Harness::new();
    let notices = NoticeQueue::new(harness.store.clone());
    let stuck = notices
        .enqueue(&[notice(1, "ok"), notice(2, "flaky"), notice(3, "after")])
        .await
        .unwrap()
        .unwrap();
    notices.enqueue(&[notice(4, "next")]).await.unwrap();

    let dispatcher = RecordingDispatcher::new();
    dispatcher.script("flaky", NoticeOutcome::Transient("smtp busy".to_string()));
    let mut worker = harness.notice_worker(dispatcher.clone());

    let CycleOutcome::Completed(summary) = worker.run_cycle().await.unwrap() else {
        panic!("cycle was skipped");
    };

    // The rest of the failed batch is not attempted, later batches are
    assert_eq!(dispatcher.labels(), vec!["ok", "flaky", "next"]);
    assert_eq!(summary.deferred, 1);
    assert_eq!(summary.batches, 1);

    let remaining: Vec<NoticeBatch> = notices.batches().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, stuck);

    dispatcher.clear("flaky");
    worker.run_cycle().await.unwrap();

    // Whole batch replayed, including the entry already sent
    assert_eq!(
        dispatcher.labels(),
        vec!["ok", "flaky", "next", "ok", "flaky", "after"]
    );
    assert_eq!(notices.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_permanent_failure_aborts_cycle() {
    let harness = Harness::new();
    let notices = NoticeQueue::new(harness.store.clone());
    notices.enqueue(&[notice(1, "broken")]).await.unwrap();
    notices.enqueue(&[notice(2, "never")]).await.unwrap();

    let dispatcher = RecordingDispatcher::new();
    dispatcher.script("broken", NoticeOutcome::Permanent("no dispatcher".to_string()));
    let mut worker = harness.notice_worker(dispatcher.clone());

    let err = worker.run_cycle().await.unwrap_err();
    assert!(err.is_permanent());
    assert_eq!(dispatcher.labels(), vec!["broken"]);
    assert_eq!(notices.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_undecodable_batch_aborts_cycle() {
    let harness = Harness::new();
    let corrupt = NoticeBatch {
        id: herald_store::ItemId::generate(),
        created_at: support::at(0),
        payload: br#"{"version": 99, "notices": []}"#.to_vec(),
    };
    harness.store.insert_batch(&corrupt).await.unwrap();

    let dispatcher = RecordingDispatcher::new();
    let mut worker = harness.notice_worker(dispatcher.clone());

    let err = worker.run_cycle().await.unwrap_err();
    assert!(matches!(err, DeliveryError::Codec { ref id, .. } if *id == corrupt.id));
    assert!(dispatcher.labels().is_empty());
    assert_eq!(harness.store.list_batches().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_mail_dispatcher_feeds_the_mail_queue() {
    let harness = Harness::new();
    let notices = NoticeQueue::new(harness.store.clone());
    notices
        .enqueue(&[notice(1, "password_reset"), notice(2, "password_reset")])
        .await
        .unwrap();

    let directory = StaticDirectory::new([(UserId(1), "one@example.com".to_string())]);
    let dispatcher = Arc::new(MailNoticeDispatcher::new(
        Arc::new(directory),
        harness.queue.clone(),
        "notices@example.com",
    ));
    let mut worker = harness.notice_worker(dispatcher);

    let CycleOutcome::Completed(summary) = worker.run_cycle().await.unwrap() else {
        panic!("cycle was skipped");
    };
    assert_eq!((summary.delivered, summary.skipped), (1, 1));

    let mail = harness.queue.iterate(Priority::Medium).await.unwrap();
    assert_eq!(mail.len(), 1);
    assert_eq!(mail[0].to_address, "one@example.com");
    assert_eq!(mail[0].subject, "password reset");
}
