//! End-to-end runs of the controller against a file store

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{collections::BTreeMap, path::Path, time::Duration};

use herald::Herald;
use herald_common::Signal;
use herald_delivery::{CycleOutcome, SendMode};
use herald_store::{AttemptResult, DeliveryLog, MessageQueue, Priority, SuppressionList, UserId};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

fn config(root: &Path) -> Herald {
    let document = format!(
        r#"Herald (
            store: File(path: "{store}"),
            lock_dir: "{locks}",
            mail: (
                empty_queue_sleep_secs: 1,
                transport: Directory(path: "{outbox}"),
                default_from: "herald@example.com",
                admins: ["root@example.com"],
            ),
            notices: (
                poll_interval_secs: 1,
                from_address: "notices@example.com",
                recipients: {{7: "seven@example.com"}},
            ),
        )"#,
        store = root.join("spool").display(),
        locks = root.join("locks").display(),
        outbox = root.join("outbox").display(),
    );

    Herald::from_ron(&document).unwrap()
}

fn outbox(root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(root.join("outbox")) else {
        return Vec::new();
    };

    let mut files: Vec<_> = entries
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".eml"))
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn test_one_shot_cycles_deliver_and_suppress() {
    let root = tempfile::tempdir().unwrap();
    let herald = config(root.path());
    let store = herald.open_store().unwrap();

    let mailer = herald.mailer(store.clone());
    let ids = mailer
        .send_mail(
            "Hello",
            "Body",
            None,
            &["a@example.com", "blocked@example.com"],
            Priority::Medium,
        )
        .await
        .unwrap();
    mailer.mail_admins("Disk full", "").await.unwrap();
    SuppressionList::new(store.clone())
        .add("BLOCKED@example.com")
        .await
        .unwrap();

    let CycleOutcome::Completed(summary) = herald.mail_worker(store.clone()).run_cycle().await.unwrap()
    else {
        panic!("cycle was skipped");
    };
    assert_eq!((summary.delivered, summary.suppressed), (2, 1));
    assert_eq!(outbox(root.path()).len(), 2);
    assert!(outbox(root.path()).contains(&format!("{}.eml", ids[0])));

    let log = DeliveryLog::new(store.clone()).entries().await.unwrap();
    let results: Vec<_> = log.iter().map(|entry| entry.result).collect();
    // The admin mail is High and goes first
    assert_eq!(
        results,
        vec![AttemptResult::Success, AttemptResult::Success, AttemptResult::Suppressed]
    );
    assert_eq!(log[0].message.subject, "[herald] Disk full");
}

#[tokio::test]
async fn test_store_survives_a_restart() {
    let root = tempfile::tempdir().unwrap();
    let herald = config(root.path());

    let store = herald.open_store().unwrap();
    let queue = MessageQueue::new(store);
    herald
        .mailer(queue.store().clone())
        .send_mail("Later", "", None, &["a@example.com"], Priority::Low)
        .await
        .unwrap();
    drop(queue);

    let reopened = MessageQueue::new(herald.open_store().unwrap());
    assert_eq!(reopened.count(Priority::Low).await.unwrap(), 1);
}

#[tokio::test]
async fn test_poll_loops_drain_until_shutdown() {
    let root = tempfile::tempdir().unwrap();
    let herald = config(root.path());
    let store = herald.open_store().unwrap();

    let notifier = herald.notifier(store.clone());
    let mut context = BTreeMap::new();
    context.insert("subject".to_string(), "Welcome".to_string());
    assert!(notifier
        .send(&[UserId(7), UserId(8)], "welcome", &context, true, SendMode::Queue)
        .await
        .unwrap());

    let (signals, _keep) = broadcast::channel(8);
    let tasks = herald.spawn(&store, &signals);

    // The notice loop turns the batch into mail, the mail loop then sends it
    let mut waited = Duration::ZERO;
    while outbox(root.path()).is_empty() && waited < Duration::from_secs(10) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        waited += Duration::from_millis(100);
    }

    signals.send(Signal::Shutdown).unwrap();
    tokio::time::timeout(Duration::from_secs(10), Herald::drain_tasks(tasks))
        .await
        .expect("poll loops did not stop");

    let delivered = outbox(root.path());
    assert_eq!(delivered.len(), 1);
    let eml = std::fs::read_to_string(root.path().join("outbox").join(&delivered[0])).unwrap();
    assert!(eml.contains("To: seven@example.com\r\n"));
    assert!(eml.contains("Subject: Welcome\r\n"));
}
