mod common;

use std::time::Duration;

use common::{keys, setup};
use futures::StreamExt;
use kvcoord_core::{CancellationToken, EventKind, Store, StoreError, WatchTarget, WriteOptions};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_watch_yields_current_value_then_updates() {
    let (store, coord) = setup();
    let opts = WriteOptions::default();
    store.put("config/mode", b"one", &opts).await.unwrap();

    let cancel = CancellationToken::new();
    let mut values = coord.watch("config/mode", &cancel).await.unwrap();
    assert_eq!(values.next().await.unwrap().unwrap().value, b"one");

    store.put("config/mode", b"two", &opts).await.unwrap();
    store.delete("config/mode").await.unwrap();
    store.put("config/mode", b"three", &opts).await.unwrap();

    assert_eq!(values.next().await.unwrap().unwrap().value, b"two");
    // The deletion carries no value and is skipped.
    assert_eq!(values.next().await.unwrap().unwrap().value, b"three");
}

#[tokio::test]
async fn test_watch_missing_key_starts_empty() {
    let (store, coord) = setup();
    let cancel = CancellationToken::new();
    let mut values = coord.watch("later", &cancel).await.unwrap();

    store.put("later", b"v", &WriteOptions::default()).await.unwrap();
    let pair = timeout(WAIT, values.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(pair.key, "later");
}

#[tokio::test]
async fn test_watch_tree_reports_whole_subtree() {
    let (store, coord) = setup();
    let opts = WriteOptions::default();
    store.put("nodes/a", b"1", &opts).await.unwrap();
    store.put("nodesX", b"ignored", &opts).await.unwrap();

    let cancel = CancellationToken::new();
    let mut trees = coord.watch_tree("nodes", &cancel).await.unwrap();
    assert_eq!(keys(&trees.next().await.unwrap().unwrap()), vec!["nodes/a"]);

    store.put("nodes/b", b"2", &opts).await.unwrap();
    assert_eq!(
        keys(&trees.next().await.unwrap().unwrap()),
        vec!["nodes/a", "nodes/b"]
    );

    store.delete("nodes/a").await.unwrap();
    assert_eq!(keys(&trees.next().await.unwrap().unwrap()), vec!["nodes/b"]);
}

#[tokio::test]
async fn test_events_arrive_in_revision_order() {
    let (store, coord) = setup();
    let cancel = CancellationToken::new();
    let mut events = coord
        .watch_events(WatchTarget::prefix("seq"), &cancel)
        .await
        .unwrap();

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for i in 0..50 {
                let key = format!("seq/{}", i % 5);
                store
                    .put(&key, i.to_string().as_bytes(), &WriteOptions::default())
                    .await
                    .unwrap();
            }
        })
    };

    let mut last = 0;
    for _ in 0..50 {
        let event = timeout(WAIT, events.next()).await.unwrap().unwrap().unwrap();
        assert!(event.index > last, "{} after {}", event.index, last);
        assert!(!event.synthetic);
        last = event.index;
    }
    writer.await.unwrap();
}

#[tokio::test]
async fn test_subscribers_are_independent() {
    let (store, coord) = setup();
    let cancel = CancellationToken::new();
    let mut fast = coord
        .watch_events(WatchTarget::key("shared"), &cancel)
        .await
        .unwrap();
    let slow = coord
        .watch_events(WatchTarget::key("shared"), &cancel)
        .await
        .unwrap();
    assert_eq!(coord.watches().active_subscriptions().len(), 2);

    drop(slow);
    store.put("shared", b"v", &WriteOptions::default()).await.unwrap();
    let event = timeout(WAIT, fast.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(event.kind, EventKind::Created);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        coord.watches().active_subscriptions(),
        vec![WatchTarget::key("shared")]
    );
}

#[tokio::test]
async fn test_cancel_ends_stream_quietly() {
    let (store, coord) = setup();
    let cancel = CancellationToken::new();
    let mut events = coord
        .watch_events(WatchTarget::prefix(""), &cancel)
        .await
        .unwrap();

    cancel.cancel();
    assert!(timeout(WAIT, events.next()).await.unwrap().is_none());

    // Writes after cancellation are not an error for anyone.
    store.put("after", b"v", &WriteOptions::default()).await.unwrap();
}

#[tokio::test]
async fn test_resync_synthesises_missed_changes() {
    let (store, coord) = setup();
    let opts = WriteOptions::default();
    store.put("dir/gone", b"1", &opts).await.unwrap();
    store.put("dir/changed", b"1", &opts).await.unwrap();
    store.put("dir/same", b"1", &opts).await.unwrap();

    let cancel = CancellationToken::new();
    let subscription = coord
        .watches()
        .subscribe(WatchTarget::prefix("dir"), &cancel)
        .await
        .unwrap();
    assert_eq!(subscription.snapshot.pairs.len(), 3);
    let mut events = subscription.events;

    store.pause_notifications();
    store.delete("dir/gone").await.unwrap();
    store.put("dir/changed", b"2", &opts).await.unwrap();
    store.put("dir/new", b"1", &opts).await.unwrap();
    store.compact(store.revision());
    store.invalidate_watches();

    let mut missed = Vec::new();
    for _ in 0..3 {
        let event = timeout(WAIT, events.next()).await.unwrap().unwrap().unwrap();
        assert!(event.synthetic);
        missed.push((event.key, event.kind));
    }
    missed.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        missed,
        vec![
            ("dir/changed".to_string(), EventKind::Modified),
            ("dir/gone".to_string(), EventKind::Deleted),
            ("dir/new".to_string(), EventKind::Created),
        ]
    );

    // Live delivery resumes after the resync.
    store.delete("dir/same").await.unwrap();
    let event = timeout(WAIT, events.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(event.key, "dir/same");
    assert_eq!(event.kind, EventKind::Deleted);
    assert!(!event.synthetic);
}

#[tokio::test]
async fn test_live_delivery_after_invalidation() {
    let (store, coord) = setup();
    store.put("quiet", b"v", &WriteOptions::default()).await.unwrap();

    let cancel = CancellationToken::new();
    let mut events = coord
        .watch_events(WatchTarget::key("quiet"), &cancel)
        .await
        .unwrap();
    store.invalidate_watches();
    store.put("quiet", b"w", &WriteOptions::default()).await.unwrap();

    let event = timeout(WAIT, events.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(event.kind, EventKind::Modified);
    assert_eq!(event.pair.unwrap().value, b"w");
}

#[tokio::test]
async fn test_closed_backend_surfaces_error_once() {
    let (store, coord) = setup();
    let cancel = CancellationToken::new();
    let mut events = coord
        .watch_events(WatchTarget::key("k"), &cancel)
        .await
        .unwrap();

    store.close().await.unwrap();
    let item = timeout(WAIT, events.next()).await.unwrap().unwrap();
    assert!(matches!(item, Err(StoreError::BackendUnavailable(_))));
    assert!(events.next().await.is_none());
}
