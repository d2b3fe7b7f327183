mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{keys, setup};
use kvcoord_core::{
    Acquisition, CancellationToken, LockOptions, LockState, Store, StoreError, WriteOptions,
};
use tokio::time::{sleep, timeout};

#[tokio::test(start_paused = true)]
async fn test_lock_unlock() {
    let (store, coord) = setup();
    let stop = CancellationToken::new();

    let mut lock = coord
        .new_lock(
            "testLockUnlock",
            LockOptions::new("bar").ttl(Duration::from_secs(2)),
        )
        .unwrap();
    assert_eq!(lock.state(), LockState::Idle);

    let acquisition = lock.lock(&stop).await.unwrap();
    assert!(acquisition.is_acquired());
    assert_eq!(lock.state(), LockState::Held);

    let pair = store.get("testLockUnlock").await.unwrap().unwrap();
    assert_eq!(pair.value, b"bar");
    assert!(pair.last_index > 0);

    // Listing the lock key returns the lock itself and nothing else.
    let listed = store.list("testLockUnlock").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, "testLockUnlock");
    assert_eq!(listed[0].value, b"bar");

    // Renewal keeps the lock well past its TTL.
    sleep(Duration::from_secs(7)).await;
    assert!(lock.is_held());
    assert!(store.exists("testLockUnlock").await.unwrap());

    lock.unlock().await.unwrap();
    assert_eq!(lock.state(), LockState::Idle);
    assert!(store.get("testLockUnlock").await.unwrap().is_none());
    assert!(coord.sessions().active_sessions().is_empty());
}

#[tokio::test]
async fn test_lock_without_ttl_has_no_session() {
    let (store, coord) = setup();
    let mut lock = coord.new_lock("plain", LockOptions::new("v")).unwrap();

    assert!(lock.lock(&CancellationToken::new()).await.unwrap().is_acquired());
    assert!(lock.session_id().is_none());
    assert!(coord.sessions().active_sessions().is_empty());
    assert!(store.exists("plain").await.unwrap());

    lock.unlock().await.unwrap();
    assert!(!store.exists("plain").await.unwrap());
}

#[tokio::test]
async fn test_empty_lock_key_rejected() {
    let (_store, coord) = setup();
    assert!(matches!(
        coord.new_lock("/", LockOptions::default()),
        Err(StoreError::InvalidKey(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_second_contender_waits_for_release() {
    let (store, coord) = setup();
    let opts = LockOptions::new("a").ttl(Duration::from_secs(3));
    let mut first = coord.new_lock("election", opts).unwrap();
    let mut second = coord
        .new_lock("election", LockOptions::new("b").ttl(Duration::from_secs(3)))
        .unwrap();

    assert!(first.lock(&CancellationToken::new()).await.unwrap().is_acquired());

    let mut waiter = tokio::spawn(async move {
        let result = second.lock(&CancellationToken::new()).await;
        (second, result)
    });

    // Still blocked long after the first holder's TTL, since it is renewed.
    assert!(timeout(Duration::from_secs(10), &mut waiter).await.is_err());
    assert_eq!(store.get("election").await.unwrap().unwrap().value, b"a");

    first.unlock().await.unwrap();
    let (second, result) = waiter.await.unwrap();
    assert!(result.unwrap().is_acquired());
    assert!(second.is_held());
    assert_eq!(store.get("election").await.unwrap().unwrap().value, b"b");
}

#[tokio::test]
async fn test_lock_waits_on_foreign_key() {
    let (store, coord) = setup();
    store
        .put("busy", b"someone else", &WriteOptions::default())
        .await
        .unwrap();

    let mut lock = coord.new_lock("busy", LockOptions::new("me")).unwrap();
    let waiter = tokio::spawn(async move {
        let result = lock.lock(&CancellationToken::new()).await;
        (lock, result)
    });

    tokio::task::yield_now().await;
    store.delete("busy").await.unwrap();

    let (lock, result) = waiter.await.unwrap();
    assert!(result.unwrap().is_acquired());
    assert_eq!(lock.held_pair().unwrap().value, b"me");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_under_contention() {
    let (_store, coord) = setup();
    let inside = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..8 {
        let coord = coord.clone();
        let inside = inside.clone();
        let entered = entered.clone();
        tasks.push(tokio::spawn(async move {
            let options = LockOptions::new(format!("worker-{i}")).ttl(Duration::from_secs(5));
            let mut lock = coord.new_lock("critical", options).unwrap();
            for _ in 0..3 {
                let acquired = lock.lock(&CancellationToken::new()).await.unwrap();
                assert!(acquired.is_acquired());
                assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                entered.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.store(false, Ordering::SeqCst);
                lock.unlock().await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(entered.load(Ordering::SeqCst), 24);
    assert!(coord.sessions().active_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_wait_leaves_nothing_behind() {
    let (store, coord) = setup();
    let mut holder = coord
        .new_lock("queue", LockOptions::new("h").ttl(Duration::from_secs(2)))
        .unwrap();
    holder.lock(&CancellationToken::new()).await.unwrap();

    let mut waiter = coord
        .new_lock("queue", LockOptions::new("w").ttl(Duration::from_secs(2)))
        .unwrap();
    let stop = CancellationToken::new();
    let canceller = stop.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let outcome = waiter.lock(&stop).await.unwrap();
    assert!(matches!(outcome, Acquisition::Cancelled));
    assert_eq!(waiter.state(), LockState::Idle);
    // Let the abandoned watch task wind down.
    sleep(Duration::from_millis(10)).await;

    // Only the holder's session is left, and only its key.
    assert_eq!(coord.sessions().active_sessions().len(), 1);
    assert_eq!(keys(&store.list("queue").await.unwrap()), vec!["queue"]);
    assert_eq!(store.get("queue").await.unwrap().unwrap().value, b"h");
    assert!(coord.watches().active_subscriptions().is_empty());
}

#[tokio::test]
async fn test_unlock_is_idempotent() {
    let (store, coord) = setup();
    let mut lock = coord.new_lock("idem", LockOptions::new("v")).unwrap();

    lock.unlock().await.unwrap();
    lock.lock(&CancellationToken::new()).await.unwrap();
    lock.unlock().await.unwrap();
    lock.unlock().await.unwrap();
    assert_eq!(lock.state(), LockState::Idle);
    assert!(!store.exists("idem").await.unwrap());
}

#[tokio::test]
async fn test_lock_while_held_returns_current_hold() {
    let (_store, coord) = setup();
    let mut lock = coord.new_lock("again", LockOptions::new("v")).unwrap();
    let first = lock.lock(&CancellationToken::new()).await.unwrap();
    let index = lock.held_pair().unwrap().last_index;

    let second = lock.lock(&CancellationToken::new()).await.unwrap();
    assert!(first.is_acquired() && second.is_acquired());
    assert_eq!(lock.held_pair().unwrap().last_index, index);
}

#[tokio::test(start_paused = true)]
async fn test_involuntary_loss_is_signalled() {
    let (store, coord) = setup();
    let mut lock = coord
        .new_lock("fragile", LockOptions::new("v").ttl(Duration::from_secs(3)))
        .unwrap();
    let Acquisition::Acquired(mut lost) = lock.lock(&CancellationToken::new()).await.unwrap()
    else {
        panic!("expected the lock to be acquired");
    };

    let session = lock.session_id().unwrap();
    store.expire_session(session).unwrap();
    assert!(!store.exists("fragile").await.unwrap());

    let reason = timeout(Duration::from_secs(3), lost.lost()).await.unwrap();
    assert!(reason.contains("not found"));
    assert!(lost.is_lost());
    assert!(!lock.is_held());
    assert_eq!(lock.state(), LockState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_stale_unlock_spares_new_holder() {
    let (store, coord) = setup();
    let opts = || LockOptions::new("v").ttl(Duration::from_secs(3));
    let mut old = coord.new_lock("shared", opts()).unwrap();
    let mut new = coord.new_lock("shared", opts()).unwrap();

    old.lock(&CancellationToken::new()).await.unwrap();
    store.expire_session(old.session_id().unwrap()).unwrap();

    assert!(new.lock(&CancellationToken::new()).await.unwrap().is_acquired());

    // The previous holder cleaning up must not touch the new hold.
    old.unlock().await.unwrap();
    old.unlock().await.unwrap();
    assert_eq!(old.state(), LockState::Idle);
    assert!(new.is_held());
    let pair = store.get("shared").await.unwrap().unwrap();
    assert_eq!(Some(&pair), new.held_pair());
}

#[tokio::test(start_paused = true)]
async fn test_relock_after_loss() {
    let (store, coord) = setup();
    let mut lock = coord
        .new_lock("phoenix", LockOptions::new("v").ttl(Duration::from_secs(3)))
        .unwrap();
    lock.lock(&CancellationToken::new()).await.unwrap();
    let first_session = lock.session_id().unwrap();
    store.expire_session(first_session).unwrap();
    sleep(Duration::from_secs(2)).await;
    assert!(!lock.is_held());

    assert!(lock.lock(&CancellationToken::new()).await.unwrap().is_acquired());
    assert_ne!(lock.session_id(), Some(first_session));
    assert!(store.exists("phoenix").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_stopping_renewal_lets_lock_lapse() {
    let (store, coord) = setup();
    let renew = CancellationToken::new();
    let mut lock = coord
        .new_lock(
            "lapsing",
            LockOptions::new("v")
                .ttl(Duration::from_secs(3))
                .renew_lock(renew.clone()),
        )
        .unwrap();
    let Acquisition::Acquired(mut lost) = lock.lock(&CancellationToken::new()).await.unwrap()
    else {
        panic!("expected the lock to be acquired");
    };

    sleep(Duration::from_secs(5)).await;
    assert!(store.exists("lapsing").await.unwrap());

    renew.cancel();
    let reason = timeout(Duration::from_secs(5), lost.lost()).await.unwrap();
    assert!(reason.contains("renewal stopped"));
    assert!(!store.exists("lapsing").await.unwrap());
    assert!(!lock.is_held());
}

#[tokio::test(start_paused = true)]
async fn test_waiter_survives_compaction() {
    let (store, coord) = setup();
    let mut holder = coord.new_lock("compact", LockOptions::new("h")).unwrap();
    holder.lock(&CancellationToken::new()).await.unwrap();

    let mut waiter = coord.new_lock("compact", LockOptions::new("w")).unwrap();
    let mut task = tokio::spawn(async move {
        let result = waiter.lock(&CancellationToken::new()).await;
        (waiter, result)
    });
    assert!(timeout(Duration::from_secs(1), &mut task).await.is_err());

    // The release happens while the waiter's watch is cut off and the
    // history covering it is compacted away.
    store.pause_notifications();
    holder.unlock().await.unwrap();
    store.compact(store.revision());
    store.invalidate_watches();

    let (waiter, result) = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(result.unwrap().is_acquired());
    assert_eq!(waiter.held_pair().unwrap().value, b"w");
}

#[tokio::test(start_paused = true)]
async fn test_session_lost_while_waiting_fails_acquisition() {
    let (store, coord) = setup();
    let stop = CancellationToken::new();
    let mut holder = coord
        .new_lock("contended", LockOptions::new("a").ttl(Duration::from_secs(3)))
        .unwrap();
    assert!(holder.lock(&stop).await.unwrap().is_acquired());
    let holder_session = holder.session_id().unwrap();

    let mut waiter = coord
        .new_lock("contended", LockOptions::new("b").ttl(Duration::from_secs(3)))
        .unwrap();
    let waiting = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let result = waiter.lock(&stop).await;
            (waiter, result)
        })
    };

    let waiter_session = loop {
        let found = coord
            .sessions()
            .active_sessions()
            .into_iter()
            .map(|s| s.id)
            .find(|id| *id != holder_session);
        if let Some(id) = found {
            break id;
        }
        sleep(Duration::from_millis(10)).await;
    };
    sleep(Duration::from_millis(50)).await;
    store.expire_session(waiter_session).unwrap();

    let (waiter, result) = timeout(Duration::from_secs(3), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(StoreError::SessionLost(_))));
    assert_eq!(waiter.state(), LockState::Failed);
    assert!(holder.is_held());

    holder.unlock().await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert!(coord.sessions().active_sessions().is_empty());
    assert!(coord.watches().active_subscriptions().is_empty());
}
