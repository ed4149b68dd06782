use super::*;

use crate::tree::TIME_MAX;
use crate::Value;

#[tokio::test]
async fn it_creates_a_store() {
    let store = Store::create("engine_create.db", 1000)
        .await
        .expect("creates store");
    assert!(store.snapshot().is_empty(TIME_MAX));
    store.close().await.expect("closes");
    std::fs::remove_file("engine_create.db").expect("cleanup");
}

#[tokio::test]
async fn it_refuses_to_create_over_an_existing_store() {
    let store = Store::create("engine_create_twice.db", 1000)
        .await
        .expect("creates store");
    store.close().await.expect("closes");
    let err = Store::create("engine_create_twice.db", 1000)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::FileState { .. })
    ));
    std::fs::remove_file("engine_create_twice.db").expect("cleanup");
}

#[tokio::test]
async fn it_refuses_to_open_a_missing_store() {
    let err = Store::open("engine_missing.db", 1000).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::FileState { .. })
    ));
}

#[tokio::test]
async fn it_refuses_a_second_open_of_the_same_store() {
    let store = Store::create("engine_double_open.db", 1000)
        .await
        .expect("creates store");
    let err = Store::open("engine_double_open.db", 1000)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::AlreadyOpen(_))
    ));
    store.close().await.expect("closes");
    // Closed: opening is allowed again
    let reopened = Store::open("engine_double_open.db", 1000)
        .await
        .expect("opens store");
    reopened.close().await.expect("closes");
    std::fs::remove_file("engine_double_open.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_commits_and_survives_reopen() {
    let store = Store::create("engine_reopen.db", 1000)
        .await
        .expect("creates store");
    store
        .transaction(|tx| async move {
            Ok(tx
                .root()
                .set(&Value::from("x"), Value::from("hi"), tx.timestamp()))
        })
        .await
        .expect("transaction commits");
    assert_eq!(
        store.snapshot().get(&Value::from("x"), TIME_MAX),
        Some(Value::from("hi"))
    );
    store.close().await.expect("closes");

    let store = Store::open("engine_reopen.db", 1000)
        .await
        .expect("opens store");
    assert_eq!(
        store.snapshot().get(&Value::from("x"), TIME_MAX),
        Some(Value::from("hi"))
    );
    store.close().await.expect("closes");
    std::fs::remove_file("engine_reopen.db").expect("cleanup");
}

#[tokio::test]
async fn it_rejects_an_oversize_transaction() {
    let store = Store::create("engine_oversize.db", 1000)
        .await
        .expect("creates store");
    store
        .transaction(|tx| async move {
            Ok(tx
                .root()
                .set(&Value::from("x"), Value::from("hi"), tx.timestamp()))
        })
        .await
        .expect("small transaction commits");

    let err = store
        .transaction(|tx| async move {
            let mut root = tx.root();
            for i in 0..22 {
                root = root.set(
                    &Value::from(format!("key-{i:02}")),
                    Value::from(i),
                    tx.timestamp(),
                );
            }
            Ok(root)
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::RootBlockTooLarge { .. })
    ));

    // The failed transaction left the committed root untouched
    assert_eq!(
        store.snapshot().get(&Value::from("x"), TIME_MAX),
        Some(Value::from("hi"))
    );
    assert_eq!(store.snapshot().total_size(), 1);
    store.close().await.expect("closes");
    std::fs::remove_file("engine_oversize.db").expect("cleanup");
}

#[tokio::test]
async fn it_alternates_between_the_two_root_slots() {
    let store = Store::create("engine_alternate.db", 1000)
        .await
        .expect("creates store");
    for key in ["first", "second"] {
        store
            .transaction(move |tx| async move {
                Ok(tx
                    .root()
                    .set(&Value::from(key), Value::from(key), tx.timestamp()))
            })
            .await
            .expect("transaction commits");
    }
    store.close().await.expect("closes");

    // Slot 1 holds the first commit, slot 0 the (newer) second one
    let bytes = std::fs::read("engine_alternate.db").expect("reads file");
    let slot_0 = RootBlock::decode(&bytes[..1000], default_registry(), 1000, 0).expect("slot 0");
    let slot_1 =
        RootBlock::decode(&bytes[1000..2000], default_registry(), 1000, 1000).expect("slot 1");
    assert!(slot_0.timestamp > slot_1.timestamp);
    assert_eq!(slot_0.root.total_size(), 2);
    assert_eq!(slot_1.root.total_size(), 1);

    let store = Store::open("engine_alternate.db", 1000)
        .await
        .expect("opens store");
    assert_eq!(store.snapshot().total_size(), 2);
    store.close().await.expect("closes");
    std::fs::remove_file("engine_alternate.db").expect("cleanup");
}

#[test_log::test(tokio::test)]
async fn it_recovers_from_a_torn_root_write() {
    let store = Store::create("engine_torn.db", 1000)
        .await
        .expect("creates store");
    store
        .transaction(|tx| async move {
            Ok(tx
                .root()
                .set(&Value::from("x"), Value::from("hi"), tx.timestamp()))
        })
        .await
        .expect("transaction commits");
    store.close().await.expect("closes");

    // The commit went to slot 1; tear it the way an interrupted write
    // would, by clobbering part of its checksummed content
    let mut bytes = std::fs::read("engine_torn.db").expect("reads file");
    for byte in bytes.iter_mut().skip(1050).take(100) {
        *byte = 0;
    }
    std::fs::write("engine_torn.db", &bytes).expect("writes file");

    // Open falls back to the older root in slot 0 without error
    let store = Store::open("engine_torn.db", 1000)
        .await
        .expect("opens store");
    assert_eq!(store.snapshot().get(&Value::from("x"), TIME_MAX), None);
    assert!(store.snapshot().is_empty(TIME_MAX));
    store.close().await.expect("closes");

    // With slot 0 gone as well there is nothing left to open
    let mut bytes = std::fs::read("engine_torn.db").expect("reads file");
    for byte in bytes.iter_mut().skip(50).take(100) {
        *byte = 0;
    }
    std::fs::write("engine_torn.db", &bytes).expect("writes file");
    let err = Store::open("engine_torn.db", 1000).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::NoValidRoot)
    ));
    std::fs::remove_file("engine_torn.db").expect("cleanup");
}

#[tokio::test]
async fn it_treats_an_unchanged_root_as_a_noop() {
    let store = Store::create("engine_noop.db", 1000)
        .await
        .expect("creates store");
    store
        .transaction(|tx| async move {
            Ok(tx
                .root()
                .set(&Value::from("x"), Value::from("hi"), tx.timestamp()))
        })
        .await
        .expect("transaction commits");

    let before = std::fs::read("engine_noop.db").expect("reads file");
    store
        .transaction(|tx| async move { Ok(tx.root()) })
        .await
        .expect("noop transaction");
    let after = std::fs::read("engine_noop.db").expect("reads file");
    assert_eq!(before, after, "a no-op must not touch the file");
    store.close().await.expect("closes");
    std::fs::remove_file("engine_noop.db").expect("cleanup");
}

#[tokio::test]
async fn it_leaves_the_root_alone_when_a_transaction_fails() {
    let store = Store::create("engine_failed_tx.db", 1000)
        .await
        .expect("creates store");
    store
        .transaction(|tx| async move {
            Ok(tx
                .root()
                .set(&Value::from("x"), Value::from("hi"), tx.timestamp()))
        })
        .await
        .expect("transaction commits");

    let err = store
        .transaction(|tx| async move {
            let _ = tx
                .root()
                .set(&Value::from("y"), Value::from("never"), tx.timestamp());
            Err(anyhow::anyhow!("caller gave up"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "caller gave up");
    assert_eq!(store.snapshot().total_size(), 1);
    store.close().await.expect("closes");
    std::fs::remove_file("engine_failed_tx.db").expect("cleanup");
}

#[tokio::test]
async fn it_round_trips_payload_blocks_inside_transactions() {
    let store = Store::create("engine_blocks.db", 1000)
        .await
        .expect("creates store");
    store
        .transaction(|tx| async move {
            let first = tx.allocate().await?;
            let second = tx.allocate().await?;
            assert_eq!((first, second), (0, 1));
            tx.write_block(first, b"out of line payload").await?;
            let back = tx.read_block(first).await?;
            assert_eq!(&back[..19], b"out of line payload");
            assert_eq!(tx.usage().await?, 2);
            Ok(tx
                .root()
                .set(&Value::from("blocks"), Value::from(2), tx.timestamp()))
        })
        .await
        .expect("transaction commits");

    store
        .transaction(|tx| async move {
            tx.release(1).await?;
            // Staged releases stay live until this transaction commits
            assert_eq!(tx.usage().await?, 2);
            Ok(tx
                .root()
                .set(&Value::from("blocks"), Value::from(1), tx.timestamp()))
        })
        .await
        .expect("transaction commits");

    store
        .transaction(|tx| async move {
            assert_eq!(tx.usage().await?, 1);
            // The released block number is handed out again
            assert_eq!(tx.allocate().await?, 1);
            Ok(tx
                .root()
                .set(&Value::from("blocks"), Value::from(2), tx.timestamp()))
        })
        .await
        .expect("transaction commits");
    store.close().await.expect("closes");
    std::fs::remove_file("engine_blocks.db").expect("cleanup");
}

#[tokio::test]
async fn it_rejects_privileged_calls_outside_the_transaction() {
    let store = Store::create("engine_privilege.db", 1000)
        .await
        .expect("creates store");
    let (smuggle, retrieve) = oneshot::channel();
    store
        .transaction(move |tx| async move {
            let root = tx.root();
            let _ = smuggle.send(tx);
            Ok(root)
        })
        .await
        .expect("noop transaction");

    let tx = retrieve.await.expect("smuggled handle");
    let err = tx.allocate().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::PrivilegeViolation)
    ));
    let err = tx.read_block(0).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::PrivilegeViolation)
    ));
    store.close().await.expect("closes");
    std::fs::remove_file("engine_privilege.db").expect("cleanup");
}

#[tokio::test]
async fn it_assigns_strictly_increasing_timestamps() {
    let store = Store::create("engine_timestamps.db", 1000)
        .await
        .expect("creates store");
    for _ in 0..3 {
        store
            .transaction(|tx| async move {
                Ok(tx
                    .root()
                    .add(&Value::from("k"), Value::from(0), tx.timestamp()))
            })
            .await
            .expect("transaction commits");
    }
    let history = store
        .snapshot()
        .history(&Value::from("k"))
        .expect("key has history");
    let stamps: Vec<Timestamp> = history.entries().map(|e| e.created_at).collect();
    assert_eq!(stamps.len(), 3);
    assert!(stamps[0] < stamps[1] && stamps[1] < stamps[2]);
    store.close().await.expect("closes");
    std::fs::remove_file("engine_timestamps.db").expect("cleanup");
}

#[tokio::test]
async fn it_refuses_transactions_after_close() {
    let store = Store::create("engine_closed.db", 1000)
        .await
        .expect("creates store");
    store.close().await.expect("closes");
    store.close().await.expect("close is idempotent");
    let err = store
        .transaction(|tx| async move { Ok(tx.root()) })
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Closed)
    ));
    std::fs::remove_file("engine_closed.db").expect("cleanup");
}

#[tokio::test]
async fn it_keeps_old_snapshots_readable_across_commits() {
    let store = Store::create("engine_snapshots.db", 1000)
        .await
        .expect("creates store");
    store
        .transaction(|tx| async move {
            Ok(tx
                .root()
                .set(&Value::from("k"), Value::from("old"), tx.timestamp()))
        })
        .await
        .expect("transaction commits");
    let old = store.snapshot();
    let old_time = store.timestamp();

    store
        .transaction(|tx| async move {
            Ok(tx
                .root()
                .set(&Value::from("k"), Value::from("new"), tx.timestamp()))
        })
        .await
        .expect("transaction commits");

    // The old handle still answers from its own point in time
    assert_eq!(
        old.get(&Value::from("k"), old_time),
        Some(Value::from("old"))
    );
    // And the new root can look back at history
    assert_eq!(
        store.snapshot().get(&Value::from("k"), old_time),
        Some(Value::from("old"))
    );
    assert_eq!(
        store.snapshot().get(&Value::from("k"), TIME_MAX),
        Some(Value::from("new"))
    );
    store.close().await.expect("closes");
    std::fs::remove_file("engine_snapshots.db").expect("cleanup");
}
