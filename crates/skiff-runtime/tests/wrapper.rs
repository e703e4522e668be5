//! Wrapper scenarios: initialization, conflict retries, transactions.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::{seed_credits, BrokenSnapshotLedger, ContendedDriver, Ledger, LedgerEvent};

use skiff_projection::{
    frame_snapshot, MemorySnapshotStore, Projection, SnapshotHeader, SnapshotStore,
};
use skiff_runtime::{AppendError, EventStreamWrapper, WrapperConfig, WrapperError};
use skiff_store_memory::MemoryDriver;

fn wrapper_over(driver: Arc<dyn skiff_store_core::StorageDriver>) -> EventStreamWrapper<Ledger> {
    EventStreamWrapper::msgpack(
        driver,
        Arc::new(Ledger),
        Arc::new(MemorySnapshotStore::new()),
        WrapperConfig::default(),
    )
}

#[tokio::test]
async fn initialization_replays_the_whole_log() {
    let driver = MemoryDriver::new();
    seed_credits(&driver, 100).await;

    let mut wrapper = wrapper_over(Arc::new(driver));
    wrapper.initialize().await.unwrap();
    assert_eq!(wrapper.sequence(), 100);
    assert_eq!(wrapper.state().balance, 100);
    assert_eq!(wrapper.state().entries, 100);
}

#[tokio::test]
async fn initialization_resumes_from_a_snapshot() {
    let driver = MemoryDriver::new();
    seed_credits(&driver, 10).await;

    let snapshots = Arc::new(MemorySnapshotStore::new());
    let mut first = EventStreamWrapper::msgpack(
        Arc::new(driver.clone()),
        Arc::new(Ledger),
        Arc::clone(&snapshots) as Arc<dyn SnapshotStore>,
        WrapperConfig::default(),
    );
    first.initialize().await.unwrap();
    assert!(first.try_save().await.unwrap());

    // More events land after the snapshot.
    seed_credits(&driver, 5).await;

    let mut second = EventStreamWrapper::msgpack(
        Arc::new(driver),
        Arc::new(Ledger),
        snapshots,
        WrapperConfig::default(),
    );
    second.initialize().await.unwrap();
    assert_eq!(second.sequence(), 15);
    assert_eq!(second.state().balance, 15);
}

#[tokio::test]
async fn snapshot_ahead_of_the_log_resets_to_initial() {
    let driver = MemoryDriver::new();
    seed_credits(&driver, 100).await;

    // A snapshot claiming sequence 101 against a log that ends at 100:
    // cache for a different log, or corruption. Either way it must not be
    // trusted.
    let snapshots = MemorySnapshotStore::new();
    let rogue_state = common::LedgerState { balance: 9_999, entries: 101 };
    let header = SnapshotHeader {
        name: "ledger".into(),
        state_type: Ledger.state_type().to_string(),
        sequence: 101,
    };
    let bytes = frame_snapshot(&header, &rmp_serde::to_vec_named(&rogue_state).unwrap()).unwrap();
    snapshots.try_write("ledger", &bytes).await.unwrap();

    let mut wrapper = EventStreamWrapper::msgpack(
        Arc::new(driver),
        Arc::new(Ledger),
        Arc::new(snapshots),
        WrapperConfig::default(),
    );
    wrapper.initialize().await.unwrap();

    // The rogue snapshot was discarded and the log replayed from scratch.
    assert_eq!(wrapper.sequence(), 100);
    assert_eq!(wrapper.state().balance, 100);
    assert!(!wrapper.possibly_inconsistent());
}

#[tokio::test]
async fn conflicted_append_retries_with_fresh_state() {
    let driver = ContendedDriver::new(MemoryDriver::new(), 1);
    let mut wrapper = wrapper_over(Arc::new(driver));
    wrapper.initialize().await.unwrap();

    let builder_runs = AtomicU32::new(0);
    let result = wrapper
        .append_events_with(|state| {
            builder_runs.fetch_add(1, Ordering::SeqCst);
            // Base the appended amount on what the state says right now.
            (vec![LedgerEvent::Credit(state.balance + 1)], state.balance)
        })
        .await
        .unwrap();

    // First attempt lost to the injected rival; the second saw its credit.
    assert_eq!(builder_runs.load(Ordering::SeqCst), 2);
    assert_eq!(result.count, 1);
    assert_eq!(result.first_sequence, 2);
    assert_eq!(result.extra, 1_000);
    assert_eq!(wrapper.state().balance, 1_000 + 1_001);
    assert_eq!(wrapper.sequence(), 2);
}

#[tokio::test]
async fn unconditional_append_surfaces_conflicts() {
    let driver = ContendedDriver::new(MemoryDriver::new(), 1);
    let mut wrapper = wrapper_over(Arc::new(driver));
    wrapper.initialize().await.unwrap();

    let error = wrapper
        .append_events(vec![LedgerEvent::Credit(5)])
        .await
        .unwrap_err();
    assert!(matches!(error, AppendError::Conflict { attempts: 1 }));

    // The rival's event is all that landed.
    wrapper.catch_up().await.unwrap();
    assert_eq!(wrapper.state().entries, 1);
}

#[tokio::test]
async fn rejected_pre_apply_writes_nothing() {
    let driver = MemoryDriver::new();
    let mut wrapper = wrapper_over(Arc::new(driver.clone()));
    wrapper.initialize().await.unwrap();

    let error = wrapper
        .append_events(vec![LedgerEvent::Credit(1), LedgerEvent::Poison])
        .await
        .unwrap_err();
    assert!(matches!(error, AppendError::Projection(_)));

    // Nothing reached the log, committed state is untouched.
    use skiff_store_core::StorageDriver;
    assert_eq!(driver.position().await.unwrap(), 0);
    assert_eq!(wrapper.state().entries, 0);
    assert!(!wrapper.possibly_inconsistent());
}

#[tokio::test]
async fn poisoned_events_are_quarantined_during_catch_up() {
    let driver = MemoryDriver::new();
    {
        let mut stream =
            skiff_stream::EventStream::<LedgerEvent>::msgpack(Arc::new(driver.clone()));
        stream
            .write(&[
                LedgerEvent::Credit(1),
                LedgerEvent::Poison,
                LedgerEvent::Credit(2),
            ])
            .await
            .unwrap()
            .expect("seed accepted");
    }

    let mut wrapper = wrapper_over(Arc::new(driver));
    wrapper.initialize().await.unwrap();

    // Catch-up did not abort: the clean events applied around the poison.
    assert_eq!(wrapper.state().balance, 3);
    assert_eq!(wrapper.sequence(), 3);
    assert!(wrapper.possibly_inconsistent());
    assert_eq!(wrapper.quarantine().len(), 1);
    assert_eq!(wrapper.quarantine().entries().next().unwrap().sequence, 2);

    // A possibly inconsistent projection refuses to snapshot.
    assert!(!wrapper.try_save().await.unwrap());
}

#[tokio::test]
async fn transactions_accumulate_against_pending_state() {
    let driver = MemoryDriver::new();
    let mut wrapper = wrapper_over(Arc::new(driver));
    wrapper.initialize().await.unwrap();

    let committed = Arc::new(AtomicU32::new(0));
    let committed_in_hook = Arc::clone(&committed);
    let balance = wrapper
        .transaction(move |tx| {
            tx.add(LedgerEvent::Credit(10))?;
            // The pending credit is visible to the body right away.
            anyhow::ensure!(tx.state().balance == 10);
            tx.add(LedgerEvent::Credit(tx.state().balance))?;
            let committed = Arc::clone(&committed_in_hook);
            tx.on_commit(move || {
                committed.fetch_add(1, Ordering::SeqCst);
            });
            Ok(tx.state().balance)
        })
        .await
        .unwrap();

    assert_eq!(balance, 20);
    assert_eq!(wrapper.state().balance, 20);
    assert_eq!(committed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn aborted_transactions_commit_nothing_but_return_their_value() {
    let driver = MemoryDriver::new();
    let mut wrapper = wrapper_over(Arc::new(driver.clone()));
    wrapper.initialize().await.unwrap();

    let aborted = Arc::new(AtomicU32::new(0));
    let aborted_in_hook = Arc::clone(&aborted);
    let value = wrapper
        .transaction(move |tx| {
            tx.add(LedgerEvent::Credit(42))?;
            tx.abort();
            let aborted = Arc::clone(&aborted_in_hook);
            tx.on_abort(move || {
                aborted.fetch_add(1, Ordering::SeqCst);
            });
            Ok("still returned")
        })
        .await
        .unwrap();

    assert_eq!(value, "still returned");
    assert_eq!(aborted.load(Ordering::SeqCst), 1);
    use skiff_store_core::StorageDriver;
    assert_eq!(driver.position().await.unwrap(), 0);
    assert_eq!(wrapper.state().balance, 0);
}

#[tokio::test]
async fn transaction_body_errors_propagate_without_writing() {
    let driver = MemoryDriver::new();
    let mut wrapper = wrapper_over(Arc::new(driver.clone()));
    wrapper.initialize().await.unwrap();

    let error = wrapper
        .transaction(|tx| -> anyhow::Result<()> {
            tx.add(LedgerEvent::Credit(1))?;
            anyhow::bail!("caller changed its mind");
        })
        .await
        .unwrap_err();
    assert!(matches!(error, AppendError::Projection(_)));

    use skiff_store_core::StorageDriver;
    assert_eq!(driver.position().await.unwrap(), 0);
    assert_eq!(wrapper.state().balance, 0);
}

#[tokio::test]
async fn listeners_observe_committed_events_from_their_minimum() {
    let driver = MemoryDriver::new();
    seed_credits(&driver, 4).await;

    let mut wrapper = wrapper_over(Arc::new(driver));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    wrapper.subscribe(3, move |sequence, _event: &LedgerEvent| {
        sink.lock().unwrap().push(sequence);
    });
    wrapper.initialize().await.unwrap();

    wrapper
        .append_events(vec![LedgerEvent::Credit(1)])
        .await
        .unwrap();

    // Catch-up delivered 3 and 4; the append delivered 5; 1 and 2 stayed
    // below the minimum and nothing fired twice.
    assert_eq!(*seen.lock().unwrap(), vec![3, 4, 5]);
}

#[tokio::test]
async fn broken_snapshot_round_trip_fails_initialization_loudly() {
    let driver = MemoryDriver::new();
    seed_credits(&driver, 8).await;

    let mut wrapper = EventStreamWrapper::msgpack(
        Arc::new(driver),
        Arc::new(BrokenSnapshotLedger),
        Arc::new(MemorySnapshotStore::new()),
        WrapperConfig { events_between_cache_saves: 4, append_retries: 10 },
    );
    let error = wrapper.initialize().await.unwrap_err();
    assert!(matches!(error, WrapperError::Fatal(_)));
}
