//! Runner behavior against the in-memory writer and checkpoint store

mod common;

use common::{
    account, init_test_tracing, memory_destination, page, CursorSource, ScriptedSource, Step,
};
use connsync_common::{Checkpoint, DataOp, ErrorKind};
use connsync_engine::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use connsync_engine::destination::MemoryWriter;
use connsync_engine::runner::{Runner, RunnerConfig, SyncInstance};
use connsync_engine::source::Page;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INSTANCE: &str = "conn_test";

fn instance() -> SyncInstance {
    SyncInstance::new(INSTANCE, None)
}

fn runner() -> Runner {
    Runner::new(RunnerConfig::default())
}

// ============================================================================
// Concrete Scenarios
// ============================================================================

#[tokio::test]
async fn test_single_account_row() {
    init_test_tracing();
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::pages(vec![page(
        vec![account("1", "Acme")],
        Some(("account", json!({"cursor": "c1"}))),
    )]);

    let result = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert!(result.is_success(), "{:?}", result);
    assert_eq!(result.records_processed, 1);
    assert_eq!(result.commits, 1);

    let row = writer.row("account", "reso_test", "1").unwrap();
    assert_eq!(row.unified, json!({"id": "1", "name": "Acme"}));
    assert_eq!(
        store.snapshot(INSTANCE).unwrap().cursor("account"),
        Some(&json!({"cursor": "c1"}))
    );
}

#[tokio::test]
async fn test_flush_failure_then_retry() {
    let writer = MemoryWriter::new();
    writer.fail_next_writes(1);
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::pages(vec![page(
        vec![account("1", "Acme")],
        Some(("account", json!({"cursor": "c1"}))),
    )]);

    let failed = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;
    assert_eq!(failed.error, Some(ErrorKind::DestinationWrite));
    assert_eq!(failed.commits, 0);
    assert_eq!(failed.records_processed, 0);
    assert_eq!(writer.count("account"), 0);
    assert!(store.snapshot(INSTANCE).is_none());

    let retried = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;
    assert!(retried.is_success());
    assert_eq!(writer.count("account"), 1);
    assert_eq!(source.contexts(), vec![Checkpoint::new(), Checkpoint::new()]);
    assert!(store.snapshot(INSTANCE).is_some());
}

#[tokio::test]
async fn test_duplicate_identity_in_batch_last_write_wins() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::pages(vec![page(
        vec![account("1", "Acme"), account("1", "Acme Corp")],
        None,
    )]);

    let result = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert!(result.is_success());
    assert_eq!(writer.count("account"), 1);
    let row = writer.row("account", "reso_test", "1").unwrap();
    assert_eq!(row.unified["name"], "Acme Corp");
    assert_eq!(row.writes, 1);
}

// ============================================================================
// Protocol Properties
// ============================================================================

#[tokio::test]
async fn test_replay_yields_same_state() {
    let pages = vec![
        page(
            vec![account("1", "Acme"), account("2", "Globex")],
            Some(("account", json!({"cursor": "p1"}))),
        ),
        page(
            vec![account("2", "Globex Inc"), account("3", "Initech")],
            Some(("account", json!({"cursor": "p2"}))),
        ),
    ];
    let source = ScriptedSource::pages(pages);
    let writer = MemoryWriter::new();

    // Fresh stores make each run replay the full script
    runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &MemoryCheckpointStore::new())
        .await;
    let first: Vec<_> = writer.rows("account").into_iter().map(|r| (r.id, r.unified)).collect();

    runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &MemoryCheckpointStore::new())
        .await;
    let second: Vec<_> = writer.rows("account").into_iter().map(|r| (r.id, r.unified)).collect();

    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_checkpoint_advances_in_commit_order() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::pages(
        (1..=3)
            .map(|i| {
                page(
                    vec![account(&i.to_string(), "Acme")],
                    Some(("account", json!({"cursor": i}))),
                )
            })
            .collect(),
    );

    let result = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert_eq!(result.commits, 3);
    let cursors: Vec<_> = store
        .history(INSTANCE)
        .iter()
        .map(|c| c.cursor("account").cloned().unwrap())
        .collect();
    assert_eq!(cursors, vec![json!({"cursor": 1}), json!({"cursor": 2}), json!({"cursor": 3})]);
}

#[tokio::test]
async fn test_failed_commit_keeps_previous_checkpoint() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::pages(vec![
        page(vec![account("1", "Acme")], Some(("account", json!({"cursor": 1})))),
        page(vec![DataOp::new("transaction", "t1", json!({"amount": 10}))], Some(("transaction", json!({"cursor": 1})))),
    ]);
    writer.fail_on_collection("transaction");

    let result = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert_eq!(result.error, Some(ErrorKind::DestinationWrite));
    assert_eq!(result.commits, 1);
    let checkpoint = store.snapshot(INSTANCE).unwrap();
    assert_eq!(checkpoint.cursor("account"), Some(&json!({"cursor": 1})));
    assert_eq!(checkpoint.cursor("transaction"), None);
}

#[tokio::test]
async fn test_commit_is_atomic_across_collections() {
    let writer = MemoryWriter::new();
    writer.fail_on_collection("transaction");
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::pages(vec![page(
        vec![
            account("1", "Acme"),
            DataOp::new("transaction", "t1", json!({"amount": 10})),
        ],
        Some(("account", json!({"cursor": 1}))),
    )]);

    let result = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert_eq!(result.error, Some(ErrorKind::DestinationWrite));
    assert_eq!(writer.count("account"), 0);
    assert_eq!(writer.count("transaction"), 0);
    assert!(store.snapshot(INSTANCE).is_none());
}

#[tokio::test]
async fn test_resume_after_transient_failure() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let source = CursorSource::new(10, 3).fail_at_page(2);

    let first = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;
    assert_eq!(first.error, Some(ErrorKind::TransientSource));
    assert_eq!(first.commits, 2);
    assert_eq!(first.records_processed, 6);
    assert_eq!(
        store.snapshot(INSTANCE).unwrap().cursor("account"),
        Some(&json!({"offset": 6}))
    );

    let second = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;
    assert!(second.is_success());
    assert_eq!(second.records_processed, 4);
    assert_eq!(writer.count("account"), 10);
    assert_eq!(
        store.snapshot(INSTANCE).unwrap().cursor("account"),
        Some(&json!({"offset": 10}))
    );
}

#[tokio::test]
async fn test_next_page_pulled_only_after_flush() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::pages(
        (0..3)
            .map(|i| page(vec![account(&i.to_string(), "Acme")], None))
            .collect(),
    )
    .observing(&writer);

    runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert_eq!(source.pulls(), vec![0, 1, 2]);
}

// ============================================================================
// Checkpoint Handling
// ============================================================================

#[tokio::test]
async fn test_source_receives_stored_checkpoint() {
    let seeded: Checkpoint = [("contact", json!({"cursor": "x"}))].into_iter().collect();
    let store = MemoryCheckpointStore::with_checkpoint(INSTANCE, seeded.clone());
    let writer = MemoryWriter::new();
    let source = ScriptedSource::pages(vec![page(
        vec![account("1", "Acme")],
        Some(("account", json!({"cursor": "a"}))),
    )]);

    runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert_eq!(source.contexts(), vec![seeded]);
    let stored = store.snapshot(INSTANCE).unwrap();
    assert_eq!(stored.cursor("contact"), Some(&json!({"cursor": "x"})));
    assert_eq!(stored.cursor("account"), Some(&json!({"cursor": "a"})));
}

#[tokio::test]
async fn test_unchanged_checkpoint_not_rewritten() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::pages(vec![page(vec![account("1", "Acme")], None)]);

    let result = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert_eq!(result.commits, 1);
    assert_eq!(writer.count("account"), 1);
    assert!(store.history(INSTANCE).is_empty());
}

#[tokio::test]
async fn test_checkpoint_failure_redelivers_page() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    store.fail_next_sets(1);
    let source = ScriptedSource::pages(vec![page(
        vec![account("1", "Acme")],
        Some(("account", json!({"cursor": 1}))),
    )]);

    let failed = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;
    assert_eq!(failed.error, Some(ErrorKind::CheckpointPersist));
    assert_eq!(writer.count("account"), 1);
    assert!(store.get(INSTANCE).await.unwrap().is_none());

    let retried = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;
    assert!(retried.is_success());
    assert_eq!(writer.count("account"), 1);
    assert_eq!(writer.row("account", "reso_test", "1").unwrap().writes, 2);
}

// ============================================================================
// Failures and Limits
// ============================================================================

#[tokio::test]
async fn test_transient_source_failure_writes_nothing() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::new(vec![Step::Fail(ErrorKind::TransientSource)]);

    let result = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert_eq!(result.error, Some(ErrorKind::TransientSource));
    assert!(result.error.unwrap().is_retryable());
    assert_eq!(writer.write_count(), 0);
}

#[tokio::test]
async fn test_malformed_records_are_skipped() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let mut first = Page::new();
    first.push_record("contact", "id", json!({"id": "c1", "name": "Ann"}));
    first.push_record("contact", "id", json!({"name": "no id"}));
    first.push_record("contact", "id", json!({"id": 42, "name": "Bob"}));
    first.set_state("contact", json!({"cursor": null}));
    let source = ScriptedSource::pages(vec![first]);

    let result = runner()
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert!(result.is_success());
    assert_eq!(result.records_processed, 2);
    assert_eq!(result.records_skipped, 1);
    assert!(writer.row("contact", "reso_test", "42").is_some());
}

#[tokio::test]
async fn test_pending_bound_is_fatal() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::pages(vec![page(
        (0..5).map(|i| account(&i.to_string(), "Acme")).collect(),
        None,
    )]);
    let runner = Runner::new(RunnerConfig {
        max_pending_records: 3,
        ..RunnerConfig::default()
    });

    let result = runner
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert_eq!(result.error, Some(ErrorKind::FatalConfiguration));
    assert!(!result.error.unwrap().is_retryable());
    assert_eq!(writer.write_count(), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_while_waiting_for_page() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::new(vec![
        Step::Page(page(vec![account("1", "Acme")], Some(("account", json!({"cursor": 1}))))),
        Step::Hang,
    ]);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = runner()
        .with_cancellation(token)
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert_eq!(result.error, Some(ErrorKind::Cancelled));
    assert_eq!(result.commits, 1);
    assert_eq!(writer.count("account"), 1);
    assert_eq!(
        store.snapshot(INSTANCE).unwrap().cursor("account"),
        Some(&json!({"cursor": 1}))
    );
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let writer = MemoryWriter::new();
    let store = MemoryCheckpointStore::new();
    let source = ScriptedSource::pages(vec![page(vec![account("1", "Acme")], None)]);
    let token = CancellationToken::new();
    token.cancel();

    let result = runner()
        .with_cancellation(token)
        .run(&instance(), &source, &mut memory_destination(&writer), &store)
        .await;

    assert_eq!(result.error, Some(ErrorKind::Cancelled));
    assert_eq!(result.commits, 0);
    assert_eq!(writer.write_count(), 0);
}
