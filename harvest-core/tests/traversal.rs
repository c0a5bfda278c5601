mod support;

use std::sync::Arc;

use harvest_core::connector::PushStatus;
use harvest_core::store::{ConnectorStore, GenerationalStateStore, InMemoryStore, Slot};
use harvest_core::{BatchOutcome, DelayPolicy, HarvestError, QueryTraverser};
use support::{Call, Entry, FlakyStore, Gate, RecordingSink, ScriptedRepository, docs, numbered};
use tokio_util::sync::CancellationToken;

struct Harness {
    backing: Arc<dyn ConnectorStore>,
    store: Arc<GenerationalStateStore>,
    repository: Arc<ScriptedRepository>,
    sink: Arc<RecordingSink>,
    traverser: QueryTraverser,
}

fn harness(name: &str, repository: ScriptedRepository, sink: RecordingSink) -> Harness {
    harness_with_store(name, repository, sink, Arc::new(InMemoryStore::new()))
}

fn harness_with_store(
    name: &str,
    repository: ScriptedRepository,
    sink: RecordingSink,
    backing: Arc<dyn ConnectorStore>,
) -> Harness {
    let store = Arc::new(GenerationalStateStore::new(Arc::clone(&backing)));
    let repository = Arc::new(repository);
    let sink = Arc::new(sink);
    let traverser = QueryTraverser::new(
        name,
        repository.clone(),
        sink.clone(),
        Arc::clone(&store),
    );
    Harness {
        backing,
        store,
        repository,
        sink,
        traverser,
    }
}

impl Harness {
    async fn run(&self, batch_hint: usize) -> BatchOutcome {
        self.traverser
            .run_batch(batch_hint, &CancellationToken::new())
            .await
            .expect("valid batch hint")
    }

    async fn stored_checkpoint(&self) -> Option<String> {
        self.backing
            .get(self.traverser.connector_name(), Slot::Checkpoint)
            .await
            .expect("backing get")
    }
}

#[tokio::test]
async fn skips_a_malformed_document_and_checkpoints() {
    let mut entries = docs(&["a"]);
    entries.push(Entry::Bad("b".into()));
    entries.extend(docs(&["c", "d"]));
    let h = harness("conn", ScriptedRepository::new(entries), RecordingSink::new());

    let outcome = h.run(10).await;

    assert_eq!(outcome, BatchOutcome::Processed(3));
    assert_eq!(h.sink.taken_ids(), vec!["a", "c", "d"]);
    assert_eq!(h.stored_checkpoint().await.as_deref(), Some("4"));
    assert_eq!(h.repository.batch_hints(), vec![10]);
}

#[tokio::test]
async fn document_rejected_by_sink_is_skipped() {
    let h = harness(
        "conn",
        ScriptedRepository::new(docs(&["a", "b", "c"])),
        RecordingSink::new().rejecting("b"),
    );

    assert_eq!(h.run(10).await, BatchOutcome::Processed(2));
    assert_eq!(h.sink.taken_ids(), vec!["a", "c"]);
    assert_eq!(h.stored_checkpoint().await.as_deref(), Some("3"));
}

#[tokio::test]
async fn successive_batches_resume_from_the_previous_checkpoint() {
    let h = harness("conn", ScriptedRepository::new(numbered(10)), RecordingSink::new());

    assert_eq!(h.run(3).await, BatchOutcome::Processed(3));
    assert_eq!(h.run(3).await, BatchOutcome::Processed(3));
    assert_eq!(h.run(3).await, BatchOutcome::Processed(3));

    assert_eq!(
        h.repository.calls(),
        vec![
            Call::Start,
            Call::Resume("3".into()),
            Call::Resume("6".into()),
        ]
    );
    assert_eq!(h.stored_checkpoint().await.as_deref(), Some("9"));
    assert_eq!(h.sink.taken_ids().len(), 9);
}

#[tokio::test]
async fn transport_failure_leaves_checkpoint_untouched() {
    let h = harness(
        "conn",
        ScriptedRepository::new(numbered(8)),
        RecordingSink::new().failing_transport_after(4),
    );
    assert_eq!(h.run(2).await, BatchOutcome::Processed(2));
    assert_eq!(h.stored_checkpoint().await.as_deref(), Some("2"));

    let outcome = h.run(5).await;

    assert_eq!(outcome, BatchOutcome::ForceWait);
    assert_eq!(outcome.delay_policy(), DelayPolicy::Error);
    assert_eq!(h.sink.taken_ids().len(), 4);
    assert_eq!(h.stored_checkpoint().await.as_deref(), Some("2"));
}

#[tokio::test]
async fn resource_exhaustion_ends_the_batch_but_keeps_progress() {
    let mut entries = docs(&["a", "b"]);
    entries.push(Entry::Exhausted);
    entries.extend(docs(&["c"]));
    let h = harness("conn", ScriptedRepository::new(entries), RecordingSink::new());

    assert_eq!(h.run(10).await, BatchOutcome::Processed(2));
    assert_eq!(h.stored_checkpoint().await.as_deref(), Some("2"));
}

#[tokio::test]
async fn repository_failure_before_any_progress_forces_a_wait() {
    let h = harness(
        "conn",
        ScriptedRepository::new(vec![Entry::Fail]),
        RecordingSink::new(),
    );

    assert_eq!(h.run(10).await, BatchOutcome::ForceWait);
    assert_eq!(h.stored_checkpoint().await, None);
}

#[tokio::test]
async fn repository_failure_after_progress_reports_the_count() {
    let mut entries = docs(&["a", "b"]);
    entries.push(Entry::Fail);
    let h = harness("conn", ScriptedRepository::new(entries), RecordingSink::new());

    let outcome = h.run(10).await;
    assert_eq!(outcome, BatchOutcome::Interrupted(2));
    assert_eq!(outcome.documents(), 2);
    assert_eq!(outcome.delay_policy(), DelayPolicy::Error);
    assert_eq!(h.stored_checkpoint().await, None);
}

#[tokio::test]
async fn empty_repository_forces_a_wait() {
    let h = harness("conn", ScriptedRepository::new(Vec::new()), RecordingSink::new());

    assert_eq!(h.run(10).await, BatchOutcome::ForceWait);
    assert_eq!(h.repository.calls(), vec![Call::Start]);
}

#[tokio::test]
async fn sink_backpressure_stops_early_and_checkpoints() {
    let h = harness(
        "conn",
        ScriptedRepository::new(docs(&["a", "b", "c", "d"])),
        RecordingSink::new().with_status("b", PushStatus::FeedBacklog),
    );

    assert_eq!(h.run(10).await, BatchOutcome::Processed(2));
    assert_eq!(h.stored_checkpoint().await.as_deref(), Some("2"));
}

#[tokio::test]
async fn flush_failure_discards_the_batch() {
    let h = harness(
        "conn",
        ScriptedRepository::new(docs(&["a", "b"])),
        RecordingSink::new().failing_flush(),
    );

    assert_eq!(h.run(10).await, BatchOutcome::ForceWait);
    assert_eq!(h.sink.flushes(), 1);
    assert_eq!(h.stored_checkpoint().await, None);
}

#[tokio::test]
async fn checkpoint_failure_forces_a_wait() {
    let h = harness(
        "conn",
        ScriptedRepository::new(docs(&["a"])).failing_checkpoint(),
        RecordingSink::new(),
    );

    assert_eq!(h.run(10).await, BatchOutcome::ForceWait);
    assert_eq!(h.stored_checkpoint().await, None);
}

#[tokio::test]
async fn store_write_failure_forces_a_wait() {
    let flaky = Arc::new(FlakyStore::default());
    let h = harness_with_store(
        "conn",
        ScriptedRepository::new(docs(&["a"])),
        RecordingSink::new(),
        flaky.clone(),
    );
    flaky.fail_puts(true);

    assert_eq!(h.run(10).await, BatchOutcome::ForceWait);
}

#[tokio::test]
async fn zero_batch_hint_is_rejected() {
    let h = harness("conn", ScriptedRepository::new(numbered(3)), RecordingSink::new());

    let err = h
        .traverser
        .run_batch(0, &CancellationToken::new())
        .await
        .expect_err("zero hint");

    assert!(matches!(err, HarvestError::InvalidArgument(_)));
    assert!(h.repository.calls().is_empty());
}

#[tokio::test]
async fn cancelled_before_start_does_not_touch_the_repository() {
    let h = harness("conn", ScriptedRepository::new(numbered(3)), RecordingSink::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = h.traverser.run_batch(5, &cancel).await.expect("run");

    assert_eq!(outcome, BatchOutcome::Processed(0));
    assert!(h.repository.calls().is_empty());
}

#[tokio::test]
async fn cancellation_mid_batch_checkpoints_partial_progress() {
    let gate = Gate::new(2);
    let h = harness(
        "conn",
        ScriptedRepository::new(numbered(10)).with_gate(gate.clone()),
        RecordingSink::new(),
    );
    let cancel = CancellationToken::new();

    let (outcome, ()) = tokio::join!(h.traverser.run_batch(10, &cancel), async {
        gate.wait_reached().await;
        cancel.cancel();
        gate.release();
    });

    // The document read while paused is still pushed before the loop
    // observes the cancellation.
    assert_eq!(outcome.expect("run"), BatchOutcome::Processed(3));
    assert_eq!(h.stored_checkpoint().await.as_deref(), Some("3"));
}

#[tokio::test]
async fn removing_foo_mid_batch_disables_its_checkpoint_write() {
    let gate = Gate::new(1);
    let h = harness(
        "foo",
        ScriptedRepository::new(numbered(3)).with_gate(gate.clone()),
        RecordingSink::new(),
    );
    h.store
        .put_checkpoint("foo", "0".into())
        .await
        .expect("seed checkpoint");
    let admin = GenerationalStateStore::new(Arc::clone(&h.backing));

    let (outcome, generation) = tokio::join!(h.run(10), async {
        gate.wait_reached().await;
        let generation = admin.remove("foo").await.expect("remove foo");
        gate.release();
        generation
    });

    assert_eq!(generation, 1);
    assert_eq!(outcome, BatchOutcome::Processed(3));
    assert_eq!(h.stored_checkpoint().await, None);
    let err = h
        .store
        .put_checkpoint("foo", "3".into())
        .await
        .expect_err("stale write");
    assert!(err.is_store_disabled());
}

#[tokio::test]
async fn stale_store_forces_a_wait_before_traversal() {
    let h = harness("conn", ScriptedRepository::new(numbered(3)), RecordingSink::new());
    assert_eq!(h.run(1).await, BatchOutcome::Processed(1));

    h.store.new_generation("conn").await.expect("bump");

    assert_eq!(h.run(1).await, BatchOutcome::ForceWait);
    assert_eq!(h.repository.calls(), vec![Call::Start]);
}
