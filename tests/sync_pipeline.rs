mod common;

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{block, para, page, ts, workspace, BagOfWords, Gated, Harness, DIM};
use notion_index::config::RetrievalConfig;
use notion_index::retrieve::Retriever;
use notion_index::retry::RetryPolicy;
use notion_index::sync::{SyncOrchestrator, SyncState};
use notion_index_core::models::NodeKind;
use notion_index_core::store::VectorIndex;
use notion_index_core::Error;

const DOCS: [&str; 5] = ["deploy", "faq", "oncall", "pets", "root"];

#[tokio::test]
async fn test_first_sync_indexes_every_page() {
    let h = Harness::new(workspace());
    let report = h.orchestrator().run_sync("root").await.unwrap();

    assert_eq!(report.added, 5);
    assert_eq!(report.updated + report.deleted + report.unchanged, 0);
    assert!(report.failed.is_empty());
    assert!(report.checkpoint_written);
    assert_eq!(h.indexed_nodes(), DOCS);

    let cp = h.checkpoints().load().await.unwrap().unwrap();
    assert_eq!(cp.resource_root_id, "root");
    assert_eq!(cp.node_version_map.len(), 5);
    assert_eq!(cp.node_version_map["faq"], ts(5));
}

#[tokio::test]
async fn test_resync_without_changes_makes_no_mutations() {
    let h = Harness::new(workspace());
    h.orchestrator().run_sync("root").await.unwrap();
    let mutations = h.index.mutations();
    let embedded = h.embedder.texts_embedded.load(Ordering::SeqCst);

    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.unchanged, 5);
    assert_eq!(report.added + report.updated + report.deleted, 0);
    assert_eq!(h.index.mutations(), mutations);
    assert_eq!(h.embedder.texts_embedded.load(Ordering::SeqCst), embedded);
}

#[tokio::test]
async fn test_unchanged_page_content_is_not_fetched() {
    let h = Harness::new(workspace());
    h.orchestrator().run_sync("root").await.unwrap();
    // One walk serves both discovery and extraction
    for id in ["root", "oncall", "oncall-t", "deploy"] {
        assert_eq!(h.source.list_calls(id), 1, "{}", id);
    }

    h.orchestrator().run_sync("root").await.unwrap();
    h.orchestrator().run_sync("root").await.unwrap();
    for id in ["root", "oncall", "oncall-t", "deploy"] {
        assert_eq!(h.source.list_calls(id), 1, "{}", id);
    }
    let cp = h.checkpoints().load().await.unwrap().unwrap();
    assert_eq!(cp.child_containers["root"], vec!["deploy", "oncall", "pets", "db"]);
    assert!(cp.child_containers["oncall"].is_empty());
}

#[tokio::test]
async fn test_pages_nested_in_blocks_are_indexed() {
    let source = workspace();
    source.insert(page("runbook", Some("oncall-t"), "Runbook", 6));
    source.insert(para("runbook-1", "runbook", "restart the queue workers first"));
    source.insert(block(
        "cols",
        "deploy",
        NodeKind::Unsupported {
            block_type: "column_list".into(),
        },
    ));
    source.insert(block(
        "col-a",
        "cols",
        NodeKind::Unsupported {
            block_type: "column".into(),
        },
    ));
    source.insert(page("canary", Some("col-a"), "Canary", 7));
    source.insert(para("canary-1", "canary", "canary gets five percent of traffic"));

    let h = Harness::new(source);
    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.added, 7);
    assert!(report.is_clean());
    assert_eq!(
        h.indexed_nodes(),
        ["canary", "deploy", "faq", "oncall", "pets", "root", "runbook"]
    );
    // Nested page text stays out of the page that holds it
    let deploy: Vec<String> = h
        .index
        .records()
        .into_iter()
        .filter(|r| r.metadata.source_node_id == "deploy")
        .map(|r| r.text)
        .collect();
    assert!(deploy.iter().all(|t| !t.contains("canary")));

    // Found again through the recorded children once nothing changed
    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.unchanged, 7);
    assert_eq!(report.deleted, 0);
    assert_eq!(h.source.list_calls("col-a"), 1);

    // Removing the block that holds a page removes the page
    h.source.remove("cols");
    h.source.touch("deploy", ts(30));
    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.updated, 1);
    assert!(h.chunk_ids("canary").is_empty());
}

#[tokio::test]
async fn test_update_replaces_only_that_page() {
    let h = Harness::new(workspace());
    h.orchestrator().run_sync("root").await.unwrap();
    let before_deploy = h.chunk_ids("deploy");
    let before = h.index.records();
    assert!(before_deploy.len() >= 2);

    // Shrink the page to one short paragraph.
    h.source.remove("deploy-2");
    h.source.edit(
        "deploy-1",
        NodeKind::Paragraph {
            text: "we deploy with argo".into(),
        },
        ts(30),
    );
    h.source.touch("deploy", ts(30));

    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.unchanged, 4);
    assert_eq!(report.chunks_removed, before_deploy.len() - 1);

    assert_eq!(h.chunk_ids("deploy"), vec!["deploy#0"]);
    let rec = h.index.get("deploy#0").unwrap();
    assert_eq!(rec.text, "we deploy with argo");
    assert_eq!(rec.metadata.source_last_edited_at, ts(30));

    // Every other record is byte-for-byte the same.
    let untouched: Vec<_> = before
        .into_iter()
        .filter(|r| r.metadata.source_node_id != "deploy")
        .collect();
    let now: Vec<_> = h
        .index
        .records()
        .into_iter()
        .filter(|r| r.metadata.source_node_id != "deploy")
        .collect();
    assert_eq!(untouched, now);
}

#[tokio::test]
async fn test_deleted_page_leaves_index_and_search() {
    let h = Harness::new(workspace());
    h.orchestrator().run_sync("root").await.unwrap();
    assert!(!h.chunk_ids("pets").is_empty());

    h.source.remove("pets");
    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.deleted, 1);
    assert!(h.chunk_ids("pets").is_empty());

    let cp = h.checkpoints().load().await.unwrap().unwrap();
    assert!(!cp.node_version_map.contains_key("pets"));

    let retriever = Retriever::new(
        h.embedder.clone(),
        h.index.clone(),
        RetryPolicy::immediate(1),
        &RetrievalConfig {
            min_similarity: 0.0,
            ..RetrievalConfig::default()
        },
    );
    let hits = retriever.retrieve("office cat biscuit", 10, None).await.unwrap();
    assert!(hits.iter().all(|c| c.source_node_id != "pets"));
}

#[tokio::test]
async fn test_removing_database_deletes_its_rows() {
    let h = Harness::new(workspace());
    h.orchestrator().run_sync("root").await.unwrap();

    h.source.remove("db");
    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(h.indexed_nodes(), ["deploy", "oncall", "pets", "root"]);
}

#[tokio::test]
async fn test_new_page_is_added_incrementally() {
    let h = Harness::new(workspace());
    h.orchestrator().run_sync("root").await.unwrap();

    // Adding a sub-page edits the parent
    h.source.insert(page("ci", Some("root"), "CI", 40));
    h.source.insert(para("ci-1", "ci", "builds run on every push"));
    h.source.touch("root", ts(40));
    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.unchanged, 4);
    assert_eq!(h.chunk_ids("ci"), vec!["ci#0"]);
}

#[tokio::test]
async fn test_partial_failure_is_reported_and_retried() {
    let h = Harness::new(workspace());
    h.embedder
        .poison("biscuit", Error::embedding_unavailable("503 from provider"));

    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.added, 4);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].node_id, "pets");
    assert_eq!(report.failed[0].code, "embedding_unavailable");
    assert!(!report.is_clean());
    assert!(h.chunk_ids("pets").is_empty());

    // The failed page stays out of the checkpoint so it is retried.
    let cp = h.checkpoints().load().await.unwrap().unwrap();
    assert!(!cp.node_version_map.contains_key("pets"));
    assert_eq!(cp.node_version_map.len(), 4);

    h.embedder.cure();
    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.unchanged, 4);
    assert!(report.is_clean());
    assert_eq!(h.indexed_nodes(), DOCS);
}

#[tokio::test]
async fn test_failed_update_keeps_old_version() {
    let h = Harness::new(workspace());
    h.orchestrator().run_sync("root").await.unwrap();

    h.source.edit(
        "pets-1",
        NodeKind::Paragraph {
            text: "biscuit now has a friend".into(),
        },
        ts(50),
    );
    h.source.touch("pets", ts(50));
    h.embedder
        .poison("friend", Error::embedding_unavailable("timeout"));

    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.updated, 0);
    assert_eq!(report.failed.len(), 1);
    let cp = h.checkpoints().load().await.unwrap().unwrap();
    assert_eq!(cp.node_version_map["pets"], ts(3));
    assert_eq!(h.index.get("pets#0").unwrap().text, "the office cat is named biscuit");

    h.embedder.cure();
    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.updated, 1);
    let cp = h.checkpoints().load().await.unwrap().unwrap();
    assert_eq!(cp.node_version_map["pets"], ts(50));
    assert_eq!(h.index.get("pets#0").unwrap().text, "biscuit now has a friend");
}

#[tokio::test]
async fn test_unreachable_container_aborts_scan() {
    let h = Harness::new(workspace());
    h.orchestrator().run_sync("root").await.unwrap();

    h.source.fail_on("db", Error::source_unavailable("502 bad gateway"));
    let orch = h.orchestrator();
    let err = orch.run_sync("root").await.unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable(_)));
    assert_eq!(orch.state(), SyncState::Failed);
    // Nothing under the unreachable database was treated as deleted.
    assert!(!h.chunk_ids("faq").is_empty());
}

#[tokio::test]
async fn test_crash_mid_apply_recovers_without_duplicates() {
    let h = Harness::new(workspace());
    // A revoked key is fatal: the cycle stops after in-flight pages and
    // commits nothing, like a crash before the checkpoint.
    h.embedder
        .poison("biscuit", Error::InvalidConfig("api key revoked".into()));
    let err = h
        .orchestrator_with(h.embedder.clone(), 1)
        .run_sync("root")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert!(h.checkpoints().load().await.unwrap().is_none());
    // Pages are applied in id order; "pets" failed, "root" never started.
    assert_eq!(h.indexed_nodes(), ["deploy", "faq", "oncall"]);

    // Restart with a working provider.
    h.embedder.cure();
    let restarted = h.orchestrator();
    let report = restarted.run_sync("root").await.unwrap();
    assert_eq!(report.added, 5);
    assert_eq!(h.indexed_nodes(), DOCS);

    let ids: Vec<String> = h.index.records().into_iter().map(|r| r.chunk_id).collect();
    let unique: BTreeSet<&String> = ids.iter().collect();
    assert_eq!(ids.len(), unique.len());
    for r in h.index.records() {
        assert!(r.chunk_id.starts_with(&format!("{}#", r.metadata.source_node_id)));
    }
    let cp = h.checkpoints().load().await.unwrap().unwrap();
    assert_eq!(cp.node_version_map.len(), 5);
}

#[tokio::test]
async fn test_orphans_from_lost_checkpoint_are_reclaimed() {
    let h = Harness::new(workspace());
    h.orchestrator().run_sync("root").await.unwrap();

    // Checkpoint lost, then the page disappears upstream.
    h.checkpoints().clear().await.unwrap();
    h.source.remove("pets");
    let report = h.orchestrator().run_sync("root").await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.added, 4);
    assert!(h.chunk_ids("pets").is_empty());
}

#[tokio::test]
async fn test_dimension_mismatch_aborts_without_checkpoint() {
    let h = Harness::new(workspace());
    let wrong = Arc::new(BagOfWords::with_dimension(DIM * 2));
    let orch = h.orchestrator_with(wrong, 4);

    let err = orch.run_sync("root").await.unwrap_err();
    assert_eq!(
        err,
        Error::EmbeddingDimensionMismatch {
            expected: DIM,
            actual: DIM * 2
        }
    );
    assert_eq!(orch.state(), SyncState::Failed);
    assert!(h.kv.snapshot().is_empty());
    assert_eq!(h.index.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_checkpoint_write_failure_is_fatal() {
    let h = Harness::new(workspace());
    h.kv.set_fail_writes(true);
    let orch = h.orchestrator();
    let err = orch.run_sync("root").await.unwrap_err();
    assert!(matches!(err, Error::CheckpointWriteFailure(_)));
    assert_eq!(orch.state(), SyncState::Failed);
    assert!(orch.last_report().is_none());

    // Records were written; the next cycle re-applies them idempotently.
    h.kv.set_fail_writes(false);
    let count = h.index.count().await.unwrap();
    let report = orch.run_sync("root").await.unwrap();
    assert_eq!(report.added, 5);
    assert_eq!(h.index.count().await.unwrap(), count);
    assert_eq!(orch.state(), SyncState::Idle);
}

#[tokio::test]
async fn test_missing_root_is_not_found() {
    let h = Harness::new(workspace());
    let err = h.orchestrator().run_sync("nope").await.unwrap_err();
    assert!(matches!(err, Error::SourceNotFound(_)));
}

#[tokio::test]
async fn test_state_returns_to_idle_and_report_kept() {
    let h = Harness::new(workspace());
    let orch = h.orchestrator();
    let mut states = orch.subscribe();
    assert_eq!(orch.state(), SyncState::Idle);

    let report = orch.run_sync("root").await.unwrap();
    assert_eq!(orch.state(), SyncState::Idle);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), SyncState::Idle);
    assert_eq!(orch.last_report(), Some(report));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_coalesce() {
    let h = Harness::new(workspace());
    let gated = Arc::new(Gated::new(h.embedder.clone()));
    let orch: Arc<SyncOrchestrator> = Arc::new(h.orchestrator_with(gated.clone(), 2));

    let first = tokio::spawn({
        let orch = orch.clone();
        async move { orch.run_sync("root").await }
    });
    gated.entered.notified().await;
    assert_eq!(orch.state(), SyncState::Applying);

    let second = tokio::spawn({
        let orch = orch.clone();
        async move { orch.run_sync("root").await }
    });
    let third = tokio::spawn({
        let orch = orch.clone();
        async move { orch.run_sync("root").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    gated.open();

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    let third = third.await.unwrap().unwrap();

    assert_eq!(first.added, 5);
    // Both waiting triggers share one fresh cycle that sees the new state.
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.run_id, third.run_id);
    assert_eq!(second.unchanged, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_stops_between_pages_and_checkpoints_finished() {
    let h = Harness::new(workspace());
    let gated = Arc::new(Gated::new(h.embedder.clone()));
    let orch = Arc::new(h.orchestrator_with(gated.clone(), 1));
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let orch = orch.clone();
        let cancel = cancel.clone();
        async move { orch.run_sync_with_cancel("root", cancel).await }
    });
    gated.entered.notified().await;
    cancel.cancel();
    gated.open();

    let report = run.await.unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.added, 1);
    assert_eq!(report.skipped, 4);
    assert!(report.checkpoint_written);
    assert_eq!(h.indexed_nodes().len(), 1);

    let cp = h.checkpoints().load().await.unwrap().unwrap();
    assert_eq!(cp.node_version_map.len(), 1);

    let report = orch.run_sync("root").await.unwrap();
    assert_eq!(report.added, 4);
    assert_eq!(report.unchanged, 1);
    assert_eq!(h.indexed_nodes(), DOCS);
}

#[tokio::test]
async fn test_every_chunk_embedded_once() {
    let h = Harness::new(workspace());
    h.orchestrator().run_sync("root").await.unwrap();
    let chunks = h.index.count().await.unwrap() as u64;
    assert_eq!(h.embedder.texts_embedded.load(Ordering::SeqCst), chunks);
}

fn assert_send<T: Send>(value: T) -> T {
    value
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_future_is_send() {
    let h = Harness::new(workspace());
    let orch = Arc::new(h.orchestrator_with(h.embedder.clone(), 4));
    let task = tokio::spawn(assert_send({
        let orch = orch.clone();
        async move {
            orch.run_sync_with_cancel("root", CancellationToken::new())
                .await
        }
    }));
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.added, 5);
    assert_eq!(h.indexed_nodes(), DOCS);
}
