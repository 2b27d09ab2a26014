//! End-to-end flow: gateway → queues → content and access consumers.
//!
//! Everything downstream of the gateway runs against in-memory backends
//! and a throwaway SQLite metadata store; the gateway is served on an
//! ephemeral port.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rag_sync::access::AccessPolicy;
use rag_sync::auth::{sign, Authenticator, SIGNATURE_HEADER};
use rag_sync::config::{AccessConfig, GroupRule};
use rag_sync::error::SyncResult;
use rag_sync::event::Normalizer;
use rag_sync::filestore::memory::InMemoryFileStore;
use rag_sync::filestore::Shares;
use rag_sync::gateway::{serve, AppState};
use rag_sync::index::memory::InMemoryIndex;
use rag_sync::index::{ChunkMetadata, ChunkPoint, IndexClient};
use rag_sync::metadata::MetadataStore;
use rag_sync::models::QueueEntry;
use rag_sync::pipeline::ContentPipeline;
use rag_sync::queue::memory::InMemoryQueue;
use rag_sync::queue::{Disposition, RetryPolicy, Routes, WorkQueue};
use rag_sync::worker::access::{AccessConsumer, ReconcileReport};
use rag_sync::worker::content::ContentConsumer;
use rag_sync::worker::{Outcome, Worker};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "s3cret";

/// Stores the raw file as a single chunk, so tests can see which version
/// of the content was indexed.
struct RawPipeline {
    index: Arc<InMemoryIndex>,
}

#[async_trait]
impl ContentPipeline for RawPipeline {
    async fn process(&self, file: &Path, meta: &ChunkMetadata) -> SyncResult<usize> {
        let text = tokio::fs::read_to_string(file).await.unwrap();
        let point = ChunkPoint {
            index: 0,
            text,
            vector: vec![1.0, 0.0],
        };
        self.index.upsert_chunks(meta, &[point]).await?;
        Ok(1)
    }
}

struct Harness {
    _tmp: TempDir,
    queue: Arc<InMemoryQueue>,
    files: Arc<InMemoryFileStore>,
    index: Arc<InMemoryIndex>,
    metadata: MetadataStore,
    access: AccessConsumer,
    content_worker: Worker,
    access_worker: Worker,
}

async fn harness(policy: RetryPolicy) -> Harness {
    let tmp = TempDir::new().unwrap();
    let url = format!("sqlite:{}", tmp.path().join("metadata.sqlite").display());
    let metadata = MetadataStore::connect(&url).await.unwrap();

    let queue = Arc::new(InMemoryQueue::new(policy));
    let files = Arc::new(InMemoryFileStore::new());
    let index = Arc::new(InMemoryIndex::new());
    let normalizer = Arc::new(Normalizer::default());

    let content = ContentConsumer::new(
        files.clone(),
        Arc::new(RawPipeline { index: index.clone() }),
        index.clone(),
        metadata.clone(),
        queue.clone(),
        "access",
    );
    let policy = AccessPolicy::from_config(&AccessConfig {
        group_rules: vec![GroupRule {
            pattern: "Reports/**".into(),
            group: "finance".into(),
        }],
        ..Default::default()
    })
    .unwrap();
    let access = AccessConsumer::new(files.clone(), index.clone(), Arc::new(policy), metadata.clone());

    let timeouts = (Duration::from_millis(20), Duration::from_secs(5));
    let content_worker = Worker::new(queue.clone(), "content", normalizer.clone(), Arc::new(content))
        .with_timeouts(timeouts.0, timeouts.1);
    let access_worker = Worker::new(queue.clone(), "access", normalizer, Arc::new(access.clone()))
        .with_timeouts(timeouts.0, timeouts.1);

    Harness {
        _tmp: tmp,
        queue,
        files,
        index,
        metadata,
        access,
        content_worker,
        access_worker,
    }
}

fn no_backoff() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
    }
}

/// Serves a gateway that pushes onto `queue`; stops when the token drops.
async fn gateway(queue: Arc<InMemoryQueue>) -> (String, CancellationToken) {
    let state = AppState::new(
        Authenticator::new(SECRET, SECRET),
        queue as Arc<dyn WorkQueue>,
        Arc::new(Normalizer::default()),
        Routes {
            content: "content".into(),
            access: "access".into(),
        },
        "nextcloud",
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let cancel = CancellationToken::new();
    tokio::spawn(serve(listener, state, cancel.clone()));
    (base, cancel)
}

fn legacy(event: &str, id: &str, path: &str, etag: &str) -> QueueEntry {
    QueueEntry::pending(
        "nextcloud",
        json!({"event": event, "file_id": id, "path": path, "etag": etag}),
    )
}

#[tokio::test]
async fn created_notification_is_indexed_recorded_and_access_stamped() {
    let h = harness(no_backoff()).await;
    h.files.put("Reports/q1.pdf", "q1 figures");
    let (base, cancel) = gateway(h.queue.clone()).await;

    let body = json!({
        "event": {
            "class": "OCP\\Files\\Events\\Node\\NodeCreatedEvent",
            "node": {"id": 42, "path": "files/bob/Reports/q1.pdf", "etag": "e1"}
        }
    })
    .to_string();
    let resp = reqwest::Client::new()
        .post(format!("{}/webhook/nextcloud", base))
        .header(SIGNATURE_HEADER, sign(SECRET.as_bytes(), body.as_bytes()))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    cancel.cancel();

    assert_eq!(h.content_worker.run_once().await.unwrap(), Outcome::Processed);
    assert_eq!(h.files.downloads(), ["Reports/q1.pdf"]);

    let record = h.metadata.get("42").await.unwrap().unwrap();
    assert_eq!(record.path, "Reports/q1.pdf");
    assert_eq!(record.content_fingerprint.as_deref(), Some("e1"));
    assert_eq!(record.owner.as_deref(), Some("bob"));

    // The follow-up lets the access consumer stamp the fresh chunks.
    assert_eq!(h.access_worker.run_once().await.unwrap(), Outcome::Processed);
    let chunk = &h.index.chunks("42")[0];
    assert_eq!(chunk.payload["text"], "q1 figures");
    assert_eq!(chunk.payload["owner"], "bob");
    assert_eq!(chunk.payload["allowed_groups"], json!(["finance"]));
}

#[tokio::test]
async fn replaying_the_same_version_leaves_the_same_state() {
    let h = harness(no_backoff()).await;
    h.files.put("Docs/a.txt", "alpha");

    h.queue.push("content", &legacy("file.created", "1", "Docs/a.txt", "e1")).await.unwrap();
    h.content_worker.run_once().await.unwrap();
    h.access_worker.run_once().await.unwrap();
    let record = h.metadata.get("1").await.unwrap().unwrap();
    let chunks = h.index.chunks("1");

    h.queue.push("content", &legacy("file.created", "1", "Docs/a.txt", "e1")).await.unwrap();
    assert_eq!(h.content_worker.run_once().await.unwrap(), Outcome::Processed);
    assert_eq!(h.access_worker.run_once().await.unwrap(), Outcome::Idle);

    let again = h.metadata.get("1").await.unwrap().unwrap();
    assert_eq!(again.path, record.path);
    assert_eq!(again.content_fingerprint, record.content_fingerprint);
    assert_eq!(h.metadata.count().await.unwrap(), 1);
    assert_eq!(h.index.chunks("1")[0].payload, chunks[0].payload);
}

#[tokio::test]
async fn out_of_order_versions_settle_on_the_last_processed() {
    let h = harness(no_backoff()).await;
    h.files.put("Docs/a.txt", "current");

    h.queue.push("content", &legacy("file.updated", "1", "Docs/a.txt", "e2")).await.unwrap();
    h.queue.push("content", &legacy("file.updated", "1", "Docs/a.txt", "e1")).await.unwrap();

    assert_eq!(h.content_worker.run_once().await.unwrap(), Outcome::Processed);
    assert_eq!(h.content_worker.run_once().await.unwrap(), Outcome::Processed);

    let record = h.metadata.get("1").await.unwrap().unwrap();
    assert_eq!(record.content_fingerprint.as_deref(), Some("e1"));
    let chunks = h.index.chunks("1");
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].payload["etag"], "e1");
}

#[tokio::test]
async fn delete_clears_index_and_metadata() {
    let h = harness(no_backoff()).await;
    h.files.put("Docs/a.txt", "alpha");
    h.queue.push("content", &legacy("file.created", "1", "Docs/a.txt", "e1")).await.unwrap();
    h.content_worker.run_once().await.unwrap();
    assert_eq!(h.index.chunks("1").len(), 1);

    let delete = QueueEntry::pending("nextcloud", json!({"event": "file.deleted", "file_id": "1"}));
    h.queue.push("content", &delete).await.unwrap();
    assert_eq!(h.content_worker.run_once().await.unwrap(), Outcome::Processed);

    assert!(h.index.chunks("1").is_empty());
    assert!(h.metadata.get("1").await.unwrap().is_none());
    assert_eq!(h.access.reconcile().await.unwrap().files, 0);
}

#[tokio::test]
async fn poison_job_is_dead_lettered_without_blocking_others() {
    let h = harness(RetryPolicy {
        max_attempts: 2,
        ..no_backoff()
    })
    .await;
    h.files.put("Docs/ok.txt", "fine");

    h.queue.push("content", &legacy("file.created", "1", "Docs/missing.txt", "e1")).await.unwrap();
    h.queue.push("content", &legacy("file.created", "2", "Docs/ok.txt", "e1")).await.unwrap();

    let first = h.content_worker.run_once().await.unwrap();
    assert!(matches!(first, Outcome::Failed(Disposition::Retry { .. })));
    assert_eq!(h.content_worker.run_once().await.unwrap(), Outcome::Processed);
    assert_eq!(
        h.content_worker.run_once().await.unwrap(),
        Outcome::Failed(Disposition::DeadLettered)
    );
    assert_eq!(h.content_worker.run_once().await.unwrap(), Outcome::Idle);

    assert!(h.metadata.get("2").await.unwrap().is_some());
    assert!(h.metadata.get("1").await.unwrap().is_none());
    assert_eq!(h.queue.dead("content").len(), 1);
}

#[tokio::test]
async fn acl_change_event_applies_share_permissions() {
    let h = harness(no_backoff()).await;
    h.files.put("Docs/a.txt", "alpha");
    h.queue.push("content", &legacy("file.created", "1", "Docs/a.txt", "e1")).await.unwrap();
    h.content_worker.run_once().await.unwrap();
    h.access_worker.run_once().await.unwrap();
    assert_eq!(h.index.chunks("1")[0].payload["owner"], "admin");

    h.files.share(
        "Docs/a.txt",
        Shares {
            owner: Some("carol".into()),
            users: ["dave".to_string()].into(),
            groups: ["sales".to_string()].into(),
        },
    );
    let change = QueueEntry::pending(
        "nextcloud",
        json!({"event": "acl.changed", "file_id": "1", "path": "Docs/a.txt"}),
    );
    h.queue.push("access", &change).await.unwrap();
    assert_eq!(h.access_worker.run_once().await.unwrap(), Outcome::Processed);

    let payload = &h.index.chunks("1")[0].payload;
    assert_eq!(payload["owner"], "carol");
    assert_eq!(payload["allowed_users"], json!(["dave"]));
    assert_eq!(payload["allowed_groups"], json!(["sales"]));
}

#[tokio::test]
async fn reconciliation_sweep_touches_every_recorded_file() {
    let h = harness(no_backoff()).await;
    for (id, path) in [("1", "Docs/a.txt"), ("2", "Reports/b.txt"), ("3", "c.txt")] {
        h.files.put(path, "x");
        h.queue.push("content", &legacy("file.created", id, path, "e1")).await.unwrap();
        h.content_worker.run_once().await.unwrap();
    }
    let before = h.index.set_access_calls();

    let report = h.access.reconcile().await.unwrap();
    assert_eq!(report, ReconcileReport { files: 3, applied: 3, missing: 0, failed: 0 });
    assert_eq!(h.index.set_access_calls() - before, 3);
    assert_eq!(h.index.chunks("2")[0].payload["allowed_groups"], json!(["finance"]));
}
