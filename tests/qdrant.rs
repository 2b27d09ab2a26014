//! HTTP contract of the Qdrant index client, against a recording stub.

mod common;

use axum::http::{Method, StatusCode};
use rag_sync::config::IndexConfig;
use rag_sync::error::SyncError;
use rag_sync::index::qdrant::QdrantIndex;
use rag_sync::index::{point_id, ChunkMetadata, ChunkPoint, IndexClient};
use rag_sync::models::AccessDescriptor;

use common::Stub;

const OK: &str = r#"{"result":{"operation_id":1,"status":"completed"},"status":"ok","time":0.001}"#;

fn ok(_: &Method, _: &str) -> (StatusCode, String) {
    (StatusCode::OK, OK.to_string())
}

fn index(stub: &Stub, api_key: Option<&str>) -> QdrantIndex {
    QdrantIndex::new(&IndexConfig {
        url: stub.base.clone(),
        api_key: api_key.map(str::to_string),
        collection: "docs".into(),
        ..Default::default()
    })
    .unwrap()
}

fn meta() -> ChunkMetadata {
    ChunkMetadata {
        file_id: "42".into(),
        path: "Reports/q1.pdf".into(),
        fingerprint: Some("e1".into()),
    }
}

fn chunk(index: usize) -> ChunkPoint {
    ChunkPoint {
        index,
        text: format!("chunk {}", index),
        vector: vec![0.1, 0.2, 0.3],
    }
}

#[tokio::test]
async fn upsert_clears_the_file_then_writes_points_and_waits() {
    let stub = Stub::start(ok).await;
    index(&stub, Some("secret-key"))
        .upsert_chunks(&meta(), &[chunk(0), chunk(1)])
        .await
        .unwrap();

    let reqs = stub.requests();
    assert_eq!(reqs.len(), 2);

    assert_eq!(reqs[0].method, Method::POST);
    assert_eq!(reqs[0].target, "/collections/docs/points/delete?wait=true");
    assert_eq!(reqs[0].json()["filter"]["must"][0]["match"]["value"], "42");

    assert_eq!(reqs[1].method, Method::PUT);
    assert_eq!(reqs[1].target, "/collections/docs/points?wait=true");
    let points = reqs[1].json()["points"].clone();
    assert_eq!(points.as_array().unwrap().len(), 2);
    assert_eq!(points[1]["id"], point_id("42", 1).to_string());
    assert_eq!(points[1]["payload"]["file_id"], "42");
    assert_eq!(points[1]["payload"]["etag"], "e1");
    assert_eq!(points[1]["payload"]["text"], "chunk 1");

    assert!(reqs.iter().all(|r| r.header("api-key") == Some("secret-key")));
}

#[tokio::test]
async fn set_access_is_a_filtered_payload_write() {
    let stub = Stub::start(ok).await;
    let mut access = AccessDescriptor::owned_by("bob");
    access.allowed_groups.insert("finance".into());

    index(&stub, None).set_access("42", &access).await.unwrap();

    let reqs = stub.requests();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].method, Method::POST);
    assert_eq!(reqs[0].target, "/collections/docs/points/payload?wait=true");
    let body = reqs[0].json();
    assert_eq!(body["payload"]["owner"], "bob");
    assert_eq!(body["payload"]["allowed_groups"][0], "finance");
    assert_eq!(body["filter"]["must"][0]["key"], "file_id");
    assert!(reqs[0].header("api-key").is_none());
}

#[tokio::test]
async fn delete_file_is_a_filtered_delete() {
    let stub = Stub::start(ok).await;
    index(&stub, None).delete_file("7").await.unwrap();

    let reqs = stub.requests();
    assert_eq!(reqs.len(), 1);
    assert_eq!(reqs[0].target, "/collections/docs/points/delete?wait=true");
    assert_eq!(reqs[0].json()["filter"]["must"][0]["match"]["value"], "7");
}

#[tokio::test]
async fn error_status_becomes_a_store_failure() {
    let stub = Stub::start(|_, _| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"status":{"error":"disk full"}}"#.to_string(),
        )
    })
    .await;

    let err = index(&stub, None).delete_file("7").await.unwrap_err();
    match err {
        SyncError::Store(message) => {
            assert!(message.contains("500"), "{}", message);
            assert!(message.contains("disk full"), "{}", message);
        }
        other => panic!("expected store failure, got {:?}", other),
    }

    let err = index(&stub, None)
        .set_access("7", &AccessDescriptor::owned_by("admin"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Store(_)));
}

#[tokio::test]
async fn missing_collection_is_created_with_a_file_id_index() {
    let stub = Stub::start(|method, _| {
        if *method == Method::GET {
            (StatusCode::NOT_FOUND, r#"{"status":{"error":"Not found"}}"#.to_string())
        } else {
            (StatusCode::OK, OK.to_string())
        }
    })
    .await;

    index(&stub, None).ensure_collection(3).await.unwrap();

    let reqs = stub.requests();
    let calls: Vec<(Method, &str)> = reqs
        .iter()
        .map(|r| (r.method.clone(), r.target.as_str()))
        .collect();
    assert_eq!(
        calls,
        vec![
            (Method::GET, "/collections/docs"),
            (Method::PUT, "/collections/docs"),
            (Method::PUT, "/collections/docs/index?wait=true"),
        ]
    );
    assert_eq!(reqs[1].json()["vectors"]["size"], 3);
    assert_eq!(reqs[2].json()["field_name"], "file_id");
}

#[tokio::test]
async fn existing_collection_is_left_alone() {
    let stub = Stub::start(ok).await;
    index(&stub, None).ensure_collection(3).await.unwrap();
    assert_eq!(stub.requests().len(), 1);
}
