mod common;

use serde_json::{json, Value};
use std::sync::Arc;

use common::{workspace, Harness};
use notion_index::config::RetrievalConfig;
use notion_index::retrieve::Retriever;
use notion_index::retry::RetryPolicy;
use notion_index::server::{router, ServerState};

struct TestServer {
    base: String,
    client: reqwest::Client,
    _harness: Harness,
}

async fn start(default_root: Option<&str>) -> TestServer {
    let harness = Harness::new(workspace());
    let retriever = Retriever::new(
        harness.embedder.clone(),
        harness.index.clone(),
        RetryPolicy::immediate(1),
        &RetrievalConfig {
            min_similarity: 0.0,
            ..RetrievalConfig::default()
        },
    );
    let state = Arc::new(ServerState::new(
        Arc::new(harness.orchestrator()),
        retriever,
        default_root.map(str::to_string),
        3,
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        client: reqwest::Client::new(),
        _harness: harness,
    }
}

impl TestServer {
    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.json().await.unwrap())
    }
}

#[tokio::test]
async fn test_health() {
    let server = start(None).await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_sync_then_status() {
    let server = start(None).await;

    let (status, body) = server.get("/status").await;
    assert_eq!(status, 200);
    assert_eq!(body["state"], "idle");
    assert_eq!(body["records"], 0);
    assert!(body["checkpoint"].is_null());

    let (status, report) = server.post("/sync", json!({ "root_id": "root" })).await;
    assert_eq!(status, 200, "{}", report);
    assert_eq!(report["added"], 5);
    assert_eq!(report["checkpoint_written"], true);

    let (_, body) = server.get("/status").await;
    assert_eq!(body["collection"], "docs");
    assert!(body["records"].as_u64().unwrap() >= 5);
    assert_eq!(body["checkpoint"]["root_id"], "root");
    assert_eq!(body["checkpoint"]["tracked_nodes"], 5);
    assert_eq!(body["last_report"]["run_id"], report["run_id"]);
}

#[tokio::test]
async fn test_sync_uses_default_root() {
    let server = start(Some("root")).await;
    let (status, report) = server.post("/sync", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(report["root_id"], "root");

    let (status, again) = server.post("/sync", json!({ "full": true })).await;
    assert_eq!(status, 200);
    assert_eq!(again["added"], 5);
    assert_eq!(again["unchanged"], 0);
}

#[tokio::test]
async fn test_sync_without_root_is_bad_request() {
    let server = start(None).await;
    let (status, body) = server.post("/sync", json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_sync_unknown_root_is_not_found() {
    let server = start(None).await;
    let (status, body) = server.post("/sync", json!({ "root_id": "nope" })).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "source_not_found");
}

#[tokio::test]
async fn test_retrieve_with_context() {
    let server = start(Some("root")).await;
    server.post("/sync", json!({})).await;

    let (status, body) = server
        .post(
            "/retrieve",
            json!({ "query": "vpn ssh", "k": 2, "context": true }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["source_node_id"], "faq");
    assert!(body["context"]
        .as_str()
        .unwrap()
        .starts_with("Title: VPN\n"));
}

#[tokio::test]
async fn test_retrieve_filter_and_no_context_field() {
    let server = start(Some("root")).await;
    server.post("/sync", json!({})).await;

    let (status, body) = server
        .post(
            "/retrieve",
            json!({ "query": "vpn ssh", "node_ids": ["pets"] }),
        )
        .await;
    assert_eq!(status, 200);
    assert!(body.get("context").is_none());
    assert!(body["results"]
        .as_array()
        .unwrap()
        .iter()
        .all(|r| r["source_node_id"] == "pets"));
}

#[tokio::test]
async fn test_retrieve_blank_query_is_bad_request() {
    let server = start(None).await;
    let (status, body) = server.post("/retrieve", json!({ "query": "  " })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"].as_str().unwrap().contains("query"));
}
