//! Drive the management API over a real socket

use portgate_api::{ApiState, ManagementApi};
use portgate_core::{Action, EventLog, PolicyEngine, Rule, RuleStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn request(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        body.len(),
        body
    );
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

async fn start(dir: &TempDir) -> (ManagementApi, Arc<PolicyEngine>, SocketAddr) {
    let engine = Arc::new(PolicyEngine::new());
    let mut api = ManagementApi::new(ApiState {
        engine: engine.clone(),
        store: RuleStore::new(dir.path().join("rules.json")),
        events: Arc::new(EventLog::new(dir.path().join("events.jsonl"))),
    });
    let addr = api.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    (api, engine, addr)
}

#[tokio::test]
async fn rule_lifecycle_over_http() {
    let dir = TempDir::new().unwrap();
    let (mut api, engine, addr) = start(&dir).await;

    let (status, body) = request(addr, "GET", "/rules", "").await;
    assert_eq!(status, 200);
    assert_eq!(body, "[]");

    let (status, _) = request(
        addr,
        "POST",
        "/rules",
        r#"{"RuleId":"ssh","Priority":5,"Port":22,"Protocol":"TCP","Action":"Deny"}"#,
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(engine.get("ssh").unwrap().action, Action::Deny);

    let (status, body) = request(addr, "POST", "/rules/ssh/toggle", "").await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""enabled":false"#));
    assert!(!engine.get("ssh").unwrap().enabled);

    let (status, _) = request(addr, "POST", "/save", "").await;
    assert_eq!(status, 200);
    assert!(dir.path().join("rules.json").exists());

    let (status, _) = request(addr, "DELETE", "/rules/ssh", "").await;
    assert_eq!(status, 200);
    assert!(engine.is_empty());

    let (status, _) = request(addr, "POST", "/reload", "").await;
    assert_eq!(status, 200);
    assert_eq!(engine.len(), 1);

    api.stop().await;
}

#[tokio::test]
async fn unknown_paths_and_bad_bodies() {
    let dir = TempDir::new().unwrap();
    let (mut api, engine, addr) = start(&dir).await;
    engine.add(Rule::new(Action::Allow).with_id("keep"));

    let (status, _) = request(addr, "GET", "/nope", "").await;
    assert_eq!(status, 404);

    let (status, _) = request(addr, "DELETE", "/rules/missing", "").await;
    assert_eq!(status, 404);

    let (status, body) = request(addr, "POST", "/rules", "{not json").await;
    assert_eq!(status, 400);
    assert!(body.contains("error"));
    assert_eq!(engine.len(), 1);

    api.stop().await;
}

#[tokio::test]
async fn stop_closes_the_port() {
    let dir = TempDir::new().unwrap();
    let (mut api, _engine, addr) = start(&dir).await;

    api.stop().await;
    assert!(api.local_addr().is_none());
    assert!(TcpStream::connect(addr).await.is_err());
}
