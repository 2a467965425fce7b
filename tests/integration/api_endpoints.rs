//! Integration tests for the HTTP surface
//!
//! These tests verify that:
//! - Admin endpoints require the admin credential
//! - Config staging, reload and persistence work over HTTP
//! - The dashboard protocol answers search, variable and query requests
//! - The agent websocket rejects incomplete requests

use std::net::SocketAddr;

use reqwest::StatusCode;
use serde_json::{Value, json};
use tailwatch::{
    actors::manager::ManagerHandle,
    api::{ApiConfig, ApiState, spawn_api_server},
    transport::channel_stream,
};
use tempfile::TempDir;

use crate::helpers::*;

struct TestHub {
    addr: SocketAddr,
    manager: ManagerHandle,
    dir: TempDir,
}

impl TestHub {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn config_path(&self) -> std::path::PathBuf {
        self.dir.path().join("config.json")
    }
}

fn with_static_dir(raw: &str, static_dir: &std::path::Path) -> String {
    let mut config: Value = serde_json::from_str(raw).unwrap();
    config["static_dir"] = json!(static_dir);
    serde_json::to_string_pretty(&config).unwrap()
}

// Helper to create a hub with two targets behind a random port
async fn spawn_test_hub() -> TestHub {
    let dir = tempfile::tempdir().unwrap();
    let static_dir = dir.path().join("static");
    std::fs::create_dir(&static_dir).unwrap();
    std::fs::write(static_dir.join("index.html"), "<h1>tailwatch</h1>").unwrap();
    std::fs::write(static_dir.join("tailwatch-agent"), "agent-binary").unwrap();

    let raw = with_static_dir(
        &raw_config(
            vec![target("web1", true, &["app"]), target("web2", true, &[])],
            err_filter(&[("unknown", 2), ("noisy", 2)]),
        ),
        &static_dir,
    );
    let config_path = dir.path().join("config.json");
    std::fs::write(&config_path, &raw).unwrap();

    let manager = spawn_manager(&raw, Some(config_path)).await;
    let config = ApiConfig {
        address: "127.0.0.1".to_string(),
        port: 0, // Random port
    };
    let addr = spawn_api_server(config, ApiState::new(manager.clone()))
        .await
        .unwrap();

    TestHub { addr, manager, dir }
}

async fn post_json(url: &str, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(url)
        .body(body.to_string())
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_admin_requires_credentials() {
    let hub = spawn_test_hub().await;
    let client = reqwest::Client::new();

    let response = client.get(hub.url("/api/config")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("www-authenticate"));

    let response = client
        .get(hub.url("/api/config"))
        .basic_auth(ADMIN_USER, Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .get(hub.url("/api/config"))
        .basic_auth(ADMIN_USER, Some(ADMIN_PWD))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.text().await.unwrap(),
        std::fs::read_to_string(hub.config_path()).unwrap()
    );
}

#[tokio::test]
async fn test_put_then_reload_persists_config() {
    let hub = spawn_test_hub().await;
    let client = reqwest::Client::new();
    let next = raw_config(
        vec![target("web3", true, &[])],
        err_filter(&[("unknown", 2)]),
    );

    let response = client
        .put(hub.url("/api/config"))
        .basic_auth(ADMIN_USER, Some(ADMIN_PWD))
        .body(next.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");

    // staging alone changes nothing
    assert_eq!(hub.manager.client_ids().await.unwrap(), vec!["web1", "web2"]);

    let response = client
        .get(hub.url("/api/reload"))
        .basic_auth(ADMIN_USER, Some(ADMIN_PWD))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");

    assert_eq!(hub.manager.client_ids().await.unwrap(), vec!["web3"]);
    assert_eq!(std::fs::read_to_string(hub.config_path()).unwrap(), next);
}

#[tokio::test]
async fn test_invalid_reload_is_bad_request() {
    let hub = spawn_test_hub().await;
    let client = reqwest::Client::new();
    let before = std::fs::read_to_string(hub.config_path()).unwrap();

    client
        .put(hub.url("/api/config"))
        .basic_auth(ADMIN_USER, Some(ADMIN_PWD))
        .body("{\"targets\": 3}")
        .send()
        .await
        .unwrap();
    let response = client
        .get(hub.url("/api/reload"))
        .basic_auth(ADMIN_USER, Some(ADMIN_PWD))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await.unwrap().contains("unmarshal"));
    assert_eq!(std::fs::read_to_string(hub.config_path()).unwrap(), before);
}

#[tokio::test]
async fn test_static_files_behind_auth() {
    let hub = spawn_test_hub().await;
    let client = reqwest::Client::new();

    let response = client
        .get(hub.url("/static/tailwatch-agent"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .get(hub.url("/static/tailwatch-agent"))
        .basic_auth(ADMIN_USER, Some(ADMIN_PWD))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "agent-binary");

    let no_redirect = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let response = no_redirect
        .get(hub.url("/"))
        .basic_auth(ADMIN_USER, Some(ADMIN_PWD))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers()["location"], "/static/");
}

#[tokio::test]
async fn test_reload_moves_static_dir() {
    let hub = spawn_test_hub().await;
    let client = reqwest::Client::new();

    let next_dir = hub.dir.path().join("static-next");
    std::fs::create_dir(&next_dir).unwrap();
    std::fs::write(next_dir.join("tailwatch-agent"), "agent-binary-v2").unwrap();

    let current = std::fs::read_to_string(hub.config_path()).unwrap();
    let next = with_static_dir(&current, &next_dir);
    client
        .put(hub.url("/api/config"))
        .basic_auth(ADMIN_USER, Some(ADMIN_PWD))
        .body(next)
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    client
        .get(hub.url("/api/reload"))
        .basic_auth(ADMIN_USER, Some(ADMIN_PWD))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let response = client
        .get(hub.url("/static/tailwatch-agent"))
        .basic_auth(ADMIN_USER, Some(ADMIN_PWD))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "agent-binary-v2");
}

#[tokio::test]
async fn test_search_lists_targets_and_filters() {
    let hub = spawn_test_hub().await;

    let response = post_json(
        &hub.url("/search"),
        json!({"target": json!({"type": "target"}).to_string()}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let names: Vec<String> = response.json().await.unwrap();
    assert_eq!(names, vec!["web2", "web1"]);

    let response = post_json(
        &hub.url("/search"),
        json!({"target": json!({"type": "sub_filter", "target": "web1", "filter": "err"}).to_string()}),
    )
    .await;
    let names: Vec<String> = response.json().await.unwrap();
    assert_eq!(names, vec!["unknown", "noisy"]);

    // an empty query lists targets
    let response = post_json(&hub.url("/search"), json!({})).await;
    let names: Vec<String> = response.json().await.unwrap();
    assert_eq!(names, vec!["web2", "web1"]);
}

#[tokio::test]
async fn test_variable_wraps_names() {
    let hub = spawn_test_hub().await;

    let response = post_json(
        &hub.url("/variable"),
        json!({"payload": {"target": json!({"type": "filter", "target": "web1"}).to_string()}}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!([{"__text": "err", "__value": "err"}]));

    let response = post_json(
        &hub.url("/variable"),
        json!({"payload": {"target": json!({"type": "filter", "target": "web9"}).to_string()}}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

fn query_body(target: &str, filter: &str, sub_filter: &str) -> Value {
    json!({
        "scopedVars": {
            "target": {"text": target, "value": target},
            "filter": {"text": filter, "value": filter},
            "sub_filter": {"text": sub_filter, "value": sub_filter}
        }
    })
}

#[tokio::test]
async fn test_query_returns_history_table() {
    let hub = spawn_test_hub().await;
    let (sender, stream) = channel_stream("agent");
    hub.manager
        .bind_inbound_stream("web1", "app", Box::new(stream))
        .await
        .unwrap();
    sender.send_lines(["ERROR first", "ERROR second"]);
    eventually(|| async {
        hub.manager
            .query_records("web1", "err", "unknown")
            .await
            .map(|rows| rows.len() == 3)
            .unwrap_or(false)
    })
    .await;

    let response = post_json(&hub.url("/query"), query_body("web1", "err", "unknown")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();

    let table = &body[0];
    assert_eq!(table["type"], "table");
    assert_eq!(table["columns"][4], json!({"text": "message", "type": "string"}));
    assert_eq!(
        table["rows"],
        json!([
            ["web1", "err", "unknown", "total:2 ignore:0 print:2", "known:0"],
            ["web1", "err", "unknown", "unknown", "ERROR second"],
            ["web1", "err", "unknown", "unknown", "ERROR first"]
        ])
    );
}

#[tokio::test]
async fn test_query_failure_is_internal_error() {
    let hub = spawn_test_hub().await;
    let response = post_json(&hub.url("/query"), query_body("web1", "err", "missing")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!response.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_agentws_requires_id_and_file() {
    let hub = spawn_test_hub().await;
    let client = reqwest::Client::new();

    for path in ["/agentws", "/agentws?id=web1", "/agentws?file=app", "/agentws?id=&file=app"] {
        let response = client.get(hub.url(path)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
    }
}
