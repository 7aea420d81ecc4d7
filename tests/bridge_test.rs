/// Integration tests for the tiledd bridge.
/// Spins up a real daemon on a free port and drives it over WebSocket.
use std::io::{Read as _, Write as _};
use std::net::TcpStream;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use tiledd::config::DaemonConfig;
use tiledd::store::session::RemoteSession;
use tiledd::store::StoreAdapter;
use tiledd::worker::dylib::DylibArtifactLoader;
use tiledd::worker::BuildWorker;
use tiledd::AppContext;

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Start a daemon on a random port and return the WebSocket URL.
async fn start_test_daemon() -> (String, Arc<AppContext>) {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let artifacts_dir = data_dir.join("artifacts");
    std::fs::create_dir_all(&artifacts_dir).unwrap();
    let port = get_free_port();

    let config = Arc::new(DaemonConfig::new(
        Some(port),
        Some(data_dir.clone()),
        Some(artifacts_dir.clone()),
        Some("warn".to_string()),
        None,
    ));
    let session = RemoteSession::open(&config.data_dir, config.storage.sync_interval_ms)
        .await
        .unwrap();
    let store = StoreAdapter::new(Arc::clone(&session));
    let worker = BuildWorker::spawn(Arc::new(DylibArtifactLoader::new(&artifacts_dir)));

    let ctx = Arc::new(AppContext {
        config,
        session,
        store,
        worker,
        started_at: std::time::Instant::now(),
    });

    let ctx_server = ctx.clone();
    tokio::spawn(async move {
        tiledd::ipc::run(ctx_server).await.ok();
    });

    // Give server a moment to bind
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let url = format!("ws://127.0.0.1:{}", ctx.config.port);
    (url, ctx)
}

fn get_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn ws_connect(url: &str) -> WsClient {
    let (ws, _) = connect_async(url).await.expect("ws connect failed");
    ws
}

/// Send one storage RPC and read frames until the reply with our id
/// arrives (lifecycle events interleave freely and are skipped).
async fn ws_rpc(ws: &mut WsClient, method: &str, params: Value) -> Value {
    let id = Value::String(Uuid::new_v4().to_string());
    let request = json!({ "method": method, "params": params, "id": id.clone() });
    ws.send(Message::Text(serde_json::to_string(&request).unwrap()))
        .await
        .unwrap();

    loop {
        let msg = ws.next().await.unwrap().unwrap();
        if let Message::Text(text) = msg {
            let v: Value = serde_json::from_str(&text).unwrap();
            if v.get("id") == Some(&id) {
                return v;
            }
        }
    }
}

/// Read frames until one with the given id arrives.
async fn ws_wait_for(ws: &mut WsClient, id: &Value) -> Value {
    loop {
        let msg = ws.next().await.unwrap().unwrap();
        if let Message::Text(text) = msg {
            let v: Value = serde_json::from_str(&text).unwrap();
            if v.get("id") == Some(id) || v.get("run") == Some(id) {
                return v;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_endpoint() {
    let (url, ctx) = start_test_daemon().await;
    let addr = url.trim_start_matches("ws://").to_string();

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let v: Value = serde_json::from_str(body).unwrap();
    assert_eq!(v["status"], "ok");
    assert_eq!(v["port"], ctx.config.port);
    assert_eq!(v["activeBuilds"], 0);
}

#[tokio::test]
async fn test_get_config_writes_default_through() {
    let (url, _ctx) = start_test_daemon().await;
    let mut ws = ws_connect(&url).await;

    let first = ws_rpc(&mut ws, "getConfig", json!([{ "file": "hello.json" }])).await;
    assert_eq!(first["data"], json!({ "file": "hello.json" }));

    // The stored value wins over a later, different default.
    let second = ws_rpc(&mut ws, "getConfig", json!([{ "file": "other.json" }])).await;
    assert_eq!(second["data"], json!({ "file": "hello.json" }));
}

#[tokio::test]
async fn test_set_config_then_get_config() {
    let (url, _ctx) = start_test_daemon().await;
    let mut ws = ws_connect(&url).await;

    let set = ws_rpc(&mut ws, "setConfig", json!([{ "file": "dungeon.json" }])).await;
    assert_eq!(set["data"], json!({ "file": "dungeon.json" }));

    let got = ws_rpc(&mut ws, "getConfig", json!([{ "file": "default.json" }])).await;
    assert_eq!(got["data"], json!({ "file": "dungeon.json" }));
}

#[tokio::test]
async fn test_store_and_get_file() {
    let (url, _ctx) = start_test_daemon().await;
    let mut ws = ws_connect(&url).await;

    let stored = ws_rpc(
        &mut ws,
        "storeFile",
        json!(["application/json", "demo.json", "{\"layers\":[]}"]),
    )
    .await;
    assert!(stored["data"].is_string(), "revision expected: {stored}");

    let got = ws_rpc(&mut ws, "getFile", json!(["demo.json"])).await;
    assert_eq!(got["data"]["mimeType"], "application/json");
    assert_eq!(got["data"]["body"], "{\"layers\":[]}");

    let listing = ws_rpc(&mut ws, "getFiles", json!([])).await;
    assert!(listing["data"]["private"]["demo.json"].is_string());
    assert_eq!(listing["data"]["public"], json!({}));
}

#[tokio::test]
async fn test_unknown_method_gets_error_reply() {
    let (url, _ctx) = start_test_daemon().await;
    let mut ws = ws_connect(&url).await;

    let reply = ws_rpc(&mut ws, "formatDisk", json!([])).await;
    assert_eq!(reply["error"]["code"], "MethodNotFound");
    assert!(reply.get("data").is_none());
}

#[tokio::test]
async fn test_new_connection_is_greeted_with_session_state() {
    let (url, _ctx) = start_test_daemon().await;
    let mut ws = ws_connect(&url).await;

    // Every fresh connection is told where the session stands before any
    // request is made.
    let mut names = Vec::new();
    while names.len() < 3 {
        let msg = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = msg else { continue };
        let v: Value = serde_json::from_str(&text).unwrap();
        if let Some(name) = v["id"].as_str() {
            names.push(name.to_string());
        }
    }
    assert_eq!(names, vec!["features-loaded", "ready", "not-connected"]);
}

#[tokio::test]
async fn test_connect_forwards_lifecycle_events() {
    let (url, _ctx) = start_test_daemon().await;
    let mut ws = ws_connect(&url).await;

    // Events and the RPC reply interleave on one socket, so read raw
    // frames: the reply must arrive, and the three lifecycle events must
    // arrive in emission order.
    let request = json!({ "method": "connect", "params": ["user@storage.example"], "id": "c1" });
    ws.send(Message::Text(request.to_string())).await.unwrap();

    let mut names = Vec::new();
    let mut reply_seen = false;
    while names.len() < 3 || !reply_seen {
        let msg = ws.next().await.unwrap().unwrap();
        let Message::Text(text) = msg else { continue };
        let v: Value = serde_json::from_str(&text).unwrap();
        match v["id"].as_str() {
            Some("c1") => {
                assert_eq!(v["data"], Value::Null);
                reply_seen = true;
            }
            Some(name @ ("connecting" | "authing" | "connected")) => {
                if name == "connected" {
                    assert_eq!(v["data"]["userAddress"], "user@storage.example");
                    assert_eq!(v["data"]["connected"], true);
                }
                names.push(name.to_string());
            }
            _ => {}
        }
    }
    assert_eq!(names, vec!["connecting", "authing", "connected"]);

    let reply = ws_rpc(&mut ws, "disconnect", json!([])).await;
    assert_eq!(reply["data"], Value::Null);
}

#[tokio::test]
async fn test_build_of_missing_artifact_fails_explicitly() {
    let (url, _ctx) = start_test_daemon().await;
    let mut ws = ws_connect(&url).await;

    let run = json!("run-1");
    let submit = json!({ "build": "no-such-artifact", "run": run, "level": { "tiles": [] } });
    ws.send(Message::Text(submit.to_string())).await.unwrap();

    let reply = ws_wait_for(&mut ws, &run).await;
    assert_eq!(reply["run"], run);
    assert_eq!(reply["error"]["code"], "LoadFailure");
}

#[tokio::test]
async fn test_build_failures_are_routed_by_token() {
    let (url, _ctx) = start_test_daemon().await;
    let mut ws = ws_connect(&url).await;

    for token in ["alpha", "beta"] {
        let submit = json!({ "build": "ghost", "run": token, "level": null });
        ws.send(Message::Text(submit.to_string())).await.unwrap();
    }

    let first = ws_wait_for(&mut ws, &json!("alpha")).await;
    assert_eq!(first["error"]["code"], "LoadFailure");
    let second = ws_wait_for(&mut ws, &json!("beta")).await;
    assert_eq!(second["error"]["code"], "LoadFailure");
}

#[tokio::test]
async fn test_two_clients_each_see_session_events() {
    let (url, ctx) = start_test_daemon().await;
    let mut a = ws_connect(&url).await;
    let mut b = ws_connect(&url).await;

    // Nudge both connections into existence before firing.
    let _ = ws_rpc(&mut a, "getFiles", json!([])).await;
    let _ = ws_rpc(&mut b, "getFiles", json!([])).await;

    ctx.session
        .events()
        .emit(tiledd::store::events::EventName::NetworkOffline, json!(null));

    for ws in [&mut a, &mut b] {
        loop {
            let msg = ws.next().await.unwrap().unwrap();
            if let Message::Text(text) = msg {
                let v: Value = serde_json::from_str(&text).unwrap();
                if v["id"] == "network-offline" {
                    break;
                }
            }
        }
    }
}
