//! End-to-end tests: real listener on an ephemeral port, real WebSocket
//! clients.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_server::{start, BroadcastPolicy, ServerConfig, ServerError, ServerHandle};
use relay_store::{JsonFileStore, MemoryStore, PersistentStore, SqliteStore};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    }
}

async fn serve(config: ServerConfig, store: Arc<dyn PersistentStore>) -> ServerHandle {
    start(config, store).await.expect("server starts")
}

/// Connect and consume the `init` frame, returning it.
async fn join(handle: &ServerHandle) -> (Client, Value) {
    let url = format!("ws://127.0.0.1:{}/ws", handle.port());
    let (mut ws, _) = connect_async(url).await.expect("websocket connects");
    let init = next_event(&mut ws).await;
    assert_eq!(init["type"], "init");
    (ws, init)
}

async fn next_event(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("event before timeout")
            .expect("stream open")
            .expect("valid frame");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn send_raw(ws: &mut Client, text: &str) {
    ws.send(Message::text(text.to_string())).await.unwrap();
}

#[tokio::test]
async fn first_client_gets_empty_init() {
    let handle = serve(config(), Arc::new(MemoryStore::new())).await;
    let (_ws, init) = join(&handle).await;
    assert_eq!(init["comments"], json!([]));
    assert_eq!(init["items"], json!([]));
    assert_eq!(init["voteTallies"], json!({}));
    handle.shutdown().await;
}

#[tokio::test]
async fn comment_reaches_every_client() {
    let handle = serve(config(), Arc::new(MemoryStore::new())).await;
    let (mut a, _) = join(&handle).await;
    let (mut b, _) = join(&handle).await;

    send(&mut a, json!({"type": "comment", "content": "hello"})).await;

    for ws in [&mut a, &mut b] {
        let event = next_event(ws).await;
        assert_eq!(event["type"], "comment");
        assert_eq!(event["content"], "hello");
        assert_eq!(event["origin"], "web");
        assert!(!event["id"].as_str().unwrap().is_empty());
        assert!(event["timestamp"].as_i64().unwrap() > 0);
    }
    handle.shutdown().await;
}

#[tokio::test]
async fn plain_text_becomes_comment() {
    let handle = serve(config(), Arc::new(MemoryStore::new())).await;
    let (mut a, _) = join(&handle).await;

    send_raw(&mut a, "hi there").await;
    let event = next_event(&mut a).await;
    assert_eq!(event["type"], "comment");
    assert_eq!(event["content"], "hi there");
    assert_eq!(event["origin"], "plain_text");

    a.send(Message::binary(b"from bytes".to_vec())).await.unwrap();
    let event = next_event(&mut a).await;
    assert_eq!(event["content"], "from bytes");

    let (_late, init) = join(&handle).await;
    assert_eq!(init["comments"].as_array().unwrap().len(), 2);
    handle.shutdown().await;
}

#[tokio::test]
async fn repeated_level_confirms_first_copy() {
    let handle = serve(config(), Arc::new(MemoryStore::new())).await;
    let (mut a, _) = join(&handle).await;
    let (mut b, _) = join(&handle).await;

    send(&mut a, json!({"type": "new_level", "level": {"id": "L1", "name": "First", "size": 3}})).await;
    let first = json!({"type": "new_level", "level": {"id": "L1", "name": "First", "size": 3}});
    assert_eq!(next_event(&mut a).await, first);
    assert_eq!(next_event(&mut b).await, first);

    // the retry is answered with the stored entry, not the new fields
    send(&mut a, json!({"type": "new_level", "level": {"id": "L1", "name": "Second"}})).await;
    assert_eq!(next_event(&mut a).await, first);
    assert_eq!(next_event(&mut b).await, first);

    let (_late, init) = join(&handle).await;
    assert_eq!(init["items"], json!([{"id": "L1", "name": "First", "size": 3}]));
    assert_eq!(init["voteTallies"], json!({"L1": {"up": 0, "down": 0}}));
    handle.shutdown().await;
}

#[tokio::test]
async fn retried_comment_is_confirmed_once_stored() {
    let handle = serve(config(), Arc::new(MemoryStore::new())).await;
    let (mut a, _) = join(&handle).await;

    let comment = json!({"type": "comment", "content": "hello", "id": "c1", "timestamp": 7});
    send(&mut a, comment.clone()).await;
    let original = next_event(&mut a).await;
    send(&mut a, comment).await;
    assert_eq!(next_event(&mut a).await, original);

    let (_late, init) = join(&handle).await;
    assert_eq!(init["comments"].as_array().unwrap().len(), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn vote_values_map_to_up_or_down() {
    let handle = serve(config(), Arc::new(MemoryStore::new())).await;
    let (mut a, _) = join(&handle).await;

    send(&mut a, json!({"type": "new_level", "level": {"id": "X", "name": "Ex"}})).await;
    next_event(&mut a).await;

    send(&mut a, json!({"type": "vote_level", "levelId": "X", "value": 1})).await;
    let event = next_event(&mut a).await;
    assert_eq!(event["type"], "vote_level");
    assert_eq!(event["levelId"], "X");
    assert_eq!(event["votes"], json!({"up": 1, "down": 0}));

    send(&mut a, json!({"type": "vote_level", "levelId": "X", "value": "1"})).await;
    let event = next_event(&mut a).await;
    assert_eq!(event["votes"], json!({"up": 1, "down": 1}));

    send(&mut a, json!({"type": "comment", "content": "rate me", "id": 42})).await;
    let event = next_event(&mut a).await;
    assert_eq!(event["id"], "42");

    send(&mut a, json!({"type": "vote_comment", "messageId": 42, "value": -1})).await;
    let event = next_event(&mut a).await;
    assert_eq!(event["type"], "vote_comment");
    assert_eq!(event["messageId"], "42");
    assert_eq!(event["upvotes"], 0);
    assert_eq!(event["downvotes"], 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn invalid_and_missing_targets_are_silent() {
    let handle = serve(config(), Arc::new(MemoryStore::new())).await;
    let (mut a, _) = join(&handle).await;

    send(&mut a, json!({"type": "delete_message", "messageId": "ghost"})).await;
    send(&mut a, json!({"type": "delete_level", "levelId": "ghost"})).await;
    send(&mut a, json!({"type": "vote_level", "levelId": "ghost", "value": 1})).await;
    send(&mut a, json!({"type": "teleport"})).await;
    send(&mut a, json!({"content": "no type"})).await;
    send_raw(&mut a, "still connected").await;

    let event = next_event(&mut a).await;
    assert_eq!(event["type"], "comment");
    assert_eq!(event["content"], "still connected");
    handle.shutdown().await;
}

#[tokio::test]
async fn deletes_broadcast_ids() {
    let handle = serve(config(), Arc::new(MemoryStore::new())).await;
    let (mut a, _) = join(&handle).await;
    let (mut b, _) = join(&handle).await;

    send(&mut a, json!({"type": "comment", "content": "bye", "id": "c-1"})).await;
    next_event(&mut a).await;
    next_event(&mut b).await;

    send(&mut a, json!({"type": "delete_message", "messageId": "c-1"})).await;
    for ws in [&mut a, &mut b] {
        assert_eq!(
            next_event(ws).await,
            json!({"type": "delete_message", "messageId": "c-1"})
        );
    }

    let (_late, init) = join(&handle).await;
    assert_eq!(init["comments"], json!([]));
    handle.shutdown().await;
}

#[tokio::test]
async fn admin_secret_guards_deletes() {
    let config = ServerConfig {
        admin_secret: Some("hunter2".into()),
        ..config()
    };
    let handle = serve(config, Arc::new(MemoryStore::new())).await;
    let (mut a, _) = join(&handle).await;

    send(&mut a, json!({"type": "new_level", "level": {"id": "L", "name": "Keep"}})).await;
    next_event(&mut a).await;

    send(&mut a, json!({"type": "delete_level", "levelId": "L"})).await;
    send(&mut a, json!({"type": "delete_level", "levelId": "L", "adminSecret": "hunter2"})).await;
    let event = next_event(&mut a).await;
    assert_eq!(event, json!({"type": "delete_level", "levelId": "L"}));
    handle.shutdown().await;
}

#[tokio::test]
async fn exclude_sender_policy_skips_origin() {
    let config = ServerConfig {
        policy: BroadcastPolicy::ExcludeSender,
        ..config()
    };
    let handle = serve(config, Arc::new(MemoryStore::new())).await;
    let (mut a, _) = join(&handle).await;
    let (mut b, _) = join(&handle).await;

    send_raw(&mut a, "from a").await;
    assert_eq!(next_event(&mut b).await["content"], "from a");

    send_raw(&mut b, "from b").await;
    // a never saw its own comment
    assert_eq!(next_event(&mut a).await["content"], "from b");
    handle.shutdown().await;
}

#[tokio::test]
async fn health_counts_connections() {
    let handle = serve(config(), Arc::new(MemoryStore::new())).await;
    let (mut a, _) = join(&handle).await;
    send_raw(&mut a, "counted").await;
    next_event(&mut a).await;

    let url = format!("http://127.0.0.1:{}/health", handle.port());
    let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(body["connections"], 1);
    assert_eq!(body["comments"], 1);
    handle.shutdown().await;
}

async fn populate(handle: &ServerHandle) {
    let (mut a, _) = join(handle).await;
    send(&mut a, json!({"type": "comment", "content": "persisted", "id": "c1", "timestamp": 5})).await;
    next_event(&mut a).await;
    send(&mut a, json!({"type": "new_level", "level": {"id": "L", "name": "Stored", "grid": [1, 2]}})).await;
    next_event(&mut a).await;
    send(&mut a, json!({"type": "vote_level", "levelId": "L", "value": 1})).await;
    // broadcast follows the commit
    next_event(&mut a).await;
}

fn assert_restored(init: &Value) {
    assert_eq!(
        init["comments"],
        json!([{
            "id": "c1",
            "content": "persisted",
            "timestamp": 5,
            "origin": "web",
            "upvotes": 0,
            "downvotes": 0
        }])
    );
    assert_eq!(init["items"], json!([{"id": "L", "name": "Stored", "grid": [1, 2]}]));
    assert_eq!(init["voteTallies"], json!({"L": {"up": 1, "down": 0}}));
}

#[tokio::test]
async fn json_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.json");

    let handle = serve(config(), Arc::new(JsonFileStore::open(&path).unwrap())).await;
    populate(&handle).await;
    handle.shutdown().await;

    let handle = serve(config(), Arc::new(JsonFileStore::open(&path).unwrap())).await;
    let (_ws, init) = join(&handle).await;
    assert_restored(&init);
    handle.shutdown().await;
}

#[tokio::test]
async fn sqlite_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");

    let handle = serve(config(), Arc::new(SqliteStore::open(&path).unwrap())).await;
    populate(&handle).await;
    handle.shutdown().await;

    let handle = serve(config(), Arc::new(SqliteStore::open(&path).unwrap())).await;
    let (_ws, init) = join(&handle).await;
    assert_restored(&init);
    handle.shutdown().await;
}

#[tokio::test]
async fn corrupted_document_blocks_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.json");
    std::fs::write(&path, "{ not json").unwrap();

    let store = Arc::new(JsonFileStore::open(&path).unwrap());
    let err = start(config(), store).await.err().unwrap();
    assert!(matches!(err, ServerError::Load(_)));
    // the damaged file is left for inspection
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
}
