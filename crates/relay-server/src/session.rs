use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::engine::Command;
use crate::registry::{ClientId, ConnectionRegistry};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A client silent to pings for this long is disconnected.
const PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Drive one WebSocket connection from upgrade to close: register, ask the
/// engine for the join snapshot, then pump frames both ways until either
/// side stops.
pub async fn handle_socket(
    socket: WebSocket,
    registry: Arc<ConnectionRegistry>,
    commands: mpsc::Sender<Command>,
) {
    let (client_id, rx) = registry.register();
    tracing::info!(client_id = %client_id, "client connected");

    if commands.send(Command::Join(client_id.clone())).await.is_err() {
        tracing::warn!(client_id = %client_id, "engine stopped, refusing connection");
        registry.unregister(&client_id);
        return;
    }

    let (ws_tx, ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_frames(
        ws_tx,
        rx,
        Arc::clone(&registry),
        client_id.clone(),
    ));
    let mut reader = tokio::spawn(read_frames(
        ws_rx,
        Arc::clone(&registry),
        client_id.clone(),
        commands,
    ));

    tokio::select! {
        _ = &mut writer => {},
        _ = &mut reader => {},
    }
    writer.abort();
    reader.abort();

    if registry.unregister(&client_id) {
        tracing::info!(client_id = %client_id, "client disconnected");
    } else {
        tracing::debug!(client_id = %client_id, "client already dropped by registry");
    }
}

/// Forward queued frames to the socket, with a periodic ping. Ends when the
/// registry drops the connection, the socket rejects a write, or the client
/// stops answering pings.
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Arc<str>>,
    registry: Arc<ConnectionRegistry>,
    client_id: ClientId,
) {
    let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping_interval.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(WsMessage::Text(Utf8Bytes::from(&*frame))).await.is_err() {
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if !registry.is_alive(&client_id, PONG_TIMEOUT) {
                    tracing::warn!(client_id = %client_id, timeout = ?PONG_TIMEOUT, "client stopped answering pings, disconnecting");
                    break;
                }
                if ws_tx.send(WsMessage::Ping(Vec::<u8>::new().into())).await.is_err() {
                    break;
                }
                tracing::trace!(client_id = %client_id, "sent ping");
            }
        }
    }
    let _ = ws_tx.close().await;
}

/// Enqueue every inbound text frame for the engine. Binary frames are
/// accepted when they hold UTF-8.
async fn read_frames(
    mut ws_rx: SplitStream<WebSocket>,
    registry: Arc<ConnectionRegistry>,
    client_id: ClientId,
    commands: mpsc::Sender<Command>,
) {
    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text.as_str().to_owned(),
            Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!(client_id = %client_id, len = bytes.len(), "ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(WsMessage::Pong(_)) => {
                registry.record_pong(&client_id);
                continue;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(client_id = %client_id, error = %e, "socket read failed");
                break;
            }
        };

        let command = Command::Message {
            client_id: client_id.clone(),
            text,
        };
        if commands.send(command).await.is_err() {
            break;
        }
    }
}
