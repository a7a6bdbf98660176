//! Annotator mirror peer.
//!
//! A WebSocket stand-in for the kernel-side process: keeps a mirror of
//! every connected document's annotator state, answers `sync_request`
//! with the full state, applies and forwards structural patches,
//! rebroadcasts `action` envelopes to every listener (the origin included,
//! which is what `exceptId` echo suppression exists for), and serves a
//! small built-in `method_call` table.

mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use kernel_sync::{methods, AppDescriptor, Envelope, MethodCallData, PatchData, SourceMapEntry};

use crate::session::{send_envelope, SessionMap, Tx};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mirror_server=debug,kernel_sync=debug")
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9090".to_string());
    let listener = TcpListener::bind(&addr).await?;
    info!("mirror server listening on: {}", addr);

    let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));

    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!("new connection from: {}", peer_addr);
        tokio::spawn(handle_connection(stream, peer_addr, sessions.clone()));
    }

    Ok(())
}

/// The capability surface announced to every client. The methods are the
/// client-side application hooks the mirror may call back into; the
/// source text and line map exist so client-side failures can be traced
/// back to the authored logic.
fn app_descriptor() -> AppDescriptor {
    AppDescriptor {
        methods: vec!["refresh".to_string(), "highlight".to_string()],
        source: "def refresh(view):\n    view.redraw()\n\ndef highlight(view, row):\n    view.mark(row)\n".to_string(),
        sourcemap: vec![
            SourceMapEntry {
                generated: 1,
                source: 1,
            },
            SourceMapEntry {
                generated: 2,
                source: 2,
            },
            SourceMapEntry {
                generated: 4,
                source: 4,
            },
            SourceMapEntry {
                generated: 5,
                source: 5,
            },
        ],
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, sessions: SessionMap) {
    let mut channel_path = String::from("/annotator");
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        channel_path = req.uri().path().to_string();
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let client_id = Uuid::new_v4();
    info!(
        "client {} attached to channel {} from {}",
        client_id, channel_path, addr
    );

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    {
        let mut sessions_lock = sessions.write().await;
        let session = sessions_lock.entry(channel_path.clone()).or_default();
        session.add_client(client_id, tx.clone());
        debug!(
            "channel {} now has {} client(s), open since {}",
            channel_path,
            session.clients.len(),
            session.created_at
        );
    }

    // Announce the application surface to the new client right away.
    send_envelope(&tx, &Envelope::set_app_code(&app_descriptor()));

    // Task to deliver queued messages to this client.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                error!("failed to send message: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!("error receiving message: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if let Err(e) =
                    handle_envelope(&sessions, &channel_path, client_id, &text, &tx).await
                {
                    error!("error handling message from {}: {}", client_id, e);
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                info!("client {} requested close", client_id);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect.
    {
        let mut sessions_lock = sessions.write().await;
        if let Some(session) = sessions_lock.get_mut(&channel_path) {
            session.remove_client(&client_id);
            if session.clients.is_empty() {
                info!("channel {} is empty, removing", channel_path);
                sessions_lock.remove(&channel_path);
            }
        }
    }

    send_task.abort();
    info!("connection closed: {} ({})", client_id, addr);
}

async fn handle_envelope(
    sessions: &SessionMap,
    channel_path: &str,
    client_id: Uuid,
    text: &str,
    tx: &Tx,
) -> anyhow::Result<()> {
    let envelope: Envelope = serde_json::from_str(text)?;

    match envelope.method.as_str() {
        methods::SYNC_REQUEST => {
            let sessions_lock = sessions.read().await;
            let session = sessions_lock
                .get(channel_path)
                .ok_or_else(|| anyhow::anyhow!("unknown channel {channel_path}"))?;
            debug!("pushing full state to client {}", client_id);
            send_envelope(tx, &Envelope::sync(session.state.clone()));
        }

        methods::PATCH => {
            let PatchData { patches } = serde_json::from_value(envelope.data.clone())?;

            let mut sessions_lock = sessions.write().await;
            let session = sessions_lock
                .get_mut(channel_path)
                .ok_or_else(|| anyhow::anyhow!("unknown channel {channel_path}"))?;

            match annotator::apply(&session.state, &patches) {
                Ok(next) => {
                    session.state = next;
                    // Mirror the edit out to everyone else on the channel.
                    session.broadcast(&envelope, Some(client_id));
                    debug!(
                        "applied {} patch op(s) from client {}",
                        patches.len(),
                        client_id
                    );
                }
                Err(e) => {
                    error!("patch from client {} does not apply: {}", client_id, e);
                }
            }
        }

        methods::ACTION => {
            // Actions are rebroadcast to every listener, the origin
            // included; the origin recognizes itself via exceptId.
            let sessions_lock = sessions.read().await;
            let session = sessions_lock
                .get(channel_path)
                .ok_or_else(|| anyhow::anyhow!("unknown channel {channel_path}"))?;
            session.broadcast(&envelope, None);
        }

        methods::METHOD_CALL => {
            let call: MethodCallData = serde_json::from_value(envelope.data.clone())?;
            let value = dispatch_method(sessions, channel_path, &call).await;
            send_envelope(tx, &Envelope::method_return(call.callback_id, value));
        }

        other => {
            debug!("ignoring {} from client {}", other, client_id);
        }
    }

    Ok(())
}

/// Built-in remote procedures served to clients.
async fn dispatch_method(
    sessions: &SessionMap,
    channel_path: &str,
    call: &MethodCallData,
) -> serde_json::Value {
    match call.method_name.as_str() {
        "ping" => serde_json::Value::String("pong".to_string()),

        "echo" => serde_json::Value::Array(call.args.clone()),

        "server_time" => serde_json::Value::String(chrono::Utc::now().to_rfc3339()),

        "state_size" => {
            let sessions_lock = sessions.read().await;
            let size = sessions_lock
                .get(channel_path)
                .and_then(|session| serde_json::to_string(&session.state).ok())
                .map(|json| json.len())
                .unwrap_or(0);
            serde_json::Value::from(size)
        }

        other => {
            warn!("method_call for unknown method `{}`", other);
            serde_json::Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_sync::{MethodReturnData, SessionId};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn envelope_from(msg: Message) -> Envelope {
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    struct Seeded {
        sessions: SessionMap,
        origin: Uuid,
        origin_rx: UnboundedReceiver<Message>,
        origin_tx: Tx,
        other_rx: UnboundedReceiver<Message>,
    }

    async fn seeded_session() -> Seeded {
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let origin = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (origin_tx, origin_rx) = mpsc::unbounded_channel();
        let (other_tx, other_rx) = mpsc::unbounded_channel();
        {
            let mut lock = sessions.write().await;
            let session = lock.entry("/doc".to_string()).or_default();
            session.state = json!({"rows": []});
            session.add_client(origin, origin_tx.clone());
            session.add_client(other, other_tx);
        }
        Seeded {
            sessions,
            origin,
            origin_rx,
            origin_tx,
            other_rx,
        }
    }

    #[tokio::test]
    async fn sync_request_is_answered_with_the_full_state() {
        let mut seeded = seeded_session().await;

        let text = serde_json::to_string(&Envelope::sync_request()).unwrap();
        handle_envelope(
            &seeded.sessions,
            "/doc",
            seeded.origin,
            &text,
            &seeded.origin_tx,
        )
        .await
        .unwrap();

        let reply = envelope_from(seeded.origin_rx.recv().await.unwrap());
        assert_eq!(reply.method, methods::SYNC);
        assert_eq!(reply.data["state"], json!({"rows": []}));
    }

    #[tokio::test]
    async fn actions_echo_to_every_client_with_metadata_intact() {
        let mut seeded = seeded_session().await;

        let mut envelope = Envelope::new(methods::ACTION, json!({"type": "ADD_ROW"}));
        envelope.metadata.except_id = Some(SessionId::new());
        let text = serde_json::to_string(&envelope).unwrap();
        handle_envelope(
            &seeded.sessions,
            "/doc",
            seeded.origin,
            &text,
            &seeded.origin_tx,
        )
        .await
        .unwrap();

        // The origin gets its own echo back; exceptId survives the trip.
        let to_origin = envelope_from(seeded.origin_rx.recv().await.unwrap());
        let to_other = envelope_from(seeded.other_rx.recv().await.unwrap());
        assert_eq!(to_origin.metadata, envelope.metadata);
        assert_eq!(to_other.metadata, envelope.metadata);
        assert_eq!(to_other.data["type"], json!("ADD_ROW"));
    }

    #[tokio::test]
    async fn patches_apply_to_the_mirror_and_forward_to_other_clients() {
        let mut seeded = seeded_session().await;

        let envelope = Envelope::new(
            methods::PATCH,
            json!({"patches": [{"op": "add", "path": ["rows", 0], "value": {"label": "r0"}}]}),
        );
        let text = serde_json::to_string(&envelope).unwrap();
        handle_envelope(
            &seeded.sessions,
            "/doc",
            seeded.origin,
            &text,
            &seeded.origin_tx,
        )
        .await
        .unwrap();

        let lock = seeded.sessions.read().await;
        let session = lock.get("/doc").unwrap();
        assert_eq!(session.state["rows"][0]["label"], json!("r0"));
        drop(lock);

        // Forwarded to the other client, not back to the origin.
        let forwarded = envelope_from(seeded.other_rx.recv().await.unwrap());
        assert_eq!(forwarded.method, methods::PATCH);
        assert!(seeded.origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ping_method_call_is_answered_with_pong() {
        let mut seeded = seeded_session().await;

        let callback_id = kernel_sync::CallbackId::new();
        let envelope = Envelope::method_call("ping", vec![], callback_id);
        let text = serde_json::to_string(&envelope).unwrap();
        handle_envelope(
            &seeded.sessions,
            "/doc",
            seeded.origin,
            &text,
            &seeded.origin_tx,
        )
        .await
        .unwrap();

        let reply = envelope_from(seeded.origin_rx.recv().await.unwrap());
        assert_eq!(reply.method, methods::METHOD_RETURN);
        let data: MethodReturnData = serde_json::from_value(reply.data).unwrap();
        assert_eq!(data.callback_id, callback_id);
        assert_eq!(data.value, json!("pong"));
    }
}
