//! The `/join` socket endpoint.
//!
//! The handshake is the only authenticated moment: the connect URL carries
//! the peer id, display name, signing date, and a signature over the URL
//! minus the signature parameter. After the upgrade the instance evicts any
//! prior socket for the same peer, announces the join, and sends the full
//! snapshot to the new socket only. Per-frame signing is not done.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use matchlog_identity::{socket_join_path, verify_request, RequestSignature};
use matchlog_primitives::{Peer, PeerId};
use matchlog_server_primitives::{ClientFrame, ControlFrame, Frame, FrameSender, ServerFrame};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::ApiError;
use crate::instance::{EventInstance, SessionCommand};
use crate::ServiceState;

/// Pongs a socket may leave unanswered before it is closed.
const MAX_MISSED_PONGS: u32 = 2;

#[derive(Debug, Deserialize)]
pub struct JoinQuery {
    pub id: String,
    pub name: String,
    pub signature: String,
    pub date: String,
}

/// `GET /:sku/join` — authenticate the handshake and upgrade.
pub async fn join(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<ServiceState>>,
    Path(sku): Path<String>,
    Query(query): Query<JoinQuery>,
) -> Response {
    let peer_id = PeerId::new(query.id);

    let signature = RequestSignature {
        peer: peer_id.clone(),
        signature: query.signature,
        date: query.date.clone(),
    };
    let signable = socket_join_path(&sku, &peer_id, &query.name, &query.date);

    if let Err(err) = verify_request(
        &signature,
        "GET",
        &signable,
        b"",
        Utc::now(),
        state.config.signature_skew(),
    ) {
        debug!(peer = %peer_id, %err, "socket handshake signature rejected");
        return ApiError::bad_signature().into_response();
    }

    let instance = match state.instance(&sku).await {
        Ok(instance) => instance,
        Err(err) => return err.into_response(),
    };

    if !instance.is_member(&peer_id).await {
        return ApiError::forbidden().into_response();
    }

    let peer = Peer {
        id: peer_id,
        name: query.name,
    };
    let ping_interval = state.config.ping_interval();

    ws.on_upgrade(move |socket| handle_socket(socket, instance, peer, ping_interval))
}

async fn handle_socket(
    socket: WebSocket,
    instance: Arc<EventInstance>,
    peer: Peer,
    ping_interval: std::time::Duration,
) {
    let (commands_sender, commands_receiver) = mpsc::channel(32);
    let (socket_sender, mut socket_receiver) = socket.split();

    let writer = tokio::spawn(handle_commands(commands_receiver, socket_sender));

    // Register the session; any previous socket for this peer id is closed
    // before the snapshot goes out.
    let info = instance.join(peer.clone(), commands_sender.clone()).await;

    info!(sku = %instance.sku, peer = %peer.id, name = %peer.name, "socket joined");

    let snapshot = Frame::new(
        ServerFrame::Control(ControlFrame::ServerShareInfo {
            info: Box::new(info),
        }),
        FrameSender::Server,
        Utc::now(),
    );
    match serde_json::to_string(&snapshot) {
        Ok(text) => {
            let _ = commands_sender.send(SessionCommand::Send(text)).await;
        }
        Err(err) => error!(sku = %instance.sku, %err, "failed to serialize snapshot"),
    }

    let missed_pongs = Arc::new(AtomicU32::new(0));

    let pinger = tokio::spawn(keepalive(
        ping_interval,
        commands_sender.clone(),
        missed_pongs.clone(),
    ));

    while let Some(message) = socket_receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(peer = %peer.id, %err, "socket read failed");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                handle_frame(&instance, &peer, &text).await;
            }
            Message::Pong(_) => {
                missed_pongs.store(0, Ordering::Relaxed);
            }
            Message::Ping(_) | Message::Binary(_) => {}
            Message::Close(_) => break,
        }
    }

    pinger.abort();
    instance.leave(&peer.id, &commands_sender).await;
    let _ = commands_sender.send(SessionCommand::Close).await;
    drop(writer);

    info!(sku = %instance.sku, peer = %peer.id, "socket closed");
}

/// Dispatch one inbound frame. Refused mutations (tombstoned adds, stale
/// edits) are dropped: reconciliation on the next snapshot straightens the
/// sender out.
async fn handle_frame(instance: &Arc<EventInstance>, peer: &Peer, text: &str) {
    let frame: Frame<ClientFrame> = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(peer = %peer.id, %err, "dropping malformed frame");
            return;
        }
    };

    // The server stamps the sender itself rather than trusting the frame.
    let sender = FrameSender::Client {
        id: peer.id.clone(),
        name: peer.name.clone(),
    };

    let result = match frame.payload {
        ClientFrame::AddIncident { incident } => instance.add_incident(incident, sender).await,
        ClientFrame::UpdateIncident { incident } => {
            instance.update_incident(incident, sender).await
        }
        ClientFrame::RemoveIncident { id } => instance.remove_incident(id, sender).await,
        ClientFrame::ScratchpadUpdate { id, scratchpad } => {
            instance.update_scratchpad(id, scratchpad, sender).await
        }
        ClientFrame::Message { message } => {
            instance.broadcast_message(message, sender).await;
            Ok(())
        }
    };

    if let Err(err) = result {
        debug!(peer = %peer.id, %err, "socket mutation refused");
    }
}

async fn keepalive(
    interval: std::time::Duration,
    commands: mpsc::Sender<SessionCommand>,
    missed_pongs: Arc<AtomicU32>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        if missed_pongs.fetch_add(1, Ordering::Relaxed) >= MAX_MISSED_PONGS {
            let _ = commands.send(SessionCommand::Close).await;
            return;
        }

        if commands.send(SessionCommand::Ping).await.is_err() {
            return;
        }
    }
}

async fn handle_commands(
    mut commands: mpsc::Receiver<SessionCommand>,
    mut socket: SplitSink<WebSocket, Message>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            SessionCommand::Send(text) => {
                if let Err(err) = socket.send(Message::Text(text)).await {
                    debug!(%err, "socket send failed");
                    break;
                }
            }
            SessionCommand::Ping => {
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            SessionCommand::Close => {
                let _ = socket.send(Message::Close(None)).await;
                let _ = socket.close().await;
                break;
            }
        }
    }
}
