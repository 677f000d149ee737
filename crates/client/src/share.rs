//! The per-event share connection.
//!
//! A single background driver owns the socket and walks the lifecycle
//! `Closed → Connecting → Open → Closing → Closed`. Nothing reaches inside:
//! the UI and the replica talk to it through commands. Reconnects after an
//! abnormal close are flat 5 s; a permanent refusal (revoked invitation)
//! stops the machine and surfaces to the UI.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use futures_util::{SinkExt, StreamExt};
use matchlog_identity::{canonical_request, socket_join_path};
use matchlog_primitives::PeerId;
use matchlog_server_primitives::{
    ClientFrame, ControlFrame, Frame, FrameSender, ServerFrame, ShareInfo,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::Connection;
use crate::error::ClientError;
use crate::events::{ClientEvent, Notifier};
use crate::replica::{QueuedOp, Replica};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Observable lifecycle of the share connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// Commands accepted by the driver.
#[derive(Debug)]
pub enum ShareCommand {
    Connect,
    Disconnect,
    Send(ClientFrame),
    ForceSync,
}

/// Handle to one event's share connection.
#[derive(Clone, Debug)]
pub struct ShareConnection {
    commands: mpsc::Sender<ShareCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl ShareConnection {
    /// Spawn the driver for `sku`.
    pub fn spawn(
        sku: String,
        display_name: String,
        replica: Replica,
        connection: Connection,
        notifier: Notifier,
    ) -> Self {
        let (commands, receiver) = mpsc::channel(32);
        let (state_sender, state) = watch::channel(ConnectionState::Closed);

        drop(tokio::spawn(
            Driver {
                sku,
                display_name,
                replica,
                connection,
                notifier,
                state: state_sender,
            }
            .run(receiver),
        ));

        Self { commands, state }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn connect(&self) {
        let _ = self.commands.send(ShareCommand::Connect).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.commands.send(ShareCommand::Disconnect).await;
    }

    /// Best-effort send; the mutation is already durable locally.
    pub async fn send(&self, frame: ClientFrame) {
        let _ = self.commands.send(ShareCommand::Send(frame)).await;
    }

    /// Out-of-band full-snapshot recovery.
    pub async fn force_sync(&self) {
        let _ = self.commands.send(ShareCommand::ForceSync).await;
    }
}

enum SessionEnd {
    /// Explicit disconnect: no reconnect.
    Disconnect,
    /// Socket lost: reconnect after the flat delay.
    Lost,
}

struct Driver {
    sku: String,
    display_name: String,
    replica: Replica,
    connection: Connection,
    notifier: Notifier,
    state: watch::Sender<ConnectionState>,
}

impl Driver {
    async fn run(self, mut commands: mpsc::Receiver<ShareCommand>) {
        loop {
            // Closed: wait for something to do.
            let Some(command) = commands.recv().await else {
                return;
            };
            match command {
                ShareCommand::Connect => {}
                ShareCommand::ForceSync => {
                    self.offline_sync().await;
                    continue;
                }
                ShareCommand::Send(frame) => {
                    // No socket: push over signed HTTP instead, queueing
                    // only what that cannot deliver.
                    self.push_http(frame).await;
                    continue;
                }
                ShareCommand::Disconnect => continue,
            }

            // Connecting / Open until told to stop.
            'session: loop {
                let _ = self.state.send(ConnectionState::Connecting);

                let socket = match self.open_socket().await {
                    Ok(socket) => socket,
                    Err(ConnectError::Permanent(status)) => {
                        warn!(sku = %self.sku, %status, "join refused permanently, giving up");
                        self.notifier.notify(ClientEvent::AdmissionRevoked {
                            sku: self.sku.clone(),
                        });
                        break 'session;
                    }
                    Err(ConnectError::Transient(err)) => {
                        debug!(sku = %self.sku, %err, "join failed, retrying in 5s");
                        match self.wait_reconnect(&mut commands).await {
                            SessionEnd::Lost => continue 'session,
                            SessionEnd::Disconnect => break 'session,
                        }
                    }
                };

                match self.run_open(socket, &mut commands).await {
                    SessionEnd::Disconnect => break 'session,
                    SessionEnd::Lost => {
                        self.notifier.notify(ClientEvent::Disconnected {
                            sku: self.sku.clone(),
                        });
                        match self.wait_reconnect(&mut commands).await {
                            SessionEnd::Lost => continue 'session,
                            SessionEnd::Disconnect => break 'session,
                        }
                    }
                }
            }

            let _ = self.state.send(ConnectionState::Closed);
        }
    }

    /// Sleep out the reconnect delay, still answering commands.
    async fn wait_reconnect(&self, commands: &mut mpsc::Receiver<ShareCommand>) -> SessionEnd {
        let sleep = tokio::time::sleep(RECONNECT_DELAY);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return SessionEnd::Lost,
                command = commands.recv() => match command {
                    None | Some(ShareCommand::Disconnect) => return SessionEnd::Disconnect,
                    // An explicit connect retries immediately.
                    Some(ShareCommand::Connect) => return SessionEnd::Lost,
                    Some(ShareCommand::Send(frame)) => self.queue_frame(frame),
                    Some(ShareCommand::ForceSync) => self.offline_sync().await,
                },
            }
        }
    }

    async fn open_socket(&self) -> Result<Socket, ConnectError> {
        let keypair = self.connection.keypair();
        let date = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let signable = socket_join_path(&self.sku, &keypair.peer_id(), &self.display_name, &date);
        let signature = keypair.sign(canonical_request("GET", &signable, &date, b"").as_bytes());

        let url = match join_url(self.connection.base(), &signable, &signature) {
            Ok(url) => url,
            Err(err) => return Err(ConnectError::Transient(err.to_string())),
        };

        match connect_async(url.as_str()).await {
            Ok((socket, _)) => Ok(socket),
            Err(WsError::Http(response)) if response.status().is_client_error() => {
                Err(ConnectError::Permanent(response.status()))
            }
            Err(err) => Err(ConnectError::Transient(err.to_string())),
        }
    }

    /// One open session: drain the queue, then pump frames and commands
    /// until the socket drops or the user disconnects.
    async fn run_open(&self, mut socket: Socket, commands: &mut mpsc::Receiver<ShareCommand>) -> SessionEnd {
        let _ = self.state.send(ConnectionState::Open);
        info!(sku = %self.sku, "share connection open");
        self.notifier.notify(ClientEvent::Connected {
            sku: self.sku.clone(),
        });

        // Offline work goes out first; the snapshot reconcile that follows
        // repairs anything this pass misses.
        match self.replica.drain_queue(&self.sku) {
            Ok(queue) => {
                let mut pending = queue.into_iter();
                while let Some(op) = pending.next() {
                    let frame = op_frame(op);
                    if self.send_frame(&mut socket, &frame).await.is_err() {
                        // Put back the failed op and everything behind it.
                        self.queue_frame(frame);
                        for op in pending {
                            self.queue_frame(op_frame(op));
                        }
                        return SessionEnd::Lost;
                    }
                }
            }
            Err(err) => warn!(sku = %self.sku, %err, "failed to drain outbound queue"),
        }

        loop {
            tokio::select! {
                message = socket.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            debug!(sku = %self.sku, %err, "socket read failed");
                            return SessionEnd::Lost;
                        }
                        None => return SessionEnd::Lost,
                    };

                    match message {
                        Message::Text(text) => {
                            if let Err(err) = self.handle_server_frame(&mut socket, &text).await {
                                debug!(sku = %self.sku, %err, "failed to handle server frame");
                            }
                        }
                        Message::Close(_) => return SessionEnd::Lost,
                        // Pings are answered by the protocol layer.
                        Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
                    }
                }
                command = commands.recv() => match command {
                    None => return SessionEnd::Disconnect,
                    Some(ShareCommand::Disconnect) => {
                        let _ = self.state.send(ConnectionState::Closing);
                        let _ = socket.close(None).await;
                        return SessionEnd::Disconnect;
                    }
                    Some(ShareCommand::Connect) => {}
                    Some(ShareCommand::Send(frame)) => {
                        if self.send_frame(&mut socket, &frame).await.is_err() {
                            self.queue_frame(frame);
                            return SessionEnd::Lost;
                        }
                    }
                    Some(ShareCommand::ForceSync) => {
                        match self.connection.snapshot(&self.sku).await {
                            Ok(info) => {
                                if let Err(err) = self.reconcile_and_push(&mut socket, &info).await {
                                    debug!(sku = %self.sku, %err, "force-sync reconcile failed");
                                }
                            }
                            Err(err) => warn!(sku = %self.sku, %err, "force-sync fetch failed"),
                        }
                    }
                },
            }
        }
    }

    async fn handle_server_frame(
        &self,
        socket: &mut Socket,
        text: &str,
    ) -> Result<(), ClientError> {
        let frame: Frame<ServerFrame> = serde_json::from_str(text)
            .map_err(|err| ClientError::Malformed(err.to_string()))?;

        let own_id = self.connection.keypair().peer_id();

        match frame.payload {
            ServerFrame::Control(ControlFrame::ServerShareInfo { info }) => {
                self.reconcile_and_push(socket, &info).await?;
            }
            ServerFrame::Control(ControlFrame::ServerUserAdd { user, .. }) => {
                self.notifier.notify(ClientEvent::PeerJoined {
                    sku: self.sku.clone(),
                    peer: user,
                });
            }
            ServerFrame::Control(ControlFrame::ServerUserRemove { user, .. }) => {
                self.notifier.notify(ClientEvent::PeerLeft {
                    sku: self.sku.clone(),
                    peer: user,
                });
            }
            ServerFrame::Echo(echo) => {
                // Our own writes are already applied locally.
                if sender_id(&frame.sender) == Some(&own_id) {
                    return Ok(());
                }
                self.apply_echo(echo, &frame.sender)?;
            }
        }

        Ok(())
    }

    fn apply_echo(&self, echo: ClientFrame, sender: &FrameSender) -> Result<(), ClientError> {
        match echo {
            ClientFrame::AddIncident { incident } | ClientFrame::UpdateIncident { incident } => {
                self.replica.apply_remote_incident(&self.sku, incident)
            }
            ClientFrame::RemoveIncident { id } => self.replica.apply_remote_delete(&self.sku, id),
            ClientFrame::ScratchpadUpdate { id, scratchpad } => {
                self.replica.apply_remote_scratchpad(&self.sku, id, scratchpad)
            }
            ClientFrame::Message { message } => {
                if let FrameSender::Client { id, name } = sender {
                    self.notifier.notify(ClientEvent::ChatMessage {
                        sku: self.sku.clone(),
                        from: matchlog_primitives::Peer {
                            id: id.clone(),
                            name: name.clone(),
                        },
                        message,
                    });
                }
                Ok(())
            }
        }
    }

    /// Merge a snapshot and push the slices the server is missing.
    async fn reconcile_and_push(
        &self,
        socket: &mut Socket,
        info: &ShareInfo,
    ) -> Result<(), ClientError> {
        let frames = self.replica.reconcile(&self.sku, info)?;
        for frame in frames {
            if self.send_frame(socket, &frame).await.is_err() {
                self.queue_frame(frame);
                return Err(ClientError::Network("socket send failed".to_owned()));
            }
        }
        Ok(())
    }

    async fn send_frame(&self, socket: &mut Socket, payload: &ClientFrame) -> Result<(), ()> {
        let frame = Frame::new(
            payload,
            FrameSender::Client {
                id: self.connection.keypair().peer_id(),
                name: self.display_name.clone(),
            },
            Utc::now(),
        );

        let text = serde_json::to_string(&frame).map_err(|_| ())?;
        socket.send(Message::Text(text)).await.map_err(|_| ())
    }

    /// Fall back to the outbound queue when there is no socket to push on.
    fn queue_frame(&self, frame: ClientFrame) {
        if let Some(op) = frame_op(frame) {
            if let Err(err) = self.replica.enqueue(&self.sku, op) {
                warn!(sku = %self.sku, %err, "failed to enqueue outbound op");
            }
        }
    }

    /// Deliver one mutation over signed HTTP while no socket is open. The
    /// request layer already retries transients with backoff; whatever still
    /// fails transiently lands in the queue for the next session.
    async fn push_http(&self, frame: ClientFrame) {
        let result = match &frame {
            ClientFrame::AddIncident { incident } => {
                self.connection.put_incident(&self.sku, incident).await
            }
            ClientFrame::UpdateIncident { incident } => {
                self.connection.patch_incident(&self.sku, incident).await
            }
            ClientFrame::RemoveIncident { id } => {
                self.connection.delete_incident(&self.sku, id).await
            }
            // Scratchpads have no HTTP surface; they wait for the socket.
            ClientFrame::ScratchpadUpdate { .. } => {
                self.queue_frame(frame);
                return;
            }
            ClientFrame::Message { .. } => return,
        };

        match result {
            Ok(()) => {}
            Err(ClientError::Tombstoned) => {
                if let Some(id) = frame_incident_id(&frame) {
                    self.notifier.notify(ClientEvent::IncidentDeleted {
                        sku: self.sku.clone(),
                        id,
                    });
                }
            }
            // The server is ahead; a full snapshot reconcile sorts it out.
            Err(ClientError::Stale) => self.offline_sync().await,
            Err(ClientError::Forbidden) => {
                self.notifier.notify(ClientEvent::AdmissionRevoked {
                    sku: self.sku.clone(),
                });
            }
            Err(err) if err.is_transient() => {
                debug!(sku = %self.sku, %err, "http push failed, queueing");
                self.queue_frame(frame);
            }
            Err(err) => {
                warn!(sku = %self.sku, %err, "dropping non-retryable mutation");
            }
        }
    }

    /// Force-sync without a socket: reconcile over HTTP and queue the push
    /// side for the next connection.
    async fn offline_sync(&self) {
        match self.connection.snapshot(&self.sku).await {
            Ok(info) => match self.replica.reconcile(&self.sku, &info) {
                Ok(frames) => {
                    for frame in frames {
                        self.queue_frame(frame);
                    }
                }
                Err(err) => warn!(sku = %self.sku, %err, "offline reconcile failed"),
            },
            Err(err) => debug!(sku = %self.sku, %err, "offline snapshot fetch failed"),
        }
    }
}

enum ConnectError {
    Permanent(StatusCode),
    Transient(String),
}

fn frame_incident_id(frame: &ClientFrame) -> Option<matchlog_primitives::IncidentId> {
    match frame {
        ClientFrame::AddIncident { incident } | ClientFrame::UpdateIncident { incident } => {
            Some(incident.value.id.clone())
        }
        ClientFrame::RemoveIncident { id } => Some(id.clone()),
        ClientFrame::ScratchpadUpdate { .. } | ClientFrame::Message { .. } => None,
    }
}

fn sender_id(sender: &FrameSender) -> Option<&PeerId> {
    match sender {
        FrameSender::Client { id, .. } => Some(id),
        FrameSender::Server => None,
    }
}

fn op_frame(op: QueuedOp) -> ClientFrame {
    match op {
        QueuedOp::AddIncident { incident } => ClientFrame::AddIncident { incident },
        QueuedOp::EditIncident { incident } => ClientFrame::UpdateIncident { incident },
        QueuedOp::RemoveIncident { id } => ClientFrame::RemoveIncident { id },
        QueuedOp::ScratchpadUpdate { id, scratchpad } => {
            ClientFrame::ScratchpadUpdate { id, scratchpad }
        }
    }
}

fn frame_op(frame: ClientFrame) -> Option<QueuedOp> {
    match frame {
        ClientFrame::AddIncident { incident } => Some(QueuedOp::AddIncident { incident }),
        ClientFrame::UpdateIncident { incident } => Some(QueuedOp::EditIncident { incident }),
        ClientFrame::RemoveIncident { id } => Some(QueuedOp::RemoveIncident { id }),
        ClientFrame::ScratchpadUpdate { id, scratchpad } => {
            Some(QueuedOp::ScratchpadUpdate { id, scratchpad })
        }
        ClientFrame::Message { .. } => None,
    }
}

fn join_url(base: &Url, signable_path: &str, signature: &str) -> Result<Url, url::ParseError> {
    let mut url = base.join(&format!("{signable_path}&signature={signature}"))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    // set_scheme only rejects invalid transitions, which ws/wss are not.
    let _ = url.set_scheme(scheme);

    Ok(url)
}
