use matchlog_primitives::{IncidentId, Peer};
use tokio::sync::mpsc;

/// Asynchronous notifications for the UI layer. The mutation API never
/// blocks on any of these — they surface through a channel the UI drains.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ClientEvent {
    Connected { sku: String },
    Disconnected { sku: String },
    SyncCompleted { sku: String },
    /// A remote tombstone expunged a local incident; the UI shows a toast.
    IncidentDeleted { sku: String, id: IncidentId },
    /// The server refused us permanently; reconnects have stopped.
    AdmissionRevoked { sku: String },
    /// Consecutive transient failures; the UI stays quiet until three.
    NetworkTrouble { sku: String, consecutive: u32 },
    PeerJoined { sku: String, peer: Peer },
    PeerLeft { sku: String, peer: Peer },
    ChatMessage { sku: String, from: Peer, message: String },
}

/// Best-effort sender for [`ClientEvent`]s. A missing or lagging UI never
/// stalls the sync pipeline.
#[derive(Clone, Debug)]
pub struct Notifier {
    sender: mpsc::UnboundedSender<ClientEvent>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn notify(&self, event: ClientEvent) {
        let _ = self.sender.send(event);
    }
}
