//! Socket frame protocol.
//!
//! Every frame is a JSON object `{type, ...body, sender, date}`. Peers send
//! mutations and chat; the server echoes those to every active socket with
//! the sender filled in, and additionally emits session-lifecycle frames.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use matchlog_crdt::{ConsistentMap, Envelope};
use matchlog_primitives::{Incident, IncidentId, Invitation, Peer, PeerId, Scratchpad, ScratchpadId};
use serde::{Deserialize, Serialize};

/// Who originated a frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FrameSender {
    Client { id: PeerId, name: String },
    Server,
}

/// A complete frame as it travels the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame<P> {
    #[serde(flatten)]
    pub payload: P,
    pub sender: FrameSender,
    pub date: DateTime<Utc>,
}

impl<P> Frame<P> {
    pub fn new(payload: P, sender: FrameSender, date: DateTime<Utc>) -> Self {
        Self {
            payload,
            sender,
            date,
        }
    }
}

/// Frames a peer may send to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    AddIncident {
        incident: Envelope<Incident>,
    },
    UpdateIncident {
        incident: Envelope<Incident>,
    },
    RemoveIncident {
        id: IncidentId,
    },
    ScratchpadUpdate {
        id: ScratchpadId,
        scratchpad: Envelope<Scratchpad>,
    },
    Message {
        message: String,
    },
}

/// The full snapshot a joining (or force-syncing) peer receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareInfo {
    pub active_users: Vec<Peer>,
    pub invitations: Vec<Invitation>,
    pub data: ConsistentMap<IncidentId, Incident>,
    pub scratchpads: BTreeMap<ScratchpadId, Envelope<Scratchpad>>,
}

/// Session-lifecycle frames only the server originates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    ServerShareInfo {
        #[serde(flatten)]
        info: Box<ShareInfo>,
    },
    ServerUserAdd {
        user: Peer,
        #[serde(rename = "activeUsers")]
        active_users: Vec<Peer>,
        invitations: Vec<Invitation>,
    },
    ServerUserRemove {
        user: Peer,
        #[serde(rename = "activeUsers")]
        active_users: Vec<Peer>,
        invitations: Vec<Invitation>,
    },
}

/// Frames the server sends to peers: its own control frames plus echoes of
/// peer mutations with the sender populated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Control(ControlFrame),
    Echo(ClientFrame),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn client_frame_wire_shape() {
        let frame = Frame::new(
            ClientFrame::RemoveIncident {
                id: IncidentId::from("i1".to_owned()),
            },
            FrameSender::Client {
                id: PeerId::new("AAA"),
                name: "Ref 1".to_owned(),
            },
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        );

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], json!("remove_incident"));
        assert_eq!(value["id"], json!("i1"));
        assert_eq!(value["sender"]["type"], json!("client"));
        assert_eq!(value["sender"]["name"], json!("Ref 1"));
        assert!(value["date"].is_string());
    }

    #[test]
    fn server_frame_distinguishes_control_from_echo() {
        let raw = json!({
            "type": "server_user_add",
            "user": {"id": "AAA", "name": "Ref 1"},
            "activeUsers": [{"id": "AAA", "name": "Ref 1"}],
            "invitations": [],
            "sender": {"type": "server"},
            "date": "2024-11-14T22:13:20Z",
        });

        let frame: Frame<ServerFrame> = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            frame.payload,
            ServerFrame::Control(ControlFrame::ServerUserAdd { .. })
        ));

        let raw = json!({
            "type": "message",
            "message": "field 2 ready",
            "sender": {"type": "client", "id": "AAA", "name": "Ref 1"},
            "date": "2024-11-14T22:13:20Z",
        });

        let frame: Frame<ServerFrame> = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            frame.payload,
            ServerFrame::Echo(ClientFrame::Message { .. })
        ));
    }
}
