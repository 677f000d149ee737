//! Wire types shared between the server and its clients: the JSON response
//! envelope, the socket frame protocol, and the snapshot payload.

pub mod api;
pub mod frames;

pub use api::{ApiEnvelope, ErrorReason};
pub use frames::{ClientFrame, ControlFrame, Frame, FrameSender, ServerFrame, ShareInfo};
