//! Typed errors at the Router/Registry seam.
//!
//! Handlers never let these escape as a `tonic::Status` failure. They are
//! folded into the wire-level `Response{ok, err}` / `ConfirmResponse`
//! shape instead, so a caller never has to catch an exception to learn a
//! request was rejected. A `tonic::Status` is reserved for genuine
//! transport failures (duplicate `Subscribe*` on a streaming call).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FabricError {
    #[error("ChannelType Error")]
    ChannelTypeError,

    #[error("duplicated Subscribe for ClientID {0}")]
    DuplicateSubscriber(u64),

    #[error("No extra nodeID")]
    NoExtraNodeId,

    #[error("Secret Failed")]
    SecretMismatch,

    #[error("Can't find demand target from Select")]
    NoProducer,

    #[error("waitConfirm Timeout!")]
    Timeout,

    #[error("MessageDrop {0}")]
    MessageDrop(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("Can't find targetID {target_id} in channel {channel_type}")]
    TargetNotFound { target_id: u64, channel_type: u32 },

    #[error("unregistered NodeID")]
    UnknownNode,
}

impl FabricError {
    /// Plain message for embedding in `Response.err`, no "Error: " prefix.
    pub fn wire_message(&self) -> String {
        self.to_string()
    }
}
