//! Symmetric RPC over message ports.
//!
//! This crate layers a request/reply protocol on the port fabric of
//! `harbor-channel`:
//!
//! - [`frames`]: the recognized wire shapes.
//! - [`calls`]: the two call disciplines, in-band (cheap, no
//!   interleaving) and sub-channel (the default, concurrent-safe).
//! - [`server`]: dispatch. One handler table per served port, `help`
//!   introspection, recursive installation on offered sub-channels.
//! - [`ambient`]: the per-dispatch transfer list, readable from the
//!   synchronous part of a handler body.
//! - [`property`]: tracked values. Snapshot getter, tracker
//!   subscription, optional writes with validation.
//! - [`client`]: surface synthesis. `help` is fetched, every advertised
//!   call becomes an async wrapper and every `track*`/`get*` pair
//!   becomes a reactive field.
//!
//! Everything here is single-threaded cooperative; concurrency is
//! expressed as local tasks on a `futures` local executor.

pub mod ambient;
pub mod calls;
pub mod client;
pub mod frames;
pub mod property;
pub mod server;

pub use ambient::current_transfer;
pub use calls::{ipc, ipc_with_transfer, subchannel_call, subchannel_call_with_transfer};
pub use client::{get_client, get_client_sync, Client};
pub use frames::{classify, error_frame, request, result_frame, CallFrame, Frame};
pub use property::{Property, PropertyMode};
pub use server::{serve, ApiTable, Handler, ServerGuard};

use harbor_channel::ChannelError;
use serde_json::{json, Value};

/// Errors surfaced by the RPC layer.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// The peer announced closure before the expected reply arrived.
    #[error("channel closed prematurely")]
    ChannelClosed,

    /// The peer sent a frame that fits no recognized shape where a
    /// specific shape was required.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer answered with an `{"error": ...}` frame.
    #[error("remote call failed: {0}")]
    Remote(Value),

    /// No handler is registered under the requested call name.
    #[error("unknown call: {0}")]
    UnknownCall(String),

    /// No such property was discovered on the peer.
    #[error("unknown property: {0}")]
    UnknownProperty(String),

    /// The property is read-only or the validator rejected the write.
    #[error("property not set")]
    PropertyNotSet,

    /// A handler failed; the message travels back in the error frame.
    #[error("{0}")]
    Failed(String),

    /// The local executor refused the dispatch task.
    #[error("failed to spawn dispatch task")]
    Spawn,
}

impl RpcError {
    /// The value carried in an `{"error": ...}` reply frame.
    pub fn to_wire(&self) -> Value {
        match self {
            RpcError::Remote(v) => v.clone(),
            other => json!(other.to_string()),
        }
    }
}

impl From<ChannelError> for RpcError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::ClosedPrematurely => RpcError::ChannelClosed,
        }
    }
}
