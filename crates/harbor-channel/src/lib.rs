//! Message-port fabric for the harbor host.
//!
//! This crate provides the point-to-point substrate everything else rides
//! on: entangled port pairs, the target union over ports / workers /
//! windows, and the closure-signaling convention.
//!
//! # Model
//!
//! - [`MessageChannel::new`] yields two entangled [`MessagePort`]s.
//! - A [`Message`] couples a JSON payload with the ports transferred
//!   alongside it.
//! - Ports buffer inbound messages until [`MessagePort::start`]; once
//!   started, every live subscription sees every delivered message, in
//!   FIFO order per port.
//! - Ports have no native closed event. By convention either side posts
//!   the control frame `{"channel": "close"}` to announce it will stop
//!   listening; [`is_close_frame`] recognizes it.
//!
//! The fabric is single-threaded by design: delivery never crosses a
//! thread and never re-enters user code, so `Rc<RefCell<..>>` state is
//! race-free by construction.

mod port;
mod target;

pub use port::{Message, MessageChannel, MessagePort, Subscription};
pub use target::{MessageTarget, TargetKind, Terminator, WindowHandle, WorkerHandle};

use serde_json::{json, Value};

/// Errors surfaced by the channel layer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The peer announced closure (or vanished) before the expected
    /// message arrived.
    #[error("channel closed prematurely")]
    ClosedPrematurely,
}

/// The `{"channel": "close"}` control frame.
pub fn close_frame() -> Value {
    json!({ "channel": "close" })
}

/// True when `data` is the closure control frame.
pub fn is_close_frame(data: &Value) -> bool {
    data.get("channel").and_then(Value::as_str) == Some("close")
}

/// Resolve to the next inbound message on `target`.
///
/// Starts the target if it has not been started yet. Fails with
/// [`ChannelError::ClosedPrematurely`] when the next frame is the closure
/// frame, or when the port dies without delivering anything.
pub async fn next_message(target: &MessageTarget) -> Result<Message, ChannelError> {
    let mut sub = target.subscribe_once();
    target.start();
    match sub.next().await {
        Some(msg) if is_close_frame(&msg.data) => Err(ChannelError::ClosedPrematurely),
        Some(msg) => Ok(msg),
        None => Err(ChannelError::ClosedPrematurely),
    }
}

/// Construct a sub-channel across `target`.
///
/// One end of a fresh channel is transferred to the peer as a bare port
/// offer; the other end is returned for local use. The sub-channel is the
/// canonical carrier for one concurrent request.
pub fn open_subchannel(target: &MessageTarget) -> MessagePort {
    let (offered, kept) = MessageChannel::new();
    target.post(Value::Null, vec![offered]);
    kept
}
