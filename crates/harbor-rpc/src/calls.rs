//! The two call disciplines.
//!
//! An in-band call posts the request straight on the connection and
//! awaits the next frame; it is cheap but forbids interleaving. A
//! sub-channel call carries the request over a fresh channel offered
//! across the connection, so any number of calls can be in flight at
//! once. Sub-channel is the default discipline everywhere.

use harbor_channel::{close_frame, open_subchannel, MessagePort, MessageTarget};
use serde_json::Value;

use crate::frames::{classify, request, Frame};
use crate::RpcError;

/// In-band call: post the request on `target`, await the next frame.
///
/// The caller must not issue another in-band call on the same connection
/// before the reply arrives.
pub async fn ipc(target: &MessageTarget, call: &str, args: Vec<Value>) -> Result<Value, RpcError> {
    ipc_with_transfer(target, call, args, Vec::new()).await
}

/// In-band call with a transfer list riding on the request.
pub async fn ipc_with_transfer(
    target: &MessageTarget,
    call: &str,
    args: Vec<Value>,
    transfer: Vec<MessagePort>,
) -> Result<Value, RpcError> {
    let mut reply = target.subscribe_once();
    target.start();
    target.post(request(call, args), transfer);

    let Some(msg) = reply.next().await else {
        return Err(RpcError::ChannelClosed);
    };
    match classify(msg) {
        Frame::Result(value) => Ok(value),
        Frame::Error(error) => Err(RpcError::Remote(error)),
        Frame::Close => Err(RpcError::ChannelClosed),
        other => Err(RpcError::Protocol(format!(
            "expected a reply frame, got {other:?}"
        ))),
    }
}

/// Sub-channel call: the default, concurrent-safe discipline.
///
/// Offers one end of a fresh channel across `target`, converses on the
/// other end, and closes the sub-channel once the reply is in.
pub async fn subchannel_call(
    target: &MessageTarget,
    call: &str,
    args: Vec<Value>,
) -> Result<Value, RpcError> {
    subchannel_call_with_transfer(target, call, args, Vec::new()).await
}

/// Sub-channel call with a transfer list riding on the request.
pub async fn subchannel_call_with_transfer(
    target: &MessageTarget,
    call: &str,
    args: Vec<Value>,
    transfer: Vec<MessagePort>,
) -> Result<Value, RpcError> {
    let kept = open_subchannel(target);
    let sub = MessageTarget::from(kept);
    let outcome = ipc_with_transfer(&sub, call, args, transfer).await;
    // Announce we are done with the sub-channel, then sever it.
    sub.post(close_frame(), Vec::new());
    sub.close();
    outcome
}
