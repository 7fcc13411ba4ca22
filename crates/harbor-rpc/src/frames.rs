//! Recognized wire shapes.
//!
//! Over any single port, five shapes are meaningful:
//!
//! | Shape | Meaning |
//! |-------|---------|
//! | `{"call": name, "args": [...]}` | request (transferred ports ride along) |
//! | `{"result": v}` | successful reply |
//! | `{"error": e}` | failed reply |
//! | `{"channel": "close"}` | end-of-stream control |
//! | bare transferred port, null payload | sub-channel offer |
//!
//! Anything else is not part of this protocol and is left for other
//! listeners on the same port.

use harbor_channel::{is_close_frame, Message, MessagePort};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A request frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    /// Name of the call to dispatch.
    pub call: String,
    /// Positional arguments; absent on the wire means empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
}

/// Build a request frame payload.
pub fn request(call: &str, args: Vec<Value>) -> Value {
    // CallFrame serialization cannot fail: strings and Values only.
    serde_json::to_value(CallFrame {
        call: call.to_string(),
        args,
    })
    .unwrap_or(Value::Null)
}

/// Build a successful reply payload.
pub fn result_frame(result: Value) -> Value {
    json!({ "result": result })
}

/// Build a failed reply payload.
pub fn error_frame(error: Value) -> Value {
    json!({ "error": error })
}

/// An inbound message, interpreted.
#[derive(Debug)]
pub enum Frame {
    /// A request, with the ports transferred alongside it.
    Call {
        /// The parsed request.
        frame: CallFrame,
        /// Transferred ports accompanying the request.
        ports: Vec<MessagePort>,
    },
    /// Successful reply.
    Result(Value),
    /// Failed reply.
    Error(Value),
    /// End-of-stream control frame.
    Close,
    /// Sub-channel offer: a bare transferred port.
    Offer(MessagePort),
    /// Not a protocol shape; may belong to another listener.
    Other(Message),
}

/// Interpret one inbound message.
pub fn classify(msg: Message) -> Frame {
    if is_close_frame(&msg.data) {
        return Frame::Close;
    }
    if msg.data.is_null() {
        if let Some(port) = msg.ports.first() {
            return Frame::Offer(port.clone());
        }
    }
    if let Value::Object(map) = &msg.data {
        if map.get("call").map(Value::is_string) == Some(true) {
            match serde_json::from_value::<CallFrame>(msg.data.clone()) {
                Ok(frame) => {
                    return Frame::Call {
                        frame,
                        ports: msg.ports,
                    }
                }
                Err(_) => return Frame::Other(msg),
            }
        }
        if let Some(result) = map.get("result") {
            return Frame::Result(result.clone());
        }
        if let Some(error) = map.get("error") {
            return Frame::Error(error.clone());
        }
    }
    Frame::Other(msg)
}
