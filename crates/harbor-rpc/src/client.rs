//! Client surface synthesis.
//!
//! [`get_client`] asks a server for its `help` list, turns every
//! advertised call into an async wrapper, and runs the property
//! discovery pass: every `track<X>` with a matching `get<X>` becomes a
//! reactive field backed by a tracker channel. The client resolves only
//! once every property has received its first value, so readers never
//! observe an uninitialized field.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;
use harbor_channel::{is_close_frame, MessageChannel, MessagePort, MessageTarget, Subscription};
use serde_json::Value;

use crate::calls::{ipc_with_transfer, subchannel_call_with_transfer};
use crate::server::HELP_CALL;
use crate::RpcError;

struct PropertyCell {
    cache: Rc<RefCell<Value>>,
    last_error: Rc<RefCell<Option<String>>>,
    writable: bool,
    tracker: MessagePort,
}

/// A synthesized view of a remote server.
pub struct Client {
    target: MessageTarget,
    sync: bool,
    calls: Vec<String>,
    props: BTreeMap<String, PropertyCell>,
}

/// Build a client over `target` using the sub-channel call discipline.
pub async fn get_client(spawner: &LocalSpawner, target: MessageTarget) -> Result<Client, RpcError> {
    build(spawner, target, false).await
}

/// Build a client whose calls are in-band (no interleaving allowed).
pub async fn get_client_sync(
    spawner: &LocalSpawner,
    target: MessageTarget,
) -> Result<Client, RpcError> {
    build(spawner, target, true).await
}

async fn build(
    spawner: &LocalSpawner,
    target: MessageTarget,
    sync: bool,
) -> Result<Client, RpcError> {
    let help = call_raw(&target, HELP_CALL, Vec::new(), Vec::new(), sync).await?;
    let calls: Vec<String> = serde_json::from_value(help)
        .map_err(|err| RpcError::Protocol(format!("help reply was not a name list: {err}")))?;

    let mut props = BTreeMap::new();
    for name in &calls {
        let Some(suffix) = name.strip_prefix("track") else {
            continue;
        };
        if suffix.is_empty() || !calls.iter().any(|c| c == &format!("get{suffix}")) {
            continue;
        }
        let writable = calls.iter().any(|c| c == &format!("set{suffix}"));
        let cell = init_property(spawner, &target, name, writable, sync).await?;
        props.insert(suffix.to_string(), cell);
    }

    Ok(Client {
        target,
        sync,
        calls,
        props,
    })
}

async fn call_raw(
    target: &MessageTarget,
    call: &str,
    args: Vec<Value>,
    transfer: Vec<MessagePort>,
    sync: bool,
) -> Result<Value, RpcError> {
    if sync {
        ipc_with_transfer(target, call, args, transfer).await
    } else {
        subchannel_call_with_transfer(target, call, args, transfer).await
    }
}

/// Hand the server one end of a fresh channel, await the seed value, and
/// keep the cache fresh from a background task.
async fn init_property(
    spawner: &LocalSpawner,
    target: &MessageTarget,
    track_call: &str,
    writable: bool,
    sync: bool,
) -> Result<PropertyCell, RpcError> {
    let (remote, local) = MessageChannel::new();
    call_raw(target, track_call, Vec::new(), vec![remote], sync).await?;

    let mut sub = local.subscribe();
    local.start();
    let first = sub.next().await.ok_or(RpcError::ChannelClosed)?;
    let seed = first
        .data
        .get("value")
        .cloned()
        .ok_or_else(|| RpcError::Protocol("tracker did not open with a value".to_string()))?;

    let cache = Rc::new(RefCell::new(seed));
    let last_error = Rc::new(RefCell::new(None));
    spawner
        .spawn_local(track_updates(sub, cache.clone(), last_error.clone()))
        .map_err(|_| RpcError::Spawn)?;

    Ok(PropertyCell {
        cache,
        last_error,
        writable,
        tracker: local,
    })
}

async fn track_updates(
    mut sub: Subscription,
    cache: Rc<RefCell<Value>>,
    last_error: Rc<RefCell<Option<String>>>,
) {
    while let Some(msg) = sub.next().await {
        if is_close_frame(&msg.data) {
            break;
        }
        if let Some(error) = msg.data.get("error") {
            let text = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            *last_error.borrow_mut() = Some(text);
            // A rejection carries the authoritative value; undo the
            // optimistic local write.
            if let Some(value) = msg.data.get("value") {
                *cache.borrow_mut() = value.clone();
            }
        } else if let Some(value) = msg.data.get("value") {
            *cache.borrow_mut() = value.clone();
            *last_error.borrow_mut() = None;
        }
    }
}

impl Client {
    /// Invoke an advertised call.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.call_with_transfer(name, args, Vec::new()).await
    }

    /// Invoke an advertised call with a transfer list on the request.
    pub async fn call_with_transfer(
        &self,
        name: &str,
        args: Vec<Value>,
        transfer: Vec<MessagePort>,
    ) -> Result<Value, RpcError> {
        if !self.calls.iter().any(|c| c == name) {
            return Err(RpcError::UnknownCall(name.to_string()));
        }
        call_raw(&self.target, name, args, transfer, self.sync).await
    }

    /// Cached value of a discovered property.
    pub fn get(&self, property: &str) -> Result<Value, RpcError> {
        self.props
            .get(property)
            .map(|cell| cell.cache.borrow().clone())
            .ok_or_else(|| RpcError::UnknownProperty(property.to_string()))
    }

    /// Write a writable property: optimistic cache update, then the new
    /// value is posted upstream on the tracker.
    pub fn set(&self, property: &str, value: Value) -> Result<(), RpcError> {
        let cell = self
            .props
            .get(property)
            .ok_or_else(|| RpcError::UnknownProperty(property.to_string()))?;
        if !cell.writable {
            return Err(RpcError::PropertyNotSet);
        }
        *cell.cache.borrow_mut() = value.clone();
        cell.tracker
            .post(serde_json::json!({ "value": value }), Vec::new());
        Ok(())
    }

    /// The most recent rejection on a property, if any.
    pub fn property_error(&self, property: &str) -> Option<String> {
        self.props
            .get(property)
            .and_then(|cell| cell.last_error.borrow().clone())
    }

    /// Every call the server advertised.
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    /// Every property discovered from the call list.
    pub fn properties(&self) -> Vec<String> {
        self.props.keys().cloned().collect()
    }

    /// Whether a discovered property accepts writes.
    pub fn is_writable(&self, property: &str) -> bool {
        self.props
            .get(property)
            .map(|cell| cell.writable)
            .unwrap_or(false)
    }

    /// The connection this client speaks over.
    pub fn target(&self) -> &MessageTarget {
        &self.target
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("calls", &self.calls)
            .field("properties", &self.properties())
            .finish()
    }
}
