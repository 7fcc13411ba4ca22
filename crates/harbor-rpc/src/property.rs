//! Server-side tracked values.
//!
//! A property named `N` is a naming convention over the call transport:
//! `getN` snapshots it, `trackN` subscribes a client-supplied port for
//! push updates, and an optional `setN` makes it writable. Over a
//! tracker port both peers speak a tiny sub-protocol:
//!
//! | Frame | Meaning |
//! |-------|---------|
//! | `{"value": v}` | new value (server→client update, client→server write) |
//! | `{"error": msg, "value": current}` | write rejected |
//! | `{"channel": "close"}` | end the subscription |

use std::cell::RefCell;
use std::rc::Rc;

use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;
use harbor_channel::{is_close_frame, MessagePort, Subscription};
use log::debug;
use serde_json::{json, Value};

use crate::ambient::current_transfer;
use crate::server::ApiTable;
use crate::RpcError;

/// Message sent back when a write is refused.
const NOT_SET: &str = "not set";

/// Write policy of a property.
#[derive(Clone)]
pub enum PropertyMode {
    /// Client writes are refused with `not set`.
    ReadOnly,
    /// Client writes are committed as-is.
    Writable,
    /// Client writes run the validator; rejection carries its message.
    Validated(Rc<dyn Fn(&Value) -> Result<(), String>>),
}

struct PropState {
    value: Value,
    trackers: Vec<MessagePort>,
}

struct PropertyShared {
    name: String,
    mode: PropertyMode,
    state: RefCell<PropState>,
}

impl PropertyShared {
    /// The single validation-and-commit path every write goes through.
    ///
    /// `ignore_read_only` is how the owning side pushes authoritative
    /// values through a read-only property.
    fn try_commit(&self, value: Value, ignore_read_only: bool) -> Result<(), String> {
        match &self.mode {
            PropertyMode::ReadOnly if !ignore_read_only => Err(NOT_SET.to_string()),
            PropertyMode::Validated(validate) => {
                validate(&value)?;
                self.commit(value);
                Ok(())
            }
            _ => {
                self.commit(value);
                Ok(())
            }
        }
    }

    /// Store the value and fan it out to every tracker, the write's
    /// originator included.
    fn commit(&self, value: Value) {
        let mut st = self.state.borrow_mut();
        st.value = value.clone();
        st.trackers.retain(|t| !t.is_closed());
        for tracker in &st.trackers {
            tracker.post(json!({ "value": value }), Vec::new());
        }
    }

    fn current(&self) -> Value {
        self.state.borrow().value.clone()
    }

    fn drop_tracker(&self, port: &MessagePort) {
        self.state
            .borrow_mut()
            .trackers
            .retain(|t| !t.same_port(port));
    }
}

/// A tracked value owned by a server.
///
/// Clones share the value and tracker set; register one clone into the
/// server's [`ApiTable`] and keep another for local access.
#[derive(Clone)]
pub struct Property {
    shared: Rc<PropertyShared>,
}

impl Property {
    fn with_mode(name: impl Into<String>, initial: Value, mode: PropertyMode) -> Self {
        Self {
            shared: Rc::new(PropertyShared {
                name: name.into(),
                mode,
                state: RefCell::new(PropState {
                    value: initial,
                    trackers: Vec::new(),
                }),
            }),
        }
    }

    /// Property clients can read and track but not write.
    pub fn read_only(name: impl Into<String>, initial: Value) -> Self {
        Self::with_mode(name, initial, PropertyMode::ReadOnly)
    }

    /// Property clients can also write.
    pub fn writable(name: impl Into<String>, initial: Value) -> Self {
        Self::with_mode(name, initial, PropertyMode::Writable)
    }

    /// Writable property whose writes must pass `validate`.
    pub fn with_validator(
        name: impl Into<String>,
        initial: Value,
        validate: impl Fn(&Value) -> Result<(), String> + 'static,
    ) -> Self {
        Self::with_mode(name, initial, PropertyMode::Validated(Rc::new(validate)))
    }

    /// The property's name suffix (the `N` of `getN`/`trackN`/`setN`).
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current value.
    pub fn get(&self) -> Value {
        self.shared.current()
    }

    /// Local write through the regular validation path.
    ///
    /// With `ignore_read_only` the owning side can push authoritative
    /// values through a read-only property; validation still applies.
    pub fn set(&self, value: Value, ignore_read_only: bool) -> Result<(), RpcError> {
        self.shared
            .try_commit(value, ignore_read_only)
            .map_err(RpcError::Failed)
    }

    /// Number of live tracker subscriptions.
    pub fn tracker_count(&self) -> usize {
        self.shared.state.borrow().trackers.len()
    }

    /// Register `get<N>`, `track<N>`, and (when writable) `set<N>`.
    pub fn register(&self, table: &mut ApiTable, spawner: &LocalSpawner) {
        let name = self.shared.name.clone();

        let shared = self.shared.clone();
        table.insert_sync(format!("get{name}"), move |_args| Ok(shared.current()));

        let shared = self.shared.clone();
        let track_spawner = spawner.clone();
        table.insert(
            format!("track{name}"),
            Rc::new(move |_args| {
                use futures::FutureExt;
                // The tracker port rides on the request's transfer list;
                // it must be picked up before the first suspension.
                let mut ports = current_transfer();
                let shared = shared.clone();
                let spawner = track_spawner.clone();
                async move {
                    let Some(port) = ports.drain(..).next() else {
                        return Err(RpcError::Protocol(
                            "track call without a transferred port".to_string(),
                        ));
                    };
                    attach_tracker(shared, port, &spawner)?;
                    Ok(Value::Null)
                }
                .boxed_local()
            }),
        );

        if matches!(
            self.shared.mode,
            PropertyMode::Writable | PropertyMode::Validated(_)
        ) {
            let shared = self.shared.clone();
            table.insert_sync(format!("set{name}"), move |args| {
                let value = args.into_iter().next().unwrap_or(Value::Null);
                shared
                    .try_commit(value, false)
                    .map_err(RpcError::Failed)?;
                Ok(Value::Null)
            });
        }
    }
}

/// Subscribe a freshly arrived tracker port: send the current value
/// immediately, then service its writes until it closes.
fn attach_tracker(
    shared: Rc<PropertyShared>,
    port: MessagePort,
    spawner: &LocalSpawner,
) -> Result<(), RpcError> {
    let sub = port.subscribe();
    port.start();
    shared.state.borrow_mut().trackers.push(port.clone());
    port.post(json!({ "value": shared.current() }), Vec::new());
    spawner
        .spawn_local(tracker_loop(shared, port, sub))
        .map_err(|_| RpcError::Spawn)
}

async fn tracker_loop(shared: Rc<PropertyShared>, port: MessagePort, mut sub: Subscription) {
    while let Some(msg) = sub.next().await {
        if is_close_frame(&msg.data) {
            shared.drop_tracker(&port);
            port.close();
            break;
        }
        let Some(value) = msg.data.get("value") else {
            debug!(
                "unrecognized frame on tracker for {:?} ignored",
                shared.name
            );
            continue;
        };
        if let Err(reject) = shared.try_commit(value.clone(), false) {
            // Rejections go back to the offending tracker only, with the
            // authoritative value so the peer can resynchronize.
            port.post(
                json!({ "error": reject, "value": shared.current() }),
                Vec::new(),
            );
        }
    }
}
