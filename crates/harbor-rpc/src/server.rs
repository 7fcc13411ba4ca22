//! Server-side dispatch.
//!
//! [`serve`] installs a handler table on a port. Requests are matched by
//! call name; handler results and failures travel back as reply frames
//! on the port the request arrived on. A built-in `help` call lists the
//! registered names; it is the introspection primitive the client
//! surface is synthesized from.
//!
//! Unless `sync` is requested, an offered sub-channel port gets the same
//! table installed recursively, which is what makes the sub-channel call
//! discipline work. All dispatch tasks of one server share a registry,
//! so the returned [`ServerGuard`] can tear every listener down at once.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use futures::executor::LocalSpawner;
use futures::future::{abortable, AbortHandle};
use futures::task::LocalSpawnExt;
use futures::future::LocalBoxFuture;
use harbor_channel::{MessagePort, MessageTarget, Subscription};
use log::{debug, warn};
use serde_json::{json, Value};

use crate::ambient;
use crate::frames::{classify, error_frame, result_frame, CallFrame, Frame};
use crate::RpcError;

/// Future returned by a handler.
pub type HandlerFuture = LocalBoxFuture<'static, Result<Value, RpcError>>;

/// One registered call: arguments in, boxed future of a reply out.
pub type Handler = Rc<dyn Fn(Vec<Value>) -> HandlerFuture>;

/// Name of the built-in introspection call.
pub const HELP_CALL: &str = "help";

/// An ordered table of named handlers.
///
/// Cloning the table shares the handlers, which is how one server
/// installs the same entries on every sub-channel.
#[derive(Clone, Default)]
pub struct ApiTable {
    entries: BTreeMap<String, Handler>,
}

impl ApiTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous entry.
    pub fn insert(&mut self, name: impl Into<String>, handler: Handler) {
        self.entries.insert(name.into(), handler);
    }

    /// Register an async closure.
    pub fn insert_async<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Fut + 'static,
        Fut: std::future::Future<Output = Result<Value, RpcError>> + 'static,
    {
        use futures::FutureExt;
        self.insert(name, Rc::new(move |args| f(args).boxed_local()));
    }

    /// Register a synchronous closure.
    pub fn insert_sync<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, RpcError> + 'static,
    {
        use futures::FutureExt;
        self.insert(name, Rc::new(move |args| {
            std::future::ready(f(args)).boxed_local()
        }));
    }

    /// Handler registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Handler> {
        self.entries.get(name).cloned()
    }

    /// Registered call names, ascending.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge `other` in without letting it shadow existing entries.
    ///
    /// Shadowing entries are dropped with a warning; this is how the
    /// host keeps its core call names authoritative.
    pub fn merge_non_shadowing(&mut self, other: ApiTable) {
        for (name, handler) in other.entries {
            if self.entries.contains_key(&name) {
                warn!("api extension tried to shadow {name:?}; entry dropped");
                continue;
            }
            self.entries.insert(name, handler);
        }
    }
}

impl std::fmt::Debug for ApiTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiTable").field("names", &self.names()).finish()
    }
}

// ============================================================================
// Task registry and guard
// ============================================================================

#[derive(Default)]
struct TaskRegistry {
    next_id: u64,
    handles: BTreeMap<u64, AbortHandle>,
}

impl TaskRegistry {
    fn register(&mut self, handle: AbortHandle) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.handles.insert(id, handle);
        id
    }

    fn remove(&mut self, id: u64) {
        self.handles.remove(&id);
    }

    fn cancel_all(&mut self) {
        for (_, handle) in std::mem::take(&mut self.handles) {
            handle.abort();
        }
    }
}

/// Handle over a running server.
///
/// [`ServerGuard::cancel`] removes every installed listener: the root
/// dispatch task and all sub-channel tasks it spawned.
#[derive(Clone)]
pub struct ServerGuard {
    tasks: Rc<RefCell<TaskRegistry>>,
}

impl ServerGuard {
    /// Tear the server down.
    pub fn cancel(&self) {
        self.tasks.borrow_mut().cancel_all();
    }

    /// Number of live dispatch tasks (root plus open sub-channels).
    pub fn live_tasks(&self) -> usize {
        self.tasks.borrow().handles.len()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Install `table` as a server on `target`.
///
/// With `sync = false` (the default discipline) every offered
/// sub-channel port gets the same table installed recursively. The
/// returned guard cancels all of it.
pub fn serve(
    spawner: &LocalSpawner,
    target: &MessageTarget,
    table: ApiTable,
    sync: bool,
) -> Result<ServerGuard, RpcError> {
    let tasks = Rc::new(RefCell::new(TaskRegistry::default()));
    spawn_dispatch(spawner, target.clone(), table, sync, tasks.clone())?;
    Ok(ServerGuard { tasks })
}

fn spawn_dispatch(
    spawner: &LocalSpawner,
    target: MessageTarget,
    table: ApiTable,
    sync: bool,
    tasks: Rc<RefCell<TaskRegistry>>,
) -> Result<(), RpcError> {
    // Subscribe before starting so nothing is flushed into the void.
    let sub = target.subscribe();
    target.start();

    let loop_spawner = spawner.clone();
    let loop_tasks = tasks.clone();
    let (work, handle) = abortable(dispatch_loop(
        sub,
        target,
        table,
        sync,
        loop_spawner,
        loop_tasks,
    ));
    let id = tasks.borrow_mut().register(handle);
    let done_tasks = tasks;
    spawner
        .spawn_local(async move {
            let _ = work.await;
            done_tasks.borrow_mut().remove(id);
        })
        .map_err(|_| RpcError::Spawn)
}

async fn dispatch_loop(
    mut sub: Subscription,
    target: MessageTarget,
    table: ApiTable,
    sync: bool,
    spawner: LocalSpawner,
    tasks: Rc<RefCell<TaskRegistry>>,
) {
    while let Some(msg) = sub.next().await {
        match classify(msg) {
            Frame::Close => break,
            Frame::Offer(port) => {
                if sync {
                    debug!("sub-channel offer ignored by in-band-only server");
                    continue;
                }
                let sub_target = MessageTarget::from(port);
                if let Err(err) =
                    spawn_dispatch(&spawner, sub_target, table.clone(), sync, tasks.clone())
                {
                    warn!("failed to serve sub-channel: {err}");
                }
            }
            Frame::Call { frame, ports } => {
                let reply = dispatch_call(&table, frame, ports).await;
                match reply {
                    Ok(value) => target.post(result_frame(value), Vec::new()),
                    Err(err) => target.post(error_frame(err.to_wire()), Vec::new()),
                }
            }
            // Replies and foreign shapes are not ours to consume; other
            // listeners on the same port may recognize them.
            Frame::Result(_) | Frame::Error(_) | Frame::Other(_) => {}
        }
    }
}

async fn dispatch_call(
    table: &ApiTable,
    frame: CallFrame,
    ports: Vec<MessagePort>,
) -> Result<Value, RpcError> {
    if frame.call == HELP_CALL && table.get(HELP_CALL).is_none() {
        return Ok(json!(table.names()));
    }
    match table.get(&frame.call) {
        Some(handler) => {
            // The ambient transfer list lives exactly as long as the
            // synchronous part of the handler invocation.
            let fut = ambient::with_transfer(ports, || handler(frame.args));
            fut.await
        }
        None => Err(RpcError::UnknownCall(frame.call)),
    }
}
