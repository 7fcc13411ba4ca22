//! Process host assembly.
//!
//! The host glues the process table onto the RPC server: for every
//! process it builds an API table whose handlers carry the caller's PID,
//! installs it on the process's port, and wires the teardown closure
//! back into the table row. Lifecycle and query calls are gated by
//! subtree authority: a caller may act on itself and its descendants,
//! nothing else.
//!
//! Two collaborators are injected at construction:
//!
//! - `get_port(url)`: how to spawn a child from a URL (a worker in the
//!   browser; a scripted local task in tests).
//! - `host_api(pid)`: extra calls merged into every process's server,
//!   which is where window-only concerns (frame display, favicon, title,
//!   history) plug in without touching the core. Extensions cannot
//!   shadow the core call names.

mod api;

// Re-export the identifiers and tables callers deal in.
pub use harbor_kernel::{Pid, ProcessInfo};
pub use harbor_rpc::ApiTable;

use std::cell::RefCell;
use std::rc::Rc;

use futures::executor::LocalSpawner;
use harbor_channel::{close_frame, MessagePort, MessageTarget};
use harbor_kernel::{Endpoint, NameWait, ProcessTable, TableError};
use harbor_rpc::{serve, RpcError};
use log::{debug, warn};
use serde_json::{json, Value};

/// Errors from host operations.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum HostError {
    /// The referenced PID does not exist.
    #[error("process not found: {0}")]
    NotFound(Pid),

    /// The caller tried to act outside its own subtree.
    #[error("{target} is not a descendant of {caller}")]
    NotDescendant {
        /// PID the caller tried to act on
        target: Pid,
        /// PID whose authority was used
        caller: Pid,
    },

    /// The requested reparenting would create a cycle.
    #[error("reparenting {child} under {parent} would create a cycle")]
    TopologyViolation {
        /// Process being moved
        child: Pid,
        /// Requested new parent
        parent: Pid,
    },

    /// No URL spawner was configured on this host.
    #[error("cannot spawn from url {0:?}: no spawner configured")]
    SpawnUnsupported(String),

    /// A malformed argument reached a host operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The underlying transport failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl From<TableError> for HostError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::NotFound(pid) => HostError::NotFound(pid),
            TableError::TopologyViolation { child, parent } => {
                HostError::TopologyViolation { child, parent }
            }
        }
    }
}

/// What to start a child from.
pub enum StartChild {
    /// Spawn a fresh execution context through the `get_port`
    /// collaborator.
    Url(String),
    /// Adopt an endpoint that already exists.
    Target(MessageTarget),
}

impl From<MessageTarget> for StartChild {
    fn from(target: MessageTarget) -> Self {
        StartChild::Target(target)
    }
}

impl From<MessagePort> for StartChild {
    fn from(port: MessagePort) -> Self {
        StartChild::Target(MessageTarget::from(port))
    }
}

/// Spawner collaborator: URL in, endpoint out.
pub type GetPort = Box<dyn Fn(&str) -> Result<MessageTarget, HostError>>;

/// Extension collaborator: extra calls for every process's server.
pub type HostApi = Box<dyn Fn(Pid) -> ApiTable>;

/// Injected collaborators of a host.
pub struct HostConfig {
    get_port: GetPort,
    host_api: HostApi,
}

impl HostConfig {
    /// Config with a URL spawner and no API extension.
    pub fn new(get_port: impl Fn(&str) -> Result<MessageTarget, HostError> + 'static) -> Self {
        Self {
            get_port: Box::new(get_port),
            host_api: Box::new(|_pid| ApiTable::new()),
        }
    }

    /// Config for hosts that only ever adopt existing endpoints.
    pub fn adopt_only() -> Self {
        Self::new(|url| Err(HostError::SpawnUnsupported(url.to_string())))
    }

    /// Attach the per-process API extension.
    pub fn with_host_api(mut self, host_api: impl Fn(Pid) -> ApiTable + 'static) -> Self {
        self.host_api = Box::new(host_api);
        self
    }
}

/// Endpoint wrapper stored in the table rows.
struct ProcessEndpoint(MessageTarget);

impl Endpoint for ProcessEndpoint {
    fn close(&self) {
        self.0.close();
    }
    fn terminate(&self) {
        self.0.terminate();
    }
}

struct HostInner {
    table: RefCell<ProcessTable<ProcessEndpoint>>,
    config: HostConfig,
    spawner: LocalSpawner,
}

/// The process host.
///
/// Clones share one table; the host is single-threaded and all state
/// lives behind a `RefCell`.
#[derive(Clone)]
pub struct Host {
    inner: Rc<HostInner>,
}

impl Host {
    /// Create a host over the given collaborators and executor handle.
    pub fn new(config: HostConfig, spawner: LocalSpawner) -> Self {
        Self {
            inner: Rc::new(HostInner {
                table: RefCell::new(ProcessTable::new()),
                config,
                spawner,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register a process, install its API server, and return its PID.
    ///
    /// With a URL child the `get_port` collaborator supplies the
    /// endpoint. When `parent` is given the new process is inserted into
    /// its children; a missing parent fails with not-found.
    pub fn start(&self, child: StartChild, parent: Option<Pid>) -> Result<Pid, HostError> {
        let target = match child {
            StartChild::Url(url) => (self.inner.config.get_port)(&url)?,
            StartChild::Target(target) => target,
        };

        let pid = self
            .inner
            .table
            .borrow_mut()
            .insert(ProcessEndpoint(target.clone()), parent)?;

        let api = api::assemble(self, pid);
        let guard = match serve(&self.inner.spawner, &target, api, false) {
            Ok(guard) => guard,
            Err(err) => {
                // Roll the registration back; the process never became
                // addressable.
                let _ = self.inner.table.borrow_mut().exit(pid);
                return Err(err.into());
            }
        };
        self.inner
            .table
            .borrow_mut()
            .set_disable_api(pid, Box::new(move || guard.cancel()))?;

        debug!("started {pid} (parent {parent:?})");
        Ok(pid)
    }

    /// Remove a process and its whole subtree.
    pub fn exit(&self, pid: Pid) -> Result<(), HostError> {
        self.inner.table.borrow_mut().exit(pid)?;
        debug!("exited {pid}");
        Ok(())
    }

    /// Move a process under a new parent, or detach it into a root.
    pub fn reparent(&self, pid: Pid, new_parent: Option<Pid>) -> Result<(), HostError> {
        self.inner.table.borrow_mut().reparent(pid, new_parent)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Children of `pid`; with `None`, the forest's roots.
    pub fn children(&self, pid: Option<Pid>) -> Result<Vec<Pid>, HostError> {
        Ok(self.inner.table.borrow().children(pid)?)
    }

    /// Parent of `pid`, absent for roots.
    pub fn parent(&self, pid: Pid) -> Result<Option<Pid>, HostError> {
        Ok(self.inner.table.borrow().parent(pid)?)
    }

    /// Whether `pid` lies in the subtree rooted at `root`.
    pub fn is_in_subtree(&self, pid: Pid, root: Pid) -> bool {
        self.inner.table.borrow().is_in_subtree(pid, root)
    }

    /// Whether `pid` is live.
    pub fn contains(&self, pid: Pid) -> bool {
        self.inner.table.borrow().contains(pid)
    }

    /// Snapshot of every live process.
    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.inner.table.borrow().processes()
    }

    // ------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------

    /// Claim the first free name among `options` for `pid`.
    pub fn claim_name(
        &self,
        pid: Pid,
        options: &[String],
    ) -> Result<Option<String>, HostError> {
        Ok(self.inner.table.borrow_mut().claim_name(pid, options)?)
    }

    /// Name currently held by `pid`.
    pub fn name_of(&self, pid: Pid) -> Result<Option<String>, HostError> {
        Ok(self.inner.table.borrow().name_of(pid)?)
    }

    /// `[name, pid]` for the first held option.
    pub fn find(&self, options: &[String]) -> Option<(String, Pid)> {
        self.inner.table.borrow().find(options)
    }

    /// Resolve `name` now or once it is next claimed.
    pub async fn wait(&self, name: &str) -> Result<Pid, HostError> {
        let wait = self.inner.table.borrow_mut().wait(name);
        match wait {
            NameWait::Ready(pid) => Ok(pid),
            NameWait::Pending(rx) => rx
                .await
                .map_err(|_| HostError::Rpc(RpcError::ChannelClosed)),
        }
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Post a sender-stamped `[sender, data]` frame on a process's port.
    pub fn send_as(
        &self,
        sender: Option<Pid>,
        target: Pid,
        data: Value,
        transfer: Vec<MessagePort>,
    ) -> Result<(), HostError> {
        let table = self.inner.table.borrow();
        let endpoint = table.endpoint(target)?;
        endpoint.0.post(json!([sender, data]), transfer);
        Ok(())
    }

    /// Best-effort teardown, the process-exit (`unload`) hook.
    ///
    /// Every locally-held port gets the closure frame before being
    /// closed; failures are swallowed since ports may have been
    /// transferred away. The table is then drained root by root.
    pub fn shutdown(&self) {
        {
            let table = self.inner.table.borrow();
            for pid in table.pids() {
                if let Ok(endpoint) = table.endpoint(pid) {
                    endpoint.0.post(close_frame(), Vec::new());
                }
            }
        }
        loop {
            let roots = match self.children(None) {
                Ok(roots) if !roots.is_empty() => roots,
                _ => break,
            };
            for root in roots {
                if let Err(err) = self.exit(root) {
                    warn!("shutdown: failed to exit {root}: {err}");
                }
            }
        }
        debug!("host shut down");
    }

    // ------------------------------------------------------------------
    // Internals shared with the API assembly
    // ------------------------------------------------------------------

    /// Not-found / not-descendant gate used by every caller-bound
    /// lifecycle and query handler.
    fn authorize(&self, caller: Pid, target: Pid) -> Result<(), HostError> {
        let table = self.inner.table.borrow();
        if !table.contains(target) {
            return Err(HostError::NotFound(target));
        }
        if !table.is_in_subtree(target, caller) {
            return Err(HostError::NotDescendant { target, caller });
        }
        Ok(())
    }

    fn host_api_for(&self, pid: Pid) -> ApiTable {
        (self.inner.config.host_api)(pid)
    }
}
