//! The message-target union: ports, workers, and windows.
//!
//! The substrate treats anything that can subscribe, unsubscribe, and
//! post as a message target. The concrete variants differ only at the
//! edges: workers can additionally be terminated, windows take an origin
//! on post (always `"*"` here).

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use serde_json::Value;

use crate::port::{MessagePort, Subscription};

/// Discriminant for [`MessageTarget`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// Plain bidirectional port.
    Port,
    /// Worker-backed endpoint; supports termination.
    Worker,
    /// Window-backed endpoint; origin-taking post.
    Window,
}

/// Teardown hook for a worker's execution context.
pub type Terminator = Box<dyn FnOnce()>;

/// Endpoint of a worker-backed process.
///
/// Wraps the port the worker converses on plus the capability to tear
/// the execution context down.
#[derive(Clone)]
pub struct WorkerHandle {
    port: MessagePort,
    terminator: Rc<RefCell<Option<Terminator>>>,
}

impl WorkerHandle {
    /// Worker handle with no teardown hook.
    pub fn new(port: MessagePort) -> Self {
        Self {
            port,
            terminator: Rc::new(RefCell::new(None)),
        }
    }

    /// Worker handle that runs `terminator` when terminated.
    pub fn with_terminator(port: MessagePort, terminator: Terminator) -> Self {
        Self {
            port,
            terminator: Rc::new(RefCell::new(Some(terminator))),
        }
    }

    /// The port this worker converses on.
    pub fn port(&self) -> &MessagePort {
        &self.port
    }

    /// Stop the worker's execution context and sever its port.
    ///
    /// Idempotent: the teardown hook runs at most once.
    pub fn terminate(&self) {
        let hook = self.terminator.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }
        self.port.close();
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("port", &self.port)
            .finish()
    }
}

/// Endpoint of a window-backed process.
#[derive(Clone, Debug)]
pub struct WindowHandle {
    port: MessagePort,
}

impl WindowHandle {
    /// Wrap a port as a window endpoint.
    pub fn new(port: MessagePort) -> Self {
        Self { port }
    }

    /// The port this window converses on.
    pub fn port(&self) -> &MessagePort {
        &self.port
    }

    /// Window-style post. The host always passes `"*"` as origin.
    pub fn post(&self, data: Value, origin: &str, transfer: Vec<MessagePort>) {
        if origin != "*" {
            debug!("window post with non-wildcard origin {origin:?}; sent anyway");
        }
        self.port.post(data, transfer);
    }
}

/// Tagged union over the endpoints a process can live behind.
#[derive(Clone, Debug)]
pub enum MessageTarget {
    /// Plain bidirectional port.
    Port(MessagePort),
    /// Worker-backed endpoint.
    Worker(WorkerHandle),
    /// Window-backed endpoint.
    Window(WindowHandle),
}

impl From<MessagePort> for MessageTarget {
    fn from(port: MessagePort) -> Self {
        MessageTarget::Port(port)
    }
}

impl From<WorkerHandle> for MessageTarget {
    fn from(worker: WorkerHandle) -> Self {
        MessageTarget::Worker(worker)
    }
}

impl From<WindowHandle> for MessageTarget {
    fn from(window: WindowHandle) -> Self {
        MessageTarget::Window(window)
    }
}

impl MessageTarget {
    /// Which variant this target is.
    pub fn kind(&self) -> TargetKind {
        match self {
            MessageTarget::Port(_) => TargetKind::Port,
            MessageTarget::Worker(_) => TargetKind::Worker,
            MessageTarget::Window(_) => TargetKind::Window,
        }
    }

    /// The underlying port, whatever the variant.
    pub fn port(&self) -> &MessagePort {
        match self {
            MessageTarget::Port(port) => port,
            MessageTarget::Worker(worker) => worker.port(),
            MessageTarget::Window(window) => window.port(),
        }
    }

    /// Post a payload to the peer. Windows post with origin `"*"`.
    pub fn post(&self, data: Value, transfer: Vec<MessagePort>) {
        match self {
            MessageTarget::Window(window) => window.post(data, "*", transfer),
            other => other.port().post(data, transfer),
        }
    }

    /// Subscribe to inbound messages.
    pub fn subscribe(&self) -> Subscription {
        self.port().subscribe()
    }

    /// Subscribe for exactly the next inbound message.
    pub fn subscribe_once(&self) -> Subscription {
        self.port().subscribe_once()
    }

    /// Begin delivery on the underlying port.
    pub fn start(&self) {
        self.port().start();
    }

    /// Sever the underlying port.
    pub fn close(&self) {
        self.port().close();
    }

    /// Whether this target can tear down an execution context.
    pub fn can_terminate(&self) -> bool {
        matches!(self, MessageTarget::Worker(_))
    }

    /// Tear down the execution context, when there is one.
    pub fn terminate(&self) {
        if let MessageTarget::Worker(worker) = self {
            worker.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageChannel;
    use serde_json::json;

    #[test]
    fn kinds_discriminate() {
        let (a, _b) = MessageChannel::new();
        assert_eq!(MessageTarget::from(a.clone()).kind(), TargetKind::Port);
        assert_eq!(
            MessageTarget::from(WorkerHandle::new(a.clone())).kind(),
            TargetKind::Worker
        );
        assert_eq!(
            MessageTarget::from(WindowHandle::new(a)).kind(),
            TargetKind::Window
        );
    }

    #[test]
    fn worker_terminate_runs_hook_once_and_closes() {
        let (a, _b) = MessageChannel::new();
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        let worker = WorkerHandle::with_terminator(a, Box::new(move || *c.borrow_mut() += 1));

        worker.terminate();
        worker.terminate();
        assert_eq!(*count.borrow(), 1);
        assert!(worker.port().is_closed());
    }

    #[test]
    fn window_post_reaches_peer() {
        let (a, b) = MessageChannel::new();
        let window = WindowHandle::new(a);
        let mut sub = b.subscribe();
        b.start();
        window.post(json!("hi"), "*", vec![]);

        let mut pool = futures::executor::LocalPool::new();
        let msg = pool.run_until(async { sub.next().await.unwrap() });
        assert_eq!(msg.data, json!("hi"));
    }

    #[test]
    fn only_workers_terminate() {
        let (a, _b) = MessageChannel::new();
        let target = MessageTarget::from(a.clone());
        assert!(!target.can_terminate());
        target.terminate();
        assert!(!a.is_closed());
    }
}
