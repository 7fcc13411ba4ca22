//! Entangled port pairs with buffer-until-start delivery.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use futures::channel::mpsc;
use futures::StreamExt;
use log::trace;
use serde_json::Value;

/// One inbound unit: a JSON payload plus the ports transferred with it.
#[derive(Clone, Debug, Default)]
pub struct Message {
    /// Structured payload, the `event.data` analogue.
    pub data: Value,
    /// Ports that rode along, the `event.ports` analogue.
    pub ports: Vec<MessagePort>,
}

impl Message {
    /// Message with payload only.
    pub fn data(data: Value) -> Self {
        Self { data, ports: Vec::new() }
    }
}

struct SubscriberEntry {
    id: u64,
    once: bool,
    tx: mpsc::UnboundedSender<Message>,
}

struct PortInner {
    peer: Weak<RefCell<PortInner>>,
    started: bool,
    closed: bool,
    buffer: VecDeque<Message>,
    subscribers: Vec<SubscriberEntry>,
    next_sub: u64,
}

impl PortInner {
    fn detached() -> Self {
        Self {
            peer: Weak::new(),
            started: false,
            closed: false,
            buffer: VecDeque::new(),
            subscribers: Vec::new(),
            next_sub: 0,
        }
    }

    /// Fan one message out to every live subscription, dropping dead and
    /// once-only entries as it goes.
    fn fan_out(&mut self, msg: Message) {
        if self.subscribers.is_empty() {
            trace!("message delivered to a started port with no subscribers; dropped");
            return;
        }
        self.subscribers.retain_mut(|sub| {
            if sub.tx.unbounded_send(msg.clone()).is_err() {
                return false;
            }
            !sub.once
        });
    }

    fn deliver(&mut self, msg: Message) {
        if self.closed {
            return;
        }
        if self.started {
            self.fan_out(msg);
        } else {
            self.buffer.push_back(msg);
        }
    }
}

/// One end of a bidirectional message channel.
///
/// Clones share the same underlying endpoint, mirroring how a port object
/// can be handed around within one execution context.
#[derive(Clone)]
pub struct MessagePort {
    inner: Rc<RefCell<PortInner>>,
}

impl std::fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.borrow();
        f.debug_struct("MessagePort")
            .field("started", &st.started)
            .field("closed", &st.closed)
            .field("buffered", &st.buffer.len())
            .finish()
    }
}

/// A pair of entangled ports.
pub struct MessageChannel;

impl MessageChannel {
    /// Create a fresh channel and return its two ports.
    pub fn new() -> (MessagePort, MessagePort) {
        let a = Rc::new(RefCell::new(PortInner::detached()));
        let b = Rc::new(RefCell::new(PortInner::detached()));
        a.borrow_mut().peer = Rc::downgrade(&b);
        b.borrow_mut().peer = Rc::downgrade(&a);
        (MessagePort { inner: a }, MessagePort { inner: b })
    }
}

impl MessagePort {
    /// Post a payload (and transferred ports) to the peer.
    ///
    /// Posting on a closed port, or to a peer that is closed or gone, is
    /// a silent no-op; closure is only observable through the closure
    /// frame convention.
    pub fn post(&self, data: Value, transfer: Vec<MessagePort>) {
        let peer = {
            let st = self.inner.borrow();
            if st.closed {
                trace!("post on closed port dropped");
                return;
            }
            st.peer.upgrade()
        };
        let Some(peer) = peer else {
            trace!("post to vanished peer dropped");
            return;
        };
        peer.borrow_mut().deliver(Message { data, ports: transfer });
    }

    /// Begin delivery: flush buffered messages and dispatch from now on.
    ///
    /// Idempotent. Messages flushed to a port with no subscription are
    /// dropped, so subscribe before starting.
    pub fn start(&self) {
        let mut st = self.inner.borrow_mut();
        if st.started {
            return;
        }
        st.started = true;
        while let Some(msg) = st.buffer.pop_front() {
            st.fan_out(msg);
        }
    }

    /// Whether `start` has been called.
    pub fn is_started(&self) -> bool {
        self.inner.borrow().started
    }

    /// Sever this end: drop buffered messages and end every subscription.
    ///
    /// The peer is not notified; that is what the closure frame is for.
    pub fn close(&self) {
        let mut st = self.inner.borrow_mut();
        st.closed = true;
        st.buffer.clear();
        st.subscribers.clear();
    }

    /// Whether this end has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Subscribe to inbound messages.
    ///
    /// Every subscription sees every message delivered while it is live.
    /// Dropping the subscription unsubscribes.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_inner(false)
    }

    /// Subscribe for exactly the next inbound message.
    pub fn subscribe_once(&self) -> Subscription {
        self.subscribe_inner(true)
    }

    fn subscribe_inner(&self, once: bool) -> Subscription {
        let (tx, rx) = mpsc::unbounded();
        let id = {
            let mut st = self.inner.borrow_mut();
            let id = st.next_sub;
            st.next_sub += 1;
            // On a closed port the sender is dropped right away, so the
            // subscription comes back already ended instead of pending
            // forever.
            if !st.closed {
                st.subscribers.push(SubscriberEntry { id, once, tx });
            }
            id
        };
        Subscription {
            rx,
            port: self.clone(),
            id,
        }
    }

    /// True when both handles are the same endpoint.
    pub fn same_port(&self, other: &MessagePort) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A live subscription to a port's inbound messages.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Message>,
    port: MessagePort,
    id: u64,
}

impl Subscription {
    /// Next inbound message, or `None` once the port is closed (or a
    /// once-only subscription was served).
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.next().await
    }

    /// The port this subscription listens on.
    pub fn port(&self) -> &MessagePort {
        &self.port
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut st = self.port.inner.borrow_mut();
        st.subscribers.retain(|sub| sub.id != self.id);
    }
}
