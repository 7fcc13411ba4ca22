//! The per-dispatch transfer list.
//!
//! When a request frame arrives with transferred ports, handler bodies
//! can read them through [`current_transfer`] instead of threading them
//! through the argument list. The binding is scoped to the synchronous
//! part of one handler invocation: it is installed just before the
//! handler is called and cleared as soon as the handler returns its
//! future, so it never behaves like global state.

use std::cell::RefCell;

use harbor_channel::MessagePort;
use log::warn;

thread_local! {
    static CURRENT_TRANSFER: RefCell<Option<Vec<MessagePort>>> = const { RefCell::new(None) };
}

/// The transfer list of the request currently being dispatched.
///
/// Valid only during the synchronous part of a handler body. Calling it
/// anywhere else logs a warning and returns an empty list; it never
/// fails.
pub fn current_transfer() -> Vec<MessagePort> {
    CURRENT_TRANSFER.with(|cell| match cell.borrow().as_ref() {
        Some(ports) => ports.clone(),
        None => {
            warn!("current_transfer() called outside the synchronous part of a handler");
            Vec::new()
        }
    })
}

/// Install `ports` around the synchronous invocation `f`.
///
/// The binding is cleared when `f` returns, which for an RPC handler is
/// the moment it hands back its future: the first suspension point.
pub(crate) fn with_transfer<R>(ports: Vec<MessagePort>, f: impl FnOnce() -> R) -> R {
    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            CURRENT_TRANSFER.with(|cell| cell.borrow_mut().take());
        }
    }

    CURRENT_TRANSFER.with(|cell| *cell.borrow_mut() = Some(ports));
    let _reset = Reset;
    f()
}
