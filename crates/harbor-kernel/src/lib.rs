//! Process table for the harbor host.
//!
//! This crate holds the bookkeeping half of the host: which processes
//! exist, how they are parented, what they are named, and who is waiting
//! for a name to appear. It is deliberately transport-free: the table is
//! generic over an [`Endpoint`] so it never depends on how messages move.
//!
//! # Structure
//!
//! - Every live process is one [`Pid`] → row entry in a `BTreeMap`.
//! - The parent relation forms a forest: multiple roots, no cycles.
//!   Cycles are refused at [`ProcessTable::reparent`].
//! - At most one name per process; the name registry is a bijection from
//!   name to PID for currently-named processes.
//! - `wait` registers a resolver that fires the next time any process
//!   claims the awaited name.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use futures_channel::oneshot;
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Process identifier.
///
/// PIDs are small positive integers, locally unique within one host.
/// A PID may be reused after the process exits, never while it is live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

// ============================================================================
// Endpoint abstraction
// ============================================================================

/// Transport endpoint attached to a process row.
///
/// The table closes endpoints when rows are removed but never sends or
/// receives through them; the host supplies the concrete type.
pub trait Endpoint {
    /// Close the communication endpoint.
    fn close(&self);

    /// Tear down the backing execution context, if there is one.
    ///
    /// Meaningful for worker-backed processes; the default is a no-op.
    fn terminate(&self) {}
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from table operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum TableError {
    /// The referenced PID does not exist in the table.
    #[error("process not found: {0}")]
    NotFound(Pid),

    /// Reparenting would create a cycle in the process forest.
    #[error("reparenting {child} under {parent} would create a cycle")]
    TopologyViolation {
        /// Process being moved
        child: Pid,
        /// Requested new parent
        parent: Pid,
    },
}

// ============================================================================
// Rows
// ============================================================================

/// Teardown closure for the API server installed on a process's port.
pub type DisableApi = Box<dyn FnOnce()>;

struct ProcessRow<E> {
    endpoint: E,
    parent: Option<Pid>,
    children: BTreeSet<Pid>,
    name: Option<String>,
    disable_api: Option<DisableApi>,
}

/// Read-only snapshot of one process row, for `ps`-style listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: Pid,
    /// Parent PID, absent for roots
    pub parent: Option<Pid>,
    /// Registered name, if any
    pub name: Option<String>,
}

/// Outcome of [`ProcessTable::wait`].
pub enum NameWait {
    /// The name is currently held by this PID.
    Ready(Pid),
    /// Nobody holds the name yet; the receiver resolves on the next claim.
    Pending(oneshot::Receiver<Pid>),
}

// ============================================================================
// Process table
// ============================================================================

/// The process table: rows, the name registry, and pending name waiters.
///
/// All mutation happens through the host on one logical thread, so the
/// table needs no internal locking.
pub struct ProcessTable<E> {
    rows: BTreeMap<Pid, ProcessRow<E>>,
    names: BTreeMap<String, Pid>,
    waiters: BTreeMap<String, Vec<oneshot::Sender<Pid>>>,
    next_pid: u32,
}

impl<E> Default for ProcessTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ProcessTable<E> {
    /// Create an empty table. The first allocated PID is 1.
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            names: BTreeMap::new(),
            waiters: BTreeMap::new(),
            next_pid: 0,
        }
    }

    /// Number of live processes.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no process is registered.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True when `pid` names a live process.
    pub fn contains(&self, pid: Pid) -> bool {
        self.rows.contains_key(&pid)
    }

    /// Advance the rolling counter past occupied slots.
    ///
    /// Skips at most `len` occupied positions, so allocation stays cheap
    /// even after heavy PID churn. PID 0 is never handed out.
    fn alloc_pid(&mut self) -> Pid {
        loop {
            self.next_pid = self.next_pid.wrapping_add(1);
            if self.next_pid == 0 {
                continue;
            }
            let candidate = Pid(self.next_pid);
            if !self.rows.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Register a process and return its freshly allocated PID.
    ///
    /// Fails with [`TableError::NotFound`] when `parent` is given but
    /// absent from the table.
    pub fn insert(&mut self, endpoint: E, parent: Option<Pid>) -> Result<Pid, TableError> {
        if let Some(p) = parent {
            if !self.rows.contains_key(&p) {
                return Err(TableError::NotFound(p));
            }
        }

        let pid = self.alloc_pid();
        self.rows.insert(
            pid,
            ProcessRow {
                endpoint,
                parent,
                children: BTreeSet::new(),
                name: None,
                disable_api: None,
            },
        );
        if let Some(p) = parent {
            // Parent existence was checked above.
            if let Some(row) = self.rows.get_mut(&p) {
                row.children.insert(pid);
            }
        }
        Ok(pid)
    }

    /// Attach the API-server teardown closure to a row.
    ///
    /// Replaces any previously attached closure without running it.
    pub fn set_disable_api(&mut self, pid: Pid, disable: DisableApi) -> Result<(), TableError> {
        let row = self.rows.get_mut(&pid).ok_or(TableError::NotFound(pid))?;
        row.disable_api = Some(disable);
        Ok(())
    }

    /// Borrow the endpoint attached to a row.
    pub fn endpoint(&self, pid: Pid) -> Result<&E, TableError> {
        self.rows
            .get(&pid)
            .map(|row| &row.endpoint)
            .ok_or(TableError::NotFound(pid))
    }

    /// Parent of `pid`, or `None` for a root process.
    pub fn parent(&self, pid: Pid) -> Result<Option<Pid>, TableError> {
        self.rows
            .get(&pid)
            .map(|row| row.parent)
            .ok_or(TableError::NotFound(pid))
    }

    /// Direct children of `pid`; with `None`, every root process.
    ///
    /// Enumerating the roots is the only way to walk the whole forest.
    pub fn children(&self, pid: Option<Pid>) -> Result<Vec<Pid>, TableError> {
        match pid {
            Some(p) => self
                .rows
                .get(&p)
                .map(|row| row.children.iter().copied().collect())
                .ok_or(TableError::NotFound(p)),
            None => Ok(self
                .rows
                .iter()
                .filter(|(_, row)| row.parent.is_none())
                .map(|(pid, _)| *pid)
                .collect()),
        }
    }

    /// Walk parent pointers from `pid` upward; true once `root` is met.
    ///
    /// A process is in its own subtree. Unknown PIDs are in nobody's
    /// subtree.
    pub fn is_in_subtree(&self, pid: Pid, root: Pid) -> bool {
        let mut cursor = Some(pid);
        while let Some(current) = cursor {
            if current == root {
                return true;
            }
            cursor = match self.rows.get(&current) {
                Some(row) => row.parent,
                None => return false,
            };
        }
        false
    }

    /// Move `pid` under `new_parent`, or detach it into a root.
    ///
    /// Refuses to create a cycle: the new parent must not lie inside the
    /// subtree of the process being moved.
    pub fn reparent(&mut self, pid: Pid, new_parent: Option<Pid>) -> Result<(), TableError> {
        if !self.rows.contains_key(&pid) {
            return Err(TableError::NotFound(pid));
        }
        if let Some(np) = new_parent {
            if !self.rows.contains_key(&np) {
                return Err(TableError::NotFound(np));
            }
            if self.is_in_subtree(np, pid) {
                return Err(TableError::TopologyViolation {
                    child: pid,
                    parent: np,
                });
            }
        }

        let old_parent = self.rows.get(&pid).and_then(|row| row.parent);
        if let Some(op) = old_parent {
            if let Some(row) = self.rows.get_mut(&op) {
                row.children.remove(&pid);
            }
        }
        if let Some(row) = self.rows.get_mut(&pid) {
            row.parent = new_parent;
        }
        if let Some(np) = new_parent {
            if let Some(row) = self.rows.get_mut(&np) {
                row.children.insert(pid);
            }
        }
        Ok(())
    }

    /// Remove `pid` and every transitive descendant, depth first.
    ///
    /// Each removed row runs its teardown closure, then the endpoint is
    /// closed and terminated; the row's name is released.
    pub fn exit(&mut self, pid: Pid) -> Result<(), TableError>
    where
        E: Endpoint,
    {
        if !self.rows.contains_key(&pid) {
            return Err(TableError::NotFound(pid));
        }

        let children: Vec<Pid> = self
            .rows
            .get(&pid)
            .map(|row| row.children.iter().copied().collect())
            .unwrap_or_default();
        for child in children {
            // Children cannot vanish between the snapshot and here.
            let _ = self.exit(child);
        }

        if let Some(parent) = self.rows.get(&pid).and_then(|row| row.parent) {
            if let Some(row) = self.rows.get_mut(&parent) {
                row.children.remove(&pid);
            }
        }

        if let Some(mut row) = self.rows.remove(&pid) {
            if let Some(name) = row.name.take() {
                self.names.remove(&name);
            }
            if let Some(disable) = row.disable_api.take() {
                disable();
            }
            row.endpoint.close();
            row.endpoint.terminate();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------

    /// Registered name of `pid`, if any.
    pub fn name_of(&self, pid: Pid) -> Result<Option<String>, TableError> {
        self.rows
            .get(&pid)
            .map(|row| row.name.clone())
            .ok_or(TableError::NotFound(pid))
    }

    /// Resolve the name currently held by `pid` behind `name`.
    pub fn lookup(&self, name: &str) -> Option<Pid> {
        self.names.get(name).copied()
    }

    /// Claim the first unclaimed name among `options` for `pid`.
    ///
    /// On success the prior name of `pid` (if any) is released, pending
    /// waiters for the newly taken name fire in registration order, and
    /// the claimed name is returned. When every option is already taken
    /// the claim fails with `Ok(None)` and the prior name is retained.
    /// Empty strings are never claimable.
    pub fn claim_name(&mut self, pid: Pid, options: &[String]) -> Result<Option<String>, TableError> {
        if !self.rows.contains_key(&pid) {
            return Err(TableError::NotFound(pid));
        }

        let chosen = options
            .iter()
            .find(|opt| !opt.is_empty() && !self.names.contains_key(*opt))
            .cloned();
        let Some(name) = chosen else {
            return Ok(None);
        };

        if let Some(row) = self.rows.get_mut(&pid) {
            if let Some(prior) = row.name.take() {
                self.names.remove(&prior);
            }
            row.name = Some(name.clone());
        }
        self.names.insert(name.clone(), pid);

        if let Some(pending) = self.waiters.remove(&name) {
            for waiter in pending {
                // The receiver may have been dropped; nothing to do then.
                let _ = waiter.send(pid);
            }
        }
        Ok(Some(name))
    }

    /// `[name, pid]` for the first option currently held, or `None`.
    pub fn find(&self, options: &[String]) -> Option<(String, Pid)> {
        options
            .iter()
            .find_map(|opt| self.names.get(opt).map(|pid| (opt.clone(), *pid)))
    }

    /// Resolve `name` now, or register a resolver for its next claim.
    pub fn wait(&mut self, name: &str) -> NameWait {
        if let Some(pid) = self.names.get(name) {
            return NameWait::Ready(*pid);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(String::from(name)).or_default().push(tx);
        NameWait::Pending(rx)
    }

    // ------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------

    /// Snapshot of every live row, ordered by PID.
    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.rows
            .iter()
            .map(|(pid, row)| ProcessInfo {
                pid: *pid,
                parent: row.parent,
                name: row.name.clone(),
            })
            .collect()
    }

    /// All live PIDs, ascending.
    pub fn pids(&self) -> Vec<Pid> {
        self.rows.keys().copied().collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
