//! Per-process API assembly.
//!
//! Every process's server gets the same call set, each handler bound
//! with that process's PID as the implicit caller:
//!
//! | Call | Authority |
//! |------|-----------|
//! | `start(child)` | always; the child is parented under the caller |
//! | `exit(target = self)` | target must be in the caller's subtree |
//! | `children(target = self)` | same |
//! | `parent(target = self)` | same |
//! | `reparent(target, newParent = self)` | subtree + no-cycle |
//! | `getPid()` | unrestricted |
//! | `send(target, data)` | unrestricted; frames are sender-stamped |
//! | `name(options)`, `find(options)`, `wait(name)` | unrestricted |
//!
//! The host-supplied extension table is merged last and cannot shadow
//! these names.

use std::rc::Rc;

use futures::FutureExt;
use harbor_channel::MessageTarget;
use harbor_kernel::Pid;
use harbor_rpc::{current_transfer, ApiTable, RpcError};
use serde_json::{json, Value};

use crate::{Host, HostError, StartChild};

fn to_rpc(err: HostError) -> RpcError {
    RpcError::Failed(err.to_string())
}

/// PID from a JSON argument, if it is a number.
fn pid_arg(value: Option<&Value>) -> Option<Pid> {
    value.and_then(Value::as_u64).map(|n| Pid(n as u32))
}

/// Target PID with the caller as the default.
fn target_or_self(args: &[Value], caller: Pid) -> Pid {
    pid_arg(args.first()).unwrap_or(caller)
}

/// Name options: either one array argument or the string arguments
/// themselves.
fn parse_options(args: &[Value]) -> Vec<String> {
    match args.first() {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => args
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    }
}

/// Build the caller-bound API table for one process.
pub(crate) fn assemble(host: &Host, pid: Pid) -> ApiTable {
    let mut table = ApiTable::new();

    table.insert_sync("getPid", move |_args| Ok(json!(pid)));

    // start: the child arrives either as a URL string or as a port on
    // the transfer list; the new process is parented under the caller.
    let h = host.clone();
    table.insert(
        "start",
        Rc::new(move |args| {
            let mut ports = current_transfer();
            let h = h.clone();
            async move {
                let child = if let Some(port) = ports.drain(..).next() {
                    StartChild::Target(MessageTarget::from(port))
                } else {
                    match args.into_iter().next() {
                        Some(Value::String(url)) => StartChild::Url(url),
                        _ => {
                            return Err(to_rpc(HostError::InvalidArgument(
                                "start needs a url or a transferred port".to_string(),
                            )))
                        }
                    }
                };
                let new_pid = h.start(child, Some(pid)).map_err(to_rpc)?;
                Ok(json!(new_pid))
            }
            .boxed_local()
        }),
    );

    let h = host.clone();
    table.insert_async("exit", move |args| {
        let h = h.clone();
        async move {
            let target = target_or_self(&args, pid);
            h.authorize(pid, target).map_err(to_rpc)?;
            h.exit(target).map_err(to_rpc)?;
            Ok(Value::Null)
        }
    });

    let h = host.clone();
    table.insert_sync("children", move |args| {
        let target = target_or_self(&args, pid);
        h.authorize(pid, target).map_err(to_rpc)?;
        let kids = h.children(Some(target)).map_err(to_rpc)?;
        Ok(json!(kids))
    });

    let h = host.clone();
    table.insert_sync("parent", move |args| {
        let target = target_or_self(&args, pid);
        h.authorize(pid, target).map_err(to_rpc)?;
        let parent = h.parent(target).map_err(to_rpc)?;
        Ok(json!(parent))
    });

    // reparent: the moved process must be in the caller's subtree, and
    // the new parent must not sit inside the moved subtree.
    let h = host.clone();
    table.insert_sync("reparent", move |args| {
        let Some(target) = pid_arg(args.first()) else {
            return Err(to_rpc(HostError::InvalidArgument(
                "reparent needs a target pid".to_string(),
            )));
        };
        let new_parent = pid_arg(args.get(1)).unwrap_or(pid);
        h.authorize(pid, target).map_err(to_rpc)?;
        if !h.contains(new_parent) {
            return Err(to_rpc(HostError::NotFound(new_parent)));
        }
        if h.is_in_subtree(new_parent, target) {
            return Err(to_rpc(HostError::TopologyViolation {
                child: target,
                parent: new_parent,
            }));
        }
        h.reparent(target, Some(new_parent)).map_err(to_rpc)?;
        Ok(Value::Null)
    });

    // send: data goes out stamped with the caller's PID; transferred
    // ports ride along.
    let h = host.clone();
    table.insert(
        "send",
        Rc::new(move |args| {
            let transfer = current_transfer();
            let h = h.clone();
            async move {
                let Some(target) = pid_arg(args.first()) else {
                    return Err(to_rpc(HostError::InvalidArgument(
                        "send needs a target pid".to_string(),
                    )));
                };
                let data = args.into_iter().nth(1).unwrap_or(Value::Null);
                h.send_as(Some(pid), target, data, transfer).map_err(to_rpc)?;
                Ok(Value::Null)
            }
            .boxed_local()
        }),
    );

    let h = host.clone();
    table.insert_sync("name", move |args| {
        let options = parse_options(&args);
        match h.claim_name(pid, &options).map_err(to_rpc)? {
            Some(name) => Ok(json!(name)),
            None => Ok(json!(false)),
        }
    });

    let h = host.clone();
    table.insert_sync("find", move |args| {
        let options = parse_options(&args);
        match h.find(&options) {
            Some((name, found)) => Ok(json!([name, found])),
            None => Ok(json!(false)),
        }
    });

    let h = host.clone();
    table.insert_async("wait", move |args| {
        let h = h.clone();
        async move {
            let Some(name) = args.first().and_then(Value::as_str).map(str::to_string) else {
                return Err(to_rpc(HostError::InvalidArgument(
                    "wait needs a name".to_string(),
                )));
            };
            let found = h.wait(&name).await.map_err(to_rpc)?;
            Ok(json!(found))
        }
    });

    // Window-only concerns (frame display, favicon, title, history)
    // plug in here; the core names stay authoritative.
    table.merge_non_shadowing(host.host_api_for(pid));
    table
}
