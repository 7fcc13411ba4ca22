//! Host-level scenarios: spawning, subtree authority, reparenting,
//! names and waiting, sender-stamped delivery, API extension, shutdown.
//!
//! The `get_port` collaborator simulates workers: each spawned "worker"
//! is a fresh channel whose process-side end the test drives directly.

use std::cell::RefCell;
use std::rc::Rc;

use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use harbor_channel::{is_close_frame, MessageChannel, MessageTarget, WorkerHandle};
use harbor_host::{Host, HostConfig, HostError, StartChild};
use harbor_kernel::Pid;
use harbor_rpc::{get_client, ApiTable, Property, RpcError};
use serde_json::{json, Value};

struct Fixture {
    pool: LocalPool,
    host: Host,
    /// Process-side ends of url-spawned workers, in spawn order.
    ends: Rc<RefCell<Vec<MessageTarget>>>,
    /// URLs whose workers have been terminated.
    terminated: Rc<RefCell<Vec<String>>>,
}

fn fixture_with_api(host_api: impl Fn(Pid) -> ApiTable + 'static) -> Fixture {
    let pool = LocalPool::new();
    let spawner = pool.spawner();
    let ends: Rc<RefCell<Vec<MessageTarget>>> = Rc::new(RefCell::new(Vec::new()));
    let terminated: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let spawned = ends.clone();
    let torn_down = terminated.clone();
    let config = HostConfig::new(move |url| {
        let (host_end, proc_end) = MessageChannel::new();
        spawned.borrow_mut().push(MessageTarget::from(proc_end));
        let url = url.to_string();
        let torn_down = torn_down.clone();
        Ok(MessageTarget::from(WorkerHandle::with_terminator(
            host_end,
            Box::new(move || torn_down.borrow_mut().push(url)),
        )))
    })
    .with_host_api(host_api);

    Fixture {
        host: Host::new(config, spawner),
        pool,
        ends,
        terminated,
    }
}

fn fixture() -> Fixture {
    fixture_with_api(|_pid| ApiTable::new())
}

fn end(fx: &Fixture, index: usize) -> MessageTarget {
    fx.ends.borrow()[index].clone()
}

fn remote_error(err: RpcError) -> String {
    match err {
        RpcError::Remote(value) => value.as_str().unwrap_or_default().to_string(),
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[test]
fn spawn_and_address() {
    let mut fx = fixture();
    let pid = fx.host.start(StartChild::Url("u1".into()), None).unwrap();
    assert_eq!(pid, Pid(1));

    let spawner = fx.pool.spawner();
    let client = fx
        .pool
        .run_until(get_client(&spawner, end(&fx, 0)))
        .unwrap();
    let me = fx.pool.run_until(client.call("getPid", vec![])).unwrap();
    assert_eq!(me, json!(1));

    let ps = fx.host.processes();
    assert_eq!(ps.len(), 1);
    assert_eq!(ps[0].pid, Pid(1));
    assert_eq!(ps[0].parent, None);
}

/// Builds a three-deep chain (u1 parents u2 parents u3) and returns
/// clients for u1 and u2.
fn chain(fx: &mut Fixture) -> (harbor_rpc::Client, harbor_rpc::Client) {
    let spawner = fx.pool.spawner();
    fx.host.start(StartChild::Url("u1".into()), None).unwrap();

    let u1 = fx
        .pool
        .run_until(get_client(&spawner, end(fx, 0)))
        .unwrap();
    let child = fx
        .pool
        .run_until(u1.call("start", vec![json!("u2")]))
        .unwrap();
    assert_eq!(child, json!(2));

    let u2 = fx
        .pool
        .run_until(get_client(&spawner, end(fx, 1)))
        .unwrap();
    let grandchild = fx
        .pool
        .run_until(u2.call("start", vec![json!("u3")]))
        .unwrap();
    assert_eq!(grandchild, json!(3));

    (u1, u2)
}

#[test]
fn subtree_authority_gates_exit() {
    let mut fx = fixture();
    let (_u1, u2) = chain(&mut fx);

    let err = fx.pool.run_until(u2.call("exit", vec![json!(1)])).unwrap_err();
    assert!(remote_error(err).contains("not a descendant"));

    // Table unchanged.
    for pid in [1, 2, 3] {
        assert!(fx.host.contains(Pid(pid)));
    }
}

#[test]
fn reparent_refuses_cycles() {
    let mut fx = fixture();
    let (u1, _u2) = chain(&mut fx);

    let err = fx
        .pool
        .run_until(u1.call("reparent", vec![json!(3), json!(3)]))
        .unwrap_err();
    assert!(remote_error(err).contains("cycle"));
    assert_eq!(fx.host.parent(Pid(3)).unwrap(), Some(Pid(2)));
}

#[test]
fn reparent_moves_a_descendant_up() {
    let mut fx = fixture();
    let (u1, _u2) = chain(&mut fx);

    // newParent defaults to the caller.
    fx.pool
        .run_until(u1.call("reparent", vec![json!(3)]))
        .unwrap();
    assert_eq!(fx.host.parent(Pid(3)).unwrap(), Some(Pid(1)));

    let kids = fx.pool.run_until(u1.call("children", vec![])).unwrap();
    assert_eq!(kids, json!([2, 3]));
}

#[test]
fn ancestor_exits_a_child_subtree() {
    let mut fx = fixture();
    let (u1, _u2) = chain(&mut fx);

    fx.pool.run_until(u1.call("exit", vec![json!(2)])).unwrap();
    assert!(fx.host.contains(Pid(1)));
    assert!(!fx.host.contains(Pid(2)));
    assert!(!fx.host.contains(Pid(3)));
    // Both workers' execution contexts were torn down, deepest first.
    assert_eq!(*fx.terminated.borrow(), vec!["u3", "u2"]);
}

#[test]
fn self_exit_removes_own_subtree() {
    let mut fx = fixture();
    let (_u1, u2) = chain(&mut fx);

    // Exiting yourself tears down your own API mid-call, so the reply
    // may never arrive; fire the call and let the pool settle.
    let spawner = fx.pool.spawner();
    spawner
        .spawn_local(async move {
            let _ = u2.call("exit", vec![]).await;
        })
        .unwrap();
    fx.pool.run_until_stalled();

    assert!(fx.host.contains(Pid(1)));
    assert!(!fx.host.contains(Pid(2)));
    assert!(!fx.host.contains(Pid(3)));
}

#[test]
fn name_then_wait_resolves_pending_waiters() {
    let mut fx = fixture();
    let (u1, u2) = chain(&mut fx);
    let spawner = fx.pool.spawner();

    let resolved = Rc::new(RefCell::new(None));
    let slot = resolved.clone();
    spawner
        .spawn_local(async move {
            let out = u1.call("wait", vec![json!("db")]).await;
            *slot.borrow_mut() = Some(out);
        })
        .unwrap();
    fx.pool.run_until_stalled();
    assert!(resolved.borrow().is_none());

    let claimed = fx
        .pool
        .run_until(u2.call("name", vec![json!(["db"])]))
        .unwrap();
    assert_eq!(claimed, json!("db"));

    fx.pool.run_until_stalled();
    let out = resolved.borrow_mut().take().expect("wait resolved");
    assert_eq!(out.unwrap(), json!(2));

    let found = fx
        .pool
        .run_until(u2.call("find", vec![json!(["db"])]))
        .unwrap();
    assert_eq!(found, json!(["db", 2]));
}

#[test]
fn exhausted_name_options_return_false() {
    let mut fx = fixture();
    let (u1, u2) = chain(&mut fx);

    let first = fx
        .pool
        .run_until(u1.call("name", vec![json!(["db"])]))
        .unwrap();
    assert_eq!(first, json!("db"));

    let second = fx
        .pool
        .run_until(u2.call("name", vec![json!(["db"])]))
        .unwrap();
    assert_eq!(second, json!(false));
    assert_eq!(fx.host.name_of(Pid(2)).unwrap(), None);
}

#[test]
fn wait_resolves_immediately_for_held_names() {
    let mut fx = fixture();
    let (u1, u2) = chain(&mut fx);

    fx.pool
        .run_until(u2.call("name", vec![json!(["db"])]))
        .unwrap();
    let found = fx.pool.run_until(u1.call("wait", vec![json!("db")])).unwrap();
    assert_eq!(found, json!(2));
}

#[test]
fn send_stamps_the_sender() {
    let mut fx = fixture();
    let (u1, _u2) = chain(&mut fx);

    // Listen on U2's own end of its root port.
    let u2_end = end(&fx, 1);
    let mut inbox = u2_end.subscribe();
    u2_end.start();

    fx.pool
        .run_until(u1.call("send", vec![json!(2), json!("hello")]))
        .unwrap();
    let msg = fx.pool.run_until(async move { inbox.next().await }).unwrap();
    assert_eq!(msg.data, json!([1, "hello"]));
}

#[test]
fn send_to_unknown_pid_fails() {
    let mut fx = fixture();
    let (u1, _u2) = chain(&mut fx);

    let err = fx
        .pool
        .run_until(u1.call("send", vec![json!(99), json!("x")]))
        .unwrap_err();
    assert!(remote_error(err).contains("not found"));
}

#[test]
fn start_adopts_a_transferred_port() {
    let mut fx = fixture();
    fx.host.start(StartChild::Url("u1".into()), None).unwrap();
    let spawner = fx.pool.spawner();
    let u1 = fx
        .pool
        .run_until(get_client(&spawner, end(&fx, 0)))
        .unwrap();

    let (for_host, kept) = MessageChannel::new();
    let adopted = fx
        .pool
        .run_until(u1.call_with_transfer("start", vec![], vec![for_host]))
        .unwrap();
    assert_eq!(adopted, json!(2));
    assert_eq!(fx.host.parent(Pid(2)).unwrap(), Some(Pid(1)));

    // The adopted process answers on its kept end.
    let adopted_client = fx
        .pool
        .run_until(get_client(&spawner, MessageTarget::from(kept)))
        .unwrap();
    let me = fx
        .pool
        .run_until(adopted_client.call("getPid", vec![]))
        .unwrap();
    assert_eq!(me, json!(2));
}

#[test]
fn start_with_missing_parent_fails() {
    let fx = fixture();
    let (port, _kept) = MessageChannel::new();
    let err = fx
        .host
        .start(StartChild::from(port), Some(Pid(99)))
        .unwrap_err();
    assert_eq!(err, HostError::NotFound(Pid(99)));
    assert!(fx.host.processes().is_empty());
}

#[test]
fn adopt_only_hosts_refuse_urls() {
    let mut pool = LocalPool::new();
    let host = Host::new(HostConfig::adopt_only(), pool.spawner());
    let err = host.start(StartChild::Url("u1".into()), None).unwrap_err();
    assert!(matches!(err, HostError::SpawnUnsupported(_)));
    pool.run_until_stalled();
}

#[test]
fn host_api_extends_without_shadowing() {
    let mut fx = fixture_with_api(|_pid| {
        let mut extra = ApiTable::new();
        extra.insert_sync("shout", |args| {
            let text = args.first().and_then(Value::as_str).unwrap_or("");
            Ok(json!(text.to_uppercase()))
        });
        // A hostile extension must not take over a core call.
        extra.insert_sync("getPid", |_args| Ok(json!(9999)));
        extra
    });

    fx.host.start(StartChild::Url("u1".into()), None).unwrap();
    let spawner = fx.pool.spawner();
    let client = fx
        .pool
        .run_until(get_client(&spawner, end(&fx, 0)))
        .unwrap();

    let loud = fx
        .pool
        .run_until(client.call("shout", vec![json!("quiet")]))
        .unwrap();
    assert_eq!(loud, json!("QUIET"));

    // The core getPid won.
    let me = fx.pool.run_until(client.call("getPid", vec![])).unwrap();
    assert_eq!(me, json!(1));
}

#[test]
fn host_api_properties_reach_the_client() {
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    let ends: Rc<RefCell<Vec<MessageTarget>>> = Rc::new(RefCell::new(Vec::new()));

    let title = Property::writable("Title", json!("A"));
    let prop = title.clone();
    let reg_spawner = spawner.clone();
    let spawned = ends.clone();
    let config = HostConfig::new(move |_url| {
        let (host_end, proc_end) = MessageChannel::new();
        spawned.borrow_mut().push(MessageTarget::from(proc_end));
        Ok(MessageTarget::from(WorkerHandle::new(host_end)))
    })
    .with_host_api(move |_pid| {
        let mut extra = ApiTable::new();
        prop.register(&mut extra, &reg_spawner);
        extra
    });

    let host = Host::new(config, spawner.clone());
    host.start(StartChild::Url("u1".into()), None).unwrap();

    let proc_end = ends.borrow()[0].clone();
    let client = pool.run_until(get_client(&spawner, proc_end)).unwrap();

    assert_eq!(client.get("Title").unwrap(), json!("A"));
    client.set("Title", json!("B")).unwrap();
    pool.run_until_stalled();
    assert_eq!(title.get(), json!("B"));
}

#[test]
fn shutdown_announces_closure_on_every_port() {
    let mut fx = fixture();
    fx.host.start(StartChild::Url("u1".into()), None).unwrap();
    fx.host.start(StartChild::Url("u2".into()), None).unwrap();

    let mut inboxes: Vec<_> = (0..2)
        .map(|i| {
            let e = end(&fx, i);
            let sub = e.subscribe();
            e.start();
            sub
        })
        .collect();

    fx.host.shutdown();
    assert!(fx.host.processes().is_empty());
    assert_eq!(*fx.terminated.borrow(), vec!["u1", "u2"]);

    for inbox in &mut inboxes {
        let msg = fx
            .pool
            .run_until(async { inbox.next().await })
            .expect("closure frame delivered");
        assert!(is_close_frame(&msg.data));
    }
}
