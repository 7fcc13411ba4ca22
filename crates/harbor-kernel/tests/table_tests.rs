//! Table invariants under longer operation sequences.
//!
//! The in-file unit tests cover single operations; these drive the table
//! through mixed start/reparent/exit/name sequences and check the
//! structural invariants afterwards.

use std::cell::RefCell;
use std::rc::Rc;

use harbor_kernel::{Endpoint, NameWait, Pid, ProcessTable};

/// Endpoint recording the order of teardown calls.
#[derive(Clone, Default)]
struct Recorder {
    closed: Rc<RefCell<Vec<Pid>>>,
    tag: Option<Pid>,
}

impl Recorder {
    fn for_pid(&self, pid: Pid) -> Recorder {
        Recorder {
            closed: self.closed.clone(),
            tag: Some(pid),
        }
    }
}

impl Endpoint for Recorder {
    fn close(&self) {
        if let Some(pid) = self.tag {
            self.closed.borrow_mut().push(pid);
        }
    }
}

/// Checks parent/child symmetry and acyclicity over the whole table.
fn assert_forest(table: &ProcessTable<Recorder>) {
    for info in table.processes() {
        if let Some(parent) = info.parent {
            let kids = table.children(Some(parent)).expect("parent row exists");
            assert!(
                kids.contains(&info.pid),
                "{} missing from children of {}",
                info.pid,
                parent
            );
        }
        // Walking up from any node must terminate at a root.
        let mut hops = 0;
        let mut cursor = info.parent;
        while let Some(up) = cursor {
            hops += 1;
            assert!(hops <= table.len(), "cycle above {}", info.pid);
            cursor = table.parent(up).expect("ancestor row exists");
        }
    }
    // Every child edge points at a live row.
    for root in table.children(None).expect("roots are listable") {
        assert!(table.contains(root));
    }
}

#[test]
fn mixed_sequence_keeps_the_forest_consistent() {
    let mut table: ProcessTable<Recorder> = ProcessTable::new();
    let rec = Recorder::default();

    let a = table.insert(rec.for_pid(Pid(1)), None).unwrap();
    let b = table.insert(rec.for_pid(Pid(2)), Some(a)).unwrap();
    let c = table.insert(rec.for_pid(Pid(3)), Some(b)).unwrap();
    let d = table.insert(rec.for_pid(Pid(4)), Some(a)).unwrap();
    let e = table.insert(rec.for_pid(Pid(5)), None).unwrap();
    assert_forest(&table);

    // Shuffle the tree around.
    table.reparent(c, Some(a)).unwrap();
    table.reparent(d, Some(e)).unwrap();
    table.reparent(b, None).unwrap();
    assert_forest(&table);

    // Cycles keep being refused whatever the shape.
    assert!(table.reparent(a, Some(c)).is_err());
    assert!(table.reparent(e, Some(d)).is_err());
    assert_forest(&table);

    // Exits remove exactly the expected subtrees.
    table.exit(e).unwrap();
    assert!(!table.contains(e));
    assert!(!table.contains(d));
    assert!(table.contains(a));
    assert!(table.contains(b));
    assert!(table.contains(c));
    assert_forest(&table);
    assert_eq!(*rec.closed.borrow(), vec![Pid(4), Pid(5)]);
}

#[test]
fn names_stay_a_bijection_across_churn() {
    let mut table: ProcessTable<Recorder> = ProcessTable::new();
    let rec = Recorder::default();

    let a = table.insert(rec.clone(), None).unwrap();
    let b = table.insert(rec.clone(), None).unwrap();
    let c = table.insert(rec.clone(), None).unwrap();

    assert_eq!(
        table.claim_name(a, &["db".into()]).unwrap().as_deref(),
        Some("db")
    );
    assert_eq!(
        table
            .claim_name(b, &["db".into(), "cache".into()])
            .unwrap()
            .as_deref(),
        Some("cache")
    );

    // A re-claim moves the name; the old holder keeps nothing.
    assert_eq!(
        table.claim_name(a, &["log".into()]).unwrap().as_deref(),
        Some("log")
    );
    assert_eq!(table.lookup("db"), None);
    assert_eq!(table.lookup("log"), Some(a));

    // The freed name is claimable again, and waiters fire on the claim.
    let NameWait::Pending(mut waiter) = table.wait("db") else {
        panic!("db was released");
    };
    assert_eq!(
        table.claim_name(c, &["db".into()]).unwrap().as_deref(),
        Some("db")
    );
    assert_eq!(waiter.try_recv().unwrap(), Some(c));

    // Exit releases the holder's name for good.
    table.exit(c).unwrap();
    assert_eq!(table.lookup("db"), None);
    assert_eq!(table.find(&["db".into(), "log".into()]), Some(("log".into(), a)));
}

#[test]
fn exit_of_a_mid_node_reattaches_nothing() {
    let mut table: ProcessTable<Recorder> = ProcessTable::new();
    let rec = Recorder::default();

    let a = table.insert(rec.clone(), None).unwrap();
    let b = table.insert(rec.clone(), Some(a)).unwrap();
    let _c = table.insert(rec.clone(), Some(b)).unwrap();

    // Exiting the middle takes the leaf with it; orphans are never
    // reattached upward.
    table.exit(b).unwrap();
    assert_eq!(table.children(Some(a)).unwrap(), Vec::<Pid>::new());
    assert_eq!(table.len(), 1);
    assert_forest(&table);
}
