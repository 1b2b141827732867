use parking_lot::Mutex;
use polytx::access::{AllocationRouting, PlanNode};
use polytx::catalog::schema::{AllocationDef, DataModel, EntityDef, NamespaceDef};
use polytx::catalog::{Catalog, CatalogSnapshot, MemoryCatalog};
use polytx::config::TxConfig;
use polytx::error::{TxError, TxErrorCode};
use polytx::lock::EntityIdentifier;
use polytx::txn::{
    Adapter, ConstraintCheck, TransactionEvent, TransactionListener, TransactionManager, TxState,
    Xid,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type Journal = Arc<Mutex<Vec<String>>>;

enum Vote {
    Yes,
    No,
    Fail,
}

struct RecordingAdapter {
    id: u64,
    name: String,
    vote: Vote,
    journal: Journal,
}

impl RecordingAdapter {
    fn new(id: u64, vote: Vote, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: format!("store{id}"),
            vote,
            journal: Arc::clone(journal),
        })
    }

    fn record(&self, phase: &str) {
        self.journal.lock().push(format!("{phase}:{}", self.id));
    }
}

impl Adapter for RecordingAdapter {
    fn id(&self) -> u64 {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn prepare(&self, _xid: &Xid) -> Result<bool, TxError> {
        self.record("prepare");
        match self.vote {
            Vote::Yes => Ok(true),
            Vote::No => Ok(false),
            Vote::Fail => Err(TxError::Adapter {
                adapter: self.name.clone(),
                message: "disk full".into(),
            }),
        }
    }
    fn commit(&self, _xid: &Xid) -> Result<(), TxError> {
        self.record("commit");
        Ok(())
    }
    fn rollback(&self, _xid: &Xid) -> Result<(), TxError> {
        self.record("rollback");
        Ok(())
    }
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<TransactionEvent>>,
}

impl TransactionListener for EventLog {
    fn on_event(&self, event: &TransactionEvent) {
        self.events.lock().push(event.clone());
    }
}

struct Dangling;

impl ConstraintCheck for Dangling {
    fn name(&self) -> &str {
        "fk_orders_customer"
    }
    fn check(&self, _xid: &Xid) -> Result<(), String> {
        Err("order 7 references missing customer 3".into())
    }
}

/// `customers` (10) lives on adapter 1, `orders` (20) on adapter 2.
fn snapshot() -> CatalogSnapshot {
    let mut snapshot = CatalogSnapshot::new();
    snapshot.add_namespace(NamespaceDef {
        id: 1,
        name: "shop".into(),
        model: DataModel::Relational,
    });
    snapshot.add_entity(EntityDef::new(10, 1, "customers", DataModel::Relational));
    snapshot.add_entity(EntityDef::new(20, 1, "orders", DataModel::Relational));
    for (allocation, entity, adapter) in [(100, 10, 1), (200, 20, 2)] {
        snapshot
            .add_allocation(AllocationDef {
                id: allocation,
                entity_id: entity,
                adapter_id: adapter,
            })
            .expect("allocation");
    }
    snapshot
}

struct Fixture {
    mgr: Arc<TransactionManager>,
    catalog: Arc<MemoryCatalog>,
    journal: Journal,
    events: Arc<EventLog>,
}

fn fixture(config: TxConfig, second_vote: Vote) -> Fixture {
    let catalog = Arc::new(MemoryCatalog::new(snapshot()));
    let shared: Arc<dyn Catalog> = catalog.clone();
    let mgr = TransactionManager::new(config, shared).expect("manager");
    let journal: Journal = Arc::default();
    mgr.register_adapter(RecordingAdapter::new(1, Vote::Yes, &journal));
    mgr.register_adapter(RecordingAdapter::new(2, second_vote, &journal));
    let events = Arc::new(EventLog::default());
    mgr.add_listener(events.clone());
    Fixture {
        mgr: Arc::new(mgr),
        catalog,
        journal,
        events,
    }
}

/// Writes both tables in one statement.
fn write_both() -> PlanNode {
    PlanNode::operator(vec![
        PlanNode::modify(10, PlanNode::values()),
        PlanNode::modify(20, PlanNode::values()),
    ])
}

fn journal(f: &Fixture) -> Vec<String> {
    f.journal.lock().clone()
}

#[test]
fn all_adapters_prepare_before_any_commit() {
    let f = fixture(TxConfig::strict(), Vote::Yes);
    let tx = f.mgr.start_transaction(1, 1, false, "jdbc");
    let mut stmt = tx.create_statement().expect("statement");
    stmt.acquire_locks(&write_both(), &AllocationRouting::new())
        .expect("locks");
    assert_eq!(tx.involved_adapters(), vec![1, 2]);

    tx.commit().expect("commit");
    assert_eq!(tx.state(), TxState::Committed);
    assert_eq!(
        journal(&f),
        vec!["prepare:1", "prepare:2", "commit:1", "commit:2"]
    );
    // no catalog lock held, so the catalog is left alone
    assert_eq!(f.catalog.commit_count(), 0);

    let events = f.events.events.lock().clone();
    assert_eq!(events.len(), 1);
    match &events[0] {
        TransactionEvent::Committed {
            xid,
            adapters,
            entities,
            ..
        } => {
            assert_eq!(xid, tx.xid());
            assert_eq!(adapters, &vec![1, 2]);
            assert!(entities.contains(&EntityIdentifier::entity(20, 200)));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn prepare_refusal_rolls_back_every_participant() {
    let f = fixture(TxConfig::strict(), Vote::No);
    let tx = f.mgr.start_transaction(1, 1, false, "jdbc");
    let mut stmt = tx.create_statement().expect("statement");
    stmt.acquire_locks(&write_both(), &AllocationRouting::new())
        .expect("locks");

    let err = tx.commit().expect_err("refused");
    assert!(matches!(err, TxError::AdapterPrepareFailure { ref adapter } if adapter == "store2"));
    assert_eq!(tx.state(), TxState::RolledBack);
    let entries = journal(&f);
    assert!(entries.iter().all(|e| !e.starts_with("commit")));
    assert!(entries.contains(&"rollback:1".to_string()));
    assert!(entries.contains(&"rollback:2".to_string()));
    assert_eq!(f.catalog.commit_count(), 0);
    assert_eq!(f.catalog.rollback_count(), 0);

    let cc = f.mgr.concurrency_control();
    assert!(cc.held_by(tx.id()).is_empty());
    assert_eq!(cc.lock_count(), 0);
    assert!(!f.mgr.is_active(tx.xid()));

    let events = f.events.events.lock().clone();
    assert!(matches!(
        events.as_slice(),
        [TransactionEvent::RolledBack {
            reason: Some(TxErrorCode::AdapterPrepareFailure),
            ..
        }]
    ));
}

#[test]
fn prepare_error_counts_as_refusal() {
    let f = fixture(TxConfig::strict(), Vote::Fail);
    let tx = f.mgr.start_transaction(1, 1, false, "jdbc");
    let mut stmt = tx.create_statement().expect("statement");
    stmt.acquire_locks(&write_both(), &AllocationRouting::new())
        .expect("locks");

    let err = tx.commit().expect_err("prepare failed");
    assert!(matches!(err, TxError::AdapterPrepareFailure { ref adapter } if adapter == "store2"));
    assert_eq!(err.code(), TxErrorCode::AdapterPrepareFailure);
    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(
        journal(&f),
        vec!["prepare:1", "prepare:2", "rollback:1", "rollback:2"]
    );
    assert!(f.mgr.concurrency_control().held_by(tx.id()).is_empty());

    let events = f.events.events.lock().clone();
    assert!(matches!(
        events.as_slice(),
        [TransactionEvent::RolledBack {
            reason: Some(TxErrorCode::AdapterPrepareFailure),
            ..
        }]
    ));
}

#[test]
fn commit_without_prepare_phase_when_disabled() {
    let f = fixture(TxConfig::strict().with_two_pc_mode(false), Vote::No);
    let tx = f.mgr.start_transaction(1, 1, false, "jdbc");
    let mut stmt = tx.create_statement().expect("statement");
    stmt.acquire_locks(&write_both(), &AllocationRouting::new())
        .expect("locks");
    tx.commit().expect("commit");
    assert_eq!(journal(&f), vec!["commit:1", "commit:2"]);
}

#[test]
fn deferred_constraint_violation_aborts_commit() {
    let f = fixture(TxConfig::strict(), Vote::Yes);
    let tx = f.mgr.start_transaction(1, 1, false, "jdbc");
    let mut stmt = tx.create_statement().expect("statement");
    stmt.acquire_locks(
        &PlanNode::modify(20, PlanNode::values()).with_constraint_references(vec![10]),
        &AllocationRouting::new(),
    )
    .expect("locks");
    // The referenced table is read-locked on the writer's behalf.
    assert_eq!(
        f.mgr
            .concurrency_control()
            .mode_of(tx.id(), &EntityIdentifier::entity(10, 100)),
        Some(polytx::lock::LockMode::Shared)
    );
    tx.defer_constraint(Arc::new(Dangling));

    let err = tx.commit().expect_err("violation");
    match err {
        TxError::ConstraintViolation {
            constraint,
            message,
        } => {
            assert_eq!(constraint, "fk_orders_customer");
            assert!(message.contains("customer 3"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    let entries = journal(&f);
    assert!(entries.iter().all(|e| !e.starts_with("commit")));
    assert_eq!(tx.state(), TxState::RolledBack);
}

#[test]
fn staged_catalog_changes_follow_the_outcome() {
    let f = fixture(TxConfig::strict(), Vote::Yes);
    let ddl = f.mgr.start_transaction(1, 1, false, "ddl");
    ddl.lock_catalog_exclusive().expect("catalog lock");
    f.catalog
        .stage(|snapshot| {
            snapshot.add_entity(EntityDef::new(30, 1, "invoices", DataModel::Relational));
            Ok(())
        })
        .expect("stage");
    ddl.rollback().expect("rollback");
    assert!(f.catalog.snapshot().entity(30).is_none());

    let ddl = f.mgr.start_transaction(1, 1, false, "ddl");
    ddl.lock_catalog_exclusive().expect("catalog lock");
    f.catalog
        .stage(|snapshot| {
            snapshot.add_entity(EntityDef::new(30, 1, "invoices", DataModel::Relational));
            Ok(())
        })
        .expect("stage");
    ddl.commit().expect("commit");
    assert!(f.catalog.snapshot().entity(30).is_some());
}

fn stage_invoices(catalog: &MemoryCatalog) {
    catalog
        .stage(|snapshot| {
            snapshot.add_entity(EntityDef::new(30, 1, "invoices", DataModel::Relational));
            Ok(())
        })
        .expect("stage");
}

#[test]
fn unrelated_rollback_keeps_staged_catalog_changes() {
    let f = fixture(TxConfig::strict(), Vote::Yes);
    let ddl = f.mgr.start_transaction(1, 1, false, "ddl");
    ddl.lock_catalog_exclusive().expect("catalog lock");
    stage_invoices(&f.catalog);

    let other = f.mgr.start_transaction(2, 1, false, "jdbc");
    other.rollback().expect("rollback");
    assert!(f.catalog.has_pending());
    assert_eq!(f.catalog.rollback_count(), 0);

    ddl.commit().expect("commit");
    assert!(f.catalog.snapshot().entity(30).is_some());
}

#[test]
fn unrelated_commit_does_not_publish_staged_catalog_changes() {
    let f = fixture(TxConfig::strict(), Vote::Yes);
    let ddl = f.mgr.start_transaction(1, 1, false, "ddl");
    ddl.lock_catalog_exclusive().expect("catalog lock");
    stage_invoices(&f.catalog);

    let other = f.mgr.start_transaction(2, 1, false, "jdbc");
    other.commit().expect("commit");
    assert!(f.catalog.snapshot().entity(30).is_none());
    assert_eq!(f.catalog.commit_count(), 0);

    ddl.rollback().expect("rollback");
    assert!(!f.catalog.has_pending());
    assert!(f.catalog.snapshot().entity(30).is_none());
}

#[test]
fn commit_releases_locks_to_waiters() {
    let f = fixture(TxConfig::strict(), Vote::Yes);
    let holder = f.mgr.start_transaction(1, 1, false, "holder");
    let mut stmt = holder.create_statement().expect("statement");
    stmt.acquire_locks(
        &PlanNode::modify(10, PlanNode::values()),
        &AllocationRouting::new(),
    )
    .expect("holder lock");

    let waiter = {
        let mgr = Arc::clone(&f.mgr);
        thread::spawn(move || {
            let tx = mgr.start_transaction(2, 1, false, "waiter");
            let mut stmt = tx.create_statement().expect("statement");
            stmt.acquire_locks(&PlanNode::scan(10), &AllocationRouting::new())
                .expect("waiter lock");
            tx.commit().expect("waiter commit");
        })
    };
    thread::sleep(Duration::from_millis(20));
    holder.commit().expect("holder commit");
    waiter.join().expect("waiter thread");
    assert_eq!(f.mgr.metrics().committed, 2);
    assert_eq!(f.mgr.concurrency_control().lock_count(), 0);
}

#[test]
fn termination_is_idempotent() {
    let f = fixture(TxConfig::strict(), Vote::Yes);
    let tx = f.mgr.start_transaction(1, 1, false, "jdbc");
    let mut stmt = tx.create_statement().expect("statement");
    stmt.acquire_locks(&write_both(), &AllocationRouting::new())
        .expect("locks");
    tx.commit().expect("commit");
    tx.commit().expect("second commit");
    tx.rollback().expect("rollback after commit");
    assert_eq!(tx.state(), TxState::Committed);
    assert_eq!(
        journal(&f),
        vec!["prepare:1", "prepare:2", "commit:1", "commit:2"]
    );
    assert_eq!(f.events.events.lock().len(), 1);
    let metrics = f.mgr.metrics();
    assert_eq!(metrics.committed, 1);
    assert_eq!(metrics.rolled_back, 0);
}
