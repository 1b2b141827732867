use crate::catalog::Catalog;
use crate::catalog::schema::{AdapterId, NamespaceId};
use crate::config::TxConfig;
use crate::error::TxError;
use crate::lock::{ConcurrencyControl, TxId};
use crate::txn::hooks::{Adapter, TransactionEvent, TransactionListener};
use crate::txn::transaction::Transaction;
use crate::txn::xid::Xid;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerMetrics {
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub deadlocks: u64,
    pub lock_timeouts: u64,
    pub active: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) started: AtomicU64,
    pub(crate) committed: AtomicU64,
    pub(crate) rolled_back: AtomicU64,
    pub(crate) deadlocks: AtomicU64,
    pub(crate) lock_timeouts: AtomicU64,
}

/// State shared between the manager and every transaction it started.
pub(crate) struct ManagerShared {
    pub(crate) config: TxConfig,
    pub(crate) cc: Arc<ConcurrencyControl>,
    pub(crate) catalog: Arc<dyn Catalog>,
    pub(crate) adapters: RwLock<HashMap<AdapterId, Arc<dyn Adapter>>>,
    pub(crate) active: RwLock<HashMap<Xid, Arc<Transaction>>>,
    pub(crate) listeners: Mutex<Vec<Arc<dyn TransactionListener>>>,
    pub(crate) counters: Counters,
    next_tx_id: AtomicU64,
}

impl ManagerShared {
    pub(crate) fn adapter(&self, id: AdapterId) -> Option<Arc<dyn Adapter>> {
        self.adapters.read().get(&id).cloned()
    }

    pub(crate) fn notify(&self, event: &TransactionEvent) {
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }))
            .is_err()
            {
                warn!("transaction listener panicked while handling event");
            }
        }
    }
}

/// Creates transactions and keeps the table of the ones still running.
///
/// Each transaction holds a handle to the manager's shared state, and the
/// active table holds the transaction, until it terminates.
pub struct TransactionManager {
    shared: Arc<ManagerShared>,
}

impl TransactionManager {
    pub fn new(config: TxConfig, catalog: Arc<dyn Catalog>) -> Result<Self, TxError> {
        let cc = Arc::new(ConcurrencyControl::from_config(&config));
        Self::with_concurrency_control(config, catalog, cc)
    }

    pub fn with_concurrency_control(
        config: TxConfig,
        catalog: Arc<dyn Catalog>,
        cc: Arc<ConcurrencyControl>,
    ) -> Result<Self, TxError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(ManagerShared {
                config,
                cc,
                catalog,
                adapters: RwLock::new(HashMap::new()),
                active: RwLock::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                counters: Counters::default(),
                next_tx_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &TxConfig {
        &self.shared.config
    }

    pub fn concurrency_control(&self) -> &Arc<ConcurrencyControl> {
        &self.shared.cc
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.shared.catalog
    }

    /// Makes an adapter resolvable for statements touching its allocations.
    pub fn register_adapter(&self, adapter: Arc<dyn Adapter>) {
        self.shared.adapters.write().insert(adapter.id(), adapter);
    }

    pub fn adapter(&self, id: AdapterId) -> Option<Arc<dyn Adapter>> {
        self.shared.adapter(id)
    }

    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.shared.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TransactionListener>) {
        let mut listeners = self.shared.listeners.lock();
        listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn start_transaction(
        &self,
        user_id: u64,
        namespace: NamespaceId,
        analyze: bool,
        origin: &str,
    ) -> Arc<Transaction> {
        self.start_transaction_on_connection(0, user_id, namespace, analyze, origin)
    }

    pub fn start_transaction_on_connection(
        &self,
        connection_id: u64,
        user_id: u64,
        namespace: NamespaceId,
        analyze: bool,
        origin: &str,
    ) -> Arc<Transaction> {
        let id: TxId = self.shared.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let xid = Xid::new(self.shared.config.node_id.clone(), user_id, connection_id, id);
        let tx = Arc::new(Transaction::new(
            Arc::clone(&self.shared),
            id,
            xid.clone(),
            user_id,
            namespace,
            analyze,
            origin.to_string(),
        ));
        self.shared.active.write().insert(xid.clone(), Arc::clone(&tx));
        self.shared.counters.started.fetch_add(1, Ordering::Relaxed);
        debug!(tx = id, %xid, origin, "transaction started");
        tx
    }

    pub fn transaction(&self, xid: &Xid) -> Option<Arc<Transaction>> {
        self.shared.active.read().get(xid).cloned()
    }

    pub fn active_transactions(&self) -> Vec<Arc<Transaction>> {
        let mut out: Vec<_> = self.shared.active.read().values().cloned().collect();
        out.sort_by_key(|tx| tx.id());
        out
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.read().len()
    }

    pub fn is_active(&self, xid: &Xid) -> bool {
        self.shared.active.read().contains_key(xid)
    }

    /// Rolls back a live transaction by xid, for callers that lost its
    /// handle. Returns `false` when `xid` is not active. Must not race a
    /// statement still running inside that transaction.
    pub fn abort(&self, xid: &Xid) -> Result<bool, TxError> {
        let Some(tx) = self.transaction(xid) else {
            return Ok(false);
        };
        warn!(tx = tx.id(), %xid, "aborting abandoned transaction");
        tx.rollback()?;
        Ok(true)
    }

    pub fn metrics(&self) -> ManagerMetrics {
        let counters = &self.shared.counters;
        ManagerMetrics {
            started: counters.started.load(Ordering::Relaxed),
            committed: counters.committed.load(Ordering::Relaxed),
            rolled_back: counters.rolled_back.load(Ordering::Relaxed),
            deadlocks: counters.deadlocks.load(Ordering::Relaxed),
            lock_timeouts: counters.lock_timeouts.load(Ordering::Relaxed),
            active: self.active_count(),
        }
    }
}
