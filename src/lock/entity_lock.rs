use crate::error::TxError;
use crate::lock::wait_graph::WaitForGraph;
use crate::lock::{EntityIdentifier, TxId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// `Shared < Exclusive`, so `held >= requested` means the request is covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Shared,
    Exclusive,
}

/// Outcome of a successful lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Acquired,
    Upgraded,
    AlreadyHeld,
}

impl Grant {
    /// True when the caller did not own the lock before the request.
    pub fn is_new(self) -> bool {
        matches!(self, Grant::Acquired)
    }
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    tx: TxId,
    upgrade: bool,
}

#[derive(Default)]
struct LockInner {
    mode: Option<LockMode>,
    owners: BTreeSet<TxId>,
    queue: VecDeque<Waiter>,
}

impl LockInner {
    fn held_mode(&self, tx: TxId) -> Option<LockMode> {
        if self.owners.contains(&tx) {
            self.mode
        } else {
            None
        }
    }

    fn state(&self) -> LockState {
        match self.mode {
            None => LockState::Unlocked,
            Some(LockMode::Shared) => LockState::Shared,
            Some(LockMode::Exclusive) => LockState::Exclusive,
        }
    }

    fn compatible(&self, tx: TxId, mode: LockMode, upgrade: bool) -> bool {
        if upgrade {
            return self.owners.len() == 1 && self.owners.contains(&tx);
        }
        match mode {
            LockMode::Shared => self.mode != Some(LockMode::Exclusive),
            LockMode::Exclusive => self.owners.is_empty(),
        }
    }

    fn is_next(&self, tx: TxId) -> bool {
        self.queue.front().is_some_and(|w| w.tx == tx)
    }

    fn dequeue(&mut self, tx: TxId) {
        self.queue.retain(|w| w.tx != tx);
    }

    fn grant(&mut self, tx: TxId, mode: LockMode) {
        self.owners.insert(tx);
        self.mode = Some(match (self.mode, mode) {
            (Some(LockMode::Exclusive), _) | (_, LockMode::Exclusive) => LockMode::Exclusive,
            _ => LockMode::Shared,
        });
        debug_assert!(
            self.mode != Some(LockMode::Exclusive) || self.owners.len() == 1,
            "exclusive lock with {} owners",
            self.owners.len()
        );
    }

    /// Everyone the waiter has to get past: other owners, plus (for plain
    /// requests) every waiter queued ahead of it.
    fn blockers(&self, tx: TxId, upgrade: bool) -> Vec<TxId> {
        let mut out: BTreeSet<TxId> = self.owners.iter().copied().filter(|o| *o != tx).collect();
        if !upgrade {
            out.extend(self.queue.iter().take_while(|w| w.tx != tx).map(|w| w.tx));
        }
        out.remove(&tx);
        out.into_iter().collect()
    }
}

/// Shared/exclusive lock on one entity.
///
/// A monitor: one mutex guards owners and the FIFO wait queue, one condition
/// variable wakes waiters to re-check. Waiters report whom they wait for to the
/// wait-for graph and give up with `Deadlock` when that closes a cycle, or
/// with `LockTimeout` once `timeout` elapses.
pub struct Lock {
    entity: EntityIdentifier,
    inner: Mutex<LockInner>,
    cv: Condvar,
}

impl Lock {
    pub fn new(entity: EntityIdentifier) -> Self {
        Self {
            entity,
            inner: Mutex::new(LockInner::default()),
            cv: Condvar::new(),
        }
    }

    pub fn entity(&self) -> EntityIdentifier {
        self.entity
    }

    pub fn acquire(
        &self,
        tx: TxId,
        mode: LockMode,
        waits: &WaitForGraph,
        timeout: Duration,
    ) -> Result<Grant, TxError> {
        let mut inner = self.inner.lock();
        if let Some(held) = inner.held_mode(tx) {
            if held >= mode {
                return Ok(Grant::AlreadyHeld);
            }
            drop(inner);
            return self.upgrade_to_exclusive(tx, waits, timeout);
        }
        if inner.queue.is_empty() && inner.compatible(tx, mode, false) {
            inner.grant(tx, mode);
            debug!(tx, entity = %self.entity, ?mode, "lock granted");
            return Ok(Grant::Acquired);
        }
        inner.queue.push_back(Waiter { tx, upgrade: false });
        self.wait_for_grant(inner, tx, mode, false, waits, timeout)
    }

    /// Turns a shared hold into an exclusive one once every other owner has
    /// released. Upgraders go to the front of the queue so new readers cannot
    /// starve them.
    pub fn upgrade_to_exclusive(
        &self,
        tx: TxId,
        waits: &WaitForGraph,
        timeout: Duration,
    ) -> Result<Grant, TxError> {
        let mut inner = self.inner.lock();
        match inner.held_mode(tx) {
            Some(LockMode::Exclusive) => return Ok(Grant::AlreadyHeld),
            Some(LockMode::Shared) => {}
            None => {
                error!(tx, entity = %self.entity, "upgrade requested without a shared hold");
                return Err(TxError::LockInvariantViolation(format!(
                    "transaction {tx} upgraded {} without holding it",
                    self.entity
                )));
            }
        }
        if inner.compatible(tx, LockMode::Exclusive, true) {
            inner.grant(tx, LockMode::Exclusive);
            debug!(tx, entity = %self.entity, "lock upgraded");
            return Ok(Grant::Upgraded);
        }
        inner.queue.push_front(Waiter { tx, upgrade: true });
        self.wait_for_grant(inner, tx, LockMode::Exclusive, true, waits, timeout)
    }

    fn wait_for_grant(
        &self,
        mut inner: MutexGuard<'_, LockInner>,
        tx: TxId,
        mode: LockMode,
        upgrade: bool,
        waits: &WaitForGraph,
        timeout: Duration,
    ) -> Result<Grant, TxError> {
        let started = Instant::now();
        // None when the timeout overflows the clock: wait without a deadline.
        let deadline = started.checked_add(timeout);
        let mut reported: Option<Vec<TxId>> = None;
        loop {
            if inner.is_next(tx) && inner.compatible(tx, mode, upgrade) {
                inner.dequeue(tx);
                inner.grant(tx, mode);
                drop(inner);
                waits.clear_waits(tx);
                // the next queued reader may be grantable as well
                self.cv.notify_all();
                debug!(
                    tx,
                    entity = %self.entity,
                    ?mode,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "lock granted after wait"
                );
                return Ok(if upgrade {
                    Grant::Upgraded
                } else {
                    Grant::Acquired
                });
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                inner.dequeue(tx);
                drop(inner);
                waits.clear_waits(tx);
                self.cv.notify_all();
                return Err(TxError::LockTimeout {
                    tx,
                    entity: self.entity,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            let blockers = inner.blockers(tx, upgrade);
            if reported.as_ref() != Some(&blockers) {
                waits.clear_waits(tx);
                if let Err(err) = waits.add_and_abort_if_deadlock(tx, &blockers) {
                    inner.dequeue(tx);
                    drop(inner);
                    self.cv.notify_all();
                    return Err(err);
                }
                debug!(tx, entity = %self.entity, waits_for = ?blockers, "waiting for lock");
                reported = Some(blockers);
            }

            match deadline {
                Some(deadline) => {
                    self.cv.wait_until(&mut inner, deadline);
                }
                None => self.cv.wait(&mut inner),
            }
        }
    }

    pub fn release(&self, tx: TxId) -> Result<(), TxError> {
        let mut inner = self.inner.lock();
        if !inner.owners.remove(&tx) {
            error!(tx, entity = %self.entity, "release of a lock the transaction does not own");
            return Err(TxError::LockInvariantViolation(format!(
                "transaction {tx} released {} without owning it",
                self.entity
            )));
        }
        if inner.owners.is_empty() {
            inner.mode = None;
        }
        drop(inner);
        self.cv.notify_all();
        Ok(())
    }

    pub fn state(&self) -> LockState {
        self.inner.lock().state()
    }

    pub fn mode_of(&self, tx: TxId) -> Option<LockMode> {
        self.inner.lock().held_mode(tx)
    }

    pub fn owners(&self) -> Vec<TxId> {
        self.inner.lock().owners.iter().copied().collect()
    }

    pub fn waiting(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// No owners and nobody queued.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.owners.is_empty() && inner.queue.is_empty()
    }
}
