//! Wait-for graph used for deadlock detection.
//!
//! Nodes are transactions, an edge `a -> b` means `a` is blocked on a lock
//! `b` currently holds or is queued ahead for. Nodes live in a slot arena and
//! edges refer to slot indices, so the graph holds no reference to the
//! transactions themselves.

use crate::error::TxError;
use crate::lock::TxId;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

struct WaitNode {
    tx: TxId,
    waits_for: BTreeSet<usize>,
}

#[derive(Default)]
struct GraphState {
    slots: Vec<Option<WaitNode>>,
    free: Vec<usize>,
    index: HashMap<TxId, usize>,
}

impl GraphState {
    fn slot_of(&mut self, tx: TxId) -> usize {
        if let Some(slot) = self.index.get(&tx) {
            return *slot;
        }
        let node = WaitNode {
            tx,
            waits_for: BTreeSet::new(),
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(tx, slot);
        slot
    }

    fn successors(&self, slot: usize) -> impl Iterator<Item = usize> + '_ {
        self.slots[slot]
            .as_ref()
            .into_iter()
            .flat_map(|node| node.waits_for.iter().copied())
    }

    /// Depth-first search for a path from `start` back to itself.
    fn reaches_itself(&self, start: usize) -> bool {
        let mut visited = vec![false; self.slots.len()];
        let mut stack: Vec<usize> = self.successors(start).collect();
        while let Some(slot) = stack.pop() {
            if slot == start {
                return true;
            }
            if visited[slot] {
                continue;
            }
            visited[slot] = true;
            stack.extend(self.successors(slot));
        }
        false
    }

    fn clear_waits(&mut self, slot: usize) {
        if let Some(node) = self.slots[slot].as_mut() {
            node.waits_for.clear();
        }
    }
}

/// All mutation and cycle searches run under a single mutex.
#[derive(Default)]
pub struct WaitForGraph {
    state: Mutex<GraphState>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `predecessor` waits for every transaction in `successors`
    /// and checks whether that closes a cycle.
    ///
    /// The requester is always the victim: on a cycle its outgoing edges are
    /// dropped and `Deadlock` is returned so its lock wait can unwind.
    pub fn add_and_abort_if_deadlock(
        &self,
        predecessor: TxId,
        successors: &[TxId],
    ) -> Result<(), TxError> {
        let mut state = self.state.lock();
        let from = state.slot_of(predecessor);
        for &successor in successors {
            if successor == predecessor {
                continue;
            }
            let to = state.slot_of(successor);
            if let Some(node) = state.slots[from].as_mut() {
                node.waits_for.insert(to);
            }
        }
        if state.reaches_itself(from) {
            state.clear_waits(from);
            warn!(
                tx = predecessor,
                waits_for = ?successors,
                "deadlock detected, aborting requesting transaction"
            );
            return Err(TxError::Deadlock { tx: predecessor });
        }
        Ok(())
    }

    /// Drops the outgoing edges of a transaction whose wait has ended.
    pub fn clear_waits(&self, tx: TxId) {
        let mut state = self.state.lock();
        if let Some(slot) = state.index.get(&tx).copied() {
            state.clear_waits(slot);
        }
    }

    /// Deletes the node and every edge pointing at it.
    pub fn remove(&self, tx: TxId) {
        let mut state = self.state.lock();
        let Some(slot) = state.index.remove(&tx) else {
            return;
        };
        state.slots[slot] = None;
        for node in state.slots.iter_mut().flatten() {
            node.waits_for.remove(&slot);
        }
        state.free.push(slot);
    }

    pub fn waits_for(&self, tx: TxId) -> Vec<TxId> {
        let state = self.state.lock();
        let Some(slot) = state.index.get(&tx).copied() else {
            return Vec::new();
        };
        let mut out: Vec<TxId> = state
            .successors(slot)
            .filter_map(|s| state.slots[s].as_ref().map(|node| node.tx))
            .collect();
        out.sort_unstable();
        out
    }

    pub fn contains(&self, tx: TxId) -> bool {
        self.state.lock().index.contains_key(&tx)
    }

    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
