use crate::access::mode::AccessMode;
use crate::access::plan::{NodeKind, PlanNode};
use crate::catalog::CatalogSnapshot;
use crate::catalog::schema::{AdapterId, AllocationId, EntityId};
use crate::error::TxError;
use crate::lock::{EntityIdentifier, LockMode};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Allocations the router already picked for an entity. Entities missing here
/// (or mapped to an empty list) are locked on every allocation the catalog
/// knows for them.
pub type AllocationRouting = HashMap<EntityId, Vec<AllocationId>>;

/// Which entities a plan touches and how.
///
/// Built once per statement and immutable afterwards. Owns all of its data,
/// so the plan tree can be cached and reused independently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityAccessMap {
    accesses: BTreeMap<EntityIdentifier, AccessMode>,
    lock_modes: BTreeMap<EntityIdentifier, LockMode>,
    adapters: BTreeSet<AdapterId>,
}

#[derive(Default)]
struct Builder {
    accesses: BTreeMap<EntityIdentifier, AccessMode>,
    adapters: BTreeSet<AdapterId>,
    /// Entities referenced by the constraints of written entities.
    references: BTreeSet<EntityId>,
}

impl Builder {
    fn merge(&mut self, id: EntityIdentifier, mode: AccessMode) {
        let entry = self.accesses.entry(id).or_default();
        *entry = entry.merge(mode);
    }

    fn visit(
        &mut self,
        node: &PlanNode,
        routing: &AllocationRouting,
        snapshot: &CatalogSnapshot,
    ) -> Result<(), TxError> {
        let mode = if node.is_data_modifying() {
            AccessMode::Write
        } else {
            AccessMode::Read
        };
        match &node.kind {
            NodeKind::Operator => {}
            NodeKind::Relational(binding) => {
                for id in self.relational_scope(binding.target, routing, snapshot)? {
                    self.merge(id, mode);
                }
            }
            NodeKind::Document(binding) => {
                if snapshot.entity(binding.target).is_none() {
                    return Err(TxError::UnknownEntity(binding.target));
                }
                self.merge(EntityIdentifier::entity(binding.target, 0), mode);
                self.adapters
                    .extend(snapshot.adapters_of_entity(binding.target));
            }
            NodeKind::Graph(binding) => {
                self.merge(EntityIdentifier::namespace(binding.target), mode);
                self.adapters
                    .extend(snapshot.adapters_of_namespace(binding.target));
            }
        }
        if node.is_data_modifying() && !matches!(node.kind, NodeKind::Graph(_)) {
            if let Some(entity) = node.bound_entity() {
                let declared = snapshot
                    .entity(entity)
                    .map(|def| def.referenced_entities())
                    .unwrap_or_default();
                self.references.extend(declared);
                self.references
                    .extend(node.constraint_references().iter().copied());
            }
        }
        Ok(())
    }

    fn relational_scope(
        &mut self,
        entity: EntityId,
        routing: &AllocationRouting,
        snapshot: &CatalogSnapshot,
    ) -> Result<Vec<EntityIdentifier>, TxError> {
        let allocations = match routing.get(&entity) {
            Some(routed) if !routed.is_empty() => {
                if snapshot.entity(entity).is_none() {
                    return Err(TxError::UnknownEntity(entity));
                }
                // routed partitions must be live allocations of this entity
                if let Some(stray) = routed.iter().find(|a| {
                    snapshot
                        .allocation(**a)
                        .is_none_or(|def| def.entity_id != entity)
                }) {
                    return Err(TxError::UnknownAllocation {
                        entity,
                        allocation: *stray,
                    });
                }
                routed.clone()
            }
            _ => snapshot.allocations_of(entity)?,
        };
        if allocations.is_empty() {
            return Ok(vec![EntityIdentifier::entity(entity, 0)]);
        }
        self.adapters
            .extend(allocations.iter().filter_map(|a| snapshot.adapter_of(*a)));
        Ok(allocations
            .into_iter()
            .map(|allocation| EntityIdentifier::entity(entity, allocation))
            .collect())
    }

    /// Adds read access on every entity referenced by a written one, without
    /// touching identifiers already present. Runs after the traversal so the
    /// result does not depend on visiting order.
    fn propagate_references(&mut self, snapshot: &CatalogSnapshot) -> Result<(), TxError> {
        let references = std::mem::take(&mut self.references);
        let no_routing = AllocationRouting::new();
        for entity in references {
            for id in self.relational_scope(entity, &no_routing, snapshot)? {
                self.accesses.entry(id).or_insert(AccessMode::Read);
            }
        }
        Ok(())
    }
}

impl EntityAccessMap {
    pub fn build(
        root: &PlanNode,
        routing: &AllocationRouting,
        snapshot: &CatalogSnapshot,
        foreign_key_enforcement: bool,
    ) -> Result<Self, TxError> {
        let mut builder = Builder::default();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            builder.visit(node, routing, snapshot)?;
            stack.extend(node.children().iter().rev());
        }
        if foreign_key_enforcement {
            builder.propagate_references(snapshot)?;
        }

        let lock_modes = builder
            .accesses
            .iter()
            .filter_map(|(id, mode)| mode.lock_mode().map(|lock| (*id, lock)))
            .collect();
        Ok(Self {
            accesses: builder.accesses,
            lock_modes,
            adapters: builder.adapters,
        })
    }

    pub fn access(&self, id: &EntityIdentifier) -> AccessMode {
        self.accesses.get(id).copied().unwrap_or_default()
    }

    pub fn accesses(&self) -> &BTreeMap<EntityIdentifier, AccessMode> {
        &self.accesses
    }

    /// Lock mode per identifier, `NoAccess` entries left out. Ordered by
    /// identifier, which is also the order locks are requested in.
    pub fn lock_modes(&self) -> &BTreeMap<EntityIdentifier, LockMode> {
        &self.lock_modes
    }

    /// Adapters hosting any of the accessed allocations.
    pub fn adapters(&self) -> &BTreeSet<AdapterId> {
        &self.adapters
    }

    /// All access modes merged into one.
    pub fn aggregate(&self) -> AccessMode {
        self.accesses
            .values()
            .fold(AccessMode::NoAccess, |acc, mode| acc.merge(*mode))
    }

    pub fn len(&self) -> usize {
        self.accesses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{AllocationRouting, EntityAccessMap};
    use crate::access::mode::AccessMode;
    use crate::access::plan::PlanNode;
    use crate::catalog::CatalogSnapshot;
    use crate::catalog::schema::{AllocationDef, DataModel, EntityDef, ForeignKey, NamespaceDef};
    use crate::error::TxError;
    use crate::lock::{EntityIdentifier, LockMode, NamespaceLevel};

    const ORDERS: u64 = 10;
    const CUSTOMERS: u64 = 11;
    const EVENTS: u64 = 20;
    const SOCIAL: u64 = 3;

    fn snapshot() -> CatalogSnapshot {
        let mut s = CatalogSnapshot::new();
        s.add_namespace(NamespaceDef {
            id: 1,
            name: "public".into(),
            model: DataModel::Relational,
        });
        s.add_namespace(NamespaceDef {
            id: 2,
            name: "docs".into(),
            model: DataModel::Document,
        });
        s.add_namespace(NamespaceDef {
            id: SOCIAL,
            name: "social".into(),
            model: DataModel::Graph,
        });
        s.add_entity(
            EntityDef::new(ORDERS, 1, "orders", DataModel::Relational).with_foreign_key(
                ForeignKey {
                    name: "fk_orders_customer".into(),
                    columns: vec!["customer_id".into()],
                    references_entity: CUSTOMERS,
                    references_columns: vec!["id".into()],
                },
            ),
        );
        s.add_entity(EntityDef::new(CUSTOMERS, 1, "customers", DataModel::Relational));
        s.add_entity(EntityDef::new(EVENTS, 2, "events", DataModel::Document));
        for (id, entity, adapter) in [(100, ORDERS, 1), (101, ORDERS, 2), (110, CUSTOMERS, 1)] {
            s.add_allocation(AllocationDef {
                id,
                entity_id: entity,
                adapter_id: adapter,
            })
            .expect("allocation");
        }
        s.add_allocation(AllocationDef {
            id: 200,
            entity_id: EVENTS,
            adapter_id: 3,
        })
        .expect("allocation");
        s
    }

    fn build(plan: &PlanNode, fk: bool) -> EntityAccessMap {
        EntityAccessMap::build(plan, &AllocationRouting::new(), &snapshot(), fk).expect("build")
    }

    #[test]
    fn scan_reads_every_allocation() {
        let map = build(&PlanNode::scan(ORDERS), false);
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.access(&EntityIdentifier::entity(ORDERS, 100)),
            AccessMode::Read
        );
        assert_eq!(
            map.lock_modes().get(&EntityIdentifier::entity(ORDERS, 101)),
            Some(&LockMode::Shared)
        );
        assert_eq!(map.adapters().iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(map.aggregate(), AccessMode::Read);
    }

    #[test]
    fn explicit_routing_narrows_allocations() {
        let mut routing = AllocationRouting::new();
        routing.insert(ORDERS, vec![101]);
        let plan = PlanNode::modify(ORDERS, PlanNode::values());
        let map = EntityAccessMap::build(&plan, &routing, &snapshot(), false).expect("build");
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.access(&EntityIdentifier::entity(ORDERS, 101)),
            AccessMode::Write
        );
        assert_eq!(map.adapters().iter().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn routing_rejects_allocations_outside_the_entity() {
        let plan = PlanNode::modify(ORDERS, PlanNode::values());
        for stray in [999, 110] {
            let routing: AllocationRouting = [(ORDERS, vec![100, stray])].into_iter().collect();
            let err = EntityAccessMap::build(&plan, &routing, &snapshot(), false)
                .expect_err("stray allocation");
            assert!(matches!(
                err,
                TxError::UnknownAllocation { entity: ORDERS, allocation } if allocation == stray
            ));
        }

        let routing: AllocationRouting = [(77, vec![100])].into_iter().collect();
        let err = EntityAccessMap::build(&PlanNode::scan(77), &routing, &snapshot(), false)
            .expect_err("unknown entity");
        assert!(matches!(err, TxError::UnknownEntity(77)));
    }

    #[test]
    fn read_and_write_in_different_subtrees_merge_in_any_order() {
        let read_first = PlanNode::operator(vec![
            PlanNode::scan(ORDERS),
            PlanNode::modify(ORDERS, PlanNode::values()),
        ]);
        let write_first = PlanNode::operator(vec![
            PlanNode::modify(ORDERS, PlanNode::values()),
            PlanNode::scan(ORDERS),
        ]);
        let a = build(&read_first, false);
        let b = build(&write_first, false);
        assert_eq!(a, b);
        assert_eq!(
            a.access(&EntityIdentifier::entity(ORDERS, 100)),
            AccessMode::ReadWrite
        );
        assert_eq!(
            a.lock_modes().get(&EntityIdentifier::entity(ORDERS, 100)),
            Some(&LockMode::Exclusive)
        );
    }

    #[test]
    fn foreign_keys_add_reads_only_when_enforced() {
        let plan = PlanNode::modify(ORDERS, PlanNode::values());
        let relaxed = build(&plan, false);
        assert_eq!(
            relaxed.access(&EntityIdentifier::entity(CUSTOMERS, 110)),
            AccessMode::NoAccess
        );

        let enforced = build(&plan, true);
        assert_eq!(
            enforced.access(&EntityIdentifier::entity(ORDERS, 100)),
            AccessMode::Write
        );
        assert_eq!(
            enforced.access(&EntityIdentifier::entity(CUSTOMERS, 110)),
            AccessMode::Read
        );
    }

    #[test]
    fn foreign_key_reads_never_downgrade() {
        let plan = PlanNode::operator(vec![
            PlanNode::modify(ORDERS, PlanNode::values()),
            PlanNode::modify(CUSTOMERS, PlanNode::values()),
        ]);
        let map = build(&plan, true);
        assert_eq!(
            map.access(&EntityIdentifier::entity(CUSTOMERS, 110)),
            AccessMode::Write
        );
    }

    #[test]
    fn node_supplied_references_are_honoured() {
        let plan = PlanNode::modify(CUSTOMERS, PlanNode::values())
            .with_constraint_references(vec![ORDERS]);
        let map = build(&plan, true);
        assert_eq!(
            map.access(&EntityIdentifier::entity(ORDERS, 100)),
            AccessMode::Read
        );
        assert_eq!(
            map.access(&EntityIdentifier::entity(ORDERS, 101)),
            AccessMode::Read
        );
    }

    #[test]
    fn document_and_graph_scopes() {
        let plan = PlanNode::operator(vec![
            PlanNode::document_modify(EVENTS, PlanNode::values()),
            PlanNode::graph_scan(SOCIAL),
        ]);
        let map = build(&plan, false);
        let doc = EntityIdentifier::entity(EVENTS, 0);
        assert_eq!(map.access(&doc), AccessMode::Write);
        let (graph_id, graph_mode) = map
            .accesses()
            .iter()
            .find(|(id, _)| id.level == NamespaceLevel::Namespace)
            .expect("namespace lock");
        assert_eq!(graph_id.entity_id, SOCIAL);
        assert_eq!(graph_id.allocation_id, 0);
        assert_eq!(*graph_mode, AccessMode::Read);
        assert_eq!(map.aggregate(), AccessMode::ReadWrite);
        assert!(map.adapters().contains(&3));
    }

    #[test]
    fn unknown_entity_is_reported() {
        let err = EntityAccessMap::build(
            &PlanNode::scan(999),
            &AllocationRouting::new(),
            &snapshot(),
            false,
        )
        .expect_err("unknown");
        assert!(matches!(err, TxError::UnknownEntity(999)));
    }

    #[test]
    fn operator_only_plan_touches_nothing() {
        let map = build(&PlanNode::operator(vec![PlanNode::values()]), true);
        assert!(map.is_empty());
        assert!(map.lock_modes().is_empty());
        assert_eq!(map.aggregate(), AccessMode::NoAccess);
    }
}
