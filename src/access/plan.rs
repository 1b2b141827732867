use crate::catalog::schema::{DataModel, EntityId, NamespaceId};

/// What a plan node is bound to and whether it changes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Entity id for relational and document nodes, namespace id for graph
    /// nodes.
    pub target: u64,
    pub modify: bool,
    /// Entities the target references through declared constraints.
    pub constraint_references: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Joins, filters, projections and the like: nothing bound of their own.
    Operator,
    Relational(Binding),
    Document(Binding),
    Graph(Binding),
}

/// Plan tree as handed over by the query processor, reduced to what access
/// classification needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    pub kind: NodeKind,
    pub inputs: Vec<PlanNode>,
}

fn bound(target: u64, modify: bool) -> Binding {
    Binding {
        target,
        modify,
        constraint_references: Vec::new(),
    }
}

impl PlanNode {
    pub fn operator(inputs: Vec<PlanNode>) -> Self {
        Self {
            kind: NodeKind::Operator,
            inputs,
        }
    }

    pub fn scan(entity: EntityId) -> Self {
        Self::leaf(NodeKind::Relational(bound(entity, false)))
    }

    pub fn modify(entity: EntityId, input: PlanNode) -> Self {
        Self {
            kind: NodeKind::Relational(bound(entity, true)),
            inputs: vec![input],
        }
    }

    pub fn document_scan(entity: EntityId) -> Self {
        Self::leaf(NodeKind::Document(bound(entity, false)))
    }

    pub fn document_modify(entity: EntityId, input: PlanNode) -> Self {
        Self {
            kind: NodeKind::Document(bound(entity, true)),
            inputs: vec![input],
        }
    }

    pub fn graph_scan(namespace: NamespaceId) -> Self {
        Self::leaf(NodeKind::Graph(bound(namespace, false)))
    }

    pub fn graph_modify(namespace: NamespaceId, input: PlanNode) -> Self {
        Self {
            kind: NodeKind::Graph(bound(namespace, true)),
            inputs: vec![input],
        }
    }

    /// Values-style leaf with no bound entity.
    pub fn values() -> Self {
        Self::operator(Vec::new())
    }

    fn leaf(kind: NodeKind) -> Self {
        Self {
            kind,
            inputs: Vec::new(),
        }
    }

    pub fn with_constraint_references(mut self, references: Vec<EntityId>) -> Self {
        if let Some(binding) = self.binding_mut() {
            binding.constraint_references = references;
        }
        self
    }

    pub fn with_input(mut self, input: PlanNode) -> Self {
        self.inputs.push(input);
        self
    }

    fn binding(&self) -> Option<&Binding> {
        match &self.kind {
            NodeKind::Operator => None,
            NodeKind::Relational(b) | NodeKind::Document(b) | NodeKind::Graph(b) => Some(b),
        }
    }

    fn binding_mut(&mut self) -> Option<&mut Binding> {
        match &mut self.kind {
            NodeKind::Operator => None,
            NodeKind::Relational(b) | NodeKind::Document(b) | NodeKind::Graph(b) => Some(b),
        }
    }

    pub fn model(&self) -> Option<DataModel> {
        match self.kind {
            NodeKind::Operator => None,
            NodeKind::Relational(_) => Some(DataModel::Relational),
            NodeKind::Document(_) => Some(DataModel::Document),
            NodeKind::Graph(_) => Some(DataModel::Graph),
        }
    }

    pub fn is_data_modifying(&self) -> bool {
        self.binding().is_some_and(|b| b.modify)
    }

    pub fn bound_entity(&self) -> Option<u64> {
        self.binding().map(|b| b.target)
    }

    pub fn constraint_references(&self) -> &[EntityId] {
        self.binding()
            .map(|b| b.constraint_references.as_slice())
            .unwrap_or(&[])
    }

    pub fn children(&self) -> &[PlanNode] {
        &self.inputs
    }

    /// True when any node of the tree is bound to an entity or namespace.
    pub fn binds_any(&self) -> bool {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.binding().is_some() {
                return true;
            }
            stack.extend(node.children());
        }
        false
    }
}
