//! Classification of plan trees into per-entity access modes.

pub mod map;
pub mod mode;
pub mod plan;

pub use map::{AllocationRouting, EntityAccessMap};
pub use mode::AccessMode;
pub use plan::{Binding, NodeKind, PlanNode};
