//! Logical objects and their per-device residency state.

pub mod element;
pub mod logical;
pub mod state;
pub mod tracker;

pub use element::{Element, ElementType};
pub use logical::{LogicalObject, ObjectId, ObjectShape};
pub use state::{DeviceObjectState, GlobalObjectState};
pub use tracker::ObjectStateTracker;
