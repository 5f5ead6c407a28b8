//! Pure event projections for Jarindex.
//!
//! A projection never touches a store. It declares a [`ReadSet`], receives a
//! [`Snapshot`] of those rows and returns the mutations the event implies.

pub mod error;
pub mod reconcile;
pub mod registry;
pub mod snapshot;
pub mod transfer;
pub mod vault;

#[cfg(test)]
mod testing;

pub use error::{InvariantViolation, ProjectionError};
pub use reconcile::BucketView;
pub use registry::{Projection, StreamProjector};
pub use snapshot::{ReadSet, Snapshot, WorkingSet};
