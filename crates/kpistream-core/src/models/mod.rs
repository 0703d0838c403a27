//! kpistream domain models.
//!
//! Data shared between the aggregation pipeline and the delivery adapters.

pub mod delivery;
pub mod sample;
pub mod session;
pub mod snapshot;
