//! # kpistream-pipeline
//!
//! The streaming engine: sample intake, interval aggregation, ordered delivery
//! and the session lifecycle around them.
//!
//! ```text
//! producers -> SampleCollector -> Aggregator (tick) -> pending snapshots
//!           -> DeliveryWorker (encode + deliver) -> ingest API
//! ```
//!
//! [`session::SessionController`] wires it together and hands out a
//! [`session::RunningSession`] whose `finish()` drains and reports.

pub mod aggregator;
pub mod collector;
pub mod percentile;
pub mod session;
pub mod state;
pub mod worker;
