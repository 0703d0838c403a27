//! # kpistream-core
//!
//! Domain models, port definitions, error type and configuration shared by every
//! kpistream crate.
//!
//! ## Layout
//!
//! - [`models`]: samples, aggregate snapshots, delivery records, session summary
//! - [`ports`]: adapter interfaces (`async_trait`)
//! - [`error`]: core error type (thiserror)
//! - [`config`]: reporter settings and file loader
//! - [`credential`]: insert key / API key resolution chain

pub mod config;
pub mod credential;
pub mod error;
pub mod models;
pub mod ports;
