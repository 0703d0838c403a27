//! Port interfaces (traits).
//!
//! Adapter crates implement these; the pipeline and the app hold them as
//! `Arc<dyn T>`. Async traits use `async_trait` so they stay object safe.

pub mod attempt_sink;
pub mod dashboard;
pub mod ingest_client;
pub mod link_opener;
