//! # kpistream-network
//!
//! Network adapters: Metric API payload encoding, gzip, the reqwest ingest
//! client, delivery with retry/backoff and the NerdGraph dashboard manager.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kpistream_network::delivery::DeliveryClient;
//! use kpistream_network::encoder::PayloadEncoder;
//! use kpistream_network::http_client::HttpIngestClient;
//!
//! let ingest = HttpIngestClient::new(&config.endpoint, config.timeout)?;
//! let delivery = DeliveryClient::new(Arc::new(ingest), config.retry.clone());
//! let payload = PayloadEncoder::new(&config.project, session_id)
//!     .encode(&snapshot, &credential, &config.custom_tags)?;
//! let result = delivery.deliver(&payload).await;
//! ```

pub mod compression;
pub mod dashboard;
pub mod delivery;
pub mod encoder;
pub mod http_client;
