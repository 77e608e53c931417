//! Offline-resilient request gateway.
//!
//! Sits between a client and its backend API. Reads are cached and served
//! locally when the backend is unreachable; writes made while offline are
//! appended to a durable queue and replayed in order once connectivity
//! returns.

pub mod backend;
pub mod cache;
pub mod clock;
pub mod db;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod network;
pub mod queue;
pub mod replay;

pub use error::{GatewayError, StorageError};
pub use gateway::{GatewayResponse, RequestGateway, ResponseOrigin};
