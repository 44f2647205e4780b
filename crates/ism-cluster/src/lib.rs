//! HTTP cluster adapter for ismd
//!
//! Provides:
//! - `HttpCluster`, a `ClusterClient` speaking the search cluster REST API
//! - Index lifecycle monitoring by polling the index catalogue

mod convert;
mod http;
mod monitor;

pub use convert::*;
pub use http::*;
pub use monitor::*;
