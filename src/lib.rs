//! Core client library for a distributed document database: cluster-map
//! routing, a binary KV wire protocol engine, and a streaming HTTP query
//! result reader.

pub mod clustermap;
pub mod config;
pub mod conn;
pub mod dispatcher;
pub mod error;
mod handshake;
pub mod hash;
pub mod http;
pub mod opts;
pub mod pool;
pub mod protocol;
pub mod query;
pub mod retry;
mod sasl;
mod stream;

pub use clustermap::{ClusterMap, Node, SharedClusterMap};
pub use conn::{ConnectConfig, Connection};
pub use dispatcher::{Dispatcher, NodeTransport};
pub use error::{Error, Result};
pub use opts::Opts;
pub use pool::Pool;
