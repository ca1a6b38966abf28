//! FluxSync Core - InfluxDB master/slave replication
//!
//! This crate provides the building blocks of the FluxSync agent:
//! - Database transports (InfluxDB HTTP API, in-memory)
//! - Schema discovery and replication
//! - Chunked, concurrent, retrying data synchronization
//! - Node health monitoring and the HA cluster supervisor

pub mod agent;
pub mod client;
pub mod config;
pub mod monitoring;
pub mod replication;
pub mod schema;
pub mod timeparse;

pub use agent::*;
pub use client::{
    BatchPoints, ClientError, ClientResult, Connector, DbClient, FieldValue, Point, Query,
    QueryResponse, Series,
};
pub use config::*;
pub use monitoring::*;
pub use replication::*;
pub use schema::*;
pub use timeparse::*;
