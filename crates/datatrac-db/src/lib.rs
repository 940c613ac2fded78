//! Persistence layer for datatrac: the durable schema, row models, and
//! query functions for data sources, sync tasks, and the per-unit
//! checkpoint tables.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
