//! The sync execution engine: task controller, bounded worker pool,
//! per-unit streaming pipeline, engine adapters, durable progress
//! accounting, and event fan-out.

pub mod adapter;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod events;
pub mod logbuf;
pub mod pipeline;
pub mod progress;
pub mod taskconfig;

pub use controller::SyncEngine;
pub use error::{AdapterError, ControlError};
pub use events::EventBus;
pub use logbuf::LogHub;
