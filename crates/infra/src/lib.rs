//! Infrastructure layer: event store backends and their configuration.

pub mod config;
pub mod event_store;
