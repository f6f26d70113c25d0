//! Per-processor relay from a change stream into a sink.

pub mod engine;

pub use engine::{RouteEngine, RouteHandle, RouteProgress};
