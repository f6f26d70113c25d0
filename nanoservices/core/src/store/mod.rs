//! Durable processor registry backed by SQLite.

pub mod db;
pub mod registry;

pub use registry::Registry;
