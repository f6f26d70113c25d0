//! parrot_core: processor lifecycle and cluster coordination for CDC
//! pipelines.
//!
//! A [`node::ParrotNode`] joins a cluster through a coordination backend,
//! competes for leadership, and runs the processors the leader assigns to
//! it. Each processor relays its change stream into a SQL sink through a
//! [`sinks::SinkDialect`].
//!
//! Basic usage:
//!
//! ```no_run
//! use std::sync::Arc;
//! use parrot_core::cluster::MemoryBackend;
//! use parrot_core::config::NodeConfig;
//! use parrot_core::node::ParrotNode;
//! use parrot_core::sources::MemoryChangeLog;
//!
//! # async fn run() -> parrot_utils::ParrotResult<()> {
//! parrot_core::logging::init();
//! let node = ParrotNode::new(
//!     NodeConfig::new("node-1"),
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(MemoryChangeLog::new()),
//! );
//! // runs until Ctrl-C
//! node.run().await
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod control;
pub mod lifecycle;
pub mod model;
pub mod node;
pub mod route;
pub mod sinks;
pub mod sources;
pub mod store;

pub mod logging;

pub mod metrics;
