//! docsum - Durable document summarization
//!
//! Watches a storage container for new documents and runs each one
//! through an extract → summarize → persist pipeline on a durable
//! orchestration engine.
//!
//! # Architecture
//!
//! The engine is built around event sourcing:
//! - Every scheduled step, outcome and retry timer is an appended event
//! - Instance state is derived by replaying events
//! - Replay is pure, so an interrupted instance resumes without
//!   re-running steps that already succeeded
//!
//! # Modules
//!
//! - `activities`: The extract, summarize and persist units of work
//! - `adapters`: Blob storage, layout analysis and text generation clients
//! - `core`: Orchestration logic (EventStore, Pipeline, Replay, Orchestrator)
//! - `domain`: Data structures (Event, InstanceView, ActivityError)
//! - `ingest`: Input watcher and dispatcher
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Summarize everything dropped into the input container
//! docsum watch
//!
//! # Summarize one item and wait for the result
//! docsum submit input/report.pdf
//!
//! # Check an instance
//! docsum status <instance-id>
//! ```

pub mod activities;
pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;

// Re-export main types at crate root for convenience
pub use activities::{Activity, ActivityContext, ActivityRegistry};
pub use config::Settings;
pub use core::{Orchestrator, Pipeline, RetryPolicy};
pub use domain::{ActivityError, Event, EventKind, InstanceStatus, InstanceView};
pub use ingest::{Dispatcher, InputWatcher, ItemRef};
