//! Input edge: observe new items and start pipeline instances.
//!
//! ```text
//! input/ (blob container) → InputWatcher → Dispatcher → Orchestrator
//! ```

pub mod dispatcher;
pub mod watcher;

// Re-export key types
pub use dispatcher::{Dispatcher, ItemRef, ItemRefError};
pub use watcher::{InputWatcher, NewItem, WatchHandle, WatcherConfig, WatcherError};
