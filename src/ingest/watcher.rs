//! Input directory watcher.
//!
//! Watches the `input` container directory and emits an event once a new
//! file has stopped growing. Each file is reported at most once per
//! process.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use glob::Pattern;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::adapters::INPUT_CONTAINER;
use crate::config::WatchSettings;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Invalid file pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Directory to watch
    pub watch_path: PathBuf,

    /// How long a file must keep the same size before it is reported
    pub stability_delay: Duration,

    /// File name globs to accept
    pub patterns: Vec<String>,
}

impl WatcherConfig {
    pub fn new(watch_path: impl Into<PathBuf>, settings: &WatchSettings) -> Self {
        Self {
            watch_path: watch_path.into(),
            stability_delay: settings.stability_delay,
            patterns: settings.patterns.clone(),
        }
    }

    /// Check if the watch path exists
    pub fn validate(&self) -> Result<(), WatcherError> {
        if !self.watch_path.is_dir() {
            return Err(WatcherError::DirectoryNotFound(self.watch_path.clone()));
        }
        Ok(())
    }
}

/// A new, stable input file
#[derive(Debug, Clone, PartialEq)]
pub struct NewItem {
    pub path: PathBuf,

    /// Container-qualified reference, e.g. `input/report.pdf`
    pub item_ref: String,

    pub size: u64,
    pub detected_at: DateTime<Utc>,
}

/// Matches file names against the configured globs
#[derive(Debug, Clone)]
struct FileFilter {
    patterns: Vec<Pattern>,
}

impl FileFilter {
    fn new(patterns: &[String]) -> Result<Self, WatcherError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|source| WatcherError::Pattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { patterns })
    }

    fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };

        // Hidden files, editor swap files and partial downloads
        if name.starts_with('.') || name.ends_with('~') || name.ends_with(".tmp") || name.ends_with(".part") {
            return false;
        }

        self.patterns.iter().any(|p| p.matches(name))
    }
}

/// Input directory watcher with stability checking
pub struct InputWatcher {
    config: WatcherConfig,
    filter: FileFilter,
}

impl InputWatcher {
    pub fn new(config: WatcherConfig) -> Result<Self, WatcherError> {
        let filter = FileFilter::new(&config.patterns)?;
        Ok(Self { config, filter })
    }

    /// Get the current configuration
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Files already present in the directory, sorted by name
    pub async fn scan_once(&self) -> Result<Vec<NewItem>> {
        self.config.validate()?;

        let mut items = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.watch_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !self.filter.accepts(&path) {
                continue;
            }

            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.is_file() {
                items.push(new_item(path, metadata.len()));
            }
        }

        items.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(items)
    }

    /// Watch the directory and emit events for new stable files.
    /// Paths in `already_seen` are never reported.
    pub fn watch(
        &self,
        already_seen: HashSet<PathBuf>,
    ) -> Result<(mpsc::Receiver<NewItem>, WatchHandle)> {
        self.config.validate()?;

        let (item_tx, item_rx) = mpsc::channel::<NewItem>(100);
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

        let config = self.config.clone();
        let filter = self.filter.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = run_watcher(config, filter, already_seen, item_tx, &mut stop_rx).await {
                tracing::error!("Watcher error: {}", e);
            }
        });

        Ok((item_rx, WatchHandle { stop_tx, task }))
    }
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

fn new_item(path: PathBuf, size: u64) -> NewItem {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    NewItem {
        item_ref: format!("{}/{}", INPUT_CONTAINER, name),
        path,
        size,
        detected_at: Utc::now(),
    }
}

/// Internal watcher loop
async fn run_watcher(
    config: WatcherConfig,
    filter: FileFilter,
    mut seen: HashSet<PathBuf>,
    item_tx: mpsc::Sender<NewItem>,
    stop_rx: &mut mpsc::Receiver<()>,
) -> Result<()> {
    // Files being stabilized (path -> (size, last change))
    let mut pending: HashMap<PathBuf, (u64, Instant)> = HashMap::new();

    let (tx, rx) = std::sync::mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_millis(500), tx)?;
    debouncer
        .watcher()
        .watch(&config.watch_path, RecursiveMode::NonRecursive)?;

    tracing::info!("Watching {} for new items", config.watch_path.display());

    loop {
        if stop_rx.try_recv().is_ok() {
            tracing::info!("Watcher stopping...");
            break;
        }

        loop {
            match rx.try_recv() {
                Ok(Ok(events)) => {
                    for event in events {
                        let path = event.path;
                        if seen.contains(&path) || !filter.accepts(&path) {
                            continue;
                        }
                        if let Ok(metadata) = std::fs::metadata(&path) {
                            if metadata.is_file() {
                                let size = metadata.len();
                                let entry = pending.entry(path).or_insert((size, Instant::now()));
                                if entry.0 != size {
                                    *entry = (size, Instant::now());
                                }
                            }
                        }
                    }
                }
                Ok(Err(e)) => tracing::warn!("Watcher error: {:?}", e),
                Err(std::sync::mpsc::TryRecvError::Empty) => break,
                Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                    tracing::error!("Watcher channel disconnected");
                    return Ok(());
                }
            }
        }

        let now = Instant::now();
        let mut stable = Vec::new();
        let mut gone = Vec::new();

        for (path, (last_size, last_change)) in pending.iter_mut() {
            match std::fs::metadata(path) {
                Ok(metadata) => {
                    let size = metadata.len();
                    if size != *last_size {
                        *last_size = size;
                        *last_change = now;
                    } else if size > 0 && now.duration_since(*last_change) >= config.stability_delay {
                        stable.push((path.clone(), size));
                    }
                }
                Err(_) => gone.push(path.clone()),
            }
        }

        for path in gone {
            pending.remove(&path);
        }

        for (path, size) in stable {
            pending.remove(&path);
            seen.insert(path.clone());

            let item = new_item(path, size);
            tracing::info!(item_ref = %item.item_ref, size, "New item detected");
            if item_tx.send(item).await.is_err() {
                return Ok(());
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Ok(())
}
