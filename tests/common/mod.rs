//! Shared fixtures: scripted services and an engine wired to them.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use docsum::activities::{ActivityRegistry, ExtractActivity, PersistActivity, SummarizeActivity};
use docsum::adapters::{
    AnalyzedDocument, BlobStore, FixedClock, FsBlobStore, LayoutAnalyzer, LayoutLine, LayoutPage,
    TextGenerator, INPUT_CONTAINER,
};
use docsum::core::{Orchestrator, Pipeline, RetryPolicy};
use docsum::domain::ActivityError;

/// Replies with queued failures first, then with its pages
pub struct ScriptedAnalyzer {
    pages: Vec<Vec<String>>,
    failures: Mutex<VecDeque<ActivityError>>,
    pub calls: AtomicU32,
}

impl ScriptedAnalyzer {
    pub fn new(pages: &[&[&str]]) -> Arc<Self> {
        Arc::new(Self {
            pages: pages
                .iter()
                .map(|p| p.iter().map(|l| l.to_string()).collect())
                .collect(),
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn failing_first(self: Arc<Self>, failures: Vec<ActivityError>) -> Arc<Self> {
        self.failures.lock().unwrap().extend(failures);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LayoutAnalyzer for ScriptedAnalyzer {
    async fn analyze(&self, _document: Vec<u8>) -> Result<AnalyzedDocument, ActivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        Ok(AnalyzedDocument {
            pages: self
                .pages
                .iter()
                .enumerate()
                .map(|(i, lines)| LayoutPage {
                    page_number: i as u32 + 1,
                    lines: lines
                        .iter()
                        .map(|l| LayoutLine { content: l.clone() })
                        .collect(),
                })
                .collect(),
        })
    }
}

/// Replies with queued failures first, then with a fixed summary.
/// With a gate, every call waits for a permit before answering.
pub struct ScriptedGenerator {
    reply: String,
    failures: Mutex<VecDeque<ActivityError>>,
    gate: Option<Arc<Semaphore>>,
    pub calls: AtomicU32,
}

impl ScriptedGenerator {
    pub fn new(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            failures: Mutex::new(VecDeque::new()),
            gate: None,
            calls: AtomicU32::new(0),
        })
    }

    pub fn failing_first(reply: &str, failures: Vec<ActivityError>) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            failures: Mutex::new(failures.into()),
            gate: None,
            calls: AtomicU32::new(0),
        })
    }

    pub fn gated(reply: &str, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            failures: Mutex::new(VecDeque::new()),
            gate: Some(gate),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _prompt: &str) -> Result<String, ActivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| ActivityError::transient("gate closed"))?;
            permit.forget();
        }

        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(error) => Err(error),
            None => Ok(self.reply.clone()),
        }
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Blob store that refuses every write
pub struct ReadOnlyStore(pub FsBlobStore);

#[async_trait]
impl BlobStore for ReadOnlyStore {
    async fn read(&self, container: &str, name: &str) -> Result<Vec<u8>, docsum::adapters::StorageError> {
        self.0.read(container, name).await
    }

    async fn write(&self, _container: &str, name: &str, _data: &[u8]) -> Result<(), docsum::adapters::StorageError> {
        Err(docsum::adapters::StorageError::InvalidName(name.to_string()))
    }

    async fn list(&self, container: &str) -> Result<Vec<String>, docsum::adapters::StorageError> {
        self.0.list(container).await
    }
}

/// Engine state and storage in one temp directory
pub struct Harness {
    pub temp: TempDir,
    pub blobs: Arc<FsBlobStore>,
    pub clock: Arc<FixedClock>,
}

impl Harness {
    pub async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let blobs = Arc::new(FsBlobStore::new(temp.path().join("storage")));
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        ));

        Self { temp, blobs, clock }
    }

    pub fn instances_dir(&self) -> std::path::PathBuf {
        self.temp.path().join("instances")
    }

    pub async fn put_input(&self, name: &str) {
        self.blobs
            .write(INPUT_CONTAINER, name, b"%PDF-1.7 test document")
            .await
            .unwrap();
    }

    /// Engine with the three real activities over scripted services
    pub fn engine(
        &self,
        analyzer: Arc<dyn LayoutAnalyzer>,
        generator: Arc<dyn TextGenerator>,
        max_attempts: u32,
    ) -> Orchestrator {
        self.engine_with_store(analyzer, generator, self.blobs.clone(), max_attempts)
    }

    pub fn engine_with_store(
        &self,
        analyzer: Arc<dyn LayoutAnalyzer>,
        generator: Arc<dyn TextGenerator>,
        output_store: Arc<dyn BlobStore>,
        max_attempts: u32,
    ) -> Orchestrator {
        let activities = ActivityRegistry::new()
            .with(Arc::new(ExtractActivity::new(self.blobs.clone(), analyzer)))
            .with(Arc::new(SummarizeActivity::new(generator)))
            .with(Arc::new(PersistActivity::new(output_store)));

        Orchestrator::builder(self.instances_dir(), activities)
            .pipeline(Pipeline::summarize_document(fast_retry(max_attempts)))
            .clock(self.clock.clone())
            .build()
            .unwrap()
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(max_attempts, Duration::from_millis(10))
}

pub const WAIT: Duration = Duration::from_secs(10);
