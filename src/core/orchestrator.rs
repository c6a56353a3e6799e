//! Durable orchestration engine.
//!
//! The orchestrator owns instance histories. Every state change goes
//! through the same cycle: take the instance lock, replay the history,
//! act on the single decision replay returns, append what happened.
//!
//! Activities and retry timers run in their own tasks and never touch
//! history. When they finish they post a [`WorkItem`] back to the worker
//! loop, which applies it under the instance lock. An item that no longer
//! matches what replay is waiting for is dropped, so duplicate or late
//! deliveries cannot change a history.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activities::{ActivityContext, ActivityRegistry};
use crate::adapters::{Clock, SystemClock};
use crate::domain::{ActivityError, Event, EventKind, InstanceStatus, InstanceView};

use super::event_store::{is_sequence_conflict, EventStore};
use super::pipeline::Pipeline;
use super::replay::{replay, ActivityCall, Decision};

/// Upper bound on a single activity attempt
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(600);

/// Something that happened outside an instance and must be recorded
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    /// Replay and take the next decision
    Advance(Uuid),

    /// An activity attempt finished
    ActivityFinished {
        instance_id: Uuid,
        step_index: usize,
        attempt: u32,
        outcome: Result<Value, ActivityError>,
        duration_ms: u64,
    },

    /// A retry timer elapsed
    TimerFired {
        instance_id: Uuid,
        step_index: usize,
        attempt: u32,
    },
}

impl WorkItem {
    pub fn instance_id(&self) -> Uuid {
        match self {
            Self::Advance(id) => *id,
            Self::ActivityFinished { instance_id, .. } | Self::TimerFired { instance_id, .. } => {
                *instance_id
            }
        }
    }
}

/// Work started by this process and not yet reported back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Pending {
    Activity(Uuid, usize, u32),
    Timer(Uuid, usize, u32),
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    root: PathBuf,
    activities: ActivityRegistry,
    pipelines: Vec<Pipeline>,
    clock: Arc<dyn Clock>,
    activity_timeout: Duration,
}

impl OrchestratorBuilder {
    /// Make a pipeline startable by name
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = timeout;
        self
    }

    /// Validate pipelines against the registered activities
    pub fn build(self) -> Result<Orchestrator> {
        let mut pipelines = HashMap::new();

        for pipeline in self.pipelines {
            pipeline
                .validate()
                .with_context(|| format!("Invalid pipeline '{}'", pipeline.name))?;

            for activity in pipeline.activity_names() {
                if !self.activities.contains(activity) {
                    anyhow::bail!(
                        "Pipeline '{}' uses unregistered activity '{}'",
                        pipeline.name,
                        activity
                    );
                }
            }

            if pipelines.contains_key(&pipeline.name) {
                anyhow::bail!("Pipeline '{}' registered twice", pipeline.name);
            }
            pipelines.insert(pipeline.name.clone(), pipeline);
        }

        let (work_tx, work_rx) = mpsc::unbounded_channel();

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                root: self.root,
                pipelines,
                activities: self.activities,
                clock: self.clock,
                activity_timeout: self.activity_timeout,
                work_tx,
                work_rx: Mutex::new(Some(work_rx)),
                pending: Mutex::new(HashSet::new()),
                locks: Mutex::new(HashMap::new()),
                finished: Notify::new(),
            }),
        })
    }
}

struct Inner {
    /// Directory holding one history directory per instance
    root: PathBuf,
    pipelines: HashMap<String, Pipeline>,
    activities: ActivityRegistry,
    clock: Arc<dyn Clock>,
    activity_timeout: Duration,
    work_tx: mpsc::UnboundedSender<WorkItem>,
    work_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkItem>>>,
    pending: Mutex<HashSet<Pending>>,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,

    /// Signalled whenever an instance reaches a terminal status
    finished: Notify,
}

/// Durable pipeline engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Start configuring an orchestrator storing histories under `root`
    pub fn builder(root: impl Into<PathBuf>, activities: ActivityRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            root: root.into(),
            activities,
            pipelines: Vec::new(),
            clock: Arc::new(SystemClock),
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Registered pipeline names, sorted
    pub fn pipelines(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inner.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Spawn the loop that applies activity results and timer firings.
    /// Only one worker may run per orchestrator.
    pub fn start_worker(&self) -> Result<WorkerHandle> {
        let mut work_rx = lock(&self.inner.work_rx)
            .take()
            .context("Orchestrator worker already started")?;
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let orchestrator = self.clone();

        let task = tokio::spawn(async move {
            info!(root = %orchestrator.inner.root.display(), "Orchestrator worker started");

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    item = work_rx.recv() => {
                        let Some(item) = item else { break };
                        let this = orchestrator.clone();
                        tokio::spawn(async move {
                            let id = item.instance_id();
                            if let Err(e) = this.apply(item).await {
                                error!(instance_id = %id, error = %e, "Failed to apply work item");
                            }
                        });
                    }
                }
            }

            info!("Orchestrator worker stopped");
        });

        Ok(WorkerHandle { stop_tx, task })
    }

    /// Create an instance of `pipeline_name` and run it up to its first
    /// suspension point
    #[instrument(skip(self, input), fields(pipeline = %pipeline_name))]
    pub async fn start(&self, pipeline_name: &str, input: Value) -> Result<Uuid> {
        if !self.inner.pipelines.contains_key(pipeline_name) {
            anyhow::bail!("Unknown pipeline: {}", pipeline_name);
        }

        let instance_id = Uuid::new_v4();
        let store = EventStore::open(&self.inner.root, instance_id).await?;

        {
            let lock = self.instance_lock(instance_id);
            let _guard = lock.lock().await;

            let started = self.event(
                instance_id,
                1,
                EventKind::InstanceStarted {
                    pipeline: pipeline_name.to_string(),
                    input,
                },
            );
            store.append(&started).await?;
            info!(%instance_id, "Instance started");

            self.advance_locked(instance_id, &store).await?;
        }

        Ok(instance_id)
    }

    /// Replay an instance and act on its next decision.
    ///
    /// Work this process is not already running for the instance (an
    /// activity awaiting a result, a pending timer) is started again, so
    /// calling this after a restart picks the instance back up.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub async fn resume(&self, instance_id: Uuid) -> Result<InstanceView> {
        let store = self.existing_store(instance_id)?;

        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        self.advance_locked(instance_id, &store).await
    }

    /// Resume every non-terminal instance under the store root.
    ///
    /// An instance whose history cannot be read (a torn last line left by a
    /// crash mid-append, say) is quarantined here, so it shows up as such
    /// instead of staying invisible.
    pub async fn recover(&self) -> Result<usize> {
        let mut resumed = 0;

        for instance_id in EventStore::list_instances(&self.inner.root).await? {
            let view = match self.get_status(instance_id).await {
                Ok(view) => view,
                Err(e) => {
                    warn!(%instance_id, error = %e, "Unreadable instance");
                    if let Err(e) = self.resume(instance_id).await {
                        warn!(%instance_id, error = %e, "Failed to quarantine instance");
                    }
                    continue;
                }
            };

            if view.is_running() {
                match self.resume(instance_id).await {
                    Ok(_) => resumed += 1,
                    Err(e) => warn!(%instance_id, error = %e, "Failed to resume instance"),
                }
            }
        }

        if resumed > 0 {
            info!(resumed, "Recovered running instances");
        }

        Ok(resumed)
    }

    /// Record an externally delivered event, then advance
    pub async fn apply(&self, item: WorkItem) -> Result<()> {
        let instance_id = item.instance_id();
        let store = self.existing_store(instance_id)?;

        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        match item {
            WorkItem::Advance(_) => {}

            WorkItem::ActivityFinished {
                step_index,
                attempt,
                outcome,
                duration_ms,
                ..
            } => {
                self.unmark(Pending::Activity(instance_id, step_index, attempt));
                self.record_activity_result(&store, instance_id, step_index, attempt, outcome, duration_ms)
                    .await?;
            }

            WorkItem::TimerFired {
                step_index,
                attempt,
                ..
            } => {
                self.unmark(Pending::Timer(instance_id, step_index, attempt));
                self.record_timer_fired(&store, instance_id, step_index, attempt)
                    .await?;
            }
        }

        self.advance_locked(instance_id, &store).await?;
        Ok(())
    }

    /// Cancel a running instance. Results arriving later are ignored.
    #[instrument(skip(self, reason), fields(instance_id = %instance_id))]
    pub async fn cancel(&self, instance_id: Uuid, reason: &str) -> Result<InstanceView> {
        let store = self.existing_store(instance_id)?;

        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        // Another process may append between our read and our write
        loop {
            let view = self.status_from_store(instance_id, &store).await?;
            if view.is_finished() {
                anyhow::bail!("Instance {} already {}", instance_id, view.status);
            }

            let event = self.event(
                instance_id,
                view.event_count as u64 + 1,
                EventKind::InstanceCancelled {
                    reason: reason.to_string(),
                },
            );
            if self.record(&store, &event).await? {
                break;
            }
        }

        info!(reason, "Instance cancelled");
        self.inner.finished.notify_waiters();
        self.forget_lock(instance_id);

        self.status_from_store(instance_id, &store).await
    }

    /// Current view of an instance
    pub async fn get_status(&self, instance_id: Uuid) -> Result<InstanceView> {
        let store = self.existing_store(instance_id)?;
        self.status_from_store(instance_id, &store).await
    }

    /// The raw history of an instance
    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<Event>> {
        let store = self.existing_store(instance_id)?;
        store.replay().await
    }

    /// Most recently started instances first
    pub async fn list_instances(&self, limit: usize) -> Result<Vec<InstanceView>> {
        let mut views = Vec::new();

        for instance_id in EventStore::list_instances(&self.inner.root).await? {
            match self.get_status(instance_id).await {
                Ok(view) => views.push(view),
                Err(e) => debug!(%instance_id, error = %e, "Skipping instance"),
            }
        }

        views.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        views.truncate(limit);
        Ok(views)
    }

    /// Wait until an instance reaches a terminal status
    pub async fn wait_for(&self, instance_id: Uuid, timeout: Duration) -> Result<InstanceView> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let view = self.get_status(instance_id).await?;
            if view.is_finished() {
                return Ok(view);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                anyhow::bail!(
                    "Timed out waiting for instance {} (status: {})",
                    instance_id,
                    view.status
                );
            }

            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    fn existing_store(&self, instance_id: Uuid) -> Result<EventStore> {
        let store = EventStore::at(&self.inner.root, instance_id);
        if !store.exists() {
            anyhow::bail!("Instance not found: {}", instance_id);
        }
        Ok(store)
    }

    fn instance_lock(&self, instance_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.inner.locks)
            .entry(instance_id)
            .or_default()
            .clone()
    }

    /// Drop the lock of a finished instance unless someone is waiting on it.
    /// Called with the instance lock held, so the caller owns one handle.
    fn forget_lock(&self, instance_id: Uuid) {
        let mut locks = lock(&self.inner.locks);
        if locks
            .get(&instance_id)
            .map_or(false, |l| Arc::strong_count(l) <= 2)
        {
            locks.remove(&instance_id);
        }
    }

    fn event(&self, instance_id: Uuid, sequence: u64, kind: EventKind) -> Event {
        Event::new(instance_id, sequence, kind).at(self.inner.clock.now())
    }

    /// Append `event`. False if another writer appended first; the caller
    /// replays and decides again.
    async fn record(&self, store: &EventStore, event: &Event) -> Result<bool> {
        match store.append(event).await {
            Ok(()) => Ok(true),
            Err(e) if is_sequence_conflict(&e) => {
                debug!(instance_id = %event.instance_id, error = %e, "History moved on, replaying again");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Activity results and timers can only be applied by a running worker
    fn worker_started(&self) -> bool {
        lock(&self.inner.work_rx).is_none()
    }

    /// Returns false if the work is already running in this process
    fn mark(&self, pending: Pending) -> bool {
        lock(&self.inner.pending).insert(pending)
    }

    fn unmark(&self, pending: Pending) {
        lock(&self.inner.pending).remove(&pending);
    }

    async fn status_from_store(&self, instance_id: Uuid, store: &EventStore) -> Result<InstanceView> {
        let quarantine = store.quarantine_record().await?;

        let events = match store.replay().await {
            Ok(events) => events,
            Err(e) => {
                return match quarantine {
                    Some(record) => Ok(unreadable_view(instance_id, record.reason, record.quarantined_at)),
                    None => Err(e),
                };
            }
        };

        let view = InstanceView::from_events(&events)
            .with_context(|| format!("Instance {} has an empty history", instance_id))?;

        Ok(match quarantine {
            Some(record) => view.quarantined(record.reason),
            None => view,
        })
    }

    async fn quarantine(&self, instance_id: Uuid, store: &EventStore, reason: String) -> Result<InstanceView> {
        error!(%instance_id, %reason, "Quarantining instance");
        store.quarantine(&reason).await?;
        self.inner.finished.notify_waiters();
        self.forget_lock(instance_id);
        self.status_from_store(instance_id, store).await
    }

    /// Drive the instance until it suspends or finishes. Caller holds the
    /// instance lock.
    async fn advance_locked(&self, instance_id: Uuid, store: &EventStore) -> Result<InstanceView> {
        loop {
            if let Some(record) = store.quarantine_record().await? {
                debug!(%instance_id, reason = %record.reason, "Instance is quarantined");
                self.forget_lock(instance_id);
                return self.status_from_store(instance_id, store).await;
            }

            let events = match store.replay().await {
                Ok(events) => events,
                Err(e) => {
                    return self
                        .quarantine(instance_id, store, format!("unreadable history: {:#}", e))
                        .await;
                }
            };

            let pipeline_name = match events.first().map(|e| &e.kind) {
                Some(EventKind::InstanceStarted { pipeline, .. }) => pipeline.clone(),
                _ => {
                    return self
                        .quarantine(instance_id, store, "history does not begin with instance_started".to_string())
                        .await;
                }
            };
            let pipeline = self
                .inner
                .pipelines
                .get(&pipeline_name)
                .with_context(|| format!("Pipeline '{}' is not registered", pipeline_name))?;

            let replayed = match replay(pipeline, &events) {
                Ok(replayed) => replayed,
                Err(e) => {
                    return self
                        .quarantine(instance_id, store, format!("replay diverged: {}", e))
                        .await;
                }
            };

            let next_sequence = events.len() as u64 + 1;

            match replayed.decision {
                Decision::ScheduleActivity(call) => {
                    debug!(%instance_id, step = call.step_index, attempt = call.attempt, activity = %call.activity_name, "Scheduling activity");
                    let event = self.event(
                        instance_id,
                        next_sequence,
                        EventKind::StepScheduled {
                            step_index: call.step_index,
                            activity_name: call.activity_name.clone(),
                            attempt: call.attempt,
                            input: call.input.clone(),
                            idempotency_key: call.idempotency_key.clone(),
                        },
                    );
                    self.record(store, &event).await?;
                }

                Decision::AwaitActivity(call) => {
                    let scheduled_at = scheduled_time(&events, &call).unwrap_or_else(|| self.inner.clock.now());
                    self.dispatch_activity(instance_id, call, scheduled_at);
                    return Ok(replayed.view);
                }

                Decision::ScheduleRetry {
                    step_index,
                    attempt,
                    delay,
                } => {
                    let delay = chrono::Duration::from_std(delay)
                        .context("Retry delay out of range")?;
                    let fire_at = self.inner.clock.now() + delay;

                    info!(%instance_id, step = step_index, attempt, %fire_at, "Scheduling retry");
                    let event = self.event(
                        instance_id,
                        next_sequence,
                        EventKind::TimerCreated {
                            step_index,
                            attempt,
                            fire_at,
                        },
                    );
                    self.record(store, &event).await?;
                }

                Decision::AwaitTimer {
                    step_index,
                    attempt,
                    fire_at,
                } => {
                    let remaining = (fire_at - self.inner.clock.now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    self.arm_timer(instance_id, step_index, attempt, remaining);
                    return Ok(replayed.view);
                }

                Decision::Complete { result } => {
                    let event = self.event(
                        instance_id,
                        next_sequence,
                        EventKind::InstanceCompleted { result },
                    );
                    if self.record(store, &event).await? {
                        info!(%instance_id, "Instance completed");
                        self.inner.finished.notify_waiters();
                    }
                }

                Decision::Fail { error } => {
                    let event = self.event(
                        instance_id,
                        next_sequence,
                        EventKind::InstanceFailed {
                            error: error.clone(),
                        },
                    );
                    if self.record(store, &event).await? {
                        warn!(%instance_id, error = %error, "Instance failed");
                        self.inner.finished.notify_waiters();
                    }
                }

                Decision::Terminal => {
                    self.forget_lock(instance_id);
                    return Ok(replayed.view);
                }
            }
        }
    }

    /// Append the outcome if replay is waiting for exactly this attempt
    async fn record_activity_result(
        &self,
        store: &EventStore,
        instance_id: Uuid,
        step_index: usize,
        attempt: u32,
        outcome: Result<Value, ActivityError>,
        duration_ms: u64,
    ) -> Result<()> {
        loop {
            let Some((events, decision)) = self.current_decision(store).await? else {
                return Ok(());
            };

            let call = match decision {
                Decision::AwaitActivity(call) if call.step_index == step_index && call.attempt == attempt => call,
                _ => {
                    debug!(%instance_id, step = step_index, attempt, "Ignoring stale activity result");
                    return Ok(());
                }
            };

            let kind = match &outcome {
                Ok(output) => EventKind::StepSucceeded {
                    step_index,
                    activity_name: call.activity_name.clone(),
                    attempt,
                    output: output.clone(),
                },
                Err(error) => EventKind::StepFailed {
                    step_index,
                    activity_name: call.activity_name.clone(),
                    attempt,
                    error: error.clone(),
                },
            };

            let event = self
                .event(instance_id, events.len() as u64 + 1, kind)
                .with_duration(duration_ms);
            if self.record(store, &event).await? {
                match &outcome {
                    Ok(_) => {
                        info!(%instance_id, step = step_index, attempt, activity = %call.activity_name, duration_ms, "Step succeeded")
                    }
                    Err(error) => {
                        warn!(%instance_id, step = step_index, attempt, activity = %call.activity_name, error = %error, "Step attempt failed")
                    }
                }
                return Ok(());
            }
        }
    }

    /// Append `timer_fired` if replay is waiting for exactly this timer
    async fn record_timer_fired(
        &self,
        store: &EventStore,
        instance_id: Uuid,
        step_index: usize,
        attempt: u32,
    ) -> Result<()> {
        loop {
            let Some((events, decision)) = self.current_decision(store).await? else {
                return Ok(());
            };

            match decision {
                Decision::AwaitTimer {
                    step_index: s,
                    attempt: a,
                    ..
                } if s == step_index && a == attempt => {
                    let event = self.event(
                        instance_id,
                        events.len() as u64 + 1,
                        EventKind::TimerFired {
                            step_index,
                            attempt,
                        },
                    );
                    if self.record(store, &event).await? {
                        debug!(%instance_id, step = step_index, attempt, "Retry timer fired");
                        return Ok(());
                    }
                }
                _ => {
                    debug!(%instance_id, step = step_index, attempt, "Ignoring stale timer");
                    return Ok(());
                }
            }
        }
    }

    /// Replay without side effects. `None` if the instance cannot be
    /// replayed; `advance_locked` quarantines it right after.
    async fn current_decision(&self, store: &EventStore) -> Result<Option<(Vec<Event>, Decision)>> {
        if store.quarantine_record().await?.is_some() {
            return Ok(None);
        }

        let Ok(events) = store.replay().await else {
            return Ok(None);
        };

        let pipeline = match events.first().map(|e| &e.kind) {
            Some(EventKind::InstanceStarted { pipeline, .. }) => self.inner.pipelines.get(pipeline),
            _ => None,
        };
        let Some(pipeline) = pipeline else {
            return Ok(None);
        };

        Ok(replay(pipeline, &events).ok().map(|r| (events, r.decision)))
    }

    /// Run an activity attempt in the background unless it already runs.
    /// Without a worker the attempt stays recorded as scheduled and is
    /// dispatched by whichever process resumes the instance.
    fn dispatch_activity(&self, instance_id: Uuid, call: ActivityCall, scheduled_at: DateTime<Utc>) {
        if !self.worker_started() {
            debug!(%instance_id, step = call.step_index, attempt = call.attempt, "No worker running, leaving activity for a later resume");
            return;
        }
        if !self.mark(Pending::Activity(instance_id, call.step_index, call.attempt)) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = run_activity(&inner, instance_id, &call, scheduled_at).await;

            let item = WorkItem::ActivityFinished {
                instance_id,
                step_index: call.step_index,
                attempt: call.attempt,
                outcome,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            if inner.work_tx.send(item).is_err() {
                warn!(%instance_id, "Worker gone, activity result dropped");
            }
        });
    }

    fn arm_timer(&self, instance_id: Uuid, step_index: usize, attempt: u32, after: Duration) {
        if !self.worker_started() {
            return;
        }
        if !self.mark(Pending::Timer(instance_id, step_index, attempt)) {
            return;
        }

        let work_tx = self.inner.work_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let item = WorkItem::TimerFired {
                instance_id,
                step_index,
                attempt,
            };
            if work_tx.send(item).is_err() {
                warn!(%instance_id, "Worker gone, timer dropped");
            }
        });
    }
}

/// Execute one attempt, turning panics and timeouts into failures
async fn run_activity(
    inner: &Inner,
    instance_id: Uuid,
    call: &ActivityCall,
    scheduled_at: DateTime<Utc>,
) -> Result<Value, ActivityError> {
    let Some(activity) = inner.activities.get(&call.activity_name) else {
        return Err(ActivityError::permanent(format!(
            "No activity registered as '{}'",
            call.activity_name
        )));
    };

    let ctx = ActivityContext {
        instance_id,
        step_index: call.step_index,
        attempt: call.attempt,
        idempotency_key: call.idempotency_key.clone(),
        scheduled_at,
    };
    let input = call.input.clone();

    let handle = tokio::spawn(async move { activity.execute(&ctx, input).await });
    let abort = handle.abort_handle();

    match tokio::time::timeout(inner.activity_timeout, handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_error)) => Err(ActivityError::permanent(format!(
            "Activity '{}' panicked: {}",
            call.activity_name, join_error
        ))),
        Err(_) => {
            abort.abort();
            Err(ActivityError::transient(format!(
                "Activity '{}' timed out after {}s",
                call.activity_name,
                inner.activity_timeout.as_secs_f64()
            )))
        }
    }
}

/// When an attempt was recorded as scheduled
fn scheduled_time(events: &[Event], call: &ActivityCall) -> Option<DateTime<Utc>> {
    events.iter().rev().find_map(|e| match &e.kind {
        EventKind::StepScheduled {
            step_index, attempt, ..
        } if *step_index == call.step_index && *attempt == call.attempt => Some(e.timestamp),
        _ => None,
    })
}

/// Status for an instance whose history can no longer be parsed
fn unreadable_view(
    instance_id: Uuid,
    reason: String,
    quarantined_at: DateTime<Utc>,
) -> InstanceView {
    InstanceView {
        id: instance_id,
        pipeline: String::new(),
        input: Value::Null,
        status: InstanceStatus::Quarantined,
        result: None,
        last_error: None,
        reason: Some(reason),
        started_at: quarantined_at,
        finished_at: None,
        steps: Default::default(),
        event_count: 0,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to control the worker loop
pub struct WorkerHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop the worker. Activities already running finish in the
    /// background; their results are picked up by the next `recover`.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::Activity;
    use crate::core::pipeline::{InputSource, Step};
    use crate::core::retry::RetryPolicy;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Fails with the queued errors, then echoes its input
    struct Flaky {
        name: &'static str,
        failures: Mutex<Vec<ActivityError>>,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(name: &'static str, failures: Vec<ActivityError>) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures: Mutex::new(failures),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Activity for Flaky {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _ctx: &ActivityContext, input: Value) -> Result<Value, ActivityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(input)
            } else {
                Err(failures.remove(0))
            }
        }
    }

    fn single_step(activity: &str, max_attempts: u32) -> Pipeline {
        Pipeline {
            name: "single".to_string(),
            description: String::new(),
            steps: vec![Step::new("only", activity, InputSource::pipeline_input())
                .with_retry_policy(RetryPolicy::fixed(max_attempts, Duration::from_millis(10)))],
        }
    }

    #[tokio::test]
    async fn test_unknown_pipeline_rejected() {
        let temp = TempDir::new().unwrap();
        let orchestrator = Orchestrator::builder(temp.path(), ActivityRegistry::new())
            .build()
            .unwrap();

        assert!(orchestrator.start("missing", json!("x")).await.is_err());
    }

    #[test]
    fn test_unregistered_activity_rejected_at_build() {
        let temp = TempDir::new().unwrap();
        let result = Orchestrator::builder(temp.path(), ActivityRegistry::new())
            .pipeline(single_step("nowhere", 1))
            .build();

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let temp = TempDir::new().unwrap();
        let flaky = Flaky::new(
            "flaky",
            vec![ActivityError::transient("503"), ActivityError::transient("503")],
        );
        let orchestrator = Orchestrator::builder(temp.path(), ActivityRegistry::new().with(flaky.clone()))
            .pipeline(single_step("flaky", 3))
            .build()
            .unwrap();
        let worker = orchestrator.start_worker().unwrap();

        let id = orchestrator.start("single", json!("payload")).await.unwrap();
        let view = orchestrator.wait_for(id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(view.status, InstanceStatus::Completed);
        assert_eq!(view.result, Some(json!("payload")));
        assert_eq!(view.steps[&0].attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_instance_releases_its_lock() {
        let temp = TempDir::new().unwrap();
        let flaky = Flaky::new("flaky", vec![]);
        let orchestrator = Orchestrator::builder(temp.path(), ActivityRegistry::new().with(flaky))
            .pipeline(single_step("flaky", 1))
            .build()
            .unwrap();
        let worker = orchestrator.start_worker().unwrap();

        for _ in 0..3 {
            let id = orchestrator.start("single", json!("payload")).await.unwrap();
            orchestrator.wait_for(id, Duration::from_secs(5)).await.unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !lock(&orchestrator.inner.locks).is_empty() {
            assert!(Instant::now() < deadline, "instance locks were never released");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_activity_waits_for_a_worker() {
        let temp = TempDir::new().unwrap();
        let flaky = Flaky::new("flaky", vec![]);
        let orchestrator = Orchestrator::builder(temp.path(), ActivityRegistry::new().with(flaky.clone()))
            .pipeline(single_step("flaky", 1))
            .build()
            .unwrap();

        let id = orchestrator.start("single", json!("payload")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
        let history = orchestrator.history(id).await.unwrap();
        assert!(matches!(
            history.last().unwrap().kind,
            EventKind::StepScheduled { attempt: 1, .. }
        ));

        let worker = orchestrator.start_worker().unwrap();
        orchestrator.resume(id).await.unwrap();
        let view = orchestrator.wait_for(id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(view.status, InstanceStatus::Completed);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);

        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_activity_timeout_is_transient() {
        struct Slow;

        #[async_trait]
        impl Activity for Slow {
            fn name(&self) -> &str {
                "slow"
            }

            async fn execute(&self, _ctx: &ActivityContext, _input: Value) -> Result<Value, ActivityError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }
        }

        let temp = TempDir::new().unwrap();
        let orchestrator = Orchestrator::builder(temp.path(), ActivityRegistry::new().with(Arc::new(Slow)))
            .pipeline(single_step("slow", 2))
            .activity_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let worker = orchestrator.start_worker().unwrap();

        let id = orchestrator.start("single", json!(null)).await.unwrap();
        let view = orchestrator.wait_for(id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(view.status, InstanceStatus::Failed);
        assert_eq!(view.steps[&0].attempts, 2);
        assert!(view.last_error.unwrap().message.contains("timed out"));

        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_worker_refused() {
        let temp = TempDir::new().unwrap();
        let orchestrator = Orchestrator::builder(temp.path(), ActivityRegistry::new())
            .build()
            .unwrap();

        let worker = orchestrator.start_worker().unwrap();
        assert!(orchestrator.start_worker().is_err());
        worker.stop().await.unwrap();
    }
}
