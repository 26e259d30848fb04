//! The batched event recorder.
//!
//! `record()` validates and enqueues without touching storage. A background
//! task owns the buffer and flushes it when it reaches `max_batch_size`, on
//! every `flush_interval` tick, on `flush()` and on `close()`.

use date_range::Range;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error};

use super::directory::ActorDirectory;
use super::handle::{RecordError, RecordHandle, RecordOutcome, RecordResponse, Responder};
use super::report::{CloseReport, FlushReport, FlushTrigger};
use super::strategy::EventTypeStrategy;
use crate::config::RecorderConfig;
use crate::database::models::EventRow;
use crate::database::repositories::EventRepository;
use crate::domain::{
    ArtifactKey, ArtifactNamespace, ArtifactScope, ArtifactType, Event, EventType,
    IncompleteEvent,
};
use crate::{Error, Result};

const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Per-session write options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderOptions {
    /// Replace rows whose dedup key already exists instead of skipping.
    #[serde(default)]
    pub overwrite_existing_events: bool,
}

struct Pending {
    event: IncompleteEvent,
    source_id: String,
    overwrite: bool,
    responder: Responder,
}

enum Command {
    Record(Pending),
    Flush(oneshot::Sender<FlushReport>),
    Close(oneshot::Sender<CloseReport>),
}

#[derive(Default)]
struct Session {
    strategies: HashMap<EventType, Arc<dyn EventTypeStrategy>>,
    scope: ArtifactScope,
    range: Option<Range>,
    options: RecorderOptions,
}

struct Inner {
    session: RwLock<Session>,
    events: Arc<dyn EventRepository>,
    tx: mpsc::UnboundedSender<Command>,
    reports: broadcast::Sender<FlushReport>,
    closed: AtomicBool,
    next_handle_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to one recorder session.
///
/// Dropping every clone without `close()` still flushes what is buffered.
#[derive(Clone)]
pub struct EventRecorder {
    inner: Arc<Inner>,
}

impl EventRecorder {
    /// Start a recorder session. Must be called inside a Tokio runtime.
    pub fn new(
        directory: Arc<ActorDirectory>,
        events: Arc<dyn EventRepository>,
        config: RecorderConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);

        let flusher = Flusher {
            directory,
            events: events.clone(),
            reports: reports.clone(),
            next_flush_id: 0,
        };
        let task = tokio::spawn(run_flush_loop(rx, config, flusher));

        Self {
            inner: Arc::new(Inner {
                session: RwLock::new(Session::default()),
                events,
                tx,
                reports,
                closed: AtomicBool::new(false),
                next_handle_id: AtomicU64::new(0),
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Install the identity strategy for an event type. Recording an
    /// unregistered type is rejected.
    pub fn register_event_type<S>(&self, strategy: S)
    where
        S: EventTypeStrategy + 'static,
    {
        let event_type = strategy.event_type().clone();
        debug!(%event_type, "Registered event type");
        self.inner
            .session
            .write()
            .strategies
            .insert(event_type, Arc::new(strategy));
    }

    /// Restrict the artifacts events may reference. Empty lists mean unrestricted.
    pub fn set_actor_scope(&self, namespaces: &[ArtifactNamespace], types: &[ArtifactType]) {
        self.inner.session.write().scope = ArtifactScope::new(namespaces.to_vec(), types.to_vec());
    }

    /// Restrict event times to `range`.
    pub fn set_range(&self, range: Range) {
        self.inner.session.write().range = Some(range);
    }

    pub fn set_options(&self, options: RecorderOptions) {
        self.inner.session.write().options = options;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stored events of a registered type, limited to the session range when
    /// one is set. Used to backfill from what earlier sessions wrote.
    pub async fn stored_events(&self, event_type: &EventType) -> Result<Vec<Event>> {
        let filter = {
            let session = self.inner.session.read();
            let strategy = session.strategies.get(event_type).ok_or_else(|| {
                Error::validation(format!("event type {event_type} is not registered"))
            })?;
            let filter = strategy.all();
            match session.range {
                Some(range) => filter.with_range(range),
                None => filter,
            }
        };
        self.inner.events.list(&filter).await
    }

    /// Validate and enqueue an event. Never waits on storage.
    pub fn record(&self, event: IncompleteEvent) -> Result<RecordHandle> {
        if self.is_closed() {
            return Err(Error::Recorder("recorder is closed".to_string()));
        }

        let (source_id, overwrite) = {
            let session = self.inner.session.read();
            let strategy = session.strategies.get(&event.event_type).ok_or_else(|| {
                Error::validation(format!("event type {} is not registered", event.event_type))
            })?;

            if let Some(key) = event.artifacts().find(|key| !session.scope.allows(key)) {
                return Err(Error::validation(format!(
                    "artifact {key} is outside the recorder's actor scope"
                )));
            }

            if let Some(range) = &session.range
                && !range.contains_instant(event.time)
            {
                return Err(Error::validation(format!(
                    "event time {} is outside the recorder's range {range}",
                    event.time.to_rfc3339()
                )));
            }

            let source_id = strategy.source_id_for(&event);
            if source_id.is_empty() {
                return Err(Error::validation(format!(
                    "event of type {} has an empty source id",
                    event.event_type
                )));
            }
            (source_id, session.options.overwrite_existing_events)
        };

        let id = self.inner.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let (handle, responder) = RecordHandle::new(id);
        self.inner
            .tx
            .send(Command::Record(Pending {
                event,
                source_id,
                overwrite,
                responder,
            }))
            .map_err(|_| Error::Recorder("recorder is closed".to_string()))?;

        Ok(handle)
    }

    /// Receive a [`FlushReport`] for every non-empty flush from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FlushReport> {
        self.inner.reports.subscribe()
    }

    /// Flush whatever is buffered and return that flush's report.
    pub async fn flush(&self) -> Result<FlushReport> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Flush(tx))
            .map_err(|_| Error::Recorder("recorder is closed".to_string()))?;
        rx.await
            .map_err(|_| Error::Recorder("recorder task stopped".to_string()))
    }

    /// Flush the remaining buffer, resolve every pending handle and stop the
    /// background task. Later `record()` calls are rejected.
    pub async fn close(&self) -> Result<CloseReport> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Recorder("recorder is already closed".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Command::Close(tx))
            .map_err(|_| Error::Recorder("recorder task stopped".to_string()))?;
        let report = rx
            .await
            .map_err(|_| Error::Recorder("recorder task stopped".to_string()))?;

        let task = self.inner.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!("Recorder task ended abnormally: {}", e);
        }

        Ok(report)
    }
}

async fn run_flush_loop(
    mut rx: mpsc::UnboundedReceiver<Command>,
    config: RecorderConfig,
    mut flusher: Flusher,
) {
    let mut buffer: Vec<Pending> = Vec::new();
    let mut summary = CloseReport::default();
    let mut flush_timer = interval(config.flush_interval());
    flush_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    flush_timer.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(Command::Record(pending)) => {
                        buffer.push(pending);
                        if buffer.len() >= config.max_batch_size {
                            let report = flusher.flush(std::mem::take(&mut buffer), FlushTrigger::Size).await;
                            summary.absorb(&report);
                        }
                    }
                    Some(Command::Flush(reply)) => {
                        let report = flusher.flush(std::mem::take(&mut buffer), FlushTrigger::Explicit).await;
                        summary.absorb(&report);
                        let _ = reply.send(report);
                    }
                    Some(Command::Close(reply)) => {
                        let report = flusher.flush(std::mem::take(&mut buffer), FlushTrigger::Close).await;
                        summary.absorb(&report);
                        let _ = reply.send(summary);
                        break;
                    }
                    None => {
                        // Every handle was dropped without close().
                        if !buffer.is_empty() {
                            flusher.flush(std::mem::take(&mut buffer), FlushTrigger::Close).await;
                        }
                        break;
                    }
                }
            }

            _ = flush_timer.tick() => {
                if !buffer.is_empty() {
                    let report = flusher.flush(std::mem::take(&mut buffer), FlushTrigger::Interval).await;
                    summary.absorb(&report);
                }
            }
        }
    }

    debug!("Recorder flush loop stopped");
}

/// A record's dedup group within one batch.
struct Group {
    type_name: String,
    source_id: String,
    /// Index into the batch of the record that gets written.
    keeper: usize,
}

struct Flusher {
    directory: Arc<ActorDirectory>,
    events: Arc<dyn EventRepository>,
    reports: broadcast::Sender<FlushReport>,
    next_flush_id: u64,
}

impl Flusher {
    async fn flush(&mut self, batch: Vec<Pending>, trigger: FlushTrigger) -> FlushReport {
        let flush_id = self.next_flush_id;
        self.next_flush_id += 1;

        let mut report = FlushReport::empty(flush_id, trigger);
        if batch.is_empty() {
            return report;
        }
        report.records = batch.len();

        match self.write(&batch).await {
            Ok(responses) => {
                for (pending, response) in batch.into_iter().zip(responses) {
                    match response.outcome {
                        RecordOutcome::Inserted => report.inserted += 1,
                        RecordOutcome::Updated => report.updated += 1,
                        RecordOutcome::Skipped => report.skipped += 1,
                    }
                    let _ = pending.responder.send(Ok(response));
                }
                debug!(
                    flush_id,
                    %trigger,
                    records = report.records,
                    inserted = report.inserted,
                    updated = report.updated,
                    skipped = report.skipped,
                    "Flushed event batch"
                );
            }
            Err(e) => {
                let message = e.to_string();
                error!(flush_id, %trigger, records = report.records, "Event batch flush failed: {}", message);
                for pending in batch {
                    let _ = pending.responder.send(Err(RecordError::Flush(message.clone())));
                }
                report.error = Some(message);
            }
        }

        let _ = self.reports.send(report.clone());
        report
    }

    /// Persist one batch and return a response per record, in batch order.
    async fn write(&self, batch: &[Pending]) -> Result<Vec<RecordResponse>> {
        // Artifact ids
        let mut keys: Vec<ArtifactKey> = Vec::new();
        let mut seen: HashSet<&ArtifactKey> = HashSet::new();
        for pending in batch {
            for key in pending.event.artifacts() {
                if seen.insert(key) {
                    keys.push(key.clone());
                }
            }
        }
        let ids = self.directory.resolve(&keys).await?;
        let id_of = |key: &ArtifactKey| {
            ids.get(key)
                .copied()
                .ok_or_else(|| Error::Recorder(format!("artifact {key} was not resolved")))
        };

        // In-batch duplicates: first wins, unless a later record overwrites.
        let mut groups: Vec<Group> = Vec::new();
        let mut group_of_key: HashMap<(&str, &str), usize> = HashMap::new();
        let mut group_of_record: Vec<usize> = Vec::with_capacity(batch.len());
        for (idx, pending) in batch.iter().enumerate() {
            let key = (
                pending.event.event_type.name.as_str(),
                pending.source_id.as_str(),
            );
            let group = match group_of_key.get(&key) {
                Some(&group) => {
                    if pending.overwrite {
                        groups[group].keeper = idx;
                    }
                    group
                }
                None => {
                    groups.push(Group {
                        type_name: key.0.to_string(),
                        source_id: key.1.to_string(),
                        keeper: idx,
                    });
                    group_of_key.insert(key, groups.len() - 1);
                    groups.len() - 1
                }
            };
            group_of_record.push(group);
        }

        // Existing rows, per type.
        let mut source_ids_by_type: HashMap<&str, Vec<String>> = HashMap::new();
        for group in &groups {
            source_ids_by_type
                .entry(group.type_name.as_str())
                .or_default()
                .push(group.source_id.clone());
        }
        let mut existing: HashMap<(String, String), i64> = HashMap::new();
        for (type_name, source_ids) in source_ids_by_type {
            for (source_id, id) in self.events.find_existing(type_name, &source_ids).await? {
                existing.insert((type_name.to_string(), source_id), id);
            }
        }

        let mut outcomes: Vec<Option<RecordResponse>> = vec![None; groups.len()];
        let mut inserts = Vec::new();
        let mut inserted_groups = Vec::new();
        let mut updates = Vec::new();
        for (group_idx, group) in groups.iter().enumerate() {
            let keeper = &batch[group.keeper];
            let to_id = id_of(&keeper.event.to)?;
            let from_id = keeper.event.from.as_ref().map(&id_of).transpose()?;
            let mut row = EventRow::from_parts(&keeper.event, group.source_id.clone(), to_id, from_id)?;

            match existing.get(&(group.type_name.clone(), group.source_id.clone())) {
                Some(&event_id) if keeper.overwrite => {
                    row.id = Some(event_id);
                    updates.push(row);
                    outcomes[group_idx] = Some(RecordResponse {
                        event_id,
                        outcome: RecordOutcome::Updated,
                    });
                }
                Some(&event_id) => {
                    outcomes[group_idx] = Some(RecordResponse {
                        event_id,
                        outcome: RecordOutcome::Skipped,
                    });
                }
                None => {
                    inserts.push(row);
                    inserted_groups.push(group_idx);
                }
            }
        }

        let written = self.events.write_batch(&inserts, &updates).await?;
        for (group_idx, written) in inserted_groups.into_iter().zip(written) {
            outcomes[group_idx] = Some(RecordResponse {
                event_id: written.id,
                outcome: if written.inserted {
                    RecordOutcome::Inserted
                } else {
                    RecordOutcome::Skipped
                },
            });
        }

        (0..batch.len())
            .map(|idx| {
                let group_idx = group_of_record[idx];
                let response = outcomes[group_idx].ok_or_else(|| {
                    Error::Recorder(format!("no outcome for record {idx} of the batch"))
                })?;
                if groups[group_idx].keeper == idx {
                    Ok(response)
                } else {
                    Ok(RecordResponse {
                        event_id: response.event_id,
                        outcome: RecordOutcome::Skipped,
                    })
                }
            })
            .collect()
    }
}
