#![forbid(unsafe_code)]
//! Sequence execution engine.
//!
//! A [`SequenceController`] owns at most one live sequence (the ledger) plus the
//! [`HistoryArchive`] of terminated runs. Every mutating call is addressed by the
//! [`SequenceId`] minted at [`SequenceController::start`]; calls bearing any other
//! identity are dropped as [`Mutation::Stale`]. Asynchronous drivers share the
//! controller through a [`ControllerHandle`], which serializes operations and
//! publishes an [`EngineSnapshot`] after every applied mutation.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::sync::watch;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Open-ended, insertion-ordered step payload.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SequenceId(pub Ulid);

impl SequenceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SequenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Completed,
    Error,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One unit of simulated work inside a sequence.
///
/// The shape is fixed once authored; the engine only rewrites `status`,
/// `payload` and the timing fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub label: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTimeUtc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTimeUtc>,
}

impl Step {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            source: source.into(),
            target: None,
            action: action.into(),
            payload: None,
            explanation: None,
            status: StepStatus::Pending,
            activated_at: None,
            finished_at: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    /// Shallow merge: keys in `patch` overwrite, all other keys are preserved.
    pub fn merge_payload(&mut self, patch: Payload) {
        let payload = self.payload.get_or_insert_with(Payload::new);
        for (key, value) in patch {
            payload.insert(key, value);
        }
    }

    /// Wall-clock time between activation and the terminal status, if both are known.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        let (Some(started), Some(finished)) = (self.activated_at, self.finished_at) else {
            return None;
        };
        let millis = (finished - started).whole_milliseconds();
        if millis <= 0 {
            Some(0)
        } else {
            u64::try_from(millis).ok()
        }
    }

    fn activate(&mut self, at: DateTimeUtc) {
        self.status = StepStatus::Active;
        self.activated_at = Some(at);
    }

    fn finish(&mut self, status: StepStatus, at: DateTimeUtc) {
        self.status = status;
        self.finished_at.get_or_insert(at);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SequenceOutcome {
    Completed,
    Failed,
}

impl SequenceOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub sequence_id: SequenceId,
    pub kind: String,
    pub outcome: SequenceOutcome,
    pub steps: Vec<Step>,
    pub finished_at: DateTimeUtc,
}

/// Terminated sequences, most recent first.
#[derive(Debug, Clone, Default)]
pub struct HistoryArchive {
    entries: VecDeque<HistoryEntry>,
    capacity: Option<usize>,
}

impl HistoryArchive {
    /// `capacity = None` keeps every entry; `Some(0)` is raised to 1 so the
    /// latest terminated run is always retained.
    #[must_use]
    pub fn with_capacity_limit(capacity: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.map(|limit| limit.max(1)),
        }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.entries.push_front(entry);
        if let Some(capacity) = self.capacity {
            self.entries.truncate(capacity);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}

/// The ledger of the one authoritative sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSequence {
    id: SequenceId,
    kind: String,
    steps: Vec<Step>,
    cursor: usize,
    started_at: DateTimeUtc,
}

impl LiveSequence {
    #[must_use]
    pub fn id(&self) -> SequenceId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[must_use]
    pub fn started_at(&self) -> DateTimeUtc {
        self.started_at
    }

    #[must_use]
    pub fn active_step(&self) -> Option<&Step> {
        self.steps.get(self.cursor)
    }
}

/// Whether a mutating call took effect.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[must_use]
pub enum Mutation {
    Applied,
    /// The identity did not address the live sequence; nothing changed.
    Stale,
}

impl Mutation {
    #[must_use]
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ControllerConfig {
    pub history_capacity: Option<usize>,
}

/// Read-only view handed to renderers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineSnapshot {
    pub running: bool,
    pub sequence_id: Option<SequenceId>,
    pub kind: Option<String>,
    pub steps: Vec<Step>,
    pub cursor: Option<usize>,
    pub history: Vec<HistoryEntry>,
}

impl EngineSnapshot {
    #[must_use]
    pub fn active_step(&self) -> Option<&Step> {
        self.cursor.and_then(|cursor| self.steps.get(cursor))
    }
}

#[derive(Debug, Default)]
pub struct SequenceController {
    live: Option<LiveSequence>,
    history: HistoryArchive,
}

impl SequenceController {
    #[must_use]
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            live: None,
            history: HistoryArchive::with_capacity_limit(config.history_capacity),
        }
    }

    /// Begin a new sequence, superseding any live one without archiving it.
    ///
    /// An empty step list is archived as [`SequenceOutcome::Completed`] at once;
    /// the returned identity is then already terminal.
    pub fn start(&mut self, kind: impl Into<String>, steps: Vec<Step>) -> SequenceId {
        let id = SequenceId::new();
        let kind = kind.into();
        let now = OffsetDateTime::now_utc();

        if let Some(previous) = self.live.take() {
            tracing::debug!(
                superseded = %previous.id,
                kind = %previous.kind,
                cursor = previous.cursor,
                "live sequence superseded"
            );
        }

        let mut steps: Vec<Step> = steps
            .into_iter()
            .map(|mut step| {
                step.status = StepStatus::Pending;
                step.activated_at = None;
                step.finished_at = None;
                step
            })
            .collect();

        if steps.is_empty() {
            tracing::debug!(sequence_id = %id, %kind, "empty sequence archived on start");
            self.history.record(HistoryEntry {
                sequence_id: id,
                kind,
                outcome: SequenceOutcome::Completed,
                steps,
                finished_at: now,
            });
            return id;
        }

        steps[0].activate(now);
        tracing::debug!(sequence_id = %id, %kind, steps = steps.len(), "sequence started");
        self.live = Some(LiveSequence {
            id,
            kind,
            steps,
            cursor: 0,
            started_at: now,
        });
        id
    }

    /// Move the cursor forward; stepping past the last step archives the run as completed.
    ///
    /// A step left while still `active` is closed as `completed`, so the ledger
    /// never holds more than one active step.
    pub fn advance(&mut self, id: SequenceId) -> Mutation {
        let Some(live) = self.live_for(id, "advance") else {
            return Mutation::Stale;
        };

        let now = OffsetDateTime::now_utc();
        if let Some(departing) = live.steps.get_mut(live.cursor) {
            if departing.status == StepStatus::Active {
                departing.finish(StepStatus::Completed, now);
            }
        }

        let next = live.cursor + 1;
        if next < live.steps.len() {
            live.cursor = next;
            live.steps[next].activate(now);
            tracing::debug!(sequence_id = %id, cursor = next, "step activated");
            return Mutation::Applied;
        }

        live.cursor = live.steps.len();
        self.archive(SequenceOutcome::Completed);
        Mutation::Applied
    }

    /// Mark the active step completed, shallow-merging `patch` into its payload.
    ///
    /// The cursor does not move; callers follow up with [`Self::advance`].
    pub fn complete_active(&mut self, id: SequenceId, patch: Option<Payload>) -> Mutation {
        let Some(live) = self.live_for(id, "complete_active") else {
            return Mutation::Stale;
        };

        let cursor = live.cursor;
        let Some(step) = live.steps.get_mut(cursor) else {
            tracing::error!(sequence_id = %id, cursor, "live cursor outside step list");
            return Mutation::Stale;
        };

        step.finish(StepStatus::Completed, OffsetDateTime::now_utc());
        if let Some(patch) = patch {
            step.merge_payload(patch);
        }
        tracing::debug!(sequence_id = %id, cursor, step = %step.id, "step completed");
        Mutation::Applied
    }

    /// Mark the active step as errored and archive the run as failed.
    ///
    /// Steps after the failed one keep `pending` in the archived snapshot.
    pub fn fail_active(&mut self, id: SequenceId, error: Option<&str>) -> Mutation {
        let Some(live) = self.live_for(id, "fail_active") else {
            return Mutation::Stale;
        };

        let cursor = live.cursor;
        let Some(step) = live.steps.get_mut(cursor) else {
            tracing::error!(sequence_id = %id, cursor, "live cursor outside step list");
            return Mutation::Stale;
        };

        step.finish(StepStatus::Error, OffsetDateTime::now_utc());
        if let Some(message) = error {
            let mut patch = Payload::new();
            patch.insert("error".to_string(), Value::String(message.to_string()));
            step.merge_payload(patch);
        }
        tracing::debug!(sequence_id = %id, cursor, step = %step.id, error, "step failed");

        self.archive(SequenceOutcome::Failed);
        Mutation::Applied
    }

    /// Drop the live sequence without archiving. Returns the discarded identity.
    pub fn reset(&mut self) -> Option<SequenceId> {
        let discarded = self.live.take().map(|live| live.id);
        if let Some(id) = discarded {
            tracing::debug!(sequence_id = %id, "live sequence reset");
        }
        discarded
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    #[must_use]
    pub fn live(&self) -> Option<&LiveSequence> {
        self.live.as_ref()
    }

    #[must_use]
    pub fn history(&self) -> &HistoryArchive {
        &self.history
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.live.is_some()
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        let history = self.history.to_vec();
        match &self.live {
            Some(live) => EngineSnapshot {
                running: true,
                sequence_id: Some(live.id),
                kind: Some(live.kind.clone()),
                steps: live.steps.clone(),
                cursor: Some(live.cursor),
                history,
            },
            None => EngineSnapshot {
                history,
                ..EngineSnapshot::default()
            },
        }
    }

    fn live_for(&mut self, id: SequenceId, operation: &'static str) -> Option<&mut LiveSequence> {
        match self.live.as_mut() {
            Some(live) if live.id == id => Some(live),
            _ => {
                tracing::trace!(sequence_id = %id, operation, "stale call dropped");
                None
            }
        }
    }

    fn archive(&mut self, outcome: SequenceOutcome) {
        let Some(live) = self.live.take() else {
            return;
        };
        tracing::info!(
            sequence_id = %live.id,
            kind = %live.kind,
            outcome = outcome.as_str(),
            steps = live.steps.len(),
            "sequence archived"
        );
        self.history.record(HistoryEntry {
            sequence_id: live.id,
            kind: live.kind,
            outcome,
            steps: live.steps,
            finished_at: OffsetDateTime::now_utc(),
        });
    }
}

/// Shared, serialized access to one [`SequenceController`].
///
/// Each operation runs under the lock and republishes the snapshot before the
/// lock is released, so subscribers only ever see whole states.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    inner: Arc<Mutex<SequenceController>>,
    updates: Arc<watch::Sender<EngineSnapshot>>,
}

impl Default for ControllerHandle {
    fn default() -> Self {
        Self::new(&ControllerConfig::default())
    }
}

impl ControllerHandle {
    #[must_use]
    pub fn new(config: &ControllerConfig) -> Self {
        let controller = SequenceController::new(config);
        let (updates, _) = watch::channel(controller.snapshot());
        Self {
            inner: Arc::new(Mutex::new(controller)),
            updates: Arc::new(updates),
        }
    }

    pub fn start(&self, kind: impl Into<String>, steps: Vec<Step>) -> SequenceId {
        let mut controller = self.inner.lock();
        let id = controller.start(kind, steps);
        self.publish(&controller);
        id
    }

    pub fn advance(&self, id: SequenceId) -> Mutation {
        self.mutate(|controller| controller.advance(id))
    }

    pub fn complete_active(&self, id: SequenceId, patch: Option<Payload>) -> Mutation {
        self.mutate(|controller| controller.complete_active(id, patch))
    }

    pub fn fail_active(&self, id: SequenceId, error: Option<&str>) -> Mutation {
        self.mutate(|controller| controller.fail_active(id, error))
    }

    pub fn reset(&self) -> Option<SequenceId> {
        let mut controller = self.inner.lock();
        let discarded = controller.reset();
        if discarded.is_some() {
            self.publish(&controller);
        }
        discarded
    }

    pub fn clear_history(&self) {
        let mut controller = self.inner.lock();
        controller.clear_history();
        self.publish(&controller);
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineSnapshot {
        self.inner.lock().snapshot()
    }

    #[must_use]
    pub fn is_live(&self, id: SequenceId) -> bool {
        self.inner
            .lock()
            .live()
            .is_some_and(|live| live.id() == id)
    }

    /// Receiver that observes every published snapshot (latest value wins).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.updates.subscribe()
    }

    fn mutate(&self, op: impl FnOnce(&mut SequenceController) -> Mutation) -> Mutation {
        let mut controller = self.inner.lock();
        let outcome = op(&mut controller);
        if outcome.is_applied() {
            self.publish(&controller);
        }
        outcome
    }

    fn publish(&self, controller: &SequenceController) {
        self.updates.send_replace(controller.snapshot());
    }
}
