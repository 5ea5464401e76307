use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kioku_core::model::{
    Facet, Outcome, SchedulingState, Stage, TraceId, Unit, UnitId, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

//
// ─── RECORDS ───────────────────────────────────────────────────────────────────
//

/// A facet whose review is due.
#[derive(Debug, Clone, PartialEq)]
pub struct DueFacet {
    pub unit_id: UnitId,
    pub facet: Facet,
    pub state: SchedulingState,
    pub due_at: DateTime<Utc>,
}

/// Persisted scheduling state of one (user, unit, facet) triple.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingRecord {
    pub user_id: UserId,
    pub unit_id: UnitId,
    pub facet: Facet,
    pub state: SchedulingState,
    pub due_at: DateTime<Utc>,
    pub last_review_at: Option<DateTime<Utc>>,
}

/// One committed answer, kept for history and analytics.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptLogRecord {
    pub id: Option<i64>,
    pub user_id: UserId,
    pub unit_id: UnitId,
    pub facet: Facet,
    pub outcome: Outcome,
    pub resulting_state: SchedulingState,
    pub due_at: DateTime<Utc>,
    pub reviewed_at: DateTime<Utc>,
}

/// What kind of session a trace belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Review,
    Discovery,
}

impl TraceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TraceKind::Review => "review",
            TraceKind::Discovery => "discovery",
        }
    }
}

/// Status of one item inside a session trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionItemStatus {
    Pending,
    Correct,
    Incorrect,
}

impl SessionItemStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionItemStatus::Pending => "pending",
            SessionItemStatus::Correct => "correct",
            SessionItemStatus::Incorrect => "incorrect",
        }
    }
}

impl FromStr for SessionItemStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "correct" => Ok(Self::Correct),
            "incorrect" => Ok(Self::Incorrect),
            _ => Err(StorageError::Serialization(format!("invalid item status: {s}"))),
        }
    }
}

/// Latest recorded outcome of an item within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionItemOutcome {
    pub status: SessionItemStatus,
    pub attempts: u32,
    pub failures: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Advisory session trace header.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTraceRecord {
    pub id: TraceId,
    pub user_id: UserId,
    pub kind: TraceKind,
    pub total_items: u32,
    pub completed_items: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items: Vec<(UnitId, Facet, SessionItemOutcome)>,
}

/// Progress of one unit inside a lesson batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonItemStatus {
    Unseen,
    Viewed,
    QuizPassed,
}

impl LessonItemStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LessonItemStatus::Unseen => "unseen",
            LessonItemStatus::Viewed => "viewed",
            LessonItemStatus::QuizPassed => "quiz_passed",
        }
    }
}

impl FromStr for LessonItemStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unseen" => Ok(Self::Unseen),
            "viewed" => Ok(Self::Viewed),
            "quiz_passed" => Ok(Self::QuizPassed),
            _ => Err(StorageError::Serialization(format!("invalid lesson status: {s}"))),
        }
    }
}

/// Mastery counts for one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LevelMastery {
    pub total: u32,
    pub mastered: u32,
}

impl LevelMastery {
    /// Share of mastered units in `[0, 1]`; an empty level is never mastered.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.mastered) / f64::from(self.total)
        }
    }
}

//
// ─── TRAITS ────────────────────────────────────────────────────────────────────
//

/// Curriculum access. Content itself is authored elsewhere.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    /// Insert or replace a unit.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the unit cannot be stored.
    async fn upsert_unit(&self, unit: &Unit) -> Result<(), StorageError>;

    /// Fetch units by id. Ids with no unit are skipped.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn get_units(&self, ids: &[UnitId]) -> Result<Vec<Unit>, StorageError>;

    /// Units the user has no scheduling state for, ordered by level then id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn fetch_new_units(
        &self,
        user: UserId,
        limit: u32,
        level: Option<u32>,
    ) -> Result<Vec<Unit>, StorageError>;
}

#[async_trait]
pub trait SchedulingRepository: Send + Sync {
    /// Facets with `due_at <= now` that are not burned, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn fetch_due_facets(
        &self,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueFacet>, StorageError>;

    /// Insert or overwrite the state keyed by (user, unit, facet).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write fails.
    async fn upsert_scheduling_state(&self, record: &SchedulingRecord) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn get_scheduling_state(
        &self,
        user: UserId,
        unit: UnitId,
        facet: Facet,
    ) -> Result<Option<SchedulingRecord>, StorageError>;
}

#[async_trait]
pub trait AttemptLogRepository: Send + Sync {
    /// Append a log entry and return its id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the log cannot be stored.
    async fn append_attempt_log(&self, log: &AttemptLogRecord) -> Result<i64, StorageError>;

    /// Logs for one unit, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn attempts_for_unit(
        &self,
        user: UserId,
        unit: UnitId,
    ) -> Result<Vec<AttemptLogRecord>, StorageError>;
}

#[async_trait]
pub trait SessionTraceRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` if the trace cannot be created.
    async fn create_session_trace(
        &self,
        user: UserId,
        kind: TraceKind,
        total_items: u32,
        started_at: DateTime<Utc>,
    ) -> Result<TraceId, StorageError>;

    /// Upsert the latest outcome for (trace, unit, facet).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` for an unknown trace.
    async fn record_session_item_outcome(
        &self,
        trace: TraceId,
        unit: UnitId,
        facet: Facet,
        outcome: &SessionItemOutcome,
    ) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` for an unknown trace.
    async fn mark_session_complete(
        &self,
        trace: TraceId,
        completed_items: u32,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` for an unknown trace.
    async fn get_session_trace(&self, trace: TraceId) -> Result<SessionTraceRecord, StorageError>;
}

#[async_trait]
pub trait LessonRepository: Send + Sync {
    /// Record a new lesson batch with every unit `Unseen`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the batch cannot be stored.
    async fn create_lesson_batch(
        &self,
        user: UserId,
        level: u32,
        units: &[UnitId],
        created_at: DateTime<Utc>,
    ) -> Result<TraceId, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the batch does not contain the unit.
    async fn update_lesson_item_status(
        &self,
        batch: TraceId,
        unit: UnitId,
        status: LessonItemStatus,
    ) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn lesson_item_statuses(
        &self,
        batch: TraceId,
    ) -> Result<Vec<(UnitId, LessonItemStatus)>, StorageError>;

    /// Number of batches the user started at or after `since`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn count_batches_since(
        &self,
        user: UserId,
        since: DateTime<Utc>,
    ) -> Result<u32, StorageError>;
}

/// Learner level bookkeeping used by the level-unlock task.
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    /// Current unlocked level; 1 when the user has none recorded.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn current_level(&self, user: UserId) -> Result<u32, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn set_level(&self, user: UserId, level: u32) -> Result<(), StorageError>;

    /// A unit is mastered when it has states and all of them are Review or Burned.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn level_mastery(&self, user: UserId, level: u32) -> Result<LevelMastery, StorageError>;
}

//
// ─── IN-MEMORY ADAPTER ─────────────────────────────────────────────────────────
//

type StateKey = (UserId, UnitId, Facet);

#[derive(Default)]
struct TraceEntry {
    user_id: Option<UserId>,
    kind: Option<TraceKind>,
    total_items: u32,
    completed_items: u32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    items: BTreeMap<(UnitId, Facet), SessionItemOutcome>,
}

struct LessonBatchEntry {
    user_id: UserId,
    created_at: DateTime<Utc>,
    items: Vec<(UnitId, LessonItemStatus)>,
}

/// Simple in-memory repository implementation for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    units: Arc<Mutex<BTreeMap<UnitId, Unit>>>,
    states: Arc<Mutex<HashMap<StateKey, SchedulingRecord>>>,
    attempts: Arc<Mutex<Vec<AttemptLogRecord>>>,
    traces: Arc<Mutex<BTreeMap<TraceId, TraceEntry>>>,
    lessons: Arc<Mutex<BTreeMap<TraceId, LessonBatchEntry>>>,
    levels: Arc<Mutex<HashMap<UserId, u32>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    mutex
        .lock()
        .map_err(|e| StorageError::Connection(e.to_string()))
}

fn next_id<V>(map: &BTreeMap<TraceId, V>) -> TraceId {
    let last = map.keys().next_back().map_or(0, |id| id.value());
    TraceId::new(last + 1)
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attempt logs stored so far.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the lock is poisoned.
    pub fn attempt_count(&self) -> Result<usize, StorageError> {
        Ok(lock(&self.attempts)?.len())
    }
}

#[async_trait]
impl ContentRepository for InMemoryRepository {
    async fn upsert_unit(&self, unit: &Unit) -> Result<(), StorageError> {
        lock(&self.units)?.insert(unit.id(), unit.clone());
        Ok(())
    }

    async fn get_units(&self, ids: &[UnitId]) -> Result<Vec<Unit>, StorageError> {
        let guard = lock(&self.units)?;
        Ok(ids.iter().filter_map(|id| guard.get(id).cloned()).collect())
    }

    async fn fetch_new_units(
        &self,
        user: UserId,
        limit: u32,
        level: Option<u32>,
    ) -> Result<Vec<Unit>, StorageError> {
        let started: Vec<UnitId> = lock(&self.states)?
            .keys()
            .filter(|(u, _, _)| *u == user)
            .map(|(_, unit, _)| *unit)
            .collect();
        let guard = lock(&self.units)?;
        let mut fresh: Vec<Unit> = guard
            .values()
            .filter(|unit| !started.contains(&unit.id()))
            .filter(|unit| level.is_none_or(|l| unit.level() == l))
            .cloned()
            .collect();
        fresh.sort_by_key(|unit| (unit.level(), unit.id()));
        fresh.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(fresh)
    }
}

#[async_trait]
impl SchedulingRepository for InMemoryRepository {
    async fn fetch_due_facets(
        &self,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueFacet>, StorageError> {
        let guard = lock(&self.states)?;
        let mut due: Vec<DueFacet> = guard
            .values()
            .filter(|r| r.user_id == user && r.due_at <= now && r.state.stage != Stage::Burned)
            .map(|r| DueFacet {
                unit_id: r.unit_id,
                facet: r.facet,
                state: r.state,
                due_at: r.due_at,
            })
            .collect();
        due.sort_by_key(|d| (d.due_at, d.unit_id, d.facet));
        Ok(due)
    }

    async fn upsert_scheduling_state(&self, record: &SchedulingRecord) -> Result<(), StorageError> {
        lock(&self.states)?.insert(
            (record.user_id, record.unit_id, record.facet),
            record.clone(),
        );
        Ok(())
    }

    async fn get_scheduling_state(
        &self,
        user: UserId,
        unit: UnitId,
        facet: Facet,
    ) -> Result<Option<SchedulingRecord>, StorageError> {
        Ok(lock(&self.states)?.get(&(user, unit, facet)).cloned())
    }
}

#[async_trait]
impl AttemptLogRepository for InMemoryRepository {
    async fn append_attempt_log(&self, log: &AttemptLogRecord) -> Result<i64, StorageError> {
        let mut guard = lock(&self.attempts)?;
        let id = i64::try_from(guard.len() + 1)
            .map_err(|_| StorageError::Serialization("attempt id overflow".into()))?;
        let mut stored = log.clone();
        stored.id = Some(id);
        guard.push(stored);
        Ok(id)
    }

    async fn attempts_for_unit(
        &self,
        user: UserId,
        unit: UnitId,
    ) -> Result<Vec<AttemptLogRecord>, StorageError> {
        let guard = lock(&self.attempts)?;
        Ok(guard
            .iter()
            .filter(|log| log.user_id == user && log.unit_id == unit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SessionTraceRepository for InMemoryRepository {
    async fn create_session_trace(
        &self,
        user: UserId,
        kind: TraceKind,
        total_items: u32,
        started_at: DateTime<Utc>,
    ) -> Result<TraceId, StorageError> {
        let mut guard = lock(&self.traces)?;
        let id = next_id(&guard);
        guard.insert(
            id,
            TraceEntry {
                user_id: Some(user),
                kind: Some(kind),
                total_items,
                started_at: Some(started_at),
                ..TraceEntry::default()
            },
        );
        Ok(id)
    }

    async fn record_session_item_outcome(
        &self,
        trace: TraceId,
        unit: UnitId,
        facet: Facet,
        outcome: &SessionItemOutcome,
    ) -> Result<(), StorageError> {
        let mut guard = lock(&self.traces)?;
        let entry = guard.get_mut(&trace).ok_or(StorageError::NotFound)?;
        entry.items.insert((unit, facet), *outcome);
        Ok(())
    }

    async fn mark_session_complete(
        &self,
        trace: TraceId,
        completed_items: u32,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut guard = lock(&self.traces)?;
        let entry = guard.get_mut(&trace).ok_or(StorageError::NotFound)?;
        entry.completed_items = completed_items;
        entry.completed_at = Some(completed_at);
        Ok(())
    }

    async fn get_session_trace(&self, trace: TraceId) -> Result<SessionTraceRecord, StorageError> {
        let guard = lock(&self.traces)?;
        let entry = guard.get(&trace).ok_or(StorageError::NotFound)?;
        let (Some(user_id), Some(kind), Some(started_at)) =
            (entry.user_id, entry.kind, entry.started_at)
        else {
            return Err(StorageError::Serialization("incomplete trace".into()));
        };
        Ok(SessionTraceRecord {
            id: trace,
            user_id,
            kind,
            total_items: entry.total_items,
            completed_items: entry.completed_items,
            started_at,
            completed_at: entry.completed_at,
            items: entry
                .items
                .iter()
                .map(|((unit, facet), outcome)| (*unit, *facet, *outcome))
                .collect(),
        })
    }
}

#[async_trait]
impl LessonRepository for InMemoryRepository {
    async fn create_lesson_batch(
        &self,
        user: UserId,
        _level: u32,
        units: &[UnitId],
        created_at: DateTime<Utc>,
    ) -> Result<TraceId, StorageError> {
        let mut guard = lock(&self.lessons)?;
        let id = next_id(&guard);
        guard.insert(
            id,
            LessonBatchEntry {
                user_id: user,
                created_at,
                items: units
                    .iter()
                    .map(|unit| (*unit, LessonItemStatus::Unseen))
                    .collect(),
            },
        );
        Ok(id)
    }

    async fn update_lesson_item_status(
        &self,
        batch: TraceId,
        unit: UnitId,
        status: LessonItemStatus,
    ) -> Result<(), StorageError> {
        let mut guard = lock(&self.lessons)?;
        let entry = guard.get_mut(&batch).ok_or(StorageError::NotFound)?;
        let item = entry
            .items
            .iter_mut()
            .find(|(id, _)| *id == unit)
            .ok_or(StorageError::NotFound)?;
        item.1 = status;
        Ok(())
    }

    async fn lesson_item_statuses(
        &self,
        batch: TraceId,
    ) -> Result<Vec<(UnitId, LessonItemStatus)>, StorageError> {
        let guard = lock(&self.lessons)?;
        let entry = guard.get(&batch).ok_or(StorageError::NotFound)?;
        Ok(entry.items.clone())
    }

    async fn count_batches_since(
        &self,
        user: UserId,
        since: DateTime<Utc>,
    ) -> Result<u32, StorageError> {
        let guard = lock(&self.lessons)?;
        let count = guard
            .values()
            .filter(|b| b.user_id == user && b.created_at >= since)
            .count();
        u32::try_from(count).map_err(|_| StorageError::Serialization("batch count overflow".into()))
    }
}

#[async_trait]
impl ProgressRepository for InMemoryRepository {
    async fn current_level(&self, user: UserId) -> Result<u32, StorageError> {
        Ok(lock(&self.levels)?.get(&user).copied().unwrap_or(1))
    }

    async fn set_level(&self, user: UserId, level: u32) -> Result<(), StorageError> {
        lock(&self.levels)?.insert(user, level);
        Ok(())
    }

    async fn level_mastery(&self, user: UserId, level: u32) -> Result<LevelMastery, StorageError> {
        let level_units: Vec<UnitId> = lock(&self.units)?
            .values()
            .filter(|unit| unit.level() == level)
            .map(Unit::id)
            .collect();
        let states = lock(&self.states)?;
        let mut mastered = 0_u32;
        for unit in &level_units {
            let mut stages = states
                .values()
                .filter(|r| r.user_id == user && r.unit_id == *unit)
                .map(|r| r.state.stage)
                .peekable();
            if stages.peek().is_some() && stages.all(Stage::is_mastered) {
                mastered += 1;
            }
        }
        let total = u32::try_from(level_units.len())
            .map_err(|_| StorageError::Serialization("unit count overflow".into()))?;
        Ok(LevelMastery { total, mastered })
    }
}

//
// ─── AGGREGATE ─────────────────────────────────────────────────────────────────
//

/// Bundles every repository behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub content: Arc<dyn ContentRepository>,
    pub scheduling: Arc<dyn SchedulingRepository>,
    pub attempts: Arc<dyn AttemptLogRepository>,
    pub traces: Arc<dyn SessionTraceRepository>,
    pub lessons: Arc<dyn LessonRepository>,
    pub progress: Arc<dyn ProgressRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_repository(InMemoryRepository::new())
    }

    /// Uses one adapter value for every repository role.
    #[must_use]
    pub fn from_repository<R>(repo: R) -> Self
    where
        R: ContentRepository
            + SchedulingRepository
            + AttemptLogRepository
            + SessionTraceRepository
            + LessonRepository
            + ProgressRepository
            + Clone
            + 'static,
    {
        Self {
            content: Arc::new(repo.clone()),
            scheduling: Arc::new(repo.clone()),
            attempts: Arc::new(repo.clone()),
            traces: Arc::new(repo.clone()),
            lessons: Arc::new(repo.clone()),
            progress: Arc::new(repo),
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use kioku_core::model::UnitKind;
    use kioku_core::time::fixed_now;

    fn vocab(id: u64, level: u32) -> Unit {
        Unit::new(
            UnitId::new(id),
            level,
            format!("語{id}"),
            UnitKind::Vocabulary {
                meanings: vec![format!("word {id}")],
                readings: vec!["ご".into()],
            },
        )
        .unwrap()
    }

    fn record(user: UserId, unit: u64, facet: Facet, stage: Stage, due_in: i64) -> SchedulingRecord {
        SchedulingRecord {
            user_id: user,
            unit_id: UnitId::new(unit),
            facet,
            state: SchedulingState {
                stage,
                stability: 1.0,
                difficulty: 3.0,
                reps: 2,
                lapses: 0,
            },
            due_at: fixed_now() + Duration::minutes(due_in),
            last_review_at: None,
        }
    }

    #[tokio::test]
    async fn due_facets_exclude_burned_and_future_items() {
        let repo = InMemoryRepository::new();
        let user = UserId::generate();
        repo.upsert_scheduling_state(&record(user, 1, Facet::Meaning, Stage::Review, -10))
            .await
            .unwrap();
        repo.upsert_scheduling_state(&record(user, 2, Facet::Meaning, Stage::Burned, -10))
            .await
            .unwrap();
        repo.upsert_scheduling_state(&record(user, 3, Facet::Meaning, Stage::Learning, 10))
            .await
            .unwrap();
        repo.upsert_scheduling_state(&record(user, 4, Facet::Reading, Stage::Learning, -20))
            .await
            .unwrap();

        let due = repo.fetch_due_facets(user, fixed_now()).await.unwrap();
        let ids: Vec<u64> = due.iter().map(|d| d.unit_id.value()).collect();
        assert_eq!(ids, vec![4, 1]);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_facet() {
        let repo = InMemoryRepository::new();
        let user = UserId::generate();
        let mut rec = record(user, 1, Facet::Meaning, Stage::Learning, -1);
        repo.upsert_scheduling_state(&rec).await.unwrap();
        rec.state.reps = 3;
        repo.upsert_scheduling_state(&rec).await.unwrap();
        repo.upsert_scheduling_state(&rec).await.unwrap();

        let due = repo.fetch_due_facets(user, fixed_now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].state.reps, 3);
    }

    #[tokio::test]
    async fn new_units_skip_started_ones() {
        let repo = InMemoryRepository::new();
        let user = UserId::generate();
        for (id, level) in [(1, 1), (2, 1), (3, 2)] {
            repo.upsert_unit(&vocab(id, level)).await.unwrap();
        }
        repo.upsert_scheduling_state(&record(user, 1, Facet::Reading, Stage::Learning, 0))
            .await
            .unwrap();

        let fresh = repo.fetch_new_units(user, 10, None).await.unwrap();
        let ids: Vec<u64> = fresh.iter().map(|u| u.id().value()).collect();
        assert_eq!(ids, vec![2, 3]);

        let level_two = repo.fetch_new_units(user, 10, Some(2)).await.unwrap();
        assert_eq!(level_two.len(), 1);

        let other_user = repo.fetch_new_units(UserId::generate(), 2, None).await.unwrap();
        assert_eq!(other_user.len(), 2);
    }

    #[tokio::test]
    async fn level_mastery_requires_every_facet_mastered() {
        let repo = InMemoryRepository::new();
        let user = UserId::generate();
        for id in 1..=3 {
            repo.upsert_unit(&vocab(id, 1)).await.unwrap();
        }
        for facet in [Facet::Meaning, Facet::Reading] {
            repo.upsert_scheduling_state(&record(user, 1, facet, Stage::Review, 0))
                .await
                .unwrap();
        }
        repo.upsert_scheduling_state(&record(user, 2, Facet::Meaning, Stage::Burned, 0))
            .await
            .unwrap();
        repo.upsert_scheduling_state(&record(user, 2, Facet::Reading, Stage::Learning, 0))
            .await
            .unwrap();

        let mastery = repo.level_mastery(user, 1).await.unwrap();
        assert_eq!(mastery, LevelMastery { total: 3, mastered: 1 });
        assert_eq!(repo.current_level(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn trace_tracks_latest_item_outcome() {
        let repo = InMemoryRepository::new();
        let user = UserId::generate();
        let trace = repo
            .create_session_trace(user, TraceKind::Review, 2, fixed_now())
            .await
            .unwrap();
        let mut outcome = SessionItemOutcome {
            status: SessionItemStatus::Incorrect,
            attempts: 1,
            failures: 1,
            recorded_at: fixed_now(),
        };
        repo.record_session_item_outcome(trace, UnitId::new(1), Facet::Meaning, &outcome)
            .await
            .unwrap();
        outcome.status = SessionItemStatus::Correct;
        outcome.attempts = 2;
        repo.record_session_item_outcome(trace, UnitId::new(1), Facet::Meaning, &outcome)
            .await
            .unwrap();
        repo.mark_session_complete(trace, 1, fixed_now()).await.unwrap();

        let stored = repo.get_session_trace(trace).await.unwrap();
        assert_eq!(stored.items.len(), 1);
        assert_eq!(stored.items[0].2.status, SessionItemStatus::Correct);
        assert_eq!(stored.completed_items, 1);
        assert!(stored.completed_at.is_some());

        let missing = repo
            .mark_session_complete(TraceId::new(99), 0, fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(missing, StorageError::NotFound));
    }

    #[tokio::test]
    async fn lesson_batches_count_per_day() {
        let repo = InMemoryRepository::new();
        let user = UserId::generate();
        let yesterday = fixed_now() - Duration::days(1);
        repo.create_lesson_batch(user, 1, &[UnitId::new(1)], yesterday)
            .await
            .unwrap();
        let batch = repo
            .create_lesson_batch(user, 1, &[UnitId::new(2), UnitId::new(3)], fixed_now())
            .await
            .unwrap();
        repo.update_lesson_item_status(batch, UnitId::new(3), LessonItemStatus::Viewed)
            .await
            .unwrap();

        assert_eq!(
            repo.count_batches_since(user, fixed_now() - Duration::hours(1))
                .await
                .unwrap(),
            1
        );
        let statuses = repo.lesson_item_statuses(batch).await.unwrap();
        assert_eq!(
            statuses,
            vec![
                (UnitId::new(2), LessonItemStatus::Unseen),
                (UnitId::new(3), LessonItemStatus::Viewed)
            ]
        );
    }
}
