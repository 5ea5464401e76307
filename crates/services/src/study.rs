//! Caller-facing study API.
//!
//! `StudyService` owns every running session. Sessions live in registries
//! keyed by opaque ids; each controller sits behind its own async mutex, so
//! requests on one session serialise while different sessions run freely.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use kioku_core::model::{
    BatchId, ItemId, Progress, QueueItem, Rating, SessionId, Unit, UnitId, UnitType, UserId,
};
use kioku_core::{Clock, EngineConfig, SchedulingEngine, ValidationError};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use storage::repository::Storage;
use tokio::sync::Mutex as AsyncMutex;

use crate::background::{BackgroundTasks, TaskReport};
use crate::config::StudySettings;
use crate::discovery::{DiscoveryController, DiscoveryPhase};
use crate::error::{BootstrapError, SessionError};
use crate::items::ItemBuilder;
use crate::review::{AnswerFeedback, PendingFlush, ReviewQueueController};

type Registry<K, C> = Mutex<HashMap<K, Arc<AsyncMutex<C>>>>;

//
// ─── REQUESTS & RESPONSES ──────────────────────────────────────────────────────
//

/// Narrows which due facets go into a review session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReviewFilters {
    pub level: Option<u32>,
    pub kind: Option<UnitType>,
    /// Overrides `StudySettings::review_limit` when set.
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedSession {
    pub session_id: SessionId,
    pub items: Vec<QueueItem>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedBatch {
    pub batch_id: BatchId,
    pub level: u32,
    pub units: Vec<Unit>,
    pub items: Vec<QueueItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerResponse {
    pub item_id: ItemId,
    pub correct: bool,
    pub progress: Progress,
    pub persisted: bool,
    pub is_complete: bool,
    /// Next due time written by this answer, if it committed a schedule.
    pub next_due: Option<DateTime<Utc>>,
    /// Set on the answer that finished the session.
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnswerResponse {
    fn new(feedback: AnswerFeedback, completed_at: Option<DateTime<Utc>>) -> Self {
        Self {
            item_id: feedback.item_id,
            correct: feedback.correct,
            progress: feedback.progress,
            persisted: feedback.persisted,
            is_complete: feedback.is_complete,
            next_due: feedback.scheduled.map(|s| s.due_at),
            completed_at: completed_at.filter(|_| feedback.is_complete),
        }
    }
}

//
// ─── SERVICE ───────────────────────────────────────────────────────────────────
//

pub struct StudyService {
    storage: Storage,
    engine: Arc<SchedulingEngine>,
    settings: StudySettings,
    clock: Clock,
    builder: Mutex<ItemBuilder<StdRng>>,
    tasks: BackgroundTasks,
    reviews: Registry<SessionId, ReviewQueueController>,
    batches: Registry<BatchId, DiscoveryController>,
}

impl StudyService {
    #[must_use]
    pub fn new(storage: Storage, engine: SchedulingEngine, settings: StudySettings) -> Self {
        let builder = ItemBuilder::from_seed_option(settings.seed);
        Self {
            storage,
            engine: Arc::new(engine),
            settings,
            clock: Clock::default(),
            builder: Mutex::new(builder),
            tasks: BackgroundTasks::new(),
            reviews: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Build the service backed by `SQLite` with the default engine.
    ///
    /// # Errors
    ///
    /// Returns `BootstrapError` if the database cannot be opened or migrated.
    pub async fn new_sqlite(db_url: &str, settings: StudySettings) -> Result<Self, BootstrapError> {
        let storage = Storage::sqlite(db_url).await?;
        let engine = SchedulingEngine::try_new(EngineConfig::default())?;
        Ok(Self::new(storage, engine, settings))
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn settings(&self) -> &StudySettings {
        &self.settings
    }

    #[must_use]
    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Waits for every background task spawned so far.
    pub async fn drain_tasks(&self) -> Vec<TaskReport> {
        self.tasks.drain().await
    }

    //
    // ─── REVIEW ────────────────────────────────────────────────────────────────
    //

    /// Builds a review session from the user's due facets.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Empty` when nothing matching `filters` is due, or
    /// `SessionError::Storage` when the due facets cannot be loaded.
    pub async fn start_review_session(
        &self,
        user: UserId,
        filters: ReviewFilters,
    ) -> Result<StartedSession, SessionError> {
        let now = self.clock.now();
        let due = self.storage.scheduling.fetch_due_facets(user, now).await?;
        if due.is_empty() {
            return Err(SessionError::Empty);
        }

        let mut seen = HashSet::new();
        let ids: Vec<UnitId> = due
            .iter()
            .map(|d| d.unit_id)
            .filter(|id| seen.insert(*id))
            .collect();
        let units: HashMap<UnitId, Unit> = self
            .storage
            .content
            .get_units(&ids)
            .await?
            .into_iter()
            .map(|u| (u.id(), u))
            .collect();

        let limit = filters
            .limit
            .or(self.settings.review_limit)
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX));
        let mut items = Vec::new();
        {
            let mut builder = self.builder();
            for facet in due {
                if limit.is_some_and(|l| items.len() >= l) {
                    break;
                }
                let Some(unit) = units.get(&facet.unit_id) else {
                    tracing::warn!(unit = %facet.unit_id, "due facet without content; skipped");
                    continue;
                };
                if filters.level.is_some_and(|level| unit.level() != level)
                    || filters.kind.is_some_and(|kind| unit.unit_type() != kind)
                {
                    continue;
                }
                match builder.build(unit, facet.facet, facet.state) {
                    Ok(item) => items.push(item),
                    Err(e) => {
                        tracing::warn!(unit = %facet.unit_id, facet = %facet.facet, error = %e, "item skipped");
                    }
                }
            }
        }
        if items.is_empty() {
            return Err(SessionError::Empty);
        }

        let mut controller =
            ReviewQueueController::new(user, self.storage.clone(), Arc::clone(&self.engine))
                .with_clock(self.clock)
                .with_bypass(self.settings.bypass_token.clone())
                .with_persist_attempts(self.settings.persist_attempts)
                .with_tasks(self.tasks.clone());
        controller.initialize(items.clone()).await;
        let started_at = controller.started_at().unwrap_or(now);

        let session_id = SessionId::generate();
        lock(&self.reviews).insert(session_id, Arc::new(AsyncMutex::new(controller)));
        Ok(StartedSession {
            session_id,
            items,
            started_at,
        })
    }

    /// Item the review session expects next.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownSession` for unknown or finished sessions.
    pub async fn current_review_item(
        &self,
        session_id: SessionId,
    ) -> Result<Option<QueueItem>, SessionError> {
        let session = self.review(session_id)?;
        let controller = session.lock().await;
        Ok(controller.peek_current().cloned())
    }

    /// Checks `raw_input` for `item_id`; `again` / `fail` count as an explicit miss
    /// unless the item accepts that word.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Validation` for unknown sessions or items out of
    /// turn. Persistence trouble is reported through `persisted`, not as an error.
    pub async fn submit_review_answer(
        &self,
        session_id: SessionId,
        item_id: ItemId,
        raw_input: &str,
    ) -> Result<AnswerResponse, SessionError> {
        let session = self.review(session_id)?;
        let mut controller = session.lock().await;
        let rating = rate_input(
            controller.peek_current(),
            item_id,
            raw_input,
            self.settings.bypass(),
        );
        let feedback = controller
            .submit_answer_for(item_id, rating, raw_input)
            .await?;
        let finished = feedback.is_complete && controller.pending_writes().is_empty();
        let response = AnswerResponse::new(feedback, controller.completed_at());
        drop(controller);
        if finished {
            lock(&self.reviews).remove(&session_id);
        }
        Ok(response)
    }

    /// Drops a review session. Nothing is marked complete.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownSession` if the session does not exist.
    pub async fn abandon_review_session(&self, session_id: SessionId) -> Result<(), SessionError> {
        let Some(session) = lock(&self.reviews).remove(&session_id) else {
            return Err(ValidationError::UnknownSession(session_id.to_string()).into());
        };
        let controller = session.lock().await;
        let pending = controller.pending_writes().len();
        if pending > 0 {
            tracing::warn!(session = %session_id, pending, "abandoned session had unsaved writes");
        }
        tracing::info!(
            session = %session_id,
            completed = controller.progress().completed,
            "review session abandoned"
        );
        Ok(())
    }

    //
    // ─── DISCOVERY ─────────────────────────────────────────────────────────────
    //

    /// Starts a lesson batch of never-studied units.
    ///
    /// `level` defaults to the user's current level.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::DailyLimitReached` when the user already started
    /// `daily_batch_limit` batches today, `SessionError::Empty` when no unit is
    /// left to learn, or `SessionError::Storage` on load failures.
    pub async fn start_discovery_batch(
        &self,
        user: UserId,
        level: Option<u32>,
    ) -> Result<StartedBatch, SessionError> {
        let level = match level {
            Some(level) => level,
            None => self.storage.progress.current_level(user).await?,
        };
        let limit = self.settings.daily_batch_limit;
        let started_today = self
            .storage
            .lessons
            .count_batches_since(user, self.clock.start_of_day())
            .await?;
        if started_today >= limit {
            return Err(SessionError::DailyLimitReached { limit });
        }

        let fresh = self
            .storage
            .content
            .fetch_new_units(user, self.settings.batch_size, Some(level))
            .await?;

        let mut units = Vec::with_capacity(fresh.len());
        let mut items = Vec::new();
        {
            let mut builder = self.builder();
            for unit in fresh {
                match builder.build_new(&unit) {
                    Ok(built) if !built.is_empty() => {
                        items.extend(built);
                        units.push(unit);
                    }
                    Ok(_) => tracing::warn!(unit = %unit.id(), "unit has no facets; skipped"),
                    Err(e) => tracing::warn!(unit = %unit.id(), error = %e, "unit skipped"),
                }
            }
        }
        if units.is_empty() {
            return Err(SessionError::Empty);
        }

        let mut controller =
            DiscoveryController::new(user, level, self.storage.clone(), Arc::clone(&self.engine))
                .with_clock(self.clock)
                .with_bypass(self.settings.bypass_token.clone())
                .with_persist_attempts(self.settings.persist_attempts);
        controller.initialize(units.clone(), items.clone()).await;

        let batch_id = BatchId::generate();
        lock(&self.batches).insert(batch_id, Arc::new(AsyncMutex::new(controller)));
        Ok(StartedBatch {
            batch_id,
            level,
            units,
            items,
        })
    }

    /// Unit shown in the lesson phase, `None` once every unit was viewed or
    /// the quiz started.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownSession` for unknown batches.
    pub async fn current_lesson(&self, batch_id: BatchId) -> Result<Option<Unit>, SessionError> {
        let batch = self.batch(batch_id)?;
        let controller = batch.lock().await;
        Ok(controller.current_lesson().cloned())
    }

    /// # Errors
    ///
    /// Returns `SessionError::Validation` for unknown batches or once the quiz started.
    pub async fn advance_lesson(&self, batch_id: BatchId) -> Result<bool, SessionError> {
        let batch = self.batch(batch_id)?;
        let mut controller = batch.lock().await;
        controller.advance_lesson().await
    }

    /// # Errors
    ///
    /// Returns `SessionError::Validation` for unknown batches or a second call.
    pub async fn start_quiz(&self, batch_id: BatchId) -> Result<Vec<QueueItem>, SessionError> {
        let batch = self.batch(batch_id)?;
        let mut controller = batch.lock().await;
        controller.start_quiz().await
    }

    /// Item the quiz expects next.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownSession` for unknown or finished batches.
    pub async fn current_quiz_item(
        &self,
        batch_id: BatchId,
    ) -> Result<Option<QueueItem>, SessionError> {
        let batch = self.batch(batch_id)?;
        let controller = batch.lock().await;
        if controller.phase() != DiscoveryPhase::Quiz {
            return Ok(None);
        }
        Ok(controller.peek_current().cloned())
    }

    /// # Errors
    ///
    /// Returns `SessionError::Validation` for unknown batches, answers before
    /// the quiz, or items out of turn.
    pub async fn submit_discovery_answer(
        &self,
        batch_id: BatchId,
        item_id: ItemId,
        raw_input: &str,
    ) -> Result<AnswerResponse, SessionError> {
        let batch = self.batch(batch_id)?;
        let mut controller = batch.lock().await;
        let rating = rate_input(
            controller.peek_current(),
            item_id,
            raw_input,
            self.settings.bypass(),
        );
        let feedback = controller
            .submit_quiz_answer_for(item_id, rating, raw_input)
            .await?;
        let finished = feedback.is_complete && controller.pending_writes().is_empty();
        let response = AnswerResponse::new(feedback, controller.completed_at());
        drop(controller);
        if finished {
            lock(&self.batches).remove(&batch_id);
        }
        Ok(response)
    }

    /// Drops a lesson batch. Units not yet fully passed stay unlearned.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownSession` if the batch does not exist.
    pub async fn abandon_discovery_batch(&self, batch_id: BatchId) -> Result<(), SessionError> {
        let Some(batch) = lock(&self.batches).remove(&batch_id) else {
            return Err(ValidationError::UnknownSession(batch_id.to_string()).into());
        };
        let controller = batch.lock().await;
        let pending = controller.pending_writes().len();
        if pending > 0 {
            tracing::warn!(batch = %batch_id, pending, "abandoned batch had unsaved writes");
        }
        tracing::info!(
            batch = %batch_id,
            initialized = controller.initialized_units().len(),
            "discovery batch abandoned"
        );
        Ok(())
    }

    //
    // ─── MAINTENANCE ───────────────────────────────────────────────────────────
    //

    /// Retries parked scheduling writes across every open session.
    ///
    /// Finished sessions whose writes all went through are dropped.
    pub async fn retry_pending_writes(&self) -> PendingFlush {
        let mut total = PendingFlush::default();

        let reviews: Vec<_> = lock(&self.reviews)
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect();
        for (id, session) in reviews {
            let mut controller = session.lock().await;
            if controller.pending_writes().is_empty() {
                continue;
            }
            total.merge(controller.retry_pending_writes().await);
            if controller.is_complete() && controller.pending_writes().is_empty() {
                drop(controller);
                lock(&self.reviews).remove(&id);
            }
        }

        let batches: Vec<_> = lock(&self.batches)
            .iter()
            .map(|(id, b)| (*id, Arc::clone(b)))
            .collect();
        for (id, batch) in batches {
            let mut controller = batch.lock().await;
            if controller.pending_writes().is_empty() {
                continue;
            }
            total.merge(controller.retry_pending_writes().await);
            if controller.is_batch_complete() && controller.pending_writes().is_empty() {
                drop(controller);
                lock(&self.batches).remove(&id);
            }
        }

        if total.flushed > 0 || total.remaining > 0 {
            tracing::info!(
                flushed = total.flushed,
                remaining = total.remaining,
                "pending writes retried"
            );
        }
        total
    }

    /// Number of sessions and batches still held.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        lock(&self.reviews).len() + lock(&self.batches).len()
    }

    fn review(
        &self,
        id: SessionId,
    ) -> Result<Arc<AsyncMutex<ReviewQueueController>>, ValidationError> {
        lock(&self.reviews)
            .get(&id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownSession(id.to_string()))
    }

    fn batch(&self, id: BatchId) -> Result<Arc<AsyncMutex<DiscoveryController>>, ValidationError> {
        lock(&self.batches)
            .get(&id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownSession(id.to_string()))
    }

    fn builder(&self) -> MutexGuard<'_, ItemBuilder<StdRng>> {
        lock(&self.builder)
    }
}

/// Out-of-turn items keep the word-only rating; the controller rejects them anyway.
fn rate_input(
    head: Option<&QueueItem>,
    item_id: ItemId,
    raw_input: &str,
    bypass: Option<&str>,
) -> Rating {
    head.filter(|item| item.id == item_id).map_or_else(
        || Rating::from_raw_input(raw_input),
        |item| item.answers.rate(raw_input, bypass),
    )
}

/// Registry maps hold no invariants a panic could break, so a poisoned lock
/// is recovered.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl fmt::Debug for StudyService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StudyService")
            .field("settings", &self.settings)
            .field("clock", &self.clock)
            .field("open_sessions", &self.open_sessions())
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kioku_core::model::{Facet, UnitKind};
    use kioku_core::time::fixed_now;

    fn radical(id: u64, level: u32) -> Unit {
        Unit::new(
            UnitId::new(id),
            level,
            format!("部{id}"),
            UnitKind::Radical {
                meanings: vec![format!("part{id}")],
            },
        )
        .unwrap()
    }

    async fn service(units: &[Unit]) -> StudyService {
        let storage = Storage::in_memory();
        for unit in units {
            storage.content.upsert_unit(unit).await.unwrap();
        }
        StudyService::new(
            storage,
            SchedulingEngine::new(),
            StudySettings::default().with_seed(9),
        )
        .with_clock(Clock::fixed(fixed_now()))
    }

    #[tokio::test]
    async fn review_with_nothing_due_is_empty() {
        let service = service(&[radical(1, 1)]).await;
        let err = service
            .start_review_session(UserId::generate(), ReviewFilters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Empty));
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected() {
        let service = service(&[]).await;
        let item = ItemId::new(UnitId::new(1), Facet::Meaning);
        let err = service
            .submit_review_answer(SessionId::generate(), item, "x")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::UnknownSession(_))
        ));
        let err = service
            .abandon_discovery_batch(BatchId::generate())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn finished_batch_is_released() {
        let service = service(&[radical(1, 1)]).await;
        let user = UserId::generate();
        let started = service.start_discovery_batch(user, None).await.unwrap();
        assert_eq!(started.level, 1);
        assert_eq!(started.items.len(), 1);
        assert_eq!(service.open_sessions(), 1);

        assert!(!service.advance_lesson(started.batch_id).await.unwrap());
        let quiz = service.start_quiz(started.batch_id).await.unwrap();
        let response = service
            .submit_discovery_answer(started.batch_id, quiz[0].id, "part1")
            .await
            .unwrap();
        assert!(response.correct);
        assert!(response.is_complete);
        assert_eq!(response.completed_at, Some(fixed_now()));
        assert!(response.next_due.is_some());
        assert_eq!(service.open_sessions(), 0);
    }
}
