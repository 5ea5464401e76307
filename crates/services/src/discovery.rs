use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kioku_core::model::{
    ItemId, Progress, QueueItem, Rating, TraceId, Unit, UnitId, UserId,
};
use kioku_core::{Clock, ScheduledReview, SchedulingEngine, ValidationError};
use serde::Serialize;
use storage::repository::{
    LessonItemStatus, SchedulingRecord, SessionItemOutcome, SessionItemStatus, Storage,
    TraceKind,
};

use crate::config::DEFAULT_PERSIST_ATTEMPTS;
use crate::error::SessionError;
use crate::review::{AnswerFeedback, PendingFlush, flush_pending, persist_state};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryPhase {
    Lesson,
    Quiz,
    Complete,
}

/// First exposure to a batch of new units.
///
/// Units are shown once, then quizzed on every facet. A unit gets scheduling
/// state only after all of its facets were answered correctly in this batch.
/// Misses requeue the item and cost nothing.
pub struct DiscoveryController {
    user_id: UserId,
    level: u32,
    storage: Storage,
    engine: Arc<SchedulingEngine>,
    clock: Clock,
    bypass: Option<String>,
    persist_attempts: u32,
    phase: DiscoveryPhase,
    units: Vec<Unit>,
    items: Vec<QueueItem>,
    lesson_index: usize,
    quiz: VecDeque<QueueItem>,
    remaining: HashMap<UnitId, usize>,
    attempts: HashMap<ItemId, u32>,
    misses: HashMap<ItemId, u32>,
    passed: HashSet<ItemId>,
    initialized: Vec<UnitId>,
    completed: usize,
    batch: Option<TraceId>,
    trace: Option<TraceId>,
    pending: Vec<SchedulingRecord>,
    completed_at: Option<DateTime<Utc>>,
}

impl DiscoveryController {
    #[must_use]
    pub fn new(
        user_id: UserId,
        level: u32,
        storage: Storage,
        engine: Arc<SchedulingEngine>,
    ) -> Self {
        Self {
            user_id,
            level,
            storage,
            engine,
            clock: Clock::default(),
            bypass: None,
            persist_attempts: DEFAULT_PERSIST_ATTEMPTS,
            phase: DiscoveryPhase::Lesson,
            units: Vec::new(),
            items: Vec::new(),
            lesson_index: 0,
            quiz: VecDeque::new(),
            remaining: HashMap::new(),
            attempts: HashMap::new(),
            misses: HashMap::new(),
            passed: HashSet::new(),
            initialized: Vec::new(),
            completed: 0,
            batch: None,
            trace: None,
            pending: Vec::new(),
            completed_at: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_bypass(mut self, token: Option<String>) -> Self {
        self.bypass = token;
        self
    }

    #[must_use]
    pub fn with_persist_attempts(mut self, attempts: u32) -> Self {
        self.persist_attempts = attempts.max(1);
        self
    }

    /// Loads the batch and records it as a lesson batch.
    ///
    /// `items` must be the quiz items built from `units`; items of units not
    /// in the batch are ignored and units without any item are dropped.
    pub async fn initialize(&mut self, units: Vec<Unit>, items: Vec<QueueItem>) {
        let unit_ids: HashSet<UnitId> = units.iter().map(Unit::id).collect();
        let mut seen = HashSet::with_capacity(items.len());
        self.items = items
            .into_iter()
            .filter(|i| unit_ids.contains(&i.unit_id) && seen.insert(i.id))
            .collect();
        self.remaining.clear();
        for item in &self.items {
            *self.remaining.entry(item.unit_id).or_insert(0) += 1;
        }
        self.units = units
            .into_iter()
            .filter(|unit| {
                let quizzed = self.remaining.contains_key(&unit.id());
                if !quizzed {
                    tracing::warn!(unit = %unit.id(), "unit has no quiz items; dropped");
                }
                quizzed
            })
            .collect();
        self.phase = DiscoveryPhase::Lesson;
        self.lesson_index = 0;

        let ids: Vec<UnitId> = self.units.iter().map(Unit::id).collect();
        self.batch = match self
            .storage
            .lessons
            .create_lesson_batch(self.user_id, self.level, &ids, self.clock.now())
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(user = %self.user_id, error = %e, "could not record lesson batch");
                None
            }
        };
        tracing::info!(
            user = %self.user_id,
            level = self.level,
            units = self.units.len(),
            "discovery batch started"
        );
    }

    #[must_use]
    pub fn phase(&self) -> DiscoveryPhase {
        self.phase
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    #[must_use]
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    /// Unit currently shown in the lesson phase.
    #[must_use]
    pub fn current_lesson(&self) -> Option<&Unit> {
        match self.phase {
            DiscoveryPhase::Lesson => self.units.get(self.lesson_index),
            _ => None,
        }
    }

    /// Marks the current lesson unit viewed and moves to the next one.
    ///
    /// Returns whether another unit remains to be viewed.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::QuizAlreadyStarted` outside the lesson phase.
    pub async fn advance_lesson(&mut self) -> Result<bool, SessionError> {
        if self.phase != DiscoveryPhase::Lesson {
            return Err(ValidationError::QuizAlreadyStarted.into());
        }
        if let Some(unit) = self.units.get(self.lesson_index) {
            let unit_id = unit.id();
            self.mark_lesson(unit_id, LessonItemStatus::Viewed).await;
            self.lesson_index += 1;
        }
        Ok(self.lesson_index < self.units.len())
    }

    /// Ends the lesson phase and returns the quiz queue.
    ///
    /// Meaning and cloze prompts come before reading prompts; the relative
    /// order of units is kept.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::QuizAlreadyStarted` if called twice.
    pub async fn start_quiz(&mut self) -> Result<Vec<QueueItem>, SessionError> {
        if self.phase != DiscoveryPhase::Lesson {
            return Err(ValidationError::QuizAlreadyStarted.into());
        }
        let mut ordered = self.items.clone();
        ordered.sort_by_key(|item| item.facet.quiz_rank());
        self.quiz = ordered.iter().cloned().collect();
        self.completed = 0;
        self.phase = if self.quiz.is_empty() {
            DiscoveryPhase::Complete
        } else {
            DiscoveryPhase::Quiz
        };

        let total = u32::try_from(ordered.len()).unwrap_or(u32::MAX);
        self.trace = match self
            .storage
            .traces
            .create_session_trace(self.user_id, TraceKind::Discovery, total, self.clock.now())
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(user = %self.user_id, error = %e, "could not open quiz trace");
                None
            }
        };
        Ok(ordered)
    }

    #[must_use]
    pub fn peek_current(&self) -> Option<&QueueItem> {
        self.quiz.front()
    }

    #[must_use]
    pub fn progress(&self) -> Progress {
        Progress::new(self.completed, self.items.len())
    }

    #[must_use]
    pub fn is_batch_complete(&self) -> bool {
        self.phase == DiscoveryPhase::Complete
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Units whose scheduling state was created by this batch.
    #[must_use]
    pub fn initialized_units(&self) -> &[UnitId] {
        &self.initialized
    }

    #[must_use]
    pub fn pending_writes(&self) -> &[SchedulingRecord] {
        &self.pending
    }

    /// Answers the quiz item at the head of the queue.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Validation` before the quiz or after it ended.
    pub async fn submit_quiz_answer(
        &mut self,
        rating: Rating,
        raw_input: &str,
    ) -> Result<AnswerFeedback, SessionError> {
        self.ensure_quiz()?;
        let Some(head) = self.quiz.front() else {
            return Err(ValidationError::SessionComplete.into());
        };
        let id = head.id;
        self.answer_head(id, rating, raw_input).await
    }

    /// Answers `item_id`, which must be the head of the quiz queue.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Validation` for wrong phase, unknown, passed or
    /// out-of-turn items.
    pub async fn submit_quiz_answer_for(
        &mut self,
        item_id: ItemId,
        rating: Rating,
        raw_input: &str,
    ) -> Result<AnswerFeedback, SessionError> {
        self.ensure_quiz()?;
        if self.passed.contains(&item_id) {
            return Err(ValidationError::AlreadyCompleted(item_id).into());
        }
        let Some(head) = self.quiz.front() else {
            return Err(ValidationError::UnknownItem(item_id).into());
        };
        if head.id != item_id {
            if self.quiz.iter().any(|i| i.id == item_id) {
                return Err(ValidationError::NotCurrentItem {
                    requested: item_id,
                    current: head.id,
                }
                .into());
            }
            return Err(ValidationError::UnknownItem(item_id).into());
        }
        self.answer_head(item_id, rating, raw_input).await
    }

    fn ensure_quiz(&self) -> Result<(), ValidationError> {
        match self.phase {
            DiscoveryPhase::Lesson => Err(ValidationError::QuizNotStarted),
            DiscoveryPhase::Quiz => Ok(()),
            DiscoveryPhase::Complete => Err(ValidationError::SessionComplete),
        }
    }

    async fn answer_head(
        &mut self,
        id: ItemId,
        rating: Rating,
        raw_input: &str,
    ) -> Result<AnswerFeedback, SessionError> {
        let Some(head) = self.quiz.front() else {
            return Err(ValidationError::SessionComplete.into());
        };
        let correct = rating.is_pass()
            && head
                .answers
                .check(raw_input, self.bypass.as_deref())
                .is_correct();
        *self.attempts.entry(id).or_insert(0) += 1;

        if !correct {
            *self.misses.entry(id).or_insert(0) += 1;
            if let Some(item) = self.quiz.pop_front() {
                self.quiz.push_back(item);
            }
            self.record_trace(id, SessionItemStatus::Incorrect).await;
            return Ok(self.feedback(id, false, None, true));
        }

        let Some(item) = self.quiz.pop_front() else {
            return Err(ValidationError::SessionComplete.into());
        };
        self.completed += 1;
        self.passed.insert(item.id);
        self.record_trace(item.id, SessionItemStatus::Correct).await;

        let left = self.remaining.entry(item.unit_id).or_insert(1);
        *left = left.saturating_sub(1);
        let (scheduled, persisted) = if *left == 0 {
            let (scheduled, persisted) = self.initialize_unit(item.unit_id).await;
            (Some(scheduled), persisted)
        } else {
            (None, true)
        };

        if self.quiz.is_empty() {
            self.finish().await;
        }
        Ok(self.feedback(item.id, true, scheduled, persisted))
    }

    /// Writes the starting state for every facet of a fully passed unit.
    async fn initialize_unit(&mut self, unit_id: UnitId) -> (ScheduledReview, bool) {
        let now = self.clock.now();
        let scheduled = self.engine.schedule_discovered(now);
        let facets: Vec<_> = self
            .items
            .iter()
            .filter(|i| i.unit_id == unit_id)
            .map(|i| i.facet)
            .collect();

        let mut persisted = true;
        for facet in facets {
            let record = SchedulingRecord {
                user_id: self.user_id,
                unit_id,
                facet,
                state: scheduled.state,
                due_at: scheduled.due_at,
                last_review_at: Some(now),
            };
            if persist_state(&self.storage, &record, self.persist_attempts)
                .await
                .is_err()
            {
                self.pending.push(record);
                persisted = false;
            }
        }
        self.initialized.push(unit_id);
        self.mark_lesson(unit_id, LessonItemStatus::QuizPassed).await;
        tracing::debug!(unit = %unit_id, persisted, "unit initialized");
        (scheduled, persisted)
    }

    async fn finish(&mut self) {
        self.phase = DiscoveryPhase::Complete;
        let now = self.clock.now();
        self.completed_at = Some(now);
        if let Some(trace) = self.trace {
            let completed = u32::try_from(self.completed).unwrap_or(u32::MAX);
            if let Err(e) = self
                .storage
                .traces
                .mark_session_complete(trace, completed, now)
                .await
            {
                tracing::warn!(trace = %trace, error = %e, "could not mark quiz complete");
            }
        }
        tracing::info!(
            user = %self.user_id,
            units = self.initialized.len(),
            pending = self.pending.len(),
            "discovery batch complete"
        );
    }

    async fn mark_lesson(&self, unit: UnitId, status: LessonItemStatus) {
        let Some(batch) = self.batch else {
            return;
        };
        if let Err(e) = self
            .storage
            .lessons
            .update_lesson_item_status(batch, unit, status)
            .await
        {
            tracing::warn!(batch = %batch, unit = %unit, error = %e, "lesson status dropped");
        }
    }

    async fn record_trace(&self, id: ItemId, status: SessionItemStatus) {
        let Some(trace) = self.trace else {
            return;
        };
        let outcome = SessionItemOutcome {
            status,
            attempts: self.attempts.get(&id).copied().unwrap_or(0),
            failures: self.misses.get(&id).copied().unwrap_or(0),
            recorded_at: self.clock.now(),
        };
        if let Err(e) = self
            .storage
            .traces
            .record_session_item_outcome(trace, id.unit_id, id.facet, &outcome)
            .await
        {
            tracing::warn!(trace = %trace, item = %id, error = %e, "trace write dropped");
        }
    }

    fn feedback(
        &self,
        item_id: ItemId,
        correct: bool,
        scheduled: Option<ScheduledReview>,
        persisted: bool,
    ) -> AnswerFeedback {
        AnswerFeedback {
            item_id,
            correct,
            scheduled,
            persisted,
            progress: self.progress(),
            is_complete: self.is_batch_complete(),
        }
    }

    /// Retries unit initializations whose writes failed.
    pub async fn retry_pending_writes(&mut self) -> PendingFlush {
        flush_pending(&self.storage, &mut self.pending).await
    }
}

impl fmt::Debug for DiscoveryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryController")
            .field("user_id", &self.user_id)
            .field("level", &self.level)
            .field("phase", &self.phase)
            .field("units", &self.units.len())
            .field("quiz_len", &self.quiz.len())
            .field("completed", &self.completed)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kioku_core::model::{Facet, Stage, UnitKind};
    use kioku_core::time::fixed_now;
    use storage::repository::{InMemoryRepository, LessonRepository, SchedulingRepository};

    use crate::items::ItemBuilder;

    fn kanji(id: u64) -> Unit {
        Unit::new(
            UnitId::new(id),
            1,
            format!("字{id}"),
            UnitKind::Kanji {
                meanings: vec![format!("sign{id}")],
                onyomi: vec![format!("じ{id}")],
                kunyomi: Vec::new(),
            },
        )
        .unwrap()
    }

    async fn batch(repo: &InMemoryRepository, units: Vec<Unit>) -> DiscoveryController {
        let mut builder = ItemBuilder::seeded(3);
        let items = units
            .iter()
            .flat_map(|u| builder.build_new(u).unwrap())
            .collect();
        let mut controller = DiscoveryController::new(
            UserId::generate(),
            1,
            Storage::from_repository(repo.clone()),
            Arc::new(SchedulingEngine::new()),
        )
        .with_clock(Clock::fixed(fixed_now()));
        controller.initialize(units, items).await;
        controller
    }

    #[tokio::test]
    async fn quiz_orders_meaning_before_reading() {
        let repo = InMemoryRepository::new();
        let mut controller = batch(&repo, vec![kanji(1), kanji(2)]).await;

        let quiz = controller.start_quiz().await.unwrap();
        let order: Vec<(u64, Facet)> = quiz
            .iter()
            .map(|i| (i.unit_id.value(), i.facet))
            .collect();
        assert_eq!(
            order,
            vec![
                (1, Facet::Meaning),
                (2, Facet::Meaning),
                (1, Facet::Reading),
                (2, Facet::Reading),
            ]
        );
    }

    #[tokio::test]
    async fn units_without_items_are_dropped() {
        let repo = InMemoryRepository::new();
        let items = ItemBuilder::seeded(3).build_new(&kanji(1)).unwrap();
        let mut controller = DiscoveryController::new(
            UserId::generate(),
            1,
            Storage::from_repository(repo.clone()),
            Arc::new(SchedulingEngine::new()),
        )
        .with_clock(Clock::fixed(fixed_now()));
        controller.initialize(vec![kanji(1), kanji(2)], items).await;

        let ids: Vec<UnitId> = controller.units().iter().map(Unit::id).collect();
        assert_eq!(ids, vec![UnitId::new(1)]);
        let statuses = repo
            .lesson_item_statuses(controller.batch.unwrap())
            .await
            .unwrap();
        assert_eq!(statuses.len(), 1);
    }

    #[tokio::test]
    async fn lesson_phase_marks_units_viewed() {
        let repo = InMemoryRepository::new();
        let mut controller = batch(&repo, vec![kanji(1), kanji(2)]).await;

        assert_eq!(controller.current_lesson().unwrap().id(), UnitId::new(1));
        assert!(controller.advance_lesson().await.unwrap());
        assert!(!controller.advance_lesson().await.unwrap());
        assert!(!controller.advance_lesson().await.unwrap());

        let statuses = repo
            .lesson_item_statuses(controller.batch.unwrap())
            .await
            .unwrap();
        assert!(
            statuses
                .iter()
                .all(|(_, status)| *status == LessonItemStatus::Viewed)
        );

        let err = controller
            .submit_quiz_answer(Rating::Pass, "sign1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::QuizNotStarted)
        ));
        controller.start_quiz().await.unwrap();
        let err = controller.advance_lesson().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::QuizAlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn unit_is_initialized_only_after_every_facet_passes() {
        let repo = InMemoryRepository::new();
        let mut controller = batch(&repo, vec![kanji(1)]).await;
        let user = controller.user_id;
        controller.start_quiz().await.unwrap();

        let meaning = controller.submit_quiz_answer(Rating::Pass, "sign1").await.unwrap();
        assert!(meaning.correct);
        assert!(meaning.scheduled.is_none());
        let none_yet = repo
            .get_scheduling_state(user, UnitId::new(1), Facet::Meaning)
            .await
            .unwrap();
        assert!(none_yet.is_none());

        let miss = controller.submit_quiz_answer(Rating::Pass, "?").await.unwrap();
        assert!(!miss.correct);
        assert!(
            repo.get_scheduling_state(user, UnitId::new(1), Facet::Reading)
                .await
                .unwrap()
                .is_none()
        );

        let reading = controller.submit_quiz_answer(Rating::Pass, "じ1").await.unwrap();
        assert!(reading.correct);
        assert!(reading.is_complete);
        let initial = reading.scheduled.unwrap();
        assert_eq!(initial.state, SchedulingEngine::new().initial_state());

        for facet in [Facet::Meaning, Facet::Reading] {
            let record = repo
                .get_scheduling_state(user, UnitId::new(1), facet)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(record.state.stage, Stage::Learning);
            assert_eq!(record.state.lapses, 0);
        }
        assert_eq!(controller.initialized_units(), &[UnitId::new(1)]);
    }
}
