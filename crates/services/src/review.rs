use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kioku_core::model::{
    ItemId, Outcome, Progress, QueueItem, Rating, SchedulingState, Stage, TraceId, UserId,
};
use kioku_core::{Clock, ScheduledReview, SchedulingEngine, ValidationError};
use serde::Serialize;
use storage::repository::{
    AttemptLogRecord, SchedulingRecord, SessionItemOutcome, SessionItemStatus, Storage,
    StorageError, TraceKind,
};

use crate::background::{BackgroundTasks, LevelUnlockTask};
use crate::config::DEFAULT_PERSIST_ATTEMPTS;
use crate::error::SessionError;

//
// ─── FEEDBACK ──────────────────────────────────────────────────────────────────
//

/// Result of one submitted answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerFeedback {
    pub item_id: ItemId,
    pub correct: bool,
    /// Schedule written by this answer, if any.
    pub scheduled: Option<ScheduledReview>,
    /// False when a required scheduling write is still pending.
    pub persisted: bool,
    pub progress: Progress,
    pub is_complete: bool,
}

/// Outcome of retrying parked scheduling writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PendingFlush {
    pub flushed: usize,
    pub remaining: usize,
}

impl PendingFlush {
    pub(crate) fn merge(&mut self, other: PendingFlush) {
        self.flushed += other.flushed;
        self.remaining += other.remaining;
    }
}

//
// ─── PERSISTENCE HELPERS ───────────────────────────────────────────────────────
//

/// Writes `record`, retrying up to `attempts` times.
pub(crate) async fn persist_state(
    storage: &Storage,
    record: &SchedulingRecord,
    attempts: u32,
) -> Result<(), StorageError> {
    let mut last = None;
    for attempt in 1..=attempts.max(1) {
        match storage.scheduling.upsert_scheduling_state(record).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    unit = %record.unit_id,
                    facet = %record.facet,
                    attempt,
                    error = %e,
                    "scheduling write failed"
                );
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or(StorageError::Conflict))
}

/// Retries every parked write once, keeping the ones that still fail.
pub(crate) async fn flush_pending(
    storage: &Storage,
    pending: &mut Vec<SchedulingRecord>,
) -> PendingFlush {
    let mut still_pending = Vec::new();
    let mut flushed = 0;
    for record in pending.drain(..) {
        match storage.scheduling.upsert_scheduling_state(&record).await {
            Ok(()) => flushed += 1,
            Err(e) => {
                tracing::warn!(unit = %record.unit_id, error = %e, "pending write still failing");
                still_pending.push(record);
            }
        }
    }
    *pending = still_pending;
    PendingFlush {
        flushed,
        remaining: pending.len(),
    }
}

//
// ─── CONTROLLER ────────────────────────────────────────────────────────────────
//

/// Drives one review session over a fixed set of due facets.
///
/// An incorrect answer moves the item to the tail and bumps its failure
/// counter; nothing is written. The single scheduling commit for a facet
/// happens when it is finally answered correctly, carrying the number of
/// earlier misses as `session_failures`.
pub struct ReviewQueueController {
    user_id: UserId,
    storage: Storage,
    engine: Arc<SchedulingEngine>,
    clock: Clock,
    bypass: Option<String>,
    persist_attempts: u32,
    tasks: Option<BackgroundTasks>,
    queue: VecDeque<QueueItem>,
    failures: HashMap<ItemId, u32>,
    attempts: HashMap<ItemId, u32>,
    committed: HashSet<ItemId>,
    completed: usize,
    total: usize,
    trace: Option<TraceId>,
    pending: Vec<SchedulingRecord>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl ReviewQueueController {
    #[must_use]
    pub fn new(user_id: UserId, storage: Storage, engine: Arc<SchedulingEngine>) -> Self {
        Self {
            user_id,
            storage,
            engine,
            clock: Clock::default(),
            bypass: None,
            persist_attempts: DEFAULT_PERSIST_ATTEMPTS,
            tasks: None,
            queue: VecDeque::new(),
            failures: HashMap::new(),
            attempts: HashMap::new(),
            committed: HashSet::new(),
            completed: 0,
            total: 0,
            trace: None,
            pending: Vec::new(),
            started_at: None,
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

    /// Level-unlock checks are spawned on `tasks` after stage promotions.
    #[must_use]
    pub fn with_tasks(mut self, tasks: BackgroundTasks) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Loads the queue in the given order and opens the session trace. An
    /// empty queue finishes the session straight away.
    ///
    /// Duplicate item ids are dropped. A failed trace open is logged and the
    /// session runs without one.
    pub async fn initialize(&mut self, items: Vec<QueueItem>) -> Progress {
        let mut seen = HashSet::with_capacity(items.len());
        self.queue = items.into_iter().filter(|i| seen.insert(i.id)).collect();
        self.failures.clear();
        self.attempts.clear();
        self.committed.clear();
        self.completed = 0;
        self.total = self.queue.len();
        self.completed_at = None;

        let now = self.clock.now();
        self.started_at = Some(now);
        let total = u32::try_from(self.total).unwrap_or(u32::MAX);
        self.trace = match self
            .storage
            .traces
            .create_session_trace(self.user_id, TraceKind::Review, total, now)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(user = %self.user_id, error = %e, "could not open session trace");
                None
            }
        };
        tracing::info!(user = %self.user_id, total = self.total, "review session started");
        if self.queue.is_empty() {
            self.finish(now).await;
        }
        self.progress()
    }

    #[must_use]
    pub fn peek_current(&self) -> Option<&QueueItem> {
        self.queue.front()
    }

    #[must_use]
    pub fn items(&self) -> impl Iterator<Item = &QueueItem> {
        self.queue.iter()
    }

    #[must_use]
    pub fn progress(&self) -> Progress {
        Progress::new(self.completed, self.total)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn trace_id(&self) -> Option<TraceId> {
        self.trace
    }

    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Failures recorded so far for an item still in the queue.
    #[must_use]
    pub fn failure_count(&self, item: ItemId) -> u32 {
        self.failures.get(&item).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn pending_writes(&self) -> &[SchedulingRecord] {
        &self.pending
    }

    /// Answers the item at the head of the queue.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Validation` when the session is already complete.
    pub async fn submit_answer(
        &mut self,
        rating: Rating,
        raw_input: &str,
    ) -> Result<AnswerFeedback, SessionError> {
        let Some(head) = self.queue.front() else {
            return Err(ValidationError::SessionComplete.into());
        };
        let id = head.id;
        self.answer_head(id, rating, raw_input).await
    }

    /// Answers `item_id`, which must be the head of the queue.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Validation` for unknown, already completed or
    /// out-of-turn items; the session is left untouched.
    pub async fn submit_answer_for(
        &mut self,
        item_id: ItemId,
        rating: Rating,
        raw_input: &str,
    ) -> Result<AnswerFeedback, SessionError> {
        if self.committed.contains(&item_id) {
            return Err(ValidationError::AlreadyCompleted(item_id).into());
        }
        let Some(head) = self.queue.front() else {
            return Err(ValidationError::UnknownItem(item_id).into());
        };
        if head.id != item_id {
            if self.queue.iter().any(|i| i.id == item_id) {
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

    async fn answer_head(
        &mut self,
        id: ItemId,
        rating: Rating,
        raw_input: &str,
    ) -> Result<AnswerFeedback, SessionError> {
        let Some(head) = self.queue.front() else {
            return Err(ValidationError::SessionComplete.into());
        };
        let correct = rating.is_pass()
            && head
                .answers
                .check(raw_input, self.bypass.as_deref())
                .is_correct();
        *self.attempts.entry(id).or_insert(0) += 1;

        if correct {
            self.commit_head().await
        } else {
            *self.failures.entry(id).or_insert(0) += 1;
            if let Some(item) = self.queue.pop_front() {
                self.queue.push_back(item);
            }
            tracing::debug!(item = %id, failures = self.failure_count(id), "item requeued");
            self.record_trace(id, SessionItemStatus::Incorrect).await;
            Ok(self.feedback(id, false, None, true))
        }
    }

    async fn commit_head(&mut self) -> Result<AnswerFeedback, SessionError> {
        let Some(item) = self.queue.pop_front() else {
            return Err(ValidationError::SessionComplete.into());
        };
        let now = self.clock.now();
        let session_failures = self.failures.get(&item.id).copied().unwrap_or(0);
        let outcome = Outcome::new(Rating::Pass, session_failures);
        let scheduled = self.engine.compute_next(&item.state, outcome, now);

        self.completed += 1;
        self.committed.insert(item.id);

        let record = SchedulingRecord {
            user_id: self.user_id,
            unit_id: item.unit_id,
            facet: item.facet,
            state: scheduled.state,
            due_at: scheduled.due_at,
            last_review_at: Some(now),
        };
        let persisted = match persist_state(&self.storage, &record, self.persist_attempts).await {
            Ok(()) => true,
            Err(_) => {
                self.pending.push(record);
                false
            }
        };
        tracing::debug!(
            item = %item.id,
            session_failures,
            stage = %scheduled.state.stage,
            persisted,
            "facet committed"
        );

        let log = AttemptLogRecord {
            id: None,
            user_id: self.user_id,
            unit_id: item.unit_id,
            facet: item.facet,
            outcome,
            resulting_state: scheduled.state,
            due_at: scheduled.due_at,
            reviewed_at: now,
        };
        if let Err(e) = self.storage.attempts.append_attempt_log(&log).await {
            tracing::warn!(item = %item.id, error = %e, "attempt log dropped");
        }

        self.record_trace(item.id, SessionItemStatus::Correct).await;
        self.failures.remove(&item.id);
        self.attempts.remove(&item.id);

        if promoted(&item.state, &scheduled.state) {
            if let Some(tasks) = &self.tasks {
                LevelUnlockTask::new(self.storage.progress.clone(), self.user_id, item.level)
                    .spawn_on(tasks);
            }
        }

        if self.queue.is_empty() {
            self.finish(now).await;
        }

        Ok(self.feedback(item.id, true, Some(scheduled), persisted))
    }

    async fn finish(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        if let Some(trace) = self.trace {
            let completed = u32::try_from(self.completed).unwrap_or(u32::MAX);
            if let Err(e) = self
                .storage
                .traces
                .mark_session_complete(trace, completed, now)
                .await
            {
                tracing::warn!(trace = %trace, error = %e, "could not mark session complete");
            }
        }
        tracing::info!(
            user = %self.user_id,
            completed = self.completed,
            pending = self.pending.len(),
            "review session complete"
        );
    }

    async fn record_trace(&self, id: ItemId, status: SessionItemStatus) {
        let Some(trace) = self.trace else {
            return;
        };
        let outcome = SessionItemOutcome {
            status,
            attempts: self.attempts.get(&id).copied().unwrap_or(0),
            failures: self.failures.get(&id).copied().unwrap_or(0),
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
            is_complete: self.is_complete(),
        }
    }

    /// Retries scheduling writes that failed during this session.
    pub async fn retry_pending_writes(&mut self) -> PendingFlush {
        flush_pending(&self.storage, &mut self.pending).await
    }
}

fn promoted(before: &SchedulingState, after: &SchedulingState) -> bool {
    !before.stage.is_mastered() && matches!(after.stage, Stage::Review | Stage::Burned)
}

impl fmt::Debug for ReviewQueueController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReviewQueueController")
            .field("user_id", &self.user_id)
            .field("queue_len", &self.queue.len())
            .field("completed", &self.completed)
            .field("total", &self.total)
            .field("trace", &self.trace)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use kioku_core::model::{Facet, Unit, UnitId, UnitKind};
    use kioku_core::time::fixed_now;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use storage::repository::{
        AttemptLogRepository, InMemoryRepository, SchedulingRepository, SessionTraceRepository,
    };

    fn vocab(id: u64) -> Unit {
        Unit::new(
            UnitId::new(id),
            1,
            format!("語{id}"),
            UnitKind::Vocabulary {
                meanings: vec![format!("word{id}")],
                readings: vec![format!("ご{id}")],
            },
        )
        .unwrap()
    }

    fn review_state() -> SchedulingState {
        SchedulingState {
            stage: Stage::Review,
            stability: 5.0,
            difficulty: 3.0,
            reps: 4,
            lapses: 0,
        }
    }

    fn meaning_item(id: u64) -> QueueItem {
        QueueItem::build(&vocab(id), Facet::Meaning, review_state(), None).unwrap()
    }

    fn controller(repo: &InMemoryRepository) -> ReviewQueueController {
        ReviewQueueController::new(
            UserId::generate(),
            Storage::from_repository(repo.clone()),
            Arc::new(SchedulingEngine::new()),
        )
        .with_clock(Clock::fixed(fixed_now()))
    }

    #[tokio::test]
    async fn incorrect_answer_requeues_without_writing() {
        let repo = InMemoryRepository::new();
        let mut session = controller(&repo);
        session.initialize(vec![meaning_item(1), meaning_item(2)]).await;

        let feedback = session.submit_answer(Rating::Pass, "nope").await.unwrap();
        assert!(!feedback.correct);
        assert!(feedback.scheduled.is_none());
        assert_eq!(session.peek_current().unwrap().unit_id, UnitId::new(2));
        assert_eq!(session.progress().completed, 0);
        assert_eq!(session.items().count(), 2);

        let user = session.user_id();
        let stored = repo
            .get_scheduling_state(user, UnitId::new(1), Facet::Meaning)
            .await
            .unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn mixed_answers_conserve_the_queue() {
        let repo = InMemoryRepository::new();
        let mut session = controller(&repo);
        let items: Vec<QueueItem> = (1..=6).map(meaning_item).collect();
        let total = session.initialize(items.clone()).await.total;
        let mut rng = StdRng::seed_from_u64(7);
        let mut commits = 0;

        for _ in 0..200 {
            let Some(head) = session.peek_current().cloned() else {
                break;
            };
            let correct = rng.random_bool(0.4);
            let input = if correct {
                format!("word{}", head.unit_id.value())
            } else {
                "miss".to_owned()
            };
            let feedback = session.submit_answer(Rating::Pass, &input).await.unwrap();
            assert_eq!(feedback.correct, correct);

            let progress = session.progress();
            assert_eq!(progress.completed + session.items().count(), total);
            let queued = session.items().any(|i| i.id == head.id);
            if correct {
                commits += 1;
                assert!(!queued, "{} still queued after commit", head.id);
                let logs = repo
                    .attempts_for_unit(session.user_id(), head.unit_id)
                    .await
                    .unwrap();
                assert_eq!(logs.len(), 1);
            } else {
                assert!(queued, "{} left the queue without a commit", head.id);
                assert_eq!(session.items().last().map(|i| i.id), Some(head.id));
            }
            assert_eq!(progress.completed, commits);
        }

        assert!(session.is_complete());
        assert_eq!(commits, items.len());
    }

    #[tokio::test]
    async fn empty_queue_completes_on_initialize() {
        let repo = InMemoryRepository::new();
        let mut session = controller(&repo);
        let progress = session.initialize(Vec::new()).await;
        assert_eq!(progress.total, 0);
        assert!(session.is_complete());
        assert_eq!(session.completed_at(), Some(fixed_now()));

        let trace = repo
            .get_session_trace(session.trace_id().unwrap())
            .await
            .unwrap();
        assert_eq!(trace.completed_at, Some(fixed_now()));
    }

    #[tokio::test]
    async fn explicit_fail_is_never_correct() {
        let repo = InMemoryRepository::new();
        let mut session = controller(&repo);
        session.initialize(vec![meaning_item(1)]).await;

        let feedback = session.submit_answer(Rating::Fail, "word1").await.unwrap();
        assert!(!feedback.correct);
        assert_eq!(session.failure_count(meaning_item(1).id), 1);
    }

    #[tokio::test]
    async fn commit_carries_accumulated_failures() {
        let repo = InMemoryRepository::new();
        let mut session = controller(&repo);
        session.initialize(vec![meaning_item(1)]).await;

        for _ in 0..3 {
            session.submit_answer(Rating::Pass, "wrong").await.unwrap();
        }
        let feedback = session.submit_answer(Rating::Pass, " WORD1 ").await.unwrap();
        assert!(feedback.correct);
        assert!(feedback.persisted);
        assert!(feedback.is_complete);

        let scheduled = feedback.scheduled.unwrap();
        assert_eq!(scheduled.state.stage, Stage::Learning);
        assert_eq!(scheduled.state.lapses, 1);

        let logs = repo
            .attempts_for_unit(session.user_id(), UnitId::new(1))
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, Outcome::struggled(3));
    }

    #[tokio::test]
    async fn out_of_turn_and_completed_items_are_rejected() {
        let repo = InMemoryRepository::new();
        let mut session = controller(&repo);
        session
            .initialize(vec![meaning_item(1), meaning_item(2)])
            .await;
        let first = meaning_item(1).id;
        let second = meaning_item(2).id;

        let err = session
            .submit_answer_for(second, Rating::Pass, "word2")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::NotCurrentItem { .. })
        ));
        assert_eq!(session.peek_current().unwrap().id, first);

        session
            .submit_answer_for(first, Rating::Pass, "word1")
            .await
            .unwrap();
        let err = session
            .submit_answer_for(first, Rating::Pass, "word1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::AlreadyCompleted(_))
        ));

        let stranger = QueueItem::build(&vocab(9), Facet::Reading, review_state(), None)
            .unwrap()
            .id;
        let err = session
            .submit_answer_for(stranger, Rating::Pass, "x")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::UnknownItem(_))
        ));
        assert_eq!(session.progress().completed, 1);
    }

    #[tokio::test]
    async fn duplicate_items_are_loaded_once() {
        let repo = InMemoryRepository::new();
        let mut session = controller(&repo);
        let progress = session
            .initialize(vec![meaning_item(1), meaning_item(1)])
            .await;
        assert_eq!(progress.total, 1);
    }

    #[tokio::test]
    async fn submitting_after_completion_is_rejected() {
        let repo = InMemoryRepository::new();
        let mut session = controller(&repo);
        session.initialize(vec![meaning_item(1)]).await;
        session.submit_answer(Rating::Pass, "word1").await.unwrap();

        let err = session.submit_answer(Rating::Pass, "word1").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Validation(ValidationError::SessionComplete)
        ));
    }
}
