#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use kioku_core::model::{Facet, SchedulingState, Stage, Unit, UnitId, UnitKind, UserId};
use kioku_core::time::fixed_now;
use storage::repository::{
    ContentRepository, DueFacet, InMemoryRepository, SchedulingRecord, SchedulingRepository,
    Storage, StorageError,
};

/// Scheduling repository that records every successful write and can be told
/// to fail the next few.
#[derive(Clone, Default)]
pub struct RecordingScheduling {
    inner: InMemoryRepository,
    writes: Arc<Mutex<Vec<SchedulingRecord>>>,
    failures_left: Arc<AtomicU32>,
}

impl RecordingScheduling {
    pub fn new(inner: InMemoryRepository) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<SchedulingRecord> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchedulingRepository for RecordingScheduling {
    async fn fetch_due_facets(
        &self,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueFacet>, StorageError> {
        self.inner.fetch_due_facets(user, now).await
    }

    async fn upsert_scheduling_state(&self, record: &SchedulingRecord) -> Result<(), StorageError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Connection("injected write failure".into()));
        }
        self.inner.upsert_scheduling_state(record).await?;
        self.writes.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn get_scheduling_state(
        &self,
        user: UserId,
        unit: UnitId,
        facet: Facet,
    ) -> Result<Option<SchedulingRecord>, StorageError> {
        self.inner.get_scheduling_state(user, unit, facet).await
    }
}

pub struct Fixture {
    pub repo: InMemoryRepository,
    pub scheduling: RecordingScheduling,
    pub storage: Storage,
    pub user: UserId,
}

impl Fixture {
    pub async fn with_units(units: &[Unit]) -> Self {
        let repo = InMemoryRepository::new();
        for unit in units {
            repo.upsert_unit(unit).await.unwrap();
        }
        let scheduling = RecordingScheduling::new(repo.clone());
        let mut storage = Storage::from_repository(repo.clone());
        storage.scheduling = Arc::new(scheduling.clone());
        Self {
            repo,
            scheduling,
            storage,
            user: UserId::generate(),
        }
    }

    /// Seeds a due state directly, bypassing the recorder.
    pub async fn due(&self, unit: u64, facet: Facet, state: SchedulingState, minutes_ago: i64) {
        self.repo
            .upsert_scheduling_state(&SchedulingRecord {
                user_id: self.user,
                unit_id: UnitId::new(unit),
                facet,
                state,
                due_at: fixed_now() - Duration::minutes(minutes_ago),
                last_review_at: None,
            })
            .await
            .unwrap();
    }
}

pub fn radical(id: u64, level: u32) -> Unit {
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

pub fn vocab(id: u64, level: u32) -> Unit {
    Unit::new(
        UnitId::new(id),
        level,
        format!("語{id}"),
        UnitKind::Vocabulary {
            meanings: vec![format!("word{id}")],
            readings: vec![format!("ご{id}")],
        },
    )
    .unwrap()
}

pub fn learning(reps: u32, stability: f64) -> SchedulingState {
    SchedulingState {
        stage: Stage::Learning,
        stability,
        difficulty: 5.0,
        reps,
        lapses: 0,
    }
}
