//! Named background work spawned by sessions.
//!
//! Every spawned task keeps its `JoinHandle` until it is reaped. Finished
//! handles are reaped on each `spawn`; `drain` awaits the rest. Either way
//! the result becomes a `TaskReport`, so failures always reach a caller.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use kioku_core::model::UserId;
use serde::Serialize;
use storage::repository::{ProgressRepository, StorageError};
use tokio::task::{JoinError, JoinHandle};

/// Share of mastered units a level needs before the next one unlocks.
pub const LEVEL_UNLOCK_RATIO: f64 = 0.9;

pub const LEVEL_UNLOCK_TASK: &str = "level-unlock";

/// Reports of reaped tasks kept for the next `drain`; older ones are dropped.
pub const MAX_FINISHED_REPORTS: usize = 64;

type TaskResult = Result<String, String>;

struct NamedTask {
    name: String,
    handle: JoinHandle<TaskResult>,
}

/// How a background task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum TaskStatus {
    Completed(String),
    Failed(String),
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub name: String,
    pub status: TaskStatus,
}

impl TaskReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, TaskStatus::Completed(_))
    }

    fn from_join(name: String, joined: Result<TaskResult, JoinError>) -> Self {
        let status = match joined {
            Ok(Ok(detail)) => TaskStatus::Completed(detail),
            Ok(Err(error)) => {
                tracing::warn!(task = %name, %error, "background task failed");
                TaskStatus::Failed(error)
            }
            Err(join) => {
                tracing::error!(task = %name, error = %join, "background task aborted");
                TaskStatus::Aborted(join.to_string())
            }
        };
        Self { name, status }
    }
}

#[derive(Default)]
struct Registry {
    running: Vec<NamedTask>,
    finished: VecDeque<TaskReport>,
}

impl Registry {
    /// Moves every finished handle into `finished`.
    fn reap(&mut self) {
        let mut still_running = Vec::with_capacity(self.running.len());
        for mut task in self.running.drain(..) {
            if !task.handle.is_finished() {
                still_running.push(task);
                continue;
            }
            match (&mut task.handle).now_or_never() {
                Some(joined) => {
                    let report = TaskReport::from_join(task.name, joined);
                    if self.finished.len() == MAX_FINISHED_REPORTS {
                        if let Some(dropped) = self.finished.pop_front() {
                            tracing::debug!(task = %dropped.name, "oldest task report dropped");
                        }
                    }
                    self.finished.push_back(report);
                }
                None => still_running.push(task),
            }
        }
        self.running = still_running;
    }
}

/// Registry of in-flight background tasks.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    registry: Arc<Mutex<Registry>>,
}

impl BackgroundTasks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` on the current tokio runtime under `name`, reaping any
    /// tasks that already finished.
    ///
    /// Must be called from within a runtime.
    pub fn spawn<F, E>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<String, E>> + Send + 'static,
        E: fmt::Display,
    {
        let name = name.into();
        tracing::debug!(task = %name, "spawning background task");
        let handle = tokio::spawn(async move { task.await.map_err(|e| e.to_string()) });
        match self.registry.lock() {
            Ok(mut registry) => {
                registry.reap();
                registry.running.push(NamedTask { name, handle });
            }
            Err(e) => {
                tracing::error!(task = %name, error = %e, "task registry poisoned; aborting task");
                handle.abort();
            }
        }
    }

    /// Number of tasks spawned and not yet reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.lock().map_or(0, |registry| registry.running.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reports of reaped tasks waiting for the next `drain`.
    #[must_use]
    pub fn finished_reports(&self) -> usize {
        self.registry.lock().map_or(0, |registry| registry.finished.len())
    }

    /// Awaits every registered task and reports how each one ended, reaped
    /// tasks first.
    pub async fn drain(&self) -> Vec<TaskReport> {
        let (running, finished) = match self.registry.lock() {
            Ok(mut registry) => (
                std::mem::take(&mut registry.running),
                std::mem::take(&mut registry.finished),
            ),
            Err(e) => {
                tracing::error!(error = %e, "task registry poisoned");
                return Vec::new();
            }
        };

        let mut reports: Vec<TaskReport> = finished.into();
        reports.reserve(running.len());
        for NamedTask { name, handle } in running {
            reports.push(TaskReport::from_join(name, handle.await));
        }
        reports
    }
}

impl fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("pending", &self.len())
            .field("finished", &self.finished_reports())
            .finish_non_exhaustive()
    }
}

//
// ─── LEVEL UNLOCK ──────────────────────────────────────────────────────────────
//

/// What a level check decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LevelUnlock {
    Unlocked { from: u32, to: u32 },
    NotReady { ratio: f64 },
    NotCurrent { current: u32 },
}

impl fmt::Display for LevelUnlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelUnlock::Unlocked { from, to } => write!(f, "unlocked level {to} (from {from})"),
            LevelUnlock::NotReady { ratio } => {
                write!(f, "level not ready ({:.0}% mastered)", ratio * 100.0)
            }
            LevelUnlock::NotCurrent { current } => {
                write!(f, "level already passed (current level {current})")
            }
        }
    }
}

/// Raises the user's level once enough of the current level is mastered.
#[derive(Clone)]
pub struct LevelUnlockTask {
    progress: Arc<dyn ProgressRepository>,
    user_id: UserId,
    level: u32,
}

impl LevelUnlockTask {
    #[must_use]
    pub fn new(progress: Arc<dyn ProgressRepository>, user_id: UserId, level: u32) -> Self {
        Self {
            progress,
            user_id,
            level,
        }
    }

    /// # Errors
    ///
    /// Returns `StorageError` if progress cannot be read or written.
    pub async fn run(self) -> Result<LevelUnlock, StorageError> {
        let current = self.progress.current_level(self.user_id).await?;
        if current != self.level {
            return Ok(LevelUnlock::NotCurrent { current });
        }

        let mastery = self.progress.level_mastery(self.user_id, self.level).await?;
        let ratio = mastery.ratio();
        if ratio < LEVEL_UNLOCK_RATIO {
            return Ok(LevelUnlock::NotReady { ratio });
        }

        let next = self.level + 1;
        self.progress.set_level(self.user_id, next).await?;
        tracing::info!(user = %self.user_id, level = next, "level unlocked");
        Ok(LevelUnlock::Unlocked {
            from: self.level,
            to: next,
        })
    }

    /// Spawns this check on `tasks` under the `level-unlock` name.
    pub fn spawn_on(self, tasks: &BackgroundTasks) {
        tasks.spawn(LEVEL_UNLOCK_TASK, async move {
            self.run().await.map(|outcome| outcome.to_string())
        });
    }
}

impl fmt::Debug for LevelUnlockTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelUnlockTask")
            .field("user_id", &self.user_id)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kioku_core::model::{
        Facet, SchedulingState, Stage, Unit, UnitId, UnitKind,
    };
    use kioku_core::time::fixed_now;
    use storage::repository::{
        ContentRepository, InMemoryRepository, SchedulingRecord, SchedulingRepository,
    };

    async fn seed_level(repo: &InMemoryRepository, user: UserId, mastered: u64, total: u64) {
        for id in 1..=total {
            let unit = Unit::new(
                UnitId::new(id),
                1,
                "一",
                UnitKind::Radical {
                    meanings: vec!["one".into()],
                },
            )
            .unwrap();
            repo.upsert_unit(&unit).await.unwrap();
            let stage = if id <= mastered {
                Stage::Review
            } else {
                Stage::Learning
            };
            repo.upsert_scheduling_state(&SchedulingRecord {
                user_id: user,
                unit_id: unit.id(),
                facet: Facet::Meaning,
                state: SchedulingState {
                    stage,
                    ..SchedulingState::default()
                },
                due_at: fixed_now(),
                last_review_at: None,
            })
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn level_unlocks_at_ninety_percent() {
        let repo = InMemoryRepository::new();
        let user = UserId::generate();
        seed_level(&repo, user, 9, 10).await;

        let outcome = LevelUnlockTask::new(Arc::new(repo.clone()), user, 1)
            .run()
            .await
            .unwrap();
        assert_eq!(outcome, LevelUnlock::Unlocked { from: 1, to: 2 });
        assert_eq!(repo.current_level(user).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn level_stays_below_threshold() {
        let repo = InMemoryRepository::new();
        let user = UserId::generate();
        seed_level(&repo, user, 8, 10).await;

        let outcome = LevelUnlockTask::new(Arc::new(repo.clone()), user, 1)
            .run()
            .await
            .unwrap();
        assert!(matches!(outcome, LevelUnlock::NotReady { .. }));
        assert_eq!(repo.current_level(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn drain_reports_every_task() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("ok", async { Ok::<_, StorageError>("done".to_owned()) });
        tasks.spawn("broken", async {
            Err::<String, _>(StorageError::Connection("offline".into()))
        });
        assert_eq!(tasks.len(), 2);

        let mut reports = tasks.drain().await;
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(
            reports,
            vec![
                TaskReport {
                    name: "broken".into(),
                    status: TaskStatus::Failed("connection error: offline".into()),
                },
                TaskReport {
                    name: "ok".into(),
                    status: TaskStatus::Completed("done".into()),
                },
            ]
        );
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn finished_tasks_are_reaped_on_spawn() {
        let tasks = BackgroundTasks::new();
        for i in 0..200 {
            tasks.spawn(format!("task-{i}"), async move {
                Ok::<_, StorageError>(i.to_string())
            });
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }
        assert!(tasks.len() <= 2, "{} tasks still registered", tasks.len());
        assert!(tasks.finished_reports() <= MAX_FINISHED_REPORTS);

        let reports = tasks.drain().await;
        assert!(reports.len() <= MAX_FINISHED_REPORTS + 2);
        assert!(reports.iter().all(TaskReport::is_success));
        assert_eq!(reports.last().map(|r| r.name.as_str()), Some("task-199"));
        assert!(tasks.is_empty());
        assert_eq!(tasks.finished_reports(), 0);
    }
}
