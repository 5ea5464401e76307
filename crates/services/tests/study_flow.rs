mod common;

use chrono::Duration;
use kioku_core::model::{
    Facet, ItemId, Outcome, SessionId, Stage, Unit, UnitId, UnitKind, UnitType,
};
use kioku_core::time::fixed_now;
use kioku_core::{Clock, SchedulingEngine, ValidationError};
use services::{ReviewFilters, SessionError, StudyService, StudySettings};
use storage::repository::{AttemptLogRepository, LessonRepository, ProgressRepository};

use common::{Fixture, learning, radical, vocab};

fn service(fx: &Fixture, settings: StudySettings) -> StudyService {
    StudyService::new(fx.storage.clone(), SchedulingEngine::new(), settings.with_seed(1))
        .with_clock(Clock::fixed(fixed_now()))
}

async fn current(service: &StudyService, session: SessionId) -> ItemId {
    service
        .current_review_item(session)
        .await
        .unwrap()
        .expect("item pending")
        .id
}

#[tokio::test]
async fn missed_items_commit_once_with_their_failure_count() {
    let fx = Fixture::with_units(&[radical(1, 1), radical(2, 1), radical(3, 1)]).await;
    for (unit, ago) in [(1, 30), (2, 20), (3, 10)] {
        fx.due(unit, Facet::Meaning, learning(2, 0.3333), ago).await;
    }
    let service = service(&fx, StudySettings::default());
    let started = service
        .start_review_session(fx.user, ReviewFilters::default())
        .await
        .unwrap();
    let order: Vec<u64> = started.items.iter().map(|i| i.unit_id.value()).collect();
    assert_eq!(order, vec![1, 2, 3]);

    let answers = [
        (1, "nope", false),
        (2, "nope", false),
        (3, "part3", true),
        (1, "part1", true),
        (2, "part2", true),
    ];
    let mut last = None;
    for (unit, input, expect_correct) in answers {
        let head = current(&service, started.session_id).await;
        assert_eq!(head.unit_id, UnitId::new(unit));
        let response = service
            .submit_review_answer(started.session_id, head, input)
            .await
            .unwrap();
        assert_eq!(response.correct, expect_correct);
        assert!(response.persisted);
        last = Some(response);
    }

    let last = last.unwrap();
    assert!(last.is_complete);
    assert_eq!(last.progress.completed, 3);
    assert_eq!(last.completed_at, Some(fixed_now()));

    let writes = fx.scheduling.writes();
    assert_eq!(writes.len(), 3);
    for unit in 1..=3 {
        let count = writes.iter().filter(|w| w.unit_id == UnitId::new(unit)).count();
        assert_eq!(count, 1, "unit {unit} committed once");
    }

    let struggled = fx.repo.attempts_for_unit(fx.user, UnitId::new(1)).await.unwrap();
    assert_eq!(struggled.len(), 1);
    assert_eq!(struggled[0].outcome, Outcome::struggled(1));
    assert_eq!(struggled[0].resulting_state.stage, Stage::Learning);
    assert_eq!(struggled[0].resulting_state.lapses, 0);
    assert!(struggled[0].resulting_state.stability < 0.3333);

    let clean = fx.repo.attempts_for_unit(fx.user, UnitId::new(3)).await.unwrap();
    assert_eq!(clean[0].outcome, Outcome::pass());

    assert_eq!(service.open_sessions(), 0);
}

#[tokio::test]
async fn explicit_fail_counts_as_a_miss() {
    let fx = Fixture::with_units(&[radical(1, 1)]).await;
    fx.due(1, Facet::Meaning, learning(2, 0.3333), 5).await;
    let service = service(&fx, StudySettings::default());
    let started = service
        .start_review_session(fx.user, ReviewFilters::default())
        .await
        .unwrap();
    let item = started.items[0].id;

    let missed = service
        .submit_review_answer(started.session_id, item, "again")
        .await
        .unwrap();
    assert!(!missed.correct);
    assert!(fx.scheduling.writes().is_empty());

    let passed = service
        .submit_review_answer(started.session_id, item, "PART1 ")
        .await
        .unwrap();
    assert!(passed.correct);
    assert!(passed.next_due.is_some());
    let logs = fx.repo.attempts_for_unit(fx.user, UnitId::new(1)).await.unwrap();
    assert_eq!(logs[0].outcome.session_failures, 1);
}

#[tokio::test]
async fn accepted_answer_wins_over_give_up_word() {
    let again = Unit::new(
        UnitId::new(1),
        1,
        "又",
        UnitKind::Vocabulary {
            meanings: vec!["again".into()],
            readings: vec!["また".into()],
        },
    )
    .unwrap();
    let fx = Fixture::with_units(&[again, radical(2, 1)]).await;
    fx.due(1, Facet::Meaning, learning(2, 0.3333), 10).await;
    fx.due(2, Facet::Meaning, learning(2, 0.3333), 5).await;
    let service = service(&fx, StudySettings::default());
    let started = service
        .start_review_session(fx.user, ReviewFilters::default())
        .await
        .unwrap();

    let head = current(&service, started.session_id).await;
    assert_eq!(head.unit_id, UnitId::new(1));
    let response = service
        .submit_review_answer(started.session_id, head, "Again")
        .await
        .unwrap();
    assert!(response.correct);
    assert_eq!(response.progress.completed, 1);

    let head = current(&service, started.session_id).await;
    let give_up = service
        .submit_review_answer(started.session_id, head, "again")
        .await
        .unwrap();
    assert!(!give_up.correct);

    let logs = fx.repo.attempts_for_unit(fx.user, UnitId::new(1)).await.unwrap();
    assert_eq!(logs[0].outcome, Outcome::pass());
}

#[tokio::test]
async fn review_filters_narrow_the_session() {
    let fx = Fixture::with_units(&[radical(1, 1), vocab(2, 2), radical(3, 2)]).await;
    fx.due(1, Facet::Meaning, learning(2, 0.3333), 30).await;
    fx.due(2, Facet::Meaning, learning(2, 0.3333), 20).await;
    fx.due(3, Facet::Meaning, learning(2, 0.3333), 10).await;
    let service = service(&fx, StudySettings::default());

    let radicals = service
        .start_review_session(
            fx.user,
            ReviewFilters {
                kind: Some(UnitType::Radical),
                ..ReviewFilters::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(radicals.items.len(), 2);
    assert!(radicals.items.iter().all(|i| i.unit_type == UnitType::Radical));

    let level_two = service
        .start_review_session(
            fx.user,
            ReviewFilters {
                level: Some(2),
                limit: Some(1),
                ..ReviewFilters::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(level_two.items.len(), 1);
    assert_eq!(level_two.items[0].unit_id, UnitId::new(2));

    let none = service
        .start_review_session(
            fx.user,
            ReviewFilters {
                level: Some(9),
                ..ReviewFilters::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(none, SessionError::Empty));
}

#[tokio::test]
async fn discovery_initializes_a_unit_after_its_last_facet() {
    let fx = Fixture::with_units(&[vocab(1, 1), vocab(2, 1)]).await;
    let service = service(&fx, StudySettings::default());
    let started = service.start_discovery_batch(fx.user, None).await.unwrap();
    assert_eq!(started.units.len(), 2);

    let premature = service
        .submit_discovery_answer(started.batch_id, started.items[0].id, "word1")
        .await
        .unwrap_err();
    assert!(matches!(
        premature,
        SessionError::Validation(ValidationError::QuizNotStarted)
    ));

    assert!(service.advance_lesson(started.batch_id).await.unwrap());
    assert!(!service.advance_lesson(started.batch_id).await.unwrap());
    let quiz = service.start_quiz(started.batch_id).await.unwrap();
    let order: Vec<(u64, Facet)> = quiz.iter().map(|i| (i.unit_id.value(), i.facet)).collect();
    assert_eq!(
        order,
        vec![
            (1, Facet::Meaning),
            (2, Facet::Meaning),
            (1, Facet::Reading),
            (2, Facet::Reading),
        ]
    );

    let out_of_turn = service
        .submit_discovery_answer(started.batch_id, quiz[2].id, "ご1")
        .await
        .unwrap_err();
    assert!(matches!(
        out_of_turn,
        SessionError::Validation(ValidationError::NotCurrentItem { .. })
    ));

    let answers = [
        (quiz[0].id, "word1", true, 0),
        (quiz[1].id, "wrong", false, 0),
        (quiz[2].id, "ご1", true, 2),
        (quiz[3].id, "ご2", true, 2),
        (quiz[1].id, "word2", true, 4),
    ];
    for (item, input, correct, writes) in answers {
        let response = service
            .submit_discovery_answer(started.batch_id, item, input)
            .await
            .unwrap();
        assert_eq!(response.correct, correct, "{item}");
        assert_eq!(fx.scheduling.writes().len(), writes, "{item}");
    }

    let initial = SchedulingEngine::new().initial_state();
    assert!(fx.scheduling.writes().iter().all(|w| w.state == initial));
    assert!(
        fx.scheduling
            .writes()
            .iter()
            .all(|w| w.due_at == fixed_now() + Duration::hours(4))
    );
    assert_eq!(service.open_sessions(), 0);
}

#[tokio::test]
async fn daily_batch_limit_is_enforced() {
    let fx = Fixture::with_units(&[radical(1, 1), radical(2, 1)]).await;
    let settings = StudySettings {
        daily_batch_limit: 1,
        batch_size: 1,
        ..StudySettings::default()
    };
    let service = service(&fx, settings);

    let first = service.start_discovery_batch(fx.user, Some(1)).await.unwrap();
    service.abandon_discovery_batch(first.batch_id).await.unwrap();
    let err = service
        .start_discovery_batch(fx.user, Some(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::DailyLimitReached { limit: 1 }));
    assert_eq!(
        fx.repo
            .count_batches_since(fx.user, Clock::fixed(fixed_now()).start_of_day())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn empty_curriculum_yields_empty() {
    let fx = Fixture::with_units(&[]).await;
    let service = service(&fx, StudySettings::default());
    let err = service.start_discovery_batch(fx.user, None).await.unwrap_err();
    assert!(matches!(err, SessionError::Empty));
}

#[tokio::test]
async fn failed_writes_are_kept_until_retried() {
    let fx = Fixture::with_units(&[radical(1, 1)]).await;
    fx.due(1, Facet::Meaning, learning(2, 0.3333), 5).await;
    let service = service(&fx, StudySettings::default());
    let started = service
        .start_review_session(fx.user, ReviewFilters::default())
        .await
        .unwrap();

    fx.scheduling.fail_next(2);
    let response = service
        .submit_review_answer(started.session_id, started.items[0].id, "part1")
        .await
        .unwrap();
    assert!(response.correct);
    assert!(response.is_complete);
    assert!(!response.persisted);
    assert!(fx.scheduling.writes().is_empty());
    assert_eq!(service.open_sessions(), 1);

    let flush = service.retry_pending_writes().await;
    assert_eq!(flush.flushed, 1);
    assert_eq!(flush.remaining, 0);
    assert_eq!(fx.scheduling.writes().len(), 1);
    assert_eq!(service.open_sessions(), 0);
}

#[tokio::test]
async fn promotion_unlocks_the_next_level() {
    let fx = Fixture::with_units(&[radical(1, 1)]).await;
    fx.due(1, Facet::Meaning, learning(3, 1.0), 5).await;
    let service = service(&fx, StudySettings::default());
    let started = service
        .start_review_session(fx.user, ReviewFilters::default())
        .await
        .unwrap();

    service
        .submit_review_answer(started.session_id, started.items[0].id, "part1")
        .await
        .unwrap();
    assert_eq!(fx.scheduling.writes()[0].state.stage, Stage::Review);

    let reports = service.drain_tasks().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "level-unlock");
    assert!(reports[0].is_success());
    assert_eq!(fx.repo.current_level(fx.user).await.unwrap(), 2);
}
