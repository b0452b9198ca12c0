mod common;

use bqlite::config::SchedulerConfig;
use bqlite::db::MetadataStore;
use bqlite::execution::EngineKind;
use bqlite::jobs::{JobFilter, JobManager, JobRequest, JobState};
use bqlite::{BqError, ErrorKind};
use common::{job_manager, mock_router, scheduler_config};
use std::sync::Arc;
use std::time::Duration;

fn query(sql: &str) -> JobRequest {
    JobRequest::query(sql, EngineKind::Embedded)
}

#[tokio::test]
async fn test_slot_budget_limits_concurrency() {
    let (jobs, embedded, _) = job_manager(scheduler_config(4));

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(jobs.submit(query("SLEEP 300").with_slots(2)).await.unwrap());
    }

    let stats = jobs.stats().await.unwrap();
    assert_eq!(stats.running, 2);
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.available_slots, 0);
    assert_eq!(jobs.get_status(&ids[2]).await.unwrap().state, JobState::Queued);

    for id in &ids {
        assert_eq!(jobs.wait(id).await.unwrap().state, JobState::Completed);
    }
    assert_eq!(embedded.max_running(), 2);

    let stats = jobs.stats().await.unwrap();
    assert_eq!(stats.available_slots, 4);
    assert_eq!(stats.completed, 3);
}

#[tokio::test]
async fn test_slot_estimate_bounds() {
    let (jobs, _, _) = job_manager(scheduler_config(4));

    let whole_pool = jobs.submit(query("SELECT 1").with_slots(4)).await.unwrap();
    assert_eq!(jobs.wait(&whole_pool).await.unwrap().state, JobState::Completed);

    let err = jobs.submit(query("SELECT 1").with_slots(5)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    let err = jobs.submit(query("SELECT 1").with_slots(0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn test_submission_validation() {
    let (jobs, _, _) = job_manager(scheduler_config(4));

    assert!(matches!(
        jobs.submit(query("   ")).await,
        Err(BqError::InvalidRequest(_))
    ));
    assert!(matches!(
        jobs.submit(query("SELECT 1").with_priority(0)).await,
        Err(BqError::InvalidRequest(_))
    ));
    assert!(matches!(
        jobs.submit(query("SELECT 1").with_priority(6)).await,
        Err(BqError::InvalidRequest(_))
    ));
    assert!(matches!(
        jobs.submit(query("SELECT 1").with_timeout(Duration::from_secs(7200))).await,
        Err(BqError::InvalidRequest(_))
    ));

    // Nothing was queued
    let stats = jobs.stats().await.unwrap();
    assert_eq!(stats.queued + stats.running + stats.completed, 0);
}

#[tokio::test]
async fn test_completed_job_result() {
    let (jobs, _, _) = job_manager(scheduler_config(2));
    let id = jobs.submit(query("SELECT 42")).await.unwrap();

    let info = jobs.wait(&id).await.unwrap();
    assert_eq!(info.state, JobState::Completed);
    assert_eq!(info.row_count, Some(1));
    assert_eq!(info.executed_engine, Some(EngineKind::Embedded));
    assert!(info.started_at.is_some() && info.finished_at.is_some());

    let result = jobs.get_result(&id).await.unwrap();
    assert_eq!(result.rows[0][0], serde_json::json!("SELECT 42"));
    assert!(!result.fallback_used);
}

#[tokio::test]
async fn test_result_of_unfinished_job_is_not_ready() {
    let (jobs, _, _) = job_manager(scheduler_config(1));
    let id = jobs.submit(query("SLEEP 300")).await.unwrap();

    let err = jobs.get_result(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotReady);

    jobs.wait(&id).await.unwrap();
    assert!(jobs.get_result(&id).await.is_ok());
}

#[tokio::test]
async fn test_failed_job_carries_structured_error() {
    let (jobs, _, _) = job_manager(scheduler_config(1));
    let id = jobs.submit(query("FAIL no such table")).await.unwrap();

    let info = jobs.wait(&id).await.unwrap();
    assert_eq!(info.state, JobState::Failed);
    let error = info.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Execution);
    assert_eq!(error.engine, EngineKind::Embedded);
    assert_eq!(error.sql, "FAIL no such table");
    assert!(error.message.contains("no such table"));

    assert_eq!(jobs.get_result(&id).await.unwrap_err().kind(), ErrorKind::Execution);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let (jobs, _, _) = job_manager(scheduler_config(1));
    assert_eq!(jobs.get_status("nope").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(jobs.get_result("nope").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(jobs.cancel("nope").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(jobs.wait("nope").await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_cancel_queued_and_running_jobs() {
    let (jobs, _, _) = job_manager(scheduler_config(1));
    let running = jobs.submit(query("SLEEP 5000")).await.unwrap();
    let queued = jobs.submit(query("SELECT 'queued'")).await.unwrap();
    assert_eq!(jobs.get_status(&queued).await.unwrap().state, JobState::Queued);

    assert!(jobs.cancel(&queued).await.unwrap());
    assert_eq!(jobs.get_status(&queued).await.unwrap().state, JobState::Cancelled);
    assert_eq!(jobs.get_result(&queued).await.unwrap_err().kind(), ErrorKind::Cancelled);

    assert_eq!(jobs.get_status(&running).await.unwrap().state, JobState::Running);
    assert!(jobs.cancel(&running).await.unwrap());
    let info = jobs.wait(&running).await.unwrap();
    assert_eq!(info.state, JobState::Cancelled);
    assert!(info.finished_at.is_some());

    // Terminal jobs cannot be cancelled again
    assert!(!jobs.cancel(&running).await.unwrap());

    let stats = jobs.stats().await.unwrap();
    assert_eq!(stats.available_slots, 1);
    assert_eq!(stats.cancelled, 2);

    // The freed slot is usable
    let next = jobs.submit(query("SELECT 1")).await.unwrap();
    assert_eq!(jobs.wait(&next).await.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_timeout_fails_job_and_reclaims_slots() {
    let (jobs, _, _) = job_manager(scheduler_config(2));
    let id = jobs
        .submit(
            query("SLEEP 5000")
                .with_slots(2)
                .with_timeout(Duration::from_millis(150)),
        )
        .await
        .unwrap();

    let info = jobs.wait(&id).await.unwrap();
    assert_eq!(info.state, JobState::Failed);
    assert_eq!(info.error.unwrap().kind, ErrorKind::Timeout);
    assert_eq!(jobs.get_result(&id).await.unwrap_err().kind(), ErrorKind::Timeout);

    let stats = jobs.stats().await.unwrap();
    assert_eq!(stats.available_slots, 2);
    assert_eq!(stats.running, 0);
}

#[tokio::test]
async fn test_higher_priority_admitted_first() {
    let (jobs, embedded, _) = job_manager(scheduler_config(1));
    let blocker = jobs.submit(query("SLEEP 200")).await.unwrap();
    let low = jobs.submit(query("SELECT 'low'").with_priority(5)).await.unwrap();
    let mid = jobs.submit(query("SELECT 'mid'").with_priority(3)).await.unwrap();
    let high = jobs.submit(query("SELECT 'high'").with_priority(1)).await.unwrap();

    for id in [&blocker, &low, &mid, &high] {
        assert_eq!(jobs.wait(id).await.unwrap().state, JobState::Completed);
    }
    assert_eq!(
        embedded.started(),
        vec!["SLEEP 200", "SELECT 'high'", "SELECT 'mid'", "SELECT 'low'"]
    );
}

#[tokio::test]
async fn test_fifo_within_priority() {
    let (jobs, embedded, _) = job_manager(scheduler_config(1));
    let mut ids = vec![jobs.submit(query("SLEEP 100")).await.unwrap()];
    for i in 0..4 {
        ids.push(jobs.submit(query(&format!("SELECT {}", i)).with_priority(2)).await.unwrap());
    }
    for id in &ids {
        jobs.wait(id).await.unwrap();
    }
    assert_eq!(
        embedded.started(),
        vec!["SLEEP 100", "SELECT 0", "SELECT 1", "SELECT 2", "SELECT 3"]
    );
}

#[tokio::test]
async fn test_aged_job_is_not_starved() {
    let config = SchedulerConfig {
        total_slots: 4,
        aging_threshold: Duration::from_millis(200),
        ..SchedulerConfig::default()
    };
    let (jobs, _, _) = job_manager(config);

    let blocker = jobs.submit(query("SLEEP 700")).await.unwrap();
    let big = jobs
        .submit(query("SELECT 'big'").with_slots(4).with_priority(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;

    // Three slots are free, but the aged job holds the reservation
    let small = jobs.submit(query("SLEEP 10")).await.unwrap();
    assert_eq!(jobs.get_status(&small).await.unwrap().state, JobState::Queued);

    jobs.wait(&blocker).await.unwrap();
    let big_info = jobs.wait(&big).await.unwrap();
    let small_info = jobs.wait(&small).await.unwrap();
    assert_eq!(big_info.state, JobState::Completed);
    assert_eq!(small_info.state, JobState::Completed);
    assert!(big_info.started_at.unwrap() <= small_info.started_at.unwrap());
}

#[tokio::test]
async fn test_every_admissible_job_eventually_runs() {
    let (jobs, embedded, _) = job_manager(scheduler_config(4));

    let mut ids = Vec::new();
    for i in 0..24u32 {
        let request = query(&format!("SLEEP {}", 5 + (i % 4) * 10))
            .with_slots(1 + i % 4)
            .with_priority(1 + (i % 5) as u8);
        ids.push(jobs.submit(request).await.unwrap());
    }
    for id in &ids {
        assert_eq!(jobs.wait(id).await.unwrap().state, JobState::Completed);
    }
    assert!(embedded.max_running() <= 4);
    assert_eq!(jobs.stats().await.unwrap().available_slots, 4);
}

#[tokio::test]
async fn test_list_filters_and_orders_newest_first() {
    let (jobs, _, _) = job_manager(scheduler_config(2));
    let first = jobs.submit(query("SELECT 1")).await.unwrap();
    let failed = jobs.submit(query("FAIL boom")).await.unwrap();
    let last = jobs
        .submit(JobRequest::query("SELECT 3", EngineKind::Distributed))
        .await
        .unwrap();
    for id in [&first, &failed, &last] {
        jobs.wait(id).await.unwrap();
    }

    let all = jobs.list(JobFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].job_id, last);
    assert_eq!(all[2].job_id, first);

    let failures = jobs
        .list(JobFilter {
            state: Some(JobState::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].job_id, failed);

    let distributed = jobs
        .list(JobFilter {
            engine: Some(EngineKind::Distributed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(distributed.len(), 1);
}

#[tokio::test]
async fn test_history_outlives_in_memory_eviction() {
    let (router, _, _) = mock_router();
    let store = Arc::new(MetadataStore::in_memory().unwrap());
    let config = SchedulerConfig {
        total_slots: 2,
        history_capacity: 1,
        ..SchedulerConfig::default()
    };
    let jobs = JobManager::start(config, router, Some(store.clone()));

    let first = jobs.submit(query("SELECT 1")).await.unwrap();
    jobs.wait(&first).await.unwrap();
    let second = jobs.submit(query("SELECT 2")).await.unwrap();
    jobs.wait(&second).await.unwrap();

    // Only the newest finished job stays in memory
    assert_eq!(jobs.get_status(&first).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(jobs.get_status(&second).await.unwrap().state, JobState::Completed);

    let history = jobs.history(10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].job_id, second);
    assert_eq!(history[1].job_id, first);
    assert!(history.iter().all(|j| j.state == JobState::Completed));

    let stored = store.get_job(&first).unwrap().unwrap();
    assert_eq!(stored.sql, "SELECT 1");
}

#[tokio::test]
async fn test_shutdown_cancels_outstanding_jobs() {
    let (router, _, _) = mock_router();
    let store = Arc::new(MetadataStore::in_memory().unwrap());
    let jobs = JobManager::start(scheduler_config(1), router, Some(store.clone()));

    let running = jobs.submit(query("SLEEP 5000")).await.unwrap();
    let queued = jobs.submit(query("SELECT 1")).await.unwrap();
    jobs.shutdown().await.unwrap();

    assert!(jobs.submit(query("SELECT 2")).await.is_err());

    // Give the history writer a moment to drain
    tokio::time::sleep(Duration::from_millis(200)).await;
    for id in [&running, &queued] {
        assert_eq!(store.get_job(id).unwrap().unwrap().state, JobState::Cancelled);
    }
}

#[derive(Debug, Clone)]
enum Step {
    Submit { slots: u32, sleep_ms: u64, priority: u8 },
    Fail { slots: u32 },
    TimeOut { slots: u32 },
    Cancel(usize),
    Pause(u64),
}

fn step() -> impl proptest::strategy::Strategy<Value = Step> {
    use proptest::prelude::*;
    prop_oneof![
        4 => (1..=4u32, 0..40u64, 1..=5u8)
            .prop_map(|(slots, sleep_ms, priority)| Step::Submit { slots, sleep_ms, priority }),
        1 => (1..=4u32).prop_map(|slots| Step::Fail { slots }),
        1 => (1..=4u32).prop_map(|slots| Step::TimeOut { slots }),
        2 => any::<usize>().prop_map(Step::Cancel),
        1 => (0..20u64).prop_map(Step::Pause),
    ]
}

proptest::proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(24))]

    #[test]
    fn test_slot_budget_holds_under_random_workloads(
        steps in proptest::collection::vec(step(), 1..30)
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            const TOTAL: u32 = 4;
            let (jobs, _, _) = job_manager(scheduler_config(TOTAL));
            let mut ids = Vec::new();

            for step in steps {
                match step {
                    Step::Submit { slots, sleep_ms, priority } => {
                        let request = query(&format!("SLEEP {}", sleep_ms))
                            .with_slots(slots)
                            .with_priority(priority);
                        ids.push(jobs.submit(request).await.unwrap());
                    }
                    Step::Fail { slots } => {
                        ids.push(jobs.submit(query("FAIL boom").with_slots(slots)).await.unwrap());
                    }
                    Step::TimeOut { slots } => {
                        let request = query("SLEEP 500")
                            .with_slots(slots)
                            .with_timeout(Duration::from_millis(30));
                        ids.push(jobs.submit(request).await.unwrap());
                    }
                    Step::Cancel(index) => {
                        if !ids.is_empty() {
                            jobs.cancel(&ids[index % ids.len()]).await.unwrap();
                        }
                    }
                    Step::Pause(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                }

                let stats = jobs.stats().await.unwrap();
                assert!(stats.available_slots <= TOTAL, "{:?}", stats);
                assert!(stats.running as u32 <= TOTAL, "{:?}", stats);
            }

            for id in &ids {
                let info = jobs.wait(id).await.unwrap();
                assert!(info.state.is_terminal(), "{:?}", info.state);
                let stats = jobs.stats().await.unwrap();
                assert!(stats.available_slots <= TOTAL, "{:?}", stats);
            }

            let stats = jobs.stats().await.unwrap();
            assert_eq!(stats.available_slots, TOTAL);
            assert_eq!(stats.running, 0);
            assert_eq!(stats.queued, 0);
            jobs.shutdown().await.unwrap();
        });
    }
}
