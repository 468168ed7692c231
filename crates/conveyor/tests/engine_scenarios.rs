//! End-to-end engine scenarios over the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::{
    DeadLetterSink, EngineBuilder, JobEvent, JobPriority, JobSpec, JobStatus, QueueError,
    ReadyQueue, StateStore, StatusPatch,
};
use conveyor_testing::{
    fast_config, CountingHandler, FailNTimesHandler, FailingHandler, MemoryStateStore,
    NeverFinishHandler, SucceedingHandler, TestHarness, TestHarnessBuilder,
};
use uuid::Uuid;

const SETTLE: Duration = Duration::from_secs(5);

async fn harness() -> TestHarness {
    TestHarnessBuilder::new()
        .handler("work", Arc::new(SucceedingHandler::instant()))
        .handler(
            "slow_work",
            Arc::new(SucceedingHandler::after(Duration::from_millis(150))),
        )
        .handler("always_fails", Arc::new(FailingHandler::new("handler exploded")))
        .handler("never_finishes", Arc::new(NeverFinishHandler))
        .start()
        .await
        .expect("harness should start")
}

#[tokio::test]
async fn submitted_job_round_trips_and_completes() {
    let h = harness().await;

    let spec = JobSpec::new("work")
        .priority(JobPriority::High)
        .payload(serde_json::json!({"input": 42}));
    let submitted = h.handle.submit(spec).await.unwrap();
    assert!(submitted.created);

    let fetched = h.handle.get_job(submitted.details.job.id).await.unwrap();
    assert_eq!(fetched.job.job_type, "work");
    assert_eq!(fetched.job.priority, JobPriority::High);
    assert_eq!(fetched.job.payload["input"], 42);

    let done = h
        .wait_for_status(fetched.job.id, JobStatus::Completed, SETTLE)
        .await
        .unwrap();
    assert_eq!(done.result.as_ref().unwrap()["ok"], true);
    assert!(done.completed_at.is_some());
    assert!(done.updated_at >= done.created_at);

    let executions = h.store.execution_rows(done.id);
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].attempt_number, 1);
    assert!(executions[0].worker_id.starts_with("worker-"));

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn fifo_within_a_band_when_resources_serialize() {
    let h = harness().await;

    // J1 takes the whole ledger; J2 fits trivially but must wait its turn.
    let j1 = h
        .handle
        .submit(JobSpec::new("slow_work").resources(8, 4096))
        .await
        .unwrap()
        .details
        .job;
    let j2 = h
        .handle
        .submit(JobSpec::new("work").resources(1, 128))
        .await
        .unwrap()
        .details
        .job;

    let j1 = h.wait_for_status(j1.id, JobStatus::Completed, SETTLE).await.unwrap();
    let j2 = h.wait_for_status(j2.id, JobStatus::Completed, SETTLE).await.unwrap();
    assert!(j1.started_at.unwrap() < j2.started_at.unwrap());

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn critical_beats_normal_beats_low_across_bands() {
    let h = harness().await;

    // Plug the only execution slot so the three probes queue up together.
    let plug = h
        .handle
        .submit(JobSpec::new("slow_work").resources(8, 4096))
        .await
        .unwrap()
        .details
        .job;

    let low = h
        .handle
        .submit(
            JobSpec::new("work")
                .priority(JobPriority::Low)
                .resources(8, 4096),
        )
        .await
        .unwrap()
        .details
        .job;
    let critical = h
        .handle
        .submit(
            JobSpec::new("work")
                .priority(JobPriority::Critical)
                .resources(8, 4096),
        )
        .await
        .unwrap()
        .details
        .job;
    let normal = h
        .handle
        .submit(
            JobSpec::new("work")
                .priority(JobPriority::Normal)
                .resources(8, 4096),
        )
        .await
        .unwrap()
        .details
        .job;

    for id in [plug.id, low.id, critical.id, normal.id] {
        h.wait_for_status(id, JobStatus::Completed, SETTLE).await.unwrap();
    }

    let started = |id: Uuid| h.store.job(id).unwrap().started_at.unwrap();
    assert!(started(critical.id) < started(normal.id));
    assert!(started(normal.id) < started(low.id));

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn ledger_never_runs_two_full_width_jobs_at_once() {
    let h = harness().await;

    let a = h
        .handle
        .submit(JobSpec::new("slow_work").resources(8, 4096))
        .await
        .unwrap()
        .details
        .job;
    let b = h
        .handle
        .submit(JobSpec::new("slow_work").resources(8, 4096))
        .await
        .unwrap()
        .details
        .job;

    let a = h.wait_for_status(a.id, JobStatus::Completed, SETTLE).await.unwrap();
    let b = h.wait_for_status(b.id, JobStatus::Completed, SETTLE).await.unwrap();

    // Serialized: the second starts only after the first finishes.
    assert!(b.started_at.unwrap() >= a.completed_at.unwrap());

    let snapshot = h.queue.resources().await.unwrap();
    assert_eq!(snapshot.allocated_cpu, 0);
    assert_eq!(snapshot.allocated_memory, 0);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn dependency_gate_blocks_until_parent_completes() {
    let h = harness().await;

    let parent = h
        .handle
        .submit(JobSpec::new("slow_work"))
        .await
        .unwrap()
        .details
        .job;
    let child = h
        .handle
        .submit(JobSpec::new("work").depends_on([parent.id]))
        .await
        .unwrap()
        .details
        .job;
    assert_eq!(child.status, JobStatus::Blocked);

    let parent = h
        .wait_for_status(parent.id, JobStatus::Completed, SETTLE)
        .await
        .unwrap();
    let child = h
        .wait_for_status(child.id, JobStatus::Completed, SETTLE)
        .await
        .unwrap();
    assert!(child.started_at.unwrap() >= parent.completed_at.unwrap());

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn parents_already_complete_admit_the_child_immediately() {
    let h = harness().await;

    let parent = h.handle.submit(JobSpec::new("work")).await.unwrap().details.job;
    h.wait_for_status(parent.id, JobStatus::Completed, SETTLE)
        .await
        .unwrap();

    let child = h
        .handle
        .submit(JobSpec::new("work").depends_on([parent.id]))
        .await
        .unwrap()
        .details
        .job;
    // Never Blocked: the readiness check at admission sees the completed
    // parent. (The job may already be running by the time we look.)
    assert_ne!(child.status, JobStatus::Blocked);
    h.wait_for_status(child.id, JobStatus::Completed, SETTLE)
        .await
        .unwrap();

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn cycle_forming_edge_is_rejected_without_mutation() {
    let h = harness().await;

    let a = h.handle.submit(JobSpec::new("work")).await.unwrap().details.job;
    let b = h.handle.submit(JobSpec::new("work")).await.unwrap().details.job;

    // B → A is fine; A → B would close the loop.
    h.handle.add_dependency(b.id, a.id).await.unwrap();
    let err = h.handle.add_dependency(a.id, b.id).await.unwrap_err();
    assert!(matches!(err, QueueError::CycleDetected));

    // The rejected edge left no trace.
    assert_eq!(h.store.children_of(a.id).await.unwrap(), Vec::<Uuid>::new());

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_dependency_is_rejected_before_anything_persists() {
    let h = harness().await;

    let ghost = Uuid::new_v4();
    let err = h
        .handle
        .submit(JobSpec::new("work").depends_on([ghost]))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::UnknownDependency(id) if id == ghost));

    let (_, total) = h
        .handle
        .list_jobs(&Default::default(), 1, 10)
        .await
        .unwrap();
    assert_eq!(total, 0);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn retry_exhaustion_dead_letters_with_three_attempts() {
    let h = harness().await;

    let job = h
        .handle
        .submit(JobSpec::new("always_fails").retries(3, 2.0))
        .await
        .unwrap()
        .details
        .job;

    let failed = h.wait_for_status(job.id, JobStatus::Failed, SETTLE).await.unwrap();
    assert_eq!(failed.current_attempt, failed.max_attempts);
    assert_eq!(failed.error_message.as_deref(), Some("handler exploded"));

    let executions = h.store.execution_rows(job.id);
    assert_eq!(executions.len(), 3);
    let attempts: Vec<u32> = executions.iter().map(|e| e.attempt_number).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let (stats, _) = h.handle.dead_letter_stats().await.unwrap();
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.failed_by_type["always_fails"], 1);
    let (entries, _) = h.handle.dead_letter_list(0, 10).await.unwrap();
    assert_eq!(entries[0].job_id, job.id);
    assert_eq!(entries[0].attempts, 3);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn single_attempt_failure_is_immediately_terminal() {
    let h = harness().await;

    let job = h
        .handle
        .submit(JobSpec::new("always_fails").retries(1, 2.0))
        .await
        .unwrap()
        .details
        .job;

    let failed = h.wait_for_status(job.id, JobStatus::Failed, SETTLE).await.unwrap();
    // Straight to Failed: no retry was ever scheduled.
    assert!(failed.next_retry_at.is_none());
    assert_eq!(h.store.execution_rows(job.id).len(), 1);
    assert_eq!(h.dead_letters.count().await.unwrap(), 1);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn timeout_exhaustion_settles_as_timeout_status() {
    let h = harness().await;

    let job = h
        .handle
        .submit(
            JobSpec::new("never_finishes")
                .timeout_seconds(1)
                .retries(1, 2.0),
        )
        .await
        .unwrap()
        .details
        .job;

    let timed_out = h
        .wait_for_status(job.id, JobStatus::Timeout, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        timed_out.error_message.as_deref(),
        Some("Job timed out permanently")
    );
    let (entries, _) = h.handle.dead_letter_list(0, 10).await.unwrap();
    assert_eq!(entries[0].job_id, job.id);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn permanent_failure_cascades_through_descendants() {
    let h = harness().await;

    let parent = h
        .handle
        .submit(JobSpec::new("always_fails").retries(1, 2.0))
        .await
        .unwrap()
        .details
        .job;
    let c1 = h
        .handle
        .submit(JobSpec::new("work").depends_on([parent.id]))
        .await
        .unwrap()
        .details
        .job;
    let c2 = h
        .handle
        .submit(JobSpec::new("work").depends_on([c1.id]))
        .await
        .unwrap()
        .details
        .job;

    h.wait_for_status(parent.id, JobStatus::Failed, SETTLE).await.unwrap();
    let c1 = h.wait_for_status(c1.id, JobStatus::Failed, SETTLE).await.unwrap();
    let c2 = h.wait_for_status(c2.id, JobStatus::Failed, SETTLE).await.unwrap();
    assert_eq!(c1.error_message.as_deref(), Some("Dependency job failed"));
    assert_eq!(c2.error_message.as_deref(), Some("Dependency job failed"));

    // Only the root exhausted retries; the cascade does not dead-letter.
    assert_eq!(h.dead_letters.count().await.unwrap(), 1);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn transient_failures_recover_within_the_retry_budget() {
    let h = TestHarnessBuilder::new()
        .handler(
            "flaky",
            Arc::new(FailNTimesHandler::new(2, "transient glitch")),
        )
        .start()
        .await
        .unwrap();

    let job = h
        .handle
        .submit(JobSpec::new("flaky").retries(3, 2.0))
        .await
        .unwrap()
        .details
        .job;

    let done = h
        .wait_for_status(job.id, JobStatus::Completed, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(done.current_attempt, 2);
    assert_eq!(done.result.as_ref().unwrap()["recovered"], true);

    let executions = h.store.execution_rows(job.id);
    assert_eq!(executions.len(), 3);
    assert_eq!(h.dead_letters.count().await.unwrap(), 0);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn every_admitted_job_runs_exactly_once() {
    let counter = Arc::new(CountingHandler::new());
    let h = TestHarnessBuilder::new()
        .handler("counted", counter.clone())
        .start()
        .await
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(
            h.handle
                .submit(JobSpec::new("counted"))
                .await
                .unwrap()
                .details
                .job
                .id,
        );
    }
    for id in ids {
        h.wait_for_status(id, JobStatus::Completed, SETTLE).await.unwrap();
    }
    assert_eq!(counter.runs(), 5);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn idempotency_key_returns_the_same_job() {
    let h = harness().await;

    let first = h
        .handle
        .submit(JobSpec::new("work").idempotency_key("order-123"))
        .await
        .unwrap();
    let second = h
        .handle
        .submit(JobSpec::new("work").idempotency_key("order-123"))
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.details.job.id, second.details.job.id);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_rules_follow_job_state() {
    let h = harness().await;

    // A blocked job cancels cleanly.
    let parent = h
        .handle
        .submit(JobSpec::new("slow_work"))
        .await
        .unwrap()
        .details
        .job;
    let blocked = h
        .handle
        .submit(JobSpec::new("work").depends_on([parent.id]))
        .await
        .unwrap()
        .details
        .job;
    h.handle.cancel_job(blocked.id).await.unwrap();
    let cancelled = h.store.job(blocked.id).unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    // Cancelling again conflicts.
    let err = h.handle.cancel_job(blocked.id).await.unwrap_err();
    assert!(matches!(err, QueueError::StateConflict { .. }));
    assert_eq!(err.to_string(), "Job already cancelled");

    // A running job refuses cancellation.
    let running = h
        .handle
        .submit(JobSpec::new("never_finishes").timeout_seconds(30))
        .await
        .unwrap()
        .details
        .job;
    h.wait_for_status(running.id, JobStatus::Running, SETTLE).await.unwrap();
    let err = h.handle.cancel_job(running.id).await.unwrap_err();
    assert_eq!(err.to_string(), "Cannot cancel running job");

    // Unknown ids are a clean 404-shaped error.
    let err = h.handle.cancel_job(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelled_ready_job_never_runs_and_frees_its_slot() {
    let h = harness().await;

    // Plug the slot, queue a victim behind it, cancel the victim.
    let plug = h
        .handle
        .submit(JobSpec::new("slow_work").resources(8, 4096))
        .await
        .unwrap()
        .details
        .job;
    let victim = h
        .handle
        .submit(JobSpec::new("work").resources(8, 4096))
        .await
        .unwrap()
        .details
        .job;
    h.handle.cancel_job(victim.id).await.unwrap();

    h.wait_for_status(plug.id, JobStatus::Completed, SETTLE).await.unwrap();
    // Give the dispatcher time to pop the stale handle and discard it.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let victim = h.store.job(victim.id).unwrap();
    assert_eq!(victim.status, JobStatus::Cancelled);
    assert!(victim.started_at.is_none());
    assert!(h.store.execution_rows(victim.id).is_empty());

    let snapshot = h.queue.resources().await.unwrap();
    assert_eq!(snapshot.allocated_cpu, 0);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn queue_position_counts_higher_priority_and_earlier_peers() {
    let h = harness().await;

    // Plug the slot so nothing drains while we look.
    let _plug = h
        .handle
        .submit(JobSpec::new("slow_work").resources(8, 4096))
        .await
        .unwrap();

    let first = h
        .handle
        .submit(JobSpec::new("work").resources(8, 4096))
        .await
        .unwrap();
    let second = h
        .handle
        .submit(JobSpec::new("work").resources(8, 4096))
        .await
        .unwrap();
    let urgent = h
        .handle
        .submit(
            JobSpec::new("work")
                .priority(JobPriority::Critical)
                .resources(8, 4096),
        )
        .await
        .unwrap();

    assert_eq!(urgent.details.position_in_queue, Some(1));
    let first = h.handle.get_job(first.details.job.id).await.unwrap();
    let second = h.handle.get_job(second.details.job.id).await.unwrap();
    assert_eq!(first.position_in_queue, Some(2));
    assert_eq!(second.position_in_queue, Some(3));

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_job_type_falls_back_to_the_generic_handler() {
    let h = harness().await;

    let job = h
        .handle
        .submit(JobSpec::new("mystery_type"))
        .await
        .unwrap()
        .details
        .job;
    let done = h.wait_for_status(job.id, JobStatus::Completed, SETTLE).await.unwrap();
    assert_eq!(done.result.as_ref().unwrap()["generic_job_completed"], true);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn lifecycle_events_arrive_in_order() {
    let h = harness().await;
    let mut events = h.handle.subscribe();

    let job = h.handle.submit(JobSpec::new("work")).await.unwrap().details.job;
    h.wait_for_status(job.id, JobStatus::Completed, SETTLE).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = tokio::time::timeout(SETTLE, events.recv())
            .await
            .expect("event stream should not stall")
            .expect("bus should stay open");
        if event.job_id() == Some(job.id) {
            seen.push(event.name());
        }
    }
    assert_eq!(seen, vec!["job_created", "job_started", "job_completed"]);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn retry_events_report_one_based_attempts() {
    let h = harness().await;
    let mut events = h.handle.subscribe();

    let job = h
        .handle
        .submit(JobSpec::new("always_fails").retries(2, 2.0))
        .await
        .unwrap()
        .details
        .job;
    h.wait_for_status(job.id, JobStatus::Failed, SETTLE).await.unwrap();

    let mut retry_attempts = Vec::new();
    let mut saw_final_failure = false;
    while !saw_final_failure {
        let event = tokio::time::timeout(SETTLE, events.recv())
            .await
            .expect("event stream should not stall")
            .expect("bus should stay open");
        match event {
            JobEvent::RetryScheduled { job_id, attempt, max_attempts, .. }
                if job_id == job.id =>
            {
                assert_eq!(max_attempts, 2);
                retry_attempts.push(attempt);
            }
            JobEvent::Failed { job_id, final_attempt, .. } if job_id == job.id => {
                assert!(final_attempt);
                saw_final_failure = true;
            }
            _ => {}
        }
    }
    assert_eq!(retry_attempts, vec![1]);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn listing_filters_by_status_and_type_substring() {
    let h = harness().await;

    let worked = h.handle.submit(JobSpec::new("work")).await.unwrap().details.job;
    let failed = h
        .handle
        .submit(JobSpec::new("always_fails").retries(1, 2.0))
        .await
        .unwrap()
        .details
        .job;
    h.wait_for_status(worked.id, JobStatus::Completed, SETTLE).await.unwrap();
    h.wait_for_status(failed.id, JobStatus::Failed, SETTLE).await.unwrap();

    let filter = conveyor_core::JobFilter {
        status: Some(JobStatus::Failed),
        ..Default::default()
    };
    let (jobs, total) = h.handle.list_jobs(&filter, 1, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(jobs[0].job.id, failed.id);

    let filter = conveyor_core::JobFilter {
        job_type: Some("FAIL".to_string()),
        ..Default::default()
    };
    let (jobs, _) = h.handle.list_jobs(&filter, 1, 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.id, failed.id);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn dead_letter_retry_recreates_the_job_fresh() {
    let h = harness().await;

    let job = h
        .handle
        .submit(
            JobSpec::new("always_fails")
                .retries(1, 2.0)
                .payload(serde_json::json!({"order": 7})),
        )
        .await
        .unwrap()
        .details
        .job;
    h.wait_for_status(job.id, JobStatus::Failed, SETTLE).await.unwrap();

    let resubmitted = h.handle.retry_from_dead_letter(job.id).await.unwrap();
    let fresh = resubmitted.details.job;
    assert_ne!(fresh.id, job.id);
    assert_eq!(fresh.job_type, "always_fails");
    assert_eq!(fresh.payload["order"], 7);
    assert_eq!(fresh.priority, JobPriority::Normal);

    // The entry is gone; a second retry is a miss.
    assert_eq!(h.dead_letters.count().await.unwrap(), 0);
    let err = h.handle.retry_from_dead_letter(job.id).await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn metrics_roll_up_counts_and_success_rate() {
    let h = harness().await;

    let ok = h.handle.submit(JobSpec::new("work")).await.unwrap().details.job;
    let bad = h
        .handle
        .submit(JobSpec::new("always_fails").retries(1, 2.0))
        .await
        .unwrap()
        .details
        .job;
    h.wait_for_status(ok.id, JobStatus::Completed, SETTLE).await.unwrap();
    h.wait_for_status(bad.id, JobStatus::Failed, SETTLE).await.unwrap();

    let metrics = h.handle.metrics().await.unwrap();
    assert_eq!(metrics.job_counts["completed"], 1);
    assert_eq!(metrics.job_counts["failed"], 1);
    assert_eq!(metrics.success_rate_percent, 50.0);
    assert_eq!(metrics.dead_letter.total_failed, 1);

    let health = h.handle.health().await;
    assert_eq!(health.status, "healthy");

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_the_ledger_to_zero() {
    let h = harness().await;

    let job = h
        .handle
        .submit(
            JobSpec::new("never_finishes")
                .timeout_seconds(3600)
                .resources(8, 4096),
        )
        .await
        .unwrap()
        .details
        .job;
    h.wait_for_status(job.id, JobStatus::Running, SETTLE).await.unwrap();

    h.shutdown().await.unwrap();

    let snapshot = h.queue.resources().await.unwrap();
    assert_eq!(snapshot.allocated_cpu, 0);
    assert_eq!(snapshot.allocated_memory, 0);
}

#[tokio::test]
async fn randomized_burst_settles_with_the_ledger_drained() {
    let h = harness().await;

    let mut ids = Vec::new();
    for _ in 0..25 {
        let priority = match fastrand::u8(..4) {
            0 => JobPriority::Critical,
            1 => JobPriority::High,
            2 => JobPriority::Normal,
            _ => JobPriority::Low,
        };
        let spec = JobSpec::new("work")
            .priority(priority)
            .resources(1 + fastrand::u32(..4), 64 + fastrand::u64(..512));
        ids.push(h.handle.submit(spec).await.unwrap().details.job.id);
    }

    for id in ids {
        h.wait_for_status(id, JobStatus::Completed, Duration::from_secs(15))
            .await
            .unwrap();
    }

    let snapshot = h.queue.resources().await.unwrap();
    assert_eq!(snapshot.allocated_cpu, 0);
    assert_eq!(snapshot.allocated_memory, 0);
    let counts = h.store.count_by_status().await.unwrap();
    assert_eq!(counts[&JobStatus::Completed], 25);

    h.shutdown().await.unwrap();
}

#[tokio::test]
async fn startup_recovery_re_admits_orphaned_running_jobs() {
    // Simulate a crash: a job sits Running in the store with no worker.
    let store = Arc::new(MemoryStateStore::new());
    let orphan = store
        .create_job(&JobSpec::new("work"))
        .await
        .unwrap()
        .into_job();
    store
        .set_status(orphan.id, JobStatus::Running, StatusPatch::default())
        .await
        .unwrap();

    let handle = EngineBuilder::new(fast_config(), store.clone())
        .with_handler("work", Arc::new(SucceedingHandler::instant()))
        .build()
        .start()
        .await
        .unwrap();

    // Recovery resets it to Pending and the retry scan runs it to completion.
    let end = tokio::time::Instant::now() + SETTLE;
    loop {
        let current = store.job(orphan.id).unwrap();
        if current.status == JobStatus::Completed {
            assert_eq!(current.current_attempt, 0);
            break;
        }
        assert!(tokio::time::Instant::now() < end, "orphan never recovered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle.shutdown().await.unwrap();
}
