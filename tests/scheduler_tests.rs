//! Integration tests for the round-robin and parallel orchestrators.

mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use batch_orchestrator::config::SchedulerMode;
use batch_orchestrator::models::tenant::{RunStatus, TenantKind};
use batch_orchestrator::models::work_unit::{STALE_ERROR_MESSAGE, WorkUnitStatus};
use batch_orchestrator::period::Period;
use batch_orchestrator::repositories::{TenantRepository, WorkUnitRepository};
use batch_orchestrator::scheduler::{
    CycleOutcome, EligibilitySelector, Orchestrator, ParallelOrchestrator, Reaper,
    RotationCursor, RoundRobinOrchestrator, RunOutcome, SchedulerContext, SchedulerError,
};
use test_utils::{
    Script, ScriptedPipeline, create_tenant, setup_test_db, test_context, test_scheduler_config,
};
use tokio_util::sync::CancellationToken;

fn round_robin(context: SchedulerContext) -> RoundRobinOrchestrator {
    RoundRobinOrchestrator::new(context, Arc::new(RotationCursor::new()))
}

#[tokio::test]
async fn round_robin_visits_tenants_in_index_order_regardless_of_outcome() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();

    let mut ids = Vec::new();
    for (index, name) in ["ADV001", "ADV002", "ADV003", "ADV004", "ADV005"]
        .iter()
        .enumerate()
    {
        let tenant = create_tenant(&db, name, TenantKind::Existing, index as i32)
            .await
            .unwrap();
        ids.push(tenant.id);
    }
    pipeline.script(ids[2], Script::Fail("boom".into()));

    let orchestrator = round_robin(test_context(&db, pipeline.clone(), SchedulerMode::RoundRobin));
    for _ in 0..7 {
        let outcome = orchestrator.select_and_dispatch().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Dispatched { .. }));
    }

    let expected = vec![ids[0], ids[1], ids[2], ids[3], ids[4], ids[0], ids[1]];
    assert_eq!(pipeline.tenants_called(), expected);
    assert!(pipeline.calls().iter().all(|call| call.period.is_none()));

    let failing = TenantRepository::new(db.clone()).get(ids[2]).await.unwrap();
    assert_eq!(failing.failure_count, 1);
    assert_eq!(failing.last_run_status, RunStatus::Failed);
}

#[tokio::test]
async fn repeatedly_failing_tenant_is_excluded_without_affecting_others() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let x = create_tenant(&db, "X", TenantKind::Existing, 0).await.unwrap();
    let y = create_tenant(&db, "Y", TenantKind::Existing, 1).await.unwrap();
    let z = create_tenant(&db, "Z", TenantKind::Existing, 2).await.unwrap();
    pipeline.script(x.id, Script::Fail("upstream rejected the batch".into()));

    let orchestrator = round_robin(test_context(&db, pipeline.clone(), SchedulerMode::RoundRobin));
    for _ in 0..12 {
        orchestrator.select_and_dispatch().await.unwrap();
    }

    let calls = pipeline.tenants_called();
    assert_eq!(calls.iter().filter(|id| **id == x.id).count(), 3);
    assert!(calls.iter().filter(|id| **id == y.id).count() >= 4);
    assert!(calls.iter().filter(|id| **id == z.id).count() >= 4);

    let tenants = TenantRepository::new(db.clone());
    let x = tenants.get(x.id).await.unwrap();
    assert!(!x.enabled);
    assert_eq!(x.failure_count, 3);

    let eligible = EligibilitySelector::new(tenants.clone())
        .list_eligible()
        .await
        .unwrap();
    let eligible_ids: Vec<_> = eligible.iter().map(|t| t.id).collect();
    assert_eq!(eligible_ids, vec![y.id, z.id]);

    // Disabled tenants stay queryable and can be reset by an operator.
    let reset = tenants.reset(x.id).await.unwrap();
    assert!(reset.is_eligible());
}

#[tokio::test]
async fn empty_registry_is_an_idle_cycle() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let orchestrator = round_robin(test_context(&db, pipeline.clone(), SchedulerMode::RoundRobin));

    let outcome = orchestrator.select_and_dispatch().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Idle);
    assert!(pipeline.calls().is_empty());
}

#[tokio::test]
async fn dispatch_deadline_records_failure_and_moves_on() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let stuck = create_tenant(&db, "stuck", TenantKind::Existing, 0).await.unwrap();
    pipeline.script(stuck.id, Script::Hang);

    let orchestrator = round_robin(test_context(&db, pipeline.clone(), SchedulerMode::RoundRobin));
    let started = std::time::Instant::now();
    let outcome = orchestrator.select_and_dispatch().await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Dispatched {
            tenant_id: stuck.id,
            outcome: RunOutcome::TimedOut
        }
    );
    assert!(started.elapsed() < Duration::from_secs(5));

    let stuck = TenantRepository::new(db.clone()).get(stuck.id).await.unwrap();
    assert_eq!(stuck.failure_count, 1);
    assert_eq!(stuck.last_run_status, RunStatus::Failed);
    assert!(stuck.run_started_at.is_none());
}

#[tokio::test]
async fn success_clears_earlier_failures() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let tenant = create_tenant(&db, "flaky", TenantKind::Existing, 0).await.unwrap();
    let orchestrator = round_robin(test_context(&db, pipeline.clone(), SchedulerMode::RoundRobin));

    pipeline.script(tenant.id, Script::Fail("first".into()));
    orchestrator.select_and_dispatch().await.unwrap();
    orchestrator.select_and_dispatch().await.unwrap();
    pipeline.script(tenant.id, Script::Succeed(10));
    let outcome = orchestrator.select_and_dispatch().await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Dispatched {
            tenant_id: tenant.id,
            outcome: RunOutcome::Succeeded { processed: 10 }
        }
    );
    let tenant = TenantRepository::new(db.clone()).get(tenant.id).await.unwrap();
    assert_eq!(tenant.failure_count, 0);
    assert!(tenant.enabled);
    assert_eq!(tenant.last_run_status, RunStatus::Success);
}

#[tokio::test]
async fn trigger_respects_eligibility() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let tenant = create_tenant(&db, "manual", TenantKind::Existing, 0).await.unwrap();
    let orchestrator = round_robin(test_context(&db, pipeline.clone(), SchedulerMode::RoundRobin));

    let missing = orchestrator.trigger(uuid::Uuid::new_v4()).await;
    assert!(matches!(missing, Err(SchedulerError::TenantNotFound(_))));

    let tenants = TenantRepository::new(db.clone());
    tenants.deactivate(tenant.id).await.unwrap();
    let inactive = orchestrator.trigger(tenant.id).await;
    assert!(matches!(inactive, Err(SchedulerError::NotEligible(_))));

    tenants.activate(tenant.id).await.unwrap();
    pipeline.script(tenant.id, Script::SlowSucceed(Duration::from_millis(300)));
    let accepted = orchestrator.trigger(tenant.id).await.unwrap();
    assert_eq!(accepted.tenant_id, tenant.id);
    assert_eq!(accepted.period, None);

    // Claimed until the background run finishes.
    let again = orchestrator.trigger(tenant.id).await;
    assert!(matches!(again, Err(SchedulerError::NotEligible(_))));

    orchestrator.drain().await;
    assert_eq!(pipeline.tenants_called(), vec![tenant.id]);
    let tenant = tenants.get(tenant.id).await.unwrap();
    assert_eq!(tenant.last_run_status, RunStatus::Success);
    assert_eq!(accepted.attempt, Some(tenant.attempt));
}

#[tokio::test]
async fn parallel_cycle_runs_current_period_once_per_existing_tenant() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        ids.push(create_tenant(&db, name, TenantKind::Existing, 0).await.unwrap().id);
    }

    let orchestrator =
        ParallelOrchestrator::new(test_context(&db, pipeline.clone(), SchedulerMode::Parallel));
    let first = orchestrator.select_and_dispatch().await.unwrap();
    orchestrator.drain().await;
    match first {
        CycleOutcome::Fanout(report) => {
            assert_eq!(report.considered, 3);
            assert_eq!(report.dispatched, 3);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let current = Period::current();
    assert!(pipeline.calls().iter().all(|call| call.period == Some(current)));

    let units = WorkUnitRepository::new(db.clone());
    for id in &ids {
        let unit = units.find(*id, current).await.unwrap().unwrap();
        assert_eq!(unit.status, WorkUnitStatus::Completed);
        assert_eq!(unit.processed_count, 1);
    }

    // Completed periods are not dispatched again.
    let second = orchestrator.select_and_dispatch().await.unwrap();
    orchestrator.drain().await;
    match second {
        CycleOutcome::Fanout(report) => assert_eq!(report.dispatched, 0),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(pipeline.calls().len(), 3);
}

#[tokio::test]
async fn new_tenant_backfills_months_in_order_then_becomes_existing() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let tenant = create_tenant(&db, "newcomer", TenantKind::New, 0).await.unwrap();
    let start = Period::current().months_before(24);
    assert_eq!(tenant.backfill_start(), Some(start));

    let orchestrator =
        ParallelOrchestrator::new(test_context(&db, pipeline.clone(), SchedulerMode::Parallel));
    for _ in 0..30 {
        orchestrator.select_and_dispatch().await.unwrap();
        orchestrator.drain().await;
    }

    let periods: Vec<Period> = pipeline
        .calls()
        .into_iter()
        .map(|call| call.period.unwrap())
        .collect();
    assert_eq!(periods, Period::range_inclusive(start, Period::current()));

    let tenant = TenantRepository::new(db.clone()).get(tenant.id).await.unwrap();
    assert_eq!(tenant.kind, TenantKind::Existing);
    assert!(tenant.backfill_completed);
    assert_eq!(tenant.last_completed(), Some(Period::current()));

    let units = WorkUnitRepository::new(db.clone())
        .list_for_tenant(tenant.id)
        .await
        .unwrap();
    assert_eq!(units.len(), 25);
    assert!(units.iter().all(|unit| unit.status == WorkUnitStatus::Completed));
}

#[tokio::test]
async fn failing_backfill_period_blocks_later_periods() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let tenant = create_tenant(&db, "blocked", TenantKind::New, 0).await.unwrap();
    pipeline.script(tenant.id, Script::Fail("schema mismatch".into()));

    let orchestrator =
        ParallelOrchestrator::new(test_context(&db, pipeline.clone(), SchedulerMode::Parallel));
    for _ in 0..5 {
        orchestrator.select_and_dispatch().await.unwrap();
        orchestrator.drain().await;
    }

    let start = tenant.backfill_start().unwrap();
    assert!(pipeline.calls().iter().all(|call| call.period == Some(start)));
    // Three failures disable the tenant before retries run out.
    assert_eq!(pipeline.calls().len(), 3);

    let units = WorkUnitRepository::new(db.clone())
        .list_for_tenant(tenant.id)
        .await
        .unwrap();
    assert_eq!(units[0].status, WorkUnitStatus::Failed);
    assert_eq!(units[0].retry_count, 2);
    assert_eq!(units[0].processed_count, 2);
    assert!(units[1..].iter().all(|unit| unit.status == WorkUnitStatus::Pending));

    let tenant = TenantRepository::new(db.clone()).get(tenant.id).await.unwrap();
    assert!(!tenant.enabled);
}

#[tokio::test]
async fn parallel_runs_never_exceed_the_worker_bound() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    for index in 0..6 {
        let tenant = create_tenant(&db, &format!("t{index}"), TenantKind::Existing, 0)
            .await
            .unwrap();
        pipeline.script(tenant.id, Script::SlowSucceed(Duration::from_millis(150)));
    }

    let mut config = test_scheduler_config(SchedulerMode::Parallel);
    config.max_concurrent_jobs = 2;
    let context = SchedulerContext::new(
        db.clone(),
        pipeline.clone(),
        config,
        CancellationToken::new(),
    );
    let orchestrator = ParallelOrchestrator::new(context);

    let outcome = orchestrator.select_and_dispatch().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Fanout(ref report) if report.dispatched == 6));
    orchestrator.drain().await;

    assert_eq!(pipeline.calls().len(), 6);
    assert!(pipeline.peak_concurrency() <= 2);
    assert!(TenantRepository::new(db.clone())
        .list_running()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn parallel_trigger_reports_the_dispatched_period() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let tenant = create_tenant(&db, "manual", TenantKind::Existing, 0).await.unwrap();
    let orchestrator =
        ParallelOrchestrator::new(test_context(&db, pipeline.clone(), SchedulerMode::Parallel));

    let accepted = orchestrator.trigger(tenant.id).await.unwrap();
    assert_eq!(accepted.period, Some(Period::current()));
    orchestrator.drain().await;

    // The current period is done, so there is nothing left to trigger.
    let again = orchestrator.trigger(tenant.id).await;
    assert!(matches!(again, Err(SchedulerError::NothingToDispatch(_))));
}

fn parallel_with_workers(
    db: &sea_orm::DatabaseConnection,
    pipeline: Arc<ScriptedPipeline>,
    workers: usize,
    shutdown: CancellationToken,
) -> ParallelOrchestrator {
    let mut config = test_scheduler_config(SchedulerMode::Parallel);
    config.max_concurrent_jobs = workers;
    ParallelOrchestrator::new(SchedulerContext::new(db.clone(), pipeline, config, shutdown))
}

#[tokio::test]
async fn queued_runs_are_not_reaped_while_waiting_for_a_worker() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let mut ids = Vec::new();
    for index in 0..4 {
        let tenant = create_tenant(&db, &format!("slow{index}"), TenantKind::Existing, 0)
            .await
            .unwrap();
        pipeline.script(tenant.id, Script::Hang);
        ids.push(tenant.id);
    }

    let orchestrator = parallel_with_workers(&db, pipeline.clone(), 1, CancellationToken::new());
    let reaper = Reaper::new(
        TenantRepository::new(db.clone()),
        WorkUnitRepository::new(db.clone()),
        Arc::new(RotationCursor::new()),
        Duration::from_secs(2),
        Duration::from_secs(1),
    );

    let outcome = orchestrator.select_and_dispatch().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Fanout(ref report) if report.dispatched == 4));

    // Two runs have timed out; the last tenant has only waited in the queue.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let report = reaper.sweep().await.unwrap();
    assert!(report.is_empty(), "unexpected reclaim: {report:?}");

    orchestrator.drain().await;
    assert_eq!(pipeline.calls().len(), 4);

    let tenants = TenantRepository::new(db.clone());
    let units = WorkUnitRepository::new(db.clone());
    for id in ids {
        let tenant = tenants.get(id).await.unwrap();
        assert_eq!(tenant.failure_count, 1);
        assert_eq!(tenant.last_run_status, RunStatus::Failed);

        let unit = units.find(id, Period::current()).await.unwrap().unwrap();
        assert_eq!(unit.status, WorkUnitStatus::Failed);
        assert_ne!(unit.error_message.as_deref(), Some(STALE_ERROR_MESSAGE));
    }
}

#[tokio::test]
async fn reset_during_a_run_discards_its_late_result() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let tenant = create_tenant(&db, "reset-mid-run", TenantKind::Existing, 0)
        .await
        .unwrap();
    pipeline.script(tenant.id, Script::SlowSucceed(Duration::from_millis(300)));

    let orchestrator = Arc::new(round_robin(test_context(
        &db,
        pipeline.clone(),
        SchedulerMode::RoundRobin,
    )));
    let cycle = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.select_and_dispatch().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let tenants = TenantRepository::new(db.clone());
    let reset = tenants.reset(tenant.id).await.unwrap();
    assert_eq!(reset.last_run_status, RunStatus::Pending);

    let outcome = cycle.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Dispatched {
            tenant_id: tenant.id,
            outcome: RunOutcome::Discarded
        }
    );

    let after = tenants.get(tenant.id).await.unwrap();
    assert_eq!(after.last_run_status, RunStatus::Pending);
    assert!(after.last_run_at.is_none());
    assert!(after.is_eligible());
}

#[tokio::test]
async fn shutdown_interrupts_a_run_without_charging_the_tenant() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let tenant = create_tenant(&db, "interrupted", TenantKind::Existing, 0)
        .await
        .unwrap();
    pipeline.script(tenant.id, Script::Hang);

    let context = test_context(&db, pipeline.clone(), SchedulerMode::RoundRobin);
    let shutdown = context.shutdown.clone();
    let orchestrator = Arc::new(round_robin(context));
    let cycle = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.select_and_dispatch().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();

    let outcome = cycle.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Dispatched {
            tenant_id: tenant.id,
            outcome: RunOutcome::Interrupted
        }
    );

    let released = TenantRepository::new(db.clone()).get(tenant.id).await.unwrap();
    assert_eq!(released.last_run_status, RunStatus::Pending);
    assert_eq!(released.failure_count, 0);
    assert!(released.run_started_at.is_none());
    assert!(released.is_eligible());
}

#[tokio::test]
async fn shutdown_drops_queued_parallel_runs_before_they_claim() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let mut ids = Vec::new();
    for index in 0..3 {
        let tenant = create_tenant(&db, &format!("queued{index}"), TenantKind::Existing, 0)
            .await
            .unwrap();
        pipeline.script(tenant.id, Script::Hang);
        ids.push(tenant.id);
    }

    let shutdown = CancellationToken::new();
    let orchestrator = parallel_with_workers(&db, pipeline.clone(), 1, shutdown.clone());
    orchestrator.select_and_dispatch().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    orchestrator.drain().await;

    let called = pipeline.tenants_called();
    assert_eq!(called.len(), 1);

    let tenants = TenantRepository::new(db.clone());
    let units = WorkUnitRepository::new(db.clone());
    for id in ids {
        let tenant = tenants.get(id).await.unwrap();
        assert_eq!(tenant.failure_count, 0);
        assert_eq!(tenant.last_run_status, RunStatus::Pending);

        let unit = units.find(id, Period::current()).await.unwrap();
        if called.contains(&id) {
            // The running job was cancelled and gave its claim back.
            assert_eq!(unit.unwrap().status, WorkUnitStatus::Failed);
        } else {
            assert!(unit.is_none(), "queued tenant {id} should not have started a unit");
        }
    }
    assert!(tenants.list_running().await.unwrap().is_empty());
}

#[tokio::test]
async fn trigger_queues_behind_busy_workers() {
    let db = setup_test_db().await.unwrap();
    let pipeline = ScriptedPipeline::new();
    let busy = create_tenant(&db, "busy", TenantKind::Existing, 0).await.unwrap();
    let waiting = create_tenant(&db, "waiting", TenantKind::Existing, 1).await.unwrap();
    pipeline.script(busy.id, Script::SlowSucceed(Duration::from_millis(300)));

    let orchestrator = parallel_with_workers(&db, pipeline.clone(), 1, CancellationToken::new());
    let first = orchestrator.trigger(busy.id).await.unwrap();
    assert_eq!(first.attempt, Some(1));

    let queued = orchestrator.trigger(waiting.id).await.unwrap();
    assert_eq!(queued.attempt, None);
    assert_eq!(queued.period, Some(Period::current()));

    let tenants = TenantRepository::new(db.clone());
    assert_eq!(
        tenants.get(waiting.id).await.unwrap().last_run_status,
        RunStatus::Pending
    );
    let duplicate = orchestrator.trigger(waiting.id).await;
    assert!(matches!(duplicate, Err(SchedulerError::NotEligible(_))));

    orchestrator.drain().await;
    assert_eq!(pipeline.tenants_called(), vec![busy.id, waiting.id]);
    assert_eq!(
        tenants.get(waiting.id).await.unwrap().last_run_status,
        RunStatus::Success
    );
}
