//! Integration tests for the full pipeline on volatile backends.
//!
//! Tests: JobService::submit → JobStore → MessageBus → Dispatcher → Executor → JobStore
//!
//! Verifies:
//! - The dispatcher never runs more than `max_concurrency` executions at once
//! - A faulting executor does not wedge a single-slot pool
//! - Pollers only ever observe a prefix of the status lifecycle
//! - Rate limiting rejects exactly the over-quota submission

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use jobrelay_bus::InMemoryMessageBus;
use jobrelay_core::{ExecutionOutput, JobId, JobStatus, JobView};

use crate::jobs::{
    Dispatcher, DispatcherConfig, DispatcherHandle, ExecutionError, Executor, FnExecutor,
    InMemoryJobStore, JobStore,
};
use crate::rate_limit::InMemoryRateLimiter;
use crate::service::{JobService, ServiceError};

fn output(locator: &str) -> ExecutionOutput {
    ExecutionOutput {
        metadata: serde_json::json!({ "source": locator }),
        result_locator: format!("/artifacts/{locator}"),
    }
}

struct Pipeline {
    service: JobService,
    store: Arc<InMemoryJobStore>,
    bus: Arc<InMemoryMessageBus>,
    dispatcher: DispatcherHandle,
}

impl Pipeline {
    async fn start(executor: Arc<dyn Executor>, max_concurrency: usize, quota: i64) -> Self {
        let store = InMemoryJobStore::arc();
        let bus = Arc::new(InMemoryMessageBus::new(100));
        let limiter = Arc::new(InMemoryRateLimiter::new(quota, Duration::from_secs(60)));

        let dispatcher = Dispatcher::new(
            store.clone(),
            executor,
            DispatcherConfig::default()
                .with_name("test-dispatcher")
                .with_max_concurrency(max_concurrency),
        )
        .start(bus.as_ref())
        .await
        .unwrap();

        Self {
            service: JobService::new(store.clone(), bus.clone(), limiter),
            store,
            bus,
            dispatcher,
        }
    }

    async fn drain(self) {
        self.dispatcher.shutdown(self.bus.as_ref()).await;
    }

    async fn wait_terminal(&self, id: JobId) -> JobView {
        for _ in 0..500 {
            let view = self.service.status(&id.to_string()).await.unwrap();
            if view.status.is_terminal() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }
}

/// Records the highest number of overlapping executions.
#[derive(Default)]
struct GaugedExecutor {
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Executor for GaugedExecutor {
    async fn execute(&self, source_locator: &str) -> Result<ExecutionOutput, ExecutionError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(output(source_locator))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_pool_size() {
    let executor = Arc::new(GaugedExecutor::default());
    let pipeline = Pipeline::start(executor.clone(), 3, 0).await;

    let mut ids = Vec::new();
    for n in 0..12 {
        ids.push(pipeline.service.submit("client", &format!("src-{n}")).await.unwrap().job_id);
    }
    for id in &ids {
        assert_eq!(pipeline.wait_terminal(*id).await.status, JobStatus::Completed);
    }

    let peak = executor.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak}");
    assert!(peak >= 2, "pool never ran in parallel");
    pipeline.drain().await;
}

#[tokio::test]
async fn faulting_executor_does_not_block_single_slot_pool() {
    let executor: Arc<dyn Executor> = Arc::new(FnExecutor::new(|locator: String| async move {
        match locator.as_str() {
            "explode" => panic!("executor blew up"),
            "refuse" => Err(ExecutionError::new("unsupported source")),
            _ => Ok(output(&locator)),
        }
    }));
    let pipeline = Pipeline::start(executor, 1, 0).await;

    let boom = pipeline.service.submit("c", "explode").await.unwrap().job_id;
    let refused = pipeline.service.submit("c", "refuse").await.unwrap().job_id;
    let fine = pipeline.service.submit("c", "fine").await.unwrap().job_id;

    let boom = pipeline.wait_terminal(boom).await;
    assert_eq!(boom.status, JobStatus::Failed);
    assert!(boom.error_message.unwrap().starts_with("executor panicked"));

    let refused = pipeline.wait_terminal(refused).await;
    assert_eq!(refused.error_message.as_deref(), Some("unsupported source"));

    let fine = pipeline.wait_terminal(fine).await;
    assert_eq!(fine.status, JobStatus::Completed);
    assert_eq!(fine.result_metadata.unwrap()["source"], "fine");

    let stats = pipeline.dispatcher.stats();
    assert_eq!(stats.jobs_failed, 2);
    assert_eq!(stats.jobs_succeeded, 1);
    pipeline.drain().await;
}

#[tokio::test]
async fn single_slot_pool_serialises_jobs() {
    let executor: Arc<dyn Executor> = Arc::new(FnExecutor::new(|locator: String| async move {
        if locator == "slow" {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(output(&locator))
    }));
    let pipeline = Pipeline::start(executor, 1, 0).await;

    let slow = pipeline.service.submit("c", "slow").await.unwrap().job_id;
    let quick = pipeline.service.submit("c", "quick").await.unwrap().job_id;

    let slow = pipeline.wait_terminal(slow).await;
    let quick = pipeline.wait_terminal(quick).await;
    assert!(quick.started_at.unwrap() >= slow.completed_at.unwrap());
    pipeline.drain().await;
}

#[tokio::test]
async fn submissions_over_quota_are_rejected() {
    let executor: Arc<dyn Executor> =
        Arc::new(FnExecutor::new(|locator: String| async move { Ok(output(&locator)) }));
    let pipeline = Pipeline::start(executor, 2, 2).await;

    let first = pipeline.service.submit("A", "one").await.unwrap();
    let second = pipeline.service.submit("A", "two").await.unwrap();
    assert_eq!(first.remaining_quota, Some(1));
    assert_eq!(second.remaining_quota, Some(0));
    assert_eq!(
        pipeline.service.submit("A", "three").await,
        Err(ServiceError::RateLimited { remaining: 0 })
    );

    // Another client has its own allowance.
    assert!(pipeline.service.submit("B", "other").await.is_ok());
    assert_eq!(pipeline.store.len(), 3);
    pipeline.drain().await;
}

#[tokio::test]
async fn quota_returns_after_window_rolls_over() {
    let store = InMemoryJobStore::arc();
    let bus = Arc::new(InMemoryMessageBus::new(10));
    let limiter = Arc::new(InMemoryRateLimiter::new(2, Duration::from_millis(100)));
    let service = JobService::new(store, bus, limiter);

    service.submit("A", "1").await.unwrap();
    service.submit("A", "2").await.unwrap();
    assert!(matches!(
        service.submit("A", "3").await,
        Err(ServiceError::RateLimited { .. })
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(service.submit("A", "4").await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pollers_observe_a_lifecycle_prefix() {
    let executor: Arc<dyn Executor> = Arc::new(FnExecutor::new(|locator: String| async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        if locator.ends_with('3') {
            Err(ExecutionError::new("odd one out"))
        } else {
            Ok(output(&locator))
        }
    }));
    let pipeline = Pipeline::start(executor, 2, 0).await;

    let mut ids = Vec::new();
    for n in 0..6 {
        ids.push(pipeline.service.submit("c", &format!("job-{n}")).await.unwrap().job_id);
    }

    let mut history: Vec<Vec<JobStatus>> = vec![Vec::new(); ids.len()];
    for _ in 0..300 {
        let mut done = true;
        for (i, id) in ids.iter().enumerate() {
            let status = pipeline.store.get(*id).await.unwrap().status();
            if history[i].last() != Some(&status) {
                history[i].push(status);
            }
            done &= status.is_terminal();
        }
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Polling can miss a state, but never sees one out of order.
    let rank = |s: &JobStatus| match s {
        JobStatus::Pending => 0,
        JobStatus::Processing => 1,
        JobStatus::Completed | JobStatus::Failed => 2,
    };
    for seen in &history {
        assert!(seen.last().is_some_and(JobStatus::is_terminal), "{seen:?}");
        assert!(seen.windows(2).all(|w| rank(&w[0]) < rank(&w[1])), "{seen:?}");
    }
    pipeline.drain().await;
}

#[tokio::test]
async fn shutdown_finishes_in_flight_jobs_and_refuses_new_ones() {
    let executor: Arc<dyn Executor> = Arc::new(FnExecutor::new(|locator: String| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(output(&locator))
    }));
    let pipeline = Pipeline::start(executor, 2, 0).await;

    let a = pipeline.service.submit("c", "a").await.unwrap().job_id;
    let b = pipeline.service.submit("c", "b").await.unwrap().job_id;

    let service = pipeline.service.clone();
    let store = pipeline.store.clone();
    let bus = pipeline.bus.clone();
    pipeline.dispatcher.shutdown(bus.as_ref()).await;

    assert_eq!(store.get(a).await.unwrap().status(), JobStatus::Completed);
    assert_eq!(store.get(b).await.unwrap().status(), JobStatus::Completed);
    assert!(matches!(
        service.submit("c", "late").await,
        Err(ServiceError::Bus(jobrelay_bus::BusError::QueueClosed))
    ));
    assert!(bus.is_closed());
}
