use crate::model::{ExtractionTask, TaskResult};
use crate::traits::{TaskError, TaskWorker};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, instrument, warn};

/// Pool-wide conditions that abort a whole batch.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Stage '{stage}' interrupted with {pending} task(s) unfinished")]
    Interrupted { stage: String, pending: usize },

    #[error("Worker pool unavailable: {0}")]
    PoolClosed(String),
}

/// Results of one drained batch, in task submission order.
#[derive(Debug)]
pub struct BatchReport<O> {
    pub stage: &'static str,
    pub results: Vec<TaskResult>,
    /// Outputs of the successful tasks, keyed by task id
    pub outputs: Vec<(String, O)>,
    pub duration: Duration,
}

impl<O> BatchReport<O> {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.total() - self.success_count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn summary(&self) -> StageSummary {
        StageSummary {
            stage: self.stage.to_string(),
            total: self.total(),
            succeeded: self.success_count(),
            failures: self.failures().cloned().collect(),
            duration_ms: self.duration.as_millis() as u64,
        }
    }

    fn log_summary(&self) {
        let failed = self.failure_count();
        info!(
            stage = self.stage,
            total = self.total(),
            succeeded = self.success_count(),
            failed,
            duration_ms = self.duration.as_millis() as u64,
            "Batch finished"
        );
        if failed > 0 {
            warn!(stage = self.stage, "Failed tasks:");
            for result in self.failures() {
                warn!(stage = self.stage, "  {}", result);
            }
        }
    }
}

/// Serializable per-stage counts for the run report.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: String,
    pub total: usize,
    pub succeeded: usize,
    pub failures: Vec<TaskResult>,
    pub duration_ms: u64,
}

/// Runs a batch of independent tasks on a bounded pool.
///
/// A fresh scheduler (or a shared reference to one) is handed to each stage;
/// there is no process-wide task state.
pub struct TaskScheduler {
    semaphore: Arc<Semaphore>,
    workers: usize,
    shutdown: Option<watch::Receiver<bool>>,
}

impl TaskScheduler {
    pub fn new(concurrency_limit: usize) -> Self {
        let workers = concurrency_limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
            shutdown: None,
        }
    }

    /// Stops dispatch and aborts in-flight tasks once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Executes every task with `worker` and waits for the batch to drain.
    ///
    /// Task errors and panics become failed [`TaskResult`]s; only an
    /// interrupt or a closed pool aborts the batch.
    #[instrument(skip_all, fields(stage = worker.stage_name(), tasks = tasks.len()))]
    pub async fn run<W>(
        &self,
        worker: Arc<W>,
        tasks: Vec<ExtractionTask>,
    ) -> Result<BatchReport<W::Output>, SchedulerError>
    where
        W: TaskWorker,
    {
        let stage = worker.stage_name();
        let started = Instant::now();
        let total = tasks.len();

        if tasks.is_empty() {
            warn!(stage, "No tasks to run");
        } else {
            info!(stage, total, workers = self.workers, "Starting batch");
        }

        let mut shutdown = self.shutdown.clone();
        let mut join_set = JoinSet::new();
        let mut slots: Vec<Option<(TaskResult, Option<W::Output>)>> =
            (0..total).map(|_| None).collect();

        for (index, task) in tasks.into_iter().enumerate() {
            if shutdown_flagged(&shutdown) {
                return Err(abort(&mut join_set, stage, total - index).await);
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(e) => {
                            join_set.shutdown().await;
                            return Err(SchedulerError::PoolClosed(e.to_string()));
                        }
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {
                    return Err(abort(&mut join_set, stage, total - index).await);
                }
            };

            let worker = Arc::clone(&worker);
            join_set.spawn(async move {
                let _permit = permit;
                let task_id = task.id();
                // The nested spawn turns a panicking worker into a JoinError
                // we can still attribute to this task. Dropping the guard
                // (when this wrapper is aborted) cancels the worker too.
                let mut inner = AbortOnDrop(tokio::spawn(async move { worker.run(task).await }));
                let outcome = match (&mut inner.0).await {
                    Ok(outcome) => outcome,
                    Err(join_error) => Err(TaskError::Panicked(join_error.to_string())),
                };
                (index, task_id, outcome)
            });
        }

        loop {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(joined) => store(&mut slots, joined)?,
                    None => break,
                },
                _ = shutdown_requested(&mut shutdown) => {
                    let pending = join_set.len();
                    return Err(abort(&mut join_set, stage, pending).await);
                }
            }
        }

        let mut results = Vec::with_capacity(total);
        let mut outputs = Vec::new();
        for (result, output) in slots.into_iter().flatten() {
            if let Some(output) = output {
                outputs.push((result.task_id.clone(), output));
            }
            results.push(result);
        }

        let report = BatchReport {
            stage,
            results,
            outputs,
            duration: started.elapsed(),
        };
        report.log_summary();
        Ok(report)
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

type Joined<O> = Result<(usize, String, Result<O, TaskError>), tokio::task::JoinError>;

fn store<O>(
    slots: &mut [Option<(TaskResult, Option<O>)>],
    joined: Joined<O>,
) -> Result<(), SchedulerError> {
    let (index, task_id, outcome) =
        joined.map_err(|e| SchedulerError::PoolClosed(format!("Task join error: {}", e)))?;
    slots[index] = Some(match outcome {
        Ok(output) => (TaskResult::succeeded(task_id), Some(output)),
        Err(e) => (TaskResult::failed(task_id, e.to_string()), None),
    });
    Ok(())
}

async fn abort<T: 'static>(
    join_set: &mut JoinSet<T>,
    stage: &str,
    pending: usize,
) -> SchedulerError {
    warn!(stage, pending, "Interrupt received, abandoning in-flight tasks");
    join_set.shutdown().await;
    SchedulerError::Interrupted {
        stage: stage.to_string(),
        pending,
    }
}

fn shutdown_flagged(shutdown: &Option<watch::Receiver<bool>>) -> bool {
    shutdown.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
}

/// Resolves once shutdown is requested; never resolves without a receiver
/// or after the sender is gone.
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = shutdown.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FailingOn {
        bad: &'static str,
    }

    #[async_trait]
    impl TaskWorker for FailingOn {
        type Output = usize;

        fn stage_name(&self) -> &'static str {
            "test-stage"
        }

        async fn run(&self, task: ExtractionTask) -> Result<usize, TaskError> {
            if task.id() == self.bad {
                return Err(TaskError::ExtractionFailed("corrupted".into()));
            }
            Ok(task.id().len())
        }
    }

    struct Panicking;

    #[async_trait]
    impl TaskWorker for Panicking {
        type Output = ();

        fn stage_name(&self) -> &'static str {
            "panicking"
        }

        async fn run(&self, task: ExtractionTask) -> Result<(), TaskError> {
            if task.id() == "boom" {
                panic!("worker blew up");
            }
            Ok(())
        }
    }

    struct Tracking {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskWorker for Tracking {
        type Output = ();

        fn stage_name(&self) -> &'static str {
            "tracking"
        }

        async fn run(&self, _task: ExtractionTask) -> Result<(), TaskError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Sleeper;

    #[async_trait]
    impl TaskWorker for Sleeper {
        type Output = ();

        fn stage_name(&self) -> &'static str {
            "sleeper"
        }

        async fn run(&self, _task: ExtractionTask) -> Result<(), TaskError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn tasks(ids: &[&str]) -> Vec<ExtractionTask> {
        ids.iter().map(|id| ExtractionTask::new(*id, "/dev/null")).collect()
    }

    #[tokio::test]
    async fn test_single_failure_does_not_abort_batch() {
        let scheduler = TaskScheduler::new(3);
        let report = scheduler
            .run(
                Arc::new(FailingOn { bad: "c" }),
                tasks(&["a", "bb", "c", "dddd", "eeeee"]),
            )
            .await
            .unwrap();

        assert_eq!(report.total(), 5);
        assert_eq!(report.success_count(), 4);
        assert_eq!(report.failure_count(), 1);

        let failed: Vec<_> = report.failures().collect();
        assert_eq!(failed[0].task_id, "c");
        assert!(failed[0].error.as_deref().unwrap().contains("corrupted"));

        // Results keep submission order.
        let ids: Vec<_> = report.results.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, ["a", "bb", "c", "dddd", "eeeee"]);
        assert_eq!(report.outputs.len(), 4);
        assert_eq!(report.outputs[3], ("eeeee".to_string(), 5));
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_failed_result() {
        let scheduler = TaskScheduler::new(2);
        let report = scheduler
            .run(Arc::new(Panicking), tasks(&["ok-1", "boom", "ok-2"]))
            .await
            .unwrap();

        assert_eq!(report.success_count(), 2);
        let failed: Vec<_> = report.failures().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task_id, "boom");
        assert!(failed[0].error.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_pool_size_bounds_concurrency() {
        let worker = Arc::new(Tracking {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let ids: Vec<String> = (0..12).map(|i| format!("task-{i}")).collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();

        let report = TaskScheduler::new(2)
            .run(Arc::clone(&worker), tasks(&ids))
            .await
            .unwrap();

        assert_eq!(report.success_count(), 12);
        assert!(worker.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let report = TaskScheduler::new(4)
            .run(Arc::new(FailingOn { bad: "" }), Vec::new())
            .await
            .unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(report.summary().failures.len(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_before_dispatch() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = TaskScheduler::new(2)
            .with_shutdown(rx)
            .run(Arc::new(Sleeper), tasks(&["a", "b"]))
            .await
            .unwrap_err();

        match err {
            SchedulerError::Interrupted { stage, pending } => {
                assert_eq!(stage, "sleeper");
                assert_eq!(pending, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_interrupt_while_draining() {
        let (tx, rx) = watch::channel(false);
        let scheduler = TaskScheduler::new(4).with_shutdown(rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let started = Instant::now();
        let err = scheduler
            .run(Arc::new(Sleeper), tasks(&["a", "b", "c"]))
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::Interrupted { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    struct SlowWriter {
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskWorker for SlowWriter {
        type Output = ();

        fn stage_name(&self) -> &'static str {
            "slow-writer"
        }

        async fn run(&self, _task: ExtractionTask) -> Result<(), TaskError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_interrupt_cancels_running_workers() {
        let (tx, rx) = watch::channel(false);
        let finished = Arc::new(AtomicBool::new(false));
        let worker = Arc::new(SlowWriter {
            finished: Arc::clone(&finished),
        });

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });

        let err = TaskScheduler::new(2)
            .with_shutdown(rx)
            .run(worker, tasks(&["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Interrupted { .. }));

        // Well past the point where a detached worker would have finished.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_summary_counts() {
        let report = BatchReport::<()> {
            stage: "s",
            results: vec![TaskResult::succeeded("a"), TaskResult::failed("b", "x")],
            outputs: vec![],
            duration: Duration::from_millis(7),
        };
        let summary = report.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failures, vec![TaskResult::failed("b", "x")]);
        assert_eq!(summary.duration_ms, 7);
    }
}
