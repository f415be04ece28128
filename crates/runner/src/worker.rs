//! One worker of the pool: pulls tests from the shared queue and runs them
//! one at a time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::TesterConfig;
use crate::events::WorkerEvents;
use crate::result::{TestResult, TestStatus, TestSuitesResult};
use crate::test_runner::{run_test_file, TestEntry};

/// A queued test and how many times it already failed.
#[derive(Debug, Clone)]
pub struct Job {
    pub entry: TestEntry,
    pub attempt: u32,
}

/// State shared by all workers. Critical sections never await.
#[derive(Debug, Default)]
pub struct Shared {
    pub queue: VecDeque<Job>,
    pub result: TestSuitesResult,
}

pub type SharedState = Arc<Mutex<Shared>>;

pub fn lock(shared: &SharedState) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Worker {
    pub id: usize,
    config: Arc<TesterConfig>,
    shared: SharedState,
    events: WorkerEvents,
    /// Cancelled on interrupt and, with stop-on-failure, on the first failure.
    stop: CancellationToken,
    current_suite: Option<String>,
}

impl Worker {
    pub fn new(
        config: Arc<TesterConfig>,
        shared: SharedState,
        events: WorkerEvents,
        stop: CancellationToken,
    ) -> Self {
        Self {
            id: events.worker_id(),
            config,
            shared,
            events,
            stop,
            current_suite: None,
        }
    }

    /// Run tests until the queue is drained or the worker is stopped.
    pub async fn run(mut self) {
        tracing::debug!(worker_id = self.id, "worker started");
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            let Some(job) = lock(&self.shared).queue.pop_front() else {
                break;
            };
            self.enter_suite(&job.entry.suite);
            self.events.test_started(&job.entry);

            let (result, retryable) = match run_test_file(&self.config, self.id, &job.entry).await {
                Ok(result) => {
                    let retryable = result.is_retryable();
                    (result, retryable)
                }
                Err(e) => {
                    tracing::error!(worker_id = self.id, test = %job.entry.name, error = %e, "test could not run");
                    self.events.error(&job.entry, e.to_string());
                    (error_result(&job.entry, &e.to_string()), false)
                }
            };
            self.finish(job, result, retryable);
        }
        if let Some(suite) = self.current_suite.take() {
            self.events.suite_finished(suite);
        }
        tracing::debug!(worker_id = self.id, "worker finished");
    }

    fn enter_suite(&mut self, suite: &str) {
        if self.current_suite.as_deref() == Some(suite) {
            return;
        }
        if let Some(previous) = self.current_suite.replace(suite.to_string()) {
            self.events.suite_finished(previous);
        }
        self.events.suite_started(suite);
    }

    fn finish(&self, job: Job, result: TestResult, retryable: bool) {
        let retry = retryable && job.attempt < self.config.n_retries;
        let failed = !result.status.is_passing();
        {
            let mut shared = lock(&self.shared);
            if job.attempt > 0 {
                shared.result.rescind_failure(&job.entry.path);
            }
            shared.result.record(result.clone());
            if retry {
                shared.result.add_test();
                shared.queue.push_back(Job {
                    entry: job.entry.clone(),
                    attempt: job.attempt + 1,
                });
            }
        }

        self.events.test_finished(result);
        if retry {
            tracing::info!(test = %job.entry.name, attempt = job.attempt + 1, "retrying failed test");
            self.events.test_retried(&job.entry, job.attempt + 1);
        } else if failed && self.config.stop_on_failure {
            tracing::info!(worker_id = self.id, "stopping after first failure");
            self.stop.cancel();
        }
    }
}

fn error_result(entry: &TestEntry, message: &str) -> TestResult {
    TestResult {
        suite: entry.suite.clone(),
        name: entry.name.clone(),
        path: entry.path.clone(),
        status: TestStatus::Failure,
        actual: format!("# error: {message}\n"),
        expected: None,
        n_leaked_objects: 0,
        omit_reason: None,
        abort_reason: Some(message.to_string()),
        elapsed: Duration::ZERO,
        benchmarks: Vec::new(),
    }
}
