//! Worker pool over one shared FIFO queue of tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::TesterConfig;
use crate::error::RunnerError;
use crate::events::{EventBus, RunnerEvent};
use crate::result::TestSuitesResult;
use crate::test_runner::TestEntry;
use crate::worker::{lock, Job, Shared, Worker};

/// File extension of test scripts.
pub const TEST_EXTENSION: &str = "test";

pub struct Scheduler {
    config: Arc<TesterConfig>,
    bus: Arc<EventBus>,
    interrupt: CancellationToken,
}

impl Scheduler {
    pub fn new(config: Arc<TesterConfig>, bus: Arc<EventBus>, interrupt: CancellationToken) -> Self {
        Self {
            config,
            bus,
            interrupt,
        }
    }

    /// Run every entry and return the aggregate once all workers are done.
    /// Tests still queued when the run stops early are not counted.
    pub async fn run(&self, entries: Vec<TestEntry>) -> TestSuitesResult {
        let started = Instant::now();
        let n_workers = self.config.n_workers.clamp(1, entries.len().max(1));

        let mut initial = Shared::default();
        for entry in entries {
            initial.result.add_test();
            initial.queue.push_back(Job { entry, attempt: 0 });
        }
        self.bus.publish(RunnerEvent::RunStarted {
            n_tests: initial.result.n_tests,
            n_workers,
        });
        let shared = Arc::new(Mutex::new(initial));

        let stop = self.interrupt.child_token();
        let mut workers = JoinSet::new();
        for id in 0..n_workers {
            let worker = Worker::new(
                Arc::clone(&self.config),
                Arc::clone(&shared),
                self.bus.worker(id),
                stop.clone(),
            );
            workers.spawn(worker.run());
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "worker task failed");
            }
        }

        let mut result = {
            let mut shared = lock(&shared);
            let n_unstarted = shared.queue.len();
            shared.queue.clear();
            if n_unstarted > 0 {
                tracing::info!(n_unstarted, "run stopped with tests left in the queue");
            }
            let mut result = std::mem::take(&mut shared.result);
            result.n_tests = result.n_tests.saturating_sub(n_unstarted);
            result
        };
        result.elapsed = started.elapsed();
        result.interrupted = self.interrupt.is_cancelled();
        self.bus.publish(RunnerEvent::RunFinished {
            result: Box::new(result.clone()),
            elapsed: result.elapsed,
        });
        result
    }
}

/// Expand the given paths into test entries. Directories are searched
/// recursively for `*.test` files; the result is sorted.
pub fn collect_tests(base: &Path, paths: &[PathBuf]) -> Result<Vec<TestEntry>, RunnerError> {
    let mut files = Vec::new();
    for path in paths {
        let path = if path.is_absolute() {
            path.clone()
        } else {
            base.join(path)
        };
        if path.is_dir() {
            collect_directory(&path, &mut files)?;
        } else {
            files.push(path);
        }
    }
    files.sort();
    files.dedup();
    if files.is_empty() {
        return Err(RunnerError::NoTests);
    }
    Ok(files.into_iter().map(|path| TestEntry::new(base, path)).collect())
}

fn collect_directory(directory: &Path, files: &mut Vec<PathBuf>) -> Result<(), RunnerError> {
    let mut pending = vec![directory.to_path_buf()];
    while let Some(directory) = pending.pop() {
        for entry in std::fs::read_dir(&directory)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|extension| extension == TEST_EXTENSION) {
                files.push(path);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
