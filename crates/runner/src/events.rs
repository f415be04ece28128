//! Progress events of a run.
//!
//! The scheduler owns one [`EventBus`]; each worker gets a [`WorkerEvents`]
//! handle that stamps its id on everything it publishes. The reporter is the
//! usual subscriber, but tests subscribe too.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::TesterConfig;
use crate::result::{TestResult, TestSuitesResult};
use crate::test_runner::TestEntry;

#[derive(Debug, Clone)]
pub enum RunnerEvent {
    RunStarted {
        n_tests: usize,
        n_workers: usize,
    },
    /// A worker moved on to a test from another suite.
    SuiteStarted {
        worker_id: usize,
        suite: String,
    },
    SuiteFinished {
        worker_id: usize,
        suite: String,
    },
    TestStarted {
        worker_id: usize,
        suite: String,
        name: String,
    },
    TestFinished {
        worker_id: usize,
        result: Box<TestResult>,
    },
    TestRetried {
        worker_id: usize,
        path: PathBuf,
        attempt: u32,
    },
    /// A process-level problem outside any transcript.
    WorkerError {
        worker_id: usize,
        test: String,
        message: String,
    },
    RunFinished {
        result: Box<TestSuitesResult>,
        elapsed: Duration,
    },
}

impl RunnerEvent {
    /// The worker that published the event; `None` for run-level events.
    pub fn worker_id(&self) -> Option<usize> {
        match self {
            Self::SuiteStarted { worker_id, .. }
            | Self::SuiteFinished { worker_id, .. }
            | Self::TestStarted { worker_id, .. }
            | Self::TestFinished { worker_id, .. }
            | Self::TestRetried { worker_id, .. }
            | Self::WorkerError { worker_id, .. } => Some(*worker_id),
            Self::RunStarted { .. } | Self::RunFinished { .. } => None,
        }
    }
}

/// Broadcast channel for [`RunnerEvent`]s. Events published while nobody
/// subscribes are lost; a subscriber more than `capacity` events behind
/// skips the oldest ones and sees `RecvError::Lagged`.
pub struct EventBus {
    sender: broadcast::Sender<RunnerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Sized by `GRNTEST_EVENT_CAPACITY`.
    pub fn for_config(config: &TesterConfig) -> Self {
        Self::new(config.event_capacity)
    }

    pub fn publish(&self, event: RunnerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.sender.subscribe()
    }

    /// Publishing handle for worker `worker_id`.
    pub fn worker(self: &Arc<Self>, worker_id: usize) -> WorkerEvents {
        WorkerEvents {
            worker_id,
            bus: Arc::clone(self),
        }
    }
}

/// Typed publisher used by one worker.
#[derive(Clone)]
pub struct WorkerEvents {
    worker_id: usize,
    bus: Arc<EventBus>,
}

impl WorkerEvents {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn suite_started(&self, suite: &str) {
        self.bus.publish(RunnerEvent::SuiteStarted {
            worker_id: self.worker_id,
            suite: suite.to_string(),
        });
    }

    pub fn suite_finished(&self, suite: String) {
        self.bus.publish(RunnerEvent::SuiteFinished {
            worker_id: self.worker_id,
            suite,
        });
    }

    pub fn test_started(&self, entry: &TestEntry) {
        self.bus.publish(RunnerEvent::TestStarted {
            worker_id: self.worker_id,
            suite: entry.suite.clone(),
            name: entry.name.clone(),
        });
    }

    pub fn test_finished(&self, result: TestResult) {
        self.bus.publish(RunnerEvent::TestFinished {
            worker_id: self.worker_id,
            result: Box::new(result),
        });
    }

    /// `attempt` counts retries, starting at 1.
    pub fn test_retried(&self, entry: &TestEntry, attempt: u32) {
        self.bus.publish(RunnerEvent::TestRetried {
            worker_id: self.worker_id,
            path: entry.path.clone(),
            attempt,
        });
    }

    pub fn error(&self, entry: &TestEntry, message: String) {
        self.bus.publish(RunnerEvent::WorkerError {
            worker_id: self.worker_id,
            test: entry.name.clone(),
            message,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use assert_matches::assert_matches;
    use tokio::sync::broadcast::error::RecvError;

    use super::*;

    #[tokio::test]
    async fn worker_handles_stamp_their_id() {
        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let entry = TestEntry::new(Path::new("/suite"), "/suite/select/basic.test");

        bus.worker(3).suite_started("select");
        bus.worker(5).test_started(&entry);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.worker_id(), Some(3));
        assert_matches!(event, RunnerEvent::SuiteStarted { suite, .. } if suite == "select");
        assert_matches!(
            rx.recv().await,
            Ok(RunnerEvent::TestStarted { worker_id: 5, name, .. }) if name == "select/basic"
        );
    }

    #[tokio::test]
    async fn capacity_comes_from_configuration() {
        let config = TesterConfig {
            event_capacity: 2,
            ..TesterConfig::default()
        };
        let bus = EventBus::for_config(&config);
        let mut rx = bus.subscribe();
        for n_tests in 0..3 {
            bus.publish(RunnerEvent::RunStarted { n_tests, n_workers: 1 });
        }

        assert_matches!(rx.recv().await, Err(RecvError::Lagged(1)));
        assert_matches!(rx.recv().await, Ok(RunnerEvent::RunStarted { n_tests: 1, .. }));
    }

    #[test]
    fn zero_capacity_still_makes_a_channel() {
        let bus = EventBus::new(0);
        bus.publish(RunnerEvent::RunStarted { n_tests: 0, n_workers: 1 });
    }
}
