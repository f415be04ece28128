//! Renders runner events: progress through `tracing`, the final summary
//! and failure diffs to an output stream.

use std::io::Write;

use grntest_core::benchmark::BenchmarkResult;
use grntest_core::diff::unified_diff;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::events::RunnerEvent;
use crate::result::{TestResult, TestStatus, TestSuitesResult};

pub struct Reporter<W> {
    out: W,
    /// Benchmarks of finished tests, keyed by test name.
    benchmarks: Vec<(String, BenchmarkResult)>,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            benchmarks: Vec::new(),
        }
    }

    /// Consume events until the run finishes or the bus closes.
    pub async fn run(mut self, mut events: broadcast::Receiver<RunnerEvent>) -> W {
        loop {
            match events.recv().await {
                Ok(RunnerEvent::RunFinished { result, .. }) => {
                    if let Err(e) = self.summary(&result) {
                        tracing::error!(error = %e, "failed to write report");
                    }
                    break;
                }
                Ok(event) => self.progress(&event),
                Err(RecvError::Lagged(n_skipped)) => {
                    tracing::warn!(n_skipped, "reporter fell behind, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.out
    }

    fn progress(&mut self, event: &RunnerEvent) {
        match event {
            RunnerEvent::RunStarted { n_tests, n_workers } => {
                tracing::info!(n_tests, n_workers, "running tests");
            }
            RunnerEvent::SuiteStarted { worker_id, suite } => {
                tracing::info!(worker_id, suite = %suite, "suite started");
            }
            RunnerEvent::SuiteFinished { worker_id, suite } => {
                tracing::debug!(worker_id, suite = %suite, "suite finished");
            }
            RunnerEvent::TestStarted { worker_id, name, .. } => {
                tracing::debug!(worker_id, test = %name, "test started");
            }
            RunnerEvent::TestFinished { worker_id, result } => {
                self.benchmarks.extend(
                    result
                        .benchmarks
                        .iter()
                        .map(|benchmark| (result.name.clone(), benchmark.clone())),
                );
                let elapsed_ms = result.elapsed.as_millis() as u64;
                match result.status {
                    TestStatus::Success => {
                        tracing::info!(worker_id, test = %result.name, elapsed_ms, "pass");
                    }
                    TestStatus::Omitted => tracing::info!(
                        worker_id,
                        test = %result.name,
                        reason = result.omit_reason.as_deref().unwrap_or(""),
                        "omitted"
                    ),
                    TestStatus::NotChecked => {
                        tracing::info!(worker_id, test = %result.name, elapsed_ms, "not checked");
                    }
                    TestStatus::Leaked => tracing::warn!(
                        worker_id,
                        test = %result.name,
                        n_leaked_objects = result.n_leaked_objects,
                        "leaked"
                    ),
                    TestStatus::Failure => {
                        tracing::warn!(worker_id, test = %result.name, elapsed_ms, "failure");
                    }
                }
            }
            RunnerEvent::TestRetried { path, attempt, .. } => {
                tracing::info!(test = %path.display(), attempt, "retry");
            }
            RunnerEvent::WorkerError { worker_id, test, message } => {
                tracing::error!(worker_id, test = %test, error = %message, "test could not run");
            }
            RunnerEvent::RunFinished { .. } => {}
        }
    }

    fn summary(&mut self, result: &TestSuitesResult) -> std::io::Result<()> {
        for fault in &result.faults {
            self.fault(fault)?;
        }
        for (test, benchmark) in &self.benchmarks {
            let json = serde_json::to_string(benchmark).map_err(std::io::Error::other)?;
            writeln!(self.out, "benchmark {test}: {json}")?;
        }
        writeln!(
            self.out,
            "{} tests, {} passes, {} failures, {} leaked, {} omissions, {} not checked",
            result.n_tests,
            result.n_passed,
            result.n_failed,
            result.n_leaked,
            result.n_omitted,
            result.n_not_checked,
        )?;
        writeln!(
            self.out,
            "{:.4}% passed in {:.4}s",
            result.pass_ratio(),
            result.elapsed.as_secs_f64()
        )?;
        if result.interrupted {
            writeln!(self.out, "interrupted")?;
        }
        self.out.flush()
    }

    fn fault(&mut self, fault: &TestResult) -> std::io::Result<()> {
        writeln!(self.out, "{} [{}]", fault.name, fault.status.as_str())?;
        if let Some(reason) = &fault.abort_reason {
            writeln!(self.out, "  aborted: {reason}")?;
        }
        match (&fault.status, &fault.expected) {
            (TestStatus::Failure, Some(expected)) => {
                let diff = unified_diff(
                    expected,
                    &fault.actual,
                    &format!("{} (expected)", fault.name),
                    &format!("{} (actual)", fault.name),
                );
                self.out.write_all(diff.as_bytes())?;
            }
            (TestStatus::Leaked, _) => {
                writeln!(self.out, "  {} leaked objects", fault.n_leaked_objects)?;
            }
            _ => self.out.write_all(fault.actual.as_bytes())?,
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::events::EventBus;

    fn failure() -> TestResult {
        TestResult {
            suite: "select".into(),
            name: "select/basic".into(),
            path: PathBuf::from("select/basic.test"),
            status: TestStatus::Failure,
            actual: "select Foo\n[[0,0.0,0.0],false]\n".into(),
            expected: Some("select Foo\n[[0,0.0,0.0],true]\n".into()),
            n_leaked_objects: 0,
            omit_reason: None,
            abort_reason: None,
            elapsed: Duration::from_millis(12),
            benchmarks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn summary_contains_counts_and_diff() {
        let bus = EventBus::new(16);
        let reporter = Reporter::new(Vec::new());
        let handle = tokio::spawn(reporter.run(bus.subscribe()));

        let mut result = TestSuitesResult::default();
        result.add_test();
        result.record(failure());
        bus.publish(RunnerEvent::TestFinished {
            worker_id: 0,
            result: Box::new(failure()),
        });
        bus.publish(RunnerEvent::RunFinished {
            result: Box::new(result),
            elapsed: Duration::from_secs(1),
        });

        let out = String::from_utf8(handle.await.unwrap()).unwrap();
        assert!(out.starts_with("select/basic [failure]\n--- select/basic (expected)\n"));
        assert!(out.contains("-[[0,0.0,0.0],true]\n+[[0,0.0,0.0],false]\n"));
        assert!(out.contains("1 tests, 0 passes, 1 failures, 0 leaked, 0 omissions, 0 not checked\n"));
        assert!(out.contains("0.0000% passed in "));
    }

    #[tokio::test]
    async fn benchmarks_are_reported_as_json() {
        let bus = EventBus::new(16);
        let handle = tokio::spawn(Reporter::new(Vec::new()).run(bus.subscribe()));

        let mut passed = failure();
        passed.status = TestStatus::Success;
        passed.benchmarks.push(BenchmarkResult {
            name: "load".into(),
            n_items: 1,
            n_iterations: 2,
            cpu_elapsed_time: Duration::ZERO,
            real_elapsed_time: Duration::ZERO,
        });
        bus.publish(RunnerEvent::TestFinished {
            worker_id: 0,
            result: Box::new(passed),
        });
        bus.publish(RunnerEvent::RunFinished {
            result: Box::new(TestSuitesResult::default()),
            elapsed: Duration::ZERO,
        });

        let out = String::from_utf8(handle.await.unwrap()).unwrap();
        assert!(out.contains("benchmark select/basic: {\"name\":\"load\",\"n_items\":1,\"n_iterations\":2,"));
        assert!(!out.contains("interrupted"));
    }
}
