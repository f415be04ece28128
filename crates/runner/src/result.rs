//! Test verdicts and their aggregation across workers.

use std::path::PathBuf;
use std::time::Duration;

use grntest_core::benchmark::BenchmarkResult;
use serde::Serialize;

/// Terminal state of one test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Success,
    Failure,
    Leaked,
    Omitted,
    NotChecked,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Leaked => "leaked",
            Self::Omitted => "omitted",
            Self::NotChecked => "not checked",
        }
    }

    /// Whether the run as a whole can still succeed after this verdict.
    pub fn is_passing(&self) -> bool {
        matches!(self, Self::Success | Self::Omitted | Self::NotChecked)
    }

    /// The status state machine: omission wins, then the comparison
    /// against the expected text (when there is one) and the leak count.
    pub fn decide(omitted: bool, expected: Option<&[u8]>, actual: &[u8], n_leaked_objects: u32) -> Self {
        if omitted {
            return Self::Omitted;
        }
        match expected {
            Some(expected) if expected == actual => {
                if n_leaked_objects == 0 {
                    Self::Success
                } else {
                    Self::Leaked
                }
            }
            Some(_) => Self::Failure,
            None if n_leaked_objects > 0 => Self::Leaked,
            None => Self::NotChecked,
        }
    }
}

/// The outcome of running one test script once.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub suite: String,
    pub name: String,
    pub path: PathBuf,
    pub status: TestStatus,
    /// Normalized transcript.
    pub actual: String,
    pub expected: Option<String>,
    pub n_leaked_objects: u32,
    pub omit_reason: Option<String>,
    pub abort_reason: Option<String>,
    pub elapsed: Duration,
    pub benchmarks: Vec<BenchmarkResult>,
}

impl TestResult {
    pub fn is_retryable(&self) -> bool {
        self.status == TestStatus::Failure && self.n_leaked_objects == 0
    }
}

/// Aggregate counters shared by all workers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestSuitesResult {
    pub n_tests: usize,
    pub n_passed: usize,
    pub n_failed: usize,
    pub n_leaked: usize,
    pub n_omitted: usize,
    pub n_not_checked: usize,
    /// Failed, leaked and not-checked results kept for the report.
    pub faults: Vec<TestResult>,
    pub elapsed: Duration,
    pub interrupted: bool,
}

impl TestSuitesResult {
    /// A test entered the queue. Retries count as additional tests.
    pub fn add_test(&mut self) {
        self.n_tests += 1;
    }

    pub fn record(&mut self, result: TestResult) {
        match result.status {
            TestStatus::Success => self.n_passed += 1,
            TestStatus::Failure => self.n_failed += 1,
            TestStatus::Leaked => self.n_leaked += 1,
            TestStatus::Omitted => self.n_omitted += 1,
            TestStatus::NotChecked => self.n_not_checked += 1,
        }
        if !matches!(result.status, TestStatus::Success | TestStatus::Omitted) {
            self.faults.push(result);
        }
    }

    /// Drop the earlier failure of a retried test once the retry has a
    /// verdict of its own. The retry's slot in `n_tests` goes with it.
    pub fn rescind_failure(&mut self, path: &std::path::Path) {
        if let Some(index) = self
            .faults
            .iter()
            .rposition(|fault| fault.status == TestStatus::Failure && fault.path == path)
        {
            self.faults.remove(index);
            self.n_failed = self.n_failed.saturating_sub(1);
            self.n_tests = self.n_tests.saturating_sub(1);
        }
    }

    pub fn n_finished(&self) -> usize {
        self.n_passed + self.n_failed + self.n_leaked + self.n_omitted + self.n_not_checked
    }

    pub fn has_failure(&self) -> bool {
        self.n_failed > 0 || self.n_leaked > 0
    }

    pub fn is_success(&self) -> bool {
        !self.has_failure() && !self.interrupted
    }

    pub fn pass_ratio(&self) -> f64 {
        let n_checked = self.n_finished() - self.n_omitted - self.n_not_checked;
        if n_checked == 0 {
            return 100.0;
        }
        self.n_passed as f64 / n_checked as f64 * 100.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
