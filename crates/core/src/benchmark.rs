//! Benchmark bookkeeping for `#@start-benchmark` / `#@finish-benchmark`.

use std::time::Duration;

use serde::Serialize;

/// Totals of one finished benchmark block, reported as a JSON line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkResult {
    /// Label given to `#@start-benchmark`.
    pub name: String,
    /// Commands executed inside the benchmark block.
    pub n_items: u64,
    /// How many times each command was repeated.
    pub n_iterations: u32,
    /// Harness process CPU time summed over every iteration.
    pub cpu_elapsed_time: Duration,
    /// Wall-clock time summed over every iteration.
    pub real_elapsed_time: Duration,
}

impl BenchmarkResult {
    pub fn items_per_second(&self) -> f64 {
        let real = self.real_elapsed_time.as_secs_f64();
        if real == 0.0 {
            return 0.0;
        }
        (self.n_items as f64 * f64::from(self.n_iterations)) / real
    }
}

/// An open benchmark block accumulating per-command timings.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningBenchmark {
    pub name: String,
    pub n_iterations: u32,
    /// Commands recorded so far.
    n_items: u64,
    cpu_elapsed_time: Duration,
    real_elapsed_time: Duration,
}

impl RunningBenchmark {
    pub fn new(name: impl Into<String>, n_iterations: u32) -> Self {
        Self {
            name: name.into(),
            n_iterations: n_iterations.max(1),
            n_items: 0,
            cpu_elapsed_time: Duration::ZERO,
            real_elapsed_time: Duration::ZERO,
        }
    }

    /// Account one command across all of its iterations.
    pub fn record(&mut self, cpu: Duration, real: Duration) {
        self.n_items += 1;
        self.cpu_elapsed_time += cpu;
        self.real_elapsed_time += real;
    }

    pub fn finish(self) -> BenchmarkResult {
        BenchmarkResult {
            name: self.name,
            n_items: self.n_items,
            n_iterations: self.n_iterations,
            cpu_elapsed_time: self.cpu_elapsed_time,
            real_elapsed_time: self.real_elapsed_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_per_second() {
        let mut running = RunningBenchmark::new("select", 10);
        running.record(Duration::from_millis(100), Duration::from_millis(250));
        running.record(Duration::from_millis(100), Duration::from_millis(250));
        let result = running.finish();
        assert_eq!(result.n_items, 2);
        assert_eq!(result.real_elapsed_time, Duration::from_millis(500));
        assert!((result.items_per_second() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn zero_elapsed() {
        let result = RunningBenchmark::new("empty", 0).finish();
        assert_eq!(result.n_iterations, 1);
        assert_eq!(result.items_per_second(), 0.0);
    }
}
