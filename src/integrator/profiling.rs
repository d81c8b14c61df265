//! Execution counters.

use crate::data::ExecutionTiming;
use std::time::Duration;

/// Accumulated statistics over successful executions.
#[derive(Debug, Default, Clone)]
pub struct ProfilingCounters {
    exec_count: u64,
    kernel_time: Duration,
    memcpy_time: Duration,
}

impl ProfilingCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one successful execution.
    pub fn record(&mut self, timing: &ExecutionTiming) {
        self.exec_count += 1;
        self.kernel_time += timing.kernel;
        self.memcpy_time += timing.memcpy;
    }

    /// Zero both timers; the execution count is kept.
    pub fn reset_time(&mut self) {
        self.kernel_time = Duration::ZERO;
        self.memcpy_time = Duration::ZERO;
    }

    #[inline]
    pub fn exec_count(&self) -> u64 {
        self.exec_count
    }

    #[inline]
    pub fn kernel_time(&self) -> Duration {
        self.kernel_time
    }

    #[inline]
    pub fn memcpy_time(&self) -> Duration {
        self.memcpy_time
    }

    pub fn kernel_time_ms(&self) -> f64 {
        self.kernel_time.as_secs_f64() * 1e3
    }

    pub fn memcpy_time_ms(&self) -> f64 {
        self.memcpy_time.as_secs_f64() * 1e3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reset() {
        let mut counters = ProfilingCounters::new();
        let timing = ExecutionTiming {
            kernel: Duration::from_millis(3),
            memcpy: Duration::from_millis(1),
        };

        counters.record(&timing);
        counters.record(&timing);
        assert_eq!(counters.exec_count(), 2);
        assert_eq!(counters.kernel_time(), Duration::from_millis(6));
        assert!((counters.memcpy_time_ms() - 2.0).abs() < 1e-9);

        counters.reset_time();
        assert_eq!(counters.exec_count(), 2);
        assert_eq!(counters.kernel_time(), Duration::ZERO);
        assert_eq!(counters.memcpy_time(), Duration::ZERO);
    }
}
