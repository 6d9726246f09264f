//! Per-detector performance tracking
//!
//! Counters are plain atomics so concurrent ensemble branches can record
//! results without a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Processing time (ms) at which the speed component reaches zero
const SPEED_BUDGET_MS: f64 = 2000.0;

/// Region count at which the yield component saturates
const REGION_SATURATION: f64 = 10.0;

/// Live counters for one registered detector
#[derive(Debug, Default)]
pub struct DetectorMetrics {
    total: AtomicU64,
    successful: AtomicU64,
    total_time_us: AtomicU64,
    total_regions: AtomicU64,
    last_execution_ms: AtomicU64,
}

impl DetectorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, elapsed: Duration, regions: usize) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.total_regions.fetch_add(regions as u64, Ordering::Relaxed);
        self.record_time(elapsed);
    }

    pub fn record_failure(&self, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.record_time(elapsed);
    }

    fn record_time(&self, elapsed: Duration) {
        self.total_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.last_execution_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn total_executions(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, detector: &str) -> DetectorPerformanceMetrics {
        let last = self.last_execution_ms.load(Ordering::Relaxed);
        DetectorPerformanceMetrics {
            detector: detector.to_string(),
            total_executions: self.total.load(Ordering::Relaxed),
            successful_executions: self.successful.load(Ordering::Relaxed),
            total_processing_time_ms: self.total_time_us.load(Ordering::Relaxed) as f64 / 1000.0,
            total_regions: self.total_regions.load(Ordering::Relaxed),
            last_execution_ms: (last > 0).then_some(last),
        }
    }
}

/// Point-in-time copy of a detector's counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorPerformanceMetrics {
    pub detector: String,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub total_processing_time_ms: f64,
    pub total_regions: u64,
    /// Milliseconds since the Unix epoch
    pub last_execution_ms: Option<u64>,
}

impl DetectorPerformanceMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.successful_executions as f64 / self.total_executions as f64
        }
    }

    pub fn average_processing_time_ms(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.total_processing_time_ms / self.total_executions as f64
        }
    }

    /// Average over successful executions
    pub fn average_region_count(&self) -> f64 {
        if self.successful_executions == 0 {
            0.0
        } else {
            self.total_regions as f64 / self.successful_executions as f64
        }
    }

    pub fn overall_score(&self) -> f64 {
        overall_score(
            self.success_rate(),
            self.average_processing_time_ms(),
            self.average_region_count(),
        )
    }
}

/// 0.6 success + 0.25 speed + 0.15 yield
pub fn overall_score(success_rate: f64, average_time_ms: f64, average_regions: f64) -> f64 {
    let speed = ((SPEED_BUDGET_MS - average_time_ms) / SPEED_BUDGET_MS).max(0.0);
    let yield_score = (average_regions / REGION_SATURATION).min(1.0);
    0.6 * success_rate + 0.25 * speed + 0.15 * yield_score
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
