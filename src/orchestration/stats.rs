use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

/// Point-in-time copy of the rolling statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
    pub per_layer_avg_ms: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct RunningMean {
    count: u64,
    mean: f64,
}

impl RunningMean {
    fn add(&mut self, sample: f64) {
        self.count += 1;
        self.mean = (self.mean * (self.count - 1) as f64 + sample) / self.count as f64;
    }
}

#[derive(Debug, Default)]
struct Inner {
    success: u64,
    failed: u64,
    latency: RunningMean,
    layers: BTreeMap<String, RunningMean>,
}

/// Request counters and moving latency averages.
///
/// Failed requests count towards the overall average as well.
#[derive(Debug, Default)]
pub struct RollingStats {
    inner: Mutex<Inner>,
}

impl RollingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, success: bool, latency_ms: f64) {
        let mut inner = self.inner.lock();
        if success {
            inner.success += 1;
        } else {
            inner.failed += 1;
        }
        inner.latency.add(latency_ms);
    }

    pub fn record_layer(&self, layer: &str, latency_ms: f64) {
        self.inner
            .lock()
            .layers
            .entry(layer.to_string())
            .or_default()
            .add(latency_ms);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        StatsSnapshot {
            total: inner.success + inner.failed,
            success: inner.success,
            failed: inner.failed,
            avg_latency_ms: inner.latency.mean,
            per_layer_avg_ms: inner
                .layers
                .iter()
                .map(|(name, mean)| (name.clone(), mean.mean))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_average_matches_arithmetic_mean() {
        let stats = RollingStats::new();
        let samples = [12.5, 3.0, 48.25, 0.5, 100.0, 7.75, 19.0];
        for (i, sample) in samples.iter().enumerate() {
            stats.record_request(i % 3 != 0, *sample);
            stats.record_layer("perception", sample * 2.0);
        }

        let snapshot = stats.snapshot();
        let expected = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((snapshot.avg_latency_ms - expected).abs() < 1e-9);
        assert!((snapshot.per_layer_avg_ms["perception"] - expected * 2.0).abs() < 1e-9);
        assert_eq!(snapshot.total, samples.len() as u64);
        assert_eq!(snapshot.failed, 3);
    }

    #[test]
    fn test_concurrent_updates_are_counted() {
        let stats = Arc::new(RollingStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        stats.record_request(true, 1.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total, 2000);
        assert!((snapshot.avg_latency_ms - 1.0).abs() < 1e-9);
    }
}
