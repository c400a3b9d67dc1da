//! Repeated-query timing for the `perf` command.

use crate::error::StoreError;
use crate::query::{QueryEngine, QuerySpec};
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Timing {
    pub min: Duration,
    pub mean: Duration,
    pub max: Duration,
}

impl Timing {
    fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let total: Duration = samples.iter().sum();
        Self {
            min: samples.iter().min().copied().unwrap_or_default(),
            mean: total / samples.len() as u32,
            max: samples.iter().max().copied().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PerfReport {
    pub iterations: u32,
    pub partitions: usize,
    pub rows: usize,
    /// Partition pruning alone.
    pub plan: Timing,
    /// Full scan including pruning.
    pub scan: Timing,
    /// Per-symbol volume ranking, when the kind has a volume column.
    pub ranking: Option<Timing>,
}

/// Run the pruning, scan and ranking paths `iterations` times each.
pub fn measure(engine: &QueryEngine, spec: &QuerySpec, iterations: u32) -> Result<PerfReport, StoreError> {
    let iterations = iterations.max(1);
    let mut plan = Vec::new();
    let mut scan = Vec::new();
    let mut ranking = Vec::new();
    let mut partitions = 0;
    let mut rows = 0;
    let mut can_rank = true;

    for _ in 0..iterations {
        let t = Instant::now();
        partitions = engine.plan(spec)?.len();
        plan.push(t.elapsed());

        let t = Instant::now();
        rows = engine.scan(spec, None)?.rows();
        scan.push(t.elapsed());

        if can_rank {
            let t = Instant::now();
            match engine.volume_ranking(spec, None) {
                Ok(_) => ranking.push(t.elapsed()),
                Err(StoreError::InvalidQuery(_)) => can_rank = false,
                Err(e) => return Err(e),
            }
        }
    }

    Ok(PerfReport {
        iterations,
        partitions,
        rows,
        plan: Timing::from_samples(&plan),
        scan: Timing::from_samples(&scan),
        ranking: can_rank.then(|| Timing::from_samples(&ranking)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_summarises_samples() {
        let t = Timing::from_samples(&[
            Duration::from_millis(1),
            Duration::from_millis(3),
            Duration::from_millis(2),
        ]);
        assert_eq!(t.min, Duration::from_millis(1));
        assert_eq!(t.mean, Duration::from_millis(2));
        assert_eq!(t.max, Duration::from_millis(3));
        assert_eq!(Timing::from_samples(&[]).mean, Duration::ZERO);
    }
}
