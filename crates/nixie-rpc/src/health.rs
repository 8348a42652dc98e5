//! Health report aggregation
//!
//! Turns the per-worker liveness map into a per-service view: latencies are
//! averaged (rounded up, so a 1ms worker never reads as 0) and throughput
//! counters are summed. Useful for dashboards sitting on top of the
//! `ping-result` feed.

use nixie_core::envelope::LivenessMap;
use std::collections::BTreeMap;

/// Aggregated view of one service across its workers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceReport {
    /// Average round-trip latency across workers, in ms, rounded up
    pub ping: u64,
    /// Total requests handled successfully since the previous round
    pub success: u64,
    /// Total handler faults since the previous round
    pub errors: u64,
    /// Number of workers that answered
    pub workers: u64,
}

/// Collapse a per-worker liveness map into per-service totals
///
/// Keys that do not parse as `name@worker` are grouped under the raw key.
pub fn aggregate_report(map: &LivenessMap) -> BTreeMap<String, ServiceReport> {
    let mut sums: BTreeMap<String, (u64, ServiceReport)> = BTreeMap::new();

    for (key, worker) in map {
        let service = key.split_once('@').map(|(name, _)| name).unwrap_or(key);

        let (ping_sum, report) = sums.entry(service.to_string()).or_default();
        *ping_sum += worker.ping;
        report.success += worker.success;
        report.errors += worker.errors;
        report.workers += 1;
    }

    sums.into_iter()
        .map(|(service, (ping_sum, mut report))| {
            report.ping = ping_sum.div_ceil(report.workers);
            (service, report)
        })
        .collect()
}

/// Merge per-service reports from several observers
///
/// Counters are summed; latency is the worker-weighted average of the
/// inputs, rounded up.
pub fn merge_reports(reports: &[BTreeMap<String, ServiceReport>]) -> BTreeMap<String, ServiceReport> {
    let mut sums: BTreeMap<String, (u64, ServiceReport)> = BTreeMap::new();

    for report in reports {
        for (service, entry) in report {
            let (ping_sum, merged) = sums.entry(service.clone()).or_default();
            *ping_sum += entry.ping * entry.workers;
            merged.success += entry.success;
            merged.errors += entry.errors;
            merged.workers += entry.workers;
        }
    }

    sums.into_iter()
        .map(|(service, (ping_sum, mut merged))| {
            if merged.workers > 0 {
                merged.ping = ping_sum.div_ceil(merged.workers);
            }
            (service, merged)
        })
        .collect()
}
