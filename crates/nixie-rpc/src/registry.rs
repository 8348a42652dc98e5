//! Worker discovery and round-robin selection
//!
//! Workers are learned passively from liveness traffic; nothing is ever
//! removed. A worker that stops answering pings drops out of the liveness
//! snapshot and gets skipped by selection, but its slot stays so the
//! rotation order is stable if it comes back.

use nixie_core::identity::{ServiceName, WorkerId};
use std::collections::HashMap;

/// Known workers per service, with a round-robin cursor per target
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<ServiceName, Vec<WorkerId>>,
    cursor: HashMap<ServiceName, usize>,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a worker of a service exists
    ///
    /// Order of first observation fixes the rotation order.
    pub fn observe(&mut self, service: &ServiceName, worker: WorkerId) {
        let workers = self.workers.entry(service.clone()).or_default();
        if !workers.contains(&worker) {
            workers.push(worker);
        }
    }

    /// Known workers of a service, in rotation order
    pub fn workers_of(&self, service: &ServiceName) -> &[WorkerId] {
        self.workers.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether a specific worker has been observed
    pub fn contains(&self, service: &ServiceName, worker: WorkerId) -> bool {
        self.workers_of(service).contains(&worker)
    }

    /// Pick the next worker for a call, round-robin
    ///
    /// When a liveness filter is given, workers it reports dead are skipped;
    /// if every worker is reported dead the last one tried is returned and
    /// the call fails downstream on its own timeout. Unknown services get
    /// worker 0, the only address worth guessing.
    pub fn select(
        &mut self,
        service: &ServiceName,
        is_live: Option<&dyn Fn(WorkerId) -> bool>,
    ) -> WorkerId {
        let Some(workers) = self.workers.get(service) else {
            return 0;
        };
        debug_assert!(!workers.is_empty());

        let len = workers.len();
        let last = self.cursor.get(service).copied().unwrap_or(len - 1);

        let mut index = (last + 1) % len;
        for _ in 0..len {
            let candidate = workers[index];
            let live = is_live.map(|f| f(candidate)).unwrap_or(true);
            if live {
                break;
            }
            index = (index + 1) % len;
        }

        self.cursor.insert(service.clone(), index);
        workers[index]
    }
}
