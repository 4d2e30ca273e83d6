//! Cross-call store of the most recent CPU sample per container.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crawlspace_common::types::ContainerId;

/// Cumulative per-core CPU counters of a container at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerCpuSample {
    /// Container the counters belong to.
    pub container_id: ContainerId,
    /// Cumulative CPU time per logical core, in nanoseconds.
    pub per_core_cumulative_ns: Vec<u64>,
    /// When the counters were read.
    pub sampled_at: Instant,
}

/// Storage for the previous sample of each container.
///
/// A new sample for a container replaces the old one. Entries are never
/// evicted by the sampler.
pub trait SampleCache: Send + Sync {
    /// Returns the latest sample stored for `id`.
    fn get(&self, id: &ContainerId) -> Option<ContainerCpuSample>;

    /// Stores `sample`, superseding any previous one for the same container.
    fn put(&self, sample: ContainerCpuSample);
}

/// Mutex-guarded in-process [`SampleCache`].
#[derive(Debug, Default)]
pub struct InMemorySampleCache {
    samples: Mutex<HashMap<ContainerId, ContainerCpuSample>>,
}

impl InMemorySampleCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the sample of a container that is no longer crawled.
    pub fn remove(&self, id: &ContainerId) -> Option<ContainerCpuSample> {
        self.lock().remove(id)
    }

    /// Number of containers with a stored sample.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no sample is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContainerId, ContainerCpuSample>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SampleCache for InMemorySampleCache {
    fn get(&self, id: &ContainerId) -> Option<ContainerCpuSample> {
        self.lock().get(id).cloned()
    }

    fn put(&self, sample: ContainerCpuSample) {
        let _ = self.lock().insert(sample.container_id.clone(), sample);
    }
}
