use rquickjs::Runtime;
use tracing::debug;

/// Point-in-time heap accounting for one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapUsage {
    pub used_bytes: u64,
    pub peak_bytes: u64,
    pub limit_bytes: Option<u64>,
}

/// Memory backing policy bound to a single runtime.
///
/// The binding applies the heap budget when the runtime is created, keeps a
/// running peak of observed usage, and is released after the runtime has been
/// disposed.
#[derive(Debug)]
pub struct AllocatorBinding {
    max_memory: Option<usize>,
    max_stack_size: usize,
    gc_threshold: Option<usize>,
    peak_bytes: u64,
    last_bytes: u64,
}

impl AllocatorBinding {
    pub const fn new(
        max_memory: Option<usize>,
        max_stack_size: usize,
        gc_threshold: Option<usize>,
    ) -> Self {
        Self {
            max_memory,
            max_stack_size,
            gc_threshold,
            peak_bytes: 0,
            last_bytes: 0,
        }
    }

    pub fn bind(&mut self, runtime: &Runtime) {
        if let Some(limit) = self.max_memory {
            runtime.set_memory_limit(limit);
        }
        runtime.set_max_stack_size(self.max_stack_size);
        if let Some(threshold) = self.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }
        self.observe(runtime);
    }

    pub fn observe(&mut self, runtime: &Runtime) -> HeapUsage {
        let usage = runtime.memory_usage();
        self.last_bytes = u64::try_from(usage.memory_used_size).unwrap_or(0);
        self.peak_bytes = self.peak_bytes.max(self.last_bytes);
        self.usage()
    }

    pub fn usage(&self) -> HeapUsage {
        HeapUsage {
            used_bytes: self.last_bytes,
            peak_bytes: self.peak_bytes,
            limit_bytes: self.max_memory.map(|limit| limit as u64),
        }
    }

    /// Final step of teardown. The runtime this binding served must already
    /// be gone.
    pub fn release(self, env_id: u64) {
        debug!(
            env = env_id,
            last_bytes = self.last_bytes,
            peak_bytes = self.peak_bytes,
            "allocator binding released"
        );
    }
}
