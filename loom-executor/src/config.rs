//! Per-invocation resource limits.

use std::time::Duration;

/// Default wall-clock deadline for custom routes.
pub const DEFAULT_CUSTOM_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wall-clock deadline for logic pages.
pub const DEFAULT_LOGIC_TIMEOUT: Duration = Duration::from_secs(10);

/// Default Lua allocator ceiling: 64 MiB.
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Default number of VM instructions between deadline checks.
pub const DEFAULT_INSTRUCTION_INTERVAL: u32 = 1_000;

/// Bounds applied to a single sandboxed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct SandboxLimits {
    /// Wall-clock deadline measured from the start of the run.
    pub timeout: Duration,

    /// Maximum bytes the Lua allocator may hold.
    pub memory_limit_bytes: usize,

    /// How often, in VM instructions, the deadline is checked.
    pub instruction_interval: u32,
}

impl SandboxLimits {
    /// Limits with the given deadline and default memory/check settings.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout, ..Self::default() }
    }

    /// Replaces the memory ceiling.
    #[must_use]
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }

    /// Replaces the deadline check interval. Zero is treated as one.
    #[must_use]
    pub fn instruction_interval(mut self, every: u32) -> Self {
        self.instruction_interval = every.max(1);
        self
    }

    /// The deadline in whole milliseconds.
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CUSTOM_TIMEOUT,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            instruction_interval: DEFAULT_INSTRUCTION_INTERVAL,
        }
    }
}
