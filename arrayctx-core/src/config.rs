use crate::{
    device::{Device, DeviceKind},
    pool::MemoryPool,
};

/// Default bound on the per-kernel wait queue of an eager context.
pub const DEFAULT_WAIT_QUEUE_LENGTH: usize = 10;

/// Where a context allocates device memory from.
#[derive(Clone, Debug, Default)]
pub enum Allocator {
    /// Nothing chosen: allocate directly, and warn on a GPU where direct
    /// allocation is slow.
    #[default]
    Unset,
    Pool(MemoryPool),
    /// Allocate directly, without the warning.
    Direct,
}

impl Allocator {
    pub(crate) fn resolve(self, device: &Device) -> Option<MemoryPool> {
        match self {
            Self::Unset => {
                if device.kind() == DeviceKind::Gpu {
                    log::warn!(
                        "array context on GPU device `{}` has no allocator, allocations \
                         will be slow; pass Allocator::Pool, or Allocator::Direct to \
                         silence this",
                        device.name()
                    );
                }
                None
            }
            Self::Pool(pool) => Some(pool),
            Self::Direct => None,
        }
    }
}

/// Construction options for [`EagerContext`](crate::EagerContext).
#[derive(Clone, Debug)]
pub struct EagerConfig {
    pub allocator: Allocator,
    /// Events kept per kernel name before the oldest is waited on. `None`
    /// disables backpressure.
    pub wait_queue_length: Option<usize>,
}

impl Default for EagerConfig {
    fn default() -> Self {
        Self {
            allocator: Allocator::Unset,
            wait_queue_length: Some(DEFAULT_WAIT_QUEUE_LENGTH),
        }
    }
}

impl EagerConfig {
    pub fn with_allocator(mut self, allocator: Allocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_wait_queue_length(mut self, length: Option<usize>) -> Self {
        self.wait_queue_length = length;
        self
    }
}

/// Construction options for [`LazyContext`](crate::LazyContext).
#[derive(Clone, Debug, Default)]
pub struct LazyConfig {
    pub allocator: Allocator,
}

impl LazyConfig {
    pub fn with_allocator(mut self, allocator: Allocator) -> Self {
        self.allocator = allocator;
        self
    }
}
