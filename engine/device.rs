//! Device placement and memory accounting.
//!
//! A device is an execution slot with a fixed memory budget. Every staged partition
//! reserves its footprint up front; the reservation is released when the partition (and
//! with it the [`DeviceAllocation`] guard) is dropped at the end of the fit.

use crate::config::DeviceLayout;
use crate::error::FitError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::System;

/// Capacity used when the host reports no available memory at all.
const FALLBACK_DEVICE_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

#[derive(Debug)]
pub struct DeviceMemoryPool {
    id: DeviceId,
    capacity: u64,
    used: AtomicU64,
}

impl DeviceMemoryPool {
    pub fn new(id: DeviceId, capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            capacity,
            used: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }

    /// Reserves `bytes` for `rank`, failing with `AllocationError` when the pool cannot
    /// hold them. There is no partial reservation.
    pub fn try_reserve(
        self: &Arc<Self>,
        bytes: u64,
        rank: usize,
    ) -> Result<DeviceAllocation, FitError> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(bytes).filter(|&n| n <= self.capacity);
            let Some(next) = next else {
                return Err(FitError::AllocationError {
                    rank,
                    device: self.id.0,
                    requested: bytes,
                    available: self.capacity.saturating_sub(current),
                });
            };
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Ok(DeviceAllocation {
                        pool: Arc::clone(self),
                        bytes,
                    });
                }
                Err(observed) => current = observed,
            }
        }
    }
}

/// RAII guard for a reservation on a [`DeviceMemoryPool`].
#[derive(Debug)]
pub struct DeviceAllocation {
    pool: Arc<DeviceMemoryPool>,
    bytes: u64,
}

impl DeviceAllocation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn device(&self) -> DeviceId {
        self.pool.id
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.pool.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// The devices available to one fit.
#[derive(Debug, Clone)]
pub struct DeviceSet {
    pools: Vec<Arc<DeviceMemoryPool>>,
}

impl DeviceSet {
    pub fn from_layout(layout: &DeviceLayout) -> Self {
        let count = layout.num_devices.max(1);
        let capacity = layout
            .memory_per_device
            .unwrap_or_else(|| host_available_memory() / count as u64);
        let pools = (0..count)
            .map(|idx| DeviceMemoryPool::new(DeviceId(idx), capacity))
            .collect();
        Self { pools }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Ranks map onto devices round-robin, so rank `r` lands on device `r % len`.
    pub fn device_for_rank(&self, rank: usize) -> Arc<DeviceMemoryPool> {
        Arc::clone(&self.pools[rank % self.pools.len()])
    }
}

fn host_available_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    match system.available_memory() {
        0 => FALLBACK_DEVICE_BYTES,
        bytes => bytes,
    }
}
