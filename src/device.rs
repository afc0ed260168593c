use crate::error::RenderError;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use log::{debug, info};

/// Default memory budget of the device, in bytes. Sized like
/// the dedicated memory of a small discrete GPU.
pub const DEFAULT_MEMORY_BUDGET: u64 = 512 * 1024 * 1024;

#[derive(Debug)]
struct DeviceInner {
    budget: u64,
    used: AtomicU64,
}

/// The rendering device. It hands out memory against a fixed
/// budget and refuses allocations that would exceed it, so the
/// rest of the crate deals with out-of-memory conditions the
/// same way it would against real device memory. Cloning is
/// cheap; all clones share one budget.
#[derive(Clone, Debug)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn new() -> Result<Self> {
        Self::with_budget(DEFAULT_MEMORY_BUDGET)
    }

    pub fn with_budget(budget: u64) -> Result<Self> {
        // A device without memory cannot hold a single texture;
        // bring-up fails once, and rendering is refused.
        if budget == 0 {
            return Err(anyhow!(RenderError::DeviceUnavailable(
                "device reports no usable memory"
            )));
        }

        info!("Render device ready ({budget} bytes of memory).");
        Ok(Self {
            inner: Arc::new(DeviceInner {
                budget,
                used: AtomicU64::new(0),
            }),
        })
    }

    /// Reserves `bytes` of device memory. The returned guard
    /// gives the bytes back when dropped, which covers every
    /// exit path, normal teardown and error unwinding alike.
    pub fn allocate(&self, bytes: u64, what: &'static str) -> Result<DeviceAllocation> {
        let reserved = self.inner.used.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |used| (used + bytes <= self.inner.budget).then_some(used + bytes),
        );

        match reserved {
            Ok(_) => {
                debug!("Allocated {bytes} bytes for {what}.");
                Ok(DeviceAllocation {
                    inner: self.inner.clone(),
                    size: bytes,
                })
            }
            Err(used) => Err(anyhow!(RenderError::OutOfDeviceMemory {
                requested: bytes,
                available: self.inner.budget - used,
            })),
        }
    }

    pub fn budget(&self) -> u64 {
        self.inner.budget
    }

    pub fn used(&self) -> u64 {
        self.inner.used.load(Ordering::Relaxed)
    }
}

/// A slice of the device budget, released on drop.
#[derive(Debug)]
pub struct DeviceAllocation {
    inner: Arc<DeviceInner>,
    size: u64,
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.inner.used.fetch_sub(self.size, Ordering::Relaxed);
    }
}
