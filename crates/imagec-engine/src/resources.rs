//! Host resources: thread budget, RAM preflight and concurrency slots.

use parking_lot::{Condvar, Mutex};

use crate::error::ResourceError;
use crate::settings::{ImageSetup, RuntimeSettings};

/// Copies of a tile a pipeline keeps alive at once (active, measurement,
/// cache and scratch).
const WORKING_COPIES: u64 = 4;

/// Bytes per pixel assumed for the estimate (16-bit planes).
const BYTES_PER_PIXEL: u64 = 2;

/// Source of the free-RAM figure used by the preflight.
pub trait MemoryProbe: Send + Sync {
    /// Currently available physical memory in bytes.
    fn available_bytes(&self) -> u64;
}

/// Probe backed by `sysinfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory;

impl MemoryProbe for SystemMemory {
    fn available_bytes(&self) -> u64 {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        system.available_memory()
    }
}

/// Probe reporting a fixed amount.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub u64);

impl MemoryProbe for FixedMemory {
    fn available_bytes(&self) -> u64 {
        self.0
    }
}

/// Number of logical cores of the host.
#[must_use]
pub fn host_cores() -> usize {
    num_cpus::get().max(1)
}

/// Resolved concurrency limits of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concurrency {
    pub images: usize,
    pub tiles: usize,
    pub channels: usize,
}

impl Concurrency {
    /// Resolve `runtime` against `cores`. `0` limits become `cores`; the
    /// product of the three never exceeds `cores`, filled images first.
    #[must_use]
    pub fn resolve(runtime: &RuntimeSettings, cores: usize) -> Self {
        let cores = cores.max(1);
        let pick = |limit: usize, left: usize| {
            let limit = if limit == 0 { cores } else { limit };
            limit.clamp(1, left.max(1))
        };
        let images = pick(runtime.max_image_parallel, cores);
        let tiles = pick(runtime.max_tile_parallel, cores / images);
        let channels = pick(runtime.max_channel_parallel, cores / (images * tiles));
        Self {
            images,
            tiles,
            channels,
        }
    }

    /// Total worker threads.
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.images * self.tiles * self.channels
    }
}

/// Working-memory estimate for one tile with `pipelines` pipelines in flight.
#[must_use]
pub fn estimated_ram_per_tile(setup: &ImageSetup, pipelines: usize) -> u64 {
    u64::from(setup.composite_tile_width)
        * u64::from(setup.composite_tile_height)
        * BYTES_PER_PIXEL
        * (pipelines.max(1) as u64)
        * WORKING_COPIES
}

/// Refuse to start when the tiles in flight would not fit into 80 % of the
/// free RAM.
///
/// # Errors
///
/// Returns [`ResourceError`] with the estimate and the budget.
pub fn preflight(
    setup: &ImageSetup,
    concurrency: &Concurrency,
    pipelines: usize,
    probe: &dyn MemoryProbe,
) -> Result<(), ResourceError> {
    let in_flight = (concurrency.images * concurrency.tiles) as u64;
    let required_bytes = in_flight.saturating_mul(estimated_ram_per_tile(setup, pipelines));
    let available_bytes = probe.available_bytes();
    let budget_bytes = available_bytes / 5 * 4;
    tracing::debug!(required_bytes, budget_bytes, "memory preflight");
    if required_bytes > budget_bytes {
        return Err(ResourceError {
            required_bytes,
            budget_bytes,
            available_bytes,
        });
    }
    Ok(())
}

/// Counting semaphore: workers park on a condition variable while all
/// slots are taken.
#[derive(Debug)]
pub struct SlotLimiter {
    free: Mutex<usize>,
    released: Condvar,
}

impl SlotLimiter {
    #[must_use]
    pub fn new(slots: usize) -> Self {
        Self {
            free: Mutex::new(slots.max(1)),
            released: Condvar::new(),
        }
    }

    /// Take a slot, waiting until one is free. The slot is returned when
    /// the guard drops.
    pub fn acquire(&self) -> SlotGuard<'_> {
        let mut free = self.free.lock();
        while *free == 0 {
            self.released.wait(&mut free);
        }
        *free -= 1;
        SlotGuard { limiter: self }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        *self.free.lock()
    }
}

/// A held [`SlotLimiter`] slot.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    limiter: &'a SlotLimiter,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.limiter.free.lock() += 1;
        self.limiter.released.notify_one();
    }
}
