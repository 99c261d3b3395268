//! Splitting a device range across worker partitions.

use std::ops::RangeInclusive;

/// A contiguous slice of the device range owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub worker_id: usize,
    pub start: u32,
    pub end: u32,
}

impl Partition {
    pub fn range(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }

    pub fn device_count(&self) -> usize {
        (self.end - self.start) as usize + 1
    }
}

/// Number of workers for `devices`: enough to keep each under `per_worker_cap`,
/// never more than `budget`, never fewer than one.
pub fn worker_count(devices: usize, budget: usize, per_worker_cap: usize) -> usize {
    let cap = per_worker_cap.max(1);
    let needed = devices.div_ceil(cap);
    needed.min(budget).max(1)
}

/// Split `start..=end` into balanced contiguous partitions.
///
/// Sizes differ by at most one; the earlier partitions take the remainder.
/// Every device lands in exactly one partition.
pub fn plan_partitions(start: u32, end: u32, budget: usize, per_worker_cap: usize) -> Vec<Partition> {
    if end < start {
        return Vec::new();
    }
    let devices = (end - start) as usize + 1;
    let workers = worker_count(devices, budget, per_worker_cap).min(devices);
    let base = devices / workers;
    let extra = devices % workers;

    let mut partitions = Vec::with_capacity(workers);
    let mut next = start;
    for worker_id in 0..workers {
        let size = base + usize::from(worker_id < extra);
        let last = next + (size as u32 - 1);
        partitions.push(Partition {
            worker_id,
            start: next,
            end: last,
        });
        next = last.saturating_add(1);
    }
    partitions
}
