//! Buffer preparation and ring re-arming

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::StatusBuffer;
use crate::desc::DescriptorPool;
use crate::hw::{DmaOps, RingEntry, StatusSrng};
use crate::{Result, RxMonError, RX_MON_STATUS_OWNER};

/// Allocation counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplenishStats {
    pub nbuf_alloc_fail: u64,
    pub map_err: u64,
    pub buffers_armed: u64,
}

/// Outcome of one replenish call; `allocated - placed == returned`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplenishReport {
    pub allocated: usize,
    pub placed: usize,
    pub returned: usize,
}

#[derive(Debug)]
pub struct BufferReplenisher {
    buf_size: usize,
    retry_threshold: u32,
    stats: ReplenishStats,
}

impl BufferReplenisher {
    pub fn new(buf_size: usize, retry_threshold: u32) -> Self {
        Self {
            buf_size,
            retry_threshold: retry_threshold.max(1),
            stats: ReplenishStats::default(),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_stats(&self) -> &ReplenishStats {
        &self.stats
    }

    /// Allocate and map one buffer, retrying transient failures.
    pub fn prepare_buffer(&mut self, dma: &mut dyn DmaOps) -> Result<StatusBuffer> {
        let mut last_err = RxMonError::Alloc("no attempt made".to_string());
        for attempt in 1..=self.retry_threshold {
            match dma.alloc_map(self.buf_size) {
                Ok(buf) => return Ok(buf),
                Err(e @ RxMonError::Alloc(_)) => {
                    self.stats.nbuf_alloc_fail += 1;
                    debug!("status buffer alloc attempt {} failed: {}", attempt, e);
                    last_err = e;
                }
                Err(e @ RxMonError::Map { .. }) => {
                    self.stats.map_err += 1;
                    debug!("status buffer map attempt {} failed: {}", attempt, e);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        warn!(
            "giving up on status buffer after {} attempts: {}",
            self.retry_threshold, last_err
        );
        Err(last_err)
    }

    /// Attach a fresh buffer to `cookie` and write it into the slot at the
    /// software pointer. The caller advances.
    pub fn arm_slot(
        &mut self,
        ring: &mut dyn StatusSrng,
        dma: &mut dyn DmaOps,
        pool: &mut DescriptorPool,
        cookie: u32,
    ) -> Result<RingEntry> {
        match pool.get(cookie) {
            None => {
                return Err(RxMonError::InvalidParameter(format!(
                    "descriptor cookie {} out of range",
                    cookie
                )))
            }
            Some(desc) if desc.has_buffer() => {
                return Err(RxMonError::InvalidParameter(format!(
                    "descriptor {} already armed",
                    cookie
                )))
            }
            Some(_) => {}
        }
        let buf = self.prepare_buffer(dma)?;
        let entry = RingEntry::new(buf.paddr(), cookie, RX_MON_STATUS_OWNER);
        pool.attach(cookie, buf)?;
        ring.write_next(entry);
        self.stats.buffers_armed += 1;
        Ok(entry)
    }

    /// Arm up to `desired` released slots.
    pub fn replenish(
        &mut self,
        ring: &mut dyn StatusSrng,
        dma: &mut dyn DmaOps,
        pool: &mut DescriptorPool,
        desired: usize,
    ) -> ReplenishReport {
        if let Err(e) = ring.access_start() {
            warn!("replenish skipped: {}", e);
            return ReplenishReport::default();
        }

        let bound = desired.min(ring.num_avail());
        let cookies = pool.allocate(bound);
        let mut placed = 0;
        while placed < cookies.len() {
            match ring.peek_next() {
                Some(entry) if entry.is_null() => {}
                Some(entry) => {
                    debug!(
                        "replenish stopped: slot already holds buffer {:#x}",
                        entry.addr
                    );
                    break;
                }
                None => break,
            }
            if let Err(e) = self.arm_slot(ring, dma, pool, cookies[placed]) {
                warn!("replenish stopped after {} buffers: {}", placed, e);
                break;
            }
            ring.advance();
            placed += 1;
        }
        ring.access_end();

        let leftover = &cookies[placed..];
        pool.release(leftover);
        ReplenishReport {
            allocated: cookies.len(),
            placed,
            returned: leftover.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::sim_pair;

    #[test]
    fn test_initial_fill_then_noop() {
        let (mut ring, mut dma) = sim_pair(8).unwrap();
        let mut pool = DescriptorPool::new(9);
        let mut rep = BufferReplenisher::new(256, 20);

        let report = rep.replenish(&mut ring, &mut dma, &mut pool, 7);
        assert_eq!(
            report,
            ReplenishReport {
                allocated: 7,
                placed: 7,
                returned: 0
            }
        );
        assert_eq!(ring.num_avail(), 0);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(ring.entry(0).unwrap().owner, RX_MON_STATUS_OWNER);

        // No free slots left.
        let report = rep.replenish(&mut ring, &mut dma, &mut pool, 4);
        assert_eq!(report, ReplenishReport::default());
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_bounded_by_free_slots() {
        let (mut ring, mut dma) = sim_pair(4).unwrap();
        let mut pool = DescriptorPool::new(5);
        let mut rep = BufferReplenisher::new(256, 20);
        let report = rep.replenish(&mut ring, &mut dma, &mut pool, 100);
        assert_eq!(report.allocated, 3);
        assert_eq!(report.placed, 3);
        assert_eq!(rep.get_stats().buffers_armed, 3);
    }

    #[test]
    fn test_stops_at_armed_slot() {
        let (mut ring, mut dma) = sim_pair(4).unwrap();
        let mut pool = DescriptorPool::new(5);
        ring.write_next(RingEntry::new(0xdead_0000, 4, RX_MON_STATUS_OWNER));
        let mut rep = BufferReplenisher::new(256, 20);
        let report = rep.replenish(&mut ring, &mut dma, &mut pool, 3);
        assert_eq!(report.allocated, 3);
        assert_eq!(report.placed, 0);
        assert_eq!(report.returned, 3);
        assert_eq!(pool.free_count(), 5);
    }

    #[test]
    fn test_alloc_retry() {
        let (mut ring, mut dma) = sim_pair(4).unwrap();
        let mut pool = DescriptorPool::new(5);
        let mut rep = BufferReplenisher::new(256, 3);

        dma.fail_next_allocs(2);
        dma.fail_next_maps(0);
        let report = rep.replenish(&mut ring, &mut dma, &mut pool, 1);
        assert_eq!(report.placed, 1);
        assert_eq!(rep.get_stats().nbuf_alloc_fail, 2);

        dma.fail_next_maps(3);
        let report = rep.replenish(&mut ring, &mut dma, &mut pool, 2);
        assert_eq!(report.allocated, 2);
        assert_eq!(report.placed, 0);
        assert_eq!(report.returned, 2);
        assert_eq!(rep.get_stats().map_err, 3);
        // The failed slot is still empty and released to software.
        assert!(ring.peek_next().unwrap().is_null());
    }

    #[test]
    fn test_access_failure_is_noop() {
        let (mut ring, mut dma) = sim_pair(4).unwrap();
        let mut pool = DescriptorPool::new(5);
        let mut rep = BufferReplenisher::new(256, 3);
        ring.set_access_failure(true);
        let report = rep.replenish(&mut ring, &mut dma, &mut pool, 3);
        assert_eq!(report, ReplenishReport::default());
        assert_eq!(pool.free_count(), 5);
    }
}
