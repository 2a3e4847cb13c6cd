//! Software model of the status ring and DMA layer
//!
//! [`SimRing`] and [`SimDma`] are cheap handles over shared state, so a
//! test or the replay tool can keep one handle to play the hardware side
//! while the pipeline owns another.
//!
//! Ring model: `hp` is the software pointer, `tp` the hardware pointer.
//! Slots in `hp..tp` are released to software. At boot every slot but one
//! is released and empty; the remaining gap slot stays with the hardware,
//! which releases it as-is once it wraps around.

use bytes::BytesMut;
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{DmaOps, RingEntry, StatusSrng};
use crate::buffer::StatusBuffer;
use crate::{Result, RxMonError, RX_MON_STATUS_BUF_ALIGN};

/// Device memory keyed by buffer address; present while mapped.
pub type DeviceMemory = Arc<Mutex<HashMap<u64, BytesMut>>>;

const SIM_PADDR_BASE: u64 = 0x1000_0000;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct RingState {
    entries: Vec<RingEntry>,
    hp: usize,
    tp: usize,
    in_access: bool,
    fail_access: bool,
    access_count: u64,
}

impl RingState {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn num_avail(&self) -> usize {
        (self.tp + self.len() - self.hp) % self.len()
    }

    fn hw_can_release(&self) -> bool {
        (self.tp + 1) % self.len() != self.hp
    }
}

/// Shared-state status ring
#[derive(Debug, Clone)]
pub struct SimRing {
    state: Arc<Mutex<RingState>>,
    mem: DeviceMemory,
}

impl SimRing {
    pub fn new(num_entries: usize, mem: DeviceMemory) -> Result<Self> {
        if num_entries < 2 {
            return Err(RxMonError::InvalidParameter(format!(
                "ring needs at least 2 entries, got {}",
                num_entries
            )));
        }
        Ok(Self {
            state: Arc::new(Mutex::new(RingState {
                entries: vec![RingEntry::null(); num_entries],
                hp: 0,
                tp: num_entries - 1,
                in_access: false,
                fail_access: false,
                access_count: 0,
            })),
            mem,
        })
    }

    /// Software pointer and hardware pointer
    pub fn hp_tp(&self) -> (usize, usize) {
        let s = lock(&self.state);
        (s.hp, s.tp)
    }

    pub fn entry(&self, slot: usize) -> Option<RingEntry> {
        lock(&self.state).entries.get(slot).copied()
    }

    /// Number of completed access windows.
    pub fn access_count(&self) -> u64 {
        lock(&self.state).access_count
    }

    pub fn set_access_failure(&self, fail: bool) {
        lock(&self.state).fail_access = fail;
    }

    /// Whether the hardware side has an armed slot it could complete.
    pub fn hw_has_armed(&self) -> bool {
        let s = lock(&self.state);
        let mut tp = s.tp;
        while (tp + 1) % s.len() != s.hp {
            if !s.entries[tp].is_null() {
                return true;
            }
            tp = (tp + 1) % s.len();
        }
        false
    }

    /// Hardware side: fill the next armed slot with `data` and release it.
    /// Empty slots on the way are released untouched. Returns the slot
    /// index written.
    pub fn complete(&self, data: &[u8]) -> Result<usize> {
        let slot = self.release_next_armed()?;
        self.write_device(slot, data)?;
        Ok(slot)
    }

    /// Hardware side: release the next armed slot without writing it, as
    /// when the done marker is late.
    pub fn release_without_done(&self) -> Result<usize> {
        self.release_next_armed()
    }

    /// Hardware side: write into a slot's buffer after it was released.
    pub fn write_late(&self, slot: usize, data: &[u8]) -> Result<()> {
        self.write_device(slot, data)
    }

    fn release_next_armed(&self) -> Result<usize> {
        let mut s = lock(&self.state);
        loop {
            if !s.hw_can_release() {
                return Err(RxMonError::Ring("no armed slot left to complete".to_string()));
            }
            let slot = s.tp;
            s.tp = (s.tp + 1) % s.len();
            if s.entries[slot].is_null() {
                trace!("sim ring released empty slot {}", slot);
                continue;
            }
            return Ok(slot);
        }
    }

    fn write_device(&self, slot: usize, data: &[u8]) -> Result<()> {
        let entry = self
            .entry(slot)
            .ok_or_else(|| RxMonError::InvalidParameter(format!("no ring slot {}", slot)))?;
        if entry.is_null() {
            return Err(RxMonError::Ring(format!("slot {} holds no buffer", slot)));
        }
        lock(&self.mem).insert(entry.addr, BytesMut::from(data));
        Ok(())
    }
}

impl StatusSrng for SimRing {
    fn access_start(&mut self) -> Result<()> {
        let mut s = lock(&self.state);
        if s.fail_access {
            return Err(RxMonError::Ring("ring access refused".to_string()));
        }
        s.in_access = true;
        Ok(())
    }

    fn access_end(&mut self) {
        let mut s = lock(&self.state);
        s.in_access = false;
        s.access_count += 1;
    }

    fn peek_next(&self) -> Option<RingEntry> {
        let s = lock(&self.state);
        if s.hp == s.tp {
            None
        } else {
            Some(s.entries[s.hp])
        }
    }

    fn peek_next_next(&self) -> Option<RingEntry> {
        let s = lock(&self.state);
        if s.num_avail() < 2 {
            None
        } else {
            Some(s.entries[(s.hp + 1) % s.len()])
        }
    }

    fn write_next(&mut self, entry: RingEntry) {
        let mut s = lock(&self.state);
        if s.hp == s.tp {
            debug!("sim ring write with no released slot ignored");
            return;
        }
        if !s.in_access {
            debug!("sim ring slot {} written outside an access window", s.hp);
        }
        let hp = s.hp;
        s.entries[hp] = entry;
    }

    fn advance(&mut self) {
        let mut s = lock(&self.state);
        if s.hp != s.tp {
            s.hp = (s.hp + 1) % s.len();
        }
    }

    fn num_avail(&self) -> usize {
        lock(&self.state).num_avail()
    }

    fn num_entries(&self) -> usize {
        lock(&self.state).len()
    }
}

/// Shared-state DMA allocator with failure injection
#[derive(Debug, Clone)]
pub struct SimDma {
    mem: DeviceMemory,
    state: Arc<Mutex<DmaState>>,
}

#[derive(Debug, Default)]
struct DmaState {
    next_paddr: u64,
    fail_allocs: u32,
    fail_maps: u32,
    allocated: u64,
    unmapped: u64,
}

impl SimDma {
    pub fn new(mem: DeviceMemory) -> Self {
        Self {
            mem,
            state: Arc::new(Mutex::new(DmaState {
                next_paddr: SIM_PADDR_BASE,
                ..Default::default()
            })),
        }
    }

    /// Fail the next `n` allocations.
    pub fn fail_next_allocs(&self, n: u32) {
        lock(&self.state).fail_allocs = n;
    }

    /// Fail the next `n` mappings.
    pub fn fail_next_maps(&self, n: u32) {
        lock(&self.state).fail_maps = n;
    }

    /// Buffers currently mapped
    pub fn mapped_count(&self) -> usize {
        lock(&self.mem).len()
    }

    pub fn allocated(&self) -> u64 {
        lock(&self.state).allocated
    }

    pub fn unmapped(&self) -> u64 {
        lock(&self.state).unmapped
    }
}

impl DmaOps for SimDma {
    fn alloc_map(&mut self, size: usize) -> Result<StatusBuffer> {
        let mut s = lock(&self.state);
        if s.fail_allocs > 0 {
            s.fail_allocs -= 1;
            return Err(RxMonError::Alloc(format!("no memory for {} byte buffer", size)));
        }
        let paddr = s.next_paddr;
        let stride = size.div_ceil(RX_MON_STATUS_BUF_ALIGN).max(1) * RX_MON_STATUS_BUF_ALIGN;
        s.next_paddr += stride as u64;
        if s.fail_maps > 0 {
            s.fail_maps -= 1;
            return Err(RxMonError::Map { size });
        }
        s.allocated += 1;
        drop(s);

        let mut buf = StatusBuffer::new(paddr, size);
        buf.set_mapped(true);
        lock(&self.mem).insert(paddr, BytesMut::new());
        Ok(buf)
    }

    fn sync_for_cpu(&mut self, buf: &mut StatusBuffer) {
        let mem = lock(&self.mem);
        if let Some(dev) = mem.get(&buf.paddr()) {
            let n = dev.len().min(buf.len());
            buf.as_mut_slice()[..n].copy_from_slice(&dev[..n]);
        }
    }

    fn unmap(&mut self, buf: &mut StatusBuffer) {
        if !buf.is_mapped() {
            return;
        }
        lock(&self.mem).remove(&buf.paddr());
        buf.set_mapped(false);
        lock(&self.state).unmapped += 1;
    }
}

/// Ring and DMA handles over one device memory
pub fn sim_pair(num_entries: usize) -> Result<(SimRing, SimDma)> {
    let mem = DeviceMemory::default();
    let ring = SimRing::new(num_entries, mem.clone())?;
    Ok((ring, SimDma::new(mem)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RX_MON_STATUS_OWNER;

    fn arm_all(ring: &mut SimRing, dma: &mut SimDma) {
        let mut cookie = 0;
        while let Some(entry) = ring.peek_next() {
            assert!(entry.is_null());
            let buf = dma.alloc_map(64).unwrap();
            ring.write_next(RingEntry::new(buf.paddr(), cookie, RX_MON_STATUS_OWNER));
            ring.advance();
            cookie += 1;
        }
    }

    #[test]
    fn test_boot_state() {
        let (ring, _dma) = sim_pair(4).unwrap();
        assert_eq!(ring.hp_tp(), (0, 3));
        assert_eq!(ring.num_avail(), 3);
        assert_eq!(ring.num_entries(), 4);
        assert!(ring.peek_next().unwrap().is_null());
        assert!(SimRing::new(1, DeviceMemory::default()).is_err());
    }

    #[test]
    fn test_complete_releases_gap_then_writes() {
        let (mut ring, mut dma) = sim_pair(4).unwrap();
        arm_all(&mut ring, &mut dma);
        assert_eq!(ring.num_avail(), 0);
        assert!(ring.peek_next().is_none());
        assert!(ring.hw_has_armed());

        // The gap slot (3) goes back empty, slot 0 carries the data.
        assert_eq!(ring.complete(&[1, 2, 3]).unwrap(), 0);
        assert_eq!(ring.num_avail(), 2);
        assert!(ring.peek_next().unwrap().is_null());
        assert!(!ring.peek_next_next().unwrap().is_null());

        let entry = ring.entry(0).unwrap();
        let mut buf = StatusBuffer::new(entry.addr, 8);
        buf.set_mapped(true);
        dma.sync_for_cpu(&mut buf);
        assert_eq!(&buf.as_slice()[..4], &[1, 2, 3, 0]);
    }

    #[test]
    fn test_hardware_stops_before_software_pointer() {
        let (mut ring, mut dma) = sim_pair(3).unwrap();
        arm_all(&mut ring, &mut dma);
        // One of the two releasable slots is the empty gap.
        assert_eq!(ring.complete(&[1]).unwrap(), 0);
        assert!(matches!(ring.complete(&[2]), Err(RxMonError::Ring(_))));
        assert!(!ring.hw_has_armed());
    }

    #[test]
    fn test_late_write() {
        let (mut ring, mut dma) = sim_pair(4).unwrap();
        arm_all(&mut ring, &mut dma);
        let slot = ring.release_without_done().unwrap();
        let addr = ring.entry(slot).unwrap().addr;
        assert_eq!(lock(&dma.mem).get(&addr).map(|m| m.len()), Some(0));
        ring.write_late(slot, &[9; 4]).unwrap();
        assert_eq!(lock(&dma.mem).get(&addr).map(|m| m.len()), Some(4));
        assert!(ring.write_late(3, &[1]).is_err());
    }

    #[test]
    fn test_dma_failure_injection() {
        let (_ring, mut dma) = sim_pair(4).unwrap();
        dma.fail_next_allocs(1);
        dma.fail_next_maps(1);
        assert!(matches!(dma.alloc_map(64), Err(RxMonError::Alloc(_))));
        assert!(matches!(dma.alloc_map(64), Err(RxMonError::Map { size: 64 })));
        let mut buf = dma.alloc_map(64).unwrap();
        assert!(buf.is_mapped());
        assert_eq!(dma.mapped_count(), 1);
        dma.unmap(&mut buf);
        dma.unmap(&mut buf);
        assert_eq!(dma.mapped_count(), 0);
        assert_eq!(dma.unmapped(), 1);
        assert_eq!(dma.allocated(), 1);
    }

    #[test]
    fn test_access_failure() {
        let (mut ring, _dma) = sim_pair(4).unwrap();
        ring.set_access_failure(true);
        assert!(ring.access_start().is_err());
        ring.set_access_failure(false);
        ring.access_start().unwrap();
        ring.access_end();
        assert_eq!(ring.access_count(), 1);
    }
}
