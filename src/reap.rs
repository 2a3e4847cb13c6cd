//! Status ring reader
//!
//! Walks the slots the hardware has released, moves completed buffers to
//! the parse queue and re-arms each slot in place. Hardware timing
//! anomalies and resource shortages are counted and retried on the next
//! pass; nothing here returns an error to the caller.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::StatusQueue;
use crate::desc::DescriptorPool;
use crate::hw::{DmaOps, RingEntry, StatusSrng};
use crate::replenish::BufferReplenisher;
use crate::tlv::{is_status_done, TlvHeaderMode};
use crate::MON_DROP_REAP_LIMIT;

/// Look-ahead verdict for a slot whose done marker is missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapStatus {
    /// The following slot is done; this one is probably stale.
    Replenish,
    /// Neither slot is done; the hardware is still writing.
    NoDma,
}

/// What to do with a released slot whose buffer lacks the done marker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneMissingPolicy {
    /// Leave the slot alone and retry on the next pass.
    #[default]
    Defer,
    /// If the next slot is done, drop the stale buffer and re-arm.
    Replenish,
}

/// Reader counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapStats {
    pub reaped: u64,
    pub dropped: u64,
    pub status_buf_done_war: u64,
    pub tlv_tag_status_err: u64,
    pub stale_replenished: u64,
    pub no_progress: u64,
    pub invalid_cookie: u64,
    pub null_slot_recovered: u64,
    pub rearm_fail: u64,
    pub access_err: u64,
}

/// Hardware-facing pieces the reader works on
pub struct RingParts<'a> {
    pub ring: &'a mut dyn StatusSrng,
    pub dma: &'a mut dyn DmaOps,
    pub pool: &'a mut DescriptorPool,
    pub replenisher: &'a mut BufferReplenisher,
}

enum SlotOutcome {
    /// Buffer taken; slot re-armed and handed back.
    Taken,
    /// Buffer taken but the slot could not be re-armed.
    TakenSlotEmpty,
    /// Slot repaired without taking a buffer.
    Recovered,
    Stop,
}

#[derive(Debug)]
pub struct StatusRingReader {
    mode: TlvHeaderMode,
    policy: DoneMissingPolicy,
    stats: ReapStats,
}

impl StatusRingReader {
    pub fn new(mode: TlvHeaderMode, policy: DoneMissingPolicy) -> Self {
        Self {
            mode,
            policy,
            stats: ReapStats::default(),
        }
    }

    pub fn get_stats(&self) -> &ReapStats {
        &self.stats
    }

    /// Walk up to `quota` ring entries, moving completed buffers onto
    /// `queue`. Repaired slots count against the quota. Returns the number
    /// of entries handled.
    pub fn reap(&mut self, hw: &mut RingParts<'_>, queue: &mut StatusQueue, quota: u32) -> u32 {
        self.drain(hw, Some(queue), quota)
    }

    /// Walk up to `min(quota, MON_DROP_REAP_LIMIT)` ring entries, freeing
    /// completed buffers without parsing them and re-arming their slots.
    pub fn drop_status_buffers(&mut self, hw: &mut RingParts<'_>, quota: u32) -> u32 {
        self.drain(hw, None, quota.min(MON_DROP_REAP_LIMIT))
    }

    fn drain(
        &mut self,
        hw: &mut RingParts<'_>,
        mut queue: Option<&mut StatusQueue>,
        quota: u32,
    ) -> u32 {
        if quota == 0 {
            return 0;
        }
        if let Err(e) = hw.ring.access_start() {
            warn!("status ring access failed: {}", e);
            self.stats.access_err += 1;
            return 0;
        }

        let mut work_done = 0;
        while work_done < quota {
            let Some(entry) = hw.ring.peek_next() else {
                break;
            };
            let outcome = if entry.is_null() {
                self.recover_slot(hw)
            } else {
                self.take_slot(hw, entry, queue.as_deref_mut())
            };
            match outcome {
                SlotOutcome::Taken | SlotOutcome::Recovered => work_done += 1,
                SlotOutcome::TakenSlotEmpty => {
                    work_done += 1;
                    break;
                }
                SlotOutcome::Stop => break,
            }
        }

        hw.ring.access_end();
        work_done
    }

    /// Done state of the buffer behind `entry`, or `None` when the entry
    /// does not resolve to an armed descriptor.
    fn check_done(&self, hw: &mut RingParts<'_>, entry: RingEntry) -> Option<bool> {
        let buf = hw.pool.get_mut(entry.cookie)?.buffer_mut()?;
        if buf.paddr() != entry.addr {
            return None;
        }
        hw.dma.sync_for_cpu(buf);
        Some(is_status_done(buf.as_slice(), self.mode))
    }

    fn take_slot(
        &mut self,
        hw: &mut RingParts<'_>,
        entry: RingEntry,
        queue: Option<&mut StatusQueue>,
    ) -> SlotOutcome {
        let cookie = entry.cookie;
        let done = match self.check_done(hw, entry) {
            Some(done) => done,
            None => {
                warn!(
                    "ring entry {:#x} has unknown cookie {}, recovering slot",
                    entry.addr, cookie
                );
                self.stats.invalid_cookie += 1;
                return self.recover_slot(hw);
            }
        };

        if !done {
            return self.handle_done_missing(hw, cookie);
        }

        let Some(mut buf) = hw.pool.detach(cookie) else {
            return SlotOutcome::Stop;
        };
        hw.dma.unmap(&mut buf);
        match queue {
            Some(queue) => {
                queue.push(buf.freeze());
                self.stats.reaped += 1;
            }
            None => {
                drop(buf);
                self.stats.dropped += 1;
            }
        }

        if self.rearm(hw, cookie) {
            SlotOutcome::Taken
        } else {
            SlotOutcome::TakenSlotEmpty
        }
    }

    fn handle_done_missing(&mut self, hw: &mut RingParts<'_>, cookie: u32) -> SlotOutcome {
        let status = match hw.ring.peek_next_next() {
            Some(next) if !next.is_null() && self.check_done(hw, next) == Some(true) => {
                self.stats.status_buf_done_war += 1;
                ReapStatus::Replenish
            }
            _ => {
                self.stats.tlv_tag_status_err += 1;
                ReapStatus::NoDma
            }
        };
        debug!("status buffer {} not done, look-ahead {:?}", cookie, status);

        if status != ReapStatus::Replenish || self.policy != DoneMissingPolicy::Replenish {
            return SlotOutcome::Stop;
        }

        if let Some(mut stale) = hw.pool.detach(cookie) {
            hw.dma.unmap(&mut stale);
        }
        self.stats.stale_replenished += 1;
        if self.rearm(hw, cookie) {
            SlotOutcome::Recovered
        } else {
            SlotOutcome::Stop
        }
    }

    /// Arm the current slot with a fresh buffer on `cookie` and advance.
    /// On failure the descriptor goes back to the pool and the slot is
    /// left empty for a later pass.
    fn rearm(&mut self, hw: &mut RingParts<'_>, cookie: u32) -> bool {
        match hw.replenisher.arm_slot(hw.ring, hw.dma, hw.pool, cookie) {
            Ok(_) => {
                hw.ring.advance();
                true
            }
            Err(e) => {
                warn!("re-arming status slot failed: {}", e);
                self.stats.rearm_fail += 1;
                hw.pool.release(&[cookie]);
                hw.ring.write_next(RingEntry::null());
                false
            }
        }
    }

    /// Put a fresh descriptor into an empty or unusable slot.
    fn recover_slot(&mut self, hw: &mut RingParts<'_>) -> SlotOutcome {
        let Some(&cookie) = hw.pool.allocate(1).first() else {
            debug!("no free descriptor for empty status slot");
            self.stats.no_progress += 1;
            return SlotOutcome::Stop;
        };
        if self.rearm(hw, cookie) {
            self.stats.null_slot_recovered += 1;
            SlotOutcome::Recovered
        } else {
            SlotOutcome::Stop
        }
    }
}
