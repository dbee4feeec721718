/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Synchronisation recorded inside a command buffer: deferred barrier
//! work, ordering of indirect arguments after CP writes, and the
//! handshake between the graphics stream and its parallel compute stream.

use std::{mem, ops::Range};

use arrayvec::ArrayVec;

use super::embedded::EmbeddedData;
use crate::{
    conv::BarrierActions,
    encode::{self, CompareFunc, ReleaseData, ReleaseMem, WaitEngine},
    hw::{CoherFlags, HwTable},
    packet::CmdSink,
    regs::event,
    CommandError,
};

/// Barrier work not emitted yet. It lands in front of the next command
/// that does work, so consecutive barriers merge into one acquire.
#[derive(Debug, Default)]
pub(crate) struct PendingSync {
    events: ArrayVec<u32, 4>,
    coher: CoherFlags,
    pfp_sync: bool,
}

impl PendingSync {
    pub fn add(&mut self, actions: &BarrierActions) {
        for &e in actions.events.iter() {
            self.add_event(e);
        }
        self.coher |= actions.coher;
        self.pfp_sync |= actions.pfp_sync;
    }

    pub fn add_event(&mut self, event: u32) {
        if !self.events.contains(&event) && !self.events.is_full() {
            self.events.push(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.coher.is_empty() && !self.pfp_sync
    }

    pub fn flush<S: CmdSink>(&mut self, sink: &mut S, hw: &HwTable) -> Result<(), CommandError> {
        if self.is_empty() {
            return Ok(());
        }
        let pending = mem::take(self);
        log::trace!("flushing barrier work {:?}", pending);
        for &e in pending.events.iter() {
            encode::event_write(sink, e, event::INDEX_PARTIAL_FLUSH)?;
        }
        if !pending.coher.is_empty() {
            encode::acquire_mem(sink, hw, pending.coher, 0, u64::MAX)?;
        }
        if pending.pfp_sync {
            encode::pfp_sync_me(sink)?;
        }
        Ok(())
    }
}

fn overlaps(a: &Range<pt::GpuAddress>, b: &Range<pt::GpuAddress>) -> bool {
    a.start < b.end && b.start < a.end
}

/// Memory written by the command processor, which the prefetch parser
/// would otherwise read ahead of the write.
///
/// Each tracked write is followed by a bottom-of-pipe release of a
/// per-command-buffer timestamp; readers wait for that timestamp. The
/// graphics and parallel compute streams wait independently, so a wait on
/// one says nothing about the other.
#[derive(Debug, Default)]
pub(crate) struct WriteTracker {
    slot: Option<pt::GpuAddress>,
    last: u64,
    writes: Vec<(Range<pt::GpuAddress>, u64)>,
    /// Highest timestamp waited for on the graphics and compute streams.
    waited: [u64; 2],
}

impl WriteTracker {
    pub fn record<S: CmdSink>(
        &mut self,
        sink: &mut S,
        hw: &HwTable,
        embedded: &mut EmbeddedData,
        ranges: &[Range<pt::GpuAddress>],
    ) -> Result<(), CommandError> {
        let slot = match self.slot {
            Some(slot) => slot,
            None => {
                let (slot, words) = embedded.alloc(2, 2)?;
                for word in words.iter_mut() {
                    *word = 0;
                }
                // Re-executions start over from zero.
                encode::write_data(sink, slot, &[0, 0])?;
                self.slot = Some(slot);
                slot
            }
        };
        self.last += 1;
        encode::release_mem(
            sink,
            hw,
            &ReleaseMem::bottom_of_pipe(ReleaseData::Value64(self.last), slot),
        )?;
        let stamp = self.last;
        self.writes
            .extend(ranges.iter().map(|range| (range.clone(), stamp)));
        Ok(())
    }

    /// Waits on one stream for the latest write overlapping `range`, if
    /// that stream has not waited for it yet. On the graphics stream the
    /// prefetch parser is held back too. Returns whether a wait was emitted.
    pub fn wait_for<S: CmdSink>(
        &mut self,
        sink: &mut S,
        range: &Range<pt::GpuAddress>,
        on_ace: bool,
    ) -> Result<bool, CommandError> {
        let stamp = self
            .writes
            .iter()
            .filter(|&&(ref written, _)| overlaps(written, range))
            .map(|&(_, stamp)| stamp)
            .max();
        match stamp {
            Some(stamp) => self.wait_stamp(sink, stamp, on_ace),
            None => Ok(false),
        }
    }

    pub fn wait_all<S: CmdSink>(&mut self, sink: &mut S, on_ace: bool) -> Result<bool, CommandError> {
        match self.writes.iter().map(|&(_, stamp)| stamp).max() {
            Some(stamp) => self.wait_stamp(sink, stamp, on_ace),
            None => Ok(false),
        }
    }

    fn wait_stamp<S: CmdSink>(
        &mut self,
        sink: &mut S,
        stamp: u64,
        on_ace: bool,
    ) -> Result<bool, CommandError> {
        let lane = on_ace as usize;
        if self.waited[lane] >= stamp {
            return Ok(false);
        }
        let slot = self
            .slot
            .ok_or(CommandError::InvalidArgument("write tracker has no slot"))?;
        encode::wait_reg_mem64(
            sink,
            CompareFunc::GreaterEqual,
            slot,
            stamp,
            !0,
            WaitEngine::Me,
        )?;
        // Only the graphics engine has a prefetch parser to hold back.
        if !on_ace {
            encode::pfp_sync_me(sink)?;
        }
        self.waited[lane] = stamp;
        // Writes both streams have waited for are done with.
        let landed = self.waited[0].min(self.waited[1]);
        self.writes.retain(|&(_, s)| s > landed);
        Ok(true)
    }

    /// Writes some stream has not waited for yet.
    pub fn pending(&self) -> usize {
        self.writes.len()
    }
}

/// Dwords of the gang slots: graphics-to-compute then compute-to-graphics,
/// 64 bits each.
pub(crate) const GANG_SLOT_DWORDS: u32 = 4;

/// Ordering between the graphics stream and the parallel compute stream
/// of one command buffer.
#[derive(Debug)]
pub(crate) struct GangSync {
    slots: Option<pt::GpuAddress>,
    gfx_value: u64,
    ace_value: u64,
    /// Graphics work recorded since the compute stream last synchronised
    /// with it.
    pub main_work: bool,
    /// Compute work the graphics stream has not waited for yet.
    pub ace_work: bool,
}

impl Default for GangSync {
    fn default() -> Self {
        Self {
            slots: None,
            gfx_value: 0,
            ace_value: 0,
            // Earlier command buffers of the same submission count as work.
            main_work: true,
            ace_work: false,
        }
    }
}

impl GangSync {
    pub fn slots(&self) -> Option<pt::GpuAddress> {
        self.slots
    }

    fn ensure_slots(&mut self, embedded: &mut EmbeddedData) -> Result<pt::GpuAddress, CommandError> {
        if let Some(slots) = self.slots {
            return Ok(slots);
        }
        let (slots, words) = embedded.alloc(GANG_SLOT_DWORDS, 2)?;
        for word in words.iter_mut() {
            *word = 0;
        }
        self.slots = Some(slots);
        Ok(slots)
    }

    /// Makes the compute stream wait for graphics work recorded so far.
    pub fn handoff<G: CmdSink, A: CmdSink>(
        &mut self,
        gfx: &mut G,
        ace: &mut A,
        hw: &HwTable,
        embedded: &mut EmbeddedData,
    ) -> Result<(), CommandError> {
        if !self.main_work {
            return Ok(());
        }
        let slots = self.ensure_slots(embedded)?;
        self.gfx_value += 1;
        log::trace!("gang handoff {} to the compute stream", self.gfx_value);
        encode::release_mem(
            gfx,
            hw,
            &ReleaseMem::bottom_of_pipe(ReleaseData::Value64(self.gfx_value), slots),
        )?;
        encode::wait_reg_mem64(
            ace,
            CompareFunc::GreaterEqual,
            slots,
            self.gfx_value,
            !0,
            WaitEngine::Me,
        )?;
        self.main_work = false;
        Ok(())
    }

    /// Makes the graphics stream wait for compute work recorded so far.
    pub fn join<G: CmdSink, A: CmdSink>(
        &mut self,
        gfx: &mut G,
        ace: &mut A,
        hw: &HwTable,
        embedded: &mut EmbeddedData,
    ) -> Result<(), CommandError> {
        if !self.ace_work {
            return Ok(());
        }
        let slots = self.ensure_slots(embedded)?;
        let ace_slot = slots + 8;
        self.ace_value += 1;
        log::trace!("gang join {} from the compute stream", self.ace_value);
        encode::release_mem(
            ace,
            hw,
            &ReleaseMem {
                event: event::CS_DONE,
                event_index: event::INDEX_END_OF_PIPE,
                cache: CoherFlags::empty(),
                data: ReleaseData::Value64(self.ace_value),
                dst: ace_slot,
            },
        )?;
        encode::wait_reg_mem64(
            gfx,
            CompareFunc::GreaterEqual,
            ace_slot,
            self.ace_value,
            !0,
            WaitEngine::Me,
        )?;
        self.ace_work = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        conv::barrier_actions,
        hw::GFX10,
        packet::{op, Packets},
        ChunkPool, SoftKernel,
    };

    fn opcodes(words: &[u32]) -> Vec<u8> {
        Packets::new(words).map(|p| p.unwrap().opcode()).collect()
    }

    #[test]
    fn consecutive_barriers_merge() {
        let mut sync = PendingSync::default();
        sync.add(&barrier_actions(
            pt::AccessFlags::COLOR_TARGET,
            pt::AccessFlags::SHADER_READ,
        ));
        sync.add(&barrier_actions(
            pt::AccessFlags::SHADER_WRITE,
            pt::AccessFlags::INDIRECT_ARGS,
        ));
        let mut words = Vec::new();
        sync.flush(&mut words, &GFX10).unwrap();
        assert_eq!(
            opcodes(&words),
            vec![op::EVENT_WRITE, op::EVENT_WRITE, op::ACQUIRE_MEM, op::PFP_SYNC_ME]
        );
        assert!(sync.is_empty());
        words.clear();
        sync.flush(&mut words, &GFX10).unwrap();
        assert!(words.is_empty());
    }

    #[test]
    fn streams_wait_for_writes_independently() {
        let pool = ChunkPool::new(Arc::new(SoftKernel::new()));
        let mut embedded = EmbeddedData::new(Arc::new(pool), 256);
        let mut tracker = WriteTracker::default();
        let mut gfx = Vec::new();
        let mut ace = Vec::new();
        tracker
            .record(&mut gfx, &GFX10, &mut embedded, &[0x1000..0x1010])
            .unwrap();
        assert!(!tracker.wait_for(&mut gfx, &(0x2000..0x2010), false).unwrap());

        assert!(tracker.wait_for(&mut ace, &(0x1008..0x1010), true).unwrap());
        assert_eq!(opcodes(&ace), vec![op::WAIT_REG_MEM64]);
        assert!(!tracker.wait_for(&mut ace, &(0x1000..0x1004), true).unwrap());
        assert_eq!(tracker.pending(), 1);

        let recorded = gfx.len();
        assert!(tracker.wait_all(&mut gfx, false).unwrap());
        assert_eq!(
            opcodes(&gfx[recorded..]),
            vec![op::WAIT_REG_MEM64, op::PFP_SYNC_ME]
        );
        assert_eq!(tracker.pending(), 0);
    }
}
