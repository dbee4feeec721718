/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! CPU mirror of GPU register state.
//!
//! Every register has two values: the one the client asked for and the one
//! the stream last wrote. A register is dirty while those differ, so setting
//! a value back to what the hardware already holds cancels the write.

use std::ops::Range;

use arrayvec::ArrayVec;
use bit_set::BitSet;
use fxhash::FxHashMap;

use crate::{encode, packet::CmdSink, regs, CommandError};

/// Dense storage for a contiguous block of registers.
#[derive(Debug)]
struct Window {
    base: u32,
    values: Box<[u32]>,
    known: BitSet,
    hw: Box<[u32]>,
    hw_known: BitSet,
    dirty: BitSet,
}

impl Window {
    fn new(range: Range<u32>) -> Self {
        let len = (range.end - range.start) as usize;
        Self {
            base: range.start,
            values: vec![0; len].into_boxed_slice(),
            known: BitSet::with_capacity(len),
            hw: vec![0; len].into_boxed_slice(),
            hw_known: BitSet::with_capacity(len),
            dirty: BitSet::with_capacity(len),
        }
    }

    fn index(&self, reg: u32) -> Option<usize> {
        let index = reg.checked_sub(self.base)? as usize;
        if index < self.values.len() {
            Some(index)
        } else {
            None
        }
    }

    fn clear(&mut self) {
        self.known.clear();
        self.hw_known.clear();
        self.dirty.clear();
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    value: Option<u32>,
    hw: Option<u32>,
    dirty: bool,
}

/// A register shadow for one packet family.
///
/// Registers outside the dense windows are still tracked, in a sparse map.
#[derive(Debug)]
pub struct RegisterShadow {
    windows: ArrayVec<Window, 2>,
    sparse: FxHashMap<u32, Slot>,
}

impl RegisterShadow {
    /// Shadow of the `SET_CONTEXT_REG` space.
    pub fn context() -> Self {
        Self::with_windows(&[regs::RegSpace::Context.range()])
    }

    /// Shadow of the `SET_SH_REG` and `SET_UCONFIG_REG` spaces.
    pub fn sh() -> Self {
        Self::with_windows(&[regs::RegSpace::Sh.range(), 0xC200..0xC300])
    }

    fn with_windows(ranges: &[Range<u32>]) -> Self {
        Self {
            windows: ranges.iter().cloned().map(Window::new).collect(),
            sparse: FxHashMap::default(),
        }
    }

    fn locate(&mut self, reg: u32) -> Option<(&mut Window, usize)> {
        self.windows
            .iter_mut()
            .find_map(|w| w.index(reg).map(|i| (w, i)))
    }

    /// Records `value` for `reg`. Returns `true` if a write is now pending.
    pub fn set(&mut self, reg: u32, value: u32) -> bool {
        if let Some((w, i)) = self.locate(reg) {
            if w.known.contains(i) && w.values[i] == value {
                return w.dirty.contains(i);
            }
            w.values[i] = value;
            w.known.insert(i);
            if w.hw_known.contains(i) && w.hw[i] == value {
                w.dirty.remove(i);
                false
            } else {
                w.dirty.insert(i);
                true
            }
        } else {
            let slot = self.sparse.entry(reg).or_default();
            if slot.value == Some(value) {
                return slot.dirty;
            }
            slot.value = Some(value);
            slot.dirty = slot.hw != Some(value);
            slot.dirty
        }
    }

    pub fn set_range(&mut self, base: u32, values: &[u32]) {
        for (reg, &value) in (base..).zip(values) {
            self.set(reg, value);
        }
    }

    /// Last value recorded for `reg`, pending or written.
    pub fn get(&self, reg: u32) -> Option<u32> {
        for w in self.windows.iter() {
            if let Some(i) = w.index(reg) {
                return if w.known.contains(i) {
                    Some(w.values[i])
                } else {
                    None
                };
            }
        }
        self.sparse.get(&reg).and_then(|slot| slot.value)
    }

    pub fn is_dirty(&self, reg: u32) -> bool {
        for w in self.windows.iter() {
            if let Some(i) = w.index(reg) {
                return w.dirty.contains(i);
            }
        }
        self.sparse.get(&reg).map_or(false, |slot| slot.dirty)
    }

    pub fn dirty_count(&self) -> usize {
        self.windows.iter().map(|w| w.dirty.len()).sum::<usize>()
            + self.sparse.values().filter(|slot| slot.dirty).count()
    }

    /// Returns every pending write sorted by register and marks them written.
    pub fn take_dirty(&mut self) -> Vec<(u32, u32)> {
        let mut out = Vec::with_capacity(self.dirty_count());
        for w in self.windows.iter_mut() {
            for i in w.dirty.iter() {
                w.hw[i] = w.values[i];
                w.hw_known.insert(i);
                out.push((w.base + i as u32, w.values[i]));
            }
            w.dirty.clear();
        }
        let sparse_start = out.len();
        for (&reg, slot) in self.sparse.iter_mut() {
            if slot.dirty {
                slot.dirty = false;
                slot.hw = slot.value;
                if let Some(value) = slot.value {
                    out.push((reg, value));
                }
            }
        }
        if out.len() > sparse_start {
            out.sort_unstable_by_key(|&(reg, _)| reg);
        }
        out
    }

    /// Notes that the stream wrote `value` to `reg` outside of this shadow,
    /// so later equal writes are suppressed.
    pub fn mark_written(&mut self, reg: u32, value: u32) {
        if let Some((w, i)) = self.locate(reg) {
            w.values[i] = value;
            w.hw[i] = value;
            w.known.insert(i);
            w.hw_known.insert(i);
            w.dirty.remove(i);
        } else {
            self.sparse.insert(
                reg,
                Slot {
                    value: Some(value),
                    hw: Some(value),
                    dirty: false,
                },
            );
        }
    }

    /// Forgets `reg` after the command processor wrote it behind our back.
    pub fn forget(&mut self, reg: u32) {
        if let Some((w, i)) = self.locate(reg) {
            w.known.remove(i);
            w.hw_known.remove(i);
            w.dirty.remove(i);
        } else {
            self.sparse.remove(&reg);
        }
    }

    /// Forgets everything: the hardware state is unknown again.
    pub fn clear(&mut self) {
        for w in self.windows.iter_mut() {
            w.clear();
        }
        self.sparse.clear();
    }

    /// Emits every pending write as coalesced `SET_*_REG` packets.
    /// Returns the number of registers written.
    pub fn flush<S: CmdSink>(&mut self, sink: &mut S) -> Result<usize, CommandError> {
        let dirty = self.take_dirty();
        if !dirty.is_empty() {
            log::trace!("flushing {} shadowed registers", dirty.len());
            encode::set_regs_coalesced(sink, &dirty)?;
        }
        Ok(dirty.len())
    }
}
