/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Scratch, GS and tessellation-factor rings of a queue.

use std::time::Duration;

use arrayvec::ArrayVec;
use parking_lot::Mutex;

use crate::{
    conv,
    hw::{self, HwTable},
    regs, DeviceError, GpuAllocation, Kernel, SubmissionHandle,
};

/// Number of descriptors in the ring table: scratch, ES/GS, GS/VS, TF.
pub const RING_TABLE_ENTRIES: usize = 4;
pub const RING_TABLE_DWORDS: usize = RING_TABLE_ENTRIES * 4;

const RING_ALIGNMENT: u64 = 64 * 1024;
const HS_OFFCHIP_PARAM: u32 = 0x1FF;

#[derive(Debug, Default)]
struct RequestInner {
    current: pt::RingSizes,
    pending: Option<pt::RingSizes>,
}

/// Ring requirements shared between a queue and the command buffers
/// recorded for it.
///
/// Command buffers only ever raise the pending request; the queue consumes
/// it at the next submit.
#[derive(Debug, Default)]
pub struct RingRequest {
    inner: Mutex<RequestInner>,
}

impl RingRequest {
    pub fn new(current: pt::RingSizes) -> Self {
        Self {
            inner: Mutex::new(RequestInner {
                current,
                pending: None,
            }),
        }
    }

    /// Notes that a pipeline needs `required`. Returns `true` if this raised
    /// the pending resize.
    pub fn probe(&self, required: pt::RingSizes) -> bool {
        let mut inner = self.inner.lock();
        let target = inner.pending.unwrap_or(inner.current);
        if !required.exceeds(&target) {
            return false;
        }
        let pending = target.max(required);
        log::debug!("ring resize requested: {:?} -> {:?}", inner.current, pending);
        inner.pending = Some(pending);
        true
    }

    pub fn current(&self) -> pt::RingSizes {
        self.inner.lock().current
    }

    pub fn pending(&self) -> Option<pt::RingSizes> {
        self.inner.lock().pending
    }

    pub(crate) fn take_pending(&self) -> Option<pt::RingSizes> {
        self.inner.lock().pending.take()
    }

    /// Puts back a request whose resize could not be applied.
    pub(crate) fn restore_pending(&self, sizes: pt::RingSizes) {
        let mut inner = self.inner.lock();
        let merged = inner.pending.map_or(sizes, |p| p.max(sizes));
        inner.pending = Some(merged);
    }

    pub(crate) fn set_current(&self, sizes: pt::RingSizes) {
        self.inner.lock().current = sizes;
    }
}

fn grown(current: u64, required: u64) -> u64 {
    if required > current {
        required.max(current.saturating_mul(2))
    } else {
        current
    }
}

/// The ring allocations of one queue.
#[derive(Debug)]
pub struct RingSet {
    sizes: pt::RingSizes,
    max_scratch_waves: u32,
    scratch: Option<GpuAllocation>,
    gs: Option<GpuAllocation>,
    tf: Option<GpuAllocation>,
    retired: Vec<(GpuAllocation, Option<SubmissionHandle>)>,
}

impl RingSet {
    pub fn new(max_scratch_waves: u32) -> Self {
        Self {
            sizes: pt::RingSizes::default(),
            max_scratch_waves,
            scratch: None,
            gs: None,
            tf: None,
            retired: Vec::new(),
        }
    }

    pub fn sizes(&self) -> pt::RingSizes {
        self.sizes
    }

    /// Sizes a resize to `required` would produce: each ring that is too
    /// small grows to at least twice its current size.
    pub fn target_sizes(&self, required: pt::RingSizes) -> pt::RingSizes {
        pt::RingSizes {
            scratch_bytes_per_wave: grown(
                u64::from(self.sizes.scratch_bytes_per_wave),
                u64::from(required.scratch_bytes_per_wave),
            )
            .min(u64::from(u32::MAX)) as u32,
            gs_ring_bytes: grown(self.sizes.gs_ring_bytes, required.gs_ring_bytes),
            tf_ring_bytes: grown(self.sizes.tf_ring_bytes, required.tf_ring_bytes),
        }
    }

    fn scratch_bytes(&self, sizes: &pt::RingSizes) -> u64 {
        u64::from(sizes.scratch_bytes_per_wave) * u64::from(self.max_scratch_waves)
    }

    /// Reallocates every ring that changes size to match `sizes`.
    ///
    /// New rings are allocated before anything is released, so a failure
    /// leaves the set untouched. Old rings are freed once `last_use` retires.
    pub fn resize(
        &mut self,
        kernel: &dyn Kernel,
        sizes: pt::RingSizes,
        last_use: Option<SubmissionHandle>,
    ) -> Result<(), DeviceError> {
        profiling::scope!("RingSet::resize");
        let old = self.sizes;
        let wanted = [
            (self.scratch_bytes(&old), self.scratch_bytes(&sizes)),
            (old.gs_ring_bytes, sizes.gs_ring_bytes),
            (old.tf_ring_bytes, sizes.tf_ring_bytes),
        ];

        let mut fresh: ArrayVec<Option<Option<GpuAllocation>>, 3> = ArrayVec::new();
        for &(before, after) in wanted.iter() {
            if before == after {
                fresh.push(None);
                continue;
            }
            if after == 0 {
                fresh.push(Some(None));
                continue;
            }
            match kernel.allocate(after, RING_ALIGNMENT) {
                Ok(allocation) => fresh.push(Some(Some(allocation))),
                Err(err) => {
                    for allocation in fresh.into_iter().flatten().flatten() {
                        kernel.free(allocation);
                    }
                    log::warn!("ring resize to {:?} failed: {}", sizes, err);
                    return Err(err);
                }
            }
        }

        let mut slots = [&mut self.scratch, &mut self.gs, &mut self.tf];
        for (slot, replacement) in slots.iter_mut().zip(fresh) {
            if let Some(replacement) = replacement {
                if let Some(old) = std::mem::replace(&mut **slot, replacement) {
                    self.retired.push((old, last_use));
                }
            }
        }
        self.sizes = sizes;
        log::debug!("rings resized from {:?} to {:?}", old, sizes);
        self.reclaim(kernel);
        Ok(())
    }

    /// Frees retired rings whose last use has completed.
    pub fn reclaim(&mut self, kernel: &dyn Kernel) {
        self.retired.retain(|&(allocation, last_use)| {
            let idle = match last_use {
                None => true,
                Some(handle) => kernel
                    .wait(handle, Some(Duration::from_secs(0)))
                    .unwrap_or(false),
            };
            if idle {
                kernel.free(allocation);
            }
            !idle
        });
    }

    /// Releases every ring. The caller guarantees the queue is idle.
    pub fn release_all(&mut self, kernel: &dyn Kernel) {
        for (allocation, _) in self.retired.drain(..) {
            kernel.free(allocation);
        }
        for slot in [&mut self.scratch, &mut self.gs, &mut self.tf].iter_mut() {
            if let Some(allocation) = slot.take() {
                kernel.free(allocation);
            }
        }
        self.sizes = pt::RingSizes::default();
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    fn address(slot: &Option<GpuAllocation>) -> (pt::GpuAddress, u64) {
        slot.map_or((0, 0), |a| (a.gpu_addr, a.size))
    }

    /// Resource descriptors shaders use to reach the rings.
    pub fn table_words(&self) -> [u32; RING_TABLE_DWORDS] {
        let (scratch, scratch_size) = Self::address(&self.scratch);
        let (gs, gs_size) = Self::address(&self.gs);
        let (tf, tf_size) = Self::address(&self.tf);
        let half = gs_size / 2;
        let entries = [
            hw::buffer_srd(scratch, scratch_size, 0),
            hw::buffer_srd(gs, half, 0),
            hw::buffer_srd(gs + half, half, 0),
            hw::buffer_srd(tf, tf_size, 0),
        ];
        let mut words = [0; RING_TABLE_DWORDS];
        for (out, entry) in words.chunks_mut(4).zip(entries.iter()) {
            out.copy_from_slice(entry);
        }
        words
    }

    pub fn tmpring_size(&self) -> u32 {
        conv::tmpring_size(self.max_scratch_waves, self.sizes.scratch_bytes_per_wave)
    }

    /// User-config and SH registers describing the rings. They persist
    /// across submissions, so they are only written when the rings change.
    pub fn persistent_regs(&self, hw: &HwTable) -> ArrayVec<(u32, u32), 8> {
        let (_, gs_size) = Self::address(&self.gs);
        let (tf, tf_size) = Self::address(&self.tf);
        let mut out = ArrayVec::new();
        out.push((regs::COMPUTE_TMPRING_SIZE, self.tmpring_size()));
        out.push((regs::VGT_ESGS_RING_SIZE, ((gs_size / 2) >> 8) as u32));
        out.push((regs::VGT_GSVS_RING_SIZE, ((gs_size / 2) >> 8) as u32));
        out.push((regs::VGT_TF_RING_SIZE, (tf_size >> 2).min(0xFFFF) as u32));
        out.push((
            regs::VGT_HS_OFFCHIP_PARAM,
            if tf_size != 0 { HS_OFFCHIP_PARAM } else { 0 },
        ));
        out.push((regs::VGT_TF_MEMORY_BASE, (tf >> 8) as u32));
        out.push((hw.tf_memory_base_hi, (tf >> 40) as u32 & 0xFF));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftKernel;

    fn sizes(scratch: u32, gs: u64, tf: u64) -> pt::RingSizes {
        pt::RingSizes {
            scratch_bytes_per_wave: scratch,
            gs_ring_bytes: gs,
            tf_ring_bytes: tf,
        }
    }

    #[test]
    fn probe_accumulates_requirements() {
        let request = RingRequest::new(sizes(1024, 0, 0));
        assert!(!request.probe(sizes(512, 0, 0)));
        assert!(request.probe(sizes(4096, 0, 0)));
        assert!(request.probe(sizes(0, 0, 8192)));
        assert!(!request.probe(sizes(2048, 0, 0)));
        assert_eq!(request.pending(), Some(sizes(4096, 0, 8192)));
        assert_eq!(request.take_pending(), Some(sizes(4096, 0, 8192)));
        assert_eq!(request.pending(), None);
    }

    #[test]
    fn growth_at_least_doubles() {
        let kernel = SoftKernel::new();
        let mut rings = RingSet::new(256);
        rings.resize(&kernel, sizes(1024, 0, 0), None).unwrap();
        assert_eq!(rings.target_sizes(sizes(1500, 0, 0)), sizes(2048, 0, 0));
        assert_eq!(rings.target_sizes(sizes(8192, 0, 0)), sizes(8192, 0, 0));
        assert_eq!(rings.target_sizes(sizes(0, 0, 0)), sizes(1024, 0, 0));
    }

    fn submit_something(kernel: &SoftKernel) -> SubmissionHandle {
        use crate::{stream::Chunk, IbRef, Submission};

        let mut chunk = Chunk::new(kernel.allocate(4096, 4096).unwrap());
        chunk.suballocate(8, 1).unwrap();
        let allocation = chunk.allocation();
        let chunks = [chunk];
        let handle = kernel
            .submit(&Submission {
                engine: pt::EngineType::Universal,
                ibs: &[IbRef { chunks: &chunks }],
                wait: &[],
            })
            .unwrap();
        kernel.free(allocation);
        handle
    }

    #[test]
    fn old_rings_wait_for_their_last_use() {
        let kernel = SoftKernel::with_manual_retire();
        let mut rings = RingSet::new(256);
        rings.resize(&kernel, sizes(1024, 0, 0), None).unwrap();
        assert_eq!(kernel.live_allocations(), 1);

        let busy = submit_something(&kernel);
        rings.resize(&kernel, sizes(2048, 0, 4096), Some(busy)).unwrap();
        assert_eq!(rings.retired_count(), 1);
        assert_eq!(kernel.live_allocations(), 3);
        assert_eq!(rings.sizes(), sizes(2048, 0, 4096));

        kernel.retire(busy);
        rings.reclaim(&kernel);
        assert_eq!(rings.retired_count(), 0);
        assert_eq!(kernel.live_allocations(), 2);

        kernel.fail_allocations_after(0);
        assert_eq!(
            rings.resize(&kernel, sizes(4096, 8192, 4096), None),
            Err(DeviceError::OutOfMemory)
        );
        assert_eq!(rings.sizes(), sizes(2048, 0, 4096));

        rings.release_all(&kernel);
        assert_eq!(kernel.live_allocations(), 0);
    }

    #[test]
    fn persistent_registers_describe_the_rings() {
        let kernel = SoftKernel::new();
        let mut rings = RingSet::new(256);
        rings.resize(&kernel, sizes(1024, 0, 4096), None).unwrap();
        let written = rings.persistent_regs(&hw::GFX10);
        assert!(written.contains(&(regs::COMPUTE_TMPRING_SIZE, 256 | (1 << 12))));
        assert!(written.contains(&(regs::VGT_TF_RING_SIZE, 1024)));
        let table = rings.table_words();
        assert_ne!(table[0], 0);
        assert_eq!(table[4], 0);
    }
}
