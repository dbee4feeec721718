/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Queues: preambles, postambles, ring resizing and ganged submission.
//!
//! A graphics submission is laid out as
//! `[prefix] preamble cb_0 .. cb_n postamble`, where the prefix carries a
//! pending ring resize and the head of the gang handshake. Command buffers
//! with a parallel compute stream add a second submission to the compute
//! engine, bracketed by the `GfxSetValue` and `AceSetValue` tokens.

use std::{ptr, sync::Arc, time::Duration};

use arrayvec::ArrayVec;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    command::{CommandBuffer, GANG_SLOT_DWORDS},
    encode::{self, CompareFunc, ReleaseData, ReleaseMem, WaitEngine},
    hw::{CoherFlags, HwTable},
    packet::CmdSink,
    regs::{self, event, user_data, RegSpace},
    ring::{RingRequest, RingSet, RING_TABLE_DWORDS},
    stream::CmdStream,
    ChunkAllocator, CommandError, DeviceError, GpuAllocation, IbRef, Kernel, QueueError,
    Submission, SubmissionHandle,
};

/// Token the graphics stream releases once the compute stream may start.
pub const GFX_SET_VALUE: u64 = 1;
/// Token the compute stream releases when it is done.
pub const ACE_SET_VALUE: u64 = 2;

const TIMELINE_OFFSET: u64 = 0;
const GFX_SEM_OFFSET: u64 = 8;
const ACE_SEM_OFFSET: u64 = 16;
const RING_TABLE_OFFSET: u64 = 64;
const QUEUE_MEMORY_BYTES: u64 = 256;

/// Caches every submission starts with, so host writes are visible.
fn entry_invalidate() -> CoherFlags {
    CoherFlags::I_CACHE_INV | CoherFlags::K_CACHE_INV | CoherFlags::V_CACHE_INV
}

/// A completion object signalled by a submission.
///
/// It can be waited on by a later submission on any queue, or on the host
/// through [`crate::Device::wait_fence`].
#[derive(Debug, Default)]
pub struct Fence {
    handles: Mutex<SmallVec<[SubmissionHandle; 2]>>,
}

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel handles of the last submission that signalled this fence.
    pub fn handles(&self) -> SmallVec<[SubmissionHandle; 2]> {
        self.handles.lock().clone()
    }

    pub fn is_pending(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    fn signal(&self, handles: &[SubmissionHandle]) {
        let mut guard = self.handles.lock();
        guard.clear();
        guard.extend(handles.iter().copied());
    }
}

fn stream_error(err: CommandError) -> QueueError {
    match err {
        CommandError::Device(err) => QueueError::Device(err),
        CommandError::InvalidArgument(what) => QueueError::InvalidArgument(what),
        CommandError::PoisonedCommandBuffer => QueueError::Device(DeviceError::OutOfMemory),
    }
}

#[derive(Debug)]
struct QueueInner {
    rings: RingSet,
    /// The ring registers do not describe `rings` yet.
    rings_stale: bool,
    preamble: CmdStream,
    /// Value the last postamble released to the timeline.
    timeline: u64,
    /// Last submission on the queue's own engine.
    last: Option<SubmissionHandle>,
    /// Last ganged submission on the compute engine.
    last_gang: Option<SubmissionHandle>,
}

impl QueueInner {
    fn last_handles(&self) -> ArrayVec<SubmissionHandle, 2> {
        self.last.iter().chain(self.last_gang.iter()).copied().collect()
    }
}

/// The transient streams of one submission.
struct Framing {
    prefix: CmdStream,
    postamble: CmdStream,
    ace_prefix: Option<CmdStream>,
    ace_suffix: Option<CmdStream>,
}

impl Framing {
    fn release(&mut self, fences: &[SubmissionHandle]) {
        self.prefix.reset(fences);
        self.postamble.reset(fences);
        for stream in self.ace_prefix.iter_mut().chain(self.ace_suffix.iter_mut()) {
            stream.reset(fences);
        }
    }
}

pub struct Queue {
    id: u64,
    engine: pt::EngineType,
    hw: &'static HwTable,
    settings: pt::Settings,
    kernel: Arc<dyn Kernel>,
    allocator: Arc<dyn ChunkAllocator>,
    ring_request: Arc<RingRequest>,
    memory: GpuAllocation,
    inner: Mutex<QueueInner>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .finish()
    }
}

impl Queue {
    pub(crate) fn new(
        id: u64,
        engine: pt::EngineType,
        hw: &'static HwTable,
        settings: &pt::Settings,
        kernel: Arc<dyn Kernel>,
        allocator: Arc<dyn ChunkAllocator>,
    ) -> Result<Self, DeviceError> {
        let memory = kernel.allocate(QUEUE_MEMORY_BYTES, 256)?;
        let mut rings = RingSet::new(settings.max_scratch_waves);
        if let Err(err) = rings.resize(&*kernel, settings.initial_rings, None) {
            kernel.free(memory);
            return Err(err);
        }
        let preamble = CmdStream::new(engine, allocator.clone(), settings, hw)
            .with_chunk_dwords(pt::Settings::MIN_CHUNK_DWORDS);
        let queue = Self {
            id,
            engine,
            hw,
            settings: settings.clone(),
            ring_request: Arc::new(RingRequest::new(rings.sizes())),
            kernel,
            allocator,
            memory,
            inner: Mutex::new(QueueInner {
                rings,
                rings_stale: true,
                preamble,
                timeline: 0,
                last: None,
                last_gang: None,
            }),
        };
        queue.initialize()?;
        log::debug!("created {:?} queue {}", engine, id);
        Ok(queue)
    }

    /// Writes the ring state and the steady preamble once, at creation.
    fn initialize(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        let mut init = self.transient_stream(self.engine);
        let built = self
            .record_ring_state(&mut init, &inner.rings, None)
            .and_then(|()| self.record_preamble(&mut inner))
            .and_then(|()| init.end());
        if let Err(err) = built {
            init.reset(&[]);
            return Err(match err {
                CommandError::Device(err) => err,
                _ => DeviceError::OutOfMemory,
            });
        }
        let handle = match init.ib() {
            Some(ib) => self.kernel.submit(&Submission {
                engine: self.engine,
                ibs: &[ib],
                wait: &[],
            }),
            None => Err(DeviceError::OutOfMemory),
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("queue {} failed to submit its initialization: {}", self.id, err);
                init.reset(&[]);
                return Err(err);
            }
        };
        init.reset(&[handle]);
        inner.last = Some(handle);
        inner.rings_stale = false;
        Ok(())
    }

    pub fn engine(&self) -> pt::EngineType {
        self.engine
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn ring_request(&self) -> &Arc<RingRequest> {
        &self.ring_request
    }

    pub fn ring_sizes(&self) -> pt::RingSizes {
        self.inner.lock().rings.sizes()
    }

    /// Ring sizes requested by recorded pipelines but not applied yet.
    pub fn pending_ring_sizes(&self) -> Option<pt::RingSizes> {
        self.ring_request.pending()
    }

    fn transient_stream(&self, engine: pt::EngineType) -> CmdStream {
        CmdStream::new(engine, self.allocator.clone(), &self.settings, self.hw)
            .with_chunk_dwords(pt::Settings::MIN_CHUNK_DWORDS)
    }

    fn ring_table_address(&self) -> pt::GpuAddress {
        self.memory.gpu_addr + RING_TABLE_OFFSET
    }

    /// Ring-table pointer writes for every bank of `engine`.
    fn record_ring_pointers<S: CmdSink>(
        &self,
        sink: &mut S,
        engine: pt::EngineType,
    ) -> Result<(), CommandError> {
        let table = self.ring_table_address();
        let pointer = [table as u32, (table >> 32) as u32];
        let banks = match engine {
            pt::EngineType::Universal => self.hw.all_banks(),
            pt::EngineType::Compute => {
                let mut banks = ArrayVec::new();
                banks.push(self.hw.user_data.cs);
                banks
            }
        };
        for &bank in banks.iter() {
            encode::set_sh_regs(sink, bank + user_data::RING_TABLE, &pointer)?;
        }
        Ok(())
    }

    /// Registers describing `rings` that persist on `engine`.
    fn ring_registers(&self, rings: &RingSet, engine: pt::EngineType) -> ArrayVec<(u32, u32), 8> {
        let mut out = rings.persistent_regs(self.hw);
        if engine == pt::EngineType::Compute {
            out.retain(|&mut (reg, _)| RegSpace::of(reg) == Some(RegSpace::Sh));
        }
        out
    }

    /// Wait-for-idle (when `idle_after` is set), ring descriptor rewrite,
    /// ring registers and ring-table pointers.
    fn record_ring_state(
        &self,
        stream: &mut CmdStream,
        rings: &RingSet,
        idle_after: Option<u64>,
    ) -> Result<(), CommandError> {
        if let Some(value) = idle_after {
            encode::wait_reg_mem64(
                stream,
                CompareFunc::GreaterEqual,
                self.memory.gpu_addr + TIMELINE_OFFSET,
                value,
                !0,
                WaitEngine::Me,
            )?;
            encode::event_write(stream, event::CS_PARTIAL_FLUSH, event::INDEX_PARTIAL_FLUSH)?;
            if self.engine == pt::EngineType::Universal {
                encode::event_write(stream, event::PS_PARTIAL_FLUSH, event::INDEX_PARTIAL_FLUSH)?;
            }
        }
        let table: [u32; RING_TABLE_DWORDS] = rings.table_words();
        encode::write_data(stream, self.ring_table_address(), &table)?;
        encode::set_regs_coalesced(stream, &self.ring_registers(rings, self.engine))?;
        self.record_ring_pointers(stream, self.engine)
    }

    /// Rebuilds the steady preamble for the current rings.
    fn record_preamble(&self, inner: &mut QueueInner) -> Result<(), CommandError> {
        let fences = inner.last_handles();
        inner.preamble.reset(&fences);
        let stream = &mut inner.preamble;
        if self.engine == pt::EngineType::Universal {
            encode::context_control(stream)?;
            encode::clear_state(stream)?;
            encode::set_context_reg(stream, regs::SPI_TMPRING_SIZE, inner.rings.tmpring_size())?;
        }
        encode::acquire_mem(stream, self.hw, entry_invalidate(), 0, u64::MAX)?;
        stream.end()
    }

    /// Applies a pending ring resize. On failure the request stays pending.
    fn apply_ring_request(&self, inner: &mut QueueInner) -> Result<(), QueueError> {
        let required = match self.ring_request.take_pending() {
            Some(required) => required,
            None => return Ok(()),
        };
        if !required.exceeds(&inner.rings.sizes()) {
            return Ok(());
        }
        profiling::scope!("Queue::resize_rings");
        let target = inner.rings.target_sizes(required);
        // A ganged compute submission always retires before the postamble
        // of its graphics submission, so the queue's own handle covers both.
        let last = inner.last;
        if let Err(err) = inner.rings.resize(&*self.kernel, target, last) {
            self.ring_request.restore_pending(required);
            return Err(err.into());
        }
        self.ring_request.set_current(target);
        inner.rings_stale = true;
        log::debug!("queue {} rings grow to {:?}", self.id, target);
        Ok(())
    }

    fn build_framing(
        &self,
        inner: &mut QueueInner,
        command_buffers: &[&CommandBuffer],
        ganged: bool,
        next_timeline: u64,
    ) -> Result<Framing, CommandError> {
        let mut framing = Framing {
            prefix: self.transient_stream(self.engine),
            postamble: self.transient_stream(self.engine),
            ace_prefix: None,
            ace_suffix: None,
        };
        match self.record_framing(&mut framing, inner, command_buffers, ganged, next_timeline) {
            Ok(()) => Ok(framing),
            Err(err) => {
                framing.release(&[]);
                Err(err)
            }
        }
    }

    fn record_framing(
        &self,
        framing: &mut Framing,
        inner: &mut QueueInner,
        command_buffers: &[&CommandBuffer],
        ganged: bool,
        next_timeline: u64,
    ) -> Result<(), CommandError> {
        let base = self.memory.gpu_addr;
        if inner.rings_stale {
            let idle_after = if inner.timeline != 0 {
                Some(inner.timeline)
            } else {
                None
            };
            self.record_ring_state(&mut framing.prefix, &inner.rings, idle_after)?;
            self.record_preamble(inner)?;
        }

        if ganged {
            encode::release_mem(
                &mut framing.prefix,
                self.hw,
                &ReleaseMem::bottom_of_pipe(
                    ReleaseData::Value64(GFX_SET_VALUE),
                    base + GFX_SEM_OFFSET,
                ),
            )?;

            let mut ace_prefix = self.transient_stream(pt::EngineType::Compute);
            encode::wait_reg_mem64(
                &mut ace_prefix,
                CompareFunc::Equal,
                base + GFX_SEM_OFFSET,
                GFX_SET_VALUE,
                !0,
                WaitEngine::Me,
            )?;
            let sh_regs = self.ring_registers(&inner.rings, pt::EngineType::Compute);
            encode::set_regs_coalesced(&mut ace_prefix, &sh_regs)?;
            self.record_ring_pointers(&mut ace_prefix, pt::EngineType::Compute)?;
            encode::acquire_mem(&mut ace_prefix, self.hw, entry_invalidate(), 0, u64::MAX)?;
            ace_prefix.end()?;
            framing.ace_prefix = Some(ace_prefix);

            let mut ace_suffix = self.transient_stream(pt::EngineType::Compute);
            encode::release_mem(
                &mut ace_suffix,
                self.hw,
                &ReleaseMem {
                    event: event::CS_DONE,
                    event_index: event::INDEX_END_OF_PIPE,
                    cache: CoherFlags::L2_WB,
                    data: ReleaseData::Value64(ACE_SET_VALUE),
                    dst: base + ACE_SEM_OFFSET,
                },
            )?;
            ace_suffix.end()?;
            framing.ace_suffix = Some(ace_suffix);

            let post = &mut framing.postamble;
            encode::wait_reg_mem64(
                post,
                CompareFunc::Equal,
                base + ACE_SEM_OFFSET,
                ACE_SET_VALUE,
                !0,
                WaitEngine::Me,
            )?;
            // Re-arm the tokens and the in-buffer gang slots for the next run.
            encode::write_data(post, base + GFX_SEM_OFFSET, &[0; 4])?;
            for slots in command_buffers.iter().filter_map(|cb| cb.gang_slots()) {
                encode::write_data(post, slots, &[0; GANG_SLOT_DWORDS as usize])?;
            }
        }

        encode::release_mem(
            &mut framing.postamble,
            self.hw,
            &ReleaseMem {
                cache: CoherFlags::L2_WB,
                ..ReleaseMem::bottom_of_pipe(
                    ReleaseData::Value64(next_timeline),
                    base + TIMELINE_OFFSET,
                )
            },
        )?;
        framing.prefix.end()?;
        framing.postamble.end()
    }

    /// Submits `command_buffers` in order.
    ///
    /// The submission starts after every fence in `wait` and signals
    /// `signal` on completion. A failed submission leaves the command
    /// buffers untouched, so it can be retried.
    pub fn submit(
        &self,
        command_buffers: &[&CommandBuffer],
        wait: &[&Fence],
        signal: Option<&Fence>,
    ) -> Result<(), QueueError> {
        profiling::scope!("Queue::submit");
        for (i, cb) in command_buffers.iter().enumerate() {
            if cb.poison().is_some() {
                log::warn!("refusing to submit poisoned {:?}", cb.label());
                return Err(QueueError::PoisonedCommandBuffer);
            }
            if !cb.is_executable() {
                return Err(QueueError::InvalidArgument("command buffer has not ended"));
            }
            if cb.queue_id() != self.id {
                return Err(QueueError::InvalidArgument(
                    "command buffer was recorded for another queue",
                ));
            }
            // Its gang slots are only re-armed by the postamble.
            if cb.gang_slots().is_some()
                && command_buffers[..i].iter().any(|&other| ptr::eq(other, *cb))
            {
                return Err(QueueError::InvalidArgument(
                    "ganged command buffer submitted twice in one batch",
                ));
            }
        }
        let waits = wait
            .iter()
            .flat_map(|fence| fence.handles())
            .collect::<SmallVec<[SubmissionHandle; 4]>>();
        let ganged = command_buffers.iter().any(|cb| cb.ace_ib().is_some());

        let mut inner = self.inner.lock();
        inner.rings.reclaim(&*self.kernel);
        // Rings may have been trimmed since these were recorded.
        for cb in command_buffers {
            self.ring_request.probe(cb.required_rings());
        }
        self.apply_ring_request(&mut inner)?;

        let next_timeline = inner.timeline + 1;
        let resized = inner.rings_stale;
        let mut framing = self
            .build_framing(&mut inner, command_buffers, ganged, next_timeline)
            .map_err(stream_error)?;

        let mut ibs = Vec::with_capacity(command_buffers.len() + 3);
        ibs.extend(framing.prefix.ib());
        ibs.extend(inner.preamble.ib());
        ibs.extend(command_buffers.iter().filter_map(|cb| cb.main_ib()));
        ibs.extend(framing.postamble.ib());
        log::debug!(
            "queue {} submits {} command buffers in {} IBs{}",
            self.id,
            command_buffers.len(),
            ibs.len(),
            if resized { " with a ring resize" } else { "" }
        );

        let previous_gfx = inner.last;
        let submitted = self.kernel.submit(&Submission {
            engine: self.engine,
            ibs: &ibs,
            wait: &waits,
        });
        drop(ibs);
        let gfx = match submitted {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("queue {} submission failed: {}", self.id, err);
                framing.release(&[]);
                return Err(err.into());
            }
        };
        inner.last = Some(gfx);
        inner.timeline = next_timeline;
        inner.rings_stale = false;

        let mut handles = ArrayVec::<SubmissionHandle, 2>::new();
        handles.push(gfx);
        if ganged {
            let ace = self.submit_ace(&framing, command_buffers, &waits, previous_gfx);
            match ace {
                Ok(handle) => {
                    inner.last_gang = Some(handle);
                    handles.push(handle);
                }
                Err(err) => {
                    // The graphics submission is already waiting for it.
                    log::error!("queue {} lost its compute submission: {}", self.id, err);
                    framing.release(&handles);
                    return Err(QueueError::Device(DeviceError::Lost));
                }
            }
        }

        for cb in command_buffers {
            cb.note_submitted(gfx);
            if cb.ace_ib().is_some() {
                if let Some(&ace) = handles.get(1) {
                    cb.note_submitted(ace);
                }
            }
        }
        framing.release(&handles);
        if let Some(fence) = signal {
            fence.signal(&handles);
        }
        Ok(())
    }

    fn submit_ace(
        &self,
        framing: &Framing,
        command_buffers: &[&CommandBuffer],
        waits: &[SubmissionHandle],
        previous_gfx: Option<SubmissionHandle>,
    ) -> Result<SubmissionHandle, DeviceError> {
        let mut ibs: Vec<IbRef> = Vec::with_capacity(command_buffers.len() + 2);
        ibs.extend(framing.ace_prefix.as_ref().and_then(CmdStream::ib));
        ibs.extend(command_buffers.iter().filter_map(|cb| cb.ace_ib()));
        ibs.extend(framing.ace_suffix.as_ref().and_then(CmdStream::ib));
        let mut ace_waits = waits.iter().copied().collect::<SmallVec<[SubmissionHandle; 4]>>();
        ace_waits.extend(previous_gfx);
        log::debug!("queue {} gangs {} compute IBs", self.id, ibs.len());
        self.kernel.submit(&Submission {
            engine: pt::EngineType::Compute,
            ibs: &ibs,
            wait: &ace_waits,
        })
    }

    /// Waits for everything submitted so far.
    /// `timeout_ms` of `None` waits forever.
    pub fn wait_idle(&self, timeout_ms: Option<u32>) -> Result<(), QueueError> {
        let handles = self.inner.lock().last_handles();
        let timeout = timeout_ms.map(|ms| Duration::from_millis(u64::from(ms)));
        for handle in handles {
            if !self.kernel.wait(handle, timeout)? {
                log::debug!("queue {} wait for {:?} timed out", self.id, handle);
                return Err(QueueError::Timeout);
            }
        }
        Ok(())
    }

    /// Releases the rings if the queue is idle. Returns whether it did;
    /// the next submit that needs rings grows them again.
    pub fn trim(&self) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        for handle in inner.last_handles() {
            if !self.kernel.wait(handle, Some(Duration::from_secs(0)))? {
                return Ok(false);
            }
        }
        inner.rings.release_all(&*self.kernel);
        self.ring_request.set_current(inner.rings.sizes());
        inner.rings_stale = true;
        log::debug!("queue {} trimmed its rings", self.id);
        Ok(true)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle(None) {
            log::warn!("queue {} dropped while busy: {}", self.id, err);
        }
        let inner = self.inner.get_mut();
        let fences = inner.last_handles();
        inner.preamble.reset(&fences);
        inner.rings.release_all(&*self.kernel);
        self.kernel.free(self.memory);
    }
}
