/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Command buffers: the client recording surface.
//!
//! Record calls update CPU-side state; draws and dispatches run the
//! validator, which turns the accumulated state into a minimal packet
//! delta in front of the work packet. Async compute dispatches recorded
//! into a graphics command buffer land in a second, parallel stream.

mod embedded;
mod state;
mod sync;
mod validate;

use std::{ops::Range, sync::Arc};

use parking_lot::Mutex;
use smallvec::SmallVec;

use self::{
    embedded::EmbeddedData,
    state::{splice, ComputeState, DirtyState, GraphicsState, IndexBinding, SpillTable},
    sync::{GangSync, PendingSync, WriteTracker},
};
use crate::{
    conv,
    encode::{self, CopySource, DmaSource, ReleaseData, ReleaseMem},
    hw::HwTable,
    pipeline::Pipeline,
    regs::{event, user_data, RegSpace},
    ring::RingRequest,
    shadow::RegisterShadow,
    stream::CmdStream,
    ChunkAllocator, CommandError, IbRef, SubmissionHandle,
};

pub(crate) use self::sync::GANG_SLOT_DWORDS;

/// Size of the argument record of `DRAW_INDIRECT_MULTI`.
const DRAW_ARGS_BYTES: u32 = 16;
/// Size of the argument record of `DRAW_INDEX_INDIRECT_MULTI`.
const DRAW_INDEXED_ARGS_BYTES: u32 = 20;
const DISPATCH_ARGS_BYTES: u64 = 12;

#[derive(Clone, Debug, PartialEq)]
enum CbState {
    Initial,
    Building,
    Poisoned(CommandError),
    Executable,
}

/// Packet and memory counters of a finished command buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandBufferStats {
    pub packets: u64,
    pub dwords: u64,
    pub chunks: usize,
    pub ace_packets: u64,
    pub ace_dwords: u64,
    pub ace_chunks: usize,
    pub embedded_dwords: u64,
    pub draws: u64,
    pub dispatches: u64,
    /// Draws and dispatches with a zero count.
    pub skipped: u64,
    /// Record calls dropped after the command buffer was poisoned.
    pub dropped_calls: u64,
}

/// One command stream and the SH register state it leaves behind.
#[derive(Debug)]
struct Lane {
    stream: CmdStream,
    sh: RegisterShadow,
    graphics_blob: Option<u64>,
    compute_blob: Option<u64>,
    compute_spill: Option<SpillTable>,
    indirect_base: Option<pt::GpuAddress>,
}

impl Lane {
    fn new(stream: CmdStream) -> Self {
        Self {
            stream,
            sh: RegisterShadow::sh(),
            graphics_blob: None,
            compute_blob: None,
            compute_spill: None,
            indirect_base: None,
        }
    }

    fn reset(&mut self, fences: &[SubmissionHandle]) {
        self.stream.reset(fences);
        self.sh.clear();
        self.graphics_blob = None;
        self.compute_blob = None;
        self.compute_spill = None;
        self.indirect_base = None;
    }
}

#[derive(Debug, Default)]
struct Counters {
    draws: u64,
    dispatches: u64,
    skipped: u64,
    dropped_calls: u64,
}

pub struct CommandBuffer {
    label: Option<String>,
    engine: pt::EngineType,
    queue_id: u64,
    hw: &'static HwTable,
    settings: pt::Settings,
    allocator: Arc<dyn ChunkAllocator>,
    rings: Arc<RingRequest>,
    /// Largest rings any pipeline bound so far needs.
    required_rings: pt::RingSizes,
    state: CbState,
    main: Lane,
    /// Context registers only exist on the graphics engine.
    context: RegisterShadow,
    ace: Option<Lane>,
    embedded: EmbeddedData,
    graphics: GraphicsState,
    compute: ComputeState,
    sync: PendingSync,
    writes: WriteTracker,
    gang: GangSync,
    counters: Counters,
    stats: Option<CommandBufferStats>,
    /// Latest submission per engine that references our chunks.
    last_use: Mutex<[Option<SubmissionHandle>; 2]>,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("label", &self.label)
            .field("engine", &self.engine)
            .field("state", &self.state)
            .finish()
    }
}

impl CommandBuffer {
    pub(crate) fn new(
        label: crate::Label,
        engine: pt::EngineType,
        queue_id: u64,
        hw: &'static HwTable,
        settings: &pt::Settings,
        allocator: Arc<dyn ChunkAllocator>,
        rings: Arc<RingRequest>,
    ) -> Self {
        let stream = CmdStream::new(engine, allocator.clone(), settings, hw);
        Self {
            label: label.map(str::to_string),
            engine,
            queue_id,
            hw,
            settings: settings.clone(),
            embedded: EmbeddedData::new(allocator.clone(), settings.embedded_chunk_dwords),
            allocator,
            rings,
            required_rings: pt::RingSizes::default(),
            state: CbState::Initial,
            main: Lane::new(stream),
            context: RegisterShadow::context(),
            ace: None,
            graphics: GraphicsState::default(),
            compute: ComputeState::default(),
            sync: PendingSync::default(),
            writes: WriteTracker::default(),
            gang: GangSync::default(),
            counters: Counters::default(),
            stats: None,
            last_use: Mutex::new([None; 2]),
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn engine(&self) -> pt::EngineType {
        self.engine
    }

    pub fn is_recording(&self) -> bool {
        self.state == CbState::Building
    }

    pub fn is_executable(&self) -> bool {
        self.state == CbState::Executable
    }

    /// The error that poisoned recording, if any.
    pub fn poison(&self) -> Option<&CommandError> {
        match self.state {
            CbState::Poisoned(ref err) => Some(err),
            _ => None,
        }
    }

    /// Counters captured by the last successful [`Self::end`].
    pub fn stats(&self) -> Option<&CommandBufferStats> {
        self.stats.as_ref()
    }

    /// The graphics (or, on a compute queue, the only) stream.
    pub fn stream(&self) -> &CmdStream {
        &self.main.stream
    }

    /// The parallel compute stream, if async compute work was recorded.
    pub fn ace_stream(&self) -> Option<&CmdStream> {
        self.ace.as_ref().map(|lane| &lane.stream)
    }

    pub(crate) fn queue_id(&self) -> u64 {
        self.queue_id
    }

    pub(crate) fn main_ib(&self) -> Option<IbRef<'_>> {
        self.main.stream.ib()
    }

    pub(crate) fn ace_ib(&self) -> Option<IbRef<'_>> {
        self.ace.as_ref().and_then(|lane| lane.stream.ib())
    }

    /// Embedded slots the graphics and compute streams synchronise through.
    pub(crate) fn gang_slots(&self) -> Option<pt::GpuAddress> {
        self.gang.slots()
    }

    /// Rings every pipeline recorded into this command buffer needs.
    pub(crate) fn required_rings(&self) -> pt::RingSizes {
        self.required_rings
    }

    /// Raises the rings this command buffer needs and the queue's pending
    /// request with them.
    pub(super) fn require_rings(&mut self, sizes: pt::RingSizes) {
        self.required_rings = self.required_rings.max(sizes);
        self.rings.probe(sizes);
    }

    pub(crate) fn note_submitted(&self, handle: SubmissionHandle) {
        self.last_use.lock()[handle.engine as usize] = Some(handle);
    }

    fn fences(&self) -> SmallVec<[SubmissionHandle; 2]> {
        self.last_use.lock().iter().flatten().copied().collect()
    }

    pub fn begin(&mut self) -> Result<(), CommandError> {
        match self.state {
            CbState::Initial => {
                log::trace!("begin {:?}", self.label);
                self.state = CbState::Building;
                Ok(())
            }
            _ => {
                log::warn!("begin on {:?} without a reset", self.label);
                Err(CommandError::InvalidArgument(
                    "command buffer must be reset before begin",
                ))
            }
        }
    }

    /// Seals every stream. Reports the error that poisoned recording.
    pub fn end(&mut self) -> Result<(), CommandError> {
        profiling::scope!("CommandBuffer::end");
        match self.state {
            CbState::Building => {}
            CbState::Poisoned(ref err) => {
                log::warn!(
                    "{:?} ended poisoned, {} calls were dropped",
                    self.label,
                    self.counters.dropped_calls
                );
                return Err(err.clone());
            }
            CbState::Initial | CbState::Executable => {
                return Err(CommandError::InvalidArgument("command buffer is not recording"))
            }
        }
        if let Err(err) = self.finish() {
            log::warn!("{:?} failed to end: {}", self.label, err);
            self.state = CbState::Poisoned(err.clone());
            return Err(err);
        }
        self.state = CbState::Executable;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CommandError> {
        self.sync.flush(&mut self.main.stream, self.hw)?;
        if let Some(ref mut ace) = self.ace {
            self.gang
                .join(&mut self.main.stream, &mut ace.stream, self.hw, &mut self.embedded)?;
            ace.stream.end()?;
        }
        self.main.stream.end()?;

        let (ace_packets, ace_dwords, ace_chunks) = self.ace.as_ref().map_or((0, 0, 0), |lane| {
            (
                lane.stream.packets(),
                lane.stream.dwords(),
                lane.stream.chunks().len(),
            )
        });
        let stats = CommandBufferStats {
            packets: self.main.stream.packets(),
            dwords: self.main.stream.dwords(),
            chunks: self.main.stream.chunks().len(),
            ace_packets,
            ace_dwords,
            ace_chunks,
            embedded_dwords: self.embedded.dwords(),
            draws: self.counters.draws,
            dispatches: self.counters.dispatches,
            skipped: self.counters.skipped,
            dropped_calls: self.counters.dropped_calls,
        };
        log::debug!("{:?} ended: {:?}", self.label, stats);
        self.stats = Some(stats);
        Ok(())
    }

    /// Releases every chunk, gated on the submissions that used them, and
    /// returns to the initial state.
    pub fn reset(&mut self) {
        let fences = self.fences();
        log::trace!("reset {:?} behind {:?}", self.label, fences);
        self.main.reset(&fences);
        if let Some(mut ace) = self.ace.take() {
            ace.reset(&fences);
        }
        self.embedded.reset(&fences);
        self.context.clear();
        self.graphics = GraphicsState::default();
        self.compute = ComputeState::default();
        self.sync = PendingSync::default();
        self.writes = WriteTracker::default();
        self.gang = GangSync::default();
        self.counters = Counters::default();
        self.required_rings = pt::RingSizes::default();
        self.stats = None;
        *self.last_use.lock() = [None; 2];
        self.state = CbState::Initial;
    }

    /// Runs one record call with the poisoning rules applied.
    fn record<F>(&mut self, what: &'static str, body: F) -> Result<(), CommandError>
    where
        F: FnOnce(&mut Self) -> Result<(), CommandError>,
    {
        match self.state {
            CbState::Building => {}
            CbState::Poisoned(_) => {
                log::trace!("dropping {} on poisoned {:?}", what, self.label);
                self.counters.dropped_calls += 1;
                return Ok(());
            }
            CbState::Initial | CbState::Executable => {
                log::warn!("{} on {:?} outside of recording", what, self.label);
                return Err(CommandError::InvalidArgument("command buffer is not recording"));
            }
        }
        body(self).map_err(|err| {
            log::warn!("{} poisoned {:?}: {}", what, self.label, err);
            self.state = CbState::Poisoned(err.clone());
            err
        })
    }

    fn require_graphics(&self) -> Result<(), CommandError> {
        match self.engine {
            pt::EngineType::Universal => Ok(()),
            pt::EngineType::Compute => Err(CommandError::InvalidArgument(
                "graphics work on a compute queue",
            )),
        }
    }

    pub fn bind_pipeline(&mut self, pipeline: &Arc<Pipeline>) -> Result<(), CommandError> {
        self.record("bind_pipeline", |cb| {
            match pipeline.bind_point() {
                pt::PipelineBindPoint::Graphics => {
                    cb.require_graphics()?;
                    if cb
                        .graphics
                        .pipeline
                        .as_ref()
                        .map_or(true, |bound| !Arc::ptr_eq(bound, pipeline))
                    {
                        cb.graphics.dirty |= DirtyState::TOPOLOGY;
                        cb.graphics.pipeline = Some(pipeline.clone());
                    }
                }
                pt::PipelineBindPoint::Compute => {
                    cb.compute.pipeline = Some(pipeline.clone());
                }
            }
            cb.require_rings(pipeline.rings());
            Ok(())
        })
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: pt::Buffer,
        offset: u64,
        format: pt::IndexFormat,
    ) -> Result<(), CommandError> {
        self.record("bind_index_buffer", |cb| {
            cb.require_graphics()?;
            if offset % format.byte_size() != 0 || offset > buffer.size {
                return Err(CommandError::InvalidArgument("misaligned index buffer offset"));
            }
            let binding = IndexBinding {
                buffer,
                offset,
                format,
            };
            if cb.graphics.index != Some(binding) {
                cb.graphics.index = Some(binding);
                cb.graphics.dirty |= DirtyState::INDEX_BUFFER;
            }
            Ok(())
        })
    }

    pub fn set_vertex_buffers(
        &mut self,
        first: u32,
        bindings: &[pt::VertexBufferBinding],
    ) -> Result<(), CommandError> {
        self.record("set_vertex_buffers", |cb| {
            cb.require_graphics()?;
            let start = first as usize;
            let end = start
                .checked_add(bindings.len())
                .filter(|&end| end <= pt::MAX_VERTEX_BUFFERS)
                .ok_or(CommandError::InvalidArgument("vertex buffer slot out of bounds"))?;
            for (slot, binding) in cb.graphics.vertex_buffers[start..end]
                .iter_mut()
                .zip(bindings)
            {
                if *slot != Some(*binding) {
                    *slot = Some(*binding);
                    cb.graphics.dirty |= DirtyState::VERTEX_BUFFERS;
                }
            }
            Ok(())
        })
    }

    /// Sets viewports from slot `first` on. `first` may not skip past the
    /// viewports already set.
    pub fn set_viewports(&mut self, first: u32, viewports: &[pt::Viewport]) -> Result<(), CommandError> {
        self.record("set_viewports", |cb| {
            cb.require_graphics()?;
            if viewports.iter().any(|vp| vp.width.is_nan() || vp.width <= 0.0) {
                return Err(CommandError::InvalidArgument("viewport width must be positive"));
            }
            splice(&mut cb.graphics.viewports, first, viewports)?;
            cb.graphics.dirty |= DirtyState::VIEWPORT;
            Ok(())
        })
    }

    pub fn set_viewport(&mut self, viewport: pt::Viewport) -> Result<(), CommandError> {
        self.set_viewports(0, &[viewport])
    }

    /// Sets scissors from slot `first` on. `first` may not skip past the
    /// scissors already set.
    pub fn set_scissors(&mut self, first: u32, rects: &[pt::Rect]) -> Result<(), CommandError> {
        self.record("set_scissors", |cb| {
            cb.require_graphics()?;
            splice(&mut cb.graphics.scissors, first, rects)?;
            cb.graphics.dirty |= DirtyState::SCISSOR;
            Ok(())
        })
    }

    pub fn set_scissor(&mut self, rect: pt::Rect) -> Result<(), CommandError> {
        self.set_scissors(0, &[rect])
    }

    pub fn set_user_data(
        &mut self,
        bind_point: pt::PipelineBindPoint,
        first: u32,
        values: &[u32],
    ) -> Result<(), CommandError> {
        self.record("set_user_data", |cb| match bind_point {
            pt::PipelineBindPoint::Graphics => cb.graphics.user_data.set(first, values),
            pt::PipelineBindPoint::Compute => cb.compute.user_data.set(first, values),
        })
    }

    pub fn set_blend_constants(&mut self, color: pt::Color) -> Result<(), CommandError> {
        self.record("set_blend_constants", |cb| {
            cb.require_graphics()?;
            cb.graphics.blend_constants = color;
            cb.graphics.dirty |= DirtyState::BLEND_CONSTANTS;
            Ok(())
        })
    }

    pub fn set_stencil_reference(&mut self, front: u8, back: u8) -> Result<(), CommandError> {
        self.record("set_stencil_reference", |cb| {
            cb.require_graphics()?;
            cb.graphics.stencil_reference = (front, back);
            cb.graphics.dirty |= DirtyState::STENCIL_REF;
            Ok(())
        })
    }

    pub fn set_depth_bounds(&mut self, min: f32, max: f32) -> Result<(), CommandError> {
        self.record("set_depth_bounds", |cb| {
            cb.require_graphics()?;
            if min.is_nan() || max.is_nan() || min > max {
                return Err(CommandError::InvalidArgument("depth bounds are inverted"));
            }
            cb.graphics.depth_bounds = (min, max);
            cb.graphics.dirty |= DirtyState::DEPTH_BOUNDS;
            Ok(())
        })
    }

    /// Overrides the topology of the bound graphics pipeline.
    /// `None` goes back to the pipeline's own topology.
    pub fn set_primitive_topology(
        &mut self,
        topology: Option<pt::PrimitiveTopology>,
    ) -> Result<(), CommandError> {
        self.record("set_primitive_topology", |cb| {
            cb.require_graphics()?;
            if let Some(pt::PrimitiveTopology::PatchList { control_points }) = topology {
                if control_points == 0 || control_points > 32 {
                    return Err(CommandError::InvalidArgument(
                        "patch lists take 1 to 32 control points",
                    ));
                }
            }
            cb.graphics.topology_override = topology;
            cb.graphics.dirty |= DirtyState::TOPOLOGY;
            Ok(())
        })
    }

    pub fn bind_targets(
        &mut self,
        color: &[pt::Image],
        depth: Option<&pt::Image>,
    ) -> Result<(), CommandError> {
        self.record("bind_targets", |cb| {
            cb.require_graphics()?;
            if color.len() > pt::MAX_COLOR_TARGETS {
                return Err(CommandError::InvalidArgument("too many colour targets"));
            }
            if color.iter().any(|image| image.format.is_depth()) {
                return Err(CommandError::InvalidArgument("colour target has a depth format"));
            }
            if let Some(image) = depth {
                if !image.format.is_depth() {
                    return Err(CommandError::InvalidArgument(
                        "depth target has a colour format",
                    ));
                }
            }
            let graphics = &mut cb.graphics;
            graphics.stale_color_targets = graphics.stale_color_targets.max(graphics.color_targets.len());
            graphics.color_targets.clear();
            graphics.color_targets.extend(color.iter().copied());
            graphics.depth_target = depth.copied();
            graphics.dirty |= DirtyState::TARGETS;
            Ok(())
        })
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), CommandError> {
        self.record("draw", |cb| {
            cb.require_graphics()?;
            if vertex_count == 0 || instance_count == 0 {
                return cb.skip_work();
            }
            cb.validate_draw(Some((first_vertex, first_instance)), false)?;
            cb.set_instance_count(instance_count)?;
            encode::draw_index_auto(&mut cb.main.stream, vertex_count)?;
            cb.counters.draws += 1;
            cb.gang.main_work = true;
            Ok(())
        })
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> Result<(), CommandError> {
        self.record("draw_indexed", |cb| {
            cb.require_graphics()?;
            let index = cb
                .graphics
                .index
                .ok_or(CommandError::InvalidArgument("no index buffer bound"))?;
            if index_count == 0 || instance_count == 0 {
                return cb.skip_work();
            }
            let max_indices = index.max_indices();
            if first_index > max_indices {
                return Err(CommandError::InvalidArgument("first index past the index buffer"));
            }
            cb.validate_draw(Some((base_vertex as u32, first_instance)), true)?;
            cb.set_instance_count(instance_count)?;
            encode::draw_index_2(
                &mut cb.main.stream,
                max_indices - first_index,
                index.address() + u64::from(first_index) * index.format.byte_size(),
                index_count,
            )?;
            cb.counters.draws += 1;
            cb.gang.main_work = true;
            Ok(())
        })
    }

    pub fn draw_indirect(
        &mut self,
        buffer: pt::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<(), CommandError> {
        self.record("draw_indirect", |cb| {
            cb.draw_indirect_impl(buffer, offset, draw_count, stride, false)
        })
    }

    pub fn draw_indexed_indirect(
        &mut self,
        buffer: pt::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<(), CommandError> {
        self.record("draw_indexed_indirect", |cb| {
            cb.draw_indirect_impl(buffer, offset, draw_count, stride, true)
        })
    }

    fn draw_indirect_impl(
        &mut self,
        buffer: pt::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
        indexed: bool,
    ) -> Result<(), CommandError> {
        self.require_graphics()?;
        if indexed && self.graphics.index.is_none() {
            return Err(CommandError::InvalidArgument("no index buffer bound"));
        }
        if draw_count == 0 {
            return self.skip_work();
        }
        let record = if indexed {
            DRAW_INDEXED_ARGS_BYTES
        } else {
            DRAW_ARGS_BYTES
        };
        let stride = if stride == 0 && draw_count == 1 {
            record
        } else {
            stride
        };
        if stride < record || stride % 4 != 0 || offset % 4 != 0 {
            return Err(CommandError::InvalidArgument("bad indirect draw layout"));
        }
        let span = u64::from(stride) * u64::from(draw_count - 1) + u64::from(record);
        let args = self.indirect_args(&buffer, offset, span)?;

        self.sync.flush(&mut self.main.stream, self.hw)?;
        self.writes.wait_for(&mut self.main.stream, &args.range, false)?;
        let pipeline = self.validate_draw(None, indexed)?;
        if self.main.indirect_base != Some(args.base) {
            encode::set_base(&mut self.main.stream, encode::BASE_INDEX_INDIRECT, args.base)?;
            self.main.indirect_base = Some(args.base);
        }

        let bank = self.hw.vertex_fetch_bank(pipeline.stages());
        let base_vertex = bank + user_data::BASE_VERTEX;
        let base_instance = bank + user_data::BASE_INSTANCE;
        let sh_base = RegSpace::Sh.base();
        let draw = encode::IndirectDraw {
            data_offset: args.data_offset,
            count: draw_count,
            stride,
            base_vertex_loc: base_vertex - sh_base,
            start_instance_loc: base_instance - sh_base,
        };
        if indexed {
            encode::draw_index_indirect_multi(&mut self.main.stream, &draw)?;
        } else {
            encode::draw_indirect_multi(&mut self.main.stream, &draw)?;
        }
        // The command processor wrote these behind the shadow's back.
        self.main.sh.forget(base_vertex);
        self.main.sh.forget(base_instance);
        self.graphics.num_instances = None;
        self.counters.draws += 1;
        self.gang.main_work = true;
        Ok(())
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), CommandError> {
        self.record("dispatch", |cb| {
            let pipeline = cb.bound_compute()?;
            if x == 0 || y == 0 || z == 0 {
                return cb.skip_work();
            }
            let on_ace = cb.prepare_dispatch(&pipeline)?;
            let lane = cb.lane_mut(on_ace)?;
            encode::dispatch_direct(&mut lane.stream, [x, y, z], pipeline.dispatch_initiator())?;
            cb.note_dispatch(on_ace);
            Ok(())
        })
    }

    pub fn dispatch_indirect(&mut self, buffer: pt::Buffer, offset: u64) -> Result<(), CommandError> {
        self.record("dispatch_indirect", |cb| {
            let pipeline = cb.bound_compute()?;
            if offset % 4 != 0 {
                return Err(CommandError::InvalidArgument("misaligned indirect dispatch offset"));
            }
            let args = cb.indirect_args(&buffer, offset, DISPATCH_ARGS_BYTES)?;
            let on_ace = cb.prepare_dispatch(&pipeline)?;
            let lane = match cb.ace {
                Some(ref mut lane) if on_ace => lane,
                _ => &mut cb.main,
            };
            cb.writes.wait_for(&mut lane.stream, &args.range, on_ace)?;
            if lane.indirect_base != Some(args.base) {
                encode::set_base(&mut lane.stream, encode::BASE_INDEX_INDIRECT, args.base)?;
                lane.indirect_base = Some(args.base);
            }
            encode::dispatch_indirect(
                &mut lane.stream,
                args.data_offset,
                pipeline.dispatch_initiator(),
            )?;
            cb.note_dispatch(on_ace);
            Ok(())
        })
    }

    fn bound_compute(&self) -> Result<Arc<Pipeline>, CommandError> {
        self.compute
            .pipeline
            .clone()
            .ok_or(CommandError::InvalidArgument("no compute pipeline bound"))
    }

    fn note_dispatch(&mut self, on_ace: bool) {
        self.counters.dispatches += 1;
        if on_ace {
            self.gang.ace_work = true;
        } else {
            self.gang.main_work = true;
        }
    }

    fn lane_mut(&mut self, ace: bool) -> Result<&mut Lane, CommandError> {
        if ace {
            self.ace
                .as_mut()
                .ok_or(CommandError::InvalidArgument("no parallel compute stream"))
        } else {
            Ok(&mut self.main)
        }
    }

    /// Zero-sized work: nothing to launch, but pending barriers still land.
    fn skip_work(&mut self) -> Result<(), CommandError> {
        log::trace!("skipping empty work in {:?}", self.label);
        self.counters.skipped += 1;
        self.sync.flush(&mut self.main.stream, self.hw)
    }

    fn set_instance_count(&mut self, count: u32) -> Result<(), CommandError> {
        if self.graphics.num_instances != Some(count) {
            encode::num_instances(&mut self.main.stream, count)?;
            self.graphics.num_instances = Some(count);
        }
        Ok(())
    }

    fn indirect_args(
        &self,
        buffer: &pt::Buffer,
        offset: u64,
        span: u64,
    ) -> Result<IndirectArgs, CommandError> {
        if !buffer.contains(offset, span) {
            return Err(CommandError::InvalidArgument("indirect arguments out of bounds"));
        }
        let base = buffer.address & !7;
        let data_offset = (buffer.address - base) + offset;
        if data_offset > u64::from(u32::MAX) {
            return Err(CommandError::InvalidArgument("indirect offset too large"));
        }
        let start = buffer.address + offset;
        Ok(IndirectArgs {
            base,
            data_offset: data_offset as u32,
            range: start..start + span,
        })
    }

    /// Orders memory accesses: work before the barrier that used `src`
    /// completes, and its results become visible to `dst` accesses after it.
    pub fn barrier(
        &mut self,
        src: pt::AccessFlags,
        dst: pt::AccessFlags,
        transitions: &[pt::ImageTransition],
    ) -> Result<(), CommandError> {
        self.record("barrier", |cb| {
            let mut actions = conv::barrier_actions(src, dst);
            for transition in transitions {
                let flush = conv::layout_flush(transition);
                if !flush.is_empty() {
                    actions.coher |= flush;
                    if actions.events.is_empty() {
                        actions.events.push(event::PS_PARTIAL_FLUSH);
                        actions.events.push(event::CS_PARTIAL_FLUSH);
                    }
                }
            }
            if dst.contains(pt::AccessFlags::INDIRECT_ARGS) {
                cb.writes.wait_all(&mut cb.main.stream, false)?;
            }
            if let Some(ref mut ace) = cb.ace {
                if cb.gang.ace_work {
                    encode::event_write(
                        &mut ace.stream,
                        event::CS_PARTIAL_FLUSH,
                        event::INDEX_PARTIAL_FLUSH,
                    )?;
                    if !actions.coher.is_empty() {
                        encode::acquire_mem(&mut ace.stream, cb.hw, actions.coher, 0, u64::MAX)?;
                    }
                }
                cb.gang
                    .join(&mut cb.main.stream, &mut ace.stream, cb.hw, &mut cb.embedded)?;
            }
            cb.sync.add(&actions);
            Ok(())
        })
    }

    /// Flushes pending barrier work ahead of a command-processor write.
    fn begin_transfer(&mut self) -> Result<(), CommandError> {
        self.sync.flush(&mut self.main.stream, self.hw)
    }

    /// Releases a timestamp behind CP writes to `ranges`, so indirect
    /// commands reading them later can wait.
    fn end_transfer(&mut self, ranges: &[Range<pt::GpuAddress>]) -> Result<(), CommandError> {
        self.writes
            .record(&mut self.main.stream, self.hw, &mut self.embedded, ranges)?;
        self.gang.main_work = true;
        Ok(())
    }

    pub fn copy_buffer(
        &mut self,
        src: pt::Buffer,
        dst: pt::Buffer,
        regions: &[pt::BufferCopy],
    ) -> Result<(), CommandError> {
        self.record("copy_buffer", |cb| {
            let mut ranges = SmallVec::<[Range<pt::GpuAddress>; 4]>::new();
            for region in regions.iter().filter(|r| r.size != 0) {
                if !src.contains(region.src_offset, region.size)
                    || !dst.contains(region.dst_offset, region.size)
                {
                    return Err(CommandError::InvalidArgument("copy region out of bounds"));
                }
                let from = src.address + region.src_offset;
                let to = dst.address + region.dst_offset;
                if from < to + region.size && to < from + region.size {
                    return Err(CommandError::InvalidArgument("copy regions overlap"));
                }
                ranges.push(to..to + region.size);
            }
            if ranges.is_empty() {
                return Ok(());
            }
            cb.begin_transfer()?;
            for region in regions.iter().filter(|r| r.size != 0) {
                encode::dma_data(
                    &mut cb.main.stream,
                    DmaSource::Memory(src.address + region.src_offset),
                    dst.address + region.dst_offset,
                    region.size,
                )?;
            }
            cb.end_transfer(&ranges)
        })
    }

    /// Copies texels between images. Linear images copy any region row by
    /// row; optimally tiled images only copy whole, identically shaped images.
    pub fn copy_image(
        &mut self,
        src: &pt::Image,
        dst: &pt::Image,
        regions: &[pt::ImageCopy],
    ) -> Result<(), CommandError> {
        self.record("copy_image", |cb| {
            let transfers = image_copy_transfers(src, dst, regions)?;
            if transfers.is_empty() {
                return Ok(());
            }
            cb.begin_transfer()?;
            let mut ranges = SmallVec::<[Range<pt::GpuAddress>; 4]>::new();
            for &(from, to, bytes) in transfers.iter() {
                encode::dma_data(&mut cb.main.stream, DmaSource::Memory(from), to, bytes)?;
                match ranges.last_mut() {
                    Some(last) if last.end == to => last.end = to + bytes,
                    _ => ranges.push(to..to + bytes),
                }
            }
            cb.end_transfer(&ranges)
        })
    }

    /// Fills `size` bytes of `dst` from `offset` with a repeated dword.
    pub fn fill_buffer(
        &mut self,
        dst: pt::Buffer,
        offset: u64,
        size: u64,
        value: u32,
    ) -> Result<(), CommandError> {
        self.record("fill_buffer", |cb| {
            if offset % 4 != 0 || size % 4 != 0 {
                return Err(CommandError::InvalidArgument("fills must be dword aligned"));
            }
            if !dst.contains(offset, size) {
                return Err(CommandError::InvalidArgument("fill out of bounds"));
            }
            if size == 0 {
                return Ok(());
            }
            cb.begin_transfer()?;
            let to = dst.address + offset;
            encode::dma_data(&mut cb.main.stream, DmaSource::Data(value), to, size)?;
            cb.end_transfer(&[to..to + size])
        })
    }

    /// Writes the 64-bit GPU clock to `dst`.
    pub fn write_timestamp(
        &mut self,
        dst: pt::GpuAddress,
        point: pt::TimestampPoint,
    ) -> Result<(), CommandError> {
        self.record("write_timestamp", |cb| {
            cb.begin_transfer()?;
            match point {
                pt::TimestampPoint::Top => {
                    encode::copy_data(&mut cb.main.stream, CopySource::GpuClock, dst, true)?
                }
                pt::TimestampPoint::Bottom => encode::release_mem(
                    &mut cb.main.stream,
                    cb.hw,
                    &ReleaseMem::bottom_of_pipe(ReleaseData::Timestamp, dst),
                )?,
            }
            cb.end_transfer(&[dst..dst + 8])
        })
    }

    pub fn write_immediate(&mut self, dst: pt::GpuAddress, value: u32) -> Result<(), CommandError> {
        self.record("write_immediate", |cb| {
            cb.begin_transfer()?;
            encode::write_data(&mut cb.main.stream, dst, &[value])?;
            cb.end_transfer(&[dst..dst + 4])
        })
    }

    pub fn memory_atomic(
        &mut self,
        op: pt::AtomicOp,
        dst: pt::GpuAddress,
        value: u64,
    ) -> Result<(), CommandError> {
        self.record("memory_atomic", |cb| {
            let (tc_op, wide) = conv::atomic_op(op);
            cb.begin_transfer()?;
            encode::atomic_mem(&mut cb.main.stream, tc_op, dst, value, wide)?;
            cb.end_transfer(&[dst..dst + if wide { 8 } else { 4 }])
        })
    }

    fn new_ace_lane(&self) -> Lane {
        let dwords = (self.settings.chunk_dwords / 4).max(pt::Settings::MIN_CHUNK_DWORDS);
        let stream = CmdStream::new(
            pt::EngineType::Compute,
            self.allocator.clone(),
            &self.settings,
            self.hw,
        )
        .with_chunk_dwords(dwords);
        Lane::new(stream)
    }

    /// Fast user-data SGPRs available to the client in one bank.
    fn fast_user_data(&self, hw_slots: u32) -> u32 {
        match self.settings.fast_user_data_limit {
            0 => hw_slots,
            limit => hw_slots.min(u32::from(limit)),
        }
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.reset();
    }
}

struct IndirectArgs {
    /// 8-byte aligned address for `SET_BASE`.
    base: pt::GpuAddress,
    data_offset: u32,
    range: Range<pt::GpuAddress>,
}

/// Resolves image copy regions to `(src, dst, bytes)` memory transfers.
/// Every region is checked before anything is returned.
fn image_copy_transfers(
    src: &pt::Image,
    dst: &pt::Image,
    regions: &[pt::ImageCopy],
) -> Result<Vec<(pt::GpuAddress, pt::GpuAddress, u64)>, CommandError> {
    if src.format != dst.format {
        return Err(CommandError::InvalidArgument("image formats differ"));
    }
    let bpp = src.format.bytes_per_texel();
    let fits = |origin: &pt::Origin3d, extent: &pt::Extent3d, image: &pt::Image| {
        u64::from(origin.x) + u64::from(extent.width) <= u64::from(image.extent.width)
            && u64::from(origin.y) + u64::from(extent.height) <= u64::from(image.extent.height)
            && u64::from(origin.z) + u64::from(extent.depth) <= u64::from(image.extent.depth)
    };

    let mut transfers = Vec::new();
    for region in regions {
        let extent = region.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            continue;
        }
        if !fits(&region.src_origin, &extent, src) || !fits(&region.dst_origin, &extent, dst) {
            return Err(CommandError::InvalidArgument("copy region out of bounds"));
        }
        match (src.tiling, dst.tiling) {
            (pt::Tiling::Linear, pt::Tiling::Linear) => {
                let row_bytes = u64::from(extent.width) * u64::from(bpp);
                let texel = |image: &pt::Image, origin: &pt::Origin3d, y: u32, z: u32| {
                    image.address
                        + u64::from(origin.z + z) * image.slice_pitch
                        + u64::from(origin.y + y) * u64::from(image.row_pitch)
                        + u64::from(origin.x) * u64::from(bpp)
                };
                for z in 0..extent.depth {
                    for y in 0..extent.height {
                        transfers.push((
                            texel(src, &region.src_origin, y, z),
                            texel(dst, &region.dst_origin, y, z),
                            row_bytes,
                        ));
                    }
                }
            }
            (pt::Tiling::Optimal, pt::Tiling::Optimal) => {
                let whole = region.src_origin == pt::Origin3d::default()
                    && region.dst_origin == pt::Origin3d::default()
                    && extent == src.extent
                    && src.extent == dst.extent
                    && src.slice_pitch == dst.slice_pitch;
                if !whole {
                    return Err(CommandError::InvalidArgument(
                        "tiled images can only be copied whole",
                    ));
                }
                transfers.push((
                    src.address,
                    dst.address,
                    src.slice_pitch * u64::from(extent.depth),
                ));
            }
            _ => {
                return Err(CommandError::InvalidArgument(
                    "copies between linear and tiled images are not supported",
                ))
            }
        }
    }
    Ok(transfers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(address: pt::GpuAddress, width: u32, height: u32) -> pt::Image {
        pt::Image::linear(
            address,
            pt::Extent3d {
                width,
                height,
                depth: 1,
            },
            pt::ImageFormat::Rgba8Unorm,
        )
    }

    #[test]
    fn linear_copies_go_row_by_row() {
        let src = linear(0x10000, 64, 64);
        let dst = linear(0x80000, 32, 32);
        let region = pt::ImageCopy {
            src_origin: pt::Origin3d { x: 4, y: 2, z: 0 },
            dst_origin: pt::Origin3d::default(),
            extent: pt::Extent3d {
                width: 8,
                height: 3,
                depth: 1,
            },
        };
        let transfers = image_copy_transfers(&src, &dst, &[region]).unwrap();
        assert_eq!(transfers.len(), 3);
        assert_eq!(transfers[0], (0x10000 + 2 * 256 + 16, 0x80000, 32));
        assert_eq!(transfers[2].1, 0x80000 + 2 * 128);
    }

    #[test]
    fn tiled_copies_must_be_whole() {
        let mut src = linear(0x10000, 16, 16);
        src.tiling = pt::Tiling::Optimal;
        let mut dst = src;
        dst.address = 0x40000;
        let whole = pt::ImageCopy {
            src_origin: pt::Origin3d::default(),
            dst_origin: pt::Origin3d::default(),
            extent: src.extent,
        };
        assert_eq!(
            image_copy_transfers(&src, &dst, &[whole]).unwrap(),
            vec![(0x10000, 0x40000, 16 * 16 * 4)]
        );
        let part = pt::ImageCopy {
            extent: pt::Extent3d {
                width: 8,
                ..src.extent
            },
            ..whole
        };
        assert!(image_copy_transfers(&src, &dst, &[part]).is_err());
        assert!(image_copy_transfers(&src, &linear(0, 16, 16), &[whole]).is_err());
    }

    #[test]
    fn copies_need_one_format() {
        let src = linear(0x10000, 16, 16);
        let mut dst = linear(0x40000, 16, 16);
        dst.format = pt::ImageFormat::Bgra8Unorm;
        let whole = pt::ImageCopy {
            src_origin: pt::Origin3d::default(),
            dst_origin: pt::Origin3d::default(),
            extent: src.extent,
        };
        assert_eq!(
            image_copy_transfers(&src, &dst, &[whole]),
            Err(CommandError::InvalidArgument("image formats differ"))
        );
    }
}
