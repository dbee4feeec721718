/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The pre-draw and pre-dispatch pass.
//!
//! Barrier work is flushed first, then the pipeline blob, user data,
//! vertex and index state, topology and the dynamic groups are folded into
//! the register shadows, and the shadows are flushed as coalesced writes.

use std::sync::Arc;

use super::{
    embedded::EmbeddedData,
    state::{DirtyState, SpillTable, UserData},
    CommandBuffer, Lane,
};
use crate::{
    conv, encode,
    hw::{self, HwTable},
    pipeline::{Pipeline, PipelineBlob},
    regs::{self, user_data},
    shadow::RegisterShadow,
    stream::CmdStream,
    CommandError,
};

/// Replays `blob` unless it is what the lane last replayed into that slot.
/// Returns whether it was replayed.
fn apply_blob(
    stream: &mut CmdStream,
    context: Option<&mut RegisterShadow>,
    sh: &mut RegisterShadow,
    bound: &mut Option<u64>,
    blob: &PipelineBlob,
) -> Result<bool, CommandError> {
    if *bound == Some(blob.id()) {
        return Ok(false);
    }
    log::trace!("replaying pipeline blob {}", blob.id());
    encode::raw(stream, blob.words())?;
    if let Some(context) = context {
        for &(reg, value) in blob.context_regs() {
            context.mark_written(reg, value);
        }
    }
    for &(reg, value) in blob.sh_regs() {
        sh.mark_written(reg, value);
    }
    *bound = Some(blob.id());
    Ok(true)
}

/// The dynamic-state group that owns context register `reg`, if any.
fn dynamic_group(reg: u32) -> DirtyState {
    let within = |base: u32, count: u32| reg >= base && reg < base + count;
    let viewports = pt::MAX_VIEWPORTS as u32;
    if within(regs::PA_CL_VPORT_XSCALE, viewports * regs::VPORT_STRIDE)
        || within(regs::PA_SC_VPORT_ZMIN_0, viewports * 2)
    {
        DirtyState::VIEWPORT
    } else if within(regs::PA_SC_VPORT_SCISSOR_0_TL, viewports * 2) {
        DirtyState::SCISSOR
    } else if within(regs::CB_BLEND_RED, 4) {
        DirtyState::BLEND_CONSTANTS
    } else if reg == regs::DB_STENCILREFMASK || reg == regs::DB_STENCILREFMASK_BF {
        DirtyState::STENCIL_REF
    } else if within(regs::DB_DEPTH_BOUNDS_MIN, 2) {
        DirtyState::DEPTH_BOUNDS
    } else if within(
        regs::CB_COLOR0_BASE,
        pt::MAX_COLOR_TARGETS as u32 * regs::CB_COLOR_STRIDE,
    ) || within(regs::DB_Z_INFO, 6)
        || reg == regs::CB_TARGET_MASK
        || reg == regs::PA_SC_WINDOW_SCISSOR_TL
        || reg == regs::PA_SC_WINDOW_SCISSOR_BR
    {
        DirtyState::TARGETS
    } else {
        DirtyState::empty()
    }
}

fn split(address: u64) -> [u32; 2] {
    [address as u32, (address >> 32) as u32]
}

/// Where the user data of one bind point goes.
struct UserDataLayout<'a> {
    banks: &'a [u32],
    /// First client SGPR within a bank.
    client: u32,
    /// Entries that fit in SGPRs.
    fast: u32,
    /// Entries the pipeline reads.
    entries: u32,
}

/// Loads fast user data into SGPRs and spills the rest to a table written
/// with `WRITE_DATA`. The table is only rebuilt when its content changed.
fn apply_user_data(
    stream: &mut CmdStream,
    sh: &mut RegisterShadow,
    embedded: &mut EmbeddedData,
    layout: &UserDataLayout,
    values: &UserData,
    spill: &mut Option<SpillTable>,
) -> Result<(), CommandError> {
    let entries = layout.entries.min(pt::MAX_USER_DATA_ENTRIES as u32);
    let fast = layout.fast.min(entries);
    for &bank in layout.banks {
        sh.set_range(bank + layout.client, &values.values[..fast as usize]);
    }
    if entries <= fast {
        return Ok(());
    }
    let wanted = (fast, entries);
    let address = match *spill {
        Some(table) if table.generation == values.generation && table.entries == wanted => {
            table.address
        }
        _ => {
            let (address, _) = embedded.alloc(entries - fast, 1)?;
            encode::write_data(stream, address, &values.values[fast as usize..entries as usize])?;
            log::trace!("spilled user data {:?} to {:#x}", wanted, address);
            *spill = Some(SpillTable {
                generation: values.generation,
                entries: wanted,
                address,
            });
            address
        }
    };
    for &bank in layout.banks {
        sh.set_range(bank + user_data::SPILL_TABLE, &split(address));
    }
    Ok(())
}

fn validate_compute(
    lane: &mut Lane,
    embedded: &mut EmbeddedData,
    hw: &HwTable,
    values: &UserData,
    pipeline: &Pipeline,
    fast: u32,
) -> Result<(), CommandError> {
    apply_blob(
        &mut lane.stream,
        None,
        &mut lane.sh,
        &mut lane.compute_blob,
        pipeline.blob(),
    )?;
    let layout = UserDataLayout {
        banks: &[hw.user_data.cs],
        client: user_data::COMPUTE_CLIENT,
        fast,
        entries: pipeline.user_data_entries(),
    };
    apply_user_data(
        &mut lane.stream,
        &mut lane.sh,
        embedded,
        &layout,
        values,
        &mut lane.compute_spill,
    )?;
    lane.sh.flush(&mut lane.stream)?;
    Ok(())
}

impl CommandBuffer {
    /// Brings the graphics stream up to date for a draw.
    ///
    /// `direct` carries the base vertex and first instance of a direct
    /// draw; indirect draws have the command processor load them.
    pub(super) fn validate_draw(
        &mut self,
        direct: Option<(u32, u32)>,
        indexed: bool,
    ) -> Result<Arc<Pipeline>, CommandError> {
        profiling::scope!("validate_draw");
        let pipeline = self
            .graphics
            .pipeline
            .clone()
            .ok_or(CommandError::InvalidArgument("no graphics pipeline bound"))?;
        let hw = self.hw;

        self.sync.flush(&mut self.main.stream, hw)?;

        let replayed = apply_blob(
            &mut self.main.stream,
            Some(&mut self.context),
            &mut self.main.sh,
            &mut self.main.graphics_blob,
            pipeline.blob(),
        )?;
        if replayed {
            // The blob overwrote any client state sharing its registers.
            let overwritten = pipeline
                .blob()
                .context_regs()
                .iter()
                .fold(DirtyState::empty(), |groups, &(reg, _)| {
                    groups | dynamic_group(reg)
                });
            self.graphics.dirty |=
                DirtyState::TOPOLOGY | (overwritten & self.graphics.programmed);
        }

        let banks = hw.user_data_banks(pipeline.stages() & pt::HwStages::GRAPHICS);
        let layout = UserDataLayout {
            banks: &banks,
            client: user_data::GRAPHICS_CLIENT,
            fast: self.fast_user_data(user_data::BANK_SIZE - user_data::GRAPHICS_CLIENT),
            entries: pipeline.user_data_entries(),
        };
        apply_user_data(
            &mut self.main.stream,
            &mut self.main.sh,
            &mut self.embedded,
            &layout,
            &self.graphics.user_data,
            &mut self.graphics.spill,
        )?;

        self.apply_vertex_buffers(&pipeline)?;
        if let Some((base_vertex, first_instance)) = direct {
            let bank = hw.vertex_fetch_bank(pipeline.stages());
            self.main
                .sh
                .set_range(bank + user_data::BASE_VERTEX, &[base_vertex, first_instance]);
        }

        if indexed && self.graphics.dirty.contains(DirtyState::INDEX_BUFFER) {
            let index = self
                .graphics
                .index
                .ok_or(CommandError::InvalidArgument("no index buffer bound"))?;
            encode::index_base(&mut self.main.stream, index.address())?;
            encode::index_buffer_size(&mut self.main.stream, index.max_indices())?;
            self.main
                .sh
                .set(regs::VGT_INDEX_TYPE, conv::map_index_type(index.format));
            self.graphics.dirty.remove(DirtyState::INDEX_BUFFER);
        }

        if self.graphics.dirty.contains(DirtyState::TOPOLOGY) {
            let topology = self.graphics.topology().unwrap_or_default();
            self.main
                .sh
                .set(regs::VGT_PRIMITIVE_TYPE, conv::map_primitive_type(topology));
            if let Some(config) = conv::ls_hs_config(topology) {
                self.context.set(regs::VGT_LS_HS_CONFIG, config);
            }
            self.graphics.dirty.remove(DirtyState::TOPOLOGY);
        }

        self.apply_dynamic_state()?;

        self.context.flush(&mut self.main.stream)?;
        self.main.sh.flush(&mut self.main.stream)?;

        self.require_rings(pipeline.rings());
        Ok(pipeline)
    }

    fn apply_vertex_buffers(&mut self, pipeline: &Pipeline) -> Result<(), CommandError> {
        if self.graphics.dirty.contains(DirtyState::VERTEX_BUFFERS) {
            self.graphics.dirty.remove(DirtyState::VERTEX_BUFFERS);
            let count = self.graphics.vertex_buffer_count();
            self.graphics.vertex_table = if count == 0 {
                None
            } else {
                let (address, words) = self.embedded.alloc(count as u32 * 4, 4)?;
                for (out, binding) in words.chunks_mut(4).zip(self.graphics.vertex_buffers.iter()) {
                    let srd = binding.map_or([0; 4], |b| {
                        hw::buffer_srd(b.buffer.address, b.buffer.size, b.stride)
                    });
                    out.copy_from_slice(&srd);
                }
                Some(address)
            };
        }
        if let Some(address) = self.graphics.vertex_table {
            let bank = self.hw.vertex_fetch_bank(pipeline.stages());
            self.main
                .sh
                .set_range(bank + user_data::VERTEX_BUFFER_TABLE, &split(address));
        }
        Ok(())
    }

    /// Folds every dirty dynamic-state group into the context shadow.
    fn apply_dynamic_state(&mut self) -> Result<(), CommandError> {
        let graphics = &mut self.graphics;
        let context = &mut self.context;
        let dirty = graphics.dirty
            & !(DirtyState::INDEX_BUFFER | DirtyState::VERTEX_BUFFERS | DirtyState::TOPOLOGY);
        graphics.dirty.remove(dirty);
        graphics.programmed |= dirty;

        if dirty.contains(DirtyState::VIEWPORT) {
            for (i, vp) in graphics.viewports.iter().enumerate() {
                let i = i as u32;
                context.set_range(
                    regs::PA_CL_VPORT_XSCALE + i * regs::VPORT_STRIDE,
                    &conv::viewport_transform(vp),
                );
                context.set_range(
                    regs::PA_SC_VPORT_ZMIN_0 + i * 2,
                    &conv::viewport_depth_range(vp),
                );
            }
        }
        if dirty.contains(DirtyState::SCISSOR) {
            for (i, rect) in graphics.scissors.iter().enumerate() {
                context.set_range(
                    regs::PA_SC_VPORT_SCISSOR_0_TL + i as u32 * 2,
                    &conv::scissor(rect),
                );
            }
        }
        if dirty.contains(DirtyState::BLEND_CONSTANTS) {
            let c = graphics.blend_constants;
            context.set_range(
                regs::CB_BLEND_RED,
                &[c.r.to_bits(), c.g.to_bits(), c.b.to_bits(), c.a.to_bits()],
            );
        }
        if dirty.contains(DirtyState::STENCIL_REF) {
            let (front, back) = graphics.stencil_reference;
            // The masks in the upper bytes come from the pipeline.
            for &(reg, reference) in [
                (regs::DB_STENCILREFMASK, front),
                (regs::DB_STENCILREFMASK_BF, back),
            ]
            .iter()
            {
                let old = context.get(reg).unwrap_or(0);
                context.set(reg, (old & !0xFF) | u32::from(reference));
            }
        }
        if dirty.contains(DirtyState::DEPTH_BOUNDS) {
            let (min, max) = graphics.depth_bounds;
            context.set_range(regs::DB_DEPTH_BOUNDS_MIN, &[min.to_bits(), max.to_bits()]);
        }
        if dirty.contains(DirtyState::TARGETS) {
            apply_targets(graphics, context)?;
        }
        Ok(())
    }

    /// Picks the stream a dispatch goes to and validates it. Returns `true`
    /// for the parallel compute stream.
    pub(super) fn prepare_dispatch(&mut self, pipeline: &Arc<Pipeline>) -> Result<bool, CommandError> {
        profiling::scope!("validate_dispatch");
        let hw = self.hw;
        let fast = self.fast_user_data(user_data::BANK_SIZE - user_data::COMPUTE_CLIENT);
        let on_ace = pipeline.is_async_compute() && self.engine == pt::EngineType::Universal;

        self.sync.flush(&mut self.main.stream, hw)?;
        if on_ace {
            if self.ace.is_none() {
                log::debug!("{:?} opens a parallel compute stream", self.label);
                self.ace = Some(self.new_ace_lane());
            }
            let ace = self
                .ace
                .as_mut()
                .ok_or(CommandError::InvalidArgument("no parallel compute stream"))?;
            self.gang
                .handoff(&mut self.main.stream, &mut ace.stream, hw, &mut self.embedded)?;
            validate_compute(
                ace,
                &mut self.embedded,
                hw,
                &self.compute.user_data,
                pipeline,
                fast,
            )?;
        } else {
            validate_compute(
                &mut self.main,
                &mut self.embedded,
                hw,
                &self.compute.user_data,
                pipeline,
                fast,
            )?;
        }
        self.require_rings(pipeline.rings());
        Ok(on_ace)
    }
}

/// `CB_COLOR_PITCH` in tiles of 8 pixels, minus one.
fn color_pitch(image: &pt::Image) -> u32 {
    let texels = match image.tiling {
        pt::Tiling::Linear => image.row_pitch / image.format.bytes_per_texel(),
        pt::Tiling::Optimal => image.extent.width,
    };
    (texels.max(8) / 8) - 1
}

fn apply_targets(
    graphics: &mut super::state::GraphicsState,
    context: &mut RegisterShadow,
) -> Result<(), CommandError> {
    let mut mask = 0;
    for (i, image) in graphics.color_targets.iter().enumerate() {
        let info = conv::color_info(image.format)
            .ok_or(CommandError::InvalidArgument("colour target has a depth format"))?;
        let base = regs::CB_COLOR0_BASE + i as u32 * regs::CB_COLOR_STRIDE;
        context.set(base, (image.address >> 8) as u32);
        context.set(
            base + regs::CB_COLOR_BASE_EXT,
            (image.address >> 40) as u32 & 0xFF,
        );
        context.set(base + regs::CB_COLOR_PITCH, color_pitch(image));
        context.set(base + regs::CB_COLOR_INFO, info);
        mask |= 0xF << (i * 4);
    }
    // Targets of an earlier, larger binding get an invalid format.
    for i in graphics.color_targets.len()..graphics.stale_color_targets {
        let base = regs::CB_COLOR0_BASE + i as u32 * regs::CB_COLOR_STRIDE;
        context.set(base + regs::CB_COLOR_INFO, 0);
    }
    graphics.stale_color_targets = graphics.color_targets.len();
    context.set(regs::CB_TARGET_MASK, mask);

    match graphics.depth_target {
        Some(ref image) => {
            let (z_info, stencil_info) = conv::depth_info(image.format)
                .ok_or(CommandError::InvalidArgument("depth target has a colour format"))?;
            let base = (image.address >> 8) as u32;
            context.set_range(
                regs::DB_Z_INFO,
                &[z_info, stencil_info, base, base, base, base],
            );
        }
        None => context.set_range(regs::DB_Z_INFO, &[0, 0]),
    }

    let extent = graphics
        .color_targets
        .first()
        .or_else(|| graphics.depth_target.as_ref())
        .map(|image| image.extent);
    if let Some(extent) = extent {
        // WINDOW_OFFSET_DISABLE
        context.set(regs::PA_SC_WINDOW_SCISSOR_TL, 1 << 31);
        context.set(
            regs::PA_SC_WINDOW_SCISSOR_BR,
            extent.width.min(0x7FFF) | (extent.height.min(0x7FFF) << 16),
        );
    }
    Ok(())
}
