/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::sync::Arc;

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::{pipeline::Pipeline, CommandError};

bitflags! {
    /// Dynamic state groups changed since the last draw.
    pub(crate) struct DirtyState: u32 {
        const VIEWPORT = 1 << 0;
        const SCISSOR = 1 << 1;
        const BLEND_CONSTANTS = 1 << 2;
        const STENCIL_REF = 1 << 3;
        const DEPTH_BOUNDS = 1 << 4;
        const TARGETS = 1 << 5;
        const INDEX_BUFFER = 1 << 6;
        const VERTEX_BUFFERS = 1 << 7;
        const TOPOLOGY = 1 << 8;
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct IndexBinding {
    pub buffer: pt::Buffer,
    pub offset: u64,
    pub format: pt::IndexFormat,
}

impl IndexBinding {
    pub fn address(&self) -> pt::GpuAddress {
        self.buffer.address + self.offset
    }

    /// Number of whole indices between the binding offset and the end of
    /// the buffer.
    pub fn max_indices(&self) -> u32 {
        let bytes = self.buffer.size.saturating_sub(self.offset);
        (bytes / self.format.byte_size()).min(u64::from(u32::MAX)) as u32
    }
}

/// Client user-data entries of one bind point.
#[derive(Debug)]
pub(crate) struct UserData {
    pub values: [u32; pt::MAX_USER_DATA_ENTRIES],
    /// Bumped on every change so that spill tables know when to rebuild.
    pub generation: u64,
}

impl Default for UserData {
    fn default() -> Self {
        Self {
            values: [0; pt::MAX_USER_DATA_ENTRIES],
            generation: 0,
        }
    }
}

impl UserData {
    pub fn set(&mut self, first: u32, values: &[u32]) -> Result<(), CommandError> {
        let start = first as usize;
        let end = start
            .checked_add(values.len())
            .filter(|&end| end <= pt::MAX_USER_DATA_ENTRIES)
            .ok_or(CommandError::InvalidArgument("user data range out of bounds"))?;
        if self.values[start..end] != *values {
            self.values[start..end].copy_from_slice(values);
            self.generation += 1;
        }
        Ok(())
    }
}

/// Spilled user data last uploaded for a bind point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SpillTable {
    pub generation: u64,
    /// First spilled entry and one past the last.
    pub entries: (u32, u32),
    pub address: pt::GpuAddress,
}

#[derive(Debug)]
pub(crate) struct GraphicsState {
    pub pipeline: Option<Arc<Pipeline>>,
    pub topology_override: Option<pt::PrimitiveTopology>,
    pub index: Option<IndexBinding>,
    pub vertex_buffers: [Option<pt::VertexBufferBinding>; pt::MAX_VERTEX_BUFFERS],
    pub viewports: ArrayVec<pt::Viewport, { pt::MAX_VIEWPORTS }>,
    pub scissors: ArrayVec<pt::Rect, { pt::MAX_VIEWPORTS }>,
    pub blend_constants: pt::Color,
    pub stencil_reference: (u8, u8),
    pub depth_bounds: (f32, f32),
    pub color_targets: ArrayVec<pt::Image, { pt::MAX_COLOR_TARGETS }>,
    /// Colour targets that were programmed before the last `bind_targets`.
    pub stale_color_targets: usize,
    pub depth_target: Option<pt::Image>,
    pub user_data: UserData,
    pub spill: Option<SpillTable>,
    /// Descriptor table of the bound vertex buffers.
    pub vertex_table: Option<pt::GpuAddress>,
    pub num_instances: Option<u32>,
    pub dirty: DirtyState,
    /// Dynamic groups the client has programmed. They win over a pipeline
    /// blob that writes the same registers.
    pub programmed: DirtyState,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            pipeline: None,
            topology_override: None,
            index: None,
            vertex_buffers: [None; pt::MAX_VERTEX_BUFFERS],
            viewports: ArrayVec::new(),
            scissors: ArrayVec::new(),
            blend_constants: pt::Color::default(),
            stencil_reference: (0, 0),
            depth_bounds: (0.0, 1.0),
            color_targets: ArrayVec::new(),
            stale_color_targets: 0,
            depth_target: None,
            user_data: UserData::default(),
            spill: None,
            vertex_table: None,
            num_instances: None,
            dirty: DirtyState::empty(),
            programmed: DirtyState::empty(),
        }
    }
}

impl GraphicsState {
    pub fn topology(&self) -> Option<pt::PrimitiveTopology> {
        self.topology_override
            .or_else(|| self.pipeline.as_ref().and_then(|p| p.topology()))
    }

    /// Number of leading vertex buffer slots that need a descriptor.
    pub fn vertex_buffer_count(&self) -> usize {
        self.vertex_buffers
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |last| last + 1)
    }
}

#[derive(Debug, Default)]
pub(crate) struct ComputeState {
    pub pipeline: Option<Arc<Pipeline>>,
    pub user_data: UserData,
}

/// Replaces `list[first..first + values.len()]`, growing the list as needed.
/// The range must start within or right after the list.
pub(crate) fn splice<T: Copy, const N: usize>(
    list: &mut ArrayVec<T, N>,
    first: u32,
    values: &[T],
) -> Result<(), CommandError> {
    let start = first as usize;
    let end = start
        .checked_add(values.len())
        .filter(|&end| end <= N)
        .ok_or(CommandError::InvalidArgument("state index out of bounds"))?;
    if start > list.len() {
        return Err(CommandError::InvalidArgument("state range leaves a gap"));
    }
    let overlap = (list.len() - start).min(values.len());
    list[start..start + overlap].copy_from_slice(&values[..overlap]);
    list.extend(values[overlap..].iter().copied());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_grows_without_gaps() {
        let mut list = ArrayVec::<u32, 4>::new();
        splice(&mut list, 0, &[1, 2]).unwrap();
        splice(&mut list, 1, &[5, 6, 7]).unwrap();
        assert_eq!(&list[..], &[1, 5, 6, 7]);
        assert_eq!(
            splice(&mut list, 3, &[8, 9]),
            Err(CommandError::InvalidArgument("state index out of bounds"))
        );

        let mut short = ArrayVec::<u32, 4>::new();
        assert_eq!(
            splice(&mut short, 1, &[1]),
            Err(CommandError::InvalidArgument("state range leaves a gap"))
        );
        assert!(short.is_empty());
    }
}
