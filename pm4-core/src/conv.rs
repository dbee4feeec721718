/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use arrayvec::ArrayVec;

use crate::{hw::CoherFlags, regs::event};

pub(crate) fn map_primitive_type(topology: pt::PrimitiveTopology) -> u32 {
    use pt::PrimitiveTopology as Pt;
    match topology {
        Pt::PointList => 0x01,
        Pt::LineList => 0x02,
        Pt::LineStrip => 0x03,
        Pt::TriangleList => 0x04,
        Pt::TriangleFan => 0x05,
        Pt::TriangleStrip => 0x06,
        Pt::RectList => 0x11,
        Pt::PatchList { .. } => 0x22,
    }
}

/// `VGT_LS_HS_CONFIG` for patch topologies.
pub(crate) fn ls_hs_config(topology: pt::PrimitiveTopology) -> Option<u32> {
    match topology {
        pt::PrimitiveTopology::PatchList { control_points } => {
            let cp = u32::from(control_points) & 0x3F;
            Some(1 | (cp << 8) | (cp << 14))
        }
        _ => None,
    }
}

pub(crate) fn map_index_type(format: pt::IndexFormat) -> u32 {
    match format {
        pt::IndexFormat::Uint16 => 0,
        pt::IndexFormat::Uint32 => 1,
        pt::IndexFormat::Uint8 => 2,
    }
}

/// `PA_CL_VPORT_{X,Y,Z}{SCALE,OFFSET}` for one viewport.
pub(crate) fn viewport_transform(vp: &pt::Viewport) -> [u32; 6] {
    let half_w = vp.width * 0.5;
    let half_h = vp.height * 0.5;
    [
        half_w.to_bits(),
        (vp.x + half_w).to_bits(),
        half_h.to_bits(),
        (vp.y + half_h).to_bits(),
        (vp.max_depth - vp.min_depth).to_bits(),
        vp.min_depth.to_bits(),
    ]
}

/// `PA_SC_VPORT_ZMIN/ZMAX` for one viewport.
pub(crate) fn viewport_depth_range(vp: &pt::Viewport) -> [u32; 2] {
    [
        vp.min_depth.min(vp.max_depth).to_bits(),
        vp.min_depth.max(vp.max_depth).to_bits(),
    ]
}

const SCREEN_MAX: i64 = 16384;

fn screen_xy(x: i64, y: i64) -> u32 {
    let x = x.max(0).min(SCREEN_MAX) as u32;
    let y = y.max(0).min(SCREEN_MAX) as u32;
    x | (y << 16)
}

/// Top-left and bottom-right words of a scissor rectangle.
pub(crate) fn scissor(rect: &pt::Rect) -> [u32; 2] {
    let x = i64::from(rect.x);
    let y = i64::from(rect.y);
    [
        screen_xy(x, y),
        screen_xy(x + i64::from(rect.width), y + i64::from(rect.height)),
    ]
}

/// `CB_COLOR*_INFO` for a colour target format.
pub(crate) fn color_info(format: pt::ImageFormat) -> Option<u32> {
    use pt::ImageFormat as If;
    const UNORM: u32 = 0;
    const FLOAT: u32 = 7;
    const SWAP_ALT: u32 = 1;
    let (fmt, number, swap) = match format {
        If::R8Unorm => (0x01, UNORM, 0),
        If::Rgba8Unorm => (0x0A, UNORM, 0),
        If::Bgra8Unorm => (0x0A, UNORM, SWAP_ALT),
        If::R32Float => (0x04, FLOAT, 0),
        If::Rgba16Float => (0x0C, FLOAT, 0),
        If::Rgba32Float => (0x0E, FLOAT, 0),
        If::Depth16Unorm | If::Depth32Float | If::Depth32FloatStencil8 => return None,
    };
    Some((fmt << 2) | (number << 8) | (swap << 11))
}

/// `DB_Z_INFO` and `DB_STENCIL_INFO` for a depth format.
pub(crate) fn depth_info(format: pt::ImageFormat) -> Option<(u32, u32)> {
    match format {
        pt::ImageFormat::Depth16Unorm => Some((1, 0)),
        pt::ImageFormat::Depth32Float => Some((3, 0)),
        pt::ImageFormat::Depth32FloatStencil8 => Some((3, 1)),
        _ => None,
    }
}

/// What has to happen before memory written under `src` can be used under `dst`.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct BarrierActions {
    /// Partial-flush events waiting for earlier shader work.
    pub events: ArrayVec<u32, 2>,
    /// Cache actions for the acquire.
    pub coher: CoherFlags,
    /// The prefetch parser must wait for the micro engine.
    pub pfp_sync: bool,
}

pub(crate) fn barrier_actions(src: pt::AccessFlags, dst: pt::AccessFlags) -> BarrierActions {
    use pt::AccessFlags as Af;
    let mut actions = BarrierActions::default();
    if src.is_empty() || dst.is_empty() {
        return actions;
    }

    let shader_side = Af::SHADER_READ | Af::SHADER_WRITE | Af::UNIFORM_READ | Af::VERTEX_READ;
    if src.intersects(shader_side) {
        actions.events.push(event::CS_PARTIAL_FLUSH);
    }
    if src.intersects(shader_side | Af::COLOR_TARGET | Af::DEPTH_STENCIL_TARGET) {
        actions.events.push(event::PS_PARTIAL_FLUSH);
    }
    if dst.intersects(Af::INDIRECT_ARGS | Af::INDEX_READ) {
        actions.pfp_sync = true;
    }

    // Read-after-read and write-after-read hazards need no cache work.
    if !src.intersects(Af::WRITE_ALL) {
        return actions;
    }
    if src.contains(Af::COLOR_TARGET) {
        actions.coher |= CoherFlags::CB;
    }
    if src.contains(Af::DEPTH_STENCIL_TARGET) {
        actions.coher |= CoherFlags::DB;
    }
    if src.contains(Af::HOST_WRITE) {
        actions.coher |= CoherFlags::L2_INV | CoherFlags::V_CACHE_INV | CoherFlags::K_CACHE_INV;
    }
    if dst.intersects(Af::SHADER_READ | Af::VERTEX_READ | Af::SHADER_WRITE) {
        actions.coher |= CoherFlags::V_CACHE_INV | CoherFlags::K_CACHE_INV;
    }
    if dst.contains(Af::UNIFORM_READ) {
        actions.coher |= CoherFlags::K_CACHE_INV;
    }
    if dst.contains(Af::HOST_READ) {
        actions.coher |= CoherFlags::L2_WB;
    }
    actions
}

/// Cache actions implied by leaving or entering a layout.
pub(crate) fn layout_flush(transition: &pt::ImageTransition) -> CoherFlags {
    use pt::ImageLayout as Il;
    let mut flags = match transition.old_layout {
        Il::ColorTarget => CoherFlags::CB | CoherFlags::V_CACHE_INV,
        Il::DepthStencilTarget => CoherFlags::DB | CoherFlags::V_CACHE_INV,
        Il::General | Il::CopyDst => CoherFlags::V_CACHE_INV,
        Il::Undefined | Il::ShaderRead | Il::CopySrc | Il::Present => CoherFlags::empty(),
    };
    if transition.new_layout == Il::Present {
        flags |= CoherFlags::L2_WB;
    }
    flags
}

/// `TC_OP` code of an atomic and whether it is 64-bit.
pub(crate) fn atomic_op(op: pt::AtomicOp) -> (u32, bool) {
    use pt::AtomicOp as Ao;
    match op {
        Ao::Swap32 => (0x47, false),
        Ao::Add32 => (0x4F, false),
        Ao::Sub32 => (0x50, false),
        Ao::MinU32 => (0x52, false),
        Ao::MaxU32 => (0x54, false),
        Ao::Swap64 => (0x67, true),
        Ao::Add64 => (0x6F, true),
    }
}

/// `SPI_TMPRING_SIZE`/`COMPUTE_TMPRING_SIZE` for a scratch ring.
pub(crate) fn tmpring_size(waves: u32, bytes_per_wave: u32) -> u32 {
    if bytes_per_wave == 0 {
        return 0;
    }
    let kib = (bytes_per_wave + 1023) / 1024;
    (waves.min(0xFFF)) | ((kib & 0x1FFF) << 12)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_math() {
        let vp = pt::Viewport::new(0.0, 0.0, 800.0, 600.0);
        let regs = viewport_transform(&vp);
        assert_eq!(f32::from_bits(regs[0]), 400.0);
        assert_eq!(f32::from_bits(regs[1]), 400.0);
        assert_eq!(f32::from_bits(regs[2]), 300.0);
        assert_eq!(f32::from_bits(regs[3]), 300.0);
        assert_eq!(f32::from_bits(regs[4]), 1.0);
        assert_eq!(f32::from_bits(regs[5]), 0.0);
    }

    #[test]
    fn scissor_is_clamped_to_screen() {
        let words = scissor(&pt::Rect::new(-10, 5, 20000, 10));
        assert_eq!(words[0], 5 << 16);
        assert_eq!(words[1], 16384 | (15 << 16));
    }

    #[test]
    fn read_only_barriers_do_no_cache_work() {
        let actions = barrier_actions(pt::AccessFlags::SHADER_READ, pt::AccessFlags::COPY_DST);
        assert!(actions.coher.is_empty());
        assert_eq!(actions.events.len(), 2);
    }

    #[test]
    fn render_target_to_texture() {
        let actions = barrier_actions(pt::AccessFlags::COLOR_TARGET, pt::AccessFlags::SHADER_READ);
        assert!(actions.coher.contains(CoherFlags::CB | CoherFlags::V_CACHE_INV));
        assert_eq!(&actions.events[..], &[event::PS_PARTIAL_FLUSH]);
        assert!(!actions.pfp_sync);
    }

    #[test]
    fn tmpring_rounds_up_to_kib() {
        assert_eq!(tmpring_size(256, 1500), 256 | (2 << 12));
        assert_eq!(tmpring_size(256, 0), 0);
    }
}
