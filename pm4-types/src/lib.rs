/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/*! This library describes the plain data shared between the PM4 command-stream
 *  core and the API runtime that records into it.
 *  None of these types own GPU memory: buffers and images are descriptions of
 *  memory that the runtime has already allocated and made resident.
 */

#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
)]
#![warn(missing_docs)]

use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Integral type used for GPU virtual addresses.
pub type GpuAddress = u64;
/// Integral type used for kernel fence (timeline) values.
pub type FenceValue = u64;

/// Maximum number of viewports and scissors that can be bound at once.
pub const MAX_VIEWPORTS: usize = 16;
/// Maximum number of simultaneously bound colour targets.
pub const MAX_COLOR_TARGETS: usize = 8;
/// Maximum number of vertex buffer slots.
pub const MAX_VERTEX_BUFFERS: usize = 32;
/// Maximum number of client user-data entries per bind point.
pub const MAX_USER_DATA_ENTRIES: usize = 64;

/// Hardware engine a queue or command buffer targets.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EngineType {
    /// Graphics engine, which also accepts compute work.
    Universal = 0,
    /// Asynchronous compute engine (ACE).
    Compute = 1,
}

/// Which pipeline slot a bind or user-data call refers to.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PipelineBindPoint {
    /// Graphics pipeline slot.
    Graphics = 0,
    /// Compute pipeline slot.
    Compute = 1,
}

/// Hardware generation of the command processor.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GfxIpLevel {
    /// GFX9 family.
    Gfx9,
    /// GFX10 family.
    Gfx10,
}

/// How a full command chunk hands control to its successor.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChainMode {
    /// `INDIRECT_BUFFER` with the chain bit: the command processor jumps to
    /// the next chunk and never comes back.
    Chain,
    /// `INDIRECT_BUFFER` without the chain bit: the next chunk is called and
    /// execution returns to the tail of the calling chunk.
    Call,
}

/// Number of lanes in a shader wave.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WaveSize {
    /// 32 lanes.
    Wave32,
    /// 64 lanes.
    Wave64,
}

impl Default for WaveSize {
    fn default() -> Self {
        Self::Wave64
    }
}

bitflags::bitflags! {
    /// Hardware shader stages enabled by a pipeline.
    #[repr(transparent)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct HwStages: u8 {
        /// Local shader (vertex shader feeding tessellation).
        const LS = 1 << 0;
        /// Hull shader.
        const HS = 1 << 1;
        /// Export shader (vertex or domain shader feeding geometry).
        const ES = 1 << 2;
        /// Geometry shader.
        const GS = 1 << 3;
        /// Hardware vertex shader.
        const VS = 1 << 4;
        /// Pixel shader.
        const PS = 1 << 5;
        /// Compute shader.
        const CS = 1 << 6;
        /// All graphics stages.
        const GRAPHICS = Self::LS.bits | Self::HS.bits | Self::ES.bits
            | Self::GS.bits | Self::VS.bits | Self::PS.bits;
    }
}

/// Primitive assembly mode.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PrimitiveTopology {
    /// Every vertex is a point.
    PointList,
    /// Every two vertices form a line.
    LineList,
    /// Each vertex after the first extends a connected line.
    LineStrip,
    /// Every three vertices form a triangle.
    TriangleList,
    /// Each vertex after the second forms a triangle with the previous two.
    TriangleStrip,
    /// Each vertex after the second forms a triangle with the first and the previous one.
    TriangleFan,
    /// Screen-aligned rectangles given by three corners.
    RectList,
    /// Tessellation patches.
    PatchList {
        /// Number of control points per patch, 1 to 32.
        control_points: u8,
    },
}

impl Default for PrimitiveTopology {
    fn default() -> Self {
        Self::TriangleList
    }
}

/// Format of indices used with an indexed draw.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IndexFormat {
    /// 8-bit indices.
    Uint8,
    /// 16-bit indices.
    Uint16,
    /// 32-bit indices.
    Uint32,
}

impl IndexFormat {
    /// Size of a single index in bytes.
    pub fn byte_size(self) -> u64 {
        match self {
            Self::Uint8 => 1,
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

/// Viewport transform, in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Viewport {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width, must be positive.
    pub width: f32,
    /// Height, may be negative to flip the Y axis.
    pub height: f32,
    /// Depth mapped to normalized device depth 0.
    pub min_depth: f32,
    /// Depth mapped to normalized device depth 1.
    pub max_depth: f32,
}

impl Viewport {
    /// Creates a viewport covering `width` x `height` pixels with the full depth range.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Integer rectangle, used for scissors.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Rect {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Creates a rectangle from its origin and extent.
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// RGBA floating point color.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Color {
    /// Red component.
    pub r: f32,
    /// Green component.
    pub g: f32,
    /// Blue component.
    pub b: f32,
    /// Alpha component.
    pub a: f32,
}

/// A range of GPU memory, owned and kept resident by the client.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Buffer {
    /// GPU virtual address of the first byte.
    pub address: GpuAddress,
    /// Size in bytes.
    pub size: u64,
}

impl Buffer {
    /// Describes `size` bytes of GPU memory at `address`.
    pub fn new(address: GpuAddress, size: u64) -> Self {
        Self { address, size }
    }

    /// Address range covered by the buffer.
    pub fn range(&self) -> Range<GpuAddress> {
        self.address..self.address + self.size
    }

    /// Returns true if `offset..offset + size` lies within the buffer.
    pub fn contains(&self, offset: u64, size: u64) -> bool {
        offset
            .checked_add(size)
            .map_or(false, |end| end <= self.size)
    }
}

/// A vertex buffer bound to a slot.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VertexBufferBinding {
    /// Memory holding the vertices.
    pub buffer: Buffer,
    /// Distance between consecutive elements, in bytes.
    pub stride: u32,
}

/// Extent of an image or a copy region, in texels.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Extent3d {
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
    /// Depth or array layer count.
    pub depth: u32,
}

/// Origin of a copy region, in texels.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Origin3d {
    /// X offset.
    pub x: u32,
    /// Y offset.
    pub y: u32,
    /// Z offset or array layer.
    pub z: u32,
}

/// Memory layout of image texels.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Tiling {
    /// Row-major texels with an explicit row pitch.
    Linear,
    /// Hardware swizzled layout.
    Optimal,
}

/// Texel format of an image.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ImageFormat {
    /// One 8-bit normalized channel.
    R8Unorm,
    /// Four 8-bit normalized channels.
    Rgba8Unorm,
    /// Four 8-bit normalized channels in BGRA order.
    Bgra8Unorm,
    /// Four 16-bit float channels.
    Rgba16Float,
    /// One 32-bit float channel.
    R32Float,
    /// Four 32-bit float channels.
    Rgba32Float,
    /// 16-bit normalized depth.
    Depth16Unorm,
    /// 32-bit float depth.
    Depth32Float,
    /// 32-bit float depth with 8-bit stencil.
    Depth32FloatStencil8,
}

impl ImageFormat {
    /// Size of one texel in bytes. Depth-stencil formats report the depth plane.
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Depth16Unorm => 2,
            Self::Rgba8Unorm | Self::Bgra8Unorm | Self::R32Float => 4,
            Self::Depth32Float | Self::Depth32FloatStencil8 => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    /// Returns true for formats with a depth plane.
    pub fn is_depth(self) -> bool {
        match self {
            Self::Depth16Unorm | Self::Depth32Float | Self::Depth32FloatStencil8 => true,
            _ => false,
        }
    }

    /// Returns true for formats with a stencil plane.
    pub fn has_stencil(self) -> bool {
        self == Self::Depth32FloatStencil8
    }
}

/// Description of an image the client has placed in GPU memory.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Image {
    /// GPU address of texel (0, 0, 0).
    pub address: GpuAddress,
    /// Size of mip level 0.
    pub extent: Extent3d,
    /// Texel format.
    pub format: ImageFormat,
    /// Memory layout.
    pub tiling: Tiling,
    /// Bytes between rows. Only meaningful for linear images.
    pub row_pitch: u32,
    /// Bytes between depth slices or array layers.
    pub slice_pitch: u64,
}

impl Image {
    /// Describes a tightly packed linear image.
    pub fn linear(address: GpuAddress, extent: Extent3d, format: ImageFormat) -> Self {
        let row_pitch = extent.width * format.bytes_per_texel();
        Self {
            address,
            extent,
            format,
            tiling: Tiling::Linear,
            row_pitch,
            slice_pitch: row_pitch as u64 * extent.height as u64,
        }
    }
}

/// A buffer-to-buffer copy region.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BufferCopy {
    /// Offset into the source buffer.
    pub src_offset: u64,
    /// Offset into the destination buffer.
    pub dst_offset: u64,
    /// Number of bytes to copy.
    pub size: u64,
}

/// An image-to-image copy region.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ImageCopy {
    /// Origin in the source image.
    pub src_origin: Origin3d,
    /// Origin in the destination image.
    pub dst_origin: Origin3d,
    /// Size of the region.
    pub extent: Extent3d,
}

bitflags::bitflags! {
    /// Kinds of memory access a barrier orders.
    #[repr(transparent)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct AccessFlags: u32 {
        /// Indirect argument fetch by the command processor.
        const INDIRECT_ARGS = 1 << 0;
        /// Index fetch.
        const INDEX_READ = 1 << 1;
        /// Vertex fetch.
        const VERTEX_READ = 1 << 2;
        /// Constant buffer reads from shaders.
        const UNIFORM_READ = 1 << 3;
        /// Other shader reads.
        const SHADER_READ = 1 << 4;
        /// Shader writes.
        const SHADER_WRITE = 1 << 5;
        /// Colour target reads and writes.
        const COLOR_TARGET = 1 << 6;
        /// Depth-stencil target reads and writes.
        const DEPTH_STENCIL_TARGET = 1 << 7;
        /// Copy source.
        const COPY_SRC = 1 << 8;
        /// Copy destination.
        const COPY_DST = 1 << 9;
        /// Host reads of mapped memory.
        const HOST_READ = 1 << 10;
        /// Host writes of mapped memory.
        const HOST_WRITE = 1 << 11;
        /// Accesses that only read.
        const READ_ALL = Self::INDIRECT_ARGS.bits | Self::INDEX_READ.bits
            | Self::VERTEX_READ.bits | Self::UNIFORM_READ.bits | Self::SHADER_READ.bits
            | Self::COPY_SRC.bits | Self::HOST_READ.bits;
        /// Accesses that may write.
        const WRITE_ALL = Self::SHADER_WRITE.bits | Self::COLOR_TARGET.bits
            | Self::DEPTH_STENCIL_TARGET.bits | Self::COPY_DST.bits | Self::HOST_WRITE.bits;
    }
}

/// How an image is being used, as far as compression and caches are concerned.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ImageLayout {
    /// Contents are discarded.
    Undefined,
    /// Any access, no compression.
    General,
    /// Bound as a colour target, compressed.
    ColorTarget,
    /// Bound as a depth-stencil target, compressed.
    DepthStencilTarget,
    /// Read by shaders.
    ShaderRead,
    /// Source of a copy.
    CopySrc,
    /// Destination of a copy.
    CopyDst,
    /// Handed to the presentation engine.
    Present,
}

/// A layout change of one image, recorded as part of a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ImageTransition {
    /// The image changing layout.
    pub image: Image,
    /// Layout before the barrier.
    pub old_layout: ImageLayout,
    /// Layout after the barrier.
    pub new_layout: ImageLayout,
}

/// Pipeline point at which a timestamp is captured.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TimestampPoint {
    /// As soon as the command processor reaches the command.
    Top,
    /// Once all prior work has completed.
    Bottom,
}

/// Memory atomic operations.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AtomicOp {
    /// 32-bit wrapping add.
    Add32,
    /// 32-bit wrapping subtract.
    Sub32,
    /// 32-bit unsigned minimum.
    MinU32,
    /// 32-bit unsigned maximum.
    MaxU32,
    /// 32-bit exchange.
    Swap32,
    /// 64-bit wrapping add.
    Add64,
    /// 64-bit exchange.
    Swap64,
}

/// Sizes of the shader rings a pipeline needs or a queue provides.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RingSizes {
    /// Scratch (private memory) bytes per wave.
    pub scratch_bytes_per_wave: u32,
    /// Geometry shader ring size in bytes.
    pub gs_ring_bytes: u64,
    /// Tessellation factor ring size in bytes.
    pub tf_ring_bytes: u64,
}

impl RingSizes {
    /// Component-wise maximum.
    pub fn max(self, other: Self) -> Self {
        Self {
            scratch_bytes_per_wave: self.scratch_bytes_per_wave.max(other.scratch_bytes_per_wave),
            gs_ring_bytes: self.gs_ring_bytes.max(other.gs_ring_bytes),
            tf_ring_bytes: self.tf_ring_bytes.max(other.tf_ring_bytes),
        }
    }

    /// Returns true if any ring of `self` is larger than the same ring of `current`.
    pub fn exceeds(&self, current: &Self) -> bool {
        self.scratch_bytes_per_wave > current.scratch_bytes_per_wave
            || self.gs_ring_bytes > current.gs_ring_bytes
            || self.tf_ring_bytes > current.tf_ring_bytes
    }

    /// Returns true if no ring is needed.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Read-only configuration installed when a device is created.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Settings {
    /// Hardware generation.
    pub gfx_ip: GfxIpLevel,
    /// Size of a command chunk in dwords.
    pub chunk_dwords: u32,
    /// Size of an embedded-data chunk in dwords.
    pub embedded_chunk_dwords: u32,
    /// How full chunks are linked to their successor.
    pub chain_mode: ChainMode,
    /// Whether submitted and chained indirect buffers may be preempted.
    pub preemptible_ibs: bool,
    /// Ring set allocated when a queue is created.
    pub initial_rings: RingSizes,
    /// Number of waves the scratch ring is sized for.
    pub max_scratch_waves: u32,
    /// Upper bound on fast user-data entries per stage. Zero means no cap
    /// beyond the hardware SGPR budget.
    pub fast_user_data_limit: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gfx_ip: GfxIpLevel::Gfx10,
            chunk_dwords: 16 * 1024,
            embedded_chunk_dwords: 4 * 1024,
            chain_mode: ChainMode::Chain,
            preemptible_ibs: true,
            initial_rings: RingSizes {
                scratch_bytes_per_wave: 1024,
                gs_ring_bytes: 0,
                tf_ring_bytes: 0,
            },
            max_scratch_waves: 256,
            fast_user_data_limit: 0,
        }
    }
}

impl Settings {
    /// Smallest chunk the stream builder can work with.
    pub const MIN_CHUNK_DWORDS: u32 = 256;

    /// Checks that the settings describe a usable configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.chunk_dwords < Self::MIN_CHUNK_DWORDS {
            return Err("chunk_dwords is smaller than the minimum chunk size");
        }
        if self.embedded_chunk_dwords < Self::MIN_CHUNK_DWORDS {
            return Err("embedded_chunk_dwords is smaller than the minimum chunk size");
        }
        if self.max_scratch_waves == 0 {
            return Err("max_scratch_waves must not be zero");
        }
        Ok(())
    }
}

#[test]
fn test_default_settings_are_valid() {
    assert_eq!(Settings::default().validate(), Ok(()));
}

#[test]
fn test_ring_sizes_exceed() {
    let current = RingSizes {
        scratch_bytes_per_wave: 1024,
        gs_ring_bytes: 0,
        tf_ring_bytes: 4096,
    };
    let mut required = current;
    assert!(!required.exceeds(&current));
    required.scratch_bytes_per_wave = 4096;
    assert!(required.exceeds(&current));
    assert_eq!(current.max(required).tf_ring_bytes, 4096);
}
