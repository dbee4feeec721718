/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Dword register offsets shared by GFX9 and GFX10.
//!
//! Registers whose location differs between generations are reached
//! through [`crate::hw::HwTable`] instead.

use std::ops::Range;

use crate::packet::op;

/// The three register spaces reachable with `SET_*_REG` packets.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum RegSpace {
    Context,
    Sh,
    UConfig,
}

impl RegSpace {
    pub fn base(self) -> u32 {
        match self {
            Self::Context => 0xA000,
            Self::Sh => 0x2C00,
            Self::UConfig => 0xC000,
        }
    }

    pub fn range(self) -> Range<u32> {
        match self {
            Self::Context => 0xA000..0xA400,
            Self::Sh => 0x2C00..0x3000,
            Self::UConfig => 0xC000..0x1_0000,
        }
    }

    pub fn set_opcode(self) -> u8 {
        match self {
            Self::Context => op::SET_CONTEXT_REG,
            Self::Sh => op::SET_SH_REG,
            Self::UConfig => op::SET_UCONFIG_REG,
        }
    }

    pub fn from_set_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            op::SET_CONTEXT_REG => Some(Self::Context),
            op::SET_SH_REG => Some(Self::Sh),
            op::SET_UCONFIG_REG => Some(Self::UConfig),
            _ => None,
        }
    }

    pub fn of(reg: u32) -> Option<Self> {
        [Self::Context, Self::Sh, Self::UConfig]
            .iter()
            .copied()
            .find(|space| space.range().contains(&reg))
    }

    pub fn contains(self, reg: u32) -> bool {
        self.range().contains(&reg)
    }
}

// Context registers.
pub const DB_DEPTH_BOUNDS_MIN: u32 = 0xA008;
pub const DB_DEPTH_BOUNDS_MAX: u32 = 0xA009;
pub const DB_Z_INFO: u32 = 0xA010;
pub const DB_STENCIL_INFO: u32 = 0xA011;
pub const DB_Z_READ_BASE: u32 = 0xA012;
pub const DB_STENCIL_READ_BASE: u32 = 0xA013;
pub const DB_Z_WRITE_BASE: u32 = 0xA014;
pub const DB_STENCIL_WRITE_BASE: u32 = 0xA015;
pub const PA_SC_WINDOW_SCISSOR_TL: u32 = 0xA081;
pub const PA_SC_WINDOW_SCISSOR_BR: u32 = 0xA082;
pub const CB_TARGET_MASK: u32 = 0xA08E;
pub const PA_SC_VPORT_SCISSOR_0_TL: u32 = 0xA094;
pub const PA_SC_VPORT_ZMIN_0: u32 = 0xA0B4;
pub const CB_BLEND_RED: u32 = 0xA105;
pub const DB_STENCILREFMASK: u32 = 0xA10C;
pub const DB_STENCILREFMASK_BF: u32 = 0xA10D;
pub const PA_CL_VPORT_XSCALE: u32 = 0xA10F;
pub const SPI_TMPRING_SIZE: u32 = 0xA1BA;
pub const VGT_SHADER_STAGES_EN: u32 = 0xA2D5;
pub const VGT_LS_HS_CONFIG: u32 = 0xA2D6;
pub const CB_COLOR0_BASE: u32 = 0xA318;
pub const CB_COLOR_STRIDE: u32 = 0xF;
pub const CB_COLOR_BASE_EXT: u32 = 1;
pub const CB_COLOR_PITCH: u32 = 3;
pub const CB_COLOR_INFO: u32 = 4;

/// Dwords per viewport in the `PA_CL_VPORT_*` block.
pub const VPORT_STRIDE: u32 = 6;

// SH registers.
pub const SPI_SHADER_USER_DATA_PS_0: u32 = 0x2C0C;
pub const SPI_SHADER_USER_DATA_VS_0: u32 = 0x2C4C;
pub const SPI_SHADER_USER_DATA_GS_0: u32 = 0x2C8C;
pub const SPI_SHADER_USER_DATA_ES_0: u32 = 0x2CCC;
pub const SPI_SHADER_USER_DATA_HS_0: u32 = 0x2D0C;
pub const SPI_SHADER_USER_DATA_LS_0: u32 = 0x2D4C;
pub const COMPUTE_NUM_THREAD_X: u32 = 0x2E07;
pub const COMPUTE_TMPRING_SIZE: u32 = 0x2E18;
pub const COMPUTE_USER_DATA_0: u32 = 0x2E40;

// User config registers.
pub const VGT_ESGS_RING_SIZE: u32 = 0xC240;
pub const VGT_GSVS_RING_SIZE: u32 = 0xC241;
pub const VGT_PRIMITIVE_TYPE: u32 = 0xC242;
pub const VGT_INDEX_TYPE: u32 = 0xC243;
pub const VGT_TF_RING_SIZE: u32 = 0xC24E;
pub const VGT_HS_OFFCHIP_PARAM: u32 = 0xC24F;
pub const VGT_TF_MEMORY_BASE: u32 = 0xC250;

/// SGPR slots within a 16-entry user-data bank.
pub mod user_data {
    pub const BANK_SIZE: u32 = 16;
    pub const RING_TABLE: u32 = 0;
    pub const SPILL_TABLE: u32 = 2;
    pub const VERTEX_BUFFER_TABLE: u32 = 4;
    pub const BASE_VERTEX: u32 = 6;
    pub const BASE_INSTANCE: u32 = 7;
    /// First client entry of a graphics bank.
    pub const GRAPHICS_CLIENT: u32 = 8;
    /// First client entry of the compute bank.
    pub const COMPUTE_CLIENT: u32 = 4;
}

/// `EVENT_WRITE`/`RELEASE_MEM` event types and indices.
pub mod event {
    pub const CACHE_FLUSH_AND_INV_TS: u32 = 0x14;
    pub const VS_PARTIAL_FLUSH: u32 = 0x0F;
    pub const PS_PARTIAL_FLUSH: u32 = 0x10;
    pub const CS_PARTIAL_FLUSH: u32 = 0x07;
    pub const BOTTOM_OF_PIPE_TS: u32 = 0x28;
    pub const CS_DONE: u32 = 0x2F;

    pub const INDEX_PARTIAL_FLUSH: u32 = 4;
    pub const INDEX_END_OF_PIPE: u32 = 5;
}

#[test]
fn spaces_partition_known_registers() {
    assert_eq!(RegSpace::of(CB_TARGET_MASK), Some(RegSpace::Context));
    assert_eq!(RegSpace::of(COMPUTE_USER_DATA_0), Some(RegSpace::Sh));
    assert_eq!(RegSpace::of(VGT_INDEX_TYPE), Some(RegSpace::UConfig));
    assert_eq!(RegSpace::of(0x1000), None);
}
