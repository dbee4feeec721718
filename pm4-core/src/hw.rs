/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Per-generation capability tables.
//!
//! A device picks one [`HwTable`] at construction from
//! [`pt::Settings::gfx_ip`] and every generation-dependent encoding goes
//! through it.

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::{
    packet::{op, Header, HeaderFlags},
    regs,
};

bitflags! {
    /// Cache actions requested by an acquire or a release.
    #[repr(transparent)]
    #[derive(Default)]
    pub struct CoherFlags: u32 {
        /// Flush and invalidate colour block caches.
        const CB = 1 << 0;
        /// Flush and invalidate depth block caches.
        const DB = 1 << 1;
        /// Invalidate the scalar (constant) cache.
        const K_CACHE_INV = 1 << 2;
        /// Invalidate the instruction cache.
        const I_CACHE_INV = 1 << 3;
        /// Invalidate the vector L0/L1 caches.
        const V_CACHE_INV = 1 << 4;
        /// Invalidate L2.
        const L2_INV = 1 << 5;
        /// Write back L2.
        const L2_WB = 1 << 6;
    }
}

/// Largest packet produced by the generation-specific builders.
pub type PacketWords = ArrayVec<u32, 8>;

/// User-data bank register of each hardware stage.
#[derive(Clone, Copy, Debug)]
pub struct UserDataBanks {
    pub ls: u32,
    pub hs: u32,
    pub es: u32,
    pub gs: u32,
    pub vs: u32,
    pub ps: u32,
    pub cs: u32,
}

pub struct HwTable {
    pub level: pt::GfxIpLevel,
    /// Command chunks and IB sizes are padded to this many dwords.
    pub ib_align_dwords: u32,
    pub user_data: UserDataBanks,
    pub tf_memory_base_hi: u32,
    /// Builds a full `ACQUIRE_MEM` packet over `[base, base + size)`.
    pub acquire_mem: fn(CoherFlags, pt::GpuAddress, u64) -> PacketWords,
    /// Cache-action bits merged into the `RELEASE_MEM` event control dword.
    pub release_cache_bits: fn(CoherFlags) -> u32,
    pub dispatch_initiator: fn(pt::WaveSize) -> u32,
    pub shader_stages_en: fn(pt::HwStages, pt::WaveSize) -> u32,
}

impl std::fmt::Debug for HwTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwTable").field("level", &self.level).finish()
    }
}

impl HwTable {
    pub fn get(level: pt::GfxIpLevel) -> &'static Self {
        match level {
            pt::GfxIpLevel::Gfx9 => &GFX9,
            pt::GfxIpLevel::Gfx10 => &GFX10,
        }
    }

    pub fn user_data_bank(&self, stage: pt::HwStages) -> Option<u32> {
        let banks = &self.user_data;
        let table = [
            (pt::HwStages::LS, banks.ls),
            (pt::HwStages::HS, banks.hs),
            (pt::HwStages::ES, banks.es),
            (pt::HwStages::GS, banks.gs),
            (pt::HwStages::VS, banks.vs),
            (pt::HwStages::PS, banks.ps),
            (pt::HwStages::CS, banks.cs),
        ];
        table
            .iter()
            .find(|&&(s, _)| s == stage)
            .map(|&(_, bank)| bank)
    }

    /// Distinct user-data banks of the enabled stages, in register order.
    pub fn user_data_banks(&self, stages: pt::HwStages) -> ArrayVec<u32, 7> {
        let mut banks = ArrayVec::<u32, 7>::new();
        for bit in 0..7 {
            let stage = pt::HwStages::from_bits_truncate(1 << bit);
            if !stages.contains(stage) {
                continue;
            }
            if let Some(bank) = self.user_data_bank(stage) {
                if !banks.contains(&bank) {
                    banks.push(bank);
                }
            }
        }
        banks.sort_unstable();
        banks
    }

    /// Bank of the stage that runs the vertex shader for this stage mix.
    pub fn vertex_fetch_bank(&self, stages: pt::HwStages) -> u32 {
        if stages.intersects(pt::HwStages::LS | pt::HwStages::HS) {
            self.user_data.ls
        } else if stages.intersects(pt::HwStages::ES | pt::HwStages::GS) {
            self.user_data.es
        } else {
            self.user_data.vs
        }
    }

    /// Every bank the queue programs with the ring table pointer.
    pub fn all_banks(&self) -> ArrayVec<u32, 7> {
        self.user_data_banks(pt::HwStages::all())
    }
}

// CP_COHER_CNTL
const COHER_TC_WB_ACTION_ENA: u32 = 1 << 18;
const COHER_TCL1_ACTION_ENA: u32 = 1 << 22;
const COHER_TC_ACTION_ENA: u32 = 1 << 23;
const COHER_CB_ACTION_ENA: u32 = 1 << 25;
const COHER_DB_ACTION_ENA: u32 = 1 << 26;
const COHER_SH_KCACHE_ACTION_ENA: u32 = 1 << 27;
const COHER_SH_ICACHE_ACTION_ENA: u32 = 1 << 29;
const COHER_CB_DB_DEST_BASE_ENA: u32 = (1 << 6) | (1 << 14);

// GCR_CNTL
const GCR_GLI_INV: u32 = 1;
const GCR_GLK_INV: u32 = 1 << 7;
const GCR_GLV_INV: u32 = 1 << 8;
const GCR_GL1_INV: u32 = 1 << 9;
const GCR_GL2_INV: u32 = 1 << 14;
const GCR_GL2_WB: u32 = 1 << 15;

const POLL_INTERVAL: u32 = 10;

fn coher_size_fields(base: pt::GpuAddress, size: u64) -> [u32; 4] {
    // Sizes are in 256 byte units, all ones meaning "everything".
    let (size_lo, size_hi) = if size == u64::MAX {
        (0xFFFF_FFFF, 0xFF)
    } else {
        let units = (size + 255) >> 8;
        (units as u32, ((units >> 32) & 0xFF) as u32)
    };
    [size_lo, size_hi, (base >> 8) as u32, ((base >> 40) & 0xFF_FFFF) as u32]
}

fn gfx9_cp_coher_cntl(flags: CoherFlags) -> u32 {
    let mut cntl = 0;
    if flags.contains(CoherFlags::CB) {
        cntl |= COHER_CB_ACTION_ENA | COHER_CB_DB_DEST_BASE_ENA;
    }
    if flags.contains(CoherFlags::DB) {
        cntl |= COHER_DB_ACTION_ENA | COHER_CB_DB_DEST_BASE_ENA;
    }
    if flags.contains(CoherFlags::K_CACHE_INV) {
        cntl |= COHER_SH_KCACHE_ACTION_ENA;
    }
    if flags.contains(CoherFlags::I_CACHE_INV) {
        cntl |= COHER_SH_ICACHE_ACTION_ENA;
    }
    if flags.contains(CoherFlags::V_CACHE_INV) {
        cntl |= COHER_TCL1_ACTION_ENA;
    }
    if flags.contains(CoherFlags::L2_INV) {
        cntl |= COHER_TC_ACTION_ENA;
    }
    if flags.contains(CoherFlags::L2_WB) {
        cntl |= COHER_TC_WB_ACTION_ENA;
    }
    cntl
}

fn gfx9_acquire_mem(flags: CoherFlags, base: pt::GpuAddress, size: u64) -> PacketWords {
    let [size_lo, size_hi, base_lo, base_hi] = coher_size_fields(base, size);
    let mut packet = PacketWords::new();
    packet.push(Header::type3(op::ACQUIRE_MEM, 6, HeaderFlags::empty()).0);
    packet.push(gfx9_cp_coher_cntl(flags));
    packet.push(size_lo);
    packet.push(size_hi);
    packet.push(base_lo);
    packet.push(base_hi);
    packet.push(POLL_INTERVAL);
    packet
}

fn gfx9_release_cache_bits(flags: CoherFlags) -> u32 {
    let mut bits = 0;
    if flags.contains(CoherFlags::V_CACHE_INV) {
        bits |= 1 << 16;
    }
    if flags.contains(CoherFlags::L2_INV) {
        bits |= 1 << 17;
    }
    if flags.contains(CoherFlags::L2_WB) {
        bits |= 1 << 15;
    }
    bits
}

fn gfx9_dispatch_initiator(_wave: pt::WaveSize) -> u32 {
    // COMPUTE_SHADER_EN | FORCE_START_AT_000 | ORDER_MODE
    1 | (1 << 2) | (1 << 3)
}

fn gfx9_shader_stages_en(stages: pt::HwStages, _wave: pt::WaveSize) -> u32 {
    let mut en = 0;
    if stages.contains(pt::HwStages::HS) {
        en |= 1 << 2 | 1 << 4; // LS_EN, HS_EN
    }
    if stages.contains(pt::HwStages::GS) {
        en |= 2 << 5 | 1 << 7; // ES_EN on real ES, GS_EN
    }
    if stages.contains(pt::HwStages::GS) || stages.contains(pt::HwStages::HS) {
        en |= 1 << 21; // MAX_PRIMGRP_IN_WAVE
    }
    en
}

fn gfx10_gcr_cntl(flags: CoherFlags) -> u32 {
    let mut gcr = 0;
    if flags.contains(CoherFlags::I_CACHE_INV) {
        gcr |= GCR_GLI_INV;
    }
    if flags.contains(CoherFlags::K_CACHE_INV) {
        gcr |= GCR_GLK_INV;
    }
    if flags.contains(CoherFlags::V_CACHE_INV) {
        gcr |= GCR_GLV_INV | GCR_GL1_INV;
    }
    if flags.contains(CoherFlags::L2_INV) {
        gcr |= GCR_GL2_INV;
    }
    if flags.contains(CoherFlags::L2_WB) {
        gcr |= GCR_GL2_WB;
    }
    gcr
}

fn gfx10_acquire_mem(flags: CoherFlags, base: pt::GpuAddress, size: u64) -> PacketWords {
    let [size_lo, size_hi, base_lo, base_hi] = coher_size_fields(base, size);
    // Only the CB/DB actions remain in CP_COHER_CNTL.
    let coher = gfx9_cp_coher_cntl(flags & (CoherFlags::CB | CoherFlags::DB));
    let mut packet = PacketWords::new();
    packet.push(Header::type3(op::ACQUIRE_MEM, 7, HeaderFlags::empty()).0);
    packet.push(coher);
    packet.push(size_lo);
    packet.push(size_hi);
    packet.push(base_lo);
    packet.push(base_hi);
    packet.push(POLL_INTERVAL);
    packet.push(gfx10_gcr_cntl(flags));
    packet
}

fn gfx10_release_cache_bits(flags: CoherFlags) -> u32 {
    // GCR_CNTL lives in bits 12..24 of the event control dword.
    let gcr = gfx10_gcr_cntl(flags & !(CoherFlags::CB | CoherFlags::DB));
    (gcr & 0x1FFF) << 12
}

fn gfx10_dispatch_initiator(wave: pt::WaveSize) -> u32 {
    let mut initiator = gfx9_dispatch_initiator(wave);
    if wave == pt::WaveSize::Wave32 {
        initiator |= 1 << 15; // CS_W32_EN
    }
    initiator
}

fn gfx10_shader_stages_en(stages: pt::HwStages, wave: pt::WaveSize) -> u32 {
    let mut en = gfx9_shader_stages_en(stages, wave);
    if !stages.intersects(pt::HwStages::HS | pt::HwStages::GS) {
        en |= 1 << 7 | 1 << 24; // GS_EN, PRIMGEN_EN: vertex shaders run as NGG
    }
    if wave == pt::WaveSize::Wave32 {
        en |= 1 << 23 | 1 << 22; // VS_W32_EN, GS_W32_EN
    }
    en
}

pub static GFX9: HwTable = HwTable {
    level: pt::GfxIpLevel::Gfx9,
    ib_align_dwords: 8,
    user_data: UserDataBanks {
        // LS/HS and ES/GS are merged; the merged stages read the LS and ES banks.
        ls: regs::SPI_SHADER_USER_DATA_LS_0,
        hs: regs::SPI_SHADER_USER_DATA_LS_0,
        es: regs::SPI_SHADER_USER_DATA_ES_0,
        gs: regs::SPI_SHADER_USER_DATA_ES_0,
        vs: regs::SPI_SHADER_USER_DATA_VS_0,
        ps: regs::SPI_SHADER_USER_DATA_PS_0,
        cs: regs::COMPUTE_USER_DATA_0,
    },
    tf_memory_base_hi: 0xC251,
    acquire_mem: gfx9_acquire_mem,
    release_cache_bits: gfx9_release_cache_bits,
    dispatch_initiator: gfx9_dispatch_initiator,
    shader_stages_en: gfx9_shader_stages_en,
};

pub static GFX10: HwTable = HwTable {
    level: pt::GfxIpLevel::Gfx10,
    ib_align_dwords: 8,
    user_data: UserDataBanks {
        ls: regs::SPI_SHADER_USER_DATA_HS_0,
        hs: regs::SPI_SHADER_USER_DATA_HS_0,
        es: regs::SPI_SHADER_USER_DATA_GS_0,
        gs: regs::SPI_SHADER_USER_DATA_GS_0,
        vs: regs::SPI_SHADER_USER_DATA_GS_0,
        ps: regs::SPI_SHADER_USER_DATA_PS_0,
        cs: regs::COMPUTE_USER_DATA_0,
    },
    tf_memory_base_hi: 0xC261,
    acquire_mem: gfx10_acquire_mem,
    release_cache_bits: gfx10_release_cache_bits,
    dispatch_initiator: gfx10_dispatch_initiator,
    shader_stages_en: gfx10_shader_stages_en,
};

/// Builds a raw buffer resource descriptor.
pub fn buffer_srd(address: pt::GpuAddress, size: u64, stride: u32) -> [u32; 4] {
    let num_records = if stride == 0 {
        size
    } else {
        size / u64::from(stride)
    };
    [
        address as u32,
        ((address >> 32) as u32 & 0xFFFF) | ((stride & 0x3FFF) << 16),
        num_records.min(u64::from(u32::MAX)) as u32,
        // DST_SEL_XYZW, 32-bit float format
        0x0002_7FAC,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packets;

    #[test]
    fn acquire_mem_size_differs_per_generation() {
        let flags = CoherFlags::K_CACHE_INV | CoherFlags::V_CACHE_INV;
        let gfx9 = (GFX9.acquire_mem)(flags, 0, u64::MAX);
        let gfx10 = (GFX10.acquire_mem)(flags, 0, u64::MAX);
        assert_eq!(gfx9.len(), 7);
        assert_eq!(gfx10.len(), 8);
        for words in [&gfx9[..], &gfx10[..]].iter() {
            let packet = Packets::new(words).next().unwrap().unwrap();
            assert_eq!(packet.opcode(), op::ACQUIRE_MEM);
            assert_eq!(packet.len(), words.len());
        }
        assert_ne!(gfx10[7] & GCR_GLK_INV, 0);
        assert_ne!(gfx9[1] & COHER_SH_KCACHE_ACTION_ENA, 0);
    }

    #[test]
    fn merged_stage_banks() {
        let tess = pt::HwStages::LS | pt::HwStages::HS | pt::HwStages::VS | pt::HwStages::PS;
        assert_eq!(GFX9.vertex_fetch_bank(tess), regs::SPI_SHADER_USER_DATA_LS_0);
        assert_eq!(GFX10.vertex_fetch_bank(tess), regs::SPI_SHADER_USER_DATA_HS_0);
        assert_eq!(
            GFX10.vertex_fetch_bank(pt::HwStages::VS | pt::HwStages::PS),
            regs::SPI_SHADER_USER_DATA_GS_0
        );
        let banks = GFX9.user_data_banks(pt::HwStages::LS | pt::HwStages::HS);
        assert_eq!(&banks[..], &[regs::SPI_SHADER_USER_DATA_LS_0]);
    }

    #[test]
    fn wave32_dispatch_only_on_gfx10() {
        let w32 = pt::WaveSize::Wave32;
        assert_eq!((GFX9.dispatch_initiator)(w32) & (1 << 15), 0);
        assert_ne!((GFX10.dispatch_initiator)(w32) & (1 << 15), 0);
    }
}
