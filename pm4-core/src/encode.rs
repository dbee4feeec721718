/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Packet builders.
//!
//! Every builder reserves exactly the dwords of its packet from a
//! [`CmdSink`], writes the header and the operands and commits. Builders
//! never look at register state; filtering is the caller's business.

use smallvec::SmallVec;

use crate::{
    hw::{CoherFlags, HwTable},
    packet::{op, CmdSink, Header, HeaderFlags, Packets, MAX_BODY_DWORDS, NOP_1DW},
    regs::RegSpace,
    CommandError,
};

/// Size of an `INDIRECT_BUFFER` packet, used for chaining.
pub const CHAIN_DWORDS: u32 = 4;
pub const IB_SIZE_MASK: u32 = 0xF_FFFF;
pub const IB_CHAIN: u32 = 1 << 20;
pub const IB_PRE_ENA: u32 = 1 << 21;
pub const IB_VALID: u32 = 1 << 23;

/// Largest byte count of a single `DMA_DATA`.
pub const DMA_MAX_BYTES: u64 = (1 << 26) - 4;

/// `SET_BASE` slot used by indirect draws and dispatches.
pub const BASE_INDEX_INDIRECT: u32 = 1;

const DI_SRC_SEL_DMA: u32 = 0;
const DI_SRC_SEL_AUTO_INDEX: u32 = 2;
const POLL_INTERVAL: u32 = 10;

fn header(opcode: u8, body_dwords: u32, flags: HeaderFlags) -> u32 {
    Header::type3(opcode, body_dwords, flags).0
}

fn lo(addr: u64) -> u32 {
    addr as u32
}

fn hi(addr: u64) -> u32 {
    (addr >> 32) as u32
}

fn check_aligned(addr: u64, align: u64) -> Result<(), CommandError> {
    if addr % align != 0 {
        Err(CommandError::InvalidArgument("address is not sufficiently aligned"))
    } else {
        Ok(())
    }
}

/// Fills `out` with a single NOP packet covering all of it.
pub fn write_nop(out: &mut [u32]) {
    match out.len() {
        0 => {}
        1 => out[0] = NOP_1DW,
        n => {
            out[0] = header(op::NOP, n as u32 - 1, HeaderFlags::empty());
            for word in out[1..].iter_mut() {
                *word = 0;
            }
        }
    }
}

pub fn nop<S: CmdSink>(sink: &mut S, dwords: u32) -> Result<(), CommandError> {
    let mut remaining = dwords;
    while remaining != 0 {
        let piece = remaining.min(MAX_BODY_DWORDS + 1);
        sink.emit(piece, write_nop)?;
        remaining -= piece;
    }
    Ok(())
}

fn register_flags(space: RegSpace, reg: u32) -> HeaderFlags {
    if space == RegSpace::Sh && (0x2E00..0x2E80).contains(&reg) {
        HeaderFlags::SHADER_COMPUTE
    } else {
        HeaderFlags::empty()
    }
}

/// Writes consecutive registers starting at `base`, splitting long runs.
pub fn set_regs<S: CmdSink>(sink: &mut S, base: u32, values: &[u32]) -> Result<(), CommandError> {
    if values.is_empty() {
        return Ok(());
    }
    let space = RegSpace::of(base)
        .ok_or(CommandError::InvalidArgument("register outside the settable spaces"))?;
    if !space.contains(base + values.len() as u32 - 1) {
        return Err(CommandError::InvalidArgument("register run crosses its space"));
    }
    let per_packet = (MAX_BODY_DWORDS - 1) as usize;
    for (i, piece) in values.chunks(per_packet).enumerate() {
        let reg = base + (i * per_packet) as u32;
        let body = 1 + piece.len() as u32;
        log::trace!("{:?} reg {:#x} x{}", space, reg, piece.len());
        sink.emit(body + 1, |out| {
            out[0] = header(space.set_opcode(), body, register_flags(space, reg));
            out[1] = reg - space.base();
            out[2..].copy_from_slice(piece);
        })?;
    }
    Ok(())
}

fn set_regs_in<S: CmdSink>(
    sink: &mut S,
    space: RegSpace,
    base: u32,
    values: &[u32],
) -> Result<(), CommandError> {
    if !space.contains(base) {
        return Err(CommandError::InvalidArgument("register is in a different space"));
    }
    set_regs(sink, base, values)
}

pub fn set_context_reg<S: CmdSink>(sink: &mut S, reg: u32, value: u32) -> Result<(), CommandError> {
    set_regs_in(sink, RegSpace::Context, reg, &[value])
}

pub fn set_context_regs<S: CmdSink>(
    sink: &mut S,
    base: u32,
    values: &[u32],
) -> Result<(), CommandError> {
    set_regs_in(sink, RegSpace::Context, base, values)
}

pub fn set_sh_reg<S: CmdSink>(sink: &mut S, reg: u32, value: u32) -> Result<(), CommandError> {
    set_regs_in(sink, RegSpace::Sh, reg, &[value])
}

pub fn set_sh_regs<S: CmdSink>(sink: &mut S, base: u32, values: &[u32]) -> Result<(), CommandError> {
    set_regs_in(sink, RegSpace::Sh, base, values)
}

pub fn set_uconfig_reg<S: CmdSink>(sink: &mut S, reg: u32, value: u32) -> Result<(), CommandError> {
    set_regs_in(sink, RegSpace::UConfig, reg, &[value])
}

/// Writes sorted `(register, value)` pairs, one packet per run of
/// consecutive registers in the same space.
pub fn set_regs_coalesced<S: CmdSink>(
    sink: &mut S,
    pairs: &[(u32, u32)],
) -> Result<(), CommandError> {
    let mut run = SmallVec::<[u32; 32]>::new();
    let mut run_base = 0;
    for &(reg, value) in pairs {
        let extends = !run.is_empty()
            && reg == run_base + run.len() as u32
            && RegSpace::of(reg) == RegSpace::of(run_base);
        if !extends {
            set_regs(sink, run_base, &run)?;
            run.clear();
            run_base = reg;
        }
        run.push(value);
    }
    set_regs(sink, run_base, &run)
}

pub fn event_write<S: CmdSink>(sink: &mut S, event: u32, index: u32) -> Result<(), CommandError> {
    sink.emit(2, |out| {
        out[0] = header(op::EVENT_WRITE, 1, HeaderFlags::empty());
        out[1] = (event & 0x3F) | (index << 8);
    })
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareFunc {
    Always = 0,
    Less = 1,
    LessEqual = 2,
    Equal = 3,
    NotEqual = 4,
    GreaterEqual = 5,
    Greater = 6,
}

/// Which micro engine performs a wait.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitEngine {
    Me = 0,
    Pfp = 1,
}

fn wait_control(func: CompareFunc, engine: WaitEngine) -> u32 {
    // MEM_SPACE = memory
    func as u32 | (1 << 4) | ((engine as u32) << 8)
}

pub fn wait_reg_mem<S: CmdSink>(
    sink: &mut S,
    func: CompareFunc,
    addr: pt::GpuAddress,
    reference: u32,
    mask: u32,
    engine: WaitEngine,
) -> Result<(), CommandError> {
    check_aligned(addr, 4)?;
    sink.emit(7, |out| {
        out[0] = header(op::WAIT_REG_MEM, 6, HeaderFlags::empty());
        out[1] = wait_control(func, engine);
        out[2] = lo(addr);
        out[3] = hi(addr);
        out[4] = reference;
        out[5] = mask;
        out[6] = POLL_INTERVAL;
    })
}

pub fn wait_reg_mem64<S: CmdSink>(
    sink: &mut S,
    func: CompareFunc,
    addr: pt::GpuAddress,
    reference: u64,
    mask: u64,
    engine: WaitEngine,
) -> Result<(), CommandError> {
    check_aligned(addr, 8)?;
    sink.emit(9, |out| {
        out[0] = header(op::WAIT_REG_MEM64, 8, HeaderFlags::empty());
        out[1] = wait_control(func, engine);
        out[2] = lo(addr);
        out[3] = hi(addr);
        out[4] = lo(reference);
        out[5] = hi(reference);
        out[6] = lo(mask);
        out[7] = hi(mask);
        out[8] = POLL_INTERVAL;
    })
}

const WRITE_DATA_DST_MEMORY: u32 = 5 << 8;
const WRITE_DATA_WR_CONFIRM: u32 = 1 << 20;

/// Writes `values` to memory at `dst` through the micro engine.
pub fn write_data<S: CmdSink>(
    sink: &mut S,
    dst: pt::GpuAddress,
    values: &[u32],
) -> Result<(), CommandError> {
    check_aligned(dst, 4)?;
    let per_packet = (MAX_BODY_DWORDS - 3) as usize;
    for (i, piece) in values.chunks(per_packet).enumerate() {
        let addr = dst + (i * per_packet * 4) as u64;
        let body = 3 + piece.len() as u32;
        sink.emit(body + 1, |out| {
            out[0] = header(op::WRITE_DATA, body, HeaderFlags::empty());
            out[1] = WRITE_DATA_DST_MEMORY | WRITE_DATA_WR_CONFIRM;
            out[2] = lo(addr);
            out[3] = hi(addr);
            out[4..].copy_from_slice(piece);
        })?;
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopySource {
    Memory(pt::GpuAddress),
    GpuClock,
    Immediate(u64),
}

/// Copies one or two dwords to memory at `dst`.
pub fn copy_data<S: CmdSink>(
    sink: &mut S,
    src: CopySource,
    dst: pt::GpuAddress,
    wide: bool,
) -> Result<(), CommandError> {
    check_aligned(dst, if wide { 8 } else { 4 })?;
    let (src_sel, src_lo, src_hi) = match src {
        CopySource::Memory(addr) => (2, lo(addr), hi(addr)),
        CopySource::Immediate(value) => (5, lo(value), hi(value)),
        CopySource::GpuClock => (9, 0, 0),
    };
    let count_sel = if wide { 1 << 16 } else { 0 };
    sink.emit(6, |out| {
        out[0] = header(op::COPY_DATA, 5, HeaderFlags::empty());
        out[1] = src_sel | (5 << 8) | count_sel | WRITE_DATA_WR_CONFIRM;
        out[2] = src_lo;
        out[3] = src_hi;
        out[4] = lo(dst);
        out[5] = hi(dst);
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaSource {
    Memory(pt::GpuAddress),
    /// A dword replicated over the destination.
    Data(u32),
}

const DMA_CP_SYNC: u32 = 1 << 31;

/// Copies or fills `bytes` at `dst`, splitting transfers the packet
/// cannot express in one go.
pub fn dma_data<S: CmdSink>(
    sink: &mut S,
    src: DmaSource,
    dst: pt::GpuAddress,
    bytes: u64,
) -> Result<(), CommandError> {
    let mut done = 0;
    while done < bytes {
        let piece = (bytes - done).min(DMA_MAX_BYTES);
        let (src_sel, src_lo, src_hi) = match src {
            DmaSource::Memory(addr) => (0, lo(addr + done), hi(addr + done)),
            DmaSource::Data(value) => (2, value, 0),
        };
        let to = dst + done;
        sink.emit(7, |out| {
            out[0] = header(op::DMA_DATA, 6, HeaderFlags::empty());
            out[1] = (src_sel << 29) | DMA_CP_SYNC;
            out[2] = src_lo;
            out[3] = src_hi;
            out[4] = lo(to);
            out[5] = hi(to);
            out[6] = piece as u32;
        })?;
        done += piece;
    }
    Ok(())
}

pub fn atomic_mem<S: CmdSink>(
    sink: &mut S,
    tc_op: u32,
    addr: pt::GpuAddress,
    value: u64,
    wide: bool,
) -> Result<(), CommandError> {
    check_aligned(addr, if wide { 8 } else { 4 })?;
    sink.emit(9, |out| {
        out[0] = header(op::ATOMIC_MEM, 8, HeaderFlags::empty());
        out[1] = tc_op & 0x7F;
        out[2] = lo(addr);
        out[3] = hi(addr);
        out[4] = lo(value);
        out[5] = hi(value);
        out[6] = 0;
        out[7] = 0;
        out[8] = 128;
    })
}

/// Writes an `INDIRECT_BUFFER` packet into exactly [`CHAIN_DWORDS`] words.
pub fn write_indirect_buffer(
    out: &mut [u32],
    addr: pt::GpuAddress,
    dwords: u32,
    chain: bool,
    preemptible: bool,
) {
    let mut control = (dwords & IB_SIZE_MASK) | IB_VALID;
    if chain {
        control |= IB_CHAIN;
    }
    if preemptible {
        control |= IB_PRE_ENA;
    }
    out[0] = header(op::INDIRECT_BUFFER, 3, HeaderFlags::empty());
    out[1] = lo(addr) & !3;
    out[2] = hi(addr) & 0xFFFF;
    out[3] = control;
}

/// Calls an indirect buffer; execution returns after it.
pub fn indirect_buffer<S: CmdSink>(
    sink: &mut S,
    addr: pt::GpuAddress,
    dwords: u32,
    preemptible: bool,
) -> Result<(), CommandError> {
    check_aligned(addr, 4)?;
    sink.emit(CHAIN_DWORDS, |out| {
        write_indirect_buffer(out, addr, dwords, false, preemptible)
    })
}

pub fn index_base<S: CmdSink>(sink: &mut S, addr: pt::GpuAddress) -> Result<(), CommandError> {
    check_aligned(addr, 2)?;
    sink.emit(3, |out| {
        out[0] = header(op::INDEX_BASE, 2, HeaderFlags::empty());
        out[1] = lo(addr);
        out[2] = hi(addr) & 0xFFFF;
    })
}

pub fn index_buffer_size<S: CmdSink>(sink: &mut S, indices: u32) -> Result<(), CommandError> {
    sink.emit(2, |out| {
        out[0] = header(op::INDEX_BUFFER_SIZE, 1, HeaderFlags::empty());
        out[1] = indices;
    })
}

pub fn num_instances<S: CmdSink>(sink: &mut S, count: u32) -> Result<(), CommandError> {
    sink.emit(2, |out| {
        out[0] = header(op::NUM_INSTANCES, 1, HeaderFlags::empty());
        out[1] = count;
    })
}

pub fn draw_index_auto<S: CmdSink>(sink: &mut S, count: u32) -> Result<(), CommandError> {
    sink.emit(3, |out| {
        out[0] = header(op::DRAW_INDEX_AUTO, 2, HeaderFlags::empty());
        out[1] = count;
        out[2] = DI_SRC_SEL_AUTO_INDEX;
    })
}

pub fn draw_index_2<S: CmdSink>(
    sink: &mut S,
    max_indices: u32,
    index_addr: pt::GpuAddress,
    count: u32,
) -> Result<(), CommandError> {
    sink.emit(6, |out| {
        out[0] = header(op::DRAW_INDEX_2, 5, HeaderFlags::empty());
        out[1] = max_indices;
        out[2] = lo(index_addr);
        out[3] = hi(index_addr);
        out[4] = count;
        out[5] = DI_SRC_SEL_DMA;
    })
}

pub fn set_base<S: CmdSink>(
    sink: &mut S,
    base_index: u32,
    addr: pt::GpuAddress,
) -> Result<(), CommandError> {
    check_aligned(addr, 8)?;
    sink.emit(4, |out| {
        out[0] = header(op::SET_BASE, 3, HeaderFlags::empty());
        out[1] = base_index;
        out[2] = lo(addr);
        out[3] = hi(addr);
    })
}

/// Operands shared by the multi-draw indirect packets.
#[derive(Clone, Copy, Debug)]
pub struct IndirectDraw {
    /// Byte offset from the `SET_BASE` address.
    pub data_offset: u32,
    pub count: u32,
    pub stride: u32,
    /// SH-relative offsets of the SGPRs the command processor fills in.
    pub base_vertex_loc: u32,
    pub start_instance_loc: u32,
}

fn draw_indirect_words(opcode: u8, draw: &IndirectDraw, initiator: u32, out: &mut [u32]) {
    out[0] = header(opcode, 9, HeaderFlags::empty());
    out[1] = draw.data_offset;
    out[2] = draw.base_vertex_loc;
    out[3] = draw.start_instance_loc;
    out[4] = 0;
    out[5] = draw.count;
    out[6] = 0;
    out[7] = 0;
    out[8] = draw.stride;
    out[9] = initiator;
}

pub fn draw_indirect_multi<S: CmdSink>(sink: &mut S, draw: &IndirectDraw) -> Result<(), CommandError> {
    sink.emit(10, |out| {
        draw_indirect_words(op::DRAW_INDIRECT_MULTI, draw, DI_SRC_SEL_AUTO_INDEX, out)
    })
}

pub fn draw_index_indirect_multi<S: CmdSink>(
    sink: &mut S,
    draw: &IndirectDraw,
) -> Result<(), CommandError> {
    sink.emit(10, |out| {
        draw_indirect_words(op::DRAW_INDEX_INDIRECT_MULTI, draw, DI_SRC_SEL_DMA, out)
    })
}

pub fn dispatch_direct<S: CmdSink>(
    sink: &mut S,
    groups: [u32; 3],
    initiator: u32,
) -> Result<(), CommandError> {
    sink.emit(5, |out| {
        out[0] = header(op::DISPATCH_DIRECT, 4, HeaderFlags::SHADER_COMPUTE);
        out[1..4].copy_from_slice(&groups);
        out[4] = initiator;
    })
}

pub fn dispatch_indirect<S: CmdSink>(
    sink: &mut S,
    data_offset: u32,
    initiator: u32,
) -> Result<(), CommandError> {
    sink.emit(3, |out| {
        out[0] = header(op::DISPATCH_INDIRECT, 2, HeaderFlags::SHADER_COMPUTE);
        out[1] = data_offset;
        out[2] = initiator;
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseData {
    None,
    Value32(u32),
    Value64(u64),
    /// The 64-bit GPU clock at the time of the event.
    Timestamp,
}

#[derive(Clone, Copy, Debug)]
pub struct ReleaseMem {
    pub event: u32,
    pub event_index: u32,
    pub cache: CoherFlags,
    pub data: ReleaseData,
    pub dst: pt::GpuAddress,
}

impl ReleaseMem {
    /// Bottom-of-pipe write of `data` to `dst`.
    pub fn bottom_of_pipe(data: ReleaseData, dst: pt::GpuAddress) -> Self {
        Self {
            event: crate::regs::event::BOTTOM_OF_PIPE_TS,
            event_index: crate::regs::event::INDEX_END_OF_PIPE,
            cache: CoherFlags::empty(),
            data,
            dst,
        }
    }
}

pub fn release_mem<S: CmdSink>(
    sink: &mut S,
    hw: &HwTable,
    release: &ReleaseMem,
) -> Result<(), CommandError> {
    let (data_sel, data) = match release.data {
        ReleaseData::None => (0, 0),
        ReleaseData::Value32(v) => (1, u64::from(v)),
        ReleaseData::Value64(v) => (2, v),
        ReleaseData::Timestamp => (3, 0),
    };
    if data_sel != 0 {
        check_aligned(release.dst, if data_sel == 1 { 4 } else { 8 })?;
    }
    let event_cntl = (release.event & 0x3F)
        | (release.event_index << 8)
        | (hw.release_cache_bits)(release.cache);
    sink.emit(8, |out| {
        out[0] = header(op::RELEASE_MEM, 7, HeaderFlags::empty());
        out[1] = event_cntl;
        // DST_SEL = TC_L2
        out[2] = (1 << 16) | (data_sel << 29);
        out[3] = lo(release.dst);
        out[4] = hi(release.dst);
        out[5] = lo(data);
        out[6] = hi(data);
        out[7] = 0;
    })
}

/// Acquires coherency over `[base, base + size)`; `u64::MAX` covers everything.
pub fn acquire_mem<S: CmdSink>(
    sink: &mut S,
    hw: &HwTable,
    flags: CoherFlags,
    base: pt::GpuAddress,
    size: u64,
) -> Result<(), CommandError> {
    let packet = (hw.acquire_mem)(flags, base, size);
    sink.emit(packet.len() as u32, |out| out.copy_from_slice(&packet))
}

pub fn pfp_sync_me<S: CmdSink>(sink: &mut S) -> Result<(), CommandError> {
    sink.emit(2, |out| {
        out[0] = header(op::PFP_SYNC_ME, 1, HeaderFlags::empty());
        out[1] = 0;
    })
}

pub fn context_control<S: CmdSink>(sink: &mut S) -> Result<(), CommandError> {
    // LOAD_ENABLE and SHADOW_ENABLE with nothing selected.
    sink.emit(3, |out| {
        out[0] = header(op::CONTEXT_CONTROL, 2, HeaderFlags::empty());
        out[1] = 1 << 31;
        out[2] = 1 << 31;
    })
}

pub fn clear_state<S: CmdSink>(sink: &mut S) -> Result<(), CommandError> {
    sink.emit(2, |out| {
        out[0] = header(op::CLEAR_STATE, 1, HeaderFlags::empty());
        out[1] = 0;
    })
}

/// Replays pre-built packets one by one, so each still lands whole in a chunk.
pub fn raw<S: CmdSink>(sink: &mut S, words: &[u32]) -> Result<(), CommandError> {
    for packet in Packets::new(words) {
        let packet = packet?;
        sink.emit(packet.len() as u32, |out| out.copy_from_slice(packet.words))?;
    }
    Ok(())
}
