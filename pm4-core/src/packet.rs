/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! PM4 type-3 packet headers, opcodes and a packet-by-packet decoder.

use bitflags::bitflags;
use thiserror::Error;

use crate::CommandError;

/// Type-3 packet opcodes.
pub mod op {
    pub const NOP: u8 = 0x10;
    pub const SET_BASE: u8 = 0x11;
    pub const CLEAR_STATE: u8 = 0x12;
    pub const INDEX_BUFFER_SIZE: u8 = 0x13;
    pub const DISPATCH_DIRECT: u8 = 0x15;
    pub const DISPATCH_INDIRECT: u8 = 0x16;
    pub const ATOMIC_MEM: u8 = 0x1E;
    pub const INDEX_BASE: u8 = 0x26;
    pub const DRAW_INDEX_2: u8 = 0x27;
    pub const CONTEXT_CONTROL: u8 = 0x28;
    pub const DRAW_INDIRECT_MULTI: u8 = 0x2C;
    pub const DRAW_INDEX_AUTO: u8 = 0x2D;
    pub const NUM_INSTANCES: u8 = 0x2F;
    pub const WRITE_DATA: u8 = 0x37;
    pub const DRAW_INDEX_INDIRECT_MULTI: u8 = 0x38;
    pub const WAIT_REG_MEM: u8 = 0x3C;
    pub const INDIRECT_BUFFER: u8 = 0x3F;
    pub const COPY_DATA: u8 = 0x40;
    pub const PFP_SYNC_ME: u8 = 0x42;
    pub const EVENT_WRITE: u8 = 0x46;
    pub const RELEASE_MEM: u8 = 0x49;
    pub const DMA_DATA: u8 = 0x50;
    pub const ACQUIRE_MEM: u8 = 0x58;
    pub const SET_CONTEXT_REG: u8 = 0x69;
    pub const SET_SH_REG: u8 = 0x76;
    pub const SET_UCONFIG_REG: u8 = 0x79;
    pub const WAIT_REG_MEM64: u8 = 0x93;
}

pub const PACKET_TYPE3: u32 = 3;
/// The single-dword filler, recognised by the command processor as a NOP
/// whose count field is ignored.
pub const NOP_1DW: u32 = 0xFFFF_1000;
/// Largest body emitted by the variable-length packet builders.
pub const MAX_BODY_DWORDS: u32 = 128;
/// Largest body the 14-bit count field can express.
pub const MAX_ENCODABLE_BODY: u32 = 0x4000;

bitflags! {
    #[repr(transparent)]
    pub struct HeaderFlags: u8 {
        const PREDICATE = 1 << 0;
        /// Shader type bit: the packet targets compute state.
        const SHADER_COMPUTE = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct Header(pub u32);

impl Header {
    pub fn type3(opcode: u8, body_dwords: u32, flags: HeaderFlags) -> Self {
        debug_assert!(body_dwords >= 1 && body_dwords <= MAX_ENCODABLE_BODY);
        Self(
            (PACKET_TYPE3 << 30)
                | ((body_dwords - 1) << 16)
                | (u32::from(opcode) << 8)
                | u32::from(flags.bits()),
        )
    }

    pub fn packet_type(self) -> u32 {
        self.0 >> 30
    }

    pub fn opcode(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn flags(self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.0 as u8)
    }

    pub fn is_nop_1dw(self) -> bool {
        self.0 == NOP_1DW
    }

    /// Number of dwords following the header.
    pub fn body_dwords(self) -> u32 {
        if self.is_nop_1dw() {
            0
        } else {
            ((self.0 >> 16) & 0x3FFF) + 1
        }
    }

    /// Total packet length including the header.
    pub fn len(self) -> u32 {
        self.body_dwords() + 1
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum DecodeError {
    #[error("packet at dword {offset} needs {needed} dwords but only {available} remain")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("unsupported packet type {header:#010x} at dword {offset}")]
    UnsupportedType { offset: usize, header: u32 },
}

impl From<DecodeError> for CommandError {
    fn from(_: DecodeError) -> Self {
        CommandError::InvalidArgument("malformed packet stream")
    }
}

/// A decoded packet, borrowing its words from the stream.
#[derive(Clone, Copy, Debug)]
pub struct Packet<'a> {
    /// Dword offset of the header within the decoded slice.
    pub offset: usize,
    pub header: Header,
    /// Header followed by the body.
    pub words: &'a [u32],
}

impl<'a> Packet<'a> {
    pub fn opcode(&self) -> u8 {
        if self.header.is_nop_1dw() {
            op::NOP
        } else {
            self.header.opcode()
        }
    }

    pub fn body(&self) -> &'a [u32] {
        &self.words[1..]
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// For register-setting packets, the absolute offset of the first register.
    pub fn first_register(&self) -> Option<u32> {
        let space = crate::regs::RegSpace::from_set_opcode(self.opcode())?;
        self.body().first().map(|&index| space.base() + index)
    }
}

/// Iterator over the packets of a word slice.
#[derive(Clone, Debug)]
pub struct Packets<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> Packets<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self { words, pos: 0 }
    }
}

impl<'a> Iterator for Packets<'a> {
    type Item = Result<Packet<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.pos;
        let &raw = self.words.get(offset)?;
        let header = Header(raw);
        if header.packet_type() != PACKET_TYPE3 {
            self.pos = self.words.len();
            return Some(Err(DecodeError::UnsupportedType {
                offset,
                header: raw,
            }));
        }
        let needed = header.len() as usize;
        let available = self.words.len() - offset;
        if needed > available {
            self.pos = self.words.len();
            return Some(Err(DecodeError::Truncated {
                offset,
                needed,
                available,
            }));
        }
        self.pos += needed;
        Some(Ok(Packet {
            offset,
            header,
            words: &self.words[offset..offset + needed],
        }))
    }
}

/// Anything packets can be written into.
pub trait CmdSink {
    /// Reserves `dwords` contiguous words, lets `fill` write every one of
    /// them, and commits the packet.
    fn emit<F: FnOnce(&mut [u32])>(&mut self, dwords: u32, fill: F) -> Result<(), CommandError>;
}

impl CmdSink for Vec<u32> {
    fn emit<F: FnOnce(&mut [u32])>(&mut self, dwords: u32, fill: F) -> Result<(), CommandError> {
        let start = self.len();
        self.resize(start + dwords as usize, 0);
        fill(&mut self[start..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let h = Header::type3(op::DRAW_INDEX_AUTO, 2, HeaderFlags::empty());
        assert_eq!(h.0, 0xC001_2D00);
        assert_eq!(h.len(), 3);
        assert_eq!(h.opcode(), op::DRAW_INDEX_AUTO);

        let h = Header::type3(op::DISPATCH_DIRECT, 4, HeaderFlags::SHADER_COMPUTE);
        assert_eq!(h.0 & 0xFF, 2);
        assert_eq!(h.flags(), HeaderFlags::SHADER_COMPUTE);
    }

    #[test]
    fn one_dword_nop_decodes_alone() {
        let words = [NOP_1DW, NOP_1DW, 0xC000_1000, 0];
        let packets = Packets::new(&words)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.opcode() == op::NOP));
        assert_eq!(packets[2].len(), 2);
    }

    #[test]
    fn truncated_stream_is_reported() {
        let words = [Header::type3(op::WRITE_DATA, 4, HeaderFlags::empty()).0, 0, 0];
        match Packets::new(&words).next() {
            Some(Err(DecodeError::Truncated {
                offset: 0,
                needed: 5,
                available: 3,
            })) => {}
            other => panic!("unexpected decode result {:?}", other),
        }
    }

    #[test]
    fn type2_filler_is_rejected() {
        let words = [0x8000_0000];
        assert!(matches!(
            Packets::new(&words).next(),
            Some(Err(DecodeError::UnsupportedType { .. }))
        ));
    }
}
