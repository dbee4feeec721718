/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Append-only command streams over chained memory chunks.

use std::{fmt, mem, sync::Arc};

use crate::{
    encode::{self, CHAIN_DWORDS, IB_SIZE_MASK},
    hw::HwTable,
    packet::CmdSink,
    ChunkAllocator, CommandError, DeviceError, GpuAllocation, IbRef, SubmissionHandle,
};

/// A contiguous, GPU-visible and CPU-mapped block of memory.
pub struct Chunk {
    allocation: GpuAllocation,
    words: Box<[u32]>,
    used: u32,
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("gpu_addr", &format_args!("{:#x}", self.allocation.gpu_addr))
            .field("capacity", &self.words.len())
            .field("used", &self.used)
            .finish()
    }
}

impl Chunk {
    pub fn new(allocation: GpuAllocation) -> Self {
        let dwords = (allocation.size / 4) as usize;
        Self {
            allocation,
            words: vec![0; dwords].into_boxed_slice(),
            used: 0,
        }
    }

    pub fn allocation(&self) -> GpuAllocation {
        self.allocation
    }

    pub fn gpu_addr(&self) -> pt::GpuAddress {
        self.allocation.gpu_addr
    }

    /// Capacity in dwords.
    pub fn capacity(&self) -> u32 {
        self.words.len() as u32
    }

    /// Number of dwords written so far.
    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn words(&self) -> &[u32] {
        &self.words[..self.used as usize]
    }

    pub(crate) fn clear(&mut self) {
        self.used = 0;
    }

    fn append(&mut self, dwords: u32) -> &mut [u32] {
        let start = self.used as usize;
        self.used += dwords;
        &mut self.words[start..self.used as usize]
    }

    /// Carves an aligned block of `dwords` out of the unused tail.
    pub(crate) fn suballocate(
        &mut self,
        dwords: u32,
        align: u32,
    ) -> Option<(pt::GpuAddress, &mut [u32])> {
        let align = align.max(1);
        let start = (self.used + align - 1) / align * align;
        let end = start.checked_add(dwords)?;
        if end > self.capacity() {
            return None;
        }
        self.used = end;
        let addr = self.gpu_addr() + u64::from(start) * 4;
        Some((addr, &mut self.words[start as usize..end as usize]))
    }
}

/// Dwords of NOP needed to bring `used` to a multiple of `align`.
fn padding(used: u32, align: u32) -> u32 {
    (align - used % align) % align
}

/// A command stream: a list of chunks linked by `INDIRECT_BUFFER` packets.
///
/// The tail of the active chunk always keeps room for alignment padding
/// and a chain packet, so a packet never straddles two chunks.
pub struct CmdStream {
    engine: pt::EngineType,
    allocator: Arc<dyn ChunkAllocator>,
    chunk_dwords: u32,
    chain_mode: pt::ChainMode,
    preemptible: bool,
    align: u32,
    chunks: Vec<Chunk>,
    reserved: u32,
    poison: Option<CommandError>,
    sealed: bool,
    packets: u64,
    dwords: u64,
}

impl fmt::Debug for CmdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdStream")
            .field("engine", &self.engine)
            .field("chunks", &self.chunks)
            .field("poison", &self.poison)
            .finish()
    }
}

impl CmdStream {
    pub fn new(
        engine: pt::EngineType,
        allocator: Arc<dyn ChunkAllocator>,
        settings: &pt::Settings,
        hw: &HwTable,
    ) -> Self {
        Self {
            engine,
            allocator,
            chunk_dwords: settings.chunk_dwords,
            chain_mode: settings.chain_mode,
            preemptible: settings.preemptible_ibs,
            align: hw.ib_align_dwords.max(1),
            chunks: Vec::new(),
            reserved: 0,
            poison: None,
            sealed: false,
            packets: 0,
            dwords: 0,
        }
    }

    /// Uses chunks of `dwords` instead of the configured size.
    pub(crate) fn with_chunk_dwords(mut self, dwords: u32) -> Self {
        self.chunk_dwords = dwords;
        self
    }

    pub fn engine(&self) -> pt::EngineType {
        self.engine
    }

    fn tail_reserve(&self) -> u32 {
        CHAIN_DWORDS + self.align - 1
    }

    /// Returns room for `dwords` contiguous words and its GPU address.
    ///
    /// Moves to a new chunk, chained from the current one, if the current
    /// chunk cannot hold them.
    pub fn reserve(&mut self, dwords: u32) -> Result<(&mut [u32], pt::GpuAddress), CommandError> {
        if self.poison.is_some() {
            return Err(CommandError::PoisonedCommandBuffer);
        }
        if self.sealed {
            return Err(CommandError::InvalidArgument("stream has already ended"));
        }
        if dwords == 0 {
            return Err(CommandError::InvalidArgument("empty reservation"));
        }
        let tail = self.tail_reserve();
        let fits = self
            .chunks
            .last()
            .map_or(false, |c| c.used() + dwords + tail <= c.capacity());
        if !fits {
            if let Err(err) = self.grow(dwords + tail) {
                log::warn!("{:?} stream poisoned: {}", self.engine, err);
                self.poison = Some(err.clone());
                return Err(err);
            }
        }
        self.reserved = dwords;
        let chunk = self
            .chunks
            .last_mut()
            .ok_or(CommandError::Device(DeviceError::OutOfMemory))?;
        let start = chunk.used as usize;
        let addr = chunk.gpu_addr() + start as u64 * 4;
        log::trace!("reserve {} dwords at {:#x}", dwords, addr);
        Ok((&mut chunk.words[start..start + dwords as usize], addr))
    }

    /// Advances the write pointer over words written into the last reservation.
    pub fn commit(&mut self, dwords: u32) {
        debug_assert!(dwords <= self.reserved);
        let dwords = dwords.min(self.reserved);
        self.reserved = 0;
        if let Some(chunk) = self.chunks.last_mut() {
            chunk.used += dwords;
            self.dwords += u64::from(dwords);
        }
    }

    fn grow(&mut self, min_dwords: u32) -> Result<(), CommandError> {
        let dwords = min_dwords.max(self.chunk_dwords);
        let next = self.allocator.obtain_chunk(u64::from(dwords) * 4)?;
        if next.capacity() < min_dwords || next.used() != 0 {
            log::error!("chunk allocator returned an unusable chunk {:?}", next);
            self.allocator.release_chunks(vec![next], &[]);
            return Err(DeviceError::OutOfMemory.into());
        }

        let (chain_mode, preemptible, align) = (self.chain_mode, self.preemptible, self.align);
        if let Some(prev) = self.chunks.last_mut() {
            let pad = padding(prev.used() + CHAIN_DWORDS, align);
            encode::write_nop(prev.append(pad));
            // The size is patched in once the successor is sealed.
            encode::write_indirect_buffer(
                prev.append(CHAIN_DWORDS),
                next.gpu_addr(),
                0,
                chain_mode == pt::ChainMode::Chain,
                preemptible,
            );
            log::debug!(
                "{:?} stream chains chunk {:#x} to {:#x}",
                self.engine,
                prev.gpu_addr(),
                next.gpu_addr()
            );
        }
        self.patch_chain();
        self.chunks.push(next);
        Ok(())
    }

    /// Writes the size of the last chunk into the chain packet that jumps to it.
    fn patch_chain(&mut self) {
        let count = self.chunks.len();
        if count < 2 {
            return;
        }
        let size = self.chunks[count - 1].used();
        let prev = &mut self.chunks[count - 2];
        let at = prev.used as usize - 1;
        prev.words[at] = (prev.words[at] & !IB_SIZE_MASK) | (size & IB_SIZE_MASK);
    }

    /// Seals the stream: pads the last chunk and patches the last chain packet.
    ///
    /// Reports the error that poisoned the stream, if any.
    pub fn end(&mut self) -> Result<(), CommandError> {
        if let Some(ref err) = self.poison {
            return Err(err.clone());
        }
        if self.sealed {
            return Ok(());
        }
        let align = self.align;
        if let Some(last) = self.chunks.last_mut() {
            let pad = padding(last.used(), align);
            encode::write_nop(last.append(pad));
        }
        self.patch_chain();
        self.sealed = true;
        Ok(())
    }

    /// Returns every chunk to the allocator, gated on `fences`, and
    /// makes the stream recordable again.
    pub fn reset(&mut self, fences: &[SubmissionHandle]) {
        let chunks = mem::take(&mut self.chunks);
        if !chunks.is_empty() {
            log::trace!(
                "{:?} stream releases {} chunks behind {:?}",
                self.engine,
                chunks.len(),
                fences
            );
            self.allocator.release_chunks(chunks, fences);
        }
        self.reserved = 0;
        self.poison = None;
        self.sealed = false;
        self.packets = 0;
        self.dwords = 0;
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn ib(&self) -> Option<IbRef<'_>> {
        if self.chunks.is_empty() {
            None
        } else {
            Some(IbRef {
                chunks: &self.chunks,
            })
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dwords == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn poison(&self) -> Option<&CommandError> {
        self.poison.as_ref()
    }

    /// Packets emitted through [`CmdSink`], excluding padding and chains.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Dwords committed by the client, excluding padding and chains.
    pub fn dwords(&self) -> u64 {
        self.dwords
    }
}

impl CmdSink for CmdStream {
    fn emit<F: FnOnce(&mut [u32])>(&mut self, dwords: u32, fill: F) -> Result<(), CommandError> {
        let (words, _) = self.reserve(dwords)?;
        fill(words);
        self.commit(dwords);
        self.packets += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hw,
        packet::{op, Packets},
    };
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct BumpAllocator {
        next: Mutex<u64>,
        fail_after: Option<usize>,
        obtained: Mutex<usize>,
        released: Mutex<Vec<(usize, usize)>>,
    }

    impl ChunkAllocator for BumpAllocator {
        fn obtain_chunk(&self, min_bytes: u64) -> Result<Chunk, DeviceError> {
            let mut obtained = self.obtained.lock();
            if self.fail_after.map_or(false, |n| *obtained >= n) {
                return Err(DeviceError::OutOfMemory);
            }
            *obtained += 1;
            let mut next = self.next.lock();
            let gpu_addr = 0x10_0000 + *next;
            *next += min_bytes;
            Ok(Chunk::new(GpuAllocation {
                gpu_addr,
                size: min_bytes,
            }))
        }

        fn release_chunks(&self, chunks: Vec<Chunk>, fences: &[SubmissionHandle]) {
            self.released.lock().push((chunks.len(), fences.len()));
        }
    }

    fn stream(allocator: &Arc<BumpAllocator>, chain_mode: pt::ChainMode) -> CmdStream {
        let settings = pt::Settings {
            chunk_dwords: 256,
            chain_mode,
            ..pt::Settings::default()
        };
        CmdStream::new(
            pt::EngineType::Universal,
            allocator.clone(),
            &settings,
            &hw::GFX10,
        )
    }

    fn fill_with_draws(stream: &mut CmdStream, count: usize) {
        for i in 0..count {
            encode::draw_index_auto(stream, i as u32 + 1).unwrap();
        }
    }

    #[test]
    fn overflow_chains_and_back_patches() {
        let allocator = Arc::new(BumpAllocator::default());
        let mut stream = stream(&allocator, pt::ChainMode::Chain);
        fill_with_draws(&mut stream, 200);
        stream.end().unwrap();

        let chunks = stream.chunks();
        assert!(chunks.len() >= 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.used() % 8, 0);
            let packets = Packets::new(chunk.words())
                .collect::<Result<Vec<_>, _>>()
                .unwrap();
            let consumed: usize = packets.iter().map(|p| p.len()).sum();
            assert_eq!(consumed, chunk.used() as usize);
            if let Some(next) = chunks.get(i + 1) {
                let last = packets.last().unwrap();
                assert_eq!(last.opcode(), op::INDIRECT_BUFFER);
                assert_eq!(last.body()[0], next.gpu_addr() as u32);
                assert_eq!(last.body()[2] & IB_SIZE_MASK, next.used());
                assert_ne!(last.body()[2] & encode::IB_CHAIN, 0);
            }
        }
        let draws = chunks
            .iter()
            .flat_map(|c| Packets::new(c.words()))
            .filter(|p| p.as_ref().unwrap().opcode() == op::DRAW_INDEX_AUTO)
            .count();
        assert_eq!(draws, 200);
        assert_eq!(stream.packets(), 200);
    }

    #[test]
    fn call_mode_clears_the_chain_bit() {
        let allocator = Arc::new(BumpAllocator::default());
        let mut stream = stream(&allocator, pt::ChainMode::Call);
        fill_with_draws(&mut stream, 100);
        stream.end().unwrap();
        let first = &stream.chunks()[0];
        let tail = &first.words()[first.used() as usize - 4..];
        assert_eq!(tail[3] & encode::IB_CHAIN, 0);
        assert_ne!(tail[3] & encode::IB_VALID, 0);
    }

    #[test]
    fn allocator_failure_poisons() {
        let allocator = Arc::new(BumpAllocator {
            fail_after: Some(1),
            ..BumpAllocator::default()
        });
        let mut stream = stream(&allocator, pt::ChainMode::Chain);
        let mut first_error = None;
        for _ in 0..200 {
            if let Err(err) = encode::draw_index_auto(&mut stream, 3) {
                first_error.get_or_insert(err);
            }
        }
        assert_eq!(first_error, Some(CommandError::Device(DeviceError::OutOfMemory)));
        assert_eq!(
            encode::draw_index_auto(&mut stream, 3),
            Err(CommandError::PoisonedCommandBuffer)
        );
        assert_eq!(
            stream.end(),
            Err(CommandError::Device(DeviceError::OutOfMemory))
        );

        stream.reset(&[]);
        assert_eq!(allocator.released.lock().as_slice(), &[(1, 0)]);
        assert!(stream.poison().is_none());
    }

    #[test]
    fn suballocation_respects_alignment() {
        let mut chunk = Chunk::new(GpuAllocation {
            gpu_addr: 0x1000,
            size: 64,
        });
        let (a, words) = chunk.suballocate(3, 1).unwrap();
        assert_eq!((a, words.len()), (0x1000, 3));
        let (b, _) = chunk.suballocate(2, 4).unwrap();
        assert_eq!(b, 0x1000 + 16);
        assert!(chunk.suballocate(16, 1).is_none());
    }
}
