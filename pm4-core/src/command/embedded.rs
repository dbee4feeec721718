/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::{mem, sync::Arc};

use crate::{stream::Chunk, ChunkAllocator, CommandError, DeviceError, SubmissionHandle};

/// Small GPU-visible tables owned by a command buffer: spilled user data,
/// vertex buffer descriptors and synchronisation slots.
#[derive(Debug)]
pub(crate) struct EmbeddedData {
    allocator: Arc<dyn ChunkAllocator>,
    chunk_dwords: u32,
    chunks: Vec<Chunk>,
    dwords: u64,
}

impl EmbeddedData {
    pub fn new(allocator: Arc<dyn ChunkAllocator>, chunk_dwords: u32) -> Self {
        Self {
            allocator,
            chunk_dwords,
            chunks: Vec::new(),
            dwords: 0,
        }
    }

    /// Allocates `dwords` words aligned to `align` dwords. The words are
    /// CPU-visible until the command buffer is submitted.
    pub fn alloc(
        &mut self,
        dwords: u32,
        align: u32,
    ) -> Result<(pt::GpuAddress, &mut [u32]), CommandError> {
        if dwords == 0 {
            return Err(CommandError::InvalidArgument("empty embedded allocation"));
        }
        let align = align.max(1);
        let fits = self.chunks.last().map_or(false, |chunk| {
            let start = (chunk.used() + align - 1) / align * align;
            start + dwords <= chunk.capacity()
        });
        if !fits {
            let min_dwords = dwords.saturating_add(align).max(self.chunk_dwords);
            let chunk = self.allocator.obtain_chunk(u64::from(min_dwords) * 4)?;
            log::trace!("embedded data grows by {:?}", chunk);
            self.chunks.push(chunk);
        }
        let chunk = self
            .chunks
            .last_mut()
            .ok_or(CommandError::Device(DeviceError::OutOfMemory))?;
        let allocation = chunk
            .suballocate(dwords, align)
            .ok_or(CommandError::Device(DeviceError::OutOfMemory))?;
        self.dwords += u64::from(dwords);
        Ok(allocation)
    }

    pub fn dwords(&self) -> u64 {
        self.dwords
    }

    pub fn reset(&mut self, fences: &[SubmissionHandle]) {
        let chunks = mem::take(&mut self.chunks);
        if !chunks.is_empty() {
            self.allocator.release_chunks(chunks, fences);
        }
        self.dwords = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChunkPool, SoftKernel};

    #[derive(Debug)]
    struct NoMemory;

    impl ChunkAllocator for NoMemory {
        fn obtain_chunk(&self, _min_bytes: u64) -> Result<Chunk, DeviceError> {
            Err(DeviceError::OutOfMemory)
        }

        fn release_chunks(&self, _chunks: Vec<Chunk>, _fences: &[SubmissionHandle]) {}
    }

    #[test]
    fn failed_allocations_are_not_counted() {
        let mut data = EmbeddedData::new(Arc::new(NoMemory), 256);
        assert_eq!(
            data.alloc(4, 1).map(|(address, _)| address),
            Err(CommandError::Device(DeviceError::OutOfMemory))
        );
        assert_eq!(data.dwords(), 0);
    }

    #[test]
    fn allocations_are_aligned_and_counted() {
        let pool = ChunkPool::new(Arc::new(SoftKernel::new()));
        let mut data = EmbeddedData::new(Arc::new(pool), 256);
        let (first, _) = data.alloc(3, 1).unwrap();
        let (second, words) = data.alloc(2, 2).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(second - first, 16);
        assert_eq!(data.dwords(), 5);

        data.reset(&[]);
        assert_eq!(data.dwords(), 0);
    }
}
