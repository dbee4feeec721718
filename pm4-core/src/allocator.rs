/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{stream::Chunk, ChunkAllocator, DeviceError, GpuAllocation, Kernel, SubmissionHandle};

const CHUNK_ALIGNMENT: u64 = 4096;

#[derive(Debug)]
struct PendingChunk {
    chunk: Chunk,
    fences: SmallVec<[SubmissionHandle; 2]>,
}

#[derive(Debug, Default)]
struct PoolInner {
    free: Vec<Chunk>,
    pending: Vec<PendingChunk>,
}

/// A pool of command chunks, shared by every command buffer of a device.
///
/// Released chunks wait in a pending list until the kernel reports all of
/// their fences retired; they are reclaimed lazily on the next
/// [`ChunkAllocator::obtain_chunk`].
#[derive(Debug)]
pub struct ChunkPool {
    kernel: Arc<dyn Kernel>,
    inner: Mutex<PoolInner>,
}

impl ChunkPool {
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self {
            kernel,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn is_retired(&self, fences: &[SubmissionHandle]) -> bool {
        fences.iter().all(|&handle| {
            // A lost device never retires anything; keep the chunk parked.
            self.kernel
                .wait(handle, Some(Duration::from_secs(0)))
                .unwrap_or(false)
        })
    }

    fn reclaim(&self, inner: &mut PoolInner) {
        let mut index = 0;
        while index < inner.pending.len() {
            if self.is_retired(&inner.pending[index].fences) {
                let PendingChunk { chunk, .. } = inner.pending.swap_remove(index);
                inner.free.push(chunk);
            } else {
                index += 1;
            }
        }
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Frees every idle chunk back to the kernel.
    pub fn trim(&self) -> usize {
        let mut inner = self.inner.lock();
        self.reclaim(&mut inner);
        let count = inner.free.len();
        for chunk in inner.free.drain(..) {
            self.kernel.free(chunk.allocation());
        }
        log::debug!("trimmed {} idle chunks", count);
        count
    }
}

impl ChunkAllocator for ChunkPool {
    fn obtain_chunk(&self, min_bytes: u64) -> Result<Chunk, DeviceError> {
        let mut inner = self.inner.lock();
        if !inner.pending.is_empty() {
            self.reclaim(&mut inner);
        }
        let min_dwords = (min_bytes + 3) / 4;
        if let Some(index) = inner
            .free
            .iter()
            .position(|c| u64::from(c.capacity()) >= min_dwords)
        {
            let mut chunk = inner.free.swap_remove(index);
            chunk.clear();
            return Ok(chunk);
        }
        drop(inner);

        let size = (min_bytes.max(4) + CHUNK_ALIGNMENT - 1) / CHUNK_ALIGNMENT * CHUNK_ALIGNMENT;
        let GpuAllocation { gpu_addr, size } = self.kernel.allocate(size, CHUNK_ALIGNMENT)?;
        log::trace!("new chunk of {} bytes at {:#x}", size, gpu_addr);
        Ok(Chunk::new(GpuAllocation { gpu_addr, size }))
    }

    fn release_chunks(&self, chunks: Vec<Chunk>, fences: &[SubmissionHandle]) {
        let mut inner = self.inner.lock();
        if fences.is_empty() {
            inner.free.extend(chunks);
        } else {
            inner.pending.extend(chunks.into_iter().map(|chunk| PendingChunk {
                chunk,
                fences: fences.iter().copied().collect(),
            }));
        }
    }
}

impl Drop for ChunkPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for pending in inner.pending.drain(..) {
            for &handle in pending.fences.iter() {
                if let Err(err) = self.kernel.wait(handle, None) {
                    log::warn!("chunk fence {:?} failed to retire: {}", handle, err);
                }
            }
            self.kernel.free(pending.chunk.allocation());
        }
        for chunk in inner.free.drain(..) {
            self.kernel.free(chunk.allocation());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{soft::SoftKernel, IbRef, Submission};

    #[test]
    fn pending_chunks_wait_for_their_fence() {
        let kernel = Arc::new(SoftKernel::with_manual_retire());
        let pool = ChunkPool::new(kernel.clone());

        let mut chunk = pool.obtain_chunk(1024).unwrap();
        let addr = chunk.gpu_addr();
        chunk.suballocate(8, 1).unwrap();
        let chunks = vec![chunk];
        let handle = kernel
            .submit(&Submission {
                engine: pt::EngineType::Universal,
                ibs: &[IbRef { chunks: &chunks }],
                wait: &[],
            })
            .unwrap();
        pool.release_chunks(chunks, &[handle]);
        assert_eq!(pool.pending_count(), 1);

        let other = pool.obtain_chunk(1024).unwrap();
        assert_ne!(other.gpu_addr(), addr);
        pool.release_chunks(vec![other], &[]);

        kernel.retire_all();
        let mut seen = Vec::new();
        seen.push(pool.obtain_chunk(1024).unwrap().gpu_addr());
        seen.push(pool.obtain_chunk(1024).unwrap().gpu_addr());
        assert!(seen.contains(&addr));
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn unsubmitted_chunks_are_reused_immediately() {
        let kernel = Arc::new(SoftKernel::new());
        let pool = ChunkPool::new(kernel);
        let chunk = pool.obtain_chunk(4096).unwrap();
        let addr = chunk.gpu_addr();
        pool.release_chunks(vec![chunk], &[]);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.obtain_chunk(64).unwrap().gpu_addr(), addr);
        assert_eq!(pool.free_count(), 0);
    }
}
