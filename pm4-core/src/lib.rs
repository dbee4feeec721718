/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

/*! This library builds PM4 command streams for GFX9/GFX10 command processors
 *  and submits them to a kernel driver.
 *  - Recording never blocks on GPU progress. Chunks are recycled by fences.
 *  - Register state is shadowed per command buffer; only deltas are emitted.
 *  - Generation differences live in a capability table, not in subtypes.
 *  - Queues own their preambles, shader rings and ganged compute sync.
 *  The memory manager and the kernel are consumed through the
 *  [`ChunkAllocator`] and [`Kernel`] traits.
 */

#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Redundant matching is more explicit.
    clippy::redundant_pattern_matching,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // No need for defaults in the internal types.
    clippy::new_without_default,
    // Packet builders take many operands by design of the ISA.
    clippy::too_many_arguments,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

pub mod allocator;
pub mod command;
mod conv;
pub mod device;
pub mod encode;
pub mod hw;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod regs;
pub mod ring;
pub mod shadow;
pub mod soft;
pub mod stream;

use std::{fmt, time::Duration};

use thiserror::Error;

pub use allocator::ChunkPool;
pub use command::{CommandBuffer, CommandBufferStats};
pub use device::Device;
pub use pipeline::{Pipeline, PipelineDescriptor, PipelineKind};
pub use queue::{Fence, Queue};
pub use soft::SoftKernel;
pub use stream::{Chunk, CmdStream};

pub type Label<'a> = Option<&'a str>;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum DeviceError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("device is lost")]
    Lost,
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("command buffer was poisoned by an earlier error")]
    PoisonedCommandBuffer,
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum PipelineError {
    #[error("invalid pipeline description: {0}")]
    InvalidArgument(&'static str),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum QueueError {
    #[error("command buffer was poisoned during recording")]
    PoisonedCommandBuffer,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("wait timed out")]
    Timeout,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum CreateDeviceError {
    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Kernel-opaque completion token of one submission.
///
/// Values are monotonically increasing per engine, so a later handle
/// retiring implies every earlier handle on that engine retired.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct SubmissionHandle {
    pub engine: pt::EngineType,
    pub value: pt::FenceValue,
}

/// A block of GPU memory handed out by the kernel.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct GpuAllocation {
    pub gpu_addr: pt::GpuAddress,
    pub size: u64,
}

/// One indirect buffer launched by the kernel.
///
/// The kernel only launches the head chunk; the remaining chunks are
/// reached by the command processor through chain packets.
#[derive(Clone, Copy, Debug)]
pub struct IbRef<'a> {
    pub chunks: &'a [Chunk],
}

impl<'a> IbRef<'a> {
    pub fn gpu_addr(&self) -> pt::GpuAddress {
        self.chunks.first().map_or(0, |c| c.gpu_addr())
    }

    /// Size of the head chunk, which is what the kernel programs.
    pub fn dwords(&self) -> u32 {
        self.chunks.first().map_or(0, |c| c.used())
    }

    /// All words reachable from this IB, in execution order.
    pub fn words(&self) -> impl Iterator<Item = u32> + 'a {
        self.chunks.iter().flat_map(|c| c.words().iter().copied())
    }
}

/// A kernel submission descriptor for one engine.
#[derive(Debug)]
pub struct Submission<'a> {
    pub engine: pt::EngineType,
    pub ibs: &'a [IbRef<'a>],
    /// Handles that must retire before this submission starts.
    pub wait: &'a [SubmissionHandle],
}

/// Source of GPU-visible memory chunks for command streams.
pub trait ChunkAllocator: fmt::Debug + Send + Sync {
    /// Returns a chunk with at least `min_bytes` of capacity and no used words.
    fn obtain_chunk(&self, min_bytes: u64) -> Result<Chunk, DeviceError>;

    /// Hands chunks back. They may not be reused until every handle in
    /// `fences` has retired. An empty list means they were never submitted.
    fn release_chunks(&self, chunks: Vec<Chunk>, fences: &[SubmissionHandle]);
}

/// The kernel driver interface.
pub trait Kernel: fmt::Debug + Send + Sync {
    fn allocate(&self, size: u64, alignment: u64) -> Result<GpuAllocation, DeviceError>;
    fn free(&self, allocation: GpuAllocation);
    fn submit(&self, submission: &Submission) -> Result<SubmissionHandle, DeviceError>;
    /// Waits for `handle` to retire. Returns `false` on timeout.
    /// A zero timeout polls, `None` waits forever.
    fn wait(&self, handle: SubmissionHandle, timeout: Option<Duration>)
        -> Result<bool, DeviceError>;
}
