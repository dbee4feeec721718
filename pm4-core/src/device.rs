/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    allocator::ChunkPool,
    command::CommandBuffer,
    hw::HwTable,
    pipeline::{Pipeline, PipelineCache, PipelineDescriptor},
    queue::{Fence, Queue},
    ChunkAllocator, CreateDeviceError, DeviceError, Kernel, Label, PipelineError,
};

/// Entry point: owns the kernel, the chunk allocator, the settings and the
/// pipeline cache, and creates everything else.
#[derive(Debug)]
pub struct Device {
    kernel: Arc<dyn Kernel>,
    allocator: Arc<dyn ChunkAllocator>,
    hw: &'static HwTable,
    settings: pt::Settings,
    pipelines: PipelineCache,
    next_queue_id: AtomicU64,
}

impl Device {
    /// Creates a device over `kernel`. Without an `allocator`, command
    /// chunks come from a [`ChunkPool`] over the same kernel.
    pub fn new(
        kernel: Arc<dyn Kernel>,
        allocator: Option<Arc<dyn ChunkAllocator>>,
        settings: pt::Settings,
    ) -> Result<Self, CreateDeviceError> {
        settings
            .validate()
            .map_err(CreateDeviceError::InvalidSettings)?;
        let allocator =
            allocator.unwrap_or_else(|| Arc::new(ChunkPool::new(kernel.clone())) as Arc<_>);
        let hw = HwTable::get(settings.gfx_ip);
        log::info!(
            "device for {:?}: {} dword chunks, {:?} chaining",
            settings.gfx_ip,
            settings.chunk_dwords,
            settings.chain_mode
        );
        Ok(Self {
            kernel,
            allocator,
            hw,
            settings,
            pipelines: PipelineCache::new(),
            next_queue_id: AtomicU64::new(1),
        })
    }

    pub fn settings(&self) -> &pt::Settings {
        &self.settings
    }

    pub fn hw(&self) -> &'static HwTable {
        self.hw
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    pub fn allocator(&self) -> &Arc<dyn ChunkAllocator> {
        &self.allocator
    }

    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.pipelines
    }

    /// Creates a queue on `engine`. The queue submits its ring state once
    /// before returning.
    pub fn create_queue(&self, engine: pt::EngineType) -> Result<Queue, DeviceError> {
        let id = self.next_queue_id.fetch_add(1, Ordering::Relaxed);
        Queue::new(
            id,
            engine,
            self.hw,
            &self.settings,
            self.kernel.clone(),
            self.allocator.clone(),
        )
    }

    /// Creates a command buffer that can only be submitted to `queue`.
    pub fn create_command_buffer(&self, queue: &Queue, label: Label) -> CommandBuffer {
        CommandBuffer::new(
            label,
            queue.engine(),
            queue.id(),
            self.hw,
            &self.settings,
            self.allocator.clone(),
            queue.ring_request().clone(),
        )
    }

    pub fn create_pipeline(
        &self,
        desc: &PipelineDescriptor,
    ) -> Result<Arc<Pipeline>, PipelineError> {
        self.pipelines.create_pipeline(self.hw, desc)
    }

    /// Waits for every submission that signalled `fence`.
    /// Returns `false` on timeout; an unsignalled fence is complete.
    pub fn wait_fence(&self, fence: &Fence, timeout_ms: Option<u32>) -> Result<bool, DeviceError> {
        let timeout = timeout_ms.map(|ms| Duration::from_millis(u64::from(ms)));
        for handle in fence.handles() {
            if !self.kernel.wait(handle, timeout)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
