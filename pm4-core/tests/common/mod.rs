//! Test harness: a device over the software kernel, plus packet helpers.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use pm4_core::{
    packet::{op, Packet, Packets},
    soft::RecordedIb,
    Chunk, ChunkAllocator, ChunkPool, CmdStream, Device, DeviceError, Pipeline,
    PipelineDescriptor, PipelineKind, Queue, SoftKernel, SubmissionHandle,
};

pub struct TestingContext {
    pub kernel: Arc<SoftKernel>,
    pub pool: Arc<ChunkPool>,
    pub allocator: Arc<FailingAllocator>,
    pub device: Device,
    pub queue: Queue,
}

pub struct TestParameters {
    pub settings: pt::Settings,
    pub engine: pt::EngineType,
    /// Submissions only retire when the test says so.
    pub manual_retire: bool,
}

impl Default for TestParameters {
    fn default() -> Self {
        Self {
            settings: pt::Settings::default(),
            engine: pt::EngineType::Universal,
            manual_retire: false,
        }
    }
}

impl TestParameters {
    pub fn settings(mut self, settings: pt::Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn compute(mut self) -> Self {
        self.engine = pt::EngineType::Compute;
        self
    }

    pub fn manual_retire(mut self) -> Self {
        self.manual_retire = true;
        self
    }
}

pub fn initialize_test(parameters: TestParameters, test_function: impl FnOnce(&mut TestingContext)) {
    // We don't actually care if it fails
    let _ = env_logger::try_init();

    let kernel = Arc::new(if parameters.manual_retire {
        SoftKernel::with_manual_retire()
    } else {
        SoftKernel::new()
    });
    let pool = Arc::new(ChunkPool::new(kernel.clone()));
    let allocator = Arc::new(FailingAllocator::new(pool.clone()));
    let device = Device::new(
        kernel.clone(),
        Some(allocator.clone() as Arc<dyn ChunkAllocator>),
        parameters.settings,
    )
    .expect("device creation failed");
    let queue = device
        .create_queue(parameters.engine)
        .expect("queue creation failed");

    let mut context = TestingContext {
        kernel,
        pool,
        allocator,
        device,
        queue,
    };
    test_function(&mut context);
}

/// A chunk pool that can be told to run out of memory.
#[derive(Debug)]
pub struct FailingAllocator {
    inner: Arc<ChunkPool>,
    failing: AtomicBool,
}

impl FailingAllocator {
    pub fn new(inner: Arc<ChunkPool>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ChunkAllocator for FailingAllocator {
    fn obtain_chunk(&self, min_bytes: u64) -> Result<Chunk, DeviceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeviceError::OutOfMemory);
        }
        self.inner.obtain_chunk(min_bytes)
    }

    fn release_chunks(&self, chunks: Vec<Chunk>, fences: &[SubmissionHandle]) {
        self.inner.release_chunks(chunks, fences)
    }
}

pub fn graphics_desc<'a>(context_regs: &'a [(u32, u32)]) -> PipelineDescriptor<'a> {
    PipelineDescriptor {
        label: Some("graphics"),
        kind: PipelineKind::Graphics {
            topology: pt::PrimitiveTopology::TriangleList,
        },
        stages: pt::HwStages::VS | pt::HwStages::PS,
        wave_size: pt::WaveSize::Wave64,
        context_regs,
        sh_regs: &[],
        rings: pt::RingSizes::default(),
        user_data_entries: 4,
    }
}

pub fn graphics_pipeline(device: &Device, scratch_bytes_per_wave: u32) -> Arc<Pipeline> {
    let mut desc = graphics_desc(&[]);
    desc.rings.scratch_bytes_per_wave = scratch_bytes_per_wave;
    device.create_pipeline(&desc).unwrap()
}

pub fn compute_pipeline(device: &Device, async_compute: bool) -> Arc<Pipeline> {
    device
        .create_pipeline(&PipelineDescriptor {
            label: Some("compute"),
            kind: PipelineKind::Compute {
                async_compute,
                threads: [64, 1, 1],
            },
            stages: pt::HwStages::CS,
            wave_size: pt::WaveSize::Wave64,
            context_regs: &[],
            sh_regs: &[],
            rings: pt::RingSizes::default(),
            user_data_entries: 2,
        })
        .unwrap()
}

/// Every word of a stream, chain packets and padding included.
pub fn stream_words(stream: &CmdStream) -> Vec<u32> {
    stream
        .chunks()
        .iter()
        .flat_map(|chunk| chunk.words().iter().copied())
        .collect()
}

pub fn decode(words: &[u32]) -> Vec<Packet<'_>> {
    Packets::new(words)
        .collect::<Result<Vec<_>, _>>()
        .expect("stream does not decode")
}

/// Opcodes in order, without padding.
pub fn opcodes(words: &[u32]) -> Vec<u8> {
    decode(words)
        .iter()
        .map(Packet::opcode)
        .filter(|&code| code != op::NOP)
        .collect()
}

/// Expands every `SET_*_REG` packet into `(register, value)` pairs.
pub fn register_writes(words: &[u32]) -> Vec<(u32, u32)> {
    decode(words)
        .iter()
        .filter_map(|packet| {
            let first = packet.first_register()?;
            Some(
                packet.body()[1..]
                    .iter()
                    .enumerate()
                    .map(|(i, &value)| (first + i as u32, value))
                    .collect::<Vec<_>>(),
            )
        })
        .flatten()
        .collect()
}

/// Number of times `reg` is written.
pub fn writes_to(words: &[u32], reg: u32) -> usize {
    register_writes(words)
        .iter()
        .filter(|&&(r, _)| r == reg)
        .count()
}

pub fn ib_words(ibs: &[RecordedIb]) -> Vec<u32> {
    ibs.iter().flat_map(|ib| ib.words.iter().copied()).collect()
}

pub fn address(body: &[u32], at: usize) -> u64 {
    u64::from(body[at]) | (u64::from(body[at + 1]) << 32)
}

/// `(destination, value)` of every `RELEASE_MEM` writing 64-bit data.
pub fn releases(words: &[u32]) -> Vec<(u64, u64)> {
    decode(words)
        .iter()
        .filter(|p| p.opcode() == op::RELEASE_MEM)
        .map(|p| (address(p.body(), 2), address(p.body(), 4)))
        .collect()
}

/// `(address, reference)` of every 64-bit wait.
pub fn waits(words: &[u32]) -> Vec<(u64, u64)> {
    decode(words)
        .iter()
        .filter(|p| p.opcode() == op::WAIT_REG_MEM64)
        .map(|p| (address(p.body(), 1), address(p.body(), 3)))
        .collect()
}
