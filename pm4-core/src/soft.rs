/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! An in-process kernel backend.
//!
//! Nothing is executed: submissions are recorded word for word so that
//! callers can inspect what a real command processor would have received.
//! Fences retire immediately unless manual retirement is requested.

use std::time::Duration;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::{DeviceError, GpuAllocation, Kernel, Submission, SubmissionHandle};

const VA_BASE: u64 = 0x0000_8000_0000;

/// One IB of a recorded submission.
#[derive(Clone, Debug)]
pub struct RecordedIb {
    pub gpu_addr: pt::GpuAddress,
    /// Size programmed for the head chunk.
    pub dwords: u32,
    /// Words of every chunk reachable from the head, in order.
    pub words: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct RecordedSubmission {
    pub handle: SubmissionHandle,
    pub wait: Vec<SubmissionHandle>,
    pub ibs: Vec<RecordedIb>,
}

impl RecordedSubmission {
    pub fn engine(&self) -> pt::EngineType {
        self.handle.engine
    }
}

#[derive(Debug, Default)]
struct EngineTimeline {
    submitted: u64,
    retired: u64,
}

#[derive(Debug)]
struct SoftState {
    next_va: u64,
    live: FxHashMap<pt::GpuAddress, u64>,
    timelines: [EngineTimeline; 2],
    auto_retire: bool,
    allocation_budget: Option<usize>,
    lost: bool,
    submissions: Vec<RecordedSubmission>,
}

fn engine_index(engine: pt::EngineType) -> usize {
    match engine {
        pt::EngineType::Universal => 0,
        pt::EngineType::Compute => 1,
    }
}

#[derive(Debug)]
pub struct SoftKernel {
    state: Mutex<SoftState>,
}

impl SoftKernel {
    /// A kernel whose submissions retire as soon as they are made.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SoftState {
                next_va: VA_BASE,
                live: FxHashMap::default(),
                timelines: Default::default(),
                auto_retire: true,
                allocation_budget: None,
                lost: false,
                submissions: Vec::new(),
            }),
        }
    }

    /// A kernel whose submissions only retire through [`Self::retire`],
    /// [`Self::retire_all`] or an unbounded wait.
    pub fn with_manual_retire() -> Self {
        let kernel = Self::new();
        kernel.state.lock().auto_retire = false;
        kernel
    }

    /// Makes every allocation after the next `count` fail with `OutOfMemory`.
    pub fn fail_allocations_after(&self, count: usize) {
        self.state.lock().allocation_budget = Some(count);
    }

    pub fn clear_allocation_failures(&self) {
        self.state.lock().allocation_budget = None;
    }

    /// Makes every following submission fail with `Lost`.
    pub fn set_lost(&self, lost: bool) {
        self.state.lock().lost = lost;
    }

    pub fn retire(&self, handle: SubmissionHandle) {
        let mut state = self.state.lock();
        let timeline = &mut state.timelines[engine_index(handle.engine)];
        timeline.retired = timeline.retired.max(handle.value.min(timeline.submitted));
    }

    pub fn retire_all(&self) {
        let mut state = self.state.lock();
        for timeline in state.timelines.iter_mut() {
            timeline.retired = timeline.submitted;
        }
    }

    pub fn is_retired(&self, handle: SubmissionHandle) -> bool {
        self.state.lock().timelines[engine_index(handle.engine)].retired >= handle.value
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.state.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl Kernel for SoftKernel {
    fn allocate(&self, size: u64, alignment: u64) -> Result<GpuAllocation, DeviceError> {
        let mut state = self.state.lock();
        if let Some(budget) = state.allocation_budget.as_mut() {
            if *budget == 0 {
                log::debug!("soft kernel refuses allocation of {} bytes", size);
                return Err(DeviceError::OutOfMemory);
            }
            *budget -= 1;
        }
        if size == 0 {
            return Err(DeviceError::OutOfMemory);
        }
        let alignment = alignment.max(256);
        let gpu_addr = (state.next_va + alignment - 1) / alignment * alignment;
        state.next_va = gpu_addr + size;
        state.live.insert(gpu_addr, size);
        Ok(GpuAllocation { gpu_addr, size })
    }

    fn free(&self, allocation: GpuAllocation) {
        if self.state.lock().live.remove(&allocation.gpu_addr).is_none() {
            log::warn!("soft kernel: double free of {:#x}", allocation.gpu_addr);
        }
    }

    fn submit(&self, submission: &Submission) -> Result<SubmissionHandle, DeviceError> {
        let mut state = self.state.lock();
        if state.lost {
            return Err(DeviceError::Lost);
        }
        if submission.ibs.is_empty() || submission.ibs.iter().any(|ib| ib.dwords() == 0) {
            log::error!("soft kernel: rejecting a submission with empty IBs");
            return Err(DeviceError::Lost);
        }
        let ibs = submission
            .ibs
            .iter()
            .map(|ib| RecordedIb {
                gpu_addr: ib.gpu_addr(),
                dwords: ib.dwords(),
                words: ib.words().collect(),
            })
            .collect();

        let auto_retire = state.auto_retire;
        let timeline = &mut state.timelines[engine_index(submission.engine)];
        timeline.submitted += 1;
        if auto_retire {
            timeline.retired = timeline.submitted;
        }
        let handle = SubmissionHandle {
            engine: submission.engine,
            value: timeline.submitted,
        };
        state.submissions.push(RecordedSubmission {
            handle,
            wait: submission.wait.to_vec(),
            ibs,
        });
        Ok(handle)
    }

    fn wait(
        &self,
        handle: SubmissionHandle,
        timeout: Option<Duration>,
    ) -> Result<bool, DeviceError> {
        let mut state = self.state.lock();
        let timeline = &mut state.timelines[engine_index(handle.engine)];
        if handle.value > timeline.submitted {
            return Err(DeviceError::Lost);
        }
        if timeline.retired >= handle.value {
            return Ok(true);
        }
        // Nothing runs in the background: an unbounded wait lets the engine
        // catch up, a bounded one cannot make progress.
        Ok(match timeout {
            None => {
                timeline.retired = handle.value;
                true
            }
            Some(_) => false,
        })
    }
}
