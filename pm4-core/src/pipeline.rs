/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Pipeline objects and the cache of their static packet blobs.

use std::{
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use fxhash::{FxHashMap, FxHasher};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{encode, hw::HwTable, regs, Label, PipelineError};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PipelineKind {
    Graphics {
        /// Used until the command buffer overrides it.
        topology: pt::PrimitiveTopology,
    },
    Compute {
        /// Dispatches go to the parallel compute engine.
        async_compute: bool,
        threads: [u32; 3],
    },
}

#[derive(Clone, Debug)]
pub struct PipelineDescriptor<'a> {
    pub label: Label<'a>,
    pub kind: PipelineKind,
    pub stages: pt::HwStages,
    pub wave_size: pt::WaveSize,
    /// Context registers that are a pure function of the pipeline.
    pub context_regs: &'a [(u32, u32)],
    /// SH registers that are a pure function of the pipeline.
    pub sh_regs: &'a [(u32, u32)],
    pub rings: pt::RingSizes,
    /// Number of client user-data entries the shaders read.
    pub user_data_entries: u32,
}

/// Pre-assembled register writes shared by every pipeline with the same
/// static state.
#[derive(Debug)]
pub struct PipelineBlob {
    id: u64,
    words: Box<[u32]>,
    context_regs: Box<[(u32, u32)]>,
    sh_regs: Box<[(u32, u32)]>,
}

impl PipelineBlob {
    /// Unique for the lifetime of the cache; equal ids mean equal blobs.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn context_regs(&self) -> &[(u32, u32)] {
        &self.context_regs
    }

    pub fn sh_regs(&self) -> &[(u32, u32)] {
        &self.sh_regs
    }
}

#[derive(Debug)]
pub struct Pipeline {
    label: Option<String>,
    kind: PipelineKind,
    stages: pt::HwStages,
    wave_size: pt::WaveSize,
    rings: pt::RingSizes,
    user_data_entries: u32,
    dispatch_initiator: u32,
    blob: Arc<PipelineBlob>,
}

impl Pipeline {
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn bind_point(&self) -> pt::PipelineBindPoint {
        match self.kind {
            PipelineKind::Graphics { .. } => pt::PipelineBindPoint::Graphics,
            PipelineKind::Compute { .. } => pt::PipelineBindPoint::Compute,
        }
    }

    pub fn is_async_compute(&self) -> bool {
        match self.kind {
            PipelineKind::Compute { async_compute, .. } => async_compute,
            PipelineKind::Graphics { .. } => false,
        }
    }

    pub fn topology(&self) -> Option<pt::PrimitiveTopology> {
        match self.kind {
            PipelineKind::Graphics { topology } => Some(topology),
            PipelineKind::Compute { .. } => None,
        }
    }

    pub fn stages(&self) -> pt::HwStages {
        self.stages
    }

    pub fn wave_size(&self) -> pt::WaveSize {
        self.wave_size
    }

    pub fn rings(&self) -> pt::RingSizes {
        self.rings
    }

    pub fn user_data_entries(&self) -> u32 {
        self.user_data_entries
    }

    pub(crate) fn dispatch_initiator(&self) -> u32 {
        self.dispatch_initiator
    }

    pub fn blob(&self) -> &Arc<PipelineBlob> {
        &self.blob
    }
}

fn check_space(regs: &[(u32, u32)], space: regs::RegSpace) -> Result<(), PipelineError> {
    if regs.iter().all(|&(reg, _)| space.contains(reg)) {
        Ok(())
    } else {
        Err(PipelineError::InvalidArgument(
            "static register outside of its register space",
        ))
    }
}

fn validate(desc: &PipelineDescriptor) -> Result<(), PipelineError> {
    use pt::HwStages as Hs;

    check_space(desc.context_regs, regs::RegSpace::Context)?;
    check_space(desc.sh_regs, regs::RegSpace::Sh)?;
    if desc.user_data_entries as usize > pt::MAX_USER_DATA_ENTRIES {
        return Err(PipelineError::InvalidArgument("too many user data entries"));
    }
    match desc.kind {
        PipelineKind::Graphics { topology } => {
            if desc.stages.is_empty() || !Hs::GRAPHICS.contains(desc.stages) {
                return Err(PipelineError::InvalidArgument(
                    "graphics pipelines need graphics stages only",
                ));
            }
            let tessellated = desc.stages.contains(Hs::HS);
            match topology {
                pt::PrimitiveTopology::PatchList { control_points } => {
                    if !tessellated {
                        return Err(PipelineError::InvalidArgument(
                            "patch topology without a hull stage",
                        ));
                    }
                    if control_points == 0 || control_points > 32 {
                        return Err(PipelineError::InvalidArgument(
                            "patch control points out of range",
                        ));
                    }
                }
                _ if tessellated => {
                    return Err(PipelineError::InvalidArgument(
                        "hull stage needs a patch topology",
                    ))
                }
                _ => {}
            }
            if desc.rings.gs_ring_bytes != 0 && !desc.stages.contains(Hs::GS) {
                return Err(PipelineError::InvalidArgument("GS ring without a GS stage"));
            }
            if desc.rings.tf_ring_bytes != 0 && !tessellated {
                return Err(PipelineError::InvalidArgument("TF ring without a hull stage"));
            }
        }
        PipelineKind::Compute { threads, .. } => {
            if desc.stages != Hs::CS {
                return Err(PipelineError::InvalidArgument(
                    "compute pipelines run the compute stage only",
                ));
            }
            if !desc.context_regs.is_empty() {
                return Err(PipelineError::InvalidArgument(
                    "compute pipelines have no context state",
                ));
            }
            if threads.iter().any(|&t| t == 0) {
                return Err(PipelineError::InvalidArgument("empty thread group"));
            }
            if desc.rings.gs_ring_bytes != 0 || desc.rings.tf_ring_bytes != 0 {
                return Err(PipelineError::InvalidArgument(
                    "compute pipelines only use the scratch ring",
                ));
            }
        }
    }
    Ok(())
}

/// Sorts by register and keeps the last write of each.
fn normalize(mut regs: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    // A stable sort keeps equal registers in submission order.
    regs.sort_by_key(|&(reg, _)| reg);
    let mut out: Vec<(u32, u32)> = Vec::with_capacity(regs.len());
    for (reg, value) in regs {
        match out.last_mut() {
            Some(last) if last.0 == reg => last.1 = value,
            _ => out.push((reg, value)),
        }
    }
    out
}

#[derive(Debug, Default)]
struct CacheInner {
    blobs: FxHashMap<u64, SmallVec<[Weak<PipelineBlob>; 1]>>,
}

/// Shares one blob between pipelines whose static state is identical.
#[derive(Debug)]
pub struct PipelineCache {
    inner: Mutex<CacheInner>,
    next_id: AtomicU64,
    hits: AtomicU64,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            next_id: AtomicU64::new(1),
            hits: AtomicU64::new(0),
        }
    }

    /// Number of lookups that found a live blob.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn live_blobs(&self) -> usize {
        self.inner
            .lock()
            .blobs
            .values()
            .flat_map(|list| list.iter())
            .filter(|weak| weak.strong_count() != 0)
            .count()
    }

    fn get_or_build(
        &self,
        context_regs: Vec<(u32, u32)>,
        sh_regs: Vec<(u32, u32)>,
    ) -> Result<Arc<PipelineBlob>, PipelineError> {
        let key = {
            let mut hasher = FxHasher::default();
            context_regs.hash(&mut hasher);
            sh_regs.hash(&mut hasher);
            hasher.finish()
        };

        let mut inner = self.inner.lock();
        let list = inner.blobs.entry(key).or_default();
        list.retain(|weak| weak.strong_count() != 0);
        let found = list.iter().filter_map(Weak::upgrade).find(|blob| {
            blob.context_regs[..] == context_regs[..] && blob.sh_regs[..] == sh_regs[..]
        });
        if let Some(blob) = found {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("pipeline cache hit for blob {}", blob.id);
            return Ok(blob);
        }

        let mut words = Vec::new();
        encode::set_regs_coalesced(&mut words, &context_regs)
            .and_then(|()| encode::set_regs_coalesced(&mut words, &sh_regs))
            .map_err(|_| PipelineError::InvalidArgument("static registers cannot be encoded"))?;
        let blob = Arc::new(PipelineBlob {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            words: words.into_boxed_slice(),
            context_regs: context_regs.into_boxed_slice(),
            sh_regs: sh_regs.into_boxed_slice(),
        });
        log::debug!(
            "pipeline cache built blob {} of {} dwords",
            blob.id,
            blob.words.len()
        );
        list.push(Arc::downgrade(&blob));
        Ok(blob)
    }

    /// Validates `desc` and builds its pipeline, sharing the blob with an
    /// existing pipeline when possible.
    pub fn create_pipeline(
        &self,
        hw: &HwTable,
        desc: &PipelineDescriptor,
    ) -> Result<Arc<Pipeline>, PipelineError> {
        validate(desc)?;

        let mut context_regs = desc.context_regs.to_vec();
        let mut sh_regs = desc.sh_regs.to_vec();
        match desc.kind {
            PipelineKind::Graphics { .. } => {
                context_regs.push((
                    regs::VGT_SHADER_STAGES_EN,
                    (hw.shader_stages_en)(desc.stages, desc.wave_size),
                ));
            }
            PipelineKind::Compute { threads, .. } => {
                for (i, &count) in threads.iter().enumerate() {
                    sh_regs.push((regs::COMPUTE_NUM_THREAD_X + i as u32, count));
                }
            }
        }
        let blob = self.get_or_build(normalize(context_regs), normalize(sh_regs))?;

        log::trace!("created pipeline {:?} with blob {}", desc.label, blob.id);
        Ok(Arc::new(Pipeline {
            label: desc.label.map(str::to_string),
            kind: desc.kind,
            stages: desc.stages,
            wave_size: desc.wave_size,
            rings: desc.rings,
            user_data_entries: desc.user_data_entries,
            dispatch_initiator: (hw.dispatch_initiator)(desc.wave_size),
            blob,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hw::GFX10, packet::Packets};

    fn graphics<'a>(context_regs: &'a [(u32, u32)]) -> PipelineDescriptor<'a> {
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

    #[test]
    fn identical_static_state_shares_a_blob() {
        let cache = PipelineCache::new();
        let a = cache
            .create_pipeline(&GFX10, &graphics(&[(regs::CB_TARGET_MASK, 0xF)]))
            .unwrap();
        let b = cache
            .create_pipeline(&GFX10, &graphics(&[(regs::CB_TARGET_MASK, 0xF)]))
            .unwrap();
        let c = cache
            .create_pipeline(&GFX10, &graphics(&[(regs::CB_TARGET_MASK, 0x3)]))
            .unwrap();
        assert_eq!(a.blob().id(), b.blob().id());
        assert_ne!(a.blob().id(), c.blob().id());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.live_blobs(), 2);
        drop((a, b));
        assert_eq!(cache.live_blobs(), 1);
    }

    #[test]
    fn blob_carries_stage_enables() {
        let cache = PipelineCache::new();
        let p = cache.create_pipeline(&GFX10, &graphics(&[])).unwrap();
        let packet = Packets::new(p.blob().words()).next().unwrap().unwrap();
        assert_eq!(packet.first_register(), Some(regs::VGT_SHADER_STAGES_EN));
        assert_eq!(p.blob().context_regs().len(), 1);
    }

    #[test]
    fn descriptor_validation() {
        let cache = PipelineCache::new();
        let wrong_space = [(regs::COMPUTE_USER_DATA_0, 0)];
        assert!(cache.create_pipeline(&GFX10, &graphics(&wrong_space)).is_err());

        let mut desc = graphics(&[]);
        desc.kind = PipelineKind::Graphics {
            topology: pt::PrimitiveTopology::PatchList { control_points: 3 },
        };
        assert_eq!(
            cache.create_pipeline(&GFX10, &desc).err(),
            Some(PipelineError::InvalidArgument(
                "patch topology without a hull stage"
            ))
        );

        let compute = PipelineDescriptor {
            label: None,
            kind: PipelineKind::Compute {
                async_compute: true,
                threads: [64, 1, 1],
            },
            stages: pt::HwStages::CS,
            wave_size: pt::WaveSize::Wave32,
            context_regs: &[],
            sh_regs: &[],
            rings: pt::RingSizes::default(),
            user_data_entries: 0,
        };
        let p = cache.create_pipeline(&GFX10, &compute).unwrap();
        assert!(p.is_async_compute());
        assert_eq!(p.blob().sh_regs()[0], (regs::COMPUTE_NUM_THREAD_X, 64));
        assert_ne!(p.dispatch_initiator() & (1 << 15), 0);
    }
}
