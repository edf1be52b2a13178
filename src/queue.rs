//! Queue submission: residency assembly and the kernel hand-off.
//!
//! A [`Queue`] is where recorded streams meet the kernel. For each logical
//! stream it assembles the full residency set: the stream's own reference
//! set, the ambient device-wide allocations (descriptor tables, heap
//! backing, the zero page), every bound memory object and the sync objects
//! this submission signals. One kernel call goes down per stream, in caller
//! order. A single queue-wide lock serializes residency assembly,
//! hand-off and reference-set cleanup, which is exactly the in-order
//! guarantee the API above us requires of a queue.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::bo::{
    AccessFlags, Bo, BoDescriptor, BoFlags, DeviceInfo, DrmDevice, PushRange, SubmitRequest,
    GEM_DOMAIN_GART, GEM_DOMAIN_VRAM,
};
use crate::cl::{cl90b5, cl9097, cla0c0};
use crate::descriptor::DescriptorTable;
use crate::dump::{dump_push, DebugFlags};
use crate::error::DriverError;
use crate::heap::Heap;
use crate::push::{HdrForm, PushStream, SUBC_3D, SUBC_COMPUTE, SUBC_COPY};
use crate::registry::MemoryRegistry;
use crate::sync::SyncObject;

const ZERO_PAGE_SIZE: u64 = 0x1000;
const EMPTY_PUSH_WORDS: usize = 1024;
const STATE_PUSH_WORDS: usize = 256;

/// Cached hardware-visible descriptor-pool binding, plus the stream that
/// re-programs it. Rebuilt whenever a table's backing changes.
#[derive(Default)]
struct QueueState {
    images: Option<(Arc<Bo>, u32)>,
    samplers: Option<(Arc<Bo>, u32)>,
    push: Option<PushStream>,
}

struct QueueInner {
    state: QueueState,
    /// Single-NOP stream used for signal-only submissions.
    empty_push: PushStream,
}

/// One hardware queue. Submissions on it reach the kernel in issue order.
pub struct Queue {
    dev: Arc<dyn DrmDevice>,
    info: DeviceInfo,
    debug: DebugFlags,
    registry: Arc<MemoryRegistry>,
    heap: Arc<Heap>,
    images: Arc<DescriptorTable>,
    samplers: Arc<DescriptorTable>,
    zero_page: Arc<Bo>,
    inner: Mutex<QueueInner>,
}

impl Queue {
    /// Create a queue over the device's shared residency state.
    pub fn new(
        dev: &Arc<dyn DrmDevice>,
        info: DeviceInfo,
        registry: Arc<MemoryRegistry>,
        heap: Arc<Heap>,
        images: Arc<DescriptorTable>,
        samplers: Arc<DescriptorTable>,
    ) -> Result<Self, DriverError> {
        // Unbound resources read as zero through this page.
        let zero_page = dev.new_bo(ZERO_PAGE_SIZE, 0, BoFlags::GART)?;

        let mut empty_push = PushStream::new(dev, EMPTY_PUSH_WORDS)?;
        empty_push.space(2)?;
        empty_push.begin(HdrForm::NInc, SUBC_COPY, cl90b5::NOP);
        empty_push.emit(0);
        empty_push.validate();

        log::info!(
            "queue created (3d {:#x}, compute {:#x}, copy {:#x})",
            info.cls_eng3d,
            info.cls_compute,
            info.cls_copy
        );

        Ok(Self {
            dev: Arc::clone(dev),
            info,
            debug: DebugFlags::from_env(),
            registry,
            heap,
            images,
            samplers,
            zero_page,
            inner: Mutex::new(QueueInner {
                state: QueueState::default(),
                empty_push,
            }),
        })
    }

    /// The kernel device this queue submits to.
    pub fn device(&self) -> &Arc<dyn DrmDevice> {
        &self.dev
    }

    fn pool_dirty(cached: &Option<(Arc<Bo>, u32)>, bo: &Arc<Bo>, count: u32) -> bool {
        match cached {
            Some((cached_bo, cached_count)) => {
                cached_bo.handle() != bo.handle() || *cached_count != count
            }
            None => true,
        }
    }

    /// Emit the three pool-pointer words: address high, address low,
    /// highest valid index.
    fn emit_pool(push: &mut PushStream, subc: u8, mthd: u16, addr: u64, count: u32) {
        push.begin(HdrForm::NInc, subc, mthd);
        push.emit((addr >> 32) as u32);
        push.emit(addr as u32);
        push.emit(count - 1);
    }

    /// Rebuild the queue-state stream if a descriptor table's backing
    /// changed since the last submission.
    fn update_state_locked(&self, inner: &mut QueueInner) -> Result<(), DriverError> {
        let (img_bo, img_count) = self.images.snapshot();
        let (smp_bo, smp_count) = self.samplers.snapshot();

        let dirty = Self::pool_dirty(&inner.state.images, &img_bo, img_count)
            || Self::pool_dirty(&inner.state.samplers, &smp_bo, smp_count);
        if !dirty {
            return Ok(());
        }

        let mut push = PushStream::new(&self.dev, STATE_PUSH_WORDS)?;
        push.space(32)?;

        push.reference(&img_bo, AccessFlags::RD);
        Self::emit_pool(
            &mut push,
            SUBC_COMPUTE,
            cla0c0::SET_TEX_HEADER_POOL_A,
            img_bo.addr(),
            img_count,
        );
        push.immd(SUBC_COMPUTE, cla0c0::INVALIDATE_TEXTURE_HEADER_CACHE, 0);
        Self::emit_pool(
            &mut push,
            SUBC_3D,
            cl9097::SET_TEX_HEADER_POOL_A,
            img_bo.addr(),
            img_count,
        );
        push.immd(SUBC_3D, cl9097::INVALIDATE_TEXTURE_HEADER_CACHE_NO_WFI, 0);

        push.reference(&smp_bo, AccessFlags::RD);
        Self::emit_pool(
            &mut push,
            SUBC_COMPUTE,
            cla0c0::SET_TEX_SAMPLER_POOL_A,
            smp_bo.addr(),
            smp_count,
        );
        push.immd(SUBC_COMPUTE, cla0c0::INVALIDATE_SAMPLER_CACHE, 0);
        Self::emit_pool(
            &mut push,
            SUBC_3D,
            cl9097::SET_TEX_SAMPLER_POOL_A,
            smp_bo.addr(),
            smp_count,
        );
        push.immd(SUBC_3D, cl9097::INVALIDATE_SAMPLER_CACHE_NO_WFI, 0);

        push.validate();
        log::debug!(
            "queue state rebuilt: {img_count} image slots at {:#x}, {smp_count} sampler slots at {:#x}",
            img_bo.addr(),
            smp_bo.addr()
        );

        inner.state = QueueState {
            images: Some((img_bo, img_count)),
            samplers: Some((smp_bo, smp_count)),
            push: Some(push),
        };
        Ok(())
    }

    /// Build the kernel request for one stream and hand it off.
    ///
    /// Stream segments come first in the buffer list (read-only,
    /// host-shared), then the reference set with domains derived from each
    /// allocation's placement crossed with its accumulated access flags.
    fn submit_push(&self, push: &PushStream) -> Result<(), DriverError> {
        assert!(!push.is_host(), "host streams cannot be submitted");
        push.validate();

        if self.debug.contains(DebugFlags::PUSH_DUMP) {
            let _ = dump_push(&mut std::io::stderr(), push, &self.info);
        }

        let mut req = SubmitRequest::default();
        for seg in push.segments() {
            if seg.len == 0 {
                continue;
            }
            let bo = seg.bo.as_ref().expect("submittable segments are BO-backed");
            let bo_index = req.buffers.len() as u32;
            req.buffers.push(BoDescriptor {
                handle: bo.handle(),
                valid_domains: GEM_DOMAIN_GART,
                read_domains: GEM_DOMAIN_GART,
                write_domains: 0,
            });
            req.push_ranges.push(PushRange {
                bo_index,
                pad: 0,
                offset: 0,
                length: (seg.len * 4) as u64,
            });
        }

        if req.push_ranges.is_empty() {
            return Ok(());
        }

        for r in push.refs() {
            let domain = if r.bo.flags().contains(BoFlags::GART) {
                GEM_DOMAIN_GART
            } else {
                GEM_DOMAIN_VRAM
            };
            let mut desc = BoDescriptor {
                handle: r.bo.handle(),
                ..Default::default()
            };
            if r.access.contains(AccessFlags::RD) {
                desc.valid_domains |= domain;
                desc.read_domains |= domain;
            }
            if r.access.contains(AccessFlags::WR) {
                desc.valid_domains |= domain;
                desc.write_domains |= domain;
            }
            req.buffers.push(desc);
        }

        match self.dev.submit(&req) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!("kernel rejected submission: {err}");
                if self.debug.intersects(DebugFlags::PUSH_SYNC | DebugFlags::PUSH_DUMP) {
                    let _ = dump_push(&mut std::io::stderr(), push, &self.info);
                }
                // TODO: report the channel as gone and put the logical
                // device in a lost state instead of taking the process down.
                assert!(
                    err != DriverError::DeviceLost,
                    "kernel reported the device removed"
                );
                Err(err)
            }
        }
    }

    /// Submit `cmds` in order, signaling `signals` when they complete.
    ///
    /// With no streams, a NOP stream is submitted so the signals still
    /// fire. After a successful hand-off each stream's reference set is cut
    /// back to its declared static prefix. Serialized per queue; callers on
    /// other queues are unaffected.
    pub fn submit(
        &self,
        cmds: &mut [&mut PushStream],
        signals: &[&SyncObject],
    ) -> Result<(), DriverError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        self.update_state_locked(inner)?;

        // Pool pointers are sticky channel state: the rebuilt stream goes
        // down once, ahead of everything else. Kept around on failure so a
        // retry does not lose the reprogramming.
        if let Some(state_push) = inner.state.push.take() {
            if let Err(err) = self.submit_push(&state_push) {
                inner.state.push = Some(state_push);
                return Err(err);
            }
        }

        if cmds.is_empty() {
            let real_refs = inner.empty_push.num_refs();
            for sync in signals {
                inner.empty_push.reference(sync.bo(), AccessFlags::RDWR);
            }
            let result = self.submit_push(&inner.empty_push);
            inner.empty_push.truncate_refs(real_refs);
            result?;
        }

        for cmd in cmds.iter_mut() {
            for sync in signals {
                cmd.reference(sync.bo(), AccessFlags::RDWR);
            }
            if let Some((bo, _)) = &inner.state.images {
                cmd.reference(bo, AccessFlags::RD);
            }
            if let Some((bo, _)) = &inner.state.samplers {
                cmd.reference(bo, AccessFlags::RD);
            }
            cmd.reference(&self.zero_page, AccessFlags::RD);
            self.heap.add_refs(cmd, AccessFlags::RDWR);
            self.registry.add_refs(cmd);

            let result = self.submit_push(cmd);
            let static_refs = cmd.static_refs();
            cmd.truncate_refs(static_refs.min(cmd.num_refs()));
            result?;
        }

        for sync in signals {
            sync.mark_submitted();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("info", &self.info)
            .field("debug", &self.debug)
            .finish()
    }
}

static_assertions::assert_impl_all!(Queue: Send, Sync);
