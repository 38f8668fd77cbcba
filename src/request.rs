//! Per-request transport scratch.
//!
//! Allocated once per tag when a tag set is built: the DMA-mapped send
//! capsule and a fast-registration MR, plus the per-submission state the
//! mapping policy and the completion path share.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::capsule::Capsule;
use crate::config::MAX_SEGMENTS;
use crate::device::DeviceEntry;
use crate::error::Result;
use crate::verbs::{DmaDir, DmaSegment, MemoryRegion, Sge, MAX_SEND_SGES};
use crate::wire::CMD_SIZE;

/// Mutable per-submission state. Reset by the mapping policy on every
/// submit; the completion path reads `need_inval` to decide on local
/// invalidation.
pub(crate) struct ReqScratch {
    pub sge: [Sge; MAX_SEND_SGES],
    pub num_sge: usize,
    /// DMA-mapped segments of the current payload.
    pub mapped: Vec<DmaSegment>,
    pub dir: Option<DmaDir>,
    pub inline_data: bool,
    pub need_inval: bool,
}

pub struct Request {
    sqe: Capsule,
    mr: Mutex<Option<Arc<dyn MemoryRegion>>>,
    scratch: Mutex<ReqScratch>,
}

impl Request {
    pub(crate) fn new(dev: &DeviceEntry, max_fr_pages: u32) -> Result<Request> {
        let sqe = Capsule::alloc(dev.dev(), CMD_SIZE, DmaDir::ToDevice)?;
        let mr = dev.pd().alloc_mr(max_fr_pages)?;
        Ok(Request {
            sqe,
            mr: Mutex::new(Some(mr)),
            scratch: Mutex::new(ReqScratch {
                sge: [Sge::default(); MAX_SEND_SGES],
                num_sge: 0,
                mapped: Vec::with_capacity(MAX_SEGMENTS as usize),
                dir: None,
                inline_data: false,
                need_inval: false,
            }),
        })
    }

    /// Re-init after teardown: a request whose MR key was consumed gets a
    /// fresh MR before the tag can carry traffic again.
    pub(crate) fn reinit(&self, dev: &DeviceEntry, max_fr_pages: u32) -> Result<()> {
        let mut scratch = self.scratch.lock().unwrap();
        if !scratch.need_inval {
            return Ok(());
        }
        let mut mr = self.mr.lock().unwrap();
        *mr = None;
        *mr = Some(dev.pd().alloc_mr(max_fr_pages)?);
        scratch.need_inval = false;
        Ok(())
    }

    #[inline]
    pub(crate) fn sqe(&self) -> &Capsule {
        &self.sqe
    }

    pub(crate) fn mr(&self) -> Option<Arc<dyn MemoryRegion>> {
        self.mr.lock().unwrap().clone()
    }

    pub(crate) fn scratch(&self) -> MutexGuard<'_, ReqScratch> {
        self.scratch.lock().unwrap()
    }

    /// Current remote key of the request's MR.
    pub fn mr_rkey(&self) -> Option<u32> {
        self.mr.lock().unwrap().as_ref().map(|mr| mr.rkey())
    }

    /// Whether the last mapping took the fast-registration path and the
    /// key has not been invalidated remotely.
    pub fn need_invalidate(&self) -> bool {
        self.scratch.lock().unwrap().need_inval
    }

    /// Whether the last mapping chose the in-capsule encoding.
    pub fn inline_data(&self) -> bool {
        self.scratch.lock().unwrap().inline_data
    }
}
