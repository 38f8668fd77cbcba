//! The block-layer seam: requests handed to the transport and the
//! multi-queue tag sets that own their pre-allocated per-request storage.
//!
//! Tag allocation proper belongs to the block layer; this module models
//! the contract the transport consumes from it: fixed-depth tag tables per
//! hardware queue, tag-to-request lookup on the completion path, busy-tag
//! iteration for cancellation, and stopped/dying flags. Request timeouts
//! stay with the tag set owner; the transport runs no timer of its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::request::Request;
use crate::verbs::{DmaDir, SgEntry};

/// Operation of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqOp {
    Read,
    Write,
    Flush,
}

/// A block request as the multi-queue layer hands it over.
#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub op: ReqOp,
    pub nsid: u32,
    pub lba: u64,
    pub nr_bytes: u32,
    /// Physical segments of the data payload; empty for flushes.
    pub segments: Vec<SgEntry>,
}

impl BlockRequest {
    pub fn flush(nsid: u32) -> Self {
        BlockRequest {
            op: ReqOp::Flush,
            nsid,
            lba: 0,
            nr_bytes: 0,
            segments: Vec::new(),
        }
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(self.op, ReqOp::Write | ReqOp::Flush)
    }

    #[inline]
    pub fn is_flush(&self) -> bool {
        self.op == ReqOp::Flush
    }

    /// DMA direction of the payload transfer.
    #[inline]
    pub fn data_dir(&self) -> DmaDir {
        if self.is_write() {
            DmaDir::ToDevice
        } else {
            DmaDir::FromDevice
        }
    }
}

/// Terminal state of a request, observable by its submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed with an NVMe status code (phase bit already dropped).
    Complete { status: u16 },
    /// Failed but retryable; handed back for resubmission.
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RqLife {
    Idle,
    Prepared,
    Started,
    Done(Outcome),
}

/// One tag slot: lifecycle state, the bound block request, and the
/// transport's pre-allocated scratch.
pub struct TagEntry {
    tag: u16,
    hwq: usize,
    req: Request,
    life: Mutex<RqLife>,
    rq: Mutex<Option<BlockRequest>>,
}

impl TagEntry {
    #[inline]
    pub fn tag(&self) -> u16 {
        self.tag
    }

    #[inline]
    pub fn hwq(&self) -> usize {
        self.hwq
    }

    /// The transport scratch bound to this tag.
    #[inline]
    pub fn req(&self) -> &Request {
        &self.req
    }

    fn prepare(&self, rq: BlockRequest) -> bool {
        let mut life = self.life.lock().unwrap();
        if *life != RqLife::Idle {
            return false;
        }
        *life = RqLife::Prepared;
        *self.rq.lock().unwrap() = Some(rq);
        true
    }

    /// Start the request clock; from here the tag is busy.
    pub(crate) fn start(&self) {
        let mut life = self.life.lock().unwrap();
        debug_assert_eq!(*life, RqLife::Prepared);
        *life = RqLife::Started;
    }

    pub fn is_started(&self) -> bool {
        *self.life.lock().unwrap() == RqLife::Started
    }

    /// Move a started request to its terminal state. Returns `false` if
    /// the request was not in flight (lost race with another completer).
    pub(crate) fn finish(&self, outcome: Outcome) -> bool {
        let mut life = self.life.lock().unwrap();
        if *life != RqLife::Started {
            return false;
        }
        *life = RqLife::Done(outcome);
        true
    }

    /// The terminal outcome, if the request has reached one.
    pub fn outcome(&self) -> Option<Outcome> {
        match *self.life.lock().unwrap() {
            RqLife::Done(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Consume the outcome and free the tag for reuse.
    pub fn take_outcome(&self) -> Option<Outcome> {
        let mut life = self.life.lock().unwrap();
        match *life {
            RqLife::Done(outcome) => {
                *life = RqLife::Idle;
                *self.rq.lock().unwrap() = None;
                Some(outcome)
            }
            _ => None,
        }
    }

    pub(crate) fn with_rq<R>(&self, f: impl FnOnce(&BlockRequest) -> R) -> Option<R> {
        self.rq.lock().unwrap().as_ref().map(f)
    }
}

/// A multi-queue tag set: `nr_hw` hardware queues of `depth` tags each.
pub struct TagSet {
    depth: usize,
    reserved: usize,
    /// Per-request timeout; enforced by the tag-set owner, not in here.
    timeout: Duration,
    queues: Vec<Vec<Arc<TagEntry>>>,
    stopped: AtomicBool,
    dying: AtomicBool,
}

impl TagSet {
    /// Allocate the tag tables, building each tag's transport scratch with
    /// `init(hwq, tag)`.
    pub(crate) fn alloc(
        nr_hw: usize,
        depth: usize,
        reserved: usize,
        timeout: Duration,
        init: &dyn Fn(usize, u16) -> Result<Request>,
    ) -> Result<TagSet> {
        let mut queues = Vec::with_capacity(nr_hw);
        for hwq in 0..nr_hw {
            let mut tags = Vec::with_capacity(depth);
            for tag in 0..depth {
                tags.push(Arc::new(TagEntry {
                    tag: tag as u16,
                    hwq,
                    req: init(hwq, tag as u16)?,
                    life: Mutex::new(RqLife::Idle),
                    rq: Mutex::new(None),
                }));
            }
            queues.push(tags);
        }
        Ok(TagSet {
            depth,
            reserved,
            timeout,
            queues,
            stopped: AtomicBool::new(false),
            dying: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn nr_hw_queues(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get(&self, hwq: usize, tag: u16) -> Option<&Arc<TagEntry>> {
        self.queues.get(hwq)?.get(tag as usize)
    }

    /// Completion-path lookup: the tag must refer to an in-flight request.
    pub(crate) fn tag_to_rq(&self, hwq: usize, tag: u16) -> Option<&Arc<TagEntry>> {
        self.get(hwq, tag).filter(|e| e.is_started())
    }

    /// Bind a block request to a free (non-reserved) tag.
    pub fn prepare(&self, hwq: usize, rq: BlockRequest) -> Option<&Arc<TagEntry>> {
        let tags = self.queues.get(hwq)?;
        tags[self.reserved..].iter().find(|e| e.prepare(rq.clone()))
    }

    /// Visit every in-flight request across all hardware queues.
    pub(crate) fn busy_iter(&self, f: &mut dyn FnMut(&Arc<TagEntry>)) {
        for tags in &self.queues {
            for entry in tags {
                if entry.is_started() {
                    f(entry);
                }
            }
        }
    }

    /// Run the per-request re-init hook over every tag.
    pub(crate) fn reinit(&self, f: &dyn Fn(&Request) -> Result<()>) -> Result<()> {
        for tags in &self.queues {
            for entry in tags {
                f(&entry.req)?;
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn start(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn set_dying(&self, dying: bool) {
        self.dying.store(dying, Ordering::SeqCst);
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::SeqCst)
    }
}
