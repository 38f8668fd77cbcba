//! One NVMe queue over one RDMA reliable connection.
//!
//! A queue owns its CM id, queue pair, completion queue and receive ring.
//! Establishment is driven by the CM event callback through a sub-state
//! machine (address resolved, route resolved, established); the init call
//! blocks on a single-shot gate the callback completes. The submit and
//! completion hot paths live here too.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::blk::{Outcome, TagEntry};
use crate::capsule::{alloc_ring, Capsule};
use crate::config::{CONNECT_TIMEOUT_MS, MAX_INLINE_SEGMENTS, SEND_SIG_INTERVAL};
use crate::controller::Ctrl;
use crate::device::DeviceEntry;
use crate::error::{Result, SubmitError};
use crate::mapping;
use crate::verbs::{
    CmDisposition, CmEvent, CmEventHandler, CmId, CompletionQueue, DmaDir, MrAccess, QpInitAttr,
    QueuePair, RecvWr, SendWr, Sge, Wc, WcStatus, WrId, WrKind, MAX_SEND_SGES,
};
use crate::wire::{self, CmReject, CmRequest, Command, Completion, CMD_SIZE, CQE_SIZE};

/// Work requests a single in-flight request can occupy in the send queue:
/// memory registration, the send itself, and a local invalidate.
const SEND_WR_FACTOR: usize = 3;

/// Completion queue sizing adds the receive side on top.
const CQ_FACTOR: usize = SEND_WR_FACTOR + 1;

/// Single-shot completion gate for the CM handshake.
struct CmGate {
    done: Mutex<bool>,
    cv: Condvar,
}

impl CmGate {
    fn new() -> Self {
        CmGate {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn reset(&self) {
        *self.done.lock().unwrap() = false;
    }

    fn complete(&self) {
        *self.done.lock().unwrap() = true;
        self.cv.notify_all();
    }

    /// Wait for completion; returns `false` on timeout.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let (done, _res) = self
            .cv
            .wait_timeout_while(self.done.lock().unwrap(), timeout, |done| !*done)
            .unwrap();
        *done
    }
}

/// The verbs-side resources of a connected queue, created at address
/// resolution and torn down as one unit.
struct QueueIb {
    dev: Arc<DeviceEntry>,
    cq: Arc<dyn CompletionQueue>,
    qp: Arc<dyn QueuePair>,
    ring: Vec<Capsule>,
}

pub struct Queue {
    weak_self: Weak<Queue>,
    ctrl: Weak<Ctrl>,
    idx: usize,
    queue_size: AtomicUsize,
    cmnd_capsule_len: AtomicUsize,
    /// Wrapping unsignaled-send counter driving the signaling policy.
    sig_count: AtomicU32,
    /// The queue is live iff this is set; teardown clears it first, which
    /// is what makes `free` idempotent.
    connected: AtomicBool,
    /// Last CM error as an OS error code; the gate's verdict.
    cm_error: Mutex<i32>,
    cm_gate: CmGate,
    cm_id: Mutex<Option<Arc<dyn CmId>>>,
    ib: RwLock<Option<QueueIb>>,
}

impl Queue {
    pub(crate) fn new(ctrl: Weak<Ctrl>, idx: usize) -> Arc<Queue> {
        Arc::new_cyclic(|weak| Queue {
            weak_self: weak.clone(),
            ctrl,
            idx,
            queue_size: AtomicUsize::new(0),
            cmnd_capsule_len: AtomicUsize::new(CMD_SIZE),
            sig_count: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            cm_error: Mutex::new(0),
            cm_gate: CmGate::new(),
            cm_id: Mutex::new(None),
            ib: RwLock::new(None),
        })
    }

    #[inline]
    pub fn idx(&self) -> usize {
        self.idx
    }

    #[inline]
    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Capsule bytes available for in-capsule data.
    #[inline]
    pub fn inline_data_size(&self) -> usize {
        self.cmnd_capsule_len.load(Ordering::Relaxed) - CMD_SIZE
    }

    fn ctrl(&self) -> Option<Arc<Ctrl>> {
        self.ctrl.upgrade()
    }

    fn set_cm_error(&self, err: i32) {
        *self.cm_error.lock().unwrap() = err;
    }

    /// Resolve, connect and arm the queue. Blocks on the CM gate.
    pub(crate) fn init(&self, size: usize) -> Result<()> {
        let ctrl = self.ctrl().ok_or(crate::error::Error::Busy)?;

        self.cmnd_capsule_len.store(
            if self.idx > 0 {
                ctrl.ident().ioccsz as usize * 16
            } else {
                CMD_SIZE
            },
            Ordering::Relaxed,
        );
        self.queue_size.store(size, Ordering::Relaxed);
        self.set_cm_error(libc::ETIMEDOUT);
        self.cm_gate.reset();

        let handler: Weak<dyn CmEventHandler> = self.weak_self.clone();
        let cm_id = match ctrl.provider().create_cm_id(handler) {
            Ok(id) => id,
            Err(e) => {
                log::info!("queue {}: failed to create CM ID: {}", self.idx, e);
                return Err(e.into());
            }
        };
        *self.cm_id.lock().unwrap() = Some(cm_id.clone());

        if let Err(e) = cm_id.resolve_addr(ctrl.addr(), CONNECT_TIMEOUT_MS) {
            log::info!("queue {}: rdma_resolve_addr failed ({})", self.idx, e);
            self.teardown_after_init_failure();
            return Err(e.into());
        }

        if let Err(e) = self.wait_for_cm() {
            log::info!("queue {}: rdma_resolve_addr wait failed ({})", self.idx, e);
            self.teardown_after_init_failure();
            return Err(e.into());
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn wait_for_cm(&self) -> std::io::Result<()> {
        self.cm_gate
            .wait_timeout(Duration::from_millis(CONNECT_TIMEOUT_MS as u64 + 100));
        match *self.cm_error.lock().unwrap() {
            0 => Ok(()),
            err => Err(std::io::Error::from_raw_os_error(err)),
        }
    }

    fn teardown_after_init_failure(&self) {
        self.destroy_ib();
        *self.cm_id.lock().unwrap() = None;
    }

    /// Disconnect and release everything. Idempotent: the first caller to
    /// clear the connected flag owns the teardown.
    pub(crate) fn free(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(cm_id) = self.cm_id.lock().unwrap().clone() {
            let _ = cm_id.disconnect();
        }
        if let Some(ib) = self.ib.read().unwrap().as_ref() {
            ib.qp.drain();
        }
        self.destroy_ib();
        *self.cm_id.lock().unwrap() = None;
    }

    fn destroy_ib(&self) {
        // Dropping the bundle releases QP, CQ, ring capsules and the
        // device reference in one motion.
        *self.ib.write().unwrap() = None;
    }

    /// The device entry this queue resolved onto, while connected.
    pub(crate) fn device_entry(&self) -> Option<Arc<DeviceEntry>> {
        self.ib.read().unwrap().as_ref().map(|ib| ib.dev.clone())
    }

    // ---- CM sub-state machine -------------------------------------------

    fn create_queue_ib(&self, dev: Arc<DeviceEntry>) -> std::io::Result<()> {
        let cm_id = self
            .cm_id
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| std::io::Error::from_raw_os_error(libc::EINVAL))?;
        let size = self.queue_size();
        let attrs = dev.dev().attrs();

        // The admin queue is barely used once the controller is live, so
        // it stays on vector 0.
        let comp_vector = if self.idx == 0 {
            0
        } else {
            self.idx as u32 % attrs.num_comp_vectors.max(1)
        };

        let cq = dev
            .dev()
            .alloc_cq((CQ_FACTOR * size + 1) as u32, comp_vector)?;

        // +1 on each side for the drain work request.
        let qp = cm_id.create_qp(
            dev.pd(),
            &cq,
            QpInitAttr {
                max_send_wr: (SEND_WR_FACTOR * size + 1) as u32,
                max_recv_wr: (size + 1) as u32,
                max_send_sge: (1 + MAX_INLINE_SEGMENTS) as u32,
                max_recv_sge: 1,
            },
        )?;

        let ring = alloc_ring(dev.dev(), size, CQE_SIZE, DmaDir::FromDevice)
            .map_err(|_| std::io::Error::from_raw_os_error(libc::ENOMEM))?;

        *self.ib.write().unwrap() = Some(QueueIb { dev, cq, qp, ring });
        Ok(())
    }

    fn addr_resolved(&self) -> i32 {
        let ctrl = match self.ctrl() {
            Some(ctrl) => ctrl,
            None => return libc::ECONNRESET,
        };
        let cm_id = match self.cm_id.lock().unwrap().clone() {
            Some(id) => id,
            None => return libc::ECONNRESET,
        };
        let dev = match cm_id.device() {
            Some(dev) => dev,
            None => return libc::ECONNREFUSED,
        };

        let entry = match ctrl
            .registry()
            .find_or_create(&dev, ctrl.register_always())
        {
            Ok(entry) => entry,
            Err(_) => {
                log::error!("queue {}: no usable device state", self.idx);
                return libc::ECONNREFUSED;
            }
        };

        if let Err(e) = self.create_queue_ib(entry) {
            log::error!("queue {}: creating queue resources failed ({})", self.idx, e);
            return e.raw_os_error().unwrap_or(libc::ENOMEM);
        }

        if let Err(e) = cm_id.resolve_route(CONNECT_TIMEOUT_MS) {
            log::error!("queue {}: rdma_resolve_route failed ({})", self.idx, e);
            self.destroy_ib();
            return e.raw_os_error().unwrap_or(libc::ECONNRESET);
        }

        0
    }

    fn route_resolved(&self) -> i32 {
        let ctrl = match self.ctrl() {
            Some(ctrl) => ctrl,
            None => return libc::ECONNRESET,
        };
        let cm_id = match self.cm_id.lock().unwrap().clone() {
            Some(id) => id,
            None => return libc::ECONNRESET,
        };

        let (qp_num, responder_resources) = {
            let ib = self.ib.read().unwrap();
            match ib.as_ref() {
                Some(ib) => (ib.qp.qp_num(), ib.dev.dev().attrs().max_qp_rd_atom),
                None => return libc::ECONNRESET,
            }
        };

        let size = self.queue_size() as u16;
        let param = crate::verbs::ConnParam {
            qp_num,
            flow_control: true,
            responder_resources,
            // The CM clamps this down to its own retry maximum.
            retry_count: ctrl.tl_retry_count(),
            rnr_retry_count: 7,
            private_data: CmRequest::new(self.idx as u16, size, size).to_bytes(),
        };

        if let Err(e) = cm_id.connect(param) {
            log::error!("queue {}: rdma_connect failed ({})", self.idx, e);
            self.destroy_ib();
            return e.raw_os_error().unwrap_or(libc::ECONNRESET);
        }

        0
    }

    /// Pre-post the whole receive ring. Completions have nowhere to land
    /// until this is done, so it happens before the gate is signaled.
    fn conn_established(&self) -> i32 {
        let err = {
            let ib_guard = self.ib.read().unwrap();
            let ib = match ib_guard.as_ref() {
                Some(ib) => ib,
                None => return libc::ECONNRESET,
            };
            let mut err = 0;
            for i in 0..self.queue_size() {
                if let Err(e) = self.post_recv(ib, i as u32) {
                    err = e.raw_os_error().unwrap_or(libc::ENOMEM);
                    break;
                }
            }
            err
        };
        if err != 0 {
            self.destroy_ib();
        }
        err
    }

    fn conn_rejected(&self, private_data: Option<Vec<u8>>) -> i32 {
        match private_data {
            Some(data) => match CmReject::parse(&data) {
                Some(rej) => log::error!("Connect rejected, status {}.", rej.sts),
                None => log::error!("Connect rejected, unparseable private data."),
            },
            None => log::error!("Connect rejected, no private data."),
        }
        libc::ECONNRESET
    }

    /// Device-unplug protocol. The queue disables itself, drives
    /// controller deletion to completion, tears down its own resources and
    /// then asks the CM layer to destroy the id that delivered the event.
    /// Destroying this CM id from inside its own callback would deadlock,
    /// hence the asymmetric disposition.
    fn device_unplug(&self) -> CmDisposition {
        // First disable the queue so the controller delete won't free it.
        if !self.connected.swap(false, Ordering::SeqCst) {
            return CmDisposition::Keep;
        }

        let ctrl = match self.ctrl() {
            Some(ctrl) => ctrl,
            None => return CmDisposition::Keep,
        };

        if ctrl.start_delete().is_err() {
            return CmDisposition::Keep;
        }
        log::warn!("Got rdma device removal event, deleting ctrl");
        ctrl.flush_delete();

        // Free this queue ourselves; the delete worker skipped it.
        if let Some(cm_id) = self.cm_id.lock().unwrap().clone() {
            let _ = cm_id.disconnect();
        }
        if let Some(ib) = self.ib.read().unwrap().as_ref() {
            ib.qp.drain();
        }
        self.destroy_ib();
        *self.cm_id.lock().unwrap() = None;

        CmDisposition::DestroyId
    }

    // ---- hot paths ------------------------------------------------------

    fn post_recv(&self, ib: &QueueIb, index: u32) -> std::io::Result<()> {
        let capsule = &ib.ring[index as usize];
        let wr = RecvWr {
            wr_id: WrId::new(WrKind::Recv, index),
            sge: Sge {
                addr: capsule.dma(),
                length: CQE_SIZE as u32,
                lkey: ib.dev.pd().local_dma_lkey(),
            },
        };
        ib.qp.post_recv(&wr).inspect_err(|e| {
            log::error!("queue {}: post_recv failed with error code {}", self.idx, e);
        })
    }

    fn post_send(
        &self,
        ib: &QueueIb,
        capsule: &Capsule,
        index: u32,
        extra_sge: Option<Sge>,
        first: Option<SendWr>,
        flush: bool,
    ) -> std::io::Result<()> {
        let mut sge = [Sge::default(); MAX_SEND_SGES];
        sge[0] = Sge {
            addr: capsule.dma(),
            length: CMD_SIZE as u32,
            lkey: ib.dev.pd().local_dma_lkey(),
        };
        let mut num_sge = 1;
        if let Some(extra) = extra_sge {
            sge[1] = extra;
            num_sge = 2;
        }

        // Unsignaled sends never release send-queue slots on their own, so
        // every 32nd send is signaled. Flushes are always signaled: the
        // block layer may free a flush request before an unsignaled
        // completion would have surfaced.
        let count = self.sig_count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let signaled = count % SEND_SIG_INTERVAL == 0 || flush;

        let send = SendWr::Send {
            wr_id: WrId::new(WrKind::Send, index),
            sge,
            num_sge,
            signaled,
        };

        let res = match first {
            Some(first) => ib.qp.post_send(&[first, send]),
            None => ib.qp.post_send(&[send]),
        };
        res.inspect_err(|e| {
            log::error!("queue {}: post_send failed with error code {}", self.idx, e);
        })
    }

    /// Submit one prepared block request. `Busy` means the block layer
    /// should back off and requeue.
    pub fn queue_rq(&self, entry: &Arc<TagEntry>) -> std::result::Result<(), SubmitError> {
        let ctrl = self.ctrl().ok_or(SubmitError::Busy)?;
        let ib_guard = self.ib.read().unwrap();
        let ib = ib_guard.as_ref().ok_or(SubmitError::Busy)?;
        let req = entry.req();
        let sqe = req.sqe();

        sqe.sync_for_cpu();

        let mut cmd = Command::default();
        entry
            .with_rq(|rq| ctrl.ops().setup_cmd(rq, &mut cmd))
            .ok_or(SubmitError::Busy)??;

        cmd.set_command_id(entry.tag());
        entry.start();

        let map_res = entry
            .with_rq(|rq| {
                mapping::map_data(
                    &ib.dev,
                    self.idx,
                    self.inline_data_size(),
                    ctrl.ident().icdoff,
                    ctrl.register_always(),
                    req,
                    rq,
                    &mut cmd,
                )
            })
            .unwrap_or_else(|| Err(std::io::Error::from_raw_os_error(libc::EINVAL)));
        if let Err(e) = map_res {
            log::error!("queue {}: Failed to map data ({})", self.idx, e);
            entry.with_rq(|rq| ctrl.ops().cleanup_cmd(rq));
            return Err(SubmitError::Busy);
        }

        sqe.write_cmd(&cmd);
        sqe.sync_for_device();

        let (extra_sge, first, flush) = {
            let scratch = req.scratch();
            let extra = if scratch.inline_data {
                Some(scratch.sge[1])
            } else {
                None
            };
            let first = if scratch.need_inval {
                let mr = req.mr().ok_or(SubmitError::Busy)?;
                let key = mr.rkey();
                Some(SendWr::RegMr {
                    wr_id: WrId::new(WrKind::RegMr, entry.tag() as u32),
                    mr,
                    key,
                    access: MrAccess::LOCAL_WRITE | MrAccess::REMOTE_READ | MrAccess::REMOTE_WRITE,
                })
            } else {
                None
            };
            let flush = entry.with_rq(|rq| rq.is_flush()).unwrap_or(false);
            (extra, first, flush)
        };

        if self
            .post_send(ib, sqe, entry.tag() as u32, extra_sge, first, flush)
            .is_err()
        {
            self.unmap_data(Some(ib), entry);
            return Err(SubmitError::Busy);
        }

        Ok(())
    }

    /// Post the async-event command from the controller's dedicated
    /// capsule. Not tracked in any tag set.
    pub(crate) fn post_aen(&self, capsule: &Capsule, command_id: u16) -> std::io::Result<()> {
        let ib_guard = self.ib.read().unwrap();
        let ib = ib_guard
            .as_ref()
            .ok_or_else(|| std::io::Error::from_raw_os_error(libc::ENOTCONN))?;
        self.post_send(ib, capsule, command_id as u32, None, None, false)
    }

    /// Release a request's data mapping: post the local invalidate if the
    /// remote key is still live, unmap the sg list, and let the generic
    /// layer clean the command up.
    fn unmap_data(&self, ib: Option<&QueueIb>, entry: &Arc<TagEntry>) {
        let nr_bytes = entry.with_rq(|rq| rq.nr_bytes).unwrap_or(0);
        if nr_bytes == 0 {
            return;
        }

        let req = entry.req();
        {
            let mut scratch = req.scratch();
            if scratch.need_inval {
                let rkey = req.mr_rkey().unwrap_or(0);
                let posted = ib
                    .map(|ib| {
                        ib.qp.post_send(&[SendWr::LocalInv {
                            wr_id: WrId::new(WrKind::LocalInv, entry.tag() as u32),
                            rkey,
                        }])
                    })
                    .unwrap_or_else(|| Err(std::io::Error::from_raw_os_error(libc::ENOTCONN)));
                if let Err(e) = posted {
                    log::error!(
                        "queue {}: Queueing INV WR for rkey {:#x} failed ({})",
                        self.idx,
                        rkey,
                        e
                    );
                    if let Some(ctrl) = self.ctrl() {
                        ctrl.error_recovery();
                    }
                }
            }

            if let (Some(dir), Some(ib)) = (scratch.dir.take(), ib) {
                ib.dev.dev().dma_unmap_sg(&scratch.mapped, dir);
            }
            scratch.mapped.clear();
        }

        if let Some(ctrl) = self.ctrl() {
            entry.with_rq(|rq| ctrl.ops().cleanup_cmd(rq));
        }
    }

    /// Finish a request: unmap, then either retry or surface the status.
    fn complete_request(&self, ib: Option<&QueueIb>, entry: &Arc<TagEntry>, status: u16) {
        if !entry.is_started() {
            return;
        }

        self.unmap_data(ib, entry);

        let ctrl = match self.ctrl() {
            Some(ctrl) => ctrl,
            None => return,
        };
        if status != wire::NVME_SC_SUCCESS {
            let retry = entry
                .with_rq(|rq| ctrl.ops().needs_retry(rq, status))
                .unwrap_or(false);
            if retry {
                entry.finish(Outcome::Requeued);
                return;
            }
        }
        entry.finish(Outcome::Complete { status });
    }

    fn wr_error(&self, wc: &Wc, op: &str) {
        if let Some(ctrl) = self.ctrl() {
            if ctrl.state() == crate::controller::CtrlState::Connected {
                log::error!(
                    "queue {}: {} for WR {:?} failed with status {}",
                    self.idx,
                    op,
                    wc.wr_id,
                    wc.status
                );
            }
            ctrl.error_recovery();
        }
    }

    fn process_rsp(&self, ib: &QueueIb, cqe: &Completion, wc: &Wc, tag: Option<u16>) -> bool {
        let status = cqe.status() >> 1;
        let ctrl = match self.ctrl() {
            Some(ctrl) => ctrl,
            None => return false,
        };

        let tag_set = match ctrl.tagset_for(self.idx) {
            Some(ts) => ts,
            None => return false,
        };
        let hwq = if self.idx == 0 { 0 } else { self.idx - 1 };
        let entry = match tag_set.tag_to_rq(hwq, cqe.command_id()) {
            Some(entry) => entry.clone(),
            None => {
                log::error!(
                    "queue {}: tag {:#x} on QP {:#x} not found",
                    self.idx,
                    cqe.command_id(),
                    ib.qp.qp_num()
                );
                ctrl.error_recovery();
                return false;
            }
        };

        let found = tag == Some(entry.tag());

        // The peer may have invalidated our rkey remotely; if the reported
        // key matches, skip the local invalidate later.
        if let Some(inv_rkey) = wc.invalidate_rkey {
            if entry.req().mr_rkey() == Some(inv_rkey) {
                entry.req().scratch().need_inval = false;
            }
        }

        self.complete_request(Some(ib), &entry, status);
        found
    }

    fn recv_done(&self, ib: &QueueIb, wc: &Wc, tag: Option<u16>) -> bool {
        if wc.status != WcStatus::Success {
            self.wr_error(wc, "RECV");
            return false;
        }

        let index = wc.wr_id.index() as usize;
        let capsule = match ib.ring.get(index) {
            Some(capsule) => capsule,
            None => {
                self.wr_error(wc, "RECV");
                return false;
            }
        };

        capsule.sync_for_cpu();
        let cqe = capsule.read_cqe();

        // AEN completions are special: they carry a command id beyond the
        // admin tag space, never time out, and are re-armed by a worker.
        let found = if self.idx == 0
            && cqe.command_id() as usize >= crate::config::AQ_BLKMQ_DEPTH
        {
            if let Some(ctrl) = self.ctrl() {
                ctrl.complete_async_event(&cqe);
            }
            false
        } else {
            self.process_rsp(ib, &cqe, wc, tag)
        };

        capsule.sync_for_device();
        let _ = self.post_recv(ib, wc.wr_id.index());
        found
    }

    fn dispatch_wc(&self, ib: &QueueIb, wc: &Wc, tag: Option<u16>) -> bool {
        match wc.wr_id.kind() {
            WrKind::Recv => self.recv_done(ib, wc, tag),
            WrKind::Send => {
                if wc.status != WcStatus::Success {
                    self.wr_error(wc, "SEND");
                }
                false
            }
            WrKind::RegMr => {
                if wc.status != WcStatus::Success {
                    self.wr_error(wc, "MEMREG");
                }
                false
            }
            WrKind::LocalInv => {
                if wc.status != WcStatus::Success {
                    self.wr_error(wc, "LOCAL_INV");
                }
                false
            }
        }
    }

    /// Drain and dispatch everything currently in the completion queue.
    /// This is the completion-side entry point the interrupt (or test)
    /// context drives.
    pub fn process_completions(&self) {
        let ib_guard = self.ib.read().unwrap();
        let ib = match ib_guard.as_ref() {
            Some(ib) => ib,
            None => return,
        };
        while let Some(wc) = ib.cq.poll_one() {
            self.dispatch_wc(ib, &wc, None);
        }
    }

    /// Opportunistic drain looking for a specific tag. Returns whether a
    /// receive completion for `tag` was consumed.
    pub fn poll(&self, tag: u16) -> bool {
        let ib_guard = self.ib.read().unwrap();
        let ib = match ib_guard.as_ref() {
            Some(ib) => ib,
            None => return false,
        };
        ib.cq.arm();
        let mut found = false;
        while let Some(wc) = ib.cq.poll_one() {
            found |= self.dispatch_wc(ib, &wc, Some(tag));
        }
        found
    }

    /// Cancel one in-flight request with the given status; used by error
    /// recovery and shutdown.
    pub(crate) fn cancel_request(&self, entry: &Arc<TagEntry>, status: u16) {
        log::debug!("queue {}: cancelling I/O {}", self.idx, entry.tag());
        let ib_guard = self.ib.read().unwrap();
        self.complete_request(ib_guard.as_ref(), entry, status);
    }
}

impl CmEventHandler for Queue {
    fn cm_event(&self, event: CmEvent) -> CmDisposition {
        log::debug!("queue {}: CM event {:?}", self.idx, event);
        match event {
            CmEvent::AddrResolved => {
                let err = self.addr_resolved();
                if err != 0 {
                    self.set_cm_error(err);
                    self.cm_gate.complete();
                }
            }
            CmEvent::RouteResolved => {
                let err = self.route_resolved();
                if err != 0 {
                    self.set_cm_error(err);
                    self.cm_gate.complete();
                }
            }
            CmEvent::Established => {
                self.set_cm_error(self.conn_established());
                self.cm_gate.complete();
            }
            CmEvent::Rejected(private_data) => {
                self.set_cm_error(self.conn_rejected(private_data));
                self.cm_gate.complete();
            }
            CmEvent::AddrError
            | CmEvent::RouteError
            | CmEvent::ConnectError
            | CmEvent::Unreachable => {
                log::debug!("queue {}: CM error event", self.idx);
                self.set_cm_error(libc::ECONNRESET);
                self.cm_gate.complete();
            }
            CmEvent::Disconnected | CmEvent::AddrChange | CmEvent::TimewaitExit => {
                log::debug!("queue {}: disconnect received, connection closed", self.idx);
                if let Some(ctrl) = self.ctrl() {
                    ctrl.error_recovery();
                }
            }
            CmEvent::DeviceRemoval => return self.device_unplug(),
        }
        CmDisposition::Keep
    }
}
