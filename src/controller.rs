//! The per-controller transport engine: lifecycle state machine, the
//! queue vector, and the background workers that drive error recovery,
//! reconnection, reset and deletion.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::blk::TagSet;
use crate::capsule::Capsule;
use crate::config::{TransportConfig, ADMIN_TIMEOUT, AQ_BLKMQ_DEPTH, AQ_DEPTH, IO_TIMEOUT, MAX_SEGMENTS, PAGE_SHIFT};
use crate::device::{DeviceEntry, DeviceRegistry};
use crate::error::{Error, Result};
use crate::fabrics::CtrlOptions;
use crate::mapping;
use crate::nvme::{IdentifyParams, NvmeOps};
use crate::queue::Queue;
use crate::request::Request;
use crate::transport::RdmaTransport;
use crate::verbs::{DmaDir, Provider};
use crate::wire::{
    self, cap_mqes, Command, Completion, CMD_SIZE, NVME_AER_MASK, NVME_AER_NOTICE_NS_CHANGED,
    NVME_CTRL_SGLS_KEYED, NVME_OPC_ASYNC_EVENT_REQUEST, NVME_REG_CAP,
};
use crate::workqueue::{Work, WorkQueue};

/// Controller lifecycle states.
///
/// `Connecting` is initial and never re-entered; `Deleting` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlState {
    Connecting,
    Connected,
    Reconnecting,
    Resetting,
    Deleting,
}

struct Works {
    reconnect: Work,
    err: Work,
    delete: Work,
    /// Dead-controller removal after a failed reset; distinct from the
    /// normal delete work on purpose.
    remove_dead: Work,
    reset: Work,
    scan: Work,
    async_event: Work,
}

pub struct Ctrl {
    state: Mutex<CtrlState>,
    queues: Vec<Arc<Queue>>,
    queue_count: AtomicUsize,

    ops: Arc<dyn NvmeOps>,
    provider: Arc<dyn Provider>,
    registry: Arc<DeviceRegistry>,
    config: TransportConfig,
    wq: Arc<WorkQueue>,
    transport: Weak<RdmaTransport>,
    opts: CtrlOptions,

    device: Mutex<Option<Arc<DeviceEntry>>>,
    cap: AtomicU64,
    max_fr_pages: AtomicU32,
    max_hw_sectors: AtomicU32,
    sqsize: AtomicUsize,
    ident: Mutex<IdentifyParams>,
    reconnect_delay: Duration,

    admin_tags: RwLock<Option<Arc<TagSet>>>,
    io_tags: RwLock<Option<Arc<TagSet>>>,
    async_event_sqe: Mutex<Option<Capsule>>,

    works: Works,
}

impl std::fmt::Debug for Ctrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctrl")
            .field("state", &*self.state.lock().unwrap())
            .finish_non_exhaustive()
    }
}

fn make_work<F>(weak: &Weak<Ctrl>, f: F) -> Work
where
    F: Fn(&Ctrl) + Send + Sync + 'static,
{
    let weak = weak.clone();
    Work::new(move || {
        if let Some(ctrl) = weak.upgrade() {
            f(&ctrl);
        }
    })
}

impl Ctrl {
    pub(crate) fn create(
        transport: &RdmaTransport,
        opts: CtrlOptions,
        ops: Arc<dyn NvmeOps>,
    ) -> Result<Arc<Ctrl>> {
        let nr_queues = opts.nr_io_queues + 1;
        let config = transport.config().clone();
        let reconnect_delay =
            Duration::from_secs(opts.reconnect_delay.unwrap_or(config.reconnect_delay_secs));

        let ctrl = Arc::new_cyclic(|weak: &Weak<Ctrl>| Ctrl {
            state: Mutex::new(CtrlState::Connecting),
            queues: (0..nr_queues).map(|i| Queue::new(weak.clone(), i)).collect(),
            queue_count: AtomicUsize::new(nr_queues),
            ops,
            provider: transport.provider().clone(),
            registry: transport.registry().clone(),
            config,
            wq: transport.wq().clone(),
            transport: transport.weak_self(),
            sqsize: AtomicUsize::new(opts.queue_size),
            opts,
            device: Mutex::new(None),
            cap: AtomicU64::new(0),
            max_fr_pages: AtomicU32::new(0),
            max_hw_sectors: AtomicU32::new(0),
            ident: Mutex::new(IdentifyParams::default()),
            reconnect_delay,
            admin_tags: RwLock::new(None),
            io_tags: RwLock::new(None),
            async_event_sqe: Mutex::new(None),
            works: Works {
                reconnect: make_work(weak, Ctrl::reconnect_ctrl_work),
                err: make_work(weak, Ctrl::error_recovery_work),
                delete: make_work(weak, Ctrl::del_ctrl_work),
                remove_dead: make_work(weak, Ctrl::remove_ctrl_work),
                reset: make_work(weak, Ctrl::reset_ctrl_work),
                scan: make_work(weak, Ctrl::scan_work),
                async_event: make_work(weak, Ctrl::async_event_work),
            },
        });

        ctrl.setup()?;
        transport.add_ctrl(&ctrl);

        ctrl.wq.queue(&ctrl.works.scan);
        ctrl.wq.queue(&ctrl.works.async_event);
        Ok(ctrl)
    }

    fn setup(&self) -> Result<()> {
        self.configure_admin_queue()?;

        let granted = match self.ops.set_queue_count(self.opts.nr_io_queues) {
            Ok(n) => n.min(self.opts.nr_io_queues),
            Err(e) => {
                log::info!("set_queue_count failed: {}", e);
                self.destroy_admin_queue();
                return Err(e);
            }
        };
        self.queue_count.store(granted + 1, Ordering::SeqCst);
        log::info!("creating {} I/O queues.", granted);

        if let Err(e) = self.init_io_queues() {
            self.destroy_admin_queue();
            return Err(e);
        }

        let dev = match self.device.lock().unwrap().clone() {
            Some(dev) => dev,
            None => {
                self.unwind_setup();
                return Err(Error::Busy);
            }
        };
        let max_fr_pages = self.max_fr_pages.load(Ordering::SeqCst);
        let depth = self.sqsize.load(Ordering::SeqCst);
        let io_tags = match TagSet::alloc(granted, depth, 1, IO_TIMEOUT, &|_, _| {
            Request::new(&dev, max_fr_pages)
        }) {
            Ok(ts) => Arc::new(ts),
            Err(e) => {
                self.unwind_setup();
                return Err(e);
            }
        };
        *self.io_tags.write().unwrap() = Some(io_tags);

        if let Err(e) = self.connect_io_queues() {
            self.unwind_setup();
            return Err(e);
        }

        // Protocol sanity: in-capsule data offsets and providers without
        // keyed SGL support cannot work with this transport.
        let ident = self.ident();
        if ident.icdoff != 0 {
            log::error!("icdoff is not supported!");
            self.unwind_setup();
            return Err(Error::Incompatible("icdoff is not supported"));
        }
        if ident.sgls & NVME_CTRL_SGLS_KEYED == 0 {
            log::error!("Mandatory keyed sgls are not supported!");
            self.unwind_setup();
            return Err(Error::Incompatible("keyed SGLs are not supported"));
        }

        if self.opts.queue_size > ident.maxcmd as usize {
            log::warn!(
                "queue_size {} > ctrl maxcmd {}, clamping down",
                self.opts.queue_size,
                ident.maxcmd
            );
        }

        let changed = self.change_state(CtrlState::Connected);
        debug_assert!(changed);

        log::info!("new ctrl: NQN \"{}\", addr {}", self.opts.nqn, self.opts.addr);
        Ok(())
    }

    fn unwind_setup(&self) {
        self.free_io_queues();
        *self.io_tags.write().unwrap() = None;
        self.destroy_admin_queue();
    }

    fn configure_admin_queue(&self) -> Result<()> {
        self.queues[0].init(AQ_DEPTH)?;

        let dev = match self.queues[0].device_entry() {
            Some(dev) => dev,
            None => {
                self.queues[0].free();
                return Err(Error::Busy);
            }
        };
        *self.device.lock().unwrap() = Some(dev.clone());

        let max_fr_pages = MAX_SEGMENTS.min(dev.dev().attrs().max_fast_reg_page_list_len);
        self.max_fr_pages.store(max_fr_pages, Ordering::SeqCst);

        let res = (|| -> Result<()> {
            let admin_tags = TagSet::alloc(1, AQ_BLKMQ_DEPTH, 1, ADMIN_TIMEOUT, &|_, _| {
                Request::new(&dev, max_fr_pages)
            })?;
            *self.admin_tags.write().unwrap() = Some(Arc::new(admin_tags));

            self.ops.connect_admin_queue()?;

            let cap = self.ops.reg_read64(NVME_REG_CAP).inspect_err(|_| {
                log::error!("prop_get NVME_REG_CAP failed");
            })?;
            self.cap.store(cap, Ordering::SeqCst);

            // MQES is zero-based; clamp the one-based sqsize to it.
            let sqsize = self.sqsize.load(Ordering::SeqCst);
            self.sqsize
                .store(sqsize.min(cap_mqes(cap) as usize + 1), Ordering::SeqCst);

            self.ops.enable_ctrl(cap)?;

            self.max_hw_sectors
                .store((max_fr_pages - 1) << (PAGE_SHIFT - 9), Ordering::SeqCst);

            *self.ident.lock().unwrap() = self.ops.init_identify()?;

            *self.async_event_sqe.lock().unwrap() =
                Some(Capsule::alloc(dev.dev(), CMD_SIZE, DmaDir::ToDevice)?);
            Ok(())
        })();

        if res.is_err() {
            *self.async_event_sqe.lock().unwrap() = None;
            *self.admin_tags.write().unwrap() = None;
            *self.device.lock().unwrap() = None;
            self.queues[0].free();
        }
        res
    }

    fn destroy_admin_queue(&self) {
        *self.async_event_sqe.lock().unwrap() = None;
        *self.device.lock().unwrap() = None;
        self.queues[0].free();
        *self.admin_tags.write().unwrap() = None;
    }

    // ---- state machine --------------------------------------------------

    pub fn state(&self) -> CtrlState {
        *self.state.lock().unwrap()
    }

    /// Attempt a lifecycle transition. Returns whether it committed; a
    /// rejected transition leaves the state untouched.
    pub fn change_state(&self, new: CtrlState) -> bool {
        use CtrlState::*;

        let mut state = self.state.lock().unwrap();
        let changed = match new {
            Connected => matches!(*state, Connecting | Reconnecting | Resetting),
            Reconnecting => matches!(*state, Connected),
            Resetting => matches!(*state, Connected | Reconnecting),
            Deleting => matches!(*state, Connected | Reconnecting | Resetting),
            Connecting => false,
        };
        if changed {
            *state = new;
        }
        changed
    }

    pub fn io_incapable(&self) -> bool {
        self.state() != CtrlState::Connected
    }

    // ---- accessors consumed by the queues -------------------------------

    pub(crate) fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub(crate) fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub(crate) fn ops(&self) -> &Arc<dyn NvmeOps> {
        &self.ops
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.opts.addr
    }

    pub(crate) fn tl_retry_count(&self) -> u8 {
        self.opts.tl_retry_count
    }

    pub(crate) fn register_always(&self) -> bool {
        self.config.register_always
    }

    /// Negotiated identify parameters.
    pub fn ident(&self) -> IdentifyParams {
        *self.ident.lock().unwrap()
    }

    pub fn cap(&self) -> u64 {
        self.cap.load(Ordering::SeqCst)
    }

    pub fn max_fr_pages(&self) -> u32 {
        self.max_fr_pages.load(Ordering::SeqCst)
    }

    pub fn max_hw_sectors(&self) -> u32 {
        self.max_hw_sectors.load(Ordering::SeqCst)
    }

    pub fn sqsize(&self) -> usize {
        self.sqsize.load(Ordering::SeqCst)
    }

    pub fn queue_count(&self) -> usize {
        self.queue_count.load(Ordering::SeqCst)
    }

    pub fn queue(&self, idx: usize) -> Option<&Arc<Queue>> {
        self.queues.get(idx)
    }

    pub fn admin_tag_set(&self) -> Option<Arc<TagSet>> {
        self.admin_tags.read().unwrap().clone()
    }

    pub fn io_tag_set(&self) -> Option<Arc<TagSet>> {
        self.io_tags.read().unwrap().clone()
    }

    pub(crate) fn tagset_for(&self, queue_idx: usize) -> Option<Arc<TagSet>> {
        if queue_idx == 0 {
            self.admin_tag_set()
        } else {
            self.io_tag_set()
        }
    }

    /// Subsystem NQN this controller was connected with.
    pub fn subsysnqn(&self) -> &str {
        &self.opts.nqn
    }

    /// Target address this controller was connected to.
    pub fn address(&self) -> SocketAddr {
        self.opts.addr
    }

    /// Fabrics property get, 32-bit.
    pub fn reg_read32(&self, off: u32) -> Result<u32> {
        self.ops.reg_read32(off)
    }

    /// Fabrics property get, 64-bit.
    pub fn reg_read64(&self, off: u32) -> Result<u64> {
        self.ops.reg_read64(off)
    }

    /// Fabrics property set, 32-bit.
    pub fn reg_write32(&self, off: u32, val: u32) -> Result<()> {
        self.ops.reg_write32(off, val)
    }

    // ---- queue plumbing -------------------------------------------------

    fn init_io_queues(&self) -> Result<()> {
        let count = self.queue_count();
        let size = self.sqsize();
        for i in 1..count {
            if let Err(e) = self.queues[i].init(size) {
                log::info!("failed to initialize i/o queue: {}", e);
                for j in (1..=i).rev() {
                    self.queues[j].free();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn connect_io_queues(&self) -> Result<()> {
        for i in 1..self.queue_count() {
            self.ops.connect_io_queue(i)?;
        }
        Ok(())
    }

    fn free_io_queues(&self) {
        for i in 1..self.queue_count() {
            self.queues[i].free();
        }
    }

    fn reinit_tagset(&self, slot: &RwLock<Option<Arc<TagSet>>>) -> Result<()> {
        let ts = match slot.read().unwrap().clone() {
            Some(ts) => ts,
            None => return Ok(()),
        };
        let dev = self.device.lock().unwrap().clone().ok_or(Error::Busy)?;
        let max_fr_pages = self.max_fr_pages.load(Ordering::SeqCst);
        ts.reinit(&|req| req.reinit(&dev, max_fr_pages))
    }

    fn cancel_tagset(&self, ts: &TagSet, admin: bool) {
        let mut status = wire::NVME_SC_ABORT_REQ;
        if ts.is_dying() {
            status |= wire::NVME_SC_DNR;
        }
        ts.busy_iter(&mut |entry| {
            let queue = if admin {
                &self.queues[0]
            } else {
                &self.queues[entry.hwq() + 1]
            };
            queue.cancel_request(entry, status);
        });
    }

    // ---- error recovery and reconnect -----------------------------------

    /// Kick the error-recovery pipeline. A no-op unless the controller is
    /// currently `Connected`; whoever wins the transition owns recovery.
    pub fn error_recovery(&self) {
        if !self.change_state(CtrlState::Reconnecting) {
            return;
        }
        self.wq.queue(&self.works.err);
    }

    fn error_recovery_work(&self) {
        if let Some(ts) = self.io_tag_set() {
            ts.stop();
            self.cancel_tagset(&ts, false);
        }
        if let Some(ts) = self.admin_tag_set() {
            ts.stop();
            self.cancel_tagset(&ts, true);
        }

        log::info!("reconnecting in {} seconds", self.reconnect_delay.as_secs());
        self.wq
            .queue_delayed(&self.works.reconnect, self.reconnect_delay);
    }

    fn reconnect_requeue(&self) {
        // Make sure we are not resetting or deleting.
        if self.state() == CtrlState::Reconnecting {
            log::info!("Failed reconnect attempt, requeueing...");
            self.wq
                .queue_delayed(&self.works.reconnect, self.reconnect_delay);
        }
    }

    fn reconnect_ctrl_work(&self) {
        self.free_io_queues();
        if self.reinit_tagset(&self.io_tags).is_err() {
            return self.reconnect_requeue();
        }

        self.queues[0].free();
        if self.reinit_tagset(&self.admin_tags).is_err() {
            return self.reconnect_requeue();
        }
        if self.queues[0].init(AQ_DEPTH).is_err() {
            return self.reconnect_requeue();
        }

        if let Some(ts) = self.admin_tag_set() {
            ts.start();
        }
        if self.ops.connect_admin_queue().is_err() {
            return self.reconnect_stop_admin_requeue();
        }

        if self.init_io_queues().is_err() {
            return self.reconnect_stop_admin_requeue();
        }
        if self.connect_io_queues().is_err() {
            return self.reconnect_stop_admin_requeue();
        }

        if !self.change_state(CtrlState::Connected) {
            // Lost against a reset or delete; that path owns the queues now.
            log::warn!("controller state changed during reconnect");
        }

        if let Some(ts) = self.io_tag_set() {
            ts.start();
        }
        log::info!("Successfully reconnected");
    }

    fn reconnect_stop_admin_requeue(&self) {
        if let Some(ts) = self.admin_tag_set() {
            ts.stop();
        }
        self.reconnect_requeue();
    }

    // ---- reset ----------------------------------------------------------

    /// Tear the controller down and bring it back up. Fails with `Busy`
    /// when the controller is not `Connected` or a reset is already
    /// scheduled.
    pub fn reset(&self) -> Result<()> {
        if !self.change_state(CtrlState::Resetting) {
            return Err(Error::Busy);
        }
        if !self.wq.queue(&self.works.reset) {
            return Err(Error::Busy);
        }
        self.wq.flush(&self.works.reset);
        Ok(())
    }

    fn reset_ctrl_work(&self) {
        self.shutdown_ctrl();

        if self.configure_admin_queue().is_err() {
            return self.del_dead_ctrl();
        }
        if self.reinit_tagset(&self.io_tags).is_err() {
            return self.del_dead_ctrl();
        }
        if self.init_io_queues().is_err() {
            return self.del_dead_ctrl();
        }
        if self.connect_io_queues().is_err() {
            return self.del_dead_ctrl();
        }

        if !self.change_state(CtrlState::Connected) {
            log::warn!("controller state changed during reset");
        }

        if let Some(ts) = self.io_tag_set() {
            ts.start();
        }
        self.ops.scan_namespaces();
    }

    /// The controller is already shut down; swap deletion over to the
    /// dead-controller removal path.
    fn del_dead_ctrl(&self) {
        log::warn!("Removing after reset failure");
        if self.change_state(CtrlState::Deleting) {
            self.wq.queue(&self.works.remove_dead);
        }
    }

    // ---- shutdown and delete --------------------------------------------

    fn shutdown_ctrl(&self) {
        self.wq.cancel_sync(&self.works.err);
        self.wq.cancel_sync(&self.works.reconnect);

        if let Some(ts) = self.io_tag_set() {
            ts.stop();
            self.cancel_tagset(&ts, false);
        }
        self.free_io_queues();

        if !self.io_incapable() {
            if let Err(e) = self.ops.shutdown_ctrl() {
                log::warn!("controller shutdown failed: {}", e);
            }
        }

        if let Some(ts) = self.admin_tag_set() {
            ts.stop();
            self.cancel_tagset(&ts, true);
        }
        self.destroy_admin_queue();
    }

    /// Gate deletion and schedule the delete worker without waiting.
    pub(crate) fn start_delete(&self) -> Result<()> {
        if !self.change_state(CtrlState::Deleting) {
            return Err(Error::Busy);
        }
        if !self.wq.queue(&self.works.delete) {
            return Err(Error::Busy);
        }
        Ok(())
    }

    pub(crate) fn flush_delete(&self) {
        self.wq.flush(&self.works.delete);
    }

    /// Delete the controller and wait for the teardown to finish.
    pub fn delete(&self) -> Result<()> {
        self.start_delete()?;
        self.flush_delete();
        Ok(())
    }

    fn del_ctrl_work(&self) {
        self.ops.remove_namespaces();
        // The namespace queues are gone; anything still in flight is
        // cancelled with DNR on top of the abort status.
        if let Some(ts) = self.io_tag_set() {
            ts.set_dying(true);
        }
        self.shutdown_ctrl();
        self.free_ctrl();
    }

    fn remove_ctrl_work(&self) {
        // Quiesce the AEN and scan workers; running on the work queue
        // ourselves, cancellation is the drain.
        self.wq.cancel_sync(&self.works.async_event);
        self.wq.cancel_sync(&self.works.scan);
        self.ops.remove_namespaces();
        self.free_ctrl();
    }

    fn free_ctrl(&self) {
        *self.io_tags.write().unwrap() = None;
        *self.device.lock().unwrap() = None;
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_ctrl(self);
        }
    }

    // ---- async events ---------------------------------------------------

    /// AEN completions live outside the admin tag space and never time
    /// out. Successful or aborted ones re-arm the AEN command; notice
    /// results trigger a namespace rescan.
    pub(crate) fn complete_async_event(&self, cqe: &Completion) {
        let status = cqe.status() >> 1;

        if status == wire::NVME_SC_SUCCESS || status == wire::NVME_SC_ABORT_REQ {
            self.wq.queue(&self.works.async_event);
        }
        if status != wire::NVME_SC_SUCCESS {
            return;
        }

        match cqe.result() & NVME_AER_MASK {
            NVME_AER_NOTICE_NS_CHANGED => {
                log::info!("rescanning");
                self.wq.queue(&self.works.scan);
            }
            result => log::warn!("async event result {:08x}", result),
        }
    }

    fn async_event_work(&self) {
        let sqe_guard = self.async_event_sqe.lock().unwrap();
        let sqe = match sqe_guard.as_ref() {
            Some(sqe) => sqe,
            None => return,
        };

        sqe.sync_for_cpu();
        let mut cmd = Command::default();
        cmd.opcode = NVME_OPC_ASYNC_EVENT_REQUEST;
        cmd.set_command_id(AQ_BLKMQ_DEPTH as u16);
        mapping::set_sg_null(&mut cmd);
        sqe.write_cmd(&cmd);
        sqe.sync_for_device();

        if let Err(e) = self.queues[0].post_aen(sqe, AQ_BLKMQ_DEPTH as u16) {
            log::warn!("failed to post async event command ({})", e);
        }
    }

    fn scan_work(&self) {
        self.ops.scan_namespaces();
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: CtrlState) {
        *self.state.lock().unwrap() = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blk::BlockRequest;
    use crate::verbs::mock::MockProvider;

    struct NullOps;

    impl NvmeOps for NullOps {
        fn setup_cmd(&self, _rq: &BlockRequest, _cmd: &mut Command) -> Result<()> {
            Ok(())
        }
        fn cleanup_cmd(&self, _rq: &BlockRequest) {}
        fn needs_retry(&self, _rq: &BlockRequest, _status: u16) -> bool {
            false
        }
        fn connect_admin_queue(&self) -> Result<()> {
            Ok(())
        }
        fn connect_io_queue(&self, _qid: usize) -> Result<()> {
            Ok(())
        }
        fn reg_read32(&self, _off: u32) -> Result<u32> {
            Ok(0)
        }
        fn reg_read64(&self, _off: u32) -> Result<u64> {
            Ok(0x7f)
        }
        fn reg_write32(&self, _off: u32, _val: u32) -> Result<()> {
            Ok(())
        }
        fn enable_ctrl(&self, _cap: u64) -> Result<()> {
            Ok(())
        }
        fn init_identify(&self) -> Result<IdentifyParams> {
            Ok(IdentifyParams {
                icdoff: 0,
                ioccsz: 4,
                sgls: NVME_CTRL_SGLS_KEYED,
                maxcmd: 1024,
            })
        }
        fn set_queue_count(&self, count: usize) -> Result<usize> {
            Ok(count)
        }
        fn shutdown_ctrl(&self) -> Result<()> {
            Ok(())
        }
        fn scan_namespaces(&self) {}
        fn remove_namespaces(&self) {}
    }

    fn connected_ctrl() -> Arc<Ctrl> {
        let transport = RdmaTransport::new(MockProvider::new(), TransportConfig::default());
        let opts = CtrlOptions {
            queue_size: 8,
            nr_io_queues: 1,
            reconnect_delay: Some(0),
            ..CtrlOptions::new("10.0.0.9:4420".parse().unwrap(), "nqn.test")
        };
        transport.create_ctrl(opts, Arc::new(NullOps)).unwrap()
    }

    fn allowed(old: CtrlState, new: CtrlState) -> bool {
        use CtrlState::*;
        matches!(
            (old, new),
            (Connecting, Connected)
                | (Connected, Reconnecting)
                | (Connected, Resetting)
                | (Connected, Deleting)
                | (Reconnecting, Connected)
                | (Reconnecting, Resetting)
                | (Reconnecting, Deleting)
                | (Resetting, Connected)
                | (Resetting, Deleting)
        )
    }

    #[test]
    fn test_transition_table_exhaustive() {
        use CtrlState::*;
        let ctrl = connected_ctrl();
        let states = [Connecting, Connected, Reconnecting, Resetting, Deleting];
        for old in states {
            for new in states {
                ctrl.force_state(old);
                let changed = ctrl.change_state(new);
                assert_eq!(changed, allowed(old, new), "{:?} -> {:?}", old, new);
                let expected = if changed { new } else { old };
                assert_eq!(ctrl.state(), expected, "{:?} -> {:?}", old, new);
            }
        }
        // Leave the controller deletable so teardown stays clean.
        ctrl.force_state(Connected);
        ctrl.delete().unwrap();
    }

    #[test]
    fn test_deleting_is_absorbing() {
        use CtrlState::*;
        let ctrl = connected_ctrl();
        ctrl.force_state(Deleting);
        for new in [Connecting, Connected, Reconnecting, Resetting, Deleting] {
            assert!(!ctrl.change_state(new));
            assert_eq!(ctrl.state(), Deleting);
        }
        ctrl.force_state(Connected);
        ctrl.delete().unwrap();
    }
}
