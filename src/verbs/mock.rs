//! In-memory verbs provider.
//!
//! Implements the [`super::provider`] traits against plain data structures
//! so the whole transport engine can be exercised without a NIC: CM events
//! fire synchronously from the resolve/connect calls (scriptable per
//! provider), posted work requests are recorded, and tests inject receive
//! completions that land in the real capsule ring buffers.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::wire::{Completion, CQE_SIZE};

use super::provider::*;
use super::wc::{Wc, WcStatus, WrId};
use super::wr::{ConnParam, MrAccess, RecvWr, SendWr};

/// How the scripted CM reacts to the next establishment attempts.
#[derive(Debug, Clone)]
pub enum ConnectScript {
    /// Resolve and establish normally.
    Establish,
    /// Reject the connect, optionally with consumer-defined private data.
    Reject(Option<Vec<u8>>),
    /// Fail address resolution with an ADDR_ERROR event.
    AddrError,
    /// Fail route resolution with a ROUTE_ERROR event.
    RouteError,
    /// Fail the handshake with a CONNECT_ERROR event.
    ConnectError,
    /// Swallow everything; the CM gate times out.
    Silent,
}

/// Live-resource snapshot used by leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCounts {
    pub pds: usize,
    pub cqs: usize,
    pub qps: usize,
    pub mrs: usize,
    pub dma_bufs: usize,
}

#[derive(Default)]
struct Counters {
    pds: AtomicUsize,
    cqs: AtomicUsize,
    qps: AtomicUsize,
    mrs: AtomicUsize,
}

pub struct MockDevice {
    guid: u64,
    name: String,
    attrs: Mutex<DeviceAttrs>,
    next_dma: AtomicU64,
    next_rkey: AtomicU32,
    bufs: Mutex<HashMap<u64, Weak<DmaBuf>>>,
    cqs: Mutex<Vec<Weak<MockCq>>>,
    counters: Arc<Counters>,
}

impl MockDevice {
    pub fn new(guid: u64) -> Arc<Self> {
        Arc::new(MockDevice {
            guid,
            name: format!("mock{:x}", guid),
            attrs: Mutex::new(DeviceAttrs {
                max_fast_reg_page_list_len: 512,
                num_comp_vectors: 4,
                max_qp_rd_atom: 16,
                mem_mgt_extensions: true,
            }),
            next_dma: AtomicU64::new(0x1000),
            next_rkey: AtomicU32::new(0x2000),
            bufs: Mutex::new(HashMap::new()),
            cqs: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn set_mem_mgt_extensions(&self, on: bool) {
        self.attrs.lock().unwrap().mem_mgt_extensions = on;
    }

    pub fn set_max_fast_reg_page_list_len(&self, len: u32) {
        self.attrs.lock().unwrap().max_fast_reg_page_list_len = len;
    }

    pub fn counts(&self) -> ResourceCounts {
        let mut bufs = self.bufs.lock().unwrap();
        bufs.retain(|_, w| w.strong_count() > 0);
        ResourceCounts {
            pds: self.counters.pds.load(Ordering::SeqCst),
            cqs: self.counters.cqs.load(Ordering::SeqCst),
            qps: self.counters.qps.load(Ordering::SeqCst),
            mrs: self.counters.mrs.load(Ordering::SeqCst),
            dma_bufs: bufs.len(),
        }
    }

    fn buf_at(&self, dma: u64) -> Option<Arc<DmaBuf>> {
        self.bufs.lock().unwrap().get(&dma).and_then(Weak::upgrade)
    }

    /// Snapshot the contents of a DMA buffer, as the device would read
    /// them. Test-side view of posted capsules.
    pub fn read_buf(&self, dma: u64) -> Option<Vec<u8>> {
        let buf = self.buf_at(dma)?;
        // SAFETY: the device side may read a posted buffer at any time;
        // tests call this after the post, mirroring the NIC.
        Some(unsafe { buf.bytes() }.to_vec())
    }
}

impl Device for MockDevice {
    fn guid(&self) -> u64 {
        self.guid
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn attrs(&self) -> DeviceAttrs {
        *self.attrs.lock().unwrap()
    }

    fn alloc_pd(&self) -> io::Result<Arc<dyn ProtectionDomain>> {
        self.counters.pds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPd {
            lkey: 0x100,
            next_rkey: AtomicU32::new(self.next_rkey.fetch_add(0x1_0000, Ordering::SeqCst)),
            counters: self.counters.clone(),
        }))
    }

    fn alloc_cq(&self, _entries: u32, _comp_vector: u32) -> io::Result<Arc<dyn CompletionQueue>> {
        self.counters.cqs.fetch_add(1, Ordering::SeqCst);
        let cq = Arc::new(MockCq {
            queue: Mutex::new(VecDeque::new()),
            armed: AtomicBool::new(false),
            counters: self.counters.clone(),
        });
        self.cqs.lock().unwrap().push(Arc::downgrade(&cq));
        Ok(cq)
    }

    fn alloc_dma_buf(&self, len: usize, _dir: DmaDir) -> io::Result<Arc<DmaBuf>> {
        let dma = self.next_dma.fetch_add(len.next_power_of_two() as u64, Ordering::SeqCst);
        let buf = DmaBuf::new(len, dma);
        self.bufs.lock().unwrap().insert(dma, Arc::downgrade(&buf));
        Ok(buf)
    }

    fn dma_sync_for_cpu(&self, _buf: &DmaBuf, _dir: DmaDir) {}

    fn dma_sync_for_device(&self, _buf: &DmaBuf, _dir: DmaDir) {}

    fn dma_map_sg(
        &self,
        sg: &[SgEntry],
        _dir: DmaDir,
        out: &mut Vec<DmaSegment>,
    ) -> io::Result<usize> {
        let before = out.len();
        for entry in sg {
            // Identity mapping with adjacency coalescing.
            match out.last_mut() {
                Some(last) if last.addr + last.len as u64 == entry.addr => {
                    last.len += entry.len;
                }
                _ => out.push(DmaSegment {
                    addr: entry.addr,
                    len: entry.len,
                }),
            }
        }
        Ok(out.len() - before)
    }

    fn dma_unmap_sg(&self, _sg: &[DmaSegment], _dir: DmaDir) {}
}

struct MockPd {
    lkey: u32,
    next_rkey: AtomicU32,
    counters: Arc<Counters>,
}

impl Drop for MockPd {
    fn drop(&mut self) {
        self.counters.pds.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProtectionDomain for MockPd {
    fn local_dma_lkey(&self) -> u32 {
        self.lkey
    }

    fn alloc_mr(&self, max_pages: u32) -> io::Result<Arc<dyn MemoryRegion>> {
        self.counters.mrs.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockMr {
            rkey: AtomicU32::new(self.next_rkey.fetch_add(0x100, Ordering::SeqCst)),
            iova: AtomicU64::new(0),
            length: AtomicU64::new(0),
            max_pages,
            counters: self.counters.clone(),
        }))
    }

    fn bulk_dma_mr(&self, _access: MrAccess) -> io::Result<Arc<dyn MemoryRegion>> {
        self.counters.mrs.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockMr {
            rkey: AtomicU32::new(self.next_rkey.fetch_add(0x100, Ordering::SeqCst)),
            iova: AtomicU64::new(0),
            length: AtomicU64::new(u64::MAX),
            max_pages: u32::MAX,
            counters: self.counters.clone(),
        }))
    }
}

pub struct MockMr {
    rkey: AtomicU32,
    iova: AtomicU64,
    length: AtomicU64,
    max_pages: u32,
    counters: Arc<Counters>,
}

impl Drop for MockMr {
    fn drop(&mut self) {
        self.counters.mrs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryRegion for MockMr {
    fn rkey(&self) -> u32 {
        self.rkey.load(Ordering::SeqCst)
    }

    fn set_rkey(&self, key: u32) {
        self.rkey.store(key, Ordering::SeqCst);
    }

    fn iova(&self) -> u64 {
        self.iova.load(Ordering::SeqCst)
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::SeqCst)
    }

    fn map_sg(&self, sg: &[DmaSegment], _page_size: usize) -> io::Result<usize> {
        let n = sg.len().min(self.max_pages as usize);
        if n > 0 {
            self.iova.store(sg[0].addr, Ordering::SeqCst);
            self.length.store(
                sg[..n].iter().map(|s| s.len as u64).sum(),
                Ordering::SeqCst,
            );
        }
        Ok(n)
    }
}

pub struct MockCq {
    queue: Mutex<VecDeque<Wc>>,
    armed: AtomicBool,
    counters: Arc<Counters>,
}

impl Drop for MockCq {
    fn drop(&mut self) {
        self.counters.cqs.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockCq {
    pub fn push(&self, wc: Wc) {
        self.queue.lock().unwrap().push_back(wc);
    }

    pub fn was_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

impl CompletionQueue for MockCq {
    fn poll_one(&self) -> Option<Wc> {
        self.queue.lock().unwrap().pop_front()
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

pub struct MockQp {
    qp_num: u32,
    device: Arc<MockDevice>,
    cq: Arc<MockCq>,
    /// Every post, one chain per entry.
    sends: Mutex<Vec<Vec<SendWr>>>,
    /// Receive slots in NIC consumption order.
    outstanding_recvs: Mutex<VecDeque<RecvWr>>,
    posted_recv_total: AtomicUsize,
    fail_posts: AtomicBool,
    counters: Arc<Counters>,
}

impl Drop for MockQp {
    fn drop(&mut self) {
        self.counters.qps.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockQp {
    /// All posted send chains so far.
    pub fn sent(&self) -> Vec<Vec<SendWr>> {
        self.sends.lock().unwrap().clone()
    }

    /// Flat list of posted send-side work requests.
    pub fn sent_flat(&self) -> Vec<SendWr> {
        self.sends.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn outstanding_recv_count(&self) -> usize {
        self.outstanding_recvs.lock().unwrap().len()
    }

    pub fn posted_recv_total(&self) -> usize {
        self.posted_recv_total.load(Ordering::SeqCst)
    }

    /// Make subsequent posts fail with `ENOMEM`.
    pub fn fail_posts(&self, on: bool) {
        self.fail_posts.store(on, Ordering::SeqCst);
    }

    /// Deliver an NVMe completion into the oldest posted receive slot,
    /// then raise the receive completion on the CQ.
    pub fn complete_recv(&self, cqe: &Completion, invalidate_rkey: Option<u32>) {
        let wr = self
            .outstanding_recvs
            .lock()
            .unwrap()
            .pop_front()
            .expect("no posted receive to complete");
        let buf = self
            .device
            .buf_at(wr.sge.addr)
            .expect("receive slot points at unknown DMA buffer");
        // SAFETY: the slot was posted, so the device owns the buffer until
        // the completion is delivered below.
        unsafe {
            buf.bytes_mut()[..CQE_SIZE].copy_from_slice(cqe.as_bytes());
        }
        self.cq.push(Wc {
            wr_id: wr.wr_id,
            status: WcStatus::Success,
            byte_len: CQE_SIZE as u32,
            invalidate_rkey,
        });
    }

    /// Fail the oldest posted receive slot with the given status.
    pub fn fail_recv(&self, status: WcStatus) {
        let wr = self
            .outstanding_recvs
            .lock()
            .unwrap()
            .pop_front()
            .expect("no posted receive to fail");
        self.cq.push(Wc {
            wr_id: wr.wr_id,
            status,
            byte_len: 0,
            invalidate_rkey: None,
        });
    }

    /// Raise an error completion for a send-side work request.
    pub fn fail_send(&self, wr_id: WrId, status: WcStatus) {
        self.cq.push(Wc {
            wr_id,
            status,
            byte_len: 0,
            invalidate_rkey: None,
        });
    }

    pub fn cq(&self) -> &MockCq {
        &self.cq
    }
}

impl QueuePair for MockQp {
    fn qp_num(&self) -> u32 {
        self.qp_num
    }

    fn post_send(&self, wrs: &[SendWr]) -> io::Result<()> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        self.sends.lock().unwrap().push(wrs.to_vec());
        Ok(())
    }

    fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        self.posted_recv_total.fetch_add(1, Ordering::SeqCst);
        self.outstanding_recvs.lock().unwrap().push_back(*wr);
        Ok(())
    }

    fn drain(&self) {
        self.outstanding_recvs.lock().unwrap().clear();
    }
}

pub struct MockCmId {
    script: Arc<Mutex<ConnectScript>>,
    target: Arc<MockDevice>,
    handler: Weak<dyn CmEventHandler>,
    device: Mutex<Option<Arc<MockDevice>>>,
    qp: Mutex<Option<Weak<MockQp>>>,
    connect_param: Mutex<Option<ConnParam>>,
    disconnects: AtomicUsize,
}

impl MockCmId {
    /// Deliver a CM event to the owning queue's handler.
    pub fn fire(&self, event: CmEvent) -> CmDisposition {
        match self.handler.upgrade() {
            Some(h) => h.cm_event(event),
            None => CmDisposition::Keep,
        }
    }

    /// The QP bound to this id, while the owning queue keeps it alive.
    pub fn qp(&self) -> Option<Arc<MockQp>> {
        self.qp.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// The private data recorded from `connect`.
    pub fn connect_param(&self) -> Option<ConnParam> {
        self.connect_param.lock().unwrap().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn script(&self) -> ConnectScript {
        self.script.lock().unwrap().clone()
    }
}

impl CmId for MockCmId {
    fn device(&self) -> Option<Arc<dyn Device>> {
        let dev: Arc<dyn Device> = self.device.lock().unwrap().clone()?;
        Some(dev)
    }

    fn resolve_addr(&self, _addr: SocketAddr, _timeout_ms: u32) -> io::Result<()> {
        *self.device.lock().unwrap() = Some(self.target.clone());
        match self.script() {
            ConnectScript::Silent => {}
            ConnectScript::AddrError => {
                self.fire(CmEvent::AddrError);
            }
            _ => {
                self.fire(CmEvent::AddrResolved);
            }
        }
        Ok(())
    }

    fn resolve_route(&self, _timeout_ms: u32) -> io::Result<()> {
        match self.script() {
            ConnectScript::Silent => {}
            ConnectScript::RouteError => {
                self.fire(CmEvent::RouteError);
            }
            _ => {
                self.fire(CmEvent::RouteResolved);
            }
        }
        Ok(())
    }

    fn create_qp(
        &self,
        _pd: &Arc<dyn ProtectionDomain>,
        cq: &Arc<dyn CompletionQueue>,
        _attr: QpInitAttr,
    ) -> io::Result<Arc<dyn QueuePair>> {
        let device = self
            .device
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

        // Recover the concrete CQ this queue allocated from the device.
        let want = Arc::as_ptr(cq) as *const ();
        let mock_cq = device
            .cqs
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|c| Arc::as_ptr(c) as *const () == want)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

        device.counters.qps.fetch_add(1, Ordering::SeqCst);
        let qp = Arc::new(MockQp {
            qp_num: device.next_dma.fetch_add(1, Ordering::SeqCst) as u32,
            device: device.clone(),
            cq: mock_cq,
            sends: Mutex::new(Vec::new()),
            outstanding_recvs: Mutex::new(VecDeque::new()),
            posted_recv_total: AtomicUsize::new(0),
            fail_posts: AtomicBool::new(false),
            counters: device.counters.clone(),
        });
        *self.qp.lock().unwrap() = Some(Arc::downgrade(&qp));
        Ok(qp)
    }

    fn connect(&self, param: ConnParam) -> io::Result<()> {
        *self.connect_param.lock().unwrap() = Some(param);
        match self.script() {
            ConnectScript::Silent => {}
            ConnectScript::Reject(data) => {
                self.fire(CmEvent::Rejected(data));
            }
            ConnectScript::ConnectError => {
                self.fire(CmEvent::ConnectError);
            }
            _ => {
                self.fire(CmEvent::Established);
            }
        }
        Ok(())
    }

    fn disconnect(&self) -> io::Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The mock RDMA layer: one device, scriptable CM behavior.
pub struct MockProvider {
    pub device: Arc<MockDevice>,
    script: Arc<Mutex<ConnectScript>>,
    cm_ids: Mutex<Vec<Arc<MockCmId>>>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(MockProvider {
            device: MockDevice::new(0xcafe),
            script: Arc::new(Mutex::new(ConnectScript::Establish)),
            cm_ids: Mutex::new(Vec::new()),
        })
    }

    pub fn set_script(&self, script: ConnectScript) {
        *self.script.lock().unwrap() = script;
    }

    /// Every CM id created so far, in creation order (admin queue first).
    pub fn cm_ids(&self) -> Vec<Arc<MockCmId>> {
        self.cm_ids.lock().unwrap().clone()
    }

    pub fn counts(&self) -> ResourceCounts {
        self.device.counts()
    }
}

impl Provider for MockProvider {
    fn create_cm_id(&self, handler: Weak<dyn CmEventHandler>) -> io::Result<Arc<dyn CmId>> {
        let id = Arc::new(MockCmId {
            script: self.script.clone(),
            target: self.device.clone(),
            handler,
            device: Mutex::new(None),
            qp: Mutex::new(None),
            connect_param: Mutex::new(None),
            disconnects: AtomicUsize::new(0),
        });
        self.cm_ids.lock().unwrap().push(id.clone());
        Ok(id)
    }
}
