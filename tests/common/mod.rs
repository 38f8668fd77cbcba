//! Shared harness for the integration suite: a scriptable generic-NVMe
//! layer over the in-memory verbs provider.

// Each integration binary uses a different slice of this module.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nvmf_rdma::verbs::mock::{MockProvider, MockQp};
use nvmf_rdma::verbs::SgEntry;
use nvmf_rdma::wire::{Command, NVME_CTRL_SGLS_KEYED, NVME_OPC_FLUSH};
use nvmf_rdma::{
    BlockRequest, Ctrl, CtrlOptions, Error, IdentifyParams, NvmeOps, RdmaTransport, ReqOp,
    Result, TagEntry, TransportConfig,
};

/// Generic-NVMe mock: answers the fabrics command surface from scripted
/// values and records what the transport asked of it.
pub struct MockNvme {
    pub identify: Mutex<IdentifyParams>,
    pub cap: AtomicU64,
    pub fail_connect_admin: AtomicBool,
    pub fail_connect_io: AtomicBool,
    pub retry: AtomicBool,
    pub admin_connects: AtomicUsize,
    pub io_connects: AtomicUsize,
    pub scans: AtomicUsize,
    pub removes: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl MockNvme {
    pub fn new() -> Arc<Self> {
        Arc::new(MockNvme {
            identify: Mutex::new(IdentifyParams {
                icdoff: 0,
                ioccsz: 4,
                sgls: NVME_CTRL_SGLS_KEYED,
                maxcmd: 1024,
            }),
            cap: AtomicU64::new(0xff),
            fail_connect_admin: AtomicBool::new(false),
            fail_connect_io: AtomicBool::new(false),
            retry: AtomicBool::new(false),
            admin_connects: AtomicUsize::new(0),
            io_connects: AtomicUsize::new(0),
            scans: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }

    pub fn set_ioccsz(&self, ioccsz: u32) {
        self.identify.lock().unwrap().ioccsz = ioccsz;
    }

    pub fn set_icdoff(&self, icdoff: u16) {
        self.identify.lock().unwrap().icdoff = icdoff;
    }

    pub fn set_sgls(&self, sgls: u32) {
        self.identify.lock().unwrap().sgls = sgls;
    }
}

impl NvmeOps for MockNvme {
    fn setup_cmd(&self, rq: &BlockRequest, cmd: &mut Command) -> Result<()> {
        match rq.op {
            ReqOp::Read => {
                *cmd = Command::rw(
                    nvmf_rdma::wire::NVME_OPC_READ,
                    rq.nsid,
                    rq.lba,
                    (rq.nr_bytes / 512).saturating_sub(1) as u16,
                );
            }
            ReqOp::Write => {
                *cmd = Command::rw(
                    nvmf_rdma::wire::NVME_OPC_WRITE,
                    rq.nsid,
                    rq.lba,
                    (rq.nr_bytes / 512).saturating_sub(1) as u16,
                );
            }
            ReqOp::Flush => {
                *cmd = Command::default();
                cmd.opcode = NVME_OPC_FLUSH;
                cmd.nsid = rq.nsid.to_le();
            }
        }
        Ok(())
    }

    fn cleanup_cmd(&self, _rq: &BlockRequest) {}

    fn needs_retry(&self, _rq: &BlockRequest, _status: u16) -> bool {
        self.retry.load(Ordering::SeqCst)
    }

    fn connect_admin_queue(&self) -> Result<()> {
        if self.fail_connect_admin.load(Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        self.admin_connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connect_io_queue(&self, _qid: usize) -> Result<()> {
        if self.fail_connect_io.load(Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        self.io_connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reg_read32(&self, _off: u32) -> Result<u32> {
        Ok(0)
    }

    fn reg_read64(&self, _off: u32) -> Result<u64> {
        Ok(self.cap.load(Ordering::SeqCst))
    }

    fn reg_write32(&self, _off: u32, _val: u32) -> Result<()> {
        Ok(())
    }

    fn enable_ctrl(&self, _cap: u64) -> Result<()> {
        Ok(())
    }

    fn init_identify(&self) -> Result<IdentifyParams> {
        Ok(*self.identify.lock().unwrap())
    }

    fn set_queue_count(&self, count: usize) -> Result<usize> {
        Ok(count)
    }

    fn shutdown_ctrl(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn scan_namespaces(&self) {
        self.scans.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_namespaces(&self) {
        self.removes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub provider: Arc<MockProvider>,
    pub transport: Arc<RdmaTransport>,
    pub ops: Arc<MockNvme>,
    pub ctrl: Arc<Ctrl>,
}

pub fn default_opts() -> CtrlOptions {
    let mut opts = CtrlOptions::new("10.0.0.9:4420".parse().unwrap(), "nqn.2016-06.io.test:ctrl");
    opts.queue_size = 16;
    opts.nr_io_queues = 1;
    opts.reconnect_delay = Some(0);
    opts
}

pub fn setup() -> Harness {
    setup_with(default_opts(), MockNvme::new(), TransportConfig::default())
}

pub fn setup_with(opts: CtrlOptions, ops: Arc<MockNvme>, config: TransportConfig) -> Harness {
    let provider = MockProvider::new();
    let transport = RdmaTransport::new(provider.clone(), config);
    let ctrl = transport
        .create_ctrl(opts, ops.clone())
        .expect("controller create failed");
    Harness {
        provider,
        transport,
        ops,
        ctrl,
    }
}

/// A single physically contiguous payload segment.
pub fn one_seg(len: u32) -> Vec<SgEntry> {
    vec![SgEntry {
        addr: 0x10_0000,
        len,
    }]
}

/// `n` page-sized segments with holes between them, so DMA mapping cannot
/// coalesce anything.
pub fn scattered_pages(n: usize) -> Vec<SgEntry> {
    (0..n)
        .map(|i| SgEntry {
            addr: 0x100_0000 + (i as u64) * 8192,
            len: 4096,
        })
        .collect()
}

pub fn read_rq(nr_bytes: u32, segments: Vec<SgEntry>) -> BlockRequest {
    BlockRequest {
        op: ReqOp::Read,
        nsid: 1,
        lba: 0,
        nr_bytes,
        segments,
    }
}

pub fn write_rq(nr_bytes: u32, segments: Vec<SgEntry>) -> BlockRequest {
    BlockRequest {
        op: ReqOp::Write,
        nsid: 1,
        lba: 0,
        nr_bytes,
        segments,
    }
}

/// Bind a request to a tag and push it down the submit path.
pub fn submit(ctrl: &Ctrl, queue_idx: usize, rq: BlockRequest) -> Arc<TagEntry> {
    let ts = if queue_idx == 0 {
        ctrl.admin_tag_set()
    } else {
        ctrl.io_tag_set()
    }
    .expect("tag set missing");
    let hwq = if queue_idx == 0 { 0 } else { queue_idx - 1 };
    let entry = ts.prepare(hwq, rq).expect("no free tag").clone();
    ctrl.queue(queue_idx)
        .unwrap()
        .queue_rq(&entry)
        .expect("submit failed");
    entry
}

/// The mock QP currently backing queue `idx`, via its CM id.
pub fn qp_of(h: &Harness, idx: usize) -> Arc<MockQp> {
    h.provider.cm_ids()[idx].qp().expect("queue has no QP")
}

pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
