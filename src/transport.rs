//! The RDMA transport object: owns the work pool, the device registry and
//! the list of live controllers, and publishes itself to the fabrics
//! manager under the `"rdma"` transport name.

use std::sync::{Arc, Mutex, Weak};

use crate::config::TransportConfig;
use crate::controller::Ctrl;
use crate::device::DeviceRegistry;
use crate::error::Result;
use crate::fabrics::{self, CtrlOptions, FabricsTransport, OptMask, TransportDecl};
use crate::nvme::NvmeOps;
use crate::verbs::Provider;
use crate::workqueue::WorkQueue;

pub const TRANSPORT_NAME: &str = "rdma";

pub struct RdmaTransport {
    weak_self: Weak<RdmaTransport>,
    provider: Arc<dyn Provider>,
    config: TransportConfig,
    registry: Arc<DeviceRegistry>,
    ctrls: Mutex<Vec<Arc<Ctrl>>>,
    wq: Arc<WorkQueue>,
}

impl RdmaTransport {
    pub fn new(provider: Arc<dyn Provider>, config: TransportConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| RdmaTransport {
            weak_self: weak.clone(),
            provider,
            config,
            registry: Arc::new(DeviceRegistry::new()),
            ctrls: Mutex::new(Vec::new()),
            wq: WorkQueue::new("nvmf-rdma-wq"),
        })
    }

    /// Build the transport and publish it to the fabrics manager.
    pub fn register(provider: Arc<dyn Provider>, config: TransportConfig) -> Arc<Self> {
        let transport = Self::new(provider, config);
        fabrics::register_transport(transport.clone());
        transport
    }

    /// Create a fully connected controller, or fail.
    pub fn create_ctrl(&self, opts: CtrlOptions, ops: Arc<dyn NvmeOps>) -> Result<Arc<Ctrl>> {
        Ctrl::create(self, opts, ops)
    }

    /// Unpublish the transport and delete every live controller.
    pub fn unload(&self) {
        fabrics::unregister_transport(TRANSPORT_NAME);
        let ctrls: Vec<_> = self.ctrls.lock().unwrap().clone();
        for ctrl in ctrls {
            let _ = ctrl.delete();
        }
    }

    pub fn ctrl_count(&self) -> usize {
        self.ctrls.lock().unwrap().len()
    }

    pub(crate) fn weak_self(&self) -> Weak<RdmaTransport> {
        self.weak_self.clone()
    }

    pub(crate) fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub(crate) fn wq(&self) -> &Arc<WorkQueue> {
        &self.wq
    }

    pub(crate) fn add_ctrl(&self, ctrl: &Arc<Ctrl>) {
        self.ctrls.lock().unwrap().push(ctrl.clone());
    }

    pub(crate) fn remove_ctrl(&self, ctrl: &Ctrl) {
        self.ctrls
            .lock()
            .unwrap()
            .retain(|c| !std::ptr::eq(Arc::as_ptr(c), ctrl as *const Ctrl));
    }
}

impl FabricsTransport for RdmaTransport {
    fn decl(&self) -> TransportDecl {
        TransportDecl {
            name: TRANSPORT_NAME,
            required_opts: OptMask::ADDR | OptMask::PORT,
            allowed_opts: OptMask::ADDR
                | OptMask::PORT
                | OptMask::QUEUE_SIZE
                | OptMask::NR_IO_QUEUES
                | OptMask::TL_RETRY_COUNT,
        }
    }

    fn create_ctrl(&self, opts: &CtrlOptions, ops: Arc<dyn NvmeOps>) -> Result<Arc<Ctrl>> {
        RdmaTransport::create_ctrl(self, opts.clone(), ops)
    }
}
