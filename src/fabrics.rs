//! The generic fabrics manager surface: transport declarations, option
//! masks, and the process-wide transport registry.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use bitflags::bitflags;

use crate::config::DEF_RECONNECT_DELAY;
use crate::controller::Ctrl;
use crate::error::{Error, Result};
use crate::nvme::NvmeOps;

bitflags! {
    /// Connection options a transport may require or allow.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptMask: u32 {
        const ADDR = 1 << 0;
        const PORT = 1 << 1;
        const QUEUE_SIZE = 1 << 2;
        const NR_IO_QUEUES = 1 << 3;
        const TL_RETRY_COUNT = 1 << 4;
    }
}

/// A transport's registration record.
#[derive(Debug, Clone, Copy)]
pub struct TransportDecl {
    pub name: &'static str,
    pub required_opts: OptMask,
    pub allowed_opts: OptMask,
}

/// Parsed connection options, as the fabrics layer hands them over.
#[derive(Debug, Clone)]
pub struct CtrlOptions {
    pub addr: SocketAddr,
    pub nqn: String,
    pub queue_size: usize,
    pub nr_io_queues: usize,
    /// Propagated into the CM connect retry count.
    pub tl_retry_count: u8,
    /// Seconds between reconnect attempts; `None` uses the transport
    /// default.
    pub reconnect_delay: Option<u64>,
}

impl CtrlOptions {
    pub fn new(addr: SocketAddr, nqn: impl Into<String>) -> Self {
        CtrlOptions {
            addr,
            nqn: nqn.into(),
            queue_size: 128,
            nr_io_queues: 1,
            tl_retry_count: 7,
            reconnect_delay: Some(DEF_RECONNECT_DELAY),
        }
    }
}

/// A transport as the fabrics manager sees it.
pub trait FabricsTransport: Send + Sync {
    fn decl(&self) -> TransportDecl;

    /// Produce a fully connected controller or an error.
    fn create_ctrl(&self, opts: &CtrlOptions, ops: Arc<dyn NvmeOps>) -> Result<Arc<Ctrl>>;
}

fn transports() -> &'static Mutex<Vec<Arc<dyn FabricsTransport>>> {
    static TRANSPORTS: OnceLock<Mutex<Vec<Arc<dyn FabricsTransport>>>> = OnceLock::new();
    TRANSPORTS.get_or_init(|| Mutex::new(Vec::new()))
}

pub fn register_transport(transport: Arc<dyn FabricsTransport>) {
    transports().lock().unwrap().push(transport);
}

pub fn unregister_transport(name: &str) {
    transports().lock().unwrap().retain(|t| t.decl().name != name);
}

pub fn find_transport(name: &str) -> Option<Arc<dyn FabricsTransport>> {
    transports()
        .lock()
        .unwrap()
        .iter()
        .find(|t| t.decl().name == name)
        .cloned()
}

/// Create a controller through a registered transport, checking the
/// provided option set against the transport's declaration.
pub fn create_ctrl(
    name: &str,
    opts: &CtrlOptions,
    provided: OptMask,
    ops: Arc<dyn NvmeOps>,
) -> Result<Arc<Ctrl>> {
    let transport = find_transport(name).ok_or(Error::Incompatible("unknown transport"))?;
    let decl = transport.decl();
    if !provided.contains(decl.required_opts) {
        return Err(Error::Incompatible("missing required option"));
    }
    if !decl.allowed_opts.contains(provided) {
        return Err(Error::Incompatible("option not allowed by transport"));
    }
    transport.create_ctrl(opts, ops)
}
