//! The generic NVMe controller and fabrics command surface this transport
//! calls into. The embedding host implements [`NvmeOps`]; the transport
//! owns everything below it.

use crate::blk::BlockRequest;
use crate::error::Result;
use crate::wire::Command;

/// Parameters negotiated by identify that the transport consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentifyParams {
    /// In-capsule data offset. Nonzero offsets are not supported and abort
    /// controller creation.
    pub icdoff: u16,
    /// I/O command capsule size in 16-byte units.
    pub ioccsz: u32,
    /// SGL support descriptor; the keyed-SGL bit is mandatory.
    pub sgls: u32,
    /// Maximum outstanding commands the controller accepts.
    pub maxcmd: u32,
}

/// Operations of the generic NVMe layer and the fabrics command path.
///
/// The connect/property calls are issued from worker context during
/// controller setup and reconnect; `setup_cmd`/`cleanup_cmd`/`needs_retry`
/// run on the hot path and must not block.
pub trait NvmeOps: Send + Sync {
    /// Fill the NVMe command for a block request (opcode, nsid, LBA range).
    /// The transport owns `command_id` and the data pointer.
    fn setup_cmd(&self, rq: &BlockRequest, cmd: &mut Command) -> Result<()>;

    /// Release whatever `setup_cmd` acquired.
    fn cleanup_cmd(&self, rq: &BlockRequest);

    /// Retry policy over the completion status of a failed request.
    fn needs_retry(&self, rq: &BlockRequest, status: u16) -> bool;

    /// Issue the fabrics connect command on the admin queue.
    fn connect_admin_queue(&self) -> Result<()>;

    /// Issue the fabrics connect command on I/O queue `qid`.
    fn connect_io_queue(&self, qid: usize) -> Result<()>;

    /// Fabrics property get, 32-bit.
    fn reg_read32(&self, off: u32) -> Result<u32>;

    /// Fabrics property get, 64-bit.
    fn reg_read64(&self, off: u32) -> Result<u64>;

    /// Fabrics property set, 32-bit.
    fn reg_write32(&self, off: u32, val: u32) -> Result<()>;

    /// Run the controller enable sequence against the given capabilities.
    fn enable_ctrl(&self, cap: u64) -> Result<()>;

    /// Identify the controller and return the negotiated parameters.
    fn init_identify(&self) -> Result<IdentifyParams>;

    /// Negotiate the I/O queue count; returns what the controller grants.
    fn set_queue_count(&self, count: usize) -> Result<usize>;

    /// Run the NVMe shutdown protocol.
    fn shutdown_ctrl(&self) -> Result<()>;

    fn scan_namespaces(&self);

    fn remove_namespaces(&self);
}
