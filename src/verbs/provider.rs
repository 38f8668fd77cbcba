//! Trait seam over the RDMA layer.
//!
//! The transport consumes a small slice of the verbs and connection-manager
//! surface; these traits name exactly that slice. A hardware-backed
//! provider wraps real verbs objects, while [`super::mock`] implements the
//! same contract in memory for tests.

use std::cell::UnsafeCell;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use super::wc::Wc;
use super::wr::{ConnParam, MrAccess, RecvWr, SendWr};

/// DMA transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDir {
    ToDevice,
    FromDevice,
}

/// A physical segment of a block request, before DMA mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub addr: u64,
    pub len: u32,
}

/// A DMA-mapped segment as the device sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub addr: u64,
    pub len: u32,
}

/// Device attributes the transport sizes itself from.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAttrs {
    pub max_fast_reg_page_list_len: u32,
    pub num_comp_vectors: u32,
    pub max_qp_rd_atom: u32,
    /// Fast registration support; devices without it are rejected.
    pub mem_mgt_extensions: bool,
}

/// Queue pair sizing at creation time. The signaling model is the
/// per-request one: sends generate completions only when asked to.
#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// A DMA-coherent buffer backing one capsule.
///
/// The bytes are handed back and forth between CPU and device; the sync
/// calls on [`Device`] are the hand-off points, exactly as with the real
/// DMA API. Accessors are unsafe because exclusivity is a protocol
/// property (a posted receive slot belongs to the device) that the type
/// system cannot see.
pub struct DmaBuf {
    data: UnsafeCell<Box<[u8]>>,
    dma: u64,
}

// SAFETY: access is externally synchronized by the capsule ownership
// protocol; see the accessor contracts.
unsafe impl Send for DmaBuf {}
unsafe impl Sync for DmaBuf {}

impl DmaBuf {
    pub fn new(len: usize, dma: u64) -> Arc<Self> {
        Arc::new(DmaBuf {
            data: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
            dma,
        })
    }

    /// The bus address the device uses for this buffer.
    #[inline]
    pub fn dma(&self) -> u64 {
        self.dma
    }

    #[inline]
    pub fn len(&self) -> usize {
        // SAFETY: the length never changes after allocation.
        unsafe { (&*self.data.get()).len() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Safety
    ///
    /// The caller must own the CPU side of the buffer: no device write may
    /// be outstanding (receive slot not posted, or synced for CPU).
    #[inline]
    pub unsafe fn bytes(&self) -> &[u8] {
        &*self.data.get()
    }

    /// # Safety
    ///
    /// The caller must have exclusive ownership of the buffer: not posted,
    /// and no other reference in use.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        &mut *self.data.get()
    }
}

/// An RDMA device, shared by every queue resolved onto it.
pub trait Device: Send + Sync {
    /// Node GUID; the device registry keys on it.
    fn guid(&self) -> u64;

    fn name(&self) -> String;

    fn attrs(&self) -> DeviceAttrs;

    fn alloc_pd(&self) -> io::Result<Arc<dyn ProtectionDomain>>;

    fn alloc_cq(&self, entries: u32, comp_vector: u32) -> io::Result<Arc<dyn CompletionQueue>>;

    /// Allocate a DMA-coherent capsule buffer.
    fn alloc_dma_buf(&self, len: usize, dir: DmaDir) -> io::Result<Arc<DmaBuf>>;

    fn dma_sync_for_cpu(&self, buf: &DmaBuf, dir: DmaDir);

    fn dma_sync_for_device(&self, buf: &DmaBuf, dir: DmaDir);

    /// Map a scatter-gather list for DMA, appending the mapped segments to
    /// `out` (adjacent entries may coalesce). Returns the mapped count.
    fn dma_map_sg(
        &self,
        sg: &[SgEntry],
        dir: DmaDir,
        out: &mut Vec<DmaSegment>,
    ) -> io::Result<usize>;

    fn dma_unmap_sg(&self, sg: &[DmaSegment], dir: DmaDir);
}

pub trait ProtectionDomain: Send + Sync {
    /// The lkey covering all DMA-mapped memory in this domain.
    fn local_dma_lkey(&self) -> u32;

    /// Allocate a fast-registration MR good for `max_pages` pages.
    fn alloc_mr(&self, max_pages: u32) -> io::Result<Arc<dyn MemoryRegion>>;

    /// The domain-wide DMA MR used for single-segment transfers when
    /// registration is not forced.
    fn bulk_dma_mr(&self, access: MrAccess) -> io::Result<Arc<dyn MemoryRegion>>;
}

pub trait MemoryRegion: Send + Sync {
    fn rkey(&self) -> u32;

    /// Rotate the fast-registration key before reuse.
    fn set_rkey(&self, key: u32);

    fn iova(&self) -> u64;

    fn length(&self) -> u64;

    /// Bind the MR to a mapped segment list. Returns how many segments
    /// were consumed; fewer than `sg.len()` means the list did not fit.
    fn map_sg(&self, sg: &[DmaSegment], page_size: usize) -> io::Result<usize>;
}

pub trait QueuePair: Send + Sync {
    fn qp_num(&self) -> u32;

    /// Post a chained list of send-side work requests. The chain executes
    /// in order within the post, which is what makes REG_MR-before-SEND
    /// safe without waiting for the registration completion.
    fn post_send(&self, wrs: &[SendWr]) -> io::Result<()>;

    fn post_recv(&self, wr: &RecvWr) -> io::Result<()>;

    /// Flush outstanding work and wait for the flush completions.
    fn drain(&self);
}

pub trait CompletionQueue: Send + Sync {
    fn poll_one(&self) -> Option<Wc>;

    /// Request a notification for the next completion.
    fn arm(&self);
}

/// Connection-manager events delivered to a queue's handler.
#[derive(Debug, Clone)]
pub enum CmEvent {
    AddrResolved,
    RouteResolved,
    Established,
    /// Peer rejected the connect; consumer-defined private data, if any.
    Rejected(Option<Vec<u8>>),
    AddrError,
    RouteError,
    ConnectError,
    Unreachable,
    Disconnected,
    AddrChange,
    TimewaitExit,
    DeviceRemoval,
}

/// What the CM layer should do with the id after the handler returns.
///
/// `DestroyId` is the device-removal special case: the handler has torn
/// down everything else itself and must not destroy the id that delivered
/// the event, so it asks the CM layer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmDisposition {
    Keep,
    DestroyId,
}

pub trait CmEventHandler: Send + Sync {
    fn cm_event(&self, event: CmEvent) -> CmDisposition;
}

/// A connection-manager identifier bound to one queue.
///
/// Dropping the last reference destroys the id.
pub trait CmId: Send + Sync {
    /// The device this id resolved onto; `None` before address resolution.
    fn device(&self) -> Option<Arc<dyn Device>>;

    fn resolve_addr(&self, addr: SocketAddr, timeout_ms: u32) -> io::Result<()>;

    fn resolve_route(&self, timeout_ms: u32) -> io::Result<()>;

    fn create_qp(
        &self,
        pd: &Arc<dyn ProtectionDomain>,
        cq: &Arc<dyn CompletionQueue>,
        attr: QpInitAttr,
    ) -> io::Result<Arc<dyn QueuePair>>;

    fn connect(&self, param: ConnParam) -> io::Result<()>;

    fn disconnect(&self) -> io::Result<()>;
}

/// Entry point to an RDMA layer implementation.
pub trait Provider: Send + Sync {
    /// Create a CM id delivering its events to `handler`. The handler is
    /// held weakly; events after the owner is gone are dropped.
    fn create_cm_id(&self, handler: Weak<dyn CmEventHandler>) -> io::Result<Arc<dyn CmId>>;
}
