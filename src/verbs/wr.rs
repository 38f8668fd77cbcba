//! Work-request descriptors posted to a queue pair.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use super::provider::MemoryRegion;
use super::wc::WrId;

/// Scatter-gather element of a work request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Maximum SGEs on a send: the command capsule plus one in-capsule data
/// segment.
pub const MAX_SEND_SGES: usize = 2;

bitflags! {
    /// Memory region access rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MrAccess: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
    }
}

/// A send-side work request. Slices of these are posted as one chained
/// list; the verbs layer executes a chain in order within a single post.
pub enum SendWr {
    /// SEND of the command capsule, optionally with in-capsule data.
    Send {
        wr_id: WrId,
        sge: [Sge; MAX_SEND_SGES],
        num_sge: usize,
        signaled: bool,
    },

    /// Bind a fast-registration MR to its currently mapped page list under
    /// `key`. Always chained in front of the SEND that advertises the key.
    RegMr {
        wr_id: WrId,
        mr: Arc<dyn MemoryRegion>,
        key: u32,
        access: MrAccess,
    },

    /// Invalidate an rkey locally, releasing the registration.
    LocalInv { wr_id: WrId, rkey: u32 },
}

impl Clone for SendWr {
    fn clone(&self) -> Self {
        match self {
            SendWr::Send {
                wr_id,
                sge,
                num_sge,
                signaled,
            } => SendWr::Send {
                wr_id: *wr_id,
                sge: *sge,
                num_sge: *num_sge,
                signaled: *signaled,
            },
            SendWr::RegMr {
                wr_id,
                mr,
                key,
                access,
            } => SendWr::RegMr {
                wr_id: *wr_id,
                mr: mr.clone(),
                key: *key,
                access: *access,
            },
            SendWr::LocalInv { wr_id, rkey } => SendWr::LocalInv {
                wr_id: *wr_id,
                rkey: *rkey,
            },
        }
    }
}

impl SendWr {
    pub fn wr_id(&self) -> WrId {
        match self {
            SendWr::Send { wr_id, .. }
            | SendWr::RegMr { wr_id, .. }
            | SendWr::LocalInv { wr_id, .. } => *wr_id,
        }
    }

    pub fn is_signaled(&self) -> bool {
        matches!(self, SendWr::Send { signaled: true, .. })
    }
}

impl fmt::Debug for SendWr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendWr::Send {
                wr_id,
                num_sge,
                signaled,
                ..
            } => f
                .debug_struct("Send")
                .field("wr_id", wr_id)
                .field("num_sge", num_sge)
                .field("signaled", signaled)
                .finish(),
            SendWr::RegMr { wr_id, key, .. } => f
                .debug_struct("RegMr")
                .field("wr_id", wr_id)
                .field("key", key)
                .finish(),
            SendWr::LocalInv { wr_id, rkey } => f
                .debug_struct("LocalInv")
                .field("wr_id", wr_id)
                .field("rkey", rkey)
                .finish(),
        }
    }
}

/// A receive work request: one SGE pointing at a completion capsule slot.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: WrId,
    pub sge: Sge,
}

/// Parameters of the CM connect handshake.
#[derive(Debug, Clone)]
pub struct ConnParam {
    pub qp_num: u32,
    pub flow_control: bool,
    pub responder_resources: u32,
    /// Transport-layer retry count; the CM clamps it to its own maximum.
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    /// Connect request capsule.
    pub private_data: Vec<u8>,
}
