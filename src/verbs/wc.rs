//! Work completions and completion routing.

use std::fmt;

use thiserror::Error;

/// Kind of work request a completion belongs to.
///
/// The transport routes completions by kind instead of per-entry callback
/// pointers; the kind is packed into the work-request identifier together
/// with a queue-local index (receive-ring slot or command tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WrKind {
    Recv = 0,
    Send = 1,
    RegMr = 2,
    LocalInv = 3,
}

/// Work-request identifier: a [`WrKind`] in the upper half and a 32-bit
/// queue-local index in the lower half of the verbs-level 64-bit `wr_id`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WrId(u64);

impl WrId {
    #[inline]
    pub fn new(kind: WrKind, index: u32) -> Self {
        WrId(((kind as u64) << 32) | index as u64)
    }

    #[inline]
    pub fn kind(self) -> WrKind {
        match self.0 >> 32 {
            0 => WrKind::Recv,
            1 => WrKind::Send,
            2 => WrKind::RegMr,
            3 => WrKind::LocalInv,
            k => panic!("invalid WR kind: {}", k),
        }
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        WrId(raw)
    }
}

impl fmt::Debug for WrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("WrId({:?}, {})", self.kind(), self.index()))
    }
}

/// Status of a completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    #[error("success")]
    Success,

    #[error("local length error")]
    LocLenErr,

    #[error("local protection error")]
    LocProtErr,

    #[error("WR flush error")]
    WrFlushErr,

    #[error("remote access error")]
    RemAccessErr,

    #[error("remote operation error")]
    RemOpErr,

    #[error("transport retry counter exceeded")]
    RetryExcErr,

    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr,

    #[error("general error")]
    GeneralErr,
}

/// A polled work completion.
///
/// `invalidate_rkey` is present when the peer sent-with-invalidate and the
/// NIC reported the invalidated key alongside the receive.
#[derive(Debug, Clone, Copy)]
pub struct Wc {
    pub wr_id: WrId,
    pub status: WcStatus,
    pub byte_len: u32,
    pub invalidate_rkey: Option<u32>,
}

impl Wc {
    /// A successful completion for the given work request.
    pub fn success(wr_id: WrId, byte_len: u32) -> Self {
        Wc {
            wr_id,
            status: WcStatus::Success,
            byte_len,
            invalidate_rkey: None,
        }
    }

    /// Completion status as a `Result` over the transferred byte count.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.byte_len as usize),
            err => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wr_id_pack() {
        for kind in [WrKind::Recv, WrKind::Send, WrKind::RegMr, WrKind::LocalInv] {
            let id = WrId::new(kind, 0xdead_beef);
            assert_eq!(id.kind(), kind);
            assert_eq!(id.index(), 0xdead_beef);
            assert_eq!(WrId::from_raw(id.raw()), id);
        }
    }
}
