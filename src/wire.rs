//! NVMe and NVMe-over-Fabrics wire formats, limited to what the transport
//! itself reads or writes.
//!
//! Command and completion capsules travel as raw little-endian byte images
//! inside DMA buffers; the structures here are `#[repr(C)]` views of those
//! images with explicit endianness conversion at every field access.

use std::mem;
use std::slice;

/// Size of an NVMe submission command.
pub const CMD_SIZE: usize = mem::size_of::<Command>();

/// Size of an NVMe completion entry.
pub const CQE_SIZE: usize = mem::size_of::<Completion>();

pub const NVME_OPC_FLUSH: u8 = 0x00;
pub const NVME_OPC_WRITE: u8 = 0x01;
pub const NVME_OPC_READ: u8 = 0x02;
pub const NVME_OPC_ASYNC_EVENT_REQUEST: u8 = 0x0c;

/// Status codes as seen after dropping the phase bit (`status >> 1`).
pub const NVME_SC_SUCCESS: u16 = 0x0;
pub const NVME_SC_ABORT_REQ: u16 = 0x7;
/// Do-not-retry bit, OR'd into the status code.
pub const NVME_SC_DNR: u16 = 0x4000;

/// Async event result mask: event type (bits 2:0) plus event info (15:8).
pub const NVME_AER_MASK: u32 = 0xff07;
/// Notice-type event, namespace-attribute-changed info.
pub const NVME_AER_NOTICE_NS_CHANGED: u32 = 0x0002;

/// Command `flags` value selecting SGL data transfers.
pub const NVME_CMD_SGL: u8 = 1 << 7;

/// Keyed SGL support bit in the identify-controller SGLS field.
pub const NVME_CTRL_SGLS_KEYED: u32 = 1 << 20;

/// SGL descriptor type nibbles (high nibble of the type byte).
pub const NVME_SGL_FMT_DATA_DESC: u8 = 0x00;
pub const NVME_KEY_SGL_FMT_DATA_DESC: u8 = 0x04;

/// SGL descriptor sub-type nibbles (low nibble of the type byte).
pub const NVME_SGL_FMT_ADDRESS: u8 = 0x00;
pub const NVME_SGL_FMT_OFFSET: u8 = 0x01;
pub const NVME_SGL_FMT_INVALIDATE: u8 = 0x0f;

/// Controller capability register offset and field access.
pub const NVME_REG_CAP: u32 = 0x0;

/// MQES field of CAP: maximum entries per queue, zero-based.
#[inline]
pub fn cap_mqes(cap: u64) -> u64 {
    cap & 0xffff
}

/// Store a 24-bit little-endian length field.
#[inline]
pub fn put_le24(dst: &mut [u8; 3], v: u32) {
    dst[0] = v as u8;
    dst[1] = (v >> 8) as u8;
    dst[2] = (v >> 16) as u8;
}

#[inline]
pub fn get_le24(src: &[u8; 3]) -> u32 {
    src[0] as u32 | (src[1] as u32) << 8 | (src[2] as u32) << 16
}

#[inline]
pub fn put_le32(dst: &mut [u8; 4], v: u32) {
    *dst = v.to_le_bytes();
}

#[inline]
pub fn get_le32(src: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*src)
}

/// Keyed SGL data-block descriptor: address, 24-bit length, remote key.
///
/// `length` and `key` are byte arrays because the wire layout leaves them
/// unaligned.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KeyedSglDesc {
    pub addr: u64,
    pub length: [u8; 3],
    pub key: [u8; 4],
    pub type_: u8,
}

/// Plain SGL data-block descriptor used for in-capsule data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SglDesc {
    pub addr: u64,
    pub length: u32,
    pub rsvd: [u8; 3],
    pub type_: u8,
}

/// The 16-byte data pointer of a command.
#[repr(C)]
#[derive(Clone, Copy)]
pub union DataPtr {
    pub ksgl: KeyedSglDesc,
    pub sgl: SglDesc,
    pub prp: [u64; 2],
}

/// An NVMe submission command, flattened to the fields this transport and
/// its tests touch. `cdw10`/`cdw11` carry the starting LBA and `cdw12` the
/// zero-based block count for reads and writes.
///
/// All multi-byte fields are little-endian on the wire; setters convert.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Command {
    pub opcode: u8,
    pub flags: u8,
    pub command_id: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub metadata: u64,
    pub dptr: DataPtr,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl Default for Command {
    fn default() -> Self {
        // SAFETY: all-zero bytes are a valid command image.
        unsafe { mem::zeroed() }
    }
}

impl Command {
    /// Build a read or write command the way the generic NVMe layer does.
    pub fn rw(opcode: u8, nsid: u32, slba: u64, nlb: u16) -> Self {
        let mut c = Command::default();
        c.opcode = opcode;
        c.nsid = nsid.to_le();
        c.cdw10 = (slba as u32).to_le();
        c.cdw11 = ((slba >> 32) as u32).to_le();
        c.cdw12 = (nlb as u32).to_le();
        c
    }

    pub fn set_command_id(&mut self, id: u16) {
        self.command_id = id.to_le();
    }

    /// View the data pointer as a keyed SGL descriptor.
    pub fn ksgl(&self) -> &KeyedSglDesc {
        // SAFETY: every union variant is a plain 16-byte image.
        unsafe { &self.dptr.ksgl }
    }

    pub fn ksgl_mut(&mut self) -> &mut KeyedSglDesc {
        // SAFETY: as above.
        unsafe { &mut self.dptr.ksgl }
    }

    /// View the data pointer as a plain SGL descriptor.
    pub fn sgl(&self) -> &SglDesc {
        // SAFETY: as above.
        unsafe { &self.dptr.sgl }
    }

    pub fn sgl_mut(&mut self) -> &mut SglDesc {
        // SAFETY: as above.
        unsafe { &mut self.dptr.sgl }
    }

    /// Raw byte image of the command, as transmitted.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `Command` is a POD of exactly `CMD_SIZE` bytes.
        unsafe { slice::from_raw_parts(self as *const Command as *const u8, CMD_SIZE) }
    }

    /// Reconstruct a command from its byte image.
    ///
    /// Panics if `buf` is shorter than a command.
    pub fn read_from(buf: &[u8]) -> Self {
        assert!(buf.len() >= CMD_SIZE);
        let mut c = Command::default();
        // SAFETY: POD destination, length checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), &mut c as *mut Command as *mut u8, CMD_SIZE)
        };
        c
    }
}

/// An NVMe completion queue entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Completion {
    pub result: u32,
    pub rsvd: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub command_id: u16,
    pub status: u16,
}

impl Completion {
    /// Build a completion entry, encoding the phase bit into `status`.
    pub fn new(command_id: u16, status: u16, result: u32) -> Self {
        Completion {
            result: result.to_le(),
            rsvd: 0,
            sq_head: 0,
            sq_id: 0,
            command_id: command_id.to_le(),
            status: (status << 1).to_le(),
        }
    }

    pub fn command_id(&self) -> u16 {
        u16::from_le(self.command_id)
    }

    /// Raw status field, phase bit included.
    pub fn status(&self) -> u16 {
        u16::from_le(self.status)
    }

    pub fn result(&self) -> u32 {
        u32::from_le(self.result)
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: POD of exactly `CQE_SIZE` bytes.
        unsafe { slice::from_raw_parts(self as *const Completion as *const u8, CQE_SIZE) }
    }

    pub fn read_from(buf: &[u8]) -> Self {
        assert!(buf.len() >= CQE_SIZE);
        let mut c = Completion::default();
        // SAFETY: POD destination, length checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                &mut c as *mut Completion as *mut u8,
                CQE_SIZE,
            )
        };
        c
    }
}

/// CM private-data format tag: "RDMA CM format 1.0".
pub const NVME_RDMA_CM_FMT_1_0: u16 = 0x0;

/// Connect request capsule carried as CM private data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CmRequest {
    pub recfmt: u16,
    pub qid: u16,
    pub hrqsize: u16,
    pub hsqsize: u16,
    pub rsvd: [u8; 24],
}

impl CmRequest {
    pub fn new(qid: u16, hrqsize: u16, hsqsize: u16) -> Self {
        CmRequest {
            recfmt: NVME_RDMA_CM_FMT_1_0.to_le(),
            qid: qid.to_le(),
            hrqsize: hrqsize.to_le(),
            hsqsize: hsqsize.to_le(),
            rsvd: [0; 24],
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // SAFETY: POD of exactly 32 bytes.
        unsafe {
            slice::from_raw_parts(
                self as *const CmRequest as *const u8,
                mem::size_of::<CmRequest>(),
            )
        }
        .to_vec()
    }

    /// Decode a connect capsule; `None` if truncated.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < mem::size_of::<CmRequest>() {
            return None;
        }
        let mut req = CmRequest::new(0, 0, 0);
        // SAFETY: POD destination, length checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                &mut req as *mut CmRequest as *mut u8,
                mem::size_of::<CmRequest>(),
            )
        };
        Some(req)
    }

    pub fn qid(&self) -> u16 {
        u16::from_le(self.qid)
    }

    pub fn hrqsize(&self) -> u16 {
        u16::from_le(self.hrqsize)
    }

    pub fn hsqsize(&self) -> u16 {
        u16::from_le(self.hsqsize)
    }
}

/// Reject capsule returned as consumer-defined CM private data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CmReject {
    pub recfmt: u16,
    pub sts: u16,
}

impl CmReject {
    /// Decode a reject capsule; `None` if the private data is too short to
    /// be one, which callers treat as a plain connection reset.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < mem::size_of::<CmReject>() {
            return None;
        }
        Some(CmReject {
            recfmt: u16::from_le_bytes([buf[0], buf[1]]),
            sts: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repr() {
        assert_eq!(mem::size_of::<Command>(), 64);
        assert_eq!(mem::size_of::<Completion>(), 16);
        assert_eq!(mem::size_of::<KeyedSglDesc>(), 16);
        assert_eq!(mem::size_of::<SglDesc>(), 16);
        assert_eq!(mem::size_of::<DataPtr>(), 16);
        assert_eq!(mem::size_of::<CmRequest>(), 32);
        assert_eq!(mem::size_of::<CmReject>(), 4);
    }

    #[test]
    fn test_le24() {
        let mut b = [0u8; 3];
        put_le24(&mut b, 0x123456);
        assert_eq!(b, [0x56, 0x34, 0x12]);
        assert_eq!(get_le24(&b), 0x123456);
    }

    #[test]
    fn test_sgl_type_bytes() {
        assert_eq!(NVME_KEY_SGL_FMT_DATA_DESC << 4, 0x40);
        assert_eq!((NVME_KEY_SGL_FMT_DATA_DESC << 4) | NVME_SGL_FMT_INVALIDATE, 0x4f);
        assert_eq!((NVME_SGL_FMT_DATA_DESC << 4) | NVME_SGL_FMT_OFFSET, 0x01);
    }

    #[test]
    fn test_command_roundtrip() {
        let mut c = Command::rw(NVME_OPC_READ, 1, 0x1_0000_0010, 7);
        c.set_command_id(42);
        let back = Command::read_from(c.as_bytes());
        assert_eq!(back.opcode, NVME_OPC_READ);
        assert_eq!(u16::from_le(back.command_id), 42);
        assert_eq!(u32::from_le(back.cdw10), 0x10);
        assert_eq!(u32::from_le(back.cdw11), 0x1);
    }

    #[test]
    fn test_completion_phase_bit() {
        let cqe = Completion::new(3, NVME_SC_ABORT_REQ, 0);
        assert_eq!(cqe.status() >> 1, NVME_SC_ABORT_REQ);
        assert_eq!(cqe.command_id(), 3);
    }

    #[test]
    fn test_cm_request_roundtrip() {
        let req = CmRequest::new(2, 128, 128);
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), 32);
        let back = CmRequest::parse(&bytes).unwrap();
        assert_eq!(back.qid(), 2);
        assert_eq!(back.hrqsize(), 128);
        assert_eq!(back.hsqsize(), 128);
    }

    #[test]
    fn test_cm_reject_short() {
        assert!(CmReject::parse(&[0x00, 0x00, 0x08]).is_none());
        let rej = CmReject::parse(&[0x00, 0x00, 0x08, 0x00]).unwrap();
        assert_eq!(rej.sts, 8);
    }
}
