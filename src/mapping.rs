//! Data-mapping policy: how a request's payload becomes the command's
//! data pointer.
//!
//! Exactly one encoding is chosen per request: null (no payload), inline
//! (small write into the capsule), single remote key (one DMA segment via
//! the device's bulk MR), or fast registration. Only the last one sets
//! `need_inval`, and only it requires invalidation on completion.

use std::io;

use crate::blk::BlockRequest;
use crate::config::PAGE_SIZE;
use crate::device::DeviceEntry;
use crate::request::{ReqScratch, Request};
use crate::verbs::Sge;
use crate::wire::{
    put_le24, put_le32, Command, NVME_CMD_SGL, NVME_KEY_SGL_FMT_DATA_DESC, NVME_SGL_FMT_DATA_DESC,
    NVME_SGL_FMT_INVALIDATE, NVME_SGL_FMT_OFFSET,
};

/// Rotate the 8-bit key portion of an rkey before reuse.
#[inline]
pub(crate) fn inc_rkey(rkey: u32) -> u32 {
    const MASK: u32 = 0xff;
    (rkey.wrapping_add(1) & MASK) | (rkey & !MASK)
}

/// Zero-length keyed SGL: key 0, address 0.
pub(crate) fn set_sg_null(cmd: &mut Command) {
    let sg = cmd.ksgl_mut();
    sg.addr = 0;
    put_le24(&mut sg.length, 0);
    put_le32(&mut sg.key, 0);
    sg.type_ = NVME_KEY_SGL_FMT_DATA_DESC << 4;
}

fn map_sg_inline(dev: &DeviceEntry, icdoff: u16, scratch: &mut ReqScratch, cmd: &mut Command) {
    let seg = scratch.mapped[0];
    scratch.sge[1] = Sge {
        addr: seg.addr,
        length: seg.len,
        lkey: dev.pd().local_dma_lkey(),
    };

    let sg = cmd.sgl_mut();
    sg.addr = (icdoff as u64).to_le();
    sg.length = seg.len.to_le();
    sg.type_ = (NVME_SGL_FMT_DATA_DESC << 4) | NVME_SGL_FMT_OFFSET;

    scratch.inline_data = true;
    scratch.num_sge += 1;
}

fn map_sg_single(dev: &DeviceEntry, scratch: &mut ReqScratch, cmd: &mut Command) -> io::Result<()> {
    let mr = dev
        .bulk_mr()
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
    let seg = scratch.mapped[0];

    let sg = cmd.ksgl_mut();
    sg.addr = seg.addr.to_le();
    put_le24(&mut sg.length, seg.len);
    put_le32(&mut sg.key, mr.rkey());
    sg.type_ = NVME_KEY_SGL_FMT_DATA_DESC << 4;
    Ok(())
}

fn map_sg_fr(
    req: &Request,
    scratch: &mut ReqScratch,
    cmd: &mut Command,
    count: usize,
) -> io::Result<()> {
    let mr = req
        .mr()
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

    let nr = mr.map_sg(&scratch.mapped, PAGE_SIZE)?;
    if nr < count {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }

    mr.set_rkey(inc_rkey(mr.rkey()));
    scratch.need_inval = true;

    let sg = cmd.ksgl_mut();
    sg.addr = mr.iova().to_le();
    put_le24(&mut sg.length, mr.length() as u32);
    put_le32(&mut sg.key, mr.rkey());
    sg.type_ = (NVME_KEY_SGL_FMT_DATA_DESC << 4) | NVME_SGL_FMT_INVALIDATE;
    Ok(())
}

/// Fill the command's data pointer for `rq` and record the chosen encoding
/// in the request scratch. On error the scratch is left unmapped.
pub(crate) fn map_data(
    dev: &DeviceEntry,
    queue_idx: usize,
    inline_size: usize,
    icdoff: u16,
    register_always: bool,
    req: &Request,
    rq: &BlockRequest,
    cmd: &mut Command,
) -> io::Result<()> {
    let mut scratch = req.scratch();
    scratch.num_sge = 1;
    scratch.inline_data = false;
    scratch.need_inval = false;

    cmd.flags = NVME_CMD_SGL;

    if rq.nr_bytes == 0 {
        set_sg_null(cmd);
        return Ok(());
    }

    scratch.mapped.clear();
    let dir = rq.data_dir();
    let count = dev.dev().dma_map_sg(&rq.segments, dir, &mut scratch.mapped)?;
    if count == 0 {
        scratch.mapped.clear();
        return Err(io::Error::from_raw_os_error(libc::EIO));
    }
    scratch.dir = Some(dir);

    if count == 1 {
        if rq.is_write() && rq.nr_bytes as usize <= inline_size && queue_idx != 0 {
            map_sg_inline(dev, icdoff, &mut scratch, cmd);
            return Ok(());
        }
        if !register_always {
            return map_sg_single(dev, &mut scratch, cmd);
        }
    }

    map_sg_fr(req, &mut scratch, cmd, count).inspect_err(|_| {
        if let Some(dir) = scratch.dir.take() {
            dev.dev().dma_unmap_sg(&scratch.mapped, dir);
        }
        scratch.mapped.clear();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_rkey_rotates_low_byte() {
        assert_eq!(inc_rkey(0x1234_00ff), 0x1234_0000);
        assert_eq!(inc_rkey(0x1234_0000), 0x1234_0001);
    }

    #[test]
    fn test_null_sgl() {
        let mut cmd = Command::default();
        set_sg_null(&mut cmd);
        let sg = cmd.ksgl();
        assert_eq!(sg.addr, 0);
        assert_eq!(sg.length, [0; 3]);
        assert_eq!(sg.key, [0; 4]);
        assert_eq!(sg.type_, 0x40);
    }
}
