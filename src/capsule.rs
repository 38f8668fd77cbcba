//! Capsule buffers and the receive ring.
//!
//! A capsule is one DMA-mapped buffer sized for a command (send side) or a
//! completion (receive ring slot). Ring slots are pre-posted at connection
//! establishment and re-posted after every consumed completion.

use std::sync::Arc;

use crate::error::Result;
use crate::verbs::{Device, DmaBuf, DmaDir};
use crate::wire::{Command, Completion, CMD_SIZE, CQE_SIZE};

pub struct Capsule {
    dev: Arc<dyn Device>,
    buf: Arc<DmaBuf>,
    dir: DmaDir,
}

impl Capsule {
    pub fn alloc(dev: &Arc<dyn Device>, len: usize, dir: DmaDir) -> Result<Capsule> {
        let buf = dev.alloc_dma_buf(len, dir)?;
        Ok(Capsule {
            dev: dev.clone(),
            buf,
            dir,
        })
    }

    #[inline]
    pub fn dma(&self) -> u64 {
        self.buf.dma()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn sync_for_cpu(&self) {
        self.dev.dma_sync_for_cpu(&self.buf, self.dir);
    }

    pub fn sync_for_device(&self) {
        self.dev.dma_sync_for_device(&self.buf, self.dir);
    }

    /// Write a command image into the capsule. Only valid while the CPU
    /// owns the buffer (between `sync_for_cpu` and `sync_for_device`).
    pub fn write_cmd(&self, cmd: &Command) {
        debug_assert!(self.len() >= CMD_SIZE);
        // SAFETY: send capsules are owned by the submitting context until
        // posted; nothing else references the bytes here.
        unsafe {
            self.buf.bytes_mut()[..CMD_SIZE].copy_from_slice(cmd.as_bytes());
        }
    }

    /// Read the completion image out of a ring slot. Only valid after the
    /// receive completion for this slot has been consumed and the capsule
    /// synced for CPU access.
    pub fn read_cqe(&self) -> Completion {
        debug_assert!(self.len() >= CQE_SIZE);
        // SAFETY: the slot is not posted while the completion path holds
        // it, so the device no longer writes to the buffer.
        Completion::read_from(unsafe { self.buf.bytes() })
    }
}

/// Allocate a receive ring of `n` completion-sized capsules.
pub fn alloc_ring(dev: &Arc<dyn Device>, n: usize, len: usize, dir: DmaDir) -> Result<Vec<Capsule>> {
    let mut ring = Vec::with_capacity(n);
    for _ in 0..n {
        ring.push(Capsule::alloc(dev, len, dir)?);
    }
    Ok(ring)
}
