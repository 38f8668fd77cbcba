//! Shared per-RDMA-device state.
//!
//! Queues resolved onto the same device share one protection domain and,
//! unless registration is forced, one bulk DMA MR. Entries are refcounted
//! through `Arc`; the registry keeps only weak references, so `upgrade` is
//! the get-unless-zero primitive and a concurrent final drop can never be
//! resurrected.

use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::verbs::{Device, MemoryRegion, MrAccess, ProtectionDomain};

pub struct DeviceEntry {
    dev: Arc<dyn Device>,
    pd: Arc<dyn ProtectionDomain>,
    /// Absent when `register_always` forces fast registration everywhere.
    bulk_mr: Option<Arc<dyn MemoryRegion>>,
}

impl DeviceEntry {
    #[inline]
    pub fn dev(&self) -> &Arc<dyn Device> {
        &self.dev
    }

    #[inline]
    pub fn pd(&self) -> &Arc<dyn ProtectionDomain> {
        &self.pd
    }

    #[inline]
    pub fn bulk_mr(&self) -> Option<&Arc<dyn MemoryRegion>> {
        self.bulk_mr.as_ref()
    }
}

/// Process-wide cache of device entries, keyed by node GUID.
pub struct DeviceRegistry {
    entries: Mutex<Vec<Weak<DeviceEntry>>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Find the live entry for `dev` or create one. Devices without
    /// memory-management extensions are rejected outright.
    pub fn find_or_create(
        &self,
        dev: &Arc<dyn Device>,
        register_always: bool,
    ) -> Result<Arc<DeviceEntry>> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|w| w.strong_count() > 0);

        for weak in entries.iter() {
            if let Some(entry) = weak.upgrade() {
                if entry.dev.guid() == dev.guid() {
                    return Ok(entry);
                }
            }
        }

        if !dev.attrs().mem_mgt_extensions {
            log::error!("{}: memory registrations not supported", dev.name());
            return Err(Error::Incompatible("no memory-management extensions"));
        }

        let pd = dev.alloc_pd()?;
        let bulk_mr = if register_always {
            None
        } else {
            Some(pd.bulk_dma_mr(
                MrAccess::LOCAL_WRITE | MrAccess::REMOTE_READ | MrAccess::REMOTE_WRITE,
            )?)
        };

        let entry = Arc::new(DeviceEntry {
            dev: dev.clone(),
            pd,
            bulk_mr,
        });
        entries.push(Arc::downgrade(&entry));
        Ok(entry)
    }

    /// Number of live entries; teardown checks drive this to zero.
    pub fn live_entries(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|w| w.strong_count() > 0);
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::mock::MockDevice;

    #[test]
    fn test_entry_shared_by_guid() {
        let registry = DeviceRegistry::new();
        let dev: Arc<dyn Device> = MockDevice::new(0x1);

        let a = registry.find_or_create(&dev, false).unwrap();
        let b = registry.find_or_create(&dev, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.live_entries(), 1);
    }

    #[test]
    fn test_entry_dropped_then_recreated() {
        let registry = DeviceRegistry::new();
        let dev: Arc<dyn Device> = MockDevice::new(0x2);

        let a = registry.find_or_create(&dev, false).unwrap();
        drop(a);
        assert_eq!(registry.live_entries(), 0);

        // A dead weak entry must not be resurrected.
        let b = registry.find_or_create(&dev, false).unwrap();
        assert_eq!(registry.live_entries(), 1);
        drop(b);
    }

    #[test]
    fn test_register_always_skips_bulk_mr() {
        let registry = DeviceRegistry::new();
        let dev: Arc<dyn Device> = MockDevice::new(0x3);

        let entry = registry.find_or_create(&dev, true).unwrap();
        assert!(entry.bulk_mr().is_none());
    }

    #[test]
    fn test_rejects_device_without_mme() {
        let registry = DeviceRegistry::new();
        let mock = MockDevice::new(0x4);
        mock.set_mem_mgt_extensions(false);
        let dev: Arc<dyn Device> = mock;

        assert!(registry.find_or_create(&dev, false).is_err());
        assert_eq!(registry.live_entries(), 0);
    }
}
