//! Thread-safe catalog of live devices
//!
//! Mirrors `discover.py`'s `Discover` base class: one lock guards both the
//! uid-keyed and channel-id-keyed views of the same device set, additions
//! are idempotent by channel identity, and a snapshot is a frozen copy so
//! iteration never races a concurrent scanner (spec §4.4/§9 "Registry
//! iteration").

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::Device;
use crate::transport::ChannelId;

#[derive(Default)]
struct Inner {
    by_uid: HashMap<String, Arc<Device>>,
    by_channel: HashMap<ChannelId, Arc<Device>>,
}

/// Catalog of devices keyed by UID and by channel identity.
///
/// Both maps always describe the same device set - `add` never creates an
/// orphan in one without the other - and no I/O happens while the lock is
/// held, per the shared-resource policy in spec §5.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a newly discovered device, or - if its channel is already
    /// known - just mark the existing entry as seen.
    ///
    /// Matches `Discover.add_device`: re-observing the same physical
    /// channel on a rescan updates freshness only, it does not replace the
    /// Device (and so does not disturb a session currently holding its
    /// lock).
    pub fn add(&self, device: Arc<Device>) {
        let channel_id = device.channel_id().clone();
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_channel.get(&channel_id) {
            existing.mark_seen();
            return;
        }
        inner.by_uid.insert(device.uid().to_string(), device.clone());
        inner.by_channel.insert(channel_id, device);
    }

    pub fn get_by_uid(&self, uid: &str) -> Option<Arc<Device>> {
        self.inner.read().by_uid.get(uid).cloned()
    }

    pub fn get_by_channel(&self, id: &ChannelId) -> Option<Arc<Device>> {
        self.inner.read().by_channel.get(id).cloned()
    }

    /// A point-in-time consistent snapshot of every known device,
    /// regardless of age. Callers filter by `age()` themselves (mirrors
    /// `with ds as devices:` plus the caller's own `d.age > ...` checks).
    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.inner.read().by_uid.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_uid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::NullChannel;
    use crate::transport::ByteChannel;

    fn device(uid: &str, channel_id: &str) -> Arc<Device> {
        struct Tagged(NullChannel, String);
        #[async_trait::async_trait]
        impl ByteChannel for Tagged {
            fn id(&self) -> ChannelId {
                ChannelId::Serial(self.1.clone())
            }
            async fn read(&mut self, n: usize) -> crate::error::Result<bytes::Bytes> {
                self.0.read(n).await
            }
            async fn read_all(&mut self) -> crate::error::Result<bytes::Bytes> {
                self.0.read_all().await
            }
            async fn read_until(
                &mut self,
                pattern: &[u8],
                timeout: std::time::Duration,
            ) -> crate::error::Result<bytes::Bytes> {
                self.0.read_until(pattern, timeout).await
            }
            async fn write(&mut self, data: &[u8]) -> crate::error::Result<()> {
                self.0.write(data).await
            }
            async fn close(&mut self) {
                self.0.close().await
            }
        }
        Arc::new(Device::new(
            uid.to_string(),
            "test".to_string(),
            Box::new(Tagged(NullChannel, channel_id.to_string())),
        ))
    }

    #[test]
    fn add_then_get_by_uid() {
        let reg = Registry::new();
        reg.add(device("aa:bb", "port0"));
        assert!(reg.get_by_uid("aa:bb").is_some());
        assert!(reg.get_by_uid("cc:dd").is_none());
    }

    #[test]
    fn readd_same_channel_does_not_duplicate() {
        let reg = Registry::new();
        reg.add(device("aa:bb", "port0"));
        reg.add(device("aa:bb", "port0"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn snapshot_reflects_both_maps() {
        let reg = Registry::new();
        reg.add(device("aa:bb", "port0"));
        reg.add(device("cc:dd", "port1"));
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 2);
    }
}
