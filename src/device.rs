//! A device: a byte channel, a stable UID, freshness tracking, and a lock
//!
//! Mirrors `device.py`'s `Device` base class: the channel is never shared
//! concurrently, `last_seen`/`age` track freshness with a monotonic clock,
//! and `acquire`/`try_acquire` are the sole way to get at the channel -
//! matching the context-manager (`with device as repl:`) pattern, but
//! expressed as a guard so release happens on every exit path including
//! panics (spec §9 "context-managed locking").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{IotError, Result};
use crate::transport::{ByteChannel, ChannelId};

/// Epoch for `last_seen`/`age`: all instants are relative to process start
/// so the value can live in an `AtomicU64` (nanoseconds) without requiring
/// `Instant` itself to be atomic.
static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

fn now_nanos() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// A live device: an exclusively-owned byte channel plus identity and
/// freshness metadata.
///
/// `uid` and `channel_id` are fixed for the device's lifetime (spec's UID
/// invariant: "the UID of a Device never changes"). `last_seen` is the only
/// mutable field outside the channel itself, and it only moves forward.
pub struct Device {
    uid: String,
    channel_id: ChannelId,
    description: String,
    channel: Arc<Mutex<Box<dyn ByteChannel>>>,
    last_seen_nanos: AtomicU64,
}

/// A held lock on a `Device`'s channel, returned by `acquire`/`try_acquire`.
///
/// Dropping the guard releases the lock unconditionally - including on a
/// panic unwind - so a session can never leak a device in a locked state.
pub struct DeviceSession {
    device: Arc<Device>,
    guard: OwnedMutexGuard<Box<dyn ByteChannel>>,
}

impl Device {
    /// Wrap an already-connected channel. `uid` is learned by the caller
    /// (a one-shot REPL `uid()` eval for serial devices, or carried
    /// directly in a net advertisement) before construction, matching
    /// `Device.__init__`'s two code paths.
    pub fn new(uid: String, description: String, channel: Box<dyn ByteChannel>) -> Self {
        let channel_id = channel.id();
        Self {
            uid,
            channel_id,
            description,
            channel: Arc::new(Mutex::new(channel)),
            last_seen_nanos: AtomicU64::new(now_nanos()),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Time since this device was last confirmed reachable.
    pub fn age(&self) -> std::time::Duration {
        let seen = self.last_seen_nanos.load(Ordering::Relaxed);
        epoch().elapsed().saturating_sub(std::time::Duration::from_nanos(seen))
    }

    /// Mark the device as seen right now. Called after every successful
    /// REPL round trip (`Device.seen()` in the original).
    pub fn mark_seen(&self) {
        self.last_seen_nanos.store(now_nanos(), Ordering::Relaxed);
    }

    /// Block until the device's exclusive lock is available.
    pub async fn acquire(self: &Arc<Self>) -> DeviceSession {
        let guard = self.channel.clone().lock_owned().await;
        DeviceSession { device: self.clone(), guard }
    }

    /// Non-blocking variant used by the server to answer "busy" without
    /// queueing (`DeviceServer`'s `try_acquire` semantics in spec §4.9).
    pub fn try_acquire(self: &Arc<Self>) -> std::result::Result<DeviceSession, IotError> {
        match self.channel.clone().try_lock_owned() {
            Ok(guard) => Ok(DeviceSession { device: self.clone(), guard }),
            Err(_) => Err(IotError::DeviceBusy { uid: self.uid.clone() }),
        }
    }

    /// `true` if some session currently holds the channel lock.
    pub fn is_locked(&self) -> bool {
        // A best-effort, non-blocking check: try to take the lock without
        // awaiting and see if it was free.
        self.channel.try_lock().is_err()
    }

    /// Reclaim the boxed channel from a `Device` with no other strong
    /// references and no session currently held. Returns `None` if the
    /// device is shared or locked elsewhere.
    ///
    /// Used by the serial scanner: it wraps a freshly-opened channel in a
    /// throwaway `Device` (a placeholder uid) just to run a one-shot
    /// `uid()` REPL eval, then needs the same channel back to build the
    /// real, correctly-keyed `Device` - `uid` is immutable once set, so
    /// the placeholder cannot simply be relabeled.
    pub(crate) fn into_channel(self: Arc<Self>) -> Option<Box<dyn ByteChannel>> {
        let device = Arc::try_unwrap(self).ok()?;
        let mutex = Arc::try_unwrap(device.channel).ok()?;
        Some(mutex.into_inner())
    }
}

impl DeviceSession {
    pub fn uid(&self) -> &str {
        &self.device.uid
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn channel(&mut self) -> &mut dyn ByteChannel {
        &mut **self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::NullChannel;

    #[tokio::test]
    async fn try_acquire_reports_busy_when_locked() {
        let device = Arc::new(Device::new(
            "aa:bb".into(),
            "test".into(),
            Box::new(NullChannel::default()),
        ));
        let _session = device.acquire().await;
        let err = device.try_acquire().unwrap_err();
        assert!(matches!(err, IotError::DeviceBusy { .. }));
    }

    #[tokio::test]
    async fn into_channel_reclaims_after_session_dropped() {
        let device = Arc::new(Device::new(
            "pending".into(),
            "test".into(),
            Box::new(NullChannel::default()),
        ));
        {
            let _session = device.acquire().await;
        }
        assert!(device.into_channel().is_some());
    }

    #[tokio::test]
    async fn age_grows_monotonically_and_reset_by_mark_seen() {
        let device = Device::new("aa:bb".into(), "test".into(), Box::new(NullChannel::default()));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(device.age() >= std::time::Duration::from_millis(5));
        device.mark_seen();
        assert!(device.age() < std::time::Duration::from_millis(5));
    }
}
