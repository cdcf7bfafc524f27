/// Small shared helpers: logging bootstrap, optional locking, time,
/// little-endian slice accessors for hand-parsed blocks.
use std::sync::Once;

use chrono::Utc;
use log::*;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

static INIT: Once = Once::new();

/// Process-wide one-shot initialisation. Safe to call any number of
/// times from any thread; only the first call does work.
pub fn init_logs() {
    INIT.call_once(|| {
        if env_logger::try_init().is_err() {
            debug!("logger already installed by the host");
        }
    });
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// Take the read side of an advisory lock unless locking is disabled.
pub(crate) fn olock_read(lock: &RwLock<()>, enabled: bool) -> Option<RwLockReadGuard<'_, ()>> {
    if enabled {
        Some(lock.read())
    } else {
        None
    }
}

/// Take the write side of an advisory lock unless locking is disabled.
pub(crate) fn olock_write(lock: &RwLock<()>, enabled: bool) -> Option<RwLockWriteGuard<'_, ()>> {
    if enabled {
        Some(lock.write())
    } else {
        None
    }
}

pub fn get_u32_le(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub fn get_u64_le(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

pub fn put_u32_le(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u64_le(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_round_trip() {
        let mut buf = [0u8; 16];
        put_u32_le(&mut buf, 1, 0xdead_beef);
        put_u64_le(&mut buf, 6, 0x0123_4567_89ab_cdef);
        assert_eq!(get_u32_le(&buf, 1), 0xdead_beef);
        assert_eq!(get_u64_le(&buf, 6), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn olock_respects_nolocks() {
        let lock = RwLock::new(());
        assert!(olock_read(&lock, true).is_some());
        assert!(olock_write(&lock, false).is_none());
        // a disabled guard leaves the lock free for real users
        let _w = olock_write(&lock, true);
        assert!(olock_read(&lock, false).is_none());
    }
}
