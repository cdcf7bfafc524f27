/// Extendable file: a paged, optionally memory-mapped file abstraction.
///
/// An `ExtFile` owns one backing file, its logical size (always a
/// multiple of the system page size), a pluggable growth policy and a
/// set of non-overlapping memory-mapped windows ("slots") kept sorted
/// by offset. Reads and writes are hybrid: every byte range is walked
/// against the slot list in offset order, served by `memcpy` where a
/// mapping covers it and by positional file I/O everywhere else.
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::*;
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::{RwLock, RwLockReadGuard};
use thiserror::Error;

pub mod policy;

pub use policy::{round_up, FibPolicy, PageRoundPolicy, RationalPolicy, ResizePolicy};

/// Largest addressable file offset: 255 GiB, page aligned.
pub const MAX_FILE_OFF: u64 = 0x3fff_ffff_c0;

#[derive(Debug, Error)]
pub enum ExfError {
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("offset is not page aligned")]
    NotAligned,
    #[error("mmap range overlaps an existing slot")]
    MmapOverlap,
    #[error("offset is not covered by a mmap slot")]
    NotMmaped,
    #[error("resize policy produced an unusable file size")]
    ResizePolicyFail,
    #[error("file size limit reached")]
    MaxOff,
    #[error("offset is out of file bounds")]
    OutOfBounds,
    #[error("operation not allowed in the current file state")]
    InvalidState,
    #[error("file is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ExfError>;

/// Open options for `ExtFile::open`.
pub struct Opts {
    pub rdonly: bool,
    pub trunc: bool,
    /// Grow a fresh file to at least this size right after open.
    pub initial_size: u64,
    /// Hard cap on the file size, 0 selects `MAX_FILE_OFF`.
    pub maxoff: u64,
    pub policy: Option<Box<dyn ResizePolicy>>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            rdonly: false,
            trunc: false,
            initial_size: 0,
            maxoff: 0,
            policy: None,
        }
    }
}

/// One contiguous memory-mapped window over a page-aligned file range.
struct MmapSlot {
    off: u64,
    /// Currently mapped length, `<= min(maxlen, fsize - off)`.
    len: u64,
    /// Page-aligned reservation; the slot never maps beyond it.
    maxlen: u64,
    map: Option<MmapRaw>,
}

struct ExtInner {
    file: Option<File>,
    fsize: u64,
    psize: u64,
    maxoff: u64,
    rdonly: bool,
    policy: Box<dyn ResizePolicy>,
    slots: Vec<MmapSlot>,
}

pub struct ExtFile {
    inner: RwLock<ExtInner>,
}

/// Read-side view of the file state, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct ExfState {
    pub file_size: u64,
    pub page_size: u64,
    /// `(off, mapped_len, maxlen)` per slot, in offset order.
    pub slots: Vec<(u64, u64, u64)>,
}

/// RAII view into one mapped slot. Holds the file read lock, so the
/// bytes cannot be remapped or truncated away while the guard lives.
pub struct MmapRef<'a> {
    _guard: RwLockReadGuard<'a, ExtInner>,
    ptr: *const u8,
    len: usize,
}

impl<'a> MmapRef<'a> {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<'a> std::ops::Deref for MmapRef<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

pub fn sys_page_size() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as u64
    }
}

impl ExtFile {
    pub fn open(path: &Path, opts: Opts) -> Result<ExtFile> {
        let psize = sys_page_size();
        let file = OpenOptions::new()
            .read(true)
            .write(!opts.rdonly)
            .create(!opts.rdonly)
            .truncate(opts.trunc && !opts.rdonly)
            .open(path)?;
        let mut fsize = file.metadata()?.len();
        let maxoff = if opts.maxoff == 0 { MAX_FILE_OFF } else { opts.maxoff };
        if !opts.rdonly {
            // keep the size invariant: multiple of the page size
            let want = round_up(fsize.max(opts.initial_size), psize)
                .ok_or(ExfError::ResizePolicyFail)?;
            if want > maxoff {
                return Err(ExfError::MaxOff);
            }
            if want != fsize {
                file.set_len(want)?;
                fsize = want;
            }
        }
        debug!("extfile open {:?}: size {} page {}", path, fsize, psize);
        Ok(ExtFile {
            inner: RwLock::new(ExtInner {
                file: Some(file),
                fsize,
                psize,
                maxoff,
                rdonly: opts.rdonly,
                policy: opts.policy.unwrap_or_else(|| Box::new(PageRoundPolicy)),
                slots: Vec::new(),
            }),
        })
    }

    pub fn page_size(&self) -> u64 {
        self.inner.read().psize
    }

    pub fn size(&self) -> u64 {
        self.inner.read().fsize
    }

    pub fn state(&self) -> ExfState {
        let inner = self.inner.read();
        ExfState {
            file_size: inner.fsize,
            page_size: inner.psize,
            slots: inner.slots.iter().map(|s| (s.off, s.len, s.maxlen)).collect(),
        }
    }

    /// Read up to `buf.len()` bytes at `off`. Returns the number of
    /// bytes served, which is short only when `off + len` crosses the
    /// end of the file.
    pub fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.read();
        inner.check_open()?;
        inner.transfer_read(off, buf)
    }

    /// Write `data` at `off`, growing the file through the resize
    /// policy when the range extends past the current size.
    pub fn write(&self, off: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = off
            .checked_add(data.len() as u64)
            .ok_or(ExfError::OutOfBounds)?;
        {
            let inner = self.inner.read();
            inner.check_open()?;
            if inner.rdonly {
                return Err(ExfError::InvalidState);
            }
            if end <= inner.fsize {
                inner.transfer_write(off, data)?;
                return Ok(data.len());
            }
        }
        let mut inner = self.inner.write();
        inner.check_open()?;
        if end > inner.fsize {
            inner.grow(end)?;
        }
        inner.transfer_write(off, data)?;
        Ok(data.len())
    }

    /// Grow the file (through the policy) so that at least `sz` bytes
    /// are addressable. Never shrinks.
    pub fn ensure_size(&self, sz: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        if inner.rdonly {
            return Err(ExfError::InvalidState);
        }
        if sz > inner.fsize {
            inner.grow(sz)?;
        }
        Ok(())
    }

    /// Set the file size to `sz` rounded up to a page, bypassing the
    /// growth policy. Shrinking unmaps slot tails beyond the new end.
    pub fn truncate(&self, sz: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        if inner.rdonly {
            return Err(ExfError::InvalidState);
        }
        let nsz = round_up(sz, inner.psize).ok_or(ExfError::ResizePolicyFail)?;
        if nsz > inner.maxoff {
            return Err(ExfError::MaxOff);
        }
        inner.set_size(nsz)
    }

    /// Register a mapped window at page-aligned `off` spanning up to
    /// `maxlen` bytes (`u64::MAX` reserves to the file size cap). The
    /// reserved range must not overlap any existing slot.
    pub fn add_mmap(&self, off: u64, maxlen: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        if off % inner.psize != 0 {
            return Err(ExfError::NotAligned);
        }
        if off >= inner.maxoff {
            return Err(ExfError::OutOfBounds);
        }
        let maxlen = if maxlen == u64::MAX {
            let m = inner.maxoff - off;
            m - m % inner.psize
        } else {
            round_up(maxlen, inner.psize).ok_or(ExfError::ResizePolicyFail)?
        };
        if maxlen == 0 {
            return Err(ExfError::OutOfBounds);
        }
        let pos = inner.slots.partition_point(|s| s.off < off);
        if let Some(next) = inner.slots.get(pos) {
            if off + maxlen > next.off {
                return Err(ExfError::MmapOverlap);
            }
        }
        if pos > 0 {
            let prev = &inner.slots[pos - 1];
            if prev.off + prev.maxlen > off {
                return Err(ExfError::MmapOverlap);
            }
        }
        inner.slots.insert(
            pos,
            MmapSlot {
                off,
                len: 0,
                maxlen,
                map: None,
            },
        );
        inner.init_slot(pos)?;
        Ok(())
    }

    /// Unmap and unregister the slot starting exactly at `off`.
    pub fn remove_mmap(&self, off: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.check_open()?;
        match inner.slots.iter().position(|s| s.off == off) {
            Some(pos) => {
                inner.slots.remove(pos);
                Ok(())
            }
            None => Err(ExfError::NotMmaped),
        }
    }

    /// Pin the mapping covering `off` and return a view of its bytes
    /// from `off` to the end of the mapped window. The read lock is
    /// held until the returned guard is dropped.
    pub fn acquire_mmap(&self, off: u64) -> Result<MmapRef<'_>> {
        let inner = self.inner.read();
        inner.check_open()?;
        let (ptr, len) = inner.probe(off)?;
        Ok(MmapRef {
            _guard: inner,
            ptr,
            len,
        })
    }

    /// Number of mapped bytes available at `off` without pinning them.
    pub fn probe_mmap(&self, off: u64) -> Result<usize> {
        let inner = self.inner.read();
        inner.check_open()?;
        inner.probe(off).map(|(_, len)| len)
    }

    /// Flush mapped windows and the file itself to stable storage.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.read();
        let file = inner.check_open()?;
        for slot in &inner.slots {
            if let Some(map) = &slot.map {
                map.flush()?;
            }
        }
        file.sync_data()?;
        Ok(())
    }

    /// Flush the single mapped window starting at or covering `off`.
    pub fn sync_mmap(&self, off: u64) -> Result<()> {
        let inner = self.inner.read();
        inner.check_open()?;
        for slot in &inner.slots {
            if slot.len > 0 && slot.off <= off && off < slot.off + slot.len {
                if let Some(map) = &slot.map {
                    map.flush()?;
                }
                return Ok(());
            }
        }
        Err(ExfError::NotMmaped)
    }

    /// Flush and release everything. Idempotent; any later operation
    /// fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.file.is_none() {
            return Ok(());
        }
        if !inner.rdonly {
            for slot in &inner.slots {
                if let Some(map) = &slot.map {
                    map.flush()?;
                }
            }
            if let Some(file) = &inner.file {
                file.sync_data()?;
            }
        }
        inner.slots.clear();
        inner.policy.dispose();
        inner.file = None;
        Ok(())
    }
}

impl Drop for ExtFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("extfile close on drop failed: {}", err);
        }
    }
}

impl ExtInner {
    fn check_open(&self) -> Result<&File> {
        self.file.as_ref().ok_or(ExfError::Closed)
    }

    fn probe(&self, off: u64) -> Result<(*const u8, usize)> {
        for slot in &self.slots {
            if slot.len > 0 && slot.off <= off && off < slot.off + slot.len {
                let map = slot.map.as_ref().ok_or(ExfError::NotMmaped)?;
                let skip = (off - slot.off) as usize;
                let ptr = unsafe { map.as_ptr().add(skip) };
                return Ok((ptr, slot.len as usize - skip));
            }
        }
        Err(ExfError::NotMmaped)
    }

    /// Grow the file to cover `need` bytes using the resize policy.
    /// On ftruncate failure the old size is kept and the mappings are
    /// re-initialised best effort.
    fn grow(&mut self, need: u64) -> Result<()> {
        if self.rdonly {
            return Err(ExfError::InvalidState);
        }
        if need > self.maxoff {
            return Err(ExfError::MaxOff);
        }
        let old = self.fsize;
        let mut nsz = self.policy.compute(need, old, self.psize);
        if nsz < need || nsz % self.psize != 0 {
            warn!(
                "resize policy returned {} for request {}, using page round-up",
                nsz, need
            );
            nsz = round_up(need, self.psize).ok_or(ExfError::ResizePolicyFail)?;
        }
        if nsz > self.maxoff {
            // clamp the over-allocation, the request itself still fits
            nsz = self.maxoff - self.maxoff % self.psize;
            if nsz < need {
                return Err(ExfError::MaxOff);
            }
        }
        if let Err(err) = self.set_size(nsz) {
            warn!("grow to {} failed: {}, size stays {}", nsz, err, old);
            return Err(err);
        }
        Ok(())
    }

    fn set_size(&mut self, nsz: u64) -> Result<()> {
        let file = self.file.as_ref().ok_or(ExfError::Closed)?;
        if let Err(err) = file.set_len(nsz) {
            // keep the old size; remap so readers stay coherent
            let _ = self.init_all_slots();
            return Err(ExfError::Io(err));
        }
        self.fsize = nsz;
        self.init_all_slots()
    }

    fn init_all_slots(&mut self) -> Result<()> {
        for pos in 0..self.slots.len() {
            self.init_slot(pos)?;
        }
        Ok(())
    }

    /// Recompute one slot's mapped window against the current file
    /// size: remap when it changed, drop the mapping entirely when the
    /// slot now starts beyond the end of the file.
    fn init_slot(&mut self, pos: usize) -> Result<()> {
        let fsize = self.fsize;
        let file = self.file.as_ref().ok_or(ExfError::Closed)?;
        let slot = &mut self.slots[pos];
        let want = if fsize > slot.off {
            slot.maxlen.min(fsize - slot.off)
        } else {
            0
        };
        if want == slot.len && slot.map.is_some() == (want > 0) {
            return Ok(());
        }
        slot.map = None;
        slot.len = 0;
        if want > 0 {
            let map = MmapOptions::new()
                .offset(slot.off)
                .len(want as usize)
                .map_raw(file)?;
            slot.map = Some(map);
            slot.len = want;
        }
        Ok(())
    }

    fn transfer_read(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || off >= self.fsize {
            return Ok(0);
        }
        let end = self.fsize.min(off + buf.len() as u64);
        let total = (end - off) as usize;
        let mut pos = off;
        let mut done = 0usize;
        for slot in &self.slots {
            if done == total {
                break;
            }
            if slot.len == 0 || slot.off + slot.len <= pos {
                continue;
            }
            if slot.off >= end {
                break;
            }
            if pos < slot.off {
                let n = ((slot.off - pos) as usize).min(total - done);
                self.file_read(pos, &mut buf[done..done + n])?;
                done += n;
                pos += n as u64;
                if done == total {
                    break;
                }
            }
            let skip = (pos - slot.off) as usize;
            let n = (slot.len as usize - skip).min(total - done);
            let map = slot.map.as_ref().ok_or(ExfError::NotMmaped)?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    map.as_ptr().add(skip),
                    buf[done..].as_mut_ptr(),
                    n,
                );
            }
            done += n;
            pos += n as u64;
        }
        if done < total {
            self.file_read(pos, &mut buf[done..total])?;
        }
        Ok(total)
    }

    fn transfer_write(&self, off: u64, data: &[u8]) -> Result<()> {
        let end = off + data.len() as u64;
        debug_assert!(end <= self.fsize);
        let total = data.len();
        let mut pos = off;
        let mut done = 0usize;
        for slot in &self.slots {
            if done == total {
                break;
            }
            if slot.len == 0 || slot.off + slot.len <= pos {
                continue;
            }
            if slot.off >= end {
                break;
            }
            if pos < slot.off {
                let n = ((slot.off - pos) as usize).min(total - done);
                self.file_write(pos, &data[done..done + n])?;
                done += n;
                pos += n as u64;
                if done == total {
                    break;
                }
            }
            let skip = (pos - slot.off) as usize;
            let n = (slot.len as usize - skip).min(total - done);
            let map = slot.map.as_ref().ok_or(ExfError::NotMmaped)?;
            // mapped bytes take the data directly; the OS flushes the
            // mapping on sync, there is no write-through to the file
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data[done..].as_ptr(),
                    map.as_mut_ptr().add(skip),
                    n,
                );
            }
            done += n;
            pos += n as u64;
        }
        if done < total {
            self.file_write(pos, &data[done..])?;
        }
        Ok(())
    }

    fn file_read(&self, mut off: u64, buf: &mut [u8]) -> Result<()> {
        let file = self.file.as_ref().ok_or(ExfError::Closed)?;
        let mut done = 0usize;
        while done < buf.len() {
            match file.read_at(&mut buf[done..], off) {
                Ok(0) => {
                    return Err(ExfError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "short read inside file bounds",
                    )))
                }
                Ok(n) => {
                    done += n;
                    off += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ExfError::Io(err)),
            }
        }
        Ok(())
    }

    fn file_write(&self, mut off: u64, data: &[u8]) -> Result<()> {
        let file = self.file.as_ref().ok_or(ExfError::Closed)?;
        let mut done = 0usize;
        while done < data.len() {
            match file.write_at(&data[done..], off) {
                Ok(0) => {
                    return Err(ExfError::Io(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "file write made no progress",
                    )))
                }
                Ok(n) => {
                    done += n;
                    off += n as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ExfError::Io(err)),
            }
        }
        Ok(())
    }
}
