/// Store and database logics: header bootstrap, database registry,
/// record entry points. The skip-list engine itself lives in `sblk`,
/// payload blocks in `kvblk`, block allocation in `alloc`.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use extfile::{ExfState, ExtFile, Opts as ExfOpts, ResizePolicy};
use log::*;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use zerocopy::{AsBytes, FromBytes};

pub mod desc;
pub mod utils;

mod alloc;
pub mod cursor;
mod dup;
mod kvblk;
mod sblk;

pub use cursor::{Cursor, Locate};
pub use desc::*;
pub use extfile;

use crate::OPEN_PATHS;
use utils::*;

/// Options for `Store::open`.
pub struct OpenOpts {
    /// `OF_NOLOCKS` | `OF_RDONLY` | `OF_TRUNC`
    pub oflags: u32,
    /// Seed for the per-database level RNG, time-seeded when absent.
    pub random_seed: Option<u64>,
    /// Grow a fresh file to at least this many bytes up front.
    pub initial_size: u64,
    /// Custom file size cap, 0 selects the 255 GiB default.
    pub maxoff: u64,
    pub policy: Option<Box<dyn ResizePolicy>>,
}

impl Default for OpenOpts {
    fn default() -> Self {
        Self {
            oflags: 0,
            random_seed: None,
            initial_size: 0,
            maxoff: 0,
            policy: None,
        }
    }
}

/// First data block offset for a store created with page size `psize`.
pub(crate) fn data_start(psize: u32) -> u64 {
    (psize as u64).max(4096)
}

pub(crate) struct Meta {
    pub(crate) maxdbid: u32,
    pub(crate) dend: u64,
    pub(crate) free_kv: [u64; KVBLK_CLASSES],
    pub(crate) free_sblk: u64,
    pub(crate) dbs: HashMap<u32, Arc<DbShared>>,
}

pub(crate) struct DbShared {
    pub(crate) id: u32,
    pub(crate) flags: u32,
    /// Registry slot index inside the header.
    pub(crate) slot: usize,
    /// Head (sentinel) SBLK offset, fixed for the database lifetime.
    pub(crate) root: u64,
    pub(crate) atime: AtomicU64,
    pub(crate) rng: Mutex<StdRng>,
    pub(crate) lock: RwLock<()>,
    pub(crate) cursors: Mutex<Vec<Weak<Mutex<cursor::CursorState>>>>,
}

impl DbShared {
    pub(crate) fn touch(&self) {
        self.atime.store(now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn is_dup(&self) -> bool {
        self.flags & (DBF_DUP_U32_VALS | DBF_DUP_U64_VALS) != 0
    }
}

pub(crate) struct StoreInner {
    pub(crate) exf: ExtFile,
    pub(crate) path: PathBuf,
    /// Page size recorded at store creation.
    pub(crate) psize: u32,
    pub(crate) oflags: u32,
    pub(crate) seed0: Option<u64>,
    pub(crate) engine: RwLock<()>,
    pub(crate) meta: Mutex<Meta>,
    pub(crate) closed: AtomicBool,
}

impl StoreInner {
    pub(crate) fn locks(&self) -> bool {
        self.oflags & OF_NOLOCKS == 0
    }

    pub(crate) fn rdonly(&self) -> bool {
        self.oflags & OF_RDONLY != 0
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KvError::InvalidState("store is closed"));
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.rdonly() {
            return Err(KvError::Readonly);
        }
        Ok(())
    }

    pub(crate) fn read_reg_slot(&self, idx: usize) -> Result<RegSlot> {
        let mut buf = [0u8; REG_SLOT_SIZE as usize];
        let off = HDR_REG_OFF + idx as u64 * REG_SLOT_SIZE;
        if self.exf.read(off, &mut buf)? != buf.len() {
            return Err(KvError::Corrupted("short registry read"));
        }
        RegSlot::read_from(&buf[..]).ok_or(KvError::Corrupted("bad registry slot"))
    }

    pub(crate) fn write_reg_slot(&self, idx: usize, slot: &RegSlot) -> Result<()> {
        let off = HDR_REG_OFF + idx as u64 * REG_SLOT_SIZE;
        self.exf.write(off, slot.as_bytes())?;
        Ok(())
    }
}

pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

/// One database handle. Cheap to clone; all clones share the same
/// registry entry and lock.
#[derive(Clone)]
pub struct Db {
    pub(crate) store: Arc<StoreInner>,
    pub(crate) sh: Arc<DbShared>,
}

fn abs_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

impl Store {
    /// Open or create the store file. A path may be held by at most
    /// one `Store` in the process at a time.
    pub fn open<P: AsRef<Path>>(path: P, opts: OpenOpts) -> Result<Store> {
        init_logs();
        let path = abs_path(path.as_ref())?;
        {
            let mut open = OPEN_PATHS.lock();
            if !open.insert(path.clone()) {
                return Err(KvError::InvalidState("store file is already open"));
            }
        }
        match Self::open_inner(&path, opts) {
            Ok(store) => Ok(store),
            Err(err) => {
                OPEN_PATHS.lock().remove(&path);
                Err(err)
            }
        }
    }

    fn open_inner(path: &Path, opts: OpenOpts) -> Result<Store> {
        let rdonly = opts.oflags & OF_RDONLY != 0;
        let exf = ExtFile::open(
            path,
            ExfOpts {
                rdonly,
                trunc: opts.oflags & OF_TRUNC != 0,
                initial_size: opts.initial_size.max(extfile::sys_page_size()),
                maxoff: opts.maxoff,
                policy: opts.policy,
            },
        )?;
        // one window over the whole file; grows with it
        exf.add_mmap(0, u64::MAX)?;

        let mut hbuf = [0u8; 0x20];
        let n = exf.read(0, &mut hbuf)?;
        let psize;
        let hdr;
        if n == hbuf.len() && hbuf[..8] != [0u8; 8] {
            let h = StoreHdr::read_from(&hbuf[..]).ok_or(KvError::Corrupted("bad header"))?;
            if h.magic != RKV_MAGIC {
                return Err(KvError::Corrupted("magic mismatch"));
            }
            if h.version != RKV_VERSION {
                return Err(KvError::Corrupted("unsupported version"));
            }
            psize = h.psize.get();
            if psize == 0 || h.dend.get() < data_start(psize) {
                return Err(KvError::Corrupted("bad header geometry"));
            }
            hdr = h;
        } else {
            // fresh (all-zero) file
            if rdonly {
                return Err(KvError::Corrupted("empty store opened read-only"));
            }
            psize = extfile::sys_page_size() as u32;
            let dstart = data_start(psize);
            exf.ensure_size(dstart)?;
            let h = StoreHdr {
                magic: RKV_MAGIC,
                version: RKV_VERSION,
                pad0: [0; 3],
                psize: Le32::new(psize),
                maxdbid: Le32::new(0),
                pad1: [0; 4],
                dend: Le64::new(dstart),
            };
            exf.write(0, h.as_bytes())?;
            info!("created store {:?}, page size {}", path, psize);
            hdr = h;
        }

        let mut free_kv = [0u64; KVBLK_CLASSES];
        let mut fbuf = [0u8; KVBLK_CLASSES * 8];
        if exf.read(HDR_FREE_KV_OFF, &mut fbuf)? != fbuf.len() {
            return Err(KvError::Corrupted("short free-list read"));
        }
        for (i, head) in free_kv.iter_mut().enumerate() {
            *head = get_u64_le(&fbuf, i * 8);
        }
        let mut sbuf = [0u8; 8];
        if exf.read(HDR_FREE_SBLK_OFF, &mut sbuf)? != 8 {
            return Err(KvError::Corrupted("short free-list read"));
        }
        let free_sblk = u64::from_le_bytes(sbuf);

        Ok(Store {
            inner: Arc::new(StoreInner {
                exf,
                path: path.to_path_buf(),
                psize,
                oflags: opts.oflags,
                seed0: opts.random_seed,
                engine: RwLock::new(()),
                meta: Mutex::new(Meta {
                    maxdbid: hdr.maxdbid.get(),
                    dend: hdr.dend.get(),
                    free_kv,
                    free_sblk,
                    dbs: HashMap::new(),
                }),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Page size the store was created with; the on-disk block layout
    /// is derived from it, not from the current system page size.
    pub fn page_size(&self) -> u32 {
        self.inner.psize
    }

    /// File-level state (size, page size, mapped windows).
    pub fn state(&self) -> ExfState {
        self.inner.exf.state()
    }

    /// Flush all completed writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.inner.check_open()?;
        if self.inner.rdonly() {
            return Ok(());
        }
        let _eg = olock_read(&self.inner.engine, self.inner.locks());
        self.flush_atimes()?;
        self.inner.exf.sync()?;
        Ok(())
    }

    fn flush_atimes(&self) -> Result<()> {
        let dbs: Vec<Arc<DbShared>> = self.inner.meta.lock().dbs.values().cloned().collect();
        for sh in dbs {
            let mut slot = self.inner.read_reg_slot(sh.slot)?;
            if slot.dbid.get() != sh.id {
                continue; // destroyed meanwhile
            }
            slot.atime = Le64::new(sh.atime.load(Ordering::Relaxed));
            self.inner.write_reg_slot(sh.slot, &slot)?;
        }
        Ok(())
    }

    /// Close the store. Idempotent; all dependent handles turn dead.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _eg = olock_write(&self.inner.engine, self.inner.locks());
        if !self.inner.rdonly() {
            self.flush_atimes()?;
        }
        self.inner.exf.close()?;
        OPEN_PATHS.lock().remove(&self.inner.path);
        debug!("store closed: {:?}", self.inner.path);
        Ok(())
    }

    /// Get or create the database `dbid`. Passing a flag set different
    /// from the one the database was created with is an error.
    pub fn db(&self, dbid: u32, flags: u32) -> Result<Db> {
        if dbid == 0 {
            return Err(KvError::InvalidState("database id must be non-zero"));
        }
        check_db_flags(flags)?;
        self.inner.check_open()?;
        let _eg = olock_write(&self.inner.engine, self.inner.locks());

        if let Some(sh) = self.inner.meta.lock().dbs.get(&dbid).cloned() {
            if sh.flags != flags {
                return Err(KvError::IncompatibleDbMode);
            }
            return Ok(Db {
                store: self.inner.clone(),
                sh,
            });
        }

        let mut empty = None;
        for idx in 0..REG_SLOTS {
            let slot = self.inner.read_reg_slot(idx)?;
            let id = slot.dbid.get();
            if id == dbid {
                if slot.flags.get() != flags {
                    return Err(KvError::IncompatibleDbMode);
                }
                let sh = Arc::new(DbShared {
                    id: dbid,
                    flags,
                    slot: idx,
                    root: slot.root.get(),
                    atime: AtomicU64::new(slot.atime.get()),
                    rng: Mutex::new(StdRng::seed_from_u64(slot.seed.get())),
                    lock: RwLock::new(()),
                    cursors: Mutex::new(Vec::new()),
                });
                self.inner.meta.lock().dbs.insert(dbid, sh.clone());
                return Ok(Db {
                    store: self.inner.clone(),
                    sh,
                });
            }
            if id == 0 && empty.is_none() {
                empty = Some(idx);
            }
        }

        // not present: create
        self.inner.check_writable()?;
        let idx = empty.ok_or(KvError::InvalidState("database registry is full"))?;
        let seed = self
            .inner
            .seed0
            .map(|s| s ^ u64::from(dbid).wrapping_mul(0x9e37_79b9_7f4a_7c15))
            .unwrap_or_else(rand::random);
        let root = alloc::alloc_sblk(&self.inner)?;
        sblk::Sblk::new_head(root).write(&self.inner)?;
        let atime = now_ms();
        let slot = RegSlot {
            dbid: Le32::new(dbid),
            flags: Le32::new(flags),
            root: Le64::new(root),
            seed: Le64::new(seed),
            atime: Le64::new(atime),
        };
        self.inner.write_reg_slot(idx, &slot)?;
        {
            let mut meta = self.inner.meta.lock();
            if dbid > meta.maxdbid {
                meta.maxdbid = dbid;
                self.inner
                    .exf
                    .write(HDR_MAXDBID_OFF, &dbid.to_le_bytes())?;
            }
        }
        info!("created database {} flags {:#x}", dbid, flags);
        let sh = Arc::new(DbShared {
            id: dbid,
            flags,
            slot: idx,
            root,
            atime: AtomicU64::new(atime),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            lock: RwLock::new(()),
            cursors: Mutex::new(Vec::new()),
        });
        self.inner.meta.lock().dbs.insert(dbid, sh.clone());
        Ok(Db {
            store: self.inner.clone(),
            sh,
        })
    }

    /// Destroy a database: release every block it owns to the free
    /// lists and clear its registry slot.
    pub fn db_destroy(&self, dbid: u32) -> Result<()> {
        self.inner.check_writable()?;
        let _eg = olock_write(&self.inner.engine, self.inner.locks());
        let cached = self.inner.meta.lock().dbs.get(&dbid).cloned();
        let (sh, idx) = match cached {
            Some(sh) => {
                let idx = sh.slot;
                (Some(sh), idx)
            }
            None => {
                let mut found = None;
                for idx in 0..REG_SLOTS {
                    if self.inner.read_reg_slot(idx)?.dbid.get() == dbid {
                        found = Some(idx);
                        break;
                    }
                }
                match found {
                    Some(idx) => (None, idx),
                    None => return Err(KvError::NotFound),
                }
            }
        };
        let slot = self.inner.read_reg_slot(idx)?;
        if slot.dbid.get() != dbid {
            return Err(KvError::NotFound);
        }
        if let Some(sh) = &sh {
            let _dg = olock_write(&sh.lock, self.inner.locks());
            cursor::invalidate_all(sh);
            sblk::destroy_db(&self.inner, slot.root.get())?;
        } else {
            sblk::destroy_db(&self.inner, slot.root.get())?;
        }
        self.inner.write_reg_slot(idx, &RegSlot::default())?;
        self.inner.meta.lock().dbs.remove(&dbid);
        info!("destroyed database {}", dbid);
        Ok(())
    }

    /// Drop the cached in-memory handle for `dbid`. The on-disk
    /// database is untouched; the next `db()` call reloads it.
    pub fn db_cache_release(&self, dbid: u32) -> Result<()> {
        self.inner.check_open()?;
        self.inner.meta.lock().dbs.remove(&dbid);
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("store close on drop failed: {}", err);
        }
    }
}

impl Db {
    pub fn id(&self) -> u32 {
        self.sh.id
    }

    pub fn flags(&self) -> u32 {
        self.sh.flags
    }

    /// Last access time of this database, ms since the Unix epoch.
    pub fn last_access_ms(&self) -> u64 {
        self.sh.atime.load(Ordering::Relaxed)
    }

    pub fn put(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.put_with(key, val, 0)
    }

    pub fn put_with(&self, key: &[u8], val: &[u8], pflags: u32) -> Result<()> {
        self.store.check_writable()?;
        check_key(self.sh.flags, key)?;
        if self.sh.is_dup() {
            // in duplicate-array mode a put carries one element
            let v = dup::elem_from_bytes(self.sh.flags, val)?;
            if pflags & PF_DUP_REMOVE != 0 {
                self.dup_remove(key, v)?;
            } else {
                self.dup_add(key, v)?;
            }
        } else {
            check_kv_size(key.len(), val.len())?;
            let _eg = olock_read(&self.store.engine, self.store.locks());
            let _dg = olock_write(&self.sh.lock, self.store.locks());
            self.sh.touch();
            sblk::insert(&self.store, &self.sh, key, val, pflags)?;
        }
        if pflags & PF_SYNC != 0 {
            self.store.exf.sync().map_err(KvError::Exf)?;
        }
        Ok(())
    }

    /// Fetch the value stored under `key` as an owned buffer. For
    /// duplicate-array databases this is the packed little-endian
    /// element array.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.store.check_open()?;
        check_key(self.sh.flags, key)?;
        let _eg = olock_read(&self.store.engine, self.store.locks());
        let _dg = olock_read(&self.sh.lock, self.store.locks());
        self.sh.touch();
        let raw = sblk::lookup(&self.store, &self.sh, key)?;
        if self.sh.is_dup() {
            dup::elems_bytes(self.sh.flags, &raw)
        } else {
            Ok(raw)
        }
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.store.check_writable()?;
        check_key(self.sh.flags, key)?;
        let _eg = olock_read(&self.store.engine, self.store.locks());
        let _dg = olock_write(&self.sh.lock, self.store.locks());
        self.sh.touch();
        sblk::remove(&self.store, &self.sh, key)
    }

    /// Open a cursor. `Locate::Key` fails with `NotFound` when the key
    /// is absent; `Locate::KeyOrGreater` opens at the end instead.
    pub fn cursor(&self, loc: Locate<'_>) -> Result<Cursor> {
        cursor::open(self, loc)
    }
}
