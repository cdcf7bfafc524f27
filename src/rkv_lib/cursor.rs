/// Cursors: stateful ordered traversal over one database.
///
/// A cursor holds only offsets between calls; every accessor re-reads
/// the node under the database read lock. Structural mutations notify
/// the registered cursors of the database, so a cursor whose node is
/// destroyed degrades to `Invalid` and answers `NotFound` instead of
/// touching freed blocks.
use std::sync::Arc;

use parking_lot::Mutex;

use super::desc::*;
use super::dup;
use super::kvblk::Kvblk;
use super::sblk::{self, Sblk};
use super::utils::*;
use super::{Db, DbShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CPos {
    BeforeFirst,
    AfterLast,
    At,
    Invalid,
}

pub(crate) struct CursorState {
    pub sblk: u64,
    pub pos: usize,
    pub st: CPos,
}

/// Cursor opening position.
pub enum Locate<'a> {
    /// Before the first record; the first `next()` lands on it.
    First,
    /// After the last record; the first `prev()` lands on it.
    Last,
    /// Exactly at the given key, `NotFound` when absent.
    Key(&'a [u8]),
    /// At the smallest key >= the given one, after-last when none.
    KeyOrGreater(&'a [u8]),
}

pub struct Cursor {
    db: Db,
    state: Arc<Mutex<CursorState>>,
}

/// Resolve an opening position into a concrete cursor state. A `Key`
/// miss is an error and leaves any existing state untouched.
fn locate_state(db: &Db, loc: Locate<'_>) -> Result<CursorState> {
    Ok(match loc {
        Locate::First => CursorState {
            sblk: 0,
            pos: 0,
            st: CPos::BeforeFirst,
        },
        Locate::Last => CursorState {
            sblk: 0,
            pos: 0,
            st: CPos::AfterLast,
        },
        Locate::Key(key) => {
            check_key(db.sh.flags, key)?;
            match sblk::eq_position(&db.store, &db.sh, key)? {
                Some((off, pos)) => CursorState {
                    sblk: off,
                    pos,
                    st: CPos::At,
                },
                None => return Err(KvError::NotFound),
            }
        }
        Locate::KeyOrGreater(key) => {
            check_key(db.sh.flags, key)?;
            match sblk::ge_position(&db.store, &db.sh, key)? {
                Some((off, pos)) => CursorState {
                    sblk: off,
                    pos,
                    st: CPos::At,
                },
                None => CursorState {
                    sblk: 0,
                    pos: 0,
                    st: CPos::AfterLast,
                },
            }
        }
    })
}

pub(crate) fn open(db: &Db, loc: Locate<'_>) -> Result<Cursor> {
    db.store.check_open()?;
    let _eg = olock_read(&db.store.engine, db.store.locks());
    let _dg = olock_read(&db.sh.lock, db.store.locks());
    db.sh.touch();
    let st = locate_state(db, loc)?;
    let state = Arc::new(Mutex::new(st));
    let mut reg = db.sh.cursors.lock();
    reg.retain(|w| w.strong_count() > 0);
    reg.push(Arc::downgrade(&state));
    drop(reg);
    Ok(Cursor {
        db: db.clone(),
        state,
    })
}

impl Cursor {
    /// Reposition an already open cursor. Repositioning an invalidated
    /// cursor makes it usable again.
    pub fn to(&self, loc: Locate<'_>) -> Result<()> {
        self.db.store.check_open()?;
        let _eg = olock_read(&self.db.store.engine, self.db.store.locks());
        let _dg = olock_read(&self.db.sh.lock, self.db.store.locks());
        self.db.sh.touch();
        let st = locate_state(&self.db, loc)?;
        *self.state.lock() = st;
        Ok(())
    }

    /// Advance to the next record in ascending key order.
    pub fn next(&self) -> Result<()> {
        self.db.store.check_open()?;
        let _eg = olock_read(&self.db.store.engine, self.db.store.locks());
        let _dg = olock_read(&self.db.sh.lock, self.db.store.locks());
        let mut st = self.state.lock();
        match st.st {
            CPos::Invalid | CPos::AfterLast => Err(KvError::NotFound),
            CPos::BeforeFirst => {
                let first = sblk::first_node(&self.db.store, &self.db.sh)?;
                if first == 0 {
                    st.st = CPos::AfterLast;
                    return Err(KvError::NotFound);
                }
                st.sblk = first;
                st.pos = 0;
                st.st = CPos::At;
                Ok(())
            }
            CPos::At => {
                let node = Sblk::read(&self.db.store, st.sblk)?;
                if st.pos + 1 < node.pnum as usize {
                    st.pos += 1;
                    return Ok(());
                }
                if node.fwd[0] != 0 {
                    st.sblk = node.fwd[0];
                    st.pos = 0;
                    return Ok(());
                }
                st.st = CPos::AfterLast;
                Err(KvError::NotFound)
            }
        }
    }

    /// Step back to the previous record in descending key order.
    pub fn prev(&self) -> Result<()> {
        self.db.store.check_open()?;
        let _eg = olock_read(&self.db.store.engine, self.db.store.locks());
        let _dg = olock_read(&self.db.sh.lock, self.db.store.locks());
        let mut st = self.state.lock();
        match st.st {
            CPos::Invalid | CPos::BeforeFirst => Err(KvError::NotFound),
            CPos::AfterLast => {
                let last = sblk::last_node(&self.db.store, &self.db.sh)?;
                if last == 0 {
                    st.st = CPos::BeforeFirst;
                    return Err(KvError::NotFound);
                }
                let node = Sblk::read(&self.db.store, last)?;
                if node.pnum == 0 {
                    st.st = CPos::BeforeFirst;
                    return Err(KvError::NotFound);
                }
                st.sblk = last;
                st.pos = node.pnum as usize - 1;
                st.st = CPos::At;
                Ok(())
            }
            CPos::At => {
                if st.pos > 0 {
                    st.pos -= 1;
                    return Ok(());
                }
                let node = Sblk::read(&self.db.store, st.sblk)?;
                if node.p0 != 0 {
                    let prev = Sblk::read(&self.db.store, node.p0)?;
                    if prev.pnum == 0 {
                        st.st = CPos::BeforeFirst;
                        return Err(KvError::NotFound);
                    }
                    st.sblk = node.p0;
                    st.pos = prev.pnum as usize - 1;
                    return Ok(());
                }
                st.st = CPos::BeforeFirst;
                Err(KvError::NotFound)
            }
        }
    }

    fn current(&self) -> Result<(Sblk, Kvblk, usize)> {
        self.db.store.check_open()?;
        let st = self.state.lock();
        match st.st {
            CPos::At => {}
            _ => return Err(KvError::NotFound),
        }
        let node = Sblk::read(&self.db.store, st.sblk)?;
        if st.pos >= node.pnum as usize {
            return Err(KvError::NotFound);
        }
        let kv = Kvblk::read(&self.db.store, node.kvblk)?;
        let slot = node.pi[st.pos] as usize;
        Ok((node, kv, slot))
    }

    /// Key bytes at the cursor position, as an owned copy.
    pub fn key(&self) -> Result<Vec<u8>> {
        let _eg = olock_read(&self.db.store.engine, self.db.store.locks());
        let _dg = olock_read(&self.db.sh.lock, self.db.store.locks());
        let (_, kv, slot) = self.current()?;
        kv.read_key(&self.db.store, slot)
    }

    /// Value bytes at the cursor position. For duplicate-array
    /// databases this is the packed element array.
    pub fn val(&self) -> Result<Vec<u8>> {
        let _eg = olock_read(&self.db.store.engine, self.db.store.locks());
        let _dg = olock_read(&self.db.sh.lock, self.db.store.locks());
        let (_, kv, slot) = self.current()?;
        let raw = kv.read_val(&self.db.store, slot)?;
        if self.db.sh.is_dup() {
            dup::elems_bytes(self.db.sh.flags, &raw)
        } else {
            Ok(raw)
        }
    }

    /// Key and value in one call.
    pub fn pair(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let _eg = olock_read(&self.db.store.engine, self.db.store.locks());
        let _dg = olock_read(&self.db.sh.lock, self.db.store.locks());
        let (_, kv, slot) = self.current()?;
        let key = kv.read_key(&self.db.store, slot)?;
        let raw = kv.read_val(&self.db.store, slot)?;
        let val = if self.db.sh.is_dup() {
            dup::elems_bytes(self.db.sh.flags, &raw)?
        } else {
            raw
        };
        Ok((key, val))
    }

    /// Overwrite the value under the cursor key.
    pub fn set(&self, val: &[u8], pflags: u32) -> Result<()> {
        let key = self.key()?;
        self.db.put_with(&key, val, pflags)
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let mut reg = self.db.sh.cursors.lock();
        reg.retain(|w| match w.upgrade() {
            Some(arc) => !Arc::ptr_eq(&arc, &self.state),
            None => false,
        });
    }
}

fn for_each_live(sh: &DbShared, mut f: impl FnMut(&mut CursorState)) {
    let reg = sh.cursors.lock();
    for w in reg.iter() {
        if let Some(arc) = w.upgrade() {
            f(&mut arc.lock());
        }
    }
}

/// Every open cursor of the database turns invalid (database destroy).
pub(crate) fn invalidate_all(sh: &DbShared) {
    for_each_live(sh, |st| st.st = CPos::Invalid);
}

/// The node was unlinked and freed.
pub(crate) fn on_node_removed(sh: &DbShared, off: u64) {
    for_each_live(sh, |st| {
        if st.st == CPos::At && st.sblk == off {
            st.st = CPos::Invalid;
        }
    });
}

/// One entry left the node's sorted permutation at `pos`.
pub(crate) fn on_entry_removed(sh: &DbShared, off: u64, pos: usize) {
    for_each_live(sh, |st| {
        if st.st == CPos::At && st.sblk == off && st.pos > pos {
            st.pos -= 1;
        }
    });
}

/// One entry entered the node's sorted permutation at `pos`.
pub(crate) fn on_entry_inserted(sh: &DbShared, off: u64, pos: usize) {
    for_each_live(sh, |st| {
        if st.st == CPos::At && st.sblk == off && st.pos >= pos {
            st.pos += 1;
        }
    });
}

/// The tail of node `told` starting at `cut` moved to node `snew`.
pub(crate) fn on_node_split(sh: &DbShared, told: u64, snew: u64, cut: usize) {
    for_each_live(sh, |st| {
        if st.st == CPos::At && st.sblk == told && st.pos >= cut {
            st.sblk = snew;
            st.pos -= cut;
        }
    });
}
