/// Duplicate-array values: for `DBF_DUP_U32_VALS` / `DBF_DUP_U64_VALS`
/// databases the value under a key is a sorted, deduplicated array of
/// fixed-width unsigned integers.
///
/// Stored form: a 4-byte little-endian element count followed by a
/// power-of-two element capacity area holding the elements themselves,
/// little-endian. Growth doubles the capacity; rewrites that stay
/// within capacity update the record in place.
use super::desc::*;
use super::sblk;
use super::utils::*;
use super::Db;

/// Element width in bytes for a dup database.
pub(crate) fn width(flags: u32) -> usize {
    if flags & DBF_DUP_U32_VALS != 0 {
        4
    } else {
        8
    }
}

/// Interpret a put() value as one array element.
pub(crate) fn elem_from_bytes(flags: u32, val: &[u8]) -> Result<u64> {
    let w = width(flags);
    if val.len() != w {
        return Err(KvError::DupValueSize);
    }
    Ok(if w == 4 {
        u64::from(get_u32_le(val, 0))
    } else {
        get_u64_le(val, 0)
    })
}

/// Strip the count header and capacity padding: just the elements.
pub(crate) fn elems_bytes(flags: u32, raw: &[u8]) -> Result<Vec<u8>> {
    let w = width(flags);
    if raw.len() < 4 {
        return Err(KvError::Corrupted("short duplicate array"));
    }
    let count = get_u32_le(raw, 0) as usize;
    let n = count * w;
    if raw.len() < 4 + n {
        return Err(KvError::Corrupted("truncated duplicate array"));
    }
    Ok(raw[4..4 + n].to_vec())
}

fn decode(flags: u32, raw: &[u8]) -> Result<Vec<u64>> {
    let w = width(flags);
    let bytes = elems_bytes(flags, raw)?;
    let mut out = Vec::with_capacity(bytes.len() / w);
    for chunk in bytes.chunks_exact(w) {
        out.push(if w == 4 {
            u64::from(get_u32_le(chunk, 0))
        } else {
            get_u64_le(chunk, 0)
        });
    }
    Ok(out)
}

/// Pack elements with room for `cap_elems` of them.
fn encode(flags: u32, elems: &[u64], cap_elems: usize) -> Vec<u8> {
    let w = width(flags);
    debug_assert!(cap_elems >= elems.len());
    let mut buf = vec![0u8; 4 + cap_elems * w];
    put_u32_le(&mut buf, 0, elems.len() as u32);
    for (i, v) in elems.iter().enumerate() {
        if w == 4 {
            put_u32_le(&mut buf, 4 + i * w, *v as u32);
        } else {
            put_u64_le(&mut buf, 4 + i * w, *v);
        }
    }
    buf
}

fn check_elem(flags: u32, v: u64) -> Result<()> {
    if width(flags) == 4 && v > u64::from(u32::MAX) {
        return Err(KvError::DupValueSize);
    }
    Ok(())
}

impl Db {
    fn check_dup(&self) -> Result<()> {
        if !self.sh.is_dup() {
            return Err(KvError::InvalidState("not a duplicate-array database"));
        }
        Ok(())
    }

    /// Insert `v` into the array under `key`, keeping it sorted and
    /// unique. Creates the record on first use; re-adding an element
    /// is a no-op.
    pub fn dup_add(&self, key: &[u8], v: u64) -> Result<()> {
        self.store.check_writable()?;
        self.check_dup()?;
        check_key(self.sh.flags, key)?;
        check_elem(self.sh.flags, v)?;
        let flags = self.sh.flags;
        let _eg = olock_read(&self.store.engine, self.store.locks());
        let _dg = olock_write(&self.sh.lock, self.store.locks());
        self.sh.touch();
        let raw = match sblk::lookup(&self.store, &self.sh, key) {
            Ok(raw) => Some(raw),
            Err(KvError::NotFound) => None,
            Err(err) => return Err(err),
        };
        match raw {
            None => {
                let buf = encode(flags, &[v], 1);
                check_kv_size(key.len(), buf.len())?;
                sblk::insert(&self.store, &self.sh, key, &buf, 0)
            }
            Some(raw) => {
                let mut elems = decode(flags, &raw)?;
                let ins = match elems.binary_search(&v) {
                    Ok(_) => return Ok(()),
                    Err(ins) => ins,
                };
                elems.insert(ins, v);
                // capacity grows by powers of two; a same-capacity
                // rewrite lands in place inside the KVBLK
                let w = width(flags);
                let old_cap = (raw.len() - 4) / w;
                let cap = if elems.len() <= old_cap {
                    old_cap
                } else {
                    elems.len().next_power_of_two()
                };
                let buf = encode(flags, &elems, cap);
                check_kv_size(key.len(), buf.len())?;
                sblk::insert(&self.store, &self.sh, key, &buf, 0)
            }
        }
    }

    /// Remove `v` from the array under `key`. Removing an absent
    /// element succeeds; an absent key is `NotFound`.
    pub fn dup_remove(&self, key: &[u8], v: u64) -> Result<()> {
        self.store.check_writable()?;
        self.check_dup()?;
        check_key(self.sh.flags, key)?;
        check_elem(self.sh.flags, v)?;
        let flags = self.sh.flags;
        let _eg = olock_read(&self.store.engine, self.store.locks());
        let _dg = olock_write(&self.sh.lock, self.store.locks());
        self.sh.touch();
        let raw = sblk::lookup(&self.store, &self.sh, key)?;
        let mut elems = decode(flags, &raw)?;
        let pos = match elems.binary_search(&v) {
            Ok(pos) => pos,
            Err(_) => return Ok(()),
        };
        elems.remove(pos);
        // shrink keeps the allocated capacity, the rewrite is in place
        let w = width(flags);
        let cap = (raw.len() - 4) / w;
        let buf = encode(flags, &elems, cap);
        sblk::insert(&self.store, &self.sh, key, &buf, 0)
    }

    /// Binary-search membership test.
    pub fn dup_contains(&self, key: &[u8], v: u64) -> Result<bool> {
        self.store.check_open()?;
        self.check_dup()?;
        check_key(self.sh.flags, key)?;
        let _eg = olock_read(&self.store.engine, self.store.locks());
        let _dg = olock_read(&self.sh.lock, self.store.locks());
        self.sh.touch();
        let raw = sblk::lookup(&self.store, &self.sh, key)?;
        let elems = decode(self.sh.flags, &raw)?;
        Ok(elems.binary_search(&v).is_ok())
    }

    /// Number of elements under `key`.
    pub fn dup_num(&self, key: &[u8]) -> Result<u32> {
        self.store.check_open()?;
        self.check_dup()?;
        check_key(self.sh.flags, key)?;
        let _eg = olock_read(&self.store.engine, self.store.locks());
        let _dg = olock_read(&self.sh.lock, self.store.locks());
        self.sh.touch();
        let raw = sblk::lookup(&self.store, &self.sh, key)?;
        if raw.len() < 4 {
            return Err(KvError::Corrupted("short duplicate array"));
        }
        Ok(get_u32_le(&raw, 0))
    }

    /// Visit elements in ascending order, or descending when `down`,
    /// starting from `start` (or the corresponding end). The visitor
    /// returns `false` to stop early.
    pub fn dup_iter<F>(&self, key: &[u8], start: Option<u64>, down: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(u64) -> bool,
    {
        self.store.check_open()?;
        self.check_dup()?;
        check_key(self.sh.flags, key)?;
        let _eg = olock_read(&self.store.engine, self.store.locks());
        let _dg = olock_read(&self.sh.lock, self.store.locks());
        self.sh.touch();
        let raw = sblk::lookup(&self.store, &self.sh, key)?;
        let elems = decode(self.sh.flags, &raw)?;
        if down {
            let from = match start {
                Some(s) => elems.partition_point(|e| *e <= s),
                None => elems.len(),
            };
            for v in elems[..from].iter().rev() {
                if !visit(*v) {
                    break;
                }
            }
        } else {
            let from = match start {
                Some(s) => elems.partition_point(|e| *e < s),
                None => 0,
            };
            for v in &elems[from..] {
                if !visit(*v) {
                    break;
                }
            }
        }
        Ok(())
    }
}
