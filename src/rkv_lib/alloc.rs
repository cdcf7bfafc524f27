/// Free-list block allocator over the store file.
///
/// One intrusive singly linked free list per KVBLK size class plus a
/// dedicated one for SBLKs; list heads live in the store header, a
/// free block stores the next free offset in its first 8 bytes. Fresh
/// blocks are appended at the `dend` high-water mark.
use super::desc::*;
use super::StoreInner;

/// Usable payload bytes of a KVBLK of the given size class.
pub(crate) fn kvblk_cap(szpow: u8) -> u64 {
    (1u64 << szpow) - KVBLK_HDR_SIZE
}

/// Smallest size class able to hold `payload` bytes.
pub(crate) fn class_for(payload: u64) -> Result<u8> {
    for p in KVBLK_SZPOW_MIN..=KVBLK_SZPOW_MAX {
        if kvblk_cap(p) >= payload {
            return Ok(p);
        }
    }
    Err(KvError::MaxKvSize)
}

fn push_free(store: &StoreInner, head_off: u64, head: &mut u64, off: u64) -> Result<()> {
    store.exf.write(off, &head.to_le_bytes())?;
    *head = off;
    store.exf.write(head_off, &off.to_le_bytes())?;
    Ok(())
}

fn pop_free(store: &StoreInner, head_off: u64, head: &mut u64) -> Result<u64> {
    let off = *head;
    let mut nb = [0u8; 8];
    if store.exf.read(off, &mut nb)? != 8 {
        return Err(KvError::Corrupted("short free-list block read"));
    }
    *head = u64::from_le_bytes(nb);
    store.exf.write(head_off, &head.to_le_bytes())?;
    Ok(off)
}

fn append(store: &StoreInner, size: u64) -> Result<u64> {
    let mut meta = store.meta.lock();
    let off = meta.dend;
    store.exf.ensure_size(off + size)?;
    meta.dend = off + size;
    store.exf.write(HDR_DEND_OFF, &meta.dend.to_le_bytes())?;
    Ok(off)
}

/// Allocate a payload block of at least class `szpow`. Prefers the
/// smallest non-empty free list that fits; falls back to appending at
/// the end of the data area. Returns the offset and the actual class.
pub(crate) fn alloc_kvblk(store: &StoreInner, szpow: u8) -> Result<(u64, u8)> {
    {
        let mut meta = store.meta.lock();
        for c in szpow..=KVBLK_SZPOW_MAX {
            let idx = (c - KVBLK_SZPOW_MIN) as usize;
            if meta.free_kv[idx] != 0 {
                let head_off = HDR_FREE_KV_OFF + idx as u64 * 8;
                let mut head = meta.free_kv[idx];
                let off = pop_free(store, head_off, &mut head)?;
                meta.free_kv[idx] = head;
                return Ok((off, c));
            }
        }
    }
    let off = append(store, 1u64 << szpow)?;
    Ok((off, szpow))
}

pub(crate) fn free_kvblk(store: &StoreInner, off: u64, szpow: u8) -> Result<()> {
    if !(KVBLK_SZPOW_MIN..=KVBLK_SZPOW_MAX).contains(&szpow) {
        return Err(KvError::Corrupted("bad payload block class"));
    }
    let idx = (szpow - KVBLK_SZPOW_MIN) as usize;
    let mut meta = store.meta.lock();
    let head_off = HDR_FREE_KV_OFF + idx as u64 * 8;
    let mut head = meta.free_kv[idx];
    push_free(store, head_off, &mut head, off)?;
    meta.free_kv[idx] = head;
    Ok(())
}

pub(crate) fn alloc_sblk(store: &StoreInner) -> Result<u64> {
    {
        let mut meta = store.meta.lock();
        if meta.free_sblk != 0 {
            let mut head = meta.free_sblk;
            let off = pop_free(store, HDR_FREE_SBLK_OFF, &mut head)?;
            meta.free_sblk = head;
            return Ok(off);
        }
    }
    append(store, SBLK_SIZE)
}

pub(crate) fn free_sblk(store: &StoreInner, off: u64) -> Result<()> {
    let mut meta = store.meta.lock();
    let mut head = meta.free_sblk;
    push_free(store, HDR_FREE_SBLK_OFF, &mut head, off)?;
    meta.free_sblk = head;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_selection() {
        assert_eq!(class_for(1).unwrap(), KVBLK_SZPOW_MIN);
        assert_eq!(class_for(kvblk_cap(KVBLK_SZPOW_MIN)).unwrap(), KVBLK_SZPOW_MIN);
        assert_eq!(
            class_for(kvblk_cap(KVBLK_SZPOW_MIN) + 1).unwrap(),
            KVBLK_SZPOW_MIN + 1
        );
        // the largest legal record still has a class
        assert!(class_for(MAX_KVSZ).is_ok());
        assert!(class_for(kvblk_cap(KVBLK_SZPOW_MAX) + 1).is_err());
    }
}
