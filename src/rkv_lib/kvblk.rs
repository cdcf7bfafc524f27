/// KVBLK: variable-size payload block carrying up to `KVBLK_MAX`
/// packed (key, value) records behind a fixed directory.
///
/// A record occupies one directory slot (`off`, `klen`, `vlen`) and a
/// contiguous payload span: key bytes immediately followed by value
/// bytes. Deletion tombstones the slot (`klen = 0`) and leaves a hole;
/// compaction repacks the payload once holes exceed a quarter of the
/// block capacity.
use zerocopy::{AsBytes, FromBytes};

use super::alloc;
use super::desc::*;
use super::StoreInner;

#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct Kvp {
    pub off: u32,
    pub klen: u32,
    pub vlen: u32,
}

pub(crate) struct Kvblk {
    pub off: u64,
    pub szpow: u8,
    pub used: u32,
    pub holes: u32,
    pub dir: [Kvp; KVBLK_MAX],
}

impl Kvblk {
    pub fn new_at(off: u64, szpow: u8) -> Kvblk {
        Kvblk {
            off,
            szpow,
            used: 0,
            holes: 0,
            dir: [Kvp::default(); KVBLK_MAX],
        }
    }

    pub fn read(store: &StoreInner, off: u64) -> Result<Kvblk> {
        if off == 0 {
            return Err(KvError::Corrupted("null payload block reference"));
        }
        let mut buf = [0u8; KVBLK_HDR_SIZE as usize];
        if store.exf.read(off, &mut buf)? != buf.len() {
            return Err(KvError::Corrupted("short payload block header"));
        }
        let hdr =
            KvblkHdr::read_from(&buf[..]).ok_or(KvError::Corrupted("bad payload block header"))?;
        if !(KVBLK_SZPOW_MIN..=KVBLK_SZPOW_MAX).contains(&hdr.szpow) {
            return Err(KvError::Corrupted("bad payload block class"));
        }
        let mut blk = Kvblk::new_at(off, hdr.szpow);
        blk.used = hdr.used.get();
        blk.holes = hdr.holes.get();
        if blk.used as u64 > blk.cap() || blk.holes > blk.used {
            return Err(KvError::Corrupted("bad payload block geometry"));
        }
        for (i, e) in hdr.dir.iter().enumerate() {
            blk.dir[i] = Kvp {
                off: e.off.get(),
                klen: e.klen.get(),
                vlen: e.vlen.get(),
            };
        }
        Ok(blk)
    }

    pub fn write_hdr(&self, store: &StoreInner) -> Result<()> {
        let mut dir = [KvpDisk::default(); KVBLK_MAX];
        for (i, e) in self.dir.iter().enumerate() {
            dir[i] = KvpDisk {
                off: Le32::new(e.off),
                klen: Le32::new(e.klen),
                vlen: Le32::new(e.vlen),
            };
        }
        let hdr = KvblkHdr {
            szpow: self.szpow,
            flags: 0,
            pad0: [0; 2],
            used: Le32::new(self.used),
            holes: Le32::new(self.holes),
            pad1: [0; 4],
            dir,
        };
        store.exf.write(self.off, hdr.as_bytes())?;
        Ok(())
    }

    pub fn cap(&self) -> u64 {
        alloc::kvblk_cap(self.szpow)
    }

    pub fn data_off(&self) -> u64 {
        self.off + KVBLK_HDR_SIZE
    }

    /// Live payload bytes, holes excluded.
    pub fn live(&self) -> u64 {
        (self.used - self.holes) as u64
    }

    pub fn fits(&self, extra: u64) -> bool {
        self.used as u64 + extra <= self.cap()
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.dir.iter().position(|e| e.klen == 0)
    }

    pub fn read_key(&self, store: &StoreInner, slot: usize) -> Result<Vec<u8>> {
        let e = self.dir[slot];
        if e.klen == 0 {
            return Err(KvError::Corrupted("dead payload slot dereferenced"));
        }
        let mut buf = vec![0u8; e.klen as usize];
        if store.exf.read(self.data_off() + e.off as u64, &mut buf)? != buf.len() {
            return Err(KvError::Corrupted("short key read"));
        }
        Ok(buf)
    }

    pub fn read_val(&self, store: &StoreInner, slot: usize) -> Result<Vec<u8>> {
        let e = self.dir[slot];
        if e.klen == 0 {
            return Err(KvError::Corrupted("dead payload slot dereferenced"));
        }
        if e.vlen == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; e.vlen as usize];
        let off = self.data_off() + e.off as u64 + e.klen as u64;
        if store.exf.read(off, &mut buf)? != buf.len() {
            return Err(KvError::Corrupted("short value read"));
        }
        Ok(buf)
    }

    /// Pack a new record. The caller guarantees directory and payload
    /// room (`free_slot` and `fits`).
    pub fn add(&mut self, store: &StoreInner, key: &[u8], val: &[u8]) -> Result<usize> {
        let slot = self
            .free_slot()
            .ok_or(KvError::InvalidState("payload directory exhausted"))?;
        let extra = (key.len() + val.len()) as u64;
        debug_assert!(self.fits(extra));
        let woff = self.data_off() + self.used as u64;
        store.exf.write(woff, key)?;
        if !val.is_empty() {
            store.exf.write(woff + key.len() as u64, val)?;
        }
        self.dir[slot] = Kvp {
            off: self.used,
            klen: key.len() as u32,
            vlen: val.len() as u32,
        };
        self.used += extra as u32;
        Ok(slot)
    }

    /// Tombstone a record; payload bytes stay behind as a hole.
    pub fn remove(&mut self, slot: usize) -> Result<()> {
        let e = self.dir[slot];
        if e.klen == 0 {
            return Err(KvError::Corrupted("double remove of payload slot"));
        }
        self.holes += e.klen + e.vlen;
        self.dir[slot] = Kvp::default();
        Ok(())
    }

    /// Replace the value of a live record. In place when the new value
    /// fits the old span, otherwise the record is repacked at the end
    /// of the payload. `Ok(false)` means the block has no room left.
    pub fn try_set_val(&mut self, store: &StoreInner, slot: usize, val: &[u8]) -> Result<bool> {
        let e = self.dir[slot];
        if e.klen == 0 {
            return Err(KvError::Corrupted("dead payload slot dereferenced"));
        }
        if val.len() as u32 <= e.vlen {
            let off = self.data_off() + e.off as u64 + e.klen as u64;
            if !val.is_empty() {
                store.exf.write(off, val)?;
            }
            self.holes += e.vlen - val.len() as u32;
            self.dir[slot].vlen = val.len() as u32;
            return Ok(true);
        }
        let extra = e.klen as u64 + val.len() as u64;
        if !self.fits(extra) && self.holes > 0 {
            self.compact(store)?;
        }
        if !self.fits(extra) {
            return Ok(false);
        }
        let key = self.read_key(store, slot)?;
        let e = self.dir[slot];
        let woff = self.data_off() + self.used as u64;
        store.exf.write(woff, &key)?;
        store.exf.write(woff + key.len() as u64, val)?;
        self.holes += e.klen + e.vlen;
        self.dir[slot] = Kvp {
            off: self.used,
            klen: key.len() as u32,
            vlen: val.len() as u32,
        };
        self.used += extra as u32;
        Ok(true)
    }

    /// Repack the payload, squeezing out every hole. Directory slot
    /// indices are stable; only payload offsets change.
    pub fn compact(&mut self, store: &StoreInner) -> Result<()> {
        if self.holes == 0 {
            return Ok(());
        }
        let mut order: Vec<usize> = (0..KVBLK_MAX).filter(|&i| self.dir[i].klen != 0).collect();
        order.sort_by_key(|&i| self.dir[i].off);
        let mut buf = Vec::with_capacity(self.live() as usize);
        let mut ndir = self.dir;
        for &i in &order {
            let e = self.dir[i];
            let mut chunk = vec![0u8; (e.klen + e.vlen) as usize];
            if store.exf.read(self.data_off() + e.off as u64, &mut chunk)? != chunk.len() {
                return Err(KvError::Corrupted("short payload read"));
            }
            ndir[i].off = buf.len() as u32;
            buf.extend_from_slice(&chunk);
        }
        if !buf.is_empty() {
            store.exf.write(self.data_off(), &buf)?;
        }
        self.dir = ndir;
        self.used = buf.len() as u32;
        self.holes = 0;
        Ok(())
    }

    pub fn compact_if_needed(&mut self, store: &StoreInner) -> Result<()> {
        if self.holes as u64 > self.cap() / 4 {
            self.compact(store)?;
        }
        Ok(())
    }

    /// Move the block to a class that holds at least `need_payload`
    /// live bytes, compacting on the way. The old block goes back to
    /// its free list.
    pub fn realloc(&mut self, store: &StoreInner, need_payload: u64) -> Result<()> {
        let (noff, npow) = alloc::alloc_kvblk(store, alloc::class_for(need_payload)?)?;
        let mut order: Vec<usize> = (0..KVBLK_MAX).filter(|&i| self.dir[i].klen != 0).collect();
        order.sort_by_key(|&i| self.dir[i].off);
        let mut buf = Vec::with_capacity(self.live() as usize);
        let mut ndir = self.dir;
        for &i in &order {
            let e = self.dir[i];
            let mut chunk = vec![0u8; (e.klen + e.vlen) as usize];
            if store.exf.read(self.data_off() + e.off as u64, &mut chunk)? != chunk.len() {
                return Err(KvError::Corrupted("short payload read"));
            }
            ndir[i].off = buf.len() as u32;
            buf.extend_from_slice(&chunk);
        }
        if !buf.is_empty() {
            store.exf.write(noff + KVBLK_HDR_SIZE, &buf)?;
        }
        let (old_off, old_pow) = (self.off, self.szpow);
        self.off = noff;
        self.szpow = npow;
        self.dir = ndir;
        self.used = buf.len() as u32;
        self.holes = 0;
        self.write_hdr(store)?;
        alloc::free_kvblk(store, old_off, old_pow)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OpenOpts, Store};
    use tempfile::TempDir;

    fn tmp_store(dir: &TempDir) -> Store {
        Store::open(dir.path().join("kvblk.db"), OpenOpts::default()).unwrap()
    }

    #[test]
    fn pack_remove_compact_round_trip() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = tmp_store(&dir);
        let inner = &store.inner;
        let (off, pow) = alloc::alloc_kvblk(inner, KVBLK_SZPOW_MIN)?;
        let mut blk = Kvblk::new_at(off, pow);
        let s1 = blk.add(inner, b"alpha", b"1111")?;
        let s2 = blk.add(inner, b"beta", b"22")?;
        let s3 = blk.add(inner, b"gamma", b"333333")?;
        blk.write_hdr(inner)?;

        let back = Kvblk::read(inner, off)?;
        assert_eq!(back.read_key(inner, s2)?, b"beta");
        assert_eq!(back.read_val(inner, s3)?, b"333333");

        blk.remove(s1)?;
        assert_eq!(blk.holes, 9);
        blk.compact(inner)?;
        assert_eq!(blk.holes, 0);
        assert_eq!(blk.read_key(inner, s2)?, b"beta");
        assert_eq!(blk.read_val(inner, s2)?, b"22");
        assert_eq!(blk.read_val(inner, s3)?, b"333333");
        Ok(())
    }

    #[test]
    fn value_update_in_place_and_repacked() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = tmp_store(&dir);
        let inner = &store.inner;
        let (off, pow) = alloc::alloc_kvblk(inner, KVBLK_SZPOW_MIN)?;
        let mut blk = Kvblk::new_at(off, pow);
        let slot = blk.add(inner, b"k", b"longvalue")?;
        // shrink rewrites in place
        assert!(blk.try_set_val(inner, slot, b"tiny")?);
        assert_eq!(blk.read_val(inner, slot)?, b"tiny");
        assert_eq!(blk.holes, 5);
        // growth repacks at the tail
        assert!(blk.try_set_val(inner, slot, b"a-much-longer-value")?);
        assert_eq!(blk.read_val(inner, slot)?, b"a-much-longer-value");
        Ok(())
    }

    #[test]
    fn realloc_moves_to_bigger_class() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = tmp_store(&dir);
        let inner = &store.inner;
        let (off, pow) = alloc::alloc_kvblk(inner, KVBLK_SZPOW_MIN)?;
        let mut blk = Kvblk::new_at(off, pow);
        let slot = blk.add(inner, b"key", b"val")?;
        blk.write_hdr(inner)?;
        let big = alloc::kvblk_cap(KVBLK_SZPOW_MIN) + 100;
        blk.realloc(inner, big)?;
        assert!(blk.szpow > KVBLK_SZPOW_MIN);
        assert_ne!(blk.off, off);
        assert_eq!(blk.read_key(inner, slot)?, b"key");
        assert_eq!(blk.read_val(inner, slot)?, b"val");
        // the old block is reusable from its free list
        let (off2, pow2) = alloc::alloc_kvblk(inner, KVBLK_SZPOW_MIN)?;
        assert_eq!((off2, pow2), (off, pow));
        Ok(())
    }
}
