/// SBLK: skip-list node blocks and the skip-list engine itself.
///
/// A node is a fixed 512-byte block holding its level, the forward
/// offsets, a level-0 back pointer, the sorted directory permutation
/// `pi` over its KVBLK, and a prefix of its first (minimum) key for
/// fence comparisons during search. The per-database head node is a
/// sentinel with the logically minimal key and no payload.
use std::cmp::Ordering;

use rand::Rng;

use super::alloc;
use super::cursor;
use super::desc::*;
use super::kvblk::Kvblk;
use super::utils::*;
use super::{DbShared, StoreInner};

pub(crate) struct Sblk {
    pub off: u64,
    pub level: u8,
    pub lkl: u8,
    pub pnum: u8,
    pub flags: u8,
    /// Full length of the first key; may exceed the stored prefix.
    pub fkl: u32,
    pub p0: u64,
    pub kvblk: u64,
    pub fwd: [u64; MAX_LEVEL],
    pub pi: [u8; KVBLK_MAX],
    pub lk: [u8; SBLK_LKLEN],
}

impl Sblk {
    pub fn new_head(off: u64) -> Sblk {
        Sblk {
            off,
            level: MAX_LEVEL as u8,
            lkl: 0,
            pnum: 0,
            flags: SBLK_F_HEAD,
            fkl: 0,
            p0: 0,
            kvblk: 0,
            fwd: [0; MAX_LEVEL],
            pi: [0; KVBLK_MAX],
            lk: [0; SBLK_LKLEN],
        }
    }

    pub fn new_node(off: u64, level: u8) -> Sblk {
        Sblk {
            off,
            level,
            lkl: 0,
            pnum: 0,
            flags: 0,
            fkl: 0,
            p0: 0,
            kvblk: 0,
            fwd: [0; MAX_LEVEL],
            pi: [0; KVBLK_MAX],
            lk: [0; SBLK_LKLEN],
        }
    }

    pub fn is_head(&self) -> bool {
        self.flags & SBLK_F_HEAD != 0
    }

    pub fn read(store: &StoreInner, off: u64) -> Result<Sblk> {
        if off == 0 {
            return Err(KvError::Corrupted("null node reference"));
        }
        let mut buf = [0u8; SBLK_SIZE as usize];
        if store.exf.read(off, &mut buf)? != buf.len() {
            return Err(KvError::Corrupted("short node read"));
        }
        let mut node = Sblk::new_node(off, buf[0]);
        node.lkl = buf[1];
        node.pnum = buf[2];
        node.flags = buf[3];
        node.fkl = get_u32_le(&buf, SBLK_FKL_OFF);
        node.p0 = get_u64_le(&buf, SBLK_P0_OFF);
        node.kvblk = get_u64_le(&buf, SBLK_KVBLK_OFF);
        for l in 0..MAX_LEVEL {
            node.fwd[l] = get_u64_le(&buf, SBLK_FWD_OFF + l * 8);
        }
        node.pi.copy_from_slice(&buf[SBLK_PI_OFF..SBLK_PI_OFF + KVBLK_MAX]);
        node.lk.copy_from_slice(&buf[SBLK_LK_OFF..SBLK_LK_OFF + SBLK_LKLEN]);
        if node.level == 0
            || node.level as usize > MAX_LEVEL
            || node.pnum as usize > KVBLK_MAX
            || node.lkl as usize > SBLK_LKLEN
        {
            return Err(KvError::Corrupted("bad node geometry"));
        }
        Ok(node)
    }

    pub fn write(&self, store: &StoreInner) -> Result<()> {
        let mut buf = [0u8; SBLK_SIZE as usize];
        buf[0] = self.level;
        buf[1] = self.lkl;
        buf[2] = self.pnum;
        buf[3] = self.flags;
        put_u32_le(&mut buf, SBLK_FKL_OFF, self.fkl);
        put_u64_le(&mut buf, SBLK_P0_OFF, self.p0);
        put_u64_le(&mut buf, SBLK_KVBLK_OFF, self.kvblk);
        for l in 0..MAX_LEVEL {
            put_u64_le(&mut buf, SBLK_FWD_OFF + l * 8, self.fwd[l]);
        }
        buf[SBLK_PI_OFF..SBLK_PI_OFF + KVBLK_MAX].copy_from_slice(&self.pi);
        buf[SBLK_LK_OFF..SBLK_LK_OFF + SBLK_LKLEN].copy_from_slice(&self.lk);
        store.exf.write(self.off, &buf)?;
        Ok(())
    }

    pub fn set_first_key(&mut self, key: &[u8]) {
        self.fkl = key.len() as u32;
        let n = key.len().min(SBLK_LKLEN);
        self.lkl = n as u8;
        self.lk[..n].copy_from_slice(&key[..n]);
    }
}

/// Ordering of a node's first key relative to `key`. The head sentinel
/// is smaller than everything. Falls back to reading the real first
/// key from the payload block only when the stored prefix ties.
pub(crate) fn node_cmp_key(store: &StoreInner, node: &Sblk, key: &[u8]) -> Result<Ordering> {
    if node.is_head() {
        return Ok(Ordering::Less);
    }
    let lkl = node.lkl as usize;
    let n = lkl.min(key.len());
    match node.lk[..n].cmp(&key[..n]) {
        Ordering::Equal => {}
        ord => return Ok(ord),
    }
    if node.fkl as usize == lkl {
        // the prefix is the whole first key
        return Ok(lkl.cmp(&key.len()));
    }
    if key.len() <= lkl {
        // key is a proper prefix of a longer first key
        return Ok(Ordering::Greater);
    }
    if node.pnum == 0 {
        return Err(KvError::Corrupted("node without entries"));
    }
    let kv = Kvblk::read(store, node.kvblk)?;
    let fk = kv.read_key(store, node.pi[0] as usize)?;
    Ok(fk.as_slice().cmp(key))
}

pub(crate) struct SearchPath {
    /// Last node at each level whose first key compares left of the
    /// search key (head offset when none does).
    pub path: [u64; MAX_LEVEL],
    /// Node whose key range covers the key; 0 when the database is
    /// empty.
    pub target: u64,
}

/// Top-down skip-list search. Non-strict advances over equal fences
/// (predecessors for insertion), strict stops before them
/// (predecessors for unlinking).
pub(crate) fn find_path(
    store: &StoreInner,
    sh: &DbShared,
    key: &[u8],
    strict: bool,
) -> Result<SearchPath> {
    let mut path = [0u64; MAX_LEVEL];
    let mut cur = Sblk::read(store, sh.root)?;
    for lvl in (0..MAX_LEVEL).rev() {
        loop {
            let nxt_off = cur.fwd[lvl];
            if nxt_off == 0 {
                break;
            }
            let nxt = Sblk::read(store, nxt_off)?;
            let ord = node_cmp_key(store, &nxt, key)?;
            let advance = if strict {
                ord == Ordering::Less
            } else {
                ord != Ordering::Greater
            };
            if advance {
                cur = nxt;
            } else {
                break;
            }
        }
        path[lvl] = cur.off;
    }
    let target = if cur.is_head() { cur.fwd[0] } else { cur.off };
    Ok(SearchPath { path, target })
}

/// Binary search for `key` inside a node's sorted permutation.
/// Returns the position and whether it is an exact hit.
pub(crate) fn node_find_pos(
    store: &StoreInner,
    node: &Sblk,
    kv: &Kvblk,
    key: &[u8],
) -> Result<(usize, bool)> {
    let mut lo = 0usize;
    let mut hi = node.pnum as usize;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let mk = kv.read_key(store, node.pi[mid] as usize)?;
        match mk.as_slice().cmp(key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok((mid, true)),
        }
    }
    Ok((lo, false))
}

/// Geometric level draw, p = 1/4, truncated to [1, MAX_LEVEL].
fn draw_level(sh: &DbShared) -> u8 {
    let mut rng = sh.rng.lock();
    let mut level = 1u8;
    while (level as usize) < MAX_LEVEL && rng.gen_range(0..4) == 0 {
        level += 1;
    }
    level
}

pub(crate) fn lookup(store: &StoreInner, sh: &DbShared, key: &[u8]) -> Result<Vec<u8>> {
    let sp = find_path(store, sh, key, false)?;
    if sp.target == 0 {
        return Err(KvError::NotFound);
    }
    let node = Sblk::read(store, sp.target)?;
    if node.pnum == 0 {
        return Err(KvError::NotFound);
    }
    let kv = Kvblk::read(store, node.kvblk)?;
    let (pos, exact) = node_find_pos(store, &node, &kv, key)?;
    if !exact {
        return Err(KvError::NotFound);
    }
    kv.read_val(store, node.pi[pos] as usize)
}

pub(crate) fn insert(
    store: &StoreInner,
    sh: &DbShared,
    key: &[u8],
    val: &[u8],
    pflags: u32,
) -> Result<()> {
    let sp = find_path(store, sh, key, false)?;
    if sp.target == 0 {
        return insert_first(store, sh, key, val);
    }
    let mut node = Sblk::read(store, sp.target)?;
    let mut kv = Kvblk::read(store, node.kvblk)?;
    let (pos, exact) = node_find_pos(store, &node, &kv, key)?;
    if exact {
        if pflags & PF_NO_OVERWRITE != 0 {
            return Err(KvError::KeyExists);
        }
        return set_value(store, &mut node, &mut kv, pos, val);
    }
    let extra = (key.len() + val.len()) as u64;
    if (node.pnum as usize) < KVBLK_MAX && ensure_room(store, &mut node, &mut kv, extra)? {
        return add_entry(store, sh, &mut node, &mut kv, pos, key, val);
    }
    split_insert(store, sh, &sp, node, kv, pos, key, val)
}

/// Overwrite the value at sorted position `pos`, growing the payload
/// block when it runs out of room.
fn set_value(
    store: &StoreInner,
    node: &mut Sblk,
    kv: &mut Kvblk,
    pos: usize,
    val: &[u8],
) -> Result<()> {
    let slot = node.pi[pos] as usize;
    check_kv_size(kv.dir[slot].klen as usize, val.len())?;
    if !kv.try_set_val(store, slot, val)? {
        let need = kv.live() - kv.dir[slot].vlen as u64 + val.len() as u64;
        kv.realloc(store, need)?;
        node.kvblk = kv.off;
        if !kv.try_set_val(store, slot, val)? {
            return Err(KvError::Corrupted("no payload room after growth"));
        }
    }
    kv.write_hdr(store)?;
    node.write(store)?;
    Ok(())
}

/// Make payload room for `extra` bytes: compact first, then move the
/// block to a larger size class. `Ok(false)` means the record cannot
/// fit this node's payload block at any class.
fn ensure_room(
    store: &StoreInner,
    node: &mut Sblk,
    kv: &mut Kvblk,
    extra: u64,
) -> Result<bool> {
    if kv.free_slot().is_none() {
        return Ok(false);
    }
    if kv.fits(extra) {
        return Ok(true);
    }
    if kv.holes > 0 {
        kv.compact(store)?;
        if kv.fits(extra) {
            return Ok(true);
        }
    }
    let need = kv.live() + extra;
    if alloc::class_for(need).is_err() {
        return Ok(false);
    }
    kv.realloc(store, need)?;
    node.kvblk = kv.off;
    Ok(kv.fits(extra))
}

/// Pack one record into a node at sorted position `pos`; payload room
/// must be ensured beforehand.
fn add_entry(
    store: &StoreInner,
    sh: &DbShared,
    node: &mut Sblk,
    kv: &mut Kvblk,
    pos: usize,
    key: &[u8],
    val: &[u8],
) -> Result<()> {
    let slot = kv.add(store, key, val)?;
    let pn = node.pnum as usize;
    for i in (pos..pn).rev() {
        node.pi[i + 1] = node.pi[i];
    }
    node.pi[pos] = slot as u8;
    node.pnum += 1;
    if pos == 0 {
        node.set_first_key(key);
    }
    kv.write_hdr(store)?;
    node.write(store)?;
    cursor::on_entry_inserted(sh, node.off, pos);
    Ok(())
}

/// First record of an empty database: one fresh node linked right
/// after the head at every drawn level.
fn insert_first(store: &StoreInner, sh: &DbShared, key: &[u8], val: &[u8]) -> Result<()> {
    let level = draw_level(sh);
    let need = (key.len() + val.len()) as u64;
    let (kvoff, kpow) = alloc::alloc_kvblk(store, alloc::class_for(need)?)?;
    let mut kv = Kvblk::new_at(kvoff, kpow);
    let slot = kv.add(store, key, val)?;
    let soff = alloc::alloc_sblk(store)?;
    let mut node = Sblk::new_node(soff, level);
    node.kvblk = kvoff;
    node.pi[0] = slot as u8;
    node.pnum = 1;
    node.set_first_key(key);
    kv.write_hdr(store)?;
    node.write(store)?;
    // the head points at the node only after the node is complete
    let mut head = Sblk::read(store, sh.root)?;
    for l in 0..level as usize {
        head.fwd[l] = soff;
    }
    head.write(store)?;
    Ok(())
}

/// Split a full node: carve a new node `s` right after `t`, move the
/// upper entries over, rewire the forward chains, then place the new
/// record on whichever side now owns its key range.
#[allow(clippy::too_many_arguments)]
fn split_insert(
    store: &StoreInner,
    sh: &DbShared,
    sp: &SearchPath,
    mut t: Sblk,
    mut tkv: Kvblk,
    pos: usize,
    key: &[u8],
    val: &[u8],
) -> Result<()> {
    let level = draw_level(sh);
    let soff = alloc::alloc_sblk(store)?;
    let mut s = Sblk::new_node(soff, level);
    let pn = t.pnum as usize;

    // choose the entries that migrate to the new node
    let cut = if pos == pn {
        pn // pure append: the new record alone seeds the new node
    } else if pn == 1 {
        0 // single resident entry moves out, the new key takes over t
    } else {
        (pn / 2).max(1)
    };
    let moved: Vec<u8> = t.pi[cut..pn].to_vec();
    let mut s_first: Vec<u8> = Vec::new();

    if moved.is_empty() {
        let need = (key.len() + val.len()) as u64;
        let (kvoff, kpow) = alloc::alloc_kvblk(store, alloc::class_for(need)?)?;
        let mut skv = Kvblk::new_at(kvoff, kpow);
        let slot = skv.add(store, key, val)?;
        s.kvblk = kvoff;
        s.pi[0] = slot as u8;
        s.pnum = 1;
        s.set_first_key(key);
        skv.write_hdr(store)?;
    } else {
        let mut bytes = 0u64;
        let mut pairs = Vec::with_capacity(moved.len());
        for &slot in &moved {
            let k = tkv.read_key(store, slot as usize)?;
            let v = tkv.read_val(store, slot as usize)?;
            bytes += (k.len() + v.len()) as u64;
            pairs.push((k, v));
        }
        let (kvoff, kpow) = alloc::alloc_kvblk(store, alloc::class_for(bytes)?)?;
        let mut skv = Kvblk::new_at(kvoff, kpow);
        for (i, (k, v)) in pairs.iter().enumerate() {
            let slot = skv.add(store, k, v)?;
            s.pi[i] = slot as u8;
        }
        s.kvblk = kvoff;
        s.pnum = moved.len() as u8;
        s_first = pairs[0].0.clone();
        s.set_first_key(&s_first);
        skv.write_hdr(store)?;
        for &slot in &moved {
            tkv.remove(slot as usize)?;
        }
        t.pnum = cut as u8;
        tkv.compact_if_needed(store)?;
    }

    // wire s after t: shared levels splice through t, higher levels
    // thread through the predecessors captured during the search
    let min_lvl = t.level.min(s.level) as usize;
    for l in 0..min_lvl {
        s.fwd[l] = t.fwd[l];
        t.fwd[l] = soff;
    }
    s.p0 = t.off;
    if s.level > t.level {
        for l in (t.level as usize)..(s.level as usize) {
            let pred = Sblk::read(store, sp.path[l])?;
            s.fwd[l] = pred.fwd[l];
        }
    }
    s.write(store)?;
    if s.level > t.level {
        for l in (t.level as usize)..(s.level as usize) {
            let mut pred = Sblk::read(store, sp.path[l])?;
            pred.fwd[l] = soff;
            pred.write(store)?;
        }
    }
    if s.fwd[0] != 0 {
        let mut succ = Sblk::read(store, s.fwd[0])?;
        succ.p0 = soff;
        succ.write(store)?;
    }
    tkv.write_hdr(store)?;
    t.write(store)?;
    cursor::on_node_split(sh, t.off, soff, cut);

    if moved.is_empty() {
        return Ok(());
    }

    // the record itself lands on the side owning its key range
    let extra = (key.len() + val.len()) as u64;
    if key >= s_first.as_slice() {
        let mut s = Sblk::read(store, soff)?;
        let mut skv = Kvblk::read(store, s.kvblk)?;
        let spos = pos - cut;
        if ensure_room(store, &mut s, &mut skv, extra)? {
            return add_entry(store, sh, &mut s, &mut skv, spos, key, val);
        }
        // room-making may have compacted or moved the payload block;
        // persist that before searching again
        skv.write_hdr(store)?;
        s.write(store)?;
    } else {
        if ensure_room(store, &mut t, &mut tkv, extra)? {
            return add_entry(store, sh, &mut t, &mut tkv, pos, key, val);
        }
        tkv.write_hdr(store)?;
        t.write(store)?;
    }
    // pathological payload pressure: retry from the top, the split
    // halved the node so the recursion terminates
    insert(store, sh, key, val, 0)
}

pub(crate) fn remove(store: &StoreInner, sh: &DbShared, key: &[u8]) -> Result<()> {
    let sp = find_path(store, sh, key, false)?;
    if sp.target == 0 {
        return Err(KvError::NotFound);
    }
    let mut node = Sblk::read(store, sp.target)?;
    if node.pnum == 0 {
        return Err(KvError::NotFound);
    }
    let mut kv = Kvblk::read(store, node.kvblk)?;
    let (pos, exact) = node_find_pos(store, &node, &kv, key)?;
    if !exact {
        return Err(KvError::NotFound);
    }
    if node.pnum == 1 {
        return remove_node(store, sh, node, kv, key);
    }
    let slot = node.pi[pos] as usize;
    kv.remove(slot)?;
    for i in pos..(node.pnum as usize - 1) {
        node.pi[i] = node.pi[i + 1];
    }
    node.pnum -= 1;
    if pos == 0 {
        let fk = kv.read_key(store, node.pi[0] as usize)?;
        node.set_first_key(&fk);
    }
    kv.compact_if_needed(store)?;
    kv.write_hdr(store)?;
    node.write(store)?;
    cursor::on_entry_removed(sh, node.off, pos);
    Ok(())
}

/// Unlink a node that lost its last record and hand its blocks back
/// to the free lists.
fn remove_node(
    store: &StoreInner,
    sh: &DbShared,
    node: Sblk,
    kv: Kvblk,
    key: &[u8],
) -> Result<()> {
    // key is the node's first (and only) key, so a strict search
    // yields the node's predecessor at every linked level
    let sp = find_path(store, sh, key, true)?;
    for l in 0..node.level as usize {
        let mut pred = Sblk::read(store, sp.path[l])?;
        if pred.fwd[l] != node.off {
            return Err(KvError::Corrupted("broken skip chain"));
        }
        pred.fwd[l] = node.fwd[l];
        pred.write(store)?;
    }
    if node.fwd[0] != 0 {
        let mut succ = Sblk::read(store, node.fwd[0])?;
        succ.p0 = node.p0;
        succ.write(store)?;
    }
    alloc::free_kvblk(store, kv.off, kv.szpow)?;
    alloc::free_sblk(store, node.off)?;
    cursor::on_node_removed(sh, node.off);
    Ok(())
}

/// Release every block of a database, the head sentinel included.
pub(crate) fn destroy_db(store: &StoreInner, root: u64) -> Result<()> {
    let head = Sblk::read(store, root)?;
    let mut off = head.fwd[0];
    while off != 0 {
        let node = Sblk::read(store, off)?;
        if node.kvblk != 0 {
            let kv = Kvblk::read(store, node.kvblk)?;
            alloc::free_kvblk(store, kv.off, kv.szpow)?;
        }
        let nxt = node.fwd[0];
        alloc::free_sblk(store, off)?;
        off = nxt;
    }
    alloc::free_sblk(store, root)?;
    Ok(())
}

/// Offset of the first data node, 0 when the database is empty.
pub(crate) fn first_node(store: &StoreInner, sh: &DbShared) -> Result<u64> {
    Ok(Sblk::read(store, sh.root)?.fwd[0])
}

/// Offset of the last data node, found by riding the top levels.
pub(crate) fn last_node(store: &StoreInner, sh: &DbShared) -> Result<u64> {
    let mut cur = Sblk::read(store, sh.root)?;
    for lvl in (0..MAX_LEVEL).rev() {
        loop {
            let nxt = cur.fwd[lvl];
            if nxt == 0 {
                break;
            }
            cur = Sblk::read(store, nxt)?;
        }
    }
    Ok(if cur.is_head() { 0 } else { cur.off })
}

/// Position of `key` itself, `None` when absent.
pub(crate) fn eq_position(
    store: &StoreInner,
    sh: &DbShared,
    key: &[u8],
) -> Result<Option<(u64, usize)>> {
    let sp = find_path(store, sh, key, false)?;
    if sp.target == 0 {
        return Ok(None);
    }
    let node = Sblk::read(store, sp.target)?;
    if node.pnum == 0 {
        return Ok(None);
    }
    let kv = Kvblk::read(store, node.kvblk)?;
    let (pos, exact) = node_find_pos(store, &node, &kv, key)?;
    Ok(if exact { Some((node.off, pos)) } else { None })
}

/// Position of the smallest key >= `key`, `None` when every key is
/// smaller.
pub(crate) fn ge_position(
    store: &StoreInner,
    sh: &DbShared,
    key: &[u8],
) -> Result<Option<(u64, usize)>> {
    let sp = find_path(store, sh, key, false)?;
    if sp.target == 0 {
        return Ok(None);
    }
    let node = Sblk::read(store, sp.target)?;
    if node.pnum == 0 {
        return Ok(None);
    }
    let kv = Kvblk::read(store, node.kvblk)?;
    let (pos, _) = node_find_pos(store, &node, &kv, key)?;
    if pos < node.pnum as usize {
        return Ok(Some((node.off, pos)));
    }
    if node.fwd[0] != 0 {
        return Ok(Some((node.fwd[0], 0)));
    }
    Ok(None)
}
