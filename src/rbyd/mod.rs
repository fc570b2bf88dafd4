//! Rbyd: a 2-3-4 tree of alts encoded as an append-only log in one erase block
//!
//! ## 布局
//! ```text
//! [rev: le32][pad to prog_size][commit][commit]...[erased]
//! commit = record* [ecksum] cksum
//! ```
//!
//! Every record is `tag | weight | size | payload`. Alts (inner nodes) store a
//! backward jump in place of a payload. A commit becomes visible once its
//! checksum record lands; until then the previous commit stays current.

pub mod codec;
pub mod tag;
pub(crate) mod tree;

use crate::storage::cache::Bd;
use crate::storage::checksum::Checksum;
use crate::{FsError, Result};
use codec::{encode_header, header_len, leb128_len, Ecksum};
use tag::{Rid, Tag};
use tree::{Disk, Key, Leaf, Span, Sub};

/// Space kept free at the end of a block for the commit trailer
const TAIL_RESERVE: u32 = 32;

/// Bytes of erased state covered by an erase-state checksum
const ECKSUM_MIN: u32 = 16;

/// Record payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    Buf(Vec<u8>),
    /// Bytes already on disk
    Disk { block: u32, off: u32, size: u32 },
    Cat(Vec<Data>),
}

impl Data {
    pub fn empty() -> Self {
        Data::Buf(Vec::new())
    }

    pub fn len(&self) -> u32 {
        match self {
            Data::Buf(b) => b.len() as u32,
            Data::Disk { size, .. } => *size,
            Data::Cat(parts) => parts.iter().map(Data::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append_to(&self, bd: &mut Bd, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Data::Buf(b) => out.extend_from_slice(b),
            Data::Disk { block, off, size } => {
                let start = out.len();
                out.resize(start + *size as usize, 0);
                bd.read(*block, *off, &mut out[start..])?;
            }
            Data::Cat(parts) => {
                for part in parts {
                    part.append_to(bd, out)?;
                }
            }
        }
        Ok(())
    }

    pub fn to_vec(&self, bd: &mut Bd) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len() as usize);
        self.append_to(bd, &mut out)?;
        Ok(out)
    }

    /// Sub-range of the payload without materializing it
    pub fn slice(&self, off: u32, len: u32) -> Data {
        match self {
            Data::Buf(b) => {
                let start = (off as usize).min(b.len());
                let end = (start + len as usize).min(b.len());
                Data::Buf(b[start..end].to_vec())
            }
            Data::Disk { block, off: o, size } => {
                let start = off.min(*size);
                Data::Disk {
                    block: *block,
                    off: o + start,
                    size: len.min(size - start),
                }
            }
            Data::Cat(parts) => {
                let mut out = Vec::new();
                let mut pos = 0;
                let end = off + len;
                for part in parts {
                    let plen = part.len();
                    let lo = off.max(pos);
                    let hi = end.min(pos + plen);
                    if lo < hi {
                        out.push(part.slice(lo - pos, hi - lo));
                    }
                    pos += plen;
                }
                Data::Cat(out)
            }
        }
    }
}

impl From<Vec<u8>> for Data {
    fn from(buf: Vec<u8>) -> Self {
        Data::Buf(buf)
    }
}

impl From<&[u8]> for Data {
    fn from(buf: &[u8]) -> Self {
        Data::Buf(buf.to_vec())
    }
}

pub const RATTR_RM: u8 = 0x1;
pub const RATTR_GROW: u8 = 0x2;

/// A change to apply to a tree at some rid
///
/// - weight > 0: insert a new record of that width before the record at rid
/// - weight == 0: set (or create) the record (rid, tag)
/// - `GROW`: adjust the weight of (rid, tag) by `weight` and replace its payload
/// - `RM` with weight == 0: remove (rid, tag)
/// - `RM` with weight < 0: remove every record whose rid falls in (rid+weight, rid]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rattr {
    pub tag: Tag,
    pub weight: i32,
    pub flags: u8,
    pub data: Data,
}

impl Rattr {
    pub fn new(tag: Tag, weight: i32, data: Data) -> Self {
        Self {
            tag,
            weight,
            flags: 0,
            data,
        }
    }

    pub fn buf(tag: Tag, weight: i32, buf: impl Into<Vec<u8>>) -> Self {
        Self::new(tag, weight, Data::Buf(buf.into()))
    }

    pub fn rm(tag: Tag) -> Self {
        Self {
            tag,
            weight: 0,
            flags: RATTR_RM,
            data: Data::empty(),
        }
    }

    pub fn rm_range(weight: u32) -> Self {
        Self {
            tag: 0,
            weight: -(weight as i32),
            flags: RATTR_RM,
            data: Data::empty(),
        }
    }

    pub fn grow(tag: Tag, delta: i32, data: Data) -> Self {
        Self {
            tag,
            weight: delta,
            flags: RATTR_GROW,
            data,
        }
    }

    pub fn is_rm(&self) -> bool {
        self.flags & RATTR_RM != 0
    }

    pub fn is_grow(&self) -> bool {
        self.flags & RATTR_GROW != 0
    }

    /// Net change in tree weight, assuming the edit applies
    pub fn delta(&self) -> i32 {
        if self.is_rm() {
            self.weight.min(0)
        } else {
            self.weight
        }
    }
}

/// Result of a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Found {
    pub rid: Rid,
    pub tag: Tag,
    pub weight: u32,
    pub block: u32,
    /// Payload location
    pub off: u32,
    pub size: u32,
}

impl Found {
    pub fn data(&self) -> Data {
        Data::Disk {
            block: self.block,
            off: self.off,
            size: self.size,
        }
    }

    pub fn read(&self, bd: &mut Bd) -> Result<Vec<u8>> {
        bd.read_vec(self.block, self.off, self.size as usize)
    }
}

/// Trunk and weight of one tree; an rbyd's own tree or a shrub inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tree {
    pub trunk: u32,
    pub weight: u32,
}

impl Tree {
    pub fn is_empty(&self) -> bool {
        self.trunk == 0
    }

    /// Smallest record >= (rid, tag)
    pub fn lookup_next(&self, bd: &mut Bd, block: u32, rid: Rid, tag_: Tag) -> Result<Found> {
        if self.trunk == 0 {
            return Err(FsError::NotFound);
        }
        let want = (rid, tag::key(tag_));
        let mut lower: Rid = 0;
        let mut upper: Rid = self.weight as Rid;
        let mut off = self.trunk;
        for _ in 0..bd.block_size() {
            match tree::read_node(bd, block, off)? {
                Disk::Empty => return Err(FsError::NotFound),
                Disk::Null { off: o, len } => off = o + len,
                Disk::Alt {
                    off: o,
                    gt,
                    key,
                    weight,
                    jump,
                    len,
                    ..
                } => {
                    let w = weight as Rid;
                    if !gt {
                        if want <= (lower + w - 1, key) {
                            upper = lower + w;
                            off = o - jump;
                        } else {
                            lower += w;
                            off = o + len;
                        }
                    } else if want > (upper - w - 1, key) {
                        lower = upper - w;
                        off = o - jump;
                    } else {
                        upper -= w;
                        off = o + len;
                    }
                }
                Disk::Leaf {
                    off: o,
                    tag: t,
                    len,
                    size,
                    ..
                } => {
                    let leaf_rid = upper - 1;
                    if want > (leaf_rid, t) {
                        return Err(FsError::NotFound);
                    }
                    return Ok(Found {
                        rid: leaf_rid,
                        tag: t,
                        weight: (upper - lower) as u32,
                        block,
                        off: o + len,
                        size,
                    });
                }
            }
        }
        Err(FsError::corrupt(format!("alt loop in block {}", block)))
    }

    /// Greatest record < (rid, tag)
    pub(crate) fn prev_key(&self, bd: &mut Bd, block: u32, rid: Rid, tag_: Tag) -> Result<Option<Key>> {
        if self.trunk == 0 {
            return Ok(None);
        }
        let want = (rid, tag::key(tag_));
        let mut lower: Rid = 0;
        let mut upper: Rid = self.weight as Rid;
        let mut off = self.trunk;
        let mut below = None;
        for _ in 0..bd.block_size() {
            match tree::read_node(bd, block, off)? {
                Disk::Empty => return Ok(None),
                Disk::Null { off: o, len } => off = o + len,
                Disk::Alt {
                    off: o,
                    gt,
                    key,
                    weight,
                    jump,
                    len,
                    ..
                } => {
                    let w = weight as Rid;
                    if !gt {
                        if want <= (lower + w - 1, key) {
                            upper = lower + w;
                            off = o - jump;
                        } else {
                            below = Some((lower + w - 1, key));
                            lower += w;
                            off = o + len;
                        }
                    } else if want > (upper - w - 1, key) {
                        below = Some((upper - w - 1, key));
                        lower = upper - w;
                        off = o - jump;
                    } else {
                        upper -= w;
                        off = o + len;
                    }
                }
                Disk::Leaf { tag: t, .. } => {
                    if want > (upper - 1, t) {
                        return Ok(Some((upper - 1, t)));
                    }
                    return Ok(below);
                }
            }
        }
        Err(FsError::corrupt(format!("alt loop in block {}", block)))
    }

    /// Records from `first` through `last` with their neighbours
    fn span(&self, bd: &mut Bd, block: u32, first: Key, last: Key) -> Result<Span> {
        let pred = self.prev_key(bd, block, first.0, first.1)?;
        let after = if last.1 >= tag::KEY_MASK {
            self.lookup_next(bd, block, last.0 + 1, 0)
        } else {
            self.lookup_next(bd, block, last.0, last.1 + 1)
        };
        let succ = match after {
            Ok(f) => Some((f.rid, f.tag)),
            Err(FsError::NotFound) => None,
            Err(err) => return Err(err),
        };
        Ok(Span {
            first,
            last,
            pred,
            succ,
        })
    }

    /// Span of every record with a rid in `[lo, hi]`, `None` if there are none
    fn span_rids(&self, bd: &mut Bd, block: u32, lo: Rid, hi: Rid) -> Result<Option<Span>> {
        let first = match self.lookup_next(bd, block, lo, 0) {
            Ok(f) if f.rid <= hi => (f.rid, f.tag),
            Ok(_) | Err(FsError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        let last = self
            .prev_key(bd, block, hi + 1, 0)?
            .ok_or_else(|| FsError::corrupt("record vanished during range removal"))?;
        self.span(bd, block, first, last).map(Some)
    }

    /// Exact lookup of (rid, tag), comparing only the tag bits in `mask`
    pub fn lookup(&self, bd: &mut Bd, block: u32, rid: Rid, tag_: Tag, mask: Tag) -> Result<Found> {
        let found = self.lookup_next(bd, block, rid, tag::key(tag_) & mask)?;
        if found.rid != rid || !tag::matches(found.tag, tag_, mask) {
            return Err(FsError::NotFound);
        }
        Ok(found)
    }

    /// Record following `prev` in tree order
    pub fn next(&self, bd: &mut Bd, block: u32, prev: &Found) -> Result<Found> {
        if prev.tag >= tag::KEY_MASK {
            self.lookup_next(bd, block, prev.rid + 1, 0)
        } else {
            self.lookup_next(bd, block, prev.rid, prev.tag + 1)
        }
    }

    /// All records with start <= rid < end
    pub fn leaves(&self, bd: &mut Bd, block: u32, start: Rid, end: Rid) -> Result<Vec<Found>> {
        let mut out = Vec::new();
        let mut cur = match self.lookup_next(bd, block, start, 0) {
            Ok(f) => f,
            Err(FsError::NotFound) => return Ok(out),
            Err(err) => return Err(err),
        };
        while cur.rid < end {
            out.push(cur);
            cur = match self.next(bd, block, &cur) {
                Ok(f) => f,
                Err(FsError::NotFound) => break,
                Err(err) => return Err(err),
            };
        }
        Ok(out)
    }
}

/// Conservative compacted size of a record range plus a proposed split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub size: u32,
    /// First rid of the upper half, if the range holds two or more rids
    pub split: Option<Rid>,
    pub records: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rbyd {
    pub block: u32,
    pub rev: u32,
    pub trunk: u32,
    pub weight: u32,
    /// Checksum of the last commit
    pub cksum: u32,
    /// Next append offset, `None` if the tail isn't known to be erased
    pub eoff: Option<u32>,
    /// Running crc of the commit in progress
    pcrc: u32,
}

/// First byte after the revision header
pub fn data_start(bd: &Bd) -> u32 {
    bd.align_up(4)
}

/// Fixed cost of an rbyd on top of its records
pub fn overhead(bd: &Bd) -> u32 {
    data_start(bd) + TAIL_RESERVE + 2 * bd.prog_size() + ECKSUM_MIN
}

impl Rbyd {
    /// Start a new rbyd in an erased block
    pub fn create(bd: &mut Bd, block: u32, rev: u32) -> Result<Rbyd> {
        let start = data_start(bd);
        let mut head = vec![crate::storage::bd::ERASED; start as usize];
        head[..4].copy_from_slice(&rev.to_le_bytes());
        bd.prog(block, 0, &head)?;
        Ok(Rbyd {
            block,
            rev,
            trunk: 0,
            weight: 0,
            cksum: 0,
            eoff: Some(start),
            pcrc: Checksum::compute(&head),
        })
    }

    /// Reference a known commit without scanning its block
    ///
    /// Good for lookups only; the erase state is unknown so appends fail
    /// with `Range` until the rbyd is fetched.
    pub fn at(block: u32, trunk: u32, weight: u32, cksum: u32) -> Rbyd {
        Rbyd {
            block,
            rev: 0,
            trunk,
            weight,
            cksum,
            eoff: None,
            pcrc: 0,
        }
    }

    pub fn tree(&self) -> Tree {
        Tree {
            trunk: self.trunk,
            weight: self.weight,
        }
    }

    pub(crate) fn set_tree(&mut self, tree: Tree) {
        self.trunk = tree.trunk;
        self.weight = tree.weight;
    }

    pub fn is_erased(&self) -> bool {
        self.eoff.is_some()
    }

    /// Bytes used so far, or the whole block if the tail isn't reusable
    pub fn used(&self, bd: &Bd) -> u32 {
        self.eoff.unwrap_or(bd.block_size())
    }

    /// Read only the revision count of a block
    pub fn read_rev(bd: &mut Bd, block: u32) -> Result<u32> {
        let buf = bd.read_vec(block, 0, 4)?;
        Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }

    /// Recover the most recent valid commit of a block
    ///
    /// With a `(trunk, cksum)` hint the scan stops at the commit that produced
    /// that trunk, ignoring anything written after it.
    pub fn fetch(bd: &mut Bd, block: u32, hint: Option<(u32, u32)>) -> Result<Rbyd> {
        let block_size = bd.block_size();
        let start = data_start(bd);
        let head = bd.read_vec(block, 0, start as usize)?;
        let rev = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let mut crc = Checksum::compute(&head);
        let mut off = start;

        // (start, weight) of the run of alts being scanned
        let mut run: Option<(u32, u32)> = None;
        let mut candidate: Option<(u32, u32)> = None;
        let mut ecksum: Option<Ecksum> = None;
        // trunk, weight, cksum, end, ecksum
        let mut best: Option<(u32, u32, u32, u32, Option<Ecksum>)> = None;
        let mut hinted = false;

        while off + 2 <= block_size {
            let h = match tree::read_header(bd, block, off) {
                Ok(h) => h,
                Err(_) => break,
            };
            if tag::is_valid(h.tag) != Checksum::parity(crc) {
                break;
            }
            let hlen = h.len as u32;
            let plen = if tag::is_alt(h.tag) { 0 } else { h.size };
            if off + hlen + plen > block_size {
                break;
            }
            let hbuf = bd.read_vec(block, off, h.len)?;
            crc = Checksum::append(crc, &hbuf);

            if !tag::is_alt(h.tag) && tag::key(h.tag) == tag::CKSUM {
                if h.size < 4 {
                    break;
                }
                let stored = bd.read_vec(block, off + hlen, 4)?;
                let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
                if stored != crc {
                    break;
                }
                let (trunk, weight) = candidate.unwrap_or((0, 0));
                let end = off + hlen + plen;
                best = Some((trunk, weight, stored, end, ecksum.take()));
                run = None;
                crc = 0;
                off = end;
                // commits that leave the trunk alone share it, the checksum
                // picks out the right one
                if hint == Some((trunk, stored)) {
                    hinted = true;
                    break;
                }
                continue;
            }

            if plen > 0 {
                crc = bd.cksum(block, off + hlen, plen as usize, crc)?;
            }
            if !tag::is_alt(h.tag) && tag::key(h.tag) == tag::ECKSUM {
                let buf = bd.read_vec(block, off + hlen, plen as usize)?;
                ecksum = Some(Ecksum::decode(&buf)?);
            } else if !tag::is_shrub(h.tag) {
                if tag::is_alt(h.tag) {
                    let entry = run.get_or_insert((off, 0));
                    entry.1 += h.weight;
                    if tag::key(h.tag) == tag::GOTO && !tag::is_gt(h.tag) {
                        candidate = run.take();
                    }
                } else if !tag::is_cksum(h.tag) {
                    let (s, w) = run.take().unwrap_or((off, 0));
                    candidate = Some((s, w + h.weight));
                }
            }
            off += hlen + plen;
        }

        let (trunk, weight, cksum, end, ecksum) = best.ok_or_else(|| {
            FsError::corrupt(format!("no valid commit in block {}", block))
        })?;
        if let Some((htrunk, hcksum)) = hint {
            if !hinted {
                return Err(FsError::corrupt(format!(
                    "commit {:#x}/{:08x} not found in block {}",
                    htrunk, hcksum, block
                )));
            }
        }

        let eoff = match ecksum {
            Some(e) if end + e.size <= block_size => {
                if bd.cksum(block, end, e.size as usize, 0)? == e.cksum {
                    Some(end)
                } else {
                    None
                }
            }
            _ => None,
        };

        Ok(Rbyd {
            block,
            rev,
            trunk,
            weight,
            cksum,
            eoff,
            pcrc: 0,
        })
    }

    pub fn lookup_next(&self, bd: &mut Bd, rid: Rid, tag_: Tag) -> Result<Found> {
        self.tree().lookup_next(bd, self.block, rid, tag_)
    }

    pub fn lookup(&self, bd: &mut Bd, rid: Rid, tag_: Tag) -> Result<Found> {
        self.tree().lookup(bd, self.block, rid, tag_, tag::MASK_NONE)
    }

    pub fn lookup_masked(&self, bd: &mut Bd, rid: Rid, tag_: Tag, mask: Tag) -> Result<Found> {
        self.tree().lookup(bd, self.block, rid, tag_, mask)
    }

    /// Write one raw record, returns its offset
    fn prog_raw(&mut self, bd: &mut Bd, tag_: Tag, weight: u32, size: u32, payload: &[u8], reserve: bool) -> Result<u32> {
        let off = self.eoff.ok_or(FsError::Range)?;
        let need = header_len(weight, size) as u32 + payload.len() as u32;
        let limit = if reserve {
            bd.block_size().saturating_sub(TAIL_RESERVE + bd.prog_size())
        } else {
            bd.block_size()
        };
        if off + need > limit {
            return Err(FsError::Range);
        }
        let tag_ = if Checksum::parity(self.pcrc) {
            tag_ | tag::VALID
        } else {
            tag_ & !tag::VALID
        };
        let mut buf = Vec::with_capacity(need as usize);
        encode_header(&mut buf, tag_, weight, size);
        buf.extend_from_slice(payload);
        bd.prog(self.block, off, &buf)?;
        self.pcrc = Checksum::append(self.pcrc, &buf);
        self.eoff = Some(off + need);
        Ok(off)
    }

    fn prog_leaf(&mut self, bd: &mut Bd, tag_: Tag, weight: u32, data: &Data) -> Result<u32> {
        let payload = data.to_vec(bd)?;
        self.prog_raw(bd, tag_, weight, payload.len() as u32, &payload, true)
    }

    fn prog_alt(&mut self, bd: &mut Bd, tag_: Tag, weight: u32, target: u32) -> Result<u32> {
        let here = self.eoff.ok_or(FsError::Range)?;
        let jump = if target == 0 { 0 } else { here - target };
        self.prog_raw(bd, tag_, weight, jump, &[], true)
    }

    /// Serialize a planned subtree; returns the offset of its root
    fn emit(&mut self, bd: &mut Bd, sub: Sub, flag: Tag) -> Result<u32> {
        match sub {
            Sub::Old { off, .. } => tree::resolve(bd, self.block, off),
            Sub::Leaf(l) => self.prog_leaf(bd, l.tag | flag, l.weight, &l.data),
            node @ Sub::Node(_) => self.emit_run(bd, node, flag),
        }
    }

    /// Write the off-path children first, then the path through the new
    /// nodes as one contiguous run of alts
    fn emit_run(&mut self, bd: &mut Bd, sub: Sub, flag: Tag) -> Result<u32> {
        enum End {
            Leaf(Box<Leaf>),
            Goto(u32, u32),
        }

        let mut alts: Vec<(Tag, u32, u32)> = Vec::new();
        let mut cur = sub;
        let end = loop {
            match cur {
                Sub::Node(node) => {
                    let tree::Node { subs, keys } = *node;
                    let n = subs.len();
                    if n == 1 {
                        alts.push((tag::alt(false, false, 0) | flag, 0, 0));
                        cur = subs.into_iter().next().ok_or_else(|| FsError::corrupt("node without children"))?;
                        continue;
                    }
                    // the path continues through the first new child
                    let path = subs.iter().position(|s| !s.is_old()).unwrap_or(n - 1);
                    let mut targets = Vec::with_capacity(n);
                    let mut inline = None;
                    for (i, s) in subs.into_iter().enumerate() {
                        if i == path {
                            inline = Some(s);
                            targets.push((0, 0));
                        } else {
                            let w = s.weight();
                            targets.push((self.emit(bd, s, flag)?, w));
                        }
                    }
                    let first = alts.len();
                    for i in 0..path {
                        let (target, w) = targets[i];
                        alts.push((tag::alt(false, alts.len() > first, keys[i]) | flag, w, target));
                    }
                    for j in (path + 1..n).rev() {
                        let (target, w) = targets[j];
                        alts.push((tag::alt(true, alts.len() > first, keys[j - 1]) | flag, w, target));
                    }
                    cur = inline.ok_or_else(|| FsError::corrupt("node without a path child"))?;
                }
                Sub::Leaf(l) => break End::Leaf(l),
                Sub::Old { off, weight } => {
                    break End::Goto(tree::resolve(bd, self.block, off)?, weight)
                }
            }
        };

        let mut start = None;
        for (t, w, target) in alts {
            let off = self.prog_alt(bd, t, w, target)?;
            start.get_or_insert(off);
        }
        let off = match end {
            End::Leaf(l) => self.prog_leaf(bd, l.tag | flag, l.weight, &l.data)?,
            End::Goto(target, weight) => {
                self.prog_alt(bd, tag::alt(false, false, tag::GOTO) | flag, weight, target)?
            }
        };
        Ok(start.unwrap_or(off))
    }

    /// Emit a new root; on-disk and empty roots get a goto so the trunk is
    /// always the last run written
    fn emit_root(&mut self, bd: &mut Bd, root: Option<Sub>, flag: Tag) -> Result<u32> {
        let goto = tag::alt(false, false, tag::GOTO) | flag;
        match root {
            None => self.prog_alt(bd, goto, 0, 0),
            Some(Sub::Old { off, weight }) => {
                let target = tree::resolve(bd, self.block, off)?;
                self.prog_alt(bd, goto, weight, target)
            }
            Some(sub) => self.emit(bd, sub, flag),
        }
    }

    /// Apply one rattr to `tree`, a tree stored in this rbyd's block
    pub fn append_to(&mut self, bd: &mut Bd, tree: &mut Tree, shrub: bool, rid: Rid, rattr: &Rattr) -> Result<()> {
        if self.eoff.is_none() {
            return Err(FsError::Range);
        }
        let flag = if shrub { tag::SHRUB } else { 0 };
        let block = self.block;
        let want_tag = tag::key(rattr.tag);

        if rattr.is_rm() {
            let span = if rattr.weight < 0 {
                tree.span_rids(bd, block, rid + rattr.weight + 1, rid)?
            } else {
                match tree.lookup(bd, block, rid, want_tag, tag::MASK_NONE) {
                    Ok(_) => Some(tree.span(bd, block, (rid, want_tag), (rid, want_tag))?),
                    Err(FsError::NotFound) => None,
                    Err(err) => return Err(err),
                }
            };
            // nothing to remove
            let Some(span) = span else { return Ok(()) };
            let root = tree::plan_remove(bd, block, tree.trunk, tree.weight, &span)?;
            tree.weight -= span.weight();
            tree.trunk = self.emit_root(bd, root, flag)?;
            return Ok(());
        }

        let existing = match tree.lookup(bd, block, rid, want_tag, tag::MASK_NONE) {
            Ok(f) => Some(f),
            Err(FsError::NotFound) => None,
            Err(err) => return Err(err),
        };

        if rattr.is_grow() {
            let found = existing.ok_or(FsError::NotFound)?;
            let weight = found.weight as i64 + rattr.weight as i64;
            if weight < 0 {
                return Err(FsError::Invalid(format!("grow below zero at rid {}", rid)));
            }
            let leaf = Leaf {
                tag: want_tag,
                weight: weight as u32,
                data: rattr.data.clone(),
            };
            let root = tree::plan_replace(bd, block, tree.trunk, tree.weight, (rid, want_tag), leaf)?;
            tree.weight = (tree.weight as i64 - found.weight as i64 + weight) as u32;
            tree.trunk = self.emit_root(bd, Some(root), flag)?;
            return Ok(());
        }

        if rattr.weight < 0 {
            return Err(FsError::Invalid("negative weight without rm".into()));
        }
        let weight = rattr.weight as u32;
        let root = match existing {
            // replace in place, keeping whatever weight the record carries
            Some(found) if weight == 0 => {
                let leaf = Leaf {
                    tag: want_tag,
                    weight: found.weight,
                    data: rattr.data.clone(),
                };
                tree::plan_replace(bd, block, tree.trunk, tree.weight, (rid, want_tag), leaf)?
            }
            _ => {
                let leaf = Leaf {
                    tag: want_tag,
                    weight,
                    data: rattr.data.clone(),
                };
                let want = (rid, if weight > 0 { 0 } else { want_tag });
                tree.weight += weight;
                tree::plan_insert(bd, block, tree.trunk, tree.weight - weight, want, leaf)?
            }
        };
        tree.trunk = self.emit_root(bd, Some(root), flag)?;
        Ok(())
    }

    /// Apply one rattr to this rbyd's own tree
    pub fn append_rattr(&mut self, bd: &mut Bd, rid: Rid, rattr: &Rattr) -> Result<()> {
        let mut tree = self.tree();
        self.append_to(bd, &mut tree, false, rid, rattr)?;
        self.set_tree(tree);
        Ok(())
    }

    /// Terminate the current commit
    pub fn append_cksum(&mut self, bd: &mut Bd) -> Result<()> {
        let off = self.eoff.ok_or(FsError::Range)?;
        let block_size = bd.block_size();
        let prog = bd.prog_size();
        let esize = prog.max(ECKSUM_MIN);

        let mut e = Vec::new();
        Ecksum {
            size: esize,
            cksum: Checksum::fill(0, crate::storage::bd::ERASED, esize as usize),
        }
        .encode(&mut e);
        let elen = header_len(0, e.len() as u32) as u32 + e.len() as u32;
        let cmax = 2 + 1 + leb128_len(4 + 2 * prog) as u32 + 4 + 2 * prog;
        let with_ecksum = off + elen + cmax + esize <= block_size;
        if with_ecksum {
            self.prog_raw(bd, tag::ECKSUM, 0, e.len() as u32, &e, false)?;
        }

        let start = self.eoff.ok_or(FsError::Range)?;
        let mut pad = 0;
        let (hlen, end) = loop {
            let hlen = header_len(0, 4 + pad) as u32;
            let end = start + hlen + 4 + pad;
            if end % prog == 0 {
                break (hlen, end);
            }
            pad += 1;
        };
        if end > block_size {
            return Err(FsError::Range);
        }

        let t = if Checksum::parity(self.pcrc) {
            tag::CKSUM | tag::VALID
        } else {
            tag::CKSUM
        };
        let mut buf = Vec::with_capacity((end - start) as usize);
        encode_header(&mut buf, t, 0, 4 + pad);
        debug_assert_eq!(buf.len() as u32, hlen);
        let crc = Checksum::append(self.pcrc, &buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.resize((end - start) as usize, crate::storage::bd::ERASED);
        bd.prog(self.block, start, &buf)?;
        bd.flush()?;

        self.cksum = crc;
        self.pcrc = 0;
        self.eoff = if with_ecksum { Some(end) } else { None };
        Ok(())
    }

    /// Append rattrs and a checksum as one commit; all or nothing in memory
    pub fn commit(&mut self, bd: &mut Bd, rattrs: &[(Rid, Rattr)]) -> Result<()> {
        let mut next = *self;
        match next.append_all(bd, rattrs) {
            Ok(()) => {
                *self = next;
                Ok(())
            }
            Err(err) => {
                // the tail now holds a partial commit
                self.eoff = None;
                Err(err)
            }
        }
    }

    fn append_all(&mut self, bd: &mut Bd, rattrs: &[(Rid, Rattr)]) -> Result<()> {
        for (rid, rattr) in rattrs {
            self.append_rattr(bd, *rid, rattr)?;
        }
        self.append_cksum(bd)
    }

    pub fn estimate(&self, bd: &mut Bd, start: Rid, end: Rid) -> Result<Estimate> {
        Self::estimate_tree(bd, self.block, self.tree(), start, end, &mut |_, _| Ok(0))
    }

    /// Size of `tree` compacted over [start, end); `extra` adds per-record
    /// costs such as shrubs carried along with their owner
    pub fn estimate_tree(
        bd: &mut Bd,
        block: u32,
        tree: Tree,
        start: Rid,
        end: Rid,
        extra: &mut dyn FnMut(&mut Bd, &Found) -> Result<u32>,
    ) -> Result<Estimate> {
        let leaves = tree.leaves(bd, block, start, end)?;
        let alt = 2 + leb128_len(tree.weight) as u32 + leb128_len(bd.block_size()) as u32;

        let mut groups: Vec<(Rid, u32)> = Vec::new();
        for f in &leaves {
            let cost = header_len(f.weight, f.size) as u32 + f.size + alt + extra(bd, f)?;
            match groups.last_mut() {
                Some((rid, size)) if *rid == f.rid => *size += cost,
                _ => groups.push((f.rid, cost)),
            }
        }
        let total: u32 = groups.iter().map(|g| g.1).sum();

        let mut split = None;
        let mut cum = 0;
        for i in 1..groups.len() {
            cum += groups[i - 1].1;
            if cum * 2 >= total || i == groups.len() - 1 {
                split = Some(groups[i].0);
                break;
            }
        }

        Ok(Estimate {
            size: overhead(bd) + total,
            split,
            records: leaves.len() as u32,
        })
    }

    /// Rebuild [start, end) of `src` as a balanced tree inside this rbyd
    ///
    /// `map` may replace a record's payload, writing anything it needs (such
    /// as a shrub) into `dst` first.
    pub(crate) fn compact_from(
        dst: &mut Rbyd,
        bd: &mut Bd,
        src_block: u32,
        src: Tree,
        shrub: bool,
        start: Rid,
        end: Rid,
        map: &mut dyn FnMut(&mut Bd, &mut Rbyd, &Found) -> Result<Option<Data>>,
    ) -> Result<Tree> {
        let mut leaves = Vec::new();
        Self::gather(dst, bd, src_block, src, start, end, map, &mut leaves)?;
        dst.emit_leaves(bd, leaves, shrub)
    }

    /// Collect records of `src` for a later `emit_leaves`
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn gather(
        dst: &mut Rbyd,
        bd: &mut Bd,
        src_block: u32,
        src: Tree,
        start: Rid,
        end: Rid,
        map: &mut dyn FnMut(&mut Bd, &mut Rbyd, &Found) -> Result<Option<Data>>,
        out: &mut Vec<Leaf>,
    ) -> Result<()> {
        for f in src.leaves(bd, src_block, start, end)? {
            let data = match map(bd, dst, &f)? {
                Some(data) => data,
                None => f.data(),
            };
            out.push(Leaf {
                tag: f.tag,
                weight: f.weight,
                data,
            });
        }
        Ok(())
    }

    /// Write sorted records as a tree with every leaf at the same depth
    pub(crate) fn emit_leaves(&mut self, bd: &mut Bd, leaves: Vec<Leaf>, shrub: bool) -> Result<Tree> {
        let weight = leaves.iter().map(|l| l.weight).sum();
        let flag = if shrub { tag::SHRUB } else { 0 };
        let trunk = match tree::build(leaves) {
            Some(root) => self.emit_root(bd, Some(root), flag)?,
            None if shrub => 0,
            None => self.emit_root(bd, None, flag)?,
        };
        Ok(Tree { trunk, weight })
    }

    /// Concatenate several record ranges into a fresh rbyd
    pub fn compact_many(bd: &mut Bd, dst_block: u32, rev: u32, srcs: &[(Rbyd, Rid, Rid)]) -> Result<Rbyd> {
        let mut dst = Rbyd::create(bd, dst_block, rev)?;
        let mut leaves = Vec::new();
        for (src, start, end) in srcs {
            Self::gather(&mut dst, bd, src.block, src.tree(), *start, *end, &mut |_, _, _| Ok(None), &mut leaves)?;
        }
        let tree = dst.emit_leaves(bd, leaves, false)?;
        dst.set_tree(tree);
        dst.append_cksum(bd)?;
        Ok(dst)
    }

    /// Compact [start, end) into a fresh rbyd in an erased block
    pub fn compact(&self, bd: &mut Bd, dst_block: u32, rev: u32, start: Rid, end: Rid) -> Result<Rbyd> {
        let mut dst = Rbyd::create(bd, dst_block, rev)?;
        let tree = Self::compact_from(&mut dst, bd, self.block, self.tree(), false, start, end, &mut |_, _, _| Ok(None))?;
        dst.set_tree(tree);
        dst.append_cksum(bd)?;
        debug_log!(
            "rbyd: compacted {}.{:#x} -> {}.{:#x} ({} bytes)",
            self.block,
            self.trunk,
            dst.block,
            dst.trunk,
            dst.used(bd)
        );
        Ok(dst)
    }

    /// Build a fresh rbyd holding exactly `rattrs`, in order
    pub fn build(bd: &mut Bd, block: u32, rev: u32, rattrs: &[(Rid, Rattr)]) -> Result<Rbyd> {
        let mut rbyd = Rbyd::create(bd, block, rev)?;
        rbyd.commit(bd, rattrs)?;
        Ok(rbyd)
    }

    pub fn leaves(&self, bd: &mut Bd, start: Rid, end: Rid) -> Result<Vec<Found>> {
        self.tree().leaves(bd, self.block, start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::storage::bd::RamBlockDevice;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn bd_with(block_size: u32, prog_size: u32) -> (Bd, RamBlockDevice) {
        let mut cfg = FsConfig::new(block_size, 8);
        cfg.prog_size = prog_size;
        cfg.read_size = prog_size;
        cfg.pcache_size = prog_size * 4;
        cfg.rcache_size = prog_size * 4;
        let ram = RamBlockDevice::new(block_size, 8);
        (Bd::new(Box::new(ram.clone()), &cfg).unwrap(), ram)
    }

    /// Reference model: records in tree order
    #[derive(Default, Clone)]
    struct Model {
        recs: Vec<(Tag, u32, Vec<u8>)>,
    }

    impl Model {
        fn rids(&self) -> Vec<Rid> {
            let mut sum: Rid = 0;
            self.recs
                .iter()
                .map(|r| {
                    sum += r.1 as Rid;
                    sum - 1
                })
                .collect()
        }

        fn weight(&self) -> u32 {
            self.recs.iter().map(|r| r.1).sum()
        }

        fn lookup_next(&self, rid: Rid, tag_: Tag) -> Option<(Rid, Tag, u32, Vec<u8>)> {
            let rids = self.rids();
            self.recs
                .iter()
                .zip(rids)
                .find(|(r, r_rid)| (*r_rid, r.0) >= (rid, tag_))
                .map(|(r, r_rid)| (r_rid, r.0, r.1, r.2.clone()))
        }

        fn insert(&mut self, rid: Rid, tag_: Tag, w: u32, data: &[u8]) {
            let rids = self.rids();
            let pos = rids.iter().position(|&r| r >= rid).unwrap_or(self.recs.len());
            self.recs.insert(pos, (tag_, w, data.to_vec()));
        }

        fn set(&mut self, rid: Rid, tag_: Tag, data: &[u8]) {
            let rids = self.rids();
            let pos = (0..self.recs.len()).position(|i| (rids[i], self.recs[i].0) >= (rid, tag_));
            match pos {
                Some(i) if (rids[i], self.recs[i].0) == (rid, tag_) => self.recs[i].2 = data.to_vec(),
                Some(i) => self.recs.insert(i, (tag_, 0, data.to_vec())),
                None => self.recs.push((tag_, 0, data.to_vec())),
            }
        }

        fn rm_range(&mut self, rid: Rid, w: u32) {
            let rids = self.rids();
            let lo = rid - w as Rid + 1;
            let keep: Vec<_> = self
                .recs
                .iter()
                .zip(rids)
                .filter(|(_, r)| *r < lo || *r > rid)
                .map(|(rec, _)| rec.clone())
                .collect();
            self.recs = keep;
        }

        fn rm(&mut self, rid: Rid, tag_: Tag) {
            let rids = self.rids();
            if let Some(i) = (0..self.recs.len()).find(|&i| rids[i] == rid && self.recs[i].0 == tag_) {
                self.recs.remove(i);
            }
        }

        fn grow(&mut self, rid: Rid, tag_: Tag, delta: i32, data: &[u8]) {
            let rids = self.rids();
            let i = (0..self.recs.len())
                .find(|&i| rids[i] == rid && self.recs[i].0 == tag_)
                .unwrap();
            self.recs[i].1 = (self.recs[i].1 as i32 + delta) as u32;
            self.recs[i].2 = data.to_vec();
        }

        /// Rids where a weighted record ends, the only rids that can carry
        /// weight-0 records
        fn ends(&self) -> Vec<Rid> {
            self.recs.iter().zip(self.rids()).filter(|(r, _)| r.1 > 0).map(|(_, rid)| rid).collect()
        }
    }

    fn check(bd: &mut Bd, rbyd: &Rbyd, model: &Model) {
        assert_eq!(rbyd.weight, model.weight());
        let max = model.weight() as Rid + 1;
        for rid in -1..max {
            for t in [0, tag::REG, tag::DATA, tag::ATTR + 1] {
                let got = rbyd.lookup_next(bd, rid, t).ok().map(|f| {
                    let data = f.read(bd).unwrap();
                    (f.rid, f.tag, f.weight, data)
                });
                assert_eq!(got, model.lookup_next(rid, t), "lookup_next({}, {:#x})", rid, t);
            }
        }
    }

    /// Node depth of an on-disk subtree, panics unless every leaf sits at
    /// the same depth under runs of at most three alts
    fn depth(bd: &mut Bd, block: u32, off: u32) -> usize {
        let off = match tree::read_node(bd, block, off).unwrap() {
            Disk::Leaf { .. } | Disk::Empty => return 0,
            Disk::Null { off, len } => return depth(bd, block, off + len) + 1,
            Disk::Alt { off, .. } => off,
        };
        let mut depths = Vec::new();
        let mut cur = off;
        loop {
            let h = tree::read_header(bd, block, cur).unwrap();
            let red_alt = tag::is_alt(h.tag) && tag::is_red(h.tag) && tag::key(h.tag) != tag::GOTO && h.size != 0;
            if cur != off && !red_alt {
                break;
            }
            depths.push(depth(bd, block, cur - h.size));
            cur += h.len as u32;
        }
        assert!(depths.len() <= tree::NODE_ALTS, "{} alts in node at {}", depths.len(), off);
        depths.push(depth(bd, block, cur));
        assert!(depths.windows(2).all(|w| w[0] == w[1]), "uneven node at {}: {:?}", off, depths);
        depths[0] + 1
    }

    #[test]
    fn test_single_insert() {
        let (mut bd, _) = bd_with(4096, 16);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        rbyd.commit(&mut bd, &[(0, Rattr::buf(tag::NAME, 1, b"foo".to_vec()))]).unwrap();
        let f = rbyd.lookup_next(&mut bd, 0, tag::NAME).unwrap();
        assert_eq!((f.rid, f.tag, f.weight), (0, tag::NAME, 1));
        assert_eq!(f.read(&mut bd).unwrap(), b"foo");
        assert!(rbyd.lookup_next(&mut bd, 1, 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_empty_tree_lookup() {
        let (mut bd, _) = bd_with(4096, 16);
        let rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        assert!(rbyd.lookup_next(&mut bd, 0, 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_fetch_is_idempotent() {
        let (mut bd, _) = bd_with(4096, 16);
        let mut rbyd = Rbyd::create(&mut bd, 2, 7).unwrap();
        for i in 0..10 {
            rbyd.commit(&mut bd, &[(i, Rattr::buf(tag::REG, 1, vec![i as u8; 3]))]).unwrap();
        }
        let a = Rbyd::fetch(&mut bd, 2, None).unwrap();
        let b = Rbyd::fetch(&mut bd, 2, None).unwrap();
        assert_eq!(a, b);
        assert_eq!((a.trunk, a.weight, a.cksum, a.rev), (rbyd.trunk, rbyd.weight, rbyd.cksum, 7));
        assert_eq!(a.eoff, rbyd.eoff);
    }

    #[test]
    fn test_fetch_ignores_uncommitted_tail() {
        let (mut bd, ram) = bd_with(4096, 16);
        let mut rbyd = Rbyd::create(&mut bd, 1, 1).unwrap();
        rbyd.commit(&mut bd, &[(0, Rattr::buf(tag::REG, 1, b"a".to_vec()))]).unwrap();
        let committed = rbyd;

        // append without a checksum, as if power failed mid-commit
        let mut scratch = rbyd;
        scratch.append_rattr(&mut bd, 1, &Rattr::buf(tag::REG, 1, b"b".to_vec())).unwrap();
        bd.flush().unwrap();

        let fetched = Rbyd::fetch(&mut bd, 1, None).unwrap();
        assert_eq!((fetched.trunk, fetched.weight), (committed.trunk, committed.weight));
        // tail is dirty, so the next commit must compact
        assert_eq!(fetched.eoff, None);
        assert!(ram.stats().progs > 0);
    }

    #[test]
    fn test_fetch_with_hint_stops_early() {
        let (mut bd, _) = bd_with(4096, 16);
        let mut rbyd = Rbyd::create(&mut bd, 3, 1).unwrap();
        rbyd.commit(&mut bd, &[(0, Rattr::buf(tag::REG, 1, b"a".to_vec()))]).unwrap();
        let old = rbyd;
        rbyd.commit(&mut bd, &[(1, Rattr::buf(tag::REG, 1, b"b".to_vec()))]).unwrap();

        let f = Rbyd::fetch(&mut bd, 3, Some((old.trunk, old.cksum))).unwrap();
        assert_eq!((f.trunk, f.weight, f.cksum), (old.trunk, 1, old.cksum));
        assert_eq!(f.eoff, None);
        assert!(Rbyd::fetch(&mut bd, 3, Some((old.trunk, old.cksum ^ 1))).is_err());
    }

    #[test]
    fn test_fetch_erased_block_is_corrupt() {
        let (mut bd, _) = bd_with(4096, 16);
        assert!(Rbyd::fetch(&mut bd, 4, None).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_config_records_at_rid_minus_one() {
        let (mut bd, _) = bd_with(4096, 16);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        rbyd.commit(
            &mut bd,
            &[
                (-1, Rattr::buf(tag::MAGIC, 0, b"rbydfs".to_vec())),
                (0, Rattr::buf(tag::REG, 1, b"x".to_vec())),
                (-1, Rattr::buf(tag::VERSION, 0, vec![1])),
            ],
        )
        .unwrap();
        let f = rbyd.lookup(&mut bd, -1, tag::MAGIC).unwrap();
        assert_eq!(f.read(&mut bd).unwrap(), b"rbydfs");
        let f = rbyd.lookup_next(&mut bd, -1, tag::MAGIC + 1).unwrap();
        assert_eq!((f.rid, f.tag), (-1, tag::VERSION));
        let f = rbyd.lookup_next(&mut bd, 0, 0).unwrap();
        assert_eq!((f.rid, f.tag), (0, tag::REG));
    }

    #[test]
    fn test_masked_lookup() {
        let (mut bd, _) = bd_with(4096, 16);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        rbyd.commit(&mut bd, &[(0, Rattr::buf(tag::DIR, 1, b"d".to_vec()))]).unwrap();
        assert!(rbyd.lookup(&mut bd, 0, tag::REG).is_err());
        let f = rbyd.lookup_masked(&mut bd, 0, tag::NAME, tag::MASK_SUBTYPE).unwrap();
        assert_eq!(f.tag, tag::DIR);
    }

    #[test]
    fn test_lookup_append_consistency_against_model() {
        let (mut bd, _) = bd_with(65536, 1);
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        let mut model = Model::default();
        let mut spare = 1;

        for step in 0..600 {
            let w = model.weight() as Rid;
            let rid = rng.gen_range(0..=w);
            let payload = vec![step as u8; rng.gen_range(0..6)];
            let ends = model.ends();
            let end = if ends.is_empty() { None } else { Some(ends[rng.gen_range(0..ends.len())]) };
            let attr = [tag::DATA, tag::ATTR][rng.gen_range(0..2)];
            let choice = rng.gen_range(0..11);
            let (rid, rattr) = match (choice, end) {
                (0..=3, _) | (_, None) => {
                    let weight = rng.gen_range(1..4);
                    let t = [tag::REG, tag::NAME][rng.gen_range(0..2)];
                    model.insert(rid, t, weight, &payload);
                    (rid, Rattr::buf(t, weight as i32, payload))
                }
                (4..=5, Some(end)) => {
                    model.set(end, attr, &payload);
                    (end, Rattr::buf(attr, 0, payload))
                }
                (6..=7, Some(end)) => {
                    model.rm(end, attr);
                    (end, Rattr::rm(attr))
                }
                (8..=9, Some(end)) => {
                    let n = rng.gen_range(1..=(end + 1).min(4)) as u32;
                    model.rm_range(end, n);
                    (end, Rattr::rm_range(n))
                }
                (_, Some(end)) => {
                    let f = model.lookup_next(end, 0).unwrap();
                    let delta = rng.gen_range(-(f.2 as i32 - 1)..=2);
                    model.grow(f.0, f.1, delta, &payload);
                    (f.0, Rattr::grow(f.1, delta, Data::Buf(payload)))
                }
            };
            rbyd_commit(&mut bd, &mut rbyd, &mut spare, rid, rattr);
            check_some(&mut bd, &rbyd, &model, &mut rng);
        }
        check(&mut bd, &rbyd, &model);
        if rbyd.trunk != 0 {
            depth(&mut bd, rbyd.block, rbyd.trunk);
        }
    }

    fn rbyd_commit(bd: &mut Bd, rbyd: &mut Rbyd, spare: &mut u32, rid: Rid, rattr: Rattr) {
        match rbyd.commit(bd, &[(rid, rattr.clone())]) {
            Ok(()) => {}
            Err(FsError::Range) => {
                bd.erase(*spare).unwrap();
                let old = rbyd.block;
                *rbyd = rbyd.compact(bd, *spare, rbyd.rev + 1, -1, rbyd.weight as Rid).unwrap();
                *spare = old;
                rbyd.commit(bd, &[(rid, rattr)]).unwrap();
            }
            Err(err) => panic!("commit failed: {}", err),
        }
    }

    fn check_some(bd: &mut Bd, rbyd: &Rbyd, model: &Model, rng: &mut StdRng) {
        let max = model.weight() as Rid + 1;
        for _ in 0..8 {
            let rid = rng.gen_range(-1..max);
            let t = [0, tag::REG, tag::DATA, tag::ATTR][rng.gen_range(0..4)];
            let got = rbyd.lookup_next(bd, rid, t).ok().map(|f| {
                let data = f.read(bd).unwrap();
                (f.rid, f.tag, f.weight, data)
            });
            assert_eq!(got, model.lookup_next(rid, t), "lookup_next({}, {:#x})", rid, t);
        }
        assert_eq!(rbyd.weight, model.weight());
        if rbyd.trunk != 0 {
            depth(bd, rbyd.block, rbyd.trunk);
        }
    }

    #[test]
    fn test_sequential_appends_stay_balanced() {
        let (mut bd, _) = bd_with(65536, 1);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        for i in 0..256 {
            rbyd.commit(&mut bd, &[(i, Rattr::buf(tag::REG, 1, vec![0; 2]))]).unwrap();
        }
        let h = depth(&mut bd, 0, rbyd.trunk);
        // a 2-3-4 tree over n leaves is at most log2(n) nodes deep
        assert!(h <= 8, "depth {}", h);
    }

    #[test]
    fn test_grow_and_ranged_remove() {
        let (mut bd, _) = bd_with(4096, 16);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        rbyd.commit(
            &mut bd,
            &[
                (0, Rattr::buf(tag::DATA, 10, b"aaaa".to_vec())),
                (10, Rattr::buf(tag::DATA, 5, b"bb".to_vec())),
            ],
        )
        .unwrap();
        assert_eq!(rbyd.weight, 15);
        let f = rbyd.lookup_next(&mut bd, 3, 0).unwrap();
        assert_eq!((f.rid, f.weight), (9, 10));

        rbyd.commit(&mut bd, &[(9, Rattr::grow(tag::DATA, -4, Data::from(&b"aa"[..])))]).unwrap();
        assert_eq!(rbyd.weight, 11);
        let f = rbyd.lookup_next(&mut bd, 0, 0).unwrap();
        assert_eq!((f.rid, f.weight), (5, 6));
        assert_eq!(f.read(&mut bd).unwrap(), b"aa");

        rbyd.commit(&mut bd, &[(10, Rattr::rm_range(11))]).unwrap();
        assert_eq!(rbyd.weight, 0);
        assert!(rbyd.lookup_next(&mut bd, -1, 0).unwrap_err().is_not_found());

        let f = Rbyd::fetch(&mut bd, 0, None).unwrap();
        assert_eq!(f.weight, 0);
        assert!(f.lookup_next(&mut bd, 0, 0).is_err());
    }

    #[test]
    fn test_ranged_remove_takes_attached_records() {
        let (mut bd, _) = bd_with(16384, 16);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        let mut model = Model::default();
        for i in 0..12 {
            let name = format!("f{}", i).into_bytes();
            model.insert(i, tag::REG, 1, &name);
            rbyd.commit(&mut bd, &[(i, Rattr::buf(tag::REG, 1, name))]).unwrap();
            model.set(i, tag::DATA, &[i as u8]);
            model.set(i, tag::ATTR, &[i as u8, 1]);
            rbyd.commit(
                &mut bd,
                &[
                    (i, Rattr::buf(tag::DATA, 0, vec![i as u8])),
                    (i, Rattr::buf(tag::ATTR, 0, vec![i as u8, 1])),
                ],
            )
            .unwrap();
        }

        // rids 4..=7 with their data and attrs go in one edit
        model.rm_range(7, 4);
        rbyd.commit(&mut bd, &[(7, Rattr::rm_range(4))]).unwrap();
        check(&mut bd, &rbyd, &model);
        depth(&mut bd, 0, rbyd.trunk);

        // nothing is left hanging off rid 3
        let f = rbyd.lookup_next(&mut bd, 3, tag::ATTR + 1).unwrap();
        assert_eq!((f.rid, f.tag), (4, tag::REG));
        assert_eq!(f.read(&mut bd).unwrap(), b"f8");

        // removing only the weight-0 tail of a rid leaves its name alone
        model.rm(4, tag::DATA);
        model.rm(4, tag::ATTR);
        rbyd.commit(&mut bd, &[(4, Rattr::rm(tag::DATA)), (4, Rattr::rm(tag::ATTR))]).unwrap();
        check(&mut bd, &rbyd, &model);

        model.rm_range(model.weight() as Rid - 1, model.weight());
        rbyd.commit(&mut bd, &[(rbyd.weight as Rid - 1, Rattr::rm_range(rbyd.weight))]).unwrap();
        check(&mut bd, &rbyd, &model);
        assert!(rbyd.lookup_next(&mut bd, -1, 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_removes_keep_leaves_level() {
        let (mut bd, _) = bd_with(65536, 1);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        let mut model = Model::default();
        for i in 0..64 {
            model.insert(i, tag::REG, 1, &[i as u8]);
            rbyd.commit(&mut bd, &[(i, Rattr::buf(tag::REG, 1, vec![i as u8]))]).unwrap();
        }
        // thin the tree out until most nodes are down to one child
        for rid in (0..64).rev().step_by(3) {
            model.rm_range(rid, 2.min(rid as u32 + 1));
            rbyd.commit(&mut bd, &[(rid, Rattr::rm_range(2.min(rid as u32 + 1)))]).unwrap();
            depth(&mut bd, 0, rbyd.trunk);
        }
        check(&mut bd, &rbyd, &model);

        // inserts still land between the survivors
        model.insert(5, tag::NAME, 2, b"new");
        rbyd.commit(&mut bd, &[(5, Rattr::buf(tag::NAME, 2, b"new".to_vec()))]).unwrap();
        check(&mut bd, &rbyd, &model);
        depth(&mut bd, 0, rbyd.trunk);
    }

    #[test]
    fn test_compaction_equivalence() {
        let (mut bd, _) = bd_with(16384, 16);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        for i in 0..40 {
            let rid = (i * 7) % (i + 1);
            rbyd.commit(&mut bd, &[(rid, Rattr::buf(tag::REG, 1, format!("n{}", i).into_bytes()))]).unwrap();
            rbyd.commit(&mut bd, &[(rid, Rattr::buf(tag::DATA, 0, vec![i as u8]))]).unwrap();
        }
        for rid in [3, 17, 20] {
            rbyd.commit(&mut bd, &[(rid, Rattr::rm_range(1))]).unwrap();
        }

        let before = rbyd.leaves(&mut bd, -1, rbyd.weight as Rid).unwrap();
        let before: Vec<_> = before.iter().map(|f| (f.rid, f.tag, f.read(&mut bd).unwrap())).collect();

        bd.erase(1).unwrap();
        let compacted = rbyd.compact(&mut bd, 1, 2, -1, rbyd.weight as Rid).unwrap();
        assert!(compacted.used(&bd) < rbyd.used(&bd));
        let after = compacted.leaves(&mut bd, -1, compacted.weight as Rid).unwrap();
        let after: Vec<_> = after.iter().map(|f| (f.rid, f.tag, f.read(&mut bd).unwrap())).collect();
        assert_eq!(before, after);
        depth(&mut bd, 1, compacted.trunk);

        let fetched = Rbyd::fetch(&mut bd, 1, None).unwrap();
        assert_eq!(fetched, compacted);
    }

    #[test]
    fn test_estimate_and_split() {
        let (mut bd, _) = bd_with(8192, 16);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        for i in 0..20 {
            rbyd.commit(&mut bd, &[(i, Rattr::buf(tag::REG, 1, vec![b'x'; 20]))]).unwrap();
        }
        let est = rbyd.estimate(&mut bd, -1, 20).unwrap();
        assert_eq!(est.records, 20);
        assert_eq!(est.split, Some(10));

        bd.erase(1).unwrap();
        let compacted = rbyd.compact(&mut bd, 1, 2, -1, 20).unwrap();
        assert!(compacted.used(&bd) <= est.size);

        let lower = rbyd.estimate(&mut bd, -1, 10).unwrap();
        assert!(lower.size < est.size);
    }

    #[test]
    fn test_range_when_block_full() {
        let (mut bd, _) = bd_with(512, 16);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        let mut err = None;
        for i in 0..100 {
            if let Err(e) = rbyd.commit(&mut bd, &[(i, Rattr::buf(tag::REG, 1, vec![0; 16]))]) {
                err = Some(e);
                break;
            }
        }
        assert!(matches!(err, Some(FsError::Range)));
        // failed commits leave the last good one intact
        let fetched = Rbyd::fetch(&mut bd, 0, None).unwrap();
        assert_eq!(fetched.trunk, rbyd.trunk);
        assert_eq!(fetched.weight, rbyd.weight);
    }

    #[test]
    fn test_shrub_trees_are_invisible_to_fetch() {
        let (mut bd, _) = bd_with(4096, 16);
        let mut rbyd = Rbyd::create(&mut bd, 0, 1).unwrap();
        let mut shrub = Tree::default();
        rbyd.append_to(&mut bd, &mut shrub, true, 0, &Rattr::buf(tag::DATA, 4, b"abcd".to_vec())).unwrap();
        rbyd.append_rattr(&mut bd, 0, &Rattr::buf(tag::REG, 1, b"file".to_vec())).unwrap();
        rbyd.append_cksum(&mut bd).unwrap();

        let fetched = Rbyd::fetch(&mut bd, 0, None).unwrap();
        assert_eq!(fetched.weight, 1);
        let f = shrub.lookup_next(&mut bd, 0, 0, 0).unwrap();
        assert_eq!((f.rid, f.weight), (3, 4));
        assert_eq!(f.read(&mut bd).unwrap(), b"abcd");
    }
}
