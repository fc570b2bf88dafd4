//! Metadata directories (mdirs) and the metadata tree (mtree)
//!
//! ## 结构
//! ```text
//! anchor {0,1} --MROOT--> mroot --MROOT--> ... --> mroot
//!                                                   |
//!                                                 MTREE
//!                                                   |
//!                                 btree of (BNAME, MDIR) leaves, one per mdir
//! ```
//!
//! An mdir is an rbyd kept in a pair of blocks. Commits append to the active
//! block; a full block is compacted into its sibling with a higher revision,
//! and every `block_recycles + 1` compactions the pair moves to fresh blocks
//! (the anchor instead grows the mroot chain). Mdirs that outgrow half a
//! block split into two fresh pairs, empty ones are dropped.
//!
//! A mid names one entry: `(mdir index << mbits) | rid`. Until the first
//! split the mroot itself holds the entries and there is no mtree.
//!
//! Changes to an mdir's place in the mtree are carried upwards in a loop:
//! mdir, mtree, mroot, then each link of the chain back to the anchor.

pub mod gstate;
pub mod handle;

use crate::btree::bshrub::Bstruct;
use crate::btree::{search_names, Btree, Visit, Traversal};
use crate::config::FsConfig;
use crate::rbyd::codec::{encode_leb, BtreeRef, Geometry, MdirPair, ShrubRef};
use crate::rbyd::tag::{self, Rid};
use crate::rbyd::{Data, Rattr, Rbyd, Tree};
use crate::storage::alloc::Allocator;
use crate::storage::cache::Bd;
use crate::{FsError, Result};
use gstate::{Gdelta, Gstate, Mid};
use roaring::RoaringBitmap;
use std::cmp::Ordering;

pub const MAGIC: &[u8] = b"rbydfs";
pub const DISK_VERSION: (u32, u32) = (0, 1);

/// Blocks of the anchor pair
pub const ANCHOR: MdirPair = MdirPair([0, 1]);

/// One mdir, fetched from its pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mdir {
    /// Active block first
    pub pair: MdirPair,
    pub rbyd: Rbyd,
    /// Mid of rid 0
    pub mid: Mid,
}

impl Mdir {
    /// Fetch the newest valid block of a pair
    pub fn fetch(bd: &mut Bd, pair: MdirPair, mid: Mid) -> Result<Mdir> {
        let revs = [
            Rbyd::read_rev(bd, pair.0[0])?,
            Rbyd::read_rev(bd, pair.0[1])?,
        ];
        let order = if (revs[1].wrapping_sub(revs[0]) as i32) > 0 {
            [1, 0]
        } else {
            [0, 1]
        };
        let mut last = None;
        for i in order {
            match Rbyd::fetch(bd, pair.0[i], None) {
                Ok(rbyd) => {
                    return Ok(Mdir {
                        pair: if i == 0 { pair } else { pair.swapped() },
                        rbyd,
                        mid,
                    })
                }
                Err(err) if err.is_corrupt() => last = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| FsError::corrupt(format!("mdir {:?} unreadable", pair))))
    }

    pub fn weight(&self) -> u32 {
        self.rbyd.weight
    }

    pub fn block(&self) -> u32 {
        self.pair.0[0]
    }

    /// Where (did, name) is or would be inserted
    pub fn namelookup(&self, bd: &mut Bd, did: u32, name: &[u8]) -> Result<(Rid, bool)> {
        Ok(match search_names(bd, &self.rbyd, did, name)? {
            None => (0, false),
            Some((f, Ordering::Equal)) => (f.rid, true),
            Some((f, Ordering::Less)) => (f.rid + 1, false),
            Some((_, Ordering::Greater)) => (0, false),
        })
    }

    /// File structure of the entry at `rid`
    pub fn bstruct(&self, bd: &mut Bd, rid: Rid) -> Result<Bstruct> {
        Bstruct::decode(bd, &self.rbyd, rid)
    }
}

/// A change to an mdir
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mattr {
    Attr(Rid, Rattr),
    /// Edits to the shrub of the entry at `rid`, from scratch if `fresh`
    Shrub {
        rid: Rid,
        fresh: bool,
        edits: Vec<(Rid, Rattr)>,
    },
}

impl Mattr {
    pub fn rid(&self) -> Rid {
        match self {
            Mattr::Attr(rid, _) => *rid,
            Mattr::Shrub { rid, .. } => *rid,
        }
    }

    fn delta(&self) -> i32 {
        match self {
            Mattr::Attr(_, r) => r.delta(),
            Mattr::Shrub { .. } => 0,
        }
    }

    fn shifted(&self, by: Rid) -> Mattr {
        match self {
            Mattr::Attr(rid, r) => Mattr::Attr(rid - by, r.clone()),
            Mattr::Shrub { rid, fresh, edits } => Mattr::Shrub {
                rid: rid - by,
                fresh: *fresh,
                edits: edits.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    /// `delta` rids inserted at, or removed up to, `rid` of the mdir at `base`
    Shift { base: Mid, rid: Rid, delta: i32 },
    /// Mdir at `base` split, rids from `at` moved to the next mdir
    Split { base: Mid, at: Rid },
    /// Mdir at `base` went away
    Drop { base: Mid },
}

impl Change {
    fn apply(&self, span: Mid, m: Mid) -> Option<Mid> {
        Some(match *self {
            Change::Shift { base, rid, delta } => {
                if m >= base + span {
                    m
                } else if delta > 0 {
                    if m >= base + rid {
                        m + delta
                    } else {
                        m
                    }
                } else if m > base + rid {
                    m + delta
                } else if m > base + rid + delta {
                    // inside the removed range
                    return None;
                } else {
                    m
                }
            }
            Change::Split { base, at } => {
                if m >= base + span {
                    m + span
                } else if m >= base + at {
                    m + span - at
                } else {
                    m
                }
            }
            Change::Drop { base } => {
                if m >= base + span {
                    m - span
                } else if m >= base {
                    return None;
                } else {
                    m
                }
            }
        })
    }
}

impl Change {
    /// Like `apply`, but a position inside a removed range lands on the
    /// first survivor after it
    fn slide(&self, span: Mid, m: Mid) -> Mid {
        match *self {
            Change::Shift { base, rid, delta } if delta < 0 && m <= base + rid && m > base + rid + delta => {
                base + rid + delta + 1
            }
            Change::Drop { base } if m >= base && m < base + span => base,
            c => c.apply(span, m).unwrap_or(m),
        }
    }
}

/// How mids moved during a commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Remap {
    span: Mid,
    changes: Vec<Change>,
}

impl Remap {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// New mid of `mid`, `None` if its entry is gone
    pub fn apply(&self, mid: Mid) -> Option<Mid> {
        let mut m = mid;
        for c in &self.changes {
            m = c.apply(self.span, m)?;
        }
        Some(m)
    }

    /// New position of a cursor sitting at `mid`
    pub fn slide(&self, mid: Mid) -> Mid {
        self.changes.iter().fold(mid, |m, c| c.slide(self.span, m))
    }
}

/// Where a commit left an mdir
enum Landed {
    /// Same pair, possibly the sibling block
    Kept(Mdir),
    Relocated(Mdir),
    /// Two fresh mdirs, the split rid, and rid -1 mattrs held back
    Split(Mdir, Mdir, Rid, Vec<Mattr>),
    Dropped,
    /// Anchor rewritten to point at a new mroot
    Extended(Mdir, Mdir),
}

#[derive(Debug, Clone, Copy, Default)]
struct Job {
    can_split: bool,
    can_drop: bool,
    anchor: bool,
    /// Mdir is the mroot, its rid -1 records stay put on a split
    root: bool,
    /// Rewrite keeping only rid -1 records
    trim: bool,
}

/// Metadata state: the mroot chain, the mtree and global state
#[derive(Debug, Clone)]
pub struct Meta {
    /// Anchor first, mroot last
    pub chain: Vec<Mdir>,
    /// `None` while the mroot holds the entries itself
    pub mtree: Option<Btree>,
    /// Global state as it should be
    pub gstate: Gstate,
    /// Xor of every delta on disk
    pub gdisk: Gdelta,
    pub mbits: u32,
    recycles: i32,
}

fn config_rattrs(cfg: &FsConfig) -> Vec<(Rid, Rattr)> {
    let mut version = encode_leb(DISK_VERSION.0);
    version.extend(encode_leb(DISK_VERSION.1));
    let mut geometry = Vec::new();
    Geometry {
        block_size: cfg.block_size,
        block_count: cfg.block_count,
    }
    .encode(&mut geometry);
    vec![
        (-1, Rattr::buf(tag::MAGIC, 0, MAGIC.to_vec())),
        (-1, Rattr::buf(tag::VERSION, 0, version)),
        (-1, Rattr::buf(tag::GEOMETRY, 0, geometry)),
        (-1, Rattr::buf(tag::NAMELIMIT, 0, encode_leb(cfg.name_limit))),
        (-1, Rattr::buf(tag::FILELIMIT, 0, encode_leb(cfg.file_limit))),
    ]
}

/// Gcksum an mdir saw at its latest commit, zero before the first
fn read_gcksum(bd: &mut Bd, rbyd: &Rbyd) -> Result<u32> {
    match rbyd.lookup(bd, -1, tag::GCKSUM) {
        Ok(f) => {
            let buf = f.read(bd)?;
            let raw: [u8; 4] = buf
                .as_slice()
                .try_into()
                .map_err(|_| FsError::corrupt(format!("gcksum of {} bytes", buf.len())))?;
            Ok(u32::from_le_bytes(raw))
        }
        Err(FsError::NotFound) => Ok(0),
        Err(err) => Err(err),
    }
}

fn pair_data(pair: MdirPair) -> Data {
    let mut buf = Vec::new();
    pair.encode(&mut buf);
    Data::Buf(buf)
}

fn btree_data(tree: &Btree) -> Data {
    let mut buf = Vec::new();
    tree.to_ref().encode(&mut buf);
    Data::Buf(buf)
}

/// Name of the first entry, used as the mtree separator
fn first_name(bd: &mut Bd, mdir: &Mdir) -> Result<Data> {
    if mdir.weight() == 0 {
        return Ok(Data::Buf(encode_leb(0)));
    }
    Ok(mdir.rbyd.lookup_next(bd, 0, 0)?.data())
}

/// Apply mattrs and close the commit
fn apply_mattrs(bd: &mut Bd, rbyd: &mut Rbyd, mattrs: &[Mattr]) -> Result<()> {
    for m in mattrs {
        match m {
            Mattr::Attr(rid, r) => rbyd.append_rattr(bd, *rid, r)?,
            Mattr::Shrub { rid, fresh, edits } => {
                let mut tree = match Bstruct::decode(bd, rbyd, *rid)? {
                    Bstruct::Shrub { tree, .. } if !fresh => tree,
                    _ => Tree::default(),
                };
                for (r, e) in edits {
                    rbyd.append_to(bd, &mut tree, true, *r, e)?;
                }
                rbyd.append_rattr(bd, *rid, &Rattr::rm(tag::BTREE))?;
                if tree.weight == 0 {
                    rbyd.append_rattr(bd, *rid, &Rattr::rm(tag::BSHRUB))?;
                } else {
                    rbyd.append_rattr(bd, *rid, &Bstruct::shrub_rattr(&tree))?;
                }
            }
        }
    }
    rbyd.append_cksum(bd)
}

/// Compact [start, end) of an mdir into an erased block, shrubs included
fn compact_mdir(bd: &mut Bd, src: &Rbyd, dst_block: u32, rev: u32, start: Rid, end: Rid) -> Result<Rbyd> {
    let mut dst = Rbyd::create(bd, dst_block, rev)?;
    let src_block = src.block;
    let tree = Rbyd::compact_from(
        &mut dst,
        bd,
        src_block,
        src.tree(),
        false,
        start,
        end,
        &mut |bd, dst, f| {
            if f.tag != tag::BSHRUB {
                return Ok(None);
            }
            let r = ShrubRef::decode(&f.read(bd)?)?;
            let shrub = Tree {
                trunk: r.trunk,
                weight: r.weight,
            };
            let copied = Rbyd::compact_from(
                dst,
                bd,
                src_block,
                shrub,
                true,
                0,
                shrub.weight as Rid,
                &mut |_, _, _| Ok(None),
            )?;
            Ok(Some(Bstruct::shrub_rattr(&copied).data))
        },
    )?;
    dst.set_tree(tree);
    dst.append_cksum(bd)?;
    Ok(dst)
}

/// Compact and apply mattrs if there are any
fn rebuild(bd: &mut Bd, src: &Rbyd, block: u32, rev: u32, range: (Rid, Rid), mattrs: &[Mattr]) -> Result<Rbyd> {
    let mut dst = compact_mdir(bd, src, block, rev, range.0, range.1)?;
    if !mattrs.is_empty() {
        apply_mattrs(bd, &mut dst, mattrs)?;
    }
    Ok(dst)
}

/// Allocate a fresh pair and build into its first block
fn write_pair(
    bd: &mut Bd,
    alloc: &mut Allocator,
    build: &mut dyn FnMut(&mut Bd, u32) -> Result<Rbyd>,
) -> Result<(MdirPair, Rbyd)> {
    loop {
        let a = alloc.alloc(bd, true)?;
        let b = alloc.alloc(bd, true)?;
        match build(bd, a) {
            Ok(rbyd) => return Ok((MdirPair([a, b]), rbyd)),
            Err(err) if err.is_corrupt() => {
                log::warn!("mdir: block {} rejected a write, relocating", a);
                bd.drop_caches();
            }
            Err(err) => return Err(err),
        }
    }
}

/// Split mattrs, written against the whole mdir, between halves at `split`
///
/// Returns the lower and upper mattrs, the final split rid, and any rid -1
/// mattrs when `hold_root` keeps them out of both halves.
fn route(mattrs: &[Mattr], split: Rid, hold_root: bool) -> (Vec<Mattr>, Vec<Mattr>, Rid, Vec<Mattr>) {
    let (mut lo, mut hi, mut root) = (Vec::new(), Vec::new(), Vec::new());
    let mut s = split;
    for m in mattrs {
        let rid = m.rid();
        if rid < 0 {
            if hold_root {
                root.push(m.clone());
            } else {
                lo.push(m.clone());
            }
        } else if rid < s {
            lo.push(m.clone());
            s += m.delta();
        } else {
            hi.push(m.shifted(s));
        }
    }
    (lo, hi, s, root)
}

impl Meta {
    /// Write an empty filesystem: an anchor holding the config
    pub fn format(bd: &mut Bd, cfg: &FsConfig) -> Result<()> {
        bd.erase(ANCHOR.0[0])?;
        bd.erase(ANCHOR.0[1])?;
        Rbyd::build(bd, ANCHOR.0[0], 0, &config_rattrs(cfg))?;
        bd.sync()
    }

    pub fn mount(bd: &mut Bd, cfg: &FsConfig) -> Result<Meta> {
        let anchor = Mdir::fetch(bd, ANCHOR, 0)?;
        Self::check_config(bd, &anchor.rbyd, cfg)?;

        let mut chain = vec![anchor];
        loop {
            let last = chain[chain.len() - 1];
            let pair = match last.rbyd.lookup(bd, -1, tag::MROOT) {
                Ok(f) => MdirPair::decode(&f.read(bd)?)?,
                Err(FsError::NotFound) => break,
                Err(err) => return Err(err),
            };
            if chain.len() as u32 > cfg.block_count / 2 {
                return Err(FsError::corrupt("mroot chain loops"));
            }
            chain.push(Mdir::fetch(bd, pair, 0)?);
        }

        let mroot = chain[chain.len() - 1];
        let mtree = match mroot.rbyd.lookup(bd, -1, tag::MTREE) {
            Ok(f) => Some(Btree::from_ref(BtreeRef::decode(&f.read(bd)?)?)),
            Err(FsError::NotFound) => None,
            Err(err) => return Err(err),
        };

        let mut meta = Meta {
            chain,
            mtree,
            gstate: Gstate::default(),
            gdisk: Gdelta::default(),
            mbits: cfg.mbits(),
            recycles: cfg.block_recycles,
        };
        let mut gdisk = Gdelta::default();
        let mut seen = Vec::new();
        let mut mdirs = meta.chain.clone();
        if meta.mtree.is_some() {
            mdirs.extend(meta.mdirs(bd)?);
        }
        for m in &mdirs {
            gdisk = gdisk.xor(&Gdelta::read(bd, &m.rbyd)?);
            seen.push(read_gcksum(bd, &m.rbyd)?);
        }
        // the last mdir to commit recorded the gcksum it left behind
        if !seen.contains(&gdisk.gcksum) {
            return Err(FsError::corrupt(format!(
                "gcksum {:08x} matches no mdir, metadata was rolled back",
                gdisk.gcksum
            )));
        }
        meta.gdisk = gdisk;
        meta.gstate = Gstate::from_delta(&gdisk)?;
        debug_log!(
            "mdir: mounted, chain of {}, mtree {:?}, grm {:?}",
            meta.chain.len(),
            meta.mtree.map(|t| t.block),
            meta.gstate.grm
        );
        Ok(meta)
    }

    fn check_config(bd: &mut Bd, rbyd: &Rbyd, cfg: &FsConfig) -> Result<()> {
        let magic = rbyd.lookup(bd, -1, tag::MAGIC)?.read(bd)?;
        if magic != MAGIC {
            return Err(FsError::corrupt("bad magic"));
        }
        let version = rbyd.lookup(bd, -1, tag::VERSION)?.read(bd)?;
        let mut d = crate::rbyd::codec::Decoder::new(&version);
        let major = d.leb128(32)?;
        if major != DISK_VERSION.0 {
            return Err(FsError::Invalid(format!("unsupported disk version {}", major)));
        }
        let g = Geometry::decode(&rbyd.lookup(bd, -1, tag::GEOMETRY)?.read(bd)?)?;
        if g.block_size != cfg.block_size || g.block_count != cfg.block_count {
            return Err(FsError::Invalid(format!(
                "geometry {}x{} does not match config {}x{}",
                g.block_size, g.block_count, cfg.block_size, cfg.block_count
            )));
        }
        Ok(())
    }

    pub fn mroot(&self) -> &Mdir {
        &self.chain[self.chain.len() - 1]
    }

    pub fn span(&self) -> Mid {
        1 << self.mbits
    }

    /// Every mdir holding entries, in mid order
    pub fn mdirs(&self, bd: &mut Bd) -> Result<Vec<Mdir>> {
        let tree = match self.mtree {
            None => return Ok(vec![*self.mroot()]),
            Some(t) => t,
        };
        let mut out = Vec::new();
        let mut t = Traversal::new();
        while let Some(v) = tree.traverse(bd, &mut t)? {
            if let Visit::Entry(e) = v {
                let pair = MdirPair::decode(&e.lookup(bd, tag::MDIR)?.read(bd)?)?;
                out.push(Mdir::fetch(bd, pair, e.start())?);
            }
        }
        Ok(out)
    }

    /// Mdir holding `mid`
    pub fn lookup_mid(&self, bd: &mut Bd, mid: Mid) -> Result<Mdir> {
        match self.mtree {
            None if mid >= 0 && mid < self.span() => Ok(*self.mroot()),
            None => Err(FsError::NotFound),
            Some(t) => {
                let e = t.lookup(bd, mid)?;
                let pair = MdirPair::decode(&e.lookup(bd, tag::MDIR)?.read(bd)?)?;
                Mdir::fetch(bd, pair, e.start())
            }
        }
    }

    /// Mdir after `mdir` in mid order
    pub fn next_mdir(&self, bd: &mut Bd, mdir: &Mdir) -> Result<Option<Mdir>> {
        match self.mtree {
            Some(t) if mdir.mid + self.span() < t.weight as Mid => Ok(Some(self.lookup_mid(bd, mdir.mid + self.span())?)),
            _ => Ok(None),
        }
    }

    /// Mdir and rid where (did, name) lives or would be inserted
    pub fn namelookup(&self, bd: &mut Bd, did: u32, name: &[u8]) -> Result<(Mdir, Rid, bool)> {
        let mdir = match self.mtree {
            None => *self.mroot(),
            Some(t) => match t.namelookup(bd, did, name)? {
                Some((e, _)) => {
                    let pair = MdirPair::decode(&e.lookup(bd, tag::MDIR)?.read(bd)?)?;
                    Mdir::fetch(bd, pair, e.start())?
                }
                None => return Err(FsError::corrupt("empty mtree")),
            },
        };
        let (rid, exact) = mdir.namelookup(bd, did, name)?;
        Ok((mdir, rid, exact))
    }

    /// Blocks held by metadata: every pair, the mtree's nodes
    pub fn blocks(&self, bd: &mut Bd, out: &mut RoaringBitmap) -> Result<()> {
        for m in &self.chain {
            out.insert(m.pair.0[0]);
            out.insert(m.pair.0[1]);
        }
        if let Some(t) = self.mtree {
            for block in t.blocks(bd)? {
                out.insert(block);
            }
            for m in self.mdirs(bd)? {
                out.insert(m.pair.0[0]);
                out.insert(m.pair.0[1]);
            }
        }
        Ok(())
    }

    /// Commit mattrs to `mdir` and carry any structural change up to the
    /// anchor; returns how mids moved
    ///
    /// On error `self` is left exactly as it was.
    pub fn commit(&mut self, bd: &mut Bd, alloc: &mut Allocator, mdir: &Mdir, mattrs: &[Mattr]) -> Result<Remap> {
        let saved = self.clone();
        let res = self.commit_all(bd, alloc, mdir, mattrs);
        if res.is_err() {
            *self = saved;
        }
        res
    }

    fn commit_all(&mut self, bd: &mut Bd, alloc: &mut Allocator, mdir: &Mdir, mattrs: &[Mattr]) -> Result<Remap> {
        let span = self.span();
        let mut remap = Remap {
            span,
            changes: Vec::new(),
        };
        for m in mattrs {
            if let Mattr::Attr(rid, r) = m {
                if *rid >= 0 && r.delta() != 0 {
                    let c = Change::Shift {
                        base: mdir.mid,
                        rid: *rid,
                        delta: r.delta(),
                    };
                    self.remap_grm(span, c);
                    remap.changes.push(c);
                }
            }
        }
        let is_root = mdir.pair.contains(self.mroot().block());

        let mut attrs = if is_root {
            mattrs.to_vec()
        } else {
            let mut tree = self.mtree.ok_or_else(|| FsError::corrupt("mdir outside an mtree"))?;
            let job = Job {
                can_split: true,
                can_drop: tree.weight as Mid > span,
                ..Job::default()
            };
            let leaf_end = mdir.mid + span - 1;
            match self.commit_mdir(bd, alloc, mdir, mattrs, job)? {
                Landed::Kept(_) => return Ok(remap),
                Landed::Relocated(m) => {
                    debug_log!("mdir: {:?} relocated to {:?}", mdir.pair, m.pair);
                    tree.commit(bd, alloc, &[(leaf_end, Rattr::new(tag::MDIR, 0, pair_data(m.pair)))])?;
                }
                Landed::Split(lo, hi, at, _) => {
                    debug_log!("mdir: {:?} split at rid {} into {:?} {:?}", mdir.pair, at, lo.pair, hi.pair);
                    let rattrs = vec![
                        (leaf_end, Rattr::rm_range(span as u32)),
                        (mdir.mid, Rattr::new(tag::BNAME, span, first_name(bd, &lo)?)),
                        (leaf_end, Rattr::new(tag::MDIR, 0, pair_data(lo.pair))),
                        (mdir.mid + span, Rattr::new(tag::BNAME, span, first_name(bd, &hi)?)),
                        (leaf_end + span, Rattr::new(tag::MDIR, 0, pair_data(hi.pair))),
                    ];
                    tree.commit(bd, alloc, &rattrs)?;
                    let c = Change::Split { base: mdir.mid, at };
                    self.remap_grm(span, c);
                    remap.changes.push(c);
                }
                Landed::Dropped => {
                    debug_log!("mdir: dropping empty {:?}", mdir.pair);
                    tree.commit(bd, alloc, &[(leaf_end, Rattr::rm_range(span as u32))])?;
                    let c = Change::Drop { base: mdir.mid };
                    self.remap_grm(span, c);
                    remap.changes.push(c);
                }
                Landed::Extended(..) => return Err(FsError::corrupt("leaf mdir extended the chain")),
            }
            self.mtree = Some(tree);
            vec![Mattr::Attr(-1, Rattr::new(tag::MTREE, 0, btree_data(&tree)))]
        };

        let mut i = self.chain.len() - 1;
        let mut trim = false;
        loop {
            let cur = self.chain[i];
            let root = i == self.chain.len() - 1;
            let job = Job {
                can_split: root && self.mtree.is_none() && !trim,
                can_drop: false,
                anchor: i == 0,
                root,
                trim,
            };
            match self.commit_mdir(bd, alloc, &cur, &attrs, job)? {
                Landed::Kept(m) => {
                    self.chain[i] = m;
                    break;
                }
                Landed::Relocated(m) => {
                    debug_log!("mdir: mroot link {:?} relocated to {:?}", cur.pair, m.pair);
                    self.chain[i] = m;
                    if i == 0 {
                        return Err(FsError::corrupt("anchor relocated"));
                    }
                    i -= 1;
                    trim = false;
                    attrs = vec![Mattr::Attr(-1, Rattr::new(tag::MROOT, 0, pair_data(m.pair)))];
                }
                Landed::Extended(anchor, mroot) => {
                    debug_log!("mdir: anchor extended the chain with {:?}", mroot.pair);
                    self.chain[0] = anchor;
                    self.chain.insert(1, mroot);
                    break;
                }
                Landed::Split(lo, hi, at, rest) => {
                    // the mroot's entries move into a fresh mtree
                    let rattrs = vec![
                        (0, Rattr::new(tag::BNAME, span, first_name(bd, &lo)?)),
                        (span - 1, Rattr::new(tag::MDIR, 0, pair_data(lo.pair))),
                        (span, Rattr::new(tag::BNAME, span, first_name(bd, &hi)?)),
                        (2 * span - 1, Rattr::new(tag::MDIR, 0, pair_data(hi.pair))),
                    ];
                    let mut tree = Btree::default();
                    tree.commit(bd, alloc, &rattrs)?;
                    debug_log!("mdir: mroot split into an mtree at {}", tree.block);
                    self.mtree = Some(tree);
                    let c = Change::Split { base: 0, at };
                    self.remap_grm(span, c);
                    remap.changes.push(c);
                    attrs = rest;
                    attrs.push(Mattr::Attr(-1, Rattr::new(tag::MTREE, 0, btree_data(&tree))));
                    trim = true;
                }
                Landed::Dropped => return Err(FsError::corrupt("mroot dropped")),
            }
        }
        Ok(remap)
    }

    fn remap_grm(&mut self, span: Mid, c: Change) {
        self.gstate.grm.remap(&|m| c.apply(span, m));
    }

    /// Commit to one mdir, folding the pending global-state change into it
    fn commit_mdir(&mut self, bd: &mut Bd, alloc: &mut Allocator, mdir: &Mdir, mattrs: &[Mattr], job: Job) -> Result<Landed> {
        let old = Gdelta::read(bd, &mdir.rbyd)?;
        let weight = mdir.weight() as i64 + mattrs.iter().map(|m| m.delta() as i64).sum::<i64>();
        if job.can_drop && weight == 0 {
            self.gdisk = self.gdisk.xor(&old);
            self.gstate.gcksum = self.gdisk.gcksum;
            return Ok(Landed::Dropped);
        }

        let adjust = Gdelta {
            grm: self.gstate.to_delta().xor(&self.gdisk).grm,
            gcksum: mdir.rbyd.cksum,
        };
        let mut all = mattrs.to_vec();
        all.extend(old.xor(&adjust).rattrs().into_iter().map(|(rid, r)| Mattr::Attr(rid, r)));
        let gcksum = self.gdisk.xor(&adjust).gcksum;
        all.push(Mattr::Attr(-1, Rattr::buf(tag::GCKSUM, 0, gcksum.to_le_bytes().to_vec())));

        let landed = self.land(bd, alloc, mdir, mattrs, &all, job)?;
        // a split mroot leaves its deltas for the follow-up commit
        if !(job.root && matches!(landed, Landed::Split(..))) {
            self.gdisk = self.gdisk.xor(&adjust);
            self.gstate.gcksum = self.gdisk.gcksum;
        }
        Ok(landed)
    }

    fn land(&mut self, bd: &mut Bd, alloc: &mut Allocator, mdir: &Mdir, mattrs: &[Mattr], all: &[Mattr], job: Job) -> Result<Landed> {
        // rids must stay below the mid span
        let after = mdir.weight() as i64 + mattrs.iter().map(|m| m.delta() as i64).sum::<i64>();
        let crowded = after >= self.span() as i64;
        if !job.trim && !crowded && mdir.rbyd.is_erased() {
            let mut next = mdir.rbyd;
            match apply_mattrs(bd, &mut next, all) {
                Ok(()) => return Ok(Landed::Kept(Mdir { rbyd: next, ..*mdir })),
                Err(err) if err.is_range() || err.is_corrupt() => {
                    debug_log!("mdir: {:?} needs compaction ({})", mdir.pair, err);
                }
                Err(err) => return Err(err),
            }
        }

        if job.can_split {
            if let Some(s) = self.split_point(bd, mdir, true)? {
                return self.split(bd, alloc, mdir, mattrs, all, s, job);
            }
        }
        let end = if job.trim { 0 } else { mdir.weight() as Rid };
        match self.compact_pair(bd, alloc, mdir, all, end, job) {
            Err(FsError::Range) if job.can_split => match self.split_point(bd, mdir, false)? {
                Some(s) => self.split(bd, alloc, mdir, mattrs, all, s, job),
                None => Err(FsError::Range),
            },
            res => res,
        }
    }

    /// Rid to split at, if the mdir is over half a block (or at all when
    /// `only_if_big` is false)
    fn split_point(&self, bd: &mut Bd, mdir: &Mdir, only_if_big: bool) -> Result<Option<Rid>> {
        if mdir.weight() < 2 {
            return Ok(None);
        }
        let block = mdir.rbyd.block;
        let est = Rbyd::estimate_tree(bd, block, mdir.rbyd.tree(), -1, mdir.weight() as Rid, &mut |bd, f| {
            if f.tag != tag::BSHRUB {
                return Ok(0);
            }
            let r = ShrubRef::decode(&f.read(bd)?)?;
            Bstruct::Shrub {
                block,
                tree: Tree {
                    trunk: r.trunk,
                    weight: r.weight,
                },
            }
            .estimate(bd)
        })?;
        if only_if_big && est.size <= bd.block_size() / 2 && (mdir.weight() as Mid) < self.span() - 1 {
            return Ok(None);
        }
        Ok(est.split.map(|s| s.max(1)))
    }

    /// Compact into the sibling block, or move to a fresh pair when the
    /// pair is due for recycling or the sibling is bad
    fn compact_pair(&mut self, bd: &mut Bd, alloc: &mut Allocator, mdir: &Mdir, all: &[Mattr], end: Rid, job: Job) -> Result<Landed> {
        let rev = mdir.rbyd.rev.wrapping_add(1);
        let recycle = self.recycles >= 0 && rev % (self.recycles as u32 + 1) == 0;
        if !recycle {
            let other = mdir.pair.0[1];
            let res = bd
                .erase(other)
                .and_then(|_| rebuild(bd, &mdir.rbyd, other, rev, (-1, end), all));
            match res {
                Ok(rbyd) => {
                    return Ok(Landed::Kept(Mdir {
                        pair: mdir.pair.swapped(),
                        rbyd,
                        mid: mdir.mid,
                    }))
                }
                Err(err) if err.is_corrupt() => {
                    log::warn!("mdir: block {} rejected compaction, relocating", other);
                    bd.drop_caches();
                }
                Err(err) => return Err(err),
            }
        }

        if job.anchor {
            return self.extend(bd, alloc, mdir, all, end, rev);
        }
        let (pair, rbyd) = write_pair(bd, alloc, &mut |bd, block| rebuild(bd, &mdir.rbyd, block, rev, (-1, end), all))?;
        Ok(Landed::Relocated(Mdir {
            pair,
            rbyd,
            mid: mdir.mid,
        }))
    }

    /// Move the anchor's contents into a new mroot, leaving the anchor with
    /// its config and a pointer
    fn extend(&mut self, bd: &mut Bd, alloc: &mut Allocator, anchor: &Mdir, all: &[Mattr], end: Rid, rev: u32) -> Result<Landed> {
        let (pair, rbyd) = write_pair(bd, alloc, &mut |bd, block| rebuild(bd, &anchor.rbyd, block, rev, (-1, end), all))?;

        let mut rattrs: Vec<(Rid, Rattr)> = anchor
            .rbyd
            .leaves(bd, -1, 0)?
            .into_iter()
            .filter(|f| tag::category(f.tag) == tag::CONFIG)
            .map(|f| (-1, Rattr::new(f.tag, 0, f.data())))
            .collect();
        rattrs.push((-1, Rattr::new(tag::MROOT, 0, pair_data(pair))));
        let other = anchor.pair.0[1];
        bd.erase(other)?;
        let head = Rbyd::build(bd, other, rev, &rattrs)?;
        Ok(Landed::Extended(
            Mdir {
                pair: anchor.pair.swapped(),
                rbyd: head,
                mid: 0,
            },
            Mdir { pair, rbyd, mid: 0 },
        ))
    }

    /// Write both halves of an mdir to fresh pairs
    #[allow(clippy::too_many_arguments)]
    fn split(&mut self, bd: &mut Bd, alloc: &mut Allocator, mdir: &Mdir, mattrs: &[Mattr], all: &[Mattr], s: Rid, job: Job) -> Result<Landed> {
        let (lo_attrs, hi_attrs, at, rest) = if job.root {
            route(mattrs, s, true)
        } else {
            route(all, s, false)
        };
        let lo_start = if job.root { 0 } else { -1 };
        let w = mdir.weight() as Rid;
        let rev = mdir.rbyd.rev.wrapping_add(1);
        let (lo_pair, lo) = write_pair(bd, alloc, &mut |bd, block| rebuild(bd, &mdir.rbyd, block, rev, (lo_start, s), &lo_attrs))?;
        let (hi_pair, hi) = write_pair(bd, alloc, &mut |bd, block| rebuild(bd, &mdir.rbyd, block, rev, (s, w), &hi_attrs))?;
        Ok(Landed::Split(
            Mdir {
                pair: lo_pair,
                rbyd: lo,
                mid: mdir.mid,
            },
            Mdir {
                pair: hi_pair,
                rbyd: hi,
                mid: mdir.mid + self.span(),
            },
            at,
            rest,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbyd::codec::{decode_name, encode_name};
    use crate::storage::bd::{BlockDevice, RamBlockDevice};

    fn setup(cfg: &FsConfig) -> (Bd, Allocator, Meta) {
        let ram = RamBlockDevice::new(cfg.block_size, cfg.block_count);
        let mut bd = Bd::new(Box::new(ram), cfg).unwrap();
        Meta::format(&mut bd, cfg).unwrap();
        let meta = Meta::mount(&mut bd, cfg).unwrap();
        let mut alloc = Allocator::new(cfg.block_count, cfg.block_count, 0);
        refill(&mut bd, &mut alloc, &meta);
        (bd, alloc, meta)
    }

    fn refill(bd: &mut Bd, alloc: &mut Allocator, meta: &Meta) {
        let mut inuse = RoaringBitmap::new();
        meta.blocks(bd, &mut inuse).unwrap();
        alloc.refill(&inuse);
    }

    /// Commit, reclaiming blocks and retrying from the old state on NoSpace
    fn commit(bd: &mut Bd, alloc: &mut Allocator, meta: &mut Meta, mdir: &Mdir, mattrs: &[Mattr]) -> Remap {
        for _ in 0..2 {
            match meta.commit(bd, alloc, mdir, mattrs) {
                Ok(remap) => {
                    alloc.ckpoint();
                    return remap;
                }
                Err(FsError::NoSpace(_)) => {
                    alloc.rollback();
                    refill(bd, alloc, meta);
                }
                Err(err) => panic!("commit failed: {}", err),
            }
        }
        panic!("out of space");
    }

    fn name(did: u32, s: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_name(&mut buf, did, s.as_bytes());
        buf
    }

    fn insert(bd: &mut Bd, alloc: &mut Allocator, meta: &mut Meta, s: &str) {
        let (mdir, rid, exact) = meta.namelookup(bd, 1, s.as_bytes()).unwrap();
        assert!(!exact, "{} already present", s);
        let mattrs = vec![Mattr::Attr(rid, Rattr::buf(tag::REG, 1, name(1, s)))];
        commit(bd, alloc, meta, &mdir, &mattrs);
    }

    fn remove(bd: &mut Bd, alloc: &mut Allocator, meta: &mut Meta, s: &str) {
        let (mdir, rid, exact) = meta.namelookup(bd, 1, s.as_bytes()).unwrap();
        assert!(exact, "{} missing", s);
        commit(bd, alloc, meta, &mdir, &[Mattr::Attr(rid, Rattr::rm_range(1))]);
    }

    /// Every entry in mid order, checking each mid resolves back to it
    fn listing(bd: &mut Bd, meta: &Meta) -> Vec<String> {
        let mut out = Vec::new();
        for m in meta.mdirs(bd).unwrap() {
            for rid in 0..m.weight() as Rid {
                let f = m.rbyd.lookup_next(bd, rid, 0).unwrap();
                let buf = f.read(bd).unwrap();
                let (_, n) = decode_name(&buf).unwrap();
                let s = String::from_utf8(n.to_vec()).unwrap();
                let again = meta.lookup_mid(bd, m.mid + rid).unwrap();
                assert_eq!(again.pair, m.pair);
                out.push(s);
            }
        }
        out
    }

    #[test]
    fn test_format_and_mount() {
        let cfg = FsConfig::small_test();
        let (mut bd, _, meta) = setup(&cfg);
        assert_eq!(meta.chain.len(), 1);
        assert!(meta.mtree.is_none());
        assert_eq!(meta.gstate, Gstate::default());
        assert_eq!(meta.mroot().weight(), 0);

        let mut other = FsConfig::small_test();
        other.block_count = 256;
        assert!(Meta::mount(&mut bd, &other).is_err());
    }

    #[test]
    fn test_remap() {
        let remap = Remap {
            span: 64,
            changes: vec![
                Change::Shift {
                    base: 64,
                    rid: 5,
                    delta: -1,
                },
                Change::Split { base: 64, at: 10 },
                Change::Drop { base: 256 },
            ],
        };
        assert_eq!(remap.apply(64 + 5), None);
        assert_eq!(remap.apply(64 + 6), Some(64 + 5));
        assert_eq!(remap.apply(3), Some(3));
        assert_eq!(remap.apply(64 + 10), Some(64 + 9));
        assert_eq!(remap.apply(64 + 11), Some(128));
        assert_eq!(remap.apply(130), Some(194));
        // 192 moved to 256 by the split, then that mdir was dropped
        assert_eq!(remap.apply(192), None);
        assert_eq!(remap.apply(260), Some(260));

        // cursors on removed entries land on the next survivor
        assert_eq!(remap.slide(64 + 5), 64 + 5);
        assert_eq!(remap.slide(64 + 6), 64 + 5);
        assert_eq!(remap.slide(192), 256);
        assert_eq!(remap.slide(260), 260);
    }

    #[test]
    fn test_entries_grow_an_mtree() {
        let cfg = FsConfig::small_test();
        let (mut bd, mut alloc, mut meta) = setup(&cfg);
        let mut names: Vec<String> = (0..300).map(|i| format!("file{:04}", (i * 7919) % 10007)).collect();
        for n in &names {
            insert(&mut bd, &mut alloc, &mut meta, n);
        }
        names.sort();
        assert!(meta.mtree.is_some());
        assert!(meta.mtree.unwrap().weight as Mid >= 4 * meta.span());
        assert_eq!(meta.mroot().weight(), 0);
        assert_eq!(listing(&mut bd, &meta), names);

        let remounted = Meta::mount(&mut bd, &cfg).unwrap();
        assert_eq!(remounted.mtree, meta.mtree);
        assert_eq!(listing(&mut bd, &remounted), names);
        assert_eq!(remounted.gstate, meta.gstate);
        meta.mtree.unwrap().validate(&mut bd).unwrap();
    }

    #[test]
    fn test_removal_drops_mdirs() {
        let cfg = FsConfig::small_test();
        let (mut bd, mut alloc, mut meta) = setup(&cfg);
        let names: Vec<String> = (0..200).map(|i| format!("n{:03}", i)).collect();
        for n in &names {
            insert(&mut bd, &mut alloc, &mut meta, n);
        }
        let before = meta.mtree.unwrap().weight;
        for n in &names[..190] {
            remove(&mut bd, &mut alloc, &mut meta, n);
        }
        let after = meta.mtree.unwrap().weight;
        assert!(after < before, "no mdir dropped ({} -> {})", before, after);
        assert_eq!(listing(&mut bd, &meta), names[190..].to_vec());

        let remounted = Meta::mount(&mut bd, &cfg).unwrap();
        assert_eq!(listing(&mut bd, &remounted), names[190..].to_vec());
        assert_eq!(remounted.gstate, meta.gstate);
    }

    #[test]
    fn test_anchor_extends_chain() {
        let mut cfg = FsConfig::small_test();
        cfg.block_recycles = 0;
        let (mut bd, mut alloc, mut meta) = setup(&cfg);
        for i in 0..40 {
            let n = format!("e{}", i);
            insert(&mut bd, &mut alloc, &mut meta, &n);
            let (mdir, rid, _) = meta.namelookup(&mut bd, 1, n.as_bytes()).unwrap();
            let attr = Rattr::buf(tag::ATTR, 0, vec![i as u8; 60]);
            commit(&mut bd, &mut alloc, &mut meta, &mdir, &[Mattr::Attr(rid, attr)]);
        }
        assert!(meta.chain.len() >= 2, "chain never grew");

        let remounted = Meta::mount(&mut bd, &cfg).unwrap();
        assert_eq!(remounted.chain.len(), meta.chain.len());
        assert_eq!(remounted.mroot().pair, meta.mroot().pair);
        assert_eq!(listing(&mut bd, &remounted).len(), 40);
        // anchor still answers mount checks on its own
        let anchor = Mdir::fetch(&mut bd, ANCHOR, 0).unwrap();
        assert!(anchor.rbyd.lookup(&mut bd, -1, tag::MAGIC).is_ok());
        assert!(anchor.rbyd.lookup(&mut bd, -1, tag::MROOT).is_ok());
    }

    #[test]
    fn test_grm_survives_splits_and_remount() {
        let cfg = FsConfig::small_test();
        let (mut bd, mut alloc, mut meta) = setup(&cfg);
        for i in 0..20 {
            insert(&mut bd, &mut alloc, &mut meta, &format!("a{:02}", i));
        }
        // mark a{15} for removal, then push it to another mdir with splits
        let (mdir, rid, _) = meta.namelookup(&mut bd, 1, b"a15").unwrap();
        meta.gstate.grm.push(mdir.mid + rid).unwrap();
        let root = *meta.mroot();
        commit(&mut bd, &mut alloc, &mut meta, &root, &[]);

        for i in 0..150 {
            insert(&mut bd, &mut alloc, &mut meta, &format!("a{:02}x{}", i % 15, i));
        }
        let mid = meta.gstate.grm.mids().next().unwrap();
        let mdir = meta.lookup_mid(&mut bd, mid).unwrap();
        let f = mdir.rbyd.lookup_next(&mut bd, mid - mdir.mid, 0).unwrap();
        let buf = f.read(&mut bd).unwrap();
        assert_eq!(decode_name(&buf).unwrap().1, b"a15");

        let remounted = Meta::mount(&mut bd, &cfg).unwrap();
        assert_eq!(remounted.gstate, meta.gstate);
    }

    #[test]
    fn test_failed_commit_leaves_meta_untouched() {
        let cfg = FsConfig::small_test();
        let (mut bd, mut alloc, mut meta) = setup(&cfg);
        insert(&mut bd, &mut alloc, &mut meta, "a");
        meta.gstate.grm.push(0).unwrap();
        let before = meta.clone();

        // an entry bigger than a block shifts the pending mid, then fails
        let mroot = *meta.mroot();
        let huge = Rattr::buf(tag::REG, 1, vec![0x11; cfg.block_size as usize]);
        let err = meta.commit(&mut bd, &mut alloc, &mroot, &[Mattr::Attr(0, huge)]).unwrap_err();
        assert!(err.is_range(), "{}", err);
        assert_eq!(meta.gstate, before.gstate);
        assert_eq!(meta.gstate.grm.mids().collect::<Vec<_>>(), vec![0]);
        assert_eq!(meta.gdisk, before.gdisk);
        assert_eq!(meta.chain, before.chain);
        assert_eq!(meta.mtree, before.mtree);

        // and the next commit goes through from the same state
        alloc.rollback();
        meta.gstate.grm.remove(0);
        insert(&mut bd, &mut alloc, &mut meta, "b");
        assert_eq!(listing(&mut bd, &meta), vec!["a", "b"]);
    }

    #[test]
    fn test_mount_rejects_rolled_back_mdir() {
        let mut cfg = FsConfig::small_test();
        cfg.block_recycles = -1;
        let ram = RamBlockDevice::new(cfg.block_size, cfg.block_count);
        let mut bd = Bd::new(Box::new(ram.clone()), &cfg).unwrap();
        Meta::format(&mut bd, &cfg).unwrap();
        let mut meta = Meta::mount(&mut bd, &cfg).unwrap();
        let mut alloc = Allocator::new(cfg.block_count, cfg.block_count, 0);
        refill(&mut bd, &mut alloc, &meta);
        for i in 0..120 {
            insert(&mut bd, &mut alloc, &mut meta, &format!("a{:03}", i));
        }
        assert!(meta.mdirs(&mut bd).unwrap().len() >= 2);

        let (first, _, _) = meta.namelookup(&mut bd, 1, b"a000").unwrap();
        bd.sync().unwrap();
        let saved: Vec<_> = first.pair.0.iter().map(|&b| (b, ram.snapshot(b))).collect();

        // one commit to the first mdir, then one to the last
        insert(&mut bd, &mut alloc, &mut meta, "a0000");
        let (again, _, _) = meta.namelookup(&mut bd, 1, b"a0000").unwrap();
        assert!(again.pair.contains(first.pair.0[0]) && again.pair.contains(first.pair.0[1]));
        insert(&mut bd, &mut alloc, &mut meta, "z");
        bd.sync().unwrap();
        Meta::mount(&mut bd, &cfg).unwrap();

        // the first mdir loses its commit behind the later one's back
        let mut dev = ram.clone();
        for (b, image) in &saved {
            dev.erase(*b).unwrap();
            dev.prog(*b, 0, image).unwrap();
        }
        bd.drop_caches();
        let err = Meta::mount(&mut bd, &cfg).unwrap_err();
        assert!(err.is_corrupt(), "{}", err);
    }

    #[test]
    fn test_gcksum_tracks_commits() {
        let cfg = FsConfig::small_test();
        let (mut bd, mut alloc, mut meta) = setup(&cfg);
        let start = meta.gstate.gcksum;
        insert(&mut bd, &mut alloc, &mut meta, "x");
        assert_ne!(meta.gstate.gcksum, start);
        let remounted = Meta::mount(&mut bd, &cfg).unwrap();
        assert_eq!(remounted.gstate.gcksum, meta.gstate.gcksum);
    }
}
