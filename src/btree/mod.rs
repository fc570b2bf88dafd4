//! Weighted B-tree built from rbyds
//!
//! ## 结构
//! ```text
//! root rbyd:   [bname? branch]  [bname? branch] ...     <- one entry per child
//!                  |                 |
//! leaf rbyds:  [entry][entry]   [entry][entry] ...      <- caller records
//! ```
//!
//! Every entry carries a weight; a child's entry weight is the total weight
//! of the child, so bids map continuously across leaves. Named trees keep a
//! `BNAME` on each branch entry (the first name of the child) for
//! [`Btree::namelookup`].
//!
//! ## Commit
//! An edit lands in one leaf. Nodes are appended to in place while their
//! block has room; otherwise they are compacted into a fresh block, split
//! when the compacted size passes half a block, or merged with a sibling
//! when small. Parent updates are carried upwards in a loop until one level
//! absorbs them, growing a new root or collapsing a single-child root.

pub mod bshrub;

use crate::rbyd::codec::{decode_name, BranchRef, BtreeRef};
use crate::rbyd::tag::{self, Rid};
use crate::rbyd::{Data, Found, Rattr, Rbyd};
use crate::storage::alloc::Allocator;
use crate::storage::cache::Bd;
use crate::{FsError, Result};
use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};

/// Root reference; an empty tree has no root block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Btree {
    pub weight: u32,
    pub block: u32,
    pub trunk: u32,
    pub cksum: u32,
}

/// One leaf entry, located by its last bid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub bid: Rid,
    pub weight: u32,
    pub leaf: Rbyd,
    /// Rid of the entry inside `leaf`
    pub rid: Rid,
}

impl Entry {
    pub fn start(&self) -> Rid {
        self.bid - self.weight as Rid + 1
    }

    /// Weight-bearing record of the entry
    pub fn first(&self, bd: &mut Bd) -> Result<Found> {
        self.leaf.lookup_next(bd, self.rid, 0)
    }

    pub fn lookup(&self, bd: &mut Bd, tag_: tag::Tag) -> Result<Found> {
        self.leaf.lookup(bd, self.rid, tag_)
    }
}

/// What a traversal yields, nodes before the entries under them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Node(Rbyd),
    Entry(Entry),
}

/// Resumable traversal state
#[derive(Debug, Clone, Default)]
pub struct Traversal {
    bid: Rid,
    pending: VecDeque<Visit>,
}

impl Traversal {
    pub fn new() -> Self {
        Self::default()
    }
}

struct Step {
    node: Rbyd,
    /// Entry of the child we came from
    rid: Rid,
    weight: u32,
}

/// Order an entry's name against (did, name)
pub(crate) fn cmp_name(bd: &mut Bd, found: &Found, did: u32, name: &[u8]) -> Result<Ordering> {
    if tag::category(found.tag) != tag::NAME {
        return Err(FsError::Invalid(format!(
            "entry {} has no name ({})",
            found.rid,
            tag::name(found.tag)
        )));
    }
    let buf = found.read(bd)?;
    let (d, n) = decode_name(&buf)?;
    Ok((d, n).cmp(&(did, name)))
}

/// Binary search one rbyd for the last entry whose name is <= (did, name)
///
/// Falls back to the first entry, ordered `Greater`, when every name is
/// larger.
pub(crate) fn search_names(bd: &mut Bd, rbyd: &Rbyd, did: u32, name: &[u8]) -> Result<Option<(Found, Ordering)>> {
    if rbyd.weight == 0 {
        return Ok(None);
    }
    let mut lo: Rid = 0;
    let mut hi: Rid = rbyd.weight as Rid;
    let mut best = None;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let f = rbyd.lookup_next(bd, mid, 0)?;
        let start = f.rid - f.weight as Rid + 1;
        let ord = cmp_name(bd, &f, did, name)?;
        if ord != Ordering::Greater {
            best = Some((f, ord));
            lo = f.rid + 1;
        } else {
            hi = start;
        }
    }
    match best {
        Some(b) => Ok(Some(b)),
        None => Ok(Some((rbyd.lookup_next(bd, 0, 0)?, Ordering::Greater))),
    }
}

/// Child referenced by a branch entry, `None` for leaf entries
fn branch_child(bd: &mut Bd, node: &Rbyd, first: &Found) -> Result<Option<Rbyd>> {
    let branch = if first.tag == tag::BRANCH {
        *first
    } else {
        match node.lookup(bd, first.rid, tag::BRANCH) {
            Ok(f) => f,
            Err(FsError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        }
    };
    let r = BranchRef::decode(&branch.read(bd)?)?;
    Ok(Some(Rbyd::at(r.block, r.trunk, first.weight, r.cksum)))
}

fn branch_data(child: &Rbyd) -> Data {
    let mut buf = Vec::new();
    BranchRef {
        block: child.block,
        trunk: child.trunk,
        cksum: child.cksum,
    }
    .encode(&mut buf);
    Data::Buf(buf)
}

/// Parent records for `children`, inserted from `pos`
fn child_rattrs(bd: &mut Bd, pos: Rid, children: &[Rbyd]) -> Result<Vec<(Rid, Rattr)>> {
    let mut out = Vec::new();
    let mut pos = pos;
    for child in children {
        let first = child.lookup_next(bd, 0, 0)?;
        let w = child.weight as i32;
        if tag::category(first.tag) == tag::NAME {
            out.push((pos, Rattr::new(tag::BNAME, w, first.data())));
            out.push((pos + w - 1, Rattr::new(tag::BRANCH, 0, branch_data(child))));
        } else {
            out.push((pos, Rattr::new(tag::BRANCH, w, branch_data(child))));
        }
        pos += w;
    }
    Ok(out)
}

/// Allocate a block and build an rbyd in it, moving on if the block is bad
pub(crate) fn alloc_rbyd(
    bd: &mut Bd,
    alloc: &mut Allocator,
    build: &mut dyn FnMut(&mut Bd, u32) -> Result<Rbyd>,
) -> Result<Rbyd> {
    loop {
        let block = alloc.alloc(bd, true)?;
        match build(bd, block) {
            Err(err) if err.is_corrupt() => {
                log::warn!("btree: block {} rejected a write, relocating", block);
                bd.drop_caches();
            }
            res => return res,
        }
    }
}

impl Btree {
    pub fn is_empty(&self) -> bool {
        self.trunk == 0
    }

    pub fn from_ref(r: BtreeRef) -> Self {
        Self {
            weight: r.weight,
            block: r.block,
            trunk: r.trunk,
            cksum: r.cksum,
        }
    }

    pub fn to_ref(&self) -> BtreeRef {
        BtreeRef {
            weight: self.weight,
            block: self.block,
            trunk: self.trunk,
            cksum: self.cksum,
        }
    }

    pub fn root(&self) -> Rbyd {
        Rbyd::at(self.block, self.trunk, self.weight, self.cksum)
    }

    fn set_root(&mut self, root: Option<&Rbyd>) {
        *self = match root {
            Some(r) => Btree {
                weight: r.weight,
                block: r.block,
                trunk: r.trunk,
                cksum: r.cksum,
            },
            None => Btree::default(),
        };
    }

    /// Walk to the leaf holding `bid`
    fn descend(&self, bd: &mut Bd, bid: Rid) -> Result<(Vec<Step>, Rbyd, Rid)> {
        let mut steps = Vec::new();
        let mut node = self.root();
        let mut lower: Rid = 0;
        loop {
            let f = node.lookup_next(bd, bid - lower, 0)?;
            match branch_child(bd, &node, &f)? {
                Some(child) => {
                    lower += f.rid - f.weight as Rid + 1;
                    steps.push(Step {
                        node,
                        rid: f.rid,
                        weight: f.weight,
                    });
                    node = child;
                }
                None => return Ok((steps, node, lower)),
            }
        }
    }

    /// Entry containing `bid`
    pub fn lookup(&self, bd: &mut Bd, bid: Rid) -> Result<Entry> {
        if self.is_empty() || bid < 0 || bid >= self.weight as Rid {
            return Err(FsError::NotFound);
        }
        let (_, leaf, lower) = self.descend(bd, bid)?;
        let f = leaf.lookup_next(bd, bid - lower, 0)?;
        Ok(Entry {
            bid: lower + f.rid,
            weight: f.weight,
            leaf,
            rid: f.rid,
        })
    }

    /// Last entry named <= (did, name), with how it compares
    pub fn namelookup(&self, bd: &mut Bd, did: u32, name: &[u8]) -> Result<Option<(Entry, Ordering)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut node = self.root();
        let mut lower: Rid = 0;
        loop {
            let (f, ord) = match search_names(bd, &node, did, name)? {
                Some(hit) => hit,
                None => return Ok(None),
            };
            match branch_child(bd, &node, &f)? {
                Some(child) => {
                    lower += f.rid - f.weight as Rid + 1;
                    node = child;
                }
                None => {
                    return Ok(Some((
                        Entry {
                            bid: lower + f.rid,
                            weight: f.weight,
                            leaf: node,
                            rid: f.rid,
                        },
                        ord,
                    )))
                }
            }
        }
    }

    /// Apply `rattrs`, keyed by bid, to the leaf holding the first bid
    ///
    /// All rattrs must fall in that one leaf. On error the tree is left
    /// unchanged.
    pub fn commit(&mut self, bd: &mut Bd, alloc: &mut Allocator, rattrs: &[(Rid, Rattr)]) -> Result<()> {
        let first = match rattrs.first() {
            Some((bid, _)) => *bid,
            None => return Ok(()),
        };

        if self.is_empty() {
            let root = alloc_rbyd(bd, alloc, &mut |bd, block| Rbyd::build(bd, block, 0, rattrs))?;
            self.set_root(Some(&root).filter(|r| r.weight > 0));
            return Ok(());
        }

        let at = first.clamp(0, self.weight as Rid - 1);
        let (mut steps, leaf, lower) = self.descend(bd, at)?;
        let local: Vec<(Rid, Rattr)> = rattrs.iter().map(|(bid, r)| (bid - lower, r.clone())).collect();
        let (mut children, mut compacted) = commit_node(bd, alloc, &leaf, &local)?;

        while let Some(step) = steps.pop() {
            let mut start = step.rid - step.weight as Rid + 1;
            let mut span = step.weight;

            if compacted && children.len() == 1 && step.node.weight > step.weight {
                if let Some((merged, s, w)) = try_merge(bd, alloc, &step, &children[0])? {
                    children = vec![merged];
                    start = s;
                    span = w;
                }
            }

            let mut parent = vec![(start + span as Rid - 1, Rattr::rm_range(span))];
            parent.extend(child_rattrs(bd, start, &children)?);
            let (next, c) = commit_node(bd, alloc, &step.node, &parent)?;
            children = next;
            compacted = c;
        }

        match children.len() {
            0 => self.set_root(None),
            1 => self.set_root(Some(&children[0])),
            _ => {
                let entries = child_rattrs(bd, 0, &children)?;
                let root = alloc_rbyd(bd, alloc, &mut |bd, block| Rbyd::build(bd, block, 0, &entries))?;
                debug_log!("btree: grew a new root at {}", root.block);
                self.set_root(Some(&root));
            }
        }
        self.collapse(bd)
    }

    /// Replace a root with a single child by that child
    fn collapse(&mut self, bd: &mut Bd) -> Result<()> {
        while !self.is_empty() {
            let root = self.root();
            let f = root.lookup_next(bd, 0, 0)?;
            if f.weight != root.weight {
                break;
            }
            match branch_child(bd, &root, &f)? {
                Some(child) => {
                    debug_log!("btree: collapsing root {} into {}", root.block, child.block);
                    self.set_root(Some(&child));
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Next node or entry in bid order
    pub fn traverse(&self, bd: &mut Bd, t: &mut Traversal) -> Result<Option<Visit>> {
        if let Some(v) = t.pending.pop_front() {
            return Ok(Some(v));
        }
        if self.is_empty() || t.bid >= self.weight as Rid {
            return Ok(None);
        }

        let mut node = self.root();
        let mut lower: Rid = 0;
        loop {
            if lower == t.bid {
                t.pending.push_back(Visit::Node(node));
            }
            let f = node.lookup_next(bd, t.bid - lower, 0)?;
            match branch_child(bd, &node, &f)? {
                Some(child) => {
                    lower += f.rid - f.weight as Rid + 1;
                    node = child;
                }
                None => break,
            }
        }

        let mut rid = t.bid - lower;
        while rid < node.weight as Rid {
            let f = node.lookup_next(bd, rid, 0)?;
            t.pending.push_back(Visit::Entry(Entry {
                bid: lower + f.rid,
                weight: f.weight,
                leaf: node,
                rid: f.rid,
            }));
            rid = f.rid + 1;
        }
        t.bid = lower + node.weight as Rid;
        Ok(t.pending.pop_front())
    }

    /// Blocks of every node, in traversal order
    pub fn blocks(&self, bd: &mut Bd) -> Result<Vec<u32>> {
        let mut t = Traversal::new();
        let mut out = Vec::new();
        while let Some(v) = self.traverse(bd, &mut t)? {
            if let Visit::Node(n) = v {
                out.push(n.block);
            }
        }
        Ok(out)
    }

    /// Check structural invariants: weights add up, checksums hold, and no
    /// node is reachable twice
    pub fn validate(&self, bd: &mut Bd) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        let mut stack = vec![self.root()];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.block) {
                return Err(FsError::corrupt(format!("btree node {} reachable twice", node.block)));
            }
            let fetched = Rbyd::fetch(bd, node.block, Some((node.trunk, node.cksum)))?;
            if fetched.weight != node.weight {
                return Err(FsError::corrupt(format!(
                    "node {} weighs {}, parent says {}",
                    node.block, fetched.weight, node.weight
                )));
            }
            let mut rid = 0;
            while rid < node.weight as Rid {
                let f = node.lookup_next(bd, rid, 0)?;
                if f.weight == 0 {
                    return Err(FsError::corrupt(format!("weightless entry in node {}", node.block)));
                }
                if let Some(child) = branch_child(bd, &node, &f)? {
                    stack.push(child);
                }
                rid = f.rid + 1;
            }
        }
        Ok(())
    }
}

/// Commit to one node; returns its replacements and whether it moved
fn commit_node(bd: &mut Bd, alloc: &mut Allocator, node: &Rbyd, rattrs: &[(Rid, Rattr)]) -> Result<(Vec<Rbyd>, bool)> {
    let mut cur = match Rbyd::fetch(bd, node.block, Some((node.trunk, node.cksum))) {
        Ok(r) => r,
        Err(err) if err.is_corrupt() => {
            log::warn!("btree: node {} failed to fetch: {}", node.block, err);
            *node
        }
        Err(err) => return Err(err),
    };

    if cur.is_erased() {
        match cur.commit(bd, rattrs) {
            Ok(()) => return Ok((keep_nonempty(vec![cur]), false)),
            Err(err) if err.is_range() || err.is_corrupt() => {
                debug_log!("btree: node {} needs compaction ({})", cur.block, err);
            }
            Err(err) => return Err(err),
        }
    }

    let est = cur.estimate(bd, -1, cur.weight as Rid)?;
    let mut split = match est.split {
        Some(s) if est.size > bd.block_size() / 2 => Some(s),
        _ => None,
    };
    loop {
        match compact_node(bd, alloc, &cur, rattrs, split) {
            // the new rattrs alone can overflow a node that looked small
            Err(FsError::Range) if split.is_none() && est.split.is_some() => {
                debug_log!("btree: node {} overflowed its compaction, splitting", cur.block);
                split = est.split;
            }
            res => return res.map(|out| (keep_nonempty(out), true)),
        }
    }
}

/// Compact `cur` into one fresh node, or two when `split` is set, applying
/// `rattrs` to whichever holds the first of them
fn compact_node(bd: &mut Bd, alloc: &mut Allocator, cur: &Rbyd, rattrs: &[(Rid, Rattr)], split: Option<Rid>) -> Result<Vec<Rbyd>> {
    let weight = cur.weight as Rid;
    let first = rattrs.first().map(|(rid, _)| *rid).unwrap_or(0);
    let rev = cur.rev.wrapping_add(1);

    let ranges = match split {
        Some(s) => {
            debug_log!("btree: splitting node {} at rid {}", cur.block, s);
            vec![(-1, s, 0), (s, weight, s)]
        }
        None => vec![(-1, weight, 0)],
    };
    let mut out = Vec::with_capacity(ranges.len());
    for (i, (start, end, shift)) in ranges.into_iter().enumerate() {
        let mine = match split {
            Some(s) => (i == 0) == (first < s),
            None => true,
        };
        let shifted: Vec<(Rid, Rattr)> = if mine {
            rattrs.iter().map(|(rid, r)| (rid - shift, r.clone())).collect()
        } else {
            Vec::new()
        };
        let fresh = alloc_rbyd(bd, alloc, &mut |bd, block| {
            let mut r = cur.compact(bd, block, rev, start, end)?;
            if !shifted.is_empty() {
                r.commit(bd, &shifted)?;
            }
            Ok(r)
        })?;
        out.push(fresh);
    }
    Ok(out)
}

fn keep_nonempty(nodes: Vec<Rbyd>) -> Vec<Rbyd> {
    nodes.into_iter().filter(|n| n.weight > 0).collect()
}

/// Merge a freshly compacted child with a neighbour if both fit in half a
/// block; returns the merged node and the parent span it replaces
fn try_merge(bd: &mut Bd, alloc: &mut Allocator, step: &Step, child: &Rbyd) -> Result<Option<(Rbyd, Rid, u32)>> {
    let half = bd.block_size() / 2;
    let mine = child.estimate(bd, -1, child.weight as Rid)?;
    if mine.size > half / 2 {
        return Ok(None);
    }

    let parent = &step.node;
    let start = step.rid - step.weight as Rid + 1;
    let mut neighbours = Vec::with_capacity(2);
    if step.rid + 1 < parent.weight as Rid {
        neighbours.push((parent.lookup_next(bd, step.rid + 1, 0)?, true));
    }
    if start > 0 {
        neighbours.push((parent.lookup_next(bd, start - 1, 0)?, false));
    }
    let mut pick = None;
    for (entry, is_right) in neighbours {
        let Some(sibling) = branch_child(bd, parent, &entry)? else {
            continue;
        };
        let theirs = sibling.estimate(bd, -1, sibling.weight as Rid)?;
        if mine.size + theirs.size <= half {
            pick = Some((entry, is_right, sibling));
            break;
        }
    }
    let Some((sib_entry, sib_is_right, sibling)) = pick else {
        return Ok(None);
    };

    let (left, right) = if sib_is_right { (*child, sibling) } else { (sibling, *child) };
    let merged = alloc_rbyd(bd, alloc, &mut |bd, block| {
        Rbyd::compact_many(
            bd,
            block,
            child.rev,
            &[(left, -1, left.weight as Rid), (right, -1, right.weight as Rid)],
        )
    })?;
    debug_log!(
        "btree: merged nodes {} and {} into {}",
        left.block,
        right.block,
        merged.block
    );
    let span_start = if sib_is_right {
        start
    } else {
        sib_entry.rid - sib_entry.weight as Rid + 1
    };
    Ok(Some((merged, span_start, step.weight + sib_entry.weight)))
}
