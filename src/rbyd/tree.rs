//! Copy-on-write editing of an rbyd tree
//!
//! The on-disk tree is a leaf-oriented 2-3-4 tree. A node is a run of one to
//! [`NODE_ALTS`] alts, a black alt followed by red ones; each alt jumps to one
//! child and the run continues inline into the last. A trunk is therefore the
//! search path written front to back, and every leaf sits at the same node
//! depth.
//!
//! Alts never move once written. An edit plans its new path in memory as
//! [`Node`]s over untouched [`Sub::Old`] subtrees and the caller emits it.
//! Inserts split full nodes on the way down so a node always has room for
//! the child a split below pushes up. Removals never merge: a node left with
//! one child is written as a null alt (no jump, no weight) that keeps its
//! level until the next compaction.
//!
//! A node's keys are the tags of the greatest record under each child but the
//! last. The rid half of a key falls out of the child weights, so keys stay
//! valid as rids shift.

use crate::rbyd::codec::{decode_header, HEADER_MAX};
use crate::rbyd::tag::{self, Rid, Tag};
use crate::rbyd::Data;
use crate::storage::cache::Bd;
use crate::{FsError, Result};

/// Most alts in one node
pub(crate) const NODE_ALTS: usize = 3;

/// A record position in tree order
pub(crate) type Key = (Rid, Tag);

pub(crate) enum Sub {
    /// Subtree already on disk, rooted at `off`
    Old { off: u32, weight: u32 },
    Leaf(Box<Leaf>),
    Node(Box<Node>),
}

pub(crate) struct Leaf {
    pub tag: Tag,
    pub weight: u32,
    pub data: Data,
}

/// One 2-3-4 node: `keys[i]` is the tag of the greatest record under `subs[i]`
pub(crate) struct Node {
    pub subs: Vec<Sub>,
    pub keys: Vec<Tag>,
}

impl Sub {
    pub fn weight(&self) -> u32 {
        match self {
            Sub::Old { weight, .. } => *weight,
            Sub::Leaf(l) => l.weight,
            Sub::Node(n) => n.weight(),
        }
    }

    pub fn is_old(&self) -> bool {
        matches!(self, Sub::Old { .. })
    }

    fn node(subs: Vec<Sub>, keys: Vec<Tag>) -> Sub {
        Sub::Node(Box::new(Node { subs, keys }))
    }
}

impl Node {
    pub fn weight(&self) -> u32 {
        self.subs.iter().map(Sub::weight).sum()
    }

    /// Child holding the smallest record >= `want`, and the rid its range
    /// starts at
    fn find(&self, lower: Rid, want: Key) -> (usize, Rid) {
        let mut start = lower;
        for (i, key) in self.keys.iter().enumerate() {
            let end = start + self.subs[i].weight() as Rid;
            if want <= (end - 1, *key) {
                return (i, start);
            }
            start = end;
        }
        (self.subs.len() - 1, start)
    }

    /// Halve a full node, returning both halves and the key between them
    fn split(self) -> (Node, Node, Tag) {
        let Node { mut subs, mut keys } = self;
        let hi_subs = subs.split_off(2);
        let hi_keys = keys.split_off(2);
        let mid = keys.pop().unwrap_or(0);
        (
            Node { subs, keys },
            Node {
                subs: hi_subs,
                keys: hi_keys,
            },
            mid,
        )
    }
}

/// A record as found on disk
#[derive(Debug, Clone, Copy)]
pub(crate) enum Disk {
    Leaf {
        off: u32,
        tag: Tag,
        weight: u32,
        len: u32,
        size: u32,
    },
    Alt {
        off: u32,
        gt: bool,
        key: Tag,
        weight: u32,
        jump: u32,
        len: u32,
    },
    /// Alt that only holds a level, lookups step over it
    Null { off: u32, len: u32 },
    Empty,
}

pub(crate) fn read_header(bd: &mut Bd, block: u32, off: u32) -> Result<crate::rbyd::codec::Header> {
    let avail = (bd.block_size() - off.min(bd.block_size())) as usize;
    if avail < 2 {
        return Err(FsError::corrupt(format!("record past end of block {}", block)));
    }
    let buf = bd.read_vec(block, off, HEADER_MAX.min(avail))?;
    decode_header(&buf)
}

fn is_goto(t: Tag) -> bool {
    tag::is_alt(t) && tag::key(t) == tag::GOTO && !tag::is_gt(t)
}

/// Decode the node at `off`, following gotos
pub(crate) fn read_node(bd: &mut Bd, block: u32, off: u32) -> Result<Disk> {
    let mut off = off;
    // bounded by the number of records in a block
    for _ in 0..bd.block_size() {
        let h = read_header(bd, block, off)?;
        if !tag::is_alt(h.tag) {
            return Ok(Disk::Leaf {
                off,
                tag: tag::key(h.tag),
                weight: h.weight,
                len: h.len as u32,
                size: h.size,
            });
        }
        if is_goto(h.tag) {
            if h.size == 0 {
                return Ok(Disk::Empty);
            }
            off = off
                .checked_sub(h.size)
                .ok_or_else(|| FsError::corrupt("goto jumps before block start"))?;
            continue;
        }
        if h.size == 0 {
            if h.weight != 0 {
                return Err(FsError::corrupt(format!("weighted null alt at {}", off)));
            }
            return Ok(Disk::Null {
                off,
                len: h.len as u32,
            });
        }
        if h.size > off {
            return Err(FsError::corrupt(format!("bad alt jump {} at {}", h.size, off)));
        }
        return Ok(Disk::Alt {
            off,
            gt: tag::is_gt(h.tag),
            key: tag::key(h.tag),
            weight: h.weight,
            jump: h.size,
            len: h.len as u32,
        });
    }
    Err(FsError::corrupt("goto cycle"))
}

/// Follow gotos to the real root of a subtree
pub(crate) fn resolve(bd: &mut Bd, block: u32, off: u32) -> Result<u32> {
    match read_node(bd, block, off)? {
        Disk::Leaf { off, .. } | Disk::Alt { off, .. } | Disk::Null { off, .. } => Ok(off),
        Disk::Empty => Err(FsError::corrupt("reference to empty tree")),
    }
}

pub(crate) enum Decoded {
    Empty,
    Leaf { off: u32, tag: Tag },
    Node(Node),
}

/// Load the node rooted at `off` with its children left on disk
pub(crate) fn decode(bd: &mut Bd, block: u32, off: u32, weight: u32) -> Result<Decoded> {
    let (start, first) = match read_node(bd, block, off)? {
        Disk::Empty => return Ok(Decoded::Empty),
        Disk::Leaf {
            off, tag, weight: w, ..
        } => {
            if w != weight {
                return Err(FsError::corrupt(format!(
                    "leaf at {} weighs {}, its alts say {}",
                    off, w, weight
                )));
            }
            return Ok(Decoded::Leaf { off, tag });
        }
        Disk::Null { off, len } => {
            return Ok(Decoded::Node(Node {
                subs: vec![Sub::Old {
                    off: off + len,
                    weight,
                }],
                keys: Vec::new(),
            }))
        }
        Disk::Alt {
            off,
            gt,
            key,
            weight,
            jump,
            len,
            ..
        } => (off, (off + len, gt, key, weight, off - jump)),
    };

    // (end, gt, key, weight, target) per alt
    let mut alts = vec![first];
    let mut next = first.0;
    while alts.len() < NODE_ALTS {
        let h = read_header(bd, block, next)?;
        if !tag::is_alt(h.tag) || !tag::is_red(h.tag) || is_goto(h.tag) || h.size == 0 {
            break;
        }
        if h.size > next {
            return Err(FsError::corrupt(format!("bad alt jump {} at {}", h.size, next)));
        }
        let end = next + h.len as u32;
        alts.push((end, tag::is_gt(h.tag), tag::key(h.tag), h.weight, next - h.size));
        next = end;
    }

    let mut rest = weight;
    let (mut subs, mut keys) = (Vec::new(), Vec::new());
    let (mut upper, mut upper_keys) = (Vec::new(), Vec::new());
    for (_, gt, key, w, target) in alts {
        rest = rest.checked_sub(w).ok_or_else(|| {
            FsError::corrupt(format!("alt weights at {} exceed {}", start, weight))
        })?;
        let sub = Sub::Old {
            off: target,
            weight: w,
        };
        if gt {
            upper.push(sub);
            upper_keys.push(key);
        } else {
            subs.push(sub);
            keys.push(key);
        }
    }
    subs.push(Sub::Old {
        off: next,
        weight: rest,
    });
    subs.extend(upper.into_iter().rev());
    keys.extend(upper_keys.into_iter().rev());
    Ok(Decoded::Node(Node { subs, keys }))
}

/// Two records side by side, ordered by where `want` falls
fn beside(old: Sub, old_key: Key, new: Sub, new_tag: Tag, want: Key) -> ([Sub; 2], Tag) {
    if want > old_key {
        ([old, new], old_key.1)
    } else {
        ([new, old], new_tag)
    }
}

/// Plan inserting `leaf` before the smallest record >= `want`, or after
/// every record if there is none
pub(crate) fn plan_insert(bd: &mut Bd, block: u32, trunk: u32, weight: u32, want: Key, leaf: Leaf) -> Result<Sub> {
    let new_tag = leaf.tag;
    let new = Sub::Leaf(Box::new(leaf));
    if trunk == 0 {
        return Ok(new);
    }
    let mut root = match decode(bd, block, trunk, weight)? {
        Decoded::Empty => return Ok(new),
        Decoded::Leaf { off, tag } => {
            let old = Sub::Old { off, weight };
            let (pair, key) = beside(old, (weight as Rid - 1, tag), new, new_tag, want);
            return Ok(Sub::node(pair.into(), vec![key]));
        }
        Decoded::Node(node) => node,
    };
    if root.subs.len() > NODE_ALTS {
        let (lo, hi, key) = root.split();
        root = Node {
            subs: vec![Sub::Node(Box::new(lo)), Sub::Node(Box::new(hi))],
            keys: vec![key],
        };
    }
    insert_below(bd, block, &mut root, 0, want, new, new_tag)?;
    Ok(Sub::Node(Box::new(root)))
}

fn insert_below(bd: &mut Bd, block: u32, node: &mut Node, lower: Rid, want: Key, new: Sub, new_tag: Tag) -> Result<()> {
    let (i, start) = node.find(lower, want);
    let (off, weight) = match &mut node.subs[i] {
        Sub::Node(child) => return insert_below(bd, block, child, start, want, new, new_tag),
        Sub::Old { off, weight } => (*off, *weight),
        Sub::Leaf(_) => return Err(FsError::corrupt("insert path ends at a new leaf")),
    };
    match decode(bd, block, off, weight)? {
        Decoded::Empty => Err(FsError::corrupt("empty subtree below trunk")),
        Decoded::Leaf { off, tag } => {
            let old = Sub::Old { off, weight };
            let (pair, key) = beside(old, (start + weight as Rid - 1, tag), new, new_tag, want);
            node.subs.splice(i..=i, pair);
            node.keys.insert(i, key);
            debug_assert!(node.subs.len() <= NODE_ALTS + 1);
            Ok(())
        }
        Decoded::Node(child) if child.subs.len() > NODE_ALTS => {
            let (lo, hi, key) = child.split();
            node.subs.splice(i..=i, [Sub::Node(Box::new(lo)), Sub::Node(Box::new(hi))]);
            node.keys.insert(i, key);
            insert_below(bd, block, node, lower, want, new, new_tag)
        }
        Decoded::Node(child) => {
            let mut child = Box::new(child);
            insert_below(bd, block, &mut child, start, want, new, new_tag)?;
            node.subs[i] = Sub::Node(child);
            Ok(())
        }
    }
}

/// Plan swapping the record at exactly `want` for `leaf`
pub(crate) fn plan_replace(bd: &mut Bd, block: u32, trunk: u32, weight: u32, want: Key, leaf: Leaf) -> Result<Sub> {
    if trunk == 0 {
        return Err(FsError::NotFound);
    }
    match decode(bd, block, trunk, weight)? {
        Decoded::Empty => Err(FsError::NotFound),
        Decoded::Leaf { .. } => Ok(Sub::Leaf(Box::new(leaf))),
        Decoded::Node(mut root) => {
            replace_below(bd, block, &mut root, 0, want, leaf)?;
            Ok(Sub::Node(Box::new(root)))
        }
    }
}

fn replace_below(bd: &mut Bd, block: u32, node: &mut Node, lower: Rid, want: Key, leaf: Leaf) -> Result<()> {
    let (i, start) = node.find(lower, want);
    let (off, weight) = match &node.subs[i] {
        Sub::Old { off, weight } => (*off, *weight),
        _ => return Err(FsError::corrupt("replace path already planned")),
    };
    match decode(bd, block, off, weight)? {
        Decoded::Empty => Err(FsError::corrupt("empty subtree below trunk")),
        Decoded::Leaf { .. } => {
            node.subs[i] = Sub::Leaf(Box::new(leaf));
            Ok(())
        }
        Decoded::Node(child) => {
            let mut child = Box::new(child);
            replace_below(bd, block, &mut child, start, want, leaf)?;
            node.subs[i] = Sub::Node(child);
            Ok(())
        }
    }
}

/// Every record in `[first, last]`, plus the records just outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub first: Key,
    pub last: Key,
    pub pred: Option<Key>,
    pub succ: Option<Key>,
}

enum Fate {
    Keep,
    Drop,
    Trim,
}

impl Span {
    fn covers(&self, key: Key) -> bool {
        self.first <= key && key <= self.last
    }

    /// What happens to the subtree holding the records in `(lo, hi]`
    fn fate(&self, lo: Option<Key>, hi: Option<Key>) -> Fate {
        let overlaps = hi.map_or(true, |hi| hi >= self.first) && lo.map_or(true, |lo| lo < self.last);
        if !overlaps {
            return Fate::Keep;
        }
        let holds = |k: Option<Key>| {
            k.map_or(false, |k| lo.map_or(true, |lo| k > lo) && hi.map_or(true, |hi| k <= hi))
        };
        if holds(self.pred) || holds(self.succ) {
            Fate::Trim
        } else {
            Fate::Drop
        }
    }

    /// Total weight of the removed records
    pub fn weight(&self) -> u32 {
        let start = self.pred.map_or(0, |p| p.0 + 1);
        (self.last.0 + 1 - start) as u32
    }
}

/// Plan removing every record in `span`; `None` when nothing is left
///
/// Both ends are cut in the same pass: subtrees wholly inside the span are
/// dropped where the paths to its ends diverge, and each side keeps what lies
/// outside.
pub(crate) fn plan_remove(bd: &mut Bd, block: u32, trunk: u32, weight: u32, span: &Span) -> Result<Option<Sub>> {
    let mut root = match span.fate(None, None) {
        Fate::Drop => return Ok(None),
        Fate::Keep => return Ok(Some(Sub::Old { off: trunk, weight })),
        Fate::Trim => Sub::Node(Box::new(trim(bd, block, trunk, weight, 0, None, None, span)?)),
    };
    // a root left with one child gives up its level, uniformly for every leaf
    loop {
        let only = match &mut root {
            Sub::Node(node) if node.subs.len() == 1 => node.subs.pop(),
            _ => None,
        };
        match only {
            Some(sub) => root = sub,
            None => return Ok(Some(root)),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn trim(
    bd: &mut Bd,
    block: u32,
    off: u32,
    weight: u32,
    lower: Rid,
    lo: Option<Key>,
    hi: Option<Key>,
    span: &Span,
) -> Result<Node> {
    let Node { subs: olds, keys: old_keys } = match decode(bd, block, off, weight)? {
        Decoded::Node(node) => node,
        _ => return Err(FsError::corrupt("leaf straddles a removed span")),
    };
    let n = olds.len();
    let mut subs = Vec::with_capacity(n);
    let mut keys = Vec::with_capacity(n);
    let mut start = lower;
    for (i, sub) in olds.into_iter().enumerate() {
        let end = start + sub.weight() as Rid;
        let sub_lo = if i == 0 { lo } else { Some((start - 1, old_keys[i - 1])) };
        let sub_hi = if i + 1 == n { hi } else { Some((end - 1, old_keys[i])) };
        let kept = match span.fate(sub_lo, sub_hi) {
            Fate::Drop => {
                start = end;
                continue;
            }
            Fate::Keep => sub,
            Fate::Trim => match sub {
                Sub::Old { off, weight } => Sub::Node(Box::new(trim(bd, block, off, weight, start, sub_lo, sub_hi, span)?)),
                _ => return Err(FsError::corrupt("trim below a planned node")),
            },
        };
        // a removed greatest record hands its key to the record before the span
        let key = match sub_hi {
            _ if i + 1 == n => 0,
            Some(k) if span.covers(k) => span
                .pred
                .map(|p| p.1)
                .ok_or_else(|| FsError::corrupt("kept subtree with nothing before the span"))?,
            Some(k) => k.1,
            None => 0,
        };
        subs.push(kept);
        keys.push(key);
        start = end;
    }
    // the last child's key lives in an ancestor
    keys.pop();
    Ok(Node { subs, keys })
}

/// Tree over sorted leaves with every leaf at the same depth, in nodes of
/// two or three children
pub(crate) fn build(leaves: Vec<Leaf>) -> Option<Sub> {
    let mut level: Vec<(Sub, Tag)> = leaves
        .into_iter()
        .map(|l| {
            let max = l.tag;
            (Sub::Leaf(Box::new(l)), max)
        })
        .collect();
    while level.len() > 1 {
        let n = level.len();
        let groups = n.div_ceil(NODE_ALTS);
        let (base, extra) = (n / groups, n % groups);
        let mut iter = level.into_iter();
        let mut next = Vec::with_capacity(groups);
        for g in 0..groups {
            let size = base + usize::from(g < extra);
            let (mut subs, mut keys) = (Vec::with_capacity(size), Vec::with_capacity(size));
            for (sub, max) in iter.by_ref().take(size) {
                subs.push(sub);
                keys.push(max);
            }
            let max = keys.pop().unwrap_or(0);
            next.push((Sub::node(subs, keys), max));
        }
        level = next;
    }
    level.pop().map(|(sub, _)| sub)
}
