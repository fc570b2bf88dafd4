//! Bshrub: a file's data tree, inlined in its mdir until it outgrows it
//!
//! A file starts with no structure. Small files keep their data records in
//! a shrub, a tree whose records live in the owning mdir's block and carry
//! the `SHRUB` bit so the mdir's own fetch skips them. Once a shrub's
//! estimate passes `inline_size` it is promoted into a standalone
//! [`Btree`]; a btree that shrinks back into one small leaf is demoted.
//!
//! Records are keyed by byte offset, each piece weighs the bytes it covers:
//! - `DATA`: inline bytes, anything past the payload reads as zeros
//! - `BLOCK`: a [`Bptr`] into a data block

use super::{alloc_rbyd, Btree};
use crate::config::FsConfig;
use crate::rbyd::codec::{Bptr, BtreeRef, ShrubRef};
use crate::rbyd::tag::{self, Rid};
use crate::rbyd::{overhead, Data, Found, Rattr, Rbyd, Tree};
use crate::storage::alloc::Allocator;
use crate::storage::cache::Bd;
use crate::storage::checksum::Checksum;
use crate::{FsError, Result};
use roaring::RoaringBitmap;

/// Rough on-disk cost of one shrub edit beyond its payload
const EDIT_COST: u32 = 16;

/// Data structure behind a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bstruct {
    #[default]
    Empty,
    /// Tree stored in the owner mdir's `block`
    Shrub { block: u32, tree: Tree },
    Btree(Btree),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceKind {
    /// Inline bytes at (block, off)
    Inline { block: u32, off: u32, size: u32 },
    Block(Bptr),
}

/// One record of file content and the byte range it covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub start: u32,
    pub weight: u32,
    pub kind: PieceKind,
}

impl Piece {
    fn from_found(bd: &mut Bd, start: u32, f: &Found) -> Result<Piece> {
        let kind = match f.tag {
            tag::DATA => PieceKind::Inline {
                block: f.block,
                off: f.off,
                size: f.size,
            },
            tag::BLOCK => PieceKind::Block(Bptr::decode(&f.read(bd)?)?),
            t => {
                return Err(FsError::corrupt(format!(
                    "unexpected {} in file data",
                    tag::name(t)
                )))
            }
        };
        Ok(Piece {
            start,
            weight: f.weight,
            kind,
        })
    }

    pub fn end(&self) -> u32 {
        self.start + self.weight
    }

    fn backing(&self) -> (u32, u32, u32) {
        match self.kind {
            PieceKind::Inline { block, off, size } => (block, off, size),
            PieceKind::Block(b) => (b.block, b.off, b.size),
        }
    }

    /// Read bytes at `off` relative to the piece start
    pub fn read(&self, bd: &mut Bd, off: u32, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        let (block, base, size) = self.backing();
        if off < size {
            let n = ((size - off) as usize).min(buf.len());
            bd.read(block, base + off, &mut buf[..n])?;
        }
        Ok(())
    }

    /// Record covering [from, to) of this piece on its own
    pub fn carve(&self, bd: &mut Bd, from: u32, to: u32) -> Result<Rattr> {
        let weight = (to - from) as i32;
        match self.kind {
            PieceKind::Inline { block, off, size } => {
                let data = Data::Disk { block, off, size }.slice(from, to - from);
                Ok(Rattr::new(tag::DATA, weight, data))
            }
            PieceKind::Block(b) if from >= b.size => Ok(Rattr::new(tag::DATA, weight, Data::empty())),
            PieceKind::Block(b) => {
                let size = b.size.min(to) - from;
                let cksum = bd.cksum(b.block, b.off + from, size as usize, 0)?;
                let mut buf = Vec::new();
                Bptr {
                    block: b.block,
                    off: b.off + from,
                    size,
                    cksum,
                }
                .encode(&mut buf);
                Ok(Rattr::buf(tag::BLOCK, weight, buf))
            }
        }
    }

    /// Verify a block pointer against its checksum
    pub fn check(&self, bd: &mut Bd) -> Result<()> {
        if let PieceKind::Block(b) = self.kind {
            let crc = bd.cksum(b.block, b.off, b.size as usize, 0)?;
            if crc != b.cksum {
                return Err(FsError::corrupt(format!(
                    "data block {} checksum {:#010x}, expected {:#010x}",
                    b.block, crc, b.cksum
                )));
            }
        }
        Ok(())
    }
}

impl Bstruct {
    /// Structure of the file entry at `rid` of an mdir
    pub fn decode(bd: &mut Bd, mdir: &Rbyd, rid: Rid) -> Result<Bstruct> {
        match mdir.lookup(bd, rid, tag::BSHRUB) {
            Ok(f) => {
                let r = ShrubRef::decode(&f.read(bd)?)?;
                return Ok(Bstruct::Shrub {
                    block: mdir.block,
                    tree: Tree {
                        trunk: r.trunk,
                        weight: r.weight,
                    },
                });
            }
            Err(FsError::NotFound) => {}
            Err(err) => return Err(err),
        }
        match mdir.lookup(bd, rid, tag::BTREE) {
            Ok(f) => Ok(Bstruct::Btree(Btree::from_ref(BtreeRef::decode(&f.read(bd)?)?))),
            Err(FsError::NotFound) => Ok(Bstruct::Empty),
            Err(err) => Err(err),
        }
    }

    /// Size of the file in bytes
    pub fn weight(&self) -> u32 {
        match self {
            Bstruct::Empty => 0,
            Bstruct::Shrub { tree, .. } => tree.weight,
            Bstruct::Btree(b) => b.weight,
        }
    }

    pub fn is_shrub(&self) -> bool {
        matches!(self, Bstruct::Shrub { .. })
    }

    /// Piece covering byte `pos`
    pub fn piece(&self, bd: &mut Bd, pos: u32) -> Result<Piece> {
        if pos >= self.weight() {
            return Err(FsError::NotFound);
        }
        match self {
            Bstruct::Empty => Err(FsError::NotFound),
            Bstruct::Shrub { block, tree } => {
                let f = tree.lookup_next(bd, *block, pos as Rid, 0)?;
                let start = (f.rid - f.weight as Rid + 1) as u32;
                Piece::from_found(bd, start, &f)
            }
            Bstruct::Btree(b) => {
                let e = b.lookup(bd, pos as Rid)?;
                let f = e.first(bd)?;
                Piece::from_found(bd, e.start() as u32, &f)
            }
        }
    }

    pub fn pieces(&self, bd: &mut Bd) -> Result<Vec<Piece>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < self.weight() {
            let p = self.piece(bd, pos)?;
            pos = p.end();
            out.push(p);
        }
        Ok(out)
    }

    /// Read from `off`, stopping at the end of the file
    pub fn read(&self, bd: &mut Bd, off: u32, buf: &mut [u8]) -> Result<usize> {
        let size = self.weight();
        if off >= size {
            return Ok(0);
        }
        let len = ((size - off) as usize).min(buf.len());
        let mut done = 0;
        while done < len {
            let pos = off + done as u32;
            let p = self.piece(bd, pos)?;
            let n = ((p.end() - pos) as usize).min(len - done);
            p.read(bd, pos - p.start, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(len)
    }

    /// Shrub size as it would be compacted, without rbyd overhead
    pub fn estimate(&self, bd: &mut Bd) -> Result<u32> {
        let (block, tree) = match self {
            Bstruct::Empty => return Ok(0),
            Bstruct::Shrub { block, tree } => (*block, *tree),
            Bstruct::Btree(b) => (b.block, b.root().tree()),
        };
        let est = Rbyd::estimate_tree(bd, block, tree, 0, tree.weight as Rid, &mut |_, _| Ok(0))?;
        Ok(est.size - overhead(bd))
    }

    /// Whether pending edits would push a shrub past `inline_size`
    ///
    /// `cached` is the running estimate kept by the caller; it is only
    /// recomputed once it plus the new bytes crosses half the budget.
    pub fn should_promote(&self, bd: &mut Bd, cfg: &FsConfig, cached: &mut u32, edits: &[(Rid, Rattr)]) -> Result<bool> {
        if matches!(self, Bstruct::Btree(_)) {
            return Ok(false);
        }
        let pending: u32 = edits.iter().map(|(_, r)| r.data.len() + EDIT_COST).sum();
        if *cached + pending <= cfg.inline_size / 2 {
            *cached += pending;
            return Ok(false);
        }
        *cached = self.estimate(bd)?;
        Ok(*cached + pending > cfg.inline_size)
    }

    /// Move a shrub's records into a btree of their own
    pub fn promote(&self, bd: &mut Bd, alloc: &mut Allocator) -> Result<Btree> {
        let (src_block, src) = match self {
            Bstruct::Empty => return Ok(Btree::default()),
            Bstruct::Btree(b) => return Ok(*b),
            Bstruct::Shrub { block, tree } => (*block, *tree),
        };
        let leaf = alloc_rbyd(bd, alloc, &mut |bd, block| {
            let mut dst = Rbyd::create(bd, block, 0)?;
            let tree = Rbyd::compact_from(
                &mut dst,
                bd,
                src_block,
                src,
                false,
                0,
                src.weight as Rid,
                &mut |_, _, _| Ok(None),
            )?;
            dst.set_tree(tree);
            dst.append_cksum(bd)?;
            Ok(dst)
        })?;
        debug_log!("bshrub: promoted {} bytes into btree {}", src.weight, leaf.block);
        Ok(Btree {
            weight: leaf.weight,
            block: leaf.block,
            trunk: leaf.trunk,
            cksum: leaf.cksum,
        })
    }

    /// Edits that rebuild a small single-leaf btree as a fresh shrub
    pub fn demote_edits(&self, bd: &mut Bd, cfg: &FsConfig) -> Result<Option<Vec<(Rid, Rattr)>>> {
        let b = match self {
            Bstruct::Btree(b) if !b.is_empty() => b,
            _ => return Ok(None),
        };
        if b.blocks(bd)?.len() != 1 || self.estimate(bd)? > cfg.inline_size / 2 {
            return Ok(None);
        }
        let edits = self.copy_edits(bd)?;
        debug_log!("bshrub: demoting btree {} ({} pieces)", b.block, edits.len());
        Ok(Some(edits))
    }

    /// Edits that rebuild every piece from scratch in an empty shrub
    pub fn copy_edits(&self, bd: &mut Bd) -> Result<Vec<(Rid, Rattr)>> {
        let mut edits = Vec::new();
        for p in self.pieces(bd)? {
            edits.push((p.start as Rid, p.carve(bd, 0, p.weight)?));
        }
        Ok(edits)
    }

    /// Edits that write `data` at `off`, leaving holes as zeros
    ///
    /// Edits apply in order; each removes or inserts one piece.
    pub fn write_edits(
        &self,
        bd: &mut Bd,
        alloc: &mut Allocator,
        cfg: &FsConfig,
        off: u32,
        data: &[u8],
    ) -> Result<Vec<(Rid, Rattr)>> {
        let mut edits = Vec::new();
        if data.is_empty() {
            return Ok(edits);
        }
        let end = off
            .checked_add(data.len() as u32)
            .filter(|e| *e <= cfg.file_limit)
            .ok_or(FsError::FileTooLarge)?;
        let mut size = self.weight();
        if off > size {
            edits.push((size as Rid, Rattr::new(tag::DATA, (off - size) as i32, Data::empty())));
            size = off;
        }

        let mut overlap = Vec::new();
        let mut pos = off;
        while pos < end.min(size) {
            let p = self.piece(bd, pos)?;
            pos = p.end();
            overlap.push(p);
        }
        for p in overlap.iter().rev() {
            edits.push((p.end() as Rid - 1, Rattr::rm_range(p.weight)));
        }

        let mut at = overlap.first().map(|p| p.start).unwrap_or(off);
        let mut push = |edits: &mut Vec<(Rid, Rattr)>, r: Rattr| {
            let w = r.weight as u32;
            edits.push((at as Rid, r));
            at += w;
        };
        if let Some(first) = overlap.first().filter(|p| p.start < off) {
            push(&mut edits, first.carve(bd, 0, off - first.start)?);
        }
        for r in Self::fresh_pieces(bd, alloc, cfg, data)? {
            push(&mut edits, r);
        }
        if let Some(last) = overlap.last().filter(|p| p.end() > end) {
            push(&mut edits, last.carve(bd, end - last.start, last.weight)?);
        }
        Ok(edits)
    }

    /// Records for new data: fragments inline, or data blocks once the
    /// write passes `crystal_thresh`
    fn fresh_pieces(bd: &mut Bd, alloc: &mut Allocator, cfg: &FsConfig, data: &[u8]) -> Result<Vec<Rattr>> {
        let mut out = Vec::new();
        if (data.len() as u32) < cfg.crystal_thresh {
            for chunk in data.chunks(cfg.fragment_size.max(1) as usize) {
                out.push(Rattr::buf(tag::DATA, chunk.len() as i32, chunk.to_vec()));
            }
            return Ok(out);
        }
        for chunk in data.chunks(bd.block_size() as usize) {
            let bptr = Self::write_block(bd, alloc, chunk)?;
            let mut buf = Vec::new();
            bptr.encode(&mut buf);
            out.push(Rattr::buf(tag::BLOCK, chunk.len() as i32, buf));
        }
        Ok(out)
    }

    fn write_block(bd: &mut Bd, alloc: &mut Allocator, chunk: &[u8]) -> Result<Bptr> {
        let mut padded = chunk.to_vec();
        padded.resize(bd.align_up(chunk.len() as u32) as usize, crate::storage::bd::ERASED);
        loop {
            let block = alloc.alloc(bd, true)?;
            match bd.prog(block, 0, &padded).and_then(|_| bd.flush()) {
                Ok(()) => {
                    return Ok(Bptr {
                        block,
                        off: 0,
                        size: chunk.len() as u32,
                        cksum: Checksum::compute(chunk),
                    })
                }
                Err(err) if err.is_corrupt() => {
                    log::warn!("bshrub: data block {} rejected a write, relocating", block);
                    bd.drop_caches();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Edits that cut or zero-extend the file to `size`
    pub fn truncate_edits(&self, bd: &mut Bd, cfg: &FsConfig, size: u32) -> Result<Vec<(Rid, Rattr)>> {
        if size > cfg.file_limit {
            return Err(FsError::FileTooLarge);
        }
        let cur = self.weight();
        let mut edits = Vec::new();
        if size > cur {
            edits.push((cur as Rid, Rattr::new(tag::DATA, (size - cur) as i32, Data::empty())));
            return Ok(edits);
        }
        if size == cur {
            return Ok(edits);
        }
        // drop whole pieces from the back, then trim the straddler
        let mut tail = Vec::new();
        let mut pos = size;
        while pos < cur {
            let p = self.piece(bd, pos)?;
            pos = p.end();
            tail.push(p);
        }
        for p in tail.iter().rev() {
            edits.push((p.end() as Rid - 1, Rattr::rm_range(p.weight)));
        }
        if let Some(first) = tail.first().filter(|p| p.start < size) {
            edits.push((first.start as Rid, first.carve(bd, 0, size - first.start)?));
        }
        Ok(edits)
    }

    /// Apply edits to a btree-backed file, one commit per edit
    pub fn apply_btree(bd: &mut Bd, alloc: &mut Allocator, tree: &mut Btree, edits: &[(Rid, Rattr)]) -> Result<()> {
        for edit in edits {
            tree.commit(bd, alloc, std::slice::from_ref(edit))?;
        }
        Ok(())
    }

    /// Mark every block this structure references
    pub fn blocks(&self, bd: &mut Bd, out: &mut RoaringBitmap) -> Result<()> {
        if let Bstruct::Btree(b) = self {
            for block in b.blocks(bd)? {
                out.insert(block);
            }
        }
        for p in self.pieces(bd)? {
            if let PieceKind::Block(b) = p.kind {
                out.insert(b.block);
            }
        }
        Ok(())
    }

    /// Record that stores a btree in its owner mdir
    pub fn btree_rattr(tree: &Btree) -> Rattr {
        let mut buf = Vec::new();
        tree.to_ref().encode(&mut buf);
        Rattr::buf(tag::BTREE, 0, buf)
    }

    pub fn shrub_rattr(tree: &Tree) -> Rattr {
        let mut buf = Vec::new();
        ShrubRef {
            weight: tree.weight,
            trunk: tree.trunk,
        }
        .encode(&mut buf);
        Rattr::buf(tag::BSHRUB, 0, buf)
    }
}
