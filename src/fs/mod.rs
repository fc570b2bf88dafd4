//! Filesystem facade
//!
//! Ties the layers together: paths resolve through the mtree to entries,
//! file contents live in each entry's [`Bstruct`], and every change lands
//! through exactly one mdir commit per atomic step.
//!
//! ## 原子步骤
//! Each step runs against a snapshot of the in-memory state. If it fails,
//! the snapshot is restored and allocations since the last checkpoint are
//! returned; an out-of-space failure rescans the disk and retries while
//! unscanned blocks remain.
//!
//! ## 目录
//! Entries are ordered by (did, name). The root directory is did 0 and has
//! no entry of its own; every other directory is a `DIR` entry carrying a
//! `DID` record with the id its children are filed under.

mod file;
mod path;

pub use file::{DirHandle, FileHandle};
pub use path::{DirEntry, FileType};

use crate::btree::bshrub::Bstruct;
use crate::config::FsConfig;
use crate::mdir::gstate::Mid;
use crate::mdir::handle::HandleRegistry;
use crate::mdir::{Mattr, Mdir, Meta};
use crate::rbyd::codec::decode_leb;
use crate::rbyd::tag::{self, Rid};
use crate::rbyd::Rattr;
use crate::storage::alloc::Allocator;
use crate::storage::bd::BlockDevice;
use crate::storage::cache::Bd;
use crate::{FsError, Result};
use roaring::RoaringBitmap;

/// A mounted filesystem
pub struct Filesystem {
    pub(crate) bd: Bd,
    pub(crate) cfg: FsConfig,
    pub(crate) alloc: Allocator,
    pub(crate) meta: Meta,
    pub(crate) handles: HandleRegistry,
    /// Next unused directory id
    pub(crate) next_did: u32,
}

/// Block usage summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsUsage {
    pub block_size: u32,
    pub block_count: u32,
    pub blocks_used: u32,
}

impl Filesystem {
    /// Write an empty filesystem onto `dev`
    pub fn format(dev: Box<dyn BlockDevice>, cfg: &FsConfig) -> Result<()> {
        cfg.validate()?;
        let mut bd = Bd::new(dev, cfg)?;
        Meta::format(&mut bd, cfg)?;
        log::info!(
            "formatted {} blocks of {} bytes",
            cfg.block_count,
            cfg.block_size
        );
        Ok(())
    }

    /// Mount, finishing any removes left pending by an interrupted rename
    pub fn mount(dev: Box<dyn BlockDevice>, cfg: &FsConfig) -> Result<Self> {
        cfg.validate()?;
        let mut bd = Bd::new(dev, cfg)?;
        let meta = Meta::mount(&mut bd, cfg)?;
        let alloc = Allocator::new(cfg.block_count, cfg.lookahead_size, meta.gstate.gcksum);
        let mut fs = Self {
            bd,
            cfg: cfg.clone(),
            alloc,
            meta,
            handles: HandleRegistry::new(),
            next_did: 1,
        };
        fs.next_did = fs.max_did()? + 1;
        fs.rescan()?;
        if !fs.meta.gstate.grm.is_empty() {
            log::info!("fs: finishing interrupted removes {:?}", fs.meta.gstate.grm);
            fs.finish_removes()?;
        }
        debug_log!("fs: mounted, next did {}", fs.next_did);
        Ok(fs)
    }

    /// Flush caches and wait for the device
    pub fn sync(&mut self) -> Result<()> {
        self.bd.sync()
    }

    pub fn unmount(mut self) -> Result<()> {
        self.handles = HandleRegistry::new();
        self.sync()
    }

    pub fn config(&self) -> &FsConfig {
        &self.cfg
    }

    /// Every block reachable from the mroot
    pub fn traverse(&mut self) -> Result<RoaringBitmap> {
        let mut inuse = RoaringBitmap::new();
        self.meta.blocks(&mut self.bd, &mut inuse)?;
        for (mdir, rid) in self.entries()? {
            mdir.bstruct(&mut self.bd, rid)?.blocks(&mut self.bd, &mut inuse)?;
        }
        Ok(inuse)
    }

    pub fn usage(&mut self) -> Result<FsUsage> {
        Ok(FsUsage {
            block_size: self.cfg.block_size,
            block_count: self.cfg.block_count,
            blocks_used: self.traverse()?.len() as u32,
        })
    }

    /// Walk every structure and verify it, data block checksums included
    pub fn check(&mut self) -> Result<()> {
        if let Some(tree) = self.meta.mtree {
            tree.validate(&mut self.bd)?;
        }
        for (mdir, rid) in self.entries()? {
            let bs = mdir.bstruct(&mut self.bd, rid)?;
            if let Bstruct::Btree(tree) = bs {
                tree.validate(&mut self.bd)?;
            }
            for p in bs.pieces(&mut self.bd)? {
                p.check(&mut self.bd)?;
            }
        }
        Ok(())
    }

    /// Every (mdir, rid) holding an entry, in mid order
    fn entries(&mut self) -> Result<Vec<(Mdir, Rid)>> {
        let mut out = Vec::new();
        for mdir in self.meta.mdirs(&mut self.bd)? {
            for rid in 0..mdir.weight() as Rid {
                out.push((mdir, rid));
            }
        }
        Ok(out)
    }

    fn max_did(&mut self) -> Result<u32> {
        let mut max = 0;
        for (mdir, rid) in self.entries()? {
            match mdir.rbyd.lookup(&mut self.bd, rid, tag::DID) {
                Ok(f) => max = max.max(decode_leb(&f.read(&mut self.bd)?)?),
                Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(max)
    }

    /// Refill the allocator's window from a fresh traversal
    fn rescan(&mut self) -> Result<()> {
        let inuse = self.traverse()?;
        self.alloc.refill(&inuse);
        Ok(())
    }

    /// Run one atomic step, restoring state on failure
    ///
    /// Out-of-space failures rescan and retry until a full lap of the disk
    /// turned up nothing.
    pub(crate) fn atomic<T>(&mut self, mut op: impl FnMut(&mut Self) -> Result<T>) -> Result<T> {
        loop {
            let meta = self.meta.clone();
            let handles = self.handles.clone();
            let next_did = self.next_did;
            match op(self) {
                Ok(v) => {
                    self.alloc.ckpoint();
                    self.bd.sync()?;
                    return Ok(v);
                }
                Err(err) => {
                    self.meta = meta;
                    self.handles = handles;
                    self.next_did = next_did;
                    self.alloc.rollback();
                    self.bd.drop_caches();
                    match err {
                        FsError::NoSpace(_) if self.alloc.can_rescan() => {
                            debug_log!("fs: {}, rescanning", err);
                            self.rescan()?;
                        }
                        err => return Err(err),
                    }
                }
            }
        }
    }

    /// Commit to one mdir and bring open handles up to date
    pub(crate) fn commit(&mut self, mdir: &Mdir, mattrs: &[Mattr]) -> Result<()> {
        let remap = self
            .meta
            .commit(&mut self.bd, &mut self.alloc, mdir, mattrs)
            .map_err(|err| match err {
                FsError::Range => FsError::NoSpace("entry does not fit in a metadata block".into()),
                err => err,
            })?;
        if !remap.is_empty() {
            self.handles.remap(&|m| remap.apply(m), &|m| remap.slide(m));
        }
        self.refresh_handles()
    }

    /// Reload the structure every open file handle sees
    fn refresh_handles(&mut self) -> Result<()> {
        let ids: Vec<_> = self.handles.iter().map(|(id, _)| id).collect();
        for id in ids {
            let mid = match self.handles.get(id) {
                Some(h) if h.kind == crate::mdir::handle::HandleKind::File => h.mid,
                _ => continue,
            };
            let bs = match mid {
                Some(mid) => {
                    let mdir = self.meta.lookup_mid(&mut self.bd, mid)?;
                    mdir.bstruct(&mut self.bd, mid - mdir.mid)?
                }
                None => Bstruct::Empty,
            };
            if let Some(h) = self.handles.get_mut(id) {
                h.bstruct = bs;
            }
        }
        Ok(())
    }

    /// Complete pending removes, one atomic step each
    pub(crate) fn finish_removes(&mut self) -> Result<()> {
        loop {
            let next = self.meta.gstate.grm.mids().next();
            let Some(mid) = next else { break };
            let before = self.meta.gstate.grm.mids().count();
            self.atomic(|fs| fs.remove_mid(mid))?;
            if self.meta.gstate.grm.mids().count() >= before {
                return Err(FsError::corrupt(format!("grm mid {} survived its remove", mid)));
            }
        }
        Ok(())
    }

    /// Remove the entry at `mid`, or just forget it if it is already gone
    fn remove_mid(&mut self, mid: Mid) -> Result<()> {
        let mdir = match self.meta.lookup_mid(&mut self.bd, mid) {
            Ok(m) if mid - m.mid < m.weight() as Rid => m,
            Ok(_) | Err(FsError::NotFound) => {
                self.meta.gstate.grm.remove(mid);
                let root = *self.meta.mroot();
                return self.commit(&root, &[]);
            }
            Err(err) => return Err(err),
        };
        self.commit(&mdir, &[Mattr::Attr(mid - mdir.mid, Rattr::rm_range(1))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::bd::RamBlockDevice;

    pub(crate) fn setup(cfg: &FsConfig) -> (RamBlockDevice, Filesystem) {
        let ram = RamBlockDevice::new(cfg.block_size, cfg.block_count);
        Filesystem::format(Box::new(ram.clone()), cfg).unwrap();
        let fs = Filesystem::mount(Box::new(ram.clone()), cfg).unwrap();
        (ram, fs)
    }

    fn remount(ram: &RamBlockDevice, cfg: &FsConfig) -> Filesystem {
        Filesystem::mount(Box::new(ram.clone()), cfg).unwrap()
    }

    fn names(fs: &mut Filesystem, path: &str) -> Vec<String> {
        fs.readdir(path).unwrap().into_iter().map(|e| e.name).collect()
    }

    #[test]
    fn test_format_and_mount_empty() {
        let cfg = FsConfig::small_test();
        let (_, mut fs) = setup(&cfg);
        assert!(fs.readdir("/").unwrap().is_empty());
        let usage = fs.usage().unwrap();
        assert_eq!(usage.blocks_used, 2);
        assert_eq!(fs.stat("/").unwrap().kind, FileType::Dir);
    }

    #[test]
    fn test_mount_rejects_unformatted() {
        let cfg = FsConfig::small_test();
        let ram = RamBlockDevice::new(cfg.block_size, cfg.block_count);
        assert!(Filesystem::mount(Box::new(ram), &cfg).is_err());
    }

    #[test]
    fn test_tree_persists_across_remount() {
        let cfg = FsConfig::small_test();
        let (ram, mut fs) = setup(&cfg);
        fs.mkdir("/docs").unwrap();
        fs.mkdir("/docs/old").unwrap();
        fs.write("/docs/readme", 0, b"hello flash").unwrap();
        fs.write("/top", 0, &[7u8; 3000]).unwrap();
        fs.unmount().unwrap();

        let mut fs = remount(&ram, &cfg);
        assert_eq!(names(&mut fs, "/"), vec!["docs", "top"]);
        assert_eq!(names(&mut fs, "/docs"), vec!["old", "readme"]);
        assert_eq!(fs.read("/docs/readme", 0, 64).unwrap(), b"hello flash");
        assert_eq!(fs.read("/top", 0, 4096).unwrap(), vec![7u8; 3000]);
        assert_eq!(fs.stat("/docs/old").unwrap().kind, FileType::Dir);
        fs.check().unwrap();

        // dids keep counting after a remount
        fs.mkdir("/new").unwrap();
        fs.write("/new/x", 0, b"x").unwrap();
        assert_eq!(names(&mut fs, "/new"), vec!["x"]);
        assert!(fs.readdir("/docs/old").unwrap().is_empty());
    }

    #[test]
    fn test_many_entries_span_mdirs() {
        let cfg = FsConfig::small_test();
        let (ram, mut fs) = setup(&cfg);
        fs.mkdir("/d").unwrap();
        let mut want = Vec::new();
        for i in 0..200 {
            let n = format!("f{:03}", (i * 37) % 200);
            fs.write(&format!("/d/{}", n), 0, n.as_bytes()).unwrap();
            want.push(n);
        }
        want.sort();
        assert!(fs.meta.mtree.is_some());
        assert_eq!(names(&mut fs, "/d"), want);

        for n in want.iter().step_by(2) {
            fs.remove(&format!("/d/{}", n)).unwrap();
        }
        let left: Vec<String> = want.iter().skip(1).step_by(2).cloned().collect();
        let mut fs = {
            fs.unmount().unwrap();
            remount(&ram, &cfg)
        };
        assert_eq!(names(&mut fs, "/d"), left);
        for n in &left {
            assert_eq!(fs.read(&format!("/d/{}", n), 0, 16).unwrap(), n.as_bytes());
        }
        fs.check().unwrap();
    }

    #[test]
    fn test_interrupted_rename_finishes_on_mount() {
        let cfg = FsConfig::small_test();
        let (ram, mut fs) = setup(&cfg);
        fs.mkdir("/a").unwrap();
        fs.mkdir("/z").unwrap();
        for i in 0..120 {
            fs.write(&format!("/a/{:03}", i), 0, b"pad").unwrap();
        }
        fs.write("/a/000", 0, b"moving").unwrap();
        let src = fs.lookup("/a/000").unwrap();
        let dst = fs.lookup("/z/moved").unwrap();
        assert!(!dst.exact);
        assert_ne!(src.mdir.pair, dst.mdir.pair, "entries should be in different mdirs");

        // first half only: the new entry lands with the old one queued in grm
        let pending = fs.atomic(|fs| fs.rename_insert("/a/000", "/z/moved")).unwrap();
        assert!(pending.is_some());
        assert!(!fs.meta.gstate.grm.is_empty());
        drop(fs);

        let mut fs = remount(&ram, &cfg);
        assert!(fs.meta.gstate.grm.is_empty());
        assert!(matches!(fs.stat("/a/000"), Err(FsError::NotFound)));
        assert_eq!(fs.read("/z/moved", 0, 16).unwrap(), b"moving");
        assert_eq!(fs.readdir("/a").unwrap().len(), 119);

        // nothing left to do on the next mount
        fs.unmount().unwrap();
        let mut fs = remount(&ram, &cfg);
        assert_eq!(fs.readdir("/a").unwrap().len(), 119);
    }

    #[test]
    fn test_power_loss_is_atomic() {
        let cfg = FsConfig::small_test();
        // every cut point up to the first budget that lets both ops finish
        let mut budget = 0;
        loop {
            let (ram, mut fs) = setup(&cfg);
            fs.mkdir("/d").unwrap();
            for i in 0..40 {
                fs.write(&format!("/d/{:02}", i), 0, b"stable").unwrap();
            }
            fs.unmount().unwrap();

            let mut fs = remount(&ram, &cfg);
            ram.set_power_budget(budget);
            let res = fs.write("/d/new", 0, &[0x5a; 700]).and_then(|_| fs.rename("/d/00", "/d/zz"));
            drop(fs);
            ram.power_cycle();

            let mut fs = remount(&ram, &cfg);
            let listing = names(&mut fs, "/d");
            let has_new = listing.iter().any(|n| n == "new");
            if has_new {
                assert_eq!(fs.read("/d/new", 0, 1024).unwrap(), vec![0x5a; 700]);
            }
            let renamed = listing.iter().any(|n| n == "zz");
            let original = listing.iter().any(|n| n == "00");
            assert!(renamed != original, "budget {}: rename half applied", budget);
            assert_eq!(listing.len(), 40 + has_new as usize);
            fs.check().unwrap();
            if res.is_ok() {
                assert!(has_new && renamed);
                break;
            }
            budget += 1;
            assert!(budget < 5000, "ops never completed");
        }
        assert!(budget > 0);
    }

    #[test]
    fn test_finish_removes_drains_every_pending_mid() {
        let cfg = FsConfig::small_test();
        let (ram, mut fs) = setup(&cfg);
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        fs.write("/a/x", 0, b"x").unwrap();
        fs.write("/b/y", 0, b"y").unwrap();

        // two pending removes, as left behind by interrupted renames
        let x = fs.lookup("/a/x").unwrap().mid();
        let y = fs.lookup("/b/y").unwrap().mid();
        fs.atomic(|fs| {
            fs.meta.gstate.grm.push(x)?;
            fs.meta.gstate.grm.push(y)?;
            let root = *fs.meta.mroot();
            fs.commit(&root, &[])
        })
        .unwrap();
        assert_eq!(fs.meta.gstate.grm.mids().count(), 2);

        fs.finish_removes().unwrap();
        assert!(fs.meta.gstate.grm.is_empty());
        assert!(matches!(fs.stat("/a/x"), Err(FsError::NotFound)));
        assert!(matches!(fs.stat("/b/y"), Err(FsError::NotFound)));
        drop(fs);

        let mut fs = remount(&ram, &cfg);
        assert!(fs.meta.gstate.grm.is_empty());
        assert!(fs.readdir("/a").unwrap().is_empty());
        fs.check().unwrap();
    }

    #[test]
    fn test_full_disk_reports_nospace_and_recovers() {
        let mut cfg = FsConfig::small_test();
        cfg.block_count = 48;
        cfg.lookahead_size = 16;
        cfg.block_recycles = -1;
        let (ram, mut fs) = setup(&cfg);
        let chunk = vec![0xabu8; 2048];
        let mut written = 0;
        let err = loop {
            match fs.write(&format!("/f{}", written), 0, &chunk) {
                Ok(_) => written += 1,
                Err(err) => break err,
            }
            assert!(written < 48, "disk never filled");
        };
        assert!(matches!(err, FsError::NoSpace(_)), "{}", err);
        assert!(written > 0);

        // the failed write left nothing behind, and removing frees room
        assert!(matches!(fs.stat(&format!("/f{}", written)), Err(FsError::NotFound)));
        fs.remove("/f0").unwrap();
        fs.write("/again", 0, &chunk).unwrap();
        fs.unmount().unwrap();

        let mut fs = remount(&ram, &cfg);
        assert_eq!(fs.read("/again", 0, 4096).unwrap(), chunk);
        fs.check().unwrap();
    }

    #[test]
    fn test_bad_blocks_are_relocated() {
        let cfg = FsConfig::small_test();
        let (ram, mut fs) = setup(&cfg);
        for b in (2..200).step_by(5) {
            ram.mark_bad(b);
        }
        for i in 0..30 {
            fs.write(&format!("/b{:02}", i), 0, &vec![i as u8; 600]).unwrap();
        }
        fs.unmount().unwrap();
        let mut fs = remount(&ram, &cfg);
        for i in 0..30 {
            assert_eq!(fs.read(&format!("/b{:02}", i), 0, 1024).unwrap(), vec![i as u8; 600]);
        }
        fs.check().unwrap();
    }
}
