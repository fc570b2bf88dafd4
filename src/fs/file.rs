//! Open handles and file I/O
//!
//! A write turns into edits against the file's [`Bstruct`]: shrub edits
//! ride along in the mdir commit, btree edits are committed to the tree
//! first and the mdir commit then swaps in the new root. Either way the
//! file changes in one atomic step.

use super::path::{DirEntry, FileType, ROOT_DID};
use super::Filesystem;
use crate::btree::bshrub::Bstruct;
use crate::btree::Btree;
use crate::mdir::gstate::Mid;
use crate::mdir::handle::{Handle, HandleId, HandleKind};
use crate::mdir::{Mattr, Mdir};
use crate::rbyd::tag::{self, Rid};
use crate::rbyd::Rattr;
use crate::{FsError, Result};

pub type FileHandle = HandleId;
pub type DirHandle = HandleId;

impl Filesystem {
    /// Starting value of a handle's running shrub estimate
    fn initial_estimate(&mut self, bs: &Bstruct) -> Result<u32> {
        if bs.is_shrub() {
            bs.estimate(&mut self.bd)
        } else {
            Ok(0)
        }
    }

    pub fn open_file(&mut self, path: &str) -> Result<FileHandle> {
        let at = self.lookup(path)?;
        if !at.exact {
            return Err(FsError::NotFound);
        }
        if let (FileType::Dir, _) = self.entry_kind(&at.mdir, at.rid)? {
            return Err(FsError::IsDir);
        }
        let bs = at.mdir.bstruct(&mut self.bd, at.rid)?;
        let mut h = Handle::file(at.mid(), bs);
        h.shrub_estimate = self.initial_estimate(&bs)?;
        Ok(self.handles.open(h))
    }

    pub fn open_dir(&mut self, path: &str) -> Result<DirHandle> {
        let did = self.dir_did(path)?;
        let mid = if did == ROOT_DID {
            None
        } else {
            Some(self.lookup(path)?.mid())
        };
        Ok(self.handles.open(Handle::dir(mid, did)))
    }

    pub fn close(&mut self, id: HandleId) -> Result<()> {
        self.handles
            .close(id)
            .map(|_| ())
            .ok_or_else(|| FsError::Invalid(format!("no open handle {}", id.0)))
    }

    fn file_handle(&self, id: FileHandle) -> Result<&Handle> {
        match self.handles.get(id) {
            Some(h) if h.kind == HandleKind::File => Ok(h),
            Some(_) => Err(FsError::IsDir),
            None => Err(FsError::Invalid(format!("no open handle {}", id.0))),
        }
    }

    /// Mid of a file handle whose entry still exists
    fn live_mid(&self, id: FileHandle) -> Result<Mid> {
        self.file_handle(id)?.mid.ok_or(FsError::NotFound)
    }

    pub fn file_size(&self, id: FileHandle) -> Result<u64> {
        Ok(self.file_handle(id)?.bstruct.weight() as u64)
    }

    pub fn file_seek(&mut self, id: FileHandle, pos: u64) -> Result<()> {
        self.file_handle(id)?;
        if let Some(h) = self.handles.get_mut(id) {
            h.pos = pos;
        }
        Ok(())
    }

    pub fn file_tell(&self, id: FileHandle) -> Result<u64> {
        Ok(self.file_handle(id)?.pos)
    }

    /// Read at the handle's position, returning how many bytes were read
    pub fn file_read(&mut self, id: FileHandle, buf: &mut [u8]) -> Result<usize> {
        self.live_mid(id)?;
        let h = self.file_handle(id)?;
        let (bs, pos) = (h.bstruct, h.pos);
        let off = match u32::try_from(pos) {
            Ok(off) => off,
            Err(_) => return Ok(0),
        };
        let n = bs.read(&mut self.bd, off, buf)?;
        if let Some(h) = self.handles.get_mut(id) {
            h.pos += n as u64;
        }
        Ok(n)
    }

    /// Write at the handle's position; gaps past the end read as zeros
    pub fn file_write(&mut self, id: FileHandle, data: &[u8]) -> Result<usize> {
        let mid = self.live_mid(id)?;
        let h = self.file_handle(id)?;
        let est = h.shrub_estimate;
        let off = u32::try_from(h.pos).map_err(|_| FsError::FileTooLarge)?;
        let est = self.atomic(|fs| {
            let mdir = fs.meta.lookup_mid(&mut fs.bd, mid)?;
            let rid = mid - mdir.mid;
            let bs = mdir.bstruct(&mut fs.bd, rid)?;
            let edits = bs.write_edits(&mut fs.bd, &mut fs.alloc, &fs.cfg, off, data)?;
            let mut est = est;
            fs.land_edits(&mdir, rid, Vec::new(), bs, edits, &mut est)?;
            Ok(est)
        })?;
        self.settle(id, est, data.len() as u64);
        Ok(data.len())
    }

    /// Cut or zero-extend the file to `size`
    pub fn file_truncate(&mut self, id: FileHandle, size: u64) -> Result<()> {
        let mid = self.live_mid(id)?;
        let est = self.file_handle(id)?.shrub_estimate;
        let size = u32::try_from(size).map_err(|_| FsError::FileTooLarge)?;
        let est = self.atomic(|fs| {
            let mdir = fs.meta.lookup_mid(&mut fs.bd, mid)?;
            let rid = mid - mdir.mid;
            let bs = mdir.bstruct(&mut fs.bd, rid)?;
            let edits = bs.truncate_edits(&mut fs.bd, &fs.cfg, size)?;
            let mut est = est;
            fs.land_edits(&mdir, rid, Vec::new(), bs, edits, &mut est)?;
            Ok(est)
        })?;
        self.settle(id, est, 0);
        Ok(())
    }

    /// Advance a handle after a write and share the new estimate with
    /// every handle on the same file
    fn settle(&mut self, id: FileHandle, est: u32, advance: u64) {
        let mid = match self.handles.get_mut(id) {
            Some(h) => {
                h.pos += advance;
                h.mid
            }
            None => return,
        };
        if let Some(mid) = mid {
            for other in self.handles.on_mid(mid) {
                if let Some(h) = self.handles.get_mut(other) {
                    h.shrub_estimate = est;
                }
            }
        }
    }

    /// Next entry of an open directory, `None` at the end
    ///
    /// The handle keeps the mid it reads next; commits slide it along, so
    /// entries added or removed elsewhere in the directory do not make it
    /// skip or repeat the ones it has not reached yet.
    pub fn dir_read(&mut self, id: DirHandle) -> Result<Option<DirEntry>> {
        let (did, cursor) = match self.handles.get(id) {
            Some(h) if h.kind == HandleKind::Dir => {
                if h.did != ROOT_DID && h.mid.is_none() {
                    return Err(FsError::NotFound);
                }
                (h.did, h.cursor)
            }
            Some(_) => return Err(FsError::NotDir),
            None => return Err(FsError::Invalid(format!("no open handle {}", id.0))),
        };
        let at = match cursor {
            Some(mid) => match self.meta.lookup_mid(&mut self.bd, mid) {
                Ok(mdir) => Some((mdir, mid - mdir.mid)),
                // past the last mdir
                Err(FsError::NotFound) => None,
                Err(err) => return Err(err),
            },
            None => {
                let (mdir, rid, _) = self.meta.namelookup(&mut self.bd, did, b"")?;
                Some((mdir, rid))
            }
        };
        let found = match at {
            Some((mdir, rid)) => self.entry_in(did, mdir, rid)?,
            None => None,
        };
        let (entry, next) = match found {
            Some((mdir, rid, name)) => (Some(self.dir_entry(&mdir, rid, name)?), Some(mdir.mid + rid + 1)),
            None => (None, cursor),
        };
        if let Some(h) = self.handles.get_mut(id) {
            if entry.is_some() {
                h.pos += 1;
                h.cursor = next;
            }
            h.dirty = false;
        }
        Ok(entry)
    }

    pub fn dir_rewind(&mut self, id: DirHandle) -> Result<()> {
        match self.handles.get_mut(id) {
            Some(h) if h.kind == HandleKind::Dir => {
                h.pos = 0;
                h.cursor = None;
                h.dirty = false;
                Ok(())
            }
            Some(_) => Err(FsError::NotDir),
            None => Err(FsError::Invalid(format!("no open handle {}", id.0))),
        }
    }

    /// Write `data` at `off`, creating the file if needed
    pub fn write(&mut self, path: &str, off: u64, data: &[u8]) -> Result<usize> {
        let off = u32::try_from(off).map_err(|_| FsError::FileTooLarge)?;
        self.atomic(|fs| {
            let at = fs.lookup(path)?;
            let (bs, mattrs) = if at.exact {
                if let (FileType::Dir, _) = fs.entry_kind(&at.mdir, at.rid)? {
                    return Err(FsError::IsDir);
                }
                (at.mdir.bstruct(&mut fs.bd, at.rid)?, Vec::new())
            } else {
                let name = Mattr::Attr(at.rid, at.name_rattr(FileType::File));
                (Bstruct::Empty, vec![name])
            };
            let mut est = fs.initial_estimate(&bs)?;
            let edits = bs.write_edits(&mut fs.bd, &mut fs.alloc, &fs.cfg, off, data)?;
            fs.land_edits(&at.mdir, at.rid, mattrs, bs, edits, &mut est)
        })?;
        Ok(data.len())
    }

    /// Read up to `len` bytes at `off`
    pub fn read(&mut self, path: &str, off: u64, len: usize) -> Result<Vec<u8>> {
        let at = self.lookup(path)?;
        if !at.exact {
            return Err(FsError::NotFound);
        }
        if let (FileType::Dir, _) = self.entry_kind(&at.mdir, at.rid)? {
            return Err(FsError::IsDir);
        }
        let bs = at.mdir.bstruct(&mut self.bd, at.rid)?;
        let mut buf = vec![0u8; len];
        let n = match u32::try_from(off) {
            Ok(off) => bs.read(&mut self.bd, off, &mut buf)?,
            Err(_) => 0,
        };
        buf.truncate(n);
        Ok(buf)
    }

    pub fn truncate(&mut self, path: &str, size: u64) -> Result<()> {
        let id = self.open_file(path)?;
        let res = self.file_truncate(id, size);
        self.close(id)?;
        res
    }

    /// Commit edits to a file, promoting a shrub that outgrew its budget
    /// and demoting a btree that shrank back into one small leaf
    fn land_edits(
        &mut self,
        mdir: &Mdir,
        rid: Rid,
        mut mattrs: Vec<Mattr>,
        bs: Bstruct,
        edits: Vec<(Rid, Rattr)>,
        est: &mut u32,
    ) -> Result<()> {
        if edits.is_empty() && mattrs.is_empty() {
            return Ok(());
        }
        match bs {
            Bstruct::Btree(mut tree) => {
                Bstruct::apply_btree(&mut self.bd, &mut self.alloc, &mut tree, &edits)?;
                mattrs.extend(self.btree_mattrs(rid, tree, est)?);
            }
            _ if bs.should_promote(&mut self.bd, &self.cfg, est, &edits)? => {
                let mut tree = bs.promote(&mut self.bd, &mut self.alloc)?;
                Bstruct::apply_btree(&mut self.bd, &mut self.alloc, &mut tree, &edits)?;
                *est = 0;
                mattrs.extend(self.btree_mattrs(rid, tree, est)?);
            }
            _ => mattrs.push(Mattr::Shrub {
                rid,
                fresh: false,
                edits,
            }),
        }
        self.commit(mdir, &mattrs)
    }

    /// Mdir records that point an entry at `tree`
    fn btree_mattrs(&mut self, rid: Rid, tree: Btree, est: &mut u32) -> Result<Vec<Mattr>> {
        if tree.is_empty() {
            return Ok(vec![
                Mattr::Attr(rid, Rattr::rm(tag::BTREE)),
                Mattr::Attr(rid, Rattr::rm(tag::BSHRUB)),
            ]);
        }
        if let Some(edits) = Bstruct::Btree(tree).demote_edits(&mut self.bd, &self.cfg)? {
            // force a fresh estimate on the next write
            *est = self.cfg.inline_size / 2;
            return Ok(vec![Mattr::Shrub {
                rid,
                fresh: true,
                edits,
            }]);
        }
        Ok(vec![
            Mattr::Attr(rid, Bstruct::btree_rattr(&tree)),
            Mattr::Attr(rid, Rattr::rm(tag::BSHRUB)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use crate::btree::bshrub::Bstruct;
    use crate::config::FsConfig;
    use crate::fs::tests::setup;
    use crate::FsError;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_handles_read_write_seek() {
        let cfg = FsConfig::small_test();
        let (_, mut fs) = setup(&cfg);
        fs.create("/f").unwrap();
        let h = fs.open_file("/f").unwrap();
        assert_eq!(fs.file_write(h, b"hello ").unwrap(), 6);
        fs.file_write(h, b"world").unwrap();
        assert_eq!(fs.file_size(h).unwrap(), 11);
        assert_eq!(fs.file_tell(h).unwrap(), 11);

        fs.file_seek(h, 6).unwrap();
        let mut buf = [0u8; 32];
        let n = fs.file_read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(fs.file_read(h, &mut buf).unwrap(), 0);

        // writing past the end leaves a zero-filled hole
        fs.file_seek(h, 20).unwrap();
        fs.file_write(h, b"!").unwrap();
        assert_eq!(fs.read("/f", 0, 64).unwrap(), b"hello world\0\0\0\0\0\0\0\0\0!");
        fs.close(h).unwrap();
        assert!(fs.close(h).is_err());
    }

    #[test]
    fn test_handles_follow_entries() {
        let cfg = FsConfig::small_test();
        let (_, mut fs) = setup(&cfg);
        fs.mkdir("/d").unwrap();
        fs.write("/d/m", 0, b"middle").unwrap();
        let h = fs.open_file("/d/m").unwrap();

        // inserts before the file shift its mid, splits move its mdir
        for i in 0..150 {
            fs.create(&format!("/d/a{:03}", i)).unwrap();
        }
        let mut buf = [0u8; 16];
        let n = fs.file_read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"middle");

        fs.rename("/d/m", "/moved").unwrap();
        fs.file_write(h, b"+").unwrap();
        assert_eq!(fs.read("/moved", 0, 16).unwrap(), b"middle+");

        let other = fs.open_file("/moved").unwrap();
        fs.remove("/moved").unwrap();
        assert!(matches!(fs.file_write(h, b"x"), Err(FsError::NotFound)));
        assert!(matches!(fs.file_read(other, &mut buf), Err(FsError::NotFound)));
    }

    #[test]
    fn test_small_files_stay_inline_large_ones_crystallize() {
        let cfg = FsConfig::small_test();
        let (_, mut fs) = setup(&cfg);
        fs.write("/small", 0, b"tiny").unwrap();
        let at = fs.lookup("/small").unwrap();
        let bs = at.mdir.bstruct(&mut fs.bd, at.rid).unwrap();
        assert!(bs.is_shrub());
        assert_eq!(fs.usage().unwrap().blocks_used, 2);

        let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        fs.write("/big", 0, &big).unwrap();
        let at = fs.lookup("/big").unwrap();
        assert!(matches!(at.mdir.bstruct(&mut fs.bd, at.rid).unwrap(), Bstruct::Btree(_)));
        assert!(fs.usage().unwrap().blocks_used >= 2 + 10);
        assert_eq!(fs.read("/big", 0, 8192).unwrap(), big);

        // shrinking it again folds it back into the mdir
        fs.truncate("/big", 20).unwrap();
        let at = fs.lookup("/big").unwrap();
        assert!(at.mdir.bstruct(&mut fs.bd, at.rid).unwrap().is_shrub());
        assert_eq!(fs.read("/big", 0, 64).unwrap(), big[..20].to_vec());
        fs.check().unwrap();
    }

    #[test]
    fn test_shrub_promotes_under_small_writes() {
        let cfg = FsConfig::small_test();
        let (_, mut fs) = setup(&cfg);
        fs.create("/log").unwrap();
        let h = fs.open_file("/log").unwrap();
        let mut want = Vec::new();
        for i in 0..40u8 {
            let line = [b'a' + (i % 26); 24];
            fs.file_write(h, &line).unwrap();
            want.extend_from_slice(&line);
        }
        fs.close(h).unwrap();
        let at = fs.lookup("/log").unwrap();
        assert!(matches!(at.mdir.bstruct(&mut fs.bd, at.rid).unwrap(), Bstruct::Btree(_)));
        assert_eq!(fs.read("/log", 0, 4096).unwrap(), want);
    }

    #[test]
    fn test_random_writes_match_model() {
        let cfg = FsConfig::small_test();
        let (_, mut fs) = setup(&cfg);
        let mut rng = StdRng::seed_from_u64(7);
        let mut model: Vec<u8> = Vec::new();
        fs.create("/r").unwrap();
        let h = fs.open_file("/r").unwrap();
        for step in 0..120 {
            if step % 17 == 16 {
                let size = rng.gen_range(0..model.len().max(1) + 64);
                fs.file_truncate(h, size as u64).unwrap();
                model.resize(size, 0);
                continue;
            }
            let off = rng.gen_range(0..model.len() + 32);
            let len = if rng.gen_bool(0.1) {
                rng.gen_range(128..1200)
            } else {
                rng.gen_range(1..40)
            };
            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            fs.file_seek(h, off as u64).unwrap();
            fs.file_write(h, &data).unwrap();
            if model.len() < off + len {
                model.resize(off + len, 0);
            }
            model[off..off + len].copy_from_slice(&data);
            assert_eq!(fs.file_size(h).unwrap(), model.len() as u64, "step {}", step);
        }
        assert_eq!(fs.read("/r", 0, model.len() + 10).unwrap(), model);
        fs.check().unwrap();
    }

    #[test]
    fn test_dir_handles() {
        let cfg = FsConfig::small_test();
        let (_, mut fs) = setup(&cfg);
        fs.mkdir("/d").unwrap();
        fs.create("/d/1").unwrap();
        fs.create("/d/2").unwrap();
        let d = fs.open_dir("/d").unwrap();
        assert_eq!(fs.dir_read(d).unwrap().unwrap().name, "1");
        assert_eq!(fs.dir_read(d).unwrap().unwrap().name, "2");
        assert!(fs.dir_read(d).unwrap().is_none());
        fs.dir_rewind(d).unwrap();
        assert_eq!(fs.dir_read(d).unwrap().unwrap().name, "1");

        let root = fs.open_dir("/").unwrap();
        assert_eq!(fs.dir_read(root).unwrap().unwrap().name, "d");

        fs.remove("/d/1").unwrap();
        fs.remove("/d/2").unwrap();
        fs.remove("/d").unwrap();
        assert!(matches!(fs.dir_read(d), Err(FsError::NotFound)));
        assert!(matches!(fs.file_size(d), Err(FsError::IsDir)));
    }

    #[test]
    fn test_dir_cursor_survives_concurrent_changes() {
        let cfg = FsConfig::small_test();
        let (_, mut fs) = setup(&cfg);
        fs.mkdir("/d").unwrap();
        for i in 0..80 {
            fs.create(&format!("/d/f{:03}", i)).unwrap();
        }
        let d = fs.open_dir("/d").unwrap();
        for i in 0..20 {
            assert_eq!(fs.dir_read(d).unwrap().unwrap().name, format!("f{:03}", i));
        }

        // the next entry itself goes away, along with some on either side
        for i in (10..30).chain([50]) {
            fs.remove(&format!("/d/f{:03}", i)).unwrap();
        }
        fs.create("/d/f015b").unwrap();
        fs.create("/d/f100").unwrap();

        let mut rest = Vec::new();
        while let Some(e) = fs.dir_read(d).unwrap() {
            rest.push(e.name);
        }
        let want: Vec<String> = (30..80)
            .filter(|i| *i != 50)
            .map(|i| format!("f{:03}", i))
            .chain(["f100".to_string()])
            .collect();
        assert_eq!(rest, want);
        assert_eq!(fs.handles.get(d).unwrap().pos, 20 + want.len() as u64);

        assert!(fs.dir_read(d).unwrap().is_none());
        fs.dir_rewind(d).unwrap();
        assert_eq!(fs.dir_read(d).unwrap().unwrap().name, "f000");
        assert_eq!(fs.dir_read(d).unwrap().unwrap().name, "f001");
        fs.check().unwrap();
    }

    #[test]
    fn test_file_limit() {
        let cfg = FsConfig::small_test();
        let (_, mut fs) = setup(&cfg);
        let limit = cfg.file_limit as u64;
        assert!(matches!(fs.write("/f", limit, b"x"), Err(FsError::FileTooLarge)));
        assert!(matches!(fs.stat("/f"), Err(FsError::NotFound)));
        fs.create("/g").unwrap();
        assert!(matches!(fs.truncate("/g", limit + 1), Err(FsError::FileTooLarge)));
    }
}
