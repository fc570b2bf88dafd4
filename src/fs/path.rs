//! Path resolution and namespace operations

use super::Filesystem;
use crate::btree::bshrub::Bstruct;
use crate::mdir::gstate::Mid;
use crate::mdir::handle::HandleId;
use crate::mdir::{Mattr, Mdir};
use crate::rbyd::codec::{decode_leb, decode_name, encode_leb, encode_name};
use crate::rbyd::tag::{self, Rid};
use crate::rbyd::Rattr;
use crate::{FsError, Result};

/// Directory id of the root directory
pub const ROOT_DID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

/// One directory entry, as returned by `readdir` and `stat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
    /// File size in bytes, 0 for directories
    pub size: u64,
}

/// Where a path's final component lives or would be inserted
#[derive(Debug, Clone)]
pub(crate) struct Lookup {
    /// Parent directory
    pub did: u32,
    pub name: Vec<u8>,
    pub mdir: Mdir,
    pub rid: Rid,
    pub exact: bool,
}

impl Lookup {
    pub fn mid(&self) -> Mid {
        self.mdir.mid + self.rid
    }

    /// Name record for a new entry here
    pub(crate) fn name_rattr(&self, kind: FileType) -> Rattr {
        let mut buf = Vec::new();
        encode_name(&mut buf, self.did, &self.name);
        let t = match kind {
            FileType::File => tag::REG,
            FileType::Dir => tag::DIR,
        };
        Rattr::buf(t, 1, buf)
    }
}

fn did_rattr(did: u32) -> Rattr {
    Rattr::buf(tag::DID, 0, encode_leb(did))
}

impl Filesystem {
    fn components<'a>(&self, path: &'a str) -> Result<Vec<&'a [u8]>> {
        let mut out = Vec::new();
        for c in path.split('/') {
            match c {
                "" | "." => {}
                ".." => return Err(FsError::Invalid(format!("'..' in {}", path))),
                c if c.len() > self.cfg.name_limit as usize => return Err(FsError::NameTooLong),
                c => out.push(c.as_bytes()),
            }
        }
        Ok(out)
    }

    /// Kind of the entry at (mdir, rid), and its did if it is a directory
    pub(crate) fn entry_kind(&mut self, mdir: &Mdir, rid: Rid) -> Result<(FileType, u32)> {
        let f = mdir.rbyd.lookup_next(&mut self.bd, rid, 0)?;
        match f.tag {
            tag::REG => Ok((FileType::File, 0)),
            tag::DIR => {
                let did = mdir.rbyd.lookup(&mut self.bd, rid, tag::DID)?.read(&mut self.bd)?;
                Ok((FileType::Dir, decode_leb(&did)?))
            }
            t => Err(FsError::corrupt(format!("entry {} is a {}", mdir.mid + rid, tag::name(t)))),
        }
    }

    /// Directory id of the directory made of `comps`
    fn walk(&mut self, comps: &[&[u8]]) -> Result<u32> {
        let mut did = ROOT_DID;
        for c in comps {
            let (mdir, rid, exact) = self.meta.namelookup(&mut self.bd, did, c)?;
            if !exact {
                return Err(FsError::NotFound);
            }
            match self.entry_kind(&mdir, rid)? {
                (FileType::Dir, d) => did = d,
                (FileType::File, _) => return Err(FsError::NotDir),
            }
        }
        Ok(did)
    }

    pub(crate) fn lookup(&mut self, path: &str) -> Result<Lookup> {
        let comps = self.components(path)?;
        let (last, parents) = comps
            .split_last()
            .ok_or_else(|| FsError::Invalid("the root directory has no entry".into()))?;
        let did = self.walk(parents)?;
        let (mdir, rid, exact) = self.meta.namelookup(&mut self.bd, did, last)?;
        Ok(Lookup {
            did,
            name: last.to_vec(),
            mdir,
            rid,
            exact,
        })
    }

    /// Directory id behind a path
    pub(crate) fn dir_did(&mut self, path: &str) -> Result<u32> {
        let comps = self.components(path)?;
        self.walk(&comps)
    }

    /// Entry at (mdir, rid) if it still belongs to `did`, stepping into the
    /// next mdir past the end of this one
    pub(super) fn entry_in(&mut self, did: u32, mdir: Mdir, rid: Rid) -> Result<Option<(Mdir, Rid, Vec<u8>)>> {
        let (mut mdir, mut rid) = (mdir, rid);
        while rid >= mdir.weight() as Rid {
            match self.meta.next_mdir(&mut self.bd, &mdir)? {
                Some(next) => {
                    mdir = next;
                    rid = 0;
                }
                None => return Ok(None),
            }
        }
        let buf = mdir.rbyd.lookup_next(&mut self.bd, rid, 0)?.read(&mut self.bd)?;
        let (d, name) = decode_name(&buf)?;
        Ok((d == did).then(|| (mdir, rid, name.to_vec())))
    }

    pub(crate) fn dir_is_empty(&mut self, did: u32) -> Result<bool> {
        let (mdir, rid, _) = self.meta.namelookup(&mut self.bd, did, b"")?;
        Ok(self.entry_in(did, mdir, rid)?.is_none())
    }

    /// Entries filed under `did`, in name order
    pub(crate) fn list_did(&mut self, did: u32) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        let (mut mdir, mut rid, _) = self.meta.namelookup(&mut self.bd, did, b"")?;
        while let Some((m, r, name)) = self.entry_in(did, mdir, rid)? {
            out.push(self.dir_entry(&m, r, name)?);
            mdir = m;
            rid = r + 1;
        }
        Ok(out)
    }

    pub(super) fn dir_entry(&mut self, mdir: &Mdir, rid: Rid, name: Vec<u8>) -> Result<DirEntry> {
        let (kind, _) = self.entry_kind(mdir, rid)?;
        let size = match kind {
            FileType::File => mdir.bstruct(&mut self.bd, rid)?.weight() as u64,
            FileType::Dir => 0,
        };
        let name = String::from_utf8(name).map_err(|_| FsError::corrupt("entry name is not utf-8"))?;
        Ok(DirEntry { name, kind, size })
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.atomic(|fs| {
            let at = fs.lookup(path)?;
            if at.exact {
                return Err(FsError::Exists);
            }
            let did = fs.next_did;
            let mattrs = vec![
                Mattr::Attr(at.rid, at.name_rattr(FileType::Dir)),
                Mattr::Attr(at.rid, did_rattr(did)),
            ];
            fs.commit(&at.mdir, &mattrs)?;
            fs.next_did += 1;
            debug_log!("fs: mkdir {} as did {}", path, did);
            Ok(())
        })
    }

    /// Create an empty file
    pub fn create(&mut self, path: &str) -> Result<()> {
        self.atomic(|fs| {
            let at = fs.lookup(path)?;
            if at.exact {
                return Err(FsError::Exists);
            }
            fs.commit(&at.mdir, &[Mattr::Attr(at.rid, at.name_rattr(FileType::File))])
        })
    }

    /// Remove a file or an empty directory
    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.atomic(|fs| {
            let at = fs.lookup(path)?;
            if !at.exact {
                return Err(FsError::NotFound);
            }
            if let (FileType::Dir, did) = fs.entry_kind(&at.mdir, at.rid)? {
                if !fs.dir_is_empty(did)? {
                    return Err(FsError::NotEmpty);
                }
            }
            fs.commit(&at.mdir, &[Mattr::Attr(at.rid, Rattr::rm_range(1))])
        })
    }

    /// Move an entry, replacing a file or empty directory at `dst`
    ///
    /// Within one mdir this is a single commit. Across mdirs the new entry
    /// lands first with the old one queued in the grm, then the old one is
    /// removed; a crash in between is finished by the next mount.
    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        if self.atomic(|fs| fs.rename_insert(src, dst))?.is_some() {
            self.finish_removes()?;
        }
        Ok(())
    }

    /// First half of a rename; returns the mid left for removal, if any
    pub(crate) fn rename_insert(&mut self, src: &str, dst: &str) -> Result<Option<Mid>> {
        let s = self.lookup(src)?;
        if !s.exact {
            return Err(FsError::NotFound);
        }
        let d = self.lookup(dst)?;
        if d.exact && d.mid() == s.mid() {
            return Ok(None);
        }
        let (kind, did) = self.entry_kind(&s.mdir, s.rid)?;
        if kind == FileType::Dir {
            let (sc, dc) = (self.components(src)?, self.components(dst)?);
            if dc.len() > sc.len() && dc.starts_with(&sc) {
                return Err(FsError::Invalid(format!("cannot move {} into itself", src)));
            }
        }
        if d.exact {
            match (kind, self.entry_kind(&d.mdir, d.rid)?) {
                (FileType::File, (FileType::Dir, _)) => return Err(FsError::IsDir),
                (FileType::Dir, (FileType::File, _)) => return Err(FsError::NotDir),
                (FileType::Dir, (FileType::Dir, ddid)) if !self.dir_is_empty(ddid)? => return Err(FsError::NotEmpty),
                _ => {}
            }
        }

        let mut mattrs = Vec::new();
        if d.exact {
            mattrs.push(Mattr::Attr(d.rid, Rattr::rm_range(1)));
        }
        mattrs.push(Mattr::Attr(d.rid, d.name_rattr(kind)));
        match kind {
            FileType::Dir => mattrs.push(Mattr::Attr(d.rid, did_rattr(did))),
            FileType::File => match s.mdir.bstruct(&mut self.bd, s.rid)? {
                Bstruct::Empty => {}
                Bstruct::Btree(tree) => mattrs.push(Mattr::Attr(d.rid, Bstruct::btree_rattr(&tree))),
                bs => mattrs.push(Mattr::Shrub {
                    rid: d.rid,
                    fresh: true,
                    edits: bs.copy_edits(&mut self.bd)?,
                }),
            },
        }

        let moving: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|(_, h)| h.mid == Some(s.mid()))
            .map(|(id, _)| id)
            .collect();
        let pending = if s.mdir.mid == d.mdir.mid {
            let rid = if !d.exact && d.rid <= s.rid { s.rid + 1 } else { s.rid };
            mattrs.push(Mattr::Attr(rid, Rattr::rm_range(1)));
            self.commit(&d.mdir, &mattrs)?;
            None
        } else {
            self.meta.gstate.grm.push(s.mid())?;
            self.commit(&d.mdir, &mattrs)?;
            debug_log!("fs: {} -> {} landed, old entry queued for removal", src, dst);
            Some(s.mid())
        };

        // open handles follow the entry
        let moved = self.lookup(dst)?.mid();
        for id in moving {
            if let Some(h) = self.handles.get_mut(id) {
                h.mid = Some(moved);
            }
        }
        self.refresh_handles()?;
        Ok(pending)
    }

    pub fn readdir(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        let did = self.dir_did(path)?;
        self.list_did(did)
    }

    pub fn stat(&mut self, path: &str) -> Result<DirEntry> {
        if self.components(path)?.is_empty() {
            return Ok(DirEntry {
                name: "/".into(),
                kind: FileType::Dir,
                size: 0,
            });
        }
        let at = self.lookup(path)?;
        if !at.exact {
            return Err(FsError::NotFound);
        }
        let name = at.name.clone();
        self.dir_entry(&at.mdir, at.rid, name)
    }
}
