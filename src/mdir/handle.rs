//! Registry of open handles
//!
//! Handles live in an arena and are referred to by index, so commits can
//! walk every open handle and patch it without back-pointers. A handle
//! whose entry disappears is marked orphaned rather than freed.

use crate::btree::bshrub::Bstruct;
use crate::mdir::gstate::Mid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct Handle {
    pub kind: HandleKind,
    /// Entry the handle refers to, `None` once removed
    pub mid: Option<Mid>,
    /// Directory id for dir handles
    pub did: u32,
    /// Byte offset for files, entries read so far for dirs
    pub pos: u64,
    /// Mid a dir handle reads next, `None` before its first read
    pub cursor: Option<Mid>,
    /// Last committed structure of a file
    pub bstruct: Bstruct,
    /// Running shrub size estimate, bytes
    pub shrub_estimate: u32,
    /// Set when the underlying entry moved or changed under a dir cursor
    pub dirty: bool,
}

impl Handle {
    pub fn file(mid: Mid, bstruct: Bstruct) -> Self {
        Self {
            kind: HandleKind::File,
            mid: Some(mid),
            did: 0,
            pos: 0,
            cursor: None,
            bstruct,
            shrub_estimate: 0,
            dirty: false,
        }
    }

    pub fn dir(mid: Option<Mid>, did: u32) -> Self {
        Self {
            kind: HandleKind::Dir,
            mid,
            did,
            pos: 0,
            cursor: None,
            bstruct: Bstruct::Empty,
            shrub_estimate: 0,
            dirty: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandleRegistry {
    slots: Vec<Option<Handle>>,
    free: Vec<usize>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, handle: Handle) -> HandleId {
        match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(handle);
                HandleId(i)
            }
            None => {
                self.slots.push(Some(handle));
                HandleId(self.slots.len() - 1)
            }
        }
    }

    pub fn close(&mut self, id: HandleId) -> Option<Handle> {
        let h = self.slots.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        Some(h)
    }

    pub fn get(&self, id: HandleId) -> Option<&Handle> {
        self.slots.get(id.0)?.as_ref()
    }

    pub fn get_mut(&mut self, id: HandleId) -> Option<&mut Handle> {
        self.slots.get_mut(id.0)?.as_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (HandleId, &Handle)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.as_ref().map(|h| (HandleId(i), h)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (HandleId, &mut Handle)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, h)| h.as_mut().map(|h| (HandleId(i), h)))
    }

    /// Rewrite every handle's mid; `None` orphans the handle. Dir cursors
    /// move with `slide` so they never land on a removed entry.
    pub fn remap(&mut self, f: &dyn Fn(Mid) -> Option<Mid>, slide: &dyn Fn(Mid) -> Mid) {
        for (_, h) in self.iter_mut() {
            if let Some(c) = h.cursor {
                h.cursor = Some(slide(c));
            }
            if let Some(mid) = h.mid {
                let new = f(mid);
                if new != Some(mid) {
                    h.dirty = true;
                }
                h.mid = new;
            }
        }
    }

    /// Handles on the file at `mid`
    pub fn on_mid(&self, mid: Mid) -> Vec<HandleId> {
        self.iter()
            .filter(|(_, h)| h.kind == HandleKind::File && h.mid == Some(mid))
            .map(|(id, _)| id)
            .collect()
    }
}
