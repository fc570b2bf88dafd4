//! Record tags
//!
//! ```text
//!  15  14  13  12  11  10..8     7..0
//! [v] [a] [s] [r] [g] [category][subtype]
//! ```
//!
//! - `v`: valid bit, parity of the commit's running crc
//! - `a`: alt pointer (inner tree node) instead of a leaf
//! - `s`: record belongs to a shrub tree living inside another rbyd
//! - `r`: alt is red
//! - `g`: alt jumps to the greater side
//!
//! The low 11 bits are the key that orders records with the same rid.

pub type Tag = u16;

/// Record id local to one rbyd; -1 holds weightless leading records
pub type Rid = i32;

pub const VALID: Tag = 0x8000;
pub const ALT: Tag = 0x4000;
pub const SHRUB: Tag = 0x2000;
pub const RED: Tag = 0x1000;
pub const GT: Tag = 0x0800;
pub const KEY_MASK: Tag = 0x07ff;

// config, only found at rid -1 of an mroot
pub const CONFIG: Tag = 0x000;
pub const MAGIC: Tag = 0x003;
pub const VERSION: Tag = 0x004;
pub const GEOMETRY: Tag = 0x009;
pub const NAMELIMIT: Tag = 0x00c;
pub const FILELIMIT: Tag = 0x00d;

// global-state deltas, rid -1 of any mdir
pub const GDELTA: Tag = 0x100;
pub const GRMDELTA: Tag = 0x100;
pub const GCKSUMDELTA: Tag = 0x101;
/// Full gcksum as of an mdir's latest commit
pub const GCKSUM: Tag = 0x102;

// names carry the weight of an entry
pub const NAME: Tag = 0x200;
pub const BNAME: Tag = 0x200;
pub const REG: Tag = 0x201;
pub const DIR: Tag = 0x202;
pub const BOOKMARK: Tag = 0x204;

pub const STRUCT: Tag = 0x300;
pub const BRANCH: Tag = 0x300;
pub const DATA: Tag = 0x301;
pub const BLOCK: Tag = 0x302;
pub const BSHRUB: Tag = 0x304;
pub const BTREE: Tag = 0x305;
pub const MROOT: Tag = 0x308;
pub const MDIR: Tag = 0x309;
pub const MTREE: Tag = 0x30b;
pub const DID: Tag = 0x30c;

pub const ATTR: Tag = 0x400;

// log bookkeeping, never part of a tree
pub const CKSUM: Tag = 0x500;
pub const ECKSUM: Tag = 0x501;

/// Key reserved for goto/empty alts
pub const GOTO: Tag = 0x7ff;

/// Masks for lookups that accept any tag in a group
pub const MASK_NONE: Tag = 0x7ff;
pub const MASK_SUBTYPE: Tag = 0x700;

#[inline]
pub fn key(tag: Tag) -> Tag {
    tag & KEY_MASK
}

#[inline]
pub fn category(tag: Tag) -> Tag {
    tag & MASK_SUBTYPE
}

#[inline]
pub fn is_alt(tag: Tag) -> bool {
    tag & ALT != 0
}

#[inline]
pub fn is_shrub(tag: Tag) -> bool {
    tag & SHRUB != 0
}

#[inline]
pub fn is_red(tag: Tag) -> bool {
    tag & RED != 0
}

#[inline]
pub fn is_gt(tag: Tag) -> bool {
    tag & GT != 0
}

#[inline]
pub fn is_valid(tag: Tag) -> bool {
    tag & VALID != 0
}

/// Checksum/erase-state records live outside every tree
#[inline]
pub fn is_cksum(tag: Tag) -> bool {
    !is_alt(tag) && category(key(tag)) == CKSUM
}

/// Does `tag` match `want` under `mask`
#[inline]
pub fn matches(tag: Tag, want: Tag, mask: Tag) -> bool {
    key(tag) & mask == key(want) & mask
}

pub fn alt(gt: bool, red: bool, key_: Tag) -> Tag {
    let mut tag = ALT | key(key_);
    if gt {
        tag |= GT;
    }
    if red {
        tag |= RED;
    }
    tag
}

/// Human-readable name for debugging output
pub fn name(tag: Tag) -> &'static str {
    if is_alt(tag) {
        return if key(tag) == GOTO { "goto" } else { "alt" };
    }
    match key(tag) {
        MAGIC => "magic",
        VERSION => "version",
        GEOMETRY => "geometry",
        NAMELIMIT => "namelimit",
        FILELIMIT => "filelimit",
        GRMDELTA => "grmdelta",
        GCKSUMDELTA => "gcksumdelta",
        BNAME => "name",
        REG => "reg",
        DIR => "dir",
        BOOKMARK => "bookmark",
        BRANCH => "branch",
        DATA => "data",
        BLOCK => "block",
        BSHRUB => "bshrub",
        BTREE => "btree",
        MROOT => "mroot",
        MDIR => "mdir",
        MTREE => "mtree",
        DID => "did",
        CKSUM => "cksum",
        ECKSUM => "ecksum",
        k if category(k) == ATTR => "attr",
        _ => "unknown",
    }
}
