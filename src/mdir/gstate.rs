//! Filesystem-wide state stored as xor deltas
//!
//! Each mdir may carry a `GRMDELTA` and a `GCKSUMDELTA` at rid -1. The
//! global value is the xor of every reachable mdir's delta, so any single
//! mdir commit can change it atomically by folding the difference into its
//! own delta.
//!
//! - grm: up to two mids whose entries must be removed, the second half of
//!   an interrupted cross-mdir rename
//! - gcksum: xor of the checksums of every superseded mdir commit

use crate::rbyd::tag::{self, Rid};
use crate::rbyd::{Rattr, Rbyd};
use crate::storage::cache::Bd;
use crate::{FsError, Result};

pub type Mid = i32;

pub const GRM_SIZE: usize = 8;

/// Pending removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Grm {
    mids: [Option<Mid>; 2],
}

impl Grm {
    pub fn is_empty(&self) -> bool {
        self.mids.iter().all(Option::is_none)
    }

    pub fn mids(&self) -> impl Iterator<Item = Mid> + '_ {
        self.mids.iter().flatten().copied()
    }

    pub fn contains(&self, mid: Mid) -> bool {
        self.mids.contains(&Some(mid))
    }

    pub fn push(&mut self, mid: Mid) -> Result<()> {
        match self.mids.iter_mut().find(|m| m.is_none()) {
            Some(slot) => {
                *slot = Some(mid);
                Ok(())
            }
            None => Err(FsError::Invalid("grm queue full".into())),
        }
    }

    pub fn remove(&mut self, mid: Mid) {
        for slot in self.mids.iter_mut() {
            if *slot == Some(mid) {
                *slot = None;
            }
        }
        // keep the queue packed
        if self.mids[0].is_none() {
            self.mids.swap(0, 1);
        }
    }

    /// Rewrite mids after entries moved; `None` drops the mid
    pub fn remap(&mut self, f: &dyn Fn(Mid) -> Option<Mid>) {
        for slot in self.mids.iter_mut() {
            if let Some(mid) = *slot {
                *slot = f(mid);
            }
        }
        if self.mids[0].is_none() {
            self.mids.swap(0, 1);
        }
    }

    pub fn encode(&self) -> [u8; GRM_SIZE] {
        let mut buf = [0u8; GRM_SIZE];
        for (i, slot) in self.mids.iter().enumerate() {
            let v = slot.map(|m| m as u32 + 1).unwrap_or(0);
            buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8; GRM_SIZE]) -> Result<Self> {
        let mut mids = [None; 2];
        for (i, slot) in mids.iter_mut().enumerate() {
            let v = u32::from_le_bytes([buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]]);
            if v > i32::MAX as u32 {
                return Err(FsError::corrupt(format!("grm mid {:#x} out of range", v)));
            }
            *slot = (v != 0).then(|| v as Mid - 1);
        }
        Ok(Self { mids })
    }
}

/// Raw delta as stored in one mdir
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gdelta {
    pub grm: [u8; GRM_SIZE],
    pub gcksum: u32,
}

impl Gdelta {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn xor(&self, other: &Gdelta) -> Gdelta {
        let mut grm = self.grm;
        for (a, b) in grm.iter_mut().zip(other.grm.iter()) {
            *a ^= b;
        }
        Gdelta {
            grm,
            gcksum: self.gcksum ^ other.gcksum,
        }
    }

    /// Delta recorded in an mdir
    pub fn read(bd: &mut Bd, rbyd: &Rbyd) -> Result<Gdelta> {
        let mut d = Gdelta::default();
        match rbyd.lookup(bd, -1, tag::GRMDELTA) {
            Ok(f) => {
                let buf = f.read(bd)?;
                if buf.len() != GRM_SIZE {
                    return Err(FsError::corrupt(format!("grm delta of {} bytes", buf.len())));
                }
                d.grm.copy_from_slice(&buf);
            }
            Err(FsError::NotFound) => {}
            Err(err) => return Err(err),
        }
        match rbyd.lookup(bd, -1, tag::GCKSUMDELTA) {
            Ok(f) => {
                let buf = f.read(bd)?;
                if buf.len() != 4 {
                    return Err(FsError::corrupt(format!("gcksum delta of {} bytes", buf.len())));
                }
                d.gcksum = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            }
            Err(FsError::NotFound) => {}
            Err(err) => return Err(err),
        }
        Ok(d)
    }

    /// Records that replace an mdir's delta with this one
    pub fn rattrs(&self) -> Vec<(Rid, Rattr)> {
        let grm = if self.grm == [0; GRM_SIZE] {
            Rattr::rm(tag::GRMDELTA)
        } else {
            Rattr::buf(tag::GRMDELTA, 0, self.grm.to_vec())
        };
        let gcksum = if self.gcksum == 0 {
            Rattr::rm(tag::GCKSUMDELTA)
        } else {
            Rattr::buf(tag::GCKSUMDELTA, 0, self.gcksum.to_le_bytes().to_vec())
        };
        vec![(-1, grm), (-1, gcksum)]
    }
}

/// Assembled global state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gstate {
    pub grm: Grm,
    pub gcksum: u32,
}

impl Gstate {
    pub fn from_delta(d: &Gdelta) -> Result<Gstate> {
        Ok(Gstate {
            grm: Grm::decode(&d.grm)?,
            gcksum: d.gcksum,
        })
    }

    pub fn to_delta(&self) -> Gdelta {
        Gdelta {
            grm: self.grm.encode(),
            gcksum: self.gcksum,
        }
    }
}
