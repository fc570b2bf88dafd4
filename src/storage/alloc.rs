//! Lookahead block allocator
//!
//! The allocator keeps no on-disk state. A window of `lookahead_size` blocks
//! is filled by diffing against the set of blocks reachable from the mroot
//! (collected by the filesystem traversal); blocks are then handed out from
//! that window in order. When the window runs dry the owning operation is
//! rolled back, the filesystem rescans, and the operation retries.
//!
//! ## Checkpoints
//! `ckpoint()` marks a point where everything allocated is durably
//! referenced. If a full lap of the disk has been scanned since the last
//! checkpoint without finding a free block, allocation fails with `NoSpace`.

use crate::storage::cache::Bd;
use crate::{FsError, Result};
use roaring::RoaringBitmap;
use std::collections::VecDeque;

pub struct Allocator {
    block_count: u32,
    lookahead_size: u32,
    /// First block of the next window
    next_start: u32,
    free: VecDeque<u32>,
    /// Handed out since the last checkpoint, in order
    pending: Vec<u32>,
    /// Blocks scanned since the last checkpoint
    scanned: u64,
}

impl Allocator {
    pub fn new(block_count: u32, lookahead_size: u32, seed: u32) -> Self {
        Self {
            block_count,
            lookahead_size: lookahead_size.min(block_count).max(1),
            next_start: seed % block_count.max(1),
            free: VecDeque::new(),
            pending: Vec::new(),
            scanned: 0,
        }
    }

    /// Whether another scan could still find a free block
    pub fn can_rescan(&self) -> bool {
        self.scanned < self.block_count as u64
    }

    /// Refill the window from the set of blocks in use
    pub fn refill(&mut self, inuse: &RoaringBitmap) {
        let start = self.next_start;
        self.free.clear();
        for i in 0..self.lookahead_size {
            let block = (start + i) % self.block_count;
            if !inuse.contains(block) && !self.pending.contains(&block) {
                self.free.push_back(block);
            }
        }
        self.next_start = (start + self.lookahead_size) % self.block_count;
        self.scanned += self.lookahead_size as u64;
        debug_log!(
            "alloc: scanned window {}+{}, {} free",
            start,
            self.lookahead_size,
            self.free.len()
        );
    }

    /// Drop the window, e.g. after the set of used blocks changed under it
    pub fn invalidate(&mut self) {
        self.free.clear();
    }

    /// Hand out a block, optionally erasing it first
    pub fn alloc(&mut self, bd: &mut Bd, erase: bool) -> Result<u32> {
        loop {
            let block = match self.free.pop_front() {
                Some(block) => block,
                None => {
                    return Err(FsError::NoSpace(format!(
                        "lookahead exhausted after scanning {} blocks",
                        self.scanned
                    )))
                }
            };
            self.pending.push(block);
            if erase {
                match bd.erase(block) {
                    Ok(()) => {}
                    Err(err) if err.is_corrupt() => {
                        log::warn!("alloc: block {} failed to erase, skipping", block);
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            return Ok(block);
        }
    }

    /// Everything allocated so far is accounted for by the committed tree
    pub fn ckpoint(&mut self) {
        self.pending.clear();
        self.scanned = 0;
    }

    /// Return blocks allocated since the checkpoint to the window
    pub fn rollback(&mut self) {
        for block in self.pending.drain(..).rev() {
            self.free.push_front(block);
        }
    }

    pub fn free_in_window(&self) -> usize {
        self.free.len()
    }
}
