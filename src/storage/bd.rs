//! Block devices
//!
//! The filesystem only ever talks to flash through [`BlockDevice`]: byte-range
//! reads and progs inside one erase block, whole-block erases, and a sync
//! barrier. Erased flash reads back as `0xff`.

use crate::{FsError, Result};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

/// Byte pattern of erased flash
pub const ERASED: u8 = 0xff;

pub trait BlockDevice: Send {
    /// Erase block size in bytes
    fn block_size(&self) -> u32;

    /// Number of erase blocks
    fn block_count(&self) -> u32;

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()>;

    /// Program bytes into an erased region.
    fn prog(&mut self, block: u32, off: u32, data: &[u8]) -> Result<()>;

    fn erase(&mut self, block: u32) -> Result<()>;

    /// Barrier: everything programmed so far is durable once this returns.
    fn sync(&mut self) -> Result<()>;
}

fn check_bounds(block_size: u32, block_count: u32, block: u32, off: u32, len: usize) -> Result<()> {
    if block >= block_count {
        return Err(FsError::Invalid(format!(
            "block {} out of range (count {})",
            block, block_count
        )));
    }
    if off as usize + len > block_size as usize {
        return Err(FsError::Invalid(format!(
            "access {}+{} past end of block {}",
            off, len, block
        )));
    }
    Ok(())
}

/// Per-device operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BdStats {
    pub reads: u64,
    pub progs: u64,
    pub erases: u64,
    pub syncs: u64,
}

struct RamMedium {
    data: Vec<u8>,
    bad_blocks: HashSet<u32>,
    /// Writes left before simulated power loss
    power_budget: Option<u64>,
    powered: bool,
    erase_counts: Vec<u32>,
    stats: BdStats,
}

/// In-memory flash with fault injection
///
/// Clones share the same medium, so a test can drop a filesystem after a
/// simulated power loss and mount a fresh one on the surviving bytes.
#[derive(Clone)]
pub struct RamBlockDevice {
    inner: Arc<Mutex<RamMedium>>,
    block_size: u32,
    block_count: u32,
    /// Reject progs over bytes that were not erased
    strict_prog: bool,
}

impl RamBlockDevice {
    pub fn new(block_size: u32, block_count: u32) -> Self {
        let size = block_size as usize * block_count as usize;
        let medium = RamMedium {
            data: vec![ERASED; size],
            bad_blocks: HashSet::new(),
            power_budget: None,
            powered: true,
            erase_counts: vec![0; block_count as usize],
            stats: BdStats::default(),
        };
        Self {
            inner: Arc::new(Mutex::new(medium)),
            block_size,
            block_count,
            strict_prog: true,
        }
    }

    /// Progs and erases to this block fail with `Corrupt` from now on.
    pub fn mark_bad(&self, block: u32) {
        self.inner.lock().bad_blocks.insert(block);
    }

    pub fn clear_bad(&self, block: u32) {
        self.inner.lock().bad_blocks.remove(&block);
    }

    /// Cut power after `writes` more progs/erases.
    ///
    /// The prog that exhausts the budget is torn: only its first half lands.
    pub fn set_power_budget(&self, writes: u64) {
        let mut m = self.inner.lock();
        m.power_budget = Some(writes);
        m.powered = true;
    }

    /// Restore power, keeping whatever reached the medium.
    pub fn power_cycle(&self) {
        let mut m = self.inner.lock();
        m.power_budget = None;
        m.powered = true;
    }

    pub fn is_powered(&self) -> bool {
        self.inner.lock().powered
    }

    pub fn stats(&self) -> BdStats {
        self.inner.lock().stats
    }

    pub fn erase_count(&self, block: u32) -> u32 {
        self.inner.lock().erase_counts[block as usize]
    }

    /// Raw view of a block, bypassing every cache
    pub fn snapshot(&self, block: u32) -> Vec<u8> {
        let m = self.inner.lock();
        let start = block as usize * self.block_size as usize;
        m.data[start..start + self.block_size as usize].to_vec()
    }

    /// Consume one unit of the power budget; returns false once power is gone,
    /// true/torn flag when the write should only partially land.
    fn charge(m: &mut RamMedium) -> (bool, bool) {
        if !m.powered {
            return (false, false);
        }
        match m.power_budget {
            Some(0) => {
                m.powered = false;
                (false, false)
            }
            Some(1) => {
                m.power_budget = Some(0);
                m.powered = false;
                (true, true)
            }
            Some(n) => {
                m.power_budget = Some(n - 1);
                (true, false)
            }
            None => (true, false),
        }
    }
}

fn power_loss() -> FsError {
    FsError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "simulated power loss",
    ))
}

impl BlockDevice for RamBlockDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.block_size, self.block_count, block, off, buf.len())?;
        let mut m = self.inner.lock();
        m.stats.reads += 1;
        let start = block as usize * self.block_size as usize + off as usize;
        buf.copy_from_slice(&m.data[start..start + buf.len()]);
        Ok(())
    }

    fn prog(&mut self, block: u32, off: u32, data: &[u8]) -> Result<()> {
        check_bounds(self.block_size, self.block_count, block, off, data.len())?;
        let mut m = self.inner.lock();
        if m.bad_blocks.contains(&block) {
            return Err(FsError::corrupt(format!("bad block {}", block)));
        }
        let start = block as usize * self.block_size as usize + off as usize;
        if self.strict_prog && m.data[start..start + data.len()].iter().any(|&b| b != ERASED) {
            return Err(FsError::Invalid(format!(
                "prog over unerased bytes at {}:{}",
                block, off
            )));
        }
        let (ok, torn) = Self::charge(&mut m);
        if !ok {
            return Err(power_loss());
        }
        m.stats.progs += 1;
        let len = if torn { data.len() / 2 } else { data.len() };
        m.data[start..start + len].copy_from_slice(&data[..len]);
        if torn {
            return Err(power_loss());
        }
        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        check_bounds(self.block_size, self.block_count, block, 0, 0)?;
        let mut m = self.inner.lock();
        if m.bad_blocks.contains(&block) {
            return Err(FsError::corrupt(format!("bad block {}", block)));
        }
        let (ok, _) = Self::charge(&mut m);
        if !ok {
            return Err(power_loss());
        }
        m.stats.erases += 1;
        m.erase_counts[block as usize] += 1;
        let start = block as usize * self.block_size as usize;
        m.data[start..start + self.block_size as usize].fill(ERASED);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        let mut m = self.inner.lock();
        if !m.powered {
            return Err(power_loss());
        }
        m.stats.syncs += 1;
        Ok(())
    }
}

/// Flash image backed by a memory-mapped file
pub struct FileBlockDevice {
    mmap: MmapMut,
    block_size: u32,
    block_count: u32,
}

impl FileBlockDevice {
    /// Create (or truncate) an image file filled with erased blocks
    pub fn create(path: impl AsRef<Path>, block_size: u32, block_count: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_size as u64 * block_count as u64)?;
        // SAFETY: the file is owned by this device for its whole lifetime.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap.fill(ERASED);
        Ok(Self {
            mmap,
            block_size,
            block_count,
        })
    }

    /// Open an existing image; its length must match the geometry
    pub fn open(path: impl AsRef<Path>, block_size: u32, block_count: u32) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let expected = block_size as u64 * block_count as u64;
        if file.metadata()?.len() != expected {
            return Err(FsError::Config(format!(
                "image size {} does not match geometry {}",
                file.metadata()?.len(),
                expected
            )));
        }
        // SAFETY: see `create`.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            mmap,
            block_size,
            block_count,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.block_count
    }

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.block_size, self.block_count, block, off, buf.len())?;
        let start = block as usize * self.block_size as usize + off as usize;
        buf.copy_from_slice(&self.mmap[start..start + buf.len()]);
        Ok(())
    }

    fn prog(&mut self, block: u32, off: u32, data: &[u8]) -> Result<()> {
        check_bounds(self.block_size, self.block_count, block, off, data.len())?;
        let start = block as usize * self.block_size as usize + off as usize;
        self.mmap[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        check_bounds(self.block_size, self.block_count, block, 0, 0)?;
        let start = block as usize * self.block_size as usize;
        self.mmap[start..start + self.block_size as usize].fill(ERASED);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}
