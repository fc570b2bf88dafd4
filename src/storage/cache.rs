//! Read/prog caches in front of a [`BlockDevice`]
//!
//! One read-cache slot and one prog-cache slot. Progs are buffered until the
//! slot fills, the writer moves elsewhere, or `flush` is called; reads always
//! observe buffered progs.

use crate::config::FsConfig;
use crate::storage::bd::BlockDevice;
use crate::storage::checksum::Checksum;
use crate::{FsError, Result};

#[derive(Debug, Clone)]
struct Slot {
    block: u32,
    off: u32,
    data: Vec<u8>,
}

impl Slot {
    fn contains(&self, block: u32, off: u32, len: usize) -> bool {
        self.block == block
            && off >= self.off
            && off as usize + len <= self.off as usize + self.data.len()
    }

    fn end(&self) -> u32 {
        self.off + self.data.len() as u32
    }
}

/// Cached block device handle used by every layer of the filesystem
pub struct Bd {
    dev: Box<dyn BlockDevice>,
    read_size: u32,
    prog_size: u32,
    block_size: u32,
    block_count: u32,
    rcache_size: u32,
    pcache_size: u32,
    rcache: Option<Slot>,
    pcache: Option<Slot>,
}

impl Bd {
    pub fn new(dev: Box<dyn BlockDevice>, cfg: &FsConfig) -> Result<Self> {
        if dev.block_size() != cfg.block_size || dev.block_count() < cfg.block_count {
            return Err(FsError::Config(format!(
                "device geometry {}x{} does not match config {}x{}",
                dev.block_size(),
                dev.block_count(),
                cfg.block_size,
                cfg.block_count
            )));
        }
        Ok(Self {
            dev,
            read_size: cfg.read_size,
            prog_size: cfg.prog_size,
            block_size: cfg.block_size,
            block_count: cfg.block_count,
            rcache_size: cfg.rcache_size.max(cfg.read_size),
            pcache_size: cfg.pcache_size.max(cfg.prog_size),
            rcache: None,
            pcache: None,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn prog_size(&self) -> u32 {
        self.prog_size
    }

    /// Round `off` up to the prog granularity
    pub fn align_up(&self, off: u32) -> u32 {
        (off + self.prog_size - 1) / self.prog_size * self.prog_size
    }

    fn check(&self, block: u32, off: u32, len: usize) -> Result<()> {
        if block >= self.block_count || off as usize + len > self.block_size as usize {
            return Err(FsError::Range);
        }
        Ok(())
    }

    pub fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        self.check(block, off, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }

        let hit = matches!(&self.rcache, Some(s) if s.contains(block, off, buf.len()));
        if !hit {
            let start = off / self.read_size * self.read_size;
            let end = off + buf.len() as u32;
            let want = (end - start).max(self.rcache_size);
            let len = ((want + self.read_size - 1) / self.read_size * self.read_size)
                .min(self.block_size - start);
            let mut data = vec![0u8; len as usize];
            self.dev.read(block, start, &mut data)?;
            self.rcache = Some(Slot {
                block,
                off: start,
                data,
            });
        }
        if let Some(s) = &self.rcache {
            let at = (off - s.off) as usize;
            buf.copy_from_slice(&s.data[at..at + buf.len()]);
        }

        // overlay progs that haven't reached the device yet
        if let Some(p) = &self.pcache {
            if p.block == block {
                let lo = off.max(p.off);
                let hi = (off + buf.len() as u32).min(p.end());
                if lo < hi {
                    let src = (lo - p.off) as usize;
                    let dst = (lo - off) as usize;
                    let n = (hi - lo) as usize;
                    buf[dst..dst + n].copy_from_slice(&p.data[src..src + n]);
                }
            }
        }
        Ok(())
    }

    pub fn read_vec(&mut self, block: u32, off: u32, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(block, off, &mut buf)?;
        Ok(buf)
    }

    pub fn prog(&mut self, block: u32, off: u32, data: &[u8]) -> Result<()> {
        self.check(block, off, data.len())?;
        let contiguous = matches!(&self.pcache, Some(p) if p.block == block && p.end() == off);
        if !contiguous {
            self.flush()?;
            debug_assert!(off % self.prog_size == 0, "unaligned prog start {}", off);
            self.pcache = Some(Slot {
                block,
                off,
                data: Vec::with_capacity(self.pcache_size as usize),
            });
        }

        let mut rest = data;
        while !rest.is_empty() {
            let full = {
                let p = match self.pcache.as_mut() {
                    Some(p) => p,
                    None => return Err(FsError::Invalid("prog cache missing".into())),
                };
                let room = self.pcache_size as usize - p.data.len();
                let n = room.min(rest.len());
                p.data.extend_from_slice(&rest[..n]);
                rest = &rest[n..];
                p.data.len() == self.pcache_size as usize
            };
            if full {
                let next = self.pcache.as_ref().map(|p| (p.block, p.end()));
                self.flush()?;
                if let Some((block, off)) = next {
                    self.pcache = Some(Slot {
                        block,
                        off,
                        data: Vec::with_capacity(self.pcache_size as usize),
                    });
                }
            }
        }
        Ok(())
    }

    /// Write out the prog cache
    pub fn flush(&mut self) -> Result<()> {
        let slot = match self.pcache.take() {
            Some(s) if !s.data.is_empty() => s,
            _ => return Ok(()),
        };
        if matches!(&self.rcache, Some(r) if r.block == slot.block) {
            self.rcache = None;
        }
        self.dev.prog(slot.block, slot.off, &slot.data)
    }

    /// Flush and wait for durability
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.dev.sync()
    }

    pub fn erase(&mut self, block: u32) -> Result<()> {
        if block >= self.block_count {
            return Err(FsError::Range);
        }
        if matches!(&self.pcache, Some(p) if p.block == block) {
            self.pcache = None;
        }
        if matches!(&self.rcache, Some(r) if r.block == block) {
            self.rcache = None;
        }
        self.dev.erase(block)
    }

    /// Drop both cache slots, e.g. after a failed write sequence
    pub fn drop_caches(&mut self) {
        self.rcache = None;
        self.pcache = None;
    }

    /// Continue `crc` over `len` bytes of a block
    pub fn cksum(&mut self, block: u32, off: u32, len: usize, crc: u32) -> Result<u32> {
        let mut crc = crc;
        let mut buf = [0u8; 64];
        let mut at = off;
        let mut left = len;
        while left > 0 {
            let n = left.min(buf.len());
            self.read(block, at, &mut buf[..n])?;
            crc = Checksum::append(crc, &buf[..n]);
            at += n as u32;
            left -= n;
        }
        Ok(crc)
    }

    /// Compare on-disk bytes against `data`
    pub fn cmp(&mut self, block: u32, off: u32, data: &[u8]) -> Result<std::cmp::Ordering> {
        let disk = self.read_vec(block, off, data.len())?;
        Ok(disk.as_slice().cmp(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::bd::RamBlockDevice;

    fn cfg() -> FsConfig {
        let mut cfg = FsConfig::small_test();
        cfg.prog_size = 4;
        cfg.read_size = 4;
        cfg.pcache_size = 16;
        cfg.rcache_size = 16;
        cfg.block_count = 8;
        cfg
    }

    #[test]
    fn test_reads_see_pending_progs() {
        let ram = RamBlockDevice::new(512, 8);
        let mut bd = Bd::new(Box::new(ram.clone()), &cfg()).unwrap();
        bd.prog(1, 0, b"hello").unwrap();
        // still buffered
        assert_eq!(ram.snapshot(1)[0], 0xff);
        assert_eq!(bd.read_vec(1, 0, 5).unwrap(), b"hello");
        bd.prog(1, 5, b" wor").unwrap();
        bd.prog(1, 9, b"ld, pcache spill").unwrap();
        assert_eq!(bd.read_vec(1, 0, 25).unwrap(), b"hello world, pcache spill");
        bd.sync().unwrap();
        assert_eq!(&ram.snapshot(1)[..25], b"hello world, pcache spill");
    }

    #[test]
    fn test_erase_invalidates() {
        let ram = RamBlockDevice::new(512, 8);
        let mut bd = Bd::new(Box::new(ram), &cfg()).unwrap();
        bd.prog(2, 0, b"abcd").unwrap();
        bd.flush().unwrap();
        assert_eq!(bd.read_vec(2, 0, 4).unwrap(), b"abcd");
        bd.erase(2).unwrap();
        assert_eq!(bd.read_vec(2, 0, 4).unwrap(), vec![0xff; 4]);
    }

    #[test]
    fn test_cksum_and_cmp() {
        let ram = RamBlockDevice::new(512, 8);
        let mut bd = Bd::new(Box::new(ram), &cfg()).unwrap();
        bd.prog(3, 0, b"123456789").unwrap();
        assert_eq!(bd.cksum(3, 0, 9, 0).unwrap(), Checksum::compute(b"123456789"));
        assert_eq!(bd.cmp(3, 0, b"1234").unwrap(), std::cmp::Ordering::Equal);
        assert_eq!(bd.cmp(3, 0, b"1235").unwrap(), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_geometry_mismatch() {
        let ram = RamBlockDevice::new(256, 8);
        assert!(matches!(
            Bd::new(Box::new(ram), &cfg()),
            Err(FsError::Config(_))
        ));
    }
}
