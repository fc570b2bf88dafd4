//! Filesystem configuration and geometry
//!
//! Provides the knobs that size caches, inline structures and wear-leveling.

use crate::{FsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 文件系统配置（FsConfig）
///
/// 几何参数必须与格式化时写入超级块的值一致：
/// - `read_size` / `prog_size`: 读写粒度
/// - `block_size` / `block_count`: 擦除块大小与数量
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsConfig {
    /// Minimum read granularity in bytes
    pub read_size: u32,

    /// Minimum prog granularity in bytes, commits are padded to this
    pub prog_size: u32,

    /// Erase block size in bytes
    pub block_size: u32,

    /// Number of erase blocks on the device
    pub block_count: u32,

    /// Compactions of an mdir before it is forcibly relocated (-1 = never)
    ///
    /// 磨损均衡：每个元数据块对在 N 次压缩后迁移到新块
    pub block_recycles: i32,

    /// Read cache size, multiple of `read_size`
    pub rcache_size: u32,

    /// Prog cache size, multiple of `prog_size`
    pub pcache_size: u32,

    /// Lookahead window in blocks scanned per allocator pass
    pub lookahead_size: u32,

    /// Budget for trees inlined in their owner's mdir (bshrubs)
    pub inline_size: u32,

    /// Largest data fragment stored inline in a tree record
    pub fragment_size: u32,

    /// Writes at least this large are crystallized into data blocks
    pub crystal_thresh: u32,

    /// Maximum file name length in bytes
    pub name_limit: u32,

    /// Maximum file size in bytes
    pub file_limit: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self::new(4096, 256)
    }
}

impl FsConfig {
    /// 创建默认配置
    pub fn new(block_size: u32, block_count: u32) -> Self {
        Self {
            read_size: 16,
            prog_size: 16,
            block_size,
            block_count,
            block_recycles: 100,
            rcache_size: 64,
            pcache_size: 64,
            lookahead_size: 128,
            inline_size: block_size / 4,
            fragment_size: block_size / 8,
            crystal_thresh: block_size / 4,
            name_limit: 255,
            file_limit: i32::MAX as u32,
        }
    }

    /// Small geometry that forces splits and compactions quickly (tests)
    pub fn small_test() -> Self {
        Self {
            read_size: 1,
            prog_size: 1,
            block_size: 512,
            block_count: 512,
            block_recycles: 8,
            rcache_size: 16,
            pcache_size: 16,
            lookahead_size: 64,
            inline_size: 128,
            fragment_size: 64,
            crystal_thresh: 128,
            name_limit: 32,
            file_limit: 1 << 20,
        }
    }

    /// Bits of a mid that address an rbyd-local rid
    pub fn mbits(&self) -> u32 {
        (31 - self.block_size.leading_zeros()).saturating_sub(3)
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<()> {
        let pow2 = |v: u32| v != 0 && v.is_power_of_two();
        if !pow2(self.read_size) || !pow2(self.prog_size) {
            return Err(FsError::Config(
                "read_size and prog_size must be powers of two".into(),
            ));
        }
        if !pow2(self.block_size) || self.block_size < 128 {
            return Err(FsError::Config(format!(
                "block_size {} must be a power of two >= 128",
                self.block_size
            )));
        }
        if self.block_size % self.read_size != 0 || self.block_size % self.prog_size != 0 {
            return Err(FsError::Config(
                "block_size must be a multiple of read_size and prog_size".into(),
            ));
        }
        if self.block_count < 6 {
            return Err(FsError::Config("block_count must be at least 6".into()));
        }
        if self.rcache_size % self.read_size != 0 || self.pcache_size % self.prog_size != 0 {
            return Err(FsError::Config(
                "cache sizes must be multiples of their io granularity".into(),
            ));
        }
        if self.lookahead_size == 0 {
            return Err(FsError::Config("lookahead_size must be non-zero".into()));
        }
        if self.inline_size > self.block_size / 2 || self.fragment_size > self.block_size / 4 {
            return Err(FsError::Config(
                "inline_size/fragment_size too large for block_size".into(),
            ));
        }
        if self.name_limit == 0 || self.name_limit > self.block_size / 8 {
            return Err(FsError::Config(format!(
                "name_limit {} out of range",
                self.name_limit
            )));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: FsConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
