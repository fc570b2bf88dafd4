//! Checksum 验证模块
//!
//! Every rbyd commit is terminated by a crc32c over the commit's bytes. The
//! same running crc doubles as the source of each record's valid bit: a
//! record is only considered written if its valid bit equals the parity of
//! the crc accumulated before it.
//!
//! ## 使用示例
//! ```ignore
//! use rbydfs::storage::checksum::CksumBuilder;
//!
//! let mut builder = CksumBuilder::new();
//! builder.update(b"Hello, ");
//! builder.update(b"World!");
//! assert!(builder.verify(Checksum::compute(b"Hello, World!")).is_ok());
//! ```

use thiserror::Error;

/// Checksum 计算器
pub struct Checksum;

impl Checksum {
    /// crc32c of `data` starting from a zero state
    pub fn compute(data: &[u8]) -> u32 {
        crc32c::crc32c(data)
    }

    /// Continue a running crc32c with more bytes
    pub fn append(crc: u32, data: &[u8]) -> u32 {
        crc32c::crc32c_append(crc, data)
    }

    /// Parity of a crc, the expected valid bit of the next record
    pub fn parity(crc: u32) -> bool {
        crc.count_ones() & 1 == 1
    }

    /// crc32c of `len` bytes of `byte`, used for erased-state checks
    pub fn fill(crc: u32, byte: u8, len: usize) -> u32 {
        let chunk = [byte; 64];
        let mut crc = crc;
        let mut left = len;
        while left > 0 {
            let n = left.min(chunk.len());
            crc = Self::append(crc, &chunk[..n]);
            left -= n;
        }
        crc
    }

    pub fn verify(data: &[u8], expected: u32) -> Result<(), ChecksumError> {
        let actual = Self::compute(data);
        if actual != expected {
            return Err(ChecksumError::Mismatch {
                expected,
                actual,
                data_len: data.len(),
            });
        }
        Ok(())
    }
}

/// 增量 checksum 构建器
#[derive(Debug, Clone, Copy, Default)]
pub struct CksumBuilder {
    crc: u32,
    len: usize,
}

impl CksumBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(crc: u32) -> Self {
        Self { crc, len: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.crc = Checksum::append(self.crc, data);
        self.len += data.len();
    }

    pub fn state(&self) -> u32 {
        self.crc
    }

    pub fn parity(&self) -> bool {
        Checksum::parity(self.crc)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn verify(&self, expected: u32) -> Result<(), ChecksumError> {
        if self.crc != expected {
            return Err(ChecksumError::Mismatch {
                expected,
                actual: self.crc,
                data_len: self.len,
            });
        }
        Ok(())
    }
}

/// Checksum 错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x} over {data_len} bytes")]
    Mismatch {
        expected: u32,
        actual: u32,
        data_len: usize,
    },
}

impl From<ChecksumError> for crate::FsError {
    fn from(err: ChecksumError) -> Self {
        crate::FsError::Corrupt(err.to_string())
    }
}
