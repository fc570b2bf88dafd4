//! Storage layer
//!
//! Block devices, the cache every other layer reads and progs through, and
//! the block allocator.

pub mod alloc;
pub mod bd;
pub mod cache;
pub mod checksum;

pub use alloc::Allocator;
pub use bd::{BdStats, BlockDevice, FileBlockDevice, RamBlockDevice};
pub use cache::Bd;
pub use checksum::{Checksum, ChecksumError, CksumBuilder};
