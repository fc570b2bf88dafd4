//! rbydfs: power-loss resilient flash filesystem
//!
//! 面向嵌入式闪存的掉电安全文件系统
//!
//! ## 架构
//! - 存储层: block devices, read/prog caches, lookahead allocator
//! - rbyd: append-only red-black trees, one per erase block
//! - btree: rbyds linked into weighted B-trees; bshrubs inline small trees
//! - mdir: metadata pairs, the mtree and the mroot chain, global state
//! - fs: paths, directories, files and open handles
//!
//! Everything runs single-threaded and synchronously; callers serialize
//! access to a [`Filesystem`].

/// Debug-level log line for structural events
macro_rules! debug_log {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

pub mod btree;
pub mod config;
pub mod fs;
pub mod mdir;
pub mod rbyd;
pub mod storage;

mod error;

pub use config::FsConfig;
pub use error::{FsError, Result};
pub use fs::{DirEntry, DirHandle, FileHandle, FileType, Filesystem, FsUsage};
pub use storage::{BlockDevice, FileBlockDevice, RamBlockDevice};
