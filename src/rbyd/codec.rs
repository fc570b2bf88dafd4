//! On-disk encodings
//!
//! Record header: `tag (be16) | leb128 weight (<=31 bits) | leb128 size (<=28 bits)`.
//! Fixed-shape payloads (pointers, checksums, geometry, global state) are
//! built from the same leb128 primitive plus little-endian u32 checksums.

use crate::rbyd::tag::Tag;
use crate::{FsError, Result};

pub const WEIGHT_BITS: u32 = 31;
pub const SIZE_BITS: u32 = 28;

/// Longest possible record header
pub const HEADER_MAX: usize = 2 + 5 + 4;

/// Encoded length of `v` as leb128
pub fn leb128_len(v: u32) -> usize {
    let bits = 32 - v.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

pub fn leb128_put(buf: &mut Vec<u8>, v: u32, bits: u32) {
    assert!(
        bits >= 32 || v < (1u32 << bits),
        "leb128 value {:#x} exceeds {} bits",
        v,
        bits
    );
    let mut v = v;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Cursor for decoding payloads
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn leb128(&mut self, bits: u32) -> Result<u32> {
        let mut v: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| FsError::corrupt("truncated leb128"))?;
            self.pos += 1;
            v |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 35 {
                return Err(FsError::corrupt("leb128 too long"));
            }
        }
        if v >= 1u64 << bits {
            return Err(FsError::corrupt(format!(
                "leb128 value {:#x} exceeds {} bits",
                v, bits
            )));
        }
        Ok(v as u32)
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| FsError::corrupt("truncated u32"))?;
        self.pos += 4;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or_else(|| FsError::corrupt("truncated payload"))?;
        self.pos += n;
        Ok(bytes)
    }
}

/// Decoded record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: Tag,
    pub weight: u32,
    pub size: u32,
    /// Bytes taken by the header itself
    pub len: usize,
}

pub fn header_len(weight: u32, size: u32) -> usize {
    2 + leb128_len(weight) + leb128_len(size)
}

pub fn encode_header(buf: &mut Vec<u8>, tag: Tag, weight: u32, size: u32) {
    buf.extend_from_slice(&tag.to_be_bytes());
    leb128_put(buf, weight, WEIGHT_BITS);
    leb128_put(buf, size, SIZE_BITS);
}

pub fn decode_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < 2 {
        return Err(FsError::corrupt("truncated tag"));
    }
    let tag = u16::from_be_bytes([buf[0], buf[1]]);
    let mut d = Decoder::new(&buf[2..]);
    let weight = d.leb128(WEIGHT_BITS)?;
    let size = d.leb128(SIZE_BITS)?;
    Ok(Header {
        tag,
        weight,
        size,
        len: 2 + d.pos(),
    })
}

/// Data block pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bptr {
    pub block: u32,
    pub off: u32,
    pub size: u32,
    /// crc32c of `size` bytes at `off`
    pub cksum: u32,
}

impl Bptr {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        leb128_put(buf, self.size, SIZE_BITS);
        leb128_put(buf, self.block, 32);
        leb128_put(buf, self.off, SIZE_BITS);
        buf.extend_from_slice(&self.cksum.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        let size = d.leb128(SIZE_BITS)?;
        let block = d.leb128(32)?;
        let off = d.leb128(SIZE_BITS)?;
        let cksum = d.u32_le()?;
        Ok(Self {
            block,
            off,
            size,
            cksum,
        })
    }
}

/// Reference to an rbyd in another block, weight lives in the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchRef {
    pub block: u32,
    pub trunk: u32,
    pub cksum: u32,
}

impl BranchRef {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        leb128_put(buf, self.block, 32);
        leb128_put(buf, self.trunk, SIZE_BITS);
        buf.extend_from_slice(&self.cksum.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            block: d.leb128(32)?,
            trunk: d.leb128(SIZE_BITS)?,
            cksum: d.u32_le()?,
        })
    }
}

/// Root reference of a standalone B-tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreeRef {
    pub weight: u32,
    pub block: u32,
    pub trunk: u32,
    pub cksum: u32,
}

impl BtreeRef {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        leb128_put(buf, self.weight, WEIGHT_BITS);
        BranchRef {
            block: self.block,
            trunk: self.trunk,
            cksum: self.cksum,
        }
        .encode(buf);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        let weight = d.leb128(WEIGHT_BITS)?;
        let b = BranchRef::decode(d.rest())?;
        Ok(Self {
            weight,
            block: b.block,
            trunk: b.trunk,
            cksum: b.cksum,
        })
    }
}

/// Reference to a tree inlined in its owner's rbyd
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrubRef {
    pub weight: u32,
    pub trunk: u32,
}

impl ShrubRef {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        leb128_put(buf, self.weight, WEIGHT_BITS);
        leb128_put(buf, self.trunk, SIZE_BITS);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            weight: d.leb128(WEIGHT_BITS)?,
            trunk: d.leb128(SIZE_BITS)?,
        })
    }
}

/// Erase-state checksum: crc32c of the next `size` bytes after a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ecksum {
    pub size: u32,
    pub cksum: u32,
}

impl Ecksum {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        leb128_put(buf, self.size, SIZE_BITS);
        buf.extend_from_slice(&self.cksum.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            size: d.leb128(SIZE_BITS)?,
            cksum: d.u32_le()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub block_count: u32,
}

impl Geometry {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        leb128_put(buf, self.block_size - 1, 32);
        leb128_put(buf, self.block_count - 1, 32);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            block_size: d.leb128(32)? + 1,
            block_count: d.leb128(32)? + 1,
        })
    }
}

/// Metadata pair, the two blocks of an mdir
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MdirPair(pub [u32; 2]);

impl MdirPair {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        leb128_put(buf, self.0[0], 32);
        leb128_put(buf, self.0[1], 32);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self([d.leb128(32)?, d.leb128(32)?]))
    }

    pub fn swapped(&self) -> Self {
        Self([self.0[1], self.0[0]])
    }

    pub fn contains(&self, block: u32) -> bool {
        self.0[0] == block || self.0[1] == block
    }
}

/// Name payload, entries are ordered by (did, name)
pub fn encode_name(buf: &mut Vec<u8>, did: u32, name: &[u8]) {
    leb128_put(buf, did, 32);
    buf.extend_from_slice(name);
}

pub fn decode_name(buf: &[u8]) -> Result<(u32, &[u8])> {
    let mut d = Decoder::new(buf);
    let did = d.leb128(32)?;
    Ok((did, d.rest()))
}

pub fn encode_leb(v: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    leb128_put(&mut buf, v, 32);
    buf
}

pub fn decode_leb(buf: &[u8]) -> Result<u32> {
    Decoder::new(buf).leb128(32)
}
