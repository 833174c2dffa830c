#![forbid(unsafe_code)]
//! Core value types for the grid repair stack.
//!
//! Defines the address/checksum newtypes carried by every block reference,
//! the grid geometry constants, and the little-endian read helpers used by
//! the on-disk codecs.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of one grid block in bytes, header included.
pub const BLOCK_SIZE: usize = 4096;

/// Maximum number of content blocks a single table's index block may
/// reference. Sizes the repair queue's per-table reservation and the
/// fixed-width received-bitset.
pub const TABLE_CONTENT_BLOCKS_MAX: u32 = 64;

/// 64-bit block number identifying a slot in the grid's on-disk address
/// space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockAddress(pub u64);

impl BlockAddress {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 128-bit content hash carried alongside every block reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checksum(pub u128);

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// A `(address, checksum)` pair naming one specific version of one block.
///
/// This is both the record the repair queue hands to the transport and the
/// entry format of a table index block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub address: BlockAddress,
    pub checksum: Checksum,
}

impl BlockRef {
    #[must_use]
    pub fn new(address: BlockAddress, checksum: Checksum) -> Self {
        Self { address, checksum }
    }

    /// Placeholder value for pre-sized request buffers.
    pub const ZERO: Self = Self {
        address: BlockAddress(0),
        checksum: Checksum(0),
    };
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.checksum)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = read_fixed::<4>(data, offset)?;
    Ok(u32::from_le_bytes(bytes))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = read_fixed::<8>(data, offset)?;
    Ok(u64::from_le_bytes(bytes))
}

#[inline]
pub fn read_le_u128(data: &[u8], offset: usize) -> Result<u128, ParseError> {
    let bytes = read_fixed::<16>(data, offset)?;
    Ok(u128::from_le_bytes(bytes))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize` with an explicit error path.
///
/// On 64-bit platforms this is infallible; on 32-bit it can fail.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [
            0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06,
            0x07, 0x08,
        ];
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
        assert_eq!(
            read_le_u128(&bytes, 0).expect("u128"),
            0x0807_0605_0403_0201_90AB_CDEF_5678_1234
        );
    }

    #[test]
    fn test_read_helpers_out_of_bounds() {
        let bytes = [0_u8; 4];
        assert!(read_le_u32(&bytes, 0).is_ok());
        assert_eq!(
            read_le_u32(&bytes, 1),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 1,
                actual: 3,
            })
        );
        assert!(read_le_u64(&bytes, 0).is_err());
    }

    #[test]
    fn test_ensure_slice_overflow() {
        let bytes = [0_u8; 8];
        assert!(ensure_slice(&bytes, usize::MAX, 2).is_err());
    }

    #[test]
    fn test_block_address_checked_add() {
        assert_eq!(
            BlockAddress(10).checked_add(5),
            Some(BlockAddress(15))
        );
        assert_eq!(BlockAddress(u64::MAX).checked_add(1), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(BlockAddress(42).to_string(), "42");
        assert_eq!(
            Checksum(0xAB).to_string(),
            "000000000000000000000000000000ab"
        );
        let r = BlockRef::new(BlockAddress(7), Checksum(1));
        assert!(r.to_string().starts_with("7@"));
    }

    #[test]
    fn test_u64_to_usize() {
        assert_eq!(u64_to_usize(42, "test"), Ok(42));
        assert_eq!(u64_to_usize(0, "test"), Ok(0));
    }
}
