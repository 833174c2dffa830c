#![forbid(unsafe_code)]
//! Grid block format and block devices.
//!
//! Every grid block is a fixed [`BLOCK_SIZE`] buffer: a 64-byte header
//! (magic, address, body checksum, body length, kind) followed by the body.
//! Table index blocks carry a body listing the `(address, checksum)` refs of
//! the table's content blocks; the repair queue reads that schema when an
//! index block's repair write completes.
//!
//! The `GridMedia` trait is the seam to the replica's block I/O path;
//! [`MemGrid`] is the in-memory device used by tests and simulations.

use grid_error::GridError;
use grid_types::{
    BLOCK_SIZE, BlockAddress, BlockRef, Checksum, ParseError, TABLE_CONTENT_BLOCKS_MAX,
    ensure_slice, read_le_u32, read_le_u64, read_le_u128,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

/// Magic prefix of every grid block.
pub const GRID_BLOCK_MAGIC: u64 = u64::from_le_bytes(*b"GRIDBLK\0");

/// Header size in bytes. The body occupies the remainder of the block.
pub const BLOCK_HEADER_SIZE: usize = 64;

/// Maximum body length of a single block.
pub const BLOCK_BODY_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

const OFFSET_MAGIC: usize = 0;
const OFFSET_ADDRESS: usize = 8;
const OFFSET_CHECKSUM: usize = 16;
const OFFSET_BODY_LEN: usize = 32;
const OFFSET_KIND: usize = 36;

/// Bytes per content-block entry in an index block body: u64 address
/// followed by u128 checksum.
pub const INDEX_ENTRY_SIZE: usize = 24;

const INDEX_ENTRIES_OFFSET: usize = 4;

// The largest permitted index body must fit a block.
const _: () = {
    assert!(
        INDEX_ENTRIES_OFFSET + (TABLE_CONTENT_BLOCKS_MAX as usize) * INDEX_ENTRY_SIZE
            <= BLOCK_BODY_SIZE
    );
};

/// Compute the 128-bit body checksum: BLAKE3 truncated to its low 16 bytes.
#[must_use]
pub fn checksum_body(body: &[u8]) -> Checksum {
    let hash = blake3::hash(body);
    let mut low = [0_u8; 16];
    low.copy_from_slice(&hash.as_bytes()[..16]);
    Checksum(u128::from_le_bytes(low))
}

/// What a block's body contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Opaque data: a table content block, or any other grid payload.
    Data,
    /// A table index block whose body follows the index schema.
    TableIndex,
}

impl BlockKind {
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::TableIndex => 1,
        }
    }

    fn from_u8(value: u8) -> Result<Self, ParseError> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::TableIndex),
            _ => Err(ParseError::InvalidField {
                field: "kind",
                reason: "unknown block kind",
            }),
        }
    }
}

/// Parsed grid block header.
///
/// The header is authoritative for the block's identity: `repair_complete`
/// trusts `address` and `checksum` from here, not from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub address: BlockAddress,
    pub checksum: Checksum,
    pub body_len: u32,
    pub kind: BlockKind,
}

impl BlockHeader {
    /// Parse the header of a full block buffer.
    ///
    /// Validates magic, kind, and that `body_len` fits the block. Does not
    /// verify the body checksum; see [`verify_block`].
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u64(block, OFFSET_MAGIC)?;
        if magic != GRID_BLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: GRID_BLOCK_MAGIC,
                actual: magic,
            });
        }

        let address = BlockAddress(read_le_u64(block, OFFSET_ADDRESS)?);
        let checksum = Checksum(read_le_u128(block, OFFSET_CHECKSUM)?);
        let body_len = read_le_u32(block, OFFSET_BODY_LEN)?;
        if body_len as usize > BLOCK_BODY_SIZE {
            return Err(ParseError::InvalidField {
                field: "body_len",
                reason: "exceeds block body size",
            });
        }
        let kind = BlockKind::from_u8(ensure_slice(block, OFFSET_KIND, 1)?[0])?;

        // The described body must actually be present in the buffer.
        ensure_slice(block, BLOCK_HEADER_SIZE, body_len as usize)?;

        Ok(Self {
            address,
            checksum,
            body_len,
            kind,
        })
    }

    /// Encode this header into the first [`BLOCK_HEADER_SIZE`] bytes of
    /// `block`, zeroing the reserved tail of the header.
    pub fn write_to(&self, block: &mut [u8]) {
        assert!(block.len() >= BLOCK_HEADER_SIZE);
        block[..BLOCK_HEADER_SIZE].fill(0);
        block[OFFSET_MAGIC..OFFSET_MAGIC + 8].copy_from_slice(&GRID_BLOCK_MAGIC.to_le_bytes());
        block[OFFSET_ADDRESS..OFFSET_ADDRESS + 8]
            .copy_from_slice(&self.address.0.to_le_bytes());
        block[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 16]
            .copy_from_slice(&self.checksum.0.to_le_bytes());
        block[OFFSET_BODY_LEN..OFFSET_BODY_LEN + 4]
            .copy_from_slice(&self.body_len.to_le_bytes());
        block[OFFSET_KIND] = self.kind.to_u8();
    }
}

/// Slice out the body described by a parsed header.
#[must_use]
pub fn block_body<'a>(block: &'a [u8], header: &BlockHeader) -> &'a [u8] {
    &block[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + header.body_len as usize]
}

/// Parse a block and verify its body against the header checksum.
///
/// This is the check the grid runs on every block read and on every repair
/// reply before writing it locally.
pub fn verify_block(block: &[u8]) -> Result<BlockHeader, ParseError> {
    let header = BlockHeader::parse(block)?;
    let computed = checksum_body(block_body(block, &header));
    if computed != header.checksum {
        return Err(ParseError::InvalidField {
            field: "checksum",
            reason: "body checksum mismatch",
        });
    }
    Ok(header)
}

fn build_block(kind: BlockKind, address: BlockAddress, body: &[u8]) -> Vec<u8> {
    assert!(body.len() <= BLOCK_BODY_SIZE, "body exceeds block capacity");

    let mut block = vec![0_u8; BLOCK_SIZE];
    block[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + body.len()].copy_from_slice(body);
    let header = BlockHeader {
        address,
        checksum: checksum_body(body),
        body_len: u32::try_from(body.len()).expect("body fits a block"),
        kind,
    };
    header.write_to(&mut block);
    block
}

/// Build a complete data block (header + body) for `address`.
#[must_use]
pub fn build_data_block(address: BlockAddress, body: &[u8]) -> Vec<u8> {
    build_block(BlockKind::Data, address, body)
}

// ── Table index schema ──────────────────────────────────────────────────────

/// Writer for a table index block body.
#[derive(Debug, Default)]
pub struct IndexBlockBuilder {
    content: Vec<BlockRef>,
}

impl IndexBlockBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one content-block reference.
    pub fn push(&mut self, content: BlockRef) -> &mut Self {
        assert!(
            self.content.len() < TABLE_CONTENT_BLOCKS_MAX as usize,
            "index block full"
        );
        self.content.push(content);
        self
    }

    /// Encode the full index block (header + body) for `address`.
    #[must_use]
    pub fn build(&self, address: BlockAddress) -> Vec<u8> {
        let count = u32::try_from(self.content.len()).expect("bounded by push");
        let mut body = vec![0_u8; INDEX_ENTRIES_OFFSET + self.content.len() * INDEX_ENTRY_SIZE];
        body[..4].copy_from_slice(&count.to_le_bytes());
        for (i, entry) in self.content.iter().enumerate() {
            let at = INDEX_ENTRIES_OFFSET + i * INDEX_ENTRY_SIZE;
            body[at..at + 8].copy_from_slice(&entry.address.0.to_le_bytes());
            body[at + 8..at + 24].copy_from_slice(&entry.checksum.0.to_le_bytes());
        }
        build_block(BlockKind::TableIndex, address, &body)
    }
}

/// Parsed view of a table index block body.
///
/// Lists the content blocks a table references. The count is validated at
/// parse time, so the accessors index infallibly.
#[derive(Debug, Clone, Copy)]
pub struct IndexBlock<'a> {
    content_count: u32,
    body: &'a [u8],
}

impl<'a> IndexBlock<'a> {
    /// Parse an index block body (the block's body, not the full block).
    pub fn parse(body: &'a [u8]) -> Result<Self, ParseError> {
        let content_count = read_le_u32(body, 0)?;
        if content_count > TABLE_CONTENT_BLOCKS_MAX {
            return Err(ParseError::InvalidField {
                field: "content_blocks_used",
                reason: "exceeds table content block limit",
            });
        }
        let needed = INDEX_ENTRIES_OFFSET + content_count as usize * INDEX_ENTRY_SIZE;
        if body.len() < needed {
            return Err(ParseError::InsufficientData {
                needed,
                offset: 0,
                actual: body.len(),
            });
        }
        Ok(Self {
            content_count,
            body,
        })
    }

    /// Number of content blocks this index references.
    #[must_use]
    pub fn content_blocks_used(&self) -> u32 {
        self.content_count
    }

    /// The `(address, checksum)` of content block `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= content_blocks_used()`.
    #[must_use]
    pub fn content_block(&self, index: u32) -> BlockRef {
        assert!(index < self.content_count, "content block index out of range");
        let at = INDEX_ENTRIES_OFFSET + index as usize * INDEX_ENTRY_SIZE;
        let address = read_le_u64(self.body, at).expect("validated at parse");
        let checksum = read_le_u128(self.body, at + 8).expect("validated at parse");
        BlockRef::new(BlockAddress(address), Checksum(checksum))
    }

    /// Iterate all content-block references in ordinal order.
    pub fn content_blocks(&self) -> impl Iterator<Item = BlockRef> + 'a {
        let this = *self;
        (0..self.content_count).map(move |i| this.content_block(i))
    }
}

// ── Block devices ───────────────────────────────────────────────────────────

/// Fixed-size block device over the grid address space.
pub trait GridMedia: Send + Sync {
    /// Read the block at `address`.
    fn read_block(&self, address: BlockAddress) -> Result<Vec<u8>, GridError>;

    /// Write a full block buffer to `address`.
    fn write_block(&self, address: BlockAddress, block: &[u8]) -> Result<(), GridError>;

    /// Number of addressable blocks.
    fn block_count(&self) -> u64;
}

/// In-memory grid device for tests and simulation.
#[derive(Debug)]
pub struct MemGrid {
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    block_count: u64,
}

impl MemGrid {
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            block_count,
        }
    }

    /// Drop the block at `address`, simulating loss or corruption discard.
    pub fn remove(&self, address: BlockAddress) {
        self.blocks.lock().remove(&address.0);
    }

    #[must_use]
    pub fn contains(&self, address: BlockAddress) -> bool {
        self.blocks.lock().contains_key(&address.0)
    }
}

impl GridMedia for MemGrid {
    fn read_block(&self, address: BlockAddress) -> Result<Vec<u8>, GridError> {
        self.blocks
            .lock()
            .get(&address.0)
            .cloned()
            .ok_or(GridError::NotFound(address.0))
    }

    fn write_block(&self, address: BlockAddress, block: &[u8]) -> Result<(), GridError> {
        assert_eq!(block.len(), BLOCK_SIZE, "partial block write");
        if address.0 >= self.block_count {
            return Err(GridError::NoSpace);
        }
        trace!(
            target: "grid::block",
            address = address.0,
            "write_block"
        );
        self.blocks.lock().insert(address.0, block.to_vec());
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}
