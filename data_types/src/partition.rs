//! Partition schemas and the key ranges they carve out of a table.

use snafu::{ensure, Snafu};

/// Number of slots in the fixed-slot hash scheme.
pub const FIXED_HASH_SLOTS: u32 = 16384;

/// Size of the multi-column hash-code space (16-bit hash codes).
const HASH_CODE_SPACE: u32 = 1 << 16;

/// How a table's key space maps onto tablets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSchema {
    /// Hash of the hash-key columns into the 16-bit hash-code space, split
    /// into contiguous ranges.
    MultiColumnHash,
    /// Hash into [`FIXED_HASH_SLOTS`] fixed slots.
    FixedSlotHash,
    /// Range partitioning on the encoded primary key, bounded by split keys.
    RangeOnKey,
}

/// An inclusive-exclusive key range; an empty bound is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    /// Inclusive start; empty means "from the beginning of the key space".
    pub partition_key_start: Vec<u8>,
    /// Exclusive end; empty means "to the end of the key space".
    pub partition_key_end: Vec<u8>,
}

impl Partition {
    /// Construct from bounds.
    pub fn new(partition_key_start: Vec<u8>, partition_key_end: Vec<u8>) -> Self {
        Self {
            partition_key_start,
            partition_key_end,
        }
    }

    /// Whether `key` falls inside this range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.partition_key_start.as_slice()
            && (self.partition_key_end.is_empty() || key < self.partition_key_end.as_slice())
    }
}

/// Errors computing partitions.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum PartitionError {
    #[snafu(display("number of tablets must be greater than 0"))]
    NoTablets,

    #[snafu(display(
        "cannot create {} tablets: hash space only has {} codes",
        num_tablets,
        space
    ))]
    TooManyHashTablets { num_tablets: usize, space: u32 },

    #[snafu(display("split keys must be non-empty, unique and ascending"))]
    BadSplitKeys,
}

impl PartitionSchema {
    /// Carve the key space into partitions.
    ///
    /// Hash schemas split their hash-code space into `num_tablets` contiguous
    /// ranges with 2-byte big-endian encoded boundaries. The range schema
    /// ignores `num_tablets` and derives `split_keys.len() + 1` partitions
    /// from the ascending split keys.
    pub fn create_partitions(
        &self,
        num_tablets: usize,
        split_keys: &[Vec<u8>],
    ) -> Result<Vec<Partition>, PartitionError> {
        match self {
            Self::MultiColumnHash => hash_partitions(num_tablets, HASH_CODE_SPACE),
            Self::FixedSlotHash => hash_partitions(num_tablets, FIXED_HASH_SLOTS),
            Self::RangeOnKey => range_partitions(split_keys),
        }
    }
}

fn encode_hash_boundary(boundary: u32) -> Vec<u8> {
    ((boundary & 0xffff) as u16).to_be_bytes().to_vec()
}

fn hash_partitions(num_tablets: usize, space: u32) -> Result<Vec<Partition>, PartitionError> {
    ensure!(num_tablets > 0, NoTabletsSnafu);
    ensure!(
        num_tablets as u64 <= space as u64,
        TooManyHashTabletsSnafu { num_tablets, space }
    );

    let num_tablets = num_tablets as u64;
    let space = space as u64;
    let mut partitions = Vec::with_capacity(num_tablets as usize);
    for i in 0..num_tablets {
        let start = if i == 0 {
            vec![]
        } else {
            encode_hash_boundary((i * space / num_tablets) as u32)
        };
        let end = if i == num_tablets - 1 {
            vec![]
        } else {
            encode_hash_boundary(((i + 1) * space / num_tablets) as u32)
        };
        partitions.push(Partition::new(start, end));
    }
    Ok(partitions)
}

fn range_partitions(split_keys: &[Vec<u8>]) -> Result<Vec<Partition>, PartitionError> {
    ensure!(
        split_keys.windows(2).all(|w| w[0] < w[1]) && !split_keys.iter().any(|k| k.is_empty()),
        BadSplitKeysSnafu
    );

    let mut partitions = Vec::with_capacity(split_keys.len() + 1);
    let mut start = vec![];
    for key in split_keys {
        partitions.push(Partition::new(start, key.clone()));
        start = key.clone();
    }
    partitions.push(Partition::new(start, vec![]));
    Ok(partitions)
}
