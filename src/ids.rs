//! Record identifiers and directory sharding
//!
//! Records are addressed by positive integers. Every 1000 consecutive IDs
//! share one shard directory:
//!
//! ```text
//! id 1..=1000     -> 0000000001/0000000001.data .. 0000001000.data
//! id 1001..=2000  -> 0000000002/0000001001.data ..
//! ```

use crate::error::{Result, StorageError};

/// Records per shard directory
pub const RECORDS_PER_SHARD: u64 = 1000;

/// Width of zero-padded shard directory names and record file stems
pub const NAME_WIDTH: usize = 10;

/// Shard directory index for a record ID (`id` must be positive)
pub fn shard_index(id: u64) -> u64 {
    id.saturating_sub(1) / RECORDS_PER_SHARD + 1
}

/// Zero-padded filename stem of a record
pub fn file_stem(id: u64) -> String {
    format!("{:0width$}", id, width = NAME_WIDTH)
}

/// Zero-padded directory name of a shard
pub fn shard_dir_name(shard: u64) -> String {
    format!("{:0width$}", shard, width = NAME_WIDTH)
}

/// Parse a textual ID such as `"0000000042"` or `"0000-0000-42"`.
///
/// Hyphens are stripped and leading zeros ignored. Anything that does not
/// resolve to a positive integer is rejected.
pub fn parse_id(raw: &str) -> Result<u64> {
    let digits: String = raw.trim().chars().filter(|c| *c != '-').collect();
    let significant = digits.trim_start_matches('0');

    if significant.is_empty() || !significant.chars().all(|c| c.is_ascii_digit()) {
        return Err(StorageError::MalformedInput(format!("invalid id: {:?}", raw)));
    }

    significant
        .parse::<u64>()
        .map_err(|e| StorageError::MalformedInput(format!("invalid id {:?}: {}", raw, e)))
}
