use crate::types::Table;
use bitcoincore_rpc::bitcoin::{BlockHash, OutPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    DuplicateKey,
    Other,
}

/// A single row that failed inside an unordered bulk insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteError {
    pub index: usize,
    pub kind: WriteErrorKind,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Bulk write into {table} failed for {} row(s), first: {}", errors.len(), first_message(errors))]
    BulkWrite {
        table: Table,
        errors: Vec<WriteError>,
    },

    #[error("Block {height} with hash {hash} not found when marking complete")]
    UnmarkedBlock { height: u32, hash: BlockHash },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

fn first_message(errors: &[WriteError]) -> &str {
    errors.first().map(|e| e.message.as_str()).unwrap_or("")
}

impl StoreError {
    /// True when every failed row of a bulk write was a duplicate key.
    pub fn is_duplicate_only(&self) -> bool {
        match self {
            StoreError::BulkWrite { errors, .. } => {
                !errors.is_empty()
                    && errors.iter().all(|e| e.kind == WriteErrorKind::DuplicateKey)
            }
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to resolve {missing} spent outpoint(s) from the unspent output set, first missing {first}")]
    UnresolvedOutpoints { missing: usize, first: OutPoint },

    #[error("Delete of unspent outputs did not complete successfully: {deleted} deleted but {expected} expected")]
    DeleteCountMismatch { deleted: u64, expected: u64 },

    #[error("Expected hash {expected} for block {height} but was {actual}")]
    HashMismatch {
        height: u32,
        expected: BlockHash,
        actual: BlockHash,
    },

    #[error("Block {0} not found after commit")]
    BlockNotFound(u32),

    #[error("Duplicate outpoint {outpoint} in batch at block {height}")]
    DuplicateOutpoint { outpoint: OutPoint, height: u32 },

    #[error("Block {0} already present in batch")]
    DuplicateBlock(u32),

    #[error("Cannot commit an empty batch")]
    EmptyBatch,

    #[error("Block {0} is already marked complete")]
    AlreadyComplete(u32),

    #[error("Block source error: {0}")]
    Source(String),

    #[error("Commit extension failed: {0}")]
    Extension(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl IndexError {
    pub fn is_duplicate_only(&self) -> bool {
        match self {
            IndexError::Store(e) => e.is_duplicate_only(),
            _ => false,
        }
    }
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn write_error(index: usize, kind: WriteErrorKind) -> WriteError {
        WriteError {
            index,
            kind,
            message: format!("row {}", index),
        }
    }

    #[test]
    fn test_duplicate_only_classification() {
        let dup = StoreError::BulkWrite {
            table: Table::RawTransactions,
            errors: vec![
                write_error(0, WriteErrorKind::DuplicateKey),
                write_error(3, WriteErrorKind::DuplicateKey),
            ],
        };
        assert!(dup.is_duplicate_only());

        let mixed = StoreError::BulkWrite {
            table: Table::RawTransactions,
            errors: vec![
                write_error(0, WriteErrorKind::DuplicateKey),
                write_error(1, WriteErrorKind::Other),
            ],
        };
        assert!(!mixed.is_duplicate_only());

        assert!(!StoreError::Backend("io".to_string()).is_duplicate_only());
        assert!(IndexError::from(dup).is_duplicate_only());
    }
}
