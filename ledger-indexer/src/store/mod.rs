mod sqlite;

pub use sqlite::*;

use crate::error::StoreResult;
use crate::types::{
    BlockRecord, InputRecord, MempoolTransaction, OutputRecord, RawTransactionRecord,
    TransactionBlockRecord, UnspentOutputRecord,
};
use bitcoincore_rpc::bitcoin::{BlockHash, OutPoint, Txid};
use std::sync::Arc;

/// Table-oriented durable store behind the indexer.
///
/// Bulk inserts are unordered: every row is attempted and the rows that fail are
/// reported together in `StoreError::BulkWrite`, each tagged as a duplicate key or
/// some other failure. Rows that succeeded remain written.
pub trait LedgerStore: Send + Sync {
    fn insert_blocks(&self, blocks: &[BlockRecord]) -> StoreResult<()>;
    fn insert_transaction_blocks(&self, rows: &[TransactionBlockRecord]) -> StoreResult<()>;
    fn insert_raw_transactions(&self, rows: &[RawTransactionRecord]) -> StoreResult<()>;
    fn insert_outputs(&self, rows: &[OutputRecord]) -> StoreResult<()>;
    fn insert_inputs(&self, rows: &[InputRecord]) -> StoreResult<()>;
    fn insert_unspent_outputs(&self, rows: &[UnspentOutputRecord]) -> StoreResult<()>;
    fn insert_mempool_transactions(&self, rows: &[MempoolTransaction]) -> StoreResult<()>;

    fn find_unspent_outputs(&self, outpoints: &[OutPoint]) -> StoreResult<Vec<UnspentOutputRecord>>;
    fn find_outputs(&self, outpoints: &[OutPoint]) -> StoreResult<Vec<OutputRecord>>;
    /// Stored inputs consuming any of the outpoints.
    fn find_inputs(&self, outpoints: &[OutPoint]) -> StoreResult<Vec<InputRecord>>;

    /// Returns the number of rows actually removed.
    fn delete_unspent_outputs(&self, outpoints: &[OutPoint]) -> StoreResult<u64>;
    fn delete_mempool_transactions(&self, txids: &[Txid]) -> StoreResult<u64>;

    /// Set the completion flag of each block, in the given order, atomically.
    /// A block is only marked when both height and hash match the stored row,
    /// otherwise nothing is marked and `StoreError::UnmarkedBlock` is returned.
    fn mark_blocks_complete(&self, blocks: &[(u32, BlockHash)]) -> StoreResult<()>;

    fn block_by_height(&self, height: u32) -> StoreResult<Option<BlockRecord>>;
    fn latest_complete_block(&self) -> StoreResult<Option<BlockRecord>>;
    fn first_incomplete_block(&self) -> StoreResult<Option<BlockRecord>>;
    fn inputs_by_transaction(&self, txid: &Txid) -> StoreResult<Vec<InputRecord>>;
    fn raw_transaction(&self, txid: &Txid) -> StoreResult<Option<Vec<u8>>>;
    fn mempool_transaction(&self, txid: &Txid) -> StoreResult<Option<MempoolTransaction>>;
    fn mempool_transaction_ids(&self) -> StoreResult<Vec<Txid>>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;
