mod rpc;

pub use rpc::*;

use crate::types::SyncBlock;
use bitcoincore_rpc::bitcoin::{Transaction, Txid};
use std::sync::Arc;

/// Where the driver pulls confirmed blocks and pending transactions from.
pub trait BlockSource: Send + Sync {
    fn get_latest_block_height(&self) -> Result<u32, String>;
    fn get_block(&self, height: u32) -> Result<SyncBlock, String>;
    fn get_mempool_txids(&self) -> Result<Vec<Txid>, String>;

    /// None when the node no longer knows the transaction.
    fn get_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, String>;
}

pub type BlockSourceRef = Arc<dyn BlockSource>;
