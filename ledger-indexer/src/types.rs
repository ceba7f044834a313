use bitcoincore_rpc::bitcoin::{Block, BlockHash, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The tables written by the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Blocks,
    TransactionBlocks,
    RawTransactions,
    Outputs,
    Inputs,
    UnspentOutputs,
    Mempool,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Blocks => "blocks",
            Table::TransactionBlocks => "transaction_blocks",
            Table::RawTransactions => "raw_transactions",
            Table::Outputs => "outputs",
            Table::Inputs => "inputs",
            Table::UnspentOutputs => "unspent_outputs",
            Table::Mempool => "mempool",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub height: u32,
    pub hash: BlockHash,
    pub previous_hash: Option<BlockHash>,
    pub size: u64,
    pub time: u32,
    pub transaction_count: u32,
}

/// A decoded block together with its transactions, the unit handed to the accumulator.
#[derive(Debug, Clone)]
pub struct SyncBlock {
    pub info: BlockInfo,
    pub transactions: Vec<Transaction>,
}

impl SyncBlock {
    pub fn from_block(height: u32, block: &Block) -> Self {
        let info = BlockInfo {
            height,
            hash: block.block_hash(),
            previous_hash: if height == 0 {
                None
            } else {
                Some(block.header.prev_blockhash)
            },
            size: block.total_size() as u64,
            time: block.header.time,
            transaction_count: block.txdata.len() as u32,
        };

        Self {
            info,
            transactions: block.txdata.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub height: u32,
    pub hash: BlockHash,
    pub previous_hash: Option<BlockHash>,
    pub size: u64,
    pub time: u32,
    pub transaction_count: u32,
    pub sync_complete: bool,
}

impl From<&BlockInfo> for BlockRecord {
    fn from(info: &BlockInfo) -> Self {
        Self {
            height: info.height,
            hash: info.hash,
            previous_hash: info.previous_hash,
            size: info.size,
            time: info.time,
            transaction_count: info.transaction_count,
            sync_complete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionBlockRecord {
    pub block_height: u32,
    pub txid: Txid,
    pub tx_index: u32,
    pub output_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransactionRecord {
    pub txid: Txid,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub outpoint: OutPoint,
    /// First address of the script, or its script-kind label, or "none".
    pub address: String,
    pub block_height: u32,
    pub value: u64,
    pub coinbase: bool,
    pub coinstake: bool,
    pub script_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRecord {
    /// The outpoint being spent.
    pub outpoint: OutPoint,
    /// The spending transaction.
    pub txid: Txid,
    pub block_height: u32,
    // Unresolved until filled from the batch or the unspent-output set
    pub address: Option<String>,
    pub value: Option<u64>,
}

impl InputRecord {
    pub fn is_resolved(&self) -> bool {
        self.address.is_some() && self.value.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutputRecord {
    pub address: String,
    pub outpoint: OutPoint,
    pub value: u64,
    pub block_height: u32,
}

impl From<&OutputRecord> for UnspentOutputRecord {
    fn from(output: &OutputRecord) -> Self {
        Self {
            address: output.address.clone(),
            outpoint: output.outpoint,
            value: output.value,
            block_height: output.block_height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolOutput {
    pub value: u64,
    pub script_hex: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolInput {
    pub outpoint: OutPoint,
    pub address: Option<String>,
    pub value: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolTransaction {
    pub txid: Txid,
    // Unix time in milliseconds
    pub first_seen: u64,
    pub outputs: Vec<MempoolOutput>,
    pub inputs: Vec<MempoolInput>,
    pub address_outputs: BTreeSet<String>,
    pub address_inputs: BTreeSet<String>,
}

impl MempoolTransaction {
    pub fn new(txid: Txid, first_seen: u64) -> Self {
        Self {
            txid,
            first_seen,
            outputs: Vec::new(),
            inputs: Vec::new(),
            address_outputs: BTreeSet::new(),
            address_inputs: BTreeSet::new(),
        }
    }
}

/// Rust-bitcoin has no coinstake notion: a coinstake has inputs and an empty first output.
pub fn is_coinstake(tx: &Transaction) -> bool {
    !tx.is_coinbase()
        && !tx.input.is_empty()
        && tx.output.len() >= 2
        && tx.output[0].value.to_sat() == 0
        && tx.output[0].script_pubkey.is_empty()
}
