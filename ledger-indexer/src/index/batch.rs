use crate::error::{IndexError, IndexResult};
use crate::script::{ScriptClassifierRef, address_or_label, is_null_data_label};
use crate::types::{
    BlockRecord, InputRecord, OutputRecord, RawTransactionRecord, SyncBlock,
    TransactionBlockRecord, UnspentOutputRecord, is_coinstake,
};
use bitcoincore_rpc::bitcoin::consensus::encode::serialize;
use bitcoincore_rpc::bitcoin::{BlockHash, Network, OutPoint, Txid};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Pending rows for one or more consecutive blocks, built in memory before a commit.
#[derive(Debug, Clone, Default)]
pub struct StorageBatch {
    pub total_size: u64,
    pub blocks: BTreeMap<u32, BlockRecord>,
    pub transaction_blocks: Vec<TransactionBlockRecord>,
    pub raw_transactions: Vec<RawTransactionRecord>,
    pub outputs: HashMap<OutPoint, OutputRecord>,
    pub inputs: Vec<InputRecord>,
}

impl StorageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// The highest block in the batch.
    pub fn last_block(&self) -> Option<&BlockRecord> {
        self.blocks.values().next_back()
    }

    /// Height and hash of every block, ascending by height.
    pub fn block_keys(&self) -> Vec<(u32, BlockHash)> {
        self.blocks.values().map(|b| (b.height, b.hash)).collect()
    }

    pub fn txids(&self) -> Vec<Txid> {
        self.transaction_blocks.iter().map(|r| r.txid).collect()
    }

    /// Outputs that become spendable, null-data outputs excluded.
    pub fn unspent_outputs(&self) -> Vec<UnspentOutputRecord> {
        self.outputs
            .values()
            .filter(|o| !is_null_data_label(&o.address))
            .map(UnspentOutputRecord::from)
            .collect()
    }

    /// Outpoints of inputs still lacking address or value.
    pub fn unresolved_outpoints(&self) -> Vec<OutPoint> {
        let mut seen = HashSet::new();
        self.inputs
            .iter()
            .filter(|i| !i.is_resolved())
            .map(|i| i.outpoint)
            .filter(|o| seen.insert(*o))
            .collect()
    }

    /// Distinct outpoints consumed by the batch inputs, in input order.
    pub fn spent_outpoints(&self) -> Vec<OutPoint> {
        let mut seen = HashSet::new();
        self.inputs
            .iter()
            .map(|i| i.outpoint)
            .filter(|o| seen.insert(*o))
            .collect()
    }
}

/// Turns decoded blocks into batch rows without touching the store.
pub struct BatchAccumulator {
    network: Network,
    classifier: ScriptClassifierRef,
    store_raw_transactions: bool,
    proof_of_stake: bool,
}

impl BatchAccumulator {
    pub fn new(
        network: Network,
        classifier: ScriptClassifierRef,
        store_raw_transactions: bool,
        proof_of_stake: bool,
    ) -> Self {
        Self {
            network,
            classifier,
            store_raw_transactions,
            proof_of_stake,
        }
    }

    /// Append one block to the batch. On error the batch is left partially filled
    /// and must be discarded.
    pub fn accumulate(&self, batch: &mut StorageBatch, block: &SyncBlock) -> IndexResult<()> {
        let height = block.info.height;
        if batch.blocks.contains_key(&height) {
            let msg = format!("Block {} already accumulated in this batch", height);
            error!("{}", msg);
            return Err(IndexError::DuplicateBlock(height));
        }

        batch
            .blocks
            .insert(height, BlockRecord::from(&block.info));
        batch.total_size += block.info.size;

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = tx.compute_txid();
            let coinbase = tx.is_coinbase();
            let coinstake = self.proof_of_stake && is_coinstake(tx);

            batch.transaction_blocks.push(TransactionBlockRecord {
                block_height: height,
                txid,
                tx_index: tx_index as u32,
                output_count: tx.output.len() as u32,
            });

            if self.store_raw_transactions {
                batch.raw_transactions.push(RawTransactionRecord {
                    txid,
                    raw: serialize(tx),
                });
            }

            for (vout, output) in tx.output.iter().enumerate() {
                let outpoint = OutPoint::new(txid, vout as u32);
                let class = self
                    .classifier
                    .classify(self.network, &output.script_pubkey);

                let record = OutputRecord {
                    outpoint,
                    address: address_or_label(class.as_ref()),
                    block_height: height,
                    value: output.value.to_sat(),
                    coinbase,
                    coinstake,
                    script_hex: output.script_pubkey.to_hex_string(),
                };

                if batch.outputs.insert(outpoint, record).is_some() {
                    let msg = format!(
                        "Duplicate outpoint {} in batch at block {}",
                        outpoint, height
                    );
                    error!("{}", msg);
                    return Err(IndexError::DuplicateOutpoint { outpoint, height });
                }
            }

            if coinbase {
                continue;
            }

            for input in &tx.input {
                let outpoint = input.previous_output;

                // Same-batch spends resolve here, the rest at commit time
                let (address, value) = match batch.outputs.get(&outpoint) {
                    Some(spent) => (Some(spent.address.clone()), Some(spent.value)),
                    None => (None, None),
                };

                batch.inputs.push(InputRecord {
                    outpoint,
                    txid,
                    block_height: height,
                    address,
                    value,
                });
            }
        }

        debug!(
            "Accumulated block {} ({} txs), batch now holds {} blocks",
            height,
            block.transactions.len(),
            batch.blocks.len()
        );

        Ok(())
    }
}
