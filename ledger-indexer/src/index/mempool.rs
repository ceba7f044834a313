use super::run_blocking;
use crate::error::IndexResult;
use crate::script::{ScriptClassifierRef, mempool_address};
use crate::state::GlobalStateRef;
use crate::store::LedgerStoreRef;
use crate::types::{MempoolInput, MempoolOutput, MempoolTransaction};
use bitcoincore_rpc::bitcoin::{Network, OutPoint, Transaction, Txid};
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// Keeps the stored mempool table and the in-process pending id set in step.
pub struct MempoolSynchronizer {
    network: Network,
    classifier: ScriptClassifierRef,
    store: LedgerStoreRef,
    state: GlobalStateRef,
}

impl MempoolSynchronizer {
    pub fn new(
        network: Network,
        classifier: ScriptClassifierRef,
        store: LedgerStoreRef,
        state: GlobalStateRef,
    ) -> Self {
        Self {
            network,
            classifier,
            store,
            state,
        }
    }

    /// Store the given unconfirmed transactions and track their ids.
    /// Returns how many ids were not tracked before.
    pub async fn ingest(&self, transactions: Vec<Transaction>) -> IndexResult<usize> {
        if transactions.is_empty() {
            return Ok(0);
        }

        let first_seen = now_millis();
        let mut entries = Vec::with_capacity(transactions.len());
        let mut outpoints = HashSet::new();

        for tx in &transactions {
            let mut entry = MempoolTransaction::new(tx.compute_txid(), first_seen);

            for output in &tx.output {
                let class = self
                    .classifier
                    .classify(self.network, &output.script_pubkey);
                let Some(address) = mempool_address(class.as_ref()) else {
                    continue;
                };

                entry.address_outputs.insert(address.clone());
                entry.outputs.push(MempoolOutput {
                    value: output.value.to_sat(),
                    script_hex: output.script_pubkey.to_hex_string(),
                    address,
                });
            }

            for input in &tx.input {
                outpoints.insert(input.previous_output);
                entry.inputs.push(MempoolInput {
                    outpoint: input.previous_output,
                    address: None,
                    value: None,
                });
            }

            entries.push(entry);
        }

        // Resolve against confirmed history only, unknown outpoints stay unresolved
        let outpoints: Vec<OutPoint> = outpoints.into_iter().collect();
        let found = run_blocking(&self.store, move |store| Ok(store.find_outputs(&outpoints)?))
            .await?;
        let found: HashMap<OutPoint, (String, u64)> = found
            .into_iter()
            .map(|o| (o.outpoint, (o.address, o.value)))
            .collect();

        let mut resolved = 0;
        for entry in entries.iter_mut() {
            for input in entry.inputs.iter_mut() {
                if let Some((address, value)) = found.get(&input.outpoint) {
                    input.address = Some(address.clone());
                    input.value = Some(*value);
                    entry.address_inputs.insert(address.clone());
                    resolved += 1;
                }
            }
        }

        let txids: Vec<Txid> = entries.iter().map(|e| e.txid).collect();
        run_blocking(&self.store, move |store| {
            match store.insert_mempool_transactions(&entries) {
                Ok(()) => Ok(()),
                Err(e) if e.is_duplicate_only() => {
                    debug!("Ignored already known mempool transactions: {}", e);
                    Ok(())
                }
                Err(e) => {
                    error!("Insert into mempool failed: {}", e);
                    Err(e.into())
                }
            }
        })
        .await?;

        let mempool = self.state.mempool();
        let added = txids.into_iter().filter(|txid| mempool.add(*txid)).count();

        info!(
            "Ingested {} mempool transactions ({} new, {} inputs resolved), view size {}",
            transactions.len(),
            added,
            resolved,
            mempool.len()
        );

        Ok(added)
    }

    /// Explicit eviction from both the store and the pending id set.
    pub async fn evict(&self, txids: Vec<Txid>) -> IndexResult<u64> {
        if txids.is_empty() {
            return Ok(0);
        }

        let mempool = self.state.mempool();
        for txid in &txids {
            mempool.remove(txid);
        }

        let count = txids.len();
        let deleted =
            run_blocking(&self.store, move |store| Ok(store.delete_mempool_transactions(&txids)?))
                .await?;

        info!("Evicted {} of {} mempool transactions", deleted, count);
        Ok(deleted)
    }

    /// Fill the pending id set from the stored mempool, used on startup.
    pub async fn load_from_store(&self) -> IndexResult<usize> {
        let ids = run_blocking(&self.store, |store| Ok(store.mempool_transaction_ids()?)).await?;

        let mempool = self.state.mempool();
        let added = ids.into_iter().filter(|txid| mempool.add(*txid)).count();

        info!("Loaded {} mempool transactions from store", added);
        Ok(added)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
