use crate::error::{IndexError, IndexResult};
use crate::store::LedgerStoreRef;
use bitcoincore_rpc::bitcoin::OutPoint;
use std::collections::HashMap;

/// Fills spent-output provenance from the persisted unspent-output set.
#[derive(Clone)]
pub struct UtxoResolver {
    store: LedgerStoreRef,
}

impl UtxoResolver {
    pub fn new(store: LedgerStoreRef) -> Self {
        Self { store }
    }

    /// Every requested outpoint must be present; a missing one means the batch
    /// spends an output the index does not know as unspent.
    pub fn resolve(&self, outpoints: &[OutPoint]) -> IndexResult<HashMap<OutPoint, (String, u64)>> {
        if outpoints.is_empty() {
            return Ok(HashMap::new());
        }

        let found = self.store.find_unspent_outputs(outpoints)?;

        let mut resolved = HashMap::with_capacity(found.len());
        for utxo in found {
            resolved.insert(utxo.outpoint, (utxo.address, utxo.value));
        }

        let missing: Vec<&OutPoint> = outpoints
            .iter()
            .filter(|o| !resolved.contains_key(*o))
            .collect();

        if let Some(first) = missing.first() {
            let msg = format!(
                "Failed to resolve {} of {} spent outpoints, first missing {}",
                missing.len(),
                outpoints.len(),
                first
            );
            error!("{}", msg);
            return Err(IndexError::UnresolvedOutpoints {
                missing: missing.len(),
                first: **first,
            });
        }

        debug!("Resolved {} spent outpoints", resolved.len());
        Ok(resolved)
    }
}
