use super::batch::StorageBatch;
use super::resolver::UtxoResolver;
use super::run_blocking;
use crate::error::{IndexError, IndexResult, StoreError, StoreResult};
use crate::state::GlobalStateRef;
use crate::store::{LedgerStore, LedgerStoreRef};
use crate::types::{BlockRecord, Table, UnspentOutputRecord};
use bitcoincore_rpc::bitcoin::{BlockHash, OutPoint};
use std::collections::HashSet;
use std::time::Instant;
use tokio::task::JoinHandle;

/// Hooks invoked by the commit pipeline around its durable writes.
pub trait CommitExtension: Send + Sync {
    /// Called before any write, may enrich the batch.
    fn before_write(&self, _batch: &mut StorageBatch) -> Result<(), String> {
        Ok(())
    }

    /// Called after the spent outputs were removed from the unspent set and before
    /// the blocks are marked complete.
    ///
    /// Runs on the async worker that drives the commit, so store access here must
    /// stay to a few keyed reads or writes. Bulk work belongs in a task of its own.
    fn after_spend(&self, _batch: &StorageBatch, _store: &dyn LedgerStore) -> Result<(), String> {
        Ok(())
    }
}

type InsertFn<T> = fn(&dyn LedgerStore, &[T]) -> StoreResult<()>;

pub struct CommitPipeline {
    store: LedgerStoreRef,
    state: GlobalStateRef,
    resolver: UtxoResolver,
}

impl CommitPipeline {
    pub fn new(store: LedgerStoreRef, state: GlobalStateRef) -> Self {
        let resolver = UtxoResolver::new(store.clone());
        Self {
            store,
            state,
            resolver,
        }
    }

    /// Write the batch, remove what it spends from the unspent set, mark its blocks
    /// complete and return the re-read highest block.
    ///
    /// Only raw transaction duplicates are tolerated. Inputs are resolved in place,
    /// so a failed batch can be handed to `recommit` as is.
    pub async fn commit(
        &self,
        batch: &mut StorageBatch,
        extension: Option<&dyn CommitExtension>,
    ) -> IndexResult<BlockRecord> {
        self.commit_batch(batch, extension, false).await
    }

    /// Retry of a failed commit: duplicate keys are tolerated on every insert.
    ///
    /// A batch with a block already marked complete is refused with
    /// `AlreadyComplete` before anything is written. Outputs that a stored input
    /// outside the batch already consumes are not put back into the unspent set.
    /// The unspent deletion count is still checked, so a batch whose spends already
    /// landed fails with `DeleteCountMismatch`.
    pub async fn recommit(
        &self,
        batch: &mut StorageBatch,
        extension: Option<&dyn CommitExtension>,
    ) -> IndexResult<BlockRecord> {
        warn!(
            "Recommitting batch of {} blocks with duplicate tolerance",
            batch.block_count()
        );
        self.commit_batch(batch, extension, true).await
    }

    async fn commit_batch(
        &self,
        batch: &mut StorageBatch,
        extension: Option<&dyn CommitExtension>,
        retry: bool,
    ) -> IndexResult<BlockRecord> {
        let begin = Instant::now();

        if let Some(extension) = extension {
            extension.before_write(batch).map_err(|e| {
                let msg = format!("before_write hook failed: {}", e);
                error!("{}", msg);
                IndexError::Extension(msg)
            })?;
        }

        let (first_height, last) = match (batch.blocks.keys().next(), batch.last_block()) {
            (Some(first), Some(last)) => (*first, last.clone()),
            _ => {
                error!("Refusing to commit an empty batch");
                return Err(IndexError::EmptyBatch);
            }
        };

        if retry {
            self.ensure_incomplete(batch).await?;
        }

        // Resolve first so an unknown spend leaves the store untouched
        self.resolve_inputs(batch).await?;

        self.evict_confirmed(batch).await?;

        let unspent = if retry {
            self.unspent_for_retry(batch).await?
        } else {
            batch.unspent_outputs()
        };
        self.write_rows(batch, unspent, retry).await?;

        let spent = batch.spent_outpoints();
        if !spent.is_empty() {
            let expected = spent.len() as u64;
            let deleted =
                run_blocking(&self.store, move |store| Ok(store.delete_unspent_outputs(&spent)?))
                    .await?;

            if deleted != expected {
                let msg = format!(
                    "Delete of unspent outputs did not complete successfully for blocks {}-{}: {} deleted but {} expected",
                    first_height, last.height, deleted, expected
                );
                error!("{}", msg);
                return Err(IndexError::DeleteCountMismatch { deleted, expected });
            }
        }

        if let Some(extension) = extension {
            extension
                .after_spend(batch, self.store.as_ref())
                .map_err(|e| {
                    let msg = format!("after_spend hook failed for block {}: {}", last.height, e);
                    error!("{}", msg);
                    IndexError::Extension(msg)
                })?;
        }

        let keys = batch.block_keys();
        run_blocking(&self.store, move |store| {
            match store.mark_blocks_complete(&keys) {
                Ok(()) => Ok(()),
                Err(StoreError::UnmarkedBlock { height, hash }) => {
                    Err(unmarked_block_error(store, height, hash))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        let height = last.height;
        let stored = run_blocking(&self.store, move |store| Ok(store.block_by_height(height)?))
            .await?
            .ok_or_else(|| {
                let msg = format!("Block {} not found after commit", height);
                error!("{}", msg);
                IndexError::BlockNotFound(height)
            })?;

        if stored.hash != last.hash {
            let msg = format!(
                "Expected hash {} for block {} but was {}",
                last.hash, height, stored.hash
            );
            error!("{}", msg);
            return Err(IndexError::HashMismatch {
                height,
                expected: last.hash,
                actual: stored.hash,
            });
        }

        info!(
            "Committed blocks {}-{}: txs {}, outputs {}, inputs {}, size {} bytes, elapsed {:?}",
            first_height,
            height,
            batch.transaction_blocks.len(),
            batch.outputs.len(),
            batch.inputs.len(),
            batch.total_size,
            begin.elapsed()
        );

        Ok(stored)
    }

    async fn ensure_incomplete(&self, batch: &StorageBatch) -> IndexResult<()> {
        let keys = batch.block_keys();
        let complete = run_blocking(&self.store, move |store| {
            for (height, _) in keys {
                if let Some(block) = store.block_by_height(height)? {
                    if block.sync_complete {
                        return Ok(Some(block));
                    }
                }
            }
            Ok(None)
        })
        .await?;

        match complete {
            Some(block) => {
                let msg = format!(
                    "Refusing to recommit block {} ({}): already marked complete",
                    block.height, block.hash
                );
                error!("{}", msg);
                Err(IndexError::AlreadyComplete(block.height))
            }
            None => Ok(()),
        }
    }

    /// Unspent candidates minus outputs already consumed by a stored input of a
    /// transaction outside the batch.
    async fn unspent_for_retry(&self, batch: &StorageBatch) -> IndexResult<Vec<UnspentOutputRecord>> {
        let candidates = batch.unspent_outputs();
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let outpoints: Vec<OutPoint> = candidates.iter().map(|u| u.outpoint).collect();
        let stored = run_blocking(&self.store, move |store| Ok(store.find_inputs(&outpoints)?))
            .await?;

        let own: HashSet<_> = batch.txids().into_iter().collect();
        let spent_elsewhere: HashSet<OutPoint> = stored
            .into_iter()
            .filter(|i| !own.contains(&i.txid))
            .map(|i| i.outpoint)
            .collect();
        if spent_elsewhere.is_empty() {
            return Ok(candidates);
        }

        warn!(
            "Skipping {} output(s) already spent outside the batch while recommitting",
            spent_elsewhere.len()
        );
        Ok(candidates
            .into_iter()
            .filter(|u| !spent_elsewhere.contains(&u.outpoint))
            .collect())
    }

    async fn resolve_inputs(&self, batch: &mut StorageBatch) -> IndexResult<()> {
        let unresolved = batch.unresolved_outpoints();
        if unresolved.is_empty() {
            return Ok(());
        }

        let resolver = self.resolver.clone();
        let resolved = tokio::task::spawn_blocking(move || resolver.resolve(&unresolved))
            .await
            .map_err(|e| {
                let msg = format!("Resolve task join error: {}", e);
                error!("{}", msg);
                IndexError::Task(msg)
            })??;

        for input in batch.inputs.iter_mut().filter(|i| !i.is_resolved()) {
            // The resolver fails on any missing outpoint, so every lookup hits
            if let Some((address, value)) = resolved.get(&input.outpoint) {
                input.address = Some(address.clone());
                input.value = Some(*value);
            }
        }

        Ok(())
    }

    async fn evict_confirmed(&self, batch: &StorageBatch) -> IndexResult<()> {
        if !self.state.tracks_mempool() || self.state.mempool().is_empty() {
            return Ok(());
        }

        let txids = batch.txids();
        let confirmed = txids.clone();
        let deleted = run_blocking(&self.store, move |store| {
            Ok(store.delete_mempool_transactions(&confirmed)?)
        })
        .await?;

        let mempool = self.state.mempool();
        let removed = txids.iter().filter(|txid| mempool.remove(txid)).count();

        if deleted > 0 || removed > 0 {
            info!(
                "Evicted confirmed transactions from mempool: {} stored, {} in view",
                deleted, removed
            );
        }

        Ok(())
    }

    async fn write_rows(
        &self,
        batch: &StorageBatch,
        unspent: Vec<UnspentOutputRecord>,
        retry: bool,
    ) -> IndexResult<()> {
        let mut handles = Vec::with_capacity(6);

        handles.extend(self.spawn_insert(
            Table::Blocks,
            batch.blocks.values().cloned().collect(),
            retry,
            |store, rows| store.insert_blocks(rows),
        ));
        handles.extend(self.spawn_insert(
            Table::TransactionBlocks,
            batch.transaction_blocks.clone(),
            retry,
            |store, rows| store.insert_transaction_blocks(rows),
        ));
        handles.extend(self.spawn_insert(
            Table::Outputs,
            batch.outputs.values().cloned().collect(),
            retry,
            |store, rows| store.insert_outputs(rows),
        ));
        handles.extend(self.spawn_insert(
            Table::RawTransactions,
            batch.raw_transactions.clone(),
            true,
            |store, rows| store.insert_raw_transactions(rows),
        ));
        handles.extend(self.spawn_insert(
            Table::UnspentOutputs,
            unspent,
            retry,
            |store, rows| store.insert_unspent_outputs(rows),
        ));
        handles.extend(self.spawn_insert(
            Table::Inputs,
            batch.inputs.clone(),
            retry,
            |store, rows| store.insert_inputs(rows),
        ));

        // Await every write before reporting the first failure
        let results = futures::future::join_all(handles).await;

        let mut first_error = None;
        for result in results {
            let ret = match result {
                Ok(ret) => ret,
                Err(e) => {
                    let msg = format!("Insert task join error: {}", e);
                    error!("{}", msg);
                    Err(IndexError::Task(msg))
                }
            };

            if let Err(e) = ret {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn spawn_insert<T: Send + Sync + 'static>(
        &self,
        table: Table,
        rows: Vec<T>,
        tolerate_duplicates: bool,
        insert: InsertFn<T>,
    ) -> Option<JoinHandle<IndexResult<()>>> {
        if rows.is_empty() {
            return None;
        }

        let store = self.store.clone();
        let handle = tokio::task::spawn_blocking(move || match insert(store.as_ref(), &rows) {
            Ok(()) => Ok(()),
            Err(e) if tolerate_duplicates && e.is_duplicate_only() => {
                debug!("Ignored duplicate rows while inserting into {}: {}", table, e);
                Ok(())
            }
            Err(e) => {
                error!("Insert into {} failed: {}", table, e);
                Err(IndexError::Store(e))
            }
        });

        Some(handle)
    }
}

/// Explain why a block could not be marked: gone or replaced by another block.
fn unmarked_block_error(store: &dyn LedgerStore, height: u32, expected: BlockHash) -> IndexError {
    match store.block_by_height(height) {
        Ok(Some(stored)) if stored.hash != expected => {
            error!(
                "Expected hash {} for block {} but was {}",
                expected, height, stored.hash
            );
            IndexError::HashMismatch {
                height,
                expected,
                actual: stored.hash,
            }
        }
        Ok(Some(_)) => IndexError::Store(StoreError::UnmarkedBlock {
            height,
            hash: expected,
        }),
        Ok(None) => {
            error!("Block {} not found after commit", height);
            IndexError::BlockNotFound(height)
        }
        Err(e) => IndexError::Store(e),
    }
}
