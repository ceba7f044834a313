use super::batch::{BatchAccumulator, StorageBatch};
use super::commit::CommitPipeline;
use super::mempool::MempoolSynchronizer;
use super::run_blocking;
use crate::btc::BlockSourceRef;
use crate::config::IndexerConfigRef;
use crate::error::{IndexError, IndexResult};
use crate::output::IndexOutputRef;
use crate::script::ScriptClassifierRef;
use crate::state::GlobalStateRef;
use crate::store::LedgerStoreRef;
use crate::types::{BlockRecord, SyncBlock};
use bitcoincore_rpc::bitcoin::{Transaction, Txid};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::watch;

/// Single sequential driver: pulls blocks from the source, batches and commits them,
/// then keeps the mempool view in step once the tip is reached.
pub struct LedgerIndexer {
    config: IndexerConfigRef,
    source: BlockSourceRef,
    store: LedgerStoreRef,
    state: GlobalStateRef,
    accumulator: BatchAccumulator,
    pipeline: CommitPipeline,
    mempool: MempoolSynchronizer,
    output: IndexOutputRef,
    shutdown_tx: watch::Sender<bool>,
}

impl LedgerIndexer {
    pub fn new(
        config: IndexerConfigRef,
        source: BlockSourceRef,
        store: LedgerStoreRef,
        state: GlobalStateRef,
        classifier: ScriptClassifierRef,
        output: IndexOutputRef,
    ) -> Self {
        let network = config.btc.network();
        let accumulator = BatchAccumulator::new(
            network,
            classifier.clone(),
            config.sync.store_raw_transactions,
            config.sync.proof_of_stake,
        );
        let pipeline = CommitPipeline::new(store.clone(), state.clone());
        let mempool =
            MempoolSynchronizer::new(network, classifier, store.clone(), state.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            source,
            store,
            state,
            accumulator,
            pipeline,
            mempool,
            output,
            shutdown_tx,
        }
    }

    pub fn new_batch(&self) -> StorageBatch {
        StorageBatch::new()
    }

    pub fn accumulate(&self, batch: &mut StorageBatch, block: &SyncBlock) -> IndexResult<()> {
        self.accumulator.accumulate(batch, block)
    }

    pub async fn commit(&self, batch: &mut StorageBatch) -> IndexResult<BlockRecord> {
        self.pipeline.commit(batch, None).await
    }

    pub async fn recommit(&self, batch: &mut StorageBatch) -> IndexResult<BlockRecord> {
        self.pipeline.recommit(batch, None).await
    }

    pub async fn ingest_pending(&self, transactions: Vec<Transaction>) -> IndexResult<usize> {
        self.mempool.ingest(transactions).await
    }

    pub fn shutdown(&self) {
        info!("Shutdown requested for ledger indexer");
        self.shutdown_tx.send_replace(true);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    async fn source_call<T, F>(&self, f: F) -> IndexResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn crate::btc::BlockSource) -> Result<T, String> + Send + 'static,
    {
        let source = self.source.clone();
        match tokio::task::spawn_blocking(move || f(source.as_ref())).await {
            Ok(Ok(ret)) => Ok(ret),
            Ok(Err(e)) => Err(IndexError::Source(e)),
            Err(e) => {
                let msg = format!("Block source task join error: {}", e);
                error!("{}", msg);
                Err(IndexError::Task(msg))
            }
        }
    }

    async fn fetch_blocks(
        &self,
        start_height: u32,
        end_height: u32,
    ) -> IndexResult<Vec<SyncBlock>> {
        let mut handles = Vec::with_capacity((end_height - start_height + 1) as usize);
        for height in start_height..=end_height {
            let handle = tokio::task::spawn_blocking({
                let source = self.source.clone();
                move || source.get_block(height)
            });
            handles.push(handle);
        }

        let results_of_handles = futures::future::join_all(handles).await;

        let mut blocks = Vec::with_capacity(results_of_handles.len());
        for result in results_of_handles {
            match result {
                Ok(Ok(block)) => blocks.push(block),
                Ok(Err(e)) => {
                    let msg = format!("Failed to get block: {}", e);
                    error!("{}", msg);
                    return Err(IndexError::Source(msg));
                }
                Err(e) => {
                    let msg = format!("Task join error: {}", e);
                    error!("{}", msg);
                    return Err(IndexError::Task(msg));
                }
            }
        }

        Ok(blocks)
    }

    fn accumulate_blocks(&self, blocks: &[SyncBlock]) -> IndexResult<StorageBatch> {
        let mut batch = self.new_batch();
        for block in blocks {
            self.accumulate(&mut batch, block)?;
        }
        Ok(batch)
    }

    /// Rebuild the batch starting at a block a failed commit left incomplete and
    /// recommit it.
    async fn recover_incomplete(&self, block: BlockRecord, tip: u32) -> IndexResult<BlockRecord> {
        let batch_size = self.config.sync.batch_size.max(1) as u32;
        let end_height = std::cmp::max(
            block.height,
            std::cmp::min(block.height + batch_size - 1, tip),
        );
        warn!(
            "Block {} ({}) was left incomplete by a failed commit, recommitting blocks {}-{}",
            block.height, block.hash, block.height, end_height
        );
        self.output.set_message(&format!(
            "Recovering incomplete blocks {} to {}",
            block.height, end_height
        ));

        let blocks = self.fetch_blocks(block.height, end_height).await?;
        let mut batch = self.accumulate_blocks(&blocks)?;

        match self.recommit(&mut batch).await {
            Ok(committed) => {
                info!("Recovered incomplete blocks {}-{}", block.height, committed.height);
                Ok(committed)
            }
            Err(e @ IndexError::Source(_)) | Err(e @ IndexError::Task(_)) => Err(e),
            Err(e) => {
                let msg = format!(
                    "Failed to recover incomplete block {}: {}. Run clear-db and index again",
                    block.height, e
                );
                error!("{}", msg);
                self.output.println(&msg);
                Err(e)
            }
        }
    }

    /// Index from the latest complete block up to the current tip, recommitting
    /// any blocks a failed commit left incomplete first.
    /// Returns the last complete height, if any.
    pub async fn sync_once(&self) -> IndexResult<Option<u32>> {
        let tip = self.source_call(|source| source.get_latest_block_height()).await?;

        while let Some(block) =
            run_blocking(&self.store, |store| Ok(store.first_incomplete_block()?)).await?
        {
            if self.is_shutdown() {
                info!("Shutdown requested, stopping recovery at height {}", block.height);
                return Ok(None);
            }
            self.recover_incomplete(block, tip).await?;
        }

        let latest = run_blocking(&self.store, |store| Ok(store.latest_complete_block()?)).await?;
        let mut synced_height = latest.map(|b| b.height);

        let next_height = synced_height.map(|h| h + 1).unwrap_or(0);

        let behind = (tip as u64 + 1).saturating_sub(next_height as u64);
        self.state
            .set_catch_up(behind > self.config.sync.catch_up_threshold as u64);

        self.output.update_total_block_height(tip as u64);
        self.output.update_current_height(next_height as u64);

        if next_height > tip {
            debug!("No new blocks, tip {}, synced {:?}", tip, synced_height);
            self.on_tip();
            return Ok(synced_height);
        }

        info!("Syncing blocks {} to {}", next_height, tip);
        self.output
            .set_message(&format!("Syncing blocks {} to {}", next_height, tip));

        let batch_size = self.config.sync.batch_size.max(1) as u32;
        let mut current_height = next_height;
        while current_height <= tip {
            if self.is_shutdown() {
                info!("Shutdown requested, stopping sync at height {}", current_height);
                return Ok(synced_height);
            }

            let end_height = std::cmp::min(current_height + batch_size - 1, tip);
            let blocks = self.fetch_blocks(current_height, end_height).await?;
            let mut batch = self.accumulate_blocks(&blocks)?;

            let committed = self.commit(&mut batch).await?;
            synced_height = Some(committed.height);
            current_height = committed.height + 1;

            self.output.update_current_height(current_height as u64);
            self.state
                .set_catch_up(tip - committed.height > self.config.sync.catch_up_threshold);
        }

        self.on_tip();
        Ok(synced_height)
    }

    fn on_tip(&self) {
        self.state.set_catch_up(false);
        if !self.state.indexing_completed() {
            self.state.set_indexing_completed(true);
            self.output.println("Initial indexing completed");
        }
    }

    /// Ingest node mempool transactions not yet tracked and evict tracked ones the
    /// node dropped. Does nothing until the indexer follows the tip.
    pub async fn sync_mempool(&self) -> IndexResult<usize> {
        if !self.state.tracks_mempool() {
            return Ok(0);
        }

        let node_ids: HashSet<Txid> = self
            .source_call(|source| source.get_mempool_txids())
            .await?
            .into_iter()
            .collect();

        let view = self.state.mempool();
        let stale: Vec<Txid> = view
            .ids()
            .into_iter()
            .filter(|txid| !node_ids.contains(txid))
            .collect();
        if !stale.is_empty() {
            self.mempool.evict(stale).await?;
        }

        let unknown: Vec<Txid> = node_ids
            .into_iter()
            .filter(|txid| !view.contains(txid))
            .collect();
        if unknown.is_empty() {
            return Ok(0);
        }

        let transactions = self
            .source_call(move |source| {
                let mut transactions = Vec::with_capacity(unknown.len());
                for txid in &unknown {
                    // Gone between listing and fetching
                    if let Some(tx) = source.get_transaction(txid)? {
                        transactions.push(tx);
                    }
                }
                Ok(transactions)
            })
            .await?;

        self.ingest_pending(transactions).await
    }

    /// Sync loop until `shutdown` is called. Source errors are retried after the poll
    /// interval, any other error stops the loop.
    pub async fn run(&self) -> IndexResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let poll_interval = Duration::from_secs(self.config.sync.poll_interval_secs);

        self.mempool.load_from_store().await?;

        let mut failed_attempts = 0u32;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.sync_once().await {
                Ok(height) => {
                    failed_attempts = 0;
                    if let Some(height) = height {
                        self.output
                            .set_message(&format!("Synced up to block height {}", height));
                    }

                    if let Err(e) = self.sync_mempool().await {
                        warn!("Mempool sync failed: {}", e);
                    }
                }
                Err(e @ IndexError::Source(_)) | Err(e @ IndexError::Task(_)) => {
                    failed_attempts += 1;
                    let msg = format!(
                        "Error during sync with attempt {}: {}. Retrying in {} seconds...",
                        failed_attempts,
                        e,
                        poll_interval.as_secs()
                    );
                    error!("{}", msg);
                    self.output.set_message(&msg);
                }
                Err(e) => {
                    let msg = format!("Indexer stopped on unrecoverable error: {}", e);
                    error!("{}", msg);
                    self.output.println(&msg);
                    return Err(e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        info!("Ledger indexer run loop exited");
        self.output.finish();
        Ok(())
    }
}
