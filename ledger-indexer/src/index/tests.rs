use super::test_util::*;
use super::*;
use crate::btc::BlockSource;
use crate::config::IndexerConfig;
use crate::error::IndexError;
use crate::output::IndexOutput;
use crate::script::NULL_DATA_LABEL;
use crate::state::{GlobalState, GlobalStateRef};
use crate::store::{LedgerStore, LedgerStoreRef, SqliteLedgerStore};
use crate::types::{BlockRecord, SyncBlock};
use bitcoincore_rpc::bitcoin::{Network, OutPoint, Transaction, Txid};
use std::sync::{Arc, Mutex};

struct TestContext {
    store: LedgerStoreRef,
    state: GlobalStateRef,
    accumulator: BatchAccumulator,
    pipeline: CommitPipeline,
    mempool: MempoolSynchronizer,
}

impl TestContext {
    fn new() -> Self {
        let store: LedgerStoreRef = Arc::new(SqliteLedgerStore::open_in_memory().unwrap());
        let state = Arc::new(GlobalState::new());
        let classifier = Arc::new(TestScriptClassifier);

        Self {
            accumulator: BatchAccumulator::new(Network::Regtest, classifier.clone(), true, false),
            pipeline: CommitPipeline::new(store.clone(), state.clone()),
            mempool: MempoolSynchronizer::new(
                Network::Regtest,
                classifier,
                store.clone(),
                state.clone(),
            ),
            store,
            state,
        }
    }

    fn batch_of(&self, blocks: &[SyncBlock]) -> StorageBatch {
        let mut batch = StorageBatch::new();
        for block in blocks {
            self.accumulator.accumulate(&mut batch, block).unwrap();
        }
        batch
    }

    async fn commit_blocks(&self, blocks: &[SyncBlock]) -> BlockRecord {
        let mut batch = self.batch_of(blocks);
        self.pipeline.commit(&mut batch, None).await.unwrap()
    }

    fn unspent(&self, outpoint: OutPoint) -> Option<(String, u64)> {
        self.store
            .find_unspent_outputs(&[outpoint])
            .unwrap()
            .pop()
            .map(|u| (u.address, u.value))
    }

    fn follow_tip(&self) {
        self.state.set_indexing_completed(true);
        self.state.set_catch_up(false);
    }
}

/// Block 10 pays "A" 5 in a coinbase T, block 11 moves it to "B" in U.
fn chain_t_u() -> (Transaction, Transaction) {
    let t = coinbase_tx(&[("A", 5)]);
    let u = spend_tx(&[OutPoint::new(t.compute_txid(), 0)], &[("B", 5)]);
    (t, u)
}

#[tokio::test]
async fn test_coinbase_then_spend_across_commits() {
    let ctx = TestContext::new();
    let (t, u) = chain_t_u();
    let (t_id, u_id) = (t.compute_txid(), u.compute_txid());

    let block = ctx.commit_blocks(&[sync_block(10, 10, vec![t])]).await;
    assert_eq!(block.height, 10);
    assert_eq!(block.hash, block_hash(10));
    assert!(block.sync_complete);
    assert_eq!(ctx.unspent(OutPoint::new(t_id, 0)), Some(("A".to_string(), 5)));

    let stored = ctx.store.block_by_height(10).unwrap().unwrap();
    assert!(stored.sync_complete);
    assert_eq!(stored.hash, block_hash(10));

    let block = ctx.commit_blocks(&[sync_block(11, 11, vec![u])]).await;
    assert_eq!(block.height, 11);

    assert_eq!(ctx.unspent(OutPoint::new(t_id, 0)), None);
    assert_eq!(ctx.unspent(OutPoint::new(u_id, 0)), Some(("B".to_string(), 5)));

    let inputs = ctx.store.inputs_by_transaction(&u_id).unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].outpoint, OutPoint::new(t_id, 0));
    assert_eq!(inputs[0].address.as_deref(), Some("A"));
    assert_eq!(inputs[0].value, Some(5));

    // Spent outputs stay in the permanent ledger
    assert_eq!(ctx.store.find_outputs(&[OutPoint::new(t_id, 0)]).unwrap().len(), 1);
    assert!(ctx.store.raw_transaction(&u_id).unwrap().is_some());
    assert_eq!(ctx.store.latest_complete_block().unwrap().unwrap().height, 11);
}

#[tokio::test]
async fn test_unresolved_spend_commits_nothing() {
    let ctx = TestContext::new();
    let missing = OutPoint::new(txid(77), 0);
    let tx = spend_tx(&[missing], &[("B", 5)]);
    let tx_id = tx.compute_txid();

    let mut batch = ctx.batch_of(&[sync_block(5, 5, vec![tx])]);
    match ctx.pipeline.commit(&mut batch, None).await {
        Err(IndexError::UnresolvedOutpoints { missing: count, first }) => {
            assert_eq!(count, 1);
            assert_eq!(first, missing);
        }
        other => panic!("Unexpected result {:?}", other),
    }

    assert_eq!(ctx.store.block_by_height(5).unwrap(), None);
    assert!(ctx.store.find_outputs(&[OutPoint::new(tx_id, 0)]).unwrap().is_empty());
    assert!(ctx.store.find_unspent_outputs(&[OutPoint::new(tx_id, 0)]).unwrap().is_empty());
    assert!(ctx.store.inputs_by_transaction(&tx_id).unwrap().is_empty());
    assert_eq!(ctx.store.raw_transaction(&tx_id).unwrap(), None);
}

#[tokio::test]
async fn test_null_data_never_enters_unspent_set() {
    let ctx = TestContext::new();
    let tx = coinbase_tx(&[("A", 5), (OP_RETURN_LABEL, 1_000)]);
    let tx_id = tx.compute_txid();

    ctx.commit_blocks(&[sync_block(1, 1, vec![tx])]).await;

    let data_output = OutPoint::new(tx_id, 1);
    assert_eq!(ctx.unspent(data_output), None);
    assert_eq!(ctx.unspent(OutPoint::new(tx_id, 0)), Some(("A".to_string(), 5)));

    let ledger = ctx.store.find_outputs(&[data_output]).unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].address, NULL_DATA_LABEL);
    assert_eq!(ledger[0].value, 1_000);
}

#[tokio::test]
async fn test_spending_null_data_in_batch_fails_delete_check() {
    let ctx = TestContext::new();
    let data = coinbase_tx(&[(OP_RETURN_LABEL, 0)]);
    let spend = spend_tx(&[OutPoint::new(data.compute_txid(), 0)], &[("B", 1)]);

    let mut batch = ctx.batch_of(&[sync_block(1, 1, vec![data, spend])]);
    match ctx.pipeline.commit(&mut batch, None).await {
        Err(IndexError::DeleteCountMismatch { deleted, expected }) => {
            assert_eq!(deleted, 0);
            assert_eq!(expected, 1);
        }
        other => panic!("Unexpected result {:?}", other),
    }

    // Rows landed but the block was never marked complete
    let block = ctx.store.block_by_height(1).unwrap().unwrap();
    assert!(!block.sync_complete);
    assert_eq!(ctx.store.latest_complete_block().unwrap(), None);
}

#[tokio::test]
async fn test_retry_after_crash_before_delete_succeeds() {
    let ctx = TestContext::new();
    let (t, u) = chain_t_u();
    let (t_id, u_id) = (t.compute_txid(), u.compute_txid());
    ctx.commit_blocks(&[sync_block(10, 10, vec![t])]).await;

    // The insert phase of block 11 landed before the process died
    let mut batch = ctx.batch_of(&[sync_block(11, 11, vec![u])]);
    ctx.store
        .insert_blocks(&batch.blocks.values().cloned().collect::<Vec<_>>())
        .unwrap();
    ctx.store
        .insert_transaction_blocks(&batch.transaction_blocks)
        .unwrap();
    ctx.store
        .insert_outputs(&batch.outputs.values().cloned().collect::<Vec<_>>())
        .unwrap();
    ctx.store.insert_unspent_outputs(&batch.unspent_outputs()).unwrap();

    // A plain commit reports the duplicates and stops before deleting
    let err = ctx.pipeline.commit(&mut batch, None).await.unwrap_err();
    assert!(err.is_duplicate_only());
    assert_eq!(ctx.unspent(OutPoint::new(t_id, 0)), Some(("A".to_string(), 5)));

    let block = ctx.pipeline.recommit(&mut batch, None).await.unwrap();
    assert_eq!(block.height, 11);
    assert!(block.sync_complete);
    assert_eq!(ctx.unspent(OutPoint::new(t_id, 0)), None);
    assert_eq!(ctx.unspent(OutPoint::new(u_id, 0)), Some(("B".to_string(), 5)));
    assert_eq!(ctx.store.inputs_by_transaction(&u_id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_retry_after_delete_fails_count_check() {
    let ctx = TestContext::new();
    let (t, u) = chain_t_u();
    let t_id = t.compute_txid();
    ctx.commit_blocks(&[sync_block(10, 10, vec![t])]).await;

    // The block row of 11 already exists, so the first attempt stops in the
    // insert phase with its inputs resolved
    let mut batch = ctx.batch_of(&[sync_block(11, 11, vec![u])]);
    ctx.store
        .insert_blocks(&batch.blocks.values().cloned().collect::<Vec<_>>())
        .unwrap();
    let err = ctx.pipeline.commit(&mut batch, None).await.unwrap_err();
    assert!(err.is_duplicate_only());

    // The spend landed before the process died
    let spent = OutPoint::new(t_id, 0);
    assert_eq!(ctx.store.delete_unspent_outputs(&[spent]).unwrap(), 1);

    match ctx.pipeline.recommit(&mut batch, None).await {
        Err(IndexError::DeleteCountMismatch { deleted, expected }) => {
            assert_eq!(deleted, 0);
            assert_eq!(expected, 1);
        }
        other => panic!("Unexpected result {:?}", other),
    }
    assert_eq!(ctx.unspent(spent), None);
    assert!(!ctx.store.block_by_height(11).unwrap().unwrap().sync_complete);
}

#[tokio::test]
async fn test_recommit_of_complete_block_is_refused() {
    let ctx = TestContext::new();
    let (t, u) = chain_t_u();
    let t_id = t.compute_txid();

    let mut first = ctx.batch_of(&[sync_block(10, 10, vec![t])]);
    ctx.pipeline.commit(&mut first, None).await.unwrap();
    ctx.commit_blocks(&[sync_block(11, 11, vec![u])]).await;

    assert!(matches!(
        ctx.pipeline.recommit(&mut first, None).await,
        Err(IndexError::AlreadyComplete(10))
    ));

    // T:0 was spent in block 11 and stays spent
    assert_eq!(ctx.unspent(OutPoint::new(t_id, 0)), None);
    assert_eq!(ctx.store.latest_complete_block().unwrap().unwrap().height, 11);
}

#[tokio::test]
async fn test_recommit_keeps_later_spends_out_of_unspent_set() {
    let ctx = TestContext::new();
    let (t, u) = chain_t_u();
    let t_id = t.compute_txid();

    // Block 10 was written but never marked complete
    let mut batch = ctx.batch_of(&[sync_block(10, 10, vec![t])]);
    ctx.store
        .insert_blocks(&batch.blocks.values().cloned().collect::<Vec<_>>())
        .unwrap();
    ctx.store.insert_unspent_outputs(&batch.unspent_outputs()).unwrap();

    // Block 11 spent T:0 in the meantime
    ctx.commit_blocks(&[sync_block(11, 11, vec![u])]).await;
    assert_eq!(ctx.unspent(OutPoint::new(t_id, 0)), None);

    let block = ctx.pipeline.recommit(&mut batch, None).await.unwrap();
    assert_eq!(block.height, 10);
    assert!(block.sync_complete);
    assert_eq!(ctx.unspent(OutPoint::new(t_id, 0)), None);
    assert_eq!(ctx.store.find_outputs(&[OutPoint::new(t_id, 0)]).unwrap().len(), 1);
}

#[tokio::test]
async fn test_foreign_block_fails_verification() {
    let ctx = TestContext::new();
    let foreign = BlockRecord::from(&sync_block(12, 99, vec![]).info);
    ctx.store.insert_blocks(&[foreign]).unwrap();

    let mut batch = ctx.batch_of(&[sync_block(12, 12, vec![coinbase_tx(&[("C", 9)])])]);
    let err = ctx.pipeline.commit(&mut batch, None).await.unwrap_err();
    assert!(err.is_duplicate_only());

    match ctx.pipeline.recommit(&mut batch, None).await {
        Err(IndexError::HashMismatch {
            height,
            expected,
            actual,
        }) => {
            assert_eq!(height, 12);
            assert_eq!(expected, block_hash(12));
            assert_eq!(actual, block_hash(99));
        }
        other => panic!("Unexpected result {:?}", other),
    }

    // The foreign block is never marked complete
    let stored = ctx.store.block_by_height(12).unwrap().unwrap();
    assert_eq!(stored.hash, block_hash(99));
    assert!(!stored.sync_complete);
    assert_eq!(ctx.store.latest_complete_block().unwrap(), None);
}

#[tokio::test]
async fn test_ingest_same_transaction_twice() {
    let ctx = TestContext::new();
    let tx = spend_tx(&[OutPoint::new(txid(3), 0)], &[("B", 2)]);
    let tx_id = tx.compute_txid();

    assert_eq!(ctx.mempool.ingest(vec![tx.clone()]).await.unwrap(), 1);
    assert_eq!(ctx.mempool.ingest(vec![tx]).await.unwrap(), 0);

    assert_eq!(ctx.store.mempool_transaction_ids().unwrap(), vec![tx_id]);
    assert_eq!(ctx.state.mempool().len(), 1);
}

#[tokio::test]
async fn test_confirmed_pending_transaction_evicted_once() {
    let ctx = TestContext::new();
    let (t, u) = chain_t_u();
    let u_id = u.compute_txid();
    ctx.commit_blocks(&[sync_block(10, 10, vec![t])]).await;

    ctx.follow_tip();
    let other = spend_tx(&[OutPoint::new(txid(8), 0)], &[("C", 1)]);
    let other_id = other.compute_txid();
    ctx.mempool.ingest(vec![u.clone(), other]).await.unwrap();

    let entry = ctx.store.mempool_transaction(&u_id).unwrap().unwrap();
    assert_eq!(entry.inputs[0].address.as_deref(), Some("A"));

    ctx.commit_blocks(&[sync_block(11, 11, vec![u])]).await;

    assert!(!ctx.state.mempool().contains(&u_id));
    assert_eq!(ctx.store.mempool_transaction(&u_id).unwrap(), None);
    assert!(ctx.state.mempool().contains(&other_id));
    assert_eq!(ctx.store.mempool_transaction_ids().unwrap(), vec![other_id]);

    // Nothing left to evict for a later block
    ctx.commit_blocks(&[sync_block(12, 12, vec![coinbase_tx(&[("D", 1)])])])
        .await;
    assert_eq!(ctx.state.mempool().len(), 1);
}

#[tokio::test]
async fn test_no_eviction_while_catching_up() {
    let ctx = TestContext::new();
    let (t, u) = chain_t_u();
    let u_id = u.compute_txid();
    ctx.commit_blocks(&[sync_block(10, 10, vec![t])]).await;
    ctx.mempool.ingest(vec![u.clone()]).await.unwrap();

    // Initial indexing not completed yet
    ctx.commit_blocks(&[sync_block(11, 11, vec![u])]).await;
    assert!(ctx.state.mempool().contains(&u_id));
    assert!(ctx.store.mempool_transaction(&u_id).unwrap().is_some());
}

struct FakeBlockSource {
    blocks: Vec<SyncBlock>,
    mempool: Mutex<Vec<Transaction>>,
}

impl BlockSource for FakeBlockSource {
    fn get_latest_block_height(&self) -> Result<u32, String> {
        match self.blocks.last() {
            Some(block) => Ok(block.info.height),
            None => Err("no blocks".to_string()),
        }
    }

    fn get_block(&self, height: u32) -> Result<SyncBlock, String> {
        self.blocks
            .iter()
            .find(|b| b.info.height == height)
            .cloned()
            .ok_or_else(|| format!("block {} not found", height))
    }

    fn get_mempool_txids(&self) -> Result<Vec<Txid>, String> {
        Ok(self
            .mempool
            .lock()
            .unwrap()
            .iter()
            .map(|tx| tx.compute_txid())
            .collect())
    }

    fn get_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, String> {
        Ok(self
            .mempool
            .lock()
            .unwrap()
            .iter()
            .find(|tx| tx.compute_txid() == *txid)
            .cloned())
    }
}

fn indexer_with(source: Arc<FakeBlockSource>, store: LedgerStoreRef) -> LedgerIndexer {
    let mut config = IndexerConfig::default();
    config.btc.network = Network::Regtest;
    config.sync.batch_size = 2;

    LedgerIndexer::new(
        Arc::new(config),
        source,
        store,
        Arc::new(GlobalState::new()),
        Arc::new(TestScriptClassifier),
        Arc::new(IndexOutput::hidden()),
    )
}

#[tokio::test]
async fn test_driver_syncs_to_tip_and_tracks_mempool() {
    let a = coinbase_tx(&[("A", 1)]);
    let pending = spend_tx(&[OutPoint::new(a.compute_txid(), 0)], &[("Z", 1)]);
    let source = Arc::new(FakeBlockSource {
        blocks: vec![
            sync_block(0, 1, vec![a]),
            sync_block(1, 2, vec![coinbase_tx(&[("B", 2)])]),
            sync_block(2, 3, vec![coinbase_tx(&[("C", 3)])]),
        ],
        mempool: Mutex::new(vec![pending.clone()]),
    });
    let store: LedgerStoreRef = Arc::new(SqliteLedgerStore::open_in_memory().unwrap());
    let indexer = indexer_with(source.clone(), store.clone());

    assert_eq!(indexer.sync_once().await.unwrap(), Some(2));
    let latest = store.latest_complete_block().unwrap().unwrap();
    assert_eq!(latest.height, 2);
    assert_eq!(latest.hash, block_hash(3));

    // At the tip the mempool is followed
    assert_eq!(indexer.sync_mempool().await.unwrap(), 1);
    let entry = store
        .mempool_transaction(&pending.compute_txid())
        .unwrap()
        .unwrap();
    assert_eq!(entry.inputs[0].address.as_deref(), Some("A"));

    // Dropped by the node, dropped here
    source.mempool.lock().unwrap().clear();
    assert_eq!(indexer.sync_mempool().await.unwrap(), 0);
    assert!(store.mempool_transaction_ids().unwrap().is_empty());

    assert_eq!(indexer.sync_once().await.unwrap(), Some(2));
}

#[tokio::test]
async fn test_driver_recovers_incomplete_blocks() {
    let a = coinbase_tx(&[("A", 1)]);
    let a_id = a.compute_txid();
    let spend = spend_tx(&[OutPoint::new(a_id, 0)], &[("B", 1)]);
    let spend_id = spend.compute_txid();
    let source = Arc::new(FakeBlockSource {
        blocks: vec![
            sync_block(0, 1, vec![a]),
            sync_block(1, 2, vec![spend]),
            sync_block(2, 3, vec![coinbase_tx(&[("C", 3)])]),
        ],
        mempool: Mutex::new(Vec::new()),
    });

    // A failed commit left the rows of blocks 0 and 1 without completion flags
    let store: LedgerStoreRef = Arc::new(SqliteLedgerStore::open_in_memory().unwrap());
    store
        .insert_blocks(&[
            BlockRecord::from(&source.blocks[0].info),
            BlockRecord::from(&source.blocks[1].info),
        ])
        .unwrap();

    let indexer = indexer_with(source, store.clone());
    assert_eq!(indexer.sync_once().await.unwrap(), Some(2));

    assert_eq!(store.first_incomplete_block().unwrap(), None);
    assert_eq!(store.latest_complete_block().unwrap().unwrap().height, 2);
    assert!(
        store
            .find_unspent_outputs(&[OutPoint::new(a_id, 0)])
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        store
            .find_unspent_outputs(&[OutPoint::new(spend_id, 0)])
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_driver_stops_when_incomplete_block_differs_from_source() {
    let source = Arc::new(FakeBlockSource {
        blocks: vec![sync_block(0, 1, vec![coinbase_tx(&[("A", 1)])])],
        mempool: Mutex::new(Vec::new()),
    });
    let store: LedgerStoreRef = Arc::new(SqliteLedgerStore::open_in_memory().unwrap());
    store
        .insert_blocks(&[BlockRecord::from(&sync_block(0, 7, vec![]).info)])
        .unwrap();

    let indexer = indexer_with(source, store.clone());
    assert!(matches!(
        indexer.sync_once().await,
        Err(IndexError::HashMismatch { height: 0, .. })
    ));

    assert!(!store.block_by_height(0).unwrap().unwrap().sync_complete);
    assert_eq!(store.latest_complete_block().unwrap(), None);
}
