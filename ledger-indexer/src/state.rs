use bitcoincore_rpc::bitcoin::Txid;
use dashmap::DashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Ids of the transactions currently believed to be pending.
pub struct LocalMempoolView {
    ids: DashSet<Txid>,
}

impl LocalMempoolView {
    pub fn new() -> Self {
        Self {
            ids: DashSet::new(),
        }
    }

    pub fn add(&self, txid: Txid) -> bool {
        self.ids.insert(txid)
    }

    pub fn remove(&self, txid: &Txid) -> bool {
        self.ids.remove(txid).is_some()
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.ids.contains(txid)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> Vec<Txid> {
        self.ids.iter().map(|id| *id).collect()
    }
}

/// Indexing state shared by the commit pipeline, the mempool synchronizer and the driver.
pub struct GlobalState {
    indexing_completed: AtomicBool,
    catch_up: AtomicBool,
    mempool: LocalMempoolView,
}

impl GlobalState {
    pub fn new() -> Self {
        Self {
            indexing_completed: AtomicBool::new(false),
            catch_up: AtomicBool::new(true),
            mempool: LocalMempoolView::new(),
        }
    }

    pub fn indexing_completed(&self) -> bool {
        self.indexing_completed.load(Ordering::SeqCst)
    }

    pub fn set_indexing_completed(&self, completed: bool) {
        let prev = self.indexing_completed.swap(completed, Ordering::SeqCst);
        if prev != completed {
            info!("Indexing completed flag changed: {} -> {}", prev, completed);
        }
    }

    pub fn in_catch_up(&self) -> bool {
        self.catch_up.load(Ordering::SeqCst)
    }

    pub fn set_catch_up(&self, catch_up: bool) {
        let prev = self.catch_up.swap(catch_up, Ordering::SeqCst);
        if prev != catch_up {
            info!("Catch-up mode changed: {} -> {}", prev, catch_up);
        }
    }

    /// Confirmed blocks only evict pending entries once live at the tip.
    pub fn tracks_mempool(&self) -> bool {
        self.indexing_completed() && !self.in_catch_up()
    }

    pub fn mempool(&self) -> &LocalMempoolView {
        &self.mempool
    }
}

pub type GlobalStateRef = Arc<GlobalState>;
