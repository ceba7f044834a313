mod batch;
mod commit;
mod indexer;
mod mempool;
mod resolver;

#[cfg(test)]
mod test_util;
#[cfg(test)]
mod tests;

pub use batch::*;
pub use commit::*;
pub use indexer::*;
pub use mempool::*;
pub use resolver::*;

use crate::error::{IndexError, IndexResult};
use crate::store::{LedgerStore, LedgerStoreRef};

/// Run a store call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(store: &LedgerStoreRef, f: F) -> IndexResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn LedgerStore) -> IndexResult<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| {
            let msg = format!("Store task join error: {}", e);
            error!("{}", msg);
            IndexError::Task(msg)
        })?
}
