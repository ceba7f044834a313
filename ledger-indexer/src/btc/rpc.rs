use super::BlockSource;
use crate::types::SyncBlock;
use bitcoincore_rpc::bitcoin::{Transaction, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi};
use std::sync::{Arc, RwLock};

// bitcoind RPC_INVALID_ADDRESS_OR_KEY, returned for unknown transactions
const RPC_NOT_FOUND: i32 = -5;

pub struct BTCRpcClient {
    rpc_url: String,
    auth: Auth,
    client: RwLock<Option<Arc<Client>>>,
}

impl BTCRpcClient {
    pub fn new(rpc_url: String, auth: Auth) -> Self {
        // The client is created on demand, the cookie file may not exist until bitcoind is up
        Self {
            rpc_url,
            auth,
            client: RwLock::new(None),
        }
    }

    fn update_client(&self) -> Result<(), String> {
        let new_client = Client::new(&self.rpc_url, self.auth.clone()).map_err(|e| {
            let msg = format!("Failed to update BTC RPC client: {}", e);
            error!("{}", msg);
            msg
        })?;

        let mut write_guard = self.client.write().unwrap();
        *write_guard = Some(Arc::new(new_client));

        info!("BTC RPC client updated for {}", self.rpc_url);
        Ok(())
    }

    fn client(&self) -> Result<Arc<Client>, String> {
        {
            let read_guard = self.client.read().unwrap();
            if let Some(client) = &*read_guard {
                return Ok(client.clone());
            }
        }

        warn!("BTC RPC client is not initialized, attempting to create it");
        self.update_client()?;

        let read_guard = self.client.read().unwrap();
        match &*read_guard {
            Some(client) => Ok(client.clone()),
            None => Err("Failed to initialize BTC RPC client".to_string()),
        }
    }

    fn is_auth_cookie(&self) -> bool {
        matches!(self.auth, Auth::CookieFile(_))
    }

    fn on_error(&self, error: &bitcoincore_rpc::Error) {
        // bitcoind may have restarted with a new auth cookie
        if let bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::Error::Transport(_)) =
            error
        {
            if self.is_auth_cookie() {
                let _ = self.update_client();
            }
        }
    }

    fn rpc_error(&self, method: &str, error: bitcoincore_rpc::Error) -> String {
        self.on_error(&error);

        let msg = format!("{} failed: {}", method, error);
        error!("{}", msg);
        msg
    }
}

fn is_not_found(error: &bitcoincore_rpc::Error) -> bool {
    matches!(
        error,
        bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::Error::Rpc(e)) if e.code == RPC_NOT_FOUND
    )
}

impl BlockSource for BTCRpcClient {
    fn get_latest_block_height(&self) -> Result<u32, String> {
        let count = self
            .client()?
            .get_block_count()
            .map_err(|e| self.rpc_error("get_block_count", e))?;

        Ok(count as u32)
    }

    fn get_block(&self, height: u32) -> Result<SyncBlock, String> {
        let client = self.client()?;
        let hash = client
            .get_block_hash(height as u64)
            .map_err(|e| self.rpc_error("get_block_hash", e))?;

        let block = client
            .get_block(&hash)
            .map_err(|e| self.rpc_error("get_block", e))?;

        Ok(SyncBlock::from_block(height, &block))
    }

    fn get_mempool_txids(&self) -> Result<Vec<Txid>, String> {
        self.client()?
            .get_raw_mempool()
            .map_err(|e| self.rpc_error("get_raw_mempool", e))
    }

    fn get_transaction(&self, txid: &Txid) -> Result<Option<Transaction>, String> {
        match self.client()?.get_raw_transaction(txid, None) {
            Ok(tx) => Ok(Some(tx)),
            Err(e) if is_not_found(&e) => {
                debug!("Transaction {} not known to the node", txid);
                Ok(None)
            }
            Err(e) => Err(self.rpc_error("get_raw_transaction", e)),
        }
    }
}
