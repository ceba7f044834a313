use crate::script::{ScriptClass, ScriptClassifier, ScriptKind};
use crate::types::{BlockInfo, SyncBlock};
use bitcoincore_rpc::bitcoin::absolute::LockTime;
use bitcoincore_rpc::bitcoin::hashes::Hash;
use bitcoincore_rpc::bitcoin::transaction::Version;
use bitcoincore_rpc::bitcoin::{
    Amount, BlockHash, Network, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};

pub const OP_RETURN_LABEL: &str = "op_return";

/// Scripts are the address bytes themselves; a leading OP_RETURN marks null data.
pub struct TestScriptClassifier;

impl ScriptClassifier for TestScriptClassifier {
    fn classify(&self, _network: Network, script: &Script) -> Option<ScriptClass> {
        let bytes = script.as_bytes();
        match bytes.first() {
            None => None,
            Some(0x6a) => Some(ScriptClass::Kind(ScriptKind::NullData)),
            Some(_) => String::from_utf8(bytes.to_vec())
                .ok()
                .map(|address| ScriptClass::Addresses(vec![address])),
        }
    }
}

pub fn script_for(label: &str) -> ScriptBuf {
    if label == OP_RETURN_LABEL {
        ScriptBuf::from_bytes(vec![0x6a, 0x01, 0x00])
    } else {
        ScriptBuf::from_bytes(label.as_bytes().to_vec())
    }
}

pub fn txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

pub fn block_hash(n: u8) -> BlockHash {
    BlockHash::from_byte_array([n; 32])
}

fn outputs(outputs: &[(&str, u64)]) -> Vec<TxOut> {
    outputs
        .iter()
        .map(|(label, value)| TxOut {
            value: Amount::from_sat(*value),
            script_pubkey: script_for(label),
        })
        .collect()
}

pub fn coinbase_tx(outs: &[(&str, u64)]) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs(outs),
    }
}

pub fn spend_tx(spends: &[OutPoint], outs: &[(&str, u64)]) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: spends
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs(outs),
    }
}

pub fn sync_block(height: u32, hash: u8, transactions: Vec<Transaction>) -> SyncBlock {
    SyncBlock {
        info: BlockInfo {
            height,
            hash: block_hash(hash),
            previous_hash: None,
            size: 250,
            time: 1_600_000_000 + height,
            transaction_count: transactions.len() as u32,
        },
        transactions,
    }
}
