use bitcoincore_rpc::bitcoin::{Address, Network, Script};
use std::sync::Arc;

pub const NULL_DATA_LABEL: &str = "TX_NULL_DATA";
pub const NONE_LABEL: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    NullData,
    PubKey,
    WitnessUnknown,
    NonStandard,
}

impl ScriptKind {
    pub fn label(&self) -> &'static str {
        match self {
            ScriptKind::NullData => NULL_DATA_LABEL,
            ScriptKind::PubKey => "TX_PUBKEY",
            ScriptKind::WitnessUnknown => "TX_WITNESS_UNKNOWN",
            ScriptKind::NonStandard => "TX_NONSTANDARD",
        }
    }
}

/// Result of classifying a locking script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptClass {
    /// Never empty, in script order.
    Addresses(Vec<String>),
    Kind(ScriptKind),
}

impl ScriptClass {
    pub fn first_address(&self) -> Option<&str> {
        match self {
            ScriptClass::Addresses(addresses) => addresses.first().map(|a| a.as_str()),
            ScriptClass::Kind(_) => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ScriptClass::Addresses(addresses) => match addresses.first() {
                Some(address) => address.as_str(),
                None => NONE_LABEL,
            },
            ScriptClass::Kind(kind) => kind.label(),
        }
    }
}

pub trait ScriptClassifier: Send + Sync {
    fn classify(&self, network: Network, script: &Script) -> Option<ScriptClass>;
}

pub type ScriptClassifierRef = Arc<dyn ScriptClassifier>;

/// Ledger label: first address, else the script kind, else "none".
pub fn address_or_label(class: Option<&ScriptClass>) -> String {
    match class {
        Some(class) => class.label().to_string(),
        None => NONE_LABEL.to_string(),
    }
}

/// Mempool label: like the ledger label but an unclassifiable script yields nothing.
pub fn mempool_address(class: Option<&ScriptClass>) -> Option<String> {
    class.map(|c| c.label().to_string())
}

pub fn is_null_data_label(address: &str) -> bool {
    address == NULL_DATA_LABEL
}

/// Classifier backed by rust-bitcoin's standard address templates.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardScriptClassifier;

impl ScriptClassifier for StandardScriptClassifier {
    fn classify(&self, network: Network, script: &Script) -> Option<ScriptClass> {
        if script.is_empty() {
            return None;
        }

        if script.is_op_return() {
            return Some(ScriptClass::Kind(ScriptKind::NullData));
        }

        if let Ok(address) = Address::from_script(script, network) {
            return Some(ScriptClass::Addresses(vec![address.to_string()]));
        }

        let kind = if script.is_p2pk() {
            ScriptKind::PubKey
        } else if script.is_witness_program() {
            ScriptKind::WitnessUnknown
        } else {
            ScriptKind::NonStandard
        };

        Some(ScriptClass::Kind(kind))
    }
}
