pub mod btc;
pub mod config;
pub mod error;
pub mod index;
pub mod output;
pub mod script;
pub mod state;
pub mod store;
pub mod tool;
pub mod types;

#[macro_use]
extern crate log;

pub use error::{IndexError, IndexResult, StoreError, StoreResult};
