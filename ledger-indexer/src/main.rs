#[macro_use]
extern crate log;

use clap::{Parser, Subcommand};
use ledger_indexer::btc::BTCRpcClient;
use ledger_indexer::config::IndexerConfig;
use ledger_indexer::index::LedgerIndexer;
use ledger_indexer::output::IndexOutput;
use ledger_indexer::script::StandardScriptClassifier;
use ledger_indexer::state::GlobalState;
use ledger_indexer::store::{LedgerStore, SqliteLedgerStore};
use ledger_util::{LEDGER_INDEXER_SERVICE_NAME, LogConfig};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "ledger-indexer")]
#[command(version = "0.1.0")]
#[command(about = "Bitcoin ledger and unspent output indexer", long_about = None)]
struct LedgerIndexerCli {
    #[command(subcommand)]
    command: Option<LedgerIndexerCommands>,

    /// Run the service in daemon mode
    #[arg(short, long)]
    daemon: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
#[command(rename_all = "kebab-case")]
enum LedgerIndexerCommands {
    /// Delete the database files, DANGEROUS: This will remove all indexed data!
    ClearDb {},

    /// Print the latest complete block and the stored mempool size
    Status {},
}

fn init_command_log(command: &str) {
    let file_name = format!("{}_{}", LEDGER_INDEXER_SERVICE_NAME, command);
    let config = LogConfig::new(LEDGER_INDEXER_SERVICE_NAME).with_file_name(&file_name);
    ledger_util::init_log(config);
}

fn load_config() -> IndexerConfig {
    let root_dir = ledger_util::get_service_dir(LEDGER_INDEXER_SERVICE_NAME);
    match IndexerConfig::load(&root_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load config: {}", e);
            println!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    }
}

fn open_store(config: &IndexerConfig) -> SqliteLedgerStore {
    match SqliteLedgerStore::open(&config.data_dir()) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open ledger store: {}", e);
            println!("Failed to open ledger store: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_status() {
    let config = load_config();
    let store = open_store(&config);

    match store.latest_complete_block() {
        Ok(Some(block)) => println!(
            "Latest complete block: {} ({}), {} txs",
            block.height, block.hash, block.transaction_count
        ),
        Ok(None) => println!("No complete block indexed yet"),
        Err(e) => println!("Failed to read latest block: {}", e),
    }

    match store.first_incomplete_block() {
        Ok(Some(block)) => {
            println!(
                "WARNING: block {} ({}) is not marked complete",
                block.height, block.hash
            );
            println!(
                "The next run recommits it from the node. If that fails, run clear-db and index again."
            );
        }
        Ok(None) => {}
        Err(e) => println!("Failed to read incomplete blocks: {}", e),
    }

    match store.mempool_transaction_ids() {
        Ok(ids) => println!("Stored mempool transactions: {}", ids.len()),
        Err(e) => println!("Failed to read mempool: {}", e),
    }
}

async fn main_run() {
    let (_lock, _guard) = ledger_util::init_process_lock(LEDGER_INDEXER_SERVICE_NAME);

    let output = Arc::new(IndexOutput::new());

    // Init file logging
    let log_config = LogConfig::new(LEDGER_INDEXER_SERVICE_NAME).enable_console(false);
    ledger_util::init_log(log_config);

    let root_dir = ledger_util::get_service_dir(LEDGER_INDEXER_SERVICE_NAME);
    info!("Using service directory: {}", root_dir.display());
    output.println(&format!("Using service directory: {}", root_dir.display()));

    let config = Arc::new(load_config());

    output.println(&format!(
        "Opening ledger store at {}",
        config.data_dir().display()
    ));
    let store = Arc::new(open_store(&config));

    let source = Arc::new(BTCRpcClient::new(config.btc.rpc_url(), config.btc.auth()));
    let state = Arc::new(GlobalState::new());

    let indexer = Arc::new(LedgerIndexer::new(
        config.clone(),
        source,
        store,
        state,
        Arc::new(StandardScriptClassifier),
        output.clone(),
    ));
    output.println("Starting indexer...");

    let mut handle = tokio::spawn({
        let indexer = indexer.clone();
        async move { indexer.run().await }
    });

    use tokio::signal;
    let sigint = signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to create SIGTERM signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    // On non-Unix systems, we only rely on Ctrl+C
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    let finished = tokio::select! {
        _ = sigint => {
            info!("Received Ctrl+C, shutting down...");
            false
        }
        _ = sigterm => {
            info!("Received SIGTERM, shutting down...");
            false
        }
        result = &mut handle => {
            report_run_result(result);
            true
        }
    };

    if !finished {
        output.println("Shutting down indexer...");
        indexer.shutdown();
        report_run_result(handle.await);
    }

    println!("Shutdown complete.");

    // Give the logger a moment to flush
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
}

fn report_run_result(
    result: Result<ledger_indexer::IndexResult<()>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => info!("Indexer run loop exited"),
        Ok(Err(e)) => {
            error!("Indexer encountered an error: {}", e);
            println!("Indexer encountered an error: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Indexer task panicked: {}", e);
            std::process::exit(1);
        }
    }
}

fn main() {
    let cli = LedgerIndexerCli::parse();

    match cli.command {
        Some(LedgerIndexerCommands::ClearDb {}) => {
            init_command_log("clear_db");

            let config = load_config();
            if let Err(e) = ledger_indexer::tool::clear_db_files(&config.data_dir()) {
                error!("Failed to clear database files: {}", e);
                std::process::exit(1);
            }
            println!("Database files cleared successfully.");
            return;
        }
        Some(LedgerIndexerCommands::Status {}) => {
            init_command_log("status");
            print_status();
            return;
        }
        None => {}
    }

    // Fork before the runtime starts any threads
    if cli.daemon {
        ledger_indexer::tool::daemonize_process(LEDGER_INDEXER_SERVICE_NAME);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            println!("Failed to start tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(main_run());
    println!("Ledger indexer service exited.");
}
