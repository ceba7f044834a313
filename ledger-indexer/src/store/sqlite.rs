use super::LedgerStore;
use crate::error::{StoreError, StoreResult, WriteError, WriteErrorKind};
use crate::types::{
    BlockRecord, InputRecord, MempoolTransaction, OutputRecord, RawTransactionRecord, Table,
    TransactionBlockRecord, UnspentOutputRecord,
};
use bitcoincore_rpc::bitcoin::{BlockHash, OutPoint, Txid};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Statement};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS blocks (
        height INTEGER PRIMARY KEY,
        hash TEXT NOT NULL,
        previous_hash TEXT,
        size INTEGER NOT NULL,
        time INTEGER NOT NULL,
        transaction_count INTEGER NOT NULL,
        sync_complete INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_blocks_hash ON blocks (hash);

    CREATE TABLE IF NOT EXISTS transaction_blocks (
        txid TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        tx_index INTEGER NOT NULL,
        output_count INTEGER NOT NULL,
        PRIMARY KEY (txid, block_height)
    );
    CREATE INDEX IF NOT EXISTS idx_transaction_blocks_height
    ON transaction_blocks (block_height, tx_index);

    CREATE TABLE IF NOT EXISTS raw_transactions (
        txid TEXT NOT NULL PRIMARY KEY,
        raw BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS outputs (
        txid TEXT NOT NULL,
        vout INTEGER NOT NULL,
        address TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        value INTEGER NOT NULL,
        coinbase INTEGER NOT NULL,
        coinstake INTEGER NOT NULL,
        script_hex TEXT NOT NULL,
        PRIMARY KEY (txid, vout)
    );
    CREATE INDEX IF NOT EXISTS idx_outputs_address ON outputs (address, block_height);

    CREATE TABLE IF NOT EXISTS inputs (
        txid TEXT NOT NULL,
        vout INTEGER NOT NULL,
        spending_txid TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        address TEXT NOT NULL,
        value INTEGER NOT NULL,
        PRIMARY KEY (txid, vout)
    );
    CREATE INDEX IF NOT EXISTS idx_inputs_spending_txid ON inputs (spending_txid);
    CREATE INDEX IF NOT EXISTS idx_inputs_address ON inputs (address, block_height);

    CREATE TABLE IF NOT EXISTS unspent_outputs (
        txid TEXT NOT NULL,
        vout INTEGER NOT NULL,
        address TEXT NOT NULL,
        value INTEGER NOT NULL,
        block_height INTEGER NOT NULL,
        PRIMARY KEY (txid, vout)
    );
    CREATE INDEX IF NOT EXISTS idx_unspent_outputs_address ON unspent_outputs (address);

    CREATE TABLE IF NOT EXISTS mempool (
        txid TEXT NOT NULL PRIMARY KEY,
        first_seen INTEGER NOT NULL,
        body TEXT NOT NULL
    );
";

const BLOCK_COLUMNS: &str =
    "height, hash, previous_hash, size, time, transaction_count, sync_complete";

pub struct SqliteLedgerStore {
    db_path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir).map_err(|e| {
                let msg = format!(
                    "Could not create data directory at {}: {}",
                    data_dir.display(),
                    e
                );
                error!("{}", msg);
                StoreError::Backend(msg)
            })?;
        }

        let db_path = data_dir.join(ledger_util::LEDGER_DB_FILE);
        info!("Opening ledger database at {}", db_path.display());

        let conn = Connection::open(&db_path)
            .map_err(|e| backend_error(&format!("open {}", db_path.display()), e))?;

        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| backend_error("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| backend_error("set synchronous", e))?;
        info!("Ledger database journal mode: {}", mode);

        Self::init(Some(db_path), conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| backend_error("open in-memory", e))?;
        Self::init(None, conn)
    }

    fn init(db_path: Option<PathBuf>, conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| backend_error("initialize schema", e))?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Unordered bulk insert: each row runs as its own statement inside one
    /// transaction, so a failing row leaves the others in place.
    fn bulk_insert<T, F>(&self, table: Table, sql: &str, rows: &[T], bind: F) -> StoreResult<()>
    where
        F: Fn(&mut Statement<'_>, &T) -> rusqlite::Result<usize>,
    {
        if rows.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| backend_error(&format!("begin insert into {}", table), e))?;

        let mut errors = Vec::new();
        {
            let mut stmt = tx
                .prepare_cached(sql)
                .map_err(|e| backend_error(&format!("prepare insert into {}", table), e))?;

            for (index, row) in rows.iter().enumerate() {
                if let Err(e) = bind(&mut stmt, row) {
                    errors.push(WriteError {
                        index,
                        kind: classify_write_error(&e),
                        message: e.to_string(),
                    });
                }
            }
        }

        tx.commit()
            .map_err(|e| backend_error(&format!("commit insert into {}", table), e))?;

        if errors.is_empty() {
            debug!("Inserted {} rows into {}", rows.len(), table);
            return Ok(());
        }

        let duplicates = errors
            .iter()
            .filter(|e| e.kind == WriteErrorKind::DuplicateKey)
            .count();
        warn!(
            "Bulk insert into {}: {} of {} rows failed ({} duplicate keys)",
            table,
            errors.len(),
            rows.len(),
            duplicates
        );

        Err(StoreError::BulkWrite { table, errors })
    }

    fn find_by_outpoints<T>(
        &self,
        sql: &str,
        outpoints: &[OutPoint],
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Vec<T>> {
        if outpoints.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(|e| backend_error("prepare outpoint lookup", e))?;

        let mut result = Vec::with_capacity(outpoints.len());
        for outpoint in outpoints {
            let found = stmt
                .query_row(
                    rusqlite::params![outpoint.txid.to_string(), outpoint.vout as i64],
                    map,
                )
                .optional()
                .map_err(|e| backend_error(&format!("lookup outpoint {}", outpoint), e))?;

            if let Some(item) = found {
                result.push(item);
            }
        }

        Ok(result)
    }

    fn query_block(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> StoreResult<Option<BlockRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(sql, params, row_to_block)
            .optional()
            .map_err(|e| backend_error("query block", e))
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn insert_blocks(&self, blocks: &[BlockRecord]) -> StoreResult<()> {
        self.bulk_insert(
            Table::Blocks,
            "INSERT INTO blocks (height, hash, previous_hash, size, time, transaction_count, sync_complete)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            blocks,
            |stmt, b| {
                stmt.execute(rusqlite::params![
                    b.height as i64,
                    b.hash.to_string(),
                    b.previous_hash.map(|h| h.to_string()),
                    b.size as i64,
                    b.time as i64,
                    b.transaction_count as i64,
                    b.sync_complete,
                ])
            },
        )
    }

    fn insert_transaction_blocks(&self, rows: &[TransactionBlockRecord]) -> StoreResult<()> {
        self.bulk_insert(
            Table::TransactionBlocks,
            "INSERT INTO transaction_blocks (txid, block_height, tx_index, output_count)
             VALUES (?1, ?2, ?3, ?4)",
            rows,
            |stmt, r| {
                stmt.execute(rusqlite::params![
                    r.txid.to_string(),
                    r.block_height as i64,
                    r.tx_index as i64,
                    r.output_count as i64,
                ])
            },
        )
    }

    fn insert_raw_transactions(&self, rows: &[RawTransactionRecord]) -> StoreResult<()> {
        self.bulk_insert(
            Table::RawTransactions,
            "INSERT INTO raw_transactions (txid, raw) VALUES (?1, ?2)",
            rows,
            |stmt, r| stmt.execute(rusqlite::params![r.txid.to_string(), r.raw]),
        )
    }

    fn insert_outputs(&self, rows: &[OutputRecord]) -> StoreResult<()> {
        self.bulk_insert(
            Table::Outputs,
            "INSERT INTO outputs (txid, vout, address, block_height, value, coinbase, coinstake, script_hex)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rows,
            |stmt, o| {
                stmt.execute(rusqlite::params![
                    o.outpoint.txid.to_string(),
                    o.outpoint.vout as i64,
                    o.address,
                    o.block_height as i64,
                    o.value as i64,
                    o.coinbase,
                    o.coinstake,
                    o.script_hex,
                ])
            },
        )
    }

    fn insert_inputs(&self, rows: &[InputRecord]) -> StoreResult<()> {
        self.bulk_insert(
            Table::Inputs,
            "INSERT INTO inputs (txid, vout, spending_txid, block_height, address, value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rows,
            |stmt, i| {
                // An unresolved input violates NOT NULL and is reported as a row failure
                stmt.execute(rusqlite::params![
                    i.outpoint.txid.to_string(),
                    i.outpoint.vout as i64,
                    i.txid.to_string(),
                    i.block_height as i64,
                    i.address,
                    i.value.map(|v| v as i64),
                ])
            },
        )
    }

    fn insert_unspent_outputs(&self, rows: &[UnspentOutputRecord]) -> StoreResult<()> {
        self.bulk_insert(
            Table::UnspentOutputs,
            "INSERT INTO unspent_outputs (txid, vout, address, value, block_height)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rows,
            |stmt, u| {
                stmt.execute(rusqlite::params![
                    u.outpoint.txid.to_string(),
                    u.outpoint.vout as i64,
                    u.address,
                    u.value as i64,
                    u.block_height as i64,
                ])
            },
        )
    }

    fn insert_mempool_transactions(&self, rows: &[MempoolTransaction]) -> StoreResult<()> {
        let mut encoded = Vec::with_capacity(rows.len());
        for entry in rows {
            let body = serde_json::to_string(entry).map_err(|e| {
                let msg = format!("Failed to encode mempool transaction {}: {}", entry.txid, e);
                error!("{}", msg);
                StoreError::Backend(msg)
            })?;
            encoded.push((entry.txid.to_string(), entry.first_seen as i64, body));
        }

        self.bulk_insert(
            Table::Mempool,
            "INSERT INTO mempool (txid, first_seen, body) VALUES (?1, ?2, ?3)",
            &encoded,
            |stmt, (txid, first_seen, body)| {
                stmt.execute(rusqlite::params![txid, first_seen, body])
            },
        )
    }

    fn find_unspent_outputs(&self, outpoints: &[OutPoint]) -> StoreResult<Vec<UnspentOutputRecord>> {
        self.find_by_outpoints(
            "SELECT txid, vout, address, value, block_height
             FROM unspent_outputs WHERE txid = ?1 AND vout = ?2",
            outpoints,
            row_to_unspent_output,
        )
    }

    fn find_outputs(&self, outpoints: &[OutPoint]) -> StoreResult<Vec<OutputRecord>> {
        self.find_by_outpoints(
            "SELECT txid, vout, address, block_height, value, coinbase, coinstake, script_hex
             FROM outputs WHERE txid = ?1 AND vout = ?2",
            outpoints,
            row_to_output,
        )
    }

    fn find_inputs(&self, outpoints: &[OutPoint]) -> StoreResult<Vec<InputRecord>> {
        self.find_by_outpoints(
            "SELECT txid, vout, spending_txid, block_height, address, value
             FROM inputs WHERE txid = ?1 AND vout = ?2",
            outpoints,
            row_to_input,
        )
    }

    fn delete_unspent_outputs(&self, outpoints: &[OutPoint]) -> StoreResult<u64> {
        if outpoints.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| backend_error("begin delete unspent outputs", e))?;

        let mut deleted = 0u64;
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM unspent_outputs WHERE txid = ?1 AND vout = ?2")
                .map_err(|e| backend_error("prepare delete unspent outputs", e))?;
            for outpoint in outpoints {
                let affected = stmt
                    .execute(rusqlite::params![outpoint.txid.to_string(), outpoint.vout as i64])
                    .map_err(|e| backend_error(&format!("delete unspent output {}", outpoint), e))?;
                deleted += affected as u64;
            }
        }

        tx.commit()
            .map_err(|e| backend_error("commit delete unspent outputs", e))?;

        Ok(deleted)
    }

    fn delete_mempool_transactions(&self, txids: &[Txid]) -> StoreResult<u64> {
        if txids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| backend_error("begin delete mempool", e))?;

        let mut deleted = 0u64;
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM mempool WHERE txid = ?1")
                .map_err(|e| backend_error("prepare delete mempool", e))?;
            for txid in txids {
                deleted += stmt
                    .execute([txid.to_string()])
                    .map_err(|e| backend_error(&format!("delete mempool transaction {}", txid), e))?
                    as u64;
            }
        }

        tx.commit().map_err(|e| backend_error("commit delete mempool", e))?;

        Ok(deleted)
    }

    fn mark_blocks_complete(&self, blocks: &[(u32, BlockHash)]) -> StoreResult<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| backend_error("begin mark blocks complete", e))?;

        {
            let mut stmt = tx
                .prepare_cached("UPDATE blocks SET sync_complete = 1 WHERE height = ?1 AND hash = ?2")
                .map_err(|e| backend_error("prepare mark blocks complete", e))?;
            for (height, hash) in blocks {
                let affected = stmt
                    .execute(rusqlite::params![*height as i64, hash.to_string()])
                    .map_err(|e| backend_error(&format!("mark block {} complete", height), e))?;
                if affected == 0 {
                    // Dropping the transaction rolls back the earlier updates
                    error!(
                        "Block {} with hash {} not found when marking complete",
                        height, hash
                    );
                    return Err(StoreError::UnmarkedBlock {
                        height: *height,
                        hash: *hash,
                    });
                }
            }
        }

        tx.commit()
            .map_err(|e| backend_error("commit mark blocks complete", e))?;

        Ok(())
    }

    fn block_by_height(&self, height: u32) -> StoreResult<Option<BlockRecord>> {
        let sql = format!("SELECT {} FROM blocks WHERE height = ?1", BLOCK_COLUMNS);
        self.query_block(&sql, rusqlite::params![height as i64])
    }

    fn latest_complete_block(&self) -> StoreResult<Option<BlockRecord>> {
        let sql = format!(
            "SELECT {} FROM blocks WHERE sync_complete = 1 ORDER BY height DESC LIMIT 1",
            BLOCK_COLUMNS
        );
        self.query_block(&sql, rusqlite::params![])
    }

    fn first_incomplete_block(&self) -> StoreResult<Option<BlockRecord>> {
        let sql = format!(
            "SELECT {} FROM blocks WHERE sync_complete = 0 ORDER BY height ASC LIMIT 1",
            BLOCK_COLUMNS
        );
        self.query_block(&sql, rusqlite::params![])
    }

    fn inputs_by_transaction(&self, txid: &Txid) -> StoreResult<Vec<InputRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached(
                "SELECT txid, vout, spending_txid, block_height, address, value
                 FROM inputs WHERE spending_txid = ?1",
            )
            .map_err(|e| backend_error("prepare inputs lookup", e))?;

        let rows = stmt
            .query_map([txid.to_string()], row_to_input)
            .map_err(|e| backend_error(&format!("query inputs of {}", txid), e))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| backend_error(&format!("decode inputs of {}", txid), e))
    }

    fn raw_transaction(&self, txid: &Txid) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT raw FROM raw_transactions WHERE txid = ?1",
            [txid.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| backend_error(&format!("query raw transaction {}", txid), e))
    }

    fn mempool_transaction(&self, txid: &Txid) -> StoreResult<Option<MempoolTransaction>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT body FROM mempool WHERE txid = ?1",
            [txid.to_string()],
            |row| {
                let body: String = row.get(0)?;
                serde_json::from_str(&body).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
                })
            },
        )
        .optional()
        .map_err(|e| backend_error(&format!("query mempool transaction {}", txid), e))
    }

    fn mempool_transaction_ids(&self) -> StoreResult<Vec<Txid>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached("SELECT txid FROM mempool ORDER BY first_seen ASC")
            .map_err(|e| backend_error("prepare mempool ids", e))?;

        let rows = stmt
            .query_map([], |row| parse_column::<Txid>(row, 0))
            .map_err(|e| backend_error("query mempool ids", e))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| backend_error("decode mempool ids", e))
    }
}

fn backend_error(context: &str, e: rusqlite::Error) -> StoreError {
    let msg = format!("Failed to {}: {}", context, e);
    error!("{}", msg);
    StoreError::Backend(msg)
}

fn classify_write_error(e: &rusqlite::Error) -> WriteErrorKind {
    if let rusqlite::Error::SqliteFailure(err, _) = e {
        if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        {
            return WriteErrorKind::DuplicateKey;
        }
    }

    WriteErrorKind::Other
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => s.parse::<T>().map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

fn outpoint_from_row(row: &Row<'_>) -> rusqlite::Result<OutPoint> {
    Ok(OutPoint {
        txid: parse_column(row, 0)?,
        vout: row.get::<_, i64>(1)? as u32,
    })
}

fn row_to_block(row: &Row<'_>) -> rusqlite::Result<BlockRecord> {
    Ok(BlockRecord {
        height: row.get::<_, i64>(0)? as u32,
        hash: parse_column(row, 1)?,
        previous_hash: parse_optional_column(row, 2)?,
        size: row.get::<_, i64>(3)? as u64,
        time: row.get::<_, i64>(4)? as u32,
        transaction_count: row.get::<_, i64>(5)? as u32,
        sync_complete: row.get(6)?,
    })
}

fn row_to_output(row: &Row<'_>) -> rusqlite::Result<OutputRecord> {
    Ok(OutputRecord {
        outpoint: outpoint_from_row(row)?,
        address: row.get(2)?,
        block_height: row.get::<_, i64>(3)? as u32,
        value: row.get::<_, i64>(4)? as u64,
        coinbase: row.get(5)?,
        coinstake: row.get(6)?,
        script_hex: row.get(7)?,
    })
}

fn row_to_unspent_output(row: &Row<'_>) -> rusqlite::Result<UnspentOutputRecord> {
    Ok(UnspentOutputRecord {
        outpoint: outpoint_from_row(row)?,
        address: row.get(2)?,
        value: row.get::<_, i64>(3)? as u64,
        block_height: row.get::<_, i64>(4)? as u32,
    })
}

fn row_to_input(row: &Row<'_>) -> rusqlite::Result<InputRecord> {
    Ok(InputRecord {
        outpoint: outpoint_from_row(row)?,
        txid: parse_column(row, 2)?,
        block_height: row.get::<_, i64>(3)? as u32,
        address: Some(row.get(4)?),
        value: Some(row.get::<_, i64>(5)? as u64),
    })
}
