//! SQLite-backed store of consumer availability rows.
//!
//! The store has two phases that never overlap: a single [`StoreWriter`]
//! fills the `rows` table and builds the secondary indexes once at the end,
//! then any number of [`StoreReader`]s open the file read-only.

use crate::geo::Granularity;
use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags, params};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One provider offering consumer service in one census block.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRow {
    pub block_fips: String,
    pub tract_fips: String,
    pub county_fips: String,
    pub max_ad_down: f64,
    pub max_ad_up: f64,
    pub provider_id: String,
}

const CREATE_TABLE: &str = "CREATE TABLE rows (
    block_fips TEXT NOT NULL,
    tract_fips TEXT NOT NULL,
    county_fips TEXT NOT NULL,
    max_ad_down REAL NOT NULL,
    max_ad_up REAL NOT NULL,
    provider_id TEXT NOT NULL
)";

const CREATE_INDEXES: &str = "
    CREATE INDEX block_fips_index ON rows (block_fips);
    CREATE INDEX county_fips_index ON rows (county_fips);
    CREATE INDEX tract_fips_index ON rows (tract_fips);
";

const INSERT_ROW: &str = "INSERT INTO rows
    (block_fips, tract_fips, county_fips, max_ad_down, max_ad_up, provider_id)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

/// Write-phase handle. Owns the only connection allowed to modify the store.
pub struct StoreWriter {
    conn: Connection,
    path: PathBuf,
    rows: u64,
}

impl StoreWriter {
    /// Creates a new store at `path`. Refuses to reuse an existing file.
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            bail!("store {} already exists", path.display());
        }
        let conn = Connection::open(path)
            .with_context(|| format!("creating store {}", path.display()))?;
        // The file is disposable until `finish`, so durability is traded for speed.
        conn.execute_batch("PRAGMA journal_mode = OFF; PRAGMA synchronous = OFF;")?;
        conn.execute(CREATE_TABLE, [])?;
        debug!(path = %path.display(), "Store created");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            rows: 0,
        })
    }

    /// Inserts `rows` in a single transaction.
    pub fn insert_batch(&mut self, rows: &[ConsumerRow]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_ROW)?;
            for row in rows {
                stmt.execute(params![
                    row.block_fips,
                    row.tract_fips,
                    row.county_fips,
                    row.max_ad_down,
                    row.max_ad_up,
                    row.provider_id,
                ])?;
            }
        }
        tx.commit()?;
        self.rows += rows.len() as u64;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Builds the secondary indexes and closes the write phase.
    #[tracing::instrument(skip(self), fields(path = %self.path.display(), rows = self.rows))]
    pub fn finish(self) -> Result<u64> {
        info!("Creating indexes");
        self.conn.execute_batch(CREATE_INDEXES)?;
        self.conn
            .close()
            .map_err(|(_, e)| e)
            .context("closing store after ingestion")?;
        Ok(self.rows)
    }
}

/// Read-phase handle. Cheap enough to open one per worker.
pub struct StoreReader {
    conn: Connection,
}

impl StoreReader {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("opening store {}", path.display()))?;
        Ok(Self { conn })
    }

    /// Distinct identifiers present at `granularity`, in no particular order.
    pub fn distinct_ids(&self, granularity: Granularity) -> Result<Vec<String>> {
        let sql = format!("SELECT DISTINCT {} FROM rows", granularity.column());
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// All rows whose identifier at `granularity` equals `id`.
    pub fn rows_for(&self, granularity: Granularity, id: &str) -> Result<Vec<ConsumerRow>> {
        let sql = format!(
            "SELECT block_fips, tract_fips, county_fips, max_ad_down, max_ad_up, provider_id
             FROM rows WHERE {} = ?1",
            granularity.column()
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([id], |row| {
                Ok(ConsumerRow {
                    block_fips: row.get(0)?,
                    tract_fips: row.get(1)?,
                    county_fips: row.get(2)?,
                    max_ad_down: row.get(3)?,
                    max_ad_up: row.get(4)?,
                    provider_id: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn row_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM rows", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Names of the secondary indexes defined on `rows`.
    #[cfg(test)]
    fn index_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'rows' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::env;
    use std::fs;

    pub(crate) fn temp_store(name: &str) -> PathBuf {
        let path = env::temp_dir().join(format!("broadband_stats_{name}.sqlite"));
        let _ = fs::remove_file(&path);
        path
    }

    pub(crate) fn row(block: &str, down: f64, up: f64, provider: &str) -> ConsumerRow {
        ConsumerRow {
            block_fips: block.to_string(),
            tract_fips: crate::geo::tract_fips(block).to_string(),
            county_fips: crate::geo::county_fips(block).to_string(),
            max_ad_down: down,
            max_ad_up: up,
            provider_id: provider.to_string(),
        }
    }

    #[test]
    fn test_write_then_query_by_granularity() {
        let path = temp_store("store_query");
        let mut writer = StoreWriter::create(&path).unwrap();
        writer
            .insert_batch(&[
                row("060014001001000", 10.0, 1.0, "A"),
                row("060014001001001", 20.0, 2.0, "B"),
                row("060014002001000", 30.0, 3.0, "B"),
                row("360610001001000", 40.0, 4.0, "C"),
            ])
            .unwrap();
        assert_eq!(writer.finish().unwrap(), 4);

        let reader = StoreReader::open(&path).unwrap();
        assert_eq!(reader.row_count().unwrap(), 4);

        let mut counties = reader.distinct_ids(Granularity::County).unwrap();
        counties.sort();
        assert_eq!(counties, vec!["06001", "36061"]);
        assert_eq!(reader.distinct_ids(Granularity::Tract).unwrap().len(), 3);

        assert_eq!(reader.rows_for(Granularity::County, "06001").unwrap().len(), 3);
        assert_eq!(reader.rows_for(Granularity::Tract, "06001400100").unwrap().len(), 2);
        assert!(reader.rows_for(Granularity::County, "99999").unwrap().is_empty());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_indexes_built_on_finish() {
        let path = temp_store("store_indexes");
        let writer = StoreWriter::create(&path).unwrap();
        writer.finish().unwrap();

        let reader = StoreReader::open(&path).unwrap();
        assert_eq!(
            reader.index_names().unwrap(),
            vec!["block_fips_index", "county_fips_index", "tract_fips_index"]
        );
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_create_refuses_existing_store() {
        let path = temp_store("store_existing");
        StoreWriter::create(&path).unwrap().finish().unwrap();
        assert!(StoreWriter::create(&path).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_reader_cannot_write() {
        let path = temp_store("store_readonly");
        StoreWriter::create(&path).unwrap().finish().unwrap();
        let reader = StoreReader::open(&path).unwrap();
        assert!(reader.conn.execute("DELETE FROM rows", []).is_err());
        fs::remove_file(&path).unwrap();
    }
}
