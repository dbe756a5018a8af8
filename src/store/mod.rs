use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::LinesError;

pub mod pool;
use pool::ConnectionPool;

const DB_FILE: &str = "lines.db";

/// Default acquisition bounds: 100 attempts, one second apart.
const ACQUIRE_ATTEMPTS: u32 = 100;
const ACQUIRE_WAIT: Duration = Duration::from_secs(1);

/// Page size for historical score reads.
const FETCH_PAGE: u32 = 100;

/// Per-sport append-only score storage over a pooled SQLite database.
///
/// One table per tracked sport, created by [`add_line`]. Every operation
/// runs through a pooled connection lease and returns the connection when
/// the operation's scope ends.
///
/// [`add_line`]: LineStore::add_line
pub struct LineStore {
    pool: ConnectionPool,
}

impl LineStore {
    /// Open (or create) the database file under `data_dir` and build the
    /// connection pool. An unusable path is fatal.
    pub fn open(data_dir: &Path) -> Result<Self, LinesError> {
        let db_path = data_dir.join(DB_FILE);

        let init = Connection::open(&db_path)
            .map_err(|e| LinesError::InvalidArgument(format!("open {}: {e}", db_path.display())))?;
        init.execute_batch("PRAGMA journal_mode=WAL; PRAGMA auto_vacuum=INCREMENTAL;")?;
        drop(init);

        let capacity = 2 * std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        info!(db = %db_path.display(), capacity, "opening line store");

        let factory_path = db_path.clone();
        let pool = ConnectionPool::new(
            capacity,
            Box::new(move || {
                let conn = Connection::open(&factory_path).map_err(|e| {
                    LinesError::InvalidArgument(format!(
                        "open {}: {e}",
                        factory_path.display()
                    ))
                })?;
                conn.busy_handler(Some(busy_retry))?;
                Ok(conn)
            }),
        )?;

        Ok(LineStore { pool })
    }

    /// Create the sport's append-only table and its score index.
    pub async fn add_line(&self, sport: &str) -> Result<(), LinesError> {
        let table = table_name(sport)?;
        let lease = self.pool.acquire(ACQUIRE_ATTEMPTS, ACQUIRE_WAIT).await?;
        debug!(sport, "add line");
        lease.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (id INTEGER PRIMARY KEY AUTOINCREMENT, score REAL NOT NULL); \
             CREATE INDEX IF NOT EXISTS {table}_score_idx ON {table} (score ASC);"
        ))?;
        Ok(())
    }

    /// Drop the sport's table.
    pub async fn rem_line(&self, sport: &str) -> Result<(), LinesError> {
        let table = table_name(sport)?;
        let lease = self.pool.acquire(ACQUIRE_ATTEMPTS, ACQUIRE_WAIT).await?;
        debug!(sport, "remove line");
        lease.execute_batch(&format!("DROP TABLE {table};"))?;
        Ok(())
    }

    /// Append one observed score.
    pub async fn update_line(&self, sport: &str, score: f64) -> Result<(), LinesError> {
        let table = table_name(sport)?;
        let lease = self.pool.acquire(ACQUIRE_ATTEMPTS, ACQUIRE_WAIT).await?;
        lease.execute(
            &format!("INSERT INTO {table} (score) VALUES (?1)"),
            params![score],
        )?;
        Ok(())
    }

    /// Most recently persisted score, `0.0` when nothing has been recorded.
    pub async fn last_score(&self, sport: &str) -> Result<f64, LinesError> {
        let table = table_name(sport)?;
        let lease = self.pool.acquire(ACQUIRE_ATTEMPTS, ACQUIRE_WAIT).await?;
        let score = lease
            .query_row(
                &format!("SELECT score FROM {table} ORDER BY id DESC LIMIT 1"),
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(score.unwrap_or(0.0))
    }

    /// One page of historical scores, most-recent-first.
    pub async fn fetch_score(&self, sport: &str) -> Result<Vec<f64>, LinesError> {
        let table = table_name(sport)?;
        let lease = self.pool.acquire(ACQUIRE_ATTEMPTS, ACQUIRE_WAIT).await?;
        let mut stmt = lease.prepare(&format!(
            "SELECT score FROM {table} ORDER BY id DESC LIMIT {FETCH_PAGE}"
        ))?;
        let scores = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<f64>>>()?;
        Ok(scores)
    }

    /// Drain the pool: reject new operations, wait for in-flight ones.
    pub async fn close(&self) {
        self.pool.drain().await;
    }
}

/// Sport names become table names, so they must be plain identifiers.
fn table_name(sport: &str) -> Result<&str, LinesError> {
    let mut chars = sport.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(sport)
    } else {
        Err(LinesError::InvalidArgument(format!(
            "sport name {sport:?} is not a valid identifier"
        )))
    }
}

fn busy_retry(_attempts: i32) -> bool {
    std::thread::sleep(Duration::from_millis(10));
    true
}
