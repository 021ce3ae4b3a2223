use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{Candle, Timeframe};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, Transaction};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, error, info, instrument};

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 一次按周期批量写入的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    /// 本批次写入（插入或覆盖）的行数
    pub upserted: usize,
    /// 保留窗口清理掉的行数
    pub pruned: usize,
    /// 本批次涉及的品种数
    pub touched_symbols: usize,
}

/// OHLCV 存储
///
/// 每个周期一张表 `ohlcv_<tf>`，主键 `(symbol, timestamp)`。
/// 所有写入都经过 upsert/prune，不做直接的行编辑
#[derive(Clone, Debug)]
pub struct OhlcvRepository {
    pool: DbPool,
}

impl OhlcvRepository {
    /// Create a new database connection with WAL mode
    #[instrument(skip(db_path), fields(db_path = %db_path.as_ref().display()), err)]
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure parent directory exists for database
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch("
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = 5000;
            ")
        });

        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| {
                let pool_error = AppError::DatabaseError(format!("Failed to create connection pool: {}", e));
                error!(
                    target: "db",
                    db_path = %db_path.display(),
                    error.summary = pool_error.get_error_type_summary(),
                    error.details = %pool_error,
                    "创建连接池失败"
                );
                pool_error
            })?;

        info!(target: "db", "SQLite数据库已打开: {}", db_path.display());
        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))
    }

    /// 启动时为所有配置的周期建表
    pub fn ensure_tables(&self, timeframes: &[Timeframe]) -> Result<()> {
        let conn = self.conn()?;
        for timeframe in timeframes {
            Self::ensure_table(&conn, *timeframe)?;
        }
        debug!(target: "db", count = timeframes.len(), "周期表检查完成");
        Ok(())
    }

    fn ensure_table(conn: &Connection, timeframe: Timeframe) -> Result<()> {
        let table_name = timeframe.table_name();
        let create_table_sql = format!(
            "CREATE TABLE IF NOT EXISTS {table_name} (
                symbol TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                turnover REAL,
                PRIMARY KEY (symbol, timestamp)
            )"
        );

        conn.execute(&create_table_sql, [])
            .map_err(|e| AppError::DatabaseError(format!("Failed to create table {}: {}", table_name, e)))?;

        Ok(())
    }

    /// 插入或覆盖K线，键为 `(symbol, timestamp)`，重复调用结果不变
    pub fn upsert(&self, timeframe: Timeframe, records: &[Candle]) -> Result<usize> {
        self.in_transaction(timeframe, |tx| Self::upsert_in_tx(tx, timeframe, records))
    }

    /// 对 `touched` 中的每个品种只保留最新的 `retention_limit` 根K线
    pub fn prune<S: AsRef<str>>(&self, timeframe: Timeframe, touched: &[S], retention_limit: usize) -> Result<usize> {
        self.in_transaction(timeframe, |tx| Self::prune_in_tx(tx, timeframe, touched, retention_limit))
    }

    /// upsert 后立即 prune，同一个事务内完成，要么全部提交要么全部回滚
    ///
    /// 只有出现在 `records` 中的品种会被 prune
    #[instrument(skip(self, records), fields(timeframe = %timeframe, records = records.len()), err)]
    pub fn store_batch(&self, timeframe: Timeframe, records: &[Candle], retention_limit: usize) -> Result<StoreSummary> {
        let touched: BTreeSet<&str> = records.iter().map(|c| c.symbol.as_str()).collect();
        let touched: Vec<&str> = touched.into_iter().collect();

        let summary = self.in_transaction(timeframe, |tx| {
            let upserted = Self::upsert_in_tx(tx, timeframe, records)?;
            let pruned = Self::prune_in_tx(tx, timeframe, &touched, retention_limit)?;
            Ok(StoreSummary {
                upserted,
                pruned,
                touched_symbols: touched.len(),
            })
        })?;

        debug!(
            target: "db",
            upserted = summary.upserted,
            pruned = summary.pruned,
            touched_symbols = summary.touched_symbols,
            "{} 批量写入完成",
            timeframe
        );
        Ok(summary)
    }

    /// 删除 `keep` 以外所有品种的数据，返回删除的行数
    pub fn purge_untracked<S: AsRef<str>>(&self, timeframe: Timeframe, keep: &[S]) -> Result<usize> {
        let keep: BTreeSet<&str> = keep.iter().map(|s| s.as_ref()).collect();

        self.in_transaction(timeframe, |tx| {
            let stale: Vec<String> = Self::symbols_in(tx, timeframe)?
                .into_iter()
                .filter(|s| !keep.contains(s.as_str()))
                .collect();

            let delete_sql = format!("DELETE FROM {} WHERE symbol = ?1", timeframe.table_name());
            let mut deleted = 0;
            for symbol in &stale {
                deleted += tx.execute(&delete_sql, params![symbol])?;
            }

            if !stale.is_empty() {
                info!(target: "db", symbols = ?stale, deleted, "{} 已清理不再跟踪的品种", timeframe);
            }
            Ok(deleted)
        })
    }

    /// 某个品种在某个周期下的行数
    pub fn count_rows(&self, timeframe: Timeframe, symbol: &str) -> Result<usize> {
        let conn = self.conn()?;
        Self::ensure_table(&conn, timeframe)?;

        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE symbol = ?1", timeframe.table_name()),
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// 最新的 `limit` 根K线，最新的在前
    pub fn latest_candles(&self, timeframe: Timeframe, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        let conn = self.conn()?;
        Self::ensure_table(&conn, timeframe)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT symbol, timestamp, open, high, low, close, volume, turnover
             FROM {} WHERE symbol = ?1 ORDER BY timestamp DESC LIMIT ?2",
            timeframe.table_name()
        ))?;

        let rows = stmt.query_map(params![symbol, limit as i64], |row| {
            Ok(Candle {
                symbol: row.get(0)?,
                open_time: row.get(1)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
                volume: row.get(6)?,
                turnover: row.get(7)?,
            })
        })?;

        let mut candles = Vec::new();
        for candle in rows {
            candles.push(candle?);
        }
        Ok(candles)
    }

    /// 某个周期表里出现过的所有品种（按字母序）
    pub fn stored_symbols(&self, timeframe: Timeframe) -> Result<Vec<String>> {
        let conn = self.conn()?;
        Self::ensure_table(&conn, timeframe)?;
        Self::symbols_in(&conn, timeframe)
    }

    fn symbols_in(conn: &Connection, timeframe: Timeframe) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT symbol FROM {} ORDER BY symbol",
            timeframe.table_name()
        ))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut symbols = Vec::new();
        for symbol in rows {
            symbols.push(symbol?);
        }
        Ok(symbols)
    }

    /// 在一个事务内执行写操作，闭包返回错误时回滚
    fn in_transaction<T, F>(&self, timeframe: Timeframe, op: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn()?;
        Self::ensure_table(&conn, timeframe)?;

        let tx = conn.transaction()
            .map_err(|e| AppError::DatabaseError(format!("开始事务失败: {}", e)))?;

        match op(&tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|e| AppError::DatabaseError(format!("提交事务失败: {}", e)))?;
                Ok(value)
            },
            Err(e) => {
                let _ = tx.rollback();
                error!(
                    target: "db",
                    table_name = timeframe.table_name(),
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "数据库写入失败，事务已回滚"
                );
                Err(e)
            }
        }
    }

    fn upsert_in_tx(tx: &Transaction<'_>, timeframe: Timeframe, records: &[Candle]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let upsert_sql = format!(
            "INSERT INTO {} (symbol, timestamp, open, high, low, close, volume, turnover)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(symbol, timestamp) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                turnover = excluded.turnover",
            timeframe.table_name()
        );

        let mut stmt = tx.prepare_cached(&upsert_sql)?;
        let mut count = 0;
        for candle in records {
            count += stmt
                .execute(params![
                    candle.symbol,
                    candle.open_time,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                    candle.turnover,
                ])
                .map_err(|e| {
                    AppError::DatabaseError(format!(
                        "写入K线失败 {}/{}@{}: {}",
                        candle.symbol, timeframe, candle.open_time, e
                    ))
                })?;
        }

        Ok(count)
    }

    fn prune_in_tx<S: AsRef<str>>(
        tx: &Transaction<'_>,
        timeframe: Timeframe,
        touched: &[S],
        retention_limit: usize,
    ) -> Result<usize> {
        let table_name = timeframe.table_name();
        let prune_sql = format!(
            "DELETE FROM {table_name}
             WHERE symbol = ?1
               AND timestamp NOT IN (
                   SELECT timestamp FROM {table_name}
                   WHERE symbol = ?1
                   ORDER BY timestamp DESC
                   LIMIT ?2
               )"
        );

        let mut stmt = tx.prepare_cached(&prune_sql)?;
        let mut deleted = 0;
        for symbol in touched {
            deleted += stmt.execute(params![symbol.as_ref(), retention_limit as i64])?;
        }

        Ok(deleted)
    }
}
