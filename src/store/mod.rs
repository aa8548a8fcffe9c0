use std::fs;
use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::ApiError;
use crate::types::{minute_floor_ms, now_rfc3339, Bar, NewsItem, Symbol};

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub candle_count: i64,
    pub first_bucket: Option<i64>,
    pub last_bucket: Option<i64>,
    pub last_updated: Option<String>,
}

/// Embedded store for candles, news and the persisted watchlist.
///
/// SQLite behind an r2d2 pool; WAL so the aggregator's writes don't block the
/// history reads.
pub struct MarketStore {
    pool: DbPool,
}

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS candles (
            symbol TEXT NOT NULL,
            bucket_start INTEGER NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            volume INTEGER NOT NULL,
            trade_count INTEGER,
            vwap REAL,
            updated_at TEXT,
            PRIMARY KEY (symbol, bucket_start)
        );
        CREATE INDEX IF NOT EXISTS idx_candles_symbol_bucket
        ON candles(symbol, bucket_start);

        CREATE TABLE IF NOT EXISTS news (
            id TEXT PRIMARY KEY,
            published_at TEXT NOT NULL,
            headline TEXT NOT NULL,
            summary TEXT,
            source TEXT,
            url TEXT,
            symbols TEXT NOT NULL,
            sentiment_score REAL,
            sentiment_label TEXT,
            inserted_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_news_published_at
        ON news(published_at DESC);

        CREATE TABLE IF NOT EXISTS user_subscriptions (
            user_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            subscribed_at TEXT NOT NULL,
            last_active_at TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (user_id, symbol)
        );
        "#,
    )?;
    Ok(())
}

const UPSERT_CANDLE_SQL: &str = r#"
    INSERT INTO candles (symbol, bucket_start, open, high, low, close, volume, trade_count, vwap, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
    ON CONFLICT(symbol, bucket_start) DO UPDATE SET
        open = excluded.open,
        high = excluded.high,
        low = excluded.low,
        close = excluded.close,
        volume = excluded.volume,
        trade_count = excluded.trade_count,
        vwap = excluded.vwap,
        updated_at = excluded.updated_at
"#;

impl MarketStore {
    pub fn open(path: &Path) -> Result<Self, ApiError> {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let manager = SqliteConnectionManager::file(path);
        Self::build(manager, 8)
    }

    /// In-memory store for tests. Pool size 1 so every handle sees the same
    /// database.
    pub fn open_in_memory() -> Result<Self, ApiError> {
        Self::build(SqliteConnectionManager::memory(), 1)
    }

    fn build(manager: SqliteConnectionManager, max_size: u32) -> Result<Self, ApiError> {
        let manager = manager.with_init(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(30))?;
            let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");
            Ok(())
        });
        let pool = Pool::builder().max_size(max_size).build(manager)?;
        {
            let conn = pool.get()?;
            ensure_schema(&conn)?;
        }
        Ok(Self { pool })
    }

    // ── Candles ──────────────────────────────────────────────────────

    pub fn upsert_candle(&self, symbol: &Symbol, bucket_ms: i64, bar: &Bar) -> Result<(), ApiError> {
        let conn = self.pool.get()?;
        conn.execute(
            UPSERT_CANDLE_SQL,
            params![
                symbol.as_str(),
                minute_floor_ms(bucket_ms),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume as i64,
                bar.trade_count.map(|n| n as i64),
                bar.vwap,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Upsert a slice of bars in one transaction.
    pub fn bulk_upsert_candles(&self, symbol: &Symbol, bars: &[(i64, Bar)]) -> Result<(), ApiError> {
        if bars.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT_CANDLE_SQL)?;
            let updated_at = now_rfc3339();
            for (bucket_ms, bar) in bars {
                stmt.execute(params![
                    symbol.as_str(),
                    minute_floor_ms(*bucket_ms),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume as i64,
                    bar.trade_count.map(|n| n as i64),
                    bar.vwap,
                    updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Chronological bars with `from_ms <= bucket_start <= to_ms`.
    pub fn read_range(&self, symbol: &Symbol, from_ms: i64, to_ms: i64) -> Result<Vec<(i64, Bar)>, ApiError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT bucket_start, open, high, low, close, volume, trade_count, vwap
            FROM candles
            WHERE symbol = ?1 AND bucket_start >= ?2 AND bucket_start <= ?3
            ORDER BY bucket_start ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![symbol.as_str(), from_ms, to_ms], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    Bar {
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get::<_, i64>(5)?.max(0) as u64,
                        trade_count: row.get::<_, Option<i64>>(6)?.map(|n| n.max(0) as u64),
                        vwap: row.get(7)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Per-symbol candle coverage, for the database stats endpoint.
    pub fn symbol_stats(&self) -> Result<Vec<SymbolStats>, ApiError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol,
                   COUNT(*) AS candle_count,
                   MIN(bucket_start) AS first_bucket,
                   MAX(bucket_start) AS last_bucket,
                   MAX(updated_at) AS last_updated
            FROM candles
            GROUP BY symbol
            ORDER BY symbol
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SymbolStats {
                    symbol: row.get(0)?,
                    candle_count: row.get(1)?,
                    first_bucket: row.get(2)?,
                    last_bucket: row.get(3)?,
                    last_updated: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn candle_count(&self, symbol: Option<&Symbol>) -> Result<i64, ApiError> {
        let conn = self.pool.get()?;
        let count = match symbol {
            Some(symbol) => conn.query_row(
                "SELECT COUNT(*) FROM candles WHERE symbol = ?1",
                params![symbol.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM candles", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    // ── News ─────────────────────────────────────────────────────────

    /// Insert a news item; a duplicate id is a no-op, so a re-delivered item
    /// never clobbers an earlier sentiment fill.
    pub fn insert_news(&self, item: &NewsItem) -> Result<(), ApiError> {
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO news (id, published_at, headline, summary, source, url, symbols,
                              sentiment_score, sentiment_label, inserted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                item.id,
                item.published_at.to_rfc3339(),
                item.headline,
                item.summary,
                item.source,
                item.url,
                serde_json::to_string(&item.symbols)?,
                item.sentiment_score,
                item.sentiment_label,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fill sentiment for one item. Re-applying the same values is a no-op.
    pub fn update_news_sentiment(&self, id: &str, score: f64, label: &str) -> Result<(), ApiError> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE news SET sentiment_score = ?2, sentiment_label = ?3 WHERE id = ?1",
            params![id, score, label],
        )?;
        Ok(())
    }

    /// Most recent news, optionally filtered to items mentioning `symbol`.
    pub fn recent_news(&self, symbol: Option<&Symbol>, limit: usize) -> Result<Vec<NewsItem>, ApiError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, published_at, headline, summary, source, url, symbols,
                   sentiment_score, sentiment_label
            FROM news
            ORDER BY published_at DESC
            LIMIT ?1
            "#,
        )?;
        // The symbols column is a small JSON array; filtering happens here
        // rather than in SQL. Over-fetch so a filtered query still fills up.
        let fetch = if symbol.is_some() { limit.saturating_mul(10).max(limit) } else { limit };
        let rows = stmt
            .query_map(params![fetch as i64], |row| {
                let published: String = row.get(1)?;
                let symbols_raw: String = row.get(6)?;
                Ok((
                    NewsItem {
                        id: row.get(0)?,
                        published_at: published
                            .parse()
                            .unwrap_or_else(|_| chrono::Utc::now()),
                        headline: row.get(2)?,
                        summary: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        source: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        url: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        symbols: Vec::new(),
                        sentiment_score: row.get(7)?,
                        sentiment_label: row.get(8)?,
                    },
                    symbols_raw,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::new();
        for (mut item, symbols_raw) in rows {
            item.symbols = serde_json::from_str(&symbols_raw).unwrap_or_default();
            if let Some(sym) = symbol {
                if !item.symbols.iter().any(|s| s == sym.as_str()) {
                    continue;
                }
            }
            out.push(item);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    // ── Watchlist ────────────────────────────────────────────────────

    /// Upsert an active watchlist row. Returns true when the row was created
    /// or reactivated (i.e. the user's interest is newly active).
    pub fn watchlist_upsert(&self, user_id: &str, symbol: &Symbol) -> Result<bool, ApiError> {
        let conn = self.pool.get()?;
        let was_active: Option<bool> = conn
            .query_row(
                "SELECT active FROM user_subscriptions WHERE user_id = ?1 AND symbol = ?2",
                params![user_id, symbol.as_str()],
                |row| row.get::<_, i64>(0).map(|v| v != 0),
            )
            .optional()?;

        let now = now_rfc3339();
        conn.execute(
            r#"
            INSERT INTO user_subscriptions (user_id, symbol, subscribed_at, last_active_at, active)
            VALUES (?1, ?2, ?3, ?3, 1)
            ON CONFLICT(user_id, symbol) DO UPDATE SET
                active = 1,
                last_active_at = excluded.last_active_at
            "#,
            params![user_id, symbol.as_str(), now],
        )?;

        Ok(!was_active.unwrap_or(false))
    }

    /// Soft-delete a watchlist row. Returns true when the row was active.
    pub fn watchlist_deactivate(&self, user_id: &str, symbol: &Symbol) -> Result<bool, ApiError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            r#"
            UPDATE user_subscriptions
            SET active = 0, last_active_at = ?3
            WHERE user_id = ?1 AND symbol = ?2 AND active = 1
            "#,
            params![user_id, symbol.as_str(), now_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    pub fn watchlist_for_user(&self, user_id: &str) -> Result<Vec<Symbol>, ApiError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol FROM user_subscriptions
            WHERE user_id = ?1 AND active = 1
            ORDER BY last_active_at DESC
            "#,
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.iter().filter_map(|s| Symbol::parse(s)).collect())
    }

    /// Every active (user, symbol) pair, for rehydration at process start.
    pub fn active_watchlist(&self) -> Result<Vec<(String, Symbol)>, ApiError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, symbol FROM user_subscriptions WHERE active = 1",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(u, s)| Symbol::parse(&s).map(|sym| (u, sym)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(open: f64, close: f64, volume: u64) -> Bar {
        Bar {
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume,
            trade_count: Some(3),
            vwap: Some((open + close) / 2.0),
        }
    }

    fn sym(s: &str) -> Symbol {
        Symbol::parse(s).unwrap()
    }

    const T0: i64 = 1_697_034_600_000;

    #[test]
    fn upsert_candle_is_idempotent() {
        let store = MarketStore::open_in_memory().unwrap();
        let s = sym("AAPL");
        let b = bar(150.0, 150.5, 15);

        store.upsert_candle(&s, T0, &b).unwrap();
        store.upsert_candle(&s, T0, &b).unwrap();

        let rows = store.read_range(&s, T0 - 1, T0 + 1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, T0);
        assert_eq!(rows[0].1.volume, 15);
    }

    #[test]
    fn upsert_is_last_write_wins_on_the_body() {
        let store = MarketStore::open_in_memory().unwrap();
        let s = sym("AAPL");
        store.upsert_candle(&s, T0, &bar(150.0, 150.5, 15)).unwrap();
        store.upsert_candle(&s, T0, &bar(150.0, 151.0, 42)).unwrap();

        let rows = store.read_range(&s, T0, T0).unwrap();
        assert_eq!(rows[0].1.close, 151.0);
        assert_eq!(rows[0].1.volume, 42);
    }

    #[test]
    fn bulk_upsert_and_range_read_are_chronological() {
        let store = MarketStore::open_in_memory().unwrap();
        let s = sym("MSFT");
        let bars = vec![
            (T0 + 120_000, bar(11.0, 11.5, 3)),
            (T0, bar(10.0, 10.5, 1)),
            (T0 + 60_000, bar(10.5, 11.0, 2)),
        ];
        store.bulk_upsert_candles(&s, &bars).unwrap();

        let rows = store.read_range(&s, T0, T0 + 120_000).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].0 < w[1].0));

        // Range bounds are inclusive; outside rows stay out.
        let mid = store.read_range(&s, T0 + 60_000, T0 + 60_000).unwrap();
        assert_eq!(mid.len(), 1);
    }

    #[test]
    fn symbol_stats_and_counts() {
        let store = MarketStore::open_in_memory().unwrap();
        let aapl = sym("AAPL");
        let msft = sym("MSFT");
        store
            .bulk_upsert_candles(
                &aapl,
                &[(T0, bar(1.0, 1.1, 1)), (T0 + 60_000, bar(1.1, 1.2, 2))],
            )
            .unwrap();
        store.upsert_candle(&msft, T0, &bar(2.0, 2.1, 3)).unwrap();

        let stats = store.symbol_stats().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].symbol, "AAPL");
        assert_eq!(stats[0].candle_count, 2);
        assert_eq!(stats[0].first_bucket, Some(T0));
        assert_eq!(stats[0].last_bucket, Some(T0 + 60_000));

        assert_eq!(store.candle_count(Some(&aapl)).unwrap(), 2);
        assert_eq!(store.candle_count(None).unwrap(), 3);
        assert_eq!(store.candle_count(Some(&sym("TSLA"))).unwrap(), 0);
    }

    #[test]
    fn news_insert_is_idempotent_and_sentiment_fill_survives_redelivery() {
        let store = MarketStore::open_in_memory().unwrap();
        let item = NewsItem {
            id: "n-1".into(),
            symbols: vec!["AAPL".into(), "MSFT".into()],
            headline: "Something happened".into(),
            summary: "".into(),
            source: "wire".into(),
            url: "https://example.test/n-1".into(),
            published_at: Utc::now(),
            sentiment_score: None,
            sentiment_label: None,
        };
        store.insert_news(&item).unwrap();
        store.update_news_sentiment("n-1", 0.8, "positive").unwrap();
        store.update_news_sentiment("n-1", 0.8, "positive").unwrap();
        // Upstream redelivery after the fill must not reset sentiment.
        store.insert_news(&item).unwrap();

        let all = store.recent_news(None, 10).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].sentiment_score, Some(0.8));
        assert_eq!(all[0].sentiment_label.as_deref(), Some("positive"));

        let filtered = store.recent_news(Some(&sym("MSFT")), 10).unwrap();
        assert_eq!(filtered.len(), 1);
        let none = store.recent_news(Some(&sym("TSLA")), 10).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn watchlist_roundtrip_and_soft_delete() {
        let store = MarketStore::open_in_memory().unwrap();
        let s = sym("AAPL");

        assert!(store.watchlist_upsert("u1", &s).unwrap());
        // Re-subscribe while active: not newly active.
        assert!(!store.watchlist_upsert("u1", &s).unwrap());
        assert_eq!(store.watchlist_for_user("u1").unwrap(), vec![s.clone()]);

        assert!(store.watchlist_deactivate("u1", &s).unwrap());
        assert!(!store.watchlist_deactivate("u1", &s).unwrap());
        assert!(store.watchlist_for_user("u1").unwrap().is_empty());

        // Reactivation counts as newly active again.
        assert!(store.watchlist_upsert("u1", &s).unwrap());

        store.watchlist_upsert("u2", &sym("TSLA")).unwrap();
        let active = store.active_watchlist().unwrap();
        assert_eq!(active.len(), 2);
    }
}
