//! SQLite-backed store for sources, listings, blog posts and scrape runs.
//!
//! Every call acquires a pooled connection (or a short transaction) and
//! releases it before returning; nothing is held across fetch or extraction.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mcf_core::{
    BlogPost, Listing, ListingCandidate, ListingFilter, ListingStatus, PostCandidate, RunCounts,
    RunStatus, ScrapeRun, Source,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::{debug, info};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("preparing database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("serializing listing payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt {column} value {value:?}")]
    Corrupt { column: &'static str, value: String },
    #[error("scrape run {0} not found")]
    RunNotFound(i64),
    #[error("scrape run {0} was already finalized")]
    RunAlreadyFinalized(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingUpsert {
    pub id: String,
    pub is_new: bool,
    pub has_price_change: bool,
    pub status: ListingStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostUpsert {
    pub id: String,
    pub is_new: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Register a URL; returns false when it is already known.
    async fn add_source(
        &self,
        url: &str,
        name: Option<&str>,
        category: &str,
    ) -> Result<bool, StoreError>;

    async fn deactivate_source(&self, url: &str) -> Result<bool, StoreError>;

    async fn list_sources(&self) -> Result<Vec<Source>, StoreError>;

    /// Active sources, never-scraped first, then least recently scraped.
    async fn list_active_sources(&self) -> Result<Vec<Source>, StoreError>;

    /// `None` resets health; `Some(error)` bumps the error count.
    async fn record_fetch_outcome(&self, url: &str, error: Option<&str>)
        -> Result<(), StoreError>;

    async fn upsert_listing(
        &self,
        candidate: &ListingCandidate,
    ) -> Result<ListingUpsert, StoreError>;

    async fn upsert_blog_post(&self, candidate: &PostCandidate) -> Result<PostUpsert, StoreError>;

    /// Mark every non-removed listing outside `seen` as removed. Only safe after a full pass.
    async fn mark_unseen_listings_removed(&self, seen: &HashSet<String>)
        -> Result<u64, StoreError>;

    async fn start_run(&self) -> Result<i64, StoreError>;

    async fn complete_run(
        &self,
        run_id: i64,
        counts: &RunCounts,
        status: RunStatus,
    ) -> Result<(), StoreError>;

    /// Finalize runs left `running` by a crashed process as `failed`.
    async fn fail_abandoned_runs(&self) -> Result<u64, StoreError>;

    async fn get_run(&self, run_id: i64) -> Result<Option<ScrapeRun>, StoreError>;

    async fn get_listing(&self, id: &str) -> Result<Option<Listing>, StoreError>;

    async fn list_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>, StoreError>;

    async fn list_blog_posts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<BlogPost>, StoreError>;
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT UNIQUE NOT NULL,
        name TEXT,
        category TEXT NOT NULL DEFAULT 'broker',
        active INTEGER NOT NULL DEFAULT 1,
        last_scraped TEXT,
        error_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS listings (
        id TEXT PRIMARY KEY,
        address TEXT,
        price_raw TEXT,
        price_numeric REAL,
        bedrooms TEXT,
        bathrooms TEXT,
        sqft TEXT,
        acreage TEXT,
        frontage TEXT,
        garage TEXT,
        lake TEXT,
        waterfront INTEGER NOT NULL DEFAULT 0,
        exclusive INTEGER NOT NULL DEFAULT 0,
        source_url TEXT NOT NULL,
        listing_url TEXT,
        description TEXT,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        raw_payload TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blog_posts (
        id TEXT PRIMARY KEY,
        source_url TEXT NOT NULL,
        post_url TEXT NOT NULL,
        title TEXT NOT NULL,
        date TEXT,
        first_seen TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scrape_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        urls_processed INTEGER NOT NULL DEFAULT 0,
        listings_found INTEGER NOT NULL DEFAULT 0,
        new_listings INTEGER NOT NULL DEFAULT 0,
        posts_found INTEGER NOT NULL DEFAULT 0,
        new_posts INTEGER NOT NULL DEFAULT 0,
        errors INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_listings_lake ON listings(lake)",
    "CREATE INDEX IF NOT EXISTS idx_listings_status ON listings(status)",
    "CREATE INDEX IF NOT EXISTS idx_listings_first_seen ON listings(first_seen)",
    "CREATE INDEX IF NOT EXISTS idx_blog_posts_first_seen ON blog_posts(first_seen)",
];

const SOURCE_COLUMNS: &str =
    "id, url, name, category, active, last_scraped, error_count, last_error";

const LISTING_COLUMNS: &str = "id, address, price_raw, price_numeric, bedrooms, bathrooms, sqft, \
    acreage, frontage, garage, lake, waterfront, exclusive, source_url, listing_url, description, \
    first_seen, last_seen, status, raw_payload";

const RUN_COLUMNS: &str = "id, started_at, completed_at, urls_processed, listings_found, \
    new_listings, posts_found, new_posts, errors, status";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    clock: Clock,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `database_url`, e.g. `sqlite://data/listings.db`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && parent != Path::new(":memory:") {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Ephemeral store pinned to a single connection so the database outlives each call.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let clock: Clock = Arc::new(Utc::now);
        let store = Self { pool, clock };
        store.migrate().await?;
        Ok(store)
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("schema ready");
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(value: &str, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            column,
            value: value.to_string(),
        })
}

fn decode_opt_ts(
    value: Option<String>,
    column: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(|v| decode_ts(v, column)).transpose()
}

fn decode_count(row: &SqliteRow, column: &'static str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        column,
        value: value.to_string(),
    })
}

fn source_from_row(row: &SqliteRow) -> Result<Source, StoreError> {
    let error_count: i64 = row.try_get("error_count")?;
    Ok(Source {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        active: row.try_get("active")?,
        last_scraped: decode_opt_ts(row.try_get("last_scraped")?, "last_scraped")?,
        error_count: u32::try_from(error_count).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
    })
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing, StoreError> {
    let status: String = row.try_get("status")?;
    let raw_payload: String = row.try_get("raw_payload")?;
    Ok(Listing {
        id: row.try_get("id")?,
        address: row.try_get("address")?,
        price_raw: row.try_get("price_raw")?,
        price_numeric: row.try_get("price_numeric")?,
        bedrooms: row.try_get("bedrooms")?,
        bathrooms: row.try_get("bathrooms")?,
        sqft: row.try_get("sqft")?,
        acreage: row.try_get("acreage")?,
        frontage: row.try_get("frontage")?,
        garage: row.try_get("garage")?,
        lake: row.try_get("lake")?,
        waterfront: row.try_get("waterfront")?,
        exclusive: row.try_get("exclusive")?,
        source_url: row.try_get("source_url")?,
        listing_url: row.try_get("listing_url")?,
        description: row.try_get("description")?,
        first_seen: decode_ts(&row.try_get::<String, _>("first_seen")?, "first_seen")?,
        last_seen: decode_ts(&row.try_get::<String, _>("last_seen")?, "last_seen")?,
        status: status.parse().map_err(|_| StoreError::Corrupt {
            column: "status",
            value: status.clone(),
        })?,
        raw_payload: serde_json::from_str(&raw_payload)?,
    })
}

fn post_from_row(row: &SqliteRow) -> Result<BlogPost, StoreError> {
    Ok(BlogPost {
        id: row.try_get("id")?,
        source_url: row.try_get("source_url")?,
        post_url: row.try_get("post_url")?,
        title: row.try_get("title")?,
        date: row.try_get("date")?,
        first_seen: decode_ts(&row.try_get::<String, _>("first_seen")?, "first_seen")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<ScrapeRun, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ScrapeRun {
        id: row.try_get("id")?,
        started_at: decode_ts(&row.try_get::<String, _>("started_at")?, "started_at")?,
        completed_at: decode_opt_ts(row.try_get("completed_at")?, "completed_at")?,
        counts: RunCounts {
            urls_processed: decode_count(row, "urls_processed")?,
            listings_found: decode_count(row, "listings_found")?,
            new_listings: decode_count(row, "new_listings")?,
            posts_found: decode_count(row, "posts_found")?,
            new_posts: decode_count(row, "new_posts")?,
            errors: decode_count(row, "errors")?,
        },
        status: status.parse().map_err(|_| StoreError::Corrupt {
            column: "status",
            value: status.clone(),
        })?,
    })
}

fn count_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl Store for SqliteStore {
    async fn add_source(
        &self,
        url: &str,
        name: Option<&str>,
        category: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO sources (url, name, category, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(url.trim())
        .bind(name)
        .bind(category)
        .bind(encode_ts(self.now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_source(&self, url: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE sources SET active = 0 WHERE url = ? AND active = 1")
            .bind(url.trim())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn list_active_sources(&self) -> Result<Vec<Source>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SOURCE_COLUMNS}
              FROM sources
             WHERE active = 1
             ORDER BY last_scraped IS NOT NULL, last_scraped ASC, id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn record_fetch_outcome(
        &self,
        url: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = encode_ts(self.now());
        let result = match error {
            Some(error) => {
                sqlx::query(
                    r#"
                    UPDATE sources
                       SET last_scraped = ?,
                           error_count = error_count + 1,
                           last_error = ?
                     WHERE url = ?
                    "#,
                )
                .bind(&now)
                .bind(error)
                .bind(url)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE sources
                       SET last_scraped = ?,
                           error_count = 0,
                           last_error = NULL
                     WHERE url = ?
                    "#,
                )
                .bind(&now)
                .bind(url)
                .execute(&self.pool)
                .await?
            }
        };
        if result.rows_affected() == 0 {
            debug!(url, "fetch outcome for unregistered source ignored");
        }
        Ok(())
    }

    async fn upsert_listing(
        &self,
        candidate: &ListingCandidate,
    ) -> Result<ListingUpsert, StoreError> {
        let id = candidate.id();
        let price_numeric = candidate.price_numeric();
        let payload = serde_json::to_string(&candidate.payload())?;
        let now = encode_ts(self.now());

        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT price_numeric FROM listings WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO listings (
                        id, address, price_raw, price_numeric, bedrooms, bathrooms,
                        sqft, acreage, frontage, garage, lake, waterfront, exclusive,
                        source_url, listing_url, description, first_seen, last_seen,
                        status, raw_payload
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(&candidate.address)
                .bind(&candidate.price_raw)
                .bind(price_numeric)
                .bind(&candidate.bedrooms)
                .bind(&candidate.bathrooms)
                .bind(&candidate.sqft)
                .bind(&candidate.acreage)
                .bind(&candidate.frontage)
                .bind(&candidate.garage)
                .bind(&candidate.lake)
                .bind(candidate.waterfront)
                .bind(candidate.exclusive)
                .bind(&candidate.source_url)
                .bind(&candidate.listing_url)
                .bind(&candidate.description)
                .bind(&now)
                .bind(&now)
                .bind(ListingStatus::Active.as_str())
                .bind(&payload)
                .execute(&mut *tx)
                .await?;
                ListingUpsert {
                    id,
                    is_new: true,
                    has_price_change: false,
                    status: ListingStatus::Active,
                }
            }
            Some(row) => {
                let old_price: Option<f64> = row.try_get("price_numeric")?;
                let has_price_change =
                    matches!((old_price, price_numeric), (Some(old), Some(new)) if old != new);
                let status = if has_price_change {
                    ListingStatus::PriceChange
                } else {
                    ListingStatus::Active
                };
                sqlx::query(
                    r#"
                    UPDATE listings
                       SET price_raw = ?, price_numeric = ?, bedrooms = ?, bathrooms = ?,
                           sqft = ?, acreage = ?, frontage = ?, garage = ?,
                           lake = ?, waterfront = ?, exclusive = ?,
                           listing_url = ?, description = ?, last_seen = ?, status = ?,
                           raw_payload = ?
                     WHERE id = ?
                    "#,
                )
                .bind(&candidate.price_raw)
                .bind(price_numeric)
                .bind(&candidate.bedrooms)
                .bind(&candidate.bathrooms)
                .bind(&candidate.sqft)
                .bind(&candidate.acreage)
                .bind(&candidate.frontage)
                .bind(&candidate.garage)
                .bind(&candidate.lake)
                .bind(candidate.waterfront)
                .bind(candidate.exclusive)
                .bind(&candidate.listing_url)
                .bind(&candidate.description)
                .bind(&now)
                .bind(status.as_str())
                .bind(&payload)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                ListingUpsert {
                    id,
                    is_new: false,
                    has_price_change,
                    status,
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn upsert_blog_post(&self, candidate: &PostCandidate) -> Result<PostUpsert, StoreError> {
        let id = candidate.id();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO blog_posts (id, source_url, post_url, title, date, first_seen)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&candidate.source_url)
        .bind(&candidate.post_url)
        .bind(candidate.title_or_placeholder())
        .bind(&candidate.date)
        .bind(encode_ts(self.now()))
        .execute(&self.pool)
        .await?;
        Ok(PostUpsert {
            id,
            is_new: result.rows_affected() > 0,
        })
    }

    async fn mark_unseen_listings_removed(
        &self,
        seen: &HashSet<String>,
    ) -> Result<u64, StoreError> {
        if seen.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT id FROM listings WHERE status != ?")
            .bind(ListingStatus::Removed.as_str())
            .fetch_all(&mut *tx)
            .await?;
        let mut removed = 0u64;
        for row in rows {
            let id: String = row.try_get("id")?;
            if seen.contains(&id) {
                continue;
            }
            removed += sqlx::query("UPDATE listings SET status = ? WHERE id = ?")
                .bind(ListingStatus::Removed.as_str())
                .bind(&id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        info!(removed, "marked unseen listings removed");
        Ok(removed)
    }

    async fn start_run(&self) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO scrape_runs (started_at, status) VALUES (?, ?)")
            .bind(encode_ts(self.now()))
            .bind(RunStatus::Running.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn complete_run(
        &self,
        run_id: i64,
        counts: &RunCounts,
        status: RunStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_runs
               SET completed_at = ?, urls_processed = ?, listings_found = ?,
                   new_listings = ?, posts_found = ?, new_posts = ?, errors = ?, status = ?
             WHERE id = ?
               AND completed_at IS NULL
            "#,
        )
        .bind(encode_ts(self.now()))
        .bind(count_to_i64(counts.urls_processed))
        .bind(count_to_i64(counts.listings_found))
        .bind(count_to_i64(counts.new_listings))
        .bind(count_to_i64(counts.posts_found))
        .bind(count_to_i64(counts.new_posts))
        .bind(count_to_i64(counts.errors))
        .bind(status.as_str())
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_run(run_id).await? {
            Some(_) => Err(StoreError::RunAlreadyFinalized(run_id)),
            None => Err(StoreError::RunNotFound(run_id)),
        }
    }

    async fn fail_abandoned_runs(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_runs
               SET status = ?, completed_at = ?
             WHERE status = ?
               AND completed_at IS NULL
            "#,
        )
        .bind(RunStatus::Failed.as_str())
        .bind(encode_ts(self.now()))
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<ScrapeRun>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM scrape_runs WHERE id = ?"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_listing(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn list_listings(&self, filter: &ListingFilter) -> Result<Vec<Listing>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE 1 = 1"
        ));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(lake) = &filter.lake {
            qb.push(" AND lower(lake) LIKE ")
                .push_bind(format!("%{}%", lake.to_lowercase()));
        }
        if let Some(since) = filter.since {
            qb.push(" AND first_seen >= ").push_bind(encode_ts(since));
        }
        qb.push(" ORDER BY first_seen DESC, id ASC");

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn list_blog_posts_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<BlogPost>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_url, post_url, title, date, first_seen
              FROM blog_posts
             WHERE first_seen >= ?
             ORDER BY first_seen DESC, id ASC
            "#,
        )
        .bind(encode_ts(since))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(post_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicI64, Ordering};
    use tempfile::tempdir;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().expect("ts")
    }

    /// Each read advances one minute so successive writes get distinct timestamps.
    fn ticking_clock() -> Clock {
        let tick = Arc::new(AtomicI64::new(0));
        Arc::new(move || base_time() + Duration::minutes(tick.fetch_add(1, Ordering::SeqCst)))
    }

    async fn store() -> SqliteStore {
        SqliteStore::in_memory()
            .await
            .expect("in-memory store")
            .with_clock(ticking_clock())
    }

    fn candidate(address: Option<&str>, price: Option<&str>, source_url: &str) -> ListingCandidate {
        ListingCandidate {
            address: address.map(str::to_string),
            price_raw: price.map(str::to_string),
            lake: Some("Lake Rosseau".to_string()),
            waterfront: true,
            source_url: source_url.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn identical_upsert_is_idempotent() {
        let store = store().await;
        let c = candidate(Some("12 Island Rd"), Some("$1,200,000"), "https://a.example");

        let first = store.upsert_listing(&c).await.unwrap();
        let before = store.get_listing(&first.id).await.unwrap().unwrap();
        let second = store.upsert_listing(&c).await.unwrap();
        let after = store.get_listing(&first.id).await.unwrap().unwrap();

        assert!(first.is_new);
        assert!(!second.is_new);
        assert!(!second.has_price_change);
        assert_eq!(second.status, ListingStatus::Active);
        assert_eq!(after.first_seen, before.first_seen);
        assert!(after.last_seen > before.last_seen);
        assert_eq!(after.price_numeric, Some(1_200_000.0));
    }

    #[tokio::test]
    async fn price_change_is_detected_then_settles() {
        let store = store().await;
        let addr = Some("88 Windermere Rd");

        let a = store
            .upsert_listing(&candidate(addr, Some("500000"), "https://a.example"))
            .await
            .unwrap();
        let b = store
            .upsert_listing(&candidate(addr, Some("525000"), "https://a.example"))
            .await
            .unwrap();
        let c = store
            .upsert_listing(&candidate(addr, Some("525000"), "https://a.example"))
            .await
            .unwrap();

        assert_eq!(a.status, ListingStatus::Active);
        assert!(b.has_price_change);
        assert_eq!(b.status, ListingStatus::PriceChange);
        assert!(!c.has_price_change);
        assert_eq!(c.status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn first_price_disclosure_is_not_a_change() {
        let store = store().await;
        let addr = Some("3 Bay Lane");
        store
            .upsert_listing(&candidate(addr, None, "https://a.example"))
            .await
            .unwrap();
        let disclosed = store
            .upsert_listing(&candidate(addr, Some("$899,000"), "https://a.example"))
            .await
            .unwrap();
        assert!(!disclosed.has_price_change);
        assert_eq!(disclosed.status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn same_address_from_two_sources_collapses() {
        let store = store().await;
        let first = store
            .upsert_listing(&candidate(Some("123 Main St."), Some("$700,000"), "https://a.example"))
            .await
            .unwrap();
        let second = store
            .upsert_listing(&candidate(Some("123 MAIN ST"), Some("$700,000"), "https://b.example"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(!second.is_new);
        let all = store.list_listings(&ListingFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].source_url, "https://a.example");
        assert_eq!(all[0].address.as_deref(), Some("123 Main St."));
    }

    #[tokio::test]
    async fn addressless_listings_are_keyed_by_source() {
        let store = store().await;
        let a = store
            .upsert_listing(&candidate(None, Some("$1"), "https://a.example"))
            .await
            .unwrap();
        let b = store
            .upsert_listing(&candidate(None, Some("$1"), "https://b.example"))
            .await
            .unwrap();
        let a_again = store
            .upsert_listing(&candidate(Some(""), Some("$1"), "https://a.example"))
            .await
            .unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.id, a_again.id);
        assert!(!a_again.is_new);
    }

    #[tokio::test]
    async fn repeated_blog_post_is_a_noop() {
        let store = store().await;
        let post = PostCandidate {
            title: Some("Spring market update".to_string()),
            post_url: "https://a.example/blog/spring".to_string(),
            date: None,
            source_url: "https://a.example".to_string(),
        };
        let first = store.upsert_blog_post(&post).await.unwrap();
        let renamed = PostCandidate {
            title: Some("Renamed".to_string()),
            ..post.clone()
        };
        let second = store.upsert_blog_post(&renamed).await.unwrap();

        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.id, second.id);
        let posts = store.list_blog_posts_since(base_time()).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "Spring market update");
    }

    #[tokio::test]
    async fn active_sources_come_back_oldest_scraped_first() {
        let store = store().await;
        for url in ["https://a.example", "https://b.example", "https://c.example"] {
            assert!(store.add_source(url, None, "broker").await.unwrap());
        }
        assert!(!store.add_source("https://a.example", None, "broker").await.unwrap());

        store.record_fetch_outcome("https://a.example", None).await.unwrap();
        store.record_fetch_outcome("https://b.example", None).await.unwrap();
        store.deactivate_source("https://c.example").await.unwrap();
        store.add_source("https://d.example", Some("New"), "blog").await.unwrap();

        let order: Vec<String> = store
            .list_active_sources()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.url)
            .collect();
        assert_eq!(
            order,
            vec!["https://d.example", "https://a.example", "https://b.example"]
        );
        assert_eq!(store.list_sources().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn fetch_outcomes_update_source_health() {
        let store = store().await;
        let url = "https://flaky.example";
        store.add_source(url, None, "broker").await.unwrap();

        store.record_fetch_outcome(url, Some("timeout")).await.unwrap();
        store.record_fetch_outcome(url, Some("http 500")).await.unwrap();
        let failing = store.list_sources().await.unwrap().remove(0);
        assert_eq!(failing.error_count, 2);
        assert_eq!(failing.last_error.as_deref(), Some("http 500"));
        assert!(failing.last_scraped.is_some());

        store.record_fetch_outcome(url, None).await.unwrap();
        let healthy = store.list_sources().await.unwrap().remove(0);
        assert_eq!(healthy.error_count, 0);
        assert_eq!(healthy.last_error, None);
        assert!(healthy.last_scraped > failing.last_scraped);
    }

    #[tokio::test]
    async fn run_is_finalized_exactly_once() {
        let store = store().await;
        let run_id = store.start_run().await.unwrap();
        let started = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(started.status, RunStatus::Running);
        assert!(started.completed_at.is_none());

        let counts = RunCounts {
            urls_processed: 4,
            listings_found: 7,
            new_listings: 2,
            posts_found: 3,
            new_posts: 1,
            errors: 1,
        };
        store
            .complete_run(run_id, &counts, RunStatus::Completed)
            .await
            .unwrap();
        let done = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.counts, counts);
        assert!(done.completed_at.is_some());

        let again = store
            .complete_run(run_id, &RunCounts::default(), RunStatus::Failed)
            .await;
        assert!(matches!(again, Err(StoreError::RunAlreadyFinalized(id)) if id == run_id));
        let missing = store
            .complete_run(run_id + 100, &counts, RunStatus::Completed)
            .await;
        assert!(matches!(missing, Err(StoreError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn abandoned_runs_are_swept_to_failed() {
        let store = store().await;
        let crashed = store.start_run().await.unwrap();
        let finished = store.start_run().await.unwrap();
        store
            .complete_run(finished, &RunCounts::default(), RunStatus::Completed)
            .await
            .unwrap();

        assert_eq!(store.fail_abandoned_runs().await.unwrap(), 1);
        let swept = store.get_run(crashed).await.unwrap().unwrap();
        assert_eq!(swept.status, RunStatus::Failed);
        assert!(swept.completed_at.is_some());
        assert_eq!(
            store.get_run(finished).await.unwrap().unwrap().status,
            RunStatus::Completed
        );
        assert_eq!(store.fail_abandoned_runs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unseen_listings_are_marked_removed() {
        let store = store().await;
        let kept = store
            .upsert_listing(&candidate(Some("1 Kept Rd"), None, "https://a.example"))
            .await
            .unwrap();
        let gone = store
            .upsert_listing(&candidate(Some("2 Gone Rd"), None, "https://a.example"))
            .await
            .unwrap();

        assert_eq!(
            store.mark_unseen_listings_removed(&HashSet::new()).await.unwrap(),
            0
        );
        let seen = HashSet::from([kept.id.clone()]);
        assert_eq!(store.mark_unseen_listings_removed(&seen).await.unwrap(), 1);

        let removed = store
            .list_listings(&ListingFilter {
                status: Some(ListingStatus::Removed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, gone.id);
    }

    #[tokio::test]
    async fn listing_filters_narrow_results() {
        let store = store().await;
        let mut joseph = candidate(Some("5 Joe Lane"), None, "https://a.example");
        joseph.lake = Some("Lake Joseph".to_string());
        store.upsert_listing(&joseph).await.unwrap();
        store
            .upsert_listing(&candidate(Some("6 Ross Way"), None, "https://a.example"))
            .await
            .unwrap();

        let by_lake = store
            .list_listings(&ListingFilter {
                lake: Some("joseph".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_lake.len(), 1);
        assert_eq!(by_lake[0].address.as_deref(), Some("5 Joe Lane"));

        let newest = store
            .list_listings(&ListingFilter {
                since: Some(base_time() + Duration::minutes(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].address.as_deref(), Some("6 Ross Way"));

        let all = store.list_listings(&ListingFilter::default()).await.unwrap();
        assert_eq!(all[0].address.as_deref(), Some("6 Ross Way"));
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_connections() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("data/listings.db").display());

        let store = SqliteStore::connect(&url).await.expect("connect");
        store
            .add_source("https://a.example", Some("Broker A"), "broker")
            .await
            .unwrap();
        store.pool().close().await;

        let reopened = SqliteStore::connect(&url).await.expect("reconnect");
        let sources = reopened.list_active_sources().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].name.as_deref(), Some("Broker A"));
    }
}
