use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, warn};

use crate::parser::extract::{extract_records, CutoffFields, CutoffRecord};
use crate::parser::normalize::{ActionType, Country, VisaCategory};
use crate::parser::tables::Table;

const BUSY_TIMEOUT: Duration = Duration::from_secs(20);

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS bulletin (
            id               INTEGER PRIMARY KEY,
            publication_date TEXT UNIQUE NOT NULL,
            url              TEXT,
            fetched_at       TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS visa_cutoff_date (
            id             INTEGER PRIMARY KEY,
            bulletin_id    INTEGER NOT NULL REFERENCES bulletin(id),
            visa_category  TEXT NOT NULL CHECK(visa_category IN ('family_sponsored','employment_based')),
            visa_class     TEXT NOT NULL,
            action_type    TEXT NOT NULL CHECK(action_type IN ('final_action','filing')),
            country        TEXT NOT NULL,
            cutoff_value   TEXT NOT NULL,
            cutoff_date    TEXT,
            is_current     BOOLEAN NOT NULL DEFAULT 0,
            is_unavailable BOOLEAN NOT NULL DEFAULT 0,
            UNIQUE(bulletin_id, visa_category, visa_class, action_type, country)
        );
        CREATE INDEX IF NOT EXISTS idx_cutoff_series
            ON visa_cutoff_date(visa_category, country, action_type, visa_class);
        CREATE INDEX IF NOT EXISTS idx_cutoff_bulletin ON visa_cutoff_date(bulletin_id);
        ",
    )?;
    Ok(())
}

// ── Contention retry ──

/// Backoff for writes that hit a busy or locked database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt)
    }
}

/// True if anything in the error chain is SQLite reporting BUSY or LOCKED.
pub fn is_contention(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    })
}

/// Run `op`, retrying only on contention. Other errors and the last
/// contention error are returned as-is.
pub fn with_retry<T>(policy: &RetryPolicy, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if is_contention(&e) && attempt + 1 < policy.max_attempts => {
                let backoff = policy.delay(attempt);
                warn!(
                    "Database locked (attempt {}/{}), retrying in {:.1}s",
                    attempt + 1,
                    policy.max_attempts,
                    backoff.as_secs_f64()
                );
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Bulletins ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bulletin {
    pub id: i64,
    pub publication_date: NaiveDate,
    pub url: Option<String>,
    pub fetched_at: String,
}

impl Bulletin {
    /// Stored source URL, or the publisher's canonical page for the month.
    pub fn bulletin_url(&self) -> String {
        match &self.url {
            Some(u) if !u.is_empty() => u.clone(),
            _ => canonical_bulletin_url(self.publication_date),
        }
    }
}

/// Bulletins for October to December belong to the next fiscal year.
pub fn canonical_bulletin_url(publication_date: NaiveDate) -> String {
    let year = publication_date.year();
    let fiscal_year = if publication_date.month() >= 10 { year + 1 } else { year };
    format!(
        "https://travel.state.gov/content/travel/en/legal/visa-law0/visa-bulletin/{}/visa-bulletin-for-{}-{}.html",
        fiscal_year,
        publication_date.format("%B").to_string().to_lowercase(),
        year
    )
}

fn bulletin_from_row(row: &rusqlite::Row) -> rusqlite::Result<Bulletin> {
    Ok(Bulletin {
        id: row.get(0)?,
        publication_date: row.get(1)?,
        url: row.get(2)?,
        fetched_at: row.get(3)?,
    })
}

pub fn find_bulletin(conn: &Connection, publication_date: NaiveDate) -> Result<Option<Bulletin>> {
    let b = conn
        .query_row(
            "SELECT id, publication_date, url, fetched_at FROM bulletin WHERE publication_date = ?1",
            [publication_date],
            bulletin_from_row,
        )
        .optional()?;
    Ok(b)
}

/// Returns the bulletin for the month, creating it if needed. A missing URL
/// on an existing row is filled in when one is supplied.
pub fn get_or_create_bulletin(
    conn: &Connection,
    publication_date: NaiveDate,
    url: Option<&str>,
) -> Result<Bulletin> {
    let created = conn.execute(
        "INSERT OR IGNORE INTO bulletin (publication_date, url) VALUES (?1, ?2)",
        rusqlite::params![publication_date, url],
    )?;
    if created == 0 {
        if let Some(u) = url.filter(|u| !u.is_empty()) {
            let filled = conn.execute(
                "UPDATE bulletin SET url = ?2
                 WHERE publication_date = ?1 AND (url IS NULL OR url = '')",
                rusqlite::params![publication_date, u],
            )?;
            if filled > 0 {
                debug!("Backfilled URL for bulletin {}", publication_date);
            }
        }
    }
    find_bulletin(conn, publication_date)?
        .with_context(|| format!("Bulletin {} missing after insert", publication_date))
}

pub fn fetch_publication_dates(conn: &Connection) -> Result<Vec<NaiveDate>> {
    let mut stmt = conn.prepare("SELECT publication_date FROM bulletin ORDER BY publication_date")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Cutoff records ──

/// Natural key of a stored cutoff.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CutoffKey {
    pub bulletin_id: i64,
    pub visa_category: VisaCategory,
    pub visa_class: String,
    pub action_type: ActionType,
    pub country: Country,
}

impl CutoffKey {
    pub fn for_record(bulletin_id: i64, record: &CutoffRecord) -> Self {
        CutoffKey {
            bulletin_id,
            visa_category: record.visa_category,
            visa_class: record.visa_class.clone(),
            action_type: record.action_type,
            country: record.country,
        }
    }
}

/// Insert or overwrite the non-key fields; the key's row count never grows
/// on repeat calls.
pub fn upsert_cutoff_record(conn: &Connection, key: &CutoffKey, fields: &CutoffFields) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO visa_cutoff_date
         (bulletin_id, visa_category, visa_class, action_type, country,
          cutoff_value, cutoff_date, is_current, is_unavailable)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(bulletin_id, visa_category, visa_class, action_type, country) DO UPDATE SET
             cutoff_value   = excluded.cutoff_value,
             cutoff_date    = excluded.cutoff_date,
             is_current     = excluded.is_current,
             is_unavailable = excluded.is_unavailable",
    )?;
    stmt.execute(rusqlite::params![
        key.bulletin_id,
        key.visa_category.code(),
        key.visa_class,
        key.action_type.code(),
        key.country.code(),
        fields.cutoff_value,
        fields.cutoff_date,
        fields.is_current,
        fields.is_unavailable,
    ])?;
    Ok(())
}

/// What `save_bulletin` wrote.
#[derive(Debug, Clone)]
pub struct BulletinHandle {
    pub bulletin: Bulletin,
    pub tables: usize,
    pub records: usize,
}

/// Persist one bulletin and all records extracted from its tables in a
/// single transaction. Safe to repeat; contention is retried per `policy`.
pub fn save_bulletin(
    conn: &Connection,
    publication_date: NaiveDate,
    url: Option<&str>,
    tables: &[Table],
    policy: &RetryPolicy,
) -> Result<BulletinHandle> {
    let records: Vec<CutoffRecord> = tables
        .iter()
        .flat_map(|t| extract_records(t, publication_date))
        .collect();

    with_retry(policy, || {
        let tx = conn.unchecked_transaction()?;
        let bulletin = get_or_create_bulletin(&tx, publication_date, url)?;
        for r in &records {
            upsert_cutoff_record(&tx, &CutoffKey::for_record(bulletin.id, r), &r.fields)?;
        }
        tx.commit()?;
        Ok(BulletinHandle {
            bulletin,
            tables: tables.len(),
            records: records.len(),
        })
    })
    .with_context(|| format!("Failed to save bulletin {}", publication_date))
}

/// A bulletin waiting to be stored: its tables, or why they could not be
/// produced (fetch or read failure).
pub struct PendingBulletin {
    pub publication_date: NaiveDate,
    pub url: Option<String>,
    pub tables: Result<Vec<Table>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub saved: usize,
    pub records: usize,
    pub failed: Vec<NaiveDate>,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.saved += other.saved;
        self.records += other.records;
        self.failed.extend(other.failed);
    }
}

/// Save each bulletin in turn. A failure is logged and counted, and the
/// remaining bulletins are still saved. `on_done` runs after every item.
pub fn save_batch(
    conn: &Connection,
    items: impl IntoIterator<Item = PendingBulletin>,
    policy: &RetryPolicy,
    mut on_done: impl FnMut(NaiveDate),
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for item in items {
        let date = item.publication_date;
        let saved = item
            .tables
            .and_then(|tables| save_bulletin(conn, date, item.url.as_deref(), &tables, policy));
        match saved {
            Ok(h) => {
                info!("Saved {}: {} records from {} tables", date, h.records, h.tables);
                outcome.saved += 1;
                outcome.records += h.records;
            }
            Err(e) => {
                warn!("Failed {}: {:#}", date, e);
                outcome.failed.push(date);
            }
        }
        on_done(date);
    }
    outcome
}

// ── Reads ──

/// One stored cutoff joined with its bulletin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRow {
    pub visa_class: String,
    pub publication_date: NaiveDate,
    pub url: Option<String>,
    pub cutoff_date: Option<NaiveDate>,
    pub is_current: bool,
    pub is_unavailable: bool,
}

/// All cutoffs for one category/country/action type, oldest bulletin first.
pub fn fetch_series_rows(
    conn: &Connection,
    category: VisaCategory,
    country: Country,
    action_type: ActionType,
) -> Result<Vec<SeriesRow>> {
    let mut stmt = conn.prepare(
        "SELECT c.visa_class, b.publication_date, b.url,
                c.cutoff_date, c.is_current, c.is_unavailable
         FROM visa_cutoff_date c
         JOIN bulletin b ON b.id = c.bulletin_id
         WHERE c.visa_category = ?1 AND c.country = ?2 AND c.action_type = ?3
         ORDER BY b.publication_date, c.visa_class",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![category.code(), country.code(), action_type.code()],
            |row| {
                Ok(SeriesRow {
                    visa_class: row.get(0)?,
                    publication_date: row.get(1)?,
                    url: row.get(2)?,
                    cutoff_date: row.get(3)?,
                    is_current: row.get(4)?,
                    is_unavailable: row.get(5)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn fetch_distinct_classes(conn: &Connection, category: VisaCategory) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT visa_class FROM visa_cutoff_date
         WHERE visa_category = ?1 ORDER BY visa_class",
    )?;
    let rows = stmt
        .query_map([category.code()], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub bulletins: usize,
    pub records: usize,
    pub current: usize,
    pub unavailable: usize,
    pub missing_url: usize,
    pub first: Option<NaiveDate>,
    pub last: Option<NaiveDate>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let bulletins: usize = conn.query_row("SELECT COUNT(*) FROM bulletin", [], |r| r.get(0))?;
    let records: usize =
        conn.query_row("SELECT COUNT(*) FROM visa_cutoff_date", [], |r| r.get(0))?;
    let current: usize = conn.query_row(
        "SELECT COUNT(*) FROM visa_cutoff_date WHERE is_current = 1",
        [],
        |r| r.get(0),
    )?;
    let unavailable: usize = conn.query_row(
        "SELECT COUNT(*) FROM visa_cutoff_date WHERE is_unavailable = 1",
        [],
        |r| r.get(0),
    )?;
    let missing_url: usize = conn.query_row(
        "SELECT COUNT(*) FROM bulletin WHERE url IS NULL OR url = ''",
        [],
        |r| r.get(0),
    )?;
    let (first, last): (Option<NaiveDate>, Option<NaiveDate>) = conn.query_row(
        "SELECT MIN(publication_date), MAX(publication_date) FROM bulletin",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(Stats {
        bulletins,
        records,
        current,
        unavailable,
        missing_url,
        first,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::extract_tables;
    use crate::parser::tables::Cell;
    use std::cell::Cell as Counter;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        configure(&conn).unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn no_wait(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    fn sqlite_error(code: i32) -> anyhow::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None).into()
    }

    fn count(conn: &Connection) -> usize {
        conn.query_row("SELECT COUNT(*) FROM visa_cutoff_date", [], |r| r.get(0))
            .unwrap()
    }

    fn dump(conn: &Connection) -> Vec<(String, String, String, String, Option<String>, bool, bool)> {
        let mut stmt = conn
            .prepare(
                "SELECT visa_class, action_type, country, cutoff_value, cutoff_date,
                        is_current, is_unavailable
                 FROM visa_cutoff_date ORDER BY id",
            )
            .unwrap();
        stmt.query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?))
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = memory_db();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn bulletin_get_or_create() {
        let conn = memory_db();
        let a = get_or_create_bulletin(&conn, date(2024, 3, 1), None).unwrap();
        let b = get_or_create_bulletin(&conn, date(2024, 3, 1), None).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.url, None);
        assert_eq!(fetch_publication_dates(&conn).unwrap(), vec![date(2024, 3, 1)]);
    }

    #[test]
    fn bulletin_url_backfill() {
        let conn = memory_db();
        get_or_create_bulletin(&conn, date(2024, 3, 1), None).unwrap();
        let b = get_or_create_bulletin(&conn, date(2024, 3, 1), Some("https://example.test/march")).unwrap();
        assert_eq!(b.url.as_deref(), Some("https://example.test/march"));

        // an existing URL is not overwritten
        let b = get_or_create_bulletin(&conn, date(2024, 3, 1), Some("https://example.test/other")).unwrap();
        assert_eq!(b.url.as_deref(), Some("https://example.test/march"));
    }

    #[test]
    fn canonical_url_uses_fiscal_year() {
        assert_eq!(
            canonical_bulletin_url(date(2023, 11, 1)),
            "https://travel.state.gov/content/travel/en/legal/visa-law0/visa-bulletin/2024/visa-bulletin-for-november-2023.html"
        );
        assert_eq!(
            canonical_bulletin_url(date(2024, 3, 1)),
            "https://travel.state.gov/content/travel/en/legal/visa-law0/visa-bulletin/2024/visa-bulletin-for-march-2024.html"
        );
        let b = Bulletin {
            id: 1,
            publication_date: date(2024, 3, 1),
            url: Some("https://example.test/x".into()),
            fetched_at: String::new(),
        };
        assert_eq!(b.bulletin_url(), "https://example.test/x");
    }

    #[test]
    fn upsert_overwrites_fields() {
        let conn = memory_db();
        let bulletin = get_or_create_bulletin(&conn, date(2024, 3, 1), None).unwrap();
        let key = CutoffKey {
            bulletin_id: bulletin.id,
            visa_category: VisaCategory::FamilySponsored,
            visa_class: "F1".into(),
            action_type: ActionType::FinalAction,
            country: Country::India,
        };
        let first = CutoffFields::from_cell(&Cell::Date(date(2016, 11, 8)), bulletin.publication_date);
        let second = CutoffFields::from_cell(&Cell::Text("C".into()), bulletin.publication_date);

        upsert_cutoff_record(&conn, &key, &first).unwrap();
        upsert_cutoff_record(&conn, &key, &first).unwrap();
        assert_eq!(count(&conn), 1);

        upsert_cutoff_record(&conn, &key, &second).unwrap();
        assert_eq!(count(&conn), 1);
        let rows = dump(&conn);
        assert_eq!(rows[0].3, "C");
        assert_eq!(rows[0].4.as_deref(), Some("2024-03-01"));
        assert!(rows[0].5);
    }

    #[test]
    fn saving_same_bulletin_twice_is_idempotent() {
        let conn = memory_db();
        let html = std::fs::read_to_string("tests/fixtures/modern_bulletin.html").unwrap();
        let tables = extract_tables(&html);
        let policy = no_wait(3);

        let h1 = save_bulletin(&conn, date(2023, 3, 1), None, &tables, &policy).unwrap();
        let n1 = count(&conn);
        let rows1 = dump(&conn);
        assert_eq!(h1.records, n1);
        assert_eq!(n1, 5 * 5 * 2 + (10 + 7) * 6);

        let h2 = save_bulletin(&conn, date(2023, 3, 1), Some("https://example.test/march"), &tables, &policy)
            .unwrap();
        assert_eq!(h1.bulletin.id, h2.bulletin.id);
        assert_eq!(count(&conn), n1);
        assert_eq!(dump(&conn), rows1);
        assert_eq!(h2.bulletin.url.as_deref(), Some("https://example.test/march"));
    }

    #[test]
    fn stats_reflect_saved_data() {
        let conn = memory_db();
        let html = std::fs::read_to_string("tests/fixtures/legacy_bulletin.html").unwrap();
        let tables = extract_tables(&html);
        save_bulletin(&conn, date(2005, 5, 1), None, &tables, &no_wait(1)).unwrap();
        save_bulletin(&conn, date(2005, 6, 1), Some("https://example.test/june"), &tables, &no_wait(1))
            .unwrap();

        let s = get_stats(&conn).unwrap();
        assert_eq!(s.bulletins, 2);
        assert_eq!(s.records, 2 * (5 * 5 + 8 * 5));
        assert_eq!(s.missing_url, 1);
        assert_eq!(s.first, Some(date(2005, 5, 1)));
        assert_eq!(s.last, Some(date(2005, 6, 1)));

        let classes = fetch_distinct_classes(&conn, VisaCategory::FamilySponsored).unwrap();
        assert_eq!(classes, vec!["F1", "F2A", "F2B", "F3", "F4"]);
    }

    #[test]
    fn series_rows_are_ordered_and_typed() {
        let conn = memory_db();
        let html = std::fs::read_to_string("tests/fixtures/modern_bulletin.html").unwrap();
        let tables = extract_tables(&html);
        save_bulletin(&conn, date(2023, 4, 1), None, &tables, &no_wait(1)).unwrap();
        save_bulletin(&conn, date(2023, 3, 1), None, &tables, &no_wait(1)).unwrap();

        let rows = fetch_series_rows(&conn, VisaCategory::FamilySponsored, Country::Mexico, ActionType::FinalAction)
            .unwrap();
        assert_eq!(rows.len(), 2 * 5);
        assert_eq!(rows[0].publication_date, date(2023, 3, 1));
        assert_eq!(rows[9].publication_date, date(2023, 4, 1));
        let f1 = rows.iter().find(|r| r.visa_class == "F1").unwrap();
        assert_eq!(f1.cutoff_date, Some(date(2001, 4, 1)));
    }

    #[test]
    fn batch_continues_past_failures() {
        let conn = memory_db();
        let html = std::fs::read_to_string("tests/fixtures/modern_bulletin.html").unwrap();
        let tables = extract_tables(&html);
        let per_bulletin = 5 * 5 * 2 + (10 + 7) * 6;

        let pending = |d: NaiveDate, tables: Result<Vec<Table>>| PendingBulletin {
            publication_date: d,
            url: None,
            tables,
        };
        let items = vec![
            pending(date(2023, 1, 1), Ok(tables.clone())),
            pending(date(2023, 2, 1), Err(anyhow::anyhow!("Failed to read page"))),
            pending(date(2023, 3, 1), Ok(tables.clone())),
        ];

        let mut seen = Vec::new();
        let outcome = save_batch(&conn, items, &no_wait(1), |d| seen.push(d));
        assert_eq!(outcome.saved, 2);
        assert_eq!(outcome.records, 2 * per_bulletin);
        assert_eq!(outcome.failed, vec![date(2023, 2, 1)]);
        assert_eq!(seen.len(), 3);
        assert_eq!(
            fetch_publication_dates(&conn).unwrap(),
            vec![date(2023, 1, 1), date(2023, 3, 1)]
        );
        assert_eq!(count(&conn), 2 * per_bulletin);
    }

    #[test]
    fn batch_survives_database_error_mid_run() {
        let conn = memory_db();
        let html = std::fs::read_to_string("tests/fixtures/legacy_bulletin.html").unwrap();
        let tables = extract_tables(&html);

        save_batch(
            &conn,
            vec![PendingBulletin { publication_date: date(2005, 5, 1), url: None, tables: Ok(tables.clone()) }],
            &no_wait(1),
            |_| {},
        );
        // rejects writes for June only, with a non-contention error
        conn.execute_batch(
            "CREATE TRIGGER reject_june BEFORE INSERT ON bulletin
             WHEN NEW.publication_date = '2005-06-01'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();

        let items = [6, 7].map(|m| PendingBulletin {
            publication_date: date(2005, m, 1),
            url: None,
            tables: Ok(tables.clone()),
        });
        let mut outcome = BatchOutcome::default();
        outcome.merge(save_batch(&conn, items, &no_wait(3), |_| {}));

        assert_eq!(outcome.saved, 1);
        assert_eq!(outcome.failed, vec![date(2005, 6, 1)]);
        assert_eq!(
            fetch_publication_dates(&conn).unwrap(),
            vec![date(2005, 5, 1), date(2005, 7, 1)]
        );
        assert_eq!(count(&conn), 2 * (5 * 5 + 8 * 5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_runs_inside_async_runtime() {
        let conn = memory_db();
        let html = std::fs::read_to_string("tests/fixtures/legacy_bulletin.html").unwrap();
        let tables = extract_tables(&html);
        let items = vec![PendingBulletin { publication_date: date(2005, 5, 1), url: None, tables: Ok(tables) }];

        let outcome = tokio::task::block_in_place(|| save_batch(&conn, items, &no_wait(2), |_| {}));
        assert_eq!(outcome.saved, 1);
        assert!(outcome.failed.is_empty());
    }

    #[test]
    fn contention_detection() {
        assert!(is_contention(&sqlite_error(rusqlite::ffi::SQLITE_BUSY)));
        assert!(is_contention(&sqlite_error(rusqlite::ffi::SQLITE_LOCKED)));
        assert!(is_contention(&sqlite_error(rusqlite::ffi::SQLITE_BUSY).context("saving")));
        assert!(!is_contention(&sqlite_error(rusqlite::ffi::SQLITE_CONSTRAINT)));
        assert!(!is_contention(&anyhow::anyhow!("connection refused")));
    }

    #[test]
    fn retry_recovers_from_busy() {
        let calls = Counter::new(0);
        let result = with_retry(&no_wait(3), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(sqlite_error(rusqlite::ffi::SQLITE_BUSY))
            } else {
                Ok("saved")
            }
        });
        assert_eq!(result.unwrap(), "saved");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let calls = Counter::new(0);
        let result: Result<()> = with_retry(&no_wait(3), || {
            calls.set(calls.get() + 1);
            Err(sqlite_error(rusqlite::ffi::SQLITE_LOCKED))
        });
        let err = result.unwrap_err();
        assert!(is_contention(&err));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let calls = Counter::new(0);
        let result: Result<()> = with_retry(&no_wait(5), || {
            calls.set(calls.get() + 1);
            Err(anyhow::anyhow!("disk on fire"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(0), Duration::from_secs(1));
        assert_eq!(p.delay(1), Duration::from_secs(2));
        assert_eq!(p.delay(2), Duration::from_secs(4));
    }
}
