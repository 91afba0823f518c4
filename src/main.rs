mod config;
mod db;
mod fetch;
mod parser;
mod projection;
mod series;
mod sitemap;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use tracing::warn;

use config::Config;
use parser::normalize::{display_label, ActionType, Country, LabelKind, VisaCategory};

#[derive(Parser)]
#[command(name = "visa_bulletin", about = "U.S. visa bulletin cutoff tracker")]
struct Cli {
    /// SQLite database path (overrides VISA_BULLETIN_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Fetch and store bulletins not yet in the database
    Refresh {
        /// Max new bulletins to process (oldest first)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Re-extract every cached bulletin page into the database
    Rebuild,
    /// Extract tables and records from one local bulletin page
    Extract {
        file: PathBuf,
        /// Publication month (YYYY-MM); read from the file name when omitted
        #[arg(short, long)]
        month: Option<String>,
        /// Also store the records
        #[arg(long)]
        save: bool,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cutoff history per visa class
    Series {
        #[command(flatten)]
        query: SeriesQuery,
        #[arg(long)]
        json: bool,
    },
    /// Estimate when a priority date becomes current
    Project {
        #[command(flatten)]
        query: SeriesQuery,
        /// Priority date (YYYY-MM-DD); invalid or missing means today
        #[arg(short, long)]
        target: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List visa classes with display names
    Classes {
        /// family_sponsored or employment_based (default: both)
        #[arg(short, long, value_parser = parse_category)]
        category: Option<VisaCategory>,
    },
    /// Show database statistics
    Stats,
}

#[derive(clap::Args)]
struct SeriesQuery {
    /// family_sponsored or employment_based
    #[arg(short, long, value_parser = parse_category, default_value = "family_sponsored")]
    category: VisaCategory,
    /// all, china, india, mexico, philippines, el_salvador_guatemala_honduras
    #[arg(long, value_parser = parse_country, default_value = "all")]
    country: Country,
    /// final_action or filing
    #[arg(short, long, value_parser = parse_action, default_value = "final_action")]
    action: ActionType,
    /// Single class, any spelling (F2A, 2A, EB-3, "3rd", ...)
    #[arg(long)]
    class: Option<String>,
}

fn parse_category(s: &str) -> Result<VisaCategory, String> {
    match s {
        "family" => Ok(VisaCategory::FamilySponsored),
        "employment" => Ok(VisaCategory::EmploymentBased),
        _ => VisaCategory::from_code(s).ok_or_else(|| format!("unknown category: {}", s)),
    }
}

fn parse_country(s: &str) -> Result<Country, String> {
    Country::from_code(s).ok_or_else(|| format!("unknown country: {}", s))
}

fn parse_action(s: &str) -> Result<ActionType, String> {
    ActionType::from_code(s).ok_or_else(|| format!("unknown action type: {}", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let cfg = Config::from_env()?.with_db_path(cli.db);

    let result = match cli.command {
        Commands::Init => {
            open_db(&cfg)?;
            println!("Schema ready at {}", cfg.db_path.display());
            Ok(())
        }
        Commands::Refresh { limit } => {
            let conn = open_db(&cfg)?;
            refresh(&conn, &cfg, limit).await
        }
        Commands::Rebuild => {
            let conn = open_db(&cfg)?;
            rebuild(&conn, &cfg)
        }
        Commands::Extract { file, month, save, json } => {
            let conn = if save { Some(open_db(&cfg)?) } else { None };
            extract_file(conn.as_ref(), &cfg, &file, month.as_deref(), json)
        }
        Commands::Series { query, json } => {
            let conn = open_db(&cfg)?;
            let data = query_series(&conn, &query)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                print_series(&query, &data);
            }
            Ok(())
        }
        Commands::Project { query, target, json } => {
            let conn = open_db(&cfg)?;
            let today = chrono::Local::now().date_naive();
            let target = projection::parse_target_date(target.as_deref(), today);
            let mut data = query_series(&conn, &query)?;
            for s in &mut data {
                s.project(target);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                print_projections(&query, target, &data);
            }
            Ok(())
        }
        Commands::Classes { category } => {
            let conn = open_db(&cfg)?;
            let categories = match category {
                Some(c) => vec![c],
                None => VisaCategory::ALL.to_vec(),
            };
            for c in categories {
                println!("{}:", display_label(LabelKind::Category, c.code()));
                for (value, label) in series::visa_classes_for_category(&conn, c)? {
                    println!("  {:<40} {}", value, label);
                }
            }
            Ok(())
        }
        Commands::Stats => {
            let conn = open_db(&cfg)?;
            let s = db::get_stats(&conn)?;
            let fmt_date = |d: Option<NaiveDate>| d.map(|d| d.to_string()).unwrap_or_else(|| "-".into());
            println!("Bulletins:   {}", s.bulletins);
            println!("Records:     {}", s.records);
            println!("Current:     {}", s.current);
            println!("Unavailable: {}", s.unavailable);
            println!("Missing URL: {}", s.missing_url);
            println!("Range:       {} to {}", fmt_date(s.first), fmt_date(s.last));
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_db(cfg: &Config) -> Result<Connection> {
    let conn = db::connect(&cfg.db_path)?;
    db::init_schema(&conn)?;
    Ok(conn)
}

fn progress_bar(len: usize) -> Result<indicatif::ProgressBar> {
    use indicatif::{ProgressBar, ProgressStyle};

    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

// ── Refresh ──

const REFRESH_CHUNK: usize = 10;

async fn refresh(conn: &Connection, cfg: &Config, limit: Option<usize>) -> Result<()> {
    let existing: HashSet<NaiveDate> = db::fetch_publication_dates(conn)?.into_iter().collect();
    println!("Bulletins in database: {}", existing.len());

    let client = fetch::client()?;
    let cache = fetch::PageCache::new(&cfg.cache_dir);
    let refs = sitemap::fetch_bulletin_refs(&client, &cfg.index_url).await?;

    let mut pending: Vec<_> = refs
        .into_iter()
        .filter(|r| !existing.contains(&r.publication_date))
        .collect();
    pending.sort_by_key(|r| r.publication_date);
    if let Some(n) = limit {
        pending.truncate(n);
    }
    if pending.is_empty() {
        println!("No new bulletins. Database is up to date.");
        return Ok(());
    }
    println!("Processing {} new bulletins...", pending.len());

    let pb = progress_bar(pending.len())?;
    let mut outcome = db::BatchOutcome::default();

    for chunk in pending.chunks(REFRESH_CHUNK) {
        let mut fetched = Vec::with_capacity(chunk.len());
        for r in chunk {
            pb.set_message(r.publication_date.format("%B %Y").to_string());
            let tables = fetch::fetch_publication(&client, &cache, &r.url)
                .await
                .map(|html| parser::extract_tables(&html));
            if matches!(&tables, Ok(t) if t.is_empty()) {
                warn!("No tables found in {}", r.url);
            }
            fetched.push(db::PendingBulletin {
                publication_date: r.publication_date,
                url: Some(r.url.clone()),
                tables,
            });
        }

        // SQLite writes and their retry backoff block
        let batch = tokio::task::block_in_place(|| {
            db::save_batch(conn, fetched, &cfg.retry, |_| pb.inc(1))
        });
        outcome.merge(batch);
    }
    pb.finish_and_clear();

    let db::BatchOutcome { saved, records, failed } = outcome;
    println!("Saved {} bulletins ({} records), {} failed.", saved, records, failed.len());
    for d in &failed {
        println!("  failed: {}", d.format("%B %Y"));
    }
    Ok(())
}

// ── Rebuild ──

fn rebuild(conn: &Connection, cfg: &Config) -> Result<()> {
    use rayon::prelude::*;

    let cache = fetch::PageCache::new(&cfg.cache_dir);
    let pages = cache.list()?;
    if pages.is_empty() {
        println!("No cached pages in {}. Run 'refresh' first.", cache.dir().display());
        return Ok(());
    }
    println!("Rebuilding from {} cached pages...", pages.len());

    let pb = progress_bar(pages.len())?;
    let mut outcome = db::BatchOutcome::default();

    for chunk in pages.chunks(50) {
        let parsed: Vec<db::PendingBulletin> = chunk
            .par_iter()
            .map(|p| db::PendingBulletin {
                publication_date: p.publication_date,
                url: None,
                tables: std::fs::read_to_string(&p.path)
                    .with_context(|| format!("Failed to read {:?}", p.path))
                    .map(|html| parser::extract_tables(&html)),
            })
            .collect();

        outcome.merge(db::save_batch(conn, parsed, &cfg.retry, |_| pb.inc(1)));
    }
    pb.finish_and_clear();

    println!(
        "Rebuilt {} bulletins ({} records), {} failed.",
        outcome.saved,
        outcome.records,
        outcome.failed.len()
    );
    Ok(())
}

// ── Extract ──

fn extract_file(
    conn: Option<&Connection>,
    cfg: &Config,
    file: &Path,
    month: Option<&str>,
    json: bool,
) -> Result<()> {
    let html = std::fs::read_to_string(file).with_context(|| format!("Failed to read {:?}", file))?;
    let publication_date = match month {
        Some(m) => NaiveDate::parse_from_str(&format!("{}-01", m), "%Y-%m-%d")
            .with_context(|| format!("Invalid month {:?}, expected YYYY-MM", m))?,
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(sitemap::publication_date_from_url)
            .context("Cannot infer the publication month from the file name; pass --month")?,
    };

    let parser::ParsedPage { tables, records } = parser::process_page(&html, publication_date);

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        for t in &tables {
            println!("{} ({} rows)", t.title, t.rows.len());
            println!("  {}", t.headers.join(" | "));
            for row in &t.rows {
                let cells: Vec<String> = row.iter().map(|c| c.to_string()).collect();
                println!("  {}", cells.join(" | "));
            }
        }
        println!("\n{} tables, {} records for {}", tables.len(), records.len(), publication_date);
    }

    if let Some(conn) = conn {
        let h = db::save_bulletin(conn, publication_date, None, &tables, &cfg.retry)?;
        println!(
            "Saved bulletin {} ({} records) {}",
            h.bulletin.publication_date,
            h.records,
            h.bulletin.bulletin_url()
        );
    }
    Ok(())
}

// ── Series / projection output ──

fn query_series(conn: &Connection, q: &SeriesQuery) -> Result<Vec<series::VisaClassSeries>> {
    series::get_series(conn, q.category, q.country, q.action, q.class.as_deref())
}

fn print_heading(q: &SeriesQuery) {
    println!(
        "{} / {} / {}",
        display_label(LabelKind::Category, q.category.code()),
        display_label(LabelKind::Country, q.country.code()),
        display_label(LabelKind::ActionType, q.action.code()),
    );
}

fn print_series(q: &SeriesQuery, data: &[series::VisaClassSeries]) {
    print_heading(q);
    if data.is_empty() {
        println!("No data.");
        return;
    }
    for s in data {
        println!("\n{}", s.label);
        for p in &s.points {
            let cutoff = p
                .cutoff_date
                .map(|d| d.to_string())
                .unwrap_or_else(|| "unavailable".into());
            println!("  {}  {}", p.publication_date.format("%Y-%m"), cutoff);
        }
    }
}

fn print_projections(q: &SeriesQuery, target: NaiveDate, data: &[series::VisaClassSeries]) {
    print_heading(q);
    println!("Priority date: {}", target);
    if data.is_empty() {
        println!("No data.");
        return;
    }
    for s in data {
        match &s.projection {
            Some(p) => {
                let estimate = p
                    .estimated_date
                    .map(|d| d.format("%B %Y").to_string())
                    .unwrap_or_else(|| "-".into());
                let rate = p
                    .avg_progress_days_per_month
                    .map(|r| format!("{:.1} days/month", r))
                    .unwrap_or_else(|| "-".into());
                println!("{:<50} {:<60} {:<16} {}", s.label, p.message, estimate, rate);
            }
            None => println!("{:<50} not enough data", s.label),
        }
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
