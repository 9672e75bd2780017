mod browser;
mod capability;
mod classifier;
mod config;
mod crawl;
mod db;
mod detail;
mod window;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::browser::WebDriverSession;
use crate::config::CrawlConfig;
use crate::crawl::{Controller, CrawlError, CrawlSummary, StopReason};
use crate::db::SqliteStore;
use crate::window::CrawlWindow;

#[derive(Parser)]
#[command(name = "class_crawler", about = "Date-window crawler for the Peloton class catalog")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl one date window and upsert every class found in it
    Crawl {
        /// First air date to extract (YYYY-MM-DD, inclusive)
        #[arg(long, value_parser = parse_date)]
        start_date: NaiveDate,
        /// Last air date to extract (YYYY-MM-DD, inclusive)
        #[arg(long, value_parser = parse_date)]
        end_date: NaiveDate,
        /// Print the end-of-run summary as JSON
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Crawl month by month, one independent session per month
    Batch {
        /// First month (YYYY-MM)
        #[arg(long, value_parser = parse_month)]
        from: NaiveDate,
        /// Last month (YYYY-MM, inclusive)
        #[arg(long, value_parser = parse_month)]
        to: NaiveDate,
        /// Sessions to run at once over disjoint months
        #[arg(long, default_value = "1")]
        parallel: usize,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Show what the store holds
    Stats {
        #[arg(long, default_value = config::DB_PATH)]
        db: PathBuf,
    },
    /// List stored classes, newest first
    List {
        #[arg(long, value_parser = parse_date)]
        start_date: Option<NaiveDate>,
        #[arg(long, value_parser = parse_date)]
        end_date: Option<NaiveDate>,
        #[arg(short, long)]
        instructor: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
        #[arg(long, default_value = config::DB_PATH)]
        db: PathBuf,
    },
}

#[derive(Args, Clone)]
struct SessionArgs {
    /// Max classes to extract per window
    #[arg(short = 'n', long, default_value_t = config::MAX_ITEMS)]
    max_items: usize,
    /// Stop after this many consecutive classes older than the window
    #[arg(long, default_value_t = config::STOP_THRESHOLD)]
    stop_threshold: usize,
    /// Run the browser without a window
    #[arg(long)]
    headless: bool,
    /// Catalog class type filter, stored with every record
    #[arg(long, default_value = config::CLASS_TYPE)]
    class_type: String,
    /// Don't re-open classes that are already stored
    #[arg(long)]
    skip_existing: bool,
    #[arg(long, default_value = config::DB_PATH)]
    db: PathBuf,
    #[arg(long, env = "WEBDRIVER_URL", default_value = config::WEBDRIVER_URL)]
    webdriver_url: String,
    #[arg(long, env = "PELOTON_EMAIL", hide_env_values = true)]
    email: Option<String>,
    #[arg(long, env = "PELOTON_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Clone)]
struct Credentials {
    email: String,
    password: String,
}

impl SessionArgs {
    fn config(&self) -> CrawlConfig {
        CrawlConfig {
            class_type: self.class_type.clone(),
            db_path: self.db.clone(),
            webdriver_url: self.webdriver_url.clone(),
            headless: self.headless,
            skip_existing: self.skip_existing,
            ..CrawlConfig::default()
        }
    }

    fn credentials(&self) -> Result<Credentials> {
        Ok(Credentials {
            email: self.email.clone().context("PELOTON_EMAIL must be set (or pass --email)")?,
            password: self
                .password
                .clone()
                .context("PELOTON_PASSWORD must be set (or pass --password)")?,
        })
    }

    fn window(&self, start: NaiveDate, end: NaiveDate) -> Result<CrawlWindow> {
        Ok(CrawlWindow::new(start, end, self.max_items, self.stop_threshold)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Crawl {
            start_date,
            end_date,
            json,
            session,
        } => {
            let window = session.window(start_date, end_date)?;
            let cfg = session.config();
            let creds = session.credentials()?;
            let cancel = cancel_on_ctrl_c();

            let pb = ProgressBar::new_spinner();
            pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
            pb.enable_steady_tick(Duration::from_millis(120));

            let run = crawl_window(window, &cfg, &creds, cancel, pb.clone()).await;
            pb.finish_and_clear();
            let run = run?;

            if json {
                println!("{}", serde_json::to_string_pretty(&run.summary)?);
            } else {
                print_report(&run.summary, run.result.as_ref().err());
            }
            run.result.map(|_| ()).map_err(anyhow::Error::from)
        }
        Commands::Batch {
            from,
            to,
            parallel,
            session,
        } => run_batch(from, to, parallel, &session).await,
        Commands::Stats { db } => {
            let conn = db::connect(&db)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            let date = |d: Option<NaiveDate>| d.map(|d| d.to_string()).unwrap_or_else(|| "-".into());
            println!("Classes:   {}", s.total);
            println!("Earliest:  {}", date(s.earliest));
            println!("Latest:    {}", date(s.latest));
            if !s.by_class_type.is_empty() {
                println!("\n--- By class type ---");
                for (class_type, n) in &s.by_class_type {
                    println!("  {:<24} {:>6}", class_type, n);
                }
            }
            if !s.top_instructors.is_empty() {
                println!("\n--- Top instructors ---");
                for (name, n) in &s.top_instructors {
                    println!("  {:<24} {:>6}", truncate(name, 24), n);
                }
            }
            Ok(())
        }
        Commands::List {
            start_date,
            end_date,
            instructor,
            limit,
            db,
        } => {
            let conn = db::connect(&db)?;
            db::init_schema(&conn)?;
            let rows = db::fetch_classes(
                &conn,
                &db::ListFilter {
                    start: start_date,
                    end: end_date,
                    instructor: instructor.as_deref(),
                    limit,
                },
            )?;
            if rows.is_empty() {
                println!("No classes found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<10} | {:<40} | {:<18} | {:>4} | {:>6}",
                "#", "Aired", "Title", "Instructor", "Min", "Rating"
            );
            println!("{}", "-".repeat(98));
            for (i, r) in rows.iter().enumerate() {
                println!(
                    "{:>3} | {:<10} | {:<40} | {:<18} | {:>4} | {:>6.2}",
                    i + 1,
                    r.original_air_date,
                    truncate(&r.title, 40),
                    truncate(&r.instructor, 18),
                    r.duration_minutes,
                    r.difficulty_rating
                );
            }
            println!("\n{} classes", rows.len());
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

struct RunOutcome {
    summary: CrawlSummary,
    result: Result<StopReason, CrawlError>,
}

/// One window, one session, one store connection.
async fn crawl_window(
    window: CrawlWindow,
    cfg: &CrawlConfig,
    creds: &Credentials,
    cancel: Arc<AtomicBool>,
    pb: ProgressBar,
) -> Result<RunOutcome> {
    let mut store = SqliteStore::open(&cfg.db_path)
        .with_context(|| format!("Failed to open {}", cfg.db_path.display()))?;
    let mut session = WebDriverSession::connect(cfg).await?;

    let outcome = async {
        session.login(&creds.email, &creds.password).await?;
        let mut controller = Controller::new(&mut session, &mut store, window, cfg)
            .with_cancel(cancel)
            .with_progress(pb);
        let result = controller.run().await;
        Ok::<_, anyhow::Error>(RunOutcome {
            summary: controller.summary().clone(),
            result,
        })
    }
    .await;

    if let Err(e) = session.close().await {
        warn!("Could not close browser session: {}", e);
    }
    outcome
}

async fn run_batch(from: NaiveDate, to: NaiveDate, parallel: usize, args: &SessionArgs) -> Result<()> {
    let months = window::month_windows(from, to)?;
    let cfg = Arc::new(args.config());
    let creds = args.credentials()?;
    let cancel = cancel_on_ctrl_c();
    let semaphore = Arc::new(Semaphore::new(parallel.max(1)));
    let total = months.len();

    println!(
        "Batch: {} months, {} at a time, store {}",
        total,
        parallel.max(1),
        cfg.db_path.display()
    );

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} months ({msg})")?
            .progress_chars("=> "),
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel(total.max(1));

    for (start, end) in months {
        let window = args.window(start, end)?;
        let cfg = Arc::clone(&cfg);
        let creds = creds.clone();
        let cancel = Arc::clone(&cancel);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            let outcome = if cancel.load(Ordering::SeqCst) {
                Err(anyhow::anyhow!("cancelled before start"))
            } else {
                info!("Month {} → {}", start, end);
                crawl_window(window, &cfg, &creds, cancel, ProgressBar::hidden()).await
            };
            let _ = tx.send((start, end, outcome)).await;
        });
    }
    drop(tx);

    let mut results = Vec::with_capacity(total);
    let mut extracted = 0usize;
    while let Some((start, end, outcome)) = rx.recv().await {
        if let Ok(run) = &outcome {
            extracted += run.summary.extracted;
        }
        pb.set_message(format!("{extracted} classes"));
        pb.inc(1);
        results.push((start, end, outcome));
    }
    pb.finish_and_clear();
    results.sort_by_key(|(start, _, _)| *start);

    let mut failed = Vec::new();
    for (start, end, outcome) in &results {
        match outcome {
            Ok(RunOutcome { summary, result: Ok(reason) }) => println!(
                "  {} → {}: {} extracted, {} skipped ({})",
                start,
                end,
                summary.extracted,
                summary.total_skipped(),
                reason
            ),
            Ok(RunOutcome { summary, result: Err(e) }) => {
                println!("  {} → {}: aborted after {} extracted: {}", start, end, summary.extracted, e);
                failed.push((*start, *end));
            }
            Err(e) => {
                println!("  {} → {}: failed: {:#}", start, end, e);
                failed.push((*start, *end));
            }
        }
    }

    println!("\nSuccessful: {}/{} months, {} classes", total - failed.len(), total, extracted);
    if failed.is_empty() {
        return Ok(());
    }
    println!("Failed: {}/{} months. Re-run them with:", failed.len(), total);
    for (start, end) in &failed {
        println!("  class_crawler crawl --start-date {} --end-date {} --headless", start, end);
    }
    anyhow::bail!("{} of {} months failed", failed.len(), total)
}

/// Flag flipped by Ctrl-C; the crawl checks it between scroll passes.
fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let set = Arc::clone(&flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing the current pass");
            set.store(true, Ordering::SeqCst);
        }
    });
    flag
}

fn print_report(summary: &CrawlSummary, error: Option<&CrawlError>) {
    match (summary.stop_reason, error) {
        (Some(reason), _) => println!("Stop reason:    {}", reason),
        (None, Some(e)) => println!("Stop reason:    aborted ({})", e),
        (None, None) => println!("Stop reason:    -"),
    }
    println!(
        "Extracted:      {} ({} new, {} refreshed)",
        summary.extracted, summary.inserted, summary.updated
    );
    println!("Skipped:        {}", summary.total_skipped());
    for (reason, n) in &summary.skipped {
        println!("  {:<14}{}", format!("{:?}:", reason), n);
    }
    println!("Already stored: {}", summary.already_stored);
    println!("Newer, passed:  {}", summary.fast_forwarded);
    println!("Older, counted: {}", summary.past_window);
    println!("Passes:         {}", summary.passes);

    if !summary.failures.is_empty() {
        println!("\n--- Failures ---");
        for f in &summary.failures {
            println!("  {:<16} {:?}: {}", truncate(&f.identifier, 16), f.reason, f.message);
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn parse_month(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM: {e}"))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
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
