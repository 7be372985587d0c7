mod aggregate;
mod blob;
mod config;
mod db;
mod error;
mod extract;
mod fetcher;
mod listing;
mod normalize;
mod pipeline;
mod scrape;
mod server;

use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::blob::FsBlobStore;
use crate::config::Settings;
use crate::db::{SqliteTableStore, TableStore};
use crate::pipeline::{Pipeline, RunReport, Source};

#[derive(Parser)]
#[command(name = "rentals_pipeline", about = "Rental listings scraper and aggregation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape the listing pages and print the raw listings as JSON
    Scrape {
        /// Number of pages to walk (default: settings.max_pages)
        #[arg(short = 'p', long)]
        pages: Option<u32>,
    },
    /// Scrape, normalize, stage and aggregate in one run
    Run {
        /// Number of pages to walk (default: settings.max_pages)
        #[arg(short = 'p', long)]
        pages: Option<u32>,
        /// Take raw listings from a running `serve` endpoint instead of scraping
        #[arg(long)]
        from_endpoint: Option<String>,
        /// Reuse a run id to retry a failed run without double-loading
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Serve raw listings over HTTP
    Serve {
        /// Listen address (default: settings.listen_addr)
        #[arg(short, long)]
        addr: Option<String>,
    },
    /// Show the aggregate table
    Aggregates {
        /// Max rows to display
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show the most recently staged listings
    Staged {
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Show staging and load statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load()?;

    let result = match cli.command {
        Commands::Scrape { pages } => {
            if let Some(n) = pages {
                settings.max_pages = n;
            }
            let fetcher = fetcher::open(&settings)?;
            let listings = scrape::scrape_listings(
                fetcher.as_ref(),
                settings.max_pages,
                Duration::from_millis(settings.page_delay_ms),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&listings)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            pages,
            from_endpoint,
            run_id,
        } => {
            if let Some(n) = pages {
                settings.max_pages = n;
            }
            let blobs = FsBlobStore::open(&settings.blob_dir).with_context(|| {
                format!("Failed to open blob dir {}", settings.blob_dir.display())
            })?;
            let tables = open_tables(&settings)?;
            let run_id = run_id.unwrap_or_else(pipeline::new_run_id);
            let pipeline = Pipeline {
                blobs: &blobs,
                tables: &tables,
                blob_name: &settings.blob_name,
                staging_table: &settings.staging_table,
                aggregate_table: &settings.aggregate_table,
            };

            let outcome = match from_endpoint.as_deref() {
                Some(url) => pipeline.run(&run_id, Source::Endpoint(url)).await,
                None => {
                    // The fetcher lives exactly as long as this run.
                    let fetcher = fetcher::open(&settings)?;
                    pipeline
                        .run(
                            &run_id,
                            Source::Pages {
                                fetcher: fetcher.as_ref(),
                                max_pages: settings.max_pages,
                                delay: Duration::from_millis(settings.page_delay_ms),
                            },
                        )
                        .await
                }
            };

            match outcome {
                Ok(report) => {
                    print_report(&report);
                    println!("Blob:      {}", blobs.path(&settings.blob_name).display());
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("Run {} failed at {}: {:#}", e.run_id, e.stage, e.source);
                    eprintln!("Retry with --run-id {} to avoid double-loading.", run_id);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                settings.listen_addr = addr;
            }
            server::serve(settings).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Aggregates { limit } => {
            let tables = open_tables(&settings)?;
            if !tables.table_exists(&settings.aggregate_table)? {
                println!("No aggregates yet. Run 'run' first.");
                return Ok(ExitCode::SUCCESS);
            }
            let rows = tables.fetch_aggregates(&settings.aggregate_table, limit)?;

            println!(
                "{:>3} | {:<32} | {:>10} | {:>10} | {:>10} | {:>8}",
                "#", "Location", "Avg (DH)", "Max (DH)", "Min (DH)", "Area m²"
            );
            println!("{}", "-".repeat(88));
            for (i, r) in rows.iter().enumerate() {
                let area = r
                    .most_common_area
                    .map(|a| format!("{:.0}", a))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>3} | {:<32} | {:>10.0} | {:>10.0} | {:>10.0} | {:>8}",
                    i + 1,
                    truncate(&r.location, 32),
                    r.avg_price,
                    r.max_price,
                    r.min_price,
                    area
                );
            }
            println!("\n{} locations", rows.len());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Staged { limit } => {
            let tables = open_tables(&settings)?;
            if !tables.table_exists(&settings.staging_table)? {
                println!("Nothing staged yet. Run 'run' first.");
                return Ok(ExitCode::SUCCESS);
            }
            let rows = tables.fetch_staging(&settings.staging_table)?;
            let skip = rows.len().saturating_sub(limit);
            for r in &rows[skip..] {
                let area = r.area.map(|a| format!("{:.0} m²", a)).unwrap_or_else(|| "-".into());
                println!(
                    "{:<32} | {:>10.0} DH | {:>8} | {}",
                    truncate(&r.location, 32),
                    r.price,
                    area,
                    r.date
                );
            }
            println!("\n{} of {} staged listings", rows.len() - skip, rows.len());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stats => {
            let tables = open_tables(&settings)?;
            println!("Staged rows: {}", tables.count_rows(&settings.staging_table)?);
            println!("Loads:       {}", tables.count_loads(&settings.staging_table)?);
            println!("Locations:   {}", tables.count_rows(&settings.aggregate_table)?);
            println!("Database:    {}", settings.db_path.display());
            Ok(ExitCode::SUCCESS)
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_tables(settings: &Settings) -> anyhow::Result<SqliteTableStore> {
    SqliteTableStore::open(&settings.db_path)
        .with_context(|| format!("Failed to open database {}", settings.db_path.display()))
}

fn print_report(report: &RunReport) {
    println!("Run:       {}", report.run_id);
    println!("Stage:     {}", report.stage);
    println!("Scraped:   {}", report.raw);
    println!("Kept:      {} ({} rejected)", report.normalized, report.rejected);
    if report.replayed {
        println!("Staged:    {} (already loaded, skipped)", report.staged);
    } else {
        println!("Staged:    {}", report.staged);
    }
    println!("Locations: {}", report.aggregates);
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
