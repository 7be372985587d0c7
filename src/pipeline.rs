use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::aggregate;
use crate::blob::{materialize, BlobStore};
use crate::db::{CreateDisposition, LoadReport, LoadRequest, TableStore};
use crate::error::{PipelineError, Stage};
use crate::extract::ListingExtractor;
use crate::fetcher::PageFetcher;
use crate::normalize::normalize_all;
use crate::scrape;

/// Where a run gets its raw listings from.
pub enum Source<'a> {
    /// Scrape pages `1..=max_pages` directly.
    Pages {
        fetcher: &'a dyn PageFetcher,
        max_pages: u32,
        delay: Duration,
    },
    /// GET the raw listing array from a scraping endpoint.
    Endpoint(&'a str),
}

enum Fetched {
    Pages(Vec<String>),
    Body(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub stage: String,
    pub raw: usize,
    pub normalized: usize,
    pub rejected: usize,
    pub staged: usize,
    pub replayed: bool,
    pub aggregates: usize,
    pub elapsed_ms: u64,
}

/// Sequences fetch → extract → normalize → materialize → load → aggregate.
///
/// Each stage runs at most once and only on the previous stage's output; the
/// first failure ends the run.
pub struct Pipeline<'a> {
    pub blobs: &'a dyn BlobStore,
    pub tables: &'a dyn TableStore,
    pub blob_name: &'a str,
    pub staging_table: &'a str,
    pub aggregate_table: &'a str,
}

pub fn new_run_id() -> String {
    format!("run-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"))
}

fn failed<E>(run_id: &str, stage: Stage) -> impl FnOnce(E) -> PipelineError + '_
where
    E: Into<anyhow::Error>,
{
    move |e| PipelineError {
        run_id: run_id.to_string(),
        stage,
        source: e.into(),
    }
}

impl Pipeline<'_> {
    pub async fn run(&self, run_id: &str, source: Source<'_>) -> Result<RunReport, PipelineError> {
        let t0 = Instant::now();
        info!(run_id, "pipeline started");

        let fetched = match source {
            Source::Pages {
                fetcher,
                max_pages,
                delay,
            } => scrape::fetch_pages(fetcher, max_pages, delay)
                .await
                .map(Fetched::Pages),
            Source::Endpoint(url) => scrape::fetch_endpoint(url).await.map(Fetched::Body),
        }
        .map_err(failed(run_id, Stage::Fetched))?;
        info!(run_id, stage = %Stage::Fetched, "stage complete");

        let raw = match fetched {
            Fetched::Pages(pages) => {
                Ok(scrape::extract_pages(&ListingExtractor::default(), &pages))
            }
            Fetched::Body(body) => scrape::parse_endpoint_body(&body),
        }
        .map_err(failed(run_id, Stage::Extracted))?;
        info!(run_id, stage = %Stage::Extracted, listings = raw.len(), "stage complete");

        let batch = normalize_all(&raw);
        info!(
            run_id,
            stage = %Stage::Normalized,
            kept = batch.listings.len(),
            rejected = batch.rejected,
            "stage complete"
        );

        // A replayed run keeps the blob it staged from.
        let prior = self
            .tables
            .loaded_rows(self.staging_table, run_id)
            .map_err(failed(run_id, Stage::Materialized))?;
        let load = match prior {
            Some(rows) => {
                warn!(run_id, rows, "run already staged, keeping its blob");
                LoadReport {
                    rows,
                    created: false,
                    replayed: true,
                }
            }
            None => {
                materialize(self.blobs, self.blob_name, &batch.listings)
                    .map_err(failed(run_id, Stage::Materialized))?;
                info!(
                    run_id,
                    stage = %Stage::Materialized,
                    blob = self.blob_name,
                    "stage complete"
                );

                self.tables
                    .append_load(
                        self.blobs,
                        &LoadRequest {
                            source_blob: self.blob_name,
                            table: self.staging_table,
                            run_id,
                            create: CreateDisposition::CreateIfNeeded,
                        },
                    )
                    .map_err(failed(run_id, Stage::Loaded))?
            }
        };
        info!(
            run_id,
            stage = %Stage::Loaded,
            rows = load.rows,
            created = load.created,
            replayed = load.replayed,
            "stage complete"
        );

        let aggregates = aggregate::refresh(self.tables, self.staging_table, self.aggregate_table)
            .map_err(failed(run_id, Stage::Aggregated))?;
        info!(run_id, stage = %Stage::Aggregated, locations = aggregates, "pipeline finished");

        Ok(RunReport {
            run_id: run_id.to_string(),
            stage: Stage::Aggregated.to_string(),
            raw: raw.len(),
            normalized: batch.listings.len(),
            rejected: batch.rejected,
            staged: load.rows,
            replayed: load.replayed,
            aggregates,
            elapsed_ms: t0.elapsed().as_millis() as u64,
        })
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::memory::MemoryBlobStore;
    use crate::db::SqliteTableStore;
    use anyhow::Result;
    use async_trait::async_trait;

    struct FixturePages {
        html: String,
        fail: bool,
    }

    impl FixturePages {
        fn new() -> Self {
            Self {
                html: std::fs::read_to_string("tests/fixtures/listing_page.html").unwrap(),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl PageFetcher for FixturePages {
        async fn fetch_page(&self, _page: u32) -> Result<String> {
            if self.fail {
                anyhow::bail!("browser session crashed");
            }
            Ok(self.html.clone())
        }
    }

    fn pipeline<'a>(blobs: &'a MemoryBlobStore, tables: &'a SqliteTableStore) -> Pipeline<'a> {
        Pipeline {
            blobs,
            tables,
            blob_name: "rentals_data.ndjson",
            staging_table: "rentals_staging",
            aggregate_table: "rentals_transformed",
        }
    }

    fn pages(fetcher: &FixturePages, max_pages: u32) -> Source<'_> {
        Source::Pages {
            fetcher,
            max_pages,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn full_run_from_listing_page() {
        let blobs = MemoryBlobStore::default();
        let tables = SqliteTableStore::open_in_memory().unwrap();
        let fetcher = FixturePages::new();

        let report = pipeline(&blobs, &tables).run("run-1", pages(&fetcher, 1)).await.unwrap();

        assert_eq!(report.stage, "aggregate");
        assert_eq!(report.raw, 4);
        assert_eq!(report.normalized, 2);
        assert_eq!(report.rejected, 2);
        assert_eq!(report.staged, 2);
        assert_eq!(report.aggregates, 2);

        let staged = tables.fetch_staging("rentals_staging").unwrap();
        assert_eq!(staged[0].price, 7500.0);
        assert_eq!(staged[0].area, Some(85.0));
        assert_eq!(staged[1].area, Some(120.0));
        assert!(blobs.blobs.borrow().contains_key("rentals_data.ndjson"));
    }

    #[tokio::test]
    async fn runs_accumulate_in_staging() {
        let blobs = MemoryBlobStore::default();
        let tables = SqliteTableStore::open_in_memory().unwrap();
        let fetcher = FixturePages::new();
        let p = pipeline(&blobs, &tables);

        p.run("run-1", pages(&fetcher, 2)).await.unwrap();
        let second = p.run("run-2", pages(&fetcher, 1)).await.unwrap();

        assert_eq!(second.staged, 2);
        assert_eq!(tables.count_rows("rentals_staging").unwrap(), 6);
        let agg = tables.fetch_aggregates("rentals_transformed", None).unwrap();
        assert_eq!(agg.len(), 2);
        assert_eq!(agg[0].location, "Gauthier, Casablanca");
        assert_eq!(agg[0].avg_price, 12000.0);
    }

    #[tokio::test]
    async fn retried_run_is_not_staged_twice() {
        let blobs = MemoryBlobStore::default();
        let tables = SqliteTableStore::open_in_memory().unwrap();
        let fetcher = FixturePages::new();
        let p = pipeline(&blobs, &tables);

        p.run("run-1", pages(&fetcher, 1)).await.unwrap();
        let retry = p.run("run-1", pages(&fetcher, 1)).await.unwrap();

        assert!(retry.replayed);
        assert_eq!(tables.count_rows("rentals_staging").unwrap(), 2);
    }

    #[tokio::test]
    async fn retried_run_leaves_its_blob_alone() {
        let blobs = MemoryBlobStore::default();
        let tables = SqliteTableStore::open_in_memory().unwrap();
        let fetcher = FixturePages::new();
        let p = pipeline(&blobs, &tables);

        p.run("run-1", pages(&fetcher, 1)).await.unwrap();
        let staged_blob = blobs.blobs.borrow()["rentals_data.ndjson"].clone();
        blobs.fail_writes.set(true);

        let retry = p.run("run-1", pages(&fetcher, 2)).await.unwrap();

        assert!(retry.replayed);
        assert_eq!(retry.staged, 2);
        assert_eq!(blobs.blobs.borrow()["rentals_data.ndjson"], staged_blob);
    }

    #[tokio::test]
    async fn fetch_failure_stops_before_anything_is_written() {
        let blobs = MemoryBlobStore::default();
        let tables = SqliteTableStore::open_in_memory().unwrap();
        let mut fetcher = FixturePages::new();
        fetcher.fail = true;

        let err = pipeline(&blobs, &tables).run("run-1", pages(&fetcher, 3)).await.unwrap_err();

        assert_eq!(err.stage, Stage::Fetched);
        assert!(blobs.blobs.borrow().is_empty());
        assert!(!tables.table_exists("rentals_staging").unwrap());
    }

    #[tokio::test]
    async fn blob_failure_stops_before_load() {
        let blobs = MemoryBlobStore::default();
        blobs.fail_writes.set(true);
        let tables = SqliteTableStore::open_in_memory().unwrap();
        let fetcher = FixturePages::new();

        let err = pipeline(&blobs, &tables).run("run-1", pages(&fetcher, 1)).await.unwrap_err();

        assert_eq!(err.stage, Stage::Materialized);
        assert!(!tables.table_exists("rentals_staging").unwrap());
        assert!(!tables.table_exists("rentals_transformed").unwrap());
    }

    #[tokio::test]
    async fn schema_drift_stops_before_aggregate() {
        let blobs = MemoryBlobStore::default();
        let tables = SqliteTableStore::open_in_memory().unwrap();
        let legacy = br#"{"location":"Anfa","price":"9000 DH","area":null,"date":"x"}"#;
        blobs.write("legacy.ndjson", legacy).unwrap();
        tables
            .append_load(
                &blobs,
                &LoadRequest {
                    source_blob: "legacy.ndjson",
                    table: "rentals_staging",
                    run_id: "legacy",
                    create: CreateDisposition::CreateIfNeeded,
                },
            )
            .unwrap();
        let fetcher = FixturePages::new();

        let err = pipeline(&blobs, &tables).run("run-1", pages(&fetcher, 1)).await.unwrap_err();

        assert_eq!(err.stage, Stage::Loaded);
        assert!(err.to_string().contains("schema drift"));
        assert_eq!(tables.count_rows("rentals_staging").unwrap(), 1);
        assert!(!tables.table_exists("rentals_transformed").unwrap());
    }

    #[tokio::test]
    async fn empty_batch_still_aggregates() {
        let blobs = MemoryBlobStore::default();
        let tables = SqliteTableStore::open_in_memory().unwrap();
        let fetcher = FixturePages {
            html: "<html><body><ul></ul></body></html>".into(),
            fail: false,
        };

        let report = pipeline(&blobs, &tables).run("run-1", pages(&fetcher, 2)).await.unwrap();

        assert_eq!(report.normalized, 0);
        assert_eq!(report.aggregates, 0);
        assert!(tables.table_exists("rentals_transformed").unwrap());
    }

    #[test]
    fn run_ids_are_prefixed() {
        assert!(new_run_id().starts_with("run-"));
    }
}
