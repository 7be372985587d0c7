use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::extract::ListingExtractor;
use crate::fetcher::PageFetcher;
use crate::listing::RawListing;

/// Fetch pages `1..=max_pages` in order, pausing `delay` between requests.
///
/// A failed page aborts the whole fetch; retrying is left to whoever scheduled us.
pub async fn fetch_pages(
    fetcher: &dyn PageFetcher,
    max_pages: u32,
    delay: Duration,
) -> Result<Vec<String>> {
    let pb = ProgressBar::new(u64::from(max_pages));
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} pages")?
            .progress_chars("=> "),
    );

    let mut pages = Vec::with_capacity(max_pages as usize);
    for page in 1..=max_pages {
        if page > 1 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let start = Instant::now();
        let html = fetcher
            .fetch_page(page)
            .await
            .with_context(|| format!("Failed to fetch page {}", page))?;
        info!(
            page,
            bytes = html.len(),
            ms = start.elapsed().as_millis() as u64,
            "fetched page"
        );
        pages.push(html);
        pb.inc(1);
    }

    pb.finish_and_clear();
    Ok(pages)
}

/// Run the extractor over every fetched page, concatenating in page order.
pub fn extract_pages(extractor: &ListingExtractor, pages: &[String]) -> Vec<RawListing> {
    pages
        .iter()
        .flat_map(|html| extractor.extract_page(html))
        .collect()
}

/// Fetch and extract the full page range.
pub async fn scrape_listings(
    fetcher: &dyn PageFetcher,
    max_pages: u32,
    delay: Duration,
) -> Result<Vec<RawListing>> {
    let pages = fetch_pages(fetcher, max_pages, delay).await?;
    let listings = extract_pages(&ListingExtractor::default(), &pages);
    info!("Scraped {} listings from {} pages", listings.len(), pages.len());
    Ok(listings)
}

/// Pull already-scraped raw listings from a remote scraping endpoint.
pub async fn fetch_endpoint(url: &str) -> Result<String> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("Request to {} failed", url))?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("HTTP {} from {}", status, url);
    }
    resp.text().await.context("Failed to read endpoint body")
}

pub fn parse_endpoint_body(body: &str) -> Result<Vec<RawListing>> {
    serde_json::from_str(body).context("Endpoint did not return a listing array")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixturePages {
        requested: Mutex<Vec<u32>>,
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl PageFetcher for FixturePages {
        async fn fetch_page(&self, page: u32) -> Result<String> {
            self.requested.lock().unwrap().push(page);
            if self.fail_on == Some(page) {
                anyhow::bail!("connection reset");
            }
            Ok(std::fs::read_to_string("tests/fixtures/listing_page.html")?)
        }
    }

    #[tokio::test]
    async fn walks_page_range_in_order() {
        let fetcher = FixturePages { requested: Mutex::new(Vec::new()), fail_on: None };
        let listings = scrape_listings(&fetcher, 3, Duration::ZERO).await.unwrap();
        assert_eq!(*fetcher.requested.lock().unwrap(), [1, 2, 3]);
        assert_eq!(listings.len(), 12);
        assert_eq!(listings[4].location, listings[0].location);
    }

    #[tokio::test]
    async fn failed_page_aborts_fetch() {
        let fetcher = FixturePages { requested: Mutex::new(Vec::new()), fail_on: Some(2) };
        let err = fetch_pages(&fetcher, 3, Duration::ZERO).await.unwrap_err();
        assert!(err.to_string().contains("page 2"));
        assert_eq!(*fetcher.requested.lock().unwrap(), [1, 2]);
    }

    #[test]
    fn endpoint_body_uses_published_field_names() {
        let body = r#"[{"area":"85 m²","price":"1500 DH","location":"Casablanca","Date":"12/01"}]"#;
        let listings = parse_endpoint_body(body).unwrap();
        assert_eq!(
            listings,
            vec![RawListing {
                area_text: "85 m²".into(),
                price_text: "1500 DH".into(),
                location: "Casablanca".into(),
                date_text: "12/01".into(),
            }]
        );
    }

    #[test]
    fn endpoint_body_must_be_array() {
        assert!(parse_endpoint_body(r#"{"detail":"Not Found"}"#).is_err());
    }
}
