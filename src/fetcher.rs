use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::config::{page_url, FetcherKind, Settings};

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0 Safari/537.36";

/// Source of rendered listing pages. One instance serves one run and is dropped with it.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, page: u32) -> Result<String>;
}

/// Open the fetcher configured in `settings`.
pub fn open(settings: &Settings) -> Result<Box<dyn PageFetcher>> {
    let fetcher: Box<dyn PageFetcher> = match settings.fetcher {
        FetcherKind::Http => Box::new(HttpPageFetcher::new(settings)?),
        FetcherKind::Browserless => Box::new(BrowserlessPageFetcher::new(settings)?),
    };
    Ok(fetcher)
}

/// Plain GET of the page URL; enough when the listing markup is server-rendered.
pub struct HttpPageFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPageFetcher {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("text/html,application/xhtml+xml"),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("fr-FR,fr;q=0.9"),
        );

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&self, page: u32) -> Result<String> {
        let url = page_url(&self.base_url, page);
        debug!(%url, "GET listing page");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Request failed for {}", url))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("HTTP {} for {}", status, url);
        }
        resp.text()
            .await
            .with_context(|| format!("Failed to read body of {}", url))
    }
}

/// Renders the page in a headless browser behind a Browserless `/content` endpoint.
pub struct BrowserlessPageFetcher {
    client: reqwest::Client,
    endpoint: String,
    base_url: String,
}

impl BrowserlessPageFetcher {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let mut endpoint = format!("{}/content", settings.browserless_url.trim_end_matches('/'));
        if let Some(token) = &settings.browserless_token {
            endpoint.push_str(&format!("?token={token}"));
        }

        Ok(Self {
            client,
            endpoint,
            base_url: settings.base_url.clone(),
        })
    }
}

#[async_trait]
impl PageFetcher for BrowserlessPageFetcher {
    async fn fetch_page(&self, page: u32) -> Result<String> {
        let url = page_url(&self.base_url, page);
        debug!(%url, "render listing page");
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .context("Browserless request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            bail!("Browserless HTTP {} for {}: {}", status, url, message);
        }
        resp.text().await.context("Failed to read rendered page")
    }
}
