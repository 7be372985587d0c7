use std::path::PathBuf;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

const DEFAULT_BASE_URL: &str =
    "https://www.mubawab.ma/fr/ct/casablanca/immobilier-a-louer:p:{page}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetcherKind {
    Http,
    Browserless,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Page URL template; `{page}` is replaced by the 1-based page number.
    pub base_url: String,
    pub max_pages: u32,
    pub page_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub fetcher: FetcherKind,
    pub browserless_url: String,
    pub browserless_token: Option<String>,
    pub blob_dir: PathBuf,
    pub blob_name: String,
    pub db_path: PathBuf,
    pub staging_table: String,
    pub aggregate_table: String,
    pub listen_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            max_pages: 3,
            page_delay_ms: 3000,
            request_timeout_secs: 30,
            fetcher: FetcherKind::Http,
            browserless_url: "http://localhost:3000".to_string(),
            browserless_token: None,
            blob_dir: PathBuf::from("data/blobs"),
            blob_name: "rentals_data.ndjson".to_string(),
            db_path: PathBuf::from("data/rentals.sqlite"),
            staging_table: "rentals_staging".to_string(),
            aggregate_table: "rentals_transformed".to_string(),
            listen_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then `rentals.toml` if present, then `RENTALS_*` variables.
    pub fn load() -> Result<Self> {
        Config::builder()
            .add_source(File::with_name("rentals").required(false))
            .add_source(Environment::with_prefix("RENTALS"))
            .build()
            .context("Failed to read settings")?
            .try_deserialize()
            .context("Invalid settings")
    }
}

pub fn page_url(template: &str, page: u32) -> String {
    template.replace("{page}", &page.to_string())
}
