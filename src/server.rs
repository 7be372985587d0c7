use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::{error, info};

use crate::config::Settings;
use crate::fetcher;
use crate::listing::RawListing;
use crate::scrape;

#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("scrape request failed: {:#}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", self.0)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self {
        AppError(err.into())
    }
}

pub fn router(settings: Settings) -> Router {
    Router::new()
        .route("/", get(scrape_listings))
        .route("/health", get(|| async { "ok" }))
        .with_state(AppState {
            settings: Arc::new(settings),
        })
}

/// Scrape the configured page range and return the raw listings.
async fn scrape_listings(State(state): State<AppState>) -> Result<Json<Vec<RawListing>>, AppError> {
    let settings = &state.settings;
    // One fetcher per request, released when the handler returns.
    let fetcher = fetcher::open(settings)?;
    let listings = scrape::scrape_listings(
        fetcher.as_ref(),
        settings.max_pages,
        Duration::from_millis(settings.page_delay_ms),
    )
    .await?;
    Ok(Json(listings))
}

pub async fn serve(settings: Settings) -> anyhow::Result<()> {
    let addr = settings.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Serving listings on http://{}", listener.local_addr()?);
    axum::serve(listener, router(settings)).await?;
    Ok(())
}
