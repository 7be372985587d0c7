use serde::{Deserialize, Serialize};

/// One scraped entry, every field as the page rendered it.
///
/// Serialised with the field names the scraping endpoint has always served
/// (`area`, `price`, `location`, `Date`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    #[serde(rename = "area")]
    pub area_text: String,
    #[serde(rename = "price")]
    pub price_text: String,
    pub location: String,
    #[serde(rename = "Date")]
    pub date_text: String,
}

/// A validated listing. `price` is in dirhams, `area` in square meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub location: String,
    pub price: f64,
    pub area: Option<f64>,
    pub date: String,
}

/// Per-location summary row of the aggregate table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRow {
    pub location: String,
    pub avg_price: f64,
    pub max_price: f64,
    pub min_price: f64,
    pub most_common_area: Option<f64>,
}
