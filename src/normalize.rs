use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::error::ValidationReject;
use crate::listing::{NormalizedListing, RawListing};

static AREA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([0-9]+)\s*m²").unwrap());

const LOCAL_CURRENCY: &str = "DH";
const FOREIGN_CURRENCIES: &[&str] = &["EUR", "€", "USD", "$"];
const UNAVAILABLE_SENTINELS: &[&str] = &["Prix à consulter"];

/// Result of normalizing one page range worth of raw listings.
#[derive(Debug, Default)]
pub struct Normalized {
    pub listings: Vec<NormalizedListing>,
    pub rejected: usize,
}

/// Turn a raw listing into a typed one, or say why it cannot be kept.
pub fn normalize(raw: &RawListing) -> Result<NormalizedListing, ValidationReject> {
    let price_text = raw.price_text.as_str();
    if FOREIGN_CURRENCIES.iter().any(|c| price_text.contains(c)) {
        return Err(ValidationReject::ForeignCurrency(price_text.to_string()));
    }
    if UNAVAILABLE_SENTINELS.iter().any(|s| price_text.contains(s)) {
        return Err(ValidationReject::PriceUnavailable(price_text.to_string()));
    }

    let price = parse_price(price_text)?;

    if raw.location.trim().is_empty() {
        return Err(ValidationReject::EmptyLocation);
    }

    Ok(NormalizedListing {
        location: raw.location.clone(),
        price,
        area: parse_area(&raw.area_text),
        date: raw.date_text.clone(),
    })
}

/// Normalize a batch; rejected records are counted and dropped, never raised.
pub fn normalize_all(raws: &[RawListing]) -> Normalized {
    let mut out = Normalized::default();
    for raw in raws {
        match normalize(raw) {
            Ok(listing) => out.listings.push(listing),
            Err(reject) => {
                out.rejected += 1;
                debug!(location = %raw.location, %reject, "dropping listing");
            }
        }
    }
    out
}

fn parse_price(text: &str) -> Result<f64, ValidationReject> {
    let digits: String = text
        .replace(LOCAL_CURRENCY, "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    match digits.parse::<f64>() {
        Ok(p) if p.is_finite() && p > 0.0 => Ok(p),
        _ => Err(ValidationReject::UnparsablePrice(text.to_string())),
    }
}

/// `None` when the text carries no `<int> m²`; a missing surface is not an error.
fn parse_area(text: &str) -> Option<f64> {
    AREA_RE
        .captures(text)
        .and_then(|caps| caps[1].parse::<f64>().ok())
}
