pub mod fields;

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::error::ExtractionGap;
use crate::listing::RawListing;
use fields::FieldExtractor;

static ENTRY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("li.listingBox.w100").unwrap());

/// Pulls one [`RawListing`] out of every listing entry on a rendered page.
pub struct ListingExtractor {
    area: FieldExtractor,
    location: FieldExtractor,
    date: FieldExtractor,
    price: FieldExtractor,
}

impl Default for ListingExtractor {
    fn default() -> Self {
        Self {
            // Some cards carry the surface in the heading, others only in the blurb.
            area: FieldExtractor::new("area")
                .or_css("h4.listingH4.floatR")
                .or_css("p"),
            location: FieldExtractor::new("location").or_css("h3.listingH3"),
            date: FieldExtractor::new("date").or_css("span.listingDetails.iconPadR"),
            price: FieldExtractor::new("price").or_css("span.priceTag"),
        }
    }
}

impl ListingExtractor {
    /// Entries missing any field are skipped; page order is kept.
    pub fn extract_page(&self, html: &str) -> Vec<RawListing> {
        let document = Html::parse_document(html);
        let mut listings = Vec::new();
        let mut skipped = 0usize;

        for (i, entry) in document.select(&ENTRY).enumerate() {
            match self.extract_entry(entry) {
                Ok(listing) => listings.push(listing),
                Err(gap) => {
                    skipped += 1;
                    debug!(entry = i, %gap, "skipping listing entry");
                }
            }
        }

        debug!(found = listings.len(), skipped, "extracted page");
        listings
    }

    fn extract_entry(&self, entry: ElementRef<'_>) -> Result<RawListing, ExtractionGap> {
        Ok(RawListing {
            area_text: self.area.extract(entry)?,
            location: self.location.extract(entry)?,
            date_text: self.date.extract(entry)?,
            price_text: self.price.extract(entry)?,
        })
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.html", name)).unwrap()
    }

    #[test]
    fn listing_page_entries_in_order() {
        let listings = ListingExtractor::default().extract_page(&fixture("listing_page"));
        let locations: Vec<&str> = listings.iter().map(|l| l.location.as_str()).collect();
        assert_eq!(
            locations,
            [
                "Maarif, Casablanca",
                "Gauthier, Casablanca",
                "Racine, Casablanca",
                "Bourgogne, Casablanca"
            ]
        );
    }

    #[test]
    fn listing_page_fields() {
        let listings = ListingExtractor::default().extract_page(&fixture("listing_page"));
        let first = &listings[0];
        assert_eq!(first.area_text, "85 m²");
        assert_eq!(first.price_text, "7 500 DH");
        assert_eq!(first.date_text, "Publié il y a 2 jours");
    }

    #[test]
    fn area_read_from_blurb_when_heading_missing() {
        let listings = ListingExtractor::default().extract_page(&fixture("listing_page"));
        let gauthier = listings.iter().find(|l| l.location.starts_with("Gauthier")).unwrap();
        assert!(gauthier.area_text.contains("120 m²"));
    }

    #[test]
    fn entry_without_price_is_skipped() {
        let listings = ListingExtractor::default().extract_page(&fixture("listing_page"));
        assert!(listings.iter().all(|l| !l.location.starts_with("Anfa")));
    }

    #[test]
    fn placeholder_and_foreign_prices_pass_through_untouched() {
        let listings = ListingExtractor::default().extract_page(&fixture("listing_page"));
        assert_eq!(listings[2].price_text, "Prix à consulter");
        assert_eq!(listings[3].price_text, "800 EUR");
    }

    #[test]
    fn entry_without_any_area_text_is_skipped() {
        let listings = ListingExtractor::default().extract_page(&fixture("listing_page"));
        assert!(listings.iter().all(|l| !l.location.starts_with("Oasis")));
        assert_eq!(listings[1].location, "Gauthier, Casablanca");
    }

    #[test]
    fn entry_without_date_is_skipped() {
        let listings = ListingExtractor::default().extract_page(&fixture("listing_page"));
        assert!(listings.iter().all(|l| !l.location.starts_with("Palmier")));
        assert_eq!(listings.len(), 4);
    }

    #[test]
    fn gap_does_not_stop_later_entries() {
        let html = r#"<ul>
            <li class="listingBox w100"><h3 class="listingH3">A</h3>
                <span class="priceTag">1 DH</span>
                <span class="listingDetails iconPadR">hier</span></li>
            <li class="listingBox w100"><h4 class="listingH4 floatR">9 m²</h4>
                <h3 class="listingH3">B</h3><span class="priceTag">2 DH</span>
                <span class="listingDetails iconPadR">hier</span></li>
        </ul>"#;
        let listings = ListingExtractor::default().extract_page(html);
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].location, "B");
        assert_eq!(listings[0].area_text, "9 m²");
    }

    #[test]
    fn page_without_entries() {
        let html = "<html><body><p>Aucune annonce</p></body></html>";
        assert!(ListingExtractor::default().extract_page(html).is_empty());
    }
}
