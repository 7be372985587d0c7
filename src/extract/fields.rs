use scraper::{ElementRef, Selector};

use crate::error::ExtractionGap;

/// One way of reading a field's text out of a listing entry.
pub trait TextSource: Send + Sync {
    fn read(&self, entry: ElementRef<'_>) -> Option<String>;
}

/// Text of the first descendant matching a CSS selector.
pub struct CssText(pub Selector);

impl CssText {
    pub fn parse(css: &str) -> Self {
        // Selectors are compile-time constants in this crate.
        CssText(Selector::parse(css).unwrap_or_else(|e| panic!("bad selector {css:?}: {e}")))
    }
}

impl TextSource for CssText {
    fn read(&self, entry: ElementRef<'_>) -> Option<String> {
        let el = entry.select(&self.0).next()?;
        let text = collapse_whitespace(&el.text().collect::<String>());
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// A named field read with an ordered list of strategies; first hit wins.
pub struct FieldExtractor {
    field: &'static str,
    sources: Vec<Box<dyn TextSource>>,
}

impl FieldExtractor {
    pub fn new(field: &'static str) -> Self {
        Self {
            field,
            sources: Vec::new(),
        }
    }

    pub fn or_source(mut self, source: impl TextSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn or_css(self, css: &str) -> Self {
        self.or_source(CssText::parse(css))
    }

    pub fn extract(&self, entry: ElementRef<'_>) -> Result<String, ExtractionGap> {
        self.sources
            .iter()
            .find_map(|s| s.read(entry))
            .ok_or(ExtractionGap { field: self.field })
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
