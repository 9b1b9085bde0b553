//! Page text sources and counter extraction.

pub mod extract;

use async_trait::async_trait;
use bostad_core::CounterPair;
use bostad_storage::{FetchError, FetchOptions, HttpFetcher};
use scraper::{Html, Selector};

pub use extract::{
    extract, parse_count, Counter, ExtractionError, ExtractionPattern, PatternError, PatternSet,
};

pub const CRATE_NAME: &str = "bostad-adapters";

pub const PRIMARY_SOURCE_ID: &str = "booli";
pub const SECONDARY_SOURCE_ID: &str = "hemnet";

const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "head"];

/// Turns a URL into the text a reader would see on the rendered page.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render_text(&self, url: &str, options: &FetchOptions) -> Result<String, FetchError>;
}

#[async_trait]
impl PageRenderer for HttpFetcher {
    async fn render_text(&self, url: &str, options: &FetchOptions) -> Result<String, FetchError> {
        let page = self.fetch_page(url, options).await?;
        Ok(visible_text(&page.text()))
    }
}

/// Collapse the body's text nodes into one line of space-separated words.
/// Script, style and template content is dropped.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = Selector::parse("body")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .unwrap_or_else(|| document.root_element());

    let mut words: Vec<&str> = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| SKIPPED_ELEMENTS.contains(&e.name()))
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}

/// A page to fetch plus the patterns that read its counters.
#[derive(Debug, Clone)]
pub struct CounterSource {
    pub source_id: &'static str,
    pub url: String,
    pub options: FetchOptions,
    patterns: &'static PatternSet,
}

impl CounterSource {
    pub fn new(
        source_id: &'static str,
        url: impl Into<String>,
        options: FetchOptions,
        patterns: &'static PatternSet,
    ) -> Self {
        Self {
            source_id,
            url: url.into(),
            options,
            patterns,
        }
    }

    pub fn primary(url: impl Into<String>, options: FetchOptions) -> Self {
        Self::new(PRIMARY_SOURCE_ID, url, options, PatternSet::primary())
    }

    pub fn secondary(url: impl Into<String>, options: FetchOptions) -> Self {
        Self::new(SECONDARY_SOURCE_ID, url, options, PatternSet::secondary())
    }

    pub fn patterns(&self) -> &PatternSet {
        self.patterns
    }

    pub async fn fetch_text(&self, renderer: &dyn PageRenderer) -> Result<String, FetchError> {
        renderer.render_text(&self.url, &self.options).await
    }

    pub fn extract(&self, page_text: &str) -> Result<CounterPair, ExtractionError> {
        self.patterns.extract(page_text)
    }
}
