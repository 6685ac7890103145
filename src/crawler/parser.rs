//! HTML parsing and link discovery
//!
//! This module turns a fetched document into a queryable DOM and pulls the
//! links to follow out of it.

use super::fetcher::FetchedDocument;
use crate::url::resolve_link;
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// Parses a fetched document
///
/// HTML parsing is error-tolerant, so any decoded document yields a DOM.
/// The returned `Html` is not `Send`: keep it out of `.await` points.
pub fn parse_document(document: &FetchedDocument) -> Html {
    Html::parse_document(&document.body)
}

/// Collects the absolute targets of every element matching `selector`
///
/// # Link Extraction Rules
///
/// - The `href` attribute is read from the matched element, or from its
///   first `a[href]` descendant (so `li.next` works as well as `li.next > a`)
/// - `<a href="..." download>` is skipped
/// - `javascript:`, `mailto:`, `tel:`, data URIs and same-page fragments are skipped
/// - Relative links resolve against `base_url`
///
/// # Example
///
/// ```
/// use quarry::crawler::select_links;
/// use scraper::{Html, Selector};
/// use url::Url;
///
/// let html = Html::parse_document(r#"<ul><li class="next"><a href="/page/2/">Next</a></li></ul>"#);
/// let selector = Selector::parse("li.next").unwrap();
/// let base_url = Url::parse("http://quotes.test/page/1/").unwrap();
///
/// let links = select_links(&html, &selector, &base_url);
/// assert_eq!(links[0].as_str(), "http://quotes.test/page/2/");
/// ```
pub fn select_links(document: &Html, selector: &Selector, base_url: &Url) -> Vec<Url> {
    document
        .select(selector)
        .filter_map(link_target)
        .filter_map(|href| resolve_link(href, base_url))
        .collect()
}

fn link_target(element: ElementRef<'_>) -> Option<&str> {
    if element.value().attr("download").is_some() {
        return None;
    }
    if let Some(href) = element.value().attr("href") {
        return Some(href);
    }

    let anchor = Selector::parse("a[href]").ok()?;
    element
        .select(&anchor)
        .find(|a| a.value().attr("download").is_none())
        .and_then(|a| a.value().attr("href"))
}
