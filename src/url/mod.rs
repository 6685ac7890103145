//! URL handling module for Quarry
//!
//! This module provides URL normalization, host keys for politeness
//! bookkeeping, and resolution of links found on a page.

mod normalize;

pub use normalize::{normalize_parsed, normalize_url};

use url::Url;

/// Returns the politeness key of a URL: its host, plus the port when it is not
/// the scheme default
///
/// # Examples
///
/// ```
/// use quarry::url::host_key;
/// use url::Url;
///
/// let url = Url::parse("http://Test.Site:8080/page").unwrap();
/// assert_eq!(host_key(&url).as_deref(), Some("test.site:8080"));
/// ```
pub fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// Resolves a link href against the page it was found on
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel: schemes
/// - data: URIs
/// - fragment-only links (same page anchors)
/// - invalid URLs
/// - non-HTTP(S) URLs after resolution
pub fn resolve_link(href: &str, base_url: &Url) -> Option<Url> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lower = href.to_ascii_lowercase();
    if lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
        || lower.starts_with("data:")
    {
        return None;
    }

    let absolute_url = base_url.join(href).ok()?;
    match absolute_url.scheme() {
        "http" | "https" => Some(absolute_url),
        _ => None,
    }
}
