//! Identity keys derived from page URLs

use std::fmt;
use url::Url;

/// Page URL without query string or fragment.
///
/// Falls back to plain string splitting for input the URL parser rejects.
pub fn strip_query(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.into()
        }
        Err(_) => raw
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

/// `platform:query-stripped-url`, the scope of creation arbitration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UrlKey(String);

impl UrlKey {
    pub fn new(platform: &str, url: &str) -> Self {
        Self(format!("{}:{}", platform, strip_query(url)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UrlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// External ids a platform shows before it has assigned a real one
#[derive(Debug, Clone, Default)]
pub struct PlaceholderIds(Vec<String>);

impl PlaceholderIds {
    pub fn new(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(ids.into_iter().map(Into::into).collect())
    }

    pub fn is_placeholder(&self, external_id: &str) -> bool {
        let trimmed = external_id.trim();
        trimmed.is_empty() || self.0.iter().any(|p| p.eq_ignore_ascii_case(trimmed))
    }

    /// The external id, unless it is missing or a placeholder
    pub fn usable<'a>(&self, external_id: Option<&'a str>) -> Option<&'a str> {
        external_id.filter(|id| !self.is_placeholder(id))
    }
}
