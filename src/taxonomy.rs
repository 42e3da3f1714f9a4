//! Classification of beacon target URLs into page types.

use crate::bucket::resolve_timestamp;

/// Page type for hits that no registered matcher claims.
pub const HOME: &str = "home";

/// Resource id counted for home-page hits.
pub const HOME_RESOURCE_ID: i64 = 1;

/// Where one hit landed in the site's taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonomyNode {
    pub page_type: String,
    /// Meaningful for detail/list pages; `HOME_RESOURCE_ID` otherwise.
    pub resource_id: i64,
    pub url: String,
    /// The beacon's `time` field, uninterpreted.
    pub time: String,
    /// `time` resolved to unix seconds; see [`resolve_timestamp`].
    pub timestamp: i64,
}

/// Recognizes one page type.
pub trait PageMatcher: Send + Sync {
    /// Returns the page type and resource id if `url` is this kind of page.
    fn classify(&self, url: &str) -> Option<(&str, i64)>;
}

/// Matches URLs containing `marker`; the resource id sits between the marker
/// and the next `suffix`, e.g. `/movie/12917.html`.
#[derive(Debug, Clone)]
pub struct PathMarker {
    page_type: &'static str,
    marker: &'static str,
    suffix: &'static str,
}

impl PathMarker {
    pub const fn new(page_type: &'static str, marker: &'static str, suffix: &'static str) -> Self {
        Self {
            page_type,
            marker,
            suffix,
        }
    }

    /// Malformed or non-numeric ids come out as 0.
    fn resource_id(&self, tail: &str) -> i64 {
        tail.find(self.suffix)
            .and_then(|end| tail[..end].parse().ok())
            .unwrap_or(0)
    }
}

impl PageMatcher for PathMarker {
    fn classify(&self, url: &str) -> Option<(&str, i64)> {
        let start = url.find(self.marker)? + self.marker.len();
        Some((self.page_type, self.resource_id(&url[start..])))
    }
}

/// Movie detail pages. Highest volume, so checked first.
pub const MOVIE: PathMarker = PathMarker::new("movie", "/movie/", ".html");

/// Movie list pages.
pub const LIST: PathMarker = PathMarker::new("list", "/list/", ".html");

/// Ordered set of matchers, falling back to [`HOME`].
pub struct Classifier {
    matchers: Vec<Box<dyn PageMatcher>>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::empty().with(MOVIE).with(LIST)
    }
}

impl Classifier {
    /// A classifier that calls everything the home page.
    pub fn empty() -> Self {
        Self {
            matchers: Vec::new(),
        }
    }

    /// Register another page type, tried after the existing ones and before
    /// the home fallback.
    pub fn with(mut self, matcher: impl PageMatcher + 'static) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }

    pub fn classify(&self, url: &str, time: &str) -> TaxonomyNode {
        let (page_type, resource_id) = self
            .matchers
            .iter()
            .find_map(|m| m.classify(url))
            .unwrap_or((HOME, HOME_RESOURCE_ID));
        TaxonomyNode {
            page_type: page_type.to_string(),
            resource_id,
            url: url.to_string(),
            time: time.to_string(),
            timestamp: resolve_timestamp(time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(url: &str) -> (String, i64) {
        let node = Classifier::default().classify(url, "t");
        (node.page_type, node.resource_id)
    }

    #[test]
    fn classifies_builtin_pages() {
        assert_eq!(kind("/movie/12917.html"), ("movie".into(), 12917));
        assert_eq!(kind("/list/42.html"), ("list".into(), 42));
        assert_eq!(kind("/"), ("home".into(), 1));
        assert_eq!(
            kind("http://localhost:8888/movie/7.html?from=home"),
            ("movie".into(), 7)
        );
    }

    #[test]
    fn list_id_uses_its_own_marker() {
        // "/list/" and "/movie/" have different lengths; the id must still be whole.
        assert_eq!(kind("/list/123456.html"), ("list".into(), 123456));
    }

    #[test]
    fn movie_wins_over_list() {
        assert_eq!(kind("/list/9/movie/3.html"), ("movie".into(), 3));
    }

    #[test]
    fn malformed_ids_degrade_to_zero() {
        assert_eq!(kind("/movie/abc.html"), ("movie".into(), 0));
        assert_eq!(kind("/movie/12917"), ("movie".into(), 0));
        assert_eq!(kind("/list/.html"), ("list".into(), 0));
    }

    #[test]
    fn keeps_url_and_time() {
        let node = Classifier::default().classify("/list/1.html", "1620000000");
        assert_eq!(node.url, "/list/1.html");
        assert_eq!(node.time, "1620000000");
        assert_eq!(node.timestamp, 1_620_000_000);
    }

    #[test]
    fn registered_types_precede_home() {
        let classifier = Classifier::default().with(PathMarker::new("actor", "/actor/", ".html"));
        let node = classifier.classify("/actor/88.html", "t");
        assert_eq!((node.page_type.as_str(), node.resource_id), ("actor", 88));
        assert_eq!(classifier.classify("/about", "t").page_type, HOME);
    }

    #[test]
    fn deterministic() {
        let c = Classifier::default();
        assert_eq!(c.classify("/movie/5.html", "1"), c.classify("/movie/5.html", "1"));
    }
}
