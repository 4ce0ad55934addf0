//! Admission dimensions: a named concurrency axis plus the rule that derives
//! its key from a candidate row.

use crate::admission::scoreboard::Scoreboard;
use crate::store::WorkRow;
use std::fmt;
use std::sync::Arc;
use url::Url;

pub const BY_SOURCE: &str = "by-source";
pub const BY_HOST: &str = "by-host";

type KeyExtractor = Arc<dyn Fn(&WorkRow) -> Option<String> + Send + Sync>;

/// One independent axis of concurrency limiting.
///
/// The extractor runs once per row when the ready list is refilled; a `None`
/// key means the dimension does not apply to that item and never blocks it.
#[derive(Clone)]
pub struct Dimension {
    name: String,
    limit: usize,
    extract: KeyExtractor,
}

impl Dimension {
    pub fn new(
        name: impl Into<String>,
        limit: usize,
        extract: impl Fn(&WorkRow) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            limit,
            extract: Arc::new(extract),
        }
    }

    /// Caps concurrent work per owning source.
    pub fn by_source(limit: usize) -> Self {
        Self::new(BY_SOURCE, limit, |row| Some(row.source_id.to_string()))
    }

    /// Caps concurrent work per target host, derived from the item URL.
    /// Unparseable URLs and URLs without a host yield no key.
    pub fn by_host(limit: usize) -> Self {
        Self::new(BY_HOST, limit, |row| {
            Url::parse(&row.url)
                .ok()
                .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn extract(&self, row: &WorkRow) -> Option<String> {
        (self.extract)(row)
    }

    /// Fresh scoreboard enforcing this dimension's cap.
    pub fn scoreboard(&self) -> Scoreboard {
        Scoreboard::new(self.name.clone(), self.limit)
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dimension")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(url: &str) -> WorkRow {
        WorkRow {
            id: 1,
            source_id: 9,
            url: url.to_string(),
            next_eligible_at: None,
        }
    }

    #[test]
    fn by_source_uses_the_owning_source_id() {
        let dim = Dimension::by_source(3);
        assert_eq!(dim.extract(&row("https://a.com/feed")), Some("9".into()));
        assert_eq!(dim.name(), BY_SOURCE);
    }

    #[test]
    fn by_host_lowercases_the_host() {
        let dim = Dimension::by_host(5);
        assert_eq!(
            dim.extract(&row("https://Feeds.Example.COM/rss.xml")),
            Some("feeds.example.com".into())
        );
    }

    #[test]
    fn by_host_is_absent_when_the_url_does_not_parse() {
        let dim = Dimension::by_host(5);
        assert_eq!(dim.extract(&row("not a url")), None);
        assert_eq!(dim.extract(&row("unix:/var/run/feed.sock")), None);
    }

    #[test]
    fn scoreboard_inherits_name_and_limit() {
        let board = Dimension::by_host(5).scoreboard();
        assert_eq!(board.dimension(), BY_HOST);
        assert_eq!(board.limit(), 5);
    }
}
