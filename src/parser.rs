use crate::types::{FeedFormat, IngestError, NormalizedEntry, Result};
use chrono::Utc;
use feed_rs::model::FeedType;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Parse a raw feed document into normalized entries, enforcing the feed's
/// declared format. Formats are declared per feed record, not sniffed: a
/// document that turns out to be some other syndication flavor is a parse
/// failure for that feed.
///
/// Per-entry tolerance: a missing or malformed timestamp falls back to now,
/// missing summary/body become empty strings, and an entry without a link is
/// skipped, having no identity to deduplicate on. None of these fail the
/// whole feed.
pub fn parse_document(body: &str, declared: FeedFormat, url: &str) -> Result<Vec<NormalizedEntry>> {
    let feed = feed_rs::parser::parse(body.as_bytes()).map_err(|e| IngestError::Parse {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let format_matches = match declared {
        FeedFormat::Rss => matches!(
            feed.feed_type,
            FeedType::RSS0 | FeedType::RSS1 | FeedType::RSS2
        ),
        FeedFormat::Atom => feed.feed_type == FeedType::Atom,
    };
    if !format_matches {
        return Err(IngestError::Parse {
            url: url.to_string(),
            reason: format!(
                "document parses as {:?} but the feed is declared {}",
                feed.feed_type, declared
            ),
        });
    }

    let now = Utc::now();
    let mut seen_links = HashSet::new();
    let mut entries = Vec::new();

    for entry in feed.entries {
        let link = match entry.links.first() {
            Some(link) => link.href.clone(),
            None => {
                warn!("skipping entry without a link in {}", url);
                continue;
            }
        };
        if !seen_links.insert(link.clone()) {
            debug!("skipping repeated link {} within {}", link, url);
            continue;
        }

        let title = entry
            .title
            .map(|t| t.content)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string());

        let published = entry.published.or(entry.updated).unwrap_or(now);

        let summary = entry.summary.map(|s| s.content).unwrap_or_default();

        // An entry that carries a content body is the full text; otherwise
        // the summary doubles as a teaser body.
        let (content, is_full_text) = match entry.content.and_then(|c| c.body) {
            Some(body) => (body, true),
            None => (summary.clone(), false),
        };

        let tags: Vec<String> = entry
            .categories
            .into_iter()
            .map(|c| c.term)
            .filter(|t| !t.trim().is_empty())
            .collect();

        entries.push(NormalizedEntry {
            link,
            title,
            published,
            summary,
            content,
            is_full_text,
            tags,
        });
    }

    debug!("parsed {} entries from {}", entries.len(), url);
    Ok(entries)
}
