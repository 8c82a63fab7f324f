#![allow(dead_code)]

use newswire::{db, Feed, FeedFormat, FeedRegistry, IngestConfig, NormalizedEntry, Source};
use sqlx::SqlitePool;
use std::time::Duration;

pub async fn test_pool() -> SqlitePool {
    db::connect("sqlite::memory:")
        .await
        .expect("in-memory database")
}

/// Config with retries and backoff shrunk so failure paths don't slow the
/// suite down.
pub fn fast_config() -> IngestConfig {
    let mut config = IngestConfig::default();
    config.concurrency = 4;
    config.fetch.timeout = Duration::from_secs(5);
    config.fetch.retries = 0;
    config.fetch.retry_base = Duration::from_millis(1);
    config.extraction_attempts = 2;
    config.extraction_retry_base = Duration::from_millis(1);
    config
}

pub async fn seed_source(pool: &SqlitePool, name: &str) -> Source {
    FeedRegistry::new(pool.clone())
        .create_source(name, "https://example.com", None, None)
        .await
        .expect("create source")
}

pub async fn seed_feed(
    pool: &SqlitePool,
    source: &Source,
    name: &str,
    url: &str,
    format: FeedFormat,
) -> Feed {
    FeedRegistry::new(pool.clone())
        .create_feed(source, name, url, format, None, None)
        .await
        .expect("create feed")
}

pub fn entry(link: &str, title: &str) -> NormalizedEntry {
    NormalizedEntry {
        link: link.to_string(),
        title: title.to_string(),
        published: chrono::Utc::now(),
        summary: String::new(),
        content: String::new(),
        is_full_text: false,
        tags: Vec::new(),
    }
}

/// Minimal RSS 2.0 document with the given (title, link) items.
pub fn rss_document(items: &[(&str, &str)]) -> String {
    let mut body = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Example</title><link>https://example.com</link><description>Example feed</description>"#,
    );
    for (title, link) in items {
        body.push_str(&format!(
            "<item><title>{}</title><link>{}</link><description>Summary of {}</description></item>",
            title, link, title
        ));
    }
    body.push_str("</channel></rss>");
    body
}
