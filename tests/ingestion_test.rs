mod common;

use async_trait::async_trait;
use newswire::{
    CycleScope, EntityCatalog, EntityExtractor, ExtractedEntity, ExtractionConfig,
    ExtractionState, FeedFormat, FeedRegistry, HttpEntityExtractor, IngestError, ItemStore,
    Result, Scheduler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Extractor that always returns the same entities.
struct StaticExtractor {
    entities: Vec<ExtractedEntity>,
}

#[async_trait]
impl EntityExtractor for StaticExtractor {
    async fn extract(&self, _text: &str) -> Result<Vec<ExtractedEntity>> {
        Ok(self.entities.clone())
    }
}

/// Extractor that fails every call.
struct BrokenExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl EntityExtractor for BrokenExtractor {
    async fn extract(&self, _text: &str) -> Result<Vec<ExtractedEntity>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(IngestError::Extraction("service unavailable".to_string()))
    }
}

fn extracted(name: &str, type_label: &str) -> ExtractedEntity {
    ExtractedEntity {
        name: name.to_string(),
        type_label: type_label.to_string(),
        offset: None,
    }
}

async fn mount_feed(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

// The worked end-to-end example: one active feed with entries A and B where
// A is already stored. One cycle: 1 feed attempted, 1 created, 1 duplicate,
// 0 failed.
#[tokio::test]
async fn cycle_stores_new_entries_and_skips_known_links() {
    let pool = common::test_pool().await;
    let server = MockServer::start().await;

    let source = common::seed_source(&pool, "Example News").await;
    let feed_url = format!("{}/feed.xml", server.uri());
    let feed = common::seed_feed(&pool, &source, "Front page", &feed_url, FeedFormat::Rss).await;

    let store = ItemStore::new(pool.clone());
    store
        .acquire_or_skip(&common::entry("https://example.com/a", "First story"), &feed, &source)
        .await
        .unwrap();

    mount_feed(
        &server,
        "/feed.xml",
        common::rss_document(&[
            ("First story", "https://example.com/a"),
            ("Second story", "https://example.com/b"),
        ]),
    )
    .await;

    let scheduler = Scheduler::new(pool.clone(), &common::fast_config(), None).unwrap();
    let summary = scheduler.run_cycle(&CycleScope::All).await.unwrap();

    assert_eq!(summary.feeds_attempted, 1);
    assert_eq!(summary.items_created, 1);
    assert_eq!(summary.items_duplicate, 1);
    assert!(summary.feeds_failed.is_empty());
    // no credential configured: stored but never extracted
    assert_eq!(summary.extraction_skipped, 1);
    assert_eq!(summary.entities_linked, 0);

    let stored = store
        .get_by_link("https://example.com/b")
        .await
        .unwrap()
        .expect("item B stored");
    assert_eq!(stored.title, "Second story");
    assert_eq!(stored.slug, "second-story");
    assert_eq!(stored.feed_id, feed.id);
    assert_eq!(stored.source_id, source.id);
    assert_eq!(stored.extraction, ExtractionState::Skipped);
}

#[tokio::test]
async fn reingesting_the_same_document_creates_nothing() {
    let pool = common::test_pool().await;
    let server = MockServer::start().await;

    let source = common::seed_source(&pool, "Example News").await;
    let feed_url = format!("{}/feed.xml", server.uri());
    common::seed_feed(&pool, &source, "Front page", &feed_url, FeedFormat::Rss).await;

    mount_feed(
        &server,
        "/feed.xml",
        common::rss_document(&[
            ("First story", "https://example.com/a"),
            ("Second story", "https://example.com/b"),
        ]),
    )
    .await;

    let scheduler = Scheduler::new(pool.clone(), &common::fast_config(), None).unwrap();

    let first = scheduler.run_cycle(&CycleScope::All).await.unwrap();
    assert_eq!(first.items_created, 2);
    assert_eq!(first.items_duplicate, 0);

    let second = scheduler.run_cycle(&CycleScope::All).await.unwrap();
    assert_eq!(second.items_created, 0);
    assert_eq!(second.items_duplicate, 2);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn a_malformed_feed_does_not_abort_its_siblings() {
    let pool = common::test_pool().await;
    let server = MockServer::start().await;

    let source = common::seed_source(&pool, "Example News").await;
    let good_url = format!("{}/good.xml", server.uri());
    let bad_url = format!("{}/bad.xml", server.uri());
    common::seed_feed(&pool, &source, "Good", &good_url, FeedFormat::Rss).await;
    let bad = common::seed_feed(&pool, &source, "Bad", &bad_url, FeedFormat::Rss).await;

    mount_feed(
        &server,
        "/good.xml",
        common::rss_document(&[("Story", "https://example.com/story")]),
    )
    .await;
    mount_feed(&server, "/bad.xml", "this is not a feed".to_string()).await;

    let scheduler = Scheduler::new(pool.clone(), &common::fast_config(), None).unwrap();
    let summary = scheduler.run_cycle(&CycleScope::All).await.unwrap();

    assert_eq!(summary.feeds_attempted, 2);
    assert_eq!(summary.items_created, 1);
    assert_eq!(summary.feeds_failed.len(), 1);
    assert_eq!(summary.feeds_failed[0].url, bad_url);
    assert!(summary.feeds_failed[0].reason.contains("could not parse"));

    // failure recorded on the feed itself for operators
    let registry = FeedRegistry::new(pool.clone());
    let bad = registry.get_feed(bad.id).await.unwrap();
    assert!(bad.last_checked_at.is_some());
    assert!(bad.last_error.is_some());
}

#[tokio::test]
async fn declared_format_is_enforced() {
    let pool = common::test_pool().await;
    let server = MockServer::start().await;

    let source = common::seed_source(&pool, "Example News").await;
    let feed_url = format!("{}/feed.xml", server.uri());
    // declared atom, serves RSS
    common::seed_feed(&pool, &source, "Front page", &feed_url, FeedFormat::Atom).await;

    mount_feed(
        &server,
        "/feed.xml",
        common::rss_document(&[("Story", "https://example.com/story")]),
    )
    .await;

    let scheduler = Scheduler::new(pool.clone(), &common::fast_config(), None).unwrap();
    let summary = scheduler.run_cycle(&CycleScope::All).await.unwrap();

    assert_eq!(summary.items_created, 0);
    assert_eq!(summary.feeds_failed.len(), 1);
    assert!(summary.feeds_failed[0].reason.contains("declared atom"));
}

#[tokio::test]
async fn transport_failures_are_per_feed_failures() {
    let pool = common::test_pool().await;
    let server = MockServer::start().await;

    let source = common::seed_source(&pool, "Example News").await;
    // nothing mounted at this route: the server answers 404
    let feed_url = format!("{}/missing.xml", server.uri());
    common::seed_feed(&pool, &source, "Front page", &feed_url, FeedFormat::Rss).await;

    let scheduler = Scheduler::new(pool.clone(), &common::fast_config(), None).unwrap();
    let summary = scheduler.run_cycle(&CycleScope::All).await.unwrap();

    assert_eq!(summary.feeds_attempted, 1);
    assert_eq!(summary.feeds_failed.len(), 1);
    assert!(summary.feeds_failed[0].reason.contains("404"));
}

// A story cross-posted in two feeds lands exactly once; the losing pipeline
// sees a duplicate, not an error.
#[tokio::test]
async fn a_link_shared_by_two_feeds_is_stored_once() {
    let pool = common::test_pool().await;
    let server = MockServer::start().await;

    let source = common::seed_source(&pool, "Example News").await;
    let first_url = format!("{}/one.xml", server.uri());
    let second_url = format!("{}/two.xml", server.uri());
    common::seed_feed(&pool, &source, "One", &first_url, FeedFormat::Rss).await;
    common::seed_feed(&pool, &source, "Two", &second_url, FeedFormat::Rss).await;

    let shared = "https://example.com/cross-posted";
    mount_feed(&server, "/one.xml", common::rss_document(&[("Shared", shared)])).await;
    mount_feed(&server, "/two.xml", common::rss_document(&[("Shared", shared)])).await;

    let scheduler = Scheduler::new(pool.clone(), &common::fast_config(), None).unwrap();
    let summary = scheduler.run_cycle(&CycleScope::All).await.unwrap();

    assert_eq!(summary.items_created, 1);
    assert_eq!(summary.items_duplicate, 1);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE link = ?1")
        .bind(shared)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn extraction_reconciles_entities_into_the_catalog() {
    let pool = common::test_pool().await;
    let server = MockServer::start().await;

    let source = common::seed_source(&pool, "Example News").await;
    let feed_url = format!("{}/feed.xml", server.uri());
    common::seed_feed(&pool, &source, "Front page", &feed_url, FeedFormat::Rss).await;

    mount_feed(
        &server,
        "/feed.xml",
        common::rss_document(&[("Profile", "https://example.com/profile")]),
    )
    .await;

    // the duplicated (Jane Doe, person) pair must collapse to one entity
    let extractor = Arc::new(StaticExtractor {
        entities: vec![
            extracted("Jane Doe", "person"),
            extracted("Jane Doe", "person"),
            extracted("Acme", "organization"),
        ],
    });

    let scheduler = Scheduler::new(pool.clone(), &common::fast_config(), Some(extractor)).unwrap();
    let summary = scheduler.run_cycle(&CycleScope::All).await.unwrap();

    assert_eq!(summary.items_created, 1);
    assert_eq!(summary.entities_linked, 2);
    assert_eq!(summary.extraction_skipped, 0);
    assert_eq!(summary.extraction_deferred, 0);

    let store = ItemStore::new(pool.clone());
    let item = store
        .get_by_link("https://example.com/profile")
        .await
        .unwrap()
        .expect("item stored");
    assert_eq!(item.extraction, ExtractionState::Done);

    let catalog = EntityCatalog::new(pool.clone());
    let linked = catalog.entities_for_item(item.id).await.unwrap();
    assert_eq!(linked.len(), 2);

    let jane_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE slug = 'jane-doe'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(jane_count, 1);
}

#[tokio::test]
async fn failed_extraction_defers_the_item_and_a_later_pass_completes_it() {
    let pool = common::test_pool().await;
    let server = MockServer::start().await;

    let source = common::seed_source(&pool, "Example News").await;
    let feed_url = format!("{}/feed.xml", server.uri());
    common::seed_feed(&pool, &source, "Front page", &feed_url, FeedFormat::Rss).await;

    mount_feed(
        &server,
        "/feed.xml",
        common::rss_document(&[("Story", "https://example.com/story")]),
    )
    .await;

    let broken = Arc::new(BrokenExtractor {
        calls: AtomicUsize::new(0),
    });

    let config = common::fast_config();
    let scheduler = Scheduler::new(pool.clone(), &config, Some(broken.clone())).unwrap();
    let summary = scheduler.run_cycle(&CycleScope::All).await.unwrap();

    // extraction failure is not a feed failure, and the item is kept
    assert!(summary.feeds_failed.is_empty());
    assert_eq!(summary.items_created, 1);
    assert_eq!(summary.extraction_deferred, 1);
    assert_eq!(broken.calls.load(Ordering::SeqCst) as u32, config.extraction_attempts);

    let store = ItemStore::new(pool.clone());
    let item = store
        .get_by_link("https://example.com/story")
        .await
        .unwrap()
        .expect("item stored despite extraction failure");
    assert_eq!(item.extraction, ExtractionState::Deferred);

    // the service recovers; the retry pass finishes the job
    let working = Arc::new(StaticExtractor {
        entities: vec![extracted("Jane Doe", "person")],
    });
    let scheduler = Scheduler::new(pool.clone(), &config, Some(working)).unwrap();
    let retry = scheduler.retry_deferred().await.unwrap();

    assert_eq!(retry.attempted, 1);
    assert_eq!(retry.completed, 1);
    assert_eq!(retry.entities_linked, 1);
    assert_eq!(retry.still_deferred, 0);

    let item = store
        .get_by_link("https://example.com/story")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.extraction, ExtractionState::Done);
}

#[tokio::test]
async fn a_cycle_can_be_scoped_to_one_feed() {
    let pool = common::test_pool().await;
    let server = MockServer::start().await;

    let source = common::seed_source(&pool, "Example News").await;
    let first_url = format!("{}/one.xml", server.uri());
    let second_url = format!("{}/two.xml", server.uri());
    common::seed_feed(&pool, &source, "One", &first_url, FeedFormat::Rss).await;
    common::seed_feed(&pool, &source, "Two", &second_url, FeedFormat::Rss).await;

    mount_feed(
        &server,
        "/one.xml",
        common::rss_document(&[("Only this", "https://example.com/one")]),
    )
    .await;

    let scheduler = Scheduler::new(pool.clone(), &common::fast_config(), None).unwrap();
    let summary = scheduler
        .run_cycle(&CycleScope::Feed(first_url.clone()))
        .await
        .unwrap();

    assert_eq!(summary.feeds_attempted, 1);
    assert_eq!(summary.items_created, 1);
}

#[tokio::test]
async fn an_inactive_feed_is_not_polled_even_on_demand() {
    let pool = common::test_pool().await;
    let server = MockServer::start().await;

    let source = common::seed_source(&pool, "Example News").await;
    let feed_url = format!("{}/feed.xml", server.uri());
    let feed = common::seed_feed(&pool, &source, "Front page", &feed_url, FeedFormat::Rss).await;

    let registry = FeedRegistry::new(pool.clone());
    registry.set_active(feed.id, false).await.unwrap();

    let scheduler = Scheduler::new(pool.clone(), &common::fast_config(), None).unwrap();
    let summary = scheduler
        .run_cycle(&CycleScope::Feed(feed_url))
        .await
        .unwrap();

    assert_eq!(summary.feeds_attempted, 0);
    assert_eq!(summary.items_created, 0);
}

#[tokio::test]
async fn the_http_extractor_speaks_the_service_contract() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "entities": [
                {"name": "Jane Doe", "type": "person", "offset": 3},
                {"name": "Acme", "type": "organization"}
            ]
        })))
        .mount(&server)
        .await;

    let extractor = HttpEntityExtractor::new(&ExtractionConfig {
        endpoint: format!("{}/extract", server.uri()),
        api_key: "secret".to_string(),
    })
    .unwrap();

    let found = extractor.extract("Jane Doe joined Acme.").await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].name, "Jane Doe");
    assert_eq!(found[0].type_label, "person");
    assert_eq!(found[0].offset, Some(3));
    assert_eq!(found[1].offset, None);
}

#[tokio::test]
async fn the_http_extractor_surfaces_rate_limiting_as_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/extract"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let extractor = HttpEntityExtractor::new(&ExtractionConfig {
        endpoint: format!("{}/extract", server.uri()),
        api_key: "secret".to_string(),
    })
    .unwrap();

    let err = extractor.extract("some text").await.unwrap_err();
    assert!(matches!(err, IngestError::Extraction(_)));
}

#[tokio::test]
async fn feed_tags_are_attached_to_stored_items() {
    let pool = common::test_pool().await;
    let server = MockServer::start().await;

    let source = common::seed_source(&pool, "Example News").await;
    let feed_url = format!("{}/feed.xml", server.uri());
    common::seed_feed(&pool, &source, "Front page", &feed_url, FeedFormat::Rss).await;

    let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Example</title><link>https://example.com</link><description>d</description>
<item><title>Tagged</title><link>https://example.com/tagged</link><description>s</description>
<category>politics</category><category>economy</category></item>
</channel></rss>"#;
    mount_feed(&server, "/feed.xml", body.to_string()).await;

    let scheduler = Scheduler::new(pool.clone(), &common::fast_config(), None).unwrap();
    scheduler.run_cycle(&CycleScope::All).await.unwrap();

    let store = ItemStore::new(pool.clone());
    let item = store
        .get_by_link("https://example.com/tagged")
        .await
        .unwrap()
        .expect("item stored");
    let tags = store.tags_for_item(item.id).await.unwrap();
    assert_eq!(tags, vec!["economy".to_string(), "politics".to_string()]);
}
