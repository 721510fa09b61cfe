//! Integration tests for complete polling cycles: fetch, parse, export.
//!
//! Each test starts its own mock HTTP server and session, so no state is
//! shared between tests.

use feedrelay::{
    feed, Config, CursorStore, Destinations, ExportOptions, FetchOptions, Fetcher, RetryPolicy,
    Session, SourceRegistry,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeMap;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rss(guids: &[&str]) -> String {
    let items: String = guids
        .iter()
        .map(|g| {
            format!(
                "<item><title>Post {g}</title><link>https://example.com/{g}</link>\
                 <guid>{g}</guid><pubDate>Mon, 01 Jan 2024 00:00:00 +0000</pubDate>\
                 <description>About {g}</description></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Feed</title>{items}</channel></rss>"#
    )
}

fn fetcher() -> Fetcher {
    Fetcher::new(FetchOptions::default()).unwrap()
}

async fn serve(server: &MockServer, route: &str, status: u16, body: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(server)
        .await;
}

fn guids(items: &[feedrelay::FeedItem]) -> Vec<&str> {
    items.iter().map(|i| i.guid.as_str()).collect()
}

// ============================================================================
// Deduplication across cycles
// ============================================================================

#[tokio::test]
async fn test_second_cycle_emits_nothing_for_unchanged_feed() {
    let server = MockServer::start().await;
    serve(&server, "/rss", 200, &rss(&["g3", "g2", "g1"])).await;

    let sources = SourceRegistry::from([("feedA".to_string(), format!("{}/rss", server.uri()))]);
    let mut session = Session::new(sources, Destinations::new());
    let fetcher = fetcher();

    fetcher.fetch(&mut session, None).await.unwrap();
    let first = feed::parse(&mut session).unwrap();
    assert_eq!(guids(&first["feedA"]), vec!["g3", "g2", "g1"]);
    assert_eq!(session.cursor("feedA").unwrap().last(), "g1");

    fetcher.fetch(&mut session, None).await.unwrap();
    let second = feed::parse(&mut session).unwrap();
    assert!(second["feedA"].is_empty());
}

#[tokio::test]
async fn test_new_items_between_cycles_are_emitted_once() {
    let server = MockServer::start().await;
    Mock::given(path("/rss"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss(&["g2", "g1"])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    serve(&server, "/rss", 200, &rss(&["g4", "g3", "g2", "g1"])).await;

    let sources = SourceRegistry::from([("feedA".to_string(), format!("{}/rss", server.uri()))]);
    let mut session = Session::new(sources, Destinations::new());
    let fetcher = fetcher();

    fetcher.fetch(&mut session, None).await;
    feed::parse(&mut session);

    fetcher.fetch(&mut session, None).await;
    let parsed = feed::parse(&mut session).unwrap();
    assert_eq!(guids(&parsed["feedA"]), vec!["g4", "g3"]);

    fetcher.fetch(&mut session, None).await;
    let parsed = feed::parse(&mut session).unwrap();
    assert!(parsed["feedA"].is_empty());
}

#[tokio::test]
async fn test_persisted_cursors_survive_a_new_session() {
    let server = MockServer::start().await;
    serve(&server, "/rss", 200, &rss(&["g2", "g1"])).await;

    let sources = SourceRegistry::from([("feedA".to_string(), format!("{}/rss", server.uri()))]);
    let fetcher = fetcher();

    let mut first = Session::new(sources.clone(), Destinations::new());
    fetcher.fetch(&mut first, None).await;
    feed::parse(&mut first);
    let saved = serde_json::to_string(first.cursors()).unwrap();

    let restored: CursorStore = serde_json::from_str(&saved).unwrap();
    let mut second = Session::new(sources, Destinations::new()).with_cursors(restored);
    fetcher.fetch(&mut second, None).await;
    let parsed = feed::parse(&mut second).unwrap();
    assert!(parsed["feedA"].is_empty());
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn test_503_source_is_excluded_from_cycle() {
    let server = MockServer::start().await;
    serve(&server, "/ok", 200, &rss(&["a1"])).await;
    serve(&server, "/down", 503, "Service Unavailable").await;

    let sources = SourceRegistry::from([
        ("up".to_string(), format!("{}/ok", server.uri())),
        ("down".to_string(), format!("{}/down", server.uri())),
    ]);
    let mut session = Session::new(sources, Destinations::new());
    let fetcher = fetcher();

    let raw = fetcher.fetch(&mut session, None).await.unwrap();
    assert_eq!(raw.keys().collect::<Vec<_>>(), vec!["up"]);

    feed::parse(&mut session);
    let export = session.export(ExportOptions::default());
    let data = export.data.unwrap();
    assert_eq!(data.keys().collect::<Vec<_>>(), vec!["up"]);
    assert_eq!(guids(&data["up"]), vec!["a1"]);
}

#[tokio::test]
async fn test_malformed_feed_does_not_affect_others() {
    let server = MockServer::start().await;
    serve(&server, "/good", 200, &rss(&["b1", "b2"])).await;
    serve(&server, "/broken", 200, "<rss><channel><item><title>cut off").await;

    let sources = SourceRegistry::from([
        ("a".to_string(), format!("{}/broken", server.uri())),
        ("b".to_string(), format!("{}/good", server.uri())),
    ]);
    let mut session = Session::new(sources, Destinations::new());
    let fetcher = fetcher();

    fetcher.fetch(&mut session, None).await;
    let parsed = feed::parse(&mut session).unwrap();
    assert!(!parsed.contains_key("a"));
    assert_eq!(guids(&parsed["b"]), vec!["b1", "b2"]);

    let export = session.export(ExportOptions {
        data: false,
        failures: true,
        ..ExportOptions::default()
    });
    let failures = export.failures.unwrap();
    assert!(failures.contains_key("a"));
    assert!(!failures.contains_key("b"));
}

#[tokio::test]
async fn test_unreachable_source_does_not_abort_batch() {
    // Bind then drop a listener so the port is closed
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let server = MockServer::start().await;
    serve(&server, "/rss", 200, &rss(&["x"])).await;

    let sources = SourceRegistry::from([
        ("dead".to_string(), format!("http://127.0.0.1:{dead_port}/rss")),
        ("alive".to_string(), format!("{}/rss", server.uri())),
    ]);
    let mut session = Session::new(sources, Destinations::new());

    let raw = fetcher().fetch(&mut session, None).await.unwrap();
    assert!(raw.contains_key("alive"));
    assert!(!raw.contains_key("dead"));
    assert!(session.failures().contains_key("dead"));
}

async fn flaky_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(path("/flaky"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    serve(&server, "/flaky", 200, &rss(&["r1"])).await;
    server
}

#[tokio::test]
async fn test_retry_policy_is_opt_in() {
    // Without retries the first 502 fails the source
    let server = flaky_server().await;
    let sources = SourceRegistry::from([("flaky".to_string(), format!("{}/flaky", server.uri()))]);
    let mut session = Session::new(sources, Destinations::new());
    let raw = fetcher().fetch(&mut session, None).await.unwrap();
    assert!(raw.is_empty());

    // With retries the second attempt succeeds
    let server = flaky_server().await;
    let sources = SourceRegistry::from([("flaky".to_string(), format!("{}/flaky", server.uri()))]);
    let retrying = Fetcher::new(FetchOptions {
        retry: RetryPolicy {
            backoff_ms: 1,
            ..RetryPolicy::standard()
        },
        ..FetchOptions::default()
    })
    .unwrap();
    let mut session = Session::new(sources, Destinations::new());
    let raw = retrying.fetch(&mut session, None).await.unwrap();
    assert!(raw.contains_key("flaky"));
}

// ============================================================================
// Configuration and export
// ============================================================================

#[tokio::test]
async fn test_cycle_from_config() {
    let server = MockServer::start().await;
    serve(&server, "/rss", 200, &rss(&["c1"])).await;

    let toml = format!(
        r#"
cursor_capacity = 8

[sources]
news = "{}/rss"
paused = ""

[destinations.qq]
groups = ["group1"]
"#,
        server.uri()
    );
    let config = Config::from_toml(&toml).unwrap();
    let mut session = Session::from_config(&config);
    let fetcher = Fetcher::from_config(&config).unwrap();

    let raw = fetcher.fetch(&mut session, None).await.unwrap();
    assert!(!raw.contains_key("paused"));
    feed::parse(&mut session);

    let value = serde_json::to_value(session.export(ExportOptions::all())).unwrap();
    assert_eq!(value["data"]["news"][0]["guid"], "c1");
    assert_eq!(value["data"]["news"][0]["pubDate"], "Mon, 01 Jan 2024 00:00:00 +0000");
    assert_eq!(value["destinations"], json!({"qq": {"groups": ["group1"]}}));
    assert_eq!(value["cursors"], json!({"news": ["c1"]}));
    assert!(value["fetched_at"].is_string());
    assert_eq!(session.cursor("news").unwrap().capacity(), 8);
}

#[tokio::test]
async fn test_update_then_fetch_uses_new_registry() {
    let server = MockServer::start().await;
    serve(&server, "/one", 200, &rss(&["1"])).await;
    serve(&server, "/two", 200, &rss(&["2"])).await;

    let mut session = Session::new(
        SourceRegistry::from([("one".to_string(), format!("{}/one", server.uri()))]),
        Destinations::new(),
    );
    session.update(
        Some(SourceRegistry::from([("two".to_string(), format!("{}/two", server.uri()))])),
        Some(BTreeMap::from([("two".to_string(), json!(["chan"]))])),
    );

    let raw = fetcher().fetch(&mut session, None).await.unwrap();
    assert_eq!(raw.keys().collect::<Vec<_>>(), vec!["two"]);
    assert_eq!(session.destinations()["two"], json!(["chan"]));
}

#[tokio::test]
async fn test_independent_sessions_share_one_fetcher() {
    let server = MockServer::start().await;
    serve(&server, "/a", 200, &rss(&["a1"])).await;
    serve(&server, "/b", 200, &rss(&["b1"])).await;

    let fetcher = fetcher();
    let mut left = Session::new(
        SourceRegistry::from([("a".to_string(), format!("{}/a", server.uri()))]),
        Destinations::new(),
    );
    let mut right = Session::new(
        SourceRegistry::from([("b".to_string(), format!("{}/b", server.uri()))]),
        Destinations::new(),
    );

    let (l, r) = tokio::join!(fetcher.fetch(&mut left, None), fetcher.fetch(&mut right, None));
    assert!(l.unwrap().contains_key("a"));
    assert!(r.unwrap().contains_key("b"));

    assert_eq!(guids(&feed::parse(&mut left).unwrap()["a"]), vec!["a1"]);
    assert_eq!(guids(&feed::parse(&mut right).unwrap()["b"]), vec!["b1"]);
}

#[tokio::test]
async fn test_no_sources_means_nothing_to_do() {
    let mut session = Session::new(SourceRegistry::new(), Destinations::new());
    assert!(fetcher().fetch(&mut session, None).await.is_none());
    assert!(feed::parse(&mut session).is_none());
}
