//! Integration tests for the crawler
//!
//! These tests use wiremock to create mock HTTP servers and test
//! the full crawl cycle end-to-end, from TOML configuration to the
//! JSON Lines dataset on disk.

use quarry::config::{load_config_with_hash, parse_config, Config};
use quarry::crawler::{crawl, AbortReason, Coordinator, RunState};
use quarry::storage::{open_storage, RunStatus, Storage};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Builds a quotes-crawling configuration rooted at `seed`
fn create_test_config(seed: &str, dir: &TempDir, extra_crawler: &str) -> String {
    format!(
        r#"
[crawler]
seed-urls = ["{seed}"]
max-concurrency = 3
retry-backoff-ms = 10
fetch-timeout-ms = 5000
{extra_crawler}

[user-agent]
crawler-name = "TestBot"
crawler-version = "1.0.0"
contact-url = "https://example.com/contact"
contact-email = "test@example.com"

[output]
dataset-path = "{dataset}"
state-path = "{state}"

[extract]
record-selector = "div.quote"
follow-link-selector = "li.next a"

[[extract.fields]]
name = "text"
selector = "span.text"

[[extract.fields]]
name = "author"
selector = "small.author"

[[extract.fields]]
name = "tags"
selector = "a.tag"
kind = "list"
required = false
"#,
        seed = seed,
        extra_crawler = extra_crawler,
        dataset = dir.path().join("quotes.jsonl").display(),
        state = dir.path().join("state.db").display(),
    )
}

fn quote(text: &str, author: Option<&str>, tags: &[&str]) -> String {
    let author = author
        .map(|a| format!(r#"<small class="author">{}</small>"#, a))
        .unwrap_or_default();
    let tags: String = tags
        .iter()
        .map(|t| format!(r#"<a class="tag" href="/tag/{0}/">{0}</a>"#, t))
        .collect();
    format!(
        r#"<div class="quote"><span class="text">{}</span><span>by {}</span><div class="tags">{}</div></div>"#,
        text, author, tags
    )
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(
        format!(
            "<html><head><title>Quotes</title></head><body>{}</body></html>",
            body
        ),
        "text/html; charset=utf-8",
    )
}

/// Mounts the two-page quotes site: page1 links to page2, page2 is empty
async fn mount_quotes_site(mock_server: &MockServer) {
    let page1 = format!(
        r#"{}{}{}<nav><ul class="pager"><li class="next"><a href="/page2">Next</a></li></ul></nav>"#,
        quote(
            "The world as we have created it is a process of our thinking.",
            Some("Albert Einstein"),
            &["change", "thinking"],
        ),
        quote("A day without sunshine is like, you know, night.", None, &["humor"]),
        quote(
            "It is our choices that show what we truly are.",
            Some("J.K. Rowling"),
            &[],
        ),
    );

    Mock::given(method("GET"))
        .and(path("/page1"))
        .respond_with(html(&page1))
        .expect(1)
        .mount(mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/page2"))
        .respond_with(html("<p>No quotes found!</p>"))
        .expect(1)
        .mount(mock_server)
        .await;
}

fn read_dataset(dir: &TempDir) -> Vec<serde_json::Value> {
    let content = std::fs::read_to_string(dir.path().join("quotes.jsonl"))
        .expect("Failed to read dataset");
    content
        .lines()
        .map(|line| serde_json::from_str(line).expect("Invalid JSON line"))
        .collect()
}

#[tokio::test]
async fn test_two_page_quotes_crawl() {
    // Start a mock server
    let mock_server = MockServer::start().await;
    mount_quotes_site(&mock_server).await;

    let dir = TempDir::new().unwrap();
    let seed = format!("{}/page1", mock_server.uri());
    let config_path = dir.path().join("quarry.toml");
    std::fs::write(&config_path, create_test_config(&seed, &dir, "")).unwrap();

    let (config, hash) = load_config_with_hash(&config_path).expect("Invalid config");
    let mut coordinator = Coordinator::builder(config)
        .config_hash(hash.clone())
        .build()
        .expect("Failed to create coordinator");
    let report = coordinator.run().await.expect("Crawl failed");

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.stats.pages_visited, 2);
    assert_eq!(report.stats.records_extracted, 2);
    assert_eq!(report.stats.extraction_warnings, 2);
    assert_eq!(report.stats.malformed_entries, 1);
    assert_eq!(report.stats.empty_pages, 1);
    assert_eq!(report.stats.pages_failed, 0);

    // Records land in document order with fields in configured order
    let records = read_dataset(&dir);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["author"], "Albert Einstein");
    assert_eq!(records[0]["tags"], serde_json::json!(["change", "thinking"]));
    assert_eq!(records[1]["author"], "J.K. Rowling");
    assert_eq!(records[1]["tags"], serde_json::json!([]));
    let keys: Vec<&String> = records[0].as_object().unwrap().keys().collect();
    assert_eq!(keys.len(), 3);

    // The run is recorded as completed, with the config hash
    let storage = open_storage(&dir.path().join("state.db")).unwrap();
    let run = storage.get_latest_run().unwrap().expect("No run recorded");
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.config_hash, hash);
    assert_eq!(run.records_extracted, 2);
}

#[tokio::test]
async fn test_user_agent_is_sent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .and(header(
            "user-agent",
            "TestBot/1.0.0 (+https://example.com/contact; test@example.com)",
        ))
        .respond_with(html(&quote("Hello", Some("Someone"), &[])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let seed = format!("{}/", mock_server.uri());
    let config = parse_config(&create_test_config(&seed, &dir, "")).unwrap();

    let report = crawl(config, true).await.expect("Crawl failed");
    assert_eq!(report.stats.records_extracted, 1);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let mock_server = MockServer::start().await;

    // First request fails, the retry succeeds
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(html(&quote("Eventually", Some("Patience"), &[])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let seed = format!("{}/flaky", mock_server.uri());
    let config = parse_config(&create_test_config(&seed, &dir, "")).unwrap();

    let report = crawl(config, true).await.expect("Crawl failed");

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.stats.pages_visited, 1);
    assert_eq!(report.stats.retries, 1);
    assert_eq!(report.stats.network_errors, 1);
    assert_eq!(read_dataset(&dir).len(), 1);
}

#[tokio::test]
async fn test_non_html_content_is_skipped() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/data.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"quotes": []}"#)
                .insert_header("content-type", "application/json"),
        )
        .expect(3) // first attempt plus two retries
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let seed = format!("{}/data.json", mock_server.uri());
    let config = parse_config(&create_test_config(&seed, &dir, "retry-count = 2")).unwrap();

    let report = crawl(config, true).await.expect("Crawl failed");

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.stats.pages_visited, 0);
    assert_eq!(report.stats.pages_failed, 1);
    assert_eq!(report.stats.parse_errors, 3);
    assert!(read_dataset(&dir).is_empty());
}

#[tokio::test]
async fn test_missing_page_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let seed = format!("{}/gone", mock_server.uri());
    let config = parse_config(&create_test_config(&seed, &dir, "")).unwrap();

    let report = crawl(config, true).await.expect("Crawl failed");

    assert_eq!(report.stats.pages_failed, 1);
    assert_eq!(report.stats.retries, 0);
}

#[tokio::test]
async fn test_resume_after_request_limit() {
    let mock_server = MockServer::start().await;
    mount_quotes_site(&mock_server).await;

    let dir = TempDir::new().unwrap();
    let seed = format!("{}/page1", mock_server.uri());

    // First invocation stops after one request
    let limited = parse_config(&create_test_config(&seed, &dir, "max-requests = 1")).unwrap();
    let first = crawl(limited, false).await.expect("First crawl failed");
    assert_eq!(first.state, RunState::LimitReached);
    assert_eq!(first.stats.pages_visited, 1);
    assert_eq!(read_dataset(&dir).len(), 2);

    // Second invocation picks up page2 without refetching page1
    let unlimited = parse_config(&create_test_config(&seed, &dir, "")).unwrap();
    let second = crawl(unlimited, false).await.expect("Second crawl failed");
    assert_eq!(second.state, RunState::Completed);
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.stats.pages_visited, 1);
    assert_eq!(second.stats.empty_pages, 1);

    // The dataset was appended to, not truncated
    assert_eq!(read_dataset(&dir).len(), 2);

    let storage = open_storage(&dir.path().join("state.db")).unwrap();
    let run = storage.get_run(first.run_id.unwrap()).unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.pages_visited, 2);
}

#[tokio::test]
async fn test_unwritable_dataset_fails_before_crawling() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(html("<p>unused</p>"))
        .expect(0)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let seed = format!("{}/", mock_server.uri());
    let mut config: Config = parse_config(&create_test_config(&seed, &dir, "")).unwrap();
    // A directory cannot be opened as the dataset file
    config.output.dataset_path = dir.path().display().to_string();

    assert!(Coordinator::new(config, true).is_err());
}

#[tokio::test]
async fn test_invalid_selector_is_rejected() {
    let dir = TempDir::new().unwrap();
    let toml = create_test_config("http://127.0.0.1:1/", &dir, "")
        .replace(r#"record-selector = "div.quote""#, r#"record-selector = "div[""#);

    assert!(parse_config(&toml).is_err());
    assert!(!dir.path().join("state.db").exists());
}

#[tokio::test]
async fn test_abort_reports_cancelled() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            html(&quote("Slow", Some("Snail"), &[])).set_delay(Duration::from_millis(300)),
        )
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let seed = format!("{}/slow", mock_server.uri());
    let config = parse_config(&create_test_config(&seed, &dir, "abort-grace-ms = 5000")).unwrap();

    let mut coordinator = Coordinator::new(config, true).unwrap();
    let abort = coordinator.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        abort.abort();
    });

    let report = coordinator.run().await.unwrap();

    // The in-flight request finished within the grace period
    assert_eq!(report.state, RunState::Aborted(AbortReason::Cancelled));
    assert_eq!(report.stats.pages_visited, 1);

    let storage = open_storage(&dir.path().join("state.db")).unwrap();
    let run = storage.get_latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Interrupted);
}
