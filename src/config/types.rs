use serde::Deserialize;

/// Main configuration structure for Quarry
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub output: OutputConfig,
    pub extract: ExtractConfig,
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// URLs the crawl starts from
    #[serde(rename = "seed-urls")]
    pub seed_urls: Vec<String>,

    /// Maximum number of requests issued by a run (unbounded when absent)
    #[serde(rename = "max-requests", default)]
    pub max_requests: Option<u64>,

    /// Number of concurrent fetch workers
    #[serde(rename = "max-concurrency", default = "default_max_concurrency")]
    pub max_concurrency: u32,

    /// Maximum number of in-flight requests per host
    #[serde(
        rename = "per-host-concurrency",
        default = "default_per_host_concurrency"
    )]
    pub per_host_concurrency: u32,

    /// Minimum time between request starts on the same host (milliseconds)
    #[serde(rename = "per-host-delay-ms", default)]
    pub per_host_delay_ms: u64,

    /// Timeout for a single fetch attempt (milliseconds)
    #[serde(rename = "fetch-timeout-ms", default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Additional attempts after a failed fetch
    #[serde(rename = "retry-count", default = "default_retry_count")]
    pub retry_count: u32,

    /// Base delay of the exponential retry backoff (milliseconds)
    #[serde(rename = "retry-backoff-ms", default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long in-flight work may continue after an abort (milliseconds)
    #[serde(rename = "abort-grace-ms", default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,

    /// Maximum link depth from the seeds (unbounded when absent)
    #[serde(rename = "max-depth", default)]
    pub max_depth: Option<u32>,

    /// Which discovered links may enter the frontier
    #[serde(rename = "enqueue-strategy", default)]
    pub enqueue_strategy: EnqueueStrategy,
}

/// Filter applied to follow-up links before they are enqueued
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnqueueStrategy {
    /// Only links on the same host (and port) as the page they were found on
    #[default]
    SameHost,
    /// Every HTTP(S) link
    All,
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the JSON Lines dataset file
    #[serde(rename = "dataset-path")]
    pub dataset_path: String,

    /// Path to the SQLite crawl-state database; runs are not resumable without it
    #[serde(rename = "state-path", default)]
    pub state_path: Option<String>,
}

/// Record extraction rules
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    /// Selector matching one block per record
    #[serde(rename = "record-selector")]
    pub record_selector: String,

    /// Selector for links to follow (e.g. the "next page" anchor)
    #[serde(rename = "follow-link-selector", default)]
    pub follow_link_selector: Option<String>,

    /// Fields extracted from each record block, in output order
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

/// A single extracted field
#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    /// Key of the field in the output record
    pub name: String,

    /// Selector evaluated inside the record block
    pub selector: String,

    /// Whether the first match or every match is taken
    #[serde(default)]
    pub kind: FieldKind,

    /// Read this attribute instead of the element text
    #[serde(default)]
    pub attribute: Option<String>,

    /// Entries without a match for a required field are skipped
    #[serde(default = "default_required")]
    pub required: bool,
}

/// Shape of an extracted field value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    #[default]
    Text,
    List,
}

fn default_max_concurrency() -> u32 {
    5
}

fn default_per_host_concurrency() -> u32 {
    1
}

fn default_fetch_timeout_ms() -> u64 {
    30_000
}

fn default_retry_count() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_abort_grace_ms() -> u64 {
    5_000
}

fn default_required() -> bool {
    true
}

impl CrawlerConfig {
    /// Crawler settings with the given seeds and every other option at its default
    pub fn with_seeds(seed_urls: Vec<String>) -> Self {
        Self {
            seed_urls,
            max_requests: None,
            max_concurrency: default_max_concurrency(),
            per_host_concurrency: default_per_host_concurrency(),
            per_host_delay_ms: 0,
            fetch_timeout_ms: default_fetch_timeout_ms(),
            retry_count: default_retry_count(),
            retry_backoff_ms: default_retry_backoff_ms(),
            abort_grace_ms: default_abort_grace_ms(),
            max_depth: None,
            enqueue_strategy: EnqueueStrategy::default(),
        }
    }
}

impl UserAgentConfig {
    /// Formats the User-Agent header: `Name/Version (+ContactURL; ContactEmail)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}
