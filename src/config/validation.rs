use crate::config::types::{
    Config, CrawlerConfig, ExtractConfig, FieldConfig, OutputConfig, UserAgentConfig,
};
use crate::ConfigError;
use scraper::Selector;
use std::collections::HashSet;
use url::Url;

/// Upper bound on the worker pool size
const MAX_CONCURRENCY: u32 = 256;

/// Validates the entire configuration
///
/// Every check here runs before the first fetch, so a bad selector or an empty
/// seed set never gets as far as the network.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_output_config(&config.output)?;
    validate_extract_config(&config.extract)?;
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.seed_urls.is_empty() {
        return Err(ConfigError::Validation(
            "seed_urls must contain at least one URL".to_string(),
        ));
    }

    for seed in &config.seed_urls {
        let url = Url::parse(seed)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid seed URL '{}': {}", seed, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Validation(format!(
                "Seed URL '{}' must use HTTP or HTTPS",
                seed
            )));
        }
    }

    if config.max_requests == Some(0) {
        return Err(ConfigError::Validation(
            "max_requests must be >= 1 when set".to_string(),
        ));
    }

    if config.max_concurrency < 1 || config.max_concurrency > MAX_CONCURRENCY {
        return Err(ConfigError::Validation(format!(
            "max_concurrency must be between 1 and {}, got {}",
            MAX_CONCURRENCY, config.max_concurrency
        )));
    }

    if config.per_host_concurrency < 1 {
        return Err(ConfigError::Validation(format!(
            "per_host_concurrency must be >= 1, got {}",
            config.per_host_concurrency
        )));
    }

    if config.fetch_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "fetch_timeout_ms must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.dataset_path.is_empty() {
        return Err(ConfigError::Validation(
            "dataset_path cannot be empty".to_string(),
        ));
    }

    if matches!(config.state_path.as_deref(), Some("")) {
        return Err(ConfigError::Validation(
            "state_path cannot be empty when set".to_string(),
        ));
    }

    Ok(())
}

/// Validates the record and field selectors
fn validate_extract_config(config: &ExtractConfig) -> Result<(), ConfigError> {
    validate_selector(&config.record_selector)?;

    if let Some(follow) = &config.follow_link_selector {
        validate_selector(follow)?;
    }

    if config.fields.is_empty() {
        return Err(ConfigError::Validation(
            "extract.fields must define at least one field".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for field in &config.fields {
        validate_field(field)?;
        if !names.insert(field.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate field name '{}'",
                field.name
            )));
        }
    }

    Ok(())
}

fn validate_field(field: &FieldConfig) -> Result<(), ConfigError> {
    if field.name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "Field name cannot be empty".to_string(),
        ));
    }

    if matches!(field.attribute.as_deref(), Some(attr) if attr.trim().is_empty()) {
        return Err(ConfigError::Validation(format!(
            "Field '{}' has an empty attribute name",
            field.name
        )));
    }

    validate_selector(&field.selector)
}

/// Parses a CSS selector, mapping failures to a configuration error
pub(crate) fn validate_selector(selector: &str) -> Result<(), ConfigError> {
    parse_selector(selector).map(|_| ())
}

/// Parses a CSS selector
pub(crate) fn parse_selector(selector: &str) -> Result<Selector, ConfigError> {
    if selector.trim().is_empty() {
        return Err(ConfigError::InvalidSelector {
            selector: selector.to_string(),
            message: "selector is empty".to_string(),
        });
    }

    Selector::parse(selector).map_err(|e| ConfigError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact_email cannot be empty".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
