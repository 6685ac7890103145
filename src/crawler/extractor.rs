//! Record extraction from parsed pages
//!
//! A `PageHandler` turns one parsed document into records and follow-up
//! links. Handlers are pure: the same document and URL always give the same
//! extraction, and handlers never touch shared state, so any number of them
//! may run concurrently.

use super::parser::select_links;
use crate::config::{parse_selector, EnqueueStrategy, ExtractConfig, FieldKind};
use crate::dataset::{ExtractedRecord, FieldValue};
use crate::url::host_key;
use crate::ConfigError;
use scraper::{ElementRef, Html, Selector};
use std::fmt;
use url::Url;

/// Everything extracted from a single page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub records: Vec<ExtractedRecord>,
    pub follow_ups: Vec<Url>,
    pub warnings: Vec<ExtractionWarning>,
}

/// Non-fatal extraction problem; the page is still marked done
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionWarning {
    /// The record selector matched nothing on the page
    NoRecords,

    /// An entry lacked a required field and was skipped
    MalformedEntry { index: usize, field: String },
}

impl fmt::Display for ExtractionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRecords => write!(f, "page yielded no records"),
            Self::MalformedEntry { index, field } => {
                write!(f, "entry {} is missing required field '{}'", index, field)
            }
        }
    }
}

/// Turns a parsed document into records and follow-up URLs
pub trait PageHandler: Send + Sync {
    fn extract(&self, document: &Html, source_url: &Url) -> Extraction;
}

impl<F> PageHandler for F
where
    F: Fn(&Html, &Url) -> Extraction + Send + Sync,
{
    fn extract(&self, document: &Html, source_url: &Url) -> Extraction {
        self(document, source_url)
    }
}

struct CompiledField {
    name: String,
    selector: Selector,
    kind: FieldKind,
    attribute: Option<String>,
    required: bool,
}

impl CompiledField {
    fn values(&self, block: ElementRef<'_>) -> Vec<String> {
        block
            .select(&self.selector)
            .filter_map(|element| match &self.attribute {
                Some(attribute) => element.value().attr(attribute).map(|v| v.trim().to_string()),
                None => Some(element_text(element)),
            })
            .filter(|value| !value.is_empty())
            .collect()
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Handler driven by the `[extract]` section of the configuration
pub struct SelectorExtractor {
    record_selector: Selector,
    fields: Vec<CompiledField>,
    follow_link_selector: Option<Selector>,
}

impl SelectorExtractor {
    /// Compiles every selector up front; a bad selector is a configuration error
    pub fn from_config(config: &ExtractConfig) -> Result<Self, ConfigError> {
        let fields = config
            .fields
            .iter()
            .map(|field| {
                Ok(CompiledField {
                    name: field.name.clone(),
                    selector: parse_selector(&field.selector)?,
                    kind: field.kind,
                    attribute: field.attribute.clone(),
                    required: field.required,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            record_selector: parse_selector(&config.record_selector)?,
            fields,
            follow_link_selector: config
                .follow_link_selector
                .as_deref()
                .map(parse_selector)
                .transpose()?,
        })
    }

    fn extract_entry(
        &self,
        index: usize,
        block: ElementRef<'_>,
    ) -> Result<ExtractedRecord, ExtractionWarning> {
        let mut record = ExtractedRecord::new();

        for field in &self.fields {
            let mut values = field.values(block);

            if values.is_empty() && field.required {
                return Err(ExtractionWarning::MalformedEntry {
                    index,
                    field: field.name.clone(),
                });
            }

            match field.kind {
                FieldKind::Text => {
                    if !values.is_empty() {
                        record.insert(field.name.clone(), FieldValue::Text(values.swap_remove(0)));
                    }
                }
                FieldKind::List => record.insert(field.name.clone(), FieldValue::List(values)),
            }
        }

        Ok(record)
    }
}

impl PageHandler for SelectorExtractor {
    fn extract(&self, document: &Html, source_url: &Url) -> Extraction {
        let mut extraction = Extraction::default();
        let mut blocks = 0;

        for (index, block) in document.select(&self.record_selector).enumerate() {
            blocks += 1;
            match self.extract_entry(index, block) {
                Ok(record) => extraction.records.push(record),
                Err(warning) => extraction.warnings.push(warning),
            }
        }

        if blocks == 0 {
            extraction.warnings.push(ExtractionWarning::NoRecords);
        }

        if let Some(selector) = &self.follow_link_selector {
            extraction.follow_ups = select_links(document, selector, source_url);
        }

        extraction
    }
}

/// Decides which discovered links may enter the frontier
///
/// Applied by the workers to the follow-ups of every handler, so custom
/// handlers get the same scoping as the selector-driven one.
#[derive(Debug, Clone, Copy)]
pub struct FollowPolicy {
    pub strategy: EnqueueStrategy,
    pub max_depth: Option<u32>,
}

impl FollowPolicy {
    /// Returns true if `link`, found on `source` at `source_depth`, may be enqueued
    pub fn admits(&self, link: &Url, source: &Url, source_depth: u32) -> bool {
        if let Some(max_depth) = self.max_depth {
            if source_depth >= max_depth {
                return false;
            }
        }

        match self.strategy {
            EnqueueStrategy::All => true,
            EnqueueStrategy::SameHost => host_key(link) == host_key(source),
        }
    }
}
