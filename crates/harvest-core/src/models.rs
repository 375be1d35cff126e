use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of exhaustive-search work: region × category × optional key prefix.
///
/// A `None` prefix is the unfiltered catch-all query for the pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub region: String,
    pub category: String,
    pub prefix: Option<String>,
}

impl Partition {
    pub fn new(
        region: impl Into<String>,
        category: impl Into<String>,
        prefix: Option<String>,
    ) -> Self {
        Self {
            region: region.into(),
            category: category.into(),
            prefix,
        }
    }

    /// Stable identity used as the checkpoint key.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.region,
            self.category,
            self.prefix.as_deref().unwrap_or("*")
        )
    }

    /// Deterministic output file stem: lower-cased, runs of non-alphanumerics
    /// collapsed to a single `_`.
    ///
    /// Example: `{Travis, OSSF, "1"}` → `"travis_ossf_1"`
    pub fn file_stem(&self) -> String {
        let raw = format!(
            "{} {} {}",
            self.region,
            self.category,
            self.prefix.as_deref().unwrap_or("all")
        );
        slugify(&raw)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// A coarse region as returned by portal discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl Region {
    pub fn new(id: impl Into<String>, categories: Vec<String>) -> Self {
        Self {
            id: id.into(),
            categories,
        }
    }
}

/// Opaque session issued by the portal's authentication call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
}

/// One page of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub partition: Partition,
    pub offset: u64,
    pub page_size: u64,
}

/// A record as returned by the upstream search call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Upstream-assigned identifier; the deduplication key.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Upstream ids arrive as either JSON strings or JSON numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "record id must be a string or number, got {other}"
        ))),
    }
}

/// Response of one search call.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Total hits reported by upstream, when it reports one.
    pub total: Option<u64>,
}

/// A record as persisted by the sink: one NDJSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub region: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub extracted_at: DateTime<Utc>,
}

impl Record {
    pub fn from_raw(raw: RawRecord, partition: &Partition, extracted_at: DateTime<Utc>) -> Self {
        Self {
            id: raw.id,
            fields: raw.fields,
            region: partition.region.clone(),
            category: partition.category.clone(),
            prefix: partition.prefix.clone(),
            extracted_at,
        }
    }
}
