//! Core domain model and identity rules for MCF.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "mcf-core";

/// Title given to posts found without a summarizing backend.
pub const UNTITLED_POST: &str = "Blog Post";

/// Default registry category for a monitored URL.
pub const DEFAULT_CATEGORY: &str = "broker";

const ID_HEX_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// A monitored URL along with its scrape health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub url: String,
    pub name: Option<String>,
    pub category: String,
    pub active: bool,
    pub last_scraped: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    PriceChange,
    Removed,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PriceChange => "price_change",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "price_change" => Ok(Self::PriceChange),
            "removed" => Ok(Self::Removed),
            other => Err(UnknownVariant {
                kind: "listing status",
                value: other.to_string(),
            }),
        }
    }
}

/// Canonical listing merged across one or more sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub address: Option<String>,
    pub price_raw: Option<String>,
    pub price_numeric: Option<f64>,
    pub bedrooms: Option<String>,
    pub bathrooms: Option<String>,
    pub sqft: Option<String>,
    pub acreage: Option<String>,
    pub frontage: Option<String>,
    pub garage: Option<String>,
    pub lake: Option<String>,
    pub waterfront: bool,
    pub exclusive: bool,
    pub source_url: String,
    pub listing_url: Option<String>,
    pub description: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: ListingStatus,
    pub raw_payload: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlogPost {
    pub id: String,
    pub source_url: String,
    pub post_url: String,
    pub title: String,
    pub date: Option<String>,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// Aggregate counters accumulated across one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub urls_processed: u64,
    pub listings_found: u64,
    pub new_listings: u64,
    pub posts_found: u64,
    pub new_posts: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    pub status: RunStatus,
}

/// Read-side filter for listing queries. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingFilter {
    pub status: Option<ListingStatus>,
    pub lake: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

/// Unvalidated listing produced by an extractor, already coerced to a typed shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingCandidate {
    pub address: Option<String>,
    #[serde(rename = "price")]
    pub price_raw: Option<String>,
    pub bedrooms: Option<String>,
    pub bathrooms: Option<String>,
    pub sqft: Option<String>,
    pub acreage: Option<String>,
    pub frontage: Option<String>,
    pub garage: Option<String>,
    pub lake: Option<String>,
    pub waterfront: bool,
    pub exclusive: bool,
    pub source_url: String,
    pub listing_url: Option<String>,
    pub description: Option<String>,
    /// Backend record as received, kept for the listing snapshot.
    #[serde(skip)]
    pub raw: Option<JsonValue>,
}

impl ListingCandidate {
    /// Coerce one loosely-typed backend record. Returns `None` for non-objects.
    pub fn from_loose(value: &JsonValue, source_url: &str) -> Option<Self> {
        let obj = value.as_object()?;
        let text = |key: &str| obj.get(key).and_then(loose_string);
        let flag = |key: &str| obj.get(key).and_then(loose_bool).unwrap_or(false);

        let mut raw = value.clone();
        if let Some(map) = raw.as_object_mut() {
            map.insert(
                "source_url".to_string(),
                JsonValue::String(source_url.to_string()),
            );
        }

        Some(Self {
            address: text("address"),
            price_raw: text("price").or_else(|| text("price_raw")),
            bedrooms: text("bedrooms"),
            bathrooms: text("bathrooms"),
            sqft: text("sqft"),
            acreage: text("acreage"),
            frontage: text("frontage"),
            garage: text("garage"),
            lake: text("lake"),
            waterfront: flag("waterfront"),
            exclusive: flag("exclusive"),
            source_url: source_url.to_string(),
            listing_url: text("listing_url"),
            description: text("description"),
            raw: Some(raw),
        })
    }

    pub fn id(&self) -> String {
        listing_id(self.address.as_deref(), &self.source_url)
    }

    pub fn price_numeric(&self) -> Option<f64> {
        self.price_raw.as_deref().and_then(parse_price)
    }

    /// Snapshot persisted with the listing: the raw record when one exists.
    pub fn payload(&self) -> JsonValue {
        match &self.raw {
            Some(raw) => raw.clone(),
            None => serde_json::to_value(self).unwrap_or(JsonValue::Null),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCandidate {
    pub title: Option<String>,
    pub post_url: String,
    pub date: Option<String>,
    pub source_url: String,
}

impl PostCandidate {
    /// Coerce one loosely-typed backend record. Records without `post_url` are dropped.
    pub fn from_loose(value: &JsonValue, source_url: &str) -> Option<Self> {
        let obj = value.as_object()?;
        let post_url = obj
            .get("post_url")
            .or_else(|| obj.get("url"))
            .and_then(loose_string)?;
        Some(Self {
            title: obj.get("title").and_then(loose_string),
            post_url,
            date: obj.get("date").and_then(loose_string),
            source_url: source_url.to_string(),
        })
    }

    pub fn id(&self) -> String {
        blog_post_id(&self.post_url)
    }

    pub fn title_or_placeholder(&self) -> &str {
        self.title.as_deref().unwrap_or(UNTITLED_POST)
    }
}

/// Case-fold, strip punctuation, turn separators into spaces and collapse whitespace.
pub fn normalize_address(address: &str) -> String {
    address
        .to_lowercase()
        .chars()
        .filter_map(|c| match c {
            '-' | '/' | '_' | '|' => Some(' '),
            c if c.is_alphanumeric() || c.is_whitespace() => Some(c),
            _ => None,
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn normalize_url(url: &str) -> String {
    url.trim().to_lowercase().trim_end_matches('/').to_string()
}

/// Identity of a listing: the normalized address when present, else the normalized source URL.
pub fn listing_id(address: Option<&str>, source_url: &str) -> String {
    let addr = address.map(normalize_address).unwrap_or_default();
    if addr.is_empty() {
        short_hash(&format!("url:{}", normalize_url(source_url)))
    } else {
        short_hash(&format!("addr:{addr}"))
    }
}

pub fn blog_post_id(post_url: &str) -> String {
    short_hash(&format!("post:{}", normalize_url(post_url)))
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(ID_HEX_LEN);
    hex
}

/// Parse a display price such as `$2,450,000` into a number. Unparsable input yields `None`.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£' | '¥' | ',') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Strings pass through trimmed, numbers are rendered, anything else is absent.
pub fn loose_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn loose_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_f64().map(|v| v != 0.0),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
