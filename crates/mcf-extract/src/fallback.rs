use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use mcf_core::{ListingCandidate, PostCandidate, UNTITLED_POST};
use regex::Regex;
use url::Url;

use crate::{Extractor, ExtractorKind, NormalizedPage};

pub const MAX_FALLBACK_POSTS: usize = 10;

static RE_PRICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\d[\d,]*").expect("valid price regex"));
static RE_LAKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bLake\s*(Muskoka|Joseph|Rosseau|of\s+Bays|Skeleton|Peninsula)\b")
        .expect("valid lake regex")
});
static RE_EXCLUSIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(exclusive|off-market|pocket listing|private listing)\b")
        .expect("valid exclusivity regex")
});
static RE_EDITORIAL_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(blog|news|article|post)").expect("valid link regex"));

/// Deterministic extraction used when no completion backend is configured or one fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackExtractor;

impl FallbackExtractor {
    pub fn new() -> Self {
        Self
    }

    /// One coarse listing when the text carries both a price token and a named lake.
    pub fn listings(&self, text: &str, source_url: &str) -> Vec<ListingCandidate> {
        let Some(price) = RE_PRICE.find(text) else {
            return Vec::new();
        };
        let Some(lake) = RE_LAKE.captures(text).and_then(|c| c.get(1)) else {
            return Vec::new();
        };

        vec![ListingCandidate {
            price_raw: Some(price.as_str().to_string()),
            lake: Some(canonical_lake(lake.as_str())),
            waterfront: true,
            exclusive: RE_EXCLUSIVE.is_match(text),
            source_url: source_url.to_string(),
            listing_url: Some(source_url.to_string()),
            description: Some(format!("Found on {source_url}")),
            ..Default::default()
        }]
    }

    /// Editorial-looking anchors, resolved against the source and deduplicated.
    pub fn posts(&self, links: &[String], source_url: &str) -> Vec<PostCandidate> {
        let base = Url::parse(source_url).ok();
        let mut seen = HashSet::new();
        links
            .iter()
            .filter(|href| RE_EDITORIAL_LINK.is_match(href))
            .filter_map(|href| resolve_link(base.as_ref(), href))
            .filter(|url| seen.insert(url.clone()))
            .take(MAX_FALLBACK_POSTS)
            .map(|post_url| PostCandidate {
                title: Some(UNTITLED_POST.to_string()),
                post_url,
                date: None,
                source_url: source_url.to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl Extractor for FallbackExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Fallback
    }

    async fn extract_listings(
        &self,
        page: &NormalizedPage,
        source_url: &str,
    ) -> Vec<ListingCandidate> {
        self.listings(&page.text, source_url)
    }

    async fn extract_posts(&self, page: &NormalizedPage, source_url: &str) -> Vec<PostCandidate> {
        self.posts(&page.links, source_url)
    }
}

fn canonical_lake(name: &str) -> String {
    let folded = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let proper = match folded.to_ascii_lowercase().as_str() {
        "muskoka" => "Muskoka",
        "joseph" => "Joseph",
        "rosseau" => "Rosseau",
        "of bays" => "of Bays",
        "skeleton" => "Skeleton",
        "peninsula" => "Peninsula",
        _ => return format!("Lake {folded}"),
    };
    format!("Lake {proper}")
}

/// Resolve `href` against the source page. Non-http(s) targets are discarded.
pub(crate) fn resolve_link(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    let resolved = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "https://broker.example/listings/";

    #[test]
    fn lake_without_price_yields_nothing() {
        let found = FallbackExtractor::new().listings("Beautiful Lake Rosseau cottage", SOURCE);
        assert!(found.is_empty());
    }

    #[test]
    fn price_without_lake_yields_nothing() {
        let found = FallbackExtractor::new().listings("Cottage for $2,450,000", SOURCE);
        assert!(found.is_empty());
    }

    #[test]
    fn price_and_lake_synthesize_one_listing() {
        let text = "New: $2,450,000 on LAKE rosseau. Also $1,100,000 on Lake Joseph.";
        let found = FallbackExtractor::new().listings(text, SOURCE);
        assert_eq!(found.len(), 1);
        let listing = &found[0];
        assert_eq!(listing.price_raw.as_deref(), Some("$2,450,000"));
        assert_eq!(listing.lake.as_deref(), Some("Lake Rosseau"));
        assert!(listing.waterfront);
        assert!(!listing.exclusive);
        assert_eq!(listing.address, None);
        assert_eq!(listing.bedrooms, None);
        assert_eq!(listing.source_url, SOURCE);
        assert_eq!(listing.listing_url.as_deref(), Some(SOURCE));
    }

    #[test]
    fn exclusivity_keyword_sets_flag() {
        let text = "Off-Market opportunity on Lake of Bays, asking $899,000";
        let found = FallbackExtractor::new().listings(text, SOURCE);
        assert!(found[0].exclusive);
        assert_eq!(found[0].lake.as_deref(), Some("Lake of Bays"));
    }

    #[test]
    fn post_links_are_resolved_deduplicated_and_capped() {
        let mut links = vec![
            "/blog/spring-market".to_string(),
            "https://broker.example/blog/spring-market".to_string(),
            "/contact".to_string(),
            "mailto:news@broker.example".to_string(),
            "../News/fall".to_string(),
        ];
        links.extend((0..20).map(|i| format!("/articles/{i}")));

        let posts = FallbackExtractor::new().posts(&links, SOURCE);
        assert_eq!(posts.len(), MAX_FALLBACK_POSTS);
        assert_eq!(posts[0].post_url, "https://broker.example/blog/spring-market");
        assert_eq!(posts[1].post_url, "https://broker.example/News/fall");
        assert_eq!(posts[2].post_url, "https://broker.example/articles/0");
        assert!(posts.iter().all(|p| p.title.as_deref() == Some(UNTITLED_POST)));
        assert!(posts.iter().all(|p| p.source_url == SOURCE));
    }
}
