//! Page normalization and candidate extraction for MCF.

mod ai;
mod fallback;
mod normalize;

use async_trait::async_trait;
use mcf_core::{ListingCandidate, PostCandidate};
use tracing::{info, warn};

pub use ai::{
    instruction, parse_reply, AiExtractor, AnthropicBackend, BackendError, CompletionBackend,
    ExtractError, OpenAiBackend, DEFAULT_ANTHROPIC_MODEL, DEFAULT_OPENAI_MODEL,
    MAX_COMPLETION_TOKENS,
};
pub use fallback::{FallbackExtractor, MAX_FALLBACK_POSTS};
pub use normalize::{collapse_whitespace, normalize, truncate_chars, NormalizedPage};

pub const CRATE_NAME: &str = "mcf-extract";

pub const LISTINGS_CHAR_BUDGET: usize = 80_000;
pub const POSTS_CHAR_BUDGET: usize = 40_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    Listings,
    Posts,
}

impl ExtractionMode {
    /// Key of the record array in a completion reply.
    pub fn key(self) -> &'static str {
        match self {
            Self::Listings => "listings",
            Self::Posts => "posts",
        }
    }

    /// Characters of page text sent to a completion backend.
    pub fn char_budget(self) -> usize {
        match self {
            Self::Listings => LISTINGS_CHAR_BUDGET,
            Self::Posts => POSTS_CHAR_BUDGET,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    Anthropic,
    OpenAi,
    Fallback,
}

impl ExtractorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Fallback => "fallback",
        }
    }
}

/// Turns a normalized page into candidate records. Never fails: problems degrade to fewer results.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn kind(&self) -> ExtractorKind;

    async fn extract_listings(
        &self,
        page: &NormalizedPage,
        source_url: &str,
    ) -> Vec<ListingCandidate>;

    async fn extract_posts(&self, page: &NormalizedPage, source_url: &str) -> Vec<PostCandidate>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_model: String,
    pub openai_model: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            anthropic_api_key: None,
            openai_api_key: None,
            anthropic_model: DEFAULT_ANTHROPIC_MODEL.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
        }
    }
}

impl ExtractorConfig {
    /// Which strategy these credentials select: Anthropic, then OpenAI, then fallback.
    pub fn selected_kind(&self) -> ExtractorKind {
        if present(&self.anthropic_api_key).is_some() {
            ExtractorKind::Anthropic
        } else if present(&self.openai_api_key).is_some() {
            ExtractorKind::OpenAi
        } else {
            ExtractorKind::Fallback
        }
    }
}

fn present(key: &Option<String>) -> Option<&str> {
    key.as_deref().map(str::trim).filter(|k| !k.is_empty())
}

pub fn extractor_for_config(config: &ExtractorConfig) -> Box<dyn Extractor> {
    let extractor: Box<dyn Extractor> = match (
        present(&config.anthropic_api_key),
        present(&config.openai_api_key),
    ) {
        (Some(key), _) => Box::new(AiExtractor::new(AnthropicBackend::new(
            key,
            config.anthropic_model.as_str(),
        ))),
        (None, Some(key)) => Box::new(AiExtractor::new(OpenAiBackend::new(
            key,
            config.openai_model.as_str(),
        ))),
        (None, None) => {
            warn!("no completion backend configured, extraction uses fallback patterns");
            Box::new(FallbackExtractor::new())
        }
    };
    info!(extractor = extractor.kind().as_str(), "extractor selected");
    extractor
}
