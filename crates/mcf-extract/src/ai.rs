//! Language-model backed extraction.
//!
//! A [`CompletionBackend`] turns one prompt into reply text. [`AiExtractor`]
//! owns the prompt templates, parses the reply permissively and degrades to
//! the deterministic [`FallbackExtractor`] whenever the backend itself fails.

use async_trait::async_trait;
use mcf_core::{ListingCandidate, PostCandidate};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::fallback::{resolve_link, FallbackExtractor};
use crate::normalize::truncate_chars;
use crate::{ExtractionMode, Extractor, ExtractorKind, NormalizedPage};

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-20241022";
pub const OPENAI_API_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const MAX_COMPLETION_TOKENS: u32 = 4000;

const OPENAI_SYSTEM_PROMPT: &str = "Extract data and return valid JSON only.";
const OPENAI_TEMPERATURE: f32 = 0.1;

const LISTINGS_PROMPT: &str = r#"Extract all real estate listings from this webpage content. Focus on waterfront properties, cottages, and homes in the Muskoka region (Lake Muskoka, Lake Joseph, Lake Rosseau, Lake of Bays, etc.).

For each listing found, extract:
- address: Full address or location description
- price: Listed price (keep original format like "$2,450,000")
- bedrooms: Number of bedrooms (e.g., "4" or "4+1")
- bathrooms: Number of bathrooms (e.g., "3" or "2.5")
- sqft: Square footage if available
- acreage: Lot size in acres if available (e.g., "2.5 acres")
- frontage: Water frontage in feet if available (e.g., "150 ft")
- garage: Garage info if available (e.g., "2-car", "detached", "boathouse")
- lake: Which lake (Lake Muskoka, Lake Joseph, Lake Rosseau, etc.)
- waterfront: true if waterfront property, false otherwise
- exclusive: true if marked as "exclusive", "off-market", "pocket listing", or "private listing"
- listing_url: URL to the specific listing if different from source
- description: Brief description of the property (max 200 chars) - include key features like style, views, amenities

Return a JSON object with a "listings" array. If no listings found, return {"listings": []}.
Only include actual property listings, not agent profiles or general content.

Webpage content:
"#;

const POSTS_PROMPT: &str = r#"Extract all blog posts or news articles from this webpage content.

For each post found, extract:
- title: Post/article title
- post_url: URL to the full article
- date: Publication date if available

Return a JSON object with a "posts" array. If no posts found, return {"posts": []}.
Only include actual blog posts/articles, not navigation links or other content.

Webpage content:
"#;

pub fn instruction(mode: ExtractionMode) -> &'static str {
    match mode {
        ExtractionMode::Listings => LISTINGS_PROMPT,
        ExtractionMode::Posts => POSTS_PROMPT,
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("completion request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("completion backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("completion reply carried no text")]
    EmptyReply,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("malformed completion reply: {reason}")]
    MalformedResponse { reason: String },
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn kind(&self) -> ExtractorKind;

    async fn complete(&self, prompt: &str) -> Result<String, BackendError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicResponse {
    fn into_text(self) -> Option<String> {
        let text: String = self
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Clone)]
pub struct AnthropicBackend {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Anthropic
    }

    async fn complete(&self, prompt: &str) -> Result<String, BackendError> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_COMPLETION_TOKENS,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let reply: AnthropicResponse = response.json().await?;
        reply.into_text().ok_or(BackendError::EmptyReply)
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiResponse {
    fn into_text(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.is_empty())
    }
}

#[derive(Clone)]
pub struct OpenAiBackend {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: OPENAI_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::OpenAi
    }

    async fn complete(&self, prompt: &str) -> Result<String, BackendError> {
        let request = OpenAiRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: OPENAI_SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: OPENAI_TEMPERATURE,
            max_tokens: MAX_COMPLETION_TOKENS,
        };
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let reply: OpenAiResponse = response.json().await?;
        reply.into_text().ok_or(BackendError::EmptyReply)
    }
}

/// Decode the first complete JSON object in `reply` and return the records under the mode key.
///
/// A missing key is an empty result; a reply with no decodable object, or a
/// non-array under the key, is malformed.
pub fn parse_reply(reply: &str, mode: ExtractionMode) -> Result<Vec<JsonValue>, ExtractError> {
    let mut last_error = None;
    for (start, _) in reply.match_indices('{') {
        let mut stream =
            serde_json::Deserializer::from_str(&reply[start..]).into_iter::<JsonValue>();
        match stream.next() {
            Some(Ok(JsonValue::Object(mut object))) => {
                return match object.remove(mode.key()) {
                    None | Some(JsonValue::Null) => Ok(Vec::new()),
                    Some(JsonValue::Array(records)) => Ok(records),
                    Some(other) => Err(ExtractError::MalformedResponse {
                        reason: format!("\"{}\" is not an array: {other}", mode.key()),
                    }),
                };
            }
            Some(Err(err)) => last_error = Some(err.to_string()),
            _ => {}
        }
    }
    Err(ExtractError::MalformedResponse {
        reason: last_error.unwrap_or_else(|| "no JSON object in reply".to_string()),
    })
}

pub struct AiExtractor<B> {
    backend: B,
    fallback: FallbackExtractor,
}

impl<B: CompletionBackend> AiExtractor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            fallback: FallbackExtractor::new(),
        }
    }

    /// `None` means the backend failed and the caller should degrade to the fallback path.
    async fn records(
        &self,
        mode: ExtractionMode,
        text: &str,
        source_url: &str,
    ) -> Option<Vec<JsonValue>> {
        let content = truncate_chars(text, mode.char_budget());
        let prompt = format!("{}{}", instruction(mode), content);

        let reply = match self.backend.complete(&prompt).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(
                    backend = self.backend.kind().as_str(),
                    mode = mode.key(),
                    url = source_url,
                    error = %err,
                    "completion backend failed, using fallback extraction"
                );
                return None;
            }
        };

        match parse_reply(&reply, mode) {
            Ok(records) => {
                debug!(
                    mode = mode.key(),
                    url = source_url,
                    records = records.len(),
                    "parsed reply"
                );
                Some(records)
            }
            Err(err) => {
                warn!(mode = mode.key(), url = source_url, error = %err, "discarding reply");
                Some(Vec::new())
            }
        }
    }
}

#[async_trait]
impl<B: CompletionBackend> Extractor for AiExtractor<B> {
    fn kind(&self) -> ExtractorKind {
        self.backend.kind()
    }

    async fn extract_listings(
        &self,
        page: &NormalizedPage,
        source_url: &str,
    ) -> Vec<ListingCandidate> {
        match self
            .records(ExtractionMode::Listings, &page.text, source_url)
            .await
        {
            Some(records) => records
                .iter()
                .filter_map(|record| ListingCandidate::from_loose(record, source_url))
                .collect(),
            None => self.fallback.listings(&page.text, source_url),
        }
    }

    async fn extract_posts(&self, page: &NormalizedPage, source_url: &str) -> Vec<PostCandidate> {
        let Some(records) = self
            .records(ExtractionMode::Posts, &page.text, source_url)
            .await
        else {
            return self.fallback.posts(&page.links, source_url);
        };

        let base = Url::parse(source_url).ok();
        records
            .iter()
            .filter_map(|record| PostCandidate::from_loose(record, source_url))
            .filter_map(|mut post| {
                post.post_url = resolve_link(base.as_ref(), &post.post_url)?;
                Some(post)
            })
            .collect()
    }
}
