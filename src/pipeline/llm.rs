//! Title-block extraction: send a page image to a multimodal model and parse
//! the JSON it answers with into [`DrawingMetadata`].
//!
//! Extraction fails closed. Any error (encoding, provider, timeout, a reply
//! that is not JSON) is logged and the page gets an empty record; it never
//! fails the aggregation. There is no retry: one attempt per page per
//! `/results` call.
//!
//! All prompt wording lives in [`crate::prompts`].

use crate::config::PipelineConfig;
use crate::output::DrawingMetadata;
use crate::pipeline::encode;
use crate::prompts::{METADATA_FIELDS, TITLE_BLOCK_SYSTEM_PROMPT, TITLE_BLOCK_USER_PROMPT};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Knobs for one batch of extractions.
#[derive(Debug, Clone, Copy)]
pub struct ExtractSettings {
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_pixels: u32,
}

impl ExtractSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            concurrency: config.extract_concurrency.max(1),
            timeout: Duration::from_secs(config.extract_timeout_secs.max(1)),
            max_pixels: config.extract_max_pixels,
        }
    }
}

/// Resolve the extraction provider.
///
/// 1. A pre-built provider (`config.extractor`) is used as is.
/// 2. A named provider (`config.extractor_provider`) is created through
///    [`ProviderFactory`], which reads its API key from the environment.
///
/// A provider that cannot be created disables extraction with a warning;
/// every page then gets an empty record.
pub fn resolve_extractor(config: &PipelineConfig) -> Option<Arc<dyn LLMProvider>> {
    if let Some(ref provider) = config.extractor {
        return Some(Arc::clone(provider));
    }

    let name = config.extractor_provider.as_deref()?;
    let model = config.extractor_model.as_deref().unwrap_or("gemini-2.5-flash");
    match ProviderFactory::create_llm_provider(name, model) {
        Ok(provider) => {
            info!("Title-block extraction via {} / {}", name, model);
            Some(provider)
        }
        Err(e) => {
            warn!(
                "Title-block extraction disabled: provider '{}' unavailable: {}",
                name, e
            );
            None
        }
    }
}

/// Extract metadata for every `(page, image)` pair.
///
/// Always returns one entry per input page. Without a provider every entry
/// is empty.
pub async fn extract_all(
    provider: Option<&Arc<dyn LLMProvider>>,
    pages: Vec<(usize, PathBuf)>,
    settings: ExtractSettings,
) -> BTreeMap<usize, DrawingMetadata> {
    let Some(provider) = provider else {
        debug!("No extraction provider; {} empty records", pages.len());
        return pages
            .into_iter()
            .map(|(page, _)| (page, DrawingMetadata::default()))
            .collect();
    };

    stream::iter(pages.into_iter().map(|(page, path)| {
        let provider = Arc::clone(provider);
        async move {
            let meta = match extract_page(&provider, page, path, settings).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Page {}: metadata extraction failed: {}", page, e);
                    DrawingMetadata::default()
                }
            };
            (page, meta)
        }
    }))
    .buffer_unordered(settings.concurrency.max(1))
    .collect()
    .await
}

/// One extraction attempt for one page.
async fn extract_page(
    provider: &Arc<dyn LLMProvider>,
    page: usize,
    path: PathBuf,
    settings: ExtractSettings,
) -> Result<DrawingMetadata, String> {
    let start = Instant::now();
    let max_pixels = settings.max_pixels;
    let image = tokio::task::spawn_blocking(move || encode::encode_page_file(&path, max_pixels))
        .await
        .map_err(|e| format!("encode task panicked: {e}"))?
        .map_err(|e| format!("encode: {e}"))?;

    let messages = vec![
        ChatMessage::system(TITLE_BLOCK_SYSTEM_PROMPT),
        ChatMessage::user_with_images(TITLE_BLOCK_USER_PROMPT, vec![image]),
    ];
    let options = CompletionOptions {
        temperature: Some(0.0),
        max_tokens: Some(1024),
        ..Default::default()
    };

    let response = tokio::time::timeout(settings.timeout, provider.chat(&messages, Some(&options)))
        .await
        .map_err(|_| format!("timeout after {}s", settings.timeout.as_secs()))?
        .map_err(|e| e.to_string())?;

    debug!(
        "Page {}: {} input tokens, {} output tokens, {:?}",
        page,
        response.prompt_tokens,
        response.completion_tokens,
        start.elapsed()
    );

    parse_metadata(&response.content)
}

static RE_JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*```(?:json|JSON)?\s*(.*?)\s*```\s*$").unwrap());

/// Parse a model reply into [`DrawingMetadata`].
///
/// Tolerates ```json fences and chatter around the object. Keys are matched
/// case-insensitively against the title-block fields and anything else
/// is dropped. Numbers are kept as strings (`"rev": 2` → `"2"`); blank strings
/// become null.
pub fn parse_metadata(reply: &str) -> Result<DrawingMetadata, String> {
    let text = match RE_JSON_FENCE.captures(reply) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()),
        None => reply.trim(),
    };

    let object = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => return Err(format!("reply has no JSON object: {:.80}", text)),
    };

    let value: Value =
        serde_json::from_str(object).map_err(|e| format!("reply is not valid JSON: {e}"))?;
    let Value::Object(fields) = value else {
        return Err("reply is not a JSON object".into());
    };

    let normalised: serde_json::Map<String, Value> = fields
        .into_iter()
        .filter_map(|(key, value)| {
            let key = key.trim().to_ascii_lowercase();
            if !METADATA_FIELDS.contains(&key.as_str()) {
                return None;
            }
            let value = match value {
                Value::String(s) if s.trim().is_empty() => Value::Null,
                Value::String(s) => Value::String(s.trim().to_string()),
                Value::Number(n) => Value::String(n.to_string()),
                _ => Value::Null,
            };
            Some((key, value))
        })
        .collect();

    serde_json::from_value(Value::Object(normalised)).map_err(|e| e.to_string())
}
