//! Chat-completion video models on CometAPI (Veo 3 Fast Frames, Sora 2).
//!
//! The chat call usually returns the finished video link in the message
//! content. Some responses only carry a follow-up link (`links.source`,
//! `status_url`, ...); those are polled until a video URL appears.

use crate::config::{Credential, GenlyConfig, Timeouts};
use crate::error::{GenlyError, Result, TimeoutKind};
use crate::extract::{find_media, find_video_url, MediaReference};
use crate::http::{Auth, HttpClient};
use crate::poll::{poll, PollOptions, PollOutcome};
use crate::providers::reference::to_url_or_data_uri;
use crate::providers::{model_or_default, AdapterKind, InvokeContext, MediaAdapter, ReferenceSupport};
use crate::types::{DataUri, GenerationRequest, MediaKind, MediaResult};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;

const PROVIDER: &str = "comet";

/// Frame-conditioned Veo 3 served as a chat model.
pub const VEO3_FAST_FRAMES: &str = "veo3-fast-frames";
/// Sora 2.
pub const SORA_2: &str = "sora-2";
/// Sora 2 Pro.
pub const SORA_2_PRO: &str = "sora-2-pro";

const MODELS: &[&str] = &[VEO3_FAST_FRAMES, SORA_2, SORA_2_PRO];

static SOURCE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>()\[\]]+/source/[^\s"'<>()\[\]]+"#).expect("valid regex")
});

fn normalize(model: &str) -> &str {
    model.strip_prefix("comet:").unwrap_or(model)
}

fn is_sora(model: &str) -> bool {
    normalize(model).starts_with("sora-")
}

/// Synchronous chat-completion video generation.
#[derive(Debug, Clone)]
pub struct CometVideoAdapter {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
    timeouts: Timeouts,
    poll_options: PollOptions,
}

impl CometVideoAdapter {
    /// Creates the adapter from shared configuration.
    pub fn from_config(config: &GenlyConfig) -> Self {
        Self {
            http: HttpClient::new(PROVIDER),
            base_url: config.endpoints.comet.trim_end_matches('/').to_string(),
            api_key: config.credential(Credential::Comet).map(str::to_string),
            timeouts: config.timeouts,
            poll_options: PollOptions::fixed(180, Duration::from_secs(5))
                .with_check_timeout(config.timeouts.status_check),
        }
    }

    /// Overrides the follow-up polling schedule.
    pub fn with_poll_options(mut self, options: PollOptions) -> Self {
        self.poll_options = options;
        self
    }

    async fn build_messages(&self, model: &str, request: &GenerationRequest) -> Result<Vec<ChatMessage>> {
        if is_sora(model) {
            let orientation = if request.is_portrait() { "portrait" } else { "landscape" };
            let duration = request.duration_secs.unwrap_or(8);
            return Ok(vec![
                ChatMessage {
                    role: "system",
                    content: MessageContent::Text(format!(
                        "Generate a single {duration}-second {orientation} video at {}x{}. \
                         Reply with the direct video URL.",
                        request.width, request.height
                    )),
                },
                ChatMessage {
                    role: "user",
                    content: MessageContent::Text(request.prompt.clone()),
                },
            ]);
        }

        let content = match request.reference_images.first() {
            Some(reference) => {
                let url = to_url_or_data_uri(&self.http, reference, self.timeouts.upload).await?;
                MessageContent::Blocks(vec![
                    ContentBlock::Text {
                        text: request.prompt.clone(),
                    },
                    ContentBlock::ImageUrl {
                        image_url: ImageUrl { url },
                    },
                ])
            }
            None => MessageContent::Text(request.prompt.clone()),
        };
        Ok(vec![ChatMessage { role: "user", content }])
    }

    async fn check_follow_up(&self, url: &str, key: &str) -> Result<PollOutcome<String>> {
        let auth = if url.starts_with(&self.base_url) {
            Auth::Bearer(key)
        } else {
            Auth::None
        };
        let response = self
            .http
            .get(url, auth, self.poll_options.check_timeout, TimeoutKind::Request)
            .await?;
        let text = response.text();

        if let Ok(value) = serde_json::from_str::<Value>(&text) {
            if let Some(status) = value.get("status").and_then(Value::as_str) {
                if matches!(status.to_lowercase().as_str(), "failed" | "error" | "cancelled") {
                    let reason = value
                        .get("error")
                        .and_then(|e| e.as_str().or_else(|| e.get("message").and_then(Value::as_str)))
                        .unwrap_or(status);
                    return Ok(PollOutcome::Failed(reason.to_string()));
                }
            }
            if let Some(url) = direct_video_url(&value) {
                return Ok(PollOutcome::Ready(url));
            }
        }
        Ok(find_video_url(&text).map_or(PollOutcome::Pending, PollOutcome::Ready))
    }
}

/// A finished video in a chat or status response.
///
/// A high-quality link announced in the message text wins; otherwise the
/// shared extractor decides, ignoring image results such as echoed frames.
fn direct_video_url(value: &Value) -> Option<String> {
    if let Some(url) = message_text(value).as_deref().and_then(find_video_url) {
        return Some(url);
    }
    match find_media(value)? {
        MediaReference::Url(url) if !is_image_url(&url) => Some(url),
        MediaReference::Inline { mime_type, data } if mime_type.starts_with("video/") => {
            Some(DataUri::format(&mime_type, &data))
        }
        _ => None,
    }
}

fn is_image_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    [".png", ".jpg", ".jpeg", ".webp", ".gif"]
        .iter()
        .any(|ext| path.ends_with(ext))
}

/// A link to poll when the chat response has no finished video yet.
fn follow_up_url(value: &Value) -> Option<String> {
    let candidates = ["/links/source", "/links/video", "/status_url", "/links/status"];
    if let Some(url) = candidates
        .iter()
        .find_map(|p| value.pointer(p).and_then(Value::as_str))
        .filter(|u| u.starts_with("http"))
    {
        return Some(url.to_string());
    }
    message_text(value).and_then(|text| SOURCE_LINK_RE.find(&text).map(|m| m.as_str().to_string()))
}

/// Concatenated text of `choices[0].message.content`.
fn message_text(value: &Value) -> Option<String> {
    let content = value.pointer("/choices/0/message/content")?;
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => Some(
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Value::Object(_) => Some(content.to_string()),
        _ => None,
    }
}

#[async_trait]
impl MediaAdapter for CometVideoAdapter {
    async fn invoke(&self, request: &GenerationRequest, ctx: &InvokeContext) -> Result<MediaResult> {
        let key = self.api_key.as_deref().ok_or_else(|| GenlyError::Configuration {
            credential: Credential::Comet.env_var(),
            message: "required for chat video generation".into(),
        })?;
        let model = normalize(model_or_default(request, self.default_model()));

        let support = self.reference_support(model);
        if !support.accepts(request.reference_images.len()) {
            return Err(GenlyError::Validation(format!(
                "{model} accepts at most {} reference image(s), got {}",
                support.max,
                request.reference_images.len()
            )));
        }

        ctx.progress.report(10);
        let messages = ctx.guard(self.build_messages(model, request)).await?;
        let body = ChatRequest {
            model,
            messages,
            stream: false,
        };

        ctx.progress.report(20);
        tracing::info!(model, "submitting chat video request");
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = ctx
            .guard(self.http.post_json(
                &url,
                Auth::Bearer(key),
                &body,
                self.timeouts.request,
                TimeoutKind::Request,
            ))
            .await?;
        ctx.progress.report(40);

        let text = response.text();
        let value = serde_json::from_str::<Value>(&text).ok();

        let direct = match &value {
            Some(value) => direct_video_url(value),
            None => find_video_url(&text),
        };
        let video_url = match direct {
            Some(url) => url,
            None => {
                let follow_up = value.as_ref().and_then(follow_up_url);
                let Some(follow_up) = follow_up else {
                    return Err(match &value {
                        Some(value) => GenlyError::extraction(value),
                        None => GenlyError::Extraction {
                            keys: vec!["<text>".into()],
                        },
                    });
                };
                tracing::debug!(follow_up = %follow_up, "chat response has no video yet, polling follow-up link");
                let options = self.poll_options.clone().with_progress_range(50, 95);
                let follow_up = follow_up.as_str();
                poll(PROVIDER, &options, &ctx.progress, &ctx.cancel, move |_| {
                    self.check_follow_up(follow_up, key)
                })
                .await?
            }
        };

        let mut result = MediaResult::new(video_url, MediaKind::Video, model, request.tier);
        result.duration_secs = request.duration_secs.map(f64::from);
        result.task_id = value
            .as_ref()
            .and_then(|v| v.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(result)
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::CometVideo
    }

    fn credential(&self) -> Credential {
        Credential::Comet
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn default_model(&self) -> &str {
        VEO3_FAST_FRAMES
    }

    fn owns_model(&self, model: &str) -> bool {
        MODELS.contains(&normalize(model)) || is_sora(model)
    }

    fn reference_support(&self, model: &str) -> ReferenceSupport {
        if is_sora(model) {
            ReferenceSupport::NONE
        } else {
            ReferenceSupport::up_to(1)
        }
    }
}

// Request types

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}
