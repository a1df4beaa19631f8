//! PixVerse image-to-video effects through the fal.ai queue.

use crate::config::{Credential, GenlyConfig, Timeouts};
use crate::error::{GenlyError, Result};
use crate::poll::{poll, PollOptions};
use crate::providers::fal::{FalQueue, PROVIDER};
use crate::providers::reference::to_url_or_data_uri;
use crate::providers::{model_or_default, AdapterKind, InvokeContext, MediaAdapter, ReferenceSupport};
use crate::types::{GenerationRequest, MediaKind, MediaResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// PixVerse effect templates.
pub const PIXVERSE_EFFECTS: &str = "fal-ai/pixverse/v4.5/effects";
/// PixVerse prompt-driven image-to-video.
pub const PIXVERSE_I2V: &str = "fal-ai/pixverse/v5/image-to-video";

/// Effect-template and image-to-video generation on fal.ai.
#[derive(Debug, Clone)]
pub struct FalEffectsAdapter {
    queue: FalQueue,
    timeouts: Timeouts,
    poll_options: PollOptions,
}

impl FalEffectsAdapter {
    /// Creates the adapter from shared configuration.
    pub fn from_config(config: &GenlyConfig) -> Self {
        Self {
            queue: FalQueue::from_config(config),
            timeouts: config.timeouts,
            poll_options: PollOptions::fixed(120, Duration::from_secs(3))
                .with_check_timeout(config.timeouts.status_check)
                .with_progress_range(30, 95),
        }
    }

    /// Overrides the polling schedule.
    pub fn with_poll_options(mut self, options: PollOptions) -> Self {
        self.poll_options = options;
        self
    }
}

#[async_trait]
impl MediaAdapter for FalEffectsAdapter {
    async fn invoke(&self, request: &GenerationRequest, ctx: &InvokeContext) -> Result<MediaResult> {
        let key = self.queue.api_key("effects video generation")?;
        let model = model_or_default(request, self.default_model());

        let Some(reference) = request.reference_images.first() else {
            return Err(GenlyError::Validation(format!("{model} requires a source image")));
        };
        if request.reference_images.len() > 1 {
            return Err(GenlyError::Validation(format!(
                "{model} accepts exactly one source image, got {}",
                request.reference_images.len()
            )));
        }
        let is_effects = model.ends_with("/effects");
        if is_effects && request.effect.is_none() {
            return Err(GenlyError::Validation(format!("{model} requires an effect name")));
        }

        ctx.progress.report(10);
        let image_url = ctx
            .guard(to_url_or_data_uri(&self.queue.http, reference, self.timeouts.upload))
            .await?;

        let duration = match request.duration_secs {
            Some(d) if d >= 8 => "8",
            _ => "5",
        };
        let body = FalEffectsRequest {
            image_url,
            effect: request.effect.clone().filter(|_| is_effects),
            prompt: (!is_effects).then(|| request.prompt.clone()),
            negative_prompt: request.negative_prompt.clone(),
            resolution: "720p",
            duration,
            aspect_ratio: (!is_effects).then_some(if request.is_portrait() { "9:16" } else { "16:9" }),
            seed: request.seed,
        };

        let submit = ctx
            .guard(self.queue.submit(key, model, &body, self.timeouts.task_create))
            .await?;
        ctx.progress.report(20);

        let submitted = &submit;
        let timeout = self.poll_options.check_timeout;
        let output = poll(PROVIDER, &self.poll_options, &ctx.progress, &ctx.cancel, move |_| {
            self.queue.check(key, submitted, model, timeout)
        })
        .await?;
        let output: FalVideoResult = serde_json::from_value(output)?;

        let mut result = MediaResult::new(output.video.url, MediaKind::Video, model, request.tier);
        result.task_id = Some(submit.request_id.clone());
        result.seed = request.seed;
        result.duration_secs = duration.parse().ok();
        Ok(result)
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::FalEffects
    }

    fn credential(&self) -> Credential {
        Credential::Fal
    }

    fn is_configured(&self) -> bool {
        self.queue.is_configured()
    }

    fn default_model(&self) -> &str {
        PIXVERSE_EFFECTS
    }

    fn owns_model(&self, model: &str) -> bool {
        model.starts_with("fal-ai/pixverse/")
    }

    fn reference_support(&self, _model: &str) -> ReferenceSupport {
        ReferenceSupport::exactly(1)
    }
}

// Request types

#[derive(Debug, Serialize)]
struct FalEffectsRequest {
    image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    effect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<String>,
    resolution: &'static str,
    duration: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    aspect_ratio: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

// Response types

#[derive(Debug, Deserialize)]
struct FalVideoResult {
    video: FalVideoData,
}

#[derive(Debug, Deserialize)]
struct FalVideoData {
    url: String,
}
