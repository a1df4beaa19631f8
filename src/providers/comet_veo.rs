//! Veo 3 task creation on CometAPI, polled by scanning the task's source document.

use crate::config::{Credential, GenlyConfig, Timeouts};
use crate::error::{GenlyError, Result, TimeoutKind};
use crate::extract::find_video_url;
use crate::http::{Auth, HttpClient};
use crate::poll::{poll, PollOptions, PollOutcome};
use crate::providers::reference::to_url_or_data_uri;
use crate::providers::{model_or_default, AdapterKind, InvokeContext, MediaAdapter, ReferenceSupport};
use crate::types::{GenerationRequest, MediaKind, MediaResult};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

const PROVIDER: &str = "comet-veo";

/// Default Veo model.
pub const VEO3: &str = "veo3";

const MODELS: &[&str] = &[VEO3, "veo3-fast", "veo3-pro"];

/// Veo 3 generation through CometAPI's task endpoint.
#[derive(Debug, Clone)]
pub struct CometVeoAdapter {
    http: HttpClient,
    base_url: String,
    source_url: String,
    api_key: Option<String>,
    timeouts: Timeouts,
    poll_options: PollOptions,
}

impl CometVeoAdapter {
    /// Creates the adapter from shared configuration.
    pub fn from_config(config: &GenlyConfig) -> Self {
        Self {
            http: HttpClient::new(PROVIDER),
            base_url: config.endpoints.comet.trim_end_matches('/').to_string(),
            source_url: config.endpoints.veo_source.trim_end_matches('/').to_string(),
            api_key: config.credential(Credential::Comet).map(str::to_string),
            timeouts: config.timeouts,
            poll_options: PollOptions::fixed(120, Duration::from_secs(5))
                .with_check_timeout(config.timeouts.status_check),
        }
    }

    /// Overrides the polling schedule.
    pub fn with_poll_options(mut self, options: PollOptions) -> Self {
        self.poll_options = options;
        self
    }

    async fn check_source(&self, task_id: &str) -> Result<PollOutcome<String>> {
        let url = format!("{}/{}", self.source_url, task_id);
        let response = self
            .http
            .get(&url, Auth::None, self.poll_options.check_timeout, TimeoutKind::Request)
            .await?;
        let text = response.text();

        if let Some(video) = find_video_url(&text) {
            return Ok(PollOutcome::Ready(video));
        }
        if let Ok(value) = serde_json::from_str::<Value>(&text) {
            let status = value.get("status").and_then(Value::as_str).unwrap_or_default();
            if matches!(status.to_lowercase().as_str(), "failed" | "failure" | "error") {
                let reason = value
                    .get("fail_reason")
                    .or_else(|| value.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or(status);
                return Ok(PollOutcome::Failed(reason.to_string()));
            }
        }
        Ok(PollOutcome::Pending)
    }
}

fn task_id(value: &Value) -> Option<String> {
    ["/id", "/task_id", "/data/id", "/data/task_id"]
        .iter()
        .find_map(|p| value.pointer(p))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[async_trait]
impl MediaAdapter for CometVeoAdapter {
    async fn invoke(&self, request: &GenerationRequest, ctx: &InvokeContext) -> Result<MediaResult> {
        let key = self.api_key.as_deref().ok_or_else(|| GenlyError::Configuration {
            credential: Credential::Comet.env_var(),
            message: "required for Veo video generation".into(),
        })?;
        let model = model_or_default(request, self.default_model());

        if request.reference_images.len() > 1 {
            return Err(GenlyError::Validation(format!(
                "{model} accepts at most one reference image, got {}",
                request.reference_images.len()
            )));
        }

        ctx.progress.report(10);
        let mut images = Vec::with_capacity(request.reference_images.len());
        for reference in &request.reference_images {
            images.push(
                ctx.guard(to_url_or_data_uri(&self.http, reference, self.timeouts.upload))
                    .await?,
            );
        }

        let (width, height, aspect_ratio) = if request.is_portrait() {
            (1080, 1920, "9:16")
        } else {
            (1920, 1080, "16:9")
        };
        let body = VeoCreateRequest {
            prompt: request.prompt.clone(),
            model,
            enhance_prompt: true,
            width,
            height,
            aspect_ratio,
            images,
        };

        ctx.progress.report(20);
        let url = format!("{}/veo/v1/video/create", self.base_url);
        let response = ctx
            .guard(self.http.post_json(
                &url,
                Auth::Bearer(key),
                &body,
                self.timeouts.task_create,
                TimeoutKind::Request,
            ))
            .await?;
        let created: Value = response.json()?;
        let id = task_id(&created).ok_or_else(|| GenlyError::Provider {
            provider: PROVIDER,
            status: None,
            message: "task creation returned no id".into(),
        })?;
        tracing::info!(task_id = %id, model, "created Veo task");

        let task = id.as_str();
        let video_url = poll(PROVIDER, &self.poll_options, &ctx.progress, &ctx.cancel, move |_| {
            self.check_source(task)
        })
        .await?;

        let mut result = MediaResult::new(video_url, MediaKind::Video, model, request.tier);
        result.task_id = Some(id);
        result.width = Some(width);
        result.height = Some(height);
        Ok(result)
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::CometVeo
    }

    fn credential(&self) -> Credential {
        Credential::Comet
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn default_model(&self) -> &str {
        VEO3
    }

    fn owns_model(&self, model: &str) -> bool {
        MODELS.contains(&model)
    }

    fn reference_support(&self, _model: &str) -> ReferenceSupport {
        ReferenceSupport::up_to(1)
    }
}

// Request types

#[derive(Debug, Serialize)]
struct VeoCreateRequest<'a> {
    prompt: String,
    model: &'a str,
    enhance_prompt: bool,
    width: u32,
    height: u32,
    aspect_ratio: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}
