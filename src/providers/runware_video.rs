//! Runware async video tasks, polled by task id.

use crate::config::{Credential, GenlyConfig};
use crate::error::{GenlyError, Result, TimeoutKind};
use crate::poll::{poll, PollOptions, PollOutcome};
use crate::providers::runware::{RunwareClient, PROVIDER};
use crate::providers::{model_or_default, AdapterKind, InvokeContext, MediaAdapter, ReferenceSupport};
use crate::types::{GenerationRequest, MediaKind, MediaResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Seedance 1.0 Lite.
pub const SEEDANCE_LITE: &str = "bytedance:1@1";

/// Default clip length in seconds.
const DEFAULT_DURATION_SECS: u32 = 5;

/// Output sizes Seedance accepts.
const SEEDANCE_SIZES: &[(u32, u32)] = &[
    (864, 480),
    (480, 864),
    (640, 640),
    (736, 544),
    (544, 736),
    (960, 416),
    (416, 960),
    (1248, 704),
    (704, 1248),
    (960, 960),
];

const VIDEO_MODEL_SOURCES: &[&str] = &["bytedance", "klingai", "minimax", "pixverse", "vidu"];

/// True for Runware AIR ids served by video providers.
pub(crate) fn is_video_model(model: &str) -> bool {
    model
        .split_once(':')
        .is_some_and(|(source, _)| VIDEO_MODEL_SOURCES.contains(&source))
}

/// Video generation through Runware's async `videoInference` task.
#[derive(Debug, Clone)]
pub struct RunwareVideoAdapter {
    client: RunwareClient,
    poll_options: PollOptions,
}

impl RunwareVideoAdapter {
    /// Creates the adapter from shared configuration.
    pub fn from_config(config: &GenlyConfig) -> Self {
        Self {
            client: RunwareClient::from_config(config),
            poll_options: PollOptions::default().with_check_timeout(config.timeouts.status_check),
        }
    }

    /// Overrides the polling schedule.
    pub fn with_poll_options(mut self, options: PollOptions) -> Self {
        self.poll_options = options;
        self
    }

    async fn check_status(&self, task_uuid: &str) -> Result<PollOutcome<VideoTaskResult>> {
        let task = GetResponseTask {
            task_type: "getResponse",
            task_uuid: task_uuid.to_string(),
        };
        let envelope = match self
            .client
            .run(&[task], self.poll_options.check_timeout, TimeoutKind::Request)
            .await
        {
            Ok(envelope) => envelope,
            // An error envelope (no HTTP status) is the task itself failing.
            Err(GenlyError::Provider {
                status: None,
                message,
                ..
            }) => return Ok(PollOutcome::Failed(message)),
            Err(e) => return Err(e),
        };
        Ok(task_outcome(&envelope.data, task_uuid))
    }
}

fn task_outcome(data: &[Value], task_uuid: &str) -> PollOutcome<VideoTaskResult> {
    let Some(item) = data
        .iter()
        .find(|item| item.get("taskUUID").and_then(Value::as_str) == Some(task_uuid))
    else {
        return PollOutcome::Pending;
    };
    let Ok(result) = serde_json::from_value::<VideoTaskResult>(item.clone()) else {
        return PollOutcome::Pending;
    };

    match result.status.as_deref() {
        Some("error") | Some("failed") => PollOutcome::Failed(
            result
                .message
                .clone()
                .unwrap_or_else(|| "video generation failed".to_string()),
        ),
        Some("success") | None if result.url().is_some() => PollOutcome::Ready(result),
        _ => PollOutcome::Pending,
    }
}

#[async_trait]
impl MediaAdapter for RunwareVideoAdapter {
    async fn invoke(&self, request: &GenerationRequest, ctx: &InvokeContext) -> Result<MediaResult> {
        self.client.api_key()?;
        let model = model_or_default(request, self.default_model());

        if request.reference_images.len() > 1 {
            return Err(GenlyError::Validation(format!(
                "{model} accepts at most one frame image, got {}",
                request.reference_images.len()
            )));
        }
        let is_seedance = model.starts_with("bytedance:");
        if is_seedance && !SEEDANCE_SIZES.contains(&(request.width, request.height)) {
            return Err(GenlyError::Validation(format!(
                "{}x{} is not a supported Seedance size",
                request.width, request.height
            )));
        }

        ctx.progress.report(10);
        let frame_images = match request.reference_images.first() {
            Some(reference) => Some(vec![ctx.guard(self.client.reference_url(reference)).await?]),
            None => None,
        };
        ctx.progress.report(20);

        let duration = request.duration_secs.unwrap_or(DEFAULT_DURATION_SECS);
        let task = VideoInferenceTask {
            task_type: "videoInference",
            task_uuid: Uuid::new_v4().to_string(),
            delivery_method: "async",
            output_type: "URL",
            output_format: "MP4",
            output_quality: 85,
            include_cost: true,
            model: model.to_string(),
            positive_prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            duration,
            width: request.width,
            height: request.height,
            seed: request.seed,
            frame_images,
            provider_settings: is_seedance.then(|| ProviderSettings {
                bytedance: BytedanceSettings { camera_fixed: false },
            }),
        };
        let task_uuid = task.task_uuid.clone();

        tracing::info!(task_uuid = %task_uuid, model, duration, "submitting Runware video task");
        let created = ctx
            .guard(self.client.run(&[task], self.client.timeouts.task_create, TimeoutKind::Request))
            .await?;

        let finished = match task_outcome(&created.data, &task_uuid) {
            PollOutcome::Ready(result) => result,
            PollOutcome::Failed(reason) => {
                return Err(GenlyError::Provider {
                    provider: PROVIDER,
                    status: None,
                    message: reason,
                })
            }
            PollOutcome::Pending => {
                let id = task_uuid.as_str();
                poll(PROVIDER, &self.poll_options, &ctx.progress, &ctx.cancel, move |_| {
                    self.check_status(id)
                })
                .await?
            }
        };

        let url = finished.url().map(str::to_string).unwrap_or_default();
        let mut result = MediaResult::new(url, MediaKind::Video, model, request.tier);
        result.cost = finished.cost;
        result.task_id = Some(task_uuid);
        result.width = Some(request.width);
        result.height = Some(request.height);
        result.duration_secs = Some(duration as f64);
        Ok(result)
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::RunwareVideo
    }

    fn credential(&self) -> Credential {
        Credential::Runware
    }

    fn is_configured(&self) -> bool {
        self.client.is_configured()
    }

    fn default_model(&self) -> &str {
        SEEDANCE_LITE
    }

    fn owns_model(&self, model: &str) -> bool {
        is_video_model(model)
    }

    fn reference_support(&self, _model: &str) -> ReferenceSupport {
        ReferenceSupport::up_to(1)
    }
}

// Wire types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoInferenceTask {
    task_type: &'static str,
    #[serde(rename = "taskUUID")]
    task_uuid: String,
    delivery_method: &'static str,
    output_type: &'static str,
    output_format: &'static str,
    output_quality: u32,
    include_cost: bool,
    model: String,
    positive_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<String>,
    duration: u32,
    width: u32,
    height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frame_images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_settings: Option<ProviderSettings>,
}

#[derive(Debug, Serialize)]
struct ProviderSettings {
    bytedance: BytedanceSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BytedanceSettings {
    camera_fixed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetResponseTask {
    task_type: &'static str,
    #[serde(rename = "taskUUID")]
    task_uuid: String,
}

#[derive(Debug, Deserialize)]
struct VideoTaskResult {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "videoURL")]
    video_url: Option<String>,
    #[serde(default, rename = "videoPath")]
    video_path: Option<String>,
    #[serde(default)]
    cost: Option<f64>,
    #[serde(default)]
    message: Option<String>,
}

impl VideoTaskResult {
    fn url(&self) -> Option<&str> {
        self.video_url
            .as_deref()
            .or(self.video_path.as_deref())
            .filter(|u| !u.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QualityTier, ReferenceImage};
    use mockito::Matcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn adapter(url: &str) -> RunwareVideoAdapter {
        let mut config = GenlyConfig::new().with_runware_key("rw-test");
        config.endpoints.runware = url.to_string();
        RunwareVideoAdapter::from_config(&config)
            .with_poll_options(PollOptions::fixed(5, Duration::from_millis(1)))
    }

    #[test]
    fn test_is_video_model() {
        assert!(is_video_model("bytedance:1@1"));
        assert!(is_video_model("klingai:5@3"));
        assert!(!is_video_model("runware:100@1"));
        assert!(!is_video_model("veo3"));
    }

    #[test]
    fn test_task_outcome() {
        let pending = serde_json::json!([{"taskUUID": "t", "status": "processing"}]);
        assert!(matches!(
            task_outcome(pending.as_array().unwrap(), "t"),
            PollOutcome::Pending
        ));

        let done = serde_json::json!([{"taskUUID": "t", "status": "success", "videoURL": "https://vm.runware.ai/v.mp4", "cost": 0.18}]);
        match task_outcome(done.as_array().unwrap(), "t") {
            PollOutcome::Ready(result) => {
                assert_eq!(result.url(), Some("https://vm.runware.ai/v.mp4"));
                assert_eq!(result.cost, Some(0.18));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let failed = serde_json::json!([{"taskUUID": "t", "status": "error", "message": "nsfw"}]);
        assert_eq!(
            task_outcome(failed.as_array().unwrap(), "t").map_failed(),
            Some("nsfw".to_string())
        );

        assert!(matches!(task_outcome(&[], "t"), PollOutcome::Pending));
    }

    #[test]
    fn test_task_outcome_ignores_other_tasks() {
        let other = serde_json::json!([
            {"taskUUID": "other", "status": "success", "videoURL": "https://vm.runware.ai/other.mp4"},
            {"taskUUID": "also-other", "status": "error", "message": "not ours"}
        ]);
        assert!(matches!(
            task_outcome(other.as_array().unwrap(), "t"),
            PollOutcome::Pending
        ));

        let mixed = serde_json::json!([
            {"taskUUID": "other", "status": "success", "videoURL": "https://vm.runware.ai/other.mp4"},
            {"taskUUID": "t", "status": "success", "videoURL": "https://vm.runware.ai/mine.mp4"}
        ]);
        match task_outcome(mixed.as_array().unwrap(), "t") {
            PollOutcome::Ready(result) => assert_eq!(result.url(), Some("https://vm.runware.ai/mine.mp4")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    trait FailedReason {
        fn map_failed(self) -> Option<String>;
    }

    impl<T> FailedReason for PollOutcome<T> {
        fn map_failed(self) -> Option<String> {
            match self {
                PollOutcome::Failed(reason) => Some(reason),
                _ => None,
            }
        }
    }

    #[tokio::test]
    async fn test_create_then_poll_until_success() {
        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#""taskType":"videoInference""#.into()),
                Matcher::Regex(r#""deliveryMethod":"async""#.into()),
                Matcher::Regex(r#""cameraFixed":false"#.into()),
            ]))
            .with_status(200)
            .with_body(r#"{"data":[{"taskType":"videoInference","taskUUID":"ignored"}]}"#)
            .create_async()
            .await;

        let checks = Arc::new(AtomicUsize::new(0));
        let counter = checks.clone();
        let status = server
            .mock("POST", "/")
            .match_body(Matcher::Regex(r#""taskType":"getResponse""#.into()))
            .with_status(200)
            .with_body_from_request(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    br#"{"data":[{"status":"processing"}]}"#.to_vec()
                } else {
                    br#"{"data":[{"status":"success","videoURL":"https://vm.runware.ai/clip.mp4","cost":0.14}]}"#.to_vec()
                }
            })
            .expect(3)
            .create_async()
            .await;

        let request = GenerationRequest::new("a paper boat", QualityTier::VideoStandard);
        let result = adapter(&server.url())
            .invoke(&request, &InvokeContext::default())
            .await
            .unwrap();

        create.assert_async().await;
        status.assert_async().await;
        assert_eq!(result.url, "https://vm.runware.ai/clip.mp4");
        assert_eq!(result.kind, MediaKind::Video);
        assert_eq!(result.cost, Some(0.14));
        assert_eq!(result.duration_secs, Some(5.0));
    }

    #[tokio::test]
    async fn test_task_error_is_terminal() {
        let mut server = mockito::Server::new_async().await;
        let _create = server
            .mock("POST", "/")
            .match_body(Matcher::Regex(r#""taskType":"videoInference""#.into()))
            .with_status(200)
            .with_body(r#"{"data":[{"taskType":"videoInference"}]}"#)
            .create_async()
            .await;
        let status = server
            .mock("POST", "/")
            .match_body(Matcher::Regex(r#""taskType":"getResponse""#.into()))
            .with_status(200)
            .with_body(r#"{"errors":[{"message":"content moderation"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let request = GenerationRequest::new("a paper boat", QualityTier::VideoStandard);
        let err = adapter(&server.url())
            .invoke(&request, &InvokeContext::default())
            .await
            .unwrap_err();
        status.assert_async().await;
        assert!(err.to_string().contains("content moderation"));
    }

    #[tokio::test]
    async fn test_unsupported_size_rejected() {
        let request = GenerationRequest::new("a paper boat", QualityTier::VideoStandard).with_size(1000, 1000);
        let err = adapter("http://127.0.0.1:9")
            .invoke(&request, &InvokeContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GenlyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_two_frames_rejected() {
        let request = GenerationRequest::new("a paper boat", QualityTier::VideoStandard)
            .with_reference(ReferenceImage::url("https://example.com/a.png"))
            .with_reference(ReferenceImage::url("https://example.com/b.png"));
        let err = adapter("http://127.0.0.1:9")
            .invoke(&request, &InvokeContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GenlyError::Validation(_)));
    }
}
