//! Runware task API: shared client and the classic diffusion image adapter.

use crate::config::{Credential, GenlyConfig, Timeouts};
use crate::error::{sanitize_error_message, GenlyError, Result, TimeoutKind};
use crate::extract::extract_media;
use crate::http::{Auth, HttpClient};
use crate::providers::reference::load_inline;
use crate::providers::{model_or_default, AdapterKind, InvokeContext, MediaAdapter, ReferenceSupport};
use crate::types::{nearest_size, GenerationRequest, MediaKind, MediaResult, ReferenceImage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

pub(crate) const PROVIDER: &str = "runware";

/// Client for Runware's task endpoint, where every call is a JSON array of tasks.
#[derive(Debug, Clone)]
pub(crate) struct RunwareClient {
    http: HttpClient,
    url: String,
    api_key: Option<String>,
    pub timeouts: Timeouts,
}

impl RunwareClient {
    pub fn from_config(config: &GenlyConfig) -> Self {
        Self {
            http: HttpClient::new(PROVIDER),
            url: config.endpoints.runware.clone(),
            api_key: config.credential(Credential::Runware).map(str::to_string),
            timeouts: config.timeouts,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| GenlyError::Configuration {
            credential: Credential::Runware.env_var(),
            message: "required for Runware generation".into(),
        })
    }

    /// Posts tasks and returns the parsed envelope.
    ///
    /// An envelope with errors and no data is a provider failure.
    pub async fn run<T: Serialize + Sync>(
        &self,
        tasks: &[T],
        timeout: Duration,
        kind: TimeoutKind,
    ) -> Result<RunwareResponse> {
        let key = self.api_key()?;
        let response = self
            .http
            .post_json(&self.url, Auth::Bearer(key), tasks, timeout, kind)
            .await?;
        let envelope: RunwareResponse = response.json()?;
        if envelope.data.is_empty() {
            if let Some(error) = envelope.errors.first() {
                return Err(GenlyError::Provider {
                    provider: PROVIDER,
                    status: None,
                    message: sanitize_error_message(&error.message),
                });
            }
        }
        Ok(envelope)
    }

    /// Returns a URL Runware can read for the reference image.
    ///
    /// Remote URLs are used as-is; local and inline images are uploaded first.
    pub async fn reference_url(&self, reference: &ReferenceImage) -> Result<String> {
        if let ReferenceImage::Url { url } = reference {
            return Ok(url.clone());
        }
        let inline = load_inline(&self.http, reference, self.timeouts.upload).await?;
        let task = ImageUploadTask {
            task_type: "imageUpload",
            task_uuid: Uuid::new_v4().to_string(),
            image: inline.data_uri(),
        };
        let envelope = self
            .run(&[task], self.timeouts.upload, TimeoutKind::Upload)
            .await?;
        let uploaded = envelope
            .data
            .iter()
            .find_map(|item| {
                ["imageURL", "imagePath", "imageUUID"]
                    .iter()
                    .find_map(|k| item.get(*k).and_then(Value::as_str))
            })
            .map(str::to_string);

        match uploaded {
            Some(url) => {
                tracing::debug!(url = %url, "uploaded reference image");
                Ok(url)
            }
            None => Err(GenlyError::Provider {
                provider: PROVIDER,
                status: None,
                message: "image upload returned no image reference".into(),
            }),
        }
    }
}

/// Classic diffusion model settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RunwareImageModel {
    /// Runware model id (AIR).
    pub id: &'static str,
    /// Display name.
    pub name: &'static str,
    /// Sampling steps.
    pub steps: u32,
    /// Guidance scale.
    pub cfg_scale: f32,
    /// Scheduler name.
    pub scheduler: &'static str,
    /// Output format ("PNG" or "JPEG").
    pub output_format: &'static str,
    /// Output quality, 20-99 for lossy formats.
    pub output_quality: u32,
    /// Whether the negative prompt is honored.
    pub supports_negative_prompt: bool,
    /// Reference images the model accepts.
    pub max_references: usize,
    /// Supported output sizes; requests are coerced to the nearest one.
    pub sizes: &'static [(u32, u32)],
}

impl RunwareImageModel {
    /// Flux Schnell: fast, accepts one reference image.
    pub const FLUX_SCHNELL: Self = Self {
        id: "runware:100@1",
        name: "Flux Schnell",
        steps: 4,
        cfg_scale: 2.5,
        scheduler: "FlowMatchEulerDiscreteScheduler",
        output_format: "PNG",
        output_quality: 90,
        supports_negative_prompt: false,
        max_references: 1,
        sizes: &[(832, 1280), (1280, 832), (1024, 1024)],
    };

    /// Juggernaut Pro: slower, text-only.
    pub const JUGGERNAUT_PRO: Self = Self {
        id: "rundiffusion:130@100",
        name: "Juggernaut Pro",
        steps: 50,
        cfg_scale: 8.0,
        scheduler: "EulerAncestralDiscreteScheduler",
        output_format: "JPEG",
        output_quality: 99,
        supports_negative_prompt: true,
        max_references: 0,
        sizes: &[(832, 1280), (1280, 832)],
    };

    /// Known models.
    pub const ALL: [Self; 2] = [Self::FLUX_SCHNELL, Self::JUGGERNAUT_PRO];

    /// Settings for `id`; unknown ids reuse Flux Schnell settings.
    pub fn lookup(id: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|m| m.id == id)
            .unwrap_or(Self::FLUX_SCHNELL)
    }
}

/// True for Runware AIR ids such as `runware:100@1`.
pub(crate) fn is_air_id(model: &str) -> bool {
    match model.split_once(':') {
        Some((source, version)) => {
            !source.is_empty()
                && !source.contains('/')
                && version
                    .split_once('@')
                    .is_some_and(|(a, b)| !a.is_empty() && !b.is_empty())
        }
        None => false,
    }
}

/// Classic diffusion image generation through Runware.
#[derive(Debug, Clone)]
pub struct RunwareImageAdapter {
    client: RunwareClient,
}

impl RunwareImageAdapter {
    /// Creates the adapter from shared configuration.
    pub fn from_config(config: &GenlyConfig) -> Self {
        Self {
            client: RunwareClient::from_config(config),
        }
    }
}

#[async_trait]
impl MediaAdapter for RunwareImageAdapter {
    async fn invoke(&self, request: &GenerationRequest, ctx: &InvokeContext) -> Result<MediaResult> {
        self.client.api_key()?;
        let model_id = model_or_default(request, self.default_model());
        let model = RunwareImageModel::lookup(model_id);

        if request.reference_images.len() > model.max_references {
            return Err(GenlyError::Validation(format!(
                "{} accepts at most {} reference image(s), got {}",
                model.name,
                model.max_references,
                request.reference_images.len()
            )));
        }

        let (width, height) = nearest_size(request.width, request.height, model.sizes)
            .unwrap_or((request.width, request.height));
        if (width, height) != (request.width, request.height) {
            tracing::debug!(
                requested = %format!("{}x{}", request.width, request.height),
                coerced = %format!("{width}x{height}"),
                model = model_id,
                "coerced dimensions to supported size"
            );
        }

        ctx.progress.report(10);

        let mut reference_images = Vec::with_capacity(request.reference_images.len());
        for reference in &request.reference_images {
            reference_images.push(ctx.guard(self.client.reference_url(reference)).await?);
        }

        let task = ImageInferenceTask {
            task_type: "imageInference",
            task_uuid: Uuid::new_v4().to_string(),
            positive_prompt: request.prompt.clone(),
            negative_prompt: request
                .negative_prompt
                .clone()
                .filter(|n| model.supports_negative_prompt && !n.trim().is_empty()),
            model: model_id.to_string(),
            width,
            height,
            steps: model.steps,
            cfg_scale: request.cfg_scale.unwrap_or(model.cfg_scale),
            scheduler: model.scheduler,
            output_format: model.output_format,
            output_type: "URL",
            include_cost: true,
            number_results: 1,
            output_quality: model.output_quality,
            seed: request.seed,
            reference_images: (!reference_images.is_empty()).then_some(reference_images),
        };
        let task_uuid = task.task_uuid.clone();

        tracing::info!(task_uuid = %task_uuid, model = model_id, width, height, "submitting Runware image task");
        let envelope = ctx
            .guard(self.client.run(&[task], self.client.timeouts.request, TimeoutKind::Request))
            .await?;
        ctx.progress.report(50);

        let item: Option<ImageInferenceResult> = envelope
            .data
            .iter()
            .find(|item| item.get("imageURL").is_some() || item.get("imagePath").is_some())
            .map(|item| serde_json::from_value(item.clone()))
            .transpose()?;

        let (url, cost, seed, returned_uuid) = match item {
            Some(item) => {
                let url = item.image_url.or(item.image_path).unwrap_or_default();
                (url, item.cost, item.seed, item.task_uuid)
            }
            None => {
                let value = Value::Array(envelope.data.clone());
                (extract_media(&value)?.into_url(), None, None, None)
            }
        };
        if url.is_empty() {
            return Err(GenlyError::extraction(&Value::Array(envelope.data)));
        }

        let mut result = MediaResult::new(url, MediaKind::Image, model_id, request.tier);
        result.cost = cost;
        result.seed = seed.or(request.seed);
        result.task_id = Some(returned_uuid.unwrap_or(task_uuid));
        result.width = Some(width);
        result.height = Some(height);
        Ok(result)
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::RunwareImage
    }

    fn credential(&self) -> Credential {
        Credential::Runware
    }

    fn is_configured(&self) -> bool {
        self.client.is_configured()
    }

    fn default_model(&self) -> &str {
        RunwareImageModel::FLUX_SCHNELL.id
    }

    fn owns_model(&self, model: &str) -> bool {
        RunwareImageModel::ALL.iter().any(|m| m.id == model)
            || (is_air_id(model) && !crate::providers::runware_video::is_video_model(model))
    }

    fn reference_support(&self, model: &str) -> ReferenceSupport {
        ReferenceSupport::up_to(RunwareImageModel::lookup(model).max_references)
    }
}

// Wire types

#[derive(Debug, Deserialize)]
pub(crate) struct RunwareResponse {
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub errors: Vec<RunwareTaskError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RunwareTaskError {
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "taskUUID")]
    pub task_uuid: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageUploadTask {
    task_type: &'static str,
    #[serde(rename = "taskUUID")]
    task_uuid: String,
    image: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageInferenceTask {
    task_type: &'static str,
    #[serde(rename = "taskUUID")]
    task_uuid: String,
    positive_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<String>,
    model: String,
    width: u32,
    height: u32,
    steps: u32,
    #[serde(rename = "CFGScale")]
    cfg_scale: f32,
    scheduler: &'static str,
    output_format: &'static str,
    output_type: &'static str,
    include_cost: bool,
    number_results: u32,
    output_quality: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_images: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ImageInferenceResult {
    #[serde(rename = "imageURL")]
    image_url: Option<String>,
    #[serde(rename = "imagePath")]
    image_path: Option<String>,
    #[serde(default)]
    cost: Option<f64>,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default, rename = "taskUUID")]
    task_uuid: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QualityTier;
    use mockito::Matcher;

    fn config(url: &str) -> GenlyConfig {
        let mut config = GenlyConfig::new().with_runware_key("rw-test");
        config.endpoints.runware = url.to_string();
        config
    }

    #[test]
    fn test_model_lookup() {
        assert_eq!(RunwareImageModel::lookup("rundiffusion:130@100").steps, 50);
        assert_eq!(RunwareImageModel::lookup("civitai:4384@128713").steps, 4);
    }

    #[test]
    fn test_is_air_id() {
        assert!(is_air_id("runware:100@1"));
        assert!(is_air_id("civitai:4384@128713"));
        assert!(!is_air_id("gemini-2.5-flash-image"));
        assert!(!is_air_id("fal-ai/pixverse/v4.5/effects"));
        assert!(!is_air_id("runware:100"));
    }

    #[test]
    fn test_owns_model() {
        let adapter = RunwareImageAdapter::from_config(&GenlyConfig::new());
        assert!(adapter.owns_model("runware:100@1"));
        assert!(adapter.owns_model("civitai:4384@128713"));
        assert!(!adapter.owns_model("bytedance:1@1"));
        assert!(!adapter.owns_model("veo3"));
    }

    #[test]
    fn test_inference_task_serialization() {
        let task = ImageInferenceTask {
            task_type: "imageInference",
            task_uuid: "uuid-1".into(),
            positive_prompt: "a red fox".into(),
            negative_prompt: None,
            model: "runware:100@1".into(),
            width: 832,
            height: 1280,
            steps: 4,
            cfg_scale: 2.5,
            scheduler: "FlowMatchEulerDiscreteScheduler",
            output_format: "PNG",
            output_type: "URL",
            include_cost: true,
            number_results: 1,
            output_quality: 90,
            seed: None,
            reference_images: None,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["taskType"], "imageInference");
        assert_eq!(json["taskUUID"], "uuid-1");
        assert_eq!(json["positivePrompt"], "a red fox");
        assert_eq!(json["CFGScale"], 2.5);
        assert_eq!(json["outputType"], "URL");
        assert!(json.get("negativePrompt").is_none());
        assert!(json.get("referenceImages").is_none());
    }

    #[test]
    fn test_response_deserialization() {
        let json = r#"{"data":[{"taskType":"imageInference","imageURL":"https://im.runware.ai/a.png","cost":0.0006,"seed":42,"taskUUID":"t-1"}]}"#;
        let envelope: RunwareResponse = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.data.len(), 1);
        assert!(envelope.errors.is_empty());
        let item: ImageInferenceResult = serde_json::from_value(envelope.data[0].clone()).unwrap();
        assert_eq!(item.image_url.as_deref(), Some("https://im.runware.ai/a.png"));
        assert_eq!(item.seed, Some(42));
    }

    #[tokio::test]
    async fn test_generate_coerces_dimensions() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/")
            .match_header("authorization", "Bearer rw-test")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#""taskType":"imageInference""#.into()),
                Matcher::Regex(r#""model":"runware:100@1""#.into()),
                Matcher::Regex(r#""width":1024,"height":1024"#.into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"taskType":"imageInference","imageURL":"https://im.runware.ai/out.png","cost":0.0013,"seed":7,"taskUUID":"abc"}]}"#)
            .create_async()
            .await;

        let adapter = RunwareImageAdapter::from_config(&config(&server.url()));
        let request = GenerationRequest::new("a teapot", QualityTier::Standard).with_size(512, 512);
        let result = adapter.invoke(&request, &InvokeContext::default()).await.unwrap();

        m.assert_async().await;
        assert_eq!(result.url, "https://im.runware.ai/out.png");
        assert_eq!(result.kind, MediaKind::Image);
        assert_eq!(result.cost, Some(0.0013));
        assert_eq!(result.seed, Some(7));
        assert_eq!(result.task_id.as_deref(), Some("abc"));
        assert_eq!((result.width, result.height), (Some(1024), Some(1024)));
    }

    #[tokio::test]
    async fn test_reference_image_is_uploaded_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.png");
        tokio::fs::write(&path, crate::providers::reference::tests::png_bytes())
            .await
            .unwrap();

        let mut server = mockito::Server::new_async().await;
        let upload = server
            .mock("POST", "/")
            .match_body(Matcher::Regex(r#""taskType":"imageUpload""#.into()))
            .with_status(200)
            .with_body(r#"{"data":[{"taskType":"imageUpload","imageURL":"https://im.runware.ai/uploaded.png"}]}"#)
            .create_async()
            .await;
        let inference = server
            .mock("POST", "/")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#""taskType":"imageInference""#.into()),
                Matcher::Regex(r#""referenceImages":\["https://im.runware.ai/uploaded.png"\]"#.into()),
            ]))
            .with_status(200)
            .with_body(r#"{"data":[{"imageURL":"https://im.runware.ai/final.png"}]}"#)
            .create_async()
            .await;

        let adapter = RunwareImageAdapter::from_config(&config(&server.url()));
        let request = GenerationRequest::new("same cat, new hat", QualityTier::Standard)
            .with_reference(ReferenceImage::file(&path));
        let result = adapter.invoke(&request, &InvokeContext::default()).await.unwrap();

        upload.assert_async().await;
        inference.assert_async().await;
        assert_eq!(result.url, "https://im.runware.ai/final.png");
    }

    #[tokio::test]
    async fn test_error_envelope_is_provider_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(r#"{"errors":[{"code":"invalidPositivePrompt","message":"Invalid prompt","taskUUID":"x"}]}"#)
            .create_async()
            .await;

        let adapter = RunwareImageAdapter::from_config(&config(&server.url()));
        let request = GenerationRequest::new("a teapot", QualityTier::Standard);
        let err = adapter.invoke(&request, &InvokeContext::default()).await.unwrap_err();
        match err {
            GenlyError::Provider { provider, message, .. } => {
                assert_eq!(provider, "runware");
                assert_eq!(message, "Invalid prompt");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_key_is_configuration_error() {
        let adapter = RunwareImageAdapter::from_config(&GenlyConfig::new());
        let request = GenerationRequest::new("a teapot", QualityTier::Standard);
        let err = adapter.invoke(&request, &InvokeContext::default()).await.unwrap_err();
        assert!(matches!(
            err,
            GenlyError::Configuration {
                credential: "RUNWARE_API_KEY",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_text_only_model_rejects_references() {
        let adapter = RunwareImageAdapter::from_config(&config("http://127.0.0.1:9"));
        let request = GenerationRequest::new("a teapot", QualityTier::Premium)
            .with_model("rundiffusion:130@100")
            .with_reference(ReferenceImage::url("https://example.com/a.png"));
        let err = adapter.invoke(&request, &InvokeContext::default()).await.unwrap_err();
        assert!(matches!(err, GenlyError::Validation(_)));
    }
}
