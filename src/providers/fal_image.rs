//! Seedream 4K text-to-image through the fal.ai queue.

use crate::config::{Credential, GenlyConfig, Timeouts};
use crate::error::{GenlyError, Result};
use crate::extract::find_media;
use crate::poll::{poll, PollOptions};
use crate::providers::fal::{FalQueue, PROVIDER};
use crate::providers::{model_or_default, AdapterKind, InvokeContext, MediaAdapter, ReferenceSupport};
use crate::types::{GenerationRequest, MediaKind, MediaResult};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Seedream 4 text-to-image.
pub const SEEDREAM_4: &str = "fal-ai/bytedance/seedream/v4/text-to-image";

/// Requests at or above this edge length are sent at their own size.
const NATIVE_4K_EDGE: u32 = 2048;

/// 4K output presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UltraHdFormat {
    /// 4096x4096.
    Square,
    /// 2160x3840.
    Portrait,
    /// 3840x2160.
    Landscape,
}

impl UltraHdFormat {
    /// Pixel dimensions as `(width, height)`.
    pub const fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Square => (4096, 4096),
            Self::Portrait => (2160, 3840),
            Self::Landscape => (3840, 2160),
        }
    }

    /// The preset with the same orientation as `width` x `height`.
    pub fn for_size(width: u32, height: u32) -> Self {
        match width.cmp(&height) {
            std::cmp::Ordering::Equal => Self::Square,
            std::cmp::Ordering::Less => Self::Portrait,
            std::cmp::Ordering::Greater => Self::Landscape,
        }
    }
}

/// Output size for a request: its own size when already 4K-class, otherwise
/// the preset matching its orientation.
fn output_size(request: &GenerationRequest) -> (u32, u32) {
    if request.width >= NATIVE_4K_EDGE && request.height >= NATIVE_4K_EDGE {
        (request.width, request.height)
    } else {
        UltraHdFormat::for_size(request.width, request.height).dimensions()
    }
}

/// 4K still images on fal.ai.
#[derive(Debug, Clone)]
pub struct FalImageAdapter {
    queue: FalQueue,
    timeouts: Timeouts,
    poll_options: PollOptions,
}

impl FalImageAdapter {
    /// Creates the adapter from shared configuration.
    pub fn from_config(config: &GenlyConfig) -> Self {
        Self {
            queue: FalQueue::from_config(config),
            timeouts: config.timeouts,
            poll_options: PollOptions::fixed(90, Duration::from_secs(2))
                .with_check_timeout(config.timeouts.status_check)
                .with_progress_range(20, 95),
        }
    }

    /// Overrides the polling schedule.
    pub fn with_poll_options(mut self, options: PollOptions) -> Self {
        self.poll_options = options;
        self
    }
}

/// `images[0].url`, `images[0]` as a string, `image.url`, then `url`; anything
/// else goes through the shared extractor.
fn image_url(output: &Value) -> Option<String> {
    let first = output.pointer("/images/0");
    let known = [
        first.and_then(|i| i.get("url")),
        first,
        output.pointer("/image/url"),
        output.get("url"),
    ]
    .into_iter()
    .flatten()
    .find_map(Value::as_str);
    if let Some(url) = known {
        return Some(url.to_string());
    }
    find_media(output).map(|found| found.into_url())
}

#[async_trait]
impl MediaAdapter for FalImageAdapter {
    async fn invoke(&self, request: &GenerationRequest, ctx: &InvokeContext) -> Result<MediaResult> {
        let key = self.queue.api_key("4K image generation")?;
        let model = model_or_default(request, self.default_model());
        if !request.reference_images.is_empty() {
            return Err(GenlyError::Validation(format!("{model} does not take reference images")));
        }

        let (width, height) = output_size(request);
        let body = SeedreamRequest {
            prompt: &request.prompt,
            image_size: ImageSize { width, height },
            num_images: 1,
            seed: request.seed,
        };

        ctx.progress.report(10);
        let submit = ctx
            .guard(self.queue.submit(key, model, &body, self.timeouts.task_create))
            .await?;

        let submitted = &submit;
        let timeout = self.poll_options.check_timeout;
        let output = poll(PROVIDER, &self.poll_options, &ctx.progress, &ctx.cancel, move |_| {
            self.queue.check(key, submitted, model, timeout)
        })
        .await?;
        let url = image_url(&output).ok_or_else(|| GenlyError::extraction(&output))?;

        let mut result = MediaResult::new(url, MediaKind::Image, model, request.tier);
        result.task_id = Some(submit.request_id.clone());
        result.width = Some(width);
        result.height = Some(height);
        result.seed = output.get("seed").and_then(Value::as_u64).or(request.seed);
        Ok(result)
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::FalImage
    }

    fn credential(&self) -> Credential {
        Credential::Fal
    }

    fn is_configured(&self) -> bool {
        self.queue.is_configured()
    }

    fn default_model(&self) -> &str {
        SEEDREAM_4
    }

    fn owns_model(&self, model: &str) -> bool {
        model.starts_with("fal-ai/") && model.contains("/seedream/")
    }

    fn reference_support(&self, _model: &str) -> ReferenceSupport {
        ReferenceSupport::NONE
    }
}

// Request types

#[derive(Debug, Serialize)]
struct SeedreamRequest<'a> {
    prompt: &'a str,
    image_size: ImageSize,
    num_images: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ImageSize {
    width: u32,
    height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QualityTier, ReferenceImage};
    use mockito::Matcher;
    use serde_json::json;

    fn adapter(url: &str) -> FalImageAdapter {
        let mut config = GenlyConfig::new().with_fal_key("fal-key");
        config.endpoints.fal_queue = url.to_string();
        FalImageAdapter::from_config(&config).with_poll_options(PollOptions::fixed(5, Duration::from_millis(1)))
    }

    #[test]
    fn test_format_presets() {
        assert_eq!(UltraHdFormat::for_size(1024, 1024), UltraHdFormat::Square);
        assert_eq!(UltraHdFormat::for_size(832, 1280), UltraHdFormat::Portrait);
        assert_eq!(UltraHdFormat::for_size(1280, 720), UltraHdFormat::Landscape);
        assert_eq!(UltraHdFormat::Portrait.dimensions(), (2160, 3840));
        assert_eq!(UltraHdFormat::Landscape.dimensions(), (3840, 2160));
    }

    #[test]
    fn test_output_size() {
        // The default image size is portrait.
        let request = GenerationRequest::new("p", QualityTier::Ultra);
        assert_eq!(output_size(&request), (2160, 3840));

        let request = GenerationRequest::new("p", QualityTier::Ultra).with_size(3000, 2400);
        assert_eq!(output_size(&request), (3000, 2400));

        let request = GenerationRequest::new("p", QualityTier::Ultra).with_size(3000, 1000);
        assert_eq!(output_size(&request), (3840, 2160));
    }

    #[test]
    fn test_image_url_shapes() {
        let url = "https://v3.fal.media/files/a.png";
        assert_eq!(image_url(&json!({"images": [{"url": url}]})).as_deref(), Some(url));
        assert_eq!(image_url(&json!({"images": [url]})).as_deref(), Some(url));
        assert_eq!(image_url(&json!({"image": {"url": url}})).as_deref(), Some(url));
        assert_eq!(image_url(&json!({"url": url})).as_deref(), Some(url));
        assert_eq!(image_url(&json!({"seed": 4})), None);
    }

    #[test]
    fn test_owns_model() {
        let adapter = adapter("http://localhost");
        assert!(adapter.owns_model(SEEDREAM_4));
        assert!(adapter.owns_model("fal-ai/bytedance/seedream/v4/edit"));
        assert!(!adapter.owns_model("fal-ai/pixverse/v4.5/effects"));
        assert!(!adapter.owns_model("bytedance:1@1"));
    }

    #[tokio::test]
    async fn test_submit_poll_fetch() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let submit = server
            .mock("POST", "/fal-ai/bytedance/seedream/v4/text-to-image")
            .match_header("authorization", "Key fal-key")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#""prompt":"a glacier at noon""#.into()),
                Matcher::Regex(r#""image_size":\{"width":3840,"height":2160\}"#.into()),
            ]))
            .with_status(200)
            .with_body(
                json!({
                    "request_id": "s1",
                    "status_url": format!("{base}/fal-ai/bytedance/requests/s1/status"),
                    "response_url": format!("{base}/fal-ai/bytedance/requests/s1"),
                })
                .to_string(),
            )
            .create_async()
            .await;
        let _status = server
            .mock("GET", "/fal-ai/bytedance/requests/s1/status")
            .with_status(200)
            .with_body(r#"{"status":"COMPLETED"}"#)
            .create_async()
            .await;
        let _result = server
            .mock("GET", "/fal-ai/bytedance/requests/s1")
            .with_status(200)
            .with_body(r#"{"images":[{"url":"https://v3.fal.media/files/glacier.png"}],"seed":77}"#)
            .create_async()
            .await;

        let request = GenerationRequest::new("a glacier at noon", QualityTier::Ultra).with_size(1280, 720);
        let result = adapter(&base)
            .invoke(&request, &InvokeContext::default())
            .await
            .unwrap();

        submit.assert_async().await;
        assert_eq!(result.url, "https://v3.fal.media/files/glacier.png");
        assert_eq!(result.kind, MediaKind::Image);
        assert_eq!((result.width, result.height), (Some(3840), Some(2160)));
        assert_eq!(result.seed, Some(77));
        assert_eq!(result.task_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_rejects_reference_images() {
        let request = GenerationRequest::new("p", QualityTier::Ultra)
            .with_reference(ReferenceImage::url("https://example.com/a.png"));
        let err = adapter("http://127.0.0.1:9")
            .invoke(&request, &InvokeContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GenlyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let adapter = FalImageAdapter::from_config(&GenlyConfig::new());
        let request = GenerationRequest::new("p", QualityTier::Ultra);
        let err = adapter.invoke(&request, &InvokeContext::default()).await.unwrap_err();
        assert!(matches!(err, GenlyError::Configuration { credential: "FAL_KEY", .. }));
    }
}
