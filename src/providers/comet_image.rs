//! Gemini Flash Image through CometAPI's `generateContent` endpoint.

use crate::config::{Credential, GenlyConfig, Timeouts};
use crate::error::{GenlyError, Result, TimeoutKind};
use crate::extract::extract_media;
use crate::http::{Auth, HttpClient};
use crate::providers::reference::load_inline;
use crate::providers::{model_or_default, AdapterKind, InvokeContext, MediaAdapter, ReferenceSupport};
use crate::types::{encode_base64, DataUri, GenerationRequest, ImageFormat, MediaKind, MediaResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

const PROVIDER: &str = "comet";

/// Default multimodal image model.
pub const GEMINI_FLASH_IMAGE: &str = "gemini-2.5-flash-image";

/// Most reference images sent in one request.
pub const MAX_REFERENCE_IMAGES: usize = 3;

const ASPECT_RATIOS: &[(&str, u32, u32)] = &[
    ("1:1", 1, 1),
    ("2:3", 2, 3),
    ("3:2", 3, 2),
    ("3:4", 3, 4),
    ("4:3", 4, 3),
    ("4:5", 4, 5),
    ("5:4", 5, 4),
    ("9:16", 9, 16),
    ("16:9", 16, 9),
    ("21:9", 21, 9),
];

/// Closest supported aspect ratio label for a size.
fn aspect_ratio_for(width: u32, height: u32) -> &'static str {
    let target = (width as f64 / height as f64).ln();
    ASPECT_RATIOS
        .iter()
        .min_by(|a, b| {
            let da = ((a.1 as f64 / a.2 as f64).ln() - target).abs();
            let db = ((b.1 as f64 / b.2 as f64).ln() - target).abs();
            da.total_cmp(&db)
        })
        .map(|r| r.0)
        .unwrap_or("1:1")
}

/// Multimodal image generation with up to three reference images.
#[derive(Debug, Clone)]
pub struct CometImageAdapter {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
    timeouts: Timeouts,
}

impl CometImageAdapter {
    /// Creates the adapter from shared configuration.
    pub fn from_config(config: &GenlyConfig) -> Self {
        Self {
            http: HttpClient::new(PROVIDER),
            base_url: config.endpoints.comet.trim_end_matches('/').to_string(),
            api_key: config.credential(Credential::Comet).map(str::to_string),
            timeouts: config.timeouts,
        }
    }

    fn auth<'a>(key: &'a str) -> Auth<'a> {
        // CometAPI's Gemini proxy takes sk- keys verbatim.
        if key.starts_with("sk-") {
            Auth::Raw(key)
        } else {
            Auth::Bearer(key)
        }
    }
}

#[async_trait]
impl MediaAdapter for CometImageAdapter {
    async fn invoke(&self, request: &GenerationRequest, ctx: &InvokeContext) -> Result<MediaResult> {
        let key = self.api_key.as_deref().ok_or_else(|| GenlyError::Configuration {
            credential: Credential::Comet.env_var(),
            message: "required for multimodal image generation".into(),
        })?;
        let model = model_or_default(request, self.default_model());

        if request.reference_images.len() > MAX_REFERENCE_IMAGES {
            return Err(GenlyError::Validation(format!(
                "{model} accepts at most {MAX_REFERENCE_IMAGES} reference images, got {}",
                request.reference_images.len()
            )));
        }

        ctx.progress.report(10);
        let mut parts = vec![RequestPart::Text {
            text: request.prompt.clone(),
        }];
        for reference in &request.reference_images {
            let inline = ctx
                .guard(load_inline(&self.http, reference, self.timeouts.upload))
                .await?;
            parts.push(RequestPart::InlineData {
                inline_data: InlineData {
                    mime_type: inline.mime_type,
                    data: inline.data,
                },
            });
        }

        let body = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts,
            }],
            generation_config: GenerationConfig {
                response_modalities: vec!["IMAGE"],
                image_config: ImageConfig {
                    aspect_ratio: aspect_ratio_for(request.width, request.height),
                },
            },
        };

        ctx.progress.report(30);
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);
        let start = Instant::now();
        tracing::info!(
            model,
            references = request.reference_images.len(),
            "submitting multimodal image request"
        );
        let response = ctx
            .guard(self.http.post_json(
                &url,
                Self::auth(key),
                &body,
                self.timeouts.generation,
                TimeoutKind::Generation,
            ))
            .await?;
        ctx.progress.report(80);
        tracing::debug!(elapsed_ms = start.elapsed().as_millis() as u64, "multimodal response received");

        let image_url = if response.is_image() {
            let mime = response
                .content_type
                .as_deref()
                .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
                .or_else(|| ImageFormat::from_magic_bytes(&response.body).map(|f| f.mime_type().to_string()))
                .unwrap_or_else(|| "image/png".to_string());
            DataUri::format(&mime, &encode_base64(&response.body))
        } else {
            let value: Value = response.json()?;
            check_blocked(&value)?;
            extract_media(&value)?.into_url()
        };

        let mut result = MediaResult::new(image_url, MediaKind::Image, model, request.tier);
        result.seed = request.seed;
        Ok(result)
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::CometImage
    }

    fn credential(&self) -> Credential {
        Credential::Comet
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn default_model(&self) -> &str {
        GEMINI_FLASH_IMAGE
    }

    fn owns_model(&self, model: &str) -> bool {
        let model = model.to_lowercase();
        model.contains("gemini") && model.contains("image")
    }

    fn reference_support(&self, _model: &str) -> ReferenceSupport {
        ReferenceSupport::up_to(MAX_REFERENCE_IMAGES)
    }
}

/// Rejects responses where the prompt or candidate was blocked.
fn check_blocked(value: &Value) -> Result<()> {
    let Ok(response) = serde_json::from_value::<GenerateContentResponse>(value.clone()) else {
        return Ok(());
    };
    if let Some(feedback) = response.prompt_feedback {
        if let Some(reason) = feedback.block_reason {
            let message = feedback
                .block_reason_message
                .unwrap_or_else(|| format!("prompt blocked: {reason}"));
            return Err(GenlyError::Provider {
                provider: PROVIDER,
                status: None,
                message,
            });
        }
    }
    let finish = response
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref());
    match finish {
        Some(
            reason @ ("SAFETY" | "IMAGE_SAFETY" | "IMAGE_PROHIBITED_CONTENT" | "PROHIBITED_CONTENT"
            | "BLOCKLIST" | "RECITATION" | "IMAGE_RECITATION"),
        ) => Err(GenlyError::Provider {
            provider: PROVIDER,
            status: None,
            message: format!("content blocked by safety filter: {reason}"),
        }),
        _ => Ok(()),
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    image_config: ImageConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageConfig {
    aspect_ratio: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
    #[serde(default)]
    block_reason_message: Option<String>,
}
