//! Provider adapters: one per upstream API flow.
//!
//! | Adapter | Family | Upstream |
//! |---------|--------|----------|
//! | [`RunwareImageAdapter`] | image, classic diffusion | Runware `imageInference` |
//! | [`CometImageAdapter`] | image, multimodal | CometAPI Gemini `generateContent` |
//! | [`CometVideoAdapter`] | video, synchronous chat | CometAPI chat completions |
//! | [`RunwareVideoAdapter`] | video, async task polled by id | Runware `videoInference` |
//! | [`CometVeoAdapter`] | video, async task polled by source scan | CometAPI Veo |
//! | [`FalEffectsAdapter`] | video, async queue | fal.ai PixVerse |
//! | [`FalImageAdapter`] | image, 4K async queue | fal.ai Seedream |

mod comet_image;
mod comet_veo;
mod comet_video;
mod fal;
mod fal_effects;
mod fal_image;
pub(crate) mod reference;
mod runware;
mod runware_video;

pub use comet_image::{CometImageAdapter, GEMINI_FLASH_IMAGE, MAX_REFERENCE_IMAGES};
pub use comet_veo::{CometVeoAdapter, VEO3};
pub use comet_video::{CometVideoAdapter, SORA_2, SORA_2_PRO, VEO3_FAST_FRAMES};
pub use fal_effects::{FalEffectsAdapter, PIXVERSE_EFFECTS, PIXVERSE_I2V};
pub use fal_image::{FalImageAdapter, UltraHdFormat, SEEDREAM_4};
pub use runware::{RunwareImageAdapter, RunwareImageModel};
pub use runware_video::{RunwareVideoAdapter, SEEDANCE_LITE};

use crate::config::Credential;
use crate::error::{GenlyError, Result};
use crate::progress::Progress;
use crate::types::{GenerationRequest, MediaKind, MediaResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Identifies an adapter implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    /// Runware diffusion image models.
    RunwareImage,
    /// CometAPI-hosted Gemini image model.
    CometImage,
    /// CometAPI chat-completion video models.
    CometVideo,
    /// Runware async video tasks.
    RunwareVideo,
    /// CometAPI Veo tasks.
    CometVeo,
    /// fal.ai PixVerse effects.
    FalEffects,
    /// fal.ai Seedream 4K images.
    FalImage,
}

impl AdapterKind {
    /// Short identifier (e.g., "comet-veo").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunwareImage => "runware-image",
            Self::CometImage => "comet-image",
            Self::CometVideo => "comet-video",
            Self::RunwareVideo => "runware-video",
            Self::CometVeo => "comet-veo",
            Self::FalEffects => "fal-effects",
            Self::FalImage => "fal-image",
        }
    }

    /// Human-readable provider name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::RunwareImage => "Runware (Flux / Juggernaut)",
            Self::CometImage => "Gemini Flash Image (CometAPI)",
            Self::CometVideo => "Veo 3 Fast Frames / Sora 2 (CometAPI)",
            Self::RunwareVideo => "Seedance (Runware)",
            Self::CometVeo => "Veo 3 (CometAPI)",
            Self::FalEffects => "PixVerse Effects (fal.ai)",
            Self::FalImage => "Seedream 4K (fal.ai)",
        }
    }

    /// The kind of media this adapter produces.
    pub fn media_kind(&self) -> MediaKind {
        match self {
            Self::RunwareImage | Self::CometImage | Self::FalImage => MediaKind::Image,
            Self::CometVideo | Self::RunwareVideo | Self::CometVeo | Self::FalEffects => {
                MediaKind::Video
            }
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How many reference images a model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceSupport {
    /// Fewest images the model needs.
    pub min: usize,
    /// Most images the model can use.
    pub max: usize,
}

impl ReferenceSupport {
    /// Text-only model.
    pub const NONE: Self = Self { min: 0, max: 0 };

    /// Optional images, up to `max`.
    pub const fn up_to(max: usize) -> Self {
        Self { min: 0, max }
    }

    /// Exactly `n` images.
    pub const fn exactly(n: usize) -> Self {
        Self { min: n, max: n }
    }

    /// True when `count` images are acceptable.
    pub fn accepts(&self, count: usize) -> bool {
        (self.min..=self.max).contains(&count)
    }
}

/// Per-invocation progress sink and cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct InvokeContext {
    /// Progress reporter.
    pub progress: Progress,
    /// Cancels the invocation when triggered.
    pub cancel: CancellationToken,
}

impl InvokeContext {
    /// Runs `fut` unless the invocation is cancelled first.
    pub async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GenlyError::Cancelled),
            result = fut => result,
        }
    }
}

/// A provider flow that turns a request into a media reference.
#[async_trait]
pub trait MediaAdapter: Send + Sync {
    /// Generates media. `request.model` is set by the orchestrator.
    async fn invoke(&self, request: &GenerationRequest, ctx: &InvokeContext) -> Result<MediaResult>;

    /// Returns the kind of this adapter.
    fn kind(&self) -> AdapterKind;

    /// Returns the name of this adapter for display.
    fn name(&self) -> &str {
        self.kind().display_name()
    }

    /// Credential the adapter authenticates with.
    fn credential(&self) -> Credential;

    /// True when the credential is present.
    fn is_configured(&self) -> bool;

    /// Model used when the request does not name one.
    fn default_model(&self) -> &str;

    /// True when `model` is served by this adapter.
    fn owns_model(&self, model: &str) -> bool;

    /// Reference image limits for `model`.
    fn reference_support(&self, model: &str) -> ReferenceSupport;
}

/// Extension trait for adapters with retry logic.
#[async_trait]
pub trait MediaAdapterExt: MediaAdapter {
    /// Invokes with automatic retries on transient failures.
    async fn invoke_with_retries(
        &self,
        request: &GenerationRequest,
        ctx: &InvokeContext,
        max_retries: u32,
    ) -> Result<MediaResult> {
        let mut attempt = 0;
        loop {
            match self.invoke(request, ctx).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    let delay = e.retry_after().unwrap_or(std::time::Duration::from_secs(1));
                    tracing::warn!(
                        adapter = %self.kind(),
                        attempt,
                        max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient error: {e}"
                    );
                    ctx.guard(async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<T: MediaAdapter + ?Sized> MediaAdapterExt for T {}

pub(crate) fn model_or_default<'a>(request: &'a GenerationRequest, default: &'a str) -> &'a str {
    request.model.as_deref().unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_support() {
        assert!(ReferenceSupport::NONE.accepts(0));
        assert!(!ReferenceSupport::NONE.accepts(1));
        assert!(ReferenceSupport::up_to(3).accepts(3));
        assert!(!ReferenceSupport::up_to(3).accepts(4));
        assert!(!ReferenceSupport::exactly(1).accepts(0));
        assert!(ReferenceSupport::exactly(1).accepts(1));
    }

    #[test]
    fn test_adapter_kind_serde() {
        let json = serde_json::to_string(&AdapterKind::FalEffects).unwrap();
        assert_eq!(json, "\"fal-effects\"");
        assert_eq!(AdapterKind::CometVeo.media_kind(), MediaKind::Video);
        assert_eq!(AdapterKind::FalImage.media_kind(), MediaKind::Image);
    }

    #[tokio::test]
    async fn test_guard_returns_cancelled() {
        let ctx = InvokeContext::default();
        ctx.cancel.cancel();
        let result: Result<()> = ctx
            .guard(async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(GenlyError::Cancelled)));
    }
}
