//! Tier routing and the generation entry point.
//!
//! The orchestrator maps a [`QualityTier`] (or an explicit model id) onto one
//! of the registered [`MediaAdapter`]s, applies the reference-image fallback
//! policy, and annotates adapter failures with the adapter and tier in use.

use crate::config::GenlyConfig;
use crate::error::{GenlyError, Result};
use crate::progress::Progress;
use crate::providers::{
    AdapterKind, CometImageAdapter, CometVeoAdapter, CometVideoAdapter, FalEffectsAdapter, FalImageAdapter, InvokeContext,
    MediaAdapter, MediaAdapterExt, RunwareImageAdapter, RunwareImageModel, RunwareVideoAdapter, GEMINI_FLASH_IMAGE,
    PIXVERSE_EFFECTS, SEEDANCE_LITE, VEO3, VEO3_FAST_FRAMES,
};
use crate::types::{GenerationRequest, MediaResult, QualityTier};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

/// Static routing entry for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierRoute {
    /// Tier being routed.
    pub tier: QualityTier,
    /// Adapter that serves it.
    pub adapter: AdapterKind,
    /// Model used when the request names none.
    pub model: &'static str,
    /// Tier to switch to when the model cannot take the reference images.
    pub fallback: Option<QualityTier>,
}

/// Routing table, one entry per tier in [`QualityTier::ALL`] order.
pub const ROUTES: [TierRoute; 7] = [
    TierRoute {
        tier: QualityTier::Standard,
        adapter: AdapterKind::RunwareImage,
        model: RunwareImageModel::FLUX_SCHNELL.id,
        fallback: Some(QualityTier::Ultra),
    },
    TierRoute {
        tier: QualityTier::Premium,
        adapter: AdapterKind::RunwareImage,
        model: RunwareImageModel::JUGGERNAUT_PRO.id,
        fallback: Some(QualityTier::Ultra),
    },
    TierRoute {
        tier: QualityTier::Ultra,
        adapter: AdapterKind::CometImage,
        model: GEMINI_FLASH_IMAGE,
        fallback: None,
    },
    TierRoute {
        tier: QualityTier::VideoStandard,
        adapter: AdapterKind::RunwareVideo,
        model: SEEDANCE_LITE,
        fallback: None,
    },
    TierRoute {
        tier: QualityTier::VideoSync,
        adapter: AdapterKind::CometVideo,
        model: VEO3_FAST_FRAMES,
        fallback: None,
    },
    TierRoute {
        tier: QualityTier::VideoAsync,
        adapter: AdapterKind::CometVeo,
        model: VEO3,
        fallback: None,
    },
    TierRoute {
        tier: QualityTier::Effects,
        adapter: AdapterKind::FalEffects,
        model: PIXVERSE_EFFECTS,
        fallback: None,
    },
];

/// Order in which adapters are asked whether they own an explicit model id.
const MODEL_OWNERSHIP_ORDER: [AdapterKind; 7] = [
    AdapterKind::CometImage,
    AdapterKind::CometVideo,
    AdapterKind::CometVeo,
    AdapterKind::FalImage,
    AdapterKind::FalEffects,
    AdapterKind::RunwareVideo,
    AdapterKind::RunwareImage,
];

/// Returns the route for `tier`.
pub fn route(tier: QualityTier) -> &'static TierRoute {
    // ROUTES is indexed in QualityTier::ALL order.
    &ROUTES[tier as usize]
}

/// A tier's routing plus whether its credential is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    /// Tier.
    pub tier: QualityTier,
    /// Adapter serving the tier.
    pub adapter: AdapterKind,
    /// Adapter display name.
    pub provider: String,
    /// Default model.
    pub model: &'static str,
    /// Environment variable holding the credential.
    pub credential: &'static str,
    /// True when the credential is set.
    pub configured: bool,
    /// Fallback tier for reference images the model cannot take.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<QualityTier>,
}

/// Where a request will be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Adapter to invoke.
    pub adapter: AdapterKind,
    /// Model id to request.
    pub model: String,
    /// Tier actually used.
    pub tier: QualityTier,
    /// Requested tier, when a fallback switched away from it.
    pub fallback_from: Option<QualityTier>,
}

/// Progress and cancellation for one [`Orchestrator::generate_with`] call.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Progress sink.
    pub progress: Progress,
    /// Cancels the generation when triggered.
    pub cancel: CancellationToken,
}

/// Routes generation requests to provider adapters.
#[derive(Clone)]
pub struct Orchestrator {
    adapters: HashMap<AdapterKind, Arc<dyn MediaAdapter>>,
    max_retries: u32,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().map(AdapterKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("Orchestrator")
            .field("adapters", &kinds)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl Orchestrator {
    /// Registers every adapter using the shared configuration.
    pub fn from_config(config: &GenlyConfig) -> Self {
        Self::builder_from_config(config).build()
    }

    /// A builder preloaded with every adapter, for further customization.
    pub fn builder_from_config(config: &GenlyConfig) -> OrchestratorBuilder {
        Self::builder()
            .adapter(Arc::new(RunwareImageAdapter::from_config(config)))
            .adapter(Arc::new(CometImageAdapter::from_config(config)))
            .adapter(Arc::new(CometVideoAdapter::from_config(config)))
            .adapter(Arc::new(RunwareVideoAdapter::from_config(config)))
            .adapter(Arc::new(CometVeoAdapter::from_config(config)))
            .adapter(Arc::new(FalEffectsAdapter::from_config(config)))
            .adapter(Arc::new(FalImageAdapter::from_config(config)))
    }

    /// Creates a builder with no adapters.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Lists every tier with its adapter and credential status.
    pub fn routes(&self) -> Vec<RouteInfo> {
        ROUTES
            .iter()
            .map(|route| {
                let adapter = self.adapters.get(&route.adapter);
                RouteInfo {
                    tier: route.tier,
                    adapter: route.adapter,
                    provider: adapter
                        .map(|a| a.name().to_string())
                        .unwrap_or_else(|| route.adapter.display_name().to_string()),
                    model: route.model,
                    credential: adapter
                        .map(|a| a.credential().env_var())
                        .unwrap_or("unregistered"),
                    configured: adapter.is_some_and(|a| a.is_configured()),
                    fallback: route.fallback,
                }
            })
            .collect()
    }

    fn adapter(&self, kind: AdapterKind) -> Result<&Arc<dyn MediaAdapter>> {
        self.adapters.get(&kind).ok_or_else(|| {
            GenlyError::Validation(format!("no adapter registered for {}", kind.display_name()))
        })
    }

    /// Decides which adapter, model, and tier serve `request`.
    ///
    /// Rules, first match wins: an explicit model goes to the adapter owning it;
    /// reference images the tier's model cannot take switch to the tier's
    /// fallback; otherwise the tier's own route is used.
    pub fn resolve(&self, request: &GenerationRequest) -> Result<Resolution> {
        request.validate()?;
        let count = request.reference_images.len();

        if let Some(model) = request.model.as_deref() {
            let kind = MODEL_OWNERSHIP_ORDER
                .into_iter()
                .find(|kind| self.adapters.get(kind).is_some_and(|a| a.owns_model(model)))
                .ok_or_else(|| GenlyError::Validation(format!("unknown model: {model}")))?;
            let support = self.adapter(kind)?.reference_support(model);
            if !support.accepts(count) {
                return Err(reference_count_error(model, count, support.min, support.max));
            }
            let tier = if route(request.tier).adapter == kind {
                request.tier
            } else {
                ROUTES
                    .iter()
                    .find(|r| r.adapter == kind)
                    .map_or(request.tier, |r| r.tier)
            };
            return Ok(Resolution {
                adapter: kind,
                model: model.to_string(),
                tier,
                fallback_from: None,
            });
        }

        let primary = route(request.tier);
        let support = self.adapter(primary.adapter)?.reference_support(primary.model);
        if support.accepts(count) {
            return Ok(Resolution {
                adapter: primary.adapter,
                model: primary.model.to_string(),
                tier: primary.tier,
                fallback_from: None,
            });
        }

        if count > support.max {
            if let Some(fallback) = primary.fallback.map(route) {
                let fallback_support = self.adapter(fallback.adapter)?.reference_support(fallback.model);
                if fallback_support.accepts(count) {
                    info!(
                        from = %primary.tier,
                        to = %fallback.tier,
                        references = count,
                        "Switching tier for reference images"
                    );
                    return Ok(Resolution {
                        adapter: fallback.adapter,
                        model: fallback.model.to_string(),
                        tier: fallback.tier,
                        fallback_from: Some(primary.tier),
                    });
                }
                return Err(reference_count_error(
                    fallback.model,
                    count,
                    fallback_support.min,
                    fallback_support.max,
                ));
            }
        }
        Err(reference_count_error(primary.model, count, support.min, support.max))
    }

    /// Generates media with no progress reporting or cancellation.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<MediaResult> {
        self.generate_with(request, GenerateOptions::default()).await
    }

    /// Generates media, reporting progress and honoring cancellation.
    pub async fn generate_with(&self, request: &GenerationRequest, options: GenerateOptions) -> Result<MediaResult> {
        if options.cancel.is_cancelled() {
            return Err(GenlyError::Cancelled);
        }
        let resolution = self.resolve(request)?;
        let adapter = self.adapter(resolution.adapter)?;
        if !adapter.is_configured() {
            return Err(GenlyError::Configuration {
                credential: adapter.credential().env_var(),
                message: format!("required for the {} tier", resolution.tier),
            });
        }

        let mut routed = request.clone();
        routed.tier = resolution.tier;
        routed.model = Some(resolution.model.clone());

        let request_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!(
            "generate",
            %request_id,
            adapter = %resolution.adapter,
            tier = %resolution.tier,
            model = %resolution.model,
        );
        let ctx = InvokeContext {
            progress: options.progress.clone(),
            cancel: options.cancel,
        };
        let started = Instant::now();

        let mut result = async {
            info!(references = routed.reference_images.len(), "Starting generation");
            adapter.invoke_with_retries(&routed, &ctx, self.max_retries).await
        }
        .instrument(span)
        .await
        .map_err(|e| GenlyError::Adapter {
            adapter: resolution.adapter,
            tier: resolution.tier,
            source: Box::new(e),
        })?;

        result.tier = resolution.tier;
        result.fallback_from = resolution.fallback_from;
        if result.model.is_empty() {
            result.model = resolution.model;
        }
        options.progress.complete();
        info!(
            %request_id,
            tier = %result.tier,
            elapsed_ms = started.elapsed().as_millis() as u64,
            inline = result.is_inline(),
            "Generation finished"
        );
        Ok(result)
    }
}

fn reference_count_error(model: &str, count: usize, min: usize, max: usize) -> GenlyError {
    let expected = match (min, max) {
        (0, 0) => "no reference images".to_string(),
        (min, max) if min == max => format!("exactly {min} reference image(s)"),
        (0, max) => format!("at most {max} reference image(s)"),
        (min, max) => format!("{min} to {max} reference images"),
    };
    GenlyError::Validation(format!("{model} accepts {expected}, got {count}"))
}

/// Builder for [`Orchestrator`] with injected adapters.
#[derive(Default)]
pub struct OrchestratorBuilder {
    adapters: HashMap<AdapterKind, Arc<dyn MediaAdapter>>,
    max_retries: u32,
}

impl OrchestratorBuilder {
    /// Registers an adapter, replacing any previous one of the same kind.
    pub fn adapter(mut self, adapter: Arc<dyn MediaAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    /// Retries transient adapter failures up to `retries` times.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builds the orchestrator.
    pub fn build(self) -> Orchestrator {
        Orchestrator {
            adapters: self.adapters,
            max_retries: self.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use crate::error::TimeoutKind;
    use crate::poll::PollOptions;
    use crate::providers::ReferenceSupport;
    use crate::store::{MediaStore, SaveMetadata};
    use crate::types::{MediaKind, ReferenceImage};
    use async_trait::async_trait;
    use mockito::Matcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubAdapter {
        kind: AdapterKind,
        support: ReferenceSupport,
        configured: bool,
        calls: AtomicUsize,
        last: Mutex<Option<GenerationRequest>>,
        outcome: fn() -> Result<MediaResult>,
    }

    impl StubAdapter {
        fn new(kind: AdapterKind, support: ReferenceSupport) -> Self {
            Self {
                kind,
                support,
                configured: true,
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
                outcome: || Ok(MediaResult::new("https://cdn.example.com/out", MediaKind::Image, "", QualityTier::Standard)),
            }
        }

        fn last_request(&self) -> GenerationRequest {
            self.last.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl MediaAdapter for StubAdapter {
        async fn invoke(&self, request: &GenerationRequest, ctx: &InvokeContext) -> Result<MediaResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(request.clone());
            ctx.progress.report(40);
            (self.outcome)()
        }

        fn kind(&self) -> AdapterKind {
            self.kind
        }

        fn credential(&self) -> Credential {
            Credential::Comet
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        fn default_model(&self) -> &str {
            "stub"
        }

        fn owns_model(&self, model: &str) -> bool {
            model.starts_with(self.kind.as_str())
        }

        fn reference_support(&self, _model: &str) -> ReferenceSupport {
            self.support
        }
    }

    fn stubs() -> (Arc<StubAdapter>, Arc<StubAdapter>, Orchestrator) {
        let runware = Arc::new(StubAdapter::new(AdapterKind::RunwareImage, ReferenceSupport::up_to(1)));
        let comet = Arc::new(StubAdapter::new(AdapterKind::CometImage, ReferenceSupport::up_to(3)));
        let orchestrator = Orchestrator::builder()
            .adapter(runware.clone())
            .adapter(comet.clone())
            .build();
        (runware, comet, orchestrator)
    }

    fn with_refs(tier: QualityTier, n: usize) -> GenerationRequest {
        (0..n).fold(GenerationRequest::new("a lighthouse", tier), |req, i| {
            req.with_reference(ReferenceImage::url(format!("https://example.com/{i}.png")))
        })
    }

    #[test]
    fn test_routes_follow_tier_order() {
        for (tier, route) in QualityTier::ALL.iter().zip(ROUTES.iter()) {
            assert_eq!(*tier, route.tier);
            assert_eq!(tier.media_kind(), route.adapter.media_kind());
        }
        assert_eq!(route(QualityTier::Premium).model, "rundiffusion:130@100");
    }

    #[test]
    fn test_routes_report_credentials() {
        let config = GenlyConfig::new().with_comet_key("sk-test");
        let routes = Orchestrator::from_config(&config).routes();
        assert_eq!(routes.len(), 7);
        let ultra = routes.iter().find(|r| r.tier == QualityTier::Ultra).unwrap();
        assert!(ultra.configured);
        assert_eq!(ultra.credential, "COMET_API_KEY");
        let standard = routes.iter().find(|r| r.tier == QualityTier::Standard).unwrap();
        assert!(!standard.configured);
        assert_eq!(standard.fallback, Some(QualityTier::Ultra));
    }

    #[test]
    fn test_resolve_uses_tier_route() {
        let (_, _, orchestrator) = stubs();
        let resolution = orchestrator.resolve(&with_refs(QualityTier::Premium, 0)).unwrap();
        assert_eq!(resolution.adapter, AdapterKind::RunwareImage);
        assert_eq!(resolution.model, "rundiffusion:130@100");
        assert_eq!(resolution.fallback_from, None);
    }

    #[test]
    fn test_resolve_falls_back_for_references() {
        let (_, _, orchestrator) = stubs();
        let resolution = orchestrator.resolve(&with_refs(QualityTier::Standard, 2)).unwrap();
        assert_eq!(resolution.adapter, AdapterKind::CometImage);
        assert_eq!(resolution.tier, QualityTier::Ultra);
        assert_eq!(resolution.fallback_from, Some(QualityTier::Standard));
    }

    #[test]
    fn test_resolve_rejects_too_many_references() {
        let (_, _, orchestrator) = stubs();
        let err = orchestrator.resolve(&with_refs(QualityTier::Standard, 4)).unwrap_err();
        assert!(matches!(err, GenlyError::Validation(_)));
    }

    #[test]
    fn test_resolve_explicit_model() {
        let (_, _, orchestrator) = stubs();
        let request = with_refs(QualityTier::Standard, 2).with_model("comet-image-custom");
        let resolution = orchestrator.resolve(&request).unwrap();
        assert_eq!(resolution.adapter, AdapterKind::CometImage);
        assert_eq!(resolution.model, "comet-image-custom");
        assert_eq!(resolution.tier, QualityTier::Ultra);

        let unknown = with_refs(QualityTier::Standard, 0).with_model("mystery-model");
        assert!(matches!(orchestrator.resolve(&unknown), Err(GenlyError::Validation(_))));

        // An explicit model that cannot take the references is not rerouted.
        let too_many = with_refs(QualityTier::Standard, 2).with_model("runware-image-xl");
        assert!(matches!(orchestrator.resolve(&too_many), Err(GenlyError::Validation(_))));
    }

    #[test]
    fn test_resolve_seedream_before_other_fal_models() {
        let orchestrator = Orchestrator::from_config(&GenlyConfig::new().with_fal_key("fal-key"));

        let request = GenerationRequest::new("a glacier", QualityTier::Ultra).with_model(crate::providers::SEEDREAM_4);
        let resolution = orchestrator.resolve(&request).unwrap();
        assert_eq!(resolution.adapter, AdapterKind::FalImage);
        assert_eq!(resolution.tier, QualityTier::Ultra);

        let request = with_refs(QualityTier::Effects, 1).with_model(crate::providers::PIXVERSE_I2V);
        assert_eq!(orchestrator.resolve(&request).unwrap().adapter, AdapterKind::FalEffects);
    }

    #[test]
    fn test_resolve_rejects_empty_prompt() {
        let (_, _, orchestrator) = stubs();
        let request = GenerationRequest::new("   ", QualityTier::Standard);
        assert!(matches!(orchestrator.resolve(&request), Err(GenlyError::Validation(_))));
    }

    #[tokio::test]
    async fn test_generate_reports_fallback_tier() {
        let (runware, comet, orchestrator) = stubs();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let options = GenerateOptions {
            progress: Progress::new(move |p| sink.lock().unwrap().push(p)),
            ..GenerateOptions::default()
        };

        let result = orchestrator
            .generate_with(&with_refs(QualityTier::Standard, 3), options)
            .await
            .unwrap();

        assert_eq!(result.tier, QualityTier::Ultra);
        assert_eq!(result.fallback_from, Some(QualityTier::Standard));
        assert_eq!(result.model, GEMINI_FLASH_IMAGE);
        assert_eq!(runware.calls.load(Ordering::SeqCst), 0);
        let sent = comet.last_request();
        assert_eq!(sent.tier, QualityTier::Ultra);
        assert_eq!(sent.model.as_deref(), Some(GEMINI_FLASH_IMAGE));
        assert_eq!(*updates.lock().unwrap(), vec![40, 100]);
    }

    #[tokio::test]
    async fn test_generate_requires_credentials() {
        let mut stub = StubAdapter::new(AdapterKind::CometImage, ReferenceSupport::up_to(3));
        stub.configured = false;
        let stub = Arc::new(stub);
        let orchestrator = Orchestrator::builder().adapter(stub.clone()).build();

        let err = orchestrator
            .generate(&GenerationRequest::new("x", QualityTier::Ultra))
            .await
            .unwrap_err();
        assert!(matches!(err, GenlyError::Configuration { credential: "COMET_API_KEY", .. }));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generate_wraps_adapter_errors() {
        let mut stub = StubAdapter::new(AdapterKind::CometImage, ReferenceSupport::up_to(3));
        stub.outcome = || {
            Err(GenlyError::Timeout {
                operation: TimeoutKind::Generation,
                after: Duration::from_secs(60),
            })
        };
        let orchestrator = Orchestrator::builder().adapter(Arc::new(stub)).build();

        let err = orchestrator
            .generate(&GenerationRequest::new("x", QualityTier::Ultra))
            .await
            .unwrap_err();
        match &err {
            GenlyError::Adapter { adapter, tier, .. } => {
                assert_eq!(*adapter, AdapterKind::CometImage);
                assert_eq!(*tier, QualityTier::Ultra);
            }
            other => panic!("expected adapter context, got {other:?}"),
        }
        assert!(matches!(err.root(), GenlyError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_generate_retries_transient_failures() {
        static ATTEMPTS: AtomicUsize = AtomicUsize::new(0);
        let mut stub = StubAdapter::new(AdapterKind::CometImage, ReferenceSupport::up_to(3));
        stub.outcome = || {
            if ATTEMPTS.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(GenlyError::RateLimited {
                    retry_after: Some(Duration::from_millis(1)),
                })
            } else {
                Ok(MediaResult::new("https://cdn.example.com/ok.png", MediaKind::Image, "m", QualityTier::Ultra))
            }
        };
        let stub = Arc::new(stub);
        let orchestrator = Orchestrator::builder().adapter(stub.clone()).max_retries(1).build();

        let result = orchestrator
            .generate(&GenerationRequest::new("x", QualityTier::Ultra))
            .await
            .unwrap();
        assert_eq!(result.url, "https://cdn.example.com/ok.png");
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_generate_honors_prior_cancellation() {
        let (_, comet, orchestrator) = stubs();
        let options = GenerateOptions::default();
        options.cancel.cancel();
        let err = orchestrator
            .generate_with(&GenerationRequest::new("x", QualityTier::Ultra), options)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(comet.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_standard_image_saved_to_store() {
        let mut server = mockito::Server::new_async().await;
        let inference = server
            .mock("POST", "/")
            .match_header("authorization", "Bearer rw-key")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#""model":"runware:100@1""#.into()),
                Matcher::Regex(r#""positivePrompt":"a red fox""#.into()),
            ]))
            .with_status(200)
            .with_body(r#"{"data":[{"taskType":"imageInference","imageURL":"https://im.runware.ai/fox.png","cost":0.0013,"seed":11,"taskUUID":"t"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let mut config = GenlyConfig::new().with_runware_key("rw-key");
        config.endpoints.runware = server.url();
        let orchestrator = Orchestrator::from_config(&config);
        let store = MediaStore::in_memory();

        let result = orchestrator
            .generate(&GenerationRequest::new("a red fox", QualityTier::Standard))
            .await
            .unwrap();
        inference.assert_async().await;
        assert_eq!(result.url, "https://im.runware.ai/fox.png");
        assert_eq!(result.tier, QualityTier::Standard);

        let record = store.save(&result, SaveMetadata::new("a red fox")).await.unwrap();
        assert!(!record.is_local_ref);
        assert_eq!(record.url, "https://im.runware.ai/fox.png");
        assert_eq!(store.list_all(MediaKind::Image).await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_video_async_with_file_reference_polls_until_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        tokio::fs::write(&path, crate::providers::reference::tests::png_bytes())
            .await
            .unwrap();

        let mut server = mockito::Server::new_async().await;
        let create = server
            .mock("POST", "/veo/v1/video/create")
            .match_body(Matcher::Regex(r#""images":\["data:image/png;base64,"#.into()))
            .with_status(200)
            .with_body(r#"{"id":"abc"}"#)
            .expect(1)
            .create_async()
            .await;
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = checks.clone();
        let source = server
            .mock("GET", "/source/abc")
            .with_status(200)
            .with_body_from_request(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    b"queued, please wait".to_vec()
                } else {
                    b"High-quality video generated: https://cdn.example.com/abc.mp4".to_vec()
                }
            })
            .expect(3)
            .create_async()
            .await;

        let mut config = GenlyConfig::new().with_comet_key("comet-key");
        config.endpoints.comet = server.url();
        config.endpoints.veo_source = format!("{}/source", server.url());
        let veo = CometVeoAdapter::from_config(&config)
            .with_poll_options(PollOptions::fixed(10, Duration::from_millis(1)));
        let orchestrator = Orchestrator::builder().adapter(Arc::new(veo)).build();

        let request = GenerationRequest::new("waves at dusk", QualityTier::VideoAsync)
            .with_reference(ReferenceImage::file(&path));
        let result = orchestrator.generate(&request).await.unwrap();

        create.assert_async().await;
        source.assert_async().await;
        assert_eq!(checks.load(Ordering::SeqCst), 3);
        assert_eq!(result.url, "https://cdn.example.com/abc.mp4");
        assert_eq!(result.kind, MediaKind::Video);
        assert_eq!(result.task_id.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_ultra_with_four_references_fails_without_network() {
        // Unroutable endpoints: any request would fail with a network error.
        let mut config = GenlyConfig::new().with_comet_key("comet-key");
        config.endpoints.comet = "http://127.0.0.1:9".into();
        let orchestrator = Orchestrator::from_config(&config);

        let err = orchestrator.generate(&with_refs(QualityTier::Ultra, 4)).await.unwrap_err();
        assert!(matches!(err, GenlyError::Validation(_)));
    }
}
