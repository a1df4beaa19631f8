#![warn(missing_docs)]
//! Genly - multi-provider image and video generation.
//!
//! A request names a [`QualityTier`]; the [`Orchestrator`] routes it to the
//! provider adapter serving that tier, runs the synchronous or task-polling
//! flow that provider needs, and returns a [`MediaResult`] whose `url` is a
//! remote link or an inline `data:` URI. Results can then be kept in the local
//! [`MediaStore`] gallery.
//!
//! # Quick Start
//!
//! ```no_run
//! use genly::{GenerationRequest, GenlyConfig, MediaStore, Orchestrator, QualityTier, SaveMetadata};
//!
//! #[tokio::main]
//! async fn main() -> genly::Result<()> {
//!     let config = GenlyConfig::from_env();
//!     let orchestrator = Orchestrator::from_config(&config);
//!
//!     let request = GenerationRequest::new("A lighthouse at dawn", QualityTier::Standard);
//!     let result = orchestrator.generate(&request).await?;
//!
//!     let store = MediaStore::from_config(&config);
//!     let record = store.save(&result, SaveMetadata::new(&request.prompt)).await?;
//!     println!("{}", store.resolve(&record).await);
//!     Ok(())
//! }
//! ```
//!
//! # Tiers
//!
//! | Tier | Provider | Media |
//! |------|----------|-------|
//! | `standard`, `premium` | Runware | image |
//! | `ultra` | Gemini via CometAPI | image, up to 3 references |
//! | `video-standard` | Seedance via Runware | video |
//! | `video-sync` | Veo 3 Fast Frames / Sora 2 via CometAPI | video |
//! | `video-async` | Veo 3 via CometAPI | video |
//! | `effects` | PixVerse via fal.ai | video, one reference |
//!
//! Seedream 4K images on fal.ai have no tier; request them with an explicit
//! model id such as [`providers::SEEDREAM_4`].
//!
//! # Features
//!
//! - `cli` (default): the `genly` command-line interface

mod error;
mod http;

pub mod config;
pub mod extract;
pub mod orchestrator;
pub mod poll;
pub mod progress;
pub mod providers;
pub mod store;
pub mod types;

// Re-export error types at crate root
pub use error::{GenlyError, Result, StorageError, StorageResult, TimeoutKind};

pub use config::{Credential, Endpoints, GenlyConfig, Timeouts};
pub use extract::{extract_media, MediaReference};
pub use orchestrator::{GenerateOptions, Orchestrator, OrchestratorBuilder, Resolution, RouteInfo};
pub use poll::{PollOptions, PollOutcome};
pub use progress::Progress;
pub use providers::{AdapterKind, InvokeContext, MediaAdapter, MediaAdapterExt, ReferenceSupport};
pub use store::{GalleryEvent, MediaStore, SaveMetadata, StoreOptions, StoredMediaRecord};
pub use types::{GenerationRequest, ImageFormat, MediaKind, MediaResult, QualityTier, ReferenceImage};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::GenlyConfig;
    pub use crate::error::{GenlyError, Result};
    pub use crate::orchestrator::{GenerateOptions, Orchestrator};
    pub use crate::progress::Progress;
    pub use crate::providers::{MediaAdapter, MediaAdapterExt};
    pub use crate::store::{MediaStore, SaveMetadata, StoredMediaRecord};
    pub use crate::types::{GenerationRequest, MediaKind, MediaResult, QualityTier, ReferenceImage};
}
