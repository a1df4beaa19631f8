//! Runtime configuration: credentials, endpoints, timeouts, and storage location.
//!
//! [`GenlyConfig::from_env`] is the only place the crate reads environment
//! variables; everything else receives the config by injection.

use crate::error::{GenlyError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default Runware task endpoint.
pub const DEFAULT_RUNWARE_URL: &str = "https://api.runware.ai/v1";
/// Default CometAPI base URL.
pub const DEFAULT_COMET_URL: &str = "https://api.cometapi.com";
/// Default base for Veo source documents.
pub const DEFAULT_VEO_SOURCE_URL: &str = "https://asyncdata.net/source";
/// Default fal.ai queue base URL.
pub const DEFAULT_FAL_QUEUE_URL: &str = "https://queue.fal.run";

/// A provider credential the crate knows how to look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Credential {
    /// Runware API key.
    Runware,
    /// CometAPI key.
    Comet,
    /// fal.ai key.
    Fal,
}

impl Credential {
    /// Environment variable that supplies this credential.
    pub fn env_var(&self) -> &'static str {
        match self {
            Self::Runware => "RUNWARE_API_KEY",
            Self::Comet => "COMET_API_KEY",
            Self::Fal => "FAL_KEY",
        }
    }
}

/// Provider endpoint base URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Runware task endpoint (all task types are POSTed here).
    pub runware: String,
    /// CometAPI base URL.
    pub comet: String,
    /// Base for Veo source documents; the task id is appended.
    pub veo_source: String,
    /// fal.ai queue base URL.
    pub fal_queue: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            runware: DEFAULT_RUNWARE_URL.to_string(),
            comet: DEFAULT_COMET_URL.to_string(),
            veo_source: DEFAULT_VEO_SOURCE_URL.to_string(),
            fal_queue: DEFAULT_FAL_QUEUE_URL.to_string(),
        }
    }
}

/// Request deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Ordinary provider request.
    pub request: Duration,
    /// Hard deadline on synchronous multimodal generation.
    pub generation: Duration,
    /// Reference image upload or fetch.
    pub upload: Duration,
    /// Task creation for polled video flows.
    pub task_create: Duration,
    /// A single status check while polling.
    pub status_check: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(120),
            generation: Duration::from_secs(60),
            upload: Duration::from_secs(30),
            task_create: Duration::from_secs(60),
            status_check: Duration::from_secs(10),
        }
    }
}

/// Configuration shared by every adapter and the media store.
#[derive(Debug, Clone, Default)]
pub struct GenlyConfig {
    runware_api_key: Option<String>,
    comet_api_key: Option<String>,
    fal_api_key: Option<String>,
    /// Provider endpoints.
    pub endpoints: Endpoints,
    /// Request deadlines.
    pub timeouts: Timeouts,
    /// Directory for the media gallery; `None` uses the platform data dir.
    pub data_dir: Option<PathBuf>,
}

impl GenlyConfig {
    /// Creates an empty config with production endpoints and no credentials.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads credentials, endpoint overrides, and the data dir from the environment.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let mut config = Self::new();

        config.runware_api_key = var(Credential::Runware.env_var());
        config.comet_api_key = var(Credential::Comet.env_var());
        config.fal_api_key = var(Credential::Fal.env_var());

        if let Some(url) = var("RUNWARE_API_URL") {
            config.endpoints.runware = url;
        }
        if let Some(url) = var("COMET_API_URL") {
            config.endpoints.comet = url;
        }
        if let Some(url) = var("VEO_SOURCE_URL") {
            config.endpoints.veo_source = url;
        }
        if let Some(url) = var("FAL_QUEUE_URL") {
            config.endpoints.fal_queue = url;
        }
        config.data_dir = var("GENLY_DATA_DIR").map(PathBuf::from);

        tracing::debug!(
            runware = config.runware_api_key.is_some(),
            comet = config.comet_api_key.is_some(),
            fal = config.fal_api_key.is_some(),
            "loaded configuration from environment"
        );
        config
    }

    /// Sets the Runware API key.
    pub fn with_runware_key(mut self, key: impl Into<String>) -> Self {
        self.runware_api_key = Some(key.into());
        self
    }

    /// Sets the CometAPI key.
    pub fn with_comet_key(mut self, key: impl Into<String>) -> Self {
        self.comet_api_key = Some(key.into());
        self
    }

    /// Sets the fal.ai key.
    pub fn with_fal_key(mut self, key: impl Into<String>) -> Self {
        self.fal_api_key = Some(key.into());
        self
    }

    /// Replaces the endpoint table.
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Replaces the timeout table.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets the gallery directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Returns the credential, if configured.
    pub fn credential(&self, credential: Credential) -> Option<&str> {
        match credential {
            Credential::Runware => self.runware_api_key.as_deref(),
            Credential::Comet => self.comet_api_key.as_deref(),
            Credential::Fal => self.fal_api_key.as_deref(),
        }
    }

    /// Returns the credential or a configuration error naming its variable.
    pub fn require(&self, credential: Credential, purpose: &str) -> Result<String> {
        self.credential(credential)
            .map(str::to_string)
            .ok_or_else(|| GenlyError::Configuration {
                credential: credential.env_var(),
                message: format!("required for {purpose}"),
            })
    }

    /// Gallery directory, falling back to the platform data directory.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        if let Some(proj) = directories::ProjectDirs::from("ai", "genly", "genly") {
            return proj.data_dir().join("gallery");
        }
        PathBuf::from(".genly").join("gallery")
    }
}
