//! # Configuration
//!
//! Optional `layerkeeper.toml`. Every section may be omitted.
//!
//! ```toml
//! user = "ops"
//!
//! [meta]
//! layers = ["meta-local", "meta"]
//! write_layer = "meta-local"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [security]
//! rate_limit = 100
//! cors_origins = "http://localhost:3000"
//! ```
//!
//! The API key is never read from the file; it comes from
//! `LAYERKEEPER_API_KEY` only. `LAYERKEEPER_RATE_LIMIT` and
//! `LAYERKEEPER_CORS_ORIGINS` override the `[security]` section.

use crate::error::AppError;
use layerkeeper_core::{LayerId, LayerSet, MetaConfiguration, UserId};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "layerkeeper.toml";

/// Default rate limit in requests per second.
pub const DEFAULT_RATE_LIMIT: u32 = 100;

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// User recorded on changesets when a request names none.
    pub user: String,
    pub meta: MetaSection,
    pub server: ServerSection,
    pub security: SecuritySection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            user: "layerkeeper".to_string(),
            meta: MetaSection::default(),
            server: ServerSection::default(),
            security: SecuritySection::default(),
        }
    }
}

/// Layers holding trait and predicate definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetaSection {
    /// Read precedence, most precedent first.
    pub layers: Vec<String>,
    /// Defaults to the first of `layers`.
    pub write_layer: Option<String>,
}

impl Default for MetaSection {
    fn default() -> Self {
        Self {
            layers: vec!["meta".to_string()],
            write_layer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySection {
    /// Requests per second, 0 disables limiting.
    pub rate_limit: Option<u32>,
    /// Comma-separated origins, or "*".
    pub cors_origins: Option<String>,
}

// =============================================================================
// LOADING
// =============================================================================

impl AppConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, AppError> {
        let config: Self =
            toml::from_str(text).map_err(|e| AppError::Config(format!("Invalid TOML: {}", e)))?;
        config.meta_configuration()?;
        Ok(config)
    }

    /// Load `path`, or `layerkeeper.toml` from the working directory.
    ///
    /// An explicit path must exist; the implicit file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let (path, required) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_CONFIG_FILE), false),
        };
        if !path.exists() {
            if required {
                return Err(AppError::Config(format!(
                    "Config file {} not found",
                    path.display()
                )));
            }
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Io(format!("Read {}: {}", path.display(), e)))?;
        let config = Self::from_toml(&text)?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn user_id(&self) -> UserId {
        UserId::new(self.user.clone())
    }

    /// `requested`, or the configured user.
    pub fn user_or(&self, requested: Option<String>) -> UserId {
        requested.map_or_else(|| self.user_id(), UserId::new)
    }

    /// The meta layers as a validated [`MetaConfiguration`].
    pub fn meta_configuration(&self) -> Result<MetaConfiguration, AppError> {
        let layers = self
            .meta
            .layers
            .iter()
            .map(LayerId::new)
            .collect::<Result<Vec<_>, _>>()?;
        let write_layer = match &self.meta.write_layer {
            Some(id) => LayerId::new(id.clone())?,
            None => layers
                .first()
                .cloned()
                .ok_or_else(|| AppError::Config("meta.layers must not be empty".to_string()))?,
        };
        Ok(MetaConfiguration::new(LayerSet::new(layers)?, write_layer)?)
    }

    /// Rate limit: `LAYERKEEPER_RATE_LIMIT`, then the file, then the default.
    pub fn rate_limit(&self) -> u32 {
        std::env::var("LAYERKEEPER_RATE_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .or(self.security.rate_limit)
            .unwrap_or(DEFAULT_RATE_LIMIT)
    }

    /// CORS origins: `LAYERKEEPER_CORS_ORIGINS`, then the file.
    pub fn cors_origins(&self) -> Option<String> {
        std::env::var("LAYERKEEPER_CORS_ORIGINS")
            .ok()
            .or_else(|| self.security.cors_origins.clone())
    }
}

// =============================================================================
// TESTS
// =============================================================================
