//! Backend construction and memoization.

use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    config::{BackendConfig, ResolvedConfig, Tuning, TuningOverrides},
    error::Result,
    local::LocalBackend,
    managed::ManagedBackend,
    traits::{BackendClient, BackendMetadata},
};

/// Constructor used by the registry; swappable in tests.
pub type BackendBuilder =
    Arc<dyn Fn(&ResolvedConfig) -> Result<Arc<dyn BackendClient>> + Send + Sync>;

/// A connected backend with the metadata it reported.
#[derive(Clone)]
pub struct CreatedBackend {
    pub backend: Arc<dyn BackendClient>,
    pub metadata: BackendMetadata,
    /// Tuning the backend was built with.
    pub tuning: Tuning,
}

impl std::fmt::Debug for CreatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedBackend")
            .field("kind", &self.backend.kind())
            .field("metadata", &self.metadata)
            .field("tuning", &self.tuning)
            .finish()
    }
}

/// Construct the client matching `resolved`.
///
/// # Errors
/// Propagates construction failures from the concrete client.
pub fn build_backend(resolved: &ResolvedConfig) -> Result<Arc<dyn BackendClient>> {
    Ok(match resolved {
        ResolvedConfig::Local(settings) => Arc::new(LocalBackend::new(settings.clone())?),
        ResolvedConfig::Managed(settings) => Arc::new(ManagedBackend::new(settings.clone())?),
    })
}

/// Owns at most one live backend built from a fixed configuration.
pub struct BackendRegistry {
    config: BackendConfig,
    builder: BackendBuilder,
    cached: Mutex<Option<CreatedBackend>>,
    creating: tokio::sync::Mutex<()>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        Self::with_builder(config, Arc::new(build_backend))
    }

    #[must_use]
    pub fn with_builder(config: BackendConfig, builder: BackendBuilder) -> Self {
        Self {
            config,
            builder,
            cached: Mutex::new(None),
            creating: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn take_cached(&self) -> Option<CreatedBackend> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Build and connect a fresh backend, bypassing the cache.
    ///
    /// # Errors
    /// Returns `Validation` for a missing or unsupported mode or incomplete
    /// per-mode settings, and whatever `connect` fails with.
    pub async fn create_backend(&self, overrides: Option<&TuningOverrides>) -> Result<CreatedBackend> {
        let resolved = self
            .config
            .resolve(overrides.unwrap_or(&TuningOverrides::default()))?;
        let backend = (self.builder)(&resolved)?;

        tracing::info!(mode = %resolved.mode(), "connecting backend");
        backend.connect().await?;
        let metadata = backend.get_metadata().await;
        tracing::info!(
            mode = %resolved.mode(),
            version = %metadata.version,
            "backend ready"
        );

        Ok(CreatedBackend {
            backend,
            metadata,
            tuning: *resolved.tuning(),
        })
    }

    /// The memoized backend, created on first use.
    ///
    /// With `force_refresh` the cached instance is disconnected and replaced.
    ///
    /// # Errors
    /// Same as [`Self::create_backend`].
    pub async fn get(&self, force_refresh: bool) -> Result<CreatedBackend> {
        let _creating = self.creating.lock().await;

        if force_refresh {
            if let Some(stale) = self.take_cached() {
                if let Err(e) = stale.backend.disconnect().await {
                    tracing::warn!("disconnecting replaced backend failed: {e}");
                }
            }
        }

        if let Some(cached) = self
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Ok(cached);
        }

        let created = self.create_backend(None).await?;
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(created.clone());
        Ok(created)
    }

    /// Disconnect and forget the cached backend. Errors are swallowed.
    pub async fn clear(&self) {
        let _creating = self.creating.lock().await;
        if let Some(cached) = self.take_cached() {
            if let Err(e) = cached.backend.disconnect().await {
                tracing::debug!("ignoring disconnect failure during clear: {e}");
            }
        }
    }

    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    #[must_use]
    pub fn cached_metadata(&self) -> Option<BackendMetadata> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.metadata.clone())
    }
}
