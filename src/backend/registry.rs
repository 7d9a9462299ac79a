//! Backend registry
//!
//! Holds `name -> (criteria, backend)` registrations. A registration carries
//! either a ready instance or a factory; factories run on the first
//! [`BackendRegistry::get_backend`] call and the instance is cached under the
//! same name. The registry is an ordinary value shared through `Arc`, handed
//! to selectors and workers explicitly.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::criteria::{BackendCriteria, CompiledCriteria};
use super::Backend;
use crate::error::{Error, Result};

/// Constructor used for lazily instantiated backends
pub type BackendFactory = Arc<dyn Fn() -> std::result::Result<Arc<dyn Backend>, super::BackendError> + Send + Sync>;

/// What gets registered under a name
#[derive(Clone)]
pub enum BackendSource {
    /// Ready-to-use instance
    Instance(Arc<dyn Backend>),
    /// Built on first use
    Factory(BackendFactory),
}

impl BackendSource {
    /// Wrap a closure as a lazily evaluated factory
    pub fn factory<F>(f: F) -> Self
    where
        F: Fn() -> std::result::Result<Arc<dyn Backend>, super::BackendError> + Send + Sync + 'static,
    {
        Self::Factory(Arc::new(f))
    }
}

impl fmt::Debug for BackendSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(backend) => write!(f, "Instance({})", backend.name()),
            Self::Factory(_) => f.write_str("Factory"),
        }
    }
}

/// Read-only view of one registration
#[derive(Debug, Clone, Serialize)]
pub struct BackendSummary {
    pub name: String,
    pub criteria: BackendCriteria,
    pub instantiated: bool,
}

pub(crate) struct RegisteredBackend {
    pub(crate) matcher: CompiledCriteria,
    factory: Option<BackendFactory>,
    instance: Option<Arc<dyn Backend>>,
}

// ============================================================================
// Backend Registry
// ============================================================================

/// Name-keyed backend registry
#[derive(Default)]
pub struct BackendRegistry {
    entries: RwLock<BTreeMap<String, RegisteredBackend>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend; `criteria` defaults to [`BackendCriteria::default`]
    ///
    /// Re-registering a name replaces the previous registration without
    /// closing it.
    pub fn register_backend(
        &self,
        name: impl Into<String>,
        source: BackendSource,
        criteria: Option<BackendCriteria>,
    ) -> Result<()> {
        let name = name.into();
        let matcher = criteria.unwrap_or_default().compile()?;

        let (factory, instance) = match source {
            BackendSource::Instance(backend) => (None, Some(backend)),
            BackendSource::Factory(factory) => (Some(factory), None),
        };

        let previous = self.write().insert(
            name.clone(),
            RegisteredBackend {
                matcher,
                factory,
                instance,
            },
        );

        if previous.is_some() {
            warn!(backend = %name, "Backend re-registered, previous registration replaced");
        } else {
            info!(backend = %name, "Backend registered");
        }
        Ok(())
    }

    /// Remove a registration and close its instance if one was built
    ///
    /// Returns `false` if nothing was registered under `name`.
    pub async fn unregister_backend(&self, name: &str) -> bool {
        let removed = self.write().remove(name);
        let Some(entry) = removed else {
            return false;
        };

        if let Some(instance) = entry.instance {
            if let Err(e) = instance.close().await {
                warn!(backend = %name, error = %e, "Failed to close backend");
            }
        }

        info!(backend = %name, "Backend unregistered");
        true
    }

    /// Get the instance registered under `name`, building it if needed
    pub fn get_backend(&self, name: &str) -> Result<Arc<dyn Backend>> {
        let factory = {
            let entries = self.read();
            let entry = entries
                .get(name)
                .ok_or_else(|| Error::UnknownBackend(name.to_string()))?;

            if let Some(instance) = &entry.instance {
                return Ok(instance.clone());
            }

            entry
                .factory
                .clone()
                .ok_or_else(|| Error::UnknownBackend(name.to_string()))?
        };

        // Build outside the lock; the first finished construction wins
        let built = factory()?;
        debug!(backend = %name, "Backend instantiated");

        let mut entries = self.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| Error::UnknownBackend(name.to_string()))?;
        Ok(entry.instance.get_or_insert(built).clone())
    }

    /// Whether a registration exists under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn criteria(&self, name: &str) -> Option<BackendCriteria> {
        self.read().get(name).map(|e| e.matcher.criteria().clone())
    }

    /// All registrations, ordered by name
    pub fn all_backends(&self) -> Vec<BackendSummary> {
        self.read()
            .iter()
            .map(|(name, entry)| BackendSummary {
                name: name.clone(),
                criteria: entry.matcher.criteria().clone(),
                instantiated: entry.instance.is_some(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Close every instantiated backend, keeping the registrations
    pub async fn close_all(&self) {
        let instances: Vec<(String, Arc<dyn Backend>)> = self
            .read()
            .iter()
            .filter_map(|(name, entry)| entry.instance.clone().map(|i| (name.clone(), i)))
            .collect();

        let closing = instances.iter().map(|(name, instance)| async move {
            match instance.close().await {
                Ok(()) => debug!(backend = %name, "Backend closed"),
                Err(e) => warn!(backend = %name, error = %e, "Failed to close backend"),
            }
        });
        join_all(closing).await;
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, RegisteredBackend>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, RegisteredBackend>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, CrawlOutput, CrawlTarget};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NullBackend {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Backend for NullBackend {
        fn name(&self) -> &str {
            "null"
        }

        async fn crawl(&self, target: &CrawlTarget) -> std::result::Result<CrawlOutput, BackendError> {
            Ok(CrawlOutput {
                url: target.url.clone(),
                ..Default::default()
            })
        }

        async fn close(&self) -> std::result::Result<(), BackendError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_factory_runs_once() {
        let registry = BackendRegistry::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();

        registry
            .register_backend(
                "lazy",
                BackendSource::factory(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(NullBackend {
                        closed: Arc::new(AtomicBool::new(false)),
                    }) as Arc<dyn Backend>)
                }),
                None,
            )
            .unwrap();

        assert!(!registry.all_backends()[0].instantiated);
        registry.get_backend("lazy").unwrap();
        registry.get_backend("lazy").unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(registry.all_backends()[0].instantiated);
    }

    #[test]
    fn test_unknown_backend() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.get_backend("missing"),
            Err(Error::UnknownBackend(name)) if name == "missing"
        ));
    }

    #[tokio::test]
    async fn test_unregister_closes_instance() {
        let registry = BackendRegistry::new();
        let closed = Arc::new(AtomicBool::new(false));
        registry
            .register_backend(
                "null",
                BackendSource::Instance(Arc::new(NullBackend {
                    closed: closed.clone(),
                })),
                None,
            )
            .unwrap();

        assert!(registry.unregister_backend("null").await);
        assert!(closed.load(Ordering::SeqCst));
        assert!(registry.is_empty());
        assert!(!registry.unregister_backend("null").await);
    }

    #[test]
    fn test_factory_error_propagates() {
        let registry = BackendRegistry::new();
        let criteria = BackendCriteria::new().with_url_patterns(["https://*.test/*"]);
        assert!(registry
            .register_backend(
                "ok",
                BackendSource::factory(|| Err(BackendError::Permanent("unused".into()))),
                Some(criteria),
            )
            .is_ok());
        assert!(matches!(
            registry.get_backend("ok"),
            Err(Error::Backend(BackendError::Permanent(_)))
        ));
    }
}
