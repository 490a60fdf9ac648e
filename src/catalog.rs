//! Catalog lookups and the memoizing cache in front of them.
//!
//! Grounded in `JobRunner/JobRunner.py::_submit` (module/version resolution,
//! the cache-hit-vs-cache-miss log lines) and in the teacher's
//! `tokio::sync::RwLock`-guarded shared-state pattern
//! (`system/v1/exec/svc/run_manager.rs`'s `runs: Arc<Mutex<HashMap<...>>>`).
//! Unlike the original Python cache, which hands callers a reference into
//! the cached entry and lets them mutate it in place, [`CatalogCache`]
//! always returns an owned clone, so a caller's `cached = true` tweak can
//! never corrupt the next lookup's defaults.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::job::VolumeMountConfig;

/// Errors from catalog lookups.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The underlying HTTP request failed.
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The catalog has no record of the requested module.
    #[error("module not found in catalog: {0}")]
    NotFound(String),
    /// The catalog's response body didn't match the expected shape.
    #[error("failed to parse catalog response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A reference-data volume a module requires, mounted read-only at
/// `/data` (`spec.md` §4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataVolume {
    /// The reference-data subfolder under `refdata_dir`.
    pub folder: String,
    /// The reference-data version, distinct from the module's own
    /// resolved version.
    pub version: String,
}

/// Everything the supervisor needs to know about one resolved module
/// version: its image, its git provenance, and whether this lookup was
/// served from cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// The module name.
    pub module: String,
    /// The resolved version string.
    pub version: String,
    /// The container image reference to run.
    pub image: String,
    /// The module's git URL.
    pub git_url: String,
    /// The git commit the image was built from.
    pub git_commit: String,
    /// Optional reference-data volume this module requires.
    #[serde(default)]
    pub data_volume: Option<DataVolume>,
    /// Whether this value was served from the in-process cache.
    pub cached: bool,
}

/// A remote catalog of modules, their versions, and per-method volume
/// mounts. The concrete network shape is out of this crate's scope
/// (`spec.md` §1 Non-goals); only the surface the supervisor calls is
/// pinned down here.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Resolves `module` (optionally pinned to `version`) to a
    /// [`ModuleInfo`]. `cached` on the returned value is always `false`;
    /// memoization is [`CatalogCache`]'s job, not the client's.
    async fn get_module_info(
        &self,
        module: &str,
        version: Option<&str>,
    ) -> Result<ModuleInfo, CatalogError>;

    /// Resolves the extra volume mounts configured for `module.method`
    /// under the given client group.
    async fn get_volume_mounts(
        &self,
        module: &str,
        method: &str,
        client_group: &str,
    ) -> Result<Vec<VolumeMountConfig>, CatalogError>;
}

/// Key for the module-version half of the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ModuleKey {
    module: String,
    version: Option<String>,
}

/// Key for the volume-mounts half of the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MountsKey {
    module: String,
    method: String,
    client_group: String,
}

/// A memoizing decorator over a [`CatalogClient`].
///
/// Concurrent reads never block each other; a miss takes a write lock only
/// long enough to insert the freshly fetched entry, matching the
/// read-heavy access pattern this supervisor has (one lookup per submitted
/// job or subjob).
pub struct CatalogCache<C> {
    /// The wrapped client.
    inner: C,
    /// Module-version cache.
    modules: RwLock<HashMap<ModuleKey, ModuleInfo>>,
    /// Volume-mounts cache.
    mounts: RwLock<HashMap<MountsKey, Vec<VolumeMountConfig>>>,
}

impl<C: CatalogClient> CatalogCache<C> {
    /// Wraps `inner` in a fresh, empty cache.
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            modules: RwLock::new(HashMap::new()),
            mounts: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves module info, serving from cache when available.
    pub async fn get_module_info(
        &self,
        module: &str,
        version: Option<&str>,
    ) -> Result<ModuleInfo, CatalogError> {
        let key = ModuleKey {
            module: module.to_string(),
            version: version.map(str::to_string),
        };

        if let Some(hit) = self.modules.read().await.get(&key) {
            tracing::debug!(module, version, "catalog cache hit");
            let mut hit = hit.clone();
            hit.cached = true;
            return Ok(hit);
        }

        tracing::debug!(module, version, "catalog cache miss");
        let fetched = self.inner.get_module_info(module, version).await?;
        self.modules.write().await.insert(key, fetched.clone());
        Ok(fetched)
    }

    /// Resolves volume mounts, serving from cache when available.
    pub async fn get_volume_mounts(
        &self,
        module: &str,
        method: &str,
        client_group: &str,
    ) -> Result<Vec<VolumeMountConfig>, CatalogError> {
        let key = MountsKey {
            module: module.to_string(),
            method: method.to_string(),
            client_group: client_group.to_string(),
        };

        if let Some(hit) = self.mounts.read().await.get(&key) {
            return Ok(hit.clone());
        }

        let fetched = self
            .inner
            .get_volume_mounts(module, method, client_group)
            .await?;
        self.mounts.write().await.insert(key, fetched.clone());
        Ok(fetched)
    }
}

/// A thread-safe handle to a [`CatalogCache`], cloned freely across the
/// supervisor's collaborators.
pub type SharedCatalog<C> = Arc<CatalogCache<C>>;

/// A `reqwest`-based [`CatalogClient`] speaking the KBase Catalog service's
/// JSON-RPC protocol.
///
/// Grounded in `JobRunner/CatalogCache.py`, which wraps a `Catalog` client
/// (`catalog.get_module_version`, `catalog.list_volume_mounts`) with the
/// admin token configured alongside `catalog-service-url`.
#[derive(Debug, Clone)]
pub struct HttpCatalogClient {
    /// Base URL of the catalog service.
    base_url: String,
    /// The admin token presented on every call.
    admin_token: String,
    /// The underlying HTTP client.
    http: reqwest::Client,
}

impl HttpCatalogClient {
    /// Creates a new client for the given base URL and admin token.
    pub fn new(base_url: impl Into<String>, admin_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            admin_token: admin_token.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Issues a single JSON-RPC-shaped call and returns the `result` field.
    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, CatalogError> {
        #[derive(serde::Serialize)]
        struct Request<'a> {
            method: &'a str,
            params: serde_json::Value,
        }

        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            result: Option<serde_json::Value>,
        }

        let response: Response = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.admin_token)
            .json(&Request { method, params })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.result.unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn get_module_info(
        &self,
        module: &str,
        version: Option<&str>,
    ) -> Result<ModuleInfo, CatalogError> {
        let result = self
            .call(
                "get_module_version",
                serde_json::json!({"module_name": module, "version": version}),
            )
            .await?;
        if result.is_null() {
            return Err(CatalogError::NotFound(module.to_string()));
        }
        let mut info: ModuleInfo = serde_json::from_value(result)?;
        info.cached = false;
        Ok(info)
    }

    async fn get_volume_mounts(
        &self,
        module: &str,
        method: &str,
        client_group: &str,
    ) -> Result<Vec<VolumeMountConfig>, CatalogError> {
        let result = self
            .call(
                "list_volume_mounts",
                serde_json::json!({
                    "module_name": module,
                    "function_name": method,
                    "client_group": client_group,
                }),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}

/// Object-safe view over a [`CatalogCache`], letting the supervisor hold a
/// single `Arc<dyn CatalogLookup>` regardless of the concrete
/// [`CatalogClient`] backing it.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    /// See [`CatalogCache::get_module_info`].
    async fn get_module_info(
        &self,
        module: &str,
        version: Option<&str>,
    ) -> Result<ModuleInfo, CatalogError>;

    /// See [`CatalogCache::get_volume_mounts`].
    async fn get_volume_mounts(
        &self,
        module: &str,
        method: &str,
        client_group: &str,
    ) -> Result<Vec<VolumeMountConfig>, CatalogError>;
}

#[async_trait]
impl<C: CatalogClient> CatalogLookup for CatalogCache<C> {
    async fn get_module_info(
        &self,
        module: &str,
        version: Option<&str>,
    ) -> Result<ModuleInfo, CatalogError> {
        CatalogCache::get_module_info(self, module, version).await
    }

    async fn get_volume_mounts(
        &self,
        module: &str,
        method: &str,
        client_group: &str,
    ) -> Result<Vec<VolumeMountConfig>, CatalogError> {
        CatalogCache::get_volume_mounts(self, module, method, client_group).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct CountingClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CatalogClient for CountingClient {
        async fn get_module_info(
            &self,
            module: &str,
            version: Option<&str>,
        ) -> Result<ModuleInfo, CatalogError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ModuleInfo {
                module: module.to_string(),
                version: version.unwrap_or("1.0.0").to_string(),
                image: String::from("example/image:1.0.0"),
                git_url: String::from("https://github.com/kbase/example"),
                git_commit: String::from("deadbeef"),
                data_volume: None,
                cached: false,
            })
        }

        async fn get_volume_mounts(
            &self,
            _module: &str,
            _method: &str,
            _client_group: &str,
        ) -> Result<Vec<VolumeMountConfig>, CatalogError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache_and_marked_cached() {
        let cache = CatalogCache::new(CountingClient {
            calls: AtomicUsize::new(0),
        });

        let first = cache.get_module_info("Example", None).await.unwrap();
        assert!(!first.cached);

        let second = cache.get_module_info("Example", None).await.unwrap();
        assert!(second.cached);
        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mutating_a_cached_copy_does_not_corrupt_the_cache() {
        let cache = CatalogCache::new(CountingClient {
            calls: AtomicUsize::new(0),
        });

        let mut first = cache.get_module_info("Example", None).await.unwrap();
        first.cached = true;
        first.image = String::from("tampered:1.0.0");

        let second = cache.get_module_info("Example", None).await.unwrap();
        assert_eq!(second.image, "example/image:1.0.0");
    }
}
