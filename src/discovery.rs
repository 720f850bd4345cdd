//! Discovery of served API resources, cached on disk.
//!
//! Discovery is the one piece of state the core persists: the
//! server-preferred resource lists are written as JSON under the
//! per-user config directory, keyed by server host, and reused for ten
//! minutes before the API server is asked again.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Freshness window for the on-disk discovery cache.
pub const DISCOVERY_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// One served group/version and the resources it carries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiGroupVersion {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resources: Vec<ApiResourceInfo>,
}

impl ApiGroupVersion {
    /// The `group/version` key, or the bare version for the core group.
    pub fn group_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// A single discovered resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiResourceInfo {
    pub name: String,
    pub namespaced: bool,
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    fetched: DateTime<Utc>,
    apis: Vec<ApiGroupVersion>,
}

/// Server-preferred resources with an on-disk cache keyed by server host.
pub struct DiscoveryCache {
    client: Client,
    context: String,
    path: PathBuf,
    ttl: Duration,
}

impl DiscoveryCache {
    pub fn new(client: Client, context: &str, host: &str, root: &Path) -> Self {
        Self {
            client,
            context: context.to_string(),
            path: root.join(format!("{}.json", sanitize(host))),
            ttl: DISCOVERY_CACHE_TTL,
        }
    }

    /// Returns the server-preferred resources, served from disk while the
    /// cache file is fresh.
    pub async fn server_preferred_resources(&self) -> Result<Vec<ApiGroupVersion>> {
        if let Some(apis) = self.load_fresh() {
            return Ok(apis);
        }
        let apis = self.fetch().await?;
        self.store(&apis);
        Ok(apis)
    }

    /// Reads the cache file; unreadable or corrupt files just miss.
    fn load_fresh(&self) -> Option<Vec<ApiGroupVersion>> {
        let bytes = std::fs::read(&self.path).ok()?;
        let cached: CacheFile = serde_json::from_slice(&bytes).ok()?;
        let age = Utc::now().signed_duration_since(cached.fetched).to_std().ok()?;
        (age < self.ttl).then_some(cached.apis)
    }

    /// Cache writes are best effort; failures are logged and the fetched
    /// result is still returned.
    fn store(&self, apis: &[ApiGroupVersion]) {
        let Some(dir) = self.path.parent() else { return };
        let file = CacheFile {
            fetched: Utc::now(),
            apis: apis.to_vec(),
        };
        if let Err(err) = write_atomically(dir, &self.path, &file) {
            tracing::debug!(
                path = %self.path.display(),
                error = %err,
                "failed to write discovery cache"
            );
        }
    }

    /// Asks the server for the preferred version of every group: the core
    /// group first, then each named group at its preferred version.
    async fn fetch(&self) -> Result<Vec<ApiGroupVersion>> {
        let mut apis = Vec::new();

        let core = self
            .client
            .list_core_api_versions()
            .await
            .map_err(|source| self.error(source))?;
        if let Some(version) = core.versions.first() {
            let list = self
                .client
                .list_core_api_resources(version)
                .await
                .map_err(|source| self.error(source))?;
            apis.push(from_resource_list("", version, list));
        }

        let groups = self
            .client
            .list_api_groups()
            .await
            .map_err(|source| self.error(source))?;
        for group in groups.groups {
            let Some(version) = group
                .preferred_version
                .or_else(|| group.versions.first().cloned())
            else {
                continue;
            };
            let list = self
                .client
                .list_api_group_resources(&version.group_version)
                .await
                .map_err(|source| self.error(source))?;
            apis.push(from_resource_list(&group.name, &version.version, list));
        }

        Ok(apis)
    }

    fn error(&self, source: kube::Error) -> Error {
        Error::Discovery {
            context: self.context.clone(),
            source,
        }
    }
}

fn from_resource_list(group: &str, version: &str, list: APIResourceList) -> ApiGroupVersion {
    let resources = list
        .resources
        .into_iter()
        // subresources (status, scale, ...) are not listable collections
        .filter(|resource| !resource.name.contains('/'))
        .map(|resource| ApiResourceInfo {
            name: resource.name,
            namespaced: resource.namespaced,
        })
        .collect();
    ApiGroupVersion {
        group: group.to_string(),
        version: version.to_string(),
        resources,
    }
}

fn write_atomically(dir: &Path, path: &Path, file: &CacheFile) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&tmp, file)?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Cache files are keyed by server host; anything outside the portable
/// filename alphabet is replaced.
fn sanitize(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
