//! Process-wide service owning the kubeconfig and the connection pool.

use crate::connection::Connection;
use crate::discovery::ApiGroupVersion;
use crate::error::Result;
use crate::gvr::Gvr;
use crate::watcher::{Table, WatcherKind};
use kube::ResourceExt;
use kube::api::DynamicObject;
use kube::config::Kubeconfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Maximum number of cluster connections kept alive at the same time.
pub const MAX_CONNECTIONS: usize = 3;

/// The entry point of the cluster access core. One instance lives for the
/// whole host process; every request is routed through it.
pub struct Service {
    kubeconfig: Kubeconfig,
    cache_root: PathBuf,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl Service {
    /// Loads the ambient kubeconfig (the `KUBECONFIG` path list, falling
    /// back to `~/.kube/config`). Load failures are demoted to a warning:
    /// the resulting service has no contexts and serves only context
    /// queries, while cluster-touching operations fail per call.
    pub fn new() -> Self {
        let kubeconfig = match Kubeconfig::read() {
            Ok(kubeconfig) => kubeconfig,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load default kubeconfig");
                Kubeconfig::default()
            }
        };
        Self::with_kubeconfig(kubeconfig)
    }

    /// Uses an already-parsed kubeconfig.
    pub fn with_kubeconfig(kubeconfig: Kubeconfig) -> Self {
        Self {
            kubeconfig,
            cache_root: default_cache_root(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the discovery cache root, which defaults to the
    /// per-user config directory.
    pub fn discovery_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    /// All context names in the kubeconfig, sorted ascending.
    pub fn context_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .kubeconfig
            .contexts
            .iter()
            .map(|context| context.name.clone())
            .collect();
        names.sort();
        names
    }

    /// The kubeconfig's current context, possibly empty.
    pub fn default_context(&self) -> String {
        self.kubeconfig.current_context.clone().unwrap_or_default()
    }

    /// Returns the connection for `context`, creating it if needed. When
    /// the pool is full the least recently used connection is stopped and
    /// removed first.
    async fn connection(&self, context: &str) -> Result<Arc<Connection>> {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.get(context) {
            return Ok(connection.clone());
        }

        if connections.len() >= MAX_CONNECTIONS {
            // Bound the connection count to avoid performance and rate limiting issues
            let oldest = connections
                .iter()
                .min_by_key(|(_, connection)| connection.last_used())
                .map(|(name, _)| name.clone());
            if let Some(oldest) = oldest {
                if let Some(connection) = connections.remove(&oldest) {
                    tracing::debug!(context = %oldest, "evicting least recently used connection");
                    connection.stop().await;
                }
            }
        }

        let connection =
            Arc::new(Connection::connect(&self.kubeconfig, context, &self.cache_root).await?);
        connections.insert(context.to_string(), connection.clone());
        Ok(connection)
    }

    /// The server-preferred resources for `context`.
    pub async fn discover(&self, context: &str) -> Result<Vec<ApiGroupVersion>> {
        self.connection(context).await?.discover().await
    }

    /// The cached objects of `gvr`, namespace-scoped when a non-empty
    /// namespace is given, sorted by name.
    pub async fn list(
        &self,
        context: &str,
        gvr: &Gvr,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let namespace = namespace.filter(|ns| !ns.is_empty());
        let connection = self.connection(context).await?;
        let watcher = connection
            .get_or_create_watcher(gvr, namespace, WatcherKind::List)
            .await;
        watcher.objects().await
    }

    /// The cached table of `gvr`, rows sorted by name.
    pub async fn table(
        &self,
        context: &str,
        gvr: &Gvr,
        namespace: Option<&str>,
    ) -> Result<Table> {
        let namespace = namespace.filter(|ns| !ns.is_empty());
        let connection = self.connection(context).await?;
        let watcher = connection
            .get_or_create_watcher(gvr, namespace, WatcherKind::Table)
            .await;
        watcher.table().await
    }

    /// Names of all namespaces in the cluster, served through the same
    /// watch cache as any other list.
    pub async fn namespaces(&self, context: &str) -> Result<Vec<String>> {
        let objects = self
            .list(context, &Gvr::core("v1", "namespaces"), None)
            .await?;
        Ok(objects.iter().map(|object| object.name_any()).collect())
    }

    /// Stops every connection, waiting for all background tasks to exit.
    pub async fn stop(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut map = self.connections.lock().await;
            map.drain().map(|(_, connection)| connection).collect()
        };
        for connection in connections {
            connection.stop().await;
        }
        tracing::info!("cluster service stopped");
    }

    #[cfg(test)]
    pub(crate) async fn insert_connection(&self, context: &str, connection: Connection) {
        self.connections
            .lock()
            .await
            .insert(context.to_string(), Arc::new(connection));
    }
}

fn default_cache_root() -> PathBuf {
    directories::ProjectDirs::from("", "", "clusterlens")
        .map(|dirs| dirs.config_dir().join("discovery"))
        .unwrap_or_else(|| std::env::temp_dir().join("clusterlens-discovery"))
}
