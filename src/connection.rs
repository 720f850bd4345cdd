//! A live connection to one cluster context.

use crate::discovery::{ApiGroupVersion, DiscoveryCache};
use crate::error::{Error, Result};
use crate::gvr::Gvr;
use crate::watcher::{AnyWatcher, ListWatcher, TableWatcher, WatcherKind, watcher_id};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// TCP connect timeout for every request this connection makes.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of watchers kept per connection. Exceeding it evicts
/// the least recently used watcher.
pub const MAX_WATCHERS: usize = 10;

/// One cluster context: its client, its discovery cache and a bounded map
/// of live watchers keyed by `(resource, namespace, view)`.
pub struct Connection {
    context: String,
    client: Client,
    discovery: DiscoveryCache,
    watchers: Mutex<HashMap<String, AnyWatcher>>,
    last_used: std::sync::Mutex<Instant>,
}

impl Connection {
    /// Builds a client for `context`, honouring the context override and
    /// installing the connect timeout. The discovery cache is rooted
    /// under `cache_root` and keyed by the resolved server host.
    pub async fn connect(kubeconfig: &Kubeconfig, context: &str, cache_root: &Path) -> Result<Self> {
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..KubeConfigOptions::default()
        };
        let mut config = Config::from_custom_kubeconfig(kubeconfig.clone(), &options).await?;
        config.connect_timeout = Some(DIAL_TIMEOUT);

        let host = match (config.cluster_url.host(), config.cluster_url.port_u16()) {
            (Some(host), Some(port)) => format!("{host}_{port}"),
            (Some(host), None) => host.to_string(),
            _ => "unknown".to_string(),
        };

        let client = Client::try_from(config).map_err(|source| Error::Connection {
            context: context.to_string(),
            source,
        })?;
        let discovery = DiscoveryCache::new(client.clone(), context, &host, cache_root);

        tracing::debug!(context, "connected to cluster context");
        Ok(Self::from_parts(context, client, discovery))
    }

    /// Wraps an existing client, keying the discovery cache by context
    /// name. Intended for embedding and tests where no kubeconfig exists.
    pub fn with_client(context: &str, client: Client, cache_root: &Path) -> Self {
        let discovery = DiscoveryCache::new(client.clone(), context, context, cache_root);
        Self::from_parts(context, client, discovery)
    }

    fn from_parts(context: &str, client: Client, discovery: DiscoveryCache) -> Self {
        Self {
            context: context.to_string(),
            client,
            discovery,
            watchers: Mutex::new(HashMap::new()),
            last_used: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    /// The server-preferred resources for this context.
    pub async fn discover(&self) -> Result<Vec<ApiGroupVersion>> {
        self.touch();
        self.discovery.server_preferred_resources().await
    }

    /// Returns the watcher for `(gvr, namespace, kind)`, creating it if
    /// needed. When the map is full the least recently used watcher is
    /// stopped and removed before the new one is constructed.
    pub async fn get_or_create_watcher(
        &self,
        gvr: &Gvr,
        namespace: Option<&str>,
        kind: WatcherKind,
    ) -> AnyWatcher {
        self.touch();
        let key = watcher_id(gvr, namespace, kind);

        let mut watchers = self.watchers.lock().await;
        if let Some(watcher) = watchers.get(&key) {
            watcher.touch();
            return watcher.clone();
        }

        if watchers.len() >= MAX_WATCHERS {
            // Bound the watcher count to avoid performance and rate limiting issues
            let oldest = watchers
                .iter()
                .min_by_key(|(_, watcher)| watcher.last_used())
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                if let Some(watcher) = watchers.remove(&oldest) {
                    tracing::debug!(
                        context = %self.context,
                        watcher = %watcher.id(),
                        kind = %watcher.kind(),
                        "evicting least recently used watcher"
                    );
                    watcher.stop().await;
                }
            }
        }

        let namespace = namespace.map(str::to_string);
        let watcher = match kind {
            WatcherKind::List => AnyWatcher::List(Arc::new(ListWatcher::new(
                self.client.clone(),
                &self.context,
                gvr.clone(),
                namespace,
            ))),
            WatcherKind::Table => AnyWatcher::Table(Arc::new(TableWatcher::new(
                self.client.clone(),
                &self.context,
                gvr.clone(),
                namespace,
            ))),
        };
        watchers.insert(key, watcher.clone());
        watcher
    }

    /// Stops every watcher, waiting for each background task to exit.
    pub async fn stop(&self) {
        let watchers: Vec<AnyWatcher> = {
            let mut map = self.watchers.lock().await;
            map.drain().map(|(_, watcher)| watcher).collect()
        };
        for watcher in watchers {
            watcher.stop().await;
        }
        tracing::debug!(context = %self.context, "connection stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request, Response};
    use kube::client::Body;

    fn mock_connection(dir: &Path) -> Connection {
        let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        // watcher acquisition is lazy, no request ever reaches the server
        std::mem::forget(handle);
        let client = Client::new(service, "default");
        Connection::with_client("test", client, dir)
    }

    fn gvr(resource: &str) -> Gvr {
        Gvr::core("v1", resource)
    }

    #[tokio::test]
    async fn watchers_are_deduplicated_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let connection = mock_connection(dir.path());

        let first = connection
            .get_or_create_watcher(&gvr("pods"), None, WatcherKind::List)
            .await;
        let again = connection
            .get_or_create_watcher(&gvr("pods"), None, WatcherKind::List)
            .await;
        let other_view = connection
            .get_or_create_watcher(&gvr("pods"), None, WatcherKind::Table)
            .await;

        assert_eq!(first.id(), again.id());
        assert_ne!(first.id(), other_view.id());
        assert_eq!(first.kind(), WatcherKind::List);
        assert_eq!(other_view.kind(), WatcherKind::Table);
        assert_eq!(connection.watchers.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn eleventh_watcher_evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let connection = mock_connection(dir.path());

        let mut keys = Vec::new();
        for i in 0..MAX_WATCHERS {
            let watcher = connection
                .get_or_create_watcher(&gvr(&format!("kind{i}")), None, WatcherKind::List)
                .await;
            keys.push(watcher.id());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(connection.watchers.lock().await.len(), MAX_WATCHERS);

        // refresh the oldest entry so the second-oldest becomes the victim
        connection
            .get_or_create_watcher(&gvr("kind0"), None, WatcherKind::List)
            .await;
        tokio::time::sleep(Duration::from_millis(2)).await;

        connection
            .get_or_create_watcher(&gvr("extra"), None, WatcherKind::List)
            .await;

        let watchers = connection.watchers.lock().await;
        assert_eq!(watchers.len(), MAX_WATCHERS);
        assert!(watchers.contains_key(&keys[0]), "refreshed entry survives");
        assert!(!watchers.contains_key(&keys[1]), "oldest entry evicted");
    }

    #[tokio::test]
    async fn wrong_view_snapshot_is_an_unsupported_view_error() {
        let dir = tempfile::tempdir().unwrap();
        let connection = mock_connection(dir.path());

        let watcher = connection
            .get_or_create_watcher(&gvr("pods"), None, WatcherKind::List)
            .await;
        let err = watcher.table().await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedView { .. }));

        let watcher = connection
            .get_or_create_watcher(&gvr("pods"), None, WatcherKind::Table)
            .await;
        let err = watcher.objects().await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedView { .. }));
    }

    #[tokio::test]
    async fn stop_clears_watchers() {
        let dir = tempfile::tempdir().unwrap();
        let connection = mock_connection(dir.path());

        connection
            .get_or_create_watcher(&gvr("pods"), None, WatcherKind::List)
            .await;
        connection
            .get_or_create_watcher(&gvr("nodes"), None, WatcherKind::List)
            .await;

        connection.stop().await;
        assert!(connection.watchers.lock().await.is_empty());
    }
}
