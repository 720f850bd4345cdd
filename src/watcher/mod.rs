//! Watch-backed caches of Kubernetes resource collections.
//!
//! A watcher owns one in-memory cache of a single `(resource, namespace,
//! view)` tuple, kept in sync with the cluster through list+watch. The
//! first snapshot performs a synchronous list, seeds the cache, opens a
//! watch at the returned resource version and spawns a background task
//! that applies events until the server closes the stream. The next
//! snapshot after the stream closes transparently re-runs the cycle, so
//! transient network failures heal on read.

mod list;
mod table;

pub use list::ListWatcher;
pub use table::{PartialObjectMetadata, Table, TableColumnDefinition, TableRow, TableWatcher};

use crate::error::{Error, Result};
use crate::gvr::Gvr;
use async_trait::async_trait;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Server-side watch timeout. The server closing the stream after this is
/// the normal idle path, not an error.
pub const WATCH_TIMEOUT_SECS: u32 = 120;

/// The view a watcher serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherKind {
    /// Full unstructured objects.
    List,
    /// Server-rendered table rows.
    Table,
}

impl fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherKind::List => f.write_str("list"),
            WatcherKind::Table => f.write_str("table"),
        }
    }
}

/// Deduplication key for watchers within a connection. An empty namespace
/// segment means cluster-wide.
pub fn watcher_id(gvr: &Gvr, namespace: Option<&str>, kind: WatcherKind) -> String {
    format!("{}#{}#{}", gvr, namespace.unwrap_or(""), kind)
}

/// Capability surface shared by both watcher variants.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Halts the background loop and waits for it to exit. Idempotent.
    async fn stop(&self);

    /// When the watcher last served a request; drives LRU eviction.
    fn last_used(&self) -> Instant;

    /// Marks the watcher as used now.
    fn touch(&self);

    /// The watcher's deduplication key.
    fn id(&self) -> String;

    fn kind(&self) -> WatcherKind;
}

/// A running background watch: the stop signal and the task to join.
struct WatchTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// State shared by both watcher variants: identity, the mutex serialising
/// watch startup, and the last-used stamp.
pub(crate) struct WatcherBase {
    context: String,
    gvr: Gvr,
    namespace: Option<String>,
    kind: WatcherKind,
    task: tokio::sync::Mutex<Option<WatchTask>>,
    last_used: std::sync::Mutex<Instant>,
}

impl WatcherBase {
    fn new(context: &str, gvr: Gvr, namespace: Option<String>, kind: WatcherKind) -> Self {
        Self {
            context: context.to_string(),
            gvr,
            namespace,
            kind,
            task: tokio::sync::Mutex::new(None),
            last_used: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn id(&self) -> String {
        watcher_id(&self.gvr, self.namespace.as_deref(), self.kind)
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    /// Takes the running task out of its slot, signals it to stop and
    /// joins it. A second call finds the slot empty and is a no-op.
    async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.stop.send(());
            let _ = task.handle.await;
        }
        tracing::info!(
            context = %self.context,
            resource = %self.gvr,
            kind = %self.kind,
            "stopped watching"
        );
    }

    fn list_error(&self, source: kube::Error) -> Error {
        Error::List {
            context: self.context.clone(),
            resource: self.gvr.to_string(),
            namespace: self.namespace.clone(),
            source,
        }
    }

    fn watch_error(&self, source: kube::Error) -> Error {
        Error::Watch {
            context: self.context.clone(),
            resource: self.gvr.to_string(),
            namespace: self.namespace.clone(),
            source,
        }
    }
}

/// A watcher as stored in a connection's map. Cloning is cheap and shares
/// the underlying cache and background task.
#[derive(Clone)]
pub enum AnyWatcher {
    List(Arc<ListWatcher>),
    Table(Arc<TableWatcher>),
}

impl AnyWatcher {
    fn inner(&self) -> &dyn Watcher {
        match self {
            AnyWatcher::List(watcher) => watcher.as_ref(),
            AnyWatcher::Table(watcher) => watcher.as_ref(),
        }
    }

    pub async fn stop(&self) {
        self.inner().stop().await;
    }

    pub fn last_used(&self) -> Instant {
        self.inner().last_used()
    }

    pub fn touch(&self) {
        self.inner().touch();
    }

    pub fn id(&self) -> String {
        self.inner().id()
    }

    pub fn kind(&self) -> WatcherKind {
        self.inner().kind()
    }

    /// The current objects for the list view.
    pub async fn objects(&self) -> Result<Vec<DynamicObject>> {
        match self {
            AnyWatcher::List(watcher) => watcher.snapshot().await,
            AnyWatcher::Table(watcher) => Err(Error::UnsupportedView {
                id: watcher.id(),
                requested: WatcherKind::List,
            }),
        }
    }

    /// The current table for the table view.
    pub async fn table(&self) -> Result<Table> {
        match self {
            AnyWatcher::Table(watcher) => watcher.snapshot().await,
            AnyWatcher::List(watcher) => Err(Error::UnsupportedView {
                id: watcher.id(),
                requested: WatcherKind::Table,
            }),
        }
    }
}
