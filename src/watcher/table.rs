//! Table-view watcher using server-side table rendering.
//!
//! The table transport negotiates `meta.k8s.io/v1` Table payloads through
//! the Accept header on otherwise ordinary list and watch requests, so it
//! bypasses the typed [`Api`](kube::Api) layer and builds requests with
//! [`kube::core::Request`] directly.

use super::{WATCH_TIMEOUT_SECS, WatchTask, Watcher, WatcherBase, WatcherKind};
use crate::error::Result;
use crate::gvr::Gvr;
use async_trait::async_trait;
use futures::StreamExt;
use http::header::{ACCEPT, HeaderValue};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ListMeta, ObjectMeta, Time};
use kube::Client;
use kube::api::{DynamicObject, ListParams, WatchParams};
use kube::core::{Request, Resource, WatchEvent};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::oneshot;

/// Accept header value requesting server-side Table rendering, with plain
/// JSON as the fallback.
const TABLE_ACCEPT: &str = "application/json;as=Table;v=v1;g=meta.k8s.io,application/json";

/// A `meta.k8s.io/v1` Table as served under table content negotiation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub column_definitions: Vec<TableColumnDefinition>,
    #[serde(default)]
    pub rows: Vec<TableRow>,
}

/// Definition of a single table column.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
}

/// One table row: opaque display cells plus the partial-metadata header
/// identifying the row's object. Rows are matched by header UID.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRow {
    #[serde(default)]
    pub cells: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<PartialObjectMetadata>,
}

/// Lightweight object header embedded in each table row.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartialObjectMetadata {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl TableRow {
    /// Server-assigned UID of the row's object, if the header is present.
    pub fn uid(&self) -> Option<&str> {
        self.object.as_ref()?.metadata.uid.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.object.as_ref()?.metadata.name.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.object.as_ref()?.metadata.namespace.as_deref()
    }

    pub fn creation_timestamp(&self) -> Option<&Time> {
        self.object.as_ref()?.metadata.creation_timestamp.as_ref()
    }
}

/// The cached state of a single resource collection in the table view.
pub struct TableWatcher {
    base: WatcherBase,
    client: Client,
    url_path: String,
    cache: Arc<RwLock<Table>>,
}

impl TableWatcher {
    /// Creates an unstarted watcher. No network I/O happens until the
    /// first [`snapshot`](Self::snapshot).
    pub fn new(client: Client, context: &str, gvr: Gvr, namespace: Option<String>) -> Self {
        let url_path = DynamicObject::url_path(&gvr.api_resource(), namespace.as_deref());
        Self {
            base: WatcherBase::new(context, gvr, namespace, WatcherKind::Table),
            client,
            url_path,
            cache: Arc::new(RwLock::new(Table::default())),
        }
    }

    /// Returns the cached table with rows sorted by object name, first
    /// starting the list+watch cycle if it is not running.
    pub async fn snapshot(&self) -> Result<Table> {
        self.base.touch();
        {
            let mut task = self.base.task.lock().await;
            let running = task.as_ref().is_some_and(|t| !t.handle.is_finished());
            if !running {
                *task = Some(self.start().await?);
            }
        }

        let mut table = self.cache.read().unwrap().clone();
        table
            .rows
            .sort_by(|a, b| a.name().unwrap_or("").cmp(b.name().unwrap_or("")));
        Ok(table)
    }

    async fn start(&self) -> Result<WatchTask> {
        let request = Request::new(self.url_path.as_str());

        let mut list_request = request
            .list(&ListParams::default())
            .map_err(kube::Error::BuildRequest)
            .map_err(|source| self.base.list_error(source))?;
        accept_tables(&mut list_request);
        let table: Table = self
            .client
            .request(list_request)
            .await
            .map_err(|source| self.base.list_error(source))?;
        let version = table.metadata.resource_version.clone().unwrap_or_default();

        *self.cache.write().unwrap() = table;

        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let mut watch_request = request
            .watch(&params, &version)
            .map_err(kube::Error::BuildRequest)
            .map_err(|source| self.base.watch_error(source))?;
        accept_tables(&mut watch_request);
        let events = self
            .client
            .request_events::<Table>(watch_request)
            .await
            .map_err(|source| self.base.watch_error(source))?;

        let cache = Arc::clone(&self.cache);
        let id = self.base.id();
        let (stop, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            tracing::info!(watcher = %id, "background watch started");
            let mut events = Box::pin(events);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    event = events.next() => match event {
                        Some(Ok(event)) => apply_table_event(&cache, event),
                        // covers malformed row metadata as well: the event
                        // fails to decode, is skipped, and the cache stays
                        // intact
                        Some(Err(err)) => {
                            tracing::error!(watcher = %id, error = %err, "watch stream error");
                        }
                        None => break,
                    },
                }
            }
            tracing::info!(watcher = %id, "background watch finished");
        });

        Ok(WatchTask { stop, handle })
    }
}

#[async_trait]
impl Watcher for TableWatcher {
    async fn stop(&self) {
        self.base.stop().await;
    }

    fn last_used(&self) -> Instant {
        self.base.last_used()
    }

    fn touch(&self) {
        self.base.touch();
    }

    fn id(&self) -> String {
        self.base.id()
    }

    fn kind(&self) -> WatcherKind {
        WatcherKind::Table
    }
}

fn accept_tables(request: &mut http::Request<Vec<u8>>) {
    request
        .headers_mut()
        .insert(ACCEPT, HeaderValue::from_static(TABLE_ACCEPT));
}

/// Applies one watch event to the cached table. Watch events carry a
/// single-row table; rows are matched by header UID and the scan stops at
/// the first match.
fn apply_table_event(cache: &RwLock<Table>, event: WatchEvent<Table>) {
    match event {
        WatchEvent::Added(update) => {
            let Some(row) = update.rows.into_iter().next() else {
                tracing::debug!("table event without rows");
                return;
            };
            cache.write().unwrap().rows.push(row);
        }
        WatchEvent::Modified(update) => {
            let Some(row) = update.rows.into_iter().next() else {
                tracing::debug!("table event without rows");
                return;
            };
            let Some(uid) = row.uid().map(str::to_string) else {
                tracing::debug!("table row event without metadata header");
                return;
            };
            let mut table = cache.write().unwrap();
            if let Some(index) = table.rows.iter().position(|r| r.uid() == Some(uid.as_str())) {
                table.rows[index] = row;
            }
        }
        WatchEvent::Deleted(update) => {
            let Some(uid) = update.rows.first().and_then(|r| r.uid()).map(str::to_string) else {
                tracing::debug!("table row event without metadata header");
                return;
            };
            let mut table = cache.write().unwrap();
            if let Some(index) = table.rows.iter().position(|r| r.uid() == Some(uid.as_str())) {
                table.rows.remove(index);
            }
        }
        WatchEvent::Bookmark(_) => {}
        WatchEvent::Error(status) => {
            tracing::error!(
                code = status.code,
                reason = %status.reason,
                "watch event error: {}",
                status.message
            );
        }
    }
}
