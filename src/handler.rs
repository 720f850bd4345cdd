//! Stateless façade translating wire messages into service calls.
//!
//! The host process owns the actual RPC transport; this module only
//! defines the logical request and reply messages and the projection of
//! core results into them. Every internal failure collapses into the
//! single external `internal` code, with the full error chain preserved
//! in the message.

use crate::discovery::ApiGroupVersion;
use crate::error::Error;
use crate::gvr::Gvr;
use crate::service::Service;
use crate::watcher::{Table, TableRow};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// External error category. Only one exists: clients are not expected to
/// dispatch on failure causes, only to display them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcCode {
    Internal,
}

/// The error shape handed to the RPC transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: RpcCode,
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "internal: {}", self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<Error> for RpcError {
    fn from(err: Error) -> Self {
        tracing::error!(error = %err, "request failed");
        Self {
            code: RpcCode::Internal,
            message: error_chain(&err),
        }
    }
}

/// Flattens an error and its sources into one message, the way wrapped
/// errors render in logs.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContextsReply {
    pub contexts: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContextReply {
    pub context: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub context: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscoverReply {
    /// Served group/versions keyed by their `group/version` string (bare
    /// version for the core group).
    pub apis: BTreeMap<String, ApiGroupVersion>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListResourceRequest {
    pub context: String,
    pub gvr: Gvr,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// A `(group, version, kind)` triple as carried by returned objects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gvk {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

/// One object in a list reply.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub gvk: Gvk,
    /// The full object as a JSON tree.
    pub raw: serde_json::Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListResourceReply {
    pub resources: Vec<Resource>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
}

/// Identity of the object behind a table row.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TableRowReply {
    pub cells: Vec<String>,
    pub resource: ResourceSummary,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TableReply {
    pub columns: Vec<TableColumn>,
    pub rows: Vec<TableRowReply>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NamespacesRequest {
    pub context: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NamespacesReply {
    pub namespaces: Vec<String>,
}

/// The request adapter the host process mounts behind its RPC transport.
/// Stateless: all state lives in the [`Service`].
pub struct Handler {
    service: Arc<Service>,
}

impl Handler {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }

    pub fn get_contexts(&self) -> ContextsReply {
        ContextsReply {
            contexts: self.service.context_names(),
        }
    }

    pub fn get_default_context(&self) -> ContextReply {
        ContextReply {
            context: self.service.default_context(),
        }
    }

    pub async fn discover(&self, request: DiscoverRequest) -> Result<DiscoverReply, RpcError> {
        let apis = self.service.discover(&request.context).await?;
        let apis = apis
            .into_iter()
            .map(|api| (api.group_version(), api))
            .collect();
        Ok(DiscoverReply { apis })
    }

    pub async fn list_resource(
        &self,
        request: ListResourceRequest,
    ) -> Result<ListResourceReply, RpcError> {
        let objects = self
            .service
            .list(&request.context, &request.gvr, request.namespace.as_deref())
            .await?;
        Ok(ListResourceReply {
            resources: objects.into_iter().map(project_object).collect(),
        })
    }

    pub async fn list_resource_tabular(
        &self,
        request: ListResourceRequest,
    ) -> Result<TableReply, RpcError> {
        let table = self
            .service
            .table(&request.context, &request.gvr, request.namespace.as_deref())
            .await?;
        Ok(project_table(table))
    }

    pub async fn get_namespaces(
        &self,
        request: NamespacesRequest,
    ) -> Result<NamespacesReply, RpcError> {
        let namespaces = self.service.namespaces(&request.context).await?;
        Ok(NamespacesReply { namespaces })
    }
}

fn project_object(object: DynamicObject) -> Resource {
    let gvk = object
        .types
        .as_ref()
        .map(|types| {
            let (group, version) = Gvr::split_api_version(&types.api_version);
            Gvk {
                group,
                version,
                kind: types.kind.clone(),
            }
        })
        .unwrap_or_default();
    Resource {
        name: object.name_any(),
        namespace: object.namespace(),
        gvk,
        raw: serde_json::to_value(&object).unwrap_or_default(),
    }
}

fn project_table(table: Table) -> TableReply {
    let columns = table
        .column_definitions
        .into_iter()
        .map(|column| TableColumn {
            name: column.name,
            type_: column.type_,
        })
        .collect();
    let rows = table.rows.into_iter().map(project_row).collect();
    TableReply { columns, rows }
}

fn project_row(row: TableRow) -> TableRowReply {
    let resource = ResourceSummary {
        name: row.name().unwrap_or_default().to_string(),
        namespace: row.namespace().map(str::to_string),
        created: row.creation_timestamp().map(|time| time.0),
    };
    TableRowReply {
        cells: row.cells.iter().map(render_cell).collect(),
        resource,
    }
}

/// Renders an opaque cell value for display: strings pass through, null
/// renders empty, everything else as compact JSON.
fn render_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
