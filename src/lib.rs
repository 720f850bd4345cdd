//! Cluster access core for a desktop Kubernetes explorer.
//!
//! This library turns a user's kubeconfig into a bounded pool of live
//! cluster connections, each holding lazily-started, self-refreshing
//! caches of Kubernetes objects. It is designed to be linked into a host
//! process (a desktop shell) that exposes the [`Handler`] façade over its
//! own RPC transport.
//!
//! The layering, leaves first:
//!
//! - [`watcher`] — one watch-backed cache per `(resource, namespace, view)`
//! - [`connection`] — one cluster context owning a bounded watcher map
//! - [`service`] — the process-wide entry point owning the kubeconfig and
//!   a bounded connection map
//! - [`handler`] — a stateless adapter from wire messages to the service

pub mod connection;
pub mod discovery;
pub mod error;
pub mod gvr;
pub mod handler;
pub mod logging;
pub mod service;
pub mod watcher;

pub use connection::Connection;
pub use discovery::{ApiGroupVersion, ApiResourceInfo, DiscoveryCache};
pub use error::{Error, Result};
pub use gvr::Gvr;
pub use handler::Handler;
pub use service::Service;
pub use watcher::{AnyWatcher, ListWatcher, Table, TableWatcher, Watcher, WatcherKind};
