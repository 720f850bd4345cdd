//! Error types for the cluster access core.
//!
//! The variants map to the failure classes the core distinguishes:
//! kubeconfig problems, client construction, discovery, and watcher
//! initialisation. Mid-stream watch failures and malformed table rows are
//! recovered locally and never surface here.

use crate::watcher::WatcherKind;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All errors surfaced by the cluster access core.
#[derive(Debug, Error)]
pub enum Error {
    /// The kubeconfig could not be resolved for the requested context.
    ///
    /// Also covers the empty-kubeconfig case: a service constructed from
    /// an unparseable kubeconfig serves context queries but fails every
    /// cluster-touching operation with this variant.
    #[error("kubeconfig error")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// Building the client for a context failed (TLS, auth plugin, proxy).
    #[error("failed to build client for context {context:?}")]
    Connection {
        context: String,
        #[source]
        source: kube::Error,
    },

    /// Resource discovery against the API server failed.
    #[error("failed to discover resources (context: {context})")]
    Discovery {
        context: String,
        #[source]
        source: kube::Error,
    },

    /// The initial list failed; the watcher stays unstarted and the next
    /// snapshot retries.
    #[error("failed to list {resource} (context: {context}, namespace: {namespace:?})")]
    List {
        context: String,
        resource: String,
        namespace: Option<String>,
        #[source]
        source: kube::Error,
    },

    /// Opening the watch failed during initialisation; same retry
    /// semantics as a list failure.
    #[error("failed to watch {resource} (context: {context}, namespace: {namespace:?})")]
    Watch {
        context: String,
        resource: String,
        namespace: Option<String>,
        #[source]
        source: kube::Error,
    },

    /// A snapshot was requested through a view the watcher does not serve.
    #[error("watcher {id} does not support the {requested} view")]
    UnsupportedView { id: String, requested: WatcherKind },
}
