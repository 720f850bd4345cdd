//! List-view watcher over unstructured objects.

use super::{WATCH_TIMEOUT_SECS, WatchTask, Watcher, WatcherBase, WatcherKind};
use crate::error::Result;
use crate::gvr::Gvr;
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, DynamicObject, ListParams, WatchParams};
use kube::core::WatchEvent;
use kube::{Client, ResourceExt};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::oneshot;

/// Cached objects of one resource collection, keyed by server-assigned
/// UID. Between events the map is authoritative.
type ObjectCache = Arc<RwLock<HashMap<String, DynamicObject>>>;

/// The cached state of a single resource collection in the list view.
pub struct ListWatcher {
    base: WatcherBase,
    api: Api<DynamicObject>,
    cache: ObjectCache,
}

impl ListWatcher {
    /// Creates an unstarted watcher. No network I/O happens until the
    /// first [`snapshot`](Self::snapshot).
    pub fn new(client: Client, context: &str, gvr: Gvr, namespace: Option<String>) -> Self {
        let resource = gvr.api_resource();
        let api = match namespace.as_deref() {
            Some(ns) => Api::namespaced_with(client, ns, &resource),
            None => Api::all_with(client, &resource),
        };
        Self {
            base: WatcherBase::new(context, gvr, namespace, WatcherKind::List),
            api,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the cached collection sorted by name, first starting the
    /// list+watch cycle if it is not running. Subsequent calls while the
    /// background task lives serve cached data without network I/O.
    pub async fn snapshot(&self) -> Result<Vec<DynamicObject>> {
        self.base.touch();
        {
            let mut task = self.base.task.lock().await;
            let running = task.as_ref().is_some_and(|t| !t.handle.is_finished());
            if !running {
                *task = Some(self.start().await?);
            }
        }

        let cache = self.cache.read().unwrap();
        let mut objects: Vec<DynamicObject> = cache.values().cloned().collect();
        drop(cache);
        objects.sort_by(|a, b| a.name_any().cmp(&b.name_any()));
        Ok(objects)
    }

    /// Lists the collection, reseeds the cache, opens a watch at the
    /// returned resource version and spawns the event loop. The caller
    /// holds the task lock, so only one cycle can start at a time.
    async fn start(&self) -> Result<WatchTask> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|source| self.base.list_error(source))?;
        let version = list.metadata.resource_version.clone().unwrap_or_default();

        {
            let mut cache = self.cache.write().unwrap();
            cache.clear();
            for object in list.items {
                if let Some(uid) = object.uid() {
                    cache.insert(uid, object);
                }
            }
        }

        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let events = self
            .api
            .watch(&params, &version)
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
                        Some(Ok(event)) => apply_event(&cache, event),
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
impl Watcher for ListWatcher {
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
        WatcherKind::List
    }
}

/// Applies one watch event to the UID-keyed cache. Each event is applied
/// under a single write-lock acquisition, so readers never observe a
/// half-applied event.
fn apply_event(cache: &RwLock<HashMap<String, DynamicObject>>, event: WatchEvent<DynamicObject>) {
    match event {
        WatchEvent::Added(object) | WatchEvent::Modified(object) => {
            if let Some(uid) = object.uid() {
                cache.write().unwrap().insert(uid, object);
            }
        }
        WatchEvent::Deleted(object) => {
            if let Some(uid) = object.uid() {
                cache.write().unwrap().remove(&uid);
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

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request, Response};
    use kube::client::Body;
    use serde_json::json;
    use std::time::Duration;

    type MockHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    fn mock_client() -> (Client, MockHandle) {
        let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        (Client::new(service, "default"), handle)
    }

    fn pod(name: &str, uid: &str, label: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "kube-system",
                "uid": uid,
                "labels": { "rev": label },
            },
        })
    }

    fn pod_list(pods: &[serde_json::Value], version: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": { "resourceVersion": version },
            "items": pods,
        }))
        .unwrap()
    }

    fn watch_body(events: &[serde_json::Value]) -> Vec<u8> {
        let mut body = Vec::new();
        for event in events {
            body.extend(serde_json::to_vec(event).unwrap());
            body.push(b'\n');
        }
        body
    }

    async fn respond(handle: &mut MockHandle, expect_path: &str, body: Vec<u8>) -> Request<Body> {
        let (request, send) = handle.next_request().await.expect("request");
        assert!(
            request.uri().path().starts_with(expect_path),
            "unexpected path {} (wanted {})",
            request.uri().path(),
            expect_path
        );
        send.send_response(Response::builder().body(Body::from(body)).unwrap());
        request
    }

    /// Polls until the background task has exited (the mock stream ends
    /// as soon as its body is consumed).
    async fn wait_finished(watcher: &ListWatcher) {
        loop {
            {
                let task = watcher.base.task.lock().await;
                if task.as_ref().is_none_or(|t| t.handle.is_finished()) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn snapshot_lists_and_sorts_by_name() {
        let (client, mut handle) = mock_client();
        let watcher = ListWatcher::new(
            client,
            "test",
            Gvr::core("v1", "pods"),
            Some("kube-system".to_string()),
        );

        let server = tokio::spawn(async move {
            let request = respond(
                &mut handle,
                "/api/v1/namespaces/kube-system/pods",
                pod_list(&[pod("p2", "u2", "a"), pod("p1", "u1", "a")], "10"),
            )
            .await;
            assert!(!request.uri().query().unwrap_or("").contains("watch=true"));

            let request = respond(
                &mut handle,
                "/api/v1/namespaces/kube-system/pods",
                watch_body(&[]),
            )
            .await;
            let query = request.uri().query().unwrap_or("").to_string();
            assert!(query.contains("watch=true"));
            assert!(query.contains("resourceVersion=10"));
            assert!(query.contains("timeoutSeconds=120"));
            handle
        });

        let objects = watcher.snapshot().await.unwrap();
        let names: Vec<String> = objects.iter().map(|o| o.name_any()).collect();
        assert_eq!(names, vec!["p1", "p2"]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn events_update_cache_and_closure_triggers_relist() {
        let (client, mut handle) = mock_client();
        let watcher = ListWatcher::new(client, "test", Gvr::core("v1", "pods"), None);

        let server = tokio::spawn(async move {
            respond(
                &mut handle,
                "/api/v1/pods",
                pod_list(&[pod("p1", "u1", "a"), pod("p2", "u2", "a")], "10"),
            )
            .await;
            respond(
                &mut handle,
                "/api/v1/pods",
                watch_body(&[
                    json!({ "type": "MODIFIED", "object": pod("p1", "u1", "b") }),
                    json!({ "type": "DELETED", "object": pod("p2", "u2", "a") }),
                    json!({ "type": "ADDED", "object": pod("p3", "u3", "a") }),
                ]),
            )
            .await;

            // the stream has closed; the next snapshot re-runs list+watch
            respond(
                &mut handle,
                "/api/v1/pods",
                pod_list(&[pod("p3", "u3", "a")], "20"),
            )
            .await;
            respond(&mut handle, "/api/v1/pods", watch_body(&[])).await;
            handle
        });

        let names: Vec<String> = watcher
            .snapshot()
            .await
            .unwrap()
            .iter()
            .map(|o| o.name_any())
            .collect();
        assert_eq!(names, vec!["p1", "p2"]);

        wait_finished(&watcher).await;
        {
            let cache = watcher.cache.read().unwrap();
            assert_eq!(cache.len(), 2, "delete applied, add applied");
            let p1 = cache.get("u1").unwrap();
            assert_eq!(p1.labels().get("rev").map(String::as_str), Some("b"));
            assert!(!cache.contains_key("u2"));
            assert!(cache.contains_key("u3"));
        }

        let names: Vec<String> = watcher
            .snapshot()
            .await
            .unwrap()
            .iter()
            .map(|o| o.name_any())
            .collect();
        assert_eq!(names, vec!["p3"]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn init_failure_leaves_watcher_unstarted() {
        let (client, mut handle) = mock_client();
        let watcher = ListWatcher::new(client, "test", Gvr::core("v1", "pods"), None);

        let server = tokio::spawn(async move {
            let (_, send) = handle.next_request().await.expect("list request");
            send.send_response(
                Response::builder()
                    .status(500)
                    .body(Body::from(
                        serde_json::to_vec(&json!({
                            "kind": "Status",
                            "apiVersion": "v1",
                            "status": "Failure",
                            "message": "boom",
                            "reason": "InternalError",
                            "code": 500,
                        }))
                        .unwrap(),
                    ))
                    .unwrap(),
            );
            handle
        });

        let err = watcher.snapshot().await.unwrap_err();
        assert!(matches!(err, crate::error::Error::List { .. }));
        assert!(watcher.base.task.lock().await.is_none());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn stop_joins_background_task_and_is_idempotent() {
        let (client, mut handle) = mock_client();
        let watcher = ListWatcher::new(client, "test", Gvr::core("v1", "pods"), None);

        let server = tokio::spawn(async move {
            respond(&mut handle, "/api/v1/pods", pod_list(&[], "1")).await;
            respond(&mut handle, "/api/v1/pods", watch_body(&[])).await;
            handle
        });

        watcher.snapshot().await.unwrap();
        watcher.stop().await;
        assert!(watcher.base.task.lock().await.is_none());
        // second stop finds nothing to do
        watcher.stop().await;

        server.await.unwrap();
    }
}
