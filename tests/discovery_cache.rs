//! On-disk discovery cache behaviour.

use clusterlens::DiscoveryCache;
use http::{Request, Response};
use kube::Client;
use kube::client::Body;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

type MockHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

fn mock_client() -> (Client, MockHandle) {
    let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(service, "default"), handle)
}

async fn respond_json(handle: &mut MockHandle, expect_path: &str, body: serde_json::Value) {
    let (request, send) = handle.next_request().await.expect("request");
    assert_eq!(request.uri().path(), expect_path);
    send.send_response(
        Response::builder()
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
    );
}

/// Answers one full discovery round; `pod_resource` lets tests tell fetch
/// rounds apart.
async fn serve_discovery(handle: &mut MockHandle, pod_resource: &str) {
    respond_json(
        handle,
        "/api",
        json!({
            "kind": "APIVersions",
            "versions": ["v1"],
            "serverAddressByClientCIDRs": [],
        }),
    )
    .await;
    respond_json(
        handle,
        "/api/v1",
        json!({
            "kind": "APIResourceList",
            "groupVersion": "v1",
            "resources": [
                { "name": pod_resource, "singularName": "pod", "namespaced": true,
                  "kind": "Pod", "verbs": ["list", "watch"] },
            ],
        }),
    )
    .await;
    respond_json(handle, "/apis", json!({ "kind": "APIGroupList", "groups": [] })).await;
}

fn cache_file(root: &Path) -> std::path::PathBuf {
    root.join("test-host.json")
}

#[tokio::test]
async fn discovery_is_served_from_disk_while_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let (client, mut handle) = mock_client();
    let cache = DiscoveryCache::new(client, "ctx", "test-host", dir.path());

    let server = tokio::spawn(async move {
        serve_discovery(&mut handle, "pods").await;
        handle
    });

    let first = cache.server_preferred_resources().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].group_version(), "v1");
    assert_eq!(first[0].resources[0].name, "pods");
    assert!(first[0].resources[0].namespaced);
    assert!(cache_file(dir.path()).is_file());

    // keep the mock handle alive but give it no responses: a network
    // round-trip would hang and trip the timeout
    let handle = server.await.unwrap();
    let second = tokio::time::timeout(
        Duration::from_secs(1),
        cache.server_preferred_resources(),
    )
    .await
    .expect("served from disk")
    .unwrap();
    assert_eq!(second, first);
    drop(handle);
}

#[tokio::test]
async fn expired_cache_is_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let (client, mut handle) = mock_client();
    let cache = DiscoveryCache::new(client, "ctx", "test-host", dir.path());

    let server = tokio::spawn(async move {
        serve_discovery(&mut handle, "pods").await;
        serve_discovery(&mut handle, "podsv2").await;
        handle
    });

    cache.server_preferred_resources().await.unwrap();

    // age the cache stamp past the TTL
    let path = cache_file(dir.path());
    let mut contents: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    contents["fetched"] = json!("2000-01-01T00:00:00Z");
    std::fs::write(&path, serde_json::to_vec(&contents).unwrap()).unwrap();

    let refreshed = cache.server_preferred_resources().await.unwrap();
    assert_eq!(refreshed[0].resources[0].name, "podsv2");

    server.await.unwrap();
}

#[tokio::test]
async fn corrupt_cache_file_is_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let (client, mut handle) = mock_client();
    let cache = DiscoveryCache::new(client, "ctx", "test-host", dir.path());

    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(cache_file(dir.path()), b"not json").unwrap();

    let server = tokio::spawn(async move {
        serve_discovery(&mut handle, "pods").await;
        handle
    });

    let apis = cache.server_preferred_resources().await.unwrap();
    assert_eq!(apis[0].resources[0].name, "pods");

    server.await.unwrap();
}
