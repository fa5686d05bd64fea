//! Mirror sync behavior between a primary and a secondary NPM instance.

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use npmsync::mirror::resources::sync_instance;
use npmsync::npm::{normalize_url, NpmClient};

async fn npm_client(server: &MockServer) -> NpmClient {
    Mock::given(method("POST"))
        .and(path("/api/tokens"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "tok",
            "expires": "2099-01-01T00:00:00.000Z",
        })))
        .mount(server)
        .await;
    NpmClient::new(
        normalize_url(&server.uri()).unwrap(),
        "admin@test".into(),
        "secret".into(),
    )
    .unwrap()
}

async fn mount_collection(server: &MockServer, api_path: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(api_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_empty_except(server: &MockServer, skip: &str) {
    for api_path in [
        "/api/nginx/certificates",
        "/api/nginx/access-lists",
        "/api/nginx/proxy-hosts",
        "/api/nginx/redirection-hosts",
        "/api/nginx/streams",
        "/api/nginx/dead-hosts",
    ] {
        if api_path != skip {
            mount_collection(server, api_path, json!([])).await;
        }
    }
}

fn primary_hosts() -> serde_json::Value {
    json!([
        {
            "id": 1,
            "created_on": "2024-05-01T00:00:00Z",
            "domain_names": ["a.test"],
            "forward_scheme": "http",
            "forward_host": "a",
            "forward_port": 80,
            "certificate_id": 0,
            "ssl_forced": false,
            "hsts_enabled": false,
            "hsts_subdomains": false,
            "http2_support": false,
            "block_exploits": true,
            "caching_enabled": false,
            "allow_websocket_upgrade": false,
            "access_list_id": 0,
            "advanced_config": "",
            "enabled": true,
            "locations": [],
            "meta": {"managed_by": "npmsync"},
        },
        {
            "id": 2,
            "created_on": "2024-05-01T00:00:00Z",
            "domain_names": ["b.test"],
            "forward_scheme": "http",
            "forward_host": "b",
            "forward_port": 90,
            "certificate_id": 0,
            "ssl_forced": false,
            "hsts_enabled": false,
            "hsts_subdomains": false,
            "http2_support": false,
            "block_exploits": true,
            "caching_enabled": false,
            "allow_websocket_upgrade": false,
            "access_list_id": 0,
            "advanced_config": "",
            "enabled": true,
            "locations": [],
            "meta": {"managed_by": "npmsync"},
        },
    ])
}

#[tokio::test]
async fn first_sync_creates_missing_hosts() {
    let primary_server = MockServer::start().await;
    let secondary_server = MockServer::start().await;
    let primary = npm_client(&primary_server).await;
    let secondary = npm_client(&secondary_server).await;

    mount_empty_except(&primary_server, "/api/nginx/proxy-hosts").await;
    mount_collection(&primary_server, "/api/nginx/proxy-hosts", primary_hosts()).await;

    mount_empty_except(&secondary_server, "").await;
    Mock::given(method("POST"))
        .and(path("/api/nginx/proxy-hosts"))
        .and(body_partial_json(json!({"block_exploits": 1, "enabled": 1})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 100})))
        .expect(2)
        .mount(&secondary_server)
        .await;

    let report = sync_instance(&primary, &secondary).await.unwrap();
    assert_eq!(report.synced, 2);
    assert_eq!(report.skipped, 0);
}

#[tokio::test]
async fn second_sync_is_idempotent() {
    let primary_server = MockServer::start().await;
    let secondary_server = MockServer::start().await;
    let primary = npm_client(&primary_server).await;
    let secondary = npm_client(&secondary_server).await;

    mount_empty_except(&primary_server, "/api/nginx/proxy-hosts").await;
    mount_collection(&primary_server, "/api/nginx/proxy-hosts", primary_hosts()).await;

    // The secondary already holds equivalent hosts, with the integer
    // boolean encoding NPM echoes back after a write.
    mount_empty_except(&secondary_server, "/api/nginx/proxy-hosts").await;
    mount_collection(
        &secondary_server,
        "/api/nginx/proxy-hosts",
        json!([
            {
                "id": 100,
                "domain_names": ["a.test"],
                "forward_scheme": "http",
                "forward_host": "a",
                "forward_port": 80,
                "certificate_id": 0,
                "ssl_forced": 0,
                "hsts_enabled": 0,
                "hsts_subdomains": 0,
                "http2_support": 0,
                "block_exploits": 1,
                "caching_enabled": 0,
                "allow_websocket_upgrade": 0,
                "access_list_id": 0,
                "advanced_config": "",
                "enabled": 1,
                "locations": [],
                "meta": {"mirrored_from": "http://primary"},
            },
            {
                "id": 101,
                "domain_names": ["b.test"],
                "forward_scheme": "http",
                "forward_host": "b",
                "forward_port": 90,
                "certificate_id": 0,
                "ssl_forced": 0,
                "hsts_enabled": 0,
                "hsts_subdomains": 0,
                "http2_support": 0,
                "block_exploits": 1,
                "caching_enabled": 0,
                "allow_websocket_upgrade": 0,
                "access_list_id": 0,
                "advanced_config": "",
                "enabled": 1,
                "locations": [],
                "meta": {"mirrored_from": "http://primary"},
            },
        ]),
    )
    .await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&secondary_server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&secondary_server)
        .await;

    let report = sync_instance(&primary, &secondary).await.unwrap();
    assert_eq!(report.synced, 0);
    assert_eq!(report.skipped, 2);
}

#[tokio::test]
async fn changed_host_is_updated_in_place() {
    let primary_server = MockServer::start().await;
    let secondary_server = MockServer::start().await;
    let primary = npm_client(&primary_server).await;
    let secondary = npm_client(&secondary_server).await;

    mount_empty_except(&primary_server, "/api/nginx/streams").await;
    mount_collection(
        &primary_server,
        "/api/nginx/streams",
        json!([{
            "id": 5,
            "incoming_port": 2222,
            "forwarding_host": "box",
            "forwarding_port": 2022,
            "tcp_forwarding": true,
            "udp_forwarding": false,
            "certificate_id": 0,
            "enabled": true,
        }]),
    )
    .await;

    mount_empty_except(&secondary_server, "/api/nginx/streams").await;
    mount_collection(
        &secondary_server,
        "/api/nginx/streams",
        json!([{
            "id": 9,
            "incoming_port": 2222,
            "forwarding_host": "box",
            "forwarding_port": 22,
            "tcp_forwarding": 1,
            "udp_forwarding": 0,
            "certificate_id": 0,
            "enabled": 1,
        }]),
    )
    .await;
    Mock::given(method("PUT"))
        .and(path("/api/nginx/streams/9"))
        .and(body_partial_json(json!({"forwarding_port": 2022})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 9})))
        .expect(1)
        .mount(&secondary_server)
        .await;

    let report = sync_instance(&primary, &secondary).await.unwrap();
    assert_eq!(report.synced, 1);
}

#[tokio::test]
async fn missing_certificates_are_reported_not_created() {
    let primary_server = MockServer::start().await;
    let secondary_server = MockServer::start().await;
    let primary = npm_client(&primary_server).await;
    let secondary = npm_client(&secondary_server).await;

    mount_empty_except(&primary_server, "/api/nginx/certificates").await;
    mount_collection(
        &primary_server,
        "/api/nginx/certificates",
        json!([{
            "id": 3,
            "nice_name": "wild",
            "provider": "letsencrypt",
            "domain_names": ["*.test"],
            "is_deleted": 0,
        }]),
    )
    .await;

    mount_empty_except(&secondary_server, "").await;
    Mock::given(method("POST"))
        .and(path("/api/nginx/certificates"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&secondary_server)
        .await;

    let report = sync_instance(&primary, &secondary).await.unwrap();
    assert_eq!(report.synced, 0);
    assert_eq!(report.skipped, 1);
}
