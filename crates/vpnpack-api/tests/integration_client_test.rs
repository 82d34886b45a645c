#![allow(clippy::unwrap_used)]
// Integration tests for `IntegrationClient` using wiremock.

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vpnpack_api::integration::types::{
    FirewallPolicyCreate, FirewallZoneCreate, IpProtocolScope, PolicyAction, PolicyEndpoint,
};
use vpnpack_api::{Error, IntegrationClient, TransportConfig};

const BASE: &str = "/proxy/network/integration";

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, IntegrationClient) {
    let server = MockServer::start().await;
    let client = IntegrationClient::from_reqwest(
        &format!("{}{BASE}", server.uri()),
        reqwest::Client::new(),
    )
    .unwrap();
    (server, client)
}

// ── Happy-path tests ────────────────────────────────────────────────

#[tokio::test]
async fn test_api_key_header_is_sent() {
    let server = MockServer::start().await;
    let key = secrecy::SecretString::from("abc123".to_owned());
    let client = IntegrationClient::from_api_key(
        &format!("{}{BASE}", server.uri()),
        &key,
        &TransportConfig::default(),
    )
    .unwrap();

    Mock::given(method("GET"))
        .and(path(format!("{BASE}/v1/info")))
        .and(header("X-API-Key", "abc123"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "applicationVersion": "9.1.120" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let info = client.get_info().await.unwrap();
    assert_eq!(info.application_version, "9.1.120");
}

#[tokio::test]
async fn test_empty_api_key_is_rejected_locally() {
    let key = secrecy::SecretString::from(String::new());
    let result = IntegrationClient::from_api_key(
        "https://127.0.0.1/proxy/network/integration",
        &key,
        &TransportConfig::default(),
    );
    assert!(matches!(result, Err(Error::InvalidApiKey)));
}

#[tokio::test]
async fn test_list_zones_follows_pages() {
    let (server, client) = setup().await;
    let client = client.with_page_limit(2);

    Mock::given(method("GET"))
        .and(path(format!("{BASE}/v1/sites/s1/firewall/zones")))
        .and(query_param("offset", "0"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "offset": 0, "limit": 2, "count": 2, "totalCount": 3,
            "data": [
                { "id": "z1", "name": "Internal", "networkIds": ["n1"] },
                { "id": "z2", "name": "External", "networkIds": [] },
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("{BASE}/v1/sites/s1/firewall/zones")))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "offset": 2, "limit": 2, "count": 1, "totalCount": 3,
            "data": [ { "id": "z3", "name": "Gateway" } ]
        })))
        .mount(&server)
        .await;

    let zones = client.list_firewall_zones("s1").await.unwrap();
    let names: Vec<_> = zones.iter().map(|z| z.name.as_str()).collect();
    assert_eq!(names, vec!["Internal", "External", "Gateway"]);
    assert!(zones[2].network_ids.is_empty());
}

#[tokio::test]
async fn test_create_zone_posts_empty_networks() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path(format!("{BASE}/v1/sites/s1/firewall/zones")))
        .and(body_partial_json(json!({ "name": "VPN Pack: Tailscale", "networkIds": [] })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "zone-new", "name": "VPN Pack: Tailscale", "networkIds": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let zone = client
        .create_firewall_zone("s1", &FirewallZoneCreate::empty("VPN Pack: Tailscale"))
        .await
        .unwrap();
    assert_eq!(zone.id, "zone-new");
}

#[tokio::test]
async fn test_create_policy_round_trip() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path(format!("{BASE}/v1/sites/s1/firewall/policies")))
        .and(body_partial_json(json!({
            "name": "VPN Pack: Allow Tailscale to Internal",
            "action": { "type": "ALLOW", "allowReturnTraffic": true },
            "ipProtocolScope": { "ipVersion": "IPV4_AND_IPV6" },
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "p1",
            "name": "VPN Pack: Allow Tailscale to Internal",
            "enabled": true,
            "action": { "type": "ALLOW" },
            "source": { "zoneId": "zt" },
            "destination": { "zoneId": "zi" },
            "index": 10000,
        })))
        .mount(&server)
        .await;

    let created = client
        .create_firewall_policy(
            "s1",
            &FirewallPolicyCreate {
                enabled: true,
                name: "VPN Pack: Allow Tailscale to Internal".into(),
                action: PolicyAction::allow(true),
                source: PolicyEndpoint::zone("zt"),
                destination: PolicyEndpoint::zone("zi"),
                ip_protocol_scope: IpProtocolScope::dual_stack(),
                logging_enabled: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(created.id, "p1");
    assert_eq!(created.source["zoneId"], "zt");
    assert_eq!(created.extra["index"], 10000);
}

// ── Error mapping ───────────────────────────────────────────────────

#[tokio::test]
async fn test_401_and_403_map_to_invalid_api_key() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path(format!("{BASE}/v1/info")))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{BASE}/v1/sites")))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = client.get_info().await.unwrap_err();
    assert!(err.is_unauthorized(), "got {err:?}");
    let err = client.list_sites().await.unwrap_err();
    assert!(err.is_unauthorized(), "got {err:?}");
}

#[tokio::test]
async fn test_delete_404_is_not_found() {
    let (server, client) = setup().await;

    Mock::given(method("DELETE"))
        .and(path(format!("{BASE}/v1/sites/s1/firewall/policies/gone")))
        .respond_with(ResponseTemplate::new(404).set_body_string("{\"code\":\"api.err.NotFound\"}"))
        .mount(&server)
        .await;

    let err = client.delete_firewall_policy("s1", "gone").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.api_error_code(), Some("api.err.NotFound"));
}

#[tokio::test]
async fn test_server_error_keeps_raw_body() {
    let (server, client) = setup().await;

    Mock::given(method("DELETE"))
        .and(path(format!("{BASE}/v1/sites/s1/firewall/zones/z9")))
        .respond_with(ResponseTemplate::new(500).set_body_string("zone is referenced"))
        .mount(&server)
        .await;

    let err = client.delete_firewall_zone("s1", "z9").await.unwrap_err();
    match err {
        Error::Integration {
            status, message, ..
        } => {
            assert_eq!(status, 500);
            assert_eq!(message, "zone is referenced");
        }
        other => panic!("expected Integration error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_body_is_deserialization_error() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path(format!("{BASE}/v1/info")))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = client.get_info().await.unwrap_err();
    assert!(matches!(err, Error::Deserialization { .. }));
}
