use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::npm::models::{META_MIRRORED_AT, META_MIRRORED_FROM};
use crate::npm::{NpmClient, NpmResult, ResourceKind};

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub synced: usize,
    pub skipped: usize,
}

/// Writable fields per kind: the subset of a fetched resource that is legal
/// to send back on create/update. Everything else (ids, timestamps, meta,
/// expanded relations) is server-owned.
fn writable_fields(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::ProxyHost => &[
            "domain_names",
            "forward_scheme",
            "forward_host",
            "forward_port",
            "certificate_id",
            "ssl_forced",
            "hsts_enabled",
            "hsts_subdomains",
            "http2_support",
            "block_exploits",
            "caching_enabled",
            "allow_websocket_upgrade",
            "access_list_id",
            "advanced_config",
            "enabled",
            "locations",
        ],
        ResourceKind::RedirectionHost => &[
            "domain_names",
            "forward_scheme",
            "forward_domain_name",
            "forward_http_code",
            "preserve_path",
            "certificate_id",
            "ssl_forced",
            "hsts_enabled",
            "hsts_subdomains",
            "http2_support",
            "block_exploits",
            "advanced_config",
            "enabled",
        ],
        ResourceKind::Stream => &[
            "incoming_port",
            "forwarding_host",
            "forwarding_port",
            "tcp_forwarding",
            "udp_forwarding",
            "certificate_id",
            "enabled",
        ],
        ResourceKind::DeadHost => &[
            "domain_names",
            "certificate_id",
            "ssl_forced",
            "hsts_enabled",
            "hsts_subdomains",
            "http2_support",
            "advanced_config",
            "enabled",
        ],
        ResourceKind::AccessList => &["name", "satisfy_any", "pass_auth", "items", "clients"],
        ResourceKind::Certificate => &["provider", "nice_name", "domain_names"],
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true"),
        _ => false,
    }
}

/// Normalizes a value for comparison across instances: booleans become 0/1
/// (the wire quirk means either encoding can come back) and nulls vanish.
fn normalize(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(json!(i64::from(*b))),
        Value::Array(items) => Some(Value::Array(items.iter().filter_map(normalize).collect())),
        Value::Object(map) => Some(Value::Object(
            map.iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k.clone(), v)))
                .collect(),
        )),
        other => Some(other.clone()),
    }
}

/// The comparable view of a resource: its writable fields, normalized.
fn view(kind: ResourceKind, resource: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    if let Some(object) = resource.as_object() {
        for field in writable_fields(kind) {
            if let Some(v) = object.get(*field).and_then(normalize) {
                out.insert((*field).to_string(), v);
            }
        }
    }
    out
}

fn canonical_hash(fields: &Map<String, Value>) -> String {
    // serde_json maps are sorted by key, so serialization is canonical.
    let serialized = Value::Object(fields.clone()).to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

fn remap(ids: &HashMap<i64, i64>, value: &Value) -> Value {
    let id = value_as_i64(value).unwrap_or(0);
    if id == 0 {
        json!(0)
    } else {
        // A missing mapping means the dependency never made it to the
        // secondary (typically an uncreatable certificate): fall back to 0.
        json!(ids.get(&id).copied().unwrap_or(0))
    }
}

/// Payload the secondary should hold for this primary resource, with
/// certificate and access list ids translated into the secondary's space.
fn desired_payload(
    kind: ResourceKind,
    primary: &Value,
    cert_map: &HashMap<i64, i64>,
    access_map: &HashMap<i64, i64>,
) -> Map<String, Value> {
    let mut payload = view(kind, primary);
    if let Some(current) = payload.get("certificate_id").cloned() {
        payload.insert("certificate_id".into(), remap(cert_map, &current));
    }
    if let Some(current) = payload.get("access_list_id").cloned() {
        payload.insert("access_list_id".into(), remap(access_map, &current));
    }
    payload
}

fn domain_set(resource: &Value) -> BTreeSet<String> {
    resource
        .get("domain_names")
        .and_then(Value::as_array)
        .map(|domains| {
            domains
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_ascii_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

/// Finds the secondary counterpart by natural key.
fn find_candidate<'a>(
    kind: ResourceKind,
    primary: &Value,
    secondaries: &'a [Value],
) -> Option<&'a Value> {
    match kind {
        ResourceKind::Certificate => {
            let nice_name = primary.get("nice_name").and_then(Value::as_str).unwrap_or("");
            let domains = domain_set(primary);
            secondaries.iter().find(|c| {
                (!nice_name.is_empty()
                    && c.get("nice_name").and_then(Value::as_str) == Some(nice_name))
                    || (!domains.is_empty() && domain_set(c) == domains)
            })
        }
        ResourceKind::AccessList => {
            let name = primary.get("name").and_then(Value::as_str)?;
            secondaries
                .iter()
                .find(|c| c.get("name").and_then(Value::as_str) == Some(name))
        }
        ResourceKind::ProxyHost | ResourceKind::RedirectionHost | ResourceKind::DeadHost => {
            let primary_domain = primary
                .get("domain_names")
                .and_then(Value::as_array)
                .and_then(|d| d.first())
                .and_then(Value::as_str)?
                .to_ascii_lowercase();
            secondaries.iter().find(|c| domain_set(c).contains(&primary_domain))
        }
        ResourceKind::Stream => {
            let port = value_as_i64(primary.get("incoming_port")?)?;
            secondaries
                .iter()
                .find(|c| c.get("incoming_port").and_then(value_as_i64) == Some(port))
        }
    }
}

fn record_mapping(
    kind: ResourceKind,
    primary_id: i64,
    secondary_id: i64,
    cert_map: &mut HashMap<i64, i64>,
    access_map: &mut HashMap<i64, i64>,
) {
    match kind {
        ResourceKind::Certificate => {
            cert_map.insert(primary_id, secondary_id);
        }
        ResourceKind::AccessList => {
            access_map.insert(primary_id, secondary_id);
        }
        _ => {}
    }
}

fn with_mirror_meta(mut payload: Map<String, Value>, primary_url: &str) -> Value {
    payload.insert(
        "meta".into(),
        json!({
            META_MIRRORED_FROM: primary_url,
            META_MIRRORED_AT: Utc::now().to_rfc3339(),
        }),
    );
    Value::Object(payload)
}

/// Mirrors one secondary from the primary, kinds in dependency order so id
/// maps exist before anything references them. A kind failing wholesale is
/// logged and the remaining kinds still run.
pub async fn sync_instance(primary: &NpmClient, secondary: &NpmClient) -> anyhow::Result<SyncReport> {
    let mut cert_map: HashMap<i64, i64> = HashMap::new();
    let mut access_map: HashMap<i64, i64> = HashMap::new();
    let mut report = SyncReport::default();

    for kind in ResourceKind::MIRROR_ORDER {
        match sync_kind(primary, secondary, kind, &mut cert_map, &mut access_map).await {
            Ok((synced, skipped)) => {
                info!(mirror = secondary.base_url(), %kind, synced, skipped, "kind mirrored");
                report.synced += synced;
                report.skipped += skipped;
            }
            Err(err) => {
                error!(mirror = secondary.base_url(), %kind, "failed to mirror kind: {err}");
            }
        }
    }

    Ok(report)
}

async fn sync_kind(
    primary: &NpmClient,
    secondary: &NpmClient,
    kind: ResourceKind,
    cert_map: &mut HashMap<i64, i64>,
    access_map: &mut HashMap<i64, i64>,
) -> NpmResult<(usize, usize)> {
    let primaries = primary.list_raw(kind).await?;
    let secondaries = secondary.list_raw(kind).await?;

    let mut synced = 0;
    let mut skipped = 0;
    for resource in primaries.iter().filter(|r| !truthy(r.get("is_deleted"))) {
        match sync_one(secondary, kind, resource, &secondaries, cert_map, access_map, primary.base_url())
            .await
        {
            Ok(true) => synced += 1,
            Ok(false) => skipped += 1,
            Err(err) => {
                let id = resource.get("id").and_then(value_as_i64).unwrap_or(0);
                error!(%kind, primary_id = id, "failed to mirror resource: {err}");
            }
        }
    }
    Ok((synced, skipped))
}

/// Returns true when a write happened on the secondary.
async fn sync_one(
    secondary: &NpmClient,
    kind: ResourceKind,
    primary_resource: &Value,
    secondaries: &[Value],
    cert_map: &mut HashMap<i64, i64>,
    access_map: &mut HashMap<i64, i64>,
    primary_url: &str,
) -> NpmResult<bool> {
    let primary_id = primary_resource
        .get("id")
        .and_then(value_as_i64)
        .unwrap_or(0);
    let desired = desired_payload(kind, primary_resource, cert_map, access_map);
    let desired_hash = canonical_hash(&desired);

    match find_candidate(kind, primary_resource, secondaries) {
        Some(existing) => {
            let existing_id = existing.get("id").and_then(value_as_i64).unwrap_or(0);
            record_mapping(kind, primary_id, existing_id, cert_map, access_map);

            if canonical_hash(&view(kind, existing)) == desired_hash {
                return Ok(false);
            }
            if kind == ResourceKind::Certificate {
                // Replacing a certificate in place would break every host
                // still serving it; divergence is reported, not repaired.
                debug!(
                    primary_id,
                    existing_id, "certificate differs on the secondary, updates are not performed"
                );
                return Ok(false);
            }

            secondary
                .update_raw(kind, existing_id, &with_mirror_meta(desired, primary_url))
                .await?;
            Ok(true)
        }
        None => {
            if kind == ResourceKind::Certificate {
                let name = primary_resource
                    .get("nice_name")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                info!(
                    primary_id,
                    name, "certificate absent on the secondary and creation needs a file upload, skipping"
                );
                return Ok(false);
            }

            let created = secondary
                .create_raw(kind, &with_mirror_meta(desired, primary_url))
                .await?;
            if let Some(id) = created.get("id").and_then(value_as_i64) {
                record_mapping(kind, primary_id, id, cert_map, access_map);
            }
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_accepts_every_wire_encoding() {
        assert!(truthy(Some(&json!(true))));
        assert!(truthy(Some(&json!(1))));
        assert!(truthy(Some(&json!("1"))));
        assert!(!truthy(Some(&json!(false))));
        assert!(!truthy(Some(&json!(0))));
        assert!(!truthy(Some(&json!("0"))));
        assert!(!truthy(None));
    }

    #[test]
    fn view_normalizes_booleans_and_drops_server_fields() {
        let resource = json!({
            "id": 9,
            "created_on": "2024-01-01",
            "incoming_port": 2222,
            "tcp_forwarding": true,
            "udp_forwarding": 0,
            "certificate_id": 0,
            "enabled": 1,
            "forwarding_host": "box",
            "forwarding_port": 22,
            "meta": {"mirrored_from": "x"},
        });
        let v = view(ResourceKind::Stream, &resource);
        assert_eq!(v.get("tcp_forwarding"), Some(&json!(1)));
        assert_eq!(v.get("udp_forwarding"), Some(&json!(0)));
        assert!(!v.contains_key("id"));
        assert!(!v.contains_key("meta"));
        assert!(!v.contains_key("created_on"));
    }

    #[test]
    fn hash_is_insensitive_to_boolean_encoding() {
        let a = view(ResourceKind::Stream, &json!({"incoming_port": 1, "tcp_forwarding": true}));
        let b = view(ResourceKind::Stream, &json!({"tcp_forwarding": 1, "incoming_port": 1}));
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn desired_payload_remaps_reference_ids() {
        let cert_map = HashMap::from([(5, 12)]);
        let access_map = HashMap::new();
        let primary = json!({
            "domain_names": ["a.test"],
            "certificate_id": 5,
            "access_list_id": 3,
            "forward_host": "a",
        });
        let payload = desired_payload(ResourceKind::ProxyHost, &primary, &cert_map, &access_map);
        assert_eq!(payload.get("certificate_id"), Some(&json!(12)));
        // Unmapped references degrade to 0 rather than leaking primary ids.
        assert_eq!(payload.get("access_list_id"), Some(&json!(0)));
    }

    #[test]
    fn candidate_streams_match_on_incoming_port_across_encodings() {
        let primary = json!({"incoming_port": "2222"});
        let secondaries = vec![json!({"id": 1, "incoming_port": 2222})];
        assert!(find_candidate(ResourceKind::Stream, &primary, &secondaries).is_some());
    }

    #[test]
    fn candidate_hosts_match_on_primary_domain() {
        let primary = json!({"domain_names": ["A.test", "b.test"]});
        let secondaries = vec![
            json!({"id": 1, "domain_names": ["other.test"]}),
            json!({"id": 2, "domain_names": ["c.test", "a.TEST"]}),
        ];
        let found = find_candidate(ResourceKind::ProxyHost, &primary, &secondaries).unwrap();
        assert_eq!(found.get("id"), Some(&json!(2)));
    }

    #[test]
    fn candidate_certificates_match_on_name_or_domain_set() {
        let primary = json!({"nice_name": "wild", "domain_names": ["*.test"]});
        let by_name = vec![json!({"id": 1, "nice_name": "wild", "domain_names": []})];
        assert!(find_candidate(ResourceKind::Certificate, &primary, &by_name).is_some());

        let unnamed = json!({"nice_name": "", "domain_names": ["x.test", "y.test"]});
        let by_domains = vec![json!({"id": 2, "nice_name": "other", "domain_names": ["Y.test", "X.test"]})];
        assert!(find_candidate(ResourceKind::Certificate, &unnamed, &by_domains).is_some());
    }
}
