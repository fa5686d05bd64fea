use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Value of `meta.managed_by` on every resource this controller creates.
pub const MANAGED_BY: &str = "npmsync";

pub const META_MANAGED_BY: &str = "managed_by";
pub const META_SYNC_INSTANCE_ID: &str = "sync_instance_id";
pub const META_NPM_URL: &str = "npm_url";
pub const META_CONTAINER_ID: &str = "container_id";
pub const META_PROXY_INDEX: &str = "proxy_index";
pub const META_STREAM_INDEX: &str = "stream_index";
pub const META_CREATED_AT: &str = "created_at";
pub const META_MIRRORED_FROM: &str = "mirrored_from";
pub const META_MIRRORED_AT: &str = "mirrored_at";

/// NPM echoes `meta` back verbatim but other writers put arbitrary JSON in
/// it, so values are kept as a small tagged union rather than one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integers may arrive as numbers or numeric strings.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(n) => Some(*n),
            MetaValue::Str(s) => s.trim().parse().ok(),
            MetaValue::Bool(_) => None,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Str(s.to_string())
    }
}

impl From<i64> for MetaValue {
    fn from(n: i64) -> Self {
        MetaValue::Int(n)
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Str(s)
    }
}

pub type Meta = BTreeMap<String, MetaValue>;

/// The six NPM resource collections, in mirror dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Certificate,
    AccessList,
    ProxyHost,
    RedirectionHost,
    Stream,
    DeadHost,
}

impl ResourceKind {
    pub const MIRROR_ORDER: [ResourceKind; 6] = [
        ResourceKind::Certificate,
        ResourceKind::AccessList,
        ResourceKind::ProxyHost,
        ResourceKind::RedirectionHost,
        ResourceKind::Stream,
        ResourceKind::DeadHost,
    ];

    pub fn api_path(self) -> &'static str {
        match self {
            ResourceKind::Certificate => "nginx/certificates",
            ResourceKind::AccessList => "nginx/access-lists",
            ResourceKind::ProxyHost => "nginx/proxy-hosts",
            ResourceKind::RedirectionHost => "nginx/redirection-hosts",
            ResourceKind::Stream => "nginx/streams",
            ResourceKind::DeadHost => "nginx/dead-hosts",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Certificate => "certificate",
            ResourceKind::AccessList => "access list",
            ResourceKind::ProxyHost => "proxy host",
            ResourceKind::RedirectionHost => "redirection host",
            ResourceKind::Stream => "stream",
            ResourceKind::DeadHost => "dead host",
        };
        f.write_str(name)
    }
}

/// NPM transmits booleans as 0/1 integers on writes and returns either form
/// on reads (sometimes even numeric strings). Writes always emit integers.
pub mod bool_int {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        struct BoolIntVisitor;

        impl<'de> Visitor<'de> for BoolIntVisitor {
            type Value = bool;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a boolean, 0/1 integer, or numeric string")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<bool, E> {
                Ok(v)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<bool, E> {
                Ok(v != 0)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<bool, E> {
                Ok(v != 0)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<bool, E> {
                match v.trim() {
                    "true" | "1" => Ok(true),
                    "false" | "0" | "" => Ok(false),
                    other => Err(E::custom(format!("not a boolean: {other:?}"))),
                }
            }
        }

        deserializer.deserialize_any(BoolIntVisitor)
    }
}

// ---------------------------------------------------------------------------
// Read models (lean: only the fields the reconcile path inspects)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyHost {
    pub id: i64,
    #[serde(default)]
    pub domain_names: Vec<String>,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamHost {
    pub id: i64,
    #[serde(default)]
    pub incoming_port: u16,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Certificate {
    pub id: i64,
    #[serde(default)]
    pub nice_name: String,
    #[serde(default)]
    pub domain_names: Vec<String>,
    #[serde(default, with = "bool_int")]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedResource {
    pub id: i64,
}

// ---------------------------------------------------------------------------
// Write payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ProxyHostPayload {
    pub domain_names: Vec<String>,
    pub forward_scheme: String,
    pub forward_host: String,
    pub forward_port: u16,
    pub certificate_id: i64,
    #[serde(with = "bool_int")]
    pub ssl_forced: bool,
    #[serde(with = "bool_int")]
    pub hsts_enabled: bool,
    #[serde(with = "bool_int")]
    pub hsts_subdomains: bool,
    #[serde(with = "bool_int")]
    pub http2_support: bool,
    #[serde(with = "bool_int")]
    pub block_exploits: bool,
    #[serde(with = "bool_int")]
    pub caching_enabled: bool,
    #[serde(with = "bool_int")]
    pub allow_websocket_upgrade: bool,
    pub access_list_id: i64,
    pub advanced_config: String,
    #[serde(with = "bool_int")]
    pub enabled: bool,
    pub locations: Vec<serde_json::Value>,
    pub meta: Meta,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamPayload {
    pub incoming_port: u16,
    pub forwarding_host: String,
    pub forwarding_port: u16,
    #[serde(with = "bool_int")]
    pub tcp_forwarding: bool,
    #[serde(with = "bool_int")]
    pub udp_forwarding: bool,
    pub certificate_id: i64,
    #[serde(with = "bool_int")]
    pub enabled: bool,
    pub meta: Meta,
}

/// Ownership meta stamped on every resource the reconciler writes.
pub fn owned_meta(
    instance_id: &str,
    npm_url: &str,
    container_id: &str,
    index_key: &'static str,
    index: u8,
) -> Meta {
    let mut meta = Meta::new();
    meta.insert(META_MANAGED_BY.into(), MANAGED_BY.into());
    meta.insert(META_SYNC_INSTANCE_ID.into(), instance_id.into());
    meta.insert(META_NPM_URL.into(), npm_url.into());
    meta.insert(META_CONTAINER_ID.into(), container_id.into());
    meta.insert(index_key.into(), MetaValue::Int(i64::from(index)));
    meta.insert(META_CREATED_AT.into(), Utc::now().to_rfc3339().into());
    meta
}

// ---------------------------------------------------------------------------
// Meta helpers: the ownership ledger
// ---------------------------------------------------------------------------

/// A resource is ours iff `managed_by` matches and `sync_instance_id` either
/// matches the local id or is absent (resources written before instance ids
/// existed).
pub fn is_ours_for_instance(meta: &Meta, instance_id: &str) -> bool {
    let managed = meta
        .get(META_MANAGED_BY)
        .and_then(MetaValue::as_str)
        .map(|v| v == MANAGED_BY)
        .unwrap_or(false);
    if !managed {
        return false;
    }
    match meta.get(META_SYNC_INSTANCE_ID).and_then(MetaValue::as_str) {
        Some(owner) => owner == instance_id,
        None => true,
    }
}

pub fn meta_container_id(meta: &Meta) -> Option<&str> {
    meta.get(META_CONTAINER_ID).and_then(MetaValue::as_str)
}

pub fn meta_instance_id(meta: &Meta) -> Option<&str> {
    meta.get(META_SYNC_INSTANCE_ID).and_then(MetaValue::as_str)
}

pub fn meta_npm_url(meta: &Meta) -> Option<&str> {
    meta.get(META_NPM_URL).and_then(MetaValue::as_str)
}

pub fn meta_proxy_index(meta: &Meta) -> Option<u8> {
    meta.get(META_PROXY_INDEX)
        .and_then(MetaValue::as_i64)
        .and_then(|n| u8::try_from(n).ok())
}

pub fn meta_stream_index(meta: &Meta) -> Option<u8> {
    meta.get(META_STREAM_INDEX)
        .and_then(MetaValue::as_i64)
        .and_then(|n| u8::try_from(n).ok())
}
