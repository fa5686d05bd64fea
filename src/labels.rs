use std::collections::{BTreeMap, HashMap};

use tracing::warn;

/// Reserved label namespace. `npm.` and `npm-` are synonyms, and after the
/// prefix `.` and `-` separate segments interchangeably, so
/// `npm-proxy-0-domains` parses the same as `npm.proxy.0.domains`.
pub const LABEL_PREFIX_DOT: &str = "npm.";
pub const LABEL_PREFIX_DASH: &str = "npm-";

/// Highest recognised per-container index.
pub const MAX_INDEX: u8 = 99;

/// Process-wide fallbacks for the seven proxy booleans, overridable from the
/// environment. Only `block_exploits` defaults on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyDefaults {
    pub ssl_forced: bool,
    pub caching_enabled: bool,
    pub block_exploits: bool,
    pub websocket_upgrade: bool,
    pub http2: bool,
    pub hsts: bool,
    pub hsts_subdomains: bool,
}

impl Default for ProxyDefaults {
    fn default() -> Self {
        Self {
            ssl_forced: false,
            caching_enabled: false,
            block_exploits: true,
            websocket_upgrade: false,
            http2: false,
            hsts: false,
            hsts_subdomains: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardScheme {
    #[default]
    Http,
    Https,
}

impl ForwardScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            ForwardScheme::Http => "http",
            ForwardScheme::Https => "https",
        }
    }
}

/// One HTTP proxy host, as declared by the labels of a single
/// `(container, index)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub index: u8,
    pub domains: Vec<String>,
    pub forward_scheme: ForwardScheme,
    pub forward_host: Option<String>,
    pub forward_port: Option<u16>,
    pub ssl_forced: bool,
    pub caching_enabled: bool,
    pub block_exploits: bool,
    pub websocket_upgrade: bool,
    pub http2: bool,
    pub hsts: bool,
    pub hsts_subdomains: bool,
    pub certificate_id: Option<i64>,
    pub access_list_id: Option<i64>,
    pub advanced_config: String,
}

/// One TCP/UDP stream declared by container labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub index: u8,
    pub incoming_port: u16,
    pub forward_host: Option<String>,
    pub forward_port: Option<u16>,
    pub tcp_forwarding: bool,
    pub udp_forwarding: bool,
    /// Raw `ssl` label: a numeric certificate id or a domain to resolve.
    pub ssl_certificate: Option<String>,
}

/// True for labels in the reserved namespace; these are the only keys that
/// participate in the label hash.
pub fn is_reserved_label(key: &str) -> bool {
    key.starts_with(LABEL_PREFIX_DOT) || key.starts_with(LABEL_PREFIX_DASH)
}

/// Booleans accept `true`, `1`, `yes`, `on` case-insensitively; anything
/// else (including absence) is false.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Strips the reserved prefix and normalizes `-` to `.` so both spellings
/// share one grammar. Returns `None` for keys outside the namespace.
fn normalized_key(key: &str) -> Option<String> {
    let rest = key
        .strip_prefix(LABEL_PREFIX_DOT)
        .or_else(|| key.strip_prefix(LABEL_PREFIX_DASH))?;
    Some(rest.replace('-', "."))
}

/// Per-index bag of raw values. `explicit` records whether the index was
/// spelled out; `npm.proxy.0.port` must beat `npm.proxy.port`.
#[derive(Default)]
struct IndexedValues {
    values: HashMap<String, (String, bool)>,
}

impl IndexedValues {
    fn insert(&mut self, key: String, value: String, explicit: bool) {
        match self.values.get(&key) {
            Some((_, true)) if !explicit => {}
            _ => {
                self.values.insert(key, (value, explicit));
            }
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|(v, _)| v.as_str())
    }
}

fn group_by_index<'a>(
    labels: impl Iterator<Item = (&'a str, &'a str)>,
    group: &str,
) -> BTreeMap<u8, IndexedValues> {
    let mut out: BTreeMap<u8, IndexedValues> = BTreeMap::new();

    for (key, value) in labels {
        let Some(normalized) = normalized_key(key) else {
            continue;
        };
        let Some(rest) = normalized.strip_prefix(group).and_then(|r| r.strip_prefix('.')) else {
            continue;
        };

        let mut segments = rest.splitn(2, '.');
        let head = segments.next().unwrap_or_default();
        let tail = segments.next();

        let (index, field, explicit) = match (head.parse::<u32>(), tail) {
            (Ok(n), Some(field)) => {
                if n > u32::from(MAX_INDEX) {
                    warn!(label = key, index = n, "label index out of range, ignoring");
                    continue;
                }
                (n as u8, field.to_string(), true)
            }
            (Ok(_), None) => {
                warn!(label = key, "label has an index but no field, ignoring");
                continue;
            }
            (Err(_), _) => (0, rest.to_string(), false),
        };

        out.entry(index)
            .or_default()
            .insert(field, value.to_string(), explicit);
    }

    out
}

fn parse_domains(values: &IndexedValues) -> Option<Vec<String>> {
    let raw = values.get("domains").or_else(|| values.get("domain"))?;
    let domains: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect();
    if domains.is_empty() {
        None
    } else {
        Some(domains)
    }
}

fn parse_number<T: std::str::FromStr>(
    values: &IndexedValues,
    key: &str,
    context: &str,
    index: u8,
) -> Result<Option<T>, ()> {
    match values.get(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(n) => Ok(Some(n)),
            Err(_) => {
                warn!(%index, key, value = raw, "malformed {context} label, skipping index");
                Err(())
            }
        },
    }
}

fn bool_or(values: &IndexedValues, key: &str, default: bool) -> bool {
    values.get(key).map(parse_bool).unwrap_or(default)
}

fn build_proxy(index: u8, values: &IndexedValues, defaults: &ProxyDefaults) -> Option<ProxyConfig> {
    let Some(domains) = parse_domains(values) else {
        warn!(%index, "proxy labels present but no domains, skipping index");
        return None;
    };

    let forward_port = parse_number::<u16>(values, "port", "proxy port", index).ok()?;
    let certificate_id = parse_number::<i64>(values, "ssl.certificate.id", "certificate id", index).ok()?;
    let access_list_id = parse_number::<i64>(values, "accesslist.id", "access list id", index).ok()?;

    let forward_scheme = match values.get("scheme") {
        None => ForwardScheme::Http,
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "http" => ForwardScheme::Http,
            "https" => ForwardScheme::Https,
            other => {
                warn!(%index, scheme = other, "unknown forward scheme, using http");
                ForwardScheme::Http
            }
        },
    };

    Some(ProxyConfig {
        index,
        domains,
        forward_scheme,
        forward_host: values.get("host").map(str::trim).filter(|h| !h.is_empty()).map(str::to_string),
        forward_port,
        ssl_forced: bool_or(values, "ssl.force", defaults.ssl_forced),
        caching_enabled: bool_or(values, "caching", defaults.caching_enabled),
        block_exploits: bool_or(values, "block_common_exploits", defaults.block_exploits),
        websocket_upgrade: bool_or(values, "websockets", defaults.websocket_upgrade),
        http2: bool_or(values, "ssl.http2", defaults.http2),
        hsts: bool_or(values, "ssl.hsts", defaults.hsts),
        hsts_subdomains: bool_or(values, "ssl.hsts.subdomains", defaults.hsts_subdomains),
        certificate_id,
        access_list_id,
        advanced_config: values.get("advanced.config").unwrap_or_default().to_string(),
    })
}

fn build_stream(index: u8, values: &IndexedValues) -> Option<StreamConfig> {
    let incoming_port = match parse_number::<u16>(values, "incoming.port", "incoming port", index)
    {
        Ok(Some(p)) if p > 0 => p,
        Ok(Some(_)) | Ok(None) => {
            warn!(%index, "stream labels present but no usable incoming.port, skipping index");
            return None;
        }
        Err(()) => return None,
    };

    let forward_port = parse_number::<u16>(values, "forward.port", "forward port", index).ok()?;

    let tcp_forwarding = bool_or(values, "forward.tcp", true);
    let udp_forwarding = bool_or(values, "forward.udp", false);
    if !tcp_forwarding && !udp_forwarding {
        warn!(%index, "stream disables both tcp and udp forwarding, skipping index");
        return None;
    }

    Some(StreamConfig {
        index,
        incoming_port,
        forward_host: values
            .get("forward.host")
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string),
        forward_port,
        tcp_forwarding,
        udp_forwarding,
        ssl_certificate: values.get("ssl").map(str::trim).filter(|s| !s.is_empty()).map(str::to_string),
    })
}

/// Parses the full label map of one container into its declared proxy and
/// stream configurations. A malformed index never aborts the others.
pub fn parse_labels(
    labels: &HashMap<String, String>,
    defaults: &ProxyDefaults,
) -> (BTreeMap<u8, ProxyConfig>, BTreeMap<u8, StreamConfig>) {
    let entries = || labels.iter().map(|(k, v)| (k.as_str(), v.as_str()));

    let proxies = group_by_index(entries(), "proxy")
        .iter()
        .filter_map(|(index, values)| {
            build_proxy(*index, values, defaults).map(|cfg| (*index, cfg))
        })
        .collect();

    let streams = group_by_index(entries(), "stream")
        .iter()
        .filter_map(|(index, values)| build_stream(*index, values).map(|cfg| (*index, cfg)))
        .collect();

    (proxies, streams)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn implicit_index_zero() {
        let (proxies, _) = parse_labels(
            &labels(&[("npm.proxy.domains", "a.test"), ("npm.proxy.port", "8080")]),
            &ProxyDefaults::default(),
        );
        let cfg = &proxies[&0];
        assert_eq!(cfg.domains, vec!["a.test"]);
        assert_eq!(cfg.forward_port, Some(8080));
        assert_eq!(cfg.forward_scheme, ForwardScheme::Http);
    }

    #[test]
    fn dash_spelling_is_a_synonym() {
        let dotted = parse_labels(
            &labels(&[("npm.proxy.0.domains", "a.test")]),
            &ProxyDefaults::default(),
        );
        let dashed = parse_labels(
            &labels(&[("npm-proxy-0-domains", "a.test")]),
            &ProxyDefaults::default(),
        );
        assert_eq!(dotted.0, dashed.0);
    }

    #[test]
    fn explicit_index_zero_beats_implicit() {
        let (proxies, _) = parse_labels(
            &labels(&[
                ("npm.proxy.domains", "implicit.test"),
                ("npm.proxy.0.domains", "explicit.test"),
            ]),
            &ProxyDefaults::default(),
        );
        assert_eq!(proxies[&0].domains, vec!["explicit.test"]);
    }

    #[test]
    fn multi_index_yields_distinct_configs() {
        let (proxies, _) = parse_labels(
            &labels(&[
                ("npm.proxy.0.domains", "a"),
                ("npm.proxy.0.port", "80"),
                ("npm.proxy.1.domains", "b"),
                ("npm.proxy.1.port", "90"),
            ]),
            &ProxyDefaults::default(),
        );
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[&0].forward_port, Some(80));
        assert_eq!(proxies[&1].forward_port, Some(90));
    }

    #[test]
    fn domains_are_split_trimmed_and_deduped_of_empties() {
        let (proxies, _) = parse_labels(
            &labels(&[("npm.proxy.domains", " a.test , b.test ,,")]),
            &ProxyDefaults::default(),
        );
        assert_eq!(proxies[&0].domains, vec!["a.test", "b.test"]);
    }

    #[test]
    fn singular_domain_is_accepted() {
        let (proxies, _) = parse_labels(
            &labels(&[("npm.proxy.domain", "only.test")]),
            &ProxyDefaults::default(),
        );
        assert_eq!(proxies[&0].domains, vec!["only.test"]);
    }

    #[test]
    fn malformed_port_voids_only_that_index() {
        let (proxies, _) = parse_labels(
            &labels(&[
                ("npm.proxy.0.domains", "a"),
                ("npm.proxy.0.port", "eighty"),
                ("npm.proxy.1.domains", "b"),
                ("npm.proxy.1.port", "81"),
            ]),
            &ProxyDefaults::default(),
        );
        assert!(!proxies.contains_key(&0));
        assert_eq!(proxies[&1].forward_port, Some(81));
    }

    #[test]
    fn missing_domains_voids_the_index() {
        let (proxies, _) = parse_labels(
            &labels(&[("npm.proxy.0.port", "80")]),
            &ProxyDefaults::default(),
        );
        assert!(proxies.is_empty());
    }

    #[test]
    fn index_above_bound_is_ignored() {
        let (proxies, _) = parse_labels(
            &labels(&[("npm.proxy.100.domains", "a.test")]),
            &ProxyDefaults::default(),
        );
        assert!(proxies.is_empty());
    }

    #[test]
    fn boolean_spellings() {
        for v in ["true", "TRUE", "1", "yes", "On"] {
            assert!(parse_bool(v), "{v} should be true");
        }
        for v in ["false", "0", "no", "off", "nonsense"] {
            assert!(!parse_bool(v), "{v} should be false");
        }
    }

    #[test]
    fn defaults_table_applies_when_labels_are_silent() {
        let (proxies, _) = parse_labels(
            &labels(&[("npm.proxy.domains", "a.test")]),
            &ProxyDefaults::default(),
        );
        let cfg = &proxies[&0];
        assert!(cfg.block_exploits);
        assert!(!cfg.ssl_forced);

        let overridden = ProxyDefaults {
            ssl_forced: true,
            ..ProxyDefaults::default()
        };
        let (proxies, _) = parse_labels(&labels(&[("npm.proxy.domains", "a.test")]), &overridden);
        assert!(proxies[&0].ssl_forced);
    }

    #[test]
    fn labels_override_defaults_both_ways() {
        let defaults = ProxyDefaults::default();
        let (proxies, _) = parse_labels(
            &labels(&[
                ("npm.proxy.domains", "a.test"),
                ("npm.proxy.block_common_exploits", "off"),
                ("npm.proxy.ssl.force", "yes"),
            ]),
            &defaults,
        );
        let cfg = &proxies[&0];
        assert!(!cfg.block_exploits);
        assert!(cfg.ssl_forced);
    }

    #[test]
    fn stream_requires_incoming_port() {
        let (_, streams) = parse_labels(
            &labels(&[("npm.stream.forward.port", "5432")]),
            &ProxyDefaults::default(),
        );
        assert!(streams.is_empty());
    }

    #[test]
    fn stream_defaults_tcp_on_udp_off() {
        let (_, streams) = parse_labels(
            &labels(&[("npm.stream.incoming.port", "2222")]),
            &ProxyDefaults::default(),
        );
        let cfg = &streams[&0];
        assert!(cfg.tcp_forwarding);
        assert!(!cfg.udp_forwarding);
    }

    #[test]
    fn stream_with_both_protocols_disabled_is_void() {
        let (_, streams) = parse_labels(
            &labels(&[
                ("npm.stream.incoming.port", "2222"),
                ("npm.stream.forward.tcp", "false"),
                ("npm.stream.forward.udp", "false"),
            ]),
            &ProxyDefaults::default(),
        );
        assert!(streams.is_empty());
    }

    #[test]
    fn stream_full_form() {
        let (_, streams) = parse_labels(
            &labels(&[
                ("npm.stream.5.incoming.port", "5353"),
                ("npm.stream.5.forward.host", "dns"),
                ("npm.stream.5.forward.port", "53"),
                ("npm.stream.5.forward.udp", "true"),
                ("npm.stream.5.ssl", "stream.test"),
            ]),
            &ProxyDefaults::default(),
        );
        let cfg = &streams[&5];
        assert_eq!(cfg.incoming_port, 5353);
        assert_eq!(cfg.forward_host.as_deref(), Some("dns"));
        assert_eq!(cfg.forward_port, Some(53));
        assert!(cfg.udp_forwarding);
        assert_eq!(cfg.ssl_certificate.as_deref(), Some("stream.test"));
    }

    #[test]
    fn parsing_is_deterministic() {
        let map = labels(&[
            ("npm.proxy.1.domains", "b"),
            ("npm.proxy.0.domains", "a"),
            ("npm.stream.incoming.port", "9000"),
            ("npm.proxy.0.caching", "true"),
        ]);
        let first = parse_labels(&map, &ProxyDefaults::default());
        let second = parse_labels(&map, &ProxyDefaults::default());
        assert_eq!(first, second);
    }

    #[test]
    fn foreign_labels_are_ignored() {
        let (proxies, streams) = parse_labels(
            &labels(&[
                ("traefik.enable", "true"),
                ("com.docker.compose.service", "web"),
            ]),
            &ProxyDefaults::default(),
        );
        assert!(proxies.is_empty());
        assert!(streams.is_empty());
    }
}
