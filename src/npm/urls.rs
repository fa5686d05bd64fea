use anyhow::{Context, Result};
use url::Url;

/// Canonical form for an NPM base URL: lowercase scheme and host, default
/// port elided, trailing slash trimmed, query and fragment dropped.
///
/// The canonical form is what gets written into `meta.npm_url`, so two
/// processes pointed at the same instance agree on ownership even when their
/// configured URLs differ in casing or a redundant `:443`.
pub fn normalize_url(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw.trim()).with_context(|| format!("invalid URL: {raw}"))?;

    let host = parsed
        .host_str()
        .with_context(|| format!("URL has no host: {raw}"))?;

    let mut out = format!("{}://{}", parsed.scheme(), host);
    // `Url::port` is None when the port equals the scheme default.
    if let Some(port) = parsed.port() {
        out.push_str(&format!(":{port}"));
    }

    let path = parsed.path().trim_end_matches('/');
    out.push_str(path);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_scheme_and_host() {
        assert_eq!(
            normalize_url("HTTP://NPM.Example.COM").unwrap(),
            "http://npm.example.com"
        );
    }

    #[test]
    fn elides_default_ports() {
        assert_eq!(
            normalize_url("http://npm.local:80").unwrap(),
            "http://npm.local"
        );
        assert_eq!(
            normalize_url("https://npm.local:443/").unwrap(),
            "https://npm.local"
        );
    }

    #[test]
    fn keeps_explicit_ports() {
        assert_eq!(
            normalize_url("http://npm.local:81").unwrap(),
            "http://npm.local:81"
        );
    }

    #[test]
    fn trims_trailing_slash_but_keeps_path() {
        assert_eq!(
            normalize_url("https://npm.local/base/").unwrap(),
            "https://npm.local/base"
        );
        assert_eq!(normalize_url("https://npm.local/").unwrap(), "https://npm.local");
    }

    #[test]
    fn rejects_garbage() {
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_url("HTTPS://Npm.Local:443/api/").unwrap();
        assert_eq!(normalize_url(&once).unwrap(), once);
    }
}
