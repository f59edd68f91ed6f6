//! URL canonicalization.
//!
//! Every URL stored anywhere in the graph passes through [`normalize`]; the
//! output is the identity key for sites and the domain key for candidates.

use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("invalid url `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },
}

fn invalid(input: &str, reason: impl Into<String>) -> NormalizeError {
    NormalizeError::InvalidUrl {
        input: input.to_string(),
        reason: reason.into(),
    }
}

/// Canonicalize an absolute URL (or a bare `host/path`, read as https).
pub fn normalize(raw: &str) -> Result<String, NormalizeError> {
    normalize_with_base(raw, None)
}

/// Canonicalize `raw`, resolving it against `base` when it is relative.
///
/// Rules: http/https only; host lower-cased with a leading `www.` removed;
/// default ports dropped; credentials and fragment dropped; query kept; the
/// root path renders as `/` and every other path loses trailing slashes.
pub fn normalize_with_base(raw: &str, base: Option<&str>) -> Result<String, NormalizeError> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(invalid(raw, "empty"));
    }

    let parsed = match base {
        Some(base) => {
            let base_url = parse_absolute(base.trim())?;
            base_url
                .join(input)
                .map_err(|e| invalid(raw, e.to_string()))?
        }
        None => parse_absolute(input)?,
    };

    canonicalize(parsed, raw).map(|url| url.to_string())
}

/// Canonical domain of a URL: lower-case host without `www.` and without port.
pub fn domain_of(url: &str) -> Result<String, NormalizeError> {
    let parsed = canonicalize(parse_absolute(url.trim())?, url)?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(url, "missing host"))
}

/// Origin of a URL with a root path, e.g. `https://a.com/blog` -> `https://a.com/`.
pub fn homepage_of(url: &str) -> Result<String, NormalizeError> {
    let parsed = canonicalize(parse_absolute(url.trim())?, url)?;
    Ok(format!("{}/", parsed.origin().ascii_serialization()))
}

fn parse_absolute(input: &str) -> Result<Url, NormalizeError> {
    let owned;
    let candidate = if has_scheme(input) {
        input
    } else {
        owned = format!("https://{}", input.trim_start_matches('/'));
        owned.as_str()
    };
    Url::parse(candidate).map_err(|e| invalid(input, e.to_string()))
}

// `a.com:8080/x` must not read as scheme `a.com`.
fn has_scheme(input: &str) -> bool {
    let Some((scheme, _)) = input.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
}

fn canonicalize(mut url: Url, raw: &str) -> Result<Url, NormalizeError> {
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(raw, format!("unsupported scheme `{other}`"))),
    }

    let host = url
        .host_str()
        .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
        .unwrap_or_default();
    // Stacked prefixes (`www.www.a.com`) collapse in one pass so the result is a fixed point.
    let mut bare = host.as_str();
    while let Some(rest) = bare.strip_prefix("www.") {
        bare = rest;
    }
    let host = bare.to_string();
    if host.is_empty() {
        return Err(invalid(raw, "missing host"));
    }
    url.set_host(Some(&host))
        .map_err(|e| invalid(raw, e.to_string()))?;

    // Both setters only fail for cannot-be-a-base URLs, excluded by the scheme check.
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }

    let trimmed = url.path().trim_end_matches('/').to_string();
    if trimmed.is_empty() {
        url.set_path("/");
    } else {
        url.set_path(&trimmed);
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_with_and_without_trailing_slash_collapse() {
        assert_eq!(normalize("http://a.com/").unwrap(), "http://a.com/");
        assert_eq!(normalize("http://a.com").unwrap(), "http://a.com/");
    }

    #[test]
    fn host_case_www_and_default_port_are_canonicalized() {
        assert_eq!(
            normalize("HTTP://WWW.Example.COM:80/Blog/").unwrap(),
            "http://example.com/Blog"
        );
        assert_eq!(normalize("https://a.com:443").unwrap(), "https://a.com/");
        assert_eq!(
            normalize("https://a.com:8443/x/").unwrap(),
            "https://a.com:8443/x"
        );
    }

    #[test]
    fn fragment_dropped_query_kept() {
        assert_eq!(
            normalize("https://a.com/post/?id=3#comments").unwrap(),
            "https://a.com/post?id=3"
        );
        assert_eq!(normalize("https://a.com/?").unwrap(), "https://a.com/");
    }

    #[test]
    fn bare_hosts_are_read_as_https() {
        assert_eq!(normalize("a.com/blog/").unwrap(), "https://a.com/blog");
        assert_eq!(normalize("a.com:8080").unwrap(), "https://a.com:8080/");
        assert_eq!(normalize("//cdn.a.com/x").unwrap(), "https://cdn.a.com/x");
    }

    #[test]
    fn relative_urls_resolve_against_base() {
        assert_eq!(
            normalize_with_base("../friends/", Some("https://a.com/blog/post")).unwrap(),
            "https://a.com/friends"
        );
        assert_eq!(
            normalize_with_base("//b.com", Some("http://a.com/")).unwrap(),
            "http://b.com/"
        );
        assert_eq!(
            normalize_with_base("https://c.com/", Some("http://a.com/")).unwrap(),
            "https://c.com/"
        );
    }

    #[test]
    fn unusable_input_is_invalid() {
        for raw in ["", "   ", "http://", "javascript:void(0)", "mailto:me@a.com", "ftp://a.com/"] {
            assert!(
                matches!(normalize(raw), Err(NormalizeError::InvalidUrl { .. })),
                "{raw:?} should be rejected"
            );
        }
        assert!(normalize_with_base("mailto:me@a.com", Some("https://a.com/")).is_err());
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in [
            "http://a.com",
            "HTTPS://www.B.com:443/x//",
            "c.com/path/?q=1#f",
            "http://d.com:8080/a/b/",
            "https://例子.中国/",
        ] {
            let once = normalize(raw).unwrap();
            assert_eq!(normalize(&once).unwrap(), once, "{raw}");
        }
    }

    #[test]
    fn stacked_www_prefixes_collapse_in_one_pass() {
        for raw in ["http://www.www.a.com/", "http://WWW.www.A.com"] {
            let once = normalize(raw).unwrap();
            assert_eq!(once, "http://a.com/", "{raw}");
            assert_eq!(normalize(&once).unwrap(), once);
            assert_eq!(domain_of(raw).unwrap(), "a.com");
        }
    }

    #[test]
    fn domain_and_homepage_derivation() {
        assert_eq!(domain_of("https://www.B.com:8443/x").unwrap(), "b.com");
        assert_eq!(homepage_of("https://b.com/posts/1?x=2").unwrap(), "https://b.com/");
        assert_eq!(homepage_of("http://b.com:8080/a").unwrap(), "http://b.com:8080/");
    }
}
