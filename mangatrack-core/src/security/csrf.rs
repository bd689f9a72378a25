//! CSRF origin validation for mutating requests.

use url::Url;

/// Everything the check needs, extracted from the request by the HTTP
/// layer.
#[derive(Clone, Debug, Default)]
pub struct OriginContext<'a> {
    pub method: &'a str,
    pub origin: Option<&'a str>,
    pub referer: Option<&'a str>,
    pub host: Option<&'a str>,
    pub forwarded_host: Option<&'a str>,
}

#[derive(Clone, Debug)]
pub struct CsrfPolicy {
    pub canonical_host: Option<String>,
    pub allowed_origins: Vec<String>,
    /// Development bypass.
    pub enforce: bool,
}

impl CsrfPolicy {
    pub fn new(canonical_url: &Url, allowed_origins: Vec<String>, enforce: bool) -> Self {
        Self {
            canonical_host: canonical_url.host_str().map(str::to_owned),
            allowed_origins,
            enforce,
        }
    }
}

fn is_mutating(method: &str) -> bool {
    !matches!(method, "GET" | "HEAD" | "OPTIONS")
}

fn host_of(raw: &str) -> Option<String> {
    Url::parse(raw)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
}

/// Strip a port from a Host-style header value.
fn header_host(raw: &str) -> String {
    match raw.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => raw.to_string(),
    }
}

/// Validate a request's origin. Mutating requests must present an Origin
/// (or, absent that, a Referer) whose host matches the request Host, the
/// forwarded host, the canonical host, or the allow-list. GET never
/// requires an Origin.
pub fn validate_origin(context: &OriginContext<'_>, policy: &CsrfPolicy) -> Result<(), String> {
    if !policy.enforce || !is_mutating(context.method) {
        return Ok(());
    }

    let claimed = context
        .origin
        .and_then(host_of)
        .or_else(|| context.referer.and_then(host_of));
    let Some(claimed) = claimed else {
        return Err("missing origin on mutating request".to_string());
    };

    let mut acceptable: Vec<String> = Vec::new();
    if let Some(host) = context.host {
        acceptable.push(header_host(host));
    }
    if let Some(host) = context.forwarded_host {
        acceptable.push(header_host(host));
    }
    if let Some(host) = &policy.canonical_host {
        acceptable.push(host.clone());
    }
    for origin in &policy.allowed_origins {
        // Allow-list entries may be bare hosts or full origins.
        acceptable.push(host_of(origin).unwrap_or_else(|| header_host(origin)));
    }

    if acceptable.iter().any(|host| host == &claimed) {
        Ok(())
    } else {
        Err(format!("origin host {claimed} not allowed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CsrfPolicy {
        CsrfPolicy::new(
            &Url::parse("https://mangatrack.example").unwrap(),
            vec!["https://beta.mangatrack.example".to_string()],
            true,
        )
    }

    fn post<'a>(origin: Option<&'a str>, referer: Option<&'a str>) -> OriginContext<'a> {
        OriginContext {
            method: "POST",
            origin,
            referer,
            host: Some("mangatrack.example"),
            forwarded_host: None,
        }
    }

    #[test]
    fn get_requests_never_require_origin() {
        let context = OriginContext {
            method: "GET",
            ..OriginContext::default()
        };
        assert!(validate_origin(&context, &policy()).is_ok());
    }

    #[test]
    fn matching_origin_passes() {
        assert!(validate_origin(&post(Some("https://mangatrack.example"), None), &policy()).is_ok());
    }

    #[test]
    fn referer_is_the_fallback_when_origin_absent() {
        assert!(validate_origin(
            &post(None, Some("https://mangatrack.example/library")),
            &policy()
        )
        .is_ok());
        assert!(validate_origin(
            &post(None, Some("https://evil.example/library")),
            &policy()
        )
        .is_err());
    }

    #[test]
    fn allow_listed_origin_passes() {
        assert!(validate_origin(
            &post(Some("https://beta.mangatrack.example"), None),
            &policy()
        )
        .is_ok());
    }

    #[test]
    fn forwarded_host_counts() {
        let context = OriginContext {
            method: "POST",
            origin: Some("https://edge.mangatrack.example"),
            referer: None,
            host: Some("internal:8080"),
            forwarded_host: Some("edge.mangatrack.example:443"),
        };
        assert!(validate_origin(&context, &policy()).is_ok());
    }

    #[test]
    fn mismatch_and_missing_origin_fail() {
        assert!(validate_origin(&post(Some("https://evil.example"), None), &policy()).is_err());
        assert!(validate_origin(&post(None, None), &policy()).is_err());
    }

    #[test]
    fn development_mode_bypasses() {
        let mut relaxed = policy();
        relaxed.enforce = false;
        assert!(validate_origin(&post(Some("https://evil.example"), None), &relaxed).is_ok());
    }
}
