//! Open-redirect guard: anything that is not provably ours collapses to the
//! safe default.

use url::Url;

const SAFE_DEFAULT: &str = "/";

/// Resolve a user-supplied redirect target to something safe to send in a
/// Location header: path-absolute same-origin targets, canonical-URL
/// targets, and allow-listed hosts pass; everything else becomes `/`.
pub fn safe_redirect_target(input: &str, canonical: &Url, allowed_hosts: &[String]) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return SAFE_DEFAULT.to_string();
    }

    // Path-absolute, but not protocol-relative ("//evil.example") and not
    // a backslash scheme smuggle.
    if trimmed.starts_with('/') {
        if trimmed.starts_with("//") || trimmed.contains('\\') {
            return SAFE_DEFAULT.to_string();
        }
        return trimmed.to_string();
    }

    let Ok(url) = Url::parse(trimmed) else {
        return SAFE_DEFAULT.to_string();
    };
    if !matches!(url.scheme(), "http" | "https") {
        return SAFE_DEFAULT.to_string();
    }
    let Some(host) = url.host_str() else {
        return SAFE_DEFAULT.to_string();
    };

    let canonical_host = canonical.host_str().unwrap_or_default();
    if host == canonical_host || allowed_hosts.iter().any(|allowed| allowed == host) {
        return url.to_string();
    }
    SAFE_DEFAULT.to_string()
}
