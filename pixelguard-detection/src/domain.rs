//! Host and base-domain extraction from URLs and rule fragments.
//!
//! Nothing here allocates more than the returned string, and malformed input
//! yields `None` instead of an error.

/// Extracts the lowercase host of `url`.
///
/// Accepts full URLs (`https://host/path`), scheme-relative URLs (`//host/x`)
/// and bare hosts (`host/path`). Userinfo and port are stripped.
pub fn host(url: &str) -> Option<String> {
    let mut rest = url.trim();
    if let Some(idx) = rest.find("://") {
        rest = &rest[idx + 3..];
    } else if let Some(stripped) = rest.strip_prefix("//") {
        rest = stripped;
    }

    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let mut authority = &rest[..end];
    if let Some(at) = authority.rfind('@') {
        authority = &authority[at + 1..];
    }
    if let Some(colon) = authority.find(':') {
        authority = &authority[..colon];
    }
    let authority = authority.trim_end_matches('.');

    if is_valid_host(authority) {
        Some(authority.to_ascii_lowercase())
    } else {
        None
    }
}

/// The index key for `url`: its host without a leading `www.`.
pub fn base_domain(url: &str) -> Option<String> {
    let host = host(url)?;
    match host.strip_prefix("www.") {
        Some(rest) if is_valid_host(rest) => Some(rest.to_string()),
        _ => Some(host),
    }
}

/// Parent domains of `domain`, nearest first, stopping before the last label.
///
/// `a.b.example.com` yields `b.example.com`, `example.com`.
pub fn parents(domain: &str) -> impl Iterator<Item = &str> {
    let mut rest = domain;
    std::iter::from_fn(move || {
        let dot = rest.find('.')?;
        let parent = &rest[dot + 1..];
        if parent.contains('.') {
            rest = parent;
            Some(parent)
        } else {
            None
        }
    })
}

pub(crate) fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && !host.starts_with(['.', '-'])
        && !host.ends_with('-')
        && !host.contains("..")
        && host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scheme_www_and_path() {
        assert_eq!(
            base_domain("https://www.Tracker.example.com/p.gif?id=1").as_deref(),
            Some("tracker.example.com")
        );
        assert_eq!(base_domain("//cdn.example.org/x").as_deref(), Some("cdn.example.org"));
        assert_eq!(base_domain("example.net").as_deref(), Some("example.net"));
    }

    #[test]
    fn strips_userinfo_and_port() {
        assert_eq!(
            host("http://user:pw@mail.example.com:8080/inbox").as_deref(),
            Some("mail.example.com")
        );
    }

    #[test]
    fn malformed_urls_yield_none() {
        assert_eq!(base_domain(""), None);
        assert_eq!(base_domain("https:///nohost"), None);
        assert_eq!(base_domain("not a url"), None);
        assert_eq!(base_domain("http://exa mple.com/"), None);
    }

    #[test]
    fn bare_www_is_kept() {
        assert_eq!(base_domain("http://www/").as_deref(), Some("www"));
    }

    #[test]
    fn parents_stop_before_tld() {
        let parents: Vec<&str> = parents("a.b.example.com").collect();
        assert_eq!(parents, vec!["b.example.com", "example.com"]);
        assert_eq!(super::parents("example.com").count(), 0);
    }
}
