//! Backend origins: the unit of tunnel and credential scoping.

use std::fmt;

use reqwest::Url;

/// Normalized `scheme://host[:port]` of a backend endpoint.
///
/// Default ports are omitted and the host is lower-cased, so
/// `HTTPS://Example.com:443/api` and `https://example.com/` share an origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin(String);

impl Origin {
    /// Derive the origin of `url`. Returns `None` for unparsable URLs and for
    /// URLs with an opaque origin (`data:`, `file:` and friends).
    pub fn parse(url: &str) -> Option<Self> {
        Url::parse(url).ok().and_then(|u| Self::from_url(&u))
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        let origin = url.origin();
        origin
            .is_tuple()
            .then(|| Self(origin.ascii_serialization()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether `url` points at a loopback literal host (`localhost`, `127.0.0.1`
/// or `::1`). Unparsable URLs are not local.
pub fn is_loopback_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .as_ref()
        .and_then(Url::host_str)
        .is_some_and(|host| matches!(host, "localhost" | "127.0.0.1" | "[::1]"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_drops_path_and_default_port() {
        let a = Origin::parse("https://Example.com:443/api/v1?x=1").unwrap();
        let b = Origin::parse("https://example.com/").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://example.com");
    }

    #[test]
    fn test_origin_keeps_explicit_port() {
        let o = Origin::parse("http://127.0.0.1:4096/session").unwrap();
        assert_eq!(o.as_str(), "http://127.0.0.1:4096");
    }

    #[test]
    fn test_origin_rejects_garbage_and_opaque() {
        assert!(Origin::parse("not a url").is_none());
        assert!(Origin::parse("/relative/path").is_none());
        assert!(Origin::parse("data:text/plain,hi").is_none());
    }

    #[test]
    fn test_loopback_hosts() {
        assert!(is_loopback_url("http://localhost:4096"));
        assert!(is_loopback_url("http://127.0.0.1/"));
        assert!(is_loopback_url("http://[::1]:8080/"));
        assert!(!is_loopback_url("http://127.0.0.2/"));
        assert!(!is_loopback_url("https://h/"));
        assert!(!is_loopback_url("::garbage::"));
    }
}
