use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Query parameters that only carry campaign/referral tracking and never
/// identify a post.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "igshid", "_hsenc", "ref"];

/// Errors that can occur during URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    #[error("Localhost not allowed")]
    Localhost,
}

/// Validates a URL that came from configuration or from a third-party page.
///
/// Blog URLs and cross-host feed links discovered inside fetched HTML are
/// both fed through here before anything is requested from them, so a
/// hostile page cannot point the monitor at `localhost` or an RFC 1918 host.
///
/// # Errors
///
/// - [`UrlValidationError::InvalidUrl`] if the string does not parse
/// - [`UrlValidationError::UnsupportedScheme`] for anything but http/https
/// - [`UrlValidationError::Localhost`] / [`UrlValidationError::PrivateIp`] for internal hosts
///
/// # Examples
///
/// ```
/// use blogwatch::util::validate_url;
///
/// assert!(validate_url("https://blog.example.com/").is_ok());
/// assert!(validate_url("http://localhost/feed").is_err());
/// assert!(validate_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(UrlValidationError::UnsupportedScheme(url.scheme().to_owned()));
    }

    let Some(host) = url.host_str() else {
        return Ok(url);
    };
    if host.eq_ignore_ascii_case("localhost") {
        return Err(UrlValidationError::Localhost);
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err(UrlValidationError::Localhost);
        }
        if is_internal_ip(&ip) {
            return Err(UrlValidationError::PrivateIp(ip.to_string()));
        }
    }

    Ok(url)
}

fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Canonical form of a post URL used for identity comparison.
///
/// Scheme and host are lower-cased, the fragment and tracking parameters
/// (`utm_*`, `fbclid`, ...) are dropped, default ports are elided and
/// trailing slashes on the path are stripped. Unparseable input is returned
/// trimmed so that comparison still works on the raw text.
///
/// # Examples
///
/// ```
/// use blogwatch::util::normalize_url;
///
/// assert_eq!(
///     normalize_url("HTTPS://Example.COM/posts/1/?utm_source=rss#comments"),
///     "https://example.com/posts/1"
/// );
/// ```
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    let Some(host) = url.host_str().map(str::to_owned) else {
        return url.to_string();
    };

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let mut out = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    out.push_str(url.path().trim_end_matches('/'));
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Resolves an `href` found in a document against the document's base URL.
///
/// Returns `None` for non-navigational links (`javascript:`, `mailto:`,
/// bare fragments) and for anything that does not resolve to http(s).
pub fn resolve_url(href: &str, base: &Url) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let resolved = base.join(href).ok()?;
    matches!(resolved.scheme(), "http" | "https").then_some(resolved)
}

/// Whether two URLs point at the same site, treating `www.` as insignificant.
pub fn is_same_host(a: &Url, b: &Url) -> bool {
    let strip = |u: &Url| {
        u.host_str()
            .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
    };
    strip(a).is_some() && strip(a) == strip(b)
}
