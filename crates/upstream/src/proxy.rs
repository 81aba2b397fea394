use url::Url;

use crate::error::UpstreamError;

/// Key used for direct (proxyless) connections in fallback windows and
/// proxy-isolated pool keys.
pub const DIRECT_KEY: &str = "direct";

/// Normalize a proxy URL to a canonical `scheme://host:port` key.
///
/// Credentials and paths are dropped from the key (two operator spellings
/// of the same proxy must collapse to one window). Unsupported schemes are
/// an error; the caller decides whether bypass is allowed.
pub fn normalize_proxy_key(raw: &str) -> Result<String, UpstreamError> {
    let url = Url::parse(raw).map_err(|_| UpstreamError::ProxyParse {
        url: raw.to_string(),
    })?;

    let scheme = url.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        other => {
            return Err(UpstreamError::ProxyScheme {
                scheme: other.to_string(),
            });
        },
    };

    let host = url.host_str().ok_or_else(|| UpstreamError::ProxyParse {
        url: raw.to_string(),
    })?;
    let port = url.port().unwrap_or(default_port);

    Ok(format!("{scheme}://{host}:{port}"))
}

/// Build the reqwest proxy for a raw proxy URL.
pub fn build_proxy(raw: &str) -> Result<reqwest::Proxy, UpstreamError> {
    // Validate the scheme first so reqwest never sees a URL we would not key.
    normalize_proxy_key(raw)?;
    reqwest::Proxy::all(raw).map_err(|_| UpstreamError::ProxyParse {
        url: raw.to_string(),
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_are_filled_in() {
        assert_eq!(
            normalize_proxy_key("http://proxy.example").unwrap(),
            "http://proxy.example:80"
        );
        assert_eq!(
            normalize_proxy_key("https://proxy.example").unwrap(),
            "https://proxy.example:443"
        );
    }

    #[test]
    fn explicit_port_is_kept() {
        assert_eq!(
            normalize_proxy_key("http://proxy.example:3128").unwrap(),
            "http://proxy.example:3128"
        );
    }

    #[test]
    fn credentials_and_paths_do_not_change_the_key() {
        assert_eq!(
            normalize_proxy_key("http://user:pw@proxy.example:3128/ignored").unwrap(),
            "http://proxy.example:3128"
        );
    }

    #[test]
    fn unsupported_scheme_is_an_error() {
        assert!(matches!(
            normalize_proxy_key("socks5://proxy.example:1080"),
            Err(UpstreamError::ProxyScheme { .. })
        ));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            normalize_proxy_key("not a url"),
            Err(UpstreamError::ProxyParse { .. })
        ));
    }
}
