use url::Url;

/// Path every shell host serves the terminal WebSocket on.
pub const TERMINAL_PATH: &str = "/terminal";

/// Endpoint used when the app is loaded from a packaged desktop shell (`file:` origin).
pub const DESKTOP_ENDPOINT: &str = "ws://127.0.0.1:3001/terminal";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("invalid origin {origin:?}: {reason}")]
    InvalidOrigin { origin: String, reason: String },
    #[error("unsupported origin scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("origin {0} has no host")]
    MissingHost(String),
}

pub fn parse_origin(raw: &str) -> Result<Url, EndpointError> {
    Url::parse(raw.trim()).map_err(|err| EndpointError::InvalidOrigin {
        origin: raw.to_string(),
        reason: err.to_string(),
    })
}

/// Derives the terminal WebSocket address from the app's own origin.
///
/// `http` maps to `ws` and `https` to `wss`; host and port are kept and the path is
/// replaced by [`TERMINAL_PATH`]. A `file:` origin resolves to [`DESKTOP_ENDPOINT`].
pub fn resolve_endpoint(origin: &Url) -> Result<Url, EndpointError> {
    let scheme = match origin.scheme() {
        "file" => return parse_fixed(DESKTOP_ENDPOINT),
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
    };
    let host = origin
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| EndpointError::MissingHost(origin.to_string()))?;
    let address = match origin.port() {
        Some(port) => format!("{scheme}://{host}:{port}{TERMINAL_PATH}"),
        None => format!("{scheme}://{host}{TERMINAL_PATH}"),
    };
    parse_fixed(&address)
}

fn parse_fixed(address: &str) -> Result<Url, EndpointError> {
    Url::parse(address).map_err(|err| EndpointError::InvalidOrigin {
        origin: address.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(raw: &str) -> Result<String, EndpointError> {
        resolve_endpoint(&parse_origin(raw)?).map(|url| url.to_string())
    }

    #[test_timeout::timeout]
    fn http_origin_becomes_ws_with_port() {
        assert_eq!(
            resolve("http://localhost:3000").as_deref(),
            Ok("ws://localhost:3000/terminal")
        );
    }

    #[test_timeout::timeout]
    fn https_origin_becomes_wss() {
        assert_eq!(
            resolve("https://ide.example.com").as_deref(),
            Ok("wss://ide.example.com/terminal")
        );
        assert_eq!(
            resolve("https://ide.example.com:8443/app/").as_deref(),
            Ok("wss://ide.example.com:8443/terminal")
        );
    }

    #[test_timeout::timeout]
    fn page_path_query_and_fragment_are_dropped() {
        assert_eq!(
            resolve("http://127.0.0.1:5173/panels/terminal?tab=2#top").as_deref(),
            Ok("ws://127.0.0.1:5173/terminal")
        );
    }

    #[test_timeout::timeout]
    fn ipv6_hosts_keep_brackets() {
        assert_eq!(
            resolve("http://[::1]:3000").as_deref(),
            Ok("ws://[::1]:3000/terminal")
        );
    }

    #[test_timeout::timeout]
    fn file_origin_uses_desktop_endpoint() {
        assert_eq!(
            resolve("file:///Applications/IDE.app/index.html").as_deref(),
            Ok(DESKTOP_ENDPOINT)
        );
    }

    #[test_timeout::timeout]
    fn unsupported_schemes_are_rejected() {
        assert_eq!(
            resolve("ftp://files.example.com"),
            Err(EndpointError::UnsupportedScheme("ftp".into()))
        );
        assert!(matches!(
            resolve("not a url"),
            Err(EndpointError::InvalidOrigin { .. })
        ));
    }

    #[test_timeout::timeout]
    fn resolution_is_deterministic() {
        let origin = parse_origin("http://localhost:3000").expect("origin");
        let first = resolve_endpoint(&origin).expect("first");
        let second = resolve_endpoint(&origin).expect("second");
        assert_eq!(first, second);
    }
}
