//! WebSocket handshake authorization.

use tokio_tungstenite::tungstenite::handshake::server::Request;

/// Check the upgrade request against the configured token. An empty token
/// means authentication is disabled.
///
/// Browsers cannot set headers on WebSocket connections, so the token is also
/// accepted as a `token` query parameter.
pub fn authorized(req: &Request, token: &str) -> bool {
    if token.is_empty() {
        return true;
    }

    if let Some(auth) = req.headers().get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(bearer) = auth.strip_prefix("Bearer ") {
            if bearer == token {
                return true;
            }
        }
    }

    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                if value == token {
                    return true;
                }
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, auth_header: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(h) = auth_header {
            builder = builder.header("authorization", h);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_empty_token_allows_all() {
        assert!(authorized(&request("/ws", None), ""));
    }

    #[test]
    fn test_bearer_header() {
        assert!(authorized(&request("/ws", Some("Bearer s3cret")), "s3cret"));
        assert!(!authorized(&request("/ws", Some("Bearer wrong")), "s3cret"));
        assert!(!authorized(&request("/ws", Some("s3cret")), "s3cret"));
    }

    #[test]
    fn test_query_token() {
        assert!(authorized(&request("/ws?token=s3cret", None), "s3cret"));
        assert!(authorized(&request("/ws?foo=bar&token=s3cret", None), "s3cret"));
        assert!(!authorized(&request("/ws?token=wrong", None), "s3cret"));
        assert!(!authorized(&request("/ws", None), "s3cret"));
    }
}
