//! Client key derivation for HTTP callers

use std::net::SocketAddr;

/// Derive the rate-limit key for a request.
///
/// Uses the first address of a forwarded-for header when present, otherwise the
/// connection's remote address with any port stripped.
pub fn client_key(forwarded_for: Option<&str>, remote_addr: &str) -> String {
    if let Some(first) = forwarded_for
        .and_then(|header| header.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return first.to_string();
    }

    strip_port(remote_addr.trim())
}

fn strip_port(addr: &str) -> String {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return sock.ip().to_string();
    }
    // "[::1]" without a port
    if let Some(inner) = addr.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        return inner.to_string();
    }
    // "host:port"; more than one colon is a bare IPv6 address
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            host.to_string()
        }
        _ => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_for_wins() {
        assert_eq!(
            client_key(Some("203.0.113.7, 10.0.0.1"), "10.0.0.1:5555"),
            "203.0.113.7"
        );
    }

    #[test]
    fn test_empty_forwarded_for_falls_back() {
        assert_eq!(client_key(Some("  "), "198.51.100.2:443"), "198.51.100.2");
    }

    #[test]
    fn test_remote_addr_port_stripped() {
        assert_eq!(client_key(None, "192.0.2.1:8080"), "192.0.2.1");
        assert_eq!(client_key(None, "[2001:db8::1]:8080"), "2001:db8::1");
        assert_eq!(client_key(None, "[::1]"), "::1");
        assert_eq!(client_key(None, "2001:db8::1"), "2001:db8::1");
        assert_eq!(client_key(None, "localhost:3000"), "localhost");
        assert_eq!(client_key(None, "192.0.2.1"), "192.0.2.1");
    }
}
