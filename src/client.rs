use std::net::SocketAddr;

/// Derives the client identity for a request. A forwarded-for header wins
/// over the peer address; its first entry names the originating client, with
/// any IPv6-mapped-IPv4 prefix stripped. With neither source the identity is
/// empty, which callers treat as "no such client" rather than an error.
pub fn resolve(forwarded_for: Option<&str>, peer: Option<SocketAddr>) -> String {
    if let Some(raw) = forwarded_for {
        let first = raw.split(',').next().unwrap_or("").trim();
        let first = first.strip_prefix("::ffff:").unwrap_or(first);
        return first.to_string();
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => String::new(),
    }
}
