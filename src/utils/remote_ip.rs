//! Client IP extraction shared by IP-hash balancing, sticky sessions and
//! rate limiting: first valid hop of `X-Forwarded-For`, then `X-Real-IP`,
//! then the peer address.

use std::net::{IpAddr, SocketAddr};

use http::HeaderMap;

/// Best candidate client IP for the request, or `None` when nothing parses.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    if let Some(forwarded_for) = headers.get("x-forwarded-for")
        && let Ok(value) = forwarded_for.to_str()
    {
        // First hop in the chain is the original client.
        for candidate in value.split(',') {
            if let Ok(ip) = candidate.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && let Ok(ip) = value.trim().parse::<IpAddr>()
    {
        return Some(ip);
    }

    peer.map(|addr| addr.ip())
}
