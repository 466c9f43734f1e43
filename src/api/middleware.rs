//! Per-request denylist enforcement and request logging.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::{debug, error, warn};

use super::state::AppState;
use crate::storage;

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_addr(value: &str) -> Option<IpAddr> {
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|sa| sa.ip()))
        .map(|ip| ip.to_canonical())
}

/// Originating client address: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then `X-Client-IP`, then the socket peer.
///
/// Header values that do not parse as an address are skipped. The result is
/// always the canonical text form, so `2001:DB8::1` and
/// `2001:db8:0:0:0:0:0:1` both come out as `2001:db8::1`.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    let forwarded = header_value(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .and_then(parse_addr);

    forwarded
        .or_else(|| header_value(headers, "x-real-ip").and_then(parse_addr))
        .or_else(|| header_value(headers, "x-client-ip").and_then(parse_addr))
        .or_else(|| peer.map(|ip| ip.to_canonical()))
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string())
}

/// Reject denylisted clients with 403, log everyone else.
///
/// Storage and geolocation failures are logged and the request proceeds.
pub async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    let address = client_ip(req.headers(), peer);
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let denylist = state.denylist.clone();
    let lookup = address.clone();
    match tokio::task::spawn_blocking(move || denylist.is_blocked(&lookup)).await {
        Ok(Ok(true)) => {
            debug!(%address, %path, "rejected denylisted address");
            return (StatusCode::FORBIDDEN, "Access denied").into_response();
        }
        Ok(Ok(false)) => {}
        Ok(Err(e)) => warn!(%address, "denylist lookup failed: {:#}", e),
        Err(e) => warn!(%address, "denylist lookup panicked: {}", e),
    }

    let location = state.geo.locate(&address).await;
    let pool = state.pool.clone();
    let now = Utc::now();
    let logged = tokio::task::spawn_blocking(move || {
        storage::record_request(&pool, &address, &path, now, &location)
    })
    .await;
    match logged {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("failed to log request: {:#}", e),
        Err(e) => error!("request logger panicked: {}", e),
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    fn headers_owned(name: &'static str, value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(name, HeaderValue::from_str(value).unwrap());
        map
    }

    #[test]
    fn test_forwarded_for_first_hop_wins() {
        let h = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_ip(&h, None), "203.0.113.7");
    }

    #[test]
    fn test_header_precedence() {
        let h = headers(&[("x-client-ip", "198.51.100.3"), ("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_ip(&h, None), "198.51.100.2");

        let h = headers(&[("x-client-ip", "198.51.100.3")]);
        assert_eq!(client_ip(&h, None), "198.51.100.3");
    }

    #[test]
    fn test_peer_then_unspecified() {
        let peer: IpAddr = "192.0.2.44".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "192.0.2.44");
        assert_eq!(client_ip(&HeaderMap::new(), None), "0.0.0.0");
    }

    #[test]
    fn test_empty_forwarded_falls_through() {
        let h = headers(&[("x-forwarded-for", " , 10.0.0.1"), ("x-real-ip", "198.51.100.2")]);
        assert_eq!(client_ip(&h, None), "198.51.100.2");
    }

    #[test]
    fn test_ipv6_spellings_are_canonicalized() {
        for spelling in ["2001:DB8::1", "2001:db8:0:0:0:0:0:1", "2001:0db8:0000::0001"] {
            let h = headers_owned("x-forwarded-for", spelling);
            assert_eq!(client_ip(&h, None), "2001:db8::1", "{}", spelling);
        }

        let h = headers_owned("x-real-ip", "::FFFF:192.0.2.5");
        assert_eq!(client_ip(&h, None), "192.0.2.5");

        let peer: IpAddr = "2001:DB8:0:0::2".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "2001:db8::2");
    }

    #[test]
    fn test_garbage_header_values_skipped() {
        let h = headers(&[
            ("x-forwarded-for", "<script>alert(1)</script>, 10.0.0.1"),
            ("x-real-ip", "unknown"),
            ("x-client-ip", "198.51.100.3:4431"),
        ]);
        assert_eq!(client_ip(&h, None), "198.51.100.3");

        let h = headers(&[("x-forwarded-for", "not-an-address")]);
        let peer: IpAddr = "192.0.2.44".parse().unwrap();
        assert_eq!(client_ip(&h, Some(peer)), "192.0.2.44");
    }
}
