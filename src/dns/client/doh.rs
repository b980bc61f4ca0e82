//! DoH client
//!
//! HTTPS POST of `application/dns-message` bytes (RFC 8484), using a
//! bootstrap Do53 resolver to look up the provider's hostname so the lookup
//! never recurses through DoH itself (`spec.md` §4.3, §9). Grounded on
//! `dns/proxy/client.rs`'s per-query-socket style, translated from curl's
//! multiplexed transfer loop to one `reqwest::Client` built per attempt
//! (async tasks already multiplex on the executor).

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use reqwest::Client;

use super::do53::{self, Transport};
use super::{DohOutcome, DohTransportError};
use crate::dns::message;

const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Resolve `query` against the DoH provider at `url`. `bootstrap` lists
/// plain-text resolver IPs used to look up `url`'s hostname; an empty list
/// falls back to the system resolver.
pub async fn resolve(
    query: &[u8],
    url: &str,
    bootstrap: &[String],
    attempt_timeout: Duration,
) -> DohOutcome {
    let parsed = match reqwest::Url::parse(url) {
        Ok(u) => u,
        Err(_) => return DohOutcome::Transport(DohTransportError::BadHost),
    };
    if parsed.scheme() != "https" {
        return DohOutcome::Transport(DohTransportError::UnsupportedProtocol);
    }
    let Some(host) = parsed.host_str() else {
        return DohOutcome::Transport(DohTransportError::BadHost);
    };
    let port = parsed.port_or_known_default().unwrap_or(443);

    let mut builder = Client::builder().timeout(attempt_timeout);

    if let Ok(ip) = host.parse::<IpAddr>() {
        builder = builder.resolve(host, SocketAddr::new(ip, port));
    } else if !bootstrap.is_empty() {
        match bootstrap_lookup(host, bootstrap, attempt_timeout).await {
            Some(ip) => {
                builder = builder.resolve(host, SocketAddr::new(ip, port));
            }
            None => return DohOutcome::Transport(DohTransportError::BadHost),
        }
    }

    let client = match builder.build() {
        Ok(c) => c,
        Err(_) => return DohOutcome::Transport(DohTransportError::ConnectionFailed),
    };

    let response = client
        .post(parsed)
        .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
        .header(reqwest::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
        .body(query.to_vec())
        .send()
        .await;

    match response {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            DohOutcome::Http { status, body }
        }
        Err(err) => DohOutcome::Transport(classify_reqwest_err(&err)),
    }
}

/// Resolve `host`'s A record against the first reachable bootstrap IP.
async fn bootstrap_lookup(host: &str, bootstrap: &[String], attempt_timeout: Duration) -> Option<IpAddr> {
    let query = build_a_query(host);
    for candidate in bootstrap {
        let Ok(addr) = candidate.parse::<IpAddr>() else {
            continue;
        };
        let server = SocketAddr::new(addr, 53);
        let outcome = do53::resolve(&query, server, Transport::Udp, attempt_timeout).await;
        if let Some(resp) = outcome.response {
            if let Some(ip) = message::extract_first_a_record(&resp) {
                return Some(IpAddr::V4(ip));
            }
        }
    }
    None
}

fn build_a_query(host: &str) -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&0u16.to_be_bytes()); // id
    msg.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    for label in host.split('.') {
        msg.push(label.len() as u8);
        msg.extend_from_slice(label.as_bytes());
    }
    msg.push(0);
    msg.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    msg.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    msg
}

fn classify_reqwest_err(err: &reqwest::Error) -> DohTransportError {
    if err.is_timeout() {
        DohTransportError::Timeout
    } else if err.is_redirect() {
        DohTransportError::TooManyRedirects
    } else if err.is_connect() {
        DohTransportError::ConnectionFailed
    } else if err.is_request() {
        DohTransportError::SendError
    } else if err.is_body() || err.is_decode() {
        DohTransportError::ReceiveError
    } else {
        DohTransportError::ConnectionFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_a_query_encodes_labels() {
        let q = build_a_query("dns.example");
        assert_eq!(message::extract_qname(&q), Some("dns.example".to_string()));
    }

    #[tokio::test]
    async fn rejects_non_https_scheme() {
        let outcome = resolve(&[0u8; 12], "http://dns.example/dns-query", &[], Duration::from_millis(50)).await;
        assert!(matches!(
            outcome,
            DohOutcome::Transport(DohTransportError::UnsupportedProtocol)
        ));
    }

    #[tokio::test]
    async fn rejects_unparseable_url() {
        let outcome = resolve(&[0u8; 12], "not a url", &[], Duration::from_millis(50)).await;
        assert!(matches!(outcome, DohOutcome::Transport(DohTransportError::BadHost)));
    }
}
