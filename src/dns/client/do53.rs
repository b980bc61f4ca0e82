//! Do53 client
//!
//! Sends a query over UDP or TCP to a plain-text nameserver with a per-attempt
//! timeout (`spec.md` §4.2). Grounded on `dns/proxy/client.rs`'s
//! `UdpDnsClient::send_query` (one socket per query, `tokio::time::timeout`
//! around the recv), generalized to classify the response into the status
//! taxonomy the transaction manager needs instead of returning a
//! `DnsResponse`.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::dns::message::{self, MAX_MESSAGE_LEN};

use super::{Do53Outcome, Do53Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

fn classify(resp: &[u8]) -> Do53Status {
    match message::summarize_response(resp) {
        None => Do53Status::MalformedQuery,
        Some(summary) => match summary.rcode {
            0 if summary.has_answers => Do53Status::Success,
            0 => Do53Status::NoData,
            2 => Do53Status::ServerFailure,
            3 => Do53Status::NotFound,
            4 => Do53Status::NotImplemented,
            5 => Do53Status::Refused,
            _ => Do53Status::Other,
        },
    }
}

/// Resolve `query` against `server` over `transport`, enforcing `attempt_timeout`.
pub async fn resolve(
    query: &[u8],
    server: SocketAddr,
    transport: Transport,
    attempt_timeout: Duration,
) -> Do53Outcome {
    let result = match transport {
        Transport::Udp => timeout(attempt_timeout, resolve_udp(query, server)).await,
        Transport::Tcp => timeout(attempt_timeout, resolve_tcp(query, server)).await,
    };

    match result {
        Err(_) => Do53Outcome {
            status: Do53Status::Timeout,
            response: None,
        },
        Ok(Err(status)) => Do53Outcome {
            status,
            response: None,
        },
        Ok(Ok(resp)) => Do53Outcome {
            status: classify(&resp),
            response: Some(resp),
        },
    }
}

async fn resolve_udp(query: &[u8], server: SocketAddr) -> Result<Vec<u8>, Do53Status> {
    let bind_addr = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|_| Do53Status::Other)?;
    socket
        .send_to(query, server)
        .await
        .map_err(connect_err_to_status)?;

    let mut buf = vec![0u8; MAX_MESSAGE_LEN];
    let (len, _) = socket.recv_from(&mut buf).await.map_err(connect_err_to_status)?;
    buf.truncate(len);
    Ok(buf)
}

async fn resolve_tcp(query: &[u8], server: SocketAddr) -> Result<Vec<u8>, Do53Status> {
    let mut stream = TcpStream::connect(server).await.map_err(connect_err_to_status)?;

    let len = u16::try_from(query.len()).map_err(|_| Do53Status::MalformedQuery)?;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(connect_err_to_status)?;
    stream.write_all(query).await.map_err(connect_err_to_status)?;

    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(connect_err_to_status)?;
    let payload_len = u16::from_be_bytes(len_buf) as usize;

    let mut resp = vec![0u8; payload_len];
    stream
        .read_exact(&mut resp)
        .await
        .map_err(connect_err_to_status)?;
    Ok(resp)
}

fn connect_err_to_status(err: std::io::Error) -> Do53Status {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionRefused => Do53Status::ConnectionRefused,
        ErrorKind::TimedOut => Do53Status::Timeout,
        _ => Do53Status::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_rcodes_to_statuses() {
        use crate::dns::message::build_servfail;
        let servfail = build_servfail(&[]);
        assert_eq!(classify(&servfail), Do53Status::ServerFailure);
        assert_eq!(classify(&[0u8; 2]), Do53Status::MalformedQuery);
    }

    #[tokio::test]
    async fn udp_query_times_out_against_a_black_hole() {
        // 192.0.2.0/24 is TEST-NET-1 (RFC 5737): guaranteed unreachable.
        let server: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let outcome = resolve(&[0u8; 12], server, Transport::Udp, Duration::from_millis(50)).await;
        assert_eq!(outcome.status, Do53Status::Timeout);
    }
}
