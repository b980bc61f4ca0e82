//! Upstream clients
//!
//! Two sibling clients the transaction manager dispatches through: a Do53
//! client (UDP/TCP to a plain nameserver) and a DoH client (HTTPS POST of
//! `application/dns-message`). Grounded on `dns/proxy/client.rs`'s
//! `DnsClient` trait and `UdpDnsClient`, stripped of the DoT/DoQ/DoH3
//! transports and connection pools this spec doesn't cover (`spec.md`
//! §4.2-4.3).

pub mod do53;
pub mod doh;

pub use do53::Transport;

use crate::metrics::QueryError;

/// Status categories a Do53 attempt can report (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Do53Status {
    Success,
    NoData,
    NotFound,
    NotImplemented,
    Refused,
    MalformedQuery,
    ServerFailure,
    ConnectionRefused,
    Timeout,
    Other,
}

impl Do53Status {
    /// Whether this status indicates a server/transport failure for the
    /// purpose of probe-driven invalidation (`spec.md` §4.4.6): everything
    /// except success, malformed-query, no-data, and not-implemented.
    pub fn is_invalidating_failure(self) -> bool {
        !matches!(
            self,
            Do53Status::Success | Do53Status::MalformedQuery | Do53Status::NoData | Do53Status::NotImplemented
        )
    }

    pub fn to_metric(self) -> QueryError {
        match self {
            Do53Status::Success => QueryError::None,
            Do53Status::NoData => QueryError::NoData,
            Do53Status::NotFound => QueryError::DomainNotFound,
            Do53Status::NotImplemented => QueryError::NotImplemented,
            Do53Status::Refused => QueryError::QueryRefused,
            Do53Status::MalformedQuery => QueryError::BadQuery,
            Do53Status::ServerFailure => QueryError::OtherServerError,
            Do53Status::ConnectionRefused => QueryError::ConnectionRefused,
            Do53Status::Timeout => QueryError::QueryTimeout,
            Do53Status::Other => QueryError::OtherClientError,
        }
    }
}

/// Result of one Do53 attempt.
pub struct Do53Outcome {
    pub status: Do53Status,
    pub response: Option<Vec<u8>>,
}

/// Failure categories a DoH attempt can report below the HTTP layer
/// (connection/transport failures; HTTP status is reported separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DohTransportError {
    UnsupportedProtocol,
    BadHost,
    ConnectionFailed,
    TooManyRedirects,
    SendError,
    ReceiveError,
    Timeout,
}

impl DohTransportError {
    pub fn to_metric(self) -> QueryError {
        match self {
            DohTransportError::UnsupportedProtocol => QueryError::UnsupportedProtocol,
            DohTransportError::BadHost => QueryError::BadHost,
            DohTransportError::ConnectionFailed => QueryError::ConnectionFailed,
            DohTransportError::TooManyRedirects => QueryError::TooManyRedirects,
            DohTransportError::SendError => QueryError::SendError,
            DohTransportError::ReceiveError => QueryError::ReceiveError,
            DohTransportError::Timeout => QueryError::QueryTimeout,
        }
    }
}

/// Result of one DoH attempt: either a transport-level failure, or an HTTP
/// response (status code + body, body empty/ignored unless status is 200).
pub enum DohOutcome {
    Transport(DohTransportError),
    Http { status: u16, body: Vec<u8> },
}

/// Strip a `{?dns}` URI template suffix from a DoH provider URL, mandatory
/// before use per `spec.md` §4.3/§9.
pub fn trim_dns_template(url: &str) -> String {
    url.replace("{?dns}", "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_dns_template_suffix() {
        assert_eq!(
            trim_dns_template("https://dns.example/dns-query{?dns}"),
            "https://dns.example/dns-query"
        );
        assert_eq!(
            trim_dns_template("https://dns.example/dns-query"),
            "https://dns.example/dns-query"
        );
    }

    #[test]
    fn invalidating_failure_excludes_benign_statuses() {
        assert!(!Do53Status::Success.is_invalidating_failure());
        assert!(!Do53Status::NoData.is_invalidating_failure());
        assert!(!Do53Status::NotImplemented.is_invalidating_failure());
        assert!(!Do53Status::MalformedQuery.is_invalidating_failure());
        assert!(Do53Status::Timeout.is_invalidating_failure());
        assert!(Do53Status::ConnectionRefused.is_invalidating_failure());
        assert!(Do53Status::ServerFailure.is_invalidating_failure());
    }
}
