//! Metrics taxonomy
//!
//! The resolver reports per-query outcomes through a `MetricsSink` trait so
//! that wiring to a real telemetry backend stays outside this core (see
//! `spec.md` §1, `MetricsSink`). The error categories mirror
//! `AresStatusMetric`/`CurlCodeMetric` in the original ChromiumOS `dns-proxy`
//! (`resolver.cc`), translated to the status categories our Do53/DoH clients
//! report.

use std::sync::atomic::{AtomicU64, Ordering};

/// Which upstream transport a query result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    PlainText,
    Doh,
}

/// Error categories recorded for a failed or non-success query, matching the
/// taxonomy the original source derives from ares/curl status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryError {
    None,
    NoData,
    DomainNotFound,
    NotImplemented,
    QueryRefused,
    BadQuery,
    OtherServerError,
    ConnectionRefused,
    QueryTimeout,
    OtherClientError,
    UnsupportedProtocol,
    BadHost,
    ConnectionFailed,
    TooManyRedirects,
    SendError,
    ReceiveError,
    EmptyNameServers,
    EmptyDoHProviders,
}

/// Sink for per-query outcome metrics. Implementations decide how (or
/// whether) to export these; the resolver core only needs to call `record`.
pub trait MetricsSink: Send + Sync {
    fn record(&self, query_type: QueryType, error: QueryError);
}

/// Discards every metric. Used where no telemetry backend is wired up.
#[derive(Debug, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _query_type: QueryType, _error: QueryError) {}
}

/// Logs each metric at debug level via `tracing`, and keeps a running total
/// per (query type, error) pair for diagnostics.
#[derive(Debug, Default)]
pub struct TracingMetricsSink {
    plaintext_success: AtomicU64,
    doh_success: AtomicU64,
    plaintext_failure: AtomicU64,
    doh_failure: AtomicU64,
}

impl TracingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success_count(&self, query_type: QueryType) -> u64 {
        match query_type {
            QueryType::PlainText => self.plaintext_success.load(Ordering::Relaxed),
            QueryType::Doh => self.doh_success.load(Ordering::Relaxed),
        }
    }

    pub fn failure_count(&self, query_type: QueryType) -> u64 {
        match query_type {
            QueryType::PlainText => self.plaintext_failure.load(Ordering::Relaxed),
            QueryType::Doh => self.doh_failure.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for TracingMetricsSink {
    fn record(&self, query_type: QueryType, error: QueryError) {
        tracing::debug!(?query_type, ?error, "query outcome");
        let counter = match (query_type, error) {
            (QueryType::PlainText, QueryError::None) => &self.plaintext_success,
            (QueryType::Doh, QueryError::None) => &self.doh_success,
            (QueryType::PlainText, _) => &self.plaintext_failure,
            (QueryType::Doh, _) => &self.doh_failure,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_sink_tallies_by_type() {
        let sink = TracingMetricsSink::new();
        sink.record(QueryType::PlainText, QueryError::None);
        sink.record(QueryType::PlainText, QueryError::QueryTimeout);
        sink.record(QueryType::Doh, QueryError::None);

        assert_eq!(sink.success_count(QueryType::PlainText), 1);
        assert_eq!(sink.failure_count(QueryType::PlainText), 1);
        assert_eq!(sink.success_count(QueryType::Doh), 1);
        assert_eq!(sink.failure_count(QueryType::Doh), 0);
    }

    #[test]
    fn noop_sink_does_nothing() {
        let sink = NoopMetricsSink;
        sink.record(QueryType::PlainText, QueryError::EmptyNameServers);
    }
}
