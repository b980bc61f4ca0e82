//! Transaction dispatch
//!
//! Resolves one client query end to end: dispatch decision, fan-out to up to
//! three upstream targets, result aggregation, and probe-driven invalidation
//! (`spec.md` §4.4). Grounded on `dns/proxy/strategy.rs`'s fallback-ladder
//! idea, reworked around `futures::stream::FuturesUnordered` so that
//! "cancel the losing peers" falls out of normal future drop semantics
//! instead of a manual weak-reference table — the async equivalent of the
//! cancellation discipline used for probes in `crate::dns::probe`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;

use crate::dns::client::{do53, doh, Do53Outcome, Do53Status, DohOutcome, Transport};
use crate::dns::message;
use crate::dns::policy::DomainPolicyTable;
use crate::dns::upstream::{UpstreamEntry, UpstreamKind, UpstreamSet};
use crate::metrics::{MetricsSink, QueryError, QueryType};

const MAX_FANOUT: usize = 3;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_concurrent_upstreams: usize,
    pub max_query_retries: u32,
    pub upstream_timeout: Duration,
    pub retry_jitter_multiplier: f64,
}

impl DispatchConfig {
    pub fn from_app_config(app: &crate::config::AppConfig) -> Self {
        Self {
            max_concurrent_upstreams: app.max_concurrent_upstreams,
            max_query_retries: app.max_query_retries,
            upstream_timeout: Duration::from_millis(app.upstream_timeout_ms),
            retry_jitter_multiplier: app.retry_jitter_multiplier,
        }
    }
}

/// Sent when a query failure invalidates a previously validated target,
/// naming which table it came from so the receiver can restart its probe
/// schedule. The resolver façade owns the receiving end because only it
/// holds the `ProbeQuerySender` needed to actually issue probes.
pub enum Invalidation {
    Nameserver(Arc<UpstreamEntry>),
    DohProvider(Arc<UpstreamEntry>),
}

/// Resolves one client query. Owns references to both upstream tables, the
/// domain-policy table, and the metrics sink; stateless across queries
/// otherwise (there is no shared per-query object, unlike the source's
/// `SocketFd` — structured concurrency takes its place).
pub struct Dispatcher {
    pub nameservers: Arc<UpstreamSet>,
    pub doh_providers: Arc<UpstreamSet>,
    pub policy: Arc<std::sync::RwLock<DomainPolicyTable>>,
    pub metrics: Arc<dyn MetricsSink>,
    pub cfg: DispatchConfig,
    /// Shared with `Resolver` so `SetDoHProviders`' `always_on` argument
    /// takes effect on the next dispatch rather than only at construction.
    pub always_on_doh: Arc<AtomicBool>,
    pub invalidations: UnboundedSender<Invalidation>,
}

impl Dispatcher {
    /// Resolve `query`, returning the wire-format reply to send back to the
    /// client. Always returns something — an unparseable query yields a
    /// SERVFAIL with id 0 (`spec.md` §4.1, §7).
    pub async fn resolve(&self, query: &[u8]) -> Vec<u8> {
        let Some(qname) = message::extract_qname(query) else {
            return message::build_servfail(query);
        };

        let doh_enabled = !self.doh_providers.is_empty();
        let bypass_doh = self
            .policy
            .read()
            .expect("policy lock poisoned")
            .bypass_doh(&qname, doh_enabled);

        if doh_enabled && !bypass_doh {
            match self.dispatch_doh(query).await {
                DohRoundOutcome::Reply(reply) => return reply,
                DohRoundOutcome::FallThroughToDo53 => {}
                DohRoundOutcome::ServFail => return message::build_servfail(query),
            }
        }

        self.dispatch_do53(query).await
    }

    /// Active DoH targets (`spec.md` §4.4.3, `resolver.cc`'s
    /// `GetActiveDoHProviders`): when always-on, every configured provider
    /// participates regardless of validation state; otherwise only
    /// currently-validated providers do, which is empty (forcing a Do53
    /// fallback) until at least one has been probed successfully.
    async fn active_doh_targets(&self) -> Vec<Arc<UpstreamEntry>> {
        if self.always_on_doh.load(Ordering::Relaxed) {
            return self.doh_providers.all();
        }
        let targets = self.doh_providers.validated();
        let active_ns_ids: Vec<String> = self.nameservers.active().iter().map(|t| t.id.clone()).collect();
        crate::dns::upstream::doh_targets_for_active_nameservers(targets, &active_ns_ids)
    }

    async fn dispatch_doh(&self, query: &[u8]) -> DohRoundOutcome {
        let mut retries = 0u32;
        loop {
            let always_on_doh = self.always_on_doh.load(Ordering::Relaxed);
            let mut targets = self.active_doh_targets().await;
            if targets.is_empty() {
                self.metrics.record(QueryType::Doh, QueryError::EmptyDoHProviders);
                return if always_on_doh {
                    DohRoundOutcome::ServFail
                } else {
                    DohRoundOutcome::FallThroughToDo53
                };
            }
            targets.truncate(self.cfg.max_concurrent_upstreams.min(MAX_FANOUT));

            match self.run_doh_round(query, &targets).await {
                RoundResult::Success(body) => return DohRoundOutcome::Reply(body),
                RoundResult::Nxdomain(body) => {
                    if always_on_doh {
                        return DohRoundOutcome::Reply(body);
                    }
                    return DohRoundOutcome::FallThroughToDo53;
                }
                RoundResult::AllFailed => {
                    if always_on_doh {
                        retries += 1;
                        if retries >= self.cfg.max_query_retries {
                            return DohRoundOutcome::ServFail;
                        }
                        continue;
                    }
                    return DohRoundOutcome::FallThroughToDo53;
                }
            }
        }
    }

    async fn run_doh_round(&self, query: &[u8], targets: &[Arc<UpstreamEntry>]) -> RoundResult {
        let mut futs = FuturesUnordered::new();
        for target in targets {
            let target = target.clone();
            let query = query.to_vec();
            let timeout = self.cfg.upstream_timeout;
            let jitter_mult = self.cfg.retry_jitter_multiplier;
            let max_retries = self.cfg.max_query_retries;
            futs.push(async move {
                let outcome = query_doh_target_with_429_retry(&target, &query, timeout, jitter_mult, max_retries).await;
                (target, outcome)
            });
        }

        let mut any_active = futs.len();
        while let Some((target, outcome)) = futs.next().await {
            any_active -= 1;
            match outcome {
                DohOutcome::Http { status: 200, body } => {
                    self.metrics.record(QueryType::Doh, QueryError::None);
                    self.maybe_invalidate_doh(&target, false);
                    if message::is_nxdomain(&body) {
                        return RoundResult::Nxdomain(body);
                    }
                    return RoundResult::Success(body);
                }
                DohOutcome::Http { status, .. } => {
                    self.metrics.record(QueryType::Doh, QueryError::OtherServerError);
                    self.maybe_invalidate_doh(&target, true);
                    tracing::debug!(target = %target.id, status, "doh target returned non-200");
                }
                DohOutcome::Transport(err) => {
                    self.metrics.record(QueryType::Doh, err.to_metric());
                    self.maybe_invalidate_doh(&target, true);
                }
            }
            if any_active == 0 {
                return RoundResult::AllFailed;
            }
        }
        RoundResult::AllFailed
    }

    async fn dispatch_do53(&self, query: &[u8]) -> Vec<u8> {
        let mut retries = 0u32;
        loop {
            let mut targets = self.nameservers.active();
            if targets.is_empty() {
                self.metrics.record(QueryType::PlainText, QueryError::EmptyNameServers);
                return message::build_servfail(query);
            }
            targets.truncate(self.cfg.max_concurrent_upstreams.min(MAX_FANOUT));

            match self.run_do53_round(query, &targets).await {
                RoundResult::Success(body) | RoundResult::Nxdomain(body) => return body,
                RoundResult::AllFailed => {
                    retries += 1;
                    if retries >= self.cfg.max_query_retries {
                        return message::build_servfail(query);
                    }
                }
            }
        }
    }

    async fn run_do53_round(&self, query: &[u8], targets: &[Arc<UpstreamEntry>]) -> RoundResult {
        let mut futs = FuturesUnordered::new();
        for target in targets {
            let target = target.clone();
            let query = query.to_vec();
            let timeout = self.cfg.upstream_timeout;
            futs.push(async move {
                let addr: Result<std::net::SocketAddr, _> = format!("{}:53", target.id).parse();
                let Ok(addr) = addr else {
                    return (target, Do53Outcome { status: Do53Status::Other, response: None });
                };
                let outcome = do53::resolve(&query, addr, Transport::Udp, timeout).await;
                (target, outcome)
            });
        }

        let mut any_active = futs.len();
        while let Some((target, outcome)) = futs.next().await {
            any_active -= 1;
            self.metrics.record(QueryType::PlainText, outcome.status.to_metric());
            match outcome.status {
                Do53Status::Success => {
                    self.maybe_invalidate_do53(&target, false);
                    return RoundResult::Success(outcome.response.unwrap_or_default());
                }
                Do53Status::NotFound => {
                    self.maybe_invalidate_do53(&target, false);
                    if any_active == 0 {
                        return RoundResult::Nxdomain(outcome.response.unwrap_or_default());
                    }
                }
                _ => {
                    self.maybe_invalidate_do53(&target, outcome.status.is_invalidating_failure());
                }
            }
            if any_active == 0 {
                return RoundResult::AllFailed;
            }
        }
        RoundResult::AllFailed
    }

    /// Probe-driven invalidation (`spec.md` §4.4.6): only revoke validation
    /// for a target that was validated *at dispatch time* and whose failure
    /// indicates a real server/transport problem.
    fn maybe_invalidate_do53(&self, target: &Arc<UpstreamEntry>, failed: bool) {
        if !failed || !target.validated {
            return;
        }
        if let Some(fresh) = self.nameservers.invalidate(&target.id) {
            let _ = self.invalidations.send(Invalidation::Nameserver(fresh));
        }
    }

    fn maybe_invalidate_doh(&self, target: &Arc<UpstreamEntry>, failed: bool) {
        if !failed || !target.validated {
            return;
        }
        if let Some(fresh) = self.doh_providers.invalidate(&target.id) {
            let _ = self.invalidations.send(Invalidation::DohProvider(fresh));
        }
    }
}

enum RoundResult {
    Success(Vec<u8>),
    Nxdomain(Vec<u8>),
    AllFailed,
}

enum DohRoundOutcome {
    Reply(Vec<u8>),
    FallThroughToDo53,
    ServFail,
}

/// Query one DoH target, retrying HTTP 429 with jitter up to `max_retries`
/// times before surfacing it as a terminal outcome for this round
/// (`spec.md` §4.4.4).
async fn query_doh_target_with_429_retry(
    target: &UpstreamEntry,
    query: &[u8],
    timeout: Duration,
    jitter_multiplier: f64,
    max_retries: u32,
) -> DohOutcome {
    debug_assert_eq!(target.kind, UpstreamKind::Doh);
    let bootstrap: Vec<String> = match &target.bootstrap {
        crate::config::BootstrapResolvers::Scoped(ips) => ips.clone(),
        _ => Vec::new(),
    };

    let mut attempt = 0u32;
    loop {
        let outcome = doh::resolve(query, &target.id, &bootstrap, timeout).await;
        match &outcome {
            DohOutcome::Http { status: 429, .. } if attempt < max_retries => {
                attempt += 1;
                let jitter: f64 = rand::thread_rng().gen_range(0.0..jitter_multiplier);
                let delay = timeout.as_secs_f64() * (1.0 - jitter);
                tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
            }
            _ => return outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetricsSink;

    fn dispatcher_with_no_upstreams() -> Dispatcher {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Dispatcher {
            nameservers: UpstreamSet::new(),
            doh_providers: UpstreamSet::new(),
            policy: Arc::new(std::sync::RwLock::new(DomainPolicyTable::new())),
            metrics: Arc::new(NoopMetricsSink),
            cfg: DispatchConfig {
                max_concurrent_upstreams: 3,
                max_query_retries: 2,
                upstream_timeout: Duration::from_millis(50),
                retry_jitter_multiplier: 0.2,
            },
            always_on_doh: Arc::new(AtomicBool::new(false)),
            invalidations: tx,
        }
    }

    #[tokio::test]
    async fn unparseable_query_yields_servfail_with_id_zero() {
        let dispatcher = dispatcher_with_no_upstreams();
        let reply = dispatcher.resolve(&[0xFF; 3]).await;
        assert_eq!(message::extract_id(&reply), Some(0));
    }

    #[tokio::test]
    async fn active_doh_targets_empty_when_none_validated_and_not_always_on() {
        let dispatcher = dispatcher_with_no_upstreams();
        dispatcher.doh_providers.diff_update(
            vec![(
                "https://doh.example/dns-query".to_string(),
                UpstreamKind::Doh,
                crate::config::BootstrapResolvers::AlwaysOn,
            )]
            .into_iter(),
        );
        // Newly added providers start unvalidated, and always_on_doh is false,
        // so no target should be considered active until one validates.
        assert!(dispatcher.active_doh_targets().await.is_empty());
    }

    #[tokio::test]
    async fn active_doh_targets_includes_unvalidated_when_always_on() {
        let dispatcher = dispatcher_with_no_upstreams();
        dispatcher.always_on_doh.store(true, Ordering::Relaxed);
        dispatcher.doh_providers.diff_update(
            vec![(
                "https://doh.example/dns-query".to_string(),
                UpstreamKind::Doh,
                crate::config::BootstrapResolvers::AlwaysOn,
            )]
            .into_iter(),
        );
        assert_eq!(dispatcher.active_doh_targets().await.len(), 1);
    }

    #[tokio::test]
    async fn no_configured_servers_yields_servfail_matching_id() {
        let dispatcher = dispatcher_with_no_upstreams();
        let query = {
            let mut msg = Vec::new();
            msg.extend_from_slice(&0x4A47u16.to_be_bytes());
            msg.extend_from_slice(&0x0100u16.to_be_bytes());
            msg.extend_from_slice(&1u16.to_be_bytes());
            msg.extend_from_slice(&0u16.to_be_bytes());
            msg.extend_from_slice(&0u16.to_be_bytes());
            msg.extend_from_slice(&0u16.to_be_bytes());
            for label in ["google", "com"] {
                msg.push(label.len() as u8);
                msg.extend_from_slice(label.as_bytes());
            }
            msg.push(0);
            msg.extend_from_slice(&1u16.to_be_bytes());
            msg.extend_from_slice(&1u16.to_be_bytes());
            msg
        };
        let reply = dispatcher.resolve(&query).await;
        assert_eq!(message::extract_id(&reply), Some(0x4A47));
    }
}
