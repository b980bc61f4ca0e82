//! Resolver façade
//!
//! The public surface of the core: `ListenUDP`/`ListenTCP`, `SetNameServers`,
//! `SetDoHProviders`, `SetDomainDoHConfigs` (`spec.md` §4.7). Wires together
//! the upstream tables, domain-policy table, probe engine, and transaction
//! dispatcher. Grounded on the teacher's `DnsResolver` façade (minus its
//! cache/rewrite/database wiring).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, BootstrapResolvers};
use crate::dns::client::{do53, doh, Transport};
use crate::dns::message;
use crate::dns::policy::DomainPolicyTable;
use crate::dns::probe::{self, ProbeConfig};
use crate::dns::server::tcp::TcpServer;
use crate::dns::server::udp::UdpServer;
use crate::dns::transaction::{DispatchConfig, Dispatcher, Invalidation};
use crate::dns::upstream::{ProbeQuerySender, UpstreamEntry, UpstreamKind, UpstreamSet};
use crate::metrics::MetricsSink;

/// Issues the synthetic probe query (`www.gstatic.com A`) against a target,
/// using the real Do53/DoH clients.
struct ResolverProbeSender {
    timeout: std::time::Duration,
}

#[async_trait]
impl ProbeQuerySender for ResolverProbeSender {
    async fn send_probe(&self, target_id: &str, kind: UpstreamKind) -> bool {
        let query = message::probe_query_gstatic();
        match kind {
            UpstreamKind::Do53 => {
                let Ok(addr) = format!("{target_id}:53").parse::<SocketAddr>() else {
                    return false;
                };
                let outcome = do53::resolve(&query, addr, Transport::Udp, self.timeout).await;
                matches!(outcome.status, do53::Do53Status::Success)
            }
            UpstreamKind::Doh => {
                let outcome = doh::resolve(&query, target_id, &[], self.timeout).await;
                matches!(outcome, doh::DohOutcome::Http { status: 200, .. })
            }
        }
    }
}

/// The resolver core: upstream tables, domain-policy table, dispatcher, and
/// the background task that restarts probes after invalidation.
pub struct Resolver {
    nameservers: Arc<UpstreamSet>,
    doh_providers: Arc<UpstreamSet>,
    policy: Arc<RwLock<DomainPolicyTable>>,
    dispatcher: Arc<Dispatcher>,
    probing_enabled: Arc<AtomicBool>,
    probe_cfg: ProbeConfig,
    probe_sender: Arc<dyn ProbeQuerySender>,
    /// Shared with the `Dispatcher` so `set_doh_providers`' `always_on`
    /// argument takes effect immediately, not just at construction.
    always_on_doh: Arc<AtomicBool>,
    listeners: RwLock<HashMap<SocketAddr, (JoinHandle<()>, JoinHandle<()>)>>,
    invalidation_task: JoinHandle<()>,
}

impl Resolver {
    pub fn new(cfg: &AppConfig, metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        let nameservers = UpstreamSet::new();
        let doh_providers = UpstreamSet::new();
        let policy = Arc::new(RwLock::new(DomainPolicyTable::new()));
        let probing_enabled = Arc::new(AtomicBool::new(cfg.probing_enabled));
        let probe_sender: Arc<dyn ProbeQuerySender> = Arc::new(ResolverProbeSender {
            timeout: std::time::Duration::from_millis(cfg.upstream_timeout_ms),
        });
        let probe_cfg = ProbeConfig {
            initial_delay_secs: cfg.probe_initial_delay_secs,
            multiplier: cfg.probe_retry_multiplier,
            max_delay_secs: cfg.probe_max_delay_secs,
            jitter_multiplier: cfg.retry_jitter_multiplier,
        };

        let (invalidation_tx, mut invalidation_rx) = mpsc::unbounded_channel::<Invalidation>();
        let always_on_doh = Arc::new(AtomicBool::new(cfg.always_on_doh));

        let dispatcher = Arc::new(Dispatcher {
            nameservers: nameservers.clone(),
            doh_providers: doh_providers.clone(),
            policy: policy.clone(),
            metrics,
            cfg: DispatchConfig::from_app_config(cfg),
            always_on_doh: always_on_doh.clone(),
            invalidations: invalidation_tx,
        });

        let probing_enabled_bg = probing_enabled.clone();
        let probe_sender_bg = probe_sender.clone();
        let nameservers_bg = nameservers.clone();
        let doh_providers_bg = doh_providers.clone();
        let invalidation_task = tokio::spawn(async move {
            while let Some(event) = invalidation_rx.recv().await {
                if !probing_enabled_bg.load(Ordering::Relaxed) {
                    continue;
                }
                let (set, entry) = match event {
                    Invalidation::Nameserver(e) => (nameservers_bg.clone(), e),
                    Invalidation::DohProvider(e) => (doh_providers_bg.clone(), e),
                };
                let (weak, target) = set.probe_adapter(&entry, probe_sender_bg.clone());
                tokio::spawn(probe::run_probe_loop(weak, target, probe_cfg));
            }
        });

        Arc::new(Self {
            nameservers,
            doh_providers,
            policy,
            dispatcher,
            probing_enabled,
            probe_cfg,
            probe_sender,
            always_on_doh,
            listeners: RwLock::new(HashMap::new()),
            invalidation_task,
        })
    }

    /// Diff the nameserver set against `list`, dropping removed entries and
    /// starting probes for newly added ones (`spec.md` §4.7).
    pub fn set_nameservers(self: &Arc<Self>, list: &[String]) {
        let created = self.nameservers.diff_update(
            list.iter()
                .map(|ip| (ip.clone(), UpstreamKind::Do53, BootstrapResolvers::AlwaysOn)),
        );
        self.start_probes(&self.nameservers, created);
    }

    /// Same diff logic on the DoH set; `always_on_doh` is recorded
    /// separately since it isn't per-target state.
    pub fn set_doh_providers(self: &Arc<Self>, providers: &HashMap<String, String>, always_on: bool) {
        self.always_on_doh.store(always_on, Ordering::Relaxed);
        let entries = providers.iter().map(|(url, bootstrap_raw)| {
            let trimmed = crate::dns::client::trim_dns_template(url);
            (trimmed, UpstreamKind::Doh, BootstrapResolvers::parse(bootstrap_raw))
        });
        let created = self.doh_providers.diff_update(entries);
        self.start_probes(&self.doh_providers, created);
    }

    /// Rebuild the FQDN map and sorted suffix list (`spec.md` §4.4.2).
    pub fn set_domain_doh_configs(&self, included: &[String], excluded: &[String]) {
        self.policy
            .write()
            .expect("policy lock poisoned")
            .set_configs(included, excluded);
    }

    fn start_probes(self: &Arc<Self>, set: &Arc<UpstreamSet>, created: Vec<Arc<UpstreamEntry>>) {
        if !self.probing_enabled.load(Ordering::Relaxed) {
            return;
        }
        for entry in created {
            let (weak, target) = set.probe_adapter(&entry, self.probe_sender.clone());
            tokio::spawn(probe::run_probe_loop(weak, target, self.probe_cfg));
        }
    }

    pub fn set_probing_enabled(&self, enabled: bool) {
        self.probing_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Bind a UDP socket and a TCP listener at `addr` and start serving
    /// queries. Returns `false` on bind/listen failure (`spec.md` §4.6).
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr, tcp_backlog: u32) -> bool {
        let udp = match UdpServer::bind(addr, self.dispatcher.clone()).await {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(%addr, %err, "failed to bind udp listener");
                return false;
            }
        };
        let tcp = match TcpServer::bind(addr, tcp_backlog, self.dispatcher.clone()).await {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(%addr, %err, "failed to bind tcp listener");
                return false;
            }
        };

        let udp_handle = tokio::spawn(udp.run());
        let tcp_handle = tokio::spawn(tcp.run());
        self.listeners
            .write()
            .expect("listeners lock poisoned")
            .insert(addr, (udp_handle, tcp_handle));
        true
    }

    /// Drop the listener bound to `addr`, if any (`spec.md` §4.6 `StopListen`).
    pub fn stop_listen(&self, addr: &SocketAddr) {
        if let Some((udp, tcp)) = self.listeners.write().expect("listeners lock poisoned").remove(addr) {
            udp.abort();
            tcp.abort();
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.invalidation_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::metrics::NoopMetricsSink;

    fn test_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.probing_enabled = false;
        cfg
    }

    #[tokio::test]
    async fn set_nameservers_populates_unvalidated_entries() {
        let resolver = Resolver::new(&test_config(), Arc::new(NoopMetricsSink));
        resolver.set_nameservers(&["1.1.1.1".to_string(), "8.8.8.8".to_string()]);
        assert_eq!(resolver.nameservers.all().len(), 2);
    }

    #[tokio::test]
    async fn set_doh_providers_trims_template_and_parses_bootstrap() {
        let resolver = Resolver::new(&test_config(), Arc::new(NoopMetricsSink));
        let mut providers = HashMap::new();
        providers.insert("https://dns.example/dns-query{?dns}".to_string(), "1.1.1.1".to_string());
        resolver.set_doh_providers(&providers, false);

        let entry = resolver.doh_providers.get("https://dns.example/dns-query").unwrap();
        assert_eq!(entry.bootstrap, BootstrapResolvers::Scoped(vec!["1.1.1.1".to_string()]));
    }

    #[tokio::test]
    async fn set_domain_doh_configs_rebuilds_policy_table() {
        let resolver = Resolver::new(&test_config(), Arc::new(NoopMetricsSink));
        resolver.set_domain_doh_configs(&[], &["*.corp.example".to_string()]);
        assert!(resolver.policy.read().unwrap().bypass_doh("wiki.corp.example", true));
    }

    #[tokio::test]
    async fn listen_binds_both_udp_and_tcp() {
        let resolver = Resolver::new(&test_config(), Arc::new(NoopMetricsSink));
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(resolver.listen(addr, 16).await);
    }
}
