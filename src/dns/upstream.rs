//! Upstream target tables
//!
//! Tracks the configured Do53 nameservers and DoH providers, their validated
//! state, and the diff-based update logic `SetNameServers`/`SetDoHProviders`
//! use (`spec.md` §3 `UpstreamTarget`, §4.7). Grounded on
//! `dns/proxy/upstream.rs`'s `UpstreamManager` (concurrent table, add/remove
//! by diff) translated from a database-backed `RwLock<Vec<_>>` to an
//! in-memory `DashMap` keyed by target identifier, since this core persists
//! no state (`spec.md` §6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::BootstrapResolvers;
use crate::dns::probe::{ProbeConfig, ProbeState, ProbeTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamKind {
    Do53,
    Doh,
}

/// One upstream target. Replaced wholesale (a new `Arc`) on validation or
/// invalidation, per the weak-reference discipline of `spec.md` §9 — never
/// mutated in place except for the probe retry counter inside `probe_state`.
pub struct UpstreamEntry {
    pub id: String,
    pub kind: UpstreamKind,
    pub bootstrap: BootstrapResolvers,
    pub validated: bool,
    pub probe_state: Arc<ProbeState>,
}

/// Issues the synthetic probe query against a specific target. Implemented
/// by the resolver, which owns the Do53/DoH clients; kept as a trait here so
/// this module has no dependency on the client implementations.
#[async_trait]
pub trait ProbeQuerySender: Send + Sync {
    async fn send_probe(&self, target_id: &str, kind: UpstreamKind) -> bool;
}

struct ProbeAdapter {
    set: Arc<UpstreamSet>,
    id: String,
    sender: Arc<dyn ProbeQuerySender>,
}

#[async_trait]
impl ProbeTarget for ProbeAdapter {
    async fn probe(&self) -> bool {
        let kind = match self.set.get(&self.id) {
            Some(entry) => entry.kind,
            None => return false,
        };
        self.sender.send_probe(&self.id, kind).await
    }

    fn mark_validated(&self) {
        self.set.mark_validated(&self.id);
    }
}

/// A concurrent table of upstream targets, keyed by identifier (IP literal
/// for Do53, URL for DoH). Used once for nameservers and once for DoH
/// providers.
#[derive(Default)]
pub struct UpstreamSet {
    entries: DashMap<String, Arc<UpstreamEntry>>,
}

impl UpstreamSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, id: &str) -> Option<Arc<UpstreamEntry>> {
        self.entries.get(id).map(|e| e.clone())
    }

    /// Diff the table against `ids`: drop entries no longer present, keep
    /// surviving ones as-is (preserving validated state), and create fresh
    /// unvalidated entries for new ids. Returns the newly created entries so
    /// the caller can start probing them.
    pub fn diff_update(
        self: &Arc<Self>,
        ids: impl Iterator<Item = (String, UpstreamKind, BootstrapResolvers)>,
    ) -> Vec<Arc<UpstreamEntry>> {
        let incoming: Vec<_> = ids.collect();
        let incoming_ids: std::collections::HashSet<&str> =
            incoming.iter().map(|(id, _, _)| id.as_str()).collect();

        self.entries.retain(|id, _| incoming_ids.contains(id.as_str()));

        let mut created = Vec::new();
        for (id, kind, bootstrap) in incoming {
            if self.entries.contains_key(&id) {
                continue;
            }
            let entry = Arc::new(UpstreamEntry {
                id: id.clone(),
                kind,
                bootstrap,
                validated: false,
                probe_state: ProbeState::new(),
            });
            self.entries.insert(id, entry.clone());
            created.push(entry);
        }
        created
    }

    /// Replace a target's entry with a validated instance, stopping any
    /// future probing for it. No-op if the target was removed or already
    /// replaced (e.g. by a concurrent invalidation).
    pub fn mark_validated(&self, id: &str) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            if entry.validated {
                return;
            }
            *entry = Arc::new(UpstreamEntry {
                id: entry.id.clone(),
                kind: entry.kind,
                bootstrap: entry.bootstrap.clone(),
                validated: true,
                probe_state: ProbeState::new(),
            });
        }
    }

    /// Replace a validated target's entry with a fresh unvalidated one and
    /// return it so the caller can restart its probe schedule at the initial
    /// delay. No-op (returns `None`) if the target is no longer present.
    pub fn invalidate(&self, id: &str) -> Option<Arc<UpstreamEntry>> {
        let mut entry = self.entries.get_mut(id)?;
        let fresh = Arc::new(UpstreamEntry {
            id: entry.id.clone(),
            kind: entry.kind,
            bootstrap: entry.bootstrap.clone(),
            validated: false,
            probe_state: ProbeState::new(),
        });
        *entry = fresh.clone();
        Some(fresh)
    }

    /// Validated targets if any exist, else every configured target.
    pub fn active(&self) -> Vec<Arc<UpstreamEntry>> {
        let validated = self.validated();
        if !validated.is_empty() {
            return validated;
        }
        self.all()
    }

    /// Currently-validated targets only; empty if none have validated yet.
    pub fn validated(&self) -> Vec<Arc<UpstreamEntry>> {
        self.entries.iter().filter(|e| e.validated).map(|e| e.clone()).collect()
    }

    pub fn all(&self) -> Vec<Arc<UpstreamEntry>> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a `ProbeTarget` adapter for `entry`, suitable for
    /// `probe::run_probe_loop`.
    pub fn probe_adapter(
        self: &Arc<Self>,
        entry: &Arc<UpstreamEntry>,
        sender: Arc<dyn ProbeQuerySender>,
    ) -> (Weak<ProbeState>, Arc<dyn ProbeTarget>) {
        let weak = Arc::downgrade(&entry.probe_state);
        let adapter = Arc::new(ProbeAdapter {
            set: self.clone(),
            id: entry.id.clone(),
            sender,
        });
        (weak, adapter)
    }
}

/// Filter DoH targets by the automatic-mode coupling described in
/// `spec.md` §9: a provider configured with scoped bootstrap resolvers
/// participates only when one of those resolvers is among the currently
/// active nameserver identifiers.
pub fn doh_targets_for_active_nameservers(
    targets: Vec<Arc<UpstreamEntry>>,
    active_nameserver_ids: &[String],
) -> Vec<Arc<UpstreamEntry>> {
    targets
        .into_iter()
        .filter(|t| match &t.bootstrap {
            BootstrapResolvers::AlwaysOn | BootstrapResolvers::Automatic => true,
            BootstrapResolvers::Scoped(ips) => {
                ips.iter().any(|ip| active_nameserver_ids.contains(ip))
            }
        })
        .collect()
}

/// Tracks whether probing is globally enabled, so it can be disabled in
/// tests (`spec.md` §4.5).
pub struct ProbingSwitch(AtomicBool);

impl ProbingSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(AtomicBool::new(enabled))
    }

    pub fn enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }
}

#[allow(dead_code)]
pub const DEFAULT_PROBE_CONFIG: ProbeConfig = ProbeConfig {
    initial_delay_secs: 1.0,
    multiplier: 1.5,
    max_delay_secs: 3600.0,
    jitter_multiplier: 0.2,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn bootstrap_none() -> BootstrapResolvers {
        BootstrapResolvers::AlwaysOn
    }

    #[test]
    fn diff_update_adds_new_and_drops_removed() {
        let set = UpstreamSet::new();
        let created = set.diff_update(
            vec![
                ("1.1.1.1".to_string(), UpstreamKind::Do53, bootstrap_none()),
                ("8.8.8.8".to_string(), UpstreamKind::Do53, bootstrap_none()),
            ]
            .into_iter(),
        );
        assert_eq!(created.len(), 2);
        assert_eq!(set.all().len(), 2);

        let created2 = set.diff_update(
            vec![("8.8.8.8".to_string(), UpstreamKind::Do53, bootstrap_none())].into_iter(),
        );
        assert!(created2.is_empty());
        assert_eq!(set.all().len(), 1);
        assert!(set.get("1.1.1.1").is_none());
        assert!(set.get("8.8.8.8").is_some());
    }

    #[test]
    fn diff_update_preserves_validated_state_for_survivors() {
        let set = UpstreamSet::new();
        set.diff_update(
            vec![("1.1.1.1".to_string(), UpstreamKind::Do53, bootstrap_none())].into_iter(),
        );
        set.mark_validated("1.1.1.1");
        assert!(set.get("1.1.1.1").unwrap().validated);

        set.diff_update(
            vec![("1.1.1.1".to_string(), UpstreamKind::Do53, bootstrap_none())].into_iter(),
        );
        assert!(set.get("1.1.1.1").unwrap().validated);
    }

    #[test]
    fn active_falls_back_to_all_when_none_validated() {
        let set = UpstreamSet::new();
        set.diff_update(
            vec![
                ("1.1.1.1".to_string(), UpstreamKind::Do53, bootstrap_none()),
                ("8.8.8.8".to_string(), UpstreamKind::Do53, bootstrap_none()),
            ]
            .into_iter(),
        );
        assert_eq!(set.active().len(), 2);
        set.mark_validated("1.1.1.1");
        assert_eq!(set.active().len(), 1);
        assert_eq!(set.active()[0].id, "1.1.1.1");
    }

    #[test]
    fn invalidate_replaces_instance_and_resets_validated() {
        let set = UpstreamSet::new();
        set.diff_update(
            vec![("1.1.1.1".to_string(), UpstreamKind::Do53, bootstrap_none())].into_iter(),
        );
        set.mark_validated("1.1.1.1");
        let old = set.get("1.1.1.1").unwrap();
        let old_probe_weak = Arc::downgrade(&old.probe_state);

        let fresh = set.invalidate("1.1.1.1").unwrap();
        assert!(!fresh.validated);
        assert!(!set.get("1.1.1.1").unwrap().validated);
        drop(old);
        assert!(old_probe_weak.upgrade().is_none());
    }

    #[test]
    fn doh_targets_filtered_by_active_nameservers() {
        let scoped = Arc::new(UpstreamEntry {
            id: "https://doh.example/dns-query".to_string(),
            kind: UpstreamKind::Doh,
            bootstrap: BootstrapResolvers::Scoped(vec!["1.1.1.1".to_string()]),
            validated: true,
            probe_state: ProbeState::new(),
        });
        let always_on = Arc::new(UpstreamEntry {
            id: "https://always.example/dns-query".to_string(),
            kind: UpstreamKind::Doh,
            bootstrap: BootstrapResolvers::AlwaysOn,
            validated: true,
            probe_state: ProbeState::new(),
        });

        let active = vec!["9.9.9.9".to_string()];
        let filtered =
            doh_targets_for_active_nameservers(vec![scoped.clone(), always_on.clone()], &active);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, always_on.id);

        let active2 = vec!["1.1.1.1".to_string()];
        let filtered2 = doh_targets_for_active_nameservers(vec![scoped, always_on], &active2);
        assert_eq!(filtered2.len(), 2);
    }
}
