//! Domain DoH policy table
//!
//! Maps query QNAMEs to DoH-bypass/force decisions from two configured lists
//! (`doh_included_domains`, `doh_excluded_domains`). See `spec.md` §3
//! (`DomainDoHConfig`) and §4.4.2 (dispatch decision).

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Included,
    Excluded,
}

#[derive(Debug, Clone)]
struct SuffixEntry {
    suffix: String,
    dot_count: usize,
    decision: Decision,
}

/// Domain-policy table: an FQDN exact-match map plus a suffix list sorted by
/// dot-count descending (ties broken Included-before-Excluded), rebuilt
/// wholesale on every `set_configs` call.
#[derive(Debug, Default)]
pub struct DomainPolicyTable {
    fqdn: HashMap<String, Decision>,
    suffixes: Vec<SuffixEntry>,
    included_nonempty: bool,
}

fn dot_count(s: &str) -> usize {
    s.chars().filter(|c| *c == '.').count()
}

impl DomainPolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the table from `included`/`excluded` lists. Each entry is
    /// either an FQDN or a `*.`-prefixed suffix.
    pub fn set_configs(&mut self, included: &[String], excluded: &[String]) {
        self.fqdn.clear();
        self.suffixes.clear();
        self.included_nonempty = !included.is_empty();

        for (list, decision) in [(included, Decision::Included), (excluded, Decision::Excluded)] {
            for entry in list {
                if let Some(suffix) = entry.strip_prefix("*.") {
                    self.suffixes.push(SuffixEntry {
                        suffix: suffix.to_string(),
                        dot_count: dot_count(suffix),
                        decision,
                    });
                } else {
                    self.fqdn.insert(entry.clone(), decision);
                }
            }
        }

        // Dot-count descending; ties: Included before Excluded.
        self.suffixes.sort_by(|a, b| {
            b.dot_count.cmp(&a.dot_count).then_with(|| match (a.decision, b.decision) {
                (Decision::Included, Decision::Excluded) => std::cmp::Ordering::Less,
                (Decision::Excluded, Decision::Included) => std::cmp::Ordering::Greater,
                _ => std::cmp::Ordering::Equal,
            })
        });
    }

    /// Whether `qname` should bypass DoH (true) or use it (false), per the
    /// dispatch decision of §4.4.2. `global_doh_enabled` is the fallback when
    /// both lists are empty.
    pub fn bypass_doh(&self, qname: &str, global_doh_enabled: bool) -> bool {
        if self.fqdn.is_empty() && self.suffixes.is_empty() {
            return !global_doh_enabled;
        }

        if let Some(decision) = self.fqdn.get(qname) {
            return *decision == Decision::Excluded;
        }

        for entry in &self.suffixes {
            if qname == entry.suffix || qname.ends_with(&format!(".{}", entry.suffix)) {
                return entry.decision == Decision::Excluded;
            }
        }

        // No match: default to excluded when an allow-list exists, else DoH.
        if self.included_nonempty {
            true
        } else {
            !global_doh_enabled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_lists_honor_global_mode() {
        let table = DomainPolicyTable::new();
        assert!(!table.bypass_doh("example.com", true));
        assert!(table.bypass_doh("example.com", false));
    }

    #[test]
    fn fqdn_exact_match_wins() {
        let mut table = DomainPolicyTable::new();
        table.set_configs(&[], &["wiki.corp.example".to_string()]);
        assert!(table.bypass_doh("wiki.corp.example", true));
        assert!(!table.bypass_doh("other.corp.example", true));
    }

    #[test]
    fn suffix_bypass_matches_subdomains() {
        let mut table = DomainPolicyTable::new();
        table.set_configs(&[], &["*.corp.example".to_string()]);
        assert!(table.bypass_doh("wiki.corp.example", true));
        assert!(table.bypass_doh("deep.nested.corp.example", true));
        assert!(!table.bypass_doh("corp.example.evil.com", true));
    }

    #[test]
    fn longer_suffix_wins_over_shorter() {
        let mut table = DomainPolicyTable::new();
        table.set_configs(
            &["*.eng.corp.example".to_string()],
            &["*.corp.example".to_string()],
        );
        // eng.corp.example has more dots, so it's checked first.
        assert!(!table.bypass_doh("host.eng.corp.example", true));
        assert!(table.bypass_doh("host.sales.corp.example", true));
    }

    #[test]
    fn allowlist_present_defaults_excluded() {
        let mut table = DomainPolicyTable::new();
        table.set_configs(&["good.example".to_string()], &[]);
        assert!(!table.bypass_doh("good.example", true));
        assert!(table.bypass_doh("unlisted.example", true));
    }

    #[test]
    fn tie_break_prefers_included() {
        let mut table = DomainPolicyTable::new();
        // Same dot count, one included one excluded for two disjoint suffixes:
        // verify ordering doesn't cause cross-contamination.
        table.set_configs(
            &["*.a.example".to_string()],
            &["*.b.example".to_string()],
        );
        assert!(!table.bypass_doh("x.a.example", true));
        assert!(table.bypass_doh("x.b.example", true));
    }
}
