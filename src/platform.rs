//! External collaborator interfaces
//!
//! The resolver core is driven by a parent controller that owns OS-level
//! networking, connectivity state, and `resolv.conf` emission (`spec.md`
//! §1). Those collaborators are out of scope for this core; this module
//! gives their contracts a concrete Rust shape (traits) so the resolver has
//! something to depend on without pulling in their implementations.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;

/// Namespace/redirection wiring and virtual-device enumeration, normally
/// implemented by the host OS integration layer.
#[async_trait]
pub trait NetworkPlatform: Send + Sync {
    /// Request a DNS-redirection rule be installed for `listen_addr`.
    async fn add_redirect_rule(&self, listen_addr: SocketAddr) -> anyhow::Result<()>;
    /// Remove a previously installed redirect rule.
    async fn remove_redirect_rule(&self, listen_addr: SocketAddr) -> anyhow::Result<()>;
}

/// Supplies the current physical nameservers, DoH providers, and per-domain
/// DoH lists as they change, normally driven by a connectivity manager.
#[async_trait]
pub trait NetworkConfigSource: Send + Sync {
    async fn current_nameservers(&self) -> Vec<String>;
    async fn current_doh_providers(&self) -> std::collections::HashMap<String, String>;
    async fn current_domain_doh_configs(&self) -> (Vec<String>, Vec<String>);
}

/// Emits the resolver's listening addresses to `resolv.conf` or equivalent.
#[async_trait]
pub trait ResolverConfigSink: Send + Sync {
    async fn replace_listen_addrs(&self, addrs: &[SocketAddr]) -> anyhow::Result<()>;
}

/// A `ResolverConfigSink` that writes a minimal `nameserver` stanza per
/// address to a file, for standalone (non-ChromeOS) deployments.
pub struct FileResolverConfigSink {
    pub path: PathBuf,
}

#[async_trait]
impl ResolverConfigSink for FileResolverConfigSink {
    async fn replace_listen_addrs(&self, addrs: &[SocketAddr]) -> anyhow::Result<()> {
        let mut contents = String::new();
        for addr in addrs {
            contents.push_str(&format!("nameserver {}\n", addr.ip()));
        }
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }
}
