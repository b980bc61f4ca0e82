//! dnsproxyd
//!
//! Per-host DNS proxy daemon: loads configuration, starts logging, and
//! drives a `dns::Resolver` from the configured nameservers, DoH providers,
//! and domain policy lists.

mod config;
mod dns;
mod log;
mod metrics;
mod platform;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use config::ConfigManager;
use log::{LogConfig, LogManager};
use metrics::TracingMetricsSink;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(ConfigManager::load()?);
    let app_config = config.get();

    let log_config = LogConfig {
        path: app_config.log_path.clone(),
        level: app_config.log_level.clone(),
        max_size: app_config.log_max_size,
        rotation: log::RotationPolicy::Daily,
        retention_days: app_config.log_retention_days,
    };
    LogManager::init_with_config(log_config.clone())?;
    let log_manager = Arc::new(LogManager::new(log_config));

    info!("configuration loaded");

    match log_manager.cleanup_old_logs() {
        Ok(result) if result.deleted_files > 0 => {
            info!(
                deleted_files = result.deleted_files,
                deleted_bytes = result.deleted_bytes,
                "log cleanup"
            );
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(%err, "log cleanup failed"),
    }

    let resolver = dns::Resolver::new(&app_config, Arc::new(TracingMetricsSink::new()));

    resolver.set_nameservers(&app_config.nameservers);
    resolver.set_doh_providers(&app_config.doh_providers, app_config.always_on_doh);
    resolver.set_domain_doh_configs(&app_config.doh_included_domains, &app_config.doh_excluded_domains);

    for addr in &app_config.listen_addrs {
        if !resolver.listen(*addr, app_config.tcp_listen_backlog).await {
            anyhow::bail!("failed to start listener on {addr}");
        }
        info!(%addr, "listening");
    }

    shutdown_signal().await;
    info!("shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received sigterm"),
    }
}
