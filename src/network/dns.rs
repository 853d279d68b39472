//! DNS seed resolution
//!
//! Fire-and-forget: the pool spawns a query and the outcome comes back as a
//! [`PoolEvent::DnsResolved`].

use crate::config::Chain;
use crate::network::address::Address;
use crate::network::peer::PoolEvent;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Result of querying every seed once
#[derive(Debug, Clone, Default)]
pub struct DnsOutcome {
    pub success: bool,
    pub addresses: Vec<Address>,
    pub error: Option<String>,
}

/// Resolve all seeds. Seeds without a port get the chain's default port.
/// Succeeds when at least one seed answered.
pub async fn resolve_seeds(seeds: &[String], chain: Chain, timeout: Duration) -> DnsOutcome {
    let mut outcome = DnsOutcome::default();
    let mut errors = Vec::new();

    for seed in seeds {
        let host = if seed.contains(':') {
            seed.clone()
        } else {
            format!("{}:{}", seed, chain.default_port())
        };

        match tokio::time::timeout(timeout, lookup_host(host.clone())).await {
            Ok(Ok(resolved)) => {
                outcome.success = true;
                for addr in resolved {
                    let address = Address::from_socket_addr(addr, chain, false);
                    if address.is_valid() && !outcome.addresses.contains(&address) {
                        outcome.addresses.push(address);
                    }
                }
            }
            Ok(Err(e)) => errors.push(format!("{}: {}", seed, e)),
            Err(_) => errors.push(format!("{}: timed out", seed)),
        }
    }

    if !errors.is_empty() {
        outcome.error = Some(errors.join("; "));
    }
    if seeds.is_empty() {
        outcome.error = Some("no DNS seeds configured".to_string());
    }
    outcome
}

/// Resolve in the background and report to the pool
pub fn spawn_resolve(
    seeds: Vec<String>,
    chain: Chain,
    timeout: Duration,
    events: mpsc::UnboundedSender<PoolEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::debug!("Querying {} DNS seeds", seeds.len());
        let outcome = resolve_seeds(&seeds, chain, timeout).await;
        if let Some(error) = &outcome.error {
            log::warn!("DNS seed query: {}", error);
        }
        log::info!("DNS seeds returned {} addresses", outcome.addresses.len());
        let _ = events.send(PoolEvent::DnsResolved(outcome));
    })
}
