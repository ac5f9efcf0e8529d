//! Stub zones learned from the registry
//!
//! Stub zones are registered below `stub.dns.<domain>`. A service stored at
//! `/<prefix>/<domain>/dns/stub/<reversed zone>/<label>` names one upstream
//! server for `<zone>`; the label only keeps the keys apart. Queries for a
//! stub zone are forwarded to its servers instead of the default upstreams.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;

use crate::config::Config;
use crate::dns::client::UpstreamSet;
use crate::dns::context::ServerContext;
use crate::dns::metrics::STUB_ZONES;
use crate::registry::path::{is_subdomain, normalize_name};
use crate::registry::service::Service;
use crate::registry::Result;

/// EDNS0 local option marking a query forwarded to a stub zone
pub const STUB_MARKER_CODE: u16 = 65011;
pub const STUB_MARKER_VALUE: [u8; 1] = [1];

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(32);
const BACKOFF_JITTER_MS: u64 = 3000;

/// Immutable map from zone to the servers answering for it
#[derive(Debug, Default)]
pub struct StubTable {
    zones: HashMap<String, Arc<UpstreamSet>>,
}

impl StubTable {
    pub fn new() -> StubTable {
        StubTable::default()
    }

    /// Build a table from the services found below `stub.dns.<domain>`
    pub fn from_services(config: &Config, services: &[Service]) -> StubTable {
        let paths = config.paths();
        let suffix = format!(".{}", config.stub_domain());
        let mut servers: HashMap<String, Vec<SocketAddr>> = HashMap::new();

        for service in services {
            let ip = match service.ip() {
                Some(ip) => ip,
                None => {
                    log::warn!(
                        "stub zone entry {} has no address host: {}",
                        service.key,
                        service.host
                    );
                    continue;
                }
            };

            let name = paths.domain(&service.key);
            let zone = match name.strip_suffix(&suffix).and_then(|rest| rest.split_once('.')) {
                Some((_, zone)) if !zone.is_empty() => normalize_name(zone),
                _ => {
                    log::warn!("stub zone entry {} names no zone", service.key);
                    continue;
                }
            };

            if is_subdomain(&zone, &config.domain) {
                log::warn!("ignoring stub zone {} inside {}", zone, config.domain);
                continue;
            }

            let port = if service.port == 0 { 53 } else { service.port };
            servers
                .entry(zone)
                .or_default()
                .push(SocketAddr::new(ip, port));
        }

        let zones = servers
            .into_iter()
            .map(|(zone, addrs)| (zone, Arc::new(UpstreamSet::new(&addrs, config.ns_rotate))))
            .collect();

        StubTable { zones }
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn zones(&self) -> Vec<&str> {
        let mut zones = self.zones.keys().map(|zone| zone.as_str()).collect::<Vec<&str>>();
        zones.sort_unstable();
        zones
    }

    /// The most specific stub zone containing `name`
    pub fn find(&self, name: &str) -> Option<(&str, Arc<UpstreamSet>)> {
        let name = normalize_name(name);
        let mut candidate = name.as_str();

        loop {
            if let Some((zone, servers)) = self.zones.get_key_value(candidate) {
                return Some((zone.as_str(), servers.clone()));
            }

            match candidate.split_once('.') {
                Some((_, parent)) => candidate = parent,
                None => return None,
            }
        }
    }

    /// True if `name` is a strict ancestor of one of the stub zones
    pub fn is_ancestor_of_zone(&self, name: &str) -> bool {
        let name = normalize_name(name);
        self.zones
            .keys()
            .any(|zone| *zone != name && is_subdomain(zone, &name))
    }
}

/// Re-read the stub subtree and swap in the resulting table
pub async fn update_stub_zones(context: &ServerContext) -> Result<usize> {
    let services = match context
        .backend
        .records(&context.config.stub_domain(), false)
        .await
    {
        Ok(services) => services,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => return Err(e),
    };

    let table = StubTable::from_services(&context.config, &services);
    let count = table.len();
    if count > 0 {
        log::info!("stub zones: {}", table.zones().join(", "));
    }

    STUB_ZONES.set(count as i64);
    context.stubs.store(Arc::new(table));

    Ok(count)
}

/// Exponential backoff between failed watch attempts
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}

impl Backoff {
    pub fn new() -> Backoff {
        Backoff {
            current: BACKOFF_START,
        }
    }

    /// The next wait without jitter
    pub fn base(&self) -> Duration {
        self.current
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(BACKOFF_MAX);

        delay + Duration::from_millis(rand::random::<u64>() % (BACKOFF_JITTER_MS + 1))
    }

    pub fn reset(&mut self) {
        self.current = BACKOFF_START;
    }
}

/// Keep the stub table in sync with the registry until shutdown
pub async fn watch_stub_zones(context: Arc<ServerContext>, mut shutdown: broadcast::Receiver<()>) {
    if let Err(e) = update_stub_zones(&context).await {
        log::warn!("initial stub zone read failed: {}", e);
    }

    let mut watcher = context.backend.watch(&context.config.stub_domain());
    let mut backoff = Backoff::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => return,
            event = watcher.next() => event,
        };

        let failure = match event {
            Ok(()) => match update_stub_zones(&context).await {
                Ok(_) => {
                    backoff.reset();
                    continue;
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        let delay = backoff.next_delay();
        log::warn!("stub zone watch failed, retrying in {:?}: {}", delay, failure);

        tokio::select! {
            _ = shutdown.recv() => return,
            _ = sleep(delay) => {}
        }
    }
}
