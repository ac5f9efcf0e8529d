//! The `ServerContext` holds the common state across the server

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use derive_more::{Display, Error, From};
use tokio::sync::Semaphore;

use crate::config::{Config, ConfigError};
use crate::dns::cache::ResponseCache;
use crate::dns::client::{Forwarder, UpstreamSet};
use crate::dns::dnssec::{DnssecError, SignerConfig, ZoneSigner};
use crate::dns::protocol::{DnsRecord, TransientTtl};
use crate::dns::sigcache::SignatureCache;
use crate::dns::stub::StubTable;
use crate::registry::path::{is_subdomain, PathMapper};
use crate::registry::Backend;

#[derive(Debug, Display, From, Error)]
pub enum ContextError {
    Config(ConfigError),
    Dnssec(DnssecError),
}

type Result<T> = std::result::Result<T, ContextError>;

const SOA_REFRESH: u32 = 28800;
const SOA_RETRY: u32 = 7200;
const SOA_EXPIRE: u32 = 604800;

#[derive(Debug, Default)]
pub struct ServerStatistics {
    pub tcp_query_count: AtomicUsize,
    pub udp_query_count: AtomicUsize,
}

impl ServerStatistics {
    pub fn get_tcp_query_count(&self) -> usize {
        self.tcp_query_count.load(Ordering::Acquire)
    }

    pub fn get_udp_query_count(&self) -> usize {
        self.udp_query_count.load(Ordering::Acquire)
    }
}

/// Shared state of a running server
///
/// The configuration is frozen when the context is built. Everything that
/// changes while serving is either atomic (counters, the stub table) or
/// guarded internally (caches).
pub struct ServerContext {
    pub config: Arc<Config>,
    pub paths: PathMapper,
    pub backend: Arc<dyn Backend>,
    pub cache: ResponseCache,
    pub signer: Option<ZoneSigner>,
    pub forwarder: Forwarder,
    pub upstreams: Arc<UpstreamSet>,
    pub stubs: ArcSwap<StubTable>,
    pub statistics: ServerStatistics,
    pub query_limit: Option<Arc<Semaphore>>,
    round_robin: AtomicUsize,
    serial: AtomicU32,
}

impl ServerContext {
    /// Build the context for `config`, loading the signing key if one is
    /// configured
    pub fn new(config: Config, backend: Arc<dyn Backend>) -> Result<ServerContext> {
        config.validate()?;

        let signer = match config.dnssec {
            Some(ref base) => {
                let signer = ZoneSigner::load(
                    base,
                    SignerConfig {
                        zone: config.domain.clone(),
                        inception: config.sig_inception,
                        expiration: config.sig_expiration,
                        dnskey_ttl: config.ttl,
                    },
                )?;
                Some(signer)
            }
            None => None,
        };

        Ok(ServerContext::with_signer(config, backend, signer))
    }

    pub fn with_signer(
        config: Config,
        backend: Arc<dyn Backend>,
        signer: Option<ZoneSigner>,
    ) -> ServerContext {
        let signer = signer.map(|signer| {
            let cache = SignatureCache::new(config.scache, config.sig_skew.as_secs() as u32);
            signer.with_cache(Arc::new(cache))
        });

        let query_limit = match config.max_concurrent_queries {
            0 => None,
            limit => Some(Arc::new(Semaphore::new(limit))),
        };

        ServerContext {
            paths: config.paths(),
            backend,
            cache: ResponseCache::new(config.rcache, config.rcache_ttl, config.min_ttl),
            signer,
            forwarder: Forwarder::new(config.read_timeout),
            upstreams: Arc::new(UpstreamSet::new(&config.nameservers, config.ns_rotate)),
            stubs: ArcSwap::from_pointee(StubTable::new()),
            statistics: ServerStatistics::default(),
            query_limit,
            round_robin: AtomicUsize::new(0),
            serial: AtomicU32::new(0),
            config: Arc::new(config),
        }
    }

    /// True if `name` lies in the zone this server is authoritative for
    pub fn is_authoritative(&self, name: &str) -> bool {
        is_subdomain(name, &self.config.domain)
    }

    pub fn recursion_available(&self) -> bool {
        !self.config.no_rec
    }

    /// Whether out-of-zone names can be looked up at all
    pub fn can_forward(&self) -> bool {
        self.recursion_available() && !self.upstreams.is_empty()
    }

    /// Upstreams responsible for an out-of-zone name: its stub zone's
    /// servers, or the default nameservers
    pub fn upstreams_for(&self, name: &str) -> Arc<UpstreamSet> {
        match self.stubs.load().find(name) {
            Some((_, servers)) => servers,
            None => self.upstreams.clone(),
        }
    }

    /// Next value of the round-robin counter
    pub fn next_rotation(&self) -> usize {
        self.round_robin.fetch_add(1, Ordering::Relaxed)
    }

    /// SOA serial: the unix time of the current hour, never decreasing
    pub fn soa_serial(&self) -> u32 {
        let now = chrono::Utc::now().timestamp().max(0) as u32;
        let hour = now - now % 3600;

        let previous = self.serial.fetch_max(hour, Ordering::Relaxed);
        previous.max(hour)
    }

    pub fn soa_record(&self) -> DnsRecord {
        let config = &self.config;

        DnsRecord::Soa {
            domain: config.domain.clone(),
            m_name: format!("ns.{}", config.dns_domain()),
            r_name: config.hostmaster.clone(),
            serial: self.soa_serial(),
            refresh: SOA_REFRESH,
            retry: SOA_RETRY,
            expire: SOA_EXPIRE,
            minimum: config.min_ttl,
            ttl: TransientTtl(config.min_ttl),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::registry::hierarchical::HierarchicalBackend;
    use crate::registry::memory::MemoryStore;

    /// A configuration for tests: no upstreams, no resolv.conf lookup
    pub fn test_config() -> Config {
        let mut config = Config::default();
        config.no_rec = true;
        config.set_defaults();
        config.no_rec = false;
        config
    }

    pub fn create_test_context(config: Config, store: Arc<MemoryStore>) -> Arc<ServerContext> {
        let backend = Arc::new(HierarchicalBackend::new(store, config.backend_config()));
        Arc::new(ServerContext::with_signer(config, backend, None))
    }

    #[test]
    fn test_soa_record() {
        let context = create_test_context(test_config(), Arc::new(MemoryStore::new()));

        match context.soa_record() {
            DnsRecord::Soa {
                domain,
                m_name,
                r_name,
                serial,
                minimum,
                ..
            } => {
                assert_eq!("skydns.local", domain);
                assert_eq!("ns.dns.skydns.local", m_name);
                assert_eq!("hostmaster.skydns.local", r_name);
                assert_eq!(0, serial % 3600);
                assert_eq!(60, minimum);
            }
            _ => panic!("expected an SOA record"),
        }
    }

    #[test]
    fn test_serial_never_decreases() {
        let context = create_test_context(test_config(), Arc::new(MemoryStore::new()));
        context.serial.store(u32::MAX - 1, Ordering::Relaxed);

        assert_eq!(u32::MAX - 1, context.soa_serial());
    }

    #[test]
    fn test_is_authoritative() {
        let context = create_test_context(test_config(), Arc::new(MemoryStore::new()));

        assert!(context.is_authoritative("web.skydns.local."));
        assert!(context.is_authoritative("SKYDNS.local"));
        assert!(!context.is_authoritative("example.com"));
        assert!(!context.is_authoritative("local"));
        assert!(!context.can_forward());
    }
}
