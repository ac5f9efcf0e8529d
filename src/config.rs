//! Server configuration
//!
//! A `Config` is assembled by the binary from command line flags, merged with
//! the optional JSON blob stored in the registry, normalized by
//! `set_defaults` and checked by `validate`. After that it is frozen and
//! shared behind an `Arc`.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use derive_more::{Display, Error, From};
use serde::Deserialize;

use crate::registry::path::{normalize_name, PathMapper, DEFAULT_PREFIX};
use crate::registry::BackendConfig;

#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
    #[display(fmt = "invalid bind address: {}", _0)]
    #[from(ignore)]
    InvalidAddress(#[error(not(source))] String),
    #[display(fmt = "invalid nameserver: {}", _0)]
    #[from(ignore)]
    InvalidNameserver(#[error(not(source))] String),
    #[display(fmt = "invalid domain: {}", _0)]
    #[from(ignore)]
    InvalidDomain(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, ConfigError>;

pub const DEFAULT_DOMAIN: &str = "skydns.local";
pub const DEFAULT_ADDR: &str = "127.0.0.1:53";
pub const DEFAULT_TTL: u32 = 3600;
pub const DEFAULT_MIN_TTL: u32 = 60;
pub const DEFAULT_PRIORITY: u16 = 10;
pub const DEFAULT_RCACHE_TTL: u32 = 60;
pub const DEFAULT_SCACHE: usize = 10_000;
pub const DEFAULT_NDOTS: usize = 2;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SIG_INCEPTION: Duration = Duration::from_secs(3 * 3600);
pub const DEFAULT_SIG_EXPIRATION: Duration = Duration::from_secs(7 * 24 * 3600);
pub const DEFAULT_SIG_SKEW: Duration = Duration::from_secs(24 * 3600);

const RESOLV_CONF: &str = "/etc/resolv.conf";

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Address the UDP and TCP listeners bind to
    pub dns_addr: String,

    /// Zone the server is authoritative for, lowercase without trailing dot
    pub domain: String,

    /// Base name of the BIND key pair used for signing, if any
    pub dnssec: Option<String>,

    pub round_robin: bool,
    pub ns_rotate: bool,
    pub nameservers: Vec<SocketAddr>,
    pub read_timeout: Duration,

    /// Default TTL for records without one
    pub ttl: u32,

    /// TTL of negative answers and SOA minimum
    pub min_ttl: u32,

    pub hostmaster: String,

    /// Default SRV/MX priority for services storing 0
    pub priority: u16,

    pub verbose: bool,

    /// Signature cache capacity, 0 disables
    pub scache: usize,

    /// Response cache capacity, 0 disables
    pub rcache: usize,

    /// Upper bound on response cache lifetimes
    pub rcache_ttl: u32,

    /// Names with fewer labels are never forwarded
    pub ndots: usize,

    /// Disable forwarding entirely
    pub no_rec: bool,

    /// Name answered for `local.dns.<domain>`
    pub local: Option<String>,

    pub path_prefix: String,
    pub stub_zones: bool,

    /// Queries handled concurrently, 0 for no limit
    pub max_concurrent_queries: usize,

    pub sig_inception: Duration,
    pub sig_expiration: Duration,
    pub sig_skew: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dns_addr: DEFAULT_ADDR.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            dnssec: None,
            round_robin: true,
            ns_rotate: true,
            nameservers: Vec::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            ttl: DEFAULT_TTL,
            min_ttl: DEFAULT_MIN_TTL,
            hostmaster: format!("hostmaster.{}", DEFAULT_DOMAIN),
            priority: DEFAULT_PRIORITY,
            verbose: false,
            scache: DEFAULT_SCACHE,
            rcache: 0,
            rcache_ttl: DEFAULT_RCACHE_TTL,
            ndots: DEFAULT_NDOTS,
            no_rec: false,
            local: None,
            path_prefix: DEFAULT_PREFIX.to_string(),
            stub_zones: false,
            max_concurrent_queries: 0,
            sig_inception: DEFAULT_SIG_INCEPTION,
            sig_expiration: DEFAULT_SIG_EXPIRATION,
            sig_skew: DEFAULT_SIG_SKEW,
        }
    }
}

impl Config {
    /// Normalize names and replace unset values with defaults. When no
    /// nameservers are configured and recursion is enabled, the system
    /// resolver configuration is consulted.
    pub fn set_defaults(&mut self) {
        self.domain = normalize_name(&self.domain);
        if self.domain.is_empty() {
            self.domain = DEFAULT_DOMAIN.to_string();
        }

        if self.dns_addr.is_empty() {
            self.dns_addr = DEFAULT_ADDR.to_string();
        }

        if self.hostmaster.is_empty() {
            self.hostmaster = format!("hostmaster.{}", self.domain);
        }
        self.hostmaster = normalize_name(&self.hostmaster.replacen('@', ".", 1));

        if self.ttl == 0 {
            self.ttl = DEFAULT_TTL;
        }
        if self.min_ttl == 0 {
            self.min_ttl = DEFAULT_MIN_TTL;
        }
        if self.priority == 0 {
            self.priority = DEFAULT_PRIORITY;
        }
        if self.rcache_ttl == 0 {
            self.rcache_ttl = DEFAULT_RCACHE_TTL;
        }
        if self.read_timeout.is_zero() {
            self.read_timeout = DEFAULT_READ_TIMEOUT;
        }
        if self.sig_inception.is_zero() {
            self.sig_inception = DEFAULT_SIG_INCEPTION;
        }
        if self.sig_expiration.is_zero() {
            self.sig_expiration = DEFAULT_SIG_EXPIRATION;
        }

        self.path_prefix = self.path_prefix.trim_matches('/').to_string();
        if self.path_prefix.is_empty() {
            self.path_prefix = DEFAULT_PREFIX.to_string();
        }

        self.local = self
            .local
            .take()
            .map(|local| normalize_name(&local))
            .filter(|local| !local.is_empty());

        if self.nameservers.is_empty() && !self.no_rec {
            match fs::read_to_string(RESOLV_CONF) {
                Ok(contents) => self.nameservers = parse_resolv_conf(&contents),
                Err(e) => log::warn!("unable to read {}: {}", RESOLV_CONF, e),
            }
        }
    }

    /// Check the values a server can not start with
    pub fn validate(&self) -> Result<()> {
        validate_bind_addr(&self.dns_addr)?;

        if self.domain.split('.').any(|label| label.is_empty() || label.len() > 63) {
            return Err(ConfigError::InvalidDomain(self.domain.clone()));
        }

        for nameserver in &self.nameservers {
            if nameserver.port() == 0 {
                return Err(ConfigError::InvalidNameserver(nameserver.to_string()));
            }
        }

        Ok(())
    }

    pub fn paths(&self) -> PathMapper {
        PathMapper::new(&self.path_prefix)
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            paths: self.paths(),
            ttl: self.ttl,
            priority: self.priority,
        }
    }

    /// `dns.<domain>`, home of the NS records
    pub fn dns_domain(&self) -> String {
        format!("dns.{}", self.domain)
    }

    /// `local.dns.<domain>`, an alias for the configured local name
    pub fn local_domain(&self) -> String {
        format!("local.dns.{}", self.domain)
    }

    /// `stub.dns.<domain>`, where stub zones are registered
    pub fn stub_domain(&self) -> String {
        format!("stub.dns.{}", self.domain)
    }

    /// Registry key of the configuration blob
    pub fn config_key(&self) -> String {
        format!("/{}/config", self.path_prefix)
    }

    pub fn apply_overrides(&mut self, overrides: RegistryOverrides) -> Result<()> {
        if let Some(domain) = overrides.domain {
            self.domain = domain;
        }
        if let Some(dns_addr) = overrides.dns_addr {
            self.dns_addr = dns_addr;
        }
        if let Some(ttl) = overrides.ttl {
            self.ttl = ttl;
        }
        if let Some(min_ttl) = overrides.min_ttl {
            self.min_ttl = min_ttl;
        }
        if let Some(priority) = overrides.priority {
            self.priority = priority;
        }
        if let Some(hostmaster) = overrides.hostmaster {
            self.hostmaster = hostmaster;
        }
        if let Some(ndots) = overrides.ndots {
            self.ndots = ndots;
        }
        if let Some(no_rec) = overrides.no_rec {
            self.no_rec = no_rec;
        }
        if let Some(round_robin) = overrides.round_robin {
            self.round_robin = round_robin;
        }
        if let Some(ns_rotate) = overrides.ns_rotate {
            self.ns_rotate = ns_rotate;
        }
        if let Some(rcache) = overrides.rcache {
            self.rcache = rcache;
        }
        if let Some(rcache_ttl) = overrides.rcache_ttl {
            self.rcache_ttl = rcache_ttl;
        }
        if let Some(scache) = overrides.scache {
            self.scache = scache;
        }
        if let Some(dnssec) = overrides.dnssec {
            self.dnssec = Some(dnssec);
        }
        if let Some(local) = overrides.local {
            self.local = Some(local);
        }
        if let Some(nameservers) = overrides.nameservers {
            self.nameservers = nameservers
                .iter()
                .map(|nameserver| parse_nameserver(nameserver))
                .collect::<Result<Vec<SocketAddr>>>()?;
        }

        Ok(())
    }
}

/// Settings read from `/<prefix>/config` in the registry. Every field is
/// optional and overrides the command line value when present.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RegistryOverrides {
    pub domain: Option<String>,
    #[serde(alias = "dns-addr")]
    pub dns_addr: Option<String>,
    pub ttl: Option<u32>,
    #[serde(rename = "minttl", alias = "min_ttl")]
    pub min_ttl: Option<u32>,
    pub priority: Option<u16>,
    pub hostmaster: Option<String>,
    #[serde(alias = "ndot")]
    pub ndots: Option<usize>,
    #[serde(rename = "no-rec", alias = "no_rec")]
    pub no_rec: Option<bool>,
    #[serde(rename = "round-robin", alias = "round_robin")]
    pub round_robin: Option<bool>,
    #[serde(rename = "ns-rotate", alias = "ns_rotate")]
    pub ns_rotate: Option<bool>,
    pub nameservers: Option<Vec<String>>,
    pub rcache: Option<usize>,
    #[serde(rename = "rcache-ttl", alias = "rcache_ttl")]
    pub rcache_ttl: Option<u32>,
    pub scache: Option<usize>,
    pub dnssec: Option<String>,
    pub local: Option<String>,
}

impl RegistryOverrides {
    pub fn from_slice(data: &[u8]) -> Result<RegistryOverrides> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Parse a bind address: an IP literal and a port in 1..=65535
pub fn validate_bind_addr(addr: &str) -> Result<SocketAddr> {
    match addr.parse::<SocketAddr>() {
        Ok(parsed) if parsed.port() != 0 => Ok(parsed),
        _ => Err(ConfigError::InvalidAddress(addr.to_string())),
    }
}

/// Parse an upstream nameserver, `ip` or `ip:port`, defaulting to port 53
pub fn parse_nameserver(nameserver: &str) -> Result<SocketAddr> {
    if let Ok(addr) = nameserver.parse::<SocketAddr>() {
        if addr.port() == 0 {
            return Err(ConfigError::InvalidNameserver(nameserver.to_string()));
        }
        return Ok(addr);
    }

    let ip = nameserver
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map_err(|_| ConfigError::InvalidNameserver(nameserver.to_string()))?;

    Ok(SocketAddr::new(ip, 53))
}

/// Nameserver entries of a resolv.conf, all on port 53
pub fn parse_resolv_conf(contents: &str) -> Vec<SocketAddr> {
    contents
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(address)) => {
                    // Drop an IPv6 zone index such as fe80::1%eth0
                    let address = address.split('%').next().unwrap_or(address);
                    address.parse::<IpAddr>().ok()
                }
                _ => None,
            }
        })
        .map(|ip| SocketAddr::new(ip, 53))
        .collect()
}

/// Parse a duration such as `2s`, `500ms`, `3h` or `7d`. A bare number is
/// taken as seconds.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| text.len());
    let (number, unit) = text.split_at(split);

    let value = number
        .parse::<u64>()
        .map_err(|_| format!("invalid duration: {}", text))?;

    let duration = match unit {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        "d" => Duration::from_secs(value * 24 * 3600),
        _ => return Err(format!("invalid duration unit: {}", text)),
    };

    Ok(duration)
}
