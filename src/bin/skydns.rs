use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use skydns::config::{parse_duration, parse_nameserver, Config, RegistryOverrides, DEFAULT_SCACHE};
use skydns::dns::context::ServerContext;
use skydns::dns::logging::{init_logging, LoggerConfig};
use skydns::dns::metrics::export_metrics;
use skydns::dns::server::{DnsServer, DnsTcpServer, DnsUdpServer};
use skydns::dns::shutdown::{ShutdownConfig, ShutdownCoordinator};
use skydns::dns::stub::watch_stub_zones;
use skydns::registry::etcd::{validate_endpoints, ClientOptions, EtcdV2Client, EtcdV3Client};
use skydns::registry::flat::FlatBackend;
use skydns::registry::hierarchical::HierarchicalBackend;
use skydns::registry::Backend;

/// DNS server answering for services registered in etcd
#[derive(Parser, Debug)]
#[command(name = "skydns")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Domain to serve
    #[arg(long, env = "SKYDNS_DOMAIN", default_value = "skydns.local.")]
    domain: String,

    /// Address to listen on for UDP and TCP
    #[arg(long, env = "SKYDNS_ADDR", default_value = "127.0.0.1:53")]
    addr: String,

    /// Comma separated upstream nameservers, `ip` or `ip:port`
    #[arg(long, env = "SKYDNS_NAMESERVERS", value_delimiter = ',')]
    nameservers: Vec<String>,

    /// Read and forwarding timeout
    #[arg(long, env = "SKYDNS_RTIMEOUT", default_value = "2s", value_parser = parse_duration)]
    rtimeout: Duration,

    /// Rotate address records in answers
    #[arg(long, env = "SKYDNS_ROUND_ROBIN", default_value_t = true, action = clap::ArgAction::Set)]
    round_robin: bool,

    /// Rotate the upstream nameservers
    #[arg(long, env = "SKYDNS_NSROTATE", default_value_t = true, action = clap::ArgAction::Set)]
    ns_rotate: bool,

    /// Never forward queries
    #[arg(long, env = "SKYDNS_NO_REC")]
    no_rec: bool,

    /// Response cache capacity, 0 disables
    #[arg(long, env = "SKYDNS_RCACHE", default_value_t = 0)]
    rcache: usize,

    /// Longest lifetime of a cached response, in seconds
    #[arg(long, env = "SKYDNS_RCACHE_TTL", default_value_t = 60)]
    rcache_ttl: u32,

    /// Signature cache capacity, 0 disables
    #[arg(long, env = "SKYDNS_SCACHE", default_value_t = DEFAULT_SCACHE)]
    scache: usize,

    /// Base name of the BIND key pair to sign with
    #[arg(long, env = "SKYDNS_DNSSEC")]
    dnssec: Option<String>,

    /// Names with fewer labels are not forwarded
    #[arg(long, env = "SKYDNS_NDOTS", default_value_t = 2)]
    ndots: usize,

    /// Hostmaster mailbox for the SOA record
    #[arg(long, env = "SKYDNS_HOSTMASTER", default_value = "")]
    hostmaster: String,

    /// Name answered for local.dns.<domain>
    #[arg(long, env = "SKYDNS_LOCAL")]
    local: Option<String>,

    /// Registry path prefix
    #[arg(long, env = "SKYDNS_PATH_PREFIX", default_value = "skydns")]
    path_prefix: String,

    /// Learn stub zones from the registry
    #[arg(long = "stubzones", env = "SKYDNS_STUBZONES")]
    stub_zones: bool,

    /// Log every query
    #[arg(long, env = "SKYDNS_VERBOSE")]
    verbose: bool,

    /// Log in JSON
    #[arg(long, env = "SKYDNS_LOG_JSON")]
    log_json: bool,

    /// Comma separated registry endpoints
    #[arg(
        long,
        env = "ETCD_MACHINES",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379"
    )]
    machines: Vec<String>,

    /// Client certificate for the registry
    #[arg(long, env = "ETCD_TLSPEM")]
    tls_pem: Option<PathBuf>,

    /// Client key for the registry
    #[arg(long, env = "ETCD_TLSKEY")]
    tls_key: Option<PathBuf>,

    /// CA certificate for the registry
    #[arg(long, env = "ETCD_CACERT")]
    ca_cert: Option<PathBuf>,

    #[arg(long, env = "ETCD_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "ETCD_PASSWORD")]
    password: Option<String>,

    /// Use the flat etcd v3 key space
    #[arg(long, env = "SKYDNS_ETCD3")]
    etcd3: bool,

    /// Queries handled concurrently, 0 for no limit
    #[arg(long, env = "SKYDNS_MAX_CONCURRENT_QUERIES", default_value_t = 0)]
    max_concurrent_queries: usize,

    /// How far back signatures are valid
    #[arg(long, env = "SKYDNS_SIG_INCEPTION", default_value = "3h", value_parser = parse_duration)]
    sig_inception: Duration,

    /// How long signatures stay valid
    #[arg(long, env = "SKYDNS_SIG_EXPIRATION", default_value = "7d", value_parser = parse_duration)]
    sig_expiration: Duration,
}

impl Cli {
    fn config(&self) -> Result<Config, String> {
        let nameservers = self
            .nameservers
            .iter()
            .filter(|ns| !ns.is_empty())
            .map(|ns| parse_nameserver(ns).map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, String>>()?;

        Ok(Config {
            dns_addr: self.addr.clone(),
            domain: self.domain.clone(),
            dnssec: self.dnssec.clone(),
            round_robin: self.round_robin,
            ns_rotate: self.ns_rotate,
            nameservers,
            read_timeout: self.rtimeout,
            hostmaster: self.hostmaster.clone(),
            verbose: self.verbose,
            scache: self.scache,
            rcache: self.rcache,
            rcache_ttl: self.rcache_ttl,
            ndots: self.ndots,
            no_rec: self.no_rec,
            local: self.local.clone(),
            path_prefix: self.path_prefix.clone(),
            stub_zones: self.stub_zones,
            max_concurrent_queries: self.max_concurrent_queries,
            sig_inception: self.sig_inception,
            sig_expiration: self.sig_expiration,
            ..Config::default()
        })
    }

    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            endpoints: self.machines.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            ca_cert: self.ca_cert.clone(),
            tls_cert: self.tls_pem.clone(),
            tls_key: self.tls_key.clone(),
            timeout: self.rtimeout,
        }
    }
}

fn fatal(message: String) -> ! {
    log::error!("{}", message);
    process::exit(1);
}

/// Merge the configuration blob stored in the registry. A missing or
/// unreadable blob leaves the configuration alone.
fn apply_registry_config(config: &mut Config, blob: Option<Vec<u8>>) {
    let blob = match blob {
        Some(blob) => blob,
        None => {
            log::info!("no configuration found at {}", config.config_key());
            return;
        }
    };

    let result = RegistryOverrides::from_slice(&blob)
        .and_then(|overrides| config.apply_overrides(overrides));
    if let Err(e) = result {
        log::warn!("ignoring configuration at {}: {}", config.config_key(), e);
    }
}

/// Connect to the registry, read its configuration blob and build the
/// backend matching the key space
async fn connect_registry(cli: &Cli, config: &mut Config) -> Result<Arc<dyn Backend>, String> {
    validate_endpoints(&cli.machines)?;
    let options = cli.client_options();

    if cli.etcd3 {
        let client = Arc::new(EtcdV3Client::new(options).map_err(|e| e.to_string())?);
        match client.value(&config.config_key()).await {
            Ok(blob) => apply_registry_config(config, blob),
            Err(e) => log::warn!("unable to read configuration: {}", e),
        }
        config.set_defaults();

        Ok(Arc::new(FlatBackend::new(client, config.backend_config())))
    } else {
        let client = Arc::new(EtcdV2Client::new(options).map_err(|e| e.to_string())?);
        match client.value(&config.config_key()).await {
            Ok(blob) => apply_registry_config(config, blob.map(String::into_bytes)),
            Err(e) => log::warn!("unable to read configuration: {}", e),
        }
        config.set_defaults();

        Ok(Arc::new(HierarchicalBackend::new(client, config.backend_config())))
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            log::warn!("unable to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => log::info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => log::info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("received Ctrl+C");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(&LoggerConfig {
        verbose: cli.verbose,
        json_format: cli.log_json,
    });

    let mut config = cli.config().unwrap_or_else(|e| fatal(e));
    let backend = connect_registry(&cli, &mut config)
        .await
        .unwrap_or_else(|e| fatal(format!("registry: {}", e)));

    if let Err(e) = config.validate() {
        fatal(format!("configuration: {}", e));
    }

    log::info!(
        "skydns {} serving {} on {}, {} upstream nameservers",
        env!("CARGO_PKG_VERSION"),
        config.domain,
        config.dns_addr,
        config.nameservers.len()
    );

    let context = match ServerContext::new(config, backend) {
        Ok(context) => Arc::new(context),
        Err(e) => fatal(format!("unable to start: {}", e)),
    };
    if let Some(ref signer) = context.signer {
        log::info!("signing {} with key tag {}", signer.zone(), signer.key_tag());
    }

    let shutdown = Arc::new(ShutdownCoordinator::new(ShutdownConfig {
        query_timeout: context.config.read_timeout * 2,
        ..ShutdownConfig::default()
    }));

    let udp_server = DnsUdpServer::bind(context.clone(), shutdown.clone())
        .await
        .unwrap_or_else(|e| fatal(format!("udp listener: {}", e)));
    let tcp_server = DnsTcpServer::bind(context.clone(), shutdown.clone())
        .await
        .unwrap_or_else(|e| fatal(format!("tcp listener: {}", e)));

    let udp_task = tokio::spawn(udp_server.run_server());
    let tcp_task = tokio::spawn(tcp_server.run_server());

    if context.config.stub_zones {
        tokio::spawn(watch_stub_zones(context.clone(), shutdown.subscribe()));
    }

    wait_for_signal().await;

    if let Err(e) = shutdown.shutdown().await {
        log::error!("shutdown: {}", e);
    }

    for task in vec![udp_task, tcp_task] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("listener failed: {}", e),
            Err(e) => log::error!("listener task failed: {}", e),
        }
    }

    match export_metrics() {
        Ok(metrics) => log::debug!("final metrics:\n{}", metrics),
        Err(e) => log::warn!("unable to export metrics: {}", e),
    }
}
