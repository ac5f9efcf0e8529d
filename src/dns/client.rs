//! client for forwarding DNS queries to upstream servers
//!
//! Queries go out over UDP first, sized to what the client advertised, and
//! are repeated over TCP against the same upstream when the answer comes
//! back truncated. Upstreams that keep failing are moved to the back of the
//! line until one of their queries succeeds again.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::dns::metrics::record_upstream_query;
use crate::dns::netutil::{read_frame, write_frame};
use crate::dns::protocol::{DnsPacket, DnsQuestion, ProtocolError, QueryType, ResultCode};

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(ProtocolError),
    Io(std::io::Error),
    TimeOut,
    NoUpstreams,
    AllUpstreamsFailed,
    #[display(fmt = "upstream answered with {:?}", _0)]
    #[from(ignore)]
    LookupFailed(#[error(not(source))] ResultCode),
    #[display(fmt = "upstream reply does not match the query")]
    Mismatch,
}

type Result<T> = std::result::Result<T, ClientError>;

/// Consecutive failures after which an upstream is only tried last
pub const FAILURE_THRESHOLD: u32 = 3;

/// UDP payload size assumed when the client did not advertise one
pub const DEFAULT_UDP_SIZE: usize = 4096;

const MIN_UDP_SIZE: usize = 512;

#[derive(Debug)]
pub struct Upstream {
    addr: SocketAddr,
    failures: AtomicU32,
}

impl Upstream {
    pub fn new(addr: SocketAddr) -> Upstream {
        Upstream {
            addr,
            failures: AtomicU32::new(0),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.failures() < FAILURE_THRESHOLD
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }
}

/// An ordered list of upstream servers with a rotation cursor
#[derive(Debug)]
pub struct UpstreamSet {
    upstreams: Vec<Arc<Upstream>>,
    cursor: AtomicUsize,
    rotate: bool,
}

impl UpstreamSet {
    pub fn new(addrs: &[SocketAddr], rotate: bool) -> UpstreamSet {
        UpstreamSet {
            upstreams: addrs.iter().map(|addr| Arc::new(Upstream::new(*addr))).collect(),
            cursor: AtomicUsize::new(0),
            rotate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn upstreams(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    /// The order in which upstreams are tried for one query: starting at
    /// the cursor when rotating, healthy servers ahead of failing ones
    pub fn order(&self) -> Vec<Arc<Upstream>> {
        if self.upstreams.is_empty() {
            return Vec::new();
        }

        let start = if self.rotate {
            self.cursor.fetch_add(1, Ordering::Relaxed) % self.upstreams.len()
        } else {
            0
        };

        let rotated = self.upstreams[start..]
            .iter()
            .chain(self.upstreams[..start].iter())
            .cloned();

        let (healthy, failing): (Vec<Arc<Upstream>>, Vec<Arc<Upstream>>) =
            rotated.partition(|upstream| upstream.is_healthy());

        healthy.into_iter().chain(failing.into_iter()).collect()
    }
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn same_question(query: &DnsPacket, reply: &DnsPacket) -> bool {
    if query.questions.len() != reply.questions.len() {
        return false;
    }

    query
        .questions
        .iter()
        .zip(reply.questions.iter())
        .all(|(q, r)| q.qtype == r.qtype && q.name.eq_ignore_ascii_case(&r.name))
}

/// Sends queries to upstream servers
#[derive(Clone, Debug)]
pub struct Forwarder {
    timeout: Duration,
}

impl Forwarder {
    /// A forwarder that gives up once `timeout` has passed for all
    /// upstreams together
    pub fn new(timeout: Duration) -> Forwarder {
        Forwarder { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn exchange_udp(&self, addr: SocketAddr, query: &mut DnsPacket) -> Result<DnsPacket> {
        let size = match query.edns() {
            Some(edns) => (edns.payload_size as usize).max(MIN_UDP_SIZE),
            None => DEFAULT_UDP_SIZE,
        };

        let socket = UdpSocket::bind(unspecified_for(&addr)).await?;
        socket.connect(addr).await?;
        socket.send(&query.to_bytes(0xFFFF)?).await?;

        let mut buf = vec![0; size];
        loop {
            let len = socket.recv(&mut buf).await?;
            let reply = match DnsPacket::from_bytes(&buf[..len]) {
                Ok(reply) => reply,
                Err(e) => {
                    log::debug!("discarding undecodable reply from {}: {}", addr, e);
                    continue;
                }
            };

            if reply.header.id == query.header.id && same_question(query, &reply) {
                return Ok(reply);
            }

            log::debug!("discarding unrelated reply from {}", addr);
        }
    }

    async fn exchange_tcp(&self, addr: SocketAddr, query: &mut DnsPacket) -> Result<DnsPacket> {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, &query.to_bytes(0xFFFF)?).await?;

        let data = read_frame(&mut stream).await?;
        let reply = DnsPacket::from_bytes(&data)?;

        if reply.header.id != query.header.id || !same_question(query, &reply) {
            return Err(ClientError::Mismatch);
        }

        Ok(reply)
    }

    /// One attempt against one upstream: UDP, then TCP when truncated
    async fn exchange_once(
        &self,
        addr: SocketAddr,
        request: &DnsPacket,
        budget: Duration,
    ) -> Result<DnsPacket> {
        let mut query = request.clone();
        query.header.id = rand::random::<u16>();

        let attempt = async {
            let reply = self.exchange_udp(addr, &mut query).await?;
            if !reply.header.truncated_message {
                return Ok(reply);
            }

            log::debug!("truncated reply from {}, retrying over tcp", addr);
            self.exchange_tcp(addr, &mut query).await
        };

        match timeout(budget, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::TimeOut),
        }
    }

    /// Query one upstream, giving a SERVFAIL answer one second chance
    /// within the same budget
    async fn exchange_with(
        &self,
        addr: SocketAddr,
        request: &DnsPacket,
        budget: Duration,
    ) -> Result<DnsPacket> {
        let start = Instant::now();
        let reply = self.exchange_once(addr, request, budget).await?;
        if reply.header.rescode != ResultCode::SERVFAIL {
            return Ok(reply);
        }

        let remaining = budget.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Ok(reply);
        }

        log::debug!("SERVFAIL from {}, retrying once", addr);
        match self.exchange_once(addr, request, remaining).await {
            Ok(retry) => Ok(retry),
            Err(_) => Ok(reply),
        }
    }

    /// Forward `request` to the upstreams of `set` in turn until one of them
    /// answers. The reply carries the id of `request`. The whole exchange
    /// fits in the forwarder timeout: each upstream gets an equal share of
    /// what is left when its turn comes.
    pub async fn exchange(&self, set: &UpstreamSet, request: &DnsPacket) -> Result<DnsPacket> {
        if set.is_empty() {
            return Err(ClientError::NoUpstreams);
        }

        let deadline = Instant::now() + self.timeout;
        let order = set.order();
        let count = order.len();

        for (i, upstream) in order.into_iter().enumerate() {
            let start = Instant::now();
            let remaining = deadline.saturating_duration_since(start);
            if remaining.is_zero() {
                log::warn!("forwarding deadline reached after {} of {} upstreams", i, count);
                break;
            }
            let budget = remaining / (count - i) as u32;

            let addr = upstream.addr();
            let label = addr.to_string();

            match self.exchange_with(addr, request, budget).await {
                Ok(mut reply) => {
                    upstream.record_success();
                    record_upstream_query(&label, "success", start.elapsed());

                    reply.header.id = request.header.id;
                    return Ok(reply);
                }
                Err(e) => {
                    upstream.record_failure();
                    let status = match e {
                        ClientError::TimeOut => "timeout",
                        _ => "error",
                    };
                    record_upstream_query(&label, status, start.elapsed());

                    log::warn!("upstream {} failed: {}", addr, e);
                }
            }
        }

        Err(ClientError::AllUpstreamsFailed)
    }

    /// Resolve `name` through the upstreams. Only NOERROR answers count as
    /// a successful lookup.
    pub async fn lookup(
        &self,
        set: &UpstreamSet,
        name: &str,
        qtype: QueryType,
        dnssec: bool,
    ) -> Result<DnsPacket> {
        let mut request = DnsPacket::new();
        request.header.id = rand::random::<u16>();
        request.header.recursion_desired = true;
        request
            .questions
            .push(DnsQuestion::new(name.trim_end_matches('.').to_string(), qtype));
        if dnssec {
            request.set_edns(DEFAULT_UDP_SIZE as u16, true);
        }

        let reply = self.exchange(set, &request).await?;
        if reply.header.rescode != ResultCode::NOERROR {
            return Err(ClientError::LookupFailed(reply.header.rescode));
        }

        Ok(reply)
    }
}

#[cfg(test)]
pub mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::dns::protocol::{DnsRecord, TransientTtl};

    /// Answer `A` queries with `addr`, optionally truncated over UDP
    pub async fn fake_upstream(
        addr: Ipv4Addr,
        truncate_udp: bool,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        let listener = TcpListener::bind(local).await.unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let answer = move |query: &DnsPacket| {
            let mut reply = DnsPacket::reply_to(query);
            reply.header.recursion_available = true;
            reply.answers.push(DnsRecord::A {
                domain: query.questions[0].name.clone(),
                addr,
                ttl: TransientTtl(300),
            });
            reply
        };

        let udp_seen = seen.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                udp_seen.fetch_add(1, Ordering::SeqCst);
                let query = DnsPacket::from_bytes(&buf[..len]).unwrap();
                let mut reply = answer(&query);
                if truncate_udp {
                    reply.answers.clear();
                    reply.header.truncated_message = true;
                }
                let _ = socket.send_to(&reply.to_bytes(512).unwrap(), peer).await;
            }
        });

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let data = read_frame(&mut stream).await.unwrap();
                let query = DnsPacket::from_bytes(&data).unwrap();
                let mut reply = answer(&query);
                write_frame(&mut stream, &reply.to_bytes(0xFFFF).unwrap())
                    .await
                    .unwrap();
            }
        });

        (local, seen)
    }

    fn query(name: &str) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = 4242;
        packet.header.recursion_desired = true;
        packet
            .questions
            .push(DnsQuestion::new(name.to_string(), QueryType::A));
        packet
    }

    fn addrs(n: u16) -> Vec<SocketAddr> {
        (1..=n)
            .map(|i| SocketAddr::from(([10, 0, 0, i as u8], 53)))
            .collect()
    }

    #[test]
    fn test_order_rotates() {
        let set = UpstreamSet::new(&addrs(3), true);

        let firsts = (0..3).map(|_| set.order()[0].addr()).collect::<Vec<_>>();
        assert_eq!(addrs(3), firsts);
    }

    #[test]
    fn test_order_is_strict_without_rotation() {
        let set = UpstreamSet::new(&addrs(3), false);

        for _ in 0..3 {
            let order = set.order().iter().map(|u| u.addr()).collect::<Vec<_>>();
            assert_eq!(addrs(3), order);
        }
    }

    #[test]
    fn test_failing_upstreams_go_last() {
        let set = UpstreamSet::new(&addrs(3), false);
        for _ in 0..FAILURE_THRESHOLD {
            set.upstreams()[0].record_failure();
        }

        let order = set.order().iter().map(|u| u.addr()).collect::<Vec<_>>();
        assert_eq!(vec![addrs(3)[1], addrs(3)[2], addrs(3)[0]], order);

        set.upstreams()[0].record_success();
        assert_eq!(addrs(3)[0], set.order()[0].addr());
    }

    #[tokio::test]
    async fn test_exchange_restores_id() {
        let (upstream, seen) = fake_upstream(Ipv4Addr::new(93, 184, 216, 34), false).await;
        let set = UpstreamSet::new(&[upstream], false);
        let forwarder = Forwarder::new(Duration::from_secs(2));

        let reply = forwarder.exchange(&set, &query("example.com")).await.unwrap();

        assert_eq!(4242, reply.header.id);
        assert!(reply.header.recursion_available);
        assert_eq!(1, reply.answers.len());
        assert_eq!(1, seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_truncated_reply_retries_over_tcp() {
        let (upstream, _) = fake_upstream(Ipv4Addr::new(10, 1, 1, 1), true).await;
        let set = UpstreamSet::new(&[upstream], false);
        let forwarder = Forwarder::new(Duration::from_secs(2));

        let reply = forwarder.exchange(&set, &query("big.example.com")).await.unwrap();

        assert!(!reply.header.truncated_message);
        assert_eq!(1, reply.answers.len());
    }

    #[tokio::test]
    async fn test_failover_to_next_upstream() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (upstream, _) = fake_upstream(Ipv4Addr::new(10, 2, 2, 2), false).await;
        let set = UpstreamSet::new(&[silent.local_addr().unwrap(), upstream], false);
        let forwarder = Forwarder::new(Duration::from_millis(200));

        let reply = forwarder.exchange(&set, &query("example.com")).await.unwrap();

        assert_eq!(1, reply.answers.len());
        assert_eq!(1, set.upstreams()[0].failures());
        assert_eq!(0, set.upstreams()[1].failures());
    }

    #[tokio::test]
    async fn test_all_upstreams_failing() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let set = UpstreamSet::new(&[silent.local_addr().unwrap()], false);
        let forwarder = Forwarder::new(Duration::from_millis(100));

        let err = forwarder.exchange(&set, &query("example.com")).await.unwrap_err();
        assert!(matches!(err, ClientError::AllUpstreamsFailed));

        let empty = UpstreamSet::new(&[], false);
        let err = forwarder.exchange(&empty, &query("example.com")).await.unwrap_err();
        assert!(matches!(err, ClientError::NoUpstreams));
    }

    #[tokio::test]
    async fn test_lookup() {
        let (upstream, _) = fake_upstream(Ipv4Addr::new(10, 3, 3, 3), false).await;
        let set = UpstreamSet::new(&[upstream], false);
        let forwarder = Forwarder::new(Duration::from_secs(2));

        let reply = forwarder
            .lookup(&set, "target.example.com.", QueryType::A, false)
            .await
            .unwrap();
        assert_eq!("target.example.com", reply.questions[0].name);
    }
}
