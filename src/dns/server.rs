//! UDP and TCP server implementations for DNS

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use derive_more::{Display, Error, From};
use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::dns::answer::{
    is_rotatable, normalize_section, rename_owner, rotate_answers, Synthesizer,
};
use crate::dns::cache::QuestionKey;
use crate::dns::client::UpstreamSet;
use crate::dns::context::ServerContext;
use crate::dns::dnssec::unix_now;
use crate::dns::metrics::QueryTimer;
use crate::dns::netutil::{read_frame, write_frame};
use crate::dns::protocol::{DnsPacket, ProtocolError, QueryType, ResultCode, CLASS_IN};
use crate::dns::shutdown::ShutdownCoordinator;
use crate::dns::stub::{STUB_MARKER_CODE, STUB_MARKER_VALUE};
use crate::record_error;
use crate::registry::path::{count_labels, is_reverse_name, is_subdomain, normalize_name};

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
    Protocol(ProtocolError),
}

type Result<T> = std::result::Result<T, ServerError>;

/// Largest DNS message
pub const MAX_MESSAGE_SIZE: usize = 0xFFFF;

/// UDP payload size for clients without EDNS
pub const MIN_UDP_SIZE: usize = 512;

/// UDP payload size advertised in our own OPT records
pub const ADVERTISED_UDP_SIZE: u16 = 4096;

/// Which path produced a response
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueryKind {
    Local,
    Reverse,
    Stub,
    Forward,
    Cached,
    Rejected,
    Failed,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match *self {
            QueryKind::Local => "local",
            QueryKind::Reverse => "reverse",
            QueryKind::Stub => "stub",
            QueryKind::Forward => "forward",
            QueryKind::Cached => "cached",
            QueryKind::Rejected => "rejected",
            QueryKind::Failed => "failed",
        }
    }
}

/// A response and the path that produced it
#[derive(Clone, Debug)]
pub struct Reply {
    pub packet: DnsPacket,
    pub kind: QueryKind,
}

impl Reply {
    fn new(packet: DnsPacket, kind: QueryKind) -> Reply {
        Reply { packet, kind }
    }
}

/// Common trait for DNS servers
#[async_trait]
pub trait DnsServer {
    /// Serve until the shutdown coordinator fires
    async fn run_server(self) -> Result<()>;
}

/// Reject requests the server never answers. Returns the response code to
/// reply with.
fn validate_request(request: &DnsPacket) -> Option<ResultCode> {
    if request.header.opcode != 0 {
        return Some(ResultCode::NOTIMP);
    }

    if request.questions.len() != 1 {
        return Some(ResultCode::FORMERR);
    }

    let question = &request.questions[0];
    if question.class != CLASS_IN {
        return Some(ResultCode::NOTIMP);
    }

    match question.qtype {
        QueryType::Any => Some(ResultCode::REFUSED),
        QueryType::Axfr | QueryType::Ixfr => Some(ResultCode::NOTIMP),
        _ => None,
    }
}

/// Copy the client's EDNS state onto a response: our payload size and the
/// DO bit of the request
fn echo_edns(request: &DnsPacket, packet: &mut DnsPacket) {
    packet.take_opt();
    if let Some(edns) = request.edns() {
        packet.set_edns(ADVERTISED_UDP_SIZE, edns.dnssec_ok);
    }
}

fn error_response(context: &ServerContext, request: &DnsPacket, rescode: ResultCode) -> DnsPacket {
    let mut packet = DnsPacket::reply_to(request);
    packet.header.rescode = rescode;
    packet.header.recursion_available = context.recursion_available();
    echo_edns(request, &mut packet);
    packet
}

/// Rotate the address records of a locally answered response
fn apply_rotation(context: &ServerContext, packet: &mut DnsPacket) {
    if !context.config.round_robin || !packet.header.authoritative_answer {
        return;
    }

    if is_rotatable(&packet.answers) {
        rotate_answers(&mut packet.answers, context.next_rotation());
    }
}

/// Forward `request` to `upstreams`, answering SERVFAIL when none replies
async fn forward(
    context: &ServerContext,
    request: &DnsPacket,
    upstreams: &UpstreamSet,
    mark_stub: bool,
) -> DnsPacket {
    let mut query = request.clone();
    if mark_stub {
        query.add_edns_option(STUB_MARKER_CODE, &STUB_MARKER_VALUE);
    }

    match context.forwarder.exchange(upstreams, &query).await {
        Ok(mut reply) => {
            reply.header.id = request.header.id;
            reply.questions = request.questions.clone();
            reply.header.authoritative_answer = false;
            reply
        }
        Err(e) => {
            log::warn!("forwarding {} failed: {}", request.questions[0], e);
            record_error!("forwarder", "unanswered");
            let mut packet = DnsPacket::reply_to(request);
            packet.header.rescode = ResultCode::SERVFAIL;
            packet
        }
    }
}

/// Answer a name inside the served zone
async fn answer_local(
    context: &ServerContext,
    request: &DnsPacket,
    name: &str,
    qtype: QueryType,
    dnssec: bool,
) -> DnsPacket {
    let mut synthesizer = Synthesizer::new(context, dnssec);

    let local_alias = match context.config.local {
        Some(ref local) if name == context.config.local_domain() => Some(local.clone()),
        _ => None,
    };

    let answer = match local_alias {
        Some(ref local) => {
            let mut answer = synthesizer.answer(local, qtype).await;
            rename_owner(&mut answer.answers, local, name);
            answer
        }
        None => synthesizer.answer(name, qtype).await,
    };

    let mut packet = DnsPacket::reply_to(request);
    packet.header.rescode = answer.rcode;
    packet.header.authoritative_answer = true;
    packet.answers = answer.answers;
    packet.authorities = answer.authorities;
    packet.resources = answer.additionals;

    normalize_section(&mut packet.answers);
    normalize_section(&mut packet.authorities);
    normalize_section(&mut packet.resources);

    if dnssec {
        if let Some(ref signer) = context.signer {
            if let Err(e) = signer.sign_packet(&mut packet, unix_now()) {
                log::error!("signing {} failed: {}", name, e);
                record_error!("dnssec", "signing");
            }
        }
    }

    packet
}

/// Answer everything outside the served zone
async fn answer_external(context: &ServerContext, request: &DnsPacket, name: &str) -> Reply {
    if !context.recursion_available() {
        return Reply::new(
            error_response(context, request, ResultCode::REFUSED),
            QueryKind::Rejected,
        );
    }

    let guards_zone = is_subdomain(&context.config.domain, name)
        || context.stubs.load().is_ancestor_of_zone(name);
    if guards_zone {
        log::debug!("refusing to forward {}", name);
        return Reply::new(
            error_response(context, request, ResultCode::REFUSED),
            QueryKind::Rejected,
        );
    }

    if count_labels(name) < context.config.ndots || context.upstreams.is_empty() {
        return Reply::new(
            error_response(context, request, ResultCode::SERVFAIL),
            QueryKind::Failed,
        );
    }

    let packet = forward(context, request, &context.upstreams, false).await;
    Reply::new(packet, QueryKind::Forward)
}

/// Classify and answer a validated request. Returns None when the request
/// must not be answered at all.
async fn resolve(context: &ServerContext, request: &DnsPacket) -> Option<Reply> {
    let question = &request.questions[0];
    let name = normalize_name(&question.name);
    let qtype = question.qtype;
    let dnssec = request.dnssec_ok();

    let stub = context.stubs.load().find(&name).map(|(zone, set)| (zone.to_string(), set));
    if let Some((zone, _)) = stub.as_ref() {
        if request.has_edns_option(STUB_MARKER_CODE, &STUB_MARKER_VALUE) {
            log::warn!("dropping looping query for {} in stub zone {}", name, zone);
            record_error!("server", "stub_loop");
            return None;
        }
    }

    let key = QuestionKey::new(&name, qtype, dnssec);
    if let Some(mut packet) = context
        .cache
        .lookup(&key, request.header.id, context.recursion_available())
    {
        packet.questions = request.questions.clone();
        packet.header.recursion_desired = request.header.recursion_desired;
        return Some(Reply::new(packet, QueryKind::Cached));
    }

    let reply = if context.is_authoritative(&name) {
        let packet = answer_local(context, request, &name, qtype, dnssec).await;
        Reply::new(packet, QueryKind::Local)
    } else if let Some((_, upstreams)) = stub {
        let packet = forward(context, request, &upstreams, true).await;
        Reply::new(packet, QueryKind::Stub)
    } else if is_reverse_name(&name) && qtype == QueryType::Ptr {
        match Synthesizer::new(context, dnssec).reverse(&name).await {
            Ok(answer) => {
                let mut packet = DnsPacket::reply_to(request);
                packet.header.authoritative_answer = true;
                packet.answers = answer.answers;
                Reply::new(packet, QueryKind::Reverse)
            }
            Err(e) if e.is_not_found() && context.can_forward() => {
                let packet = forward(context, request, &context.upstreams, false).await;
                Reply::new(packet, QueryKind::Forward)
            }
            Err(e) => {
                log::debug!("reverse lookup of {} failed: {}", name, e);
                let rcode = e.rcode();
                Reply::new(error_response(context, request, rcode), QueryKind::Reverse)
            }
        }
    } else {
        answer_external(context, request, &name).await
    };

    let Reply { mut packet, kind } = reply;
    packet.header.recursion_available = context.recursion_available();
    packet.take_opt();

    if kind != QueryKind::Rejected && kind != QueryKind::Failed {
        context.cache.store(key, &packet);
    }

    Some(Reply::new(packet, kind))
}

/// Perform the actual work for a query
///
/// Malformed and unsupported requests are answered with an error code. A
/// valid request is served from the response cache, synthesized from the
/// registry, or forwarded. The returned packet is ready to be encoded; None
/// means the request is dropped.
pub async fn execute_query(context: &ServerContext, request: &DnsPacket) -> Option<Reply> {
    if let Some(rescode) = validate_request(request) {
        log::debug!("rejecting request {}: {}", request.header.id, rescode.as_str());
        return Some(Reply::new(
            error_response(context, request, rescode),
            QueryKind::Rejected,
        ));
    }

    let mut reply = resolve(context, request).await?;
    apply_rotation(context, &mut reply.packet);
    echo_edns(request, &mut reply.packet);

    Some(reply)
}

/// Run `execute_query` under the per-query deadline and the concurrency
/// limit. Waiting for a slot counts against the deadline. Panics and
/// timeouts become SERVFAIL.
pub async fn handle_request(
    context: &ServerContext,
    request: &DnsPacket,
    protocol: &'static str,
) -> Option<DnsPacket> {
    let timer = QueryTimer::start(protocol);

    let work = async {
        let _permit = match context.query_limit {
            Some(ref limit) => limit.clone().acquire_owned().await.ok(),
            None => None,
        };

        AssertUnwindSafe(execute_query(context, request))
            .catch_unwind()
            .await
    };
    let reply = match timeout(context.config.read_timeout, work).await {
        Ok(Ok(Some(reply))) => reply,
        Ok(Ok(None)) => {
            timer.finish("dropped", "stub");
            return None;
        }
        Ok(Err(_)) => {
            log::error!("panic while answering request {}", request.header.id);
            record_error!("server", "panic");
            Reply::new(
                error_response(context, request, ResultCode::SERVFAIL),
                QueryKind::Failed,
            )
        }
        Err(_) => {
            log::warn!("request {} timed out", request.header.id);
            record_error!("server", "timeout");
            Reply::new(
                error_response(context, request, ResultCode::SERVFAIL),
                QueryKind::Failed,
            )
        }
    };

    let rescode = reply.packet.header.rescode;
    if rescode != ResultCode::NOERROR {
        record_error!("server", rescode.as_str());
    }
    if context.config.verbose {
        log::debug!(
            "{} {} -> {} ({})",
            protocol,
            request.questions.first().map(|q| q.to_string()).unwrap_or_default(),
            rescode.as_str(),
            reply.kind.as_str()
        );
    }
    timer.finish(rescode.as_str(), reply.kind.as_str());

    Some(reply.packet)
}

/// Encode a response for a transport carrying at most `max_size` bytes.
/// Datagrams over the limit are truncated with TC set. Responses over the
/// largest DNS message drop their additional section, and become SERVFAIL
/// if that is not enough.
pub fn encode_response(packet: &mut DnsPacket, max_size: usize) -> Result<Vec<u8>> {
    if max_size < MAX_MESSAGE_SIZE {
        let data = packet.to_bytes(max_size)?;
        if packet.header.truncated_message {
            record_error!("server", "truncated");
        }
        return Ok(data);
    }

    let data = packet.to_bytes(MAX_MESSAGE_SIZE)?;
    if !packet.header.truncated_message {
        return Ok(data);
    }

    record_error!("server", "overflow");
    packet.header.truncated_message = false;
    packet.resources.retain(|rec| rec.get_querytype() == QueryType::Opt);

    let data = packet.to_bytes(MAX_MESSAGE_SIZE)?;
    if !packet.header.truncated_message {
        return Ok(data);
    }

    let mut failure = DnsPacket::reply_to(packet);
    failure.header.rescode = ResultCode::SERVFAIL;
    failure.header.recursion_available = packet.header.recursion_available;
    failure.resources = packet
        .resources
        .iter()
        .filter(|rec| rec.get_querytype() == QueryType::Opt)
        .cloned()
        .collect();

    Ok(failure.to_bytes(MAX_MESSAGE_SIZE)?)
}

/// Largest UDP response a client accepts
fn udp_size_limit(request: &DnsPacket) -> usize {
    match request.edns() {
        Some(edns) => (edns.payload_size as usize).max(MIN_UDP_SIZE),
        None => MIN_UDP_SIZE,
    }
}

/// The UDP server
///
/// Datagrams are read on one task; every query is answered on a task of
/// its own.
pub struct DnsUdpServer {
    context: Arc<ServerContext>,
    shutdown: Arc<ShutdownCoordinator>,
    socket: UdpSocket,
}

impl DnsUdpServer {
    pub async fn bind(
        context: Arc<ServerContext>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Result<DnsUdpServer> {
        let socket = UdpSocket::bind(&context.config.dns_addr).await?;

        Ok(DnsUdpServer {
            context,
            shutdown,
            socket,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl DnsServer for DnsUdpServer {
    async fn run_server(self) -> Result<()> {
        let socket = Arc::new(self.socket);
        let mut stop = self.shutdown.subscribe();
        let mut buf = vec![0; MAX_MESSAGE_SIZE];

        log::info!("udp server listening on {}", socket.local_addr()?);

        loop {
            let (len, src) = tokio::select! {
                _ = stop.recv() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        log::info!("Failed to read from UDP socket: {:?}", e);
                        continue;
                    }
                },
            };

            self.context
                .statistics
                .udp_query_count
                .fetch_add(1, Ordering::Release);

            let request = match DnsPacket::from_bytes(&buf[..len]) {
                Ok(request) => request,
                Err(e) => {
                    log::info!("Failed to parse UDP query packet: {:?}", e);
                    record_error!("server", "malformed");
                    continue;
                }
            };

            let context = self.context.clone();
            let socket = socket.clone();
            let guard = self.shutdown.register_query();

            tokio::spawn(async move {
                let _guard = guard;
                let mut packet = match handle_request(&context, &request, "udp").await {
                    Some(packet) => packet,
                    None => return,
                };

                let data = match encode_response(&mut packet, udp_size_limit(&request)) {
                    Ok(data) => data,
                    Err(e) => {
                        log::info!("Failed to encode UDP response: {}", e);
                        return;
                    }
                };

                if let Err(e) = socket.send_to(&data, src).await {
                    log::info!("Failed to send response packet: {:?}", e);
                }
            });
        }

        log::info!("udp server stopped");
        Ok(())
    }
}

/// TCP DNS server
///
/// Each connection is served on its own task and may carry any number of
/// length prefixed queries, answered in order. Connections idle for longer
/// than the read timeout are closed.
pub struct DnsTcpServer {
    context: Arc<ServerContext>,
    shutdown: Arc<ShutdownCoordinator>,
    listener: TcpListener,
}

impl DnsTcpServer {
    pub async fn bind(
        context: Arc<ServerContext>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Result<DnsTcpServer> {
        let listener = TcpListener::bind(&context.config.dns_addr).await?;

        Ok(DnsTcpServer {
            context,
            shutdown,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

async fn serve_connection(
    context: Arc<ServerContext>,
    shutdown: Arc<ShutdownCoordinator>,
    mut stream: TcpStream,
) {
    let _connection = shutdown.register_connection();
    let mut stop = shutdown.subscribe();
    let idle = context.config.read_timeout;

    loop {
        let frame = tokio::select! {
            _ = stop.recv() => return,
            frame = timeout(idle, read_frame(&mut stream)) => frame,
        };

        let data = match frame {
            Ok(Ok(data)) => data,
            Ok(Err(_)) => return,
            Err(_) => {
                log::debug!("closing idle tcp connection");
                return;
            }
        };

        context
            .statistics
            .tcp_query_count
            .fetch_add(1, Ordering::Release);

        let request = match DnsPacket::from_bytes(&data) {
            Ok(request) => request,
            Err(e) => {
                log::info!("Failed to read query packet: {:?}", e);
                record_error!("server", "malformed");
                return;
            }
        };

        let _query = shutdown.register_query();
        let mut packet = match handle_request(&context, &request, "tcp").await {
            Some(packet) => packet,
            None => continue,
        };

        let response = match encode_response(&mut packet, MAX_MESSAGE_SIZE) {
            Ok(response) => response,
            Err(e) => {
                log::info!("Failed to write packet to buffer: {}", e);
                return;
            }
        };

        if let Err(e) = write_frame(&mut stream, &response).await {
            log::info!("Failed to write response packet: {:?}", e);
            return;
        }
    }
}

#[async_trait]
impl DnsServer for DnsTcpServer {
    async fn run_server(self) -> Result<()> {
        let mut stop = self.shutdown.subscribe();

        log::info!("tcp server listening on {}", self.listener.local_addr()?);

        loop {
            let stream = tokio::select! {
                _ = stop.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        log::info!("Failed to accept TCP connection: {:?}", e);
                        continue;
                    }
                },
            };

            tokio::spawn(serve_connection(
                self.context.clone(),
                self.shutdown.clone(),
                stream,
            ));
        }

        log::info!("tcp server stopped");
        Ok(())
    }
}
