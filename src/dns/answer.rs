//! Synthesis of authoritative answers from registry services
//!
//! A question for a name in the served zone is turned into records by
//! looking the name up in the registry and translating every service found
//! there. Services whose host is a name become CNAMEs (for address queries)
//! or targets (for SRV and MX) and are chased through the registry when the
//! target is in zone, or through the forwarder when it is not.

use std::collections::HashMap;
use std::net::IpAddr;

use derive_more::{Display, Error, From};
use futures::future::{BoxFuture, FutureExt};

use crate::dns::context::ServerContext;
use crate::dns::protocol::{DnsRecord, QueryType, ResultCode, TransientTtl};
use crate::registry::path::{has_wildcard, is_subdomain, normalize_name};
use crate::registry::service::{self, Service};
use crate::registry::store::StoreError;
use crate::registry::RegistryError;

#[derive(Debug, Display, From, Error)]
pub enum AnswerError {
    Registry(RegistryError),
    #[display(fmt = "CNAME loop at {}", _0)]
    #[from(ignore)]
    CnameLoop(#[error(not(source))] String),
    #[display(fmt = "CNAME chain too long")]
    ChaseLimit,
    #[display(fmt = "query type not implemented")]
    NotImplemented,
}

impl AnswerError {
    pub fn is_not_found(&self) -> bool {
        match self {
            AnswerError::Registry(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Response code reported for this failure
    pub fn rcode(&self) -> ResultCode {
        match self {
            AnswerError::Registry(RegistryError::WildcardReverse) => ResultCode::REFUSED,
            AnswerError::NotImplemented => ResultCode::NOTIMP,
            e if e.is_not_found() => ResultCode::NXDOMAIN,
            _ => ResultCode::SERVFAIL,
        }
    }
}

type Result<T> = std::result::Result<T, AnswerError>;

/// Upper bound on names resolved while chasing CNAMEs for one query
pub const MAX_CHASE_DEPTH: usize = 8;

/// Longest character-string in a TXT record
const TXT_CHUNK: usize = 255;

/// The sections of a synthesized response
#[derive(Clone, Debug, Default)]
pub struct Answer {
    pub rcode: ResultCode,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

/// Split `text` into character-strings of at most 255 bytes without
/// breaking a UTF-8 sequence
pub fn split_txt(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.len() > TXT_CHUNK {
        let mut end = TXT_CHUNK;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        chunks.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    chunks.push(rest.to_string());

    chunks
}

/// Rotate the address records of an answer by `counter`. Answers with more
/// than one CNAME are left alone.
pub fn rotate_answers(records: &mut Vec<DnsRecord>, counter: usize) {
    let cnames = records
        .iter()
        .filter(|rec| rec.get_querytype() == QueryType::Cname)
        .count();
    if cnames > 1 {
        return;
    }

    let positions = records
        .iter()
        .enumerate()
        .filter(|(_, rec)| matches!(rec.get_querytype(), QueryType::A | QueryType::Aaaa))
        .map(|(i, _)| i)
        .collect::<Vec<usize>>();
    if positions.len() < 2 {
        return;
    }

    let mut addresses = positions
        .iter()
        .map(|i| records[*i].clone())
        .collect::<Vec<DnsRecord>>();
    let shift = counter % addresses.len();
    addresses.rotate_left(shift);

    for (i, rec) in positions.into_iter().zip(addresses.into_iter()) {
        records[i] = rec;
    }
}

/// True if an answer is eligible for round-robin rotation
pub fn is_rotatable(records: &[DnsRecord]) -> bool {
    let mut addresses = 0;
    let mut cnames = 0;
    for rec in records {
        match rec.get_querytype() {
            QueryType::A | QueryType::Aaaa => addresses += 1,
            QueryType::Cname => cnames += 1,
            _ => {}
        }
    }

    addresses > 1 && cnames <= 1
}

fn address_record(name: &str, ip: IpAddr, ttl: u32) -> DnsRecord {
    match ip {
        IpAddr::V4(addr) => DnsRecord::A {
            domain: name.to_string(),
            addr,
            ttl: TransientTtl(ttl),
        },
        IpAddr::V6(addr) => DnsRecord::Aaaa {
            domain: name.to_string(),
            addr,
            ttl: TransientTtl(ttl),
        },
    }
}

/// Answers the questions of one query. The chase state is per query.
pub struct Synthesizer<'a> {
    context: &'a ServerContext,
    dnssec: bool,
    chased: usize,
    chain: Vec<String>,
}

impl<'a> Synthesizer<'a> {
    pub fn new(context: &'a ServerContext, dnssec: bool) -> Synthesizer<'a> {
        Synthesizer {
            context,
            dnssec,
            chased: 0,
            chain: Vec::new(),
        }
    }

    /// Names resolved through the registry while chasing CNAMEs so far
    pub fn chased(&self) -> usize {
        self.chased
    }

    fn domain(&self) -> &str {
        &self.context.config.domain
    }

    fn in_zone(&self, name: &str) -> bool {
        is_subdomain(name, self.domain())
    }

    /// Name a service answers under when its host is an address
    fn service_name(&self, service: &Service) -> String {
        let name = self.context.paths.domain(&service.key);
        service::target_strip(&name, service.target_strip)
    }

    /// Answer records for an out-of-zone name, if it can be looked up
    async fn forward_lookup(&self, name: &str, qtype: QueryType) -> Vec<DnsRecord> {
        if !self.context.recursion_available() {
            return Vec::new();
        }

        let upstreams = self.context.upstreams_for(name);
        if upstreams.is_empty() {
            return Vec::new();
        }

        match self
            .context
            .forwarder
            .lookup(&upstreams, name, qtype, self.dnssec)
            .await
        {
            Ok(reply) => reply.answers,
            Err(e) => {
                log::debug!("lookup of {} {:?} failed: {}", name, qtype, e);
                Vec::new()
            }
        }
    }

    /// A and AAAA records for `name`, chasing name hosts
    fn address_records(
        &mut self,
        name: String,
        qtype: QueryType,
    ) -> BoxFuture<'_, Result<Vec<DnsRecord>>> {
        async move {
            let services = self.context.backend.records(&name, false).await?;

            let mut records = Vec::new();
            for service in services {
                match service.ip() {
                    Some(ip @ IpAddr::V4(_)) if qtype == QueryType::A => {
                        records.push(address_record(&name, ip, service.ttl));
                    }
                    Some(ip @ IpAddr::V6(_)) if qtype == QueryType::Aaaa => {
                        records.push(address_record(&name, ip, service.ttl));
                    }
                    Some(_) => {}
                    None => {
                        let target = normalize_name(&service.host);
                        if target.is_empty() {
                            continue;
                        }

                        let mut chased = self.chase(&name, &target, qtype, service.ttl).await?;
                        records.append(&mut chased);
                    }
                }
            }

            Ok(records)
        }
        .boxed()
    }

    /// CNAME from `name` to `target` followed by the target's addresses
    async fn chase(
        &mut self,
        name: &str,
        target: &str,
        qtype: QueryType,
        ttl: u32,
    ) -> Result<Vec<DnsRecord>> {
        if target == name || self.chain.iter().any(|seen| seen == target) {
            return Err(AnswerError::CnameLoop(target.to_string()));
        }

        self.chased += 1;
        if self.chased > MAX_CHASE_DEPTH {
            return Err(AnswerError::ChaseLimit);
        }

        let cname = DnsRecord::Cname {
            domain: name.to_string(),
            host: target.to_string(),
            ttl: TransientTtl(ttl),
        };

        if !self.in_zone(target) {
            let mut records = vec![cname];
            records.append(&mut self.forward_lookup(target, qtype).await);
            return Ok(records);
        }

        self.chain.push(name.to_string());
        let resolved = self.address_records(target.to_string(), qtype).await;
        self.chain.pop();

        match resolved {
            Ok(mut records) if !records.is_empty() => {
                records.insert(0, cname);
                Ok(records)
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Address records for the target of an SRV or MX record
    async fn target_additionals(&mut self, target: &str) -> Vec<DnsRecord> {
        let mut records = Vec::new();

        for qtype in [QueryType::A, QueryType::Aaaa].iter() {
            if self.in_zone(target) {
                match self.address_records(target.to_string(), *qtype).await {
                    Ok(mut found) => records.append(&mut found),
                    Err(e) => log::debug!("no additionals for {}: {}", target, e),
                }
            } else {
                records.append(&mut self.forward_lookup(target, *qtype).await);
            }
        }

        records
    }

    async fn srv_records(&mut self, name: &str, answer: &mut Answer) -> Result<()> {
        let services = service::group(self.context.backend.records(name, false).await?);
        let tiers = service::group_priorities(&services);

        for service in services {
            let priority = if service.group.is_empty() {
                service.priority
            } else {
                tiers.get(&service.group).cloned().unwrap_or(service.priority)
            };

            let target = match service.ip() {
                Some(ip) => {
                    let target = self.service_name(&service);
                    answer
                        .additionals
                        .push(address_record(&target, ip, service.ttl));
                    target
                }
                None => {
                    let target = normalize_name(&service.host);
                    if target.is_empty() {
                        continue;
                    }
                    let mut extra = self.target_additionals(&target).await;
                    answer.additionals.append(&mut extra);
                    target
                }
            };

            answer.answers.push(DnsRecord::Srv {
                domain: name.to_string(),
                priority,
                weight: service.weight,
                port: service.port,
                host: target,
                ttl: TransientTtl(service.ttl),
            });
        }

        Ok(())
    }

    async fn mx_records(&mut self, name: &str, answer: &mut Answer) -> Result<()> {
        let services = self.context.backend.records(name, false).await?;

        for service in services.into_iter().filter(|service| service.mail) {
            let target = match service.ip() {
                Some(ip) => {
                    let target = self.service_name(&service);
                    answer
                        .additionals
                        .push(address_record(&target, ip, service.ttl));
                    target
                }
                None => {
                    let target = normalize_name(&service.host);
                    if target.is_empty() {
                        continue;
                    }
                    let mut extra = self.target_additionals(&target).await;
                    answer.additionals.append(&mut extra);
                    target
                }
            };

            answer.answers.push(DnsRecord::Mx {
                domain: name.to_string(),
                priority: service.priority,
                host: target,
                ttl: TransientTtl(service.ttl),
            });
        }

        Ok(())
    }

    async fn txt_records(&mut self, name: &str, answer: &mut Answer) -> Result<()> {
        let services = self.context.backend.records(name, false).await?;

        for service in services.into_iter().filter(|s| !s.text.is_empty()) {
            answer.answers.push(DnsRecord::Txt {
                domain: name.to_string(),
                data: split_txt(&service.text),
                ttl: TransientTtl(service.ttl),
            });
        }

        Ok(())
    }

    async fn cname_records(&mut self, name: &str, answer: &mut Answer) -> Result<()> {
        let services = self.context.backend.records(name, true).await?;

        if let Some(service) = services
            .into_iter()
            .find(|s| s.ip().is_none() && !s.host.is_empty())
        {
            answer.answers.push(DnsRecord::Cname {
                domain: name.to_string(),
                host: normalize_name(&service.host),
                ttl: TransientTtl(service.ttl),
            });
        }

        Ok(())
    }

    /// NS records of the zone apex with glue, from the servers registered
    /// below `dns.<domain>`
    async fn ns_records(&mut self, answer: &mut Answer) -> Result<()> {
        let dns_domain = self.context.config.dns_domain();
        let stub_domain = self.context.config.stub_domain();

        let services = match self.context.backend.records(&dns_domain, false).await {
            Ok(services) => services,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for service in services {
            let ip = match service.ip() {
                Some(ip) => ip,
                None => continue,
            };

            let target = self.service_name(&service);
            if is_subdomain(&target, &stub_domain) {
                continue;
            }

            answer.answers.push(DnsRecord::Ns {
                domain: self.domain().to_string(),
                host: target.clone(),
                ttl: TransientTtl(service.ttl),
            });
            answer
                .additionals
                .push(address_record(&target, ip, service.ttl));
        }

        Ok(())
    }

    /// Whether `name` exists in the registry, for telling NODATA from
    /// NXDOMAIN
    async fn exists(&self, name: &str) -> Result<bool> {
        if normalize_name(name) == self.domain() {
            return Ok(true);
        }

        match self.context.backend.records(name, false).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn fill(&mut self, name: &str, qtype: QueryType, answer: &mut Answer) -> Result<()> {
        let apex = name == self.domain();

        match qtype {
            QueryType::A | QueryType::Aaaa => {
                answer.answers = self.address_records(name.to_string(), qtype).await?;
            }
            QueryType::Srv => self.srv_records(name, answer).await?,
            QueryType::Mx => self.mx_records(name, answer).await?,
            QueryType::Txt => self.txt_records(name, answer).await?,
            QueryType::Cname => self.cname_records(name, answer).await?,
            QueryType::Ns if apex => self.ns_records(answer).await?,
            QueryType::Soa if apex => answer.answers.push(self.context.soa_record()),
            QueryType::Dnskey if apex => {
                if let Some(signer) = &self.context.signer {
                    answer.answers.push(signer.dnskey());
                }
            }
            QueryType::Ns | QueryType::Soa | QueryType::Dnskey => {
                if !self.exists(name).await? {
                    return Err(RegistryError::Store(StoreError::KeyNotFound).into());
                }
            }
            _ => return Err(AnswerError::NotImplemented),
        }

        Ok(())
    }

    /// Answer `qtype` for an in-zone `name`. Failures become response
    /// codes; negative answers carry the zone's SOA.
    pub async fn answer(&mut self, name: &str, qtype: QueryType) -> Answer {
        let name = normalize_name(name);
        let mut answer = Answer::default();

        match self.fill(&name, qtype, &mut answer).await {
            Ok(()) if answer.answers.is_empty() => {
                answer.additionals.clear();
                answer.authorities.push(self.context.soa_record());
            }
            Ok(()) => {}
            Err(e) => {
                log::debug!("answering {} {:?}: {}", name, qtype, e);
                answer = Answer {
                    rcode: e.rcode(),
                    ..Answer::default()
                };
                if answer.rcode == ResultCode::NXDOMAIN {
                    answer.authorities.push(self.context.soa_record());
                }
            }
        }

        answer
    }

    /// PTR answer for a reverse lookup name. Returns the registry error
    /// when the name is not registered so the caller can forward it.
    pub async fn reverse(&mut self, name: &str) -> Result<Answer> {
        let name = normalize_name(name);
        if has_wildcard(&name) {
            return Err(RegistryError::WildcardReverse.into());
        }

        let service = self.context.backend.reverse_record(&name).await?;
        let host = normalize_name(&service.host);

        Ok(Answer {
            rcode: ResultCode::NOERROR,
            answers: vec![DnsRecord::Ptr {
                domain: name,
                host,
                ttl: TransientTtl(service.ttl),
            }],
            ..Answer::default()
        })
    }
}

/// Give the records owned by `from` the owner name `to`
pub fn rename_owner(records: &mut [DnsRecord], from: &str, to: &str) {
    for rec in records.iter_mut() {
        let domain = match *rec {
            DnsRecord::A { ref mut domain, .. }
            | DnsRecord::Aaaa { ref mut domain, .. }
            | DnsRecord::Ns { ref mut domain, .. }
            | DnsRecord::Cname { ref mut domain, .. }
            | DnsRecord::Ptr { ref mut domain, .. }
            | DnsRecord::Mx { ref mut domain, .. }
            | DnsRecord::Txt { ref mut domain, .. }
            | DnsRecord::Srv { ref mut domain, .. } => domain,
            _ => continue,
        };

        if normalize_name(domain) == from {
            *domain = to.to_string();
        }
    }
}

/// Remove duplicate records and give every RRset the TTL of its shortest
/// lived member
pub fn normalize_section(records: &mut Vec<DnsRecord>) {
    let mut unique: Vec<DnsRecord> = Vec::with_capacity(records.len());
    for rec in records.drain(..) {
        match unique.iter_mut().find(|existing| **existing == rec) {
            Some(existing) => {
                if rec.get_ttl() < existing.get_ttl() {
                    existing.set_ttl(rec.get_ttl());
                }
            }
            None => unique.push(rec),
        }
    }

    let mut minimum: HashMap<(String, QueryType), u32> = HashMap::new();
    for rec in unique.iter().filter(|rec| rec.get_querytype() != QueryType::Opt) {
        let key = (
            normalize_name(&rec.get_domain().unwrap_or_default()),
            rec.get_querytype(),
        );
        let ttl = minimum.entry(key).or_insert(u32::MAX);
        *ttl = (*ttl).min(rec.get_ttl());
    }

    for rec in unique.iter_mut() {
        let key = (
            normalize_name(&rec.get_domain().unwrap_or_default()),
            rec.get_querytype(),
        );
        if let Some(ttl) = minimum.get(&key) {
            rec.set_ttl(*ttl);
        }
    }

    *records = unique;
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use super::*;
    use crate::dns::context::tests::{create_test_context, test_config};
    use crate::registry::memory::MemoryStore;

    fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.put(
            "/skydns/local/skydns/web",
            r#"{"host":"10.0.0.1","port":8080,"priority":0,"weight":0}"#,
        );
        store.put("/skydns/local/skydns/api/a", r#"{"host":"10.0.0.2"}"#);
        store.put("/skydns/local/skydns/api/b", r#"{"host":"10.0.0.3"}"#);
        store.put("/skydns/local/skydns/v6", r#"{"host":"2001:db8::1"}"#);
        store.put("/skydns/local/skydns/alias", r#"{"host":"target.skydns.local."}"#);
        store.put("/skydns/local/skydns/target", r#"{"host":"10.0.0.4"}"#);
        store.put("/skydns/local/skydns/loop1", r#"{"host":"loop2.skydns.local"}"#);
        store.put("/skydns/local/skydns/loop2", r#"{"host":"loop1.skydns.local"}"#);
        store.put("/skydns/local/skydns/dangling", r#"{"host":"gone.skydns.local"}"#);
        store.put("/skydns/local/skydns/ext", r#"{"host":"www.example.com"}"#);
        store.put(
            "/skydns/local/skydns/mail/mx1",
            r#"{"host":"10.0.1.1","mail":true,"priority":5}"#,
        );
        store.put("/skydns/local/skydns/mail/web", r#"{"host":"10.0.1.2"}"#);
        store.put("/skydns/local/skydns/txt", r#"{"host":"10.0.2.1","text":"hello"}"#);
        store.put("/skydns/local/skydns/dns/ns1", r#"{"host":"10.0.3.1"}"#);
        store.put("/skydns/local/skydns/dns/stub/org/example/ns1", r#"{"host":"10.9.9.9"}"#);
        store.put(
            "/skydns/local/skydns/strip/x/y",
            r#"{"host":"10.0.4.1","port":80,"targetstrip":1}"#,
        );
        store.put("/skydns/arpa/in-addr/10/0/0/1", r#"{"host":"web.skydns.local."}"#);
        store
    }

    fn chain_store(len: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..len {
            store.put(
                &format!("/skydns/local/skydns/c{}", i),
                &format!(r#"{{"host":"c{}.skydns.local"}}"#, i + 1),
            );
        }
        store.put(&format!("/skydns/local/skydns/c{}", len), r#"{"host":"10.0.0.9"}"#);
        store
    }

    #[tokio::test]
    async fn test_srv_default_priority() {
        let context = create_test_context(test_config(), store());
        let answer = Synthesizer::new(&context, false)
            .answer("web.skydns.local.", QueryType::Srv)
            .await;

        assert_eq!(ResultCode::NOERROR, answer.rcode);
        assert_eq!(1, answer.answers.len());
        match answer.answers[0] {
            DnsRecord::Srv {
                priority,
                weight,
                port,
                ref host,
                ttl: TransientTtl(ttl),
                ..
            } => {
                assert_eq!(10, priority);
                assert_eq!(0, weight);
                assert_eq!(8080, port);
                assert_eq!("web.skydns.local", host);
                assert_eq!(3600, ttl);
            }
            _ => panic!("expected an SRV record"),
        }
        assert_eq!(1, answer.additionals.len());
    }

    #[tokio::test]
    async fn test_address_records() {
        let context = create_test_context(test_config(), store());

        let answer = Synthesizer::new(&context, false)
            .answer("api.skydns.local", QueryType::A)
            .await;
        assert_eq!(2, answer.answers.len());

        let answer = Synthesizer::new(&context, false)
            .answer("v6.skydns.local", QueryType::Aaaa)
            .await;
        assert_eq!(1, answer.answers.len());

        let answer = Synthesizer::new(&context, false)
            .answer("v6.skydns.local", QueryType::A)
            .await;
        assert_eq!(ResultCode::NOERROR, answer.rcode);
        assert!(answer.answers.is_empty());
        assert_eq!(QueryType::Soa, answer.authorities[0].get_querytype());
    }

    #[tokio::test]
    async fn test_cname_chase() {
        let context = create_test_context(test_config(), store());
        let answer = Synthesizer::new(&context, false)
            .answer("alias.skydns.local.", QueryType::A)
            .await;

        assert_eq!(
            vec![
                DnsRecord::Cname {
                    domain: "alias.skydns.local".to_string(),
                    host: "target.skydns.local".to_string(),
                    ttl: TransientTtl(3600),
                },
                DnsRecord::A {
                    domain: "target.skydns.local".to_string(),
                    addr: Ipv4Addr::new(10, 0, 0, 4),
                    ttl: TransientTtl(3600),
                },
            ],
            answer.answers
        );
    }

    #[tokio::test]
    async fn test_cname_loop_is_servfail() {
        let context = create_test_context(test_config(), store());
        let answer = Synthesizer::new(&context, false)
            .answer("loop1.skydns.local", QueryType::A)
            .await;

        assert_eq!(ResultCode::SERVFAIL, answer.rcode);
        assert!(answer.answers.is_empty());
    }

    #[tokio::test]
    async fn test_chase_depth_is_bounded() {
        let context = create_test_context(test_config(), chain_store(MAX_CHASE_DEPTH));
        let mut synthesizer = Synthesizer::new(&context, false);
        let answer = synthesizer.answer("c0.skydns.local", QueryType::A).await;
        assert_eq!(ResultCode::NOERROR, answer.rcode);
        assert_eq!(MAX_CHASE_DEPTH + 1, answer.answers.len());

        let context = create_test_context(test_config(), chain_store(MAX_CHASE_DEPTH + 1));
        let mut synthesizer = Synthesizer::new(&context, false);
        let answer = synthesizer.answer("c0.skydns.local", QueryType::A).await;
        assert_eq!(ResultCode::SERVFAIL, answer.rcode);
        assert!(synthesizer.chased() <= MAX_CHASE_DEPTH + 1);
    }

    #[tokio::test]
    async fn test_dangling_and_external_cnames() {
        let context = create_test_context(test_config(), store());

        let answer = Synthesizer::new(&context, false)
            .answer("dangling.skydns.local", QueryType::A)
            .await;
        assert!(answer.answers.is_empty());

        let answer = Synthesizer::new(&context, false)
            .answer("ext.skydns.local", QueryType::A)
            .await;
        assert_eq!(1, answer.answers.len());
        assert_eq!(QueryType::Cname, answer.answers[0].get_querytype());
    }

    #[tokio::test]
    async fn test_nxdomain() {
        let context = create_test_context(test_config(), store());
        let answer = Synthesizer::new(&context, false)
            .answer("nope.skydns.local", QueryType::A)
            .await;

        assert_eq!(ResultCode::NXDOMAIN, answer.rcode);
        assert_eq!(1, answer.authorities.len());
        assert_eq!(60, answer.authorities[0].get_ttl());
    }

    #[tokio::test]
    async fn test_mx_and_txt() {
        let context = create_test_context(test_config(), store());

        let answer = Synthesizer::new(&context, false)
            .answer("mail.skydns.local", QueryType::Mx)
            .await;
        assert_eq!(1, answer.answers.len());
        match answer.answers[0] {
            DnsRecord::Mx {
                priority, ref host, ..
            } => {
                assert_eq!(5, priority);
                assert_eq!("mx1.mail.skydns.local", host);
            }
            _ => panic!("expected an MX record"),
        }
        assert_eq!(1, answer.additionals.len());

        let answer = Synthesizer::new(&context, false)
            .answer("txt.skydns.local", QueryType::Txt)
            .await;
        assert_eq!(1, answer.answers.len());
    }

    #[tokio::test]
    async fn test_target_strip() {
        let context = create_test_context(test_config(), store());
        let answer = Synthesizer::new(&context, false)
            .answer("strip.skydns.local", QueryType::Srv)
            .await;

        match answer.answers[0] {
            DnsRecord::Srv { ref host, .. } => assert_eq!("x.strip.skydns.local", host),
            _ => panic!("expected an SRV record"),
        }
    }

    #[tokio::test]
    async fn test_apex_records() {
        let context = create_test_context(test_config(), store());

        let answer = Synthesizer::new(&context, false)
            .answer("skydns.local.", QueryType::Ns)
            .await;
        assert_eq!(1, answer.answers.len());
        match answer.answers[0] {
            DnsRecord::Ns { ref host, .. } => assert_eq!("ns1.dns.skydns.local", host),
            _ => panic!("expected an NS record"),
        }
        assert_eq!(1, answer.additionals.len());

        let answer = Synthesizer::new(&context, false)
            .answer("skydns.local.", QueryType::Soa)
            .await;
        assert_eq!(QueryType::Soa, answer.answers[0].get_querytype());

        let answer = Synthesizer::new(&context, false)
            .answer("nope.skydns.local.", QueryType::Soa)
            .await;
        assert_eq!(ResultCode::NXDOMAIN, answer.rcode);
    }

    #[tokio::test]
    async fn test_unsupported_type() {
        let context = create_test_context(test_config(), store());
        let answer = Synthesizer::new(&context, false)
            .answer("web.skydns.local", QueryType::Unknown(99))
            .await;

        assert_eq!(ResultCode::NOTIMP, answer.rcode);
    }

    #[tokio::test]
    async fn test_reverse() {
        let context = create_test_context(test_config(), store());
        let answer = Synthesizer::new(&context, false)
            .reverse("1.0.0.10.in-addr.arpa.")
            .await
            .unwrap();

        match answer.answers[0] {
            DnsRecord::Ptr { ref host, .. } => assert_eq!("web.skydns.local", host),
            _ => panic!("expected a PTR record"),
        }

        let err = Synthesizer::new(&context, false)
            .reverse("2.0.0.10.in-addr.arpa.")
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = Synthesizer::new(&context, false)
            .reverse("*.0.0.10.in-addr.arpa.")
            .await
            .unwrap_err();
        assert_eq!(ResultCode::REFUSED, err.rcode());
    }

    #[test]
    fn test_split_txt() {
        assert_eq!(vec!["short".to_string()], split_txt("short"));

        let long = "a".repeat(600);
        let chunks = split_txt(&long);
        assert_eq!(vec![255, 255, 90], chunks.iter().map(|c| c.len()).collect::<Vec<_>>());

        let wide = "é".repeat(200);
        let chunks = split_txt(&wide);
        assert!(chunks.iter().all(|c| c.len() <= 255));
        assert_eq!(wide, chunks.concat());
    }

    #[test]
    fn test_rotate_answers() {
        let a = |last: u8| DnsRecord::A {
            domain: "api.skydns.local".to_string(),
            addr: Ipv4Addr::new(10, 0, 0, last),
            ttl: TransientTtl(60),
        };

        let mut records = vec![a(1), a(2), a(3)];
        rotate_answers(&mut records, 4);
        assert_eq!(vec![a(2), a(3), a(1)], records);

        let cname = |host: &str| DnsRecord::Cname {
            domain: "x.skydns.local".to_string(),
            host: host.to_string(),
            ttl: TransientTtl(60),
        };
        let mut chained = vec![cname("a"), cname("b"), a(1), a(2)];
        assert!(!is_rotatable(&chained));
        rotate_answers(&mut chained, 1);
        assert_eq!(a(1), chained[2]);
    }

    #[test]
    fn test_normalize_section() {
        let a = |last: u8, ttl: u32| DnsRecord::A {
            domain: "api.skydns.local".to_string(),
            addr: Ipv4Addr::new(10, 0, 0, last),
            ttl: TransientTtl(ttl),
        };

        let mut records = vec![a(1, 300), a(2, 60), a(1, 30)];
        normalize_section(&mut records);

        assert_eq!(2, records.len());
        assert!(records.iter().all(|rec| rec.get_ttl() == 30));
    }
}
