//! implements the DNS protocol in a transport agnostic fashion

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// Class IN
pub const CLASS_IN: u16 = 1;

/// DO bit inside the OPT record's TTL field
const EDNS_DO_FLAG: u32 = 0x8000;

/// `QueryType` represents the requested Record Type of a query
///
/// The specific type Unknown that an integer parameter in order to retain the
/// id of an unknown query when compiling the reply. An integer can be converted
/// to a querytype using the `from_num` function, and back to an integer using
/// the `to_num` method.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, PartialOrd, Ord)]
pub enum QueryType {
    Unknown(u16),
    A,      // 1
    Ns,     // 2
    Cname,  // 5
    Soa,    // 6
    Ptr,    // 12
    Mx,     // 15
    Txt,    // 16
    Aaaa,   // 28
    Srv,    // 33
    Opt,    // 41
    Rrsig,  // 46
    Dnskey, // 48
    Ixfr,   // 251
    Axfr,   // 252
    Any,    // 255
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Ptr => 12,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
            QueryType::Opt => 41,
            QueryType::Rrsig => 46,
            QueryType::Dnskey => 48,
            QueryType::Ixfr => 251,
            QueryType::Axfr => 252,
            QueryType::Any => 255,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            12 => QueryType::Ptr,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            41 => QueryType::Opt,
            46 => QueryType::Rrsig,
            48 => QueryType::Dnskey,
            251 => QueryType::Ixfr,
            252 => QueryType::Axfr,
            255 => QueryType::Any,
            _ => QueryType::Unknown(num),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq)]
pub struct TransientTtl(pub u32);

impl PartialEq<TransientTtl> for TransientTtl {
    fn eq(&self, _: &TransientTtl) -> bool {
        true
    }
}

impl PartialOrd<TransientTtl> for TransientTtl {
    fn partial_cmp(&self, other: &TransientTtl) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransientTtl {
    fn cmp(&self, _: &TransientTtl) -> Ordering {
        Ordering::Equal
    }
}

impl Hash for TransientTtl {
    fn hash<H>(&self, _: &mut H)
    where
        H: Hasher,
    {
        // purposely left empty
    }
}

/// `DnsRecord` is the primary representation of a DNS record
///
/// This enumeration is used for reading as well as writing records. Equality
/// ignores the TTL, which makes it suitable for removing duplicate records
/// from a section.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DnsRecord {
    Unknown {
        domain: String,
        qtype: u16,
        class: u16,
        data: Vec<u8>,
        ttl: TransientTtl,
    }, // 0
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: TransientTtl,
    }, // 1
    Ns {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 2
    Cname {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 5
    Soa {
        domain: String,
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: TransientTtl,
    }, // 6
    Ptr {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 12
    Mx {
        domain: String,
        priority: u16,
        host: String,
        ttl: TransientTtl,
    }, // 15
    Txt {
        domain: String,
        data: Vec<String>,
        ttl: TransientTtl,
    }, // 16
    Aaaa {
        domain: String,
        addr: Ipv6Addr,
        ttl: TransientTtl,
    }, // 28
    Srv {
        domain: String,
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
        ttl: TransientTtl,
    }, // 33
    Opt {
        packet_len: u16,
        flags: u32,
        data: Vec<u8>,
    }, // 41
    Rrsig {
        domain: String,
        type_covered: u16,
        algorithm: u8,
        labels: u8,
        original_ttl: u32,
        expiration: u32,
        inception: u32,
        key_tag: u16,
        signer_name: String,
        signature: Vec<u8>,
        ttl: TransientTtl,
    }, // 46
    Dnskey {
        domain: String,
        flags: u16,
        protocol: u8,
        algorithm: u8,
        public_key: Vec<u8>,
        ttl: TransientTtl,
    }, // 48
}

impl DnsRecord {
    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()? as usize;

        let rdata_start = buffer.pos();
        let rdata_end = rdata_start + data_len;

        let record = match qtype {
            QueryType::A => {
                let raw = buffer.read_u32()?;

                DnsRecord::A {
                    domain,
                    addr: Ipv4Addr::from(raw),
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Aaaa => {
                let mut segments = [0u16; 8];
                for segment in segments.iter_mut() {
                    *segment = buffer.read_u16()?;
                }

                DnsRecord::Aaaa {
                    domain,
                    addr: Ipv6Addr::from(segments),
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Ns => {
                let mut ns = String::new();
                buffer.read_qname(&mut ns)?;

                DnsRecord::Ns {
                    domain,
                    host: ns,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Cname => {
                let mut cname = String::new();
                buffer.read_qname(&mut cname)?;

                DnsRecord::Cname {
                    domain,
                    host: cname,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Ptr => {
                let mut ptr = String::new();
                buffer.read_qname(&mut ptr)?;

                DnsRecord::Ptr {
                    domain,
                    host: ptr,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Srv => {
                let priority = buffer.read_u16()?;
                let weight = buffer.read_u16()?;
                let port = buffer.read_u16()?;

                let mut srv = String::new();
                buffer.read_qname(&mut srv)?;

                DnsRecord::Srv {
                    domain,
                    priority,
                    weight,
                    port,
                    host: srv,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Mx => {
                let priority = buffer.read_u16()?;
                let mut mx = String::new();
                buffer.read_qname(&mut mx)?;

                DnsRecord::Mx {
                    domain,
                    priority,
                    host: mx,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Soa => {
                let mut m_name = String::new();
                buffer.read_qname(&mut m_name)?;

                let mut r_name = String::new();
                buffer.read_qname(&mut r_name)?;

                let serial = buffer.read_u32()?;
                let refresh = buffer.read_u32()?;
                let retry = buffer.read_u32()?;
                let expire = buffer.read_u32()?;
                let minimum = buffer.read_u32()?;

                DnsRecord::Soa {
                    domain,
                    m_name,
                    r_name,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Txt => {
                let mut data = Vec::new();
                while buffer.pos() < rdata_end {
                    let len = buffer.read()? as usize;
                    let chunk = buffer.read_bytes(len)?;
                    data.push(String::from_utf8_lossy(&chunk).into_owned());
                }

                DnsRecord::Txt {
                    domain,
                    data,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Opt => DnsRecord::Opt {
                packet_len: class,
                flags: ttl,
                data: buffer.read_bytes(data_len)?,
            },
            QueryType::Rrsig => {
                let type_covered = buffer.read_u16()?;
                let algorithm = buffer.read()?;
                let labels = buffer.read()?;
                let original_ttl = buffer.read_u32()?;
                let expiration = buffer.read_u32()?;
                let inception = buffer.read_u32()?;
                let key_tag = buffer.read_u16()?;

                let mut signer_name = String::new();
                buffer.read_qname(&mut signer_name)?;

                let remaining = rdata_end.saturating_sub(buffer.pos());
                let signature = buffer.read_bytes(remaining)?;

                DnsRecord::Rrsig {
                    domain,
                    type_covered,
                    algorithm,
                    labels,
                    original_ttl,
                    expiration,
                    inception,
                    key_tag,
                    signer_name,
                    signature,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Dnskey => {
                let flags = buffer.read_u16()?;
                let protocol = buffer.read()?;
                let algorithm = buffer.read()?;

                let remaining = rdata_end.saturating_sub(buffer.pos());
                let public_key = buffer.read_bytes(remaining)?;

                DnsRecord::Dnskey {
                    domain,
                    flags,
                    protocol,
                    algorithm,
                    public_key,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Ixfr | QueryType::Axfr | QueryType::Any | QueryType::Unknown(_) => {
                DnsRecord::Unknown {
                    domain,
                    qtype: qtype_num,
                    class,
                    data: buffer.read_bytes(data_len)?,
                    ttl: TransientTtl(ttl),
                }
            }
        };

        buffer.seek(rdata_end)?;

        Ok(record)
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        match *self {
            DnsRecord::Opt {
                packet_len, flags, ..
            } => {
                buffer.write_u8(0)?;
                buffer.write_u16(QueryType::Opt.to_num())?;
                buffer.write_u16(packet_len)?;
                buffer.write_u32(flags)?;
            }
            DnsRecord::Unknown {
                ref domain,
                qtype,
                class,
                ttl: TransientTtl(ttl),
                ..
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(qtype)?;
                buffer.write_u16(class)?;
                buffer.write_u32(ttl)?;
            }
            _ => {
                let domain = self.get_domain().unwrap_or_default();
                buffer.write_qname(&domain)?;
                buffer.write_u16(self.get_querytype().to_num())?;
                buffer.write_u16(CLASS_IN)?;
                buffer.write_u32(self.get_ttl())?;
            }
        }

        let pos = buffer.pos();
        buffer.write_u16(0)?;

        self.write_rdata(buffer, true)?;

        let size = buffer.pos() - (pos + 2);
        buffer.set_u16(pos, size as u16)?;

        Ok(buffer.pos() - start_pos)
    }

    fn write_rdata<T: PacketBuffer>(&self, buffer: &mut T, compress: bool) -> Result<()> {
        let write_name = |buffer: &mut T, name: &str| {
            if compress {
                buffer.write_qname(name)
            } else {
                buffer.write_qname_uncompressed(name)
            }
        };

        match *self {
            DnsRecord::A { ref addr, .. } => {
                buffer.write_bytes(&addr.octets())?;
            }
            DnsRecord::Aaaa { ref addr, .. } => {
                for segment in &addr.segments() {
                    buffer.write_u16(*segment)?;
                }
            }
            DnsRecord::Ns { ref host, .. }
            | DnsRecord::Cname { ref host, .. }
            | DnsRecord::Ptr { ref host, .. } => {
                write_name(buffer, host)?;
            }
            DnsRecord::Srv {
                priority,
                weight,
                port,
                ref host,
                ..
            } => {
                buffer.write_u16(priority)?;
                buffer.write_u16(weight)?;
                buffer.write_u16(port)?;
                buffer.write_qname_uncompressed(host)?;
            }
            DnsRecord::Mx {
                priority, ref host, ..
            } => {
                buffer.write_u16(priority)?;
                write_name(buffer, host)?;
            }
            DnsRecord::Soa {
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ..
            } => {
                write_name(buffer, m_name)?;
                write_name(buffer, r_name)?;
                buffer.write_u32(serial)?;
                buffer.write_u32(refresh)?;
                buffer.write_u32(retry)?;
                buffer.write_u32(expire)?;
                buffer.write_u32(minimum)?;
            }
            DnsRecord::Txt { ref data, .. } => {
                for chunk in data {
                    let bytes = chunk.as_bytes();
                    let len = bytes.len().min(255);
                    buffer.write_u8(len as u8)?;
                    buffer.write_bytes(&bytes[..len])?;
                }
            }
            DnsRecord::Rrsig {
                type_covered,
                algorithm,
                labels,
                original_ttl,
                expiration,
                inception,
                key_tag,
                ref signer_name,
                ref signature,
                ..
            } => {
                buffer.write_u16(type_covered)?;
                buffer.write_u8(algorithm)?;
                buffer.write_u8(labels)?;
                buffer.write_u32(original_ttl)?;
                buffer.write_u32(expiration)?;
                buffer.write_u32(inception)?;
                buffer.write_u16(key_tag)?;
                buffer.write_qname_uncompressed(signer_name)?;
                buffer.write_bytes(signature)?;
            }
            DnsRecord::Dnskey {
                flags,
                protocol,
                algorithm,
                ref public_key,
                ..
            } => {
                buffer.write_u16(flags)?;
                buffer.write_u8(protocol)?;
                buffer.write_u8(algorithm)?;
                buffer.write_bytes(public_key)?;
            }
            DnsRecord::Opt { ref data, .. } | DnsRecord::Unknown { ref data, .. } => {
                buffer.write_bytes(data)?;
            }
        }

        Ok(())
    }

    /// Rdata in canonical form (RFC 4034 section 6.2): no compression and
    /// embedded names lowercased
    pub fn canonical_rdata(&self) -> Result<Vec<u8>> {
        let mut lowered = self.clone();
        match lowered {
            DnsRecord::Ns { ref mut host, .. }
            | DnsRecord::Cname { ref mut host, .. }
            | DnsRecord::Ptr { ref mut host, .. }
            | DnsRecord::Srv { ref mut host, .. }
            | DnsRecord::Mx { ref mut host, .. } => {
                *host = host.to_lowercase();
            }
            DnsRecord::Soa {
                ref mut m_name,
                ref mut r_name,
                ..
            } => {
                *m_name = m_name.to_lowercase();
                *r_name = r_name.to_lowercase();
            }
            DnsRecord::Rrsig {
                ref mut signer_name,
                ..
            } => {
                *signer_name = signer_name.to_lowercase();
            }
            _ => {}
        }

        let mut buffer = VectorPacketBuffer::new();
        lowered.write_rdata(&mut buffer, false)?;

        Ok(buffer.into_bytes())
    }

    pub fn get_querytype(&self) -> QueryType {
        match *self {
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::Aaaa { .. } => QueryType::Aaaa,
            DnsRecord::Ns { .. } => QueryType::Ns,
            DnsRecord::Cname { .. } => QueryType::Cname,
            DnsRecord::Ptr { .. } => QueryType::Ptr,
            DnsRecord::Srv { .. } => QueryType::Srv,
            DnsRecord::Mx { .. } => QueryType::Mx,
            DnsRecord::Unknown { qtype, .. } => QueryType::from_num(qtype),
            DnsRecord::Soa { .. } => QueryType::Soa,
            DnsRecord::Txt { .. } => QueryType::Txt,
            DnsRecord::Opt { .. } => QueryType::Opt,
            DnsRecord::Rrsig { .. } => QueryType::Rrsig,
            DnsRecord::Dnskey { .. } => QueryType::Dnskey,
        }
    }

    pub fn get_domain(&self) -> Option<String> {
        match *self {
            DnsRecord::A { ref domain, .. }
            | DnsRecord::Aaaa { ref domain, .. }
            | DnsRecord::Ns { ref domain, .. }
            | DnsRecord::Cname { ref domain, .. }
            | DnsRecord::Ptr { ref domain, .. }
            | DnsRecord::Srv { ref domain, .. }
            | DnsRecord::Mx { ref domain, .. }
            | DnsRecord::Unknown { ref domain, .. }
            | DnsRecord::Soa { ref domain, .. }
            | DnsRecord::Txt { ref domain, .. }
            | DnsRecord::Rrsig { ref domain, .. }
            | DnsRecord::Dnskey { ref domain, .. } => Some(domain.clone()),
            DnsRecord::Opt { .. } => None,
        }
    }

    fn ttl_mut(&mut self) -> Option<&mut TransientTtl> {
        match *self {
            DnsRecord::A { ref mut ttl, .. }
            | DnsRecord::Aaaa { ref mut ttl, .. }
            | DnsRecord::Ns { ref mut ttl, .. }
            | DnsRecord::Cname { ref mut ttl, .. }
            | DnsRecord::Ptr { ref mut ttl, .. }
            | DnsRecord::Srv { ref mut ttl, .. }
            | DnsRecord::Mx { ref mut ttl, .. }
            | DnsRecord::Unknown { ref mut ttl, .. }
            | DnsRecord::Soa { ref mut ttl, .. }
            | DnsRecord::Txt { ref mut ttl, .. }
            | DnsRecord::Rrsig { ref mut ttl, .. }
            | DnsRecord::Dnskey { ref mut ttl, .. } => Some(ttl),
            DnsRecord::Opt { .. } => None,
        }
    }

    pub fn get_ttl(&self) -> u32 {
        match *self {
            DnsRecord::A {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Aaaa {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Ns {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Cname {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Ptr {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Srv {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Mx {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Unknown {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Soa {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Txt {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Rrsig {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Dnskey {
                ttl: TransientTtl(ttl),
                ..
            } => ttl,
            DnsRecord::Opt { .. } => 0,
        }
    }

    pub fn set_ttl(&mut self, value: u32) {
        if let Some(ttl) = self.ttl_mut() {
            *ttl = TransientTtl(value);
        }
    }
}

/// The result code for a DNS query, as described in RFC 1035
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::NOERROR,
        }
    }

    /// Label used for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match *self {
            ResultCode::NOERROR => "noerror",
            ResultCode::FORMERR => "formerr",
            ResultCode::SERVFAIL => "servfail",
            ResultCode::NXDOMAIN => "nxdomain",
            ResultCode::NOTIMP => "notimp",
            ResultCode::REFUSED => "refused",
        }
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | ((self.opcode & 0x0F) << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.rescode as u8)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} opcode={} rcode={:?} qr={} aa={} tc={} rd={} ra={} ad={} cd={}",
            self.id,
            self.opcode,
            self.rescode,
            self.response,
            self.authoritative_answer,
            self.truncated_message,
            self.recursion_desired,
            self.recursion_available,
            self.authed_data,
            self.checking_disabled
        )
    }
}

/// Representation of a DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
    pub class: u16,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion {
            name,
            qtype,
            class: CLASS_IN,
        }
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;

        let typenum = self.qtype.to_num();
        buffer.write_u16(typenum)?;
        buffer.write_u16(self.class)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        self.class = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.name, self.qtype)
    }
}

/// EDNS0 parameters carried by an OPT record
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Edns {
    pub payload_size: u16,
    pub dnssec_ok: bool,
}

/// Iterate the options of an OPT record's rdata as (code, data) pairs.
/// Malformed trailing bytes are ignored.
pub fn edns_options(data: &[u8]) -> Vec<(u16, Vec<u8>)> {
    let mut options = Vec::new();
    let mut pos = 0;
    while pos + 4 <= data.len() {
        let code = ((data[pos] as u16) << 8) | data[pos + 1] as u16;
        let len = (((data[pos + 2] as u16) << 8) | data[pos + 3] as u16) as usize;
        pos += 4;
        if pos + len > data.len() {
            break;
        }
        options.push((code, data[pos..pos + len].to_vec()));
        pos += len;
    }

    options
}

/// Representation of a complete DNS packet
///
/// This is the work horse of the server. A DNS packet can be read and written
/// in a single operation, and is used both by the network facing components and
/// internally by the synthesizer, cache and forwarder.
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new("".to_string(), QueryType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            let rec = DnsRecord::read(buffer)?;
            result.answers.push(rec);
        }
        for _ in 0..result.header.authoritative_entries {
            let rec = DnsRecord::read(buffer)?;
            result.authorities.push(rec);
        }
        for _ in 0..result.header.resource_entries {
            let rec = DnsRecord::read(buffer)?;
            result.resources.push(rec);
        }

        Ok(result)
    }

    pub fn from_bytes(data: &[u8]) -> Result<DnsPacket> {
        let mut buffer = VectorPacketBuffer::from_bytes(data);
        DnsPacket::from_buffer(&mut buffer)
    }

    /// A reply skeleton for `request`: same id, opcode, question and RD bit
    pub fn reply_to(request: &DnsPacket) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = request.header.id;
        packet.header.opcode = request.header.opcode;
        packet.header.recursion_desired = request.header.recursion_desired;
        packet.header.checking_disabled = request.header.checking_disabled;
        packet.header.response = true;
        packet.questions = request.questions.clone();
        packet
    }

    pub fn get_ttl_from_soa(&self) -> Option<u32> {
        for answer in &self.authorities {
            if let DnsRecord::Soa { minimum, .. } = *answer {
                return Some(minimum);
            }
        }

        None
    }

    /// Smallest TTL across all sections, OPT excluded
    pub fn min_ttl(&self) -> Option<u32> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .filter(|rec| rec.get_querytype() != QueryType::Opt)
            .map(|rec| rec.get_ttl())
            .min()
    }

    pub fn edns(&self) -> Option<Edns> {
        self.resources.iter().find_map(|rec| match *rec {
            DnsRecord::Opt {
                packet_len, flags, ..
            } => Some(Edns {
                payload_size: packet_len,
                dnssec_ok: flags & EDNS_DO_FLAG != 0,
            }),
            _ => None,
        })
    }

    pub fn dnssec_ok(&self) -> bool {
        self.edns().map(|edns| edns.dnssec_ok).unwrap_or(false)
    }

    /// Replace any OPT record with one advertising `payload_size` and `dnssec_ok`,
    /// keeping the options of the existing record
    pub fn set_edns(&mut self, payload_size: u16, dnssec_ok: bool) {
        let data = self.take_opt().unwrap_or_default();
        let flags = if dnssec_ok { EDNS_DO_FLAG } else { 0 };

        self.resources.push(DnsRecord::Opt {
            packet_len: payload_size,
            flags,
            data,
        });
    }

    /// Remove the OPT record, returning its option bytes
    pub fn take_opt(&mut self) -> Option<Vec<u8>> {
        let idx = self
            .resources
            .iter()
            .position(|rec| rec.get_querytype() == QueryType::Opt)?;

        match self.resources.remove(idx) {
            DnsRecord::Opt { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn has_edns_option(&self, code: u16, value: &[u8]) -> bool {
        self.resources.iter().any(|rec| match *rec {
            DnsRecord::Opt { ref data, .. } => edns_options(data)
                .iter()
                .any(|(c, d)| *c == code && d.as_slice() == value),
            _ => false,
        })
    }

    /// Append an option to the OPT record, creating one if needed
    pub fn add_edns_option(&mut self, code: u16, value: &[u8]) {
        if self.edns().is_none() {
            self.set_edns(512, false);
        }

        for rec in self.resources.iter_mut() {
            if let DnsRecord::Opt { ref mut data, .. } = *rec {
                data.push((code >> 8) as u8);
                data.push((code & 0xFF) as u8);
                data.push((value.len() >> 8) as u8);
                data.push((value.len() & 0xFF) as u8);
                data.extend_from_slice(value);
                return;
            }
        }
    }

    fn write_all<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.header.questions = self.questions.len() as u16;
        self.header.answers = self.answers.len() as u16;
        self.header.authoritative_entries = self.authorities.len() as u16;
        self.header.resource_entries = self.resources.len() as u16;

        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
        {
            rec.write(buffer)?;
        }

        Ok(())
    }

    /// Serialize the packet. When the encoding exceeds `max_size` every record
    /// section is dropped, except the OPT record, and the TC bit is set.
    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();
        self.write_all(&mut test_buffer)?;

        if test_buffer.pos() <= max_size {
            buffer.write_bytes(test_buffer.as_bytes())?;
            return Ok(());
        }

        let mut truncated = DnsPacket {
            header: self.header.clone(),
            questions: self.questions.clone(),
            answers: Vec::new(),
            authorities: Vec::new(),
            resources: self
                .resources
                .iter()
                .filter(|rec| rec.get_querytype() == QueryType::Opt)
                .cloned()
                .collect(),
        };
        truncated.header.truncated_message = true;
        self.header.truncated_message = true;

        truncated.write_all(buffer)?;

        Ok(())
    }

    pub fn to_bytes(&mut self, max_size: usize) -> Result<Vec<u8>> {
        let mut buffer = VectorPacketBuffer::new();
        self.write(&mut buffer, max_size)?;

        Ok(buffer.into_bytes())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

    #[test]
    fn test_packet() {
        let mut packet = DnsPacket::new();
        packet.header.id = 1337;
        packet.header.response = true;

        packet
            .questions
            .push(DnsQuestion::new("web.skydns.local".to_string(), QueryType::Srv));
        packet.answers.push(DnsRecord::Srv {
            domain: "web.skydns.local".to_string(),
            priority: 10,
            weight: 0,
            port: 8080,
            host: "web.skydns.local".to_string(),
            ttl: TransientTtl(3600),
        });
        packet.answers.push(DnsRecord::Txt {
            domain: "web.skydns.local".to_string(),
            data: vec!["a=b".to_string(), "c".to_string()],
            ttl: TransientTtl(3600),
        });
        packet.authorities.push(DnsRecord::Soa {
            domain: "skydns.local".to_string(),
            m_name: "ns.dns.skydns.local".to_string(),
            r_name: "hostmaster.skydns.local".to_string(),
            serial: 1,
            refresh: 28800,
            retry: 7200,
            expire: 604800,
            minimum: 60,
            ttl: TransientTtl(60),
        });
        packet.resources.push(DnsRecord::A {
            domain: "web.skydns.local".to_string(),
            addr: "10.0.0.1".parse::<Ipv4Addr>().unwrap(),
            ttl: TransientTtl(3600),
        });
        packet.set_edns(4096, true);

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, 0xFFFF).unwrap();

        buffer.seek(0).unwrap();

        let parsed_packet = DnsPacket::from_buffer(&mut buffer).unwrap();

        assert_eq!(packet.questions[0], parsed_packet.questions[0]);
        assert_eq!(packet.answers, parsed_packet.answers);
        assert_eq!(packet.authorities, parsed_packet.authorities);
        assert_eq!(packet.resources, parsed_packet.resources);
        assert_eq!(Some(60), parsed_packet.get_ttl_from_soa());
        assert_eq!(
            Some(Edns {
                payload_size: 4096,
                dnssec_ok: true
            }),
            parsed_packet.edns()
        );
    }

    #[test]
    fn test_unknown_rdata_is_relayed() {
        let rec = DnsRecord::Unknown {
            domain: "example.com".to_string(),
            qtype: 65,
            class: CLASS_IN,
            data: vec![0, 1, 0, 0, 1, 0, 3, b'h', b'2', b'3'],
            ttl: TransientTtl(300),
        };

        let mut buffer = VectorPacketBuffer::new();
        rec.write(&mut buffer).unwrap();
        buffer.seek(0).unwrap();

        match DnsRecord::read(&mut buffer).unwrap() {
            DnsRecord::Unknown { qtype, data, .. } => {
                assert_eq!(65, qtype);
                assert_eq!(10, data.len());
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_truncation_keeps_opt() {
        let mut packet = DnsPacket::new();
        packet
            .questions
            .push(DnsQuestion::new("api.skydns.local".to_string(), QueryType::A));
        for i in 0..100u8 {
            packet.answers.push(DnsRecord::A {
                domain: "api.skydns.local".to_string(),
                addr: Ipv4Addr::new(10, 0, 0, i),
                ttl: TransientTtl(60),
            });
        }
        packet.set_edns(512, false);

        let bytes = packet.to_bytes(512).unwrap();
        assert!(bytes.len() <= 512);

        let parsed = DnsPacket::from_bytes(&bytes).unwrap();
        assert!(parsed.header.truncated_message);
        assert!(parsed.answers.is_empty());
        assert_eq!(1, parsed.resources.len());
        assert_eq!(1, parsed.questions.len());
    }

    #[test]
    fn test_edns_options() {
        let mut packet = DnsPacket::new();
        assert!(packet.edns().is_none());

        packet.add_edns_option(65011, &[1]);
        assert!(packet.has_edns_option(65011, &[1]));
        assert!(!packet.has_edns_option(65011, &[2]));

        packet.set_edns(1232, true);
        assert!(packet.has_edns_option(65011, &[1]));
        assert_eq!(1, packet.resources.len());
        assert!(packet.dnssec_ok());
    }

    #[test]
    fn test_canonical_rdata_lowercases_names() {
        let rec = DnsRecord::Cname {
            domain: "Alias.Example".to_string(),
            host: "Target.Example".to_string(),
            ttl: TransientTtl(60),
        };

        let rdata = rec.canonical_rdata().unwrap();
        assert_eq!(b"\x06target\x07example\x00".to_vec(), rdata);
    }

    #[test]
    fn test_header_counts_are_recomputed() {
        let mut packet = DnsPacket::new();
        packet.answers.push(DnsRecord::A {
            domain: "a.example".to_string(),
            addr: Ipv4Addr::new(127, 0, 0, 1),
            ttl: TransientTtl(1),
        });

        let first = packet.to_bytes(0xFFFF).unwrap();
        let second = packet.to_bytes(0xFFFF).unwrap();
        assert_eq!(first, second);
        assert_eq!(1, DnsPacket::from_bytes(&second).unwrap().answers.len());
    }
}
