//! Online DNSSEC signing
//!
//! Responses for the authoritative zone are signed when they are produced,
//! with a single key loaded from a BIND style key pair (`K<zone>+<alg>+<tag>.key`
//! and `.private`). Signatures are memoized in the signature cache. Denial of
//! existence is not proven: no NSEC or NSEC3 records are generated.
//!
//! # Supported algorithms
//!
//! * RSASHA1 (5), RSASHA1-NSEC3-SHA1 (7), RSASHA256 (8), RSASHA512 (10)
//! * ECDSAP256SHA256 (13), ECDSAP384SHA384 (14)
//! * ED25519 (15)

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;

use crate::dns::buffer::{BufferError, PacketBuffer, VectorPacketBuffer};
use crate::dns::metrics::DNSSEC_OPERATIONS;
use crate::dns::protocol::{
    DnsPacket, DnsRecord, ProtocolError, QueryType, ResultCode, TransientTtl, CLASS_IN,
};
use crate::dns::sigcache::{SignatureCache, SignatureKey};
use crate::registry::path::{is_subdomain, normalize_name};

#[derive(Debug, Display, From, Error)]
pub enum DnssecError {
    Io(std::io::Error),
    Crypto(ErrorStack),
    Protocol(ProtocolError),
    Buffer(BufferError),
    Base64(base64::DecodeError),
    #[display(fmt = "malformed key file: {}", _0)]
    #[from(ignore)]
    MalformedKey(#[error(not(source))] String),
    #[display(fmt = "unsupported algorithm {}", _0)]
    #[from(ignore)]
    UnsupportedAlgorithm(#[error(not(source))] u8),
    #[display(fmt = "key owner {} does not match zone", _0)]
    #[from(ignore)]
    OwnerMismatch(#[error(not(source))] String),
    #[display(fmt = "can not sign an empty rrset")]
    #[from(ignore)]
    EmptyRrset,
}

type Result<T> = std::result::Result<T, DnssecError>;

/// DNSKEY protocol field, always 3
const DNSKEY_PROTOCOL: u8 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Algorithm {
    RsaSha1 = 5,
    RsaSha1Nsec3Sha1 = 7,
    RsaSha256 = 8,
    RsaSha512 = 10,
    EcdsaP256Sha256 = 13,
    EcdsaP384Sha384 = 14,
    Ed25519 = 15,
}

impl Algorithm {
    pub fn from_num(num: u8) -> Result<Algorithm> {
        match num {
            5 => Ok(Algorithm::RsaSha1),
            7 => Ok(Algorithm::RsaSha1Nsec3Sha1),
            8 => Ok(Algorithm::RsaSha256),
            10 => Ok(Algorithm::RsaSha512),
            13 => Ok(Algorithm::EcdsaP256Sha256),
            14 => Ok(Algorithm::EcdsaP384Sha384),
            15 => Ok(Algorithm::Ed25519),
            _ => Err(DnssecError::UnsupportedAlgorithm(num)),
        }
    }

    pub fn to_num(self) -> u8 {
        self as u8
    }

    fn digest(self) -> Option<MessageDigest> {
        match self {
            Algorithm::RsaSha1 | Algorithm::RsaSha1Nsec3Sha1 => Some(MessageDigest::sha1()),
            Algorithm::RsaSha256 | Algorithm::EcdsaP256Sha256 => Some(MessageDigest::sha256()),
            Algorithm::EcdsaP384Sha384 => Some(MessageDigest::sha384()),
            Algorithm::RsaSha512 => Some(MessageDigest::sha512()),
            Algorithm::Ed25519 => None,
        }
    }

    /// Size of r and s in an ECDSA signature
    fn ecdsa_size(self) -> Option<usize> {
        match self {
            Algorithm::EcdsaP256Sha256 => Some(32),
            Algorithm::EcdsaP384Sha384 => Some(48),
            _ => None,
        }
    }
}

/// The public half of a key, as published in the DNSKEY record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub owner: String,
    pub flags: u16,
    pub protocol: u8,
    pub algorithm: Algorithm,
    pub key: Vec<u8>,
}

impl PublicKey {
    /// Parse the DNSKEY line of a `.key` file
    pub fn parse(text: &str) -> Result<PublicKey> {
        let line = text
            .lines()
            .map(|line| line.trim())
            .find(|line| !line.is_empty() && !line.starts_with(';'))
            .ok_or_else(|| DnssecError::MalformedKey("no DNSKEY record".to_string()))?;

        let fields = line.split_whitespace().collect::<Vec<&str>>();
        let idx = fields
            .iter()
            .position(|field| field.eq_ignore_ascii_case("DNSKEY"))
            .ok_or_else(|| DnssecError::MalformedKey("no DNSKEY record".to_string()))?;

        if fields.len() < idx + 5 {
            return Err(DnssecError::MalformedKey(line.to_string()));
        }

        let number = |field: &str| {
            field
                .parse::<u16>()
                .map_err(|_| DnssecError::MalformedKey(line.to_string()))
        };

        let flags = number(fields[idx + 1])?;
        let protocol = number(fields[idx + 2])? as u8;
        if protocol != DNSKEY_PROTOCOL {
            return Err(DnssecError::MalformedKey(line.to_string()));
        }
        let algorithm = Algorithm::from_num(number(fields[idx + 3])? as u8)?;
        let key = base64::decode(fields[idx + 4..].concat())?;

        Ok(PublicKey {
            owner: normalize_name(fields[0]),
            flags,
            protocol,
            algorithm,
            key,
        })
    }

    /// DNSKEY rdata in wire form
    pub fn rdata(&self) -> Vec<u8> {
        let mut rdata = Vec::with_capacity(4 + self.key.len());
        rdata.extend_from_slice(&self.flags.to_be_bytes());
        rdata.push(self.protocol);
        rdata.push(self.algorithm.to_num());
        rdata.extend_from_slice(&self.key);

        rdata
    }

    /// Key tag as defined in RFC 4034 appendix B
    pub fn key_tag(&self) -> u16 {
        key_tag(&self.rdata())
    }
}

pub fn key_tag(rdata: &[u8]) -> u16 {
    let mut ac: u32 = 0;
    for (i, byte) in rdata.iter().enumerate() {
        if i & 1 == 1 {
            ac += *byte as u32;
        } else {
            ac += (*byte as u32) << 8;
        }
    }
    ac += (ac >> 16) & 0xFFFF;

    (ac & 0xFFFF) as u16
}

/// Fields of a BIND `.private` file
fn private_fields(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(2, ':');
            let name = parts.next()?.trim();
            let value = parts.next()?.trim();
            Some((name.to_lowercase(), value.to_string()))
        })
        .collect()
}

fn private_field(fields: &[(String, String)], name: &str) -> Result<Vec<u8>> {
    let value = fields
        .iter()
        .find(|(field, _)| field == name)
        .map(|(_, value)| value)
        .ok_or_else(|| DnssecError::MalformedKey(format!("missing {}", name)))?;

    Ok(base64::decode(value)?)
}

fn private_bignum(fields: &[(String, String)], name: &str) -> Result<BigNum> {
    Ok(BigNum::from_slice(&private_field(fields, name)?)?)
}

/// Build the private key described by a `.private` file
pub fn parse_private_key(algorithm: Algorithm, text: &str) -> Result<PKey<Private>> {
    let fields = private_fields(text);

    match algorithm {
        Algorithm::RsaSha1
        | Algorithm::RsaSha1Nsec3Sha1
        | Algorithm::RsaSha256
        | Algorithm::RsaSha512 => {
            let rsa = Rsa::from_private_components(
                private_bignum(&fields, "modulus")?,
                private_bignum(&fields, "publicexponent")?,
                private_bignum(&fields, "privateexponent")?,
                private_bignum(&fields, "prime1")?,
                private_bignum(&fields, "prime2")?,
                private_bignum(&fields, "exponent1")?,
                private_bignum(&fields, "exponent2")?,
                private_bignum(&fields, "coefficient")?,
            )?;
            Ok(PKey::from_rsa(rsa)?)
        }
        Algorithm::EcdsaP256Sha256 | Algorithm::EcdsaP384Sha384 => {
            let nid = if algorithm == Algorithm::EcdsaP256Sha256 {
                Nid::X9_62_PRIME256V1
            } else {
                Nid::SECP384R1
            };
            let group = EcGroup::from_curve_name(nid)?;
            let private = private_bignum(&fields, "privatekey")?;

            let ctx = BigNumContext::new()?;
            let mut public = EcPoint::new(&group)?;
            public.mul_generator(&group, &private, &ctx)?;

            let ec = EcKey::from_private_components(&group, &private, &public)?;
            Ok(PKey::from_ec_key(ec)?)
        }
        Algorithm::Ed25519 => {
            let seed = private_field(&fields, "privatekey")?;
            Ok(PKey::private_key_from_raw_bytes(&seed, Id::ED25519)?)
        }
    }
}

/// Owner name in canonical wire form: uncompressed and lowercase
fn canonical_name(name: &str) -> Result<Vec<u8>> {
    let mut buffer = VectorPacketBuffer::new();
    buffer.write_qname_uncompressed(&normalize_name(name))?;

    Ok(buffer.into_bytes())
}

/// Label count of an owner name for the RRSIG labels field. A leading
/// wildcard label does not count.
fn label_count(name: &str) -> u8 {
    let name = normalize_name(name);
    if name.is_empty() {
        return 0;
    }

    let labels = name.split('.').collect::<Vec<&str>>();
    let skip = if labels[0] == "*" { 1 } else { 0 };

    (labels.len() - skip) as u8
}

/// Unix time as carried in RRSIG records
pub fn unix_now() -> u32 {
    chrono::Utc::now().timestamp().max(0) as u32
}

struct RrsigTemplate<'a> {
    owner: &'a str,
    type_covered: u16,
    algorithm: u8,
    labels: u8,
    original_ttl: u32,
    expiration: u32,
    inception: u32,
    key_tag: u16,
    signer: &'a str,
}

/// Canonical RRset bytes: every record as owner, type, class, TTL and
/// canonical rdata, sorted by rdata
fn canonical_rrset(rrset: &[DnsRecord], original_ttl: u32) -> Result<Vec<u8>> {
    let mut rdatas = rrset
        .iter()
        .map(|rec| rec.canonical_rdata())
        .collect::<std::result::Result<Vec<Vec<u8>>, ProtocolError>>()?;
    rdatas.sort();
    rdatas.dedup();

    let first = &rrset[0];
    let owner = canonical_name(&first.get_domain().unwrap_or_default())?;
    let qtype = first.get_querytype().to_num();

    let mut out = Vec::new();
    for rdata in rdatas {
        out.extend_from_slice(&owner);
        out.extend_from_slice(&qtype.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&original_ttl.to_be_bytes());
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
    }

    Ok(out)
}

/// The data an RRSIG signature is computed over (RFC 4034 section 3.1.8.1)
fn signing_input(template: &RrsigTemplate<'_>, canonical: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&template.type_covered.to_be_bytes());
    out.push(template.algorithm);
    out.push(template.labels);
    out.extend_from_slice(&template.original_ttl.to_be_bytes());
    out.extend_from_slice(&template.expiration.to_be_bytes());
    out.extend_from_slice(&template.inception.to_be_bytes());
    out.extend_from_slice(&template.key_tag.to_be_bytes());
    out.extend_from_slice(&canonical_name(template.signer)?);
    out.extend_from_slice(canonical);

    Ok(out)
}

fn pad_left(bytes: Vec<u8>, size: usize) -> Vec<u8> {
    if bytes.len() >= size {
        return bytes;
    }

    let mut padded = vec![0; size - bytes.len()];
    padded.extend_from_slice(&bytes);
    padded
}

/// Signing parameters taken from the server configuration
#[derive(Clone, Debug)]
pub struct SignerConfig {
    pub zone: String,
    pub inception: Duration,
    pub expiration: Duration,
    pub dnskey_ttl: u32,
}

/// Signs RRsets of the authoritative zone with one key
pub struct ZoneSigner {
    config: SignerConfig,
    public: PublicKey,
    key_tag: u16,
    private: PKey<Private>,
    cache: Option<Arc<SignatureCache>>,
}

impl ZoneSigner {
    /// Load `<base>.key` and `<base>.private`. The key's owner must be the
    /// zone being served.
    pub fn load(base: &str, config: SignerConfig) -> Result<ZoneSigner> {
        let base = base
            .trim_end_matches(".key")
            .trim_end_matches(".private")
            .to_string();

        let public = fs::read_to_string(format!("{}.key", base))?;
        let private = fs::read_to_string(format!("{}.private", base))?;

        ZoneSigner::from_key_files(&public, &private, config)
    }

    pub fn from_key_files(public: &str, private: &str, config: SignerConfig) -> Result<ZoneSigner> {
        let public = PublicKey::parse(public)?;
        if public.owner != normalize_name(&config.zone) {
            return Err(DnssecError::OwnerMismatch(public.owner));
        }

        let private = parse_private_key(public.algorithm, private)?;
        let key_tag = public.key_tag();

        log::info!(
            "loaded DNSSEC key for {} (algorithm {}, tag {})",
            public.owner,
            public.algorithm.to_num(),
            key_tag
        );

        Ok(ZoneSigner {
            config,
            public,
            key_tag,
            private,
            cache: None,
        })
    }

    pub fn with_cache(mut self, cache: Arc<SignatureCache>) -> ZoneSigner {
        self.cache = Some(cache);
        self
    }

    /// The cache signatures are memoized in, if any
    pub fn signature_cache(&self) -> Option<&SignatureCache> {
        self.cache.as_deref()
    }

    pub fn zone(&self) -> &str {
        &self.config.zone
    }

    pub fn key_tag(&self) -> u16 {
        self.key_tag
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The DNSKEY record published at the zone apex
    pub fn dnskey(&self) -> DnsRecord {
        DnsRecord::Dnskey {
            domain: self.config.zone.clone(),
            flags: self.public.flags,
            protocol: self.public.protocol,
            algorithm: self.public.algorithm.to_num(),
            public_key: self.public.key.clone(),
            ttl: TransientTtl(self.config.dnskey_ttl),
        }
    }

    fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let algorithm = self.public.algorithm;

        let signature = match algorithm.digest() {
            Some(digest) => {
                let mut signer = Signer::new(digest, &self.private)?;
                signer.update(data)?;
                signer.sign_to_vec()?
            }
            None => {
                let mut signer = Signer::new_without_digest(&self.private)?;
                signer.sign_oneshot_to_vec(data)?
            }
        };

        match algorithm.ecdsa_size() {
            Some(size) => {
                let sig = EcdsaSig::from_der(&signature)?;
                let mut raw = pad_left(sig.r().to_vec(), size);
                raw.extend_from_slice(&pad_left(sig.s().to_vec(), size));
                Ok(raw)
            }
            None => Ok(signature),
        }
    }

    /// RRSIG over `rrset`, all records sharing owner and type
    pub fn sign_rrset(&self, rrset: &[DnsRecord], now: u32) -> Result<DnsRecord> {
        let first = rrset.first().ok_or(DnssecError::EmptyRrset)?;
        let owner = first.get_domain().unwrap_or_default();
        let original_ttl = rrset.iter().map(|rec| rec.get_ttl()).min().unwrap_or(0);
        let type_covered = first.get_querytype().to_num();

        let canonical = canonical_rrset(rrset, original_ttl)?;
        let cache_key = SignatureKey::new(&canonical, type_covered, &self.config.zone);

        if let Some(cache) = &self.cache {
            if let Some(mut rrsig) = cache.lookup(&cache_key, now) {
                DNSSEC_OPERATIONS.with_label_values(&["sign", "cached"]).inc();
                rrsig.set_ttl(original_ttl);
                return Ok(rrsig);
            }
        }

        let template = RrsigTemplate {
            owner: &owner,
            type_covered,
            algorithm: self.public.algorithm.to_num(),
            labels: label_count(&owner),
            original_ttl,
            expiration: now.saturating_add(self.config.expiration.as_secs() as u32),
            inception: now.saturating_sub(self.config.inception.as_secs() as u32),
            key_tag: self.key_tag,
            signer: &self.config.zone,
        };

        let input = signing_input(&template, &canonical)?;
        let signature = match self.sign_bytes(&input) {
            Ok(signature) => signature,
            Err(e) => {
                DNSSEC_OPERATIONS.with_label_values(&["sign", "error"]).inc();
                return Err(e);
            }
        };
        DNSSEC_OPERATIONS.with_label_values(&["sign", "success"]).inc();

        let rrsig = DnsRecord::Rrsig {
            domain: template.owner.to_string(),
            type_covered: template.type_covered,
            algorithm: template.algorithm,
            labels: template.labels,
            original_ttl: template.original_ttl,
            expiration: template.expiration,
            inception: template.inception,
            key_tag: template.key_tag,
            signer_name: template.signer.to_string(),
            signature,
            ttl: TransientTtl(original_ttl),
        };

        if let Some(cache) = &self.cache {
            cache.store(cache_key, rrsig.clone());
        }

        Ok(rrsig)
    }

    /// Sign every RRset of a section, appending the signatures
    fn sign_section(&self, section: &mut Vec<DnsRecord>, now: u32) -> Result<()> {
        let mut rrsets: Vec<(String, QueryType, Vec<DnsRecord>)> = Vec::new();
        for rec in section.iter() {
            let qtype = rec.get_querytype();
            if qtype == QueryType::Opt || qtype == QueryType::Rrsig {
                continue;
            }

            // records relayed from upstreams for out-of-zone targets stay unsigned
            let owner = normalize_name(&rec.get_domain().unwrap_or_default());
            if !is_subdomain(&owner, self.zone()) {
                continue;
            }

            match rrsets
                .iter_mut()
                .find(|(o, t, _)| *o == owner && *t == qtype)
            {
                Some((_, _, records)) => records.push(rec.clone()),
                None => rrsets.push((owner, qtype, vec![rec.clone()])),
            }
        }

        for (_, _, rrset) in rrsets {
            let rrsig = self.sign_rrset(&rrset, now)?;
            section.push(rrsig);
        }

        Ok(())
    }

    /// Sign the answer, authority and additional sections of a response.
    /// An NXDOMAIN response keeps only its SOA in the authority section.
    pub fn sign_packet(&self, packet: &mut DnsPacket, now: u32) -> Result<()> {
        if packet.header.rescode == ResultCode::NXDOMAIN {
            packet
                .authorities
                .retain(|rec| rec.get_querytype() == QueryType::Soa);
        }

        self.sign_section(&mut packet.answers, now)?;
        self.sign_section(&mut packet.authorities, now)?;
        self.sign_section(&mut packet.resources, now)?;

        packet.header.authed_data = true;

        Ok(())
    }
}
