//! DNS Response Cache
//!
//! Whole responses are cached under the question they answer together with
//! the DO bit of the query. Entries live for the smallest TTL of the
//! response, bounded by the configured maximum; negative answers live for the
//! SOA minimum. Entries are never counted down: a hit returns the TTLs as
//! they were stored.
//!
//! Expired entries are removed lazily when looked up. When the cache is over
//! capacity a random entry is evicted.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::dns::metrics::{record_cache_operation, DNS_CACHE_SIZE};
use crate::dns::protocol::{DnsPacket, QueryType, ResultCode};
use crate::registry::path::normalize_name;

const CACHE_NAME: &str = "response";

/// Identity of a cached response
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QuestionKey {
    pub name: String,
    pub qtype: QueryType,
    pub dnssec_ok: bool,
}

impl QuestionKey {
    pub fn new(name: &str, qtype: QueryType, dnssec_ok: bool) -> QuestionKey {
        QuestionKey {
            name: normalize_name(name),
            qtype,
            dnssec_ok,
        }
    }
}

struct CacheEntry {
    packet: DnsPacket,
    expires: Instant,
}

pub struct ResponseCache {
    capacity: usize,
    max_ttl: u32,
    min_ttl: u32,
    entries: RwLock<HashMap<QuestionKey, CacheEntry>>,
}

impl ResponseCache {
    /// A cache holding at most `capacity` responses for at most `max_ttl`
    /// seconds. Negative answers without an SOA are kept for `min_ttl`.
    pub fn new(capacity: usize, max_ttl: u32, min_ttl: u32) -> ResponseCache {
        ResponseCache {
            capacity,
            max_ttl,
            min_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the cached response for `key`, with the id of the current
    /// query and the RA bit recomputed
    pub fn lookup(
        &self,
        key: &QuestionKey,
        id: u16,
        recursion_available: bool,
    ) -> Option<DnsPacket> {
        if !self.is_enabled() {
            return None;
        }

        let now = Instant::now();
        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires > now => {
                    let mut packet = entry.packet.clone();
                    packet.header.id = id;
                    packet.header.recursion_available = recursion_available;

                    record_cache_operation(CACHE_NAME, "hit");
                    return Some(packet);
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write();
            if entries.get(key).map(|e| e.expires <= now).unwrap_or(false) {
                entries.remove(key);
                DNS_CACHE_SIZE
                    .with_label_values(&[CACHE_NAME])
                    .set(entries.len() as i64);
            }
            record_cache_operation(CACHE_NAME, "expired");
        }

        record_cache_operation(CACHE_NAME, "miss");
        None
    }

    /// Lifetime of `packet` in the cache, None if it must not be cached
    pub fn ttl_for(&self, packet: &DnsPacket) -> Option<u32> {
        let ttl = match packet.header.rescode {
            ResultCode::NOERROR if !packet.answers.is_empty() => packet.min_ttl()?,
            ResultCode::NOERROR | ResultCode::NXDOMAIN => {
                packet.get_ttl_from_soa().unwrap_or(self.min_ttl)
            }
            _ => return None,
        };

        match ttl.min(self.max_ttl) {
            0 => None,
            ttl => Some(ttl),
        }
    }

    pub fn store(&self, key: QuestionKey, packet: &DnsPacket) {
        if !self.is_enabled() {
            return;
        }

        let ttl = match self.ttl_for(packet) {
            Some(ttl) => ttl,
            None => return,
        };

        let entry = CacheEntry {
            packet: packet.clone(),
            expires: Instant::now() + Duration::from_secs(ttl as u64),
        };

        let mut entries = self.entries.write();
        entries.insert(key.clone(), entry);

        while entries.len() > self.capacity {
            let idx = rand::random::<usize>() % entries.len();
            let victim = match entries.keys().nth(idx) {
                Some(victim) if *victim != key => victim.clone(),
                _ => continue,
            };
            entries.remove(&victim);
            record_cache_operation(CACHE_NAME, "eviction");
        }

        DNS_CACHE_SIZE
            .with_label_values(&[CACHE_NAME])
            .set(entries.len() as i64);
    }
}
