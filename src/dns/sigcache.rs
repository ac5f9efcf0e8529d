//! Cache of RRSIG records produced by the online signer
//!
//! A signature is looked up by a digest over the canonical form of the RRset
//! it covers, so the same set of records signed twice yields one entry.

use std::collections::HashMap;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::dns::metrics::{record_cache_operation, DNS_CACHE_SIZE};
use crate::dns::protocol::DnsRecord;

const CACHE_NAME: &str = "signature";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SignatureKey {
    digest: [u8; 32],
}

impl SignatureKey {
    /// Key for an RRset given in canonical wire form
    pub fn new(canonical_rrset: &[u8], type_covered: u16, signer: &str) -> SignatureKey {
        let mut hasher = Sha256::new();
        hasher.update(canonical_rrset);
        hasher.update(type_covered.to_be_bytes());
        hasher.update(signer.to_lowercase().as_bytes());

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());

        SignatureKey { digest }
    }
}

pub struct SignatureCache {
    capacity: usize,
    skew: u32,
    entries: RwLock<HashMap<SignatureKey, DnsRecord>>,
}

/// Inception and expiration of an RRSIG, None for any other record
fn validity(rrsig: &DnsRecord) -> Option<(u32, u32)> {
    match *rrsig {
        DnsRecord::Rrsig {
            inception,
            expiration,
            ..
        } => Some((inception, expiration)),
        _ => None,
    }
}

impl SignatureCache {
    /// A cache of at most `capacity` signatures. A signature is only handed
    /// out while `inception - skew <= now <= expiration - skew`.
    pub fn new(capacity: usize, skew: u32) -> SignatureCache {
        SignatureCache {
            capacity,
            skew,
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

    fn is_valid(&self, rrsig: &DnsRecord, now: u32) -> bool {
        match validity(rrsig) {
            Some((inception, expiration)) => {
                inception.saturating_sub(self.skew) <= now
                    && now <= expiration.saturating_sub(self.skew)
            }
            None => false,
        }
    }

    pub fn lookup(&self, key: &SignatureKey, now: u32) -> Option<DnsRecord> {
        if !self.is_enabled() {
            return None;
        }

        let stale = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(rrsig) if self.is_valid(rrsig, now) => {
                    record_cache_operation(CACHE_NAME, "hit");
                    return Some(rrsig.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if stale {
            let mut entries = self.entries.write();
            entries.remove(key);
            DNS_CACHE_SIZE
                .with_label_values(&[CACHE_NAME])
                .set(entries.len() as i64);
            record_cache_operation(CACHE_NAME, "expired");
        }

        record_cache_operation(CACHE_NAME, "miss");
        None
    }

    pub fn store(&self, key: SignatureKey, rrsig: DnsRecord) {
        if !self.is_enabled() || validity(&rrsig).is_none() {
            return;
        }

        let mut entries = self.entries.write();
        entries.insert(key.clone(), rrsig);

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::TransientTtl;

    fn rrsig(inception: u32, expiration: u32) -> DnsRecord {
        DnsRecord::Rrsig {
            domain: "web.skydns.local".to_string(),
            type_covered: 1,
            algorithm: 13,
            labels: 3,
            original_ttl: 3600,
            expiration,
            inception,
            key_tag: 1234,
            signer_name: "skydns.local".to_string(),
            signature: vec![1, 2, 3],
            ttl: TransientTtl(3600),
        }
    }

    #[test]
    fn test_key_covers_type_and_signer() {
        let a = SignatureKey::new(b"rrset", 1, "skydns.local");
        assert_eq!(a, SignatureKey::new(b"rrset", 1, "SkyDNS.local"));
        assert_ne!(a, SignatureKey::new(b"rrset", 28, "skydns.local"));
        assert_ne!(a, SignatureKey::new(b"other", 1, "skydns.local"));
    }

    #[test]
    fn test_validity_window() {
        let day = 86400;
        let cache = SignatureCache::new(10, day);
        let key = SignatureKey::new(b"rrset", 1, "skydns.local");

        cache.store(key.clone(), rrsig(1_000_000, 1_000_000 + 7 * day));

        assert!(cache.lookup(&key, 1_000_000 + day).is_some());
        assert!(cache.lookup(&key, 1_000_000 + 6 * day).is_some());

        assert!(cache.lookup(&key, 1_000_000 + 6 * day + 1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_and_disabled() {
        let cache = SignatureCache::new(2, 0);
        for i in 0..5u8 {
            cache.store(SignatureKey::new(&[i], 1, "skydns.local"), rrsig(0, u32::MAX));
        }
        assert_eq!(2, cache.len());

        let disabled = SignatureCache::new(0, 0);
        let key = SignatureKey::new(b"rrset", 1, "skydns.local");
        disabled.store(key.clone(), rrsig(0, u32::MAX));
        assert!(disabled.lookup(&key, 10).is_none());
    }
}
