//! Property-based tests for name matching, rotation, TTLs and CNAME chasing

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use proptest::prelude::*;

use skydns::config::Config;
use skydns::dns::answer::{rotate_answers, Synthesizer, MAX_CHASE_DEPTH};
use skydns::dns::context::ServerContext;
use skydns::dns::protocol::{DnsRecord, QueryType, ResultCode, TransientTtl};
use skydns::registry::hierarchical::HierarchicalBackend;
use skydns::registry::memory::MemoryStore;
use skydns::registry::service::calculate_ttl;
use skydns::registry::Backend;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn config() -> Config {
    let mut config = Config::default();
    config.domain = "skydns.local.".to_string();
    config.no_rec = true;
    config.set_defaults();
    config
}

// Two-label service names below the domain, drawn from a small alphabet so
// that wildcards have something to match
fn service_names_strategy() -> impl Strategy<Value = BTreeSet<(String, String)>> {
    prop::collection::btree_set(("[a-c]", "[a-c]"), 1..9)
}

// A queried name of one or two labels, and which of them becomes `*`
fn query_strategy() -> impl Strategy<Value = (Vec<String>, usize)> {
    prop::collection::vec("[a-c]", 1..3).prop_flat_map(|labels| {
        let len = labels.len();
        (Just(labels), 0..len)
    })
}

fn dns_name(labels: &[String]) -> String {
    let mut parts = labels.iter().rev().cloned().collect::<Vec<String>>();
    parts.push("skydns".to_string());
    parts.push("local".to_string());
    parts.join(".")
}

fn key_path(labels: &[String]) -> String {
    format!("/skydns/local/skydns/{}", labels.join("/"))
}

fn under(key: &str, path: &str) -> bool {
    key == path || key.starts_with(&format!("{}/", path))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn wildcard_records_are_a_subset_of_exact_records(
        names in service_names_strategy(),
        (labels, star) in query_strategy(),
    ) {
        let store = Arc::new(MemoryStore::new());
        for (i, (top, leaf)) in names.iter().enumerate() {
            store.put(
                &format!("/skydns/local/skydns/{}/{}", top, leaf),
                &format!(r#"{{"host":"10.0.0.{}"}}"#, i + 1),
            );
        }
        let backend = HierarchicalBackend::new(store, config().backend_config());

        let mut wildcard = labels.clone();
        wildcard[star] = "*".to_string();

        let rt = runtime();
        let exact = rt
            .block_on(backend.records(&dns_name(&labels), false))
            .unwrap_or_default();
        let matched = rt
            .block_on(backend.records(&dns_name(&wildcard), false))
            .unwrap_or_default();

        let path = key_path(&labels);
        for service in matched.iter().filter(|s| under(&s.key, &path)) {
            prop_assert!(
                exact.contains(service),
                "{} matched {} but not {}",
                service.key,
                dns_name(&wildcard),
                dns_name(&labels)
            );
        }
    }

    #[test]
    fn rotation_puts_every_address_first_once(k in 2usize..8, start in 0usize..1_000_000) {
        let records = (0..k)
            .map(|i| DnsRecord::A {
                domain: "api.skydns.local".to_string(),
                addr: Ipv4Addr::new(10, 0, 0, i as u8 + 1),
                ttl: TransientTtl(3600),
            })
            .collect::<Vec<DnsRecord>>();

        let mut firsts = BTreeSet::new();
        for counter in start..start + k {
            let mut rotated = records.clone();
            rotate_answers(&mut rotated, counter);
            prop_assert_eq!(k, rotated.len());
            if let DnsRecord::A { addr, .. } = rotated[0] {
                firsts.insert(addr);
            }
        }

        prop_assert_eq!(k, firsts.len());
    }

    #[test]
    fn ttl_is_the_smaller_of_the_set_values(
        lease in prop_oneof![Just(0i64), -100i64..0, 1i64..100_000],
        service in prop_oneof![Just(0u32), 1u32..100_000],
        default in 1u32..100_000,
    ) {
        let ttl = calculate_ttl(lease, service, default);

        match (lease > 0, service > 0) {
            (false, false) => prop_assert_eq!(default, ttl),
            (false, true) => prop_assert_eq!(service, ttl),
            (true, false) => prop_assert_eq!(lease as u32, ttl),
            (true, true) => prop_assert_eq!((lease as u32).min(service), ttl),
        }
    }

    #[test]
    fn cname_chasing_is_bounded(len in 0usize..(MAX_CHASE_DEPTH * 2)) {
        let store = Arc::new(MemoryStore::new());
        for i in 0..len {
            store.put(
                &format!("/skydns/local/skydns/c{}", i),
                &format!(r#"{{"host":"c{}.skydns.local"}}"#, i + 1),
            );
        }
        store.put(&format!("/skydns/local/skydns/c{}", len), r#"{"host":"10.0.0.9"}"#);

        let config = config();
        let backend = Arc::new(HierarchicalBackend::new(store, config.backend_config()));
        let context = ServerContext::with_signer(config, backend, None);

        let rt = runtime();
        let mut synthesizer = Synthesizer::new(&context, false);
        let answer = rt.block_on(synthesizer.answer("c0.skydns.local", QueryType::A));

        prop_assert!(synthesizer.chased() <= MAX_CHASE_DEPTH + 1);
        if len <= MAX_CHASE_DEPTH {
            prop_assert_eq!(ResultCode::NOERROR, answer.rcode);
            prop_assert_eq!(len + 1, answer.answers.len());
        } else {
            prop_assert_eq!(ResultCode::SERVFAIL, answer.rcode);
            prop_assert!(answer.answers.is_empty());
        }
    }
}
