//! Benchmarks for the message codec and the response cache

use std::net::Ipv4Addr;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use skydns::dns::cache::{QuestionKey, ResponseCache};
use skydns::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, TransientTtl};

fn create_response(records: usize) -> DnsPacket {
    let mut request = DnsPacket::new();
    request.header.id = 4711;
    request.header.recursion_desired = true;
    request
        .questions
        .push(DnsQuestion::new("api.skydns.local".to_string(), QueryType::A));

    let mut response = DnsPacket::reply_to(&request);
    response.header.authoritative_answer = true;
    for i in 0..records {
        response.answers.push(DnsRecord::A {
            domain: "api.skydns.local".to_string(),
            addr: Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8),
            ttl: TransientTtl(3600),
        });
    }
    response.resources.push(DnsRecord::Srv {
        domain: "_http._tcp.api.skydns.local".to_string(),
        priority: 10,
        weight: 100,
        port: 8080,
        host: "api.skydns.local".to_string(),
        ttl: TransientTtl(3600),
    });
    response
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for records in [1usize, 8, 64].iter() {
        let packet = create_response(*records);
        group.throughput(Throughput::Elements(*records as u64));
        group.bench_with_input(BenchmarkId::from_parameter(records), &packet, |b, packet| {
            b.iter(|| {
                let mut packet = packet.clone();
                black_box(packet.to_bytes(0xFFFF).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for records in [1usize, 8, 64].iter() {
        let bytes = create_response(*records).to_bytes(0xFFFF).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(records), &bytes, |b, bytes| {
            b.iter(|| black_box(DnsPacket::from_bytes(black_box(bytes)).unwrap()));
        });
    }

    group.finish();
}

fn bench_truncation(c: &mut Criterion) {
    let packet = create_response(64);

    c.bench_function("truncate_to_512", |b| {
        b.iter(|| {
            let mut packet = packet.clone();
            black_box(packet.to_bytes(512).unwrap())
        });
    });
}

fn bench_cache(c: &mut Criterion) {
    let cache = ResponseCache::new(10_000, 60, 60);
    for i in 0..1_000 {
        let name = format!("svc{}.skydns.local", i);
        let mut packet = create_response(2);
        packet.questions[0].name = name.clone();
        cache.store(QuestionKey::new(&name, QueryType::A, false), &packet);
    }

    let hit = QuestionKey::new("svc500.skydns.local", QueryType::A, false);
    let miss = QuestionKey::new("missing.skydns.local", QueryType::A, false);

    c.bench_function("cache_hit", |b| {
        b.iter(|| black_box(cache.lookup(black_box(&hit), 1, true)))
    });
    c.bench_function("cache_miss", |b| {
        b.iter(|| black_box(cache.lookup(black_box(&miss), 1, true)))
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_truncation, bench_cache);
criterion_main!(benches);
