//! skydns
//!
//! An authoritative DNS server for service discovery. Services registered in
//! an etcd-style registry are answered as A, AAAA, SRV, MX, TXT, PTR and
//! CNAME records; names outside the served zone are forwarded.
//!
//! # Architecture
//!
//! * `registry` - Access to the service registry
//! * `dns` - The DNS server proper
//! * `config` - Server configuration

/// Server configuration
pub mod config;

/// DNS server implementation and protocol handling
pub mod dns;

/// Service registry backends
pub mod registry;
