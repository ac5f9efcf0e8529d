//! DNS protocol and server
//!
//! # Module Structure
//!
//! * `protocol` - DNS protocol definitions and packet handling
//! * `server` - UDP and TCP listeners and the query pipeline
//! * `answer` - Synthesis of answers from registry services
//! * `client` - Forwarding of queries to upstream servers
//! * `cache` - Response caching with TTL support
//! * `dnssec` - Online signing of authoritative answers
//! * `stub` - Stub zones learned from the registry
//! * `context` - Shared server state

/// Answer synthesis from registry services
pub mod answer;

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// DNS response caching with TTL support
pub mod cache;

/// Upstream forwarding client
pub mod client;

/// Server configuration and shared context
pub mod context;

/// Online DNSSEC signing
pub mod dnssec;

/// Log subscriber setup
pub mod logging;

/// Prometheus metrics collection and export
pub mod metrics;

/// Internal network utilities
pub mod netutil;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// UDP and TCP DNS server implementations
pub mod server;

/// Graceful shutdown coordination
pub mod shutdown;

/// Signature memoization
pub mod sigcache;

/// Stub zone table and watcher
pub mod stub;
