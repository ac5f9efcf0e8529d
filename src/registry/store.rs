//! Access to the raw registry
//!
//! Two store shapes are supported. A `TreeStore` returns a directory tree for
//! a key, with remaining TTLs on leaves, and supports waiting for the next
//! change below a key. A `KvStore` returns flat key/value pairs for a prefix,
//! each with an optional lease TTL, and supports subscribing to changes.

use async_trait::async_trait;
use derive_more::{Display, Error};
use serde::Deserialize;
use tokio::sync::mpsc;

#[derive(Debug, Display, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[display(fmt = "key not found")]
    KeyNotFound,
    #[display(fmt = "registry unavailable: {}", _0)]
    Unavailable(#[error(not(source))] String),
    #[display(fmt = "malformed registry response: {}", _0)]
    Malformed(#[error(not(source))] String),
    #[display(fmt = "watch closed")]
    WatchClosed,
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            StoreError::Malformed(e.to_string())
        } else {
            StoreError::Unavailable(e.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Malformed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A node of a hierarchical registry. Leaves carry a value, directories
/// carry children. The TTL is the remaining lifetime in seconds, 0 if none.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Node {
    pub key: String,
    pub value: Option<String>,
    pub dir: bool,
    pub ttl: i64,
    pub nodes: Vec<Node>,
    #[serde(rename = "modifiedIndex")]
    pub modified_index: u64,
}

impl Node {
    pub fn leaf(key: &str, value: &str, ttl: i64) -> Node {
        Node {
            key: key.to_string(),
            value: Some(value.to_string()),
            ttl,
            ..Node::default()
        }
    }

    pub fn directory(key: &str, nodes: Vec<Node>) -> Node {
        Node {
            key: key.to_string(),
            dir: true,
            nodes,
            ..Node::default()
        }
    }
}

#[async_trait]
pub trait TreeStore: Send + Sync + 'static {
    /// Fetch the node at `key`, with all descendants when `recursive` is set
    async fn get(&self, key: &str, recursive: bool) -> Result<Node>;

    /// Block until something below `key` changes after `after_index`, where
    /// 0 means any change from now on. Returns the index of the change.
    async fn wait_next(&self, key: &str, after_index: u64) -> Result<u64>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,

    /// Remaining lease TTL in seconds, 0 when the key has no lease
    pub lease_ttl: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Put(String),
    Delete(String),
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(key) | WatchEvent::Delete(key) => key,
        }
    }
}

pub type WatchReceiver = mpsc::Receiver<Result<WatchEvent>>;

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// All pairs whose key starts with `prefix`, sorted by key
    async fn range(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// The pair stored at exactly `key`
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    /// Subscribe to changes of keys starting with `prefix`. The receiver
    /// yields an error, or closes, when the subscription is lost.
    async fn watch(&self, prefix: &str) -> Result<WatchReceiver>;
}
