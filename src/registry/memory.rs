//! An in-memory registry
//!
//! `MemoryStore` implements both store shapes over one sorted key space, so
//! the same data can back either backend. Every mutation is recorded in a
//! change history and broadcast to watchers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::registry::store::{
    KeyValue, KvStore, Node, Result, StoreError, TreeStore, WatchEvent, WatchReceiver,
};

#[derive(Clone, Debug)]
struct Entry {
    value: Vec<u8>,
    ttl: i64,
    modified_index: u64,
}

#[derive(Clone, Debug)]
struct Change {
    index: u64,
    event: WatchEvent,
}

struct State {
    entries: BTreeMap<String, Entry>,
    history: Vec<Change>,
    index: u64,
}

pub struct MemoryStore {
    state: Mutex<State>,
    changes: broadcast::Sender<Change>,
    fetches: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    offline: Mutex<bool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

fn under(key: &str, prefix: &str) -> bool {
    key.len() > prefix.len() && key.starts_with(prefix) && key.as_bytes()[prefix.len()] == b'/'
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        let (changes, _) = broadcast::channel(1024);

        MemoryStore {
            state: Mutex::new(State {
                entries: BTreeMap::new(),
                history: Vec::new(),
                index: 0,
            }),
            changes,
            fetches: AtomicUsize::new(0),
            latency: Mutex::new(None),
            offline: Mutex::new(false),
        }
    }

    fn record(&self, state: &mut State, event: WatchEvent) {
        let change = Change {
            index: state.index,
            event,
        };
        state.history.push(change.clone());
        let _ = self.changes.send(change);
    }

    pub fn put(&self, key: &str, value: &str) {
        self.put_with_ttl(key, value, 0);
    }

    /// Store a value that expires after `ttl` seconds. Expiry itself is not
    /// simulated; the TTL is reported as the remaining lifetime.
    pub fn put_with_ttl(&self, key: &str, value: &str, ttl: i64) {
        let mut state = self.state.lock();
        state.index += 1;
        let modified_index = state.index;
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.as_bytes().to_vec(),
                ttl,
                modified_index,
            },
        );

        self.record(&mut state, WatchEvent::Put(key.to_string()));
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        if state.entries.remove(key).is_none() {
            return false;
        }

        state.index += 1;
        self.record(&mut state, WatchEvent::Delete(key.to_string()));

        true
    }

    /// Number of reads served so far
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Delay every read by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Make every read fail as if the registry was unreachable
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    async fn begin_read(&self) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if *self.offline.lock() {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }

        Ok(())
    }

    fn build_directory(key: &str, entries: &BTreeMap<String, Entry>, recursive: bool) -> Node {
        let mut children: BTreeMap<String, Vec<(&String, &Entry)>> = BTreeMap::new();
        for (entry_key, entry) in entries.range(format!("{}/", key)..) {
            if !under(entry_key, key) {
                break;
            }

            let rest = &entry_key[key.len() + 1..];
            let child = rest.split('/').next().unwrap_or(rest);
            children
                .entry(format!("{}/{}", key, child))
                .or_default()
                .push((entry_key, entry));
        }

        let nodes = children
            .into_iter()
            .map(|(child_key, descendants)| {
                let leaf = descendants
                    .iter()
                    .find(|(entry_key, _)| **entry_key == child_key);

                match leaf {
                    Some((_, entry)) if descendants.len() == 1 => Node {
                        modified_index: entry.modified_index,
                        ..Node::leaf(
                            &child_key,
                            &String::from_utf8_lossy(&entry.value),
                            entry.ttl,
                        )
                    },
                    _ if recursive => Self::build_directory(&child_key, entries, true),
                    _ => Node::directory(&child_key, Vec::new()),
                }
            })
            .collect();

        Node::directory(key, nodes)
    }
}

#[async_trait]
impl TreeStore for MemoryStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<Node> {
        self.begin_read().await?;

        let key = key.trim_end_matches('/');
        let state = self.state.lock();

        if let Some(entry) = state.entries.get(key) {
            return Ok(Node {
                modified_index: entry.modified_index,
                ..Node::leaf(key, &String::from_utf8_lossy(&entry.value), entry.ttl)
            });
        }

        let exists = state
            .entries
            .range(format!("{}/", key)..)
            .next()
            .map(|(entry_key, _)| under(entry_key, key))
            .unwrap_or(false);
        if !exists {
            return Err(StoreError::KeyNotFound);
        }

        Ok(Self::build_directory(key, &state.entries, recursive))
    }

    async fn wait_next(&self, key: &str, after_index: u64) -> Result<u64> {
        let key = key.trim_end_matches('/').to_string();
        let matches = |change: &Change| {
            let changed = change.event.key();
            changed == key || under(changed, &key)
        };

        let mut receiver = {
            let state = self.state.lock();
            if after_index > 0 {
                if let Some(change) = state
                    .history
                    .iter()
                    .find(|change| change.index > after_index && matches(change))
                {
                    return Ok(change.index);
                }
            }

            self.changes.subscribe()
        };

        loop {
            match receiver.recv().await {
                Ok(change) if matches(&change) => return Ok(change.index),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Err(StoreError::Unavailable("watch fell behind".to_string()))
                }
                Err(broadcast::error::RecvError::Closed) => return Err(StoreError::WatchClosed),
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn range(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.begin_read().await?;

        let state = self.state.lock();
        let pairs = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
                lease_ttl: entry.ttl,
            })
            .collect();

        Ok(pairs)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.begin_read().await?;

        let state = self.state.lock();
        Ok(state.entries.get(key).map(|entry| KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            lease_ttl: entry.ttl,
        }))
    }

    async fn watch(&self, prefix: &str) -> Result<WatchReceiver> {
        let mut changes = self.changes.subscribe();
        let prefix = prefix.to_string();
        let (sender, receiver) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                let event = match changes.recv().await {
                    Ok(change) if change.event.key().starts_with(&prefix) => Ok(change.event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        Err(StoreError::Unavailable("watch fell behind".to_string()))
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                let failed = event.is_err();
                if sender.send(event).await.is_err() || failed {
                    return;
                }
            }
        });

        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.put("/skydns/local/skydns/web/a", r#"{"host":"10.0.0.1"}"#);
        store.put("/skydns/local/skydns/web/b", r#"{"host":"10.0.0.2"}"#);
        store.put_with_ttl("/skydns/local/skydns/db", r#"{"host":"10.0.0.3"}"#, 30);
        store
    }

    #[tokio::test]
    async fn test_tree_get() {
        let store = store();

        let leaf = TreeStore::get(&store, "/skydns/local/skydns/db", false).await.unwrap();
        assert!(!leaf.dir);
        assert_eq!(30, leaf.ttl);

        let dir = TreeStore::get(&store, "/skydns/local/skydns", true).await.unwrap();
        assert!(dir.dir);
        let keys = dir.nodes.iter().map(|n| n.key.as_str()).collect::<Vec<_>>();
        assert_eq!(vec!["/skydns/local/skydns/db", "/skydns/local/skydns/web"], keys);
        assert_eq!(2, dir.nodes[1].nodes.len());

        let shallow = TreeStore::get(&store, "/skydns/local/skydns", false).await.unwrap();
        assert!(shallow.nodes[1].nodes.is_empty());

        assert_eq!(
            Err(StoreError::KeyNotFound),
            TreeStore::get(&store, "/skydns/local/skydns/we", true).await
        );
        assert_eq!(4, store.fetches());
    }

    #[tokio::test]
    async fn test_kv_range() {
        let store = store();

        let pairs = store.range("/skydns/local/skydns/web").await.unwrap();
        assert_eq!(2, pairs.len());
        assert_eq!("/skydns/local/skydns/web/a", pairs[0].key);

        let pair = KvStore::get(&store, "/skydns/local/skydns/db").await.unwrap();
        assert_eq!(30, pair.unwrap().lease_ttl);
    }

    #[tokio::test]
    async fn test_wait_next_sees_history_and_future_changes() {
        let store = store();

        let index = store.wait_next("/skydns/local/skydns/web", 1).await.unwrap();
        assert_eq!(2, index);

        let waiter = store.wait_next("/skydns/local/skydns/web", 0);
        tokio::pin!(waiter);
        tokio::select! {
            _ = &mut waiter => panic!("no change happened yet"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }

        store.delete("/skydns/local/skydns/web/a");
        assert_eq!(4, waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_filters_by_prefix() {
        let store = store();
        let mut receiver = store.watch("/skydns/local/skydns/dns/stub/").await.unwrap();

        store.put("/skydns/local/skydns/other", "{}");
        store.put("/skydns/local/skydns/dns/stub/com/example/ns1", "{}");

        let event = receiver.recv().await.unwrap().unwrap();
        assert_eq!(
            WatchEvent::Put("/skydns/local/skydns/dns/stub/com/example/ns1".to_string()),
            event
        );
    }

    #[tokio::test]
    async fn test_offline_store() {
        let store = store();
        store.set_offline(true);

        assert!(matches!(
            store.range("/skydns").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
