//! Backend over a tree shaped registry (etcd v2 style)

use std::sync::Arc;

use async_trait::async_trait;

use crate::registry::path::{has_wildcard, PathMapper};
use crate::registry::service::{self, Service};
use crate::registry::singleflight::Group;
use crate::registry::store::{self, Node, TreeStore};
use crate::registry::{finish_service, Backend, BackendConfig, Result, Watcher};

pub struct HierarchicalBackend<S> {
    store: Arc<S>,
    config: BackendConfig,
    inflight: Group<store::Result<Node>>,
}

impl<S: TreeStore> HierarchicalBackend<S> {
    pub fn new(store: Arc<S>, config: BackendConfig) -> HierarchicalBackend<S> {
        HierarchicalBackend {
            store,
            config,
            inflight: Group::new(),
        }
    }

    pub fn paths(&self) -> &PathMapper {
        &self.config.paths
    }

    async fn get(&self, key: &str) -> Result<Node> {
        let store = self.store.clone();
        let owned_key = key.to_string();

        let (result, shared) = self
            .inflight
            .work(key, move || async move { store.get(&owned_key, true).await })
            .await;
        if shared {
            log::debug!("shared registry fetch for {}", key);
        }

        Ok(result??)
    }

    /// Walk `nodes` depth first and decode every leaf matching the segments of
    /// the queried name
    fn collect(&self, nodes: &[Node], name_path: &str, wildcard: bool, out: &mut Vec<Service>) {
        for node in nodes {
            if node.dir {
                self.collect(&node.nodes, name_path, wildcard, out);
                continue;
            }

            if wildcard && !PathMapper::matches(&node.key, name_path) {
                continue;
            }

            let value = match node.value {
                Some(ref value) => value,
                None => continue,
            };

            match Service::decode(&node.key, value.as_bytes()) {
                Ok(decoded) => out.push(finish_service(&self.config, decoded, node.ttl)),
                Err(e) => log::warn!("skipping undecodable service at {}: {}", node.key, e),
            }
        }
    }
}

#[async_trait]
impl<S: TreeStore> Backend for HierarchicalBackend<S> {
    async fn records(&self, name: &str, exact: bool) -> Result<Vec<Service>> {
        if exact && has_wildcard(name) {
            return Ok(Vec::new());
        }

        let (fetch_path, wildcard) = self.config.paths.fetch_path(name);
        let name_path = self.config.paths.path(name);

        let node = self.get(&fetch_path).await?;

        let mut services = Vec::new();
        if exact {
            if node.dir {
                return Ok(services);
            }
            self.collect(std::slice::from_ref(&node), &name_path, false, &mut services);
        } else if node.dir {
            self.collect(&node.nodes, &name_path, wildcard, &mut services);
        } else {
            self.collect(std::slice::from_ref(&node), &name_path, false, &mut services);
        }

        Ok(service::dedup(services))
    }

    fn has_synced(&self) -> bool {
        true
    }

    fn watch(&self, name: &str) -> Box<dyn Watcher> {
        Box::new(TreeWatcher {
            store: self.store.clone(),
            key: self.config.paths.path(name),
            index: 0,
        })
    }
}

/// Waits for changes with index based long polls
pub struct TreeWatcher<S> {
    store: Arc<S>,
    key: String,
    index: u64,
}

#[async_trait]
impl<S: TreeStore> Watcher for TreeWatcher<S> {
    async fn next(&mut self) -> Result<()> {
        self.index = self.store.wait_next(&self.key, self.index).await?;

        Ok(())
    }
}
