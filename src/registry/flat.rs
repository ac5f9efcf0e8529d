//! Backend over a flat key/value registry (etcd v3 style)

use std::sync::Arc;

use async_trait::async_trait;

use crate::registry::path::{has_wildcard, PathMapper};
use crate::registry::service::{self, Service};
use crate::registry::singleflight::Group;
use crate::registry::store::{self, KeyValue, KvStore, StoreError, WatchReceiver};
use crate::registry::{finish_service, Backend, BackendConfig, Result, Watcher};

pub struct FlatBackend<S> {
    store: Arc<S>,
    config: BackendConfig,
    inflight: Group<store::Result<Vec<KeyValue>>>,
}

/// True if `key` is `path` itself or lies below it
fn within(key: &str, path: &str) -> bool {
    key == path
        || (key.len() > path.len()
            && key.starts_with(path)
            && key.as_bytes()[path.len()] == b'/')
}

impl<S: KvStore> FlatBackend<S> {
    pub fn new(store: Arc<S>, config: BackendConfig) -> FlatBackend<S> {
        FlatBackend {
            store,
            config,
            inflight: Group::new(),
        }
    }

    pub fn paths(&self) -> &PathMapper {
        &self.config.paths
    }

    /// All pairs at or below `path`
    async fn fetch(&self, path: &str) -> Result<Vec<KeyValue>> {
        let store = self.store.clone();
        let owned_path = path.to_string();

        let (result, _) = self
            .inflight
            .work(path, move || async move {
                let pairs = store.range(&owned_path).await?;
                Ok(pairs
                    .into_iter()
                    .filter(|pair| within(&pair.key, &owned_path))
                    .collect())
            })
            .await;

        let pairs: Vec<KeyValue> = result??;
        if pairs.is_empty() {
            return Err(StoreError::KeyNotFound.into());
        }

        Ok(pairs)
    }
}

#[async_trait]
impl<S: KvStore> Backend for FlatBackend<S> {
    async fn records(&self, name: &str, exact: bool) -> Result<Vec<Service>> {
        if exact && has_wildcard(name) {
            return Ok(Vec::new());
        }

        let (fetch_path, wildcard) = self.config.paths.fetch_path(name);
        let name_path = self.config.paths.path(name);

        let pairs = self.fetch(&fetch_path).await?;

        let mut services = Vec::new();
        for pair in pairs {
            if exact && pair.key != fetch_path {
                continue;
            }

            if wildcard && !PathMapper::matches(&pair.key, &name_path) {
                continue;
            }

            match Service::decode(&pair.key, &pair.value) {
                Ok(decoded) => services.push(finish_service(&self.config, decoded, pair.lease_ttl)),
                Err(e) => log::warn!("skipping undecodable service at {}: {}", pair.key, e),
            }
        }

        Ok(service::dedup(services))
    }

    fn has_synced(&self) -> bool {
        true
    }

    fn watch(&self, name: &str) -> Box<dyn Watcher> {
        Box::new(SubscriptionWatcher {
            store: self.store.clone(),
            prefix: format!("{}/", self.config.paths.path(name)),
            receiver: None,
        })
    }
}

/// Turns a change subscription into a blocking `next()`. A lost subscription
/// is reported once and re-established on the following call.
pub struct SubscriptionWatcher<S> {
    store: Arc<S>,
    prefix: String,
    receiver: Option<WatchReceiver>,
}

#[async_trait]
impl<S: KvStore> Watcher for SubscriptionWatcher<S> {
    async fn next(&mut self) -> Result<()> {
        let mut receiver = match self.receiver.take() {
            Some(receiver) => receiver,
            None => self.store.watch(&self.prefix).await?,
        };

        match receiver.recv().await {
            Some(Ok(event)) => {
                log::debug!("registry change at {}", event.key());
                self.receiver = Some(receiver);
                Ok(())
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(StoreError::WatchClosed.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::registry::memory::MemoryStore;

    fn backend() -> (Arc<MemoryStore>, FlatBackend<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.put("/skydns/local/skydns/web", r#"{"host":"10.0.0.1","port":8080}"#);
        store.put("/skydns/local/skydns/webserver", r#"{"host":"10.0.0.9"}"#);
        store.put_with_ttl(
            "/skydns/local/skydns/api/a",
            r#"{"host":"10.0.0.2","ttl":100}"#,
            45,
        );
        store.put("/skydns/local/skydns/api/b", r#"{"host":"10.0.0.3"}"#);

        let backend = FlatBackend::new(store.clone(), BackendConfig::default());
        (store, backend)
    }

    #[tokio::test]
    async fn test_prefix_is_segment_aware() {
        let (_, backend) = backend();

        let services = backend.records("web.skydns.local.", false).await.unwrap();
        assert_eq!(1, services.len());
        assert_eq!("10.0.0.1", services[0].host);
    }

    #[tokio::test]
    async fn test_lease_ttl() {
        let (_, backend) = backend();

        let services = backend.records("api.skydns.local.", false).await.unwrap();
        assert_eq!(2, services.len());
        assert_eq!(45, services[0].ttl);
        assert_eq!(3600, services[1].ttl);
    }

    #[tokio::test]
    async fn test_wildcard() {
        let (_, backend) = backend();

        let services = backend.records("any.api.skydns.local.", false).await.unwrap();
        assert_eq!(2, services.len());

        let services = backend.records("*.skydns.local.", false).await.unwrap();
        assert_eq!(4, services.len());
    }

    #[tokio::test]
    async fn test_exact_and_missing() {
        let (_, backend) = backend();

        let services = backend.records("web.skydns.local.", true).await.unwrap();
        assert_eq!(1, services.len());

        let services = backend.records("api.skydns.local.", true).await.unwrap();
        assert!(services.is_empty());

        let services = backend.records("*.web.skydns.local.", true).await.unwrap();
        assert!(services.is_empty());

        let err = backend.records("missing.skydns.local.", false).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_watcher_resubscribes() {
        let (store, backend) = backend();
        let mut watcher = backend.watch("api.skydns.local.");

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.put("/skydns/local/skydns/api/c", r#"{"host":"10.0.0.4"}"#);
            })
        };

        watcher.next().await.unwrap();
        writer.await.unwrap();
    }
}
