//! HTTP clients for etcd
//!
//! `EtcdV2Client` speaks the v2 keys API and implements `TreeStore`.
//! `EtcdV3Client` speaks the v3 JSON gateway and implements `KvStore`.
//! Both try the configured endpoints in order until one answers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::registry::store::{
    KeyValue, KvStore, Node, Result, StoreError, TreeStore, WatchEvent, WatchReceiver,
};

/// etcd v2 error code for a missing key
const V2_KEY_NOT_FOUND: u64 = 100;

#[derive(Clone, Debug, Default)]
pub struct ClientOptions {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub timeout: Duration,
}

impl ClientOptions {
    fn build_client(&self, with_timeout: bool) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        if with_timeout {
            builder = builder.timeout(self.timeout);
        }

        if let Some(ref ca_cert) = self.ca_cert {
            let pem = std::fs::read(ca_cert)
                .map_err(|e| StoreError::Unavailable(format!("{}: {}", ca_cert.display(), e)))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        if let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) {
            let cert_pem = std::fs::read(cert)
                .map_err(|e| StoreError::Unavailable(format!("{}: {}", cert.display(), e)))?;
            let key_pem = std::fs::read(key)
                .map_err(|e| StoreError::Unavailable(format!("{}: {}", key.display(), e)))?;
            builder = builder.identity(reqwest::Identity::from_pkcs8_pem(&cert_pem, &key_pem)?);
        }

        Ok(builder.build()?)
    }

    fn endpoints(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|endpoint| endpoint.trim_end_matches('/').to_string())
            .collect()
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.username {
            Some(ref username) => request.basic_auth(username, self.password.clone()),
            None => request,
        }
    }
}

/// Check that every endpoint is an http(s) URL
pub fn validate_endpoints(endpoints: &[String]) -> std::result::Result<(), String> {
    if endpoints.is_empty() {
        return Err("no registry endpoints configured".to_string());
    }

    for endpoint in endpoints {
        let url = reqwest::Url::parse(endpoint).map_err(|e| format!("{}: {}", endpoint, e))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(format!("{}: unsupported scheme {}", endpoint, url.scheme()));
        }
    }

    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct V2Response {
    node: Option<Node>,
    #[serde(rename = "errorCode")]
    error_code: Option<u64>,
    message: Option<String>,
}

pub struct EtcdV2Client {
    options: ClientOptions,
    client: reqwest::Client,
    watch_client: reqwest::Client,
}

impl EtcdV2Client {
    pub fn new(options: ClientOptions) -> Result<EtcdV2Client> {
        let client = options.build_client(true)?;
        let watch_client = options.build_client(false)?;

        Ok(EtcdV2Client {
            options,
            client,
            watch_client,
        })
    }

    async fn request(
        &self,
        client: &reqwest::Client,
        key: &str,
        query: &[(&str, String)],
    ) -> Result<V2Response> {
        let mut last_error = StoreError::Unavailable("no registry endpoints".to_string());

        for endpoint in self.options.endpoints() {
            let url = format!("{}/v2/keys{}", endpoint, key);
            let request = self.options.authorize(client.get(&url).query(query));

            match request.send().await {
                Ok(response) => {
                    let body: V2Response = response.json().await?;
                    return Ok(body);
                }
                Err(e) => {
                    log::warn!("etcd endpoint {} failed: {}", endpoint, e);
                    last_error = e.into();
                }
            }
        }

        Err(last_error)
    }

    fn node(response: V2Response) -> Result<Node> {
        match (response.node, response.error_code) {
            (_, Some(V2_KEY_NOT_FOUND)) => Err(StoreError::KeyNotFound),
            (Some(node), None) => Ok(node),
            (_, code) => Err(StoreError::Malformed(format!(
                "error {:?}: {}",
                code,
                response.message.unwrap_or_default()
            ))),
        }
    }

    /// Read the value stored at `key`, if any
    pub async fn value(&self, key: &str) -> Result<Option<String>> {
        match TreeStore::get(self, key, false).await {
            Ok(node) => Ok(node.value),
            Err(StoreError::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TreeStore for EtcdV2Client {
    async fn get(&self, key: &str, recursive: bool) -> Result<Node> {
        let query = [
            ("recursive", recursive.to_string()),
            ("sorted", "true".to_string()),
        ];
        let response = self.request(&self.client, key, &query).await?;

        Self::node(response)
    }

    async fn wait_next(&self, key: &str, after_index: u64) -> Result<u64> {
        let mut query = vec![
            ("wait", "true".to_string()),
            ("recursive", "true".to_string()),
        ];
        if after_index > 0 {
            query.push(("waitIndex", (after_index + 1).to_string()));
        }

        let response = self.request(&self.watch_client, key, &query).await?;
        let node = Self::node(response)?;

        Ok(node.modified_index)
    }
}

/// The smallest key greater than every key starting with `prefix`
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }

    // Every byte was 0xff: range to the end of the key space
    vec![0]
}

/// The gateway encodes 64 bit integers as strings
fn json_i64(value: &Value) -> i64 {
    match value {
        Value::String(s) => s.parse().unwrap_or(0),
        Value::Number(n) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

fn decode_b64(value: &Value) -> Result<Vec<u8>> {
    let encoded = value.as_str().unwrap_or("");
    base64::decode(encoded).map_err(|e| StoreError::Malformed(e.to_string()))
}

pub struct EtcdV3Client {
    options: ClientOptions,
    client: reqwest::Client,
    watch_client: reqwest::Client,
    token: Mutex<Option<String>>,
}

impl EtcdV3Client {
    pub fn new(options: ClientOptions) -> Result<EtcdV3Client> {
        let client = options.build_client(true)?;
        let watch_client = options.build_client(false)?;

        Ok(EtcdV3Client {
            options,
            client,
            watch_client,
            token: Mutex::new(None),
        })
    }

    async fn token(&self, endpoint: &str) -> Result<Option<String>> {
        let username = match self.options.username {
            Some(ref username) => username.clone(),
            None => return Ok(None),
        };

        let cached = self.token.lock().clone();
        if cached.is_some() {
            return Ok(cached);
        }

        let body = json!({
            "name": username,
            "password": self.options.password.clone().unwrap_or_default(),
        });
        let response: Value = self
            .client
            .post(&format!("{}/v3/auth/authenticate", endpoint))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        let token = response["token"]
            .as_str()
            .ok_or_else(|| StoreError::Unavailable("authentication failed".to_string()))?
            .to_string();
        *self.token.lock() = Some(token.clone());

        Ok(Some(token))
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        path: &str,
        body: &Value,
    ) -> Result<reqwest::Response> {
        let mut last_error = StoreError::Unavailable("no registry endpoints".to_string());

        for endpoint in self.options.endpoints() {
            let token = self.token(&endpoint).await?;
            let mut request = client.post(&format!("{}{}", endpoint, path)).json(body);
            if let Some(token) = token {
                request = request.header("Authorization", token);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    log::warn!("etcd endpoint {} failed: {}", endpoint, e);
                    last_error = e.into();
                }
            }
        }

        Err(last_error)
    }

    async fn range_request(&self, body: Value) -> Result<Vec<KeyValue>> {
        let response: Value = self.post(&self.client, "/v3/kv/range", &body).await?.json().await?;

        let kvs = match response["kvs"].as_array() {
            Some(kvs) => kvs.clone(),
            None => return Ok(Vec::new()),
        };

        let mut leases: HashMap<i64, i64> = HashMap::new();
        let mut pairs = Vec::with_capacity(kvs.len());
        for kv in kvs {
            let key = String::from_utf8_lossy(&decode_b64(&kv["key"])?).to_string();
            let value = decode_b64(&kv["value"])?;

            let lease = json_i64(&kv["lease"]);
            let lease_ttl = if lease == 0 {
                0
            } else if let Some(ttl) = leases.get(&lease) {
                *ttl
            } else {
                let ttl = self.lease_ttl(lease).await?;
                leases.insert(lease, ttl);
                ttl
            };

            pairs.push(KeyValue {
                key,
                value,
                lease_ttl,
            });
        }

        pairs.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(pairs)
    }

    async fn lease_ttl(&self, lease: i64) -> Result<i64> {
        let body = json!({ "ID": lease.to_string() });
        let response: Value = self
            .post(&self.client, "/v3/lease/timetolive", &body)
            .await?
            .json()
            .await?;

        Ok(json_i64(&response["TTL"]).max(0))
    }

    /// Read the value stored at `key`, if any
    pub async fn value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(KvStore::get(self, key).await?.map(|pair| pair.value))
    }
}

fn watch_events(message: &Value) -> Vec<WatchEvent> {
    let events = match message["result"]["events"].as_array() {
        Some(events) => events,
        None => return Vec::new(),
    };

    events
        .iter()
        .filter_map(|event| {
            let key = decode_b64(&event["kv"]["key"]).ok()?;
            let key = String::from_utf8_lossy(&key).to_string();
            match event["type"].as_str() {
                Some("DELETE") => Some(WatchEvent::Delete(key)),
                _ => Some(WatchEvent::Put(key)),
            }
        })
        .collect()
}

#[async_trait]
impl KvStore for EtcdV3Client {
    async fn range(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let body = json!({
            "key": base64::encode(prefix),
            "range_end": base64::encode(prefix_end(prefix.as_bytes())),
        });

        self.range_request(body).await
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let body = json!({ "key": base64::encode(key) });

        Ok(self.range_request(body).await?.into_iter().next())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchReceiver> {
        let body = json!({
            "create_request": {
                "key": base64::encode(prefix),
                "range_end": base64::encode(prefix_end(prefix.as_bytes())),
            }
        });
        let mut response = self.post(&self.watch_client, "/v3/watch", &body).await?;
        let (sender, receiver) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => return,
                    Err(e) => {
                        let _ = sender.send(Err(StoreError::from(e))).await;
                        return;
                    }
                };
                pending.extend_from_slice(&chunk);

                while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                    let line = pending.drain(..=newline).collect::<Vec<u8>>();
                    let message: Value = match serde_json::from_slice(&line) {
                        Ok(message) => message,
                        Err(e) => {
                            log::debug!("ignoring malformed watch message: {}", e);
                            continue;
                        }
                    };

                    if message["error"].is_object() {
                        let _ = sender
                            .send(Err(StoreError::Unavailable(message["error"].to_string())))
                            .await;
                        return;
                    }

                    for event in watch_events(&message) {
                        if sender.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509Builder, X509NameBuilder};

    use super::*;

    /// A self-signed certificate and its PKCS#8 key, PEM encoded
    fn client_identity() -> (Vec<u8>, Vec<u8>) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "skydns").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        (
            builder.build().to_pem().unwrap(),
            key.private_key_to_pem_pkcs8().unwrap(),
        )
    }

    #[test]
    fn test_client_identity() {
        let dir = std::env::temp_dir().join(format!("skydns-identity-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let (cert, key) = client_identity();
        std::fs::write(dir.join("client.pem"), &cert).unwrap();
        std::fs::write(dir.join("client.key"), &key).unwrap();
        std::fs::write(dir.join("ca.pem"), &cert).unwrap();

        let mut options = ClientOptions {
            endpoints: vec!["https://127.0.0.1:2379".to_string()],
            ca_cert: Some(dir.join("ca.pem")),
            tls_cert: Some(dir.join("client.pem")),
            tls_key: Some(dir.join("client.key")),
            timeout: Duration::from_secs(1),
            ..ClientOptions::default()
        };
        assert!(options.build_client(true).is_ok());
        assert!(EtcdV3Client::new(options.clone()).is_ok());

        options.tls_key = Some(dir.join("missing.key"));
        assert!(matches!(
            options.build_client(true),
            Err(StoreError::Unavailable(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(b"/skydns0".to_vec(), prefix_end(b"/skydns/"));
        assert_eq!(vec![b'a' + 1], prefix_end(&[b'a', 0xff]));
        assert_eq!(vec![0], prefix_end(&[0xff, 0xff]));
    }

    #[test]
    fn test_json_i64() {
        assert_eq!(42, json_i64(&json!("42")));
        assert_eq!(7, json_i64(&json!(7)));
        assert_eq!(0, json_i64(&Value::Null));
    }

    #[test]
    fn test_watch_events() {
        let message = json!({
            "result": {
                "events": [
                    {"kv": {"key": base64::encode("/skydns/a")}},
                    {"type": "DELETE", "kv": {"key": base64::encode("/skydns/b")}}
                ]
            }
        });

        assert_eq!(
            vec![
                WatchEvent::Put("/skydns/a".to_string()),
                WatchEvent::Delete("/skydns/b".to_string())
            ],
            watch_events(&message)
        );
    }

    #[test]
    fn test_v2_node() {
        let response: V2Response = serde_json::from_str(
            r#"{"errorCode":100,"message":"Key not found","cause":"/skydns/x","index":12}"#,
        )
        .unwrap();
        assert_eq!(Err(StoreError::KeyNotFound), EtcdV2Client::node(response));

        let response: V2Response = serde_json::from_str(
            r#"{"action":"get","node":{"key":"/skydns/x","value":"{}","modifiedIndex":3}}"#,
        )
        .unwrap();
        assert_eq!(3, EtcdV2Client::node(response).unwrap().modified_index);
    }

    #[test]
    fn test_validate_endpoints() {
        assert!(validate_endpoints(&["http://127.0.0.1:2379".to_string()]).is_ok());
        assert!(validate_endpoints(&["ftp://127.0.0.1".to_string()]).is_err());
        assert!(validate_endpoints(&["not a url".to_string()]).is_err());
        assert!(validate_endpoints(&[]).is_err());
    }
}
