//! The service record stored at each registry key

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// One registered service instance, as stored in the registry as JSON.
/// Unknown fields are ignored and missing fields take their zero value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub text: String,
    pub mail: bool,
    pub ttl: u32,
    #[serde(rename = "targetstrip")]
    pub target_strip: u8,
    pub group: String,

    /// Registry key the service was read from; never stored
    #[serde(skip)]
    pub key: String,
}

impl Service {
    pub fn new(host: &str) -> Service {
        Service {
            host: host.to_string(),
            ..Service::default()
        }
    }

    /// Decode the JSON value stored at `key`
    pub fn decode(key: &str, value: &[u8]) -> Result<Service, serde_json::Error> {
        let mut service: Service = serde_json::from_slice(value)?;
        service.key = key.to_string();

        Ok(service)
    }

    /// The host as an address, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse::<IpAddr>().ok()
    }

    pub fn host_name(&self) -> String {
        self.host.trim_end_matches('.').to_string()
    }

    /// Fields that make two services interchangeable in an answer
    fn identity(&self) -> (String, u16, u16, u16, String) {
        (
            self.host.clone(),
            self.port,
            self.priority,
            self.weight,
            self.text.clone(),
        )
    }
}

/// Effective TTL of a record: the smaller of the registry lease TTL and the
/// service's own TTL, with zero meaning unset on either side
pub fn calculate_ttl(lease_ttl: i64, service_ttl: u32, default_ttl: u32) -> u32 {
    let lease_ttl = if lease_ttl > 0 {
        lease_ttl.min(u32::MAX as i64) as u32
    } else {
        0
    };

    match (lease_ttl, service_ttl) {
        (0, 0) => default_ttl,
        (0, ttl) => ttl,
        (ttl, 0) => ttl,
        (lease, service) => lease.min(service),
    }
}

/// Drop services that are indistinguishable in an answer, keeping the first
pub fn dedup(services: Vec<Service>) -> Vec<Service> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(services.len());

    for service in services {
        if seen.insert(service.identity()) {
            unique.push(service);
        }
    }

    unique
}

/// Apply group filtering. The group carried by the shortest grouped keys
/// selects the services of that group plus the ungrouped ones. Grouped
/// services disagreeing at that depth disable filtering.
pub fn group(services: Vec<Service>) -> Vec<Service> {
    let depth = |service: &Service| service.key.matches('/').count();

    let shallowest = match services
        .iter()
        .filter(|s| !s.group.is_empty())
        .map(|s| depth(s))
        .min()
    {
        Some(depth) => depth,
        None => return services,
    };

    let mut groups = services
        .iter()
        .filter(|s| !s.group.is_empty() && depth(s) == shallowest)
        .map(|s| s.group.as_str());
    let selected = match groups.next() {
        Some(group) => group.to_string(),
        None => return services,
    };
    if groups.any(|group| group != selected) {
        return services;
    }

    services
        .into_iter()
        .filter(|s| s.group.is_empty() || s.group == selected)
        .collect()
}

/// Priority of each service's group tier: the minimum priority among the
/// services sharing its group. Ungrouped services form one tier.
pub fn group_priorities(services: &[Service]) -> HashMap<String, u16> {
    let mut tiers: HashMap<String, u16> = HashMap::new();
    for service in services {
        let tier = tiers.entry(service.group.clone()).or_insert(service.priority);
        if service.priority < *tier {
            *tier = service.priority;
        }
    }

    tiers
}

/// Remove `count` leftmost labels from `name`. Stripping every label yields
/// the name unchanged.
pub fn target_strip(name: &str, count: u8) -> String {
    if count == 0 {
        return name.to_string();
    }

    let labels = name.split('.').collect::<Vec<&str>>();
    if count as usize >= labels.len() {
        return name.to_string();
    }

    labels[count as usize..].join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        let service = Service::decode(
            "/skydns/local/skydns/web",
            br#"{"host":"10.0.0.1","port":80,"priority":10,"weight":5,"targetstrip":1,"extra":true}"#,
        )
        .unwrap();

        assert_eq!("10.0.0.1", service.host);
        assert_eq!(80, service.port);
        assert_eq!(5, service.weight);
        assert_eq!(1, service.target_strip);
        assert_eq!("/skydns/local/skydns/web", service.key);
        assert!(service.ip().is_some());

        assert!(Service::decode("/k", b"not json").is_err());
    }

    #[test]
    fn test_key_is_not_serialized() {
        let mut service = Service::new("example.com");
        service.key = "/skydns/x".to_string();

        let json = serde_json::to_string(&service).unwrap();
        assert!(!json.contains("/skydns/x"));
    }

    #[test]
    fn test_calculate_ttl() {
        assert_eq!(3600, calculate_ttl(0, 0, 3600));
        assert_eq!(30, calculate_ttl(0, 30, 3600));
        assert_eq!(20, calculate_ttl(20, 0, 3600));
        assert_eq!(20, calculate_ttl(20, 30, 3600));
        assert_eq!(30, calculate_ttl(40, 30, 3600));
        assert_eq!(30, calculate_ttl(-1, 30, 3600));
    }

    #[test]
    fn test_dedup() {
        let mut a = Service::new("10.0.0.1");
        a.key = "/a".to_string();
        let mut b = Service::new("10.0.0.1");
        b.key = "/b".to_string();
        let c = Service::new("10.0.0.2");

        let unique = dedup(vec![a, b, c]);
        assert_eq!(2, unique.len());
        assert_eq!("/a", unique[0].key);
    }

    fn grouped(key: &str, host: &str, group: &str) -> Service {
        let mut service = Service::new(host);
        service.key = key.to_string();
        service.group = group.to_string();
        service
    }

    #[test]
    fn test_group() {
        let services = vec![
            grouped("/skydns/local/skydns/web/a", "10.0.0.1", "g1"),
            grouped("/skydns/local/skydns/web/b/x", "10.0.0.2", "g2"),
            grouped("/skydns/local/skydns/web/c", "10.0.0.3", ""),
        ];

        let filtered = group(services);
        let hosts = filtered.iter().map(|s| s.host.as_str()).collect::<Vec<_>>();
        assert_eq!(vec!["10.0.0.1", "10.0.0.3"], hosts);

        let ungrouped = group(vec![Service::new("x"), Service::new("y")]);
        assert_eq!(2, ungrouped.len());
    }

    #[test]
    fn test_group_disagreement() {
        let services = vec![
            grouped("/skydns/local/skydns/web/a", "10.0.0.1", "g1"),
            grouped("/skydns/local/skydns/web/b", "10.0.0.2", "g2"),
        ];

        assert_eq!(2, group(services).len());
    }

    #[test]
    fn test_group_priorities() {
        let mut a = Service::new("10.0.0.1");
        a.group = "g".to_string();
        a.priority = 20;
        let mut b = Service::new("10.0.0.2");
        b.group = "g".to_string();
        b.priority = 5;
        let mut c = Service::new("10.0.0.3");
        c.priority = 30;

        let tiers = group_priorities(&[a, b, c]);
        assert_eq!(Some(&5), tiers.get("g"));
        assert_eq!(Some(&30), tiers.get(""));
    }

    #[test]
    fn test_target_strip() {
        assert_eq!("b.skydns.local", target_strip("a.b.skydns.local", 1));
        assert_eq!("skydns.local", target_strip("a.b.skydns.local", 2));
        assert_eq!("a.b", target_strip("a.b", 0));
        assert_eq!("a.b", target_strip("a.b", 5));
    }
}
