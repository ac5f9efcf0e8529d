//! Mapping between DNS names and registry key paths
//!
//! `a.b.skydns.local.` lives at `/skydns/local/skydns/b/a`. The labels `*`
//! and `any` act as single segment wildcards.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const DEFAULT_PREFIX: &str = "skydns";

const IN_ADDR_SUFFIX: &str = ".in-addr.arpa";
const IP6_SUFFIX: &str = ".ip6.arpa";

pub fn is_wildcard_label(label: &str) -> bool {
    label == "*" || label == "any"
}

/// Lowercase a name and strip its trailing root dot
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

pub fn has_wildcard(name: &str) -> bool {
    normalize_name(name).split('.').any(is_wildcard_label)
}

/// True if `name` equals `zone` or lies below it. Both are compared
/// case-insensitively and without trailing dots.
pub fn is_subdomain(name: &str, zone: &str) -> bool {
    let name = normalize_name(name);
    let zone = normalize_name(zone);

    if zone.is_empty() || name == zone {
        return true;
    }

    name.len() > zone.len()
        && name.ends_with(&zone)
        && name.as_bytes()[name.len() - zone.len() - 1] == b'.'
}

pub fn count_labels(name: &str) -> usize {
    let name = name.trim_end_matches('.');
    if name.is_empty() {
        return 0;
    }

    name.split('.').count()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathMapper {
    prefix: String,
}

impl Default for PathMapper {
    fn default() -> Self {
        PathMapper::new(DEFAULT_PREFIX)
    }
}

impl PathMapper {
    pub fn new(prefix: &str) -> PathMapper {
        PathMapper {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn reversed_labels(name: &str) -> Vec<String> {
        let name = normalize_name(name);
        name.split('.')
            .filter(|label| !label.is_empty())
            .rev()
            .map(|label| label.to_string())
            .collect()
    }

    fn join(&self, labels: &[String]) -> String {
        let mut path = format!("/{}", self.prefix);
        for label in labels {
            path.push('/');
            path.push_str(label);
        }

        path
    }

    /// Registry path for `name`, wildcard labels preserved
    pub fn path(&self, name: &str) -> String {
        self.join(&Self::reversed_labels(name))
    }

    /// Registry path for `name` and whether it contains a wildcard label
    pub fn path_with_wildcard(&self, name: &str) -> (String, bool) {
        let labels = Self::reversed_labels(name);
        let wildcard = labels.iter().any(|label| is_wildcard_label(label));

        (self.join(&labels), wildcard)
    }

    /// Path to fetch from the registry for `name`: the path up to, but not
    /// including, the first wildcard segment
    pub fn fetch_path(&self, name: &str) -> (String, bool) {
        let labels = Self::reversed_labels(name);
        match labels.iter().position(|label| is_wildcard_label(label)) {
            Some(idx) => (self.join(&labels[..idx]), true),
            None => (self.join(&labels), false),
        }
    }

    /// DNS name (without trailing dot) for a registry key
    pub fn domain(&self, key: &str) -> String {
        let prefix_segments = self.prefix.split('/').count();

        let mut labels = key
            .split('/')
            .filter(|segment| !segment.is_empty())
            .skip(prefix_segments)
            .collect::<Vec<&str>>();
        labels.reverse();

        labels.join(".")
    }

    /// Check a registry key against the path of a (wildcard) name. Every
    /// segment of the name must match the key, with wildcard segments
    /// matching anything; the key may extend below the name.
    pub fn matches(key: &str, name_path: &str) -> bool {
        let key_parts = key.split('/').collect::<Vec<&str>>();

        for (i, part) in name_path.split('/').enumerate() {
            let key_part = match key_parts.get(i) {
                Some(key_part) => key_part,
                None => return false,
            };

            if is_wildcard_label(part) {
                continue;
            }

            if *key_part != part {
                return false;
            }
        }

        true
    }
}

pub fn is_reverse_name(name: &str) -> bool {
    let name = normalize_name(name);
    name.ends_with(IN_ADDR_SUFFIX) || name.ends_with(IP6_SUFFIX)
}

/// Extract the address from a reverse lookup name, e.g.
/// `1.0.0.10.in-addr.arpa.` yields `10.0.0.1`
pub fn reverse_address(name: &str) -> Option<IpAddr> {
    let name = normalize_name(name);

    if let Some(rest) = name.strip_suffix(IN_ADDR_SUFFIX) {
        let octets = rest
            .split('.')
            .rev()
            .map(|octet| octet.parse::<u8>().ok())
            .collect::<Option<Vec<u8>>>()?;
        if octets.len() != 4 {
            return None;
        }

        return Some(IpAddr::V4(Ipv4Addr::new(
            octets[0], octets[1], octets[2], octets[3],
        )));
    }

    if let Some(rest) = name.strip_suffix(IP6_SUFFIX) {
        let nibbles = rest
            .split('.')
            .rev()
            .map(|nibble| {
                if nibble.len() == 1 {
                    u8::from_str_radix(nibble, 16).ok()
                } else {
                    None
                }
            })
            .collect::<Option<Vec<u8>>>()?;
        if nibbles.len() != 32 {
            return None;
        }

        let mut octets = [0u8; 16];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = (nibbles[2 * i] << 4) | nibbles[2 * i + 1];
        }

        return Some(IpAddr::V6(Ipv6Addr::from(octets)));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path() {
        let paths = PathMapper::default();

        assert_eq!("/skydns/local/skydns/b/a", paths.path("a.b.skydns.local."));
        assert_eq!("/skydns/local/skydns/b/a", paths.path("A.B.SkyDNS.local"));
        assert_eq!(
            ("/skydns/local/skydns/*".to_string(), true),
            paths.path_with_wildcard("*.skydns.local.")
        );
        assert_eq!(
            ("/skydns/local/skydns/web".to_string(), false),
            paths.path_with_wildcard("web.skydns.local.")
        );
        assert_eq!("/skydns", paths.path("."));
    }

    #[test]
    fn test_fetch_path() {
        let paths = PathMapper::default();

        assert_eq!(
            ("/skydns/local/skydns".to_string(), true),
            paths.fetch_path("x.any.skydns.local.")
        );
        assert_eq!(
            ("/skydns/local/skydns/api".to_string(), false),
            paths.fetch_path("api.skydns.local.")
        );
    }

    #[test]
    fn test_domain() {
        let paths = PathMapper::default();
        assert_eq!("web.skydns.local", paths.domain("/skydns/local/skydns/web"));

        let nested = PathMapper::new("/registry/dns/");
        assert_eq!("registry/dns", nested.prefix());
        assert_eq!("web.cluster", nested.domain("/registry/dns/cluster/web"));
    }

    #[test]
    fn test_matches() {
        let name_path = "/skydns/local/skydns/*/web";

        assert!(PathMapper::matches("/skydns/local/skydns/east/web", name_path));
        assert!(PathMapper::matches("/skydns/local/skydns/east/web/x1", name_path));
        assert!(!PathMapper::matches("/skydns/local/skydns/east/db", name_path));
        assert!(!PathMapper::matches("/skydns/local/skydns/east", name_path));
    }

    #[test]
    fn test_is_subdomain() {
        assert!(is_subdomain("web.skydns.local.", "skydns.local"));
        assert!(is_subdomain("skydns.local", "skydns.local."));
        assert!(!is_subdomain("notskydns.local", "skydns.local"));
        assert!(!is_subdomain("local", "skydns.local"));
        assert!(is_subdomain("anything", ""));
    }

    #[test]
    fn test_reverse_address() {
        assert_eq!(
            Some("10.0.0.1".parse::<IpAddr>().unwrap()),
            reverse_address("1.0.0.10.in-addr.arpa.")
        );
        assert_eq!(None, reverse_address("0.10.in-addr.arpa."));
        assert_eq!(None, reverse_address("x.0.0.10.in-addr.arpa."));

        let v6 = "1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6.arpa.";
        assert_eq!(
            Some("2001:db8::1".parse::<IpAddr>().unwrap()),
            reverse_address(v6)
        );
        assert!(is_reverse_name(v6));
        assert!(!is_reverse_name("web.skydns.local"));
    }

    #[test]
    fn test_count_labels() {
        assert_eq!(0, count_labels("."));
        assert_eq!(2, count_labels("example.com."));
        assert_eq!(3, count_labels("www.example.com"));
    }
}
