//! Subject Alternative Name derivation for node requests.

use std::net::{IpAddr, Ipv4Addr};

use rcgen::{Ia5String, SanType};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::NodeIdentity;

/// Loopback address every node certificate is valid for.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Subject Alternative Name entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectAltName {
    /// DNS name.
    Dns(String),
    /// IP address.
    Ip(IpAddr),
}

impl SubjectAltName {
    /// Converts to the rcgen representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::San`] if a DNS name is not valid IA5 text.
    pub fn to_rcgen(&self) -> Result<SanType> {
        match self {
            Self::Dns(dns) => {
                let ia5 = Ia5String::try_from(dns.clone())
                    .map_err(|e| Error::San(format!("invalid DNS name '{dns}': {e}")))?;
                Ok(SanType::DnsName(ia5))
            }
            Self::Ip(ip) => Ok(SanType::IpAddress(*ip)),
        }
    }
}

impl std::fmt::Display for SubjectAltName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dns(dns) => write!(f, "DNS:{dns}"),
            Self::Ip(ip) => write!(f, "IP:{ip}"),
        }
    }
}

/// Derives the SAN list for a node.
///
/// Order: common name, full name, loopback, then (with a cluster suffix) the
/// suffixed full name and common name, then every extra alt name followed by
/// its suffixed form. IP-literal alt names are never suffixed. Duplicates
/// keep their first position.
#[must_use]
pub fn for_node(node: &NodeIdentity, cluster_suffix: Option<&str>) -> Vec<SubjectAltName> {
    let suffix = cluster_suffix
        .map(|s| s.trim().trim_start_matches('.'))
        .filter(|s| !s.is_empty());
    let qualify = |host: &str| suffix.map(|s| format!("{host}.{s}"));

    let mut sans = Vec::new();
    let mut add = |san: SubjectAltName| {
        if !sans.contains(&san) {
            sans.push(san);
        }
    };

    add(SubjectAltName::Dns(node.common_name().to_string()));
    add(SubjectAltName::Dns(node.name().to_string()));
    add(SubjectAltName::Ip(LOOPBACK));
    if let Some(name) = qualify(node.name()) {
        add(SubjectAltName::Dns(name));
    }
    if let Some(cn) = qualify(node.common_name()) {
        add(SubjectAltName::Dns(cn));
    }
    for alt in node.extra_alt_names() {
        if let Ok(ip) = alt.parse::<IpAddr>() {
            add(SubjectAltName::Ip(ip));
            continue;
        }
        add(SubjectAltName::Dns(alt.clone()));
        if let Some(q) = qualify(alt) {
            add(SubjectAltName::Dns(q));
        }
    }
    sans
}

/// Renders the `[ alt_names ]` entries with per-type numbering starting at 1.
#[must_use]
pub fn numbered_entries(sans: &[SubjectAltName]) -> Vec<(String, String)> {
    let (mut dns_n, mut ip_n) = (0usize, 0usize);
    sans.iter()
        .map(|san| match san {
            SubjectAltName::Dns(dns) => {
                dns_n += 1;
                (format!("DNS.{dns_n}"), dns.clone())
            }
            SubjectAltName::Ip(ip) => {
                ip_n += 1;
                (format!("IP.{ip_n}"), ip.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, alts: &[&str]) -> NodeIdentity {
        NodeIdentity::new(name, alts.iter().map(|s| (*s).to_string()).collect()).unwrap()
    }

    fn rendered(sans: &[SubjectAltName]) -> Vec<String> {
        sans.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn base_entries_without_suffix() {
        let sans = for_node(&node("db1.example.com", &[]), None);
        assert_eq!(rendered(&sans), ["DNS:db1", "DNS:db1.example.com", "IP:127.0.0.1"]);
    }

    #[test]
    fn suffix_qualifies_name_common_name_and_alts() {
        let sans = for_node(&node("db1.example.com", &["db.example.com"]), Some("prod"));
        assert_eq!(
            rendered(&sans),
            [
                "DNS:db1",
                "DNS:db1.example.com",
                "IP:127.0.0.1",
                "DNS:db1.example.com.prod",
                "DNS:db1.prod",
                "DNS:db.example.com",
                "DNS:db.example.com.prod",
            ]
        );
    }

    #[test]
    fn blank_suffix_is_ignored() {
        let sans = for_node(&node("a.lan", &[]), Some("  "));
        assert_eq!(sans.len(), 3);
    }

    #[test]
    fn ip_alt_names_become_ip_entries() {
        let sans = for_node(&node("a.lan", &["10.0.0.5"]), Some("c1"));
        assert!(sans.contains(&SubjectAltName::Ip("10.0.0.5".parse().unwrap())));
        assert!(!rendered(&sans).iter().any(|s| s.contains("10.0.0.5.c1")));
    }

    #[test]
    fn single_label_name_is_deduplicated() {
        let sans = for_node(&node("standalone", &["standalone"]), None);
        assert_eq!(rendered(&sans), ["DNS:standalone", "IP:127.0.0.1"]);
    }

    #[test]
    fn numbering_is_per_type() {
        let sans = for_node(&node("db1.example.com", &["10.1.1.1"]), None);
        let entries = numbered_entries(&sans);
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["DNS.1", "DNS.2", "IP.1", "IP.2"]);
    }

    #[test]
    fn non_ascii_dns_name_is_rejected_by_rcgen_conversion() {
        let san = SubjectAltName::Dns("nöde.example.com".into());
        assert!(matches!(san.to_rcgen(), Err(Error::San(_))));
    }
}
