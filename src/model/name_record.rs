use std::time::SystemTime;

use bitflags::bitflags;
use rustc_hash::FxHashSet;

use crate::model::address::SocketAddress;
use crate::model::reference::Reference;

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct NameRecordType: u32 {
        const PROXY = 0x1;
        const HOST = 0x2;
        const LINK = 0x4;
    }
}

/// A registry entry for a proxy, a host or a link. The registry owns the records; everybody else
///  works on snapshots and persists changes explicitly through
///  [crate::provider::NameService::upsert].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NameRecord {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub record_type: NameRecordType,
    pub address: Reference,
    /// proxies that were known to reach this record
    pub references: FxHashSet<Reference>,
    pub last_activity: SystemTime,
    pub connected: bool,
}

impl NameRecord {
    pub fn new(record_type: NameRecordType, name: &str) -> NameRecord {
        let address = Reference::new_random();
        NameRecord {
            id: address.to_string(),
            name: name.to_string(),
            domain: String::new(),
            record_type,
            address,
            references: Default::default(),
            last_activity: SystemTime::UNIX_EPOCH,
            connected: true,
        }
    }

    /// An ephemeral host record for an address that is unknown to the registry
    pub fn ephemeral_host(address: &SocketAddress) -> NameRecord {
        let mut result = NameRecord::new(NameRecordType::HOST, &address.to_string());
        if let SocketAddress::ProxyName(name) = address {
            result.name = name.host.clone();
            result.domain = name.domain.clone();
        }
        result
    }

    pub fn with_reference(mut self, reference: Reference) -> NameRecord {
        self.references.insert(reference);
        self
    }

    pub fn without_reference(mut self, reference: &Reference) -> NameRecord {
        self.references.remove(reference);
        self
    }

    pub fn touched(mut self, now: SystemTime) -> NameRecord {
        self.last_activity = now;
        self
    }

    pub fn is_type(&self, record_type: NameRecordType) -> bool {
        self.record_type.intersects(record_type)
    }

    fn matches_address(&self, address: &SocketAddress) -> bool {
        match address {
            SocketAddress::Any => true,
            SocketAddress::ProxyName(name) => {
                self.name.eq_ignore_ascii_case(&name.host)
                    && (name.domain.is_empty() || self.domain.eq_ignore_ascii_case(&name.domain))
            }
            SocketAddress::Bound { .. } => self.matches_address(address.local()),
            SocketAddress::Collection(addresses) => addresses.iter().any(|a| self.matches_address(a)),
            SocketAddress::Unix { path } => self.name == *path,
            inet => inet.to_socket_addr()
                .map(|a| self.name == a.ip().to_string())
                .unwrap_or(false),
        }
    }

    pub fn matches(&self, query: &NameQuery) -> bool {
        match query {
            NameQuery::ByName { name, record_type } => {
                self.is_type(*record_type) && (self.name.eq_ignore_ascii_case(name) || self.id == *name)
            }
            NameQuery::MatchesAddress { address, record_type } => {
                self.is_type(*record_type) && self.matches_address(address)
            }
            NameQuery::MatchesReferences { references, record_type } => {
                self.is_type(*record_type) && references.contains(&self.address)
            }
            NameQuery::ProxyForHost { address } => {
                if !self.is_type(NameRecordType::PROXY) {
                    return false;
                }
                match address.remote() {
                    SocketAddress::ProxyName(name) if !name.domain.is_empty() => self.domain.eq_ignore_ascii_case(&name.domain),
                    _ => true,
                }
            }
        }
    }
}


/// Closed set of registry queries
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NameQuery {
    ByName {
        name: String,
        record_type: NameRecordType,
    },
    MatchesAddress {
        address: SocketAddress,
        record_type: NameRecordType,
    },
    MatchesReferences {
        references: Vec<Reference>,
        record_type: NameRecordType,
    },
    /// proxies that may be able to reach a host
    ProxyForHost {
        address: SocketAddress,
    },
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn proxy(name: &str, domain: &str) -> NameRecord {
        let mut r = NameRecord::new(NameRecordType::PROXY, name);
        r.domain = domain.to_string();
        r
    }

    #[test]
    fn test_references_are_values() {
        let host = NameRecord::new(NameRecordType::HOST, "h");
        let r = Reference::new_random();
        let with = host.clone().with_reference(r);
        assert!(host.references.is_empty());
        assert!(with.references.contains(&r));
        assert!(with.without_reference(&r).references.is_empty());
    }

    #[rstest]
    #[case::name(SocketAddress::proxy_name("p1", 0), true)]
    #[case::name_and_domain(SocketAddress::proxy_name("p1.proxy.site", 0), true)]
    #[case::other_domain(SocketAddress::proxy_name("p1.proxy.other", 0), false)]
    #[case::other_name(SocketAddress::proxy_name("p2", 0), false)]
    #[case::collection(SocketAddress::Collection(vec![SocketAddress::proxy_name("p2", 0), SocketAddress::proxy_name("P1", 0)]), true)]
    #[case::any(SocketAddress::Any, true)]
    fn test_matches_address(#[case] address: SocketAddress, #[case] expected: bool) {
        let p = proxy("p1", "site");
        assert_eq!(p.matches(&NameQuery::MatchesAddress { address, record_type: NameRecordType::PROXY }), expected);
    }

    #[test]
    fn test_matches_address_checks_type() {
        let p = proxy("p1", "");
        assert!(!p.matches(&NameQuery::MatchesAddress { address: SocketAddress::Any, record_type: NameRecordType::HOST }));
    }

    #[test]
    fn test_matches_references() {
        let p = proxy("p1", "");
        let q = NameQuery::MatchesReferences { references: vec![Reference::new_random(), p.address], record_type: NameRecordType::PROXY };
        assert!(p.matches(&q));
        let q = NameQuery::MatchesReferences { references: vec![Reference::new_random()], record_type: NameRecordType::PROXY };
        assert!(!p.matches(&q));
    }

    #[rstest]
    #[case::no_domain("h", "site", true)]
    #[case::same_domain("h.proxy.site", "site", true)]
    #[case::other_domain("h.proxy.site", "x", false)]
    fn test_proxy_for_host(#[case] host: &str, #[case] proxy_domain: &str, #[case] expected: bool) {
        let p = proxy("p", proxy_domain);
        assert_eq!(p.matches(&NameQuery::ProxyForHost { address: SocketAddress::proxy_name(host, 1) }), expected);
        let h = NameRecord::new(NameRecordType::HOST, "p");
        assert!(!h.matches(&NameQuery::ProxyForHost { address: SocketAddress::proxy_name(host, 1) }));
    }

    #[test]
    fn test_ephemeral_host() {
        let h = NameRecord::ephemeral_host(&SocketAddress::proxy_name("dev.proxy.site", 5));
        assert_eq!(h.name, "dev");
        assert_eq!(h.domain, "site");
        assert!(h.is_type(NameRecordType::HOST));
        assert!(h.references.is_empty());
    }
}
