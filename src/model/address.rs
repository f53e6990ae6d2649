use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::str::FromStr;

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::FormatError;
use crate::util::buf::{MpackBufExt, MpackBufMutExt};

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum AddressFamily {
    Unspecified = 0,
    Unix = 1,
    InterNetwork = 2,
    InterNetworkV6 = 23,
    Proxy = 28165,
    Bound = 28166,
    Collection = 28167,
}

impl AddressFamily {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AddressFamily> {
        let raw = buf.mp_get_i32()?;
        AddressFamily::try_from_primitive(raw)
            .map_err(|_| FormatError::AddressFamily(raw).into())
    }
}


const DOMAIN_DELIMITER: &str = ".proxy.";

/// A logical address that is resolved through the name service rather than DNS. Equality and
///  hashing ignore `flags` and `interface_index`, which only matter to the transport.
#[derive(Debug, Clone, Default)]
pub struct ProxyName {
    pub host: String,
    pub domain: String,
    pub port: u16,
    pub flags: u16,
    pub interface_index: i32,
}

impl PartialEq for ProxyName {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.host == other.host && self.domain == other.domain
    }
}
impl Eq for ProxyName {}

impl Hash for ProxyName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.domain.hash(state);
        self.port.hash(state);
    }
}

impl ProxyName {
    /// `host` may contain a domain as `host.proxy.domain`; it is split off, and both parts
    ///  are trimmed and lower-cased.
    pub fn new(host: &str, port: u16) -> ProxyName {
        let (host, domain) = Self::split_domain(host);
        ProxyName {
            host,
            domain,
            port,
            flags: 0,
            interface_index: -1,
        }
    }

    fn split_domain(raw: &str) -> (String, String) {
        let raw = raw.trim().to_lowercase();
        let components = raw.split(DOMAIN_DELIMITER)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if components.len() == 2 {
            return (components[0].trim().to_string(), components[1].trim().to_string());
        }
        (raw, String::new())
    }

    /// The host with its domain, as it is put on the wire
    pub fn qualified_host(&self) -> String {
        if self.domain.is_empty() {
            self.host.clone()
        }
        else {
            format!("{}{}{}", self.host, DOMAIN_DELIMITER, self.domain)
        }
    }
}

impl Display for ProxyName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.qualified_host(), self.port)
    }
}


#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum SocketAddress {
    Any,
    Inet4 {
        address: Ipv4Addr,
        port: u16,
    },
    Inet6 {
        address: Ipv6Addr,
        port: u16,
        flow: u32,
        scope_id: u32,
    },
    Unix {
        path: String,
    },
    ProxyName(ProxyName),
    /// A local proxy paired with a remote peer. This is never put on the wire.
    Bound {
        local: Box<SocketAddress>,
        remote: Box<SocketAddress>,
    },
    /// A fan-out set, e.g. a number of proxies. This is never put on the wire.
    Collection(Vec<SocketAddress>),
}

impl Default for SocketAddress {
    fn default() -> Self {
        SocketAddress::Any
    }
}

impl SocketAddress {
    pub fn proxy_name(host: &str, port: u16) -> SocketAddress {
        SocketAddress::ProxyName(ProxyName::new(host, port))
    }

    pub fn bound(local: SocketAddress, remote: SocketAddress) -> SocketAddress {
        SocketAddress::Bound {
            local: Box::new(local),
            remote: Box::new(remote),
        }
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            SocketAddress::Any => AddressFamily::Unspecified,
            SocketAddress::Inet4 { .. } => AddressFamily::InterNetwork,
            SocketAddress::Inet6 { .. } => AddressFamily::InterNetworkV6,
            SocketAddress::Unix { .. } => AddressFamily::Unix,
            SocketAddress::ProxyName(_) => AddressFamily::Proxy,
            SocketAddress::Bound { .. } => AddressFamily::Bound,
            SocketAddress::Collection(_) => AddressFamily::Collection,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, SocketAddress::Any)
    }

    pub fn port(&self) -> u16 {
        match self {
            SocketAddress::Any | SocketAddress::Unix { .. } => 0,
            SocketAddress::Inet4 { port, .. } => *port,
            SocketAddress::Inet6 { port, .. } => *port,
            SocketAddress::ProxyName(name) => name.port,
            SocketAddress::Bound { remote, .. } => remote.port(),
            SocketAddress::Collection(addresses) => addresses.iter()
                .map(|a| a.port())
                .find(|&p| p != 0)
                .unwrap_or(0),
        }
    }

    /// Follows `Bound` addresses to their (terminal) remote address
    pub fn remote(&self) -> &SocketAddress {
        match self {
            SocketAddress::Bound { remote, .. } => remote.remote(),
            other => other,
        }
    }

    /// Follows `Bound` addresses to their (terminal) local address
    pub fn local(&self) -> &SocketAddress {
        match self {
            SocketAddress::Bound { local, .. } => local.local(),
            other => other,
        }
    }

    /// The concrete IP endpoint for IPv4 and IPv6 addresses
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            SocketAddress::Inet4 { address, port } => Some(SocketAddr::new(IpAddr::V4(*address), *port)),
            SocketAddress::Inet6 { address, port, flow, scope_id } => Some(SocketAddr::V6(SocketAddrV6::new(*address, *port, *flow, *scope_id))),
            _ => None,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        match self {
            SocketAddress::Any => {
                buf.mp_put_object_header(1);
                buf.mp_put_i64(AddressFamily::Unspecified as i64);
            }
            SocketAddress::Unix { path } => {
                buf.mp_put_object_header(2);
                buf.mp_put_i64(AddressFamily::Unix as i64);
                buf.mp_put_str(path);
            }
            SocketAddress::Inet4 { address, port } => {
                buf.mp_put_object_header(3);
                buf.mp_put_i64(AddressFamily::InterNetwork as i64);
                buf.mp_put_u64(*port as u64);
                buf.mp_put_bin(&address.octets());
            }
            SocketAddress::Inet6 { address, port, flow, scope_id } => {
                buf.mp_put_object_header(5);
                buf.mp_put_i64(AddressFamily::InterNetworkV6 as i64);
                buf.mp_put_u64(*port as u64);
                buf.mp_put_u64(*flow as u64);
                buf.mp_put_bin(&address.octets());
                buf.mp_put_u64(*scope_id as u64);
            }
            SocketAddress::ProxyName(name) => {
                buf.mp_put_object_header(5);
                buf.mp_put_i64(AddressFamily::Proxy as i64);
                buf.mp_put_u64(name.port as u64);
                buf.mp_put_u64(name.flags as u64);
                buf.mp_put_i64(name.interface_index as i64);
                buf.mp_put_str(&name.qualified_host());
            }
            SocketAddress::Bound { .. } | SocketAddress::Collection(_) => {
                return Err(FormatError::NotEncodable(self.family().into()).into());
            }
        }
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SocketAddress> {
        let num_fields = buf.mp_get_object_header()?;
        if num_fields < 1 {
            return Err(FormatError::FieldCount { expected: "at least 1".to_string(), actual: num_fields }.into());
        }

        let family = AddressFamily::deser(buf)?;
        let expect_fields = |expected: usize| -> anyhow::Result<()> {
            if num_fields != expected {
                return Err(FormatError::FieldCount { expected: expected.to_string(), actual: num_fields }.into());
            }
            Ok(())
        };

        let result = match family {
            AddressFamily::Unspecified => {
                expect_fields(1)?;
                SocketAddress::Any
            }
            AddressFamily::Unix => {
                expect_fields(2)?;
                SocketAddress::Unix {
                    path: buf.mp_get_str()?,
                }
            }
            AddressFamily::InterNetwork => {
                expect_fields(3)?;
                let port = buf.mp_get_u16()?;
                let address = Ipv4Addr::from(buf.mp_get_bin_fixed::<4>("ipv4 address")?);
                SocketAddress::Inet4 { address, port }
            }
            AddressFamily::InterNetworkV6 => {
                expect_fields(5)?;
                let port = buf.mp_get_u16()?;
                let flow = buf.mp_get_u32()?;
                let address = Ipv6Addr::from(buf.mp_get_bin_fixed::<16>("ipv6 address")?);
                let scope_id = buf.mp_get_u32()?;
                SocketAddress::Inet6 { address, port, flow, scope_id }
            }
            AddressFamily::Proxy => {
                expect_fields(5)?;
                let port = buf.mp_get_u16()?;
                let flags = buf.mp_get_u16()?;
                let interface_index = buf.mp_get_i32()?;
                let host = buf.mp_get_str()?;
                let mut name = ProxyName::new(&host, port);
                name.flags = flags;
                name.interface_index = interface_index;
                SocketAddress::ProxyName(name)
            }
            AddressFamily::Bound | AddressFamily::Collection => {
                return Err(FormatError::AddressFamily(family.into()).into());
            }
        };
        Ok(result)
    }

    /// Absent addresses are encoded as nil
    pub fn ser_opt(address: Option<&SocketAddress>, buf: &mut impl BufMut) -> anyhow::Result<()> {
        match address {
            Some(a) => a.ser(buf),
            None => {
                buf.mp_put_nil();
                Ok(())
            }
        }
    }

    pub fn deser_opt(buf: &mut impl Buf) -> anyhow::Result<Option<SocketAddress>> {
        if buf.mp_peek_nil() {
            buf.mp_get_nil()?;
            return Ok(None);
        }
        Ok(Some(SocketAddress::deser(buf)?))
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(a) => SocketAddress::Inet4 { address: *a.ip(), port: a.port() },
            SocketAddr::V6(a) => SocketAddress::Inet6 { address: *a.ip(), port: a.port(), flow: a.flowinfo(), scope_id: a.scope_id() },
        }
    }
}

impl FromStr for SocketAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(SocketAddress::Any);
        }
        if let Ok(addr) = SocketAddr::from_str(s) {
            return Ok(addr.into());
        }
        if let Ok(ip) = IpAddr::from_str(s) {
            return Ok(SocketAddr::new(ip, 0).into());
        }

        let (host, port) = match s.find(':') {
            None | Some(0) => (s, 0),
            Some(idx) => {
                let port = s[idx+1..].parse::<u16>()
                    .map_err(|e| anyhow!("invalid port in {:?}: {}", s, e))?;
                (&s[..idx], port)
            }
        };
        Ok(SocketAddress::proxy_name(host, port))
    }
}

impl Display for SocketAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketAddress::Any => write!(f, "*"),
            SocketAddress::Unix { path } => write!(f, "unix:{}", path),
            SocketAddress::ProxyName(name) => write!(f, "{}", name),
            SocketAddress::Bound { local, remote } => write!(f, "{}->{}", local, remote),
            SocketAddress::Collection(addresses) => {
                write!(f, "{{")?;
                for (i, a) in addresses.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, "}}")
            }
            inet => match inet.to_socket_addr() {
                Some(a) => write!(f, "{}", a),
                None => Ok(()),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;
    use crate::error::is_format_error;

    fn round_trip(addr: &SocketAddress) -> SocketAddress {
        let mut buf = BytesMut::new();
        addr.ser(&mut buf).unwrap();
        let mut b: &[u8] = &buf;
        let result = SocketAddress::deser(&mut b).unwrap();
        assert!(b.is_empty());
        result
    }

    #[rstest]
    #[case::any(SocketAddress::Any, 1)]
    #[case::unix(SocketAddress::Unix { path: "/tmp/sock".to_string() }, 2)]
    #[case::inet4(SocketAddress::Inet4 { address: Ipv4Addr::new(10, 1, 2, 3), port: 8080 }, 3)]
    #[case::inet6(SocketAddress::Inet6 { address: Ipv6Addr::LOCALHOST, port: 443, flow: 7, scope_id: 3 }, 5)]
    #[case::proxy_name(SocketAddress::proxy_name("device1", 502), 5)]
    #[case::proxy_name_with_domain(SocketAddress::proxy_name("device1.proxy.plant", 502), 5)]
    fn test_ser_field_count(#[case] addr: SocketAddress, #[case] num_fields: u8) {
        let mut buf = BytesMut::new();
        addr.ser(&mut buf).unwrap();
        assert_eq!(buf[0], 0x90 | num_fields);
        assert_eq!(round_trip(&addr), addr);
    }

    #[test]
    fn test_proxy_name_keeps_transport_fields() {
        let mut name = ProxyName::new("Host.Proxy.Domain", 1);
        name.flags = 3;
        name.interface_index = 2;
        let decoded = round_trip(&SocketAddress::ProxyName(name));
        match decoded {
            SocketAddress::ProxyName(n) => {
                assert_eq!(n.host, "host");
                assert_eq!(n.domain, "domain");
                assert_eq!(n.flags, 3);
                assert_eq!(n.interface_index, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_proxy_name_equality_ignores_transport_fields() {
        let a = ProxyName::new("dev", 10);
        let mut b = ProxyName::new("DEV ", 10);
        b.flags = 9;
        b.interface_index = 4;
        assert_eq!(a, b);
        assert_ne!(a, ProxyName::new("dev", 11));
    }

    #[rstest]
    #[case::bound(SocketAddress::bound(SocketAddress::Any, SocketAddress::Any))]
    #[case::collection(SocketAddress::Collection(vec![]))]
    fn test_ser_not_encodable(#[case] addr: SocketAddress) {
        let mut buf = BytesMut::new();
        assert!(is_format_error(&addr.ser(&mut buf).unwrap_err()));
    }

    #[test]
    fn test_deser_wrong_ipv4_size() {
        let mut buf = BytesMut::new();
        buf.mp_put_object_header(3);
        buf.mp_put_i64(AddressFamily::InterNetwork as i64);
        buf.mp_put_u64(80);
        buf.mp_put_bin(&[1, 2, 3, 4, 5, 6]);
        let mut b: &[u8] = &buf;
        let err = SocketAddress::deser(&mut b).unwrap_err();
        assert_eq!(err.downcast_ref::<FormatError>(), Some(&FormatError::FixedSize { what: "ipv4 address", actual: 6 }));
    }

    #[rstest]
    #[case::unknown_family(vec![0x92, 0x09, 0xa0], FormatError::AddressFamily(9))]
    #[case::wrong_count(vec![0x92, 0x02, 0x05], FormatError::FieldCount { expected: "3".to_string(), actual: 2 })]
    #[case::empty(vec![0x90], FormatError::FieldCount { expected: "at least 1".to_string(), actual: 0 })]
    fn test_deser_errors(#[case] raw: Vec<u8>, #[case] expected: FormatError) {
        let mut b: &[u8] = &raw;
        let err = SocketAddress::deser(&mut b).unwrap_err();
        assert_eq!(err.downcast_ref::<FormatError>(), Some(&expected));
    }

    #[rstest]
    #[case::empty("", SocketAddress::Any)]
    #[case::ipv4("192.168.0.1:80", SocketAddress::Inet4 { address: Ipv4Addr::new(192, 168, 0, 1), port: 80 })]
    #[case::ipv4_no_port("192.168.0.1", SocketAddress::Inet4 { address: Ipv4Addr::new(192, 168, 0, 1), port: 0 })]
    #[case::ipv6("[::1]:443", SocketAddress::Inet6 { address: Ipv6Addr::LOCALHOST, port: 443, flow: 0, scope_id: 0 })]
    #[case::name("Device1:502", SocketAddress::proxy_name("device1", 502))]
    #[case::name_no_port("device1", SocketAddress::proxy_name("device1", 0))]
    #[case::name_with_domain("dev.proxy.site:1", SocketAddress::ProxyName(ProxyName { host: "dev".to_string(), domain: "site".to_string(), port: 1, flags: 0, interface_index: -1 }))]
    fn test_parse(#[case] s: &str, #[case] expected: SocketAddress) {
        assert_eq!(SocketAddress::from_str(s).unwrap(), expected);
    }

    #[test]
    fn test_parse_bad_port() {
        assert!(SocketAddress::from_str("host:99999").is_err());
    }

    #[rstest]
    #[case::name(SocketAddress::proxy_name("dev.proxy.site", 1), "dev.proxy.site:1")]
    #[case::ipv4(SocketAddress::Inet4 { address: Ipv4Addr::LOCALHOST, port: 5 }, "127.0.0.1:5")]
    fn test_display(#[case] addr: SocketAddress, #[case] expected: &str) {
        assert_eq!(addr.to_string(), expected);
    }

    #[rstest]
    #[case::bound(SocketAddress::bound(SocketAddress::proxy_name("p", 0), SocketAddress::proxy_name("h", 7)), 7)]
    #[case::collection(SocketAddress::Collection(vec![SocketAddress::Any, SocketAddress::proxy_name("h", 9), SocketAddress::proxy_name("g", 3)]), 9)]
    #[case::any(SocketAddress::Any, 0)]
    fn test_port(#[case] addr: SocketAddress, #[case] expected: u16) {
        assert_eq!(addr.port(), expected);
    }

    #[test]
    fn test_remote_unwraps_recursively() {
        let inner = SocketAddress::bound(SocketAddress::Any, SocketAddress::proxy_name("h", 1));
        let outer = SocketAddress::bound(SocketAddress::proxy_name("p", 0), inner);
        assert_eq!(outer.remote(), &SocketAddress::proxy_name("h", 1));
        assert_eq!(outer.local(), &SocketAddress::proxy_name("p", 0));
    }

    #[test]
    fn test_opt_nil() {
        let mut buf = BytesMut::new();
        SocketAddress::ser_opt(None, &mut buf).unwrap();
        let mut b: &[u8] = &buf;
        assert_eq!(SocketAddress::deser_opt(&mut b).unwrap(), None);
    }
}
