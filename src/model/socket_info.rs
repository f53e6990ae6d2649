use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;

use crate::error::FormatError;
use crate::model::address::{AddressFamily, SocketAddress};
use crate::util::buf::{MpackBufExt, MpackBufMutExt};

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum SocketType {
    Stream = 1,
    Dgram = 2,
    Raw = 3,
    Rdm = 4,
    SeqPacket = 5,
}

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ProtocolType {
    Unspecified = 0,
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
    Icmpv6 = 58,
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct SocketFlags: u32 {
        /// listening socket
        const PASSIVE = 0x1;
        /// link into the proxy itself rather than to a remote host
        const INTERNAL = 0x2;
    }
}

/// Socket options in native numbering. Options below [SocketOption::MAX] carry a plain u64 value
///  except for the multicast join / leave options, which carry a [MulticastOption].
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
pub enum SocketOption {
    Nonblocking = 0,
    Available,
    Shutdown,
    Debug,
    Acceptconn,
    Reuseaddr,
    Keepalive,
    Dontroute,
    Broadcast,
    Linger,
    OobInline,
    Sndbuf,
    Rcvbuf,
    Sndtimeo,
    Rcvtimeo,
    Error,
    Type,
    IpOptions,
    IpHdrincl,
    IpTos,
    IpTtl,
    IpMulticastTtl,
    IpMulticastLoop,
    IpPktinfo,
    Ipv6Hoplimit,
    Ipv6ProtectionLevel,
    Ipv6V6only,
    TcpNodelay,
    IpMulticastJoin,
    IpMulticastLeave,
    PropsTimeout,
}

impl SocketOption {
    pub const MAX: u32 = SocketOption::PropsTimeout as u32 + 1;

    pub fn is_multicast(self) -> bool {
        matches!(self, SocketOption::IpMulticastJoin | SocketOption::IpMulticastLeave)
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SocketOption> {
        let raw = buf.mp_get_u32()?;
        SocketOption::try_from_primitive(raw)
            .map_err(|_| FormatError::PropertyType(raw).into())
    }

    pub fn ser(self, buf: &mut impl BufMut) {
        buf.mp_put_u64(u32::from(self) as u64);
    }
}


#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct MulticastOption {
    pub interface_index: i32,
    pub address: IpAddr,
}

impl MulticastOption {
    pub fn family(&self) -> AddressFamily {
        match self.address {
            IpAddr::V4(_) => AddressFamily::InterNetwork,
            IpAddr::V6(_) => AddressFamily::InterNetworkV6,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.mp_put_object_header(3);
        buf.mp_put_i64(i32::from(self.family()) as i64);
        buf.mp_put_i64(self.interface_index as i64);
        match self.address {
            IpAddr::V4(a) => buf.mp_put_bin(&a.octets()),
            IpAddr::V6(a) => buf.mp_put_bin(&a.octets()),
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MulticastOption> {
        buf.mp_get_object(3)?;
        let family = AddressFamily::deser(buf)?;
        let interface_index = buf.mp_get_i32()?;
        let address = match family {
            AddressFamily::InterNetwork => IpAddr::V4(Ipv4Addr::from(buf.mp_get_bin_fixed::<4>("multicast ipv4 address")?)),
            AddressFamily::InterNetworkV6 => IpAddr::V6(Ipv6Addr::from(buf.mp_get_bin_fixed::<16>("multicast ipv6 address")?)),
            other => return Err(FormatError::AddressFamily(other.into()).into()),
        };
        Ok(MulticastOption { interface_index, address })
    }
}


#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PropertyValue {
    Value(u64),
    Multicast(MulticastOption),
}

/// A socket option with its value: `[type, value]` on the wire
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Property {
    pub option: SocketOption,
    pub value: PropertyValue,
}

impl Property {
    pub fn new(option: SocketOption, value: u64) -> Property {
        Property {
            option,
            value: PropertyValue::Value(value),
        }
    }

    pub fn multicast(join: bool, option: MulticastOption) -> Property {
        Property {
            option: if join { SocketOption::IpMulticastJoin } else { SocketOption::IpMulticastLeave },
            value: PropertyValue::Multicast(option),
        }
    }

    /// the plain value, if this is not a multicast property
    pub fn as_u64(&self) -> Option<u64> {
        match self.value {
            PropertyValue::Value(v) => Some(v),
            PropertyValue::Multicast(_) => None,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        if self.option.is_multicast() != matches!(self.value, PropertyValue::Multicast(_)) {
            return Err(FormatError::PropertyType(self.option.into()).into());
        }

        buf.mp_put_object_header(2);
        self.option.ser(buf);
        match &self.value {
            PropertyValue::Value(v) => buf.mp_put_u64(*v),
            PropertyValue::Multicast(m) => m.ser(buf),
        }
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Property> {
        buf.mp_get_object(2)?;
        let option = SocketOption::deser(buf)?;
        let value = if option.is_multicast() {
            PropertyValue::Multicast(MulticastOption::deser(buf)?)
        }
        else {
            PropertyValue::Value(buf.mp_get_u64()?)
        };
        Ok(Property { option, value })
    }
}


/// Describes the socket that a link should create on the proxy side.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SocketInfo {
    pub family: AddressFamily,
    pub socket_type: SocketType,
    pub protocol: ProtocolType,
    pub address: SocketAddress,
    pub flags: SocketFlags,
    /// options that were set before the first link was opened
    pub options: FxHashMap<SocketOption, Property>,
    /// milliseconds, 0 for 'no timeout'
    pub timeout: u32,
}

impl SocketInfo {
    pub fn new(socket_type: SocketType, protocol: ProtocolType) -> SocketInfo {
        SocketInfo {
            family: AddressFamily::Proxy,
            socket_type,
            protocol,
            address: SocketAddress::Any,
            flags: SocketFlags::empty(),
            options: FxHashMap::default(),
            timeout: 0,
        }
    }

    pub fn tcp() -> SocketInfo {
        Self::new(SocketType::Stream, ProtocolType::Tcp)
    }

    pub fn udp() -> SocketInfo {
        Self::new(SocketType::Dgram, ProtocolType::Udp)
    }

    pub fn is_passive(&self) -> bool {
        self.flags.contains(SocketFlags::PASSIVE)
    }

    pub fn is_internal(&self) -> bool {
        self.flags.contains(SocketFlags::INTERNAL)
    }

    /// options in a stable order
    pub fn sorted_options(&self) -> Vec<Property> {
        let mut result = self.options.values().copied().collect::<Vec<_>>();
        result.sort_by_key(|p| p.option);
        result
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        buf.mp_put_object_header(7);
        buf.mp_put_i64(i32::from(self.family) as i64);
        buf.mp_put_i64(i32::from(self.socket_type) as i64);
        buf.mp_put_i64(i32::from(self.protocol) as i64);
        self.address.ser(buf)?;
        buf.mp_put_u64(self.flags.bits() as u64);

        let options = self.sorted_options();
        buf.mp_put_object_header(options.len());
        for option in &options {
            option.ser(buf)?;
        }

        buf.mp_put_u64(self.timeout as u64);
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SocketInfo> {
        buf.mp_get_object(7)?;
        let family = AddressFamily::deser(buf)?;

        let raw_type = buf.mp_get_i32()?;
        let socket_type = SocketType::try_from_primitive(raw_type)
            .map_err(|_| FormatError::OutOfRange("socket type"))?;
        let raw_protocol = buf.mp_get_i32()?;
        let protocol = ProtocolType::try_from_primitive(raw_protocol)
            .map_err(|_| FormatError::OutOfRange("protocol type"))?;

        let address = SocketAddress::deser(buf)?;
        let flags = SocketFlags::from_bits_retain(buf.mp_get_u32()?);

        let num_options = buf.mp_get_object_header()?;
        let mut options = FxHashMap::default();
        for _ in 0..num_options {
            let property = Property::deser(buf)?;
            options.insert(property.option, property);
        }

        let timeout = buf.mp_get_u32()?;
        Ok(SocketInfo {
            family,
            socket_type,
            protocol,
            address,
            flags,
            options,
            timeout,
        })
    }
}
