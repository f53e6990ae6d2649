//! Proxy side links: every link owns one real network socket, and once the link is opened a
//!  pump task moves payload between that socket and the link's message stream.

use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::config::ProxyConfig;
use crate::error::{SocketError, SocketException};
use crate::link::data_plane::{classify, Inbound};
use crate::link::registry::LinkRegistry;
use crate::link::stats::{LinkCounters, ProxyLinkStats};
use crate::model::address::SocketAddress;
use crate::model::reference::Reference;
use crate::model::socket_info::{Property, SocketInfo, SocketOption, SocketType};
use crate::protocol::content::{DataMessage, MessageContent};
use crate::protocol::message::Message;
use crate::provider::MessageStream;
use crate::server::resolver::Resolver;

const PUMP_BUFFER_SIZE: usize = 64*1024;

enum LinkSocket {
    Stream(Arc<TcpStream>),
    Listener(Arc<TcpListener>),
    Datagram(Arc<UdpSocket>),
}

impl LinkSocket {
    fn sock_ref(&self) -> SockRef<'_> {
        match self {
            LinkSocket::Stream(s) => SockRef::from(s.as_ref()),
            LinkSocket::Listener(l) => SockRef::from(l.as_ref()),
            LinkSocket::Datagram(u) => SockRef::from(u.as_ref()),
        }
    }
}

/// The proxy's half of a link
pub struct ServerLink {
    id: Reference,
    /// the client socket that requested the link
    owner: Reference,
    info: SocketInfo,
    socket: LinkSocket,
    local_address: SocketAddress,
    peer_address: SocketAddress,
    idle_timeout_millis: AtomicU64,
    counters: Arc<LinkCounters>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for ServerLink {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServerLink{{{}: {}->{}}}", self.id, self.local_address, self.peer_address)
    }
}

impl Drop for ServerLink {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn prop_error(operation: SocketError, option: SocketOption, e: std::io::Error) -> anyhow::Error {
    SocketException::new(operation, format!("{:?}: {}", option, e)).into()
}

impl ServerLink {
    pub fn id(&self) -> Reference {
        self.id
    }

    pub fn local_address(&self) -> &SocketAddress {
        &self.local_address
    }

    pub fn peer_address(&self) -> &SocketAddress {
        &self.peer_address
    }

    pub fn info(&self) -> &SocketInfo {
        &self.info
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_millis.load(Ordering::Acquire))
    }

    pub fn set_option(&self, property: &Property, min_timeout: Duration) -> anyhow::Result<()> {
        let option = property.option;
        let value = match property.as_u64() {
            Some(v) => v,
            None => return Err(SocketException::new(SocketError::NotSupported, format!("{:?}", option)).into()),
        };
        let set_err = |e| prop_error(SocketError::PropSet, option, e);

        match (option, &self.socket) {
            (SocketOption::PropsTimeout, _) => {
                let timeout = Duration::from_millis(value).max(min_timeout);
                self.idle_timeout_millis.store(timeout.as_millis() as u64, Ordering::Release);
                Ok(())
            }
            (SocketOption::TcpNodelay, LinkSocket::Stream(s)) => s.set_nodelay(value != 0).map_err(set_err),
            (SocketOption::IpTtl, LinkSocket::Stream(s)) => s.set_ttl(value as u32).map_err(set_err),
            (SocketOption::IpTtl, LinkSocket::Listener(l)) => l.set_ttl(value as u32).map_err(set_err),
            (SocketOption::IpTtl, LinkSocket::Datagram(u)) => u.set_ttl(value as u32).map_err(set_err),
            (SocketOption::Broadcast, LinkSocket::Datagram(u)) => u.set_broadcast(value != 0).map_err(set_err),
            (SocketOption::Keepalive, LinkSocket::Stream(_)) => self.socket.sock_ref().set_keepalive(value != 0).map_err(set_err),
            (SocketOption::Reuseaddr, _) => self.socket.sock_ref().set_reuse_address(value != 0).map_err(set_err),
            (SocketOption::Sndbuf, _) => self.socket.sock_ref().set_send_buffer_size(value as usize).map_err(set_err),
            (SocketOption::Rcvbuf, _) => self.socket.sock_ref().set_recv_buffer_size(value as usize).map_err(set_err),
            (option, _) => Err(SocketException::new(SocketError::NotSupported, format!("{:?} for {:?} link", option, self.info.socket_type)).into()),
        }
    }

    pub fn get_option(&self, option: SocketOption) -> anyhow::Result<Property> {
        let get_err = |e| prop_error(SocketError::PropGet, option, e);

        let value = match (option, &self.socket) {
            (SocketOption::PropsTimeout, _) => self.idle_timeout_millis.load(Ordering::Acquire),
            (SocketOption::TcpNodelay, LinkSocket::Stream(s)) => s.nodelay().map_err(get_err)? as u64,
            (SocketOption::IpTtl, LinkSocket::Stream(s)) => s.ttl().map_err(get_err)? as u64,
            (SocketOption::IpTtl, LinkSocket::Listener(l)) => l.ttl().map_err(get_err)? as u64,
            (SocketOption::IpTtl, LinkSocket::Datagram(u)) => u.ttl().map_err(get_err)? as u64,
            (SocketOption::Broadcast, LinkSocket::Datagram(u)) => u.broadcast().map_err(get_err)? as u64,
            (SocketOption::Keepalive, LinkSocket::Stream(_)) => self.socket.sock_ref().keepalive().map_err(get_err)? as u64,
            (SocketOption::Reuseaddr, _) => self.socket.sock_ref().reuse_address().map_err(get_err)? as u64,
            (SocketOption::Sndbuf, _) => self.socket.sock_ref().send_buffer_size().map_err(get_err)? as u64,
            (SocketOption::Rcvbuf, _) => self.socket.sock_ref().recv_buffer_size().map_err(get_err)? as u64,
            (option, _) => return Err(SocketException::new(SocketError::NotSupported, format!("{:?} for {:?} link", option, self.info.socket_type)).into()),
        };
        Ok(Property::new(option, value))
    }

    /// Starts moving payload between the socket and `stream`
    async fn start(self: &Arc<Self>, stream: MessageStream, resolver: Arc<dyn Resolver>) -> anyhow::Result<()> {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            return Err(SocketException::new(SocketError::BadState, "link is open already").into());
        }

        let link = self.clone();
        *pump = Some(tokio::spawn(async move {
            let result = match &link.socket {
                LinkSocket::Stream(tcp) => link.pump_stream(tcp.clone(), stream).await,
                LinkSocket::Listener(listener) => link.pump_accepted(listener.clone(), stream).await,
                LinkSocket::Datagram(udp) => link.pump_datagrams(udp.clone(), stream, resolver).await,
            };
            match result {
                Ok(()) => debug!("pump of link {} ended", link.id),
                Err(e) => {
                    warn!("pump of link {} failed: {}", link.id, e);
                    link.counters.on_error(SocketError::Network);
                }
            }
        }.instrument(Span::current())));
        Ok(())
    }

    fn data(&self, payload: Bytes, address: Option<SocketAddress>) -> Message {
        Message::data(self.id, Reference::NULL, self.owner, DataMessage::new(payload, address))
    }

    fn end_of_stream(&self) -> Message {
        Message::request(self.id, Reference::NULL, self.owner, MessageContent::CloseRequest)
    }

    async fn pump_accepted(&self, listener: Arc<TcpListener>, stream: MessageStream) -> anyhow::Result<()> {
        let (tcp, peer) = select! {
            r = listener.accept() => r?,
            _ = self.shutdown.cancelled() => return Ok(()),
        };
        debug!("link {} accepted a connection from {}", self.id, peer);
        self.pump_stream(Arc::new(tcp), stream).await
    }

    async fn pump_stream(&self, tcp: Arc<TcpStream>, stream: MessageStream) -> anyhow::Result<()> {
        let MessageStream { sender, mut receiver } = stream;
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];

        loop {
            select! {
                r = tcp.readable() => {
                    r?;
                    match tcp.try_read(&mut buf) {
                        Ok(0) => {
                            trace!("peer closed the connection");
                            let _ = sender.send(self.end_of_stream()).await;
                            return Ok(());
                        }
                        Ok(n) => {
                            self.counters.on_received(n);
                            if sender.send(self.data(Bytes::copy_from_slice(&buf[..n]), None)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                m = receiver.recv() => match m.map(classify) {
                    Some(Inbound::Deliver(message)) => {
                        if let MessageContent::Data(data) = message.content {
                            write_all(&tcp, &data.payload).await?;
                            self.counters.on_sent(data.payload.len());
                        }
                    }
                    Some(Inbound::Drop) => {}
                    Some(Inbound::Fail(e)) => return Err(e.into()),
                    Some(Inbound::EndOfStream) | None => return Ok(()),
                },
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn pump_datagrams(&self, udp: Arc<UdpSocket>, stream: MessageStream, resolver: Arc<dyn Resolver>) -> anyhow::Result<()> {
        let MessageStream { sender, mut receiver } = stream;
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];

        loop {
            select! {
                r = udp.recv_from(&mut buf) => {
                    let (n, from) = r?;
                    self.counters.on_received(n);
                    if sender.send(self.data(Bytes::copy_from_slice(&buf[..n]), Some(from.into()))).await.is_err() {
                        return Ok(());
                    }
                }
                m = receiver.recv() => match m.map(classify) {
                    Some(Inbound::Deliver(message)) => {
                        if let MessageContent::Data(data) = message.content {
                            let to = match &data.address {
                                Some(a) => match a.to_socket_addr() {
                                    Some(to) => to,
                                    None => match resolver.resolve(a).await {
                                        Ok(resolved) => match resolved.first() {
                                            Some(to) => *to,
                                            None => {
                                                debug!("dropping datagram, {} resolved to nothing", a);
                                                continue;
                                            }
                                        },
                                        Err(e) => {
                                            warn!("dropping datagram, could not resolve {}: {:#}", a, e);
                                            continue;
                                        }
                                    },
                                },
                                None => {
                                    debug!("dropping datagram without destination");
                                    continue;
                                }
                            };
                            udp.send_to(&data.payload, to).await?;
                            self.counters.on_sent(data.payload.len());
                        }
                    }
                    Some(Inbound::Drop) => {}
                    Some(Inbound::Fail(e)) => return Err(e.into()),
                    Some(Inbound::EndOfStream) | None => return Ok(()),
                },
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn close(&self) -> ProxyLinkStats {
        self.shutdown.cancel();
        if let Some(pump) = self.pump.lock().await.take() {
            if let Err(e) = pump.await {
                warn!("pump of link {} panicked: {}", self.id, e);
            }
        }
        self.counters.snapshot()
    }
}

async fn write_all(tcp: &TcpStream, mut data: &[u8]) -> anyhow::Result<()> {
    while !data.is_empty() {
        tcp.writable().await?;
        match tcp.try_write(data) {
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn bind_address(address: &SocketAddress) -> SocketAddr {
    address.to_socket_addr()
        .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), address.port()))
}


/// Creates, tracks and tears down the links of one proxy
pub struct LinkManager {
    config: Arc<ProxyConfig>,
    resolver: Arc<dyn Resolver>,
    links: LinkRegistry<Reference, Arc<ServerLink>>,
}

impl Debug for LinkManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LinkManager{{{} links}}", self.links.len())
    }
}

impl LinkManager {
    pub fn new(config: Arc<ProxyConfig>, resolver: Arc<dyn Resolver>) -> LinkManager {
        LinkManager {
            config,
            resolver,
            links: LinkRegistry::new(),
        }
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    pub fn get(&self, id: &Reference) -> anyhow::Result<Arc<ServerLink>> {
        self.links.get(id)
            .ok_or_else(|| SocketException::new(SocketError::NotFound, format!("no link {}", id)).into())
    }

    pub fn num_links(&self) -> usize {
        self.links.len()
    }

    /// Creates the network socket for a link request from `owner`, applying the options that came
    ///  with the request
    pub async fn create_link(&self, owner: Reference, info: &SocketInfo) -> anyhow::Result<Arc<ServerLink>> {
        let port = info.address.port();
        if !info.is_passive() && !info.is_internal() && self.config.restricted_ports.contains(&port) {
            return Err(SocketException::new(SocketError::Permission, format!("port {} is restricted", port)).into());
        }

        let (socket, local_address, peer_address) = match (info.socket_type, info.is_passive()) {
            (SocketType::Stream, false) => {
                let tcp = self.connect(info).await?;
                let local = tcp.local_addr()?.into();
                let peer = tcp.peer_addr()?.into();
                (LinkSocket::Stream(Arc::new(tcp)), local, peer)
            }
            (SocketType::Stream, true) => {
                let listener = TcpListener::bind(bind_address(&info.address)).await
                    .map_err(|e| SocketException::new(SocketError::AddressFamily, format!("cannot listen on {}: {}", info.address, e)))?;
                let local = listener.local_addr()?.into();
                (LinkSocket::Listener(Arc::new(listener)), local, SocketAddress::Any)
            }
            (SocketType::Dgram, _) => {
                let udp = UdpSocket::bind(bind_address(&info.address)).await
                    .map_err(|e| SocketException::new(SocketError::AddressFamily, format!("cannot bind {}: {}", info.address, e)))?;
                let local = udp.local_addr()?.into();
                (LinkSocket::Datagram(Arc::new(udp)), local, SocketAddress::Any)
            }
            (other, _) => return Err(SocketException::new(SocketError::NotSupported, format!("{:?} links", other)).into()),
        };

        let link = Arc::new(ServerLink {
            id: Reference::new_random(),
            owner,
            info: info.clone(),
            socket,
            local_address,
            peer_address,
            idle_timeout_millis: AtomicU64::new(self.config.min_link_timeout.as_millis() as u64),
            counters: Arc::new(LinkCounters::new()),
            shutdown: CancellationToken::new(),
            pump: Default::default(),
        });

        for property in info.sorted_options() {
            if let Err(e) = link.set_option(&property, self.config.min_link_timeout) {
                warn!("ignoring option {:?} of link request: {}", property.option, e);
            }
        }

        self.links.insert(link.id, link.clone());
        info!("created link {:?}", link);
        Ok(link)
    }

    async fn connect(&self, info: &SocketInfo) -> anyhow::Result<TcpStream> {
        let timeout = self.config.effective_connect_timeout(info.timeout);
        let mut last_error = None;
        for endpoint in self.resolver.resolve(&info.address).await? {
            match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
                Ok(Ok(tcp)) => return Ok(tcp),
                Ok(Err(e)) => {
                    debug!("connecting to {} failed: {}", endpoint, e);
                    last_error = Some(SocketException::new(SocketError::Refused, format!("{}: {}", endpoint, e)));
                }
                Err(_) => {
                    debug!("connecting to {} timed out", endpoint);
                    last_error = Some(SocketException::new(SocketError::Timeout, format!("connecting to {}", endpoint)));
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| SocketException::new(SocketError::NoHost, format!("{}", info.address)))
            .into())
    }

    pub async fn open(&self, id: &Reference, stream: MessageStream) -> anyhow::Result<()> {
        self.get(id)?
            .start(stream, self.resolver.clone()).await
    }

    pub fn set_option(&self, id: &Reference, property: &Property) -> anyhow::Result<()> {
        self.get(id)?
            .set_option(property, self.config.min_link_timeout)
    }

    pub fn get_option(&self, id: &Reference, option: SocketOption) -> anyhow::Result<Property> {
        self.get(id)?
            .get_option(option)
    }

    pub async fn close(&self, id: &Reference) -> anyhow::Result<ProxyLinkStats> {
        let link = match self.links.remove(id) {
            Some(link) => link,
            None => return Err(SocketException::new(SocketError::NotFound, format!("no link {}", id)).into()),
        };
        let stats = link.close().await;
        info!("closed link {}: {:?}", id, stats);
        Ok(stats)
    }
}


#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::socket_error_of;
    use crate::model::socket_info::SocketFlags;
    use crate::server::resolver::{DnsResolver, MockResolver};

    fn manager(config: ProxyConfig) -> LinkManager {
        LinkManager::new(Arc::new(config), Arc::new(DnsResolver::new(Duration::from_secs(1))))
    }

    fn tcp_info(address: SocketAddr) -> SocketInfo {
        let mut info = SocketInfo::tcp();
        info.address = address.into();
        info
    }

    /// Returns the link side of a message stream and the far end
    fn stream_pair() -> (MessageStream, MessageStream) {
        let (a_send, a_recv) = mpsc::channel(8);
        let (b_send, b_recv) = mpsc::channel(8);
        (MessageStream { sender: a_send, receiver: b_recv }, MessageStream { sender: b_send, receiver: a_recv })
    }

    #[tokio::test]
    async fn test_stream_link_pumps_both_ways() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let manager = manager(ProxyConfig::default());
        let owner = Reference::new_random();

        let link = manager.create_link(owner, &tcp_info(server.local_addr().unwrap())).await.unwrap();
        let (mut remote, _) = server.accept().await.unwrap();
        assert_eq!(link.peer_address(), &SocketAddress::from(server.local_addr().unwrap()));

        let (link_side, mut client) = stream_pair();
        manager.open(&link.id(), link_side).await.unwrap();

        client.sender.send(Message::data(owner, Reference::NULL, link.id(), DataMessage::new(Bytes::from_static(b"ping"), None))).await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await.unwrap();
        let answer = client.receiver.recv().await.unwrap();
        assert_eq!(answer.target, owner);
        assert_eq!(answer.content, MessageContent::Data(DataMessage::new(Bytes::from_static(b"pong"), None)));

        drop(remote);
        let end = client.receiver.recv().await.unwrap();
        assert_eq!(end.content, MessageContent::CloseRequest);

        let stats = manager.close(&link.id()).await.unwrap();
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.bytes_received, 4);
        assert_eq!(manager.num_links(), 0);
    }

    #[tokio::test]
    async fn test_datagram_link() {
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let manager = manager(ProxyConfig::default());
        let owner = Reference::new_random();

        let mut info = SocketInfo::udp();
        info.address = SocketAddress::from_str("127.0.0.1:0").unwrap();
        let link = manager.create_link(owner, &info).await.unwrap();
        let (link_side, mut client) = stream_pair();
        manager.open(&link.id(), link_side).await.unwrap();

        let to = SocketAddress::from(remote.local_addr().unwrap());
        client.sender.send(Message::data(owner, Reference::NULL, link.id(), DataMessage::new(Bytes::from_static(b"dgram"), Some(to)))).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"dgram");

        remote.send_to(b"reply", from).await.unwrap();
        match client.receiver.recv().await.unwrap().content {
            MessageContent::Data(d) => {
                assert_eq!(d.payload.as_ref(), b"reply");
                assert_eq!(d.address, Some(SocketAddress::from(remote.local_addr().unwrap())));
            }
            other => panic!("{:?}", other),
        }
        manager.close(&link.id()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unresolvable_datagram_is_dropped() {
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut resolver = MockResolver::new();
        resolver.expect_resolve()
            .returning(|a| Err(SocketException::new(SocketError::NoHost, format!("{} is unknown", a)).into()));
        let manager = LinkManager::new(Arc::new(ProxyConfig::default()), Arc::new(resolver));
        let owner = Reference::new_random();

        let mut info = SocketInfo::udp();
        info.address = SocketAddress::from_str("127.0.0.1:0").unwrap();
        let link = manager.create_link(owner, &info).await.unwrap();
        let (link_side, client) = stream_pair();
        manager.open(&link.id(), link_side).await.unwrap();

        let unknown = SocketAddress::proxy_name("nowhere", 9);
        client.sender.send(Message::data(owner, Reference::NULL, link.id(), DataMessage::new(Bytes::from_static(b"lost"), Some(unknown)))).await.unwrap();
        let to = SocketAddress::from(remote.local_addr().unwrap());
        client.sender.send(Message::data(owner, Reference::NULL, link.id(), DataMessage::new(Bytes::from_static(b"found"), Some(to)))).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), remote.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"found");

        let stats = manager.close(&link.id()).await.unwrap();
        assert_eq!(stats.bytes_sent, 5);
    }

    #[tokio::test]
    async fn test_restricted_port() {
        let mut config = ProxyConfig::default();
        config.restricted_ports.insert(25);
        let manager = manager(config);

        let err = manager.create_link(Reference::new_random(), &tcp_info(SocketAddr::from_str("127.0.0.1:25").unwrap())).await.err().unwrap();
        assert_eq!(socket_error_of(&err), SocketError::Permission);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = manager(ProxyConfig::default()).create_link(Reference::new_random(), &tcp_info(addr)).await.err().unwrap();
        assert_eq!(socket_error_of(&err), SocketError::Refused);
    }

    #[tokio::test]
    async fn test_options() {
        let manager = manager(ProxyConfig::default());
        let mut info = SocketInfo::tcp();
        info.flags = SocketFlags::PASSIVE;
        info.address = SocketAddress::from_str("127.0.0.1:0").unwrap();
        info.options.insert(SocketOption::Reuseaddr, Property::new(SocketOption::Reuseaddr, 1));
        let link = manager.create_link(Reference::new_random(), &info).await.unwrap();

        assert_eq!(manager.get_option(&link.id(), SocketOption::Reuseaddr).unwrap().as_u64(), Some(1));

        manager.set_option(&link.id(), &Property::new(SocketOption::PropsTimeout, 1000)).unwrap();
        assert_eq!(link.idle_timeout(), Duration::from_secs(30));
        manager.set_option(&link.id(), &Property::new(SocketOption::PropsTimeout, 60_000)).unwrap();
        assert_eq!(manager.get_option(&link.id(), SocketOption::PropsTimeout).unwrap().as_u64(), Some(60_000));

        let err = manager.set_option(&link.id(), &Property::new(SocketOption::Linger, 1)).err().unwrap();
        assert_eq!(socket_error_of(&err), SocketError::NotSupported);
        let err = manager.get_option(&Reference::new_random(), SocketOption::Linger).err().unwrap();
        assert_eq!(socket_error_of(&err), SocketError::NotFound);
    }

    #[tokio::test]
    async fn test_passive_link_accepts_connection() {
        let manager = manager(ProxyConfig::default());
        let mut info = SocketInfo::tcp();
        info.flags = SocketFlags::PASSIVE;
        info.address = SocketAddress::from_str("127.0.0.1:0").unwrap();
        let link = manager.create_link(Reference::new_random(), &info).await.unwrap();

        let (link_side, mut client) = stream_pair();
        manager.open(&link.id(), link_side).await.unwrap();

        let listening = link.local_address().to_socket_addr().unwrap();
        let mut remote = TcpStream::connect(listening).await.unwrap();
        remote.write_all(b"hi").await.unwrap();
        match client.receiver.recv().await.unwrap().content {
            MessageContent::Data(d) => assert_eq!(d.payload.as_ref(), b"hi"),
            other => panic!("{:?}", other),
        }

        let err = manager.open(&link.id(), stream_pair().0).await.err().unwrap();
        assert_eq!(socket_error_of(&err), SocketError::BadState);
        manager.close(&link.id()).await.unwrap();
    }
}
