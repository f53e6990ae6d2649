use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::{SocketError, SocketException};
use crate::link::proxy_link::ProxyLink;
use crate::model::reference::Reference;
use crate::model::socket_info::{SocketInfo, SocketType};
use crate::provider::Provider;
use crate::socket::tcp_client::TcpClientSocket;
use crate::socket::tcp_server::TcpServerSocket;
use crate::socket::udp::UdpSocket;
use crate::socket::{LinkMap, ProxySocket};

/// Creates proxy sockets and keeps track of their open links
pub struct SocketFactory {
    provider: Provider,
    config: Arc<ProxyConfig>,
    links: Arc<LinkMap>,
}

impl SocketFactory {
    pub fn new(provider: Provider, config: ProxyConfig) -> anyhow::Result<SocketFactory> {
        config.validate()?;
        Ok(SocketFactory {
            provider,
            config: Arc::new(config),
            links: Default::default(),
        })
    }

    pub fn create(&self, info: SocketInfo) -> anyhow::Result<Arc<dyn ProxySocket>> {
        let provider = self.provider.clone();
        let config = self.config.clone();
        let links = self.links.clone();

        let socket: Arc<dyn ProxySocket> = match info.socket_type {
            SocketType::Stream if info.is_passive() => Arc::new(TcpServerSocket::new(info, provider, config, links)),
            SocketType::Stream => Arc::new(TcpClientSocket::new(info, provider, config, links)),
            SocketType::Dgram => Arc::new(UdpSocket::new(info, provider, config, links)),
            other => return Err(SocketException::new(SocketError::NotSupported, format!("socket type {:?}", other)).into()),
        };
        debug!("created socket {}", socket.id());
        Ok(socket)
    }

    /// Snapshot of all open links by socket id
    pub fn links(&self) -> Arc<FxHashMap<Reference, Arc<ProxyLink>>> {
        self.links.snapshot()
    }
}
