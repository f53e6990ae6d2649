use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ProxyConfig;
use crate::link::stats::ProxyLinkStats;
use crate::model::address::SocketAddress;
use crate::model::reference::Reference;
use crate::model::socket_info::{Property, SocketFlags, SocketInfo, SocketOption};
use crate::provider::Provider;
use crate::socket::{not_supported, LinkMap, ProxySocket, ReceiveResult, SocketCore, SocketState};

/// A passive stream socket: it is bound to an address on a proxy and listens there. Listening
///  links directly to the proxy for the bound address, there is no candidate search.
#[derive(Debug)]
pub struct TcpServerSocket {
    core: SocketCore,
}

impl TcpServerSocket {
    pub(crate) fn new(info: SocketInfo, provider: Provider, config: Arc<ProxyConfig>, links: Arc<LinkMap>) -> TcpServerSocket {
        TcpServerSocket {
            core: SocketCore::new(info, provider, config, links),
        }
    }
}

#[async_trait]
impl ProxySocket for TcpServerSocket {
    fn id(&self) -> Reference {
        self.core.id
    }

    async fn state(&self) -> SocketState {
        self.core.state().await
    }

    async fn bind(&self, address: SocketAddress, _ct: &CancellationToken) -> anyhow::Result<()> {
        self.core.transition(&[SocketState::Unbound], SocketState::Bound, "bind").await?;
        let local = address.local().clone();
        self.core.update_info(|info| info.address = local).await;
        Ok(())
    }

    async fn connect(&self, _address: SocketAddress, _ct: &CancellationToken) -> anyhow::Result<()> {
        Err(not_supported("connect", "stream server"))
    }

    async fn listen(&self, ct: &CancellationToken) -> anyhow::Result<()> {
        self.core.transition(&[SocketState::Bound], SocketState::Connecting, "listen").await?;
        self.core.update_info(|info| info.flags |= SocketFlags::PASSIVE).await;

        let address = self.core.info().await.address;
        match self.core.link_directly(&address, ct).await {
            Ok(link) => {
                info!("listening on {} through proxy {}", address, link.proxy().name);
                self.core.attach(link, SocketState::Listening).await;
                Ok(())
            }
            Err(e) => {
                self.core.set_state(SocketState::Bound).await;
                Err(e)
            }
        }
    }

    async fn send(&self, _buf: &[u8], _address: Option<SocketAddress>, _ct: &CancellationToken) -> anyhow::Result<usize> {
        Err(not_supported("send", "stream server"))
    }

    async fn receive(&self, _buf: &mut [u8], _ct: &CancellationToken) -> anyhow::Result<ReceiveResult> {
        Err(not_supported("receive", "stream server"))
    }

    async fn set_socket_option(&self, property: Property, ct: &CancellationToken) -> anyhow::Result<()> {
        self.core.set_socket_option(property, ct).await
    }

    async fn get_socket_option(&self, option: SocketOption, ct: &CancellationToken) -> anyhow::Result<Property> {
        self.core.get_socket_option(option, ct).await
    }

    async fn close(&self, ct: &CancellationToken) -> anyhow::Result<Option<ProxyLinkStats>> {
        self.core.close(ct).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{socket_error_of, SocketError};
    use crate::protocol::content::MessageContent;
    use crate::socket::tests::Harness;

    fn server(h: &Harness) -> TcpServerSocket {
        let mut info = SocketInfo::tcp();
        info.flags = SocketFlags::PASSIVE;
        TcpServerSocket::new(info, h.provider.clone(), Arc::new(ProxyConfig::default()), h.links.clone())
    }

    #[tokio::test]
    async fn test_bind_and_listen() {
        let h = Harness::new(0);
        let proxy = h.add_proxy("edge");
        h.add_proxy("other");
        let socket = server(&h);
        let ct = CancellationToken::new();

        let bound = SocketAddress::bound(SocketAddress::proxy_name("edge", 8080), SocketAddress::Any);
        socket.bind(bound, &ct).await.unwrap();
        socket.listen(&ct).await.unwrap();
        assert_eq!(socket.state().await, SocketState::Listening);

        let link = h.links.get(&socket.id()).unwrap();
        assert_eq!(link.proxy().address, proxy.address);

        let link_request = h.control.requests().into_iter()
            .find_map(|r| match r.content {
                MessageContent::LinkRequest(l) => Some(l),
                _ => None,
            })
            .unwrap();
        assert!(link_request.properties.is_passive());
        assert_eq!(link_request.properties.address, SocketAddress::proxy_name("edge", 8080));
    }

    #[tokio::test]
    async fn test_listen_requires_bind() {
        let h = Harness::new(0);
        let socket = server(&h);
        let err = socket.listen(&CancellationToken::new()).await.err().unwrap();
        assert_eq!(socket_error_of(&err), SocketError::BadState);
    }

    #[tokio::test]
    async fn test_listen_without_proxy() {
        let h = Harness::new(0);
        let socket = server(&h);
        let ct = CancellationToken::new();
        socket.bind(SocketAddress::proxy_name("edge", 8080), &ct).await.unwrap();
        assert!(socket.listen(&ct).await.is_err());
        assert_eq!(socket.state().await, SocketState::Bound);
    }

    #[tokio::test]
    async fn test_illegal_operations() {
        let h = Harness::new(0);
        let socket = server(&h);
        let ct = CancellationToken::new();
        let mut buf = [0u8; 1];
        assert_eq!(socket_error_of(&socket.connect(SocketAddress::Any, &ct).await.err().unwrap()), SocketError::NotSupported);
        assert_eq!(socket_error_of(&socket.send(b"x", None, &ct).await.err().unwrap()), SocketError::NotSupported);
        assert_eq!(socket_error_of(&socket.receive(&mut buf, &ct).await.err().unwrap()), SocketError::NotSupported);
    }
}
