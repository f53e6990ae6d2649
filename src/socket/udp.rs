use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::error::{SocketError, SocketException};
use crate::link::stats::ProxyLinkStats;
use crate::model::address::SocketAddress;
use crate::model::reference::Reference;
use crate::model::socket_info::{Property, SocketInfo, SocketOption};
use crate::protocol::content::{DataMessage, MessageContent};
use crate::protocol::message::Message;
use crate::provider::Provider;
use crate::socket::{not_supported, LinkMap, ProxySocket, ReceiveResult, SocketCore, SocketState};

/// A datagram socket. Binding opens the link right away, and every datagram carries its own
///  destination or source address.
#[derive(Debug)]
pub struct UdpSocket {
    core: SocketCore,
}

impl UdpSocket {
    pub(crate) fn new(info: SocketInfo, provider: Provider, config: Arc<ProxyConfig>, links: Arc<LinkMap>) -> UdpSocket {
        UdpSocket {
            core: SocketCore::new(info, provider, config, links),
        }
    }
}

#[async_trait]
impl ProxySocket for UdpSocket {
    fn id(&self) -> Reference {
        self.core.id
    }

    async fn state(&self) -> SocketState {
        self.core.state().await
    }

    async fn bind(&self, address: SocketAddress, ct: &CancellationToken) -> anyhow::Result<()> {
        self.core.transition(&[SocketState::Unbound], SocketState::Bound, "bind").await?;
        let local = address.local().clone();
        self.core.update_info(|info| info.address = local.clone()).await;

        match self.core.link_directly(&local, ct).await {
            Ok(link) => {
                info!("datagram socket bound to {} through proxy {}", local, link.proxy().name);
                self.core.attach(link, SocketState::Open).await;
                Ok(())
            }
            Err(e) => {
                self.core.set_state(SocketState::Unbound).await;
                Err(e)
            }
        }
    }

    async fn connect(&self, _address: SocketAddress, _ct: &CancellationToken) -> anyhow::Result<()> {
        Err(not_supported("connect", "datagram"))
    }

    async fn listen(&self, _ct: &CancellationToken) -> anyhow::Result<()> {
        Err(not_supported("listen", "datagram"))
    }

    async fn send(&self, buf: &[u8], address: Option<SocketAddress>, ct: &CancellationToken) -> anyhow::Result<usize> {
        let address = match address {
            Some(a) => a,
            None => return Err(SocketException::new(SocketError::NoAddress, "a datagram needs a destination").into()),
        };
        let link = self.core.link().await?;
        let data = DataMessage::new(Bytes::copy_from_slice(buf), Some(address));
        link.send(Message::data(self.core.id, link.proxy().address, link.remote_id(), data), ct).await?;
        Ok(buf.len())
    }

    /// Copies at most `buf.len()` bytes of the next datagram; the rest of it is discarded
    async fn receive(&self, buf: &mut [u8], ct: &CancellationToken) -> anyhow::Result<ReceiveResult> {
        let link = self.core.link().await?;
        let message = link.receive(ct).await?;
        let data = match message.content {
            MessageContent::Data(data) => data,
            other => return Err(SocketException::new(SocketError::InvalidFormat, format!("unexpected {} on data plane", other.kind())).into()),
        };

        let count = buf.len().min(data.payload.len());
        if count < data.payload.len() {
            debug!("truncating datagram of {} bytes to {}", data.payload.len(), count);
        }
        buf[..count].copy_from_slice(&data.payload[..count]);
        Ok(ReceiveResult {
            count,
            address: data.address,
        })
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
