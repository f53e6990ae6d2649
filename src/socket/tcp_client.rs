use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::ProxyConfig;
use crate::connect::pipeline::LinkPipeline;
use crate::connect::prober::PingProber;
use crate::error::{SocketError, SocketException};
use crate::link::stats::ProxyLinkStats;
use crate::model::address::{ProxyName, SocketAddress};
use crate::model::name_record::{NameRecord, NameRecordType};
use crate::model::reference::Reference;
use crate::model::socket_info::{Property, SocketInfo, SocketOption};
use crate::protocol::content::{DataMessage, MessageContent};
use crate::protocol::message::Message;
use crate::provider::{LookupOutcome, Provider};
use crate::socket::{not_supported, LinkMap, ProxySocket, ReceiveResult, SocketCore, SocketState};

/// A stream socket that connects to a host through whichever proxy links first
#[derive(Debug)]
pub struct TcpClientSocket {
    core: SocketCore,
    bound: Mutex<Option<SocketAddress>>,
    /// the part of the last received message that did not fit the caller's buffer
    pending: Mutex<Bytes>,
}

impl TcpClientSocket {
    pub(crate) fn new(info: SocketInfo, provider: Provider, config: Arc<ProxyConfig>, links: Arc<LinkMap>) -> TcpClientSocket {
        TcpClientSocket {
            core: SocketCore::new(info, provider, config, links),
            bound: Default::default(),
            pending: Default::default(),
        }
    }

    /// The host record for a destination. A registry record with a different name than the one
    ///  requested (e.g. found by id) redirects the connect to the registered name.
    async fn resolve_host(&self, address: SocketAddress) -> (NameRecord, SocketAddress) {
        let name = match &address {
            SocketAddress::ProxyName(name) => name.clone(),
            _ => return (NameRecord::ephemeral_host(&address), address),
        };

        match self.core.provider.name_service.lookup(&name.host, NameRecordType::HOST).await {
            LookupOutcome::Found(host) => {
                if host.name.eq_ignore_ascii_case(&name.host) {
                    (host, address)
                }
                else {
                    debug!("{} is registered as {}", name.host, host.name);
                    let mut translated = ProxyName::new(&host.name, name.port);
                    translated.domain = host.domain.clone();
                    (host, SocketAddress::ProxyName(translated))
                }
            }
            LookupOutcome::NotFound => (NameRecord::ephemeral_host(&address), address),
            LookupOutcome::TransientFailure(reason) => {
                warn!("host lookup for {} failed, treating it as unknown: {}", name.host, reason);
                (NameRecord::ephemeral_host(&address), address)
            }
        }
    }
}

#[async_trait]
impl ProxySocket for TcpClientSocket {
    fn id(&self) -> Reference {
        self.core.id
    }

    async fn state(&self) -> SocketState {
        self.core.state().await
    }

    /// Binding a client socket restricts the proxies it connects through
    async fn bind(&self, address: SocketAddress, _ct: &CancellationToken) -> anyhow::Result<()> {
        self.core.transition(&[SocketState::Unbound], SocketState::Bound, "bind").await?;
        *self.bound.lock().await = Some(address.local().clone());
        Ok(())
    }

    #[instrument(skip_all, fields(socket = %self.core.id, address = %address))]
    async fn connect(&self, address: SocketAddress, ct: &CancellationToken) -> anyhow::Result<()> {
        let previous = self.core.transition(&[SocketState::Unbound, SocketState::Bound], SocketState::Connecting, "connect").await?;

        // a bound address names the proxy to go through and the host behind it
        let (bound, address) = match address {
            SocketAddress::Bound { .. } => (Some(address.local().clone()), address.remote().clone()),
            other => (self.bound.lock().await.clone(), other),
        };

        let (host, address) = self.resolve_host(address).await;
        self.core.update_info(|info| info.address = address).await;
        let info = self.core.info().await;

        let prober = PingProber::new(self.core.id, self.core.provider.control_channel.clone(), self.core.config.probe_timeout);
        let pipeline = LinkPipeline::new(self.core.id, info.clone(), self.core.provider.clone(), self.core.config.clone(), Arc::new(prober));

        match pipeline.establish(host, bound, self.core.config.effective_connect_timeout(info.timeout), ct).await {
            Ok(link) => {
                self.core.attach(link, SocketState::Open).await;
                Ok(())
            }
            Err(e) => {
                self.core.set_state(previous).await;
                Err(e)
            }
        }
    }

    async fn listen(&self, _ct: &CancellationToken) -> anyhow::Result<()> {
        Err(not_supported("listen", "stream client"))
    }

    async fn send(&self, buf: &[u8], _address: Option<SocketAddress>, ct: &CancellationToken) -> anyhow::Result<usize> {
        let link = self.core.link().await?;
        let data = DataMessage::new(Bytes::copy_from_slice(buf), None);
        link.send(Message::data(self.core.id, link.proxy().address, link.remote_id(), data), ct).await?;
        Ok(buf.len())
    }

    /// Copies as much of the next message as fits into `buf`, keeping the rest for the next
    ///  call. A zero-length message signals the end of the stream and yields a count of 0.
    async fn receive(&self, buf: &mut [u8], ct: &CancellationToken) -> anyhow::Result<ReceiveResult> {
        let link = self.core.link().await?;
        if buf.is_empty() {
            return Ok(ReceiveResult {
                count: 0,
                address: Some(link.peer_address().clone()),
            });
        }
        let mut pending = self.pending.lock().await;

        if pending.is_empty() {
            let message = link.receive(ct).await?;
            match message.content {
                MessageContent::Data(data) => *pending = data.payload,
                other => return Err(SocketException::new(SocketError::InvalidFormat, format!("unexpected {} on data plane", other.kind())).into()),
            }
        }

        let count = buf.len().min(pending.len());
        pending.copy_to_slice(&mut buf[..count]);
        Ok(ReceiveResult {
            count,
            address: Some(link.peer_address().clone()),
        })
    }

    async fn set_socket_option(&self, property: Property, ct: &CancellationToken) -> anyhow::Result<()> {
        self.core.set_socket_option(property, ct).await
    }

    async fn get_socket_option(&self, option: SocketOption, ct: &CancellationToken) -> anyhow::Result<Property> {
        self.core.get_socket_option(option, ct).await
    }

    async fn close(&self, ct: &CancellationToken) -> anyhow::Result<Option<ProxyLinkStats>> {
        self.pending.lock().await.clear();
        self.core.close(ct).await
    }
}
