use std::sync::Arc;

use anyhow::anyhow;
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ProxyConfig;
use crate::error::{check_response, socket_error_of, SocketError, SocketException};
use crate::link::data_plane::DataPlane;
use crate::link::stats::{LinkCounters, ProxyLinkStats};
use crate::model::address::SocketAddress;
use crate::model::name_record::NameRecord;
use crate::model::reference::Reference;
use crate::model::socket_info::{Property, SocketInfo, SocketOption};
use crate::protocol::content::{LinkRequest, MessageContent, OpenRequest, LINK_REQUEST_VERSION};
use crate::protocol::message::Message;
use crate::provider::{CodecId, Connection, Provider};

/// One open tunnel between a local socket and a socket on a proxy. A link owns exactly one data
///  plane, which exists between a successful [ProxyLink::try_complete_open] and
///  [ProxyLink::close].
pub struct ProxyLink {
    socket_id: Reference,
    remote_id: Reference,
    proxy: NameRecord,
    local_address: SocketAddress,
    peer_address: SocketAddress,
    provider: Provider,
    config: Arc<ProxyConfig>,
    counters: Arc<LinkCounters>,
    state: Mutex<LinkState>,
}

#[derive(Default)]
struct LinkState {
    connection: Option<Arc<dyn Connection>>,
    max_buffer_size: usize,
    data_plane: Option<Arc<DataPlane>>,
    close_result: Option<Result<ProxyLinkStats, SocketException>>,
}

impl std::fmt::Debug for ProxyLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProxyLink{{{}@{} via {}}}", self.remote_id, self.peer_address, self.proxy.name)
    }
}

impl ProxyLink {
    pub fn new(socket_id: Reference, proxy: NameRecord, remote_id: Reference, local_address: SocketAddress, peer_address: SocketAddress, provider: Provider, config: Arc<ProxyConfig>) -> ProxyLink {
        ProxyLink {
            socket_id,
            remote_id,
            proxy,
            local_address,
            peer_address,
            provider,
            config,
            counters: Arc::new(LinkCounters::new()),
            state: Default::default(),
        }
    }

    pub fn socket_id(&self) -> Reference {
        self.socket_id
    }

    /// The link id that the proxy assigned
    pub fn remote_id(&self) -> Reference {
        self.remote_id
    }

    pub fn proxy(&self) -> &NameRecord {
        &self.proxy
    }

    pub fn local_address(&self) -> &SocketAddress {
        &self.local_address
    }

    pub fn peer_address(&self) -> &SocketAddress {
        &self.peer_address
    }

    fn request(&self, content: MessageContent) -> Message {
        Message::request(self.socket_id, self.proxy.address, self.remote_id, content)
    }

    /// Creates the stream connection and returns the payload for the proxy's 'open' request
    #[instrument(skip_all, fields(link = %self.remote_id))]
    pub async fn begin_open(&self) -> anyhow::Result<OpenRequest> {
        let stream_id = Reference::new_random();
        let connection = self.provider.stream_service
            .create_connection(stream_id, self.remote_id, &self.proxy, CodecId::Mpack)
            .await?;

        let request = OpenRequest {
            stream_id,
            connection_string: connection.connection_string(),
            stream_type: 0,
            encoding: CodecId::Mpack.into(),
            is_polled: connection.is_polled(),
            max_receive: u32::try_from(connection.max_buffer_size()).unwrap_or(u32::MAX),
        };

        let mut state = self.state.lock().await;
        state.max_buffer_size = connection.max_buffer_size();
        state.connection = Some(connection);
        debug!("created stream connection {}", stream_id);
        Ok(request)
    }

    /// Opens the stream and wires it to a new data plane. Returns `false` if cancelled before the
    ///  stream was open.
    #[instrument(skip_all, fields(link = %self.remote_id))]
    pub async fn try_complete_open(&self, ct: &CancellationToken) -> anyhow::Result<bool> {
        let connection = match &self.state.lock().await.connection {
            Some(c) => c.clone(),
            None => return Err(SocketException::new(SocketError::BadState, "link was not prepared for opening").into()),
        };

        // not holding the state lock, so close can run while the proxy connects
        let stream = select! {
            s = connection.open(ct) => s?,
            _ = ct.cancelled() => {
                debug!("open was cancelled");
                return Ok(false);
            }
        };

        let mut state = self.state.lock().await;
        if state.close_result.is_some() || state.connection.is_none() {
            debug!("link was closed while opening");
            return Err(SocketException::new(SocketError::Closed, "link was closed while opening").into());
        }
        state.data_plane = Some(Arc::new(DataPlane::new(stream, state.max_buffer_size, self.config.link_queue_capacity, self.counters.clone())));
        info!("link to {} via proxy {} is open", self.peer_address, self.proxy.name);
        Ok(true)
    }

    async fn data_plane(&self) -> anyhow::Result<Arc<DataPlane>> {
        self.state.lock().await
            .data_plane
            .clone()
            .ok_or_else(|| SocketException::new(SocketError::Closed, "link is not open").into())
    }

    pub async fn send(&self, message: Message, ct: &CancellationToken) -> anyhow::Result<()> {
        self.data_plane().await?
            .send(message, ct).await
    }

    pub async fn receive(&self, ct: &CancellationToken) -> anyhow::Result<Message> {
        self.data_plane().await?
            .receive(ct).await
    }

    pub async fn set_socket_option(&self, property: Property, ct: &CancellationToken) -> anyhow::Result<()> {
        let response = self.provider.control_channel
            .call(&self.proxy, self.request(MessageContent::SetOptRequest(property)), self.config.option_timeout, ct)
            .await?;
        check_response(&response)
    }

    pub async fn get_socket_option(&self, option: SocketOption, ct: &CancellationToken) -> anyhow::Result<Property> {
        let response = self.provider.control_channel
            .call(&self.proxy, self.request(MessageContent::GetOptRequest(option)), self.config.option_timeout, ct)
            .await?;
        check_response(&response)?;
        match response.content {
            MessageContent::GetOptResponse(p) => Ok(p),
            other => Err(SocketException::new(SocketError::InvalidFormat, format!("unexpected {} for getopt", other.kind())).into()),
        }
    }

    /// Runs 'unlink' on the proxy and terminates the stream concurrently. This fails only if both
    ///  fail; a partial failure is logged because one side may already be gone. Closing a closed
    ///  link returns the outcome of the first close.
    #[instrument(skip_all, fields(link = %self.remote_id))]
    pub async fn close(&self, ct: &CancellationToken) -> anyhow::Result<ProxyLinkStats> {
        let (connection, data_plane) = {
            let mut state = self.state.lock().await;
            if let Some(outcome) = &state.close_result {
                return outcome.clone().map_err(Into::into);
            }
            (state.connection.take(), state.data_plane.take())
        };

        let terminate = async {
            drop(data_plane);
            match connection {
                Some(c) => c.close().await,
                None => Ok(()),
            }
        };

        let (unlink_result, terminate_result) = tokio::join!(self.unlink(ct), terminate);

        let remote_stats = match &unlink_result {
            Ok(stats) => *stats,
            Err(_) => None,
        };
        let teardown = aggregate_teardown(vec![
            ("unlink", unlink_result.map(|_| ())),
            ("terminate stream", terminate_result),
        ]);

        let outcome = match teardown {
            Ok(()) => Ok(remote_stats.unwrap_or_else(|| self.counters.snapshot())),
            Err(e) => Err(SocketException::from_error("close failed", &e)),
        };
        self.state.lock().await.close_result = Some(outcome.clone());
        match &outcome {
            Ok(stats) => info!("link closed: {:?}", stats),
            Err(e) => warn!("closing link failed: {}", e),
        }
        outcome.map_err(Into::into)
    }
}

impl ProxyLink {
    async fn unlink(&self, ct: &CancellationToken) -> anyhow::Result<Option<ProxyLinkStats>> {
        let response = self.provider.control_channel
            .call(&self.proxy, self.request(MessageContent::CloseRequest), self.config.unlink_timeout, ct)
            .await?;
        check_response(&response)?;
        match response.content {
            MessageContent::CloseResponse(c) => Ok(Some(ProxyLinkStats::from(c))),
            _ => Ok(None),
        }
    }
}

/// Teardown of parallel tasks is fatal only if every task failed. The aggregated error carries
///  the first failure's code and all messages.
pub fn aggregate_teardown(results: Vec<(&str, anyhow::Result<()>)>) -> anyhow::Result<()> {
    let num_tasks = results.len();
    let failures = results.into_iter()
        .filter_map(|(name, r)| r.err().map(|e| (name, e)))
        .collect::<Vec<_>>();

    for (name, e) in &failures {
        warn!("{} failed during close: {:#}", name, e);
    }

    if num_tasks == 0 || failures.len() < num_tasks {
        return Ok(());
    }

    let code = socket_error_of(&failures[0].1);
    let message = failures.iter()
        .map(|(name, e)| format!("{}: {:#}", name, e))
        .collect::<Vec<_>>()
        .join("; ");
    Err(SocketException::new(code, format!("close failed - {}", message)).into())
}


/// The result of asking a proxy for a link
pub enum LinkAttempt {
    Linked(Arc<ProxyLink>),
    /// cancelled after or while linking; nothing is left open on the proxy
    Cancelled,
}

/// Runs the full handshake with one proxy: the 'link' RPC, creating the stream connection, the
///  'open' RPC and opening the stream. On failure after the link RPC succeeded, the remote link
///  is closed again.
#[instrument(skip_all, fields(proxy = %proxy.name))]
pub async fn link_to_proxy(socket_id: Reference, info: &SocketInfo, proxy: &NameRecord, provider: &Provider, config: &Arc<ProxyConfig>, ct: &CancellationToken) -> anyhow::Result<LinkAttempt> {
    let request = Message::request(socket_id, proxy.address, Reference::NULL, MessageContent::LinkRequest(LinkRequest {
        version: LINK_REQUEST_VERSION,
        properties: info.clone(),
    }));
    let response = provider.control_channel
        .call(proxy, request, config.option_timeout, ct)
        .await?;
    check_response(&response)?;

    let link_response = match response.content {
        MessageContent::LinkResponse(r) => r,
        other => return Err(anyhow!("proxy answered link request with {}", other.kind())),
    };

    let link = Arc::new(ProxyLink::new(socket_id, proxy.clone(), link_response.link_id, link_response.local_address, link_response.peer_address, provider.clone(), config.clone()));
    debug!("proxy assigned link id {}", link.remote_id());

    match open_link(&link, ct).await {
        Ok(true) => Ok(LinkAttempt::Linked(link)),
        Ok(false) => {
            close_abandoned(&link).await;
            Ok(LinkAttempt::Cancelled)
        }
        Err(e) => {
            close_abandoned(&link).await;
            Err(e)
        }
    }
}

async fn open_link(link: &ProxyLink, ct: &CancellationToken) -> anyhow::Result<bool> {
    let open_request = link.begin_open().await?;
    let response = link.provider.control_channel
        .call(&link.proxy, link.request(MessageContent::OpenRequest(open_request)), link.config.option_timeout, ct)
        .await?;
    check_response(&response)?;
    link.try_complete_open(ct).await
}

async fn close_abandoned(link: &ProxyLink) {
    // the caller's token may be cancelled already
    if let Err(e) = link.close(&CancellationToken::new()).await {
        debug!("closing abandoned link failed: {}", e);
    }
}
