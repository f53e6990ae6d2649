use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::config::ProxyConfig;
use crate::error::{socket_error_of, SocketError, SocketException};
use crate::model::name_record::NameRecord;
use crate::protocol::content::{LinkResponse, MessageContent, PingRequest, PingResponse, LINK_REQUEST_VERSION};
use crate::protocol::message::Message;
use crate::provider::ControlChannel;
use crate::server::link_manager::LinkManager;
use crate::server::resolver::Resolver;
use crate::server::StreamConnector;

/// Answers the control requests addressed to one proxy
#[derive(Debug)]
pub struct ControlHandler {
    resolver: Arc<dyn Resolver>,
    links: Arc<LinkManager>,
    connector: Arc<dyn StreamConnector>,
}

impl ControlHandler {
    pub fn new(config: Arc<ProxyConfig>, resolver: Arc<dyn Resolver>, connector: Arc<dyn StreamConnector>) -> ControlHandler {
        ControlHandler {
            resolver: resolver.clone(),
            links: Arc::new(LinkManager::new(config, resolver)),
            connector,
        }
    }

    pub fn links(&self) -> &Arc<LinkManager> {
        &self.links
    }

    /// Always produces a response. Failures are reported through the response's error code,
    ///  with an empty payload of the matching response type.
    #[instrument(skip_all, fields(kind = request.content.kind(), seq = request.sequence_id))]
    pub async fn handle(&self, request: Message) -> Message {
        trace!("handling request from {}", request.source);
        match self.dispatch(&request).await {
            Ok(content) => Message::response_to(&request, content, SocketError::Success),
            Err(e) => {
                let code = socket_error_of(&e);
                debug!("request failed with {}: {:#}", code, e);
                Message::response_to(&request, request.content.empty_response(), code)
            }
        }
    }

    async fn dispatch(&self, request: &Message) -> anyhow::Result<MessageContent> {
        match &request.content {
            MessageContent::PingRequest(ping) => self.ping(ping).await,
            MessageContent::LinkRequest(link) => {
                if !request.target.is_null() {
                    return Err(SocketException::new(SocketError::Arg, format!("link request must not target {}", request.target)).into());
                }
                if link.version != LINK_REQUEST_VERSION {
                    return Err(SocketException::new(SocketError::NotSupported, format!("link request version {}", link.version)).into());
                }
                let created = self.links.create_link(request.source, &link.properties).await?;
                Ok(MessageContent::LinkResponse(LinkResponse {
                    link_id: created.id(),
                    local_address: created.local_address().clone(),
                    peer_address: created.peer_address().clone(),
                    transport_caps: 0,
                }))
            }
            MessageContent::OpenRequest(open) => {
                self.links.get(&request.target)?;
                let stream = self.connector.connect(request.target, open).await?;
                self.links.open(&request.target, stream).await?;
                Ok(MessageContent::OpenResponse)
            }
            MessageContent::SetOptRequest(property) => {
                self.links.set_option(&request.target, property)?;
                Ok(MessageContent::SetOptResponse)
            }
            MessageContent::GetOptRequest(option) => {
                Ok(MessageContent::GetOptResponse(self.links.get_option(&request.target, *option)?))
            }
            MessageContent::CloseRequest => {
                let stats = self.links.close(&request.target).await?;
                Ok(MessageContent::CloseResponse(stats.into()))
            }
            other => Err(SocketException::new(SocketError::NotSupported, format!("{} on the control channel", other.kind())).into()),
        }
    }

    async fn ping(&self, ping: &PingRequest) -> anyhow::Result<MessageContent> {
        let started = Instant::now();
        let endpoint = match self.resolver.probe(&ping.address).await {
            Some(endpoint) => endpoint,
            None => return Err(SocketException::new(SocketError::NoHost, format!("{} is not reachable", ping.address)).into()),
        };
        let physical_address = match endpoint.ip() {
            std::net::IpAddr::V4(ip) => Bytes::copy_from_slice(&ip.octets()),
            std::net::IpAddr::V6(ip) => Bytes::copy_from_slice(&ip.octets()),
        };

        Ok(MessageContent::PingResponse(PingResponse {
            address: ping.address.clone(),
            physical_address,
            time_ms: started.elapsed().as_millis().min(u32::MAX as u128) as u32,
        }))
    }
}

/// Lets a client talk to a proxy that runs in the same process
#[async_trait]
impl ControlChannel for ControlHandler {
    async fn call(&self, proxy: &NameRecord, request: Message, timeout: Duration, ct: &CancellationToken) -> anyhow::Result<Message> {
        trace!("in-process call to proxy {}", proxy.name);
        select! {
            r = tokio::time::timeout(timeout, self.handle(request)) => r
                .map_err(|_| anyhow::Error::from(SocketException::new(SocketError::Timeout, "control request timed out"))),
            _ = ct.cancelled() => Err(SocketException::new(SocketError::Aborted, "call was cancelled").into()),
        }
    }
}


#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;

    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::model::address::SocketAddress;
    use crate::model::name_record::NameRecordType;
    use crate::model::reference::Reference;
    use crate::model::socket_info::{Property, SocketInfo, SocketOption};
    use crate::protocol::content::LinkRequest;
    use crate::provider::Provider;
    use crate::server::resolver::{DnsResolver, MockResolver};
    use crate::server::MockStreamConnector;
    use crate::socket::factory::SocketFactory;
    use crate::socket::SocketState;
    use crate::test_util::name_service::InMemoryNameService;
    use crate::test_util::stream_service::LoopbackStreamService;

    fn handler(resolver: Arc<dyn Resolver>, config: ProxyConfig) -> ControlHandler {
        ControlHandler::new(Arc::new(config), resolver, Arc::new(MockStreamConnector::new()))
    }

    fn link_request(target: Reference, version: u8, address: SocketAddr) -> Message {
        let mut info = SocketInfo::tcp();
        info.address = address.into();
        Message::request(Reference::new_random(), Reference::new_random(), target, MessageContent::LinkRequest(LinkRequest {
            version,
            properties: info,
        }))
    }

    /// Accepts connections and echoes everything back
    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = tcp.read(&mut buf).await {
                        if n == 0 || tcp.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[rstest]
    #[case::reachable(true, SocketError::Success)]
    #[case::unreachable(false, SocketError::NoHost)]
    #[tokio::test]
    async fn test_ping(#[case] reachable: bool, #[case] expected: SocketError) {
        let mut resolver = MockResolver::new();
        resolver.expect_probe()
            .returning(move |_| reachable.then(|| SocketAddr::from_str("10.0.0.1:80").unwrap()));
        let handler = handler(Arc::new(resolver), ProxyConfig::default());

        let address = SocketAddress::from_str("10.0.0.1:80").unwrap();
        let request = Message::request(Reference::new_random(), Reference::new_random(), Reference::NULL, MessageContent::PingRequest(PingRequest { address: address.clone() }));
        let response = handler.handle(request.clone()).await;

        assert_eq!(response.socket_error(), expected);
        assert_eq!(response.sequence_id, request.sequence_id);
        assert_eq!(response.target, request.source);
        match response.content {
            MessageContent::PingResponse(ping) => {
                assert_eq!(ping.address, address);
                assert_eq!(ping.physical_address.is_empty(), !reachable);
            }
            other => panic!("{:?}", other),
        }
    }

    #[rstest]
    #[case::targeted(Reference::new_random(), LINK_REQUEST_VERSION, SocketError::Arg)]
    #[case::future_version(Reference::NULL, LINK_REQUEST_VERSION + 1, SocketError::NotSupported)]
    #[tokio::test]
    async fn test_link_request_rejected(#[case] target: Reference, #[case] version: u8, #[case] expected: SocketError) {
        let handler = handler(Arc::new(DnsResolver::new(Duration::from_secs(1))), ProxyConfig::default());
        let response = handler.handle(link_request(target, version, echo_server().await)).await;

        assert_eq!(response.socket_error(), expected);
        assert!(matches!(response.content, MessageContent::LinkResponse(r) if r.link_id.is_null()));
        assert_eq!(handler.links().num_links(), 0);
    }

    #[tokio::test]
    async fn test_restricted_port() {
        let mut config = ProxyConfig::default();
        config.restricted_ports.insert(25);
        let handler = handler(Arc::new(DnsResolver::new(Duration::from_secs(1))), config);

        let response = handler.handle(link_request(Reference::NULL, LINK_REQUEST_VERSION, SocketAddr::from_str("127.0.0.1:25").unwrap())).await;
        assert_eq!(response.socket_error(), SocketError::Permission);
    }

    #[rstest]
    #[case::data(MessageContent::Data(Default::default()))]
    #[case::poll(MessageContent::PollRequest(Default::default()))]
    #[tokio::test]
    async fn test_not_supported(#[case] content: MessageContent) {
        let handler = handler(Arc::new(DnsResolver::new(Duration::from_secs(1))), ProxyConfig::default());
        let response = handler.handle(Message::request(Reference::new_random(), Reference::NULL, Reference::new_random(), content)).await;
        assert_eq!(response.socket_error(), SocketError::NotSupported);
    }

    #[tokio::test]
    async fn test_unknown_link() {
        let handler = handler(Arc::new(DnsResolver::new(Duration::from_secs(1))), ProxyConfig::default());
        for content in [MessageContent::CloseRequest, MessageContent::GetOptRequest(SocketOption::Rcvbuf), MessageContent::SetOptRequest(Property::new(SocketOption::Rcvbuf, 1))] {
            let response = handler.handle(Message::request(Reference::new_random(), Reference::NULL, Reference::new_random(), content)).await;
            assert_eq!(response.socket_error(), SocketError::NotFound);
        }
    }

    #[tokio::test]
    async fn test_socket_through_in_process_proxy() {
        let echo = echo_server().await;

        let config = ProxyConfig {
            throttle_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let streams = Arc::new(LoopbackStreamService::new(0));
        let proxy = Arc::new(ControlHandler::new(Arc::new(config.clone()), Arc::new(DnsResolver::new(Duration::from_secs(1))), streams.clone()));
        let name_service = Arc::new(InMemoryNameService::new());
        name_service.insert(NameRecord::new(NameRecordType::PROXY, "in-process"));

        let factory = SocketFactory::new(Provider::new(name_service, proxy.clone(), streams), config).unwrap();
        let socket = factory.create(SocketInfo::tcp()).unwrap();
        let ct = CancellationToken::new();

        socket.connect(echo.into(), &ct).await.unwrap();
        assert_eq!(socket.state().await, SocketState::Open);
        assert_eq!(proxy.links().num_links(), 1);

        socket.set_socket_option(Property::new(SocketOption::TcpNodelay, 1), &ct).await.unwrap();
        assert_eq!(socket.get_socket_option(SocketOption::TcpNodelay, &ct).await.unwrap().as_u64(), Some(1));

        assert_eq!(socket.send(b"hello proxy", None, &ct).await.unwrap(), 11);
        let mut buf = [0u8; 64];
        let mut received = Vec::new();
        while received.len() < 11 {
            let result = socket.receive(&mut buf, &ct).await.unwrap();
            received.extend_from_slice(&buf[..result.count]);
        }
        assert_eq!(received, b"hello proxy");

        let stats = socket.close(&ct).await.unwrap().unwrap();
        assert_eq!(stats.bytes_sent, 11);
        assert_eq!(stats.bytes_received, 11);
        assert_eq!(proxy.links().num_links(), 0);
    }
}
