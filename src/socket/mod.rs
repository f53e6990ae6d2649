//! Proxy sockets: the application facing side of the socket layer. Each socket is a small state
//!  machine that owns at most one [ProxyLink] at a time.

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::{SocketError, SocketException};
use crate::link::proxy_link::{link_to_proxy, LinkAttempt, ProxyLink};
use crate::link::registry::LinkRegistry;
use crate::link::stats::ProxyLinkStats;
use crate::model::address::SocketAddress;
use crate::model::name_record::{NameQuery, NameRecordType};
use crate::model::reference::Reference;
use crate::model::socket_info::{Property, SocketInfo, SocketOption};
use crate::provider::Provider;

pub mod factory;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketState {
    Unbound,
    Bound,
    Connecting,
    Listening,
    Open,
    Closed,
}

impl Display for SocketState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceiveResult {
    pub count: usize,
    /// where the data came from, if the socket knows
    pub address: Option<SocketAddress>,
}

#[async_trait]
pub trait ProxySocket: Debug + Send + Sync + 'static {
    fn id(&self) -> Reference;

    async fn state(&self) -> SocketState;

    async fn bind(&self, address: SocketAddress, ct: &CancellationToken) -> anyhow::Result<()>;

    async fn connect(&self, address: SocketAddress, ct: &CancellationToken) -> anyhow::Result<()>;

    async fn listen(&self, ct: &CancellationToken) -> anyhow::Result<()>;

    /// Returns the number of bytes that were accepted
    async fn send(&self, buf: &[u8], address: Option<SocketAddress>, ct: &CancellationToken) -> anyhow::Result<usize>;

    async fn receive(&self, buf: &mut [u8], ct: &CancellationToken) -> anyhow::Result<ReceiveResult>;

    /// Cached locally until the socket has a link, forwarded to the proxy afterwards
    async fn set_socket_option(&self, property: Property, ct: &CancellationToken) -> anyhow::Result<()>;

    async fn get_socket_option(&self, option: SocketOption, ct: &CancellationToken) -> anyhow::Result<Property>;

    /// Releases the link. Returns the link's statistics the first time, `None` afterwards.
    async fn close(&self, ct: &CancellationToken) -> anyhow::Result<Option<ProxyLinkStats>>;
}

pub type LinkMap = LinkRegistry<Reference, Arc<ProxyLink>>;

fn not_supported(operation: &str, socket_kind: &str) -> anyhow::Error {
    SocketException::new(SocketError::NotSupported, format!("{} is not supported for {} sockets", operation, socket_kind)).into()
}

struct CoreState {
    state: SocketState,
    info: SocketInfo,
    link: Option<Arc<ProxyLink>>,
}

/// State and link handling that all socket variants share
pub(crate) struct SocketCore {
    id: Reference,
    provider: Provider,
    config: Arc<ProxyConfig>,
    links: Arc<LinkMap>,
    inner: Mutex<CoreState>,
}

impl Debug for SocketCore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Socket{{{}}}", self.id)
    }
}

impl SocketCore {
    fn new(info: SocketInfo, provider: Provider, config: Arc<ProxyConfig>, links: Arc<LinkMap>) -> SocketCore {
        SocketCore {
            id: Reference::new_random(),
            provider,
            config,
            links,
            inner: Mutex::new(CoreState {
                state: SocketState::Unbound,
                info,
                link: None,
            }),
        }
    }

    async fn state(&self) -> SocketState {
        self.inner.lock().await.state
    }

    async fn info(&self) -> SocketInfo {
        self.inner.lock().await.info.clone()
    }

    /// Moves to `to` if the current state is one of `from`, returning the previous state
    async fn transition(&self, from: &[SocketState], to: SocketState, operation: &str) -> anyhow::Result<SocketState> {
        let mut inner = self.inner.lock().await;
        if !from.contains(&inner.state) {
            return Err(SocketException::new(SocketError::BadState, format!("cannot {} in state {}", operation, inner.state)).into());
        }
        let previous = inner.state;
        inner.state = to;
        Ok(previous)
    }

    async fn set_state(&self, state: SocketState) {
        self.inner.lock().await.state = state;
    }

    async fn update_info(&self, f: impl FnOnce(&mut SocketInfo)) {
        f(&mut self.inner.lock().await.info);
    }

    async fn link(&self) -> anyhow::Result<Arc<ProxyLink>> {
        let inner = self.inner.lock().await;
        match (&inner.link, inner.state) {
            (Some(link), SocketState::Open | SocketState::Listening) => Ok(link.clone()),
            (_, SocketState::Closed) => Err(SocketException::new(SocketError::Closed, "socket is closed").into()),
            (_, state) => Err(SocketException::new(SocketError::BadState, format!("socket has no link in state {}", state)).into()),
        }
    }

    async fn attach(&self, link: Arc<ProxyLink>, state: SocketState) {
        self.links.insert(self.id, link.clone());
        let mut inner = self.inner.lock().await;
        inner.link = Some(link);
        inner.state = state;
    }

    /// Links to the first proxy matching `address` that accepts, without probing or retrying
    async fn link_directly(&self, address: &SocketAddress, ct: &CancellationToken) -> anyhow::Result<Arc<ProxyLink>> {
        let info = self.info().await;
        let query = NameQuery::MatchesAddress { address: address.clone(), record_type: NameRecordType::PROXY };
        let proxies = self.provider.name_service.query(&query).await
            .map_err(|e| SocketException::from_error(&format!("no proxy for {}", address), &e))?;

        let mut last_error = None;
        for proxy in proxies {
            match link_to_proxy(self.id, &info, &proxy, &self.provider, &self.config, ct).await {
                Ok(LinkAttempt::Linked(link)) => return Ok(link),
                Ok(LinkAttempt::Cancelled) => return Err(SocketException::new(SocketError::Aborted, "linking was cancelled").into()),
                Err(e) => {
                    debug!("proxy {} did not link: {}", proxy.name, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| SocketException::new(SocketError::NoHost, format!("no proxy for {}", address)).into()))
    }

    async fn set_socket_option(&self, property: Property, ct: &CancellationToken) -> anyhow::Result<()> {
        let link = {
            let mut inner = self.inner.lock().await;
            match &inner.link {
                Some(link) => link.clone(),
                None => {
                    inner.info.options.insert(property.option, property);
                    return Ok(());
                }
            }
        };
        link.set_socket_option(property, ct).await
    }

    async fn get_socket_option(&self, option: SocketOption, ct: &CancellationToken) -> anyhow::Result<Property> {
        let link = {
            let inner = self.inner.lock().await;
            match &inner.link {
                Some(link) => link.clone(),
                None => {
                    return Ok(inner.info.options.get(&option)
                        .copied()
                        .unwrap_or_else(|| Property::new(option, 0)));
                }
            }
        };
        link.get_socket_option(option, ct).await
    }

    async fn close(&self, ct: &CancellationToken) -> anyhow::Result<Option<ProxyLinkStats>> {
        let link = {
            let mut inner = self.inner.lock().await;
            if inner.state == SocketState::Closed {
                return Ok(None);
            }
            inner.state = SocketState::Closed;
            inner.link.take()
        };

        match link {
            Some(link) => {
                self.links.remove(&self.id);
                Ok(Some(link.close(ct).await?))
            }
            None => Ok(None),
        }
    }
}
