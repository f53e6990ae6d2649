use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::address::SocketAddress;
use crate::model::name_record::NameRecord;
use crate::model::reference::Reference;
use crate::protocol::content::{MessageContent, PingRequest};
use crate::protocol::message::Message;
use crate::provider::ControlChannel;

/// Liveness check of a candidate proxy before a link RPC is spent on it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Prober: Debug + Send + Sync + 'static {
    /// `true` if the proxy reported the address as reachable. Probe failures are not errors,
    ///  they only take the candidate out of consideration.
    async fn probe(&self, proxy: &NameRecord, address: &SocketAddress, ct: &CancellationToken) -> bool;
}

/// Asks the proxy itself to resolve and probe the destination with a 'ping' request
#[derive(Debug)]
pub struct PingProber {
    source: Reference,
    control_channel: Arc<dyn ControlChannel>,
    timeout: Duration,
}

impl PingProber {
    pub fn new(source: Reference, control_channel: Arc<dyn ControlChannel>, timeout: Duration) -> PingProber {
        PingProber {
            source,
            control_channel,
            timeout,
        }
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, proxy: &NameRecord, address: &SocketAddress, ct: &CancellationToken) -> bool {
        let request = Message::request(self.source, proxy.address, Reference::NULL, MessageContent::PingRequest(PingRequest {
            address: address.clone(),
        }));

        match self.control_channel.call(proxy, request, self.timeout, ct).await {
            Ok(response) if response.error == 0 => {
                if let MessageContent::PingResponse(ping) = &response.content {
                    debug!("proxy {} reaches {} in {}ms", proxy.name, ping.address, ping.time_ms);
                }
                true
            }
            Ok(response) => {
                debug!("proxy {} cannot reach {}: {}", proxy.name, address, response.socket_error());
                false
            }
            Err(e) => {
                debug!("probe through proxy {} failed: {}", proxy.name, e);
                false
            }
        }
    }
}
