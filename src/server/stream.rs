use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{SocketError, SocketException};
use crate::model::reference::Reference;
use crate::protocol::content::OpenRequest;
use crate::protocol::framed::spawn_framed;
use crate::provider::{CodecId, MessageStream};
use crate::server::StreamConnector;

/// Connects to streams offered by [crate::protocol::tcp_stream::TcpStreamService]
#[derive(Debug)]
pub struct TcpStreamConnector {
    capacity: usize,
}

impl TcpStreamConnector {
    pub fn new(capacity: usize) -> TcpStreamConnector {
        TcpStreamConnector { capacity }
    }
}

#[async_trait]
impl StreamConnector for TcpStreamConnector {
    async fn connect(&self, link_id: Reference, request: &OpenRequest) -> anyhow::Result<MessageStream> {
        if request.encoding != i32::from(CodecId::Mpack) {
            return Err(SocketException::new(SocketError::NotSupported, format!("encoding {}", request.encoding)).into());
        }
        let addr: SocketAddr = request.connection_string.parse()
            .map_err(|_| SocketException::new(SocketError::Arg, format!("invalid connection string {:?}", request.connection_string)))?;

        let tcp = TcpStream::connect(addr).await
            .map_err(|e| SocketException::new(SocketError::Refused, format!("stream {} at {}: {}", request.stream_id, addr, e)))?;
        tcp.set_nodelay(true)?;
        debug!("link {} connected to stream {} at {}", link_id, request.stream_id, addr);
        Ok(spawn_framed(tcp, self.capacity))
    }
}
