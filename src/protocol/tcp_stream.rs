//! Data plane streams over plain TCP: the client side listens on an ephemeral port and
//!  advertises it as the connection string, the proxy connects to it when the link is opened.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{SocketError, SocketException};
use crate::model::name_record::NameRecord;
use crate::model::reference::Reference;
use crate::protocol::framed::spawn_framed;
use crate::provider::{CodecId, Connection, MessageStream, StreamService};

#[derive(Debug)]
pub struct TcpStreamService {
    bind_ip: IpAddr,
    capacity: usize,
    max_buffer_size: usize,
}

impl TcpStreamService {
    /// `bind_ip` must be reachable from the proxies, `capacity` bounds the framed stream's
    ///  queues in both directions
    pub fn new(bind_ip: IpAddr, capacity: usize, max_buffer_size: usize) -> TcpStreamService {
        TcpStreamService {
            bind_ip,
            capacity,
            max_buffer_size,
        }
    }
}

#[async_trait]
impl StreamService for TcpStreamService {
    async fn create_connection(&self, stream_id: Reference, _remote_id: Reference, proxy: &NameRecord, encoding: CodecId) -> anyhow::Result<Arc<dyn Connection>> {
        if encoding != CodecId::Mpack {
            return Err(SocketException::new(SocketError::NotSupported, format!("codec {:?}", encoding)).into());
        }

        let listener = TcpListener::bind(SocketAddr::new(self.bind_ip, 0)).await?;
        let local_addr = listener.local_addr()?;
        debug!("stream {} for proxy {} listens on {}", stream_id, proxy.name, local_addr);

        Ok(Arc::new(TcpConnection {
            stream_id,
            local_addr,
            capacity: self.capacity,
            max_buffer_size: self.max_buffer_size,
            listener: Mutex::new(Some(listener)),
        }))
    }
}

#[derive(Debug)]
pub struct TcpConnection {
    stream_id: Reference,
    local_addr: SocketAddr,
    capacity: usize,
    max_buffer_size: usize,
    listener: Mutex<Option<TcpListener>>,
}

#[async_trait]
impl Connection for TcpConnection {
    fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    fn connection_string(&self) -> String {
        self.local_addr.to_string()
    }

    fn is_polled(&self) -> bool {
        false
    }

    /// Waits for the proxy to connect. The listener is closed once the connection is accepted.
    async fn open(&self, ct: &CancellationToken) -> anyhow::Result<MessageStream> {
        let listener = match self.listener.lock().await.take() {
            Some(l) => l,
            None => return Err(SocketException::new(SocketError::BadState, format!("stream {} was opened before", self.stream_id)).into()),
        };

        let (tcp, peer) = select! {
            r = listener.accept() => r?,
            _ = ct.cancelled() => return Err(SocketException::new(SocketError::Aborted, "open was cancelled").into()),
        };
        tcp.set_nodelay(true)?;
        debug!("stream {} accepted connection from {}", self.stream_id, peer);
        Ok(spawn_framed(tcp, self.capacity))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.listener.lock().await.take();
        Ok(())
    }
}
