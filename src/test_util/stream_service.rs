use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{SocketError, SocketException};
use crate::model::name_record::NameRecord;
use crate::model::reference::Reference;
use crate::protocol::content::OpenRequest;
use crate::provider::{CodecId, Connection, MessageStream, StreamService};
use crate::server::StreamConnector;

const LOOPBACK_CAPACITY: usize = 16;

type Peers = Arc<Mutex<FxHashMap<Reference, MessageStream>>>;

/// Stream connections that end inside the process: creating a connection creates a pair of
///  channels. The far end is kept under the link's remote id until somebody picks it up with
///  [LoopbackStreamService::take_peer].
#[derive(Debug, Default)]
pub struct LoopbackStreamService {
    max_buffer_size: usize,
    peers: Peers,
}

impl LoopbackStreamService {
    /// `max_buffer_size` 0 means unbounded
    pub fn new(max_buffer_size: usize) -> LoopbackStreamService {
        LoopbackStreamService {
            max_buffer_size,
            peers: Default::default(),
        }
    }

    pub async fn take_peer(&self, remote_id: &Reference) -> Option<MessageStream> {
        self.peers.lock().await
            .remove(remote_id)
    }
}

#[async_trait]
impl StreamService for LoopbackStreamService {
    async fn create_connection(&self, stream_id: Reference, remote_id: Reference, _proxy: &NameRecord, encoding: CodecId) -> anyhow::Result<Arc<dyn Connection>> {
        if encoding != CodecId::Mpack {
            return Err(SocketException::new(SocketError::NotSupported, format!("codec {:?}", encoding)).into());
        }
        let (to_peer, from_link) = mpsc::channel(LOOPBACK_CAPACITY);
        let (to_link, from_peer) = mpsc::channel(LOOPBACK_CAPACITY);
        self.peers.lock().await
            .insert(remote_id, MessageStream { sender: to_link, receiver: from_link });

        Ok(Arc::new(LoopbackConnection {
            stream_id,
            remote_id,
            max_buffer_size: self.max_buffer_size,
            local: Mutex::new(Some(MessageStream { sender: to_peer, receiver: from_peer })),
            peers: self.peers.clone(),
        }))
    }
}

/// The proxy end: picks up the stream that was created for the link
#[async_trait]
impl StreamConnector for LoopbackStreamService {
    async fn connect(&self, link_id: Reference, request: &OpenRequest) -> anyhow::Result<MessageStream> {
        self.take_peer(&link_id).await
            .ok_or_else(|| SocketException::new(SocketError::NotFound, format!("no loopback stream {} for link {}", request.stream_id, link_id)).into())
    }
}

#[derive(Debug)]
pub struct LoopbackConnection {
    stream_id: Reference,
    remote_id: Reference,
    max_buffer_size: usize,
    local: Mutex<Option<MessageStream>>,
    peers: Peers,
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    fn connection_string(&self) -> String {
        format!("loopback://{}", self.stream_id)
    }

    fn is_polled(&self) -> bool {
        false
    }

    async fn open(&self, ct: &CancellationToken) -> anyhow::Result<MessageStream> {
        if ct.is_cancelled() {
            return Err(SocketException::new(SocketError::Aborted, "open was cancelled").into());
        }

        match self.local.lock().await.take() {
            Some(stream) => {
                debug!("opened loopback stream {}", self.stream_id);
                Ok(stream)
            }
            None => Err(SocketException::new(SocketError::BadState, "loopback stream was opened before").into()),
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.peers.lock().await
            .remove(&self.remote_id);
        Ok(())
    }
}
