//! Contracts of the collaborators that the socket layer consumes: the name service (registry),
//!  the control channel for RPCs to proxies, and the stream service that provides data plane
//!  connections. They are bundled in a [Provider] which is passed explicitly to sockets and
//!  the link establishment pipeline.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::model::name_record::{NameQuery, NameRecord, NameRecordType};
use crate::model::reference::Reference;
use crate::protocol::message::Message;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LookupOutcome {
    Found(NameRecord),
    NotFound,
    /// The registry could not answer right now (e.g. a conflict or a stale cache); the caller
    ///  may retry or treat the record as unknown.
    TransientFailure(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UpsertOutcome {
    Stored(NameRecord),
    /// the registry deleted the record instead of storing it
    Removed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NameServiceNotification {
    Added(NameRecord),
    Updated(NameRecord),
    Removed(NameRecord),
    Connected(NameRecord),
    Disconnected(NameRecord),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait NameService: Debug + Send + Sync + 'static {
    /// Connected records matching the query, most recently active first. Fails with
    ///  [crate::error::SocketError::NotFound] if there are none.
    async fn query(&self, query: &NameQuery) -> anyhow::Result<Vec<NameRecord>>;

    async fn lookup(&self, name: &str, record_type: NameRecordType) -> LookupOutcome;

    async fn upsert(&self, record: NameRecord) -> anyhow::Result<UpsertOutcome>;

    fn subscribe(&self) -> broadcast::Receiver<NameServiceNotification>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlChannel: Debug + Send + Sync + 'static {
    /// Sends a request to a proxy and waits for the correlated response. A response carrying an
    ///  error code is returned as a response, not as an error.
    async fn call(&self, proxy: &NameRecord, request: Message, timeout: Duration, ct: &CancellationToken) -> anyhow::Result<Message>;
}


#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum CodecId {
    Mpack = 1,
    Json = 2,
}

/// Both halves of an open data plane stream
#[derive(Debug)]
pub struct MessageStream {
    pub sender: mpsc::Sender<Message>,
    pub receiver: mpsc::Receiver<Message>,
}

/// A data plane connection that was created for a link but not necessarily opened yet
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Debug + Send + Sync + 'static {
    /// 0 means unbounded
    fn max_buffer_size(&self) -> usize;

    /// opaque token that allows the proxy to connect to the other end of this connection
    fn connection_string(&self) -> String;

    fn is_polled(&self) -> bool;

    async fn open(&self, ct: &CancellationToken) -> anyhow::Result<MessageStream>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamService: Debug + Send + Sync + 'static {
    async fn create_connection(&self, stream_id: Reference, remote_id: Reference, proxy: &NameRecord, encoding: CodecId) -> anyhow::Result<Arc<dyn Connection>>;
}


#[derive(Debug, Clone)]
pub struct Provider {
    pub name_service: Arc<dyn NameService>,
    pub control_channel: Arc<dyn ControlChannel>,
    pub stream_service: Arc<dyn StreamService>,
}

impl Provider {
    pub fn new(name_service: Arc<dyn NameService>, control_channel: Arc<dyn ControlChannel>, stream_service: Arc<dyn StreamService>) -> Provider {
        Provider {
            name_service,
            control_channel,
            stream_service,
        }
    }
}
