//! The proxy side: executes control requests against real network sockets and pumps payload
//!  between those sockets and the links' message streams.

use std::fmt::Debug;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::model::reference::Reference;
use crate::protocol::content::OpenRequest;
use crate::provider::MessageStream;

pub mod controller;
pub mod link_manager;
pub mod resolver;
pub mod stream;

/// Connects to the client end of a link's data plane, based on the 'open' request's connection
///  string
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamConnector: Debug + Send + Sync + 'static {
    async fn connect(&self, link_id: Reference, request: &OpenRequest) -> anyhow::Result<MessageStream>;
}
