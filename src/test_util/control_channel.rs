use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{SocketError, SocketException};
use crate::model::name_record::NameRecord;
use crate::model::reference::Reference;
use crate::model::socket_info::{Property, SocketOption};
use crate::protocol::content::{CloseResponse, LinkResponse, MessageContent, PingResponse};
use crate::protocol::message::Message;
use crate::provider::ControlChannel;

#[derive(Debug, Default)]
struct ScriptState {
    link_calls: FxHashMap<Reference, u32>,
    link_failures: FxHashMap<Reference, u32>,
    options: FxHashMap<(Reference, SocketOption), Property>,
    requests: Vec<Message>,
    open_delay: Option<Duration>,
}

/// A control channel that answers requests like a well-behaved proxy would, without a proxy.
///  Link requests to a given proxy can be scripted to fail a number of times, and the number of
///  link requests per proxy is recorded.
#[derive(Debug, Default)]
pub struct FakeControlChannel {
    state: Mutex<ScriptState>,
}

impl FakeControlChannel {
    pub fn new() -> FakeControlChannel {
        Default::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `count` link requests to `proxy` are refused
    pub fn fail_links(&self, proxy: &Reference, count: u32) {
        self.state().link_failures.insert(*proxy, count);
    }

    /// Open requests are answered after `delay`, even if the caller cancels meanwhile
    pub fn delay_opens(&self, delay: Duration) {
        self.state().open_delay = Some(delay);
    }

    pub fn num_link_calls(&self, proxy: &Reference) -> u32 {
        self.state().link_calls.get(proxy).copied().unwrap_or(0)
    }

    /// All requests in the order they were received
    pub fn requests(&self) -> Vec<Message> {
        self.state().requests.clone()
    }

    fn answer(&self, proxy: &NameRecord, request: &Message) -> Message {
        let mut state = self.state();
        state.requests.push(request.clone());

        match &request.content {
            MessageContent::PingRequest(ping) => Message::response_to(request, MessageContent::PingResponse(PingResponse {
                address: ping.address.clone(),
                physical_address: Bytes::new(),
                time_ms: 1,
            }), SocketError::Success),
            MessageContent::LinkRequest(link) => {
                *state.link_calls.entry(proxy.address).or_default() += 1;
                if let Some(remaining) = state.link_failures.get_mut(&proxy.address) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Message::response_to(request, MessageContent::LinkResponse(LinkResponse {
                            link_id: Reference::NULL,
                            local_address: Default::default(),
                            peer_address: Default::default(),
                            transport_caps: 0,
                        }), SocketError::Refused);
                    }
                }
                let link_id = Reference::new_random();
                for property in link.properties.options.values() {
                    state.options.insert((link_id, property.option), *property);
                }
                Message::response_to(request, MessageContent::LinkResponse(LinkResponse {
                    link_id,
                    local_address: Default::default(),
                    peer_address: link.properties.address.clone(),
                    transport_caps: 0,
                }), SocketError::Success)
            }
            MessageContent::OpenRequest(_) => Message::response_to(request, MessageContent::OpenResponse, SocketError::Success),
            MessageContent::SetOptRequest(property) => {
                state.options.insert((request.target, property.option), *property);
                Message::response_to(request, MessageContent::SetOptResponse, SocketError::Success)
            }
            MessageContent::GetOptRequest(option) => match state.options.get(&(request.target, *option)) {
                Some(p) => Message::response_to(request, MessageContent::GetOptResponse(*p), SocketError::Success),
                None => Message::response_to(request, MessageContent::GetOptResponse(Property::new(*option, 0)), SocketError::PropGet),
            },
            MessageContent::CloseRequest => Message::response_to(request, MessageContent::CloseResponse(CloseResponse::default()), SocketError::Success),
            other => {
                trace!("fake control channel does not handle {}", other.kind());
                Message::response_to(request, other.empty_response(), SocketError::NotSupported)
            }
        }
    }
}

#[async_trait]
impl ControlChannel for FakeControlChannel {
    async fn call(&self, proxy: &NameRecord, request: Message, _timeout: Duration, ct: &CancellationToken) -> anyhow::Result<Message> {
        if ct.is_cancelled() {
            return Err(SocketException::new(SocketError::Aborted, "call was cancelled").into());
        }
        if let MessageContent::OpenRequest(_) = &request.content {
            let delay = self.state().open_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(self.answer(proxy, &request))
    }
}
