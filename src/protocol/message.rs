use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use tracing::trace;

use crate::error::{FormatError, SocketError};
use crate::model::reference::Reference;
use crate::protocol::content::{ContentType, DataMessage, MessageContent};
use crate::util::buf::{MpackBufExt, MpackBufMutExt};

/// The upper 16 bits are the protocol epoch, which must match between peers. The lower 16 bits
///  are informational.
pub const PROTOCOL_VERSION: u32 = (1 << 16) | 3;

const NUM_ENVELOPE_FIELDS: usize = 9;

static NEXT_SEQUENCE_ID: AtomicU32 = AtomicU32::new(1);

fn next_sequence_id() -> u32 {
    NEXT_SEQUENCE_ID.fetch_add(1, Ordering::Relaxed)
}


#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub version: u32,
    pub source: Reference,
    pub proxy: Reference,
    pub target: Reference,
    pub sequence_id: u32,
    /// a [SocketError] code
    pub error: i32,
    pub is_response: bool,
    pub content: MessageContent,
}

impl Message {
    pub fn request(source: Reference, proxy: Reference, target: Reference, content: MessageContent) -> Message {
        Message {
            version: PROTOCOL_VERSION,
            source,
            proxy,
            target,
            sequence_id: next_sequence_id(),
            error: SocketError::Success.code(),
            is_response: false,
            content,
        }
    }

    /// Data travels as a request, and it carries no error
    pub fn data(source: Reference, proxy: Reference, target: Reference, data: DataMessage) -> Message {
        Self::request(source, proxy, target, MessageContent::Data(data))
    }

    /// Swaps source and target, keeps the sequence id so the caller can correlate
    pub fn response_to(request: &Message, content: MessageContent, error: SocketError) -> Message {
        Message {
            version: PROTOCOL_VERSION,
            source: request.target,
            proxy: request.proxy,
            target: request.source,
            sequence_id: request.sequence_id,
            error: error.code(),
            is_response: true,
            content,
        }
    }

    pub fn type_id(&self) -> ContentType {
        self.content.content_type()
    }

    pub fn socket_error(&self) -> SocketError {
        SocketError::from_code(self.error)
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        if let Some(is_response) = self.content.is_response() {
            if is_response != self.is_response {
                return Err(FormatError::ContentMismatch { type_id: self.type_id().into(), is_response: self.is_response }.into());
            }
        }

        buf.mp_put_object_header(NUM_ENVELOPE_FIELDS);
        buf.mp_put_u64(self.version as u64);
        self.source.ser(buf);
        self.proxy.ser(buf);
        self.target.ser(buf);
        buf.mp_put_u64(self.sequence_id as u64);
        buf.mp_put_i64(self.error as i64);
        buf.mp_put_bool(self.is_response);
        buf.mp_put_u64(u32::from(self.type_id()) as u64);
        self.content.ser(buf)
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Message> {
        buf.mp_get_object(NUM_ENVELOPE_FIELDS)?;

        let version = buf.mp_get_u32()?;
        if version >> 16 != PROTOCOL_VERSION >> 16 {
            return Err(FormatError::Version(version).into());
        }

        let source = Reference::deser(buf)?;
        let proxy = Reference::deser(buf)?;
        let target = Reference::deser(buf)?;
        let sequence_id = buf.mp_get_u32()?;
        let error = buf.mp_get_i32()?;
        let is_response = buf.mp_get_bool()?;

        let type_id = buf.mp_get_u32()?;
        let content_type = ContentType::try_from_primitive(type_id)
            .map_err(|_| FormatError::UnknownContentType { type_id, is_response })?;
        let content = MessageContent::deser(content_type, is_response, buf)?;

        Ok(Message {
            version,
            source,
            proxy,
            target,
            sequence_id,
            error,
            is_response,
            content,
        })
    }

    pub fn encode(&self) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::new();
        self.ser(&mut buf)?;
        trace!("encoded {} message ({} bytes)", self.content.kind(), buf.len());
        Ok(buf.freeze())
    }

    /// Decodes a single message, failing if there are trailing bytes
    pub fn decode(mut raw: &[u8]) -> anyhow::Result<Message> {
        let result = Self::deser(&mut raw)?;
        if !raw.is_empty() {
            return Err(FormatError::FieldCount { expected: "end of message".to_string(), actual: raw.len() }.into());
        }
        Ok(result)
    }
}
