use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::model::address::SocketAddress;
use crate::model::reference::Reference;
use crate::model::socket_info::{Property, SocketInfo, SocketOption};
use crate::util::buf::{MpackBufExt, MpackBufMutExt};

/// The content type id in the message envelope. Together with the envelope's 'is response' flag
///  it selects the content's layout.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ContentType {
    Ping = 10,
    Link = 12,
    SetOpt = 13,
    GetOpt = 14,
    Open = 20,
    Close = 21,
    Data = 30,
    Poll = 31,
}

/// version of the link request layout
pub const LINK_REQUEST_VERSION: u8 = 1;


#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PingRequest {
    pub address: SocketAddress,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PingResponse {
    pub address: SocketAddress,
    /// MAC address of the interface that reached the address, if the proxy knows it
    pub physical_address: Bytes,
    pub time_ms: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkRequest {
    pub version: u8,
    pub properties: SocketInfo,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkResponse {
    pub link_id: Reference,
    pub local_address: SocketAddress,
    pub peer_address: SocketAddress,
    pub transport_caps: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenRequest {
    pub stream_id: Reference,
    pub connection_string: String,
    pub stream_type: i32,
    pub encoding: i32,
    pub is_polled: bool,
    pub max_receive: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct CloseResponse {
    pub time_open_ms: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error_code: i32,
}

/// Payload on the data plane. `address` is the destination of an outbound datagram or the
///  source of an inbound one; it is absent for stream payload.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct DataMessage {
    pub sequence_number: u64,
    pub address: Option<SocketAddress>,
    pub payload: Bytes,
    pub control: Bytes,
}

impl DataMessage {
    pub fn new(payload: Bytes, address: Option<SocketAddress>) -> DataMessage {
        DataMessage {
            sequence_number: 0,
            address,
            payload,
            control: Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct PollRequest {
    pub sequence_number: u64,
    pub timeout_ms: u64,
}


#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MessageContent {
    PingRequest(PingRequest),
    PingResponse(PingResponse),
    LinkRequest(LinkRequest),
    LinkResponse(LinkResponse),
    SetOptRequest(Property),
    SetOptResponse,
    GetOptRequest(SocketOption),
    GetOptResponse(Property),
    OpenRequest(OpenRequest),
    OpenResponse,
    CloseRequest,
    CloseResponse(CloseResponse),
    Data(DataMessage),
    PollRequest(PollRequest),
    PollResponse,
}

impl MessageContent {
    pub fn content_type(&self) -> ContentType {
        use MessageContent::*;

        match self {
            PingRequest(_) | PingResponse(_) => ContentType::Ping,
            LinkRequest(_) | LinkResponse(_) => ContentType::Link,
            SetOptRequest(_) | SetOptResponse => ContentType::SetOpt,
            GetOptRequest(_) | GetOptResponse(_) => ContentType::GetOpt,
            OpenRequest(_) | OpenResponse => ContentType::Open,
            CloseRequest | CloseResponse(_) => ContentType::Close,
            Data(_) => ContentType::Data,
            PollRequest(_) | PollResponse => ContentType::Poll,
        }
    }

    /// `None` for data, which is valid in both directions
    pub fn is_response(&self) -> Option<bool> {
        use MessageContent::*;

        match self {
            Data(_) => None,
            PingRequest(_) | LinkRequest(_) | SetOptRequest(_) | GetOptRequest(_) | OpenRequest(_) | CloseRequest | PollRequest(_) => Some(false),
            PingResponse(_) | LinkResponse(_) | SetOptResponse | GetOptResponse(_) | OpenResponse | CloseResponse(_) | PollResponse => Some(true),
        }
    }

    pub fn kind(&self) -> &'static str {
        use MessageContent::*;

        match self {
            PingRequest(_) => "ping request",
            PingResponse(_) => "ping response",
            LinkRequest(_) => "link request",
            LinkResponse(_) => "link response",
            SetOptRequest(_) => "setopt request",
            SetOptResponse => "setopt response",
            GetOptRequest(_) => "getopt request",
            GetOptResponse(_) => "getopt response",
            OpenRequest(_) => "open request",
            OpenResponse => "open response",
            CloseRequest => "close request",
            CloseResponse(_) => "close response",
            Data(_) => "data",
            PollRequest(_) => "poll request",
            PollResponse => "poll response",
        }
    }

    /// A response to this request without payload, for answering with an error code. Data
    ///  gets an empty data message, responses are returned as they are.
    pub fn empty_response(&self) -> MessageContent {
        use MessageContent::*;

        match self {
            PingRequest(r) => PingResponse(self::PingResponse {
                address: r.address.clone(),
                physical_address: Bytes::new(),
                time_ms: 0,
            }),
            LinkRequest(_) => LinkResponse(self::LinkResponse {
                link_id: Reference::NULL,
                local_address: SocketAddress::Any,
                peer_address: SocketAddress::Any,
                transport_caps: 0,
            }),
            SetOptRequest(_) => SetOptResponse,
            GetOptRequest(option) => GetOptResponse(Property::new(*option, 0)),
            OpenRequest(_) => OpenResponse,
            CloseRequest => CloseResponse(Default::default()),
            PollRequest(_) => PollResponse,
            Data(_) => Data(DataMessage::default()),
            response => response.clone(),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        use MessageContent::*;

        match self {
            PingRequest(c) => {
                buf.mp_put_object_header(1);
                c.address.ser(buf)?;
            }
            PingResponse(c) => {
                buf.mp_put_object_header(3);
                c.address.ser(buf)?;
                buf.mp_put_bin(&c.physical_address);
                buf.mp_put_u64(c.time_ms as u64);
            }
            LinkRequest(c) => {
                buf.mp_put_object_header(2);
                buf.mp_put_u64(c.version as u64);
                c.properties.ser(buf)?;
            }
            LinkResponse(c) => {
                buf.mp_put_object_header(4);
                c.link_id.ser(buf);
                c.local_address.ser(buf)?;
                c.peer_address.ser(buf)?;
                buf.mp_put_u64(c.transport_caps as u64);
            }
            SetOptRequest(property) => {
                buf.mp_put_object_header(1);
                property.ser(buf)?;
            }
            GetOptRequest(option) => {
                buf.mp_put_object_header(1);
                option.ser(buf);
            }
            GetOptResponse(property) => {
                buf.mp_put_object_header(1);
                property.ser(buf)?;
            }
            OpenRequest(c) => {
                buf.mp_put_object_header(6);
                c.stream_id.ser(buf);
                buf.mp_put_str(&c.connection_string);
                buf.mp_put_i64(c.stream_type as i64);
                buf.mp_put_i64(c.encoding as i64);
                buf.mp_put_bool(c.is_polled);
                buf.mp_put_u64(c.max_receive as u64);
            }
            CloseResponse(c) => {
                buf.mp_put_object_header(4);
                buf.mp_put_u64(c.time_open_ms);
                buf.mp_put_u64(c.bytes_sent);
                buf.mp_put_u64(c.bytes_received);
                buf.mp_put_i64(c.error_code as i64);
            }
            Data(c) => {
                buf.mp_put_object_header(4);
                buf.mp_put_u64(c.sequence_number);
                SocketAddress::ser_opt(c.address.as_ref(), buf)?;
                buf.mp_put_bin(&c.payload);
                buf.mp_put_bin(&c.control);
            }
            PollRequest(c) => {
                buf.mp_put_object_header(2);
                buf.mp_put_u64(c.sequence_number);
                buf.mp_put_u64(c.timeout_ms);
            }
            SetOptResponse | OpenResponse | CloseRequest | PollResponse => {
                buf.mp_put_nil();
            }
        }
        Ok(())
    }

    pub fn deser(content_type: ContentType, is_response: bool, buf: &mut impl Buf) -> anyhow::Result<MessageContent> {
        use MessageContent::*;

        let result = match (content_type, is_response) {
            (ContentType::Data, _) => {
                buf.mp_get_object(4)?;
                Data(DataMessage {
                    sequence_number: buf.mp_get_u64()?,
                    address: SocketAddress::deser_opt(buf)?,
                    payload: buf.mp_get_bin()?,
                    control: buf.mp_get_bin()?,
                })
            }
            (ContentType::Ping, false) => {
                buf.mp_get_object(1)?;
                PingRequest(self::PingRequest {
                    address: SocketAddress::deser(buf)?,
                })
            }
            (ContentType::Ping, true) => {
                buf.mp_get_object(3)?;
                PingResponse(self::PingResponse {
                    address: SocketAddress::deser(buf)?,
                    physical_address: buf.mp_get_bin()?,
                    time_ms: buf.mp_get_u32()?,
                })
            }
            (ContentType::Link, false) => {
                buf.mp_get_object(2)?;
                LinkRequest(self::LinkRequest {
                    version: buf.mp_get_u8()?,
                    properties: SocketInfo::deser(buf)?,
                })
            }
            (ContentType::Link, true) => {
                buf.mp_get_object(4)?;
                LinkResponse(self::LinkResponse {
                    link_id: Reference::deser(buf)?,
                    local_address: SocketAddress::deser(buf)?,
                    peer_address: SocketAddress::deser(buf)?,
                    transport_caps: buf.mp_get_u32()?,
                })
            }
            (ContentType::SetOpt, false) => {
                buf.mp_get_object(1)?;
                SetOptRequest(Property::deser(buf)?)
            }
            (ContentType::GetOpt, false) => {
                buf.mp_get_object(1)?;
                GetOptRequest(SocketOption::deser(buf)?)
            }
            (ContentType::GetOpt, true) => {
                buf.mp_get_object(1)?;
                GetOptResponse(Property::deser(buf)?)
            }
            (ContentType::Open, false) => {
                buf.mp_get_object(6)?;
                OpenRequest(self::OpenRequest {
                    stream_id: Reference::deser(buf)?,
                    connection_string: buf.mp_get_opt_str()?,
                    stream_type: buf.mp_get_i32()?,
                    encoding: buf.mp_get_i32()?,
                    is_polled: buf.mp_get_bool()?,
                    max_receive: buf.mp_get_u32()?,
                })
            }
            (ContentType::Close, true) => {
                buf.mp_get_object(4)?;
                CloseResponse(self::CloseResponse {
                    time_open_ms: buf.mp_get_u64()?,
                    bytes_sent: buf.mp_get_u64()?,
                    bytes_received: buf.mp_get_u64()?,
                    error_code: buf.mp_get_i32()?,
                })
            }
            (ContentType::Poll, false) => {
                buf.mp_get_object(2)?;
                PollRequest(self::PollRequest {
                    sequence_number: buf.mp_get_u64()?,
                    timeout_ms: buf.mp_get_u64()?,
                })
            }
            (ContentType::SetOpt, true) => {
                buf.mp_get_nil()?;
                SetOptResponse
            }
            (ContentType::Open, true) => {
                buf.mp_get_nil()?;
                OpenResponse
            }
            (ContentType::Close, false) => {
                buf.mp_get_nil()?;
                CloseRequest
            }
            (ContentType::Poll, true) => {
                buf.mp_get_nil()?;
                PollResponse
            }
        };
        Ok(result)
    }
}
