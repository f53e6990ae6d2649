//! The data plane of a link: a bounded send stage that splits payload to fit the stream's
//!  buffer size, and a bounded receive stage that filters inbound messages.

use std::sync::Arc;

use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{SocketError, SocketException};
use crate::link::stats::LinkCounters;
use crate::protocol::content::{DataMessage, MessageContent};
use crate::protocol::message::Message;
use crate::provider::MessageStream;

/// Splits a payload into near-equal segments of at most `max_size` bytes. Segments carry no
///  address. Payloads that fit (and everything if `max_size` is 0) are returned unchanged.
pub fn split_payload(data: DataMessage, max_size: usize) -> Vec<DataMessage> {
    let len = data.payload.len();
    if max_size == 0 || len <= max_size {
        return vec![data];
    }

    let segment_count = len.div_ceil(max_size);
    let segment_size = len.div_ceil(segment_count);

    let mut result = Vec::with_capacity(segment_count);
    let mut offset = 0;
    while offset < len {
        let end = usize::min(offset + segment_size, len);
        result.push(DataMessage {
            sequence_number: data.sequence_number,
            address: None,
            payload: data.payload.slice(offset..end),
            control: Bytes::new(),
        });
        offset = end;
    }
    result
}


#[derive(Debug)]
pub enum Inbound {
    Deliver(Message),
    Drop,
    EndOfStream,
    Fail(SocketException),
}

/// Classification of messages arriving from the stream
pub fn classify(message: Message) -> Inbound {
    if matches!(message.content, MessageContent::CloseRequest | MessageContent::CloseResponse(_)) {
        return Inbound::EndOfStream;
    }
    match message.socket_error() {
        SocketError::Success => {}
        SocketError::Closed => return Inbound::EndOfStream,
        SocketError::Duplicate => return Inbound::Drop,
        code => return Inbound::Fail(SocketException::new(code, format!("remote side reported {} on the data stream", code))),
    }
    match &message.content {
        MessageContent::Data(_) => Inbound::Deliver(message),
        _ => Inbound::Drop,
    }
}

fn payload_len(message: &Message) -> usize {
    match &message.content {
        MessageContent::Data(d) => d.payload.len(),
        _ => 0,
    }
}


/// Both pipeline stages of one link. Dropping the data plane stops its stages, which in turn
///  closes the stream's sending half.
pub struct DataPlane {
    sender: mpsc::Sender<Message>,
    receiver: Mutex<mpsc::Receiver<anyhow::Result<Message>>>,
    shutdown: CancellationToken,
}

impl Drop for DataPlane {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl DataPlane {
    pub fn new(stream: MessageStream, max_buffer_size: usize, capacity: usize, counters: Arc<LinkCounters>) -> DataPlane {
        let shutdown = CancellationToken::new();

        let (send_in, send_out) = mpsc::channel(capacity);
        tokio::spawn(send_stage(send_out, stream.sender, max_buffer_size, counters.clone(), shutdown.clone()));

        let (receive_in, receive_out) = mpsc::channel(capacity);
        tokio::spawn(receive_stage(stream.receiver, receive_in, counters, shutdown.clone()));

        DataPlane {
            sender: send_in,
            receiver: Mutex::new(receive_out),
            shutdown,
        }
    }

    /// Waits for queue space, which is how a slow stream applies backpressure
    pub async fn send(&self, message: Message, ct: &CancellationToken) -> anyhow::Result<()> {
        select! {
            r = self.sender.send(message) => r.map_err(|_| SocketException::new(SocketError::Closed, "data plane is closed").into()),
            _ = ct.cancelled() => Err(SocketException::new(SocketError::Aborted, "send was cancelled").into()),
        }
    }

    /// The next data message. Fails with [SocketError::Closed] once the stream ended.
    pub async fn receive(&self, ct: &CancellationToken) -> anyhow::Result<Message> {
        let mut receiver = self.receiver.lock().await;
        select! {
            r = receiver.recv() => match r {
                Some(r) => r,
                None => Err(SocketException::new(SocketError::Closed, "stream was closed").into()),
            },
            _ = ct.cancelled() => Err(SocketException::new(SocketError::Aborted, "receive was cancelled").into()),
        }
    }
}

async fn send_stage(mut input: mpsc::Receiver<Message>, stream: mpsc::Sender<Message>, max_buffer_size: usize, counters: Arc<LinkCounters>, shutdown: CancellationToken) {
    loop {
        let message = select! {
            m = input.recv() => match m {
                Some(m) => m,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let segments = match message.content {
            MessageContent::Data(data) => {
                split_payload(data, max_buffer_size).into_iter()
                    .map(|d| Message::data(message.source, message.proxy, message.target, d))
                    .collect::<Vec<_>>()
            }
            _ => vec![message],
        };
        if segments.len() > 1 {
            trace!("split payload into {} segments", segments.len());
        }

        for segment in segments {
            let len = payload_len(&segment);
            let sent = select! {
                r = stream.send(segment) => r.is_ok(),
                _ = shutdown.cancelled() => false,
            };
            if !sent {
                debug!("stream closed - stopping send stage");
                return;
            }
            counters.on_sent(len);
        }
    }
    debug!("send stage terminated");
}

async fn receive_stage(mut stream: mpsc::Receiver<Message>, output: mpsc::Sender<anyhow::Result<Message>>, counters: Arc<LinkCounters>, shutdown: CancellationToken) {
    loop {
        let message = select! {
            m = stream.recv() => match m {
                Some(m) => m,
                None => {
                    debug!("stream ended");
                    break;
                }
            },
            _ = shutdown.cancelled() => break,
        };

        let item = match classify(message) {
            Inbound::Deliver(m) => {
                counters.on_received(payload_len(&m));
                Ok(m)
            }
            Inbound::Drop => {
                trace!("dropping inbound message");
                continue;
            }
            Inbound::EndOfStream => {
                debug!("remote side closed the stream");
                break;
            }
            Inbound::Fail(e) => {
                warn!("stream failed: {}", e);
                counters.on_error(e.code);
                Err(e.into())
            }
        };
        let is_err = item.is_err();

        let delivered = select! {
            r = output.send(item) => r.is_ok(),
            _ = shutdown.cancelled() => false,
        };
        if !delivered || is_err {
            break;
        }
    }
    debug!("receive stage terminated");
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::error::socket_error_of;
    use crate::model::address::SocketAddress;
    use crate::model::reference::Reference;
    use crate::protocol::content::CloseResponse;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    fn data(len: usize) -> Message {
        Message::data(Reference::new_random(), Reference::NULL, Reference::new_random(), DataMessage::new(payload(len), None))
    }

    #[rstest]
    #[case::empty(0, 4, vec![0])]
    #[case::fits(4, 4, vec![4])]
    #[case::unbounded(100, 0, vec![100])]
    #[case::two(5, 4, vec![3, 2])]
    #[case::even(8, 4, vec![4, 4])]
    #[case::uneven(10, 4, vec![4, 4, 2])]
    #[case::one_byte(7, 1, vec![1, 1, 1, 1, 1, 1, 1])]
    #[case::near_equal(1001, 100, vec![91; 11])]
    fn test_split_payload(#[case] len: usize, #[case] max: usize, #[case] expected_sizes: Vec<usize>) {
        let original = payload(len);
        let segments = split_payload(DataMessage::new(original.clone(), Some(SocketAddress::Any)), max);

        assert_eq!(segments.iter().map(|s| s.payload.len()).collect::<Vec<_>>(), expected_sizes);

        let joined = segments.iter().flat_map(|s| s.payload.iter().copied()).collect::<Vec<_>>();
        assert_eq!(joined, original.to_vec());
    }

    #[test]
    fn test_split_drops_address() {
        let segments = split_payload(DataMessage::new(payload(10), Some(SocketAddress::Any)), 3);
        assert!(segments.iter().all(|s| s.address.is_none()));

        let unsplit = split_payload(DataMessage::new(payload(3), Some(SocketAddress::Any)), 3);
        assert_eq!(unsplit[0].address, Some(SocketAddress::Any));
    }

    fn with_error(mut m: Message, error: SocketError) -> Message {
        m.error = error.code();
        m
    }

    #[rstest]
    #[case::data(data(3), "deliver")]
    #[case::closed(with_error(data(3), SocketError::Closed), "end")]
    #[case::duplicate(with_error(data(3), SocketError::Duplicate), "drop")]
    #[case::timeout(with_error(data(3), SocketError::Timeout), "fail")]
    #[case::close_content(Message::request(Reference::NULL, Reference::NULL, Reference::NULL, MessageContent::CloseRequest), "end")]
    #[case::close_response(Message::request(Reference::NULL, Reference::NULL, Reference::NULL, MessageContent::CloseResponse(CloseResponse::default())), "end")]
    #[case::other(Message::request(Reference::NULL, Reference::NULL, Reference::NULL, MessageContent::OpenResponse), "drop")]
    fn test_classify(#[case] message: Message, #[case] expected: &str) {
        let actual = match classify(message) {
            Inbound::Deliver(_) => "deliver",
            Inbound::Drop => "drop",
            Inbound::EndOfStream => "end",
            Inbound::Fail(_) => "fail",
        };
        assert_eq!(actual, expected);
    }

    struct Peer {
        to_link: mpsc::Sender<Message>,
        from_link: mpsc::Receiver<Message>,
    }

    fn data_plane(max_buffer_size: usize) -> (DataPlane, Peer, Arc<LinkCounters>) {
        let (to_link, link_in) = mpsc::channel(3);
        let (link_out, from_link) = mpsc::channel(3);
        let counters = Arc::new(LinkCounters::new());
        let dp = DataPlane::new(MessageStream { sender: link_out, receiver: link_in }, max_buffer_size, 3, counters.clone());
        (dp, Peer { to_link, from_link }, counters)
    }

    #[tokio::test]
    async fn test_send_splits_and_preserves_order() {
        let (dp, mut peer, counters) = data_plane(4);
        let ct = CancellationToken::new();

        dp.send(data(10), &ct).await.unwrap();
        dp.send(data(2), &ct).await.unwrap();

        let mut sizes = Vec::new();
        for _ in 0..4 {
            sizes.push(payload_len(&peer.from_link.recv().await.unwrap()));
        }
        assert_eq!(sizes, vec![4, 4, 2, 2]);
        assert_eq!(counters.snapshot().bytes_sent, 12);
    }

    #[tokio::test]
    async fn test_receive_filters() {
        let (dp, peer, counters) = data_plane(0);
        let ct = CancellationToken::new();

        peer.to_link.send(with_error(data(1), SocketError::Duplicate)).await.unwrap();
        peer.to_link.send(data(5)).await.unwrap();
        peer.to_link.send(with_error(data(1), SocketError::Closed)).await.unwrap();

        let m = dp.receive(&ct).await.unwrap();
        assert_eq!(payload_len(&m), 5);
        assert_eq!(counters.snapshot().bytes_received, 5);

        let err = dp.receive(&ct).await.unwrap_err();
        assert_eq!(socket_error_of(&err), SocketError::Closed);
    }

    #[tokio::test]
    async fn test_receive_surfaces_errors() {
        let (dp, peer, counters) = data_plane(0);
        let ct = CancellationToken::new();

        peer.to_link.send(with_error(data(1), SocketError::Reset)).await.unwrap();
        let err = dp.receive(&ct).await.unwrap_err();
        assert_eq!(socket_error_of(&err), SocketError::Reset);
        assert_eq!(counters.snapshot().error, SocketError::Reset);
    }

    #[tokio::test]
    async fn test_receive_cancelled() {
        let (dp, _peer, _) = data_plane(0);
        let ct = CancellationToken::new();
        ct.cancel();
        let err = dp.receive(&ct).await.unwrap_err();
        assert_eq!(socket_error_of(&err), SocketError::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_backpressure() {
        let (dp, mut peer, _) = data_plane(0);
        let ct = CancellationToken::new();

        // peer channel (3), send stage in hand (1) and data plane queue (3)
        for _ in 0..7 {
            dp.send(data(1), &ct).await.unwrap();
        }
        let blocked = tokio::time::timeout(Duration::from_secs(1), dp.send(data(1), &ct)).await;
        assert!(blocked.is_err());

        peer.from_link.recv().await.unwrap();
        dp.send(data(1), &ct).await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_closes_stream() {
        let (dp, mut peer, _) = data_plane(0);
        drop(dp);
        assert!(peer.from_link.recv().await.is_none());
    }
}
