//! Adapts a byte stream to a [MessageStream]: every message is encoded and prefixed with its
//!  length as a big-endian u32.

use anyhow::bail;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, Instrument, Span};

use crate::protocol::message::Message;
use crate::provider::MessageStream;

pub const MAX_FRAME_LEN: usize = 16*1024*1024;

/// Spawns a reader and a writer task for `io`. Dropping the returned sender closes the write half
///  of `io`; the receiver ends when the peer closes the stream or sends data that can not be
///  decoded.
pub fn spawn_framed<T>(io: T, capacity: usize) -> MessageStream
where T: AsyncRead + AsyncWrite + Send + 'static
{
    let (read, write) = tokio::io::split(io);

    let (inbound_send, inbound_recv) = mpsc::channel(capacity);
    let (outbound_send, outbound_recv) = mpsc::channel(capacity);

    tokio::spawn(async move {
        match read_loop(read, inbound_send).await {
            Ok(()) => debug!("framed stream closed by peer"),
            Err(e) => error!("framed stream terminated: {}", e),
        }
    }.instrument(Span::current()));

    tokio::spawn(async move {
        if let Err(e) = write_loop(write, outbound_recv).await {
            error!("writing to framed stream failed: {}", e);
        }
    }.instrument(Span::current()));

    MessageStream {
        sender: outbound_send,
        receiver: inbound_recv,
    }
}

async fn read_loop<T: AsyncRead>(mut read: ReadHalf<T>, inbound: mpsc::Sender<Message>) -> anyhow::Result<()> {
    let mut len_buf = [0u8; 4];
    loop {
        match read.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let msg_len = u32::from_be_bytes(len_buf) as usize;
        if msg_len > MAX_FRAME_LEN {
            bail!("received a frame that was longer than the maximum ({} > {})", msg_len, MAX_FRAME_LEN);
        }

        let mut msg_buf = vec![0u8; msg_len];
        read.read_exact(&mut msg_buf).await?;
        let msg = Message::decode(&msg_buf)?;
        trace!("received {} message", msg.content.kind());

        if inbound.send(msg).await.is_err() {
            debug!("receiver dropped - stop reading");
            return Ok(());
        }
    }
}

async fn write_loop<T: AsyncWrite>(mut write: WriteHalf<T>, mut outbound: mpsc::Receiver<Message>) -> anyhow::Result<()> {
    while let Some(msg) = outbound.recv().await {
        let encoded = msg.encode()?;
        write.write_u32(encoded.len() as u32).await?;
        write.write_all(&encoded).await?;
        write.flush().await?;
    }
    write.shutdown().await?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::model::reference::Reference;
    use crate::protocol::content::DataMessage;

    fn data(payload: &'static [u8]) -> Message {
        Message::data(Reference::new_random(), Reference::NULL, Reference::new_random(), DataMessage::new(Bytes::from_static(payload), None))
    }

    #[tokio::test]
    async fn test_messages_pass_in_order() {
        let (a, b) = tokio::io::duplex(1024);
        let left = spawn_framed(a, 3);
        let mut right = spawn_framed(b, 3);

        let msgs = vec![data(b"one"), data(b"two"), data(b"")];
        for m in &msgs {
            left.sender.send(m.clone()).await.unwrap();
        }
        for m in &msgs {
            assert_eq!(right.receiver.recv().await.as_ref(), Some(m));
        }

        drop(left);
        assert!(right.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_garbage_terminates_stream() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut stream = spawn_framed(a, 3);

        b.write_u32(3).await.unwrap();
        b.write_all(&[0x93, 0x01, 0x02]).await.unwrap();
        assert!(stream.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_terminates_stream() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut stream = spawn_framed(a, 3);

        b.write_u32(MAX_FRAME_LEN as u32 + 1).await.unwrap();
        assert!(stream.receiver.recv().await.is_none());
    }
}
