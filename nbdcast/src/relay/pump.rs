//! Drain a relay receiver into a byte stream.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::wire::encode_header;
use super::{RelayEvent, RelayReceiver};

/// Forward every write notification to `writer` until the end marker.
///
/// Writes the size header first, then each notification as three values
/// (offset, length, payload). Returns the number of notifications
/// forwarded. If `writer` fails the receiver is dropped, which surfaces as
/// a disconnect to any pending publish.
///
/// Fails with `UnexpectedEof` if the relay closes without an end marker.
pub async fn pump<W>(
    mut receiver: RelayReceiver,
    size_bytes: u64,
    writer: &mut W,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_header(size_bytes)).await?;

    let mut forwarded = 0u64;
    loop {
        match receiver.recv().await {
            Some(RelayEvent::Write(notification)) => {
                writer.write_all(&notification.encode_prefix()).await?;
                writer.write_all(&notification.payload).await?;
                forwarded += 1;
            }
            Some(RelayEvent::End) => break,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "relay closed without end marker",
                ));
            }
        }
    }

    writer.flush().await?;
    debug!(forwarded, "relay stream finished");
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::wire::StreamDecoder;
    use crate::relay::{WriteNotification, channel};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn pump_writes_header_and_notifications() {
        let (tx, rx) = channel(None);
        let (mut client, mut server) = duplex(1024);

        let consumer = tokio::spawn(async move { pump(rx, 100, &mut server).await });

        tx.publish(RelayEvent::Write(WriteNotification::new(
            10,
            Bytes::from_static(&[1, 2, 3]),
        )))
        .await
        .unwrap();
        tx.publish(RelayEvent::End).await.unwrap();

        assert_eq!(consumer.await.unwrap().unwrap(), 1);

        let mut stream = Vec::new();
        client.read_to_end(&mut stream).await.unwrap();

        let mut decoder = StreamDecoder::new();
        decoder.extend(&stream);
        let n = decoder.next_notification().unwrap().unwrap();
        assert_eq!(decoder.size_bytes(), Some(100));
        assert_eq!(n, WriteNotification::new(10, Bytes::from_static(&[1, 2, 3])));
        assert!(decoder.next_notification().unwrap().is_none());
        assert_eq!(decoder.remaining(), 0);
    }

    #[tokio::test]
    async fn pump_fails_without_end_marker() {
        let (tx, rx) = channel(None);
        drop(tx);

        let mut sink = Vec::new();
        let err = pump(rx, 8, &mut sink).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(sink, 8u64.to_le_bytes());
    }
}
