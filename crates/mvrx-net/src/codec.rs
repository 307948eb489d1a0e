//! Async framing of MVR-xchange packets over a byte stream.
//!
//! JSON packets are read whole and decoded into [`WireMessage`]s. File
//! packets are left in the stream: the caller decides whether to store the
//! payload ([`receive_file`]) or skip it ([`discard`]).

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use mvrx_shared::constants::PACKET_HEADER_LEN;
use mvrx_shared::protocol::PacketHeader;
use mvrx_shared::{MvrxError, PayloadKind, WireMessage};

use crate::error::NetError;

/// One inbound packet.
#[derive(Debug)]
pub enum Frame {
    Message(WireMessage),
    /// A JSON payload that did not decode. The stream is still in sync.
    Malformed(MvrxError),
    /// A file payload of the given length follows in the stream.
    File(u64),
}

/// Read the next packet. Returns `None` when the peer closed the stream.
///
/// A header that fails validation is an error: the stream cannot be
/// resynchronized after it.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; PACKET_HEADER_LEN];
    match reader.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetError::Connection(e.to_string())),
    }

    let header = PacketHeader::decode(&raw)?;
    match header.kind {
        PayloadKind::Json => {
            let mut payload = vec![0u8; header.payload_len as usize];
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| NetError::Connection(e.to_string()))?;
            Ok(Some(match WireMessage::from_json(&payload) {
                Ok(msg) => Frame::Message(msg),
                Err(e) => Frame::Malformed(e),
            }))
        }
        PayloadKind::File => Ok(Some(Frame::File(header.payload_len))),
    }
}

pub async fn write_message<W>(writer: &mut W, msg: &WireMessage) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    let packet = msg.to_packet()?;
    writer
        .write_all(&packet)
        .await
        .map_err(|e| NetError::Connection(e.to_string()))?;
    writer.flush().await.map_err(|e| NetError::Connection(e.to_string()))
}

/// Stream the file at `path` as a single file packet. Returns the payload size.
pub async fn write_file<W>(writer: &mut W, path: &Path) -> Result<u64, NetError>
where
    W: AsyncWrite + Unpin,
{
    let file = File::open(path).await?;
    let len = file.metadata().await?.len();

    let mut header = BytesMut::with_capacity(PACKET_HEADER_LEN);
    PacketHeader::new(PayloadKind::File, len).encode(&mut header);
    writer
        .write_all(&header)
        .await
        .map_err(|e| NetError::Connection(e.to_string()))?;

    let mut limited = file.take(len);
    let copied = tokio::io::copy(&mut limited, writer)
        .await
        .map_err(|e| NetError::Connection(e.to_string()))?;
    if copied != len {
        return Err(NetError::FileTransfer(format!(
            "{} shrank while sending ({copied} of {len} bytes)",
            path.display()
        )));
    }
    writer.flush().await.map_err(|e| NetError::Connection(e.to_string()))?;

    debug!(path = %path.display(), bytes = len, "File packet sent");
    Ok(len)
}

/// Copy exactly `len` payload bytes from `reader` into a new file at `dest`.
pub async fn receive_file<R>(reader: &mut R, len: u64, dest: &Path) -> Result<(), NetError>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(dest).await?;
    let mut limited = (&mut *reader).take(len);
    let copied = tokio::io::copy(&mut limited, &mut file)
        .await
        .map_err(|e| NetError::FileTransfer(e.to_string()))?;
    if copied != len {
        return Err(NetError::FileTransfer(format!(
            "connection closed after {copied} of {len} bytes"
        )));
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

/// Skip a file payload nobody asked for.
pub async fn discard<R>(reader: &mut R, len: u64) -> Result<(), NetError>
where
    R: AsyncRead + Unpin,
{
    let mut limited = (&mut *reader).take(len);
    tokio::io::copy(&mut limited, &mut tokio::io::sink())
        .await
        .map_err(|e| NetError::Connection(e.to_string()))?;
    Ok(())
}

/// Open a TCP connection. A zero `timeout` leaves the deadline to the OS.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, NetError> {
    let attempt = TcpStream::connect(addr);
    let result = if timeout.is_zero() {
        attempt.await
    } else {
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| NetError::Connection(format!("{addr}: connect timed out")))?
    };

    let stream = result.map_err(|e| NetError::Connection(format!("{addr}: {e}")))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    use mvrx_shared::{MessageKind, StationUuid};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_message_over_stream() {
        let (mut a, mut b) = duplex(64 * 1024);
        let station = StationUuid::generate();
        let msg = WireMessage::new(MessageKind::Leave, station);

        write_message(&mut a, &msg).await.unwrap();
        match read_frame(&mut b).await.unwrap() {
            Some(Frame::Message(decoded)) => assert_eq!(decoded, msg),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (a, mut b) = duplex(1024);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_json_keeps_stream_in_sync() {
        let (mut a, mut b) = duplex(64 * 1024);
        let garbage = br#"{"Type":"MVR_NOPE"}"#;
        let mut packet = BytesMut::new();
        PacketHeader::new(PayloadKind::Json, garbage.len() as u64).encode(&mut packet);
        packet.extend_from_slice(garbage);
        a.write_all(&packet).await.unwrap();

        let station = StationUuid::generate();
        write_message(&mut a, &WireMessage::new(MessageKind::Join, station))
            .await
            .unwrap();

        assert!(matches!(read_frame(&mut b).await.unwrap(), Some(Frame::Malformed(_))));
        match read_frame(&mut b).await.unwrap() {
            Some(Frame::Message(msg)) => assert_eq!(msg.kind, MessageKind::Join),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_header_is_error() {
        let (mut a, mut b) = duplex(1024);
        a.write_all(&[0xAB; PACKET_HEADER_LEN]).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(NetError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_file_packet_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("scene.mvr");
        let dest = dir.path().join("copy.mvr");
        tokio::fs::write(&src, vec![7u8; 10_000]).await.unwrap();

        let (mut a, mut b) = duplex(4096);
        let sender = tokio::spawn(async move { write_file(&mut a, &src).await.unwrap() });

        let len = match read_frame(&mut b).await.unwrap() {
            Some(Frame::File(len)) => len,
            other => panic!("unexpected frame: {other:?}"),
        };
        receive_file(&mut b, len, &dest).await.unwrap();

        assert_eq!(sender.await.unwrap(), 10_000);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), vec![7u8; 10_000]);
    }

    #[tokio::test]
    async fn test_short_file_payload_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("short.mvr");

        let (mut a, mut b) = duplex(4096);
        let mut header = BytesMut::new();
        PacketHeader::new(PayloadKind::File, 100).encode(&mut header);
        a.write_all(&header).await.unwrap();
        a.write_all(&[1u8; 40]).await.unwrap();
        drop(a);

        let Some(Frame::File(len)) = read_frame(&mut b).await.unwrap() else {
            panic!("expected file frame");
        };
        let err = receive_file(&mut b, len, &dest).await.unwrap_err();
        assert!(matches!(err, NetError::FileTransfer(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect(addr, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, NetError::Connection(_)));
    }
}
