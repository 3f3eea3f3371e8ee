//! Network Module
//!
//! Frame-level TCP I/O shared by master and slave sides.

mod client;
mod server;

pub use client::ReplicationClient;
pub use server::ReplicationServer;

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::replication::protocol::FRAME_HEADER_LEN;

/// Read one complete frame (header included) from a reader.
///
/// The length field is validated against `max_frame_size` before any
/// body bytes are read, so a corrupt header cannot trigger an oversized
/// allocation.
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<BytesMut> {
    use tokio::io::AsyncReadExt;

    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let size = (u32::from_be_bytes(header) & 0x00FF_FFFF) as usize;
    if size < 4 {
        return Err(Error::Decode(format!("frame length {} too small", size)));
    }
    if FRAME_HEADER_LEN + size > max_frame_size {
        return Err(Error::Decode(format!(
            "frame of {} bytes exceeds the limit of {}",
            FRAME_HEADER_LEN + size,
            max_frame_size
        )));
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + size);
    frame.extend_from_slice(&header);
    frame.resize(FRAME_HEADER_LEN + size, 0);
    reader.read_exact(&mut frame[FRAME_HEADER_LEN..]).await?;
    Ok(frame)
}

/// Write pre-encoded frame bytes to a writer
pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::{Message, TimeMessage};

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let frame = Message::Time(TimeMessage { unix_ms: 77 }).encode().unwrap();
        write_frame(&mut a, &frame).await.unwrap();

        let read = read_frame(&mut b, 65536).await.unwrap();
        assert_eq!(&read[..], &frame[..]);
        assert_eq!(
            Message::decode(&read).unwrap(),
            Message::Time(TimeMessage { unix_ms: 77 })
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Message::Time(TimeMessage { unix_ms: 1 }).encode().unwrap();
        write_frame(&mut a, &frame).await.unwrap();

        let result = read_frame(&mut b, 8).await;
        assert!(matches!(result, Err(Error::Decode(_))));
    }
}
