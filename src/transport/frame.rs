//! Length-delimited framing for byte-stream transports.
//!
//! Each message is preceded by its length as a big-endian `u32`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

/// Largest message accepted on the wire: a full page plus generous envelope room.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: data.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    writer.write_u32(data.len() as u32).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_SIZE,
        });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_preserve_message_boundaries() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"first").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        write_frame(&mut client, b"third message").await.unwrap();

        assert_eq!(read_frame(&mut server).await.unwrap(), b"first");
        assert!(read_frame(&mut server).await.unwrap().is_empty());
        assert_eq!(read_frame(&mut server).await.unwrap(), b"third message");
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_eof_reports_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        assert!(matches!(
            read_frame(&mut server).await,
            Err(TransportError::Closed)
        ));
    }
}
