use std::io::Result;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn read_packet_length<R: AsyncRead + Unpin>(stream: &mut R) -> Result<u16> {
    let mut len_buffer = [0; 2];
    stream.read_exact(&mut len_buffer).await?;

    Ok(((len_buffer[0] as u16) << 8) | (len_buffer[1] as u16))
}

pub async fn write_packet_length<W: AsyncWrite + Unpin>(stream: &mut W, len: usize) -> Result<()> {
    let mut len_buffer = [0; 2];
    len_buffer[0] = (len >> 8) as u8;
    len_buffer[1] = (len & 0xFF) as u8;

    stream.write_all(&len_buffer).await?;

    Ok(())
}

/// Read one length prefixed DNS message
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let len = read_packet_length(stream).await? as usize;
    let mut data = vec![0; len];
    stream.read_exact(&mut data).await?;

    Ok(data)
}

/// Write one DNS message with its two byte length prefix
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> Result<()> {
    write_packet_length(stream, data.len()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"hello").await.unwrap();
        let frame = read_frame(&mut server).await.unwrap();

        assert_eq!(b"hello".to_vec(), frame);
    }

    #[tokio::test]
    async fn test_short_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_packet_length(&mut client, 10).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        assert!(read_frame(&mut server).await.is_err());
    }
}
