//! Async data-movement helpers used by the stream writer/reader and the
//! device-model snapshot module. Replaces the callback-chain "data copier
//! job" object from the original C source with plain `async fn`s driven
//! directly on the tokio reactor — completion is just the returned
//! `Result`, there is no separate completion callback to wire up.
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use shared::wire::{encode_record, record_padding, RecordType};

/// Write a whole framed record (header + payload + padding) to `writer`.
pub async fn copy_framed_writer<W: AsyncWrite + Unpin>(
    writer: &mut W,
    rec_type: RecordType,
    payload: &[u8],
) -> Result<u64, std::io::Error> {
    let buf = encode_record(rec_type, payload);
    writer.write_all(&buf).await?;
    Ok(buf.len() as u64)
}

/// Copy exactly `len` bytes from `reader` into `writer`, in fixed-size
/// chunks, returning the number of bytes moved. Used for splicing a
/// device-model snapshot file into the outgoing stream without holding
/// the whole file in memory.
pub async fn copy_bounded<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
) -> Result<u64, std::io::Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    const CHUNK: usize = 64 * 1024;
    let mut buf = vec![0u8; CHUNK];
    let mut remaining = len;
    let mut moved = 0u64;
    while remaining > 0 {
        let want = remaining.min(CHUNK as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "source ended before len bytes were copied",
            ));
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
        moved += n as u64;
    }
    Ok(moved)
}

/// Copy `reader`'s entire remaining contents into `writer`, returning the
/// byte count moved. Used when splicing an entire device-model snapshot
/// file whose length is not already known up front.
pub async fn copy_into_file<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, std::io::Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::io::copy(reader, writer).await
}

/// Read and discard `n` padding bytes, the counterpart to
/// `record_padding` on the write side.
pub async fn skip_padding<R: AsyncRead + Unpin>(
    reader: &mut R,
    payload_len: usize,
) -> Result<(), std::io::Error> {
    let pad = record_padding(payload_len);
    if pad == 0 {
        return Ok(());
    }
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf[..pad]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_framed_writer_pads_to_eight() {
        let mut buf = Vec::new();
        let n = copy_framed_writer(&mut buf, RecordType::End, &[1, 2, 3])
            .await
            .unwrap();
        assert_eq!(n as usize, buf.len());
        assert_eq!(buf.len() % 8, 0);
    }

    #[tokio::test]
    async fn copy_bounded_moves_exact_length() {
        let src = vec![7u8; 100];
        let mut reader = &src[..];
        let mut out = Vec::new();
        let n = copy_bounded(&mut reader, &mut out, 100).await.unwrap();
        assert_eq!(n, 100);
        assert_eq!(out.len(), 100);
    }

    #[tokio::test]
    async fn copy_bounded_errors_on_short_source() {
        let src = vec![7u8; 10];
        let mut reader = &src[..];
        let mut out = Vec::new();
        assert!(copy_bounded(&mut reader, &mut out, 100).await.is_err());
    }
}
