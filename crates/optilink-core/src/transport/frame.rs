//! Frame encoding and decoding over async streams.
//!
//! Each helper takes a [`Deadline`] and re-derives the remaining budget before
//! every read or write, so a peer that trickles bytes cannot stretch a call
//! past its timeout.

use crate::config::TransportConfig;
use crate::error::{OslError, Result};
use crate::timeout::Deadline;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the double-length header.
pub const HEADER_SIZE: usize = 2 * TransportConfig::LENGTH_FIELD_SIZE;

/// Encode the header for a payload of `len` bytes.
pub fn encode_header(len: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..8].copy_from_slice(&len.to_be_bytes());
    header[8..].copy_from_slice(&len.to_be_bytes());
    header
}

/// Decode a header, rejecting it unless both length fields agree.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<u64> {
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&header[..8]);
    second.copy_from_slice(&header[8..]);
    let first = u64::from_be_bytes(first);
    let second = u64::from_be_bytes(second);
    if first != second {
        return Err(OslError::MalformedResponse(format!(
            "sizes of message header do not match: {} != {}",
            first, second
        )));
    }
    Ok(first)
}

/// Write one frame carrying `payload`.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], deadline: &Deadline) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(payload.len() as u64);
    deadline.run(writer.write_all(&header)).await?;
    deadline.run(writer.write_all(payload)).await?;
    deadline.run(writer.flush()).await?;
    Ok(())
}

/// Write one frame whose payload is the content of `path`, streamed in chunks.
pub async fn write_file_frame<W>(writer: &mut W, path: &Path, deadline: &Deadline) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| OslError::io_with_path(e, path))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| OslError::io_with_path(e, path))?
        .len();

    deadline.run(writer.write_all(&encode_header(len))).await?;

    let mut buf = vec![0u8; TransportConfig::BUFFER_SIZE];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .map_err(|e| OslError::io_with_path(e, path))?;
        if read == 0 {
            break;
        }
        deadline.run(writer.write_all(&buf[..read])).await?;
    }
    deadline.run(writer.flush()).await?;
    Ok(())
}

/// Read and validate a frame header, returning the declared payload length.
pub async fn read_header<R>(reader: &mut R, deadline: &Deadline) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let read = deadline.run(reader.read(&mut header[filled..])).await?;
        if read == 0 {
            return Err(OslError::MalformedResponse(format!(
                "connection closed after {} of {} header bytes",
                filled, HEADER_SIZE
            )));
        }
        filled += read;
    }
    decode_header(&header)
}

/// Read one complete frame.
///
/// A frame that declares a zero length is reported as [`OslError::EmptyResponse`].
pub async fn read_frame<R>(reader: &mut R, deadline: &Deadline) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = read_header(reader, deadline).await?;
    if len == 0 {
        return Err(OslError::EmptyResponse);
    }
    let len = usize::try_from(len)
        .map_err(|_| OslError::MalformedResponse(format!("message size {} too large", len)))?;

    let mut payload = Vec::with_capacity(len.min(TransportConfig::BUFFER_SIZE * 64));
    let mut buf = vec![0u8; TransportConfig::BUFFER_SIZE];
    while payload.len() < len {
        let want = (len - payload.len()).min(buf.len());
        let read = deadline.run(reader.read(&mut buf[..want])).await?;
        if read == 0 {
            return Err(short_read(payload.len() as u64, len as u64));
        }
        payload.extend_from_slice(&buf[..read]);
    }
    Ok(payload)
}

/// Read one frame and stream its payload into `path`, returning the size written.
pub async fn read_file_frame<R>(reader: &mut R, path: &Path, deadline: &Deadline) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let len = read_header(reader, deadline).await?;
    if len == 0 {
        return Err(OslError::EmptyResponse);
    }

    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| OslError::io_with_path(e, path))?;
    let mut buf = vec![0u8; TransportConfig::BUFFER_SIZE];
    let mut received: u64 = 0;
    while received < len {
        let want = (len - received).min(buf.len() as u64) as usize;
        let read = deadline.run(reader.read(&mut buf[..want])).await?;
        if read == 0 {
            return Err(short_read(received, len));
        }
        file.write_all(&buf[..read])
            .await
            .map_err(|e| OslError::io_with_path(e, path))?;
        received += read as u64;
    }
    file.flush()
        .await
        .map_err(|e| OslError::io_with_path(e, path))?;

    let written = tokio::fs::metadata(path)
        .await
        .map_err(|e| OslError::io_with_path(e, path))?
        .len();
    if written != len {
        return Err(OslError::MalformedResponse(format!(
            "received file size {} differs from declared size {}",
            written, len
        )));
    }
    Ok(written)
}

fn short_read(received: u64, expected: u64) -> OslError {
    OslError::MalformedResponse(format!(
        "connection closed after {} of {} payload bytes",
        received, expected
    ))
}
