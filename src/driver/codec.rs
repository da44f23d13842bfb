//! Framing for the driver wire protocol
//!
//! Every message is a JSON object preceded by a `Content-Length` header and a
//! blank line. Other headers are accepted and ignored.

use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::DriverError;

/// Screenshots travel base64-encoded, so allow generous bodies
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const LENGTH_HEADER: &str = "content-length";

/// Any failure reading or writing the pipe means the helper is gone
fn pipe_error(_: io::Error) -> DriverError {
    DriverError::Disconnected
}

/// Read header lines up to the blank separator and return the body length
async fn read_body_length<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<usize, DriverError> {
    let mut length = None;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await.map_err(pipe_error)? == 0 {
            return Err(DriverError::Disconnected);
        }
        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }
        let Some((name, value)) = header.split_once(':') else {
            return Err(DriverError::Protocol(format!("Malformed header line: {:?}", header)));
        };
        if name.trim().eq_ignore_ascii_case(LENGTH_HEADER) {
            let parsed = value.trim().parse::<usize>().map_err(|_| {
                DriverError::Protocol(format!("Invalid Content-Length: {}", value.trim()))
            })?;
            length = Some(parsed);
        }
    }

    match length {
        None => Err(DriverError::Protocol("Missing Content-Length header".to_string())),
        Some(len) if len > MAX_BODY_BYTES => Err(DriverError::Protocol(format!(
            "Message of {} bytes exceeds the {} byte limit",
            len, MAX_BODY_BYTES
        ))),
        Some(len) => Ok(len),
    }
}

/// Read one framed message
pub async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Value, DriverError> {
    let len = read_body_length(reader).await?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(pipe_error)?;
    serde_json::from_slice(&body)
        .map_err(|e| DriverError::Protocol(format!("Body is not valid JSON: {}", e)))
}

/// Write one framed message
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Value,
) -> Result<(), DriverError> {
    let body = serde_json::to_vec(message).map_err(|e| DriverError::Protocol(e.to_string()))?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await.map_err(pipe_error)?;
    writer.flush().await.map_err(pipe_error)
}
