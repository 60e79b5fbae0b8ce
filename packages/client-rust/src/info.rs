//! Async info exchanges.
//!
//! One short-lived TCP round trip per request: dial, send the framed
//! newline-delimited name list, read the framed `name\tvalue\n` reply. Info
//! traffic never uses pooled operation connections; exchanges are rare and
//! keeping them separate means a wedged data connection cannot starve
//! tending.

use std::net::SocketAddr;
use std::time::Duration;

use strata_core::proto::{FrameHeader, FrameType, FRAME_HEADER_SIZE};
use strata_core::InfoResponse;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::ClientError;

/// Upper bound on an info reply body. Anything larger is a protocol error,
/// not a legitimate property list.
const MAX_INFO_BODY: u64 = 16 * 1024 * 1024;

/// Performs one info exchange against `addr` within `timeout`.
///
/// # Errors
///
/// [`ClientError::Timeout`] when the deadline expires, [`ClientError::Io`]
/// on socket failure, [`ClientError::InfoFailed`] when the reply is not an
/// info frame or is implausibly large.
pub async fn request(
    addr: SocketAddr,
    names: &[&str],
    timeout: Duration,
) -> Result<InfoResponse, ClientError> {
    match tokio::time::timeout(timeout, exchange(addr, names)).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout),
    }
}

async fn exchange(addr: SocketAddr, names: &[&str]) -> Result<InfoResponse, ClientError> {
    let mut stream = TcpStream::connect(addr).await?;

    let body = strata_core::encode_request(names);
    let frame = FrameHeader::new(FrameType::Info, body.len() as u64)?;
    stream.write_all(&frame.encode()).await?;
    stream.write_all(&body).await?;

    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::decode(header_bytes)?;

    if header.frame_type != FrameType::Info {
        return Err(ClientError::InfoFailed {
            addr,
            detail: format!("unexpected frame type {:?}", header.frame_type),
        });
    }
    if header.size > MAX_INFO_BODY {
        return Err(ClientError::InfoFailed {
            addr,
            detail: format!("reply body of {} bytes is implausible", header.size),
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    let mut payload = vec![0u8; header.size as usize];
    stream.read_exact(&mut payload).await?;

    let text = String::from_utf8_lossy(&payload);
    Ok(InfoResponse::parse(&text))
}
