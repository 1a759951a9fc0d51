//! WebSocket transport: RFC 6455 handshake and binary framing.
//!
//! Only the subset the control plane needs is implemented: binary frames
//! with FIN=1, close detection, and client-side masking. The server XORs
//! masked payloads unconditionally; the client sends a present-but-zero
//! masking key, which is conformant (data XOR 0 = data).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::ProtocolError;
use crate::protocol::frame::MAX_PAYLOAD;

/// Handshake GUID fixed by RFC 6455.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Nonce sent by the host client. Any fixed value is valid; the server only
/// ever hashes it.
const CLIENT_NONCE: &str = "dGhlIHNhbXBsZSBub25jZQ==";

const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;

/// Derives the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Reads HTTP-style header lines until the terminating blank line.
async fn read_headers<R>(reader: &mut R) -> Result<Vec<String>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ProtocolError::Handshake {
                reason: String::from("connection closed during handshake"),
            });
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            return Ok(lines);
        }
        lines.push(line);
    }
}

/// Performs the server side of the handshake on a fresh connection.
///
/// # Errors
///
/// Returns [`ProtocolError::Handshake`] if the request carries no
/// `Sec-WebSocket-Key` header, and I/O errors from the transport.
pub async fn server_handshake<R, W>(reader: &mut R, writer: &mut W) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let lines = read_headers(reader).await?;

    let key = lines
        .iter()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("sec-websocket-key")
                .then(|| value.trim().to_string())
        })
        .ok_or_else(|| ProtocolError::Handshake {
            reason: String::from("missing Sec-WebSocket-Key header"),
        })?;

    trace!(%key, "Accepting WebSocket upgrade");

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Performs the client side of the handshake.
///
/// # Errors
///
/// Returns [`ProtocolError::Handshake`] if the server does not answer
/// with a `101` status.
pub async fn client_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    host: &str,
    port: u16,
) -> Result<(), ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = format!(
        "GET / HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {CLIENT_NONCE}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    writer.write_all(request.as_bytes()).await?;
    writer.flush().await?;

    let lines = read_headers(reader).await?;
    let status = lines.first().map(String::as_str).unwrap_or("");
    if !status.contains(" 101 ") && !status.ends_with(" 101") {
        return Err(ProtocolError::Handshake {
            reason: format!("unexpected status line: {status}"),
        });
    }
    Ok(())
}

/// Reads one WebSocket frame and returns its unmasked payload.
///
/// Returns `Ok(None)` when a close frame (opcode 0x8) arrives. Masked
/// payloads are XOR-decoded with `mask_key[i mod 4]` regardless of the key
/// value.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] above the 16 MiB cap, and
/// I/O errors (including EOF) from the transport.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let opcode = header[0] & 0x0F;
    let masked = header[1] & 0x80 != 0;

    let len = match header[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext)
        }
        inline => inline as u64,
    };

    if len > MAX_PAYLOAD as u64 {
        return Err(ProtocolError::PayloadTooLarge { len: len as usize });
    }

    let mask_key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    if opcode == OPCODE_CLOSE {
        trace!("Received close frame");
        return Ok(None);
    }

    Ok(Some(payload))
}

/// Writes one binary frame with FIN=1.
///
/// When `mask` is set (client role) a zero masking key is carried; the
/// payload bytes are then unchanged on the wire.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] above the 16 MiB cap, and
/// I/O errors from the transport.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    mask: bool,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge { len: payload.len() });
    }

    let mut header = Vec::with_capacity(14);
    header.push(0x80 | OPCODE_BINARY);

    let mask_bit = if mask { 0x80 } else { 0x00 };
    match payload.len() {
        n if n < 126 => header.push(mask_bit | n as u8),
        n if n < 65536 => {
            header.push(mask_bit | 126);
            header.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            header.push(mask_bit | 127);
            header.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    if mask {
        header.extend_from_slice(&[0, 0, 0, 0]);
    }

    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
