//! Length-prefixed JSON frame codec.
//!
//! Wire format: a 4-byte big-endian unsigned length, then that many bytes of
//! UTF-8 JSON. End of stream between frames is a clean shutdown; end of
//! stream inside a frame is a protocol error. A gate never writes non-frame
//! bytes to its output stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame body. Module outputs are JSON documents,
/// not bulk file contents, so anything larger indicates a corrupt stream.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    TooLarge(u32),
    #[error("stream ended mid-frame: {0}")]
    Truncated(String),
    #[error("frame body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Writes one frame: length prefix followed by the serialized message.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame, returning `None` on a clean end of stream (EOF before
/// any prefix byte). EOF after a partial prefix or inside the body is an
/// error: the peer died mid-frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| FrameError::Truncated(e.to_string()))?;

    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{GateRequest, GateResponse};

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let request = GateRequest::Execute {
            id: 7,
            module: "ping".into(),
            params: serde_json::json!({"data": "pong"}),
            check_mode: false,
        };
        write_frame(&mut client, &request).await.unwrap();
        let got: GateRequest = read_frame(&mut server).await.unwrap().unwrap();
        match got {
            GateRequest::Execute { id, module, .. } => {
                assert_eq!(id, 7);
                assert_eq!(module, "ping");
            }
            other => panic!("expected execute, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let got: Option<GateResponse> = read_frame(&mut server).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn eof_inside_body_is_truncated() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Announce a 100-byte body but send only 3 bytes before hanging up.
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        let got: Result<Option<GateResponse>, _> = read_frame(&mut server).await;
        assert!(matches!(got, Err(FrameError::Truncated(_))));
    }

    #[tokio::test]
    async fn oversized_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_LEN + 1).to_be_bytes())
            .await
            .unwrap();
        let got: Result<Option<GateResponse>, _> = read_frame(&mut server).await;
        assert!(matches!(got, Err(FrameError::TooLarge(_))));
    }

    #[tokio::test]
    async fn multiple_frames_in_sequence() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        for id in 0..3u64 {
            let req = GateRequest::Info { id };
            write_frame(&mut client, &req).await.unwrap();
        }
        drop(client);
        let mut seen = Vec::new();
        while let Some(req) = read_frame::<_, GateRequest>(&mut server).await.unwrap() {
            match req {
                GateRequest::Info { id } => seen.push(id),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
