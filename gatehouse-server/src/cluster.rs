//! Cluster-plane wire protocol between workers and controllers.
//!
//! Wire format: 4-byte big-endian length prefix followed by a JSON payload.
//! The cluster plane carries only enrollment and attachment traffic; proxied
//! session data never flows here.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use gatehouse_auth::WorkerCertificate;

/// Maximum frame size (1 MB). Enrollment messages are tiny; anything larger
/// is a protocol violation.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors crossing the cluster plane.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClusterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Read a length-delimited frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes, ClusterError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ClusterError::FrameTooLarge(len));
    }

    let mut buf = BytesMut::with_capacity(len);
    buf.resize(len, 0);
    reader.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}

/// Write a length-delimited frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ClusterError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ClusterError::FrameTooLarge(data.len()));
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message.
pub async fn read_message<T: DeserializeOwned, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<T, ClusterError> {
    let frame = read_frame(reader).await?;
    Ok(serde_json::from_slice(&frame)?)
}

/// Write one framed message.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &T,
) -> Result<(), ClusterError> {
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload).await
}

/// What a worker can ask of an upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerRequest {
    /// Controller-led flow: present a one-time activation token together
    /// with a self-signed auth request proving key possession.
    Activate {
        worker_name: String,
        /// Base64 activation token from the worker's configuration.
        token: String,
        /// Base64 [`gatehouse_auth::AuthRequestToken`].
        request: String,
    },

    /// Worker-led flow: ask whether the published request token has been
    /// approved by an operator yet.
    Complete {
        worker_name: String,
        /// Base64 [`gatehouse_auth::AuthRequestToken`].
        request: String,
    },

    /// Attach as an authorized worker.
    Attach(WorkerHello),
}

/// The worker's advertisement on attach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHello {
    pub name: String,
    pub public_addr: Option<String>,
    pub tags: BTreeMap<String, Vec<String>>,
    pub certificate: WorkerCertificate,
}

/// The controller's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControllerResponse {
    /// Enrollment succeeded; the worker should persist these and retire
    /// whatever token it presented.
    Issued {
        certificate: WorkerCertificate,
        /// Raw issuer public key bytes, for certificate pinning.
        issuer_public_key: Vec<u8>,
    },

    /// Worker-led flow: not approved yet, poll again later.
    Pending,

    /// Enrollment or attach refused. `permanent` distinguishes rejections
    /// that will never succeed on retry (malformed, consumed, expired) from
    /// transient store trouble.
    Rejected { reason: String, permanent: bool },

    /// Attach accepted; the connection stays open as the attachment.
    Attached,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello cluster").await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(&read_frame(&mut cursor).await.unwrap()[..], b"hello cluster");
    }

    #[tokio::test]
    async fn oversized_frame_rejected_on_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(ClusterError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_rejected_on_write() {
        let data = vec![0u8; MAX_FRAME_SIZE + 1];
        let mut buf = Vec::new();
        assert!(matches!(
            write_frame(&mut buf, &data).await,
            Err(ClusterError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_io_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&64u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 10]);
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(ClusterError::Io(_))
        ));
    }

    #[tokio::test]
    async fn message_roundtrip() {
        let request = WorkerRequest::Complete {
            worker_name: "w1".to_string(),
            request: "abc".to_string(),
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &request).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded: WorkerRequest = read_message(&mut cursor).await.unwrap();
        match decoded {
            WorkerRequest::Complete { worker_name, request } => {
                assert_eq!(worker_name, "w1");
                assert_eq!(request, "abc");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_payload_is_codec_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{not json").await.unwrap();
        let mut cursor = Cursor::new(buf);
        let result: Result<WorkerRequest, _> = read_message(&mut cursor).await;
        assert!(matches!(result, Err(ClusterError::Codec(_))));
    }
}
