//! Framed control channel over any async byte stream.
//!
//! Wraps a socket (or an in-memory duplex in tests) with the
//! `[type][len][payload]` codec from `ndt-proto`.
//!
//! Outgoing frames are encoded into a pending buffer and drained from
//! there. A send dropped part way (session cancel, deadline) leaves the
//! rest of its frame queued, and the next send finishes it first, so the
//! peer only ever sees whole frames.

use std::time::Duration;

use bytes::BytesMut;
use ndt_proto::wire::MAX_PAYLOAD_LEN;
use ndt_proto::{expect_type, Frame, MessageType, ProtocolError, QueueStatus};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("no control message within {0:?}")]
    Timeout(Duration),
    #[error("control connection closed by peer")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<ndt_proto::WireError> for ControlError {
    fn from(e: ndt_proto::WireError) -> Self {
        ControlError::Protocol(e.into())
    }
}

pub struct ControlChannel<S> {
    stream: S,
    buf: BytesMut,
    out: BytesMut,
    max_payload: usize,
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self::with_limit(stream, MAX_PAYLOAD_LEN)
    }

    /// `max_payload` bounds the declared length of incoming frames.
    pub fn with_limit(stream: S, max_payload: usize) -> Self {
        ControlChannel {
            stream,
            buf: BytesMut::with_capacity(1024),
            out: BytesMut::with_capacity(1024),
            max_payload,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Bytes of earlier frames still waiting to be written.
    pub fn pending(&self) -> usize {
        self.out.len()
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), ControlError> {
        frame.encode(&mut self.out)?;
        self.drain().await?;
        tracing::trace!(msg = %frame.msg_type, len = frame.payload.len(), "control send");
        Ok(())
    }

    /// Write out everything pending. `write_all_buf` advances `out` as it
    /// goes, so dropping this future keeps the unwritten tail.
    async fn drain(&mut self) -> Result<(), ControlError> {
        while !self.out.is_empty() {
            self.stream.write_all_buf(&mut self.out).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn send_text(&mut self, msg_type: MessageType, text: &str) -> Result<(), ControlError> {
        self.send(&Frame::text(msg_type, text)).await
    }

    pub async fn send_queue(&mut self, status: QueueStatus) -> Result<(), ControlError> {
        self.send_text(MessageType::SrvQueue, &status.payload()).await
    }

    pub async fn send_error(&mut self, text: &str) -> Result<(), ControlError> {
        self.send_text(MessageType::Error, text).await
    }

    /// Next complete frame, waiting at most `timeout`.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Frame, ControlError> {
        match tokio::time::timeout(timeout, self.recv_frame()).await {
            Ok(res) => res,
            Err(_) => Err(ControlError::Timeout(timeout)),
        }
    }

    /// Next frame, which must be of type `expected`. A `MSG_ERROR` from the
    /// peer surfaces as [`ProtocolError::PeerError`].
    pub async fn recv_expect(
        &mut self,
        expected: MessageType,
        timeout: Duration,
    ) -> Result<Frame, ControlError> {
        let frame = self.recv(timeout).await?;
        if frame.msg_type == MessageType::Error && expected != MessageType::Error {
            return Err(ProtocolError::PeerError(frame.payload_str()).into());
        }
        expect_type(&frame, expected)?;
        Ok(frame)
    }

    async fn recv_frame(&mut self) -> Result<Frame, ControlError> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buf, self.max_payload)? {
                tracing::trace!(msg = %frame.msg_type, len = frame.payload.len(), "control recv");
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(ControlError::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn frames_cross_a_duplex() {
        let (a, b) = tokio::io::duplex(256);
        let mut server = ControlChannel::new(a);
        let mut client = ControlChannel::new(b);

        server.send_text(MessageType::TestPrepare, "3002").await.unwrap();
        server.send_queue(QueueStatus::StartNow).await.unwrap();

        let f = client.recv_expect(MessageType::TestPrepare, WAIT).await.unwrap();
        assert_eq!(f.payload_str(), "3002");
        let f = client.recv(WAIT).await.unwrap();
        assert_eq!(f.msg_type, MessageType::SrvQueue);
        assert_eq!(QueueStatus::parse(&f.payload_str()), Some(QueueStatus::StartNow));
    }

    #[tokio::test]
    async fn large_frame_reassembles_through_small_pipe() {
        let (a, b) = tokio::io::duplex(64);
        let mut server = ControlChannel::new(a);
        let mut client = ControlChannel::new(b);
        let payload = vec![b'x'; 10_000];
        let frame = Frame::new(MessageType::TestMsg, payload.clone());
        let send = tokio::spawn(async move {
            server.send(&frame).await.unwrap();
        });
        let got = client.recv(WAIT).await.unwrap();
        send.await.unwrap();
        assert_eq!(&got.payload[..], &payload[..]);
    }

    #[tokio::test]
    async fn peer_error_and_wrong_type() {
        let (a, b) = tokio::io::duplex(256);
        let mut server = ControlChannel::new(a);
        let mut client = ControlChannel::new(b);
        server.send_error("boom").await.unwrap();
        server.send_text(MessageType::TestStart, "").await.unwrap();

        match client.recv_expect(MessageType::TestMsg, WAIT).await {
            Err(ControlError::Protocol(ProtocolError::PeerError(t))) => assert_eq!(t, "boom"),
            other => panic!("unexpected {other:?}"),
        }
        match client.recv_expect(MessageType::TestMsg, WAIT).await {
            Err(ControlError::Protocol(ProtocolError::UnexpectedType { received, .. })) => {
                assert_eq!(received, MessageType::TestStart)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected() {
        let (mut raw, b) = tokio::io::duplex(256);
        let mut client = ControlChannel::with_limit(b, 16);
        raw.write_all(&[MessageType::TestMsg.as_u8(), 0x01, 0x00]).await.unwrap();
        assert!(matches!(
            client.recv(WAIT).await,
            Err(ControlError::Protocol(ProtocolError::Wire(_)))
        ));
    }

    #[tokio::test]
    async fn interrupted_send_completes_before_next_frame() {
        let (a, b) = tokio::io::duplex(8);
        let mut server = ControlChannel::new(a);
        let mut client = ControlChannel::new(b);

        // Nobody reads yet, so only part of the frame fits in the pipe.
        let interrupted = tokio::time::timeout(
            Duration::from_millis(50),
            server.send_text(MessageType::Login, "v3.7.0-long-version"),
        )
        .await;
        assert!(interrupted.is_err());
        assert!(server.pending() > 0);

        let reader = tokio::spawn(async move {
            let first = client.recv(WAIT).await.unwrap();
            let second = client.recv(WAIT).await.unwrap();
            (first, second)
        });
        server.send_queue(QueueStatus::ServerFault).await.unwrap();
        assert_eq!(server.pending(), 0);

        let (first, second) = reader.await.unwrap();
        assert_eq!(first.msg_type, MessageType::Login);
        assert_eq!(first.payload_str(), "v3.7.0-long-version");
        assert_eq!(second.msg_type, MessageType::SrvQueue);
        assert_eq!(second.payload_str(), "9977");
    }

    #[tokio::test]
    async fn closed_and_timeout() {
        let (a, b) = tokio::io::duplex(256);
        let mut client = ControlChannel::new(b);
        assert!(matches!(
            client.recv(Duration::from_millis(20)).await,
            Err(ControlError::Timeout(_))
        ));
        drop(a);
        assert!(matches!(client.recv(WAIT).await, Err(ControlError::Closed)));
    }
}
