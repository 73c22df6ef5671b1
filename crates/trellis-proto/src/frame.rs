//! Length-delimited protobuf framing for broker connections.
//!
//! Every frame on the wire is a 4-byte big-endian length prefix followed by
//! one encoded protobuf message. [`ProtoCodec`] layers prost
//! encoding/decoding on top of [`LengthDelimitedCodec`] so both sides can
//! drive a connection as a `Framed` stream of typed frames.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::wire::{ClientFrame, ServerFrame};

/// Upper bound on a single frame. Signaling messages are small; anything
/// near this size indicates a broken or hostile peer.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// A codec that encodes `Tx` frames and decodes `Rx` frames.
pub struct ProtoCodec<Tx, Rx> {
    inner: LengthDelimitedCodec,
    _frames: PhantomData<fn(Tx) -> Rx>,
}

/// What the client speaks: sends [`ClientFrame`], receives [`ServerFrame`].
pub type ClientCodec = ProtoCodec<ClientFrame, ServerFrame>;

/// What the broker speaks: sends [`ServerFrame`], receives [`ClientFrame`].
pub type ServerCodec = ProtoCodec<ServerFrame, ClientFrame>;

impl<Tx, Rx> Default for ProtoCodec<Tx, Rx> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _frames: PhantomData,
        }
    }
}

impl<Tx, Rx> ProtoCodec<Tx, Rx> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<Tx: Message, Rx> Encoder<Tx> for ProtoCodec<Tx, Rx> {
    type Error = FrameError;

    fn encode(&mut self, frame: Tx, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = frame.encode_to_vec();
        self.inner.encode(Bytes::from(body), dst)?;

        Ok(())
    }
}

impl<Tx, Rx: Message + Default> Decoder for ProtoCodec<Tx, Rx> {
    type Item = Rx;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Rx>, FrameError> {
        match self.inner.decode(src)? {
            Some(body) => Ok(Some(Rx::decode(body.freeze())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{client_frame, SubscribeParams};

    fn test_frame() -> ClientFrame {
        ClientFrame {
            seq: 3,
            body: Some(client_frame::Body::Subscribe(SubscribeParams {
                key: vec![0x11; 32],
            })),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();

        let mut buf = BytesMut::new();
        client.encode(test_frame(), &mut buf).unwrap();

        let decoded = server.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, test_frame());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();

        let mut buf = BytesMut::new();
        client.encode(test_frame(), &mut buf).unwrap();

        let tail = buf.split_off(buf.len() - 1);
        assert!(server.decode(&mut buf).unwrap().is_none());

        buf.unsplit(tail);
        assert!(server.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut server = ServerCodec::new();

        // Claim a frame larger than the limit.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((MAX_FRAME_LENGTH as u32) + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(server.decode(&mut buf), Err(FrameError::Io(_))));
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        let mut server = ServerCodec::new();

        // A valid length prefix followed by bytes that are not a valid
        // protobuf message (truncated varint field).
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.extend_from_slice(&[0x08, 0x80]);

        assert!(matches!(server.decode(&mut buf), Err(FrameError::Decode(_))));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();

        let mut buf = BytesMut::new();
        for seq in 1..=3u64 {
            let mut frame = test_frame();
            frame.seq = seq;
            client.encode(frame, &mut buf).unwrap();
        }

        for seq in 1..=3u64 {
            let frame = server.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.seq, seq);
        }
        assert!(server.decode(&mut buf).unwrap().is_none());
    }
}
