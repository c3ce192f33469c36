//! Framed codec for the master-worker channel.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (child stdio, pipes, in-memory duplex).

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::bridge::protocol::Envelope;

/// Upper bound on a single frame. Payloads are caller data; anything this
/// large is a bug, not a workload.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Codec that frames envelopes with a 4-byte length prefix and serializes
/// with JSON.
pub struct EnvelopeCodec {
    inner: LengthDelimitedCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let envelope = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = json.len(), "encoding envelope frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{RequestEnvelope, RequestId, ResponseEnvelope, WorkerMode};
    use serde_json::json;

    #[test]
    fn codec_roundtrip_init() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(
                Envelope::Init {
                    mode: WorkerMode::Concurrent,
                },
                &mut buf,
            )
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert!(matches!(
            decoded,
            Envelope::Init {
                mode: WorkerMode::Concurrent
            }
        ));
    }

    #[test]
    fn codec_roundtrip_request_response() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        let id = RequestId::new();
        codec
            .encode(
                Envelope::Request(RequestEnvelope {
                    id,
                    action: "echo".to_string(),
                    data: Some(json!({"x": 1})),
                    timeout: Some(100),
                }),
                &mut buf,
            )
            .unwrap();
        codec
            .encode(
                Envelope::Response(ResponseEnvelope::ok(id, json!("done"))),
                &mut buf,
            )
            .unwrap();

        match codec.decode(&mut buf).unwrap().unwrap() {
            Envelope::Request(req) => assert_eq!(req.id, id),
            other => panic!("wrong variant: {:?}", other),
        }
        match codec.decode(&mut buf).unwrap().unwrap() {
            Envelope::Response(resp) => {
                assert_eq!(resp.id, id);
                assert_eq!(resp.status, 200);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn codec_partial_frame_returns_none() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Envelope::Shutdown, &mut buf).unwrap();
        let full = buf.split();
        let mut partial = BytesMut::from(&full[..full.len() - 2]);

        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn codec_rejects_garbage_payload() {
        let mut encoder = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        encoder
            .encode(Bytes::from_static(b"not json"), &mut buf)
            .unwrap();

        let mut codec = EnvelopeCodec::new();
        assert!(codec.decode(&mut buf).is_err());
    }
}
