//! Length-prefixed JSON framing.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.
//! The same codec serves both directions and any `AsyncRead`/`AsyncWrite`.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Default upper bound for a single frame body.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Frames above this size are logged when encoded.
const LARGE_FRAME_BYTES: usize = 1024 * 1024;

pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    max_frame_length: usize,
    _item: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Frames longer than `max_frame_length` are refused in both directions.
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
            _item: PhantomData,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        let Some(body) = self.frames.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if body.len() > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds limit of {} bytes",
                    body.len(),
                    self.max_frame_length
                ),
            ));
        }
        if body.len() > LARGE_FRAME_BYTES {
            tracing::debug!(frame_kb = body.len() / 1024, "Encoding large frame");
        }
        self.frames.encode(Bytes::from(body), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ClientFrame, JobId, JobProgress, ServerFrame};

    #[test]
    fn decodes_call_frame_written_by_encoder() {
        let mut codec = JsonCodec::<ClientFrame>::new();
        let mut buf = BytesMut::new();

        let frame = ClientFrame::Call {
            job_id: JobId::new(5),
            method: "get_data_stores".to_string(),
            args: vec![],
        };
        codec.encode(frame, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        match decoded {
            ClientFrame::Call {
                job_id,
                method,
                args,
            } => {
                assert_eq!(job_id, JobId::new(5));
                assert_eq!(method, "get_data_stores");
                assert!(args.is_empty());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn server_frame_decodes_as_generic_json() {
        // The client reads frames as plain JSON first so that unknown shapes
        // can be dropped without tearing down the stream.
        let mut encoder = JsonCodec::<ServerFrame>::new();
        let mut decoder = JsonCodec::<serde_json::Value>::new();
        let mut buf = BytesMut::new();

        encoder
            .encode(
                ServerFrame::Progress {
                    job_id: JobId::new(1),
                    payload: JobProgress::new("scanning").with_fraction(0.5),
                },
                &mut buf,
            )
            .unwrap();
        let value = decoder.decode(&mut buf).unwrap().unwrap();

        assert_eq!(value["type"], "progress");
        assert_eq!(value["payload"]["fraction"], 0.5);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<ServerFrame>::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                ServerFrame::Cancelled {
                    job_id: JobId::new(2),
                },
                &mut full,
            )
            .unwrap();

        let mut partial = full.split_to(full.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert!(matches!(decoded, ServerFrame::Cancelled { .. }));
    }

    #[test]
    fn invalid_json_is_invalid_data() {
        let mut raw = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::from_static(b"not json"), &mut buf).unwrap();

        let mut codec = JsonCodec::<serde_json::Value>::new();
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonCodec::<serde_json::Value>::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(serde_json::json!({"label": "this body is longer than sixteen bytes"}), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
