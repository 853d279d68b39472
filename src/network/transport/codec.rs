//! Frame reassembly
//!
//! Splits an inbound byte stream into (header, body) frames. The codec only
//! knows the fixed header length; how long the body is comes from a
//! caller-supplied function that inspects the header, so the same codec
//! serves every transport and any header layout.

use crate::network::transport::TransportError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Computes the body length announced by a header, or a framing error
pub type BodySizeFn = Arc<dyn Fn(&[u8]) -> Result<usize, String> + Send + Sync>;

/// One reassembled message: raw header and raw body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Bytes,
    pub body: Bytes,
}

/// Header/body framing state machine
#[derive(Clone)]
pub struct FrameCodec {
    header_len: usize,
    body_size: BodySizeFn,
    /// Header whose body is still outstanding, with the body length
    pending: Option<(Bytes, usize)>,
}

impl FrameCodec {
    pub fn new(header_len: usize, body_size: BodySizeFn) -> Self {
        Self {
            header_len,
            body_size,
            pending: None,
        }
    }

    /// Number of bytes the next call to `on_header`/`on_body` expects
    pub fn expected(&self) -> usize {
        match &self.pending {
            Some((_, len)) => *len,
            None => self.header_len,
        }
    }

    /// Whether a header has been consumed and its body is outstanding
    pub fn awaiting_body(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed a complete header. Returns the frame right away when the header
    /// announces an empty body.
    pub fn on_header(&mut self, header: Bytes) -> Result<Option<Frame>, TransportError> {
        if self.pending.is_some() {
            return Err(TransportError::Framing(
                "header received while a body is outstanding".to_string(),
            ));
        }
        if header.len() != self.header_len {
            return Err(TransportError::Framing(format!(
                "header of {} bytes, expected {}",
                header.len(),
                self.header_len
            )));
        }

        let len = (self.body_size)(&header).map_err(TransportError::Framing)?;
        if len == 0 {
            return Ok(Some(Frame {
                header,
                body: Bytes::new(),
            }));
        }

        self.pending = Some((header, len));
        Ok(None)
    }

    /// Feed the body belonging to the last header
    pub fn on_body(&mut self, body: Bytes) -> Result<Option<Frame>, TransportError> {
        let (header, len) = self
            .pending
            .take()
            .ok_or_else(|| TransportError::Framing("body received without header".to_string()))?;

        if body.len() != len {
            return Err(TransportError::Framing(format!(
                "body of {} bytes, header announced {}",
                body.len(),
                len
            )));
        }

        Ok(Some(Frame { header, body }))
    }
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("header_len", &self.header_len)
            .field("awaiting_body", &self.awaiting_body())
            .finish()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let need = self.expected();
            if src.len() < need {
                src.reserve(need - src.len());
                return Ok(None);
            }

            let chunk = src.split_to(need).freeze();
            let frame = if self.awaiting_body() {
                self.on_body(chunk)?
            } else {
                self.on_header(chunk)?
            };

            if frame.is_some() {
                return Ok(frame);
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.header.len() + item.body.len());
        dst.put_slice(&item.header);
        dst.put_slice(&item.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two-byte header: one marker byte and a one-byte body length
    fn codec() -> FrameCodec {
        FrameCodec::new(
            2,
            Arc::new(|header: &[u8]| {
                if header[0] != 0xAA {
                    return Err("bad marker".to_string());
                }
                Ok(header[1] as usize)
            }),
        )
    }

    #[test]
    fn test_header_then_body() {
        let mut codec = codec();
        assert_eq!(codec.expected(), 2);
        assert!(codec
            .on_header(Bytes::from_static(&[0xAA, 3]))
            .unwrap()
            .is_none());
        assert_eq!(codec.expected(), 3);

        let frame = codec.on_body(Bytes::from_static(b"abc")).unwrap().unwrap();
        assert_eq!(&frame.body[..], b"abc");
        assert!(!codec.awaiting_body());
    }

    #[test]
    fn test_empty_body_completes_on_header() {
        let mut codec = codec();
        let frame = codec
            .on_header(Bytes::from_static(&[0xAA, 0]))
            .unwrap()
            .unwrap();
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_body_without_header_is_error() {
        let mut codec = codec();
        assert!(codec.on_body(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_body_size_error_propagates() {
        let mut codec = codec();
        let err = codec.on_header(Bytes::from_static(&[0x00, 1])).unwrap_err();
        assert!(err.to_string().contains("bad marker"));
    }

    #[test]
    fn test_decoder_handles_split_input() {
        let mut codec = codec();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[0xAA]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[2, b'h']);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[b'i', 0xAA, 0]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.body[..], b"hi");

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(second.body.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_concatenates() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame {
                    header: Bytes::from_static(&[0xAA, 1]),
                    body: Bytes::from_static(b"z"),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], &[0xAA, 1, b'z']);
    }
}
