//! Git pkt-line framing.
//!
//! Each frame is a 4-hex-digit length (covering the length bytes
//! themselves) followed by the payload; `0000` is a flush packet.

use bytes::{Buf, Bytes, BytesMut};

/// Largest legal frame, header included. Payloads top out at 65520 bytes.
pub const MAX_FRAME_LEN: usize = 65524;

/// Smallest legal non-flush frame (an empty payload).
pub const MIN_FRAME_LEN: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The 4-byte header was not valid hex or was out of bounds.
    #[error("invalid packet length: {0}")]
    InvalidLength(String),

    /// Payload too large to frame (> 65520 bytes).
    #[error("payload of {0} bytes exceeds pkt-line maximum")]
    Oversized(usize),
}

/// A decoded pkt-line frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A data frame carrying the payload (length header stripped).
    Data(Bytes),
    /// The `0000` flush packet.
    Flush,
}

/// Encode a payload as a pkt-line. `None` yields a flush packet.
pub fn encode(payload: Option<&[u8]>) -> Result<Vec<u8>, ProtocolError> {
    match payload {
        None => Ok(b"0000".to_vec()),
        Some(p) => {
            let len = p.len() + 4;
            if len > MAX_FRAME_LEN {
                return Err(ProtocolError::Oversized(p.len()));
            }
            let mut out = Vec::with_capacity(len);
            out.extend_from_slice(format!("{len:04x}").as_bytes());
            out.extend_from_slice(p);
            Ok(out)
        }
    }
}

/// Incremental pkt-line decoder over an accumulation buffer.
///
/// `decode` consumes at most one complete frame per call and leaves
/// partial frames in the buffer, so it can be driven directly from a
/// socket read loop.
#[derive(Debug, Default)]
pub struct Decoder;

impl Decoder {
    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A malformed or
    /// out-of-bounds length header is a protocol error; the caller is
    /// expected to terminate the connection.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let header = &buf[..4];
        let len = std::str::from_utf8(header)
            .ok()
            .and_then(|s| usize::from_str_radix(s, 16).ok())
            .ok_or_else(|| ProtocolError::InvalidLength(String::from_utf8_lossy(header).into()))?;

        if len == 0 {
            buf.advance(4);
            return Ok(Some(Frame::Flush));
        }

        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(ProtocolError::InvalidLength(
                String::from_utf8_lossy(header).into(),
            ));
        }

        if buf.len() < len {
            return Ok(None);
        }

        let mut frame = buf.split_to(len);
        frame.advance(4);
        Ok(Some(Frame::Data(frame.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_all(bytes: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        let decoder = Decoder;
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn encode_flush() {
        assert_eq!(encode(None).unwrap(), b"0000");
    }

    #[test]
    fn encode_known_payloads() {
        // "# service=git-upload-pack\n" is 26 bytes, 30 = 0x1e framed
        let pkt = encode(Some(b"# service=git-upload-pack\n")).unwrap();
        assert!(pkt.starts_with(b"001e"));

        let pkt = encode(Some(b"git-upload-pack /public.git\0host=x\0\0")).unwrap();
        assert_eq!(pkt.len(), 36 + 4);
        assert!(pkt.starts_with(format!("{:04x}", 36 + 4).as_bytes()));
    }

    #[test]
    fn encode_rejects_oversized() {
        let big = vec![0u8; 65521];
        assert_eq!(encode(Some(&big)), Err(ProtocolError::Oversized(65521)));
    }

    #[test]
    fn decode_flush_and_data() {
        let frames = decode_all(b"0000000acall \0it0000").unwrap();
        assert_eq!(
            frames,
            vec![
                Frame::Flush,
                Frame::Data(Bytes::from_static(b"call \0it")),
                Frame::Flush,
            ]
        );
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let decoder = Decoder;
        let mut buf = BytesMut::from(&b"000a"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"abc");
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"def");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::Data(Bytes::from_static(b"abcdef")))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_non_hex_length() {
        let err = decode_all(b"zzzzwhatever").unwrap_err();
        assert_eq!(err, ProtocolError::InvalidLength("zzzz".into()));
    }

    #[test]
    fn decode_rejects_out_of_bounds_lengths() {
        // 1..=3 are below the header size
        assert!(decode_all(b"0001").is_err());
        assert!(decode_all(b"0003").is_err());
        // 0xfff5 = 65525 is one past the maximum
        assert!(decode_all(b"fff5").is_err());
    }

    #[test]
    fn decode_accepts_maximum_frame() {
        let payload = vec![b'x'; 65520];
        let wire = encode(Some(&payload)).unwrap();
        let frames = decode_all(&wire).unwrap();
        assert_eq!(frames, vec![Frame::Data(Bytes::from(payload))]);
    }

    proptest! {
        #[test]
        fn roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..=65520)) {
            let wire = encode(Some(&payload)).unwrap();
            prop_assert_eq!(wire.len(), payload.len() + 4);

            let header = std::str::from_utf8(&wire[..4]).unwrap();
            prop_assert_eq!(usize::from_str_radix(header, 16).unwrap(), payload.len() + 4);
            prop_assert!(header.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

            let frames = decode_all(&wire).unwrap();
            prop_assert_eq!(frames, vec![Frame::Data(Bytes::from(payload))]);
        }
    }
}
