//! Wire codec
//!
//! Every post-handshake message on either transport is a frame:
//!
//! ```text
//! ┌──────────┬──────────────────┬─────────────────────┐
//! │ Kind (1) │ Length (4 bytes) │ Payload (Length)    │
//! │ 1..=12   │ Big-endian u32   │ JSON text or media  │
//! └──────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! Two exceptions sit outside that framing:
//!
//! - The handshake. The peer writes its claimed identity as raw UTF-8 and
//!   the relay answers with the confirmed identity, also raw. See
//!   [`parse_claimed_identity`] and [`parse_confirmed_identity`].
//! - Relayed media. The relay prefixes the sender identity to the media
//!   payload (`u32 BE len + identity + media`) and reframes it under the
//!   same kind. See [`tag_media`] and [`untag_media`].
//!
//! On a stream, a frame with an unknown kind is consumed and reported, and
//! decoding carries on with the next frame. A declared length above
//! [`MAX_FRAME_LEN`] cannot be skipped safely and ends the stream.

use crate::error::{Error, Result};
use crate::model::kind::MessageKind;

/// Kind byte plus big-endian length
pub const HEADER_LEN: usize = 5;

/// Largest payload accepted on a stream (16 MiB)
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Largest handshake read
pub const HANDSHAKE_READ_LIMIT: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: MessageKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Serialize a structured control record as the frame payload.
    pub fn json<T: serde::Serialize>(kind: MessageKind, record: &T) -> Result<Self> {
        Ok(Self::new(kind, serde_json::to_vec(record)?))
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self.kind, &self.payload)
    }
}

/// Frame `payload` under `kind`.
pub fn encode(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind.as_byte());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn declared_len(header: &[u8]) -> u32 {
    u32::from_be_bytes([header[1], header[2], header[3], header[4]])
}

/// Resumable decoder for a control stream.
///
/// Feed it whatever a read returned; it hands back every complete frame and
/// keeps the partial tail for the next read.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from bytes that arrived together with the handshake.
    pub fn with_remainder(bytes: &[u8]) -> Self {
        Self {
            buf: bytes.to_vec(),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn remainder(&self) -> &[u8] {
        &self.buf
    }

    /// Next complete frame, if one is buffered.
    ///
    /// `Some(Err(MalformedFrame))` means a frame was consumed and dropped;
    /// calling again continues with the following frame.
    /// `Some(Err(FrameTooLarge))` is sticky: the stream cannot be resynchronised.
    pub fn next_frame(&mut self) -> Option<Result<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let len = declared_len(&self.buf);
        if len > MAX_FRAME_LEN {
            return Some(Err(Error::FrameTooLarge(len)));
        }

        let total = HEADER_LEN + len as usize;
        if self.buf.len() < total {
            return None;
        }

        let kind_byte = self.buf[0];
        let payload = self.buf[HEADER_LEN..total].to_vec();
        self.buf.drain(..total);

        Some(MessageKind::try_from(kind_byte).map(|kind| Frame { kind, payload }))
    }

    /// Drain every complete frame currently buffered.
    pub fn decode_available(&mut self) -> Vec<Result<Frame>> {
        let mut out = vec![];
        while let Some(next) = self.next_frame() {
            let fatal = matches!(next, Err(Error::FrameTooLarge(_)));
            out.push(next);
            if fatal {
                break;
            }
        }
        out
    }
}

/// Decode a single datagram. The declared length must match the bytes present.
pub fn decode_datagram(datagram: &[u8]) -> Result<Frame> {
    if datagram.len() < HEADER_LEN {
        return Err(Error::MalformedFrame(format!(
            "datagram of {} bytes is shorter than a frame header",
            datagram.len()
        )));
    }

    let kind = MessageKind::try_from(datagram[0])?;
    let len = declared_len(datagram) as usize;
    let present = datagram.len() - HEADER_LEN;

    if len != present {
        return Err(Error::MalformedFrame(format!(
            "datagram declares {len} payload bytes but carries {present}"
        )));
    }

    Ok(Frame {
        kind,
        payload: datagram[HEADER_LEN..].to_vec(),
    })
}

/// Media as it leaves the relay, attributed to its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedMedia {
    pub kind: MessageKind,
    pub sender: String,
    pub data: Vec<u8>,
}

/// Wrap raw media with the sender tag and reframe it under `kind`.
pub fn tag_media(kind: MessageKind, sender: &str, media: &[u8]) -> Vec<u8> {
    let id = sender.as_bytes();
    let mut payload = Vec::with_capacity(4 + id.len() + media.len());
    payload.extend_from_slice(&(id.len() as u32).to_be_bytes());
    payload.extend_from_slice(id);
    payload.extend_from_slice(media);
    encode(kind, &payload)
}

/// Split a relayed media frame into sender and media bytes.
pub fn untag_media(frame: Frame) -> Result<TaggedMedia> {
    let payload = frame.payload;
    if payload.len() < 4 {
        return Err(Error::MalformedFrame(
            "relayed media is missing its sender tag".to_string(),
        ));
    }

    let id_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let Some(id_end) = 4usize.checked_add(id_len).filter(|end| *end <= payload.len()) else {
        return Err(Error::MalformedFrame(format!(
            "sender tag of {id_len} bytes overruns a {} byte payload",
            payload.len()
        )));
    };

    let sender = std::str::from_utf8(&payload[4..id_end])
        .map_err(|_| Error::MalformedFrame("sender tag is not UTF-8".to_string()))?
        .to_string();

    Ok(TaggedMedia {
        kind: frame.kind,
        sender,
        data: payload[id_end..].to_vec(),
    })
}

/// Strip control characters and surrounding whitespace from an identity.
pub fn sanitize_identity(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parse the relay side of the handshake: the peer's claimed identity.
///
/// Tabs and line breaks are treated as part of the identity text (and later
/// stripped). Any other control byte is where framed traffic begins; those
/// bytes are returned as the remainder for the [`FrameDecoder`].
pub fn parse_claimed_identity(read: &[u8]) -> Result<(String, &[u8])> {
    let split = read
        .iter()
        .position(|b| *b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r'))
        .unwrap_or(read.len());
    parse_identity(read, split)
}

/// Parse the peer side of the handshake: the relay's confirmed identity.
///
/// Confirmed identities are sanitized by the relay, so the first control
/// byte always starts a frame.
pub fn parse_confirmed_identity(read: &[u8]) -> Result<(String, &[u8])> {
    let split = read.iter().position(|b| *b < 0x20).unwrap_or(read.len());
    parse_identity(read, split)
}

fn parse_identity(read: &[u8], split: usize) -> Result<(String, &[u8])> {
    if read.is_empty() {
        return Err(Error::ConnectionLost);
    }

    let (head, rest) = read.split_at(split);
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Handshake("identity is not UTF-8".to_string()))?;

    let identity = sanitize_identity(text);
    if identity.is_empty() {
        return Err(Error::Handshake("empty identity".to_string()));
    }

    Ok((identity, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(frames: &[Frame]) -> Vec<u8> {
        frames.iter().flat_map(Frame::encode).collect()
    }

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::new(MessageKind::Chat, br#"{"msg":"hi"}"#.to_vec()),
            Frame::new(MessageKind::UdpRegister, br#"{"port":40000}"#.to_vec()),
            Frame::new(MessageKind::ScreenStop, Vec::new()),
            Frame::new(MessageKind::FileChunk, vec![0xAB; 65536]),
        ]
    }

    #[test]
    fn header_is_kind_then_big_endian_length() {
        let bytes = encode(MessageKind::ScreenImage, b"abc");
        assert_eq!(bytes, [6, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn whole_stream_decodes_in_one_pass() {
        let frames = sample_frames();
        let mut decoder = FrameDecoder::new();
        decoder.extend(&stream_of(&frames));

        let decoded: Vec<Frame> = decoder
            .decode_available()
            .into_iter()
            .map(|f| f.unwrap())
            .collect();
        assert_eq!(decoded, frames);
        assert!(decoder.remainder().is_empty());
    }

    #[test]
    fn split_points_do_not_change_the_result() {
        let frames = sample_frames();
        let bytes = stream_of(&frames);

        for chunk in [1usize, 2, 4, 5, 7, 13, 4096] {
            let mut decoder = FrameDecoder::new();
            let mut decoded = vec![];
            for piece in bytes.chunks(chunk) {
                decoder.extend(piece);
                decoded.extend(decoder.decode_available().into_iter().map(|f| f.unwrap()));
            }
            assert_eq!(decoded, frames, "chunk size {chunk}");
        }
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let bytes = encode(MessageKind::Chat, b"hello");
        let mut decoder = FrameDecoder::new();

        decoder.extend(&bytes[..3]);
        assert!(decoder.next_frame().is_none());
        decoder.extend(&bytes[3..7]);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.remainder(), &bytes[..7]);

        decoder.extend(&bytes[7..]);
        assert_eq!(
            decoder.next_frame().unwrap().unwrap().payload,
            b"hello".to_vec()
        );
    }

    #[test]
    fn unknown_kind_is_skipped_and_decoding_continues() {
        let mut bytes = vec![42, 0, 0, 0, 2, b'x', b'y'];
        bytes.extend(encode(MessageKind::Chat, b"ok"));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        let out = decoder.decode_available();

        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Err(Error::MalformedFrame(_))));
        assert_eq!(out[1].as_ref().unwrap().kind, MessageKind::Chat);
    }

    #[test]
    fn oversized_length_stops_the_stream() {
        let mut bytes = vec![1];
        bytes.extend((MAX_FRAME_LEN + 1).to_be_bytes());
        bytes.extend(encode(MessageKind::Chat, b"never"));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);
        let out = decoder.decode_available();

        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(Error::FrameTooLarge(_))));
    }

    #[test]
    fn datagram_length_must_match() {
        let good = encode(MessageKind::VideoStream, b"jpeg");
        assert_eq!(decode_datagram(&good).unwrap().payload, b"jpeg".to_vec());

        let mut long = good.clone();
        long.push(0);
        assert!(matches!(decode_datagram(&long), Err(Error::MalformedFrame(_))));

        let short = &good[..good.len() - 1];
        assert!(matches!(decode_datagram(short), Err(Error::MalformedFrame(_))));

        assert!(matches!(decode_datagram(&[10, 0]), Err(Error::MalformedFrame(_))));
        assert!(matches!(
            decode_datagram(&[99, 0, 0, 0, 0]),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn media_tag_carries_sender_and_bytes() {
        let wire = tag_media(MessageKind::AudioStream, "alice", &[1, 2, 3]);
        assert_eq!(&wire[5..9], &5u32.to_be_bytes());
        assert_eq!(&wire[9..14], b"alice");

        let tagged = untag_media(decode_datagram(&wire).unwrap()).unwrap();
        assert_eq!(tagged.kind, MessageKind::AudioStream);
        assert_eq!(tagged.sender, "alice");
        assert_eq!(tagged.data, vec![1, 2, 3]);
    }

    #[test]
    fn truncated_sender_tag_is_malformed() {
        let frame = Frame::new(MessageKind::VideoStream, vec![0, 0, 0, 9, b'a']);
        assert!(matches!(untag_media(frame), Err(Error::MalformedFrame(_))));

        let frame = Frame::new(MessageKind::VideoStream, vec![0, 0]);
        assert!(matches!(untag_media(frame), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn claimed_identity_is_trimmed() {
        let (id, rest) = parse_claimed_identity(b"  alice\r\n").unwrap();
        assert_eq!(id, "alice");
        assert!(rest.is_empty());
    }

    #[test]
    fn claimed_identity_splits_off_pipelined_frames() {
        let mut read = b"bob".to_vec();
        let frame = encode(MessageKind::UdpRegister, br#"{"port":1}"#);
        read.extend(&frame);

        let (id, rest) = parse_claimed_identity(&read).unwrap();
        assert_eq!(id, "bob");
        assert_eq!(rest, frame.as_slice());
    }

    #[test]
    fn confirmed_identity_splits_at_any_control_byte() {
        let mut read = "zoë_1".as_bytes().to_vec();
        let frame = encode(MessageKind::UserLeave, br#"{"user":"x"}"#);
        read.extend(&frame);

        let (id, rest) = parse_confirmed_identity(&read).unwrap();
        assert_eq!(id, "zoë_1");
        assert_eq!(rest, frame.as_slice());
    }

    #[test]
    fn bad_identities_fail_the_handshake() {
        assert!(matches!(parse_claimed_identity(b""), Err(Error::ConnectionLost)));
        assert!(matches!(parse_claimed_identity(b"   "), Err(Error::Handshake(_))));
        assert!(matches!(
            parse_claimed_identity(&[0xff, 0xfe]),
            Err(Error::Handshake(_))
        ));
    }
}
