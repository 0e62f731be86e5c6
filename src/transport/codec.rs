//! Length-prefixed wire format for session connections.
//!
//! Every message is a 12-byte header followed by its payload:
//!
//! ```text
//! +------+------+-------+----------+-------------+
//! | GAV1 | kind | flags | reserved | length (BE) |
//! |  4   |  1   |   1   |    2     |      4      |
//! +------+------+-------+----------+-------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    clock::PtpTimestamp,
    frames::{AudioFormat, AudioFrame, FourCC, FrameType, MetadataFrame, VideoFrame},
    Error, Result,
};

pub(crate) const MAGIC: &[u8; 4] = b"GAV1";
pub(crate) const HEADER_LEN: usize = 12;
pub(crate) const PROTOCOL_VERSION: u16 = 1;

/// Largest accepted payload: a maximal video frame plus its header fields.
pub(crate) const MAX_PAYLOAD: usize = 100 * 1024 * 1024 + 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub(crate) enum MessageKind {
    Hello = 1,
    Welcome = 2,
    Reject = 3,
    Video = 16,
    Audio = 17,
    Metadata = 18,
    Ping = 32,
    Pong = 33,
    Bye = 48,
}

impl MessageKind {
    pub(crate) fn is_media(self) -> bool {
        matches!(
            self,
            MessageKind::Video | MessageKind::Audio | MessageKind::Metadata
        )
    }
}

/// A message as it travels on the wire. Forwarding code passes these along
/// without decoding the payload.
#[derive(Debug, Clone)]
pub(crate) struct RawMessage {
    pub kind: MessageKind,
    pub flags: u8,
    pub payload: Bytes,
}

impl RawMessage {
    pub(crate) fn new(kind: MessageKind, payload: Bytes) -> Self {
        RawMessage {
            kind,
            flags: 0,
            payload,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = RawMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawMessage>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if &src[..4] != MAGIC {
            return Err(Error::Transport(format!(
                "Bad message magic {:02X?}",
                &src[..4]
            )));
        }
        let kind = MessageKind::try_from(src[4])
            .map_err(|_| Error::Transport(format!("Unknown message kind {}", src[4])))?;
        let flags = src[5];
        let len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(Error::Transport(format!(
                "Message payload of {len} bytes exceeds the {MAX_PAYLOAD} byte limit"
            )));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(RawMessage {
            kind,
            flags,
            payload,
        }))
    }
}

impl Encoder<RawMessage> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > MAX_PAYLOAD {
            return Err(Error::Transport(format!(
                "Refusing to send {} byte payload",
                item.payload.len()
            )));
        }
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_slice(MAGIC);
        dst.put_u8(item.kind.into());
        dst.put_u8(item.flags);
        dst.put_u16(0);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Receiver's opening message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Hello {
    pub version: u16,
    pub receiver_name: String,
    pub color_format: i32,
    pub bandwidth: i32,
    pub allow_video_fields: bool,
}

/// Decoded form of every message kind.
#[derive(Debug, Clone)]
pub(crate) enum Message {
    Hello(Hello),
    Welcome { version: u16, source_name: String },
    Reject { reason: String },
    Video(VideoFrame),
    Audio(AudioFrame),
    Metadata(MetadataFrame),
    Ping { t1: PtpTimestamp },
    Pong {
        t1: PtpTimestamp,
        t2: PtpTimestamp,
        t3: PtpTimestamp,
    },
    Bye,
}

impl Message {
    pub(crate) fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::Welcome { .. } => MessageKind::Welcome,
            Message::Reject { .. } => MessageKind::Reject,
            Message::Video(_) => MessageKind::Video,
            Message::Audio(_) => MessageKind::Audio,
            Message::Metadata(_) => MessageKind::Metadata,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::Bye => MessageKind::Bye,
        }
    }

    pub(crate) fn encode(&self) -> RawMessage {
        let mut buf = BytesMut::new();
        match self {
            Message::Hello(hello) => {
                buf.put_u16(hello.version);
                put_str(&mut buf, &hello.receiver_name);
                buf.put_i32(hello.color_format);
                buf.put_i32(hello.bandwidth);
                buf.put_u8(hello.allow_video_fields as u8);
            }
            Message::Welcome {
                version,
                source_name,
            } => {
                buf.put_u16(*version);
                put_str(&mut buf, source_name);
            }
            Message::Reject { reason } => put_str(&mut buf, reason),
            Message::Video(frame) => {
                buf.reserve(64 + frame.data.len());
                buf.put_i32(frame.width);
                buf.put_i32(frame.height);
                buf.put_u32(frame.fourcc.into());
                buf.put_i32(frame.frame_rate_n);
                buf.put_i32(frame.frame_rate_d);
                buf.put_f32(frame.picture_aspect_ratio);
                buf.put_i32(frame.frame_type.into());
                buf.put_i64(frame.timecode);
                buf.put_i64(frame.timestamp.as_nanos());
                buf.put_i32(frame.line_stride);
                put_opt_str(&mut buf, frame.metadata.as_deref());
                put_bytes(&mut buf, &frame.data);
            }
            Message::Audio(frame) => {
                buf.reserve(64 + frame.data.len());
                buf.put_i32(frame.format.into());
                buf.put_i32(frame.reference_level);
                buf.put_i32(frame.sample_rate);
                buf.put_i32(frame.channels);
                buf.put_i32(frame.samples);
                buf.put_i32(frame.channel_stride);
                buf.put_i64(frame.timestamp.as_nanos());
                buf.put_i64(frame.timecode);
                put_opt_str(&mut buf, frame.metadata.as_deref());
                put_bytes(&mut buf, &frame.data);
            }
            Message::Metadata(frame) => {
                buf.put_i64(frame.timecode);
                put_str(&mut buf, &frame.data);
            }
            Message::Ping { t1 } => buf.put_i64(t1.as_nanos()),
            Message::Pong { t1, t2, t3 } => {
                buf.put_i64(t1.as_nanos());
                buf.put_i64(t2.as_nanos());
                buf.put_i64(t3.as_nanos());
            }
            Message::Bye => {}
        }
        RawMessage::new(self.kind(), buf.freeze())
    }

    pub(crate) fn decode(raw: &RawMessage) -> Result<Message> {
        let mut r = PayloadReader::new(raw.kind, raw.payload.clone());
        let message = match raw.kind {
            MessageKind::Hello => Message::Hello(Hello {
                version: r.u16()?,
                receiver_name: r.string()?,
                color_format: r.i32()?,
                bandwidth: r.i32()?,
                allow_video_fields: r.u8()? != 0,
            }),
            MessageKind::Welcome => Message::Welcome {
                version: r.u16()?,
                source_name: r.string()?,
            },
            MessageKind::Reject => Message::Reject {
                reason: r.string()?,
            },
            MessageKind::Video => {
                let width = r.i32()?;
                let height = r.i32()?;
                let fourcc = FourCC::try_from(r.u32()?)
                    .map_err(|e| Error::Transport(format!("Unknown FourCC 0x{:08X}", e.number)))?;
                let frame = VideoFrame {
                    width,
                    height,
                    fourcc,
                    frame_rate_n: r.i32()?,
                    frame_rate_d: r.i32()?,
                    picture_aspect_ratio: r.f32()?,
                    frame_type: FrameType::try_from(r.i32()?)
                        .map_err(|e| Error::Transport(format!("Unknown frame type {}", e.number)))?,
                    timecode: r.i64()?,
                    timestamp: PtpTimestamp::from_nanos(r.i64()?),
                    line_stride: r.i32()?,
                    metadata: r.opt_string()?,
                    data: r.bytes()?,
                };
                frame
                    .validate()
                    .map_err(|e| Error::Transport(format!("Malformed video frame: {e}")))?;
                Message::Video(frame)
            }
            MessageKind::Audio => {
                let format = AudioFormat::try_from(r.i32()?)
                    .map_err(|e| Error::Transport(format!("Unknown audio format {}", e.number)))?;
                let frame = AudioFrame {
                    format,
                    reference_level: r.i32()?,
                    sample_rate: r.i32()?,
                    channels: r.i32()?,
                    samples: r.i32()?,
                    channel_stride: r.i32()?,
                    timestamp: PtpTimestamp::from_nanos(r.i64()?),
                    timecode: r.i64()?,
                    metadata: r.opt_string()?,
                    data: r.bytes()?,
                };
                frame
                    .validate()
                    .map_err(|e| Error::Transport(format!("Malformed audio frame: {e}")))?;
                Message::Audio(frame)
            }
            MessageKind::Metadata => Message::Metadata(MetadataFrame {
                timecode: r.i64()?,
                data: r.string()?,
            }),
            MessageKind::Ping => Message::Ping {
                t1: PtpTimestamp::from_nanos(r.i64()?),
            },
            MessageKind::Pong => Message::Pong {
                t1: PtpTimestamp::from_nanos(r.i64()?),
                t2: PtpTimestamp::from_nanos(r.i64()?),
                t3: PtpTimestamp::from_nanos(r.i64()?),
            },
            MessageKind::Bye => Message::Bye,
        };
        Ok(message)
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Bounds-checked cursor over a message payload.
struct PayloadReader {
    kind: MessageKind,
    buf: Bytes,
}

impl PayloadReader {
    fn new(kind: MessageKind, buf: Bytes) -> Self {
        Self { kind, buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(Error::Transport(format!(
                "Truncated {:?} message: needed {n} more bytes, {} left",
                self.kind,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    fn f32(&mut self) -> Result<f32> {
        self.need(4)?;
        Ok(self.buf.get_f32())
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::Transport(format!("Invalid UTF-8 in {:?} message: {e}", self.kind)))
    }

    fn opt_string(&mut self) -> Result<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            _ => self.string().map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(message: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(message.encode(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_header_layout() {
        let buf = wire(&Message::Ping {
            t1: PtpTimestamp::from_nanos(5),
        });
        assert_eq!(&buf[..4], b"GAV1");
        assert_eq!(buf[4], 32);
        assert_eq!(&buf[8..12], &[0, 0, 0, 8]);
        assert_eq!(buf.len(), HEADER_LEN + 8);
    }

    #[test]
    fn test_partial_message_waits_for_more() {
        let full = wire(&Message::Metadata(MetadataFrame::with_data("<x/>", 9)));
        let mut partial = BytesMut::from(&full[..HEADER_LEN + 2]);
        assert!(FrameCodec.decode(&mut partial).unwrap().is_none());
        assert!(FrameCodec.decode(&mut BytesMut::from(&full[..5])).unwrap().is_none());

        partial.extend_from_slice(&full[HEADER_LEN + 2..]);
        let raw = FrameCodec.decode(&mut partial).unwrap().unwrap();
        assert!(partial.is_empty());
        match Message::decode(&raw).unwrap() {
            Message::Metadata(frame) => assert_eq!(frame, MetadataFrame::with_data("<x/>", 9)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_magic_is_transport_error() {
        let mut buf = wire(&Message::Bye);
        buf[0] = b'X';
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = wire(&Message::Bye);
        buf[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = wire(&Message::Bye);
        buf[4] = 99;
        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    /// Timing metadata and pixels survive the wire unchanged.
    #[test]
    fn test_video_preserves_timing_and_data() {
        let frame = VideoFrame::builder()
            .resolution(4, 2)
            .frame_rate(30000, 1001)
            .timecode(-123_456)
            .timestamp(PtpTimestamp::from_parts(1_700_000_000, 1))
            .data((0u8..32).collect::<Vec<_>>())
            .metadata("<camera id=\"1\"/>")
            .build();

        let mut buf = wire(&Message::Video(frame.clone()));
        let raw = FrameCodec.decode(&mut buf).unwrap().unwrap();
        let Message::Video(decoded) = Message::decode(&raw).unwrap() else {
            panic!("expected video");
        };
        assert_eq!(decoded.timestamp, frame.timestamp);
        assert_eq!(decoded.timecode, frame.timecode);
        assert_eq!(decoded.data, frame.data);
        assert_eq!(decoded.metadata, frame.metadata);
        assert_eq!((decoded.frame_rate_n, decoded.frame_rate_d), (30000, 1001));
    }

    #[test]
    fn test_truncated_video_is_transport_error() {
        let frame = VideoFrame::builder().resolution(2, 2).build();
        let raw = Message::Video(frame).encode();
        let cut = RawMessage::new(MessageKind::Video, raw.payload.slice(..raw.payload.len() - 1));
        assert!(matches!(Message::decode(&cut), Err(Error::Transport(_))));
    }

    #[test]
    fn test_inconsistent_video_is_transport_error() {
        let mut frame = VideoFrame::builder().resolution(2, 2).build();
        frame.data = frame.data.slice(..4);
        let raw = Message::Video(frame).encode();
        let err = Message::decode(&raw).unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "got {err:?}");
    }

    fn decode_video(mutate: impl FnOnce(&mut VideoFrame)) -> Result<Message> {
        let mut frame = VideoFrame::builder().resolution(2, 2).build();
        mutate(&mut frame);
        Message::decode(&Message::Video(frame).encode())
    }

    fn decode_audio(mutate: impl FnOnce(&mut AudioFrame)) -> Result<Message> {
        let mut frame = AudioFrame::builder().channels(2).samples(4).build();
        mutate(&mut frame);
        Message::decode(&Message::Audio(frame).encode())
    }

    #[test]
    fn test_hostile_video_header_is_transport_error() {
        let cases: [fn(&mut VideoFrame); 5] = [
            |f| f.width = 0x2000_0000,
            |f| f.width = i32::MAX,
            |f| f.line_stride = i32::MIN,
            |f| {
                f.line_stride = i32::MAX;
                f.height = i32::MAX;
            },
            |f| {
                f.fourcc = FourCC::I420;
                f.width = i32::MAX;
                f.line_stride = i32::MAX;
                f.height = i32::MAX;
            },
        ];
        for (i, mutate) in cases.into_iter().enumerate() {
            let err = decode_video(mutate).unwrap_err();
            assert!(matches!(err, Error::Transport(_)), "case {i}: {err:?}");
        }
    }

    #[test]
    fn test_hostile_audio_header_is_transport_error() {
        let cases: [fn(&mut AudioFrame); 3] = [
            |f| f.samples = 0x4000_0000,
            |f| {
                f.samples = i32::MAX;
                f.channels = i32::MAX;
                f.channel_stride = i32::MAX;
            },
            |f| {
                f.format = AudioFormat::Int16Interleaved;
                f.channel_stride = 0;
                f.samples = i32::MAX;
                f.channels = i32::MAX;
            },
        ];
        for (i, mutate) in cases.into_iter().enumerate() {
            let err = decode_audio(mutate).unwrap_err();
            assert!(matches!(err, Error::Transport(_)), "case {i}: {err:?}");
        }
    }

    #[test]
    fn test_hello_round_trip() {
        let hello = Hello {
            version: PROTOCOL_VERSION,
            receiver_name: "desk".into(),
            color_format: 200,
            bandwidth: -10,
            allow_video_fields: false,
        };
        let raw = Message::Hello(hello.clone()).encode();
        match Message::decode(&raw).unwrap() {
            Message::Hello(decoded) => assert_eq!(decoded, hello),
            other => panic!("unexpected {other:?}"),
        }
    }
}
