//! Frame codec (§4.1): parses and serializes the nine-octet-header wire
//! frames and enforces the per-type structural invariants from the table in
//! spec §4.1. A single tagged `Frame` enum replaces per-kind class
//! hierarchies, matching the "tagged-variant frame representation" guidance
//! in §9 and the shape of `carllerche-h2`'s `frame::Frame`.

use crate::error::H2Error;
use crate::flags::*;
use crate::types::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::convert::TryFrom;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_LEN: usize = 9;

/// The fixed nine-octet frame header (§6: "Frame layout on the wire").
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    length: u32,
    typ: u8,
    flags: u8,
    stream_id: StreamId,
}

impl FrameHeader {
    fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
        let typ = buf[3];
        let flags = buf[4];
        // high bit reserved, ignored on receipt (§6)
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & (u32::MAX >> 1);
        Self {
            length,
            typ,
            flags,
            stream_id,
        }
    }

    fn write(self, out: &mut BytesMut) {
        out.put_slice(&self.length.to_be_bytes()[1..]);
        out.put_u8(self.typ);
        out.put_u8(self.flags);
        out.put_u32(self.stream_id & (u32::MAX >> 1));
    }
}

/// A fully parsed HTTP/2 frame (§3 "Frame").
#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream_id: NonZeroStreamId,
        end_stream: bool,
        data: Bytes,
    },
    Headers {
        stream_id: NonZeroStreamId,
        end_stream: bool,
        end_headers: bool,
        dependency: Option<(StreamId, bool, u8)>,
        block: Bytes,
    },
    Priority {
        stream_id: NonZeroStreamId,
        dependency: StreamId,
        exclusive: bool,
        weight: u8,
    },
    ResetStream {
        stream_id: NonZeroStreamId,
        error: ErrorType,
    },
    Settings {
        ack: bool,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream_id: NonZeroStreamId,
        end_headers: bool,
        promised_id: StreamId,
        block: Bytes,
    },
    Ping {
        ack: bool,
        data: [u8; 8],
    },
    GoAway {
        last_stream_id: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
    Continuation {
        stream_id: NonZeroStreamId,
        end_headers: bool,
        block: Bytes,
    },
    /// Unrecognized frame type; tolerated and skipped per §3.
    Unknown { stream_id: StreamId },
}

fn strip_padding(flags: u8, padded_bit: u8, mut payload: Bytes) -> Result<Bytes, H2Error> {
    if flags & padded_bit == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(H2Error::FrameFormat("PADDED flag set on empty payload"));
    }
    let pad_len = payload.split_to(1)[0] as usize;
    if pad_len > payload.len() {
        return Err(H2Error::FrameFormat("pad length exceeds remaining payload"));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}

fn nonzero_stream(stream_id: StreamId) -> Result<NonZeroStreamId, H2Error> {
    NonZeroStreamId::new(stream_id).ok_or(H2Error::Protocol("stream id must be non-zero"))
}

impl Frame {
    /// Reads exactly one frame: the nine-octet header, then `length` octets
    /// of payload, applying the per-type validation from §4.1. Returns
    /// `Ok(None)` on a clean EOF before any header bytes arrive.
    pub async fn read_from<R>(io: &mut R, max_frame_size: u32) -> Result<Option<Self>, H2Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        if !read_full_or_eof(io, &mut header_buf).await? {
            return Ok(None);
        }
        let header = FrameHeader::parse(&header_buf);
        if header.length > max_frame_size {
            return Err(H2Error::FrameFormat("frame exceeds max_frame_size"));
        }
        let mut payload = vec![0u8; header.length as usize];
        io.read_exact(&mut payload).await?;
        Self::decode(header, Bytes::from(payload)).map(Some)
    }

    fn decode(header: FrameHeader, payload: Bytes) -> Result<Self, H2Error> {
        match num_traits::FromPrimitive::from_u8(header.typ) {
            Some(FrameType::Data) => Self::decode_data(header, payload),
            Some(FrameType::Headers) => Self::decode_headers(header, payload),
            Some(FrameType::Priority) => Self::decode_priority(header, payload),
            Some(FrameType::ResetStream) => Self::decode_reset_stream(header, payload),
            Some(FrameType::Settings) => Self::decode_settings(header, payload),
            Some(FrameType::PushPromise) => Self::decode_push_promise(header, payload),
            Some(FrameType::Ping) => Self::decode_ping(header, payload),
            Some(FrameType::GoAway) => Self::decode_goaway(header, payload),
            Some(FrameType::WindowUpdate) => Self::decode_window_update(header, payload),
            Some(FrameType::Continuation) => Self::decode_continuation(header, payload),
            None => Ok(Frame::Unknown {
                stream_id: header.stream_id,
            }),
        }
    }

    fn decode_data(header: FrameHeader, payload: Bytes) -> Result<Self, H2Error> {
        let stream_id = nonzero_stream(header.stream_id)?;
        let data = strip_padding(header.flags, DataFlags::PADDED.bits(), payload)?;
        Ok(Frame::Data {
            stream_id,
            end_stream: header.flags & DataFlags::END_STREAM.bits() != 0,
            data,
        })
    }

    fn decode_headers(header: FrameHeader, payload: Bytes) -> Result<Self, H2Error> {
        let stream_id = nonzero_stream(header.stream_id)?;
        let mut payload = strip_padding(header.flags, HeadersFlags::PADDED.bits(), payload)?;
        let dependency = if header.flags & HeadersFlags::PRIORITY.bits() != 0 {
            if payload.len() < 5 {
                return Err(H2Error::FrameFormat("HEADERS priority fields truncated"));
            }
            let raw = payload.get_u32();
            let weight = payload.get_u8();
            Some((raw & (u32::MAX >> 1), raw & (1 << 31) != 0, weight))
        } else {
            None
        };
        Ok(Frame::Headers {
            stream_id,
            end_stream: header.flags & HeadersFlags::END_STREAM.bits() != 0,
            end_headers: header.flags & HeadersFlags::END_HEADERS.bits() != 0,
            dependency,
            block: payload,
        })
    }

    fn decode_priority(header: FrameHeader, mut payload: Bytes) -> Result<Self, H2Error> {
        let stream_id = nonzero_stream(header.stream_id)?;
        if payload.len() != 5 {
            return Err(H2Error::FrameFormat("PRIORITY payload must be 5 octets"));
        }
        let raw = payload.get_u32();
        let weight = payload.get_u8();
        Ok(Frame::Priority {
            stream_id,
            dependency: raw & (u32::MAX >> 1),
            exclusive: raw & (1 << 31) != 0,
            weight,
        })
    }

    fn decode_reset_stream(header: FrameHeader, mut payload: Bytes) -> Result<Self, H2Error> {
        let stream_id = nonzero_stream(header.stream_id)?;
        if payload.len() != 4 {
            return Err(H2Error::FrameFormat("RST_STREAM payload must be 4 octets"));
        }
        let error = error_type_from_u32(payload.get_u32());
        Ok(Frame::ResetStream { stream_id, error })
    }

    fn decode_settings(header: FrameHeader, payload: Bytes) -> Result<Self, H2Error> {
        if header.stream_id != 0 {
            return Err(H2Error::Protocol("SETTINGS must be sent on stream 0"));
        }
        let ack = header.flags & SettingsFlags::ACK.bits() != 0;
        if ack {
            if !payload.is_empty() {
                return Err(H2Error::FrameFormat("SETTINGS ACK must be empty"));
            }
            return Ok(Frame::Settings {
                ack: true,
                params: Vec::new(),
            });
        }
        if payload.len() % 6 != 0 {
            return Err(H2Error::FrameFormat("SETTINGS length must be a multiple of 6"));
        }
        let mut params = Vec::with_capacity(payload.len() / 6);
        for chunk in payload.chunks(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            // unknown settings identifiers are ignored, per spec
            if let Some(param) = num_traits::FromPrimitive::from_u16(id) {
                params.push((param, value));
            }
        }
        Ok(Frame::Settings { ack: false, params })
    }

    fn decode_push_promise(header: FrameHeader, payload: Bytes) -> Result<Self, H2Error> {
        let stream_id = nonzero_stream(header.stream_id)?;
        let mut payload = strip_padding(header.flags, PushPromiseFlags::PADDED.bits(), payload)?;
        if payload.len() < 4 {
            return Err(H2Error::FrameFormat("PUSH_PROMISE payload truncated"));
        }
        let promised_id = payload.get_u32() & (u32::MAX >> 1);
        Ok(Frame::PushPromise {
            stream_id,
            end_headers: header.flags & PushPromiseFlags::END_HEADERS.bits() != 0,
            promised_id,
            block: payload,
        })
    }

    fn decode_ping(header: FrameHeader, payload: Bytes) -> Result<Self, H2Error> {
        if header.stream_id != 0 {
            return Err(H2Error::Protocol("PING must be sent on stream 0"));
        }
        if payload.len() != 8 {
            return Err(H2Error::FrameFormat("PING payload must be 8 octets"));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&payload);
        Ok(Frame::Ping {
            ack: header.flags & PingFlags::ACK.bits() != 0,
            data,
        })
    }

    fn decode_goaway(header: FrameHeader, mut payload: Bytes) -> Result<Self, H2Error> {
        if header.stream_id != 0 {
            return Err(H2Error::Protocol("GOAWAY must be sent on stream 0"));
        }
        if payload.len() < 8 {
            return Err(H2Error::FrameFormat("GOAWAY payload must be at least 8 octets"));
        }
        let last_stream_id = payload.get_u32() & (u32::MAX >> 1);
        let error = error_type_from_u32(payload.get_u32());
        Ok(Frame::GoAway {
            last_stream_id,
            error,
            debug: payload,
        })
    }

    fn decode_window_update(header: FrameHeader, mut payload: Bytes) -> Result<Self, H2Error> {
        if payload.len() != 4 {
            return Err(H2Error::FrameFormat("WINDOW_UPDATE payload must be 4 octets"));
        }
        let increment = payload.get_u32() & (u32::MAX >> 1);
        if increment == 0 {
            // RFC 7540 §6.9: a zero increment on the connection window (id 0)
            // is a connection error of type PROTOCOL_ERROR; on a stream
            // window it stays a (non-flow-control) per-stream error.
            return Err(if header.stream_id == 0 {
                H2Error::Protocol("WINDOW_UPDATE increment must be non-zero")
            } else {
                H2Error::FlowControl {
                    reason: "WINDOW_UPDATE increment must be non-zero",
                    connection_scoped: false,
                }
            });
        }
        Ok(Frame::WindowUpdate {
            stream_id: header.stream_id,
            increment,
        })
    }

    fn decode_continuation(header: FrameHeader, payload: Bytes) -> Result<Self, H2Error> {
        let stream_id = nonzero_stream(header.stream_id)?;
        Ok(Frame::Continuation {
            stream_id,
            end_headers: header.flags & ContinuationFlags::END_HEADERS.bits() != 0,
            block: payload,
        })
    }

    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::ResetStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::Continuation { stream_id, .. } => stream_id.get(),
            Frame::WindowUpdate { stream_id, .. } => *stream_id,
            Frame::Unknown { stream_id } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Serializes this frame and writes it to `io`. The caller is
    /// responsible for ensuring the payload respects the peer's
    /// `max_frame_size` (DATA/HEADERS splitting happens above this layer).
    pub async fn write_into<W>(&self, io: &mut W) -> Result<(), H2Error>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.encode();
        io.write_all(&bytes).await?;
        Ok(())
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + 32);
        out.resize(FRAME_HEADER_LEN, 0);
        let (typ, flags, stream_id) = match self {
            Frame::Data {
                stream_id,
                end_stream,
                data,
            } => {
                out.extend_from_slice(data);
                let flags = if *end_stream { DataFlags::END_STREAM.bits() } else { 0 };
                (FrameType::Data, flags, stream_id.get())
            }
            Frame::Headers {
                stream_id,
                end_stream,
                end_headers,
                dependency,
                block,
            } => {
                let mut flags = 0u8;
                if *end_stream {
                    flags |= HeadersFlags::END_STREAM.bits();
                }
                if *end_headers {
                    flags |= HeadersFlags::END_HEADERS.bits();
                }
                if let Some((dep, exclusive, weight)) = dependency {
                    flags |= HeadersFlags::PRIORITY.bits();
                    let raw = dep | if *exclusive { 1 << 31 } else { 0 };
                    out.put_u32(raw);
                    out.put_u8(*weight);
                }
                out.extend_from_slice(block);
                (FrameType::Headers, flags, stream_id.get())
            }
            Frame::Priority {
                stream_id,
                dependency,
                exclusive,
                weight,
            } => {
                let raw = dependency | if *exclusive { 1 << 31 } else { 0 };
                out.put_u32(raw);
                out.put_u8(*weight);
                (FrameType::Priority, 0, stream_id.get())
            }
            Frame::ResetStream { stream_id, error } => {
                out.put_u32(num_traits::ToPrimitive::to_u32(error).unwrap_or(2));
                (FrameType::ResetStream, 0, stream_id.get())
            }
            Frame::Settings { ack, params } => {
                for (param, value) in params {
                    out.put_u16(num_traits::ToPrimitive::to_u16(param).expect("settings id fits u16"));
                    out.put_u32(*value);
                }
                let flags = if *ack { SettingsFlags::ACK.bits() } else { 0 };
                (FrameType::Settings, flags, 0)
            }
            Frame::PushPromise {
                stream_id,
                end_headers,
                promised_id,
                block,
            } => {
                out.put_u32(promised_id & (u32::MAX >> 1));
                out.extend_from_slice(block);
                let flags = if *end_headers {
                    PushPromiseFlags::END_HEADERS.bits()
                } else {
                    0
                };
                (FrameType::PushPromise, flags, stream_id.get())
            }
            Frame::Ping { ack, data } => {
                out.extend_from_slice(data);
                let flags = if *ack { PingFlags::ACK.bits() } else { 0 };
                (FrameType::Ping, flags, 0)
            }
            Frame::GoAway {
                last_stream_id,
                error,
                debug,
            } => {
                out.put_u32(last_stream_id & (u32::MAX >> 1));
                out.put_u32(num_traits::ToPrimitive::to_u32(error).unwrap_or(2));
                out.extend_from_slice(debug);
                (FrameType::GoAway, 0, 0)
            }
            Frame::WindowUpdate { stream_id, increment } => {
                out.put_u32(increment & (u32::MAX >> 1));
                (FrameType::WindowUpdate, 0, *stream_id)
            }
            Frame::Continuation {
                stream_id,
                end_headers,
                block,
            } => {
                out.extend_from_slice(block);
                let flags = if *end_headers {
                    ContinuationFlags::END_HEADERS.bits()
                } else {
                    0
                };
                (FrameType::Continuation, flags, stream_id.get())
            }
            Frame::Unknown { .. } => return out.freeze(),
        };
        let length = out.len() - FRAME_HEADER_LEN;
        let header = FrameHeader {
            length: u32::try_from(length).expect("frame payload fits u24"),
            typ: num_traits::ToPrimitive::to_u8(&typ).expect("frame type fits u8"),
            flags,
            stream_id,
        };
        let mut header_bytes = BytesMut::with_capacity(FRAME_HEADER_LEN);
        header.write(&mut header_bytes);
        out[..FRAME_HEADER_LEN].copy_from_slice(&header_bytes);
        out.freeze()
    }
}

fn error_type_from_u32(value: u32) -> ErrorType {
    num_traits::FromPrimitive::from_u32(value).unwrap_or(ErrorType::InternalError)
}

/// Reads exactly `buf.len()` bytes, returning `false` if the stream is at
/// EOF before any byte is read (a clean close) rather than erroring.
async fn read_full_or_eof<R>(io: &mut R, buf: &mut [u8]) -> Result<bool, H2Error>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(H2Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame-header",
            )));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let bytes = frame.encode();
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&bytes[..FRAME_HEADER_LEN]);
        let header = FrameHeader::parse(&header);
        Frame::decode(header, Bytes::copy_from_slice(&bytes[FRAME_HEADER_LEN..])).unwrap()
    }

    #[test]
    fn data_roundtrip() {
        let frame = Frame::Data {
            stream_id: NonZeroStreamId::new(1).unwrap(),
            end_stream: true,
            data: Bytes::from_static(b"hello"),
        };
        match roundtrip(frame) {
            Frame::Data { stream_id, end_stream, data } => {
                assert_eq!(stream_id.get(), 1);
                assert!(end_stream);
                assert_eq!(&data[..], b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn settings_ack_is_empty() {
        let frame = Frame::Settings {
            ack: true,
            params: Vec::new(),
        };
        match roundtrip(frame) {
            Frame::Settings { ack, params } => {
                assert!(ack);
                assert!(params.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn settings_bad_length_rejected() {
        let header = FrameHeader {
            length: 5,
            typ: num_traits::ToPrimitive::to_u8(&FrameType::Settings).unwrap(),
            flags: 0,
            stream_id: 0,
        };
        let err = Frame::decode(header, Bytes::from_static(&[0; 5])).unwrap_err();
        assert!(matches!(err, H2Error::FrameFormat(_)));
    }

    #[test]
    fn window_update_zero_increment_rejected() {
        let header = FrameHeader {
            length: 4,
            typ: num_traits::ToPrimitive::to_u8(&FrameType::WindowUpdate).unwrap(),
            flags: 0,
            stream_id: 1,
        };
        let err = Frame::decode(header, Bytes::from_static(&[0, 0, 0, 0])).unwrap_err();
        assert!(matches!(err, H2Error::FlowControl { .. }));
    }

    #[test]
    fn data_on_stream_zero_rejected() {
        let header = FrameHeader {
            length: 0,
            typ: num_traits::ToPrimitive::to_u8(&FrameType::Data).unwrap(),
            flags: 0,
            stream_id: 0,
        };
        let err = Frame::decode(header, Bytes::new()).unwrap_err();
        assert!(matches!(err, H2Error::Protocol(_)));
    }

    #[test]
    fn padded_data_strips_padding() {
        // pad_len=2, data=b"ab", 2 bytes of padding
        let payload = Bytes::from_static(&[2, b'a', b'b', 0, 0]);
        let header = FrameHeader {
            length: payload.len() as u32,
            typ: num_traits::ToPrimitive::to_u8(&FrameType::Data).unwrap(),
            flags: DataFlags::PADDED.bits(),
            stream_id: 1,
        };
        match Frame::decode(header, payload).unwrap() {
            Frame::Data { data, .. } => assert_eq!(&data[..], b"ab"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_type_tolerated() {
        let header = FrameHeader {
            length: 3,
            typ: 0x7f,
            flags: 0,
            stream_id: 9,
        };
        match Frame::decode(header, Bytes::from_static(b"abc")).unwrap() {
            Frame::Unknown { stream_id } => assert_eq!(stream_id, 9),
            other => panic!("unexpected {other:?}"),
        }
    }
}
