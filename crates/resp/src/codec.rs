//! `tokio_util` codec for RESP2.
//!
//! Decoding is incremental: the decoder inspects the buffered bytes without
//! consuming them until a complete frame is available, so a frame split
//! across reads simply yields `Ok(None)` until the rest arrives.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Command, Frame, RespError, Result};

/// Default upper bound on a single buffered frame (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Maximum array nesting accepted by the decoder.
const MAX_DEPTH: usize = 32;

/// Upper bound on speculative `Vec` preallocation for arrays.
const MAX_PREALLOCATED_ITEMS: usize = 1024;

/// Codec decoding [`Frame`]s and encoding [`Command`]s and [`Frame`]s.
#[derive(Debug, Clone)]
pub struct RespCodec {
    max_frame_len: usize,
}

impl Default for RespCodec {
    fn default() -> Self {
        Self { max_frame_len: DEFAULT_MAX_FRAME_LEN }
    }
}

impl RespCodec {
    /// Creates a codec rejecting frames larger than `max_frame_len` bytes.
    #[must_use]
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Returns the configured frame limit.
    #[must_use]
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Decoder for RespCodec {
    type Item = Frame;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match parse_frame(src, 0, 0)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            },
            None if src.len() > self.max_frame_len => {
                Err(RespError::FrameTooLarge { len: src.len(), max: self.max_frame_len })
            },
            None => Ok(None),
        }
    }
}

impl Encoder<Command> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(command.encoded_len());
        write_header(dst, b'*', command.args().len() as i64);
        for part in command.args() {
            write_bulk(dst, part);
        }
        Ok(())
    }
}

impl Encoder<Frame> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        write_frame(dst, &frame);
        Ok(())
    }
}

fn write_frame(dst: &mut BytesMut, frame: &Frame) {
    match frame {
        Frame::Simple(value) => write_line(dst, b'+', value.as_bytes()),
        Frame::Error(message) => write_line(dst, b'-', message.as_bytes()),
        Frame::Integer(value) => write_header(dst, b':', *value),
        Frame::Bulk(Some(data)) => write_bulk(dst, data),
        Frame::Bulk(None) => write_header(dst, b'$', -1),
        Frame::Array(Some(items)) => {
            write_header(dst, b'*', items.len() as i64);
            for item in items {
                write_frame(dst, item);
            }
        },
        Frame::Array(None) => write_header(dst, b'*', -1),
    }
}

fn write_line(dst: &mut BytesMut, prefix: u8, line: &[u8]) {
    dst.put_u8(prefix);
    dst.put_slice(line);
    dst.put_slice(b"\r\n");
}

fn write_header(dst: &mut BytesMut, prefix: u8, value: i64) {
    write_line(dst, prefix, value.to_string().as_bytes());
}

fn write_bulk(dst: &mut BytesMut, data: &[u8]) {
    write_header(dst, b'$', data.len() as i64);
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

/// Attempts to parse one frame starting at `pos`.
///
/// Returns the frame and the offset just past it, or `None` when the buffer
/// ends before the frame does.
fn parse_frame(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(Frame, usize)>> {
    let Some(&prefix) = buf.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };

    match prefix {
        b'+' => Ok(Some((Frame::Simple(utf8(line)?), next))),
        b'-' => Ok(Some((Frame::Error(utf8(line)?), next))),
        b':' => Ok(Some((Frame::Integer(parse_integer(line)?), next))),
        b'$' => {
            let Some(len) = parse_length(line)? else {
                return Ok(Some((Frame::Bulk(None), next)));
            };
            let end = next
                .checked_add(len)
                .ok_or_else(|| protocol("bulk length overflows buffer offset"))?;
            if buf.len() < end.saturating_add(2) {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(protocol("bulk string not terminated by CRLF"));
            }
            let data = Bytes::copy_from_slice(&buf[next..end]);
            Ok(Some((Frame::Bulk(Some(data)), end + 2)))
        },
        b'*' => {
            let Some(count) = parse_length(line)? else {
                return Ok(Some((Frame::Array(None), next)));
            };
            if depth >= MAX_DEPTH {
                return Err(protocol("array nesting too deep"));
            }
            let mut items = Vec::with_capacity(count.min(MAX_PREALLOCATED_ITEMS));
            let mut cursor = next;
            for _ in 0..count {
                match parse_frame(buf, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    },
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(Some(items)), cursor)))
        },
        other => Err(protocol(format!("unexpected type byte 0x{other:02x}"))),
    }
}

/// Finds the CRLF-terminated line starting at `pos`.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(pos..)?;
    let idx = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..idx], pos + idx + 2))
}

fn utf8(line: &[u8]) -> Result<String> {
    String::from_utf8(line.to_vec()).map_err(|_| protocol("line is not valid UTF-8"))
}

fn parse_integer(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| protocol("invalid integer"))
}

/// Parses a bulk/array length; `-1` is the nil marker.
fn parse_length(line: &[u8]) -> Result<Option<usize>> {
    match parse_integer(line)? {
        -1 => Ok(None),
        len if len < 0 => Err(protocol(format!("negative length {len}"))),
        len => usize::try_from(len).map(Some).map_err(|_| protocol("length does not fit in usize")),
    }
}

fn protocol(message: impl Into<String>) -> RespError {
    RespError::Protocol { message: message.into() }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn decode_all(input: &[u8]) -> Vec<Frame> {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).expect("valid input") {
            frames.push(frame);
        }
        assert!(buf.is_empty(), "all input should be consumed");
        frames
    }

    #[test]
    fn decodes_scalars() {
        let frames = decode_all(b"+PONG\r\n-ERR unknown command\r\n:42\r\n$5\r\nhello\r\n$-1\r\n");
        assert_eq!(
            frames,
            vec![
                Frame::simple("PONG"),
                Frame::error("ERR unknown command"),
                Frame::Integer(42),
                Frame::from("hello"),
                Frame::Bulk(None),
            ]
        );
    }

    #[test]
    fn decodes_master_address_reply() {
        let frames = decode_all(b"*2\r\n$9\r\n127.0.0.1\r\n$4\r\n6379\r\n");
        assert_eq!(frames, vec![Frame::array(vec![Frame::from("127.0.0.1"), Frame::from("6379")])]);
    }

    #[test]
    fn decodes_nested_and_nil_arrays() {
        let frames = decode_all(b"*2\r\n*1\r\n:1\r\n*-1\r\n*0\r\n");
        assert_eq!(
            frames,
            vec![
                Frame::array(vec![Frame::array(vec![Frame::Integer(1)]), Frame::Array(None)]),
                Frame::array(vec![]),
            ]
        );
    }

    #[test]
    fn partial_frame_waits_without_consuming() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"*2\r\n$9\r\n127.0.0.1\r\n$4\r\n63"[..]);
        let before = buf.len();

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), before);

        buf.extend_from_slice(b"79\r\n");
        let frame = codec.decode(&mut buf).unwrap().expect("complete frame");
        assert_eq!(frame.into_array().unwrap()[1].as_str(), Some("6379"));
        assert!(buf.is_empty());
    }

    #[test]
    fn bulk_may_contain_crlf() {
        let frames = decode_all(b"$4\r\na\r\nb\r\n");
        assert_eq!(frames, vec![Frame::bulk(&b"a\r\nb"[..])]);
    }

    #[test]
    fn rejects_unknown_type_byte() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"?what\r\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, RespError::Protocol { .. }));
    }

    #[test]
    fn rejects_bad_bulk_terminator() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"$3\r\nfooXY"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(RespError::Protocol { .. })));
    }

    #[test]
    fn rejects_negative_lengths_other_than_nil() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"$-2\r\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(RespError::Protocol { .. })));
    }

    #[test]
    fn rejects_oversized_partial_frame() {
        let mut codec = RespCodec::with_max_frame_len(16);
        let mut buf = BytesMut::from(&b"$100\r\n0123456789012345678901234567"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, RespError::FrameTooLarge { max: 16, .. }));
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from("*1\r\n".repeat(MAX_DEPTH + 1).as_bytes());
        buf.extend_from_slice(b":1\r\n");
        assert!(matches!(codec.decode(&mut buf), Err(RespError::Protocol { .. })));
    }

    #[test]
    fn encodes_command_as_bulk_array() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Command::new("SENTINEL").arg("get-master-addr-by-name").arg("mymaster"), &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &b"*3\r\n$8\r\nSENTINEL\r\n$23\r\nget-master-addr-by-name\r\n$8\r\nmymaster\r\n"[..]
        );
    }

    #[test]
    fn encoded_frames_decode_back() {
        let frame = Frame::array(vec![
            Frame::from("message"),
            Frame::from("+switch-master"),
            Frame::from("mymaster 127.0.0.1 6379 127.0.0.1 6380"),
            Frame::Integer(-3),
            Frame::Bulk(None),
            Frame::error("ERR no"),
            Frame::simple("OK"),
        ]);
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
    }

    proptest! {
        #[test]
        fn decoding_arbitrary_bytes_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut codec = RespCodec::with_max_frame_len(1024);
            let mut buf = BytesMut::from(&data[..]);
            let _ = codec.decode(&mut buf);
        }

        #[test]
        fn split_points_do_not_change_result(split in 0usize..40) {
            let input = b"*2\r\n$9\r\n127.0.0.1\r\n$4\r\n6379\r\n";
            let split = split.min(input.len());
            let mut codec = RespCodec::default();
            let mut buf = BytesMut::from(&input[..split]);
            let early = codec.decode(&mut buf).unwrap();
            buf.extend_from_slice(&input[split..]);
            let frame = match early {
                Some(frame) => frame,
                None => codec.decode(&mut buf).unwrap().expect("complete after second chunk"),
            };
            prop_assert_eq!(frame, Frame::array(vec![Frame::from("127.0.0.1"), Frame::from("6379")]));
        }
    }
}
