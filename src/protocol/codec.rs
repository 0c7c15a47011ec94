use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::types::RespValue;

/// RESP2 frame codec for node connections.
///
/// Decoding is incremental: a partially buffered frame yields `None` and the
/// cursor is left untouched so the next read resumes from the frame start.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let mut pos = 0usize;
        match parse_value(&src[..], &mut pos)? {
            Some(frame) => {
                src.advance(pos);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<()> {
        write_value(&item, dst);
        Ok(())
    }
}

fn parse_value(src: &[u8], pos: &mut usize) -> Result<Option<RespValue>> {
    if *pos >= src.len() {
        return Ok(None);
    }
    let start = *pos;
    let prefix = src[*pos];
    *pos += 1;

    let line = match read_line(src, pos)? {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };

    match prefix {
        b'+' => Ok(Some(RespValue::SimpleString(Bytes::copy_from_slice(line)))),
        b'-' => Ok(Some(RespValue::Error(Bytes::copy_from_slice(line)))),
        b':' => {
            let value = std::str::from_utf8(line)?
                .parse::<i64>()
                .map_err(|err| anyhow!("invalid integer frame: {err}"))?;
            Ok(Some(RespValue::Integer(value)))
        }
        b'$' => {
            let len = parse_length(line, "bulk string")?;
            if len < 0 {
                return Ok(Some(RespValue::NullBulk));
            }
            let len = len as usize;
            if *pos + len + 2 > src.len() {
                *pos = start;
                return Ok(None);
            }
            let data = Bytes::copy_from_slice(&src[*pos..*pos + len]);
            *pos += len + 2;
            Ok(Some(RespValue::BulkString(data)))
        }
        b'*' => {
            let len = parse_length(line, "array")?;
            if len < 0 {
                return Ok(Some(RespValue::NullArray));
            }
            let mut values = Vec::with_capacity(len as usize);
            for _ in 0..len {
                match parse_value(src, pos)? {
                    Some(value) => values.push(value),
                    None => {
                        *pos = start;
                        return Ok(None);
                    }
                }
            }
            Ok(Some(RespValue::Array(values)))
        }
        other => Err(anyhow!("unsupported RESP prefix '{}'", other as char)),
    }
}

fn parse_length(line: &[u8], kind: &str) -> Result<isize> {
    std::str::from_utf8(line)?
        .parse::<isize>()
        .map_err(|err| anyhow!("invalid {kind} length: {err}"))
}

fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>> {
    let mut idx = *pos;
    while idx + 1 < src.len() {
        if src[idx] == b'\r' && src[idx + 1] == b'\n' {
            let line = &src[*pos..idx];
            *pos = idx + 2;
            return Ok(Some(line));
        }
        idx += 1;
    }
    Ok(None)
}

fn write_value(value: &RespValue, dst: &mut BytesMut) {
    match value {
        RespValue::SimpleString(data) => write_line(b'+', data, dst),
        RespValue::Error(data) => write_line(b'-', data, dst),
        RespValue::Integer(value) => {
            dst.extend_from_slice(b":");
            dst.extend_from_slice(value.to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::BulkString(data) => {
            dst.extend_from_slice(b"$");
            dst.extend_from_slice(data.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        RespValue::NullBulk => dst.extend_from_slice(b"$-1\r\n"),
        RespValue::Array(values) => {
            dst.extend_from_slice(b"*");
            dst.extend_from_slice(values.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            for value in values {
                write_value(value, dst);
            }
        }
        RespValue::NullArray => dst.extend_from_slice(b"*-1\r\n"),
    }
}

fn write_line(prefix: u8, data: &[u8], dst: &mut BytesMut) {
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(raw: &[u8]) -> Vec<RespValue> {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(raw);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).expect("decode") {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn decodes_command_array() {
        let frames = decode_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
        assert_eq!(
            frames,
            vec![RespValue::Array(vec![
                RespValue::bulk("GET"),
                RespValue::bulk("foo"),
            ])]
        );
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);
        assert!(codec.decode(&mut buf).expect("decode").is_none());
        buf.extend_from_slice(b"lo\r\n");
        assert_eq!(
            codec.decode(&mut buf).expect("decode"),
            Some(RespValue::bulk("hello"))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn null_frames_round_trip() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        codec.encode(RespValue::NullBulk, &mut buf).expect("encode");
        codec.encode(RespValue::NullArray, &mut buf).expect("encode");
        assert_eq!(buf.as_ref(), b"$-1\r\n*-1\r\n");
        assert_eq!(
            decode_all(&buf),
            vec![RespValue::NullBulk, RespValue::NullArray]
        );
    }

    #[test]
    fn error_frames_keep_their_text() {
        let frames = decode_all(b"-MOVED 3000 127.0.0.1:7001\r\n");
        assert_eq!(frames, vec![RespValue::error("MOVED 3000 127.0.0.1:7001")]);
    }

    #[test]
    fn rejects_unknown_prefix() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"!3\r\nerr\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
