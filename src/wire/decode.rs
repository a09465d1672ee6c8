//! Client→server message decoding.
//!
//! Inbound frames are `portId:u16` followed by an argument list in the
//! same two-buffer layout the encoder produces. A malformed frame is
//! fatal to that message only: the decode error is surfaced, the message
//! dropped, and the window left alive.

use super::value::*;
use crate::error::WireError;

/// A decoded client→server message.
#[derive(Debug, Clone, PartialEq)]
pub struct InputMessage {
    pub port: u16,
    pub args: Vec<Value>,
}

/// Cursor over an inbound frame.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.data.len() {
            return Err(WireError::Truncated { offset: self.pos });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i16(&mut self) -> Result<i16, WireError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i32(&mut self) -> Result<i32, WireError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f64(&mut self) -> Result<f64, WireError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }
}

/// Decode one inbound frame into port id + arguments.
pub fn decode_message(data: &[u8]) -> Result<InputMessage, WireError> {
    let mut dec = Decoder::new(data);
    let port = dec.u16()?;

    let sb_len = dec.u16()? as usize;
    let string_buf = dec.take(sb_len)?;

    let argc = dec.u8()? as usize;
    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        args.push(read_value(&mut dec, string_buf, 0)?);
    }
    Ok(InputMessage { port, args })
}

fn read_str(dec: &mut Decoder<'_>, string_buf: &[u8]) -> Result<String, WireError> {
    let offset = dec.u16()? as usize;
    let len = dec.u16()? as usize;
    let bytes = string_buf
        .get(offset..offset + len)
        .ok_or(WireError::BadStringRef)?;
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| WireError::InvalidUtf8)
}

fn read_value(
    dec: &mut Decoder<'_>,
    string_buf: &[u8],
    depth: usize,
) -> Result<Value, WireError> {
    if depth > super::encode::MAX_DEPTH {
        return Err(WireError::Oversize("value nesting"));
    }
    let at = dec.pos;
    let tag = dec.u8()?;
    let value = match tag {
        TAG_NULL => Value::Null,
        TAG_BOOL => Value::Bool(dec.u8()? != 0),
        TAG_INT16 => Value::Int(dec.i16()? as i64),
        TAG_INT32 => Value::Int(dec.i32()? as i64),
        TAG_FLOAT64 => Value::Float(dec.f64()?),
        TAG_STRING => Value::Str(read_str(dec, string_buf)?),
        TAG_HANDLER => Value::Handler(dec.u16()?),
        TAG_ARRAY => {
            let count = dec.u16()? as usize;
            let mut items = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                items.push(read_value(dec, string_buf, depth + 1)?);
            }
            Value::Array(items)
        }
        TAG_OBJECT => {
            let count = dec.u16()? as usize;
            let mut entries = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                let key = read_str(dec, string_buf)?;
                entries.push((key, read_value(dec, string_buf, depth + 1)?));
            }
            Value::Object(entries)
        }
        TAG_BYTES => {
            let len = dec.u32()? as usize;
            Value::Bytes(dec.take(len)?.to_vec())
        }
        TAG_REF => Value::Ref(dec.u16()?, dec.u8()?),
        TAG_CHANNEL => Value::Channel(dec.u16()?),
        TAG_MODULE => Value::Module(dec.u16()?),
        tag => return Err(WireError::UnknownTag { tag, offset: at }),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_values;

    fn roundtrip(args: Vec<Value>) -> Vec<Value> {
        let mut frame = vec![9, 0]; // port 9
        encode_values(&mut frame, &args).unwrap();
        let msg = decode_message(&frame).unwrap();
        assert_eq!(msg.port, 9);
        msg.args
    }

    #[test]
    fn test_roundtrip_scalars() {
        let args = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-3),
            Value::Int(100_000),
            Value::Float(2.75),
            Value::str("héllo"),
            Value::Handler(17),
            Value::Ref(260, 4),
            Value::Channel(2),
            Value::Module(1),
        ];
        assert_eq!(roundtrip(args.clone()), args);
    }

    #[test]
    fn test_roundtrip_nested() {
        let args = vec![Value::Object(vec![
            ("items".into(), Value::Array(vec![Value::Int(1), Value::str("two")])),
            ("meta".into(), Value::Object(vec![("ok".into(), Value::Bool(false))])),
        ])];
        assert_eq!(roundtrip(args.clone()), args);
    }

    #[test]
    fn test_roundtrip_bytes() {
        let args = vec![Value::Bytes(vec![0, 1, 2, 250])];
        assert_eq!(roundtrip(args.clone()), args);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut frame = vec![1, 0];
        encode_values(&mut frame, &[Value::Int(70_000)]).unwrap();
        frame.truncate(frame.len() - 2);
        assert!(matches!(
            decode_message(&frame),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_bad_string_ref_rejected() {
        // port 0, string buf of 2 bytes, one string arg pointing past it.
        let mut frame = vec![0, 0, 2, 0, b'h', b'i', 1, TAG_STRING];
        frame.extend_from_slice(&5u16.to_le_bytes()); // offset 5
        frame.extend_from_slice(&4u16.to_le_bytes()); // len 4
        assert!(matches!(
            decode_message(&frame),
            Err(WireError::BadStringRef)
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let frame = vec![0, 0, 0, 0, 1, 99];
        assert!(matches!(
            decode_message(&frame),
            Err(WireError::UnknownTag { tag: 99, .. })
        ));
    }
}
