//! Argument encoding - the two-buffer value format.
//!
//! An encoded argument blob is laid out as:
//!
//! ```text
//! stringBufLen:u16 | string buffer (UTF-8) | argCount:u8 | tagged values
//! ```
//!
//! String-typed content (string values, object keys) lives in the string
//! buffer and is referenced by `offset:u16, len:u16`, so a string repeated
//! anywhere within one encode call is stored once. The dedup map is
//! per-call and reset at the start of every encode.
//!
//! Integers take the smallest fitting width: int16, then int32, then
//! float64 (see [`super::value`]).

use std::collections::HashMap;

use super::value::*;
use crate::error::WireError;

/// Maximum value-nesting depth accepted on encode (mirrors the decoder).
pub(crate) const MAX_DEPTH: usize = 32;

/// Encode an argument list into `out` using the two-buffer layout.
///
/// `out` is appended to, not cleared; callers stage commands in a scratch
/// buffer they own.
pub fn encode_values(out: &mut Vec<u8>, values: &[Value]) -> Result<(), WireError> {
    if values.len() > u8::MAX as usize {
        return Err(WireError::Oversize("argument count"));
    }

    // Pass 1: collect every distinct string into the string buffer.
    let mut strings: HashMap<&str, (u16, u16)> = HashMap::new();
    let mut string_buf: Vec<u8> = Vec::new();
    for v in values {
        collect_strings(v, &mut strings, &mut string_buf, 0)?;
    }
    if string_buf.len() > u16::MAX as usize {
        return Err(WireError::Oversize("string buffer"));
    }

    // Pass 2: emit.
    out.extend_from_slice(&(string_buf.len() as u16).to_le_bytes());
    out.extend_from_slice(&string_buf);
    out.push(values.len() as u8);
    for v in values {
        write_value(out, v, &strings)?;
    }
    Ok(())
}

fn intern<'v>(
    s: &'v str,
    strings: &mut HashMap<&'v str, (u16, u16)>,
    string_buf: &mut Vec<u8>,
) -> Result<(), WireError> {
    if strings.contains_key(s) {
        return Ok(());
    }
    if s.len() > u16::MAX as usize {
        return Err(WireError::Oversize("string value"));
    }
    let offset = string_buf.len();
    if offset + s.len() > u16::MAX as usize {
        return Err(WireError::Oversize("string buffer"));
    }
    string_buf.extend_from_slice(s.as_bytes());
    strings.insert(s, (offset as u16, s.len() as u16));
    Ok(())
}

fn collect_strings<'v>(
    value: &'v Value,
    strings: &mut HashMap<&'v str, (u16, u16)>,
    string_buf: &mut Vec<u8>,
    depth: usize,
) -> Result<(), WireError> {
    if depth > MAX_DEPTH {
        return Err(WireError::Oversize("value nesting"));
    }
    match value {
        Value::Str(s) => intern(s, strings, string_buf)?,
        Value::Array(items) => {
            for item in items {
                collect_strings(item, strings, string_buf, depth + 1)?;
            }
        }
        Value::Object(entries) => {
            for (key, item) in entries {
                intern(key, strings, string_buf)?;
                collect_strings(item, strings, string_buf, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn write_str_ref(
    out: &mut Vec<u8>,
    s: &str,
    strings: &HashMap<&str, (u16, u16)>,
) -> Result<(), WireError> {
    // Present by construction: pass 1 interned every reachable string.
    let (offset, len) = strings
        .get(s)
        .copied()
        .ok_or(WireError::Oversize("string buffer"))?;
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_value(
    out: &mut Vec<u8>,
    value: &Value,
    strings: &HashMap<&str, (u16, u16)>,
) -> Result<(), WireError> {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
        Value::Int(n) => write_number(out, *n),
        Value::Float(f) => {
            out.push(TAG_FLOAT64);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Value::Str(s) => {
            out.push(TAG_STRING);
            write_str_ref(out, s, strings)?;
        }
        Value::Handler(id) => {
            out.push(TAG_HANDLER);
            out.extend_from_slice(&id.to_le_bytes());
        }
        Value::Array(items) => {
            if items.len() > u16::MAX as usize {
                return Err(WireError::Oversize("array length"));
            }
            out.push(TAG_ARRAY);
            out.extend_from_slice(&(items.len() as u16).to_le_bytes());
            for item in items {
                write_value(out, item, strings)?;
            }
        }
        Value::Object(entries) => {
            if entries.len() > u16::MAX as usize {
                return Err(WireError::Oversize("object length"));
            }
            out.push(TAG_OBJECT);
            out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
            for (key, item) in entries {
                write_str_ref(out, key, strings)?;
                write_value(out, item, strings)?;
            }
        }
        Value::Bytes(bytes) => {
            if bytes.len() > u32::MAX as usize {
                return Err(WireError::Oversize("byte buffer"));
            }
            out.push(TAG_BYTES);
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        Value::Ref(block, target) => {
            out.push(TAG_REF);
            out.extend_from_slice(&block.to_le_bytes());
            out.push(*target);
        }
        Value::Channel(id) => {
            out.push(TAG_CHANNEL);
            out.extend_from_slice(&id.to_le_bytes());
        }
        Value::Module(id) => {
            out.push(TAG_MODULE);
            out.extend_from_slice(&id.to_le_bytes());
        }
    }
    Ok(())
}

/// Pick the smallest width that represents `n`.
fn write_number(out: &mut Vec<u8>, n: i64) {
    if let Ok(v) = i16::try_from(n) {
        out.push(TAG_INT16);
        out.extend_from_slice(&v.to_le_bytes());
    } else if let Ok(v) = i32::try_from(n) {
        out.push(TAG_INT32);
        out.extend_from_slice(&v.to_le_bytes());
    } else {
        out.push(TAG_FLOAT64);
        out.extend_from_slice(&(n as f64).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_width_selection() {
        let mut out = Vec::new();
        encode_values(&mut out, &[Value::Int(5), Value::Int(40_000), Value::Float(1.5)]).unwrap();
        // stringBufLen 0, no strings, 3 args.
        assert_eq!(&out[..2], &[0, 0]);
        assert_eq!(out[2], 3);
        assert_eq!(out[3], TAG_INT16);
        assert_eq!(out[6], TAG_INT32);
        assert_eq!(out[11], TAG_FLOAT64);
    }

    #[test]
    fn test_repeated_strings_stored_once() {
        let mut once = Vec::new();
        encode_values(&mut once, &[Value::str("anchor")]).unwrap();

        let mut twice = Vec::new();
        encode_values(&mut twice, &[Value::str("anchor"), Value::str("anchor")]).unwrap();

        let sb_once = u16::from_le_bytes([once[0], once[1]]);
        let sb_twice = u16::from_le_bytes([twice[0], twice[1]]);
        assert_eq!(sb_once, sb_twice, "string buffer must not grow on repeat");
    }

    #[test]
    fn test_object_keys_share_string_buffer() {
        let mut out = Vec::new();
        encode_values(
            &mut out,
            &[Value::Object(vec![
                ("color".into(), Value::str("color")),
                ("width".into(), Value::Int(3)),
            ])],
        )
        .unwrap();
        let sb_len = u16::from_le_bytes([out[0], out[1]]) as usize;
        // "color" shared between key and value, plus "width".
        assert_eq!(sb_len, "color".len() + "width".len());
    }

    #[test]
    fn test_too_deep_nesting_rejected() {
        let mut v = Value::Null;
        for _ in 0..40 {
            v = Value::Array(vec![v]);
        }
        let mut out = Vec::new();
        assert!(encode_values(&mut out, &[v]).is_err());
    }
}
