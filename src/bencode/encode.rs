use std::io::Write;

use super::error::BencodeError;
use super::value::Value;

/// Encodes a value to canonical bencode.
///
/// Dictionary keys are emitted in ascending byte order, which the
/// `BTreeMap` representation guarantees.
pub fn encode(value: &Value) -> Result<Vec<u8>, BencodeError> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf)?;
    Ok(buf)
}

fn encode_into<W: Write>(value: &Value, out: &mut W) -> Result<(), BencodeError> {
    match value {
        Value::Integer(i) => write!(out, "i{i}e")?,
        Value::Bytes(b) => {
            write!(out, "{}:", b.len())?;
            out.write_all(b)?;
        }
        Value::List(items) => {
            out.write_all(b"l")?;
            for item in items {
                encode_into(item, out)?;
            }
            out.write_all(b"e")?;
        }
        Value::Dict(entries) => {
            out.write_all(b"d")?;
            for (key, val) in entries {
                write!(out, "{}:", key.len())?;
                out.write_all(key)?;
                encode_into(val, out)?;
            }
            out.write_all(b"e")?;
        }
    }
    Ok(())
}
