use super::value::Value;
use std::io::Write;

/// Encodes a value to its canonical bencode form.
///
/// Dictionary keys are emitted in sorted order, so encoding is
/// deterministic regardless of insertion order.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    // writing to a Vec cannot fail
    let _ = encode_value(value, &mut buf);
    buf
}

fn encode_value<W: Write>(value: &Value, writer: &mut W) -> std::io::Result<()> {
    match value {
        Value::Integer(i) => {
            write!(writer, "i{}e", i)?;
        }
        Value::Bytes(b) => {
            write!(writer, "{}:", b.len())?;
            writer.write_all(b)?;
        }
        Value::List(l) => {
            writer.write_all(b"l")?;
            for item in l {
                encode_value(item, writer)?;
            }
            writer.write_all(b"e")?;
        }
        Value::Dict(d) => {
            writer.write_all(b"d")?;
            for (key, val) in d {
                write!(writer, "{}:", key.len())?;
                writer.write_all(key)?;
                encode_value(val, writer)?;
            }
            writer.write_all(b"e")?;
        }
    }
    Ok(())
}
