use bytes::BufMut;

use super::Value;

/// Encode a value, dictionaries are written in their own key order.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

pub fn encode_into<B: BufMut>(value: &Value, buf: &mut B) {
    match value {
        Value::Int(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => write_bytes(b, buf),
        Value::List(list) => {
            buf.put_u8(b'l');
            for v in list {
                encode_into(v, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(dict) => {
            buf.put_u8(b'd');
            for (k, v) in dict.iter() {
                write_bytes(k, buf);
                encode_into(v, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

fn write_bytes<B: BufMut>(b: &[u8], buf: &mut B) {
    buf.put_slice(b.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(b);
}
