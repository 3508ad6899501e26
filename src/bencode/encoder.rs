use super::BencodeValue;
use bytes::BufMut;

/// Encode a value canonically (dictionary keys in sorted order).
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    out
}

fn write_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.put_slice(bytes.len().to_string().as_bytes());
    out.put_u8(b':');
    out.put_slice(bytes);
}

fn write_value(value: &BencodeValue, out: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(i) => {
            out.put_u8(b'i');
            out.put_slice(i.to_string().as_bytes());
            out.put_u8(b'e');
        }
        BencodeValue::String(s) => write_bytes(s, out),
        BencodeValue::List(items) => {
            out.put_u8(b'l');
            items.iter().for_each(|item| write_value(item, out));
            out.put_u8(b'e');
        }
        BencodeValue::Dict(dict) => {
            out.put_u8(b'd');
            for (key, value) in dict {
                write_bytes(key, out);
                write_value(value, out);
            }
            out.put_u8(b'e');
        }
    }
}
