use bytes::{BufMut, Bytes, BytesMut};

const AMF0_TYPE_NUMBER: u8 = 0x00;
const AMF0_TYPE_STRING: u8 = 0x02;
const AMF0_TYPE_ECMA_ARRAY: u8 = 0x08;
const AMF0_OBJECT_END: [u8; 3] = [0x00, 0x00, 0x09];

/// A metadata property; everything the synthesized onMetaData needs is a
/// number or a short string.
pub enum Amf0Value {
    Number(f64),
    String(String),
}

/// Serialize an `onMetaData` script message body from key/value pairs.
pub fn build_on_metadata(pairs: &[(&str, Amf0Value)]) -> Bytes {
    let mut buf = BytesMut::new();
    put_string(&mut buf, "onMetaData");

    buf.put_u8(AMF0_TYPE_ECMA_ARRAY);
    buf.put_u32(pairs.len() as u32);
    for (key, value) in pairs {
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        match value {
            Amf0Value::Number(n) => {
                buf.put_u8(AMF0_TYPE_NUMBER);
                buf.put_f64(*n);
            }
            Amf0Value::String(s) => {
                buf.put_u8(AMF0_TYPE_STRING);
                buf.put_u16(s.len() as u16);
                buf.put_slice(s.as_bytes());
            }
        }
    }
    buf.put_slice(&AMF0_OBJECT_END);
    buf.freeze()
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u8(AMF0_TYPE_STRING);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}
