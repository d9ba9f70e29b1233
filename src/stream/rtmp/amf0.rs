//! AMF0 encoding for RTMP command messages

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{AppError, Result};

const NUMBER: u8 = 0x00;
const BOOLEAN: u8 = 0x01;
const STRING: u8 = 0x02;
const OBJECT: u8 = 0x03;
const NULL: u8 = 0x05;
const UNDEFINED: u8 = 0x06;
const ECMA_ARRAY: u8 = 0x08;
const OBJECT_END: u8 = 0x09;
const STRICT_ARRAY: u8 = 0x0a;
const LONG_STRING: u8 = 0x0c;

#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    Null,
    Undefined,
    EcmaArray(Vec<(String, Amf0Value)>),
    StrictArray(Vec<Amf0Value>),
}

impl Amf0Value {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Property lookup on objects and ECMA arrays
    pub fn get(&self, key: &str) -> Option<&Amf0Value> {
        match self {
            Self::Object(props) | Self::EcmaArray(props) => {
                props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Number(n) => {
                buf.put_u8(NUMBER);
                buf.put_f64(*n);
            }
            Self::Boolean(b) => {
                buf.put_u8(BOOLEAN);
                buf.put_u8(u8::from(*b));
            }
            Self::String(s) if s.len() > u16::MAX as usize => {
                buf.put_u8(LONG_STRING);
                buf.put_u32(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Self::String(s) => {
                buf.put_u8(STRING);
                put_short_string(buf, s);
            }
            Self::Object(props) => {
                buf.put_u8(OBJECT);
                put_properties(buf, props);
            }
            Self::Null => buf.put_u8(NULL),
            Self::Undefined => buf.put_u8(UNDEFINED),
            Self::EcmaArray(props) => {
                buf.put_u8(ECMA_ARRAY);
                buf.put_u32(props.len() as u32);
                put_properties(buf, props);
            }
            Self::StrictArray(items) => {
                buf.put_u8(STRICT_ARRAY);
                buf.put_u32(items.len() as u32);
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let marker = take_u8(buf)?;
        match marker {
            NUMBER => {
                need(buf, 8)?;
                Ok(Self::Number(buf.get_f64()))
            }
            BOOLEAN => Ok(Self::Boolean(take_u8(buf)? != 0)),
            STRING => Ok(Self::String(take_short_string(buf)?)),
            LONG_STRING => {
                need(buf, 4)?;
                let len = buf.get_u32() as usize;
                take_utf8(buf, len).map(Self::String)
            }
            OBJECT => take_properties(buf).map(Self::Object),
            NULL => Ok(Self::Null),
            UNDEFINED => Ok(Self::Undefined),
            ECMA_ARRAY => {
                need(buf, 4)?;
                let _count = buf.get_u32();
                take_properties(buf).map(Self::EcmaArray)
            }
            STRICT_ARRAY => {
                need(buf, 4)?;
                let count = buf.get_u32();
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(Self::decode(buf)?);
                }
                Ok(Self::StrictArray(items))
            }
            other => Err(AppError::Connection(format!(
                "unsupported AMF0 marker 0x{:02x}",
                other
            ))),
        }
    }
}

/// Encode a command: name, transaction id, then arguments
pub fn encode_command(name: &str, transaction_id: f64, args: &[Amf0Value]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128);
    Amf0Value::string(name).encode(&mut buf);
    Amf0Value::Number(transaction_id).encode(&mut buf);
    for arg in args {
        arg.encode(&mut buf);
    }
    buf
}

/// Decode every value in a message body
pub fn decode_all(mut data: &[u8]) -> Result<Vec<Amf0Value>> {
    let mut values = Vec::new();
    while !data.is_empty() {
        values.push(Amf0Value::decode(&mut data)?);
    }
    Ok(values)
}

fn put_short_string(buf: &mut BytesMut, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn put_properties(buf: &mut BytesMut, props: &[(String, Amf0Value)]) {
    for (key, value) in props {
        put_short_string(buf, key);
        value.encode(buf);
    }
    buf.put_u16(0);
    buf.put_u8(OBJECT_END);
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(AppError::Connection("truncated AMF0 value".to_string()));
    }
    Ok(())
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_utf8(buf: &mut &[u8], len: usize) -> Result<String> {
    need(buf, len)?;
    let s = String::from_utf8_lossy(&buf[..len]).into_owned();
    buf.advance(len);
    Ok(s)
}

fn take_short_string(buf: &mut &[u8]) -> Result<String> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    take_utf8(buf, len)
}

fn take_properties(buf: &mut &[u8]) -> Result<Vec<(String, Amf0Value)>> {
    let mut props = Vec::new();
    loop {
        let key = take_short_string(buf)?;
        if key.is_empty() && buf.first() == Some(&OBJECT_END) {
            buf.advance(1);
            return Ok(props);
        }
        props.push((key, Amf0Value::decode(buf)?));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_command_wire_format() {
        let buf = encode_command(
            "connect",
            1.0,
            &[Amf0Value::Object(vec![(
                "app".to_string(),
                Amf0Value::string("live"),
            )])],
        );

        let parts: [&[u8]; 8] = [
            &[0x02, 0x00, 0x07],
            b"connect",
            &[0x00, 0x3f, 0xf0, 0, 0, 0, 0, 0, 0],
            &[0x03, 0x00, 0x03],
            b"app",
            &[0x02, 0x00, 0x04],
            b"live",
            &[0x00, 0x00, 0x09],
        ];
        let expected = parts.concat();
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_decode_result_message() {
        let buf = encode_command(
            "_result",
            4.0,
            &[Amf0Value::Null, Amf0Value::Number(1.0)],
        );
        let values = decode_all(&buf).unwrap();
        assert_eq!(values[0].as_str(), Some("_result"));
        assert_eq!(values[1].as_number(), Some(4.0));
        assert_eq!(values[2], Amf0Value::Null);
        assert_eq!(values[3].as_number(), Some(1.0));
    }

    #[test]
    fn test_decode_status_object() {
        let mut buf = BytesMut::new();
        Amf0Value::Object(vec![
            ("level".to_string(), Amf0Value::string("error")),
            (
                "code".to_string(),
                Amf0Value::string("NetConnection.Connect.Rejected"),
            ),
            ("secure".to_string(), Amf0Value::Boolean(true)),
        ])
        .encode(&mut buf);

        let value = Amf0Value::decode(&mut &buf[..]).unwrap();
        assert_eq!(
            value.get("code").and_then(Amf0Value::as_str),
            Some("NetConnection.Connect.Rejected")
        );
        assert_eq!(value.get("secure"), Some(&Amf0Value::Boolean(true)));
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        assert!(Amf0Value::decode(&mut &[0x00, 0x3f][..]).is_err());
        assert!(Amf0Value::decode(&mut &[0x02, 0x00, 0x05, b'a'][..]).is_err());
    }
}
