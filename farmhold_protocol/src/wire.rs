// Field codec for packet bodies.
//
// Every field type is written in a fixed big-endian layout with no padding
// and no self-description; both sides must agree on the field list for a
// packet id, which is what the registry's signature check enforces.
//
// Layout rules:
// - integers: fixed-width big-endian
// - bool: one byte, strictly 0 or 1
// - f32: IEEE-754 bit pattern as a big-endian u32
// - String: u32 byte count, then UTF-8 bytes
// - Vec<T>: u32 element count, then each element
// - BTreeMap<K, V>: u32 entry count, then key/value pairs in key order

use std::collections::BTreeMap;

use thiserror::Error;

/// Decode failure for a packet body. Decoding is strict: any leftover
/// malformed byte poisons the whole packet, which is then dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload truncated: wanted {wanted} more bytes, {remaining} left")]
    Truncated { wanted: usize, remaining: usize },
    #[error("invalid bool byte {0:#04x}")]
    InvalidBool(u8),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown discriminant {value} for {kind}")]
    UnknownDiscriminant { kind: &'static str, value: i32 },
}

/// Growable buffer packet bodies are encoded into.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_i8(&mut self, value: i8) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    pub fn put_f32(&mut self, value: f32) {
        self.put_u32(value.to_bits());
    }

    #[expect(clippy::cast_possible_truncation)]
    pub fn put_str(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }
}

/// Cursor over a packet body being decoded. All reads are bounds-checked.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if count > self.remaining() {
            return Err(DecodeError::Truncated {
                wanted: count,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn take_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take_bytes(1)?[0])
    }

    pub fn take_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.take_bytes(1)?[0] as i8)
    }

    pub fn take_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn take_i16(&mut self) -> Result<i16, DecodeError> {
        let bytes = self.take_bytes(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn take_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn take_i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.take_bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn take_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    pub fn take_i64(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn take_bool(&mut self) -> Result<bool, DecodeError> {
        match self.take_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }

    pub fn take_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_bits(self.take_u32()?))
    }

    pub fn take_str(&mut self) -> Result<String, DecodeError> {
        let len = self.take_u32()? as usize;
        let bytes = self.take_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }
}

/// A value that can be encoded into and decoded from a packet body.
pub trait Wire: Sized + 'static {
    fn put(&self, writer: &mut WireWriter);
    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError>;
}

macro_rules! impl_wire_scalar {
    ($($ty:ty => $put:ident / $take:ident),+ $(,)?) => {
        $(
            impl Wire for $ty {
                fn put(&self, writer: &mut WireWriter) {
                    writer.$put(*self);
                }

                fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
                    reader.$take()
                }
            }
        )+
    };
}

impl_wire_scalar! {
    u8 => put_u8 / take_u8,
    i8 => put_i8 / take_i8,
    u16 => put_u16 / take_u16,
    i16 => put_i16 / take_i16,
    u32 => put_u32 / take_u32,
    i32 => put_i32 / take_i32,
    u64 => put_u64 / take_u64,
    i64 => put_i64 / take_i64,
    bool => put_bool / take_bool,
    f32 => put_f32 / take_f32,
}

impl Wire for String {
    fn put(&self, writer: &mut WireWriter) {
        writer.put_str(self);
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        reader.take_str()
    }
}

impl<T: Wire> Wire for Vec<T> {
    #[expect(clippy::cast_possible_truncation)]
    fn put(&self, writer: &mut WireWriter) {
        writer.put_u32(self.len() as u32);
        for item in self {
            item.put(writer);
        }
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let count = reader.take_u32()? as usize;
        // Every element takes at least one byte, so a count beyond the
        // remaining payload is malformed. Checked before allocating.
        if count > reader.remaining() {
            return Err(DecodeError::Truncated {
                wanted: count,
                remaining: reader.remaining(),
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::take(reader)?);
        }
        Ok(items)
    }
}

impl<K: Wire + Ord, V: Wire> Wire for BTreeMap<K, V> {
    #[expect(clippy::cast_possible_truncation)]
    fn put(&self, writer: &mut WireWriter) {
        writer.put_u32(self.len() as u32);
        for (key, value) in self {
            key.put(writer);
            value.put(writer);
        }
    }

    fn take(reader: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let count = reader.take_u32()? as usize;
        if count > reader.remaining() {
            return Err(DecodeError::Truncated {
                wanted: count,
                remaining: reader.remaining(),
            });
        }
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = K::take(reader)?;
            let value = V::take(reader)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}
