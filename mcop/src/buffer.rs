//! Wire buffer: append-only writes, an independent read cursor, and patching
//! of fields whose value is only known once the message is complete.
//!
//! All multi-byte values are big-endian.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use tracing::warn;

/// Where a message keeps its total length.
pub const LENGTH_OFFSET: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    contents: Vec<u8>,
    rpos: usize,
    read_error: bool,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(contents: Vec<u8>) -> Self {
        Self {
            contents,
            rpos: 0,
            read_error: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.contents
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.contents
    }

    pub fn size(&self) -> usize {
        self.contents.len()
    }

    pub fn remaining(&self) -> usize {
        self.contents.len() - self.rpos
    }

    /// Sticky: set by the first read past the end.
    pub fn read_error(&self) -> bool {
        self.read_error
    }

    pub fn rewind(&mut self) {
        self.rpos = 0;
    }

    pub fn write_byte(&mut self, value: u8) {
        self.contents.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_byte(value as u8);
    }

    pub fn write_long(&mut self, value: i32) {
        // Writing into a Vec cannot fail
        let _ = self.contents.write_i32::<BigEndian>(value);
    }

    pub fn write_float(&mut self, value: f32) {
        let _ = self.contents.write_u32::<BigEndian>(value.to_bits());
    }

    /// Length prefix counts the terminating NUL, which is written too.
    pub fn write_string(&mut self, value: &str) {
        self.write_long(value.len() as i32 + 1);
        self.contents.extend_from_slice(value.as_bytes());
        self.write_byte(0);
    }

    pub fn write_block(&mut self, data: &[u8]) {
        self.contents.extend_from_slice(data);
    }

    /// Overwrites four bytes at `offset`; the append position is unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the field was not written yet.
    pub fn patch_long(&mut self, offset: usize, value: i32) {
        BigEndian::write_i32(&mut self.contents[offset..offset + 4], value);
    }

    pub fn patch_length(&mut self) {
        let size = self.size() as i32;
        self.patch_long(LENGTH_OFFSET, size);
    }

    fn take(&mut self, len: usize) -> Option<&[u8]> {
        if self.read_error || self.remaining() < len {
            if !self.read_error {
                warn!(
                    "buffer underflow: wanted {len} bytes, {} left",
                    self.remaining()
                );
            }
            self.read_error = true;
            return None;
        }
        let start = self.rpos;
        self.rpos += len;
        Some(&self.contents[start..start + len])
    }

    pub fn read_byte(&mut self) -> u8 {
        self.take(1).map(|b| b[0]).unwrap_or(0)
    }

    pub fn read_bool(&mut self) -> bool {
        self.read_byte() != 0
    }

    pub fn read_long(&mut self) -> i32 {
        self.take(4).map(BigEndian::read_i32).unwrap_or(0)
    }

    pub fn read_float(&mut self) -> f32 {
        self.take(4)
            .map(|b| f32::from_bits(BigEndian::read_u32(b)))
            .unwrap_or(0.0)
    }

    pub fn read_string(&mut self) -> String {
        let len = self.read_long();
        if len <= 0 {
            if len < 0 {
                self.read_error = true;
            }
            return String::new();
        }
        match self.take(len as usize) {
            Some(bytes) => {
                let text = bytes.strip_suffix(&[0]).unwrap_or(bytes);
                String::from_utf8_lossy(text).into_owned()
            }
            None => String::new(),
        }
    }

    pub fn read_block(&mut self, len: usize) -> &[u8] {
        self.take(len).unwrap_or(&[])
    }

    pub fn to_hex(&self) -> String {
        self.contents.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() % 2 != 0 {
            return None;
        }
        let contents = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
            .collect::<Option<Vec<u8>>>()?;
        Some(Self::from_bytes(contents))
    }

    /// `name:hexdata`, the textual form used to embed buffers in strings.
    pub fn to_string_named(&self, name: &str) -> String {
        format!("{name}:{}", self.to_hex())
    }

    pub fn from_string_named(text: &str, name: &str) -> Option<Self> {
        let hex = text.strip_prefix(name)?.strip_prefix(':')?;
        Self::from_hex(hex)
    }
}
