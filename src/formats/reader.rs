use glam::{Quat, Vec2, Vec3};

use super::{convert_direction, convert_position, convert_rotation};
use crate::error::ParseError;

/// Little-endian cursor over an asset buffer.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    format: &'static str,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], format: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            format,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn format(&self) -> &'static str {
        self.format
    }

    pub fn invalid(&self, message: impl Into<String>) -> ParseError {
        ParseError::Invalid {
            format: self.format,
            message: message.into(),
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < len {
            return Err(ParseError::Truncated {
                format: self.format,
                offset: self.pos,
                wanted: len - self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ParseError> {
        self.take(len).map(|_| ())
    }

    pub fn expect_magic(&mut self, magic: &[u8; 4]) -> Result<(), ParseError> {
        let found = self.take(4).map_err(|_| ParseError::BadMagic {
            format: self.format,
            found: self.data.to_vec(),
        })?;
        if found != magic {
            return Err(ParseError::BadMagic {
                format: self.format,
                found: found.to_vec(),
            });
        }
        Ok(())
    }

    pub fn u32(&mut self) -> Result<u32, ParseError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn i32(&mut self) -> Result<i32, ParseError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn f32(&mut self) -> Result<f32, ParseError> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a count and checks that at least `min_item_size` bytes per
    /// item remain, so corrupt counts fail fast instead of allocating.
    pub fn count(&mut self, min_item_size: usize) -> Result<usize, ParseError> {
        let offset = self.pos;
        let count = self.u32()? as usize;
        let needed = count.saturating_mul(min_item_size);
        if needed > self.remaining() {
            return Err(ParseError::Truncated {
                format: self.format,
                offset,
                wanted: needed - self.remaining(),
            });
        }
        Ok(count)
    }

    /// Reads a NUL-terminated string.
    pub fn cstring(&mut self) -> Result<String, ParseError> {
        let rest = &self.data[self.pos..];
        let Some(len) = rest.iter().position(|b| *b == 0) else {
            return Err(ParseError::Truncated {
                format: self.format,
                offset: self.pos,
                wanted: 1,
            });
        };
        let text = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(text)
    }

    pub fn vec2(&mut self) -> Result<Vec2, ParseError> {
        Ok(Vec2::new(self.f32()?, self.f32()?))
    }

    pub fn position3(&mut self) -> Result<Vec3, ParseError> {
        let (x, y, z) = (self.f32()?, self.f32()?, self.f32()?);
        Ok(convert_position(x, y, z))
    }

    pub fn direction3(&mut self) -> Result<Vec3, ParseError> {
        let (x, y, z) = (self.f32()?, self.f32()?, self.f32()?);
        Ok(convert_direction(x, y, z))
    }

    /// Reads a `w, x, y, z` quaternion.
    pub fn rotation(&mut self) -> Result<Quat, ParseError> {
        let (w, x, y, z) = (self.f32()?, self.f32()?, self.f32()?, self.f32()?);
        Ok(convert_rotation(w, x, y, z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_scalars_and_strings() {
        let mut data = Vec::new();
        data.extend_from_slice(&7u32.to_le_bytes());
        data.extend_from_slice(&(-2i32).to_le_bytes());
        data.extend_from_slice(&1.5f32.to_le_bytes());
        data.extend_from_slice(b"bone\0");
        let mut reader = Reader::new(&data, "TEST");
        assert_eq!(reader.u32().unwrap(), 7);
        assert_eq!(reader.i32().unwrap(), -2);
        assert_eq!(reader.f32().unwrap(), 1.5);
        assert_eq!(reader.cstring().unwrap(), "bone");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn truncation_reports_offset() {
        let data = [1u8, 2];
        let mut reader = Reader::new(&data, "TEST");
        match reader.u32() {
            Err(ParseError::Truncated { offset, wanted, .. }) => {
                assert_eq!(offset, 0);
                assert_eq!(wanted, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_count_is_truncation() {
        let data = 1000u32.to_le_bytes();
        let mut reader = Reader::new(&data, "TEST");
        assert!(matches!(
            reader.count(4),
            Err(ParseError::Truncated { .. })
        ));
    }

    #[test]
    fn unterminated_string_is_truncation() {
        let mut reader = Reader::new(b"abc", "TEST");
        assert!(reader.cstring().is_err());
    }
}
