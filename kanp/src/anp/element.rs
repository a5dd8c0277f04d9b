use crate::error::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

pub const TAG_U32: u8 = 1;
pub const TAG_U64: u8 = 2;
pub const TAG_STR: u8 = 3;
pub const TAG_BIN: u8 = 4;

/// A single typed payload element.
///
/// Strings are carried as raw bytes: the historical protocol treats them as
/// 8-bit Latin-1 text, so the codec preserves bytes exactly and leaves any
/// character interpretation to the caller.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Element {
    U32(u32),
    U64(u64),
    Str(Vec<u8>),
    Bin(Vec<u8>),
}

impl Element {
    /// Builds a string element from UTF-8 text. Protocol peers expecting
    /// Latin-1 should construct `Element::Str` from raw bytes instead.
    #[inline]
    pub fn text<S: Into<String>>(text: S) -> Element {
        Element::Str(text.into().into_bytes())
    }

    #[inline]
    pub fn tag(&self) -> u8 {
        match self {
            Element::U32(_) => TAG_U32,
            Element::U64(_) => TAG_U64,
            Element::Str(_) => TAG_STR,
            Element::Bin(_) => TAG_BIN,
        }
    }

    pub fn tag_name(tag: u8) -> &'static str {
        match tag {
            TAG_U32 => "u32",
            TAG_U64 => "u64",
            TAG_STR => "str",
            TAG_BIN => "bin",
            _ => "unknown",
        }
    }

    /// Encoded size in bytes, including the tag byte.
    #[inline]
    pub fn size(&self) -> usize {
        match self {
            Element::U32(_) => 5,
            Element::U64(_) => 9,
            Element::Str(data) | Element::Bin(data) => 5 + data.len(),
        }
    }

    /// Writes the tag byte followed by the tag-specific encoding.
    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u8(self.tag())?;

        match self {
            Element::U32(value) => stream.write_u32::<BigEndian>(*value)?,
            Element::U64(value) => stream.write_u64::<BigEndian>(*value)?,
            Element::Str(data) | Element::Bin(data) => {
                stream.write_u32::<BigEndian>(data.len() as u32)?;
                stream.write_all(data)?;
            }
        }

        Ok(())
    }

    /// Reads one element off the cursor. Truncation mid-element is a
    /// malformed payload error.
    pub fn read(stream: &mut Cursor<&[u8]>) -> Result<Element, Error> {
        let tag = stream.read_u8().map_err(truncated)?;

        let element = match tag {
            TAG_U32 => Element::U32(stream.read_u32::<BigEndian>().map_err(truncated)?),
            TAG_U64 => Element::U64(stream.read_u64::<BigEndian>().map_err(truncated)?),
            TAG_STR | TAG_BIN => {
                let len = stream.read_u32::<BigEndian>().map_err(truncated)? as usize;
                let remaining = stream.get_ref().len() - stream.position() as usize;

                // Validate the length against the buffer before allocating.
                if len > remaining {
                    return Err(Error::generic("malformed payload: truncated element"));
                }

                let mut data = vec![0u8; len];
                stream.read_exact(&mut data).map_err(truncated)?;

                if tag == TAG_STR {
                    Element::Str(data)
                } else {
                    Element::Bin(data)
                }
            }
            tag => {
                return Err(Error::generic(format!(
                    "malformed payload: unknown element tag {}",
                    tag
                )))
            }
        };

        Ok(element)
    }

    #[inline]
    pub fn u32(&self) -> Option<u32> {
        match self {
            Element::U32(value) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn u64(&self) -> Option<u64> {
        match self {
            Element::U64(value) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn str_bytes(&self) -> Option<&[u8]> {
        match self {
            Element::Str(data) => Some(data),
            _ => None,
        }
    }

    /// Decodes a string element for display. Bytes that are not valid UTF-8
    /// are replaced; use `str_bytes` when the exact bytes matter.
    pub fn str_lossy(&self) -> Option<String> {
        self.str_bytes()
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    #[inline]
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Element::Bin(data) => Some(data),
            _ => None,
        }
    }

    pub fn expect_u32(&self) -> Result<u32, Error> {
        self.u32().ok_or_else(|| self.mismatch(TAG_U32))
    }

    pub fn expect_u64(&self) -> Result<u64, Error> {
        self.u64().ok_or_else(|| self.mismatch(TAG_U64))
    }

    pub fn expect_str(&self) -> Result<&[u8], Error> {
        self.str_bytes().ok_or_else(|| self.mismatch(TAG_STR))
    }

    pub fn expect_bin(&self) -> Result<&[u8], Error> {
        self.bytes().ok_or_else(|| self.mismatch(TAG_BIN))
    }

    fn mismatch(&self, requested: u8) -> Error {
        Error::generic(format!(
            "element type mismatch: requested {}, actual {}",
            Element::tag_name(requested),
            Element::tag_name(self.tag())
        ))
    }
}

fn truncated(_: io::Error) -> Error {
    Error::generic("malformed payload: truncated element")
}
