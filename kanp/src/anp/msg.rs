use crate::anp::{self, Element, HEADER_SIZE};
use crate::error::Error;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io::Cursor;

/// Parsed fixed header of an ANP message. All fields are big-endian on the
/// wire, packed without padding into 24 bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Header {
    pub major: u32,
    pub minor: u32,
    pub ty: u32,
    pub id: u64,
    pub payload_size: u32,
}

impl Header {
    /// Parses a header from exactly `HEADER_SIZE` bytes.
    pub fn parse(buf: &[u8]) -> Result<Header, Error> {
        if buf.len() != HEADER_SIZE {
            return Err(Error::generic(format!(
                "malformed header: expected {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }

        Ok(Header {
            major: BigEndian::read_u32(&buf[0..4]),
            minor: BigEndian::read_u32(&buf[4..8]),
            ty: BigEndian::read_u32(&buf[8..12]),
            id: BigEndian::read_u64(&buf[12..20]),
            payload_size: BigEndian::read_u32(&buf[20..24]),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.write_u32::<BigEndian>(self.major).expect("Error writing major");
        out.write_u32::<BigEndian>(self.minor).expect("Error writing minor");
        out.write_u32::<BigEndian>(self.ty).expect("Error writing type");
        out.write_u64::<BigEndian>(self.id).expect("Error writing id");
        out.write_u32::<BigEndian>(self.payload_size)
            .expect("Error writing payload size");
    }
}

/// An ANP message: fixed header plus an ordered list of payload elements.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Msg {
    pub major: u32,
    pub minor: u32,
    pub ty: u32,
    pub id: u64,
    pub elements: Vec<Element>,
}

impl Msg {
    #[inline]
    pub fn new(ty: u32, id: u64) -> Msg {
        Msg {
            major: anp::PROTO_MAJOR,
            minor: anp::PROTO_MINOR,
            ty,
            id,
            elements: Vec::new(),
        }
    }

    /// Builds a command message in the given namespace. The id is stamped by
    /// the channel on send.
    #[inline]
    pub fn cmd(ns: u32) -> Msg {
        Msg::new(anp::make_type(anp::ROLE_CMD, ns), 0)
    }

    /// Builds a response message in the given namespace.
    #[inline]
    pub fn res(ns: u32) -> Msg {
        Msg::new(anp::make_type(anp::ROLE_RES, ns), 0)
    }

    /// Builds an event message in the given namespace. Events with id 0 are
    /// transient: delivered immediately and never persisted.
    #[inline]
    pub fn evt(ns: u32) -> Msg {
        Msg::new(anp::make_type(anp::ROLE_EVT, ns), 0)
    }

    /// Appends a payload element, builder style.
    #[inline]
    pub fn with(mut self, element: Element) -> Msg {
        self.elements.push(element);
        self
    }

    /// Sum of the encoded element sizes.
    #[inline]
    pub fn payload_size(&self) -> u32 {
        self.elements.iter().map(|element| element.size() as u32).sum()
    }

    #[inline]
    pub fn is_cmd(&self) -> bool {
        anp::is_cmd(self.ty)
    }

    #[inline]
    pub fn is_res(&self) -> bool {
        anp::is_res(self.ty)
    }

    #[inline]
    pub fn is_evt(&self) -> bool {
        anp::is_evt(self.ty)
    }

    #[inline]
    pub fn namespace(&self) -> u32 {
        anp::namespace(self.ty)
    }

    #[inline]
    pub fn header(&self) -> Header {
        Header {
            major: self.major,
            minor: self.minor,
            ty: self.ty,
            id: self.id,
            payload_size: self.payload_size(),
        }
    }

    #[inline]
    pub fn from_parts(header: Header, elements: Vec<Element>) -> Msg {
        Msg {
            major: header.major,
            minor: header.minor,
            ty: header.ty,
            id: header.id,
            elements,
        }
    }

    /// Encodes the message, optionally prefixed by its header.
    pub fn encode(&self, include_header: bool) -> Vec<u8> {
        let payload_size = self.payload_size() as usize;
        let capacity = if include_header {
            HEADER_SIZE + payload_size
        } else {
            payload_size
        };

        let mut out = Vec::with_capacity(capacity);

        if include_header {
            self.header().write(&mut out);
        }

        for element in &self.elements {
            element.write(&mut out).expect("Error writing element");
        }

        out
    }
}

/// Parses a payload buffer into its element list. The parser reads until the
/// end of the buffer; truncation mid-element is a parse error.
pub fn parse_payload(buf: &[u8]) -> Result<Vec<Element>, Error> {
    let mut cursor = Cursor::new(buf);
    let mut elements = Vec::new();

    while (cursor.position() as usize) < buf.len() {
        elements.push(Element::read(&mut cursor)?);
    }

    Ok(elements)
}
