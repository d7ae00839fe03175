//! Netlink attribute (TLV) primitives
//!
//! Attributes follow the message headers and carry the actual conntrack data.
//!
//! # Attribute Format
//!
//! ```text
//! ┌────────────────┐
//! │ nla_len  (u16) │ ← header + value, never includes padding
//! │ nla_type (u16) │ ← bit 15 = NLA_F_NESTED, bit 14 = NLA_F_NET_BYTEORDER
//! ├────────────────┤
//! │ Value          │ ← nla_len - 4 bytes
//! ├────────────────┤
//! │ Padding        │ ← 0-3 bytes (align to 4-byte boundary)
//! └────────────────┘
//! ```
//!
//! A nested attribute carries a sequence of child attributes as its value,
//! each padded the same way.
//!
//! ## Cursor Handling
//!
//! Decoding works on an explicit [`ByteCursor`] value instead of hidden
//! buffer state. `ByteCursor` is `Copy`, so "remember a base offset and
//! rescan from it" is just copying the cursor before each scan.

use std::net::Ipv4Addr;

use crate::netlink::structures::nlmsg_align;

/// Attribute header size
pub const NLA_HDRLEN: usize = 4;

pub const NLA_F_NESTED: u16 = 0x8000;
pub const NLA_F_NET_BYTEORDER: u16 = 0x4000;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

/// Align attribute length to 4-byte boundary
#[must_use]
pub const fn nla_align(len: usize) -> usize {
    nlmsg_align(len)
}

/// Tag an attribute type as nested
#[must_use]
pub const fn make_nested_type(nla_type: u16) -> u16 {
    nla_type | NLA_F_NESTED
}

// ============================================================================
// BYTE CURSOR
// ============================================================================

/// Read position over a borrowed byte slice
///
/// All reads are bounds checked; a read that does not fit returns `None`
/// and leaves the position where it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Move to an absolute position, clamped to the end of the data
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Bytes from the current position to the end
    #[must_use]
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Borrow `len` bytes at the current position without consuming them
    #[must_use]
    pub fn peek(&self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        self.data.get(self.pos..end)
    }

    /// Consume `len` bytes
    pub fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let bytes = self.peek(len)?;
        self.pos += len;
        Some(bytes)
    }

    /// New cursor over the next `len` bytes (or fewer if the data ends first)
    ///
    /// The sub-cursor starts at position 0; `self` is not advanced.
    #[must_use]
    pub fn window(&self, len: usize) -> ByteCursor<'a> {
        let end = self.pos.saturating_add(len).min(self.data.len());
        ByteCursor::new(&self.data[self.pos..end])
    }
}

// ============================================================================
// DECODED ATTRIBUTE
// ============================================================================

/// One attribute borrowed from a receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlAttr<'a> {
    nla_type: u16,
    payload: &'a [u8],
}

impl<'a> NlAttr<'a> {
    /// Read `(nla_len, nla_type)` at the cursor without consuming anything
    ///
    /// Returns `None` when fewer than 4 bytes remain or when `nla_len` is
    /// smaller than the header itself (end of attributes).
    #[must_use]
    pub fn peek_header(cursor: &ByteCursor<'a>) -> Option<(u16, u16)> {
        let raw = cursor.peek(NLA_HDRLEN)?;
        let nla_len = u16::from_ne_bytes([raw[0], raw[1]]);
        let nla_type = u16::from_ne_bytes([raw[2], raw[3]]);
        if usize::from(nla_len) < NLA_HDRLEN {
            return None;
        }
        Some((nla_len, nla_type))
    }

    /// Consume one attribute
    ///
    /// Returns `None` if the declared value runs past the end of the data.
    /// On success the cursor moves past the attribute's padding, or to the
    /// end of the data when the final attribute is not padded.
    pub fn parse(cursor: &mut ByteCursor<'a>) -> Option<Self> {
        let (nla_len, nla_type) = Self::peek_header(cursor)?;
        let start = cursor.position();
        let payload = cursor.peek(usize::from(nla_len))?.get(NLA_HDRLEN..)?;
        cursor.set_position(start + nla_align(usize::from(nla_len)));
        Some(Self { nla_type, payload })
    }

    /// Raw type field, including flag bits
    #[must_use]
    pub const fn nla_type(&self) -> u16 {
        self.nla_type
    }

    /// Type with flag bits stripped
    #[must_use]
    pub const fn kind(&self) -> u16 {
        self.nla_type & NLA_TYPE_MASK
    }

    #[must_use]
    pub const fn is_nested(&self) -> bool {
        self.nla_type & NLA_F_NESTED != 0
    }

    #[must_use]
    pub const fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Unpadded length: header + value
    #[must_use]
    pub const fn nla_len(&self) -> usize {
        NLA_HDRLEN + self.payload.len()
    }

    #[must_use]
    pub const fn aligned_len(&self) -> usize {
        nla_align(self.nla_len())
    }

    // === Value accessors ===
    //
    // Each accessor requires the exact value width and returns None
    // otherwise. Callers decide what a missing value defaults to.

    #[must_use]
    pub fn value_as_u8(&self) -> Option<u8> {
        match self.payload {
            [b] => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn value_as_be16(&self) -> Option<u16> {
        let bytes: [u8; 2] = self.payload.try_into().ok()?;
        Some(u16::from_be_bytes(bytes))
    }

    #[must_use]
    pub fn value_as_be32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Interpret the value as an IPv4 address (exactly 4 bytes)
    #[must_use]
    pub fn value_as_ipv4(&self) -> Option<Ipv4Addr> {
        let octets: [u8; 4] = self.payload.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    /// Cursor over the value, for scanning nested attributes
    #[must_use]
    pub const fn nested(&self) -> ByteCursor<'a> {
        ByteCursor::new(self.payload)
    }

    /// Iterate over the child attributes of a nested attribute
    #[must_use]
    pub const fn children(&self) -> AttrIter<'a> {
        AttrIter {
            cursor: self.nested(),
        }
    }
}

/// Iterator over consecutive attributes; stops at the first malformed one
#[derive(Debug, Clone)]
pub struct AttrIter<'a> {
    cursor: ByteCursor<'a>,
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = NlAttr<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        NlAttr::parse(&mut self.cursor)
    }
}

/// Scan forward from the cursor for the first attribute of `nla_type`
///
/// The comparison is on the raw type field, so nested attributes must be
/// asked for with [`make_nested_type`]. On a match the cursor ends up past
/// the matched attribute; on a miss it is left wherever the scan stopped.
/// Callers that scan again must reset the cursor first.
///
/// A match whose value is truncated yields `None`, as does a malformed
/// header anywhere before the match.
pub fn find_next_attr_of_type<'a>(
    nla_type: u16,
    cursor: &mut ByteCursor<'a>,
) -> Option<NlAttr<'a>> {
    while cursor.remaining() > 0 {
        let (nla_len, found_type) = NlAttr::peek_header(cursor)?;
        if found_type == nla_type {
            return NlAttr::parse(cursor);
        }

        let aligned = nla_align(usize::from(nla_len));
        if cursor.remaining() < aligned {
            break;
        }
        cursor.set_position(cursor.position() + aligned);
    }
    None
}

// ============================================================================
// ATTRIBUTE BUILDER
// ============================================================================

/// Owned attribute tree used when encoding requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NlAttrBuilder {
    nla_type: u16,
    value: AttrValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrValue {
    Bytes(Vec<u8>),
    Nested(Vec<NlAttrBuilder>),
}

impl NlAttrBuilder {
    #[must_use]
    pub fn bytes(nla_type: u16, value: Vec<u8>) -> Self {
        Self {
            nla_type,
            value: AttrValue::Bytes(value),
        }
    }

    #[must_use]
    pub fn u8(nla_type: u16, value: u8) -> Self {
        Self::bytes(nla_type, vec![value])
    }

    #[must_use]
    pub fn be16(nla_type: u16, value: u16) -> Self {
        Self::bytes(nla_type, value.to_be_bytes().to_vec())
    }

    #[must_use]
    pub fn be32(nla_type: u16, value: u32) -> Self {
        Self::bytes(nla_type, value.to_be_bytes().to_vec())
    }

    /// IPv4 address in network order (its octets)
    #[must_use]
    pub fn ipv4(nla_type: u16, addr: Ipv4Addr) -> Self {
        Self::bytes(nla_type, addr.octets().to_vec())
    }

    /// Nested attribute; the NLA_F_NESTED bit is set on `nla_type`
    #[must_use]
    pub fn nested(nla_type: u16, children: Vec<NlAttrBuilder>) -> Self {
        Self {
            nla_type: make_nested_type(nla_type),
            value: AttrValue::Nested(children),
        }
    }

    #[must_use]
    pub const fn nla_type(&self) -> u16 {
        self.nla_type
    }

    /// Value length; for nested attributes the sum of aligned child lengths
    #[must_use]
    pub fn value_len(&self) -> usize {
        match &self.value {
            AttrValue::Bytes(bytes) => bytes.len(),
            AttrValue::Nested(children) => children.iter().map(Self::aligned_len).sum(),
        }
    }

    /// Unpadded length written to `nla_len`
    #[must_use]
    pub fn nla_len(&self) -> usize {
        NLA_HDRLEN + self.value_len()
    }

    /// Bytes the attribute occupies on the wire, padding included
    #[must_use]
    pub fn aligned_len(&self) -> usize {
        nla_align(self.nla_len())
    }

    /// Append the attribute, its children and its padding to `buffer`
    pub fn pack(&self, buffer: &mut Vec<u8>) {
        let start = buffer.len();
        buffer.extend_from_slice(&(self.nla_len() as u16).to_ne_bytes());
        buffer.extend_from_slice(&self.nla_type.to_ne_bytes());

        match &self.value {
            AttrValue::Bytes(bytes) => buffer.extend_from_slice(bytes),
            AttrValue::Nested(children) => {
                for child in children {
                    child.pack(buffer);
                }
            }
        }

        buffer.resize(start + self.aligned_len(), 0);
    }
}

// ============================================================================
// TESTS
// ============================================================================
