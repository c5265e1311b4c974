//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use crate::types::*;

impl Message {
    pub fn to_octets(&self) -> Result<BytesMut, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in &self.questions {
            question.serialise(buffer);
        }
        for rr in &self.answers {
            rr.serialise(buffer)?;
        }
        for rr in &self.authority {
            rr.serialise(buffer)?;
        }
        for rr in &self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { MASK_QR } else { 0 };
        let field_opcode = MASK_OPCODE & (u8::from(self.opcode) << OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative { MASK_AA } else { 0 };
        let flag_tc = if self.is_truncated { MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired { MASK_RD } else { 0 };
        // octet 2
        let flag_ra = if self.recursion_available { MASK_RA } else { 0 };
        let field_rcode = MASK_RCODE & u8::from(self.rcode);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer, true);
        buffer.write_u16(u16::from(self.qtype));
        buffer.write_u16(u16::from(self.qclass));
    }
}

impl ResourceRecord {
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer, true);
        buffer.write_u16(u16::from(self.data.rtype()));
        buffer.write_u16(u16::from(self.rclass));
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match &self.data {
            RecordData::A { address } => buffer.write_octets(&address.octets()),
            RecordData::AAAA { address } => buffer.write_octets(&address.octets()),
            // names in RDATA are never compressed
            RecordData::CNAME { target } => target.serialise(buffer, false),
            RecordData::PTR { target } => target.serialise(buffer, false),
            RecordData::TXT { strings } => {
                for string in strings {
                    let len = u8::try_from(string.len()).map_err(|_| {
                        Error::CharacterStringTooLong {
                            length: string.len(),
                        }
                    })?;
                    buffer.write_u8(len);
                    buffer.write_octets(string);
                }
            }
            RecordData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer, false);
                rname.serialise(buffer, false);
                buffer.write_u32(*serial);
                buffer.write_u32(*refresh);
                buffer.write_u32(*retry);
                buffer.write_u32(*expire);
                buffer.write_u32(*minimum);
            }
            RecordData::OPT { octets } | RecordData::Unknown { octets, .. } => {
                buffer.write_octets(octets);
            }
        }

        // -2 so the rdlength octets are not counted
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    /// Write the name.  If `compress` is set and the same name has
    /// already been written to this buffer, a compression pointer is
    /// written instead (RFC 1035 section 4.1.4).  Only whole names
    /// are pointed at, not shared suffixes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) {
        if compress {
            if let Some(ptr) = buffer.name_pointer(self) {
                buffer.write_u16(0b1100_0000_0000_0000 | ptr);
                return;
            }
        }

        buffer.memoise_name(self);

        for label in self.labels() {
            // label length is bounded by construction
            buffer.write_u8(label.len() as u8);
            buffer.write_octets(label);
        }
        buffer.write_u8(0);
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },

    /// A TXT character string is over 255 octets.
    CharacterStringTooLong { length: usize },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
            Error::CharacterStringTooLong { length } => {
                write!(f, "character string of {length} octets is over the 255 limit")
            }
        }
    }
}

impl std::error::Error for Error {}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: BytesMut,
    name_pointers: HashMap<DomainName, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: BytesMut::with_capacity(512),
            name_pointers: HashMap::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    /// Remember where a name was written, so later occurrences can be
    /// compressed into a pointer to it.  Positions beyond the 14 bit
    /// pointer range are not remembered.
    fn memoise_name(&mut self, name: &DomainName) {
        if !name.is_root() && !self.name_pointers.contains_key(name) {
            if let Ok(index) = u16::try_from(self.index()) {
                if index < 0b0100_0000_0000_0000 {
                    self.name_pointers.insert(name.clone(), index);
                }
            }
        }
    }

    fn name_pointer(&self, name: &DomainName) -> Option<u16> {
        self.name_pointers.get(name).copied()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.put_u8(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.octets.put_u16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.octets.put_u32(value);
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.put_slice(octets);
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    u16::try_from(counter).map_err(|_| Error::CounterTooLarge {
        counter,
        bits: u16::BITS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn serialise_sets_rdlength() {
        let mut buffer = WritableBuffer::default();
        let _ = txt_record("www.example.com.", "hi").serialise(&mut buffer);

        assert_eq!(
            vec![
                // NAME
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // TYPE
                0, 16, // TXT
                // CLASS
                0, 1, // IN
                // TTL
                0, 0, 1, 44, // 300
                // RDLENGTH
                0, 3,
                // RDATA
                2, 104, 105, // "hi"
            ],
            buffer.octets.to_vec(),
        );
    }

    #[test]
    fn serialise_compresses_repeated_names() {
        let rr = a_record("www.example.com.", std::net::Ipv4Addr::new(1, 1, 1, 1));

        let mut message = Message::from_question(
            0,
            question("www.example.com.", QueryType::Record(RecordType::A)),
        );
        message.answers = vec![rr.clone(), rr];

        let octets = message.to_octets().unwrap();

        // header + question + (pointer + fixed RR fields + rdata) * 2
        let uncompressed_name = 17;
        let expected = 12 + (uncompressed_name + 4) + 2 * (2 + 10 + 4);
        assert_eq!(expected, octets.len());
    }

    #[test]
    fn serialise_rejects_oversized_character_strings() {
        let mut buffer = WritableBuffer::default();
        let long = "x".repeat(256);
        let result = txt_record("www.example.com.", &long).serialise(&mut buffer);

        assert_eq!(Err(Error::CharacterStringTooLong { length: 256 }), result);
    }
}
