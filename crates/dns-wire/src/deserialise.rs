//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::types::*;

impl Message {
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;
        let flags1 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let flags2 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;

        let header = Header {
            id,
            is_response: flags1 & MASK_QR != 0,
            opcode: Opcode::from((flags1 & MASK_OPCODE) >> OFFSET_OPCODE),
            is_authoritative: flags1 & MASK_AA != 0,
            is_truncated: flags1 & MASK_TC != 0,
            recursion_desired: flags1 & MASK_RD != 0,
            recursion_available: flags2 & MASK_RA != 0,
            rcode: Rcode::from(flags2 & MASK_RCODE),
        };

        let mut questions = Vec::with_capacity(qdcount.into());
        let mut answers = Vec::with_capacity(ancount.into());
        let mut authority = Vec::with_capacity(nscount.into());
        let mut additional = Vec::with_capacity(arcount.into());

        for _ in 0..qdcount {
            questions.push(Question::deserialise(id, buffer)?);
        }
        for _ in 0..ancount {
            answers.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..nscount {
            authority.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..arcount {
            additional.push(ResourceRecord::deserialise(id, buffer)?);
        }

        Ok(Self {
            header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl Question {
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = buffer
            .next_u16()
            .map(QueryType::from)
            .ok_or(Error::QuestionTooShort(id))?;
        let qclass = buffer
            .next_u16()
            .map(RecordClass::from)
            .ok_or(Error::QuestionTooShort(id))?;

        Ok(Self {
            name,
            qtype,
            qclass,
        })
    }
}

impl ResourceRecord {
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let rtype = buffer
            .next_u16()
            .map(RecordType::from)
            .ok_or(Error::ResourceRecordTooShort(id))?;
        let rclass = buffer
            .next_u16()
            .map(RecordClass::from)
            .ok_or(Error::ResourceRecordTooShort(id))?;
        let ttl = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
        let rdlength = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;

        let rdata_start = buffer.position;

        // names inside RDATA are deserialised rather than copied, so
        // compression pointers get expanded
        let data = match rtype {
            RecordType::A => RecordData::A {
                address: Ipv4Addr::from(
                    buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                ),
            },
            RecordType::AAAA => {
                let mut octets = [0u8; 16];
                let slice = buffer
                    .take(16)
                    .ok_or(Error::ResourceRecordTooShort(id))?;
                octets.copy_from_slice(slice);
                RecordData::AAAA {
                    address: Ipv6Addr::from(octets),
                }
            }
            RecordType::CNAME => RecordData::CNAME {
                target: DomainName::deserialise(id, buffer)?,
            },
            RecordType::PTR => RecordData::PTR {
                target: DomainName::deserialise(id, buffer)?,
            },
            RecordType::TXT => {
                let mut strings = Vec::new();
                while buffer.position < rdata_start + rdlength as usize {
                    let len = buffer.next_u8().ok_or(Error::ResourceRecordTooShort(id))?;
                    let string = buffer
                        .take(len as usize)
                        .ok_or(Error::ResourceRecordTooShort(id))?;
                    strings.push(string.to_vec());
                }
                RecordData::TXT { strings }
            }
            RecordType::SOA => RecordData::SOA {
                mname: DomainName::deserialise(id, buffer)?,
                rname: DomainName::deserialise(id, buffer)?,
                serial: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                refresh: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                retry: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                expire: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                minimum: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
            },
            RecordType::OPT => RecordData::OPT {
                octets: buffer
                    .take(rdlength as usize)
                    .ok_or(Error::ResourceRecordTooShort(id))?
                    .to_vec(),
            },
            RecordType::Unknown(tag) => RecordData::Unknown {
                tag,
                octets: buffer
                    .take(rdlength as usize)
                    .ok_or(Error::ResourceRecordTooShort(id))?
                    .to_vec(),
            },
        };

        if buffer.position == rdata_start + rdlength as usize {
            Ok(Self {
                name,
                data,
                rclass,
                ttl,
            })
        } else {
            Err(Error::ResourceRecordInvalid(id))
        }
    }
}

impl DomainName {
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut labels = Vec::with_capacity(5);
        let mut wire_len = 1;
        let start = buffer.position;

        loop {
            let size = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;

            if size == 0 {
                break;
            } else if usize::from(size) <= LABEL_MAX_OCTETS {
                let label = buffer
                    .take(size as usize)
                    .ok_or(Error::DomainTooShort(id))?;

                wire_len += label.len() + 1;
                if wire_len > NAME_MAX_OCTETS {
                    return Err(Error::DomainTooLong(id));
                }

                labels.push(label.to_vec());
            } else if size >= 192 {
                // compression pointer: the pointed-at name must start
                // strictly before this one (RFC 1035 section 4.1.4),
                // which also rules out pointer loops
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;
                let ptr = usize::from(u16::from_be_bytes([hi, lo]));

                if ptr >= start {
                    return Err(Error::DomainPointerInvalid(id));
                }

                let expanded = DomainName::deserialise(id, &mut buffer.at_offset(ptr))?;
                wire_len += expanded.wire_len() - 1;
                if wire_len > NAME_MAX_OCTETS {
                    return Err(Error::DomainTooLong(id));
                }

                for label in expanded.labels() {
                    labels.push(label.clone());
                }
                break;
            } else {
                return Err(Error::DomainLabelInvalid(id));
            }
        }

        Ok(DomainName::from_wire_labels(labels))
    }
}

/// Errors encountered when parsing a datagram.  In all the errors
/// which have a `u16` parameter, that is the id from the header, so
/// that an error response can be sent back.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The datagram is not even 2 octets long, so it does not contain
    /// an id and no error can be sent back for it.
    CompletelyBusted,

    /// The header is missing one or more required fields.
    HeaderTooShort(u16),

    /// A question ends with an incomplete field.
    QuestionTooShort(u16),

    /// A resource record ends with an incomplete field.
    ResourceRecordTooShort(u16),

    /// A resource record's RDATA does not match its RDLENGTH.
    ResourceRecordInvalid(u16),

    /// A domain is incomplete.
    DomainTooShort(u16),

    /// A domain is over 255 octets in size.
    DomainTooLong(u16),

    /// A domain pointer points to or after the current record.
    DomainPointerInvalid(u16),

    /// A domain label is longer than 63 octets, but not a pointer.
    DomainLabelInvalid(u16),
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::CompletelyBusted => None,
            Error::HeaderTooShort(id)
            | Error::QuestionTooShort(id)
            | Error::ResourceRecordTooShort(id)
            | Error::ResourceRecordInvalid(id)
            | Error::DomainTooShort(id)
            | Error::DomainTooLong(id)
            | Error::DomainPointerInvalid(id)
            | Error::DomainLabelInvalid(id) => Some(id),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CompletelyBusted => write!(f, "message too short to carry an id"),
            Error::HeaderTooShort(_) => write!(f, "header too short"),
            Error::QuestionTooShort(_) => write!(f, "question too short"),
            Error::ResourceRecordTooShort(_) => write!(f, "resource record too short"),
            Error::ResourceRecordInvalid(_) => write!(f, "resource record invalid"),
            Error::DomainTooShort(_) => write!(f, "domain name too short"),
            Error::DomainTooLong(_) => write!(f, "domain name too long"),
            Error::DomainPointerInvalid(_) => write!(f, "domain compression pointer invalid"),
            Error::DomainLabelInvalid(_) => write!(f, "domain label invalid"),
        }
    }
}

impl std::error::Error for Error {}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self { octets, position: 0 }
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let octet = self.octets[self.position];
            self.position += 1;
            Some(octet)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        let slice = self.take(2)?;
        Some(u16::from_be_bytes([slice[0], slice[1]]))
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        let slice = self.take(4)?;
        Some(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_util::*;

    #[test]
    fn deserialise_expands_compression_pointers() {
        #[rustfmt::skip]
        let octets = [
            0, 7, // id
            0b1000_0000, 0, // flags: response
            0, 1, 0, 1, 0, 0, 0, 0, // counts
            // question: www.example.com. A IN
            3, b'w', b'w', b'w',
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e',
            3, b'c', b'o', b'm', 0,
            0, 1, 0, 1,
            // answer: pointer to offset 12, CNAME, IN, ttl 300
            0b1100_0000, 12,
            0, 5, 0, 1,
            0, 0, 1, 44,
            0, 6, // rdlength
            3, b'f', b'o', b'o', 0b1100_0000, 16, // foo.example.com. via pointer
        ];

        let message = Message::from_octets(&octets).unwrap();

        assert_eq!(domain("www.example.com."), message.questions[0].name);
        assert_eq!(domain("www.example.com."), message.answers[0].name);
        assert_eq!(
            RecordData::CNAME {
                target: domain("foo.example.com.")
            },
            message.answers[0].data
        );
    }

    #[test]
    fn deserialise_rejects_forward_pointers() {
        #[rustfmt::skip]
        let octets = [
            0, 7,
            0, 0,
            0, 1, 0, 0, 0, 0, 0, 0,
            // question name is a pointer to itself
            0b1100_0000, 12,
            0, 1, 0, 1,
        ];

        assert_eq!(
            Err(Error::DomainPointerInvalid(7)),
            Message::from_octets(&octets)
        );
    }

    #[test]
    fn deserialise_lowercases_names() {
        #[rustfmt::skip]
        let octets = [
            0, 7,
            0, 0,
            0, 1, 0, 0, 0, 0, 0, 0,
            3, b'W', b'W', b'W', 7, b'E', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0,
            0, 1, 0, 1,
        ];

        let message = Message::from_octets(&octets).unwrap();
        assert_eq!(domain("www.example.com."), message.questions[0].name);
    }

    #[test]
    fn roundtrip_arbitrary_messages() {
        for _ in 0..100 {
            let original = arbitrary_message();
            if let Ok(octets) = original.to_octets() {
                assert_eq!(Ok(original), Message::from_octets(&octets));
            }
        }
    }

    #[test]
    fn deserialise_rejects_mismatched_rdlength() {
        #[rustfmt::skip]
        let octets = [
            0, 7,
            0b1000_0000, 0,
            0, 0, 0, 1, 0, 0, 0, 0,
            1, b'a', 0,
            0, 1, 0, 1, // A IN
            0, 0, 1, 44,
            0, 5, // rdlength claims 5, A rdata is 4
            1, 2, 3, 4, 5,
        ];

        assert_eq!(
            Err(Error::ResourceRecordInvalid(7)),
            Message::from_octets(&octets)
        );
    }
}
