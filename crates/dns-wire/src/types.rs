use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Maximum length of a domain name, in octets, including the length
/// and terminating null octets.
pub const NAME_MAX_OCTETS: usize = 255;

/// Maximum length of a single label, in octets.
pub const LABEL_MAX_OCTETS: usize = 63;

/// Maximum length of a whole message, in octets.  TCP messages carry
/// a `u16` length prefix, so cannot be larger than this.
pub const MESSAGE_MAX_OCTETS: usize = 65535;

// Masks for the two flag octets of the header.
pub(crate) const MASK_QR: u8 = 0b1000_0000;
pub(crate) const MASK_OPCODE: u8 = 0b0111_1000;
pub(crate) const MASK_AA: u8 = 0b0000_0100;
pub(crate) const MASK_TC: u8 = 0b0000_0010;
pub(crate) const MASK_RD: u8 = 0b0000_0001;
pub(crate) const MASK_RA: u8 = 0b1000_0000;
pub(crate) const MASK_RCODE: u8 = 0b0000_1111;
pub(crate) const OFFSET_OPCODE: usize = 3;

/// A DNS message, used for both queries and responses.
///
/// ```text
///     +---------------------+
///     |        Header       |
///     +---------------------+
///     |       Question      | the question for the name server
///     +---------------------+
///     |        Answer       | RRs answering the question
///     +---------------------+
///     |      Authority      | RRs pointing toward an authority
///     +---------------------+
///     |      Additional     | RRs holding additional information
///     +---------------------+
/// ```
///
/// See section 4.1 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Message {
    /// Build a query message holding a single question.
    pub fn from_question(id: u16, question: Question) -> Self {
        Self {
            header: Header {
                id,
                is_response: false,
                opcode: Opcode::Standard,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: false,
                recursion_available: false,
                rcode: Rcode::NoError,
            },
            questions: vec![question],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// Build the scaffold of a response to this message: same id,
    /// opcode, and questions; no records.
    pub fn make_response(&self) -> Self {
        Self {
            header: Header {
                id: self.header.id,
                is_response: true,
                opcode: self.header.opcode,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: self.header.recursion_desired,
                recursion_available: true,
                rcode: Rcode::NoError,
            },
            questions: self.questions.clone(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// Build a FORMERR response for a message which could not be
    /// parsed beyond its id.
    pub fn make_format_error_response(id: u16) -> Self {
        Self {
            header: Header {
                id,
                is_response: true,
                opcode: Opcode::Standard,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: false,
                recursion_available: true,
                rcode: Rcode::FormatError,
            },
            questions: Vec::new(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// The UDP payload size advertised by an EDNS0 OPT record in the
    /// additional section, if there is one.
    ///
    /// OPT records smuggle the payload size into the CLASS field, see
    /// section 6.1.2 of RFC 6891.
    pub fn edns_udp_payload_size(&self) -> Option<u16> {
        self.additional
            .iter()
            .find(|rr| rr.data.rtype() == RecordType::OPT)
            .map(|rr| u16::from(rr.rclass))
    }
}

/// Common header type for all messages.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                      ID                       |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    QDCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ANCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    NSCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ARCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// The count fields are not represented here: they are derived from
/// the section lengths when serialising, so they cannot disagree.
///
/// See section 4.1.1 of RFC 1035.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Header {
    /// Query id, copied into the response so the client can pair
    /// replies with outstanding queries.
    pub id: u16,

    /// QR flag: false for a query, true for a response.
    pub is_response: bool,

    /// Kind of query.
    pub opcode: Opcode,

    /// AA flag: the responding server is an authority for the name in
    /// the question section.
    pub is_authoritative: bool,

    /// TC flag: the message was cut down to fit the transport.
    pub is_truncated: bool,

    /// RD flag: set in a query and copied into the response.
    pub recursion_desired: bool,

    /// RA flag: the server is willing to resolve recursively.
    pub recursion_available: bool,

    /// Response code.
    pub rcode: Rcode,
}

/// A single entry of the question section.
///
/// See section 4.1.2 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Question {
    pub name: DomainName,
    pub qtype: QueryType,
    pub qclass: RecordClass,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.qclass, self.qtype)
    }
}

/// A single resource record, used by the answer, authority, and
/// additional sections.
///
/// See section 4.1.3 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ResourceRecord {
    /// The name this record pertains to.
    pub name: DomainName,

    /// The TYPE and RDATA fields, combined so they cannot disagree.
    pub data: RecordData,

    /// The CLASS field.  For OPT pseudo-records this is the
    /// requestor's advertised UDP payload size, not a class.
    pub rclass: RecordClass,

    /// How long, in seconds, the record may be cached for.  Zero
    /// means the record must not be cached at all.
    pub ttl: u32,
}

/// A record type with its associated, deserialised, data.
///
/// Only the types this server interprets get structured variants;
/// anything else is carried as raw octets so it can be passed through
/// from an upstream response untouched.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum RecordData {
    /// A 32 bit internet address.
    A { address: Ipv4Addr },

    /// A 128 bit internet address (RFC 3596).
    AAAA { address: Ipv6Addr },

    /// The canonical name for an alias.
    CNAME { target: DomainName },

    /// A pointer to another part of the name space, used for reverse
    /// lookups.
    PTR { target: DomainName },

    /// One or more character strings, each at most 255 octets.
    TXT { strings: Vec<Vec<u8>> },

    /// Start of a zone of authority.
    ///
    /// `mname` is the primary name server for the zone, `rname` the
    /// mailbox of the person responsible for it.  The remaining
    /// fields are the zone transfer timers of RFC 1035 section
    /// 3.3.13; this server only ever emits them, it does not act on
    /// them.
    SOA {
        mname: DomainName,
        rname: DomainName,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },

    /// An EDNS0 OPT pseudo-record (RFC 6891), kept opaque.  The
    /// interesting part, the payload size, lives in the record class.
    OPT { octets: Vec<u8> },

    /// Any other record, passed through uninterpreted.
    Unknown {
        tag: RecordTypeUnknown,
        octets: Vec<u8>,
    },
}

impl RecordData {
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::A { .. } => RecordType::A,
            RecordData::AAAA { .. } => RecordType::AAAA,
            RecordData::CNAME { .. } => RecordType::CNAME,
            RecordData::PTR { .. } => RecordType::PTR,
            RecordData::TXT { .. } => RecordType::TXT,
            RecordData::SOA { .. } => RecordType::SOA,
            RecordData::OPT { .. } => RecordType::OPT,
            RecordData::Unknown { tag, .. } => RecordType::Unknown(*tag),
        }
    }
}

/// What sort of query this is.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Opcode {
    Standard,
    Inverse,
    Status,
    Reserved(u8),
}

impl From<u8> for Opcode {
    fn from(octet: u8) -> Self {
        match octet & 0b0000_1111 {
            0 => Opcode::Standard,
            1 => Opcode::Inverse,
            2 => Opcode::Status,
            other => Opcode::Reserved(other),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Standard => 0,
            Opcode::Inverse => 1,
            Opcode::Status => 2,
            Opcode::Reserved(octet) => octet & 0b0000_1111,
        }
    }
}

/// Response codes this server emits or inspects.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Rcode {
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    Reserved(u8),
}

impl From<u8> for Rcode {
    fn from(octet: u8) -> Self {
        match octet & 0b0000_1111 {
            0 => Rcode::NoError,
            1 => Rcode::FormatError,
            2 => Rcode::ServerFailure,
            3 => Rcode::NameError,
            4 => Rcode::NotImplemented,
            5 => Rcode::Refused,
            other => Rcode::Reserved(other),
        }
    }
}

impl From<Rcode> for u8 {
    fn from(value: Rcode) -> Self {
        match value {
            Rcode::NoError => 0,
            Rcode::FormatError => 1,
            Rcode::ServerFailure => 2,
            Rcode::NameError => 3,
            Rcode::NotImplemented => 4,
            Rcode::Refused => 5,
            Rcode::Reserved(octet) => octet & 0b0000_1111,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rcode::NoError => write!(f, "NOERROR"),
            Rcode::FormatError => write!(f, "FORMERR"),
            Rcode::ServerFailure => write!(f, "SERVFAIL"),
            Rcode::NameError => write!(f, "NXDOMAIN"),
            Rcode::NotImplemented => write!(f, "NOTIMP"),
            Rcode::Refused => write!(f, "REFUSED"),
            Rcode::Reserved(octet) => write!(f, "RESERVED{octet}"),
        }
    }
}

/// A domain name: a sequence of labels, stored lowercased and without
/// the terminating empty root label.
///
/// A label is 1 to 63 octets of ASCII.  A whole name is at most 255
/// octets in wire form, including each label's length octet and the
/// final null octet.  The constructors enforce both limits, so a
/// `DomainName` value is always serialisable.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DomainName {
    labels: Vec<Vec<u8>>,
}

impl DomainName {
    pub fn root() -> Self {
        DomainName { labels: Vec::new() }
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[Vec<u8>] {
        &self.labels
    }

    /// The length of the name in wire form.
    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// The number of dots in the name without its trailing dot, which
    /// is what search-suffix expansion thresholds count.
    pub fn num_dots(&self) -> usize {
        self.labels.len().saturating_sub(1)
    }

    /// Parse a dotted string, with or without a trailing dot.  `.` is
    /// the root.  Returns `None` if any label is empty, non-ASCII, or
    /// too long, or if the whole name is too long.
    pub fn from_dotted_string(s: &str) -> Option<Self> {
        if s == "." {
            return Some(Self::root());
        }

        let stripped = s.strip_suffix('.').unwrap_or(s);
        if stripped.is_empty() {
            return None;
        }

        Self::from_labels(stripped.split('.').map(|l| l.as_bytes().to_vec()).collect())
    }

    /// Build a name from raw labels, lowercasing them.  Returns
    /// `None` if any label or the whole name is out of bounds.
    pub fn from_labels(mixed_case_labels: Vec<Vec<u8>>) -> Option<Self> {
        let mut labels = Vec::with_capacity(mixed_case_labels.len());
        let mut wire_len = 1;

        for mc_label in mixed_case_labels {
            if mc_label.is_empty() || mc_label.len() > LABEL_MAX_OCTETS {
                return None;
            }
            if !mc_label.iter().all(u8::is_ascii) {
                return None;
            }

            wire_len += mc_label.len() + 1;
            labels.push(mc_label.to_ascii_lowercase());
        }

        if wire_len > NAME_MAX_OCTETS {
            return None;
        }

        Some(Self { labels })
    }

    /// Build a name from labels read off the wire.  Length limits
    /// must already have been checked; unlike `from_labels` this does
    /// not reject non-ASCII octets, since they are legal in wire
    /// names even if this server never produces them.
    pub(crate) fn from_wire_labels(wire_labels: Vec<Vec<u8>>) -> Self {
        Self {
            labels: wire_labels
                .into_iter()
                .map(|l| l.to_ascii_lowercase())
                .collect(),
        }
    }

    /// The canonical textual form: lowercase, dot-separated, with a
    /// trailing dot.  The root is `.`.
    pub fn to_dotted_string(&self) -> String {
        if self.is_root() {
            return ".".to_string();
        }

        let mut out = String::with_capacity(self.wire_len());
        for label in &self.labels {
            for octet in label {
                out.push(*octet as char);
            }
            out.push('.');
        }
        out
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_dotted_string())
    }
}

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainName({})", self.to_dotted_string())
    }
}

/// Query types are record types plus the `*` wildcard.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum QueryType {
    Record(RecordType),
    Any,
}

impl From<u16> for QueryType {
    fn from(value: u16) -> Self {
        match value {
            255 => QueryType::Any,
            _ => QueryType::Record(RecordType::from(value)),
        }
    }
}

impl From<QueryType> for u16 {
    fn from(value: QueryType) -> Self {
        match value {
            QueryType::Any => 255,
            QueryType::Record(rtype) => rtype.into(),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryType::Any => write!(f, "ANY"),
            QueryType::Record(rtype) => rtype.fmt(f),
        }
    }
}

/// The record types this server interprets.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RecordType {
    A,
    AAAA,
    CNAME,
    PTR,
    TXT,
    SOA,
    OPT,
    Unknown(RecordTypeUnknown),
}

/// A struct with a private constructor, so an unknown record type
/// cannot alias a known one.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RecordTypeUnknown(u16);

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            5 => RecordType::CNAME,
            6 => RecordType::SOA,
            12 => RecordType::PTR,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            41 => RecordType::OPT,
            other => RecordType::Unknown(RecordTypeUnknown(other)),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::CNAME => 5,
            RecordType::SOA => 6,
            RecordType::PTR => 12,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::OPT => 41,
            RecordType::Unknown(RecordTypeUnknown(tag)) => tag,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::AAAA => write!(f, "AAAA"),
            RecordType::CNAME => write!(f, "CNAME"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::TXT => write!(f, "TXT"),
            RecordType::SOA => write!(f, "SOA"),
            RecordType::OPT => write!(f, "OPT"),
            RecordType::Unknown(RecordTypeUnknown(tag)) => write!(f, "TYPE{tag}"),
        }
    }
}

/// Record classes.  This server only serves `IN`, but other values
/// must survive a round trip through the additional section (OPT
/// records store the payload size here).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RecordClass {
    IN,
    Other(u16),
}

impl From<u16> for RecordClass {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordClass::IN,
            other => RecordClass::Other(other),
        }
    }
}

impl From<RecordClass> for u16 {
    fn from(value: RecordClass) -> Self {
        match value {
            RecordClass::IN => 1,
            RecordClass::Other(value) => value,
        }
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordClass::IN => write!(f, "IN"),
            RecordClass::Other(value) => write!(f, "CLASS{value}"),
        }
    }
}

#[cfg(any(feature = "test-util", test))]
pub mod test_util {
    use super::*;

    use arbitrary::{Arbitrary, Unstructured};
    use rand::Rng;

    pub fn domain(name: &str) -> DomainName {
        DomainName::from_dotted_string(name).unwrap()
    }

    pub fn question(name: &str, qtype: QueryType) -> Question {
        Question {
            name: domain(name),
            qtype,
            qclass: RecordClass::IN,
        }
    }

    pub fn a_record(name: &str, address: Ipv4Addr) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            data: RecordData::A { address },
            rclass: RecordClass::IN,
            ttl: 300,
        }
    }

    pub fn cname_record(name: &str, target: &str) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            data: RecordData::CNAME {
                target: domain(target),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }
    }

    pub fn txt_record(name: &str, string: &str) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            data: RecordData::TXT {
                strings: vec![string.as_bytes().to_vec()],
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }
    }

    pub fn arbitrary_message() -> Message {
        let mut rng = rand::thread_rng();
        // retry on the off chance the entropy runs out mid-message
        loop {
            let mut bytes = vec![0u8; 4096];
            rng.fill(&mut bytes[..]);
            let mut u = Unstructured::new(&bytes);
            if let Ok(message) = Message::arbitrary(&mut u) {
                return message;
            }
        }
    }

    impl<'a> Arbitrary<'a> for Message {
        fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
            Ok(Self {
                header: u.arbitrary()?,
                questions: arbitrary_vec(u, 2)?,
                answers: arbitrary_vec(u, 3)?,
                authority: arbitrary_vec(u, 2)?,
                additional: arbitrary_vec(u, 2)?,
            })
        }
    }

    impl<'a> Arbitrary<'a> for Header {
        fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
            Ok(Self {
                id: u.arbitrary()?,
                is_response: u.arbitrary()?,
                opcode: Opcode::from(u.arbitrary::<u8>()?),
                is_authoritative: u.arbitrary()?,
                is_truncated: u.arbitrary()?,
                recursion_desired: u.arbitrary()?,
                recursion_available: u.arbitrary()?,
                rcode: Rcode::from(u.arbitrary::<u8>()?),
            })
        }
    }

    impl<'a> Arbitrary<'a> for Question {
        fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
            Ok(Self {
                name: u.arbitrary()?,
                qtype: QueryType::from(u.arbitrary::<u16>()?),
                qclass: RecordClass::from(u.arbitrary::<u16>()?),
            })
        }
    }

    impl<'a> Arbitrary<'a> for ResourceRecord {
        fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
            Ok(Self {
                name: u.arbitrary()?,
                data: u.arbitrary()?,
                rclass: RecordClass::from(u.arbitrary::<u16>()?),
                ttl: u.arbitrary()?,
            })
        }
    }

    impl<'a> Arbitrary<'a> for RecordData {
        fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
            let octets_len = u.int_in_range(0..=64)?;
            let octets = Vec::from(u.bytes(octets_len)?);

            Ok(match u.int_in_range(0..=7)? {
                0 => RecordData::A {
                    address: Ipv4Addr::from(u.arbitrary::<u32>()?),
                },
                1 => RecordData::AAAA {
                    address: Ipv6Addr::from(u.arbitrary::<u128>()?),
                },
                2 => RecordData::CNAME {
                    target: u.arbitrary()?,
                },
                3 => RecordData::PTR {
                    target: u.arbitrary()?,
                },
                4 => {
                    let mut strings = Vec::new();
                    for _ in 0..u.int_in_range(1..=3)? {
                        let s_len = u.int_in_range(1..=60)?;
                        strings.push(Vec::from(u.bytes(s_len)?));
                    }
                    RecordData::TXT { strings }
                }
                5 => RecordData::SOA {
                    mname: u.arbitrary()?,
                    rname: u.arbitrary()?,
                    serial: u.arbitrary()?,
                    refresh: u.arbitrary()?,
                    retry: u.arbitrary()?,
                    expire: u.arbitrary()?,
                    minimum: u.arbitrary()?,
                },
                6 => RecordData::OPT { octets },
                _ => {
                    // make sure the tag doesn't collide with a known type
                    let tag = match RecordType::from(u.arbitrary::<u16>()?) {
                        RecordType::Unknown(tag) => tag,
                        _ => RecordTypeUnknown(999),
                    };
                    RecordData::Unknown { tag, octets }
                }
            })
        }
    }

    impl<'a> Arbitrary<'a> for DomainName {
        fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
            let mut labels = Vec::new();
            for _ in 0..u.int_in_range(1..=4)? {
                let len = u.int_in_range(1..=12)?;
                let mut label = Vec::with_capacity(len);
                for _ in 0..len {
                    label.push(u.int_in_range(b'a'..=b'z')?);
                }
                labels.push(label);
            }
            Ok(DomainName::from_labels(labels).unwrap())
        }
    }

    fn arbitrary_vec<'a, T: Arbitrary<'a>>(
        u: &mut Unstructured<'a>,
        max: usize,
    ) -> arbitrary::Result<Vec<T>> {
        let mut out = Vec::new();
        for _ in 0..u.int_in_range(0..=max)? {
            out.push(u.arbitrary()?);
        }
        Ok(out)
    }
}
