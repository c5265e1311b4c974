//! Response shaping: turning a response message into octets which fit
//! the transport, and the SOA record synthesised for authoritative
//! name errors.

use dns_wire::types::{
    DomainName, Header, Message, Opcode, Rcode, RecordClass, RecordData, ResourceRecord,
    MESSAGE_MAX_OCTETS,
};

/// The classic UDP payload ceiling, used when the client does not
/// advertise a bigger one via EDNS0.
pub const DEFAULT_UDP_PAYLOAD: u16 = 512;

// SOA timer values for synthesised authoritative records.
const SOA_REFRESH: u32 = 28800;
const SOA_RETRY: u32 = 7200;
const SOA_EXPIRE: u32 = 604_800;
const SOA_MIN_TTL: u32 = 300;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// Serialise a response within the transport's size budget.
///
/// Over-budget responses first lose their additional section.  If
/// that is not enough, a UDP response is emptied and marked truncated
/// so the client retries over TCP, while a TCP response (which has no
/// bigger transport to punt to) becomes a SERVFAIL.
pub fn shape_response(
    mut response: Message,
    transport: Transport,
    edns_payload_size: Option<u16>,
) -> Vec<u8> {
    let budget = match transport {
        Transport::Tcp => MESSAGE_MAX_OCTETS - 1,
        Transport::Udp => {
            usize::from(edns_payload_size.map_or(DEFAULT_UDP_PAYLOAD, |advertised| {
                advertised.max(DEFAULT_UDP_PAYLOAD)
            }))
        }
    };

    let id = response.header.id;
    let Ok(octets) = response.to_octets() else {
        return failure_octets(id);
    };
    if octets.len() <= budget {
        return octets.to_vec();
    }

    tracing::debug!(length = %octets.len(), %budget, "response too big, dropping additional records");
    response.additional.clear();
    let Ok(octets) = response.to_octets() else {
        return failure_octets(id);
    };
    if octets.len() <= budget {
        return octets.to_vec();
    }

    match transport {
        Transport::Udp => {
            tracing::debug!(length = %octets.len(), %budget, "response still too big, truncating");
            response.answers.clear();
            response.header.is_truncated = true;
            match response.to_octets() {
                Ok(octets) if octets.len() <= budget => octets.to_vec(),
                _ => failure_octets(id),
            }
        }
        Transport::Tcp => {
            tracing::debug!(length = %octets.len(), "response too big even for TCP");
            failure_octets(id)
        }
    }
}

/// A minimal SERVFAIL for when a response cannot be serialised or
/// shrunk into its budget.
fn failure_octets(id: u16) -> Vec<u8> {
    let failure = Message {
        header: Header {
            id,
            is_response: true,
            opcode: Opcode::Standard,
            is_authoritative: false,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: true,
            rcode: Rcode::ServerFailure,
        },
        questions: Vec::new(),
        answers: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
    };

    // a header-only message always serialises
    match failure.to_octets() {
        Ok(octets) => octets.to_vec(),
        Err(_) => Vec::new(),
    }
}

/// The SOA record placed in the authority section of an authoritative
/// NXDOMAIN.  The nameserver and mailbox names are synthesised under
/// the zone itself.
pub fn synthesise_soa(zone: &str, serial: u32, default_ttl: u32) -> Option<ResourceRecord> {
    let name = DomainName::from_dotted_string(zone)?;
    let mname = DomainName::from_dotted_string(&format!("ns.dns.{zone}"))?;
    let rname = DomainName::from_dotted_string(&format!("hostmaster.{zone}"))?;

    Some(ResourceRecord {
        name,
        data: RecordData::SOA {
            mname,
            rname,
            serial,
            refresh: SOA_REFRESH,
            retry: SOA_RETRY,
            expire: SOA_EXPIRE,
            minimum: SOA_MIN_TTL,
        },
        rclass: RecordClass::IN,
        ttl: default_ttl,
    })
}
