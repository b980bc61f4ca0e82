//! DNS wire codec
//!
//! Minimal, allocation-light operations on raw DNS wire bytes: extracting the
//! question name for domain-policy lookups, detecting NXDOMAIN responses, and
//! synthesizing a SERVFAIL reply. This module does not build or parse full
//! DNS messages — queries and responses are forwarded to/from upstreams as
//! opaque byte buffers; the resolver never needs more than these three
//! operations plus the synthetic probe query below.

use thiserror::Error;

/// Index of the question section, per RFC 1035 section 4.1.1 (12-byte header).
const HEADER_LEN: usize = 12;
/// RFC 1035 section 2.3.4: names are limited to 255 octets.
const MAX_NAME_LEN: usize = 255;
/// RFC 1035 section 2.3.4: labels are limited to 63 octets.
const MAX_LABEL_LEN: usize = 63;
/// Maximum size of a DNS message (the largest a TCP-framed message can be).
pub const MAX_MESSAGE_LEN: usize = 65536;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("message too short")]
    Truncated,
    #[error("label length out of range")]
    BadLabel,
    #[error("label contains characters outside [A-Za-z0-9-]")]
    BadChar,
    #[error("top-level label is not alphabetic")]
    BadTld,
    #[error("name exceeds 255 bytes")]
    NameTooLong,
    #[error("compression pointer not supported in question name")]
    Compressed,
}

/// Walk the length-prefixed label sequence of a DNS question name starting at
/// `offset`, validating each label is 1-63 bytes of `[A-Za-z0-9-]` and that the
/// top-level label (the last one before the root) is alphabetic-only.
///
/// Returns `(name, end_offset)` where `end_offset` points just past the
/// zero-length terminator.
fn parse_qname_strict(msg: &[u8], offset: usize) -> Result<(String, usize), WireError> {
    let mut pos = offset;
    let mut labels: Vec<&[u8]> = Vec::new();
    let mut total_len = 0usize;

    loop {
        let label_len = *msg.get(pos).ok_or(WireError::Truncated)? as usize;
        if label_len == 0 {
            pos += 1;
            break;
        }
        if label_len & 0xC0 != 0 {
            return Err(WireError::Compressed);
        }
        if label_len > MAX_LABEL_LEN {
            return Err(WireError::BadLabel);
        }
        let start = pos + 1;
        let end = start.checked_add(label_len).ok_or(WireError::Truncated)?;
        let label = msg.get(start..end).ok_or(WireError::Truncated)?;
        for &c in label {
            let ok = c.is_ascii_alphanumeric() || c == b'-';
            if !ok {
                return Err(WireError::BadChar);
            }
        }
        total_len += label_len + 1;
        if total_len > MAX_NAME_LEN {
            return Err(WireError::NameTooLong);
        }
        labels.push(label);
        pos = end;
    }

    if let Some(tld) = labels.last() {
        if !tld.iter().all(|c| c.is_ascii_alphabetic()) {
            return Err(WireError::BadTld);
        }
    }

    let name = labels
        .iter()
        .map(|l| std::str::from_utf8(l).expect("validated ascii"))
        .collect::<Vec<_>>()
        .join(".");
    Ok((name, pos))
}

/// Extract the QNAME of a DNS query's question section.
///
/// Returns `None` on any violation of the label rules (see module docs) or on
/// truncation. This is intentionally stricter than general wire-format
/// validity: it backs domain-policy lookups, so it only ever needs to
/// recognize well-formed hostnames.
pub fn extract_qname(msg: &[u8]) -> Option<String> {
    if msg.len() <= HEADER_LEN {
        return None;
    }
    parse_qname_strict(msg, HEADER_LEN).ok().map(|(name, _)| name)
}

/// Skip a (possibly compressed) domain name starting at `offset`. Used for
/// structural validation of arbitrary wire-format messages, where compression
/// pointers are legal (answer names almost always point back into the
/// question). Returns the offset just past the name.
fn skip_name(msg: &[u8], offset: usize) -> Option<usize> {
    let mut pos = offset;
    loop {
        let len = *msg.get(pos)? as usize;
        match len & 0xC0 {
            0x00 => {
                if len == 0 {
                    return Some(pos + 1);
                }
                pos = pos.checked_add(1 + len)?;
                if pos > msg.len() {
                    return None;
                }
            }
            0xC0 => {
                // Pointer: one more byte, then the name is done.
                msg.get(pos + 1)?;
                return Some(pos + 2);
            }
            _ => return None,
        }
    }
}

/// Skip one question section entry (name + QTYPE + QCLASS).
fn skip_question(msg: &[u8], offset: usize) -> Option<usize> {
    let pos = skip_name(msg, offset)?;
    let end = pos.checked_add(4)?;
    if end > msg.len() {
        return None;
    }
    Some(end)
}

/// Skip one resource-record entry (name + TYPE + CLASS + TTL + RDLENGTH +
/// RDATA).
fn skip_rr(msg: &[u8], offset: usize) -> Option<usize> {
    let pos = skip_name(msg, offset)?;
    let fixed_end = pos.checked_add(10)?; // TYPE(2)+CLASS(2)+TTL(4)+RDLENGTH(2)
    if fixed_end > msg.len() {
        return None;
    }
    let rdlength = u16::from_be_bytes([msg[pos + 8], msg[pos + 9]]) as usize;
    let end = fixed_end.checked_add(rdlength)?;
    if end > msg.len() {
        return None;
    }
    Some(end)
}

/// DNS header fields, decoded in place (no ownership of the underlying bytes).
struct Header {
    id: u16,
    flags: u16,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

fn parse_header(msg: &[u8]) -> Option<Header> {
    if msg.len() < HEADER_LEN {
        return None;
    }
    Some(Header {
        id: u16::from_be_bytes([msg[0], msg[1]]),
        flags: u16::from_be_bytes([msg[2], msg[3]]),
        qdcount: u16::from_be_bytes([msg[4], msg[5]]),
        ancount: u16::from_be_bytes([msg[6], msg[7]]),
        nscount: u16::from_be_bytes([msg[8], msg[9]]),
        arcount: u16::from_be_bytes([msg[10], msg[11]]),
    })
}

/// Result of structurally parsing a query: its id and the raw bytes of its
/// first question-section entry, suitable for echoing into a SERVFAIL reply.
struct ParsedQuery {
    id: u16,
    question: Vec<u8>,
}

/// Validate that `msg` is a structurally well-formed DNS message (header plus
/// walkable question/answer/authority/additional sections) and, if it has at
/// least one question, capture that question's raw bytes.
fn try_parse_query(msg: &[u8]) -> Option<ParsedQuery> {
    let header = parse_header(msg)?;
    let mut pos = HEADER_LEN;
    let mut first_question = None;
    for i in 0..header.qdcount {
        let end = skip_question(msg, pos)?;
        if i == 0 {
            first_question = Some(msg[pos..end].to_vec());
        }
        pos = end;
    }
    for _ in 0..(header.ancount as u32 + header.nscount as u32 + header.arcount as u32) {
        pos = skip_rr(msg, pos)?;
    }
    Some(ParsedQuery {
        id: header.id,
        question: first_question.unwrap_or_default(),
    })
}

/// RCODE 3: "Name Error" — the queried name does not exist.
const RCODE_NXDOMAIN: u16 = 3;
/// RCODE 2: "Server failure".
const RCODE_SERVFAIL: u16 = 2;
/// QR bit (response flag), high bit of the flags word.
const FLAG_QR: u16 = 0x8000;

/// Return whether `resp` is a DNS response with RCODE == NXDOMAIN (3).
/// Malformed responses (including ones that fail structural validation)
/// return `false`.
pub fn is_nxdomain(resp: &[u8]) -> bool {
    if try_parse_query(resp).is_none() {
        return false;
    }
    let Some(header) = parse_header(resp) else {
        return false;
    };
    (header.flags & 0x000F) == RCODE_NXDOMAIN
}

/// RCODE and answer presence of a structurally valid DNS response, enough
/// for a Do53 client to classify its result (`spec.md` §4.2).
pub struct ResponseSummary {
    pub rcode: u16,
    pub has_answers: bool,
}

/// Return `None` for anything that fails structural validation, so a Do53
/// client can distinguish "malformed bytes from the wire" from a real RCODE.
pub fn summarize_response(resp: &[u8]) -> Option<ResponseSummary> {
    try_parse_query(resp)?;
    let header = parse_header(resp)?;
    Some(ResponseSummary {
        rcode: header.flags & 0x000F,
        has_answers: header.ancount > 0,
    })
}

/// Build a SERVFAIL (RCODE 2) reply for `query`.
///
/// If `query` parses (structurally valid, size in `1..=MAX_MESSAGE_LEN`) its
/// transaction id and question section are echoed; otherwise a minimal
/// 12-byte header with id 0 is returned.
pub fn build_servfail(query: &[u8]) -> Vec<u8> {
    let parsed = if !query.is_empty() && query.len() <= MAX_MESSAGE_LEN {
        try_parse_query(query)
    } else {
        None
    };

    let (id, question) = match parsed {
        Some(p) => (p.id, p.question),
        None => (0u16, Vec::new()),
    };

    let mut out = Vec::with_capacity(HEADER_LEN + question.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&(FLAG_QR | RCODE_SERVFAIL).to_be_bytes());
    let qdcount: u16 = if question.is_empty() { 0 } else { 1 };
    out.extend_from_slice(&qdcount.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT
    out.extend_from_slice(&question);
    out
}

/// Wire-format probe query for `www.gstatic.com A`, used by the probe engine
/// (see `crate::dns::probe`) to validate upstreams. The transaction id is
/// zero — probe results are matched by callback identity, not by id — and the
/// message carries an empty EDNS0 OPT record, matching what real stub
/// resolvers emit.
pub fn probe_query_gstatic() -> Vec<u8> {
    const RAW: &[u8] = &[
        0x00, 0x00, 0x01, 0x20, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x03, b'w', b'w',
        b'w', 0x07, b'g', b's', b't', b'a', b't', b'i', b'c', 0x03, b'c', b'o', b'm', 0x00, 0x00,
        0x01, 0x00, 0x01, 0x00, 0x00, 0x29, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    RAW.to_vec()
}

/// Extract the address of the first A record in a response's answer
/// section, used only to resolve a DoH provider's hostname via bootstrap
/// Do53 (`spec.md` §4.3) — never for query processing itself.
pub fn extract_first_a_record(resp: &[u8]) -> Option<std::net::Ipv4Addr> {
    let header = parse_header(resp)?;
    let mut pos = HEADER_LEN;
    for _ in 0..header.qdcount {
        pos = skip_question(resp, pos)?;
    }
    for _ in 0..header.ancount {
        let name_end = skip_name(resp, pos)?;
        let fixed_end = name_end.checked_add(10)?;
        if fixed_end > resp.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([resp[name_end], resp[name_end + 1]]);
        let rdlength = u16::from_be_bytes([resp[name_end + 8], resp[name_end + 9]]) as usize;
        let rdata_end = fixed_end.checked_add(rdlength)?;
        if rdata_end > resp.len() {
            return None;
        }
        if rtype == 1 && rdlength == 4 {
            let rdata = &resp[fixed_end..rdata_end];
            return Some(std::net::Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
        }
        pos = rdata_end;
    }
    None
}

/// Extract the transaction id of a wire-format message without validating the
/// rest of its structure. Used for matching replies to client requests.
pub fn extract_id(msg: &[u8]) -> Option<u16> {
    if msg.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([msg[0], msg[1]]))
}
