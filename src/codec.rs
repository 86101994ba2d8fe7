//! Tunnel payload codec
//!
//! Packs a session ClientID, random padding, and a length-prefixed
//! payload into lowercase base32 labels under the tunnel suffix domain,
//! and shapes the outer tunnel messages (TXT answers, error responses,
//! query validation).
//!
//! Frame header byte `L`: `L < 0xe0` is a data frame of `L` bytes,
//! `L >= 0xe0` is a padding frame of `L - 0xe0` random bytes.

use crate::message::{
    self, Message, Name, Rr, WireError, CLASS_IN, RCODE_NO_ERROR, RR_TYPE_A, RR_TYPE_AAAA,
    RR_TYPE_TXT,
};
use base32::Alphabet;
use bytes::BufMut;
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;

/// Size of the per-session client identifier
pub const CLIENT_ID_SIZE: usize = 8;

/// Minimum padding bytes for queries carrying data
pub const MIN_PADDING: usize = 3;
/// Maximum padding bytes for queries carrying data
pub const MAX_PADDING: usize = 8;
/// Minimum padding bytes for empty (poll) queries, inflating them
pub const MIN_PADDING_POLL: usize = 8;

/// Frame header values at or above this encode padding
pub const PADDING_PREFIX_BASE: usize = 0xe0;

const BASE32_ALPHABET: Alphabet = Alphabet::RFC4648 { padding: false };

/// Errors produced by the payload codec and tunnel message shaping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("payload too long to encode in DNS name")]
    PayloadTooLong,

    #[error("invalid encoded payload")]
    InvalidPayload,

    #[error("base32 decode failed")]
    Base32,

    #[error("name is not under the tunnel domain")]
    NotAuthoritative,

    #[error("invalid tunnel query")]
    InvalidQuery,

    #[error("invalid tunnel response")]
    InvalidResponse,

    #[error("no tunnel answer in response")]
    NoAnswer,

    #[error("unsupported opcode")]
    UnsupportedOpcode,

    #[error("EDNS0 payload size too small")]
    EdnsTooSmall,

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// An 8-byte opaque per-session client identifier.
///
/// Carried in every tunneled query; the server does not currently key
/// state on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId([u8; CLIENT_ID_SIZE]);

impl ClientId {
    /// Generates a fresh random identifier for this session.
    pub fn random() -> Self {
        let mut id = [0u8; CLIENT_ID_SIZE];
        SystemRandom::new()
            .fill(&mut id)
            .expect("system random generator failed");
        ClientId(id)
    }

    pub fn from_bytes(bytes: [u8; CLIENT_ID_SIZE]) -> Self {
        ClientId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Available payload bytes for a query name under `domain`.
///
/// Accounts for the trailing zero, the suffix labels, the worst-case
/// 63/64 fill of labels, and the 8/5 expansion of base32.
pub fn name_capacity(domain: &Name) -> usize {
    let mut capacity = message::MAX_NAME_LENGTH - 1;
    for label in domain.labels() {
        capacity -= label.len() + 1;
    }
    capacity = capacity * 63 / 64;
    capacity * 5 / 8
}

/// Encodes `payload` into a query name under `domain`.
///
/// Layout before base32: ClientID, one padding frame, then a data frame
/// if the payload is non-empty.
pub fn encode_payload(
    payload: &[u8],
    client_id: ClientId,
    domain: &Name,
) -> Result<Name, CodecError> {
    let capacity = name_capacity(domain);
    let rng = SystemRandom::new();

    let mut raw = Vec::with_capacity(CLIENT_ID_SIZE + 1 + MAX_PADDING + 1 + payload.len());
    raw.extend_from_slice(client_id.as_bytes());

    // Poll queries get extra padding so they do not stand out as the
    // shortest names on the wire.
    let min_padding = if payload.is_empty() {
        MIN_PADDING_POLL
    } else {
        MIN_PADDING
    };
    let mut rand_byte = [0u8; 1];
    rng.fill(&mut rand_byte)
        .map_err(|_| CodecError::InvalidPayload)?;
    let padding_len = min_padding + rand_byte[0] as usize % (MAX_PADDING - MIN_PADDING + 1);

    raw.put_u8((PADDING_PREFIX_BASE + padding_len) as u8);
    let mut padding = vec![0u8; padding_len];
    rng.fill(&mut padding)
        .map_err(|_| CodecError::InvalidPayload)?;
    raw.extend_from_slice(&padding);

    if !payload.is_empty() {
        if payload.len() >= PADDING_PREFIX_BASE {
            return Err(CodecError::PayloadTooLong);
        }
        raw.put_u8(payload.len() as u8);
        raw.extend_from_slice(payload);
    }

    if raw.len() > capacity {
        return Err(CodecError::PayloadTooLong);
    }

    let encoded = base32::encode(BASE32_ALPHABET, &raw).to_ascii_lowercase();

    let mut labels: Vec<Vec<u8>> = encoded
        .as_bytes()
        .chunks(message::MAX_LABEL_LENGTH)
        .map(|chunk| chunk.to_vec())
        .collect();
    labels.extend(domain.labels().iter().cloned());

    Ok(Name::new(labels)?)
}

/// Decodes a query name back into the ClientID and payload.
///
/// The frame loop is general: any run of padding frames is skipped and
/// all data frames are concatenated in order.
pub fn decode_payload(name: &Name, domain: &Name) -> Result<(ClientId, Vec<u8>), CodecError> {
    let prefix = name.trim_suffix(domain).ok_or(CodecError::NotAuthoritative)?;

    let mut joined = Vec::new();
    for label in prefix.labels() {
        joined.extend_from_slice(label);
    }
    joined.make_ascii_uppercase();
    let joined = String::from_utf8(joined).map_err(|_| CodecError::Base32)?;

    let decoded = base32::decode(BASE32_ALPHABET, &joined).ok_or(CodecError::Base32)?;

    if decoded.len() < CLIENT_ID_SIZE {
        return Err(CodecError::InvalidPayload);
    }
    let mut id = [0u8; CLIENT_ID_SIZE];
    id.copy_from_slice(&decoded[..CLIENT_ID_SIZE]);
    let client_id = ClientId::from_bytes(id);

    let mut payload = Vec::new();
    let mut rest = &decoded[CLIENT_ID_SIZE..];
    while let Some((&header, body)) = rest.split_first() {
        let header = header as usize;
        if header >= PADDING_PREFIX_BASE {
            let padding_len = header - PADDING_PREFIX_BASE;
            if body.len() < padding_len {
                return Err(CodecError::InvalidPayload);
            }
            rest = &body[padding_len..];
        } else {
            if body.len() < header {
                return Err(CodecError::InvalidPayload);
            }
            payload.extend_from_slice(&body[..header]);
            rest = &body[header..];
        }
    }

    Ok((client_id, payload))
}

/// Extracts the ClientID and encoded payload from a tunnel query.
pub fn extract_query_payload(
    msg: &Message,
    domain: &Name,
) -> Result<(ClientId, Vec<u8>), CodecError> {
    if msg.is_response() {
        return Err(CodecError::InvalidQuery);
    }
    if msg.question.len() != 1 {
        return Err(CodecError::InvalidQuery);
    }

    let q = &msg.question[0];

    // TXT is the workhorse; A/AAAA are accepted for variation.
    if q.qtype != RR_TYPE_TXT && q.qtype != RR_TYPE_A && q.qtype != RR_TYPE_AAAA {
        return Err(CodecError::InvalidQuery);
    }

    decode_payload(&q.name, domain)
}

/// Extracts the tunneled payload from the first TXT answer whose owner
/// name falls under `domain`.
pub fn extract_response_payload(msg: &Message, domain: &Name) -> Result<Vec<u8>, CodecError> {
    if !msg.is_response() {
        return Err(CodecError::InvalidResponse);
    }
    if msg.rcode() != RCODE_NO_ERROR {
        return Err(CodecError::InvalidResponse);
    }

    for rr in &msg.answer {
        if rr.rtype != RR_TYPE_TXT {
            continue;
        }
        if rr.name.trim_suffix(domain).is_none() {
            continue;
        }
        if let Ok(data) = message::decode_txt_data(&rr.data) {
            return Ok(data);
        }
    }

    Err(CodecError::NoAnswer)
}

/// Creates the authoritative tunnel response: one TXT answer owning the
/// question name, RDATA = character-string-packed `payload`.
pub fn create_tunnel_response(
    query: &Message,
    payload: &[u8],
    ttl: u32,
) -> Result<Message, CodecError> {
    if query.question.len() != 1 {
        return Err(CodecError::InvalidQuery);
    }

    let mut resp = message::create_response(query);
    resp.flags |= 0x0400; // AA=1

    resp.answer = vec![Rr {
        name: query.question[0].name.clone(),
        rtype: RR_TYPE_TXT,
        class: CLASS_IN,
        ttl,
        data: message::encode_txt_data(payload),
    }];

    let edns_size = query.edns0_size();
    if edns_size > 0 {
        resp.add_edns0(edns_size);
    }

    Ok(resp)
}

/// Creates an error response with the given RCODE. The AA bit is set
/// only when the query name falls under the tunnel domain.
pub fn create_error_response(query: &Message, domain: &Name, rcode: u16) -> Message {
    let mut resp = message::create_response(query);
    resp.set_rcode(rcode);

    if let [q] = query.question.as_slice() {
        if q.name.trim_suffix(domain).is_some() {
            resp.flags |= 0x0400; // AA=1
        }
    }

    let edns_size = query.edns0_size();
    if edns_size > 0 {
        resp.add_edns0(edns_size);
    }

    resp
}

/// Validates an inbound tunnel query before any decoding work.
pub fn validate_query(msg: &Message, domain: &Name, min_edns_size: u16) -> Result<(), CodecError> {
    if msg.is_response() {
        return Err(CodecError::InvalidQuery);
    }
    if msg.opcode() != 0 {
        return Err(CodecError::UnsupportedOpcode);
    }
    if msg.question.len() != 1 {
        return Err(CodecError::InvalidQuery);
    }

    let q = &msg.question[0];
    if q.name.trim_suffix(domain).is_none() {
        return Err(CodecError::NotAuthoritative);
    }

    if min_edns_size > 0 && msg.edns0_size() < min_edns_size {
        return Err(CodecError::EdnsTooSmall);
    }

    Ok(())
}

/// Returns true if the message looks like a tunnel response we can
/// extract a payload from.
pub fn is_valid_tunnel_response(msg: &Message, domain: &Name) -> bool {
    if !msg.is_response() || msg.rcode() != RCODE_NO_ERROR {
        return false;
    }
    msg.answer
        .iter()
        .any(|rr| rr.rtype == RR_TYPE_TXT && rr.name.trim_suffix(domain).is_some())
}

/// Packs multiple packets into a u16-length-prefixed byte stream for
/// TXT RDATA carrying more than one unit.
pub fn encode_response(packets: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    for p in packets {
        if p.len() > u16::MAX as usize {
            continue;
        }
        buf.put_u16(p.len() as u16);
        buf.put_slice(p);
    }
    buf
}

/// Inverse of [`encode_response`].
pub fn decode_response(data: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    let mut packets = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(CodecError::InvalidPayload);
        }
        let length = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        if rest.len() < length {
            return Err(CodecError::InvalidPayload);
        }
        packets.push(rest[..length].to_vec());
        rest = &rest[length..];
    }

    Ok(packets)
}

/// A random outer query ID.
pub fn generate_query_id() -> u16 {
    rand::random::<u16>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{create_query, RR_TYPE_OPT};

    fn domain() -> Name {
        Name::parse("t.example.com").unwrap()
    }

    #[test]
    fn test_client_id_random_distinct() {
        let a = ClientId::random();
        let b = ClientId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_bytes().len(), CLIENT_ID_SIZE);
    }

    #[test]
    fn test_capacity_model() {
        let domain = domain();

        // 255 - 1 - (2 + 8 + 4) = 240; 240*63/64 = 236; 236*5/8 = 147
        assert_eq!(name_capacity(&domain), 147);

        // A longer suffix leaves less room
        let longer = Name::parse("tunnel.deep.subdomain.example.com").unwrap();
        assert!(name_capacity(&longer) < name_capacity(&domain));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let domain = domain();
        let client_id = ClientId::random();
        let payload = b"the quick brown fox jumps over the lazy dog";

        let name = encode_payload(payload, client_id, &domain).unwrap();
        let (got_id, got_payload) = decode_payload(&name, &domain).unwrap();

        assert_eq!(got_id, client_id);
        assert_eq!(got_payload, payload);
    }

    #[test]
    fn test_encode_respects_name_limits() {
        let domain = domain();
        let client_id = ClientId::random();
        let payload = vec![0xabu8; name_capacity(&domain) - CLIENT_ID_SIZE - 1 - MAX_PADDING - 1];

        let name = encode_payload(&payload, client_id, &domain).unwrap();

        assert!(name.wire_len() <= message::MAX_NAME_LENGTH);
        for label in name.labels() {
            assert!(label.len() <= message::MAX_LABEL_LENGTH);
        }
    }

    #[test]
    fn test_encode_empty_poll_roundtrip() {
        let domain = domain();
        let client_id = ClientId::random();

        let name = encode_payload(&[], client_id, &domain).unwrap();
        let (got_id, got_payload) = decode_payload(&name, &domain).unwrap();

        assert_eq!(got_id, client_id);
        assert!(got_payload.is_empty());

        // Poll queries carry at least MIN_PADDING_POLL bytes of padding
        // on top of the ClientID and header.
        let prefix = name.trim_suffix(&domain).unwrap();
        let encoded_len: usize = prefix.labels().iter().map(|l| l.len()).sum();
        let raw_len = encoded_len * 5 / 8;
        assert!(raw_len >= CLIENT_ID_SIZE + 1 + MIN_PADDING_POLL);
    }

    #[test]
    fn test_encode_rejects_oversize_payload() {
        let domain = domain();
        let client_id = ClientId::random();

        // Over the frame-header limit
        let too_long = vec![0u8; PADDING_PREFIX_BASE];
        assert_eq!(
            encode_payload(&too_long, client_id, &domain),
            Err(CodecError::PayloadTooLong)
        );

        // Under the header limit but over the name capacity
        let deep = Name::parse(
            "a-very-long-tunnel-subdomain-label-eating-most-of-the-name.example.com",
        )
        .unwrap();
        let over_capacity = vec![0u8; PADDING_PREFIX_BASE - 1];
        assert!(over_capacity.len() > name_capacity(&deep));
        assert_eq!(
            encode_payload(&over_capacity, client_id, &deep),
            Err(CodecError::PayloadTooLong)
        );
    }

    #[test]
    fn test_decode_wrong_suffix_fails() {
        let domain = domain();
        let client_id = ClientId::random();

        let name = encode_payload(b"data", client_id, &domain).unwrap();
        let other = Name::parse("u.example.com").unwrap();

        assert_eq!(
            decode_payload(&name, &other),
            Err(CodecError::NotAuthoritative)
        );
    }

    #[test]
    fn test_decode_garbage_labels_fail() {
        let domain = domain();
        let mut labels = vec![b"not-base32-&&&".to_vec()];
        labels.extend(domain.labels().iter().cloned());
        let name = Name::new(labels).unwrap();

        assert_eq!(decode_payload(&name, &domain), Err(CodecError::Base32));
    }

    #[test]
    fn test_decode_short_payload_fails() {
        let domain = domain();
        // Three raw bytes: shorter than a ClientID.
        let encoded = base32::encode(BASE32_ALPHABET, &[1, 2, 3]).to_ascii_lowercase();
        let mut labels = vec![encoded.into_bytes()];
        labels.extend(domain.labels().iter().cloned());
        let name = Name::new(labels).unwrap();

        assert_eq!(
            decode_payload(&name, &domain),
            Err(CodecError::InvalidPayload)
        );
    }

    #[test]
    fn test_decode_accumulates_multiple_data_frames() {
        let domain = domain();
        let mut raw = Vec::new();
        raw.extend_from_slice(&[9u8; CLIENT_ID_SIZE]);
        raw.put_u8((PADDING_PREFIX_BASE + 2) as u8);
        raw.extend_from_slice(&[0, 0]);
        raw.put_u8(3);
        raw.extend_from_slice(b"abc");
        raw.put_u8((PADDING_PREFIX_BASE + 1) as u8);
        raw.put_u8(0);
        raw.put_u8(2);
        raw.extend_from_slice(b"de");

        let encoded = base32::encode(BASE32_ALPHABET, &raw).to_ascii_lowercase();
        let mut labels: Vec<Vec<u8>> = encoded
            .as_bytes()
            .chunks(message::MAX_LABEL_LENGTH)
            .map(|c| c.to_vec())
            .collect();
        labels.extend(domain.labels().iter().cloned());
        let name = Name::new(labels).unwrap();

        let (id, payload) = decode_payload(&name, &domain).unwrap();
        assert_eq!(id, ClientId::from_bytes([9u8; 8]));
        assert_eq!(payload, b"abcde");
    }

    #[test]
    fn test_decode_truncated_frame_fails() {
        let domain = domain();
        let mut raw = Vec::new();
        raw.extend_from_slice(&[1u8; CLIENT_ID_SIZE]);
        raw.put_u8(10); // claims 10 data bytes
        raw.extend_from_slice(b"abc"); // only 3 present

        let encoded = base32::encode(BASE32_ALPHABET, &raw).to_ascii_lowercase();
        let mut labels = vec![encoded.into_bytes()];
        labels.extend(domain.labels().iter().cloned());
        let name = Name::new(labels).unwrap();

        assert_eq!(
            decode_payload(&name, &domain),
            Err(CodecError::InvalidPayload)
        );
    }

    #[test]
    fn test_decode_arbitrary_labels_never_panic() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let domain = domain();
        let mut rng = StdRng::seed_from_u64(0x7061_796b);
        let alphabet = b"abcdefghijklmnopqrstuvwxyz234567=&.-";

        for _ in 0..2000 {
            let label_count = rng.gen_range(1..4);
            let mut labels = Vec::new();
            for _ in 0..label_count {
                let len = rng.gen_range(1..=message::MAX_LABEL_LENGTH);
                let label: Vec<u8> = (0..len)
                    .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                    .collect();
                labels.push(label);
            }
            labels.extend(domain.labels().iter().cloned());

            let Ok(name) = Name::new(labels) else {
                continue;
            };
            // Must return a typed error or a decoded payload, never panic.
            let _ = decode_payload(&name, &domain);
        }
    }

    #[test]
    fn test_extract_query_payload() {
        let domain = domain();
        let client_id = ClientId::random();
        let name = encode_payload(b"inner", client_id, &domain).unwrap();

        let query = create_query(name, RR_TYPE_TXT, 42);
        let (id, payload) = extract_query_payload(&query, &domain).unwrap();
        assert_eq!(id, client_id);
        assert_eq!(payload, b"inner");

        // Responses and unexpected query types are rejected
        let mut resp = query.clone();
        resp.set_response();
        assert_eq!(
            extract_query_payload(&resp, &domain),
            Err(CodecError::InvalidQuery)
        );

        let mut wrong_type = query;
        wrong_type.question[0].qtype = RR_TYPE_OPT;
        assert_eq!(
            extract_query_payload(&wrong_type, &domain),
            Err(CodecError::InvalidQuery)
        );
    }

    #[test]
    fn test_tunnel_response_roundtrip() {
        let domain = domain();
        let client_id = ClientId::random();
        let name = encode_payload(b"q", client_id, &domain).unwrap();
        let mut query = create_query(name, RR_TYPE_TXT, 7);
        query.add_edns0(4096);

        let payload = vec![0x55u8; 300];
        let resp = create_tunnel_response(&query, &payload, 60).unwrap();

        assert!(resp.is_response());
        assert_ne!(resp.flags & 0x0400, 0); // AA
        assert_eq!(resp.edns0_size(), 4096);
        assert_eq!(resp.answer.len(), 1);
        assert_eq!(resp.answer[0].name, query.question[0].name);

        assert!(is_valid_tunnel_response(&resp, &domain));
        assert_eq!(extract_response_payload(&resp, &domain).unwrap(), payload);
    }

    #[test]
    fn test_error_response_aa_only_inside_domain() {
        let domain = domain();
        let client_id = ClientId::random();

        let inside = create_query(
            encode_payload(b"x", client_id, &domain).unwrap(),
            RR_TYPE_TXT,
            1,
        );
        let resp = create_error_response(&inside, &domain, crate::message::RCODE_SERVER_FAIL);
        assert_ne!(resp.flags & 0x0400, 0);
        assert_eq!(resp.rcode(), crate::message::RCODE_SERVER_FAIL);

        let outside = create_query(Name::parse("example.org").unwrap(), RR_TYPE_A, 2);
        let resp = create_error_response(&outside, &domain, crate::message::RCODE_NAME_ERROR);
        assert_eq!(resp.flags & 0x0400, 0);
    }

    #[test]
    fn test_validate_query() {
        let domain = domain();
        let client_id = ClientId::random();
        let name = encode_payload(b"x", client_id, &domain).unwrap();

        let mut query = create_query(name.clone(), RR_TYPE_TXT, 1);
        query.add_edns0(4096);
        assert!(validate_query(&query, &domain, 1232).is_ok());

        // Foreign name
        let foreign = create_query(Name::parse("example.org").unwrap(), RR_TYPE_TXT, 1);
        assert_eq!(
            validate_query(&foreign, &domain, 0),
            Err(CodecError::NotAuthoritative)
        );

        // Non-query opcode
        let mut notify = create_query(name.clone(), RR_TYPE_TXT, 1);
        notify.flags |= 4 << 11;
        assert_eq!(
            validate_query(&notify, &domain, 0),
            Err(CodecError::UnsupportedOpcode)
        );

        // Missing EDNS when a minimum is required
        let bare = create_query(name, RR_TYPE_TXT, 1);
        assert_eq!(
            validate_query(&bare, &domain, 1232),
            Err(CodecError::EdnsTooSmall)
        );
    }

    #[test]
    fn test_length_prefixed_response_roundtrip() {
        let packets = vec![b"one".to_vec(), Vec::new(), vec![0xffu8; 600]];
        let encoded = encode_response(&packets);
        let decoded = decode_response(&encoded).unwrap();
        assert_eq!(decoded, packets);

        assert_eq!(decode_response(&[0, 5, 1]), Err(CodecError::InvalidPayload));
        assert_eq!(decode_response(&[7]), Err(CodecError::InvalidPayload));
    }
}
