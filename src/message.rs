//! DNS wire-format encoding and decoding
//!
//! Implements just enough of RFC 1035 to round-trip the queries and
//! responses the tunnel carries: header + four record sections, name
//! compression on both read and write, TXT character-string packing,
//! and the EDNS(0) OPT pseudo-record (RFC 6891) with the UDP payload
//! size in the class field.

use bytes::BufMut;
use std::collections::HashMap;
use std::fmt;

/// Record type: IPv4 address
pub const RR_TYPE_A: u16 = 1;
/// Record type: IPv6 address
pub const RR_TYPE_AAAA: u16 = 28;
/// Record type: text strings
pub const RR_TYPE_TXT: u16 = 16;
/// Record type: EDNS(0) OPT pseudo-record
pub const RR_TYPE_OPT: u16 = 41;

/// Class: Internet
pub const CLASS_IN: u16 = 1;

/// Response code: no error
pub const RCODE_NO_ERROR: u16 = 0;
/// Response code: format error
pub const RCODE_FORMAT_ERROR: u16 = 1;
/// Response code: server failure
pub const RCODE_SERVER_FAIL: u16 = 2;
/// Response code: name error (NXDOMAIN)
pub const RCODE_NAME_ERROR: u16 = 3;
/// Response code: not implemented
pub const RCODE_NOT_IMPL: u16 = 4;
/// Response code: refused
pub const RCODE_REFUSED: u16 = 5;

/// Maximum bytes in a single DNS label
pub const MAX_LABEL_LENGTH: usize = 63;
/// Maximum wire size of a DNS name
pub const MAX_NAME_LENGTH: usize = 255;
/// Classic DNS/UDP message limit
pub const MAX_UDP_SIZE: usize = 512;
/// EDNS(0) message limit the tunnel advertises
pub const MAX_EDNS_SIZE: usize = 4096;

/// Compression pointer dereference budget per name
const COMPRESSION_POINTER_LIMIT: usize = 10;

/// Errors produced by the wire codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("name contains a zero-length label")]
    ZeroLengthLabel,

    #[error("label exceeds 63 bytes")]
    LabelTooLong,

    #[error("name exceeds 255 bytes")]
    NameTooLong,

    #[error("too many compression pointers")]
    TooManyPointers,

    #[error("reserved label type")]
    ReservedLabelType,

    #[error("trailing bytes after message")]
    TrailingBytes,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("unexpected end of message")]
    UnexpectedEof,
}

/// A DNS domain name as an ordered sequence of labels.
///
/// The empty label sequence is the root. Comparison and suffix tests
/// fold ASCII case, matching resolver behavior.
#[derive(Clone, Debug, Default, Eq)]
pub struct Name(Vec<Vec<u8>>);

impl Name {
    /// Creates a name from labels after validating label and name limits.
    pub fn new(labels: Vec<Vec<u8>>) -> Result<Self, WireError> {
        let mut total = 0usize;
        for label in &labels {
            if label.is_empty() {
                return Err(WireError::ZeroLengthLabel);
            }
            if label.len() > MAX_LABEL_LENGTH {
                return Err(WireError::LabelTooLong);
            }
            total += label.len() + 1;
        }
        total += 1; // null terminator
        if total > MAX_NAME_LENGTH {
            return Err(WireError::NameTooLong);
        }
        Ok(Name(labels))
    }

    /// Parses a dot-separated domain name string.
    pub fn parse(s: &str) -> Result<Self, WireError> {
        let s = s.strip_suffix('.').unwrap_or(s);
        if s.is_empty() {
            return Ok(Name::default());
        }
        let labels = s.split('.').map(|part| part.as_bytes().to_vec()).collect();
        Name::new(labels)
    }

    /// The root name (empty label list).
    pub fn root() -> Self {
        Name::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn labels(&self) -> &[Vec<u8>] {
        &self.0
    }

    /// Total size of the name in uncompressed wire format.
    pub fn wire_len(&self) -> usize {
        self.0.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// Removes `suffix` from the end of the name, comparing labels
    /// case-insensitively. Returns the remaining prefix labels.
    pub fn trim_suffix(&self, suffix: &Name) -> Option<Name> {
        if self.0.len() < suffix.0.len() {
            return None;
        }
        let split = self.0.len() - suffix.0.len();
        let (fore, aft) = self.0.split_at(split);
        for (a, b) in aft.iter().zip(suffix.0.iter()) {
            if !a.eq_ignore_ascii_case(b) {
                return None;
            }
        }
        Some(Name(fore.to_vec()))
    }

    /// Dotted string of the labels starting at index `from`, used as a
    /// compression cache key during marshalling.
    fn suffix_string(&self, from: usize) -> String {
        Name(self.0[from..].to_vec()).to_string()
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, ".");
        }
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            for &b in label {
                if b == b'-' || b.is_ascii_alphanumeric() {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "\\x{:02x}", b)?;
                }
            }
        }
        Ok(())
    }
}

/// A DNS question.
#[derive(Clone, Debug, PartialEq)]
pub struct Question {
    pub name: Name,
    pub qtype: u16,
    pub class: u16,
}

/// A DNS resource record with opaque RDATA.
#[derive(Clone, Debug, PartialEq)]
pub struct Rr {
    pub name: Name,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: Vec<u8>,
}

/// A DNS message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub question: Vec<Question>,
    pub answer: Vec<Rr>,
    pub authority: Vec<Rr>,
    pub additional: Vec<Rr>,
}

impl Message {
    /// The OPCODE bits of the flags word.
    pub fn opcode(&self) -> u16 {
        (self.flags >> 11) & 0xf
    }

    /// The RCODE bits of the flags word.
    pub fn rcode(&self) -> u16 {
        self.flags & 0xf
    }

    pub fn is_query(&self) -> bool {
        self.flags & 0x8000 == 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Sets QR=1 (response).
    pub fn set_response(&mut self) {
        self.flags |= 0x8000;
    }

    pub fn set_rcode(&mut self, rcode: u16) {
        self.flags = (self.flags & 0xfff0) | (rcode & 0xf);
    }

    /// Appends an EDNS(0) OPT record advertising `udp_size`.
    pub fn add_edns0(&mut self, udp_size: u16) {
        self.additional.push(Rr {
            name: Name::root(),
            rtype: RR_TYPE_OPT,
            class: udp_size,
            ttl: 0,
            data: Vec::new(),
        });
    }

    /// The advertised EDNS(0) UDP payload size, or 0 if absent.
    pub fn edns0_size(&self) -> u16 {
        self.additional
            .iter()
            .find(|rr| rr.rtype == RR_TYPE_OPT)
            .map(|rr| rr.class)
            .unwrap_or(0)
    }

    /// Parses a DNS message from wire format.
    ///
    /// Names may use compression pointers; after the first pointer the
    /// outer read resumes at the byte following it. Trailing bytes after
    /// the counted sections are an error.
    pub fn parse(buf: &[u8]) -> Result<Message, WireError> {
        let mut r = Reader::new(buf);

        let mut msg = Message {
            id: r.read_u16()?,
            flags: r.read_u16()?,
            ..Default::default()
        };
        let qd_count = r.read_u16()?;
        let an_count = r.read_u16()?;
        let ns_count = r.read_u16()?;
        let ar_count = r.read_u16()?;

        for _ in 0..qd_count {
            msg.question.push(read_question(&mut r)?);
        }
        for _ in 0..an_count {
            msg.answer.push(read_rr(&mut r)?);
        }
        for _ in 0..ns_count {
            msg.authority.push(read_rr(&mut r)?);
        }
        for _ in 0..ar_count {
            msg.additional.push(read_rr(&mut r)?);
        }

        if r.remaining() > 0 {
            return Err(WireError::TrailingBytes);
        }

        Ok(msg)
    }

    /// Converts the message to wire format, emitting compression
    /// pointers for name suffixes already written at offsets that fit
    /// in the 14-bit pointer field.
    pub fn marshal(&self) -> Result<Vec<u8>, WireError> {
        let mut b = MessageBuilder::new();

        b.buf.put_u16(self.id);
        b.buf.put_u16(self.flags);

        for count in [
            self.question.len(),
            self.answer.len(),
            self.authority.len(),
            self.additional.len(),
        ] {
            let c = u16::try_from(count).map_err(|_| WireError::IntegerOverflow)?;
            b.buf.put_u16(c);
        }

        for q in &self.question {
            b.write_question(q);
        }
        for rr in self
            .answer
            .iter()
            .chain(self.authority.iter())
            .chain(self.additional.iter())
        {
            b.write_rr(rr)?;
        }

        Ok(b.buf)
    }
}

/// Byte reader over a message buffer with seek support for
/// compression pointers.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let b = *self.buf.get(self.pos).ok_or(WireError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::UnexpectedEof)?;
        if end > self.buf.len() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

/// Reads a possibly-compressed name. The pointer budget caps
/// adversarial pointer chains and self-referencing loops.
fn read_name(r: &mut Reader<'_>) -> Result<Name, WireError> {
    let mut labels: Vec<Vec<u8>> = Vec::new();
    let mut num_pointers = 0usize;
    let mut resume_at: Option<usize> = None;

    loop {
        let label_type = r.read_u8()?;
        match label_type & 0xc0 {
            0x00 => {
                let length = (label_type & 0x3f) as usize;
                if length == 0 {
                    // End of name; restore the outer cursor if we
                    // followed a pointer.
                    if let Some(pos) = resume_at {
                        r.pos = pos;
                    }
                    return Name::new(labels);
                }
                labels.push(r.read_bytes(length)?.to_vec());
            }
            0xc0 => {
                let upper = (label_type & 0x3f) as usize;
                let lower = r.read_u8()? as usize;
                let offset = (upper << 8) | lower;

                if num_pointers == 0 {
                    resume_at = Some(r.pos);
                }
                num_pointers += 1;
                if num_pointers > COMPRESSION_POINTER_LIMIT {
                    return Err(WireError::TooManyPointers);
                }

                r.pos = offset;
            }
            // 0x40 and 0x80 label types are reserved
            _ => return Err(WireError::ReservedLabelType),
        }
    }
}

fn read_question(r: &mut Reader<'_>) -> Result<Question, WireError> {
    Ok(Question {
        name: read_name(r)?,
        qtype: r.read_u16()?,
        class: r.read_u16()?,
    })
}

fn read_rr(r: &mut Reader<'_>) -> Result<Rr, WireError> {
    let name = read_name(r)?;
    let rtype = r.read_u16()?;
    let class = r.read_u16()?;
    let ttl = r.read_u32()?;
    let rd_length = r.read_u16()? as usize;
    let data = r.read_bytes(rd_length)?.to_vec();
    Ok(Rr {
        name,
        rtype,
        class,
        ttl,
        data,
    })
}

/// Accumulates wire output and the single-pass name cache used for
/// compression. Only offsets that fit in 14 bits are reusable.
struct MessageBuilder {
    buf: Vec<u8>,
    name_cache: HashMap<String, usize>,
}

impl MessageBuilder {
    fn new() -> Self {
        MessageBuilder {
            buf: Vec::with_capacity(MAX_UDP_SIZE),
            name_cache: HashMap::new(),
        }
    }

    fn write_name(&mut self, name: &Name) {
        for i in 0..name.labels().len() {
            let suffix = name.suffix_string(i);
            if let Some(&ptr) = self.name_cache.get(&suffix) {
                if ptr & 0x3fff == ptr {
                    self.buf.put_u16(0xc000 | ptr as u16);
                    return;
                }
            }

            self.name_cache.insert(suffix, self.buf.len());
            let label = &name.labels()[i];
            self.buf.put_u8(label.len() as u8);
            self.buf.put_slice(label);
        }
        self.buf.put_u8(0);
    }

    fn write_question(&mut self, q: &Question) {
        self.write_name(&q.name);
        self.buf.put_u16(q.qtype);
        self.buf.put_u16(q.class);
    }

    fn write_rr(&mut self, rr: &Rr) -> Result<(), WireError> {
        self.write_name(&rr.name);
        self.buf.put_u16(rr.rtype);
        self.buf.put_u16(rr.class);
        self.buf.put_u32(rr.ttl);

        let rd_length = u16::try_from(rr.data.len()).map_err(|_| WireError::IntegerOverflow)?;
        self.buf.put_u16(rd_length);
        self.buf.put_slice(&rr.data);
        Ok(())
    }
}

/// Concatenates the character-strings of TXT RDATA into one buffer.
pub fn decode_txt_data(mut data: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut result = Vec::with_capacity(data.len());
    while !data.is_empty() {
        let length = data[0] as usize;
        data = &data[1..];
        if data.len() < length {
            return Err(WireError::UnexpectedEof);
        }
        result.extend_from_slice(&data[..length]);
        data = &data[length..];
    }
    Ok(result)
}

/// Packs bytes into TXT character-strings, splitting at 255 bytes.
pub fn encode_txt_data(mut data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + data.len() / 255 + 1);
    while data.len() > 255 {
        buf.put_u8(255);
        buf.put_slice(&data[..255]);
        data = &data[255..];
    }
    buf.put_u8(data.len() as u8);
    buf.put_slice(data);
    buf
}

/// Creates a recursion-desired query with a single question.
pub fn create_query(name: Name, qtype: u16, id: u16) -> Message {
    Message {
        id,
        flags: 0x0100, // RD=1
        question: vec![Question {
            name,
            qtype,
            class: CLASS_IN,
        }],
        ..Default::default()
    }
}

/// Creates a response skeleton echoing the query's ID and question.
pub fn create_response(query: &Message) -> Message {
    Message {
        id: query.id,
        flags: 0x8000, // QR=1
        question: query.question.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_name(s: &str) -> Name {
        Name::parse(s).unwrap()
    }

    #[test]
    fn test_name_parse_and_display() {
        let name = sample_name("tunnel.example.com");
        assert_eq!(name.labels().len(), 3);
        assert_eq!(name.to_string(), "tunnel.example.com");
        assert_eq!(Name::root().to_string(), ".");
        assert_eq!(sample_name("example.com."), sample_name("example.com"));
    }

    #[test]
    fn test_name_limits() {
        let long_label = "a".repeat(64);
        assert_eq!(Name::parse(&long_label), Err(WireError::LabelTooLong));

        let ok_label = "a".repeat(63);
        assert!(Name::parse(&ok_label).is_ok());

        // Four 63-byte labels need 257 wire bytes
        let too_long = [ok_label.as_str(); 4].join(".");
        assert_eq!(Name::parse(&too_long), Err(WireError::NameTooLong));

        assert_eq!(
            Name::new(vec![vec![], b"com".to_vec()]),
            Err(WireError::ZeroLengthLabel)
        );
    }

    #[test]
    fn test_name_case_insensitive_equality() {
        assert_eq!(sample_name("Example.COM"), sample_name("example.com"));
        assert_ne!(sample_name("example.org"), sample_name("example.com"));
    }

    #[test]
    fn test_trim_suffix() {
        let name = sample_name("abc.def.T.Example.Com");
        let suffix = sample_name("t.example.com");

        let prefix = name.trim_suffix(&suffix).unwrap();
        assert_eq!(prefix, sample_name("abc.def"));

        assert!(name.trim_suffix(&sample_name("other.com")).is_none());
        assert!(sample_name("com").trim_suffix(&suffix).is_none());
    }

    #[test]
    fn test_flags_accessors() {
        let mut msg = Message {
            flags: 0x0100,
            ..Default::default()
        };
        assert!(msg.is_query());
        assert_eq!(msg.opcode(), 0);
        assert_eq!(msg.rcode(), RCODE_NO_ERROR);

        msg.set_response();
        assert!(msg.is_response());

        msg.set_rcode(RCODE_NAME_ERROR);
        assert_eq!(msg.rcode(), RCODE_NAME_ERROR);
        assert!(msg.is_response());
    }

    #[test]
    fn test_roundtrip_query() {
        let mut msg = create_query(sample_name("example.com"), RR_TYPE_A, 0x1234);
        msg.add_edns0(4096);

        let data = msg.marshal().unwrap();
        let parsed = Message::parse(&data).unwrap();

        assert_eq!(parsed, msg);
        assert_eq!(parsed.edns0_size(), 4096);
    }

    #[test]
    fn test_roundtrip_response_with_answers() {
        let query = create_query(sample_name("example.com"), RR_TYPE_A, 7);
        let mut resp = create_response(&query);
        resp.answer.push(Rr {
            name: sample_name("example.com"),
            rtype: RR_TYPE_A,
            class: CLASS_IN,
            ttl: 300,
            data: vec![192, 168, 1, 1],
        });
        resp.authority.push(Rr {
            name: sample_name("ns.example.com"),
            rtype: RR_TYPE_A,
            class: CLASS_IN,
            ttl: 60,
            data: vec![10, 0, 0, 1],
        });

        let data = resp.marshal().unwrap();
        let parsed = Message::parse(&data).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn test_marshal_compression_reuses_suffix() {
        // The answer owner name equals the question name, so it should
        // be emitted as a 2-byte pointer to offset 12.
        let query = create_query(sample_name("www.example.com"), RR_TYPE_TXT, 1);
        let mut resp = create_response(&query);
        resp.answer.push(Rr {
            name: sample_name("www.example.com"),
            rtype: RR_TYPE_TXT,
            class: CLASS_IN,
            ttl: 60,
            data: encode_txt_data(b"hi"),
        });

        let data = resp.marshal().unwrap();
        let name_start = 12 + query.question[0].name.wire_len() + 4;
        assert_eq!(&data[name_start..name_start + 2], &[0xc0, 0x0c]);

        let parsed = Message::parse(&data).unwrap();
        assert_eq!(parsed.answer[0].name, sample_name("www.example.com"));
    }

    #[test]
    fn test_parse_compressed_name() {
        // Hand-built response: question example.com/A, answer name is a
        // pointer to offset 12.
        let mut data: Vec<u8> = vec![
            0x00, 0x07, 0x80, 0x00, // id, flags
            0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // counts
        ];
        data.extend_from_slice(b"\x07example\x03com\x00");
        data.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
        data.extend_from_slice(&[0xc0, 0x0c]); // pointer to question name
        data.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x3c]); // TTL
        data.extend_from_slice(&[0x00, 0x04, 192, 168, 1, 1]); // RDATA

        let msg = Message::parse(&data).unwrap();
        assert_eq!(msg.answer[0].name, sample_name("example.com"));
        assert_eq!(msg.answer[0].data, vec![192, 168, 1, 1]);
    }

    #[test]
    fn test_parse_pointer_loop_fails() {
        // A name that points at itself never terminates; the pointer
        // budget must stop it.
        let mut data: Vec<u8> = vec![
            0x00, 0x01, 0x00, 0x00, //
            0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        data.extend_from_slice(&[0xc0, 0x0c]); // points at itself
        data.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        assert_eq!(Message::parse(&data), Err(WireError::TooManyPointers));
    }

    #[test]
    fn test_parse_reserved_label_type_fails() {
        let mut data: Vec<u8> = vec![
            0x00, 0x01, 0x00, 0x00, //
            0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        data.extend_from_slice(&[0x40, 0x00]); // label type bits 01
        data.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

        assert_eq!(Message::parse(&data), Err(WireError::ReservedLabelType));
    }

    #[test]
    fn test_parse_trailing_bytes_fails() {
        let msg = create_query(sample_name("example.com"), RR_TYPE_A, 1);
        let mut data = msg.marshal().unwrap();
        data.push(0x00);

        assert_eq!(Message::parse(&data), Err(WireError::TrailingBytes));
    }

    #[test]
    fn test_parse_truncated_inputs_fail_cleanly() {
        let msg = create_query(sample_name("example.com"), RR_TYPE_A, 1);
        let data = msg.marshal().unwrap();

        // Every proper prefix must be a typed error, never a panic.
        for n in 0..data.len() {
            assert!(Message::parse(&data[..n]).is_err());
        }
    }

    #[test]
    fn test_parse_arbitrary_bytes_never_panics() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x6368_6170_6172);
        for _ in 0..5000 {
            let len = rng.gen_range(0..200);
            let mut buf = vec![0u8; len];
            rng.fill(&mut buf[..]);

            // Arbitrary input must produce a message or a typed error.
            let _ = Message::parse(&buf);
        }
    }

    #[test]
    fn test_txt_data_roundtrip() {
        let data = vec![0x41u8; 700];
        let packed = encode_txt_data(&data);

        // 255 + 255 + 190 needs three character-strings
        assert_eq!(packed.len(), 700 + 3);
        assert_eq!(decode_txt_data(&packed).unwrap(), data);

        assert_eq!(encode_txt_data(b""), vec![0]);
        assert_eq!(decode_txt_data(&[0]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_txt_data_truncated_string_fails() {
        assert_eq!(decode_txt_data(&[5, b'a', b'b']), Err(WireError::UnexpectedEof));
    }

    #[test]
    fn test_rdlength_overflow_fails() {
        let mut msg = create_query(sample_name("example.com"), RR_TYPE_TXT, 1);
        msg.additional.push(Rr {
            name: Name::root(),
            rtype: RR_TYPE_TXT,
            class: CLASS_IN,
            ttl: 0,
            data: vec![0u8; 70000],
        });
        assert_eq!(msg.marshal(), Err(WireError::IntegerOverflow));
    }
}
