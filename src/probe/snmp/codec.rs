//! Minimal BER codec for SNMP v1/v2c messages.
//!
//! Only what a GET round trip needs: the message envelope, request and
//! response PDUs, and the application value types an agent may return.

use thiserror::Error;

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_IP_ADDRESS: u8 = 0x40;
pub const TAG_COUNTER32: u8 = 0x41;
pub const TAG_GAUGE32: u8 = 0x42;
pub const TAG_TIMETICKS: u8 = 0x43;
pub const TAG_OPAQUE: u8 = 0x44;
pub const TAG_COUNTER64: u8 = 0x46;
pub const TAG_NO_SUCH_OBJECT: u8 = 0x80;
pub const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
pub const TAG_END_OF_MIB_VIEW: u8 = 0x82;

pub const PDU_GET_REQUEST: u8 = 0xa0;
pub const PDU_RESPONSE: u8 = 0xa2;
const PDU_TRAP_V1: u8 = 0xa4;

/// error-status values that mean the community was refused.
pub const ERR_NO_ACCESS: i64 = 6;
pub const ERR_AUTHORIZATION: i64 = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("message truncated")]
    Truncated,
    #[error("expected tag 0x{expected:02x}, found 0x{found:02x}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("invalid encoding: {0}")]
    Invalid(&'static str),
}

pub type Oid = Vec<u32>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    ObjectId(Oid),
    IpAddress([u8; 4]),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Opaque(Vec<u8>),
    Counter64(u64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl Value {
    /// Numeric reading, if the value carries one. Octet strings holding a
    /// decimal number are accepted.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Counter32(v) | Value::Gauge32(v) | Value::TimeTicks(v) => Some(f64::from(*v)),
            Value::Counter64(v) => Some(*v as f64),
            Value::OctetString(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarBind {
    pub oid: Oid,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pdu {
    pub tag: u8,
    pub request_id: i32,
    pub error_status: i64,
    pub error_index: i64,
    pub varbinds: Vec<VarBind>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub version: i64,
    pub community: Vec<u8>,
    pub pdu: Pdu,
}

impl Message {
    pub fn get_request(version: i64, community: &str, request_id: i32, oids: &[Oid]) -> Self {
        Self {
            version,
            community: community.as_bytes().to_vec(),
            pdu: Pdu {
                tag: PDU_GET_REQUEST,
                request_id,
                error_status: 0,
                error_index: 0,
                varbinds: oids
                    .iter()
                    .map(|oid| VarBind {
                        oid: oid.clone(),
                        value: Value::Null,
                    })
                    .collect(),
            },
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut list = Vec::new();
        for vb in &self.pdu.varbinds {
            let mut entry = tlv(TAG_OID, &oid_bytes(&vb.oid));
            entry.extend(encode_value(&vb.value));
            list.extend(tlv(TAG_SEQUENCE, &entry));
        }

        let mut pdu = tlv(TAG_INTEGER, &integer_bytes(i64::from(self.pdu.request_id)));
        pdu.extend(tlv(TAG_INTEGER, &integer_bytes(self.pdu.error_status)));
        pdu.extend(tlv(TAG_INTEGER, &integer_bytes(self.pdu.error_index)));
        pdu.extend(tlv(TAG_SEQUENCE, &list));

        let mut body = tlv(TAG_INTEGER, &integer_bytes(self.version));
        body.extend(tlv(TAG_OCTET_STRING, &self.community));
        body.extend(tlv(self.pdu.tag, &pdu));
        tlv(TAG_SEQUENCE, &body)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let body = Reader::new(buf).read_tag(TAG_SEQUENCE)?;
        let mut r = Reader::new(body);
        let version = decode_integer(r.read_tag(TAG_INTEGER)?)?;
        let community = r.read_tag(TAG_OCTET_STRING)?.to_vec();

        let (tag, pdu_body) = r.read_tlv()?;
        if !(PDU_GET_REQUEST..=0xa8).contains(&tag) || tag == PDU_TRAP_V1 {
            return Err(CodecError::Invalid("unsupported PDU type"));
        }
        let mut p = Reader::new(pdu_body);
        let request_id = i32::try_from(decode_integer(p.read_tag(TAG_INTEGER)?)?)
            .map_err(|_| CodecError::Invalid("request-id out of range"))?;
        let error_status = decode_integer(p.read_tag(TAG_INTEGER)?)?;
        let error_index = decode_integer(p.read_tag(TAG_INTEGER)?)?;

        let mut list = Reader::new(p.read_tag(TAG_SEQUENCE)?);
        let mut varbinds = Vec::new();
        while !list.is_empty() {
            let mut entry = Reader::new(list.read_tag(TAG_SEQUENCE)?);
            let oid = decode_oid(entry.read_tag(TAG_OID)?)?;
            let (value_tag, content) = entry.read_tlv()?;
            varbinds.push(VarBind {
                oid,
                value: decode_value(value_tag, content)?,
            });
        }

        Ok(Self {
            version,
            community,
            pdu: Pdu {
                tag,
                request_id,
                error_status,
                error_index,
                varbinds,
            },
        })
    }
}

/// Dotted notation, leading dot optional.
pub fn parse_oid(s: &str) -> Result<Oid, CodecError> {
    let oid = s
        .trim_start_matches('.')
        .split('.')
        .map(|arc| arc.parse::<u32>().map_err(|_| CodecError::Invalid("OID arc")))
        .collect::<Result<Oid, _>>()?;
    if oid.len() < 2 || oid[0] > 2 {
        return Err(CodecError::Invalid("OID needs at least two arcs"));
    }
    Ok(oid)
}

// ── Encoding ─────────────────────────────────────────────────────────

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    if content.len() < 0x80 {
        out.push(content.len() as u8);
    } else {
        let bytes = content.len().to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}

/// Minimal two's complement.
fn integer_bytes(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xff && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn unsigned_bytes(v: u64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(bytes.len() - 1);
    let mut out = Vec::with_capacity(9);
    if bytes[skip] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(&bytes[skip..]);
    out
}

fn push_base128(out: &mut Vec<u8>, mut v: u64) {
    let mut tmp = [0u8; 10];
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    let last = tmp.len() - 1;
    for (idx, b) in tmp.iter().enumerate().skip(i) {
        out.push(if idx == last { *b } else { *b | 0x80 });
    }
}

fn oid_bytes(oid: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(oid.len() + 4);
    let first = u64::from(oid.first().copied().unwrap_or(0)) * 40
        + u64::from(oid.get(1).copied().unwrap_or(0));
    push_base128(&mut out, first);
    for arc in oid.iter().skip(2) {
        push_base128(&mut out, u64::from(*arc));
    }
    out
}

fn encode_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Integer(v) => tlv(TAG_INTEGER, &integer_bytes(*v)),
        Value::OctetString(bytes) => tlv(TAG_OCTET_STRING, bytes),
        Value::Null => tlv(TAG_NULL, &[]),
        Value::ObjectId(oid) => tlv(TAG_OID, &oid_bytes(oid)),
        Value::IpAddress(addr) => tlv(TAG_IP_ADDRESS, addr),
        Value::Counter32(v) => tlv(TAG_COUNTER32, &unsigned_bytes(u64::from(*v))),
        Value::Gauge32(v) => tlv(TAG_GAUGE32, &unsigned_bytes(u64::from(*v))),
        Value::TimeTicks(v) => tlv(TAG_TIMETICKS, &unsigned_bytes(u64::from(*v))),
        Value::Opaque(bytes) => tlv(TAG_OPAQUE, bytes),
        Value::Counter64(v) => tlv(TAG_COUNTER64, &unsigned_bytes(*v)),
        Value::NoSuchObject => tlv(TAG_NO_SUCH_OBJECT, &[]),
        Value::NoSuchInstance => tlv(TAG_NO_SUCH_INSTANCE, &[]),
        Value::EndOfMibView => tlv(TAG_END_OF_MIB_VIEW, &[]),
    }
}

// ── Decoding ─────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn byte(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or(CodecError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_tlv(&mut self) -> Result<(u8, &'a [u8]), CodecError> {
        let tag = self.byte()?;
        let first = self.byte()?;
        let len = if first & 0x80 == 0 {
            usize::from(first)
        } else {
            let n = usize::from(first & 0x7f);
            if n == 0 || n > 4 {
                return Err(CodecError::Invalid("length"));
            }
            let mut len = 0usize;
            for _ in 0..n {
                len = (len << 8) | usize::from(self.byte()?);
            }
            len
        };
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated)?;
        let content = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok((tag, content))
    }

    fn read_tag(&mut self, tag: u8) -> Result<&'a [u8], CodecError> {
        let (found, content) = self.read_tlv()?;
        if found != tag {
            return Err(CodecError::UnexpectedTag {
                expected: tag,
                found,
            });
        }
        Ok(content)
    }
}

fn decode_integer(content: &[u8]) -> Result<i64, CodecError> {
    if content.is_empty() || content.len() > 8 {
        return Err(CodecError::Invalid("integer length"));
    }
    let mut v: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for b in content {
        v = (v << 8) | i64::from(*b);
    }
    Ok(v)
}

fn decode_unsigned(content: &[u8]) -> Result<u64, CodecError> {
    let trimmed = match content {
        [0, rest @ ..] => rest,
        other => other,
    };
    if trimmed.len() > 8 {
        return Err(CodecError::Invalid("unsigned length"));
    }
    Ok(trimmed.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn decode_u32(content: &[u8]) -> Result<u32, CodecError> {
    u32::try_from(decode_unsigned(content)?).map_err(|_| CodecError::Invalid("32-bit value out of range"))
}

fn decode_oid(content: &[u8]) -> Result<Oid, CodecError> {
    let mut arcs = Vec::new();
    let mut acc: u64 = 0;
    let mut in_progress = false;
    for b in content {
        acc = (acc << 7) | u64::from(b & 0x7f);
        if acc > u64::from(u32::MAX) * 128 {
            return Err(CodecError::Invalid("OID arc overflow"));
        }
        in_progress = b & 0x80 != 0;
        if !in_progress {
            arcs.push(acc);
            acc = 0;
        }
    }
    if in_progress || arcs.is_empty() {
        return Err(CodecError::Invalid("OID"));
    }

    let first = arcs[0];
    let (a, b) = match first {
        0..=39 => (0, first),
        40..=79 => (1, first - 40),
        _ => (2, first - 80),
    };
    std::iter::once(a)
        .chain(std::iter::once(b))
        .chain(arcs.into_iter().skip(1))
        .map(|arc| u32::try_from(arc).map_err(|_| CodecError::Invalid("OID arc overflow")))
        .collect()
}

fn decode_value(tag: u8, content: &[u8]) -> Result<Value, CodecError> {
    Ok(match tag {
        TAG_INTEGER => Value::Integer(decode_integer(content)?),
        TAG_OCTET_STRING => Value::OctetString(content.to_vec()),
        TAG_NULL => Value::Null,
        TAG_OID => Value::ObjectId(decode_oid(content)?),
        TAG_IP_ADDRESS => Value::IpAddress(
            content
                .try_into()
                .map_err(|_| CodecError::Invalid("IpAddress length"))?,
        ),
        TAG_COUNTER32 => Value::Counter32(decode_u32(content)?),
        TAG_GAUGE32 => Value::Gauge32(decode_u32(content)?),
        TAG_TIMETICKS => Value::TimeTicks(decode_u32(content)?),
        TAG_OPAQUE => Value::Opaque(content.to_vec()),
        TAG_COUNTER64 => Value::Counter64(decode_unsigned(content)?),
        TAG_NO_SUCH_OBJECT => Value::NoSuchObject,
        TAG_NO_SUCH_INSTANCE => Value::NoSuchInstance,
        TAG_END_OF_MIB_VIEW => Value::EndOfMibView,
        _ => return Err(CodecError::Invalid("unknown value type")),
    })
}
