//! FastCGI record codec.
//!
//! Only what a responder needs: reading the records a web server sends and
//! writing STDOUT / END_REQUEST / management replies back.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::TransportError;

pub const FCGI_VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = 0xffff;

/// Request id reserved for management records.
pub const NULL_REQUEST_ID: u16 = 0;

pub const ROLE_RESPONDER: u16 = 1;
pub const FLAG_KEEP_CONN: u8 = 1;

/// Record types defined by the FastCGI 1.0 specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            _ => return None,
        })
    }
}

/// `protocolStatus` of an END_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

/// One decoded record. `kind` stays raw so unknown types can be reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: u8,
    pub request_id: u16,
    pub content: Bytes,
}

impl Record {
    pub fn new(kind: RecordType, request_id: u16, content: impl Into<Bytes>) -> Self {
        Self {
            kind: kind as u8,
            request_id,
            content: content.into(),
        }
    }

    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_u8(self.kind)
    }

    /// Append this record, header and padding included.
    ///
    /// Content longer than [`MAX_CONTENT_LEN`] is a caller bug; use
    /// [`encode_stream`] for arbitrary payloads.
    pub fn encode(&self, buf: &mut BytesMut) {
        encode_record(self.kind, self.request_id, &self.content, buf);
    }
}

fn encode_record(kind: u8, request_id: u16, content: &[u8], buf: &mut BytesMut) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding = (8 - content.len() % 8) % 8;
    buf.reserve(HEADER_LEN + content.len() + padding);
    buf.put_u8(FCGI_VERSION_1);
    buf.put_u8(kind);
    buf.put_u16(request_id);
    buf.put_u16(content.len() as u16);
    buf.put_u8(padding as u8);
    buf.put_u8(0);
    buf.put_slice(content);
    buf.put_bytes(0, padding);
}

/// Append `data` as a sequence of stream records of type `kind`.
///
/// Writes nothing for empty data; the empty terminator record is written
/// separately when the stream closes.
pub fn encode_stream(kind: RecordType, request_id: u16, data: &[u8], buf: &mut BytesMut) {
    for chunk in data.chunks(MAX_CONTENT_LEN) {
        encode_record(kind as u8, request_id, chunk, buf);
    }
}

/// Append the empty record that closes a stream.
pub fn encode_stream_end(kind: RecordType, request_id: u16, buf: &mut BytesMut) {
    encode_record(kind as u8, request_id, &[], buf);
}

pub fn encode_end_request(
    request_id: u16,
    app_status: u32,
    status: ProtocolStatus,
    buf: &mut BytesMut,
) {
    let mut body = [0u8; 8];
    body[..4].copy_from_slice(&app_status.to_be_bytes());
    body[4] = status as u8;
    encode_record(RecordType::EndRequest as u8, request_id, &body, buf);
}

pub fn encode_unknown_type(kind: u8, buf: &mut BytesMut) {
    let mut body = [0u8; 8];
    body[0] = kind;
    encode_record(RecordType::UnknownType as u8, NULL_REQUEST_ID, &body, buf);
}

/// Read one record. Returns `None` when the peer closed the stream between
/// records.
pub async fn read_record<R>(reader: &mut R) -> Result<Option<Record>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    if header[0] != FCGI_VERSION_1 {
        return Err(TransportError::protocol(format!(
            "unsupported record version {}",
            header[0]
        )));
    }

    let kind = header[1];
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding_len = header[6] as usize;

    let mut content = vec![0u8; content_len];
    reader.read_exact(&mut content).await?;
    let mut padding = [0u8; 255];
    reader.read_exact(&mut padding[..padding_len]).await?;

    Ok(Some(Record {
        kind,
        request_id,
        content: Bytes::from(content),
    }))
}

/// Body of a BEGIN_REQUEST record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequest {
    pub fn parse(content: &[u8]) -> Result<Self, TransportError> {
        match content {
            [r0, r1, flags, ..] if content.len() >= 8 => Ok(Self {
                role: u16::from_be_bytes([*r0, *r1]),
                flags: *flags,
            }),
            _ => Err(TransportError::protocol(format!(
                "BEGIN_REQUEST body is {} bytes",
                content.len()
            ))),
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut body = [0u8; 8];
        body[..2].copy_from_slice(&self.role.to_be_bytes());
        body[2] = self.flags;
        body
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FLAG_KEEP_CONN != 0
    }
}

/// Decode a name-value pair stream (PARAMS, GET_VALUES).
pub fn decode_pairs(mut input: &[u8]) -> Result<Vec<(String, String)>, TransportError> {
    let mut pairs = Vec::new();
    while !input.is_empty() {
        let name_len = read_pair_len(&mut input)?;
        let value_len = read_pair_len(&mut input)?;
        let name = take(&mut input, name_len)?;
        let value = take(&mut input, value_len)?;
        pairs.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }
    Ok(pairs)
}

/// Append one name-value pair.
pub fn encode_pair(name: &str, value: &str, buf: &mut BytesMut) {
    put_pair_len(name.len(), buf);
    put_pair_len(value.len(), buf);
    buf.put_slice(name.as_bytes());
    buf.put_slice(value.as_bytes());
}

fn put_pair_len(len: usize, buf: &mut BytesMut) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}

fn read_pair_len(input: &mut &[u8]) -> Result<usize, TransportError> {
    let first = *input
        .first()
        .ok_or_else(|| TransportError::protocol("truncated name-value length"))?;
    if first & 0x80 == 0 {
        *input = &input[1..];
        return Ok(first as usize);
    }
    let raw = take(input, 4)?;
    let len = u32::from_be_bytes([raw[0] & 0x7f, raw[1], raw[2], raw[3]]);
    Ok(len as usize)
}

fn take<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], TransportError> {
    if input.len() < len {
        return Err(TransportError::protocol("truncated name-value pair"));
    }
    let (head, tail) = input.split_at(len);
    *input = tail;
    Ok(head)
}
