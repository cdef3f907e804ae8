//! One accepted FastCGI connection serving exactly one responder request.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::record::{
    self, BeginRequest, NULL_REQUEST_ID, ProtocolStatus, ROLE_RESPONDER, Record, RecordType,
};

/// Largest accepted PARAMS stream.
pub const MAX_PARAMS_LEN: usize = 64 * 1024;

/// Unread body bytes `finish` discards before giving up on a clean close.
pub const DRAIN_LIMIT: usize = 16 * 1024 * 1024;

/// How long `finish` waits for the rest of the body.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A single client connection as seen by a request job.
///
/// `finish` consumes the connection, so a handle can be finalized only once.
/// Dropping a connection without finishing it closes the underlying stream.
pub trait Connection: Send + 'static {
    /// Read everything that precedes the request body (for FastCGI: the
    /// BEGIN_REQUEST record and the PARAMS stream).
    fn read_preamble(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Look up a request parameter (CGI environment variable).
    fn param(&self, name: &str) -> Option<&str>;

    /// Declared body length; `None` if absent or not a number.
    fn content_length(&self) -> Option<i64> {
        self.param("CONTENT_LENGTH")
            .and_then(|raw| raw.trim().parse().ok())
    }

    /// Caller address as reported by the front-end server.
    fn remote_addr(&self) -> Option<&str> {
        self.param("REMOTE_ADDR").filter(|addr| !addr.is_empty())
    }

    /// Fill `buf` from the request body and return how many bytes were read.
    /// Fewer than `buf.len()` means the body ended early.
    fn read_body(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<usize, TransportError>> + Send;

    /// Write response bytes (headers and body share one stream).
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Complete the request and release the connection.
    fn finish(self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// FastCGI responder connection over any byte stream.
pub struct FcgiConnection<S> {
    stream: S,
    request_id: u16,
    begun: bool,
    ended: bool,
    params: HashMap<String, String>,
    params_buf: BytesMut,
    pending: Bytes,
    stdin_done: bool,
    max_conns: usize,
}

impl<S> FcgiConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            request_id: NULL_REQUEST_ID,
            begun: false,
            ended: false,
            params: HashMap::new(),
            params_buf: BytesMut::new(),
            pending: Bytes::new(),
            stdin_done: false,
            max_conns: 1,
        }
    }

    /// Value advertised for `FCGI_MAX_CONNS` / `FCGI_MAX_REQS`.
    pub fn with_max_conns(mut self, max_conns: usize) -> Self {
        self.max_conns = max_conns.max(1);
        self
    }

    /// Request id from BEGIN_REQUEST (0 before the preamble was read).
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    async fn send(&mut self, buf: BytesMut) -> Result<(), TransportError> {
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    /// Handle a record that does not belong to the active request stream.
    async fn handle_stray(&mut self, record: Record) -> Result<(), TransportError> {
        let mut out = BytesMut::new();
        match (record.record_type(), record.request_id) {
            (Some(RecordType::GetValues), NULL_REQUEST_ID) => {
                self.encode_get_values_result(&record.content, &mut out)?;
            }
            (_, NULL_REQUEST_ID) => {
                debug!("Unknown management record type {}", record.kind);
                record::encode_unknown_type(record.kind, &mut out);
            }
            (Some(RecordType::BeginRequest), id) if id != self.request_id => {
                warn!("Rejecting multiplexed request {id} on connection serving {}", self.request_id);
                record::encode_end_request(id, 0, ProtocolStatus::CantMpxConn, &mut out);
            }
            (kind, id) => {
                debug!("Ignoring record {kind:?} for request {id}");
            }
        }
        if !out.is_empty() {
            self.send(out).await?;
        }
        Ok(())
    }

    fn encode_get_values_result(
        &self,
        content: &[u8],
        out: &mut BytesMut,
    ) -> Result<(), TransportError> {
        let max = self.max_conns.to_string();
        let mut body = BytesMut::new();
        for (name, _) in record::decode_pairs(content)? {
            let value = match name.as_str() {
                "FCGI_MAX_CONNS" | "FCGI_MAX_REQS" => max.as_str(),
                "FCGI_MPXS_CONNS" => "0",
                _ => continue,
            };
            record::encode_pair(&name, value, &mut body);
        }
        Record::new(RecordType::GetValuesResult, NULL_REQUEST_ID, body.freeze()).encode(out);
        Ok(())
    }

    async fn next_record(&mut self) -> Result<Option<Record>, TransportError> {
        record::read_record(&mut self.stream).await
    }

    /// Consume what is left of STDIN. Closing a socket with unread input
    /// resets the peer before it has read the response.
    async fn drain_stdin(&mut self) {
        let drain = async {
            let mut discarded = self.pending.len();
            self.pending = Bytes::new();
            while !self.stdin_done {
                if discarded > DRAIN_LIMIT {
                    return Err(TransportError::protocol(format!(
                        "more than {DRAIN_LIMIT} unread body bytes"
                    )));
                }
                let Some(record) = self.next_record().await? else {
                    break;
                };
                let ours = record.request_id == self.request_id;
                match record.record_type() {
                    Some(RecordType::Stdin) if ours => {
                        discarded += record.content.len();
                        self.stdin_done = record.content.is_empty();
                    }
                    Some(RecordType::AbortRequest) if ours => self.stdin_done = true,
                    _ => self.handle_stray(record).await?,
                }
            }
            Ok::<_, TransportError>(discarded)
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => debug!("Discarded {n} unread body bytes"),
            Ok(Err(e)) => debug!("Stopped draining request body: {e}"),
            Err(_) => debug!("Timed out draining request body"),
        }
    }
}

impl<S> Connection for FcgiConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_preamble(&mut self) -> Result<(), TransportError> {
        loop {
            let Some(record) = self.next_record().await? else {
                return Err(if self.begun {
                    TransportError::protocol("stream closed while reading PARAMS")
                } else {
                    TransportError::Closed
                });
            };

            match record.record_type() {
                Some(RecordType::BeginRequest)
                    if !self.begun && record.request_id != NULL_REQUEST_ID =>
                {
                    let begin = BeginRequest::parse(&record.content)?;
                    if begin.role != ROLE_RESPONDER {
                        let mut out = BytesMut::new();
                        record::encode_end_request(
                            record.request_id,
                            0,
                            ProtocolStatus::UnknownRole,
                            &mut out,
                        );
                        self.send(out).await?;
                        self.ended = true;
                        return Err(TransportError::UnsupportedRole(begin.role));
                    }
                    self.request_id = record.request_id;
                    self.begun = true;
                }
                Some(RecordType::Params) if self.begun && record.request_id == self.request_id => {
                    if record.content.is_empty() {
                        let raw = std::mem::take(&mut self.params_buf);
                        self.params = record::decode_pairs(&raw)?.into_iter().collect();
                        return Ok(());
                    }
                    if self.params_buf.len() + record.content.len() > MAX_PARAMS_LEN {
                        return Err(TransportError::protocol(format!(
                            "PARAMS stream exceeds {MAX_PARAMS_LEN} bytes"
                        )));
                    }
                    self.params_buf.extend_from_slice(&record.content);
                }
                Some(RecordType::AbortRequest)
                    if self.begun && record.request_id == self.request_id =>
                {
                    return Err(TransportError::protocol("request aborted before PARAMS ended"));
                }
                _ => self.handle_stray(record).await?,
            }
        }
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.len() - filled);
                let chunk = self.pending.split_to(n);
                buf[filled..filled + n].copy_from_slice(&chunk);
                filled += n;
                continue;
            }
            if self.stdin_done {
                break;
            }

            let Some(record) = self.next_record().await? else {
                self.stdin_done = true;
                break;
            };
            let ours = record.request_id == self.request_id;
            match record.record_type() {
                Some(RecordType::Stdin) if ours => {
                    if record.content.is_empty() {
                        self.stdin_done = true;
                    } else {
                        self.pending = record.content;
                    }
                }
                Some(RecordType::AbortRequest) if ours => {
                    warn!("Request {} aborted by the web server", self.request_id);
                    self.stdin_done = true;
                }
                _ => self.handle_stray(record).await?,
            }
        }
        Ok(filled)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut out = BytesMut::with_capacity(bytes.len() + record::HEADER_LEN);
        record::encode_stream(RecordType::Stdout, self.request_id, bytes, &mut out);
        self.send(out).await
    }

    async fn finish(mut self) -> Result<(), TransportError> {
        if self.begun && !self.ended {
            self.drain_stdin().await;
            let mut out = BytesMut::new();
            record::encode_stream_end(RecordType::Stdout, self.request_id, &mut out);
            record::encode_end_request(self.request_id, 0, ProtocolStatus::RequestComplete, &mut out);
            self.ended = true;
            self.send(out).await?;
        }
        self.stream.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
