//! Request job: owns one accepted connection from acceptance to completion.
//!
//! Lifecycle: `Created → HeadersSent → BodyRead → Processed → Finished`.
//! Any failure short-circuits to `Finished` with an error response. The
//! connection is finished exactly once: by the job on every normal path,
//! or by `Drop` if the job is torn down early.

use std::time::Duration;

use fastrpc_protocol::{RpcError, RpcResponse, parse_request};
use fastrpc_services::ServiceFactory;
use fastrpc_transport::{Connection, TransportError};
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::pool::PoolJob;

/// Fixed response headers, written before anything else.
pub const RESPONSE_HEADERS: &str = "Content-type: application/json; charset=UTF-8\r\n\
    Expires: Wed, 23 Mar 1983 12:15:00 GMT\r\n\
    Cache-Control: no-store, no-cache, must-revalidate\r\n\
    Cache-Control: post-check=0, pre-check=0\r\n\
    Pragma: no-cache\r\n\
    \r\n";

/// Longest a rejected connection may take to send its preamble.
pub const REJECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    HeadersSent,
    BodyRead,
    Processed,
    Finished,
}

/// Per-request limits derived from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct JobLimits {
    pub max_request_size: usize,
    pub request_timeout: Option<Duration>,
}

impl JobLimits {
    /// Time allowed for answering a rejected connection.
    pub fn reject_timeout(&self) -> Duration {
        self.request_timeout
            .map_or(REJECT_TIMEOUT, |limit| limit.min(REJECT_TIMEOUT))
    }
}

pub struct RequestJob<C: Connection, F: ServiceFactory> {
    id: Uuid,
    conn: Option<C>,
    dispatcher: Dispatcher<F>,
    limits: JobLimits,
    state: JobState,
}

impl<C: Connection, F: ServiceFactory> RequestJob<C, F> {
    pub fn new(conn: C, dispatcher: Dispatcher<F>, limits: JobLimits) -> Self {
        Self {
            id: Uuid::new_v4(),
            conn: Some(conn),
            dispatcher,
            limits,
            state: JobState::Created,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Run the full lifecycle.
    ///
    /// The request timeout starts when a worker picks the job up and covers
    /// the preamble as well as the body and the dispatch.
    pub async fn execute(mut self) {
        let span = info_span!("job", id = %self.id);
        let deadline = self.limits.request_timeout.map(|limit| Instant::now() + limit);
        async move {
            if self.begin_until(deadline).await {
                let response = match self.process(deadline).await {
                    Ok(response) => response,
                    Err(err) => {
                        log_failure("Request failed", &err);
                        RpcResponse::Error(err)
                    }
                };
                self.respond(response).await;
            }
            self.finish().await;
        }
        .instrument(span)
        .await
    }

    /// Answer with `error` without reading the body or dispatching.
    ///
    /// A client that has not sent its preamble within
    /// [`JobLimits::reject_timeout`] is disconnected without an answer.
    pub async fn reject(mut self, error: RpcError) {
        let span = info_span!("job", id = %self.id);
        let deadline = Instant::now() + self.limits.reject_timeout();
        async move {
            if self.begin_until(Some(deadline)).await {
                log_failure("Request rejected", &error);
                self.respond(RpcResponse::Error(error)).await;
            }
            self.finish().await;
        }
        .instrument(span)
        .await
    }

    /// Release the connection without reading or answering anything.
    pub async fn close(mut self) {
        let span = info_span!("job", id = %self.id);
        async move {
            debug!("Closing connection unanswered");
            self.finish().await;
        }
        .instrument(span)
        .await
    }

    fn advance(&mut self, next: JobState) {
        debug!("{:?} -> {next:?}", self.state);
        self.state = next;
    }

    async fn begin_until(&mut self, deadline: Option<Instant>) -> bool {
        let Some(deadline) = deadline else {
            return self.begin().await;
        };
        match tokio::time::timeout_at(deadline, self.begin()).await {
            Ok(begun) => begun,
            Err(_) => {
                warn!("Request preamble not received before the deadline");
                false
            }
        }
    }

    /// Read the transport preamble and send the headers.
    async fn begin(&mut self) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        if let Err(e) = conn.read_preamble().await {
            match e {
                TransportError::Closed => debug!("Connection closed before a request arrived"),
                e => warn!("Failed to read request preamble: {e}"),
            }
            return false;
        }
        if let Err(e) = conn.write(RESPONSE_HEADERS.as_bytes()).await {
            warn!("Failed to write response headers: {e}");
            return false;
        }
        self.advance(JobState::HeadersSent);
        true
    }

    async fn process(&mut self, deadline: Option<Instant>) -> Result<RpcResponse, RpcError> {
        let work = self.read_and_dispatch();
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, work)
                .await
                .map_err(|_| RpcError::server_error("request timed out"))?,
            None => work.await,
        }
    }

    async fn read_and_dispatch(&mut self) -> Result<RpcResponse, RpcError> {
        let body = self.read_body().await?;
        self.advance(JobState::BodyRead);

        let request = parse_request(&body)?;
        drop(body);

        let remote_addr = self
            .conn
            .as_ref()
            .and_then(|conn| conn.remote_addr())
            .map(str::to_string);
        let id = request.id.clone();
        let result = self
            .dispatcher
            .dispatch(request, remote_addr, self.id.to_string())
            .await?;
        self.advance(JobState::Processed);

        Ok(RpcResponse::success(id, result))
    }

    /// Read exactly the declared body, refusing bad lengths before allocating.
    async fn read_body(&mut self) -> Result<Vec<u8>, RpcError> {
        let max = self.limits.max_request_size;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| RpcError::server_error("connection already released"))?;

        let declared = conn.content_length();
        let len = declared
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| (1..=max).contains(n))
            .ok_or_else(|| {
                RpcError::invalid_request().with_detail(format!(
                    "content length {} outside 1..={max}",
                    declared.map_or_else(|| "missing".to_string(), |n| n.to_string())
                ))
            })?;

        let mut body = Vec::new();
        body.try_reserve_exact(len)
            .map_err(|_| RpcError::server_error(format!("failed to alloc {len} bytes")))?;
        body.resize(len, 0);

        let read = conn
            .read_body(&mut body)
            .await
            .map_err(|e| RpcError::server_error(format!("failed to read {len} bytes: {e}")))?;
        if read != len {
            return Err(RpcError::server_error(format!(
                "failed to read {len} bytes (got {read})"
            )));
        }
        Ok(body)
    }

    async fn respond(&mut self, response: RpcResponse) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if let Err(e) = conn.write(&response.into_bytes()).await {
            warn!("Failed to write response: {e}");
        }
    }

    async fn finish(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.finish().await {
                debug!("Failed to finish connection cleanly: {e}");
            }
        }
        self.advance(JobState::Finished);
    }
}

fn log_failure(what: &str, err: &RpcError) {
    match &err.detail {
        Some(detail) => warn!("{what} ({detail}) -> {}", err.to_json()),
        None => warn!("{what} -> {}", err.to_json()),
    }
}

impl<C: Connection, F: ServiceFactory> PoolJob for RequestJob<C, F> {
    fn run(self) -> impl std::future::Future<Output = ()> + Send {
        self.execute()
    }
}

impl<C: Connection, F: ServiceFactory> Drop for RequestJob<C, F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        warn!("Job {} dropped in state {:?}; releasing connection", self.id, self.state);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = conn.finish().await {
                    debug!("Failed to finish abandoned connection: {e}");
                }
            });
        }
    }
}
