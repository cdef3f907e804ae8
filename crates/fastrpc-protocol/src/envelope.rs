//! Envelope validation: raw request bytes to a [`RpcRequest`].
//!
//! Checks run in a fixed order and the first failure decides the error, so
//! a body that is both missing `method` and `params` reports `method`.

use serde_json::Value;

use crate::error::RpcError;
use crate::jsonrpc::{JSONRPC_VERSION, RpcRequest};

/// Parse and validate a JSON-RPC 2.0 request body.
pub fn parse_request(body: &[u8]) -> Result<RpcRequest, RpcError> {
    let parsed: Value = serde_json::from_slice(body).map_err(|_| RpcError::parse_error())?;

    let Value::Object(mut root) = parsed else {
        return Err(invalid("request is not an object"));
    };

    if root.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(invalid("jsonrpc must be \"2.0\""));
    }

    let method = match root.remove("method") {
        Some(Value::String(method)) => method,
        _ => return Err(invalid("missing or non-string method")),
    };

    let params = match root.remove("params") {
        Some(Value::Array(params)) => params,
        _ => return Err(invalid("missing or non-array params")),
    };

    let id = match root.remove("id") {
        Some(Value::String(id)) => id,
        _ => return Err(invalid("missing or non-string id")),
    };

    Ok(RpcRequest { method, params, id })
}

/// The client only sees the default "Invalid Request" message.
fn invalid(reason: &str) -> RpcError {
    RpcError::invalid_request().with_detail(reason)
}
