//! JSON-RPC 2.0 request and response envelopes.

use serde::Serialize;
use serde_json::Value;

use crate::error::{FALLBACK_ERROR_BODY, RpcError};

pub const JSONRPC_VERSION: &str = "2.0";

/// A request that passed envelope validation.
///
/// Only string ids are accepted on input; the `jsonrpc` member is implied.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Vec<Value>,
    pub id: String,
}

/// JSON-RPC 2.0 success response body.
#[derive(Debug, Clone, Serialize)]
pub struct SuccessResponse {
    pub jsonrpc: &'static str,
    pub result: Value,
    pub id: String,
}

impl SuccessResponse {
    pub fn new(id: String, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result,
            id,
        }
    }
}

/// Outcome of one request, ready to be written to the client.
#[derive(Debug, Clone)]
pub enum RpcResponse {
    Success(SuccessResponse),
    Error(RpcError),
}

impl RpcResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self::Success(SuccessResponse::new(id.into(), result))
    }

    pub fn error(error: RpcError) -> Self {
        Self::Error(error)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn to_json(&self) -> String {
        match self {
            Self::Success(ok) => {
                serde_json::to_string(ok).unwrap_or_else(|_| FALLBACK_ERROR_BODY.to_string())
            }
            Self::Error(err) => err.to_json(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.to_json().into_bytes()
    }
}
