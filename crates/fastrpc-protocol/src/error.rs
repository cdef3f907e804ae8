//! JSON-RPC 2.0 error codes and the error record carried through a request.

use serde::Serialize;

use crate::jsonrpc::JSONRPC_VERSION;

/// Standard JSON-RPC 2.0 error codes plus the generic server error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ServerError,

    /// Any code outside the table above.
    Custom(i32),
}

impl RpcErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::ServerError => -32000,
            Self::Custom(c) => *c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32000 => Self::ServerError,
            c => Self::Custom(c),
        }
    }

    /// Message used when an error is raised without one.
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::ServerError => "Server error",
            Self::Custom(_) => "unknown error",
        }
    }
}

/// Structured error record.
///
/// `id` is the numeric request id the raising layer attached, if any. It is
/// rendered as a quoted string when positive and as `null` otherwise.
/// `detail` is for logs only and never reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub id: Option<i64>,
    pub message: Option<String>,
    pub detail: Option<String>,
}

/// Result returned by a service method.
pub type HandlerResult = Result<serde_json::Value, RpcError>;

impl RpcError {
    pub fn new(code: RpcErrorCode) -> Self {
        Self {
            code: code.code(),
            id: None,
            message: None,
            detail: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(RpcErrorCode::ParseError)
    }

    pub fn invalid_request() -> Self {
        Self::new(RpcErrorCode::InvalidRequest)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(RpcErrorCode::MethodNotFound).with_message(format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParams).with_message(message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InternalError).with_message(message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::ServerError).with_message(message)
    }

    pub fn error_code(&self) -> RpcErrorCode {
        RpcErrorCode::from_code(self.code)
    }

    /// The explicit message, or the code's default when none (or an empty one) was set.
    pub fn message(&self) -> &str {
        match self.message.as_deref() {
            Some(m) if !m.is_empty() => m,
            _ => self.error_code().default_message(),
        }
    }

    /// Id as it appears on the wire: `None` renders as `null`.
    pub fn wire_id(&self) -> Option<String> {
        self.id.filter(|id| *id >= 1).map(|id| id.to_string())
    }

    /// Render the full error response body.
    pub fn to_json(&self) -> String {
        let body = ErrorBody {
            jsonrpc: JSONRPC_VERSION,
            error: ErrorObject {
                code: self.code,
                message: self.message(),
            },
            id: self.wire_id(),
        };
        serde_json::to_string(&body).unwrap_or_else(|_| FALLBACK_ERROR_BODY.to_string())
    }
}

/// Written when an error body itself fails to serialize.
pub(crate) const FALLBACK_ERROR_BODY: &str =
    r#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"},"id":null}"#;

#[derive(Serialize)]
struct ErrorBody<'a> {
    jsonrpc: &'static str,
    error: ErrorObject<'a>,
    id: Option<String>,
}

#[derive(Serialize)]
struct ErrorObject<'a> {
    code: i32,
    message: &'a str,
}

impl From<RpcErrorCode> for RpcError {
    fn from(code: RpcErrorCode) -> Self {
        Self::new(code)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error [{}]: {}", self.code, self.message())?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}
