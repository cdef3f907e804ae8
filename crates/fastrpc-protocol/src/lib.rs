//! fastrpc protocol types.
//!
//! The JSON-RPC 2.0 subset spoken over a FastCGI request body: the error
//! taxonomy, the envelope validator and the response encoder. Nothing here
//! touches the transport or the service layer.

pub mod envelope;
pub mod error;
pub mod jsonrpc;

pub use envelope::parse_request;
pub use error::{HandlerResult, RpcError, RpcErrorCode};
pub use jsonrpc::{JSONRPC_VERSION, RpcRequest, RpcResponse, SuccessResponse};
