//! fastrpc service layer
//!
//! A service is created fresh for every request by its [`ServiceFactory`],
//! handed a [`ServiceContext`], asked to `process` one method call and then
//! dropped. Services described by a [`MethodTable`] get method lookup and
//! positional parameter checking for free through [`TableFactory`].

pub mod system;
pub mod table;

use std::future::Future;

use fastrpc_protocol::HandlerResult;
use serde_json::Value;

pub use system::SystemService;
pub use table::{
    MethodSpec, MethodTable, MethodTableBuilder, NamedService, ParamKind, RegistryError,
    TableFactory, TableService,
};

/// Per-request state handed to a new service instance.
#[derive(Debug, Clone, Default)]
pub struct ServiceContext {
    /// Caller address from the front-end server, when it sent one.
    pub remote_addr: Option<String>,
    /// Server-side id of the request job, for log correlation.
    pub request_id: String,
}

/// One service instance, used for a single call.
pub trait Service: Send + 'static {
    /// Invoke `method` with positional `params`.
    ///
    /// Unknown methods and bad parameters are reported by the service itself
    /// (`MethodNotFound`, `InvalidParams`); the dispatcher passes them on.
    fn process(
        &mut self,
        method: &str,
        params: Vec<Value>,
    ) -> impl Future<Output = HandlerResult> + Send;
}

/// Builds service instances. Shared read-only by all workers.
pub trait ServiceFactory: Send + Sync + 'static {
    type Service: Service;

    /// Create the instance for one request. It is dropped right after the call.
    fn create(&self, context: ServiceContext) -> Self::Service;
}
