//! Service dispatch: one fresh service instance per call.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use fastrpc_protocol::{HandlerResult, RpcError, RpcRequest};
use fastrpc_services::{Service, ServiceContext, ServiceFactory};
use futures_util::FutureExt;
use tracing::{debug, error};

pub struct Dispatcher<F> {
    factory: Arc<F>,
}

impl<F> Clone for Dispatcher<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<F: ServiceFactory> Dispatcher<F> {
    pub fn new(factory: Arc<F>) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Invoke `request.method` on a new service instance.
    ///
    /// The instance is dropped before this returns on every path, including a
    /// panic inside the service, which is reported as `InternalError`.
    pub async fn dispatch(
        &self,
        request: RpcRequest,
        remote_addr: Option<String>,
        request_id: String,
    ) -> HandlerResult {
        let RpcRequest { method, params, .. } = request;
        let context = ServiceContext {
            remote_addr,
            request_id,
        };

        let mut service = self.factory.create(context);
        debug!("Dispatching {method} ({} params)", params.len());
        let outcome = AssertUnwindSafe(service.process(&method, params))
            .catch_unwind()
            .await;
        drop(service);

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                error!("Service method {method} panicked: {detail}");
                Err(RpcError::internal(format!("{method} failed")))
            }
        }
    }
}
