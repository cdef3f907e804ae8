//! Built-in `system` service: liveness and diagnostics methods.

use fastrpc_protocol::{HandlerResult, RpcError};
use serde_json::{Number, Value, json};

use crate::ServiceContext;
use crate::table::{MethodTableBuilder, NamedService, ParamKind};

pub struct SystemService {
    context: ServiceContext,
}

impl NamedService for SystemService {
    const NAME: &'static str = "system";

    fn register(methods: &mut MethodTableBuilder<Self>) {
        methods
            .method("ping", &[], Self::ping)
            .variadic("echo", &[], ParamKind::Any, Self::echo)
            .variadic("sum", &[], ParamKind::Number, Self::sum)
            .method("remoteAddress", &[], Self::remote_address)
            .method("version", &[], Self::version);
    }

    fn new(context: ServiceContext) -> Self {
        Self { context }
    }
}

impl SystemService {
    fn ping(&mut self, _params: Vec<Value>) -> HandlerResult {
        Ok(json!("pong"))
    }

    fn echo(&mut self, params: Vec<Value>) -> HandlerResult {
        Ok(Value::Array(params))
    }

    fn sum(&mut self, params: Vec<Value>) -> HandlerResult {
        // integers stay exact as long as they fit
        let integers: Option<Vec<i64>> = params.iter().map(Value::as_i64).collect();
        if let Some(integers) = integers {
            return integers
                .iter()
                .try_fold(0i64, |acc, n| acc.checked_add(*n))
                .map(|total| json!(total))
                .ok_or_else(|| RpcError::invalid_params("sum overflows a 64-bit integer"));
        }

        let total: f64 = params.iter().filter_map(Value::as_f64).sum();
        Number::from_f64(total)
            .map(Value::Number)
            .ok_or_else(|| RpcError::invalid_params("sum is not a finite number"))
    }

    fn remote_address(&mut self, _params: Vec<Value>) -> HandlerResult {
        Ok(self
            .context
            .remote_addr
            .clone()
            .map_or(Value::Null, Value::String))
    }

    fn version(&mut self, _params: Vec<Value>) -> HandlerResult {
        Ok(json!(env!("CARGO_PKG_VERSION")))
    }
}
