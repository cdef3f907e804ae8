//! Metadata-described method tables.
//!
//! A [`NamedService`] declares its methods once at startup. The resulting
//! [`MethodTable`] is frozen behind an `Arc` and shared by every request,
//! so workers never observe a table that is still being built.

use std::collections::HashMap;
use std::sync::Arc;

use fastrpc_protocol::{HandlerResult, RpcError};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::{Service, ServiceContext, ServiceFactory};

/// Expected JSON type of a positional parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Any,
    String,
    Number,
    Integer,
    Bool,
    Array,
    Object,
}

impl ParamKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Bool => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Method implementation. Receives the already-checked positional params.
pub type Handler<S> = fn(&mut S, Vec<Value>) -> HandlerResult;

/// One registered method.
pub struct MethodSpec<S> {
    name: String,
    params: Vec<ParamKind>,
    rest: Option<ParamKind>,
    handler: Handler<S>,
}

impl<S> MethodSpec<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed positional parameters.
    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    /// Kind accepted for every parameter after the fixed ones, if variadic.
    pub fn rest(&self) -> Option<ParamKind> {
        self.rest
    }

    fn check(&self, params: &[Value]) -> Result<(), RpcError> {
        let fixed = self.params.len();
        let arity_ok = match self.rest {
            Some(_) => params.len() >= fixed,
            None => params.len() == fixed,
        };
        if !arity_ok {
            let expected = match self.rest {
                Some(_) => format!("at least {fixed}"),
                None => fixed.to_string(),
            };
            return Err(RpcError::invalid_params(format!(
                "{} expects {expected} params, got {}",
                self.name,
                params.len()
            )));
        }

        for (position, value) in params.iter().enumerate() {
            let kind = self.params.get(position).copied().or(self.rest);
            if let Some(kind) = kind
                && !kind.matches(value)
            {
                return Err(RpcError::invalid_params(format!(
                    "{} param {position} must be {}",
                    self.name,
                    kind.name()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("method {0} registered twice")]
    Duplicate(String),

    #[error("method name must not be empty")]
    EmptyName,
}

/// Collects method declarations during the registration hook.
pub struct MethodTableBuilder<S> {
    methods: Vec<MethodSpec<S>>,
}

impl<S> MethodTableBuilder<S> {
    pub fn new() -> Self {
        Self {
            methods: Vec::new(),
        }
    }

    /// Register a method taking exactly `params`.
    pub fn method(
        &mut self,
        name: impl Into<String>,
        params: &[ParamKind],
        handler: Handler<S>,
    ) -> &mut Self {
        self.push(name.into(), params, None, handler)
    }

    /// Register a method taking `params` followed by any number of `rest`.
    pub fn variadic(
        &mut self,
        name: impl Into<String>,
        params: &[ParamKind],
        rest: ParamKind,
        handler: Handler<S>,
    ) -> &mut Self {
        self.push(name.into(), params, Some(rest), handler)
    }

    fn push(
        &mut self,
        name: String,
        params: &[ParamKind],
        rest: Option<ParamKind>,
        handler: Handler<S>,
    ) -> &mut Self {
        self.methods.push(MethodSpec {
            name,
            params: params.to_vec(),
            rest,
            handler,
        });
        self
    }

    pub fn build(self) -> Result<MethodTable<S>, RegistryError> {
        let mut methods = HashMap::with_capacity(self.methods.len());
        for entry in self.methods {
            if entry.name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if methods.contains_key(&entry.name) {
                return Err(RegistryError::Duplicate(entry.name));
            }
            methods.insert(entry.name.clone(), entry);
        }
        Ok(MethodTable { methods })
    }
}

impl<S> Default for MethodTableBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable method table.
pub struct MethodTable<S> {
    methods: HashMap<String, MethodSpec<S>>,
}

impl<S> MethodTable<S> {
    pub fn get(&self, method: &str) -> Option<&MethodSpec<S>> {
        self.methods.get(method)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Resolve `method`, check its params and call it on `service`.
    pub fn invoke(&self, service: &mut S, method: &str, params: Vec<Value>) -> HandlerResult {
        let entry = self
            .get(method)
            .ok_or_else(|| RpcError::method_not_found(method))?;
        entry.check(&params)?;
        (entry.handler)(service, params)
    }
}

/// A service whose methods are described by a [`MethodTable`].
pub trait NamedService: Send + Sized + 'static {
    /// Service type identifier.
    const NAME: &'static str;

    /// Registration hook, run once at startup before any worker exists.
    fn register(methods: &mut MethodTableBuilder<Self>);

    /// Construct the instance for one request.
    fn new(context: ServiceContext) -> Self;
}

/// Factory for a [`NamedService`]; owns the frozen method table.
pub struct TableFactory<S> {
    table: Arc<MethodTable<S>>,
}

impl<S: NamedService> TableFactory<S> {
    /// Run the registration hook and freeze the table.
    pub fn new() -> Result<Self, RegistryError> {
        let mut builder = MethodTableBuilder::new();
        S::register(&mut builder);
        let table = builder.build()?;
        info!("Service {} registered {} methods", S::NAME, table.len());
        Ok(Self {
            table: Arc::new(table),
        })
    }

    pub fn table(&self) -> &MethodTable<S> {
        &self.table
    }
}

impl<S: NamedService> ServiceFactory for TableFactory<S> {
    type Service = TableService<S>;

    fn create(&self, context: ServiceContext) -> Self::Service {
        TableService {
            table: Arc::clone(&self.table),
            inner: S::new(context),
        }
    }
}

/// Per-request instance of a [`NamedService`] bound to its table.
pub struct TableService<S> {
    table: Arc<MethodTable<S>>,
    inner: S,
}

impl<S> TableService<S> {
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: NamedService> Service for TableService<S> {
    async fn process(&mut self, method: &str, params: Vec<Value>) -> HandlerResult {
        self.table.invoke(&mut self.inner, method, params)
    }
}
