//! Executors: what a worker slot actually runs
//!
//! An executor is built once per worker slot from the subtask's init params
//! and then serves method calls for the lifetime of the pool. Handlers are
//! registered by name in a [`MethodTable`]; an [`ExecutorRegistry`] maps an
//! executor kind (stored on the subtask row) to a factory.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::model::{MethodCall, MethodError, MethodResult};

/// Object-safe interface of a live worker
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    /// Run one method call
    ///
    /// Failures are reported inside the result, never as a panic.
    async fn invoke(&self, call: &MethodCall) -> MethodResult;
}

type Handler<S> =
    Arc<dyn Fn(Arc<S>, Vec<Value>) -> BoxFuture<'static, Result<Value, MethodError>> + Send + Sync>;

/// Name-to-handler dispatch table over a worker state `S`
///
/// Arguments arrive as a positional JSON array and are decoded into the
/// handler's parameter type, so a handler taking `(String, u32)` is called
/// with `["name", 3]`.
///
/// # Example
///
/// ```
/// use tasklane_durable::{MethodError, MethodTable};
///
/// struct Greeter { greeting: String }
///
/// let table = MethodTable::<Greeter>::new()
///     .method("greet", |state, (name,): (String,)| async move {
///         Ok::<_, MethodError>(format!("{}, {}", state.greeting, name))
///     });
/// assert!(table.contains("greet"));
/// ```
pub struct MethodTable<S> {
    handlers: HashMap<String, Handler<S>>,
}

impl<S> Default for MethodTable<S>
where
    S: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> MethodTable<S>
where
    S: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under `name`
    pub fn method<A, R, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
    {
        let method_name = name.to_string();
        let handler = Arc::new(handler);
        let erased: Handler<S> = Arc::new(
            move |state: Arc<S>, args: Vec<Value>| -> BoxFuture<'static, Result<Value, MethodError>> {
                let handler = Arc::clone(&handler);
                let method_name = method_name.clone();
                Box::pin(async move {
                    let args: A = decode_args(&method_name, args)?;
                    let result = handler(state, args).await?;
                    serde_json::to_value(result).map_err(MethodError::from)
                })
            },
        );
        self.handlers.insert(name.to_string(), erased);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn decode_args<A: DeserializeOwned>(method_name: &str, args: Vec<Value>) -> Result<A, MethodError> {
    let empty = args.is_empty();
    match serde_json::from_value(Value::Array(args)) {
        Ok(decoded) => Ok(decoded),
        // `()` decodes from null, not from []
        Err(_) if empty => serde_json::from_value(Value::Null)
            .map_err(|e| MethodError::invalid_arguments(method_name, e)),
        Err(e) => Err(MethodError::invalid_arguments(method_name, e)),
    }
}

/// A worker state bound to its dispatch table
struct TableExecutor<S> {
    state: Arc<S>,
    table: Arc<MethodTable<S>>,
}

#[async_trait]
impl<S> WorkerExecutor for TableExecutor<S>
where
    S: Send + Sync + 'static,
{
    async fn invoke(&self, call: &MethodCall) -> MethodResult {
        let Some(handler) = self.table.handlers.get(&call.method_name) else {
            return MethodResult::failure(
                call.method_name.clone(),
                MethodError::unknown_method(&call.method_name),
            );
        };

        match handler(Arc::clone(&self.state), call.args.clone()).await {
            Ok(value) => MethodResult::success(call.method_name.clone(), value),
            Err(error) => MethodResult::failure(call.method_name.clone(), error),
        }
    }
}

/// Builds one executor from a subtask's init params
pub type ExecutorFactory =
    Arc<dyn Fn(&[Value]) -> Result<Box<dyn WorkerExecutor>, MethodError> + Send + Sync>;

/// Registry of executor kinds
///
/// Shared by every subtask run; the kind string stored on a subtask row
/// selects the factory.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    factories: HashMap<String, ExecutorFactory>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind whose state is built by `init` and served by `table`
    ///
    /// # Example
    ///
    /// ```
    /// use tasklane_durable::{ExecutorRegistry, MethodError, MethodTable};
    ///
    /// struct Adder { base: i64 }
    ///
    /// let mut registry = ExecutorRegistry::new();
    /// registry.register(
    ///     "adder",
    ///     |params| {
    ///         let base = params.first().and_then(|v| v.as_i64()).unwrap_or(0);
    ///         Ok(Adder { base })
    ///     },
    ///     MethodTable::new().method("add", |state: std::sync::Arc<Adder>, (n,): (i64,)| async move {
    ///         Ok::<_, MethodError>(state.base + n)
    ///     }),
    /// );
    /// assert!(registry.contains("adder"));
    /// ```
    pub fn register<S, I>(&mut self, kind: &str, init: I, table: MethodTable<S>)
    where
        S: Send + Sync + 'static,
        I: Fn(&[Value]) -> Result<S, MethodError> + Send + Sync + 'static,
    {
        let table = Arc::new(table);
        self.register_executor(kind, move |params| {
            let state = init(params)?;
            Ok(Box::new(TableExecutor {
                state: Arc::new(state),
                table: Arc::clone(&table),
            }) as Box<dyn WorkerExecutor>)
        });
    }

    /// Register a kind with a custom executor factory
    pub fn register_executor<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&[Value]) -> Result<Box<dyn WorkerExecutor>, MethodError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    pub fn factory(&self, kind: &str) -> Option<ExecutorFactory> {
        self.factories.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
