//! Host Function Registration API
//!
//! A builder for registering host functions with namespaced import modules.
//! Functions are registered either raw (direct WASM-level access, used by
//! the WASI shim) or as JSON functions whose input is read from the
//! component's memory and whose `Result` is written back as JSON.
//!
//! # Example
//!
//! ```ignore
//! let mut linker = Linker::new(&engine);
//! let mut builder = HostLinkerBuilder::new(&mut linker);
//! builder
//!     .interface("host:common/api")?
//!     .func_json_async("getChainId", |ctx: AsyncCtx<HostContext>, _input| async move {
//!         Ok(serde_json::json!("local"))
//!     })?;
//! ```

use crate::error::{ErrorPayload, SupervisorError};
use crate::runtime::{HOST_RESULT_CAPACITY, HOST_RESULT_OFFSET};
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;
use wasmtime::{Caller, Linker, Memory};

// ============================================================================
// Error Handling Infrastructure
// ============================================================================

/// Error that occurred while marshaling a host function call.
///
/// These are failures of the calling convention itself (bad pointers, a
/// result that does not fit); errors of the operation are returned to the
/// component as an `Err` result instead.
#[derive(Debug, Clone)]
pub struct HostFunctionError {
    /// The import module name (e.g., "host:common/api")
    pub interface: String,
    /// The function name (e.g., "dbGet")
    pub function: String,
    pub kind: HostFunctionErrorKind,
}

impl std::fmt::Display for HostFunctionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "host function error in {}::{}: {}",
            self.interface, self.function, self.kind
        )
    }
}

impl std::error::Error for HostFunctionError {}

#[derive(Debug, Clone)]
pub enum HostFunctionErrorKind {
    /// Failed to read from WASM memory
    MemoryRead(String),
    /// Failed to write to WASM memory
    MemoryWrite(String),
    /// Failed to encode the result
    Encode(String),
}

impl std::fmt::Display for HostFunctionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryRead(e) => write!(f, "memory read failed: {}", e),
            Self::MemoryWrite(e) => write!(f, "memory write failed: {}", e),
            Self::Encode(e) => write!(f, "encode failed: {}", e),
        }
    }
}

/// Handler function for host function errors.
///
/// Called whenever marshaling fails, allowing for logging or counting.
pub type ErrorHandler = Arc<dyn Fn(&HostFunctionError) + Send + Sync>;

fn default_error_handler(err: &HostFunctionError) {
    error!(
        interface = %err.interface,
        function = %err.function,
        "{}",
        err.kind
    );
}

/// Errors from linker operations
#[derive(Error, Debug)]
pub enum LinkerError {
    #[error("Function registration failed: {0}")]
    FunctionRegistration(String),

    #[error("Memory error: {0}")]
    MemoryError(String),
}

impl From<LinkerError> for SupervisorError {
    fn from(e: LinkerError) -> Self {
        SupervisorError::Link(e.to_string())
    }
}

fn exported_memory<T>(caller: &mut Caller<'_, T>) -> Option<Memory> {
    caller.get_export("memory").and_then(|e| e.into_memory())
}

/// Decodes a JSON input; an empty input is `null`.
fn decode_input(bytes: &[u8]) -> Result<Value, SupervisorError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes)
        .map_err(|e| SupervisorError::Validation(format!("input is not valid JSON: {}", e)))
}

/// Encodes `{"Ok": value}` or `{"Err": {"message", "kind"}}`.
pub fn encode_result(result: Result<Value, SupervisorError>) -> Result<Vec<u8>, serde_json::Error> {
    let envelope: Result<Value, ErrorPayload> = result.map_err(|e| e.to_payload());
    serde_json::to_vec(&envelope)
}

/// Context wrapper providing access to store data and memory.
///
/// Used by raw host functions that work on pointers directly.
pub struct Ctx<'a, T> {
    caller: Caller<'a, T>,
}

impl<'a, T> Ctx<'a, T> {
    pub fn new(caller: Caller<'a, T>) -> Self {
        Self { caller }
    }

    pub fn data(&self) -> &T {
        self.caller.data()
    }

    fn memory(&mut self) -> Result<Memory, LinkerError> {
        exported_memory(&mut self.caller)
            .ok_or_else(|| LinkerError::MemoryError("no memory export".into()))
    }

    pub fn read_bytes(&mut self, ptr: i32, len: i32) -> Result<Vec<u8>, LinkerError> {
        let memory = self.memory()?;
        let mut buffer = vec![0u8; len as u32 as usize];
        memory
            .read(&self.caller, ptr as u32 as usize, &mut buffer)
            .map_err(|e| LinkerError::MemoryError(e.to_string()))?;
        Ok(buffer)
    }

    pub fn write_bytes(&mut self, ptr: i32, bytes: &[u8]) -> Result<(), LinkerError> {
        let memory = self.memory()?;
        memory
            .write(&mut self.caller, ptr as u32 as usize, bytes)
            .map_err(|e| LinkerError::MemoryError(e.to_string()))
    }

    pub fn read_u32(&mut self, ptr: i32) -> Result<u32, LinkerError> {
        let bytes = self.read_bytes(ptr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&mut self, ptr: i32, value: u32) -> Result<(), LinkerError> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, ptr: i32, value: u64) -> Result<(), LinkerError> {
        self.write_bytes(ptr, &value.to_le_bytes())
    }
}

/// Builder for registering host functions with a Linker.
///
/// Generic over `T` which is the store data type.
pub struct HostLinkerBuilder<'a, T> {
    linker: &'a mut Linker<T>,
    error_handler: Option<ErrorHandler>,
    _marker: PhantomData<T>,
}

impl<'a, T> HostLinkerBuilder<'a, T> {
    pub fn new(linker: &'a mut Linker<T>) -> Self {
        Self {
            linker,
            error_handler: None,
            _marker: PhantomData,
        }
    }

    /// Set a custom error handler for marshaling failures.
    ///
    /// # Example
    ///
    /// ```ignore
    /// builder.on_error(|err| {
    ///     tracing::warn!("host function error: {}", err);
    /// });
    /// ```
    pub fn on_error<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&HostFunctionError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Start defining an import module with the given name, e.g.
    /// `"host:common/api"` or `"wasi_snapshot_preview1"`.
    pub fn interface(&mut self, name: &str) -> Result<InterfaceBuilder<'_, 'a, T>, LinkerError> {
        let error_handler = self.error_handler.clone();
        Ok(InterfaceBuilder {
            linker: self,
            module_name: name.to_string(),
            error_handler,
        })
    }

    /// Register a provider's functions.
    pub fn register_provider<P: HostFunctionProvider<T>>(
        &mut self,
        provider: &P,
    ) -> Result<&mut Self, LinkerError> {
        provider.register(self)?;
        Ok(self)
    }

}

/// Builder for registering functions within a specific import module.
pub struct InterfaceBuilder<'a, 'b, T> {
    linker: &'a mut HostLinkerBuilder<'b, T>,
    module_name: String,
    error_handler: Option<ErrorHandler>,
}

impl<'a, 'b, T: 'static> InterfaceBuilder<'a, 'b, T> {
    /// Register a raw host function with direct WASM-level parameters.
    ///
    /// # Example
    ///
    /// ```ignore
    /// interface.func_raw("sched_yield", |_caller: Caller<'_, HostContext>| -> i32 { 0 })?;
    /// ```
    pub fn func_raw<Params, Results>(
        &mut self,
        name: &str,
        func: impl wasmtime::IntoFunc<T, Params, Results>,
    ) -> Result<&mut Self, LinkerError> {
        self.linker
            .linker
            .func_wrap(&self.module_name, name, func)
            .map_err(|e| LinkerError::FunctionRegistration(e.to_string()))?;
        Ok(self)
    }

    fn reporter(
        &self,
        function: &str,
    ) -> impl Fn(HostFunctionErrorKind) + Send + Sync + Clone + 'static {
        let error_handler = self.error_handler.clone();
        let interface = self.module_name.clone();
        let function = function.to_string();
        move |kind| {
            let error = HostFunctionError {
                interface: interface.clone(),
                function: function.clone(),
                kind,
            };
            match &error_handler {
                Some(handler) => handler(&error),
                None => default_error_handler(&error),
            }
        }
    }
}

// ============================================================================
// Async Host Functions (require T: Send)
// ============================================================================

impl<'a, 'b, T: Send + Clone + 'static> InterfaceBuilder<'a, 'b, T> {
    /// Register an async JSON host function.
    ///
    /// The WASM function signature is `(ptr: i32, len: i32) -> i64` where:
    /// - Input: ptr/len point to a JSON document (empty means `null`)
    /// - Output: packed i64 containing (out_len << 32 | out_ptr); the JSON
    ///   `Result` is written at [`HOST_RESULT_OFFSET`]
    ///
    /// Marshaling failures are reported via the error handler and return 0.
    pub fn func_json_async<F, Fut>(&mut self, name: &str, func: F) -> Result<&mut Self, LinkerError>
    where
        F: Fn(AsyncCtx<T>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SupervisorError>> + Send + 'static,
    {
        let func = Arc::new(func);
        let report = self.reporter(name);

        self.linker
            .linker
            .func_wrap_async(
                &self.module_name,
                name,
                move |mut caller: Caller<'_, T>, (ptr, len): (i32, i32)| {
                    let func = func.clone();
                    let report = report.clone();

                    // Clone state before entering async block
                    let state = caller.data().clone();

                    Box::new(async move {
                        let Some(memory) = exported_memory(&mut caller) else {
                            report(HostFunctionErrorKind::MemoryRead("no memory export".into()));
                            return 0;
                        };

                        let mut buffer = vec![0u8; len as u32 as usize];
                        if let Err(e) = memory.read(&caller, ptr as u32 as usize, &mut buffer) {
                            report(HostFunctionErrorKind::MemoryRead(e.to_string()));
                            return 0;
                        }

                        let result = match decode_input(&buffer) {
                            Ok(input) => func(AsyncCtx::new(state), input).await,
                            Err(e) => Err(e),
                        };

                        let mut bytes = match encode_result(result) {
                            Ok(b) => b,
                            Err(e) => {
                                report(HostFunctionErrorKind::Encode(e.to_string()));
                                return 0;
                            }
                        };
                        if bytes.len() > HOST_RESULT_CAPACITY {
                            let overflow = SupervisorError::Plugin(format!(
                                "host result of {} bytes exceeds {} bytes",
                                bytes.len(),
                                HOST_RESULT_CAPACITY
                            ));
                            bytes = match encode_result(Err(overflow)) {
                                Ok(b) => b,
                                Err(e) => {
                                    report(HostFunctionErrorKind::Encode(e.to_string()));
                                    return 0;
                                }
                            };
                        }

                        if let Err(e) = memory.write(&mut caller, HOST_RESULT_OFFSET, &bytes) {
                            report(HostFunctionErrorKind::MemoryWrite(e.to_string()));
                            return 0;
                        }

                        ((bytes.len() as i64) << 32) | (HOST_RESULT_OFFSET as i64 & 0xFFFFFFFF)
                    })
                },
            )
            .map_err(|e| LinkerError::FunctionRegistration(e.to_string()))?;

        Ok(self)
    }

    /// Register an async JSON function using the caller-provides-output-buffer
    /// convention, the same shape as component exports.
    ///
    /// The WASM function signature is `(in_ptr, in_len, out_ptr, out_cap) -> out_len`.
    /// The JSON `Result` is written into the caller's buffer. Returns -1 if
    /// it does not fit or marshaling fails.
    pub fn func_forward_async<F, Fut>(
        &mut self,
        name: &str,
        func: F,
    ) -> Result<&mut Self, LinkerError>
    where
        F: Fn(AsyncCtx<T>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, SupervisorError>> + Send + 'static,
    {
        let func = Arc::new(func);
        let report = self.reporter(name);

        self.linker
            .linker
            .func_wrap_async(
                &self.module_name,
                name,
                move |mut caller: Caller<'_, T>,
                      (in_ptr, in_len, out_ptr, out_cap): (i32, i32, i32, i32)| {
                    let func = func.clone();
                    let report = report.clone();
                    let state = caller.data().clone();

                    Box::new(async move {
                        let Some(memory) = exported_memory(&mut caller) else {
                            report(HostFunctionErrorKind::MemoryRead("no memory export".into()));
                            return -1;
                        };

                        let mut buffer = vec![0u8; in_len as u32 as usize];
                        if let Err(e) = memory.read(&caller, in_ptr as u32 as usize, &mut buffer) {
                            report(HostFunctionErrorKind::MemoryRead(e.to_string()));
                            return -1;
                        }

                        let result = match decode_input(&buffer) {
                            Ok(input) => func(AsyncCtx::new(state), input).await,
                            Err(e) => Err(e),
                        };

                        let bytes = match encode_result(result) {
                            Ok(b) => b,
                            Err(e) => {
                                report(HostFunctionErrorKind::Encode(e.to_string()));
                                return -1;
                            }
                        };
                        if bytes.len() > out_cap.max(0) as usize {
                            report(HostFunctionErrorKind::MemoryWrite(format!(
                                "result of {} bytes does not fit buffer of {}",
                                bytes.len(),
                                out_cap
                            )));
                            return -1;
                        }

                        if let Err(e) = memory.write(&mut caller, out_ptr as u32 as usize, &bytes) {
                            report(HostFunctionErrorKind::MemoryWrite(e.to_string()));
                            return -1;
                        }

                        bytes.len() as i32
                    })
                },
            )
            .map_err(|e| LinkerError::FunctionRegistration(e.to_string()))?;

        Ok(self)
    }
}

/// Async context for async host functions.
///
/// Holds a clone of the store state taken before the async block, since
/// the caller cannot be borrowed across await points by the handler.
pub struct AsyncCtx<T> {
    state: T,
}

impl<T> AsyncCtx<T> {
    pub fn new(state: T) -> Self {
        Self { state }
    }

    pub fn data(&self) -> &T {
        &self.state
    }
}

/// Trait for types that provide host functions.
///
/// # Example
///
/// ```ignore
/// struct LoggingProvider;
///
/// impl HostFunctionProvider<HostContext> for LoggingProvider {
///     fn register(&self, builder: &mut HostLinkerBuilder<'_, HostContext>) -> Result<(), LinkerError> {
///         builder.interface("logging")?
///             .func_raw("log", |caller, ptr, len| { ... })?;
///         Ok(())
///     }
/// }
/// ```
pub trait HostFunctionProvider<T> {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, T>) -> Result<(), LinkerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wasmtime::{Config, Engine, Module, Store};

    fn async_engine() -> Engine {
        let mut config = Config::new();
        config.async_support(true);
        Engine::new(&config).unwrap()
    }

    #[test]
    fn test_interface_builder_creation() {
        let engine = Engine::default();
        let mut linker = Linker::<()>::new(&engine);
        let mut builder = HostLinkerBuilder::new(&mut linker);

        assert!(builder.interface("host:common/api").is_ok());
        assert!(builder.interface("wasi_snapshot_preview1").is_ok());
    }

    struct TestProvider;

    impl HostFunctionProvider<()> for TestProvider {
        fn register(&self, builder: &mut HostLinkerBuilder<'_, ()>) -> Result<(), LinkerError> {
            builder
                .interface("test")?
                .func_raw("add", |_caller: Caller<'_, ()>, a: i32, b: i32| a + b)?;
            Ok(())
        }
    }

    #[test]
    fn test_provider_registration() {
        let engine = Engine::default();
        let mut linker = Linker::<()>::new(&engine);
        let mut builder = HostLinkerBuilder::new(&mut linker);
        assert!(builder.register_provider(&TestProvider).is_ok());
    }

    #[test]
    fn results_use_ok_err_envelope() {
        let ok = encode_result(Ok(json!([1, 2]))).unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&ok).unwrap(), json!({"Ok": [1, 2]}));

        let err = encode_result(Err(SupervisorError::Storage("full".into()))).unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&err).unwrap(),
            json!({"Err": {"message": "full", "kind": "storage"}})
        );
    }

    #[tokio::test]
    async fn json_function_writes_result_at_fixed_offset() {
        let engine = async_engine();
        let mut linker = Linker::<()>::new(&engine);
        let mut builder = HostLinkerBuilder::new(&mut linker);
        builder
            .interface("test")
            .unwrap()
            .func_json_async("echo", |_ctx: AsyncCtx<()>, input| async move {
                Ok(json!({ "echo": input }))
            })
            .unwrap();

        let wat = r#"
            (module
                (import "test" "echo" (func $echo (param i32 i32) (result i64)))
                (memory (export "memory") 1)
                (data (i32.const 0) "[7]")
                (func (export "run") (result i64)
                    (call $echo (i32.const 0) (i32.const 3))))
        "#;
        let module = Module::new(&engine, wat).unwrap();
        let mut store = Store::new(&engine, ());
        let instance = linker.instantiate_async(&mut store, &module).await.unwrap();
        let run = instance
            .get_typed_func::<(), i64>(&mut store, "run")
            .unwrap();
        let packed = run.call_async(&mut store, ()).await.unwrap();

        let ptr = (packed & 0xFFFF_FFFF) as usize;
        let len = (packed >> 32) as usize;
        assert_eq!(ptr, HOST_RESULT_OFFSET);

        let memory = instance.get_memory(&mut store, "memory").unwrap();
        let mut out = vec![0u8; len];
        memory.read(&store, ptr, &mut out).unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&out).unwrap(),
            json!({"Ok": {"echo": [7]}})
        );
    }
}
