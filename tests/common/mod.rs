//! Shared fixtures: WAT components served from an in-memory origin family.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use supervisor::config::GatedFunction;
use supervisor::host_api::http::{HttpResponse, MemoryHttpClient};
use supervisor::host_api::storage::MemoryKvStore;
use supervisor::{PromptParams, PromptSurface, Supervisor, SupervisorConfig, SupervisorError};
use tokio::sync::mpsc;

pub const ROOT: &str = "psibase.test";
pub const CHAIN: &str = "test-chain";

pub fn config() -> SupervisorConfig {
    SupervisorConfig {
        root_domain: ROOT.to_string(),
        chain_id: CHAIN.to_string(),
        ..SupervisorConfig::default()
    }
}

/// A config gating `invite` `invitee::accept`.
pub fn gated_config() -> SupervisorConfig {
    let mut config = config();
    config.gated.push(GatedFunction::new("invite", "invitee", "accept"));
    config
}

pub fn app_origin(app: &str) -> String {
    format!("https://{}.{}", app, ROOT)
}

pub fn plugin_url(service: &str, plugin: &str) -> String {
    format!("https://{}.{}/{}.wasm", service, ROOT, plugin)
}

/// Escapes bytes for a WAT string literal.
pub fn wat_string(s: &str) -> String {
    let mut out = String::new();
    for b in s.bytes() {
        if (0x20..0x7f).contains(&b) && b != b'"' && b != b'\\' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{:02x}", b));
        }
    }
    out
}

/// Exports `export` returning `output` verbatim.
pub fn constant(export: &str, output: &str) -> String {
    format!(
        r#"(module
  (memory (export "memory") 1)
  (data (i32.const 0) "{data}")
  (func (export "{export}") (param i32 i32 i32 i32) (result i32)
    (memory.copy (local.get 2) (i32.const 0) (i32.const {len}))
    (i32.const {len})))"#,
        data = wat_string(output),
        len = output.len(),
    )
}

/// Exports `export` returning its params array.
pub fn echo(export: &str) -> String {
    format!(
        r#"(module
  (memory (export "memory") 1)
  (func (export "{export}") (param i32 i32 i32 i32) (result i32)
    (memory.copy (local.get 2) (local.get 0) (local.get 1))
    (local.get 1)))"#
    )
}

/// One export per `(export, op, input)`; each calls host op `op` with the
/// JSON `input` and returns the host's result envelope.
pub fn host_calls(calls: &[(&str, &str, &str)]) -> String {
    let mut ops: Vec<&str> = calls.iter().map(|(_, op, _)| *op).collect();
    ops.sort();
    ops.dedup();

    let mut module = String::from("(module\n");
    for op in &ops {
        module.push_str(&format!(
            "  (import \"host:common/api\" \"{op}\" (func ${op} (param i32 i32) (result i64)))\n"
        ));
    }
    module.push_str("  (memory (export \"memory\") 1)\n");

    let mut offset = 0;
    for (export, op, input) in calls {
        module.push_str(&format!(
            "  (data (i32.const {offset}) \"{data}\")\n",
            data = wat_string(input)
        ));
        module.push_str(&format!(
            r#"  (func (export "{export}") (param i32 i32 i32 i32) (result i32)
    (local $packed i64) (local $len i32)
    (local.set $packed (call ${op} (i32.const {offset}) (i32.const {len})))
    (local.set $len (i32.wrap_i64 (i64.shr_u (local.get $packed) (i64.const 32))))
    (memory.copy (local.get 2) (i32.wrap_i64 (local.get $packed)) (local.get $len))
    (local.get $len))
"#,
            len = input.len()
        ));
        offset += input.len();
    }
    module.push(')');
    module
}

/// Exports `export` forwarding its params to `{target}/{intf}` `method` and
/// returning the proxy's result envelope.
pub fn forward(export: &str, target: &str, intf: &str, method: &str) -> String {
    format!(
        r#"(module
  (import "{target}/{intf}" "{method}" (func $proxy (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "{export}") (param i32 i32 i32 i32) (result i32)
    (call $proxy (local.get 0) (local.get 1) (local.get 2) (local.get 3))))"#
    )
}

/// Exports `export` returning `[params, getServiceStack, getActiveApp]`,
/// the last two as host result envelopes.
pub fn context_echo(export: &str) -> String {
    format!(
        r#"(module
  (import "host:common/api" "getServiceStack" (func $stack (param i32 i32) (result i64)))
  (import "host:common/api" "getActiveApp" (func $app (param i32 i32) (result i64)))
  (memory (export "memory") 1)
  (data (i32.const 0) "[,]")
  (func $append (param $dst i32) (param $src i32) (param $len i32) (result i32)
    (memory.copy (local.get $dst) (local.get $src) (local.get $len))
    (i32.add (local.get $dst) (local.get $len)))
  (func $append_result (param $dst i32) (param $packed i64) (result i32)
    (call $append (local.get $dst)
      (i32.wrap_i64 (local.get $packed))
      (i32.wrap_i64 (i64.shr_u (local.get $packed) (i64.const 32)))))
  (func (export "{export}") (param $in i32) (param $in_len i32) (param $out i32) (param $cap i32) (result i32)
    (local $p i32)
    (local.set $p (call $append (local.get $out) (i32.const 0) (i32.const 1)))
    (local.set $p (call $append (local.get $p) (local.get $in) (local.get $in_len)))
    (local.set $p (call $append (local.get $p) (i32.const 1) (i32.const 1)))
    (local.set $p (call $append_result (local.get $p) (call $stack (i32.const 0) (i32.const 0))))
    (local.set $p (call $append (local.get $p) (i32.const 1) (i32.const 1)))
    (local.set $p (call $append_result (local.get $p) (call $app (i32.const 0) (i32.const 0))))
    (local.set $p (call $append (local.get $p) (i32.const 2) (i32.const 1)))
    (i32.sub (local.get $p) (local.get $out))))"#
    )
}

/// Exports `export`, which calls `first` and discards its result, then
/// calls `second` and returns its result envelope. Both are
/// `(target/intf, method)` pairs receiving the export's params.
pub fn call_both(export: &str, first: (&str, &str), second: (&str, &str)) -> String {
    format!(
        r#"(module
  (import "{first_ns}" "{first_method}" (func $first (param i32 i32 i32 i32) (result i32)))
  (import "{second_ns}" "{second_method}" (func $second (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "{export}") (param i32 i32 i32 i32) (result i32)
    (drop (call $first (local.get 0) (local.get 1) (local.get 2) (local.get 3)))
    (call $second (local.get 0) (local.get 1) (local.get 2) (local.get 3))))"#,
        first_ns = first.0,
        first_method = first.1,
        second_ns = second.0,
        second_method = second.1,
    )
}

/// Exports `export`, which traps, and `ok::ping`, which returns `"pong"`.
pub fn trapping(export: &str) -> String {
    format!(
        r#"(module
  (memory (export "memory") 1)
  (data (i32.const 0) "\22pong\22")
  (func (export "{export}") (param i32 i32 i32 i32) (result i32)
    unreachable)
  (func (export "ok::ping") (param i32 i32 i32 i32) (result i32)
    (memory.copy (local.get 2) (i32.const 0) (i32.const 6))
    (i32.const 6)))"#
    )
}

/// Exports `export`, which reports failure with a negative length.
pub fn failing(export: &str) -> String {
    format!(
        r#"(module
  (memory (export "memory") 1)
  (func (export "{export}") (param i32 i32 i32 i32) (result i32)
    (i32.const -1)))"#
    )
}

/// Forwards prompt requests to the test.
pub struct RecordingPrompt {
    tx: mpsc::UnboundedSender<PromptParams>,
}

#[async_trait]
impl PromptSurface for RecordingPrompt {
    async fn open(&self, params: PromptParams) -> Result<(), SupervisorError> {
        self.tx
            .send(params)
            .map_err(|_| SupervisorError::Transport("test dropped the prompt receiver".into()))
    }
}

pub struct Harness {
    pub supervisor: Supervisor,
    pub http: Arc<MemoryHttpClient>,
    pub storage: Arc<MemoryKvStore>,
    pub prompts: mpsc::UnboundedReceiver<PromptParams>,
}

impl Harness {
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_timeout(config, Duration::from_secs(30))
    }

    pub fn with_timeout(config: SupervisorConfig, timeout: Duration) -> Self {
        let http = Arc::new(MemoryHttpClient::new());
        let storage = Arc::new(MemoryKvStore::new());
        let (tx, prompts) = mpsc::unbounded_channel();
        let supervisor = Supervisor::builder(config)
            .http(http.clone())
            .storage(storage.clone())
            .prompt(Arc::new(RecordingPrompt { tx }))
            .prompt_timeout(timeout)
            .build()
            .expect("valid test config");
        Self {
            supervisor,
            http,
            storage,
            prompts,
        }
    }

    /// Serves `wat` as `{service}:{plugin}`.
    pub fn publish(&self, service: &str, plugin: &str, wat: &str) {
        let wasm = wat::parse_str(wat).expect("test component should parse");
        self.http
            .route(&plugin_url(service, plugin), HttpResponse::ok(wasm));
    }

    /// Waits for the next prompt.
    pub async fn next_prompt(&mut self) -> PromptParams {
        tokio::time::timeout(Duration::from_secs(5), self.prompts.recv())
            .await
            .expect("prompt should open")
            .expect("prompt channel open")
    }

    pub fn has_storage_key(&self, key: &str) -> bool {
        self.storage.keys().iter().any(|k| k == key)
    }
}
