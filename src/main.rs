//! Supervisor CLI
//!
//! Commands:
//!   supervisor call --origin <url> --service <s> --intf <i> --method <m>  - Run a call
//!   supervisor inspect <wasm>                                             - Classify imports and list exports

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use supervisor::host_api::http::DirectoryClient;
use supervisor::host_api::storage::FileKvStore;
use supervisor::runtime::{classify_import, exported_functions, ImportClass};
use supervisor::types::SUPERVISOR_SERVICE;
use supervisor::{
    ApprovalDuration, FunctionCallArgs, PromptParams, PromptSurface, Supervisor, SupervisorConfig,
    SupervisorError,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "supervisor")]
#[command(about = "Broker for WebAssembly service plugins", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a plugin method as the app at --origin
    Call {
        /// Origin of the calling app, e.g. https://myapp.psibase.localhost
        #[arg(long)]
        origin: String,

        #[arg(long)]
        service: String,

        #[arg(long)]
        plugin: Option<String>,

        #[arg(long)]
        intf: String,

        #[arg(long)]
        method: String,

        /// JSON array of parameters
        #[arg(long, default_value = "[]")]
        params: String,

        /// Load plugins from {dir}/{service}/{plugin}.wasm
        #[arg(long)]
        plugin_dir: Option<PathBuf>,
    },

    /// Classify the imports of a component and list its exports
    Inspect {
        /// Path to the WASM (or WAT) file
        wasm_file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("supervisor=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Call {
            origin,
            service,
            plugin,
            intf,
            method,
            params,
            plugin_dir,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if plugin_dir.is_some() {
                config.plugin_dir = plugin_dir;
            }
            let mut args = FunctionCallArgs::new(&service, &intf, &method, parse_params(&params)?);
            if let Some(plugin) = plugin {
                args = args.with_plugin(&plugin);
            }
            call_command(config, &origin, args).await
        }
        Commands::Inspect { wasm_file, json } => inspect_command(&wasm_file, json),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SupervisorConfig> {
    match path {
        Some(path) => SupervisorConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(SupervisorConfig::default()),
    }
}

fn parse_params(params: &str) -> anyhow::Result<Vec<Value>> {
    match serde_json::from_str::<Value>(params).context("--params is not valid JSON")? {
        Value::Array(params) => Ok(params),
        other => bail!("--params must be a JSON array, got {}", other),
    }
}

/// Hands prompts to the terminal loop.
struct TerminalPrompt {
    tx: mpsc::UnboundedSender<PromptParams>,
}

#[async_trait]
impl PromptSurface for TerminalPrompt {
    async fn open(&self, params: PromptParams) -> Result<(), SupervisorError> {
        self.tx
            .send(params)
            .map_err(|_| SupervisorError::Transport("terminal prompt closed".into()))
    }
}

async fn answer_prompts(supervisor: Supervisor, mut prompts: mpsc::UnboundedReceiver<PromptParams>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(params) = prompts.recv().await {
        eprintln!();
        eprintln!("{} asks: {}", params.callee, params.prompt);
        eprintln!("  requested by {} ({})", params.caller, params.id);
        eprint!("allow? [y]es for this session, [p]ermanently, [n]o: ");

        let answer = match lines.next_line().await {
            Ok(Some(line)) => line,
            _ => String::new(),
        };
        let gate = supervisor.gate();
        let outcome = match answer.trim() {
            "y" | "yes" => gate.accept(params.id, ApprovalDuration::Session, SUPERVISOR_SERVICE),
            "p" | "permanent" => gate.accept(params.id, ApprovalDuration::Permanent, SUPERVISOR_SERVICE),
            _ => gate.deny(params.id, SUPERVISOR_SERVICE),
        };
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "failed to answer prompt");
        }
    }
}

async fn call_command(
    config: SupervisorConfig,
    origin: &str,
    args: FunctionCallArgs,
) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut builder = Supervisor::builder(config.clone()).prompt(Arc::new(TerminalPrompt { tx }));
    if let Some(dir) = &config.plugin_dir {
        builder = builder.http(Arc::new(DirectoryClient::new(dir, &config.root_domain)));
    }
    if let Some(path) = &config.storage_path {
        let store = FileKvStore::open(path)
            .with_context(|| format!("failed to open storage {}", path.display()))?;
        builder = builder.storage(Arc::new(store));
    }
    let supervisor = builder.build().context("invalid configuration")?;
    tokio::spawn(answer_prompts(supervisor.clone(), rx));

    match supervisor.function_call(origin, args).await {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            println!("{}", serde_json::to_string_pretty(&e.to_payload())?);
            bail!("call failed: {}", e)
        }
    }
}

fn inspect_command(wasm_file: &Path, json: bool) -> anyhow::Result<()> {
    let bytes = std::fs::read(wasm_file)
        .with_context(|| format!("failed to read {}", wasm_file.display()))?;
    let digest = hex::encode(Sha256::digest(&bytes));
    let module = wasmtime::Module::new(&wasmtime::Engine::default(), &bytes)
        .map_err(|e| anyhow::anyhow!("failed to compile {}: {:#}", wasm_file.display(), e))?;

    let mut imports = Vec::new();
    let mut dependencies = BTreeSet::new();
    for import in module.imports() {
        let class = classify_import(import.module(), import.name(), &import.ty());
        if let Ok(ImportClass::Proxy { target, .. }) = &class {
            dependencies.insert(target.clone());
        }
        imports.push((import.module().to_string(), import.name().to_string(), class));
    }
    let exports = exported_functions(&module);

    if json {
        let imports: Vec<Value> = imports
            .iter()
            .map(|(module, name, class)| match class {
                Ok(class) => json!({"module": module, "name": name, "class": class}),
                Err(e) => json!({"module": module, "name": name, "error": e.to_string()}),
            })
            .collect();
        let report = json!({
            "digest": digest,
            "imports": imports,
            "dependencies": dependencies,
            "exports": exports,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("digest: {}", digest);
    if !imports.is_empty() {
        println!("imports:");
        for (module, name, class) in &imports {
            let described = match class {
                Ok(ImportClass::HostOp { .. }) => "host op".to_string(),
                Ok(ImportClass::Wasi { .. }) => "wasi".to_string(),
                Ok(ImportClass::Proxy { target, intf, method }) => {
                    format!("proxy -> {} {}::{}", target, intf, method)
                }
                Err(e) => format!("unsupported: {}", e),
            };
            println!("  {} {}: {}", module, name, described);
        }
    }
    if !dependencies.is_empty() {
        println!("dependencies:");
        for dep in &dependencies {
            println!("  {}", dep);
        }
    }
    if !exports.is_empty() {
        println!("exports:");
        for export in &exports {
            println!("  {}", export);
        }
    }
    Ok(())
}
