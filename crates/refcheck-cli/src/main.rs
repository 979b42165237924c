use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as Process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use refcheck_api::{Launcher, Reconciler};
use refcheck_core::{ReconcileError, Schema};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "REFCHECK_LOG";
const VIEWER_ENV: &str = "REFCHECK_VIEWER";

#[derive(Debug, Parser)]
#[command(name = "refcheck")]
#[command(about = "Find and remove link records that point at missing entities")]
struct Cli {
    /// YAML record schema; the built-in parameter schema when omitted.
    #[arg(long)]
    schema: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the check report for a document.
    Check(DocumentArgs),
    /// Remove the link records of one or more orphaned owner keys.
    Remove(RemoveArgs),
    /// Remove the link records of every orphaned owner key.
    Purge(DocumentArgs),
    /// Open a document in the system viewer.
    Open(DocumentArgs),
    /// Print the effective record schema.
    Schema,
}

#[derive(Debug, Args)]
struct DocumentArgs {
    document: PathBuf,
}

#[derive(Debug, Args)]
struct RemoveArgs {
    document: PathBuf,
    #[arg(required = true)]
    owner_keys: Vec<String>,
}

/// Hands documents to `xdg-open`, `open`, or `cmd /C start`, unless
/// `REFCHECK_VIEWER` names another program.
struct SystemLauncher {
    viewer: Option<OsString>,
}

impl SystemLauncher {
    fn from_env() -> Self {
        Self { viewer: std::env::var_os(VIEWER_ENV).filter(|viewer| !viewer.is_empty()) }
    }

    fn command(&self) -> Process {
        if let Some(viewer) = &self.viewer {
            return Process::new(viewer);
        }
        if cfg!(target_os = "windows") {
            let mut command = Process::new("cmd");
            command.args(["/C", "start", ""]);
            command
        } else if cfg!(target_os = "macos") {
            Process::new("open")
        } else {
            Process::new("xdg-open")
        }
    }
}

impl Launcher for SystemLauncher {
    fn launch(&self, path: &Path) -> std::io::Result<()> {
        let status = self.command().arg(path).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("viewer exited with {status}")))
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_schema(path: Option<&Path>) -> Result<Schema> {
    let Some(path) = path else {
        return Ok(Schema::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read schema file {}", path.display()))?;
    let schema = Schema::from_yaml_str(&raw)
        .with_context(|| format!("failed to load schema file {}", path.display()))?;
    tracing::debug!("Loaded record schema from {}", path.display());
    Ok(schema)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let schema = load_schema(cli.schema.as_deref())?;

    match cli.command {
        Command::Schema => run_schema(&schema),
        Command::Check(args) => run_check(&open_document(schema, &args.document)?),
        Command::Remove(args) => run_remove(&open_document(schema, &args.document)?, &args),
        Command::Purge(args) => run_purge(&open_document(schema, &args.document)?),
        Command::Open(args) => run_open(&open_document(schema, &args.document)?),
    }
}

fn open_document(schema: Schema, document: &Path) -> Result<Reconciler> {
    let reconciler = Reconciler::new(schema)?;
    reconciler
        .load(document)
        .with_context(|| format!("failed to check {}", document.display()))?;
    Ok(reconciler)
}

fn current_report(reconciler: &Reconciler) -> Result<Value> {
    let report = reconciler.report().context("no document is loaded")?;
    serde_json::to_value(&report).context("failed to serialize check report")
}

fn run_schema(schema: &Schema) -> Result<()> {
    emit_json(serde_json::json!({
        "schema": serde_json::to_value(schema).context("failed to serialize schema")?,
        "yaml": schema.to_yaml_string()?
    }))
}

fn run_check(reconciler: &Reconciler) -> Result<()> {
    emit_json(current_report(reconciler)?)
}

fn run_remove(reconciler: &Reconciler, args: &RemoveArgs) -> Result<()> {
    let mut owner_keys = Vec::with_capacity(args.owner_keys.len());
    for owner_key in &args.owner_keys {
        if !owner_keys.contains(&owner_key.as_str()) {
            owner_keys.push(owner_key.as_str());
        }
    }

    // Every key is checked before the first write.
    let groups = reconciler.groups();
    if !groups.is_empty() {
        let untracked = owner_keys.iter().copied().find(|owner_key| {
            !groups
                .iter()
                .any(|group| group.owner_keys.iter().any(|key| key.as_str() == *owner_key))
        });
        if let Some(owner_key) = untracked {
            return Err(ReconcileError::NotFound(owner_key.to_string())).with_context(|| {
                format!("nothing was removed from {}", args.document.display())
            });
        }
    }

    let mut removals = Vec::with_capacity(owner_keys.len());
    for owner_key in owner_keys {
        let removal = reconciler
            .remove_owner_key(owner_key)
            .with_context(|| format!("failed to remove owner key {owner_key}"))?;
        removals.push(removal);
    }

    emit_json(serde_json::json!({
        "removals": removals,
        "report": current_report(reconciler)?
    }))
}

fn run_purge(reconciler: &Reconciler) -> Result<()> {
    let removal = reconciler.remove_all().context("failed to purge orphan links")?;
    emit_json(serde_json::json!({
        "removals": [removal],
        "report": current_report(reconciler)?
    }))
}

fn run_open(reconciler: &Reconciler) -> Result<()> {
    let launcher = SystemLauncher::from_env();
    let document = reconciler.open_in_viewer(&launcher)?;
    emit_json(serde_json::json!({
        "document": document,
        "launched": true
    }))
}
