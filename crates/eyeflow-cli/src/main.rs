// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use eyeflow_audit::{verify_chain, AuditEvent};
use eyeflow_cancel::CancellationBus;
use eyeflow_cli::fetchers::default_fetcher_table;
use eyeflow_cli::invokers::{LocalServiceInvoker, LoggingActionInvoker};
use eyeflow_cli::keys::resolve_signing_key;
use eyeflow_cli::scenario::{self, Operation};
use eyeflow_core::{ExecutionId, TrustLevel, UserId};
use eyeflow_ir::{CompiledWorkflow, IrProgram};
use eyeflow_manifest::{ServiceManifest, ServiceManifestEntry, TrustPolicy};
use eyeflow_preload::Preloader;
use eyeflow_rulec::{ConnectorDefinition, ConnectorRegistry, Rule, RuleCompiler};
use eyeflow_vault::Vault;
use eyeflow_vm::Vm;
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors (usage errors exit 2 via clap).
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "eyeflow", version, about = "EyeFlow compilation + execution kernel CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a rule against a connector registry and allowed sets (C14).
    Compile {
        /// Path to a JSON-encoded `Rule`.
        #[arg(long)]
        rule: PathBuf,
        /// Path to a JSON-encoded array of `ConnectorDefinition`.
        #[arg(long)]
        connectors: PathBuf,
        /// Path to a JSON-encoded `AllowedSets`; omit to allow everything
        /// the rule references.
        #[arg(long)]
        allowed: Option<PathBuf>,
    },

    /// Resolve and seal an IR program into a signed compiled workflow
    /// (C1 + C2).
    Seal {
        /// Path to a JSON-encoded array of `ServiceManifestEntry`.
        #[arg(long)]
        manifest: PathBuf,
        /// Path to a JSON-encoded `IrProgram`.
        #[arg(long)]
        program: PathBuf,
        /// Workflow name to stamp onto the sealed artifact.
        #[arg(long)]
        name: String,
        /// Minimum trust level the manifest resolution accepts.
        #[arg(long, value_enum, default_value_t = TrustArg::Low)]
        trust: TrustArg,
        /// PEM-encoded Ed25519 private key; generates an ephemeral one if
        /// omitted.
        #[arg(long)]
        key_pem: Option<PathBuf>,
        /// Key id to stamp as `signatureKeyId`.
        #[arg(long, default_value = "cli-node")]
        key_id: String,
        /// Where to write the sealed workflow JSON (stdout if omitted).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Execute a sealed compiled workflow against an input register value
    /// (C11).
    Execute {
        /// Path to a JSON-encoded `CompiledWorkflow` (as produced by
        /// `seal`).
        #[arg(long)]
        workflow: PathBuf,
        /// Path to a JSON-encoded input value for the program's input
        /// register; defaults to `null`.
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Verify a tamper-evident audit chain (C6).
    Verify {
        /// Path to a JSON-encoded array of `AuditEvent`.
        #[arg(long)]
        events: PathBuf,
    },

    /// Run a scripted project/version lifecycle scenario (C12).
    Lifecycle {
        /// Path to a JSON-encoded array of `Operation`.
        #[arg(long)]
        scenario: PathBuf,
        /// Name of the project the scenario creates.
        #[arg(long, default_value = "cli-project")]
        project_name: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TrustArg {
    Low,
    Medium,
    High,
}

impl From<TrustArg> for TrustLevel {
    fn from(v: TrustArg) -> Self {
        match v {
            TrustArg::Low => TrustLevel::Low,
            TrustArg::Medium => TrustLevel::Medium,
            TrustArg::High => TrustLevel::High,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("eyeflow=debug")
    } else {
        EnvFilter::new("eyeflow=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Compile {
            rule,
            connectors,
            allowed,
        } => cmd_compile(&rule, &connectors, allowed.as_deref()),
        Commands::Seal {
            manifest,
            program,
            name,
            trust,
            key_pem,
            key_id,
            out,
        } => cmd_seal(&manifest, &program, &name, trust.into(), key_pem.as_deref(), &key_id, out.as_deref()).await,
        Commands::Execute { workflow, input } => cmd_execute(&workflow, input.as_deref()).await,
        Commands::Verify { events } => cmd_verify(&events),
        Commands::Lifecycle {
            scenario,
            project_name,
        } => cmd_lifecycle(&scenario, &project_name),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parse JSON from {}", path.display()))
}

fn cmd_compile(rule_path: &Path, connectors_path: &Path, allowed_path: Option<&Path>) -> Result<()> {
    let rule: Rule = read_json(rule_path)?;
    let connector_defs: Vec<ConnectorDefinition> = read_json(connectors_path)?;
    let mut registry = ConnectorRegistry::new();
    for def in connector_defs {
        registry.register(def);
    }

    let allowed = match allowed_path {
        Some(p) => read_json(p)?,
        None => eyeflow_lifecycle::AllowedSets {
            connector_ids: vec![rule.trigger.source_connector.clone()]
                .into_iter()
                .chain(rule.actions.iter().map(|a| a.connector.clone()))
                .collect(),
            function_ids: rule.actions.iter().map(|a| a.function.clone()).collect(),
            trigger_types: vec![rule.trigger.trigger_type.clone()],
            node_ids: vec![],
        },
    };

    let compiler = RuleCompiler::new(registry);
    let report = compiler.compile(&rule, &allowed);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_valid {
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
    Ok(())
}

async fn cmd_seal(
    manifest_path: &Path,
    program_path: &Path,
    name: &str,
    minimum_trust: TrustLevel,
    key_pem_path: Option<&Path>,
    key_id: &str,
    out: Option<&Path>,
) -> Result<()> {
    let entries: Vec<ServiceManifestEntry> = read_json(manifest_path)?;
    let mut manifest = ServiceManifest::new();
    for entry in entries {
        manifest.register(entry).context("register manifest entry")?;
    }

    let mut program: IrProgram = read_json(program_path)?;
    program.validate().context("program fails its own invariants")?;

    let policy = TrustPolicy { minimum_trust };
    let resolved = manifest
        .resolve(&mut program, &policy)
        .context("resolve CALL_SERVICE instructions")?;

    let key_pem = match key_pem_path {
        Some(p) => Some(std::fs::read_to_string(p).with_context(|| format!("read {}", p.display()))?),
        None => None,
    };
    let signing_key = resolve_signing_key(key_pem.as_deref())?;

    let preloader = Preloader::new(signing_key, key_id.to_string(), default_fetcher_table());
    let workflow = preloader
        .seal(UserId::new(), name.to_string(), program, &resolved)
        .await
        .context("seal compiled workflow")?;

    let rendered = serde_json::to_string_pretty(&workflow)?;
    match out {
        Some(p) => std::fs::write(p, rendered).with_context(|| format!("write {}", p.display()))?,
        None => println!("{rendered}"),
    }
    Ok(())
}

async fn cmd_execute(workflow_path: &Path, input_path: Option<&Path>) -> Result<()> {
    let workflow: CompiledWorkflow = read_json(workflow_path)?;
    let input: serde_json::Value = match input_path {
        Some(p) => read_json(p)?,
        None => serde_json::Value::Null,
    };

    let vault = Arc::new(Vault::new());
    let cancellation = Arc::new(CancellationBus::new());
    let vm = Vm::new(
        vault,
        cancellation,
        Arc::new(LocalServiceInvoker),
        Arc::new(LoggingActionInvoker),
    );

    let outcome = vm
        .execute(&workflow, ExecutionId::new(), input)
        .await
        .context("execute compiled workflow")?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn cmd_verify(events_path: &Path) -> Result<()> {
    let events: Vec<AuditEvent> = read_json(events_path)?;
    let result = verify_chain(&events);
    println!(
        "valid: {}\nchecked: {}\nfirst_broken_at: {:?}\nerror: {:?}",
        result.valid, result.checked_count, result.first_broken_at, result.error
    );
    if !result.valid {
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
    Ok(())
}

fn cmd_lifecycle(scenario_path: &Path, project_name: &str) -> Result<()> {
    let ops: Vec<Operation> = read_json(scenario_path)?;
    let result = scenario::run_scenario(project_name, ops)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
