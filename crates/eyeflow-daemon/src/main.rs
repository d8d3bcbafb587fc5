// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use ed25519_dalek::SigningKey;
use eyeflow_audit::AuditChain;
use eyeflow_audit_export::AuditExporter;
use eyeflow_buffer::OfflineBuffer;
use eyeflow_cancel::CancellationBus;
use eyeflow_cdc::CdcProcessor;
use eyeflow_daemon::broker::LoggingBroker;
use eyeflow_daemon::invokers::{LocalServiceInvoker, LoggingActionInvoker};
use eyeflow_daemon::keys::resolve_signing_key;
use eyeflow_daemon::{build_app, AppState};
use eyeflow_lifecycle::LifecycleRegistry;
use eyeflow_manifest::ServiceManifest;
use eyeflow_orchestrator::Orchestrator;
use eyeflow_preload::{FetcherTable, Preloader};
use eyeflow_triggers::TriggerBus;
use eyeflow_vault::Vault;
use eyeflow_vm::Vm;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// One EyeFlow node: service manifest, vault, cancellation bus, offline
/// buffer, audit chain, trigger bus, CDC processor, and orchestrator,
/// wired together and exposed over a minimal HTTP readiness surface.
#[derive(Parser, Debug)]
#[command(name = "eyeflow-daemon", version, about = "EyeFlow compilation + execution kernel node")]
struct Args {
    /// TOML configuration file (`eyeflow.toml`'s shape). Falls back to
    /// built-in defaults plus environment overrides when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address for the `/healthz` and `/status` HTTP surface.
    #[arg(long, default_value = "127.0.0.1:8090")]
    bind: String,

    /// Enable verbose request-path logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("eyeflow=debug")
    } else {
        EnvFilter::new("eyeflow=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = eyeflow_config::load_config(args.config.as_deref())
        .context("load eyeflow configuration")?;
    for warning in eyeflow_config::validate_config(&config).context("validate eyeflow configuration")? {
        tracing::warn!(%warning, "configuration warning");
    }

    let signing_key: SigningKey = resolve_signing_key(config.signing.private_key_pem.as_deref())
        .context("resolve node signing key")?;

    let vault = Arc::new(Vault::new());

    let cancellation = Arc::new(if config.cancellation_bus_disabled {
        tracing::warn!("cancellation bus disabled by configuration; cancel requests will never take effect");
        CancellationBus::degraded()
    } else {
        CancellationBus::new()
    });

    let offline_buffer = Arc::new(
        OfflineBuffer::open(config.offline_buffer.path.clone())
            .with_context(|| format!("open offline buffer at {}", config.offline_buffer.path))?
            .with_max_queue_size(config.offline_buffer.max_queue_size)
            .with_retry_interval(Duration::from_secs(config.offline_buffer.retry_interval_secs)),
    );

    let audit = Arc::new(
        AuditChain::new(config.node_id.clone(), signing_key.clone())
            .with_offline_buffer(offline_buffer.clone()),
    );

    if config.kafka.enabled {
        let exporter = Arc::new(AuditExporter::new(
            Box::new(LoggingBroker),
            config.kafka.audit_topic.clone(),
            config.node_id.clone(),
            offline_buffer.clone(),
        ));
        if let Err(err) = exporter.try_reconnect().await {
            tracing::warn!(error = %err, "audit exporter failed its initial connect, starting offline");
        }
        audit.register_export_handler(exporter);
    } else {
        tracing::info!("kafka export disabled by configuration; audit events stay local to this node");
    }

    let manifest = Arc::new(ServiceManifest::new());
    let lifecycle = Arc::new(LifecycleRegistry::new());
    let triggers = Arc::new(TriggerBus::new(256));
    let cdc = Arc::new(CdcProcessor::new());

    let preloader = Arc::new(Preloader::new(
        signing_key,
        config.node_id.clone(),
        FetcherTable::new(),
    ));

    let vm = Arc::new(
        Vm::new(
            vault.clone(),
            cancellation.clone(),
            Arc::new(LocalServiceInvoker),
            Arc::new(LoggingActionInvoker),
        )
        .with_scratch_buffer_bytes(config.vm.scratch_buffer_bytes),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        vm,
        preloader,
        audit.clone(),
        cancellation.clone(),
        lifecycle.clone(),
    ));

    let triggers_for_run = triggers.clone();
    tokio::spawn(async move {
        triggers_for_run.run().await;
    });

    let state = AppState {
        node_id: config.node_id.clone(),
        manifest,
        vault,
        cancellation,
        offline_buffer,
        audit,
        triggers,
        cdc,
        lifecycle,
        orchestrator,
    };

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, node_id = %config.node_id, "eyeflow-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
