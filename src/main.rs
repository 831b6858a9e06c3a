use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use volsync_dr::config::{GroupManifest, VolumeEntry};
use volsync_dr::controller::{Progress, ReplicationHandler};
use volsync_dr::crd::ReplicationState;
use volsync_dr::store::{ClusterClient, KubeStore, MemoryStore, ObjectStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconcile pass over a replication group
    Reconcile(ReconcileArgs),
    /// Print the JSON schema of the group manifest
    Schema,
    /// Show version information
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct ReconcileArgs {
    /// Group manifest (owner, role, engine settings, protected volumes)
    #[arg(long, env = "VOLSYNC_DR_MANIFEST")]
    manifest: PathBuf,

    /// Reconcile against an in-memory store instead of the cluster
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("volsync-dr v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Schema => {
            let schema = schemars::schema_for!(GroupManifest);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::Reconcile(reconcile_args) => run_reconcile(reconcile_args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn run_reconcile(args: ReconcileArgs) -> anyhow::Result<()> {
    init_tracing(args.log_format);

    let manifest = GroupManifest::from_file(&args.manifest)
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;

    let store: Arc<dyn ObjectStore> = if args.dry_run {
        info!("dry run, using an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        let client = kube::Client::try_default()
            .await
            .context("connecting to the cluster")?;
        info!("Connected to Kubernetes cluster");
        Arc::new(KubeStore::new(client))
    };

    let handler = ReplicationHandler::new(
        ClusterClient::new(store),
        manifest.owner.clone(),
        manifest.engine.clone(),
    );

    info!(
        group = %manifest.owner.name,
        namespace = %manifest.owner.namespace,
        role = %manifest.role,
        volumes = manifest.volumes.len(),
        "Starting reconcile pass"
    );

    let mut failed = 0usize;
    let mut pending = 0usize;
    for entry in &manifest.volumes {
        let result = match manifest.role {
            ReplicationState::Secondary => reconcile_secondary(&handler, entry).await,
            ReplicationState::Primary => reconcile_primary(&handler, entry).await,
        };
        match result {
            Ok(true) => {}
            Ok(false) => pending += 1,
            Err(e) if e.is_retryable() => {
                warn!(pvc = %entry.volume.name, error = %e, "volume will be retried");
                pending += 1;
            }
            Err(e) => {
                error!(pvc = %entry.volume.name, error = %e, "volume reconcile failed");
                failed += 1;
            }
        }
    }

    if manifest.role == ReplicationState::Secondary {
        handler
            .cleanup_superseded_destinations(&manifest.protected_volumes(), manifest.role)
            .await?;
    }

    if let Some(status) = handler.workload_status() {
        info!(%status, "workload status");
    }
    info!(pending, failed, "Reconcile pass finished");

    if failed > 0 {
        bail!("{failed} volume(s) failed to reconcile");
    }
    Ok(())
}

/// Returns `Ok(false)` when the volume needs another pass.
async fn reconcile_secondary(
    handler: &ReplicationHandler,
    entry: &VolumeEntry,
) -> volsync_dr::Result<bool> {
    let rd = handler.reconcile_destination(&entry.volume).await?;
    Ok(rd.is_some())
}

async fn reconcile_primary(
    handler: &ReplicationHandler,
    entry: &VolumeEntry,
) -> volsync_dr::Result<bool> {
    let volume = &entry.volume;
    let actions = &entry.actions;

    if actions.restore {
        if let Progress::Waiting(reason) = handler
            .ensure_claim_from_destination(volume, actions.failover_action)
            .await?
        {
            info!(pvc = %volume.name, %reason, "restore not finished");
            return Ok(false);
        }
    }

    if let Progress::Waiting(reason) = handler
        .prepare_claim(
            &volume.name,
            &volume.namespace,
            actions.prep_final_sync,
            actions.run_final_sync,
        )
        .await?
    {
        info!(pvc = %volume.name, %reason, "claim preparation not finished");
        return Ok(false);
    }

    let outcome = handler
        .reconcile_source(volume, actions.run_final_sync)
        .await?;
    if actions.run_final_sync {
        return Ok(outcome.final_sync_complete);
    }
    Ok(outcome.source.is_some())
}
