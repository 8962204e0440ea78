use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tether_api::{Desired, Orchestrator, Outcome, Tracked};
use tether_core::{DynamicManifest, ProviderConfig, ResourceIdentity, ResourceKind, SyncOptions, Timeout, WaitSpec};
use tether_kubehub::{KubeClient, MockCluster, ResourceClient};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Server-side apply sync for namespaced Kubernetes objects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Field manager name (default "tether")
    #[arg(long = "field-manager", env = "TETHER_FIELD_MANAGER", global = true)]
    field_manager: Option<String>,

    /// Take ownership of fields managed by others instead of failing
    #[arg(long = "force-conflicts", action = ArgAction::SetTrue, global = true)]
    force_conflicts: bool,

    /// Never contact the API server
    #[arg(long = "offline", action = ArgAction::SetTrue, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(clap::Args, Debug)]
struct ApplyArgs {
    /// YAML manifest with apiVersion, kind and metadata.name
    #[arg(short = 'f', long = "file")]
    file: String,
    /// Namespace override for the manifest
    #[arg(long = "ns")]
    namespace: Option<String>,
    /// Wait condition, `PATH` (any non-empty value) or `PATH=VALUE`; repeatable
    #[arg(long = "wait")]
    wait: Vec<String>,
    /// Timeout per wait condition: `0` checks once, negative waits up to a week
    #[arg(long = "timeout", default_value = "30s", value_parser = parse_timeout, allow_hyphen_values = true)]
    timeout: Timeout,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a manifest as a new object
    Create(ApplyArgs),
    /// Apply a manifest over an existing object
    Update(ApplyArgs),
    /// Show the live object
    Read {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        /// Object id, "<namespace>/<name>"
        id: String,
    },
    /// Delete an object (absent objects are fine)
    Delete {
        gvk: String,
        id: String,
    },
    /// Adopt an existing object and print the state that would be tracked
    Import {
        gvk: String,
        id: String,
    },
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_timeout(s: &str) -> Result<Timeout, String> { Timeout::parse(s).map_err(|e| e.to_string()) }

/// Split `PATH=VALUE` on the last `=` outside brackets, so filters such as
/// `[?(@.type=="Ready")]` stay inside the path.
fn split_wait_arg(arg: &str) -> (String, Option<String>) {
    let mut depth = 0i32;
    let mut split_at = None;
    for (i, c) in arg.char_indices() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            '=' if depth == 0 => split_at = Some(i),
            _ => {}
        }
    }
    match split_at {
        Some(i) => (arg[..i].to_string(), Some(arg[i + 1..].to_string())),
        None => (arg.to_string(), None),
    }
}

fn wait_specs(args: &ApplyArgs) -> Vec<WaitSpec> {
    args.wait
        .iter()
        .map(|w| {
            let (path, value) = split_wait_arg(w);
            WaitSpec { path, value, timeout: args.timeout }
        })
        .collect()
}

fn provider_config(cli: &Cli) -> ProviderConfig {
    let mut cfg = ProviderConfig::from_env();
    if let Some(m) = cli.field_manager.as_deref().filter(|m| !m.trim().is_empty()) {
        cfg.field_manager = m.trim().to_string();
    }
    if cli.force_conflicts { cfg.force_conflicts = true; }
    if cli.offline { cfg.offline = true; }
    cfg
}

/// Resolve the kind and a client. Offline runs get a kind built from the
/// key alone and a client the orchestrator never calls.
async fn connect(gvk: &str, cfg: &ProviderConfig) -> Result<(ResourceKind, Arc<dyn ResourceClient>)> {
    if cfg.offline {
        let (group, version, kind) = tether_core::parse_gvk_key(gvk).ok_or_else(|| anyhow!("invalid gvk key: {}", gvk))?;
        let plural = format!("{}s", kind.to_lowercase());
        return Ok((ResourceKind::new(&group, &version, &kind, &plural), Arc::new(MockCluster::new())));
    }
    let client = tether_kubehub::get_kube_client().await?;
    let kind = tether_kubehub::discover_kind(client.clone(), gvk).await?;
    info!(gvk = %gvk, plural = %kind.plural, "resolved kind");
    Ok((kind, Arc::new(KubeClient::new(client))))
}

/// Tracked state for an object known only by id.
fn tracked_by_id(kind: &ResourceKind, id: &str) -> Result<Tracked<DynamicManifest>> {
    let identity = ResourceIdentity::parse_import(kind, id)?;
    Ok(Tracked {
        id: identity.composite_id(),
        manifest: DynamicManifest::new(&identity.namespace, &identity.name),
        document: json!({ "metadata": { "name": identity.name, "namespace": identity.namespace } }),
        applied: json!({ "metadata": { "name": identity.name, "namespace": identity.namespace } }),
        identity,
        options: SyncOptions::default(),
    })
}

fn report<T>(out: &Outcome<T>, output: Output, print: impl Fn(&T) -> Result<()>) -> Result<()> {
    if let Some(v) = out.value.as_ref() {
        print(v)?;
    }
    match output {
        Output::Human => {
            for d in out.diagnostics.iter() {
                eprintln!("{}", d);
            }
        }
        Output::Json => {
            if !out.diagnostics.is_empty() {
                eprintln!("{}", serde_json::to_string_pretty(&out.diagnostics)?);
            }
        }
    }
    match out.error() {
        Some(e) => Err(anyhow!("{}", e)),
        None => Ok(()),
    }
}

fn print_tracked(output: Output) -> impl Fn(&Tracked<DynamicManifest>) -> Result<()> {
    move |t| {
        match output {
            Output::Human => {
                println!(
                    "{} • rv {} • generation {}",
                    t.id,
                    t.resource_version().unwrap_or("-"),
                    t.generation().map(|g| g.to_string()).unwrap_or_else(|| "-".into())
                );
                if let Some(status) = t.document.get("status") {
                    println!("status: {}", serde_json::to_string(status)?);
                }
            }
            Output::Json => println!("{}", serde_json::to_string_pretty(&t.document)?),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = provider_config(&cli);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; canceling");
                cancel.cancel();
            }
        }
    });

    match &cli.command {
        Commands::Create(args) | Commands::Update(args) => {
            let yaml = std::fs::read_to_string(&args.file).with_context(|| format!("reading {}", args.file))?;
            let (gvk, manifest) = tether_apply::manifest_from_yaml(&yaml, args.namespace.as_deref())?;
            let (kind, client) = connect(&gvk, &cfg).await?;
            let orch: Orchestrator<DynamicManifest> = Orchestrator::new(kind, client, cfg);
            let desired = Desired::new(manifest).with_options(SyncOptions { wait_for: wait_specs(args), ..Default::default() });
            let out = if matches!(cli.command, Commands::Create(_)) {
                orch.create(desired, &cancel).await
            } else {
                let id = format!("{}/{}", desired.manifest.metadata.namespace, desired.manifest.metadata.name);
                let prior = orch.import(&id, &cancel).await;
                let Some(current) = prior.value.as_ref() else {
                    return report(&prior, cli.output, |_| Ok(()));
                };
                orch.update(current, desired, &cancel).await
            };
            report(&out, cli.output, print_tracked(cli.output))
        }
        Commands::Read { gvk, id } => {
            let (kind, client) = connect(gvk, &cfg).await?;
            let tracked = tracked_by_id(&kind, id)?;
            let orch: Orchestrator<DynamicManifest> = Orchestrator::new(kind, client, cfg);
            let out = orch.read(&tracked, &cancel).await;
            if out.value.is_none() && out.diagnostics.is_empty() {
                return Err(anyhow!("{} {} not found", gvk, id));
            }
            report(&out, cli.output, print_tracked(cli.output))
        }
        Commands::Delete { gvk, id } => {
            let (kind, client) = connect(gvk, &cfg).await?;
            let tracked = tracked_by_id(&kind, id)?;
            let orch: Orchestrator<DynamicManifest> = Orchestrator::new(kind, client, cfg);
            let out = orch.delete(&tracked, &cancel).await;
            report(&out, cli.output, |_| {
                if cli.output == Output::Human { println!("{} deleted", tracked.id); }
                Ok(())
            })
        }
        Commands::Import { gvk, id } => {
            let (kind, client) = connect(gvk, &cfg).await?;
            let orch: Orchestrator<DynamicManifest> = Orchestrator::new(kind, client, cfg);
            let out = orch.import(id, &cancel).await;
            report(&out, cli.output, print_tracked(cli.output))
        }
    }
}
