use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use helmop_controller::{ControllerConfig, Metrics};
use helmop_core::{HelmRelease, HelmRepository};
use helmop_engine::{HelmCli, HelmCliConfig};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "helmop", version, about = "Reconciles HelmRepository and HelmRelease resources with helm")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run(RunArgs),
    /// Print the CustomResourceDefinitions as YAML
    Crds,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Workers per resource kind
    #[arg(long, env = "HELMOP_WORKERS", default_value_t = 4)]
    workers: usize,
    /// Watch only this namespace (default: all namespaces)
    #[arg(long = "ns", env = "HELMOP_NAMESPACE")]
    namespace: Option<String>,
    /// helm executable
    #[arg(long, env = "HELMOP_HELM_BINARY", default_value = "helm")]
    helm_binary: PathBuf,
    /// Override HELM_REPOSITORY_CONFIG for the helm child processes
    #[arg(long, env = "HELMOP_HELM_REPOSITORY_CONFIG")]
    helm_repository_config: Option<PathBuf>,
    /// Override HELM_REPOSITORY_CACHE for the helm child processes
    #[arg(long, env = "HELMOP_HELM_REPOSITORY_CACHE")]
    helm_repository_cache: Option<PathBuf>,
    /// Scratch directory for TLS material read from secrets
    #[arg(long, env = "HELMOP_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Attempts per status write before a reconcile fails
    #[arg(long, env = "HELMOP_CONFLICT_RETRIES", default_value_t = 5)]
    conflict_retries: u32,
    /// Reporting controller name on events
    #[arg(long, env = "HELMOP_CONTROLLER_NAME", default_value = "helm-operator")]
    controller_name: String,
}

fn init_tracing() {
    let env = std::env::var("HELMOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HELMOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid HELMOP_METRICS_ADDR; expected host:port");
        }
    }
}

fn crds_yaml() -> Result<String> {
    let repo = serde_yaml::to_string(&HelmRepository::crd()).context("rendering HelmRepository CRD")?;
    let release = serde_yaml::to_string(&HelmRelease::crd()).context("rendering HelmRelease CRD")?;
    Ok(format!("{}---\n{}", repo, release))
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("signal received");
        token.cancel();
    });
}

async fn run(args: RunArgs) -> Result<()> {
    init_metrics();
    let client = kube::Client::try_default().await.context("connecting to the cluster")?;
    let mut helm = HelmCliConfig {
        binary: args.helm_binary,
        repository_config: args.helm_repository_config,
        repository_cache: args.helm_repository_cache,
        ..Default::default()
    };
    if let Some(dir) = args.data_dir {
        helm.data_dir = dir;
    }
    info!(helm = %helm.binary.display(), data_dir = %helm.data_dir.display(), "helm engine configured");
    let engine = Arc::new(HelmCli::new(helm));
    let cfg = ControllerConfig {
        workers: args.workers,
        namespace: args.namespace,
        conflict_attempts: args.conflict_retries,
        controller_name: args.controller_name,
    };
    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());
    helmop_controller::run(client, engine, cfg, Arc::new(Metrics::new()), token).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Crds => {
            print!("{}", crds_yaml()?);
            Ok(())
        }
    }
}
