use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use rekon_controller::{Controller, ControllerConfig, NoopDeleter};
use rekon_kubehub::{Informer, KubeClient};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "rekonctl", version, about = "Rekon reconciliation controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "REKON_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// Reconcile every object of a kind until interrupted
    Run {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Number of sync workers
        #[arg(long = "workers", env = "REKON_WORKERS")]
        workers: Option<usize>,
        /// Resync interval in seconds; new objects are first synced on resync
        #[arg(long = "resync-secs", env = "REKON_RESYNC_SECS", value_parser = clap::value_parser!(u64).range(1..))]
        resync_secs: Option<u64>,
        /// Delay before a deletion is synced
        #[arg(long = "grace-secs", env = "REKON_GRACE_SECS")]
        grace_secs: Option<u64>,
        /// Top-level field carrying desired state; repeatable
        #[arg(long = "spec-field")]
        spec_fields: Vec<String>,
        /// Finalizer guarding teardown
        #[arg(long = "finalizer", env = "REKON_FINALIZER")]
        finalizer: Option<String>,
        /// Record status.observedGeneration after each successful sync
        #[arg(long = "observed-generation", action = ArgAction::SetTrue)]
        observed_generation: bool,
        /// Only watch objects matching this label selector
        #[arg(short = 'l', long = "selector", env = "REKON_LABEL_SELECTOR")]
        selector: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("REKON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid REKON_METRICS_ADDR; expected host:port");
        }
    }
}

async fn discover(output: Output) -> Result<()> {
    let client = kube::Client::try_default().await.context("building kube client")?;
    let resources = rekon_kubehub::discover(client).await?;
    match output {
        Output::Human => {
            for r in resources {
                let scope = if r.namespaced { "namespaced" } else { "cluster" };
                println!("{} • {}", r.gvk_key(), scope);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
    }
    Ok(())
}

async fn run(gvk: String, namespace: Option<String>, config: ControllerConfig) -> Result<()> {
    let client = kube::Client::try_default().await.context("building kube client")?;
    let kube_client = KubeClient::for_gvk(client, &gvk).await?;
    if namespace.is_some() && !kube_client.is_namespaced() {
        warn!(gvk = %gvk, "kind is cluster-scoped; ignoring --ns");
    }
    info!(gvk = %gvk, ns = ?namespace, workers = config.workers, resync = ?config.resync, "run invoked");

    let mut informer = Informer::new(kube_client.api(namespace.as_deref()), config.informer_config());
    let workers = config.workers;
    let controller = Controller::new(Arc::new(kube_client), &mut informer, Arc::new(NoopDeleter), config);

    let shutdown = CancellationToken::new();
    let informer_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = informer.run(shutdown.clone()).await {
                error!(error = ?e, "informer failed");
            }
            // Workers must not outlive the cache they read from.
            shutdown.cancel();
        }
    });
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received; shutting down"),
                Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
            }
            shutdown.cancel();
        }
    });

    let res = controller.run(workers, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = informer_handle.await {
        warn!(error = %e, "informer task ended abnormally");
    }
    res.map_err(Into::into)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            if let Err(e) = discover(cli.output).await {
                error!(error = ?e, "discover failed");
                eprintln!("discover error: {:#}", e);
            }
        }
        Commands::Run { gvk, workers, resync_secs, grace_secs, spec_fields, finalizer, observed_generation, selector } => {
            let mut config = ControllerConfig::from_env();
            config.name = format!("rekon-{}", gvk.rsplit('/').next().unwrap_or("controller").to_ascii_lowercase());
            if let Some(w) = workers.filter(|w| *w > 0) { config.workers = w; }
            if let Some(s) = resync_secs { config.resync = Duration::from_secs(s); }
            if let Some(s) = grace_secs { config.grace_period = Duration::from_secs(s); }
            if !spec_fields.is_empty() { config.spec_fields = spec_fields; }
            if finalizer.is_some() { config.finalizer = finalizer; }
            if observed_generation { config.observed_generation = true; }
            if selector.is_some() { config.label_selector = selector; }
            run(gvk, cli.namespace, config).await?;
        }
    }
    Ok(())
}
