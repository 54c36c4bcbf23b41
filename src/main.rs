//! csiraid provisioner
//!
//! Runs the provisioning controller against the cluster with the NFS
//! provisioner plug-in.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          csiraid                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Lease     │───▶│  Provision   │───▶│     NFS      │       │
//! │  │   Election   │    │  Controller  │    │  Provisioner │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          health :8081          metrics :8080                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use csiraid::adapters::{KubeClusterApi, KubeLeaseLock, NfsProvisioner};
use csiraid::config::{ControllerConfig, LeaderElectionConfig};
use csiraid::error::{Error, Result};
use csiraid::{ProvisionController, ProvisionMetrics};

// =============================================================================
// CLI Arguments
// =============================================================================

/// csiraid - dynamic PersistentVolume provisioner
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Provisioner name matched against StorageClass.provisioner
    #[arg(long, env = "PROVISIONER_NAME")]
    provisioner_name: String,

    /// Additional provisioner names to answer to (comma separated)
    #[arg(long, env = "ADDITIONAL_PROVISIONER_NAMES", value_delimiter = ',')]
    additional_provisioner_names: Vec<String>,

    /// NFS server exporting the volumes
    #[arg(long, env = "NFS_SERVER")]
    nfs_server: String,

    /// Exported directory under which volumes are created
    #[arg(long, env = "NFS_PATH", default_value = "/exports")]
    nfs_path: String,

    /// Number of claim and volume workers
    #[arg(long, env = "THREADINESS", default_value = "4")]
    threadiness: usize,

    /// Resync period in seconds
    #[arg(long, env = "RESYNC_PERIOD_SECONDS", default_value = "900")]
    resync_period_seconds: u64,

    /// Consecutive provisioning failures before a claim is given up (0 = never)
    #[arg(long, env = "FAILED_PROVISION_THRESHOLD", default_value = "15")]
    failed_provision_threshold: u32,

    /// Consecutive deletion failures before a volume is given up (0 = never)
    #[arg(long, env = "FAILED_DELETE_THRESHOLD", default_value = "15")]
    failed_delete_threshold: u32,

    /// Minimum delay between attempts to save a provisioned volume, in seconds
    #[arg(long, env = "CREATE_PV_INTERVAL_SECONDS", default_value = "10")]
    create_pv_interval_seconds: u64,

    /// Give up saving a provisioned volume after this many attempts
    #[arg(long, env = "MAX_PERSIST_RETRIES")]
    max_persist_retries: Option<u32>,

    /// Enable leader election
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Namespace holding the leader election lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "kube-system")]
    leader_election_namespace: String,

    /// Identity recorded as lease holder (defaults to hostname plus a random suffix)
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,

    /// Lease duration in seconds
    #[arg(long, env = "LEASE_DURATION_SECONDS", default_value = "15")]
    lease_duration_seconds: u64,

    /// Renew deadline in seconds
    #[arg(long, env = "RENEW_DEADLINE_SECONDS", default_value = "10")]
    renew_deadline_seconds: u64,

    /// Retry period in seconds
    #[arg(long, env = "RETRY_PERIOD_SECONDS", default_value = "2")]
    retry_period_seconds: u64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        let leader_election = self.leader_elect.then(|| LeaderElectionConfig {
            lease_duration: Duration::from_secs(self.lease_duration_seconds),
            renew_deadline: Duration::from_secs(self.renew_deadline_seconds),
            retry_period: Duration::from_secs(self.retry_period_seconds),
            ..LeaderElectionConfig::new(
                &self.provisioner_name,
                self.leader_election_namespace.clone(),
                self.identity.clone().unwrap_or_else(default_identity),
            )
        });

        ControllerConfig {
            additional_provisioner_names: self.additional_provisioner_names.clone(),
            resync_period: Duration::from_secs(self.resync_period_seconds),
            threadiness: self.threadiness,
            create_provisioned_pv_interval: Duration::from_secs(self.create_pv_interval_seconds),
            max_persist_retries: self.max_persist_retries,
            failed_provision_threshold: self.failed_provision_threshold,
            failed_delete_threshold: self.failed_delete_threshold,
            leader_election,
            ..ControllerConfig::new(self.provisioner_name.clone())
        }
    }
}

fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "csiraid".to_string());
    format!("{}_{}", host, uuid::Uuid::new_v4())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.controller_config();

    info!("Starting csiraid provisioner");
    info!("  Provisioner: {}", config.provisioner_name);
    info!("  NFS export: {}:{}", args.nfs_server, args.nfs_path);
    info!("  Threadiness: {}", config.threadiness);
    info!("  Leader election: {}", args.leader_elect);

    // Create Kubernetes client
    let client = Client::try_default().await.map_err(|e| {
        error!("Failed to create Kubernetes client: {}", e);
        Error::Internal(format!("Kubernetes client creation failed: {}", e))
    })?;

    info!("Connected to Kubernetes cluster");

    let api = Arc::new(KubeClusterApi::new(client.clone()));
    let provisioner = Arc::new(NfsProvisioner::new(&args.nfs_server, &args.nfs_path));
    let metrics = ProvisionMetrics::new(csiraid::metrics::DEFAULT_SUBSYSTEM)?;

    let mut builder =
        ProvisionController::builder(config.clone(), api, provisioner).metrics(metrics.clone());
    if let Some(le) = &config.leader_election {
        builder = builder.lease_lock(Arc::new(KubeLeaseLock::new(
            client,
            le.namespace.clone(),
            le.lease_name.clone(),
        )));
    }
    let controller = builder.build()?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    controller.run(shutdown).await?;

    info!("Provisioner shutdown complete");
    Ok(())
}

async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    token.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Servers
// =============================================================================

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn serve<F>(addr: &str, name: &'static str, handler: F) -> Result<()>
where
    F: Fn(Request<hyper::body::Incoming>) -> Response<Full<Bytes>> + Clone + Send + Sync + 'static,
{
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {} server address: {}", name, e)))?;

    let listener = TcpListener::bind(addr).await?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = handler(req);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}

async fn run_health_server(addr: &str) -> Result<()> {
    serve(addr, "Health", |req| match req.uri().path() {
        "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    })
    .await
}

async fn run_metrics_server(addr: &str, metrics: ProvisionMetrics) -> Result<()> {
    serve(addr, "Metrics", move |req| match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(text) => {
                let mut response = respond(StatusCode::OK, text);
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    })
    .await
}
