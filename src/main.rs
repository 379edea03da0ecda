use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, StoreKind};
use gatekeeper::mesh::{Cluster, GossipStore};
use gatekeeper::notify::TracingNotifier;
use gatekeeper::request::{MatchRecord, ThrottleData};
use gatekeeper::rules::RuleFile;
use gatekeeper::store::{Cache, CounterBackend, MemoryStore};
use gatekeeper::{Gatekeeper, Outcome, Registry, Request, Verdict};

/// Replay newline-delimited JSON requests through the admission engine.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version, about, long_about = None)]
struct Cli {
    /// Engine and store configuration (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rule file (YAML); overrides `rules_path` from the configuration
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// One input line.
#[derive(Debug, Deserialize)]
struct RequestLine {
    #[serde(default)]
    remote_addr: Option<String>,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default = "default_path")]
    path: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Status the simulated handler answers with
    #[serde(default = "default_status")]
    status: u16,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_status() -> u16 {
    200
}

impl From<RequestLine> for Request {
    fn from(line: RequestLine) -> Self {
        let mut req = Request::new(line.method, line.path);
        if let Some(addr) = line.remote_addr {
            req = req.with_remote_addr(addr);
        }
        for (name, value) in line.headers {
            req = req.with_header(&name, value);
        }
        req
    }
}

/// One output line.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ReplayLine {
    Decided {
        verdict: Verdict,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        matched: Option<MatchRecord>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        failed_throttle_data: BTreeMap<String, ThrottleData>,
    },
    Failed {
        error: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => GatekeeperConfig::from_file(path)?,
        None => GatekeeperConfig::default(),
    };

    let registry = Arc::new(Registry::with_policy(config.engine.duplicate_policy));
    if let Some(path) = cli.rules.as_ref().or(config.rules_path.as_ref()) {
        RuleFile::from_file(path)?.apply(&registry)?;
    }

    let mut cluster: Option<Arc<Cluster>> = None;
    let backend: Arc<dyn CounterBackend> = match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Gossip => {
            let store = GossipStore::start(config.store.cluster_config()).await?;
            cluster = Some(store.cluster().clone());
            Arc::new(store)
        }
    };
    info!(store = ?config.store.kind, capability = ?backend.capability(), "Counter store ready");

    let cache = Cache::new(backend)
        .with_prefix(config.engine.key_prefix.clone())
        .with_timeout(config.engine.store_timeout());
    let gatekeeper = Gatekeeper::new(registry, Arc::new(cache)).with_notifier(Arc::new(TracingNotifier));

    tokio::select! {
        result = replay(&gatekeeper) => result?,
        _ = shutdown_signal() => {}
    }

    drop(gatekeeper);
    if let Some(cluster) = cluster {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => warn!("Cluster still in use, skipping graceful shutdown"),
        }
    }

    info!("Gatekeeper stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Run every stdin line through the engine until EOF.
async fn replay(gatekeeper: &Gatekeeper) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let result = match serde_json::from_str::<RequestLine>(&line) {
            Ok(parsed) => handle(gatekeeper, parsed).await,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request line");
                ReplayLine::Failed {
                    error: format!("malformed request: {}", e),
                }
            }
        };

        let mut out = serde_json::to_vec(&result)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    info!("Input exhausted");
    Ok(())
}

async fn handle(gatekeeper: &Gatekeeper, line: RequestLine) -> ReplayLine {
    let status = line.status;
    let mut req = Request::from(line);

    let outcome = gatekeeper.call(&mut req, |_req| async move { status }).await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "Request evaluation failed");
            return ReplayLine::Failed { error: e.to_string() };
        }
    };

    let verdict = outcome.verdict();
    let annotations = req.annotations().clone();
    let retry_after = match verdict {
        Verdict::Throttled => annotations
            .matched
            .as_ref()
            .and_then(|m| m.data)
            .map(|data| data.retry_after()),
        _ => None,
    };
    let status = match outcome {
        Outcome::Handled(_, status) => Some(status),
        Outcome::Blocked(_) => None,
    };

    ReplayLine::Decided {
        verdict,
        status,
        retry_after,
        matched: annotations.matched,
        failed_throttle_data: annotations.failed_throttle_data,
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
