use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use callgate::config::{CallgateConfig, LoggingConfig};
use callgate::gate::{Action, AdmissionGate, ReleasePolicy};
use callgate::GateError;

/// Drive simulated outbound calls through an admission gate.
#[derive(Parser, Debug)]
#[command(name = "callgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum admissions per window (overrides the config file)
    #[arg(long, allow_hyphen_values = true)]
    limit: Option<i64>,

    /// Window length in milliseconds (overrides the config file)
    #[arg(long)]
    window_ms: Option<u64>,

    /// Release policy: on_completion or at_window_end
    #[arg(long)]
    release: Option<ReleasePolicy>,

    /// Number of concurrent calls to issue
    #[arg(long, default_value_t = 20)]
    calls: usize,

    /// How long each simulated call takes, in milliseconds
    #[arg(long, default_value_t = 50)]
    action_ms: u64,

    /// Make every Nth call fail
    #[arg(long)]
    fail_every: Option<usize>,

    /// Log level filter (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("simulated downstream failure for call {0}")]
struct SimulatedFailure(usize);

/// Stand-in for a request to the downstream service.
struct SimulatedCall {
    id: usize,
    latency: Duration,
    fail: bool,
}

#[async_trait]
impl Action for SimulatedCall {
    type Output = Duration;
    type Error = SimulatedFailure;

    async fn invoke(&self) -> Result<Duration, SimulatedFailure> {
        let started = Instant::now();
        tokio::time::sleep(self.latency).await;
        if self.fail {
            return Err(SimulatedFailure(self.id));
        }
        Ok(started.elapsed())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CallgateConfig::from_file(path)?,
        None => CallgateConfig::default(),
    };
    apply_overrides(&mut config, &cli);

    init_tracing(&config.logging);

    info!("Starting Callgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limits = config.gate.to_rate_limit_config()?;
    info!(
        limit = limits.limit(),
        window_ms = limits.window().as_millis() as u64,
        release = %limits.release(),
        "Configuration loaded"
    );

    let gate = Arc::new(AdmissionGate::with_config(limits)?);
    let started = Instant::now();

    let handles = (1..=cli.calls).map(|id| {
        let gate = Arc::clone(&gate);
        let call = SimulatedCall {
            id,
            latency: Duration::from_millis(cli.action_ms),
            fail: cli.fail_every.is_some_and(|n| n > 0 && id % n == 0),
        };
        tokio::spawn(async move {
            let outcome = gate.run(&call).await;
            (id, outcome)
        })
    });

    let all = futures::future::join_all(handles);
    tokio::pin!(all);

    // On a signal, close the gate so waiting calls fail fast, then collect
    // whatever is still running.
    let results = tokio::select! {
        results = &mut all => results,
        _ = shutdown_signal() => {
            gate.shutdown();
            all.await
        }
    };

    let (mut succeeded, mut failed, mut refused) = (0usize, 0usize, 0usize);
    for joined in results {
        match joined {
            Ok((id, Ok(took))) => {
                succeeded += 1;
                info!(call = id, took_ms = took.as_millis() as u64, "Call completed");
            }
            Ok((id, Err(GateError::Action(e)))) => {
                failed += 1;
                warn!(call = id, error = %e, "Call failed");
            }
            Ok((id, Err(GateError::Closed))) => {
                refused += 1;
                warn!(call = id, "Call refused, gate closed");
            }
            Err(e) => {
                failed += 1;
                warn!(error = %e, "Call task aborted");
            }
        }
    }

    gate.shutdown();
    info!(
        succeeded,
        failed,
        refused,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "All calls finished"
    );

    println!("{}", serde_json::to_string_pretty(&gate.stats())?);
    Ok(())
}

fn apply_overrides(config: &mut CallgateConfig, cli: &Cli) {
    if let Some(limit) = cli.limit {
        config.gate.limit = limit;
    }
    if let Some(window_ms) = cli.window_ms {
        config.gate.window_ms = Some(window_ms);
    }
    if let Some(release) = cli.release {
        config.gate.release = release;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json_logs {
        config.logging.json = true;
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, closing the gate");
        }
        _ = terminate => {
            info!("Received SIGTERM, closing the gate");
        }
    }
}
