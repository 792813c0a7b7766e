//! PipeSentry edge binary.
//!
//! Reads newline-delimited JSON `RawSample` records from stdin, feeds them
//! through the detection engine, and logs detection results and alerts as
//! they happen. The HTTP/WebSocket surface lives in a separate service; this
//! binary is the headless core used for field replays and piping a live
//! gateway feed.
//!
//! ```text
//! sensor-gateway --ndjson | pipesentry --baseline-pressure 50 --baseline-flow 10
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pipesentry::actuator::SimulatedActuator;
use pipesentry::alerts::{InAppNotifier, LogNotifier, Notifier};
use pipesentry::{DetectionConfig, DetectionEngine, RawSample, Topic, ValvePosition};

#[derive(Debug, Parser)]
#[command(name = "pipesentry", about = "Real-time leak detection engine")]
struct Args {
    /// Path to a TOML config file (overrides the default search order).
    #[arg(long, env = "PIPESENTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON (for log shippers).
    #[arg(long)]
    json_logs: bool,

    /// Load a previously trained model blob at startup.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Rule-engine baseline pressure (PSI); requires --baseline-flow.
    #[arg(long, requires = "baseline_flow")]
    baseline_pressure: Option<f64>,

    /// Rule-engine baseline flow (L/min); requires --baseline-pressure.
    #[arg(long, requires = "baseline_pressure")]
    baseline_flow: Option<f64>,

    /// Locations with remotely operable valves, all starting OPEN.
    #[arg(long, value_delimiter = ',', default_value = "main")]
    valve_locations: Vec<String>,

    /// Write the audit chain as CSV to this path on exit.
    #[arg(long)]
    audit_csv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = match &args.config {
        Some(path) => DetectionConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DetectionConfig::load(),
    };

    let actuator = Arc::new(SimulatedActuator::new());
    for location in &args.valve_locations {
        actuator.register(location, ValvePosition::Open);
    }

    let notifiers: Vec<Arc<dyn Notifier>> = vec![
        Arc::new(InAppNotifier::new()),
        Arc::new(LogNotifier::email("ops@pipesentry.local")),
        Arc::new(LogNotifier::sms("+0000000000")),
        Arc::new(LogNotifier::slack("#leak-alerts")),
    ];

    let engine = DetectionEngine::builder(config)
        .actuator(actuator)
        .notifiers(notifiers)
        .start();

    if let Some(path) = &args.model {
        let blob = std::fs::read_to_string(path)
            .with_context(|| format!("reading model blob {}", path.display()))?;
        engine.load_model(&blob).context("loading model blob")?;
        info!(path = %path.display(), "Anomaly model loaded");
    } else {
        warn!("No model loaded — running rule-only until a model is trained");
    }

    if let (Some(pressure), Some(flow)) = (args.baseline_pressure, args.baseline_flow) {
        engine.set_baseline(pressure, flow);
    }

    // Live event log: everything the dashboard would subscribe to.
    let sub = engine.hub().subscribe(&[
        Topic::DetectionResult,
        Topic::AlertNew,
        Topic::AlertAcknowledged,
        Topic::AlertResolved,
        Topic::ValveChanged,
    ]);
    let event_logger = tokio::spawn(async move {
        while let Some(envelope) = sub.recv().await {
            match envelope.topic {
                Topic::DetectionResult => {
                    if envelope.payload["is_leak"].as_bool().unwrap_or(false) {
                        info!(
                            id = envelope.payload["id"].as_str().unwrap_or("-"),
                            probability = envelope.payload["probability"].as_f64().unwrap_or(0.0),
                            severity = envelope.payload["severity"].as_str().unwrap_or("-"),
                            "Leak verdict"
                        );
                    }
                }
                topic => {
                    info!(topic = %topic, payload = %envelope.payload, "Event");
                }
            }
        }
    });

    // Ingest loop: one JSON sample per line until EOF or ctrl-c.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut parse_failures = 0_u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<RawSample>(&line) {
                        Ok(sample) => {
                            if let Err(e) = engine.submit(sample).await {
                                warn!(error = %e, "Sample rejected");
                            }
                        }
                        Err(e) => {
                            parse_failures += 1;
                            warn!(error = %e, "Unparseable sample line");
                        }
                    }
                }
                Ok(None) => {
                    info!("Input drained");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "stdin read failed");
                    break;
                }
            },
        }
    }

    if let Some(path) = &args.audit_csv {
        std::fs::write(path, engine.audit().export_csv())
            .with_context(|| format!("writing audit CSV to {}", path.display()))?;
        info!(path = %path.display(), "Audit chain exported");
    }

    let stats = engine.shutdown().await;
    event_logger.abort();
    info!(%stats, parse_failures, "Run complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pipesentry=debug"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
