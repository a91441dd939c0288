//! upload-probe - measure upload throughput towards a live ingest endpoint

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upload_rate::config::{
    ConnectFailurePolicy, PayloadSchedule, ProbeConfig, ProbeOptions, DEFAULT_PART_SIZE_BYTES,
};
use upload_rate::probe::{BenchmarkResult, ChannelSink, ProbeEvent, ThroughputProbe, ThroughputRound};
use upload_rate::transport::TcpPublisher;

#[derive(Parser, Debug)]
#[command(name = "upload-probe")]
#[command(about = "Measure upload throughput towards a live ingest endpoint")]
struct Args {
    /// Ingest endpoint, tcp://host:port or rtmp://host[:port]/app
    #[arg(long)]
    url: String,

    /// Payload size in bytes
    #[arg(long, default_value_t = 5 * DEFAULT_PART_SIZE_BYTES)]
    data_size: usize,

    /// Number of measurement rounds
    #[arg(long, default_value_t = 3)]
    rounds: usize,

    /// Watchdog timeout in seconds, 0 disables it
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Payload schedule across rounds: full, halving, divided
    #[arg(long, default_value = "full")]
    schedule: PayloadSchedule,

    /// End without reporting when connect or publish fails
    #[arg(long)]
    silent_connect_failure: bool,
}

#[derive(Serialize)]
struct Report {
    url: String,
    measured_at: String,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(flatten)]
    result: BenchmarkResult,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr, the report goes to stdout
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let connect_failure_policy = if args.silent_connect_failure {
        ConnectFailurePolicy::SilentAbort
    } else {
        ConnectFailurePolicy::Report
    };
    let config = ProbeConfig::new(
        args.data_size,
        ProbeOptions {
            rounds: Some(args.rounds),
            timeout_secs: Some(args.timeout),
            connect_failure_policy,
            payload_schedule: args.schedule,
            ..ProbeOptions::default()
        },
    )?;

    let publisher = Arc::new(TcpPublisher::new(0));
    let (sink, mut events) = ChannelSink::new();
    let probe = ThroughputProbe::new(config, publisher, Arc::new(sink));

    info!("Probing upload throughput to {}", args.url);
    probe.start(&args.url)?;

    let mut rounds: Vec<ThroughputRound> = Vec::new();
    let (status, speed, failure) = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ProbeEvent::RoundMeasured(round)) => rounds.push(round),
                Some(ProbeEvent::SpeedEstimated(speed)) => break ("completed", Some(speed), None),
                Some(ProbeEvent::TimedOut) => break ("timed_out", None, None),
                Some(ProbeEvent::Failed(cause)) => break ("failed", None, Some(cause.to_string())),
                Some(ProbeEvent::Disconnected) => {
                    // Silent connect failure ends here without a terminal event
                    if probe.is_stopped() {
                        break ("aborted", None, None);
                    }
                }
                None => break ("aborted", None, None),
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping probe");
                probe.stop();
                break ("stopped", None, None);
            }
        }
    };

    let mut result = BenchmarkResult::from_rounds(rounds);
    if let Some(speed) = speed {
        result.median_speed_mbps = speed;
    }
    let report = Report {
        url: args.url,
        measured_at: chrono::Local::now().to_rfc3339(),
        status,
        error: failure,
        result,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if status != "completed" {
        error!("Probe did not complete: {}", status);
        std::process::exit(1);
    }

    Ok(())
}
