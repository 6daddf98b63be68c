use std::sync::Arc;

use env_logger::Env;

pub mod aggregate;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod probe;
pub mod scheduler;
pub mod stage;

use aggregate::{aggregate, render, summarize};
use config::app_config::{load_config, setup_resolver, setup_tls_connector};
use config::probe_config::VerifierKind;
use descriptor::parse_batch;
use error::{AppError, report};
use probe::{AppCheck, ProbeOutcome, ProbePolicy, Prober, StagedProber, XrayProber};
use stage::{NetworkStages, Stage};

const MAX_LABEL_WIDTH: usize = 32;

fn to_fixed_width(input: &str, width: usize) -> String {
    use unicode_truncate::UnicodeTruncateStr;

    let (truncated, _) = input.unicode_truncate(width);
    format!("{:<width$}", truncated, width = width)
}

fn display_name(outcome: &ProbeOutcome) -> String {
    match &outcome.endpoint.label {
        Some(label) => label.clone(),
        None => outcome.endpoint.authority(),
    }
}

fn log_outcome(outcome: &ProbeOutcome, width: usize) {
    let name = to_fixed_width(&display_name(outcome), width);
    let endpoint = &outcome.endpoint;

    match &outcome.failure_reason {
        None => {
            let cert = outcome
                .cert_validity_days
                .map(|d| format!("{d}d"))
                .unwrap_or_else(|| "N/A".to_string());
            let http = match &outcome.app_check {
                AppCheck::Skipped => "skipped".to_string(),
                AppCheck::Passed { status } => match outcome.latency_of(Stage::AppCheck) {
                    Some(ms) => format!("{status} in {ms}ms"),
                    None => status.to_string(),
                },
                AppCheck::Ignored { reason } => format!("ignored ({reason})"),
            };
            log::info!(
                "[{name}] ✅ {} {}/{}, Total: {}ms ({}), HTTP: {http}, Cert: {cert}",
                endpoint.authority(),
                endpoint.transport,
                endpoint.security.as_str(),
                outcome.total_latency_ms,
                outcome.stage_breakdown(),
            );
        }
        Some(reason) => {
            log::info!("[{name}] ❌ {}: {reason}", endpoint.authority());
        }
    }
}

async fn run() -> Result<(), AppError> {
    let config = load_config()?;
    let probe_config = &config.probe;

    let input = std::fs::read_to_string(&config.input_file).map_err(|source| {
        AppError::ReadInput {
            path: config.input_file.clone(),
            source,
        }
    })?;

    let batch = parse_batch(&input);
    log::info!(
        "Read {} endpoints from {} ({} malformed, {} skipped)",
        batch.endpoints.len(),
        config.input_file.display(),
        batch.malformed,
        batch.unrecognized
    );

    let prober: Arc<dyn Prober> = match probe_config.verifier.kind {
        VerifierKind::Staged => {
            let resolver = setup_resolver(&config.dns_hosts)?;
            let connector = setup_tls_connector(probe_config.accept_invalid_certs)?;
            Arc::new(StagedProber::new(
                NetworkStages::new(resolver, connector),
                ProbePolicy::from(probe_config),
            ))
        }
        VerifierKind::Xray => {
            log::info!("Verifying endpoints with {}", probe_config.verifier.binary);
            Arc::new(XrayProber::from_config(&probe_config.verifier))
        }
    };

    let endpoints: Vec<_> = batch.endpoints.into_iter().map(Arc::new).collect();
    let mut outcomes = scheduler::run_all(
        prober,
        endpoints,
        probe_config.concurrency_limit,
        probe_config.batch_deadline(),
    )
    .await;
    outcomes.sort_by_key(|o| o.index);

    let width = outcomes
        .iter()
        .map(|o| display_name(o).chars().count())
        .max()
        .unwrap_or(10)
        .min(MAX_LABEL_WIDTH);
    for outcome in &outcomes {
        log_outcome(outcome, width);
    }
    log::info!("{}", summarize(&outcomes));

    let ranked = aggregate(&outcomes, probe_config.latency_ceiling_ms, probe_config.top_n);
    std::fs::write(&config.output_file, render(&ranked)).map_err(|source| {
        AppError::WriteOutput {
            path: config.output_file.clone(),
            source,
        }
    })?;

    log::info!(
        "Saved {} endpoints under {}ms to {}",
        ranked.len(),
        probe_config.latency_ceiling_ms,
        config.output_file.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("{}", report(&e));
        std::process::exit(1);
    }
}
