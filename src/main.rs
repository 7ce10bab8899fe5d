//! Trustfilter CLI entry point.
//!
//! Provides `check` and `status` subcommands for evaluating one placement
//! request against a host, or printing the attested state of hosts.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use trustfilter::attestation::build_client;
use trustfilter::cache::{AttestationCache, RefreshOutcome};
use trustfilter::config::{default_config_path, load_config, Config};
use trustfilter::policy::{Decision, RequestContext, TrustDecisionEngine};
use trustfilter::types::HostId;

/// Attestation-backed trusted host filter.
#[derive(Parser)]
#[command(name = "trustfilter", version, about)]
struct Cli {
    /// Config file (default: `$TRUSTFILTER_CONFIG` or `~/.trustfilter/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write JSON logs to this directory in addition to stderr.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Evaluate one placement request against a host.
    Check {
        /// Candidate host, `host` or `host@backend`.
        #[arg(long)]
        host: String,
        /// Request metadata entry, `key=value`. Repeatable.
        #[arg(long = "meta", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
        /// Source image of the request.
        #[arg(long)]
        image: Option<String>,
        /// Source snapshot of the request.
        #[arg(long)]
        snapshot: Option<String>,
    },
    /// Attest hosts and print their cached records.
    Status {
        /// Hosts to attest. Repeatable.
        #[arg(long = "host", required = true)]
        hosts: Vec<String>,
        /// Print one JSON record per line instead of tab-separated columns.
        #[arg(long)]
        json: bool,
    },
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_owned(), v.to_owned()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let _logging_guard = match &cli.log_dir {
        Some(dir) => Some(trustfilter::logging::init_production(dir)?),
        None => {
            trustfilter::logging::init_cli();
            None
        }
    };

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    match cli.command {
        Command::Check {
            host,
            meta,
            image,
            snapshot,
        } => {
            let request = RequestContext {
                metadata: meta.into_iter().collect(),
                image_id: image,
                snapshot_id: snapshot,
            };
            handle_check(&config, &host, &request).await
        }
        Command::Status { hosts, json } => handle_status(&config, &hosts, json).await,
    }
}

fn build_cache(config: &Config) -> anyhow::Result<Arc<AttestationCache>> {
    let client = build_client(&config.attestation).context("failed to build attestation client")?;
    Ok(Arc::new(AttestationCache::new(client, &config.cache)))
}

/// Evaluate one request and exit 0 on accept, 1 on reject.
async fn handle_check(
    config: &Config,
    host: &str,
    request: &RequestContext,
) -> anyhow::Result<ExitCode> {
    let engine = TrustDecisionEngine::new(build_cache(config)?, config.policy.clone());
    match engine.decide(host, request).await {
        Decision::Accept => {
            println!("ACCEPT {host}");
            Ok(ExitCode::SUCCESS)
        }
        Decision::Reject(reason) => {
            println!("REJECT {host}: {reason}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Attest every host in one batch and print the records.
async fn handle_status(config: &Config, hosts: &[String], json: bool) -> anyhow::Result<ExitCode> {
    let cache = build_cache(config)?;
    let ids: Vec<HostId> = hosts.iter().map(|h| HostId::from_backend(h)).collect();
    cache.track(&ids);

    let outcome = cache.refresh().await;
    info!(?outcome, "attestation refresh finished");

    for id in &ids {
        if let Some(record) = cache.record(id) {
            if json {
                let line = serde_json::to_string(&record)
                    .context("failed to serialize attestation record")?;
                println!("{line}");
                continue;
            }
            let tags = record
                .tags
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            println!(
                "{host}\t{level}\t{verified}\t{tags}",
                host = record.host,
                level = record.trust_level,
                verified = record.verified_at.to_rfc3339(),
            );
        }
    }

    Ok(match outcome {
        RefreshOutcome::Updated(_) => ExitCode::SUCCESS,
        RefreshOutcome::NoData | RefreshOutcome::Empty | RefreshOutcome::Deferred => {
            ExitCode::FAILURE
        }
    })
}
