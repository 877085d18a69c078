//! spfquery - command line SPF checker
//!
//! Exit codes follow the result: pass=0, fail=1, softfail=2, neutral=3,
//! temperror=4, permerror=5, none=6; usage and setup errors exit with 255.

use anyhow::Result;
use clap::Parser;
use spfkit_common::config::{Config, ExecutorKind, LoggingConfig};
use spfkit_core::{ResolverDnsService, Spf, SpfOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXIT_UNKNOWN: u8 = 255;

#[derive(Parser, Debug)]
#[command(name = "spfquery")]
#[command(about = "Check whether an IP address may send mail for a domain (SPF)", long_about = None)]
struct Cli {
    /// IP address of the connecting client
    #[arg(short, long)]
    ip: String,

    /// Envelope sender (MAIL FROM); may be empty
    #[arg(short, long, default_value = "")]
    sender: String,

    /// HELO/EHLO name of the client
    #[arg(short = 'H', long, default_value = "")]
    helo: String,

    /// Explanation template used on fail when the record has none
    #[arg(long)]
    default_explanation: Option<String>,

    /// Evaluate a best-guess record for domains without SPF
    #[arg(long)]
    use_best_guess: bool,

    /// Include the trusted forwarder domain in every record
    #[arg(long)]
    trusted_forwarder: bool,

    /// Require SPF and TXT records to agree
    #[arg(long)]
    strict: bool,

    /// Executor: blocking, callback or queued
    #[arg(short, long)]
    executor: Option<ExecutorKind>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::from(EXIT_UNKNOWN);
        }
        Err(e) => {
            // --help and --version
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("spfquery: [{}] {:#}", error_code(&e), e);
            ExitCode::from(EXIT_UNKNOWN)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    apply_flags(&mut config, &cli);

    init_logging(&config.logging, cli.verbose, cli.debug);
    debug!("Using {:?} executor", config.executor.kind);

    let dns = ResolverDnsService::from_config(&config.dns)?;
    let spf = Spf::from_config(&config, Arc::new(dns))?;

    info!("Checking {} for {} (helo {})", cli.ip, cli.sender, cli.helo);
    let outcome = spf.check(&cli.ip, &cli.sender, &cli.helo).await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }

    Ok(ExitCode::from(outcome.result.exit_code()))
}

/// Command line flags take precedence over the configuration file
fn apply_flags(config: &mut Config, cli: &Cli) {
    if let Some(template) = &cli.default_explanation {
        config.policy.default_explanation = template.clone();
    }
    if cli.use_best_guess {
        config.policy.use_best_guess = true;
    }
    if cli.trusted_forwarder {
        config.policy.use_trusted_forwarder = true;
    }
    if cli.strict {
        config.policy.strict_records = true;
    }
    if let Some(kind) = cli.executor {
        config.executor.kind = kind;
    }
}

/// Code of a workspace error, for scripts parsing stderr
fn error_code(error: &anyhow::Error) -> &'static str {
    error
        .downcast_ref::<spfkit_common::Error>()
        .map(|e| e.code())
        .unwrap_or("INTERNAL_ERROR")
}

fn print_outcome(outcome: &SpfOutcome) {
    println!("{}", outcome.result);
    println!("{}", outcome.header());
    if let Some(explanation) = &outcome.explanation {
        println!("{}", explanation);
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool, debug: bool) {
    let default_filter = if debug {
        "debug".to_string()
    } else if verbose {
        "info,spfkit_core=debug".to_string()
    } else {
        logging.level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "spfquery",
            "--ip",
            "192.0.2.1",
            "--sender",
            "user@example.com",
            "--use-best-guess",
            "--strict",
            "--executor",
            "queued",
            "--default-explanation",
            "See %{d}",
        ])
        .unwrap();

        let mut config = Config::default();
        apply_flags(&mut config, &cli);
        assert!(config.policy.use_best_guess);
        assert!(config.policy.strict_records);
        assert!(!config.policy.use_trusted_forwarder);
        assert_eq!(config.executor.kind, ExecutorKind::Queued);
        assert_eq!(config.policy.default_explanation, "See %{d}");
    }

    #[test]
    fn test_error_code() {
        let invalid: anyhow::Error = spfkit_common::Error::Validation("bad".into()).into();
        assert_eq!(error_code(&invalid), "VALIDATION_ERROR");
        assert_eq!(error_code(&anyhow::anyhow!("io")), "INTERNAL_ERROR");
    }

    #[test]
    fn test_ip_is_required() {
        assert!(Cli::try_parse_from(["spfquery", "--sender", "a@example.com"]).is_err());
    }
}
