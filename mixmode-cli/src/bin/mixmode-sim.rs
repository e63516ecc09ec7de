use anyhow::{bail, Result};
use clap::Parser;
use log::{error, info};
use mixmode_cli::{format_transition, run, Scenario};
use mixmode_core::CoordinatorConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario to run
    #[arg(short, long, value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,

    /// Coordinator config (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the convergence timeout
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print transitions and reports as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_json_file(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(timeout_ms) = args.timeout_ms {
        config.convergence_timeout_ms = timeout_ms;
    }
    config.validate()?;
    info!("Using {config:?}");

    let mut failed = Vec::new();
    for scenario in args.scenario.expand() {
        let outcome = run(scenario, &config).await;
        let report = outcome.report();

        if args.json {
            for transition in &outcome.transitions {
                println!("{}", serde_json::to_string(transition)?);
            }
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!("== {}", report.scenario);
            for transition in &outcome.transitions {
                println!("  {}", format_transition(transition));
            }
            match &report.error {
                None => println!("  ok ({} transitions)", report.transitions),
                Some(err) => println!("  FAILED: {err}"),
            }
        }

        if let Some(err) = &outcome.error {
            error!("Scenario {} failed: {err:#}", scenario.name());
            failed.push(scenario.name());
        }
    }

    if !failed.is_empty() {
        bail!("{} scenario(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}
