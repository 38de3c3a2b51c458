#[macro_use]
extern crate log;
#[macro_use]
extern crate prettytable;

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use perfctr::ReloadPolicy;

mod report;
mod scenario;

use crate::report::Report;
use crate::scenario::{Scenario, Simulation};

#[derive(Parser, Debug)]
struct Opt {
    /// JSON scenario to replay
    scenario: PathBuf,
    /// Override the number of simulated CPUs
    #[arg(long)]
    cpus: Option<usize>,
    /// Override the reload policy (`diff` or `full`)
    #[arg(long)]
    reload: Option<ReloadPolicy>,
    /// Print the report as JSON instead of tables
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let opt = Opt::parse();

    let mut scenario = Scenario::load(&opt.scenario)?;
    if let Some(cpus) = opt.cpus {
        if cpus == 0 {
            return Err("--cpus must be at least 1".into());
        }
        scenario.cpus = cpus;
    }
    if let Some(reload) = opt.reload {
        scenario.reload_policy = reload;
    }
    info!(
        "pmcsim: {} steps on {} x {} ({} reloads)",
        scenario.steps.len(),
        scenario.cpus,
        scenario.backend,
        scenario.reload_policy
    );

    let mut sim = Simulation::new(&scenario)?;
    sim.run(&scenario.steps)?;

    let report = Report::new(&sim);
    if opt.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print();
    }

    Ok(())
}
