use prettytable::{format, Table};
use serde::Serialize;

use perfctr::{CacheStats, CounterState, RunState};

use crate::scenario::{Simulation, StepOutcome};

#[derive(Serialize)]
pub struct SessionReport {
    pub session: usize,
    pub running_on: Option<usize>,
    pub clock: u64,
    pub counters: Vec<CounterState>,
}

#[derive(Serialize)]
pub struct CpuReport {
    pub cpu: usize,
    pub online: bool,
    pub cache: CacheStats,
    pub register_writes: usize,
}

#[derive(Serialize)]
pub struct Report {
    pub backend: &'static str,
    pub sessions: Vec<SessionReport>,
    pub cpus: Vec<CpuReport>,
    pub steps: Vec<StepOutcome>,
}

impl Report {
    pub fn new(sim: &Simulation) -> Report {
        let sessions = sim
            .sessions
            .iter()
            .enumerate()
            .map(|(session, state)| SessionReport {
                session,
                running_on: match state.run_state() {
                    RunState::Running { cpu } => Some(cpu),
                    RunState::Stopped => None,
                },
                clock: state.clock_sum(),
                counters: state.counters().to_vec(),
            })
            .collect();

        let cpus = sim
            .regs
            .iter()
            .enumerate()
            .map(|(cpu, regs)| CpuReport {
                cpu,
                online: sim.topology.is_online(cpu),
                cache: sim.topology.cache_stats(cpu).unwrap_or_default(),
                register_writes: regs.write_count(),
            })
            .collect();

        Report {
            backend: sim.topology.backend().name(),
            sessions,
            cpus,
            steps: sim.outcomes.clone(),
        }
    }

    pub fn print(&self) {
        println!("Counter family: {}", self.backend);

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
        table.set_titles(row!["Session", "Running on", "Clock", "Slot", "Sum"]);
        for session in &self.sessions {
            let running_on = session
                .running_on
                .map_or_else(|| "-".to_string(), |cpu| cpu.to_string());
            if session.counters.is_empty() {
                table.add_row(row![session.session, running_on, session.clock, "-", "-"]);
            }
            for (i, counter) in session.counters.iter().enumerate() {
                if i == 0 {
                    table.add_row(row![
                        session.session,
                        running_on,
                        session.clock,
                        format!("{:#x}", counter.slot),
                        counter.sum,
                    ]);
                } else {
                    table.add_row(row!["", "", "", format!("{:#x}", counter.slot), counter.sum]);
                }
            }
        }
        table.printstd();

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
        table.set_titles(row![
            "CPU",
            "Online",
            "Cache hits",
            "Cache misses",
            "Control writes",
            "All register writes",
        ]);
        for cpu in &self.cpus {
            table.add_row(row![
                cpu.cpu,
                cpu.online,
                cpu.cache.hits,
                cpu.cache.misses,
                cpu.cache.register_writes,
                cpu.register_writes,
            ]);
        }
        table.printstd();

        let refused: Vec<&StepOutcome> =
            self.steps.iter().filter(|step| step.error.is_some()).collect();
        if !refused.is_empty() {
            println!("Refused steps:");
            for step in refused {
                println!(
                    "  #{}: {}",
                    step.index,
                    step.error.as_deref().unwrap_or_default()
                );
            }
        }
    }
}
