use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use perfctr::testing_common::{sim_backend, sim_topology, SimRegisters};
use perfctr::{
    ireload, CounterConfig, CpuId, CpuTopology, Preserve, ReloadPolicy, Session,
    TopologyOptions,
};
use serde::{Deserialize, Serialize};

/// A replayable sequence of counter operations against simulated CPUs.
#[derive(Clone, Debug, Deserialize)]
pub struct Scenario {
    /// Counter family, as accepted by `perfctr::backend::by_name`, or `mock`.
    pub backend: String,
    #[serde(default = "default_cpus")]
    pub cpus: usize,
    #[serde(default)]
    pub reload_policy: ReloadPolicy,
    pub sessions: usize,
    pub steps: Vec<Step>,
}

fn default_cpus() -> usize {
    1
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Control {
        session: usize,
        config: CounterConfig,
        #[serde(default)]
        preserve: Preserve,
    },
    Resume { session: usize, cpu: CpuId },
    Suspend { session: usize, cpu: CpuId },
    Sample { session: usize, cpu: CpuId },
    /// Every counter register and the clock of `cpu` count `events`.
    Tick { cpu: CpuId, events: u64 },
    Overflow { session: usize, cpu: CpuId },
    Ireload { session: usize },
    SetOnline { cpu: CpuId, online: bool },
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Scenario, Box<dyn Error + Send + Sync>> {
        let text = fs::read_to_string(path)?;
        let scenario: Scenario = serde_json::from_str(&text)?;
        if scenario.sessions == 0 {
            return Err("a scenario needs at least one session".into());
        }
        if scenario.cpus == 0 {
            return Err("a scenario needs at least one cpu".into());
        }
        Ok(scenario)
    }
}

/// What happened at one step, for the report.
#[derive(Clone, Debug, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub step: Step,
    /// Register writes the step caused on its CPU.
    pub register_writes: usize,
    pub overflowed: Option<Vec<u32>>,
    pub error: Option<String>,
}

pub struct Simulation {
    pub topology: Arc<CpuTopology>,
    pub regs: Vec<Arc<SimRegisters>>,
    pub sessions: Vec<Session>,
    pub outcomes: Vec<StepOutcome>,
}

impl Simulation {
    pub fn new(scenario: &Scenario) -> Result<Simulation, Box<dyn Error + Send + Sync>> {
        let backend = sim_backend(&scenario.backend)?;
        let options = TopologyOptions {
            nr_cpus: scenario.cpus,
            reload_policy: scenario.reload_policy,
        };
        let (topology, regs) = sim_topology(backend, options);
        let sessions = (0..scenario.sessions).map(|_| Session::new()).collect();

        Ok(Simulation {
            topology,
            regs,
            sessions,
            outcomes: Vec::new(),
        })
    }

    /// Runs every step. A step that fails is recorded and the run goes on,
    /// as a kernel would carry on after refusing one request.
    pub fn run(&mut self, steps: &[Step]) -> Result<(), Box<dyn Error + Send + Sync>> {
        for (index, step) in steps.iter().enumerate() {
            let writes_before = self.total_writes();
            let result = self.step(step);
            let register_writes = self.total_writes() - writes_before;

            let (overflowed, error) = match result {
                Ok(overflowed) => (overflowed, None),
                Err(StepError::Fatal(e)) => return Err(e),
                Err(StepError::Refused(e)) => {
                    warn!("Simulation::run: step {} refused: {}", index, e);
                    (None, Some(e))
                }
            };
            debug!(
                "Simulation::run: step {} {:?} took {} register writes",
                index, step, register_writes
            );

            self.outcomes.push(StepOutcome {
                index,
                step: step.clone(),
                register_writes,
                overflowed,
                error,
            });
        }
        Ok(())
    }

    fn step(&mut self, step: &Step) -> Result<Option<Vec<u32>>, StepError> {
        match *step {
            Step::Control {
                session,
                ref config,
                preserve,
            } => {
                let backend = Arc::clone(self.topology.backend());
                self.session(session)?
                    .update_control_preserving(&*backend, config.clone(), preserve)
                    .map_err(StepError::refused)?;
            }
            Step::Resume { session, cpu } => {
                let session = self.sessions.get_mut(session).ok_or_else(|| no_session(session))?;
                self.topology
                    .enter(cpu)
                    .map_err(StepError::refused)?
                    .resume(session);
            }
            Step::Suspend { session, cpu } => {
                let session = self.sessions.get_mut(session).ok_or_else(|| no_session(session))?;
                self.topology
                    .enter(cpu)
                    .map_err(StepError::refused)?
                    .suspend(session);
            }
            Step::Sample { session, cpu } => {
                let session = self.sessions.get_mut(session).ok_or_else(|| no_session(session))?;
                self.topology
                    .enter(cpu)
                    .map_err(StepError::refused)?
                    .sample(session);
            }
            Step::Tick { cpu, events } => {
                let regs = self
                    .regs
                    .get(cpu)
                    .ok_or_else(|| StepError::Fatal(format!("no cpu {}", cpu).into()))?;
                regs.tick(events);
            }
            Step::Overflow { session, cpu } => {
                let session = self.sessions.get_mut(session).ok_or_else(|| no_session(session))?;
                let overflowed = self
                    .topology
                    .enter(cpu)
                    .map_err(StepError::refused)?
                    .identify_overflow(session)
                    .map_err(StepError::refused)?;
                return Ok(Some(overflowed.slots().to_vec()));
            }
            Step::Ireload { session } => {
                let backend = Arc::clone(self.topology.backend());
                ireload(&*backend, self.session(session)?);
            }
            Step::SetOnline { cpu, online } => {
                self.topology
                    .set_online(cpu, online)
                    .map_err(StepError::refused)?;
            }
        }
        Ok(None)
    }

    fn session(&mut self, index: usize) -> Result<&mut Session, StepError> {
        self.sessions.get_mut(index).ok_or_else(|| no_session(index))
    }

    fn total_writes(&self) -> usize {
        self.regs.iter().map(|regs| regs.write_count()).sum()
    }
}

enum StepError {
    /// The scenario itself is broken.
    Fatal(Box<dyn Error + Send + Sync>),
    /// The library turned the request down.
    Refused(String),
}

impl StepError {
    fn refused(e: perfctr::ControlError) -> StepError {
        StepError::Refused(e.to_string())
    }
}

fn no_session(index: usize) -> StepError {
    StepError::Fatal(format!("no session {}", index).into())
}
