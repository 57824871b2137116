//! The simulation driver: schedules every (persona, model, condition,
//! instrument) cell on a bounded worker pool and merges the results.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument as _;

use crate::condition::Condition;
use crate::config::{Credentials, SimulationConfig};
use crate::errors::{BackendError, ConfigError, SimulationError};
use crate::instrument::InstrumentStore;
use crate::llms::backend::ModelBackend;
use crate::llms::providers::build_backends;
use crate::persona::PersonaStore;
use crate::prompt::PromptRenderer;
use crate::results::{ResponseRecord, ResultMap};
use crate::simulation::cell::{run_cell, CellInput};
use crate::simulation::control::RunControl;

#[derive(Debug, Clone)]
struct CellJob {
    persona: usize,
    instrument: usize,
    model: String,
    condition: Condition,
}

/// Outcome of a run that was not aborted.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub results: ResultMap,
    pub total_cells: usize,
    pub completed_cells: usize,
    /// Cells whose task panicked. Their questions are left missing.
    pub crashed_cells: usize,
    /// Whether the run was stopped before every cell was scheduled.
    pub cancelled: bool,
}

pub struct SimulationDriver {
    config: Arc<SimulationConfig>,
    personas: Arc<PersonaStore>,
    instruments: Arc<InstrumentStore>,
    backends: BTreeMap<String, Arc<dyn ModelBackend>>,
    renderer: Arc<PromptRenderer>,
    control: RunControl,
}

impl SimulationDriver {
    pub fn new(
        config: Arc<SimulationConfig>,
        personas: Arc<PersonaStore>,
        instruments: Arc<InstrumentStore>,
        backends: BTreeMap<String, Arc<dyn ModelBackend>>,
        renderer: Arc<PromptRenderer>,
    ) -> Self {
        Self {
            config,
            personas,
            instruments,
            backends,
            renderer,
            control: RunControl::new(),
        }
    }

    /// Build a driver from configuration alone: check credentials and
    /// input files, load both stores, and construct the backends.
    pub fn prepare(config: SimulationConfig, credentials: &Credentials) -> Result<Self, SimulationError> {
        config.check_credentials(credentials)?;
        config.require_inputs()?;

        let personas = PersonaStore::load(&config.paths.personas)?;
        personas.warn_incomplete(&config.required_demographics);
        let instruments = InstrumentStore::load(&config.paths.instruments)?;
        if personas.is_empty() || instruments.is_empty() {
            return Err(ConfigError::Invalid {
                message: format!(
                    "nothing to simulate: {} personas, {} instruments",
                    personas.len(),
                    instruments.len()
                ),
            }
            .into());
        }

        let renderer = PromptRenderer::from_path(config.paths.system_template.as_deref())?;
        let backends = build_backends(&config, credentials)?;
        Ok(Self::new(
            Arc::new(config),
            Arc::new(personas),
            Arc::new(instruments),
            backends,
            Arc::new(renderer),
        ))
    }

    /// Handle for stopping the run from outside.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    fn jobs(&self) -> VecDeque<CellJob> {
        let mut jobs = VecDeque::new();
        for persona in 0..self.personas.len() {
            for model in self.backends.keys() {
                for &condition in &self.config.conditions {
                    for instrument in 0..self.instruments.len() {
                        jobs.push_back(CellJob {
                            persona,
                            instrument,
                            model: model.clone(),
                            condition,
                        });
                    }
                }
            }
        }
        jobs
    }

    fn spawn_cell(
        &self,
        set: &mut JoinSet<Result<Vec<ResponseRecord>, BackendError>>,
        job: CellJob,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let Some(backend) = self.backends.get(&job.model).cloned() else {
            return;
        };
        let personas = Arc::clone(&self.personas);
        let instruments = Arc::clone(&self.instruments);
        let renderer = Arc::clone(&self.renderer);
        let config = Arc::clone(&self.config);

        let persona_id = personas.as_slice()[job.persona].persona_id;
        let span = tracing::info_span!(
            "cell",
            persona_id,
            model = %job.model,
            condition = %job.condition,
            instrument = %instruments.as_slice()[job.instrument].name,
        );

        set.spawn(
            async move {
                let _permit = permit;
                let input = CellInput {
                    persona: &personas.as_slice()[job.persona],
                    instrument: &instruments.as_slice()[job.instrument],
                    condition: job.condition,
                    renderer: &renderer,
                    retry: &config.retry,
                    seed: config.seed,
                };
                let records = run_cell(input, backend.as_ref()).await?;
                tracing::debug!(records = records.len(), "cell finished");
                Ok(records)
            }
            .instrument(span),
        );
    }

    /// Run every cell and return the merged results.
    ///
    /// An authentication failure aborts in-flight cells and fails the run.
    /// Cancellation stops scheduling; cells already running complete and
    /// the partial results are returned.
    pub async fn run(&self) -> Result<RunReport, SimulationError> {
        let mut jobs = self.jobs();
        let total_cells = jobs.len();
        tracing::info!(
            personas = self.personas.len(),
            models = self.backends.len(),
            conditions = self.config.conditions.len(),
            instruments = self.instruments.len(),
            cells = total_cells,
            max_concurrency = self.config.max_concurrency,
            "starting simulation"
        );

        let mut results = ResultMap::new();
        for persona in self.personas.iter() {
            for model in self.backends.keys() {
                results.ensure_entry(persona.persona_id, model);
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut completed_cells = 0;
        let mut crashed_cells = 0;
        let mut cancelled = false;

        while !(jobs.is_empty() && set.is_empty()) {
            tokio::select! {
                biased;

                _ = self.control.cancelled(), if !jobs.is_empty() => {
                    tracing::warn!(unscheduled = jobs.len(), "run cancelled, not scheduling remaining cells");
                    jobs.clear();
                    cancelled = true;
                }

                Some(joined) = set.join_next(), if !set.is_empty() => match joined {
                    Ok(Ok(records)) => {
                        results.extend(&records);
                        completed_cells += 1;
                        if completed_cells % 50 == 0 {
                            tracing::info!(completed_cells, total_cells, "progress");
                        }
                    }
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, "authentication failed, aborting run");
                        self.control.cancel();
                        set.shutdown().await;
                        return Err(SimulationError::Auth(err));
                    }
                    Err(err) => {
                        crashed_cells += 1;
                        tracing::error!(error = %err, "cell task failed");
                    }
                },

                permit = Arc::clone(&semaphore).acquire_owned(), if !jobs.is_empty() => {
                    let Ok(permit) = permit else { break };
                    if let Some(job) = jobs.pop_front() {
                        self.spawn_cell(&mut set, job, permit);
                    }
                }
            }
        }

        tracing::info!(completed_cells, total_cells, crashed_cells, cancelled, "simulation finished");
        Ok(RunReport {
            results,
            total_cells,
            completed_cells,
            crashed_cells,
            cancelled,
        })
    }
}
