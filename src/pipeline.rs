use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, RuntimeConfig};
use crate::core::io::load_patient;
use crate::core::output::ArtifactWriter;
use crate::core::repository::ImageRepository;
use crate::error::{PipelineError, SchemaError, StepError};
use crate::inference::{Device, ModelInvoker};
use crate::models::Patient;
use crate::schema::{PipelineDescription, Step};
use crate::steps::{DependencyPlan, MomentsRegistration, RegistrationBackend, StepContext, TaskKind};

/// Check every step's references against the patient data and the outputs
/// of the steps before it, without running anything
pub fn check_dependencies(repository: &ImageRepository, pipeline: &PipelineDescription) -> Result<(), PipelineError> {
    let mut plan = DependencyPlan::from_repository(repository);
    for step in pipeline.iter() {
        step.task
            .as_step()
            .plan(&mut plan)
            .map_err(|source| step_failure(step, source))?;
    }
    Ok(())
}

fn step_failure(step: &Step, source: StepError) -> PipelineError {
    PipelineError::Step {
        index: step.index,
        task: step.task.kind(),
        description: step.description.clone(),
        source,
    }
}

fn now() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: u32,
    pub task: TaskKind,
    pub description: String,
    /// Keys of the produced artifacts
    pub artifacts: Vec<String>,
    /// Files written for them
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub step: Option<u32>,
    pub description: Option<String>,
    pub category: String,
    pub kind: String,
    pub message: String,
}

/// Summary of one run, saved as `pipeline_report.json`
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub patient: String,
    pub started: String,
    pub finished: Option<String>,
    pub status: RunStatus,
    pub steps: Vec<StepReport>,
    pub failure: Option<FailureReport>,
}

impl RunReport {
    fn new(patient: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            patient: patient.to_string(),
            started: now(),
            finished: None,
            status: RunStatus::Running,
            steps: vec![],
            failure: None,
        }
    }

    /// Report for a run that stopped while reading its inputs
    fn load_failed(patient: &str, error: &anyhow::Error) -> Self {
        let (category, kind) = match error.downcast_ref::<SchemaError>() {
            Some(_) => ("SchemaError", "SchemaError"),
            None => ("DataError", "InvalidPatientData"),
        };
        let mut report = Self::new(patient);
        report.finished = Some(now());
        report.status = RunStatus::Failed;
        report.failure = Some(FailureReport {
            step: None,
            description: None,
            category: category.to_string(),
            kind: kind.to_string(),
            message: format!("{:#}", error),
        });
        report
    }

    fn finish(&mut self, pipeline: &PipelineDescription, error: Option<&PipelineError>) {
        self.finished = Some(now());
        let Some(error) = error else {
            self.status = RunStatus::Completed;
            return;
        };

        self.status = match error {
            PipelineError::Cancelled { .. } => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        };
        let step = error.step_index();
        let category = match error {
            PipelineError::Schema(_) => "SchemaError",
            PipelineError::Cancelled { .. } => "Cancelled",
            PipelineError::Step { source, .. } => source.category(),
        };
        self.failure = Some(FailureReport {
            step,
            description: step.and_then(|index| {
                pipeline
                    .iter()
                    .find(|s| s.index == index)
                    .map(|s| s.description.clone())
            }),
            category: category.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }
}

/// Everything a successful run produced
#[derive(Debug)]
pub struct RunResult {
    pub repository: ImageRepository,
    pub report: RunReport,
}

/// Runs a pipeline description against one patient, strictly in index
/// order, stopping at the first failure
pub struct PipelineExecutor<'a> {
    invoker: &'a ModelInvoker,
    registrar: &'a dyn RegistrationBackend,
    runtime: &'a RuntimeConfig,
    writer: Option<&'a ArtifactWriter>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> PipelineExecutor<'a> {
    pub fn new(invoker: &'a ModelInvoker, registrar: &'a dyn RegistrationBackend, runtime: &'a RuntimeConfig) -> Self {
        Self {
            invoker,
            registrar,
            runtime,
            writer: None,
            cancel: None,
        }
    }

    /// Persist artifacts (and the run report) as steps complete
    pub fn with_writer(mut self, writer: &'a ArtifactWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Stop before the next step once `flag` is set
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn run(&self, patient: Patient, pipeline: &PipelineDescription) -> Result<RunResult, PipelineError> {
        let mut repository = ImageRepository::from_patient(patient);
        let mut report = RunReport::new(repository.patient_id());
        info!(
            "Running {} step(s) for patient {} ({} volume(s))",
            pipeline.len(),
            repository.patient_id(),
            repository.len()
        );

        let outcome = self.execute(&mut repository, pipeline, &mut report);
        report.finish(pipeline, outcome.as_ref().err());

        if let Some(writer) = self.writer {
            if let Err(e) = writer.write_report(&report) {
                warn!("Failed to write run report: {:#}", e);
            }
        }

        outcome.map(|()| RunResult { repository, report })
    }

    fn execute(
        &self,
        repository: &mut ImageRepository,
        pipeline: &PipelineDescription,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        check_dependencies(repository, pipeline)?;

        for step in pipeline.iter() {
            if self.cancelled() {
                info!("Run cancelled before step {}", step.index);
                return Err(PipelineError::Cancelled { index: step.index });
            }

            let handler = step.task.as_step();
            info!("Running step {}: {} ({})", step.index, handler.name(), step.description);

            let output = {
                let context = StepContext {
                    repository: &*repository,
                    invoker: self.invoker,
                    registrar: self.registrar,
                    runtime: self.runtime,
                };
                handler.execute(&context).map_err(|source| step_failure(step, source))?
            };

            let mut files = Vec::new();
            if let Some(writer) = self.writer {
                let output_error = |e: anyhow::Error| step_failure(step, StepError::Output(format!("{:#}", e)));
                for (key, artifact) in &output {
                    files.extend(writer.write(key, artifact).map_err(output_error)?);
                    if let Some(preview) = writer
                        .write_preview(step.index, handler.name(), key, artifact)
                        .map_err(output_error)?
                    {
                        files.push(preview);
                    }
                }
            }

            let artifacts: Vec<String> = output.iter().map(|(key, _)| key.to_string()).collect();
            info!("  → {} artifact(s)", artifacts.len());
            for (key, artifact) in output {
                repository.put(key, artifact);
            }

            report.steps.push(StepReport {
                index: step.index,
                task: step.task.kind(),
                description: step.description.clone(),
                artifacts,
                files,
            });
        }

        Ok(())
    }
}

/// Composable pipeline built from a run configuration
pub struct Pipeline {
    config: Config,
    invoker: ModelInvoker,
    registrar: Box<dyn RegistrationBackend>,
    previews: Option<PathBuf>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Pipeline {
    pub fn from_config(config: Config) -> Self {
        let invoker = ModelInvoker::new(&config.system.model_folder)
            .with_device(Device::from_gpu_id(config.system.gpu_id))
            .with_reconstruction(config.runtime.reconstruction_order, config.runtime.fill_holes);
        let previews = config
            .runtime
            .previews
            .then(|| config.system.output_folder.join("previews"));

        Self {
            config,
            invoker,
            registrar: Box::new(MomentsRegistration),
            previews,
            cancel: None,
        }
    }

    /// Save previews of every image artifact to `output_dir`.
    /// The directory must be empty or non-existent
    pub fn with_debug(mut self, output_dir: PathBuf) -> Result<Self> {
        if output_dir.exists() {
            let entries = std::fs::read_dir(&output_dir)?;
            if entries.count() > 0 {
                return Err(anyhow::anyhow!(
                    "Debug directory is not empty: {}",
                    output_dir.display()
                ));
            }
        } else {
            std::fs::create_dir_all(&output_dir)?;
        }

        self.previews = Some(output_dir);
        Ok(self)
    }

    pub fn with_registrar(mut self, registrar: Box<dyn RegistrationBackend>) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Used to register in-memory models ahead of a run
    pub fn invoker(&self) -> &ModelInvoker {
        &self.invoker
    }

    /// Read the patient folder and the pipeline description
    pub fn load(&self) -> Result<(Patient, PipelineDescription)> {
        let patient = load_patient(&self.config.system.input_folder)?;
        info!(
            "Loaded patient {} with {} volume(s) over {} timestamp(s)",
            patient.id,
            patient.len(),
            patient.timestamps().len()
        );
        let pipeline = PipelineDescription::from_file(&self.config.system.pipeline_filename)?;
        Ok((patient, pipeline))
    }

    /// Load everything and check step references without executing
    pub fn check(&self) -> Result<PipelineDescription> {
        let (patient, pipeline) = self.load()?;
        let repository = ImageRepository::from_patient(patient);
        check_dependencies(&repository, &pipeline)?;
        Ok(pipeline)
    }

    pub fn run(&self) -> Result<RunResult> {
        let mut writer = ArtifactWriter::new(&self.config.system.output_folder)?;
        if let Some(previews) = &self.previews {
            writer = writer.with_previews(previews)?;
        }

        let (patient, pipeline) = match self.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                let patient = self
                    .config
                    .system
                    .input_folder
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let report = RunReport::load_failed(&patient, &e);
                if let Err(write_error) = writer.write_report(&report) {
                    warn!("Failed to write run report: {:#}", write_error);
                }
                return Err(e);
            }
        };

        let mut executor = PipelineExecutor::new(&self.invoker, &*self.registrar, &self.config.runtime)
            .with_writer(&writer);
        if let Some(flag) = &self.cancel {
            executor = executor.with_cancel_flag(flag.clone());
        }
        Ok(executor.run(patient, &pipeline)?)
    }
}
